use std::collections::{HashMap, VecDeque};
use std::hash::Hash;
use std::ops::Deref;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex as StdMutex;
use std::sync::{Arc, Weak};

use futures::{Stream, StreamExt};
use log::{debug, error, info, trace, warn};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::capability::{find_characteristic, ServiceInfo, WriteType};
use crate::operation::{self, Operation};
use crate::transport::{CompletionReceiver, ConnectOptions, ConnectionHandle, Transport,
                       TransportEvent};
use crate::{Address, Error, Event, GattError, Result};

/// The serialized command dispatcher.
///
/// A `Session` owns one global FIFO of [`Operation`]s, a single in-flight
/// slot, and the table of live peripheral sessions. Intents may be issued
/// from any number of tasks or threads; the transport's completions arrive
/// on their own channel; all of them funnel through one mutual-exclusion
/// domain so that at most one operation is ever outstanding against the
/// transport.
#[derive(Clone, Debug)]
pub struct Session {
    inner: Arc<SessionInner>,
}
impl PartialEq for Session {
    fn eq(&self, other: &Session) -> bool {
        Arc::<SessionInner>::ptr_eq(&self.inner, &other.inner)
    }
}
impl Eq for Session {}
impl Hash for Session {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        std::ptr::hash(Arc::<SessionInner>::as_ptr(&self.inner), state);
    }
}
impl Deref for Session {
    type Target = SessionInner;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

// public for the sake of implementing Deref for ergonomics but since no
// members are public and there's no public API for SessionInner we don't
// really leak anything
#[derive(Debug)]
pub struct SessionInner {
    // The public-facing event stream
    event_bus: broadcast::Sender<Event>,
    next_flush_index: AtomicU32,

    transport: Arc<dyn Transport>,

    // The queue, the in-flight slot and the session table only ever change
    // inside this one lock; enqueue->maybe-start and
    // completion->start-next are each a single critical section.
    dispatch: StdMutex<DispatchState>,
}

#[derive(Debug, Default)]
struct DispatchState {
    queue: VecDeque<Operation>,
    in_flight: Option<Operation>,
    sessions: HashMap<Address, PeripheralSession>,
}

impl DispatchState {
    fn connect_pending(&self, peripheral: &Address) -> bool {
        let targets = |op: &Operation| {
            matches!(op, Operation::Connect { peripheral: p, .. } if p == peripheral)
        };
        self.in_flight.as_ref().map_or(false, targets) || self.queue.iter().any(targets)
    }

    // Operations other than Connect may target a peripheral that is either
    // sessioned or has a Connect on the way; in the latter case a failed
    // connect disposes of the dependents through the dispatch-time
    // missing-session abort.
    fn reachable(&self, peripheral: &Address) -> bool {
        self.sessions.contains_key(peripheral) || self.connect_pending(peripheral)
    }

    fn declared_characteristics(&self, peripheral: &Address) -> Option<&[ServiceInfo]> {
        self.sessions
            .get(peripheral)
            .and_then(|session| session.capabilities.as_deref())
    }
}

/// One entry in the session table: the live transport handle and, once
/// discovery has completed, the peripheral's capability set.
#[derive(Debug)]
struct PeripheralSession {
    handle: ConnectionHandle,
    capabilities: Option<Vec<ServiceInfo>>,
}

/// Whether a started operation is awaiting an asynchronous completion or
/// already finished within the dispatch critical section.
enum Dispatch {
    Awaiting,
    Done,
}

impl Session {
    // Internally the completion-processing task must not keep the Session
    // alive, so it holds a Weak reference that is upgraded (and re`wrap()`ed)
    // per event.
    fn wrap(inner: Arc<SessionInner>) -> Self {
        Self { inner }
    }

    /// Starts a session over `transport`, consuming the transport's
    /// completions from `completions`.
    ///
    /// Must be called within a tokio runtime; the completion bridge runs as
    /// a spawned task and exits when the `Session` is dropped or the
    /// transport closes its end of the channel.
    pub fn start(transport: Arc<dyn Transport>, completions: CompletionReceiver) -> Session {
        let (event_bus, _) = broadcast::channel(16);

        let session = Session { inner: Arc::new(SessionInner { event_bus,
                                                               next_flush_index:
                                                                   AtomicU32::new(0),
                                                               transport,
                                                               dispatch:
                                                                   StdMutex::new(DispatchState::default()) }) };

        // The spawned task only gets a Weak reference, otherwise dropping
        // the last application reference could never free the session.
        let weak_session = Arc::downgrade(&session.inner);
        tokio::spawn(async move { Session::run_transport_task(weak_session, completions).await });

        session
    }

    /// Queues a connection to `peripheral`.
    ///
    /// Rejected with [`Error::AlreadyConnected`] if a session for the
    /// peripheral already exists. Listen for [`Event::PeripheralConnected`]
    /// or [`Event::PeripheralFailedToConnect`] for the outcome; a
    /// successful connect is followed by capability discovery and an
    /// [`Event::CapabilitiesDiscovered`] notification.
    pub fn connect(&self, peripheral: Address, options: ConnectOptions) -> Result<()> {
        let mut st = self.dispatch.lock().unwrap();
        if st.sessions.contains_key(&peripheral) {
            warn!("Already connected to {}", peripheral);
            return Err(Error::AlreadyConnected(peripheral));
        }
        self.enqueue(&mut st, Operation::Connect { peripheral, options });
        Ok(())
    }

    /// Queues a teardown of `peripheral`'s session.
    ///
    /// Rejected with [`Error::NotConnected`] unless the peripheral is
    /// sessioned or a connect for it is pending.
    pub fn disconnect(&self, peripheral: Address) -> Result<()> {
        let mut st = self.dispatch.lock().unwrap();
        if !st.reachable(&peripheral) {
            warn!("Not connected to {}, cannot tear down connection", peripheral);
            return Err(Error::NotConnected(peripheral));
        }
        self.enqueue(&mut st, Operation::Disconnect { peripheral });
        Ok(())
    }

    /// Queues a write of `value` to `characteristic` on `peripheral`.
    ///
    /// The write type is fixed here, from the characteristic's declared
    /// support: acknowledged if supported, else unacknowledged, else the
    /// intent is rejected with [`Error::WriteNotSupported`] before it ever
    /// enters the queue. If the capability set hasn't been discovered yet
    /// (a connect is still pending) the acknowledged type is assumed.
    pub fn write_characteristic(&self,
                                peripheral: Address,
                                characteristic: Uuid,
                                value: Vec<u8>)
                                -> Result<()> {
        let mut st = self.dispatch.lock().unwrap();
        if !st.reachable(&peripheral) {
            warn!("Not connected to {}", peripheral);
            return Err(Error::NotConnected(peripheral));
        }
        let declared = st.declared_characteristics(&peripheral)
                         .and_then(|services| find_characteristic(services, characteristic));
        let write_type = match declared {
            Some(info) => match info.preferred_write_type() {
                Some(write_type) => write_type,
                None => {
                    warn!("Characteristic {} on {} cannot be written to",
                          characteristic, peripheral);
                    return Err(Error::WriteNotSupported(peripheral, characteristic));
                }
            },
            None => WriteType::WithResponse,
        };
        self.enqueue(&mut st,
                     Operation::WriteCharacteristic { peripheral,
                                                      characteristic,
                                                      write_type,
                                                      value });
        Ok(())
    }

    /// Queues a read of `characteristic` on `peripheral`. The value is
    /// reported via [`Event::CharacteristicRead`].
    pub fn read_characteristic(&self, peripheral: Address, characteristic: Uuid) -> Result<()> {
        let mut st = self.dispatch.lock().unwrap();
        if !st.reachable(&peripheral) {
            warn!("Not connected to {}", peripheral);
            return Err(Error::NotConnected(peripheral));
        }
        self.enqueue(&mut st,
                     Operation::ReadCharacteristic { peripheral,
                                                     characteristic });
        Ok(())
    }

    /// Queues a transmission-unit negotiation for `peripheral`.
    pub fn request_mtu(&self, peripheral: Address, mtu: u16) -> Result<()> {
        let mut st = self.dispatch.lock().unwrap();
        if !st.reachable(&peripheral) {
            warn!("Not connected to {}", peripheral);
            return Err(Error::NotConnected(peripheral));
        }
        self.enqueue(&mut st, Operation::RequestMtu { peripheral, mtu });
        Ok(())
    }

    pub fn is_connected(&self, peripheral: &Address) -> bool {
        let st = self.dispatch.lock().unwrap();
        st.sessions.contains_key(peripheral)
    }

    /// The peripheral's discovered capability set, if the peripheral is
    /// connected and discovery has completed.
    pub fn capabilities(&self, peripheral: &Address) -> Option<Vec<ServiceInfo>> {
        let st = self.dispatch.lock().unwrap();
        st.sessions
          .get(peripheral)
          .and_then(|session| session.capabilities.clone())
    }

    /// Returns a stream of session events: connects, disconnects,
    /// discovered capability sets and operation completions.
    ///
    /// The stream is fed from a bounded broadcast ring; a subscriber that
    /// stops polling for long enough skips over the events it missed.
    pub fn events(&self) -> Result<impl Stream<Item = Event>> {
        let receiver = self.event_bus.subscribe();
        Ok(tokio_stream::wrappers::BroadcastStream::new(receiver).filter_map(|x| async move {
                                                                     if let Ok(x) = x {
                                                                         Some(x)
                                                                     } else {
                                                                         None
                                                                     }
                                                                 }))
    }

    /// Inserts a marker into the completion pipeline and returns its id.
    ///
    /// By the time [`Event::Flush`] with the same id appears on the event
    /// stream, every completion the transport reported before the marker
    /// has been processed.
    pub fn flush(&self) -> Result<u32> {
        let id = self.next_flush_index.fetch_add(1, Ordering::SeqCst);
        self.transport.flush(id)?;
        Ok(id)
    }

    fn enqueue(&self, st: &mut DispatchState, operation: Operation) {
        trace!("Enqueueing {}", operation);
        st.queue.push_back(operation);
        if st.in_flight.is_none() {
            self.pump(st);
        }
    }

    /// Starts queued operations until one is left awaiting an asynchronous
    /// completion or the queue drains.
    fn pump(&self, st: &mut DispatchState) {
        if st.in_flight.is_some() {
            // Not a queue failure; the legitimate completion will pump again.
            error!("Dispatch requested while an operation is still in flight");
            return;
        }
        while let Some(operation) = st.queue.pop_front() {
            st.in_flight = Some(operation.clone());
            match self.start_operation(st, operation) {
                Dispatch::Awaiting => return,
                Dispatch::Done => {
                    st.in_flight = None;
                }
            }
        }
    }

    fn start_operation(&self, st: &mut DispatchState, operation: Operation) -> Dispatch {
        match operation {
            Operation::Connect { peripheral, options } => {
                info!("Connecting to {}", peripheral);
                if let Err(err) = self.transport.request_connect(&peripheral, &options) {
                    warn!("Connect request for {} not accepted by transport: {}",
                          peripheral, err);
                    return Dispatch::Done;
                }
                Dispatch::Awaiting
            }
            Operation::Disconnect { peripheral } => {
                match st.sessions.remove(&peripheral) {
                    Some(session) => {
                        info!("Disconnecting from {}", peripheral);
                        self.transport.release(session.handle);
                        let _ = self.event_bus
                                    .send(Event::PeripheralDisconnected { peripheral });
                    }
                    None => {
                        warn!("Not connected to {}, aborting teardown", peripheral);
                    }
                }
                // No completion to wait for; the slot is held just long
                // enough that queued operations don't reorder around it.
                Dispatch::Done
            }
            Operation::WriteCharacteristic { peripheral,
                                             characteristic,
                                             write_type,
                                             value } => {
                let session = match st.sessions.get(&peripheral) {
                    Some(session) => session,
                    None => {
                        warn!("Not connected to {}, aborting write", peripheral);
                        return Dispatch::Done;
                    }
                };
                // Only a discovered capability set can veto the target; if
                // discovery hasn't completed yet the transport gets to
                // resolve the characteristic itself.
                if let Some(services) = session.capabilities.as_deref() {
                    if find_characteristic(services, characteristic).is_none() {
                        warn!("Cannot find characteristic {} on {} to write to",
                              characteristic, peripheral);
                        return Dispatch::Done;
                    }
                }
                if let Err(err) = self.transport
                                      .submit_write(session.handle,
                                                    characteristic,
                                                    write_type,
                                                    &value)
                {
                    warn!("Write to {} on {} not accepted by transport: {}",
                          characteristic, peripheral, err);
                    return Dispatch::Done;
                }
                Dispatch::Awaiting
            }
            Operation::ReadCharacteristic { peripheral, characteristic } => {
                let session = match st.sessions.get(&peripheral) {
                    Some(session) => session,
                    None => {
                        warn!("Not connected to {}, aborting read", peripheral);
                        return Dispatch::Done;
                    }
                };
                if let Some(services) = session.capabilities.as_deref() {
                    if find_characteristic(services, characteristic).is_none() {
                        warn!("Cannot find characteristic {} on {} to read from",
                              characteristic, peripheral);
                        return Dispatch::Done;
                    }
                }
                if let Err(err) = self.transport.submit_read(session.handle, characteristic) {
                    warn!("Read of {} on {} not accepted by transport: {}",
                          characteristic, peripheral, err);
                    return Dispatch::Done;
                }
                Dispatch::Awaiting
            }
            Operation::RequestMtu { peripheral, mtu } => {
                let session = match st.sessions.get(&peripheral) {
                    Some(session) => session,
                    None => {
                        warn!("Not connected to {}, aborting MTU request", peripheral);
                        return Dispatch::Done;
                    }
                };
                if let Err(err) = self.transport.request_mtu(session.handle, mtu) {
                    warn!("MTU request for {} not accepted by transport: {}",
                          peripheral, err);
                    return Dispatch::Done;
                }
                Dispatch::Awaiting
            }
        }
    }

    fn signal_end_of_operation(&self, st: &mut DispatchState) {
        match st.in_flight.take() {
            Some(operation) => debug!("End of {}", operation),
            None => warn!("Spurious end-of-operation signal with nothing in flight"),
        }
        self.pump(st);
    }

    // Any error that forces disconnection funnels through the same queued
    // Disconnect path as an application-issued teardown, so teardown never
    // reorders around operations already queued.
    fn force_teardown(&self, st: &mut DispatchState, peripheral: &Address) {
        if st.sessions.contains_key(peripheral) {
            st.queue
              .push_back(Operation::Disconnect { peripheral: peripheral.clone() });
            if st.in_flight.is_none() {
                self.pump(st);
            }
        } else {
            trace!("No session to tear down for {}", peripheral);
        }
    }

    fn on_connection_up(&self, peripheral: Address, handle: ConnectionHandle) {
        let mut st = self.dispatch.lock().unwrap();

        let entry = PeripheralSession { handle,
                                        capabilities: None };
        match st.sessions.insert(peripheral.clone(), entry) {
            None => {
                info!("Connected to {}", peripheral);
                let _ = self.event_bus
                            .send(Event::PeripheralConnected { peripheral: peripheral.clone() });
            }
            Some(previous) => {
                warn!("Spurious, redundant connection notification for {} (had handle {:?})",
                      peripheral, previous.handle);
            }
        }

        // Discovery is a side effect of connecting, not a queued operation;
        // it never holds the in-flight slot and its completion is reported
        // through the event bus.
        if let Err(err) = self.transport.discover_capabilities(handle) {
            warn!("Capability discovery for {} not accepted by transport: {}",
                  peripheral, err);
        }

        if matches!(st.in_flight, Some(Operation::Connect { .. })) {
            self.signal_end_of_operation(&mut st);
        }
    }

    fn on_connection_failed(&self, peripheral: Address, error: Option<GattError>) {
        warn!("Failed to connect to {}: {:?}", peripheral, error);
        let mut st = self.dispatch.lock().unwrap();

        let connect_in_flight = matches!(st.in_flight, Some(Operation::Connect { .. }));
        if connect_in_flight {
            let _ = self.event_bus
                        .send(Event::PeripheralFailedToConnect { peripheral:
                                                                     peripheral.clone(),
                                                                 error });
        }
        self.force_teardown(&mut st, &peripheral);
        if connect_in_flight {
            self.signal_end_of_operation(&mut st);
        }
    }

    fn on_connection_down(&self, peripheral: Address, error: Option<GattError>) {
        let mut st = self.dispatch.lock().unwrap();

        match &error {
            None => info!("{} disconnected", peripheral),
            Some(err) => warn!("Connection to {} dropped: {}", peripheral, err),
        }

        // A failure status while a connect is still in flight resolves that
        // connect; a clean peer-initiated disconnect does not.
        if error.is_some() && matches!(st.in_flight, Some(Operation::Connect { .. })) {
            let _ = self.event_bus
                        .send(Event::PeripheralFailedToConnect { peripheral:
                                                                     peripheral.clone(),
                                                                 error });
            self.signal_end_of_operation(&mut st);
        }

        self.force_teardown(&mut st, &peripheral);
    }

    fn on_capabilities_discovered(&self,
                                  peripheral: Address,
                                  services: Vec<ServiceInfo>,
                                  error: Option<GattError>) {
        if let Some(err) = error {
            // Discovery is not a queued operation, so a failure here never
            // affects queue progression.
            warn!("Capability discovery failed for {}: {}", peripheral, err);
            return;
        }

        let mut st = self.dispatch.lock().unwrap();
        match st.sessions.get_mut(&peripheral) {
            Some(session) if session.capabilities.is_none() => {
                debug!("Discovered {} service(s) on {}", services.len(), peripheral);
                session.capabilities = Some(services.clone());
                let _ = self.event_bus
                            .send(Event::CapabilitiesDiscovered { peripheral, services });
            }
            Some(_) => {
                warn!("Spurious, redundant capability discovery for {}", peripheral);
            }
            None => {
                warn!("Capability discovery for {} with no live session", peripheral);
            }
        }
    }

    fn on_write_complete(&self,
                         peripheral: Address,
                         characteristic: Uuid,
                         error: Option<GattError>) {
        let mut st = self.dispatch.lock().unwrap();

        match &error {
            None => {
                if let Some(Operation::WriteCharacteristic { value, .. }) = &st.in_flight {
                    info!("Wrote to characteristic {} on {}, value: {}",
                          characteristic,
                          peripheral,
                          operation::hex(value));
                }
            }
            Some(GattError::WriteNotPermitted) => {
                error!("Write not permitted for {}", characteristic);
            }
            Some(err) => {
                error!("Characteristic write failed for {}: {}", characteristic, err);
            }
        }

        let _ = self.event_bus
                    .send(Event::CharacteristicWritten { peripheral,
                                                         characteristic,
                                                         error });

        if matches!(st.in_flight, Some(Operation::WriteCharacteristic { .. })) {
            self.signal_end_of_operation(&mut st);
        }
    }

    fn on_read_complete(&self,
                        peripheral: Address,
                        characteristic: Uuid,
                        value: Vec<u8>,
                        error: Option<GattError>) {
        let mut st = self.dispatch.lock().unwrap();

        match error {
            None => {
                let _ = self.event_bus
                            .send(Event::CharacteristicRead { peripheral,
                                                              characteristic,
                                                              value });
            }
            Some(err) => {
                error!("Characteristic read failed for {}: {}", characteristic, err);
            }
        }

        if matches!(st.in_flight, Some(Operation::ReadCharacteristic { .. })) {
            self.signal_end_of_operation(&mut st);
        }
    }

    fn on_mtu_complete(&self, peripheral: Address, mtu: u16, error: Option<GattError>) {
        let mut st = self.dispatch.lock().unwrap();

        match error {
            None => {
                debug!("MTU for {} is now {}", peripheral, mtu);
                let _ = self.event_bus.send(Event::MtuChanged { peripheral, mtu });
            }
            Some(err) => {
                error!("MTU negotiation failed for {}: {}", peripheral, err);
            }
        }

        if matches!(st.in_flight, Some(Operation::RequestMtu { .. })) {
            self.signal_end_of_operation(&mut st);
        }
    }

    async fn run_transport_task(weak_session_inner: Weak<SessionInner>,
                                completions: CompletionReceiver) {
        trace!("Starting task to process transport completions...");

        let stream = tokio_stream::wrappers::UnboundedReceiverStream::new(completions);
        tokio::pin!(stream);
        while let Some(event) = stream.next().await {
            // Only hold a strong reference back to the Session while
            // processing a completion, otherwise the task would keep the
            // Session alive forever.
            let session = match weak_session_inner.upgrade() {
                Some(strong_inner) => Session::wrap(strong_inner),
                None => {
                    trace!("Exiting completion processor task since Session has been dropped");
                    break;
                }
            };

            match event {
                TransportEvent::ConnectionUp { peripheral, handle } => {
                    session.on_connection_up(peripheral, handle);
                }
                TransportEvent::ConnectionFailed { peripheral, error } => {
                    session.on_connection_failed(peripheral, error);
                }
                TransportEvent::ConnectionDown { peripheral, error } => {
                    session.on_connection_down(peripheral, error);
                }
                TransportEvent::CapabilitiesDiscovered { peripheral,
                                                         services,
                                                         error, } => {
                    session.on_capabilities_discovered(peripheral, services, error);
                }
                TransportEvent::WriteComplete { peripheral,
                                                characteristic,
                                                error, } => {
                    session.on_write_complete(peripheral, characteristic, error);
                }
                TransportEvent::ReadComplete { peripheral,
                                               characteristic,
                                               value,
                                               error, } => {
                    session.on_read_complete(peripheral, characteristic, value, error);
                }
                TransportEvent::MtuComplete { peripheral, mtu, error } => {
                    session.on_mtu_complete(peripheral, mtu, error);
                }
                TransportEvent::Flush(id) => {
                    trace!("transport flush {} received", id);
                    let _ = session.event_bus.send(Event::Flush(id));
                }
            }
        }

        trace!("Finished task processing transport completions");
    }
}

#[cfg(test)]
mod tests {
    use std::pin::Pin;
    use std::str::FromStr;

    use super::*;
    use crate::capability::{CharacteristicInfo, CharacteristicProperties, ServiceInfo};
    use crate::fake::{FakeTransport, Submission};
    use crate::transport::completion_channel;
    use crate::uuid::uuid_from_u16;

    const LAMP_ADDRESS: &str = "F1:E2:D3:C4:B5:A6";
    const SIGN_ADDRESS: &str = "0A:0B:0C:0D:0E:0F";

    const RGB_CHARACTERISTIC: Uuid = uuid_from_u16(0xFFE1);
    const BATTERY_LEVEL_CHARACTERISTIC: Uuid = uuid_from_u16(0x2A19);
    const MODEL_NUMBER_CHARACTERISTIC: Uuid = uuid_from_u16(0x2A24);

    fn addr(s: &str) -> Address {
        Address::from_str(s).unwrap()
    }

    fn lamp_services() -> Vec<ServiceInfo> {
        vec![ServiceInfo::new(uuid_from_u16(0xFFE0),
                              vec![CharacteristicInfo::new(RGB_CHARACTERISTIC,
                                                           CharacteristicProperties::WRITE
                                                           | CharacteristicProperties::WRITE_WITHOUT_RESPONSE)]),
             ServiceInfo::new(uuid_from_u16(0x180F),
                              vec![CharacteristicInfo::new(BATTERY_LEVEL_CHARACTERISTIC,
                                                           CharacteristicProperties::READ
                                                           | CharacteristicProperties::NOTIFY)]),
             ServiceInfo::new(uuid_from_u16(0x180A),
                              vec![CharacteristicInfo::new(MODEL_NUMBER_CHARACTERISTIC,
                                                           CharacteristicProperties::READ)])]
    }

    fn start() -> (Session, FakeTransport) {
        let (completions_tx, completions_rx) = completion_channel();
        let fake = FakeTransport::new(completions_tx);
        let session = Session::start(Arc::new(fake.clone()), completions_rx);
        (session, fake)
    }

    type Events = Pin<Box<dyn Stream<Item = Event> + Send>>;

    fn subscribe(session: &Session) -> Events {
        Box::pin(session.events().unwrap())
    }

    // Round-trips a flush marker through the completion pipeline, returning
    // every event observed before the marker came back.
    async fn sync(session: &Session, events: &mut Events) -> Vec<Event> {
        let id = session.flush().unwrap();
        let mut seen = Vec::new();
        loop {
            match events.next().await {
                Some(Event::Flush(flushed)) if flushed == id => break,
                Some(event) => seen.push(event),
                None => panic!("event stream closed while waiting for flush {}", id),
            }
        }
        seen
    }

    fn idle(session: &Session) -> bool {
        let st = session.dispatch.lock().unwrap();
        st.in_flight.is_none() && st.queue.is_empty()
    }

    fn queued(session: &Session) -> usize {
        session.dispatch.lock().unwrap().queue.len()
    }

    #[tokio::test]
    async fn session_identity() {
        let (session0, _fake0) = start();
        let (session1, _fake1) = start();
        assert_ne!(session0, session1);
        assert_eq!(session0, session0.clone());
    }

    #[tokio::test]
    async fn rejects_intents_for_unknown_peripherals() {
        let (session, fake) = start();
        let lamp = addr(LAMP_ADDRESS);

        assert!(matches!(session.disconnect(lamp.clone()),
                         Err(Error::NotConnected(_))));
        assert!(matches!(session.write_characteristic(lamp.clone(),
                                                      RGB_CHARACTERISTIC,
                                                      vec![0x16]),
                         Err(Error::NotConnected(_))));
        assert!(matches!(session.read_characteristic(lamp.clone(),
                                                     BATTERY_LEVEL_CHARACTERISTIC),
                         Err(Error::NotConnected(_))));
        assert!(matches!(session.request_mtu(lamp, 247),
                         Err(Error::NotConnected(_))));

        // Nothing may have reached the queue, let alone the transport
        assert!(idle(&session));
        assert!(fake.submissions().is_empty());
    }

    #[tokio::test]
    async fn rejects_connect_when_already_sessioned() {
        let (session, fake) = start();
        let mut events = subscribe(&session);
        let lamp = addr(LAMP_ADDRESS);
        fake.declare_peripheral(&lamp, lamp_services());

        session.connect(lamp.clone(), ConnectOptions::default()).unwrap();
        fake.complete_connect(&lamp);
        sync(&session, &mut events).await;

        assert!(session.is_connected(&lamp));
        assert!(matches!(session.connect(lamp, ConnectOptions::default()),
                         Err(Error::AlreadyConnected(_))));
    }

    #[tokio::test]
    async fn connect_discovery_round_trip_notifies_once() {
        let (session, fake) = start();
        let mut events = subscribe(&session);
        let lamp = addr(LAMP_ADDRESS);
        fake.declare_peripheral(&lamp, lamp_services());

        session.connect(lamp.clone(), ConnectOptions::default()).unwrap();
        fake.complete_connect(&lamp);
        // A transport reporting discovery twice must not notify twice
        fake.complete_discovery(&lamp);
        fake.complete_discovery(&lamp);
        let seen = sync(&session, &mut events).await;

        assert!(session.is_connected(&lamp));
        assert_eq!(session.capabilities(&lamp).unwrap(), lamp_services());

        let discoveries = seen.iter()
                              .filter(|event| {
                                  matches!(event, Event::CapabilitiesDiscovered { peripheral, services }
                                           if *peripheral == lamp && *services == lamp_services())
                              })
                              .count();
        assert_eq!(discoveries, 1);
        assert!(idle(&session));
    }

    #[tokio::test]
    async fn discovery_failure_does_not_stall_the_queue() {
        let (session, fake) = start();
        let mut events = subscribe(&session);
        let lamp = addr(LAMP_ADDRESS);
        fake.declare_peripheral(&lamp, lamp_services());

        session.connect(lamp.clone(), ConnectOptions::default()).unwrap();
        fake.complete_connect(&lamp);
        fake.fail_discovery(&lamp, GattError::Unsupported);
        let seen = sync(&session, &mut events).await;

        // Still connected, just without a capability set; follow-up
        // operations dispatch normally
        assert!(session.is_connected(&lamp));
        assert_eq!(session.capabilities(&lamp), None);
        assert!(!seen.iter()
                     .any(|event| matches!(event, Event::CapabilitiesDiscovered { .. })));

        session.request_mtu(lamp.clone(), 247).unwrap();
        fake.complete_mtu(&lamp, 247);
        sync(&session, &mut events).await;
        assert!(idle(&session));
    }

    #[tokio::test]
    async fn scripted_connect_write_disconnect_runs_in_order() {
        let (session, fake) = start();
        let mut events = subscribe(&session);
        let lamp = addr(LAMP_ADDRESS);
        fake.declare_peripheral(&lamp, lamp_services());

        // All three intents are enqueued before the peripheral is even
        // connected; only the connect may have reached the transport.
        session.connect(lamp.clone(), ConnectOptions::default()).unwrap();
        session.write_characteristic(lamp.clone(),
                                     RGB_CHARACTERISTIC,
                                     vec![0x16, 0xFF, 0x00, 0x00])
               .unwrap();
        session.disconnect(lamp.clone()).unwrap();
        assert_eq!(fake.submissions(),
                   vec![Submission::Connect { peripheral: lamp.clone() }]);

        fake.complete_connect(&lamp);
        let mut seen = sync(&session, &mut events).await;
        fake.complete_discovery(&lamp);
        seen.extend(sync(&session, &mut events).await);
        fake.complete_write(&lamp, RGB_CHARACTERISTIC, None);
        seen.extend(sync(&session, &mut events).await);

        assert_eq!(fake.submissions(),
                   vec![Submission::Connect { peripheral: lamp.clone() },
                        Submission::Discover { peripheral: lamp.clone() },
                        Submission::Write { peripheral: lamp.clone(),
                                            characteristic: RGB_CHARACTERISTIC,
                                            write_type: WriteType::WithResponse,
                                            value: vec![0x16, 0xFF, 0x00, 0x00] },
                        Submission::Release { peripheral: lamp.clone() }]);
        assert!(!session.is_connected(&lamp));
        assert!(idle(&session));

        let interesting: Vec<&Event> =
            seen.iter()
                .filter(|event| {
                    matches!(event,
                             Event::PeripheralConnected { .. }
                             | Event::CapabilitiesDiscovered { .. }
                             | Event::CharacteristicWritten { .. }
                             | Event::PeripheralDisconnected { .. })
                })
                .collect();
        assert!(matches!(interesting[0], Event::PeripheralConnected { .. }));
        assert!(matches!(interesting[1], Event::CapabilitiesDiscovered { .. }));
        assert!(matches!(interesting[2],
                         Event::CharacteristicWritten { error: None, .. }));
        assert!(matches!(interesting[3], Event::PeripheralDisconnected { .. }));
        assert_eq!(interesting.len(), 4);
    }

    #[tokio::test]
    async fn second_connect_waits_for_first_completion() {
        let (session, fake) = start();
        let mut events = subscribe(&session);
        let lamp = addr(LAMP_ADDRESS);
        let sign = addr(SIGN_ADDRESS);
        fake.declare_peripheral(&lamp, lamp_services());
        fake.declare_peripheral(&sign, lamp_services());

        session.connect(lamp.clone(), ConnectOptions::default()).unwrap();
        session.connect(sign.clone(), ConnectOptions::default()).unwrap();
        session.write_characteristic(lamp.clone(),
                                     RGB_CHARACTERISTIC,
                                     vec![0x16, 0x00, 0xFF, 0x00])
               .unwrap();

        // The sign's connect is independent of the lamp's, but the queue is
        // global: nothing else may start until the lamp connect resolves.
        assert_eq!(fake.submissions(),
                   vec![Submission::Connect { peripheral: lamp.clone() }]);

        fake.complete_connect(&lamp);
        fake.complete_discovery(&lamp);
        sync(&session, &mut events).await;
        assert_eq!(fake.submissions(),
                   vec![Submission::Connect { peripheral: lamp.clone() },
                        Submission::Discover { peripheral: lamp.clone() },
                        Submission::Connect { peripheral: sign.clone() }]);

        fake.complete_connect(&sign);
        sync(&session, &mut events).await;
        let submissions = fake.submissions();
        assert_eq!(submissions[3..].to_vec(),
                   vec![Submission::Discover { peripheral: sign.clone() },
                        Submission::Write { peripheral: lamp.clone(),
                                            characteristic: RGB_CHARACTERISTIC,
                                            write_type: WriteType::WithResponse,
                                            value: vec![0x16, 0x00, 0xFF, 0x00] }]);

        fake.complete_write(&lamp, RGB_CHARACTERISTIC, None);
        sync(&session, &mut events).await;
        assert!(idle(&session));
    }

    #[tokio::test]
    async fn unknown_characteristic_aborts_and_queue_advances() {
        let (session, fake) = start();
        let mut events = subscribe(&session);
        let lamp = addr(LAMP_ADDRESS);
        fake.declare_peripheral(&lamp, lamp_services());

        session.connect(lamp.clone(), ConnectOptions::default()).unwrap();
        fake.complete_connect(&lamp);
        fake.complete_discovery(&lamp);
        sync(&session, &mut events).await;

        // Hold the slot with an MTU request, then queue a write against a
        // characteristic the peripheral does not have, then a valid write.
        let missing = uuid_from_u16(0x2A00);
        session.request_mtu(lamp.clone(), 247).unwrap();
        session.write_characteristic(lamp.clone(), missing, vec![0x01]).unwrap();
        session.write_characteristic(lamp.clone(),
                                     RGB_CHARACTERISTIC,
                                     vec![0x16, 0x00, 0x00, 0xFF])
               .unwrap();
        assert_eq!(queued(&session), 2);

        fake.complete_mtu(&lamp, 247);
        sync(&session, &mut events).await;

        // The doomed write never reached the transport and did not stall
        // the valid one behind it
        let submissions = fake.submissions();
        assert!(!submissions.iter().any(|submission| {
            matches!(submission, Submission::Write { characteristic, .. } if *characteristic == missing)
        }));
        assert!(matches!(submissions.last().unwrap(),
                         Submission::Write { characteristic, .. } if *characteristic == RGB_CHARACTERISTIC));

        fake.complete_write(&lamp, RGB_CHARACTERISTIC, None);
        sync(&session, &mut events).await;
        assert!(idle(&session));
    }

    #[tokio::test]
    async fn unwritable_characteristic_rejected_before_queueing() {
        let (session, fake) = start();
        let mut events = subscribe(&session);
        let lamp = addr(LAMP_ADDRESS);
        fake.declare_peripheral(&lamp, lamp_services());

        session.connect(lamp.clone(), ConnectOptions::default()).unwrap();
        fake.complete_connect(&lamp);
        fake.complete_discovery(&lamp);
        sync(&session, &mut events).await;

        // Battery level declares READ|NOTIFY only
        assert!(matches!(session.write_characteristic(lamp.clone(),
                                                      BATTERY_LEVEL_CHARACTERISTIC,
                                                      vec![0x00]),
                         Err(Error::WriteNotSupported(_, _))));
        assert!(idle(&session));
    }

    #[tokio::test]
    async fn unacknowledged_write_type_resolved_from_properties() {
        let (session, fake) = start();
        let mut events = subscribe(&session);
        let sign = addr(SIGN_ADDRESS);
        let scratch = uuid_from_u16(0xFFF3);
        fake.declare_peripheral(&sign,
                                vec![ServiceInfo::new(uuid_from_u16(0xFFF0),
                                                      vec![CharacteristicInfo::new(scratch,
                                                                                   CharacteristicProperties::WRITE_WITHOUT_RESPONSE)])]);

        session.connect(sign.clone(), ConnectOptions::default()).unwrap();
        fake.complete_connect(&sign);
        fake.complete_discovery(&sign);
        sync(&session, &mut events).await;

        session.write_characteristic(sign.clone(), scratch, vec![0xAA]).unwrap();
        assert!(matches!(fake.submissions().last().unwrap(),
                         Submission::Write { write_type: WriteType::WithoutResponse, .. }));

        fake.complete_write(&sign, scratch, None);
        sync(&session, &mut events).await;
        assert!(idle(&session));
    }

    #[tokio::test]
    async fn failed_connect_releases_slot_and_next_starts() {
        let (session, fake) = start();
        let mut events = subscribe(&session);
        let lamp = addr(LAMP_ADDRESS);
        let sign = addr(SIGN_ADDRESS);
        fake.declare_peripheral(&lamp, lamp_services());
        fake.declare_peripheral(&sign, lamp_services());

        session.connect(lamp.clone(), ConnectOptions::default()).unwrap();
        session.connect(sign.clone(), ConnectOptions::default()).unwrap();

        fake.fail_connect(&lamp, GattError::GeneralFailure("out of range".to_string()));
        let seen = sync(&session, &mut events).await;

        assert!(seen.iter().any(|event| {
            matches!(event, Event::PeripheralFailedToConnect { peripheral, .. } if *peripheral == lamp)
        }));
        assert!(!session.is_connected(&lamp));
        // The failure is local to the lamp; the sign's connect started
        assert!(matches!(fake.submissions().last().unwrap(),
                         Submission::Connect { peripheral } if *peripheral == sign));

        fake.complete_connect(&sign);
        sync(&session, &mut events).await;
        assert!(session.is_connected(&sign));
    }

    #[tokio::test]
    async fn write_failure_reports_and_advances() {
        let (session, fake) = start();
        let mut events = subscribe(&session);
        let lamp = addr(LAMP_ADDRESS);
        fake.declare_peripheral(&lamp, lamp_services());

        session.connect(lamp.clone(), ConnectOptions::default()).unwrap();
        fake.complete_connect(&lamp);
        fake.complete_discovery(&lamp);
        sync(&session, &mut events).await;

        session.write_characteristic(lamp.clone(),
                                     RGB_CHARACTERISTIC,
                                     vec![0x16, 0xFF, 0xFF, 0xFF])
               .unwrap();
        session.request_mtu(lamp.clone(), 185).unwrap();

        fake.complete_write(&lamp, RGB_CHARACTERISTIC, Some(GattError::WriteNotPermitted));
        let seen = sync(&session, &mut events).await;

        assert!(seen.iter().any(|event| {
            matches!(event,
                     Event::CharacteristicWritten { error: Some(GattError::WriteNotPermitted), .. })
        }));
        // The failed write released the slot; the MTU request is in flight
        assert!(matches!(fake.submissions().last().unwrap(), Submission::Mtu { mtu: 185, .. }));

        fake.complete_mtu(&lamp, 185);
        sync(&session, &mut events).await;
        assert!(idle(&session));
    }

    #[tokio::test]
    async fn peer_disconnect_tears_down_session() {
        let (session, fake) = start();
        let mut events = subscribe(&session);
        let lamp = addr(LAMP_ADDRESS);
        fake.declare_peripheral(&lamp, lamp_services());

        session.connect(lamp.clone(), ConnectOptions::default()).unwrap();
        fake.complete_connect(&lamp);
        fake.complete_discovery(&lamp);
        sync(&session, &mut events).await;
        assert!(session.is_connected(&lamp));

        fake.drop_connection(&lamp, None);
        let seen = sync(&session, &mut events).await;

        assert!(seen.iter().any(|event| {
            matches!(event, Event::PeripheralDisconnected { peripheral } if *peripheral == lamp)
        }));
        assert!(!session.is_connected(&lamp));
        assert!(matches!(fake.submissions().last().unwrap(),
                         Submission::Release { peripheral } if *peripheral == lamp));
        assert!(idle(&session));
    }

    #[tokio::test]
    async fn read_and_mtu_completions_flow_through() {
        let (session, fake) = start();
        let mut events = subscribe(&session);
        let lamp = addr(LAMP_ADDRESS);
        fake.declare_peripheral(&lamp, lamp_services());

        session.connect(lamp.clone(), ConnectOptions::default()).unwrap();
        fake.complete_connect(&lamp);
        fake.complete_discovery(&lamp);
        sync(&session, &mut events).await;

        session.request_mtu(lamp.clone(), 247).unwrap();
        fake.complete_mtu(&lamp, 247);
        let seen = sync(&session, &mut events).await;
        assert!(seen.iter()
                    .any(|event| matches!(event, Event::MtuChanged { mtu: 247, .. })));

        session.read_characteristic(lamp.clone(), BATTERY_LEVEL_CHARACTERISTIC)
               .unwrap();
        fake.complete_read(&lamp, BATTERY_LEVEL_CHARACTERISTIC, vec![0x64]);
        let seen = sync(&session, &mut events).await;
        assert!(seen.iter().any(|event| {
            matches!(event, Event::CharacteristicRead { value, .. } if value == &vec![0x64])
        }));
        assert!(idle(&session));
    }

    #[tokio::test]
    async fn pump_is_a_noop_while_an_operation_is_in_flight() {
        let (session, fake) = start();
        let lamp = addr(LAMP_ADDRESS);

        {
            let mut st = session.dispatch.lock().unwrap();
            st.in_flight = Some(Operation::Connect { peripheral: lamp.clone(),
                                                     options: ConnectOptions::default() });
            st.queue.push_back(Operation::Disconnect { peripheral: lamp });
            session.pump(&mut st);
            assert_eq!(st.queue.len(), 1);
            assert!(st.in_flight.is_some());
        }
        assert!(fake.submissions().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_producers_never_overlap_operations() {
        let (session, fake) = start();
        let mut events = subscribe(&session);
        let lamp = addr(LAMP_ADDRESS);
        fake.declare_peripheral(&lamp, lamp_services());
        fake.auto_complete_writes(true);

        session.connect(lamp.clone(), ConnectOptions::default()).unwrap();
        fake.complete_connect(&lamp);
        fake.complete_discovery(&lamp);
        sync(&session, &mut events).await;

        let mut producers = Vec::new();
        for task in 0..8u8 {
            let session = session.clone();
            let lamp = lamp.clone();
            producers.push(tokio::spawn(async move {
                for i in 0..25u8 {
                    session.write_characteristic(lamp.clone(),
                                                 RGB_CHARACTERISTIC,
                                                 vec![0x16, task, i, 0x00])
                           .unwrap();
                }
            }));
        }
        for producer in producers {
            producer.await.unwrap();
        }

        // Everything is enqueued; every write auto-completes, so the
        // dispatcher drains to idle on its own
        while !idle(&session) {
            tokio::task::yield_now().await;
        }

        assert!(!fake.saw_overlapping_requests());
        let writes = fake.submissions()
                         .iter()
                         .filter(|submission| matches!(submission, Submission::Write { .. }))
                         .count();
        assert_eq!(writes, 200);
    }
}
