use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;

use dashmap::DashMap;
use log::trace;
use uuid::Uuid;

use crate::capability::{ServiceInfo, WriteType};
use crate::transport::{CompletionSender, ConnectOptions, ConnectionHandle, Transport,
                       TransportEvent};
use crate::{Address, Error, GattError, Result};

/// A scripted transport with no radio behind it.
///
/// Peripherals are declared up front with the service set a real device
/// would advertise. Requests are recorded in submission order and nothing
/// completes until the test (or demo) fires the matching `complete_*` /
/// `fail_*` trigger, so callers control exactly when each asynchronous
/// outcome lands. Writes can optionally complete themselves for stress
/// scenarios.
///
/// The fake also watches the one-outstanding-request rule from the
/// transport's side of the boundary: a second awaited submission arriving
/// while one is outstanding is recorded and reported by
/// [`FakeTransport::saw_overlapping_requests`].
#[derive(Clone, Debug)]
pub struct FakeTransport {
    inner: Arc<FakeTransportInner>,
}

#[derive(Debug)]
struct FakeTransportInner {
    completions: CompletionSender,
    next_handle: AtomicU32,
    auto_complete_writes: AtomicBool,
    overlap_seen: AtomicBool,
    peripherals: DashMap<Address, Vec<ServiceInfo>>,
    connections: DashMap<ConnectionHandle, Address>,
    submissions: StdMutex<Vec<Submission>>,
    awaiting: StdMutex<Option<Submission>>,
}

/// One recorded transport request, in the shape the dispatcher issued it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Submission {
    Connect {
        peripheral: Address,
    },
    Release {
        peripheral: Address,
    },
    Discover {
        peripheral: Address,
    },
    Write {
        peripheral: Address,
        characteristic: Uuid,
        write_type: WriteType,
        value: Vec<u8>,
    },
    Read {
        peripheral: Address,
        characteristic: Uuid,
    },
    Mtu {
        peripheral: Address,
        mtu: u16,
    },
}

impl FakeTransport {
    pub fn new(completions: CompletionSender) -> Self {
        Self { inner: Arc::new(FakeTransportInner { completions,
                                                    next_handle: AtomicU32::new(0),
                                                    auto_complete_writes:
                                                        AtomicBool::new(false),
                                                    overlap_seen: AtomicBool::new(false),
                                                    peripherals: DashMap::new(),
                                                    connections: DashMap::new(),
                                                    submissions:
                                                        StdMutex::new(Vec::new()),
                                                    awaiting: StdMutex::new(None) }) }
    }

    /// Declares a peripheral and the service set a successful discovery
    /// will report for it.
    pub fn declare_peripheral(&self, address: &Address, services: Vec<ServiceInfo>) {
        self.inner.peripherals.insert(address.clone(), services);
    }

    /// When enabled, every submitted write immediately completes
    /// successfully.
    pub fn auto_complete_writes(&self, enabled: bool) {
        self.inner
            .auto_complete_writes
            .store(enabled, Ordering::SeqCst);
    }

    /// Every request recorded so far, in submission order.
    pub fn submissions(&self) -> Vec<Submission> {
        self.inner.submissions.lock().unwrap().clone()
    }

    /// Whether an awaited request was ever submitted while another was
    /// still outstanding.
    pub fn saw_overlapping_requests(&self) -> bool {
        self.inner.overlap_seen.load(Ordering::SeqCst)
    }

    /// Resolves an outstanding connect successfully and returns the minted
    /// handle.
    pub fn complete_connect(&self, peripheral: &Address) -> ConnectionHandle {
        let handle = ConnectionHandle(self.inner.next_handle.fetch_add(1, Ordering::SeqCst) + 1);
        self.inner.connections.insert(handle, peripheral.clone());
        self.end_await();
        self.emit(TransportEvent::ConnectionUp { peripheral: peripheral.clone(),
                                                 handle });
        handle
    }

    pub fn fail_connect(&self, peripheral: &Address, error: GattError) {
        self.end_await();
        self.emit(TransportEvent::ConnectionFailed { peripheral: peripheral.clone(),
                                                     error: Some(error) });
    }

    /// Reports an established connection as gone, the way a peer-initiated
    /// disconnect or a link loss would arrive.
    pub fn drop_connection(&self, peripheral: &Address, error: Option<GattError>) {
        self.emit(TransportEvent::ConnectionDown { peripheral: peripheral.clone(),
                                                   error });
    }

    /// Resolves capability discovery with the declared service set.
    pub fn complete_discovery(&self, peripheral: &Address) {
        let services = self.inner
                           .peripherals
                           .get(peripheral)
                           .map(|entry| entry.value().clone())
                           .unwrap_or_default();
        self.emit(TransportEvent::CapabilitiesDiscovered { peripheral:
                                                               peripheral.clone(),
                                                           services,
                                                           error: None });
    }

    pub fn fail_discovery(&self, peripheral: &Address, error: GattError) {
        self.emit(TransportEvent::CapabilitiesDiscovered { peripheral:
                                                               peripheral.clone(),
                                                           services: vec![],
                                                           error: Some(error) });
    }

    pub fn complete_write(&self,
                          peripheral: &Address,
                          characteristic: Uuid,
                          error: Option<GattError>) {
        self.end_await();
        self.emit(TransportEvent::WriteComplete { peripheral: peripheral.clone(),
                                                  characteristic,
                                                  error });
    }

    pub fn complete_read(&self, peripheral: &Address, characteristic: Uuid, value: Vec<u8>) {
        self.end_await();
        self.emit(TransportEvent::ReadComplete { peripheral: peripheral.clone(),
                                                 characteristic,
                                                 value,
                                                 error: None });
    }

    pub fn complete_mtu(&self, peripheral: &Address, mtu: u16) {
        self.end_await();
        self.emit(TransportEvent::MtuComplete { peripheral: peripheral.clone(),
                                                mtu,
                                                error: None });
    }

    fn emit(&self, event: TransportEvent) {
        // The session may already be gone; completions for a dropped
        // session are discarded.
        let _ = self.inner.completions.send(event);
    }

    fn record(&self, submission: Submission) {
        trace!("fake transport: {:?}", submission);
        self.inner.submissions.lock().unwrap().push(submission);
    }

    fn begin_await(&self, submission: &Submission) {
        let mut awaiting = self.inner.awaiting.lock().unwrap();
        if let Some(outstanding) = awaiting.as_ref() {
            log::error!("fake transport: {:?} submitted while {:?} is still outstanding",
                        submission, outstanding);
            self.inner.overlap_seen.store(true, Ordering::SeqCst);
        }
        *awaiting = Some(submission.clone());
    }

    fn end_await(&self) {
        *self.inner.awaiting.lock().unwrap() = None;
    }

    fn peripheral_for(&self, handle: ConnectionHandle) -> Result<Address> {
        self.inner
            .connections
            .get(&handle)
            .map(|entry| entry.value().clone())
            .ok_or(Error::InvalidStateReference)
    }
}

impl Transport for FakeTransport {
    fn request_connect(&self, peripheral: &Address, _options: &ConnectOptions) -> Result<()> {
        let submission = Submission::Connect { peripheral: peripheral.clone() };
        self.begin_await(&submission);
        self.record(submission);
        Ok(())
    }

    fn release(&self, handle: ConnectionHandle) {
        if let Some((_, peripheral)) = self.inner.connections.remove(&handle) {
            self.record(Submission::Release { peripheral });
        }
    }

    fn discover_capabilities(&self, handle: ConnectionHandle) -> Result<()> {
        let peripheral = self.peripheral_for(handle)?;
        self.record(Submission::Discover { peripheral });
        Ok(())
    }

    fn submit_write(&self,
                    handle: ConnectionHandle,
                    characteristic: Uuid,
                    write_type: WriteType,
                    value: &[u8])
                    -> Result<()> {
        let peripheral = self.peripheral_for(handle)?;
        let submission = Submission::Write { peripheral: peripheral.clone(),
                                             characteristic,
                                             write_type,
                                             value: value.to_vec() };
        self.begin_await(&submission);
        self.record(submission);
        if self.inner.auto_complete_writes.load(Ordering::SeqCst) {
            self.complete_write(&peripheral, characteristic, None);
        }
        Ok(())
    }

    fn submit_read(&self, handle: ConnectionHandle, characteristic: Uuid) -> Result<()> {
        let peripheral = self.peripheral_for(handle)?;
        let submission = Submission::Read { peripheral,
                                            characteristic };
        self.begin_await(&submission);
        self.record(submission);
        Ok(())
    }

    fn request_mtu(&self, handle: ConnectionHandle, mtu: u16) -> Result<()> {
        let peripheral = self.peripheral_for(handle)?;
        let submission = Submission::Mtu { peripheral, mtu };
        self.begin_await(&submission);
        self.record(submission);
        Ok(())
    }

    fn flush(&self, id: u32) -> Result<()> {
        self.emit(TransportEvent::Flush(id));
        Ok(())
    }
}
