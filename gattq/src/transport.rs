use tokio::sync::mpsc;
use uuid::Uuid;

use crate::capability::{ServiceInfo, WriteType};
use crate::{Address, GattError, Result};

/// A transport-issued token for one live connection.
///
/// Handles are minted by the transport when it reports `ConnectionUp` and
/// stay valid until the session releases them. The session table is the
/// only place a handle is held between operations; no other component may
/// retain one.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ConnectionHandle(pub u32);

/// Connection context supplied with a connect intent and passed through to
/// the transport untouched.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ConnectOptions {
    /// Ask the transport to keep trying in the background rather than
    /// failing the connect on the first miss. Not every transport honours
    /// this.
    pub auto_reconnect: bool,
}

/// Asynchronous completions reported by a transport.
///
/// Every event carries the peripheral identity and, where the request can
/// fail, a status in `error` (`None` is success). Events arrive on the
/// completion channel in the order the transport resolved them, which is
/// not necessarily the order requests were submitted across peripherals.
#[derive(Clone, Debug)]
pub enum TransportEvent {
    ConnectionUp {
        peripheral: Address,
        handle: ConnectionHandle,
    },
    /// The connection ended after having been established, including a
    /// disconnect the peer initiated.
    ConnectionDown {
        peripheral: Address,
        error: Option<GattError>,
    },
    /// A requested connection could not be established at all.
    ConnectionFailed {
        peripheral: Address,
        error: Option<GattError>,
    },
    CapabilitiesDiscovered {
        peripheral: Address,
        services: Vec<ServiceInfo>,
        error: Option<GattError>,
    },
    WriteComplete {
        peripheral: Address,
        characteristic: Uuid,
        error: Option<GattError>,
    },
    ReadComplete {
        peripheral: Address,
        characteristic: Uuid,
        value: Vec<u8>,
        error: Option<GattError>,
    },
    MtuComplete {
        peripheral: Address,
        mtu: u16,
        error: Option<GattError>,
    },
    Flush(u32),
}

pub type CompletionSender = mpsc::UnboundedSender<TransportEvent>;
pub type CompletionReceiver = mpsc::UnboundedReceiver<TransportEvent>;

/// Creates the channel a transport reports completions on. The sender end
/// is handed to the transport at construction; the receiver end is given to
/// [`crate::session::Session::start`].
pub fn completion_channel() -> (CompletionSender, CompletionReceiver) {
    mpsc::unbounded_channel()
}

/// The boundary to the radio stack.
///
/// Every method is a non-blocking submission: an `Ok(())` means the request
/// was accepted, not that it succeeded. The outcome arrives later as a
/// [`TransportEvent`] on the completion channel. An `Err` means the request
/// was never issued and no completion will follow for it.
pub trait Transport: Send + Sync + std::fmt::Debug {
    /// Requests a connection. Resolves asynchronously to either
    /// `ConnectionUp` or `ConnectionFailed`.
    fn request_connect(&self, peripheral: &Address, options: &ConnectOptions) -> Result<()>;

    /// Releases a connection's resources. Synchronous; no completion
    /// follows.
    fn release(&self, handle: ConnectionHandle);

    /// Requests discovery of the connected peripheral's capability set.
    /// Resolves asynchronously to `CapabilitiesDiscovered`.
    fn discover_capabilities(&self, handle: ConnectionHandle) -> Result<()>;

    /// Submits a characteristic write. Resolves asynchronously to
    /// `WriteComplete`, whatever the outcome.
    fn submit_write(&self,
                    handle: ConnectionHandle,
                    characteristic: Uuid,
                    write_type: WriteType,
                    value: &[u8])
                    -> Result<()>;

    /// Submits a characteristic read. Resolves asynchronously to
    /// `ReadComplete`.
    fn submit_read(&self, handle: ConnectionHandle, characteristic: Uuid) -> Result<()>;

    /// Requests a transmission-unit negotiation. Resolves asynchronously to
    /// `MtuComplete`.
    fn request_mtu(&self, handle: ConnectionHandle, mtu: u16) -> Result<()>;

    /// Inserts a marker into the completion stream. `TransportEvent::Flush`
    /// with the same id must be emitted after every completion the
    /// transport reported before this call.
    fn flush(&self, id: u32) -> Result<()>;
}
