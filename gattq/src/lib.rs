//! A serialized operation queue for GATT-style peripherals.
//!
//! The control transport of a GATT peripheral only supports a single
//! outstanding request per connection. [`session::Session`] enforces that
//! rule for any number of peripherals: application intents are queued as
//! [`operation::Operation`]s in one global FIFO, at most one operation is
//! ever in flight, and asynchronous completions from the
//! [`transport::Transport`] drive the queue forward.

use std::fmt;
use std::str::FromStr;

use arrayvec::ArrayVec;
use serde::{Deserialize, Serialize};

pub mod uuid;

pub mod capability;

pub mod operation;

pub mod transport;

pub mod session;

pub mod fake;

use capability::ServiceInfo;
use ::uuid::Uuid;

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct Mac(u64);
impl fmt::Display for Mac {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let bytes = u64::to_le_bytes(self.0);
        write!(f,
               "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
               bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5])
    }
}

/// The stable identity of a peripheral.
///
/// The underlying hardware MAC address is exposed directly where the
/// transport knows it; transports that only hand out opaque device
/// identifiers use the `String` form.
///
/// An address can be serialized/deserialized so applications can save the
/// address of a known peripheral and later reconnect to the same device
/// without re-scanning.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Address {
    Mac(Mac),
    String(String),
}
impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Address::Mac(mac) => {
                write!(f, "{}", mac)
            }
            Address::String(s) => {
                write!(f, "{}", s)
            }
        }
    }
}
impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Address::Mac(mac) => {
                write!(f, "MAC:{}", mac)
            }
            Address::String(s) => {
                write!(f, "String:{}", s)
            }
        }
    }
}

// Allocation free on the non-MAC path since any valid address string that
// isn't a MAC is still a valid opaque identifier.
fn mac48_from_str(s: &str) -> Option<u64> {
    if !s.contains(':') {
        return None;
    }
    let mut octets = ArrayVec::<u8, 6>::new();
    for part in s.split(':') {
        let octet = u8::from_str_radix(part, 16).ok()?;
        octets.try_push(octet).ok()?;
    }
    if octets.len() != 6 {
        return None;
    }
    let mut bytes = [0u8; 8];
    bytes[..6].copy_from_slice(&octets);
    Some(u64::from_le_bytes(bytes))
}

impl FromStr for Address {
    type Err = std::convert::Infallible;
    fn from_str(s: &str) -> std::result::Result<Self, std::convert::Infallible> {
        match mac48_from_str(s) {
            Some(val) => Ok(Address::Mac(Mac(val))),
            None => Ok(Address::String(s.to_string())),
        }
    }
}

#[test]
fn address_two_way() {
    let addr = Address::from_str("F1:E2:D3:C4:B5:A6").unwrap();
    assert!(matches!(addr, Address::Mac(_)));
    let str = addr.to_string();
    // Octets are formatted uppercase; some transports treat address
    // strings as case sensitive so the round trip must be exact.
    assert_eq!(str, "F1:E2:D3:C4:B5:A6");

    let addr = Address::from_str("18c2a267-a539-4423-aecc-edeeb2784bcc").unwrap();
    assert!(matches!(addr, Address::String(_)));
    let str = addr.to_string();
    assert_eq!(str, "18c2a267-a539-4423-aecc-edeeb2784bcc");
}

#[test]
fn address_rejects_short_and_long_macs() {
    assert!(matches!(Address::from_str("F1:E2:D3").unwrap(),
                     Address::String(_)));
    assert!(matches!(Address::from_str("F1:E2:D3:C4:B5:A6:99").unwrap(),
                     Address::String(_)));
}

/// GATT-level status categories reported by a transport for a request that
/// reached the peripheral but did not succeed.
#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum GattError {
    #[error("Insufficient Authentication")]
    InsufficientAuthentication,

    #[error("Insufficient Authorization")]
    InsufficientAuthorization,

    #[error("Read Not Permitted")]
    ReadNotPermitted,

    #[error("Write Not Permitted")]
    WriteNotPermitted,

    #[error("Unsupported request")]
    Unsupported,

    #[error("Congested")]
    Congested,

    #[error("General Failure")]
    GeneralFailure(String),
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The peripheral has no active session (and no connect on the way).
    #[error("Not connected to {0}")]
    NotConnected(Address),

    /// A connect was issued for a peripheral that is already sessioned.
    #[error("Already connected to {0}")]
    AlreadyConnected(Address),

    /// The target characteristic declares support for neither acknowledged
    /// nor unacknowledged writes.
    #[error("Characteristic {1} on {0} cannot be written to")]
    WriteNotSupported(Address, Uuid),

    #[error("There was a GATT communication protocol error")]
    GattProtocolError(#[from] GattError),

    #[error("Invalid State Reference")]
    InvalidStateReference,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Notifications delivered to subscribers of [`session::Session::events`].
#[non_exhaustive]
#[derive(Clone, Debug)]
pub enum Event {
    PeripheralConnected {
        peripheral: Address,
    },

    PeripheralFailedToConnect {
        peripheral: Address,
        error: Option<GattError>,
    },

    /// The peripheral's session has been torn down, either because the
    /// application asked for it or because the peer/transport dropped the
    /// connection.
    PeripheralDisconnected {
        peripheral: Address,
    },

    /// The peripheral's capability set has been discovered.
    ///
    /// Sent at most once per successful connect, immediately after
    /// discovery completes. The session does not track which capability the
    /// application cares about; subscribers extract and cache the
    /// identifiers they need from the raw discovered set.
    CapabilitiesDiscovered {
        peripheral: Address,
        services: Vec<ServiceInfo>,
    },

    CharacteristicWritten {
        peripheral: Address,
        characteristic: Uuid,
        error: Option<GattError>,
    },

    CharacteristicRead {
        peripheral: Address,
        characteristic: Uuid,
        value: Vec<u8>,
    },

    MtuChanged {
        peripheral: Address,
        mtu: u16,
    },

    Flush(u32),
}
