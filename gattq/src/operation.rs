use std::fmt;

use uuid::Uuid;

use crate::capability::WriteType;
use crate::transport::ConnectOptions;
use crate::Address;

/// A single intended action against one peripheral, queued for serialized
/// execution.
///
/// The variant set is closed by the protocol: the dispatcher handles every
/// variant exhaustively and callers cannot extend it. Everything an
/// operation needs is fixed at enqueue time; in particular a write's type
/// and value never change after the operation enters the queue.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Operation {
    Connect {
        peripheral: Address,
        options: ConnectOptions,
    },
    Disconnect {
        peripheral: Address,
    },
    WriteCharacteristic {
        peripheral: Address,
        characteristic: Uuid,
        write_type: WriteType,
        value: Vec<u8>,
    },
    ReadCharacteristic {
        peripheral: Address,
        characteristic: Uuid,
    },
    RequestMtu {
        peripheral: Address,
        mtu: u16,
    },
}

impl Operation {
    /// The peripheral this operation targets. Every variant carries one.
    pub fn peripheral(&self) -> &Address {
        match self {
            Operation::Connect { peripheral, .. } => peripheral,
            Operation::Disconnect { peripheral } => peripheral,
            Operation::WriteCharacteristic { peripheral, .. } => peripheral,
            Operation::ReadCharacteristic { peripheral, .. } => peripheral,
            Operation::RequestMtu { peripheral, .. } => peripheral,
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::Connect { peripheral, .. } => {
                write!(f, "Connect({})", peripheral)
            }
            Operation::Disconnect { peripheral } => {
                write!(f, "Disconnect({})", peripheral)
            }
            Operation::WriteCharacteristic { peripheral,
                                             characteristic,
                                             value,
                                             .. } => {
                write!(f, "Write({}, {}, {})", peripheral, characteristic, hex(value))
            }
            Operation::ReadCharacteristic { peripheral, characteristic } => {
                write!(f, "Read({}, {})", peripheral, characteristic)
            }
            Operation::RequestMtu { peripheral, mtu } => {
                write!(f, "RequestMtu({}, {})", peripheral, mtu)
            }
        }
    }
}

pub(crate) fn hex(data: &[u8]) -> String {
    use std::fmt::Write as _;

    let mut out = String::with_capacity(2 + data.len() * 3);
    out.push_str("0x");
    for (i, byte) in data.iter().enumerate() {
        if i > 0 {
            out.push(' ');
        }
        let _ = write!(out, "{:02x}", byte);
    }
    out
}
