use uuid::Uuid;

const BLUETOOTH_BASE_UUID: u128 = 0x00000000_0000_1000_8000_00805f9b34fb;
const BLUETOOTH_BASE_MASK_32: u128 = 0x00000000_ffff_ffff_ffff_ffffffffffff;
const BLUETOOTH_BASE_MASK_16: u128 = 0xffff0000_ffff_ffff_ffff_ffffffffffff;

// const functions so applications can declare const Uuids for the
// characteristics they care about

pub const fn uuid_from_u16(v: u16) -> Uuid {
    Uuid::from_u128(BLUETOOTH_BASE_UUID | ((v as u128) << 96))
}
pub const fn uuid_from_u32(v: u32) -> Uuid {
    Uuid::from_u128(BLUETOOTH_BASE_UUID | ((v as u128) << 96))
}

/// Returns the 16-bit SIG-assigned alias of `uuid`, if it has one.
pub fn uuid_as_u16(uuid: Uuid) -> Option<u16> {
    let value = uuid.as_u128();
    if value & BLUETOOTH_BASE_MASK_16 == BLUETOOTH_BASE_UUID {
        Some((value >> 96) as u16)
    } else {
        None
    }
}

/// Returns the 32-bit SIG-assigned alias of `uuid`, if it has one.
pub fn uuid_as_u32(uuid: Uuid) -> Option<u32> {
    let value = uuid.as_u128();
    if value & BLUETOOTH_BASE_MASK_32 == BLUETOOTH_BASE_UUID {
        Some((value >> 96) as u32)
    } else {
        None
    }
}

#[test]
fn sig_alias_two_way() {
    let uuid = uuid_from_u16(0x2A37);
    assert_eq!(uuid.to_string(), "00002a37-0000-1000-8000-00805f9b34fb");
    assert_eq!(uuid_as_u16(uuid), Some(0x2A37));
    assert_eq!(uuid_as_u32(uuid), Some(0x2A37));

    let uuid = Uuid::parse_str("18c2a267-a539-4423-aecc-edeeb2784bcc").unwrap();
    assert_eq!(uuid_as_u16(uuid), None);
    assert_eq!(uuid_as_u32(uuid), None);
}
