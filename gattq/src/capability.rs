use bitflags::bitflags;
use uuid::Uuid;

// The capability model is a snapshot, not a live handle: a peripheral's
// discovered services and characteristics are reported once per connect and
// become invalid when the session is torn down.

bitflags! {
    /// Operations a characteristic declares support for.
    pub struct CharacteristicProperties: u32 {
        const NONE = 0;

        const BROADCAST = 0x01;
        const READ = 0x02;
        const WRITE_WITHOUT_RESPONSE = 0x04;
        const WRITE = 0x08;
        const NOTIFY = 0x10;
        const INDICATE = 0x20;
        const AUTHENTICATED_SIGNED_WRITES = 0x40;
        const EXTENDED_PROPERTIES = 0x80;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteType {
    /// Acknowledged write; the peripheral confirms completion.
    WithResponse,
    /// Unacknowledged write; completion only confirms submission.
    WithoutResponse,
}

/// An addressable data endpoint on a peripheral.
///
/// NB: a Uuid is not guaranteed to be a unique key on a device; peripherals
/// may expose the same characteristic uuid more than once. Lookups here
/// return the first match, in discovered order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CharacteristicInfo {
    pub uuid: Uuid,
    pub properties: CharacteristicProperties,
}

impl CharacteristicInfo {
    pub fn new(uuid: Uuid, properties: CharacteristicProperties) -> Self {
        Self { uuid, properties }
    }

    pub fn is_readable(&self) -> bool {
        self.properties.contains(CharacteristicProperties::READ)
    }

    pub fn is_writable(&self) -> bool {
        self.properties.contains(CharacteristicProperties::WRITE)
    }

    pub fn is_writable_without_response(&self) -> bool {
        self.properties
            .contains(CharacteristicProperties::WRITE_WITHOUT_RESPONSE)
    }

    /// The write type implied by the declared properties: acknowledged
    /// writes are preferred over unacknowledged ones, `None` if the
    /// characteristic cannot be written to at all.
    pub fn preferred_write_type(&self) -> Option<WriteType> {
        if self.is_writable() {
            Some(WriteType::WithResponse)
        } else if self.is_writable_without_response() {
            Some(WriteType::WithoutResponse)
        } else {
            None
        }
    }
}

/// A discovered service and the characteristics it groups.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServiceInfo {
    pub uuid: Uuid,
    pub characteristics: Vec<CharacteristicInfo>,
}

impl ServiceInfo {
    pub fn new(uuid: Uuid, characteristics: Vec<CharacteristicInfo>) -> Self {
        Self {
            uuid,
            characteristics,
        }
    }

    pub fn characteristic(&self, uuid: Uuid) -> Option<&CharacteristicInfo> {
        self.characteristics
            .iter()
            .find(|characteristic| characteristic.uuid == uuid)
    }
}

/// Locates a characteristic by uuid anywhere in a discovered service set.
pub fn find_characteristic(services: &[ServiceInfo], uuid: Uuid) -> Option<&CharacteristicInfo> {
    services
        .iter()
        .find_map(|service| service.characteristic(uuid))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::uuid::uuid_from_u16;

    #[test]
    fn write_type_prefers_acknowledged() {
        let both = CharacteristicInfo::new(uuid_from_u16(0xFFE1),
                                           CharacteristicProperties::WRITE
                                           | CharacteristicProperties::WRITE_WITHOUT_RESPONSE);
        assert_eq!(both.preferred_write_type(), Some(WriteType::WithResponse));

        let unacknowledged = CharacteristicInfo::new(uuid_from_u16(0xFFE1),
                                                     CharacteristicProperties::WRITE_WITHOUT_RESPONSE);
        assert_eq!(unacknowledged.preferred_write_type(),
                   Some(WriteType::WithoutResponse));

        let read_only = CharacteristicInfo::new(uuid_from_u16(0x2A37),
                                                CharacteristicProperties::READ
                                                | CharacteristicProperties::NOTIFY);
        assert_eq!(read_only.preferred_write_type(), None);
    }

    #[test]
    fn characteristic_lookup_spans_services() {
        let target = uuid_from_u16(0xFFE1);
        let services =
            vec![ServiceInfo::new(uuid_from_u16(0x180A),
                                  vec![CharacteristicInfo::new(uuid_from_u16(0x2A29),
                                                               CharacteristicProperties::READ)]),
                 ServiceInfo::new(uuid_from_u16(0xFFE0),
                                  vec![CharacteristicInfo::new(target,
                                                               CharacteristicProperties::WRITE)])];

        let found = find_characteristic(&services, target).unwrap();
        assert!(found.is_writable());
        assert_eq!(find_characteristic(&services, uuid_from_u16(0x2A00)), None);
    }
}
