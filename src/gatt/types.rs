//! Attribute-level vocabulary shared by the client and server halves of
//! the port layer.

use heapless::Vec;

/// Largest attribute value the port moves in one PDU. Matches the payload
/// of a notification at the biggest MTU the modules negotiate (250).
pub const ATT_MAX_VALUE_LEN: usize = 244;

/// Descriptors one characteristic may carry in a published service.
pub const MAX_DESCRIPTORS_PER_CHAR: usize = 4;

/// A 16-bit assigned number or a full 128-bit UUID.
///
/// 128-bit UUIDs are stored in the printed byte order, most significant
/// byte first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Uuid {
    Short(u16),
    Long([u8; 16]),
}

impl Uuid {
    /// Client Characteristic Configuration descriptor.
    pub const CCC: Uuid = Uuid::Short(0x2902);
}

/// Connection identifier assigned by the BLE stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ConnHandle(pub u16);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum GattRole {
    #[default]
    Central,
    Peripheral,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ConnectionState {
    #[default]
    Unused,
    Connecting,
    Connected,
    Disconnecting,
}

/// Characteristic property bits as they appear in the declaration
/// attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct CharProps(pub u8);

impl CharProps {
    pub const BROADCAST: CharProps = CharProps(0x01);
    pub const READ: CharProps = CharProps(0x02);
    pub const WRITE_WITHOUT_RESPONSE: CharProps = CharProps(0x04);
    pub const WRITE: CharProps = CharProps(0x08);
    pub const NOTIFY: CharProps = CharProps(0x10);
    pub const INDICATE: CharProps = CharProps(0x20);

    pub const fn contains(self, other: CharProps) -> bool {
        self.0 & other.0 == other.0
    }
}

impl core::ops::BitOr for CharProps {
    type Output = CharProps;

    fn bitor(self, rhs: CharProps) -> CharProps {
        CharProps(self.0 | rhs.0)
    }
}

/// Access allowed on a served attribute value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum AttPermissions {
    ReadOnly,
    WriteOnly,
    ReadWrite,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Descriptor {
    pub uuid: Uuid,
    pub permissions: AttPermissions,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Characteristic {
    pub uuid: Uuid,
    pub properties: CharProps,
    pub permissions: AttPermissions,
    pub descriptors: Vec<Descriptor, MAX_DESCRIPTORS_PER_CHAR>,
}

/// A service the local device publishes.
///
/// At publication the driver lays the attribute table out sequentially
/// from a base handle: the service declaration first, then for each
/// characteristic its declaration, its value and its descriptors in
/// order. The handle helpers below encode that layout.
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceDefinition {
    pub uuid: Uuid,
    pub characteristics: Vec<Characteristic, { crate::config::GATT_MAX_CHARACTERISTICS }>,
}

impl ServiceDefinition {
    /// Attribute handles this service occupies when published.
    pub fn attribute_count(&self) -> usize {
        1 + self
            .characteristics
            .iter()
            .map(|c| 2 + c.descriptors.len())
            .sum::<usize>()
    }

    fn char_decl_offset(&self, char_index: usize) -> u16 {
        let mut offset = 1u16;
        for c in self.characteristics.iter().take(char_index) {
            offset += 2 + c.descriptors.len() as u16;
        }
        offset
    }

    /// Handle of the value attribute of characteristic `char_index`, for
    /// a service published at `base`.
    pub fn value_handle(&self, base: u16, char_index: usize) -> u16 {
        base + self.char_decl_offset(char_index) + 1
    }

    /// Handle of descriptor `desc_index` of characteristic `char_index`.
    pub fn descriptor_handle(&self, base: u16, char_index: usize, desc_index: usize) -> u16 {
        self.value_handle(base, char_index) + 1 + desc_index as u16
    }
}

/// One item of a primary-service discovery sequence.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ServiceInfo {
    pub uuid: Uuid,
    pub start_handle: u16,
    pub end_handle: u16,
}

#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct CharacteristicInfo {
    pub uuid: Uuid,
    pub decl_handle: u16,
    pub value_handle: u16,
    pub properties: CharProps,
}

#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct DescriptorInfo {
    pub uuid: Uuid,
    pub handle: u16,
}

/// Returned by discovery callbacks to keep or stop the sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryAction {
    Continue,
    Stop,
}
