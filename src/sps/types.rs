//! Serial port service vocabulary: the u-blox SPS UUIDs, credit wire
//! values and the events a link reports.

use crate::addr::BdAddress;
use crate::gatt::types::{
    AttPermissions, CharProps, Characteristic, ConnHandle, Descriptor, ServiceDefinition, Uuid,
};
use heapless::Vec;

/// `2456e1b9-26e2-8f83-e744-f34f01e9d701`
pub const SPS_SERVICE_UUID: Uuid = Uuid::Long([
    0x24, 0x56, 0xE1, 0xB9, 0x26, 0xE2, 0x8F, 0x83, 0xE7, 0x44, 0xF3, 0x4F, 0x01, 0xE9, 0xD7,
    0x01,
]);

/// `...d703`, carries the payload bytes.
pub const SPS_FIFO_UUID: Uuid = Uuid::Long([
    0x24, 0x56, 0xE1, 0xB9, 0x26, 0xE2, 0x8F, 0x83, 0xE7, 0x44, 0xF3, 0x4F, 0x01, 0xE9, 0xD7,
    0x03,
]);

/// `...d704`, carries one-byte credit grants.
pub const SPS_CREDITS_UUID: Uuid = Uuid::Long([
    0x24, 0x56, 0xE1, 0xB9, 0x26, 0xE2, 0x8F, 0x83, 0xE7, 0x44, 0xF3, 0x4F, 0x01, 0xE9, 0xD7,
    0x04,
]);

/// ATT notification / write-command header subtracted from the MTU to
/// get the per-PDU payload budget.
pub const PDU_HEADER: usize = 3;

/// Credit byte the protocol reserves; received grants of this value are
/// ignored and it is never issued.
pub const CREDIT_IGNORE: u8 = 0xFF;

/// Largest credit total granted to a peer, keeping clear of the
/// reserved byte.
pub const CREDIT_GRANT_MAX: u8 = 254;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum LinkState {
    #[default]
    Free,
    /// GAP-connected peer that has not brought the service up yet
    /// (server role, waiting for CCC writes).
    Pending,
    Connected,
}

#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SpsEvent {
    Connected { handle: ConnHandle },
    /// Client bring-up failed; the address identifies which attempt.
    ConnectFailed { addr: BdAddress },
    Disconnected { handle: ConnHandle },
    /// A PDU landed in a previously empty receive buffer.
    DataAvailable { handle: ConnHandle },
}

/// The service a server-role link publishes: FIFO and Credits, each
/// writable without response, notifying, with a CCC descriptor.
pub fn sps_service() -> ServiceDefinition {
    let ccc = Descriptor {
        uuid: Uuid::CCC,
        permissions: AttPermissions::ReadWrite,
    };
    let characteristic = |uuid| Characteristic {
        uuid,
        properties: CharProps::WRITE_WITHOUT_RESPONSE | CharProps::NOTIFY,
        permissions: AttPermissions::ReadWrite,
        descriptors: Vec::from_slice(core::slice::from_ref(&ccc)).unwrap_or_default(),
    };
    ServiceDefinition {
        uuid: SPS_SERVICE_UUID,
        characteristics: Vec::from_slice(&[
            characteristic(SPS_FIFO_UUID),
            characteristic(SPS_CREDITS_UUID),
        ])
        .unwrap_or_default(),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn service_layout() {
        let svc = sps_service();
        // Declaration, then per characteristic: declaration, value, CCC.
        assert_eq!(svc.attribute_count(), 7);
        assert_eq!(svc.value_handle(0x10, 0), 0x12);
        assert_eq!(svc.descriptor_handle(0x10, 0, 0), 0x13);
        assert_eq!(svc.value_handle(0x10, 1), 0x15);
        assert_eq!(svc.descriptor_handle(0x10, 1, 0), 0x16);
    }
}
