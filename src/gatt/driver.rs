//! Seam between the port layer and the platform BLE stack.
//!
//! A [`GattDriver`] submits requests and reports everything asynchronous
//! through [`poll_event`](GattDriver::poll_event): connection changes,
//! discovery items, MTU and write responses, incoming notifications and
//! peer writes to served attributes. Request methods return as soon as
//! the stack has accepted the request.

use heapless::Vec;

use super::types::{
    CharacteristicInfo, ConnHandle, DescriptorInfo, GattRole, ServiceDefinition, ServiceInfo,
    Uuid, ATT_MAX_VALUE_LEN,
};
use crate::addr::BdAddress;
use crate::error::GattError;

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum GattDriverEvent {
    Connected {
        conn: ConnHandle,
        peer: BdAddress,
        role: GattRole,
    },
    ConnectFailed {
        peer: BdAddress,
        error: GattError,
    },
    Disconnected {
        conn: ConnHandle,
    },
    ServiceDiscovered {
        conn: ConnHandle,
        service: ServiceInfo,
    },
    CharacteristicDiscovered {
        conn: ConnHandle,
        characteristic: CharacteristicInfo,
    },
    DescriptorDiscovered {
        conn: ConnHandle,
        descriptor: DescriptorInfo,
    },
    DiscoveryComplete {
        conn: ConnHandle,
        result: Result<(), GattError>,
    },
    MtuExchanged {
        conn: ConnHandle,
        mtu: u16,
    },
    WriteResponse {
        conn: ConnHandle,
        handle: u16,
        result: Result<(), GattError>,
    },
    Notification {
        conn: ConnHandle,
        handle: u16,
        data: Vec<u8, ATT_MAX_VALUE_LEN>,
    },
    /// The peer wrote one of our served attribute values.
    ServerWrite {
        conn: ConnHandle,
        handle: u16,
        data: Vec<u8, ATT_MAX_VALUE_LEN>,
    },
}

pub trait GattDriver {
    /// Start connection establishment towards `peer`. Outcome arrives as
    /// [`GattDriverEvent::Connected`] or [`GattDriverEvent::ConnectFailed`].
    async fn connect(&mut self, peer: &BdAddress) -> Result<(), GattError>;

    async fn disconnect(&mut self, conn: ConnHandle) -> Result<(), GattError>;

    /// Discover primary services, optionally only those matching `filter`.
    /// Items arrive one per event, closed by `DiscoveryComplete`.
    async fn discover_primary_services(
        &mut self,
        conn: ConnHandle,
        filter: Option<&Uuid>,
    ) -> Result<(), GattError>;

    async fn discover_characteristics(
        &mut self,
        conn: ConnHandle,
        start_handle: u16,
        end_handle: u16,
    ) -> Result<(), GattError>;

    async fn discover_descriptors(
        &mut self,
        conn: ConnHandle,
        start_handle: u16,
        end_handle: u16,
    ) -> Result<(), GattError>;

    async fn exchange_mtu(&mut self, conn: ConnHandle, mtu: u16) -> Result<(), GattError>;

    /// Write an attribute value. With `with_response` the outcome arrives
    /// as [`GattDriverEvent::WriteResponse`] for the same handle.
    async fn write(
        &mut self,
        conn: ConnHandle,
        handle: u16,
        data: &[u8],
        with_response: bool,
    ) -> Result<(), GattError>;

    async fn notify(
        &mut self,
        conn: ConnHandle,
        handle: u16,
        data: &[u8],
    ) -> Result<(), GattError>;

    /// Add a service to the local attribute table. Returns the base
    /// handle; attributes are laid out sequentially from it in
    /// definition order.
    async fn publish_service(&mut self, service: &ServiceDefinition) -> Result<u16, GattError>;

    async fn withdraw_service(&mut self, base_handle: u16) -> Result<(), GattError>;

    /// Next asynchronous event from the stack.
    async fn poll_event(&mut self) -> GattDriverEvent;
}
