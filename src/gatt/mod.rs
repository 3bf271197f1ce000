//! GATT port layer.
//!
//! One object unifies the client and server operations the profiles
//! above need: connect/disconnect, sequenced discovery, MTU exchange,
//! subscriptions, writes, notifications and service publication, over a
//! pluggable [`GattDriver`]. The port owns the connection pool, the
//! subscription records and the published-service table; everything the
//! stack reports asynchronously is routed through [`GattPort::poll`],
//! while request/response pairs are awaited inside the request call.
//!
//! Events that arrive while a request is being awaited are not lost:
//! they are parked in a small backlog that [`GattPort::poll`] drains
//! first.

pub mod driver;
pub mod types;

use heapless::{Deque, Vec};

use self::driver::{GattDriver, GattDriverEvent};
use self::types::{
    CharacteristicInfo, ConnHandle, ConnectionState, DescriptorInfo, DiscoveryAction, GattRole,
    ServiceDefinition, ServiceInfo, Uuid, ATT_MAX_VALUE_LEN,
};
use crate::addr::BdAddress;
use crate::config::{
    ATT_DEFAULT_MTU, GATT_MAX_ATTRIBUTES, GATT_MAX_CHARACTERISTICS, GATT_MAX_CONNECTIONS,
    GATT_MAX_SUBSCRIPTIONS, GATT_MAX_USER_SERVICES,
};
use crate::error::{Error, GattError};

/// Events a request call did not consume, waiting for [`GattPort::poll`].
const EVENT_BACKLOG: usize = 8;

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum GattEvent {
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
    /// The peer re-negotiated the MTU outside a local exchange request.
    MtuUpdated {
        conn: ConnHandle,
        mtu: u16,
    },
    Notification {
        conn: ConnHandle,
        value_handle: u16,
        data: Vec<u8, ATT_MAX_VALUE_LEN>,
    },
    ServerWrite {
        conn: ConnHandle,
        handle: u16,
        data: Vec<u8, ATT_MAX_VALUE_LEN>,
    },
}

#[derive(Debug, Clone, Copy, Default)]
struct ConnectionEntry {
    state: ConnectionState,
    conn: ConnHandle,
    peer: BdAddress,
    role: GattRole,
    mtu: u16,
}

#[derive(Debug, Clone, Copy)]
struct Subscription {
    conn: ConnHandle,
    value_handle: u16,
    ccc_handle: u16,
    notifications: bool,
    indications: bool,
}

#[derive(Debug, Clone, Copy)]
struct PublishedService {
    base: u16,
    attributes: usize,
    characteristics: usize,
}

enum Classified {
    Deliver(GattEvent),
    Service {
        conn: ConnHandle,
        info: ServiceInfo,
    },
    Char {
        conn: ConnHandle,
        info: CharacteristicInfo,
    },
    Desc {
        conn: ConnHandle,
        info: DescriptorInfo,
    },
    Complete {
        conn: ConnHandle,
        result: Result<(), GattError>,
    },
    Mtu {
        conn: ConnHandle,
        mtu: u16,
    },
    WriteResponse {
        conn: ConnHandle,
        handle: u16,
        result: Result<(), GattError>,
    },
    Nothing,
}

pub struct GattPort<D: GattDriver> {
    driver: D,
    connections: [ConnectionEntry; GATT_MAX_CONNECTIONS],
    subscriptions: Vec<Subscription, GATT_MAX_SUBSCRIPTIONS>,
    services: Vec<PublishedService, GATT_MAX_USER_SERVICES>,
    pending: Deque<GattEvent, EVENT_BACKLOG>,
    /// Inbound connection to turn away because the pool was full.
    reject: Option<ConnHandle>,
    attributes_used: usize,
    characteristics_used: usize,
}

impl<D: GattDriver> GattPort<D> {
    pub fn new(driver: D) -> Self {
        Self {
            driver,
            connections: [ConnectionEntry::default(); GATT_MAX_CONNECTIONS],
            subscriptions: Vec::new(),
            services: Vec::new(),
            pending: Deque::new(),
            reject: None,
            attributes_used: 0,
            characteristics_used: 0,
        }
    }

    #[cfg(test)]
    pub(crate) fn driver_mut(&mut self) -> &mut D {
        &mut self.driver
    }

    fn entry(&self, conn: ConnHandle) -> Option<&ConnectionEntry> {
        self.connections
            .iter()
            .find(|e| e.state != ConnectionState::Unused && e.conn == conn)
    }

    fn ensure_connected(&self, conn: ConnHandle) -> Result<(), Error> {
        match self.entry(conn) {
            Some(e) if e.state == ConnectionState::Connected => Ok(()),
            _ => Err(Error::NotFound),
        }
    }

    pub fn connection_state(&self, conn: ConnHandle) -> ConnectionState {
        self.entry(conn).map(|e| e.state).unwrap_or_default()
    }

    pub fn mtu(&self, conn: ConnHandle) -> Option<u16> {
        self.entry(conn).map(|e| e.mtu)
    }

    pub fn peer(&self, conn: ConnHandle) -> Option<BdAddress> {
        self.entry(conn).map(|e| e.peer)
    }

    fn queue(&mut self, event: GattEvent) {
        if self.pending.push_back(event).is_err() {
            error!("gatt event backlog overflow, event dropped");
        }
    }

    /// Update pool state for one driver event and sort it into what the
    /// caller should do with it.
    fn classify(&mut self, event: GattDriverEvent) -> Classified {
        match event {
            GattDriverEvent::Connected { conn, peer, role } => {
                if let Some(entry) = self
                    .connections
                    .iter_mut()
                    .find(|e| e.state == ConnectionState::Connecting && e.peer == peer)
                {
                    entry.state = ConnectionState::Connected;
                    entry.conn = conn;
                    entry.role = role;
                    entry.mtu = ATT_DEFAULT_MTU;
                    Classified::Deliver(GattEvent::Connected { conn, peer, role })
                } else if let Some(entry) = self
                    .connections
                    .iter_mut()
                    .find(|e| e.state == ConnectionState::Unused)
                {
                    *entry = ConnectionEntry {
                        state: ConnectionState::Connected,
                        conn,
                        peer,
                        role,
                        mtu: ATT_DEFAULT_MTU,
                    };
                    Classified::Deliver(GattEvent::Connected { conn, peer, role })
                } else {
                    warn!("connection pool full, turning peer away");
                    self.reject = Some(conn);
                    Classified::Nothing
                }
            }
            GattDriverEvent::ConnectFailed { peer, error } => {
                if let Some(entry) = self
                    .connections
                    .iter_mut()
                    .find(|e| e.state == ConnectionState::Connecting && e.peer == peer)
                {
                    *entry = ConnectionEntry::default();
                }
                Classified::Deliver(GattEvent::ConnectFailed { peer, error })
            }
            GattDriverEvent::Disconnected { conn } => {
                if let Some(entry) = self
                    .connections
                    .iter_mut()
                    .find(|e| e.state != ConnectionState::Unused && e.conn == conn)
                {
                    *entry = ConnectionEntry::default();
                }
                self.subscriptions.retain(|s| s.conn != conn);
                Classified::Deliver(GattEvent::Disconnected { conn })
            }
            GattDriverEvent::ServiceDiscovered { conn, service } => Classified::Service {
                conn,
                info: service,
            },
            GattDriverEvent::CharacteristicDiscovered {
                conn,
                characteristic,
            } => Classified::Char {
                conn,
                info: characteristic,
            },
            GattDriverEvent::DescriptorDiscovered { conn, descriptor } => Classified::Desc {
                conn,
                info: descriptor,
            },
            GattDriverEvent::DiscoveryComplete { conn, result } => {
                Classified::Complete { conn, result }
            }
            GattDriverEvent::MtuExchanged { conn, mtu } => {
                if let Some(entry) = self
                    .connections
                    .iter_mut()
                    .find(|e| e.state == ConnectionState::Connected && e.conn == conn)
                {
                    entry.mtu = mtu;
                }
                Classified::Mtu { conn, mtu }
            }
            GattDriverEvent::WriteResponse {
                conn,
                handle,
                result,
            } => Classified::WriteResponse {
                conn,
                handle,
                result,
            },
            GattDriverEvent::Notification { conn, handle, data } => {
                if self
                    .subscriptions
                    .iter()
                    .any(|s| s.conn == conn && s.value_handle == handle)
                {
                    Classified::Deliver(GattEvent::Notification {
                        conn,
                        value_handle: handle,
                        data,
                    })
                } else {
                    debug!("notification without matching subscription dropped");
                    Classified::Nothing
                }
            }
            GattDriverEvent::ServerWrite { conn, handle, data } => {
                Classified::Deliver(GattEvent::ServerWrite { conn, handle, data })
            }
        }
    }

    /// Park an event another request pump ran into. Returns the handle if
    /// it was a disconnect, so the pump can abort when it was its own.
    fn absorb_unrelated(&mut self, classified: Classified) -> Option<ConnHandle> {
        match classified {
            Classified::Deliver(event) => {
                let lost = match &event {
                    GattEvent::Disconnected { conn } => Some(*conn),
                    _ => None,
                };
                self.queue(event);
                lost
            }
            Classified::Mtu { conn, mtu } => {
                self.queue(GattEvent::MtuUpdated { conn, mtu });
                None
            }
            Classified::Nothing => None,
            _ => {
                debug!("unexpected completion event dropped");
                None
            }
        }
    }

    /// Reserve a pool slot and start connecting to `peer`. The outcome
    /// arrives through [`poll`](Self::poll) as `Connected` or
    /// `ConnectFailed`.
    pub async fn connect(&mut self, peer: &BdAddress) -> Result<(), Error> {
        let Some(slot) = self
            .connections
            .iter_mut()
            .find(|e| e.state == ConnectionState::Unused)
        else {
            return Err(Error::NoMemory);
        };
        slot.state = ConnectionState::Connecting;
        slot.peer = *peer;
        slot.role = GattRole::Central;

        if let Err(e) = self.driver.connect(peer).await {
            if let Some(slot) = self
                .connections
                .iter_mut()
                .find(|s| s.state == ConnectionState::Connecting && s.peer == *peer)
            {
                *slot = ConnectionEntry::default();
            }
            return Err(e.into());
        }
        Ok(())
    }

    /// Request link teardown. The final `Disconnected` event frees the
    /// pool slot.
    pub async fn disconnect(&mut self, conn: ConnHandle) -> Result<(), Error> {
        let entry = self
            .connections
            .iter_mut()
            .find(|e| e.state == ConnectionState::Connected && e.conn == conn)
            .ok_or(Error::NotFound)?;
        entry.state = ConnectionState::Disconnecting;
        self.driver.disconnect(conn).await?;
        Ok(())
    }

    /// Run a primary-service discovery, invoking `on_item` per service
    /// until the sequence ends or the callback stops it.
    pub async fn discover_primary_services<F>(
        &mut self,
        conn: ConnHandle,
        filter: Option<Uuid>,
        mut on_item: F,
    ) -> Result<(), Error>
    where
        F: FnMut(&ServiceInfo) -> DiscoveryAction,
    {
        self.ensure_connected(conn)?;
        self.driver
            .discover_primary_services(conn, filter.as_ref())
            .await?;
        loop {
            let event = self.driver.poll_event().await;
            match self.classify(event) {
                Classified::Service { conn: c, info } if c == conn => {
                    let wanted = filter.map_or(true, |u| u == info.uuid);
                    if wanted && on_item(&info) == DiscoveryAction::Stop {
                        return Ok(());
                    }
                }
                Classified::Complete { conn: c, result } if c == conn => {
                    return result.map_err(|_| Error::Protocol);
                }
                other => {
                    if self.absorb_unrelated(other) == Some(conn) {
                        return Err(Error::Gatt(GattError::ConnectionFailed));
                    }
                }
            }
        }
    }

    pub async fn discover_characteristics<F>(
        &mut self,
        conn: ConnHandle,
        start_handle: u16,
        end_handle: u16,
        mut on_item: F,
    ) -> Result<(), Error>
    where
        F: FnMut(&CharacteristicInfo) -> DiscoveryAction,
    {
        self.ensure_connected(conn)?;
        self.driver
            .discover_characteristics(conn, start_handle, end_handle)
            .await?;
        loop {
            let event = self.driver.poll_event().await;
            match self.classify(event) {
                Classified::Char { conn: c, info } if c == conn => {
                    if on_item(&info) == DiscoveryAction::Stop {
                        return Ok(());
                    }
                }
                Classified::Complete { conn: c, result } if c == conn => {
                    return result.map_err(|_| Error::Protocol);
                }
                other => {
                    if self.absorb_unrelated(other) == Some(conn) {
                        return Err(Error::Gatt(GattError::ConnectionFailed));
                    }
                }
            }
        }
    }

    /// Descriptor discovery over a handle range, typically the gap
    /// between a characteristic value and the next declaration. `filter`
    /// is re-checked here whether or not the driver applied it.
    pub async fn discover_descriptors<F>(
        &mut self,
        conn: ConnHandle,
        start_handle: u16,
        end_handle: u16,
        filter: Option<Uuid>,
        mut on_item: F,
    ) -> Result<(), Error>
    where
        F: FnMut(&DescriptorInfo) -> DiscoveryAction,
    {
        self.ensure_connected(conn)?;
        self.driver
            .discover_descriptors(conn, start_handle, end_handle)
            .await?;
        loop {
            let event = self.driver.poll_event().await;
            match self.classify(event) {
                Classified::Desc { conn: c, info } if c == conn => {
                    let wanted = filter.map_or(true, |u| u == info.uuid);
                    if wanted && on_item(&info) == DiscoveryAction::Stop {
                        return Ok(());
                    }
                }
                Classified::Complete { conn: c, result } if c == conn => {
                    return result.map_err(|_| Error::Protocol);
                }
                other => {
                    if self.absorb_unrelated(other) == Some(conn) {
                        return Err(Error::Gatt(GattError::ConnectionFailed));
                    }
                }
            }
        }
    }

    /// Request an MTU of `mtu` and wait for the negotiated result. The
    /// connection entry is updated as a side effect.
    pub async fn exchange_mtu(&mut self, conn: ConnHandle, mtu: u16) -> Result<u16, Error> {
        self.ensure_connected(conn)?;
        self.driver.exchange_mtu(conn, mtu).await?;
        loop {
            let event = self.driver.poll_event().await;
            match self.classify(event) {
                Classified::Mtu { conn: c, mtu } if c == conn => return Ok(mtu),
                other => {
                    if self.absorb_unrelated(other) == Some(conn) {
                        return Err(Error::Gatt(GattError::ConnectionFailed));
                    }
                }
            }
        }
    }

    /// Create a subscription record and write the peer's CCC descriptor.
    /// Completes when the write response arrives; only then are
    /// notifications for `value_handle` let through.
    pub async fn subscribe(
        &mut self,
        conn: ConnHandle,
        value_handle: u16,
        ccc_handle: u16,
        notifications: bool,
        indications: bool,
    ) -> Result<(), Error> {
        self.ensure_connected(conn)?;
        if self
            .subscriptions
            .iter()
            .any(|s| s.conn == conn && s.value_handle == value_handle)
        {
            return Err(Error::InvalidParameter);
        }
        if self.subscriptions.is_full() {
            return Err(Error::NoMemory);
        }

        let value = [(notifications as u8) | ((indications as u8) << 1), 0];
        self.driver.write(conn, ccc_handle, &value, true).await?;
        loop {
            let event = self.driver.poll_event().await;
            match self.classify(event) {
                Classified::WriteResponse {
                    conn: c,
                    handle,
                    result,
                } if c == conn && handle == ccc_handle => {
                    result.map_err(|_| Error::Protocol)?;
                    self.subscriptions
                        .push(Subscription {
                            conn,
                            value_handle,
                            ccc_handle,
                            notifications,
                            indications,
                        })
                        .map_err(|_| Error::NoMemory)?;
                    return Ok(());
                }
                other => {
                    if self.absorb_unrelated(other) == Some(conn) {
                        return Err(Error::Gatt(GattError::ConnectionFailed));
                    }
                }
            }
        }
    }

    /// Drop a subscription record and clear the peer's CCC descriptor.
    pub async fn unsubscribe(&mut self, conn: ConnHandle, value_handle: u16) -> Result<(), Error> {
        let Some(pos) = self
            .subscriptions
            .iter()
            .position(|s| s.conn == conn && s.value_handle == value_handle)
        else {
            return Err(Error::NotFound);
        };
        let ccc_handle = self.subscriptions[pos].ccc_handle;
        self.subscriptions.swap_remove(pos);

        self.driver.write(conn, ccc_handle, &[0, 0], true).await?;
        loop {
            let event = self.driver.poll_event().await;
            match self.classify(event) {
                Classified::WriteResponse {
                    conn: c,
                    handle,
                    result,
                } if c == conn && handle == ccc_handle => {
                    return result.map_err(|_| Error::Protocol);
                }
                other => {
                    if self.absorb_unrelated(other) == Some(conn) {
                        return Err(Error::Gatt(GattError::ConnectionFailed));
                    }
                }
            }
        }
    }

    pub async fn write_no_response(
        &mut self,
        conn: ConnHandle,
        handle: u16,
        data: &[u8],
    ) -> Result<(), Error> {
        self.ensure_connected(conn)?;
        self.driver.write(conn, handle, data, false).await?;
        Ok(())
    }

    pub async fn notify(
        &mut self,
        conn: ConnHandle,
        handle: u16,
        data: &[u8],
    ) -> Result<(), Error> {
        self.ensure_connected(conn)?;
        self.driver.notify(conn, handle, data).await?;
        Ok(())
    }

    /// Publish a service. Returns the base attribute handle the driver
    /// assigned; see [`ServiceDefinition`] for the layout from it.
    pub async fn publish_service(&mut self, service: &ServiceDefinition) -> Result<u16, Error> {
        let attributes = service.attribute_count();
        let characteristics = service.characteristics.len();
        if self.services.is_full()
            || self.attributes_used + attributes > GATT_MAX_ATTRIBUTES
            || self.characteristics_used + characteristics > GATT_MAX_CHARACTERISTICS
        {
            return Err(Error::NoMemory);
        }

        let base = self.driver.publish_service(service).await?;
        self.attributes_used += attributes;
        self.characteristics_used += characteristics;
        let _ = self.services.push(PublishedService {
            base,
            attributes,
            characteristics,
        });
        Ok(base)
    }

    pub async fn withdraw_service(&mut self, base_handle: u16) -> Result<(), Error> {
        let Some(pos) = self.services.iter().position(|s| s.base == base_handle) else {
            return Err(Error::NotFound);
        };
        self.driver.withdraw_service(base_handle).await?;
        let svc = self.services.swap_remove(pos);
        self.attributes_used -= svc.attributes;
        self.characteristics_used -= svc.characteristics;
        Ok(())
    }

    /// Deliver the next port event: first anything parked during request
    /// pumps, then fresh driver events.
    pub async fn poll(&mut self) -> GattEvent {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return event;
            }
            if let Some(conn) = self.reject.take() {
                let _ = self.driver.disconnect(conn).await;
            }
            let event = self.driver.poll_event().await;
            match self.classify(event) {
                Classified::Deliver(event) => return event,
                Classified::Mtu { conn, mtu } => return GattEvent::MtuUpdated { conn, mtu },
                Classified::Nothing => {}
                _ => debug!("completion event with no pending request dropped"),
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::driver::mock::{MockCall, MockDriver};
    use super::types::{
        AttPermissions, CharProps, Characteristic, CharacteristicInfo, ConnHandle,
        ConnectionState, Descriptor, DiscoveryAction, GattRole, ServiceDefinition, ServiceInfo,
        Uuid,
    };
    use super::*;
    use crate::test_helpers::block_on;

    fn addr(last: u8) -> BdAddress {
        BdAddress::new([last, 0, 0, 0x11, 0x22, 0x33], crate::addr::AddressType::Public)
    }

    fn connected(port: &mut GattPort<MockDriver>, conn: u16, peer: BdAddress) -> ConnHandle {
        let conn = ConnHandle(conn);
        block_on(port.connect(&peer)).unwrap();
        port.driver.stage(GattDriverEvent::Connected {
            conn,
            peer,
            role: GattRole::Central,
        });
        assert!(matches!(
            block_on(port.poll()),
            GattEvent::Connected { .. }
        ));
        conn
    }

    #[test]
    fn connect_fills_pool_entry() {
        let mut port = GattPort::new(MockDriver::new());
        let peer = addr(1);
        let conn = connected(&mut port, 7, peer);

        assert_eq!(port.connection_state(conn), ConnectionState::Connected);
        assert_eq!(port.mtu(conn), Some(23));
        assert_eq!(port.peer(conn), Some(peer));
        assert_eq!(port.driver.calls, [MockCall::Connect(peer)]);
    }

    #[test]
    fn connect_pool_exhausted() {
        let mut port = GattPort::new(MockDriver::new());
        block_on(port.connect(&addr(1))).unwrap();
        block_on(port.connect(&addr(2))).unwrap();
        assert_eq!(block_on(port.connect(&addr(3))), Err(Error::NoMemory));
    }

    #[test]
    fn connect_failure_frees_slot() {
        let mut port = GattPort::new(MockDriver::new());
        let peer = addr(1);
        block_on(port.connect(&peer)).unwrap();
        port.driver.stage(GattDriverEvent::ConnectFailed {
            peer,
            error: GattError::ConnectionFailed,
        });
        assert_eq!(
            block_on(port.poll()),
            GattEvent::ConnectFailed {
                peer,
                error: GattError::ConnectionFailed
            }
        );
        // Slot is reusable again.
        block_on(port.connect(&addr(2))).unwrap();
        block_on(port.connect(&addr(3))).unwrap();
    }

    #[test]
    fn service_discovery_filters_and_stops() {
        let mut port = GattPort::new(MockDriver::new());
        let conn = connected(&mut port, 1, addr(1));

        let wanted = Uuid::Short(0xAA00);
        let item = |uuid, start| ServiceInfo {
            uuid,
            start_handle: start,
            end_handle: start + 6,
        };
        port.driver.stage(GattDriverEvent::ServiceDiscovered {
            conn,
            service: item(Uuid::Short(0x1801), 0x01),
        });
        port.driver.stage(GattDriverEvent::ServiceDiscovered {
            conn,
            service: item(wanted, 0x10),
        });

        let mut found = None;
        block_on(port.discover_primary_services(conn, Some(wanted), |svc| {
            found = Some(*svc);
            DiscoveryAction::Stop
        }))
        .unwrap();
        assert_eq!(found.unwrap().start_handle, 0x10);
        assert_eq!(
            port.driver.calls[1],
            MockCall::DiscoverPrimary(conn, Some(wanted))
        );
    }

    #[test]
    fn discovery_runs_to_completion() {
        let mut port = GattPort::new(MockDriver::new());
        let conn = connected(&mut port, 1, addr(1));

        for start in [0x01u16, 0x10] {
            port.driver.stage(GattDriverEvent::ServiceDiscovered {
                conn,
                service: ServiceInfo {
                    uuid: Uuid::Short(0x1801),
                    start_handle: start,
                    end_handle: start + 3,
                },
            });
        }
        port.driver.stage(GattDriverEvent::DiscoveryComplete {
            conn,
            result: Ok(()),
        });

        let mut count = 0;
        block_on(port.discover_primary_services(conn, None, |_| {
            count += 1;
            DiscoveryAction::Continue
        }))
        .unwrap();
        assert_eq!(count, 2);
    }

    #[test]
    fn discovery_peer_abort_is_protocol_error() {
        let mut port = GattPort::new(MockDriver::new());
        let conn = connected(&mut port, 1, addr(1));
        port.driver.stage(GattDriverEvent::DiscoveryComplete {
            conn,
            result: Err(GattError::RequestRejected),
        });
        let r = block_on(port.discover_characteristics(conn, 0x10, 0x20, |_| {
            DiscoveryAction::Continue
        }));
        assert_eq!(r, Err(Error::Protocol));
    }

    #[test]
    fn mtu_exchange_updates_entry() {
        let mut port = GattPort::new(MockDriver::new());
        let conn = connected(&mut port, 1, addr(1));
        port.driver
            .stage(GattDriverEvent::MtuExchanged { conn, mtu: 158 });
        assert_eq!(block_on(port.exchange_mtu(conn, 247)), Ok(158));
        assert_eq!(port.mtu(conn), Some(158));
        assert!(port
            .driver
            .calls
            .contains(&MockCall::ExchangeMtu(conn, 247)));
    }

    #[test]
    fn subscribe_writes_ccc_then_lets_notifications_through() {
        let mut port = GattPort::new(MockDriver::new());
        let conn = connected(&mut port, 1, addr(1));

        port.driver.stage(GattDriverEvent::WriteResponse {
            conn,
            handle: 0x13,
            result: Ok(()),
        });
        block_on(port.subscribe(conn, 0x12, 0x13, true, false)).unwrap();
        assert!(port.driver.calls.contains(&MockCall::Write {
            conn,
            handle: 0x13,
            data: vec![0x01, 0x00],
            with_response: true,
        }));

        // Unknown handle is filtered, subscribed handle delivered.
        port.driver.stage(GattDriverEvent::Notification {
            conn,
            handle: 0x42,
            data: Vec::from_slice(&[9]).unwrap(),
        });
        port.driver.stage(GattDriverEvent::Notification {
            conn,
            handle: 0x12,
            data: Vec::from_slice(&[1, 2]).unwrap(),
        });
        match block_on(port.poll()) {
            GattEvent::Notification {
                value_handle, data, ..
            } => {
                assert_eq!(value_handle, 0x12);
                assert_eq!(&data[..], &[1, 2]);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn duplicate_subscription_rejected() {
        let mut port = GattPort::new(MockDriver::new());
        let conn = connected(&mut port, 1, addr(1));
        port.driver.stage(GattDriverEvent::WriteResponse {
            conn,
            handle: 0x13,
            result: Ok(()),
        });
        block_on(port.subscribe(conn, 0x12, 0x13, true, false)).unwrap();
        assert_eq!(
            block_on(port.subscribe(conn, 0x12, 0x13, true, false)),
            Err(Error::InvalidParameter)
        );
    }

    #[test]
    fn events_during_request_are_parked() {
        let mut port = GattPort::new(MockDriver::new());
        let conn = connected(&mut port, 1, addr(1));
        port.driver.stage(GattDriverEvent::WriteResponse {
            conn,
            handle: 0x13,
            result: Ok(()),
        });
        block_on(port.subscribe(conn, 0x12, 0x13, true, false)).unwrap();

        // A notification surfaces while a discovery request is pending.
        port.driver.stage(GattDriverEvent::Notification {
            conn,
            handle: 0x12,
            data: Vec::from_slice(&[7]).unwrap(),
        });
        port.driver.stage(GattDriverEvent::DiscoveryComplete {
            conn,
            result: Ok(()),
        });
        block_on(port.discover_primary_services(conn, None, |_| DiscoveryAction::Continue))
            .unwrap();

        match block_on(port.poll()) {
            GattEvent::Notification { data, .. } => assert_eq!(&data[..], &[7]),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn disconnect_mid_request_aborts_it() {
        let mut port = GattPort::new(MockDriver::new());
        let conn = connected(&mut port, 1, addr(1));
        port.driver.stage(GattDriverEvent::Disconnected { conn });
        let r = block_on(port.exchange_mtu(conn, 247));
        assert_eq!(r, Err(Error::Gatt(GattError::ConnectionFailed)));
        assert_eq!(port.connection_state(conn), ConnectionState::Unused);
        // The disconnect is still observable afterwards.
        assert_eq!(block_on(port.poll()), GattEvent::Disconnected { conn });
    }

    fn notify_service(uuid: u16) -> ServiceDefinition {
        let mut characteristics = Vec::new();
        for i in 0..4u16 {
            characteristics
                .push(Characteristic {
                    uuid: Uuid::Short(uuid + 1 + i),
                    properties: CharProps::NOTIFY,
                    permissions: AttPermissions::ReadWrite,
                    descriptors: Vec::from_slice(&[Descriptor {
                        uuid: Uuid::CCC,
                        permissions: AttPermissions::ReadWrite,
                    }])
                    .unwrap(),
                })
                .unwrap();
        }
        ServiceDefinition {
            uuid: Uuid::Short(uuid),
            characteristics,
        }
    }

    #[test]
    fn publish_respects_attribute_pool() {
        let mut port = GattPort::new(MockDriver::new());
        // 13 attributes each; the second would exceed the table.
        let svc = notify_service(0xAA00);
        assert_eq!(svc.attribute_count(), 13);
        let base = block_on(port.publish_service(&svc)).unwrap();
        assert_eq!(base, 0x10);
        assert_eq!(
            block_on(port.publish_service(&notify_service(0xBB00))),
            Err(Error::NoMemory)
        );

        block_on(port.withdraw_service(base)).unwrap();
        assert!(block_on(port.publish_service(&notify_service(0xBB00))).is_ok());
    }

    #[test]
    fn server_write_events_are_delivered() {
        let mut port = GattPort::new(MockDriver::new());
        let conn = connected(&mut port, 1, addr(1));
        port.driver.stage(GattDriverEvent::ServerWrite {
            conn,
            handle: 0x13,
            data: Vec::from_slice(&[1, 0]).unwrap(),
        });
        assert_eq!(
            block_on(port.poll()),
            GattEvent::ServerWrite {
                conn,
                handle: 0x13,
                data: Vec::from_slice(&[1, 0]).unwrap(),
            }
        );
    }

    #[test]
    fn inbound_connection_with_full_pool_is_turned_away() {
        let mut port = GattPort::new(MockDriver::new());
        for i in 1..=2u16 {
            port.driver.stage(GattDriverEvent::Connected {
                conn: ConnHandle(i),
                peer: addr(i as u8),
                role: GattRole::Peripheral,
            });
            assert!(matches!(block_on(port.poll()), GattEvent::Connected { .. }));
        }
        port.driver.stage(GattDriverEvent::Connected {
            conn: ConnHandle(3),
            peer: addr(3),
            role: GattRole::Peripheral,
        });
        port.driver
            .stage(GattDriverEvent::Disconnected { conn: ConnHandle(1) });

        assert_eq!(
            block_on(port.poll()),
            GattEvent::Disconnected { conn: ConnHandle(1) }
        );
        assert!(port.driver.calls.contains(&MockCall::Disconnect(ConnHandle(3))));
    }
}
