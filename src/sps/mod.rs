//! u-blox serial port service links over a [`GattPort`].
//!
//! An [`SpsLink`] manages up to [`SPS_MAX_CONNECTIONS`] concurrent SPS
//! connections in either role. As a client it runs the whole bring-up
//! sequence inside [`connect`](SpsLink::connect): service and
//! characteristic discovery, CCC lookup, MTU exchange, subscriptions and
//! the initial credit grant. As a server it publishes the service once
//! via [`start_server`](SpsLink::start_server) and then watches the
//! peer's CCC writes to decide when a link is up and whether it runs
//! credit-based flow control.
//!
//! Credits count whole PDUs. A grant tops the peer up only when the
//! new total would more than double what it still holds, which keeps
//! grant traffic rare while the buffer drains steadily.

pub mod types;

use embassy_time::{with_timeout, Duration, Instant};
use heapless::Deque;

use self::types::{
    sps_service, LinkState, SpsEvent, CREDIT_GRANT_MAX, CREDIT_IGNORE, PDU_HEADER,
    SPS_CREDITS_UUID, SPS_FIFO_UUID, SPS_SERVICE_UUID,
};
use crate::addr::BdAddress;
use crate::config::{ATT_DEFAULT_MTU, SPS_BUFFER_SIZE, SPS_MAX_CONNECTIONS, SPS_MTU_REQUEST};
use crate::error::Error;
use crate::gatt::driver::GattDriver;
use crate::gatt::types::{
    CharacteristicInfo, ConnHandle, ConnectionState, DiscoveryAction, GattRole, ServiceInfo, Uuid,
};
use crate::gatt::{GattEvent, GattPort};
use crate::ringbuf::RingBuffer;

/// One slot reserved to tell full from empty.
const RX_RING: usize = SPS_BUFFER_SIZE + 1;

/// Events the pump produced that the application has not collected yet.
const EVENT_BACKLOG: usize = 4;

/// Peer-side attribute handles a client-role link discovered.
#[derive(Debug, Clone, Copy, Default)]
struct ClientHandles {
    fifo_value: u16,
    fifo_ccc: u16,
    credits_value: u16,
    credits_ccc: u16,
}

/// Local attribute handles of the published service.
#[derive(Debug, Clone, Copy)]
struct SpsServer {
    base: u16,
    fifo_value: u16,
    fifo_ccc: u16,
    credits_value: u16,
    credits_ccc: u16,
}

struct SpsSlot {
    state: LinkState,
    conn: ConnHandle,
    peer: BdAddress,
    role: GattRole,
    mtu: u16,
    flow_control: bool,
    /// Credits we may spend sending PDUs to the peer.
    tx_credits: u8,
    /// Credits the peer still holds against our receive buffer.
    rx_credits_on_remote: u8,
    handles: ClientHandles,
    fifo_ccc_enabled: bool,
    credits_ccc_enabled: bool,
    first_grant_seen: bool,
    rx: RingBuffer<RX_RING>,
}

impl Default for SpsSlot {
    fn default() -> Self {
        Self {
            state: LinkState::Free,
            conn: ConnHandle(0),
            peer: BdAddress::default(),
            role: GattRole::Central,
            mtu: ATT_DEFAULT_MTU,
            flow_control: false,
            tx_credits: 0,
            rx_credits_on_remote: 0,
            handles: ClientHandles::default(),
            fifo_ccc_enabled: false,
            credits_ccc_enabled: false,
            first_grant_seen: false,
            rx: RingBuffer::new(),
        }
    }
}

impl SpsSlot {
    /// PDU payload budget under the current MTU.
    fn per_pdu(&self) -> usize {
        (self.mtu as usize).saturating_sub(PDU_HEADER).max(1)
    }
}

pub struct SpsLink<D: GattDriver> {
    port: GattPort<D>,
    slots: [SpsSlot; SPS_MAX_CONNECTIONS],
    pending: Deque<SpsEvent, EVENT_BACKLOG>,
    server: Option<SpsServer>,
}

impl<D: GattDriver> SpsLink<D> {
    pub fn new(port: GattPort<D>) -> Self {
        Self {
            port,
            slots: core::array::from_fn(|_| SpsSlot::default()),
            pending: Deque::new(),
            server: None,
        }
    }

    fn slot_idx(&self, conn: ConnHandle) -> Option<usize> {
        self.slots
            .iter()
            .position(|s| s.state != LinkState::Free && s.conn == conn)
    }

    pub fn link_state(&self, conn: ConnHandle) -> LinkState {
        self.slot_idx(conn)
            .map(|i| self.slots[i].state)
            .unwrap_or_default()
    }

    pub fn peer(&self, conn: ConnHandle) -> Option<BdAddress> {
        self.slot_idx(conn).map(|i| self.slots[i].peer)
    }

    pub fn flow_control(&self, conn: ConnHandle) -> Option<bool> {
        self.slot_idx(conn).map(|i| self.slots[i].flow_control)
    }

    fn push_event(&mut self, event: SpsEvent) {
        if self.pending.push_back(event).is_err() {
            error!("sps event backlog overflow, event dropped");
        }
    }

    /// Next link event: first anything the request pumps produced, then
    /// fresh port traffic.
    pub async fn poll(&mut self) -> SpsEvent {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return event;
            }
            let event = self.port.poll().await;
            self.absorb(event).await;
        }
    }

    /// Connect to `addr` and bring the service up in the client role.
    ///
    /// On any failure after the GAP link came up, the link is torn down
    /// again before [`SpsEvent::ConnectFailed`] is reported and the
    /// error returned.
    pub async fn connect(&mut self, addr: &BdAddress) -> Result<ConnHandle, Error> {
        if !self.slots.iter().any(|s| s.state == LinkState::Free) {
            return Err(Error::NoMemory);
        }
        self.port.connect(addr).await?;
        match self.bring_up(addr).await {
            Ok(conn) => Ok(conn),
            Err((error, conn)) => {
                if let Some(conn) = conn {
                    self.teardown_failed(conn).await;
                }
                self.push_event(SpsEvent::ConnectFailed { addr: *addr });
                Err(error)
            }
        }
    }

    async fn bring_up(
        &mut self,
        addr: &BdAddress,
    ) -> Result<ConnHandle, (Error, Option<ConnHandle>)> {
        let conn = loop {
            match self.port.poll().await {
                GattEvent::Connected {
                    conn,
                    peer,
                    role: GattRole::Central,
                } if peer == *addr => break conn,
                GattEvent::ConnectFailed { peer, error } if peer == *addr => {
                    return Err((Error::Gatt(error), None));
                }
                other => self.absorb(other).await,
            }
        };

        let mut service: Option<ServiceInfo> = None;
        self.port
            .discover_primary_services(conn, Some(SPS_SERVICE_UUID), |svc| {
                service = Some(*svc);
                DiscoveryAction::Stop
            })
            .await
            .map_err(|e| (e, Some(conn)))?;
        let service = service.ok_or((Error::NotFound, Some(conn)))?;

        let mut fifo: Option<CharacteristicInfo> = None;
        let mut credits: Option<CharacteristicInfo> = None;
        self.port
            .discover_characteristics(conn, service.start_handle, service.end_handle, |ch| {
                if ch.uuid == SPS_FIFO_UUID {
                    fifo = Some(*ch);
                } else if ch.uuid == SPS_CREDITS_UUID {
                    credits = Some(*ch);
                }
                if fifo.is_some() && credits.is_some() {
                    DiscoveryAction::Stop
                } else {
                    DiscoveryAction::Continue
                }
            })
            .await
            .map_err(|e| (e, Some(conn)))?;
        let fifo = fifo.ok_or((Error::NotFound, Some(conn)))?;
        // A peer without the Credits characteristic speaks the
        // credit-less variant of the service.
        let flow_control = credits.is_some();

        let fifo_end = match &credits {
            Some(c) if c.decl_handle > fifo.value_handle => c.decl_handle - 1,
            _ => service.end_handle,
        };
        let fifo_ccc = self
            .find_ccc(conn, fifo.value_handle + 1, fifo_end)
            .await
            .map_err(|e| (e, Some(conn)))?
            .ok_or((Error::NotFound, Some(conn)))?;

        let mut handles = ClientHandles {
            fifo_value: fifo.value_handle,
            fifo_ccc,
            ..Default::default()
        };
        if let Some(credits) = &credits {
            let end = if fifo.decl_handle > credits.value_handle {
                fifo.decl_handle - 1
            } else {
                service.end_handle
            };
            handles.credits_value = credits.value_handle;
            handles.credits_ccc = self
                .find_ccc(conn, credits.value_handle + 1, end)
                .await
                .map_err(|e| (e, Some(conn)))?
                .ok_or((Error::NotFound, Some(conn)))?;
        }

        let mtu = self
            .port
            .exchange_mtu(conn, SPS_MTU_REQUEST)
            .await
            .map_err(|e| (e, Some(conn)))?;

        // Credits before FIFO, so no data notification can arrive ahead
        // of the credit channel being live.
        if flow_control {
            self.port
                .subscribe(conn, handles.credits_value, handles.credits_ccc, true, false)
                .await
                .map_err(|e| (e, Some(conn)))?;
        }
        self.port
            .subscribe(conn, handles.fifo_value, handles.fifo_ccc, true, false)
            .await
            .map_err(|e| (e, Some(conn)))?;

        let idx = self
            .slots
            .iter()
            .position(|s| s.state == LinkState::Free)
            .ok_or((Error::NoMemory, Some(conn)))?;
        self.slots[idx] = SpsSlot {
            state: LinkState::Connected,
            conn,
            peer: *addr,
            role: GattRole::Central,
            mtu,
            flow_control,
            handles,
            ..Default::default()
        };

        if flow_control {
            self.grant_credits(idx).await.map_err(|e| (e, Some(conn)))?;
        }
        Ok(conn)
    }

    async fn find_ccc(
        &mut self,
        conn: ConnHandle,
        start: u16,
        end: u16,
    ) -> Result<Option<u16>, Error> {
        let mut found = None;
        self.port
            .discover_descriptors(conn, start, end, Some(Uuid::CCC), |desc| {
                found = Some(desc.handle);
                DiscoveryAction::Stop
            })
            .await?;
        Ok(found)
    }

    /// Drop a half-established link, pumping until the stack confirms.
    async fn teardown_failed(&mut self, conn: ConnHandle) {
        if self.port.connection_state(conn) == ConnectionState::Unused {
            return;
        }
        if self.port.disconnect(conn).await.is_err() {
            return;
        }
        loop {
            match self.port.poll().await {
                GattEvent::Disconnected { conn: c } if c == conn => return,
                other => self.absorb(other).await,
            }
        }
    }

    /// Request link teardown; the slot is freed when the final
    /// [`SpsEvent::Disconnected`] comes through [`poll`](Self::poll).
    pub async fn disconnect(&mut self, conn: ConnHandle) -> Result<(), Error> {
        self.slot_idx(conn).ok_or(Error::NotFound)?;
        self.port.disconnect(conn).await
    }

    /// Publish the SPS service for inbound connections.
    pub async fn start_server(&mut self) -> Result<(), Error> {
        if self.server.is_some() {
            return Err(Error::InvalidState);
        }
        let definition = sps_service();
        let base = self.port.publish_service(&definition).await?;
        self.server = Some(SpsServer {
            base,
            fifo_value: definition.value_handle(base, 0),
            fifo_ccc: definition.descriptor_handle(base, 0, 0),
            credits_value: definition.value_handle(base, 1),
            credits_ccc: definition.descriptor_handle(base, 1, 0),
        });
        Ok(())
    }

    pub async fn stop_server(&mut self) -> Result<(), Error> {
        let server = self.server.take().ok_or(Error::InvalidState)?;
        self.port.withdraw_service(server.base).await
    }

    /// Send `data` over the link, chunked to the PDU budget, spending
    /// one credit per PDU where flow control is on.
    ///
    /// Waits for credits up to `timeout` and returns the bytes actually
    /// sent, which is short of `data.len()` when credits ran dry.
    pub async fn send(
        &mut self,
        conn: ConnHandle,
        data: &[u8],
        timeout: Duration,
    ) -> Result<usize, Error> {
        match self.slot_idx(conn) {
            Some(idx) if self.slots[idx].state == LinkState::Connected => {}
            _ => return Err(Error::NotFound),
        }
        let deadline = Instant::now() + timeout;
        let mut sent = 0;
        while sent < data.len() {
            // The slot can vanish while pumping for credits.
            let Some(idx) = self.slot_idx(conn) else {
                break;
            };
            let slot = &self.slots[idx];
            let (role, fifo_value, per_pdu) = (slot.role, slot.handles.fifo_value, slot.per_pdu());
            if slot.flow_control && slot.tx_credits == 0 {
                let now = Instant::now();
                if now >= deadline {
                    break;
                }
                match with_timeout(deadline - now, self.port.poll()).await {
                    Ok(event) => {
                        self.absorb(event).await;
                        continue;
                    }
                    Err(_) => break,
                }
            }
            let chunk = (data.len() - sent).min(per_pdu);
            match role {
                GattRole::Central => {
                    self.port
                        .write_no_response(conn, fifo_value, &data[sent..sent + chunk])
                        .await?;
                }
                GattRole::Peripheral => {
                    let server = self.server.as_ref().ok_or(Error::InvalidState)?;
                    let handle = server.fifo_value;
                    self.port
                        .notify(conn, handle, &data[sent..sent + chunk])
                        .await?;
                }
            }
            let slot = &mut self.slots[idx];
            if slot.flow_control {
                slot.tx_credits -= 1;
            }
            sent += chunk;
        }
        Ok(sent)
    }

    /// Read buffered receive data. Consuming data frees buffer space,
    /// which may trigger a credit grant to the peer.
    pub async fn receive(&mut self, conn: ConnHandle, buf: &mut [u8]) -> Result<usize, Error> {
        let idx = self.slot_idx(conn).ok_or(Error::NotFound)?;
        let n = self.slots[idx].rx.read(buf);
        if n > 0 && self.slots[idx].flow_control {
            self.grant_credits(idx).await?;
        }
        Ok(n)
    }

    /// Route one port event into the affected slot.
    async fn absorb(&mut self, event: GattEvent) {
        match event {
            GattEvent::Connected {
                conn,
                peer,
                role: GattRole::Peripheral,
            } => {
                if self.server.is_none() {
                    return;
                }
                match self.slots.iter_mut().find(|s| s.state == LinkState::Free) {
                    Some(slot) => {
                        *slot = SpsSlot {
                            state: LinkState::Pending,
                            conn,
                            peer,
                            role: GattRole::Peripheral,
                            ..Default::default()
                        };
                    }
                    None => warn!("inbound sps connection with no free slot"),
                }
            }
            GattEvent::Connected { .. } | GattEvent::ConnectFailed { .. } => {}
            GattEvent::Disconnected { conn } => {
                if let Some(idx) = self.slot_idx(conn) {
                    let was_up = self.slots[idx].state == LinkState::Connected;
                    self.slots[idx] = SpsSlot::default();
                    if was_up {
                        self.push_event(SpsEvent::Disconnected { handle: conn });
                    }
                }
            }
            GattEvent::MtuUpdated { conn, mtu } => {
                if let Some(idx) = self.slot_idx(conn) {
                    self.slots[idx].mtu = mtu;
                }
            }
            GattEvent::Notification {
                conn,
                value_handle,
                data,
            } => {
                let Some(idx) = self.slot_idx(conn) else {
                    return;
                };
                let handles = self.slots[idx].handles;
                if self.slots[idx].flow_control && value_handle == handles.credits_value {
                    self.credit_in(idx, &data);
                } else if value_handle == handles.fifo_value {
                    self.rx_pdu(idx, &data);
                }
            }
            GattEvent::ServerWrite { conn, handle, data } => {
                let Some(server) = self.server else {
                    return;
                };
                let Some(idx) = self.slot_idx(conn) else {
                    return;
                };
                if handle == server.fifo_ccc {
                    self.slots[idx].fifo_ccc_enabled =
                        data.first().is_some_and(|b| b & 0x01 != 0);
                    self.try_server_connect(idx).await;
                } else if handle == server.credits_ccc {
                    self.slots[idx].credits_ccc_enabled =
                        data.first().is_some_and(|b| b & 0x01 != 0);
                    self.try_server_connect(idx).await;
                } else if handle == server.credits_value {
                    self.slots[idx].first_grant_seen = true;
                    self.credit_in(idx, &data);
                    self.try_server_connect(idx).await;
                } else if handle == server.fifo_value {
                    self.rx_pdu(idx, &data);
                }
            }
        }
    }

    /// A pending inbound link is up once the peer enabled the FIFO
    /// notifications; with the Credits CCC also enabled it additionally
    /// needs the peer's first grant, and then runs flow control.
    async fn try_server_connect(&mut self, idx: usize) {
        let slot = &mut self.slots[idx];
        if slot.state != LinkState::Pending || !slot.fifo_ccc_enabled {
            return;
        }
        let flow = slot.credits_ccc_enabled;
        if flow && !slot.first_grant_seen {
            return;
        }
        slot.state = LinkState::Connected;
        slot.flow_control = flow;
        let handle = slot.conn;
        self.push_event(SpsEvent::Connected { handle });
        if flow {
            if let Err(e) = self.grant_credits(idx).await {
                warn!("initial credit grant failed: {:?}", e);
            }
        }
    }

    fn credit_in(&mut self, idx: usize, data: &[u8]) {
        let Some(&value) = data.first() else {
            return;
        };
        if value == CREDIT_IGNORE {
            warn!("reserved credit value received, ignored");
            return;
        }
        let slot = &mut self.slots[idx];
        slot.tx_credits = slot.tx_credits.saturating_add(value);
    }

    fn rx_pdu(&mut self, idx: usize, data: &[u8]) {
        let slot = &mut self.slots[idx];
        if slot.state != LinkState::Connected {
            return;
        }
        if slot.flow_control {
            if slot.rx_credits_on_remote == 0 {
                warn!("sps pdu received with no credits outstanding");
            }
            slot.rx_credits_on_remote = slot.rx_credits_on_remote.saturating_sub(1);
        }
        let was_empty = slot.rx.data_size() == 0;
        if !slot.rx.add(data) {
            warn!("sps receive buffer full, {} bytes dropped", data.len());
            return;
        }
        if was_empty {
            let handle = slot.conn;
            self.push_event(SpsEvent::DataAvailable { handle });
        }
    }

    /// Top the peer's credits up to what the receive buffer can absorb.
    ///
    /// A grant goes out only when it exceeds what the peer still holds,
    /// so the total at least doubles each time.
    async fn grant_credits(&mut self, idx: usize) -> Result<(), Error> {
        let slot = &self.slots[idx];
        if slot.state != LinkState::Connected || !slot.flow_control {
            return Ok(());
        }
        let available = (slot.rx.available_size() / slot.per_pdu())
            .min(CREDIT_GRANT_MAX as usize) as u8;
        let held = slot.rx_credits_on_remote;
        if available <= held {
            return Ok(());
        }
        let grant = available - held;
        if grant <= held {
            return Ok(());
        }
        let (conn, role, credits_value) = (slot.conn, slot.role, slot.handles.credits_value);
        match role {
            GattRole::Central => {
                self.port
                    .write_no_response(conn, credits_value, &[grant])
                    .await?;
            }
            GattRole::Peripheral => {
                let server = self.server.as_ref().ok_or(Error::InvalidState)?;
                if !self.slots[idx].credits_ccc_enabled {
                    return Ok(());
                }
                let handle = server.credits_value;
                self.port.notify(conn, handle, &[grant]).await?;
            }
        }
        self.slots[idx].rx_credits_on_remote = available;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::addr::AddressType;
    use crate::gatt::driver::mock::{MockCall, MockDriver};
    use crate::gatt::driver::GattDriverEvent;
    use crate::gatt::types::{CharProps, ServiceInfo};
    use crate::test_helpers::block_on;
    use heapless::Vec;

    fn peer() -> BdAddress {
        BdAddress::new([0x12, 0xDD, 0x98, 0xF3, 0x12, 0x00], AddressType::Public)
    }

    fn link() -> SpsLink<MockDriver> {
        SpsLink::new(GattPort::new(MockDriver::new()))
    }

    fn characteristic(decl: u16, value: u16, uuid: Uuid) -> CharacteristicInfo {
        CharacteristicInfo {
            uuid,
            decl_handle: decl,
            value_handle: value,
            properties: CharProps::WRITE_WITHOUT_RESPONSE | CharProps::NOTIFY,
        }
    }

    /// Stage the full happy-path bring-up script: service at
    /// 0x10..0x20, FIFO at 0x11/0x12 with CCC 0x13, Credits at
    /// 0x14/0x15 with CCC 0x16.
    fn stage_client_bring_up(link: &mut SpsLink<MockDriver>, conn: ConnHandle, mtu: u16) {
        let driver = link.port.driver_mut();
        driver.stage(GattDriverEvent::Connected {
            conn,
            peer: peer(),
            role: GattRole::Central,
        });
        driver.stage(GattDriverEvent::ServiceDiscovered {
            conn,
            service: ServiceInfo {
                uuid: SPS_SERVICE_UUID,
                start_handle: 0x10,
                end_handle: 0x20,
            },
        });
        driver.stage(GattDriverEvent::CharacteristicDiscovered {
            conn,
            characteristic: characteristic(0x11, 0x12, SPS_FIFO_UUID),
        });
        driver.stage(GattDriverEvent::CharacteristicDiscovered {
            conn,
            characteristic: characteristic(0x14, 0x15, SPS_CREDITS_UUID),
        });
        driver.stage(GattDriverEvent::DescriptorDiscovered {
            conn,
            descriptor: crate::gatt::types::DescriptorInfo {
                uuid: Uuid::CCC,
                handle: 0x13,
            },
        });
        driver.stage(GattDriverEvent::DescriptorDiscovered {
            conn,
            descriptor: crate::gatt::types::DescriptorInfo {
                uuid: Uuid::CCC,
                handle: 0x16,
            },
        });
        driver.stage(GattDriverEvent::MtuExchanged { conn, mtu });
        driver.stage(GattDriverEvent::WriteResponse {
            conn,
            handle: 0x16,
            result: Ok(()),
        });
        driver.stage(GattDriverEvent::WriteResponse {
            conn,
            handle: 0x13,
            result: Ok(()),
        });
    }

    fn client(mtu: u16) -> (SpsLink<MockDriver>, ConnHandle) {
        let mut link = link();
        let conn = ConnHandle(1);
        stage_client_bring_up(&mut link, conn, mtu);
        assert_eq!(block_on(link.connect(&peer())), Ok(conn));
        (link, conn)
    }

    fn notification(data: &[u8]) -> Vec<u8, { crate::gatt::types::ATT_MAX_VALUE_LEN }> {
        Vec::from_slice(data).unwrap()
    }

    #[test]
    fn client_bring_up_walks_the_whole_sequence() {
        let (mut link, conn) = client(64);
        assert_eq!(link.link_state(conn), LinkState::Connected);
        assert_eq!(link.flow_control(conn), Some(true));
        assert_eq!(link.peer(conn), Some(peer()));

        let calls = &link.port.driver_mut().calls;
        // CCC writes: credits first, FIFO second.
        let ccc_writes: std::vec::Vec<u16> = calls
            .iter()
            .filter_map(|c| match c {
                MockCall::Write {
                    handle,
                    with_response: true,
                    ..
                } => Some(*handle),
                _ => None,
            })
            .collect();
        assert_eq!(ccc_writes, [0x16, 0x13]);
        assert!(calls.contains(&MockCall::ExchangeMtu(conn, 247)));
        // Initial grant: 1024 buffer bytes over 61-byte PDUs.
        assert!(calls.contains(&MockCall::Write {
            conn,
            handle: 0x15,
            data: vec![16],
            with_response: false,
        }));
    }

    #[test]
    fn missing_service_tears_the_link_down() {
        let mut link = link();
        let conn = ConnHandle(1);
        {
            let driver = link.port.driver_mut();
            driver.stage(GattDriverEvent::Connected {
                conn,
                peer: peer(),
                role: GattRole::Central,
            });
            driver.stage(GattDriverEvent::DiscoveryComplete {
                conn,
                result: Ok(()),
            });
            driver.stage(GattDriverEvent::Disconnected { conn });
        }
        assert_eq!(block_on(link.connect(&peer())), Err(Error::NotFound));
        assert!(link
            .port
            .driver_mut()
            .calls
            .contains(&MockCall::Disconnect(conn)));
        assert_eq!(
            block_on(link.poll()),
            SpsEvent::ConnectFailed { addr: peer() }
        );
        assert_eq!(link.link_state(conn), LinkState::Free);
    }

    #[test]
    fn send_spends_one_credit_per_pdu() {
        let (mut link, conn) = client(23);
        // Peer grants five credits; twenty-byte PDUs under MTU 23.
        link.port.driver_mut().stage(GattDriverEvent::Notification {
            conn,
            handle: 0x15,
            data: notification(&[5]),
        });

        let data = [0xAB; 100];
        let sent = block_on(link.send(conn, &data, Duration::from_secs(1))).unwrap();
        assert_eq!(sent, 100);

        let pdus: std::vec::Vec<usize> = link
            .port
            .driver_mut()
            .calls
            .iter()
            .filter_map(|c| match c {
                MockCall::Write {
                    handle: 0x12, data, ..
                } => Some(data.len()),
                _ => None,
            })
            .collect();
        assert_eq!(pdus, [20, 20, 20, 20, 20]);
        assert_eq!(link.slots[0].tx_credits, 0);
    }

    #[test]
    fn send_without_credits_times_out_partially() {
        let (mut link, conn) = client(23);
        let driver = link.port.driver_mut();
        driver.park_when_empty = true;
        driver.stage(GattDriverEvent::Notification {
            conn,
            handle: 0x15,
            data: notification(&[2]),
        });

        let data = [0x55; 100];
        let sent = block_on(link.send(conn, &data, Duration::from_millis(20))).unwrap();
        assert_eq!(sent, 40);
    }

    #[test]
    fn reserved_credit_value_is_ignored() {
        let (mut link, conn) = client(23);
        let driver = link.port.driver_mut();
        driver.park_when_empty = true;
        driver.stage(GattDriverEvent::Notification {
            conn,
            handle: 0x15,
            data: notification(&[CREDIT_IGNORE]),
        });
        let sent = block_on(link.send(conn, &[1, 2, 3], Duration::from_millis(10))).unwrap();
        assert_eq!(sent, 0);
        assert_eq!(link.slots[0].tx_credits, 0);
    }

    #[test]
    fn pdu_with_no_credits_outstanding_is_still_buffered() {
        let (mut link, conn) = client(64);
        // The peer overspends: no credits left on our side of the ledger.
        link.slots[0].rx_credits_on_remote = 0;
        link.port.driver_mut().stage(GattDriverEvent::Notification {
            conn,
            handle: 0x12,
            data: notification(&[1, 2, 3]),
        });
        assert_eq!(block_on(link.poll()), SpsEvent::DataAvailable { handle: conn });
        assert_eq!(link.slots[0].rx_credits_on_remote, 0);

        let mut buf = [0u8; 8];
        assert_eq!(block_on(link.receive(conn, &mut buf)), Ok(3));
        assert_eq!(&buf[..3], &[1, 2, 3]);
    }

    #[test]
    fn receive_from_empty_buffer_returns_zero() {
        let (mut link, conn) = client(64);
        let mut buf = [0u8; 32];
        assert_eq!(block_on(link.receive(conn, &mut buf)), Ok(0));
    }

    #[test]
    fn data_available_fires_on_empty_to_nonempty_only() {
        let (mut link, conn) = client(64);
        link.port.driver_mut().park_when_empty = true;
        for _ in 0..3 {
            link.port.driver_mut().stage(GattDriverEvent::Notification {
                conn,
                handle: 0x12,
                data: notification(&[7; 10]),
            });
        }
        assert_eq!(block_on(link.poll()), SpsEvent::DataAvailable { handle: conn });
        // The two follow-up PDUs land silently.
        assert!(block_on(with_timeout(Duration::from_millis(10), link.poll())).is_err());

        let mut buf = [0u8; 64];
        assert_eq!(block_on(link.receive(conn, &mut buf)), Ok(30));
    }

    #[test]
    fn grants_regrow_only_past_the_doubling_point() {
        let (mut link, conn) = client(64);
        // Initial grant was 16 (1024 / 61). Peer sends ten full PDUs.
        link.port.driver_mut().park_when_empty = true;
        for _ in 0..10 {
            link.port.driver_mut().stage(GattDriverEvent::Notification {
                conn,
                handle: 0x12,
                data: notification(&[3; 61]),
            });
        }
        assert_eq!(block_on(link.poll()), SpsEvent::DataAvailable { handle: conn });
        assert!(block_on(with_timeout(Duration::from_millis(10), link.poll())).is_err());
        assert_eq!(link.slots[0].rx_credits_on_remote, 6);

        let grants_to = |link: &mut SpsLink<MockDriver>| -> std::vec::Vec<std::vec::Vec<u8>> {
            link.port
                .driver_mut()
                .calls
                .iter()
                .filter_map(|c| match c {
                    MockCall::Write {
                        handle: 0x15, data, ..
                    } => Some(data.clone()),
                    _ => None,
                })
                .collect()
        };

        // Draining one PDU frees one credit: 7 available, grant of 1
        // does not beat the 6 still held, so nothing goes out.
        let mut buf = [0u8; 61];
        assert_eq!(block_on(link.receive(conn, &mut buf)), Ok(61));
        assert_eq!(grants_to(&mut link), [vec![16]]);

        // Draining the rest brings availability back to 16: a grant of
        // 10 beats the held 6.
        let mut rest = [0u8; 1024];
        assert_eq!(block_on(link.receive(conn, &mut rest)), Ok(549));
        assert_eq!(grants_to(&mut link), [vec![16], vec![10]]);
        assert_eq!(link.slots[0].rx_credits_on_remote, 16);
    }

    #[test]
    fn credit_less_client_skips_the_credit_machinery() {
        let mut link = link();
        let conn = ConnHandle(1);
        {
            let driver = link.port.driver_mut();
            driver.stage(GattDriverEvent::Connected {
                conn,
                peer: peer(),
                role: GattRole::Central,
            });
            driver.stage(GattDriverEvent::ServiceDiscovered {
                conn,
                service: ServiceInfo {
                    uuid: SPS_SERVICE_UUID,
                    start_handle: 0x10,
                    end_handle: 0x14,
                },
            });
            driver.stage(GattDriverEvent::CharacteristicDiscovered {
                conn,
                characteristic: characteristic(0x11, 0x12, SPS_FIFO_UUID),
            });
            driver.stage(GattDriverEvent::DiscoveryComplete {
                conn,
                result: Ok(()),
            });
            driver.stage(GattDriverEvent::DescriptorDiscovered {
                conn,
                descriptor: crate::gatt::types::DescriptorInfo {
                    uuid: Uuid::CCC,
                    handle: 0x13,
                },
            });
            driver.stage(GattDriverEvent::MtuExchanged { conn, mtu: 23 });
            driver.stage(GattDriverEvent::WriteResponse {
                conn,
                handle: 0x13,
                result: Ok(()),
            });
        }
        assert_eq!(block_on(link.connect(&peer())), Ok(conn));
        assert_eq!(link.flow_control(conn), Some(false));

        // Sends go straight out, no credit wait, no grants.
        let sent = block_on(link.send(conn, &[9; 50], Duration::from_secs(1))).unwrap();
        assert_eq!(sent, 50);
        assert!(!link
            .port
            .driver_mut()
            .calls
            .iter()
            .any(|c| matches!(c, MockCall::Write { handle: 0x15, .. })));
    }

    fn server_link() -> SpsLink<MockDriver> {
        let mut link = link();
        block_on(link.start_server()).unwrap();
        link
    }

    fn server_write(
        link: &mut SpsLink<MockDriver>,
        conn: ConnHandle,
        handle: u16,
        data: &[u8],
    ) {
        link.port.driver_mut().stage(GattDriverEvent::ServerWrite {
            conn,
            handle,
            data: Vec::from_slice(data).unwrap(),
        });
    }

    #[test]
    fn server_connect_with_flow_control() {
        let mut link = server_link();
        let conn = ConnHandle(9);
        link.port.driver_mut().stage(GattDriverEvent::Connected {
            conn,
            peer: peer(),
            role: GattRole::Peripheral,
        });
        // Published at base 0x10: FIFO value 0x12 / CCC 0x13, Credits
        // value 0x15 / CCC 0x16. Peer enables credits, grants, then
        // enables the FIFO.
        server_write(&mut link, conn, 0x16, &[1, 0]);
        server_write(&mut link, conn, 0x15, &[3]);
        server_write(&mut link, conn, 0x13, &[1, 0]);

        assert_eq!(block_on(link.poll()), SpsEvent::Connected { handle: conn });
        assert_eq!(link.flow_control(conn), Some(true));
        assert_eq!(link.slots[0].tx_credits, 3);
        // Initial grant notified on the credits value: 1024 / 20 = 51.
        assert!(link.port.driver_mut().calls.contains(&MockCall::Notify {
            conn,
            handle: 0x15,
            data: vec![51],
        }));

        // Server sends are notifications on the FIFO value.
        let sent = block_on(link.send(conn, &[4; 30], Duration::from_secs(1))).unwrap();
        assert_eq!(sent, 30);
        assert_eq!(link.slots[0].tx_credits, 1);
        assert!(link.port.driver_mut().calls.contains(&MockCall::Notify {
            conn,
            handle: 0x12,
            data: vec![4; 20],
        }));
    }

    #[test]
    fn server_connect_without_credits_is_credit_less() {
        let mut link = server_link();
        let conn = ConnHandle(9);
        link.port.driver_mut().stage(GattDriverEvent::Connected {
            conn,
            peer: peer(),
            role: GattRole::Peripheral,
        });
        server_write(&mut link, conn, 0x13, &[1, 0]);

        assert_eq!(block_on(link.poll()), SpsEvent::Connected { handle: conn });
        assert_eq!(link.flow_control(conn), Some(false));
        assert!(!link
            .port
            .driver_mut()
            .calls
            .iter()
            .any(|c| matches!(c, MockCall::Notify { .. })));

        // Peer data arrives as writes on the FIFO value.
        server_write(&mut link, conn, 0x12, &[8; 12]);
        assert_eq!(block_on(link.poll()), SpsEvent::DataAvailable { handle: conn });
        let mut buf = [0u8; 32];
        assert_eq!(block_on(link.receive(conn, &mut buf)), Ok(12));
        assert_eq!(&buf[..12], &[8; 12]);
    }

    #[test]
    fn disconnect_frees_the_slot_and_reports() {
        let (mut link, conn) = client(64);
        block_on(link.disconnect(conn)).unwrap();
        link.port
            .driver_mut()
            .stage(GattDriverEvent::Disconnected { conn });
        assert_eq!(block_on(link.poll()), SpsEvent::Disconnected { handle: conn });
        assert_eq!(link.link_state(conn), LinkState::Free);
        let mut buf = [0u8; 4];
        assert_eq!(block_on(link.receive(conn, &mut buf)), Err(Error::NotFound));
    }
}
