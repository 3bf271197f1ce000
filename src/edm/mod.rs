//! Extended data mode: one UART stream multiplexing AT traffic and up to
//! nine virtual data channels.
//!
//! Three pieces live here:
//!
//! - the raw frame commands ([`EdmAtCmdWrapper`], [`EdmDataCommand`],
//!   [`EdmResendConnectEventsCommand`], [`SwitchToEdmCommand`]) for use
//!   with an `atat` client whose ingress runs [`digest::EdmDigester`],
//! - [`EdmAtWriter`], the TX intercept that wraps outgoing AT bytes into
//!   AT request frames,
//! - [`EdmStream`], a host-side demultiplexer that tracks the channel
//!   table and dispatches typed connect/disconnect/data callbacks
//!   through an [`EdmHandler`].

pub mod digest;
pub mod types;
pub mod urc;

use core::convert::TryInto;

use atat::AtatUrc;
use embassy_time::{with_timeout, Duration, Instant};
use embedded_io_async::{Read, Write};
use heapless::Vec;

use crate::config::{
    EDM_STREAM_AT_COMMAND_LENGTH, EDM_STREAM_AT_RESPONSE_LENGTH, EDM_STREAM_MAX_CONNECTIONS,
};
use crate::error::Error;
use crate::ringbuf::RingBuffer;
use digest::Scan;
use types::*;
use urc::EdmEvent;

pub(crate) fn calc_payload_len(resp: &[u8]) -> usize {
    (u16::from_be_bytes(resp[1..3].try_into().unwrap()) & EDM_FULL_SIZE_FILTER) as usize
}

/// EDM wrapper for AT commands.
///
/// Note: the AT+UMRS command to change serial settings does not work
/// exactly the same as in command mode. When executed in the extended
/// data mode the `<change_after_confirm>` parameter must be set to 0 and
/// the serial settings take effect when the module is reset.
#[derive(Debug, Clone)]
pub struct EdmAtCmdWrapper<T: atat::AtatCmd>(pub T);

impl<T: atat::AtatCmd> atat::AtatCmd for EdmAtCmdWrapper<T> {
    type Response = T::Response;

    const MAX_LEN: usize = T::MAX_LEN + PAYLOAD_OVERHEAD;

    const MAX_TIMEOUT_MS: u32 = T::MAX_TIMEOUT_MS;

    fn write(&self, buf: &mut [u8]) -> usize {
        let at_len = self.0.write(&mut buf[5..]);
        let payload_len = (at_len + 2) as u16;

        buf[0..5].copy_from_slice(&[
            STARTBYTE,
            (payload_len >> 8) as u8 & EDM_SIZE_FILTER,
            (payload_len & 0xffu16) as u8,
            0x00,
            PayloadType::ATRequest as u8,
        ]);

        buf[5 + at_len] = ENDBYTE;

        5 + at_len + 1
    }

    fn parse(
        &self,
        resp: Result<&[u8], atat::InternalError>,
    ) -> core::result::Result<Self::Response, atat::Error> {
        let resp = resp.and_then(|resp| {
            if resp.len() < PAYLOAD_OVERHEAD
                || !resp.starts_with(&[STARTBYTE])
                || !resp.ends_with(&[ENDBYTE])
            {
                return Err(atat::InternalError::InvalidResponse);
            };

            let payload_len = calc_payload_len(resp);

            if resp.len() != payload_len + EDM_OVERHEAD
                || resp[4] != PayloadType::ATConfirmation as u8
            {
                return Err(atat::InternalError::InvalidResponse);
            }

            // Received OK response code in EDM response?
            match resp
                .windows(b"\r\nOK".len())
                .position(|window| window == b"\r\nOK")
            {
                // Cutting OK out leaves an empty string for NoResponse,
                // for other responses just removes "\r\nOK\r\n"
                Some(pos) => Ok(&resp[AT_COMMAND_POSITION..pos]),
                // Isolate the AT response
                None => Ok(&resp[AT_COMMAND_POSITION..PAYLOAD_POSITION + payload_len]),
            }
        });

        self.0.parse(resp)
    }
}

#[derive(Debug, Clone)]
pub struct EdmDataCommand<'a> {
    pub channel: ChannelId,
    pub data: &'a [u8],
}

impl<'a> atat::AtatCmd for EdmDataCommand<'a> {
    type Response = NoResponse;

    const MAX_LEN: usize = DATA_PACKAGE_SIZE + DATA_HEAD_SIZE + 1;

    const EXPECTS_RESPONSE_CODE: bool = false;

    fn write(&self, buf: &mut [u8]) -> usize {
        let mut head = [0u8; DATA_HEAD_SIZE];
        data_head(self.channel, self.data.len(), &mut head);
        buf[..DATA_HEAD_SIZE].copy_from_slice(&head);
        buf[DATA_HEAD_SIZE..DATA_HEAD_SIZE + self.data.len()].copy_from_slice(self.data);
        buf[DATA_HEAD_SIZE + self.data.len()] = ENDBYTE;

        DATA_HEAD_SIZE + self.data.len() + 1
    }

    fn parse(
        &self,
        _resp: Result<&[u8], atat::InternalError>,
    ) -> core::result::Result<Self::Response, atat::Error> {
        Ok(NoResponse)
    }
}

#[derive(Debug, Clone)]
pub struct EdmResendConnectEventsCommand;

impl atat::AtatCmd for EdmResendConnectEventsCommand {
    type Response = NoResponse;

    const MAX_LEN: usize = 6;

    fn write(&self, buf: &mut [u8]) -> usize {
        buf[0..6].copy_from_slice(&[
            STARTBYTE,
            0x00,
            0x02,
            0x00,
            PayloadType::ResendConnectEventsCommand as u8,
            ENDBYTE,
        ]);

        6
    }

    fn parse(
        &self,
        _resp: Result<&[u8], atat::InternalError>,
    ) -> core::result::Result<Self::Response, atat::Error> {
        Ok(NoResponse)
    }
}

/// `ATO2`, answered by a start event once the module switches over.
#[derive(Debug, Clone)]
pub struct SwitchToEdmCommand;

impl atat::AtatCmd for SwitchToEdmCommand {
    type Response = NoResponse;

    const MAX_LEN: usize = 6;

    const MAX_TIMEOUT_MS: u32 = 2000;

    fn write(&self, buf: &mut [u8]) -> usize {
        buf[..6].copy_from_slice(b"ATO2\r\n");
        6
    }

    fn parse(
        &self,
        _resp: Result<&[u8], atat::InternalError>,
    ) -> core::result::Result<Self::Response, atat::Error> {
        Ok(NoResponse)
    }
}

/// Wrap `data` into an AT request frame in `out`. Returns the frame
/// length; `out` must hold `data.len() + PAYLOAD_OVERHEAD` bytes.
pub fn request(data: &[u8], out: &mut [u8]) -> usize {
    let payload_len = (data.len() + 2) as u16;
    out[0..5].copy_from_slice(&[
        STARTBYTE,
        (payload_len >> 8) as u8 & EDM_SIZE_FILTER,
        (payload_len & 0xffu16) as u8,
        0x00,
        PayloadType::ATRequest as u8,
    ]);
    out[5..5 + data.len()].copy_from_slice(data);
    out[5 + data.len()] = ENDBYTE;

    PAYLOAD_OVERHEAD + data.len()
}

/// Head written before a data chunk of `len` bytes on `channel`; the
/// chunk itself and [`ENDBYTE`] follow on the wire.
pub fn data_head(channel: ChannelId, len: usize, out: &mut [u8; DATA_HEAD_SIZE]) {
    let payload_len = (len + 3) as u16;
    *out = [
        STARTBYTE,
        (payload_len >> 8) as u8 & EDM_SIZE_FILTER,
        (payload_len & 0xffu16) as u8,
        0x00,
        PayloadType::DataCommand as u8,
        channel.0,
    ];
}

const AT_FRAME_MAX: usize = EDM_STREAM_AT_COMMAND_LENGTH + PAYLOAD_OVERHEAD;

/// Transmit intercept above the AT client: accumulates outgoing AT bytes
/// and writes one AT request frame per flush, or earlier when the
/// accumulator fills.
///
/// UART failures are logged and the bytes reported as consumed, so the
/// AT client times out instead of retrying forever.
pub struct EdmAtWriter<W: Write> {
    inner: W,
    buffer: Vec<u8, EDM_STREAM_AT_COMMAND_LENGTH>,
    scratch: [u8; AT_FRAME_MAX],
}

impl<W: Write> EdmAtWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            buffer: Vec::new(),
            scratch: [0; AT_FRAME_MAX],
        }
    }

    pub fn release(self) -> W {
        self.inner
    }

    async fn emit(&mut self) {
        let n = request(&self.buffer, &mut self.scratch);
        if self.inner.write_all(&self.scratch[..n]).await.is_err() {
            warn!("UART write failed, {} AT bytes dropped", self.buffer.len());
        }
        self.buffer.clear();
    }
}

impl<W: Write> embedded_io_async::ErrorType for EdmAtWriter<W> {
    type Error = W::Error;
}

impl<W: Write> Write for EdmAtWriter<W> {
    async fn write(&mut self, buf: &[u8]) -> Result<usize, Self::Error> {
        if buf.is_empty() {
            return Ok(0);
        }
        if self.buffer.is_full() {
            self.emit().await;
        }
        let room = self.buffer.capacity() - self.buffer.len();
        let take = buf.len().min(room);
        // Cannot fail, `take` fits the remaining capacity.
        let _ = self.buffer.extend_from_slice(&buf[..take]);
        if self.buffer.is_full() {
            self.emit().await;
        }
        Ok(take)
    }

    async fn flush(&mut self) -> Result<(), Self::Error> {
        if !self.buffer.is_empty() {
            self.emit().await;
        }
        if self.inner.flush().await.is_err() {
            warn!("UART flush failed");
        }
        Ok(())
    }
}

/// What a live channel carries, recorded from its connect event.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ChannelKind {
    Bt { frame_size: u16 },
    Ip { local_port: u16, protocol: Protocol },
    Mqtt,
    /// Connect event with an unusable protocol; data on the channel is
    /// dropped until it disconnects.
    Invalid,
}

#[derive(Debug, Clone, Copy)]
struct ChannelEntry {
    channel: ChannelId,
    kind: ChannelKind,
}

#[derive(Default)]
struct ChannelTable {
    entries: [Option<ChannelEntry>; EDM_STREAM_MAX_CONNECTIONS],
}

impl ChannelTable {
    /// Record a live channel, re-using the slot on a repeated connect.
    fn allocate(&mut self, channel: ChannelId, kind: ChannelKind) -> Result<(), Error> {
        if let Some(entry) = self.entry_mut(channel) {
            entry.kind = kind;
            return Ok(());
        }
        match self.entries.iter_mut().find(|slot| slot.is_none()) {
            Some(slot) => {
                *slot = Some(ChannelEntry { channel, kind });
                Ok(())
            }
            None => Err(Error::NoMemory),
        }
    }

    fn entry_mut(&mut self, channel: ChannelId) -> Option<&mut ChannelEntry> {
        self.entries
            .iter_mut()
            .flatten()
            .find(|entry| entry.channel == channel)
    }

    fn kind(&self, channel: ChannelId) -> Option<ChannelKind> {
        self.entries
            .iter()
            .flatten()
            .find(|entry| entry.channel == channel)
            .map(|entry| entry.kind)
    }

    fn release(&mut self, channel: ChannelId) -> Option<ChannelKind> {
        let slot = self
            .entries
            .iter_mut()
            .find(|slot| matches!(slot, Some(entry) if entry.channel == channel))?;
        slot.take().map(|entry| entry.kind)
    }

    fn clear(&mut self) {
        self.entries = Default::default();
    }
}

/// Callbacks the stream dispatches into. Every method has a no-op
/// default; implement the ones the application cares about.
pub trait EdmHandler {
    fn on_startup(&mut self) {}

    /// AT bytes (response or URC text) landed in the response buffer;
    /// drain them with [`EdmStream::at_read`].
    fn on_at_data_available(&mut self, len: usize) {
        let _ = len;
    }

    fn on_bt_connect(&mut self, event: &BluetoothConnectEvent) {
        let _ = event;
    }

    fn on_bt_disconnect(&mut self, channel: ChannelId) {
        let _ = channel;
    }

    fn on_bt_data(&mut self, channel: ChannelId, data: &[u8]) {
        let _ = (channel, data);
    }

    fn on_ipv4_connect(&mut self, event: &IPv4ConnectEvent) {
        let _ = event;
    }

    fn on_ipv6_connect(&mut self, event: &IPv6ConnectEvent) {
        let _ = event;
    }

    fn on_ip_disconnect(&mut self, channel: ChannelId) {
        let _ = channel;
    }

    fn on_ip_data(&mut self, channel: ChannelId, data: &[u8]) {
        let _ = (channel, data);
    }

    fn on_mqtt_connect(&mut self, channel: ChannelId) {
        let _ = channel;
    }

    fn on_mqtt_disconnect(&mut self, channel: ChannelId) {
        let _ = channel;
    }

    fn on_mqtt_data(&mut self, channel: ChannelId, data: &[u8]) {
        let _ = (channel, data);
    }
}

const AT_RING: usize = EDM_STREAM_AT_RESPONSE_LENGTH + 1;

/// Window big enough for the largest frame the length field can encode.
const RX_WINDOW: usize = EDM_FULL_SIZE_FILTER as usize + EDM_OVERHEAD;

/// Host-side stream demultiplexer over one UART.
///
/// [`pump`](Self::pump) reads the UART and dispatches complete frames.
/// AT payloads pause the parser until the response buffer is drained
/// through [`at_read`](Self::at_read); every other event is considered
/// processed when its callback returns.
pub struct EdmStream<R: Read, W: Write> {
    rx: R,
    tx: W,
    channels: ChannelTable,
    at_response: RingBuffer<AT_RING>,
    parser_ready: bool,
    window: Vec<u8, RX_WINDOW>,
}

impl<R: Read, W: Write> EdmStream<R, W> {
    pub fn new(rx: R, tx: W) -> Self {
        Self {
            rx,
            tx,
            channels: ChannelTable::default(),
            at_response: RingBuffer::new(),
            parser_ready: true,
            window: Vec::new(),
        }
    }

    pub fn release(self) -> (R, W) {
        (self.rx, self.tx)
    }

    /// Whether the parser accepts more UART bytes, i.e. no AT payload is
    /// waiting to be drained.
    pub fn parser_ready(&self) -> bool {
        self.parser_ready
    }

    pub fn channel_kind(&self, channel: ChannelId) -> Option<ChannelKind> {
        self.channels.kind(channel)
    }

    /// Dispatch whatever complete frames are buffered, then read from
    /// the UART once and dispatch again. Returns without reading while
    /// an AT payload is pending.
    pub async fn pump<H: EdmHandler>(&mut self, handler: &mut H) -> Result<(), Error> {
        self.drain_window(handler);
        if !self.parser_ready {
            return Ok(());
        }
        let spare = self.window.capacity() - self.window.len();
        let mut chunk = [0u8; 256];
        let want = spare.min(chunk.len());
        if want == 0 {
            return Ok(());
        }
        let n = self
            .rx
            .read(&mut chunk[..want])
            .await
            .map_err(|_| Error::Uart)?;
        // Cannot fail, `n` fits the remaining capacity.
        let _ = self.window.extend_from_slice(&chunk[..n]);
        self.drain_window(handler);
        Ok(())
    }

    fn drain_window<H: EdmHandler>(&mut self, handler: &mut H) {
        let mut offset = 0;
        {
            let Self {
                channels,
                at_response,
                parser_ready,
                window,
                ..
            } = self;
            while *parser_ready {
                match digest::scan(&window[offset..]) {
                    Scan::None { consumed: 0 } => break,
                    Scan::None { consumed } => {
                        // Garbage or a false start byte trimmed; rescan.
                        offset += consumed;
                    }
                    Scan::Frame { start, end } => {
                        let frame = &window[offset + start..offset + end];
                        Self::dispatch(channels, at_response, parser_ready, frame, handler);
                        offset += end;
                    }
                }
            }
        }
        self.consume(offset);
    }

    fn consume(&mut self, n: usize) {
        if n == 0 {
            return;
        }
        let len = self.window.len();
        self.window.copy_within(n..len, 0);
        self.window.truncate(len - n);
    }

    fn dispatch<H: EdmHandler>(
        channels: &mut ChannelTable,
        at_response: &mut RingBuffer<AT_RING>,
        parser_ready: &mut bool,
        frame: &[u8],
        handler: &mut H,
    ) {
        match PayloadType::from(frame[4]) {
            PayloadType::ATConfirmation | PayloadType::ATEvent => {
                let payload_len = calc_payload_len(frame);
                let payload = &frame[AT_COMMAND_POSITION..PAYLOAD_POSITION + payload_len];
                if !at_response.add(payload) {
                    warn!("AT response buffer full, {} bytes dropped", payload.len());
                    return;
                }
                *parser_ready = false;
                handler.on_at_data_available(payload.len());
            }
            _ => match EdmEvent::parse(frame) {
                Some(EdmEvent::BluetoothConnectEvent(event)) => {
                    let kind = ChannelKind::Bt {
                        frame_size: event.frame_size,
                    };
                    if channels.allocate(event.channel_id, kind).is_err() {
                        warn!("channel table full, connect on {} dropped", event.channel_id.0);
                        return;
                    }
                    handler.on_bt_connect(&event);
                }
                Some(EdmEvent::IPv4ConnectEvent(event)) => {
                    let kind = Self::ip_kind(event.local_port, event.protocol);
                    if channels.allocate(event.channel_id, kind).is_err() {
                        warn!("channel table full, connect on {} dropped", event.channel_id.0);
                        return;
                    }
                    match kind {
                        ChannelKind::Mqtt => handler.on_mqtt_connect(event.channel_id),
                        _ => handler.on_ipv4_connect(&event),
                    }
                }
                Some(EdmEvent::IPv6ConnectEvent(event)) => {
                    let kind = Self::ip_kind(event.local_port, event.protocol);
                    if channels.allocate(event.channel_id, kind).is_err() {
                        warn!("channel table full, connect on {} dropped", event.channel_id.0);
                        return;
                    }
                    match kind {
                        ChannelKind::Mqtt => handler.on_mqtt_connect(event.channel_id),
                        _ => handler.on_ipv6_connect(&event),
                    }
                }
                Some(EdmEvent::DisconnectEvent(channel)) => match channels.release(channel) {
                    Some(ChannelKind::Bt { .. }) => handler.on_bt_disconnect(channel),
                    Some(ChannelKind::Ip { .. }) => handler.on_ip_disconnect(channel),
                    Some(ChannelKind::Mqtt) => handler.on_mqtt_disconnect(channel),
                    Some(ChannelKind::Invalid) => {}
                    None => warn!("disconnect on unknown channel {}", channel.0),
                },
                Some(EdmEvent::DataEvent(event)) => {
                    match channels.kind(event.channel_id) {
                        Some(ChannelKind::Bt { .. }) => {
                            handler.on_bt_data(event.channel_id, &event.data)
                        }
                        Some(ChannelKind::Ip { .. }) => {
                            handler.on_ip_data(event.channel_id, &event.data)
                        }
                        Some(ChannelKind::Mqtt) => {
                            handler.on_mqtt_data(event.channel_id, &event.data)
                        }
                        Some(ChannelKind::Invalid) | None => {
                            warn!(
                                "{} bytes on unusable channel {} dropped",
                                event.data.len(),
                                event.channel_id.0
                            );
                        }
                    }
                }
                Some(EdmEvent::StartUp) => handler.on_startup(),
                Some(EdmEvent::ATEvent(_)) | None => {
                    warn!("unparseable frame dropped");
                }
            },
        }
    }

    fn ip_kind(local_port: u16, protocol: Protocol) -> ChannelKind {
        match protocol {
            Protocol::TCP | Protocol::UDP => ChannelKind::Ip {
                local_port,
                protocol,
            },
            Protocol::MQTT => ChannelKind::Mqtt,
            Protocol::Unknown => ChannelKind::Invalid,
        }
    }

    /// Drain buffered AT bytes. Once empty the parser is released to
    /// accept further UART input.
    pub fn at_read(&mut self, buf: &mut [u8]) -> usize {
        let n = self.at_response.read(buf);
        if self.at_response.data_size() == 0 {
            self.processed_event();
        }
        n
    }

    /// Mark the pending event as consumed; parsing resumes on the next
    /// [`pump`](Self::pump).
    pub fn processed_event(&mut self) {
        self.parser_ready = true;
    }

    /// Send `data` on a live channel, chunked to the negotiated frame
    /// size on Bluetooth channels. Returns the bytes sent, which is
    /// short of `data.len()` when the deadline elapses first.
    pub async fn write_channel(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        timeout: Duration,
    ) -> Result<usize, Error> {
        // Largest chunk the 12-bit length field can carry in one frame.
        const CHUNK_MAX: usize = EDM_FULL_SIZE_FILTER as usize - 3;

        let kind = self.channels.kind(channel).ok_or(Error::NotFound)?;
        let frame_cap = match kind {
            ChannelKind::Bt { frame_size } if frame_size > 0 => {
                (frame_size as usize).min(CHUNK_MAX)
            }
            _ => CHUNK_MAX,
        };
        let deadline = Instant::now() + timeout;
        let mut sent = 0;

        while sent < data.len() {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            let chunk = (data.len() - sent).min(frame_cap);
            let mut head = [0u8; DATA_HEAD_SIZE];
            data_head(channel, chunk, &mut head);

            let tx = &mut self.tx;
            let io = async {
                tx.write_all(&head).await?;
                tx.write_all(&data[sent..sent + chunk]).await?;
                tx.write_all(&[ENDBYTE]).await
            };
            match with_timeout(deadline - now, io).await {
                Ok(Ok(())) => sent += chunk,
                Ok(Err(_)) => return Err(Error::Uart),
                Err(_) => break,
            }
        }
        Ok(sent)
    }

    /// Drop all channel and parser state, e.g. around a module reset.
    pub fn close(&mut self) {
        self.channels.clear();
        self.at_response.flush();
        self.window.clear();
        self.parser_ready = true;
    }
}
