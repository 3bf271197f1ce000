//! Frame digester feeding the AT ingress.
//!
//! Splits the raw UART byte stream into whole frames, resynchronising on
//! the start byte, and routes AT confirmations to the response channel
//! and everything else to the URC channel. The consumers get the whole
//! frame; [`super::EdmAtCmdWrapper`] and [`super::urc::EdmEvent`] strip
//! the envelope themselves.

use atat::{DigestResult, Digester, InternalError};

use super::calc_payload_len;
use super::types::{PayloadType, AT_COMMAND_POSITION, EDM_OVERHEAD, ENDBYTE, STARTBYTE};

/// One step of frame hunting over a byte window.
pub(crate) enum Scan {
    /// No complete frame; discard `consumed` leading bytes and wait.
    None { consumed: usize },
    /// A complete frame occupies `window[start..end]`.
    Frame { start: usize, end: usize },
}

/// Locate the next complete frame, trimming leading garbage and
/// resynchronising past corrupt frames.
pub(crate) fn scan(window: &[u8]) -> Scan {
    let Some(start) = window.iter().position(|&b| b == STARTBYTE) else {
        return Scan::None {
            consumed: window.len(),
        };
    };
    if window.len() - start < EDM_OVERHEAD {
        return Scan::None { consumed: start };
    }
    let payload_len = calc_payload_len(&window[start..]);
    if payload_len < 2 {
        // Too short to carry the two-byte payload type field, so this
        // cannot be a frame boundary. Drop the false start byte.
        return Scan::None { consumed: start + 1 };
    }
    let end = start + payload_len + EDM_OVERHEAD;
    if window.len() < end {
        return Scan::None { consumed: start };
    }
    if window[end - 1] != ENDBYTE {
        // Not a frame boundary after all. Drop the false start byte and
        // let the next pass hunt from the following one.
        return Scan::None { consumed: start + 1 };
    }
    Scan::Frame { start, end }
}

#[derive(Debug, Default)]
pub struct EdmDigester;

impl Digester for EdmDigester {
    fn digest<'a>(&mut self, input: &'a [u8]) -> (DigestResult<'a>, usize) {
        let (start, end) = match scan(input) {
            Scan::None { consumed } => return (DigestResult::None, consumed),
            Scan::Frame { start, end } => (start, end),
        };
        let frame = &input[start..end];

        let result = match PayloadType::from(frame[4]) {
            PayloadType::ATConfirmation => {
                let is_error = frame
                    .windows(b"ERROR".len())
                    .skip(AT_COMMAND_POSITION)
                    .any(|window| window == b"ERROR");
                if is_error {
                    DigestResult::Response(Err(InternalError::InvalidResponse))
                } else {
                    DigestResult::Response(Ok(frame))
                }
            }
            PayloadType::ATEvent
            | PayloadType::ConnectEvent
            | PayloadType::DisconnectEvent
            | PayloadType::DataEvent
            | PayloadType::StartEvent => DigestResult::Urc(frame),
            _ => {
                warn!("unexpected payload type {}, frame dropped", frame[4]);
                DigestResult::None
            }
        };
        (result, end)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn at_confirmation_is_a_response() {
        let frame = &[
            0xAA, 0x00, 0x06, 0x00, 0x45, 0x0D, 0x0A, 0x4F, 0x4B, 0x55,
        ];
        let mut digester = EdmDigester;
        let (result, consumed) = digester.digest(frame);
        assert_eq!(result, DigestResult::Response(Ok(&frame[..])));
        assert_eq!(consumed, frame.len());
    }

    #[test]
    fn error_confirmation_is_an_invalid_response() {
        // "\r\nERROR\r\n"
        let frame = &[
            0xAA, 0x00, 0x0B, 0x00, 0x45, 0x0D, 0x0A, 0x45, 0x52, 0x52, 0x4F, 0x52, 0x0D, 0x0A,
            0x55,
        ];
        let mut digester = EdmDigester;
        let (result, consumed) = digester.digest(frame);
        assert_eq!(
            result,
            DigestResult::Response(Err(InternalError::InvalidResponse))
        );
        assert_eq!(consumed, frame.len());
    }

    #[test]
    fn events_are_urcs() {
        let disconnect = &[0xAA, 0x00, 0x03, 0x00, 0x21, 0x03, 0x55];
        let mut digester = EdmDigester;
        let (result, consumed) = digester.digest(disconnect);
        assert_eq!(result, DigestResult::Urc(&disconnect[..]));
        assert_eq!(consumed, disconnect.len());

        let start = &[0xAA, 0x00, 0x02, 0x00, 0x71, 0x55];
        let (result, consumed) = digester.digest(start);
        assert_eq!(result, DigestResult::Urc(&start[..]));
        assert_eq!(consumed, start.len());
    }

    #[test]
    fn leading_garbage_is_trimmed() {
        let mut buf = std::vec![0x01, 0x02, 0x03];
        buf.extend_from_slice(&[0xAA, 0x00, 0x03, 0x00, 0x21, 0x07, 0x55]);
        let mut digester = EdmDigester;

        let (result, consumed) = digester.digest(&buf);
        assert_eq!(result, DigestResult::Urc(&buf[3..]));
        assert_eq!(consumed, buf.len());
    }

    #[test]
    fn partial_frame_waits() {
        let frame = &[0xAA, 0x00, 0x03, 0x00, 0x21, 0x03, 0x55];
        let mut digester = EdmDigester;
        for cut in 1..frame.len() {
            let (result, consumed) = digester.digest(&frame[..cut]);
            assert_eq!(result, DigestResult::None, "cut {cut}");
            assert_eq!(consumed, 0, "cut {cut}");
        }
    }

    #[test]
    fn undersized_length_field_resyncs() {
        // Length field claims an empty payload, so the bytes cannot be a
        // frame even though they begin and end with the framing bytes.
        let mut buf = std::vec![0xAA, 0x00, 0x00, 0x55];
        buf.extend_from_slice(&[0xAA, 0x00, 0x03, 0x00, 0x21, 0x03, 0x55]);
        let mut digester = EdmDigester;

        let (result, consumed) = digester.digest(&buf);
        assert_eq!(result, DigestResult::None);
        assert_eq!(consumed, 1);

        let (result, consumed) = digester.digest(&buf[1..]);
        assert_eq!(result, DigestResult::Urc(&buf[4..]));
        assert_eq!(consumed, buf.len() - 1);
    }

    #[test]
    fn false_start_byte_resyncs() {
        // A start byte whose claimed frame does not end in the end byte,
        // followed by a real frame.
        let mut buf = std::vec![0xAA, 0x00, 0x01, 0x00, 0x99];
        buf.extend_from_slice(&[0xAA, 0x00, 0x03, 0x00, 0x21, 0x03, 0x55]);
        let mut digester = EdmDigester;

        let (result, consumed) = digester.digest(&buf);
        assert_eq!(result, DigestResult::None);
        assert_eq!(consumed, 1);

        let (result, consumed) = digester.digest(&buf[1..]);
        assert_eq!(result, DigestResult::Urc(&buf[5..]));
        assert_eq!(consumed, buf.len() - 1);
    }
}
