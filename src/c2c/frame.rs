//! HDLC-style outer framing for the chip-to-chip transport.
//!
//! `0xF9 | len_le_u16 | body | fcs_le_u16 | 0xF9`. The FCS is the
//! RFC 1662 CRC-16 over `len || body`, ones-complemented, transmitted
//! little-endian. Everything here is byte-window in, byte-window out;
//! the crypto lives one level up.

use crate::config::{
    C2C_IV_LENGTH_BYTES, C2C_MAX_PAD_LENGTH_BYTES, C2C_USER_MAX_LENGTH_BYTES,
};

pub const FLAG: u8 = 0xF9;

/// Opening flag, two length bytes, two FCS bytes, closing flag.
pub const FRAME_OVERHEAD: usize = 6;

/// SHA-256 embedded by the version 1 body, the larger of the two MACs.
const MAC_MAX: usize = 32;

/// Largest body length a well-formed frame can carry. Anything bigger in
/// the length field means we are not looking at a real frame.
pub const CHUNK_LENGTH_LIMIT: usize =
    C2C_USER_MAX_LENGTH_BYTES + C2C_IV_LENGTH_BYTES + MAC_MAX + C2C_MAX_PAD_LENGTH_BYTES;

/// RFC 1662 FCS over `data`, final complement included.
pub fn fcs(data: &[u8]) -> u16 {
    let mut crc: u16 = 0xFFFF;
    for &byte in data {
        crc ^= byte as u16;
        for _ in 0..8 {
            crc = if crc & 1 != 0 {
                (crc >> 1) ^ 0x8408
            } else {
                crc >> 1
            };
        }
    }
    !crc
}

/// Wrap `body` into a complete frame in `out`. Returns the frame length.
///
/// `out` must hold `body.len() + FRAME_OVERHEAD` bytes.
pub fn wrap(body: &[u8], out: &mut [u8]) -> usize {
    let len = body.len();
    out[0] = FLAG;
    out[1..3].copy_from_slice(&(len as u16).to_le_bytes());
    out[3..3 + len].copy_from_slice(body);
    seal(out, len)
}

/// Finish a frame whose body is already in place at `out[3..3 + len]`:
/// write the flags, the length field and the FCS. Returns the frame
/// length.
pub fn seal(out: &mut [u8], len: usize) -> usize {
    out[0] = FLAG;
    out[1..3].copy_from_slice(&(len as u16).to_le_bytes());
    let check = fcs(&out[1..3 + len]);
    out[3 + len..5 + len].copy_from_slice(&check.to_le_bytes());
    out[5 + len] = FLAG;
    len + FRAME_OVERHEAD
}

/// Outcome of scanning a receive window for one frame.
///
/// `consumed` is the number of leading window bytes the caller must
/// discard before the next scan; for `Frame` it covers the frame itself
/// including whatever garbage preceded it.
#[derive(Debug, PartialEq, Eq)]
pub enum FrameSearch<'a> {
    /// A complete frame with a valid FCS. `body` borrows from the window.
    Frame { body: &'a [u8], consumed: usize },
    /// A complete frame that failed the FCS or end-flag check.
    Bad { consumed: usize },
    /// No complete frame yet; discard `consumed` bytes and wait for more.
    Incomplete { consumed: usize },
}

/// Scan `window` for the next frame, resynchronising on the flag byte.
///
/// A length field above [`CHUNK_LENGTH_LIMIT`] marks a false start: the
/// scan moves to the next flag byte. With the `c2c-coalesced-flags`
/// feature, a flag pair found while rescanning is taken as a closing
/// flag directly followed by an opening one, and the closing flag is
/// skipped.
pub fn find_frame(window: &[u8]) -> FrameSearch<'_> {
    let Some(mut pos) = window.iter().position(|&b| b == FLAG) else {
        return FrameSearch::Incomplete {
            consumed: window.len(),
        };
    };

    loop {
        if window.len() - pos < 3 {
            return FrameSearch::Incomplete { consumed: pos };
        }
        let len = u16::from_le_bytes([window[pos + 1], window[pos + 2]]) as usize;
        if len > CHUNK_LENGTH_LIMIT {
            match window[pos + 1..].iter().position(|&b| b == FLAG) {
                Some(offset) => {
                    let mut next = pos + 1 + offset;
                    #[cfg(feature = "c2c-coalesced-flags")]
                    if window.get(next + 1) == Some(&FLAG) {
                        next += 1;
                    }
                    pos = next;
                    continue;
                }
                None => {
                    return FrameSearch::Incomplete {
                        consumed: window.len(),
                    }
                }
            }
        }
        if window.len() - pos < len + FRAME_OVERHEAD {
            return FrameSearch::Incomplete { consumed: pos };
        }

        let end = pos + len + FRAME_OVERHEAD;
        let stored = u16::from_le_bytes([window[pos + 3 + len], window[pos + 4 + len]]);
        if window[end - 1] != FLAG || fcs(&window[pos + 1..pos + 3 + len]) != stored {
            return FrameSearch::Bad { consumed: end };
        }
        return FrameSearch::Frame {
            body: &window[pos + 3..pos + 3 + len],
            consumed: end,
        };
    }
}
