//! Chip-to-chip secure framing.
//!
//! AT traffic between the host and a cellular module travels in
//! HDLC-delimited frames (see [`frame`]) whose body is AES-128-CBC
//! encrypted and MAC'd. Two body formats exist:
//!
//! - version 1: `AES(key, IV, pad(plain) || SHA256(pad(plain))) || IV`
//! - version 2: `IV || AES(key, IV, pad(plain)) ||
//!   trunc16(HMAC-SHA256(hmac_key, IV || ct || te_secret))`
//!
//! Padding is RFC 5652 style: one to sixteen bytes, each equal to the
//! pad count, so the padded form is always strictly longer than the
//! plaintext. [`C2cCodec`] is the pure frame codec; [`C2cWriter`] and
//! [`C2cReader`] sit between the AT client and the UART, encrypting on
//! the way out and decrypting on the way in.

pub mod frame;

use aes::cipher::block_padding::NoPadding;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use embedded_io_async::{Read, Write};
use heapless::Vec;
use hmac::{Hmac, Mac};
use rand_core::RngCore;
use sha2::{Digest, Sha256};

use crate::config::{C2C_HMAC_TAG_LENGTH_BYTES, C2C_IV_LENGTH_BYTES, C2C_USER_MAX_LENGTH_BYTES};
use crate::error::Error;
use frame::{FrameSearch, FRAME_OVERHEAD};

type Aes128CbcEnc = cbc::Encryptor<aes::Aes128>;
type Aes128CbcDec = cbc::Decryptor<aes::Aes128>;
type HmacSha256 = Hmac<Sha256>;

const IV_LEN: usize = C2C_IV_LENGTH_BYTES;
const TAG_LEN: usize = C2C_HMAC_TAG_LENGTH_BYTES;
const SHA256_LEN: usize = 32;
const BLOCK: usize = 16;

/// Largest plaintext whose padded form still fits one frame body.
pub const TX_CHUNK_MAX: usize = C2C_USER_MAX_LENGTH_BYTES - 1;

/// Largest ciphertext run a decoder has to buffer (version 1 embeds the
/// SHA-256 inside the ciphertext).
const CIPHERTEXT_MAX: usize = C2C_USER_MAX_LENGTH_BYTES + SHA256_LEN;

/// Largest complete frame the codec can produce.
pub const ENCODED_MAX: usize = FRAME_OVERHEAD + IV_LEN + CIPHERTEXT_MAX;

const _: () = assert!(C2C_USER_MAX_LENGTH_BYTES % BLOCK == 0);

/// Key material shared by both directions of a chip-to-chip session.
#[derive(Clone)]
pub struct C2cKeys {
    pub key: [u8; 16],
    pub hmac_key: [u8; 32],
    /// Terminal-equipment secret mixed into the version 2 MAC.
    pub te_secret: [u8; 32],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum C2cVersion {
    V1,
    V2,
}

/// One step of [`C2cCodec::decode`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decoded {
    /// No complete frame in the window yet.
    None,
    /// A frame was skipped after failing the FCS or integrity check.
    Dropped,
    /// A frame decoded; the plaintext length is attached.
    Plaintext(usize),
}

pub struct C2cCodec {
    keys: C2cKeys,
    version: C2cVersion,
}

fn padded_len(n: usize) -> usize {
    (n / BLOCK + 1) * BLOCK
}

fn apply_pad(buf: &mut [u8], plain_len: usize) {
    let pad = buf.len() - plain_len;
    for byte in &mut buf[plain_len..] {
        *byte = pad as u8;
    }
}

fn unpad(padded: &[u8]) -> Result<usize, Error> {
    let pad = *padded.last().ok_or(Error::Protocol)? as usize;
    if pad == 0 || pad > BLOCK || pad > padded.len() {
        return Err(Error::Protocol);
    }
    if padded[padded.len() - pad..].iter().any(|&b| b != pad as u8) {
        return Err(Error::Protocol);
    }
    Ok(padded.len() - pad)
}

impl C2cCodec {
    pub fn new(keys: C2cKeys, version: C2cVersion) -> Self {
        Self { keys, version }
    }

    pub fn version(&self) -> C2cVersion {
        self.version
    }

    fn v2_tag(&self, iv_and_ct: &[u8]) -> Result<[u8; TAG_LEN], Error> {
        let mut mac =
            HmacSha256::new_from_slice(&self.keys.hmac_key).map_err(|_| Error::InvalidParameter)?;
        mac.update(iv_and_ct);
        mac.update(&self.keys.te_secret);
        let full = mac.finalize().into_bytes();
        let mut tag = [0u8; TAG_LEN];
        tag.copy_from_slice(&full[..TAG_LEN]);
        Ok(tag)
    }

    /// Encrypt `plain` into one complete frame in `out`, using the given
    /// IV. Returns the frame length.
    pub fn encode(&self, iv: &[u8; IV_LEN], plain: &[u8], out: &mut [u8]) -> Result<usize, Error> {
        if plain.len() > TX_CHUNK_MAX {
            return Err(Error::InvalidParameter);
        }
        let padded = padded_len(plain.len());

        match self.version {
            C2cVersion::V1 => {
                let ct_len = padded + SHA256_LEN;
                let body_len = ct_len + IV_LEN;
                if out.len() < body_len + FRAME_OVERHEAD {
                    return Err(Error::NoMemory);
                }
                let body = &mut out[3..3 + body_len];
                body[..plain.len()].copy_from_slice(plain);
                apply_pad(&mut body[..padded], plain.len());
                let digest = Sha256::digest(&body[..padded]);
                body[padded..ct_len].copy_from_slice(&digest);
                Aes128CbcEnc::new((&self.keys.key).into(), iv.into())
                    .encrypt_padded_mut::<NoPadding>(&mut body[..ct_len], ct_len)
                    .map_err(|_| Error::InvalidParameter)?;
                body[ct_len..body_len].copy_from_slice(iv);
                Ok(frame::seal(out, body_len))
            }
            C2cVersion::V2 => {
                let ct_len = padded;
                let body_len = IV_LEN + ct_len + TAG_LEN;
                if out.len() < body_len + FRAME_OVERHEAD {
                    return Err(Error::NoMemory);
                }
                let body = &mut out[3..3 + body_len];
                body[..IV_LEN].copy_from_slice(iv);
                body[IV_LEN..IV_LEN + plain.len()].copy_from_slice(plain);
                apply_pad(&mut body[IV_LEN..IV_LEN + padded], plain.len());
                Aes128CbcEnc::new((&self.keys.key).into(), iv.into())
                    .encrypt_padded_mut::<NoPadding>(&mut body[IV_LEN..IV_LEN + ct_len], ct_len)
                    .map_err(|_| Error::InvalidParameter)?;
                let tag = self.v2_tag(&body[..IV_LEN + ct_len])?;
                body[IV_LEN + ct_len..body_len].copy_from_slice(&tag);
                Ok(frame::seal(out, body_len))
            }
        }
    }

    /// Check and decrypt one frame body into `out`. Returns the
    /// plaintext length; `out` must hold at least `body.len()` bytes.
    pub fn decode_body(&self, body: &[u8], out: &mut [u8]) -> Result<usize, Error> {
        match self.version {
            C2cVersion::V1 => {
                if body.len() < IV_LEN + BLOCK + SHA256_LEN
                    || (body.len() - IV_LEN) % BLOCK != 0
                {
                    return Err(Error::Protocol);
                }
                let ct_len = body.len() - IV_LEN;
                let (ct, iv) = body.split_at(ct_len);
                if out.len() < ct_len {
                    return Err(Error::NoMemory);
                }
                out[..ct_len].copy_from_slice(ct);
                let iv: &[u8; IV_LEN] = iv.try_into().map_err(|_| Error::Protocol)?;
                Aes128CbcDec::new((&self.keys.key).into(), iv.into())
                    .decrypt_padded_mut::<NoPadding>(&mut out[..ct_len])
                    .map_err(|_| Error::Protocol)?;
                let padded = ct_len - SHA256_LEN;
                let digest = Sha256::digest(&out[..padded]);
                if digest.as_slice() != &out[padded..ct_len] {
                    return Err(Error::Protocol);
                }
                unpad(&out[..padded])
            }
            C2cVersion::V2 => {
                if body.len() < IV_LEN + BLOCK + TAG_LEN
                    || (body.len() - IV_LEN - TAG_LEN) % BLOCK != 0
                {
                    return Err(Error::Protocol);
                }
                let ct_len = body.len() - IV_LEN - TAG_LEN;
                let tag = self.v2_tag(&body[..IV_LEN + ct_len])?;
                if tag != body[IV_LEN + ct_len..] {
                    return Err(Error::Protocol);
                }
                if out.len() < ct_len {
                    return Err(Error::NoMemory);
                }
                out[..ct_len].copy_from_slice(&body[IV_LEN..IV_LEN + ct_len]);
                let iv: &[u8; IV_LEN] = body[..IV_LEN].try_into().map_err(|_| Error::Protocol)?;
                Aes128CbcDec::new((&self.keys.key).into(), iv.into())
                    .decrypt_padded_mut::<NoPadding>(&mut out[..ct_len])
                    .map_err(|_| Error::Protocol)?;
                unpad(&out[..ct_len])
            }
        }
    }

    /// Scan `window` for one frame and decode it into `out`. Returns the
    /// outcome and the number of leading window bytes to discard.
    ///
    /// Frames that fail the FCS or the integrity check are logged and
    /// reported as [`Decoded::Dropped`]; the stream stays in sync.
    pub fn decode(&self, window: &[u8], out: &mut [u8]) -> (Decoded, usize) {
        match frame::find_frame(window) {
            FrameSearch::Incomplete { consumed } => (Decoded::None, consumed),
            FrameSearch::Bad { consumed } => {
                warn!("c2c frame failed FCS check, dropped");
                (Decoded::Dropped, consumed)
            }
            FrameSearch::Frame { body, consumed } => match self.decode_body(body, out) {
                Ok(n) => (Decoded::Plaintext(n), consumed),
                Err(_) => {
                    warn!("c2c frame failed integrity check, dropped");
                    (Decoded::Dropped, consumed)
                }
            },
        }
    }
}

/// Transmit intercept: accumulates outgoing AT bytes and emits one
/// encrypted frame per flush, or earlier when the accumulator fills.
///
/// Sits between the AT client and the UART writer. Encode failures are
/// logged and the buffered bytes discarded, so the AT client never
/// retries forever against a broken transport.
pub struct C2cWriter<W: Write, R: RngCore> {
    inner: W,
    codec: C2cCodec,
    rng: R,
    input: Vec<u8, TX_CHUNK_MAX>,
    scratch: [u8; ENCODED_MAX],
}

impl<W: Write, R: RngCore> C2cWriter<W, R> {
    pub fn new(inner: W, codec: C2cCodec, rng: R) -> Self {
        Self {
            inner,
            codec,
            rng,
            input: Vec::new(),
            scratch: [0; ENCODED_MAX],
        }
    }

    pub fn release(self) -> W {
        self.inner
    }

    async fn emit(&mut self) -> Result<(), W::Error> {
        let mut iv = [0u8; IV_LEN];
        self.rng.fill_bytes(&mut iv);
        match self.codec.encode(&iv, &self.input, &mut self.scratch) {
            Ok(n) => self.inner.write_all(&self.scratch[..n]).await?,
            Err(_) => error!("c2c encode failed, {} buffered bytes dropped", self.input.len()),
        }
        self.input.clear();
        Ok(())
    }
}

impl<W: Write, R: RngCore> embedded_io_async::ErrorType for C2cWriter<W, R> {
    type Error = W::Error;
}

impl<W: Write, R: RngCore> Write for C2cWriter<W, R> {
    async fn write(&mut self, buf: &[u8]) -> Result<usize, Self::Error> {
        if buf.is_empty() {
            return Ok(0);
        }
        if self.input.is_full() {
            self.emit().await?;
        }
        let room = self.input.capacity() - self.input.len();
        let take = buf.len().min(room);
        // Cannot fail, `take` fits the remaining capacity.
        let _ = self.input.extend_from_slice(&buf[..take]);
        if self.input.is_full() {
            self.emit().await?;
        }
        Ok(take)
    }

    async fn flush(&mut self) -> Result<(), Self::Error> {
        if !self.input.is_empty() {
            self.emit().await?;
        }
        self.inner.flush().await
    }
}

/// Window the receive intercept keeps while hunting for frame
/// boundaries. Two frames deep so a complete frame always fits behind a
/// partial one.
const RX_WINDOW: usize = 2 * ENCODED_MAX;

/// Receive intercept: consumes the encrypted UART stream and yields the
/// decrypted AT bytes.
///
/// Bad frames are skipped internally; `read` only ever returns plaintext
/// from frames that passed both checks.
pub struct C2cReader<R: Read> {
    inner: R,
    codec: C2cCodec,
    window: Vec<u8, RX_WINDOW>,
    plain: [u8; CIPHERTEXT_MAX],
    plain_len: usize,
    plain_off: usize,
}

impl<R: Read> C2cReader<R> {
    pub fn new(inner: R, codec: C2cCodec) -> Self {
        Self {
            inner,
            codec,
            window: Vec::new(),
            plain: [0; CIPHERTEXT_MAX],
            plain_len: 0,
            plain_off: 0,
        }
    }

    pub fn release(self) -> R {
        self.inner
    }

    fn consume(&mut self, n: usize) {
        if n == 0 {
            return;
        }
        let len = self.window.len();
        self.window.copy_within(n..len, 0);
        self.window.truncate(len - n);
    }

    /// Run the decoder over the buffered window until it produces a
    /// plaintext or runs dry.
    fn decode_window(&mut self) -> bool {
        loop {
            let (decoded, consumed) = self.codec.decode(&self.window, &mut self.plain);
            self.consume(consumed);
            match decoded {
                Decoded::Plaintext(n) => {
                    self.plain_len = n;
                    self.plain_off = 0;
                    return true;
                }
                Decoded::Dropped => continue,
                Decoded::None => return false,
            }
        }
    }
}

impl<R: Read> embedded_io_async::ErrorType for C2cReader<R> {
    type Error = R::Error;
}

impl<R: Read> Read for C2cReader<R> {
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, Self::Error> {
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            if self.plain_off < self.plain_len {
                let n = buf.len().min(self.plain_len - self.plain_off);
                buf[..n].copy_from_slice(&self.plain[self.plain_off..self.plain_off + n]);
                self.plain_off += n;
                return Ok(n);
            }
            if self.decode_window() {
                continue;
            }
            let spare = self.window.capacity() - self.window.len();
            let mut chunk = [0u8; 128];
            let want = spare.min(chunk.len());
            let n = self.inner.read(&mut chunk[..want]).await?;
            if n == 0 {
                return Ok(0);
            }
            // Cannot fail, `n` fits the remaining capacity.
            let _ = self.window.extend_from_slice(&chunk[..n]);
        }
    }
}
