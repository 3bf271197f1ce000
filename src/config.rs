//! Compile-time sizing shared across the crate.
//!
//! Types that own pools or buffers take their sizes as const generics; the
//! constants here are the defaults a typical module integration uses, and
//! the fixed protocol figures that are not negotiable.

/// Concurrent SPS connections a link instance manages.
pub const SPS_MAX_CONNECTIONS: usize = 2;

/// Receive buffer per SPS connection, in bytes.
pub const SPS_BUFFER_SIZE: usize = 1024;

/// Deadline for [`crate::sps::SpsLink::send`] when the caller passes no
/// explicit timeout.
pub const SPS_DEFAULT_SEND_TIMEOUT_MS: u64 = 500;

/// ATT MTU a client-role SPS link asks for after discovery.
pub const SPS_MTU_REQUEST: u16 = 247;

/// Largest plaintext chunk the C2C framer accepts into one frame.
pub const C2C_USER_MAX_LENGTH_BYTES: usize = 1024;

/// AES-CBC initialisation vector length.
pub const C2C_IV_LENGTH_BYTES: usize = 16;

/// Truncated HMAC tag carried by version 2 frames.
pub const C2C_HMAC_TAG_LENGTH_BYTES: usize = 16;

/// Upper bound of the RFC 5652 padding added before encryption.
pub const C2C_MAX_PAD_LENGTH_BYTES: usize = 16;

/// Channel table entries in the EDM stream. The protocol carries the
/// channel id in a single byte but the modules use at most this many.
pub const EDM_STREAM_MAX_CONNECTIONS: usize = 9;

/// Longest AT command accepted for wrapping into an EDM request frame.
pub const EDM_STREAM_AT_COMMAND_LENGTH: usize = 200;

/// AT response bytes buffered between the stream and the AT client.
pub const EDM_STREAM_AT_RESPONSE_LENGTH: usize = 500;

/// Concurrent GATT connections in the port's pool.
pub const GATT_MAX_CONNECTIONS: usize = 2;

/// User-published GATT services.
pub const GATT_MAX_USER_SERVICES: usize = 2;

/// Attribute handles a published service table may span.
pub const GATT_MAX_ATTRIBUTES: usize = 16;

/// Characteristics across all published services.
pub const GATT_MAX_CHARACTERISTICS: usize = 8;

/// Client-side characteristic subscriptions.
pub const GATT_MAX_SUBSCRIPTIONS: usize = 8;

/// Upper bound on the read-handle pool of a [`crate::ringbuf::RingBuffer`].
pub const RING_BUFFER_MAX_HANDLES: usize = 4;

/// Largest event payload an [`crate::eventq::EventQueue`] will carry.
/// Enforced at compile time against `size_of::<T>()`.
pub const EVENT_QUEUE_PARAM_MAX_LEN: usize = 128;

/// ATT MTU every connection starts from before an exchange.
pub const ATT_DEFAULT_MTU: u16 = 23;
