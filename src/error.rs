/// Errors returned across the crate's public API.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error {
    /// An argument was out of range or otherwise unusable.
    InvalidParameter,
    /// A fixed pool (connections, handles, subscriptions) is exhausted,
    /// or the destination buffer cannot take the data.
    NoMemory,
    /// No entry matches the given handle or address.
    NotFound,
    /// The peer or the module violated the expected protocol.
    Protocol,
    /// A non-blocking producer found the queue full.
    Busy,
    /// The underlying serial transport failed.
    Uart,
    /// The operation is not valid in the current link state.
    InvalidState,
    /// The BLE stack rejected or failed the request.
    Gatt(GattError),
}

/// Failure detail reported by the GATT driver.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum GattError {
    /// Connection establishment failed or the link dropped mid-operation.
    ConnectionFailed,
    /// The ATT request was rejected by the peer.
    RequestRejected,
    /// The referenced attribute does not exist on the peer.
    AttributeNotFound,
    /// The driver cannot take another request right now.
    DriverBusy,
}

impl From<GattError> for Error {
    fn from(e: GattError) -> Self {
        Error::Gatt(e)
    }
}
