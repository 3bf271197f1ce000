#![cfg_attr(not(test), no_std)]
#![allow(async_fn_in_trait)]

mod fmt;

pub mod addr;
pub mod c2c;
pub mod config;
pub mod edm;
pub mod error;
pub mod eventq;
pub mod gatt;
pub mod ringbuf;
pub mod sps;

#[cfg(test)]
mod test_helpers;

pub use atat;
