//! Bluetooth device addresses in the module's printable form.
//!
//! The modules print addresses as twelve hex digits, most significant byte
//! first, with an optional `p`/`r` suffix selecting public or random
//! address type. In memory the bytes are kept in air order, so the string
//! order is reversed on parse and again on format.

use core::fmt::Write;
use core::str::FromStr;

use crate::error::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum AddressType {
    #[default]
    Public,
    Random,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct BdAddress {
    pub bytes: [u8; 6],
    pub kind: AddressType,
}

impl BdAddress {
    pub const fn new(bytes: [u8; 6], kind: AddressType) -> Self {
        Self { bytes, kind }
    }

    /// Printable form, e.g. `0012F398DD12p`.
    pub fn format(&self) -> heapless::String<13> {
        let mut s = heapless::String::new();
        for b in self.bytes.iter().rev() {
            write!(s, "{:02X}", b).ok();
        }
        s.push(match self.kind {
            AddressType::Public => 'p',
            AddressType::Random => 'r',
        })
        .ok();
        s
    }
}

fn hex_val(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

impl FromStr for BdAddress {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.as_bytes();
        let kind = match s.len() {
            12 => AddressType::Public,
            13 => match s[12] {
                b'p' | b'P' => AddressType::Public,
                b'r' | b'R' => AddressType::Random,
                _ => return Err(Error::InvalidParameter),
            },
            _ => return Err(Error::InvalidParameter),
        };

        let mut bytes = [0u8; 6];
        for (i, pair) in s[..12].chunks_exact(2).enumerate() {
            let hi = hex_val(pair[0]).ok_or(Error::InvalidParameter)?;
            let lo = hex_val(pair[1]).ok_or(Error::InvalidParameter)?;
            bytes[5 - i] = (hi << 4) | lo;
        }
        Ok(Self { bytes, kind })
    }
}

impl core::fmt::Display for BdAddress {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.format().as_str())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parse_public_suffix() {
        let addr: BdAddress = "0012F398DD12p".parse().unwrap();
        assert_eq!(addr.kind, AddressType::Public);
        assert_eq!(addr.bytes, [0x12, 0xDD, 0x98, 0xF3, 0x12, 0x00]);
    }

    #[test]
    fn parse_random_suffix() {
        let addr: BdAddress = "d8c9a1b2c3d4R".parse().unwrap();
        assert_eq!(addr.kind, AddressType::Random);
        assert_eq!(addr.bytes, [0xD4, 0xC3, 0xB2, 0xA1, 0xC9, 0xD8]);
    }

    #[test]
    fn parse_without_suffix_is_public() {
        let addr: BdAddress = "0012F398DD12".parse().unwrap();
        assert_eq!(addr.kind, AddressType::Public);
    }

    #[test]
    fn reject_bad_input() {
        assert!("0012F398DD".parse::<BdAddress>().is_err());
        assert!("0012F398DD1Zp".parse::<BdAddress>().is_err());
        assert!("0012F398DD12x".parse::<BdAddress>().is_err());
    }

    #[test]
    fn format_round_trip() {
        let addr: BdAddress = "0012F398DD12r".parse().unwrap();
        assert_eq!(addr.format(), "0012F398DD12r");
        let again: BdAddress = addr.format().parse().unwrap();
        assert_eq!(again, addr);
    }
}
