//! The EFI GUID value type used to name everything inside a firmware image.
//!
//! On the wire a GUID is 16 bytes where the first three fields are stored
//! little-endian and the trailing eight bytes are stored as-is. [`Guid`] keeps
//! the raw wire bytes and only performs the mixed-endian swap when formatting
//! or parsing the registry form (`AABBCCDD-EEFF-0011-2233-445566778899`).

use core::fmt;
use core::str::FromStr;

use snafu::prelude::*;

/// Error conditions for when parsing a GUID string.
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum Error {
    /// Thrown if the string is not five dash-separated groups of 8-4-4-4-12 hex digits.
    #[snafu(display("Invalid GUID string!"))]
    InvalidFormat,
}

/// A 16-byte EFI GUID, stored in wire order.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Guid(pub [u8; 16]);

impl Guid {
    /// The all-zero GUID.
    pub const ZERO: Guid = Guid([0; 16]);

    /// Creates a GUID from its wire representation.
    #[inline]
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    /// Creates a GUID from the leading 16 bytes of a slice, if present.
    #[inline]
    #[must_use]
    pub fn from_slice(data: &[u8]) -> Option<Self> {
        let bytes: [u8; 16] = data.get(..16)?.try_into().ok()?;
        Some(Self(bytes))
    }

    /// Returns the wire representation of this GUID.
    #[inline]
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl fmt::Display for Guid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let d = &self.0;
        let data1 = u32::from_le_bytes([d[0], d[1], d[2], d[3]]);
        let data2 = u16::from_le_bytes([d[4], d[5]]);
        let data3 = u16::from_le_bytes([d[6], d[7]]);
        write!(
            f,
            "{:08X}-{:04X}-{:04X}-{:02X}{:02X}-{:02X}{:02X}{:02X}{:02X}{:02X}{:02X}",
            data1, data2, data3, d[8], d[9], d[10], d[11], d[12], d[13], d[14], d[15]
        )
    }
}

impl fmt::Debug for Guid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

fn hex_nibble(c: u8) -> Option<u8> {
    match c {
        b'0'..=b'9' => Some(c - b'0'),
        b'a'..=b'f' => Some(c - b'a' + 10),
        b'A'..=b'F' => Some(c - b'A' + 10),
        _ => None,
    }
}

fn hex_byte(s: &[u8]) -> Option<u8> {
    Some((hex_nibble(s[0])? << 4) | hex_nibble(s[1])?)
}

impl FromStr for Guid {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.as_bytes();
        ensure!(s.len() == 36 && s[8] == b'-' && s[13] == b'-' && s[18] == b'-' && s[23] == b'-', InvalidFormatSnafu);

        let mut hex = [0u8; 16];
        let groups: [(usize, usize); 5] = [(0, 4), (9, 2), (14, 2), (19, 2), (24, 6)];
        let mut out = 0;
        for (start, count) in groups {
            for i in 0..count {
                hex[out] = hex_byte(&s[start + 2 * i..]).context(InvalidFormatSnafu)?;
                out += 1;
            }
        }

        // Swap the three little-endian fields into wire order
        let mut bytes = [0u8; 16];
        bytes[0] = hex[3];
        bytes[1] = hex[2];
        bytes[2] = hex[1];
        bytes[3] = hex[0];
        bytes[4] = hex[5];
        bytes[5] = hex[4];
        bytes[6] = hex[7];
        bytes[7] = hex[6];
        bytes[8..].copy_from_slice(&hex[8..]);
        Ok(Self(bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_round_trip() {
        // EFI_FIRMWARE_FILE_SYSTEM2_GUID
        let guid = Guid::from_bytes([
            0x78, 0xE5, 0x8C, 0x8C, 0x3D, 0x8A, 0x1C, 0x4F, 0x99, 0x35, 0x89, 0x61, 0x85, 0xC3,
            0x2D, 0xD3,
        ]);
        let text = guid.to_string();
        assert_eq!(text, "8C8CE578-8A3D-4F1C-9935-896185C32DD3");
        assert_eq!(text.parse::<Guid>().unwrap(), guid);
    }

    #[test]
    fn rejects_malformed() {
        assert!("8C8CE578-8A3D-4F1C-9935".parse::<Guid>().is_err());
        assert!("8C8CE578+8A3D-4F1C-9935-896185C32DD3".parse::<Guid>().is_err());
        assert!("ZC8CE578-8A3D-4F1C-9935-896185C32DD3".parse::<Guid>().is_err());
    }
}
