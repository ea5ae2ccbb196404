//! Version recognition for the Intel Management Engine region.

use vulcan_core::prelude::*;

type Result<T> = core::result::Result<T, vulcan_core::prelude::data::Error>;

/// "$MAN", found in older ME firmware.
pub const ME_VERSION_SIGNATURE: [u8; 4] = *b"$MAN";
/// "$MN2", found in newer ME firmware.
pub const ME_VERSION_SIGNATURE2: [u8; 4] = *b"$MN2";

/// ME_VERSION, located by scanning the region for one of the signatures.
#[derive(Debug, Clone, Copy)]
pub struct MeVersion {
    pub major: u16,
    pub minor: u16,
    pub bugfix: u16,
    pub build: u16,
}

impl MeVersion {
    /// Parses a version structure starting at its signature.
    pub fn parse(data: &[u8]) -> Result<Self> {
        let mut cursor = DataCursorRef::new(data);
        let _signature = cursor.read_u32()?;
        let _reserved = cursor.read_u32()?;
        Ok(Self {
            major: cursor.read_u16()?,
            minor: cursor.read_u16()?,
            bugfix: cursor.read_u16()?,
            build: cursor.read_u16()?,
        })
    }
}

/// Finds the version structure inside an ME region, trying the newer signature first.
#[must_use]
pub fn find_version(me: &[u8]) -> Option<MeVersion> {
    let offset = find_signature(me, &ME_VERSION_SIGNATURE2)
        .or_else(|| find_signature(me, &ME_VERSION_SIGNATURE))?;
    MeVersion::parse(&me[offset..]).ok()
}

fn find_signature(data: &[u8], signature: &[u8; 4]) -> Option<usize> {
    data.windows(4).position(|window| window == signature)
}
