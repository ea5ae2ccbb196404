//! The few fields of a GbE region worth surfacing: the MAC address and the firmware version.

use vulcan_core::prelude::*;

type Result<T> = core::result::Result<T, vulcan_core::prelude::data::Error>;

pub const GBE_VERSION_OFFSET: usize = 10;

/// GBE_MAC, the first six bytes of the region.
#[derive(Debug, Clone, Copy)]
pub struct GbeMac {
    pub vendor: [u8; 3],
    pub device: [u8; 3],
}

impl GbeMac {
    pub fn parse(gbe: &[u8]) -> Result<Self> {
        let mut cursor = DataCursorRef::new(gbe);
        let mut vendor = [0u8; 3];
        vendor.copy_from_slice(cursor.get_slice(3)?);
        let mut device = [0u8; 3];
        device.copy_from_slice(cursor.get_slice(3)?);
        Ok(Self { vendor, device })
    }
}

/// GBE_VERSION at [`GBE_VERSION_OFFSET`].
#[derive(Debug, Clone, Copy)]
pub struct GbeVersion {
    pub id: u8,
    pub minor: u8,
    pub major: u8,
}

impl GbeVersion {
    pub fn parse(gbe: &[u8]) -> Result<Self> {
        let mut cursor = DataCursorRef::new(gbe);
        cursor.set_position(GBE_VERSION_OFFSET);
        let packed = cursor.read_u8()?;
        let major = cursor.read_u8()?;
        Ok(Self { id: packed & 0x0F, minor: packed >> 4, major })
    }
}
