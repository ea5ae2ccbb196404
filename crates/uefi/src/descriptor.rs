//! Bit-exact layout of the Intel flash descriptor that partitions the SPI flash into regions.
//!
//! All of the `*_base` fields in the descriptor map store bits [11:4] of the actual byte
//! offset, so a base is shifted left by 4 to address into the descriptor. Region bases and
//! limits are in 4 KiB units; a region is present iff its limit is non-zero.

use vulcan_core::prelude::*;

type Result<T> = core::result::Result<T, vulcan_core::prelude::data::Error>;

/// Signature found at offset 16, after the 16 bytes of 0xFF.
pub const FLASH_DESCRIPTOR_SIGNATURE: u32 = 0x0FF0_A55A;
/// The descriptor region always covers the first 4 KiB of flash.
pub const FLASH_DESCRIPTOR_SIZE: usize = 0x1000;
/// Upper bound for the map's base fields.
pub const FLASH_DESCRIPTOR_MAX_BASE: u8 = 0xE0;
/// Base address of the descriptor upper map.
pub const FLASH_DESCRIPTOR_UPPER_MAP_BASE: usize = 0x0EFC;

/// `ReadClockFrequency` value hardcoded in v1 descriptors.
pub const FLASH_FREQUENCY_20MHZ: u8 = 0b000;

/// Version field value on descriptors that predate the version field.
pub const FLASH_DESCRIPTOR_VERSION_INVALID: u32 = 0xFFFF_FFFF;
pub const FLASH_DESCRIPTOR_VERSION_MAJOR: u16 = 1;
pub const FLASH_DESCRIPTOR_VERSION_MINOR: u16 = 0;

/// FLASH_DESCRIPTOR_MAP, the four FLMAP dwords at offset 16.
#[derive(Debug, Clone, Copy)]
pub struct DescriptorMap {
    pub component_base: u8,
    pub number_of_flash_chips: u8,
    pub region_base: u8,
    pub number_of_regions: u8,
    pub master_base: u8,
    pub number_of_masters: u8,
    pub pch_straps_base: u8,
    pub number_of_pch_straps: u8,
    pub proc_straps_base: u8,
    pub number_of_proc_straps: u8,
    pub descriptor_version: u32,
}

impl DescriptorMap {
    /// Parses the map from the whole descriptor region.
    pub fn parse(descriptor: &[u8]) -> Result<Self> {
        let mut cursor = DataCursorRef::new(descriptor);
        cursor.set_position(20);
        let flmap0 = cursor.read_u32()?;
        let flmap1 = cursor.read_u32()?;
        let flmap2 = cursor.read_u32()?;
        let descriptor_version = cursor.read_u32()?;
        Ok(Self {
            component_base: flmap0 as u8,
            number_of_flash_chips: ((flmap0 >> 8) & 0x3) as u8,
            region_base: (flmap0 >> 16) as u8,
            number_of_regions: ((flmap0 >> 24) & 0x7) as u8,
            master_base: flmap1 as u8,
            number_of_masters: ((flmap1 >> 8) & 0x3) as u8,
            pch_straps_base: (flmap1 >> 16) as u8,
            number_of_pch_straps: (flmap1 >> 24) as u8,
            proc_straps_base: flmap2 as u8,
            number_of_proc_straps: (flmap2 >> 8) as u8,
            descriptor_version,
        })
    }
}

/// FLASH_DESCRIPTOR_VERSION, packed into the map's version dword.
#[derive(Debug, Clone, Copy)]
pub struct DescriptorVersion {
    pub major: u16,
    pub minor: u16,
}

impl DescriptorVersion {
    #[must_use]
    pub fn from_raw(raw: u32) -> Self {
        Self { major: (raw >> 21) as u16, minor: ((raw >> 14) & 0x7F) as u16 }
    }
}

/// One `(base, limit)` register pair of the region section, in 4 KiB units.
#[derive(Debug, Clone, Copy, Default)]
pub struct RegionRecord {
    pub base: u16,
    pub limit: u16,
}

impl RegionRecord {
    /// A region exists iff its limit register is non-zero.
    #[must_use]
    pub fn present(&self) -> bool {
        self.limit != 0
    }

    /// Byte offset of the region within the image.
    #[must_use]
    pub fn offset(&self) -> u32 {
        u32::from(self.base) * 0x1000
    }

    /// Byte size of the region, zero when absent.
    #[must_use]
    pub fn size(&self) -> u32 {
        if self.limit != 0 {
            (u32::from(self.limit) + 1 - u32::from(self.base)) * 0x1000
        } else {
            0
        }
    }
}

/// FLASH_DESCRIPTOR_REGION_SECTION, located through the map's region base.
#[derive(Debug, Clone, Copy, Default)]
pub struct RegionSection {
    pub descriptor: RegionRecord,
    pub bios: RegionRecord,
    pub me: RegionRecord,
    pub gbe: RegionRecord,
    pub pdr: RegionRecord,
    pub region5: RegionRecord,
    pub region6: RegionRecord,
    pub region7: RegionRecord,
    pub ec: RegionRecord,
}

impl RegionSection {
    pub fn parse(descriptor: &[u8], base: u8) -> Result<Self> {
        let mut cursor = DataCursorRef::new(descriptor);
        cursor.set_position(base_to_offset(base));
        let mut read = || -> Result<RegionRecord> {
            Ok(RegionRecord { base: cursor.read_u16()?, limit: cursor.read_u16()? })
        };
        Ok(Self {
            descriptor: read()?,
            bios: read()?,
            me: read()?,
            gbe: read()?,
            pdr: read()?,
            region5: read()?,
            region6: read()?,
            region7: read()?,
            ec: read()?,
        })
    }
}

/// FLASH_DESCRIPTOR_COMPONENT_SECTION; only the flash parameters dword is interesting here.
#[derive(Debug, Clone, Copy)]
pub struct ComponentSection {
    pub flash_parameters: u32,
}

impl ComponentSection {
    pub fn parse(descriptor: &[u8], base: u8) -> Result<Self> {
        let mut cursor = DataCursorRef::new(descriptor);
        cursor.set_position(base_to_offset(base));
        Ok(Self { flash_parameters: cursor.read_u32()? })
    }

    /// The hardcoded read clock frequency that distinguishes v1 descriptors (20 MHz) from v2.
    #[must_use]
    pub fn read_clock_frequency(&self) -> u8 {
        ((self.flash_parameters >> 17) & 0x7) as u8
    }
}

/// FLASH_DESCRIPTOR_MASTER_SECTION (v1), byte-wide access registers.
#[derive(Debug, Clone, Copy)]
pub struct MasterSection {
    pub bios_read: u8,
    pub bios_write: u8,
    pub me_read: u8,
    pub me_write: u8,
    pub gbe_read: u8,
    pub gbe_write: u8,
}

impl MasterSection {
    pub fn parse(descriptor: &[u8], base: u8) -> Result<Self> {
        let mut cursor = DataCursorRef::new(descriptor);
        cursor.set_position(base_to_offset(base));
        let _bios_id = cursor.read_u16()?;
        let bios_read = cursor.read_u8()?;
        let bios_write = cursor.read_u8()?;
        let _me_id = cursor.read_u16()?;
        let me_read = cursor.read_u8()?;
        let me_write = cursor.read_u8()?;
        let _gbe_id = cursor.read_u16()?;
        let gbe_read = cursor.read_u8()?;
        let gbe_write = cursor.read_u8()?;
        Ok(Self { bios_read, bios_write, me_read, me_write, gbe_read, gbe_write })
    }
}

/// FLASH_DESCRIPTOR_MASTER_SECTION_V2 (Skylake+), 12-bit access fields.
#[derive(Debug, Clone, Copy)]
pub struct MasterSectionV2 {
    pub bios_read: u16,
    pub bios_write: u16,
    pub me_read: u16,
    pub me_write: u16,
    pub gbe_read: u16,
    pub gbe_write: u16,
    pub ec_read: u16,
    pub ec_write: u16,
}

impl MasterSectionV2 {
    pub fn parse(descriptor: &[u8], base: u8) -> Result<Self> {
        let mut cursor = DataCursorRef::new(descriptor);
        cursor.set_position(base_to_offset(base));
        let bios = cursor.read_u32()?;
        let me = cursor.read_u32()?;
        let gbe = cursor.read_u32()?;
        let _reserved = cursor.read_u32()?;
        let ec = cursor.read_u32()?;
        let split = |dword: u32| (((dword >> 8) & 0xFFF) as u16, ((dword >> 20) & 0xFFF) as u16);
        let (bios_read, bios_write) = split(bios);
        let (me_read, me_write) = split(me);
        let (gbe_read, gbe_write) = split(gbe);
        let (ec_read, ec_write) = split(ec);
        Ok(Self { bios_read, bios_write, me_read, me_write, gbe_read, gbe_write, ec_read, ec_write })
    }
}

// Region access bits in the v1 master section
pub const REGION_ACCESS_DESC: u8 = 0x01;
pub const REGION_ACCESS_BIOS: u8 = 0x02;
pub const REGION_ACCESS_ME: u8 = 0x04;
pub const REGION_ACCESS_GBE: u8 = 0x08;
pub const REGION_ACCESS_PDR: u8 = 0x10;
pub const REGION_ACCESS_EC: u8 = 0x20;

/// FLASH_DESCRIPTOR_UPPER_MAP
#[derive(Debug, Clone, Copy)]
pub struct UpperMap {
    pub vscc_table_base: u8,
    pub vscc_table_size: u8,
}

impl UpperMap {
    pub fn parse(descriptor: &[u8]) -> Result<Self> {
        let mut cursor = DataCursorRef::new(descriptor);
        cursor.set_position(FLASH_DESCRIPTOR_UPPER_MAP_BASE);
        Ok(Self { vscc_table_base: cursor.read_u8()?, vscc_table_size: cursor.read_u8()? })
    }
}

/// VSCC_TABLE_ENTRY
#[derive(Debug, Clone, Copy)]
pub struct VsccTableEntry {
    pub vendor_id: u8,
    pub device_id0: u8,
    pub device_id1: u8,
    pub vscc_register_value: u32,
}

pub const VSCC_TABLE_ENTRY_SIZE: usize = 8;

impl VsccTableEntry {
    pub fn parse(data: &[u8]) -> Result<Self> {
        let mut cursor = DataCursorRef::new(data);
        let vendor_id = cursor.read_u8()?;
        let device_id0 = cursor.read_u8()?;
        let device_id1 = cursor.read_u8()?;
        let _reserved = cursor.read_u8()?;
        Ok(Self { vendor_id, device_id0, device_id1, vscc_register_value: cursor.read_u32()? })
    }
}

/// Converts a descriptor map base field to its byte offset within the descriptor.
#[must_use]
pub fn base_to_offset(base: u8) -> usize {
    usize::from(base) << 4
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn region_arithmetic() {
        let region = RegionRecord { base: 0x0003, limit: 0x0042 };
        assert!(region.present());
        assert_eq!(region.offset(), 0x3000);
        assert_eq!(region.size(), 0x40000);

        let absent = RegionRecord { base: 0x0000, limit: 0x0000 };
        assert!(!absent.present());
        assert_eq!(absent.size(), 0);
    }

    #[test]
    fn map_fields() {
        let mut descriptor = vec![0u8; FLASH_DESCRIPTOR_SIZE];
        descriptor[20..24].copy_from_slice(&0x0304_0201u32.to_le_bytes()); // FLMAP0
        descriptor[24..28].copy_from_slice(&0x0011_0106u32.to_le_bytes()); // FLMAP1
        let map = DescriptorMap::parse(&descriptor).unwrap();
        assert_eq!(map.component_base, 0x01);
        assert_eq!(map.number_of_flash_chips, 0x02);
        assert_eq!(map.region_base, 0x04);
        assert_eq!(map.number_of_regions, 0x03);
        assert_eq!(map.master_base, 0x06);
        assert_eq!(map.number_of_masters, 0x01);
        assert_eq!(map.pch_straps_base, 0x11);
        assert_eq!(base_to_offset(map.region_base), 0x40);
    }
}
