//! Just enough of the PE/COFF and TE image formats to display, rebase and re-entry-point
//! executables found in PE32/PIC/TE sections.
//!
//! The parse helpers resolve the chain DOS header → PE signature → file header → optional
//! header (32- or 64-bit) and hand back the fields the engine needs, together with the byte
//! offsets required to patch `ImageBase` in place during a rebase.

use snafu::prelude::*;
use vulcan_core::prelude::*;

/// Error conditions for when reading executable images.
#[derive(Debug, Snafu, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum Error {
    /// Thrown if the buffer is smaller than the headers it declares.
    #[snafu(display("Unexpected End-Of-File!"))]
    EndOfFile,
    /// Thrown if neither the DOS nor the TE signature matches.
    #[snafu(display("Unknown executable image type!"))]
    UnknownImageType,
    /// Thrown if the optional header magic is neither PE32 nor PE32+.
    #[snafu(display("Unknown PE optional header type!"))]
    UnknownOptionalHeaderType,
}
type Result<T> = core::result::Result<T, Error>;

impl From<vulcan_core::prelude::data::Error> for Error {
    #[inline]
    fn from(_: vulcan_core::prelude::data::Error) -> Self {
        Self::EndOfFile
    }
}

/// "MZ"
pub const DOS_SIGNATURE: u16 = 0x5A4D;
/// "PE\0\0"
pub const PE_SIGNATURE: u32 = 0x0000_4550;
/// "VZ"
pub const TE_SIGNATURE: u16 = 0x5A56;

pub const OPTIONAL_HDR32_MAGIC: u16 = 0x010B;
pub const OPTIONAL_HDR64_MAGIC: u16 = 0x020B;

pub const DOS_HEADER_SIZE: usize = 64;
pub const FILE_HEADER_SIZE: usize = 20;
pub const TE_HEADER_SIZE: usize = 40;

/// Index of the base relocation entry in the PE data directory.
pub const DIRECTORY_ENTRY_BASERELOC: usize = 5;
/// Index of the base relocation entry in the two-entry TE data directory.
pub const TE_DIRECTORY_ENTRY_BASERELOC: usize = 0;

// Base relocation types
pub const REL_BASED_ABSOLUTE: u8 = 0;
pub const REL_BASED_HIGH: u8 = 1;
pub const REL_BASED_LOW: u8 = 2;
pub const REL_BASED_HIGHLOW: u8 = 3;
pub const REL_BASED_DIR64: u8 = 10;

/// Short human name for a COFF machine type.
#[must_use]
pub fn machine_type_name(machine: u16) -> &'static str {
    match machine {
        0x014C => "x86",
        0x0200 => "IA64",
        0x01C2 => "ARM/Thumb",
        0xAA64 => "AArch64",
        0x0EBC => "EBC",
        0x8664 => "x86-64",
        0x5032 => "RISC-V 32",
        0x5064 => "RISC-V 64",
        _ => "Unknown",
    }
}

/// One data directory entry, a virtual address and a size.
#[derive(Debug, Clone, Copy, Default)]
pub struct DataDirectory {
    pub virtual_address: u32,
    pub size: u32,
}

/// The fields the engine cares about from a PE32/PE32+ image, plus patch offsets.
#[derive(Debug, Clone, Copy)]
pub struct PeInfo {
    pub machine: u16,
    pub number_of_sections: u16,
    pub characteristics: u16,
    pub magic: u16,
    pub subsystem: u16,
    pub address_of_entry_point: u32,
    pub base_of_code: u32,
    pub image_base: u64,
    /// Offset of the `ImageBase` field within the image, for in-place rebasing.
    pub image_base_offset: usize,
    /// Whether `ImageBase` is 32 (PE32) or 64 (PE32+) bits wide.
    pub image_base_is_64: bool,
    pub relocation_directory: DataDirectory,
}

impl PeInfo {
    /// Absolute entry point, as the loader computes it.
    #[must_use]
    pub fn entry_point(&self) -> u64 {
        self.image_base + u64::from(self.address_of_entry_point)
    }
}

/// Parses the DOS → PE → optional header chain.
pub fn parse_pe(data: &[u8]) -> Result<PeInfo> {
    let mut cursor = DataCursorRef::new(data);
    ensure!(cursor.read_u16()? == DOS_SIGNATURE, UnknownImageTypeSnafu);

    cursor.set_position(0x3C);
    let pe_offset = cursor.read_u32()? as usize;
    cursor.set_position(pe_offset);
    ensure!(cursor.read_u32()? == PE_SIGNATURE, UnknownImageTypeSnafu);

    // COFF file header
    let machine = cursor.read_u16()?;
    let number_of_sections = cursor.read_u16()?;
    let _time_date_stamp = cursor.read_u32()?;
    let _pointer_to_symbol_table = cursor.read_u32()?;
    let _number_of_symbols = cursor.read_u32()?;
    let _size_of_optional_header = cursor.read_u16()?;
    let characteristics = cursor.read_u16()?;

    let optional_offset = pe_offset + 4 + FILE_HEADER_SIZE;
    let magic = cursor.read_u16()?;
    match magic {
        OPTIONAL_HDR32_MAGIC => {
            cursor.set_position(optional_offset + 16);
            let address_of_entry_point = cursor.read_u32()?;
            let base_of_code = cursor.read_u32()?;
            cursor.set_position(optional_offset + 28);
            let image_base = u64::from(cursor.read_u32()?);
            cursor.set_position(optional_offset + 68);
            let subsystem = cursor.read_u16()?;
            cursor.set_position(optional_offset + 92);
            let number_of_rva = cursor.read_u32()? as usize;
            let relocation_directory = if number_of_rva > DIRECTORY_ENTRY_BASERELOC {
                cursor.set_position(optional_offset + 96 + DIRECTORY_ENTRY_BASERELOC * 8);
                DataDirectory { virtual_address: cursor.read_u32()?, size: cursor.read_u32()? }
            } else {
                DataDirectory::default()
            };
            Ok(PeInfo {
                machine,
                number_of_sections,
                characteristics,
                magic,
                subsystem,
                address_of_entry_point,
                base_of_code,
                image_base,
                image_base_offset: optional_offset + 28,
                image_base_is_64: false,
                relocation_directory,
            })
        }
        OPTIONAL_HDR64_MAGIC => {
            cursor.set_position(optional_offset + 16);
            let address_of_entry_point = cursor.read_u32()?;
            let base_of_code = cursor.read_u32()?;
            let image_base = cursor.read_u64()?;
            cursor.set_position(optional_offset + 68);
            let subsystem = cursor.read_u16()?;
            cursor.set_position(optional_offset + 108);
            let number_of_rva = cursor.read_u32()? as usize;
            let relocation_directory = if number_of_rva > DIRECTORY_ENTRY_BASERELOC {
                cursor.set_position(optional_offset + 112 + DIRECTORY_ENTRY_BASERELOC * 8);
                DataDirectory { virtual_address: cursor.read_u32()?, size: cursor.read_u32()? }
            } else {
                DataDirectory::default()
            };
            Ok(PeInfo {
                machine,
                number_of_sections,
                characteristics,
                magic,
                subsystem,
                address_of_entry_point,
                base_of_code,
                image_base,
                image_base_offset: optional_offset + 24,
                image_base_is_64: true,
                relocation_directory,
            })
        }
        _ => UnknownOptionalHeaderTypeSnafu.fail(),
    }
}

/// EFI_IMAGE_TE_HEADER
#[derive(Debug, Clone, Copy)]
pub struct TeInfo {
    pub machine: u16,
    pub number_of_sections: u8,
    pub subsystem: u8,
    /// Bytes stripped from the PE headers when the TE image was built.
    pub stripped_size: u16,
    pub address_of_entry_point: u32,
    pub base_of_code: u32,
    pub image_base: u64,
    pub relocation_directory: DataDirectory,
}

/// Offset of the `ImageBase` field inside a TE header.
pub const TE_IMAGE_BASE_OFFSET: usize = 16;

impl TeInfo {
    /// Bytes the build stripped but the header still addresses.
    #[must_use]
    pub fn fixup(&self) -> u32 {
        u32::from(self.stripped_size).saturating_sub(TE_HEADER_SIZE as u32)
    }
}

/// Parses a TE header at the start of the buffer.
pub fn parse_te(data: &[u8]) -> Result<TeInfo> {
    let mut cursor = DataCursorRef::new(data);
    ensure!(cursor.read_u16()? == TE_SIGNATURE, UnknownImageTypeSnafu);
    let machine = cursor.read_u16()?;
    let number_of_sections = cursor.read_u8()?;
    let subsystem = cursor.read_u8()?;
    let stripped_size = cursor.read_u16()?;
    let address_of_entry_point = cursor.read_u32()?;
    let base_of_code = cursor.read_u32()?;
    let image_base = cursor.read_u64()?;
    let relocation_directory =
        DataDirectory { virtual_address: cursor.read_u32()?, size: cursor.read_u32()? };
    Ok(TeInfo {
        machine,
        number_of_sections,
        subsystem,
        stripped_size,
        address_of_entry_point,
        base_of_code,
        image_base,
        relocation_directory,
    })
}

/// Which flavor of executable starts the buffer, without a full parse.
#[must_use]
pub fn image_signature(data: &[u8]) -> Option<u16> {
    let mut cursor = DataCursorRef::new(data);
    cursor.read_u16().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Builds a minimal PE32 image: DOS stub, PE signature, file header, optional header.
    pub(crate) fn build_pe32(image_base: u32, entry_point: u32) -> Vec<u8> {
        let mut data = vec![0u8; 0x200];
        data[0..2].copy_from_slice(&DOS_SIGNATURE.to_le_bytes());
        data[0x3C..0x40].copy_from_slice(&0x80u32.to_le_bytes());
        data[0x80..0x84].copy_from_slice(&PE_SIGNATURE.to_le_bytes());
        // File header
        data[0x84..0x86].copy_from_slice(&0x014Cu16.to_le_bytes());
        data[0x86..0x88].copy_from_slice(&1u16.to_le_bytes());
        data[0x94..0x96].copy_from_slice(&224u16.to_le_bytes());
        // Optional header at 0x98
        data[0x98..0x9A].copy_from_slice(&OPTIONAL_HDR32_MAGIC.to_le_bytes());
        data[0x98 + 16..0x98 + 20].copy_from_slice(&entry_point.to_le_bytes());
        data[0x98 + 20..0x98 + 24].copy_from_slice(&0x400u32.to_le_bytes());
        data[0x98 + 28..0x98 + 32].copy_from_slice(&image_base.to_le_bytes());
        data[0x98 + 92..0x98 + 96].copy_from_slice(&16u32.to_le_bytes());
        data
    }

    #[test]
    fn parse_pe32_fields() {
        let data = build_pe32(0xFFF0_0000, 0x1234);
        let info = parse_pe(&data).unwrap();
        assert_eq!(info.machine, 0x014C);
        assert_eq!(info.image_base, 0xFFF0_0000);
        assert_eq!(info.address_of_entry_point, 0x1234);
        assert_eq!(info.entry_point(), 0xFFF0_1234);
        assert_eq!(info.image_base_offset, 0x98 + 28);
        assert!(!info.image_base_is_64);
    }

    #[test]
    fn parse_te_fields() {
        let mut data = vec![0u8; 0x100];
        data[0..2].copy_from_slice(&TE_SIGNATURE.to_le_bytes());
        data[2..4].copy_from_slice(&0x8664u16.to_le_bytes());
        data[6..8].copy_from_slice(&0x128u16.to_le_bytes());
        data[8..12].copy_from_slice(&0x2000u32.to_le_bytes());
        data[16..24].copy_from_slice(&0xFFF8_0000u64.to_le_bytes());
        let info = parse_te(&data).unwrap();
        assert_eq!(info.machine, 0x8664);
        assert_eq!(info.stripped_size, 0x128);
        assert_eq!(info.image_base, 0xFFF8_0000);
        assert_eq!(info.fixup(), 0x128 - 40);
    }

    #[test]
    fn rejects_garbage() {
        assert!(matches!(parse_pe(&[0u8; 64]), Err(Error::UnknownImageType)));
        assert!(matches!(parse_te(&[0u8; 64]), Err(Error::UnknownImageType)));
    }
}
