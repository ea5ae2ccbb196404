//! Bit-exact layouts and well-known GUIDs for capsules, firmware volumes, FFS files and
//! sections.
//!
//! Every multi-byte field in these structures is little-endian on the wire. Parse helpers read
//! through [`DataCursorRef`] and return plain structs; the reconstructor patches serialized
//! headers in place using the `*_OFFSET` constants, so unknown or vendor-specific bytes survive
//! untouched.

use bitflags::bitflags;
use num_enum::{IntoPrimitive, TryFromPrimitive};
use vulcan_core::prelude::*;

type Result<T> = core::result::Result<T, vulcan_core::prelude::data::Error>;

//------------------------------------------------------------------------------
// Capsules
//------------------------------------------------------------------------------

/// 3B6686BD-0D76-4030-B70E-B5519E2FC5A0
pub const EFI_CAPSULE_GUID: Guid = Guid([
    0xBD, 0x86, 0x66, 0x3B, 0x76, 0x0D, 0x30, 0x40, 0xB7, 0x0E, 0xB5, 0x51, 0x9E, 0x2F, 0xC5, 0xA0,
]);
/// 539182B9-ABB5-4391-B69A-E3A943F72FCC
pub const INTEL_CAPSULE_GUID: Guid = Guid([
    0xB9, 0x82, 0x91, 0x53, 0xB5, 0xAB, 0x91, 0x43, 0xB6, 0x9A, 0xE3, 0xA9, 0x43, 0xF7, 0x2F, 0xCC,
]);
/// 3BE07062-1D51-45D2-832B-F093257ED461
pub const TOSHIBA_CAPSULE_GUID: Guid = Guid([
    0x62, 0x70, 0xE0, 0x3B, 0x51, 0x1D, 0xD2, 0x45, 0x83, 0x2B, 0xF0, 0x93, 0x25, 0x7E, 0xD4, 0x61,
]);
/// 4A3CA68B-7723-48FB-803D-578CC1FEC44D
pub const APTIO_SIGNED_CAPSULE_GUID: Guid = Guid([
    0x8B, 0xA6, 0x3C, 0x4A, 0x23, 0x77, 0xFB, 0x48, 0x80, 0x3D, 0x57, 0x8C, 0xC1, 0xFE, 0xC4, 0x4D,
]);
/// 14EEBB90-890A-43DB-AED1-5D3C4588A418
pub const APTIO_UNSIGNED_CAPSULE_GUID: Guid = Guid([
    0x90, 0xBB, 0xEE, 0x14, 0x0A, 0x89, 0xDB, 0x43, 0xAE, 0xD1, 0x5D, 0x3C, 0x45, 0x88, 0xA4, 0x18,
]);

/// EFI_CAPSULE_HEADER
#[derive(Debug, Clone, Copy)]
pub struct CapsuleHeader {
    pub capsule_guid: Guid,
    pub header_size: u32,
    pub flags: u32,
    pub capsule_image_size: u32,
}

pub const CAPSULE_HEADER_SIZE: usize = 28;

impl CapsuleHeader {
    pub fn parse(data: &[u8]) -> Result<Self> {
        let mut cursor = DataCursorRef::new(data);
        let capsule_guid = Guid::from_slice(cursor.get_slice(16)?).unwrap_or(Guid::ZERO);
        Ok(Self {
            capsule_guid,
            header_size: cursor.read_u32()?,
            flags: cursor.read_u32()?,
            capsule_image_size: cursor.read_u32()?,
        })
    }
}

/// TOSHIBA_CAPSULE_HEADER
#[derive(Debug, Clone, Copy)]
pub struct ToshibaCapsuleHeader {
    pub capsule_guid: Guid,
    pub header_size: u32,
    pub full_size: u32,
    pub flags: u32,
}

impl ToshibaCapsuleHeader {
    pub fn parse(data: &[u8]) -> Result<Self> {
        let mut cursor = DataCursorRef::new(data);
        let capsule_guid = Guid::from_slice(cursor.get_slice(16)?).unwrap_or(Guid::ZERO);
        Ok(Self {
            capsule_guid,
            header_size: cursor.read_u32()?,
            full_size: cursor.read_u32()?,
            flags: cursor.read_u32()?,
        })
    }
}

/// APTIO_CAPSULE_HEADER, an EFI_CAPSULE_HEADER followed by the offset of the ROM image.
#[derive(Debug, Clone, Copy)]
pub struct AptioCapsuleHeader {
    pub capsule_header: CapsuleHeader,
    pub rom_image_offset: u16,
}

impl AptioCapsuleHeader {
    pub fn parse(data: &[u8]) -> Result<Self> {
        let capsule_header = CapsuleHeader::parse(data)?;
        let mut cursor = DataCursorRef::new(data);
        cursor.set_position(CAPSULE_HEADER_SIZE);
        Ok(Self { capsule_header, rom_image_offset: cursor.read_u16()? })
    }
}

//------------------------------------------------------------------------------
// Firmware volumes
//------------------------------------------------------------------------------

/// Firmware volume signature "_FVH" and its fixed offset within the volume header.
pub const FV_SIGNATURE: [u8; 4] = *b"_FVH";
pub const FV_SIGNATURE_OFFSET: usize = 0x28;

/// 7A9354D9-0468-444A-81CE-0BF617D890DF
pub const EFI_FIRMWARE_FILE_SYSTEM_GUID: Guid = Guid([
    0xD9, 0x54, 0x93, 0x7A, 0x68, 0x04, 0x4A, 0x44, 0x81, 0xCE, 0x0B, 0xF6, 0x17, 0xD8, 0x90, 0xDF,
]);
/// 8C8CE578-8A3D-4F1C-9935-896185C32DD3
pub const EFI_FIRMWARE_FILE_SYSTEM2_GUID: Guid = Guid([
    0x78, 0xE5, 0x8C, 0x8C, 0x3D, 0x8A, 0x1C, 0x4F, 0x99, 0x35, 0x89, 0x61, 0x85, 0xC3, 0x2D, 0xD3,
]);
/// 5473C07A-3DCB-4DCA-BD6F-1E9689E7349A
pub const EFI_FIRMWARE_FILE_SYSTEM3_GUID: Guid = Guid([
    0x7A, 0xC0, 0x73, 0x54, 0xCB, 0x3D, 0xCA, 0x4D, 0xBD, 0x6F, 0x1E, 0x96, 0x89, 0xE7, 0x34, 0x9A,
]);
/// 04ADEEAD-61FF-4D31-B6BA-64F8BF901F5A
pub const EFI_APPLE_BOOT_VOLUME_FILE_SYSTEM_GUID: Guid = Guid([
    0xAD, 0xEE, 0xAD, 0x04, 0xFF, 0x61, 0x31, 0x4D, 0xB6, 0xBA, 0x64, 0xF8, 0xBF, 0x90, 0x1F, 0x5A,
]);
/// BD001B8C-6A71-487B-A14F-0C2A2DCF7A5D
pub const EFI_APPLE_BOOT_VOLUME_FILE_SYSTEM2_GUID: Guid = Guid([
    0x8C, 0x1B, 0x00, 0xBD, 0x71, 0x6A, 0x7B, 0x48, 0xA1, 0x4F, 0x0C, 0x2A, 0x2D, 0xCF, 0x7A, 0x5D,
]);
/// AD3FFFFF-D28B-44C4-9F13-9EA98A97F9F0
pub const EFI_INTEL_FILE_SYSTEM_GUID: Guid = Guid([
    0xFF, 0xFF, 0x3F, 0xAD, 0x8B, 0xD2, 0xC4, 0x44, 0x9F, 0x13, 0x9E, 0xA9, 0x8A, 0x97, 0xF9, 0xF0,
]);
/// D6A1CD70-4B33-4994-A6EA-375F2CCC5437
pub const EFI_INTEL_FILE_SYSTEM2_GUID: Guid = Guid([
    0x70, 0xCD, 0xA1, 0xD6, 0x33, 0x4B, 0x94, 0x49, 0xA6, 0xEA, 0x37, 0x5F, 0x2C, 0xCC, 0x54, 0x37,
]);
/// 4F494156-AED6-4D64-A537-B8A5557BCEEC
pub const EFI_SONY_FILE_SYSTEM_GUID: Guid = Guid([
    0x56, 0x41, 0x49, 0x4F, 0xD6, 0xAE, 0x64, 0x4D, 0xA5, 0x37, 0xB8, 0xA5, 0x55, 0x7B, 0xCE, 0xEC,
]);

/// Filesystem GUIDs parsed as FFSv2.
pub const FFS2_VOLUME_GUIDS: [Guid; 7] = [
    EFI_FIRMWARE_FILE_SYSTEM_GUID,
    EFI_FIRMWARE_FILE_SYSTEM2_GUID,
    EFI_APPLE_BOOT_VOLUME_FILE_SYSTEM_GUID,
    EFI_APPLE_BOOT_VOLUME_FILE_SYSTEM2_GUID,
    EFI_INTEL_FILE_SYSTEM_GUID,
    EFI_INTEL_FILE_SYSTEM2_GUID,
    EFI_SONY_FILE_SYSTEM_GUID,
];

/// Filesystem GUIDs parsed as FFSv3.
pub const FFS3_VOLUME_GUIDS: [Guid; 1] = [EFI_FIRMWARE_FILE_SYSTEM3_GUID];

// Revision 1 volume attributes
pub const FVB_ERASE_POLARITY: u32 = 0x0000_0800;
pub const FVB_ALIGNMENT_CAP: u32 = 0x0000_8000;
// Revision 2 volume attributes
pub const FVB2_ERASE_POLARITY: u32 = 0x0000_0800;
pub const FVB2_ALIGNMENT: u32 = 0x001F_0000;
pub const FVB2_WEAK_ALIGNMENT: u32 = 0x8000_0000;

/// EFI_FIRMWARE_VOLUME_HEADER, excluding the block map that follows it.
#[derive(Debug, Clone)]
pub struct VolumeHeader {
    pub zero_vector: [u8; 16],
    pub filesystem_guid: Guid,
    pub fv_length: u64,
    pub signature: [u8; 4],
    pub attributes: u32,
    pub header_length: u16,
    pub checksum: u16,
    pub ext_header_offset: u16,
    pub revision: u8,
}

pub const VOLUME_HEADER_SIZE: usize = 56;
pub const BLOCK_MAP_ENTRY_SIZE: usize = 8;
// Field offsets used when patching a serialized volume header
pub const VOLUME_ZV_CRC32_OFFSET: usize = 8;
pub const VOLUME_ZV_FSO_OFFSET: usize = 12;
pub const VOLUME_FV_LENGTH_OFFSET: usize = 32;
pub const VOLUME_CHECKSUM_OFFSET: usize = 50;

impl VolumeHeader {
    pub fn parse(data: &[u8]) -> Result<Self> {
        let mut cursor = DataCursorRef::new(data);
        let mut zero_vector = [0u8; 16];
        zero_vector.copy_from_slice(cursor.get_slice(16)?);
        let filesystem_guid = Guid::from_slice(cursor.get_slice(16)?).unwrap_or(Guid::ZERO);
        let fv_length = cursor.read_u64()?;
        let mut signature = [0u8; 4];
        signature.copy_from_slice(cursor.get_slice(4)?);
        let attributes = cursor.read_u32()?;
        let header_length = cursor.read_u16()?;
        let checksum = cursor.read_u16()?;
        let ext_header_offset = cursor.read_u16()?;
        let _reserved = cursor.read_u8()?;
        let revision = cursor.read_u8()?;
        Ok(Self {
            zero_vector,
            filesystem_guid,
            fv_length,
            signature,
            attributes,
            header_length,
            checksum,
            ext_header_offset,
            revision,
        })
    }

    /// Whether erased bytes in this volume read back as 0xFF.
    #[must_use]
    pub fn erase_polarity(&self) -> bool {
        self.attributes & FVB_ERASE_POLARITY != 0
    }
}

/// EFI_FV_BLOCK_MAP_ENTRY; the map ends with a `{0, 0}` entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockMapEntry {
    pub num_blocks: u32,
    pub length: u32,
}

impl BlockMapEntry {
    pub fn parse(data: &[u8]) -> Result<Self> {
        let mut cursor = DataCursorRef::new(data);
        Ok(Self { num_blocks: cursor.read_u32()?, length: cursor.read_u32()? })
    }

    #[must_use]
    pub fn is_terminator(&self) -> bool {
        self.num_blocks == 0 && self.length == 0
    }
}

/// EFI_FIRMWARE_VOLUME_EXT_HEADER
#[derive(Debug, Clone, Copy)]
pub struct VolumeExtHeader {
    pub fv_name: Guid,
    pub ext_header_size: u32,
}

pub const VOLUME_EXT_HEADER_SIZE: usize = 20;

impl VolumeExtHeader {
    pub fn parse(data: &[u8]) -> Result<Self> {
        let mut cursor = DataCursorRef::new(data);
        let fv_name = Guid::from_slice(cursor.get_slice(16)?).unwrap_or(Guid::ZERO);
        Ok(Self { fv_name, ext_header_size: cursor.read_u32()? })
    }
}

//------------------------------------------------------------------------------
// FFS files
//------------------------------------------------------------------------------

/// 1BA0062E-C779-4582-8566-336AE8F78F09, the Volume Top File pinned to top of 4 GiB.
pub const EFI_FFS_VOLUME_TOP_FILE_GUID: Guid = Guid([
    0x2E, 0x06, 0xA0, 0x1B, 0x79, 0xC7, 0x82, 0x45, 0x85, 0x66, 0x33, 0x6A, 0xE8, 0xF7, 0x8F, 0x09,
]);
/// E4536585-7909-4A60-B5C6-ECDEA6EBFB54
pub const EFI_FFS_PAD_FILE_GUID: Guid = Guid([
    0x85, 0x65, 0x53, 0xE4, 0x09, 0x79, 0x60, 0x4A, 0xB5, 0xC6, 0xEC, 0xDE, 0xA6, 0xEB, 0xFB, 0x54,
]);
/// 1B45CC0A-156A-428A-AF62-49864DA0E6E6
pub const EFI_PEI_APRIORI_FILE_GUID: Guid = Guid([
    0x0A, 0xCC, 0x45, 0x1B, 0x6A, 0x15, 0x8A, 0x42, 0xAF, 0x62, 0x49, 0x86, 0x4D, 0xA0, 0xE6, 0xE6,
]);
/// FC510EE7-FFDC-11D4-BD41-0080C73C8881
pub const EFI_DXE_APRIORI_FILE_GUID: Guid = Guid([
    0xE7, 0x0E, 0x51, 0xFC, 0xDC, 0xFF, 0xD4, 0x11, 0xBD, 0x41, 0x00, 0x80, 0xC7, 0x3C, 0x88, 0x81,
]);

// File types
pub const FILETYPE_ALL: u8 = 0x00;
pub const FILETYPE_RAW: u8 = 0x01;
pub const FILETYPE_FREEFORM: u8 = 0x02;
pub const FILETYPE_SECURITY_CORE: u8 = 0x03;
pub const FILETYPE_PEI_CORE: u8 = 0x04;
pub const FILETYPE_DXE_CORE: u8 = 0x05;
pub const FILETYPE_PEIM: u8 = 0x06;
pub const FILETYPE_DRIVER: u8 = 0x07;
pub const FILETYPE_COMBINED_PEIM_DRIVER: u8 = 0x08;
pub const FILETYPE_APPLICATION: u8 = 0x09;
pub const FILETYPE_SMM: u8 = 0x0A;
pub const FILETYPE_FIRMWARE_VOLUME_IMAGE: u8 = 0x0B;
pub const FILETYPE_COMBINED_SMM_DXE: u8 = 0x0C;
pub const FILETYPE_SMM_CORE: u8 = 0x0D;
pub const FILETYPE_SMM_STANDALONE: u8 = 0x0E;
pub const FILETYPE_SMM_CORE_STANDALONE: u8 = 0x0F;
pub const FILETYPE_PAD: u8 = 0xF0;

/// Short human name for an FFS file type byte.
#[must_use]
pub fn file_type_name(file_type: u8) -> &'static str {
    match file_type {
        FILETYPE_RAW => "Raw",
        FILETYPE_FREEFORM => "Freeform",
        FILETYPE_SECURITY_CORE => "SEC core",
        FILETYPE_PEI_CORE => "PEI core",
        FILETYPE_DXE_CORE => "DXE core",
        FILETYPE_PEIM => "PEI module",
        FILETYPE_DRIVER => "DXE driver",
        FILETYPE_COMBINED_PEIM_DRIVER => "Combined PEI/DXE",
        FILETYPE_APPLICATION => "Application",
        FILETYPE_SMM => "SMM module",
        FILETYPE_FIRMWARE_VOLUME_IMAGE => "Volume image",
        FILETYPE_COMBINED_SMM_DXE => "Combined SMM/DXE",
        FILETYPE_SMM_CORE => "SMM core",
        FILETYPE_SMM_STANDALONE => "SMM standalone",
        FILETYPE_SMM_CORE_STANDALONE => "SMM core standalone",
        FILETYPE_PAD => "Pad",
        _ => "Unknown",
    }
}

bitflags! {
    /// FFS file attributes. Bit 0 is `TAIL_PRESENT` on revision 1 volumes and `LARGE_FILE` on
    /// revision 2+.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FileAttributes: u8 {
        const TAIL_PRESENT     = 0x01;
        const LARGE_FILE       = 0x01;
        const RECOVERY         = 0x02;
        const DATA_ALIGNMENT_2 = 0x02;
        const FIXED            = 0x04;
        const DATA_ALIGNMENT   = 0x38;
        const CHECKSUM         = 0x40;
    }
}

bitflags! {
    /// FFS file state bits; stored inverted when the volume's erase polarity is 0xFF.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FileState: u8 {
        const HEADER_CONSTRUCTION = 0x01;
        const HEADER_VALID        = 0x02;
        const DATA_VALID          = 0x04;
        const MARKED_FOR_UPDATE   = 0x08;
        const DELETED             = 0x10;
        const HEADER_INVALID      = 0x20;
        const ERASE_POLARITY      = 0x80;
    }
}

/// Data checksum values used when `FFS_ATTRIB_CHECKSUM` is clear.
pub const FFS_FIXED_CHECKSUM: u8 = 0x5A;
pub const FFS_FIXED_CHECKSUM2: u8 = 0xAA;

/// Power-of-two exponents selected by the `DATA_ALIGNMENT` attribute bits.
pub const FFS_ALIGNMENT_TABLE: [u8; 8] = [0, 4, 7, 9, 10, 12, 15, 16];
/// Extended table selected by `DATA_ALIGNMENT_2` on revision 2+ volumes.
pub const FFS_ALIGNMENT2_TABLE: [u8; 8] = [17, 18, 19, 20, 21, 22, 23, 24];

pub const FFS_FILE_HEADER_SIZE: usize = 24;
pub const FFS_FILE_HEADER2_SIZE: usize = 32;
// Field offsets used when patching a serialized file header
pub const FFS_INTEGRITY_OFFSET: usize = 16;
pub const FFS_SIZE_OFFSET: usize = 20;
pub const FFS_STATE_OFFSET: usize = 23;
pub const FFS_EXTENDED_SIZE_OFFSET: usize = 24;

/// EFI_FFS_FILE_HEADER / EFI_FFS_FILE_HEADER2
#[derive(Debug, Clone, Copy)]
pub struct FfsFileHeader {
    pub name: Guid,
    pub integrity_check: u16,
    pub file_type: u8,
    pub attributes: u8,
    /// The 24-bit size field; 0xFFFFFF on large files.
    pub size: u32,
    pub state: u8,
}

impl FfsFileHeader {
    pub fn parse(data: &[u8]) -> Result<Self> {
        let mut cursor = DataCursorRef::new(data);
        let name = Guid::from_slice(cursor.get_slice(16)?).unwrap_or(Guid::ZERO);
        let integrity_check = cursor.read_u16()?;
        let file_type = cursor.read_u8()?;
        let attributes = cursor.read_u8()?;
        let size = uint24_to_u32(cursor.get_slice(3)?);
        let state = cursor.read_u8()?;
        Ok(Self { name, integrity_check, file_type, attributes, size, state })
    }

    /// The 8-bit header checksum stored in the integrity check union.
    #[must_use]
    pub fn header_checksum(&self) -> u8 {
        (self.integrity_check & 0xFF) as u8
    }

    /// The 8-bit data checksum stored in the integrity check union.
    #[must_use]
    pub fn data_checksum(&self) -> u8 {
        (self.integrity_check >> 8) as u8
    }

    /// Revision 1 tail reference, the whole integrity check union.
    #[must_use]
    pub fn tail_reference(&self) -> u16 {
        self.integrity_check
    }

    #[must_use]
    pub fn attributes(&self) -> FileAttributes {
        FileAttributes::from_bits_retain(self.attributes)
    }
}

/// Reads the 64-bit extended size of a large file from its full 32-byte header.
pub fn ffs_file_extended_size(header: &[u8]) -> Result<u64> {
    let mut cursor = DataCursorRef::new(header);
    cursor.set_position(FFS_EXTENDED_SIZE_OFFSET);
    cursor.read_u64()
}

//------------------------------------------------------------------------------
// Sections
//------------------------------------------------------------------------------

// Encapsulation section types
pub const SECTION_COMPRESSION: u8 = 0x01;
pub const SECTION_GUID_DEFINED: u8 = 0x02;
pub const SECTION_DISPOSABLE: u8 = 0x03;
// Leaf section types
pub const SECTION_PE32: u8 = 0x10;
pub const SECTION_PIC: u8 = 0x11;
pub const SECTION_TE: u8 = 0x12;
pub const SECTION_DXE_DEPEX: u8 = 0x13;
pub const SECTION_VERSION: u8 = 0x14;
pub const SECTION_USER_INTERFACE: u8 = 0x15;
pub const SECTION_COMPATIBILITY16: u8 = 0x16;
pub const SECTION_FIRMWARE_VOLUME_IMAGE: u8 = 0x17;
pub const SECTION_FREEFORM_SUBTYPE_GUID: u8 = 0x18;
pub const SECTION_RAW: u8 = 0x19;
pub const SECTION_PEI_DEPEX: u8 = 0x1B;
pub const SECTION_SMM_DEPEX: u8 = 0x1C;
// Vendor-specific postcode sections
pub const SECTION_INSYDE_POSTCODE: u8 = 0x20;
pub const SECTION_SCT_POSTCODE: u8 = 0xF0;

/// A 24-bit size of all ones selects the extended header with a 32-bit size.
pub const SECTION2_IS_USED: u32 = 0xFF_FFFF;

pub const COMMON_SECTION_HEADER_SIZE: usize = 4;
pub const COMMON_SECTION_HEADER2_SIZE: usize = 8;

// Compression types
pub const EFI_NOT_COMPRESSED: u8 = 0x00;
pub const EFI_STANDARD_COMPRESSION: u8 = 0x01;
pub const EFI_CUSTOMIZED_COMPRESSION: u8 = 0x02;

/// Short human name for a section type byte.
#[must_use]
pub fn section_type_name(section_type: u8) -> &'static str {
    match section_type {
        SECTION_COMPRESSION => "Compressed",
        SECTION_GUID_DEFINED => "GUID defined",
        SECTION_DISPOSABLE => "Disposable",
        SECTION_PE32 => "PE32 image",
        SECTION_PIC => "PIC image",
        SECTION_TE => "TE image",
        SECTION_DXE_DEPEX => "DXE dependency",
        SECTION_VERSION => "Version",
        SECTION_USER_INTERFACE => "User interface",
        SECTION_COMPATIBILITY16 => "16-bit image",
        SECTION_FIRMWARE_VOLUME_IMAGE => "Volume image",
        SECTION_FREEFORM_SUBTYPE_GUID => "Freeform subtype GUID",
        SECTION_RAW => "Raw",
        SECTION_PEI_DEPEX => "PEI dependency",
        SECTION_SMM_DEPEX => "SMM dependency",
        SECTION_INSYDE_POSTCODE => "Insyde postcode",
        SECTION_SCT_POSTCODE => "SCT postcode",
        _ => "Unknown",
    }
}

/// EFI_COMMON_SECTION_HEADER with the extended size already resolved.
#[derive(Debug, Clone, Copy)]
pub struct SectionHeader {
    /// Full section size including the header.
    pub size: u32,
    pub section_type: u8,
    /// Whether the extended (`0xFFFFFF`) form is in use.
    pub extended: bool,
}

impl SectionHeader {
    pub fn parse(data: &[u8]) -> Result<Self> {
        let mut cursor = DataCursorRef::new(data);
        let size = uint24_to_u32(cursor.get_slice(3)?);
        let section_type = cursor.read_u8()?;
        if size != SECTION2_IS_USED {
            return Ok(Self { size, section_type, extended: false });
        }
        Ok(Self { size: cursor.read_u32()?, section_type, extended: true })
    }
}

// GUID-defined section attributes
pub const GUIDED_SECTION_PROCESSING_REQUIRED: u16 = 0x01;
pub const GUIDED_SECTION_AUTH_STATUS_VALID: u16 = 0x02;

/// FC1BCDB0-7D31-49AA-936A-A4600D9DD083
pub const EFI_GUIDED_SECTION_CRC32: Guid = Guid([
    0xB0, 0xCD, 0x1B, 0xFC, 0x31, 0x7D, 0xAA, 0x49, 0x93, 0x6A, 0xA4, 0x60, 0x0D, 0x9D, 0xD0, 0x83,
]);
/// A31280AD-481E-41B6-95E8-127F4C984779
pub const EFI_GUIDED_SECTION_TIANO: Guid = Guid([
    0xAD, 0x80, 0x12, 0xA3, 0x1E, 0x48, 0xB6, 0x41, 0x95, 0xE8, 0x12, 0x7F, 0x4C, 0x98, 0x47, 0x79,
]);
/// EE4E5898-3914-4259-9D6E-DC7BD79403CF
pub const EFI_GUIDED_SECTION_LZMA: Guid = Guid([
    0x98, 0x58, 0x4E, 0xEE, 0x14, 0x39, 0x59, 0x42, 0x9D, 0x6E, 0xDC, 0x7B, 0xD7, 0x94, 0x03, 0xCF,
]);
/// D42AE6BD-1352-4BFB-909A-CA72A6EAE889
pub const EFI_GUIDED_SECTION_LZMAF86: Guid = Guid([
    0xBD, 0xE6, 0x2A, 0xD4, 0x52, 0x13, 0xFB, 0x4B, 0x90, 0x9A, 0xCA, 0x72, 0xA6, 0xEA, 0xE8, 0x89,
]);
/// 0F9D89E8-9259-4F76-A5AF-0C89E34023DF
pub const EFI_FIRMWARE_CONTENTS_SIGNED_GUID: Guid = Guid([
    0xE8, 0x89, 0x9D, 0x0F, 0x59, 0x92, 0x76, 0x4F, 0xA5, 0xAF, 0x0C, 0x89, 0xE3, 0x40, 0x23, 0xDF,
]);

/// EFI_GUID_DEFINED_SECTION with the extended size already resolved.
#[derive(Debug, Clone, Copy)]
pub struct GuidDefinedSectionHeader {
    pub section_definition_guid: Guid,
    pub data_offset: u16,
    pub attributes: u16,
}

impl GuidDefinedSectionHeader {
    pub fn parse(data: &[u8]) -> Result<Self> {
        let header = SectionHeader::parse(data)?;
        let mut cursor = DataCursorRef::new(data);
        cursor.set_position(if header.extended {
            COMMON_SECTION_HEADER2_SIZE
        } else {
            COMMON_SECTION_HEADER_SIZE
        });
        let section_definition_guid = Guid::from_slice(cursor.get_slice(16)?).unwrap_or(Guid::ZERO);
        Ok(Self {
            section_definition_guid,
            data_offset: cursor.read_u16()?,
            attributes: cursor.read_u16()?,
        })
    }
}

// WIN_CERTIFICATE certificate types
pub const WIN_CERT_TYPE_PKCS_SIGNED_DATA: u16 = 0x0002;
pub const WIN_CERT_TYPE_EFI_GUID: u16 = 0x0EF1;

/// A7717414-C616-4977-9420-844712A735BF
pub const EFI_CERT_TYPE_RSA2048_SHA256_GUID: Guid = Guid([
    0x14, 0x74, 0x71, 0xA7, 0x16, 0xC6, 0x77, 0x49, 0x94, 0x20, 0x84, 0x47, 0x12, 0xA7, 0x35, 0xBF,
]);
/// 4AAFD29D-68DF-49EE-8AA9-347D375665A7
pub const EFI_CERT_TYPE_PKCS7_GUID: Guid = Guid([
    0x9D, 0xD2, 0xAF, 0x4A, 0xDF, 0x68, 0xEE, 0x49, 0x8A, 0xA9, 0x34, 0x7D, 0x37, 0x56, 0x65, 0xA7,
]);

/// WIN_CERTIFICATE
#[derive(Debug, Clone, Copy)]
pub struct WinCertificate {
    pub length: u32,
    pub revision: u16,
    pub certificate_type: u16,
}

pub const WIN_CERTIFICATE_SIZE: usize = 8;

impl WinCertificate {
    pub fn parse(data: &[u8]) -> Result<Self> {
        let mut cursor = DataCursorRef::new(data);
        Ok(Self {
            length: cursor.read_u32()?,
            revision: cursor.read_u16()?,
            certificate_type: cursor.read_u16()?,
        })
    }
}

/// WIN_CERTIFICATE_UEFI_GUID carries the certificate type GUID right after the header.
pub fn win_certificate_cert_type(data: &[u8]) -> Option<Guid> {
    Guid::from_slice(data.get(WIN_CERTIFICATE_SIZE..)?)
}

/// Computes the header size for a section, resolving the type-specific extensions, the
/// extended size form, and the certificate window of signed-contents sections.
#[must_use]
pub fn section_header_size(section: &[u8]) -> usize {
    let Ok(header) = SectionHeader::parse(section) else {
        return COMMON_SECTION_HEADER_SIZE;
    };
    let common = if header.extended {
        COMMON_SECTION_HEADER2_SIZE
    } else {
        COMMON_SECTION_HEADER_SIZE
    };
    match header.section_type {
        SECTION_GUID_DEFINED => {
            let Ok(guided) = GuidDefinedSectionHeader::parse(section) else {
                return common;
            };
            let mut size = usize::from(guided.data_offset);
            if guided.section_definition_guid == EFI_FIRMWARE_CONTENTS_SIGNED_GUID {
                if let Some(certificate) =
                    section.get(common + 20..).and_then(|rest| WinCertificate::parse(rest).ok())
                {
                    size += certificate.length as usize;
                }
            }
            size
        }
        SECTION_COMPRESSION => common + 5,
        SECTION_VERSION => common + 2,
        SECTION_FREEFORM_SUBTYPE_GUID => common + 16,
        SECTION_INSYDE_POSTCODE | SECTION_SCT_POSTCODE => common + 4,
        _ => common,
    }
}

//------------------------------------------------------------------------------
// Dependency expressions
//------------------------------------------------------------------------------

/// Opcodes of the dependency expression byte code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum DepexOpcode {
    Before = 0x00,
    After = 0x01,
    Push = 0x02,
    And = 0x03,
    Or = 0x04,
    Not = 0x05,
    True = 0x06,
    False = 0x07,
    End = 0x08,
    Sor = 0x09,
}

impl core::fmt::Display for DepexOpcode {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let name = match self {
            Self::Before => "BEFORE",
            Self::After => "AFTER",
            Self::Push => "PUSH",
            Self::And => "AND",
            Self::Or => "OR",
            Self::Not => "NOT",
            Self::True => "TRUE",
            Self::False => "FALSE",
            Self::End => "END",
            Self::Sor => "SOR",
        };
        f.write_str(name)
    }
}

//------------------------------------------------------------------------------
// 24-bit sizes
//------------------------------------------------------------------------------

/// Reads a 24-bit little-endian size field.
#[must_use]
pub fn uint24_to_u32(bytes: &[u8]) -> u32 {
    (u32::from(bytes[2]) << 16) | (u32::from(bytes[1]) << 8) | u32::from(bytes[0])
}

/// Writes a 24-bit little-endian size field.
#[must_use]
pub fn u32_to_uint24(value: u32) -> [u8; 3] {
    [value as u8, (value >> 8) as u8, (value >> 16) as u8]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uint24_round_trip() {
        assert_eq!(uint24_to_u32(&[0x78, 0x56, 0x34]), 0x345678);
        assert_eq!(u32_to_uint24(0x345678), [0x78, 0x56, 0x34]);
        assert_eq!(uint24_to_u32(&u32_to_uint24(SECTION2_IS_USED)), SECTION2_IS_USED);
    }

    #[test]
    fn guid_constants_format() {
        assert_eq!(
            EFI_GUIDED_SECTION_LZMA.to_string(),
            "EE4E5898-3914-4259-9D6E-DC7BD79403CF"
        );
        assert_eq!(
            EFI_FFS_VOLUME_TOP_FILE_GUID.to_string(),
            "1BA0062E-C779-4582-8566-336AE8F78F09"
        );
        assert_eq!(
            EFI_GUIDED_SECTION_LZMAF86.to_string(),
            "D42AE6BD-1352-4BFB-909A-CA72A6EAE889"
        );
    }

    #[test]
    fn section_header_sizes() {
        // Plain raw section
        let raw = [0x10, 0x00, 0x00, SECTION_RAW];
        assert_eq!(section_header_size(&raw), COMMON_SECTION_HEADER_SIZE);

        // Compression section
        let mut compressed = vec![0u8; 16];
        compressed[..3].copy_from_slice(&u32_to_uint24(16));
        compressed[3] = SECTION_COMPRESSION;
        assert_eq!(section_header_size(&compressed), 9);

        // Extended raw section
        let mut extended = vec![0u8; 12];
        extended[..3].copy_from_slice(&u32_to_uint24(SECTION2_IS_USED));
        extended[3] = SECTION_RAW;
        extended[4..8].copy_from_slice(&0x1000_0000u32.to_le_bytes());
        let header = SectionHeader::parse(&extended).unwrap();
        assert!(header.extended);
        assert_eq!(header.size, 0x1000_0000);
        assert_eq!(section_header_size(&extended), COMMON_SECTION_HEADER2_SIZE);
    }

    #[test]
    fn file_header_fields() {
        let mut data = vec![0u8; FFS_FILE_HEADER_SIZE];
        data[..16].copy_from_slice(EFI_FFS_PAD_FILE_GUID.as_bytes());
        data[16] = 0x12; // header checksum
        data[17] = 0xAA; // data checksum
        data[18] = FILETYPE_PAD;
        data[19] = 0x40;
        data[20..23].copy_from_slice(&u32_to_uint24(0x30));
        data[23] = 0xF8;

        let header = FfsFileHeader::parse(&data).unwrap();
        assert_eq!(header.name, EFI_FFS_PAD_FILE_GUID);
        assert_eq!(header.header_checksum(), 0x12);
        assert_eq!(header.data_checksum(), 0xAA);
        assert_eq!(header.file_type, FILETYPE_PAD);
        assert!(header.attributes().contains(FileAttributes::CHECKSUM));
        assert_eq!(header.size, 0x30);
        assert_eq!(header.state, 0xF8);
    }
}
