//! Recursive descent from a flat byte buffer into the typed tree.
//!
//! Every level validates its own invariants and queues advisory messages on violations;
//! structural corruption aborts only the container it was found in, so siblings still parse.

use hashbrown::HashSet;
use vulcan_core::checksum;
use vulcan_core::prelude::*;
use vulcan_core::util::{align4, align8};
use vulcan_eficomp::prelude::*;

use crate::descriptor::{
    self, ComponentSection, DescriptorMap, DescriptorVersion, MasterSection, MasterSectionV2,
    RegionSection, UpperMap, VsccTableEntry, FLASH_DESCRIPTOR_MAX_BASE, FLASH_DESCRIPTOR_SIZE,
    FLASH_DESCRIPTOR_VERSION_INVALID, FLASH_FREQUENCY_20MHZ, VSCC_TABLE_ENTRY_SIZE,
};
use crate::engine::FfsEngine;
use crate::errors::{ErrorKind, Result};
use crate::ffs::{self, BlockMapEntry, CapsuleHeader, FfsFileHeader, FileAttributes,
    GuidDefinedSectionHeader, SectionHeader, VolumeExtHeader, VolumeHeader};
use crate::gbe::{GbeMac, GbeVersion};
use crate::me;
use crate::messages::Severity;
use crate::peimage;
use crate::treemodel::NodeId;
use crate::types::{
    CapsuleSubtype, Compression, ErasePolarity, ImageSubtype, InsertMode, ItemType,
    PaddingSubtype, RegionSubtype, Subtype, VolumeSubtype,
};

/// Dictionary size assumed when a stream does not carry one.
pub(crate) const DEFAULT_LZMA_DICTIONARY_SIZE: u32 = 0x0080_0000;

/// `QByteArray::mid` semantics: clamps instead of panicking on short buffers.
fn mid(data: &[u8], offset: usize, size: usize) -> &[u8] {
    let start = offset.min(data.len());
    let end = offset.saturating_add(size).min(data.len());
    &data[start..end]
}

fn all_bytes(data: &[u8], value: u8) -> bool {
    data.iter().all(|&byte| byte == value)
}

/// Decodes a NUL-terminated UTF-16LE string.
fn utf16_string(data: &[u8]) -> String {
    let units: Vec<u16> = data
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .take_while(|&unit| unit != 0)
        .collect();
    String::from_utf16_lossy(&units)
}

fn full_size_info(size: usize) -> String {
    format!("Full size: {size:X}h ({size})")
}

impl FfsEngine {
    /// Parses a firmware image into a fresh tree.
    ///
    /// Succeeds when at least the capsule/region/volume layout could be identified; failures
    /// inside inner nodes become messages instead of aborting the parse.
    pub fn parse_image_file(&mut self, buffer: &[u8]) -> Result<()> {
        self.model = crate::treemodel::TreeModel::new();
        self.old_pei_core_entry_point = 0;

        if buffer.len() <= ffs::CAPSULE_HEADER_SIZE {
            self.msg(
                Severity::Error,
                format!(
                    "parse_image_file: image file is smaller than minimum size of {:X}h ({}) bytes",
                    ffs::CAPSULE_HEADER_SIZE,
                    ffs::CAPSULE_HEADER_SIZE
                ),
                None,
            );
            return Err(ErrorKind::InvalidParameter);
        }

        // Check buffer for being one of the known capsule types
        let mut capsule_header_size = 0usize;
        let mut index = self.model.root();
        let prefix = Guid::from_slice(buffer);
        if prefix == Some(ffs::EFI_CAPSULE_GUID) || prefix == Some(ffs::INTEL_CAPSULE_GUID) {
            let capsule = CapsuleHeader::parse(buffer).map_err(|_| ErrorKind::InvalidParameter)?;
            capsule_header_size = capsule.header_size as usize;
            let info = format!(
                "Capsule GUID: {}\n{}\nHeader size: {:X}h ({})\nImage size: {:X}h ({})\nFlags: {:08X}h",
                capsule.capsule_guid,
                full_size_info(buffer.len()),
                capsule.header_size,
                capsule.header_size,
                capsule.capsule_image_size,
                capsule.capsule_image_size,
                capsule.flags
            );
            index = self.model.add_item(
                ItemType::Capsule,
                Subtype::Capsule(CapsuleSubtype::Uefi),
                Compression::None,
                "UEFI capsule",
                "",
                &info,
                mid(buffer, 0, capsule_header_size),
                mid(buffer, capsule_header_size, buffer.len()),
                index,
                InsertMode::Append,
            );
        } else if prefix == Some(ffs::TOSHIBA_CAPSULE_GUID) {
            let capsule =
                ffs::ToshibaCapsuleHeader::parse(buffer).map_err(|_| ErrorKind::InvalidParameter)?;
            capsule_header_size = capsule.header_size as usize;
            let image_size = capsule.full_size.saturating_sub(capsule.header_size);
            let info = format!(
                "Capsule GUID: {}\n{}\nHeader size: {:X}h ({})\nImage size: {:X}h ({})\nFlags: {:08X}h",
                capsule.capsule_guid,
                full_size_info(buffer.len()),
                capsule.header_size,
                capsule.header_size,
                image_size,
                image_size,
                capsule.flags
            );
            index = self.model.add_item(
                ItemType::Capsule,
                Subtype::Capsule(CapsuleSubtype::Toshiba),
                Compression::None,
                "UEFI capsule",
                "",
                &info,
                mid(buffer, 0, capsule_header_size),
                mid(buffer, capsule_header_size, buffer.len()),
                index,
                InsertMode::Append,
            );
        } else if prefix == Some(ffs::APTIO_SIGNED_CAPSULE_GUID)
            || prefix == Some(ffs::APTIO_UNSIGNED_CAPSULE_GUID)
        {
            let signed = prefix == Some(ffs::APTIO_SIGNED_CAPSULE_GUID);
            let capsule =
                ffs::AptioCapsuleHeader::parse(buffer).map_err(|_| ErrorKind::InvalidParameter)?;
            capsule_header_size = usize::from(capsule.rom_image_offset);
            let image_size =
                capsule.capsule_header.capsule_image_size.saturating_sub(capsule_header_size as u32);
            let info = format!(
                "Capsule GUID: {}\n{}\nHeader size: {:X}h ({})\nImage size: {:X}h ({})\nFlags: {:08X}h",
                capsule.capsule_header.capsule_guid,
                full_size_info(buffer.len()),
                capsule_header_size,
                capsule_header_size,
                image_size,
                image_size,
                capsule.capsule_header.flags
            );
            let subtype = if signed {
                CapsuleSubtype::AptioSigned
            } else {
                CapsuleSubtype::AptioUnsigned
            };
            index = self.model.add_item(
                ItemType::Capsule,
                Subtype::Capsule(subtype),
                Compression::None,
                "AMI Aptio capsule",
                "",
                &info,
                mid(buffer, 0, capsule_header_size),
                mid(buffer, capsule_header_size, buffer.len()),
                index,
                InsertMode::Append,
            );
            if signed {
                self.msg(
                    Severity::Warning,
                    "parse_image_file: Aptio capsule signature may become invalid after image modifications"
                        .to_owned(),
                    Some(index),
                );
            }
        }

        // Skip the capsule header to get to the flash chip image
        let flash_image = mid(buffer, capsule_header_size, buffer.len());

        // Check for Intel flash descriptor presence
        if flash_image.len() >= 20 {
            let mut cursor = DataCursorRef::new(flash_image);
            cursor.set_position(16);
            if cursor.read_u32().unwrap_or(0) == descriptor::FLASH_DESCRIPTOR_SIGNATURE {
                match self.parse_intel_image(flash_image, index) {
                    Err(ErrorKind::InvalidFlashDescriptor) => {} // fall through to UEFI image
                    other => return other.map(|_| ()),
                }
            }
        }

        let info = full_size_info(flash_image.len());
        let image_index = self.model.add_item(
            ItemType::Image,
            Subtype::Image(ImageSubtype::Uefi),
            Compression::None,
            "UEFI image",
            "",
            &info,
            &[],
            flash_image,
            index,
            InsertMode::Append,
        );
        self.parse_bios(flash_image, image_index)
    }

    /// Parses a full Intel image: descriptor, then each region in ascending offset order.
    pub(crate) fn parse_intel_image(
        &mut self, intel_image: &[u8], parent: NodeId,
    ) -> Result<NodeId> {
        if intel_image.is_empty() {
            return Err(ErrorKind::InvalidParameter);
        }
        if intel_image.len() < FLASH_DESCRIPTOR_SIZE {
            self.msg(
                Severity::Error,
                "parse_intel_image: input file is smaller than minimum descriptor size of 1000h (4096) bytes"
                    .to_owned(),
                None,
            );
            return Err(ErrorKind::InvalidFlashDescriptor);
        }

        let map = DescriptorMap::parse(intel_image).map_err(|_| ErrorKind::InvalidFlashDescriptor)?;

        // Check sanity of the map's base values
        if map.master_base > FLASH_DESCRIPTOR_MAX_BASE
            || map.master_base == map.region_base
            || map.master_base == map.component_base
        {
            self.msg(
                Severity::Error,
                format!("parse_intel_image: invalid descriptor master base {:02X}h", map.master_base),
                None,
            );
            return Err(ErrorKind::InvalidFlashDescriptor);
        }
        if map.region_base > FLASH_DESCRIPTOR_MAX_BASE || map.region_base == map.component_base {
            self.msg(
                Severity::Error,
                format!("parse_intel_image: invalid descriptor region base {:02X}h", map.region_base),
                None,
            );
            return Err(ErrorKind::InvalidFlashDescriptor);
        }
        if map.component_base > FLASH_DESCRIPTOR_MAX_BASE {
            self.msg(
                Severity::Error,
                format!(
                    "parse_intel_image: invalid descriptor component base {:02X}h",
                    map.component_base
                ),
                None,
            );
            return Err(ErrorKind::InvalidFlashDescriptor);
        }

        let regions = RegionSection::parse(intel_image, map.region_base)
            .map_err(|_| ErrorKind::InvalidFlashDescriptor)?;
        let component = ComponentSection::parse(intel_image, map.component_base)
            .map_err(|_| ErrorKind::InvalidFlashDescriptor)?;

        // Hardcoded clock value tells legacy descriptors apart from Skylake+ ones
        let descriptor_version: u8 =
            if component.read_clock_frequency() == FLASH_FREQUENCY_20MHZ { 1 } else { 2 };

        let descriptor_begin = 0u32;
        let descriptor_end = FLASH_DESCRIPTOR_SIZE as u32;

        let me_begin = regions.me.offset();
        let me_end = if regions.me.present() { me_begin + regions.me.size() } else { 0 };

        if !regions.bios.present() {
            self.msg(
                Severity::Error,
                "parse_intel_image: descriptor parsing failed, BIOS region not found in descriptor"
                    .to_owned(),
                None,
            );
            return Err(ErrorKind::InvalidFlashDescriptor);
        }
        let mut bios_begin = regions.bios.offset();
        let mut bios_end = regions.bios.size();
        // Gigabyte-specific map: BIOS region is declared to span the whole image
        if bios_end == intel_image.len() as u32 {
            if me_end == 0 {
                self.msg(
                    Severity::Error,
                    "parse_intel_image: can't determine BIOS region start from Gigabyte-specific descriptor"
                        .to_owned(),
                    None,
                );
                return Err(ErrorKind::InvalidFlashDescriptor);
            }
            bios_begin = me_end;
            // bios_end points at the end of the image, padding after the BIOS region can't
            // be detected with a malformed descriptor
        } else {
            bios_end += bios_begin;
        }

        let gbe_begin = regions.gbe.offset();
        let gbe_end = if regions.gbe.present() { gbe_begin + regions.gbe.size() } else { 0 };
        let pdr_begin = regions.pdr.offset();
        let pdr_end = if regions.pdr.present() { pdr_begin + regions.pdr.size() } else { 0 };
        let (ec_begin, ec_end) = if descriptor_version == 2 && regions.ec.present() {
            (regions.ec.offset(), regions.ec.offset() + regions.ec.size())
        } else {
            (0, 0)
        };

        // Check for intersections between regions
        let mut ranges: Vec<(&str, u32, u32)> = vec![("descriptor", descriptor_begin, descriptor_end)];
        if gbe_end != 0 {
            ranges.push(("GbE", gbe_begin, gbe_end));
        }
        if me_end != 0 {
            ranges.push(("ME", me_begin, me_end));
        }
        ranges.push(("BIOS", bios_begin, bios_end));
        if pdr_end != 0 {
            ranges.push(("PDR", pdr_begin, pdr_end));
        }
        if ec_end != 0 {
            ranges.push(("EC", ec_begin, ec_end));
        }
        for first in 0..ranges.len() {
            for second in first + 1..ranges.len() {
                let (name1, begin1, end1) = ranges[first];
                let (name2, begin2, end2) = ranges[second];
                if Self::has_intersection(begin1, end1, begin2, end2) {
                    self.msg(
                        Severity::Error,
                        format!(
                            "parse_intel_image: descriptor parsing failed, {name1} region has intersection with {name2} region"
                        ),
                        None,
                    );
                    return Err(ErrorKind::InvalidFlashDescriptor);
                }
            }
        }

        // Region map is consistent, add the Intel image node
        let info = format!(
            "{}\nFlash chips: {}\nMasters: {}\nPCH straps: {}\nCPU straps: {}\n",
            full_size_info(intel_image.len()),
            map.number_of_flash_chips + 1,
            map.number_of_masters + 1,
            map.number_of_pch_straps,
            map.number_of_proc_straps
        );
        let index = self.model.add_item(
            ItemType::Image,
            Subtype::Image(ImageSubtype::Intel),
            Compression::None,
            "Intel image",
            "",
            &info,
            &[],
            intel_image,
            parent,
            InsertMode::Append,
        );

        // Descriptor region node
        let mut info = format!("Full size: {:X}h ({})", FLASH_DESCRIPTOR_SIZE, FLASH_DESCRIPTOR_SIZE);
        let mut offsets: Vec<(u32, RegionSubtype)> = Vec::new();
        if regions.gbe.present() {
            offsets.push((gbe_begin, RegionSubtype::Gbe));
            info.push_str(&format!("\nGbE region offset:  {gbe_begin:X}h"));
        }
        if regions.me.present() {
            offsets.push((me_begin, RegionSubtype::Me));
            info.push_str(&format!("\nME region offset:   {me_begin:X}h"));
        }
        offsets.push((bios_begin, RegionSubtype::Bios));
        info.push_str(&format!("\nBIOS region offset: {bios_begin:X}h"));
        if regions.pdr.present() {
            offsets.push((pdr_begin, RegionSubtype::Pdr));
            info.push_str(&format!("\nPDR region offset:  {pdr_begin:X}h"));
        }
        if ec_end != 0 {
            offsets.push((ec_begin, RegionSubtype::Ec));
            info.push_str(&format!("\nEC region offset:  {ec_begin:X}h"));
        }

        // Region access settings
        if descriptor_version == 1 {
            if let Ok(master) = MasterSection::parse(intel_image, map.master_base) {
                info.push_str("\nRegion access settings:");
                info.push_str(&format!(
                    "\nBIOS:{:02X}h {:02X}h ME:{:02X}h {:02X}h GbE:{:02X}h {:02X}h",
                    master.bios_read,
                    master.bios_write,
                    master.me_read,
                    master.me_write,
                    master.gbe_read,
                    master.gbe_write
                ));
                info.push_str(&bios_access_table(
                    u16::from(master.bios_read),
                    u16::from(master.bios_write),
                    false,
                ));
            }
        } else if let Ok(master) = MasterSectionV2::parse(intel_image, map.master_base) {
            info.push_str("\nRegion access settings:");
            info.push_str(&format!(
                "\nBIOS: {:03X}h {:03X}h ME: {:03X}h {:03X}h\nGbE:  {:03X}h {:03X}h EC: {:03X}h {:03X}h",
                master.bios_read,
                master.bios_write,
                master.me_read,
                master.me_write,
                master.gbe_read,
                master.gbe_write,
                master.ec_read,
                master.ec_write
            ));
            info.push_str(&bios_access_table(master.bios_read, master.bios_write, true));

            if map.descriptor_version != FLASH_DESCRIPTOR_VERSION_INVALID {
                let version = DescriptorVersion::from_raw(map.descriptor_version);
                let mut version_str =
                    format!("Flash descriptor version: {}.{}", version.major, version.minor);
                if version.major != descriptor::FLASH_DESCRIPTOR_VERSION_MAJOR
                    || version.minor != descriptor::FLASH_DESCRIPTOR_VERSION_MINOR
                {
                    version_str.push_str(", unknown");
                    self.msg(
                        Severity::Warning,
                        format!(
                            "parse_intel_image: unknown flash descriptor version {}.{}",
                            version.major, version.minor
                        ),
                        None,
                    );
                }
                info = format!("{version_str}\n{info}");
            }
        }

        // VSCC table
        if let Ok(upper_map) = UpperMap::parse(intel_image) {
            info.push_str("\nFlash chips in VSCC table:");
            let table_offset = usize::from(upper_map.vscc_table_base) << 4;
            let entry_count = usize::from(upper_map.vscc_table_size) * 4 / VSCC_TABLE_ENTRY_SIZE;
            for entry_index in 0..entry_count {
                let offset = table_offset + entry_index * VSCC_TABLE_ENTRY_SIZE;
                if let Ok(entry) = VsccTableEntry::parse(mid(intel_image, offset, VSCC_TABLE_ENTRY_SIZE))
                {
                    info.push_str(&format!(
                        "\n{:02X}{:02X}{:02X}h",
                        entry.vendor_id, entry.device_id0, entry.device_id1
                    ));
                }
            }
        }

        self.model.add_item(
            ItemType::Region,
            Subtype::Region(RegionSubtype::Descriptor),
            Compression::None,
            "Descriptor region",
            "",
            &info,
            &[],
            mid(intel_image, 0, FLASH_DESCRIPTOR_SIZE),
            index,
            InsertMode::Append,
        );

        // Parse regions in ascending offset order
        offsets.sort_unstable();
        for &(offset, subtype) in &offsets {
            let result = match subtype {
                RegionSubtype::Gbe => self
                    .parse_gbe_region(
                        mid(intel_image, offset as usize, (gbe_end - gbe_begin) as usize),
                        index,
                        InsertMode::Append,
                    )
                    .map(|_| ()),
                RegionSubtype::Me => self
                    .parse_me_region(
                        mid(intel_image, offset as usize, (me_end - me_begin) as usize),
                        index,
                        InsertMode::Append,
                    )
                    .map(|_| ()),
                RegionSubtype::Bios => self
                    .parse_bios_region(
                        mid(intel_image, offset as usize, (bios_end - bios_begin) as usize),
                        index,
                        InsertMode::Append,
                    )
                    .map(|_| ()),
                RegionSubtype::Pdr => self
                    .parse_pdr_region(
                        mid(intel_image, offset as usize, (pdr_end - pdr_begin) as usize),
                        index,
                        InsertMode::Append,
                    )
                    .map(|_| ()),
                RegionSubtype::Ec => self
                    .parse_ec_region(
                        mid(intel_image, offset as usize, (ec_end - ec_begin) as usize),
                        index,
                        InsertMode::Append,
                    )
                    .map(|_| ()),
                RegionSubtype::Descriptor => Ok(()),
            };
            result?;
        }

        // Add the data after the last region as padding
        let last_region_end = offsets
            .iter()
            .map(|&(offset, subtype)| match subtype {
                RegionSubtype::Gbe => gbe_end,
                RegionSubtype::Me => me_end,
                RegionSubtype::Bios => bios_end,
                RegionSubtype::Pdr => pdr_end,
                RegionSubtype::Ec => ec_end,
                RegionSubtype::Descriptor => offset,
            })
            .max()
            .unwrap_or(descriptor_end);

        if last_region_end > intel_image.len() as u32 {
            self.msg(
                Severity::Error,
                format!(
                    "parse_intel_image: image size {:X}h ({}) is smaller than the end of last region {:X}h ({}), may be damaged",
                    intel_image.len(),
                    intel_image.len(),
                    last_region_end,
                    last_region_end
                ),
                Some(index),
            );
            return Err(ErrorKind::TruncatedImage);
        } else if (last_region_end as usize) < intel_image.len() {
            let padding = &intel_image[last_region_end as usize..];
            let info = full_size_info(padding.len());
            self.model.add_item(
                ItemType::Padding,
                Subtype::Padding(get_padding_type(padding)),
                Compression::None,
                "Padding",
                "",
                &info,
                &[],
                padding,
                index,
                InsertMode::Append,
            );
        }

        Ok(index)
    }

    pub(crate) fn parse_gbe_region(
        &mut self, gbe: &[u8], parent: NodeId, mode: InsertMode,
    ) -> Result<NodeId> {
        if gbe.is_empty() {
            return Err(ErrorKind::EmptyRegion);
        }
        let mut info = full_size_info(gbe.len());
        if let (Ok(mac), Ok(version)) = (GbeMac::parse(gbe), GbeVersion::parse(gbe)) {
            info.push_str(&format!(
                "\nMAC: {:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}\nVersion: {}.{}",
                mac.vendor[0],
                mac.vendor[1],
                mac.vendor[2],
                mac.device[0],
                mac.device[1],
                mac.device[2],
                version.major,
                version.minor
            ));
        }
        Ok(self.model.add_item(
            ItemType::Region,
            Subtype::Region(RegionSubtype::Gbe),
            Compression::None,
            "GbE region",
            "",
            &info,
            &[],
            gbe,
            parent,
            mode,
        ))
    }

    pub(crate) fn parse_me_region(
        &mut self, me_region: &[u8], parent: NodeId, mode: InsertMode,
    ) -> Result<NodeId> {
        if me_region.is_empty() {
            return Err(ErrorKind::EmptyRegion);
        }
        let mut info = full_size_info(me_region.len());

        let mut empty_region = false;
        let mut version_found = true;
        if all_bytes(me_region, 0xFF) || all_bytes(me_region, 0x00) {
            empty_region = true;
            info.push_str("\nState: empty");
        } else {
            match me::find_version(me_region) {
                Some(version) => info.push_str(&format!(
                    "\nVersion: {}.{}.{}.{}",
                    version.major, version.minor, version.bugfix, version.build
                )),
                None => {
                    info.push_str("\nVersion: unknown");
                    version_found = false;
                }
            }
        }

        let index = self.model.add_item(
            ItemType::Region,
            Subtype::Region(RegionSubtype::Me),
            Compression::None,
            "ME region",
            "",
            &info,
            &[],
            me_region,
            parent,
            mode,
        );

        if empty_region {
            self.msg(Severity::Info, "parse_me_region: ME region is empty".to_owned(), Some(index));
        } else if !version_found {
            self.msg(
                Severity::Warning,
                "parse_me_region: ME region version is unknown, it can be damaged".to_owned(),
                Some(index),
            );
        }
        Ok(index)
    }

    pub(crate) fn parse_pdr_region(
        &mut self, pdr: &[u8], parent: NodeId, mode: InsertMode,
    ) -> Result<NodeId> {
        if pdr.is_empty() {
            return Err(ErrorKind::EmptyRegion);
        }
        let info = full_size_info(pdr.len());
        let index = self.model.add_item(
            ItemType::Region,
            Subtype::Region(RegionSubtype::Pdr),
            Compression::None,
            "PDR region",
            "",
            &info,
            &[],
            pdr,
            parent,
            mode,
        );
        // PDR regions sometimes hold a volume, parse them as BIOS space
        match self.parse_bios(pdr, index) {
            Ok(()) | Err(ErrorKind::ItemNotFound | ErrorKind::InvalidVolume) => Ok(index),
            Err(error) => Err(error),
        }
    }

    pub(crate) fn parse_ec_region(
        &mut self, ec: &[u8], parent: NodeId, mode: InsertMode,
    ) -> Result<NodeId> {
        if ec.is_empty() {
            return Err(ErrorKind::EmptyRegion);
        }
        let info = full_size_info(ec.len());
        Ok(self.model.add_item(
            ItemType::Region,
            Subtype::Region(RegionSubtype::Ec),
            Compression::None,
            "EC region",
            "",
            &info,
            &[],
            ec,
            parent,
            mode,
        ))
    }

    pub(crate) fn parse_bios_region(
        &mut self, bios: &[u8], parent: NodeId, mode: InsertMode,
    ) -> Result<NodeId> {
        if bios.is_empty() {
            return Err(ErrorKind::EmptyRegion);
        }
        let info = full_size_info(bios.len());
        let index = self.model.add_item(
            ItemType::Region,
            Subtype::Region(RegionSubtype::Bios),
            Compression::None,
            "BIOS region",
            "",
            &info,
            &[],
            bios,
            parent,
            mode,
        );
        self.parse_bios(bios, index).map(|()| index)
    }

    /// Searches BIOS space for firmware volumes, representing the gaps as padding.
    pub(crate) fn parse_bios(&mut self, bios: &[u8], parent: NodeId) -> Result<()> {
        let Some(first_offset) = find_next_volume(bios, 0) else {
            return Err(ErrorKind::ItemNotFound);
        };

        // First volume is not at the beginning of BIOS space
        if first_offset > 0 {
            let padding = &bios[..first_offset];
            let info = full_size_info(padding.len());
            let index = self.model.add_item(
                ItemType::Padding,
                Subtype::Padding(get_padding_type(padding)),
                Compression::None,
                "Padding",
                "",
                &info,
                &[],
                padding,
                parent,
                InsertMode::Append,
            );
            if let Some(described) = crate::bootguard::describe(padding) {
                self.model.add_info(index, &format!("\n{described}"));
            }
        }

        // Search for and parse all volumes
        let mut prev_volume_offset = first_offset;
        let mut prev_volume_size = 0usize;
        let mut volume_offset = first_offset;

        loop {
            if self.cancelled() {
                return Ok(());
            }

            // Padding between volumes
            if volume_offset > prev_volume_offset + prev_volume_size {
                let padding = &bios[prev_volume_offset + prev_volume_size..volume_offset];
                let info = full_size_info(padding.len());
                self.model.add_item(
                    ItemType::Padding,
                    Subtype::Padding(get_padding_type(padding)),
                    Compression::None,
                    "Padding",
                    "",
                    &info,
                    &[],
                    padding,
                    parent,
                    InsertMode::Append,
                );
            }

            let (volume_size, bm_volume_size) = match get_volume_size(bios, volume_offset) {
                Ok(sizes) => sizes,
                Err(error) => {
                    self.msg(
                        Severity::Error,
                        format!("parse_bios: get_volume_size failed with error \"{error}\""),
                        Some(parent),
                    );
                    return Err(error);
                }
            };

            // Check that the volume is fully present in the input
            if volume_size as usize > bios.len()
                || volume_offset + volume_size as usize > bios.len()
            {
                self.msg(
                    Severity::Error,
                    "parse_bios: one of volumes inside overlaps the end of data".to_owned(),
                    Some(parent),
                );
                return Err(ErrorKind::InvalidVolume);
            }

            let volume_header =
                VolumeHeader::parse(&bios[volume_offset..]).map_err(|_| ErrorKind::InvalidVolume)?;
            let mut msg_alignment_bits_set = false;
            let mut msg_unaligned = false;
            let mut msg_unknown_revision = false;
            match volume_header.revision {
                1 => {
                    if volume_header.attributes & ffs::FVB_ALIGNMENT_CAP == 0
                        && volume_header.attributes & 0xFFFF_0000 != 0
                    {
                        msg_alignment_bits_set = true;
                    }
                }
                2 => {
                    let alignment =
                        1u32 << ((volume_header.attributes & ffs::FVB2_ALIGNMENT) >> 16);
                    if volume_offset as u32 % alignment != 0 {
                        msg_unaligned = true;
                    }
                }
                _ => msg_unknown_revision = true,
            }

            // Parse the volume
            let index = match self
                .parse_volume(&bios[volume_offset..volume_offset + volume_size as usize], parent, InsertMode::Append)
            {
                Ok(index) => Some(index),
                Err(error) => {
                    self.msg(
                        Severity::Error,
                        format!("parse_bios: volume parsing failed with error \"{error}\""),
                        Some(parent),
                    );
                    None
                }
            };

            if msg_alignment_bits_set {
                self.msg(
                    Severity::Warning,
                    "parse_bios: alignment bits set on volume without alignment capability"
                        .to_owned(),
                    index,
                );
            }
            if msg_unaligned {
                self.msg(Severity::Warning, "parse_bios: unaligned revision 2 volume".to_owned(), index);
            }
            if msg_unknown_revision {
                self.msg(
                    Severity::Warning,
                    format!("parse_bios: unknown volume revision {}", volume_header.revision),
                    index,
                );
            }
            if volume_size != bm_volume_size {
                self.msg(
                    Severity::Warning,
                    format!(
                        "parse_bios: volume size stored in header {volume_size:X}h differs from calculated using block map {bm_volume_size:X}h"
                    ),
                    index,
                );
            }

            // Go to the next volume
            prev_volume_offset = volume_offset;
            prev_volume_size = volume_size as usize;
            match find_next_volume(bios, volume_offset + prev_volume_size) {
                Some(next) => volume_offset = next,
                None => {
                    // Padding at the end of BIOS space
                    let end = prev_volume_offset + prev_volume_size;
                    if end < bios.len() {
                        let padding = &bios[end..];
                        let info = full_size_info(padding.len());
                        self.model.add_item(
                            ItemType::Padding,
                            Subtype::Padding(get_padding_type(padding)),
                            Compression::None,
                            "Padding",
                            "",
                            &info,
                            &[],
                            padding,
                            parent,
                            InsertMode::Append,
                        );
                    }
                    break;
                }
            }
        }

        Ok(())
    }

    /// Parses one firmware volume and the FFS files inside it.
    pub(crate) fn parse_volume(
        &mut self, volume: &[u8], parent: NodeId, mode: InsertMode,
    ) -> Result<NodeId> {
        if volume.len() < ffs::VOLUME_HEADER_SIZE {
            self.msg(
                Severity::Error,
                format!(
                    "parse_volume: input volume size {:X}h ({}) is smaller than volume header size 40h (64)",
                    volume.len(),
                    volume.len()
                ),
                None,
            );
            return Err(ErrorKind::InvalidVolume);
        }
        let volume_header = VolumeHeader::parse(volume).map_err(|_| ErrorKind::InvalidVolume)?;

        if align8(usize::from(volume_header.header_length)) > volume.len() {
            self.msg(
                Severity::Error,
                "parse_volume: volume header overlaps the end of data".to_owned(),
                None,
            );
            return Err(ErrorKind::InvalidVolume);
        }
        if volume_header.ext_header_offset > 0
            && volume.len()
                < align8(usize::from(volume_header.ext_header_offset) + ffs::VOLUME_EXT_HEADER_SIZE)
        {
            self.msg(
                Severity::Error,
                "parse_volume: extended volume header overlaps the end of data".to_owned(),
                None,
            );
            return Err(ErrorKind::InvalidVolume);
        }

        // Calculate the volume header size
        let mut header_size = if volume_header.revision > 1 && volume_header.ext_header_offset > 0 {
            let ext_header =
                VolumeExtHeader::parse(&volume[usize::from(volume_header.ext_header_offset)..])
                    .map_err(|_| ErrorKind::InvalidVolume)?;
            usize::from(volume_header.ext_header_offset) + ext_header.ext_header_size as usize
        } else {
            usize::from(volume_header.header_length)
        };
        // Sanity after some crazy images with misaligned ext headers
        header_size = align8(header_size);
        if header_size > volume.len() {
            return Err(ErrorKind::InvalidVolume);
        }

        // Check for FFS v2/v3 volume
        let subtype = if ffs::FFS2_VOLUME_GUIDS.contains(&volume_header.filesystem_guid) {
            VolumeSubtype::Ffs2
        } else if ffs::FFS3_VOLUME_GUIDS.contains(&volume_header.filesystem_guid) {
            VolumeSubtype::Ffs3
        } else {
            VolumeSubtype::Unknown
        };

        let polarity = if volume_header.erase_polarity() {
            ErasePolarity::One
        } else {
            ErasePolarity::Zero
        };
        let empty = polarity.empty_byte();

        let (volume_size, _) = get_volume_size(volume, 0)?;
        if (volume_size as usize) < header_size
            || (volume_size as usize) < usize::from(volume_header.header_length)
        {
            return Err(ErrorKind::InvalidVolume);
        }

        // Check for Apple conventions hidden in the zero vector
        let mut cursor = DataCursorRef::new(volume);
        cursor.set_position(ffs::VOLUME_ZV_CRC32_OFFSET);
        let crc32_from_zero_vector = cursor.read_u32().unwrap_or(0);
        let free_space_offset_from_zero_vector = cursor.read_u32().unwrap_or(0);
        let mut volume_has_zv_crc = false;
        let mut volume_has_zv_fso = false;
        if crc32_from_zero_vector != 0 {
            let body = mid(volume, usize::from(volume_header.header_length), volume_size as usize - usize::from(volume_header.header_length));
            if checksum::crc32(0, body) == crc32_from_zero_vector {
                volume_has_zv_crc = true;
            }
            if free_space_offset_from_zero_vector != 0 {
                volume_has_zv_fso = true;
            }
        }

        // Check the header checksum by recalculating it
        let msg_invalid_checksum =
            checksum::checksum16(&volume[..usize::from(volume_header.header_length)]) != 0;

        let name = volume_header.filesystem_guid.to_string();
        let zv = &volume_header.zero_vector;
        let mut info = format!(
            "ZeroVector:\n{:02X} {:02X} {:02X} {:02X} {:02X} {:02X} {:02X} {:02X}\n{:02X} {:02X} {:02X} {:02X} {:02X} {:02X} {:02X} {:02X}\nFileSystem GUID: {}\nFull size: {:X}h ({})\nHeader size: {:X}h ({})\nBody size: {:X}h ({})\nRevision: {}\nAttributes: {:08X}h\nErase polarity: {}",
            zv[0], zv[1], zv[2], zv[3], zv[4], zv[5], zv[6], zv[7],
            zv[8], zv[9], zv[10], zv[11], zv[12], zv[13], zv[14], zv[15],
            volume_header.filesystem_guid,
            volume_size, volume_size,
            header_size, header_size,
            volume_size as usize - header_size, volume_size as usize - header_size,
            volume_header.revision,
            volume_header.attributes,
            if empty == 0xFF { "1" } else { "0" }
        );
        if volume_header.revision > 1 && volume_header.ext_header_offset > 0 {
            if let Ok(ext_header) =
                VolumeExtHeader::parse(&volume[usize::from(volume_header.ext_header_offset)..])
            {
                info.push_str(&format!(
                    "\nExtended header size: {:X}h ({})\nVolume GUID: {}",
                    ext_header.ext_header_size, ext_header.ext_header_size, ext_header.fv_name
                ));
            }
        }

        let mut text = String::new();
        if volume_has_zv_crc {
            text.push_str("AppleCRC32 ");
        }
        if volume_has_zv_fso {
            text.push_str("AppleFSO ");
        }

        let index = self.model.add_item(
            ItemType::Volume,
            Subtype::Volume(subtype),
            Compression::None,
            &name,
            &text,
            &info,
            &volume[..header_size],
            mid(volume, header_size, volume_size as usize - header_size),
            parent,
            mode,
        );

        if subtype == VolumeSubtype::Unknown {
            self.msg(
                Severity::Warning,
                format!("parse_volume: unknown file system {}", volume_header.filesystem_guid),
                Some(index),
            );
            // Do not parse unknown volumes
            return Ok(index);
        }
        if msg_invalid_checksum {
            self.msg(
                Severity::Warning,
                "parse_volume: volume header checksum is invalid".to_owned(),
                Some(index),
            );
        }

        // Search for and parse all files
        let volume_size = volume_size as usize;
        let mut file_offset = header_size;
        let mut seen_guids: HashSet<Guid> = HashSet::new();

        while file_offset < volume_size {
            if self.cancelled() {
                return Ok(index);
            }

            // Check if another file header can even fit
            let header_fits = volume_size - file_offset >= ffs::FFS_FILE_HEADER_SIZE;
            if !header_fits {
                self.add_volume_rest(&volume[file_offset..volume_size], empty, index);
                break;
            }

            let file_header = FfsFileHeader::parse(&volume[file_offset..])
                .map_err(|_| ErrorKind::InvalidFile)?;
            let mut file_header_size = ffs::FFS_FILE_HEADER_SIZE;
            let mut file_size = file_header.size as usize;
            if volume_header.revision > 1
                && file_header.attributes().contains(FileAttributes::LARGE_FILE)
            {
                if volume_size - file_offset < ffs::FFS_FILE_HEADER2_SIZE {
                    self.add_volume_rest(&volume[file_offset..volume_size], empty, index);
                    break;
                }
                file_header_size = ffs::FFS_FILE_HEADER2_SIZE;
                file_size = ffs::ffs_file_extended_size(&volume[file_offset..])
                    .map_err(|_| ErrorKind::InvalidFile)? as usize;
            }

            // If we are at empty space in the end of the volume
            if all_bytes(&volume[file_offset..file_offset + file_header_size], empty) {
                let free_space = &volume[file_offset..volume_size];
                if !all_bytes(free_space, empty) {
                    // Search for the first non-empty byte
                    let mut first_used =
                        free_space.iter().position(|&byte| byte != empty).unwrap_or(0);
                    // Align down to the file alignment; possible because at least a header
                    // of empty bytes was found before
                    if first_used != align8(first_used) {
                        first_used = align8(first_used) - 8;
                    }
                    if first_used > 0 {
                        let free = &free_space[..first_used];
                        self.model.add_item(
                            ItemType::FreeSpace,
                            Subtype::None,
                            Compression::None,
                            "Volume free space",
                            "",
                            &full_size_info(free.len()),
                            &[],
                            free,
                            index,
                            InsertMode::Append,
                        );
                    }
                    let padding = &free_space[first_used..];
                    let data_index = self.model.add_item(
                        ItemType::Padding,
                        Subtype::Padding(PaddingSubtype::Data),
                        Compression::None,
                        "Non-UEFI data",
                        "",
                        &full_size_info(padding.len()),
                        &[],
                        padding,
                        index,
                        InsertMode::Append,
                    );
                    self.msg(
                        Severity::Warning,
                        "parse_volume: non-UEFI data found in volume's free space".to_owned(),
                        Some(data_index),
                    );
                } else {
                    self.model.add_item(
                        ItemType::FreeSpace,
                        Subtype::None,
                        Compression::None,
                        "Volume free space",
                        "",
                        &full_size_info(free_space.len()),
                        &[],
                        free_space,
                        index,
                        InsertMode::Append,
                    );
                }
                break;
            }

            // Check file size to be at least the size of its header
            if file_size < file_header_size {
                self.msg(
                    Severity::Error,
                    "parse_volume: volume has FFS file with invalid size".to_owned(),
                    Some(index),
                );
                return Err(ErrorKind::InvalidFile);
            }

            // Check file alignment
            let mut alignment_power =
                ffs::FFS_ALIGNMENT_TABLE[usize::from((file_header.attributes & 0x38) >> 3)];
            if volume_header.revision > 1
                && file_header.attributes().contains(FileAttributes::DATA_ALIGNMENT_2)
            {
                alignment_power =
                    ffs::FFS_ALIGNMENT2_TABLE[usize::from((file_header.attributes & 0x38) >> 3)];
            }
            let alignment = 1usize << alignment_power;
            let msg_unaligned_file = (file_offset + file_header_size) % alignment != 0;

            // Check for a duplicate file GUID
            let msg_duplicate_guid = file_header.file_type != ffs::FILETYPE_PAD
                && !seen_guids.insert(file_header.name);

            let file = mid(volume, file_offset, file_size);
            let file_index = match self.parse_file(
                file,
                volume_header.revision,
                polarity,
                index,
                InsertMode::Append,
            ) {
                Ok(file_index) => Some(file_index),
                Err(error) => {
                    if error != ErrorKind::ItemNotFound && error != ErrorKind::InvalidVolume {
                        self.msg(
                            Severity::Error,
                            format!("parse_volume: FFS file parsing failed with error \"{error}\""),
                            Some(index),
                        );
                    }
                    None
                }
            };

            if msg_unaligned_file {
                self.msg(
                    Severity::Warning,
                    format!("parse_volume: unaligned file {}", file_header.name),
                    file_index,
                );
            }
            if msg_duplicate_guid {
                self.msg(
                    Severity::Warning,
                    format!("parse_volume: file with duplicate GUID {}", file_header.name),
                    file_index,
                );
            }

            file_offset += file_size;
            file_offset = align8(file_offset);
        }

        Ok(index)
    }

    /// Emits the unparseable rest of a volume as free space or non-UEFI data.
    fn add_volume_rest(&mut self, rest: &[u8], empty: u8, parent: NodeId) {
        if all_bytes(rest, empty) {
            self.model.add_item(
                ItemType::FreeSpace,
                Subtype::None,
                Compression::None,
                "Volume free space",
                "",
                &full_size_info(rest.len()),
                &[],
                rest,
                parent,
                InsertMode::Append,
            );
        } else {
            let index = self.model.add_item(
                ItemType::Padding,
                Subtype::Padding(PaddingSubtype::Data),
                Compression::None,
                "Non-UEFI data",
                "",
                &full_size_info(rest.len()),
                &[],
                rest,
                parent,
                InsertMode::Append,
            );
            self.msg(
                Severity::Warning,
                "parse_volume: non-UEFI data found in volume's free space".to_owned(),
                Some(index),
            );
        }
    }

    /// Parses one FFS file: header checks, optional tail, then body content.
    pub(crate) fn parse_file(
        &mut self, file: &[u8], revision: u8, polarity: ErasePolarity, parent: NodeId,
        mode: InsertMode,
    ) -> Result<NodeId> {
        if file.len() < ffs::FFS_FILE_HEADER_SIZE {
            return Err(ErrorKind::InvalidFile);
        }
        let file_header = FfsFileHeader::parse(file).map_err(|_| ErrorKind::InvalidFile)?;
        let empty = polarity.empty_byte();

        let mut header_size = ffs::FFS_FILE_HEADER_SIZE;
        if revision > 1 && file_header.attributes().contains(FileAttributes::LARGE_FILE) {
            if file.len() < ffs::FFS_FILE_HEADER2_SIZE {
                return Err(ErrorKind::InvalidFile);
            }
            header_size = ffs::FFS_FILE_HEADER2_SIZE;
        }
        let header = &file[..header_size];

        // Check the header checksum: the stored checksum, data checksum and state byte do not
        // participate in it
        let calculated_header = 0x100u16.wrapping_sub(u16::from(
            checksum::sum8(header)
                .wrapping_sub(file_header.header_checksum())
                .wrapping_sub(file_header.data_checksum())
                .wrapping_sub(file_header.state),
        )) as u8;
        let msg_invalid_header_checksum = file_header.header_checksum() != calculated_header;

        let mut body = &file[header_size..];

        // Check for the file tail presence
        let mut tail: &[u8] = &[];
        let mut msg_invalid_tail_value = false;
        if revision == 1 && file_header.attributes().contains(FileAttributes::TAIL_PRESENT) {
            if body.len() < 2 {
                return Err(ErrorKind::InvalidFile);
            }
            tail = &body[body.len() - 2..];
            let tail_value = u16::from_le_bytes([tail[0], tail[1]]);
            if file_header.tail_reference() != !tail_value {
                msg_invalid_tail_value = true;
            }
            body = &body[..body.len() - 2];
        }

        // Check the data checksum; when the attribute is clear a fixed value is required
        let calculated_data = if file_header.attributes().contains(FileAttributes::CHECKSUM) {
            checksum::checksum8(body)
        } else if revision == 1 {
            ffs::FFS_FIXED_CHECKSUM
        } else {
            ffs::FFS_FIXED_CHECKSUM2
        };
        let msg_invalid_data_checksum = file_header.data_checksum() != calculated_data;

        // Check the file type
        let mut parse_current_file = true;
        let mut parse_as_bios = false;
        let mut msg_invalid_type = false;
        match file_header.file_type {
            ffs::FILETYPE_ALL | ffs::FILETYPE_RAW => parse_as_bios = true,
            ffs::FILETYPE_FREEFORM
            | ffs::FILETYPE_SECURITY_CORE
            | ffs::FILETYPE_PEI_CORE
            | ffs::FILETYPE_DXE_CORE
            | ffs::FILETYPE_PEIM
            | ffs::FILETYPE_DRIVER
            | ffs::FILETYPE_COMBINED_PEIM_DRIVER
            | ffs::FILETYPE_APPLICATION
            | ffs::FILETYPE_SMM
            | ffs::FILETYPE_FIRMWARE_VOLUME_IMAGE
            | ffs::FILETYPE_COMBINED_SMM_DXE
            | ffs::FILETYPE_SMM_CORE
            | ffs::FILETYPE_SMM_STANDALONE
            | ffs::FILETYPE_SMM_CORE_STANDALONE
            | ffs::FILETYPE_PAD => {}
            _ => {
                msg_invalid_type = true;
                parse_current_file = false;
            }
        }

        // No need to parse empty files
        let mut parse_as_non_empty_pad = false;
        if all_bytes(body, empty) {
            parse_current_file = false;
        } else if file_header.file_type == ffs::FILETYPE_PAD {
            parse_as_non_empty_pad = true;
        }

        let name = if file_header.file_type != ffs::FILETYPE_PAD {
            file_header.name.to_string()
        } else if parse_as_non_empty_pad {
            "Non-empty pad-file".to_owned()
        } else {
            "Pad-file".to_owned()
        };

        let info = format!(
            "File GUID: {}\nType: {:02X}h\nAttributes: {:02X}h\nFull size: {:X}h ({})\nHeader size: {:X}h ({})\nBody size: {:X}h ({})\nState: {:02X}h\nHeader checksum: {:02X}h\nData checksum: {:02X}h",
            file_header.name,
            file_header.file_type,
            file_header.attributes,
            header.len() + body.len() + tail.len(),
            header.len() + body.len() + tail.len(),
            header.len(),
            header.len(),
            body.len(),
            body.len(),
            file_header.state,
            file_header.header_checksum(),
            file_header.data_checksum()
        );

        let index = self.model.add_item(
            ItemType::File,
            Subtype::File(file_header.file_type),
            Compression::None,
            &name,
            "",
            &info,
            header,
            body,
            parent,
            mode,
        );

        if msg_invalid_header_checksum {
            self.msg(
                Severity::Warning,
                format!(
                    "parse_file: invalid header checksum {:02X}h, should be {:02X}h",
                    file_header.header_checksum(),
                    calculated_header
                ),
                Some(index),
            );
        }
        if msg_invalid_data_checksum {
            self.msg(
                Severity::Warning,
                format!(
                    "parse_file: invalid data checksum {:02X}h, should be {:02X}h",
                    file_header.data_checksum(),
                    calculated_data
                ),
                Some(index),
            );
        }
        if msg_invalid_tail_value {
            self.msg(
                Severity::Warning,
                format!("parse_file: invalid tail value {:04X}h", u16::from_le_bytes([tail[0], tail[1]])),
                Some(index),
            );
        }
        if msg_invalid_type {
            self.msg(
                Severity::Warning,
                format!("parse_file: unknown file type {:02X}h", file_header.file_type),
                Some(index),
            );
        }

        if !parse_current_file {
            return Ok(index);
        }

        // Non-empty pad files split into leading free space and trailing non-UEFI data; that
        // data is lost when the volume is rebuilt
        if parse_as_non_empty_pad {
            let first_used = body.iter().position(|&byte| byte != empty).unwrap_or(0);
            if first_used > 0 {
                let free = &body[..first_used];
                self.model.add_item(
                    ItemType::FreeSpace,
                    Subtype::None,
                    Compression::None,
                    "Free space",
                    "",
                    &full_size_info(free.len()),
                    &[],
                    free,
                    index,
                    InsertMode::Append,
                );
            }
            let padding = &body[first_used..];
            let data_index = self.model.add_item(
                ItemType::Padding,
                Subtype::Padding(PaddingSubtype::Data),
                Compression::None,
                "Non-UEFI data",
                "",
                &full_size_info(padding.len()),
                &[],
                padding,
                index,
                InsertMode::Append,
            );
            self.msg(
                Severity::Warning,
                "parse_file: non-empty pad-file contents will be destroyed after volume modifications"
                    .to_owned(),
                Some(data_index),
            );
            return Ok(index);
        }

        if parse_as_bios {
            match self.parse_bios(body, index) {
                Ok(()) | Err(ErrorKind::ItemNotFound | ErrorKind::InvalidVolume) => {}
                Err(error) => {
                    self.msg(
                        Severity::Error,
                        format!("parse_file: parsing file as BIOS failed with error \"{error}\""),
                        Some(index),
                    );
                    return Err(error);
                }
            }
            return Ok(index);
        }

        self.parse_sections(body, index)?;
        Ok(index)
    }

    /// Walks the 4-byte aligned section chain inside a file or encapsulation body.
    pub(crate) fn parse_sections(&mut self, body: &[u8], parent: NodeId) -> Result<()> {
        let mut section_offset = 0usize;
        loop {
            if self.cancelled() {
                return Ok(());
            }
            if body.len() < section_offset + ffs::COMMON_SECTION_HEADER_SIZE {
                return Err(ErrorKind::InvalidFile);
            }
            let header = SectionHeader::parse(&body[section_offset..])
                .map_err(|_| ErrorKind::InvalidFile)?;
            let section_size = header.size as usize;
            if section_size == 0 {
                break;
            }

            self.parse_section(
                mid(body, section_offset, section_size),
                parent,
                InsertMode::Append,
            )?;

            section_offset += section_size;
            section_offset = align4(section_offset);
            if section_offset >= body.len() {
                break;
            }
        }
        Ok(())
    }

    fn parse_apriori_raw_section(&self, body: &[u8]) -> String {
        let mut parsed = String::new();
        for chunk in body.chunks_exact(16) {
            if let Some(guid) = Guid::from_slice(chunk) {
                parsed.push_str(&format!("\n{guid}"));
            }
        }
        parsed
    }

    /// Decodes a dependency expression opcode stream for display.
    pub(crate) fn parse_depex_section(&self, body: &[u8]) -> Result<String> {
        use crate::ffs::DepexOpcode;

        if body.is_empty() {
            return Err(ErrorKind::InvalidParameter);
        }
        let mut parsed = String::new();
        let mut current = 0usize;

        let read_guid = |at: usize| -> Result<Guid> {
            Guid::from_slice(body.get(at..at + 16).ok_or(ErrorKind::DepexParseFailed)?)
                .ok_or(ErrorKind::DepexParseFailed)
        };

        // Special cases of the first opcode
        match DepexOpcode::try_from(body[0]) {
            Ok(DepexOpcode::Before) | Ok(DepexOpcode::After) if body.len() == 2 + 16 => {
                let opcode = DepexOpcode::try_from(body[0]).unwrap();
                parsed.push_str(&format!("\n{} {}", opcode, read_guid(1)?));
                if body[17] != u8::from(DepexOpcode::End) {
                    return Err(ErrorKind::DepexParseFailed);
                }
                return Ok(parsed);
            }
            Ok(DepexOpcode::Before) | Ok(DepexOpcode::After) => {
                return Err(ErrorKind::DepexParseFailed)
            }
            Ok(DepexOpcode::Sor) => {
                if body.len() <= 2 {
                    return Err(ErrorKind::DepexParseFailed);
                }
                parsed.push_str("\nSOR");
                current += 1;
            }
            _ => {}
        }

        // Parse the rest of the expression
        while current < body.len() {
            let opcode =
                DepexOpcode::try_from(body[current]).map_err(|_| ErrorKind::DepexParseFailed)?;
            match opcode {
                DepexOpcode::Before | DepexOpcode::After | DepexOpcode::Sor => {
                    return Err(ErrorKind::DepexParseFailed)
                }
                DepexOpcode::Push => {
                    if body.len() - current <= 1 + 16 {
                        return Err(ErrorKind::DepexParseFailed);
                    }
                    parsed.push_str(&format!("\nPUSH {}", read_guid(current + 1)?));
                    current += 1 + 16;
                }
                DepexOpcode::End => {
                    parsed.push_str("\nEND");
                    current += 1;
                    // END must be the last opcode
                    if current < body.len() {
                        return Err(ErrorKind::DepexParseFailed);
                    }
                }
                other => {
                    parsed.push_str(&format!("\n{other}"));
                    current += 1;
                }
            }
        }
        Ok(parsed)
    }

    /// Parses one section, dispatching on its type byte.
    #[allow(clippy::too_many_lines)]
    pub(crate) fn parse_section(
        &mut self, section: &[u8], parent: NodeId, mode: InsertMode,
    ) -> Result<NodeId> {
        let section_header =
            SectionHeader::parse(section).map_err(|_| ErrorKind::InvalidSection)?;
        let header_size = ffs::section_header_size(section).min(section.len());
        let name = format!("{} section", ffs::section_type_name(section_header.section_type));
        let header = &section[..header_size];
        let body = &section[header_size..];

        let standard_info = format!(
            "Type: {:02X}h\nFull size: {:X}h ({})\nHeader size: {:X}h ({})\nBody size: {:X}h ({})",
            section_header.section_type,
            section.len(),
            section.len(),
            header.len(),
            header.len(),
            body.len(),
            body.len()
        );

        let index = match section_header.section_type {
            ffs::SECTION_COMPRESSION => {
                let common = if section_header.extended {
                    ffs::COMMON_SECTION_HEADER2_SIZE
                } else {
                    ffs::COMMON_SECTION_HEADER_SIZE
                };
                let mut cursor = DataCursorRef::new(section);
                cursor.set_position(common);
                let uncompressed_length =
                    cursor.read_u32().map_err(|_| ErrorKind::InvalidSection)?;
                let compression_type = cursor.read_u8().map_err(|_| ErrorKind::InvalidSection)?;

                let decompressed = self.decompress(body, compression_type);
                let algorithm = match &decompressed {
                    Ok((_, algorithm)) => *algorithm,
                    Err(_) => Compression::Unknown,
                };

                let mut info = format!(
                    "{standard_info}\nCompression type: {algorithm}\nDecompressed size: {uncompressed_length:X}h ({uncompressed_length})"
                );
                let mut dictionary_size = DEFAULT_LZMA_DICTIONARY_SIZE;
                if algorithm == Compression::Lzma {
                    if let Ok(size) = lzma::dictionary_size(body) {
                        dictionary_size = size;
                        info.push_str(&format!("\nLZMA dictionary size: {dictionary_size:X}h"));
                    }
                }

                let index = self.model.add_item(
                    ItemType::Section,
                    Subtype::Section(section_header.section_type),
                    algorithm,
                    &name,
                    "",
                    &info,
                    header,
                    body,
                    parent,
                    mode,
                );
                self.model.set_dictionary_size(index, dictionary_size);

                match decompressed {
                    Ok((data, _)) => self.parse_sections(&data, index)?,
                    Err(error) => self.msg(
                        Severity::Warning,
                        format!("parse_section: decompression failed with error \"{error}\""),
                        Some(index),
                    ),
                }
                index
            }

            ffs::SECTION_GUID_DEFINED => {
                let guided = GuidDefinedSectionHeader::parse(section)
                    .map_err(|_| ErrorKind::InvalidSection)?;
                let common = if section_header.extended {
                    ffs::COMMON_SECTION_HEADER2_SIZE
                } else {
                    ffs::COMMON_SECTION_HEADER_SIZE
                };
                let name = guided.section_definition_guid.to_string();
                let mut info = format!(
                    "Section GUID: {}\n{}\nData offset: {:X}h\nAttributes: {:04X}h",
                    name, standard_info, guided.data_offset, guided.attributes
                );

                let mut algorithm = Compression::None;
                let mut dictionary_size = DEFAULT_LZMA_DICTIONARY_SIZE;
                let mut parse_current_section = true;
                let mut processed: Option<Vec<u8>> = None;
                let mut msg_unknown_guid = false;
                let mut msg_invalid_crc = false;
                let mut msg_unknown_auth = false;
                let mut msg_signed = false;

                let guid = guided.section_definition_guid;
                if guided.attributes & ffs::GUIDED_SECTION_PROCESSING_REQUIRED != 0 {
                    if guid == ffs::EFI_GUIDED_SECTION_TIANO {
                        match self.decompress(body, ffs::EFI_STANDARD_COMPRESSION) {
                            Ok((data, found)) => {
                                algorithm = found;
                                info.push_str(&format!(
                                    "\nCompression type: {algorithm}\nDecompressed size: {:X}h ({})",
                                    data.len(),
                                    data.len()
                                ));
                                processed = Some(data);
                            }
                            Err(_) => {
                                algorithm = Compression::Unknown;
                                info.push_str("\nCompression type: unknown");
                                parse_current_section = false;
                            }
                        }
                    } else if guid == ffs::EFI_GUIDED_SECTION_LZMA
                        || guid == ffs::EFI_GUIDED_SECTION_LZMAF86
                    {
                        match self.decompress(body, ffs::EFI_CUSTOMIZED_COMPRESSION) {
                            Ok((mut data, found)) => {
                                algorithm = found;
                                if guid == ffs::EFI_GUIDED_SECTION_LZMAF86
                                    && x86::convert(&mut data, x86::Mode::Decode).is_err()
                                {
                                    self.msg(
                                        Severity::Warning,
                                        "parse_section: unable to convert LZMAF86 compressed data"
                                            .to_owned(),
                                        None,
                                    );
                                }
                                info.push_str(&format!(
                                    "\nCompression type: {algorithm}\nDecompressed size: {:X}h ({})",
                                    data.len(),
                                    data.len()
                                ));
                                if algorithm == Compression::Lzma {
                                    if let Ok(size) = lzma::dictionary_size(body) {
                                        dictionary_size = size;
                                        info.push_str(&format!(
                                            "\nLZMA dictionary size: {dictionary_size:X}h"
                                        ));
                                    }
                                }
                                processed = Some(data);
                            }
                            Err(_) => {
                                algorithm = Compression::Unknown;
                                info.push_str("\nCompression type: unknown");
                                parse_current_section = false;
                            }
                        }
                    } else if guid == ffs::EFI_FIRMWARE_CONTENTS_SIGNED_GUID {
                        msg_signed = true;
                        // The certificate window already became part of the header; describe it
                        match ffs::WinCertificate::parse(
                            section.get(common + 20..).unwrap_or(&[]),
                        ) {
                            Ok(certificate) => {
                                match certificate.certificate_type {
                                    ffs::WIN_CERT_TYPE_EFI_GUID => {
                                        info.push_str("\nSignature type: UEFI");
                                        match ffs::win_certificate_cert_type(
                                            section.get(common + 20..).unwrap_or(&[]),
                                        ) {
                                            Some(cert_type)
                                                if cert_type
                                                    == ffs::EFI_CERT_TYPE_RSA2048_SHA256_GUID =>
                                            {
                                                info.push_str(
                                                    "\nSignature subtype: RSA2048/SHA256",
                                                );
                                            }
                                            Some(cert_type)
                                                if cert_type == ffs::EFI_CERT_TYPE_PKCS7_GUID =>
                                            {
                                                info.push_str("\nSignature subtype: PKCS7");
                                            }
                                            _ => {
                                                info.push_str("\nSignature subtype: unknown");
                                                self.msg(
                                                    Severity::Warning,
                                                    "parse_section: GUID defined section with unknown signature subtype"
                                                        .to_owned(),
                                                    None,
                                                );
                                            }
                                        }
                                    }
                                    ffs::WIN_CERT_TYPE_PKCS_SIGNED_DATA => {
                                        info.push_str("\nSignature type: PKCS7");
                                    }
                                    _ => {
                                        info.push_str("\nSignature type: unknown");
                                        self.msg(
                                            Severity::Warning,
                                            "parse_section: GUID defined section with unknown signature type"
                                                .to_owned(),
                                            None,
                                        );
                                    }
                                }
                            }
                            Err(_) => {
                                info.push_str("\nSignature type: invalid, wrong length");
                                self.msg(
                                    Severity::Warning,
                                    "parse_section: GUID defined section with invalid signature length"
                                        .to_owned(),
                                    None,
                                );
                                parse_current_section = false;
                            }
                        }
                    } else {
                        msg_unknown_guid = true;
                        parse_current_section = false;
                    }
                } else if guided.attributes & ffs::GUIDED_SECTION_AUTH_STATUS_VALID != 0 {
                    if guid == ffs::EFI_GUIDED_SECTION_CRC32 {
                        info.push_str("\nChecksum type: CRC32");
                        let mut cursor = DataCursorRef::new(header);
                        cursor.set_position(common + 20);
                        let stored = cursor.read_u32().unwrap_or(0);
                        if checksum::crc32(0, body) == stored {
                            info.push_str("\nChecksum: valid");
                        } else {
                            info.push_str("\nChecksum: invalid");
                            msg_invalid_crc = true;
                        }
                    } else {
                        msg_unknown_auth = true;
                    }
                }

                let index = self.model.add_item(
                    ItemType::Section,
                    Subtype::Section(section_header.section_type),
                    algorithm,
                    &name,
                    "",
                    &info,
                    header,
                    body,
                    parent,
                    mode,
                );
                self.model.set_dictionary_size(index, dictionary_size);

                if msg_unknown_guid {
                    self.msg(
                        Severity::Warning,
                        "parse_section: GUID defined section with unknown processing method"
                            .to_owned(),
                        Some(index),
                    );
                }
                if msg_unknown_auth {
                    self.msg(
                        Severity::Warning,
                        "parse_section: GUID defined section with unknown authentication method"
                            .to_owned(),
                        Some(index),
                    );
                }
                if msg_invalid_crc {
                    self.msg(
                        Severity::Warning,
                        "parse_section: GUID defined section with invalid CRC32".to_owned(),
                        Some(index),
                    );
                }
                if msg_signed {
                    self.msg(
                        Severity::Warning,
                        "parse_section: signature may become invalid after any modification"
                            .to_owned(),
                        Some(index),
                    );
                }

                if parse_current_section {
                    let data = processed.unwrap_or_else(|| body.to_vec());
                    self.parse_sections(&data, index)?;
                } else if !msg_signed {
                    self.msg(
                        Severity::Warning,
                        "parse_section: GUID defined section can not be processed".to_owned(),
                        Some(index),
                    );
                }
                index
            }

            ffs::SECTION_DISPOSABLE => {
                let index = self.model.add_item(
                    ItemType::Section,
                    Subtype::Section(section_header.section_type),
                    Compression::None,
                    &name,
                    "",
                    &standard_info,
                    header,
                    body,
                    parent,
                    mode,
                );
                self.parse_sections(body, index)?;
                index
            }

            ffs::SECTION_DXE_DEPEX | ffs::SECTION_PEI_DEPEX | ffs::SECTION_SMM_DEPEX => {
                let mut info = standard_info;
                let mut msg_depex_parse_failed = false;
                match self.parse_depex_section(body) {
                    Ok(parsed) if !parsed.is_empty() => {
                        info.push_str(&format!("\nParsed expression:{parsed}"));
                    }
                    Ok(_) => {}
                    Err(_) => msg_depex_parse_failed = true,
                }
                let index = self.model.add_item(
                    ItemType::Section,
                    Subtype::Section(section_header.section_type),
                    Compression::None,
                    &name,
                    "",
                    &info,
                    header,
                    body,
                    parent,
                    mode,
                );
                if msg_depex_parse_failed {
                    self.msg(
                        Severity::Warning,
                        "parse_section: dependency expression parsing failed".to_owned(),
                        Some(index),
                    );
                }
                index
            }

            ffs::SECTION_TE => {
                let mut info = standard_info;
                let mut msg_invalid_signature = false;
                match peimage::parse_te(body) {
                    Ok(te) => {
                        // Most images fold the stripped size into ImageBase in violation of
                        // the PI specification, so the displayed entry point assumes no fixup
                        info.push_str(&format!(
                            "\nMachine type: {}\nNumber of sections: {}\nSubsystem: {:02X}h\nStrippedSize: {:X}h ({})\nBaseOfCode: {:X}h\nRelativeEntryPoint: {:X}h\nImageBase: {:X}h\nEntryPoint: {:X}h",
                            peimage::machine_type_name(te.machine),
                            te.number_of_sections,
                            te.subsystem,
                            te.stripped_size,
                            te.stripped_size,
                            te.base_of_code,
                            te.address_of_entry_point,
                            te.image_base,
                            te.image_base + u64::from(te.address_of_entry_point)
                        ));
                    }
                    Err(_) => {
                        info.push_str("\nSignature: invalid");
                        msg_invalid_signature = true;
                    }
                }
                let index = self.model.add_item(
                    ItemType::Section,
                    Subtype::Section(section_header.section_type),
                    Compression::None,
                    &name,
                    "",
                    &info,
                    header,
                    body,
                    parent,
                    mode,
                );
                if msg_invalid_signature {
                    self.msg(
                        Severity::Warning,
                        "parse_section: TE image with invalid TE signature".to_owned(),
                        Some(index),
                    );
                }
                self.capture_pei_core_entry_point(index);
                index
            }

            ffs::SECTION_PE32 | ffs::SECTION_PIC => {
                let mut info = standard_info;
                let mut msg_invalid_image = None;
                match peimage::parse_pe(body) {
                    Ok(pe) => {
                        info.push_str(&format!(
                            "\nMachine type: {}\nNumber of sections: {}\nCharacteristics: {:04X}h\nOptional header signature: {:04X}h\nSubsystem: {:04X}h\nRelativeEntryPoint: {:X}h\nBaseOfCode: {:X}h\nImageBase: {:X}h\nEntryPoint: {:X}h",
                            peimage::machine_type_name(pe.machine),
                            pe.number_of_sections,
                            pe.characteristics,
                            pe.magic,
                            pe.subsystem,
                            pe.address_of_entry_point,
                            pe.base_of_code,
                            pe.image_base,
                            pe.entry_point()
                        ));
                    }
                    Err(peimage::Error::UnknownOptionalHeaderType) => {
                        info.push_str("\nOptional header signature: unknown");
                        msg_invalid_image =
                            Some("parse_section: PE32 image with unknown optional header signature");
                    }
                    Err(_) => {
                        info.push_str("\nDOS signature: invalid");
                        msg_invalid_image = Some("parse_section: PE32 image with invalid DOS signature");
                    }
                }
                let index = self.model.add_item(
                    ItemType::Section,
                    Subtype::Section(section_header.section_type),
                    Compression::None,
                    &name,
                    "",
                    &info,
                    header,
                    body,
                    parent,
                    mode,
                );
                if let Some(text) = msg_invalid_image {
                    self.msg(Severity::Warning, text.to_owned(), Some(index));
                }
                self.capture_pei_core_entry_point(index);
                index
            }

            ffs::SECTION_FREEFORM_SUBTYPE_GUID => {
                let common = if section_header.extended {
                    ffs::COMMON_SECTION_HEADER2_SIZE
                } else {
                    ffs::COMMON_SECTION_HEADER_SIZE
                };
                let subtype_guid = Guid::from_slice(&section[common..]).unwrap_or(Guid::ZERO);
                let info = format!("{standard_info}\nSubtype GUID: {subtype_guid}");
                self.model.add_item(
                    ItemType::Section,
                    Subtype::Section(section_header.section_type),
                    Compression::None,
                    &subtype_guid.to_string(),
                    "",
                    &info,
                    header,
                    body,
                    parent,
                    mode,
                )
            }

            ffs::SECTION_VERSION => {
                let common = if section_header.extended {
                    ffs::COMMON_SECTION_HEADER2_SIZE
                } else {
                    ffs::COMMON_SECTION_HEADER_SIZE
                };
                let mut cursor = DataCursorRef::new(section);
                cursor.set_position(common);
                let build_number = cursor.read_u16().unwrap_or(0);
                let info = format!(
                    "{standard_info}\nBuild number: {build_number}\nVersion string: {}",
                    utf16_string(body)
                );
                self.model.add_item(
                    ItemType::Section,
                    Subtype::Section(section_header.section_type),
                    Compression::None,
                    &name,
                    "",
                    &info,
                    header,
                    body,
                    parent,
                    mode,
                )
            }

            ffs::SECTION_USER_INTERFACE => {
                let text = utf16_string(body);
                let info = format!("{standard_info}\nText: {text}");
                let index = self.model.add_item(
                    ItemType::Section,
                    Subtype::Section(section_header.section_type),
                    Compression::None,
                    &name,
                    "",
                    &info,
                    header,
                    body,
                    parent,
                    mode,
                );
                // The user interface string becomes the display text of the enclosing file
                if let Some(file_index) = self.model.find_parent_of_type(parent, ItemType::File) {
                    self.model.set_text(file_index, &text);
                }
                index
            }

            ffs::SECTION_FIRMWARE_VOLUME_IMAGE => {
                let index = self.model.add_item(
                    ItemType::Section,
                    Subtype::Section(section_header.section_type),
                    Compression::None,
                    &name,
                    "",
                    &standard_info,
                    header,
                    body,
                    parent,
                    mode,
                );
                match self.parse_bios(body, index) {
                    Ok(()) | Err(ErrorKind::ItemNotFound | ErrorKind::InvalidVolume) => {}
                    Err(error) => {
                        self.msg(
                            Severity::Error,
                            format!(
                                "parse_section: parsing firmware volume image section as BIOS failed with error \"{error}\""
                            ),
                            Some(index),
                        );
                        return Err(error);
                    }
                }
                index
            }

            ffs::SECTION_RAW => {
                let mut info = standard_info;
                let mut parsed = false;
                // Apriori files hold a plain list of file GUIDs in a raw section
                let parent_file = self.model.find_parent_of_type(parent, ItemType::File);
                if let Some(file_index) = parent_file {
                    let parent_guid = Guid::from_slice(self.model.header(file_index));
                    if parent_guid == Some(ffs::EFI_PEI_APRIORI_FILE_GUID) {
                        parsed = true;
                        let list = self.parse_apriori_raw_section(body);
                        if !list.is_empty() {
                            info.push_str(&format!("\nFile list:{list}"));
                        }
                        self.model.set_text(file_index, "PEI apriori file");
                    } else if parent_guid == Some(ffs::EFI_DXE_APRIORI_FILE_GUID) {
                        parsed = true;
                        let list = self.parse_apriori_raw_section(body);
                        if !list.is_empty() {
                            info.push_str(&format!("\nFile list:{list}"));
                        }
                        self.model.set_text(file_index, "DXE apriori file");
                    }
                }
                let index = self.model.add_item(
                    ItemType::Section,
                    Subtype::Section(section_header.section_type),
                    Compression::None,
                    &name,
                    "",
                    &info,
                    header,
                    body,
                    parent,
                    mode,
                );
                if !parsed {
                    match self.parse_bios(body, index) {
                        Ok(()) | Err(ErrorKind::ItemNotFound | ErrorKind::InvalidVolume) => {}
                        Err(error) => {
                            self.msg(
                                Severity::Error,
                                format!(
                                    "parse_section: parsing raw section as BIOS failed with error \"{error}\""
                                ),
                                Some(index),
                            );
                            return Err(error);
                        }
                    }
                }
                index
            }

            ffs::SECTION_INSYDE_POSTCODE | ffs::SECTION_SCT_POSTCODE => {
                let common = if section_header.extended {
                    ffs::COMMON_SECTION_HEADER2_SIZE
                } else {
                    ffs::COMMON_SECTION_HEADER_SIZE
                };
                let mut cursor = DataCursorRef::new(section);
                cursor.set_position(common);
                let postcode = cursor.read_u32().unwrap_or(0);
                let info = format!("{standard_info}\nPostcode: {postcode:X}h");
                self.model.add_item(
                    ItemType::Section,
                    Subtype::Section(section_header.section_type),
                    Compression::None,
                    &name,
                    "",
                    &info,
                    header,
                    body,
                    parent,
                    mode,
                )
            }

            _ => {
                let index = self.model.add_item(
                    ItemType::Section,
                    Subtype::Section(section_header.section_type),
                    Compression::None,
                    &name,
                    "",
                    &standard_info,
                    header,
                    body,
                    parent,
                    mode,
                );
                self.msg(
                    Severity::Warning,
                    format!(
                        "parse_section: section with unknown type {:02X}h",
                        section_header.section_type
                    ),
                    Some(index),
                );
                index
            }
        };

        Ok(index)
    }

    /// Records the pre-edit PEI core entry point the first time an executable section of the
    /// PEI core file is seen, for the VTF patcher.
    fn capture_pei_core_entry_point(&mut self, index: NodeId) {
        if self.old_pei_core_entry_point != 0 {
            return;
        }
        let Some(file_index) = self.model.find_parent_of_type(index, ItemType::File) else {
            return;
        };
        if self.model.subtype(file_index) != Subtype::File(ffs::FILETYPE_PEI_CORE) {
            return;
        }
        match Self::get_entry_point(self.model.body(index)) {
            Ok(entry_point) => self.old_pei_core_entry_point = entry_point,
            Err(_) => self.msg(
                Severity::Warning,
                "parse_section: can't get original PEI core entry point".to_owned(),
                Some(index),
            ),
        }
    }
}

/// Classifies padding by its fill byte.
pub(crate) fn get_padding_type(padding: &[u8]) -> PaddingSubtype {
    if all_bytes(padding, 0x00) {
        return PaddingSubtype::Zero;
    }
    if all_bytes(padding, 0xFF) {
        return PaddingSubtype::One;
    }
    PaddingSubtype::Data
}

/// Finds the next firmware volume signature at or after `offset`, returning the offset of the
/// volume header it belongs to.
pub(crate) fn find_next_volume(bios: &[u8], offset: usize) -> Option<usize> {
    let mut search = offset;
    while search + 4 <= bios.len() {
        match bios[search..].windows(4).position(|window| window == ffs::FV_SIGNATURE) {
            Some(found) => {
                let signature_offset = search + found;
                if signature_offset >= ffs::FV_SIGNATURE_OFFSET {
                    return Some(signature_offset - ffs::FV_SIGNATURE_OFFSET);
                }
                search = signature_offset + 1;
            }
            None => return None,
        }
    }
    None
}

/// Reads the volume size from the header and recomputes it from the block map.
pub(crate) fn get_volume_size(bios: &[u8], volume_offset: usize) -> Result<(u32, u32)> {
    if bios.len() < volume_offset + ffs::VOLUME_HEADER_SIZE + 2 * ffs::BLOCK_MAP_ENTRY_SIZE {
        return Err(ErrorKind::InvalidVolume);
    }
    let header =
        VolumeHeader::parse(&bios[volume_offset..]).map_err(|_| ErrorKind::InvalidVolume)?;
    if header.signature != ffs::FV_SIGNATURE {
        return Err(ErrorKind::InvalidVolume);
    }

    // Walk the block map until its terminating zero entry
    let mut entry_offset = volume_offset + ffs::VOLUME_HEADER_SIZE;
    let mut calc_size = 0u64;
    loop {
        let Ok(entry) = BlockMapEntry::parse(mid(bios, entry_offset, ffs::BLOCK_MAP_ENTRY_SIZE))
        else {
            return Err(ErrorKind::InvalidVolume);
        };
        if entry.is_terminator() || entry.num_blocks == 0 || entry.length == 0 {
            break;
        }
        calc_size += u64::from(entry.num_blocks) * u64::from(entry.length);
        entry_offset += ffs::BLOCK_MAP_ENTRY_SIZE;
    }

    if header.fv_length == 0 {
        return Err(ErrorKind::InvalidVolume);
    }
    Ok((header.fv_length as u32, calc_size as u32))
}

fn bios_access_table(bios_read: u16, bios_write: u16, with_ec: bool) -> String {
    let cell = |value: u16, mask: u8| if value & u16::from(mask) != 0 { "Yes " } else { "No  " };
    let mut table = String::from("\nBIOS access table:\n      Read  Write");
    table.push_str(&format!(
        "\nDesc  {}  {}",
        cell(bios_read, descriptor::REGION_ACCESS_DESC),
        cell(bios_write, descriptor::REGION_ACCESS_DESC)
    ));
    table.push_str("\nBIOS  Yes   Yes");
    table.push_str(&format!(
        "\nME    {}  {}",
        cell(bios_read, descriptor::REGION_ACCESS_ME),
        cell(bios_write, descriptor::REGION_ACCESS_ME)
    ));
    table.push_str(&format!(
        "\nGbE   {}  {}",
        cell(bios_read, descriptor::REGION_ACCESS_GBE),
        cell(bios_write, descriptor::REGION_ACCESS_GBE)
    ));
    table.push_str(&format!(
        "\nPDR   {}  {}",
        cell(bios_read, descriptor::REGION_ACCESS_PDR),
        cell(bios_write, descriptor::REGION_ACCESS_PDR)
    ));
    if with_ec {
        table.push_str(&format!(
            "\nEC    {}  {}",
            cell(bios_read, descriptor::REGION_ACCESS_EC),
            cell(bios_write, descriptor::REGION_ACCESS_EC)
        ));
    }
    table
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn padding_type() {
        assert_eq!(get_padding_type(&[0x00; 16]), PaddingSubtype::Zero);
        assert_eq!(get_padding_type(&[0xFF; 16]), PaddingSubtype::One);
        assert_eq!(get_padding_type(&[0x00, 0xFF]), PaddingSubtype::Data);
    }

    #[test]
    fn volume_signature_search() {
        let mut bios = vec![0u8; 0x1000];
        bios[0x200 + ffs::FV_SIGNATURE_OFFSET..0x200 + ffs::FV_SIGNATURE_OFFSET + 4]
            .copy_from_slice(&ffs::FV_SIGNATURE);
        assert_eq!(find_next_volume(&bios, 0), Some(0x200));
        assert_eq!(find_next_volume(&bios, 0x300), None);

        // A signature too close to the start can't belong to a volume header
        let mut early = vec![0u8; 0x100];
        early[0x10..0x14].copy_from_slice(&ffs::FV_SIGNATURE);
        assert_eq!(find_next_volume(&early, 0), None);
    }

    #[test]
    fn utf16_strings() {
        let bytes: Vec<u8> = "Setup".encode_utf16().flat_map(|unit| unit.to_le_bytes()).collect();
        let mut with_nul = bytes.clone();
        with_nul.extend_from_slice(&[0, 0]);
        assert_eq!(utf16_string(&with_nul), "Setup");
        assert_eq!(utf16_string(&bytes), "Setup");
    }
}
