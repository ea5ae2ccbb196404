//! Reverse traversal producing bytes from the tree, honoring per-node edit actions.
//!
//! Reconstruction is transactional: any non-recoverable error aborts the call without touching
//! the tree's action state, and an untouched tree serializes back byte-identical to its input.

use vulcan_core::checksum;
use vulcan_core::prelude::*;
use vulcan_core::util::align8;
use vulcan_eficomp::prelude::*;

use crate::descriptor::{
    ComponentSection, DescriptorMap, DescriptorVersion, RegionSection, FLASH_DESCRIPTOR_MAX_BASE,
    FLASH_DESCRIPTOR_SIZE, FLASH_DESCRIPTOR_VERSION_INVALID, FLASH_DESCRIPTOR_VERSION_MAJOR,
    FLASH_DESCRIPTOR_VERSION_MINOR, FLASH_FREQUENCY_20MHZ,
};
use crate::engine::FfsEngine;
use crate::errors::{ErrorKind, Result};
use crate::ffs::{self, BlockMapEntry, FfsFileHeader, FileAttributes, FileState, VolumeHeader};
use crate::messages::Severity;
use crate::treemodel::NodeId;
use crate::types::{
    Action, Compression, ErasePolarity, ImageSubtype, ItemType, RegionSubtype, Subtype,
};

/// Per-operation state threaded through one reconstruction pass.
pub(crate) struct ReconstructContext {
    /// Entry point of the PEI core after rebasing, consumed by the VTF patcher.
    pub new_pei_core_entry_point: u32,
}

impl FfsEngine {
    /// Serializes the whole tree back into an image.
    ///
    /// With no actions set anywhere the output is byte-identical to the parsed input.
    pub fn reconstruct_image_file(&mut self) -> Result<Vec<u8>> {
        let root = self.model.root();
        let Some(&first) = self.model.children(root).first() else {
            return Err(ErrorKind::ItemNotFound);
        };
        let mut context = ReconstructContext { new_pei_core_entry_point: 0 };
        self.reconstruct(first, &mut context)
    }

    /// Type dispatch for one node.
    pub(crate) fn reconstruct(
        &mut self, index: NodeId, context: &mut ReconstructContext,
    ) -> Result<Vec<u8>> {
        match self.model.item_type(index) {
            ItemType::Image => {
                if self.model.subtype(index) == Subtype::Image(ImageSubtype::Intel) {
                    self.reconstruct_intel_image(index, context)
                } else {
                    // Other image types can be reconstructed like regions
                    self.reconstruct_region(index, true, context)
                }
            }
            ItemType::Capsule | ItemType::Region => self.reconstruct_region(index, true, context),
            ItemType::Padding | ItemType::FreeSpace => self.reconstruct_padding(index),
            ItemType::Volume => self.reconstruct_volume(index, context),
            ItemType::Section => self.reconstruct_section(index, 0, context),
            ItemType::File | ItemType::Root => {
                self.msg(
                    Severity::Error,
                    "reconstruct: call of generic function is not supported for files".to_owned(),
                    Some(index),
                );
                Err(ErrorKind::InvalidParameter)
            }
        }
    }

    /// Reconstructs an Intel image: the descriptor dictates where every region lands, the gaps
    /// are filled with 0xFF.
    pub(crate) fn reconstruct_intel_image(
        &mut self, index: NodeId, context: &mut ReconstructContext,
    ) -> Result<Vec<u8>> {
        match self.model.action(index) {
            Action::NoAction | Action::DoNotRebuild => {
                let mut out = self.model.header(index).to_vec();
                out.extend_from_slice(self.model.body(index));
                return Ok(out);
            }
            Action::Rebuild => {}
            _ => return Err(ErrorKind::InvalidParameter),
        }

        let children: Vec<NodeId> = self.model.children(index).to_vec();
        let Some(&descriptor_index) = children.first() else {
            return Err(ErrorKind::InvalidFlashDescriptor);
        };
        let descriptor = self.reconstruct_region(descriptor_index, true, context)?;
        if descriptor.len() < FLASH_DESCRIPTOR_SIZE {
            self.msg(
                Severity::Error,
                "reconstruct_intel_image: descriptor is smaller than minimum size of 1000h (4096) bytes"
                    .to_owned(),
                None,
            );
            return Err(ErrorKind::InvalidFlashDescriptor);
        }

        let map =
            DescriptorMap::parse(&descriptor).map_err(|_| ErrorKind::InvalidFlashDescriptor)?;
        if map.master_base > FLASH_DESCRIPTOR_MAX_BASE
            || map.master_base == map.region_base
            || map.master_base == map.component_base
            || map.region_base > FLASH_DESCRIPTOR_MAX_BASE
            || map.region_base == map.component_base
            || map.component_base > FLASH_DESCRIPTOR_MAX_BASE
        {
            self.msg(
                Severity::Error,
                "reconstruct_intel_image: invalid descriptor base values".to_owned(),
                None,
            );
            return Err(ErrorKind::InvalidFlashDescriptor);
        }

        let regions = RegionSection::parse(&descriptor, map.region_base)
            .map_err(|_| ErrorKind::InvalidFlashDescriptor)?;
        let component = ComponentSection::parse(&descriptor, map.component_base)
            .map_err(|_| ErrorKind::InvalidFlashDescriptor)?;
        let descriptor_version =
            if component.read_clock_frequency() == FLASH_FREQUENCY_20MHZ { 1 } else { 2 };
        if descriptor_version == 2 && map.descriptor_version != FLASH_DESCRIPTOR_VERSION_INVALID {
            let version = DescriptorVersion::from_raw(map.descriptor_version);
            if version.major != FLASH_DESCRIPTOR_VERSION_MAJOR
                || version.minor != FLASH_DESCRIPTOR_VERSION_MINOR
            {
                self.msg(
                    Severity::Warning,
                    format!(
                        "reconstruct_intel_image: discovered unexpected {}.{} descriptor version, trying to continue...",
                        version.major, version.minor
                    ),
                    None,
                );
            }
        }

        let image_size = self.model.header(index).len() + self.model.body(index).len();

        let gbe_begin = regions.gbe.offset();
        let gbe_end = gbe_begin + regions.gbe.size();
        let me_begin = regions.me.offset();
        let me_end = me_begin + regions.me.size();
        let mut bios_begin = regions.bios.offset();
        let mut bios_end = regions.bios.size();
        // Gigabyte-specific map, the BIOS region is declared to span the whole image
        if bios_end == image_size as u32 {
            bios_begin = me_end;
        } else {
            bios_end += bios_begin;
        }
        let pdr_begin = regions.pdr.offset();
        let pdr_end = pdr_begin + regions.pdr.size();
        let (ec_begin, ec_end) = if descriptor_version == 2 {
            (regions.ec.offset(), regions.ec.offset() + regions.ec.size())
        } else {
            (0, 0)
        };

        let mut reconstructed = descriptor;
        let mut offset = reconstructed.len() as u32;
        const EMPTY: u8 = 0xFF;

        for &child in children.iter().skip(1) {
            // Padding after the end of all Intel regions
            if self.model.item_type(child) == ItemType::Padding {
                reconstructed.extend_from_slice(self.model.body(child));
                offset += self.model.body(child).len() as u32;
                continue;
            }

            let region = self.reconstruct_region(child, true, context)?;
            let (begin, end) = match self.model.subtype(child) {
                Subtype::Region(RegionSubtype::Gbe) => (gbe_begin, gbe_end),
                Subtype::Region(RegionSubtype::Me) => (me_begin, me_end),
                Subtype::Region(RegionSubtype::Bios) => (bios_begin, bios_end),
                Subtype::Region(RegionSubtype::Pdr) => (pdr_begin, pdr_end),
                Subtype::Region(RegionSubtype::Ec) => {
                    if descriptor_version == 1 {
                        self.msg(
                            Severity::Error,
                            "reconstruct_intel_image: incompatible region type found".to_owned(),
                            Some(index),
                        );
                        return Err(ErrorKind::InvalidRegion);
                    }
                    (ec_begin, ec_end)
                }
                _ => {
                    self.msg(
                        Severity::Error,
                        "reconstruct_intel_image: unknown region type found".to_owned(),
                        Some(index),
                    );
                    return Err(ErrorKind::InvalidRegion);
                }
            };
            if begin > offset {
                reconstructed.resize(reconstructed.len() + (begin - offset) as usize, EMPTY);
            }
            reconstructed.extend_from_slice(&region);
            offset = if end != 0 { end } else { begin + region.len() as u32 };
        }
        if self.model.body(index).len() as u32 > offset {
            let fill = self.model.body(index).len() - offset as usize;
            reconstructed.resize(reconstructed.len() + fill, EMPTY);
        }

        // The reconstructed image must stay the same size
        if reconstructed.len() != self.model.body(index).len() {
            self.msg(
                Severity::Error,
                format!(
                    "reconstruct_intel_image: reconstructed body size {:X}h ({}) differs from original {:X}h ({})",
                    reconstructed.len(),
                    reconstructed.len(),
                    self.model.body(index).len(),
                    self.model.body(index).len()
                ),
                Some(index),
            );
            return Err(ErrorKind::InvalidParameter);
        }
        Ok(reconstructed)
    }

    /// Reconstructs a region-like node: children back to back, size must not change.
    pub(crate) fn reconstruct_region(
        &mut self, index: NodeId, include_header: bool, context: &mut ReconstructContext,
    ) -> Result<Vec<u8>> {
        match self.model.action(index) {
            Action::NoAction | Action::DoNotRebuild => {
                let mut out = self.model.header(index).to_vec();
                out.extend_from_slice(self.model.body(index));
                Ok(out)
            }
            Action::Remove => Ok(Vec::new()),
            Action::Rebuild | Action::Replace | Action::Insert | Action::Create => {
                let children: Vec<NodeId> = self.model.children(index).to_vec();
                let mut reconstructed = Vec::new();
                if children.is_empty() {
                    reconstructed.extend_from_slice(self.model.body(index));
                } else {
                    for child in children {
                        let piece = self.reconstruct(child, context)?;
                        reconstructed.extend_from_slice(&piece);
                    }
                }

                if reconstructed.len() != self.model.body(index).len() {
                    self.msg(
                        Severity::Error,
                        format!(
                            "reconstruct_region: reconstructed region size {:X}h ({}) differs from original {:X}h ({})",
                            reconstructed.len(),
                            reconstructed.len(),
                            self.model.body(index).len(),
                            self.model.body(index).len()
                        ),
                        Some(index),
                    );
                    return Err(ErrorKind::InvalidParameter);
                }

                if include_header {
                    let mut out = self.model.header(index).to_vec();
                    out.extend_from_slice(&reconstructed);
                    Ok(out)
                } else {
                    Ok(reconstructed)
                }
            }
            Action::Rebase => Err(ErrorKind::InvalidParameter),
        }
    }

    pub(crate) fn reconstruct_padding(&mut self, index: NodeId) -> Result<Vec<u8>> {
        match self.model.action(index) {
            Action::Remove => Ok(Vec::new()),
            Action::NoAction | Action::DoNotRebuild | Action::Rebuild | Action::Replace => {
                Ok(self.model.body(index).to_vec())
            }
            _ => Err(ErrorKind::InvalidParameter),
        }
    }

    /// Reconstructs a volume: files with pad-file alignment, VTF pinned to the end, free space
    /// filled with the polarity byte, checksums and Apple zero-vector fields redone.
    #[allow(clippy::too_many_lines)]
    pub(crate) fn reconstruct_volume(
        &mut self, index: NodeId, context: &mut ReconstructContext,
    ) -> Result<Vec<u8>> {
        match self.model.action(index) {
            Action::NoAction | Action::DoNotRebuild => {
                let mut out = self.model.header(index).to_vec();
                out.extend_from_slice(self.model.body(index));
                return Ok(out);
            }
            Action::Remove => return Ok(Vec::new()),
            Action::Replace | Action::Rebuild => {}
            _ => return Err(ErrorKind::InvalidParameter),
        }

        let mut header = self.model.header(index).to_vec();
        let body_size = self.model.body(index).len();
        let volume_header = VolumeHeader::parse(&header).map_err(|_| ErrorKind::InvalidVolume)?;
        let header_length = usize::from(volume_header.header_length);
        if header_length > header.len() {
            self.msg(
                Severity::Error,
                "reconstruct_volume: invalid volume header length, reconstruction is not possible"
                    .to_owned(),
                Some(index),
            );
            return Err(ErrorKind::InvalidVolume);
        }

        let mut volume_size = header.len() + body_size;
        let polarity = if volume_header.erase_polarity() {
            ErasePolarity::One
        } else {
            ErasePolarity::Zero
        };
        let empty = polarity.empty_byte();

        let children: Vec<NodeId> = self.model.children(index).to_vec();
        let mut reconstructed: Vec<u8>;
        let mut free_space_offset = 0u32;
        if !children.is_empty() {
            reconstructed = Vec::with_capacity(body_size);

            // Determine the base address for rebasing executables in this volume
            let mut volume_base = 0u32;
            let mut base_found = false;
            // A volume holding the VTF sits at the top of 4 GiB
            for &child in &children {
                if Guid::from_slice(self.model.header(child))
                    == Some(ffs::EFI_FFS_VOLUME_TOP_FILE_GUID)
                {
                    base_found = true;
                    volume_base = (0x1_0000_0000u64 - volume_size as u64) as u32;
                    break;
                }
            }
            // Compressed volumes are loaded into RAM, no rebase is wanted
            if !base_found {
                let mut ancestor = self.model.parent(index);
                while let Some(parent) = ancestor {
                    if self.model.item_type(parent) == ItemType::Root {
                        break;
                    }
                    if self.model.compression(parent) != Compression::None {
                        base_found = true;
                        volume_base = 0;
                        break;
                    }
                    ancestor = self.model.parent(parent);
                }
            }
            // Derive the base from the first PEI executable that still has its original one
            if !base_found {
                let mut file_offset = header.len();
                'files: for &child in &children {
                    let is_pei = matches!(
                        self.model.subtype(child),
                        Subtype::File(ffs::FILETYPE_PEI_CORE)
                            | Subtype::File(ffs::FILETYPE_PEIM)
                            | Subtype::File(ffs::FILETYPE_COMBINED_PEIM_DRIVER)
                    );
                    if is_pei {
                        let mut section_offset = ffs::FFS_FILE_HEADER_SIZE;
                        let sections: Vec<NodeId> = self.model.children(child).to_vec();
                        for section in sections {
                            let is_executable = matches!(
                                self.model.subtype(section),
                                Subtype::Section(ffs::SECTION_PE32)
                                    | Subtype::Section(ffs::SECTION_TE)
                            );
                            if is_executable
                                && self.model.action(section) != Action::Remove
                                && self.model.action(section) != Action::Insert
                            {
                                let relative_base = file_offset
                                    + section_offset
                                    + self.model.header(section).len();
                                if let Ok(image_base) = Self::get_base(self.model.body(section)) {
                                    volume_base =
                                        image_base.wrapping_sub(relative_base as u32);
                                    base_found = true;
                                    break 'files;
                                }
                            }
                            section_offset += self.model.header(section).len()
                                + self.model.body(section).len();
                            section_offset = vulcan_core::util::align4(section_offset);
                        }
                    }
                    file_offset +=
                        self.model.header(child).len() + self.model.body(child).len();
                    file_offset = align8(file_offset);
                }
            }
            if !base_found {
                volume_base = 0;
            }

            // Reconstruct the files
            let mut offset = 0usize;
            let mut pad_file_guid = ffs::EFI_FFS_PAD_FILE_GUID;
            let mut vtf: Option<(Vec<u8>, NodeId)> = None;
            let mut non_uefi_data: Option<(Vec<u8>, usize)> = None;

            for (position, &child) in children.iter().enumerate() {
                match self.model.item_type(child) {
                    ItemType::File => {
                        // Align to the 8-byte inter-file boundary
                        let misalignment = offset % 8;
                        if misalignment != 0 {
                            let fill = 8 - misalignment;
                            offset += fill;
                            reconstructed.resize(reconstructed.len() + fill, empty);
                        }

                        let file_base = if volume_base != 0 {
                            volume_base.wrapping_add((header.len() + offset) as u32)
                        } else {
                            0
                        };
                        let file = self.reconstruct_file(
                            child,
                            volume_header.revision,
                            polarity,
                            file_base,
                            context,
                        )?;
                        if file.is_empty() {
                            continue;
                        }
                        let file_header =
                            FfsFileHeader::parse(&file).map_err(|_| ErrorKind::InvalidFile)?;
                        let file_header_size = if volume_header.revision > 1
                            && file_header.attributes().contains(FileAttributes::LARGE_FILE)
                        {
                            ffs::FFS_FILE_HEADER2_SIZE
                        } else {
                            ffs::FFS_FILE_HEADER_SIZE
                        };

                        // Pad files are dropped and recreated where alignment needs them;
                        // their GUID is reused for stable diffs
                        if file_header.file_type == ffs::FILETYPE_PAD {
                            pad_file_guid = file_header.name;
                            if self.model.action(child) != Action::DoNotRebuild {
                                continue;
                            }
                        }

                        // The Volume Top File goes to its fixed place at the end
                        if file_header.name == ffs::EFI_FFS_VOLUME_TOP_FILE_GUID {
                            vtf = Some((file, child));
                            continue;
                        }

                        // Ensure the declared data alignment with a pad file
                        let alignment_power = ffs::FFS_ALIGNMENT_TABLE
                            [usize::from((file_header.attributes & 0x38) >> 3)];
                        let alignment = 1usize << alignment_power;
                        let alignment_base = header.len() + offset + file_header_size;
                        if alignment_base % alignment != 0 {
                            let mut pad_size = alignment - alignment_base % alignment;
                            while pad_size < ffs::FFS_FILE_HEADER_SIZE {
                                pad_size += alignment;
                            }
                            let pad = construct_pad_file(
                                pad_file_guid,
                                pad_size,
                                volume_header.revision,
                                polarity,
                            )?;
                            reconstructed.extend_from_slice(&pad);
                            offset += pad_size;
                        }

                        offset += file.len();
                        reconstructed.extend_from_slice(&file);
                    }
                    ItemType::FreeSpace => {
                        // Data sitting beyond the free space must stay at its offset
                        let free_size = self.model.body(child).len();
                        if offset + free_size < body_size {
                            if let Some(&next) = children.get(position + 1) {
                                let data = self.model.body(next).to_vec();
                                let data_offset = body_size - data.len();
                                non_uefi_data = Some((data, data_offset));
                            }
                            break;
                        }
                    }
                    _ => {}
                }
            }

            // Both a VTF and trailing non-UEFI data cannot be honored at once
            if vtf.is_some() && non_uefi_data.is_some() {
                self.msg(
                    Severity::Error,
                    "reconstruct_volume: both VTF and non-UEFI data found in the volume, reconstruction is not possible"
                        .to_owned(),
                    Some(index),
                );
                return Err(ErrorKind::InvalidVolume);
            }

            // Record the free space offset for AppleFSO volumes
            if self.model.text(index).contains("AppleFSO ") {
                free_space_offset = (header.len() + align8(offset)) as u32;
            }

            if let Some((vtf_bytes, vtf_index)) = vtf {
                let Some(vtf_offset) = body_size.checked_sub(vtf_bytes.len()) else {
                    self.msg(
                        Severity::Error,
                        "reconstruct_volume: wrong size of the Volume Top File".to_owned(),
                        Some(index),
                    );
                    return Err(ErrorKind::InvalidFile);
                };
                if vtf_offset % 8 != 0 {
                    self.msg(
                        Severity::Error,
                        "reconstruct_volume: wrong size of the Volume Top File".to_owned(),
                        Some(index),
                    );
                    return Err(ErrorKind::InvalidFile);
                }
                if vtf_offset > offset {
                    let pad = construct_pad_file(
                        pad_file_guid,
                        vtf_offset - offset,
                        volume_header.revision,
                        polarity,
                    )?;
                    reconstructed.extend_from_slice(&pad);
                } else if offset > vtf_offset {
                    self.msg(
                        Severity::Error,
                        format!(
                            "reconstruct_volume: no space left to insert VTF, need {:X}h ({}) byte(s) more",
                            offset - vtf_offset,
                            offset - vtf_offset
                        ),
                        Some(index),
                    );
                    return Err(ErrorKind::InvalidVolume);
                }

                // Reconstruct the VTF at its final base and patch the entry point in it
                let vtf_base = if volume_base != 0 {
                    volume_base.wrapping_add((header.len() + vtf_offset) as u32)
                } else {
                    0
                };
                let mut vtf_bytes = self.reconstruct_file(
                    vtf_index,
                    volume_header.revision,
                    polarity,
                    vtf_base,
                    context,
                )?;
                self.patch_vtf(&mut vtf_bytes, context)?;
                reconstructed.extend_from_slice(&vtf_bytes);
            } else if let Some((data, data_offset)) = non_uefi_data {
                if offset > data_offset {
                    self.msg(
                        Severity::Error,
                        format!(
                            "reconstruct_volume: no space left to insert non-UEFI data, need {:X}h ({}) byte(s) more",
                            offset - data_offset,
                            offset - data_offset
                        ),
                        Some(index),
                    );
                    return Err(ErrorKind::InvalidVolume);
                }
                reconstructed.resize(data_offset, empty);
                reconstructed.extend_from_slice(&data);
            } else if body_size > reconstructed.len() {
                // Fill the rest of the volume with the polarity byte
                reconstructed.resize(body_size, empty);
            } else if body_size < reconstructed.len() {
                // Try to grow the volume to fit the new body; the root volume has a fixed
                // footprint and cannot grow
                let parent_type = self
                    .model
                    .parent(index)
                    .map(|parent| self.model.item_type(parent));
                if !matches!(parent_type, Some(ItemType::File) | Some(ItemType::Section)) {
                    self.msg(
                        Severity::Error,
                        "reconstruct_volume: root volume can't be grown".to_owned(),
                        Some(index),
                    );
                    return Err(ErrorKind::VolumeGrowFailed);
                }
                let wanted_size = header.len() + reconstructed.len();
                let new_size = grow_volume(&mut header, volume_size, wanted_size)?;
                reconstructed.resize(new_size - header.len(), empty);
                volume_size = new_size;
            }
        } else {
            // No files in the volume, keep its body
            reconstructed = self.model.body(index).to_vec();
        }

        if header.len() + reconstructed.len() != volume_size {
            self.msg(
                Severity::Error,
                "reconstruct_volume: volume size can't be changed".to_owned(),
                Some(index),
            );
            return Err(ErrorKind::InvalidVolume);
        }

        // Recalculate the Apple CRC32 of the body, stored in the zero vector
        if self.model.text(index).contains("AppleCRC32 ") {
            let mut crc_input = Vec::with_capacity(volume_size - header_length);
            crc_input.extend_from_slice(&header[header_length..]);
            crc_input.extend_from_slice(&reconstructed);
            let crc = checksum::crc32(0, &crc_input);
            patch_u32(&mut header, ffs::VOLUME_ZV_CRC32_OFFSET, crc)
                .map_err(|_| ErrorKind::InvalidVolume)?;
        }

        // Store the new free space offset for AppleFSO volumes
        if free_space_offset != 0 && self.model.text(index).contains("AppleFSO ") {
            patch_u32(&mut header, ffs::VOLUME_ZV_FSO_OFFSET, free_space_offset)
                .map_err(|_| ErrorKind::InvalidVolume)?;
        }

        // Recalculate the header checksum
        patch_u16(&mut header, ffs::VOLUME_CHECKSUM_OFFSET, 0)
            .map_err(|_| ErrorKind::InvalidVolume)?;
        let new_checksum = checksum::checksum16(&header[..header_length]);
        patch_u16(&mut header, ffs::VOLUME_CHECKSUM_OFFSET, new_checksum)
            .map_err(|_| ErrorKind::InvalidVolume)?;

        let mut out = header;
        out.extend_from_slice(&reconstructed);
        Ok(out)
    }

    /// Reconstructs one FFS file, redoing sizes, checksums, state and the optional tail.
    #[allow(clippy::too_many_lines)]
    pub(crate) fn reconstruct_file(
        &mut self, index: NodeId, revision: u8, polarity: ErasePolarity, base: u32,
        context: &mut ReconstructContext,
    ) -> Result<Vec<u8>> {
        match self.model.action(index) {
            Action::NoAction | Action::DoNotRebuild => {
                let mut out = self.model.header(index).to_vec();
                out.extend_from_slice(self.model.body(index));
                let file_header = FfsFileHeader::parse(self.model.header(index))
                    .map_err(|_| ErrorKind::InvalidFile)?;
                if revision == 1
                    && file_header.attributes().contains(FileAttributes::TAIL_PRESENT)
                {
                    out.push(!file_header.header_checksum());
                    out.push(!file_header.data_checksum());
                }
                return Ok(out);
            }
            Action::Remove => return Ok(Vec::new()),
            Action::Insert | Action::Replace | Action::Rebuild => {}
            _ => return Err(ErrorKind::InvalidParameter),
        }

        let mut header = self.model.header(index).to_vec();
        let file_header = FfsFileHeader::parse(&header).map_err(|_| ErrorKind::InvalidFile)?;

        if polarity == ErasePolarity::Unknown {
            self.msg(
                Severity::Error,
                "reconstruct_file: unknown erase polarity".to_owned(),
                Some(index),
            );
            return Err(ErrorKind::InvalidParameter);
        }

        // Normalize the state with respect to its stored polarity bit, then drop files whose
        // state says they never became valid
        let mut state = FileState::from_bits_retain(file_header.state);
        if state.contains(FileState::ERASE_POLARITY) {
            state = FileState::from_bits_retain(!state.bits());
        }
        if state.contains(FileState::HEADER_INVALID) {
            self.msg(
                Severity::Info,
                "reconstruct_file: file is in HEADER_INVALID state, and will be removed from reconstructed image"
                    .to_owned(),
                Some(index),
            );
            return Ok(Vec::new());
        } else if state.contains(FileState::DELETED) {
            self.msg(
                Severity::Info,
                "reconstruct_file: file is in DELETED state, and will be removed from reconstructed image"
                    .to_owned(),
                Some(index),
            );
            return Ok(Vec::new());
        } else if state.contains(FileState::MARKED_FOR_UPDATE) {
            self.msg(
                Severity::Info,
                "reconstruct_file: file's MARKED_FOR_UPDATE state cleared".to_owned(),
                Some(index),
            );
        } else if state.contains(FileState::DATA_VALID) {
            // File is in good condition, reconstruct it
        } else if state.contains(FileState::HEADER_VALID)
            || state.contains(FileState::HEADER_CONSTRUCTION)
        {
            self.msg(
                Severity::Info,
                "reconstruct_file: file never reached DATA_VALID state, and will be removed from reconstructed image"
                    .to_owned(),
                Some(index),
            );
            return Ok(Vec::new());
        }

        let large_file =
            revision > 1 && file_header.attributes().contains(FileAttributes::LARGE_FILE);
        let header_size =
            if large_file { ffs::FFS_FILE_HEADER2_SIZE } else { ffs::FFS_FILE_HEADER_SIZE };

        // Reconstruct the file body
        let children: Vec<NodeId> = self.model.children(index).to_vec();
        let mut reconstructed: Vec<u8>;
        if !children.is_empty() {
            if file_header.file_type == ffs::FILETYPE_ALL
                || file_header.file_type == ffs::FILETYPE_RAW
            {
                // Raw files hold BIOS-like content, size must not change
                reconstructed = self.reconstruct_region(index, false, context)?;
            } else {
                reconstructed = Vec::new();
                let mut offset = 0usize;
                for child in children {
                    // Sections are 4-byte aligned with zero fill
                    let misalignment = offset % 4;
                    if misalignment != 0 {
                        let fill = 4 - misalignment;
                        offset += fill;
                        reconstructed.resize(reconstructed.len() + fill, 0);
                    }

                    let mut section_base =
                        if base != 0 { base + (header_size + offset) as u32 } else { 0 };
                    // If a pad file will be inserted to align this file, the executables in it
                    // land that much further
                    let alignment_power = ffs::FFS_ALIGNMENT_TABLE
                        [usize::from((file_header.attributes & 0x38) >> 3)];
                    let alignment = 1u32 << alignment_power;
                    let alignment_base = base.wrapping_add(header_size as u32);
                    if base != 0 && alignment_base % alignment != 0 {
                        let mut pad_size = alignment - alignment_base % alignment;
                        while (pad_size as usize) < ffs::FFS_FILE_HEADER_SIZE {
                            pad_size += alignment;
                        }
                        section_base += pad_size;
                    }

                    let section = self.reconstruct_section(child, section_base, context)?;
                    if section.is_empty() {
                        continue;
                    }
                    reconstructed.extend_from_slice(&section);
                    offset += section.len();
                }
            }
        } else {
            reconstructed = self.model.body(index).to_vec();
        }

        // Correct the file size
        let tail_size = if revision == 1
            && file_header.attributes().contains(FileAttributes::TAIL_PRESENT)
        {
            2usize
        } else {
            0
        };
        if large_file {
            header[ffs::FFS_SIZE_OFFSET..ffs::FFS_SIZE_OFFSET + 3]
                .copy_from_slice(&ffs::u32_to_uint24(ffs::SECTION2_IS_USED));
            patch_u64(
                &mut header,
                ffs::FFS_EXTENDED_SIZE_OFFSET,
                (header_size + reconstructed.len() + tail_size) as u64,
            )
            .map_err(|_| ErrorKind::InvalidFile)?;
        } else {
            let full_size = header_size + reconstructed.len() + tail_size;
            if full_size > 0xFF_FFFF {
                self.msg(
                    Severity::Error,
                    "reconstruct_file: resulting file size is too big".to_owned(),
                    Some(index),
                );
                return Err(ErrorKind::InvalidFile);
            }
            header[ffs::FFS_SIZE_OFFSET..ffs::FFS_SIZE_OFFSET + 3]
                .copy_from_slice(&ffs::u32_to_uint24(full_size as u32));
        }

        // Set the file state before the checksum, it is excluded from the sum
        let mut new_state =
            FileState::DATA_VALID | FileState::HEADER_VALID | FileState::HEADER_CONSTRUCTION;
        if polarity == ErasePolarity::One {
            new_state = FileState::from_bits_retain(!new_state.bits());
        }
        header[ffs::FFS_STATE_OFFSET] = new_state.bits();

        // Recalculate the header checksum with the integrity check bytes zeroed
        header[ffs::FFS_INTEGRITY_OFFSET] = 0;
        header[ffs::FFS_INTEGRITY_OFFSET + 1] = 0;
        let header_checksum = 0u8
            .wrapping_sub(checksum::sum8(&header).wrapping_sub(header[ffs::FFS_STATE_OFFSET]));
        header[ffs::FFS_INTEGRITY_OFFSET] = header_checksum;

        // Recalculate the data checksum, if used
        let data_checksum = if file_header.attributes().contains(FileAttributes::CHECKSUM) {
            checksum::checksum8(&reconstructed)
        } else if revision == 1 {
            ffs::FFS_FIXED_CHECKSUM
        } else {
            ffs::FFS_FIXED_CHECKSUM2
        };
        header[ffs::FFS_INTEGRITY_OFFSET + 1] = data_checksum;

        // Reappend the tail as the complement of the two checksum bytes
        if tail_size != 0 {
            reconstructed.push(!header_checksum);
            reconstructed.push(!data_checksum);
        }

        let mut out = header;
        out.extend_from_slice(&reconstructed);
        Ok(out)
    }

    /// Reconstructs one section, recompressing encapsulations and rebasing executables.
    #[allow(clippy::too_many_lines)]
    pub(crate) fn reconstruct_section(
        &mut self, index: NodeId, base: u32, context: &mut ReconstructContext,
    ) -> Result<Vec<u8>> {
        match self.model.action(index) {
            Action::NoAction | Action::DoNotRebuild => {
                let mut out = self.model.header(index).to_vec();
                out.extend_from_slice(self.model.body(index));
                return Ok(out);
            }
            Action::Remove => return Ok(Vec::new()),
            Action::Insert | Action::Replace | Action::Rebuild | Action::Rebase => {}
            _ => return Err(ErrorKind::InvalidParameter),
        }

        let mut header = self.model.header(index).to_vec();
        if header.len() < ffs::COMMON_SECTION_HEADER_SIZE {
            return Err(ErrorKind::InvalidSection);
        }
        let extended = ffs::uint24_to_u32(&header[..3]) == ffs::SECTION2_IS_USED;
        let common = if extended {
            ffs::COMMON_SECTION_HEADER2_SIZE
        } else {
            ffs::COMMON_SECTION_HEADER_SIZE
        };
        let section_type = self.model.subtype(index).section_type();

        let children: Vec<NodeId> = self.model.children(index).to_vec();
        let mut reconstructed: Vec<u8>;
        if !children.is_empty() {
            reconstructed = Vec::new();
            let mut offset = 0usize;
            for child in children {
                let misalignment = offset % 4;
                if misalignment != 0 {
                    let fill = 4 - misalignment;
                    offset += fill;
                    reconstructed.resize(reconstructed.len() + fill, 0);
                }
                let piece = self.reconstruct(child, context)?;
                if piece.is_empty() {
                    continue;
                }
                reconstructed.extend_from_slice(&piece);
                offset += piece.len();
            }

            // Only these two section types can carry a compressed body
            if section_type == Some(ffs::SECTION_COMPRESSION) {
                if header.len() < common + 5 {
                    return Err(ErrorKind::InvalidSection);
                }
                // Set the new uncompressed size and the on-wire compression type
                patch_u32(&mut header, common, reconstructed.len() as u32)
                    .map_err(|_| ErrorKind::InvalidSection)?;
                let compression = self.model.compression(index);
                header[common + 4] = match compression {
                    Compression::None => ffs::EFI_NOT_COMPRESSED,
                    Compression::Efi11 | Compression::Tiano => ffs::EFI_STANDARD_COMPRESSION,
                    Compression::Lzma | Compression::Imlzma => ffs::EFI_CUSTOMIZED_COMPRESSION,
                    Compression::Unknown => return Err(ErrorKind::UnknownCompressionAlgorithm),
                };
                let dictionary_size = self.model.dictionary_size(index);
                reconstructed = self.compress(&reconstructed, compression, dictionary_size)?;
            } else if section_type == Some(ffs::SECTION_GUID_DEFINED) {
                let guided = ffs::GuidDefinedSectionHeader::parse(&header)
                    .map_err(|_| ErrorKind::InvalidSection)?;
                // The x86 filter runs before compression for LZMAF86 payloads
                if guided.section_definition_guid == ffs::EFI_GUIDED_SECTION_LZMAF86 {
                    x86::convert(&mut reconstructed, x86::Mode::Encode)
                        .map_err(|_| ErrorKind::CustomizedCompressionFailed)?;
                }
                let compression = self.model.compression(index);
                let dictionary_size = self.model.dictionary_size(index);
                let compressed = self.compress(&reconstructed, compression, dictionary_size)?;

                if guided.attributes & ffs::GUIDED_SECTION_AUTH_STATUS_VALID != 0 {
                    if guided.section_definition_guid == ffs::EFI_GUIDED_SECTION_CRC32 {
                        if header.len() != common + 20 + 4 {
                            self.msg(
                                Severity::Error,
                                format!(
                                    "reconstruct_section: invalid CRC32 section size {:X}h ({})",
                                    header.len(),
                                    header.len()
                                ),
                                Some(index),
                            );
                            return Err(ErrorKind::InvalidSection);
                        }
                        let crc = checksum::crc32(0, &compressed);
                        patch_u32(&mut header, common + 20, crc)
                            .map_err(|_| ErrorKind::InvalidSection)?;
                    } else {
                        self.msg(
                            Severity::Warning,
                            "reconstruct_section: GUID defined section authentication info can become invalid"
                                .to_owned(),
                            Some(index),
                        );
                    }
                }
                if guided.attributes & ffs::GUIDED_SECTION_PROCESSING_REQUIRED != 0
                    && guided.section_definition_guid == ffs::EFI_FIRMWARE_CONTENTS_SIGNED_GUID
                {
                    self.msg(
                        Severity::Warning,
                        "reconstruct_section: GUID defined section signature can become invalid"
                            .to_owned(),
                        Some(index),
                    );
                }
                reconstructed = compressed;
            } else if self.model.compression(index) != Compression::None {
                self.msg(
                    Severity::Error,
                    "reconstruct_section: incorrectly required compression for section".to_owned(),
                    Some(index),
                );
                return Err(ErrorKind::InvalidSection);
            }
        } else {
            reconstructed = self.model.body(index).to_vec();
        }

        // Correct the section size, switching to the extended form is not possible in place
        let full_size = header.len() + reconstructed.len();
        if extended {
            header[..3].copy_from_slice(&ffs::u32_to_uint24(ffs::SECTION2_IS_USED));
            patch_u32(&mut header, 4, full_size as u32).map_err(|_| ErrorKind::InvalidSection)?;
        } else {
            if full_size > 0xFF_FFFF {
                self.msg(
                    Severity::Error,
                    "reconstruct_section: resulting section size is too big".to_owned(),
                    Some(index),
                );
                return Err(ErrorKind::InvalidSection);
            }
            header[..3].copy_from_slice(&ffs::u32_to_uint24(full_size as u32));
        }

        // Rebase PE32 or TE images in uncompressed PEI files
        let parent_is_pei = self
            .model
            .parent(index)
            .map(|parent| {
                matches!(
                    self.model.subtype(parent),
                    Subtype::File(ffs::FILETYPE_PEI_CORE)
                        | Subtype::File(ffs::FILETYPE_PEIM)
                        | Subtype::File(ffs::FILETYPE_COMBINED_PEIM_DRIVER)
                )
            })
            .unwrap_or(false);
        let is_executable = matches!(
            section_type,
            Some(ffs::SECTION_PE32) | Some(ffs::SECTION_TE)
        );
        if is_executable && parent_is_pei && base != 0 {
            // Vendors fold the TE stripped size into ImageBase, so no extra fixup is applied
            let result = self.rebase(&mut reconstructed, base + header.len() as u32, index);
            if let Err(error) = result {
                self.msg(
                    Severity::Error,
                    "reconstruct_section: executable section rebase failed".to_owned(),
                    Some(index),
                );
                return Err(error);
            }

            // Stash the new PEI core entry point for the VTF patcher
            let parent_is_pei_core = self
                .model
                .parent(index)
                .map(|parent| self.model.subtype(parent) == Subtype::File(ffs::FILETYPE_PEI_CORE))
                .unwrap_or(false);
            if parent_is_pei_core {
                match Self::get_entry_point(&reconstructed) {
                    Ok(entry_point) => context.new_pei_core_entry_point = entry_point,
                    Err(_) => self.msg(
                        Severity::Warning,
                        "reconstruct_section: can't get entry point of PEI core".to_owned(),
                        Some(index),
                    ),
                }
            }
        }

        let mut out = header;
        out.extend_from_slice(&reconstructed);
        Ok(out)
    }

    /// Overwrites the last occurrence of the pre-edit PEI core entry point inside the VTF with
    /// the rebased one.
    pub(crate) fn patch_vtf(
        &mut self, vtf: &mut [u8], context: &ReconstructContext,
    ) -> Result<()> {
        if self.old_pei_core_entry_point == 0 {
            self.msg(
                Severity::Error,
                "patch_vtf: PEI Core entry point can't be determined. VTF can't be patched."
                    .to_owned(),
                None,
            );
            return Err(ErrorKind::PeiCoreEntryPointNotFound);
        }
        if context.new_pei_core_entry_point == 0
            || self.old_pei_core_entry_point == context.new_pei_core_entry_point
        {
            // No need to patch anything
            return Ok(());
        }

        let old = self.old_pei_core_entry_point.to_le_bytes();
        let position = vtf
            .windows(4)
            .enumerate()
            .filter(|(_, window)| *window == old)
            .map(|(at, _)| at)
            .last();
        match position {
            Some(at) => {
                vtf[at..at + 4].copy_from_slice(&context.new_pei_core_entry_point.to_le_bytes());
                Ok(())
            }
            None => {
                self.msg(
                    Severity::Warning,
                    "patch_vtf: PEI Core entry point can't be found in VTF. VTF not patched."
                        .to_owned(),
                    None,
                );
                Ok(())
            }
        }
    }
}

/// Builds an empty pad file: the recorded GUID, polarity-filled body, fresh checksums.
pub(crate) fn construct_pad_file(
    guid: Guid, size: usize, revision: u8, polarity: ErasePolarity,
) -> Result<Vec<u8>> {
    if size < ffs::FFS_FILE_HEADER_SIZE || polarity == ErasePolarity::Unknown {
        return Err(ErrorKind::InvalidParameter);
    }
    if size >= 0xFF_FFFF {
        // TODO: large pad file support
        return Err(ErrorKind::InvalidParameter);
    }

    let empty = polarity.empty_byte();
    let mut pad = vec![empty; size];
    pad[..16].copy_from_slice(guid.as_bytes());
    pad[ffs::FFS_INTEGRITY_OFFSET] = 0;
    pad[ffs::FFS_INTEGRITY_OFFSET + 1] = 0;
    pad[18] = ffs::FILETYPE_PAD;
    pad[19] = 0x00; // attributes
    pad[ffs::FFS_SIZE_OFFSET..ffs::FFS_SIZE_OFFSET + 3]
        .copy_from_slice(&ffs::u32_to_uint24(size as u32));

    let mut state =
        FileState::HEADER_CONSTRUCTION | FileState::HEADER_VALID | FileState::DATA_VALID;
    if polarity == ErasePolarity::One {
        state = FileState::from_bits_retain(!state.bits());
    }
    pad[ffs::FFS_STATE_OFFSET] = state.bits();

    // The state byte does not participate in the header checksum
    pad[ffs::FFS_INTEGRITY_OFFSET] =
        checksum::checksum8(&pad[..ffs::FFS_FILE_HEADER_SIZE - 1]);
    pad[ffs::FFS_INTEGRITY_OFFSET + 1] =
        if revision == 1 { ffs::FFS_FIXED_CHECKSUM } else { ffs::FFS_FIXED_CHECKSUM2 };

    Ok(pad)
}

/// Grows a volume by extending the first block map entry, recomputing `FvLength` and the
/// header checksum. Only simple single-entry maps can be grown.
pub(crate) fn grow_volume(header: &mut [u8], size: usize, new_size: usize) -> Result<usize> {
    if header.len() < ffs::VOLUME_HEADER_SIZE {
        return Err(ErrorKind::InvalidVolume);
    }
    let volume_header = VolumeHeader::parse(header).map_err(|_| ErrorKind::InvalidVolume)?;
    let header_length = usize::from(volume_header.header_length);
    if header_length < ffs::VOLUME_HEADER_SIZE || header_length > header.len() {
        return Err(ErrorKind::InvalidVolume);
    }

    let block_map_size = header_length - ffs::VOLUME_HEADER_SIZE;
    if block_map_size % ffs::BLOCK_MAP_ENTRY_SIZE != 0 {
        return Err(ErrorKind::InvalidVolume);
    }
    let block_map_count = block_map_size / ffs::BLOCK_MAP_ENTRY_SIZE;
    if block_map_count < 2 {
        return Err(ErrorKind::InvalidVolume);
    }

    // The last entry must be the terminator
    let last_offset = ffs::VOLUME_HEADER_SIZE + (block_map_count - 1) * ffs::BLOCK_MAP_ENTRY_SIZE;
    let last = BlockMapEntry::parse(&header[last_offset..]).map_err(|_| ErrorKind::InvalidVolume)?;
    if !last.is_terminator() {
        return Err(ErrorKind::InvalidVolume);
    }
    if block_map_count > 2 {
        return Err(ErrorKind::ComplexBlockMap);
    }
    if new_size <= size {
        return Err(ErrorKind::InvalidParameter);
    }

    let first =
        BlockMapEntry::parse(&header[ffs::VOLUME_HEADER_SIZE..]).map_err(|_| ErrorKind::InvalidVolume)?;
    if first.length == 0 {
        return Err(ErrorKind::InvalidVolume);
    }
    let block_length = first.length as usize;

    // Round the new size up to a whole number of blocks
    let grown_size = new_size + (block_length - new_size % block_length) % block_length;
    let num_blocks = grown_size / block_length;
    patch_u32(header, ffs::VOLUME_HEADER_SIZE, num_blocks as u32)
        .map_err(|_| ErrorKind::InvalidVolume)?;
    patch_u64(header, ffs::VOLUME_FV_LENGTH_OFFSET, grown_size as u64)
        .map_err(|_| ErrorKind::InvalidVolume)?;

    // Recalculate the volume header checksum
    patch_u16(header, ffs::VOLUME_CHECKSUM_OFFSET, 0).map_err(|_| ErrorKind::InvalidVolume)?;
    let new_checksum = checksum::checksum16(&header[..header_length]);
    patch_u16(header, ffs::VOLUME_CHECKSUM_OFFSET, new_checksum)
        .map_err(|_| ErrorKind::InvalidVolume)?;

    Ok(grown_size)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pad_file_is_valid() {
        let pad =
            construct_pad_file(ffs::EFI_FFS_PAD_FILE_GUID, 0x30, 2, ErasePolarity::One).unwrap();
        assert_eq!(pad.len(), 0x30);
        let header = FfsFileHeader::parse(&pad).unwrap();
        assert_eq!(header.file_type, ffs::FILETYPE_PAD);
        assert_eq!(header.size, 0x30);
        assert_eq!(header.data_checksum(), ffs::FFS_FIXED_CHECKSUM2);
        // Header checksum over everything but the state byte must be zero
        assert_eq!(checksum::sum8(&pad[..ffs::FFS_FILE_HEADER_SIZE - 1]), 0);
        // Body is erased flash
        assert!(pad[ffs::FFS_FILE_HEADER_SIZE..].iter().all(|&byte| byte == 0xFF));
    }

    #[test]
    fn grow_volume_arithmetic() {
        // Header with a single block map entry of 16 blocks x 0x1000
        let mut header = vec![0u8; ffs::VOLUME_HEADER_SIZE + 2 * ffs::BLOCK_MAP_ENTRY_SIZE];
        header[32..40].copy_from_slice(&0x10000u64.to_le_bytes());
        header[40..44].copy_from_slice(&ffs::FV_SIGNATURE);
        let header_len = header.len() as u16;
        header[48..50].copy_from_slice(&header_len.to_le_bytes());
        header[56..60].copy_from_slice(&16u32.to_le_bytes());
        header[60..64].copy_from_slice(&0x1000u32.to_le_bytes());

        let new_size = grow_volume(&mut header, 0x10000, 0x10800).unwrap();
        assert_eq!(new_size, 0x11000);
        let first = BlockMapEntry::parse(&header[ffs::VOLUME_HEADER_SIZE..]).unwrap();
        assert_eq!(first.num_blocks, 17);
        let parsed = VolumeHeader::parse(&header).unwrap();
        assert_eq!(parsed.fv_length, 0x11000);
        // Checksum over the header must now be zero
        assert_eq!(checksum::checksum16(&header), 0);
    }

    #[test]
    fn grow_volume_rejects_complex_maps() {
        let mut header = vec![0u8; ffs::VOLUME_HEADER_SIZE + 3 * ffs::BLOCK_MAP_ENTRY_SIZE];
        header[32..40].copy_from_slice(&0x20000u64.to_le_bytes());
        header[40..44].copy_from_slice(&ffs::FV_SIGNATURE);
        let header_len = header.len() as u16;
        header[48..50].copy_from_slice(&header_len.to_le_bytes());
        header[56..60].copy_from_slice(&16u32.to_le_bytes());
        header[60..64].copy_from_slice(&0x1000u32.to_le_bytes());
        header[64..68].copy_from_slice(&16u32.to_le_bytes());
        header[68..72].copy_from_slice(&0x1000u32.to_le_bytes());

        assert_eq!(
            grow_volume(&mut header, 0x20000, 0x20800),
            Err(ErrorKind::ComplexBlockMap)
        );
    }
}
