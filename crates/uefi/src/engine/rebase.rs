//! Rebasing of PE32 and TE executables when files move within an uncompressed PEI volume.

use vulcan_core::prelude::*;

use crate::engine::FfsEngine;
use crate::errors::{ErrorKind, Result};
use crate::ffs;
use crate::messages::Severity;
use crate::peimage::{self, TE_HEADER_SIZE, TE_IMAGE_BASE_OFFSET};
use crate::treemodel::NodeId;
use crate::types::{Action, ItemType, Subtype};

impl FfsEngine {
    /// Reads the stored image base from a PE32 or TE executable.
    pub(crate) fn get_base(file: &[u8]) -> Result<u32> {
        if file.is_empty() {
            return Err(ErrorKind::InvalidFile);
        }
        match peimage::image_signature(file) {
            Some(peimage::DOS_SIGNATURE) => {
                let pe = peimage::parse_pe(file).map_err(pe_error)?;
                Ok(pe.image_base as u32)
            }
            Some(peimage::TE_SIGNATURE) => {
                let te = peimage::parse_te(file).map_err(pe_error)?;
                Ok(te.image_base as u32)
            }
            _ => Err(ErrorKind::UnknownImageType),
        }
    }

    /// Computes the absolute entry point of a PE32 or TE executable.
    pub(crate) fn get_entry_point(file: &[u8]) -> Result<u32> {
        if file.is_empty() {
            return Err(ErrorKind::InvalidFile);
        }
        match peimage::image_signature(file) {
            Some(peimage::DOS_SIGNATURE) => {
                let pe = peimage::parse_pe(file).map_err(pe_error)?;
                Ok(pe.entry_point() as u32)
            }
            Some(peimage::TE_SIGNATURE) => {
                let te = peimage::parse_te(file).map_err(pe_error)?;
                Ok((te.image_base + u64::from(te.address_of_entry_point)) as u32
                    - te.fixup())
            }
            _ => Err(ErrorKind::UnknownImageType),
        }
    }

    /// Moves an executable to a new base: patches `ImageBase` and walks the base relocation
    /// directory, adjusting each entry by the base delta.
    pub(crate) fn rebase(
        &mut self, executable: &mut [u8], base: u32, index: NodeId,
    ) -> Result<()> {
        let delta: u32;
        let reloc_offset: u32;
        let reloc_size: u32;
        let mut te_fixup = 0u32;

        match peimage::image_signature(executable) {
            Some(peimage::DOS_SIGNATURE) => {
                let pe = peimage::parse_pe(executable).map_err(pe_error)?;
                delta = base.wrapping_sub(pe.image_base as u32);
                if delta == 0 {
                    return Ok(());
                }
                reloc_offset = pe.relocation_directory.virtual_address;
                reloc_size = pe.relocation_directory.size;
                if pe.image_base_is_64 {
                    patch_u64(executable, pe.image_base_offset, u64::from(base))
                        .map_err(|_| ErrorKind::InvalidFile)?;
                } else {
                    patch_u32(executable, pe.image_base_offset, base)
                        .map_err(|_| ErrorKind::InvalidFile)?;
                }
            }
            Some(peimage::TE_SIGNATURE) => {
                let te = peimage::parse_te(executable).map_err(pe_error)?;
                delta = base.wrapping_sub(te.image_base as u32);
                if delta == 0 {
                    return Ok(());
                }
                reloc_offset = te.relocation_directory.virtual_address;
                reloc_size = te.relocation_directory.size;
                te_fixup = u32::from(te.stripped_size).saturating_sub(TE_HEADER_SIZE as u32);
                patch_u64(executable, TE_IMAGE_BASE_OFFSET, u64::from(base))
                    .map_err(|_| ErrorKind::InvalidFile)?;
                self.msg(
                    Severity::Warning,
                    "rebase: can't determine if TE image base is adjusted or not, rebased TE image may stop working"
                        .to_owned(),
                    Some(index),
                );
            }
            _ => return Err(ErrorKind::UnknownImageType),
        }

        // No relocations to fix
        if reloc_offset == 0 {
            return Ok(());
        }

        // Run the whole relocation block
        let relocs_begin =
            reloc_offset.checked_sub(te_fixup).ok_or(ErrorKind::BadRelocationEntry)?;
        let mut block_offset = relocs_begin as usize;
        let blocks_end = (relocs_begin + reloc_size) as usize;
        while block_offset < blocks_end {
            if executable.len() < block_offset + 8 {
                return Err(ErrorKind::BadRelocationEntry);
            }
            let mut cursor = DataCursorRef::new(executable);
            cursor.set_position(block_offset);
            let virtual_address = cursor.read_u32().map_err(|_| ErrorKind::BadRelocationEntry)?;
            let size_of_block = cursor.read_u32().map_err(|_| ErrorKind::BadRelocationEntry)?;
            if size_of_block < 8 {
                return Err(ErrorKind::BadRelocationEntry);
            }
            let block_end = block_offset + size_of_block as usize;
            if block_end > executable.len() || block_end > blocks_end {
                return Err(ErrorKind::BadRelocationEntry);
            }

            // Run this relocation record
            let mut entry_offset = block_offset + 8;
            while entry_offset + 2 <= block_end {
                let entry =
                    u16::from_le_bytes([executable[entry_offset], executable[entry_offset + 1]]);
                entry_offset += 2;
                if entry == 0 {
                    // Trailing alignment entry
                    continue;
                }
                let location = (virtual_address.wrapping_sub(te_fixup)
                    + u32::from(entry & 0x0FFF)) as usize;
                if executable.len() < location {
                    return Err(ErrorKind::BadRelocationEntry);
                }
                match (entry >> 12) as u8 {
                    peimage::REL_BASED_ABSOLUTE => {}
                    peimage::REL_BASED_HIGH => {
                        let mut cursor = DataCursorRef::new(executable);
                        cursor.set_position(location);
                        let value =
                            cursor.read_u16().map_err(|_| ErrorKind::BadRelocationEntry)?;
                        patch_u16(
                            executable,
                            location,
                            value.wrapping_add((delta >> 16) as u16),
                        )
                        .map_err(|_| ErrorKind::BadRelocationEntry)?;
                    }
                    peimage::REL_BASED_LOW => {
                        let mut cursor = DataCursorRef::new(executable);
                        cursor.set_position(location);
                        let value =
                            cursor.read_u16().map_err(|_| ErrorKind::BadRelocationEntry)?;
                        patch_u16(executable, location, value.wrapping_add(delta as u16))
                            .map_err(|_| ErrorKind::BadRelocationEntry)?;
                    }
                    peimage::REL_BASED_HIGHLOW => {
                        let mut cursor = DataCursorRef::new(executable);
                        cursor.set_position(location);
                        let value =
                            cursor.read_u32().map_err(|_| ErrorKind::BadRelocationEntry)?;
                        patch_u32(executable, location, value.wrapping_add(delta))
                            .map_err(|_| ErrorKind::BadRelocationEntry)?;
                    }
                    peimage::REL_BASED_DIR64 => {
                        let mut cursor = DataCursorRef::new(executable);
                        cursor.set_position(location);
                        let value =
                            cursor.read_u64().map_err(|_| ErrorKind::BadRelocationEntry)?;
                        let signed_delta = i64::from(delta as i32);
                        patch_u64(executable, location, value.wrapping_add_signed(signed_delta))
                            .map_err(|_| ErrorKind::BadRelocationEntry)?;
                    }
                    _ => return Err(ErrorKind::UnknownRelocationType),
                }
            }

            block_offset = block_end;
        }

        Ok(())
    }

    /// Marks executable sections for rebasing after a structural change: every PEI file at or
    /// after the changed file, and the VTF of every later volume.
    pub(crate) fn rebase_pei_files(&mut self, index: NodeId) {
        let Some(parent) = self.model.parent(index) else {
            return;
        };

        // Rebase all PE32 and TE sections in PEI files after the modified one
        let siblings: Vec<NodeId> = self.model.children(parent).to_vec();
        let start = self.model.row(index);
        for &file_index in siblings.iter().skip(start) {
            let is_pei = matches!(
                self.model.subtype(file_index),
                Subtype::File(ffs::FILETYPE_PEI_CORE)
                    | Subtype::File(ffs::FILETYPE_PEIM)
                    | Subtype::File(ffs::FILETYPE_COMBINED_PEIM_DRIVER)
            );
            if is_pei {
                self.mark_executable_sections(file_index);
            }
        }

        // Rebase the VTF in subsequent volumes
        let Some(volume) = self.model.find_parent_of_type(index, ItemType::Volume) else {
            return;
        };
        let Some(container) = self.model.parent(volume) else {
            return;
        };
        let volumes: Vec<NodeId> = self.model.children(container).to_vec();
        for &later_volume in volumes.iter().skip(self.model.row(volume) + 1) {
            let files: Vec<NodeId> = self.model.children(later_volume).to_vec();
            for file_index in files {
                if Guid::from_slice(self.model.header(file_index))
                    == Some(ffs::EFI_FFS_VOLUME_TOP_FILE_GUID)
                {
                    self.mark_executable_sections(file_index);
                }
            }
        }
    }

    fn mark_executable_sections(&mut self, file_index: NodeId) {
        let sections: Vec<NodeId> = self.model.children(file_index).to_vec();
        for section in sections {
            let is_executable = matches!(
                self.model.subtype(section),
                Subtype::Section(ffs::SECTION_PE32) | Subtype::Section(ffs::SECTION_TE)
            );
            if is_executable && self.model.action(section) != Action::Remove {
                self.model.set_action(section, Action::Rebase);
            }
        }
    }
}

fn pe_error(error: peimage::Error) -> ErrorKind {
    match error {
        peimage::Error::UnknownOptionalHeaderType => ErrorKind::UnknownPeOptionalHeaderType,
        peimage::Error::UnknownImageType => ErrorKind::UnknownImageType,
        peimage::Error::EndOfFile => ErrorKind::InvalidFile,
    }
}
