//! Edit operations over tree nodes: create, insert, replace, remove, rebuild, extract.
//!
//! All of them only mark intent or splice pre-validated nodes into the tree; the bytes of the
//! surrounding containers change when the tree is reconstructed.

use vulcan_core::checksum;
use vulcan_core::prelude::*;

use crate::engine::parser::DEFAULT_LZMA_DICTIONARY_SIZE;
use crate::engine::FfsEngine;
use crate::errors::{ErrorKind, Result};
use crate::ffs::{self, FfsFileHeader, FileAttributes, FileState, GuidDefinedSectionHeader,
    SectionHeader, VolumeHeader};
use crate::messages::Severity;
use crate::treemodel::NodeId;
use crate::types::{
    Action, Compression, ErasePolarity, ExtractMode, InsertMode, ItemType, RegionSubtype,
    ReplaceMode, Subtype,
};

impl FfsEngine {
    /// Creates a node from headered bytes and splices it in relative to `index`.
    ///
    /// The new content is run through the parser, so everything reachable from it shows up in
    /// the tree, and PEI files that shift as a consequence are marked for rebasing.
    #[allow(clippy::too_many_lines)]
    pub fn create(
        &mut self, index: NodeId, item_type: ItemType, header: &[u8], body: &[u8],
        mode: InsertMode, action: Action, algorithm: Compression,
    ) -> Result<NodeId> {
        if self.model.parent(index).is_none() {
            return Err(ErrorKind::InvalidParameter);
        }
        let parent = match mode {
            InsertMode::Before | InsertMode::After => {
                self.model.parent(index).ok_or(ErrorKind::InvalidParameter)?
            }
            _ => index,
        };

        match item_type {
            ItemType::Region => {
                let created = match self.model.subtype(index) {
                    Subtype::Region(RegionSubtype::Bios) => {
                        match self.parse_bios_region(body, index, mode) {
                            Ok(region) => region,
                            Err(ErrorKind::ItemNotFound | ErrorKind::InvalidVolume) => {
                                return Err(ErrorKind::InvalidRegion)
                            }
                            Err(error) => return Err(error),
                        }
                    }
                    Subtype::Region(RegionSubtype::Me) => {
                        self.parse_me_region(body, index, mode)?
                    }
                    Subtype::Region(RegionSubtype::Gbe) => {
                        self.parse_gbe_region(body, index, mode)?
                    }
                    Subtype::Region(RegionSubtype::Pdr) => {
                        self.parse_pdr_region(body, index, mode)?
                    }
                    _ => return Err(ErrorKind::InvalidParameter),
                };
                self.model.set_action(created, action);
                Ok(created)
            }

            ItemType::Padding => {
                let info = format!("Full size: {:X}h ({})", body.len(), body.len());
                let created = self.model.add_item(
                    ItemType::Padding,
                    Subtype::Padding(super::parser::get_padding_type(body)),
                    Compression::None,
                    "Padding",
                    "",
                    &info,
                    &[],
                    body,
                    index,
                    mode,
                );
                self.model.set_action(created, action);
                Ok(created)
            }

            ItemType::Volume => {
                let mut volume = Vec::new();
                if header.is_empty() {
                    // Whole volume passed as body
                    volume.extend_from_slice(body);
                } else {
                    // Body only: keep the old header and refill missing free space
                    volume.extend_from_slice(header);
                    volume.extend_from_slice(body);
                    let size_diff = self.model.body(index).len() as i64 - body.len() as i64;
                    if size_diff > 0 {
                        let volume_header = VolumeHeader::parse(self.model.header(index))
                            .map_err(|_| ErrorKind::InvalidVolume)?;
                        let empty = if volume_header.erase_polarity() { 0xFF } else { 0x00 };
                        volume.resize(volume.len() + size_diff as usize, empty);
                    }
                }
                let created = self.parse_volume(&volume, index, mode)?;
                self.model.set_action(created, action);
                Ok(created)
            }

            ItemType::File => {
                if self.model.item_type(parent) != ItemType::Volume {
                    return Err(ErrorKind::InvalidFile);
                }
                let volume_header = VolumeHeader::parse(self.model.header(parent))
                    .map_err(|_| ErrorKind::InvalidVolume)?;
                let revision = volume_header.revision;
                let polarity = if volume_header.erase_polarity() {
                    ErasePolarity::One
                } else {
                    ErasePolarity::Zero
                };

                if header.len() != ffs::FFS_FILE_HEADER_SIZE {
                    return Err(ErrorKind::InvalidFile);
                }

                let mut object = header.to_vec();
                object.extend_from_slice(body);
                let file_header =
                    FfsFileHeader::parse(&object).map_err(|_| ErrorKind::InvalidFile)?;

                // Determine the correct header size; for large files the extended size field
                // comes out of the leading body bytes
                let large_file = revision > 1
                    && file_header.attributes().contains(FileAttributes::LARGE_FILE);
                let header_size = if large_file {
                    ffs::FFS_FILE_HEADER2_SIZE
                } else {
                    ffs::FFS_FILE_HEADER_SIZE
                };
                if object.len() < header_size {
                    return Err(ErrorKind::InvalidFile);
                }
                let mut new_header = object[..header_size].to_vec();
                let mut new_body = object[header_size..].to_vec();

                // A passed-in tail is dropped and regenerated for revision 1 volumes
                let tail_size = if revision == 1
                    && file_header.attributes().contains(FileAttributes::TAIL_PRESENT)
                {
                    2usize
                } else {
                    0
                };
                if tail_size != 0 {
                    if new_body.len() < tail_size {
                        return Err(ErrorKind::InvalidFile);
                    }
                    new_body.truncate(new_body.len() - tail_size);
                }

                // Correct the file size
                if large_file {
                    new_header[ffs::FFS_SIZE_OFFSET..ffs::FFS_SIZE_OFFSET + 3]
                        .copy_from_slice(&ffs::u32_to_uint24(ffs::SECTION2_IS_USED));
                    patch_u64(
                        &mut new_header,
                        ffs::FFS_EXTENDED_SIZE_OFFSET,
                        (header_size + new_body.len() + tail_size) as u64,
                    )
                    .map_err(|_| ErrorKind::InvalidFile)?;
                } else {
                    let full_size = header_size + new_body.len() + tail_size;
                    if full_size > 0xFF_FFFF {
                        return Err(ErrorKind::InvalidFile);
                    }
                    new_header[ffs::FFS_SIZE_OFFSET..ffs::FFS_SIZE_OFFSET + 3]
                        .copy_from_slice(&ffs::u32_to_uint24(full_size as u32));
                }

                // Set the file state
                let mut state = FileState::DATA_VALID
                    | FileState::HEADER_VALID
                    | FileState::HEADER_CONSTRUCTION;
                if polarity == ErasePolarity::One {
                    state = FileState::from_bits_retain(!state.bits());
                }
                new_header[ffs::FFS_STATE_OFFSET] = state.bits();

                // Recalculate both checksums
                new_header[ffs::FFS_INTEGRITY_OFFSET] = 0;
                new_header[ffs::FFS_INTEGRITY_OFFSET + 1] = 0;
                let header_checksum = 0u8.wrapping_sub(
                    checksum::sum8(&new_header)
                        .wrapping_sub(new_header[ffs::FFS_STATE_OFFSET]),
                );
                new_header[ffs::FFS_INTEGRITY_OFFSET] = header_checksum;
                let data_checksum =
                    if file_header.attributes().contains(FileAttributes::CHECKSUM) {
                        checksum::checksum8(&new_body)
                    } else if revision == 1 {
                        ffs::FFS_FIXED_CHECKSUM
                    } else {
                        ffs::FFS_FIXED_CHECKSUM2
                    };
                new_header[ffs::FFS_INTEGRITY_OFFSET + 1] = data_checksum;

                let mut created = new_header;
                created.extend_from_slice(&new_body);
                if tail_size != 0 {
                    created.push(!header_checksum);
                    created.push(!data_checksum);
                }

                let file_index = match self.parse_file(&created, revision, polarity, index, mode)
                {
                    Ok(file_index) => file_index,
                    Err(ErrorKind::ItemNotFound | ErrorKind::InvalidVolume) => {
                        return Err(ErrorKind::InvalidFile)
                    }
                    Err(error) => return Err(error),
                };
                self.model.set_action(file_index, action);

                // Everything that shifted behind the new file may need rebasing
                self.rebase_pei_files(file_index);
                Ok(file_index)
            }

            ItemType::Section => {
                if self.model.item_type(parent) != ItemType::File
                    && self.model.item_type(parent) != ItemType::Section
                {
                    return Err(ErrorKind::InvalidSection);
                }
                if header.len() < ffs::COMMON_SECTION_HEADER_SIZE {
                    return Err(ErrorKind::InvalidSection);
                }
                let mut new_header = header.to_vec();
                if ffs::uint24_to_u32(&new_header[..3]) == ffs::SECTION2_IS_USED {
                    self.msg(
                        Severity::Error,
                        "create: creation of large sections not supported yet".to_owned(),
                        Some(index),
                    );
                    return Err(ErrorKind::InvalidParameter);
                }

                let section_type = new_header[3];
                let created = match section_type {
                    ffs::SECTION_COMPRESSION => {
                        if new_header.len() < ffs::COMMON_SECTION_HEADER_SIZE + 5 {
                            return Err(ErrorKind::InvalidSection);
                        }
                        // Correct the uncompressed size and the on-wire compression type
                        patch_u32(
                            &mut new_header,
                            ffs::COMMON_SECTION_HEADER_SIZE,
                            body.len() as u32,
                        )
                        .map_err(|_| ErrorKind::InvalidSection)?;
                        new_header[ffs::COMMON_SECTION_HEADER_SIZE + 4] = match algorithm {
                            Compression::None => ffs::EFI_NOT_COMPRESSED,
                            Compression::Efi11 | Compression::Tiano => {
                                ffs::EFI_STANDARD_COMPRESSION
                            }
                            Compression::Lzma | Compression::Imlzma => {
                                ffs::EFI_CUSTOMIZED_COMPRESSION
                            }
                            Compression::Unknown => {
                                return Err(ErrorKind::UnknownCompressionAlgorithm)
                            }
                        };
                        let compressed =
                            self.compress(body, algorithm, DEFAULT_LZMA_DICTIONARY_SIZE)?;
                        self.finish_create_section(new_header, &compressed, index, mode, action)?
                    }
                    ffs::SECTION_GUID_DEFINED => {
                        let compressed =
                            self.compress(body, algorithm, DEFAULT_LZMA_DICTIONARY_SIZE)?;
                        self.finish_create_section(new_header, &compressed, index, mode, action)?
                    }
                    _ => self.finish_create_section(new_header, body, index, mode, action)?,
                };

                if let Some(file_index) =
                    self.model.find_parent_of_type(parent, ItemType::File)
                {
                    self.rebase_pei_files(file_index);
                }
                Ok(created)
            }

            _ => Err(ErrorKind::InvalidParameter),
        }
    }

    fn finish_create_section(
        &mut self, mut header: Vec<u8>, body: &[u8], index: NodeId, mode: InsertMode,
        action: Action,
    ) -> Result<NodeId> {
        let full_size = header.len() + body.len();
        if full_size > 0xFF_FFFF {
            return Err(ErrorKind::InvalidSection);
        }
        header[..3].copy_from_slice(&ffs::u32_to_uint24(full_size as u32));
        let mut created = header;
        created.extend_from_slice(body);

        let section_index = match self.parse_section(&created, index, mode) {
            Ok(section_index) => section_index,
            Err(ErrorKind::ItemNotFound | ErrorKind::InvalidVolume) => {
                return Err(ErrorKind::InvalidSection)
            }
            Err(error) => return Err(error),
        };
        self.model.set_action(section_index, action);
        Ok(section_index)
    }

    /// Inserts a headered object relative to `index`; the object kind follows from where it
    /// lands, and section headers are sized by inspecting the leading size field.
    pub fn insert(&mut self, index: NodeId, object: &[u8], mode: InsertMode) -> Result<NodeId> {
        if self.model.parent(index).is_none() {
            return Err(ErrorKind::InvalidParameter);
        }
        let parent = match mode {
            InsertMode::Before | InsertMode::After => {
                self.model.parent(index).ok_or(ErrorKind::InvalidParameter)?
            }
            _ => index,
        };

        let (item_type, header_size) = match self.model.item_type(parent) {
            ItemType::Volume => (ItemType::File, ffs::FFS_FILE_HEADER_SIZE),
            ItemType::File | ItemType::Section => {
                (ItemType::Section, ffs::section_header_size(object))
            }
            _ => return Err(ErrorKind::InvalidParameter),
        };
        if object.len() < header_size {
            return Err(ErrorKind::BufferTooSmall);
        }

        self.create(
            index,
            item_type,
            &object[..header_size],
            &object[header_size..],
            mode,
            Action::Insert,
            Compression::None,
        )
    }

    /// Replaces a node, either with a fully headered object or with a new body only.
    pub fn replace(&mut self, index: NodeId, object: &[u8], mode: ReplaceMode) -> Result<()> {
        let result = match self.model.item_type(index) {
            ItemType::Region => match mode {
                ReplaceMode::AsIs => self.create(
                    index,
                    ItemType::Region,
                    &[],
                    object,
                    InsertMode::After,
                    Action::Replace,
                    Compression::None,
                ),
                ReplaceMode::Body => return Err(ErrorKind::InvalidParameter),
            },
            ItemType::Padding => match mode {
                ReplaceMode::AsIs => self.create(
                    index,
                    ItemType::Padding,
                    &[],
                    object,
                    InsertMode::After,
                    Action::Replace,
                    Compression::None,
                ),
                ReplaceMode::Body => return Err(ErrorKind::InvalidParameter),
            },
            ItemType::Volume => {
                let header = match mode {
                    ReplaceMode::AsIs => Vec::new(),
                    ReplaceMode::Body => self.model.header(index).to_vec(),
                };
                self.create(
                    index,
                    ItemType::Volume,
                    &header,
                    object,
                    InsertMode::After,
                    Action::Replace,
                    Compression::None,
                )
            }
            ItemType::File => match mode {
                ReplaceMode::AsIs => {
                    if object.len() < ffs::FFS_FILE_HEADER_SIZE {
                        return Err(ErrorKind::BufferTooSmall);
                    }
                    self.create(
                        index,
                        ItemType::File,
                        &object[..ffs::FFS_FILE_HEADER_SIZE],
                        &object[ffs::FFS_FILE_HEADER_SIZE..],
                        InsertMode::After,
                        Action::Replace,
                        Compression::None,
                    )
                }
                ReplaceMode::Body => {
                    let header = self.model.header(index).to_vec();
                    self.create(
                        index,
                        ItemType::File,
                        &header[..ffs::FFS_FILE_HEADER_SIZE.min(header.len())],
                        object,
                        InsertMode::After,
                        Action::Replace,
                        Compression::None,
                    )
                }
            },
            ItemType::Section => match mode {
                ReplaceMode::AsIs => {
                    let header_size = ffs::section_header_size(object);
                    if object.len() < header_size {
                        return Err(ErrorKind::BufferTooSmall);
                    }
                    self.create(
                        index,
                        ItemType::Section,
                        &object[..header_size],
                        &object[header_size..],
                        InsertMode::After,
                        Action::Replace,
                        Compression::None,
                    )
                }
                ReplaceMode::Body => {
                    let header = self.model.header(index).to_vec();
                    let compression = self.model.compression(index);
                    self.create(
                        index,
                        ItemType::Section,
                        &header,
                        object,
                        InsertMode::After,
                        Action::Replace,
                        compression,
                    )
                }
            },
            _ => return Err(ErrorKind::InvalidParameter),
        };
        result?;

        // The replaced item itself goes away on reconstruction
        self.model.set_action(index, Action::Remove);
        Ok(())
    }

    /// Extracts a node's bytes, either verbatim or as its (decompressed) body.
    pub fn extract(&mut self, index: NodeId, mode: ExtractMode) -> Result<Vec<u8>> {
        match mode {
            ExtractMode::AsIs => {
                let mut extracted = self.model.header(index).to_vec();
                extracted.extend_from_slice(self.model.body(index));
                if self.model.item_type(index) == ItemType::File {
                    // Revision 1 tailed files carry their tail outside header and body
                    let mut revision = 2;
                    if let Some(parent) = self.model.parent(index) {
                        if self.model.item_type(parent) == ItemType::Volume {
                            if let Ok(volume_header) =
                                VolumeHeader::parse(self.model.header(parent))
                            {
                                revision = volume_header.revision;
                            }
                        }
                    }
                    let file_header = FfsFileHeader::parse(self.model.header(index))
                        .map_err(|_| ErrorKind::InvalidFile)?;
                    if revision == 1
                        && file_header.attributes().contains(FileAttributes::TAIL_PRESENT)
                    {
                        extracted.push(!file_header.header_checksum());
                        extracted.push(!file_header.data_checksum());
                    }
                }
                Ok(extracted)
            }
            ExtractMode::Body => {
                // Compressed section bodies are extracted in decompressed form
                if self.model.item_type(index) == ItemType::Section {
                    if self.model.subtype(index) == Subtype::Section(ffs::SECTION_COMPRESSION) {
                        let header = self.model.header(index);
                        let section_header = SectionHeader::parse(header)
                            .map_err(|_| ErrorKind::InvalidSection)?;
                        let common = if section_header.extended {
                            ffs::COMMON_SECTION_HEADER2_SIZE
                        } else {
                            ffs::COMMON_SECTION_HEADER_SIZE
                        };
                        let compression_type = *header
                            .get(common + 4)
                            .ok_or(ErrorKind::InvalidSection)?;
                        let body = self.model.body(index).to_vec();
                        let (decompressed, _) = self.decompress(&body, compression_type)?;
                        return Ok(decompressed);
                    }
                    if self.model.subtype(index) == Subtype::Section(ffs::SECTION_GUID_DEFINED) {
                        let guided = GuidDefinedSectionHeader::parse(self.model.header(index))
                            .map_err(|_| ErrorKind::InvalidSection)?;
                        if guided.attributes & ffs::GUIDED_SECTION_PROCESSING_REQUIRED != 0 {
                            let body = self.model.body(index).to_vec();
                            // Try both known compression framings
                            if let Ok((decompressed, _)) =
                                self.decompress(&body, ffs::EFI_STANDARD_COMPRESSION)
                            {
                                return Ok(decompressed);
                            }
                            let (decompressed, _) =
                                self.decompress(&body, ffs::EFI_CUSTOMIZED_COMPRESSION)?;
                            return Ok(decompressed);
                        }
                    }
                }
                Ok(self.model.body(index).to_vec())
            }
        }
    }

    /// Marks a node for removal; its bytes vanish on the next reconstruction.
    pub fn remove(&mut self, index: NodeId) -> Result<()> {
        if self.model.parent(index).is_none() {
            return Err(ErrorKind::InvalidParameter);
        }
        self.model.set_action(index, Action::Remove);
        self.mark_rebase_after_change(index);
        Ok(())
    }

    /// Marks a node for a full rebuild on the next reconstruction.
    pub fn rebuild(&mut self, index: NodeId) -> Result<()> {
        if self.model.parent(index).is_none() {
            return Err(ErrorKind::InvalidParameter);
        }
        self.model.set_action(index, Action::Rebuild);
        self.mark_rebase_after_change(index);
        Ok(())
    }

    /// Marks a node to be emitted verbatim even inside rebuilt parents.
    pub fn do_not_rebuild(&mut self, index: NodeId) -> Result<()> {
        if self.model.parent(index).is_none() {
            return Err(ErrorKind::InvalidParameter);
        }
        self.model.set_action(index, Action::DoNotRebuild);
        Ok(())
    }

    fn mark_rebase_after_change(&mut self, index: NodeId) {
        let file_index = match self.model.item_type(index) {
            ItemType::Volume => self.model.child(index, 0),
            ItemType::File => Some(index),
            ItemType::Section => self.model.find_parent_of_type(index, ItemType::File),
            _ => None,
        };
        if let Some(file_index) = file_index {
            self.rebase_pei_files(file_index);
        }
    }
}
