//! Recursive extraction of the tree to a directory hierarchy.
//!
//! Every visited node becomes a directory with `header.bin`, `body.bin` and `info.txt` inside;
//! an optional GUID filter restricts extraction to matching files and their subtrees.

use std::path::Path;

use vulcan_core::prelude::*;

use crate::engine::FfsEngine;
use crate::errors::{ErrorKind, Result};
use crate::ffs;
use crate::treemodel::NodeId;
use crate::types::{
    CapsuleSubtype, ImageSubtype, ItemType, PaddingSubtype, Subtype, VolumeSubtype,
};

fn subtype_name(subtype: Subtype) -> String {
    match subtype {
        Subtype::None => String::new(),
        Subtype::Image(ImageSubtype::Intel) => "Intel".to_owned(),
        Subtype::Image(ImageSubtype::Uefi) => "UEFI".to_owned(),
        Subtype::Capsule(CapsuleSubtype::AptioSigned) => "Aptio signed".to_owned(),
        Subtype::Capsule(CapsuleSubtype::AptioUnsigned) => "Aptio unsigned".to_owned(),
        Subtype::Capsule(CapsuleSubtype::Uefi) => "UEFI 2.0".to_owned(),
        Subtype::Capsule(CapsuleSubtype::Toshiba) => "Toshiba".to_owned(),
        Subtype::Volume(VolumeSubtype::Unknown) => "Unknown".to_owned(),
        Subtype::Volume(VolumeSubtype::Ffs2) => "FFSv2".to_owned(),
        Subtype::Volume(VolumeSubtype::Ffs3) => "FFSv3".to_owned(),
        Subtype::Region(region) => region.to_string(),
        Subtype::Padding(PaddingSubtype::Zero) => "Empty (0x00)".to_owned(),
        Subtype::Padding(PaddingSubtype::One) => "Empty (0xFF)".to_owned(),
        Subtype::Padding(PaddingSubtype::Data) => "Non-UEFI data".to_owned(),
        Subtype::File(file_type) => ffs::file_type_name(file_type).to_owned(),
        Subtype::Section(section_type) => ffs::section_type_name(section_type).to_owned(),
    }
}

impl FfsEngine {
    /// Recursively dumps the subtree at `index` into `path`.
    ///
    /// With a `guid` filter only subtrees whose enclosing file carries that GUID are written;
    /// [`ErrorKind::ItemNotFound`] reports a filter that matched nothing.
    pub fn dump(&mut self, index: NodeId, path: &Path, guid: Option<&str>) -> Result<()> {
        let mut dumped = false;
        self.recursive_dump(index, path, guid, &mut dumped)?;
        if !dumped {
            return Err(ErrorKind::ItemNotFound);
        }
        Ok(())
    }

    fn recursive_dump(
        &mut self, index: NodeId, path: &Path, guid: Option<&str>, dumped: &mut bool,
    ) -> Result<()> {
        let matches = match guid {
            None => true,
            Some(filter) => {
                let own = Guid::from_slice(self.model.header(index))
                    .map(|value| value.to_string().eq_ignore_ascii_case(filter))
                    .unwrap_or(false);
                let parent_file = self
                    .model
                    .find_parent_of_type(index, ItemType::File)
                    .and_then(|file| Guid::from_slice(self.model.header(file)))
                    .map(|value| value.to_string().eq_ignore_ascii_case(filter))
                    .unwrap_or(false);
                own || parent_file
            }
        };

        if matches {
            if path.exists() {
                return Err(ErrorKind::DirAlreadyExists);
            }
            std::fs::create_dir_all(path).map_err(|_| ErrorKind::DirCreate)?;

            if !self.model.has_empty_header(index) {
                std::fs::write(path.join("header.bin"), self.model.header(index))
                    .map_err(|_| ErrorKind::FileWrite)?;
            }
            if !self.model.has_empty_body(index) {
                std::fs::write(path.join("body.bin"), self.model.body(index))
                    .map_err(|_| ErrorKind::FileWrite)?;
            }

            let text = self.model.text(index);
            let info = format!(
                "Type: {}\nSubtype: {}\n{}{}",
                self.model.item_type(index),
                subtype_name(self.model.subtype(index)),
                if text.is_empty() { String::new() } else { format!("Text: {text}\n") },
                self.model.info(index)
            );
            std::fs::write(path.join("info.txt"), info).map_err(|_| ErrorKind::FileWrite)?;
            *dumped = true;
        }

        let children: Vec<NodeId> = self.model.children(index).to_vec();
        for (row, child) in children.into_iter().enumerate() {
            let label = if self.model.text(child).is_empty() {
                self.model.name(child).to_owned()
            } else {
                self.model.text(child).to_owned()
            };
            let child_path = path.join(format!("{row} {label}"));
            self.recursive_dump(child, &child_path, guid, dumped)?;
        }
        Ok(())
    }
}
