//! The type tags shared between the tree model, the parser and the reconstructor.

use core::fmt;

/// What a tree node represents.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ItemType {
    Root,
    Capsule,
    Image,
    Region,
    Padding,
    Volume,
    File,
    Section,
    FreeSpace,
}

impl fmt::Display for ItemType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Root => "Root",
            Self::Capsule => "Capsule",
            Self::Image => "Image",
            Self::Region => "Region",
            Self::Padding => "Padding",
            Self::Volume => "Volume",
            Self::File => "File",
            Self::Section => "Section",
            Self::FreeSpace => "Free space",
        };
        f.write_str(name)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ImageSubtype {
    Intel,
    Uefi,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CapsuleSubtype {
    AptioSigned,
    AptioUnsigned,
    Uefi,
    Toshiba,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VolumeSubtype {
    Unknown,
    Ffs2,
    Ffs3,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum RegionSubtype {
    Descriptor,
    Gbe,
    Me,
    Bios,
    Pdr,
    Ec,
}

impl fmt::Display for RegionSubtype {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Descriptor => "Descriptor",
            Self::Gbe => "GbE",
            Self::Me => "ME",
            Self::Bios => "BIOS",
            Self::Pdr => "PDR",
            Self::Ec => "EC",
        };
        f.write_str(name)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PaddingSubtype {
    Zero,
    One,
    Data,
}

/// The type-dependent tag carried next to [`ItemType`].
///
/// File and Section nodes carry the raw type byte from their headers, everything else uses a
/// named variant.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Subtype {
    None,
    Image(ImageSubtype),
    Capsule(CapsuleSubtype),
    Volume(VolumeSubtype),
    Region(RegionSubtype),
    Padding(PaddingSubtype),
    File(u8),
    Section(u8),
}

impl Subtype {
    /// The raw FFS file type byte, if this tags a File node.
    #[must_use]
    pub fn file_type(&self) -> Option<u8> {
        match self {
            Self::File(file_type) => Some(*file_type),
            _ => None,
        }
    }

    /// The raw section type byte, if this tags a Section node.
    #[must_use]
    pub fn section_type(&self) -> Option<u8> {
        match self {
            Self::Section(section_type) => Some(*section_type),
            _ => None,
        }
    }
}

/// Editor intent attached to a node, consumed during reconstruction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Action {
    NoAction,
    Create,
    Insert,
    Replace,
    Remove,
    Rebuild,
    Rebase,
    DoNotRebuild,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::NoAction => "",
            Self::Create => "Create",
            Self::Insert => "Insert",
            Self::Replace => "Replace",
            Self::Remove => "Remove",
            Self::Rebuild => "Rebuild",
            Self::Rebase => "Rebase",
            Self::DoNotRebuild => "Do not rebuild",
        };
        f.write_str(name)
    }
}

/// Which algorithm a section body is compressed with, as recorded at parse time.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Compression {
    Unknown,
    #[default]
    None,
    Efi11,
    Tiano,
    Lzma,
    /// LZMA with a stray section header between the compression header and the stream.
    Imlzma,
}

impl fmt::Display for Compression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Unknown => "Unknown",
            Self::None => "None",
            Self::Efi11 => "EFI 1.1",
            Self::Tiano => "Tiano",
            Self::Lzma => "LZMA",
            Self::Imlzma => "Intel modified LZMA",
        };
        f.write_str(name)
    }
}

/// Where a new node lands relative to the target node.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InsertMode {
    Append,
    Prepend,
    Before,
    After,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExtractMode {
    AsIs,
    Body,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReplaceMode {
    AsIs,
    Body,
}

/// Which byte ranges a search visits per node.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SearchScope {
    Header,
    Body,
    All,
}

/// Per-volume convention for the value of erased flash bytes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErasePolarity {
    Zero,
    One,
    Unknown,
}

impl ErasePolarity {
    /// The byte that fills free space under this polarity.
    #[must_use]
    pub fn empty_byte(&self) -> u8 {
        match self {
            Self::One => 0xFF,
            _ => 0x00,
        }
    }
}
