//! Convenient re-exports of commonly used data types, designed to make crate usage painless.
//!
//! The contents of this module can be used by including the following in any module:
//! ```
//! use vulcan_uefi::prelude::*;
//! ```

#[doc(inline)]
pub use crate::engine::FfsEngine;
#[doc(inline)]
pub use crate::errors::ErrorKind;
#[doc(inline)]
pub use crate::messages::{Message, Severity};
#[doc(inline)]
pub use crate::treemodel::{NodeId, TreeModel};
#[doc(inline)]
pub use crate::types::{
    Action, CapsuleSubtype, Compression, ErasePolarity, ExtractMode, ImageSubtype, InsertMode,
    ItemType, PaddingSubtype, RegionSubtype, ReplaceMode, SearchScope, Subtype, VolumeSubtype,
};
