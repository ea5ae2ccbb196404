//! Convenient re-exports of commonly used data types, designed to make crate usage painless.
//!
//! The contents of this module can be used by including the following in any module:
//! ```
//! use vulcan_core::prelude::*;
//! ```

#[doc(inline)]
pub use crate::data::{patch_u16, patch_u32, patch_u64, DataCursor, DataCursorRef};
#[doc(inline)]
pub use crate::guid::Guid;

/// Contains [`data::Error`](crate::data::Error), which is used in Results returned by cursors.
pub mod data {
    pub use crate::data::Error;
}

pub mod checksum {
    pub use crate::checksum::*;
}

pub mod util {
    pub use crate::util::*;
}
