//! Convenient re-exports of commonly used data types, designed to make crate usage painless.
//!
//! The contents of this module can be used by including the following in any module:
//! ```
//! use vulcan_eficomp::prelude::*;
//! ```

pub use crate::MAX_DECOMPRESSED_SIZE;
#[doc(inline)]
pub use crate::tiano::{self, Strategy, Variant};
#[doc(inline)]
pub use crate::{lzma, x86};
