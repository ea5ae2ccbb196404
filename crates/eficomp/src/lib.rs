//! This crate contains modules for [Vulcan](https://crates.io/crates/vulcan) that add support for
//! the compression formats found inside UEFI firmware images.

#![deny(unused_crate_dependencies)]

// All public modules
pub mod lzma;
pub mod tiano;
pub mod x86;

// Prelude, for convenience
pub mod prelude;

/// Upper bound on the declared size of a single decompressed section.
///
/// Anything bigger than this is rejected as corrupt before allocation.
pub const MAX_DECOMPRESSED_SIZE: usize = 0x2000_0000; // 512 MiB
