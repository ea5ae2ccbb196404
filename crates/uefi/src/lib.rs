//! This crate contains the [Vulcan](https://crates.io/crates/vulcan) engine for UEFI firmware
//! images: parsing a flat flash dump into a typed tree, editing that tree, and reassembling it
//! back into a byte-identical (or deliberately modified) image.
//!
//! The entry point is [`FfsEngine`](engine::FfsEngine): feed it an image with
//! [`parse_image_file`](engine::FfsEngine::parse_image_file), inspect or edit the
//! [`TreeModel`](treemodel::TreeModel) it builds, then serialize with
//! [`reconstruct_image_file`](engine::FfsEngine::reconstruct_image_file).

#![deny(unused_crate_dependencies)]

pub mod bootguard;
pub mod descriptor;
pub mod engine;
pub mod errors;
pub mod ffs;
pub mod gbe;
pub mod me;
pub mod messages;
pub mod peimage;
pub mod treemodel;
pub mod types;

// Prelude, for convenience
pub mod prelude;
