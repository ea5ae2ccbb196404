//! The error taxonomy exposed by every public engine operation.

use snafu::prelude::*;

/// Everything that can go wrong while parsing, editing or reconstructing an image.
///
/// Parsing is forgiving: inner failures become [`messages`](crate::messages) and the parse
/// still succeeds if a capsule/region/volume layout could be identified. Reconstruction is
/// transactional and aborts with one of these on the first non-recoverable problem.
#[derive(Debug, Snafu, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum ErrorKind {
    #[snafu(display("Function called with invalid parameter"))]
    InvalidParameter,
    #[snafu(display("Buffer too small"))]
    BufferTooSmall,
    #[snafu(display("Out of resources"))]
    OutOfResources,
    #[snafu(display("Item not found"))]
    ItemNotFound,
    #[snafu(display("Invalid flash descriptor"))]
    InvalidFlashDescriptor,
    #[snafu(display("Invalid region"))]
    InvalidRegion,
    #[snafu(display("Empty region"))]
    EmptyRegion,
    #[snafu(display("BIOS region not found"))]
    BiosRegionNotFound,
    #[snafu(display("Invalid UEFI volume"))]
    InvalidVolume,
    #[snafu(display("Volume revision not supported"))]
    VolumeRevisionNotSupported,
    #[snafu(display("Volume grow failed"))]
    VolumeGrowFailed,
    #[snafu(display("Invalid file"))]
    InvalidFile,
    #[snafu(display("Invalid section"))]
    InvalidSection,
    #[snafu(display("Unknown section"))]
    UnknownSection,
    #[snafu(display("Standard compression failed"))]
    StandardCompressionFailed,
    #[snafu(display("Standard decompression failed"))]
    StandardDecompressionFailed,
    #[snafu(display("Customized compression failed"))]
    CustomizedCompressionFailed,
    #[snafu(display("Customized decompression failed"))]
    CustomizedDecompressionFailed,
    #[snafu(display("Unknown compression method"))]
    UnknownCompressionAlgorithm,
    #[snafu(display("Unknown executable image type"))]
    UnknownImageType,
    #[snafu(display("Unknown PE optional header type"))]
    UnknownPeOptionalHeaderType,
    #[snafu(display("Unknown relocation type"))]
    UnknownRelocationType,
    #[snafu(display("Block map structure too complex for correct analysis"))]
    ComplexBlockMap,
    #[snafu(display("PEI core entry point not found"))]
    PeiCoreEntryPointNotFound,
    #[snafu(display("Image is truncated"))]
    TruncatedImage,
    #[snafu(display("Bad image relocation entry"))]
    BadRelocationEntry,
    #[snafu(display("Dependency expression parsing failed"))]
    DepexParseFailed,
    #[snafu(display("Nothing to patch"))]
    NothingToPatch,
    #[snafu(display("Unknown patch type"))]
    UnknownPatchType,
    #[snafu(display("Patch offset out of bounds"))]
    PatchOffsetOutOfBounds,
    #[snafu(display("Invalid symbol"))]
    InvalidSymbol,
    #[snafu(display("Directory already exists"))]
    DirAlreadyExists,
    #[snafu(display("Directory can't be created"))]
    DirCreate,
    #[snafu(display("File can't be written"))]
    FileWrite,
}

pub type Result<T> = core::result::Result<T, ErrorKind>;
