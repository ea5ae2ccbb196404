//! Adds support for the LZMA framing used by GUID-defined and compressed sections.
//!
//! # Header
//! An LZMA stream starts with a 13-byte header, in little-endian format:
//!
//! | Offset | Field | Type | Notes |
//! |--------|-------|------|-------|
//! | 0x0 | Properties        | u8      | Encodes the lc/lp/pb parameters. |
//! | 0x1 | Dictionary size   | u32     | Window size the decoder must allocate. |
//! | 0x5 | Decompressed size | u64     | The size of the decompressed data. |
//!
//! Firmware build tools vary the dictionary size per section, and images only reparse
//! identically if the recorded value survives a recompression, so [`compress_from`] takes the
//! dictionary size captured at parse time and writes it back into the emitted header.

use std::io::Cursor;

use lzma_rs::compress::{Options, UnpackedSize};
use snafu::prelude::*;
use vulcan_core::prelude::*;

use crate::MAX_DECOMPRESSED_SIZE;

/// Error conditions for when reading/writing LZMA streams.
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum Error {
    /// Thrown if reading tries to go out of bounds.
    #[snafu(display("Unexpected End-Of-File!"))]
    EndOfFile,
    /// Thrown if the header declares an unknown decompressed size.
    #[snafu(display("Invalid LZMA Header!"))]
    InvalidHeader,
    /// Thrown if the declared decompressed size is over the allocation cap.
    #[snafu(display("Declared size is too large!"))]
    FileTooBig,
    /// Thrown if the stream does not decode.
    #[snafu(display("LZMA decompression failed!"))]
    DecompressionFailed,
    /// Thrown if the encoder fails to produce a stream.
    #[snafu(display("LZMA compression failed!"))]
    CompressionFailed,
}
type Result<T> = core::result::Result<T, Error>;

impl From<vulcan_core::prelude::data::Error> for Error {
    #[inline]
    fn from(_: vulcan_core::prelude::data::Error) -> Self {
        Self::EndOfFile
    }
}

/// Size of the properties + dictionary size + decompressed size header.
pub const HEADER_SIZE: usize = 13;

/// See the module [header](self#header) for more information.
pub struct Header {
    pub properties: u8,
    pub dictionary_size: u32,
    pub decompressed_size: u64,
}

/// Returns the metadata from an LZMA stream header.
///
/// # Errors
/// Returns [`EndOfFile`](Error::EndOfFile) if the buffer is smaller than the header, or
/// [`InvalidHeader`](Error::InvalidHeader) if the decompressed size is the unknown marker.
#[inline]
pub fn read_header(data: &[u8]) -> Result<Header> {
    let mut cursor = DataCursorRef::new(data);
    let properties = cursor.read_u8()?;
    let dictionary_size = cursor.read_u32()?;
    let decompressed_size = cursor.read_u64()?;
    ensure!(decompressed_size != u64::MAX, InvalidHeaderSnafu);
    Ok(Header { properties, dictionary_size, decompressed_size })
}

/// Returns the dictionary size recorded in an LZMA stream, for preservation across a rebuild.
///
/// # Errors
/// Returns [`EndOfFile`](Error::EndOfFile) if the buffer is smaller than the header.
#[inline]
pub fn dictionary_size(data: &[u8]) -> Result<u32> {
    read_header(data).map(|header| header.dictionary_size)
}

/// Decompresses an LZMA stream and returns the decompressed data.
///
/// # Errors
/// Returns [`FileTooBig`](Error::FileTooBig) if the declared size is over the allocation cap,
/// or [`DecompressionFailed`](Error::DecompressionFailed) if the stream does not decode.
pub fn decompress_from(data: &[u8]) -> Result<Box<[u8]>> {
    let header = read_header(data)?;
    ensure!(header.decompressed_size <= MAX_DECOMPRESSED_SIZE as u64, FileTooBigSnafu);

    let mut output = Vec::with_capacity(header.decompressed_size as usize);
    let mut input = Cursor::new(data);
    lzma_rs::lzma_decompress(&mut input, &mut output)
        .map_err(|_| Error::DecompressionFailed)?;
    ensure!(output.len() as u64 == header.decompressed_size, DecompressionFailedSnafu);
    Ok(output.into_boxed_slice())
}

/// Compresses the input data, writing `dictionary_size` into the emitted header.
///
/// # Errors
/// Returns [`CompressionFailed`](Error::CompressionFailed) if the encoder fails.
pub fn compress_from(input: &[u8], dictionary_size: u32) -> Result<Box<[u8]>> {
    let mut output = Vec::new();
    let mut reader = Cursor::new(input);
    let mut options = Options::default();
    options.unpacked_size = UnpackedSize::WriteToHeader(Some(input.len() as u64));
    lzma_rs::lzma_compress_with_options(&mut reader, &mut output, &options)
        .map_err(|_| Error::CompressionFailed)?;
    ensure!(output.len() >= HEADER_SIZE, CompressionFailedSnafu);

    // Carry the recorded dictionary size so the stream reparses identically
    output[1..5].copy_from_slice(&dictionary_size.to_le_bytes());
    Ok(output.into_boxed_slice())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let payload: Vec<u8> =
            b"PEI core PEI core PEI core".iter().cycle().take(2048).copied().collect();
        let compressed = compress_from(&payload, 0x0100_0000).unwrap();
        let header = read_header(&compressed).unwrap();
        assert_eq!(header.dictionary_size, 0x0100_0000);
        assert_eq!(header.decompressed_size, payload.len() as u64);

        let output = decompress_from(&compressed).unwrap();
        assert_eq!(&*output, &payload[..]);
    }

    #[test]
    fn rejects_unknown_size() {
        let mut data = [0xFFu8; 16];
        data[0] = 0x5D;
        assert!(matches!(read_header(&data), Err(Error::InvalidHeader)));
    }

    #[test]
    fn rejects_oversize() {
        let mut data = [0u8; 16];
        data[0] = 0x5D;
        data[5..13].copy_from_slice(&(u64::MAX - 1).to_le_bytes());
        assert!(matches!(decompress_from(&data), Err(Error::FileTooBig)));
    }
}
