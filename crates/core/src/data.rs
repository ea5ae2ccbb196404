//! Little-endian data manipulation for byte slice operations.
//!
//! This module contains two cursor types that wrap a byte slice and provide a
//! convenient interface for reading and writing primitive data types from it:
//! * [`DataCursor`] is the owned variant, where it owns the byte slice directly, for use as an
//!   in-memory file.
//! * [`DataCursorRef`] is the borrowed immutable variant, that wraps a reference to a byte slice
//!   and provides reading.
//!
//! All multi-byte reads and writes are little-endian, as everything in a UEFI
//! image is. The free functions [`patch_u16`], [`patch_u32`] and [`patch_u64`]
//! rewrite fields in an already-serialized buffer without a cursor.

use core::ops::Deref;

use snafu::prelude::*;

#[cfg(not(feature = "std"))]
use crate::no_std::*;

/// Error conditions for when reading/writing data.
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum Error {
    /// Thrown if reading/writing tries to go out of bounds.
    #[snafu(display("Unexpected End-Of-File!"))]
    EndOfFile,
    /// Thrown if trying to resize a cursor to larger than the current size.
    #[snafu(display("Invalid End Size!"))]
    InvalidSize,
}
type Result<T> = core::result::Result<T, Error>;

macro_rules! cursor_read {
    ($self:ident, $t:ty) => {{
        const LENGTH: usize = core::mem::size_of::<$t>();
        ensure!($self.data.len() >= $self.pos + LENGTH, EndOfFileSnafu);

        let mut bytes = [0u8; LENGTH];
        bytes.copy_from_slice(&$self.data[$self.pos..$self.pos + LENGTH]);
        $self.pos += LENGTH;
        Ok(<$t>::from_le_bytes(bytes))
    }};
}

/// An owned, in-memory file that allows little-endian read and write.
///
/// This is architected to assume a fixed length, which should work for the majority of use cases,
/// as users should be minimizing allocations at all costs.
#[derive(Debug, Default)]
pub struct DataCursor {
    data: Box<[u8]>,
    pos: usize,
}

impl DataCursor {
    /// Creates a new cursor using the provided data.
    #[inline]
    pub fn new<I: Into<Box<[u8]>>>(data: I) -> Self {
        Self { data: data.into(), pos: 0 }
    }

    /// Consumes this cursor, returning the underlying data.
    #[inline]
    #[must_use]
    pub fn into_inner(self) -> Box<[u8]> {
        self.data
    }

    /// Returns the current position of this cursor.
    #[inline]
    #[must_use]
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Sets the position of this cursor.
    #[inline]
    pub fn set_position(&mut self, pos: usize) {
        self.pos = pos;
    }

    /// Returns the length of the currently stored data.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns `true` if the remaining slice is empty.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pos >= self.data.len()
    }

    /// Returns the remaining data from the current position.
    #[inline]
    #[must_use]
    pub fn remaining_slice(&self) -> &[u8] {
        &self.data[self.pos..]
    }

    /// Returns a slice from the current position to some additional length.
    ///
    /// # Errors
    /// Returns [`EndOfFile`](Error::EndOfFile) if trying to read out of bounds.
    #[inline]
    pub fn get_slice(&mut self, length: usize) -> Result<&[u8]> {
        ensure!(self.data.len() >= self.pos + length, EndOfFileSnafu);
        let slice = &self.data[self.pos..self.pos + length];
        self.pos += length;
        Ok(slice)
    }

    /// Reads one byte and returns it as a `u8`.
    ///
    /// # Errors
    /// Returns [`EndOfFile`](Error::EndOfFile) if trying to read out of bounds.
    #[inline]
    pub fn read_u8(&mut self) -> Result<u8> {
        ensure!(self.data.len() > self.pos, EndOfFileSnafu);
        let value = self.data[self.pos];
        self.pos += 1;
        Ok(value)
    }

    /// Reads two bytes and returns them as a `u16`.
    ///
    /// # Errors
    /// Returns [`EndOfFile`](Error::EndOfFile) if trying to read out of bounds.
    #[inline]
    pub fn read_u16(&mut self) -> Result<u16> {
        cursor_read!(self, u16)
    }

    /// Reads four bytes and returns them as a `u32`.
    ///
    /// # Errors
    /// Returns [`EndOfFile`](Error::EndOfFile) if trying to read out of bounds.
    #[inline]
    pub fn read_u32(&mut self) -> Result<u32> {
        cursor_read!(self, u32)
    }

    /// Reads eight bytes and returns them as a `u64`.
    ///
    /// # Errors
    /// Returns [`EndOfFile`](Error::EndOfFile) if trying to read out of bounds.
    #[inline]
    pub fn read_u64(&mut self) -> Result<u64> {
        cursor_read!(self, u64)
    }

    /// Writes one byte from a `u8`.
    ///
    /// # Errors
    /// Returns [`EndOfFile`](Error::EndOfFile) if trying to write out of bounds.
    #[inline]
    pub fn write_u8(&mut self, value: u8) -> Result<()> {
        ensure!(self.data.len() > self.pos, EndOfFileSnafu);
        self.data[self.pos] = value;
        self.pos += 1;
        Ok(())
    }

    /// Writes two bytes from a `u16`.
    ///
    /// # Errors
    /// Returns [`EndOfFile`](Error::EndOfFile) if trying to write out of bounds.
    #[inline]
    pub fn write_u16(&mut self, value: u16) -> Result<()> {
        self.write_all(&value.to_le_bytes())
    }

    /// Writes four bytes from a `u32`.
    ///
    /// # Errors
    /// Returns [`EndOfFile`](Error::EndOfFile) if trying to write out of bounds.
    #[inline]
    pub fn write_u32(&mut self, value: u32) -> Result<()> {
        self.write_all(&value.to_le_bytes())
    }

    /// Writes eight bytes from a `u64`.
    ///
    /// # Errors
    /// Returns [`EndOfFile`](Error::EndOfFile) if trying to write out of bounds.
    #[inline]
    pub fn write_u64(&mut self, value: u64) -> Result<()> {
        self.write_all(&value.to_le_bytes())
    }

    /// Writes an entire buffer at the current position.
    ///
    /// # Errors
    /// Returns [`EndOfFile`](Error::EndOfFile) if trying to write out of bounds.
    #[inline]
    pub fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        ensure!(self.data.len() >= self.pos + buf.len(), EndOfFileSnafu);
        self.data[self.pos..self.pos + buf.len()].copy_from_slice(buf);
        self.pos += buf.len();
        Ok(())
    }
}

impl From<Vec<u8>> for DataCursor {
    #[inline]
    fn from(value: Vec<u8>) -> Self {
        Self { data: value.into_boxed_slice(), pos: 0 }
    }
}

impl Deref for DataCursor {
    type Target = [u8];

    #[inline]
    fn deref(&self) -> &Self::Target {
        &self.data
    }
}

/// An immutably borrowed, in-memory file that allows little-endian read.
#[derive(Debug, Default)]
pub struct DataCursorRef<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> DataCursorRef<'a> {
    /// Creates a new cursor using the provided data.
    #[inline]
    #[must_use]
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    /// Consumes this cursor, returning the underlying data.
    #[inline]
    #[must_use]
    pub fn into_inner(self) -> &'a [u8] {
        self.data
    }

    /// Returns the current position of this cursor.
    #[inline]
    #[must_use]
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Sets the position of this cursor.
    #[inline]
    pub fn set_position(&mut self, pos: usize) {
        self.pos = pos;
    }

    /// Returns the length of the currently stored data.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns `true` if the remaining slice is empty.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pos >= self.data.len()
    }

    /// Returns the remaining data from the current position.
    #[inline]
    #[must_use]
    pub fn remaining_slice(&self) -> &[u8] {
        &self.data[self.pos..]
    }

    /// Returns a slice from the current position to some additional length.
    ///
    /// # Errors
    /// Returns [`EndOfFile`](Error::EndOfFile) if trying to read out of bounds.
    #[inline]
    pub fn get_slice(&mut self, length: usize) -> Result<&'a [u8]> {
        ensure!(self.data.len() >= self.pos + length, EndOfFileSnafu);
        let slice = &self.data[self.pos..self.pos + length];
        self.pos += length;
        Ok(slice)
    }

    /// Reads one byte and returns it as a `u8`.
    ///
    /// # Errors
    /// Returns [`EndOfFile`](Error::EndOfFile) if trying to read out of bounds.
    #[inline]
    pub fn read_u8(&mut self) -> Result<u8> {
        ensure!(self.data.len() > self.pos, EndOfFileSnafu);
        let value = self.data[self.pos];
        self.pos += 1;
        Ok(value)
    }

    /// Reads two bytes and returns them as a `u16`.
    ///
    /// # Errors
    /// Returns [`EndOfFile`](Error::EndOfFile) if trying to read out of bounds.
    #[inline]
    pub fn read_u16(&mut self) -> Result<u16> {
        cursor_read!(self, u16)
    }

    /// Reads four bytes and returns them as a `u32`.
    ///
    /// # Errors
    /// Returns [`EndOfFile`](Error::EndOfFile) if trying to read out of bounds.
    #[inline]
    pub fn read_u32(&mut self) -> Result<u32> {
        cursor_read!(self, u32)
    }

    /// Reads eight bytes and returns them as a `u64`.
    ///
    /// # Errors
    /// Returns [`EndOfFile`](Error::EndOfFile) if trying to read out of bounds.
    #[inline]
    pub fn read_u64(&mut self) -> Result<u64> {
        cursor_read!(self, u64)
    }
}

impl Deref for DataCursorRef<'_> {
    type Target = [u8];

    #[inline]
    fn deref(&self) -> &Self::Target {
        self.data
    }
}

/// Rewrites a little-endian `u16` field inside an already-serialized buffer.
///
/// # Errors
/// Returns [`EndOfFile`](Error::EndOfFile) if the field overlaps the end of the buffer.
#[inline]
pub fn patch_u16(data: &mut [u8], offset: usize, value: u16) -> Result<()> {
    ensure!(data.len() >= offset + 2, EndOfFileSnafu);
    data[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
    Ok(())
}

/// Rewrites a little-endian `u32` field inside an already-serialized buffer.
///
/// # Errors
/// Returns [`EndOfFile`](Error::EndOfFile) if the field overlaps the end of the buffer.
#[inline]
pub fn patch_u32(data: &mut [u8], offset: usize, value: u32) -> Result<()> {
    ensure!(data.len() >= offset + 4, EndOfFileSnafu);
    data[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
    Ok(())
}

/// Rewrites a little-endian `u64` field inside an already-serialized buffer.
///
/// # Errors
/// Returns [`EndOfFile`](Error::EndOfFile) if the field overlaps the end of the buffer.
#[inline]
pub fn patch_u64(data: &mut [u8], offset: usize, value: u64) -> Result<()> {
    ensure!(data.len() >= offset + 8, EndOfFileSnafu);
    data[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_primitives() {
        let mut cursor = DataCursorRef::new(&[0x5A, 0xA5, 0x0F, 0x78, 0x56, 0x34, 0x12]);
        assert_eq!(cursor.read_u8().unwrap(), 0x5A);
        assert_eq!(cursor.read_u16().unwrap(), 0x0FA5);
        assert_eq!(cursor.read_u32().unwrap(), 0x12345678);
        assert!(cursor.read_u8().is_err());
    }

    #[test]
    fn write_and_patch() {
        let mut cursor = DataCursor::new(vec![0u8; 8]);
        cursor.write_u32(0xAABBCCDD).unwrap();
        cursor.write_u16(0x1234).unwrap();
        assert_eq!(&cursor[..6], &[0xDD, 0xCC, 0xBB, 0xAA, 0x34, 0x12]);

        let mut data = cursor.into_inner();
        patch_u16(&mut data, 6, 0xBEEF).unwrap();
        assert_eq!(&data[6..], &[0xEF, 0xBE]);
        assert!(patch_u32(&mut data, 6, 0).is_err());
    }
}
