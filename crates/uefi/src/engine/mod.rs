//! The engine tying the tree model, the format descriptors and the codecs together.
//!
//! One [`FfsEngine`] owns one tree. Parsing fills it from a byte buffer, the edit operations
//! mark intent on nodes, and reconstruction serializes the tree back out honoring those marks.
//! Everything advisory lands in the message queue instead of failing the operation.

mod dump;
mod ops;
mod parser;
mod patch;
mod rebase;
mod reconstruct;
mod search;

pub use patch::{PatchData, PatchType};

use vulcan_eficomp::prelude::*;

use crate::errors::{ErrorKind, Result};
use crate::ffs;
use crate::messages::{Message, Severity};
use crate::treemodel::{NodeId, TreeModel};
use crate::types::Compression;

/// Parser, reconstructor and editor for UEFI firmware images.
pub struct FfsEngine {
    model: TreeModel,
    messages: Vec<Message>,
    /// PEI core entry point captured at parse time, consumed by the VTF patcher.
    old_pei_core_entry_point: u32,
    cancel: Option<Box<dyn Fn() -> bool + Send>>,
}

impl Default for FfsEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl FfsEngine {
    #[must_use]
    pub fn new() -> Self {
        Self {
            model: TreeModel::new(),
            messages: Vec::new(),
            old_pei_core_entry_point: 0,
            cancel: None,
        }
    }

    /// The tree built by the last parse.
    #[must_use]
    pub fn tree_model(&self) -> &TreeModel {
        &self.model
    }

    /// Mutable access for hosts that edit node metadata directly.
    pub fn tree_model_mut(&mut self) -> &mut TreeModel {
        &mut self.model
    }

    /// Messages queued since the last [`clear_messages`](Self::clear_messages).
    #[must_use]
    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn clear_messages(&mut self) {
        self.messages.clear();
    }

    /// Installs a cooperative cancellation predicate, polled at each recursion level.
    ///
    /// A cancelled parse stops descending and leaves the already-built tree consistent.
    pub fn set_cancel_hook(&mut self, hook: impl Fn() -> bool + Send + 'static) {
        self.cancel = Some(Box::new(hook));
    }

    pub(crate) fn cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(|hook| hook())
    }

    pub(crate) fn msg(&mut self, severity: Severity, text: String, index: Option<NodeId>) {
        self.messages.push(Message { severity, text, index });
    }

    /// Decompresses a section body with the algorithm its header declares, reporting which
    /// concrete algorithm actually matched.
    pub(crate) fn decompress(
        &mut self, compressed: &[u8], compression_type: u8,
    ) -> Result<(Vec<u8>, Compression)> {
        match compression_type {
            ffs::EFI_NOT_COMPRESSED => Ok((compressed.to_vec(), Compression::None)),
            ffs::EFI_STANDARD_COMPRESSION => {
                let header = tiano::read_header(compressed)
                    .map_err(|_| ErrorKind::StandardDecompressionFailed)?;
                if header.compressed_size as usize + tiano::HEADER_SIZE != compressed.len() {
                    return Err(ErrorKind::StandardDecompressionFailed);
                }
                let (decompressed, variant) = tiano::decompress_from(compressed)
                    .map_err(|_| ErrorKind::StandardDecompressionFailed)?;
                let algorithm = match variant {
                    Variant::Tiano => Compression::Tiano,
                    Variant::Efi11 => Compression::Efi11,
                };
                Ok((decompressed.into_vec(), algorithm))
            }
            ffs::EFI_CUSTOMIZED_COMPRESSION => {
                if let Ok(decompressed) = lzma::decompress_from(compressed) {
                    return Ok((decompressed.into_vec(), Compression::Lzma));
                }
                // Intel modified LZMA carries a stray section header in front of the stream
                let skip = ffs::section_header_size(compressed);
                let stream = compressed
                    .get(skip..)
                    .ok_or(ErrorKind::CustomizedDecompressionFailed)?;
                let decompressed = lzma::decompress_from(stream)
                    .map_err(|_| ErrorKind::CustomizedDecompressionFailed)?;
                Ok((decompressed.into_vec(), Compression::Imlzma))
            }
            other => {
                self.msg(
                    Severity::Error,
                    format!("decompress: unknown compression type {other}"),
                    None,
                );
                Err(ErrorKind::UnknownCompressionAlgorithm)
            }
        }
    }

    /// Compresses data with a concrete algorithm recorded at parse time.
    pub(crate) fn compress(
        &mut self, data: &[u8], algorithm: Compression, dictionary_size: u32,
    ) -> Result<Vec<u8>> {
        match algorithm {
            Compression::None => Ok(data.to_vec()),
            Compression::Efi11 | Compression::Tiano => {
                let variant = if algorithm == Compression::Tiano {
                    Variant::Tiano
                } else {
                    Variant::Efi11
                };
                // Some images only reproduce through the legacy encoder, so it is tried
                // first and checked by decoding the result back
                if let Ok(compressed) = tiano::compress_from(data, variant, Strategy::Legacy) {
                    if let Ok(decompressed) = tiano::decompress(&compressed, variant) {
                        if *decompressed == *data {
                            return Ok(compressed.into_vec());
                        }
                    }
                }
                tiano::compress_from(data, variant, Strategy::Current)
                    .map(|compressed| compressed.into_vec())
                    .map_err(|_| ErrorKind::StandardCompressionFailed)
            }
            Compression::Lzma => lzma::compress_from(data, dictionary_size)
                .map(|compressed| compressed.into_vec())
                .map_err(|_| ErrorKind::CustomizedCompressionFailed),
            Compression::Imlzma => {
                // The stray section header stays uncompressed in front of the stream
                let skip = ffs::section_header_size(data).min(data.len());
                let compressed = lzma::compress_from(&data[skip..], dictionary_size)
                    .map_err(|_| ErrorKind::CustomizedCompressionFailed)?;
                let mut output = data[..skip].to_vec();
                output.extend_from_slice(&compressed);
                Ok(output)
            }
            Compression::Unknown => {
                self.msg(
                    Severity::Error,
                    "compress: unknown compression algorithm".to_owned(),
                    None,
                );
                Err(ErrorKind::UnknownCompressionAlgorithm)
            }
        }
    }

    /// Half-open interval overlap test used by the descriptor region checks.
    pub(crate) fn has_intersection(begin1: u32, end1: u32, begin2: u32, end2: u32) -> bool {
        (begin1 < begin2 && begin2 < end1)
            || (begin1 < end2 && end2 < end1)
            || (begin2 < begin1 && begin1 < end2)
            || (begin2 < end1 && end1 < end2)
    }
}
