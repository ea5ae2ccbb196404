//! Byte patching of leaf nodes, by offset or by hex find pattern.
//!
//! Replace patterns understand the same `.` nibble placeholders as the search: a placeholder
//! nibble keeps the value already present in the body.

use crate::engine::search::{find_nibble_matches, parse_hex_pattern};
use crate::engine::FfsEngine;
use crate::errors::{ErrorKind, Result};
use crate::messages::Severity;
use crate::treemodel::NodeId;
use crate::types::{Action, ReplaceMode};

/// How a patch locates the bytes to change.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PatchType {
    Offset,
    Pattern,
}

/// One patch to apply to a node's body.
#[derive(Clone, Debug)]
pub struct PatchData {
    pub patch_type: PatchType,
    pub offset: u32,
    pub hex_find_pattern: String,
    pub hex_replace_pattern: String,
}

impl FfsEngine {
    /// Applies a list of patches to a leaf node's body and replaces the node with the result.
    pub fn patch(&mut self, index: NodeId, patches: &[PatchData]) -> Result<()> {
        if self.model.parent(index).is_none()
            || patches.is_empty()
            || self.model.child_count(index) != 0
        {
            return Err(ErrorKind::InvalidParameter);
        }
        // Already removed items have nothing to patch
        if self.model.action(index) == Action::Remove {
            return Err(ErrorKind::NothingToPatch);
        }

        let mut body = self.model.body(index).to_vec();
        for patch in patches {
            match patch.patch_type {
                PatchType::Offset => {
                    self.patch_via_offset(&mut body, patch.offset as usize, &patch.hex_replace_pattern)?;
                }
                PatchType::Pattern => {
                    self.patch_via_pattern(
                        &mut body,
                        &patch.hex_find_pattern,
                        &patch.hex_replace_pattern,
                    )?;
                }
            }
        }

        if body == self.model.body(index) {
            return Err(ErrorKind::NothingToPatch);
        }

        let mut patched = self.model.header(index).to_vec();
        patched.extend_from_slice(&body);
        self.replace(index, &patched, ReplaceMode::AsIs)
    }

    fn patch_via_offset(
        &mut self, data: &mut [u8], offset: usize, hex_replace_pattern: &str,
    ) -> Result<()> {
        let pattern = hex_replace_pattern.as_bytes();
        // Placeholders work per nibble, so the pattern must cover whole bytes
        if pattern.len() % 2 != 0 || pattern.is_empty() {
            return Err(ErrorKind::InvalidParameter);
        }
        let byte_count = pattern.len() / 2;
        if offset + byte_count > data.len() {
            return Err(ErrorKind::PatchOffsetOutOfBounds);
        }

        let hex_value = |symbol: u8| -> Result<u8> {
            (symbol as char)
                .to_digit(16)
                .map(|value| value as u8)
                .ok_or(ErrorKind::InvalidSymbol)
        };

        let old: Vec<u8> = data[offset..offset + byte_count].to_vec();
        let mut replacement = Vec::with_capacity(byte_count);
        for at in 0..byte_count {
            let high = pattern[2 * at];
            let low = pattern[2 * at + 1];
            let current = data[offset + at];
            let value = match (high, low) {
                (b'.', b'.') => current,
                (b'.', _) => (current & 0xF0) | hex_value(low)?,
                (_, b'.') => (current & 0x0F) | (hex_value(high)? << 4),
                (_, _) => (hex_value(high)? << 4) | hex_value(low)?,
            };
            replacement.push(value);
        }

        data[offset..offset + byte_count].copy_from_slice(&replacement);
        let old_hex: String = old.iter().map(|byte| format!("{byte:02X}")).collect();
        let new_hex: String = replacement.iter().map(|byte| format!("{byte:02X}")).collect();
        self.msg(
            Severity::Info,
            format!(
                "patch: replaced {} bytes at offset {:X}h {} -> {}",
                byte_count, offset, old_hex, new_hex
            ),
            None,
        );
        Ok(())
    }

    fn patch_via_pattern(
        &mut self, data: &mut [u8], hex_find_pattern: &str, hex_replace_pattern: &str,
    ) -> Result<()> {
        if hex_find_pattern.len() % 2 != 0 || hex_replace_pattern.len() % 2 != 0 {
            return Err(ErrorKind::InvalidParameter);
        }
        let pattern =
            parse_hex_pattern(hex_find_pattern).ok_or(ErrorKind::InvalidSymbol)?;
        let matches = find_nibble_matches(data, &pattern);
        for offset in matches {
            self.patch_via_offset(data, offset, hex_replace_pattern)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offset_patch_with_placeholders() {
        let mut engine = FfsEngine::new();
        let mut data = vec![0x11, 0x22, 0x33, 0x44];
        engine.patch_via_offset(&mut data, 1, "a.0F").unwrap();
        assert_eq!(data, vec![0x11, 0xA2, 0x0F, 0x44]);
    }

    #[test]
    fn pattern_patch() {
        let mut engine = FfsEngine::new();
        let mut data = vec![0x90, 0xEB, 0xFE, 0x90, 0xEB, 0xFE];
        engine.patch_via_pattern(&mut data, "ebfe", "9090").unwrap();
        assert_eq!(data, vec![0x90, 0x90, 0x90, 0x90, 0x90, 0x90]);
    }

    #[test]
    fn out_of_bounds() {
        let mut engine = FfsEngine::new();
        let mut data = vec![0x00, 0x00];
        assert_eq!(
            engine.patch_via_offset(&mut data, 1, "AABB"),
            Err(ErrorKind::PatchOffsetOutOfBounds)
        );
    }
}
