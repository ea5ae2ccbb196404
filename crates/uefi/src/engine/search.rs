//! Pattern search over the tree: hex with nibble wildcards, GUIDs, and text.
//!
//! Matches are reported through the message queue, one message per hit, tagged with the node
//! they were found in.

use crate::engine::FfsEngine;
use crate::errors::{ErrorKind, Result};
use crate::messages::Severity;
use crate::treemodel::NodeId;
use crate::types::SearchScope;

/// One pattern nibble: a concrete value or the `.` wildcard.
pub(crate) type PatternNibble = Option<u8>;

/// Parses a hex pattern with `.` placeholders into nibbles. Returns `None` on foreign symbols.
pub(crate) fn parse_hex_pattern(pattern: &str) -> Option<Vec<PatternNibble>> {
    if pattern.is_empty() {
        return None;
    }
    pattern
        .chars()
        .map(|symbol| match symbol {
            '.' => Some(None),
            _ => symbol.to_digit(16).map(|value| Some(value as u8)),
        })
        .collect()
}

fn nibble_at(data: &[u8], index: usize) -> u8 {
    let byte = data[index / 2];
    if index % 2 == 0 {
        byte >> 4
    } else {
        byte & 0x0F
    }
}

/// Finds every even-nibble (whole byte) offset where the pattern matches.
pub(crate) fn find_nibble_matches(data: &[u8], pattern: &[PatternNibble]) -> Vec<usize> {
    let nibbles = data.len() * 2;
    if pattern.len() > nibbles {
        return Vec::new();
    }
    let mut matches = Vec::new();
    for start in (0..=nibbles - pattern.len()).step_by(2) {
        let hit = pattern.iter().enumerate().all(|(at, &expected)| match expected {
            Some(value) => nibble_at(data, start + at) == value,
            None => true,
        });
        if hit {
            matches.push(start / 2);
        }
    }
    matches
}

fn hex_of(data: &[u8], offset: usize, nibble_len: usize) -> String {
    let byte_len = (nibble_len + 1) / 2;
    data[offset..(offset + byte_len).min(data.len())]
        .iter()
        .map(|byte| format!("{byte:02X}"))
        .collect::<String>()
        .chars()
        .take(nibble_len)
        .collect()
}

impl FfsEngine {
    /// Searches for a hex pattern (with `.` nibble wildcards) in the subtree at `index`.
    pub fn find_hex_pattern(
        &mut self, index: NodeId, pattern: &str, scope: SearchScope,
    ) -> Result<()> {
        // An all-wildcards pattern matches everything and reports nothing useful
        if pattern.chars().all(|symbol| symbol == '.') && !pattern.is_empty() {
            return Ok(());
        }
        let Some(nibbles) = parse_hex_pattern(pattern) else {
            return Err(ErrorKind::InvalidParameter);
        };
        self.find_hex_in_subtree(index, pattern, &nibbles, scope);
        Ok(())
    }

    fn find_hex_in_subtree(
        &mut self, index: NodeId, pattern: &str, nibbles: &[PatternNibble], scope: SearchScope,
    ) {
        let children: Vec<NodeId> = self.model.children(index).to_vec();
        let has_children = !children.is_empty();
        for child in children {
            self.find_hex_in_subtree(child, pattern, nibbles, scope);
        }

        // Container bodies are covered by their children, only leaves search the body
        let mut data = Vec::new();
        if has_children {
            if scope != SearchScope::Body {
                data.extend_from_slice(self.model.header(index));
            }
        } else {
            match scope {
                SearchScope::Header => data.extend_from_slice(self.model.header(index)),
                SearchScope::Body => data.extend_from_slice(self.model.body(index)),
                SearchScope::All => {
                    data.extend_from_slice(self.model.header(index));
                    data.extend_from_slice(self.model.body(index));
                }
            }
        }
        if data.is_empty() {
            return;
        }

        for offset in find_nibble_matches(&data, nibbles) {
            let found = hex_of(&data, offset, nibbles.len());
            let name = self.model.name(index).to_owned();
            self.msg(
                Severity::Info,
                format!(
                    "Hex pattern \"{}\" found as \"{}\" in {} at {}-offset {:X}h",
                    pattern,
                    found,
                    name,
                    if scope == SearchScope::Body { "body" } else { "header" },
                    offset
                ),
                Some(index),
            );
        }
    }

    /// Searches for a GUID given in registry format; the three little-endian fields are
    /// byte-swapped before delegating to the hex search.
    pub fn find_guid_pattern(
        &mut self, index: NodeId, guid_pattern: &str, scope: SearchScope,
    ) -> Result<()> {
        let groups: Vec<&str> = guid_pattern.split('-').collect();
        if groups.len() != 5 {
            return Err(ErrorKind::InvalidParameter);
        }
        if groups[0].len() != 8
            || groups[1].len() != 4
            || groups[2].len() != 4
            || groups[3].len() != 4
            || groups[4].len() != 12
        {
            return Err(ErrorKind::InvalidParameter);
        }

        let mut hex_pattern = String::with_capacity(32);
        // Reverse the first three GUID blocks
        hex_pattern.push_str(&groups[0][6..8]);
        hex_pattern.push_str(&groups[0][4..6]);
        hex_pattern.push_str(&groups[0][2..4]);
        hex_pattern.push_str(&groups[0][0..2]);
        hex_pattern.push_str(&groups[1][2..4]);
        hex_pattern.push_str(&groups[1][0..2]);
        hex_pattern.push_str(&groups[2][2..4]);
        hex_pattern.push_str(&groups[2][0..2]);
        // The last two blocks are stored as-is
        hex_pattern.push_str(groups[3]);
        hex_pattern.push_str(groups[4]);

        self.find_hex_pattern(index, &hex_pattern, scope)
    }

    /// Searches for a text pattern, interpreted as Latin-1 or UTF-16LE.
    pub fn find_text_pattern(
        &mut self, index: NodeId, pattern: &str, unicode: bool, case_sensitive: bool,
    ) -> Result<()> {
        if pattern.is_empty() {
            return Err(ErrorKind::InvalidParameter);
        }
        self.find_text_in_subtree(index, pattern, unicode, case_sensitive);
        Ok(())
    }

    fn find_text_in_subtree(
        &mut self, index: NodeId, pattern: &str, unicode: bool, case_sensitive: bool,
    ) {
        let children: Vec<NodeId> = self.model.children(index).to_vec();
        let has_children = !children.is_empty();
        for child in children {
            self.find_text_in_subtree(child, pattern, unicode, case_sensitive);
        }
        if has_children {
            return;
        }

        let body = self.model.body(index);
        let data: String = if unicode {
            let units: Vec<u16> = body
                .chunks_exact(2)
                .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
                .collect();
            units.iter().map(|&unit| char::from_u32(u32::from(unit)).unwrap_or('\u{FFFD}')).collect()
        } else {
            body.iter().map(|&byte| char::from(byte)).collect()
        };

        let (haystack, needle) = if case_sensitive {
            (data, pattern.to_owned())
        } else {
            (data.to_lowercase(), pattern.to_lowercase())
        };

        let mut search_from = 0;
        while let Some(found) = haystack[search_from..].find(&needle) {
            let offset = search_from + found;
            let name = self.model.name(index).to_owned();
            self.msg(
                Severity::Info,
                format!(
                    "{} text \"{}\" found in {} at offset {:X}h",
                    if unicode { "Unicode" } else { "ASCII" },
                    pattern,
                    name,
                    if unicode { offset * 2 } else { offset }
                ),
                Some(index),
            );
            search_from = offset + 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nibble_matching() {
        let data = [0xAB, 0xCD, 0xEF];
        let pattern = parse_hex_pattern("cdef").unwrap();
        assert_eq!(find_nibble_matches(&data, &pattern), vec![1]);

        let wildcard = parse_hex_pattern("a.c.").unwrap();
        assert_eq!(find_nibble_matches(&data, &wildcard), vec![0]);

        let missing = parse_hex_pattern("0102").unwrap();
        assert!(find_nibble_matches(&data, &missing).is_empty());
    }

    #[test]
    fn rejects_foreign_symbols() {
        assert!(parse_hex_pattern("12g4").is_none());
        assert!(parse_hex_pattern("").is_none());
        assert!(parse_hex_pattern("1.AB").is_some());
    }
}
