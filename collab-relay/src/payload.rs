//! Bounds checks for client-supplied replica payloads.
//!
//! `yrs` sizes several collections from counts read off the wire before it
//! reads their elements (state vector entries, delete-set ranges, `Any`
//! arrays and maps). A few bytes declaring billions of entries would make it
//! allocate until the process aborts. These checks walk a payload's lib0 v1
//! layout without allocating and reject any count that cannot fit in the
//! bytes left, so `yrs` only ever sees payloads whose counts are honest.
//!
//! Strings are also checked for valid UTF-8, and `Any` values nest at most
//! [`MAX_ANY_DEPTH`] levels deep.

use yrs::encoding::read::{Cursor, Error as ReadError, Read};

use crate::error::Result;

/// Deepest nesting of `Any` arrays and maps accepted in an update.
pub const MAX_ANY_DEPTH: usize = 64;

// Block info layout
const BLOCK_GC: u8 = 0;
const BLOCK_SKIP: u8 = 10;
const HAS_ORIGIN: u8 = 0b1000_0000;
const HAS_RIGHT_ORIGIN: u8 = 0b0100_0000;
const HAS_PARENT_SUB: u8 = 0b0010_0000;
const CONTENT_MASK: u8 = 0b0000_1111;

// Item content kinds
const CONTENT_DELETED: u8 = 1;
const CONTENT_JSON: u8 = 2;
const CONTENT_BINARY: u8 = 3;
const CONTENT_STRING: u8 = 4;
const CONTENT_EMBED: u8 = 5;
const CONTENT_FORMAT: u8 = 6;
const CONTENT_TYPE: u8 = 7;
const CONTENT_ANY: u8 = 8;
const CONTENT_DOC: u8 = 9;
const CONTENT_MOVE: u8 = 11;

// Shared type refs carried by CONTENT_TYPE
const TYPE_XML_ELEMENT: u8 = 3;
const PLAIN_TYPE_REFS: [u8; 7] = [0, 1, 2, 4, 5, 6, 9];
const TYPE_UNDEFINED: u8 = 15;

/// Check an encoded state vector before it is decoded.
pub fn check_state_vector(bytes: &[u8]) -> Result<()> {
    let mut walker = Walker::new(bytes);
    // Each entry is a client id and a clock, one byte each at least
    let entries = walker.count(2)?;
    for _ in 0..entries {
        walker.skip_var()?;
        walker.skip_var()?;
    }
    Ok(())
}

/// Check a lib0 v1 encoded update before it is decoded.
pub fn check_update_v1(bytes: &[u8]) -> Result<()> {
    let mut walker = Walker::new(bytes);

    // Struct section: per client a block count, client id and start clock
    let clients = walker.count(3)?;
    for _ in 0..clients {
        let blocks = walker.count(1)?;
        walker.skip_var()?;
        walker.skip_var()?;
        for _ in 0..blocks {
            walker.skip_block()?;
        }
    }

    // Delete set: per client an id and a range count, each range a clock and a length
    let clients = walker.count(2)?;
    for _ in 0..clients {
        walker.skip_var()?;
        let ranges = walker.count(2)?;
        for _ in 0..ranges {
            walker.skip_var()?;
            walker.skip_var()?;
        }
    }
    Ok(())
}

struct Walker<'a> {
    cursor: Cursor<'a>,
}

impl<'a> Walker<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self {
            cursor: Cursor::new(bytes),
        }
    }

    fn remaining(&self) -> usize {
        self.cursor.buf.len().saturating_sub(self.cursor.next)
    }

    /// Read a count of elements that each take at least `min_bytes`.
    fn count(&mut self, min_bytes: usize) -> Result<usize> {
        let declared: u64 = self.cursor.read_var()?;
        let needed = usize::try_from(declared)
            .ok()
            .and_then(|n| n.checked_mul(min_bytes))
            .filter(|&needed| declared <= u64::from(u32::MAX) && needed <= self.remaining());
        match needed {
            Some(_) => Ok(declared as usize),
            None => Err(ReadError::EndOfBuffer(self.remaining()).into()),
        }
    }

    /// Skip one varint, signed or unsigned.
    fn skip_var(&mut self) -> Result<()> {
        self.read_var_head().map(|_| ())
    }

    /// Skip a varint and return its first byte.
    fn read_var_head(&mut self) -> Result<u8> {
        let head = self.cursor.read_u8()?;
        let mut byte = head;
        let mut len = 1;
        while byte & 0x80 != 0 {
            if len == 10 {
                return Err(ReadError::InvalidVarInt.into());
            }
            byte = self.cursor.read_u8()?;
            len += 1;
        }
        Ok(head)
    }

    fn skip_buf(&mut self) -> Result<()> {
        self.cursor.read_buf()?;
        Ok(())
    }

    fn skip_string(&mut self) -> Result<()> {
        let bytes = self.cursor.read_buf()?;
        std::str::from_utf8(bytes).map_err(|_| ReadError::UnexpectedValue)?;
        Ok(())
    }

    fn skip_block(&mut self) -> Result<()> {
        let info = self.cursor.read_u8()?;
        if info == BLOCK_GC || info == BLOCK_SKIP {
            return self.skip_var();
        }

        if info & HAS_ORIGIN != 0 {
            self.skip_var()?;
            self.skip_var()?;
        }
        if info & HAS_RIGHT_ORIGIN != 0 {
            self.skip_var()?;
            self.skip_var()?;
        }
        if info & (HAS_ORIGIN | HAS_RIGHT_ORIGIN) == 0 {
            let named_parent: u32 = self.cursor.read_var()?;
            if named_parent == 1 {
                self.skip_string()?;
            } else {
                self.skip_var()?;
                self.skip_var()?;
            }
            if info & HAS_PARENT_SUB != 0 {
                self.skip_string()?;
            }
        }

        self.skip_content(info & CONTENT_MASK)
    }

    fn skip_content(&mut self, kind: u8) -> Result<()> {
        match kind {
            CONTENT_DELETED => self.skip_var(),
            CONTENT_JSON => {
                // The count is one less than the number of strings that follow
                let strings = self.count(1)?;
                for _ in 0..=strings {
                    self.skip_string()?;
                }
                Ok(())
            }
            CONTENT_BINARY => self.skip_buf(),
            CONTENT_STRING | CONTENT_EMBED => self.skip_string(),
            CONTENT_FORMAT => {
                self.skip_string()?;
                self.skip_string()
            }
            CONTENT_TYPE => match self.cursor.read_u8()? {
                TYPE_XML_ELEMENT => self.skip_string(),
                type_ref if PLAIN_TYPE_REFS.contains(&type_ref) || type_ref == TYPE_UNDEFINED => Ok(()),
                _ => Err(ReadError::UnexpectedValue.into()),
            },
            CONTENT_ANY => {
                let values = self.count(1)?;
                for _ in 0..values {
                    self.skip_any(0)?;
                }
                Ok(())
            }
            CONTENT_DOC => {
                self.skip_string()?;
                self.skip_any(0)
            }
            CONTENT_MOVE => {
                // Bit 0 of the flags marks a collapsed range with no end id
                let collapsed = self.read_var_head()? & 1 != 0;
                self.skip_var()?;
                self.skip_var()?;
                if !collapsed {
                    self.skip_var()?;
                    self.skip_var()?;
                }
                Ok(())
            }
            _ => Err(ReadError::UnexpectedValue.into()),
        }
    }

    fn skip_any(&mut self, depth: usize) -> Result<()> {
        if depth > MAX_ANY_DEPTH {
            return Err(ReadError::UnexpectedValue.into());
        }
        match self.cursor.read_u8()? {
            // undefined, null, false, true
            127 | 126 | 121 | 120 => Ok(()),
            // integer
            125 => self.skip_var(),
            // float32
            124 => self.cursor.read_exact(4).map(|_| ()).map_err(Into::into),
            // float64, bigint
            123 | 122 => self.cursor.read_exact(8).map(|_| ()).map_err(Into::into),
            119 => self.skip_string(),
            // map: string key then value, one byte each at least
            118 => {
                let entries = self.count(2)?;
                for _ in 0..entries {
                    self.skip_string()?;
                    self.skip_any(depth + 1)?;
                }
                Ok(())
            }
            // array
            117 => {
                let items = self.count(1)?;
                for _ in 0..items {
                    self.skip_any(depth + 1)?;
                }
                Ok(())
            }
            116 => self.skip_buf(),
            _ => Err(ReadError::UnexpectedValue.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RelayError;
    use std::collections::HashMap;
    use std::sync::Arc;
    use yrs::types::Attrs;
    use yrs::updates::encoder::Encode;
    use yrs::{Any, Array, Doc, Map, ReadTxn, StateVector, Text, TextPrelim, Transact};

    fn is_malformed(result: Result<()>) -> bool {
        matches!(result, Err(RelayError::Malformed(_)))
    }

    #[test]
    fn test_state_vector_with_huge_count_is_rejected() {
        assert!(is_malformed(check_state_vector(&[0xff, 0xff, 0xff, 0xff, 0x0f])));
    }

    #[test]
    fn test_real_state_vectors_pass() {
        assert!(check_state_vector(&StateVector::default().encode_v1()).is_ok());

        let doc = Doc::with_client_id(300);
        let text = doc.get_or_insert_text("content");
        text.insert(&mut doc.transact_mut(), 0, "hello");
        let sv = doc.transact().state_vector().encode_v1();
        assert!(check_state_vector(&sv).is_ok());
    }

    #[test]
    fn test_delete_set_with_huge_range_count_is_rejected() {
        // No structs, one delete-set client claiming u32::MAX ranges
        let update = [0, 1, 1, 0xff, 0xff, 0xff, 0xff, 0x0f];
        assert!(is_malformed(check_update_v1(&update)));
    }

    #[test]
    fn test_struct_section_with_huge_counts_is_rejected() {
        assert!(is_malformed(check_update_v1(&[0xff, 0xff, 0xff, 0xff, 0x0f, 0])));
        assert!(is_malformed(check_update_v1(&[1, 0xff, 0xff, 0xff, 0xff, 0x0f, 1, 0])));
    }

    #[test]
    fn test_any_array_with_huge_length_is_rejected() {
        // One client, one block: no origins, named parent "a", Any content
        // holding one array that claims u32::MAX items
        let update = [
            1, 1, 1, 0, CONTENT_ANY, 1, 1, b'a', 1, 117, 0xff, 0xff, 0xff, 0xff, 0x0f, 0,
        ];
        assert!(is_malformed(check_update_v1(&update)));
    }

    #[test]
    fn test_deeply_nested_any_is_rejected() {
        let mut update = vec![1, 1, 1, 0, CONTENT_ANY, 1, 1, b'a', 1];
        for _ in 0..=MAX_ANY_DEPTH + 1 {
            update.extend_from_slice(&[117, 1]);
        }
        update.extend_from_slice(&[126, 0]);
        assert!(is_malformed(check_update_v1(&update)));
    }

    #[test]
    fn test_invalid_utf8_string_is_rejected() {
        // Named parent whose name is not UTF-8
        let update = [1, 1, 1, 0, CONTENT_STRING, 1, 1, 0xff, 1, b'x', 0];
        assert!(is_malformed(check_update_v1(&update)));
    }

    #[test]
    fn test_empty_update_passes() {
        assert!(check_update_v1(&[0, 0]).is_ok());
    }

    #[test]
    fn test_real_updates_pass() {
        let doc = Doc::with_client_id(1);
        let text = doc.get_or_insert_text("content");
        let map = doc.get_or_insert_map("meta");
        let list = doc.get_or_insert_array("list");
        let before = doc.transact().state_vector();
        {
            let mut txn = doc.transact_mut();
            text.insert(&mut txn, 0, "hello world");
            text.remove_range(&mut txn, 0, 6);
            let bold: Attrs = HashMap::from([(Arc::from("bold"), Any::Bool(true))]);
            text.format(&mut txn, 0, 3, bold);

            let nested = Any::Map(Arc::new(HashMap::from([
                ("tags".to_string(), Any::Array(vec![Any::String("a".into()), Any::Null].into())),
                ("score".to_string(), Any::Number(1.5)),
                ("big".to_string(), Any::BigInt(1 << 40)),
                ("raw".to_string(), Any::Buffer(Arc::from(&[1u8, 2, 3][..]))),
            ])));
            map.insert(&mut txn, "settings", nested);
            map.insert(&mut txn, "title", Any::String("draft".into()));
            map.insert(&mut txn, "inner", TextPrelim::new("nested text"));
            map.insert(&mut txn, "sub", Doc::new());
            list.push_back(&mut txn, Any::Number(-42.0));
            list.push_back(&mut txn, Any::Bool(false));
            list.remove(&mut txn, 1);
        }

        let update = doc.transact().encode_diff_v1(&before);
        assert!(check_update_v1(&update).is_ok());
    }
}
