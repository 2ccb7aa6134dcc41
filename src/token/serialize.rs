//! Binary wire format for tokens.
//!
//! Integers are written as four explicit little-endian bytes rather than a
//! native-width memory dump, so images stay portable across platforms and
//! builds. Strings are length-prefixed UTF-8 with the length clamped to
//! [`MAX_WIRE_STR`]; oversized or corrupt length records are skipped on
//! load without aborting the record.

use crate::storage::{StorageError, StorageResult};
use crate::token::Token;
use crate::types::{TokenIdx, TokenIdxSet, TokenKind, TokenScope};
use std::collections::BTreeMap;
use std::io::{Read, Seek, SeekFrom, Write};
use tracing::warn;

/// Longest string payload the wire format carries; longer values are
/// truncated on save.
pub const MAX_WIRE_STR: usize = 32767;

pub fn write_i32_le<W: Write>(w: &mut W, v: i32) -> StorageResult<()> {
    // rshifts aren't well-defined for negatives, go through unsigned
    let u = v as u32;
    let bytes = [
        (u & 0xFF) as u8,
        ((u >> 8) & 0xFF) as u8,
        ((u >> 16) & 0xFF) as u8,
        ((u >> 24) & 0xFF) as u8,
    ];
    w.write_all(&bytes)?;
    Ok(())
}

pub fn read_i32_le<R: Read>(r: &mut R) -> StorageResult<i32> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf).map_err(map_eof)?;
    let u = (buf[0] as u32)
        | ((buf[1] as u32) << 8)
        | ((buf[2] as u32) << 16)
        | ((buf[3] as u32) << 24);
    Ok(u as i32)
}

pub fn write_bool<W: Write>(w: &mut W, v: bool) -> StorageResult<()> {
    write_i32_le(w, v as i32)
}

pub fn read_bool<R: Read>(r: &mut R) -> StorageResult<bool> {
    Ok(read_i32_le(r)? != 0)
}

/// Write a string as length prefix plus UTF-8 bytes, truncating at
/// [`MAX_WIRE_STR`]. Truncation backs off to the nearest char boundary so
/// the payload stays valid UTF-8.
pub fn write_str<W: Write>(w: &mut W, s: &str) -> StorageResult<()> {
    let bytes = s.as_bytes();
    let mut len = bytes.len().min(MAX_WIRE_STR);
    while len > 0 && !s.is_char_boundary(len) {
        len -= 1;
    }
    write_i32_le(w, len as i32)?;
    if len > 0 {
        w.write_all(&bytes[..len])?;
    }
    Ok(())
}

/// Read a length-prefixed string. A length outside `[1, MAX_WIRE_STR]`
/// yields an empty string and seeks the stream past the payload
/// (`length & 0xFF_FFFF` bytes), tolerating corrupt records while staying
/// positioned for the next field.
pub fn read_str<R: Read + Seek>(r: &mut R) -> StorageResult<String> {
    let len = read_i32_le(r)?;
    if (1..=MAX_WIRE_STR as i32).contains(&len) {
        let mut buf = vec![0u8; len as usize];
        r.read_exact(&mut buf).map_err(map_eof)?;
        Ok(String::from_utf8_lossy(&buf).into_owned())
    } else {
        let skip = (len & 0xFF_FFFF) as i64;
        if skip > 0 {
            warn!(length = len, "skipping oversized string record");
            r.seek(SeekFrom::Current(skip))?;
        }
        Ok(String::new())
    }
}

fn write_opt_idx<W: Write>(w: &mut W, idx: Option<TokenIdx>) -> StorageResult<()> {
    match idx {
        Some(i) => write_i32_le(w, i as i32),
        None => write_i32_le(w, -1),
    }
}

fn read_opt_idx<R: Read>(r: &mut R) -> StorageResult<Option<TokenIdx>> {
    let v = read_i32_le(r)?;
    if v < 0 { Ok(None) } else { Ok(Some(v as TokenIdx)) }
}

fn write_idx_set<W: Write>(w: &mut W, set: &TokenIdxSet) -> StorageResult<()> {
    write_i32_le(w, set.len() as i32)?;
    for idx in set {
        write_i32_le(w, *idx as i32)?;
    }
    Ok(())
}

fn read_idx_set<R: Read>(r: &mut R) -> StorageResult<TokenIdxSet> {
    let count = read_i32_le(r)?;
    if count < 0 {
        return Err(StorageError::corrupt(
            "index set",
            format!("negative element count {count}"),
        ));
    }
    let mut set = TokenIdxSet::new();
    for _ in 0..count {
        let v = read_i32_le(r)?;
        if v < 0 {
            warn!(value = v, "dropping negative index from set record");
            continue;
        }
        set.insert(v as TokenIdx);
    }
    Ok(set)
}

fn write_str_list<W: Write>(w: &mut W, list: &[String]) -> StorageResult<()> {
    write_i32_le(w, list.len() as i32)?;
    for s in list {
        write_str(w, s)?;
    }
    Ok(())
}

fn read_str_list<R: Read + Seek>(r: &mut R) -> StorageResult<Vec<String>> {
    let count = read_i32_le(r)?;
    if count < 0 {
        return Err(StorageError::corrupt(
            "string list",
            format!("negative element count {count}"),
        ));
    }
    let mut list = Vec::with_capacity(count.min(1024) as usize);
    for _ in 0..count {
        list.push(read_str(r)?);
    }
    Ok(list)
}

impl Token {
    /// Write the full token record. Field order is fixed; see
    /// [`Token::serialize_in`] for the mirror read.
    pub fn serialize_out<W: Write>(&self, w: &mut W) -> StorageResult<()> {
        write_str(w, &self.name)?;
        write_str(w, &self.full_type)?;
        write_str(w, &self.base_type)?;
        write_str(w, &self.args)?;
        write_str(w, &self.base_args)?;
        write_str(w, &self.ancestors_string)?;
        write_str(w, &self.template_argument)?;

        write_i32_le(w, self.file_idx as i32)?;
        write_i32_le(w, self.line as i32)?;
        write_i32_le(w, self.impl_file_idx as i32)?;
        write_i32_le(w, self.impl_line as i32)?;
        write_i32_le(w, self.impl_line_start as i32)?;
        write_i32_le(w, self.impl_line_end as i32)?;

        write_i32_le(w, self.scope as i32)?;
        write_i32_le(w, self.kind.bits() as i32)?;

        write_bool(w, self.is_operator)?;
        write_bool(w, self.is_local)?;
        write_bool(w, self.is_temp)?;
        write_bool(w, self.is_const)?;

        write_opt_idx(w, self.parent_idx)?;
        write_idx_set(w, &self.children)?;
        write_idx_set(w, &self.direct_ancestors)?;
        write_idx_set(w, &self.ancestors)?;
        write_idx_set(w, &self.descendants)?;

        write_str_list(w, &self.aliases)?;
        write_str_list(w, &self.template_type)?;

        write_i32_le(w, self.template_map.len() as i32)?;
        for (key, value) in &self.template_map {
            write_str(w, key)?;
            write_str(w, value)?;
        }
        write_str(w, &self.template_alias)?;
        Ok(())
    }

    /// Read one token record. Any short read fails the whole record so the
    /// caller can abandon the load instead of trusting a partial token.
    /// Slot index and ticket are not part of the record; the owning tree
    /// assigns them when the token is placed.
    pub fn serialize_in<R: Read + Seek>(r: &mut R) -> StorageResult<Token> {
        let mut token = Token::new(read_str(r)?, 0, 0);
        token.full_type = read_str(r)?;
        token.base_type = read_str(r)?;
        token.args = read_str(r)?;
        token.base_args = read_str(r)?;
        token.ancestors_string = read_str(r)?;
        token.template_argument = read_str(r)?;

        token.file_idx = read_i32_le(r)?.max(0) as u32;
        token.line = read_i32_le(r)?.max(0) as u32;
        token.impl_file_idx = read_i32_le(r)?.max(0) as u32;
        token.impl_line = read_i32_le(r)?.max(0) as u32;
        token.impl_line_start = read_i32_le(r)?.max(0) as u32;
        token.impl_line_end = read_i32_le(r)?.max(0) as u32;

        token.scope = TokenScope::from_wire(read_i32_le(r)?);
        token.kind = TokenKind::from_bits_truncate(read_i32_le(r)? as u16);

        token.is_operator = read_bool(r)?;
        token.is_local = read_bool(r)?;
        token.is_temp = read_bool(r)?;
        token.is_const = read_bool(r)?;

        token.parent_idx = read_opt_idx(r)?;
        token.children = read_idx_set(r)?;
        token.direct_ancestors = read_idx_set(r)?;
        token.ancestors = read_idx_set(r)?;
        token.descendants = read_idx_set(r)?;

        token.aliases = read_str_list(r)?;
        token.template_type = read_str_list(r)?;

        let map_len = read_i32_le(r)?;
        if map_len < 0 {
            return Err(StorageError::corrupt(
                "template map",
                format!("negative entry count {map_len}"),
            ));
        }
        let mut map = BTreeMap::new();
        for _ in 0..map_len {
            let key = read_str(r)?;
            let value = read_str(r)?;
            map.insert(key, value);
        }
        token.template_map = map;
        token.template_alias = read_str(r)?;
        Ok(token)
    }
}

fn map_eof(e: std::io::Error) -> StorageError {
    if e.kind() == std::io::ErrorKind::UnexpectedEof {
        StorageError::UnexpectedEof
    } else {
        StorageError::Io(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_int_round_trip() {
        let mut buf = Cursor::new(Vec::new());
        for v in [0, 1, -1, 42, i32::MAX, i32::MIN, -32768] {
            buf.get_mut().clear();
            buf.set_position(0);
            write_i32_le(&mut buf, v).unwrap();
            buf.set_position(0);
            assert_eq!(read_i32_le(&mut buf).unwrap(), v);
        }
    }

    #[test]
    fn test_int_is_little_endian_bytes() {
        let mut buf = Vec::new();
        write_i32_le(&mut buf, 0x0102_0304).unwrap();
        assert_eq!(buf, [0x04, 0x03, 0x02, 0x01]);
    }

    #[test]
    fn test_short_read_is_rejected() {
        let mut cur = Cursor::new(vec![0x01, 0x02]);
        assert!(matches!(
            read_i32_le(&mut cur),
            Err(StorageError::UnexpectedEof)
        ));
    }

    #[test]
    fn test_string_round_trip() {
        let mut buf = Cursor::new(Vec::new());
        write_str(&mut buf, "TokenTree::insert").unwrap();
        write_str(&mut buf, "").unwrap();
        write_str(&mut buf, "naïve∑").unwrap();
        buf.set_position(0);
        assert_eq!(read_str(&mut buf).unwrap(), "TokenTree::insert");
        assert_eq!(read_str(&mut buf).unwrap(), "");
        assert_eq!(read_str(&mut buf).unwrap(), "naïve∑");
    }

    #[test]
    fn test_oversized_string_is_clamped_on_write() {
        let long = "x".repeat(40_000);
        let mut buf = Cursor::new(Vec::new());
        write_str(&mut buf, &long).unwrap();
        buf.set_position(0);
        let loaded = read_str(&mut buf).unwrap();
        assert_eq!(loaded.len(), MAX_WIRE_STR);
        assert!(loaded.bytes().all(|b| b == b'x'));
    }

    #[test]
    fn test_corrupt_length_skips_payload() {
        // A record claiming 50000 bytes: the reader must return an empty
        // string and leave the stream positioned after the payload.
        let mut raw = Vec::new();
        write_i32_le(&mut raw, 50_000).unwrap();
        raw.extend(std::iter::repeat_n(0xAB, 50_000));
        write_i32_le(&mut raw, 777).unwrap();

        let mut cur = Cursor::new(raw);
        assert_eq!(read_str(&mut cur).unwrap(), "");
        assert_eq!(read_i32_le(&mut cur).unwrap(), 777);
    }

    #[test]
    fn test_token_record_round_trip() {
        let mut token = Token::new("Render", 3, 120);
        token.full_type = "const Image&".to_string();
        token.base_type = "Image".to_string();
        token.args = "(int width, int height = 0)".to_string();
        token.base_args = "(int width, int height)".to_string();
        token.ancestors_string = "Canvas,Drawable".to_string();
        token.template_argument = "<T>".to_string();
        token.template_type = vec!["T".to_string()];
        token
            .template_map
            .insert("T".to_string(), "int".to_string());
        token.template_alias = "RenderOf".to_string();
        token.aliases = vec!["Draw".to_string()];
        token.impl_file_idx = 9;
        token.impl_line = 300;
        token.impl_line_start = 301;
        token.impl_line_end = 340;
        token.kind = TokenKind::FUNCTION;
        token.scope = TokenScope::Public;
        token.is_operator = false;
        token.is_local = true;
        token.is_const = true;
        token.parent_idx = Some(4);
        token.children.insert(11);
        token.direct_ancestors.insert(4);
        token.ancestors.extend([4, 5]);
        token.descendants.insert(12);

        let mut buf = Cursor::new(Vec::new());
        token.serialize_out(&mut buf).unwrap();
        buf.set_position(0);
        let loaded = Token::serialize_in(&mut buf).unwrap();
        assert_eq!(loaded, token);
    }

    #[test]
    fn test_truncated_token_record_fails() {
        let mut token = Token::new("Render", 3, 120);
        token.kind = TokenKind::FUNCTION;
        let mut raw = Vec::new();
        token.serialize_out(&mut raw).unwrap();
        raw.truncate(raw.len() / 2);

        let mut cur = Cursor::new(raw);
        assert!(Token::serialize_in(&mut cur).is_err());
    }

    #[test]
    fn test_root_parent_encodes_as_minus_one() {
        let token = Token::new("globals", 1, 1);
        let mut raw = Vec::new();
        token.serialize_out(&mut raw).unwrap();
        let mut cur = Cursor::new(raw);
        let loaded = Token::serialize_in(&mut cur).unwrap();
        assert_eq!(loaded.parent_idx, None);
    }
}
