//! Compact binary (CBOR) codec for the mdoc wire structures.
//!
//! Implements the subset of RFC 8949 that mdoc issuer-signed documents and
//! device responses use: integers, byte/text strings, arrays, maps, tagged
//! items and the `null`/`true`/`false` simple values. Arguments are always
//! written in their shortest form and only the direct, 1-, 2- and 4-byte
//! widths exist on the wire; floating point has no representation at all.
//!
//! Maps preserve insertion order on both encode and decode. Keys are *not*
//! sorted into the canonical RFC 8949 order before encoding, because
//! deployed verifiers compare against byte streams produced in insertion
//! order; see [`encode`].

use serde_json::Value as Json;
use thiserror::Error;

const MAJOR_UNSIGNED: u8 = 0;
const MAJOR_NEGATIVE: u8 = 1;
const MAJOR_BYTES: u8 = 2;
const MAJOR_TEXT: u8 = 3;
const MAJOR_ARRAY: u8 = 4;
const MAJOR_MAP: u8 = 5;
const MAJOR_TAG: u8 = 6;
const MAJOR_SIMPLE: u8 = 7;

const SIMPLE_FALSE: u64 = 20;
const SIMPLE_TRUE: u64 = 21;
const SIMPLE_NULL: u64 = 22;

/// Tag number marking a byte string that contains an embedded CBOR encoding.
pub const TAG_ENCODED_CBOR: u64 = 24;

/// Errors from [`encode`], [`decode`] and the JSON conversion.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CborError {
    #[error("unexpected end of input at offset {0}")]
    UnexpectedEnd(usize),
    #[error("unsupported argument encoding {0}")]
    UnsupportedArgument(u8),
    #[error("argument {0} exceeds the 4-byte encoding range")]
    ArgumentOutOfRange(u64),
    #[error("unsupported simple value {0}")]
    UnsupportedSimple(u64),
    #[error("text string is not valid UTF-8")]
    InvalidUtf8,
    #[error("{0} trailing byte(s) after the root item")]
    TrailingBytes(usize),
    #[error("number has no integer representation")]
    UnsupportedNumber,
}

/// A single decoded CBOR item.
///
/// One constructor per supported kind, so `match`es over items are checked
/// for exhaustiveness by the compiler. Unsigned and negative integers share
/// the [`Int`](CborValue::Int) constructor and carry the mathematical value;
/// the major type is recovered from the sign when encoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CborValue {
    Int(i64),
    Bytes(Vec<u8>),
    Text(String),
    Array(Vec<CborValue>),
    /// Key/value pairs in insertion order.
    Map(Vec<(CborValue, CborValue)>),
    Tag(u64, Box<CborValue>),
    Bool(bool),
    Null,
}

impl CborValue {
    pub fn as_int(&self) -> Option<i64> {
        match self {
            CborValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            CborValue::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            CborValue::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[CborValue]> {
        match self {
            CborValue::Array(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&[(CborValue, CborValue)]> {
        match self {
            CborValue::Map(entries) => Some(entries),
            _ => None,
        }
    }

    /// Looks up a map entry by text key.
    pub fn get(&self, key: &str) -> Option<&CborValue> {
        self.as_map()?
            .iter()
            .find(|(k, _)| k.as_text() == Some(key))
            .map(|(_, v)| v)
    }
}

impl From<i64> for CborValue {
    fn from(v: i64) -> Self {
        CborValue::Int(v)
    }
}

impl From<&str> for CborValue {
    fn from(s: &str) -> Self {
        CborValue::Text(s.to_string())
    }
}

impl From<String> for CborValue {
    fn from(s: String) -> Self {
        CborValue::Text(s)
    }
}

impl From<Vec<u8>> for CborValue {
    fn from(b: Vec<u8>) -> Self {
        CborValue::Bytes(b)
    }
}

impl From<bool> for CborValue {
    fn from(b: bool) -> Self {
        CborValue::Bool(b)
    }
}

impl From<Vec<CborValue>> for CborValue {
    fn from(items: Vec<CborValue>) -> Self {
        CborValue::Array(items)
    }
}

/// Wraps an already-encoded item as a tag-24 byte string (embedded CBOR).
pub fn tag24(encoded: Vec<u8>) -> CborValue {
    CborValue::Tag(TAG_ENCODED_CBOR, Box::new(CborValue::Bytes(encoded)))
}

impl TryFrom<&Json> for CborValue {
    type Error = CborError;

    /// Converts a JSON value into an item. Fails on numbers outside the
    /// signed 64-bit integer range, including all floating values.
    fn try_from(value: &Json) -> Result<Self, CborError> {
        match value {
            Json::Null => Ok(CborValue::Null),
            Json::Bool(b) => Ok(CborValue::Bool(*b)),
            Json::Number(n) => n
                .as_i64()
                .map(CborValue::Int)
                .ok_or(CborError::UnsupportedNumber),
            Json::String(s) => Ok(CborValue::Text(s.clone())),
            Json::Array(items) => items
                .iter()
                .map(CborValue::try_from)
                .collect::<Result<Vec<_>, _>>()
                .map(CborValue::Array),
            Json::Object(fields) => fields
                .iter()
                .map(|(k, v)| Ok((CborValue::Text(k.clone()), CborValue::try_from(v)?)))
                .collect::<Result<Vec<_>, _>>()
                .map(CborValue::Map),
        }
    }
}

/// Encodes an item into its binary form.
///
/// Map entries are written in their stored (insertion) order. This is a
/// known deviation from canonical CBOR key sorting, kept so that output
/// stays byte-compatible with verifiers that compare whole encodings.
pub fn encode(value: &CborValue) -> Result<Vec<u8>, CborError> {
    let mut out = Vec::new();
    encode_into(value, &mut out)?;
    Ok(out)
}

fn encode_into(value: &CborValue, out: &mut Vec<u8>) -> Result<(), CborError> {
    match value {
        CborValue::Int(v) if *v >= 0 => header(MAJOR_UNSIGNED, *v as u64, out),
        CborValue::Int(v) => header(MAJOR_NEGATIVE, (-1 - *v) as u64, out),
        CborValue::Bytes(bytes) => {
            header(MAJOR_BYTES, bytes.len() as u64, out)?;
            out.extend_from_slice(bytes);
            Ok(())
        }
        CborValue::Text(text) => {
            header(MAJOR_TEXT, text.len() as u64, out)?;
            out.extend_from_slice(text.as_bytes());
            Ok(())
        }
        CborValue::Array(items) => {
            header(MAJOR_ARRAY, items.len() as u64, out)?;
            for item in items {
                encode_into(item, out)?;
            }
            Ok(())
        }
        CborValue::Map(entries) => {
            header(MAJOR_MAP, entries.len() as u64, out)?;
            for (key, item) in entries {
                encode_into(key, out)?;
                encode_into(item, out)?;
            }
            Ok(())
        }
        CborValue::Tag(tag, item) => {
            header(MAJOR_TAG, *tag, out)?;
            encode_into(item, out)
        }
        CborValue::Bool(b) => header(
            MAJOR_SIMPLE,
            if *b { SIMPLE_TRUE } else { SIMPLE_FALSE },
            out,
        ),
        CborValue::Null => header(MAJOR_SIMPLE, SIMPLE_NULL, out),
    }
}

/// Writes the initial byte plus the shortest admissible argument encoding.
fn header(major: u8, arg: u64, out: &mut Vec<u8>) -> Result<(), CborError> {
    let shifted = major << 5;
    if arg < 24 {
        out.push(shifted | arg as u8);
    } else if arg <= 0xff {
        out.push(shifted | 24);
        out.push(arg as u8);
    } else if arg <= 0xffff {
        out.push(shifted | 25);
        out.extend_from_slice(&(arg as u16).to_be_bytes());
    } else if arg <= 0xffff_ffff {
        out.push(shifted | 26);
        out.extend_from_slice(&(arg as u32).to_be_bytes());
    } else {
        // There is no 8-byte argument form on this wire.
        return Err(CborError::ArgumentOutOfRange(arg));
    }
    Ok(())
}

/// Decodes a complete item from `bytes`.
///
/// The buffer must contain exactly one item: trailing bytes are rejected,
/// and no length may extend past the end of the input.
pub fn decode(bytes: &[u8]) -> Result<CborValue, CborError> {
    let mut reader = Reader { buf: bytes, pos: 0 };
    let value = reader.item()?;
    if reader.pos != bytes.len() {
        return Err(CborError::TrailingBytes(bytes.len() - reader.pos));
    }
    Ok(value)
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl Reader<'_> {
    fn byte(&mut self) -> Result<u8, CborError> {
        let b = *self
            .buf
            .get(self.pos)
            .ok_or(CborError::UnexpectedEnd(self.pos))?;
        self.pos += 1;
        Ok(b)
    }

    fn take(&mut self, len: u64) -> Result<&[u8], CborError> {
        let len = usize::try_from(len).map_err(|_| CborError::UnexpectedEnd(self.pos))?;
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.buf.len())
            .ok_or(CborError::UnexpectedEnd(self.pos))?;
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    /// Reads the argument for an initial byte: direct values below 24, or a
    /// 1-, 2- or 4-byte big-endian follow-on. Argument code 27 (8-byte) and
    /// the reserved/indefinite codes are unsupported.
    fn argument(&mut self, initial: u8) -> Result<u64, CborError> {
        let code = initial & 0x1f;
        match code {
            0..=23 => Ok(code as u64),
            24 => Ok(self.byte()? as u64),
            25 => {
                let raw = self.take(2)?;
                Ok(u16::from_be_bytes([raw[0], raw[1]]) as u64)
            }
            26 => {
                let raw = self.take(4)?;
                Ok(u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]) as u64)
            }
            _ => Err(CborError::UnsupportedArgument(code)),
        }
    }

    fn item(&mut self) -> Result<CborValue, CborError> {
        let initial = self.byte()?;
        match initial >> 5 {
            MAJOR_UNSIGNED => Ok(CborValue::Int(self.argument(initial)? as i64)),
            MAJOR_NEGATIVE => Ok(CborValue::Int(-1 - self.argument(initial)? as i64)),
            MAJOR_BYTES => {
                let len = self.argument(initial)?;
                Ok(CborValue::Bytes(self.take(len)?.to_vec()))
            }
            MAJOR_TEXT => {
                let len = self.argument(initial)?;
                let raw = self.take(len)?.to_vec();
                String::from_utf8(raw)
                    .map(CborValue::Text)
                    .map_err(|_| CborError::InvalidUtf8)
            }
            MAJOR_ARRAY => {
                let len = self.argument(initial)?;
                let mut items = Vec::new();
                for _ in 0..len {
                    items.push(self.item()?);
                }
                Ok(CborValue::Array(items))
            }
            MAJOR_MAP => {
                let len = self.argument(initial)?;
                let mut entries: Vec<(CborValue, CborValue)> = Vec::new();
                for _ in 0..len {
                    let key = self.item()?;
                    let value = self.item()?;
                    // A later duplicate overwrites the earlier value but the
                    // key keeps its first position.
                    match entries.iter_mut().find(|(k, _)| *k == key) {
                        Some(entry) => entry.1 = value,
                        None => entries.push((key, value)),
                    }
                }
                Ok(CborValue::Map(entries))
            }
            MAJOR_TAG => {
                let tag = self.argument(initial)?;
                Ok(CborValue::Tag(tag, Box::new(self.item()?)))
            }
            MAJOR_SIMPLE => match self.argument(initial)? {
                SIMPLE_FALSE => Ok(CborValue::Bool(false)),
                SIMPLE_TRUE => Ok(CborValue::Bool(true)),
                SIMPLE_NULL => Ok(CborValue::Null),
                other => Err(CborError::UnsupportedSimple(other)),
            },
            _ => unreachable!("major type is three bits"),
        }
    }
}
