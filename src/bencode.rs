//! Bencode codec.
//!
//! A strict parser and canonical serializer for the bencode format used by
//! metainfo files, tracker replies and the extension protocol. Values form
//! a small sum type; dictionaries keep raw byte-string keys in sorted order
//! so re-serialization is canonical.
//!
//! The parser also records the byte span of the top-level `info` value when
//! present, so the caller can hash the exact encoded bytes (the info-hash
//! must be computed over the original encoding, not a re-serialization).

use crate::error::{BtError, BtResult};
use std::collections::BTreeMap;
use std::ops::Range;

/// A parsed bencode value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Int(i64),
    Bytes(Vec<u8>),
    List(Vec<Value>),
    Dict(BTreeMap<Vec<u8>, Value>),
}

impl Value {
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Bytes(v) => std::str::from_utf8(v).ok(),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_dict(&self) -> Option<&BTreeMap<Vec<u8>, Value>> {
        match self {
            Value::Dict(v) => Some(v),
            _ => None,
        }
    }

    /// Dictionary lookup by string key.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.as_dict().and_then(|d| d.get(key.as_bytes()))
    }

    pub fn get_int(&self, key: &str) -> Option<i64> {
        self.get(key).and_then(Value::as_int)
    }

    pub fn get_bytes(&self, key: &str) -> Option<&[u8]> {
        self.get(key).and_then(Value::as_bytes)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(Value::as_str)
    }

    pub fn get_list(&self, key: &str) -> Option<&[Value]> {
        self.get(key).and_then(Value::as_list)
    }

    pub fn get_dict(&self, key: &str) -> Option<&Value> {
        self.get(key).filter(|v| matches!(v, Value::Dict(_)))
    }

    /// Serialize to the canonical bencode encoding.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.encode_into(&mut out);
        out
    }

    fn encode_into(&self, out: &mut Vec<u8>) {
        match self {
            Value::Int(v) => {
                out.push(b'i');
                out.extend_from_slice(v.to_string().as_bytes());
                out.push(b'e');
            }
            Value::Bytes(v) => {
                out.extend_from_slice(v.len().to_string().as_bytes());
                out.push(b':');
                out.extend_from_slice(v);
            }
            Value::List(items) => {
                out.push(b'l');
                for item in items {
                    item.encode_into(out);
                }
                out.push(b'e');
            }
            Value::Dict(map) => {
                out.push(b'd');
                for (key, val) in map {
                    out.extend_from_slice(key.len().to_string().as_bytes());
                    out.push(b':');
                    out.extend_from_slice(key);
                    val.encode_into(out);
                }
                out.push(b'e');
            }
        }
    }
}

/// Builder helpers for the handful of dictionaries the engine emits
/// (extension handshake, metadata requests).
pub fn dict(entries: Vec<(&str, Value)>) -> Value {
    let mut map = BTreeMap::new();
    for (key, val) in entries {
        map.insert(key.as_bytes().to_vec(), val);
    }
    Value::Dict(map)
}

/// A parsed document plus the byte range of the top-level `info` value,
/// if the document is a dictionary containing one.
#[derive(Debug, Clone)]
pub struct Document {
    pub root: Value,
    pub info_span: Option<Range<usize>>,
}

/// Parse a complete bencode document. Trailing bytes after the first value
/// are rejected.
pub fn parse(data: &[u8]) -> BtResult<Value> {
    let doc = parse_document(data)?;
    Ok(doc.root)
}

/// Parse a document, additionally capturing the `info` span.
pub fn parse_document(data: &[u8]) -> BtResult<Document> {
    let mut parser = Parser {
        data,
        pos: 0,
        depth: 0,
        info_span: None,
    };
    let root = parser.value()?;
    if parser.pos != data.len() {
        return Err(BtError::Bencode(format!(
            "trailing bytes at offset {}",
            parser.pos
        )));
    }
    Ok(Document {
        root,
        info_span: parser.info_span,
    })
}

/// Parse one value from the front of `data`, returning the value and the
/// number of bytes consumed. Used by the extension protocol where a raw
/// payload follows the bencoded header.
pub fn parse_prefix(data: &[u8]) -> BtResult<(Value, usize)> {
    let mut parser = Parser {
        data,
        pos: 0,
        depth: 0,
        info_span: None,
    };
    let value = parser.value()?;
    Ok((value, parser.pos))
}

const MAX_DEPTH: usize = 32;

struct Parser<'a> {
    data: &'a [u8],
    pos: usize,
    depth: usize,
    info_span: Option<Range<usize>>,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> BtResult<u8> {
        self.data
            .get(self.pos)
            .copied()
            .ok_or_else(|| BtError::Bencode("unexpected end of input".into()))
    }

    fn value(&mut self) -> BtResult<Value> {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            return Err(BtError::Bencode("nesting too deep".into()));
        }
        let v = match self.peek()? {
            b'i' => self.int(),
            b'l' => self.list(),
            b'd' => self.dict(),
            b'0'..=b'9' => self.bytes().map(Value::Bytes),
            c => Err(BtError::Bencode(format!(
                "unexpected byte 0x{c:02x} at offset {}",
                self.pos
            ))),
        };
        self.depth -= 1;
        v
    }

    fn int(&mut self) -> BtResult<Value> {
        self.pos += 1; // 'i'
        let start = self.pos;
        while self.peek()? != b'e' {
            self.pos += 1;
        }
        let text = std::str::from_utf8(&self.data[start..self.pos])
            .map_err(|_| BtError::Bencode("non-ascii integer".into()))?;
        // "i-0e" and leading zeros are invalid per BEP-3
        if text.is_empty()
            || text == "-"
            || (text.len() > 1 && (text.starts_with('0') || text.starts_with("-0")))
        {
            return Err(BtError::Bencode(format!("invalid integer {text:?}")));
        }
        let value: i64 = text
            .parse()
            .map_err(|_| BtError::Bencode(format!("integer out of range {text:?}")))?;
        self.pos += 1; // 'e'
        Ok(Value::Int(value))
    }

    fn bytes(&mut self) -> BtResult<Vec<u8>> {
        let start = self.pos;
        while self.peek()? != b':' {
            if !self.peek()?.is_ascii_digit() {
                return Err(BtError::Bencode("bad string length".into()));
            }
            self.pos += 1;
        }
        let len: usize = std::str::from_utf8(&self.data[start..self.pos])
            .unwrap()
            .parse()
            .map_err(|_| BtError::Bencode("string length out of range".into()))?;
        self.pos += 1; // ':'
        if self.pos + len > self.data.len() {
            return Err(BtError::Bencode("string extends past end".into()));
        }
        let bytes = self.data[self.pos..self.pos + len].to_vec();
        self.pos += len;
        Ok(bytes)
    }

    fn list(&mut self) -> BtResult<Value> {
        self.pos += 1; // 'l'
        let mut items = Vec::new();
        while self.peek()? != b'e' {
            items.push(self.value()?);
        }
        self.pos += 1; // 'e'
        Ok(Value::List(items))
    }

    fn dict(&mut self) -> BtResult<Value> {
        let at_top = self.depth == 1;
        self.pos += 1; // 'd'
        let mut map = BTreeMap::new();
        while self.peek()? != b'e' {
            let key = self.bytes()?;
            let val_start = self.pos;
            let val = self.value()?;
            if at_top && key == b"info" {
                self.info_span = Some(val_start..self.pos);
            }
            map.insert(key, val);
        }
        self.pos += 1; // 'e'
        Ok(Value::Dict(map))
    }
}
