//! Action headers: a small string-keyed mapping carried in front of every
//! payload-bearing action.
//!
//! Keys are canonicalized the same way on both sides (spaces become `-`,
//! words are title-cased) so `"content type"`, `"Content-Type"` and
//! `"content-type"` all address the same entry. Well-known headers get
//! typed accessors: `Status` (response status, default 200), `Offset`
//! (bytes the peer already possesses), `Files` (file-payload manifest) and
//! `Adler32` (zlib checksum).

use serde_json::{Map, Value};

use crate::error::{CatsError, Result};
use crate::scheme::SchemeFormat;

/// Well-known header names.
pub mod known {
    pub const STATUS: &str = "Status";
    pub const OFFSET: &str = "Offset";
    pub const FILES: &str = "Files";
    pub const ADLER32: &str = "Adler32";
}

/// Default response status when no `Status` header is present.
pub const DEFAULT_STATUS: u16 = 200;

/// Header mapping with canonicalized keys.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Headers(Map<String, Value>);

/// Canonicalize a header key: spaces to dashes, then title-case every
/// alphabetic run (`"adler32"` -> `"Adler32"`, `"content type"` ->
/// `"Content-Type"`).
fn canonical_key(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    let mut prev_alpha = false;
    for ch in key.chars() {
        let ch = if ch == ' ' { '-' } else { ch };
        if ch.is_alphabetic() {
            if prev_alpha {
                out.extend(ch.to_lowercase());
            } else {
                out.extend(ch.to_uppercase());
            }
            prev_alpha = true;
        } else {
            out.push(ch);
            prev_alpha = false;
        }
    }
    out
}

impl Headers {
    /// Create an empty header map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from raw entries, canonicalizing keys. Later duplicates win.
    pub fn from_map(map: Map<String, Value>) -> Self {
        let mut headers = Self::new();
        for (k, v) in map {
            headers.insert(&k, v);
        }
        headers
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(&canonical_key(key))
    }

    pub fn insert(&mut self, key: &str, value: impl Into<Value>) {
        self.0.insert(canonical_key(key), value.into());
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.0.remove(&canonical_key(key))
    }

    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(&canonical_key(key))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Response status; the `Status` header shadows the default 200.
    pub fn status(&self) -> u16 {
        self.get(known::STATUS)
            .and_then(Value::as_u64)
            .map(|s| s as u16)
            .unwrap_or(DEFAULT_STATUS)
    }

    pub fn set_status(&mut self, status: u16) {
        self.insert(known::STATUS, status);
    }

    /// Bytes the peer already possesses; 0 when the header is absent.
    pub fn offset(&self) -> u64 {
        self.get(known::OFFSET)
            .and_then(Value::as_u64)
            .unwrap_or(0)
    }

    pub fn set_offset(&mut self, offset: u64) {
        self.insert(known::OFFSET, offset);
    }

    /// Validate typed headers after decode. `Offset` must be a
    /// non-negative integer when present.
    fn validate(&self) -> Result<()> {
        if let Some(offset) = self.get(known::OFFSET) {
            if offset.as_u64().is_none() {
                return Err(CatsError::Malformed(format!(
                    "invalid Offset header: {offset}"
                )));
            }
        }
        Ok(())
    }

    /// Encode into the negotiated scheme format.
    pub fn encode(&self, format: SchemeFormat) -> Result<Vec<u8>> {
        format.dumps(&Value::Object(self.0.clone()))
    }

    /// Decode from the negotiated scheme format.
    pub fn decode(buff: &[u8], format: SchemeFormat) -> Result<Self> {
        if buff.is_empty() {
            return Ok(Self::new());
        }
        let value = format
            .loads(buff)
            .map_err(|e| CatsError::Malformed(format!("header block: {e}")))?;
        let map = match value {
            Value::Object(map) => map,
            other => {
                return Err(CatsError::Malformed(format!(
                    "headers must be a mapping, got {other}"
                )))
            }
        };
        let headers = Self::from_map(map);
        headers.validate()?;
        Ok(headers)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }
}

impl<K: AsRef<str>, V: Into<Value>> FromIterator<(K, V)> for Headers {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        let mut headers = Self::new();
        for (k, v) in iter {
            headers.insert(k.as_ref(), v);
        }
        headers
    }
}
