//! Payload codecs: the interpretations of payload bytes identified by the
//! one-byte `data_type` field.
//!
//! | id | codec | payload |
//! |----|-------|---------|
//! | `0x00` | Binary | opaque bytes |
//! | `0x01` | Scheme | structured value in the negotiated scheme format |
//! | `0x02` | Files | manifest + concatenated file bytes |
//! | `0x03` | ByteScheme | packed byte struct |
//!
//! On encode the codec is picked from the payload's shape; on decode the
//! `data_type` from the action head selects the codec. The `Offset` header
//! is applied at this boundary: encoded bytes before the offset are never
//! emitted.

mod files;

pub use files::{FileEntry, Files};

use bytes::Bytes;
use serde_json::Value;

use crate::error::{CatsError, Result};
use crate::headers::Headers;
use crate::protocol::spool::PayloadBuf;
use crate::scheme::SchemeFormat;

/// Opaque bytes.
pub const T_BINARY: u8 = 0x00;
/// Structured value in the negotiated scheme format.
pub const T_SCHEME: u8 = 0x01;
/// Multi-file bundle.
pub const T_FILES: u8 = 0x02;
/// Packed byte struct.
pub const T_BYTE_SCHEME: u8 = 0x03;

/// Human-readable codec name for logs.
pub fn type_name(data_type: u8) -> &'static str {
    match data_type {
        T_BINARY => "bytes",
        T_SCHEME => "scheme",
        T_FILES => "files",
        T_BYTE_SCHEME => "byte-scheme",
        _ => "unknown",
    }
}

/// A decoded payload: the discriminated union carried by payload-bearing
/// actions.
#[derive(Debug, Clone)]
pub enum Payload {
    /// Opaque bytes (`0x00`).
    Binary(Bytes),
    /// Structured data (`0x01`), interchanged as JSON values.
    Scheme(Value),
    /// Multi-file bundle (`0x02`).
    Files(Files),
    /// Packed byte struct (`0x03`).
    ByteScheme(Bytes),
}

impl Payload {
    /// The wire `data_type` this payload encodes to.
    pub fn data_type(&self) -> u8 {
        match self {
            Self::Binary(_) => T_BINARY,
            Self::Scheme(_) => T_SCHEME,
            Self::Files(_) => T_FILES,
            Self::ByteScheme(_) => T_BYTE_SCHEME,
        }
    }

    /// An empty binary payload.
    pub fn empty() -> Self {
        Self::Binary(Bytes::new())
    }

    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            Self::Binary(b) | Self::ByteScheme(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_scheme(&self) -> Option<&Value> {
        match self {
            Self::Scheme(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_files(&self) -> Option<&Files> {
        match self {
            Self::Files(f) => Some(f),
            _ => None,
        }
    }
}

impl From<Bytes> for Payload {
    fn from(value: Bytes) -> Self {
        Self::Binary(value)
    }
}

impl From<Vec<u8>> for Payload {
    fn from(value: Vec<u8>) -> Self {
        Self::Binary(Bytes::from(value))
    }
}

impl From<&'static [u8]> for Payload {
    fn from(value: &'static [u8]) -> Self {
        Self::Binary(Bytes::from_static(value))
    }
}

impl From<Value> for Payload {
    fn from(value: Value) -> Self {
        Self::Scheme(value)
    }
}

impl From<Files> for Payload {
    fn from(value: Files) -> Self {
        Self::Files(value)
    }
}

/// Encode a payload for sending.
///
/// Returns the plain (pre-compression) bytes and the wire `data_type`.
/// `offset` bytes are dropped from the front of the encoding; for `Files`
/// the manifest in `headers` is adjusted to match.
pub(crate) fn encode(
    payload: &Payload,
    headers: &mut Headers,
    offset: u64,
    format: SchemeFormat,
) -> Result<(PayloadBuf, u8)> {
    let data_type = payload.data_type();
    let buf = match payload {
        Payload::Binary(data) | Payload::ByteScheme(data) => {
            PayloadBuf::Mem(data.clone()).tail(offset)?
        }
        Payload::Scheme(value) => {
            let encoded = format.dumps(value)?;
            PayloadBuf::from_vec(encoded).tail(offset)?
        }
        Payload::Files(files) => files.encode(headers, offset)?,
    };
    Ok((buf, data_type))
}

/// Decode a received (already decompressed) payload.
pub(crate) async fn decode(
    buf: PayloadBuf,
    data_type: u8,
    headers: &Headers,
    format: SchemeFormat,
) -> Result<Payload> {
    match data_type {
        T_BINARY => Ok(Payload::Binary(buf.read_bytes().await?)),
        T_BYTE_SCHEME => Ok(Payload::ByteScheme(buf.read_bytes().await?)),
        T_SCHEME => {
            let data = buf.read_bytes().await?;
            if data.is_empty() {
                return Ok(Payload::Scheme(Value::Object(Default::default())));
            }
            let value = format
                .loads(&data)
                .map_err(|e| CatsError::Codec(format!("scheme payload: {e}")))?;
            Ok(Payload::Scheme(value))
        }
        T_FILES => Ok(Payload::Files(Files::decode(headers, buf)?)),
        other => Err(CatsError::Codec(format!(
            "unsupported data type {other:#04x}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn roundtrip(payload: Payload, format: SchemeFormat) -> Payload {
        let mut headers = Headers::new();
        let (buf, data_type) = encode(&payload, &mut headers, 0, format).unwrap();
        decode(buf, data_type, &headers, format).await.unwrap()
    }

    #[tokio::test]
    async fn test_binary_roundtrip() {
        let decoded = roundtrip(Payload::from(&b"hello"[..]), SchemeFormat::Json).await;
        assert_eq!(decoded.as_bytes().unwrap(), &Bytes::from_static(b"hello"));
        assert_eq!(decoded.data_type(), T_BINARY);
    }

    #[tokio::test]
    async fn test_scheme_roundtrip_all_formats() {
        let value = json!({"user": "fox", "level": 9});
        for format in [SchemeFormat::Json, SchemeFormat::Yaml, SchemeFormat::Toml] {
            let decoded = roundtrip(Payload::Scheme(value.clone()), format).await;
            assert_eq!(decoded.as_scheme().unwrap(), &value, "{format:?}");
        }
    }

    #[tokio::test]
    async fn test_byte_scheme_roundtrip() {
        let packed = Bytes::from_static(&[0x01, 0x00, 0xFF, 0x7A]);
        let decoded = roundtrip(Payload::ByteScheme(packed.clone()), SchemeFormat::Json).await;
        assert_eq!(decoded.data_type(), T_BYTE_SCHEME);
        assert_eq!(decoded.as_bytes().unwrap(), &packed);
    }

    #[tokio::test]
    async fn test_files_roundtrip_via_codec() {
        let files = Files::from_bytes([("report.txt", Bytes::from_static(b"contents"))]);
        let mut headers = Headers::new();
        let (buf, data_type) = encode(&files.into(), &mut headers, 0, SchemeFormat::Json).unwrap();
        assert_eq!(data_type, T_FILES);
        let decoded = decode(buf, data_type, &headers, SchemeFormat::Json)
            .await
            .unwrap();
        let files = decoded.as_files().unwrap();
        assert_eq!(&files.read("report.txt").await.unwrap()[..], b"contents");
    }

    #[tokio::test]
    async fn test_offset_applies_to_encoding() {
        let mut headers = Headers::new();
        let (buf, _) = encode(
            &Payload::from(&b"0123456789"[..]),
            &mut headers,
            4,
            SchemeFormat::Json,
        )
        .unwrap();
        assert_eq!(&buf.read_bytes().await.unwrap()[..], b"456789");
    }

    #[tokio::test]
    async fn test_offset_beyond_length_fails() {
        let mut headers = Headers::new();
        assert!(encode(
            &Payload::from(&b"abc"[..]),
            &mut headers,
            10,
            SchemeFormat::Json
        )
        .is_err());
    }

    #[tokio::test]
    async fn test_empty_scheme_decodes_to_empty_object() {
        let decoded = decode(
            PayloadBuf::empty(),
            T_SCHEME,
            &Headers::new(),
            SchemeFormat::Json,
        )
        .await
        .unwrap();
        assert_eq!(decoded.as_scheme().unwrap(), &json!({}));
    }

    #[tokio::test]
    async fn test_unknown_data_type() {
        let err = decode(
            PayloadBuf::empty(),
            0x7E,
            &Headers::new(),
            SchemeFormat::Json,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, CatsError::Codec(_)));
    }
}
