//! Statements: the opening self-description each peer sends after the
//! protocol-version exchange.
//!
//! A statement travels as a `u32` length prefix plus that many UTF-8 bytes
//! in the sender's scheme format. The receiver sniffs the format from the
//! leading bytes ([`crate::scheme::loads_detect`]) and remembers it; its
//! own statement reply follows the client's declared `scheme_format`.

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::compress::Compressor;
use crate::error::{CatsError, Result};
use crate::scheme::{loads_detect, SchemeFormat};

/// Sanity cap on statement size.
const MAX_STATEMENT_LEN: u32 = 64 * 1024;

/// The client's opening statement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientStatement {
    /// Application api version, used for handler lookup.
    pub api: u32,
    /// Client clock, milliseconds since the Unix epoch.
    pub client_time: u64,
    /// Format for scheme payloads and headers on this connection.
    pub scheme_format: SchemeFormat,
    /// Compressors the client accepts, in preference order.
    pub compressors: Vec<String>,
    /// Compressor the client prefers for large payloads.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub default_compression: Option<String>,
}

impl ClientStatement {
    /// Check the statement invariants: a non-empty compressor list whose
    /// entries are known, with the default (if named) among them.
    pub fn validate(&self) -> Result<()> {
        if self.compressors.is_empty() {
            return Err(CatsError::protocol("statement with no compressors"));
        }
        for name in &self.compressors {
            if Compressor::from_name(name).is_none() {
                return Err(CatsError::protocol(format!(
                    "statement names unknown compressor {name:?}"
                )));
            }
        }
        if let Some(default) = &self.default_compression {
            if !self
                .compressors
                .iter()
                .any(|c| c.eq_ignore_ascii_case(default))
            {
                return Err(CatsError::protocol(format!(
                    "default compression {default:?} is not among the offered compressors"
                )));
            }
        }
        Ok(())
    }

    /// Serialize with the length prefix, in `format`.
    pub fn pack(&self, format: SchemeFormat) -> Result<Vec<u8>> {
        pack_statement(self, format)
    }

    /// Parse a statement body, sniffing its format.
    pub fn unpack(buff: &[u8]) -> Result<(Self, SchemeFormat)> {
        unpack_statement(buff)
    }
}

/// The server's statement reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerStatement {
    /// Server clock, milliseconds since the Unix epoch, UTC.
    pub server_time: u64,
}

impl ServerStatement {
    pub fn pack(&self, format: SchemeFormat) -> Result<Vec<u8>> {
        pack_statement(self, format)
    }

    pub fn unpack(buff: &[u8]) -> Result<(Self, SchemeFormat)> {
        unpack_statement(buff)
    }
}

fn pack_statement<T: Serialize>(statement: &T, format: SchemeFormat) -> Result<Vec<u8>> {
    let value = serde_json::to_value(statement).map_err(|e| CatsError::Scheme(e.to_string()))?;
    let body = format.dumps(&value)?;
    let mut out = Vec::with_capacity(4 + body.len());
    out.extend_from_slice(&(body.len() as u32).to_be_bytes());
    out.extend_from_slice(&body);
    Ok(out)
}

fn unpack_statement<T: for<'de> Deserialize<'de>>(buff: &[u8]) -> Result<(T, SchemeFormat)> {
    let (value, format) =
        loads_detect(buff).map_err(|e| CatsError::protocol(format!("statement: {e}")))?;
    let statement = serde_json::from_value(value)
        .map_err(|e| CatsError::protocol(format!("statement: {e}")))?;
    Ok((statement, format))
}

/// Read a length-prefixed statement body off the stream.
pub(crate) async fn read_statement_body<R: AsyncRead + Unpin>(rd: &mut R) -> Result<Vec<u8>> {
    let len = rd.read_u32().await?;
    if len == 0 || len > MAX_STATEMENT_LEN {
        return Err(CatsError::protocol(format!("{len} byte statement")));
    }
    let mut body = vec![0u8; len as usize];
    rd.read_exact(&mut body).await?;
    Ok(body)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ClientStatement {
        ClientStatement {
            api: 1,
            client_time: 1_629_439_550_942,
            scheme_format: SchemeFormat::Json,
            compressors: vec!["gzip".into(), "zlib".into()],
            default_compression: Some("zlib".into()),
        }
    }

    #[test]
    fn test_pack_has_length_prefix() {
        let packed = sample().pack(SchemeFormat::Json).unwrap();
        let len = u32::from_be_bytes([packed[0], packed[1], packed[2], packed[3]]) as usize;
        assert_eq!(len, packed.len() - 4);
    }

    #[test]
    fn test_roundtrip_every_format() {
        for format in [SchemeFormat::Json, SchemeFormat::Yaml, SchemeFormat::Toml] {
            let packed = sample().pack(format).unwrap();
            let (parsed, detected) = ClientStatement::unpack(&packed[4..]).unwrap();
            assert_eq!(detected, format);
            assert_eq!(parsed.api, 1);
            assert_eq!(parsed.scheme_format, SchemeFormat::Json);
            assert_eq!(parsed.default_compression.as_deref(), Some("zlib"));
        }
    }

    #[test]
    fn test_yaml_statement_declaring_json_payloads() {
        // A YAML-encoded statement may still negotiate JSON payloads.
        let body = b"api: 1\nclient_time: 1629439550942\nscheme_format: JSON\ncompressors: [zlib]";
        let (parsed, detected) = ClientStatement::unpack(body).unwrap();
        assert_eq!(detected, SchemeFormat::Yaml);
        assert_eq!(parsed.scheme_format, SchemeFormat::Json);
        assert_eq!(parsed.compressors, vec!["zlib".to_string()]);
        assert_eq!(parsed.default_compression, None);
    }

    #[test]
    fn test_server_statement_roundtrip() {
        let statement = ServerStatement {
            server_time: 1_629_439_551_000,
        };
        let packed = statement.pack(SchemeFormat::Json).unwrap();
        let (parsed, _) = ServerStatement::unpack(&packed[4..]).unwrap();
        assert_eq!(parsed.server_time, 1_629_439_551_000);
    }

    #[test]
    fn test_validation() {
        let mut statement = sample();
        statement.validate().unwrap();

        statement.compressors.clear();
        assert!(statement.validate().is_err());

        let mut statement = sample();
        statement.default_compression = Some("brotli".into());
        assert!(statement.validate().is_err());

        let mut statement = sample();
        statement.compressors.push("snappy".into());
        assert!(statement.validate().is_err());
    }

    #[tokio::test]
    async fn test_read_statement_body() {
        let packed = sample().pack(SchemeFormat::Json).unwrap();
        let mut cursor = &packed[..];
        let body = read_statement_body(&mut cursor).await.unwrap();
        let (parsed, _) = ClientStatement::unpack(&body).unwrap();
        assert_eq!(parsed.api, 1);
    }

    #[tokio::test]
    async fn test_read_statement_rejects_oversize() {
        let mut frame = Vec::new();
        frame.extend_from_slice(&(10_000_000u32).to_be_bytes());
        let mut cursor = &frame[..];
        assert!(read_statement_body(&mut cursor).await.is_err());
    }
}
