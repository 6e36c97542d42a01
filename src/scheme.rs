//! Scheme formats: structured-data serialization for statements, headers
//! and `Scheme` payloads.
//!
//! Three wire formats are supported — JSON, YAML and TOML — identified by
//! name in the peer statement. [`serde_json::Value`] is the interchange
//! type on both sides of the boundary, so values parsed from any format can
//! be re-emitted in any other.
//!
//! Statements are allowed to arrive in a format the receiver has not
//! negotiated yet, so [`SchemeFormat::detect`] sniffs the format from the
//! leading bytes.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{CatsError, Result};

/// A structured-data wire format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SchemeFormat {
    Json,
    Yaml,
    Toml,
}

impl Default for SchemeFormat {
    fn default() -> Self {
        Self::Json
    }
}

impl SchemeFormat {
    /// Canonical name as used in statements.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Json => "JSON",
            Self::Yaml => "YAML",
            Self::Toml => "TOML",
        }
    }

    /// Parse a statement-style format name (case-insensitive).
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_uppercase().as_str() {
            "JSON" => Some(Self::Json),
            "YAML" => Some(Self::Yaml),
            "TOML" => Some(Self::Toml),
            _ => None,
        }
    }

    /// Guess the format of `buff` from its leading bytes.
    ///
    /// `{` or `[` mean JSON; a `%` directive, document marker `---` or a
    /// `key:` first line mean YAML; everything else is treated as TOML
    /// (`key = value`).
    pub fn detect(buff: &[u8]) -> Self {
        let text = String::from_utf8_lossy(buff);
        let trimmed = text.trim_start();
        match trimmed.as_bytes().first() {
            Some(b'{') | Some(b'[') => return Self::Json,
            Some(b'%') => return Self::Yaml,
            _ => {}
        }
        if trimmed.starts_with("---") {
            return Self::Yaml;
        }
        if let Some(line) = trimmed.lines().next() {
            if line.contains(':') && !line.contains('=') {
                return Self::Yaml;
            }
        }
        Self::Toml
    }

    /// Serialize `data` into this format.
    pub fn dumps(&self, data: &Value) -> Result<Vec<u8>> {
        match self {
            Self::Json => {
                serde_json::to_vec(data).map_err(|e| CatsError::Scheme(e.to_string()))
            }
            Self::Yaml => {
                let text =
                    serde_yaml::to_string(data).map_err(|e| CatsError::Scheme(e.to_string()))?;
                Ok(text.trim_end_matches('\n').as_bytes().to_vec())
            }
            Self::Toml => {
                let text = toml::to_string(data).map_err(|e| CatsError::Scheme(e.to_string()))?;
                Ok(text.into_bytes())
            }
        }
    }

    /// Deserialize `buff` from this format.
    pub fn loads(&self, buff: &[u8]) -> Result<Value> {
        match self {
            Self::Json => {
                serde_json::from_slice(buff).map_err(|e| CatsError::Scheme(e.to_string()))
            }
            Self::Yaml => {
                serde_yaml::from_slice(buff).map_err(|e| CatsError::Scheme(e.to_string()))
            }
            Self::Toml => {
                let text = std::str::from_utf8(buff)
                    .map_err(|e| CatsError::Scheme(format!("invalid utf-8: {e}")))?;
                toml::from_str(text).map_err(|e| CatsError::Scheme(e.to_string()))
            }
        }
    }
}

/// Detect the format of `buff` and parse it.
///
/// Used for inbound statements, where the sender's format is not yet known.
/// Returns the parsed value together with the detected format so the caller
/// can remember it for replies.
pub fn loads_detect(buff: &[u8]) -> Result<(Value, SchemeFormat)> {
    let format = SchemeFormat::detect(buff);
    match format.loads(buff) {
        Ok(value) => Ok((value, format)),
        // The heuristic can misfire on hand-written statements; fall back
        // to trying the remaining formats before giving up.
        Err(first_err) => {
            for fallback in [SchemeFormat::Json, SchemeFormat::Yaml, SchemeFormat::Toml] {
                if fallback == format {
                    continue;
                }
                if let Ok(value) = fallback.loads(buff) {
                    return Ok((value, fallback));
                }
            }
            Err(first_err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_detect_json() {
        assert_eq!(SchemeFormat::detect(b"{\"a\": 1}"), SchemeFormat::Json);
        assert_eq!(SchemeFormat::detect(b"  [1, 2, 3]"), SchemeFormat::Json);
    }

    #[test]
    fn test_detect_yaml() {
        assert_eq!(SchemeFormat::detect(b"---\na: 1"), SchemeFormat::Yaml);
        assert_eq!(SchemeFormat::detect(b"%YAML 1.2\n---\na: 1"), SchemeFormat::Yaml);
        assert_eq!(SchemeFormat::detect(b"api: 1\nclient_time: 5"), SchemeFormat::Yaml);
    }

    #[test]
    fn test_detect_toml() {
        assert_eq!(SchemeFormat::detect(b"api = 1\n"), SchemeFormat::Toml);
    }

    #[test]
    fn test_json_roundtrip() {
        let value = json!({"api": 1, "compressors": ["gzip", "zlib"]});
        let buff = SchemeFormat::Json.dumps(&value).unwrap();
        assert_eq!(SchemeFormat::Json.loads(&buff).unwrap(), value);
    }

    #[test]
    fn test_yaml_roundtrip() {
        let value = json!({"api": 1, "nested": {"key": "value"}});
        let buff = SchemeFormat::Yaml.dumps(&value).unwrap();
        // No trailing document markers or newlines.
        assert!(!buff.ends_with(b"\n"));
        assert_eq!(SchemeFormat::Yaml.loads(&buff).unwrap(), value);
    }

    #[test]
    fn test_toml_roundtrip() {
        let value = json!({"api": 1, "scheme_format": "JSON"});
        let buff = SchemeFormat::Toml.dumps(&value).unwrap();
        assert_eq!(SchemeFormat::Toml.loads(&buff).unwrap(), value);
    }

    #[test]
    fn test_loads_detect_remembers_format() {
        let (value, format) = loads_detect(b"api: 1\ncompressors: [zlib]").unwrap();
        assert_eq!(format, SchemeFormat::Yaml);
        assert_eq!(value["api"], json!(1));

        let (value, format) = loads_detect(b"{\"api\": 2}").unwrap();
        assert_eq!(format, SchemeFormat::Json);
        assert_eq!(value["api"], json!(2));
    }

    #[test]
    fn test_loads_detect_fallback() {
        // Flow-style YAML with a leading brace parses as JSON only if valid
        // JSON; otherwise the fallback chain should still find YAML.
        let (value, format) = loads_detect(b"{a: 1}").unwrap();
        assert_eq!(format, SchemeFormat::Yaml);
        assert_eq!(value["a"], json!(1));
    }

    #[test]
    fn test_name_mapping() {
        assert_eq!(SchemeFormat::from_name("json"), Some(SchemeFormat::Json));
        assert_eq!(SchemeFormat::from_name("YAML"), Some(SchemeFormat::Yaml));
        assert_eq!(SchemeFormat::from_name("Toml"), Some(SchemeFormat::Toml));
        assert_eq!(SchemeFormat::from_name("msgpack"), None);
        assert_eq!(SchemeFormat::Json.name(), "JSON");
    }
}
