//! The `Files` payload: a manifest of file entries plus one concatenated
//! byte buffer.
//!
//! The manifest travels in the `Files` header as a list of
//! `{"key", "name", "size", "type"?}` objects; the payload proper is the
//! file bytes concatenated in list order. Applying an `Offset` trims the
//! skipped bytes from entry sizes in list order and drops entries whose
//! size reaches zero.

use std::path::PathBuf;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::{CatsError, Result};
use crate::headers::{known, Headers};
use crate::protocol::spool::{PayloadBuf, Spool};

/// One file in a `Files` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileEntry {
    /// Lookup key, unique within the payload.
    pub key: String,
    /// Original file name.
    pub name: String,
    /// Byte length of this file's slice of the payload.
    pub size: u64,
    /// MIME type, when the sender knows it.
    #[serde(rename = "type", skip_serializing_if = "Option::is_none", default)]
    pub mime: Option<String>,
}

/// A decoded (or to-be-encoded) multi-file payload.
#[derive(Debug, Clone)]
pub struct Files {
    entries: Vec<FileEntry>,
    data: PayloadBuf,
}

impl Files {
    /// Build from in-memory file contents; keys double as names.
    pub fn from_bytes<I, K>(items: I) -> Self
    where
        I: IntoIterator<Item = (K, Bytes)>,
        K: Into<String>,
    {
        Self::from_named_bytes(
            items
                .into_iter()
                .map(|(key, data)| {
                    let key = key.into();
                    (key.clone(), key, data, None)
                })
                .collect::<Vec<_>>(),
        )
    }

    /// Build from in-memory file contents with explicit names and MIME
    /// types.
    pub fn from_named_bytes<I>(items: I) -> Self
    where
        I: IntoIterator<Item = (String, String, Bytes, Option<String>)>,
    {
        let mut entries = Vec::new();
        let mut data = Vec::new();
        for (key, name, bytes, mime) in items {
            entries.push(FileEntry {
                key,
                name,
                size: bytes.len() as u64,
                mime,
            });
            data.extend_from_slice(&bytes);
        }
        Self {
            entries,
            data: PayloadBuf::from_vec(data),
        }
    }

    /// Build by reading files from disk, spooling past `threshold` bytes.
    /// Keys and names come from the file names.
    pub async fn from_paths<I>(paths: I, threshold: usize) -> Result<Self>
    where
        I: IntoIterator<Item = PathBuf>,
    {
        let mut entries = Vec::new();
        let mut spool = Spool::new(threshold);
        for path in paths {
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .ok_or_else(|| CatsError::Codec(format!("not a file path: {}", path.display())))?;
            let meta = tokio::fs::metadata(&path).await?;
            entries.push(FileEntry {
                key: name.clone(),
                name,
                size: meta.len(),
                mime: None,
            });
            let mut file = tokio::fs::File::open(&path).await?;
            let mut chunk = vec![0u8; 1 << 20];
            loop {
                let n = tokio::io::AsyncReadExt::read(&mut file, &mut chunk).await?;
                if n == 0 {
                    break;
                }
                spool.write(&chunk[..n]).await?;
            }
        }
        Ok(Self {
            entries,
            data: spool.finish().await?,
        })
    }

    pub fn entries(&self) -> &[FileEntry] {
        &self.entries
    }

    /// Sum of all entry sizes; equals the payload length.
    pub fn total_size(&self) -> u64 {
        self.entries.iter().map(|e| e.size).sum()
    }

    /// Whether the payload is backed by a temp file rather than memory.
    pub fn is_spooled(&self) -> bool {
        self.data.is_disk()
    }

    /// Read one file's bytes by key.
    pub async fn read(&self, key: &str) -> Result<Bytes> {
        let mut offset = 0u64;
        for entry in &self.entries {
            if entry.key == key {
                return self.data.read_range(offset, entry.size).await;
            }
            offset += entry.size;
        }
        Err(CatsError::Codec(format!("no file with key {key:?}")))
    }

    /// Encode for sending: record the manifest in `headers` (with `offset`
    /// bytes trimmed off the front) and return the remaining payload.
    pub(crate) fn encode(&self, headers: &mut Headers, offset: u64) -> Result<PayloadBuf> {
        let mut remaining = offset;
        let mut manifest = Vec::with_capacity(self.entries.len());
        for entry in &self.entries {
            let skip = remaining.min(entry.size);
            remaining -= skip;
            let size = entry.size - skip;
            if size == 0 && skip > 0 {
                continue;
            }
            manifest.push(FileEntry {
                size,
                ..entry.clone()
            });
        }
        if remaining > 0 {
            return Err(CatsError::Codec(format!(
                "offset {offset} exceeds Files payload size {}",
                self.total_size()
            )));
        }
        let value = serde_json::to_value(&manifest)
            .map_err(|e| CatsError::Codec(format!("files manifest: {e}")))?;
        headers.insert(known::FILES, value);
        self.data.clone().tail(offset)
    }

    /// Decode a received payload against the `Files` header manifest.
    pub(crate) fn decode(headers: &Headers, data: PayloadBuf) -> Result<Self> {
        let manifest = headers.get(known::FILES).ok_or_else(|| {
            CatsError::Malformed("Files payload without a Files header".into())
        })?;
        let entries: Vec<FileEntry> = serde_json::from_value(manifest.clone())
            .map_err(|e| CatsError::Malformed(format!("Files header: {e}")))?;
        let expected: u64 = entries.iter().map(|e| e.size).sum();
        if expected != data.len() {
            return Err(CatsError::Malformed(format!(
                "Files manifest declares {expected} bytes, payload carries {}",
                data.len()
            )));
        }
        Ok(Self { entries, data })
    }
}
