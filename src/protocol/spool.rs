//! Spill-over payload buffers.
//!
//! Inbound payload bytes accumulate in memory until the configured
//! threshold, then spill to an unlinked temp file. The resulting
//! [`PayloadBuf`] is what the codec layer decodes; only `Files` payloads
//! are ever allowed to reach the disk-backed state.

use std::io::Read;
use std::path::Path;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use tempfile::{NamedTempFile, TempPath};
use tokio::io::AsyncWriteExt;

use crate::compress::{self, Compressor, CompressorSet};
use crate::error::{CatsError, Result};
use crate::headers::{known, Headers};

/// A fully-received payload blob, in memory or spooled to disk.
///
/// Disk blobs carry a `start` offset so the `Offset` header can trim a
/// prefix without rewriting the temp file.
#[derive(Debug, Clone)]
pub(crate) enum PayloadBuf {
    Mem(Bytes),
    Disk {
        path: Arc<TempPath>,
        start: u64,
        len: u64,
    },
}

impl PayloadBuf {
    pub fn empty() -> Self {
        Self::Mem(Bytes::new())
    }

    pub fn from_vec(data: Vec<u8>) -> Self {
        Self::Mem(Bytes::from(data))
    }

    pub fn len(&self) -> u64 {
        match self {
            Self::Mem(b) => b.len() as u64,
            Self::Disk { len, .. } => *len,
        }
    }

    pub fn is_disk(&self) -> bool {
        matches!(self, Self::Disk { .. })
    }

    /// Drop the first `skip` bytes of the blob.
    pub fn tail(self, skip: u64) -> Result<Self> {
        if skip > self.len() {
            return Err(CatsError::Codec(format!(
                "offset {skip} exceeds payload length {}",
                self.len()
            )));
        }
        Ok(match self {
            Self::Mem(b) => Self::Mem(b.slice(skip as usize..)),
            Self::Disk { path, start, len } => Self::Disk {
                path,
                start: start + skip,
                len: len - skip,
            },
        })
    }

    /// Load the whole blob into memory. Cheap for the `Mem` state.
    pub async fn read_bytes(&self) -> Result<Bytes> {
        self.read_range(0, self.len()).await
    }

    /// Read `len` bytes starting at `offset`. Slices in memory; seeks on
    /// disk.
    pub async fn read_range(&self, offset: u64, len: u64) -> Result<Bytes> {
        if offset + len > self.len() {
            return Err(CatsError::Codec(format!(
                "range {offset}+{len} out of payload bounds {}",
                self.len()
            )));
        }
        match self {
            Self::Mem(b) => Ok(b.slice(offset as usize..(offset + len) as usize)),
            Self::Disk { path, start, .. } => {
                use std::io::{Seek, SeekFrom};
                let path = path.clone();
                let from = start + offset;
                let data = tokio::task::spawn_blocking(move || -> Result<Vec<u8>> {
                    let mut file = std::fs::File::open(&**path)?;
                    file.seek(SeekFrom::Start(from))?;
                    let mut out = vec![0u8; len as usize];
                    file.read_exact(&mut out)?;
                    Ok(out)
                })
                .await
                .map_err(|e| CatsError::Codec(format!("read task failed: {e}")))??;
                Ok(Bytes::from(data))
            }
        }
    }
}

/// Accumulates inbound payload bytes, spilling to a temp file past the
/// threshold.
pub(crate) struct Spool {
    threshold: usize,
    state: SpoolState,
    len: u64,
}

enum SpoolState {
    Mem(BytesMut),
    Disk {
        file: tokio::fs::File,
        path: TempPath,
    },
}

impl Spool {
    pub fn new(threshold: usize) -> Self {
        Self {
            threshold,
            state: SpoolState::Mem(BytesMut::new()),
            len: 0,
        }
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub async fn write(&mut self, chunk: &[u8]) -> Result<()> {
        if let SpoolState::Mem(buff) = &mut self.state {
            if buff.len() + chunk.len() > self.threshold {
                let (std_file, path) = NamedTempFile::new()?.into_parts();
                let mut file = tokio::fs::File::from_std(std_file);
                file.write_all(buff).await?;
                self.state = SpoolState::Disk { file, path };
            }
        }
        match &mut self.state {
            SpoolState::Mem(buff) => buff.extend_from_slice(chunk),
            SpoolState::Disk { file, .. } => file.write_all(chunk).await?,
        }
        self.len += chunk.len() as u64;
        Ok(())
    }

    /// Append the contents of a file (used for decompressed stream chunks).
    pub async fn append_file(&mut self, src: &Path) -> Result<()> {
        let mut reader = tokio::fs::File::open(src).await?;
        let mut chunk = vec![0u8; 1 << 20];
        loop {
            let n = tokio::io::AsyncReadExt::read(&mut reader, &mut chunk).await?;
            if n == 0 {
                return Ok(());
            }
            self.write(&chunk[..n]).await?;
        }
    }

    pub async fn finish(self) -> Result<PayloadBuf> {
        match self.state {
            SpoolState::Mem(buff) => Ok(PayloadBuf::Mem(buff.freeze())),
            SpoolState::Disk { mut file, path } => {
                file.flush().await?;
                drop(file);
                Ok(PayloadBuf::Disk {
                    path: Arc::new(path),
                    start: 0,
                    len: self.len,
                })
            }
        }
    }
}

/// Compress an outbound payload blob, preserving its memory/disk state.
pub(crate) async fn compress_buf(
    buf: PayloadBuf,
    headers: &mut Headers,
    set: &CompressorSet,
    explicit: Option<Compressor>,
    data_type: u8,
) -> Result<(PayloadBuf, Compressor)> {
    match buf {
        PayloadBuf::Mem(data) => {
            let (packed, used) = compress::compress(&data, headers, set, explicit, data_type)?;
            Ok((PayloadBuf::from_vec(packed), used))
        }
        PayloadBuf::Disk { path, start, len } => {
            let compressor =
                explicit.unwrap_or_else(|| compress::propose(len, data_type, headers, set.default_compressor()));
            if !set.allows(compressor) {
                return Err(CatsError::Compressor(format!(
                    "compression unsupported by peer: {}",
                    compressor.name()
                )));
            }
            let (dst_file, dst_path) = NamedTempFile::new()?.into_parts();
            drop(dst_file);
            let src = path.clone();
            let dst = dst_path.to_path_buf();
            let adler = tokio::task::spawn_blocking(move || {
                compress::compress_file(&src, start, &dst, compressor)
            })
            .await
            .map_err(|e| CatsError::Compressor(format!("compress task failed: {e}")))??;
            if let Some(adler) = adler {
                headers.insert(known::ADLER32, adler);
            }
            let len = std::fs::metadata(&dst_path)?.len();
            Ok((
                PayloadBuf::Disk {
                    path: Arc::new(dst_path),
                    start: 0,
                    len,
                },
                compressor,
            ))
        }
    }
}

/// Decompress an inbound payload blob, preserving its memory/disk state.
pub(crate) async fn decompress_buf(
    buf: PayloadBuf,
    headers: &Headers,
    compressor: Compressor,
) -> Result<PayloadBuf> {
    match buf {
        PayloadBuf::Mem(data) => {
            let plain = compress::decompress(&data, headers, compressor)?;
            Ok(PayloadBuf::from_vec(plain))
        }
        PayloadBuf::Disk { path, .. } => {
            let expected = headers
                .get(known::ADLER32)
                .and_then(|v| v.as_u64())
                .map(|v| v as u32);
            let (dst_file, dst_path) = NamedTempFile::new()?.into_parts();
            drop(dst_file);
            let src = path.clone();
            let dst = dst_path.to_path_buf();
            tokio::task::spawn_blocking(move || {
                compress::decompress_file(&src, &dst, compressor, expected)
            })
            .await
            .map_err(|e| CatsError::Compressor(format!("decompress task failed: {e}")))??;
            let len = std::fs::metadata(&dst_path)?.len();
            Ok(PayloadBuf::Disk {
                path: Arc::new(dst_path),
                start: 0,
                len,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_spool_stays_in_memory_below_threshold() {
        let mut spool = Spool::new(1024);
        spool.write(b"hello").await.unwrap();
        spool.write(b" world").await.unwrap();
        assert_eq!(spool.len(), 11);
        let buf = spool.finish().await.unwrap();
        assert!(!buf.is_disk());
        assert_eq!(&buf.read_bytes().await.unwrap()[..], b"hello world");
    }

    #[tokio::test]
    async fn test_spool_spills_to_disk() {
        let mut spool = Spool::new(64);
        let chunk = vec![0xAB; 100];
        spool.write(&chunk).await.unwrap();
        spool.write(&chunk).await.unwrap();
        let buf = spool.finish().await.unwrap();
        assert!(buf.is_disk());
        assert_eq!(buf.len(), 200);
        let data = buf.read_bytes().await.unwrap();
        assert_eq!(data.len(), 200);
        assert!(data.iter().all(|&b| b == 0xAB));
    }

    #[tokio::test]
    async fn test_read_range() {
        let mut spool = Spool::new(8);
        spool.write(b"0123456789abcdef").await.unwrap();
        let buf = spool.finish().await.unwrap();
        assert!(buf.is_disk());
        assert_eq!(&buf.read_range(4, 6).await.unwrap()[..], b"456789");
        assert!(buf.read_range(10, 10).await.is_err());
    }

    #[tokio::test]
    async fn test_compress_buf_roundtrip_disk() {
        let set = CompressorSet::from_names(
            &["gzip".to_string(), "zlib".to_string()],
            Some("zlib"),
        );
        let mut spool = Spool::new(128);
        let data = b"squeeze me ".repeat(1000);
        spool.write(&data).await.unwrap();
        let plain = spool.finish().await.unwrap();
        assert!(plain.is_disk());

        let mut headers = Headers::new();
        let (packed, used) = compress_buf(plain, &mut headers, &set, None, crate::codec::T_FILES)
            .await
            .unwrap();
        assert_eq!(used, Compressor::Zlib);
        assert!(packed.len() < data.len() as u64);

        let restored = decompress_buf(packed, &headers, used).await.unwrap();
        assert_eq!(&restored.read_bytes().await.unwrap()[..], &data[..]);
    }
}
