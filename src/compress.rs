//! Payload compression: `none`, `gzip` and `zlib` transforms plus the
//! heuristic that decides when compressing is worth it.
//!
//! The zlib transform is not a bare deflate stream: the `u32` length of the
//! plain data is prepended to the output and an `Adler32` header (checksum
//! of the plain data) is recorded so the receiver can detect truncation and
//! corruption independently of the deflate layer.

use std::io::{Read, Write};
use std::path::Path;

use flate2::read::{GzDecoder, ZlibDecoder};
use flate2::write::{GzEncoder, ZlibEncoder};
use flate2::Compression;

use crate::codec::T_FILES;
use crate::error::{CatsError, Result};
use crate::headers::{known, Headers};

/// Payloads below this many plain bytes are never compressed.
pub const COMPRESS_THRESHOLD: usize = 4096;

/// Compression level for both gzip and zlib.
const LEVEL: u32 = 6;

/// Read/write chunk size for file-to-file transforms.
const FILE_CHUNK: usize = 1 << 20;

/// MIME types that are already compressed; `Files` payloads made of these
/// are sent uncompressed.
const COMPRESSED_MIME: &[&str] = &[
    "application/gzip",
    "application/x-7z-compressed",
    "application/x-bzip2",
    "application/x-rar-compressed",
    "application/x-xz",
    "application/zip",
    "application/zstd",
    "audio/mpeg",
    "audio/ogg",
    "image/gif",
    "image/jpeg",
    "image/png",
    "image/webp",
    "video/mp4",
    "video/mpeg",
    "video/webm",
];

/// A reversible byte-to-byte transform identified by a one-byte id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Compressor {
    None,
    Gzip,
    Zlib,
}

impl Compressor {
    /// One-byte wire id.
    pub fn id(&self) -> u8 {
        match self {
            Self::None => 0x00,
            Self::Gzip => 0x01,
            Self::Zlib => 0x02,
        }
    }

    /// Look up a compressor by wire id.
    pub fn from_id(id: u8) -> Option<Self> {
        match id {
            0x00 => Some(Self::None),
            0x01 => Some(Self::Gzip),
            0x02 => Some(Self::Zlib),
            _ => None,
        }
    }

    /// Statement-style name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Gzip => "gzip",
            Self::Zlib => "zlib",
        }
    }

    /// Parse a statement-style name (case-insensitive).
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "none" | "dummy" => Some(Self::None),
            "gzip" => Some(Self::Gzip),
            "zlib" => Some(Self::Zlib),
            _ => None,
        }
    }
}

/// The compressors a peer advertised, plus its preferred default.
///
/// `none` is always allowed; the default falls back to `none` when the peer
/// named no usable preference.
#[derive(Debug, Clone)]
pub struct CompressorSet {
    allowed: Vec<Compressor>,
    default: Compressor,
}

impl CompressorSet {
    pub fn new(allowed: Vec<Compressor>, default: Option<Compressor>) -> Self {
        let mut allowed = allowed;
        if !allowed.contains(&Compressor::None) {
            allowed.push(Compressor::None);
        }
        let default = match default {
            Some(d) if allowed.contains(&d) => d,
            _ => Compressor::None,
        };
        Self { allowed, default }
    }

    /// Build from statement name lists, dropping unknown names.
    pub fn from_names(allowed: &[String], default: Option<&str>) -> Self {
        let list = allowed
            .iter()
            .filter_map(|n| Compressor::from_name(n))
            .collect();
        Self::new(list, default.and_then(Compressor::from_name))
    }

    pub fn allows(&self, compressor: Compressor) -> bool {
        self.allowed.contains(&compressor)
    }

    pub fn default_compressor(&self) -> Compressor {
        self.default
    }
}

impl Default for CompressorSet {
    fn default() -> Self {
        Self::new(vec![Compressor::None], None)
    }
}

/// Pick a compressor for a payload: small blobs and already-compressed
/// file bundles go plain, everything else uses the peer's default.
pub fn propose(plain_len: u64, data_type: u8, headers: &Headers, default: Compressor) -> Compressor {
    if plain_len <= COMPRESS_THRESHOLD as u64 {
        return Compressor::None;
    }
    if data_type == T_FILES && files_already_compressed(headers) {
        return Compressor::None;
    }
    default
}

fn files_already_compressed(headers: &Headers) -> bool {
    let Some(entries) = headers.get(known::FILES).and_then(|v| v.as_array()) else {
        return false;
    };
    !entries.is_empty()
        && entries.iter().all(|entry| {
            entry
                .get("type")
                .and_then(|v| v.as_str())
                .map(|mime| COMPRESSED_MIME.contains(&mime))
                .unwrap_or(false)
        })
}

/// Compress `buff` with `explicit` or a proposed compressor.
///
/// Returns the transformed bytes and the compressor actually used. Updates
/// `headers` with the `Adler32` checksum for zlib.
pub fn compress(
    buff: &[u8],
    headers: &mut Headers,
    set: &CompressorSet,
    explicit: Option<Compressor>,
    data_type: u8,
) -> Result<(Vec<u8>, Compressor)> {
    let compressor =
        explicit.unwrap_or_else(|| propose(buff.len() as u64, data_type, headers, set.default_compressor()));
    if !set.allows(compressor) {
        return Err(CatsError::Compressor(format!(
            "compression unsupported by peer: {}",
            compressor.name()
        )));
    }
    let out = match compressor {
        Compressor::None => buff.to_vec(),
        Compressor::Gzip => gzip_compress(buff)?,
        Compressor::Zlib => {
            headers.insert(known::ADLER32, adler32(buff));
            zlib_compress(buff)?
        }
    };
    Ok((out, compressor))
}

/// Reverse [`compress`]: the `compressor` comes from the action head, the
/// `Adler32` header (if any) is verified for zlib.
pub fn decompress(buff: &[u8], headers: &Headers, compressor: Compressor) -> Result<Vec<u8>> {
    match compressor {
        Compressor::None => Ok(buff.to_vec()),
        Compressor::Gzip => gzip_decompress(buff),
        Compressor::Zlib => {
            let expected = headers.get(known::ADLER32).and_then(|v| v.as_u64());
            zlib_decompress(buff, expected.map(|v| v as u32))
        }
    }
}

fn gzip_compress(buff: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::new(LEVEL));
    encoder
        .write_all(buff)
        .and_then(|_| encoder.finish())
        .map_err(|e| CatsError::Compressor(format!("gzip: {e}")))
}

fn gzip_decompress(buff: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    GzDecoder::new(buff)
        .read_to_end(&mut out)
        .map_err(|e| CatsError::Compressor(format!("gzip: {e}")))?;
    Ok(out)
}

fn zlib_compress(buff: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(buff.len() / 2 + 4);
    out.extend_from_slice(&(buff.len() as u32).to_be_bytes());
    let mut encoder = ZlibEncoder::new(out, Compression::new(LEVEL));
    encoder
        .write_all(buff)
        .and_then(|_| encoder.finish())
        .map_err(|e| CatsError::Compressor(format!("zlib: {e}")))
}

fn zlib_decompress(buff: &[u8], expected_adler: Option<u32>) -> Result<Vec<u8>> {
    if buff.len() < 4 {
        return Err(CatsError::Compressor(
            "zlib payload shorter than length prefix".into(),
        ));
    }
    let plain_len = u32::from_be_bytes([buff[0], buff[1], buff[2], buff[3]]) as usize;
    let mut out = Vec::with_capacity(plain_len);
    ZlibDecoder::new(&buff[4..])
        .read_to_end(&mut out)
        .map_err(|e| CatsError::Compressor(format!("zlib: {e}")))?;
    if out.len() != plain_len {
        return Err(CatsError::Compressor(
            "broken data received: length mismatch".into(),
        ));
    }
    if let Some(expected) = expected_adler {
        if adler32(&out) != expected {
            return Err(CatsError::Compressor(
                "broken data received: checksum mismatch".into(),
            ));
        }
    }
    Ok(out)
}

/// Compress a spooled payload file, skipping the first `src_skip` bytes of
/// the source. Returns the plain-data Adler32 for zlib so the caller can
/// record the header. Blocking; run under `spawn_blocking`.
pub(crate) fn compress_file(
    src: &Path,
    src_skip: u64,
    dst: &Path,
    compressor: Compressor,
) -> Result<Option<u32>> {
    use std::io::{Seek, SeekFrom};
    let mut reader = std::fs::File::open(src)?;
    let total = reader.metadata()?.len();
    reader.seek(SeekFrom::Start(src_skip))?;
    let writer = std::fs::File::create(dst)?;
    match compressor {
        Compressor::None => {
            let mut writer = writer;
            std::io::copy(&mut reader, &mut writer)?;
            Ok(None)
        }
        Compressor::Gzip => {
            let mut encoder = GzEncoder::new(writer, Compression::new(LEVEL));
            std::io::copy(&mut reader, &mut encoder)
                .and_then(|_| encoder.finish().map(|_| ()))
                .map_err(|e| CatsError::Compressor(format!("gzip: {e}")))?;
            Ok(None)
        }
        Compressor::Zlib => {
            let plain_len = total.saturating_sub(src_skip);
            let mut writer = writer;
            writer.write_all(&(plain_len as u32).to_be_bytes())?;
            let mut encoder = ZlibEncoder::new(writer, Compression::new(LEVEL));
            let mut checksum = Adler32::new();
            let mut chunk = vec![0u8; FILE_CHUNK];
            loop {
                let n = reader.read(&mut chunk)?;
                if n == 0 {
                    break;
                }
                checksum.update(&chunk[..n]);
                encoder
                    .write_all(&chunk[..n])
                    .map_err(|e| CatsError::Compressor(format!("zlib: {e}")))?;
            }
            encoder
                .finish()
                .map_err(|e| CatsError::Compressor(format!("zlib: {e}")))?;
            Ok(Some(checksum.finish()))
        }
    }
}

/// Decompress a spooled payload file. Blocking; run under `spawn_blocking`.
pub(crate) fn decompress_file(
    src: &Path,
    dst: &Path,
    compressor: Compressor,
    expected_adler: Option<u32>,
) -> Result<()> {
    let mut reader = std::fs::File::open(src)?;
    let mut writer = std::fs::File::create(dst)?;
    match compressor {
        Compressor::None => {
            std::io::copy(&mut reader, &mut writer)?;
            Ok(())
        }
        Compressor::Gzip => {
            let mut decoder = GzDecoder::new(reader);
            std::io::copy(&mut decoder, &mut writer)
                .map_err(|e| CatsError::Compressor(format!("gzip: {e}")))?;
            Ok(())
        }
        Compressor::Zlib => {
            let mut prefix = [0u8; 4];
            reader.read_exact(&mut prefix)?;
            let plain_len = u32::from_be_bytes(prefix) as u64;
            let mut decoder = ZlibDecoder::new(reader);
            let mut checksum = Adler32::new();
            let mut written = 0u64;
            let mut chunk = vec![0u8; FILE_CHUNK];
            loop {
                let n = decoder
                    .read(&mut chunk)
                    .map_err(|e| CatsError::Compressor(format!("zlib: {e}")))?;
                if n == 0 {
                    break;
                }
                checksum.update(&chunk[..n]);
                writer.write_all(&chunk[..n])?;
                written += n as u64;
            }
            if written != plain_len {
                return Err(CatsError::Compressor(
                    "broken data received: length mismatch".into(),
                ));
            }
            if let Some(expected) = expected_adler {
                if checksum.finish() != expected {
                    return Err(CatsError::Compressor(
                        "broken data received: checksum mismatch".into(),
                    ));
                }
            }
            Ok(())
        }
    }
}

/// Adler-32 checksum of `buff` (RFC 1950).
pub fn adler32(buff: &[u8]) -> u32 {
    let mut state = Adler32::new();
    state.update(buff);
    state.finish()
}

/// Streaming Adler-32 state.
struct Adler32 {
    a: u32,
    b: u32,
}

impl Adler32 {
    const MOD: u32 = 65_521;

    fn new() -> Self {
        Self { a: 1, b: 0 }
    }

    fn update(&mut self, buff: &[u8]) {
        // Defer the modulo: 5552 is the largest run that cannot overflow u32.
        for chunk in buff.chunks(5552) {
            for &byte in chunk {
                self.a += byte as u32;
                self.b += self.a;
            }
            self.a %= Self::MOD;
            self.b %= Self::MOD;
        }
    }

    fn finish(&self) -> u32 {
        (self.b << 16) | self.a
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::T_BINARY;
    use serde_json::json;

    fn full_set() -> CompressorSet {
        CompressorSet::from_names(
            &["gzip".to_string(), "zlib".to_string()],
            Some("zlib"),
        )
    }

    #[test]
    fn test_compressor_ids() {
        assert_eq!(Compressor::None.id(), 0x00);
        assert_eq!(Compressor::Gzip.id(), 0x01);
        assert_eq!(Compressor::Zlib.id(), 0x02);
        assert_eq!(Compressor::from_id(0x01), Some(Compressor::Gzip));
        assert_eq!(Compressor::from_id(0x7F), None);
    }

    #[test]
    fn test_adler32_known_value() {
        // "Wikipedia" per the RFC 1950 worked example.
        assert_eq!(adler32(b"Wikipedia"), 0x11E60398);
    }

    #[test]
    fn test_gzip_roundtrip() {
        let data = b"hello world".repeat(1000);
        let packed = gzip_compress(&data).unwrap();
        assert!(packed.len() < data.len());
        assert_eq!(gzip_decompress(&packed).unwrap(), data);
    }

    #[test]
    fn test_zlib_roundtrip_with_checksum() {
        let data = b"abcdef".repeat(2000);
        let mut headers = Headers::new();
        let set = full_set();
        let (packed, used) =
            compress(&data, &mut headers, &set, Some(Compressor::Zlib), T_BINARY).unwrap();
        assert_eq!(used, Compressor::Zlib);
        // Length prefix carries the plain size.
        let prefix = u32::from_be_bytes([packed[0], packed[1], packed[2], packed[3]]);
        assert_eq!(prefix as usize, data.len());
        assert!(headers.contains(known::ADLER32));

        let plain = decompress(&packed, &headers, Compressor::Zlib).unwrap();
        assert_eq!(plain, data);
    }

    #[test]
    fn test_zlib_checksum_mismatch() {
        let data = vec![7u8; 8192];
        let mut headers = Headers::new();
        let (packed, _) = compress(
            &data,
            &mut headers,
            &full_set(),
            Some(Compressor::Zlib),
            T_BINARY,
        )
        .unwrap();
        headers.insert(known::ADLER32, 12345);
        let err = decompress(&packed, &headers, Compressor::Zlib).unwrap_err();
        assert!(matches!(err, CatsError::Compressor(_)));
    }

    #[test]
    fn test_propose_small_payload_stays_plain() {
        let headers = Headers::new();
        assert_eq!(
            propose(100, T_BINARY, &headers, Compressor::Zlib),
            Compressor::None
        );
        assert_eq!(
            propose(COMPRESS_THRESHOLD as u64, T_BINARY, &headers, Compressor::Zlib),
            Compressor::None
        );
        assert_eq!(
            propose(COMPRESS_THRESHOLD as u64 + 1, T_BINARY, &headers, Compressor::Zlib),
            Compressor::Zlib
        );
    }

    #[test]
    fn test_propose_skips_compressed_files() {
        let mut headers = Headers::new();
        headers.insert(
            known::FILES,
            json!([{"key": "a", "name": "a.png", "size": 50000, "type": "image/png"}]),
        );
        assert_eq!(
            propose(50000, T_FILES, &headers, Compressor::Gzip),
            Compressor::None
        );

        // A plain-text member makes the bundle compressible again.
        headers.insert(
            known::FILES,
            json!([
                {"key": "a", "name": "a.png", "size": 50000, "type": "image/png"},
                {"key": "b", "name": "b.txt", "size": 50000, "type": "text/plain"},
            ]),
        );
        assert_eq!(
            propose(100_000, T_FILES, &headers, Compressor::Gzip),
            Compressor::Gzip
        );
    }

    #[test]
    fn test_compress_rejects_unsupported() {
        let set = CompressorSet::from_names(&["gzip".to_string()], None);
        let mut headers = Headers::new();
        let err = compress(
            b"data",
            &mut headers,
            &set,
            Some(Compressor::Zlib),
            T_BINARY,
        )
        .unwrap_err();
        assert!(matches!(err, CatsError::Compressor(_)));
    }

    #[test]
    fn test_set_always_allows_none() {
        let set = CompressorSet::from_names(&[], None);
        assert!(set.allows(Compressor::None));
        assert_eq!(set.default_compressor(), Compressor::None);
    }

    #[test]
    fn test_set_default_must_be_allowed() {
        let set = CompressorSet::from_names(&["gzip".to_string()], Some("zlib"));
        assert_eq!(set.default_compressor(), Compressor::None);
        let set = CompressorSet::from_names(&["gzip".to_string()], Some("gzip"));
        assert_eq!(set.default_compressor(), Compressor::Gzip);
    }

    #[test]
    fn test_file_transforms_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("plain");
        let packed = dir.path().join("packed");
        let out = dir.path().join("out");
        let data = b"stream me ".repeat(100_000);
        std::fs::write(&src, &data).unwrap();

        for compressor in [Compressor::None, Compressor::Gzip, Compressor::Zlib] {
            let adler = compress_file(&src, 0, &packed, compressor).unwrap();
            decompress_file(&packed, &out, compressor, adler).unwrap();
            assert_eq!(std::fs::read(&out).unwrap(), data, "{compressor:?}");
        }
    }
}
