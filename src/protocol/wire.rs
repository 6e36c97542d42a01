//! Frame reader and writer.
//!
//! The reader pulls one action at a time off the stream: a one-byte tag, a
//! fixed head, then (for payload-bearing actions) either a sized envelope
//! (`headers ++ 0x0000 ++ payload`) or a chunked stream body. A frame
//! whose headers or payload turn out to be malformed is still consumed in
//! full so the stream never desynchronizes; such failures surface as
//! exchange-scoped errors while framing violations are fatal.
//!
//! The writer emits the tag, head and header block as one buffer, then the
//! payload in paced chunks under the caller's write lock.

use std::io::ErrorKind;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use crate::action::StreamSource;
use crate::codec::T_FILES;
use crate::compress::{self, Compressor, CompressorSet};
use crate::error::CatsError;
use crate::headers::Headers;
use crate::rate::Pacer;
use crate::scheme::SchemeFormat;

use super::head::{
    ActionHead, InputHead, StreamHead, ACTION_HEAD_LEN, INPUT_HEAD_LEN, STREAM_HEAD_LEN,
};
use super::spool::{decompress_buf, PayloadBuf, Spool};
use super::{tags, HEADER_SEPARATOR};

/// Upper bound on a header block, to keep separator scanning bounded.
const MAX_HEADER_BLOCK: usize = 1 << 20;

/// Read buffer size for envelope payloads.
const READ_CHUNK: usize = 64 * 1024;

/// A parsed inbound frame. Envelope payloads are still compressed; stream
/// payloads are decompressed chunk by chunk during the read.
#[derive(Debug)]
pub(crate) enum RawAction {
    Action {
        head: ActionHead,
        headers: Headers,
        payload: PayloadBuf,
    },
    Stream {
        head: StreamHead,
        headers: Headers,
        payload: PayloadBuf,
    },
    Input {
        head: InputHead,
        headers: Headers,
        payload: PayloadBuf,
    },
    DownloadSpeed(u32),
    CancelInput(u16),
    Ping(u64),
    StartEncryption {
        cypher: u8,
        exchange: u8,
        key: Bytes,
    },
    StopEncryption,
}

/// Frame-reader failure modes.
#[derive(Debug)]
pub(crate) enum WireError {
    /// The connection must close (framing violation, transport failure).
    Fatal(CatsError),
    /// One exchange failed; the frame was consumed and the stream is
    /// still in sync.
    Exchange {
        tag: u8,
        handler_id: u16,
        message_id: u16,
        err: CatsError,
    },
}

impl WireError {
    fn fatal_io(err: std::io::Error) -> Self {
        Self::Fatal(CatsError::Io(err))
    }
}

/// Reads framed actions off the inbound byte stream.
pub(crate) struct FrameReader<R> {
    rd: R,
    max_in_memory: usize,
    format: SchemeFormat,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(rd: R, max_in_memory: usize, format: SchemeFormat) -> Self {
        Self {
            rd,
            max_in_memory,
            format,
        }
    }

    /// Read the next action. A clean EOF before the tag byte maps to
    /// [`CatsError::ConnectionClosed`]; EOF anywhere inside a frame is a
    /// transport error.
    pub async fn next(&mut self) -> Result<RawAction, WireError> {
        let tag = match self.rd.read_u8().await {
            Ok(tag) => tag,
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => {
                return Err(WireError::Fatal(CatsError::ConnectionClosed))
            }
            Err(e) => return Err(WireError::fatal_io(e)),
        };
        match tag {
            tags::ACTION => self.read_action().await,
            tags::STREAM => self.read_stream().await,
            tags::INPUT => self.read_input().await,
            tags::DOWNLOAD_SPEED => Ok(RawAction::DownloadSpeed(self.read_u32().await?)),
            tags::CANCEL_INPUT => Ok(RawAction::CancelInput(self.read_u16().await?)),
            tags::PING => Ok(RawAction::Ping(self.read_u64().await?)),
            tags::START_ENCRYPTION => self.read_start_encryption().await,
            tags::STOP_ENCRYPTION => Ok(RawAction::StopEncryption),
            other => Err(WireError::Fatal(CatsError::protocol(format!(
                "unknown action tag {other:#04x}"
            )))),
        }
    }

    async fn read_action(&mut self) -> Result<RawAction, WireError> {
        let mut buf = [0u8; ACTION_HEAD_LEN];
        self.read_exact(&mut buf).await?;
        let head = ActionHead::decode(&buf);
        let (headers, payload) = self
            .read_envelope(
                tags::ACTION,
                head.handler_id,
                head.message_id,
                head.data_len as u64,
                head.data_type,
            )
            .await?;
        Ok(RawAction::Action {
            head,
            headers,
            payload,
        })
    }

    async fn read_input(&mut self) -> Result<RawAction, WireError> {
        let mut buf = [0u8; INPUT_HEAD_LEN];
        self.read_exact(&mut buf).await?;
        let head = InputHead::decode(&buf);
        let (headers, payload) = self
            .read_envelope(
                tags::INPUT,
                0,
                head.message_id,
                head.data_len as u64,
                head.data_type,
            )
            .await?;
        Ok(RawAction::Input {
            head,
            headers,
            payload,
        })
    }

    /// Read a sized envelope: scan for the `0x0000` separator, parse the
    /// header block, spool the remaining payload bytes.
    async fn read_envelope(
        &mut self,
        tag: u8,
        handler_id: u16,
        message_id: u16,
        data_len: u64,
        data_type: u8,
    ) -> Result<(Headers, PayloadBuf), WireError> {
        let exchange = |err: CatsError| WireError::Exchange {
            tag,
            handler_id,
            message_id,
            err,
        };

        let scan_limit = (data_len as usize).min(MAX_HEADER_BLOCK + HEADER_SEPARATOR.len());
        let mut scanned: Vec<u8> = Vec::new();
        let mut chunk = [0u8; READ_CHUNK];
        let sep = loop {
            if let Some(i) = find_separator(&scanned) {
                break Some(i);
            }
            if scanned.len() >= scan_limit {
                break None;
            }
            let want = (scan_limit - scanned.len()).min(READ_CHUNK);
            let n = self
                .rd
                .read(&mut chunk[..want])
                .await
                .map_err(WireError::fatal_io)?;
            if n == 0 {
                return Err(WireError::fatal_io(ErrorKind::UnexpectedEof.into()));
            }
            scanned.extend_from_slice(&chunk[..n]);
        };

        let Some(sep) = sep else {
            // No separator in the whole blob (or in the first scan-limit
            // bytes): consume the rest so the stream stays in sync.
            self.discard(data_len - scanned.len() as u64).await?;
            return Err(exchange(CatsError::Malformed(
                "missing header separator".into(),
            )));
        };

        let payload_len = data_len - sep as u64 - HEADER_SEPARATOR.len() as u64;
        if data_type != T_FILES && payload_len > self.max_in_memory as u64 {
            return Err(WireError::Fatal(CatsError::protocol(format!(
                "{payload_len} byte payload exceeds the in-memory limit for non-file data"
            ))));
        }

        let headers = match Headers::decode(&scanned[..sep], self.format) {
            Ok(headers) => headers,
            Err(err) => {
                self.discard(data_len - scanned.len() as u64).await?;
                return Err(exchange(err));
            }
        };

        let mut spool = Spool::new(self.max_in_memory);
        let early = &scanned[sep + HEADER_SEPARATOR.len()..];
        spool.write(early).await.map_err(WireError::Fatal)?;
        let mut left = payload_len - early.len() as u64;
        while left > 0 {
            let want = (left as usize).min(READ_CHUNK);
            let n = self
                .rd
                .read(&mut chunk[..want])
                .await
                .map_err(WireError::fatal_io)?;
            if n == 0 {
                return Err(WireError::fatal_io(ErrorKind::UnexpectedEof.into()));
            }
            spool.write(&chunk[..n]).await.map_err(WireError::Fatal)?;
            left -= n as u64;
        }
        let payload = spool.finish().await.map_err(WireError::Fatal)?;
        Ok((headers, payload))
    }

    /// Read a stream action: headers block, then `(u32 size, bytes)` chunk
    /// pairs until the zero terminator. Chunks are decompressed
    /// independently as they arrive.
    async fn read_stream(&mut self) -> Result<RawAction, WireError> {
        let mut buf = [0u8; STREAM_HEAD_LEN];
        self.read_exact(&mut buf).await?;
        let head = StreamHead::decode(&buf);
        let exchange = |err: CatsError| WireError::Exchange {
            tag: tags::STREAM,
            handler_id: head.handler_id,
            message_id: head.message_id,
            err,
        };

        let headers_size = self.read_u32().await? as usize;
        if headers_size > MAX_HEADER_BLOCK {
            return Err(WireError::Fatal(CatsError::protocol(format!(
                "{headers_size} byte stream header block"
            ))));
        }
        let mut headers_bytes = vec![0u8; headers_size];
        self.read_exact(&mut headers_bytes).await?;

        let headers = match Headers::decode(&headers_bytes, self.format) {
            Ok(headers) => headers,
            Err(err) => {
                self.drain_chunks().await?;
                return Err(exchange(err));
            }
        };
        let Some(compressor) = Compressor::from_id(head.compressor) else {
            self.drain_chunks().await?;
            return Err(exchange(CatsError::Compressor(format!(
                "unknown compressor {:#04x}",
                head.compressor
            ))));
        };

        let mut spool = Spool::new(self.max_in_memory);
        loop {
            let chunk_size = self.read_u32().await? as u64;
            if chunk_size == 0 {
                break;
            }
            let mut chunk_spool = Spool::new(self.max_in_memory);
            self.read_into_spool(&mut chunk_spool, chunk_size).await?;
            let packed = chunk_spool.finish().await.map_err(WireError::Fatal)?;
            let plain = match decompress_buf(packed, &headers, compressor).await {
                Ok(plain) => plain,
                Err(err) => {
                    self.drain_chunks().await?;
                    return Err(exchange(err));
                }
            };
            match plain {
                PayloadBuf::Mem(data) => {
                    spool.write(&data).await.map_err(WireError::Fatal)?;
                }
                PayloadBuf::Disk { path, .. } => {
                    spool.append_file(&path).await.map_err(WireError::Fatal)?;
                }
            }
            if head.data_type != T_FILES && spool.len() > self.max_in_memory as u64 {
                return Err(WireError::Fatal(CatsError::protocol(format!(
                    "{} byte stream exceeds the in-memory limit for non-file data",
                    spool.len()
                ))));
            }
        }
        let payload = spool.finish().await.map_err(WireError::Fatal)?;
        Ok(RawAction::Stream {
            head,
            headers,
            payload,
        })
    }

    async fn read_start_encryption(&mut self) -> Result<RawAction, WireError> {
        let mut buf = [0u8; 6];
        self.read_exact(&mut buf).await?;
        let key_len = u32::from_be_bytes([buf[2], buf[3], buf[4], buf[5]]) as usize;
        if key_len > self.max_in_memory {
            return Err(WireError::Fatal(CatsError::protocol(format!(
                "{key_len} byte encryption key"
            ))));
        }
        let mut key = vec![0u8; key_len];
        self.read_exact(&mut key).await?;
        debug!(cypher = buf[0], exchange = buf[1], "encryption actions are reserved; ignoring");
        Ok(RawAction::StartEncryption {
            cypher: buf[0],
            exchange: buf[1],
            key: Bytes::from(key),
        })
    }

    /// Consume chunk pairs up to and including the terminator, discarding
    /// the bytes.
    async fn drain_chunks(&mut self) -> Result<(), WireError> {
        loop {
            let chunk_size = self.read_u32().await? as u64;
            if chunk_size == 0 {
                return Ok(());
            }
            self.discard(chunk_size).await?;
        }
    }

    async fn read_into_spool(&mut self, spool: &mut Spool, mut left: u64) -> Result<(), WireError> {
        let mut chunk = [0u8; READ_CHUNK];
        while left > 0 {
            let want = (left as usize).min(READ_CHUNK);
            let n = self
                .rd
                .read(&mut chunk[..want])
                .await
                .map_err(WireError::fatal_io)?;
            if n == 0 {
                return Err(WireError::fatal_io(ErrorKind::UnexpectedEof.into()));
            }
            spool.write(&chunk[..n]).await.map_err(WireError::Fatal)?;
            left -= n as u64;
        }
        Ok(())
    }

    async fn discard(&mut self, mut left: u64) -> Result<(), WireError> {
        let mut chunk = [0u8; READ_CHUNK];
        while left > 0 {
            let want = (left as usize).min(READ_CHUNK);
            let n = self
                .rd
                .read(&mut chunk[..want])
                .await
                .map_err(WireError::fatal_io)?;
            if n == 0 {
                return Err(WireError::fatal_io(ErrorKind::UnexpectedEof.into()));
            }
            left -= n as u64;
        }
        Ok(())
    }

    async fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), WireError> {
        self.rd
            .read_exact(buf)
            .await
            .map(|_| ())
            .map_err(WireError::fatal_io)
    }

    async fn read_u16(&mut self) -> Result<u16, WireError> {
        self.rd.read_u16().await.map_err(WireError::fatal_io)
    }

    async fn read_u32(&mut self) -> Result<u32, WireError> {
        self.rd.read_u32().await.map_err(WireError::fatal_io)
    }

    async fn read_u64(&mut self) -> Result<u64, WireError> {
        self.rd.read_u64().await.map_err(WireError::fatal_io)
    }
}

/// First `0x00 0x00` pair in `buff`, if any.
fn find_separator(buff: &[u8]) -> Option<usize> {
    buff.windows(2).position(|w| w == HEADER_SEPARATOR)
}

/// Writes framed actions to the outbound byte stream, pacing payload
/// bytes through the shared token bucket.
pub(crate) struct FrameWriter<W> {
    wr: W,
    pacer: Pacer,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(wr: W, pacer: Pacer) -> Self {
        Self { wr, pacer }
    }

    /// Emit a sized-envelope action: tag, head, headers, separator, then
    /// the payload in paced chunks.
    pub async fn write_action(
        &mut self,
        tag: u8,
        head: &[u8],
        headers: &[u8],
        payload: &PayloadBuf,
    ) -> crate::error::Result<()> {
        let mut prefix =
            Vec::with_capacity(1 + head.len() + headers.len() + HEADER_SEPARATOR.len());
        prefix.push(tag);
        prefix.extend_from_slice(head);
        prefix.extend_from_slice(headers);
        prefix.extend_from_slice(&HEADER_SEPARATOR);
        self.wr.write_all(&prefix).await?;

        let total = payload.len();
        let mut offset = 0u64;
        while offset < total {
            let len = (total - offset).min(self.pacer.max_chunk() as u64);
            let chunk = payload.read_range(offset, len).await?;
            self.pacer.throttle(chunk.len()).await;
            self.wr.write_all(&chunk).await?;
            offset += len;
        }
        self.wr.flush().await?;
        Ok(())
    }

    /// Emit a stream action: tag, head, sized header block, then each
    /// chunk compressed independently, and the zero terminator.
    #[allow(clippy::too_many_arguments)]
    pub async fn write_stream(
        &mut self,
        head: &[u8],
        headers: &[u8],
        source: &mut StreamSource,
        offset: u64,
        compressor: Compressor,
        set: &CompressorSet,
        data_type: u8,
    ) -> crate::error::Result<()> {
        let mut prefix = Vec::with_capacity(1 + head.len() + 4 + headers.len());
        prefix.push(tags::STREAM);
        prefix.extend_from_slice(head);
        prefix.extend_from_slice(&(headers.len() as u32).to_be_bytes());
        prefix.extend_from_slice(headers);
        self.wr.write_all(&prefix).await?;

        let mut skip = offset;
        while let Some(chunk) = source.next().await {
            let mut chunk = chunk;
            if skip > 0 {
                let cut = skip.min(chunk.len() as u64) as usize;
                skip -= cut as u64;
                chunk = chunk.slice(cut..);
            }
            if chunk.is_empty() {
                continue;
            }
            let mut start = 0;
            while start < chunk.len() {
                let end = chunk.len().min(start + crate::rate::MAX_WRITE_CHUNK);
                let part = &chunk[start..end];
                start = end;
                // Chunk-level headers never reach the wire; the zlib
                // checksum goes into a scratch map and is dropped.
                let mut scratch = Headers::new();
                let (packed, _) =
                    compress::compress(part, &mut scratch, set, Some(compressor), data_type)?;
                self.pacer.throttle(packed.len() + 4).await;
                self.wr
                    .write_all(&(packed.len() as u32).to_be_bytes())
                    .await?;
                self.wr.write_all(&packed).await?;
            }
        }
        self.wr.write_all(&[0, 0, 0, 0]).await?;
        self.wr.flush().await?;
        Ok(())
    }

    /// Emit a small fixed frame (ping, cancel, download speed).
    pub async fn write_control(&mut self, frame: &[u8]) -> crate::error::Result<()> {
        self.wr.write_all(frame).await?;
        self.wr.flush().await?;
        Ok(())
    }

    /// Close the underlying transport.
    pub async fn shutdown(&mut self) -> crate::error::Result<()> {
        self.wr.shutdown().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::unix_ms;
    use std::sync::atomic::AtomicU32;
    use std::sync::Arc;

    fn writer<W: AsyncWrite + Unpin>(wr: W) -> FrameWriter<W> {
        FrameWriter::new(wr, Pacer::new(Arc::new(AtomicU32::new(0))))
    }

    fn reader<R: AsyncRead + Unpin>(rd: R) -> FrameReader<R> {
        FrameReader::new(rd, 1 << 23, SchemeFormat::Json)
    }

    fn action_head(message_id: u16, data_len: u32) -> ActionHead {
        ActionHead {
            handler_id: 0x0001,
            message_id,
            send_time: unix_ms(),
            data_type: crate::codec::T_BINARY,
            compressor: 0,
            data_len,
        }
    }

    #[tokio::test]
    async fn test_action_roundtrip() {
        let (client, server) = tokio::io::duplex(1 << 16);
        let mut wr = writer(client);
        let mut rd = reader(server);

        let headers = Headers::new().encode(SchemeFormat::Json).unwrap();
        let payload = PayloadBuf::Mem(Bytes::from_static(b"hello"));
        let head = action_head(0x0042, (headers.len() + 2 + 5) as u32);
        wr.write_action(tags::ACTION, &head.encode(), &headers, &payload)
            .await
            .unwrap();

        match rd.next().await.unwrap() {
            RawAction::Action {
                head: got, payload, ..
            } => {
                assert_eq!(got.message_id, 0x0042);
                assert_eq!(&payload.read_bytes().await.unwrap()[..], b"hello");
            }
            other => panic!("unexpected action: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_payload_may_contain_zero_bytes() {
        let (client, server) = tokio::io::duplex(1 << 16);
        let mut wr = writer(client);
        let mut rd = reader(server);

        let headers = Headers::new().encode(SchemeFormat::Json).unwrap();
        let body = [0x00, 0x00, 0x01, 0x00, 0x00, 0x02];
        let payload = PayloadBuf::Mem(Bytes::copy_from_slice(&body));
        let head = action_head(1, (headers.len() + 2 + body.len()) as u32);
        wr.write_action(tags::ACTION, &head.encode(), &headers, &payload)
            .await
            .unwrap();

        match rd.next().await.unwrap() {
            RawAction::Action { payload, .. } => {
                assert_eq!(&payload.read_bytes().await.unwrap()[..], &body);
            }
            other => panic!("unexpected action: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_bad_headers_consume_frame_and_stream_stays_in_sync() {
        let (client, server) = tokio::io::duplex(1 << 16);
        let mut wr = writer(client);
        let mut rd = reader(server);

        // Junk header bytes (not a scheme mapping), then a valid frame.
        let bad_headers = b"!!not a scheme!!";
        let payload = PayloadBuf::Mem(Bytes::from_static(b"junk"));
        let head = action_head(7, (bad_headers.len() + 2 + 4) as u32);
        wr.write_action(tags::ACTION, &head.encode(), bad_headers, &payload)
            .await
            .unwrap();

        let good_headers = Headers::new().encode(SchemeFormat::Json).unwrap();
        let good = PayloadBuf::Mem(Bytes::from_static(b"ok"));
        let head2 = action_head(8, (good_headers.len() + 2 + 2) as u32);
        wr.write_action(tags::ACTION, &head2.encode(), &good_headers, &good)
            .await
            .unwrap();

        match rd.next().await {
            Err(WireError::Exchange {
                message_id, err, ..
            }) => {
                assert_eq!(message_id, 7);
                assert!(!err.is_fatal());
            }
            other => panic!("expected exchange error, got {other:?}"),
        }
        match rd.next().await.unwrap() {
            RawAction::Action { head, payload, .. } => {
                assert_eq!(head.message_id, 8);
                assert_eq!(&payload.read_bytes().await.unwrap()[..], b"ok");
            }
            other => panic!("unexpected action: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_missing_separator_is_exchange_scoped() {
        let (client, server) = tokio::io::duplex(1 << 16);
        let mut rd = reader(server);

        let mut frame = vec![tags::ACTION];
        let body = vec![0x41u8; 32]; // no 0x0000 pair anywhere
        frame.extend_from_slice(&action_head(3, body.len() as u32).encode());
        frame.extend_from_slice(&body);
        // A valid ping follows; it must still parse.
        frame.push(tags::PING);
        frame.extend_from_slice(&123u64.to_be_bytes());

        tokio::spawn(async move {
            let mut client = client;
            client.write_all(&frame).await.unwrap();
        });

        match rd.next().await {
            Err(WireError::Exchange { message_id, .. }) => assert_eq!(message_id, 3),
            other => panic!("expected exchange error, got {other:?}"),
        }
        match rd.next().await.unwrap() {
            RawAction::Ping(t) => assert_eq!(t, 123),
            other => panic!("unexpected action: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_unknown_tag_is_fatal() {
        let (client, server) = tokio::io::duplex(64);
        let mut rd = reader(server);
        tokio::spawn(async move {
            let mut client = client;
            client.write_all(&[0x9C]).await.unwrap();
        });
        match rd.next().await {
            Err(WireError::Fatal(CatsError::Protocol(_))) => {}
            other => panic!("expected fatal protocol error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_eof_before_tag_is_clean_close() {
        let (client, server) = tokio::io::duplex(64);
        drop(client);
        let mut rd = reader(server);
        match rd.next().await {
            Err(WireError::Fatal(CatsError::ConnectionClosed)) => {}
            other => panic!("expected clean close, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_eof_mid_frame_is_transport_error() {
        let (client, server) = tokio::io::duplex(64);
        let mut rd = reader(server);
        tokio::spawn(async move {
            let mut client = client;
            // Tag plus half a head, then hang up.
            client.write_all(&[tags::ACTION, 0x00, 0x01]).await.unwrap();
        });
        match rd.next().await {
            Err(WireError::Fatal(CatsError::Io(_))) => {}
            other => panic!("expected transport error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_stream_roundtrip_with_compression() {
        let (client, server) = tokio::io::duplex(1 << 18);
        let mut wr = writer(client);
        let mut rd = reader(server);

        let set = CompressorSet::from_names(
            &["gzip".to_string(), "zlib".to_string()],
            Some("zlib"),
        );
        let head = StreamHead {
            handler_id: 2,
            message_id: 0x0101,
            send_time: unix_ms(),
            data_type: crate::codec::T_BINARY,
            compressor: Compressor::Zlib.id(),
        };
        let headers = Headers::new().encode(SchemeFormat::Json).unwrap();
        let mut source = StreamSource::Chunks(vec![
            Bytes::from_static(b"hello"),
            Bytes::from_static(b" world"),
            Bytes::from_static(b"!"),
        ]);
        wr.write_stream(
            &head.encode(),
            &headers,
            &mut source,
            0,
            Compressor::Zlib,
            &set,
            crate::codec::T_BINARY,
        )
        .await
        .unwrap();

        match rd.next().await.unwrap() {
            RawAction::Stream { head: got, payload, .. } => {
                assert_eq!(got.message_id, 0x0101);
                assert_eq!(&payload.read_bytes().await.unwrap()[..], b"hello world!");
            }
            other => panic!("unexpected action: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_stream_offset_skips_chunk_bytes() {
        let (client, server) = tokio::io::duplex(1 << 16);
        let mut wr = writer(client);
        let mut rd = reader(server);

        let set = CompressorSet::default();
        let head = StreamHead {
            handler_id: 2,
            message_id: 5,
            send_time: unix_ms(),
            data_type: crate::codec::T_BINARY,
            compressor: Compressor::None.id(),
        };
        let headers = Headers::new().encode(SchemeFormat::Json).unwrap();
        let mut source = StreamSource::Chunks(vec![
            Bytes::from_static(b"hello"),
            Bytes::from_static(b" world"),
        ]);
        wr.write_stream(
            &head.encode(),
            &headers,
            &mut source,
            7,
            Compressor::None,
            &set,
            crate::codec::T_BINARY,
        )
        .await
        .unwrap();

        match rd.next().await.unwrap() {
            RawAction::Stream { payload, .. } => {
                assert_eq!(&payload.read_bytes().await.unwrap()[..], b"orld");
            }
            other => panic!("unexpected action: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_empty_stream() {
        let (client, server) = tokio::io::duplex(1 << 16);
        let mut wr = writer(client);
        let mut rd = reader(server);

        let head = StreamHead {
            handler_id: 1,
            message_id: 9,
            send_time: unix_ms(),
            data_type: crate::codec::T_BINARY,
            compressor: Compressor::None.id(),
        };
        let headers = Headers::new().encode(SchemeFormat::Json).unwrap();
        let mut source = StreamSource::Chunks(vec![]);
        wr.write_stream(
            &head.encode(),
            &headers,
            &mut source,
            0,
            Compressor::None,
            &CompressorSet::default(),
            crate::codec::T_BINARY,
        )
        .await
        .unwrap();

        match rd.next().await.unwrap() {
            RawAction::Stream { payload, .. } => assert_eq!(payload.len(), 0),
            other => panic!("unexpected action: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_control_frames() {
        let (client, server) = tokio::io::duplex(256);
        let mut wr = writer(client);
        let mut rd = reader(server);

        let mut ping = vec![tags::PING];
        ping.extend_from_slice(&42u64.to_be_bytes());
        wr.write_control(&ping).await.unwrap();

        let mut speed = vec![tags::DOWNLOAD_SPEED];
        speed.extend_from_slice(&8192u32.to_be_bytes());
        wr.write_control(&speed).await.unwrap();

        let mut cancel = vec![tags::CANCEL_INPUT];
        cancel.extend_from_slice(&0x0033u16.to_be_bytes());
        wr.write_control(&cancel).await.unwrap();

        assert!(matches!(rd.next().await.unwrap(), RawAction::Ping(42)));
        assert!(matches!(
            rd.next().await.unwrap(),
            RawAction::DownloadSpeed(8192)
        ));
        assert!(matches!(
            rd.next().await.unwrap(),
            RawAction::CancelInput(0x0033)
        ));
    }

    #[tokio::test]
    async fn test_encryption_tags_are_parsed_and_ignored() {
        let (client, server) = tokio::io::duplex(256);
        let mut rd = reader(server);
        tokio::spawn(async move {
            let mut client = client;
            let mut frame = vec![tags::START_ENCRYPTION, 0x01, 0x02];
            frame.extend_from_slice(&3u32.to_be_bytes());
            frame.extend_from_slice(b"key");
            frame.push(tags::STOP_ENCRYPTION);
            client.write_all(&frame).await.unwrap();
        });

        match rd.next().await.unwrap() {
            RawAction::StartEncryption { cypher, exchange, key } => {
                assert_eq!(cypher, 0x01);
                assert_eq!(exchange, 0x02);
                assert_eq!(&key[..], b"key");
            }
            other => panic!("unexpected action: {other:?}"),
        }
        assert!(matches!(rd.next().await.unwrap(), RawAction::StopEncryption));
    }

    #[tokio::test]
    async fn test_oversized_non_file_payload_is_fatal() {
        let (client, server) = tokio::io::duplex(1 << 16);
        let mut rd = FrameReader::new(server, 1024, SchemeFormat::Json);
        tokio::spawn(async move {
            let mut client = client;
            let headers = b"{}";
            let data_len = (headers.len() + 2 + 4096) as u32;
            let mut frame = vec![tags::ACTION];
            let mut head = action_head(1, data_len);
            head.data_type = crate::codec::T_BINARY;
            frame.extend_from_slice(&head.encode());
            frame.extend_from_slice(headers);
            frame.extend_from_slice(&HEADER_SEPARATOR);
            frame.extend_from_slice(&vec![0x55; 4096]);
            let _ = client.write_all(&frame).await;
        });
        match rd.next().await {
            Err(WireError::Fatal(CatsError::Protocol(_))) => {}
            other => panic!("expected fatal protocol error, got {other:?}"),
        }
    }
}
