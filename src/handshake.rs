//! Authenticated handshakes.
//!
//! After the statement exchange an optional handshake runs: the connecting
//! side sends opaque proof bytes, the accepting side verifies them and
//! answers a single byte — `0x01` to admit, `0x00` to reject and close.
//!
//! The trait is pluggable; the shipped implementation is a time-bounded
//! SHA-256 of a shared secret: `sha256(secret_key || ascii_decimal(t))`
//! where `t` is the sender's server-aligned clock in seconds, floored to a
//! multiple of ten. The verifier accepts any digest within
//! `±valid_window` ten-second steps.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use sha2::{Digest, Sha256};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use crate::error::{CatsError, Result};
use crate::protocol::unix_ms;

/// Boxed future type used by the object-safe handshake trait.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Digest length of the SHA-256 scheme.
pub const SHA256_HANDSHAKE_LEN: usize = 32;

/// Byte answered by the verifier on success.
const ACCEPT: u8 = 0x01;
/// Byte answered by the verifier on failure, before closing.
const REJECT: u8 = 0x00;

/// Transport access handed to a handshake, with the per-phase timeout and
/// the clock offset captured during the statement exchange.
pub struct HandshakeIo<'a> {
    pub(crate) rd: &'a mut (dyn AsyncRead + Send + Unpin),
    pub(crate) wr: &'a mut (dyn AsyncWrite + Send + Unpin),
    /// `server_time - client_time` in milliseconds; zero on the server.
    pub time_delta_ms: i64,
    /// The whole handshake must finish within this window.
    pub timeout: Duration,
}

impl<'a> HandshakeIo<'a> {
    pub(crate) fn new(
        rd: &'a mut (dyn AsyncRead + Send + Unpin),
        wr: &'a mut (dyn AsyncWrite + Send + Unpin),
        time_delta_ms: i64,
        timeout: Duration,
    ) -> Self {
        Self {
            rd,
            wr,
            time_delta_ms,
            timeout,
        }
    }

    /// Local clock corrected to the server's, seconds since the epoch.
    pub fn server_aligned_secs(&self) -> i64 {
        (unix_ms() as i64 + self.time_delta_ms) / 1000
    }

    /// Read exactly `buf.len()` bytes, failing the handshake on timeout.
    pub async fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        match tokio::time::timeout(self.timeout, self.rd.read_exact(buf)).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                Err(CatsError::Handshake("peer closed during handshake".into()))
            }
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(CatsError::Handshake("handshake timed out".into())),
        }
    }

    pub async fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        self.wr.write_all(buf).await?;
        self.wr.flush().await?;
        Ok(())
    }
}

/// A pluggable post-statement authentication exchange.
pub trait Handshake: Send + Sync + 'static {
    /// Connecting side: emit proof bytes and await the verdict byte.
    fn send<'a>(&'a self, io: &'a mut HandshakeIo<'_>) -> BoxFuture<'a, Result<()>>;

    /// Accepting side: verify proof bytes and answer the verdict byte.
    fn validate<'a>(&'a self, io: &'a mut HandshakeIo<'_>) -> BoxFuture<'a, Result<()>>;
}

/// SHA-256 shared-secret handshake with a sliding time window.
pub struct Sha256TimeHandshake {
    secret_key: Vec<u8>,
    valid_window: u32,
}

impl Sha256TimeHandshake {
    /// `valid_window` is the tolerance in ten-second steps; it is clamped
    /// to at least 1.
    pub fn new(secret_key: impl Into<Vec<u8>>, valid_window: u32) -> Self {
        Self {
            secret_key: secret_key.into(),
            valid_window: valid_window.max(1),
        }
    }

    fn digest(&self, timestamp: i64) -> [u8; SHA256_HANDSHAKE_LEN] {
        let mut hasher = Sha256::new();
        hasher.update(&self.secret_key);
        hasher.update(timestamp.to_string().as_bytes());
        hasher.finalize().into()
    }

    fn aligned(timestamp: i64) -> i64 {
        timestamp.div_euclid(10) * 10
    }

    /// Digests for every timestamp the verifier tolerates right now.
    fn candidates(&self, now_secs: i64) -> Vec<[u8; SHA256_HANDSHAKE_LEN]> {
        let base = Self::aligned(now_secs);
        let window = self.valid_window as i64;
        (-window..=window)
            .map(|step| self.digest(base + step * 10))
            .collect()
    }
}

impl Handshake for Sha256TimeHandshake {
    fn send<'a>(&'a self, io: &'a mut HandshakeIo<'_>) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let proof = self.digest(Self::aligned(io.server_aligned_secs()));
            io.write_all(&proof).await?;
            let mut verdict = [0u8; 1];
            io.read_exact(&mut verdict).await?;
            if verdict[0] == ACCEPT {
                debug!("handshake passed");
                Ok(())
            } else {
                Err(CatsError::Handshake("rejected by peer".into()))
            }
        })
    }

    fn validate<'a>(&'a self, io: &'a mut HandshakeIo<'_>) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let mut proof = [0u8; SHA256_HANDSHAKE_LEN];
            io.read_exact(&mut proof).await?;
            if self.candidates(io.server_aligned_secs()).contains(&proof) {
                io.write_all(&[ACCEPT]).await?;
                debug!("handshake passed");
                Ok(())
            } else {
                io.write_all(&[REJECT]).await?;
                Err(CatsError::Handshake("invalid handshake digest".into()))
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn split_io(
        stream: tokio::io::DuplexStream,
    ) -> (
        tokio::io::ReadHalf<tokio::io::DuplexStream>,
        tokio::io::WriteHalf<tokio::io::DuplexStream>,
    ) {
        tokio::io::split(stream)
    }

    async fn run_pair(
        client: Sha256TimeHandshake,
        server: Sha256TimeHandshake,
        client_delta: i64,
    ) -> (Result<()>, Result<()>) {
        let (a, b) = tokio::io::duplex(256);
        let (mut ar, mut aw) = split_io(a);
        let (mut br, mut bw) = split_io(b);
        let timeout = Duration::from_secs(5);
        let send = async move {
            let mut io = HandshakeIo::new(&mut ar, &mut aw, client_delta, timeout);
            client.send(&mut io).await
        };
        let validate = async move {
            let mut io = HandshakeIo::new(&mut br, &mut bw, 0, timeout);
            server.validate(&mut io).await
        };
        tokio::join!(send, validate)
    }

    #[tokio::test]
    async fn test_matching_secret_passes() {
        let (sent, validated) = run_pair(
            Sha256TimeHandshake::new(&b"s3cret"[..], 1),
            Sha256TimeHandshake::new(&b"s3cret"[..], 1),
            0,
        )
        .await;
        sent.unwrap();
        validated.unwrap();
    }

    #[tokio::test]
    async fn test_wrong_secret_rejected() {
        let (sent, validated) = run_pair(
            Sha256TimeHandshake::new(&b"wrong"[..], 1),
            Sha256TimeHandshake::new(&b"s3cret"[..], 1),
            0,
        )
        .await;
        assert!(matches!(sent, Err(CatsError::Handshake(_))));
        assert!(matches!(validated, Err(CatsError::Handshake(_))));
    }

    #[tokio::test]
    async fn test_clock_skew_within_window_passes() {
        // Client clock 15 s ahead of the server: one ten-second step away
        // after alignment, inside the default window.
        let (sent, validated) = run_pair(
            Sha256TimeHandshake::new(&b"s3cret"[..], 2),
            Sha256TimeHandshake::new(&b"s3cret"[..], 2),
            15_000,
        )
        .await;
        sent.unwrap();
        validated.unwrap();
    }

    #[test]
    fn test_candidate_window_shape() {
        let handshake = Sha256TimeHandshake::new(&b"k"[..], 2);
        let candidates = handshake.candidates(1000);
        assert_eq!(candidates.len(), 5);
        assert!(candidates.contains(&handshake.digest(980)));
        assert!(candidates.contains(&handshake.digest(1000)));
        assert!(candidates.contains(&handshake.digest(1020)));
    }

    #[test]
    fn test_timestamps_floor_to_ten() {
        assert_eq!(Sha256TimeHandshake::aligned(1234), 1230);
        assert_eq!(Sha256TimeHandshake::aligned(1239), 1230);
        assert_eq!(Sha256TimeHandshake::aligned(1240), 1240);
    }

    #[tokio::test(start_paused = true)]
    async fn test_validate_times_out() {
        let (a, b) = tokio::io::duplex(256);
        let (mut br, mut bw) = split_io(b);
        let server = Sha256TimeHandshake::new(&b"s3cret"[..], 1);
        let mut io = HandshakeIo::new(&mut br, &mut bw, 0, Duration::from_secs(5));
        // Client never sends its proof.
        let result = server.validate(&mut io).await;
        assert!(matches!(result, Err(CatsError::Handshake(_))));
        drop(a);
    }
}
