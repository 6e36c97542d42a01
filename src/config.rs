//! Connection configuration.

use std::sync::Arc;
use std::time::Duration;

use crate::handshake::Handshake;
use crate::scheme::SchemeFormat;

/// Default spill-to-disk threshold and non-file payload cap.
pub const DEFAULT_MAX_IN_MEMORY: usize = 8 * 1024 * 1024;

/// Tunables shared by servers and clients.
///
/// A zero duration disables the corresponding timer.
#[derive(Clone)]
pub struct Config {
    /// Close the connection after this long without a completed action.
    pub idle_timeout: Duration,
    /// How long a handler's `ask` waits for the peer's reply.
    pub input_timeout: Duration,
    /// The whole handshake phase must finish within this window.
    pub handshake_timeout: Duration,
    /// Maximum depth of nested `ask` calls per request.
    pub input_limit: usize,
    /// Optional authenticated handshake, run after the statements.
    pub handshake: Option<Arc<dyn Handshake>>,
    /// Payloads above this spill to temp files; non-file payloads above it
    /// are rejected.
    pub max_in_memory: usize,
    /// Scheme format this side declares (client) or falls back to
    /// (server).
    pub scheme_format: SchemeFormat,
    /// Compressors this side offers, in preference order.
    pub compressors: Vec<String>,
    /// Preferred compressor for large payloads.
    pub default_compression: Option<String>,
    /// Emit keepalive pings at 0.9 x `idle_timeout`.
    pub ping: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(120),
            input_timeout: Duration::from_secs(120),
            handshake_timeout: Duration::from_secs(5),
            input_limit: 5,
            handshake: None,
            max_in_memory: DEFAULT_MAX_IN_MEMORY,
            scheme_format: SchemeFormat::Json,
            compressors: vec!["gzip".into(), "zlib".into()],
            default_compression: Some("zlib".into()),
            ping: true,
        }
    }
}

impl Config {
    pub fn with_handshake(mut self, handshake: Arc<dyn Handshake>) -> Self {
        self.handshake = Some(handshake);
        self
    }

    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    pub fn with_input_timeout(mut self, timeout: Duration) -> Self {
        self.input_timeout = timeout;
        self
    }

    pub fn with_scheme_format(mut self, format: SchemeFormat) -> Self {
        self.scheme_format = format;
        self
    }

    /// Interval between keepalive pings, when enabled.
    pub(crate) fn ping_interval(&self) -> Option<Duration> {
        if !self.ping || self.idle_timeout.is_zero() {
            return None;
        }
        let interval = self.idle_timeout.mul_f64(0.9);
        Some(interval.max(Duration::from_millis(100)))
    }
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("idle_timeout", &self.idle_timeout)
            .field("input_timeout", &self.input_timeout)
            .field("handshake_timeout", &self.handshake_timeout)
            .field("input_limit", &self.input_limit)
            .field("handshake", &self.handshake.as_ref().map(|_| "<configured>"))
            .field("max_in_memory", &self.max_in_memory)
            .field("scheme_format", &self.scheme_format)
            .field("compressors", &self.compressors)
            .field("default_compression", &self.default_compression)
            .field("ping", &self.ping)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let conf = Config::default();
        assert_eq!(conf.idle_timeout, Duration::from_secs(120));
        assert_eq!(conf.input_limit, 5);
        assert_eq!(conf.max_in_memory, 8 * 1024 * 1024);
        assert!(conf.handshake.is_none());
        assert_eq!(conf.scheme_format, SchemeFormat::Json);
    }

    #[test]
    fn test_ping_interval() {
        let conf = Config::default();
        assert_eq!(conf.ping_interval(), Some(Duration::from_secs(108)));

        let silent = Config {
            ping: false,
            ..Config::default()
        };
        assert_eq!(silent.ping_interval(), None);

        let no_idle = Config {
            idle_timeout: Duration::ZERO,
            ..Config::default()
        };
        assert_eq!(no_idle.ping_interval(), None);

        let tiny = Config {
            idle_timeout: Duration::from_millis(10),
            ..Config::default()
        };
        assert_eq!(tiny.ping_interval(), Some(Duration::from_millis(100)));
    }
}
