//! Request context for handlers.
//!
//! A [`Context`] owns the inbound action and a handle back onto the
//! connection, so a handler can inspect the request, prompt the peer for
//! more input mid-flight ([`Context::ask`]), join broadcast channels, or
//! push unrelated actions through [`Context::connection`].

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::action::Action;
use crate::codec::Payload;
use crate::compress::Compressor;
use crate::connection::{Conn, ConnHandle};
use crate::error::{CatsError, Result};
use crate::headers::Headers;
use crate::protocol::tags;
use crate::scheme::SchemeFormat;
use crate::server::Channels;

/// Options for [`Context::ask_with`].
#[derive(Default)]
pub struct AskOptions {
    pub headers: Headers,
    pub status: Option<u16>,
    /// Overrides the configured `input_timeout`; zero disables the timer.
    pub timeout: Option<Duration>,
    /// Skip the nested-ask depth check.
    pub bypass_limit: bool,
    /// Do not count this ask against the depth limit.
    pub bypass_count: bool,
    pub compressor: Option<Compressor>,
}

/// Per-request context handed to a [`crate::handler::Handler`].
pub struct Context {
    action: Action,
    conn: Arc<Conn>,
    channels: Option<Arc<Channels>>,
    ask_depth: AtomicUsize,
}

impl Context {
    pub(crate) fn new(action: Action, conn: Arc<Conn>, channels: Option<Arc<Channels>>) -> Self {
        Self {
            action,
            conn,
            channels,
            ask_depth: AtomicUsize::new(0),
        }
    }

    /// The request being handled.
    pub fn action(&self) -> &Action {
        &self.action
    }

    pub fn payload(&self) -> &Payload {
        &self.action.payload
    }

    pub fn headers(&self) -> &Headers {
        &self.action.headers
    }

    pub fn handler_id(&self) -> u16 {
        self.action.handler_id
    }

    pub fn message_id(&self) -> u16 {
        self.action.message_id
    }

    /// Api version the peer declared in its statement.
    pub fn api_version(&self) -> u32 {
        self.conn.peer.api_version
    }

    /// Scheme format negotiated for this connection.
    pub fn scheme_format(&self) -> SchemeFormat {
        self.conn.peer.scheme_format
    }

    /// `server_time - client_time` captured at the statement exchange,
    /// for clock-skew correction.
    pub fn time_delta_ms(&self) -> i64 {
        self.conn.peer.time_delta_ms
    }

    /// A handle onto the connection, usable outside the handler's
    /// lifetime.
    pub fn connection(&self) -> ConnHandle {
        ConnHandle(self.conn.clone())
    }

    /// Prompt the peer for intermediate input and suspend until it
    /// replies, the prompt is cancelled, or the input timer fires.
    pub async fn ask(&self, payload: impl Into<Payload>) -> Result<Action> {
        self.ask_with(payload, AskOptions::default()).await
    }

    /// [`Context::ask`] with explicit options.
    pub async fn ask_with(&self, payload: impl Into<Payload>, opts: AskOptions) -> Result<Action> {
        if !opts.bypass_limit && self.ask_depth.load(Ordering::SeqCst) >= self.conn.conf.input_limit
        {
            return Err(CatsError::InputLimitExceeded);
        }
        if !opts.bypass_count {
            self.ask_depth.fetch_add(1, Ordering::SeqCst);
        }

        let message_id = self.action.message_id;
        let rx = self.conn.register_input(message_id)?;
        let mut headers = opts.headers;
        if let Some(status) = opts.status {
            headers.set_status(status);
        }
        if let Err(err) = self
            .conn
            .send_envelope(
                tags::INPUT,
                0,
                message_id,
                &payload.into(),
                headers,
                opts.compressor,
            )
            .await
        {
            self.conn.take_input(message_id);
            return Err(err);
        }

        let timeout = opts.timeout.unwrap_or(self.conn.conf.input_timeout);
        let received = if timeout.is_zero() {
            rx.await
        } else {
            match tokio::time::timeout(timeout, rx).await {
                Ok(received) => received,
                Err(_) => {
                    self.conn.take_input(message_id);
                    return Err(CatsError::InputTimeout);
                }
            }
        };
        match received {
            Ok(result) => result,
            Err(_) => Err(CatsError::ConnectionClosed),
        }
    }

    /// Attach this connection to a named broadcast channel. Server side
    /// only.
    pub async fn join_channel(&self, name: &str) -> Result<()> {
        let channels = self.channels()?;
        channels.attach(name, self.connection()).await;
        Ok(())
    }

    /// Detach this connection from a named broadcast channel.
    pub async fn leave_channel(&self, name: &str) -> Result<()> {
        let channels = self.channels()?;
        channels.detach(name, &self.connection()).await;
        Ok(())
    }

    fn channels(&self) -> Result<&Arc<Channels>> {
        self.channels.as_ref().ok_or_else(|| {
            CatsError::protocol("broadcast channels are not available on this side")
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compress::CompressorSet;
    use crate::config::Config;
    use crate::connection::{PeerInfo, Role};

    /// The peer half is returned so writes into the duplex keep working.
    fn test_context(conf: Config) -> (Context, tokio::io::DuplexStream) {
        let (a, b) = tokio::io::duplex(1 << 16);
        let (_, wr) = tokio::io::split(a);
        let conn = Conn::new(
            Role::Server,
            conf,
            PeerInfo {
                api_version: 1,
                scheme_format: SchemeFormat::Json,
                time_delta_ms: 0,
                address: "test".into(),
            },
            CompressorSet::default(),
            Box::new(wr),
        );
        let action = Action {
            handler_id: 1,
            message_id: 0x0042,
            send_time: 0,
            headers: Headers::new(),
            payload: Payload::empty(),
        };
        (Context::new(action, conn, None), b)
    }

    #[tokio::test]
    async fn test_ask_respects_input_limit() {
        let (ctx, _peer) = test_context(Config {
            input_limit: 0,
            ..Config::default()
        });
        let err = ctx.ask(&b"more?"[..]).await.unwrap_err();
        assert!(matches!(err, CatsError::InputLimitExceeded));
    }

    #[tokio::test]
    async fn test_ask_bypass_limit_skips_the_check() {
        let (ctx, _peer) = test_context(Config {
            input_limit: 0,
            input_timeout: Duration::from_millis(20),
            ..Config::default()
        });
        let err = ctx
            .ask_with(
                &b"more?"[..],
                AskOptions {
                    bypass_limit: true,
                    ..AskOptions::default()
                },
            )
            .await
            .unwrap_err();
        // Passed the limit check; nobody replies, so the timer fires.
        assert!(matches!(err, CatsError::InputTimeout));
    }

    #[tokio::test]
    async fn test_ask_resolves_with_peer_reply() {
        let (ctx, _peer) = test_context(Config::default());
        let conn = ctx.conn.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            let reply = Action {
                handler_id: 0,
                message_id: 0x0042,
                send_time: 0,
                headers: Headers::new(),
                payload: Payload::from(&b"yes"[..]),
            };
            conn.take_input(0x0042).unwrap().send(Ok(reply)).unwrap();
        });
        let reply = ctx.ask(&b"are you ok?"[..]).await.unwrap();
        assert_eq!(&reply.payload.as_bytes().unwrap()[..], b"yes");
    }

    #[tokio::test]
    async fn test_ask_cancelled_by_peer() {
        let (ctx, _peer) = test_context(Config::default());
        let conn = ctx.conn.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            conn.take_input(0x0042)
                .unwrap()
                .send(Err(CatsError::InputCancelled))
                .unwrap();
        });
        let err = ctx.ask(&b"are you ok?"[..]).await.unwrap_err();
        assert!(matches!(err, CatsError::InputCancelled));
    }

    #[tokio::test]
    async fn test_ask_depth_accumulates() {
        let (ctx, _peer) = test_context(Config {
            input_limit: 2,
            input_timeout: Duration::from_millis(10),
            ..Config::default()
        });
        for _ in 0..2 {
            let err = ctx.ask(&b"?"[..]).await.unwrap_err();
            assert!(matches!(err, CatsError::InputTimeout));
        }
        let err = ctx.ask(&b"?"[..]).await.unwrap_err();
        assert!(matches!(err, CatsError::InputLimitExceeded));
    }

    #[tokio::test]
    async fn test_channels_unavailable_without_application() {
        let (ctx, _peer) = test_context(Config::default());
        assert!(ctx.join_channel("news").await.is_err());
    }
}
