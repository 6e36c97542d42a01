//! Client: connection initiation, request/reply calls, input prompts and
//! broadcast subscriptions.
//!
//! # Example
//!
//! ```ignore
//! use cats::{Client, Config, Incoming, Payload};
//!
//! let client = Client::connect("127.0.0.1:9095", Config::default(), 1).await?;
//! match client.call(0x0001, &b"hello"[..]).await? {
//!     Incoming::Response(action) => println!("{:?}", action.payload),
//!     Incoming::Input(prompt) => {
//!         // The handler wants more data before answering.
//!         let done = prompt.reply(&b"sure"[..]).await?;
//!     }
//! }
//! ```

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::action::{Action, Request, StreamSource};
use crate::codec::Payload;
use crate::compress::CompressorSet;
use crate::config::Config;
use crate::connection::{
    idle_watchdog, ping_loop, recv_loop, BoxedRead, BoxedWrite, Conn, ConnHandle, IncomingKind,
    PeerInfo, Role, Router,
};
use crate::error::{CatsError, Result};
use crate::handler::BoxFuture;
use crate::handshake::HandshakeIo;
use crate::headers::Headers;
use crate::protocol::{tags, unix_ms, PROTOCOL_VERSION};
use crate::statement::{read_statement_body, ClientStatement, ServerStatement};

/// Bounded per-subscription inbox of broadcasts.
const BROADCAST_INBOX: usize = 64;

/// What a call resolves to: either the final response or an intermediate
/// input prompt that must be answered (or cancelled) first.
#[derive(Debug)]
pub enum Incoming {
    Response(Action),
    Input(InputPrompt),
}

impl Incoming {
    /// Unwrap the final response, treating an input prompt as an error.
    pub fn into_response(self) -> Result<Action> {
        match self {
            Self::Response(action) => Ok(action),
            Self::Input(_) => Err(CatsError::protocol(
                "peer asked for input where a final response was expected",
            )),
        }
    }
}

/// A pending input prompt from the peer's handler.
pub struct InputPrompt {
    conn: Arc<Conn>,
    action: Action,
}

impl InputPrompt {
    /// The prompt the handler sent.
    pub fn action(&self) -> &Action {
        &self.action
    }

    /// Answer the prompt and wait for the next action of the exchange.
    pub async fn reply(self, payload: impl Into<Payload>) -> Result<Incoming> {
        self.reply_with(payload, Headers::new()).await
    }

    pub async fn reply_with(
        self,
        payload: impl Into<Payload>,
        mut headers: Headers,
    ) -> Result<Incoming> {
        let message_id = self.action.message_id;
        if self.action.offset() > 0 {
            headers.set_offset(self.action.offset());
        }
        let rx = self.conn.register_waiter(message_id);
        if let Err(err) = self
            .conn
            .send_envelope(tags::INPUT, 0, message_id, &payload.into(), headers, None)
            .await
        {
            self.conn.drop_waiter(message_id);
            self.conn.release_message_id(message_id);
            return Err(err);
        }
        await_incoming(self.conn, rx).await
    }

    /// Cancel the prompt; the handler continues and produces its
    /// fallback response.
    pub async fn cancel(self) -> Result<Incoming> {
        let message_id = self.action.message_id;
        let rx = self.conn.register_waiter(message_id);
        if let Err(err) = self.conn.send_cancel_input(message_id).await {
            self.conn.drop_waiter(message_id);
            self.conn.release_message_id(message_id);
            return Err(err);
        }
        await_incoming(self.conn, rx).await
    }
}

impl std::fmt::Debug for InputPrompt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InputPrompt")
            .field("message_id", &self.action.message_id)
            .field("status", &self.action.status())
            .finish()
    }
}

/// A connected CATS client.
pub struct Client {
    conn: Arc<Conn>,
    subs: Arc<Subscriptions>,
    _tasks: Vec<JoinHandle<()>>,
}

impl Client {
    /// Connect over TCP and run the initialisation sequence.
    pub async fn connect(
        addr: impl ToSocketAddrs,
        conf: Config,
        api_version: u32,
    ) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true).ok();
        let address = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "unknown".into());
        Self::from_stream(stream, address, conf, api_version).await
    }

    /// Run the initialisation sequence over an arbitrary transport.
    pub async fn from_stream<S>(
        stream: S,
        address: impl Into<String>,
        conf: Config,
        api_version: u32,
    ) -> Result<Self>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let address = address.into();
        let (rd, wr) = tokio::io::split(stream);
        let mut rd: BoxedRead = Box::new(rd);
        let mut wr: BoxedWrite = Box::new(wr);

        // Protocol version: u32 out, four zero bytes back on accept.
        wr.write_all(&PROTOCOL_VERSION.to_be_bytes()).await?;
        wr.flush().await?;
        let mut ack = [0u8; 4];
        rd.read_exact(&mut ack).await?;
        if ack != [0u8; 4] {
            return Err(CatsError::protocol(format!(
                "unsupported protocol version; server prefers {}",
                u32::from_be_bytes(ack)
            )));
        }

        let statement = ClientStatement {
            api: api_version,
            client_time: unix_ms(),
            scheme_format: conf.scheme_format,
            compressors: conf.compressors.clone(),
            default_compression: conf.default_compression.clone(),
        };
        statement.validate()?;
        wr.write_all(&statement.pack(conf.scheme_format)?).await?;
        wr.flush().await?;

        let body = read_statement_body(&mut rd).await?;
        let (server, _format) = ServerStatement::unpack(&body)?;
        let time_delta = server.server_time as i64 - statement.client_time as i64;
        debug!(peer = %address, time_delta, "statements exchanged");

        if let Some(handshake) = &conf.handshake {
            let mut io = HandshakeIo::new(&mut rd, &mut wr, time_delta, conf.handshake_timeout);
            handshake.send(&mut io).await?;
        }

        let compressors =
            CompressorSet::from_names(&conf.compressors, conf.default_compression.as_deref());
        let peer = PeerInfo {
            api_version,
            scheme_format: conf.scheme_format,
            time_delta_ms: time_delta,
            address,
        };
        let conn = Conn::new(Role::Client, conf, peer, compressors, wr);
        let subs = Arc::new(Subscriptions::default());
        let router: Arc<dyn Router> = Arc::new(ClientRouter { subs: subs.clone() });

        let tasks = vec![
            tokio::spawn(recv_loop(conn.clone(), rd, router)),
            tokio::spawn(idle_watchdog(conn.clone())),
            tokio::spawn(ping_loop(conn.clone())),
        ];
        Ok(Self {
            conn,
            subs,
            _tasks: tasks,
        })
    }

    /// Issue a request and wait for the response or an input prompt.
    pub async fn call(&self, handler_id: u16, payload: impl Into<Payload>) -> Result<Incoming> {
        self.send(Request::new(handler_id, payload)).await
    }

    /// Issue a prepared [`Request`].
    pub async fn send(&self, request: Request) -> Result<Incoming> {
        if self.conn.is_closed() {
            return Err(CatsError::ConnectionClosed);
        }
        let message_id = self.conn.allocate_message_id()?;
        let rx = self.conn.register_waiter(message_id);
        if let Err(err) = self
            .conn
            .send_envelope(
                tags::ACTION,
                request.handler_id,
                message_id,
                &request.payload,
                request.headers,
                request.compressor,
            )
            .await
        {
            self.conn.drop_waiter(message_id);
            self.conn.release_message_id(message_id);
            return Err(err);
        }
        await_incoming(self.conn.clone(), rx).await
    }

    /// Issue a streaming request: chunks from `source` are framed as a
    /// stream action.
    pub async fn send_stream(
        &self,
        handler_id: u16,
        data_type: u8,
        source: StreamSource,
    ) -> Result<Incoming> {
        self.send_stream_with(handler_id, data_type, source, Headers::new())
            .await
    }

    pub async fn send_stream_with(
        &self,
        handler_id: u16,
        data_type: u8,
        mut source: StreamSource,
        headers: Headers,
    ) -> Result<Incoming> {
        if self.conn.is_closed() {
            return Err(CatsError::ConnectionClosed);
        }
        let message_id = self.conn.allocate_message_id()?;
        let rx = self.conn.register_waiter(message_id);
        if let Err(err) = self
            .conn
            .send_stream(handler_id, message_id, data_type, &mut source, headers, None)
            .await
        {
            self.conn.drop_waiter(message_id);
            self.conn.release_message_id(message_id);
            return Err(err);
        }
        await_incoming(self.conn.clone(), rx).await
    }

    /// Subscribe to server broadcasts for `handler_id`. Broadcasts with
    /// no subscriber are dropped silently; a full inbox drops the newest
    /// broadcast.
    pub fn subscribe(&self, handler_id: u16) -> mpsc::Receiver<Action> {
        self.subs.subscribe(handler_id)
    }

    /// Cap the server's send rate towards us, bytes per second; `0`
    /// lifts the cap.
    pub async fn set_download_speed(&self, speed: u32) -> Result<()> {
        self.conn.send_download_speed(speed).await
    }

    pub fn is_open(&self) -> bool {
        !self.conn.is_closed()
    }

    /// `server_time - client_time` captured at the statement exchange.
    pub fn time_delta_ms(&self) -> i64 {
        self.conn.peer.time_delta_ms
    }

    /// A handle usable by other tasks after the client is dropped.
    pub fn handle(&self) -> ConnHandle {
        ConnHandle(self.conn.clone())
    }

    /// Wait until the connection closes.
    pub async fn closed(&self) {
        self.conn.close_notified().await;
    }

    pub async fn close(&self) {
        self.conn.close(None).await;
    }
}

async fn await_incoming(
    conn: Arc<Conn>,
    rx: oneshot::Receiver<Result<IncomingKind>>,
) -> Result<Incoming> {
    match rx.await {
        Ok(Ok(IncomingKind::Response(action))) => Ok(Incoming::Response(action)),
        Ok(Ok(IncomingKind::Input(action))) => Ok(Incoming::Input(InputPrompt { conn, action })),
        Ok(Err(err)) => Err(err),
        Err(_) => Err(CatsError::ConnectionClosed),
    }
}

/// Broadcast subscriptions: handler id to live inboxes.
#[derive(Default)]
struct Subscriptions {
    map: Mutex<HashMap<u16, Vec<mpsc::Sender<Action>>>>,
}

impl Subscriptions {
    fn subscribe(&self, handler_id: u16) -> mpsc::Receiver<Action> {
        let (tx, rx) = mpsc::channel(BROADCAST_INBOX);
        self.map
            .lock()
            .expect("subscriptions lock")
            .entry(handler_id)
            .or_default()
            .push(tx);
        rx
    }

    fn deliver(&self, action: Action) {
        let mut map = self.map.lock().expect("subscriptions lock");
        let Some(inboxes) = map.get_mut(&action.handler_id) else {
            debug!(
                handler_id = action.handler_id,
                "broadcast without subscriber dropped"
            );
            return;
        };
        inboxes.retain(|tx| !tx.is_closed());
        if inboxes.is_empty() {
            map.remove(&action.handler_id);
            return;
        }
        for tx in inboxes.iter() {
            if let Err(mpsc::error::TrySendError::Full(_)) = tx.try_send(action.clone()) {
                warn!(
                    handler_id = action.handler_id,
                    "broadcast inbox full; dropping"
                );
            }
        }
    }

    fn clear(&self) {
        self.map.lock().expect("subscriptions lock").clear();
    }
}

/// Client-side inbound routing: broadcasts go to subscriptions; the
/// request path is not served on this side.
struct ClientRouter {
    subs: Arc<Subscriptions>,
}

impl Router for ClientRouter {
    fn on_request(&self, conn: &Arc<Conn>, action: Action, _stream: bool) -> Result<()> {
        if conn.is_message_active(action.message_id) {
            // Late response for an exchange whose prompt was abandoned.
            debug!(
                message_id = %format_args!("{:#06x}", action.message_id),
                "dropping action for an abandoned exchange"
            );
            return Ok(());
        }
        Err(CatsError::protocol(format!(
            "unexpected request-range action {:#06x} with no pending waiter",
            action.message_id
        )))
    }

    fn on_broadcast(&self, action: Action) {
        self.subs.deliver(action);
    }

    fn on_close<'a>(&'a self, _conn: &'a Arc<Conn>) -> BoxFuture<'a, ()> {
        Box::pin(async move { self.subs.clear() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn subs_action(handler_id: u16) -> Action {
        Action {
            handler_id,
            message_id: 0x8001,
            send_time: 0,
            headers: Headers::new(),
            payload: Payload::empty(),
        }
    }

    #[tokio::test]
    async fn test_subscriptions_deliver_in_order() {
        let subs = Subscriptions::default();
        let mut rx = subs.subscribe(5);
        subs.deliver(subs_action(5));
        subs.deliver(subs_action(5));
        assert_eq!(rx.recv().await.unwrap().handler_id, 5);
        assert_eq!(rx.recv().await.unwrap().handler_id, 5);
    }

    #[tokio::test]
    async fn test_unsubscribed_broadcast_dropped_silently() {
        let subs = Subscriptions::default();
        subs.deliver(subs_action(9));
    }

    #[tokio::test]
    async fn test_dropped_receiver_is_pruned() {
        let subs = Subscriptions::default();
        let rx = subs.subscribe(5);
        drop(rx);
        subs.deliver(subs_action(5));
        assert!(subs.map.lock().unwrap().get(&5).is_none());
    }

    #[tokio::test]
    async fn test_full_inbox_drops_newest() {
        let subs = Subscriptions::default();
        let mut rx = subs.subscribe(5);
        for _ in 0..(BROADCAST_INBOX + 10) {
            subs.deliver(subs_action(5));
        }
        let mut received = 0;
        while rx.try_recv().is_ok() {
            received += 1;
        }
        assert_eq!(received, BROADCAST_INBOX);
    }
}
