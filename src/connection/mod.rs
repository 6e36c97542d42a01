//! The connection core shared by servers and clients.
//!
//! A [`Conn`] owns everything both sides of the protocol need once the
//! initialisation phase is over: the framed writer behind the write lock,
//! the pending-waiter pools, message-id allocation, the idle timer and the
//! download-speed cell. The inbound half lives in [`recv_loop`], which
//! classifies every action and either wakes a waiter or hands the action
//! to the side-specific [`Router`].
//!
//! Waiter rules (one connection):
//! - request/reply ids (`0x0000..=0x7FFF`) are allocated by the
//!   originator from an incrementing counter, skipping ids still in
//!   flight;
//! - an inbound action whose id has a registered waiter wakes that waiter;
//! - an inbound action in the broadcast range with no waiter goes to the
//!   broadcast listener, or is dropped;
//! - an inbound request/reply action with no waiter is a fresh request for
//!   the router;
//! - an input reply must match a pending input or call waiter, otherwise
//!   the connection dies with a protocol error.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{oneshot, watch};
use tracing::{debug, warn};

use crate::action::{Action, Response, ResponseBody, StreamSource};
use crate::codec::{self, Payload};
use crate::compress::{self, Compressor, CompressorSet};
use crate::config::Config;
use crate::error::{CatsError, Result};
use crate::handshake::BoxFuture;
use crate::headers::Headers;
use crate::protocol::head::{ActionHead, InputHead, StreamHead};
use crate::protocol::spool::{compress_buf, decompress_buf, PayloadBuf};
use crate::protocol::wire::{FrameReader, FrameWriter, RawAction, WireError};
use crate::protocol::{tags, unix_ms};
use crate::rate::Pacer;
use crate::scheme::SchemeFormat;

pub(crate) type BoxedRead = Box<dyn AsyncRead + Send + Unpin>;
pub(crate) type BoxedWrite = Box<dyn AsyncWrite + Send + Unpin>;

/// Streams propose a compressor before any chunk exists; this stands in
/// for the unknown payload size.
const PROPOSAL_PLACEHOLDER_LEN: u64 = 5000;

/// Accepted bounds for an inbound `DownloadSpeedAction` (besides 0).
const DOWNLOAD_SPEED_MIN: u32 = 1024;
const DOWNLOAD_SPEED_MAX: u32 = 33_554_432;

/// Which side of the connection this is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Role {
    Client,
    Server,
}

/// Facts negotiated during initialisation.
#[derive(Debug, Clone)]
pub(crate) struct PeerInfo {
    pub api_version: u32,
    pub scheme_format: SchemeFormat,
    /// `server_time - client_time`, milliseconds. Zero on the server.
    pub time_delta_ms: i64,
    pub address: String,
}

/// What a call waiter resolves with.
#[derive(Debug)]
pub(crate) enum IncomingKind {
    /// The final response for the message id.
    Response(Action),
    /// An intermediate input prompt; the id stays in flight.
    Input(Action),
}

/// Side-specific inbound routing: fresh requests and broadcasts.
pub(crate) trait Router: Send + Sync + 'static {
    /// A request-range action with no waiter. Must not block.
    fn on_request(&self, conn: &Arc<Conn>, action: Action, stream: bool) -> Result<()>;
    /// A broadcast-range action with no listener contract.
    fn on_broadcast(&self, action: Action);
    /// The connection finished closing.
    fn on_close<'a>(&'a self, conn: &'a Arc<Conn>) -> BoxFuture<'a, ()>;
}

/// Resettable deadline for the idle timer.
pub(crate) struct IdleTimer {
    timeout: Duration,
    deadline: Mutex<tokio::time::Instant>,
}

impl IdleTimer {
    fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            deadline: Mutex::new(tokio::time::Instant::now() + timeout),
        }
    }

    pub fn enabled(&self) -> bool {
        !self.timeout.is_zero()
    }

    pub fn touch(&self) {
        if self.enabled() {
            *self.deadline.lock().expect("idle timer lock") =
                tokio::time::Instant::now() + self.timeout;
        }
    }

    fn deadline(&self) -> tokio::time::Instant {
        *self.deadline.lock().expect("idle timer lock")
    }
}

/// Per-connection shared state.
pub(crate) struct Conn {
    pub conf: Config,
    pub role: Role,
    pub peer: PeerInfo,
    pub compressors: CompressorSet,
    writer: tokio::sync::Mutex<Option<FrameWriter<BoxedWrite>>>,
    download_speed: Arc<AtomicU32>,
    recv_pool: Mutex<HashMap<u16, oneshot::Sender<Result<IncomingKind>>>>,
    input_pool: Mutex<HashMap<u16, oneshot::Sender<Result<Action>>>>,
    message_pool: Mutex<HashSet<u16>>,
    next_id: Mutex<u16>,
    pub(crate) idle: IdleTimer,
    close_started: AtomicBool,
    closed_tx: watch::Sender<bool>,
}

impl Conn {
    pub fn new(
        role: Role,
        conf: Config,
        peer: PeerInfo,
        compressors: CompressorSet,
        wr: BoxedWrite,
    ) -> Arc<Self> {
        let download_speed = Arc::new(AtomicU32::new(0));
        let writer = FrameWriter::new(wr, Pacer::new(download_speed.clone()));
        let idle = IdleTimer::new(conf.idle_timeout);
        let (closed_tx, _) = watch::channel(false);
        Arc::new(Self {
            conf,
            role,
            peer,
            compressors,
            writer: tokio::sync::Mutex::new(Some(writer)),
            download_speed,
            recv_pool: Mutex::new(HashMap::new()),
            input_pool: Mutex::new(HashMap::new()),
            message_pool: Mutex::new(HashSet::new()),
            next_id: Mutex::new(0),
            idle,
            close_started: AtomicBool::new(false),
            closed_tx,
        })
    }

    pub fn is_closed(&self) -> bool {
        *self.closed_tx.borrow()
    }

    /// Resolve when the connection has started closing.
    pub async fn close_notified(&self) {
        let mut rx = self.closed_tx.subscribe();
        if *rx.borrow() {
            return;
        }
        let _ = rx.wait_for(|closed| *closed).await;
    }

    /// Sender clock for outbound `send_time` fields, aligned to the
    /// server's clock. The stored delta is `server_time - client_time`,
    /// so only the client applies it.
    pub fn peer_time_ms(&self) -> u64 {
        match self.role {
            Role::Client => (unix_ms() as i64 + self.peer.time_delta_ms).max(0) as u64,
            Role::Server => unix_ms(),
        }
    }

    fn set_download_speed(&self, speed: u32) {
        self.download_speed.store(speed, Ordering::Relaxed);
    }

    // ---- message id bookkeeping -------------------------------------

    /// Allocate an outbound id from this side's half-range: incrementing
    /// counter, skipping ids still in flight.
    pub fn allocate_message_id(&self) -> Result<u16> {
        let base = match self.role {
            Role::Client => 0u16,
            Role::Server => crate::action::BROADCAST_BASE,
        };
        let span = 0x8000u16;
        let mut pool = self.message_pool.lock().expect("message pool lock");
        let mut next = self.next_id.lock().expect("next id lock");
        for _ in 0..span {
            let candidate = base + *next;
            *next = (*next + 1) % span;
            if pool.insert(candidate) {
                return Ok(candidate);
            }
        }
        Err(CatsError::protocol("message id space exhausted"))
    }

    /// Reserve an id observed on an inbound request. `false` if it is
    /// already in flight.
    pub fn reserve_message_id(&self, id: u16) -> bool {
        self.message_pool
            .lock()
            .expect("message pool lock")
            .insert(id)
    }

    pub fn release_message_id(&self, id: u16) {
        self.message_pool
            .lock()
            .expect("message pool lock")
            .remove(&id);
    }

    /// Whether an id is reserved by an exchange still in flight.
    pub fn is_message_active(&self, id: u16) -> bool {
        self.message_pool
            .lock()
            .expect("message pool lock")
            .contains(&id)
    }

    // ---- waiter pools -----------------------------------------------

    /// Register a call waiter. The id must already be reserved.
    pub fn register_waiter(&self, id: u16) -> oneshot::Receiver<Result<IncomingKind>> {
        let (tx, rx) = oneshot::channel();
        self.recv_pool.lock().expect("recv pool lock").insert(id, tx);
        rx
    }

    fn take_waiter(&self, id: u16) -> Option<oneshot::Sender<Result<IncomingKind>>> {
        self.recv_pool.lock().expect("recv pool lock").remove(&id)
    }

    pub fn drop_waiter(&self, id: u16) {
        self.take_waiter(id);
    }

    /// Register a pending input for a handler's `ask`. At most one per
    /// message id.
    pub fn register_input(&self, id: u16) -> Result<oneshot::Receiver<Result<Action>>> {
        let mut pool = self.input_pool.lock().expect("input pool lock");
        if pool.contains_key(&id) {
            return Err(CatsError::protocol(format!(
                "input prompt for message {id:#06x} already pending"
            )));
        }
        let (tx, rx) = oneshot::channel();
        pool.insert(id, tx);
        Ok(rx)
    }

    pub fn take_input(&self, id: u16) -> Option<oneshot::Sender<Result<Action>>> {
        self.input_pool.lock().expect("input pool lock").remove(&id)
    }

    // ---- send paths -------------------------------------------------

    /// Encode, compress and emit a sized-envelope action under the write
    /// lock.
    pub async fn send_envelope(
        &self,
        tag: u8,
        handler_id: u16,
        message_id: u16,
        payload: &Payload,
        mut headers: Headers,
        explicit: Option<Compressor>,
    ) -> Result<()> {
        let offset = headers.offset();
        let (plain, data_type) =
            codec::encode(payload, &mut headers, offset, self.peer.scheme_format)?;
        let (packed, compressor) =
            compress_buf(plain, &mut headers, &self.compressors, explicit, data_type).await?;
        let headers_bytes = headers.encode(self.peer.scheme_format)?;
        let data_len = headers_bytes.len() as u64 + 2 + packed.len();
        if data_len > u32::MAX as u64 {
            return Err(CatsError::Malformed(format!(
                "{data_len} byte envelope does not fit a u32 length"
            )));
        }

        let head = match tag {
            tags::ACTION => ActionHead {
                handler_id,
                message_id,
                send_time: self.peer_time_ms(),
                data_type,
                compressor: compressor.id(),
                data_len: data_len as u32,
            }
            .encode()
            .to_vec(),
            tags::INPUT => InputHead {
                message_id,
                data_type,
                compressor: compressor.id(),
                data_len: data_len as u32,
            }
            .encode()
            .to_vec(),
            other => {
                return Err(CatsError::protocol(format!(
                    "tag {other:#04x} is not an envelope action"
                )))
            }
        };

        debug!(
            peer = %self.peer.address,
            message_id = %format_args!("{message_id:#06x}"),
            codec = codec::type_name(data_type),
            compressor = compressor.name(),
            len = data_len,
            "send action"
        );
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(CatsError::ConnectionClosed)?;
        writer
            .write_action(tag, &head, &headers_bytes, &packed)
            .await?;
        drop(guard);
        self.idle.touch();
        Ok(())
    }

    /// Emit a stream action: headers first, then each chunk compressed
    /// independently under the write lock.
    pub async fn send_stream(
        &self,
        handler_id: u16,
        message_id: u16,
        data_type: u8,
        source: &mut StreamSource,
        headers: Headers,
        explicit: Option<Compressor>,
    ) -> Result<()> {
        let offset = headers.offset();
        let compressor = explicit.unwrap_or_else(|| {
            compress::propose(
                PROPOSAL_PLACEHOLDER_LEN,
                data_type,
                &headers,
                self.compressors.default_compressor(),
            )
        });
        if !self.compressors.allows(compressor) {
            return Err(CatsError::Compressor(format!(
                "compression unsupported by peer: {}",
                compressor.name()
            )));
        }
        let head = StreamHead {
            handler_id,
            message_id,
            send_time: self.peer_time_ms(),
            data_type,
            compressor: compressor.id(),
        }
        .encode();
        let headers_bytes = headers.encode(self.peer.scheme_format)?;

        debug!(
            peer = %self.peer.address,
            message_id = %format_args!("{message_id:#06x}"),
            codec = codec::type_name(data_type),
            compressor = compressor.name(),
            "send stream"
        );
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(CatsError::ConnectionClosed)?;
        writer
            .write_stream(
                &head,
                &headers_bytes,
                source,
                offset,
                compressor,
                &self.compressors,
                data_type,
            )
            .await?;
        drop(guard);
        self.idle.touch();
        Ok(())
    }

    /// Send a handler's response, stamping it with the request identity.
    pub async fn send_response(
        &self,
        handler_id: u16,
        message_id: u16,
        response: Response,
    ) -> Result<()> {
        match response.body {
            ResponseBody::Payload(payload) => {
                self.send_envelope(
                    tags::ACTION,
                    handler_id,
                    message_id,
                    &payload,
                    response.headers,
                    response.compressor,
                )
                .await
            }
            ResponseBody::Stream {
                data_type,
                mut source,
            } => {
                self.send_stream(
                    handler_id,
                    message_id,
                    data_type,
                    &mut source,
                    response.headers,
                    response.compressor,
                )
                .await
            }
        }
    }

    async fn send_control(&self, frame: &[u8]) -> Result<()> {
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(CatsError::ConnectionClosed)?;
        writer.write_control(frame).await?;
        drop(guard);
        self.idle.touch();
        Ok(())
    }

    pub async fn send_ping(&self) -> Result<()> {
        let mut frame = vec![tags::PING];
        frame.extend_from_slice(&self.peer_time_ms().to_be_bytes());
        self.send_control(&frame).await
    }

    pub async fn send_cancel_input(&self, message_id: u16) -> Result<()> {
        let mut frame = vec![tags::CANCEL_INPUT];
        frame.extend_from_slice(&message_id.to_be_bytes());
        self.send_control(&frame).await
    }

    pub async fn send_download_speed(&self, speed: u32) -> Result<()> {
        let mut frame = vec![tags::DOWNLOAD_SPEED];
        frame.extend_from_slice(&speed.to_be_bytes());
        self.send_control(&frame).await
    }

    // ---- inbound decode ---------------------------------------------

    /// Decompress and decode a received envelope into an [`Action`].
    async fn decode_envelope(
        &self,
        handler_id: u16,
        message_id: u16,
        send_time: u64,
        data_type: u8,
        compressor_id: u8,
        headers: Headers,
        payload: PayloadBuf,
        already_plain: bool,
    ) -> Result<Action> {
        let plain = if already_plain {
            payload
        } else {
            let compressor = Compressor::from_id(compressor_id).ok_or_else(|| {
                CatsError::Compressor(format!("unknown compressor {compressor_id:#04x}"))
            })?;
            decompress_buf(payload, &headers, compressor).await?
        };
        let payload = codec::decode(plain, data_type, &headers, self.peer.scheme_format).await?;
        Ok(Action {
            handler_id,
            message_id,
            send_time,
            headers,
            payload,
        })
    }

    // ---- shutdown ---------------------------------------------------

    /// Transition to `CLOSED`: fail every waiter with `ConnectionClosed`,
    /// close the transport. Idempotent.
    pub async fn close(&self, reason: Option<&CatsError>) {
        if self.close_started.swap(true, Ordering::SeqCst) {
            return;
        }
        match reason {
            Some(err) => warn!(peer = %self.peer.address, error = %err, "closing connection"),
            None => debug!(peer = %self.peer.address, "closing connection"),
        }
        let _ = self.closed_tx.send(true);

        let waiters: Vec<_> = {
            let mut pool = self.recv_pool.lock().expect("recv pool lock");
            pool.drain().map(|(_, tx)| tx).collect()
        };
        for tx in waiters {
            let _ = tx.send(Err(CatsError::ConnectionClosed));
        }
        let inputs: Vec<_> = {
            let mut pool = self.input_pool.lock().expect("input pool lock");
            pool.drain().map(|(_, tx)| tx).collect()
        };
        for tx in inputs {
            let _ = tx.send(Err(CatsError::ConnectionClosed));
        }

        let writer = self.writer.lock().await.take();
        if let Some(mut writer) = writer {
            let _ = writer.shutdown().await;
        }
    }
}

// ---- connection tasks ------------------------------------------------

/// Close the connection when the idle deadline passes without activity.
pub(crate) async fn idle_watchdog(conn: Arc<Conn>) {
    if !conn.idle.enabled() {
        return;
    }
    loop {
        let deadline = conn.idle.deadline();
        tokio::select! {
            _ = conn.close_notified() => return,
            _ = tokio::time::sleep_until(deadline) => {}
        }
        if conn.is_closed() {
            return;
        }
        if conn.idle.deadline() <= tokio::time::Instant::now() {
            debug!(peer = %conn.peer.address, "idle timeout");
            conn.close(None).await;
            return;
        }
    }
}

/// Emit keepalive pings at the configured cadence.
pub(crate) async fn ping_loop(conn: Arc<Conn>) {
    let Some(interval) = conn.conf.ping_interval() else {
        return;
    };
    loop {
        tokio::select! {
            _ = conn.close_notified() => return,
            _ = tokio::time::sleep(interval) => {}
        }
        if conn.is_closed() {
            return;
        }
        if let Err(err) = conn.send_ping().await {
            debug!(peer = %conn.peer.address, error = %err, "ping failed");
            conn.close(Some(&err)).await;
            return;
        }
    }
}

/// The per-connection dispatch loop: read, classify, route.
///
/// Runs until the transport closes or a fatal error occurs, then drives
/// the `CLOSED` transition and notifies the router.
pub(crate) async fn recv_loop(conn: Arc<Conn>, rd: BoxedRead, router: Arc<dyn Router>) {
    let mut reader = FrameReader::new(rd, conn.conf.max_in_memory, conn.peer.scheme_format);
    let reason = loop {
        let next = tokio::select! {
            biased;
            _ = conn.close_notified() => break None,
            next = reader.next() => next,
        };
        conn.idle.touch();
        match next {
            Ok(raw) => match handle_raw(&conn, router.as_ref(), raw).await {
                Ok(()) => {}
                Err(err) if err.is_fatal() => break Some(err),
                Err(err) => {
                    warn!(peer = %conn.peer.address, error = %err, "exchange failed")
                }
            },
            Err(WireError::Fatal(CatsError::ConnectionClosed)) => break None,
            Err(WireError::Fatal(err)) => break Some(err),
            Err(WireError::Exchange {
                tag,
                handler_id,
                message_id,
                err,
            }) => {
                if let Err(fatal) =
                    handle_exchange_error(&conn, tag, handler_id, message_id, err).await
                {
                    break Some(fatal);
                }
            }
        }
    };
    conn.close(reason.as_ref()).await;
    router.on_close(&conn).await;
}

async fn handle_raw(conn: &Arc<Conn>, router: &dyn Router, raw: RawAction) -> Result<()> {
    match raw {
        RawAction::Ping(send_time) => {
            debug!(peer = %conn.peer.address, send_time, "ping");
            if conn.role == Role::Server {
                conn.send_ping().await?;
            }
            Ok(())
        }
        RawAction::DownloadSpeed(speed) => {
            if speed == 0 || (DOWNLOAD_SPEED_MIN..=DOWNLOAD_SPEED_MAX).contains(&speed) {
                debug!(peer = %conn.peer.address, speed, "download speed set");
                conn.set_download_speed(speed);
                Ok(())
            } else {
                Err(CatsError::protocol(format!(
                    "unsupported download speed limit {speed}"
                )))
            }
        }
        RawAction::CancelInput(message_id) => {
            if let Some(tx) = conn.take_input(message_id) {
                let _ = tx.send(Err(CatsError::InputCancelled));
            }
            Ok(())
        }
        RawAction::StartEncryption { .. } | RawAction::StopEncryption => {
            debug!(peer = %conn.peer.address, "reserved encryption action ignored");
            Ok(())
        }
        RawAction::Action {
            head,
            headers,
            payload,
        } => {
            let decoded = conn
                .decode_envelope(
                    head.handler_id,
                    head.message_id,
                    head.send_time,
                    head.data_type,
                    head.compressor,
                    headers,
                    payload,
                    false,
                )
                .await;
            match decoded {
                Ok(action) => route_action(conn, router, action, false),
                Err(err) if err.is_fatal() => Err(err),
                Err(err) => {
                    handle_exchange_error(conn, tags::ACTION, head.handler_id, head.message_id, err)
                        .await
                }
            }
        }
        RawAction::Stream {
            head,
            headers,
            payload,
        } => {
            let decoded = conn
                .decode_envelope(
                    head.handler_id,
                    head.message_id,
                    head.send_time,
                    head.data_type,
                    head.compressor,
                    headers,
                    payload,
                    true,
                )
                .await;
            match decoded {
                Ok(action) => route_action(conn, router, action, true),
                Err(err) if err.is_fatal() => Err(err),
                Err(err) => {
                    handle_exchange_error(conn, tags::STREAM, head.handler_id, head.message_id, err)
                        .await
                }
            }
        }
        RawAction::Input {
            head,
            headers,
            payload,
        } => {
            let decoded = conn
                .decode_envelope(
                    0,
                    head.message_id,
                    0,
                    head.data_type,
                    head.compressor,
                    headers,
                    payload,
                    false,
                )
                .await;
            match decoded {
                Ok(action) => route_input(conn, action),
                Err(err) if err.is_fatal() => Err(err),
                Err(err) => {
                    handle_exchange_error(conn, tags::INPUT, 0, head.message_id, err).await
                }
            }
        }
    }
}

/// Classify a decoded request/response action per the multiplexer rules.
fn route_action(
    conn: &Arc<Conn>,
    router: &dyn Router,
    action: Action,
    stream: bool,
) -> Result<()> {
    let message_id = action.message_id;
    if let Some(tx) = conn.take_waiter(message_id) {
        conn.release_message_id(message_id);
        let _ = tx.send(Ok(IncomingKind::Response(action)));
        return Ok(());
    }
    if action.is_broadcast() {
        router.on_broadcast(action);
        return Ok(());
    }
    router.on_request(conn, action, stream)
}

/// An input action matches a pending `ask`, or (on the originator side) a
/// call waiter expecting a prompt. Anything else is fatal.
fn route_input(conn: &Arc<Conn>, action: Action) -> Result<()> {
    let message_id = action.message_id;
    if let Some(tx) = conn.take_input(message_id) {
        let _ = tx.send(Ok(action));
        return Ok(());
    }
    if let Some(tx) = conn.take_waiter(message_id) {
        // The id stays in flight: the caller will answer the prompt.
        let _ = tx.send(Ok(IncomingKind::Input(action)));
        return Ok(());
    }
    Err(CatsError::protocol(format!(
        "input reply for message {message_id:#06x} without a pending waiter"
    )))
}

/// An exchange failed after the frame was consumed: fail the matching
/// waiter, or answer an error response when the peer was asking us.
async fn handle_exchange_error(
    conn: &Arc<Conn>,
    tag: u8,
    handler_id: u16,
    message_id: u16,
    err: CatsError,
) -> Result<()> {
    warn!(
        peer = %conn.peer.address,
        message_id = %format_args!("{message_id:#06x}"),
        error = %err,
        "malformed exchange"
    );
    if tag == tags::INPUT {
        if let Some(tx) = conn.take_input(message_id) {
            let _ = tx.send(Err(err));
            return Ok(());
        }
        if let Some(tx) = conn.take_waiter(message_id) {
            conn.release_message_id(message_id);
            let _ = tx.send(Err(err));
            return Ok(());
        }
        return Err(CatsError::protocol(format!(
            "malformed input reply for message {message_id:#06x} without a pending waiter"
        )));
    }

    if let Some(tx) = conn.take_waiter(message_id) {
        conn.release_message_id(message_id);
        let _ = tx.send(Err(err));
        return Ok(());
    }
    if conn.role == Role::Server && message_id < crate::action::BROADCAST_BASE {
        let body = serde_json::json!({
            "error": err.kind(),
            "message": err.to_string(),
        });
        let response = Response::with_status(body, err.status());
        conn.send_response(handler_id, message_id, response).await?;
    }
    Ok(())
}

/// A cloneable public handle onto a live connection.
#[derive(Clone)]
pub struct ConnHandle(pub(crate) Arc<Conn>);

impl ConnHandle {
    pub fn is_open(&self) -> bool {
        !self.0.is_closed()
    }

    /// Peer address, for logs and bookkeeping.
    pub fn address(&self) -> &str {
        &self.0.peer.address
    }

    /// Api version the peer declared in its statement.
    pub fn api_version(&self) -> u32 {
        self.0.peer.api_version
    }

    pub fn scheme_format(&self) -> SchemeFormat {
        self.0.peer.scheme_format
    }

    /// Push a server-initiated action to this peer: allocates an id from
    /// the broadcast half-range and expects no reply.
    pub async fn push(&self, handler_id: u16, payload: impl Into<Payload>) -> Result<()> {
        self.push_with(handler_id, payload, Headers::new()).await
    }

    pub async fn push_with(
        &self,
        handler_id: u16,
        payload: impl Into<Payload>,
        headers: Headers,
    ) -> Result<()> {
        let message_id = self.0.allocate_message_id()?;
        let result = self
            .0
            .send_envelope(
                tags::ACTION,
                handler_id,
                message_id,
                &payload.into(),
                headers,
                None,
            )
            .await;
        self.0.release_message_id(message_id);
        result
    }

    /// Cap the peer's send rate towards us, bytes per second.
    pub async fn send_download_speed(&self, speed: u32) -> Result<()> {
        self.0.send_download_speed(speed).await
    }

    pub async fn close(&self) {
        self.0.close(None).await;
    }
}

impl PartialEq for ConnHandle {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl std::fmt::Debug for ConnHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnHandle")
            .field("address", &self.0.peer.address)
            .field("open", &self.is_open())
            .finish()
    }
}
