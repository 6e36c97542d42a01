//! Server: TCP accept loop, per-connection lifecycle and the broadcast
//! channel registry.
//!
//! An [`Application`] bundles the handler [`Api`], the [`Config`] and the
//! process-wide [`Channels`] registry. A [`Server`] accepts transports and
//! drives each through initialisation (protocol version, statements,
//! optional handshake) into the running dispatch loop.
//!
//! # Example
//!
//! ```ignore
//! use cats::{handler_fn, Api, Application, Config, Response, Server};
//!
//! let mut api = Api::new();
//! api.register(0x0001, handler_fn(|ctx| async move {
//!     Ok(Some(Response::new(ctx.payload().clone())))
//! }));
//! let app = Application::new(api, Config::default());
//! Server::new(app).listen("0.0.0.0:9095").await?;
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use crate::action::{Action, Response};
use crate::codec::Payload;
use crate::compress::CompressorSet;
use crate::config::Config;
use crate::connection::{
    idle_watchdog, ping_loop, recv_loop, BoxedRead, BoxedWrite, Conn, ConnHandle, PeerInfo, Role,
    Router,
};
use crate::error::{CatsError, Result};
use crate::handler::{Api, BoxFuture, Context};
use crate::handshake::HandshakeIo;
use crate::headers::Headers;
use crate::protocol::{unix_ms, PROTOCOL_VERSION};
use crate::statement::{read_statement_body, ClientStatement, ServerStatement};

/// Channel every accepted connection joins automatically.
pub const ALL_CHANNEL: &str = "__all__";

/// Process-wide broadcast channel registry: channel name to member
/// connections, behind one async lock.
#[derive(Default)]
pub struct Channels {
    map: tokio::sync::Mutex<HashMap<String, Vec<ConnHandle>>>,
}

impl Channels {
    pub async fn attach(&self, name: &str, handle: ConnHandle) {
        let mut map = self.map.lock().await;
        let members = map.entry(name.to_string()).or_default();
        if !members.contains(&handle) {
            members.push(handle);
        }
    }

    pub async fn detach(&self, name: &str, handle: &ConnHandle) {
        let mut map = self.map.lock().await;
        if let Some(members) = map.get_mut(name) {
            members.retain(|member| member != handle);
            if members.is_empty() {
                map.remove(name);
            }
        }
    }

    pub async fn members(&self, name: &str) -> Vec<ConnHandle> {
        self.map.lock().await.get(name).cloned().unwrap_or_default()
    }

    pub async fn names(&self) -> Vec<String> {
        self.map.lock().await.keys().cloned().collect()
    }

    pub(crate) async fn detach_all(&self, handle: &ConnHandle) {
        let mut map = self.map.lock().await;
        map.retain(|_, members| {
            members.retain(|member| member != handle);
            !members.is_empty()
        });
    }
}

/// The server application: handlers, configuration and channels.
pub struct Application {
    api: Api,
    config: Config,
    channels: Arc<Channels>,
}

impl Application {
    pub fn new(api: Api, config: Config) -> Arc<Self> {
        Arc::new(Self {
            api,
            config,
            channels: Arc::new(Channels::default()),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn channels(&self) -> &Arc<Channels> {
        &self.channels
    }

    /// Send an action to every member of a channel. Returns how many
    /// connections it went to.
    pub async fn broadcast(
        &self,
        channel: &str,
        handler_id: u16,
        payload: impl Into<Payload>,
    ) -> Result<usize> {
        self.broadcast_with(channel, handler_id, payload, Headers::new())
            .await
    }

    pub async fn broadcast_with(
        &self,
        channel: &str,
        handler_id: u16,
        payload: impl Into<Payload>,
        headers: Headers,
    ) -> Result<usize> {
        let payload = payload.into();
        let members = self.channels.members(channel).await;
        let mut sent = 0;
        for member in members {
            if !member.is_open() {
                continue;
            }
            match member
                .push_with(handler_id, payload.clone(), headers.clone())
                .await
            {
                Ok(()) => sent += 1,
                Err(err) => {
                    warn!(peer = member.address(), error = %err, "broadcast failed")
                }
            }
        }
        Ok(sent)
    }
}

/// A CATS protocol server.
pub struct Server {
    app: Arc<Application>,
}

impl Server {
    pub fn new(app: Arc<Application>) -> Self {
        Self { app }
    }

    pub fn app(&self) -> &Arc<Application> {
        &self.app
    }

    /// Bind and accept connections until the listener fails.
    pub async fn listen(&self, addr: impl tokio::net::ToSocketAddrs) -> Result<()> {
        let listener = TcpListener::bind(addr).await?;
        info!(addr = %listener.local_addr()?, "server listening");
        loop {
            let (stream, peer) = listener.accept().await?;
            stream.set_nodelay(true).ok();
            let app = self.app.clone();
            tokio::spawn(async move {
                if let Err(err) = serve_connection(app, stream, peer.to_string()).await {
                    warn!(peer = %peer, error = %err, "connection failed");
                }
            });
        }
    }

    /// Drive a single connection over an arbitrary transport. Returns
    /// when the connection closes.
    pub async fn serve_stream<S>(&self, stream: S, address: impl Into<String>) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        serve_connection(self.app.clone(), stream, address.into()).await
    }
}

async fn serve_connection<S>(app: Arc<Application>, stream: S, address: String) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (rd, wr) = tokio::io::split(stream);
    let mut rd: BoxedRead = Box::new(rd);
    let mut wr: BoxedWrite = Box::new(wr);
    let conf = app.config.clone();

    let init = init_connection(&app, &mut rd, &mut wr, &address);
    let negotiated = if conf.idle_timeout.is_zero() {
        init.await?
    } else {
        match tokio::time::timeout(conf.idle_timeout, init).await {
            Ok(outcome) => outcome?,
            Err(_) => return Err(CatsError::protocol("initialisation timed out")),
        }
    };
    let Some((peer, compressors)) = negotiated else {
        // Version mismatch: the preferred version was written, close.
        return Ok(());
    };

    debug!(peer = %address, api = peer.api_version, "connection initialised");
    let conn = Conn::new(Role::Server, conf, peer, compressors, wr);
    let handle = ConnHandle(conn.clone());
    app.channels.attach(ALL_CHANNEL, handle).await;

    let router: Arc<dyn Router> = Arc::new(ServerRouter { app: app.clone() });
    let watchdog = tokio::spawn(idle_watchdog(conn.clone()));
    let pinger = tokio::spawn(ping_loop(conn.clone()));
    recv_loop(conn, rd, router).await;
    watchdog.abort();
    pinger.abort();
    debug!(peer = %address, "connection finished");
    Ok(())
}

/// Protocol-version exchange, statements and the optional handshake.
/// `None` means the client spoke an unsupported protocol version.
async fn init_connection(
    app: &Arc<Application>,
    rd: &mut BoxedRead,
    wr: &mut BoxedWrite,
    address: &str,
) -> Result<Option<(PeerInfo, CompressorSet)>> {
    let mut version_buf = [0u8; 4];
    rd.read_exact(&mut version_buf).await?;
    let version = u32::from_be_bytes(version_buf);
    if version != PROTOCOL_VERSION {
        debug!(peer = %address, version, "unsupported protocol version");
        wr.write_all(&PROTOCOL_VERSION.to_be_bytes()).await?;
        wr.flush().await?;
        return Ok(None);
    }
    wr.write_all(&[0u8; 4]).await?;
    wr.flush().await?;

    let body = read_statement_body(rd).await?;
    let (client, _detected) = ClientStatement::unpack(&body)?;
    client.validate()?;
    debug!(peer = %address, api = client.api, format = client.scheme_format.name(), "client statement");

    let format = client.scheme_format;
    let server_time = unix_ms();
    let reply = ServerStatement { server_time }.pack(format)?;
    wr.write_all(&reply).await?;
    wr.flush().await?;
    let time_delta = server_time as i64 - client.client_time as i64;

    if let Some(handshake) = &app.config.handshake {
        let mut io = HandshakeIo::new(rd, wr, 0, app.config.handshake_timeout);
        handshake.validate(&mut io).await?;
    }

    let compressors =
        CompressorSet::from_names(&client.compressors, client.default_compression.as_deref());
    Ok(Some((
        PeerInfo {
            api_version: client.api,
            scheme_format: format,
            time_delta_ms: time_delta,
            address: address.to_string(),
        },
        compressors,
    )))
}

/// Server-side inbound routing: fresh requests spawn handler tasks.
struct ServerRouter {
    app: Arc<Application>,
}

impl Router for ServerRouter {
    fn on_request(&self, conn: &Arc<Conn>, action: Action, _stream: bool) -> Result<()> {
        if !conn.reserve_message_id(action.message_id) {
            return Err(CatsError::protocol(format!(
                "duplicate in-flight message id {:#06x}",
                action.message_id
            )));
        }
        let app = self.app.clone();
        let conn = conn.clone();
        tokio::spawn(run_handler(app, conn, action));
        Ok(())
    }

    fn on_broadcast(&self, action: Action) {
        debug!(
            message_id = %format_args!("{:#06x}", action.message_id),
            "dropping broadcast-range action without a listener"
        );
    }

    fn on_close<'a>(&'a self, conn: &'a Arc<Conn>) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let handle = ConnHandle(conn.clone());
            self.app.channels.detach_all(&handle).await;
        })
    }
}

/// Run one request to completion: lookup, prepare, handle, respond.
/// Exchange-scoped failures become error responses; fatal ones close the
/// connection.
async fn run_handler(app: Arc<Application>, conn: Arc<Conn>, action: Action) {
    let handler_id = action.handler_id;
    let message_id = action.message_id;
    let offset = action.offset();

    let outcome = match dispatch(&app, &conn, action).await {
        Ok(Some(mut response)) => {
            if offset > 0 {
                response.headers.set_offset(offset);
            }
            conn.send_response(handler_id, message_id, response).await
        }
        Ok(None) => Ok(()),
        Err(err) if err.is_fatal() => {
            conn.close(Some(&err)).await;
            conn.release_message_id(message_id);
            return;
        }
        Err(err) => {
            debug!(
                message_id = %format_args!("{message_id:#06x}"),
                error = %err,
                "handler failed"
            );
            let body = serde_json::json!({
                "error": err.kind(),
                "message": err.to_string(),
            });
            conn.send_response(
                handler_id,
                message_id,
                Response::with_status(body, err.status()),
            )
            .await
        }
    };
    if let Err(err) = outcome {
        if err.is_fatal() {
            conn.close(Some(&err)).await;
        } else {
            warn!(error = %err, "failed to send response");
        }
    }
    conn.release_message_id(message_id);
}

async fn dispatch(
    app: &Arc<Application>,
    conn: &Arc<Conn>,
    action: Action,
) -> Result<Option<Response>> {
    let handler = app
        .api
        .lookup(action.handler_id, conn.peer.api_version)
        .ok_or(CatsError::HandlerNotFound(action.handler_id))?;
    let ctx = Context::new(action, conn.clone(), Some(app.channels.clone()));
    handler.prepare(&ctx).await?;
    handler.handle(ctx).await
}
