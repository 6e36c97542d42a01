//! # cats
//!
//! Rust implementation of CATS (Cifrazia Action Transport System): a
//! connection-oriented binary request/response and streaming protocol over
//! a reliable byte stream.
//!
//! ## Features
//!
//! - Multiplexed request/reply over one connection, with 16-bit message
//!   ids split between requests (`0x0000..=0x7FFF`) and server broadcasts
//!   (`0x8000..=0xFFFF`)
//! - Mid-handler input prompts: a handler can `ask` the peer for more data
//!   before answering
//! - Chunked streaming payloads with per-chunk compression
//! - Pluggable payload codecs (binary, structured scheme, multi-file
//!   bundle, packed byte-scheme) and compressors (gzip, zlib)
//! - JSON / YAML / TOML scheme formats, negotiated per connection
//! - Optional time-bounded SHA-256 handshake
//! - Per-connection download-rate shaping, idle and input timeouts
//!
//! ## Example
//!
//! ```ignore
//! use cats::{handler_fn, Api, Application, Client, Config, Incoming, Response, Server};
//!
//! // Server
//! let mut api = Api::new();
//! api.register(0x0001, handler_fn(|ctx| async move {
//!     Ok(Some(Response::new(ctx.payload().clone())))
//! }));
//! let app = Application::new(api, Config::default());
//! tokio::spawn(async move { Server::new(app).listen("0.0.0.0:9095").await });
//!
//! // Client
//! let client = Client::connect("127.0.0.1:9095", Config::default(), 1).await?;
//! let reply = client.call(0x0001, &b"hello"[..]).await?.into_response()?;
//! ```

pub mod action;
pub mod client;
pub mod codec;
pub mod compress;
pub mod config;
pub mod error;
pub mod handler;
pub mod handshake;
pub mod headers;
pub mod protocol;
pub mod scheme;
pub mod server;
pub mod statement;

mod connection;
mod rate;

pub use action::{Action, Request, Response, ResponseBody, StreamSource, BROADCAST_BASE};
pub use client::{Client, Incoming, InputPrompt};
pub use codec::{FileEntry, Files, Payload};
pub use compress::Compressor;
pub use config::Config;
pub use connection::ConnHandle;
pub use error::{CatsError, Result};
pub use handler::{handler_fn, Api, AskOptions, Context, Handler};
pub use handshake::{Handshake, Sha256TimeHandshake};
pub use headers::Headers;
pub use protocol::PROTOCOL_VERSION;
pub use scheme::SchemeFormat;
pub use server::{Application, Channels, Server};
pub use statement::{ClientStatement, ServerStatement};
