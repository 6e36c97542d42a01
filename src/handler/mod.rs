//! Handler runtime: the registry the dispatch loop consults and the
//! context handed to every running handler.
//!
//! A [`Handler`] exposes two suspendable entry points: `prepare` (fail
//! fast on invalid input) and `handle` (produce the response). Handlers
//! are selected by `handler_id` and the peer's api version; see
//! [`Api::register_versioned`] for the version-range rules.
//!
//! # Example
//!
//! ```ignore
//! use cats::handler::{handler_fn, Api};
//! use cats::{Payload, Response};
//!
//! let mut api = Api::new();
//! api.register(0x0001, handler_fn(|ctx| async move {
//!     let echo = ctx.payload().clone();
//!     Ok(Some(Response::new(echo)))
//! }));
//! ```

mod context;
mod registry;

pub use context::{AskOptions, Context};
pub use registry::{handler_fn, Api, FnHandler, Handler, HandlerItem};

pub use crate::handshake::BoxFuture;
