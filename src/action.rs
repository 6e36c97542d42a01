//! The action model: decoded inbound actions and outbound builders.
//!
//! [`Action`] is what the engine hands to handlers and call waiters after
//! framing, decompression and codec decode. [`Response`] and [`Request`]
//! are the outbound halves: handlers return a `Response`, clients submit a
//! `Request`; the engine fills in message ids, offsets and timestamps.

use bytes::Bytes;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::codec::Payload;
use crate::compress::Compressor;
use crate::headers::Headers;

/// First message id of the broadcast half-range.
pub const BROADCAST_BASE: u16 = 0x8000;

/// A fully decoded inbound action.
#[derive(Debug, Clone)]
pub struct Action {
    /// Handler that produced (or should handle) this action. `0` for
    /// input replies, which are routed by message id alone.
    pub handler_id: u16,
    /// Groups a request with its response and intermediate inputs.
    pub message_id: u16,
    /// Sender's clock at emit time, milliseconds since the Unix epoch.
    pub send_time: u64,
    pub headers: Headers,
    pub payload: Payload,
}

impl Action {
    /// Response status; `Status` header shadows the default 200.
    pub fn status(&self) -> u16 {
        self.headers.status()
    }

    /// Bytes the sender declared the receiver already has.
    pub fn offset(&self) -> u64 {
        self.headers.offset()
    }

    /// Whether the message id lies in the server-initiated half-range.
    pub fn is_broadcast(&self) -> bool {
        self.message_id >= BROADCAST_BASE
    }
}

/// Source of stream-action chunks.
pub enum StreamSource {
    /// A fixed set of chunks, sent back to back.
    Chunks(Vec<Bytes>),
    /// Chunks arriving from another task; the stream ends when the channel
    /// closes.
    Channel(mpsc::Receiver<Bytes>),
}

impl StreamSource {
    pub(crate) async fn next(&mut self) -> Option<Bytes> {
        match self {
            Self::Chunks(chunks) => {
                if chunks.is_empty() {
                    None
                } else {
                    Some(chunks.remove(0))
                }
            }
            Self::Channel(rx) => rx.recv().await,
        }
    }
}

impl std::fmt::Debug for StreamSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Chunks(chunks) => f.debug_tuple("Chunks").field(&chunks.len()).finish(),
            Self::Channel(_) => f.debug_tuple("Channel").finish(),
        }
    }
}

/// Body of an outbound response.
#[derive(Debug)]
pub enum ResponseBody {
    /// A single payload, sent as a plain `Action`.
    Payload(Payload),
    /// A chunked payload, sent as a `StreamAction`.
    Stream { data_type: u8, source: StreamSource },
}

/// What a handler returns: the engine copies the request's handler id,
/// message id and offset onto it before sending.
#[derive(Debug)]
pub struct Response {
    pub headers: Headers,
    pub body: ResponseBody,
    /// Explicit compressor choice; `None` lets the heuristic decide.
    pub compressor: Option<Compressor>,
}

impl Response {
    pub fn new(payload: impl Into<Payload>) -> Self {
        Self {
            headers: Headers::new(),
            body: ResponseBody::Payload(payload.into()),
            compressor: None,
        }
    }

    /// A structured-scheme response with an explicit status.
    pub fn with_status(payload: impl Into<Payload>, status: u16) -> Self {
        let mut response = Self::new(payload);
        response.headers.set_status(status);
        response
    }

    /// A chunked streaming response.
    pub fn stream(data_type: u8, source: StreamSource) -> Self {
        Self {
            headers: Headers::new(),
            body: ResponseBody::Stream { data_type, source },
            compressor: None,
        }
    }

    pub fn header(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.headers.insert(key, value);
        self
    }

    pub fn compressor(mut self, compressor: Compressor) -> Self {
        self.compressor = Some(compressor);
        self
    }
}

/// A client-originated request.
#[derive(Debug)]
pub struct Request {
    pub handler_id: u16,
    pub payload: Payload,
    pub headers: Headers,
    pub compressor: Option<Compressor>,
}

impl Request {
    pub fn new(handler_id: u16, payload: impl Into<Payload>) -> Self {
        Self {
            handler_id,
            payload: payload.into(),
            headers: Headers::new(),
            compressor: None,
        }
    }

    pub fn header(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.headers.insert(key, value);
        self
    }

    /// Declare bytes already possessed, to resume a transfer.
    pub fn offset(mut self, offset: u64) -> Self {
        self.headers.set_offset(offset);
        self
    }

    pub fn compressor(mut self, compressor: Compressor) -> Self {
        self.compressor = Some(compressor);
        self
    }
}
