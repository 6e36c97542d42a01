//! Handler registry with api-version ranges.
//!
//! Handlers for one id may be registered per version range. Registering a
//! new versioned handler auto-closes the previous open-ended range at
//! `version - 1`, so api evolution reads top to bottom:
//!
//! ```ignore
//! api.register_versioned(1, v1_handler, 1, None);   // [1..]
//! api.register_versioned(1, v2_handler, 4, None);   // closes v1 at [1..=3]
//! ```
//!
//! Registration mistakes (overlapping ranges, mixing wildcard and
//! versioned entries) are programmer errors and panic at startup.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use crate::action::Response;
use crate::error::Result;
use crate::handshake::BoxFuture;

use super::Context;

/// An application-supplied request processor.
pub trait Handler: Send + Sync + 'static {
    /// Runs before `handle`; return an error to fail the exchange fast.
    fn prepare<'a>(&'a self, _ctx: &'a Context) -> BoxFuture<'a, Result<()>> {
        Box::pin(async { Ok(()) })
    }

    /// Produce the response. `None` means no response is sent.
    fn handle(&self, ctx: Context) -> BoxFuture<'static, Result<Option<Response>>>;
}

/// Adapter turning an async closure into a [`Handler`].
pub struct FnHandler<F> {
    f: F,
}

impl<F, Fut> Handler for FnHandler<F>
where
    F: Fn(Context) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Option<Response>>> + Send + 'static,
{
    fn handle(&self, ctx: Context) -> BoxFuture<'static, Result<Option<Response>>> {
        Box::pin((self.f)(ctx))
    }
}

/// Wrap an async closure as a handler.
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(Context) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Option<Response>>> + Send + 'static,
{
    FnHandler { f }
}

/// One registered handler with its version range.
pub struct HandlerItem {
    handler: Arc<dyn Handler>,
    version: Option<u32>,
    end_version: Option<u32>,
}

/// The handler registry consulted by the dispatch loop.
#[derive(Default)]
pub struct Api {
    handlers: HashMap<u16, Vec<HandlerItem>>,
}

impl Api {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for every api version.
    pub fn register<H: Handler>(&mut self, id: u16, handler: H) {
        self.add(id, Arc::new(handler), None, None);
    }

    /// Register a handler for api versions `version..=end_version`
    /// (open-ended when `end_version` is `None`).
    pub fn register_versioned<H: Handler>(
        &mut self,
        id: u16,
        handler: H,
        version: u32,
        end_version: Option<u32>,
    ) {
        self.add(id, Arc::new(handler), Some(version), end_version);
    }

    fn add(
        &mut self,
        id: u16,
        handler: Arc<dyn Handler>,
        version: Option<u32>,
        end_version: Option<u32>,
    ) {
        if let (Some(version), Some(end)) = (version, end_version) {
            assert!(
                version <= end,
                "invalid version range for handler {id:#06x}: [{version}..{end}]"
            );
        }
        let items = self.handlers.entry(id).or_default();
        let Some(version) = version else {
            assert!(
                items.is_empty(),
                "handler {id:#06x} already registered; a wildcard handler must be the only one"
            );
            items.push(HandlerItem {
                handler,
                version: None,
                end_version: None,
            });
            return;
        };
        if let Some(last) = items.last_mut() {
            let last_version = last
                .version
                .unwrap_or_else(|| panic!("cannot add versioned handler {id:#06x} to a wildcard"));
            match last.end_version {
                Some(last_end) => assert!(
                    last_end < version,
                    "handler {id:#06x} version {version} overlaps [{last_version}..{last_end}]"
                ),
                None => {
                    assert!(
                        last_version < version,
                        "handler {id:#06x} version {version} overlaps open range [{last_version}..]"
                    );
                    last.end_version = Some(version - 1);
                }
            }
        }
        items.push(HandlerItem {
            handler,
            version: Some(version),
            end_version,
        });
    }

    /// Fold another registry into this one; colliding ids are replaced
    /// wholesale.
    pub fn merge(&mut self, other: Api) {
        for (id, items) in other.handlers {
            self.handlers.insert(id, items);
        }
    }

    /// Find the handler for `id` whose version range contains
    /// `api_version`.
    pub fn lookup(&self, id: u16, api_version: u32) -> Option<Arc<dyn Handler>> {
        let items = self.handlers.get(&id)?;
        for item in items {
            match item.version {
                None => return Some(item.handler.clone()),
                Some(version) => {
                    let end = item.end_version.unwrap_or(api_version);
                    if version <= api_version && api_version <= end {
                        return Some(item.handler.clone());
                    }
                }
            }
        }
        None
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl std::fmt::Debug for Api {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut ids: Vec<_> = self.handlers.keys().collect();
        ids.sort();
        f.debug_struct("Api").field("handler_ids", &ids).finish()
    }
}
