//! Socket transport boundary.
//!
//! The connection manager never touches a socket directly. It asks a
//! [`Transport`] for a fresh [`Link`] on every connect attempt and drops the
//! link to close it. [`WsTransport`] talks to the real endpoint;
//! [`MemoryTransport`] wires the manager to an in-process peer for tests.

use std::pin::Pin;

use futures_util::future::BoxFuture;
use futures_util::{Sink, Stream};
use url::Url;

use crate::error::TransportError;

mod memory;
#[cfg(feature = "websocket")]
mod ws;

pub use memory::{MemoryPeer, MemoryServer, MemoryTransport};
#[cfg(feature = "websocket")]
pub use ws::WsTransport;

pub type FrameSink = Pin<Box<dyn Sink<String, Error = TransportError> + Send>>;
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<String, TransportError>> + Send>>;

/// One open text-frame connection.
///
/// The stream ends (or yields [`TransportError::Closed`]) when the remote
/// closes the connection.
pub struct Link {
    pub sink: FrameSink,
    pub stream: FrameStream,
}

impl Link {
    pub fn new<S, R>(sink: S, stream: R) -> Self
    where
        S: Sink<String, Error = TransportError> + Send + 'static,
        R: Stream<Item = Result<String, TransportError>> + Send + 'static,
    {
        Self {
            sink: Box::pin(sink),
            stream: Box::pin(stream),
        }
    }
}

impl std::fmt::Debug for Link {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Link").finish_non_exhaustive()
    }
}

pub trait Transport: Send + Sync + 'static {
    /// Opens a brand-new link. Never reuses a previous one.
    fn connect(&self, endpoint: &Url) -> BoxFuture<'static, Result<Link, TransportError>>;
}
