//! In-process transport.
//!
//! [`MemoryTransport::pair`] hands out the client side, which plugs into a
//! connection manager, and a [`MemoryServer`] that plays the remote: it
//! accepts each connect as a [`MemoryPeer`] which reads what the client sent
//! and pushes frames back.

use std::sync::{Arc, Mutex, PoisonError};

use futures_util::future::{self, BoxFuture};
use futures_util::{sink, stream};
use serde_json::Value;
use tokio::sync::mpsc;
use url::Url;

use super::{Link, Transport};
use crate::error::TransportError;

#[derive(Debug, Default)]
struct ServerState {
    refuse: usize,
    connections: usize,
}

#[derive(Debug)]
pub struct MemoryTransport {
    state: Arc<Mutex<ServerState>>,
    accept_tx: mpsc::UnboundedSender<MemoryPeer>,
}

#[derive(Debug)]
pub struct MemoryServer {
    state: Arc<Mutex<ServerState>>,
    accept_rx: mpsc::UnboundedReceiver<MemoryPeer>,
}

/// Server end of one accepted connection.
#[derive(Debug)]
pub struct MemoryPeer {
    endpoint: Url,
    from_client: mpsc::UnboundedReceiver<String>,
    to_client: Option<mpsc::UnboundedSender<String>>,
}

impl MemoryTransport {
    pub fn pair() -> (Self, MemoryServer) {
        let state = Arc::new(Mutex::new(ServerState::default()));
        let (accept_tx, accept_rx) = mpsc::unbounded_channel();
        (
            Self {
                state: state.clone(),
                accept_tx,
            },
            MemoryServer { state, accept_rx },
        )
    }
}

impl Transport for MemoryTransport {
    fn connect(&self, endpoint: &Url) -> BoxFuture<'static, Result<Link, TransportError>> {
        {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            if state.refuse > 0 {
                state.refuse -= 1;
                return Box::pin(future::ready(Err(TransportError::Refused(
                    "refused by memory server".into(),
                ))));
            }
            state.connections += 1;
        }

        let (out_tx, out_rx) = mpsc::unbounded_channel::<String>();
        let (in_tx, in_rx) = mpsc::unbounded_channel::<String>();
        let peer = MemoryPeer {
            endpoint: endpoint.clone(),
            from_client: out_rx,
            to_client: Some(in_tx),
        };
        if self.accept_tx.send(peer).is_err() {
            return Box::pin(future::ready(Err(TransportError::Refused(
                "memory server is gone".into(),
            ))));
        }

        let sink = sink::unfold(out_tx, |tx, frame: String| async move {
            tx.send(frame).map_err(|_| TransportError::Closed)?;
            Ok::<_, TransportError>(tx)
        });
        let stream = stream::unfold(in_rx, |mut rx| async move {
            rx.recv().await.map(|frame| (Ok(frame), rx))
        });
        Box::pin(future::ready(Ok(Link::new(sink, stream))))
    }
}

impl MemoryServer {
    /// Waits for the client's next connect.
    pub async fn accept(&mut self) -> Option<MemoryPeer> {
        self.accept_rx.recv().await
    }

    /// Makes the next `n` connect attempts fail.
    pub fn refuse_next(&self, n: usize) {
        self.state.lock().unwrap_or_else(PoisonError::into_inner).refuse += n;
    }

    /// Connections accepted so far.
    pub fn connection_count(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .connections
    }
}

impl MemoryPeer {
    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    /// Next frame the client sent, keep-alives included. `None` once the
    /// client dropped the link.
    pub async fn recv_frame(&mut self) -> Option<Value> {
        let text = self.from_client.recv().await?;
        serde_json::from_str(&text).ok()
    }

    /// Next frame the client sent, skipping keep-alives.
    pub async fn recv(&mut self) -> Option<Value> {
        loop {
            let frame = self.recv_frame().await?;
            if !is_keepalive(&frame) {
                return Some(frame);
            }
        }
    }

    /// Non-blocking variant of [`recv`](Self::recv).
    pub fn try_recv(&mut self) -> Option<Value> {
        while let Ok(text) = self.from_client.try_recv() {
            match serde_json::from_str::<Value>(&text) {
                Ok(frame) if !is_keepalive(&frame) => return Some(frame),
                _ => {}
            }
        }
        None
    }

    /// Pushes a frame to the client. Returns false if the link is gone.
    pub fn send(&self, frame: Value) -> bool {
        self.send_text(frame.to_string())
    }

    pub fn send_text(&self, text: impl Into<String>) -> bool {
        match &self.to_client {
            Some(tx) => tx.send(text.into()).is_ok(),
            None => false,
        }
    }

    /// Closes the server side; the client sees end-of-stream.
    pub fn close(&mut self) {
        self.to_client = None;
    }
}

fn is_keepalive(frame: &Value) -> bool {
    frame
        .as_object()
        .is_some_and(|obj| obj.len() == 1 && obj.contains_key("ping"))
}
