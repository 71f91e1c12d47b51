//! Connection manager.
//!
//! A [`ConnectionManager`] is a cheap handle onto a background task that owns
//! the single transport link. The task connects, authorizes, keeps the link
//! alive with periodic keep-alives, reconnects within a bounded budget, and
//! publishes every classified inbound frame to the [`TopicRegistry`].
//!
//! ```no_run
//! # async fn demo() -> brokerlink::Result<()> {
//! use brokerlink::{BrokerConfig, ConnectionManager, Event, Topic, WsTransport};
//!
//! let config = BrokerConfig::default().with_auth_token("a1-token");
//! let manager = ConnectionManager::new(config, WsTransport::new())?;
//! let balance = manager.subscribe(Topic::Balance, |event: &Event| {
//!     if let Event::Balance(b) = event {
//!         println!("{} {}", b.balance, b.currency);
//!     }
//! });
//! manager.connect();
//! # balance.unsubscribe();
//! # Ok(())
//! # }
//! ```

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info};
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot, watch};

use crate::config::BrokerConfig;
use crate::error::{Error, Result};
use crate::protocol::{Command, Event, TicksHistory, Topic};
use crate::transport::Transport;

mod outbox;
mod registry;
mod task;

pub use registry::{Listener, Subscription, TopicRegistry, TopicStream};

use task::ConnectionTask;

/// Lifecycle of the managed connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Not connected and not trying to.
    Idle,
    Connecting,
    /// Link open; authorization pending or not configured.
    Open,
    Authorized,
    /// Link open but the token was rejected. Only a reconnect retries it.
    Unauthorized,
    /// Waiting `delay` before reconnect attempt `attempt`.
    Reconnecting { attempt: u32, delay: Duration },
    /// Reconnect budget spent. An explicit `connect()` starts over.
    Exhausted,
    Stopped,
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(
            self,
            ConnectionState::Open | ConnectionState::Authorized | ConnectionState::Unauthorized
        )
    }
}

#[derive(Debug)]
pub(crate) enum Control {
    Connect,
    Disconnect,
    Send(Command),
    Shutdown(oneshot::Sender<()>),
}

/// Handle to the connection task. Clones share the same connection.
#[derive(Clone)]
pub struct ConnectionManager {
    control: mpsc::UnboundedSender<Control>,
    registry: Arc<TopicRegistry>,
    state: watch::Receiver<ConnectionState>,
    pending: Arc<AtomicUsize>,
    config: Arc<BrokerConfig>,
    runtime: Handle,
}

impl ConnectionManager {
    /// Spawns the connection task, idle until [`connect`](Self::connect).
    ///
    /// Must be called from within a tokio runtime.
    pub fn new<T: Transport>(config: BrokerConfig, transport: T) -> Result<Self> {
        config.validate()?;
        let runtime = Handle::try_current().map_err(|e| Error::Runtime(e.to_string()))?;

        let config = Arc::new(config);
        let registry = Arc::new(TopicRegistry::new());
        let pending = Arc::new(AtomicUsize::new(0));
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Idle);

        let task = ConnectionTask::new(
            config.clone(),
            Box::new(transport),
            registry.clone(),
            control_rx,
            state_tx,
            pending.clone(),
        );
        runtime.spawn(task.run());
        info!("Connection manager ready for {}", config.endpoint);

        Ok(Self {
            control: control_tx,
            registry,
            state: state_rx,
            pending,
            config,
            runtime,
        })
    }

    /// Connects over WebSocket to `config.endpoint`.
    #[cfg(feature = "websocket")]
    pub fn websocket(config: BrokerConfig) -> Result<Self> {
        Self::new(config, crate::transport::WsTransport::new())
    }

    fn control(&self, control: Control) {
        if self.control.send(control).is_err() {
            debug!("connection task stopped; control message dropped");
        }
    }

    /// Opens a fresh link, discarding any current one, and resets the
    /// reconnect budget.
    pub fn connect(&self) {
        self.control(Control::Connect);
    }

    /// Drops the link, stops the heartbeat and clears the outbound queue.
    /// Subscriptions stay registered.
    pub fn disconnect(&self) {
        self.control(Control::Disconnect);
    }

    /// Stops the connection task. Every clone of this handle becomes inert.
    pub async fn shutdown(&self) {
        let (tx, rx) = oneshot::channel();
        if self.control.send(Control::Shutdown(tx)).is_ok() {
            let _ = rx.await;
        }
    }

    /// Transmits `command` once the session is ready, in call order.
    pub fn send(&self, command: Command) {
        self.control(Control::Send(command));
    }

    pub fn subscribe<F>(&self, topic: Topic, listener: F) -> Subscription
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        Subscription::register(&self.registry, topic, Arc::new(listener))
    }

    pub fn subscribe_listener(&self, topic: Topic, listener: Listener) -> Subscription {
        Subscription::register(&self.registry, topic, listener)
    }

    pub fn subscribe_stream(&self, topic: Topic) -> TopicStream {
        TopicStream::register(&self.registry, topic)
    }

    pub fn registry(&self) -> &Arc<TopicRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    /// Runtime the connection task was spawned on.
    pub(crate) fn runtime(&self) -> &Handle {
        &self.runtime
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.state().is_connected()
    }

    pub fn is_authorized(&self) -> bool {
        self.state() == ConnectionState::Authorized
    }

    /// Frames queued and not yet transmitted.
    pub fn pending_frames(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    // --- Convenience commands ---

    pub fn request_balance(&self, subscribe: bool) {
        self.send(Command::balance(subscribe));
    }

    pub fn request_active_symbols(&self) {
        self.send(Command::active_symbols());
    }

    pub fn subscribe_ticks(&self, symbol: &str) {
        self.send(Command::ticks(symbol));
    }

    pub fn forget_all(&self, kind: &str) {
        self.send(Command::forget_all(kind));
    }

    pub fn request_ticks_history(&self, request: &TicksHistory) {
        self.send(Command::ticks_history(request));
    }

    pub fn request_account_status(&self) {
        self.send(Command::account_status());
    }
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("endpoint", &self.config.endpoint.as_str())
            .field("state", &self.state())
            .field("pending_frames", &self.pending_frames())
            .finish()
    }
}
