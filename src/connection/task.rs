use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use futures_util::future::BoxFuture;
use futures_util::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use tokio::sync::{mpsc, watch};
use tokio::time::{self, Instant, Interval, MissedTickBehavior, Sleep};

use super::outbox::Outbox;
use super::registry::TopicRegistry;
use super::{ConnectionState, Control};
use crate::config::BrokerConfig;
use crate::error::TransportError;
use crate::protocol::{decode_frame, Command, ErrorEvent, Event, Inbound};
use crate::transport::{Link, Transport};

enum Wake {
    Control(Option<Control>),
    Connected(Result<Link, TransportError>),
    Retry,
    Frame(Option<Result<String, TransportError>>),
    Heartbeat,
}

/// Authorization progress of the current link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Auth {
    Pending,
    Granted,
    Denied,
    NotConfigured,
}

/// Owns the transport. All connection state lives here and is only touched
/// from [`ConnectionTask::run`].
pub(super) struct ConnectionTask {
    config: Arc<BrokerConfig>,
    transport: Box<dyn Transport>,
    registry: Arc<TopicRegistry>,
    control: mpsc::UnboundedReceiver<Control>,
    state: watch::Sender<ConnectionState>,
    pending: Arc<AtomicUsize>,

    outbox: Outbox,
    connecting: Option<BoxFuture<'static, Result<Link, TransportError>>>,
    link: Option<Link>,
    auth: Auth,
    retry: Option<Pin<Box<Sleep>>>,
    heartbeat: Option<Interval>,
    last_keepalive: Option<Instant>,
    attempt: u32,
}

impl ConnectionTask {
    pub(super) fn new(
        config: Arc<BrokerConfig>,
        transport: Box<dyn Transport>,
        registry: Arc<TopicRegistry>,
        control: mpsc::UnboundedReceiver<Control>,
        state: watch::Sender<ConnectionState>,
        pending: Arc<AtomicUsize>,
    ) -> Self {
        let outbox = Outbox::new(config.max_pending_frames, config.pending_frame_ttl());
        Self {
            config,
            transport,
            registry,
            control,
            state,
            pending,
            outbox,
            connecting: None,
            link: None,
            auth: Auth::Pending,
            retry: None,
            heartbeat: None,
            last_keepalive: None,
            attempt: 0,
        }
    }

    pub(super) async fn run(mut self) {
        loop {
            let wake = tokio::select! {
                biased;
                control = self.control.recv() => Wake::Control(control),
                frame = next_frame(&mut self.link) => Wake::Frame(frame),
                result = poll_opt(&mut self.connecting) => Wake::Connected(result),
                _ = poll_opt(&mut self.retry) => Wake::Retry,
                _ = tick_opt(&mut self.heartbeat) => Wake::Heartbeat,
            };

            match wake {
                Wake::Control(Some(Control::Connect)) => {
                    info!("Connect requested");
                    self.attempt = 0;
                    self.retry = None;
                    self.start_connect();
                }
                Wake::Control(Some(Control::Disconnect)) => self.disconnect(),
                Wake::Control(Some(Control::Send(command))) => self.send(command).await,
                Wake::Control(Some(Control::Shutdown(ack))) => {
                    self.teardown();
                    self.set_state(ConnectionState::Stopped);
                    info!("Connection task stopped");
                    let _ = ack.send(());
                    return;
                }
                Wake::Control(None) => {
                    self.teardown();
                    self.set_state(ConnectionState::Stopped);
                    debug!("All connection handles dropped; task exiting");
                    return;
                }
                Wake::Connected(Ok(link)) => self.on_open(link).await,
                Wake::Connected(Err(e)) => {
                    self.connecting = None;
                    warn!("Connection failed: {}", e);
                    self.connection_lost();
                }
                Wake::Retry => {
                    self.retry = None;
                    self.start_connect();
                }
                Wake::Frame(Some(Ok(text))) => self.on_frame(&text).await,
                Wake::Frame(Some(Err(e))) => {
                    warn!("Transport error: {}", e);
                    self.connection_lost();
                }
                Wake::Frame(None) => {
                    warn!("Connection closed by remote");
                    self.connection_lost();
                }
                Wake::Heartbeat => self.send_keepalive().await,
            }
        }
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.send_replace(state);
    }

    fn sync_pending(&self) {
        self.pending.store(self.outbox.len(), Ordering::Release);
    }

    fn is_ready(&self) -> bool {
        self.link.is_some() && self.auth != Auth::Pending
    }

    /// Drops the link and timers of the current session.
    fn teardown(&mut self) {
        self.link = None;
        self.connecting = None;
        self.heartbeat = None;
        self.last_keepalive = None;
        self.auth = Auth::Pending;
    }

    fn start_connect(&mut self) {
        self.teardown();
        self.set_state(ConnectionState::Connecting);
        self.connecting = Some(self.transport.connect(&self.config.endpoint));
    }

    fn disconnect(&mut self) {
        self.teardown();
        self.retry = None;
        self.attempt = 0;
        let cleared = self.outbox.clear();
        self.sync_pending();
        if cleared > 0 {
            info!("Disconnected; discarded {} queued frames", cleared);
        } else {
            info!("Disconnected");
        }
        self.set_state(ConnectionState::Idle);
    }

    async fn on_open(&mut self, link: Link) {
        self.connecting = None;
        self.link = Some(link);
        self.attempt = 0;
        info!("Connected to {}", self.config.endpoint);
        self.set_state(ConnectionState::Open);

        let period = self.config.heartbeat_interval();
        let mut heartbeat = time::interval_at(Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        self.heartbeat = Some(heartbeat);

        match self.config.auth_token.clone() {
            Some(token) => {
                self.auth = Auth::Pending;
                if let Err(e) = self.transmit(&Command::authorize(&token)).await {
                    warn!("Failed to send authorization: {}", e);
                    self.connection_lost();
                }
            }
            None => {
                self.auth = Auth::NotConfigured;
                self.flush().await;
            }
        }
    }

    /// Schedules the next reconnect attempt, or gives up once the budget is spent.
    fn connection_lost(&mut self) {
        self.teardown();
        self.attempt += 1;
        let max = self.config.max_reconnect_attempts;
        if self.attempt > max {
            self.retry = None;
            error!(
                "Reconnect budget exhausted after {} attempts; {} frames held",
                max,
                self.outbox.len()
            );
            self.set_state(ConnectionState::Exhausted);
            self.publish(&Event::Error(ErrorEvent::ReconnectExhausted { attempts: max }));
            return;
        }
        let delay = self.config.reconnect_delay(self.attempt);
        info!(
            "Reconnecting in {:?} (attempt {}/{})",
            delay, self.attempt, max
        );
        self.set_state(ConnectionState::Reconnecting {
            attempt: self.attempt,
            delay,
        });
        self.retry = Some(Box::pin(time::sleep(delay)));
    }

    async fn send(&mut self, command: Command) {
        if self.is_ready() && self.outbox.is_empty() {
            if let Err(e) = self.transmit(&command).await {
                warn!("Send failed, requeueing: {}", e);
                self.enqueue(command);
                self.connection_lost();
            }
            return;
        }
        self.enqueue(command);
    }

    fn enqueue(&mut self, command: Command) {
        let evicted = self.outbox.push(command, Instant::now());
        self.sync_pending();
        if evicted > 0 {
            warn!("Outbound queue full; dropped {} oldest frames", evicted);
            self.publish(&Event::Error(ErrorEvent::FramesDropped { count: evicted }));
        }
    }

    /// Transmits queued frames in order until the queue is empty or the link fails.
    async fn flush(&mut self) {
        let mut expired = 0;
        loop {
            let (next, skipped) = self.outbox.pop_live(Instant::now());
            expired += skipped;
            let Some(pending) = next else { break };
            if let Err(e) = self.transmit(&pending.command).await {
                warn!("Flush interrupted: {}", e);
                self.outbox.requeue(pending);
                self.connection_lost();
                break;
            }
        }
        self.sync_pending();
        if expired > 0 {
            warn!("Discarded {} queued frames past their TTL", expired);
            self.publish(&Event::Error(ErrorEvent::FramesDropped { count: expired }));
        }
    }

    async fn transmit(&mut self, command: &Command) -> Result<(), TransportError> {
        let link = self.link.as_mut().ok_or(TransportError::Closed)?;
        let text = match command.to_json() {
            Ok(text) => text,
            Err(e) => {
                error!("Dropping unserializable frame: {}", e);
                return Ok(());
            }
        };
        debug!("-> {}", text);
        link.sink.send(text).await
    }

    async fn send_keepalive(&mut self) {
        if self.link.is_none() {
            return;
        }
        if let Err(e) = self.transmit(&Command::ping()).await {
            warn!("Heartbeat failed: {}", e);
            self.connection_lost();
            return;
        }
        self.last_keepalive = Some(Instant::now());
    }

    async fn on_frame(&mut self, text: &str) {
        debug!("<- {}", text);
        let event = match decode_frame(text) {
            Ok(Inbound::Event(event)) => event,
            Ok(Inbound::HeartbeatEcho) => {
                let period = self.config.heartbeat_interval();
                let recent = self
                    .last_keepalive
                    .is_some_and(|at| at.elapsed() < period);
                if !recent {
                    self.send_keepalive().await;
                }
                return;
            }
            Ok(Inbound::Ignored { msg_type }) => {
                debug!("Ignoring frame of type {:?}", msg_type);
                return;
            }
            Err(e) => {
                warn!("Dropping undecodable frame: {}", e);
                return;
            }
        };

        match &event {
            Event::Authorized(auth) => {
                info!("Authorized as {}", auth.loginid);
                self.auth = Auth::Granted;
                self.set_state(ConnectionState::Authorized);
                self.publish(&event);
                self.enqueue(Command::balance(true));
                self.flush().await;
            }
            Event::AuthorizationFailed(err) => {
                error!("Authorization failed: {}", err);
                self.auth = Auth::Denied;
                self.set_state(ConnectionState::Unauthorized);
                self.publish(&event);
                self.flush().await;
            }
            Event::Error(ErrorEvent::Protocol(err)) => {
                error!("Remote error: {}", err);
                self.publish(&event);
            }
            _ => {
                self.publish(&event);
            }
        }
    }

    fn publish(&self, event: &Event) {
        let delivered = self.registry.publish(event);
        if delivered == 0 {
            debug!("No listeners for {:?}", event.topics());
        }
    }
}

async fn poll_opt<F: Future + Unpin>(slot: &mut Option<F>) -> F::Output {
    match slot {
        Some(fut) => fut.await,
        None => std::future::pending().await,
    }
}

async fn next_frame(link: &mut Option<Link>) -> Option<Result<String, TransportError>> {
    match link {
        Some(link) => link.stream.next().await,
        None => std::future::pending().await,
    }
}

async fn tick_opt(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}
