//! Request/response correlation on top of the connection manager.
//!
//! Request-style commands are answered on a shared topic. The correlator
//! stamps each command with a fresh [`CorrelationId`], listens on the reply
//! topic for that id only, and resolves the caller exactly once: with the
//! matching reply, with a remote error, or with a timeout.
//!
//! At most one request is in flight per [`GroupKey`]. Issuing another under
//! the same key discards the older one before the new command is sent.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::task::{Context, Poll};
use std::time::Duration;

use log::{debug, warn};
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};

use crate::connection::{ConnectionManager, Subscription};
use crate::protocol::{ApiError, Command, CorrelationId, Event, Topic};

/// Key under which requests supersede each other, e.g. `R_100_MULTUP`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GroupKey(String);

impl GroupKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// A key no other request will ever share.
    pub fn unique() -> Self {
        Self(format!("oneshot:{}", CorrelationId::next()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for GroupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for GroupKey {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for GroupKey {
    fn from(value: String) -> Self {
        Self(value)
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum RequestError {
    #[error("no reply within {0:?}")]
    Timeout(Duration),
    #[error("superseded by a newer request")]
    Superseded,
    #[error("request cancelled")]
    Cancelled,
    #[error("remote error: {0}")]
    Api(ApiError),
    #[error("unexpected reply on {0}")]
    UnexpectedReply(Topic),
}

pub type RequestResult = Result<Event, RequestError>;

type Callback = Box<dyn FnOnce(RequestResult) + Send>;

enum Responder {
    Callback(Callback),
    Channel(oneshot::Sender<RequestResult>),
}

impl Responder {
    fn deliver(self, outcome: RequestResult) {
        match self {
            Responder::Callback(callback) => callback(outcome),
            Responder::Channel(tx) => {
                let _ = tx.send(outcome);
            }
        }
    }

    /// Supersession is silent for callbacks; futures learn why they ended.
    fn supersede(self) {
        if let Responder::Channel(tx) = self {
            let _ = tx.send(Err(RequestError::Superseded));
        }
    }
}

struct Entry {
    id: CorrelationId,
    subscription: Subscription,
    timer: Option<JoinHandle<()>>,
    responder: Responder,
}

impl Entry {
    fn release(&mut self) {
        self.subscription.unsubscribe();
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

#[derive(Default)]
struct Shared {
    in_flight: Mutex<HashMap<GroupKey, Entry>>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, HashMap<GroupKey, Entry>> {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Removes the entry for `key` only if it still belongs to `id`.
    fn take(&self, key: &GroupKey, id: CorrelationId) -> Option<Entry> {
        let mut in_flight = self.lock();
        match in_flight.get(key) {
            Some(entry) if entry.id == id => in_flight.remove(key),
            _ => None,
        }
    }

    fn resolve(&self, key: &GroupKey, id: CorrelationId, outcome: RequestResult) {
        if let Some(mut entry) = self.take(key, id) {
            entry.release();
            entry.responder.deliver(outcome);
        }
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        let in_flight = self
            .in_flight
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner);
        for (_, mut entry) in in_flight.drain() {
            entry.release();
            entry.responder.deliver(Err(RequestError::Cancelled));
        }
    }
}

/// Issues correlated requests through a [`ConnectionManager`].
#[derive(Clone)]
pub struct RequestCorrelator {
    connection: ConnectionManager,
    shared: Arc<Shared>,
}

impl RequestCorrelator {
    pub fn new(connection: ConnectionManager) -> Self {
        Self {
            connection,
            shared: Arc::new(Shared::default()),
        }
    }

    pub fn connection(&self) -> &ConnectionManager {
        &self.connection
    }

    /// Configured `requestTimeoutMs`.
    pub fn default_timeout(&self) -> Duration {
        self.connection.config().request_timeout()
    }

    /// Sends `command` and hands the outcome to `callback` at most once.
    ///
    /// A still-pending request under `group_key` is discarded first; its
    /// callback never runs.
    pub fn issue_request<F>(
        &self,
        group_key: impl Into<GroupKey>,
        topic: Topic,
        command: Command,
        timeout: Duration,
        callback: F,
    ) -> CorrelationId
    where
        F: FnOnce(RequestResult) + Send + 'static,
    {
        self.issue(
            group_key.into(),
            topic,
            command,
            timeout,
            Responder::Callback(Box::new(callback)),
        )
    }

    /// Future form of [`issue_request`](Self::issue_request). A superseded
    /// request resolves to [`RequestError::Superseded`].
    pub fn request(
        &self,
        group_key: impl Into<GroupKey>,
        topic: Topic,
        command: Command,
        timeout: Duration,
    ) -> PendingReply {
        let group_key = group_key.into();
        let (tx, rx) = oneshot::channel();
        let id = self.issue(
            group_key.clone(),
            topic,
            command,
            timeout,
            Responder::Channel(tx),
        );
        PendingReply { id, group_key, rx }
    }

    /// One-off request that never supersedes another, e.g. a purchase
    /// following a quote.
    pub fn execute_dependent_action(
        &self,
        topic: Topic,
        command: Command,
        timeout: Duration,
    ) -> PendingReply {
        self.request(GroupKey::unique(), topic, command, timeout)
    }

    fn issue(
        &self,
        group_key: GroupKey,
        topic: Topic,
        command: Command,
        timeout: Duration,
        responder: Responder,
    ) -> CorrelationId {
        let id = CorrelationId::next();
        let command = command.with_req_id(id);

        let subscription = {
            let weak = Arc::downgrade(&self.shared);
            let key = group_key.clone();
            self.connection.subscribe(topic.clone(), move |event: &Event| {
                if event.req_id() != Some(id) {
                    return;
                }
                if let Some(shared) = weak.upgrade() {
                    shared.resolve(&key, id, outcome(event));
                }
            })
        };

        // Insert and displace in one critical section; the displaced entry
        // must always be released.
        let entry = Entry {
            id,
            subscription,
            timer: None,
            responder,
        };
        let superseded = self.shared.lock().insert(group_key.clone(), entry);
        if let Some(mut old) = superseded {
            debug!("Request {} under {} superseded by {}", old.id, group_key, id);
            old.release();
            old.responder.supersede();
        }

        let timer = spawn_timer(
            self.connection.runtime(),
            Arc::downgrade(&self.shared),
            group_key.clone(),
            id,
            timeout,
        );
        match self.shared.lock().get_mut(&group_key) {
            Some(entry) if entry.id == id => entry.timer = Some(timer),
            _ => timer.abort(),
        }

        debug!("Request {} under {} on {}", id, group_key, topic);
        self.connection.send(command);
        id
    }

    /// Drops the pending request under `group_key`, resolving it as cancelled.
    pub fn cancel(&self, group_key: &GroupKey) -> bool {
        let entry = self.shared.lock().remove(group_key);
        match entry {
            Some(mut entry) => {
                entry.release();
                entry.responder.deliver(Err(RequestError::Cancelled));
                true
            }
            None => false,
        }
    }

    /// Cancels every pending request.
    pub fn clear(&self) -> usize {
        let drained: Vec<Entry> = self.shared.lock().drain().map(|(_, e)| e).collect();
        let n = drained.len();
        for mut entry in drained {
            entry.release();
            entry.responder.deliver(Err(RequestError::Cancelled));
        }
        n
    }

    /// Group keys with a pending request.
    pub fn in_flight(&self) -> Vec<GroupKey> {
        let mut keys: Vec<GroupKey> = self.shared.lock().keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn is_pending(&self, group_key: &GroupKey) -> bool {
        self.shared.lock().contains_key(group_key)
    }
}

impl fmt::Debug for RequestCorrelator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestCorrelator")
            .field("in_flight", &self.in_flight())
            .finish()
    }
}

fn outcome(event: &Event) -> RequestResult {
    match event.api_error() {
        Some(err) => Err(RequestError::Api(err.clone())),
        None => Ok(event.clone()),
    }
}

fn spawn_timer(
    runtime: &Handle,
    shared: Weak<Shared>,
    key: GroupKey,
    id: CorrelationId,
    timeout: Duration,
) -> JoinHandle<()> {
    let now = Instant::now();
    // Oversized timeouts saturate to a far-future deadline.
    let deadline = now
        .checked_add(timeout)
        .unwrap_or_else(|| now + Duration::from_secs(86400 * 365 * 30));
    runtime.spawn(async move {
        time::sleep_until(deadline).await;
        let Some(shared) = shared.upgrade() else { return };
        if let Some(mut entry) = shared.take(&key, id) {
            warn!("Request {} under {} timed out after {:?}", id, key, timeout);
            // running inside this timer; do not abort ourselves
            entry.timer = None;
            entry.release();
            entry.responder.deliver(Err(RequestError::Timeout(timeout)));
        }
    })
}

/// Reply to one correlated request.
#[derive(Debug)]
pub struct PendingReply {
    id: CorrelationId,
    group_key: GroupKey,
    rx: oneshot::Receiver<RequestResult>,
}

impl PendingReply {
    pub fn id(&self) -> CorrelationId {
        self.id
    }

    pub fn group_key(&self) -> &GroupKey {
        &self.group_key
    }
}

impl Future for PendingReply {
    type Output = RequestResult;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<RequestResult> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(outcome)) => Poll::Ready(outcome),
            Poll::Ready(Err(_)) => Poll::Ready(Err(RequestError::Cancelled)),
            Poll::Pending => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Proposal, Reply};
    use serde_json::Value;

    fn proposal(body: Result<Proposal, ApiError>) -> Event {
        Event::Proposal(Reply {
            req_id: CorrelationId::from_raw(7),
            echo_req: Value::Null,
            subscription_id: None,
            body,
        })
    }

    #[test]
    fn test_unique_keys_never_collide() {
        let a = GroupKey::unique();
        let b = GroupKey::unique();
        assert_ne!(a, b);
        assert!(a.as_str().starts_with("oneshot:"));
        assert_eq!(GroupKey::from("R_100_MULTUP").to_string(), "R_100_MULTUP");
    }

    #[test]
    fn test_outcome_splits_remote_errors() {
        let err = ApiError::new("RateLimit", "slow down");
        assert_eq!(
            outcome(&proposal(Err(err.clone()))),
            Err(RequestError::Api(err))
        );

        let ok = proposal(Ok(Proposal {
            id: "p-1".into(),
            ask_price: 10.0,
            payout: 19.5,
            spot: None,
            display_value: None,
            longcode: None,
        }));
        assert_eq!(outcome(&ok), Ok(ok.clone()));
    }
}
