//! Topic subscription registry.
//!
//! Maps each [`Topic`] to its listeners in registration order. Publishing
//! snapshots the listener list and releases the lock before invoking
//! anything, so listeners may subscribe or unsubscribe re-entrantly.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::task::{Context, Poll};

use futures_util::Stream;
use tokio::sync::mpsc;

use crate::protocol::{Event, Topic};

pub type Listener = Arc<dyn Fn(&Event) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct ListenerId(u64);

#[derive(Default)]
struct Inner {
    next_id: u64,
    topics: HashMap<Topic, Vec<(ListenerId, Listener)>>,
}

#[derive(Default)]
pub struct TopicRegistry {
    inner: Mutex<Inner>,
}

impl TopicRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn add(&self, topic: Topic, listener: Listener) -> ListenerId {
        let mut inner = self.lock();
        inner.next_id += 1;
        let id = ListenerId(inner.next_id);
        inner.topics.entry(topic).or_default().push((id, listener));
        id
    }

    /// Removes one listener and prunes the topic if it is now empty.
    pub(crate) fn remove(&self, topic: &Topic, id: ListenerId) -> bool {
        let mut inner = self.lock();
        let Some(listeners) = inner.topics.get_mut(topic) else {
            return false;
        };
        let before = listeners.len();
        listeners.retain(|(lid, _)| *lid != id);
        let removed = listeners.len() != before;
        if listeners.is_empty() {
            inner.topics.remove(topic);
        }
        removed
    }

    fn snapshot(&self, topic: &Topic) -> Vec<Listener> {
        self.lock()
            .topics
            .get(topic)
            .map(|listeners| listeners.iter().map(|(_, l)| l.clone()).collect())
            .unwrap_or_default()
    }

    /// Delivers `event` to every listener of every topic it maps to.
    /// Returns the number of listener invocations.
    pub fn publish(&self, event: &Event) -> usize {
        let mut delivered = 0;
        for topic in event.topics() {
            for listener in self.snapshot(&topic) {
                listener(event);
                delivered += 1;
            }
        }
        delivered
    }

    pub fn listener_count(&self, topic: &Topic) -> usize {
        self.lock().topics.get(topic).map_or(0, Vec::len)
    }

    /// Topics with at least one listener.
    pub fn topics(&self) -> Vec<Topic> {
        let mut topics: Vec<Topic> = self.lock().topics.keys().cloned().collect();
        topics.sort();
        topics
    }
}

/// Handle to one registered listener.
///
/// Dropping the handle leaves the listener registered; call
/// [`unsubscribe`](Self::unsubscribe) to remove it.
pub struct Subscription {
    registry: Weak<TopicRegistry>,
    topic: Topic,
    id: ListenerId,
    active: AtomicBool,
}

impl Subscription {
    pub(crate) fn register(registry: &Arc<TopicRegistry>, topic: Topic, listener: Listener) -> Self {
        let id = registry.add(topic.clone(), listener);
        Self {
            registry: Arc::downgrade(registry),
            topic,
            id,
            active: AtomicBool::new(true),
        }
    }

    pub fn topic(&self) -> &Topic {
        &self.topic
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Removes exactly this listener. Later calls do nothing.
    pub fn unsubscribe(&self) {
        if !self.active.swap(false, Ordering::AcqRel) {
            return;
        }
        if let Some(registry) = self.registry.upgrade() {
            registry.remove(&self.topic, self.id);
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("topic", &self.topic)
            .field("active", &self.is_active())
            .finish()
    }
}

/// Events of one topic as a [`Stream`]. Unsubscribes when dropped.
#[derive(Debug)]
pub struct TopicStream {
    rx: mpsc::UnboundedReceiver<Event>,
    subscription: Subscription,
}

impl TopicStream {
    pub(crate) fn register(registry: &Arc<TopicRegistry>, topic: Topic) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let listener: Listener = Arc::new(move |event: &Event| {
            let _ = tx.send(event.clone());
        });
        Self {
            rx,
            subscription: Subscription::register(registry, topic, listener),
        }
    }

    pub fn topic(&self) -> &Topic {
        self.subscription.topic()
    }
}

impl Stream for TopicStream {
    type Item = Event;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Event>> {
        self.rx.poll_recv(cx)
    }
}

impl Drop for TopicStream {
    fn drop(&mut self) {
        self.subscription.unsubscribe();
    }
}
