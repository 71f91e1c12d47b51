use std::collections::VecDeque;
use std::time::Duration;

use tokio::time::Instant;

use crate::protocol::Command;

#[derive(Debug, Clone)]
pub(crate) struct Pending {
    pub command: Command,
    pub queued_at: Instant,
}

/// Frames waiting for a ready session, oldest first.
///
/// Bounded: pushing into a full queue evicts the oldest frame. With a TTL,
/// frames older than the TTL are discarded when they reach the head.
#[derive(Debug)]
pub(crate) struct Outbox {
    frames: VecDeque<Pending>,
    capacity: usize,
    ttl: Option<Duration>,
}

impl Outbox {
    pub fn new(capacity: usize, ttl: Option<Duration>) -> Self {
        Self {
            frames: VecDeque::new(),
            capacity: capacity.max(1),
            ttl,
        }
    }

    /// Appends a frame. Returns how many old frames were evicted.
    pub fn push(&mut self, command: Command, now: Instant) -> usize {
        let mut evicted = 0;
        while self.frames.len() >= self.capacity {
            self.frames.pop_front();
            evicted += 1;
        }
        self.frames.push_back(Pending {
            command,
            queued_at: now,
        });
        evicted
    }

    /// Puts a frame whose transmit failed back at the head.
    pub fn requeue(&mut self, pending: Pending) {
        self.frames.push_front(pending);
        self.frames.truncate(self.capacity);
    }

    /// Pops the next live frame, plus the count of expired frames skipped.
    pub fn pop_live(&mut self, now: Instant) -> (Option<Pending>, usize) {
        let mut expired = 0;
        while let Some(pending) = self.frames.pop_front() {
            if self.is_expired(&pending, now) {
                expired += 1;
                continue;
            }
            return (Some(pending), expired);
        }
        (None, expired)
    }

    fn is_expired(&self, pending: &Pending, now: Instant) -> bool {
        self.ttl
            .is_some_and(|ttl| now.saturating_duration_since(pending.queued_at) > ttl)
    }

    pub fn clear(&mut self) -> usize {
        let n = self.frames.len();
        self.frames.clear();
        n
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}
