//! Bounded retry queue.
//!
//! Strict FIFO. Priority only decides how many attempts an entry gets.
//! Pushing into a full queue evicts the oldest entry.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::time::Instant;
use tracing::warn;

use super::message::WireMessage;

#[derive(Debug, Clone, PartialEq)]
pub struct QueuedMessage {
    pub message: WireMessage,
    pub attempts: u32,
    pub next_retry: Instant,
    pub max_retries: u32,
}

impl QueuedMessage {
    pub fn new(message: WireMessage, now: Instant) -> Self {
        let max_retries = message.priority.retry_budget();
        Self {
            message,
            attempts: 0,
            next_retry: now,
            max_retries,
        }
    }

    /// The frame to write for this entry; anything after the first attempt
    /// is flagged as a redelivery.
    pub fn frame(&self) -> WireMessage {
        let mut message = self.message.clone();
        message.retry = self.attempts > 0;
        message
    }

    pub fn is_due(&self, now: Instant) -> bool {
        self.next_retry <= now
    }

    pub fn is_exhausted(&self) -> bool {
        self.attempts >= self.max_retries
    }

    /// Count a failed attempt and push the next one out by `delay × attempts`.
    pub fn record_failure(&mut self, now: Instant, delay: Duration) {
        self.attempts += 1;
        self.next_retry = now + delay.saturating_mul(self.attempts);
    }
}

#[derive(Debug)]
pub struct MessageQueue {
    entries: VecDeque<QueuedMessage>,
    capacity: usize,
}

impl MessageQueue {
    pub fn new(capacity: usize) -> Self {
        if capacity == 0 {
            warn!("transport: message queue size 0 is not usable, holding 1 message");
        }
        Self {
            entries: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Append `entry`, returning the evicted oldest entry if the queue was full.
    pub fn push(&mut self, entry: QueuedMessage) -> Option<QueuedMessage> {
        let evicted = if self.entries.len() >= self.capacity {
            self.entries.pop_front()
        } else {
            None
        };
        self.entries.push_back(entry);
        evicted
    }

    /// Keep entries for which `f` returns true, visiting in insertion order.
    pub fn retain_mut<F>(&mut self, f: F)
    where
        F: FnMut(&mut QueuedMessage) -> bool,
    {
        self.entries.retain_mut(f);
    }

    pub fn drain(&mut self) -> Vec<QueuedMessage> {
        self.entries.drain(..).collect()
    }

    pub fn clear(&mut self) -> usize {
        let count = self.entries.len();
        self.entries.clear();
        count
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &QueuedMessage> {
        self.entries.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::message::{Payload, Priority};

    fn message(id: &str, priority: Priority) -> WireMessage {
        WireMessage {
            id: id.to_string(),
            payload: Payload::event("e", None),
            timestamp: chrono::Utc::now(),
            session_id: None,
            visitor_id: None,
            priority,
            retry: false,
        }
    }

    #[test]
    fn overflow_evicts_oldest() {
        let now = Instant::now();
        let mut queue = MessageQueue::new(2);
        assert!(queue.push(QueuedMessage::new(message("a", Priority::Normal), now)).is_none());
        assert!(queue.push(QueuedMessage::new(message("b", Priority::Normal), now)).is_none());

        let evicted = queue.push(QueuedMessage::new(message("c", Priority::Critical), now));
        assert_eq!(evicted.unwrap().message.id, "a");
        assert_eq!(queue.len(), 2);

        let ids: Vec<_> = queue.iter().map(|e| e.message.id.as_str()).collect();
        assert_eq!(ids, ["b", "c"]);
    }

    #[test]
    fn retry_budget_and_backoff() {
        let now = Instant::now();
        let mut entry = QueuedMessage::new(message("a", Priority::Normal), now);
        assert!(entry.is_due(now));
        assert_eq!(entry.max_retries, 3);

        entry.record_failure(now, Duration::from_secs(1));
        entry.record_failure(now, Duration::from_secs(1));
        assert_eq!(entry.next_retry, now + Duration::from_secs(2));
        assert!(!entry.is_due(now + Duration::from_secs(1)));
        assert!(!entry.is_exhausted());

        entry.record_failure(now, Duration::from_secs(1));
        assert!(entry.is_exhausted());
    }

    #[test]
    fn zero_capacity_still_holds_the_newest() {
        let now = Instant::now();
        let mut queue = MessageQueue::new(0);
        assert_eq!(queue.capacity(), 1);

        queue.push(QueuedMessage::new(message("a", Priority::Normal), now));
        let evicted = queue.push(QueuedMessage::new(message("b", Priority::Normal), now));
        assert_eq!(evicted.unwrap().message.id, "a");
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn only_later_attempts_are_flagged_as_redelivery() {
        let now = Instant::now();
        let mut entry = QueuedMessage::new(message("a", Priority::Normal), now);
        assert!(!entry.frame().retry);

        entry.record_failure(now, Duration::from_secs(1));
        assert!(entry.frame().retry);
        assert!(!entry.message.retry);
    }

    #[test]
    fn critical_gets_five_attempts() {
        let entry = QueuedMessage::new(message("a", Priority::Critical), Instant::now());
        assert_eq!(entry.max_retries, 5);
    }
}
