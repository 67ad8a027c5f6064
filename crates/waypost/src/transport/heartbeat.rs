//! Outstanding pings and latency smoothing.

use std::collections::HashMap;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;

struct PendingPing {
    sent_at: Instant,
    timeout: Option<JoinHandle<()>>,
}

#[derive(Default)]
pub struct HeartbeatTracker {
    pending: HashMap<String, PendingPing>,
    missed: u32,
    latency: Option<Duration>,
}

impl HeartbeatTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remember a ping and the task that will expire it.
    pub fn record_ping(&mut self, ping_id: String, sent_at: Instant, timeout: Option<JoinHandle<()>>) {
        self.pending.insert(ping_id, PendingPing { sent_at, timeout });
    }

    /// Match a reply. Returns the round trip if `ping_id` was outstanding.
    ///
    /// Latency is the average of the previous value and this sample.
    pub fn acknowledge(&mut self, ping_id: &str, now: Instant) -> Option<Duration> {
        let ping = self.pending.remove(ping_id)?;
        if let Some(timeout) = ping.timeout {
            timeout.abort();
        }
        let rtt = now.saturating_duration_since(ping.sent_at);
        self.latency = Some(match self.latency {
            Some(previous) => (previous + rtt) / 2,
            None => rtt,
        });
        self.missed = 0;
        Some(rtt)
    }

    /// A ping's timeout fired. Returns the consecutive miss count, or `None`
    /// if the ping had already been answered or cleared.
    pub fn expire(&mut self, ping_id: &str) -> Option<u32> {
        self.pending.remove(ping_id)?;
        self.missed += 1;
        Some(self.missed)
    }

    /// Forget every outstanding ping and cancel their timeouts.
    pub fn clear(&mut self) {
        for (_, ping) in self.pending.drain() {
            if let Some(timeout) = ping.timeout {
                timeout.abort();
            }
        }
        self.missed = 0;
    }

    pub fn missed(&self) -> u32 {
        self.missed
    }

    pub fn latency(&self) -> Option<Duration> {
        self.latency
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }
}

impl Drop for HeartbeatTracker {
    fn drop(&mut self) {
        self.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn latency_is_two_sample_average() {
        let t0 = Instant::now();
        let mut tracker = HeartbeatTracker::new();

        tracker.record_ping("a".into(), t0, None);
        assert_eq!(tracker.acknowledge("a", t0 + Duration::from_millis(100)), Some(Duration::from_millis(100)));
        assert_eq!(tracker.latency(), Some(Duration::from_millis(100)));

        tracker.record_ping("b".into(), t0, None);
        tracker.acknowledge("b", t0 + Duration::from_millis(300));
        assert_eq!(tracker.latency(), Some(Duration::from_millis(200)));
    }

    #[test]
    fn reply_resets_missed() {
        let t0 = Instant::now();
        let mut tracker = HeartbeatTracker::new();
        tracker.record_ping("a".into(), t0, None);
        tracker.record_ping("b".into(), t0, None);

        assert_eq!(tracker.expire("a"), Some(1));
        assert_eq!(tracker.missed(), 1);

        tracker.acknowledge("b", t0);
        assert_eq!(tracker.missed(), 0);
    }

    #[test]
    fn unknown_ids_are_ignored() {
        let mut tracker = HeartbeatTracker::new();
        assert_eq!(tracker.acknowledge("nope", Instant::now()), None);
        assert_eq!(tracker.expire("nope"), None);
        assert_eq!(tracker.missed(), 0);
    }

    #[test]
    fn cleared_pings_cannot_expire() {
        let mut tracker = HeartbeatTracker::new();
        tracker.record_ping("a".into(), Instant::now(), None);
        tracker.clear();
        assert_eq!(tracker.expire("a"), None);
        assert_eq!(tracker.pending(), 0);
    }
}
