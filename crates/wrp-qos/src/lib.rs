//! Bounded priority queue with byte accounting and age-based expiration.
//! A single lock guards both the bucket contents and the byte
//! counter, held only across admission/extraction decisions — never across
//! an await point.

use std::collections::VecDeque;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::Notify;
use wrp_core::{Clock, WrpMessage};

/// One of the four priority buckets the cloud contract fixes.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub enum Priority {
    Low,
    Medium,
    High,
    Critical,
}

impl Priority {
    /// Maps a message's numeric `qos` field (`0..=99`) to a bucket.
    pub fn from_qos(qos: u8) -> Priority {
        match qos {
            0..=24 => Priority::Low,
            25..=49 => Priority::Medium,
            50..=74 => Priority::High,
            _ => Priority::Critical,
        }
    }

    fn all_descending() -> [Priority; 4] {
        [Priority::Critical, Priority::High, Priority::Medium, Priority::Low]
    }
}

/// Which end of a bucket to evict from when trimming to the byte budget.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum EvictionPolicy {
    /// Evict the most recently enqueued item, keeping older messages.
    Newest,
    Oldest,
}

impl Default for EvictionPolicy {
    fn default() -> Self {
        EvictionPolicy::Newest
    }
}

#[derive(Debug, thiserror::Error, Eq, PartialEq)]
pub enum QosError {
    #[error("message of {size} bytes exceeds max_message_bytes of {max}")]
    TooLarge { size: usize, max: usize },
}

/// Per-bucket max age after which a message is evicted rather than
/// delivered.
#[derive(Clone, Copy, Debug)]
pub struct ExpirationPolicy {
    pub low: Duration,
    pub medium: Duration,
    pub high: Duration,
    pub critical: Duration,
}

impl ExpirationPolicy {
    pub fn for_priority(&self, p: Priority) -> Duration {
        match p {
            Priority::Low => self.low,
            Priority::Medium => self.medium,
            Priority::High => self.high,
            Priority::Critical => self.critical,
        }
    }
}

impl Default for ExpirationPolicy {
    fn default() -> Self {
        Self {
            low: Duration::from_secs(60),
            medium: Duration::from_secs(120),
            high: Duration::from_secs(300),
            critical: Duration::from_secs(600),
        }
    }
}

struct Item {
    message: WrpMessage,
    enqueued_at: DateTime<Utc>,
    size_bytes: usize,
}

struct Buckets {
    low: VecDeque<Item>,
    medium: VecDeque<Item>,
    high: VecDeque<Item>,
    critical: VecDeque<Item>,
    total_bytes: usize,
}

impl Buckets {
    fn new() -> Self {
        Self {
            low: VecDeque::new(),
            medium: VecDeque::new(),
            high: VecDeque::new(),
            critical: VecDeque::new(),
            total_bytes: 0,
        }
    }

    fn bucket_mut(&mut self, p: Priority) -> &mut VecDeque<Item> {
        match p {
            Priority::Low => &mut self.low,
            Priority::Medium => &mut self.medium,
            Priority::High => &mut self.high,
            Priority::Critical => &mut self.critical,
        }
    }

    fn lowest_nonempty(&self) -> Option<Priority> {
        for p in [Priority::Low, Priority::Medium, Priority::High, Priority::Critical] {
            if !self.bucket_ref(p).is_empty() {
                return Some(p);
            }
        }
        None
    }

    fn bucket_ref(&self, p: Priority) -> &VecDeque<Item> {
        match p {
            Priority::Low => &self.low,
            Priority::Medium => &self.medium,
            Priority::High => &self.high,
            Priority::Critical => &self.critical,
        }
    }
}

/// Configuration for a [`QosQueue`].
#[derive(Clone, Copy, Debug)]
pub struct QosConfig {
    pub max_queue_bytes: usize,
    pub max_message_bytes: usize,
    pub eviction_policy: EvictionPolicy,
    pub expiration: ExpirationPolicy,
}

/// The bounded priority queue itself. `Dequeue` is a blocking, cancellable
/// async call; `TryEnqueue` never blocks the producer.
pub struct QosQueue<C: Clock = wrp_core::clock::SystemClock> {
    config: QosConfig,
    buckets: Mutex<Buckets>,
    notify: Notify,
    clock: C,
}

impl QosQueue<wrp_core::clock::SystemClock> {
    pub fn new(config: QosConfig) -> Self {
        Self::with_clock(config, wrp_core::clock::SystemClock)
    }
}

impl<C: Clock> QosQueue<C> {
    pub fn with_clock(config: QosConfig, clock: C) -> Self {
        Self {
            config,
            buckets: Mutex::new(Buckets::new()),
            notify: Notify::new(),
            clock,
        }
    }

    /// Total bytes currently admitted.
    pub fn total_bytes(&self) -> usize {
        self.buckets.lock().total_bytes
    }

    /// Admits a message without blocking. Rejects messages larger than
    /// `max_message_bytes`; otherwise admits and, if the byte budget would
    /// be exceeded, trims from the lowest non-empty bucket per the
    /// configured [`EvictionPolicy`].
    pub fn try_enqueue(&self, message: WrpMessage) -> Result<(), QosError> {
        let size_bytes = message.size_bytes();
        if size_bytes > self.config.max_message_bytes {
            return Err(QosError::TooLarge { size: size_bytes, max: self.config.max_message_bytes });
        }
        let priority = Priority::from_qos(message.qos);
        let item = Item { message, enqueued_at: self.clock.now(), size_bytes };

        let mut guard = self.buckets.lock();
        guard.bucket_mut(priority).push_back(item);
        guard.total_bytes += size_bytes;

        while guard.total_bytes > self.config.max_queue_bytes {
            let Some(victim_bucket) = guard.lowest_nonempty() else { break };
            let evicted = match self.config.eviction_policy {
                EvictionPolicy::Newest => guard.bucket_mut(victim_bucket).pop_back(),
                EvictionPolicy::Oldest => guard.bucket_mut(victim_bucket).pop_front(),
            };
            match evicted {
                Some(victim) => {
                    guard.total_bytes -= victim.size_bytes;
                    tracing::warn!(
                        target: "wrp_qos",
                        bucket = ?victim_bucket,
                        evicted_bytes = victim.size_bytes,
                        "queue over budget; evicted message to stay within max_queue_bytes"
                    );
                }
                None => break,
            }
        }
        drop(guard);
        self.notify.notify_one();
        Ok(())
    }

    /// Drops every item in `bucket` whose age exceeds the bucket's
    /// expiration policy. Called lazily before each extraction attempt.
    fn evict_expired_locked(&self, guard: &mut Buckets) {
        let now = self.clock.now();
        for p in [Priority::Low, Priority::Medium, Priority::High, Priority::Critical] {
            let max_age = self.config.expiration.for_priority(p);
            let bucket = guard.bucket_mut(p);
            while let Some(front) = bucket.front() {
                let age = now.signed_duration_since(front.enqueued_at);
                if age.to_std().map(|a| a > max_age).unwrap_or(false) {
                    let dropped = bucket.pop_front().expect("front just peeked");
                    guard.total_bytes -= dropped.size_bytes;
                    tracing::debug!(target: "wrp_qos", bucket = ?p, "dropped expired message");
                } else {
                    break;
                }
            }
        }
    }

    fn try_dequeue_locked(&self) -> Option<WrpMessage> {
        let mut guard = self.buckets.lock();
        self.evict_expired_locked(&mut guard);
        for p in Priority::all_descending() {
            if let Some(item) = guard.bucket_mut(p).pop_front() {
                guard.total_bytes -= item.size_bytes;
                return Some(item.message);
            }
        }
        None
    }

    /// Blocks until a message is available (strict Critical > High > Medium
    /// > Low, FIFO within a bucket) or `cancelled` completes. Expired
    /// messages are evicted lazily, never delivered.
    pub async fn dequeue(&self, cancelled: impl std::future::Future<Output = ()>) -> Option<WrpMessage> {
        tokio::pin!(cancelled);
        loop {
            if let Some(message) = self.try_dequeue_locked() {
                return Some(message);
            }
            tokio::select! {
                _ = self.notify.notified() => {}
                _ = &mut cancelled => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::future::pending;
    use wrp_core::message::MessageType;

    fn config(max_queue: usize, max_msg: usize, policy: EvictionPolicy) -> QosConfig {
        QosConfig {
            max_queue_bytes: max_queue,
            max_message_bytes: max_msg,
            eviction_policy: policy,
            expiration: ExpirationPolicy {
                low: Duration::from_secs(3600),
                medium: Duration::from_secs(3600),
                high: Duration::from_secs(3600),
                critical: Duration::from_secs(3600),
            },
        }
    }

    fn msg_with_payload(qos: u8, payload_len: usize) -> WrpMessage {
        let mut m = WrpMessage::new(MessageType::SimpleEvent, "a", "b");
        m.qos = qos;
        m.payload = vec![0u8; payload_len];
        m
    }

    #[test]
    fn priority_bucketing_matches_contract() {
        assert_eq!(Priority::from_qos(0), Priority::Low);
        assert_eq!(Priority::from_qos(24), Priority::Low);
        assert_eq!(Priority::from_qos(25), Priority::Medium);
        assert_eq!(Priority::from_qos(49), Priority::Medium);
        assert_eq!(Priority::from_qos(50), Priority::High);
        assert_eq!(Priority::from_qos(74), Priority::High);
        assert_eq!(Priority::from_qos(75), Priority::Critical);
        assert_eq!(Priority::from_qos(99), Priority::Critical);
    }

    #[test]
    fn rejects_messages_over_max_message_bytes() {
        let q = QosQueue::new(config(10_000, 100, EvictionPolicy::Newest));
        let err = q.try_enqueue(msg_with_payload(10, 500)).unwrap_err();
        assert!(matches!(err, QosError::TooLarge { .. }));
    }

    #[tokio::test]
    async fn newest_low_priority_message_is_evicted_first_under_overflow() {
        // Enqueue Low(400), Low(400), Critical(400) into a 1024-byte budget
        // with a 512-byte per-message cap: the second Low is evicted, so
        // extraction order is Critical, then the first Low.
        let q = QosQueue::new(config(1024, 512, EvictionPolicy::Newest));
        let low1 = msg_with_payload(10, 400);
        let low1_size = low1.size_bytes();
        q.try_enqueue(low1).unwrap();
        q.try_enqueue(msg_with_payload(10, 400)).unwrap();
        q.try_enqueue(msg_with_payload(90, 400)).unwrap();

        assert!(q.total_bytes() <= 1024);

        let first = q.dequeue(pending()).await.unwrap();
        assert_eq!(Priority::from_qos(first.qos), Priority::Critical);

        let second = q.dequeue(pending()).await.unwrap();
        assert_eq!(Priority::from_qos(second.qos), Priority::Low);
        assert_eq!(second.size_bytes(), low1_size);

        assert!(q.dequeue(futures_now_ready()).await.is_none());
    }

    fn futures_now_ready() -> impl std::future::Future<Output = ()> {
        async {}
    }

    #[tokio::test]
    async fn extraction_is_strictly_priority_ordered() {
        let q = QosQueue::new(config(1_000_000, 1_000_000, EvictionPolicy::Newest));
        q.try_enqueue(msg_with_payload(10, 10)).unwrap(); // Low
        q.try_enqueue(msg_with_payload(60, 10)).unwrap(); // High
        q.try_enqueue(msg_with_payload(30, 10)).unwrap(); // Medium
        q.try_enqueue(msg_with_payload(90, 10)).unwrap(); // Critical

        let mut order = Vec::new();
        for _ in 0..4 {
            let message = q.dequeue(pending()).await.unwrap();
            order.push(Priority::from_qos(message.qos));
        }
        assert_eq!(order, vec![Priority::Critical, Priority::High, Priority::Medium, Priority::Low]);
    }

    #[tokio::test]
    async fn dequeue_blocks_until_enqueue() {
        let q = std::sync::Arc::new(QosQueue::new(config(10_000, 1_000, EvictionPolicy::Newest)));
        let q2 = std::sync::Arc::clone(&q);
        let handle = tokio::spawn(async move { q2.dequeue(pending()).await });
        tokio::task::yield_now().await;
        q.try_enqueue(msg_with_payload(50, 10)).unwrap();
        let result = tokio::time::timeout(Duration::from_secs(1), handle).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn dequeue_respects_cancellation() {
        let q = QosQueue::new(config(10_000, 1_000, EvictionPolicy::Newest));
        let result = q.dequeue(async {}).await;
        assert!(result.is_none());
    }
}
