//! Edgehub correlation cache.
//!
//! Acknowledgements are parked here under their request identity until the
//! waiting caller pops them. Entries nobody pops are expired by a background
//! sweep after a long retention window.

#![forbid(unsafe_code)]

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use edgehub_codec::AckEnvelope;
use metrics::{counter, histogram};
use rustc_hash::FxHashMap;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info};

/// Shortest sweep period; `interval` refuses a zero period.
pub const MIN_SWEEP_PERIOD: Duration = Duration::from_millis(1);

#[derive(Debug, Clone)]
pub struct SweepConfig {
    pub period: Duration,
    pub retention: Duration,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self { period: Duration::from_secs(5), retention: Duration::from_secs(2 * 60 * 60) }
    }
}

struct Entry {
    ack: AckEnvelope,
    inserted_at: Instant,
}

#[derive(Default)]
pub struct CorrelationCache {
    entries: Mutex<FxHashMap<String, Entry>>,
    wake: Notify,
}

impl std::fmt::Debug for CorrelationCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CorrelationCache").field("len", &self.len()).finish()
    }
}

impl CorrelationCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, FxHashMap<String, Entry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }

    /// Store `ack` under its identity, replacing any earlier one, and wake all waiters.
    pub fn set(&self, ack: AckEnvelope) {
        debug!(identity = %ack.identity, "ack stored");
        let identity = ack.identity.clone();
        self.entries().insert(identity, Entry { ack, inserted_at: Instant::now() });
        counter!("correlate_set_total", 1u64);
        self.wake.notify_waiters();
    }

    /// Remove and return the entry for `identity` without waiting.
    pub fn take(&self, identity: &str) -> Option<AckEnvelope> {
        self.entries().remove(identity).map(|e| e.ack)
    }

    /// Wait up to `timeout` for the ack of `identity`, removing it when found.
    /// At most one caller ever receives a given entry.
    pub async fn pop_wait(&self, identity: &str, timeout: Duration) -> Option<AckEnvelope> {
        let started = Instant::now();
        let deadline = started + timeout;
        loop {
            // Register for the wake before checking, so a set in between is not lost.
            let notified = self.wake.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(ack) = self.take(identity) {
                histogram!("correlate_wait_ms", started.elapsed().as_secs_f64() * 1000.0);
                return Some(ack);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                let last = self.take(identity);
                if last.is_none() {
                    counter!("correlate_timeouts_total", 1u64);
                    debug!(identity = %identity, timeout_ms = timeout.as_millis() as u64, "no ack");
                }
                return last;
            }
        }
    }

    /// Drop entries older than `retention`, then wake all waiters. Returns the number dropped.
    pub fn sweep_once(&self, retention: Duration) -> usize {
        let now = Instant::now();
        let dropped = {
            let mut entries = self.entries();
            let before = entries.len();
            entries.retain(|_, e| now.saturating_duration_since(e.inserted_at) <= retention);
            before - entries.len()
        };
        if dropped > 0 {
            counter!("correlate_expired_total", dropped as u64);
            debug!(dropped, "expired unclaimed acks");
        }
        self.wake.notify_waiters();
        dropped
    }

    /// Spawn the periodic sweep. It stops once the cache itself is dropped.
    pub fn start(self: &Arc<Self>, cfg: SweepConfig) -> JoinHandle<()> {
        let weak = Arc::downgrade(self);
        info!(period_ms = cfg.period.as_millis() as u64, retention_s = cfg.retention.as_secs(), "correlation sweep started");
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(cfg.period.max(MIN_SWEEP_PERIOD));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(cache) = weak.upgrade() else { break };
                cache.sweep_once(cfg.retention);
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_before_wait_is_not_lost() {
        let cache = CorrelationCache::new();
        cache.set(AckEnvelope::ok("a", None));
        let got = cache.pop_wait("a", Duration::from_millis(10)).await;
        assert_eq!(got.map(|a| a.identity), Some("a".to_string()));
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn later_set_overwrites() {
        let cache = CorrelationCache::new();
        cache.set(AckEnvelope::ok("a", None));
        cache.set(AckEnvelope::string_error("a", "second"));
        assert_eq!(cache.len(), 1);
        let got = cache.take("a").unwrap();
        assert!(got.outcome().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_keeps_young_entries() {
        let cache = CorrelationCache::new();
        cache.set(AckEnvelope::ok("old", None));
        tokio::time::advance(Duration::from_secs(30)).await;
        cache.set(AckEnvelope::ok("young", None));
        assert_eq!(cache.sweep_once(Duration::from_secs(10)), 1);
        assert!(cache.take("old").is_none());
        assert!(cache.take("young").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn zero_period_sweeper_keeps_running() {
        let cache = Arc::new(CorrelationCache::new());
        let task = cache.start(SweepConfig { period: Duration::ZERO, retention: Duration::from_secs(1) });
        cache.set(AckEnvelope::ok("a", None));
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(cache.is_empty());
        assert!(!task.is_finished());
        task.abort();
    }
}
