use async_trait::async_trait;
use chrono::{DateTime, Utc};
use egress_types::{BounceEvent, BounceType, IdentityKey, RotationEvent, ThresholdBreach};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// Raw counters observed for an identity since some point in time.
/// The tracker turns these into a `StatWindow`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WindowCounts {
    pub sent: u64,
    pub hard: u64,
    pub soft: u64,
    pub block: u64,
}

impl WindowCounts {
    pub fn total_bounced(&self) -> u64 {
        self.hard + self.soft + self.block
    }
}

/// An entry in the append-only event log shared by the stats tracker,
/// threshold engine and rotation pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EventRecord {
    Bounce(BounceEvent),
    Breach(ThresholdBreach),
    Rotation(RotationEvent),
}

impl EventRecord {
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Self::Bounce(event) => event.timestamp,
            Self::Breach(breach) => breach.breach_time,
            Self::Rotation(rotation) => rotation.timestamp,
        }
    }

    pub fn identity(&self) -> &IdentityKey {
        match self {
            Self::Bounce(event) => &event.identity,
            Self::Breach(breach) => &breach.identity,
            Self::Rotation(rotation) => &rotation.from_identity,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Bounce(_) => "Bounce",
            Self::Breach(_) => "Breach",
            Self::Rotation(_) => "Rotation",
        }
    }
}

/// Storage port for rolling counters and the event log. The tracker
/// and its consumers depend only on this trait; production deployments
/// use the sqlite implementation while tests use `MemoryStore`.
#[async_trait]
pub trait BounceStore: Send + Sync {
    /// Add `count` sends for `identity` at `timestamp`.
    async fn record_sent(
        &self,
        identity: &IdentityKey,
        count: u64,
        timestamp: DateTime<Utc>,
    ) -> anyhow::Result<()>;

    /// Append a bounce event and account for it in the rolling counters.
    async fn record_bounce(&self, event: &BounceEvent) -> anyhow::Result<()>;

    /// Counters observed for `identity` at or after `since`.
    /// An unknown identity yields zeroed counts, not an error.
    async fn get_stats(
        &self,
        identity: &IdentityKey,
        since: DateTime<Utc>,
    ) -> anyhow::Result<WindowCounts>;

    /// Every identity with recorded activity.
    async fn list_identities(&self) -> anyhow::Result<Vec<IdentityKey>>;

    /// Append a breach or rotation record to the event log.
    async fn append_event(&self, event: &EventRecord) -> anyhow::Result<()>;

    /// Events in `[since, until)`, optionally restricted to one identity.
    async fn query_events(
        &self,
        identity: Option<&IdentityKey>,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> anyhow::Result<Vec<EventRecord>>;

    /// Remove events and counter buckets older than `cutoff`.
    /// Returns the number of rows removed.
    async fn purge_older_than(&self, cutoff: DateTime<Utc>) -> anyhow::Result<u64>;

    /// Discard all counters and events for `identity`.
    async fn reset(&self, identity: &IdentityKey) -> anyhow::Result<()>;

    /// Replace the persisted batch-queue snapshot. The payloads are
    /// opaque to the store; the admission layer serializes its queued
    /// batches here so they survive a restart.
    async fn save_queue_snapshot(&self, items: &[String]) -> anyhow::Result<()>;

    /// Load the batch-queue snapshot, in the order it was saved.
    async fn load_queue_snapshot(&self) -> anyhow::Result<Vec<String>>;
}

/// Sent counters are bucketed at minute granularity; finer resolution
/// buys nothing for windows measured in hours.
pub(crate) const BUCKET_SECONDS: i64 = 60;

pub(crate) fn bucket_ts(ts: DateTime<Utc>) -> i64 {
    let secs = ts.timestamp();
    secs - secs.rem_euclid(BUCKET_SECONDS)
}

#[derive(Default)]
struct MemoryInner {
    /// identity -> minute bucket -> sent count
    sent: HashMap<IdentityKey, BTreeMap<i64, u64>>,
    events: Vec<EventRecord>,
    queue_snapshot: Vec<String>,
}

/// In-memory implementation of the storage port.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BounceStore for MemoryStore {
    async fn record_sent(
        &self,
        identity: &IdentityKey,
        count: u64,
        timestamp: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        let mut inner = self.inner.lock();
        let buckets = inner.sent.entry(identity.clone()).or_default();
        *buckets.entry(bucket_ts(timestamp)).or_insert(0) += count;
        Ok(())
    }

    async fn record_bounce(&self, event: &BounceEvent) -> anyhow::Result<()> {
        let mut inner = self.inner.lock();
        // Make sure the identity is listed even if we never saw a send
        inner.sent.entry(event.identity.clone()).or_default();
        inner.events.push(EventRecord::Bounce(event.clone()));
        Ok(())
    }

    async fn get_stats(
        &self,
        identity: &IdentityKey,
        since: DateTime<Utc>,
    ) -> anyhow::Result<WindowCounts> {
        let inner = self.inner.lock();
        let mut counts = WindowCounts::default();

        if let Some(buckets) = inner.sent.get(identity) {
            counts.sent = buckets.range(bucket_ts(since)..).map(|(_, v)| v).sum();
        }

        for event in &inner.events {
            if let EventRecord::Bounce(bounce) = event {
                if bounce.identity == *identity && bounce.timestamp >= since {
                    match bounce.bounce_type {
                        BounceType::Hard => counts.hard += 1,
                        BounceType::Soft => counts.soft += 1,
                        BounceType::Block => counts.block += 1,
                    }
                }
            }
        }

        Ok(counts)
    }

    async fn list_identities(&self) -> anyhow::Result<Vec<IdentityKey>> {
        let inner = self.inner.lock();
        let mut identities: Vec<IdentityKey> = inner.sent.keys().cloned().collect();
        identities.sort();
        Ok(identities)
    }

    async fn append_event(&self, event: &EventRecord) -> anyhow::Result<()> {
        self.inner.lock().events.push(event.clone());
        Ok(())
    }

    async fn query_events(
        &self,
        identity: Option<&IdentityKey>,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> anyhow::Result<Vec<EventRecord>> {
        let inner = self.inner.lock();
        Ok(inner
            .events
            .iter()
            .filter(|event| {
                let ts = event.timestamp();
                ts >= since
                    && ts < until
                    && identity.map(|id| event.identity() == id).unwrap_or(true)
            })
            .cloned()
            .collect())
    }

    async fn purge_older_than(&self, cutoff: DateTime<Utc>) -> anyhow::Result<u64> {
        let mut inner = self.inner.lock();
        let cutoff_bucket = bucket_ts(cutoff);
        let mut removed = 0u64;

        for buckets in inner.sent.values_mut() {
            let before = buckets.len();
            buckets.retain(|ts, _| *ts >= cutoff_bucket);
            removed += (before - buckets.len()) as u64;
        }

        let before = inner.events.len();
        inner.events.retain(|event| event.timestamp() >= cutoff);
        removed += (before - inner.events.len()) as u64;

        Ok(removed)
    }

    async fn reset(&self, identity: &IdentityKey) -> anyhow::Result<()> {
        let mut inner = self.inner.lock();
        inner.sent.remove(identity);
        inner.events.retain(|event| event.identity() != identity);
        Ok(())
    }

    async fn save_queue_snapshot(&self, items: &[String]) -> anyhow::Result<()> {
        self.inner.lock().queue_snapshot = items.to_vec();
        Ok(())
    }

    async fn load_queue_snapshot(&self) -> anyhow::Result<Vec<String>> {
        Ok(self.inner.lock().queue_snapshot.clone())
    }
}
