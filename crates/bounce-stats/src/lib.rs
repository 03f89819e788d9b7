//! Rolling bounce/failure statistics per sending identity.
//!
//! Sends and bounce callbacks are recorded against the storage port;
//! stat windows are recomputed from the counters that fall inside the
//! configured trailing window and served through a short-TTL cache for
//! hot-path admission checks.
use crate::cache::TtlCache;
use crate::store::{BounceStore, WindowCounts};
use chrono::{DateTime, Utc};
use egress_types::{BounceEvent, IdentityKey};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

pub mod cache;
pub mod sqlite_store;
pub mod store;

pub use sqlite_store::SqliteStore;
pub use store::{EventRecord, MemoryStore};

#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct StatsConfig {
    /// Trailing window over which bounce rates are computed
    #[serde(default = "StatsConfig::default_window", with = "humantime_serde")]
    pub window: Duration,

    /// Bounce rate at which an identity is considered degraded
    #[serde(default = "StatsConfig::default_warning_threshold")]
    pub warning_threshold: f64,

    #[serde(default = "StatsConfig::default_critical_threshold")]
    pub critical_threshold: f64,

    /// Bounce rate at which the identity is presumed block-listed
    #[serde(default = "StatsConfig::default_block_threshold")]
    pub block_threshold: f64,

    /// Never classify below this many sends; small samples produce
    /// meaningless rates
    #[serde(default = "StatsConfig::default_minimum_sample_size")]
    pub minimum_sample_size: u64,

    #[serde(default = "StatsConfig::default_cache_ttl", with = "humantime_serde")]
    pub cache_ttl: Duration,

    #[serde(default = "StatsConfig::default_cache_capacity")]
    pub cache_capacity: usize,
}

impl StatsConfig {
    fn default_window() -> Duration {
        Duration::from_secs(24 * 3600)
    }
    fn default_warning_threshold() -> f64 {
        0.05
    }
    fn default_critical_threshold() -> f64 {
        0.10
    }
    fn default_block_threshold() -> f64 {
        0.15
    }
    fn default_minimum_sample_size() -> u64 {
        50
    }
    fn default_cache_ttl() -> Duration {
        Duration::from_secs(120)
    }
    fn default_cache_capacity() -> usize {
        1024
    }
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            window: Self::default_window(),
            warning_threshold: Self::default_warning_threshold(),
            critical_threshold: Self::default_critical_threshold(),
            block_threshold: Self::default_block_threshold(),
            minimum_sample_size: Self::default_minimum_sample_size(),
            cache_ttl: Self::default_cache_ttl(),
            cache_capacity: Self::default_cache_capacity(),
        }
    }
}

/// Coarse health classification of an identity's current window.
#[derive(
    Serialize,
    Deserialize,
    Debug,
    Copy,
    Clone,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    strum::Display,
)]
pub enum StatStatus {
    Healthy,
    Warning,
    Critical,
    Blocked,
}

/// The computed rolling statistics for one identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatWindow {
    pub identity: IdentityKey,
    pub total_sent: u64,
    pub total_bounced: u64,
    pub hard_bounces: u64,
    pub soft_bounces: u64,
    pub block_bounces: u64,
    pub bounce_rate: f64,
    pub status: StatStatus,
    pub last_updated: DateTime<Utc>,
}

impl StatWindow {
    /// The zero-valued window reported for an identity with no
    /// recorded activity.
    pub fn zero(identity: IdentityKey) -> Self {
        Self {
            identity,
            total_sent: 0,
            total_bounced: 0,
            hard_bounces: 0,
            soft_bounces: 0,
            block_bounces: 0,
            bounce_rate: 0.0,
            status: StatStatus::Healthy,
            last_updated: Utc::now(),
        }
    }
}

/// Classify a bounce rate against the configured status thresholds.
/// Pure: never consults storage. Identities below the minimum sample
/// size are always Healthy regardless of rate.
pub fn classify_rate(config: &StatsConfig, total_sent: u64, bounce_rate: f64) -> StatStatus {
    if total_sent < config.minimum_sample_size {
        return StatStatus::Healthy;
    }
    if bounce_rate >= config.block_threshold {
        StatStatus::Blocked
    } else if bounce_rate >= config.critical_threshold {
        StatStatus::Critical
    } else if bounce_rate >= config.warning_threshold {
        StatStatus::Warning
    } else {
        StatStatus::Healthy
    }
}

/// Tracks per-identity send/bounce counters inside a trailing window.
/// Writes always land in the durable store first; reads may be served
/// from a short-lived cache whose entries are invalidated by writes.
pub struct StatsTracker {
    store: Arc<dyn BounceStore>,
    cache: TtlCache<IdentityKey, StatWindow>,
    config: StatsConfig,
}

impl StatsTracker {
    pub fn new(store: Arc<dyn BounceStore>, config: StatsConfig) -> Self {
        let cache = TtlCache::new(config.cache_capacity, config.cache_ttl);
        Self {
            store,
            cache,
            config,
        }
    }

    pub fn config(&self) -> &StatsConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn BounceStore> {
        &self.store
    }

    pub async fn record_sent(&self, identity: &IdentityKey) -> anyhow::Result<()> {
        self.record_sent_count(identity, 1).await
    }

    pub async fn record_sent_count(
        &self,
        identity: &IdentityKey,
        count: u64,
    ) -> anyhow::Result<()> {
        self.store.record_sent(identity, count, Utc::now()).await?;
        self.cache.invalidate(identity);
        Ok(())
    }

    pub async fn record_bounce(&self, event: &BounceEvent) -> anyhow::Result<()> {
        self.store.record_bounce(event).await?;
        self.cache.invalidate(&event.identity);
        Ok(())
    }

    /// Compute (or serve from cache) the rolling window for an
    /// identity. An identity the store has never seen yields the
    /// zero-valued window, not an error.
    pub async fn get_stats(&self, identity: &IdentityKey) -> anyhow::Result<StatWindow> {
        if let Some(window) = self.cache.get(identity) {
            return Ok(window);
        }

        let since = Utc::now()
            - chrono::Duration::from_std(self.config.window)
                .unwrap_or_else(|_| chrono::Duration::hours(24));
        let counts = self.store.get_stats(identity, since).await?;
        let window = self.build_window(identity.clone(), counts);
        Ok(self.cache.insert(identity.clone(), window))
    }

    pub async fn get_all_stats(&self) -> anyhow::Result<Vec<StatWindow>> {
        let mut windows = vec![];
        for identity in self.store.list_identities().await? {
            windows.push(self.get_stats(&identity).await?);
        }
        Ok(windows)
    }

    /// All identities whose current status is worse than Healthy,
    /// grouped by that status.
    pub async fn check_all_threshold_violations(
        &self,
    ) -> anyhow::Result<BTreeMap<StatStatus, Vec<StatWindow>>> {
        let mut grouped: BTreeMap<StatStatus, Vec<StatWindow>> = BTreeMap::new();
        for window in self.get_all_stats().await? {
            if window.status != StatStatus::Healthy {
                grouped.entry(window.status).or_default().push(window);
            }
        }
        Ok(grouped)
    }

    pub async fn reset(&self, identity: &IdentityKey) -> anyhow::Result<()> {
        self.store.reset(identity).await?;
        self.cache.invalidate(identity);
        Ok(())
    }

    /// Drop events and counter buckets older than `age` from the
    /// store. Returns the number of rows removed.
    pub async fn purge_older_than(&self, age: Duration) -> anyhow::Result<u64> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(age).unwrap_or_else(|_| chrono::Duration::hours(24));
        let removed = self.store.purge_older_than(cutoff).await?;
        if removed > 0 {
            self.cache.clear();
            tracing::debug!("purged {removed} stats rows older than {age:?}");
        }
        Ok(removed)
    }

    fn build_window(&self, identity: IdentityKey, counts: WindowCounts) -> StatWindow {
        let total_bounced = counts.total_bounced();
        let bounce_rate = if counts.sent > 0 {
            total_bounced as f64 / counts.sent as f64
        } else {
            0.0
        };
        StatWindow {
            status: classify_rate(&self.config, counts.sent, bounce_rate),
            identity,
            total_sent: counts.sent,
            total_bounced,
            hard_bounces: counts.hard,
            soft_bounces: counts.soft,
            block_bounces: counts.block,
            bounce_rate,
            last_updated: Utc::now(),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use egress_types::BounceType;

    fn identity(n: u8) -> IdentityKey {
        IdentityKey::new(format!("192.0.2.{n}").parse().unwrap(), "acct")
    }

    fn bounce(identity: IdentityKey, bounce_type: BounceType) -> BounceEvent {
        BounceEvent {
            recipient: "user@example.com".to_string(),
            identity,
            bounce_type,
            reason: "550 5.1.1 user unknown".to_string(),
            timestamp: Utc::now(),
        }
    }

    fn tracker() -> StatsTracker {
        StatsTracker::new(Arc::new(MemoryStore::new()), StatsConfig::default())
    }

    #[tokio::test]
    async fn bounce_rate_is_exact_quotient() {
        let tracker = tracker();
        let id = identity(1);

        for _ in 0..200 {
            tracker.record_sent(&id).await.unwrap();
        }
        for _ in 0..30 {
            tracker
                .record_bounce(&bounce(id.clone(), BounceType::Hard))
                .await
                .unwrap();
        }

        let window = tracker.get_stats(&id).await.unwrap();
        k9::assert_equal!(window.total_sent, 200);
        k9::assert_equal!(window.total_bounced, 30);
        assert!((window.bounce_rate - 0.15).abs() < f64::EPSILON);
        k9::assert_equal!(window.status, StatStatus::Blocked);
    }

    #[tokio::test]
    async fn zero_sends_means_zero_rate() {
        let tracker = tracker();
        let window = tracker.get_stats(&identity(9)).await.unwrap();
        k9::assert_equal!(window.total_sent, 0);
        k9::assert_equal!(window.bounce_rate, 0.0);
        k9::assert_equal!(window.status, StatStatus::Healthy);
    }

    #[tokio::test]
    async fn small_samples_are_never_classified() {
        // 3/10 = 30% bounce rate, but only 10 sends against a
        // minimum sample of 50: must stay Healthy
        let tracker = tracker();
        let id = identity(2);

        for _ in 0..10 {
            tracker.record_sent(&id).await.unwrap();
        }
        for _ in 0..3 {
            tracker
                .record_bounce(&bounce(id.clone(), BounceType::Soft))
                .await
                .unwrap();
        }

        let window = tracker.get_stats(&id).await.unwrap();
        assert!((window.bounce_rate - 0.3).abs() < f64::EPSILON);
        k9::assert_equal!(window.status, StatStatus::Healthy);
    }

    #[tokio::test]
    async fn writes_invalidate_the_cache() {
        let tracker = tracker();
        let id = identity(3);

        for _ in 0..100 {
            tracker.record_sent(&id).await.unwrap();
        }
        let before = tracker.get_stats(&id).await.unwrap();
        k9::assert_equal!(before.total_bounced, 0);

        tracker
            .record_bounce(&bounce(id.clone(), BounceType::Block))
            .await
            .unwrap();

        // The cached entry must not mask the write
        let after = tracker.get_stats(&id).await.unwrap();
        k9::assert_equal!(after.total_bounced, 1);
        k9::assert_equal!(after.block_bounces, 1);
    }

    #[tokio::test]
    async fn violations_group_by_status() {
        let config = StatsConfig {
            minimum_sample_size: 10,
            ..StatsConfig::default()
        };
        let tracker = StatsTracker::new(Arc::new(MemoryStore::new()), config);

        // healthy: 100 sent, 1 bounce
        let healthy = identity(4);
        // warning: 100 sent, 6 bounces
        let warning = identity(5);
        // blocked: 100 sent, 20 bounces
        let blocked = identity(6);

        for (id, bounces) in [(&healthy, 1), (&warning, 6), (&blocked, 20)] {
            for _ in 0..100 {
                tracker.record_sent(id).await.unwrap();
            }
            for _ in 0..bounces {
                tracker
                    .record_bounce(&bounce(id.clone(), BounceType::Hard))
                    .await
                    .unwrap();
            }
        }

        let grouped = tracker.check_all_threshold_violations().await.unwrap();
        k9::assert_equal!(grouped.len(), 2);
        k9::assert_equal!(grouped[&StatStatus::Warning][0].identity, warning);
        k9::assert_equal!(grouped[&StatStatus::Blocked][0].identity, blocked);
        assert!(!grouped.contains_key(&StatStatus::Healthy));
    }

    #[tokio::test]
    async fn reset_clears_counters() {
        let tracker = tracker();
        let id = identity(7);

        for _ in 0..60 {
            tracker.record_sent(&id).await.unwrap();
        }
        tracker.reset(&id).await.unwrap();

        let window = tracker.get_stats(&id).await.unwrap();
        k9::assert_equal!(window.total_sent, 0);
    }

    #[test]
    fn serde_round_trip_preserves_window() {
        let window = StatWindow {
            identity: identity(8),
            total_sent: 1000,
            total_bounced: 100,
            hard_bounces: 100,
            soft_bounces: 0,
            block_bounces: 0,
            bounce_rate: 0.10,
            status: StatStatus::Critical,
            last_updated: Utc::now(),
        };
        let json = serde_json::to_string(&window).unwrap();
        let round: StatWindow = serde_json::from_str(&json).unwrap();
        k9::assert_equal!(round, window);
    }
}
