//! Admission control for outbound sends. Every send attempt passes
//! through a per-identity ceiling check (daily ceiling from the
//! warm-up collaborator, burst window, current-hour bucket) and a
//! system-level state machine with pause and emergency-stop switches.
//! Batches waiting to send sit in priority queues; capacity denials
//! requeue, policy denials drop.
use bounce_stats::StatsTracker;
use chrono::Utc;
use dashmap::DashMap;
use egress_types::{
    IdentityKey, Notification, NotificationKind, NotificationPublisher, Severity, WarmupProvider,
    WarmupStatus,
};
use parking_lot::Mutex;
use prometheus::IntCounterVec;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, LazyLock};
use std::time::Duration;

mod counters;
mod queue;

pub use counters::CounterRing;
pub use queue::{Batch, BatchPriority, BatchQueues, Verdict};

static DENIALS_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    prometheus::register_int_counter_vec!(
        "admission_denials_total",
        "Send admission denials, by reason",
        &["reason"]
    )
    .unwrap()
});

static BATCHES_DROPPED: LazyLock<IntCounterVec> = LazyLock::new(|| {
    prometheus::register_int_counter_vec!(
        "batches_dropped_total",
        "Batches dropped from the send queue, by cause",
        &["cause"]
    )
    .unwrap()
});

#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct ThrottleConfig {
    /// Length of the burst window
    #[serde(default = "ThrottleConfig::default_burst_window", with = "humantime_serde")]
    pub burst_window: Duration,

    /// Maximum sends inside one burst window
    #[serde(default = "ThrottleConfig::default_burst_limit")]
    pub burst_limit: u64,

    /// Maximum sends inside the current hour
    #[serde(default = "ThrottleConfig::default_hourly_limit")]
    pub hourly_limit: u64,

    /// Daily ceiling applied when the warm-up collaborator has nothing
    /// useful to say about an identity
    #[serde(default = "ThrottleConfig::default_fallback_daily_limit")]
    pub fallback_daily_limit: u64,

    /// Daily ceiling for identities that have completed warm-up
    #[serde(default = "ThrottleConfig::default_completed_daily_limit")]
    pub completed_daily_limit: u64,

    /// Fraction of the daily ceiling that trips the per-identity
    /// emergency stop
    #[serde(default = "ThrottleConfig::default_emergency_threshold")]
    pub emergency_threshold: f64,

    /// Total batches held across all priority queues
    #[serde(default = "ThrottleConfig::default_queue_capacity")]
    pub queue_capacity: usize,

    /// Base retry delay; attempt N waits N times this long
    #[serde(default = "ThrottleConfig::default_retry_backoff", with = "humantime_serde")]
    pub retry_backoff: Duration,
}

impl ThrottleConfig {
    fn default_burst_window() -> Duration {
        Duration::from_secs(60)
    }
    fn default_burst_limit() -> u64 {
        100
    }
    fn default_hourly_limit() -> u64 {
        1000
    }
    fn default_fallback_daily_limit() -> u64 {
        500
    }
    fn default_completed_daily_limit() -> u64 {
        100_000
    }
    fn default_emergency_threshold() -> f64 {
        0.95
    }
    fn default_queue_capacity() -> usize {
        1000
    }
    fn default_retry_backoff() -> Duration {
        Duration::from_secs(5 * 60)
    }
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            burst_window: Self::default_burst_window(),
            burst_limit: Self::default_burst_limit(),
            hourly_limit: Self::default_hourly_limit(),
            fallback_daily_limit: Self::default_fallback_daily_limit(),
            completed_daily_limit: Self::default_completed_daily_limit(),
            emergency_threshold: Self::default_emergency_threshold(),
            queue_capacity: Self::default_queue_capacity(),
            retry_backoff: Self::default_retry_backoff(),
        }
    }
}

/// System-wide operating mode. `Disabled` switches the limiter off
/// entirely: every admission check passes. It exists for controlled
/// load tests and is never entered automatically.
#[derive(
    Serialize, Deserialize, Debug, Copy, Clone, PartialEq, Eq, strum::Display, strum::EnumString,
)]
pub enum SystemState {
    Active,
    Paused,
    EmergencyStopped,
    Disabled,
}

/// Why an admission check said no. `is_capacity` distinguishes
/// transient limit denials, which requeue, from policy denials, which
/// drop the batch.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum Denial {
    #[error("system is paused: {0}")]
    SystemPaused(String),

    #[error("system emergency stop is engaged: {0}")]
    SystemStopped(String),

    #[error("emergency stop is engaged for {identity}: {reason}")]
    IdentityStopped { identity: IdentityKey, reason: String },

    #[error("daily limit exceeded: {sent_today} sent of {limit} with {requested} requested")]
    DailyLimitExceeded {
        sent_today: u64,
        limit: u64,
        requested: u64,
    },

    #[error("burst limit exceeded: {in_window} sent in the burst window of {limit}")]
    BurstLimitExceeded { in_window: u64, limit: u64 },

    #[error("hourly limit exceeded: {in_hour} sent this hour of {limit}")]
    HourlyLimitExceeded { in_hour: u64, limit: u64 },
}

impl Denial {
    /// Transient capacity denials requeue the batch; anything else is
    /// a policy decision and the batch is dropped with a warning.
    pub fn is_capacity(&self) -> bool {
        matches!(
            self,
            Self::SystemPaused(_)
                | Self::DailyLimitExceeded { .. }
                | Self::BurstLimitExceeded { .. }
                | Self::HourlyLimitExceeded { .. }
        )
    }

    fn metric_label(&self) -> &'static str {
        match self {
            Self::SystemPaused(_) => "paused",
            Self::SystemStopped(_) => "system_stopped",
            Self::IdentityStopped { .. } => "identity_stopped",
            Self::DailyLimitExceeded { .. } => "daily_limit",
            Self::BurstLimitExceeded { .. } => "burst_limit",
            Self::HourlyLimitExceeded { .. } => "hourly_limit",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ThrottleError {
    #[error("send queue is full ({capacity} batches)")]
    QueueFull { capacity: usize },
}

struct IdentityCounters {
    burst: CounterRing,
    hourly: CounterRing,
    daily: CounterRing,
}

impl IdentityCounters {
    fn new(config: &ThrottleConfig) -> Self {
        Self {
            // one-second resolution across the burst window
            burst: CounterRing::new(config.burst_window.as_secs().max(1) as usize, 1),
            // minute resolution across the hour
            hourly: CounterRing::new(60, 60),
            // hour resolution across the day
            daily: CounterRing::new(24, 3600),
        }
    }
}

pub struct AdmissionThrottle {
    config: ThrottleConfig,
    state: Mutex<SystemState>,
    warmup: Arc<dyn WarmupProvider>,
    stats: Arc<StatsTracker>,
    publisher: Arc<dyn NotificationPublisher>,
    counters: DashMap<IdentityKey, Mutex<IdentityCounters>>,
    identity_stops: DashMap<IdentityKey, String>,
    queues: Mutex<BatchQueues>,
}

impl AdmissionThrottle {
    pub fn new(
        config: ThrottleConfig,
        warmup: Arc<dyn WarmupProvider>,
        stats: Arc<StatsTracker>,
        publisher: Arc<dyn NotificationPublisher>,
    ) -> Self {
        let queues = Mutex::new(BatchQueues::new(config.queue_capacity));
        Self {
            config,
            state: Mutex::new(SystemState::Active),
            warmup,
            stats,
            publisher,
            counters: DashMap::new(),
            identity_stops: DashMap::new(),
            queues,
        }
    }

    pub fn config(&self) -> &ThrottleConfig {
        &self.config
    }

    pub fn state(&self) -> SystemState {
        *self.state.lock()
    }

    pub fn set_state(&self, state: SystemState) {
        *self.state.lock() = state;
    }

    pub fn pause(&self, reason: impl Into<String>) {
        let reason = reason.into();
        tracing::warn!("admission paused: {reason}");
        *self.state.lock() = SystemState::Paused;
    }

    pub fn resume(&self, reason: impl Into<String>) {
        let reason = reason.into();
        tracing::info!("admission resumed: {reason}");
        *self.state.lock() = SystemState::Active;
    }

    /// Engage the emergency stop: for one identity when given, for the
    /// whole system otherwise. Only an explicit administrative reset
    /// clears it.
    pub fn emergency_stop(&self, identity: Option<&IdentityKey>, reason: impl Into<String>) {
        let reason = reason.into();
        match identity {
            Some(identity) => {
                tracing::error!("emergency stop for {identity}: {reason}");
                self.identity_stops.insert(identity.clone(), reason.clone());
                self.publisher.publish(
                    Notification::new(
                        NotificationKind::EmergencyStop,
                        Severity::Critical,
                        format!("emergency stop engaged for {identity}: {reason}"),
                    )
                    .with_meta("identity", identity.to_string()),
                );
            }
            None => {
                tracing::error!("system emergency stop: {reason}");
                *self.state.lock() = SystemState::EmergencyStopped;
                self.publisher.publish(Notification::new(
                    NotificationKind::EmergencyStop,
                    Severity::Critical,
                    format!("system emergency stop engaged: {reason}"),
                ));
            }
        }
    }

    /// Administrative reset of a per-identity emergency stop.
    pub fn reset_emergency_stop(&self, identity: &IdentityKey) -> bool {
        let cleared = self.identity_stops.remove(identity).is_some();
        if cleared {
            tracing::info!("emergency stop cleared for {identity}");
        }
        cleared
    }

    pub fn stopped_identities(&self) -> Vec<(IdentityKey, String)> {
        self.identity_stops
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    /// Resolve the daily ceiling for an identity from the warm-up
    /// collaborator. A completed warm-up earns the high-capacity
    /// ceiling; anything other than an in-progress program with a
    /// positive limit falls back to the conservative default.
    fn daily_limit(&self, identity: &IdentityKey) -> u64 {
        match self.warmup.warmup_status(identity) {
            WarmupStatus::Completed => self.config.completed_daily_limit,
            WarmupStatus::InProgress => {
                let limit = self.warmup.current_daily_limit(identity);
                if limit > 0 {
                    limit
                } else {
                    self.config.fallback_daily_limit
                }
            }
            WarmupStatus::NotStarted | WarmupStatus::Paused | WarmupStatus::Failed => {
                self.config.fallback_daily_limit
            }
        }
    }

    /// Decide whether `count` sends through `identity` may proceed
    /// right now. Checks run in order: system state, daily ceiling,
    /// emergency-threshold trip, burst window, hourly bucket. Crossing
    /// the emergency fraction of the daily ceiling both denies and
    /// engages the per-identity emergency stop as a side effect.
    pub fn can_send_now(&self, identity: &IdentityKey, count: u64) -> Result<(), Denial> {
        let verdict = self.check_inner(identity, count);
        if let Err(denial) = &verdict {
            DENIALS_TOTAL.with_label_values(&[denial.metric_label()]).inc();
            tracing::debug!("admission denied for {identity}: {denial}");
        }
        verdict
    }

    fn check_inner(&self, identity: &IdentityKey, count: u64) -> Result<(), Denial> {
        match *self.state.lock() {
            SystemState::Disabled => return Ok(()),
            SystemState::Paused => {
                return Err(Denial::SystemPaused("administratively paused".to_string()));
            }
            SystemState::EmergencyStopped => {
                return Err(Denial::SystemStopped("system emergency stop".to_string()));
            }
            SystemState::Active => {}
        }

        if let Some(stop) = self.identity_stops.get(identity) {
            return Err(Denial::IdentityStopped {
                identity: identity.clone(),
                reason: stop.value().clone(),
            });
        }

        let limit = self.daily_limit(identity);
        let entry = self
            .counters
            .entry(identity.clone())
            .or_insert_with(|| Mutex::new(IdentityCounters::new(&self.config)));
        let mut counters = entry.lock();

        let sent_today = counters.daily.total();
        if sent_today + count > limit {
            return Err(Denial::DailyLimitExceeded {
                sent_today,
                limit,
                requested: count,
            });
        }
        if limit > 0 && (sent_today + count) as f64 / limit as f64 >= self.config.emergency_threshold
        {
            drop(counters);
            drop(entry);
            self.emergency_stop(
                Some(identity),
                format!(
                    "daily volume reached {:.0}% of the {limit} ceiling",
                    self.config.emergency_threshold * 100.0
                ),
            );
            return Err(Denial::IdentityStopped {
                identity: identity.clone(),
                reason: "emergency threshold crossed".to_string(),
            });
        }

        let in_window = counters.burst.total_over(self.config.burst_window);
        if in_window + count > self.config.burst_limit {
            return Err(Denial::BurstLimitExceeded {
                in_window,
                limit: self.config.burst_limit,
            });
        }

        let in_hour = counters.hourly.total();
        if in_hour + count > self.config.hourly_limit {
            return Err(Denial::HourlyLimitExceeded {
                in_hour,
                limit: self.config.hourly_limit,
            });
        }

        Ok(())
    }

    /// Add a batch to the send queue.
    pub fn enqueue(&self, batch: Batch) -> Result<(), ThrottleError> {
        let mut queues = self.queues.lock();
        queues.push(batch).map_err(|rejected| {
            tracing::warn!(
                "send queue full; rejecting batch {} for {}",
                rejected.id,
                rejected.identity
            );
            ThrottleError::QueueFull {
                capacity: self.config.queue_capacity,
            }
        })
    }

    /// Take the next admissible batch, honoring priority order and an
    /// optional identity filter. Batches denied for capacity reasons
    /// go back in the queue; batches denied by policy are dropped with
    /// a warning.
    pub fn dequeue_next(&self, filter: Option<&IdentityKey>) -> Option<Batch> {
        let mut queues = self.queues.lock();
        queues.pop_where(Utc::now(), filter, |batch| {
            match self.can_send_now(&batch.identity, batch.payload_items.len() as u64) {
                Ok(()) => Verdict::Admit,
                Err(denial) if denial.is_capacity() => Verdict::Requeue,
                Err(denial) => {
                    tracing::warn!(
                        "dropping batch {} for {}: {denial}",
                        batch.id,
                        batch.identity
                    );
                    BATCHES_DROPPED.with_label_values(&["policy"]).inc();
                    Verdict::Drop
                }
            }
        })
    }

    /// Record a completed send: advances the identity's rolling
    /// counters and the durable stats store.
    pub async fn record_success(&self, batch: &Batch, sent_count: u64) -> anyhow::Result<()> {
        {
            let entry = self
                .counters
                .entry(batch.identity.clone())
                .or_insert_with(|| Mutex::new(IdentityCounters::new(&self.config)));
            let mut counters = entry.lock();
            counters.burst.increment(sent_count);
            counters.hourly.increment(sent_count);
            counters.daily.increment(sent_count);
        }
        self.stats
            .record_sent_count(&batch.identity, sent_count)
            .await
    }

    /// Record a failed send attempt. The batch is requeued with a
    /// linear backoff until it runs out of attempts, then dropped for
    /// good.
    pub fn record_failure(&self, mut batch: Batch, error: &str) {
        batch.attempts += 1;
        if batch.attempts < batch.max_attempts {
            let backoff = self.config.retry_backoff * batch.attempts;
            batch.scheduled_for = Utc::now()
                + chrono::Duration::from_std(backoff)
                    .unwrap_or_else(|_| chrono::Duration::minutes(5));
            tracing::info!(
                "batch {} attempt {} failed ({error}); retrying at {}",
                batch.id,
                batch.attempts,
                batch.scheduled_for
            );
            self.queues.lock().requeue(batch);
        } else {
            tracing::error!(
                "batch {} for {} failed terminally after {} attempts: {error}",
                batch.id,
                batch.identity,
                batch.attempts
            );
            BATCHES_DROPPED.with_label_values(&["exhausted"]).inc();
            self.publisher.publish(
                Notification::new(
                    NotificationKind::SystemError,
                    Severity::High,
                    format!(
                        "batch {} for {} dropped after {} failed attempts",
                        batch.id, batch.identity, batch.attempts
                    ),
                )
                .with_meta("error", error),
            );
        }
    }

    /// Queue depths as (high, normal, low).
    pub fn queue_status(&self) -> (usize, usize, usize) {
        self.queues.lock().depths()
    }

    /// Mirror the in-memory queues into the durable store so queued
    /// batches survive a restart.
    pub async fn save_queues(&self) -> anyhow::Result<()> {
        let items: Vec<String> = self
            .queues
            .lock()
            .snapshot()
            .iter()
            .map(serde_json::to_string)
            .collect::<Result<_, _>>()?;
        self.stats.store().save_queue_snapshot(&items).await
    }

    /// Reload batches persisted by a previous run. Unparsable payloads
    /// and batches beyond the queue capacity are logged and skipped.
    pub async fn restore_queues(&self) -> anyhow::Result<usize> {
        let items = self.stats.store().load_queue_snapshot().await?;
        let mut restored = 0;
        let mut queues = self.queues.lock();
        for payload in items {
            match serde_json::from_str::<Batch>(&payload) {
                Ok(batch) => {
                    let id = batch.id;
                    if queues.push(batch).is_ok() {
                        restored += 1;
                    } else {
                        tracing::warn!("queue full while restoring batch {id}; dropping it");
                    }
                }
                Err(err) => {
                    tracing::warn!("skipping unparsable queued batch: {err:#}");
                }
            }
        }
        if restored > 0 {
            tracing::info!("restored {restored} queued batch(es) from the store");
        }
        Ok(restored)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use bounce_stats::{MemoryStore, StatsConfig};
    use egress_types::NullPublisher;

    struct FixedWarmup {
        limit: u64,
        status: WarmupStatus,
    }

    impl WarmupProvider for FixedWarmup {
        fn current_daily_limit(&self, _identity: &IdentityKey) -> u64 {
            self.limit
        }
        fn warmup_status(&self, _identity: &IdentityKey) -> WarmupStatus {
            self.status
        }
    }

    fn identity(n: u8) -> IdentityKey {
        IdentityKey::new(format!("192.0.2.{n}").parse().unwrap(), "acct")
    }

    fn throttle(config: ThrottleConfig, limit: u64, status: WarmupStatus) -> AdmissionThrottle {
        let stats = Arc::new(StatsTracker::new(
            Arc::new(MemoryStore::new()),
            StatsConfig::default(),
        ));
        AdmissionThrottle::new(
            config,
            Arc::new(FixedWarmup { limit, status }),
            stats,
            Arc::new(NullPublisher),
        )
    }

    fn batch_for(identity: IdentityKey, items: usize) -> Batch {
        Batch::new(
            identity,
            (0..items).map(|n| format!("msg-{n}")).collect(),
            BatchPriority::Normal,
            3,
        )
    }

    async fn send_through(throttle: &AdmissionThrottle, identity: &IdentityKey, count: u64) {
        let batch = batch_for(identity.clone(), count as usize);
        throttle.record_success(&batch, count).await.unwrap();
    }

    #[tokio::test]
    async fn daily_limit_boundary_is_inclusive() {
        let config = ThrottleConfig {
            // out of the way so the boundary itself is what trips
            emergency_threshold: 2.0,
            burst_limit: 10_000,
            hourly_limit: 10_000,
            ..ThrottleConfig::default()
        };
        let throttle = throttle(config, 100, WarmupStatus::InProgress);
        let id = identity(1);
        send_through(&throttle, &id, 99).await;

        let denial = throttle.can_send_now(&id, 2).unwrap_err();
        assert!(matches!(denial, Denial::DailyLimitExceeded { .. }));
        assert!(denial.to_string().contains("daily limit exceeded"));

        assert!(throttle.can_send_now(&id, 1).is_ok());
        assert!(throttle.can_send_now(&id, 0).is_ok());
    }

    #[tokio::test]
    async fn emergency_threshold_trips_identity_stop() {
        let config = ThrottleConfig {
            burst_limit: 10_000,
            hourly_limit: 10_000,
            ..ThrottleConfig::default()
        };
        let throttle = throttle(config, 100, WarmupStatus::InProgress);
        let id = identity(1);
        send_through(&throttle, &id, 90).await;

        // 96 of 100 crosses the 95% line: denied and latched
        let denial = throttle.can_send_now(&id, 6).unwrap_err();
        assert!(matches!(denial, Denial::IdentityStopped { .. }));
        assert!(!denial.is_capacity());

        // Even a tiny request stays denied until the latch is reset
        assert!(throttle.can_send_now(&id, 1).is_err());
        k9::assert_equal!(throttle.stopped_identities().len(), 1);

        assert!(throttle.reset_emergency_stop(&id));
        assert!(throttle.can_send_now(&id, 1).is_ok());
    }

    #[tokio::test]
    async fn warmup_status_selects_the_ceiling() {
        let config = ThrottleConfig {
            emergency_threshold: 2.0,
            fallback_daily_limit: 10,
            completed_daily_limit: 50_000,
            burst_limit: 100_000,
            hourly_limit: 100_000,
            ..ThrottleConfig::default()
        };

        // Failed warm-up falls back to the conservative default
        let defensive = throttle(config.clone(), 5000, WarmupStatus::Failed);
        assert!(defensive.can_send_now(&identity(1), 11).is_err());
        assert!(defensive.can_send_now(&identity(1), 10).is_ok());

        // Completed warm-up earns the high-capacity ceiling
        let graduated = throttle(config, 5000, WarmupStatus::Completed);
        assert!(graduated.can_send_now(&identity(1), 20_000).is_ok());
    }

    #[tokio::test]
    async fn burst_limit_recovers_as_the_window_slides() {
        tokio::time::pause();
        let config = ThrottleConfig {
            emergency_threshold: 2.0,
            burst_window: Duration::from_secs(10),
            burst_limit: 5,
            hourly_limit: 10_000,
            ..ThrottleConfig::default()
        };
        let throttle = throttle(config, 100_000, WarmupStatus::Completed);
        let id = identity(1);
        send_through(&throttle, &id, 5).await;

        let denial = throttle.can_send_now(&id, 1).unwrap_err();
        assert!(matches!(denial, Denial::BurstLimitExceeded { .. }));
        assert!(denial.is_capacity());

        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(throttle.can_send_now(&id, 1).is_ok());
    }

    #[tokio::test]
    async fn hourly_limit_applies_after_burst() {
        tokio::time::pause();
        let config = ThrottleConfig {
            emergency_threshold: 2.0,
            burst_window: Duration::from_secs(10),
            burst_limit: 1000,
            hourly_limit: 100,
            ..ThrottleConfig::default()
        };
        let throttle = throttle(config, 100_000, WarmupStatus::Completed);
        let id = identity(1);
        send_through(&throttle, &id, 100).await;

        // Let the burst window pass; the hour bucket still remembers
        tokio::time::advance(Duration::from_secs(30)).await;
        let denial = throttle.can_send_now(&id, 1).unwrap_err();
        assert!(matches!(denial, Denial::HourlyLimitExceeded { .. }));
    }

    #[tokio::test]
    async fn pause_denies_and_resume_restores() {
        let throttle = throttle(ThrottleConfig::default(), 0, WarmupStatus::Completed);
        let id = identity(1);
        assert!(throttle.can_send_now(&id, 1).is_ok());

        throttle.pause("maintenance window");
        let denial = throttle.can_send_now(&id, 1).unwrap_err();
        assert!(matches!(denial, Denial::SystemPaused(_)));
        assert!(denial.is_capacity());

        throttle.resume("maintenance done");
        assert!(throttle.can_send_now(&id, 1).is_ok());
    }

    #[tokio::test]
    async fn disabled_state_bypasses_every_limit() {
        let config = ThrottleConfig {
            burst_limit: 1,
            hourly_limit: 1,
            fallback_daily_limit: 1,
            ..ThrottleConfig::default()
        };
        let throttle = throttle(config, 0, WarmupStatus::NotStarted);
        throttle.set_state(SystemState::Disabled);
        assert!(throttle.can_send_now(&identity(1), 1_000_000).is_ok());
    }

    #[tokio::test]
    async fn capacity_denied_batches_stay_queued_policy_denied_drop() {
        let config = ThrottleConfig {
            emergency_threshold: 2.0,
            burst_limit: 10_000,
            hourly_limit: 10_000,
            ..ThrottleConfig::default()
        };
        let throttle = throttle(config, 100, WarmupStatus::InProgress);
        let capped = identity(1);
        let stopped = identity(2);
        send_through(&throttle, &capped, 100).await;
        throttle.emergency_stop(Some(&stopped), "test stop");

        let over_limit = batch_for(capped.clone(), 1);
        let policy_denied = batch_for(stopped.clone(), 1);
        throttle.enqueue(over_limit.clone()).unwrap();
        throttle.enqueue(policy_denied.clone()).unwrap();

        // Nothing admissible: the capped batch survives, the stopped
        // identity's batch is dropped
        assert!(throttle.dequeue_next(None).is_none());
        let (_, normal, _) = throttle.queue_status();
        k9::assert_equal!(normal, 1);
    }

    #[tokio::test]
    async fn retry_backoff_then_terminal_drop() {
        let throttle = throttle(ThrottleConfig::default(), 0, WarmupStatus::Completed);
        let mut batch = batch_for(identity(1), 1);
        batch.max_attempts = 2;
        let id = batch.id;

        throttle.record_failure(batch, "smtp timeout");
        // Requeued, but scheduled in the future so not yet dequeuable
        let (_, normal, _) = throttle.queue_status();
        k9::assert_equal!(normal, 1);
        assert!(throttle.dequeue_next(None).is_none());

        let retried = {
            let mut queues = throttle.queues.lock();
            queues
                .pop_where(Utc::now() + chrono::Duration::hours(1), None, |_| {
                    Verdict::Admit
                })
                .unwrap()
        };
        k9::assert_equal!(retried.id, id);
        k9::assert_equal!(retried.attempts, 1);
        assert!(retried.scheduled_for > retried.created_at);

        // Second failure exhausts the attempts; the batch is gone
        throttle.record_failure(retried, "smtp timeout");
        let (high, normal, low) = throttle.queue_status();
        k9::assert_equal!((high, normal, low), (0, 0, 0));
    }

    #[tokio::test]
    async fn queued_batches_survive_a_restart() {
        let store = Arc::new(MemoryStore::new());
        let make = |store: Arc<MemoryStore>| {
            AdmissionThrottle::new(
                ThrottleConfig::default(),
                Arc::new(FixedWarmup {
                    limit: 0,
                    status: WarmupStatus::Completed,
                }),
                Arc::new(StatsTracker::new(store, StatsConfig::default())),
                Arc::new(NullPublisher),
            )
        };

        let first = make(store.clone());
        let mut urgent = batch_for(identity(1), 1);
        urgent.priority = BatchPriority::High;
        first.enqueue(urgent.clone()).unwrap();
        first.enqueue(batch_for(identity(2), 1)).unwrap();
        first.save_queues().await.unwrap();

        let second = make(store);
        k9::assert_equal!(second.restore_queues().await.unwrap(), 2);
        let popped = second.dequeue_next(None).unwrap();
        k9::assert_equal!(popped.id, urgent.id);
        let (_, normal, _) = second.queue_status();
        k9::assert_equal!(normal, 1);
    }

    #[tokio::test]
    async fn queue_capacity_rejection() {
        let config = ThrottleConfig {
            queue_capacity: 1,
            ..ThrottleConfig::default()
        };
        let throttle = throttle(config, 0, WarmupStatus::Completed);
        throttle.enqueue(batch_for(identity(1), 1)).unwrap();
        let err = throttle.enqueue(batch_for(identity(2), 1)).unwrap_err();
        assert!(matches!(err, ThrottleError::QueueFull { capacity: 1 }));
    }
}
