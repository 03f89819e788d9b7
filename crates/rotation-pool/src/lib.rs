//! The rotation pool owns the fleet of sending identities: their
//! priority, availability, cooldown timers and performance scores.
//! It selects the best alternative when an identity degrades and
//! executes the failover, cooling down the source and circuit-breaking
//! identities that fail repeatedly.
use bounce_stats::StatsTracker;
use chrono::{DateTime, Utc};
use egress_types::{
    AvailabilityState, IdentityKey, Notification, NotificationKind, NotificationPublisher,
    RotationEvent, RotationReason, Severity, ThresholdBreach,
};
use parking_lot::Mutex;
use prometheus::IntCounterVec;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, LazyLock};
use std::time::Duration;
use uuid::Uuid;

static ROTATIONS_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    prometheus::register_int_counter_vec!(
        "identity_rotations_total",
        "Number of rotation attempts, by reason and outcome",
        &["reason", "outcome"]
    )
    .unwrap()
});

#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct PoolConfig {
    /// How long a rotated-away-from identity stays in cooldown
    #[serde(default = "PoolConfig::default_cooldown", with = "humantime_serde")]
    pub cooldown: Duration,

    /// Global ceiling on rotations in any trailing hour
    #[serde(default = "PoolConfig::default_max_rotations_per_hour")]
    pub max_rotations_per_hour: u64,

    /// Pause between validating a rotation and committing it, to let
    /// provider-side routing propagate
    #[serde(default = "PoolConfig::default_rotation_delay", with = "humantime_serde")]
    pub rotation_delay: Duration,

    /// Weight of performance score vs priority when ranking
    /// alternatives
    #[serde(default = "PoolConfig::default_score_weight")]
    pub score_weight: f64,

    /// Consecutive failed failover attempts before an identity is
    /// permanently disabled
    #[serde(default = "PoolConfig::default_max_consecutive_failures")]
    pub max_consecutive_failures: u32,

    /// Alternatives scoring below this are never selected
    #[serde(default = "PoolConfig::default_min_alternative_score")]
    pub min_alternative_score: f64,

    /// An identity used within this span takes a recency penalty
    #[serde(default = "PoolConfig::default_recency_window", with = "humantime_serde")]
    pub recency_window: Duration,
}

impl PoolConfig {
    fn default_cooldown() -> Duration {
        Duration::from_secs(2 * 3600)
    }
    fn default_max_rotations_per_hour() -> u64 {
        6
    }
    fn default_rotation_delay() -> Duration {
        Duration::from_secs(2)
    }
    fn default_score_weight() -> f64 {
        0.7
    }
    fn default_max_consecutive_failures() -> u32 {
        3
    }
    fn default_min_alternative_score() -> f64 {
        0.3
    }
    fn default_recency_window() -> Duration {
        Duration::from_secs(3600)
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            cooldown: Self::default_cooldown(),
            max_rotations_per_hour: Self::default_max_rotations_per_hour(),
            rotation_delay: Self::default_rotation_delay(),
            score_weight: Self::default_score_weight(),
            max_consecutive_failures: Self::default_max_consecutive_failures(),
            min_alternative_score: Self::default_min_alternative_score(),
            recency_window: Self::default_recency_window(),
        }
    }
}

/// State tracked for one identity in the pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolEntry {
    pub identity: IdentityKey,
    /// Caller-assigned weight; higher is preferred
    pub priority: u32,
    pub state: AvailabilityState,
    pub cooldown_until: Option<DateTime<Utc>>,
    pub total_sent: u64,
    pub total_bounced: u64,
    /// Derived; see [score_identity]
    pub performance_score: f64,
    pub last_used: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    pub tags: Vec<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    /// Insertion order; breaks ranking ties
    seq: u64,
}

impl PoolEntry {
    /// Whether the identity may be selected right now. A passed
    /// cooldown deadline makes the identity available even before the
    /// state field is updated.
    pub fn is_available(&self, now: DateTime<Utc>) -> bool {
        match self.state {
            AvailabilityState::Active => true,
            AvailabilityState::Cooldown => self
                .cooldown_until
                .map(|until| now >= until)
                .unwrap_or(true),
            AvailabilityState::Disabled | AvailabilityState::Maintenance => false,
        }
    }

    /// Promote Cooldown back to Active once the deadline has passed.
    fn refresh(&mut self, now: DateTime<Utc>) {
        if self.state == AvailabilityState::Cooldown
            && self.cooldown_until.map(|until| now >= until).unwrap_or(true)
        {
            self.state = AvailabilityState::Active;
            self.cooldown_until = None;
        }
    }
}

/// Compute the performance score for an identity.
/// `clamp01(1 - bounce_rate) + priority_boost - recency_penalty`,
/// where the boost is `min(0.2, priority * 0.05)` and the penalty is
/// `0.1` if the identity was used within the recency window. The
/// result is clamped to `[0, 1]`; an identity that has never been
/// used scores a full `1.0`.
pub fn score_identity(
    bounce_rate: f64,
    total_sent: u64,
    priority: u32,
    last_used: Option<DateTime<Utc>>,
    recency_window: Duration,
    now: DateTime<Utc>,
) -> f64 {
    if total_sent == 0 && last_used.is_none() {
        return 1.0;
    }
    let base = (1.0 - bounce_rate).clamp(0.0, 1.0);
    let boost = (priority as f64 * 0.05).min(0.2);
    let recency_window =
        chrono::Duration::from_std(recency_window).unwrap_or_else(|_| chrono::Duration::hours(1));
    let penalty = match last_used {
        Some(used) if now - used < recency_window => 0.1,
        _ => 0.0,
    };
    (base + boost - penalty).clamp(0.0, 1.0)
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum RotationError {
    #[error("identity {0} is not registered in the pool")]
    UnknownIdentity(IdentityKey),

    #[error("a rotation is already in flight for {0}")]
    AlreadyRotating(IdentityKey),

    #[error("source identity {0} is disabled; reset it administratively first")]
    SourceDisabled(IdentityKey),

    #[error("target identity {0} is cooling down until {1}")]
    CooldownViolation(IdentityKey, DateTime<Utc>),

    #[error("target identity {0} is not available ({1})")]
    TargetUnavailable(IdentityKey, AvailabilityState),

    #[error("rotation rate limit reached: {0} rotations in the trailing hour")]
    RateLimitExceeded(u64),

    #[error("no eligible alternative identity")]
    NoAlternative,

    #[error("rotation cancelled by shutdown")]
    Cancelled,
}

/// Removes the in-flight marker when a rotation attempt finishes,
/// however it finishes.
struct InFlightGuard<'a> {
    pool: &'a RotationPool,
    identity: IdentityKey,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.pool.in_flight.lock().remove(&self.identity);
    }
}

/// A slot reserved against the trailing-hour rotation ceiling. The
/// reservation is made when the ceiling is checked so that rotations
/// sleeping through the propagation delay still count against it;
/// dropping an uncommitted guard gives the slot back.
struct RateSlotGuard<'a> {
    pool: &'a RotationPool,
    slot: DateTime<Utc>,
    committed: bool,
}

impl RateSlotGuard<'_> {
    fn commit(mut self) {
        self.committed = true;
    }
}

impl Drop for RateSlotGuard<'_> {
    fn drop(&mut self) {
        if !self.committed {
            let mut recent = self.pool.recent_rotations.lock();
            if let Some(pos) = recent.iter().position(|ts| *ts == self.slot) {
                recent.swap_remove(pos);
            }
        }
    }
}

pub struct RotationPool {
    config: PoolConfig,
    stats: Arc<StatsTracker>,
    publisher: Arc<dyn NotificationPublisher>,
    entries: Mutex<HashMap<IdentityKey, PoolEntry>>,
    in_flight: Mutex<HashSet<IdentityKey>>,
    history: Mutex<Vec<RotationEvent>>,
    recent_rotations: Mutex<Vec<DateTime<Utc>>>,
    next_seq: AtomicU64,
}

impl RotationPool {
    pub fn new(
        config: PoolConfig,
        stats: Arc<StatsTracker>,
        publisher: Arc<dyn NotificationPublisher>,
    ) -> Self {
        Self {
            config,
            stats,
            publisher,
            entries: Mutex::new(HashMap::new()),
            in_flight: Mutex::new(HashSet::new()),
            history: Mutex::new(vec![]),
            recent_rotations: Mutex::new(vec![]),
            next_seq: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Register an identity. Registering an existing identity updates
    /// its priority and tags without touching its counters or state.
    pub fn add(&self, identity: IdentityKey, priority: u32, tags: Vec<String>) {
        let mut entries = self.entries.lock();
        entries
            .entry(identity.clone())
            .and_modify(|entry| {
                entry.priority = priority;
                entry.tags = tags.clone();
            })
            .or_insert_with(|| PoolEntry {
                identity,
                priority,
                state: AvailabilityState::Active,
                cooldown_until: None,
                total_sent: 0,
                total_bounced: 0,
                performance_score: 1.0,
                last_used: None,
                consecutive_failures: 0,
                tags,
                metadata: HashMap::new(),
                seq: self.next_seq.fetch_add(1, Ordering::SeqCst),
            });
    }

    /// Remove an identity. Identities only ever leave the pool through
    /// this explicit administrative action.
    pub fn remove(&self, identity: &IdentityKey) -> bool {
        self.entries.lock().remove(identity).is_some()
    }

    pub fn get(&self, identity: &IdentityKey) -> Option<PoolEntry> {
        self.entries.lock().get(identity).cloned()
    }

    /// Snapshot of every entry, in insertion order.
    pub fn status(&self) -> Vec<PoolEntry> {
        let mut entries: Vec<PoolEntry> = self.entries.lock().values().cloned().collect();
        entries.sort_by_key(|entry| entry.seq);
        entries
    }

    /// Place an identity into Maintenance, or bring it back.
    pub fn set_maintenance(&self, identity: &IdentityKey, on: bool) -> Result<(), RotationError> {
        let mut entries = self.entries.lock();
        let entry = entries
            .get_mut(identity)
            .ok_or_else(|| RotationError::UnknownIdentity(identity.clone()))?;
        entry.state = if on {
            AvailabilityState::Maintenance
        } else {
            AvailabilityState::Active
        };
        Ok(())
    }

    /// Administrative reset of a circuit-broken identity. This is the
    /// only way a Disabled identity returns to service.
    pub fn reset_circuit_breaker(&self, identity: &IdentityKey) -> Result<(), RotationError> {
        let mut entries = self.entries.lock();
        let entry = entries
            .get_mut(identity)
            .ok_or_else(|| RotationError::UnknownIdentity(identity.clone()))?;
        entry.state = AvailabilityState::Active;
        entry.cooldown_until = None;
        entry.consecutive_failures = 0;
        tracing::info!("circuit breaker reset for {identity}");
        Ok(())
    }

    /// Pull fresh counters from the stats tracker into every entry and
    /// recompute its performance score.
    pub async fn update_performance_metrics(&self) -> anyhow::Result<()> {
        let identities: Vec<IdentityKey> = self.entries.lock().keys().cloned().collect();
        let now = Utc::now();

        for identity in identities {
            let window = self.stats.get_stats(&identity).await?;
            let mut entries = self.entries.lock();
            if let Some(entry) = entries.get_mut(&identity) {
                entry.total_sent = window.total_sent;
                entry.total_bounced = window.total_bounced;
                entry.performance_score = score_identity(
                    window.bounce_rate,
                    window.total_sent,
                    entry.priority,
                    entry.last_used,
                    self.config.recency_window,
                    now,
                );
                entry.refresh(now);
            }
        }
        Ok(())
    }

    /// Available identities other than `exclude`, scoring at least
    /// `min_score`, ranked best first. Ranking combines performance
    /// score and normalized priority; ties fall back to insertion
    /// order.
    pub fn get_available_alternatives(
        &self,
        exclude: &IdentityKey,
        min_score: f64,
    ) -> Vec<PoolEntry> {
        let now = Utc::now();
        let mut entries = self.entries.lock();

        let mut candidates: Vec<PoolEntry> = entries
            .values_mut()
            .map(|entry| {
                entry.refresh(now);
                entry.clone()
            })
            .filter(|entry| {
                entry.identity != *exclude
                    && entry.is_available(now)
                    && entry.performance_score >= min_score
            })
            .collect();
        drop(entries);

        let max_priority = candidates
            .iter()
            .map(|entry| entry.priority)
            .max()
            .unwrap_or(0);
        let weight = self.config.score_weight;

        let combined = |entry: &PoolEntry| {
            let normalized_priority = if max_priority > 0 {
                entry.priority as f64 / max_priority as f64
            } else {
                0.0
            };
            weight * entry.performance_score + (1.0 - weight) * normalized_priority
        };

        candidates.sort_by(|a, b| {
            combined(b)
                .partial_cmp(&combined(a))
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.seq.cmp(&b.seq))
        });
        candidates
    }

    pub fn select_best_alternative(&self, current: &IdentityKey) -> Option<IdentityKey> {
        self.get_available_alternatives(current, self.config.min_alternative_score)
            .into_iter()
            .next()
            .map(|entry| entry.identity)
    }

    /// Switch traffic from one identity to another. On success the
    /// target becomes the active identity and the source cools down;
    /// any validation failure surfaces a distinguishable error and
    /// leaves the pool untouched.
    pub async fn execute_rotation(
        &self,
        from: &IdentityKey,
        to: &IdentityKey,
        reason: RotationReason,
    ) -> Result<RotationEvent, RotationError> {
        self.rotate_inner(from, to, reason, None).await
    }

    async fn rotate_inner(
        &self,
        from: &IdentityKey,
        to: &IdentityKey,
        reason: RotationReason,
        breach: Option<ThresholdBreach>,
    ) -> Result<RotationEvent, RotationError> {
        {
            let mut in_flight = self.in_flight.lock();
            if !in_flight.insert(from.clone()) {
                ROTATIONS_TOTAL
                    .with_label_values(&[&reason.to_string(), "already_rotating"])
                    .inc();
                return Err(RotationError::AlreadyRotating(from.clone()));
            }
        }
        let _guard = InFlightGuard {
            pool: self,
            identity: from.clone(),
        };

        self.validate_rotation(from, to)?;

        let slot = Utc::now();
        {
            let mut recent = self.recent_rotations.lock();
            let hour_ago = slot - chrono::Duration::hours(1);
            recent.retain(|ts| *ts > hour_ago);
            if recent.len() as u64 >= self.config.max_rotations_per_hour {
                ROTATIONS_TOTAL
                    .with_label_values(&[&reason.to_string(), "rate_limited"])
                    .inc();
                return Err(RotationError::RateLimitExceeded(recent.len() as u64));
            }
            recent.push(slot);
        }
        let rate_slot = RateSlotGuard {
            pool: self,
            slot,
            committed: false,
        };

        // Let provider-side routing propagate before we commit. A
        // shutdown arriving mid-delay cancels the rotation as a unit.
        if !self.config.rotation_delay.is_zero()
            && warden_lifecycle::sleep_unless_shutdown(self.config.rotation_delay).await
        {
            ROTATIONS_TOTAL
                .with_label_values(&[&reason.to_string(), "cancelled"])
                .inc();
            return Err(RotationError::Cancelled);
        }

        // State may have moved while we were waiting
        self.validate_rotation(from, to)?;

        let now = Utc::now();
        let event = RotationEvent {
            id: Uuid::new_v4(),
            from_identity: from.clone(),
            to_identity: Some(to.clone()),
            reason,
            timestamp: now,
            success: true,
            error_message: None,
            breach,
        };

        {
            // Cooldown assignment and history append commit together
            let mut entries = self.entries.lock();
            if let Some(entry) = entries.get_mut(to) {
                entry.last_used = Some(now);
            }
            if let Some(entry) = entries.get_mut(from) {
                entry.state = AvailabilityState::Cooldown;
                entry.cooldown_until = Some(
                    now + chrono::Duration::from_std(self.config.cooldown)
                        .unwrap_or_else(|_| chrono::Duration::hours(2)),
                );
            }
            self.history.lock().push(event.clone());
        }
        rate_slot.commit();

        ROTATIONS_TOTAL
            .with_label_values(&[&reason.to_string(), "success"])
            .inc();
        tracing::info!("rotated {from} -> {to} ({reason})");
        self.publisher.publish(
            Notification::new(
                NotificationKind::Rotation,
                Severity::Medium,
                format!("rotated sending identity {from} -> {to}"),
            )
            .with_meta("reason", reason.to_string()),
        );

        Ok(event)
    }

    fn validate_rotation(&self, from: &IdentityKey, to: &IdentityKey) -> Result<(), RotationError> {
        let now = Utc::now();
        let mut entries = self.entries.lock();

        let source = entries
            .get(from)
            .ok_or_else(|| RotationError::UnknownIdentity(from.clone()))?;
        if source.state == AvailabilityState::Disabled {
            return Err(RotationError::SourceDisabled(from.clone()));
        }

        let target = entries
            .get_mut(to)
            .ok_or_else(|| RotationError::UnknownIdentity(to.clone()))?;
        target.refresh(now);
        match target.state {
            AvailabilityState::Active => Ok(()),
            AvailabilityState::Cooldown => {
                let until = target.cooldown_until.unwrap_or(now);
                Err(RotationError::CooldownViolation(to.clone(), until))
            }
            state => Err(RotationError::TargetUnavailable(to.clone(), state)),
        }
    }

    /// React to a threshold breach: rotate away from the breaching
    /// identity, or circuit-break it after repeated failures. Finding
    /// no alternative counts as a failure but never raises.
    pub async fn handle_threshold_breach(
        &self,
        breach: &ThresholdBreach,
    ) -> Option<RotationEvent> {
        let identity = &breach.identity;

        if self.in_flight.lock().contains(identity) {
            tracing::debug!("rotation already in flight for {identity}; skipping breach");
            return None;
        }

        {
            let mut entries = self.entries.lock();
            let entry = match entries.get_mut(identity) {
                Some(entry) => entry,
                None => {
                    tracing::warn!("breach for unregistered identity {identity}");
                    return None;
                }
            };
            if entry.state == AvailabilityState::Disabled {
                return None;
            }
            if entry.consecutive_failures >= self.config.max_consecutive_failures {
                entry.state = AvailabilityState::Disabled;
                entry.cooldown_until = None;
                tracing::error!(
                    "disabling {identity} after {} consecutive failed failovers",
                    entry.consecutive_failures
                );
                drop(entries);
                self.publisher.publish(
                    Notification::new(
                        NotificationKind::IdentityDisabled,
                        Severity::Critical,
                        format!("sending identity {identity} disabled by circuit breaker"),
                    )
                    .with_meta("rule", breach.rule_name.clone()),
                );
                return None;
            }
        }

        let target = match self.select_best_alternative(identity) {
            Some(target) => target,
            None => {
                self.note_failed_rotation(identity, breach, "no eligible alternative");
                return None;
            }
        };

        match self
            .rotate_inner(
                identity,
                &target,
                RotationReason::ThresholdBreach,
                Some(breach.clone()),
            )
            .await
        {
            Ok(event) => {
                if let Some(entry) = self.entries.lock().get_mut(identity) {
                    entry.consecutive_failures = 0;
                }
                Some(event)
            }
            Err(err) => {
                tracing::warn!("failover for {identity} failed: {err}");
                self.note_failed_rotation(identity, breach, &err.to_string());
                None
            }
        }
    }

    fn note_failed_rotation(&self, identity: &IdentityKey, breach: &ThresholdBreach, error: &str) {
        if let Some(entry) = self.entries.lock().get_mut(identity) {
            entry.consecutive_failures += 1;
        }
        ROTATIONS_TOTAL
            .with_label_values(&[&RotationReason::ThresholdBreach.to_string(), "failed"])
            .inc();
        self.history.lock().push(RotationEvent {
            id: Uuid::new_v4(),
            from_identity: identity.clone(),
            to_identity: None,
            reason: RotationReason::ThresholdBreach,
            timestamp: Utc::now(),
            success: false,
            error_message: Some(error.to_string()),
            breach: Some(breach.clone()),
        });
    }

    /// Full rotation history, oldest first.
    pub fn rotation_history(&self) -> Vec<RotationEvent> {
        self.history.lock().clone()
    }

    pub fn rotations_since(&self, since: DateTime<Utc>) -> Vec<RotationEvent> {
        self.history
            .lock()
            .iter()
            .filter(|event| event.timestamp >= since)
            .cloned()
            .collect()
    }
}
