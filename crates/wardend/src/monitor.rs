use admission_throttle::AdmissionThrottle;
use bounce_stats::store::BounceStore;
use bounce_stats::{EventRecord, StatsTracker};
use chrono::Utc;
use egress_types::Severity;
use prometheus::IntCounter;
use rotation_pool::RotationPool;
use std::sync::{Arc, LazyLock};
use std::time::Duration;
use threshold_rules::ThresholdEngine;
use warden_lifecycle::Activity;

static MONITOR_PASSES: LazyLock<IntCounter> = LazyLock::new(|| {
    prometheus::register_int_counter!(
        "warden_monitor_passes_total",
        "Number of completed monitoring passes"
    )
    .unwrap()
});

/// The periodic feedback loop: pull fresh stats for every identity,
/// ask the threshold engine for breaches, and hand each breach to the
/// rotation pool (rotate) and, for critical breaches, the admission
/// throttle (shed). Breaches and rotations are appended to the durable
/// event log as they happen.
pub struct Monitor {
    pub stats: Arc<StatsTracker>,
    pub engine: Arc<ThresholdEngine>,
    pub pool: Arc<RotationPool>,
    pub throttle: Arc<AdmissionThrottle>,
    pub interval: Duration,
    pub purge_age: Duration,
}

impl Monitor {
    pub async fn run(self: Arc<Self>) {
        tracing::info!(
            "monitoring loop started, interval {}",
            humantime::format_duration(self.interval)
        );
        loop {
            if warden_lifecycle::sleep_unless_shutdown(self.interval).await {
                tracing::info!("monitoring loop stopping");
                return;
            }
            // Hold an activity across the pass so shutdown waits for a
            // rotation we may have started
            let Ok(_activity) = Activity::get() else {
                return;
            };
            if let Err(err) = self.tick().await {
                tracing::error!("monitoring pass failed: {err:#}");
            }
        }
    }

    /// One monitoring pass. Public so the control surface can force an
    /// immediate evaluation.
    pub async fn tick(&self) -> anyhow::Result<()> {
        self.pool.update_performance_metrics().await?;

        let windows = self.stats.get_all_stats().await?;
        let breaches = self.engine.check_all(&windows);
        if !breaches.is_empty() {
            tracing::warn!("{} threshold breach(es) this pass", breaches.len());
        }

        for breach in breaches {
            self.stats
                .store()
                .append_event(&EventRecord::Breach(breach.clone()))
                .await?;

            // A critical breach sheds load immediately; rotation alone
            // would keep admitting sends until the next pass
            if breach.severity == Severity::Critical {
                self.throttle.emergency_stop(
                    Some(&breach.identity),
                    format!("critical breach of rule {}", breach.rule_name),
                );
            }

            if let Some(rotation) = self.pool.handle_threshold_breach(&breach).await {
                self.stats
                    .store()
                    .append_event(&EventRecord::Rotation(rotation))
                    .await?;
            }
        }

        let (high, normal, low) = self.throttle.queue_status();
        if high + normal + low > 0 {
            tracing::debug!("send queue depth: high={high} normal={normal} low={low}");
        }

        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.purge_age)
                .unwrap_or_else(|_| chrono::Duration::days(7));
        let purged = self.stats.store().purge_older_than(cutoff).await?;
        if purged > 0 {
            tracing::debug!("purged {purged} expired rows");
        }

        MONITOR_PASSES.inc();
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::ConfigWarmupProvider;
    use admission_throttle::ThrottleConfig;
    use bounce_stats::{MemoryStore, StatsConfig};
    use egress_types::{BounceEvent, BounceType, IdentityKey, NullPublisher};
    use rotation_pool::PoolConfig;
    use threshold_rules::ThresholdRule;

    fn throttle_for(stats: Arc<StatsTracker>) -> Arc<AdmissionThrottle> {
        Arc::new(AdmissionThrottle::new(
            ThrottleConfig::default(),
            Arc::new(ConfigWarmupProvider),
            stats,
            Arc::new(NullPublisher),
        ))
    }

    fn identity(n: u8) -> IdentityKey {
        IdentityKey::new(format!("198.51.100.{n}").parse().unwrap(), "main")
    }

    fn rule(value: f64) -> ThresholdRule {
        toml::from_str(&format!(
            r#"
            name = "bounce-rate"
            severity = "High"
            value = {value}
            "#
        ))
        .unwrap()
    }

    async fn seed(stats: &StatsTracker, id: &IdentityKey, sent: u64, bounced: u64) {
        stats.record_sent_count(id, sent).await.unwrap();
        for _ in 0..bounced {
            stats
                .record_bounce(&BounceEvent {
                    recipient: "user@example.com".to_string(),
                    identity: id.clone(),
                    bounce_type: BounceType::Hard,
                    reason: "550 5.1.1".to_string(),
                    timestamp: Utc::now(),
                })
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn tick_rotates_breaching_identity_and_logs_events() {
        let store = Arc::new(MemoryStore::new());
        let stats = Arc::new(StatsTracker::new(store.clone(), StatsConfig::default()));
        let engine = Arc::new(ThresholdEngine::new(vec![rule(0.05)]));
        let pool = Arc::new(RotationPool::new(
            PoolConfig {
                rotation_delay: Duration::ZERO,
                ..PoolConfig::default()
            },
            stats.clone(),
            Arc::new(NullPublisher),
        ));

        let sick = identity(1);
        let healthy = identity(2);
        pool.add(sick.clone(), 1, vec![]);
        pool.add(healthy.clone(), 1, vec![]);
        seed(&stats, &sick, 1000, 100).await;
        seed(&stats, &healthy, 1000, 5).await;

        let monitor = Monitor {
            stats: stats.clone(),
            engine,
            pool: pool.clone(),
            throttle: throttle_for(stats.clone()),
            interval: Duration::from_secs(60),
            purge_age: Duration::from_secs(7 * 24 * 3600),
        };
        monitor.tick().await.unwrap();

        // The sick identity rotated away and is cooling down
        let entry = pool.get(&sick).unwrap();
        k9::assert_equal!(entry.state, egress_types::AvailabilityState::Cooldown);
        k9::assert_equal!(pool.rotation_history().len(), 1);

        // Both the breach and the rotation reached the event log
        let events = store
            .query_events(Some(&sick), Utc::now() - chrono::Duration::hours(1), Utc::now())
            .await
            .unwrap();
        let kinds: Vec<&str> = events.iter().map(|event| event.kind()).collect();
        assert!(kinds.contains(&"Breach"));
        assert!(kinds.contains(&"Rotation"));
    }

    #[tokio::test]
    async fn healthy_fleet_produces_no_rotations() {
        let stats = Arc::new(StatsTracker::new(
            Arc::new(MemoryStore::new()),
            StatsConfig::default(),
        ));
        let engine = Arc::new(ThresholdEngine::new(vec![rule(0.05)]));
        let pool = Arc::new(RotationPool::new(
            PoolConfig::default(),
            stats.clone(),
            Arc::new(NullPublisher),
        ));
        let id = identity(1);
        pool.add(id.clone(), 1, vec![]);
        seed(&stats, &id, 1000, 5).await;

        let monitor = Monitor {
            stats: stats.clone(),
            engine,
            pool: pool.clone(),
            throttle: throttle_for(stats),
            interval: Duration::from_secs(60),
            purge_age: Duration::from_secs(7 * 24 * 3600),
        };
        // Other tests tick concurrently against the same registry, so
        // only assert that our pass moved the counter forward
        let passes_before = MONITOR_PASSES.get();
        monitor.tick().await.unwrap();
        assert!(MONITOR_PASSES.get() > passes_before);

        assert!(pool.rotation_history().is_empty());
        k9::assert_equal!(
            pool.get(&id).unwrap().state,
            egress_types::AvailabilityState::Active
        );
    }

    #[tokio::test]
    async fn critical_breach_sheds_via_emergency_stop() {
        let stats = Arc::new(StatsTracker::new(
            Arc::new(MemoryStore::new()),
            StatsConfig::default(),
        ));
        let critical_rule: ThresholdRule = toml::from_str(
            r#"
            name = "catastrophic-bounce-rate"
            severity = "Critical"
            value = 0.15
            "#,
        )
        .unwrap();
        let engine = Arc::new(ThresholdEngine::new(vec![critical_rule]));
        let pool = Arc::new(RotationPool::new(
            PoolConfig {
                rotation_delay: Duration::ZERO,
                ..PoolConfig::default()
            },
            stats.clone(),
            Arc::new(NullPublisher),
        ));
        let throttle = throttle_for(stats.clone());

        let sick = identity(1);
        pool.add(sick.clone(), 1, vec![]);
        seed(&stats, &sick, 1000, 200).await;

        let monitor = Monitor {
            stats,
            engine,
            pool,
            throttle: throttle.clone(),
            interval: Duration::from_secs(60),
            purge_age: Duration::from_secs(7 * 24 * 3600),
        };
        monitor.tick().await.unwrap();

        k9::assert_equal!(throttle.stopped_identities().len(), 1);
        assert!(throttle.can_send_now(&sick, 1).is_err());
    }
}
