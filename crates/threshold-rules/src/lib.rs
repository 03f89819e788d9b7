//! Threshold rule evaluation for identity bounce rates.
//!
//! A set of independent rules is evaluated against each identity's
//! current stat window; every rule that is crossed produces a
//! `ThresholdBreach`. Breach records always land in the append-only
//! history; registered observers are additionally notified unless the
//! same (identity, rule) pairing already fired within the rule's
//! notify cooldown.
use arc_swap::ArcSwap;
use bounce_stats::StatWindow;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use egress_types::{IdentityKey, Severity, ThresholdBreach};
use parking_lot::Mutex;
use prometheus::IntCounterVec;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, LazyLock};
use std::time::Duration;

static BREACHES_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    prometheus::register_int_counter_vec!(
        "threshold_breaches_total",
        "Number of threshold breaches recorded, by severity",
        &["severity"]
    )
    .unwrap()
});

/// Baseline used by `RuleKind::Relative`. This rule kind is an
/// extension point: a full implementation would learn the baseline
/// from each identity's history, but for now the comparison point is
/// this fixed industry-typical bounce rate. Evaluation is otherwise
/// identical to an Absolute rule with `value` interpreted as a
/// multiple of the baseline.
pub const RELATIVE_BASELINE: f64 = 0.02;

/// One bucket of a volume-scaled rule. Lower bound is inclusive,
/// upper bound exclusive; omit `max_volume` for the unbounded top
/// bucket.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct VolumeRange {
    pub min_volume: u64,
    #[serde(default)]
    pub max_volume: Option<u64>,
    pub threshold: f64,
}

impl VolumeRange {
    pub fn contains(&self, total_sent: u64) -> bool {
        total_sent >= self.min_volume
            && self.max_volume.map(|max| total_sent < max).unwrap_or(true)
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RuleKind {
    /// Breach when the bounce rate reaches the fixed `value`
    #[default]
    Absolute,
    /// Breach threshold depends on which volume bucket the identity's
    /// send count falls into; `value` is the fallback when no bucket
    /// matches
    VolumeScaled,
    /// Breach when the rate reaches `value` times the fixed baseline.
    /// See [RELATIVE_BASELINE].
    Relative,
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ThresholdRule {
    pub name: String,

    #[serde(default)]
    pub kind: RuleKind,

    pub severity: Severity,

    /// Bounce rate threshold (or multiplier, for Relative rules)
    pub value: f64,

    #[serde(default)]
    pub volume_ranges: Vec<VolumeRange>,

    /// Skip evaluation below this many sends
    #[serde(default = "ThresholdRule::default_minimum_sample_size")]
    pub minimum_sample_size: u64,

    /// Informational: the stats window the rule expects to be
    /// evaluated against
    #[serde(default = "ThresholdRule::default_time_window", with = "humantime_serde")]
    pub time_window: Duration,

    /// Suppress repeat notifications for the same identity+rule
    /// within this span. Breach history is still appended.
    #[serde(
        default = "ThresholdRule::default_notify_cooldown",
        with = "humantime_serde"
    )]
    pub notify_cooldown: Duration,

    #[serde(default = "ThresholdRule::default_enabled")]
    pub enabled: bool,
}

impl ThresholdRule {
    fn default_minimum_sample_size() -> u64 {
        50
    }
    fn default_time_window() -> Duration {
        Duration::from_secs(24 * 3600)
    }
    fn default_notify_cooldown() -> Duration {
        Duration::from_secs(30 * 60)
    }
    fn default_enabled() -> bool {
        true
    }

    /// Resolve the threshold that applies at the given send volume.
    pub fn effective_threshold(&self, total_sent: u64) -> f64 {
        match self.kind {
            RuleKind::Absolute => self.value,
            RuleKind::VolumeScaled => self
                .volume_ranges
                .iter()
                .find(|range| range.contains(total_sent))
                .map(|range| range.threshold)
                .unwrap_or(self.value),
            RuleKind::Relative => self.value * RELATIVE_BASELINE,
        }
    }
}

/// Receives breach notifications. Implementations must be cheap; a
/// failing observer is logged and isolated, never allowed to block
/// breach recording or the other observers.
pub trait BreachObserver: Send + Sync {
    fn on_breach(&self, breach: &ThresholdBreach) -> anyhow::Result<()>;
}

impl<F> BreachObserver for F
where
    F: Fn(&ThresholdBreach) -> anyhow::Result<()> + Send + Sync,
{
    fn on_breach(&self, breach: &ThresholdBreach) -> anyhow::Result<()> {
        (self)(breach)
    }
}

pub struct ThresholdEngine {
    rules: ArcSwap<Vec<ThresholdRule>>,
    history: Mutex<Vec<ThresholdBreach>>,
    last_notified: DashMap<(IdentityKey, String), DateTime<Utc>>,
    observers: Mutex<Vec<Arc<dyn BreachObserver>>>,
}

impl ThresholdEngine {
    pub fn new(rules: Vec<ThresholdRule>) -> Self {
        Self {
            rules: ArcSwap::from_pointee(rules),
            history: Mutex::new(vec![]),
            last_notified: DashMap::new(),
            observers: Mutex::new(vec![]),
        }
    }

    /// Swap in a new rule set; callers holding stale rule views finish
    /// their current evaluation against the old rules.
    pub fn replace_rules(&self, rules: Vec<ThresholdRule>) {
        self.rules.store(Arc::new(rules));
    }

    pub fn rules(&self) -> Arc<Vec<ThresholdRule>> {
        self.rules.load_full()
    }

    pub fn add_observer(&self, observer: Arc<dyn BreachObserver>) {
        self.observers.lock().push(observer);
    }

    /// Evaluate every enabled rule against one identity's window.
    /// All crossed rules breach independently; a single observation
    /// can produce several breaches at different severities.
    pub fn check_thresholds(&self, window: &StatWindow) -> Vec<ThresholdBreach> {
        let rules = self.rules.load();
        let mut breaches = vec![];

        for rule in rules.iter() {
            if !rule.enabled {
                continue;
            }
            if window.total_sent < rule.minimum_sample_size {
                continue;
            }
            let threshold = rule.effective_threshold(window.total_sent);
            if window.bounce_rate >= threshold {
                breaches.push(ThresholdBreach {
                    identity: window.identity.clone(),
                    rule_name: rule.name.clone(),
                    current_value: window.bounce_rate,
                    threshold_value: threshold,
                    severity: rule.severity,
                    breach_time: Utc::now(),
                    sample_size: window.total_sent,
                });
            }
        }

        for breach in &breaches {
            self.record_breach(breach);
        }

        breaches
    }

    pub fn check_all(&self, windows: &[StatWindow]) -> Vec<ThresholdBreach> {
        windows
            .iter()
            .flat_map(|window| self.check_thresholds(window))
            .collect()
    }

    fn record_breach(&self, breach: &ThresholdBreach) {
        BREACHES_TOTAL
            .with_label_values(&[&breach.severity.to_string()])
            .inc();
        self.history.lock().push(breach.clone());

        if self.should_notify(breach) {
            let observers = self.observers.lock().clone();
            for observer in observers {
                if let Err(err) = observer.on_breach(breach) {
                    // One failing callback must not block the others
                    // or breach recording
                    tracing::error!(
                        "breach observer failed for {} rule {}: {err:#}",
                        breach.identity,
                        breach.rule_name
                    );
                }
            }
        } else {
            tracing::debug!(
                "suppressing repeat notification for {} rule {}",
                breach.identity,
                breach.rule_name
            );
        }
    }

    fn should_notify(&self, breach: &ThresholdBreach) -> bool {
        let cooldown = self
            .rules
            .load()
            .iter()
            .find(|rule| rule.name == breach.rule_name)
            .map(|rule| rule.notify_cooldown)
            .unwrap_or_else(ThresholdRule::default_notify_cooldown);
        let cooldown =
            chrono::Duration::from_std(cooldown).unwrap_or_else(|_| chrono::Duration::minutes(30));

        let key = (breach.identity.clone(), breach.rule_name.clone());
        let mut notify = true;
        self.last_notified
            .entry(key)
            .and_modify(|last| {
                if breach.breach_time - *last < cooldown {
                    notify = false;
                } else {
                    *last = breach.breach_time;
                }
            })
            .or_insert(breach.breach_time);
        notify
    }

    /// Full breach history, oldest first.
    pub fn breach_history(&self) -> Vec<ThresholdBreach> {
        self.history.lock().clone()
    }

    /// Breaches filtered by identity, minimum severity and time range.
    pub fn query_breaches(
        &self,
        identity: Option<&IdentityKey>,
        min_severity: Option<Severity>,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Vec<ThresholdBreach> {
        self.history
            .lock()
            .iter()
            .filter(|breach| {
                breach.breach_time >= since
                    && breach.breach_time < until
                    && identity.map(|id| breach.identity == *id).unwrap_or(true)
                    && min_severity
                        .map(|severity| breach.severity >= severity)
                        .unwrap_or(true)
            })
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use bounce_stats::StatStatus;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn identity() -> IdentityKey {
        IdentityKey::new("192.0.2.77".parse().unwrap(), "acct-x")
    }

    fn window(total_sent: u64, total_bounced: u64) -> StatWindow {
        StatWindow {
            identity: identity(),
            total_sent,
            total_bounced,
            hard_bounces: total_bounced,
            soft_bounces: 0,
            block_bounces: 0,
            bounce_rate: if total_sent > 0 {
                total_bounced as f64 / total_sent as f64
            } else {
                0.0
            },
            status: StatStatus::Healthy,
            last_updated: Utc::now(),
        }
    }

    fn absolute_rule(name: &str, value: f64, severity: Severity) -> ThresholdRule {
        ThresholdRule {
            name: name.to_string(),
            kind: RuleKind::Absolute,
            severity,
            value,
            volume_ranges: vec![],
            minimum_sample_size: 50,
            time_window: Duration::from_secs(24 * 3600),
            notify_cooldown: Duration::from_secs(30 * 60),
            enabled: true,
        }
    }

    #[test]
    fn minimum_sample_gates_evaluation() {
        // 3/10 = 30% must NOT breach a 5% rule with min-sample 50
        let engine = ThresholdEngine::new(vec![absolute_rule("warn", 0.05, Severity::Medium)]);
        let breaches = engine.check_thresholds(&window(10, 3));
        assert!(breaches.is_empty());
        assert!(engine.breach_history().is_empty());
    }

    #[test]
    fn rules_breach_independently() {
        let engine = ThresholdEngine::new(vec![
            absolute_rule("medium", 0.05, Severity::Medium),
            absolute_rule("critical", 0.15, Severity::Critical),
        ]);

        // 1000 sent / 100 bounced = 10%: only the 5% rule trips
        let breaches = engine.check_thresholds(&window(1000, 100));
        k9::assert_equal!(breaches.len(), 1);
        k9::assert_equal!(breaches[0].rule_name, "medium");
        k9::assert_equal!(breaches[0].severity, Severity::Medium);
        assert!((breaches[0].current_value - 0.10).abs() < f64::EPSILON);

        // 160 bounced = 16%: both rules trip
        let breaches = engine.check_thresholds(&window(1000, 160));
        k9::assert_equal!(breaches.len(), 2);
    }

    #[test]
    fn breach_is_inclusive_at_the_threshold() {
        let engine = ThresholdEngine::new(vec![absolute_rule("exact", 0.05, Severity::Low)]);
        let breaches = engine.check_thresholds(&window(1000, 50));
        k9::assert_equal!(breaches.len(), 1);
    }

    #[test]
    fn disabled_rules_are_skipped() {
        let mut rule = absolute_rule("off", 0.01, Severity::High);
        rule.enabled = false;
        let engine = ThresholdEngine::new(vec![rule]);
        assert!(engine.check_thresholds(&window(1000, 500)).is_empty());
    }

    #[test]
    fn volume_ranges_select_the_effective_threshold() {
        let rule = ThresholdRule {
            kind: RuleKind::VolumeScaled,
            volume_ranges: vec![
                VolumeRange {
                    min_volume: 0,
                    max_volume: Some(1000),
                    threshold: 0.10,
                },
                VolumeRange {
                    min_volume: 1000,
                    max_volume: Some(10000),
                    threshold: 0.05,
                },
                VolumeRange {
                    min_volume: 10000,
                    max_volume: None,
                    threshold: 0.02,
                },
            ],
            ..absolute_rule("scaled", 0.08, Severity::Medium)
        };

        k9::assert_equal!(rule.effective_threshold(0), 0.10);
        // Lower bound inclusive, upper exclusive
        k9::assert_equal!(rule.effective_threshold(999), 0.10);
        k9::assert_equal!(rule.effective_threshold(1000), 0.05);
        k9::assert_equal!(rule.effective_threshold(9999), 0.05);
        // Unbounded top bucket
        k9::assert_equal!(rule.effective_threshold(5_000_000), 0.02);
    }

    #[test]
    fn volume_rule_falls_back_to_base_value() {
        let rule = ThresholdRule {
            kind: RuleKind::VolumeScaled,
            volume_ranges: vec![VolumeRange {
                min_volume: 1000,
                max_volume: None,
                threshold: 0.05,
            }],
            ..absolute_rule("scaled", 0.08, Severity::Medium)
        };
        // 100 sends matches no bucket
        k9::assert_equal!(rule.effective_threshold(100), 0.08);
    }

    #[test]
    fn relative_rule_uses_fixed_baseline() {
        let rule = ThresholdRule {
            kind: RuleKind::Relative,
            ..absolute_rule("relative", 3.0, Severity::High)
        };
        assert!((rule.effective_threshold(1000) - 0.06).abs() < f64::EPSILON);
    }

    #[test]
    fn notify_cooldown_suppresses_repeats_but_history_grows() {
        let engine = ThresholdEngine::new(vec![absolute_rule("warn", 0.05, Severity::Medium)]);
        let fired = Arc::new(AtomicUsize::new(0));

        let counter = fired.clone();
        engine.add_observer(Arc::new(move |_breach: &ThresholdBreach| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }));

        engine.check_thresholds(&window(1000, 100));
        engine.check_thresholds(&window(1000, 110));
        engine.check_thresholds(&window(1000, 120));

        k9::assert_equal!(fired.load(Ordering::SeqCst), 1);
        k9::assert_equal!(engine.breach_history().len(), 3);
    }

    #[test]
    fn observer_failures_are_isolated() {
        let engine = ThresholdEngine::new(vec![absolute_rule("warn", 0.05, Severity::Medium)]);
        let fired = Arc::new(AtomicUsize::new(0));

        engine.add_observer(Arc::new(|_breach: &ThresholdBreach| {
            anyhow::bail!("observer exploded")
        }));
        let counter = fired.clone();
        engine.add_observer(Arc::new(move |_breach: &ThresholdBreach| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }));

        let breaches = engine.check_thresholds(&window(1000, 100));
        k9::assert_equal!(breaches.len(), 1);
        // The failing observer neither blocked the second one nor
        // prevented history recording
        k9::assert_equal!(fired.load(Ordering::SeqCst), 1);
        k9::assert_equal!(engine.breach_history().len(), 1);
    }

    #[test]
    fn query_filters_by_severity_and_identity() {
        let engine = ThresholdEngine::new(vec![
            absolute_rule("medium", 0.05, Severity::Medium),
            absolute_rule("critical", 0.15, Severity::Critical),
        ]);
        engine.check_thresholds(&window(1000, 200));

        let now = Utc::now();
        let all = engine.query_breaches(
            None,
            None,
            now - chrono::Duration::minutes(1),
            now + chrono::Duration::minutes(1),
        );
        k9::assert_equal!(all.len(), 2);

        let critical = engine.query_breaches(
            Some(&identity()),
            Some(Severity::Critical),
            now - chrono::Duration::minutes(1),
            now + chrono::Duration::minutes(1),
        );
        k9::assert_equal!(critical.len(), 1);
        k9::assert_equal!(critical[0].rule_name, "critical");
    }

    #[test]
    fn rules_deserialize_from_toml() {
        let rule: ThresholdRule = toml::from_str(
            r#"
name = "default-bounce"
severity = "Medium"
value = 0.05
minimum_sample_size = 100
time_window = "12h"
notify_cooldown = "15m"
"#,
        )
        .unwrap();
        k9::assert_equal!(rule.kind, RuleKind::Absolute);
        k9::assert_equal!(rule.minimum_sample_size, 100);
        k9::assert_equal!(rule.time_window, Duration::from_secs(12 * 3600));
        assert!(rule.enabled);
    }
}
