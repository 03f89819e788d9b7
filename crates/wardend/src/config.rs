use admission_throttle::ThrottleConfig;
use anyhow::Context;
use arc_swap::ArcSwap;
use bounce_stats::StatsConfig;
use egress_types::{IdentityKey, WarmupProvider, WarmupStatus};
use rotation_pool::{PoolConfig, RotationPool};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock};
use std::time::Duration;
use threshold_rules::{ThresholdEngine, ThresholdRule};

static CONFIG: LazyLock<ArcSwap<WardenConfig>> =
    LazyLock::new(|| ArcSwap::from_pointee(WardenConfig::default()));

/// An identity to register in the rotation pool at startup.
#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct IdentitySpec {
    pub identity: IdentityKey,
    #[serde(default)]
    pub priority: u32,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// Warm-up assignment for an identity. In a full deployment these come
/// from the warm-up stage scheduler; the config file stands in for it.
#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct WarmupSpec {
    pub identity: IdentityKey,
    #[serde(default)]
    pub daily_limit: u64,
    pub status: WarmupStatus,
}

#[derive(Deserialize, Serialize, Debug, Clone, Default)]
#[serde(deny_unknown_fields)]
pub struct WardenConfig {
    #[serde(default)]
    pub stats: StatsConfig,

    #[serde(default)]
    pub pool: PoolConfig,

    #[serde(default)]
    pub throttle: ThrottleConfig,

    #[serde(default)]
    pub rules: Vec<ThresholdRule>,

    #[serde(default)]
    pub identities: Vec<IdentitySpec>,

    #[serde(default)]
    pub warmup: Vec<WarmupSpec>,

    /// Where the sqlite store lives. Absent means an in-memory store,
    /// which loses history on restart.
    #[serde(default)]
    pub database: Option<PathBuf>,

    /// How often the monitoring loop wakes up
    #[serde(
        default = "WardenConfig::default_monitor_interval",
        with = "humantime_serde"
    )]
    pub monitor_interval: Duration,

    /// Events older than this are purged on each monitoring pass
    #[serde(default = "WardenConfig::default_purge_age", with = "humantime_serde")]
    pub purge_age: Duration,
}

impl WardenConfig {
    pub fn default_monitor_interval() -> Duration {
        Duration::from_secs(5 * 60)
    }
    pub fn default_purge_age() -> Duration {
        Duration::from_secs(7 * 24 * 3600)
    }
}

pub async fn load_warden_config(path: &Path) -> anyhow::Result<Arc<WardenConfig>> {
    let data = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("reading config file {}", path.display()))?;
    let config: WardenConfig =
        toml::from_str(&data).with_context(|| format!("parsing config file {}", path.display()))?;
    Ok(Arc::new(config))
}

pub fn get_config() -> Arc<WardenConfig> {
    CONFIG.load_full()
}

pub fn assign_config(config: Arc<WardenConfig>) {
    CONFIG.store(config);
}

/// Apply the reloadable parts of a freshly-parsed config to the
/// running services. Rules swap wholesale; identities are additive,
/// removal stays an explicit administrative action.
pub fn apply_config(config: &WardenConfig, engine: &ThresholdEngine, pool: &RotationPool) {
    engine.replace_rules(config.rules.clone());
    for spec in &config.identities {
        pool.add(spec.identity.clone(), spec.priority, spec.tags.clone());
    }
}

async fn run_updater(path: PathBuf, engine: Arc<ThresholdEngine>, pool: Arc<RotationPool>) {
    loop {
        if warden_lifecycle::sleep_unless_shutdown(Duration::from_secs(30)).await {
            return;
        }
        match load_warden_config(&path).await {
            Ok(config) => {
                apply_config(&config, &engine, &pool);
                CONFIG.store(config);
            }
            Err(err) => {
                tracing::error!("{err:#}");
            }
        }
    }
}

pub fn spawn_config_updater(
    path: PathBuf,
    engine: Arc<ThresholdEngine>,
    pool: Arc<RotationPool>,
) {
    tokio::spawn(run_updater(path, engine, pool));
}

/// Serves warm-up daily ceilings out of the live config.
pub struct ConfigWarmupProvider;

impl WarmupProvider for ConfigWarmupProvider {
    fn current_daily_limit(&self, identity: &IdentityKey) -> u64 {
        get_config()
            .warmup
            .iter()
            .find(|spec| spec.identity == *identity)
            .map(|spec| spec.daily_limit)
            .unwrap_or(0)
    }

    fn warmup_status(&self, identity: &IdentityKey) -> WarmupStatus {
        get_config()
            .warmup
            .iter()
            .find(|spec| spec.identity == *identity)
            .map(|spec| spec.status)
            .unwrap_or(WarmupStatus::NotStarted)
    }
}
