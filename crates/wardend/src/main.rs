use crate::config::{ConfigWarmupProvider, WardenConfig};
use crate::diagnostic::{DiagnosticFormat, LoggingConfig};
use crate::monitor::Monitor;
use crate::notify::LogPublisher;
use admission_throttle::AdmissionThrottle;
use bounce_stats::store::BounceStore;
use bounce_stats::{MemoryStore, SqliteStore, StatsTracker};
use clap::Parser;
use egress_types::{Notification, NotificationKind, NotificationPublisher, ThresholdBreach};
use rotation_pool::RotationPool;
use std::path::PathBuf;
use std::sync::Arc;
use threshold_rules::ThresholdEngine;
use warden_lifecycle::LifeCycle;

mod config;
mod diagnostic;
mod monitor;
mod notify;

/// Egress identity warden daemon.
///
/// Watches per-identity bounce statistics, rotates degraded sending
/// identities to healthy alternatives, and throttles admission of
/// outbound send batches.
#[derive(Debug, Parser)]
#[command(about, version)]
struct Opt {
    /// Configuration file to load.
    #[arg(long, default_value = "/etc/wardend/wardend.toml")]
    config: PathBuf,

    /// Directory where diagnostic log files will be placed.
    ///
    /// If omitted, diagnostics will be printed to stderr.
    #[arg(long)]
    diag_log_dir: Option<PathBuf>,

    /// How diagnostic logs render. full, compact and pretty are
    /// intended for human consumption.
    ///
    /// json outputs machine readable records.
    #[arg(long, default_value = "full")]
    diag_format: DiagnosticFormat,
}

fn main() -> anyhow::Result<()> {
    let opts = Opt::parse();

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(async move { run(opts).await })
}

async fn run(opts: Opt) -> anyhow::Result<()> {
    LoggingConfig {
        log_dir: opts.diag_log_dir.clone(),
        diag_format: opts.diag_format,
        filter_env_var: "WARDEND_LOG",
        default_filter:
            "wardend=info,bounce_stats=info,threshold_rules=info,rotation_pool=info,admission_throttle=info",
    }
    .init()?;

    let mut life_cycle = LifeCycle::new();

    // Load the config now so silly mistakes surface before anything
    // starts
    let warden_config = config::load_warden_config(&opts.config).await?;
    config::assign_config(warden_config.clone());

    let services = build_services(&warden_config).await?;
    services.throttle.restore_queues().await?;
    config::apply_config(&warden_config, &services.engine, &services.pool);
    config::spawn_config_updater(
        opts.config.clone(),
        services.engine.clone(),
        services.pool.clone(),
    );

    let monitor = Arc::new(Monitor {
        stats: services.stats.clone(),
        engine: services.engine.clone(),
        pool: services.pool.clone(),
        throttle: services.throttle.clone(),
        interval: warden_config.monitor_interval,
        purge_age: warden_config.purge_age,
    });
    tokio::spawn(monitor.run());

    tracing::info!(
        "wardend started with {} identities under management",
        services.pool.status().len()
    );

    life_cycle.wait_for_shutdown().await;

    // Mirror whatever is still queued so it survives the restart
    if let Err(err) = services.throttle.save_queues().await {
        tracing::error!("failed to persist queued batches: {err:#}");
    }
    Ok(())
}

/// The service graph, constructed once at startup and shared by the
/// monitoring loop and the control surface.
struct Services {
    stats: Arc<StatsTracker>,
    engine: Arc<ThresholdEngine>,
    pool: Arc<RotationPool>,
    throttle: Arc<AdmissionThrottle>,
}

async fn build_services(warden_config: &WardenConfig) -> anyhow::Result<Services> {
    let store: Arc<dyn BounceStore> = match &warden_config.database {
        Some(path) => Arc::new(SqliteStore::open(&path.to_string_lossy())?),
        None => {
            tracing::warn!("no database configured; stats will not survive a restart");
            Arc::new(MemoryStore::new())
        }
    };
    let stats = Arc::new(StatsTracker::new(store, warden_config.stats.clone()));

    let publisher: Arc<dyn NotificationPublisher> = Arc::new(LogPublisher);

    let engine = Arc::new(ThresholdEngine::new(warden_config.rules.clone()));
    {
        let publisher = publisher.clone();
        engine.add_observer(Arc::new(move |breach: &ThresholdBreach| {
            publisher.publish(
                Notification::new(
                    NotificationKind::ThresholdBreach,
                    breach.severity,
                    format!(
                        "{} breached rule {}: {:.2}% against a {:.2}% threshold",
                        breach.identity,
                        breach.rule_name,
                        breach.current_value * 100.0,
                        breach.threshold_value * 100.0
                    ),
                )
                .with_meta("rule", breach.rule_name.clone())
                .with_meta("identity", breach.identity.to_string()),
            );
            Ok(())
        }));
    }

    let pool = Arc::new(RotationPool::new(
        warden_config.pool.clone(),
        stats.clone(),
        publisher.clone(),
    ));
    let throttle = Arc::new(AdmissionThrottle::new(
        warden_config.throttle.clone(),
        Arc::new(ConfigWarmupProvider),
        stats.clone(),
        publisher,
    ));

    Ok(Services {
        stats,
        engine,
        pool,
        throttle,
    })
}
