//! Retention tick driver
//!
//! Loads engine state from a JSON snapshot, optionally seeds policies, data
//! items and holds from a YAML file, runs one tick (or keeps ticking with
//! `--watch`) and writes the state back.
//!
//! Usage:
//!   cargo run --bin retention-driver -- --state state.json --seed seed.yaml --report-days 30

use anyhow::Context;
use chrono::{DateTime, Duration, Utc};
use clap::Parser;
use retention_engine::{
    DataItem, EngineConfig, EventKind, ExecutionResult, InMemoryRetentionStore, InMemoryStorageBackend,
    LegalHold, RetentionEngine, RetentionPolicy, RetentionReport, RetentionStore, StorageBackend,
    StoreSnapshot, TracingNotifier,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use uuid::Uuid;

#[derive(Parser, Debug)]
#[command(name = "retention-driver")]
#[command(about = "Run retention ticks against a persisted engine state")]
struct Args {
    /// JSON state file; created if missing
    #[arg(long, env = "RETENTION_STATE")]
    state: PathBuf,

    /// YAML seed with policies, data items and holds to load before ticking
    #[arg(long)]
    seed: Option<PathBuf>,

    /// Engine configuration file
    #[arg(long, env = "RETENTION_CONFIG")]
    config: Option<PathBuf>,

    /// Only run this policy
    #[arg(long)]
    policy: Option<Uuid>,

    /// Evaluation time (RFC 3339); defaults to the current time
    #[arg(long, conflicts_with = "watch")]
    now: Option<DateTime<Utc>>,

    /// Include a report spanning N days either side of the evaluation time
    #[arg(long)]
    report_days: Option<i64>,

    /// Emit logs as JSON
    #[arg(long)]
    json_logs: bool,

    /// Keep ticking every `tick_interval_secs` until interrupted
    #[arg(long)]
    watch: bool,
}

#[derive(Debug, Deserialize)]
struct Seed {
    #[serde(default)]
    policies: Vec<RetentionPolicy>,
    #[serde(default)]
    data_items: Vec<DataItem>,
    #[serde(default)]
    holds: Vec<SeedHold>,
}

#[derive(Debug, Deserialize)]
struct SeedHold {
    #[serde(flatten)]
    hold: LegalHold,
    /// Explicit items; the hold scope is used when empty
    #[serde(default)]
    data_ids: Vec<String>,
}

#[derive(Debug, Serialize)]
struct TickOutput {
    now: DateTime<Utc>,
    results: Vec<ExecutionResult>,
    report: Option<RetentionReport>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.json_logs);

    let config = EngineConfig::load(args.config.as_deref())?;
    let store = Arc::new(InMemoryRetentionStore::from_snapshot(load_state(&args.state)?));
    let backend = Arc::new(InMemoryStorageBackend::new());
    mirror_backend(store.as_ref(), backend.as_ref()).await?;

    let engine = RetentionEngine::new(store.clone(), backend.clone(), config.clone()).await?;
    engine.spawn_notifier(&EventKind::ALL, Arc::new(TracingNotifier));

    if let Some(ref path) = args.seed {
        apply_seed(&engine, backend.as_ref(), path).await?;
    }

    if !args.watch {
        let now = args.now.unwrap_or_else(Utc::now);
        let output = tick(&engine, &args, now).await?;
        println!("{}", serde_json::to_string_pretty(&output)?);
        save_state(&args.state, store.as_ref())?;
        return Ok(());
    }

    info!(interval_secs = config.tick_interval_secs, "Watching, press Ctrl-C to stop");
    let mut interval = tokio::time::interval(config.tick_interval());
    loop {
        tokio::select! {
            _ = interval.tick() => {
                let output = tick(&engine, &args, Utc::now()).await?;
                println!("{}", serde_json::to_string(&output)?);
                save_state(&args.state, store.as_ref())?;
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, saving state");
                save_state(&args.state, store.as_ref())?;
                return Ok(());
            }
        }
    }
}

fn init_tracing(json: bool) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    if json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
            .init();
    }
}

fn load_state(path: &Path) -> anyhow::Result<StoreSnapshot> {
    if !path.exists() {
        info!(path = %path.display(), "No state file, starting empty");
        return Ok(StoreSnapshot::default());
    }

    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading state file {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("parsing state file {}", path.display()))
}

fn save_state(path: &Path, store: &InMemoryRetentionStore) -> anyhow::Result<()> {
    let json = serde_json::to_string_pretty(&store.snapshot())?;
    std::fs::write(path, json).with_context(|| format!("writing state file {}", path.display()))?;
    info!(path = %path.display(), "Saved engine state");
    Ok(())
}

/// Recreate backend objects and hold flags from the persisted state
async fn mirror_backend(store: &InMemoryRetentionStore, backend: &InMemoryStorageBackend) -> anyhow::Result<()> {
    for item in store.list_data_items().await? {
        backend.put(item.id.clone(), item.size_bytes, item.current_tier);
    }
    for link in store.hold_links(None, None).await? {
        backend.set_held_flag(&link.data_id, true, link.hold_id).await?;
    }
    Ok(())
}

async fn apply_seed(engine: &RetentionEngine, backend: &InMemoryStorageBackend, path: &Path) -> anyhow::Result<()> {
    let raw = std::fs::read_to_string(path).with_context(|| format!("reading seed {}", path.display()))?;
    let seed: Seed = serde_yaml::from_str(&raw).with_context(|| format!("parsing seed {}", path.display()))?;

    for policy in seed.policies {
        let name = policy.name.clone();
        if let Err(e) = engine.create_policy(policy).await {
            warn!(policy = %name, error = %e, "Skipping seeded policy");
        }
    }

    for item in seed.data_items {
        let data_id = item.id.clone();
        let (size, tier) = (item.size_bytes, item.current_tier);
        match engine.register_data(item).await {
            Ok(_) => backend.put(data_id, size, tier),
            Err(e) => warn!(data_id = %data_id, error = %e, "Skipping seeded data item"),
        }
    }

    for SeedHold { hold, data_ids } in seed.holds {
        let matter = hold.matter.name.clone();
        let applied = if data_ids.is_empty() {
            engine.apply_legal_hold_by_scope(hold).await
        } else {
            engine.apply_legal_hold(hold, &data_ids).await
        };
        match applied {
            Ok(application) => info!(
                matter = %matter,
                applied = application.applied.len(),
                failures = application.failures.len(),
                "Seeded legal hold"
            ),
            Err(e) => warn!(matter = %matter, error = %e, "Skipping seeded legal hold"),
        }
    }

    Ok(())
}

async fn tick(engine: &RetentionEngine, args: &Args, now: DateTime<Utc>) -> anyhow::Result<TickOutput> {
    let results = engine.run_tick_at(args.policy, now).await?;

    let report = match args.report_days {
        Some(days) => {
            let (start, end) = report_window(now, days)?;
            Some(engine.generate_retention_report_at(start, end, now).await?)
        }
        None => None,
    };

    Ok(TickOutput { now, results, report })
}

fn report_window(now: DateTime<Utc>, days: i64) -> anyhow::Result<(DateTime<Utc>, DateTime<Utc>)> {
    let span = days
        .checked_abs()
        .and_then(Duration::try_days)
        .context("--report-days is out of range")?;
    let start = now.checked_sub_signed(span).context("report window starts out of range")?;
    let end = now.checked_add_signed(span).context("report window ends out of range")?;
    Ok((start, end))
}
