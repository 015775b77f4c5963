//! # Vivian: event bus and scheduler runtime
//!
//! Loads config, wires the event bus and the scheduler together, registers
//! a heartbeat job and a logging subscriber, then runs until Ctrl-C.
//!
//! Usage:
//!   vivian                                  # Run with ~/.vivian/config.toml
//!   vivian --config ./vivian.toml           # Custom config file
//!   vivian --tick-ms 100 --run-for 10       # Fast ticks, exit after 10s
//!   vivian --event-log ~/.vivian/events.jsonl

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use serde_json::{json, Value};
use tracing_subscriber::EnvFilter;

use vivian_core::config::expand_path;
use vivian_core::VivianConfig;
use vivian_events::EventBus;
use vivian_scheduler::{JobContext, JobFn, JobSpec, JobStore, Scheduler};

const HEARTBEAT: &str = "heartbeat";

#[derive(Parser)]
#[command(name = "vivian", version, about = "⏰ Vivian: event bus and job scheduler")]
struct Cli {
    /// Config file (default: ~/.vivian/config.toml)
    #[arg(short, long)]
    config: Option<String>,

    /// Append every published event to this JSONL file
    #[arg(long)]
    event_log: Option<String>,

    /// Scheduler tick in milliseconds
    #[arg(long)]
    tick_ms: Option<u64>,

    /// Stop after this many seconds instead of waiting for Ctrl-C
    #[arg(long)]
    run_for: Option<u64>,

    /// Heartbeat interval in seconds
    #[arg(long, default_value = "30")]
    heartbeat_secs: u64,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

fn heartbeat(ctx: &JobContext) -> anyhow::Result<Value> {
    tracing::info!("💓 {}", ctx.name);
    Ok(json!({"alive": true, "at": vivian_core::util::epoch_secs()}))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose { "vivian=debug" } else { "vivian=info" };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    // Load config, CLI flags win
    let mut config = match &cli.config {
        Some(path) => VivianConfig::load_from(&expand_path(path))?,
        None => VivianConfig::load()?,
    };
    if let Some(path) = &cli.event_log {
        config.event_bus.persistent_log = Some(path.clone());
    }
    if let Some(tick_ms) = cli.tick_ms {
        config.scheduler.tick_ms = tick_ms.max(1);
    }

    let bus = EventBus::from_config(&config.event_bus);
    bus.subscribe_global(|event| {
        tracing::info!("📨 {event}");
        Ok(())
    });

    let scheduler = Arc::new(
        Scheduler::new(config.scheduler.clone()).with_event_bus(bus.clone()),
    );
    scheduler.register_builtin_admin_commands();

    // Restore saved jobs before attaching the store so restoring does not
    // rewrite the file once per job.
    let store_path: Option<PathBuf> = config.scheduler.store_path();
    if let Some(path) = &store_path {
        let store = JobStore::new(path);
        let saved = store.load();
        scheduler.restore_jobs(&saved, |name| {
            let func: JobFn = Arc::new(heartbeat);
            (name == HEARTBEAT).then_some(func)
        });
        store.attach(&scheduler);
    }

    if scheduler.get_job(HEARTBEAT).is_none() {
        scheduler.add_job(
            HEARTBEAT,
            heartbeat,
            JobSpec::every(Duration::from_secs(cli.heartbeat_secs.max(1)))
                .tag("system")
                .description("Liveness heartbeat"),
        );
    }

    println!("⏰ Vivian v{}", env!("CARGO_PKG_VERSION"));
    println!("   ⏱️  Tick:        {}ms", config.scheduler.tick_ms);
    println!("   📋 Jobs:        {}", scheduler.job_count());
    if let Some(path) = bus.event_log().path() {
        println!("   📝 Event log:   {}", path.display());
    }
    if let Some(path) = &store_path {
        println!("   💾 Job store:   {}", path.display());
    }
    println!();

    scheduler.start();

    match cli.run_for {
        Some(secs) => {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(secs)) => {
                    tracing::info!("Run time of {secs}s elapsed");
                }
                res = tokio::signal::ctrl_c() => res?,
            }
        }
        None => tokio::signal::ctrl_c().await?,
    }

    tracing::info!("Shutting down...");
    if let Some(handle) = scheduler.stop() {
        if let Err(e) = handle.await {
            tracing::warn!("Scheduler loop ended abnormally: {e}");
        }
    }
    bus.shutdown();

    let stats = scheduler.get_stats();
    println!(
        "📊 {} run(s), {} failure(s), {} event(s) logged",
        stats.runs,
        stats.fails,
        bus.event_log().len()
    );
    Ok(())
}
