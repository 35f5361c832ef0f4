//! claimguard-daemon - claim verification platform daemon.
//!
//! Serves the HTTP API and runs the background loops: the review
//! dispatcher (decision delivery plus ticket expiry), the fleet health
//! prober, the cache sweeper, and startup crash recovery for instances
//! that were mid-flight when the previous process died.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use claimguard_core::config::Config;
use claimguard_core::evidence::EvidenceStore;
use claimguard_core::gateway::ModelGateway;
use claimguard_core::hitl::ReviewDispatcher;
use claimguard_core::index::VectorIndex;
use claimguard_core::ledger::AuditDb;
use claimguard_core::pipeline::PipelineStatus;
use claimguard_daemon::api;
use claimguard_daemon::state::{ApiKeyRegistry, AppState};

/// claimguard daemon - AI claim verification platform
#[derive(Parser, Debug)]
#[command(name = "claimguard-daemon")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to the platform configuration file
    #[arg(short, long, default_value = "claimguard.toml")]
    config: PathBuf,

    /// Path to the audit and checkpoint database
    #[arg(long, default_value = "claimguard.db")]
    db: PathBuf,

    /// Listen address for the HTTP API
    #[arg(long, default_value = "127.0.0.1:8080")]
    listen: SocketAddr,

    /// Path to the API keys file (TOML with a `keys` array)
    #[arg(long)]
    keys_file: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_new(&args.log_level)
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = if args.config.exists() {
        Config::from_file(&args.config).context("failed to load configuration")?
    } else {
        info!(path = %args.config.display(), "no config file, using defaults");
        Config::default()
    };

    let db = AuditDb::open(&args.db).context("failed to open audit database")?;
    let auth = match &args.keys_file {
        Some(path) => ApiKeyRegistry::from_file(path).context("failed to load keys file")?,
        None => ApiKeyRegistry::ephemeral(),
    };

    let (state, resolutions) = AppState::build(config, db, auth)?;

    // Review dispatcher: decision delivery and ticket expiry.
    let dispatcher = ReviewDispatcher::new(
        Arc::clone(&state.gate),
        Arc::clone(&state.orchestrator),
        resolutions,
        state.config.hitl.expiry_scan_interval,
    );
    tokio::spawn(dispatcher.run());

    // Fleet health prober and cache sweeper.
    tokio::spawn(probe_loop(Arc::clone(&state)));
    tokio::spawn(cache_sweep_loop(Arc::clone(&state)));

    // Crash recovery: pick up instances the previous process left behind.
    recover_inflight(&state);

    let listener = tokio::net::TcpListener::bind(args.listen)
        .await
        .with_context(|| format!("failed to bind {}", args.listen))?;
    info!(listen = %args.listen, "claimguard daemon listening");

    axum::serve(listener, api::router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    info!("shutdown complete");
    Ok(())
}

/// Resumes instances that were running or awaiting review when the
/// previous process stopped.
fn recover_inflight(state: &Arc<AppState>) {
    for status in [PipelineStatus::Running, PipelineStatus::AwaitingReview] {
        let ids = match state.db.instances_in_status(status) {
            Ok(ids) => ids,
            Err(error) => {
                warn!(%error, "startup recovery scan failed");
                continue;
            }
        };
        for instance_id in ids {
            info!(instance_id = %instance_id, status = status.as_str(), "recovering instance");
            let run_state = Arc::clone(state);
            tokio::spawn(async move {
                if let Err(error) = run_state.orchestrator.run(&instance_id).await {
                    warn!(instance_id = %instance_id, %error, "instance recovery failed");
                }
            });
        }
    }
}

/// Probes every dependency on the configured interval.
async fn probe_loop(state: Arc<AppState>) {
    let mut interval = tokio::time::interval(state.config.health.probe_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        interval.tick().await;

        let started = Instant::now();
        let outcome = state
            .gateway
            .probe()
            .await
            .map(|()| started.elapsed())
            .map_err(|e| e.to_string());
        state.health.record_probe("model_gateway", outcome);

        let started = Instant::now();
        let outcome = state
            .index
            .probe()
            .map(|()| started.elapsed())
            .map_err(|e| e.to_string());
        state.health.record_probe("vector_index", outcome);

        let started = Instant::now();
        let outcome = state
            .evidence
            .probe()
            .map(|()| started.elapsed())
            .map_err(|e| e.to_string());
        state.health.record_probe("evidence_store", outcome);

        let started = Instant::now();
        let outcome = state
            .db
            .probe()
            .map(|()| started.elapsed())
            .map_err(|e| e.to_string());
        state.health.record_probe("audit_ledger", outcome);
    }
}

/// Evicts expired cache entries periodically.
async fn cache_sweep_loop(state: Arc<AppState>) {
    let mut interval = tokio::time::interval(Duration::from_secs(60));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        state.cache.sweep();
    }
}

/// Resolves when SIGINT or SIGTERM arrives.
async fn shutdown_signal() {
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sig) => sig,
        Err(error) => {
            warn!(%error, "failed to install SIGTERM handler");
            return std::future::pending::<()>().await;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("received SIGINT"),
        _ = sigterm.recv() => info!("received SIGTERM"),
    }
}
