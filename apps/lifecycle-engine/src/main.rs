//! Lifecycle Engine Binary
//!
//! Starts the engine against the paper broker: loads configuration, wires
//! the execution stack, and runs the market-data staleness sweep and risk
//! monitor until interrupted.
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin lifecycle-engine [config.yaml]
//! ```
//!
//! # Environment Variables
//!
//! - `RUST_LOG`: log filter (overrides `logging.level` from config)

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::info;

use lifecycle_engine::config::{load_config, Config, ConfigError};
use lifecycle_engine::execution::{ExecutionService, PaperBroker};
use lifecycle_engine::marketdata::MarketStateCache;
use lifecycle_engine::observability::init_logging;
use lifecycle_engine::orchestrator::Orchestrator;
use lifecycle_engine::persistence::InMemoryTradeStore;
use lifecycle_engine::registry::InMemoryOrderRegistry;
use lifecycle_engine::risk::RiskEngine;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = std::env::args().nth(1);
    let config = match config_path {
        Some(path) => load_config(Some(&path)).context("loading configuration")?,
        // Without an explicit path a missing config.yaml falls back to
        // defaults.
        None => match load_config(None) {
            Ok(config) => config,
            Err(ConfigError::ReadError { .. }) => Config::default(),
            Err(err) => return Err(err).context("loading configuration"),
        },
    };

    init_logging(&config.logging.level)?;
    info!(
        account_id = %config.engine.account_id,
        rule_set = %config.risk.active_rule_set,
        "starting lifecycle engine"
    );

    let broker = Arc::new(PaperBroker::new());
    let registry = Arc::new(InMemoryOrderRegistry::new());
    let execution = Arc::new(ExecutionService::with_retry_policy(
        broker,
        registry,
        config.execution.retry.to_policy(),
    ));
    let store = Arc::new(InMemoryTradeStore::new());
    let cache = Arc::new(MarketStateCache::new(
        config.marketdata.staleness_warn_threshold_ms,
    ));
    let risk = Arc::new(RiskEngine::with_rules(config.risk.rules.clone()));

    let orchestrator = Arc::new(Orchestrator::new(
        execution,
        store,
        Arc::clone(&cache),
        risk,
        &config,
    ));

    let shutdown = CancellationToken::new();
    let sweep = cache.spawn_sweep(
        Duration::from_millis(config.marketdata.sweep_interval_ms),
        shutdown.clone(),
    );
    let monitor = Arc::clone(&orchestrator).spawn_risk_monitor(
        Duration::from_millis(config.engine.fill_poll_interval_ms * 4),
        shutdown.clone(),
    );

    info!("lifecycle engine running; press ctrl-c to stop");
    signal::ctrl_c().await.context("waiting for shutdown signal")?;

    info!("shutdown requested, stopping background tasks");
    shutdown.cancel();
    let _ = sweep.await;
    let _ = monitor.await;

    let open = orchestrator.open_trades().await;
    if !open.is_empty() {
        info!(count = open.len(), "open trades at shutdown");
    }
    info!("lifecycle engine stopped");

    Ok(())
}
