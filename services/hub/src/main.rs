//! Fleet hub
//!
//! The hub is the central coordination service for multi-cluster workload
//! placement. It watches declarative placement objects and drives
//! reconciliation of desired vs current state: snapshot rotation,
//! scheduling, rollout, work generation, and status aggregation.

use std::sync::Arc;

use anyhow::Result;
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use fleet_hub::aggregator::PlacementAggregator;
use fleet_hub::config::Config;
use fleet_hub::controller::run_controller;
use fleet_hub::rollout::RolloutReconciler;
use fleet_hub::scheduler::{SchedulerFramework, SchedulerReconciler};
use fleet_hub::snapshot::{CatalogSource, SnapshotController};
use fleet_hub::workgen::WorkGenerator;
use fleet_store::HubStore;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting fleet hub");

    let config = Config::from_env()?;
    info!(
        resync_interval_secs = config.resync_interval.as_secs(),
        snapshot_size_budget_bytes = config.snapshot_size_budget_bytes,
        "Configuration loaded"
    );

    let store = HubStore::new();
    let source = Arc::new(CatalogSource::new());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let snapshot = Arc::new(SnapshotController::new(
        store.clone(),
        source.clone(),
        config.snapshot_size_budget_bytes,
    ));
    let scheduler = Arc::new(SchedulerReconciler::new(
        store.clone(),
        SchedulerFramework::new(),
        config.max_batch_per_cycle,
    ));
    let rollout = Arc::new(RolloutReconciler::new(
        store.clone(),
        config.rollout_stuck_threshold,
    ));
    let workgen = Arc::new(WorkGenerator::new(
        store.clone(),
        config.max_failed_placements,
    ));
    let aggregator = Arc::new(PlacementAggregator::new(store.clone()));

    let mut tasks = Vec::new();
    tasks.push(tokio::spawn(run_controller(
        snapshot,
        store.clone(),
        config.resync_interval,
        shutdown_rx.clone(),
    )));
    tasks.push(tokio::spawn(run_controller(
        scheduler,
        store.clone(),
        config.resync_interval,
        shutdown_rx.clone(),
    )));
    tasks.push(tokio::spawn(run_controller(
        rollout,
        store.clone(),
        config.resync_interval,
        shutdown_rx.clone(),
    )));
    tasks.push(tokio::spawn(run_controller(
        workgen,
        store.clone(),
        config.resync_interval,
        shutdown_rx.clone(),
    )));
    tasks.push(tokio::spawn(run_controller(
        aggregator,
        store.clone(),
        config.resync_interval,
        shutdown_rx,
    )));

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");
    let _ = shutdown_tx.send(true);

    for task in tasks {
        let _ = task.await;
    }
    info!("Fleet hub stopped");
    Ok(())
}
