//! Timer loops driving reconciliation and traffic metering.
//!
//! The two loops share nothing but the shutdown signal.  Each iteration runs
//! to completion before the next tick is awaited; a tick missed while an
//! iteration overran is delayed, never stacked.

use std::time::Duration;

use log::{error, info, warn};
use tokio::sync::watch;
use tokio::time::{interval, sleep, MissedTickBehavior};

use crate::error::SyncError;
use crate::reconcile::Reconciler;
use crate::traffic::TrafficMeter;

#[derive(Debug, Clone, Copy)]
pub struct Timings {
    pub sync_interval: Duration,
    pub traffic_interval: Duration,
    pub traffic_initial_delay: Duration,
}

/// Runs both loops until `shutdown` flips or, with fail-fast, a cycle fails.
pub async fn run(
    mut reconciler: Reconciler,
    meter: Option<TrafficMeter>,
    timings: Timings,
    shutdown: watch::Receiver<bool>,
) -> Result<(), SyncError> {
    let traffic_handle = meter.map(|meter| {
        let shutdown = shutdown.clone();
        tokio::spawn(async move { run_traffic(meter, timings, shutdown).await })
    });

    let result = run_sync(&mut reconciler, timings.sync_interval, shutdown).await;

    if let Some(handle) = traffic_handle {
        if result.is_err() {
            handle.abort();
        } else if let Err(e) = handle.await {
            warn!("traffic loop ended abnormally: {}", e);
        }
    }
    result
}

async fn run_sync(
    reconciler: &mut Reconciler,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), SyncError> {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match reconciler.run_cycle().await {
                    Ok(report) if !report.is_clean() => {
                        warn!(
                            "sync cycle finished with {} failed node(s); retrying next tick",
                            report.failed.len()
                        );
                    }
                    Ok(_) => {}
                    Err(e) => {
                        // Only surfaces with fail-fast.
                        error!("sync failed: {}", e);
                        return Err(e);
                    }
                }
            }
            _ = shutdown.changed() => {
                info!("sync loop stopping");
                return Ok(());
            }
        }
    }
}

async fn run_traffic(meter: TrafficMeter, timings: Timings, mut shutdown: watch::Receiver<bool>) {
    info!(
        "traffic reporting enabled: interval={:?}",
        timings.traffic_interval
    );

    // Give the proxy time to come up before the first query.
    tokio::select! {
        _ = sleep(timings.traffic_initial_delay) => {}
        _ = shutdown.changed() => return,
    }

    let mut ticker = interval(timings.traffic_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => meter.run_cycle().await,
            _ = shutdown.changed() => {
                info!("traffic loop stopping");
                return;
            }
        }
    }
}
