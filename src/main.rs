//! Connector daemon entry point.
//!
//! Keeps each managed node's proxy users in line with the panel and reports
//! per-user traffic back to it.

use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use clap::Parser;
use log::{error, info, warn};
use tokio::signal;
use tokio::sync::watch;

mod config;
mod error;
mod normalize;
mod panel;
mod reconcile;
mod runtime;
mod scheduler;
mod store;
mod traffic;
mod types;

use config::{ApplyMode, Config};
use panel::{HttpPanel, Panel};
use reconcile::{Applier, Reconciler};
use runtime::{CommandApplier, ProxyBackend, XrayBackend};
use scheduler::Timings;
use store::StateStore;
use traffic::TrafficMeter;

/// Panel-to-proxy user synchronization agent.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Run a single sync pass and exit
    #[arg(long)]
    once: bool,

    /// Exit on the first node error
    #[arg(long)]
    fail_fast: bool,

    /// Path to a TOML configuration file (default: connector.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    // Load configuration
    let mut cfg = match Config::load(cli.config.as_deref()) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!("{}", e);
            process::exit(2);
        }
    };
    if cli.fail_fast {
        cfg.fail_fast = true;
    }
    info!("Starting connector with config: {:?}", cfg);
    let cfg = Arc::new(cfg);

    let panel: Arc<dyn Panel> = Arc::new(HttpPanel::new(
        cfg.panel_base_url.clone(),
        cfg.internal_token.clone(),
        cfg.http_timeout(),
    )?);
    let store = StateStore::new(&cfg.output_dir);
    std::fs::create_dir_all(&cfg.output_dir)?;

    let backend: Option<Arc<dyn ProxyBackend>> = match cfg.apply_mode() {
        ApplyMode::Rpc => {
            info!(
                "apply mode: rpc api={} vless_flow={}",
                cfg.xray_api_addr, cfg.vless_flow
            );
            if cfg.xray_tag_map.is_empty() {
                warn!(
                    "xray_tag_map is empty; default inbound tag will be used: {}",
                    cfg.default_inbound_tag
                );
            }
            Some(Arc::new(XrayBackend::new(
                &cfg.xray_api_addr,
                cfg.rpc_timeout(),
                &cfg.vless_flow,
            )?))
        }
        _ => None,
    };

    let applier = match (cfg.apply_mode(), &backend) {
        (ApplyMode::Rpc, Some(backend)) => Applier::Backend(Arc::clone(backend)),
        (ApplyMode::Command, _) => {
            info!("apply command enabled: {}", cfg.apply_command);
            Applier::Command(CommandApplier::new(cfg.apply_command.clone()))
        }
        _ => Applier::None,
    };

    let mut reconciler = Reconciler::new(Arc::clone(&cfg), Arc::clone(&panel), store.clone(), applier);

    if cli.once {
        match reconciler.run_cycle().await {
            Ok(report) => info!(
                "sync pass done: converged={:?} unchanged={:?} failed={:?}",
                report.converged,
                report.unchanged,
                report.failed.iter().map(|e| e.node()).collect::<Vec<_>>()
            ),
            Err(e) => {
                error!("sync failed: {}", e);
                process::exit(1);
            }
        }
        return Ok(());
    }

    let meter = match (&backend, cfg.traffic_enabled()) {
        (Some(backend), true) => Some(TrafficMeter::new(
            cfg.node_ids.clone(),
            Arc::clone(&panel),
            store,
            Arc::clone(backend),
        )),
        _ => None,
    };
    let timings = Timings {
        sync_interval: cfg.interval(),
        traffic_interval: cfg.traffic_report_interval(),
        traffic_initial_delay: cfg.traffic_initial_delay(),
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut scheduler_handle =
        tokio::spawn(scheduler::run(reconciler, meter, timings, shutdown_rx));

    // Graceful Shutdown
    tokio::select! {
        joined = &mut scheduler_handle => {
            if joined?.is_err() {
                // Fail-fast cycle error, already logged by the sync loop.
                process::exit(1);
            }
        }
        signal_result = signal::ctrl_c() => {
            match signal_result {
                Ok(()) => info!("Received Ctrl+C, shutting down..."),
                Err(err) => error!("Unable to listen for shutdown signal: {}", err),
            }
            let _ = shutdown_tx.send(true);
            if let Err(e) = scheduler_handle.await? {
                error!("sync failed: {}", e);
            }
        }
    }

    info!("Shutdown complete.");
    Ok(())
}
