//! Edgewatch Center: headless center dashboard
//!
//! Mirrors the center's edge listing and load-balancing state, logs the
//! 2x2 view grid and optionally runs the auto-balancer. One-shot commands
//! start or stop a single offload and exit.
//!
//! ## Usage
//!
//! ```bash
//! # Watch the center on localhost:8080
//! edgewatch-center
//!
//! # Watch and balance automatically
//! EDGEWATCH_AUTO_BALANCE=1 edgewatch-center
//!
//! # One-shot commands
//! edgewatch-center --offload edge-1 edge-2
//! edgewatch-center --stop edge-1
//! ```

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::time::{interval, Duration};
use tracing::{error, info, warn};

use edgewatch::api::HttpCenterApi;
use edgewatch::offload::{AutoBalancer, OffloadCoordinator, StartOutcome, StopOutcome};
use edgewatch::{EdgeId, Slot, ViewGrid, STATUS_POLL_INTERVAL};

/// One-shot command from the command line
enum Command {
    Offload { source: EdgeId, target: EdgeId },
    Stop { source: EdgeId },
}

/// Center configuration from environment and arguments
struct Config {
    center_url: String,
    poll_interval: Duration,
    auto_balance: bool,
    command: Option<Command>,
}

impl Config {
    fn from_env() -> Self {
        let center_url = std::env::var("EDGEWATCH_CENTER_URL")
            .unwrap_or_else(|_| "http://localhost:8080".to_string());

        let poll_interval = std::env::var("EDGEWATCH_POLL_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
            .unwrap_or(STATUS_POLL_INTERVAL);

        let auto_balance = std::env::var("EDGEWATCH_AUTO_BALANCE")
            .map(|v| v == "1" || v.to_lowercase() == "true")
            .unwrap_or(false);

        let args: Vec<String> = std::env::args().collect();

        // --offload SOURCE TARGET
        let offload = args
            .iter()
            .position(|arg| arg == "--offload")
            .map(|i| Command::Offload {
                source: EdgeId::new(args.get(i + 1).cloned().unwrap_or_default()),
                target: EdgeId::new(args.get(i + 2).cloned().unwrap_or_default()),
            });

        // --stop SOURCE
        let stop = args
            .iter()
            .position(|arg| arg == "--stop")
            .map(|i| Command::Stop {
                source: EdgeId::new(args.get(i + 1).cloned().unwrap_or_default()),
            });

        Self {
            center_url,
            poll_interval,
            auto_balance,
            command: offload.or(stop),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();

    let config = Config::from_env();
    let api = HttpCenterApi::new(&config.center_url)?;
    let coordinator = Arc::new(OffloadCoordinator::new(Arc::new(api)));

    if let Some(command) = config.command {
        return run_command(&coordinator, command).await;
    }

    info!("Edgewatch Center starting");
    info!("  Center: {}", config.center_url);
    info!("  Poll interval: {:?}", config.poll_interval);
    info!("  Auto-balance: {}", config.auto_balance);

    let balancer = config.auto_balance.then(AutoBalancer::default);
    coordinator.spawn_polling(config.poll_interval, balancer);

    // Main loop: grid and balancer state until SIGINT
    let mut edges = coordinator.subscribe_edges();
    let mut stats_interval = interval(Duration::from_secs(30));
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received shutdown signal");
                break;
            }
            changed = edges.changed() => {
                if changed.is_err() {
                    break;
                }
                let grid = ViewGrid::assign(&edges.borrow_and_update());
                log_grid(&grid);
            }
            _ = stats_interval.tick() => {
                let offloads = coordinator.effective_offloads();
                for (source, target) in &offloads {
                    info!("  Offload: {} -> {}", source, target);
                }
                info!(
                    "Stats: {} edges, {} offloads ({} pending), overloaded: {:?}",
                    coordinator.edges().len(),
                    offloads.len(),
                    coordinator.pending_intents().len(),
                    coordinator.overloaded_sources(),
                );
            }
        }
    }

    if tokio::time::timeout(Duration::from_secs(5), coordinator.close()).await.is_err() {
        warn!("Shutdown timed out after 5s");
    }
    info!("Edgewatch Center stopped");
    Ok(())
}

async fn run_command(coordinator: &OffloadCoordinator, command: Command) -> Result<()> {
    // Validation needs a current listing and status
    coordinator
        .refresh_edges()
        .await
        .context("Failed to fetch edge listing")?;
    coordinator
        .refresh_status()
        .await
        .context("Failed to fetch offload status")?;

    match command {
        Command::Offload { source, target } => {
            match coordinator.start_offload(&source, &target).await {
                Ok(StartOutcome::Started) => info!("Offloading {} -> {}", source, target),
                Ok(StartOutcome::AlreadyActive) => {
                    info!("{} already offloads to {}", source, target)
                }
                Err(e) => {
                    error!("Offload {} -> {} rejected: {}", source, target, e);
                    return Err(e.into());
                }
            }
        }
        Command::Stop { source } => match coordinator.stop_offload(&source).await {
            Ok(StopOutcome::Stopped) => info!("Stopped offload from {}", source),
            Ok(StopOutcome::NotActive) => info!("No active offload from {}", source),
            Err(e) => {
                error!("Stop {} rejected: {}", source, e);
                return Err(e.into());
            }
        },
    }
    Ok(())
}

fn log_grid(grid: &ViewGrid) {
    info!("Grid: {}/{} slots occupied", grid.occupied(), grid.slots().len());
    for (i, slot) in grid.slots().iter().enumerate() {
        match slot {
            Slot::Edge(edge) => {
                let load = edge
                    .metrics
                    .as_ref()
                    .map(|m| m.load_level().to_string())
                    .unwrap_or_else(|| "unknown".to_string());
                let stream = if slot.is_live() { "live" } else { "offline" };
                info!("  [{}] {} ({}, load {})", i, edge.id, stream, load);
            }
            Slot::Empty => info!("  [{}] empty", i),
        }
    }
}

fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("edgewatch=info".parse().unwrap())
                .add_directive("edgewatch_center=info".parse().unwrap()),
        )
        .init();
}
