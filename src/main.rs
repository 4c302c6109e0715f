//! Torfleet - Entry Point
//!
//! Plants a daemon fleet from environment settings, optionally exposes a
//! rotating HTTP bridge, and tears everything down on Ctrl-C.

use std::time::Duration;

use tokio::signal;
use tokio::time::{sleep, timeout};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use torfleet::{Farm, FarmSettings, FleetSpec, RotatingBridgeProxy};

/// How long to wait for every member to terminate before giving up.
const TERMINATION_WAIT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> torfleet::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "torfleet=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Torfleet");

    let settings = FarmSettings::from_env()?;
    info!(
        root = %settings.root_dir.display(),
        count = settings.count,
        "settings loaded"
    );

    let mut farm = Farm::open_with_binary(&settings.root_dir, &settings.daemon_binary)?;
    let fleet = farm.plant_fleet(FleetSpec {
        count: settings.count,
        socks_start: settings.socks_start,
        print_log: settings.print_log,
        ..FleetSpec::default()
    })?;
    fleet.start();

    if let Some(bridge_addr) = settings.bridge.clone() {
        let bridge = RotatingBridgeProxy::bind(fleet.clone(), Some(bridge_addr)).await?;
        info!(addr = %bridge.local_addr(), "rotating bridge bound");
        bridge.spawn();
    }

    signal::ctrl_c().await?;
    info!("Shutdown signal received");

    fleet.stop();
    let drained = timeout(TERMINATION_WAIT, async {
        while !fleet.all_terminated() {
            sleep(Duration::from_millis(200)).await;
        }
    })
    .await;
    match drained {
        Ok(()) => info!("All instances terminated"),
        Err(_) => warn!("Termination wait elapsed with instances still up"),
    }

    Ok(())
}
