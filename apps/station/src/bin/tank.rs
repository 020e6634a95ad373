//! # FuelNet Tank
//!
//! Serves the resource ledger to pumps and distributors.
//!
//! ```text
//!   pump ──EXTRAER──►┐
//!                    ├──► TankServer :5000 ──► ResourceLedger ──► tank_levels.txt
//!   distributor ─────┘                               ▲
//!     REPONER / CONSULTAR / ESTADO                   └── autosave every 30 s
//! ```

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use fuelnet_core::Liters;
use fuelnet_station::console::{parse_tank, Console, TankCommand, TANK_HELP};
use fuelnet_station::{init_tracing, load_config, spawn_shutdown_listener};
use fuelnet_store::ResourceLedger;
use fuelnet_sync::tank::handle_request;
use fuelnet_sync::{Role, TankServer};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    info!("Starting FuelNet tank...");

    let config = load_config(Role::Tank)?;
    let data_dir = config.data_dir();
    std::fs::create_dir_all(&data_dir)
        .with_context(|| format!("creating data directory {}", data_dir.display()))?;

    let ledger = Arc::new(ResourceLedger::open(
        data_dir.join("tank_levels.txt"),
        Liters::from_whole(config.tank.initial_level),
    )?);
    info!(levels = ?ledger.snapshot(), "Tank levels loaded");

    let shutdown = CancellationToken::new();
    spawn_shutdown_listener(shutdown.clone());

    let autosave = ledger.spawn_autosave(
        Duration::from_secs(config.tank.autosave_secs),
        shutdown.clone(),
    );
    let bind = config.hub_config(Role::Tank).bind_address();
    let server = TankServer::new(ledger.clone())
        .start(&bind, shutdown.clone())
        .await?;
    info!(addr = %server.local_addr(), "Tank ready");

    let mut console = Console::stdin("tank");
    while let Some(line) = console.next_line(&shutdown).await {
        match parse_tank(&line) {
            Ok(None) => {}
            Ok(Some(TankCommand::Request(request))) => {
                println!("{}", handle_request(&ledger, request));
            }
            Ok(Some(TankCommand::Help)) => println!("{}", TANK_HELP),
            Ok(Some(TankCommand::Quit)) => break,
            Err(e) => println!("{}", e),
        }
    }

    shutdown.cancel();
    server.shutdown().await;
    if let Err(e) = autosave.await {
        warn!(?e, "Autosave task ended abnormally");
    }
    if let Err(e) = ledger.save() {
        warn!(?e, "Final tank save failed");
    }

    info!("Tank shutdown complete");
    Ok(())
}
