//! # FuelNet Pump
//!
//! One sale unit: sells fuel, draws it from the tank and reports every sale
//! to its distributor, queueing sales on disk while the distributor is away.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use fuelnet_station::console::{parse_pump, Console, PumpCommand, PUMP_HELP};
use fuelnet_station::{init_tracing, load_config, spawn_shutdown_listener};
use fuelnet_store::{resolve_unit_id, PendingQueue, UnitStateFile};
use fuelnet_sync::{
    ConnectionSupervisor, Role, SaleUnit, SaleUnitConfig, SupervisorHandle, TankClient,
};
use tokio_util::sync::CancellationToken;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    info!("Starting FuelNet pump...");

    let config = load_config(Role::Pump)?;
    let data_dir = config.data_dir();
    std::fs::create_dir_all(&data_dir)
        .with_context(|| format!("creating data directory {}", data_dir.display()))?;

    let queue = PendingQueue::open(data_dir.join("pending_sales.log"))?;
    let state_file = UnitStateFile::new(data_dir.join("unit_state.txt"));
    let (unit_id, source) = resolve_unit_id(
        config.node.id.as_deref(),
        &queue,
        &state_file,
        config.sale.max_unit_slots,
    )?;
    info!(%unit_id, ?source, "Unit identity resolved");

    let mut unit_config = SaleUnitConfig::new(unit_id);
    unit_config.carried = config.carried();
    unit_config.dispense_duration = Duration::from_secs(config.sale.dispense_secs);
    let unit = Arc::new(
        SaleUnit::open(unit_config, queue, state_file)?
            .with_tank(TankClient::new(config.tank.addr.clone())),
    );

    let shutdown = CancellationToken::new();
    spawn_shutdown_listener(shutdown.clone());

    let upstream = config
        .supervisor_config(Role::Pump)
        .context("pump needs an upstream distributor address")?;
    info!(parent = %upstream.parent_addr, tank = %config.tank.addr, "Pump ready");
    let uplink = ConnectionSupervisor::spawn(
        upstream,
        unit.clone(),
        config.backoff_policy(Role::Pump),
        shutdown.clone(),
    );

    let mut console = Console::stdin(format!("pump {}", unit.unit_id()));
    while let Some(line) = console.next_line(&shutdown).await {
        match parse_pump(&line) {
            Ok(None) => {}
            Ok(Some(PumpCommand::Quit)) => break,
            Ok(Some(command)) => run(&unit, &uplink, command).await,
            Err(e) => println!("{}", e),
        }
    }

    shutdown.cancel();
    uplink.shutdown().await;
    unit.persist();

    info!("Pump shutdown complete");
    Ok(())
}

async fn run(unit: &Arc<SaleUnit>, uplink: &SupervisorHandle, command: PumpCommand) {
    match command {
        PumpCommand::Sell(commodity, liters) => {
            if unit.sell(commodity, liters) {
                println!("Sold {} L of {}", liters, commodity);
            } else {
                println!("{} is not sold here", commodity);
            }
        }
        PumpCommand::Dispense(commodity, liters) => {
            match unit.begin_dispensing(commodity, liters).await {
                Ok(_cycle) => println!("Dispensing {} L of {}", liters, commodity),
                Err(e) => println!("ERROR: {}", e),
            }
        }
        PumpCommand::Status => {
            println!(
                "Unit {} · dispenser {} · uplink {}",
                unit.unit_id(),
                unit.dispenser_state(),
                uplink.state()
            );
            for (commodity, totals) in unit.status().fuels {
                let pending = unit
                    .pending_price(commodity)
                    .map(|p| format!(" (next {})", p))
                    .unwrap_or_default();
                println!(
                    "  {:<9} price {:>8}{}  {} L in {} sale(s)",
                    commodity, totals.price, pending, totals.dispensed, totals.sale_count
                );
            }
        }
        PumpCommand::Queue => match unit.queue().len() {
            Ok(n) => println!("{} sale(s) waiting for the distributor", n),
            Err(e) => println!("ERROR: {}", e),
        },
        PumpCommand::Help => println!("{}", PUMP_HELP),
        PumpCommand::Quit => {}
    }
}
