//! # FuelNet Distributor
//!
//! Regional aggregator: accepts pumps, records their sales in SQLite, relays
//! company prices down and sends digests up.
//!
//! ```text
//!              company :7000
//!                  ▲   │ PRECIO
//!   REPORTE_AUTO.. │   ▼
//!        ┌──────────────────────┐        ┌──────────────┐
//!        │ Distributor          │──────► │ tank :5000   │ operator
//!        │  uplink  · HubServer │        └──────────────┘ REPONER/...
//!        └──────────▲───────────┘
//!                   │ TRANSACCION / ESTADO:
//!              pumps (:6000)
//! ```

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use fuelnet_core::UnitStatus;
use fuelnet_station::console::{parse_distributor, Console, DistributorCommand, DISTRIBUTOR_HELP};
use fuelnet_station::{init_tracing, load_config, spawn_shutdown_listener};
use fuelnet_store::{Database, DbConfig};
use fuelnet_sync::{ConnectionSupervisor, Distributor, HubServer, Role, TankClient};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    info!("Starting FuelNet distributor...");

    let config = load_config(Role::Distributor)?;
    let data_dir = config.data_dir();
    std::fs::create_dir_all(&data_dir)
        .with_context(|| format!("creating data directory {}", data_dir.display()))?;

    let db = Database::new(DbConfig::new(data_dir.join("distributor.db"))).await?;
    let distributor = Arc::new(Distributor::open(config.node_name(Role::Distributor), db).await?);
    info!(name = %distributor.name(), "Distributor ledger opened");

    let shutdown = CancellationToken::new();
    spawn_shutdown_listener(shutdown.clone());

    let hub = HubServer::new(
        config.hub_config(Role::Distributor),
        distributor.clone(),
        distributor.registry().clone(),
    )
    .start(shutdown.clone())
    .await?;

    let upstream = config
        .supervisor_config(Role::Distributor)
        .context("distributor needs an upstream company address")?;
    info!(addr = %hub.local_addr(), parent = %upstream.parent_addr, "Distributor ready");
    let uplink = ConnectionSupervisor::spawn(
        upstream,
        distributor.clone(),
        config.backoff_policy(Role::Distributor),
        shutdown.clone(),
    );
    let reports = distributor.spawn_report_task(
        Duration::from_secs(config.report.interval_secs),
        shutdown.clone(),
    );
    let tank = TankClient::new(config.tank.addr.clone());

    let mut console = Console::stdin(format!("distributor {}", distributor.name()));
    while let Some(line) = console.next_line(&shutdown).await {
        match parse_distributor(&line) {
            Ok(None) => {}
            Ok(Some(DistributorCommand::Quit)) => break,
            Ok(Some(command)) => {
                if let Err(e) = run(&distributor, &tank, command).await {
                    println!("ERROR: {}", e);
                }
            }
            Err(e) => println!("{}", e),
        }
    }

    shutdown.cancel();
    hub.shutdown().await;
    uplink.shutdown().await;
    if let Err(e) = reports.await {
        warn!(?e, "Report task ended abnormally");
    }

    info!("Distributor shutdown complete");
    Ok(())
}

async fn run(
    distributor: &Distributor,
    tank: &TankClient,
    command: DistributorCommand,
) -> anyhow::Result<()> {
    match command {
        DistributorCommand::Units => {
            let units = distributor.children();
            if units.is_empty() {
                println!("No pumps connected");
            }
            for unit in units {
                match distributor.child_status(&unit) {
                    Some(mirrored) => println!(
                        "  {} (status from {})",
                        unit,
                        mirrored.received_at.format(TIME_FORMAT)
                    ),
                    None => println!("  {}", unit),
                }
            }
        }
        DistributorCommand::UnitStatus(unit) => {
            if let Some(mirrored) = distributor.child_status(&unit) {
                println!("Last status, {}:", mirrored.received_at.format(TIME_FORMAT));
                print_status(&mirrored.status);
            }
            if distributor.request_status(&unit) {
                println!("Status requested from unit {}", unit);
            } else {
                println!("Unit {} is not connected", unit);
            }
        }
        DistributorCommand::SetPrice(commodity, price) => {
            let notified = distributor.set_price(commodity, price).await;
            println!("Price of {} set to {} ({} pump(s) notified)", commodity, price, notified);
        }
        DistributorCommand::Prices => {
            for (commodity, price) in distributor.prices().iter() {
                println!("  {:<9} {}", commodity, price);
            }
        }
        DistributorCommand::Ledger(None) => {
            for row in distributor.ledger().await? {
                println!(
                    "  unit {:<6} {:<9} {:>10} L  {:>4} charge(s)  {}",
                    row.unit_id,
                    row.commodity,
                    row.quantity,
                    row.charge_count,
                    row.updated_at.format(TIME_FORMAT)
                );
            }
        }
        DistributorCommand::Ledger(Some(unit)) => {
            let ledger = distributor.unit_ledger(&unit).await?;
            for row in &ledger.rows {
                println!(
                    "  {:<9} {:>10} L  {:>4} charge(s)",
                    row.commodity, row.quantity, row.charge_count
                );
            }
            println!(
                "Unit {}: {} L in {} charge(s)",
                unit, ledger.total_quantity, ledger.total_charges
            );
        }
        DistributorCommand::Totals => {
            for total in distributor.commodity_totals().await? {
                println!(
                    "  {:<9} {:>10} L  {:>4} charge(s)",
                    total.commodity, total.quantity, total.charge_count
                );
            }
        }
        DistributorCommand::Report => {
            if distributor.send_report().await {
                println!("Report sent to the company");
            } else {
                println!("Not connected to the company");
            }
        }
        DistributorCommand::Tank(request) => {
            let reply = tank
                .request(request)
                .await
                .with_context(|| format!("tank at {} unreachable", tank.addr()))?;
            println!("{}", reply);
        }
        DistributorCommand::Help => println!("{}", DISTRIBUTOR_HELP),
        DistributorCommand::Quit => {}
    }
    Ok(())
}

fn print_status(status: &UnitStatus) {
    for (commodity, totals) in &status.fuels {
        println!(
            "  {:<9} price {:>8}  {} L in {} sale(s)",
            commodity, totals.price, totals.dispensed, totals.sale_count
        );
    }
}
