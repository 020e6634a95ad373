//! # FuelNet Company
//!
//! Root of the hierarchy: owns the authoritative price table and collects
//! distributor reports.

use std::sync::Arc;

use anyhow::Context;
use fuelnet_station::console::{parse_company, CompanyCommand, Console, COMPANY_HELP};
use fuelnet_station::{init_tracing, load_config, spawn_shutdown_listener};
use fuelnet_store::PriceFile;
use fuelnet_sync::{Company, HubServer, Role};
use tokio_util::sync::CancellationToken;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    info!("Starting FuelNet company...");

    let config = load_config(Role::Company)?;
    let data_dir = config.data_dir();
    std::fs::create_dir_all(&data_dir)
        .with_context(|| format!("creating data directory {}", data_dir.display()))?;

    let company = Arc::new(Company::open(
        config.node_name(Role::Company),
        PriceFile::new(data_dir.join("company_prices.txt")),
    )?);

    let shutdown = CancellationToken::new();
    spawn_shutdown_listener(shutdown.clone());

    let hub = HubServer::new(
        config.hub_config(Role::Company),
        company.clone(),
        company.registry().clone(),
    )
    .start(shutdown.clone())
    .await?;
    info!(name = %company.name(), addr = %hub.local_addr(), "Company ready");

    let mut console = Console::stdin(format!("company {}", company.name()));
    while let Some(line) = console.next_line(&shutdown).await {
        match parse_company(&line) {
            Ok(None) => {}
            Ok(Some(CompanyCommand::Quit)) => break,
            Ok(Some(command)) => run(&company, command).await,
            Err(e) => println!("{}", e),
        }
    }

    shutdown.cancel();
    hub.shutdown().await;

    info!("Company shutdown complete");
    Ok(())
}

async fn run(company: &Company, command: CompanyCommand) {
    match command {
        CompanyCommand::SetPrice(commodity, price) => {
            let notified = company.set_price(commodity, price).await;
            println!(
                "Price of {} set to {} ({} distributor(s) notified)",
                commodity, price, notified
            );
        }
        CompanyCommand::SetPrices(prices) => {
            let changed = prices.len();
            let sent = company.set_prices(prices).await;
            println!("{} price(s) updated ({} message(s) sent)", changed, sent);
        }
        CompanyCommand::Prices => {
            for (commodity, price) in company.prices().iter() {
                println!("  {:<9} {}", commodity, price);
            }
        }
        CompanyCommand::Push => {
            let sent = company.push_all_prices();
            println!("Price table pushed ({} message(s) sent)", sent);
        }
        CompanyCommand::Distributors => {
            let distributors = company.distributors();
            if distributors.is_empty() {
                println!("No distributors connected");
            }
            for name in distributors {
                println!("  {}", name);
            }
        }
        CompanyCommand::Reports => {
            let reports = company.reports();
            if reports.is_empty() {
                println!("No reports received");
            }
            for entry in reports {
                println!(
                    "[{}] {}: {}",
                    entry.received_at.format("%Y-%m-%d %H:%M:%S"),
                    entry.from,
                    entry.body
                );
            }
        }
        CompanyCommand::Help => println!("{}", COMPANY_HELP),
        CompanyCommand::Quit => {}
    }
}
