//! End-to-end runs of the whole hierarchy over loopback TCP.

use std::sync::Arc;
use std::time::Duration;

use fuelnet_core::{Commodity, Liters, Price};
use fuelnet_store::{
    Database, DbConfig, PendingQueue, PriceFile, ResourceLedger, UnitStateFile,
};
use fuelnet_sync::{
    Company, ConnectionSupervisor, Distributor, FixedBackoff, HubConfig, HubServer,
    LineConnection, SaleUnit, SaleUnitConfig, ServerHandle, SupervisorConfig, SupervisorHandle,
    SupervisorState, TankClient, TankServer, WireMessage,
};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

const WAIT: Duration = Duration::from_secs(10);

/// Polls `check` until it holds or the wait runs out.
async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + WAIT;
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("timed out waiting for {}", what);
}

fn hub_config() -> HubConfig {
    let mut config = HubConfig::new(0);
    config.bind_addr = "127.0.0.1".into();
    config
}

async fn start_distributor(
    name: &str,
    shutdown: &CancellationToken,
) -> (Arc<Distributor>, ServerHandle) {
    let db = Database::new(DbConfig::in_memory()).await.unwrap();
    let distributor = Arc::new(Distributor::open(name, db).await.unwrap());
    let hub = serve_distributor(&distributor, hub_config(), shutdown).await;
    (distributor, hub)
}

async fn serve_distributor(
    distributor: &Arc<Distributor>,
    config: HubConfig,
    shutdown: &CancellationToken,
) -> ServerHandle {
    HubServer::new(config, distributor.clone(), distributor.registry().clone())
        .start(shutdown.clone())
        .await
        .unwrap()
}

/// Serves the same distributor again on a port a stopped hub used.
async fn serve_again(
    distributor: &Arc<Distributor>,
    port: u16,
    shutdown: &CancellationToken,
) -> ServerHandle {
    let mut config = hub_config();
    config.port = port;
    serve_distributor(distributor, config, shutdown).await
}

async fn next_reply(conn: &mut LineConnection) -> WireMessage {
    conn.reader.next_message().await.unwrap().unwrap().unwrap()
}

async fn ledger_is(distributor: &Distributor, unit_id: &str, liters: u32, charges: u64) -> bool {
    distributor
        .unit_ledger(unit_id)
        .await
        .map(|l| l.total_quantity == Liters::from_whole(liters) && l.total_charges == charges)
        .unwrap_or(false)
}

fn open_pump(dir: &TempDir, unit_id: &str) -> SaleUnit {
    let mut config = SaleUnitConfig::new(unit_id);
    config.dispense_duration = Duration::from_millis(50);
    let queue = PendingQueue::open(dir.path().join(format!("pending_{}.log", unit_id))).unwrap();
    let state = UnitStateFile::new(dir.path().join("unit_state.txt"));
    SaleUnit::open(config, queue, state).unwrap()
}

fn connect_pump(
    pump: &Arc<SaleUnit>,
    parent: &ServerHandle,
    shutdown: &CancellationToken,
) -> SupervisorHandle {
    ConnectionSupervisor::spawn(
        SupervisorConfig::new(parent.local_addr().to_string()),
        pump.clone(),
        Arc::new(FixedBackoff::new(Duration::from_millis(50))),
        shutdown.clone(),
    )
}

#[tokio::test]
async fn test_dispensed_sale_reaches_distributor_ledger() {
    let dir = tempfile::tempdir().unwrap();
    let shutdown = CancellationToken::new();

    let ledger = Arc::new(ResourceLedger::in_memory(Liters::from_whole(1000)));
    let tank = TankServer::new(ledger.clone())
        .start("127.0.0.1:0", shutdown.clone())
        .await
        .unwrap();
    let (distributor, hub) = start_distributor("Norte", &shutdown).await;

    let pump = Arc::new(
        open_pump(&dir, "1").with_tank(TankClient::new(tank.local_addr().to_string())),
    );
    let link = connect_pump(&pump, &hub, &shutdown);
    link.wait_for(SupervisorState::Streaming, WAIT).await.unwrap();

    let cycle = pump
        .begin_dispensing(Commodity::Gasoline95, Liters::from_whole(10))
        .await
        .unwrap();
    assert_eq!(ledger.level(Commodity::Gasoline95), Liters::from_whole(990));

    let d = &distributor;
    eventually("the sale to reach the ledger", move || async move {
        d
            .unit_ledger("1")
            .await
            .map(|l| l.total_quantity == Liters::from_whole(10) && l.total_charges == 1)
            .unwrap_or(false)
    })
    .await;

    cycle.await.unwrap();
    let totals = pump.totals(Commodity::Gasoline95).unwrap();
    assert_eq!(totals.dispensed, Liters::from_whole(10));
    assert_eq!(totals.sale_count, 1);

    shutdown.cancel();
}

#[tokio::test]
async fn test_company_price_reaches_every_pump() {
    let dir = tempfile::tempdir().unwrap();
    let shutdown = CancellationToken::new();

    let company = Arc::new(
        Company::open("Empresa", PriceFile::new(dir.path().join("company_prices.txt"))).unwrap(),
    );
    let company_hub = HubServer::new(hub_config(), company.clone(), company.registry().clone())
        .start(shutdown.clone())
        .await
        .unwrap();

    let (distributor, hub) = start_distributor("Norte", &shutdown).await;
    let uplink = ConnectionSupervisor::spawn(
        SupervisorConfig::new(company_hub.local_addr().to_string()),
        distributor.clone(),
        Arc::new(FixedBackoff::new(Duration::from_millis(50))),
        shutdown.clone(),
    );

    let pumps: Vec<Arc<SaleUnit>> = ["1", "2"]
        .into_iter()
        .map(|id| Arc::new(open_pump(&dir, id)))
        .collect();
    let links: Vec<SupervisorHandle> = pumps
        .iter()
        .map(|p| connect_pump(p, &hub, &shutdown))
        .collect();

    uplink.wait_for(SupervisorState::Streaming, WAIT).await.unwrap();
    for link in &links {
        link.wait_for(SupervisorState::Streaming, WAIT).await.unwrap();
    }
    let (d, c) = (&distributor, &company);
    eventually("both pumps to register", move || async move { d.children().len() == 2 }).await;
    eventually("the distributor to register", move || async move {
        c.distributors() == vec!["Norte".to_string()]
    })
    .await;

    company.set_price(Commodity::Diesel, Price::from_whole(950)).await;

    for pump in &pumps {
        eventually("the new diesel price on a pump", move || async move {
            pump.totals(Commodity::Diesel).map(|t| t.price) == Some(Price::from_whole(950))
        })
        .await;
    }
    assert_eq!(distributor.prices().get(Commodity::Diesel), Some(Price::from_whole(950)));

    shutdown.cancel();
}

#[tokio::test]
async fn test_offline_sales_replay_on_first_connect() {
    let dir = tempfile::tempdir().unwrap();
    let shutdown = CancellationToken::new();
    let (distributor, hub) = start_distributor("Norte", &shutdown).await;

    let pump = Arc::new(open_pump(&dir, "3"));
    assert!(pump.sell(Commodity::Gasoline93, Liters::from_whole(5)));
    assert!(pump.sell(Commodity::Gasoline93, Liters::from_whole(8)));
    assert_eq!(pump.queue().len().unwrap(), 2);

    let link = connect_pump(&pump, &hub, &shutdown);
    link.wait_for(SupervisorState::Streaming, WAIT).await.unwrap();

    let d = &distributor;
    eventually("both queued sales in the ledger", move || async move {
        d
            .unit_ledger("3")
            .await
            .map(|l| l.total_quantity == Liters::from_whole(13) && l.total_charges == 2)
            .unwrap_or(false)
    })
    .await;
    assert!(pump.queue().is_empty().unwrap());

    shutdown.cancel();
}

#[tokio::test]
async fn test_reconnect_with_empty_queue_changes_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let shutdown = CancellationToken::new();
    let (distributor, hub) = start_distributor("Norte", &shutdown).await;

    let pump = Arc::new(open_pump(&dir, "4"));
    let link = connect_pump(&pump, &hub, &shutdown);
    link.wait_for(SupervisorState::Streaming, WAIT).await.unwrap();

    assert!(pump.sell(Commodity::Diesel, Liters::from_whole(4)));
    let d = &distributor;
    eventually("the streamed sale", move || async move { ledger_is(d, "4", 4, 1).await }).await;

    let port = hub.local_addr().port();
    hub.shutdown().await;
    link.wait_for(SupervisorState::Disconnected, WAIT).await.unwrap();
    assert!(pump.queue().is_empty().unwrap());

    let hub = serve_again(&distributor, port, &shutdown).await;
    link.wait_for(SupervisorState::Streaming, WAIT).await.unwrap();
    eventually("the pump to register again", move || async move {
        d.children().len() == 1
    })
    .await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert!(ledger_is(&distributor, "4", 4, 1).await);
    assert!(pump.queue().is_empty().unwrap());

    hub.shutdown().await;
    shutdown.cancel();
}

#[tokio::test]
async fn test_sales_made_while_parent_is_down_arrive_after_reconnect() {
    let dir = tempfile::tempdir().unwrap();
    let shutdown = CancellationToken::new();
    let (distributor, hub) = start_distributor("Norte", &shutdown).await;

    let pump = Arc::new(open_pump(&dir, "5"));
    let link = connect_pump(&pump, &hub, &shutdown);
    link.wait_for(SupervisorState::Streaming, WAIT).await.unwrap();

    assert!(pump.sell(Commodity::Gasoline95, Liters::from_whole(5)));
    let d = &distributor;
    eventually("the online sale", move || async move { ledger_is(d, "5", 5, 1).await }).await;

    let port = hub.local_addr().port();
    hub.shutdown().await;
    link.wait_for(SupervisorState::Disconnected, WAIT).await.unwrap();

    assert!(pump.sell(Commodity::Gasoline95, Liters::from_whole(8)));
    assert!(pump.sell(Commodity::Gasoline95, Liters::from_milli(2_500)));
    assert_eq!(pump.queue().len().unwrap(), 2);
    assert!(ledger_is(&distributor, "5", 5, 1).await);

    let hub = serve_again(&distributor, port, &shutdown).await;
    link.wait_for(SupervisorState::Streaming, WAIT).await.unwrap();

    eventually("the offline sales after reconnect", move || async move {
        d.unit_ledger("5")
            .await
            .map(|l| l.total_quantity == Liters::from_milli(15_500) && l.total_charges == 3)
            .unwrap_or(false)
    })
    .await;
    assert!(pump.queue().is_empty().unwrap());

    let totals = pump.totals(Commodity::Gasoline95).unwrap();
    assert_eq!(totals.dispensed, Liters::from_milli(15_500));
    assert_eq!(totals.sale_count, 3);

    hub.shutdown().await;
    shutdown.cancel();
}

#[tokio::test]
async fn test_oversized_transaction_is_refused_and_session_survives() {
    let shutdown = CancellationToken::new();
    let (distributor, hub) = start_distributor("Norte", &shutdown).await;

    let mut child = LineConnection::connect(&hub.local_addr().to_string(), WAIT)
        .await
        .unwrap();
    assert_eq!(next_reply(&mut child).await, WireMessage::Identify);
    child.link.send(WireMessage::Id("7".into()));
    assert_eq!(next_reply(&mut child).await, WireMessage::ok("Connected to distributor Norte"));
    for _ in 0..Commodity::ALL.len() {
        assert!(matches!(next_reply(&mut child).await, WireMessage::Price { .. }));
    }

    child
        .link
        .send(WireMessage::Other("TRANSACCION 7 93 79228162514264337593543950335".into()));
    assert!(matches!(next_reply(&mut child).await, WireMessage::Error(text) if text.contains("quantity")));

    child.link.send(WireMessage::Other("TRANSACCION 7 93 0.0004".into()));
    assert!(matches!(next_reply(&mut child).await, WireMessage::Error(_)));

    child.link.send(WireMessage::Other("TRANSACCION 7 93 5".into()));
    assert_eq!(next_reply(&mut child).await, WireMessage::ok("Transaction recorded"));

    assert!(ledger_is(&distributor, "7", 5, 1).await);
    assert_eq!(distributor.children().len(), 1);

    hub.shutdown().await;
    shutdown.cancel();
}
