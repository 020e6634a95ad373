//! # Distributor
//!
//! Regional aggregator: hub for pumps, child of the company.
//!
//! ## Message Handling
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  From a pump (hub side)                                                 │
//! │    handshake done     → OK: Connected to distributor <name>             │
//! │                         PRICE <c> <p> for every grade                   │
//! │    TRANSACCION u c q  → ledger upsert → OK: Transaction recorded        │
//! │    REPORTE:<text>     → ACK                                             │
//! │    ESTADO:<body>      → mirrored status for that pump                   │
//! │    OK / ERROR / ACK / PENDIENTE / ID → ignored                          │
//! │    anything else      → logged                                          │
//! │                                                                         │
//! │  From the company (uplink side)                                         │
//! │    PRICE <c> <p>      → cache + SQLite + fan-out to every pump          │
//! │                                                                         │
//! │  To the company                                                         │
//! │    REPORTE_AUTOMATICO <digest> after every handshake and periodically   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fuelnet_core::{
    AggregateRow, Commodity, Liters, Price, PriceTable, UnitStatus, DEFAULT_UNIT_PRICE,
};
use fuelnet_store::{CommodityTotal, Database, PriceRepository};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::SyncResult;
use crate::fanout::PriceBook;
use crate::hub::{ChildSessionHandler, SessionControl};
use crate::protocol::WireMessage;
use crate::registry::ConnectionRegistry;
use crate::supervisor::UplinkSession;
use crate::transport::OutboundHandle;

/// Last `ESTADO:` a pump sent, with when it arrived.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MirroredStatus {
    pub status: UnitStatus,
    pub received_at: DateTime<Utc>,
}

/// Ledger rows of one unit plus their sums.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitLedger {
    pub rows: Vec<AggregateRow>,
    pub total_quantity: Liters,
    pub total_charges: u64,
}

/// A regional distributor.
pub struct Distributor {
    name: String,
    db: Database,
    prices: PriceBook<PriceRepository>,
    registry: Arc<ConnectionRegistry>,
    statuses: RwLock<HashMap<String, MirroredStatus>>,
    upstream: Mutex<Option<OutboundHandle>>,
}

impl Distributor {
    /// Builds a distributor on an open database, restoring cached prices.
    pub async fn open(name: impl Into<String>, db: Database) -> SyncResult<Self> {
        let name = name.into();
        let registry = Arc::new(ConnectionRegistry::new());
        let table = db
            .prices()
            .load_or(PriceTable::uniform(Price::from_whole(DEFAULT_UNIT_PRICE)))
            .await?;
        info!(%name, grades = table.len(), "Distributor opened");

        Ok(Distributor {
            prices: PriceBook::new(table, db.prices(), Arc::clone(&registry)),
            name,
            db,
            registry,
            statuses: RwLock::new(HashMap::new()),
            upstream: Mutex::new(None),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    // =========================================================================
    // Operator Operations
    // =========================================================================

    /// Ids of the pumps connected right now.
    pub fn children(&self) -> Vec<String> {
        self.registry.ids()
    }

    /// Asks one pump for its status. The answer shows up in
    /// [`Distributor::child_status`].
    pub fn request_status(&self, unit_id: &str) -> bool {
        self.registry.send_to(unit_id, WireMessage::StatusRequest)
    }

    pub fn child_status(&self, unit_id: &str) -> Option<MirroredStatus> {
        self.statuses
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(unit_id)
            .cloned()
    }

    /// Sets a price locally, persists it and pushes it to every pump.
    pub async fn set_price(&self, commodity: Commodity, price: Price) -> usize {
        self.prices.set_price(commodity, price).await
    }

    pub fn prices(&self) -> PriceTable {
        self.prices.snapshot()
    }

    /// Every ledger row.
    pub async fn ledger(&self) -> SyncResult<Vec<AggregateRow>> {
        Ok(self.db.sales().all().await?)
    }

    /// One unit's rows with totals.
    pub async fn unit_ledger(&self, unit_id: &str) -> SyncResult<UnitLedger> {
        let rows = self.db.sales().for_unit(unit_id).await?;
        Ok(UnitLedger {
            total_quantity: rows.iter().map(|r| r.quantity).sum(),
            total_charges: rows.iter().map(|r| r.charge_count).sum(),
            rows,
        })
    }

    pub async fn commodity_totals(&self) -> SyncResult<Vec<CommodityTotal>> {
        Ok(self.db.sales().totals_by_commodity().await?)
    }

    // =========================================================================
    // Reports
    // =========================================================================

    /// Builds the digest sent upward: `<name>|<c>:<liters>:<sales>|...`.
    pub async fn report_digest(&self) -> SyncResult<String> {
        let totals = self.commodity_totals().await?;
        let mut digest = self.name.clone();
        for total in totals {
            digest.push_str(&format!(
                "|{}:{}:{}",
                total.commodity, total.quantity, total.charge_count
            ));
        }
        Ok(digest)
    }

    /// Sends a digest if the company link is up. Returns whether it was sent.
    pub async fn send_report(&self) -> bool {
        let Some(link) = self.upstream_link() else {
            debug!(name = %self.name, "No company link; report skipped");
            return false;
        };
        match self.report_digest().await {
            Ok(digest) => link.send(WireMessage::AutomaticReport(digest)),
            Err(e) => {
                warn!(name = %self.name, error = %e, "Could not build report");
                false
            }
        }
    }

    /// Sends a digest every `interval` until `shutdown` fires.
    pub fn spawn_report_task(
        self: &Arc<Self>,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let distributor = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        if distributor.send_report().await {
                            debug!(name = %distributor.name, "Periodic report sent");
                        }
                    }
                }
            }
        })
    }

    fn upstream_link(&self) -> Option<OutboundHandle> {
        self.upstream
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    // =========================================================================
    // Pump Messages
    // =========================================================================

    async fn record_transaction(
        &self,
        child_id: &str,
        unit_id: &str,
        commodity: Commodity,
        quantity: Liters,
    ) -> WireMessage {
        if !quantity.is_positive() {
            warn!(%child_id, %quantity, "Rejected non-positive transaction");
            return WireMessage::error("Invalid transaction: quantity must be positive");
        }
        if unit_id != child_id {
            debug!(%child_id, %unit_id, "Transaction for a different unit id than the session");
        }

        match self.db.sales().record(unit_id, commodity, quantity).await {
            Ok(row) => {
                info!(
                    %unit_id,
                    %commodity,
                    %quantity,
                    total = %row.quantity,
                    charges = row.charge_count,
                    "Transaction recorded"
                );
                WireMessage::ok("Transaction recorded")
            }
            Err(e) => {
                error!(%unit_id, %commodity, %quantity, error = %e, "Failed to record transaction");
                WireMessage::error("Could not record transaction")
            }
        }
    }
}

// =============================================================================
// Hub Side
// =============================================================================

#[async_trait]
impl ChildSessionHandler for Distributor {
    fn hub_name(&self) -> String {
        format!("distributor {}", self.name)
    }

    async fn on_registered(&self, child_id: &str, link: &OutboundHandle) {
        link.send(WireMessage::ok(format!("Connected to distributor {}", self.name)));
        if self.prices.send_snapshot(link) {
            debug!(%child_id, "Price snapshot sent");
        }
    }

    async fn on_message(
        &self,
        child_id: &str,
        message: WireMessage,
        link: &OutboundHandle,
    ) -> SessionControl {
        match message {
            WireMessage::Transaction {
                unit_id,
                commodity,
                quantity,
            } => {
                let reply = self
                    .record_transaction(child_id, &unit_id, commodity, quantity)
                    .await;
                link.send(reply);
            }
            WireMessage::Report(text) => {
                info!(%child_id, report = %text, "Report from pump");
                link.send(WireMessage::Ack);
            }
            WireMessage::Status(status) => {
                info!(%child_id, status = %status.to_body(), "Pump status");
                self.statuses
                    .write()
                    .unwrap_or_else(|e| e.into_inner())
                    .insert(
                        child_id.to_string(),
                        MirroredStatus {
                            status,
                            received_at: Utc::now(),
                        },
                    );
            }
            m if m.is_acknowledgement() => {
                debug!(%child_id, reply = %m, "Pump reply");
            }
            other => {
                info!(%child_id, line = %other, "Message from pump");
            }
        }
        SessionControl::Continue
    }

    async fn on_disconnected(&self, child_id: &str) {
        info!(%child_id, remaining = self.registry.len(), "Pump left");
    }
}

// =============================================================================
// Uplink Side
// =============================================================================

#[async_trait]
impl UplinkSession for Distributor {
    fn node_id(&self) -> String {
        self.name.clone()
    }

    async fn on_connected(&self, link: &OutboundHandle) -> SyncResult<()> {
        *self.upstream.lock().unwrap_or_else(|e| e.into_inner()) = Some(link.clone());
        if self.send_report().await {
            debug!(name = %self.name, "Report sent after handshake");
        }
        Ok(())
    }

    async fn on_message(&self, message: WireMessage, _link: &OutboundHandle) {
        match message {
            WireMessage::Price { commodity, price } => {
                let pumps = self.prices.set_price(commodity, price).await;
                if pumps == 0 {
                    info!(%commodity, %price, "Company price cached; no pumps connected");
                }
            }
            m if m.is_acknowledgement() => {
                debug!(reply = %m, "Company reply");
            }
            other => {
                debug!(kind = other.kind(), "Ignoring message from company");
            }
        }
    }

    async fn on_disconnected(&self) {
        if self
            .upstream
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .is_some()
        {
            info!(name = %self.name, "Company link lost");
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::LineConnection;
    use fuelnet_store::DbConfig;
    use tokio::net::TcpListener;

    async fn distributor() -> Distributor {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        Distributor::open("Norte", db).await.unwrap()
    }

    async fn wire() -> (OutboundHandle, LineConnection) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let (client, accepted) = tokio::join!(
            LineConnection::connect(&addr, std::time::Duration::from_secs(5)),
            listener.accept()
        );
        let server = LineConnection::from_stream(accepted.unwrap().0).unwrap();
        (server.link, client.unwrap())
    }

    async fn next(conn: &mut LineConnection) -> WireMessage {
        conn.reader.next_message().await.unwrap().unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_transactions_fold_into_ledger() {
        let d = distributor().await;
        let (link, mut pump) = wire().await;

        for qty in [5, 8] {
            ChildSessionHandler::on_message(
                &d,
                "2",
                WireMessage::Transaction {
                    unit_id: "2".into(),
                    commodity: Commodity::Gasoline93,
                    quantity: Liters::from_whole(qty),
                },
                &link,
            )
            .await;
            assert_eq!(next(&mut pump).await, WireMessage::ok("Transaction recorded"));
        }

        let ledger = d.unit_ledger("2").await.unwrap();
        assert_eq!(ledger.rows.len(), 1);
        assert_eq!(ledger.total_quantity, Liters::from_whole(13));
        assert_eq!(ledger.total_charges, 2);
    }

    #[tokio::test]
    async fn test_non_positive_transaction_rejected() {
        let d = distributor().await;
        let (link, mut pump) = wire().await;

        ChildSessionHandler::on_message(
            &d,
            "2",
            WireMessage::Transaction {
                unit_id: "2".into(),
                commodity: Commodity::Diesel,
                quantity: Liters::ZERO,
            },
            &link,
        )
        .await;
        assert!(matches!(next(&mut pump).await, WireMessage::Error(_)));
        assert!(d.ledger().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_registration_sends_greeting_and_snapshot() {
        let d = distributor().await;
        let (link, mut pump) = wire().await;

        d.on_registered("1", &link).await;
        assert_eq!(next(&mut pump).await, WireMessage::ok("Connected to distributor Norte"));
        for _ in 0..Commodity::ALL.len() {
            assert!(matches!(next(&mut pump).await, WireMessage::Price { .. }));
        }
    }

    #[tokio::test]
    async fn test_status_is_mirrored_and_report_acked() {
        let d = distributor().await;
        let (link, mut pump) = wire().await;

        let status = UnitStatus::parse_body("1|93:100:15:2;").unwrap();
        ChildSessionHandler::on_message(&d, "1", WireMessage::Status(status.clone()), &link).await;
        assert_eq!(d.child_status("1").unwrap().status, status);

        ChildSessionHandler::on_message(&d, "1", WireMessage::Report("all good".into()), &link).await;
        assert_eq!(next(&mut pump).await, WireMessage::Ack);
    }

    #[tokio::test]
    async fn test_company_price_is_cached_without_pumps() {
        let d = distributor().await;
        let (company, _peer) = wire().await;

        UplinkSession::on_message(
            &d,
            WireMessage::Price {
                commodity: Commodity::Diesel,
                price: Price::from_whole(950),
            },
            &company,
        )
        .await;

        assert_eq!(d.prices().get(Commodity::Diesel), Some(Price::from_whole(950)));
        let reopened = d.db.prices().load_or(PriceTable::default()).await.unwrap();
        assert_eq!(reopened.get(Commodity::Diesel), Some(Price::from_whole(950)));
    }

    #[tokio::test]
    async fn test_digest_goes_up_on_connect() {
        let d = distributor().await;
        d.db
            .sales()
            .record("1", Commodity::Gasoline95, Liters::from_whole(10))
            .await
            .unwrap();

        let (company, mut peer) = wire().await;
        UplinkSession::on_connected(&d, &company).await.unwrap();

        assert_eq!(
            next(&mut peer).await,
            WireMessage::AutomaticReport("Norte|95:10:1".into())
        );
    }
}
