//! # Sale Unit
//!
//! A pump: per-commodity totals, a dispenser that is either idle or busy,
//! and the uplink to its distributor.
//!
//! ## Sale Path
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  begin_dispensing(c, q)                                                 │
//! │    IDLE ─► BUSY ─► tank EXTRAER ─► sell(c, q) ─► timer ─► IDLE          │
//! │                         │ refused                   apply_pending_prices│
//! │                         └──► IDLE                                       │
//! │                                                                         │
//! │  sell(c, q)                                                             │
//! │    totals += q, count += 1                                              │
//! │    uplink lock ─┬─ streaming and link open ──► TRANSACCION u c q        │
//! │                 └─ otherwise ───────────────► pending_sales.log         │
//! │    unit_state.txt rewritten                                             │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Reconnect Replay
//! ```text
//! on_connected(link)
//!   loop:
//!     begin_replay ── None ──► [uplink lock] queue empty? ── yes ──► publish link
//!          │                                           └─ no ──► loop
//!          ▼
//!     send each own record, discard foreign ids
//!     flush ── ok ──► commit_replay ──► loop
//!          └── err ─► abort_replay (records back in front) ──► Err
//! ```
//!
//! A sale made while the replay is in flight finds no published link and is
//! queued; the publish step only happens once the queue is seen empty under
//! the uplink lock, so nothing is streamed ahead of older queued records.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use fuelnet_core::{
    Commodity, CoreError, DispenserState, FuelTotals, Liters, PendingTransaction, Price,
    PriceOutcome, UnitStatus, ValidationError,
};
use fuelnet_store::{PendingQueue, UnitStateFile, UnitTotals};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::{SyncError, SyncResult};
use crate::protocol::WireMessage;
use crate::supervisor::UplinkSession;
use crate::tank::TankClient;
use crate::transport::OutboundHandle;

/// How long one dispensing cycle keeps the unit busy.
pub const DEFAULT_DISPENSE_DURATION: Duration = Duration::from_secs(20);

// =============================================================================
// Configuration
// =============================================================================

/// Settings for one sale unit.
#[derive(Debug, Clone)]
pub struct SaleUnitConfig {
    pub unit_id: String,

    /// Commodities this unit sells.
    pub carried: Vec<Commodity>,

    /// Price for a commodity with no saved state.
    pub initial_price: Price,

    pub dispense_duration: Duration,
}

impl SaleUnitConfig {
    pub fn new(unit_id: impl Into<String>) -> Self {
        SaleUnitConfig {
            unit_id: unit_id.into(),
            carried: Commodity::ALL.to_vec(),
            initial_price: Price::from_whole(fuelnet_core::DEFAULT_UNIT_PRICE),
            dispense_duration: DEFAULT_DISPENSE_DURATION,
        }
    }
}

// =============================================================================
// Sale Unit
// =============================================================================

#[derive(Debug, Default)]
struct Dispenser {
    fuels: UnitTotals,
    pending_prices: BTreeMap<Commodity, Price>,
    state: DispenserState,
}

#[derive(Debug, Default)]
struct Uplink {
    outbound: Option<OutboundHandle>,
}

/// One pump.
pub struct SaleUnit {
    unit_id: String,
    dispenser: Mutex<Dispenser>,
    uplink: Mutex<Uplink>,
    queue: PendingQueue,
    state_file: UnitStateFile,
    save_lock: Mutex<()>,
    tank: Option<TankClient>,
    dispense_duration: Duration,
}

impl SaleUnit {
    /// Builds a unit, loading saved totals for its id.
    ///
    /// Saved totals for commodities the unit does not carry are ignored.
    /// A restart always comes back idle.
    pub fn open(
        config: SaleUnitConfig,
        queue: PendingQueue,
        state_file: UnitStateFile,
    ) -> SyncResult<Self> {
        let saved = state_file.load(&config.unit_id)?;
        let fuels: UnitTotals = config
            .carried
            .iter()
            .map(|c| {
                let totals = saved
                    .get(c)
                    .copied()
                    .unwrap_or_else(|| FuelTotals::priced(config.initial_price));
                (*c, totals)
            })
            .collect();

        info!(
            unit_id = %config.unit_id,
            carried = fuels.len(),
            restored = saved.len(),
            "Sale unit opened"
        );

        Ok(SaleUnit {
            unit_id: config.unit_id,
            dispenser: Mutex::new(Dispenser {
                fuels,
                ..Default::default()
            }),
            uplink: Mutex::new(Uplink::default()),
            queue,
            state_file,
            save_lock: Mutex::new(()),
            tank: None,
            dispense_duration: config.dispense_duration,
        })
    }

    /// Draws fuel from this tank when dispensing.
    pub fn with_tank(mut self, tank: TankClient) -> Self {
        self.tank = Some(tank);
        self
    }

    pub fn unit_id(&self) -> &str {
        &self.unit_id
    }

    pub fn queue(&self) -> &PendingQueue {
        &self.queue
    }

    fn dispenser(&self) -> MutexGuard<'_, Dispenser> {
        self.dispenser.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn uplink(&self) -> MutexGuard<'_, Uplink> {
        self.uplink.lock().unwrap_or_else(|e| e.into_inner())
    }

    // =========================================================================
    // Sales
    // =========================================================================

    /// Records a sale and reports it upward.
    ///
    /// Returns false, changing nothing, if the unit does not carry
    /// `commodity` or `quantity` is not positive. Never waits on the network.
    pub fn sell(&self, commodity: Commodity, quantity: Liters) -> bool {
        if !quantity.is_positive() {
            return false;
        }
        {
            let mut dispenser = self.dispenser();
            let Some(totals) = dispenser.fuels.get_mut(&commodity) else {
                return false;
            };
            totals.record_sale(quantity);
        }

        self.deliver(PendingTransaction::now(&self.unit_id, commodity, quantity));
        self.persist();
        true
    }

    /// Streams a sale if a live link is published, otherwise queues it.
    fn deliver(&self, record: PendingTransaction) {
        let mut uplink = self.uplink();

        if let Some(link) = &uplink.outbound {
            if link.send(transaction_message(&record)) {
                debug!(unit_id = %self.unit_id, commodity = %record.commodity, quantity = %record.quantity, "Sale streamed");
                return;
            }
            info!(unit_id = %self.unit_id, "Uplink closed under us; queuing");
            uplink.outbound = None;
        }

        match self.queue.append(&record) {
            Ok(()) => info!(
                unit_id = %self.unit_id,
                commodity = %record.commodity,
                quantity = %record.quantity,
                "Sale queued for replay"
            ),
            Err(e) => error!(unit_id = %self.unit_id, error = %e, "Failed to queue sale"),
        }
    }

    // =========================================================================
    // Prices
    // =========================================================================

    /// Changes a price now, or after the current sale if the unit is busy.
    pub fn set_price(&self, commodity: Commodity, price: Price) -> PriceOutcome {
        let outcome = {
            let mut dispenser = self.dispenser();
            if !dispenser.fuels.contains_key(&commodity) {
                PriceOutcome::UnknownCommodity
            } else if dispenser.state == DispenserState::Busy {
                dispenser.pending_prices.insert(commodity, price);
                PriceOutcome::Deferred
            } else {
                if let Some(totals) = dispenser.fuels.get_mut(&commodity) {
                    totals.price = price;
                }
                PriceOutcome::Applied
            }
        };

        match outcome {
            PriceOutcome::Applied => {
                info!(unit_id = %self.unit_id, %commodity, %price, "Price applied");
                self.persist();
            }
            PriceOutcome::Deferred => {
                info!(unit_id = %self.unit_id, %commodity, %price, "Price deferred until sale completes")
            }
            PriceOutcome::UnknownCommodity => {
                warn!(unit_id = %self.unit_id, %commodity, "Price for a commodity not sold here")
            }
        }
        outcome
    }

    /// Applies and clears every deferred price. Returns how many applied.
    pub fn apply_pending_prices(&self) -> usize {
        let applied = {
            let mut dispenser = self.dispenser();
            let pending = std::mem::take(&mut dispenser.pending_prices);
            let count = pending.len();
            for (commodity, price) in pending {
                if let Some(totals) = dispenser.fuels.get_mut(&commodity) {
                    totals.price = price;
                }
            }
            count
        };

        if applied > 0 {
            info!(unit_id = %self.unit_id, applied, "Deferred prices applied");
            self.persist();
        }
        applied
    }

    pub fn pending_price(&self, commodity: Commodity) -> Option<Price> {
        self.dispenser().pending_prices.get(&commodity).copied()
    }

    // =========================================================================
    // Dispensing
    // =========================================================================

    pub fn dispenser_state(&self) -> DispenserState {
        self.dispenser().state
    }

    /// Starts a dispensing cycle.
    ///
    /// The unit is marked busy before the tank is asked so two cycles can
    /// never overlap. If the tank refuses the unit goes back to idle and no
    /// sale is recorded. On success the sale is recorded immediately and the
    /// returned task ends the cycle after the dispensing duration.
    pub async fn begin_dispensing(
        self: &Arc<Self>,
        commodity: Commodity,
        quantity: Liters,
    ) -> SyncResult<JoinHandle<()>> {
        let Some(tank) = self.tank.clone() else {
            return Err(SyncError::InvalidConfig("no tank configured".into()));
        };
        if !quantity.is_positive() {
            return Err(CoreError::from(ValidationError::MustBePositive {
                field: "quantity".into(),
            })
            .into());
        }

        {
            let mut dispenser = self.dispenser();
            if !dispenser.fuels.contains_key(&commodity) {
                return Err(CoreError::CommodityNotCarried(commodity.to_string()).into());
            }
            if dispenser.state == DispenserState::Busy {
                return Err(CoreError::DispenserBusy {
                    unit_id: self.unit_id.clone(),
                }
                .into());
            }
            dispenser.state = DispenserState::Busy;
        }

        let drawn = tank.extract(commodity, quantity).await;
        match drawn {
            Ok(true) => {}
            Ok(false) => {
                self.finish_dispensing();
                return Err(SyncError::TankRefused(format!("{} L of {}", quantity, commodity)));
            }
            Err(e) => {
                self.finish_dispensing();
                return Err(e);
            }
        }

        self.sell(commodity, quantity);
        info!(unit_id = %self.unit_id, %commodity, %quantity, "Dispensing started");

        let unit = Arc::clone(self);
        let duration = self.dispense_duration;
        Ok(tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            unit.finish_dispensing();
            info!(unit_id = %unit.unit_id, "Dispensing finished");
        }))
    }

    /// Ends a cycle: back to idle, deferred prices take effect.
    fn finish_dispensing(&self) {
        self.dispenser().state = DispenserState::Idle;
        self.apply_pending_prices();
    }

    // =========================================================================
    // Status
    // =========================================================================

    pub fn status(&self) -> UnitStatus {
        let dispenser = self.dispenser();
        UnitStatus {
            unit_id: self.unit_id.clone(),
            fuels: dispenser.fuels.iter().map(|(c, t)| (*c, *t)).collect(),
        }
    }

    pub fn totals(&self, commodity: Commodity) -> Option<FuelTotals> {
        self.dispenser().fuels.get(&commodity).copied()
    }

    /// Whether sales currently stream straight to the distributor.
    pub fn is_streaming(&self) -> bool {
        self.uplink()
            .outbound
            .as_ref()
            .is_some_and(|link| !link.is_closed())
    }

    /// Rewrites this unit's lines in the state file.
    pub fn persist(&self) {
        let _serial = self.save_lock.lock().unwrap_or_else(|e| e.into_inner());
        let fuels = self.dispenser().fuels.clone();
        if let Err(e) = self.state_file.save(&self.unit_id, &fuels) {
            warn!(unit_id = %self.unit_id, error = %e, "Failed to save unit state");
        }
    }

    // =========================================================================
    // Replay
    // =========================================================================

    /// Drains the pending queue through `link` and publishes it as the live
    /// uplink once nothing is left.
    async fn replay_and_publish(&self, link: &OutboundHandle) -> SyncResult<()> {
        loop {
            let Some(contents) = self.queue.begin_replay()? else {
                let published = {
                    let mut uplink = self.uplink();
                    if self.queue.is_empty()? {
                        uplink.outbound = Some(link.clone());
                        true
                    } else {
                        false
                    }
                };
                if published {
                    return Ok(());
                }
                continue;
            };

            let mut sent = 0usize;
            let mut discarded = 0usize;
            for record in &contents.records {
                if record.unit_id != self.unit_id {
                    discarded += 1;
                    continue;
                }
                link.send(transaction_message(record));
                sent += 1;
            }

            if let Err(e) = link.flush().await {
                if let Err(restore) = self.queue.abort_replay() {
                    error!(unit_id = %self.unit_id, error = %restore, "Failed to restore pending queue");
                }
                return Err(e);
            }

            if let Err(e) = self.queue.commit_replay() {
                warn!(unit_id = %self.unit_id, error = %e, "Replayed sales delivered but not cleared");
            }
            if discarded > 0 {
                warn!(unit_id = %self.unit_id, discarded, "Discarded queued sales of another unit");
            }
            info!(
                unit_id = %self.unit_id,
                sent,
                skipped = contents.skipped,
                "Pending sales replayed"
            );
        }
    }

    fn answer_price(&self, commodity: Commodity, price: Price) -> WireMessage {
        match self.set_price(commodity, price) {
            PriceOutcome::Applied => {
                WireMessage::ok(format!("Price of {} updated to {}", commodity, price))
            }
            PriceOutcome::Deferred => WireMessage::Pending(format!(
                "Price of {} will be applied when the current sale ends",
                commodity
            )),
            PriceOutcome::UnknownCommodity => {
                WireMessage::error(format!("Commodity {} is not sold here", commodity))
            }
        }
    }
}

fn transaction_message(record: &PendingTransaction) -> WireMessage {
    WireMessage::Transaction {
        unit_id: record.unit_id.clone(),
        commodity: record.commodity,
        quantity: record.quantity,
    }
}

// =============================================================================
// Uplink Session
// =============================================================================

#[async_trait]
impl UplinkSession for SaleUnit {
    fn node_id(&self) -> String {
        self.unit_id.clone()
    }

    async fn on_connected(&self, link: &OutboundHandle) -> SyncResult<()> {
        self.replay_and_publish(link).await
    }

    async fn on_message(&self, message: WireMessage, link: &OutboundHandle) {
        match message {
            WireMessage::Price { commodity, price } => {
                link.send(self.answer_price(commodity, price));
            }
            WireMessage::StatusRequest => {
                link.send(WireMessage::Status(self.status()));
            }
            m if m.is_acknowledgement() => {
                debug!(unit_id = %self.unit_id, reply = %m, "Distributor reply");
            }
            other => {
                debug!(unit_id = %self.unit_id, kind = other.kind(), "Ignoring message from distributor");
            }
        }
    }

    async fn on_disconnected(&self) {
        if self.uplink().outbound.take().is_some() {
            info!(unit_id = %self.unit_id, "Uplink lost; sales will be queued");
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tank::TankServer;
    use crate::transport::LineConnection;
    use fuelnet_store::ResourceLedger;
    use tokio::net::TcpListener;
    use tokio_util::sync::CancellationToken;

    struct Fixture {
        dir: tempfile::TempDir,
        unit: Arc<SaleUnit>,
    }

    fn open_unit(dir: &tempfile::TempDir, id: &str) -> SaleUnit {
        let mut config = SaleUnitConfig::new(id);
        config.carried = vec![Commodity::Gasoline93, Commodity::Gasoline95, Commodity::Diesel];
        config.dispense_duration = Duration::from_millis(200);
        SaleUnit::open(
            config,
            PendingQueue::open(dir.path().join("pending_sales.log")).unwrap(),
            UnitStateFile::new(dir.path().join("unit_state.txt")),
        )
        .unwrap()
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let unit = Arc::new(open_unit(&dir, "1"));
        Fixture { dir, unit }
    }

    /// A server link whose lines the returned reader receives.
    async fn wire() -> (OutboundHandle, LineConnection) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let (client, accepted) = tokio::join!(
            LineConnection::connect(&addr, Duration::from_secs(5)),
            listener.accept()
        );
        let server = LineConnection::from_stream(accepted.unwrap().0).unwrap();
        (server.link, client.unwrap())
    }

    #[test]
    fn test_offline_sales_are_queued() {
        let f = fixture();
        assert!(f.unit.sell(Commodity::Gasoline93, Liters::from_whole(5)));
        assert!(f.unit.sell(Commodity::Gasoline93, Liters::from_whole(8)));

        let totals = f.unit.totals(Commodity::Gasoline93).unwrap();
        assert_eq!(totals.dispensed, Liters::from_whole(13));
        assert_eq!(totals.sale_count, 2);
        assert_eq!(f.unit.queue().len().unwrap(), 2);
    }

    #[test]
    fn test_sell_rejects_uncarried_and_non_positive() {
        let f = fixture();
        assert!(!f.unit.sell(Commodity::Kerosene, Liters::from_whole(5)));
        assert!(!f.unit.sell(Commodity::Diesel, Liters::ZERO));
        assert_eq!(f.unit.queue().len().unwrap(), 0);
    }

    #[test]
    fn test_totals_survive_restart() {
        let f = fixture();
        f.unit.sell(Commodity::Diesel, Liters::from_whole(7));
        f.unit.set_price(Commodity::Diesel, Price::from_whole(950));

        let reopened = open_unit(&f.dir, "1");
        let totals = reopened.totals(Commodity::Diesel).unwrap();
        assert_eq!(totals.dispensed, Liters::from_whole(7));
        assert_eq!(totals.sale_count, 1);
        assert_eq!(totals.price, Price::from_whole(950));
        assert_eq!(reopened.dispenser_state(), DispenserState::Idle);
    }

    #[test]
    fn test_price_for_uncarried_commodity() {
        let f = fixture();
        assert_eq!(
            f.unit.set_price(Commodity::Kerosene, Price::from_whole(1)),
            PriceOutcome::UnknownCommodity
        );
    }

    #[tokio::test]
    async fn test_replay_sends_in_order_and_empties_queue() {
        let f = fixture();
        f.unit.sell(Commodity::Gasoline93, Liters::from_whole(5));
        f.unit.sell(Commodity::Gasoline93, Liters::from_whole(8));
        f.unit
            .queue()
            .append(&PendingTransaction::now("9", Commodity::Diesel, Liters::from_whole(1)))
            .unwrap();

        let (link, mut parent) = wire().await;
        f.unit.on_connected(&link).await.unwrap();

        for expected in ["5", "8"] {
            let msg = parent.reader.next_message().await.unwrap().unwrap().unwrap();
            assert_eq!(
                msg,
                WireMessage::Transaction {
                    unit_id: "1".into(),
                    commodity: Commodity::Gasoline93,
                    quantity: expected.parse().unwrap(),
                }
            );
        }
        assert!(f.unit.queue().is_empty().unwrap());
        assert!(f.unit.is_streaming());

        // Live sales now stream directly.
        f.unit.sell(Commodity::Gasoline95, Liters::from_whole(3));
        let msg = parent.reader.next_message().await.unwrap().unwrap().unwrap();
        assert!(matches!(msg, WireMessage::Transaction { commodity: Commodity::Gasoline95, .. }));
        assert!(f.unit.queue().is_empty().unwrap());
    }

    #[tokio::test]
    async fn test_failed_replay_restores_queue() {
        let f = fixture();
        f.unit.sell(Commodity::Gasoline93, Liters::from_whole(5));

        let (link, parent) = wire().await;
        link.close();
        drop(parent);
        tokio::time::timeout(Duration::from_secs(5), async {
            while !link.is_closed() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        assert!(f.unit.on_connected(&link).await.is_err());
        assert_eq!(f.unit.queue().len().unwrap(), 1);
        assert!(!f.unit.is_streaming());
    }

    #[tokio::test]
    async fn test_disconnect_sends_sales_back_to_queue() {
        let f = fixture();
        let (link, _parent) = wire().await;
        f.unit.on_connected(&link).await.unwrap();
        f.unit.on_disconnected().await;

        f.unit.sell(Commodity::Diesel, Liters::from_whole(4));
        assert_eq!(f.unit.queue().len().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_price_message_replies() {
        let f = fixture();
        let (link, mut parent) = wire().await;

        f.unit
            .on_message(
                WireMessage::Price {
                    commodity: Commodity::Diesel,
                    price: Price::from_whole(950),
                },
                &link,
            )
            .await;
        let reply = parent.reader.next_message().await.unwrap().unwrap().unwrap();
        assert_eq!(reply, WireMessage::ok("Price of Diesel updated to 950"));

        f.unit.on_message(WireMessage::StatusRequest, &link).await;
        let reply = parent.reader.next_message().await.unwrap().unwrap().unwrap();
        match reply {
            WireMessage::Status(status) => {
                assert_eq!(status.unit_id, "1");
                assert_eq!(
                    status.totals(Commodity::Diesel).unwrap().price,
                    Price::from_whole(950)
                );
            }
            other => panic!("expected status, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_deferred_price_applies_once_after_dispensing() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = Arc::new(ResourceLedger::in_memory(Liters::from_whole(1000)));
        let tank = TankServer::new(Arc::clone(&ledger))
            .start("127.0.0.1:0", CancellationToken::new())
            .await
            .unwrap();
        let unit = Arc::new(
            open_unit(&dir, "1").with_tank(TankClient::new(tank.local_addr().to_string())),
        );

        let done = unit
            .begin_dispensing(Commodity::Gasoline95, Liters::from_whole(10))
            .await
            .unwrap();
        assert_eq!(unit.dispenser_state(), DispenserState::Busy);
        assert_eq!(ledger.level(Commodity::Gasoline95), Liters::from_whole(990));

        let busy = unit
            .begin_dispensing(Commodity::Gasoline95, Liters::from_whole(1))
            .await;
        assert!(matches!(busy, Err(SyncError::Rejected(CoreError::DispenserBusy { .. }))));

        assert_eq!(
            unit.set_price(Commodity::Gasoline95, Price::from_whole(130)),
            PriceOutcome::Deferred
        );
        let before = unit.totals(Commodity::Gasoline95).unwrap().price;
        assert_ne!(before, Price::from_whole(130));

        done.await.unwrap();
        assert_eq!(unit.dispenser_state(), DispenserState::Idle);
        assert_eq!(unit.totals(Commodity::Gasoline95).unwrap().price, Price::from_whole(130));
        assert_eq!(unit.pending_price(Commodity::Gasoline95), None);
        assert_eq!(unit.apply_pending_prices(), 0);

        let totals = unit.totals(Commodity::Gasoline95).unwrap();
        assert_eq!(totals.dispensed, Liters::from_whole(10));
        assert_eq!(totals.sale_count, 1);
        tank.shutdown().await;
    }

    #[tokio::test]
    async fn test_refused_extraction_leaves_unit_idle() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = Arc::new(ResourceLedger::in_memory(Liters::from_whole(5)));
        let tank = TankServer::new(ledger)
            .start("127.0.0.1:0", CancellationToken::new())
            .await
            .unwrap();
        let unit = Arc::new(
            open_unit(&dir, "1").with_tank(TankClient::new(tank.local_addr().to_string())),
        );

        let result = unit
            .begin_dispensing(Commodity::Diesel, Liters::from_whole(50))
            .await;
        assert!(matches!(result, Err(SyncError::TankRefused(_))));
        assert_eq!(unit.dispenser_state(), DispenserState::Idle);
        assert_eq!(unit.totals(Commodity::Diesel).unwrap().sale_count, 0);
        tank.shutdown().await;
    }
}
