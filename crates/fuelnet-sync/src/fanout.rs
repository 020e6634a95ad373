//! # Price Fan-out
//!
//! The price table of a hub node and the push of every change to its
//! registered children.
//!
//! ```text
//! set_price(c, p)
//!    │
//!    ├─► cached table            (always, even with no children)
//!    ├─► PriceStore::persist     (SQLite at a distributor, flat file at the company)
//!    └─► registry.broadcast(PRICE c p)
//!
//! child (re)connects ──► send_snapshot: one PRICE line per grade
//! ```
//!
//! Updates are serialised so the store and the wire both see them in the
//! order they were made.

use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use fuelnet_core::{Commodity, Price, PriceTable};
use fuelnet_store::{PriceFile, PriceRepository, StoreResult};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::protocol::WireMessage;
use crate::registry::ConnectionRegistry;
use crate::transport::OutboundHandle;

// =============================================================================
// Price Store
// =============================================================================

/// Where a hub keeps its prices between restarts.
#[async_trait]
pub trait PriceStore: Send + Sync + 'static {
    /// Persists one change. `table` already contains it.
    async fn persist(&self, commodity: Commodity, price: Price, table: &PriceTable)
        -> StoreResult<()>;
}

#[async_trait]
impl PriceStore for PriceRepository {
    async fn persist(
        &self,
        commodity: Commodity,
        price: Price,
        _table: &PriceTable,
    ) -> StoreResult<()> {
        self.upsert(commodity, price).await
    }
}

#[async_trait]
impl PriceStore for PriceFile {
    async fn persist(
        &self,
        _commodity: Commodity,
        _price: Price,
        table: &PriceTable,
    ) -> StoreResult<()> {
        self.save(table)
    }
}

// =============================================================================
// Price Book
// =============================================================================

/// Cached prices plus fan-out to children.
pub struct PriceBook<S: PriceStore> {
    table: RwLock<PriceTable>,
    store: S,
    registry: Arc<ConnectionRegistry>,
    updates: Mutex<()>,
}

impl<S: PriceStore> PriceBook<S> {
    pub fn new(initial: PriceTable, store: S, registry: Arc<ConnectionRegistry>) -> Self {
        PriceBook {
            table: RwLock::new(initial),
            store,
            registry,
            updates: Mutex::new(()),
        }
    }

    /// Changes one price, persists it and pushes it to every child.
    ///
    /// Returns the number of children the update was sent to. A persistence
    /// failure is logged; the cached price and the fan-out still happen.
    pub async fn set_price(&self, commodity: Commodity, price: Price) -> usize {
        let _serial = self.updates.lock().await;

        let (previous, table) = {
            let mut table = self.table.write().unwrap_or_else(|e| e.into_inner());
            let previous = table.set(commodity, price);
            (previous, table.clone())
        };

        if let Err(e) = self.store.persist(commodity, price, &table).await {
            warn!(%commodity, %price, error = %e, "Failed to persist price");
        }

        let sent = self
            .registry
            .broadcast(&WireMessage::Price { commodity, price });
        info!(
            %commodity,
            %price,
            previous = ?previous.map(|p| p.to_string()),
            children = sent,
            "Price updated"
        );
        sent
    }

    /// Applies several changes in order.
    pub async fn set_prices(&self, prices: impl IntoIterator<Item = (Commodity, Price)>) -> usize {
        let mut sent = 0;
        for (commodity, price) in prices {
            sent += self.set_price(commodity, price).await;
        }
        sent
    }

    pub fn get(&self, commodity: Commodity) -> Option<Price> {
        self.table
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(commodity)
    }

    pub fn snapshot(&self) -> PriceTable {
        self.table.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Sends the whole table to one child.
    pub fn send_snapshot(&self, link: &OutboundHandle) -> bool {
        self.snapshot()
            .iter()
            .all(|(commodity, price)| link.send(WireMessage::Price { commodity, price }))
    }

    /// Re-sends the whole table to every child. Returns lines sent.
    pub fn push_all(&self) -> usize {
        self.snapshot()
            .iter()
            .map(|(commodity, price)| self.registry.broadcast(&WireMessage::Price { commodity, price }))
            .sum()
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn store(&self) -> &S {
        &self.store
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::LineConnection;
    use std::time::Duration;
    use tokio::net::TcpListener;

    async fn child(registry: &ConnectionRegistry, id: &str) -> LineConnection {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let (client, accepted) = tokio::join!(
            LineConnection::connect(&addr, Duration::from_secs(5)),
            listener.accept()
        );
        let server = LineConnection::from_stream(accepted.unwrap().0).unwrap();
        registry.register(id, server.link);
        client.unwrap()
    }

    #[tokio::test]
    async fn test_price_change_reaches_children_and_file() {
        let dir = tempfile::tempdir().unwrap();
        let file = PriceFile::new(dir.path().join("company_prices.txt"));
        let registry = Arc::new(ConnectionRegistry::new());
        let book = PriceBook::new(PriceTable::company_defaults(), file.clone(), Arc::clone(&registry));

        let mut a = child(&registry, "norte").await;
        let mut b = child(&registry, "sur").await;

        let sent = book.set_price(Commodity::Diesel, Price::from_whole(950)).await;
        assert_eq!(sent, 2);

        let expected = WireMessage::Price {
            commodity: Commodity::Diesel,
            price: Price::from_whole(950),
        };
        assert_eq!(a.reader.next_message().await.unwrap().unwrap().unwrap(), expected);
        assert_eq!(b.reader.next_message().await.unwrap().unwrap().unwrap(), expected);

        let reloaded = file.load_or(PriceTable::company_defaults()).unwrap();
        assert_eq!(reloaded.get(Commodity::Diesel), Some(Price::from_whole(950)));
    }

    #[tokio::test]
    async fn test_change_without_children_is_cached() {
        let dir = tempfile::tempdir().unwrap();
        let file = PriceFile::new(dir.path().join("prices.txt"));
        let book = PriceBook::new(
            PriceTable::company_defaults(),
            file,
            Arc::new(ConnectionRegistry::new()),
        );

        assert_eq!(book.set_price(Commodity::Gasoline93, Price::from_whole(130)).await, 0);
        assert_eq!(book.get(Commodity::Gasoline93), Some(Price::from_whole(130)));
    }

    #[tokio::test]
    async fn test_snapshot_sends_every_grade() {
        let registry = Arc::new(ConnectionRegistry::new());
        let dir = tempfile::tempdir().unwrap();
        let book = PriceBook::new(
            PriceTable::company_defaults(),
            PriceFile::new(dir.path().join("p.txt")),
            Arc::clone(&registry),
        );
        let mut c = child(&registry, "x").await;
        let link = registry.get("x").unwrap();

        assert!(book.send_snapshot(&link));
        for _ in 0..Commodity::ALL.len() {
            let msg = c.reader.next_message().await.unwrap().unwrap().unwrap();
            assert!(matches!(msg, WireMessage::Price { .. }));
        }
    }
}
