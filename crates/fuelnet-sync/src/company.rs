//! # Company
//!
//! Root of the hierarchy. Owns the authoritative price table and collects the
//! digests distributors send upward.
//!
//! ```text
//! operator edit ──► company_prices.txt ──► PRICE c p ──► every distributor
//! distributor   ──► REPORTE_AUTOMATICO <digest> ──► report log ──► ACK
//! ```

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Local};
use fuelnet_core::{Commodity, Price, PriceTable};
use fuelnet_store::PriceFile;
use tracing::{debug, info};

use crate::error::SyncResult;
use crate::fanout::PriceBook;
use crate::hub::{ChildSessionHandler, SessionControl};
use crate::protocol::WireMessage;
use crate::registry::ConnectionRegistry;
use crate::transport::OutboundHandle;

/// One digest received from a distributor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportEntry {
    pub received_at: DateTime<Local>,
    pub from: String,
    pub body: String,
}

/// The root node.
pub struct Company {
    name: String,
    prices: PriceBook<PriceFile>,
    registry: Arc<ConnectionRegistry>,
    reports: Mutex<Vec<ReportEntry>>,
}

impl Company {
    /// Loads prices from `price_file`, falling back to the built-in table.
    ///
    /// A missing file is written out with the defaults.
    pub fn open(name: impl Into<String>, price_file: PriceFile) -> SyncResult<Self> {
        let name = name.into();
        let existed = price_file.path().exists();
        let table = price_file.load_or(PriceTable::company_defaults())?;
        if !existed {
            price_file.save(&table)?;
            info!(path = %price_file.path().display(), "Wrote default price file");
        }
        info!(%name, grades = table.len(), "Company opened");

        let registry = Arc::new(ConnectionRegistry::new());
        Ok(Company {
            name,
            prices: PriceBook::new(table, price_file, Arc::clone(&registry)),
            registry,
            reports: Mutex::new(Vec::new()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Changes one price and pushes it to every distributor.
    pub async fn set_price(&self, commodity: Commodity, price: Price) -> usize {
        self.prices.set_price(commodity, price).await
    }

    /// Changes several prices in order.
    pub async fn set_prices(&self, prices: impl IntoIterator<Item = (Commodity, Price)>) -> usize {
        self.prices.set_prices(prices).await
    }

    /// Re-sends the whole table to every distributor.
    pub fn push_all_prices(&self) -> usize {
        let sent = self.prices.push_all();
        info!(lines = sent, distributors = self.registry.len(), "Full price table pushed");
        sent
    }

    pub fn prices(&self) -> PriceTable {
        self.prices.snapshot()
    }

    pub fn distributors(&self) -> Vec<String> {
        self.registry.ids()
    }

    /// Every report received so far, oldest first.
    pub fn reports(&self) -> Vec<ReportEntry> {
        self.reports.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn log_report(&self, from: &str, body: String) {
        info!(%from, report = %body, "Report received");
        self.reports
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(ReportEntry {
                received_at: Local::now(),
                from: from.to_string(),
                body,
            });
    }
}

#[async_trait]
impl ChildSessionHandler for Company {
    fn hub_name(&self) -> String {
        format!("company {}", self.name)
    }

    async fn on_registered(&self, child_id: &str, link: &OutboundHandle) {
        link.send(WireMessage::ok(format!("Connected to company {}", self.name)));
        self.prices.send_snapshot(link);
        debug!(%child_id, "Corporate prices sent");
    }

    async fn on_message(
        &self,
        child_id: &str,
        message: WireMessage,
        link: &OutboundHandle,
    ) -> SessionControl {
        match message {
            WireMessage::AutomaticReport(body) => {
                self.log_report(child_id, body);
                link.send(WireMessage::Ack);
            }
            m if m.is_acknowledgement() => debug!(%child_id, reply = %m, "Distributor reply"),
            other => info!(%child_id, line = %other, "Message from distributor"),
        }
        SessionControl::Continue
    }
}
