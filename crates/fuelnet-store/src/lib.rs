//! # fuelnet-store: Durable State for FuelNet
//!
//! Files and tables that survive a restart.
//!
//! ## What Lives Where
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  tank         tank_levels.txt        ResourceLedger   (+ autosave)      │
//! │  pump         pending_sales.log      PendingQueue     (+ replay)        │
//! │               unit_state.txt         UnitStateFile                      │
//! │               (both)                 resolve_unit_id                    │
//! │  distributor  distributor.db         Database → sales(), prices()       │
//! │  company      company_prices.txt     PriceFile                          │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//! ```rust,ignore
//! use fuelnet_store::{Database, DbConfig};
//!
//! let db = Database::new(DbConfig::new("./distributor.db")).await?;
//! db.sales().record("1", Commodity::Gasoline95, qty).await?;
//! ```

pub mod error;
pub mod flatfile;
pub mod identity;
pub mod ledger;
pub mod migrations;
pub mod pending;
pub mod pool;
pub mod price_file;
pub mod repository;
pub mod unit_state;

pub use error::{StoreError, StoreResult};
pub use identity::{resolve_unit_id, IdentitySource};
pub use ledger::ResourceLedger;
pub use pending::{PendingQueue, QueueContents};
pub use pool::{Database, DbConfig};
pub use price_file::PriceFile;
pub use repository::prices::PriceRepository;
pub use repository::sales::{CommodityTotal, SalesLedgerRepository};
pub use unit_state::{UnitStateFile, UnitTotals};
