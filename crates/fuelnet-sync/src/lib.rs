//! # fuelnet-sync: Hierarchy Synchronization for FuelNet
//!
//! Everything that crosses a socket: the line protocol, the tank service,
//! the reconnecting uplink used by pumps and distributors, the inbound hub
//! used by distributors and the company, and the node logic of each tier.
//!
//! ## Architecture Overview
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        FuelNet Hierarchy                                │
//! │                                                                         │
//! │                      ┌──────────────────────┐                           │
//! │                      │  Company (:7000)     │  PriceBook<PriceFile>     │
//! │                      │  HubServer           │  report log               │
//! │                      └──────────▲───────────┘                           │
//! │                                 │ PRECIO ↓   REPORTE_AUTOMATICO ↑       │
//! │                      ┌──────────┴───────────┐                           │
//! │                      │ Distributor (:6000)  │  PriceBook<PriceRepo>     │
//! │                      │ HubServer + uplink   │  SQLite ledger            │
//! │                      └──▲───────────────▲───┘                           │
//! │            PRECIO ↓     │               │    TRANSACCION ↑              │
//! │            ┌────────────┴───┐     ┌─────┴──────────┐                    │
//! │            │ SaleUnit "1"   │     │ SaleUnit "2"   │  PendingQueue      │
//! │            │ Supervisor     │     │ Supervisor     │  (offline sales)   │
//! │            └───────┬────────┘     └───────┬────────┘                    │
//! │                    │  EXTRAER             │                             │
//! │                    └──────────┬───────────┘                             │
//! │                        ┌──────▼───────┐                                 │
//! │                        │ Tank (:5000) │  ResourceLedger                 │
//! │                        └──────────────┘                                 │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Organization
//!
//! ### Plumbing
//! - [`protocol`] - `WireMessage` parsing and rendering
//! - [`transport`] - Line-framed TCP with a writer task per connection
//! - [`backoff`] - Reconnect delay policies
//! - [`supervisor`] - Child-side connection lifecycle and handshake
//! - [`hub`] - Parent-side accept loop and handshake
//! - [`registry`] - Live child connections by id
//! - [`fanout`] - Cached, persisted, broadcast price tables
//! - [`config`] - Per-role node configuration
//! - [`error`] - Sync error types
//!
//! ### Nodes
//! - [`tank`] - Tank service and its client
//! - [`pump`] - `SaleUnit`
//! - [`distributor`] - `Distributor`
//! - [`company`] - `Company`
//!
//! ## Usage
//!
//! ```rust,ignore
//! use fuelnet_sync::{ConnectionSupervisor, NodeConfig, Role, SaleUnit};
//!
//! let config = NodeConfig::load(Role::Pump, None)?;
//! let unit = Arc::new(SaleUnit::open(unit_config, queue, state_file)?);
//! let handle = ConnectionSupervisor::spawn(
//!     config.supervisor_config(Role::Pump).unwrap(),
//!     unit.clone(),
//!     config.backoff_policy(Role::Pump),
//!     shutdown.clone(),
//! );
//! unit.sell(Commodity::Gasoline95, "10".parse()?);
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

// Plumbing
pub mod backoff;
pub mod config;
pub mod error;
pub mod fanout;
pub mod hub;
pub mod protocol;
pub mod registry;
pub mod supervisor;
pub mod transport;

// Nodes
pub mod company;
pub mod distributor;
pub mod pump;
pub mod tank;

// =============================================================================
// Re-exports
// =============================================================================

pub use backoff::{BackoffPolicy, BackoffStrategy, ExponentialBackoff, FixedBackoff};
pub use config::{NodeConfig, Role};
pub use error::{SyncError, SyncResult};
pub use fanout::{PriceBook, PriceStore};
pub use hub::{ChildSessionHandler, HubConfig, HubServer, ServerHandle, SessionControl};
pub use protocol::{ProtocolError, WireMessage};
pub use registry::ConnectionRegistry;
pub use supervisor::{
    ConnectionSupervisor, SupervisorConfig, SupervisorHandle, SupervisorState, UplinkSession,
};
pub use transport::{LineConnection, OutboundHandle};

pub use company::{Company, ReportEntry};
pub use distributor::{Distributor, MirroredStatus, UnitLedger};
pub use pump::{SaleUnit, SaleUnitConfig, DEFAULT_DISPENSE_DURATION};
pub use tank::{TankClient, TankServer};
