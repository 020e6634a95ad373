//! # fuelnet-core: Pure Domain Types for FuelNet
//!
//! Everything the tank, pump, distributor and company agree on, with zero
//! I/O dependencies.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        FuelNet Architecture                             │
//! │                                                                         │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │        apps/station (tank, pump, distributor, company)          │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │      fuelnet-sync (protocol, supervisor, hub, node logic)       │   │
//! │  └──────────────┬──────────────────────────────────┬───────────────┘   │
//! │                 │                                  │                    │
//! │  ┌──────────────▼──────────────┐   ┌───────────────▼───────────────┐   │
//! │  │ fuelnet-store (files, SQL)  │──►│ ★ fuelnet-core (THIS CRATE) ★ │   │
//! │  └─────────────────────────────┘   │  Commodity · Liters · Price   │   │
//! │                                    │  FuelTotals · PriceTable      │   │
//! │                                    │  PendingTransaction · Status  │   │
//! │                                    └───────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`types`] - Commodities, totals, price tables, pending records, status
//! - [`quantity`] - `Liters` and `Price` decimal newtypes
//! - [`error`] - Domain error types
//! - [`validation`] - Identifier and amount validation
//!
//! ## Example Usage
//!
//! ```rust
//! use fuelnet_core::quantity::Liters;
//! use fuelnet_core::types::{Commodity, FuelTotals};
//!
//! let mut totals = FuelTotals::default();
//! totals.record_sale("10".parse::<Liters>().unwrap());
//! totals.record_sale("2.5".parse::<Liters>().unwrap());
//!
//! assert_eq!(totals.dispensed.to_string(), "12.5");
//! assert_eq!(totals.sale_count, 2);
//! assert_eq!("diesel".parse::<Commodity>().unwrap(), Commodity::Diesel);
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod quantity;
pub mod types;
pub mod validation;

// =============================================================================
// Re-exports for Convenience
// =============================================================================

pub use error::{CoreError, CoreResult, ValidationError};
pub use quantity::{Liters, Price};
pub use types::{
    AggregateRow, Commodity, DispenserState, FuelTotals, PendingTransaction, PriceOutcome,
    PriceTable, UnitStatus,
};

// =============================================================================
// Constants
// =============================================================================

/// Starting level of every commodity in a freshly created tank.
pub const DEFAULT_TANK_LEVEL: u32 = 1000;

/// Price every commodity starts at on a pump or distributor that has never
/// heard from its parent.
pub const DEFAULT_UNIT_PRICE: u32 = 100;

/// Number of pump identity slots handed out by identity recovery.
pub const DEFAULT_UNIT_SLOTS: u32 = 4;

/// Timestamp layout of pending transaction records.
pub const RECORD_TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";
