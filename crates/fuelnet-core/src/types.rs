//! # Domain Types
//!
//! Types shared by every tier of the hierarchy.
//!
//! ## Type Relationships
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      Type Relationships                                 │
//! │                                                                         │
//! │  ┌────────────┐   price    ┌────────────┐                               │
//! │  │ PriceTable │───────────►│ FuelTotals │  one per Commodity per pump   │
//! │  │ (company,  │            │ price      │                               │
//! │  │ distrib.)  │            │ dispensed  │                               │
//! │  └────────────┘            │ sale_count │                               │
//! │                            └─────┬──────┘                               │
//! │                                  │ snapshot                             │
//! │                                  ▼                                      │
//! │                            ┌────────────┐    ESTADO:<id>|...            │
//! │                            │ UnitStatus │──────────────────► distrib.   │
//! │                            └────────────┘                               │
//! │                                                                         │
//! │  sale while offline ──► PendingTransaction ──replay──► AggregateRow     │
//! │                         (id|c|qty|timestamp)           (unit, c) sums   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Local, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, ValidationError};
use crate::quantity::{Liters, Price};
use crate::validation::validate_unit_id;
use crate::RECORD_TIMESTAMP_FORMAT;

// =============================================================================
// Commodity
// =============================================================================

/// A fuel grade.
///
/// Parsing is case-insensitive; display uses the canonical spelling that
/// appears on the wire and in every persisted file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Commodity {
    /// Gasoline 93 octane.
    Gasoline93,
    /// Gasoline 95 octane.
    Gasoline95,
    /// Gasoline 97 octane.
    Gasoline97,
    Diesel,
    Kerosene,
}

impl Commodity {
    /// Every grade, in canonical order.
    pub const ALL: [Commodity; 5] = [
        Commodity::Gasoline93,
        Commodity::Gasoline95,
        Commodity::Gasoline97,
        Commodity::Diesel,
        Commodity::Kerosene,
    ];

    /// Canonical wire spelling.
    pub fn as_str(&self) -> &'static str {
        match self {
            Commodity::Gasoline93 => "93",
            Commodity::Gasoline95 => "95",
            Commodity::Gasoline97 => "97",
            Commodity::Diesel => "Diesel",
            Commodity::Kerosene => "Kerosene",
        }
    }
}

impl fmt::Display for Commodity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for Commodity {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        Commodity::ALL
            .into_iter()
            .find(|c| c.as_str().eq_ignore_ascii_case(trimmed))
            .ok_or_else(|| CoreError::UnknownCommodity(trimmed.to_string()))
    }
}

impl TryFrom<String> for Commodity {
    type Error = CoreError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Commodity> for String {
    fn from(c: Commodity) -> String {
        c.as_str().to_string()
    }
}

// =============================================================================
// Fuel Totals
// =============================================================================

/// Running totals of one commodity on one sale unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FuelTotals {
    /// Current price per liter.
    pub price: Price,
    /// Liters sold since the unit was first started.
    pub dispensed: Liters,
    /// Number of completed sales.
    pub sale_count: u64,
}

impl FuelTotals {
    /// Fresh totals at a given price.
    pub fn priced(price: Price) -> Self {
        FuelTotals {
            price,
            ..Default::default()
        }
    }

    /// Adds one sale.
    pub fn record_sale(&mut self, quantity: Liters) {
        self.dispensed = self.dispensed.saturating_add(quantity);
        self.sale_count += 1;
    }
}

// =============================================================================
// Price Table
// =============================================================================

/// Commodity → price, ordered by commodity.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PriceTable {
    prices: BTreeMap<Commodity, Price>,
}

impl PriceTable {
    /// Every grade at the same price.
    pub fn uniform(price: Price) -> Self {
        PriceTable {
            prices: Commodity::ALL.into_iter().map(|c| (c, price)).collect(),
        }
    }

    /// Starting prices of the company when no price file exists yet.
    pub fn company_defaults() -> Self {
        let mut table = PriceTable::default();
        table.set(Commodity::Gasoline93, Price::from_whole(100));
        table.set(Commodity::Gasoline95, Price::from_whole(110));
        table.set(Commodity::Gasoline97, Price::from_whole(120));
        table.set(Commodity::Diesel, Price::from_whole(95));
        table.set(Commodity::Kerosene, Price::from_whole(85));
        table
    }

    pub fn get(&self, commodity: Commodity) -> Option<Price> {
        self.prices.get(&commodity).copied()
    }

    /// Sets a price, returning the previous one.
    pub fn set(&mut self, commodity: Commodity, price: Price) -> Option<Price> {
        self.prices.insert(commodity, price)
    }

    pub fn iter(&self) -> impl Iterator<Item = (Commodity, Price)> + '_ {
        self.prices.iter().map(|(c, p)| (*c, *p))
    }

    pub fn len(&self) -> usize {
        self.prices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.prices.is_empty()
    }
}

impl FromIterator<(Commodity, Price)> for PriceTable {
    fn from_iter<I: IntoIterator<Item = (Commodity, Price)>>(iter: I) -> Self {
        PriceTable {
            prices: iter.into_iter().collect(),
        }
    }
}

/// Result of asking a sale unit to change a price.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PriceOutcome {
    /// Price is in effect now.
    Applied,
    /// A sale is in progress; the price takes effect when it completes.
    Deferred,
    /// The unit does not carry this commodity.
    UnknownCommodity,
}

// =============================================================================
// Dispenser State
// =============================================================================

/// Whether a sale unit is in the middle of a dispensing cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DispenserState {
    #[default]
    Idle,
    Busy,
}

impl fmt::Display for DispenserState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DispenserState::Idle => write!(f, "idle"),
            DispenserState::Busy => write!(f, "busy"),
        }
    }
}

// =============================================================================
// Pending Transaction
// =============================================================================

/// A sale recorded while the unit had no connection to its parent.
///
/// ## Line Format
/// ```text
/// <unit_id>|<commodity>|<quantity>|<yyyy-mm-dd HH:MM:SS>
/// 2|93|5|2024-03-01 14:02:11
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingTransaction {
    pub unit_id: String,
    pub commodity: Commodity,
    pub quantity: Liters,
    /// Local wall-clock time the sale was recorded.
    pub recorded_at: NaiveDateTime,
}

impl PendingTransaction {
    /// A record stamped with the current local time.
    pub fn now(unit_id: impl Into<String>, commodity: Commodity, quantity: Liters) -> Self {
        PendingTransaction {
            unit_id: unit_id.into(),
            commodity,
            quantity,
            recorded_at: Local::now().naive_local(),
        }
    }

    /// Formats the record as one queue line (no trailing newline).
    pub fn to_record_line(&self) -> String {
        format!(
            "{}|{}|{}|{}",
            self.unit_id,
            self.commodity,
            self.quantity,
            self.recorded_at.format(RECORD_TIMESTAMP_FORMAT)
        )
    }

    /// Parses one queue line.
    pub fn parse_record_line(line: &str) -> Result<Self, CoreError> {
        let parts: Vec<&str> = line.trim().split('|').collect();
        if parts.len() != 4 {
            return Err(ValidationError::invalid_format(
                "pending record",
                format!("expected 4 fields, found {}", parts.len()),
            )
            .into());
        }

        let unit_id = validate_unit_id(parts[0])?;
        let commodity: Commodity = parts[1].parse()?;
        let quantity = Liters::parse_positive("quantity", parts[2])?;
        let recorded_at = NaiveDateTime::parse_from_str(parts[3].trim(), RECORD_TIMESTAMP_FORMAT)
            .map_err(|e| ValidationError::invalid_format("timestamp", e.to_string()))?;

        Ok(PendingTransaction {
            unit_id,
            commodity,
            quantity,
            recorded_at,
        })
    }
}

// =============================================================================
// Unit Status
// =============================================================================

/// Point-in-time view of a sale unit, as reported to its distributor.
///
/// ## Body Format
/// ```text
/// <unit_id>|<c>:<price>:<liters>:<count>;<c>:<price>:<liters>:<count>;
/// 1|93:100:15:2;95:100:0:0;
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitStatus {
    pub unit_id: String,
    pub fuels: Vec<(Commodity, FuelTotals)>,
}

impl UnitStatus {
    pub fn totals(&self, commodity: Commodity) -> Option<&FuelTotals> {
        self.fuels
            .iter()
            .find(|(c, _)| *c == commodity)
            .map(|(_, t)| t)
    }

    /// Formats the body that follows `ESTADO:` on the wire.
    pub fn to_body(&self) -> String {
        let mut body = format!("{}|", self.unit_id);
        for (commodity, totals) in &self.fuels {
            body.push_str(&format!(
                "{}:{}:{}:{};",
                commodity, totals.price, totals.dispensed, totals.sale_count
            ));
        }
        body
    }

    /// Parses the body that follows `ESTADO:`.
    pub fn parse_body(body: &str) -> Result<Self, CoreError> {
        let (unit_id, entries) = body.trim().split_once('|').ok_or_else(|| {
            ValidationError::invalid_format("status", "missing '|' after unit id")
        })?;
        let unit_id = validate_unit_id(unit_id)?;

        let mut fuels = Vec::new();
        for entry in entries.split(';').filter(|e| !e.trim().is_empty()) {
            let fields: Vec<&str> = entry.split(':').collect();
            if fields.len() != 4 {
                return Err(ValidationError::invalid_format(
                    "status",
                    format!("entry '{}' needs 4 fields", entry),
                )
                .into());
            }
            let commodity: Commodity = fields[0].parse()?;
            let price = Price::parse_non_negative("price", fields[1])?;
            let dispensed: Liters = fields[2].parse()?;
            let sale_count = fields[3].trim().parse::<u64>().map_err(|_| {
                ValidationError::invalid_format("sale count", fields[3].to_string())
            })?;
            fuels.push((
                commodity,
                FuelTotals {
                    price,
                    dispensed,
                    sale_count,
                },
            ));
        }

        Ok(UnitStatus { unit_id, fuels })
    }
}

// =============================================================================
// Aggregate Row
// =============================================================================

/// One (unit, commodity) row of a distributor's sales ledger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregateRow {
    pub unit_id: String,
    pub commodity: Commodity,
    /// Sum of every reported quantity.
    pub quantity: Liters,
    /// Number of reports folded into this row.
    pub charge_count: u64,
    pub updated_at: DateTime<Utc>,
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_commodity_parse_case_insensitive() {
        assert_eq!("diesel".parse::<Commodity>().unwrap(), Commodity::Diesel);
        assert_eq!("KEROSENE".parse::<Commodity>().unwrap(), Commodity::Kerosene);
        assert_eq!(" 93 ".parse::<Commodity>().unwrap(), Commodity::Gasoline93);
        assert!(matches!(
            "98".parse::<Commodity>(),
            Err(CoreError::UnknownCommodity(name)) if name == "98"
        ));
    }

    #[test]
    fn test_commodity_display_round_trip() {
        for c in Commodity::ALL {
            assert_eq!(c.to_string().parse::<Commodity>().unwrap(), c);
        }
    }

    #[test]
    fn test_commodity_serde_uses_wire_name() {
        let json = serde_json::to_string(&Commodity::Gasoline97).unwrap();
        assert_eq!(json, "\"97\"");
        let c: Commodity = serde_json::from_str("\"diesel\"").unwrap();
        assert_eq!(c, Commodity::Diesel);
    }

    #[test]
    fn test_company_defaults() {
        let table = PriceTable::company_defaults();
        assert_eq!(table.len(), 5);
        assert_eq!(table.get(Commodity::Gasoline95), Some(Price::from_whole(110)));
        assert_eq!(table.get(Commodity::Kerosene), Some(Price::from_whole(85)));
    }

    #[test]
    fn test_price_table_set_returns_previous() {
        let mut table = PriceTable::uniform(Price::from_whole(100));
        let old = table.set(Commodity::Diesel, Price::from_whole(950));
        assert_eq!(old, Some(Price::from_whole(100)));
        assert_eq!(table.get(Commodity::Diesel), Some(Price::from_whole(950)));
    }

    #[test]
    fn test_pending_record_line() {
        let record = PendingTransaction {
            unit_id: "2".into(),
            commodity: Commodity::Gasoline93,
            quantity: Liters::from_whole(5),
            recorded_at: NaiveDateTime::parse_from_str(
                "2024-03-01 14:02:11",
                RECORD_TIMESTAMP_FORMAT,
            )
            .unwrap(),
        };
        let line = record.to_record_line();
        assert_eq!(line, "2|93|5|2024-03-01 14:02:11");
        assert_eq!(PendingTransaction::parse_record_line(&line).unwrap(), record);
    }

    #[test]
    fn test_pending_record_rejects_malformed() {
        assert!(PendingTransaction::parse_record_line("2|93|5").is_err());
        assert!(PendingTransaction::parse_record_line("2|98|5|2024-03-01 14:02:11").is_err());
        assert!(PendingTransaction::parse_record_line("2|93|-5|2024-03-01 14:02:11").is_err());
        assert!(PendingTransaction::parse_record_line("2|93|5|yesterday").is_err());
    }

    #[test]
    fn test_record_sale_never_overflows() {
        let mut totals = FuelTotals {
            dispensed: Liters::new(rust_decimal::Decimal::MAX),
            ..Default::default()
        };
        totals.record_sale(Liters::MAX);
        assert_eq!(totals.dispensed, Liters::new(rust_decimal::Decimal::MAX));
        assert_eq!(totals.sale_count, 1);
    }

    #[test]
    fn test_status_body() {
        let mut totals = FuelTotals::priced(Price::from_whole(100));
        totals.record_sale(Liters::from_whole(15));
        let status = UnitStatus {
            unit_id: "1".into(),
            fuels: vec![
                (Commodity::Gasoline93, totals),
                (Commodity::Gasoline95, FuelTotals::priced(Price::from_whole(100))),
            ],
        };

        let body = status.to_body();
        assert_eq!(body, "1|93:100:15:1;95:100:0:0;");
        assert_eq!(UnitStatus::parse_body(&body).unwrap(), status);
    }

    #[test]
    fn test_status_body_rejects_bad_entry() {
        assert!(UnitStatus::parse_body("1|93:100:15;").is_err());
        assert!(UnitStatus::parse_body("no-separator").is_err());
    }
}
