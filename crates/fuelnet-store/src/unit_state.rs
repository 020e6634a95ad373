//! # Unit State File
//!
//! Per-commodity totals of a pump, one line per (unit, commodity):
//!
//! ```text
//! <unit_id>,<commodity>,<liters>,<price>,<sale_count>
//! 1,93,15,100,2
//! 1,95,0,110,0
//! ```
//!
//! The file may be shared by several pumps on one host; saving rewrites only
//! the lines of the saving unit and keeps everyone else's. Lines written by
//! older versions without the trailing sale count load with a count of zero.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use fuelnet_core::validation::validate_unit_id;
use fuelnet_core::{Commodity, FuelTotals, Liters, Price};
use tracing::debug;

use crate::error::StoreResult;
use crate::flatfile;

/// Totals of one unit keyed by commodity.
pub type UnitTotals = BTreeMap<Commodity, FuelTotals>;

/// The pump totals file.
#[derive(Debug, Clone)]
pub struct UnitStateFile {
    path: PathBuf,
}

impl UnitStateFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        UnitStateFile { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Totals stored for `unit_id`. Empty if the unit has never saved.
    pub fn load(&self, unit_id: &str) -> StoreResult<UnitTotals> {
        Ok(self
            .entries()?
            .into_iter()
            .filter(|e| e.unit_id == unit_id)
            .map(|e| (e.commodity, e.totals))
            .collect())
    }

    /// Replaces the lines of `unit_id`, keeping other units' lines.
    pub fn save(&self, unit_id: &str, totals: &UnitTotals) -> StoreResult<()> {
        let mut lines: Vec<String> = self
            .entries()?
            .into_iter()
            .filter(|e| e.unit_id != unit_id)
            .map(|e| e.to_line())
            .collect();

        lines.extend(totals.iter().map(|(commodity, totals)| {
            StateEntry {
                unit_id: unit_id.to_string(),
                commodity: *commodity,
                totals: *totals,
            }
            .to_line()
        }));

        flatfile::write_lines_atomic(&self.path, lines)
    }

    /// Every unit id that has saved to this file.
    pub fn unit_ids(&self) -> StoreResult<BTreeSet<String>> {
        Ok(self.entries()?.into_iter().map(|e| e.unit_id).collect())
    }

    fn entries(&self) -> StoreResult<Vec<StateEntry>> {
        let mut entries = Vec::new();
        for line in flatfile::read_lines(&self.path)? {
            match StateEntry::parse(&line) {
                Some(entry) => entries.push(entry),
                None => debug!(%line, "Skipping malformed unit state line"),
            }
        }
        Ok(entries)
    }
}

#[derive(Debug, Clone)]
struct StateEntry {
    unit_id: String,
    commodity: Commodity,
    totals: FuelTotals,
}

impl StateEntry {
    fn parse(line: &str) -> Option<StateEntry> {
        let fields: Vec<&str> = line.split(',').map(str::trim).collect();
        if fields.len() != 4 && fields.len() != 5 {
            return None;
        }

        let unit_id = validate_unit_id(fields[0]).ok()?;
        let commodity: Commodity = fields[1].parse().ok()?;
        let dispensed: Liters = fields[2].parse().ok()?;
        let price: Price = fields[3].parse().ok()?;
        let sale_count = match fields.get(4) {
            Some(raw) => raw.parse::<u64>().ok()?,
            None => 0,
        };
        if dispensed.is_negative() {
            return None;
        }

        Some(StateEntry {
            unit_id,
            commodity,
            totals: FuelTotals {
                price,
                dispensed,
                sale_count,
            },
        })
    }

    fn to_line(&self) -> String {
        format!(
            "{},{},{},{},{}",
            self.unit_id,
            self.commodity,
            self.totals.dispensed,
            self.totals.price,
            self.totals.sale_count
        )
    }
}
