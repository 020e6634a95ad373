//! # Resource Ledger
//!
//! The tank: how many liters of each commodity are left.
//!
//! ## Mutation Flow
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  extract(93, 10) ──► lock levels ──► 10 ≤ level? ──no──► Insufficient   │
//! │                                          │                              │
//! │                                         yes                             │
//! │                                          ▼                              │
//! │                                   level -= 10, unlock                   │
//! │                                          │                              │
//! │                                          ▼                              │
//! │                         persist(): lock save, snapshot, write file      │
//! │                                                                         │
//! │  autosave task ── every 30s ──► persist()                               │
//! │                                                                         │
//! │  The save lock makes snapshots land on disk in the order they were      │
//! │  taken, so an older snapshot never overwrites a newer one.             │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## File Format
//! ```text
//! 93,990
//! 95,1000
//! Diesel,1000
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use fuelnet_core::validation::ValidationResult;
use fuelnet_core::{Commodity, CoreError, CoreResult, Liters, ValidationError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::StoreResult;
use crate::flatfile;

/// Default period of the background autosave.
pub const DEFAULT_AUTOSAVE_INTERVAL: Duration = Duration::from_secs(30);

// =============================================================================
// Resource Ledger
// =============================================================================

/// Commodity → available liters, never negative.
#[derive(Debug)]
pub struct ResourceLedger {
    /// Current levels.
    levels: Mutex<BTreeMap<Commodity, Liters>>,

    /// Backing file. `None` keeps the ledger in memory only.
    path: Option<PathBuf>,

    /// Serialises snapshot + write.
    save_lock: Mutex<()>,
}

impl ResourceLedger {
    /// A ledger with every commodity at `initial`, not backed by a file.
    pub fn in_memory(initial: Liters) -> Self {
        ResourceLedger {
            levels: Mutex::new(Commodity::ALL.into_iter().map(|c| (c, initial)).collect()),
            path: None,
            save_lock: Mutex::new(()),
        }
    }

    /// Opens a file-backed ledger.
    ///
    /// Every commodity starts at `initial`; entries found in the file
    /// override it. A missing file is not an error.
    pub fn open(path: impl Into<PathBuf>, initial: Liters) -> StoreResult<Self> {
        let mut ledger = ResourceLedger::in_memory(initial);
        ledger.path = Some(path.into());
        let loaded = ledger.load()?;
        info!(loaded, path = ?ledger.path, "Resource ledger opened");
        Ok(ledger)
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    // =========================================================================
    // Mutations
    // =========================================================================

    /// Removes `quantity` of `commodity` if enough is available.
    ///
    /// Returns the remaining level. Nothing changes on error.
    pub fn try_extract(&self, commodity: Commodity, quantity: Liters) -> CoreResult<Liters> {
        require_positive(quantity)?;

        let remaining = {
            let mut levels = self.levels();
            let level = levels.entry(commodity).or_insert(Liters::ZERO);
            if quantity > *level {
                return Err(CoreError::InsufficientFuel {
                    commodity: commodity.to_string(),
                    available: level.to_string(),
                    requested: quantity.to_string(),
                });
            }
            *level = *level - quantity;
            *level
        };

        debug!(%commodity, %quantity, %remaining, "Extracted");
        self.persist();
        Ok(remaining)
    }

    /// Boolean form of [`ResourceLedger::try_extract`].
    pub fn extract(&self, commodity: Commodity, quantity: Liters) -> bool {
        self.try_extract(commodity, quantity).is_ok()
    }

    /// Adds `quantity` of `commodity`. Returns the new level.
    ///
    /// A level never rises above [`Liters::MAX`]; nothing changes on error.
    pub fn try_replenish(&self, commodity: Commodity, quantity: Liters) -> CoreResult<Liters> {
        require_positive(quantity)?;

        let level = {
            let mut levels = self.levels();
            let level = levels.entry(commodity).or_insert(Liters::ZERO);
            let raised = level
                .checked_add(quantity)
                .filter(|raised| *raised <= Liters::MAX)
                .ok_or_else(|| ValidationError::OutOfRange {
                    field: format!("{} level", commodity),
                    max: Liters::MAX.to_string(),
                })?;
            *level = raised;
            raised
        };

        debug!(%commodity, %quantity, %level, "Replenished");
        self.persist();
        Ok(level)
    }

    /// Boolean form of [`ResourceLedger::try_replenish`].
    pub fn replenish(&self, commodity: Commodity, quantity: Liters) -> bool {
        self.try_replenish(commodity, quantity).is_ok()
    }

    // =========================================================================
    // Queries
    // =========================================================================

    /// Current level, zero for a commodity never stocked.
    pub fn level(&self, commodity: Commodity) -> Liters {
        self.levels().get(&commodity).copied().unwrap_or(Liters::ZERO)
    }

    /// Copy of every level.
    pub fn snapshot(&self) -> BTreeMap<Commodity, Liters> {
        self.levels().clone()
    }

    // =========================================================================
    // Persistence
    // =========================================================================

    /// Writes the whole ledger to its file.
    pub fn save(&self) -> StoreResult<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        let _guard = self.save_lock.lock().unwrap_or_else(|e| e.into_inner());
        let snapshot = self.snapshot();
        flatfile::write_lines_atomic(
            path,
            snapshot.iter().map(|(c, l)| format!("{},{}", c, l)),
        )
    }

    /// Reloads levels from the file. Returns the number of entries applied.
    ///
    /// Lines with an unknown commodity, a bad number or a negative level are
    /// skipped.
    pub fn load(&self) -> StoreResult<usize> {
        let Some(path) = &self.path else {
            return Ok(0);
        };

        let mut applied = 0;
        let lines = flatfile::read_lines(path)?;
        let mut levels = self.levels();
        for line in lines {
            match parse_level_line(&line) {
                Ok((commodity, level)) => {
                    levels.insert(commodity, level);
                    applied += 1;
                }
                Err(reason) => debug!(%line, %reason, "Skipping tank level line"),
            }
        }
        Ok(applied)
    }

    /// Saves and logs instead of failing; the in-memory change stands.
    fn persist(&self) {
        if let Err(e) = self.save() {
            warn!(error = %e, "Failed to persist tank levels");
        }
    }

    /// Spawns the periodic autosave. A final save runs on cancellation.
    pub fn spawn_autosave(
        self: &Arc<Self>,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let ledger = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick fires immediately.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        ledger.persist();
                        debug!("Autosave stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        ledger.persist();
                        debug!("Autosave complete");
                    }
                }
            }
        })
    }

    fn levels(&self) -> MutexGuard<'_, BTreeMap<Commodity, Liters>> {
        self.levels.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn require_positive(quantity: Liters) -> ValidationResult<()> {
    if quantity.is_positive() {
        Ok(())
    } else {
        Err(ValidationError::MustBePositive {
            field: "quantity".to_string(),
        })
    }
}

fn parse_level_line(line: &str) -> Result<(Commodity, Liters), String> {
    let (name, amount) = line
        .split_once(',')
        .ok_or_else(|| "missing ','".to_string())?;
    let commodity: Commodity = name.parse().map_err(|e: CoreError| e.to_string())?;
    let level: Liters = amount.parse().map_err(|e: ValidationError| e.to_string())?;
    if level.is_negative() {
        return Err("negative level".to_string());
    }
    Ok((commodity, level))
}

// =============================================================================
// Tests
// =============================================================================
