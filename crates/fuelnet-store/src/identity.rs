//! # Unit Identity Recovery
//!
//! A pump keeps the id it was first given across restarts.
//!
//! ## Resolution Order
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  1. id set in configuration            → use it                         │
//! │  2. pending queue non-empty            → id of its oldest record        │
//! │     (proves the unit had that id before its last state write)           │
//! │  3. state file holds exactly one id    → that id                        │
//! │  4. otherwise                          → lowest slot 1..=N not present  │
//! │                                          in the state file              │
//! │  5. all N slots taken                  → first free number above N      │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Step 4 covers several pumps sharing one state file on a single host. Such
//! pumps should set their id explicitly; a restarted pump would otherwise
//! pick the lowest free slot rather than its previous one.

use fuelnet_core::validation::validate_unit_id;
use tracing::{info, warn};

use crate::error::{StoreError, StoreResult};
use crate::pending::PendingQueue;
use crate::unit_state::UnitStateFile;

/// Where a resolved id came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentitySource {
    Configured,
    PendingQueue,
    StateFile,
    FreeSlot,
}

/// Resolves the id of a pump at boot.
pub fn resolve_unit_id(
    configured: Option<&str>,
    queue: &PendingQueue,
    state: &UnitStateFile,
    slots: u32,
) -> StoreResult<(String, IdentitySource)> {
    if let Some(raw) = configured {
        let id = validate_unit_id(raw)
            .map_err(|e| StoreError::corrupt("configured unit id", e.to_string()))?;
        return Ok((id, IdentitySource::Configured));
    }

    if let Some(id) = queue.first_unit_id()? {
        info!(unit_id = %id, "Identity recovered from pending queue");
        return Ok((id, IdentitySource::PendingQueue));
    }

    let known = state.unit_ids()?;
    if let (1, Some(id)) = (known.len(), known.first()) {
        info!(unit_id = %id, "Identity recovered from state file");
        return Ok((id.clone(), IdentitySource::StateFile));
    }

    let mut slot = 1u32;
    while known.contains(&slot.to_string()) {
        slot += 1;
    }
    if slot > slots {
        warn!(slot, slots, "All unit slots taken; using an overflow id");
    }
    info!(unit_id = slot, "Identity assigned from free slot");
    Ok((slot.to_string(), IdentitySource::FreeSlot))
}
