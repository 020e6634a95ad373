//! # Error Types
//!
//! Domain-specific error types for fuelnet-core.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Error Types                                     │
//! │                                                                         │
//! │  fuelnet-core errors (this file)                                       │
//! │  ├── CoreError        - Domain rule violations                         │
//! │  └── ValidationError  - Input validation failures                      │
//! │                                                                         │
//! │  fuelnet-store errors (separate crate)                                 │
//! │  └── StoreError       - File and database failures                     │
//! │                                                                         │
//! │  fuelnet-sync errors (separate crate)                                  │
//! │  ├── ProtocolError    - Malformed wire lines                           │
//! │  └── SyncError        - Transport, handshake, config failures          │
//! │                                                                         │
//! │  Flow: ValidationError → CoreError → "ERROR: ..." line on the wire     │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use thiserror::Error;

/// Result type alias for domain operations.
pub type CoreResult<T> = Result<T, CoreError>;

// =============================================================================
// Core Error
// =============================================================================

/// Domain rule violations.
///
/// None of these are fatal. Each one is turned into a specific `ERROR:` reply
/// by whoever received the request.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Commodity name is not one of the known grades.
    #[error("Unknown commodity: {0}")]
    UnknownCommodity(String),

    /// The unit does not carry this commodity.
    #[error("Commodity {0} is not sold here")]
    CommodityNotCarried(String),

    /// Tank does not hold enough of a commodity.
    ///
    /// ## When This Occurs
    /// ```text
    /// EXTRAER 93 1500
    ///      │
    ///      ▼
    /// level(93) = 1000
    ///      │
    ///      ▼
    /// InsufficientFuel { commodity: "93", available: "1000", requested: "1500" }
    /// ```
    #[error("Insufficient {commodity}: available {available} L, requested {requested} L")]
    InsufficientFuel {
        commodity: String,
        available: String,
        requested: String,
    },

    /// A dispensing cycle is already in progress on this unit.
    #[error("Dispenser {unit_id} is busy")]
    DispenserBusy { unit_id: String },

    /// Validation error (wraps ValidationError).
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),
}

// =============================================================================
// Validation Error
// =============================================================================

/// Input validation errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    /// A required field is missing or empty.
    #[error("{field} is required")]
    Required { field: String },

    /// Field value is too long.
    #[error("{field} must be at most {max} characters")]
    TooLong { field: String, max: usize },

    /// Value must be positive.
    #[error("{field} must be positive")]
    MustBePositive { field: String },

    /// Value exceeds the accepted maximum.
    #[error("{field} must be at most {max}")]
    OutOfRange { field: String, max: String },

    /// Value must not be negative.
    #[error("{field} must not be negative")]
    MustNotBeNegative { field: String },

    /// Value is not a number or does not follow the expected layout.
    #[error("{field} has invalid format: {reason}")]
    InvalidFormat { field: String, reason: String },
}

impl ValidationError {
    /// Shorthand for [`ValidationError::InvalidFormat`].
    pub fn invalid_format(field: &str, reason: impl Into<String>) -> Self {
        ValidationError::InvalidFormat {
            field: field.to_string(),
            reason: reason.into(),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = CoreError::InsufficientFuel {
            commodity: "93".into(),
            available: "1000".into(),
            requested: "1500".into(),
        };
        assert_eq!(
            err.to_string(),
            "Insufficient 93: available 1000 L, requested 1500 L"
        );
    }

    #[test]
    fn test_validation_error_conversion() {
        let validation_err = ValidationError::MustBePositive {
            field: "quantity".into(),
        };
        let core_err: CoreError = validation_err.into();

        assert!(matches!(core_err, CoreError::Validation(_)));
        assert_eq!(
            core_err.to_string(),
            "Validation error: quantity must be positive"
        );
    }
}
