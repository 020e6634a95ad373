//! # Validation Module
//!
//! Identifier checks shared by every persisted format.
//!
//! Unit ids end up inside `|`- and `,`-delimited files and as a single
//! whitespace-separated token on the wire, so none of those characters are
//! allowed in them.

use crate::error::ValidationError;

/// Result type for validation operations.
pub type ValidationResult<T> = Result<T, ValidationError>;

/// Longest accepted unit or node id.
pub const MAX_ID_LENGTH: usize = 64;

/// Validates a unit or node id, returning it trimmed.
///
/// ## Rules
/// - Must not be empty
/// - At most [`MAX_ID_LENGTH`] characters
/// - No whitespace, `|` or `,`
///
/// ## Example
/// ```rust
/// use fuelnet_core::validation::validate_unit_id;
///
/// assert_eq!(validate_unit_id(" 3 ").unwrap(), "3");
/// assert!(validate_unit_id("a|b").is_err());
/// ```
pub fn validate_unit_id(raw: &str) -> ValidationResult<String> {
    let id = raw.trim();
    if id.is_empty() {
        return Err(ValidationError::Required {
            field: "unit id".to_string(),
        });
    }
    if id.chars().count() > MAX_ID_LENGTH {
        return Err(ValidationError::TooLong {
            field: "unit id".to_string(),
            max: MAX_ID_LENGTH,
        });
    }
    if id.chars().any(|c| c.is_whitespace() || c == '|' || c == ',') {
        return Err(ValidationError::invalid_format(
            "unit id",
            "must not contain whitespace, '|' or ','",
        ));
    }
    Ok(id.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_unit_id() {
        assert_eq!(validate_unit_id("1").unwrap(), "1");
        assert_eq!(validate_unit_id("Distribuidor_Norte").unwrap(), "Distribuidor_Norte");
        assert!(validate_unit_id("").is_err());
        assert!(validate_unit_id("   ").is_err());
        assert!(validate_unit_id("two words").is_err());
        assert!(validate_unit_id("a,b").is_err());
        assert!(validate_unit_id(&"x".repeat(MAX_ID_LENGTH + 1)).is_err());
    }
}
