//! # Error Types
//!
//! Domain-specific error types for fbox-core.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Error Types                                     │
//! │                                                                         │
//! │  fbox-core errors (this file)                                          │
//! │  ├── CoreError        - Business rule violations                       │
//! │  └── ValidationError  - Input validation failures                      │
//! │                                                                         │
//! │  fbox-db errors       └── DbError     - Ledger / SQLite failures       │
//! │  fbox-link errors     └── LinkError   - Broker / protocol failures     │
//! │  fbox-rental errors   └── RentalError - Admission rejections           │
//! │                                                                         │
//! │  Flow: ValidationError → CoreError → RentalError → caller              │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use thiserror::Error;

use crate::money::Money;

// =============================================================================
// Core Error
// =============================================================================

/// Core business logic errors.
#[derive(Debug, Error)]
pub enum CoreError {
    /// The caller's voucher selections do not cover what is owed.
    ///
    /// ## When This Occurs
    /// - Admission: selections sum to less than the basket's nominal price
    /// - Settlement: never, since the charge only shrinks after dispensing
    #[error("Voucher selections total {selected} but {owed} is owed")]
    SelectionShortfall { selected: Money, owed: Money },

    /// An amount that must be positive was zero or negative.
    #[error("Invalid amount: {reason}")]
    InvalidAmount { reason: String },

    /// The same voucher appears twice in one selection list.
    #[error("Voucher {0} selected more than once")]
    DuplicateSelection(i64),

    /// Unknown wire label for a domain enum.
    #[error("Unknown {kind}: '{value}'")]
    UnknownLabel { kind: &'static str, value: String },

    /// Validation error (wraps ValidationError).
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),
}

// =============================================================================
// Validation Error
// =============================================================================

/// Input validation errors.
///
/// Raised before any ledger read or hardware action.
#[derive(Debug, Error)]
pub enum ValidationError {
    /// A required field is missing or empty.
    #[error("{field} is required")]
    Required { field: String },

    /// Field value is too long.
    #[error("{field} must be at most {max} characters")]
    TooLong { field: String, max: usize },

    /// Numeric value is out of range.
    #[error("{field} must be between {min} and {max}")]
    OutOfRange { field: String, min: i64, max: i64 },

    /// Value must be positive.
    #[error("{field} must be positive")]
    MustBePositive { field: String },

    /// Invalid format (e.g., a PIN with letters in it).
    #[error("{field} has invalid format: {reason}")]
    InvalidFormat { field: String, reason: String },
}

// =============================================================================
// Result Type Alias
// =============================================================================

/// Convenience type alias for Results with CoreError.
pub type CoreResult<T> = Result<T, CoreError>;

// =============================================================================
// Unit Tests
// =============================================================================
