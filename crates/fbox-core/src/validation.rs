//! # Validation Module
//!
//! Input validation for rental requests.
//!
//! ## Validation Strategy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      Validation Layers                                  │
//! │                                                                         │
//! │  Layer 1: Request shape (THIS MODULE)                                  │
//! │  ├── member id present, basket non-empty, quantities in range          │
//! │  └── no ledger reads, no hardware                                      │
//! │           │                                                             │
//! │           ▼                                                             │
//! │  Layer 2: Admission (fbox-rental)                                      │
//! │  ├── member active, device online, balance / quota sufficient          │
//! │           │                                                             │
//! │           ▼                                                             │
//! │  Layer 3: Ledger (fbox-db)                                             │
//! │  ├── deduction re-checks the balance inside the write transaction      │
//! │  └── quota use re-checks remaining-today                               │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use crate::error::ValidationError;
use crate::types::BasketItem;
use crate::{MAX_BASKET_ITEMS, MAX_ITEM_QUANTITY};

/// Result type for validation operations.
pub type ValidationResult<T> = Result<T, ValidationError>;

// =============================================================================
// String Validators
// =============================================================================

/// Validates an identifier (member, product, device).
///
/// ## Example
/// ```rust
/// use fbox_core::validation::validate_id;
///
/// assert!(validate_id("member_id", "M0001").is_ok());
/// assert!(validate_id("member_id", "  ").is_err());
/// ```
pub fn validate_id(field: &str, value: &str) -> ValidationResult<()> {
    let value = value.trim();

    if value.is_empty() {
        return Err(ValidationError::Required {
            field: field.to_string(),
        });
    }

    if value.len() > 64 {
        return Err(ValidationError::TooLong {
            field: field.to_string(),
            max: 64,
        });
    }

    Ok(())
}

/// Validates the shape of a payment PIN: 4 to 6 ASCII digits.
pub fn validate_pin(pin: &str) -> ValidationResult<()> {
    if pin.is_empty() {
        return Err(ValidationError::Required {
            field: "pin".to_string(),
        });
    }

    if !(4..=6).contains(&pin.len()) || !pin.chars().all(|c| c.is_ascii_digit()) {
        return Err(ValidationError::InvalidFormat {
            field: "pin".to_string(),
            reason: "must be 4 to 6 digits".to_string(),
        });
    }

    Ok(())
}

// =============================================================================
// Numeric Validators
// =============================================================================

/// Validates a line item quantity.
///
/// ## Rules
/// - Must be positive (> 0)
/// - Must not exceed MAX_ITEM_QUANTITY
pub fn validate_quantity(qty: i64) -> ValidationResult<()> {
    if qty <= 0 {
        return Err(ValidationError::MustBePositive {
            field: "quantity".to_string(),
        });
    }

    if qty > MAX_ITEM_QUANTITY {
        return Err(ValidationError::OutOfRange {
            field: "quantity".to_string(),
            min: 1,
            max: MAX_ITEM_QUANTITY,
        });
    }

    Ok(())
}

/// Validates a price in won. Zero is allowed.
pub fn validate_price(won: i64) -> ValidationResult<()> {
    if won < 0 {
        return Err(ValidationError::OutOfRange {
            field: "price".to_string(),
            min: 0,
            max: i64::MAX,
        });
    }

    Ok(())
}

// =============================================================================
// Collection Validators
// =============================================================================

/// Validates a basket: non-empty, bounded, every line valid.
pub fn validate_basket(items: &[BasketItem]) -> ValidationResult<()> {
    if items.is_empty() {
        return Err(ValidationError::Required {
            field: "items".to_string(),
        });
    }

    if items.len() > MAX_BASKET_ITEMS {
        return Err(ValidationError::OutOfRange {
            field: "items".to_string(),
            min: 1,
            max: MAX_BASKET_ITEMS as i64,
        });
    }

    for item in items {
        validate_id("product_id", &item.product_id)?;
        validate_quantity(item.quantity)?;
    }

    Ok(())
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_id() {
        assert!(validate_id("member_id", "M0001").is_ok());
        assert!(validate_id("member_id", "").is_err());
        assert!(validate_id("member_id", &"x".repeat(65)).is_err());
    }

    #[test]
    fn test_validate_pin() {
        assert!(validate_pin("1234").is_ok());
        assert!(validate_pin("123456").is_ok());
        assert!(validate_pin("123").is_err());
        assert!(validate_pin("12a4").is_err());
        assert!(validate_pin("").is_err());
    }

    #[test]
    fn test_validate_quantity() {
        assert!(validate_quantity(1).is_ok());
        assert!(validate_quantity(MAX_ITEM_QUANTITY).is_ok());
        assert!(validate_quantity(0).is_err());
        assert!(validate_quantity(-1).is_err());
        assert!(validate_quantity(MAX_ITEM_QUANTITY + 1).is_err());
    }

    #[test]
    fn test_validate_basket() {
        assert!(validate_basket(&[BasketItem::new("P-TOP-L", 2)]).is_ok());
        assert!(validate_basket(&[]).is_err());
        assert!(validate_basket(&[BasketItem::new("P-TOP-L", 0)]).is_err());
        assert!(validate_basket(&[BasketItem::new("", 1)]).is_err());

        let too_many: Vec<_> = (0..=MAX_BASKET_ITEMS)
            .map(|i| BasketItem::new(format!("P-{i}"), 1))
            .collect();
        assert!(validate_basket(&too_many).is_err());
    }
}
