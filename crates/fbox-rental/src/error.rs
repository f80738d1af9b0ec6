//! # Rental Error Type
//!
//! Every way a basket can be turned away, with a stable machine code.
//!
//! ## Error Flow
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Where a basket can stop                              │
//! │                                                                         │
//! │  validate_basket ───── ValidationError ──────────┐                      │
//! │        │                                         │                      │
//! │        ▼                                         │                      │
//! │  admission reads ───── member / device /         │                      │
//! │        │               balance / quota rejects ──┼──► RentalError       │
//! │        ▼                                         │      { code, msg }   │
//! │  dispense loop  ────── never errors; failures    │                      │
//! │        │               are per-item outcomes     │                      │
//! │        ▼                                         │                      │
//! │  settlement ────────── DbError (rolled back) ────┘                      │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Serialization
//! A caller surface receives the code and the display message:
//! ```json
//! { "code": "device_offline", "message": "Device FBOX-0001 for P-TOP-L is offline" }
//! ```
//! A settlement failure also carries `items`, the per-item dispense outcomes.

use serde::ser::SerializeStruct;
use serde::{Serialize, Serializer};
use thiserror::Error;

use fbox_core::{Category, CoreError, ItemOutcome, Money, ValidationError};
use fbox_db::DbError;
use fbox_link::LinkError;

/// Rental orchestration errors.
#[derive(Debug, Error)]
pub enum RentalError {
    // =========================================================================
    // Input
    // =========================================================================
    /// Basket has no line items.
    #[error("Basket is empty")]
    EmptyBasket,

    /// A quantity is zero, negative or above the per-item limit.
    #[error("Invalid quantity: {0}")]
    InvalidQuantity(String),

    /// Any other malformed input (ids, PIN shape, basket size).
    #[error("Invalid input: {0}")]
    Validation(ValidationError),

    // =========================================================================
    // Member & Product
    // =========================================================================
    #[error("Member not found: {0}")]
    MemberNotFound(String),

    #[error("Member {0} is not active")]
    MemberInactive(String),

    /// Unknown or disabled product.
    #[error("Product not found: {0}")]
    ProductNotFound(String),

    #[error("Product {0} has no dispenser bound")]
    DeviceNotBound(String),

    /// No heartbeat within the liveness window.
    #[error("Device {device_id} for {product_id} is offline")]
    DeviceOffline {
        device_id: String,
        product_id: String,
    },

    // =========================================================================
    // Subscription
    // =========================================================================
    #[error("Subscription not found: {0}")]
    SubscriptionNotFound(i64),

    /// Expired, or not held by the requesting member.
    #[error("Subscription {0} is not active")]
    SubscriptionInactive(i64),

    #[error("{remaining} {category} left today, {requested} requested")]
    QuotaExceeded {
        category: Category,
        remaining: i64,
        requested: i64,
    },

    // =========================================================================
    // Vouchers
    // =========================================================================
    #[error("Voucher not found: {0}")]
    VoucherNotFound(i64),

    /// Pending, exhausted, expired, or held by another member.
    #[error("Voucher {0} is not active")]
    VoucherInactive(i64),

    #[error("Voucher {voucher_id} has {remaining} remaining, {requested} selected")]
    InsufficientBalance {
        voucher_id: i64,
        remaining: Money,
        requested: Money,
    },

    #[error("Voucher selections total {selected} but the basket costs {owed}")]
    InsufficientSelection { selected: Money, owed: Money },

    /// Duplicate voucher or non-positive amount in the selection list.
    #[error("Invalid voucher selection: {0}")]
    InvalidSelection(String),

    // =========================================================================
    // Downstream
    // =========================================================================
    /// An admission read failed in the ledger.
    #[error("Ledger error: {0}")]
    Ledger(#[from] DbError),

    /// Settlement rolled back after units had left the device. `items` is
    /// what was dispensed; nothing was charged.
    #[error("Settlement failed for {transaction_id}: {source}")]
    SettlementFailed {
        transaction_id: String,
        items: Vec<ItemOutcome>,
        source: DbError,
    },

    #[error("Device link error: {0}")]
    Link(#[from] LinkError),

    /// DISPENSE only goes through a rental.
    #[error("Command {0} cannot be sent directly")]
    CommandNotAllowed(String),
}

impl RentalError {
    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            RentalError::EmptyBasket => "empty_basket",
            RentalError::InvalidQuantity(_) => "invalid_quantity",
            RentalError::Validation(_) => "invalid_input",
            RentalError::MemberNotFound(_) => "member_not_found",
            RentalError::MemberInactive(_) => "member_inactive",
            RentalError::ProductNotFound(_) => "product_not_found",
            RentalError::DeviceNotBound(_) => "device_not_bound",
            RentalError::DeviceOffline { .. } => "device_offline",
            RentalError::SubscriptionNotFound(_) => "subscription_not_found",
            RentalError::SubscriptionInactive(_) => "subscription_inactive",
            RentalError::QuotaExceeded { .. } => "quota_exceeded",
            RentalError::VoucherNotFound(_) => "voucher_not_found",
            RentalError::VoucherInactive(_) => "voucher_inactive",
            RentalError::InsufficientBalance { .. } => "insufficient_balance",
            RentalError::InsufficientSelection { .. } => "insufficient_selection",
            RentalError::InvalidSelection(_) => "invalid_selection",
            RentalError::Ledger(err) | RentalError::SettlementFailed { source: err, .. } => {
                ledger_code(err)
            }
            RentalError::Link(_) => "transport_error",
            RentalError::CommandNotAllowed(_) => "command_not_allowed",
        }
    }

    /// True for rejections raised before any hardware was touched.
    pub fn is_admission(&self) -> bool {
        !matches!(
            self,
            RentalError::Ledger(_)
                | RentalError::SettlementFailed { .. }
                | RentalError::Link(_)
                | RentalError::CommandNotAllowed(_)
        )
    }

    /// Per-item outcomes, when the failure came after dispensing.
    pub fn dispensed_items(&self) -> Option<&[ItemOutcome]> {
        match self {
            RentalError::SettlementFailed { items, .. } => Some(items),
            _ => None,
        }
    }
}

fn ledger_code(err: &DbError) -> &'static str {
    match err {
        DbError::InsufficientBalance { .. } => "insufficient_balance",
        DbError::QuotaExceeded { .. } => "quota_exceeded",
        _ => "ledger_error",
    }
}

/// Splits basket shape problems out of the generic validation bucket.
impl From<ValidationError> for RentalError {
    fn from(err: ValidationError) -> Self {
        match err {
            ValidationError::Required { ref field } if field == "items" => RentalError::EmptyBasket,
            ValidationError::MustBePositive { ref field } | ValidationError::OutOfRange { ref field, .. }
                if field == "quantity" =>
            {
                RentalError::InvalidQuantity(err.to_string())
            }
            other => RentalError::Validation(other),
        }
    }
}

impl From<CoreError> for RentalError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::SelectionShortfall { selected, owed } => {
                RentalError::InsufficientSelection { selected, owed }
            }
            CoreError::DuplicateSelection(_) | CoreError::InvalidAmount { .. } => {
                RentalError::InvalidSelection(err.to_string())
            }
            CoreError::Validation(inner) => inner.into(),
            CoreError::UnknownLabel { .. } => RentalError::InvalidSelection(err.to_string()),
        }
    }
}

impl Serialize for RentalError {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let items = self.dispensed_items();
        let mut body = serializer.serialize_struct("RentalError", 2 + usize::from(items.is_some()))?;
        body.serialize_field("code", self.code())?;
        body.serialize_field("message", &self.to_string())?;
        if let Some(items) = items {
            body.serialize_field("items", items)?;
        }
        body.end()
    }
}

/// Result type for rental operations.
pub type RentalResult<T> = Result<T, RentalError>;

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_split() {
        let empty: RentalError = ValidationError::Required { field: "items".into() }.into();
        assert_eq!(empty.code(), "empty_basket");

        let qty: RentalError = ValidationError::MustBePositive { field: "quantity".into() }.into();
        assert_eq!(qty.code(), "invalid_quantity");

        let pin: RentalError = ValidationError::InvalidFormat {
            field: "pin".into(),
            reason: "must be 4 to 6 digits".into(),
        }
        .into();
        assert_eq!(pin.code(), "invalid_input");
    }

    #[test]
    fn test_ledger_rule_codes() {
        let err = RentalError::Ledger(DbError::InsufficientBalance {
            voucher_id: 1,
            remaining: 1000,
            requested: 1200,
        });
        assert_eq!(err.code(), "insufficient_balance");
        assert!(!err.is_admission());

        let err = RentalError::Ledger(DbError::PoolExhausted);
        assert_eq!(err.code(), "ledger_error");
    }

    #[test]
    fn test_core_errors_map_to_selection_codes() {
        let err: RentalError = CoreError::SelectionShortfall {
            selected: Money::from_won(500),
            owed: Money::from_won(600),
        }
        .into();
        assert_eq!(err.code(), "insufficient_selection");

        let err: RentalError = CoreError::DuplicateSelection(3).into();
        assert_eq!(err.code(), "invalid_selection");
    }

    #[test]
    fn test_settlement_failure_keeps_dispensed_items() {
        let err = RentalError::SettlementFailed {
            transaction_id: "TX-1".into(),
            items: vec![ItemOutcome {
                product_id: "P-TOP-L".into(),
                requested: 2,
                confirmed: 1,
                failure: Some(fbox_core::DispenseFailure::NoStock),
                charged: Money::from_won(600),
            }],
            source: DbError::QuotaExceeded {
                subscription_id: 4,
                category: "top".into(),
                remaining: 0,
                requested: 1,
            },
        };
        assert_eq!(err.code(), "quota_exceeded");
        assert!(!err.is_admission());
        assert_eq!(err.dispensed_items().map(|i| i.len()), Some(1));

        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["items"][0]["confirmed"], 1);
        assert_eq!(json["items"][0]["failure"], "no_stock");

        let plain = serde_json::to_value(RentalError::MemberNotFound("M404".into())).unwrap();
        assert!(plain.get("items").is_none());
    }

    #[test]
    fn test_serializes_code_and_message() {
        let err = RentalError::DeviceOffline {
            device_id: "FBOX-0001".into(),
            product_id: "P-TOP-L".into(),
        };
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["code"], "device_offline");
        assert_eq!(json["message"], "Device FBOX-0001 for P-TOP-L is offline");
    }
}
