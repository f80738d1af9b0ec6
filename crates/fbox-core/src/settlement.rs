//! # Settlement Arithmetic
//!
//! Pure functions that turn "what the hardware confirmed" into "what the
//! member owes" and "which vouchers pay for it".
//!
//! ## Flow
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  basket ──► nominal total (price × requested)  ── admission check      │
//! │                                                                         │
//! │  dispense loop ──► ItemOutcome { requested, confirmed, failure }       │
//! │                                                                         │
//! │  actual charge = Σ price × confirmed          ── never requested       │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  plan_voucher_split(selections, charge)                                │
//! │     walk selections in caller order                                    │
//! │     take min(selection, still owed) from each                          │
//! │     stop when nothing is owed; excess stays in the voucher             │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};
use crate::money::Money;

// =============================================================================
// Dispense Outcome
// =============================================================================

/// Why a single unit was not confirmed.
///
/// `DeviceFault` extends the device's own reasons: it covers a failure whose
/// reason is missing or unrecognised. The raw reason string stays in the
/// `dispense_failed` audit row's payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispenseFailure {
    DeviceLocked,
    NoStock,
    DoorOpen,
    EmergencyStop,
    /// No completion or failure event arrived in time.
    Timeout,
    /// Broker connection was down; nothing was sent.
    TransportUnavailable,
    /// Broker client rejected the publish.
    SendFailed,
    /// Firmware reported no reason, or one outside the known set.
    DeviceFault,
}

impl DispenseFailure {
    pub fn as_str(&self) -> &'static str {
        match self {
            DispenseFailure::DeviceLocked => "device_locked",
            DispenseFailure::NoStock => "no_stock",
            DispenseFailure::DoorOpen => "door_open",
            DispenseFailure::EmergencyStop => "emergency_stop",
            DispenseFailure::Timeout => "timeout",
            DispenseFailure::TransportUnavailable => "transport_unavailable",
            DispenseFailure::SendFailed => "send_failed",
            DispenseFailure::DeviceFault => "device_fault",
        }
    }

    /// Maps the `reason` field of a `dispense_failed` event.
    pub fn from_device_reason(reason: &str) -> Self {
        match reason.trim().to_lowercase().as_str() {
            "device_locked" | "locked" => DispenseFailure::DeviceLocked,
            "no_stock" | "out_of_stock" | "empty" => DispenseFailure::NoStock,
            "door_open" => DispenseFailure::DoorOpen,
            "emergency_stop" | "estop" => DispenseFailure::EmergencyStop,
            "timeout" => DispenseFailure::Timeout,
            _ => DispenseFailure::DeviceFault,
        }
    }
}

impl fmt::Display for DispenseFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Resolution of one dispense request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum DispenseOutcome {
    /// The device confirmed one unit; `reported_stock` is its post-dispense count.
    Confirmed { reported_stock: Option<i64> },
    Failed { reason: DispenseFailure },
}

impl DispenseOutcome {
    #[inline]
    pub fn is_confirmed(&self) -> bool {
        matches!(self, DispenseOutcome::Confirmed { .. })
    }

    pub fn failure(&self) -> Option<DispenseFailure> {
        match self {
            DispenseOutcome::Failed { reason } => Some(*reason),
            DispenseOutcome::Confirmed { .. } => None,
        }
    }
}

// =============================================================================
// Item Outcome & Classification
// =============================================================================

/// What happened to one line item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemOutcome {
    pub product_id: String,
    pub requested: i64,
    pub confirmed: i64,
    /// First failure that stopped the item's loop.
    pub failure: Option<DispenseFailure>,
    /// Charged for this item (price × confirmed; zero on the subscription path).
    pub charged: Money,
}

impl ItemOutcome {
    #[inline]
    pub fn is_complete(&self) -> bool {
        self.confirmed == self.requested
    }
}

/// Overall classification of a basket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    /// Every requested unit was confirmed.
    Success,
    /// Some units were confirmed; the member pays for those only.
    Partial,
    /// Nothing was confirmed; nothing was charged.
    Failed,
}

impl TransactionStatus {
    /// Partial success is reported as success with an itemised breakdown.
    pub fn is_success(&self) -> bool {
        !matches!(self, TransactionStatus::Failed)
    }

    pub fn message(&self) -> &'static str {
        match self {
            TransactionStatus::Success => "All items dispensed",
            TransactionStatus::Partial => "Some items dispensed; charged for dispensed items only",
            TransactionStatus::Failed => "No items dispensed; nothing charged",
        }
    }
}

/// Classifies a basket from its per-item outcomes.
pub fn classify_outcomes(items: &[ItemOutcome]) -> TransactionStatus {
    let confirmed: i64 = items.iter().map(|i| i.confirmed).sum();
    if confirmed == 0 {
        TransactionStatus::Failed
    } else if items.iter().all(ItemOutcome::is_complete) {
        TransactionStatus::Success
    } else {
        TransactionStatus::Partial
    }
}

/// Price × quantity, summed. Used for both nominal and actual totals.
pub fn line_total<I>(lines: I) -> Money
where
    I: IntoIterator<Item = (Money, i64)>,
{
    lines.into_iter().map(|(price, qty)| price.multiply_quantity(qty)).sum()
}

// =============================================================================
// Voucher Split
// =============================================================================

/// Caller's choice of how much of a voucher to put towards a basket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoucherSelection {
    pub voucher_id: i64,
    pub amount: Money,
}

impl VoucherSelection {
    pub fn new(voucher_id: i64, amount: i64) -> Self {
        VoucherSelection {
            voucher_id,
            amount: Money::from_won(amount),
        }
    }
}

/// A deduction the ledger will perform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlannedDeduction {
    pub voucher_id: i64,
    pub amount: Money,
}

/// Checks selection shape and that it covers `owed`. Returns the selection total.
pub fn validate_selections(selections: &[VoucherSelection], owed: Money) -> CoreResult<Money> {
    let mut seen = HashSet::new();
    for selection in selections {
        if !selection.amount.is_positive() {
            return Err(CoreError::InvalidAmount {
                reason: format!("selection for voucher {} must be positive", selection.voucher_id),
            });
        }
        if !seen.insert(selection.voucher_id) {
            return Err(CoreError::DuplicateSelection(selection.voucher_id));
        }
    }

    let selected = selections
        .iter()
        .try_fold(Money::zero(), |acc, s| acc.checked_add(s.amount))
        .ok_or_else(|| CoreError::InvalidAmount {
            reason: "selection total is out of range".to_string(),
        })?;
    if selected < owed {
        return Err(CoreError::SelectionShortfall { selected, owed });
    }
    Ok(selected)
}

/// Splits `owed` across the selections in caller order.
///
/// Each selection contributes `min(selection, still owed)`. Selections after
/// the debt reaches zero contribute nothing and are omitted from the plan.
///
/// ## Example
/// ```rust
/// use fbox_core::money::Money;
/// use fbox_core::settlement::{plan_voucher_split, VoucherSelection};
///
/// let plan = plan_voucher_split(
///     &[VoucherSelection::new(1, 1000), VoucherSelection::new(2, 1000)],
///     Money::from_won(1200),
/// ).unwrap();
///
/// assert_eq!(plan.len(), 2);
/// assert_eq!(plan[0].amount.won(), 1000);
/// assert_eq!(plan[1].amount.won(), 200);
/// ```
pub fn plan_voucher_split(
    selections: &[VoucherSelection],
    owed: Money,
) -> CoreResult<Vec<PlannedDeduction>> {
    validate_selections(selections, owed)?;

    let mut remaining = owed;
    let mut plan = Vec::new();
    for selection in selections {
        if !remaining.is_positive() {
            break;
        }
        let take = selection.amount.min(remaining);
        plan.push(PlannedDeduction {
            voucher_id: selection.voucher_id,
            amount: take,
        });
        remaining -= take;
    }
    Ok(plan)
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn outcome(requested: i64, confirmed: i64) -> ItemOutcome {
        ItemOutcome {
            product_id: "P-TOP-L".into(),
            requested,
            confirmed,
            failure: (confirmed < requested).then_some(DispenseFailure::NoStock),
            charged: Money::from_won(1000 * confirmed),
        }
    }

    #[test]
    fn test_split_walks_in_caller_order() {
        let plan = plan_voucher_split(
            &[VoucherSelection::new(7, 500), VoucherSelection::new(3, 5000)],
            Money::from_won(1200),
        )
        .unwrap();

        assert_eq!(
            plan,
            vec![
                PlannedDeduction { voucher_id: 7, amount: Money::from_won(500) },
                PlannedDeduction { voucher_id: 3, amount: Money::from_won(700) },
            ]
        );
    }

    #[test]
    fn test_selection_total_overflow_is_rejected() {
        let err = validate_selections(
            &[VoucherSelection::new(1, i64::MAX), VoucherSelection::new(2, 1)],
            Money::from_won(600),
        )
        .unwrap_err();
        assert!(matches!(err, CoreError::InvalidAmount { .. }));

        // Would wrap past the owed amount without the checked total.
        let err = plan_voucher_split(
            &[
                VoucherSelection::new(1, i64::MAX),
                VoucherSelection::new(2, i64::MAX),
                VoucherSelection::new(3, 1202),
            ],
            Money::from_won(1200),
        )
        .unwrap_err();
        assert!(matches!(err, CoreError::InvalidAmount { .. }));
    }

    #[test]
    fn test_split_leaves_excess_untouched() {
        // Charge shrank after a unit failed: later selections are not touched.
        let plan = plan_voucher_split(
            &[VoucherSelection::new(1, 1200), VoucherSelection::new(2, 800)],
            Money::from_won(600),
        )
        .unwrap();

        assert_eq!(plan.len(), 1);
        assert_eq!(plan[0].voucher_id, 1);
        assert_eq!(plan[0].amount.won(), 600);
    }

    #[test]
    fn test_split_zero_owed_plans_nothing() {
        let plan = plan_voucher_split(&[VoucherSelection::new(1, 1000)], Money::zero()).unwrap();
        assert!(plan.is_empty());
    }

    #[test]
    fn test_selection_shortfall() {
        let err = validate_selections(&[VoucherSelection::new(1, 1000)], Money::from_won(1200))
            .unwrap_err();
        assert!(matches!(err, CoreError::SelectionShortfall { .. }));
    }

    #[test]
    fn test_selection_rejects_duplicates_and_non_positive() {
        let dup = validate_selections(
            &[VoucherSelection::new(1, 600), VoucherSelection::new(1, 600)],
            Money::from_won(1200),
        );
        assert!(matches!(dup, Err(CoreError::DuplicateSelection(1))));

        let zero = validate_selections(&[VoucherSelection::new(1, 0)], Money::zero());
        assert!(matches!(zero, Err(CoreError::InvalidAmount { .. })));
    }

    #[test]
    fn test_classification() {
        assert_eq!(classify_outcomes(&[outcome(2, 2), outcome(1, 1)]), TransactionStatus::Success);
        assert_eq!(classify_outcomes(&[outcome(3, 1)]), TransactionStatus::Partial);
        assert_eq!(classify_outcomes(&[outcome(2, 2), outcome(1, 0)]), TransactionStatus::Partial);
        assert_eq!(classify_outcomes(&[outcome(2, 0), outcome(1, 0)]), TransactionStatus::Failed);
        assert!(TransactionStatus::Partial.is_success());
        assert!(!TransactionStatus::Failed.is_success());
    }

    #[test]
    fn test_line_total_uses_given_quantity() {
        let price = Money::from_won(600);
        assert_eq!(line_total([(price, 2)]).won(), 1200);
        assert_eq!(line_total([(price, 1), (Money::from_won(1000), 0)]).won(), 600);
    }

    #[test]
    fn test_device_reason_mapping() {
        assert_eq!(DispenseFailure::from_device_reason("no_stock"), DispenseFailure::NoStock);
        assert_eq!(DispenseFailure::from_device_reason("DOOR_OPEN"), DispenseFailure::DoorOpen);
        assert_eq!(DispenseFailure::from_device_reason("device_locked"), DispenseFailure::DeviceLocked);
        assert_eq!(DispenseFailure::from_device_reason("emergency_stop"), DispenseFailure::EmergencyStop);
        assert_eq!(DispenseFailure::from_device_reason("motor_jam"), DispenseFailure::DeviceFault);
    }
}
