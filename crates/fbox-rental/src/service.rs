//! # Rental Service
//!
//! Runs a basket end to end: admission, sequential dispensing, settlement.
//!
//! ## Transaction Flow
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       One basket, one transaction id                    │
//! │                                                                         │
//! │  1. ADMISSION (all-or-nothing, no hardware touched)                     │
//! │     member active ─► product enabled ─► device bound ─► heartbeat fresh │
//! │     subscription: Σ requested per category ≤ remaining today            │
//! │     vouchers:     Σ selections ≥ nominal, each voucher active & funded  │
//! │                                                                         │
//! │  2. DISPENSE (caller order, one unit at a time)                         │
//! │     for item in basket:                                                 │
//! │       for unit in 1..=quantity:                                         │
//! │         dispense_and_wait(device) ── Failed? ──► stop this item only    │
//! │                                                                         │
//! │  3. SETTLEMENT (confirmed units only, one SQL transaction)              │
//! │     subscription: rental rows + quota use                               │
//! │     vouchers:     rental rows + split deductions + bonus activation     │
//! │                                                                         │
//! │  4. AUDIT: rental_success / rental_failed                               │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! No ledger lock is held while waiting on hardware; settlement starts only
//! after the last unit resolves.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::json;
use tracing::{debug, info, warn};

use fbox_core::settlement::{classify_outcomes, line_total, plan_voucher_split, validate_selections};
use fbox_core::validation::{validate_basket, validate_id, validate_pin};
use fbox_core::{
    BasketItem, BusinessEvent, Category, DispenseOutcome, ItemOutcome, Money, NewRentalLogEntry,
    PaymentType, Product, TransactionStatus, VoucherSelection, DEFAULT_DISPENSE_TIMEOUT_SECS,
    DEFAULT_LIVENESS_WINDOW_SECS,
};
use fbox_db::{new_transaction_id, Database, DbError, Deduction, NewEvent};
use fbox_link::{Command, Dispenser, RentalSettings};

use crate::error::{RentalError, RentalResult};

// =============================================================================
// Configuration
// =============================================================================

/// Timing used by the orchestrator.
#[derive(Debug, Clone, Copy)]
pub struct RentalConfig {
    /// How long to wait for each unit's confirmation.
    pub dispense_timeout: Duration,
    /// Heartbeat age beyond which a device is refused at admission.
    pub liveness_window: chrono::Duration,
}

impl Default for RentalConfig {
    fn default() -> Self {
        RentalConfig {
            dispense_timeout: Duration::from_secs(DEFAULT_DISPENSE_TIMEOUT_SECS),
            liveness_window: chrono::Duration::seconds(DEFAULT_LIVENESS_WINDOW_SECS),
        }
    }
}

impl From<&RentalSettings> for RentalConfig {
    fn from(settings: &RentalSettings) -> Self {
        RentalConfig {
            dispense_timeout: settings.dispense_timeout(),
            liveness_window: settings.liveness_window(),
        }
    }
}

// =============================================================================
// Transaction Result
// =============================================================================

/// What the caller gets back for an admitted basket.
///
/// `status` is `Failed` only when no unit was confirmed; partial baskets are
/// reported as successes with the per-item breakdown in `items`.
#[derive(Debug, Clone, Serialize)]
pub struct TransactionResult {
    pub transaction_id: String,
    pub member_id: String,
    pub payment_type: PaymentType,
    pub status: TransactionStatus,
    pub message: String,
    pub items: Vec<ItemOutcome>,
    /// Price × requested, computed before dispensing.
    pub nominal: Money,
    /// Price × confirmed. Always zero on the subscription path.
    pub charged: Money,
    pub rental_log_ids: Vec<i64>,
    /// Voucher path only.
    pub deductions: Vec<Deduction>,
    /// Subscription path only: new used-today count per category.
    pub used_today: BTreeMap<Category, i64>,
}

impl TransactionResult {
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    pub fn confirmed_units(&self) -> i64 {
        self.items.iter().map(|i| i.confirmed).sum()
    }
}

/// A line item that passed admission.
#[derive(Debug, Clone)]
struct AdmittedItem {
    product: Product,
    device_id: String,
    quantity: i64,
}

// =============================================================================
// Service
// =============================================================================

/// The transaction orchestrator.
///
/// Holds its collaborators explicitly; clone the `Arc` to share it between
/// request handlers.
pub struct RentalService {
    pub(crate) db: Database,
    dispenser: Arc<dyn Dispenser>,
    pub(crate) config: RentalConfig,
}

impl RentalService {
    pub fn new(db: Database, dispenser: Arc<dyn Dispenser>, config: RentalConfig) -> Self {
        RentalService {
            db,
            dispenser,
            config,
        }
    }

    pub fn config(&self) -> &RentalConfig {
        &self.config
    }

    // =========================================================================
    // Subscription Path
    // =========================================================================

    /// Rents a basket against a day-quota subscription.
    ///
    /// ## Errors
    /// Admission rejections only; hardware failures come back as item outcomes.
    /// A settlement failure after dispensing returns
    /// [`RentalError::SettlementFailed`] carrying what the device released.
    pub async fn rent_with_subscription(
        &self,
        member_id: &str,
        items: &[BasketItem],
        subscription_id: i64,
    ) -> RentalResult<TransactionResult> {
        validate_id("member_id", member_id)?;
        validate_basket(items)?;
        self.admit_member(member_id).await?;
        self.admit_subscription(member_id, subscription_id).await?;
        let admitted = self.admit_items(items).await?;

        let mut wanted: BTreeMap<Category, i64> = BTreeMap::new();
        for item in &admitted {
            *wanted.entry(item.product.category).or_default() += item.quantity;
        }
        for (&category, &requested) in &wanted {
            let remaining = self
                .db
                .subscriptions()
                .get_remaining_today(subscription_id, category)
                .await?;
            if remaining < requested {
                return Err(RentalError::QuotaExceeded {
                    category,
                    remaining,
                    requested,
                });
            }
        }

        let transaction_id = new_transaction_id();
        info!(
            transaction_id = %transaction_id,
            member_id = %member_id,
            subscription_id,
            items = admitted.len(),
            "Subscription basket admitted"
        );

        let outcomes = self.dispense_basket(&transaction_id, &admitted, false).await;
        let status = classify_outcomes(&outcomes);
        let mut result = TransactionResult {
            transaction_id: transaction_id.clone(),
            member_id: member_id.to_string(),
            payment_type: PaymentType::Subscription,
            status,
            message: status.message().to_string(),
            items: outcomes,
            nominal: Money::zero(),
            charged: Money::zero(),
            rental_log_ids: Vec::new(),
            deductions: Vec::new(),
            used_today: BTreeMap::new(),
        };

        if status == TransactionStatus::Failed {
            self.audit(&result, None).await;
            return Ok(result);
        }

        let entries = rental_entries(&transaction_id, member_id, &admitted, &result.items, |entry| {
            entry.payment_type = PaymentType::Subscription;
            entry.subscription_id = Some(subscription_id);
        });

        let mut consumed: BTreeMap<Category, i64> = BTreeMap::new();
        for (item, outcome) in admitted.iter().zip(&result.items) {
            *consumed.entry(item.product.category).or_default() += outcome.confirmed;
        }
        let consumed: Vec<(Category, i64)> = consumed.into_iter().collect();

        match self
            .db
            .ledger()
            .settle_subscription(subscription_id, &entries, &consumed)
            .await
        {
            Ok(settlement) => {
                result.rental_log_ids = settlement.rental_log_ids;
                result.used_today = settlement.used_today;
            }
            Err(err) => return Err(self.settlement_failed(result, err).await),
        }

        info!(
            transaction_id = %transaction_id,
            member_id = %member_id,
            status = ?result.status,
            confirmed = result.confirmed_units(),
            "Subscription rental settled"
        );
        self.audit(&result, None).await;
        Ok(result)
    }

    // =========================================================================
    // Voucher Path
    // =========================================================================

    /// Rents a basket paid from one or more vouchers.
    ///
    /// Selections must cover the nominal price up front. After dispensing,
    /// only the confirmed units are charged, split across the selections in
    /// the order given; excess selection amounts stay in their vouchers.
    pub async fn rent_with_vouchers(
        &self,
        member_id: &str,
        items: &[BasketItem],
        selections: &[VoucherSelection],
    ) -> RentalResult<TransactionResult> {
        validate_id("member_id", member_id)?;
        validate_basket(items)?;
        self.admit_member(member_id).await?;
        let admitted = self.admit_items(items).await?;

        let nominal = line_total(admitted.iter().map(|a| (a.product.price(), a.quantity)));
        validate_selections(selections, nominal)?;
        self.admit_vouchers(member_id, selections).await?;

        let transaction_id = new_transaction_id();
        info!(
            transaction_id = %transaction_id,
            member_id = %member_id,
            nominal = nominal.won(),
            vouchers = selections.len(),
            "Voucher basket admitted"
        );

        let outcomes = self.dispense_basket(&transaction_id, &admitted, true).await;
        let status = classify_outcomes(&outcomes);
        let charged: Money = outcomes.iter().map(|o| o.charged).sum();
        let mut result = TransactionResult {
            transaction_id: transaction_id.clone(),
            member_id: member_id.to_string(),
            payment_type: PaymentType::Voucher,
            status,
            message: status.message().to_string(),
            items: outcomes,
            nominal,
            charged: Money::zero(),
            rental_log_ids: Vec::new(),
            deductions: Vec::new(),
            used_today: BTreeMap::new(),
        };

        if status == TransactionStatus::Failed {
            self.audit(&result, None).await;
            return Ok(result);
        }

        let plan = plan_voucher_split(selections, charged)?;
        let first_voucher = plan.first().map(|d| d.voucher_id);
        let entries = rental_entries(&transaction_id, member_id, &admitted, &result.items, |entry| {
            entry.payment_type = PaymentType::Voucher;
            entry.voucher_id = first_voucher;
        });

        match self.db.ledger().settle_vouchers(&entries, &plan).await {
            Ok(settlement) => {
                result.charged = settlement.charged;
                result.rental_log_ids = settlement.rental_log_ids;
                result.deductions = settlement.deductions;
            }
            Err(err) => return Err(self.settlement_failed(result, err).await),
        }

        info!(
            transaction_id = %transaction_id,
            member_id = %member_id,
            status = ?result.status,
            charged = result.charged.won(),
            "Voucher rental settled"
        );
        self.audit(&result, None).await;
        Ok(result)
    }

    // =========================================================================
    // Member & Admin Operations
    // =========================================================================

    /// Checks a member's payment PIN.
    pub async fn verify_payment_pin(&self, member_id: &str, pin: &str) -> RentalResult<bool> {
        validate_id("member_id", member_id)?;
        validate_pin(pin)?;

        let ok = self.db.members().verify_payment_pin(member_id, pin).await?;
        if !ok {
            debug!(member_id = %member_id, "Payment PIN mismatch");
        }
        Ok(ok)
    }

    /// Sends an administrative command. DISPENSE is refused: units only
    /// leave a device through a rental.
    pub async fn send_command(&self, device_id: &str, command: &Command) -> RentalResult<()> {
        validate_id("device_id", device_id)?;
        if matches!(command, Command::Dispense) {
            return Err(RentalError::CommandNotAllowed(command.as_str().to_string()));
        }

        self.dispenser.send_command(device_id, command).await?;
        info!(device_id = %device_id, command = %command, "Admin command sent");

        let locked = match command {
            Command::Lock => Some(true),
            Command::Unlock => Some(false),
            _ => None,
        };
        if let Some(locked) = locked {
            self.db.devices().set_locked(device_id, locked).await?;
        }
        Ok(())
    }

    // =========================================================================
    // Admission
    // =========================================================================

    async fn admit_member(&self, member_id: &str) -> RentalResult<()> {
        let member = self
            .db
            .members()
            .get(member_id)
            .await?
            .ok_or_else(|| RentalError::MemberNotFound(member_id.to_string()))?;

        if !member.is_active() {
            return Err(RentalError::MemberInactive(member_id.to_string()));
        }
        Ok(())
    }

    async fn admit_subscription(&self, member_id: &str, subscription_id: i64) -> RentalResult<()> {
        let subscription = self
            .db
            .subscriptions()
            .get_subscription(subscription_id)
            .await?
            .ok_or(RentalError::SubscriptionNotFound(subscription_id))?;

        if subscription.member_id != member_id {
            return Err(RentalError::SubscriptionNotFound(subscription_id));
        }

        // Also expires it if the window has lapsed.
        let active = self.db.subscriptions().get_active_subscriptions(member_id).await?;
        if !active.iter().any(|s| s.subscription_id == subscription_id) {
            return Err(RentalError::SubscriptionInactive(subscription_id));
        }
        Ok(())
    }

    /// Resolves every line to a product and a live device, in caller order.
    async fn admit_items(&self, items: &[BasketItem]) -> RentalResult<Vec<AdmittedItem>> {
        let now = chrono::Utc::now();
        let mut admitted = Vec::with_capacity(items.len());

        for item in items {
            let product = self
                .db
                .products()
                .get(&item.product_id)
                .await?
                .filter(|p| p.enabled)
                .ok_or_else(|| RentalError::ProductNotFound(item.product_id.clone()))?;

            let device_id = product
                .device_id
                .clone()
                .ok_or_else(|| RentalError::DeviceNotBound(item.product_id.clone()))?;

            let online = self
                .db
                .devices()
                .is_online(&device_id, self.config.liveness_window, now)
                .await?;
            if !online {
                warn!(device_id = %device_id, product_id = %product.product_id, "Device offline at admission");
                self.record_offline(&device_id, &product.product_id).await;
                return Err(RentalError::DeviceOffline {
                    device_id,
                    product_id: item.product_id.clone(),
                });
            }

            admitted.push(AdmittedItem {
                product,
                device_id,
                quantity: item.quantity,
            });
        }

        Ok(admitted)
    }

    /// Every selected voucher must be the member's, spendable, and hold at
    /// least its selected amount.
    async fn admit_vouchers(&self, member_id: &str, selections: &[VoucherSelection]) -> RentalResult<()> {
        let active = self.db.vouchers().get_active_vouchers(member_id).await?;

        for selection in selections {
            match active.iter().find(|v| v.voucher_id == selection.voucher_id) {
                Some(voucher) => {
                    if voucher.remaining() < selection.amount {
                        return Err(RentalError::InsufficientBalance {
                            voucher_id: voucher.voucher_id,
                            remaining: voucher.remaining(),
                            requested: selection.amount,
                        });
                    }
                }
                None => {
                    let stored = self.db.vouchers().get_voucher(selection.voucher_id).await?;
                    return Err(match stored {
                        Some(v) if v.member_id == member_id => {
                            RentalError::VoucherInactive(selection.voucher_id)
                        }
                        _ => RentalError::VoucherNotFound(selection.voucher_id),
                    });
                }
            }
        }
        Ok(())
    }

    // =========================================================================
    // Dispensing
    // =========================================================================

    /// Dispenses every admitted unit in order. An item stops at its first
    /// unconfirmed unit; the basket moves on to the next item.
    async fn dispense_basket(
        &self,
        transaction_id: &str,
        admitted: &[AdmittedItem],
        priced: bool,
    ) -> Vec<ItemOutcome> {
        let mut outcomes = Vec::with_capacity(admitted.len());

        for item in admitted {
            let mut confirmed = 0;
            let mut failure = None;

            for unit in 1..=item.quantity {
                match self
                    .dispenser
                    .dispense_and_wait(&item.device_id, self.config.dispense_timeout)
                    .await
                {
                    DispenseOutcome::Confirmed { reported_stock } => {
                        confirmed += 1;
                        debug!(
                            transaction_id = %transaction_id,
                            device_id = %item.device_id,
                            unit,
                            stock = ?reported_stock,
                            "Unit confirmed"
                        );
                    }
                    DispenseOutcome::Failed { reason } => {
                        warn!(
                            transaction_id = %transaction_id,
                            device_id = %item.device_id,
                            product_id = %item.product.product_id,
                            unit,
                            reason = %reason,
                            "Unit not dispensed; skipping rest of item"
                        );
                        failure = Some(reason);
                        break;
                    }
                }
            }

            let charged = if priced {
                item.product.price().multiply_quantity(confirmed)
            } else {
                Money::zero()
            };
            outcomes.push(ItemOutcome {
                product_id: item.product.product_id.clone(),
                requested: item.quantity,
                confirmed,
                failure,
                charged,
            });
        }

        outcomes
    }

    // =========================================================================
    // Audit
    // =========================================================================

    /// Audits a rolled-back settlement and wraps it with the dispensed items.
    async fn settlement_failed(&self, result: TransactionResult, err: DbError) -> RentalError {
        warn!(
            transaction_id = %result.transaction_id,
            confirmed = result.confirmed_units(),
            error = %err,
            "Settlement failed after dispensing"
        );
        self.audit(&result, Some(&err.to_string())).await;
        RentalError::SettlementFailed {
            transaction_id: result.transaction_id,
            items: result.items,
            source: err,
        }
    }

    /// Records `device_offline` for a device refused at admission.
    async fn record_offline(&self, device_id: &str, product_id: &str) {
        let last_heartbeat = match self.db.devices().get(device_id).await {
            Ok(device) => device.and_then(|d| d.last_heartbeat_at),
            Err(err) => {
                warn!(device_id = %device_id, error = %err, "Failed to read device");
                None
            }
        };

        let record = NewEvent::business(BusinessEvent::DeviceOffline)
            .device(device_id)
            .product(product_id)
            .details(json!({
                "last_heartbeat": last_heartbeat,
                "liveness_window_secs": self.config.liveness_window.num_seconds(),
            }));
        if let Err(err) = self.db.events().record(&record).await {
            warn!(device_id = %device_id, error = %err, "Failed to record device_offline");
        }
    }

    /// Records `rental_success` or `rental_failed`. Audit write failures are
    /// logged and never change the rental's result.
    async fn audit(&self, result: &TransactionResult, settlement_error: Option<&str>) {
        let event = if settlement_error.is_none() && result.is_success() {
            BusinessEvent::RentalSuccess
        } else {
            BusinessEvent::RentalFailed
        };

        let items: Vec<_> = result
            .items
            .iter()
            .map(|i| {
                json!({
                    "product_id": i.product_id,
                    "requested": i.requested,
                    "confirmed": i.confirmed,
                    "failure": i.failure.map(|f| f.as_str()),
                })
            })
            .collect();

        let mut record = NewEvent::business(event)
            .member(result.member_id.clone())
            .details(json!({
                "transaction_id": result.transaction_id,
                "payment_type": result.payment_type,
                "status": result.status,
                "charged": result.charged.won(),
                "items": items,
                "error": settlement_error,
            }));
        if let [only] = result.items.as_slice() {
            record = record.product(only.product_id.clone());
        }

        if let Err(err) = self.db.events().record(&record).await {
            warn!(transaction_id = %result.transaction_id, error = %err, "Failed to record rental event");
        }
    }
}

/// One rental row per item with at least one confirmed unit.
fn rental_entries(
    transaction_id: &str,
    member_id: &str,
    admitted: &[AdmittedItem],
    outcomes: &[ItemOutcome],
    payment: impl Fn(&mut NewRentalLogEntry),
) -> Vec<NewRentalLogEntry> {
    admitted
        .iter()
        .zip(outcomes)
        .filter(|(_, outcome)| outcome.confirmed > 0)
        .map(|(item, outcome)| {
            let mut entry = NewRentalLogEntry {
                transaction_id: transaction_id.to_string(),
                member_id: member_id.to_string(),
                product_id: item.product.product_id.clone(),
                product_name: item.product.name.clone(),
                device_id: item.device_id.clone(),
                quantity: outcome.confirmed,
                payment_type: PaymentType::Voucher,
                voucher_id: None,
                subscription_id: None,
                amount: outcome.charged.won(),
            };
            payment(&mut entry);
            entry
        })
        .collect()
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use chrono::Utc;
    use fbox_core::{DispenseFailure, Member, MemberStatus, VoucherProduct, VoucherStatus};
    use fbox_db::{BootAnnouncement, DbConfig, DbError, EventQuery};
    use fbox_link::LinkResult;

    /// Answers dispenses from a script; confirms once the script runs out.
    #[derive(Default)]
    struct ScriptedDispenser {
        script: Mutex<VecDeque<DispenseOutcome>>,
        calls: Mutex<Vec<String>>,
        commands: Mutex<Vec<String>>,
    }

    impl ScriptedDispenser {
        fn with_script(outcomes: Vec<DispenseOutcome>) -> Arc<Self> {
            Arc::new(ScriptedDispenser {
                script: Mutex::new(outcomes.into()),
                ..Default::default()
            })
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Dispenser for ScriptedDispenser {
        async fn dispense_and_wait(&self, device_id: &str, _timeout: Duration) -> DispenseOutcome {
            self.calls.lock().unwrap().push(device_id.to_string());
            self.script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(DispenseOutcome::Confirmed { reported_stock: None })
        }

        async fn send_command(&self, device_id: &str, command: &Command) -> LinkResult<()> {
            self.commands.lock().unwrap().push(format!("{device_id}:{command}"));
            Ok(())
        }
    }

    const OK: DispenseOutcome = DispenseOutcome::Confirmed { reported_stock: Some(9) };

    fn failed(reason: DispenseFailure) -> DispenseOutcome {
        DispenseOutcome::Failed { reason }
    }

    fn product(id: &str, category: Category, price: i64, device_id: &str) -> Product {
        Product {
            product_id: id.to_string(),
            category,
            size: "L".to_string(),
            name: format!("{category} L"),
            price,
            device_id: Some(device_id.to_string()),
            stock: 10,
            enabled: true,
            display_order: 0,
            updated_at: Utc::now(),
        }
    }

    fn member(id: &str, status: MemberStatus) -> Member {
        let now = Utc::now();
        Member {
            member_id: id.to_string(),
            name: format!("Member {id}"),
            phone: None,
            payment_pin: Some("1234".to_string()),
            status,
            created_at: now,
            updated_at: now,
        }
    }

    async fn heartbeat(db: &Database, device_id: &str) {
        db.devices()
            .register(&BootAnnouncement {
                device_id: device_id.to_string(),
                stock: Some(10),
                ..Default::default()
            })
            .await
            .unwrap();
    }

    /// Member `M001`, `P-TOP-L` (600) on FBOX-0001 and `P-PANTS-L` (800) on
    /// FBOX-0002, both devices online.
    async fn setup(dispenser: Arc<ScriptedDispenser>) -> (RentalService, Database) {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        db.members().upsert(&member("M001", MemberStatus::Active)).await.unwrap();
        db.products()
            .upsert(&product("P-TOP-L", Category::Top, 600, "FBOX-0001"))
            .await
            .unwrap();
        db.products()
            .upsert(&product("P-PANTS-L", Category::Pants, 800, "FBOX-0002"))
            .await
            .unwrap();
        heartbeat(&db, "FBOX-0001").await;
        heartbeat(&db, "FBOX-0002").await;

        let service = RentalService::new(db.clone(), dispenser, RentalConfig::default());
        (service, db)
    }

    async fn voucher(db: &Database, amount: i64, bonus: Option<&str>) -> i64 {
        let product_id = format!("VCH-T{amount}");
        db.vouchers()
            .upsert_product(&VoucherProduct {
                product_id: product_id.clone(),
                name: format!("{amount} test voucher"),
                price: amount,
                charge_amount: amount,
                validity_days: 30,
                bonus_product_id: bonus.map(str::to_string),
                is_bonus: false,
                enabled: true,
            })
            .await
            .unwrap();
        db.vouchers().issue_voucher("M001", &product_id).await.unwrap().voucher_id
    }

    async fn events_of(db: &Database, event_type: &str) -> usize {
        db.events()
            .recent(&EventQuery {
                event_type: Some(event_type.to_string()),
                ..Default::default()
            })
            .await
            .unwrap()
            .len()
    }

    // -------------------------------------------------------------------------
    // Subscription path
    // -------------------------------------------------------------------------

    #[tokio::test]
    async fn test_subscription_full_success() {
        let dispenser = ScriptedDispenser::with_script(vec![]);
        let (service, db) = setup(dispenser.clone()).await;
        let sub = db.subscriptions().issue_subscription("M001", "SUB-3M-PREMIUM").await.unwrap();

        let result = service
            .rent_with_subscription(
                "M001",
                &[BasketItem::new("P-TOP-L", 2), BasketItem::new("P-PANTS-L", 1)],
                sub.subscription_id,
            )
            .await
            .unwrap();

        assert_eq!(result.status, TransactionStatus::Success);
        assert_eq!(result.charged, Money::zero());
        assert_eq!(result.rental_log_ids.len(), 2);
        assert_eq!(result.used_today.get(&Category::Top), Some(&2));
        assert_eq!(dispenser.calls(), vec!["FBOX-0001", "FBOX-0001", "FBOX-0002"]);

        let rows = db.rentals().get_by_transaction(&result.transaction_id).await.unwrap();
        assert!(rows.iter().all(|r| r.amount == 0 && r.subscription_id == Some(sub.subscription_id)));
        assert_eq!(
            db.subscriptions()
                .get_remaining_today(sub.subscription_id, Category::Top)
                .await
                .unwrap(),
            0
        );
        assert_eq!(events_of(&db, "rental_success").await, 1);
    }

    #[tokio::test]
    async fn test_subscription_quota_checked_per_category_before_dispensing() {
        let dispenser = ScriptedDispenser::with_script(vec![]);
        let (service, db) = setup(dispenser.clone()).await;
        // Basic allows one top a day; two lines of one top each exceed it.
        let sub = db.subscriptions().issue_subscription("M001", "SUB-1M-BASIC").await.unwrap();

        let err = service
            .rent_with_subscription(
                "M001",
                &[BasketItem::new("P-TOP-L", 1), BasketItem::new("P-TOP-L", 1)],
                sub.subscription_id,
            )
            .await
            .unwrap_err();

        assert_eq!(err.code(), "quota_exceeded");
        assert!(dispenser.calls().is_empty());
    }

    #[tokio::test]
    async fn test_subscription_not_owned() {
        let dispenser = ScriptedDispenser::with_script(vec![]);
        let (service, db) = setup(dispenser.clone()).await;
        db.members().upsert(&member("M002", MemberStatus::Active)).await.unwrap();
        let sub = db.subscriptions().issue_subscription("M002", "SUB-1M-BASIC").await.unwrap();

        let err = service
            .rent_with_subscription("M001", &[BasketItem::new("P-TOP-L", 1)], sub.subscription_id)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "subscription_not_found");
    }

    #[tokio::test]
    async fn test_subscription_nothing_dispensed_charges_nothing() {
        let dispenser = ScriptedDispenser::with_script(vec![failed(DispenseFailure::DoorOpen)]);
        let (service, db) = setup(dispenser).await;
        let sub = db.subscriptions().issue_subscription("M001", "SUB-1M-BASIC").await.unwrap();

        let result = service
            .rent_with_subscription("M001", &[BasketItem::new("P-TOP-L", 1)], sub.subscription_id)
            .await
            .unwrap();

        assert_eq!(result.status, TransactionStatus::Failed);
        assert!(result.rental_log_ids.is_empty());
        assert_eq!(result.items[0].failure, Some(DispenseFailure::DoorOpen));
        assert_eq!(
            db.subscriptions()
                .get_remaining_today(sub.subscription_id, Category::Top)
                .await
                .unwrap(),
            1
        );
        assert_eq!(events_of(&db, "rental_failed").await, 1);
    }

    // -------------------------------------------------------------------------
    // Voucher path
    // -------------------------------------------------------------------------

    #[tokio::test]
    async fn test_partial_charges_confirmed_units_only() {
        // Third unit is never attempted once the second fails.
        let dispenser =
            ScriptedDispenser::with_script(vec![OK, failed(DispenseFailure::NoStock), OK]);
        let (service, db) = setup(dispenser.clone()).await;
        let voucher_id = voucher(&db, 5000, None).await;

        let result = service
            .rent_with_vouchers(
                "M001",
                &[BasketItem::new("P-TOP-L", 3)],
                &[VoucherSelection::new(voucher_id, 1800)],
            )
            .await
            .unwrap();

        assert_eq!(result.status, TransactionStatus::Partial);
        assert!(result.is_success());
        assert_eq!(result.nominal.won(), 1800);
        assert_eq!(result.charged.won(), 600);
        assert_eq!(result.items[0].confirmed, 1);
        assert_eq!(result.items[0].failure, Some(DispenseFailure::NoStock));
        assert_eq!(dispenser.calls().len(), 2);

        let rows = db.rentals().get_by_transaction(&result.transaction_id).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].quantity, 1);
        assert_eq!(rows[0].amount, 600);

        let stored = db.vouchers().get_voucher(voucher_id).await.unwrap().unwrap();
        assert_eq!(stored.remaining_amount, 4400);
    }

    #[tokio::test]
    async fn test_failed_item_does_not_stop_next_item() {
        let dispenser = ScriptedDispenser::with_script(vec![failed(DispenseFailure::Timeout), OK]);
        let (service, db) = setup(dispenser.clone()).await;
        let voucher_id = voucher(&db, 5000, None).await;

        let result = service
            .rent_with_vouchers(
                "M001",
                &[BasketItem::new("P-TOP-L", 1), BasketItem::new("P-PANTS-L", 1)],
                &[VoucherSelection::new(voucher_id, 1400)],
            )
            .await
            .unwrap();

        assert_eq!(result.status, TransactionStatus::Partial);
        assert_eq!(result.charged.won(), 800);
        assert_eq!(dispenser.calls(), vec!["FBOX-0001", "FBOX-0002"]);
    }

    #[tokio::test]
    async fn test_split_in_caller_order_leaves_excess() {
        let dispenser = ScriptedDispenser::with_script(vec![]);
        let (service, db) = setup(dispenser).await;
        let first = voucher(&db, 1000, None).await;
        let second = voucher(&db, 3000, None).await;

        let result = service
            .rent_with_vouchers(
                "M001",
                &[BasketItem::new("P-TOP-L", 2)],
                &[VoucherSelection::new(first, 1000), VoucherSelection::new(second, 3000)],
            )
            .await
            .unwrap();

        assert_eq!(result.charged.won(), 1200);
        assert_eq!(result.deductions.len(), 2);
        assert_eq!(result.deductions[0].amount, 1000);
        assert_eq!(result.deductions[1].amount, 200);

        let second = db.vouchers().get_voucher(second).await.unwrap().unwrap();
        assert_eq!(second.remaining_amount, 2800);

        let rows = db.rentals().get_by_transaction(&result.transaction_id).await.unwrap();
        assert_eq!(rows[0].voucher_id, Some(first));
    }

    #[tokio::test]
    async fn test_exhausting_voucher_activates_bonus() {
        let dispenser = ScriptedDispenser::with_script(vec![]);
        let (service, db) = setup(dispenser).await;
        let parent = voucher(&db, 600, Some("VCH-BONUS-5K")).await;

        let result = service
            .rent_with_vouchers(
                "M001",
                &[BasketItem::new("P-TOP-L", 1)],
                &[VoucherSelection::new(parent, 600)],
            )
            .await
            .unwrap();

        assert!(result.deductions[0].exhausted());
        assert_eq!(result.deductions[0].activated_bonus.len(), 1);

        let bonus_id = result.deductions[0].activated_bonus[0];
        let bonus = db.vouchers().get_voucher(bonus_id).await.unwrap().unwrap();
        assert_eq!(bonus.status, VoucherStatus::Active);
        assert!(bonus.valid_until.is_some());
    }

    #[tokio::test]
    async fn test_selection_above_balance_rejected_at_admission() {
        let dispenser = ScriptedDispenser::with_script(vec![]);
        let (service, db) = setup(dispenser.clone()).await;
        let voucher_id = voucher(&db, 1000, None).await;

        let err = service
            .rent_with_vouchers(
                "M001",
                &[BasketItem::new("P-TOP-L", 2)],
                &[VoucherSelection::new(voucher_id, 1200)],
            )
            .await
            .unwrap_err();

        assert_eq!(err.code(), "insufficient_balance");
        assert!(dispenser.calls().is_empty());
        let stored = db.vouchers().get_voucher(voucher_id).await.unwrap().unwrap();
        assert_eq!(stored.remaining_amount, 1000);
    }

    /// Spends part of a voucher while the unit is in flight, then confirms.
    struct SpendingDispenser {
        db: Database,
        voucher_id: i64,
    }

    #[async_trait]
    impl Dispenser for SpendingDispenser {
        async fn dispense_and_wait(&self, _device_id: &str, _timeout: Duration) -> DispenseOutcome {
            self.db
                .vouchers()
                .deduct_voucher(self.voucher_id, Money::from_won(500), None)
                .await
                .unwrap();
            OK
        }

        async fn send_command(&self, _device_id: &str, _command: &Command) -> LinkResult<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_balance_spent_between_admission_and_settlement() {
        let (_, db) = setup(ScriptedDispenser::with_script(vec![])).await;
        let voucher_id = voucher(&db, 1000, None).await;
        let service = RentalService::new(
            db.clone(),
            Arc::new(SpendingDispenser { db: db.clone(), voucher_id }),
            RentalConfig::default(),
        );

        let err = service
            .rent_with_vouchers(
                "M001",
                &[BasketItem::new("P-TOP-L", 1)],
                &[VoucherSelection::new(voucher_id, 600)],
            )
            .await
            .unwrap_err();

        assert_eq!(err.code(), "insufficient_balance");
        match &err {
            RentalError::SettlementFailed { items, source, .. } => {
                assert!(matches!(source, DbError::InsufficientBalance { .. }));
                assert_eq!(items.len(), 1);
                assert_eq!(items[0].product_id, "P-TOP-L");
                assert_eq!(items[0].confirmed, 1);
            }
            other => panic!("expected settlement failure, got {other:?}"),
        }

        // Rolled back: no rental row, only the concurrent spend applied.
        let stored = db.vouchers().get_voucher(voucher_id).await.unwrap().unwrap();
        assert_eq!(stored.remaining_amount, 500);
        assert!(db.rentals().get_member_rentals("M001", 10).await.unwrap().is_empty());
        assert_eq!(events_of(&db, "rental_failed").await, 1);
    }

    #[tokio::test]
    async fn test_selection_shortfall() {
        let dispenser = ScriptedDispenser::with_script(vec![]);
        let (service, db) = setup(dispenser).await;
        let voucher_id = voucher(&db, 5000, None).await;

        let err = service
            .rent_with_vouchers(
                "M001",
                &[BasketItem::new("P-TOP-L", 2)],
                &[VoucherSelection::new(voucher_id, 1000)],
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), "insufficient_selection");
    }

    #[tokio::test]
    async fn test_overflowing_selections_rejected_before_dispensing() {
        let dispenser = ScriptedDispenser::with_script(vec![]);
        let (service, db) = setup(dispenser.clone()).await;
        let voucher_id = voucher(&db, 5000, None).await;

        let err = service
            .rent_with_vouchers(
                "M001",
                &[BasketItem::new("P-TOP-L", 1)],
                &[VoucherSelection::new(voucher_id, i64::MAX), VoucherSelection::new(999, 1)],
            )
            .await
            .unwrap_err();

        assert_eq!(err.code(), "invalid_selection");
        assert!(dispenser.calls().is_empty());
    }

    #[tokio::test]
    async fn test_foreign_voucher_is_not_found() {
        let dispenser = ScriptedDispenser::with_script(vec![]);
        let (service, db) = setup(dispenser).await;
        let voucher_id = voucher(&db, 5000, None).await;
        db.members().upsert(&member("M002", MemberStatus::Active)).await.unwrap();

        let err = service
            .rent_with_vouchers(
                "M002",
                &[BasketItem::new("P-TOP-L", 1)],
                &[VoucherSelection::new(voucher_id, 600)],
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), "voucher_not_found");
    }

    #[tokio::test]
    async fn test_exhausted_voucher_is_inactive() {
        let dispenser = ScriptedDispenser::with_script(vec![]);
        let (service, db) = setup(dispenser).await;
        let voucher_id = voucher(&db, 600, None).await;
        db.vouchers()
            .deduct_voucher(voucher_id, Money::from_won(600), None)
            .await
            .unwrap();

        let err = service
            .rent_with_vouchers(
                "M001",
                &[BasketItem::new("P-TOP-L", 1)],
                &[VoucherSelection::new(voucher_id, 600)],
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), "voucher_inactive");
    }

    // -------------------------------------------------------------------------
    // Admission
    // -------------------------------------------------------------------------

    #[tokio::test]
    async fn test_stale_heartbeat_rejected_without_dispensing() {
        let dispenser = ScriptedDispenser::with_script(vec![]);
        let (service, db) = setup(dispenser.clone()).await;
        let voucher_id = voucher(&db, 5000, None).await;

        sqlx::query("UPDATE devices SET last_heartbeat_at = ?1 WHERE device_id = 'FBOX-0001'")
            .bind(Utc::now() - chrono::Duration::minutes(3))
            .execute(db.pool())
            .await
            .unwrap();

        let err = service
            .rent_with_vouchers(
                "M001",
                &[BasketItem::new("P-TOP-L", 1)],
                &[VoucherSelection::new(voucher_id, 600)],
            )
            .await
            .unwrap_err();

        assert_eq!(err.code(), "device_offline");
        assert!(dispenser.calls().is_empty());

        let offline = db
            .events()
            .recent(&EventQuery {
                event_type: Some("device_offline".into()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(offline.len(), 1);
        assert_eq!(offline[0].device_id.as_deref(), Some("FBOX-0001"));
        assert_eq!(offline[0].product_id.as_deref(), Some("P-TOP-L"));
        assert_eq!(offline[0].severity, fbox_core::Severity::Warning);
    }

    #[tokio::test]
    async fn test_member_and_product_checks() {
        let dispenser = ScriptedDispenser::with_script(vec![]);
        let (service, db) = setup(dispenser).await;
        db.members().upsert(&member("M009", MemberStatus::Inactive)).await.unwrap();
        let sub = db.subscriptions().issue_subscription("M001", "SUB-1M-BASIC").await.unwrap();
        let id = sub.subscription_id;

        let basket = [BasketItem::new("P-TOP-L", 1)];
        let err = service.rent_with_subscription("NOPE", &basket, id).await.unwrap_err();
        assert_eq!(err.code(), "member_not_found");

        let err = service.rent_with_subscription("M009", &basket, id).await.unwrap_err();
        assert_eq!(err.code(), "member_inactive");

        let err = service
            .rent_with_subscription("M001", &[BasketItem::new("P-NONE", 1)], id)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "product_not_found");

        let err = service.rent_with_subscription("M001", &[], id).await.unwrap_err();
        assert_eq!(err.code(), "empty_basket");

        let err = service
            .rent_with_subscription("M001", &[BasketItem::new("P-TOP-L", 0)], id)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "invalid_quantity");
    }

    #[tokio::test]
    async fn test_unbound_product() {
        let dispenser = ScriptedDispenser::with_script(vec![]);
        let (service, db) = setup(dispenser).await;
        let mut towel = product("P-TOWEL-F", Category::Towel, 500, "unused");
        towel.device_id = None;
        db.products().upsert(&towel).await.unwrap();
        let sub = db.subscriptions().issue_subscription("M001", "SUB-1M-BASIC").await.unwrap();

        let err = service
            .rent_with_subscription("M001", &[BasketItem::new("P-TOWEL-F", 1)], sub.subscription_id)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "device_not_bound");
    }

    // -------------------------------------------------------------------------
    // Admin
    // -------------------------------------------------------------------------

    #[tokio::test]
    async fn test_send_command_refuses_dispense() {
        let dispenser = ScriptedDispenser::with_script(vec![]);
        let (service, _db) = setup(dispenser.clone()).await;

        let err = service.send_command("FBOX-0001", &Command::Dispense).await.unwrap_err();
        assert_eq!(err.code(), "command_not_allowed");

        service.send_command("FBOX-0001", &Command::Lock).await.unwrap();
        assert_eq!(*dispenser.commands.lock().unwrap(), vec!["FBOX-0001:LOCK".to_string()]);
    }

    #[tokio::test]
    async fn test_lock_commands_mirror_into_device_row() {
        let dispenser = ScriptedDispenser::with_script(vec![]);
        let (service, db) = setup(dispenser).await;

        service.send_command("FBOX-0001", &Command::Lock).await.unwrap();
        assert!(db.devices().get("FBOX-0001").await.unwrap().unwrap().locked);

        service.send_command("FBOX-0001", &Command::Unlock).await.unwrap();
        assert!(!db.devices().get("FBOX-0001").await.unwrap().unwrap().locked);

        service.send_command("FBOX-0001", &Command::Status).await.unwrap();
        assert!(!db.devices().get("FBOX-0001").await.unwrap().unwrap().locked);
    }

    #[tokio::test]
    async fn test_verify_payment_pin() {
        let dispenser = ScriptedDispenser::with_script(vec![]);
        let (service, _db) = setup(dispenser).await;

        assert!(service.verify_payment_pin("M001", "1234").await.unwrap());
        assert!(!service.verify_payment_pin("M001", "9999").await.unwrap());
        assert_eq!(
            service.verify_payment_pin("M001", "12a4").await.unwrap_err().code(),
            "invalid_input"
        );
    }
}
