//! # Ledger Repository
//!
//! Settles a finished basket in one SQL transaction under the writer lock.
//!
//! ## Voucher Settlement
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  BEGIN                                                                  │
//! │    INSERT rental_logs  (one per item with confirmed units)  → ids      │
//! │    for each planned deduction, in caller order:                        │
//! │        re-check balance ──► InsufficientBalance? ──► ROLLBACK          │
//! │        UPDATE member_vouchers, INSERT voucher_transactions(ids[0])     │
//! │        exhausted? ──► activate pending bonus children                  │
//! │  COMMIT                                                                 │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The balance is re-validated here even though admission checked it: a
//! concurrent request by the same member may have spent it in between.

use std::collections::BTreeMap;

use chrono::Utc;
use serde::Serialize;
use sqlx::SqlitePool;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{DbError, DbResult};
use crate::pool::WriteLock;
use crate::repository::rental::insert_entry_in;
use crate::repository::subscription::use_quota_in;
use crate::repository::voucher::{deduct_in, Deduction};
use fbox_core::{Category, Money, NewRentalLogEntry, PlannedDeduction};

/// Generates a transaction id grouping the rows of one basket.
pub fn new_transaction_id() -> String {
    Uuid::new_v4().to_string()
}

/// Result of a committed voucher settlement.
#[derive(Debug, Clone, Serialize)]
pub struct VoucherSettlement {
    pub rental_log_ids: Vec<i64>,
    pub deductions: Vec<Deduction>,
    pub charged: Money,
}

/// Result of a committed subscription settlement.
#[derive(Debug, Clone, Serialize)]
pub struct SubscriptionSettlement {
    pub rental_log_ids: Vec<i64>,
    /// New used-today count per category touched.
    pub used_today: BTreeMap<Category, i64>,
}

/// Repository for atomic multi-table settlement.
#[derive(Debug, Clone)]
pub struct LedgerRepository {
    pool: SqlitePool,
    write_lock: WriteLock,
}

impl LedgerRepository {
    /// Creates a new LedgerRepository.
    pub fn new(pool: SqlitePool, write_lock: WriteLock) -> Self {
        LedgerRepository { pool, write_lock }
    }

    /// Writes rental rows and voucher deductions for a basket, all or nothing.
    ///
    /// `plan` must total exactly the summed `amount` of `entries`. Deduction
    /// audit rows link to the first rental row.
    pub async fn settle_vouchers(
        &self,
        entries: &[NewRentalLogEntry],
        plan: &[PlannedDeduction],
    ) -> DbResult<VoucherSettlement> {
        let charged: Money = entries.iter().map(|e| Money::from_won(e.amount)).sum();
        let planned: Money = plan.iter().map(|d| d.amount).sum();
        if charged != planned {
            return Err(DbError::InvalidState(format!(
                "deduction plan totals {planned} but {charged} is charged"
            )));
        }

        let _guard = self.write_lock.lock().await;
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        let mut rental_log_ids = Vec::with_capacity(entries.len());
        for entry in entries {
            rental_log_ids.push(insert_entry_in(&mut tx, entry, now).await?);
        }

        let link = rental_log_ids.first().copied();
        let mut deductions = Vec::with_capacity(plan.len());
        for step in plan {
            match deduct_in(&mut tx, step.voucher_id, step.amount, link, now).await {
                Ok(deduction) => deductions.push(deduction),
                Err(err) => {
                    warn!(
                        voucher_id = step.voucher_id,
                        amount = step.amount.won(),
                        error = %err,
                        "Deduction failed at settlement; rolling back"
                    );
                    tx.rollback().await?;
                    return Err(err);
                }
            }
        }

        tx.commit().await?;

        info!(
            rows = rental_log_ids.len(),
            deductions = deductions.len(),
            charged = charged.won(),
            "Voucher settlement committed"
        );

        Ok(VoucherSettlement {
            rental_log_ids,
            deductions,
            charged,
        })
    }

    /// Writes rental rows and quota usage for a basket, all or nothing.
    ///
    /// `consumed` lists confirmed units per category.
    pub async fn settle_subscription(
        &self,
        subscription_id: i64,
        entries: &[NewRentalLogEntry],
        consumed: &[(Category, i64)],
    ) -> DbResult<SubscriptionSettlement> {
        let _guard = self.write_lock.lock().await;
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        let mut rental_log_ids = Vec::with_capacity(entries.len());
        for entry in entries {
            rental_log_ids.push(insert_entry_in(&mut tx, entry, now).await?);
        }

        let mut used_today = BTreeMap::new();
        for &(category, count) in consumed.iter().filter(|(_, n)| *n > 0) {
            match use_quota_in(&mut tx, subscription_id, category, count, now).await {
                Ok(used) => {
                    used_today.insert(category, used);
                }
                Err(err) => {
                    warn!(
                        subscription_id,
                        category = %category,
                        count,
                        error = %err,
                        "Quota use failed at settlement; rolling back"
                    );
                    tx.rollback().await?;
                    return Err(err);
                }
            }
        }

        tx.commit().await?;

        info!(subscription_id, rows = rental_log_ids.len(), "Subscription settlement committed");

        Ok(SubscriptionSettlement {
            rental_log_ids,
            used_today,
        })
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
