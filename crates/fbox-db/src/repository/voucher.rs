//! # Voucher Repository
//!
//! Voucher catalog, member voucher instances, deductions and the bonus chain.
//!
//! ## Lifecycle
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Voucher Lifecycle                                    │
//! │                                                                         │
//! │  issue(VCH-100K)                                                       │
//! │       │                                                                 │
//! │       ├──► #1 VCH-100K      active   100,000 / 100,000  [now, +365d)   │
//! │       └──► #2 VCH-BONUS-10K pending   10,000 /  10,000  parent = #1    │
//! │                                                                         │
//! │  deduct(#1, 100,000)   ── same transaction ──                          │
//! │       │                                                                 │
//! │       ├──► #1 exhausted       0 / 100,000                              │
//! │       └──► #2 active     10,000 /  10,000   [now, +30d)                │
//! │                                                                         │
//! │  read after #1's window lapsed (before exhaustion)                     │
//! │       │                                                                 │
//! │       ├──► #1 expired                                                  │
//! │       └──► #2 expired   (pending child never outlives its parent)      │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Invariants
//! - `remaining_amount <= original_amount` (also a CHECK constraint)
//! - `remaining_amount == 0` on an active voucher flips it to `exhausted`
//!   in the same statement
//! - deductions never clamp: asking for more than remains is an error

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use sqlx::{SqliteConnection, SqlitePool};
use tracing::{debug, info};

use crate::error::{DbError, DbResult};
use crate::pool::WriteLock;
use fbox_core::{
    MemberVoucher, Money, VoucherProduct, VoucherStatus, VoucherTransaction, VOUCHER_TX_RENTAL,
};

const VOUCHER_COLUMNS: &str = "voucher_id, member_id, voucher_product_id, original_amount, \
                               remaining_amount, parent_voucher_id, valid_from, valid_until, \
                               status, created_at, updated_at";

const VOUCHER_TX_COLUMNS: &str = "id, voucher_id, member_id, amount, balance_before, balance_after, \
                                  transaction_type, rental_log_id, created_at, synced";

/// Outcome of one successful deduction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Deduction {
    pub voucher_id: i64,
    pub amount: i64,
    pub balance_before: i64,
    pub balance_after: i64,
    /// Bonus vouchers activated because this deduction exhausted the voucher.
    pub activated_bonus: Vec<i64>,
}

impl Deduction {
    pub fn exhausted(&self) -> bool {
        self.balance_after == 0
    }
}

/// Repository for vouchers.
#[derive(Debug, Clone)]
pub struct VoucherRepository {
    pool: SqlitePool,
    write_lock: WriteLock,
}

impl VoucherRepository {
    /// Creates a new VoucherRepository.
    pub fn new(pool: SqlitePool, write_lock: WriteLock) -> Self {
        VoucherRepository { pool, write_lock }
    }

    // =========================================================================
    // Catalog
    // =========================================================================

    /// Inserts or replaces a catalog entry (pushed by the sync collaborator).
    pub async fn upsert_product(&self, product: &VoucherProduct) -> DbResult<()> {
        let _guard = self.write_lock.lock().await;

        sqlx::query(
            r#"
            INSERT INTO voucher_products
                (product_id, name, price, charge_amount, validity_days, bonus_product_id, is_bonus, enabled)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            ON CONFLICT(product_id) DO UPDATE SET
                name = excluded.name,
                price = excluded.price,
                charge_amount = excluded.charge_amount,
                validity_days = excluded.validity_days,
                bonus_product_id = excluded.bonus_product_id,
                is_bonus = excluded.is_bonus,
                enabled = excluded.enabled
            "#,
        )
        .bind(&product.product_id)
        .bind(&product.name)
        .bind(product.price)
        .bind(product.charge_amount)
        .bind(product.validity_days)
        .bind(&product.bonus_product_id)
        .bind(product.is_bonus)
        .bind(product.enabled)
        .execute(&self.pool)
        .await?;

        debug!(product_id = %product.product_id, "Voucher product upserted");
        Ok(())
    }

    pub async fn get_product(&self, product_id: &str) -> DbResult<Option<VoucherProduct>> {
        let product = sqlx::query_as::<_, VoucherProduct>(
            r#"
            SELECT product_id, name, price, charge_amount, validity_days, bonus_product_id, is_bonus, enabled
            FROM voucher_products
            WHERE product_id = ?1
            "#,
        )
        .bind(product_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(product)
    }

    // =========================================================================
    // Instances
    // =========================================================================

    /// Issues a voucher to a member.
    ///
    /// The voucher is active with window `[now, now + validity_days)`. If the
    /// product names a bonus product, a pending child is created alongside.
    pub async fn issue_voucher(&self, member_id: &str, product_id: &str) -> DbResult<MemberVoucher> {
        let _guard = self.write_lock.lock().await;
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        let product = fetch_product(&mut tx, product_id)
            .await?
            .filter(|p| p.enabled)
            .ok_or_else(|| DbError::not_found("VoucherProduct", product_id))?;

        let voucher_id = insert_voucher(
            &mut tx,
            member_id,
            &product,
            None,
            VoucherStatus::Active,
            Some((now, now + Duration::days(product.validity_days))),
            now,
        )
        .await?;

        if let Some(bonus_id) = product.bonus_product_id.as_deref() {
            let bonus = fetch_product(&mut tx, bonus_id)
                .await?
                .ok_or_else(|| DbError::not_found("VoucherProduct", bonus_id))?;
            let child = insert_voucher(
                &mut tx,
                member_id,
                &bonus,
                Some(voucher_id),
                VoucherStatus::Pending,
                None,
                now,
            )
            .await?;
            debug!(voucher_id, bonus_voucher_id = child, "Pending bonus created");
        }

        let voucher = fetch_voucher(&mut tx, voucher_id)
            .await?
            .ok_or_else(|| DbError::not_found("MemberVoucher", voucher_id))?;

        tx.commit().await?;

        info!(
            member_id = %member_id,
            voucher_id,
            product_id = %product_id,
            amount = product.charge_amount,
            "Voucher issued"
        );
        Ok(voucher)
    }

    /// Gets a voucher by id, as stored (no expiry pass).
    pub async fn get_voucher(&self, voucher_id: i64) -> DbResult<Option<MemberVoucher>> {
        let mut conn = self.pool.acquire().await?;
        fetch_voucher(&mut conn, voucher_id).await
    }

    /// All of a member's vouchers, after expiring the ones whose window lapsed.
    pub async fn get_member_vouchers(&self, member_id: &str) -> DbResult<Vec<MemberVoucher>> {
        let _guard = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;

        expire_lapsed(&mut tx, member_id, Utc::now()).await?;

        let vouchers = sqlx::query_as::<_, MemberVoucher>(&format!(
            "SELECT {VOUCHER_COLUMNS} FROM member_vouchers WHERE member_id = ?1 ORDER BY voucher_id"
        ))
        .bind(member_id)
        .fetch_all(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(vouchers)
    }

    /// A member's spendable vouchers: active, in window, remaining > 0.
    ///
    /// Ordered soonest-expiring first.
    pub async fn get_active_vouchers(&self, member_id: &str) -> DbResult<Vec<MemberVoucher>> {
        let now = Utc::now();
        let mut vouchers: Vec<MemberVoucher> = self
            .get_member_vouchers(member_id)
            .await?
            .into_iter()
            .filter(|v| v.is_spendable(now))
            .collect();

        vouchers.sort_by_key(|v| (v.valid_until, v.voucher_id));
        Ok(vouchers)
    }

    /// Sum of spendable balances.
    pub async fn get_total_balance(&self, member_id: &str) -> DbResult<Money> {
        Ok(self
            .get_active_vouchers(member_id)
            .await?
            .iter()
            .map(MemberVoucher::remaining)
            .sum())
    }

    /// Deducts `amount` from one voucher in its own transaction.
    ///
    /// ## Errors
    /// - `NotFound` for an unknown voucher id
    /// - `InvalidState` if the voucher is not active or its window has lapsed
    /// - `InsufficientBalance` if remaining < amount
    pub async fn deduct_voucher(
        &self,
        voucher_id: i64,
        amount: Money,
        rental_log_id: Option<i64>,
    ) -> DbResult<Deduction> {
        let _guard = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;

        let deduction = deduct_in(&mut tx, voucher_id, amount, rental_log_id, Utc::now()).await?;

        tx.commit().await?;
        Ok(deduction)
    }

    // =========================================================================
    // Transaction Audit
    // =========================================================================

    pub async fn transactions_for_voucher(&self, voucher_id: i64) -> DbResult<Vec<VoucherTransaction>> {
        let rows = sqlx::query_as::<_, VoucherTransaction>(&format!(
            "SELECT {VOUCHER_TX_COLUMNS} FROM voucher_transactions WHERE voucher_id = ?1 ORDER BY id"
        ))
        .bind(voucher_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    /// Deduction rows the back-office has not pulled yet.
    pub async fn get_unsynced_transactions(&self, limit: u32) -> DbResult<Vec<VoucherTransaction>> {
        let rows = sqlx::query_as::<_, VoucherTransaction>(&format!(
            "SELECT {VOUCHER_TX_COLUMNS} FROM voucher_transactions WHERE synced = 0 ORDER BY id LIMIT ?1"
        ))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    pub async fn mark_transactions_synced(&self, ids: &[i64]) -> DbResult<u64> {
        let _guard = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;
        let mut updated = 0;

        for id in ids {
            updated += sqlx::query("UPDATE voucher_transactions SET synced = 1 WHERE id = ?1")
                .bind(id)
                .execute(&mut *tx)
                .await?
                .rows_affected();
        }

        tx.commit().await?;
        Ok(updated)
    }
}

// =============================================================================
// Transaction Helpers
// =============================================================================

async fn fetch_product(
    conn: &mut SqliteConnection,
    product_id: &str,
) -> DbResult<Option<VoucherProduct>> {
    let product = sqlx::query_as::<_, VoucherProduct>(
        r#"
        SELECT product_id, name, price, charge_amount, validity_days, bonus_product_id, is_bonus, enabled
        FROM voucher_products
        WHERE product_id = ?1
        "#,
    )
    .bind(product_id)
    .fetch_optional(&mut *conn)
    .await?;

    Ok(product)
}

pub(crate) async fn fetch_voucher(
    conn: &mut SqliteConnection,
    voucher_id: i64,
) -> DbResult<Option<MemberVoucher>> {
    let voucher = sqlx::query_as::<_, MemberVoucher>(&format!(
        "SELECT {VOUCHER_COLUMNS} FROM member_vouchers WHERE voucher_id = ?1"
    ))
    .bind(voucher_id)
    .fetch_optional(&mut *conn)
    .await?;

    Ok(voucher)
}

async fn insert_voucher(
    conn: &mut SqliteConnection,
    member_id: &str,
    product: &VoucherProduct,
    parent_voucher_id: Option<i64>,
    status: VoucherStatus,
    window: Option<(DateTime<Utc>, DateTime<Utc>)>,
    now: DateTime<Utc>,
) -> DbResult<i64> {
    let result = sqlx::query(
        r#"
        INSERT INTO member_vouchers
            (member_id, voucher_product_id, original_amount, remaining_amount, parent_voucher_id,
             valid_from, valid_until, status, created_at, updated_at)
        VALUES (?1, ?2, ?3, ?3, ?4, ?5, ?6, ?7, ?8, ?8)
        "#,
    )
    .bind(member_id)
    .bind(&product.product_id)
    .bind(product.charge_amount)
    .bind(parent_voucher_id)
    .bind(window.map(|(from, _)| from))
    .bind(window.map(|(_, until)| until))
    .bind(status)
    .bind(now)
    .execute(&mut *conn)
    .await?;

    Ok(result.last_insert_rowid())
}

/// Deducts within the caller's transaction. See [`VoucherRepository::deduct_voucher`].
pub(crate) async fn deduct_in(
    conn: &mut SqliteConnection,
    voucher_id: i64,
    amount: Money,
    rental_log_id: Option<i64>,
    now: DateTime<Utc>,
) -> DbResult<Deduction> {
    if !amount.is_positive() {
        return Err(DbError::InvalidState(format!(
            "deduction from voucher {voucher_id} must be positive, got {amount}"
        )));
    }

    let voucher = fetch_voucher(conn, voucher_id)
        .await?
        .ok_or_else(|| DbError::not_found("MemberVoucher", voucher_id))?;

    if voucher.status != VoucherStatus::Active || voucher.window_elapsed(now) {
        return Err(DbError::InvalidState(format!(
            "voucher {voucher_id} is {} and cannot be spent",
            if voucher.window_elapsed(now) {
                "past its validity window"
            } else {
                voucher.status.as_str()
            }
        )));
    }

    let before = voucher.remaining();
    let after = before
        .checked_deduct(amount)
        .ok_or(DbError::InsufficientBalance {
            voucher_id,
            remaining: before.won(),
            requested: amount.won(),
        })?;

    let status = if after.is_zero() {
        VoucherStatus::Exhausted
    } else {
        VoucherStatus::Active
    };

    sqlx::query(
        "UPDATE member_vouchers SET remaining_amount = ?2, status = ?3, updated_at = ?4 WHERE voucher_id = ?1",
    )
    .bind(voucher_id)
    .bind(after.won())
    .bind(status)
    .bind(now)
    .execute(&mut *conn)
    .await?;

    sqlx::query(
        r#"
        INSERT INTO voucher_transactions
            (voucher_id, member_id, amount, balance_before, balance_after, transaction_type, rental_log_id, created_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
        "#,
    )
    .bind(voucher_id)
    .bind(&voucher.member_id)
    .bind(amount.won())
    .bind(before.won())
    .bind(after.won())
    .bind(VOUCHER_TX_RENTAL)
    .bind(rental_log_id)
    .bind(now)
    .execute(&mut *conn)
    .await?;

    let activated_bonus = if after.is_zero() {
        activate_bonus_children(conn, voucher_id, now).await?
    } else {
        Vec::new()
    };

    debug!(
        voucher_id,
        amount = amount.won(),
        before = before.won(),
        after = after.won(),
        "Voucher deducted"
    );

    Ok(Deduction {
        voucher_id,
        amount: amount.won(),
        balance_before: before.won(),
        balance_after: after.won(),
        activated_bonus,
    })
}

/// Stamps a window from `now` on every pending child of an exhausted voucher.
async fn activate_bonus_children(
    conn: &mut SqliteConnection,
    parent_voucher_id: i64,
    now: DateTime<Utc>,
) -> DbResult<Vec<i64>> {
    let children: Vec<(i64, i64)> = sqlx::query_as(
        r#"
        SELECT v.voucher_id, p.validity_days
        FROM member_vouchers v
        JOIN voucher_products p ON p.product_id = v.voucher_product_id
        WHERE v.parent_voucher_id = ?1 AND v.status = 'pending'
        "#,
    )
    .bind(parent_voucher_id)
    .fetch_all(&mut *conn)
    .await?;

    let mut activated = Vec::with_capacity(children.len());
    for (child_id, validity_days) in children {
        sqlx::query(
            r#"
            UPDATE member_vouchers
            SET status = 'active', valid_from = ?2, valid_until = ?3, updated_at = ?2
            WHERE voucher_id = ?1
            "#,
        )
        .bind(child_id)
        .bind(now)
        .bind(now + Duration::days(validity_days))
        .execute(&mut *conn)
        .await?;

        info!(parent_voucher_id, voucher_id = child_id, validity_days, "Bonus voucher activated");
        activated.push(child_id);
    }

    Ok(activated)
}

/// Expires a member's active vouchers whose window lapsed, then any pending
/// child whose parent is expired. Returns how many rows changed.
pub(crate) async fn expire_lapsed(
    conn: &mut SqliteConnection,
    member_id: &str,
    now: DateTime<Utc>,
) -> DbResult<u64> {
    let active = sqlx::query_as::<_, MemberVoucher>(&format!(
        "SELECT {VOUCHER_COLUMNS} FROM member_vouchers WHERE member_id = ?1 AND status = 'active'"
    ))
    .bind(member_id)
    .fetch_all(&mut *conn)
    .await?;

    let mut expired = 0;
    for voucher in active.iter().filter(|v| v.window_elapsed(now)) {
        expired += sqlx::query(
            "UPDATE member_vouchers SET status = 'expired', updated_at = ?2 WHERE voucher_id = ?1",
        )
        .bind(voucher.voucher_id)
        .bind(now)
        .execute(&mut *conn)
        .await?
        .rows_affected();
    }

    let orphaned = sqlx::query(
        r#"
        UPDATE member_vouchers
        SET status = 'expired', updated_at = ?2
        WHERE member_id = ?1
          AND status = 'pending'
          AND parent_voucher_id IN (
              SELECT voucher_id FROM member_vouchers WHERE status = 'expired'
          )
        "#,
    )
    .bind(member_id)
    .bind(now)
    .execute(&mut *conn)
    .await?
    .rows_affected();

    if expired + orphaned > 0 {
        info!(member_id = %member_id, expired, orphaned, "Lapsed vouchers expired");
    }

    Ok(expired + orphaned)
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::fixtures;
    use crate::Database;

    async fn backdate(db: &Database, voucher_id: i64) {
        let past = Utc::now() - Duration::days(1);
        sqlx::query("UPDATE member_vouchers SET valid_until = ?2 WHERE voucher_id = ?1")
            .bind(voucher_id)
            .bind(past)
            .execute(db.pool())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_issue_creates_pending_bonus() {
        let db = fixtures::seeded().await;
        let voucher = db.vouchers().issue_voucher("M001", "VCH-100K").await.unwrap();

        assert_eq!(voucher.status, VoucherStatus::Active);
        assert_eq!(voucher.remaining_amount, 100_000);
        assert!(voucher.valid_until.is_some());

        let all = db.vouchers().get_member_vouchers("M001").await.unwrap();
        assert_eq!(all.len(), 2);
        let bonus = &all[1];
        assert_eq!(bonus.status, VoucherStatus::Pending);
        assert_eq!(bonus.parent_voucher_id, Some(voucher.voucher_id));
        assert!(bonus.valid_from.is_none() && bonus.valid_until.is_none());

        // Pending bonus is not spendable
        assert_eq!(db.vouchers().get_active_vouchers("M001").await.unwrap().len(), 1);
        assert_eq!(
            db.vouchers().get_total_balance("M001").await.unwrap(),
            Money::from_won(100_000)
        );
    }

    #[tokio::test]
    async fn test_issue_unknown_product() {
        let db = fixtures::seeded().await;
        let err = db.vouchers().issue_voucher("M001", "VCH-NOPE").await.unwrap_err();
        assert!(matches!(err, DbError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_partial_deduction_records_audit_row() {
        let db = fixtures::seeded().await;
        let voucher = db.vouchers().issue_voucher("M001", "VCH-10K").await.unwrap();

        let d = db
            .vouchers()
            .deduct_voucher(voucher.voucher_id, Money::from_won(1200), None)
            .await
            .unwrap();
        assert_eq!((d.balance_before, d.balance_after), (10_000, 8_800));
        assert!(!d.exhausted());

        let rows = db.vouchers().transactions_for_voucher(voucher.voucher_id).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].transaction_type, VOUCHER_TX_RENTAL);
        assert_eq!(rows[0].balance_after, 8_800);
        assert!(!rows[0].synced);
    }

    #[tokio::test]
    async fn test_exhaustion_activates_bonus() {
        let db = fixtures::seeded().await;
        let voucher = db.vouchers().issue_voucher("M001", "VCH-100K").await.unwrap();

        let d = db
            .vouchers()
            .deduct_voucher(voucher.voucher_id, Money::from_won(100_000), None)
            .await
            .unwrap();
        assert!(d.exhausted());
        assert_eq!(d.activated_bonus.len(), 1);

        let parent = db.vouchers().get_voucher(voucher.voucher_id).await.unwrap().unwrap();
        assert_eq!(parent.status, VoucherStatus::Exhausted);
        assert_eq!(parent.remaining_amount, 0);

        let bonus = db.vouchers().get_voucher(d.activated_bonus[0]).await.unwrap().unwrap();
        assert_eq!(bonus.status, VoucherStatus::Active);
        let window = bonus.valid_until.unwrap() - bonus.valid_from.unwrap();
        assert_eq!(window.num_days(), 30);

        let active = db.vouchers().get_active_vouchers("M001").await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].voucher_id, bonus.voucher_id);
    }

    #[tokio::test]
    async fn test_overdraw_is_rejected_not_clamped() {
        let db = fixtures::seeded().await;
        let voucher = db.vouchers().issue_voucher("M001", "VCH-10K").await.unwrap();
        db.vouchers()
            .deduct_voucher(voucher.voucher_id, Money::from_won(9_000), None)
            .await
            .unwrap();

        let err = db
            .vouchers()
            .deduct_voucher(voucher.voucher_id, Money::from_won(1_200), None)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            DbError::InsufficientBalance { remaining: 1_000, requested: 1_200, .. }
        ));

        let unchanged = db.vouchers().get_voucher(voucher.voucher_id).await.unwrap().unwrap();
        assert_eq!(unchanged.remaining_amount, 1_000);
        assert_eq!(unchanged.status, VoucherStatus::Active);
    }

    #[tokio::test]
    async fn test_deduct_unknown_or_spent() {
        let db = fixtures::seeded().await;
        let err = db
            .vouchers()
            .deduct_voucher(999, Money::from_won(100), None)
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::NotFound { .. }));

        let voucher = db.vouchers().issue_voucher("M001", "VCH-10K").await.unwrap();
        db.vouchers()
            .deduct_voucher(voucher.voucher_id, Money::from_won(10_000), None)
            .await
            .unwrap();
        let err = db
            .vouchers()
            .deduct_voucher(voucher.voucher_id, Money::from_won(1), None)
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::InvalidState(_)));
    }

    #[tokio::test]
    async fn test_lapsed_parent_expires_pending_bonus() {
        let db = fixtures::seeded().await;
        let voucher = db.vouchers().issue_voucher("M001", "VCH-100K").await.unwrap();
        backdate(&db, voucher.voucher_id).await;

        let all = db.vouchers().get_member_vouchers("M001").await.unwrap();
        assert!(all.iter().all(|v| v.status == VoucherStatus::Expired));
        assert!(db.vouchers().get_active_vouchers("M001").await.unwrap().is_empty());

        let err = db
            .vouchers()
            .deduct_voucher(voucher.voucher_id, Money::from_won(100), None)
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::InvalidState(_)));
    }

    #[tokio::test]
    async fn test_sync_outflow() {
        let db = fixtures::seeded().await;
        let voucher = db.vouchers().issue_voucher("M001", "VCH-10K").await.unwrap();
        for _ in 0..3 {
            db.vouchers()
                .deduct_voucher(voucher.voucher_id, Money::from_won(100), None)
                .await
                .unwrap();
        }

        let pending = db.vouchers().get_unsynced_transactions(10).await.unwrap();
        assert_eq!(pending.len(), 3);

        let ids: Vec<i64> = pending.iter().take(2).map(|t| t.id).collect();
        assert_eq!(db.vouchers().mark_transactions_synced(&ids).await.unwrap(), 2);
        assert_eq!(db.vouchers().get_unsynced_transactions(10).await.unwrap().len(), 1);
    }
}
