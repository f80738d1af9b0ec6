//! # Subscription Repository
//!
//! Day-quota subscriptions and their per-day, per-category usage counters.
//!
//! ## Remaining Today
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  remaining(category) = max(0, allowance[category] − used[today][cat])  │
//! │                                                                         │
//! │  allowance  {"top":1,"pants":1,"towel":1}   (snapshot at issue time)   │
//! │  usage      (sub 42, 2026-03-02, towel) → 1                            │
//! │  remaining  top 1 · pants 1 · towel 0 · other 0                        │
//! │                                                                         │
//! │  Rows are created on first use; "today" is the KST calendar day.       │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use chrono::{DateTime, Duration, NaiveDate, Utc};
use sqlx::types::Json;
use sqlx::{SqliteConnection, SqlitePool};
use tracing::{debug, info};

use crate::error::{DbError, DbResult};
use crate::pool::WriteLock;
use fbox_core::clock::{kst_date, today_kst};
use fbox_core::{
    Category, MemberSubscription, SubscriptionProduct, SubscriptionStatus, SubscriptionUsage,
};

const SUBSCRIPTION_COLUMNS: &str = "subscription_id, member_id, subscription_product_id, valid_from, \
                                    valid_until, daily_limits, status, created_at";

/// Repository for subscriptions and quota usage.
#[derive(Debug, Clone)]
pub struct SubscriptionRepository {
    pool: SqlitePool,
    write_lock: WriteLock,
}

impl SubscriptionRepository {
    /// Creates a new SubscriptionRepository.
    pub fn new(pool: SqlitePool, write_lock: WriteLock) -> Self {
        SubscriptionRepository { pool, write_lock }
    }

    // =========================================================================
    // Catalog
    // =========================================================================

    pub async fn upsert_product(&self, product: &SubscriptionProduct) -> DbResult<()> {
        let _guard = self.write_lock.lock().await;

        sqlx::query(
            r#"
            INSERT INTO subscription_products (product_id, name, price, validity_days, daily_limits, enabled)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT(product_id) DO UPDATE SET
                name = excluded.name,
                price = excluded.price,
                validity_days = excluded.validity_days,
                daily_limits = excluded.daily_limits,
                enabled = excluded.enabled
            "#,
        )
        .bind(&product.product_id)
        .bind(&product.name)
        .bind(product.price)
        .bind(product.validity_days)
        .bind(Json(&product.daily_limits))
        .bind(product.enabled)
        .execute(&self.pool)
        .await?;

        debug!(product_id = %product.product_id, "Subscription product upserted");
        Ok(())
    }

    pub async fn get_product(&self, product_id: &str) -> DbResult<Option<SubscriptionProduct>> {
        let product = sqlx::query_as::<_, SubscriptionProduct>(
            r#"
            SELECT product_id, name, price, validity_days, daily_limits, enabled
            FROM subscription_products
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

    /// Issues a subscription, snapshotting the product's daily allowances.
    pub async fn issue_subscription(
        &self,
        member_id: &str,
        product_id: &str,
    ) -> DbResult<MemberSubscription> {
        let product = self
            .get_product(product_id)
            .await?
            .filter(|p| p.enabled)
            .ok_or_else(|| DbError::not_found("SubscriptionProduct", product_id))?;

        let _guard = self.write_lock.lock().await;
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        let subscription_id = sqlx::query(
            r#"
            INSERT INTO member_subscriptions
                (member_id, subscription_product_id, valid_from, valid_until, daily_limits, status, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, 'active', ?3)
            "#,
        )
        .bind(member_id)
        .bind(product_id)
        .bind(now)
        .bind(now + Duration::days(product.validity_days))
        .bind(Json(&product.daily_limits))
        .execute(&mut *tx)
        .await?
        .last_insert_rowid();

        let subscription = fetch_subscription(&mut tx, subscription_id)
            .await?
            .ok_or_else(|| DbError::not_found("MemberSubscription", subscription_id))?;

        tx.commit().await?;

        info!(member_id = %member_id, subscription_id, product_id = %product_id, "Subscription issued");
        Ok(subscription)
    }

    /// Gets a subscription by id, as stored.
    pub async fn get_subscription(&self, subscription_id: i64) -> DbResult<Option<MemberSubscription>> {
        let mut conn = self.pool.acquire().await?;
        fetch_subscription(&mut conn, subscription_id).await
    }

    /// A member's active subscriptions, after expiring lapsed ones.
    pub async fn get_active_subscriptions(&self, member_id: &str) -> DbResult<Vec<MemberSubscription>> {
        let _guard = self.write_lock.lock().await;
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        let active = sqlx::query_as::<_, MemberSubscription>(&format!(
            "SELECT {SUBSCRIPTION_COLUMNS} FROM member_subscriptions \
             WHERE member_id = ?1 AND status = 'active' ORDER BY valid_until"
        ))
        .bind(member_id)
        .fetch_all(&mut *tx)
        .await?;

        let (lapsed, current): (Vec<_>, Vec<_>) =
            active.into_iter().partition(|s| s.window_elapsed(now));

        for subscription in &lapsed {
            sqlx::query("UPDATE member_subscriptions SET status = 'expired' WHERE subscription_id = ?1")
                .bind(subscription.subscription_id)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;

        if !lapsed.is_empty() {
            info!(member_id = %member_id, expired = lapsed.len(), "Lapsed subscriptions expired");
        }
        Ok(current)
    }

    // =========================================================================
    // Usage
    // =========================================================================

    /// Usage rows for a given day.
    pub async fn get_usage(&self, subscription_id: i64, date: NaiveDate) -> DbResult<Vec<SubscriptionUsage>> {
        let rows = sqlx::query_as::<_, SubscriptionUsage>(
            r#"
            SELECT subscription_id, usage_date, category, used_count
            FROM subscription_usage
            WHERE subscription_id = ?1 AND usage_date = ?2
            ORDER BY category
            "#,
        )
        .bind(subscription_id)
        .bind(date)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    /// Usage rows for today (KST).
    pub async fn get_usage_today(&self, subscription_id: i64) -> DbResult<Vec<SubscriptionUsage>> {
        self.get_usage(subscription_id, today_kst()).await
    }

    /// Units of `category` still available today, floored at zero.
    pub async fn get_remaining_today(&self, subscription_id: i64, category: Category) -> DbResult<i64> {
        let mut conn = self.pool.acquire().await?;
        let subscription = fetch_subscription(&mut conn, subscription_id)
            .await?
            .ok_or_else(|| DbError::not_found("MemberSubscription", subscription_id))?;

        let used = used_on(&mut conn, subscription_id, today_kst(), category).await?;
        Ok((subscription.allowance_for(category) - used).max(0))
    }

    /// Consumes `count` units of today's allowance for `category`.
    ///
    /// Fails with `QuotaExceeded` rather than clamping. Returns the new
    /// used count.
    pub async fn use_quota(&self, subscription_id: i64, category: Category, count: i64) -> DbResult<i64> {
        let _guard = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;

        let used = use_quota_in(&mut tx, subscription_id, category, count, Utc::now()).await?;

        tx.commit().await?;
        Ok(used)
    }
}

// =============================================================================
// Transaction Helpers
// =============================================================================

async fn fetch_subscription(
    conn: &mut SqliteConnection,
    subscription_id: i64,
) -> DbResult<Option<MemberSubscription>> {
    let subscription = sqlx::query_as::<_, MemberSubscription>(&format!(
        "SELECT {SUBSCRIPTION_COLUMNS} FROM member_subscriptions WHERE subscription_id = ?1"
    ))
    .bind(subscription_id)
    .fetch_optional(&mut *conn)
    .await?;

    Ok(subscription)
}

async fn used_on(
    conn: &mut SqliteConnection,
    subscription_id: i64,
    date: NaiveDate,
    category: Category,
) -> DbResult<i64> {
    let used: Option<i64> = sqlx::query_scalar(
        r#"
        SELECT used_count FROM subscription_usage
        WHERE subscription_id = ?1 AND usage_date = ?2 AND category = ?3
        "#,
    )
    .bind(subscription_id)
    .bind(date)
    .bind(category)
    .fetch_optional(&mut *conn)
    .await?;

    Ok(used.unwrap_or(0))
}

/// Uses quota within the caller's transaction. The day is the KST day of `now`.
pub(crate) async fn use_quota_in(
    conn: &mut SqliteConnection,
    subscription_id: i64,
    category: Category,
    count: i64,
    now: DateTime<Utc>,
) -> DbResult<i64> {
    if count <= 0 {
        return Err(DbError::InvalidState(format!(
            "quota use on subscription {subscription_id} must be positive, got {count}"
        )));
    }

    let subscription = fetch_subscription(conn, subscription_id)
        .await?
        .ok_or_else(|| DbError::not_found("MemberSubscription", subscription_id))?;

    if subscription.status != SubscriptionStatus::Active || subscription.window_elapsed(now) {
        return Err(DbError::InvalidState(format!(
            "subscription {subscription_id} is not active"
        )));
    }

    let date = kst_date(now);
    let used = used_on(conn, subscription_id, date, category).await?;
    let remaining = (subscription.allowance_for(category) - used).max(0);

    if count > remaining {
        return Err(DbError::QuotaExceeded {
            subscription_id,
            category: category.to_string(),
            remaining,
            requested: count,
        });
    }

    sqlx::query(
        r#"
        INSERT INTO subscription_usage (subscription_id, usage_date, category, used_count)
        VALUES (?1, ?2, ?3, ?4)
        ON CONFLICT(subscription_id, usage_date, category)
        DO UPDATE SET used_count = used_count + excluded.used_count
        "#,
    )
    .bind(subscription_id)
    .bind(date)
    .bind(category)
    .bind(count)
    .execute(&mut *conn)
    .await?;

    debug!(subscription_id, category = %category, count, used = used + count, "Quota used");
    Ok(used + count)
}

// =============================================================================
// Unit Tests
// =============================================================================
