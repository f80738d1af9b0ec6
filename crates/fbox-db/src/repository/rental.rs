//! # Rental Repository
//!
//! The append-only rental log: what was charged for what was dispensed.
//! Rows are written by [`LedgerRepository`](super::ledger::LedgerRepository)
//! as part of settlement and pulled out by the back-office sync.

use chrono::{DateTime, Utc};
use sqlx::{SqliteConnection, SqlitePool};
use tracing::debug;

use crate::error::{DbError, DbResult};
use crate::pool::WriteLock;
use fbox_core::{NewRentalLogEntry, RentalLogEntry};

const RENTAL_COLUMNS: &str = "id, transaction_id, member_id, product_id, product_name, device_id, \
                              quantity, payment_type, voucher_id, subscription_id, amount, \
                              created_at, synced";

/// Repository for the rental log.
#[derive(Debug, Clone)]
pub struct RentalRepository {
    pool: SqlitePool,
    write_lock: WriteLock,
}

impl RentalRepository {
    /// Creates a new RentalRepository.
    pub fn new(pool: SqlitePool, write_lock: WriteLock) -> Self {
        RentalRepository { pool, write_lock }
    }

    /// Appends one entry on its own. Baskets go through the ledger instead.
    pub async fn create_entry(&self, entry: &NewRentalLogEntry) -> DbResult<i64> {
        let _guard = self.write_lock.lock().await;
        let mut conn = self.pool.acquire().await?;
        insert_entry_in(&mut conn, entry, Utc::now()).await
    }

    pub async fn get(&self, id: i64) -> DbResult<Option<RentalLogEntry>> {
        let entry = sqlx::query_as::<_, RentalLogEntry>(&format!(
            "SELECT {RENTAL_COLUMNS} FROM rental_logs WHERE id = ?1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(entry)
    }

    /// Rows written by one basket, in item order.
    pub async fn get_by_transaction(&self, transaction_id: &str) -> DbResult<Vec<RentalLogEntry>> {
        let rows = sqlx::query_as::<_, RentalLogEntry>(&format!(
            "SELECT {RENTAL_COLUMNS} FROM rental_logs WHERE transaction_id = ?1 ORDER BY id"
        ))
        .bind(transaction_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    /// Most recent rentals for a member.
    pub async fn get_member_rentals(&self, member_id: &str, limit: u32) -> DbResult<Vec<RentalLogEntry>> {
        let rows = sqlx::query_as::<_, RentalLogEntry>(&format!(
            "SELECT {RENTAL_COLUMNS} FROM rental_logs WHERE member_id = ?1 ORDER BY id DESC LIMIT ?2"
        ))
        .bind(member_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    pub async fn get_unsynced(&self, limit: u32) -> DbResult<Vec<RentalLogEntry>> {
        let rows = sqlx::query_as::<_, RentalLogEntry>(&format!(
            "SELECT {RENTAL_COLUMNS} FROM rental_logs WHERE synced = 0 ORDER BY id LIMIT ?1"
        ))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    pub async fn mark_synced(&self, ids: &[i64]) -> DbResult<u64> {
        let _guard = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;
        let mut updated = 0;

        for id in ids {
            updated += sqlx::query("UPDATE rental_logs SET synced = 1 WHERE id = ?1")
                .bind(id)
                .execute(&mut *tx)
                .await?
                .rows_affected();
        }

        tx.commit().await?;
        debug!(updated, "Rental rows marked synced");
        Ok(updated)
    }
}

/// Appends a rental row within the caller's transaction.
pub(crate) async fn insert_entry_in(
    conn: &mut SqliteConnection,
    entry: &NewRentalLogEntry,
    now: DateTime<Utc>,
) -> DbResult<i64> {
    if entry.quantity <= 0 {
        return Err(DbError::InvalidState(format!(
            "rental row for {} needs a confirmed quantity, got {}",
            entry.product_id, entry.quantity
        )));
    }

    let id = sqlx::query(
        r#"
        INSERT INTO rental_logs
            (transaction_id, member_id, product_id, product_name, device_id, quantity,
             payment_type, voucher_id, subscription_id, amount, created_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
        "#,
    )
    .bind(&entry.transaction_id)
    .bind(&entry.member_id)
    .bind(&entry.product_id)
    .bind(&entry.product_name)
    .bind(&entry.device_id)
    .bind(entry.quantity)
    .bind(entry.payment_type)
    .bind(entry.voucher_id)
    .bind(entry.subscription_id)
    .bind(entry.amount)
    .bind(now)
    .execute(&mut *conn)
    .await?
    .last_insert_rowid();

    debug!(
        rental_log_id = id,
        transaction_id = %entry.transaction_id,
        product_id = %entry.product_id,
        quantity = entry.quantity,
        amount = entry.amount,
        "Rental row appended"
    );
    Ok(id)
}

#[cfg(test)]
mod tests {
    use crate::repository::fixtures;
    use fbox_core::{NewRentalLogEntry, PaymentType};

    fn entry(qty: i64) -> NewRentalLogEntry {
        NewRentalLogEntry {
            transaction_id: "tx-1".into(),
            member_id: "M001".into(),
            product_id: "P-TOP-L".into(),
            product_name: "top L".into(),
            device_id: "FBOX-0001".into(),
            quantity: qty,
            payment_type: PaymentType::Voucher,
            voucher_id: None,
            subscription_id: None,
            amount: 600 * qty,
        }
    }

    #[tokio::test]
    async fn test_append_and_sync_outflow() {
        let db = fixtures::seeded().await;
        let rentals = db.rentals();

        let first = rentals.create_entry(&entry(1)).await.unwrap();
        rentals.create_entry(&entry(2)).await.unwrap();

        let rows = rentals.get_by_transaction("tx-1").await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1].amount, 1200);
        assert_eq!(rows[1].payment_type, PaymentType::Voucher);

        assert_eq!(rentals.mark_synced(&[first]).await.unwrap(), 1);
        let unsynced = rentals.get_unsynced(10).await.unwrap();
        assert_eq!(unsynced.len(), 1);
        assert_eq!(unsynced[0].quantity, 2);
    }

    #[tokio::test]
    async fn test_zero_quantity_rejected() {
        let db = fixtures::seeded().await;
        assert!(db.rentals().create_entry(&entry(0)).await.is_err());
        assert!(db.rentals().get_member_rentals("M001", 10).await.unwrap().is_empty());
    }
}
