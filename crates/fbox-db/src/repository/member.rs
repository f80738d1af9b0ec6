//! # Member Repository
//!
//! Members are enrolled and refreshed by the external sync collaborator;
//! the rental engine only reads them.

use chrono::Utc;
use sqlx::SqlitePool;
use tracing::debug;

use crate::error::DbResult;
use crate::pool::WriteLock;
use fbox_core::Member;

/// Repository for member records.
#[derive(Debug, Clone)]
pub struct MemberRepository {
    pool: SqlitePool,
    write_lock: WriteLock,
}

impl MemberRepository {
    /// Creates a new MemberRepository.
    pub fn new(pool: SqlitePool, write_lock: WriteLock) -> Self {
        MemberRepository { pool, write_lock }
    }

    /// Gets a member by id.
    pub async fn get(&self, member_id: &str) -> DbResult<Option<Member>> {
        let member = sqlx::query_as::<_, Member>(
            r#"
            SELECT member_id, name, phone, payment_pin, status, created_at, updated_at
            FROM members
            WHERE member_id = ?1
            "#,
        )
        .bind(member_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(member)
    }

    /// Inserts or refreshes a member snapshot.
    ///
    /// `created_at` is kept from the first insert.
    pub async fn upsert(&self, member: &Member) -> DbResult<()> {
        let _guard = self.write_lock.lock().await;

        debug!(member_id = %member.member_id, status = ?member.status, "Upserting member");

        sqlx::query(
            r#"
            INSERT INTO members (member_id, name, phone, payment_pin, status, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ON CONFLICT(member_id) DO UPDATE SET
                name = excluded.name,
                phone = excluded.phone,
                payment_pin = excluded.payment_pin,
                status = excluded.status,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&member.member_id)
        .bind(&member.name)
        .bind(&member.phone)
        .bind(&member.payment_pin)
        .bind(member.status)
        .bind(member.created_at)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Checks a payment PIN. Unknown members and members without a PIN never match.
    pub async fn verify_payment_pin(&self, member_id: &str, pin: &str) -> DbResult<bool> {
        let stored =
            sqlx::query_scalar::<_, Option<String>>("SELECT payment_pin FROM members WHERE member_id = ?1")
                .bind(member_id)
                .fetch_optional(&self.pool)
                .await?;

        Ok(matches!(stored, Some(Some(ref p)) if p == pin))
    }
}
