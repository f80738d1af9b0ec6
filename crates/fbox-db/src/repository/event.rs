//! # Event Repository
//!
//! Audit log for business outcomes and raw hardware events, each tagged
//! with a severity from [`fbox_core::events::classify`].

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{QueryBuilder, Sqlite, SqliteConnection, SqlitePool};
use tracing::debug;

use crate::error::DbResult;
use crate::pool::WriteLock;
use fbox_core::events::classify;
use fbox_core::{BusinessEvent, EventLogEntry, Severity};

/// A new audit row.
///
/// ## Usage
/// ```rust,ignore
/// let event = NewEvent::business(BusinessEvent::StockLow)
///     .device("FBOX-0001")
///     .details(json!({ "stock": 3 }));
/// db.events().record(&event).await?;
/// ```
#[derive(Debug, Clone)]
pub struct NewEvent {
    pub event_type: String,
    pub severity: Severity,
    pub device_id: Option<String>,
    pub member_id: Option<String>,
    pub product_id: Option<String>,
    pub details: Value,
}

impl NewEvent {
    /// An event with severity derived from its label.
    pub fn new(event_type: impl Into<String>) -> Self {
        let event_type = event_type.into();
        NewEvent {
            severity: classify(&event_type),
            event_type,
            device_id: None,
            member_id: None,
            product_id: None,
            details: Value::Object(Default::default()),
        }
    }

    pub fn business(event: BusinessEvent) -> Self {
        NewEvent::new(event.as_str())
    }

    pub fn device(mut self, device_id: impl Into<String>) -> Self {
        self.device_id = Some(device_id.into());
        self
    }

    pub fn member(mut self, member_id: impl Into<String>) -> Self {
        self.member_id = Some(member_id.into());
        self
    }

    pub fn product(mut self, product_id: impl Into<String>) -> Self {
        self.product_id = Some(product_id.into());
        self
    }

    pub fn details(mut self, details: Value) -> Self {
        self.details = details;
        self
    }
}

/// Filter for [`EventRepository::recent`].
#[derive(Debug, Clone)]
pub struct EventQuery {
    pub event_type: Option<String>,
    pub severity: Option<Severity>,
    pub device_id: Option<String>,
    pub limit: u32,
}

impl Default for EventQuery {
    fn default() -> Self {
        EventQuery {
            event_type: None,
            severity: None,
            device_id: None,
            limit: 100,
        }
    }
}

/// Repository for the event log.
#[derive(Debug, Clone)]
pub struct EventRepository {
    pool: SqlitePool,
    write_lock: WriteLock,
}

impl EventRepository {
    /// Creates a new EventRepository.
    pub fn new(pool: SqlitePool, write_lock: WriteLock) -> Self {
        EventRepository { pool, write_lock }
    }

    /// Appends an event. Returns its row id.
    pub async fn record(&self, event: &NewEvent) -> DbResult<i64> {
        let _guard = self.write_lock.lock().await;
        let mut conn = self.pool.acquire().await?;
        insert_event_in(&mut conn, event, Utc::now()).await
    }

    /// Newest first.
    pub async fn recent(&self, query: &EventQuery) -> DbResult<Vec<EventLogEntry>> {
        let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new(
            "SELECT id, event_type, severity, device_id, member_id, product_id, details, created_at, synced \
             FROM event_logs WHERE 1 = 1",
        );

        if let Some(event_type) = &query.event_type {
            builder.push(" AND event_type = ").push_bind(event_type);
        }
        if let Some(severity) = query.severity {
            builder.push(" AND severity = ").push_bind(severity);
        }
        if let Some(device_id) = &query.device_id {
            builder.push(" AND device_id = ").push_bind(device_id);
        }
        builder.push(" ORDER BY id DESC LIMIT ").push_bind(query.limit);

        let rows = builder
            .build_query_as::<EventLogEntry>()
            .fetch_all(&self.pool)
            .await?;

        Ok(rows)
    }

    pub async fn get_unsynced(&self, limit: u32) -> DbResult<Vec<EventLogEntry>> {
        let rows = sqlx::query_as::<_, EventLogEntry>(
            r#"
            SELECT id, event_type, severity, device_id, member_id, product_id, details, created_at, synced
            FROM event_logs
            WHERE synced = 0
            ORDER BY id
            LIMIT ?1
            "#,
        )
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
            updated += sqlx::query("UPDATE event_logs SET synced = 1 WHERE id = ?1")
                .bind(id)
                .execute(&mut *tx)
                .await?
                .rows_affected();
        }

        tx.commit().await?;
        Ok(updated)
    }
}

pub(crate) async fn insert_event_in(
    conn: &mut SqliteConnection,
    event: &NewEvent,
    now: DateTime<Utc>,
) -> DbResult<i64> {
    let id = sqlx::query(
        r#"
        INSERT INTO event_logs (event_type, severity, device_id, member_id, product_id, details, created_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
        "#,
    )
    .bind(&event.event_type)
    .bind(event.severity)
    .bind(&event.device_id)
    .bind(&event.member_id)
    .bind(&event.product_id)
    .bind(serde_json::to_string(&event.details)?)
    .bind(now)
    .execute(&mut *conn)
    .await?
    .last_insert_rowid();

    debug!(
        event_id = id,
        event_type = %event.event_type,
        severity = %event.severity,
        "Event recorded"
    );
    Ok(id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::fixtures;
    use serde_json::json;

    #[test]
    fn test_new_event_severity_from_label() {
        assert_eq!(NewEvent::new("door_opened").severity, Severity::Warning);
        assert_eq!(NewEvent::business(BusinessEvent::StockEmpty).severity, Severity::Error);
        assert_eq!(NewEvent::new("wifi_reconnected").severity, Severity::Info);
    }

    #[tokio::test]
    async fn test_record_and_filter() {
        let db = fixtures::db().await;
        let events = db.events();

        events
            .record(&NewEvent::business(BusinessEvent::StockLow).device("FBOX-0001").details(json!({"stock": 3})))
            .await
            .unwrap();
        events
            .record(&NewEvent::business(BusinessEvent::RentalSuccess).member("M001"))
            .await
            .unwrap();
        events
            .record(&NewEvent::business(BusinessEvent::DispenseFailed).device("FBOX-0002"))
            .await
            .unwrap();

        let all = events.recent(&EventQuery::default()).await.unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].event_type, "dispense_failed");

        let warnings = events
            .recent(&EventQuery {
                severity: Some(Severity::Warning),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(warnings.len(), 1);
        let details: Value = serde_json::from_str(&warnings[0].details).unwrap();
        assert_eq!(details["stock"], 3);

        let by_device = events
            .recent(&EventQuery {
                device_id: Some("FBOX-0002".into()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(by_device.len(), 1);

        let ids: Vec<i64> = all.iter().map(|e| e.id).collect();
        assert_eq!(events.mark_synced(&ids).await.unwrap(), 3);
        assert!(events.get_unsynced(10).await.unwrap().is_empty());
    }
}
