//! # Device Repository
//!
//! Dispenser state as last reported over the status topic. Eventually
//! consistent with the physical unit: only inbound events write here.
//!
//! ## Event → Row
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  boot_complete   → register()          device row + bound product      │
//! │  heartbeat       → record_heartbeat()  fields + last_heartbeat_at      │
//! │  status          → update_status()     fields only                     │
//! │  door_*          → set_door_state()                                    │
//! │  stock_* / dispense_complete → set_stock()  device + bound product     │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use chrono::{DateTime, Duration, Utc};
use sqlx::{SqliteConnection, SqlitePool};
use tracing::{debug, info};

use crate::error::DbResult;
use crate::pool::WriteLock;
use fbox_core::{Category, Device, DoorState, DEFAULT_PRODUCT_PRICE};

const DEVICE_COLUMNS: &str = "device_id, mac_address, device_name, category, size, product_id, \
                              stock, door_state, locked, wifi_rssi, ip_address, firmware_version, \
                              last_heartbeat_at, first_seen_at, updated_at";

/// What a device announces when it boots.
#[derive(Debug, Clone, Default)]
pub struct BootAnnouncement {
    pub device_id: String,
    pub mac_address: Option<String>,
    pub category: Option<Category>,
    pub size: Option<String>,
    pub stock: Option<i64>,
    pub firmware_version: Option<String>,
    pub ip_address: Option<String>,
}

/// Fields a heartbeat or status event may carry. `None` leaves the column as is.
#[derive(Debug, Clone, Default)]
pub struct HeartbeatReport {
    pub device_id: String,
    pub stock: Option<i64>,
    pub door_state: Option<DoorState>,
    pub locked: Option<bool>,
    pub wifi_rssi: Option<i64>,
    pub ip_address: Option<String>,
}

/// Repository for device state.
#[derive(Debug, Clone)]
pub struct DeviceRepository {
    pool: SqlitePool,
    write_lock: WriteLock,
}

impl DeviceRepository {
    /// Creates a new DeviceRepository.
    pub fn new(pool: SqlitePool, write_lock: WriteLock) -> Self {
        DeviceRepository { pool, write_lock }
    }

    pub async fn get(&self, device_id: &str) -> DbResult<Option<Device>> {
        let device = sqlx::query_as::<_, Device>(&format!(
            "SELECT {DEVICE_COLUMNS} FROM devices WHERE device_id = ?1"
        ))
        .bind(device_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(device)
    }

    pub async fn list(&self) -> DbResult<Vec<Device>> {
        let devices = sqlx::query_as::<_, Device>(&format!(
            "SELECT {DEVICE_COLUMNS} FROM devices ORDER BY category, size, device_id"
        ))
        .fetch_all(&self.pool)
        .await?;

        Ok(devices)
    }

    /// Registers a booted device and, when it announces category and size,
    /// the product it dispenses.
    ///
    /// ## Product Binding
    /// 1. A product already bound to this device is kept
    /// 2. Otherwise `P-{CATEGORY}-{size}` is claimed if free or unbound
    /// 3. If another device holds it, `-{last 4 of device id}` is appended
    ///
    /// New products get the default price. Everything runs in one transaction.
    pub async fn register(&self, boot: &BootAnnouncement) -> DbResult<Device> {
        let _guard = self.write_lock.lock().await;
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        ensure_device_row(&mut tx, &boot.device_id, now).await?;

        let device_name = match (boot.category, boot.size.as_deref()) {
            (Some(category), Some(size)) => Some(format!("{category} {size}")),
            _ => None,
        };

        sqlx::query(
            r#"
            UPDATE devices SET
                mac_address = COALESCE(?2, mac_address),
                device_name = COALESCE(?3, device_name),
                category = COALESCE(?4, category),
                size = COALESCE(?5, size),
                stock = COALESCE(?6, stock),
                firmware_version = COALESCE(?7, firmware_version),
                ip_address = COALESCE(?8, ip_address),
                last_heartbeat_at = ?9,
                updated_at = ?9
            WHERE device_id = ?1
            "#,
        )
        .bind(&boot.device_id)
        .bind(&boot.mac_address)
        .bind(&device_name)
        .bind(boot.category)
        .bind(&boot.size)
        .bind(boot.stock)
        .bind(&boot.firmware_version)
        .bind(&boot.ip_address)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        if let (Some(category), Some(size)) = (boot.category, boot.size.as_deref()) {
            let product_id = bind_product(&mut tx, &boot.device_id, category, size, boot.stock, now).await?;
            sqlx::query("UPDATE devices SET product_id = ?2 WHERE device_id = ?1")
                .bind(&boot.device_id)
                .bind(&product_id)
                .execute(&mut *tx)
                .await?;
        }

        let device = sqlx::query_as::<_, Device>(&format!(
            "SELECT {DEVICE_COLUMNS} FROM devices WHERE device_id = ?1"
        ))
        .bind(&boot.device_id)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;

        info!(
            device_id = %device.device_id,
            product_id = ?device.product_id,
            category = %device.category,
            "Device registered"
        );
        Ok(device)
    }

    /// Applies a heartbeat and stamps `last_heartbeat_at`.
    pub async fn record_heartbeat(&self, report: &HeartbeatReport) -> DbResult<()> {
        self.apply_report(report, true).await
    }

    /// Applies a status report without touching liveness.
    pub async fn update_status(&self, report: &HeartbeatReport) -> DbResult<()> {
        self.apply_report(report, false).await
    }

    async fn apply_report(&self, report: &HeartbeatReport, heartbeat: bool) -> DbResult<()> {
        let _guard = self.write_lock.lock().await;
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        ensure_device_row(&mut tx, &report.device_id, now).await?;

        sqlx::query(
            r#"
            UPDATE devices SET
                stock = COALESCE(?2, stock),
                door_state = COALESCE(?3, door_state),
                locked = COALESCE(?4, locked),
                wifi_rssi = COALESCE(?5, wifi_rssi),
                ip_address = COALESCE(?6, ip_address),
                last_heartbeat_at = CASE WHEN ?7 THEN ?8 ELSE last_heartbeat_at END,
                updated_at = ?8
            WHERE device_id = ?1
            "#,
        )
        .bind(&report.device_id)
        .bind(report.stock)
        .bind(report.door_state)
        .bind(report.locked)
        .bind(report.wifi_rssi)
        .bind(&report.ip_address)
        .bind(heartbeat)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        if let Some(stock) = report.stock {
            mirror_stock_to_product(&mut tx, &report.device_id, stock, now).await?;
        }

        tx.commit().await?;

        debug!(device_id = %report.device_id, heartbeat, "Device state updated");
        Ok(())
    }

    /// Sets an absolute stock count on the device and its bound product.
    ///
    /// Absolute writes make a repeated report harmless.
    pub async fn set_stock(&self, device_id: &str, stock: i64) -> DbResult<()> {
        let _guard = self.write_lock.lock().await;
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        ensure_device_row(&mut tx, device_id, now).await?;

        sqlx::query("UPDATE devices SET stock = ?2, updated_at = ?3 WHERE device_id = ?1")
            .bind(device_id)
            .bind(stock)
            .bind(now)
            .execute(&mut *tx)
            .await?;

        mirror_stock_to_product(&mut tx, device_id, stock, now).await?;
        tx.commit().await?;

        debug!(device_id = %device_id, stock, "Stock set");
        Ok(())
    }

    pub async fn set_door_state(&self, device_id: &str, door: DoorState) -> DbResult<()> {
        self.update_status(&HeartbeatReport {
            device_id: device_id.to_string(),
            door_state: Some(door),
            ..Default::default()
        })
        .await
    }

    pub async fn set_locked(&self, device_id: &str, locked: bool) -> DbResult<()> {
        self.update_status(&HeartbeatReport {
            device_id: device_id.to_string(),
            locked: Some(locked),
            ..Default::default()
        })
        .await
    }

    /// True when the device's last heartbeat falls within `window` of `now`.
    /// Unknown devices are offline.
    pub async fn is_online(
        &self,
        device_id: &str,
        window: Duration,
        now: DateTime<Utc>,
    ) -> DbResult<bool> {
        Ok(self
            .get(device_id)
            .await?
            .map(|d| d.is_online(now, window))
            .unwrap_or(false))
    }
}

// =============================================================================
// Transaction Helpers
// =============================================================================

async fn ensure_device_row(
    conn: &mut SqliteConnection,
    device_id: &str,
    now: DateTime<Utc>,
) -> DbResult<()> {
    sqlx::query(
        r#"
        INSERT OR IGNORE INTO devices (device_id, device_name, first_seen_at, updated_at)
        VALUES (?1, ?1, ?2, ?2)
        "#,
    )
    .bind(device_id)
    .bind(now)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn mirror_stock_to_product(
    conn: &mut SqliteConnection,
    device_id: &str,
    stock: i64,
    now: DateTime<Utc>,
) -> DbResult<()> {
    sqlx::query("UPDATE products SET stock = ?2, updated_at = ?3 WHERE device_id = ?1")
        .bind(device_id)
        .bind(stock)
        .bind(now)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

/// Returns the id of the product now bound to `device_id`.
async fn bind_product(
    conn: &mut SqliteConnection,
    device_id: &str,
    category: Category,
    size: &str,
    stock: Option<i64>,
    now: DateTime<Utc>,
) -> DbResult<String> {
    let existing: Option<String> =
        sqlx::query_scalar("SELECT product_id FROM products WHERE device_id = ?1")
            .bind(device_id)
            .fetch_optional(&mut *conn)
            .await?;

    if let Some(product_id) = existing {
        sqlx::query(
            "UPDATE products SET category = ?2, size = ?3, stock = COALESCE(?4, stock), updated_at = ?5 \
             WHERE product_id = ?1",
        )
        .bind(&product_id)
        .bind(category)
        .bind(size)
        .bind(stock)
        .bind(now)
        .execute(&mut *conn)
        .await?;
        return Ok(product_id);
    }

    let mut product_id = product_id_for(category, size);
    let holder: Option<Option<String>> =
        sqlx::query_scalar::<_, Option<String>>("SELECT device_id FROM products WHERE product_id = ?1")
            .bind(&product_id)
            .fetch_optional(&mut *conn)
            .await?;

    if matches!(holder, Some(Some(ref other)) if other != device_id) {
        product_id = format!("{product_id}-{}", device_suffix(device_id));
    }

    sqlx::query(
        r#"
        INSERT INTO products (product_id, category, size, name, price, device_id, stock, updated_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, COALESCE(?7, 0), ?8)
        ON CONFLICT(product_id) DO UPDATE SET
            device_id = excluded.device_id,
            stock = COALESCE(?7, products.stock),
            updated_at = excluded.updated_at
        "#,
    )
    .bind(&product_id)
    .bind(category)
    .bind(size)
    .bind(format!("{category} {size}"))
    .bind(DEFAULT_PRODUCT_PRICE)
    .bind(device_id)
    .bind(stock)
    .bind(now)
    .execute(&mut *conn)
    .await?;

    info!(product_id = %product_id, device_id = %device_id, "Product bound to device");
    Ok(product_id)
}

fn product_id_for(category: Category, size: &str) -> String {
    format!("P-{}-{}", category.as_str().to_uppercase(), size)
}

fn device_suffix(device_id: &str) -> &str {
    let start = device_id
        .char_indices()
        .rev()
        .nth(3)
        .map(|(i, _)| i)
        .unwrap_or(0);
    &device_id[start..]
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::fixtures;

    fn boot(device_id: &str, category: Category, size: &str) -> BootAnnouncement {
        BootAnnouncement {
            device_id: device_id.into(),
            mac_address: Some("AA:BB:CC:DD:EE:FF".into()),
            category: Some(category),
            size: Some(size.into()),
            stock: Some(20),
            ..Default::default()
        }
    }

    #[test]
    fn test_product_id_naming() {
        assert_eq!(product_id_for(Category::Top, "L"), "P-TOP-L");
        assert_eq!(product_id_for(Category::SweatTowel, "F"), "P-SWEAT_TOWEL-F");
        assert_eq!(device_suffix("FBOX-A1B2C3"), "B2C3");
        assert_eq!(device_suffix("AB"), "AB");
    }

    #[tokio::test]
    async fn test_register_creates_bound_product() {
        let db = fixtures::db().await;
        let device = db.devices().register(&boot("FBOX-0001", Category::Top, "L")).await.unwrap();

        assert_eq!(device.product_id.as_deref(), Some("P-TOP-L"));
        assert!(device.last_heartbeat_at.is_some());

        let product = db.products().get("P-TOP-L").await.unwrap().unwrap();
        assert_eq!(product.device_id.as_deref(), Some("FBOX-0001"));
        assert_eq!(product.price, DEFAULT_PRODUCT_PRICE);
        assert_eq!(product.stock, 20);
    }

    #[tokio::test]
    async fn test_register_suffixes_on_collision() {
        let db = fixtures::db().await;
        db.devices().register(&boot("FBOX-0001", Category::Top, "L")).await.unwrap();
        let second = db.devices().register(&boot("FBOX-0002", Category::Top, "L")).await.unwrap();

        assert_eq!(second.product_id.as_deref(), Some("P-TOP-L-0002"));

        // Re-boot keeps the existing binding
        let again = db.devices().register(&boot("FBOX-0002", Category::Top, "L")).await.unwrap();
        assert_eq!(again.product_id.as_deref(), Some("P-TOP-L-0002"));
    }

    #[tokio::test]
    async fn test_heartbeat_vs_status() {
        let db = fixtures::db().await;
        let devices = db.devices();

        devices
            .update_status(&HeartbeatReport {
                device_id: "FBOX-0009".into(),
                door_state: Some(DoorState::Open),
                ..Default::default()
            })
            .await
            .unwrap();
        let device = devices.get("FBOX-0009").await.unwrap().unwrap();
        assert_eq!(device.door_state, DoorState::Open);
        assert!(device.last_heartbeat_at.is_none());
        assert!(!devices.is_online("FBOX-0009", Duration::seconds(120), Utc::now()).await.unwrap());

        devices
            .record_heartbeat(&HeartbeatReport {
                device_id: "FBOX-0009".into(),
                stock: Some(4),
                ..Default::default()
            })
            .await
            .unwrap();
        let device = devices.get("FBOX-0009").await.unwrap().unwrap();
        assert_eq!(device.stock, 4);
        assert_eq!(device.door_state, DoorState::Open);
        assert!(devices.is_online("FBOX-0009", Duration::seconds(120), Utc::now()).await.unwrap());
        assert!(!devices
            .is_online("FBOX-0009", Duration::seconds(120), Utc::now() + Duration::seconds(121))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_set_stock_mirrors_to_product() {
        let db = fixtures::db().await;
        db.devices().register(&boot("FBOX-0001", Category::Pants, "M")).await.unwrap();

        db.devices().set_stock("FBOX-0001", 7).await.unwrap();
        db.devices().set_stock("FBOX-0001", 7).await.unwrap();

        assert_eq!(db.devices().get("FBOX-0001").await.unwrap().unwrap().stock, 7);
        assert_eq!(db.products().get("P-PANTS-M").await.unwrap().unwrap().stock, 7);
    }
}
