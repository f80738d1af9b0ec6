//! # Database Pool Management
//!
//! Connection pool creation and configuration for SQLite, plus the writer
//! lock every repository shares.
//!
//! ## Architecture
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      Database Connection Pool                           │
//! │                                                                         │
//! │  DbConfig::new(path) ← Configure pool settings                         │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  Database::new(config).await ← Create pool + run migrations            │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  ┌─────────────────────────────────────────┐   ┌──────────────────┐    │
//! │  │            SqlitePool                    │   │   WriteLock      │    │
//! │  │  ┌─────┐ ┌─────┐ ┌─────┐                │   │  Mutex<()>       │    │
//! │  │  │Conn1│ │Conn2│ │Conn3│ ...            │   │  one writer at a │    │
//! │  │  └─────┘ └─────┘ └─────┘                │   │  time, any repo  │    │
//! │  └─────────────────────────────────────────┘   └──────────────────┘    │
//! │       │                                               │                 │
//! │       ▼                                               ▼                 │
//! │  Reads run in parallel             Mutations queue on the lock and     │
//! │                                    run inside one SQL transaction      │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## WAL Mode
//! Readers don't block the writer and the writer doesn't block readers, so
//! inventory and balance queries stay responsive during settlement.

use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::SqlitePool;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::{DbError, DbResult};
use crate::migrations;
use crate::repository::device::DeviceRepository;
use crate::repository::event::EventRepository;
use crate::repository::ledger::LedgerRepository;
use crate::repository::member::MemberRepository;
use crate::repository::product::ProductRepository;
use crate::repository::rental::RentalRepository;
use crate::repository::subscription::SubscriptionRepository;
use crate::repository::voucher::VoucherRepository;

/// The single ledger writer lock.
pub type WriteLock = Arc<Mutex<()>>;

// =============================================================================
// Configuration
// =============================================================================

/// Database configuration.
///
/// ## Example
/// ```rust,ignore
/// let config = DbConfig::new("/var/lib/fbox/fbox.db")
///     .max_connections(5)
///     .min_connections(1);
/// ```
#[derive(Debug, Clone)]
pub struct DbConfig {
    /// Path to the SQLite database file.
    pub database_path: PathBuf,

    /// Maximum number of connections in the pool.
    /// Default: 5
    pub max_connections: u32,

    /// Minimum number of connections to keep alive.
    /// Default: 1
    pub min_connections: u32,

    /// Connection timeout duration.
    /// Default: 30 seconds
    pub connect_timeout: Duration,

    /// Idle timeout before closing a connection.
    /// Default: 10 minutes
    pub idle_timeout: Duration,

    /// Whether to run migrations on connect.
    /// Default: true
    pub run_migrations: bool,
}

impl DbConfig {
    /// Creates a new database configuration with the given path.
    ///
    /// The file is created if it doesn't exist.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        DbConfig {
            database_path: path.into(),
            max_connections: 5,
            min_connections: 1,
            connect_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(600),
            run_migrations: true,
        }
    }

    /// Sets the maximum number of connections.
    pub fn max_connections(mut self, max: u32) -> Self {
        self.max_connections = max;
        self
    }

    /// Sets the minimum number of connections.
    pub fn min_connections(mut self, min: u32) -> Self {
        self.min_connections = min;
        self
    }

    /// Sets the connection timeout.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Sets whether to run migrations on connect.
    pub fn run_migrations(mut self, run: bool) -> Self {
        self.run_migrations = run;
        self
    }

    /// Creates an in-memory database configuration (for testing).
    ///
    /// ## Usage
    /// ```rust,ignore
    /// let db = Database::new(DbConfig::in_memory()).await?;
    /// ```
    pub fn in_memory() -> Self {
        DbConfig {
            database_path: PathBuf::from(":memory:"),
            max_connections: 1, // In-memory requires single connection
            min_connections: 1,
            connect_timeout: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(60),
            run_migrations: true,
        }
    }
}

// =============================================================================
// Database
// =============================================================================

/// Main database handle providing repository access.
///
/// Cheap to clone; clones share the pool and the writer lock. Components
/// receive it through their constructors.
///
/// ## Usage
/// ```rust,ignore
/// let db = Database::new(DbConfig::in_memory()).await?;
/// let vouchers = db.vouchers().get_active_vouchers("M001").await?;
/// ```
#[derive(Debug, Clone)]
pub struct Database {
    /// The SQLite connection pool.
    pool: SqlitePool,

    /// Serialises every ledger mutation.
    write_lock: WriteLock,
}

impl Database {
    /// Creates a new database connection pool.
    ///
    /// ## What This Does
    /// 1. Creates the database file if it doesn't exist
    /// 2. Configures SQLite:
    ///    - WAL mode for concurrent reads
    ///    - NORMAL synchronous (balance of safety/speed)
    ///    - Foreign keys enabled
    /// 3. Creates the connection pool
    /// 4. Runs migrations (if enabled)
    pub async fn new(config: DbConfig) -> DbResult<Self> {
        info!(
            path = %config.database_path.display(),
            "Initializing database connection"
        );

        let connect_url = format!("sqlite://{}?mode=rwc", config.database_path.display());

        let connect_options = SqliteConnectOptions::from_str(&connect_url)
            .map_err(|e| DbError::ConnectionFailed(e.to_string()))?
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            // SQLite has them disabled by default
            .foreign_keys(true)
            .create_if_missing(true);

        debug!("Connection options configured");

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(config.connect_timeout)
            .idle_timeout(Some(config.idle_timeout))
            .connect_with(connect_options)
            .await
            .map_err(|e| DbError::ConnectionFailed(e.to_string()))?;

        info!(
            max_connections = config.max_connections,
            "Database pool created"
        );

        let db = Database {
            pool,
            write_lock: Arc::new(Mutex::new(())),
        };

        if config.run_migrations {
            db.run_migrations().await?;
        }

        Ok(db)
    }

    /// Runs database migrations. Idempotent.
    pub async fn run_migrations(&self) -> DbResult<()> {
        info!("Running database migrations");
        migrations::run_migrations(&self.pool).await?;
        info!("Migrations complete");
        Ok(())
    }

    /// Returns a reference to the connection pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    fn lock(&self) -> WriteLock {
        Arc::clone(&self.write_lock)
    }

    /// Members (read, upsert from sync, PIN check).
    pub fn members(&self) -> MemberRepository {
        MemberRepository::new(self.pool.clone(), self.lock())
    }

    /// Rentable products.
    pub fn products(&self) -> ProductRepository {
        ProductRepository::new(self.pool.clone(), self.lock())
    }

    /// Dispenser state mirrored from status events.
    pub fn devices(&self) -> DeviceRepository {
        DeviceRepository::new(self.pool.clone(), self.lock())
    }

    /// Voucher catalog, instances and deductions.
    pub fn vouchers(&self) -> VoucherRepository {
        VoucherRepository::new(self.pool.clone(), self.lock())
    }

    /// Subscription catalog, instances and daily usage.
    pub fn subscriptions(&self) -> SubscriptionRepository {
        SubscriptionRepository::new(self.pool.clone(), self.lock())
    }

    /// The append-only rental log.
    pub fn rentals(&self) -> RentalRepository {
        RentalRepository::new(self.pool.clone(), self.lock())
    }

    /// Business and hardware audit events.
    pub fn events(&self) -> EventRepository {
        EventRepository::new(self.pool.clone(), self.lock())
    }

    /// Multi-table settlement of a finished basket.
    pub fn ledger(&self) -> LedgerRepository {
        LedgerRepository::new(self.pool.clone(), self.lock())
    }

    /// Closes the database connection pool.
    pub async fn close(&self) {
        info!("Closing database connection pool");
        self.pool.close().await;
    }

    /// Checks if the database can execute queries.
    pub async fn health_check(&self) -> bool {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .is_ok()
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_in_memory_database() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();

        assert!(db.health_check().await);

        let (total, applied) = migrations::migration_status(db.pool()).await.unwrap();
        assert_eq!(total, applied);
    }

    #[tokio::test]
    async fn test_default_catalog_is_seeded() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();

        let vch = db.vouchers().get_product("VCH-100K").await.unwrap().unwrap();
        assert_eq!(vch.charge_amount, 100_000);
        assert_eq!(vch.bonus_product_id.as_deref(), Some("VCH-BONUS-10K"));

        let sub = db
            .subscriptions()
            .get_product("SUB-3M-PREMIUM")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(sub.daily_limits.get(&fbox_core::Category::Towel), Some(&3));
    }

    #[test]
    fn test_config_builder() {
        let config = DbConfig::new("/tmp/test.db")
            .max_connections(10)
            .min_connections(2);

        assert_eq!(config.max_connections, 10);
        assert_eq!(config.min_connections, 2);
    }
}
