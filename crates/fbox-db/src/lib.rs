//! # fbox-db: Ledger Store for the F-BOX Rental Engine
//!
//! The durable, concurrently-guarded record of members, products, device
//! state, voucher and subscription instances, daily usage counters and the
//! append-only rental log. SQLite via sqlx.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        F-BOX Data Flow                                  │
//! │                                                                         │
//! │  fbox-rental (admission, settlement)   fbox-link (status events)       │
//! │       │                                      │                          │
//! │       ▼                                      ▼                          │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                     fbox-db (THIS CRATE)                        │   │
//! │  │                                                                 │   │
//! │  │   ┌───────────────┐    ┌───────────────┐    ┌──────────────┐  │   │
//! │  │   │   Database    │    │  Repositories │    │  Migrations  │  │   │
//! │  │   │   (pool.rs)   │    │               │    │  (embedded)  │  │   │
//! │  │   │               │    │ VoucherRepo   │    │              │  │   │
//! │  │   │ SqlitePool    │◄───│ Subscription  │    │ 001_schema   │  │   │
//! │  │   │ WriteLock     │    │ LedgerRepo    │    │ 002_catalog  │  │   │
//! │  │   └───────────────┘    └───────────────┘    └──────────────┘  │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                     SQLite Database (WAL)                       │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Organization
//!
//! - [`pool`] - Connection pool creation, configuration and the writer lock
//! - [`migrations`] - Embedded database migrations
//! - [`error`] - Database error types
//! - [`repository`] - Repository implementations
//!
//! ## Usage
//!
//! ```rust,ignore
//! use fbox_db::{Database, DbConfig};
//!
//! let db = Database::new(DbConfig::new("fbox.db")).await?;
//! let remaining = db.subscriptions().get_remaining_today(42, Category::Top).await?;
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod migrations;
pub mod pool;
pub mod repository;

// =============================================================================
// Re-exports
// =============================================================================

pub use error::{DbError, DbResult};
pub use pool::{Database, DbConfig};

// Repository re-exports for convenience
pub use repository::device::{BootAnnouncement, DeviceRepository, HeartbeatReport};
pub use repository::event::{EventQuery, EventRepository, NewEvent};
pub use repository::ledger::{
    new_transaction_id, LedgerRepository, SubscriptionSettlement, VoucherSettlement,
};
pub use repository::member::MemberRepository;
pub use repository::product::ProductRepository;
pub use repository::rental::RentalRepository;
pub use repository::subscription::SubscriptionRepository;
pub use repository::voucher::{Deduction, VoucherRepository};
