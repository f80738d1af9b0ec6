//! # Repository Module
//!
//! Ledger repositories for the F-BOX rental engine.
//!
//! ## Repository Pattern
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Repository Layout                                    │
//! │                                                                         │
//! │  Orchestrator / event worker                                           │
//! │       │                                                                 │
//! │       │  db.vouchers().get_active_vouchers("M001")                     │
//! │       ▼                                                                 │
//! │  Repository { pool, write_lock }                                       │
//! │  ├── reads   → straight to the pool                                    │
//! │  └── writes  → lock ─► BEGIN ─► ... ─► COMMIT ─► unlock               │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  SQLite Database                                                       │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Reads that lazily expire records (vouchers, subscriptions) are writes too
//! and take the lock.
//!
//! ## Available Repositories
//!
//! - [`MemberRepository`](member::MemberRepository) - Members and PIN check
//! - [`ProductRepository`](product::ProductRepository) - Products and stock
//! - [`DeviceRepository`](device::DeviceRepository) - Device state and liveness
//! - [`VoucherRepository`](voucher::VoucherRepository) - Vouchers, deductions, bonus chains
//! - [`SubscriptionRepository`](subscription::SubscriptionRepository) - Subscriptions and quota
//! - [`RentalRepository`](rental::RentalRepository) - Rental log
//! - [`EventRepository`](event::EventRepository) - Audit events
//! - [`LedgerRepository`](ledger::LedgerRepository) - Atomic basket settlement

pub mod device;
pub mod event;
pub mod ledger;
pub mod member;
pub mod product;
pub mod rental;
pub mod subscription;
pub mod voucher;

#[cfg(test)]
pub(crate) mod fixtures {
    use chrono::Utc;
    use fbox_core::{Category, Member, MemberStatus, Product};

    use crate::{Database, DbConfig};

    pub async fn db() -> Database {
        Database::new(DbConfig::in_memory()).await.unwrap()
    }

    pub fn member(id: &str) -> Member {
        let now = Utc::now();
        Member {
            member_id: id.to_string(),
            name: format!("Member {id}"),
            phone: Some("010-0000-0000".to_string()),
            payment_pin: Some("1234".to_string()),
            status: MemberStatus::Active,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn product(id: &str, category: Category, price: i64, device_id: Option<&str>) -> Product {
        Product {
            product_id: id.to_string(),
            category,
            size: "L".to_string(),
            name: format!("{category} L"),
            price,
            device_id: device_id.map(str::to_string),
            stock: 10,
            enabled: true,
            display_order: 0,
            updated_at: Utc::now(),
        }
    }

    /// Database with member `M001` and product `P-TOP-L` (600 won).
    pub async fn seeded() -> Database {
        let db = db().await;
        db.members().upsert(&member("M001")).await.unwrap();
        db.products()
            .upsert(&product("P-TOP-L", Category::Top, 600, None))
            .await
            .unwrap();
        db
    }
}
