//! # fbox-rental: Transaction Orchestrator
//!
//! Charges a member only for the units a dispenser confirmed.
//!
//! ## Collaborators
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                           RentalService                                 │
//! │                                                                         │
//! │   Database (fbox-db)          Arc<dyn Dispenser> (fbox-link)            │
//! │   ├── members / products      └── dispense_and_wait(device, timeout)    │
//! │   ├── devices (liveness)          one unit, one answer                  │
//! │   ├── vouchers / subscriptions                                          │
//! │   ├── ledger (settlement)     RentalConfig                              │
//! │   └── events (audit)          └── dispense timeout, liveness window     │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Everything is passed to [`RentalService::new`]; nothing is looked up
//! from global state.
//!
//! ## Module Organization
//! - [`service`] - Subscription and voucher rental paths, PIN check, admin commands
//! - [`inventory`] - Category-grouped stock view
//! - [`error`] - Rejection reasons with stable codes

pub mod error;
pub mod inventory;
pub mod service;

pub use error::{RentalError, RentalResult};
pub use inventory::{CategoryInventory, InventoryItem};
pub use service::{RentalConfig, RentalService, TransactionResult};
