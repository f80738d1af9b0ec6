//! # fbox-core: Pure Business Logic for the F-BOX Rental Engine
//!
//! Everything here is deterministic and free of I/O: the domain records the
//! ledger stores, the money type, basket validation, and the arithmetic that
//! decides what a member is charged after the hardware has spoken.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        F-BOX Rental Architecture                        │
//! │                                                                         │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │          fbox-rental (Transaction Orchestrator)                 │   │
//! │  │   admission ──► per-unit dispense ──► settlement                │   │
//! │  └───────────────┬───────────────────────────────┬─────────────────┘   │
//! │                  │                               │                      │
//! │  ┌───────────────▼───────────────┐   ┌───────────▼─────────────────┐   │
//! │  │ fbox-link (MQTT, correlator)  │   │ fbox-db (Ledger Store)      │   │
//! │  └───────────────┬───────────────┘   └───────────┬─────────────────┘   │
//! │                  │                               │                      │
//! │  ┌───────────────▼───────────────────────────────▼─────────────────┐   │
//! │  │               ★ fbox-core (THIS CRATE) ★                        │   │
//! │  │                                                                 │   │
//! │  │   ┌───────────┐  ┌───────────┐  ┌────────────┐  ┌───────────┐  │   │
//! │  │   │   types   │  │   money   │  │ settlement │  │  events   │  │   │
//! │  │   │  Voucher  │  │   Money   │  │ split plan │  │ severity  │  │   │
//! │  │   │  Device   │  │  (won)    │  │  outcome   │  │  labels   │  │   │
//! │  │   └───────────┘  └───────────┘  └────────────┘  └───────────┘  │   │
//! │  │                                                                 │   │
//! │  │   NO I/O • NO DATABASE • NO NETWORK • PURE FUNCTIONS           │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`types`] - Domain records (Member, Product, Device, vouchers, subscriptions)
//! - [`money`] - Integer won amounts
//! - [`settlement`] - Voucher split planning, charge computation, result classification
//! - [`events`] - Business event labels and their severities
//! - [`clock`] - Calendar-day helpers (quota days roll over in KST)
//! - [`validation`] - Input validation
//! - [`error`] - Domain error types

// =============================================================================
// Module Declarations
// =============================================================================

pub mod clock;
pub mod error;
pub mod events;
pub mod money;
pub mod settlement;
pub mod types;
pub mod validation;

// =============================================================================
// Re-exports for Convenience
// =============================================================================

pub use error::{CoreError, CoreResult, ValidationError};
pub use events::{BusinessEvent, Severity};
pub use money::Money;
pub use settlement::{
    DispenseFailure, DispenseOutcome, ItemOutcome, PlannedDeduction, TransactionStatus,
    VoucherSelection,
};
pub use types::*;

// =============================================================================
// Crate-Level Constants
// =============================================================================

/// A device whose last heartbeat is older than this is offline.
pub const DEFAULT_LIVENESS_WINDOW_SECS: i64 = 120;

/// How long a single unit may take to confirm before it counts as failed.
pub const DEFAULT_DISPENSE_TIMEOUT_SECS: u64 = 10;

/// Stock at or below this level raises a `stock_low` event.
pub const STOCK_LOW_THRESHOLD: i64 = 5;

/// Price assigned to products auto-created from a device boot announcement.
pub const DEFAULT_PRODUCT_PRICE: i64 = 1000;

/// Maximum line items in one basket.
pub const MAX_BASKET_ITEMS: usize = 20;

/// Maximum units of a single line item.
///
/// ## Business Reason
/// A dispenser slot holds a few dozen garments at most; anything above this
/// is a client bug, not a rental.
pub const MAX_ITEM_QUANTITY: i64 = 10;
