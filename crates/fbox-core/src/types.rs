//! # Domain Types
//!
//! Records owned by the Ledger Store and the enums they are built from.
//!
//! ## Type Map
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Domain Types                                    │
//! │                                                                         │
//! │  ┌─────────────────┐   ┌─────────────────┐   ┌─────────────────┐       │
//! │  │     Member      │   │     Product     │   │     Device      │       │
//! │  │  member_id      │   │  product_id     │   │  device_id      │       │
//! │  │  status         │   │  category/size  │◄──│  product_id     │       │
//! │  │  payment_pin    │   │  price, stock   │   │  last_heartbeat │       │
//! │  └─────────────────┘   └─────────────────┘   └─────────────────┘       │
//! │                                                                         │
//! │  ┌─────────────────┐   ┌─────────────────┐   ┌─────────────────┐       │
//! │  │ VoucherProduct  │──►│  MemberVoucher  │   │ RentalLogEntry  │       │
//! │  │  charge_amount  │   │  remaining      │   │  quantity       │       │
//! │  │  bonus_product  │   │  parent (bonus) │   │  amount charged │       │
//! │  └─────────────────┘   └─────────────────┘   └─────────────────┘       │
//! │                                                                         │
//! │  ┌─────────────────────┐   ┌──────────────────────┐                    │
//! │  │ SubscriptionProduct │──►│  MemberSubscription  │──► usage per day   │
//! │  │  daily allowances   │   │  allowance snapshot  │    per category    │
//! │  └─────────────────────┘   └──────────────────────┘                    │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::events::Severity;
use crate::money::Money;

// =============================================================================
// Category
// =============================================================================

/// Garment category a dispenser slot holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "snake_case"))]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Top,
    Pants,
    Towel,
    SweatTowel,
    Other,
}

impl Category {
    /// All categories, in display order.
    pub const ALL: [Category; 5] = [
        Category::Top,
        Category::Pants,
        Category::Towel,
        Category::SweatTowel,
        Category::Other,
    ];

    /// Returns the wire/database label.
    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Top => "top",
            Category::Pants => "pants",
            Category::Towel => "towel",
            Category::SweatTowel => "sweat_towel",
            Category::Other => "other",
        }
    }

    /// Parses a label reported by firmware. Unknown labels fold into `Other`.
    pub fn from_label(label: &str) -> Self {
        match label.trim().to_lowercase().as_str() {
            "top" => Category::Top,
            "pants" => Category::Pants,
            "towel" => Category::Towel,
            "sweat_towel" | "sweattowel" => Category::SweatTowel,
            _ => Category::Other,
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-category daily allowance, keyed by category.
pub type DailyAllowance = BTreeMap<Category, i64>;

// =============================================================================
// Member
// =============================================================================

/// Lifecycle status of a member.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "lowercase"))]
#[serde(rename_all = "snake_case")]
pub enum MemberStatus {
    #[default]
    Active,
    Inactive,
}

/// A gym member. Enrolled and updated by the external sync collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
pub struct Member {
    pub member_id: String,
    pub name: String,
    /// Contact key (phone number).
    pub phone: Option<String>,
    /// Payment PIN. Never serialised outwards.
    #[serde(skip_serializing, default)]
    pub payment_pin: Option<String>,
    pub status: MemberStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Member {
    #[inline]
    pub fn is_active(&self) -> bool {
        self.status == MemberStatus::Active
    }
}

// =============================================================================
// Product
// =============================================================================

/// A rentable product. At most one physical device is bound to it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
pub struct Product {
    pub product_id: String,
    pub category: Category,
    pub size: String,
    pub name: String,
    /// Unit price in won.
    pub price: i64,
    pub device_id: Option<String>,
    /// Last stock count the bound device reported.
    pub stock: i64,
    pub enabled: bool,
    pub display_order: i64,
    pub updated_at: DateTime<Utc>,
}

impl Product {
    /// Returns the unit price as Money.
    #[inline]
    pub fn price(&self) -> Money {
        Money::from_won(self.price)
    }
}

// =============================================================================
// Device
// =============================================================================

/// Door position reported by a dispenser.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "lowercase"))]
#[serde(rename_all = "snake_case")]
pub enum DoorState {
    Open,
    #[default]
    Closed,
}

impl DoorState {
    /// Parses a firmware label (`"open"`, `"closed"`), case-insensitive.
    pub fn from_label(label: &str) -> Option<Self> {
        match label.trim().to_lowercase().as_str() {
            "open" | "opened" => Some(DoorState::Open),
            "closed" | "close" => Some(DoorState::Closed),
            _ => None,
        }
    }
}

/// A physical dispenser unit, as last reported over the status topic.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
pub struct Device {
    pub device_id: String,
    pub mac_address: Option<String>,
    pub device_name: String,
    pub category: Category,
    pub size: String,
    pub product_id: Option<String>,
    pub stock: i64,
    pub door_state: DoorState,
    pub locked: bool,
    pub wifi_rssi: Option<i64>,
    pub ip_address: Option<String>,
    pub firmware_version: Option<String>,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    pub first_seen_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Device {
    /// A device is online when its last heartbeat is within `window` of `now`.
    ///
    /// A device that never sent a heartbeat is offline.
    pub fn is_online(&self, now: DateTime<Utc>, window: Duration) -> bool {
        match self.last_heartbeat_at {
            Some(at) => now.signed_duration_since(at) <= window,
            None => false,
        }
    }
}

// =============================================================================
// Vouchers
// =============================================================================

/// Catalog entry a voucher instance is issued from.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
pub struct VoucherProduct {
    pub product_id: String,
    pub name: String,
    /// What the member pays for it.
    pub price: i64,
    /// Spendable balance it grants.
    pub charge_amount: i64,
    pub validity_days: i64,
    /// Bonus product issued alongside (pending until this one is exhausted).
    pub bonus_product_id: Option<String>,
    pub is_bonus: bool,
    pub enabled: bool,
}

/// Voucher lifecycle.
///
/// ```text
///   pending ──(parent exhausted)──► active ──(remaining = 0)──► exhausted
///      │                              │
///      └──────────► expired ◄─────────┘   (window elapsed / parent expired)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "lowercase"))]
#[serde(rename_all = "snake_case")]
pub enum VoucherStatus {
    Pending,
    Active,
    Exhausted,
    Expired,
}

impl VoucherStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            VoucherStatus::Pending => "pending",
            VoucherStatus::Active => "active",
            VoucherStatus::Exhausted => "exhausted",
            VoucherStatus::Expired => "expired",
        }
    }
}

/// A spendable voucher instance held by a member.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
pub struct MemberVoucher {
    pub voucher_id: i64,
    pub member_id: String,
    pub voucher_product_id: String,
    pub original_amount: i64,
    pub remaining_amount: i64,
    /// Set on bonus vouchers: the voucher whose exhaustion activates this one.
    pub parent_voucher_id: Option<i64>,
    pub valid_from: Option<DateTime<Utc>>,
    pub valid_until: Option<DateTime<Utc>>,
    pub status: VoucherStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl MemberVoucher {
    #[inline]
    pub fn remaining(&self) -> Money {
        Money::from_won(self.remaining_amount)
    }

    #[inline]
    pub fn original(&self) -> Money {
        Money::from_won(self.original_amount)
    }

    /// True once the validity window has closed. Pending vouchers have no window.
    pub fn window_elapsed(&self, now: DateTime<Utc>) -> bool {
        self.valid_until.map(|until| now >= until).unwrap_or(false)
    }

    /// Active, inside its window and with something left to spend.
    pub fn is_spendable(&self, now: DateTime<Utc>) -> bool {
        self.status == VoucherStatus::Active
            && self.remaining_amount > 0
            && !self.window_elapsed(now)
    }
}

/// Voucher transaction type for rental deductions.
pub const VOUCHER_TX_RENTAL: &str = "rental";

/// Audit row written for every voucher deduction.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
pub struct VoucherTransaction {
    pub id: i64,
    pub voucher_id: i64,
    pub member_id: String,
    pub amount: i64,
    pub balance_before: i64,
    pub balance_after: i64,
    pub transaction_type: String,
    pub rental_log_id: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub synced: bool,
}

// =============================================================================
// Subscriptions
// =============================================================================

/// Catalog entry a subscription is issued from.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
pub struct SubscriptionProduct {
    pub product_id: String,
    pub name: String,
    pub price: i64,
    pub validity_days: i64,
    #[cfg_attr(feature = "sqlx", sqlx(json))]
    pub daily_limits: DailyAllowance,
    pub enabled: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "lowercase"))]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Active,
    Expired,
}

/// A day-quota subscription held by a member.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
pub struct MemberSubscription {
    pub subscription_id: i64,
    pub member_id: String,
    pub subscription_product_id: String,
    pub valid_from: DateTime<Utc>,
    pub valid_until: DateTime<Utc>,
    /// Allowances copied from the product at issue time.
    #[cfg_attr(feature = "sqlx", sqlx(json))]
    pub daily_limits: DailyAllowance,
    pub status: SubscriptionStatus,
    pub created_at: DateTime<Utc>,
}

impl MemberSubscription {
    /// Daily allowance for a category; categories not in the snapshot get none.
    pub fn allowance_for(&self, category: Category) -> i64 {
        self.daily_limits.get(&category).copied().unwrap_or(0)
    }

    pub fn window_elapsed(&self, now: DateTime<Utc>) -> bool {
        now >= self.valid_until
    }
}

/// Usage counter row for one (subscription, day, category).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
pub struct SubscriptionUsage {
    pub subscription_id: i64,
    pub usage_date: NaiveDate,
    pub category: Category,
    pub used_count: i64,
}

// =============================================================================
// Rental Log
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "lowercase"))]
#[serde(rename_all = "snake_case")]
pub enum PaymentType {
    Voucher,
    Subscription,
}

/// One row per line item with at least one confirmed unit.
///
/// Append-only. `amount` is what was charged for `quantity` confirmed units.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
pub struct RentalLogEntry {
    pub id: i64,
    /// Groups the rows written by one basket.
    pub transaction_id: String,
    pub member_id: String,
    pub product_id: String,
    pub product_name: String,
    pub device_id: String,
    pub quantity: i64,
    pub payment_type: PaymentType,
    pub voucher_id: Option<i64>,
    pub subscription_id: Option<i64>,
    pub amount: i64,
    pub created_at: DateTime<Utc>,
    pub synced: bool,
}

/// Fields for a new rental log row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewRentalLogEntry {
    pub transaction_id: String,
    pub member_id: String,
    pub product_id: String,
    pub product_name: String,
    pub device_id: String,
    pub quantity: i64,
    pub payment_type: PaymentType,
    pub voucher_id: Option<i64>,
    pub subscription_id: Option<i64>,
    pub amount: i64,
}

// =============================================================================
// Event Log
// =============================================================================

/// Audit row for business and hardware events.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
pub struct EventLogEntry {
    pub id: i64,
    pub event_type: String,
    pub severity: Severity,
    pub device_id: Option<String>,
    pub member_id: Option<String>,
    pub product_id: Option<String>,
    /// JSON object with event-specific fields.
    pub details: String,
    pub created_at: DateTime<Utc>,
    pub synced: bool,
}

// =============================================================================
// Basket
// =============================================================================

/// A caller-submitted line item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BasketItem {
    pub product_id: String,
    pub quantity: i64,
}

impl BasketItem {
    pub fn new(product_id: impl Into<String>, quantity: i64) -> Self {
        BasketItem {
            product_id: product_id.into(),
            quantity,
        }
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
