//! # Business Events
//!
//! Labels raw device events and orchestrator outcomes with a business
//! severity so the audit log can be filtered by what needs attention.
//!
//! ## Severity Map
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  INFO      rental_success, device_online, door_closed, stock_updated   │
//! │  WARNING   stock_low, door_opened, device_offline                       │
//! │  ERROR     rental_failed, stock_empty, dispense_failed, motor_error,    │
//! │            home_failed, error                                           │
//! │                                                                         │
//! │  Anything not listed is INFO.                                          │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::STOCK_LOW_THRESHOLD;

// =============================================================================
// Severity
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "lowercase"))]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Error,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Error => "error",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Business Event
// =============================================================================

/// Event types recorded in the audit log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BusinessEvent {
    RentalSuccess,
    RentalFailed,
    DeviceOnline,
    DeviceOffline,
    DoorOpened,
    DoorClosed,
    StockUpdated,
    StockLow,
    StockEmpty,
    DispenseFailed,
    HomeFailed,
    Error,
}

impl BusinessEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            BusinessEvent::RentalSuccess => "rental_success",
            BusinessEvent::RentalFailed => "rental_failed",
            BusinessEvent::DeviceOnline => "device_online",
            BusinessEvent::DeviceOffline => "device_offline",
            BusinessEvent::DoorOpened => "door_opened",
            BusinessEvent::DoorClosed => "door_closed",
            BusinessEvent::StockUpdated => "stock_updated",
            BusinessEvent::StockLow => "stock_low",
            BusinessEvent::StockEmpty => "stock_empty",
            BusinessEvent::DispenseFailed => "dispense_failed",
            BusinessEvent::HomeFailed => "home_failed",
            BusinessEvent::Error => "error",
        }
    }

    pub fn severity(&self) -> Severity {
        classify(self.as_str())
    }
}

impl fmt::Display for BusinessEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Classification
// =============================================================================

/// Severity for a raw event type label.
pub fn classify(event_type: &str) -> Severity {
    match event_type {
        "stock_low" | "door_opened" | "device_offline" => Severity::Warning,
        "rental_failed" | "stock_empty" | "dispense_failed" | "motor_error" | "home_failed"
        | "error" => Severity::Error,
        _ => Severity::Info,
    }
}

/// Stock alert raised after a stock change, at the default low threshold.
pub fn stock_alert(stock: i64) -> Option<BusinessEvent> {
    stock_alert_at(stock, STOCK_LOW_THRESHOLD)
}

/// Stock alert for a configured low threshold.
///
/// Zero is `stock_empty`; at or below `low_threshold` is `stock_low`.
pub fn stock_alert_at(stock: i64, low_threshold: i64) -> Option<BusinessEvent> {
    if stock <= 0 {
        Some(BusinessEvent::StockEmpty)
    } else if stock <= low_threshold {
        Some(BusinessEvent::StockLow)
    } else {
        None
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity_map() {
        assert_eq!(classify("rental_success"), Severity::Info);
        assert_eq!(classify("door_closed"), Severity::Info);
        assert_eq!(classify("stock_low"), Severity::Warning);
        assert_eq!(classify("device_offline"), Severity::Warning);
        assert_eq!(classify("dispense_failed"), Severity::Error);
        assert_eq!(classify("home_failed"), Severity::Error);
        assert_eq!(classify("wifi_reconnected"), Severity::Info);
    }

    #[test]
    fn test_business_event_severity_matches_label() {
        assert_eq!(BusinessEvent::RentalFailed.severity(), Severity::Error);
        assert_eq!(BusinessEvent::DoorOpened.severity(), Severity::Warning);
        assert_eq!(BusinessEvent::StockUpdated.severity(), Severity::Info);
    }

    #[test]
    fn test_stock_alert_thresholds() {
        assert_eq!(stock_alert(0), Some(BusinessEvent::StockEmpty));
        assert_eq!(stock_alert(5), Some(BusinessEvent::StockLow));
        assert_eq!(stock_alert(1), Some(BusinessEvent::StockLow));
        assert_eq!(stock_alert(6), None);
        assert_eq!(stock_alert_at(8, 10), Some(BusinessEvent::StockLow));
    }
}
