//! # Dispenser Wire Protocol
//!
//! JSON messages exchanged with dispensers over the broker.
//!
//! ## Topics
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        F-BOX Topic Layout                               │
//! │                                                                         │
//! │  SERVER ───► fbox/{device}/cmd      QoS 1                              │
//! │              { "cmd": "DISPENSE", "timestamp": 1718000000 }            │
//! │              { "cmd": "SET_STOCK", "timestamp": ..., "stock": 12 }     │
//! │                                                                         │
//! │  DEVICE ───► fbox/{device}/status   QoS 0  (server subscribes fbox/+/) │
//! │              { "event": "dispense_complete", "stock": 11 }             │
//! │              { "event": "dispense_failed", "reason": "no_stock" }      │
//! │              { "event": "heartbeat", "stock": 11, "wifiRssi": -61 }    │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The device id comes from the topic segment unless the payload carries a
//! `deviceUUID` field, which wins.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{LinkError, LinkResult};
use fbox_core::{BusinessEvent, DispenseFailure, DispenseOutcome};

/// Topic filter covering every dispenser's status topic.
pub const STATUS_TOPIC_FILTER: &str = "fbox/+/status";

const TOPIC_ROOT: &str = "fbox";

/// Command topic for one dispenser.
pub fn command_topic(device_id: &str) -> String {
    format!("{TOPIC_ROOT}/{device_id}/cmd")
}

/// Extracts the device segment from `fbox/{device}/status`.
pub fn device_from_status_topic(topic: &str) -> LinkResult<&str> {
    let mut parts = topic.split('/');
    match (parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some(TOPIC_ROOT), Some(device), Some("status"), None) if !device.is_empty() => Ok(device),
        _ => Err(LinkError::InvalidTopic(topic.to_string())),
    }
}

// =============================================================================
// Commands (server → device)
// =============================================================================

/// A command for a dispenser.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Command {
    /// Release one unit.
    Dispense,
    /// Ask for a `status` event.
    Status,
    /// Overwrite the device's stock counter.
    SetStock { stock: i64 },
    /// Emergency stop.
    Stop,
    /// Maintenance lock; the device refuses dispenses.
    Lock,
    Unlock,
    /// Drive the mechanism back to its home position.
    Home,
    Reboot,
    ClearError,
}

impl Command {
    pub fn as_str(&self) -> &'static str {
        match self {
            Command::Dispense => "DISPENSE",
            Command::Status => "STATUS",
            Command::SetStock { .. } => "SET_STOCK",
            Command::Stop => "STOP",
            Command::Lock => "LOCK",
            Command::Unlock => "UNLOCK",
            Command::Home => "HOME",
            Command::Reboot => "REBOOT",
            Command::ClearError => "CLEAR_ERROR",
        }
    }

    /// Serializes `{cmd, timestamp, ...params}` with a unix-seconds timestamp.
    pub fn encode(&self, at: DateTime<Utc>) -> LinkResult<Vec<u8>> {
        let envelope = CommandEnvelope {
            command: self,
            timestamp: at.timestamp(),
        };
        Ok(serde_json::to_vec(&envelope)?)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Serialize)]
struct CommandEnvelope<'a> {
    #[serde(flatten)]
    command: &'a Command,
    timestamp: i64,
}

// =============================================================================
// Events (device → server)
// =============================================================================

/// An event published on a dispenser's status topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum DeviceEvent {
    #[serde(rename_all = "camelCase")]
    BootComplete {
        mac_address: Option<String>,
        category: Option<String>,
        size: Option<String>,
        stock: Option<i64>,
        firmware_version: Option<String>,
        ip_address: Option<String>,
    },

    #[serde(rename_all = "camelCase")]
    Heartbeat {
        stock: Option<i64>,
        door_state: Option<String>,
        locked: Option<bool>,
        wifi_rssi: Option<i64>,
        ip_address: Option<String>,
    },

    /// Reply to a `STATUS` command.
    #[serde(rename_all = "camelCase")]
    Status {
        size: Option<String>,
        stock: Option<i64>,
        door_state: Option<String>,
        floor_state: Option<String>,
        locked: Option<bool>,
        wifi_rssi: Option<i64>,
    },

    DispenseComplete {
        stock: Option<i64>,
    },

    DispenseFailed {
        reason: Option<String>,
    },

    DoorOpened,

    #[serde(rename_all = "camelCase")]
    DoorClosed {
        stock: Option<i64>,
        sensor_available: Option<bool>,
    },

    #[serde(rename_all = "camelCase")]
    StockUpdated {
        stock: Option<i64>,
        source: Option<String>,
        #[serde(default)]
        needs_verification: bool,
    },

    StockLow {
        stock: Option<i64>,
    },

    StockEmpty,

    #[serde(rename_all = "camelCase")]
    Error {
        error_code: Option<Value>,
        error_message: Option<String>,
    },

    HomeFailed {
        reason: Option<String>,
    },

    #[serde(rename_all = "camelCase")]
    WifiReconnected {
        ip_address: Option<String>,
    },

    MqttReconnected,

    /// Any event label this server does not know.
    #[serde(other)]
    Unknown,
}

/// Discriminant of [`DeviceEvent`], used as the dispatch table key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EventKind {
    BootComplete,
    Heartbeat,
    Status,
    DispenseComplete,
    DispenseFailed,
    DoorOpened,
    DoorClosed,
    StockUpdated,
    StockLow,
    StockEmpty,
    Error,
    HomeFailed,
    WifiReconnected,
    MqttReconnected,
    Unknown,
}

impl EventKind {
    pub const ALL: [EventKind; 15] = [
        EventKind::BootComplete,
        EventKind::Heartbeat,
        EventKind::Status,
        EventKind::DispenseComplete,
        EventKind::DispenseFailed,
        EventKind::DoorOpened,
        EventKind::DoorClosed,
        EventKind::StockUpdated,
        EventKind::StockLow,
        EventKind::StockEmpty,
        EventKind::Error,
        EventKind::HomeFailed,
        EventKind::WifiReconnected,
        EventKind::MqttReconnected,
        EventKind::Unknown,
    ];

    /// The wire label (`"dispense_complete"`, ...).
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::BootComplete => "boot_complete",
            EventKind::Heartbeat => "heartbeat",
            EventKind::Status => "status",
            EventKind::DispenseComplete => "dispense_complete",
            EventKind::DispenseFailed => "dispense_failed",
            EventKind::DoorOpened => "door_opened",
            EventKind::DoorClosed => "door_closed",
            EventKind::StockUpdated => "stock_updated",
            EventKind::StockLow => "stock_low",
            EventKind::StockEmpty => "stock_empty",
            EventKind::Error => "error",
            EventKind::HomeFailed => "home_failed",
            EventKind::WifiReconnected => "wifi_reconnected",
            EventKind::MqttReconnected => "mqtt_reconnected",
            EventKind::Unknown => "unknown",
        }
    }
}

impl EventKind {
    /// The audit label this kind is recorded under, when it has one.
    pub fn business_event(&self) -> Option<BusinessEvent> {
        match self {
            EventKind::BootComplete => Some(BusinessEvent::DeviceOnline),
            EventKind::DispenseFailed => Some(BusinessEvent::DispenseFailed),
            EventKind::DoorOpened => Some(BusinessEvent::DoorOpened),
            EventKind::DoorClosed => Some(BusinessEvent::DoorClosed),
            EventKind::StockUpdated => Some(BusinessEvent::StockUpdated),
            EventKind::StockLow => Some(BusinessEvent::StockLow),
            EventKind::StockEmpty => Some(BusinessEvent::StockEmpty),
            EventKind::Error => Some(BusinessEvent::Error),
            EventKind::HomeFailed => Some(BusinessEvent::HomeFailed),
            _ => None,
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl DeviceEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            DeviceEvent::BootComplete { .. } => EventKind::BootComplete,
            DeviceEvent::Heartbeat { .. } => EventKind::Heartbeat,
            DeviceEvent::Status { .. } => EventKind::Status,
            DeviceEvent::DispenseComplete { .. } => EventKind::DispenseComplete,
            DeviceEvent::DispenseFailed { .. } => EventKind::DispenseFailed,
            DeviceEvent::DoorOpened => EventKind::DoorOpened,
            DeviceEvent::DoorClosed { .. } => EventKind::DoorClosed,
            DeviceEvent::StockUpdated { .. } => EventKind::StockUpdated,
            DeviceEvent::StockLow { .. } => EventKind::StockLow,
            DeviceEvent::StockEmpty => EventKind::StockEmpty,
            DeviceEvent::Error { .. } => EventKind::Error,
            DeviceEvent::HomeFailed { .. } => EventKind::HomeFailed,
            DeviceEvent::WifiReconnected { .. } => EventKind::WifiReconnected,
            DeviceEvent::MqttReconnected => EventKind::MqttReconnected,
            DeviceEvent::Unknown => EventKind::Unknown,
        }
    }

    /// Absolute stock count carried by the event, if any.
    pub fn stock(&self) -> Option<i64> {
        match self {
            DeviceEvent::BootComplete { stock, .. }
            | DeviceEvent::Heartbeat { stock, .. }
            | DeviceEvent::Status { stock, .. }
            | DeviceEvent::DispenseComplete { stock }
            | DeviceEvent::DoorClosed { stock, .. }
            | DeviceEvent::StockUpdated { stock, .. }
            | DeviceEvent::StockLow { stock } => *stock,
            DeviceEvent::StockEmpty => Some(0),
            _ => None,
        }
    }

    /// The dispense resolution this event carries, for completion and failure events.
    pub fn dispense_outcome(&self) -> Option<DispenseOutcome> {
        match self {
            DeviceEvent::DispenseComplete { stock } => Some(DispenseOutcome::Confirmed {
                reported_stock: *stock,
            }),
            DeviceEvent::DispenseFailed { reason } => Some(DispenseOutcome::Failed {
                reason: reason
                    .as_deref()
                    .map(DispenseFailure::from_device_reason)
                    .unwrap_or(DispenseFailure::DeviceFault),
            }),
            _ => None,
        }
    }
}

// =============================================================================
// Status Message
// =============================================================================

/// A parsed status-topic publish.
#[derive(Debug, Clone)]
pub struct StatusMessage {
    pub device_id: String,
    pub event: DeviceEvent,
    /// The `event` label as sent, kept for unknown events.
    pub label: String,
    /// The raw payload, stored as audit details.
    pub payload: Value,
    pub received_at: DateTime<Utc>,
}

impl StatusMessage {
    /// Parses a publish on `fbox/{device}/status`.
    pub fn parse(topic: &str, payload: &[u8], received_at: DateTime<Utc>) -> LinkResult<Self> {
        let topic_device = device_from_status_topic(topic)?;

        let raw: Value = serde_json::from_slice(payload)
            .map_err(|e| LinkError::InvalidMessage(format!("{topic}: {e}")))?;

        let label = raw
            .get("event")
            .and_then(Value::as_str)
            .ok_or_else(|| LinkError::InvalidMessage(format!("{topic}: missing event field")))?
            .to_string();

        let device_id = raw
            .get("deviceUUID")
            .and_then(Value::as_str)
            .filter(|id| !id.is_empty())
            .unwrap_or(topic_device)
            .to_string();

        let event: DeviceEvent = serde_json::from_value(raw.clone())
            .map_err(|e| LinkError::InvalidMessage(format!("{label} from {device_id}: {e}")))?;

        Ok(StatusMessage {
            device_id,
            event,
            label,
            payload: raw,
            received_at,
        })
    }

    #[inline]
    pub fn kind(&self) -> EventKind {
        self.event.kind()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(topic: &str, json: &str) -> LinkResult<StatusMessage> {
        StatusMessage::parse(topic, json.as_bytes(), Utc::now())
    }

    #[test]
    fn test_topics() {
        assert_eq!(command_topic("FBOX-0001"), "fbox/FBOX-0001/cmd");
        assert_eq!(device_from_status_topic("fbox/FBOX-0001/status").unwrap(), "FBOX-0001");
        assert!(device_from_status_topic("fbox/FBOX-0001/cmd").is_err());
        assert!(device_from_status_topic("fbox//status").is_err());
        assert!(device_from_status_topic("fbox/a/status/extra").is_err());
    }

    #[test]
    fn test_command_encoding() {
        let at = DateTime::from_timestamp(1_718_000_000, 0).unwrap();

        let json: Value = serde_json::from_slice(&Command::Dispense.encode(at).unwrap()).unwrap();
        assert_eq!(json["cmd"], "DISPENSE");
        assert_eq!(json["timestamp"], 1_718_000_000);

        let json: Value =
            serde_json::from_slice(&Command::SetStock { stock: 12 }.encode(at).unwrap()).unwrap();
        assert_eq!(json["cmd"], "SET_STOCK");
        assert_eq!(json["stock"], 12);

        assert_eq!(Command::ClearError.to_string(), "CLEAR_ERROR");
    }

    #[test]
    fn test_parse_dispense_events() {
        let msg = parse("fbox/FBOX-0001/status", r#"{"event":"dispense_complete","stock":7}"#).unwrap();
        assert_eq!(msg.device_id, "FBOX-0001");
        assert_eq!(msg.kind(), EventKind::DispenseComplete);
        assert_eq!(
            msg.event.dispense_outcome(),
            Some(DispenseOutcome::Confirmed { reported_stock: Some(7) })
        );

        let msg = parse("fbox/FBOX-0001/status", r#"{"event":"dispense_failed","reason":"no_stock"}"#).unwrap();
        assert_eq!(
            msg.event.dispense_outcome(),
            Some(DispenseOutcome::Failed { reason: DispenseFailure::NoStock })
        );
    }

    #[test]
    fn test_device_uuid_overrides_topic() {
        let msg = parse(
            "fbox/FBOX-UPPER-105/status",
            r#"{"event":"heartbeat","deviceUUID":"FBOX-A1B2","stock":3,"wifiRssi":-60,"locked":false,"doorState":"closed"}"#,
        )
        .unwrap();
        assert_eq!(msg.device_id, "FBOX-A1B2");
        match msg.event {
            DeviceEvent::Heartbeat { stock, wifi_rssi, door_state, .. } => {
                assert_eq!(stock, Some(3));
                assert_eq!(wifi_rssi, Some(-60));
                assert_eq!(door_state.as_deref(), Some("closed"));
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn test_boot_complete_fields() {
        let msg = parse(
            "fbox/FBOX-0001/status",
            r#"{"event":"boot_complete","macAddress":"AA:BB","category":"top","size":"L","stock":20,"firmwareVersion":"1.4.2"}"#,
        )
        .unwrap();
        assert_eq!(
            msg.event,
            DeviceEvent::BootComplete {
                mac_address: Some("AA:BB".into()),
                category: Some("top".into()),
                size: Some("L".into()),
                stock: Some(20),
                firmware_version: Some("1.4.2".into()),
                ip_address: None,
            }
        );
    }

    #[test]
    fn test_unknown_event_is_not_fatal() {
        let msg = parse("fbox/FBOX-0001/status", r#"{"event":"firmware_update","version":"2"}"#).unwrap();
        assert_eq!(msg.kind(), EventKind::Unknown);
        assert_eq!(msg.label, "firmware_update");
    }

    #[test]
    fn test_rejects_malformed() {
        assert!(parse("fbox/FBOX-0001/status", "not json").unwrap_err().is_protocol_error());
        assert!(parse("fbox/FBOX-0001/status", r#"{"stock":1}"#).unwrap_err().is_protocol_error());
        assert!(parse("other/FBOX-0001/status", r#"{"event":"heartbeat"}"#).is_err());
    }

    #[test]
    fn test_stock_extraction() {
        assert_eq!(DeviceEvent::StockEmpty.stock(), Some(0));
        assert_eq!(DeviceEvent::DoorOpened.stock(), None);
        assert_eq!(
            DeviceEvent::StockUpdated { stock: Some(9), source: None, needs_verification: false }.stock(),
            Some(9)
        );
    }
}
