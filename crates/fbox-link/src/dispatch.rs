//! # Event Dispatch
//!
//! Routes parsed status messages to handlers through an explicit table,
//! on a worker task separate from the transport's I/O loop.
//!
//! ## Routing
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  Transport I/O loop ──► mpsc ──► DispatchWorker ──► DispatchTable      │
//! │                                                                         │
//! │  EventKind            handlers (in order)                              │
//! │  ───────────────────  ─────────────────────────────────────────        │
//! │  boot_complete        device_state, audit                              │
//! │  heartbeat, status    device_state                                     │
//! │  dispense_complete    dispense (stock write → resolve), audit          │
//! │  dispense_failed      dispense (resolve), audit                        │
//! │  door_*, stock_*      device_state, audit                              │
//! │  error, home_failed   audit                                            │
//! │  *_reconnected        device_state / audit                             │
//! │  unknown              audit                                            │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! A handler error is logged and does not stop the remaining handlers.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::correlator::DispenseCorrelator;
use crate::error::LinkResult;
use crate::protocol::{DeviceEvent, EventKind, StatusMessage};
use fbox_core::events::stock_alert_at;
use fbox_core::{Category, DoorState};
use fbox_db::{BootAnnouncement, Database, HeartbeatReport, NewEvent};

// =============================================================================
// Handler Trait
// =============================================================================

/// Reacts to one status message.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, msg: &StatusMessage) -> LinkResult<()>;

    /// Name for logging.
    fn name(&self) -> &'static str;
}

// =============================================================================
// Dispatch Table
// =============================================================================

/// Explicit `EventKind → [handler]` routing.
#[derive(Default)]
pub struct DispatchTable {
    routes: HashMap<EventKind, Vec<Arc<dyn EventHandler>>>,
}

impl DispatchTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Routes each of `kinds` to `handler`, after any handler already routed.
    pub fn route(&mut self, kinds: &[EventKind], handler: Arc<dyn EventHandler>) -> &mut Self {
        for kind in kinds {
            self.routes.entry(*kind).or_default().push(handler.clone());
        }
        self
    }

    pub fn handlers_for(&self, kind: EventKind) -> &[Arc<dyn EventHandler>] {
        self.routes.get(&kind).map(Vec::as_slice).unwrap_or(&[])
    }

    /// The production table: device state, dispense resolution, audit.
    pub fn with_default_handlers(
        db: Database,
        correlator: Arc<DispenseCorrelator>,
        stock_low_threshold: i64,
    ) -> Self {
        let device_state: Arc<dyn EventHandler> = Arc::new(DeviceStateHandler::new(db.clone()));
        let dispense: Arc<dyn EventHandler> = Arc::new(DispenseHandler::new(db.clone(), correlator));
        let audit: Arc<dyn EventHandler> = Arc::new(AuditHandler::new(db, stock_low_threshold));

        let mut table = DispatchTable::new();
        table
            .route(
                &[
                    EventKind::BootComplete,
                    EventKind::Heartbeat,
                    EventKind::Status,
                    EventKind::DoorOpened,
                    EventKind::DoorClosed,
                    EventKind::StockUpdated,
                    EventKind::StockLow,
                    EventKind::StockEmpty,
                    EventKind::WifiReconnected,
                ],
                device_state,
            )
            .route(&[EventKind::DispenseComplete, EventKind::DispenseFailed], dispense)
            .route(
                &[
                    EventKind::BootComplete,
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
                ],
                audit,
            );
        table
    }

    /// Runs every handler routed for the message's kind. Returns how many ran.
    pub async fn dispatch(&self, msg: &StatusMessage) -> usize {
        let handlers = self.handlers_for(msg.kind());
        if handlers.is_empty() {
            debug!(device_id = %msg.device_id, event = %msg.label, "No handler routed");
        }

        for handler in handlers {
            if let Err(e) = handler.handle(msg).await {
                error!(
                    handler = handler.name(),
                    device_id = %msg.device_id,
                    event = %msg.label,
                    error = %e,
                    "Handler failed"
                );
            }
        }
        handlers.len()
    }
}

// =============================================================================
// Worker
// =============================================================================

/// Drains the transport's status channel and dispatches in arrival order.
pub struct DispatchWorker;

impl DispatchWorker {
    /// Spawns the worker. It exits when every sender is dropped.
    pub fn spawn(table: DispatchTable, mut rx: mpsc::Receiver<StatusMessage>) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!("Dispatch worker started");
            while let Some(msg) = rx.recv().await {
                table.dispatch(&msg).await;
            }
            info!("Dispatch worker stopped");
        })
    }
}

// =============================================================================
// Device State Handler
// =============================================================================

/// Mirrors reported device state into the ledger's device table.
pub struct DeviceStateHandler {
    db: Database,
}

impl DeviceStateHandler {
    pub fn new(db: Database) -> Self {
        DeviceStateHandler { db }
    }
}

#[async_trait]
impl EventHandler for DeviceStateHandler {
    async fn handle(&self, msg: &StatusMessage) -> LinkResult<()> {
        let devices = self.db.devices();
        let device_id = msg.device_id.as_str();

        match &msg.event {
            DeviceEvent::BootComplete {
                mac_address,
                category,
                size,
                stock,
                firmware_version,
                ip_address,
            } => {
                let device = devices
                    .register(&BootAnnouncement {
                        device_id: device_id.to_string(),
                        mac_address: mac_address.clone(),
                        category: category.as_deref().map(Category::from_label),
                        size: size.clone().filter(|s| !s.is_empty()),
                        stock: *stock,
                        firmware_version: firmware_version.clone(),
                        ip_address: ip_address.clone(),
                    })
                    .await?;
                debug!(device_id, product_id = ?device.product_id, "Boot announcement applied");
            }
            DeviceEvent::Heartbeat {
                stock,
                door_state,
                locked,
                wifi_rssi,
                ip_address,
            } => {
                devices
                    .record_heartbeat(&HeartbeatReport {
                        device_id: device_id.to_string(),
                        stock: *stock,
                        door_state: door_state.as_deref().and_then(DoorState::from_label),
                        locked: *locked,
                        wifi_rssi: *wifi_rssi,
                        ip_address: ip_address.clone(),
                    })
                    .await?;
            }
            DeviceEvent::Status {
                stock,
                door_state,
                locked,
                wifi_rssi,
                ..
            } => {
                devices
                    .update_status(&HeartbeatReport {
                        device_id: device_id.to_string(),
                        stock: *stock,
                        door_state: door_state.as_deref().and_then(DoorState::from_label),
                        locked: *locked,
                        wifi_rssi: *wifi_rssi,
                        ip_address: None,
                    })
                    .await?;
            }
            DeviceEvent::DoorOpened => {
                devices.set_door_state(device_id, DoorState::Open).await?;
            }
            DeviceEvent::DoorClosed { stock, .. } => {
                devices.set_door_state(device_id, DoorState::Closed).await?;
                if let Some(stock) = stock {
                    devices.set_stock(device_id, *stock).await?;
                }
            }
            DeviceEvent::StockUpdated { needs_verification, source, .. } => {
                if *needs_verification {
                    warn!(device_id, source = ?source, "Stock count needs manual verification");
                }
                if let Some(stock) = msg.event.stock() {
                    devices.set_stock(device_id, stock).await?;
                }
            }
            DeviceEvent::StockLow { .. } | DeviceEvent::StockEmpty => {
                if let Some(stock) = msg.event.stock() {
                    devices.set_stock(device_id, stock).await?;
                }
            }
            DeviceEvent::WifiReconnected { ip_address } => {
                devices
                    .update_status(&HeartbeatReport {
                        device_id: device_id.to_string(),
                        ip_address: ip_address.clone(),
                        ..Default::default()
                    })
                    .await?;
            }
            _ => {}
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "device_state"
    }
}

// =============================================================================
// Dispense Handler
// =============================================================================

/// Writes post-dispense stock, then wakes the waiting rental.
pub struct DispenseHandler {
    db: Database,
    correlator: Arc<DispenseCorrelator>,
}

impl DispenseHandler {
    pub fn new(db: Database, correlator: Arc<DispenseCorrelator>) -> Self {
        DispenseHandler { db, correlator }
    }
}

#[async_trait]
impl EventHandler for DispenseHandler {
    async fn handle(&self, msg: &StatusMessage) -> LinkResult<()> {
        let Some(outcome) = msg.event.dispense_outcome() else {
            return Ok(());
        };

        // Stock is absolute, so a duplicated completion rewrites the same value.
        let stock_write = match msg.event.stock() {
            Some(stock) if outcome.is_confirmed() => {
                self.db.devices().set_stock(&msg.device_id, stock).await
            }
            _ => Ok(()),
        };

        if !self.correlator.resolve(&msg.device_id, outcome) {
            debug!(device_id = %msg.device_id, event = %msg.label, "Dispense answer had no waiter");
        }

        stock_write?;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "dispense"
    }
}

// =============================================================================
// Audit Handler
// =============================================================================

/// Classifies device events and appends them to the event log.
pub struct AuditHandler {
    db: Database,
    stock_low_threshold: i64,
}

impl AuditHandler {
    pub fn new(db: Database, stock_low_threshold: i64) -> Self {
        AuditHandler {
            db,
            stock_low_threshold,
        }
    }
}

#[async_trait]
impl EventHandler for AuditHandler {
    async fn handle(&self, msg: &StatusMessage) -> LinkResult<()> {
        let events = self.db.events();

        let kind = msg.kind();
        let label = match kind.business_event() {
            Some(event) => event.as_str(),
            None if kind == EventKind::Unknown => {
                warn!(device_id = %msg.device_id, event = %msg.label, "Unknown device event");
                msg.label.as_str()
            }
            None => kind.as_str(),
        };

        let entry = NewEvent::new(label)
            .device(&msg.device_id)
            .details(msg.payload.clone());
        events.record(&entry).await?;

        if let DeviceEvent::DispenseComplete { stock: Some(stock) } = &msg.event {
            if let Some(alert) = stock_alert_at(*stock, self.stock_low_threshold) {
                warn!(device_id = %msg.device_id, stock, alert = %alert, "Stock alert");
                events
                    .record(
                        &NewEvent::business(alert)
                            .device(&msg.device_id)
                            .details(serde_json::json!({ "stock": stock })),
                    )
                    .await?;
            }
        }

        Ok(())
    }

    fn name(&self) -> &'static str {
        "audit"
    }
}
