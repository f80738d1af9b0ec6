//! # fbox-link: Device Link for the F-BOX Rental Engine
//!
//! Connects the server to its dispensers through an MQTT broker, turns a
//! dispense command into an awaitable answer, and applies status events to
//! the ledger off the network loop.
//!
//! ## Architecture Overview
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Device Link Architecture                        │
//! │                                                                         │
//! │  fbox-rental ──► Dispenser::dispense_and_wait(device, timeout)          │
//! │                      │                                                  │
//! │  ┌───────────────────▼──────────────┐                                   │
//! │  │        DispenseCorrelator        │◄───────────── resolve() ──────┐  │
//! │  │ per-device lock, waiter, timeout │                               │  │
//! │  └───────────────────┬──────────────┘                               │  │
//! │                      │ CommandPublisher::publish                    │  │
//! │  ┌───────────────────▼──────────────┐      ┌────────────────────────┴┐ │
//! │  │            Transport             │ mpsc │     DispatchWorker      │ │
//! │  │  rumqttc event loop + backoff    │─────►│  EventKind → handlers   │ │
//! │  │  fbox/{id}/cmd  ▲ fbox/+/status  │      │  device_state, dispense │ │
//! │  └─────────────────┼────────────────┘      │  audit                  │ │
//! │                    │                       └─────────────────────────┘ │
//! │               MQTT broker ◄──► dispensers                               │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Organization
//! - [`config`] - Server configuration (broker, database, rental timing)
//! - [`error`] - Link error types
//! - [`protocol`] - Command and status message types, topics
//! - [`transport`] - MQTT client with reconnection
//! - [`correlator`] - Dispense request/response correlation
//! - [`dispatch`] - Typed event routing and the dispatch worker
//!
//! ## Usage
//!
//! ```rust,ignore
//! let config = FboxConfig::load_or_default(None);
//! let (transport, status_rx) = Transport::spawn(TransportConfig::from_settings(&config.broker)?);
//!
//! let correlator = Arc::new(DispenseCorrelator::new(Arc::new(transport.clone())));
//! let table = DispatchTable::with_default_handlers(db.clone(), correlator.clone(), 5);
//! DispatchWorker::spawn(table, status_rx);
//!
//! let outcome = correlator.dispense_and_wait("FBOX-0001", Duration::from_secs(10)).await;
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod config;
pub mod correlator;
pub mod dispatch;
pub mod error;
pub mod protocol;
pub mod transport;

// =============================================================================
// Re-exports
// =============================================================================

pub use config::{BrokerSettings, DatabaseSettings, FboxConfig, RentalSettings};
pub use correlator::{DispenseCorrelator, Dispenser};
pub use dispatch::{
    AuditHandler, DeviceStateHandler, DispatchTable, DispatchWorker, DispenseHandler, EventHandler,
};
pub use error::{LinkError, LinkResult};
pub use protocol::{Command, DeviceEvent, EventKind, StatusMessage};
pub use transport::{CommandPublisher, ConnectionState, Transport, TransportConfig, TransportHandle};
