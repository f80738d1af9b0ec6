//! # MQTT Transport
//!
//! Broker client with automatic reconnection and backoff.
//!
//! ## Connection Lifecycle
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      Broker Connection States                           │
//! │                                                                         │
//! │  ┌────────────┐    spawn()      ┌────────────┐                         │
//! │  │Disconnected│ ──────────────► │ Connecting │                         │
//! │  └────────────┘                 └─────┬──────┘                         │
//! │        ▲                              │                                 │
//! │        │                    ConnAck   │   poll error                    │
//! │        │                        ┌─────┴─────┐                          │
//! │        │                        ▼           ▼                           │
//! │        │              ┌────────────┐  ┌────────────┐                   │
//! │        │              │ Connected  │  │ Backoff    │                   │
//! │        │              │ subscribe  │  └─────┬──────┘                   │
//! │        │              │ fbox/+/st. │        │ timer expired             │
//! │        │              └─────┬──────┘        ▼                           │
//! │        │                    │         ┌────────────┐                   │
//! │        └── shutdown ────────┴──────── │Reconnecting│                   │
//! │                                       └────────────┘                    │
//! │                                                                         │
//! │  BACKOFF: 500ms, 1s, 2s, ... capped at 60s                             │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The I/O loop only parses status publishes and forwards them; it never runs
//! event handlers itself. When the forward channel is full the event is
//! dropped with a warning rather than stalling delivery.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use chrono::Utc;
use rumqttc::{AsyncClient, ConnectReturnCode, Event, EventLoop, MqttOptions, Packet, QoS};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, error, info, warn};

use crate::config::BrokerSettings;
use crate::error::{LinkError, LinkResult};
use crate::protocol::{command_topic, Command, StatusMessage, STATUS_TOPIC_FILTER};

// =============================================================================
// Transport State
// =============================================================================

/// Connection state for the broker transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Not connected.
    Disconnected,
    /// Attempting to connect.
    Connecting,
    /// Connected and subscribed.
    Connected,
    /// Waiting before reconnection attempt.
    Backoff,
    /// Reconnection in progress.
    Reconnecting,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Backoff => write!(f, "backoff"),
            ConnectionState::Reconnecting => write!(f, "reconnecting"),
        }
    }
}

// =============================================================================
// Transport Configuration
// =============================================================================

/// Configuration for the broker transport.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub keep_alive: Duration,
    pub credentials: Option<(String, String)>,

    /// Initial backoff duration.
    pub initial_backoff: Duration,

    /// Maximum backoff duration.
    pub max_backoff: Duration,

    /// Capacity of the client request queue and of the forward channel.
    pub channel_capacity: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        TransportConfig {
            host: "localhost".to_string(),
            port: 1883,
            client_id: "fbox-server".to_string(),
            keep_alive: Duration::from_secs(60),
            credentials: None,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(60),
            channel_capacity: 256,
        }
    }
}

impl TransportConfig {
    /// Builds a transport config from the `[broker]` section.
    pub fn from_settings(settings: &BrokerSettings) -> LinkResult<Self> {
        let (host, port) = settings.host_port()?;

        let credentials = match (&settings.username, &settings.password) {
            (Some(user), pass) => Some((user.clone(), pass.clone().unwrap_or_default())),
            (None, _) => None,
        };

        Ok(TransportConfig {
            host,
            port,
            client_id: settings.client_id.clone(),
            keep_alive: Duration::from_secs(settings.keep_alive_secs),
            credentials,
            initial_backoff: Duration::from_millis(settings.initial_backoff_ms),
            max_backoff: Duration::from_secs(settings.max_backoff_secs),
            ..Default::default()
        })
    }

    fn mqtt_options(&self) -> MqttOptions {
        let mut options = MqttOptions::new(&self.client_id, &self.host, self.port);
        options.set_keep_alive(self.keep_alive);
        options.set_clean_session(true);
        if let Some((user, pass)) = &self.credentials {
            options.set_credentials(user, pass);
        }
        options
    }
}

// =============================================================================
// Command Publisher
// =============================================================================

/// Anything that can deliver a command to a dispenser.
///
/// Implemented by [`TransportHandle`]; tests substitute a recorder.
#[async_trait]
pub trait CommandPublisher: Send + Sync {
    /// Publishes `command` to the device's command topic.
    ///
    /// Fails with [`LinkError::NotConnected`] when the broker link is down.
    async fn publish(&self, device_id: &str, command: &Command) -> LinkResult<()>;
}

// =============================================================================
// Transport Handle
// =============================================================================

/// Handle for interacting with the transport from other components.
#[derive(Clone)]
pub struct TransportHandle {
    client: AsyncClient,

    /// Current connection state.
    state: Arc<RwLock<ConnectionState>>,

    /// Shutdown signal.
    shutdown_tx: mpsc::Sender<()>,
}

impl TransportHandle {
    /// Returns the current connection state.
    pub async fn state(&self) -> ConnectionState {
        *self.state.read().await
    }

    /// Returns true if currently connected.
    pub async fn is_connected(&self) -> bool {
        *self.state.read().await == ConnectionState::Connected
    }

    /// Triggers graceful shutdown.
    pub async fn shutdown(&self) -> LinkResult<()> {
        self.shutdown_tx
            .send(())
            .await
            .map_err(|_| LinkError::ChannelError("Failed to send shutdown signal".into()))
    }
}

#[async_trait]
impl CommandPublisher for TransportHandle {
    async fn publish(&self, device_id: &str, command: &Command) -> LinkResult<()> {
        if !self.is_connected().await {
            return Err(LinkError::NotConnected);
        }

        let payload = command.encode(Utc::now())?;
        self.client
            .publish(command_topic(device_id), QoS::AtLeastOnce, false, payload)
            .await?;

        debug!(device_id = %device_id, cmd = %command, "Command published");
        Ok(())
    }
}

// =============================================================================
// MQTT Transport
// =============================================================================

/// Broker transport with automatic reconnection.
///
/// ## Usage
/// ```rust,ignore
/// let config = TransportConfig::from_settings(&fbox_config.broker)?;
/// let (handle, mut status_rx) = Transport::spawn(config);
///
/// handle.publish("FBOX-0001", &Command::Status).await?;
///
/// while let Some(msg) = status_rx.recv().await {
///     println!("{} from {}", msg.kind(), msg.device_id);
/// }
/// ```
pub struct Transport {
    config: TransportConfig,
    client: AsyncClient,
    eventloop: EventLoop,
    state: Arc<RwLock<ConnectionState>>,
    incoming_tx: mpsc::Sender<StatusMessage>,
    shutdown_rx: mpsc::Receiver<()>,
}

impl Transport {
    /// Creates the client and spawns its event loop task.
    ///
    /// Returns a handle for publishing and a receiver of parsed status messages.
    pub fn spawn(config: TransportConfig) -> (TransportHandle, mpsc::Receiver<StatusMessage>) {
        let (client, eventloop) = AsyncClient::new(config.mqtt_options(), config.channel_capacity);
        let (incoming_tx, incoming_rx) = mpsc::channel::<StatusMessage>(config.channel_capacity);
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>(1);
        let state = Arc::new(RwLock::new(ConnectionState::Disconnected));

        let transport = Transport {
            config,
            client: client.clone(),
            eventloop,
            state: state.clone(),
            incoming_tx,
            shutdown_rx,
        };

        tokio::spawn(transport.run());

        let handle = TransportHandle {
            client,
            state,
            shutdown_tx,
        };

        (handle, incoming_rx)
    }

    /// Main transport loop.
    async fn run(mut self) {
        info!(host = %self.config.host, port = self.config.port, "Transport starting");

        let mut backoff = self.create_backoff();
        *self.state.write().await = ConnectionState::Connecting;

        loop {
            tokio::select! {
                polled = self.eventloop.poll() => match polled {
                    Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                        if ack.code == ConnectReturnCode::Success {
                            self.on_connected().await;
                            backoff.reset();
                        } else {
                            warn!(code = ?ack.code, "Broker refused connection");
                        }
                    }
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        self.forward(&publish.topic, &publish.payload);
                    }
                    Ok(Event::Incoming(Packet::Disconnect)) => {
                        warn!("Broker sent disconnect");
                        *self.state.write().await = ConnectionState::Reconnecting;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        error!(error = %e, "Broker connection lost");
                        *self.state.write().await = ConnectionState::Backoff;

                        let Some(duration) = backoff.next_backoff() else {
                            error!("Backoff exhausted");
                            break;
                        };
                        debug!(?duration, "Waiting before reconnect");

                        tokio::select! {
                            _ = tokio::time::sleep(duration) => {
                                *self.state.write().await = ConnectionState::Reconnecting;
                            }
                            _ = self.shutdown_rx.recv() => {
                                info!("Shutdown during backoff");
                                break;
                            }
                        }
                    }
                },

                _ = self.shutdown_rx.recv() => {
                    info!("Shutdown signal received, disconnecting");
                    if let Err(e) = self.client.try_disconnect() {
                        debug!(error = %e, "Disconnect request not queued");
                    }
                    break;
                }
            }
        }

        *self.state.write().await = ConnectionState::Disconnected;
        info!("Transport stopped");
    }

    /// Marks the link up and (re)subscribes to every status topic.
    async fn on_connected(&mut self) {
        info!("Broker connected");
        *self.state.write().await = ConnectionState::Connected;

        // The request queue is drained by this same loop, so never await here.
        if let Err(e) = self.client.try_subscribe(STATUS_TOPIC_FILTER, QoS::AtMostOnce) {
            error!(error = %e, "Failed to queue status subscription");
        } else {
            debug!(filter = STATUS_TOPIC_FILTER, "Subscribed");
        }
    }

    /// Parses a publish and hands it to the dispatch worker.
    fn forward(&self, topic: &str, payload: &[u8]) {
        let msg = match StatusMessage::parse(topic, payload, Utc::now()) {
            Ok(msg) => msg,
            Err(e) => {
                warn!(topic = %topic, error = %e, "Dropping unparseable status message");
                return;
            }
        };

        debug!(device_id = %msg.device_id, event = %msg.label, "Status received");

        match self.incoming_tx.try_send(msg) {
            Ok(()) => {}
            Err(TrySendError::Full(msg)) => {
                warn!(device_id = %msg.device_id, event = %msg.label, "Dispatch queue full, event dropped");
            }
            Err(TrySendError::Closed(_)) => {
                debug!("Dispatch receiver dropped");
            }
        }
    }

    /// Creates the exponential backoff configuration.
    fn create_backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff {
            initial_interval: self.config.initial_backoff,
            max_interval: self.config.max_backoff,
            multiplier: 2.0,
            max_elapsed_time: None,
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_state_display() {
        assert_eq!(ConnectionState::Connected.to_string(), "connected");
        assert_eq!(ConnectionState::Backoff.to_string(), "backoff");
    }

    #[test]
    fn test_transport_config_default() {
        let config = TransportConfig::default();
        assert_eq!(config.port, 1883);
        assert_eq!(config.initial_backoff, Duration::from_millis(500));
        assert!(config.credentials.is_none());
    }

    #[test]
    fn test_config_from_settings() {
        let settings = BrokerSettings {
            url: "mqtt://broker.gym.local:1884".into(),
            username: Some("fbox".into()),
            ..Default::default()
        };
        let config = TransportConfig::from_settings(&settings).unwrap();
        assert_eq!(config.host, "broker.gym.local");
        assert_eq!(config.port, 1884);
        assert_eq!(config.credentials, Some(("fbox".into(), String::new())));
        assert_eq!(config.max_backoff, Duration::from_secs(60));
    }

    #[tokio::test]
    async fn test_publish_refused_while_disconnected() {
        // Nothing listens on this port; the loop stays in backoff.
        let config = TransportConfig {
            host: "127.0.0.1".into(),
            port: 1,
            ..Default::default()
        };
        let (handle, _rx) = Transport::spawn(config);

        let err = handle.publish("FBOX-0001", &Command::Dispense).await.unwrap_err();
        assert!(matches!(err, LinkError::NotConnected));
        assert!(!handle.is_connected().await);

        handle.shutdown().await.unwrap();
    }
}
