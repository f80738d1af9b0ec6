//! # Dispense Correlator
//!
//! Pairs a `DISPENSE` command with the `dispense_complete` or
//! `dispense_failed` event that answers it.
//!
//! ## One Unit
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  dispense_and_wait(device, timeout)                                     │
//! │                                                                         │
//! │    acquire per-device lock (FIFO)                                      │
//! │    register waiter {token, oneshot}   ◄── before publishing            │
//! │    publish DISPENSE ──► NotConnected? ──► transport_unavailable        │
//! │                    └──► rejected?     ──► send_failed                  │
//! │    wait ─┬─ resolve(device, Confirmed{stock})  ──► confirmed           │
//! │          ├─ resolve(device, Failed{reason})    ──► reason              │
//! │          └─ timeout elapses                    ──► timeout             │
//! │    guard drops: remove waiter if it is still ours                      │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Only one waiter per device exists at a time. Callers targeting the same
//! device queue on the device lock instead of replacing each other's waiter.
//! An answer arriving after its waiter timed out finds no entry and is dropped.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::error::{LinkError, LinkResult};
use crate::protocol::Command;
use crate::transport::CommandPublisher;
use fbox_core::{DispenseFailure, DispenseOutcome};

// =============================================================================
// Dispenser
// =============================================================================

/// Asks hardware to release units and reports what happened.
///
/// The orchestrator depends on this trait, not on the correlator, so tests
/// can script device behaviour.
#[async_trait]
pub trait Dispenser: Send + Sync {
    /// Dispenses one unit and waits for its confirmation. Never errors:
    /// every failure is a [`DispenseOutcome::Failed`] reason.
    async fn dispense_and_wait(&self, device_id: &str, timeout: Duration) -> DispenseOutcome;

    /// Fire-and-forget administrative command.
    async fn send_command(&self, device_id: &str, command: &Command) -> LinkResult<()>;
}

// =============================================================================
// Correlator
// =============================================================================

struct Waiter {
    token: u64,
    tx: oneshot::Sender<DispenseOutcome>,
}

type PendingMap = Mutex<HashMap<String, Waiter>>;

/// Correlates dispense commands with device answers.
pub struct DispenseCorrelator {
    publisher: Arc<dyn CommandPublisher>,
    pending: PendingMap,
    device_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    next_token: AtomicU64,
}

impl DispenseCorrelator {
    pub fn new(publisher: Arc<dyn CommandPublisher>) -> Self {
        DispenseCorrelator {
            publisher,
            pending: Mutex::new(HashMap::new()),
            device_locks: Mutex::new(HashMap::new()),
            next_token: AtomicU64::new(1),
        }
    }

    /// Delivers an answer to the device's waiter.
    ///
    /// Returns false when nobody is waiting (late, duplicate, or unsolicited).
    pub fn resolve(&self, device_id: &str, outcome: DispenseOutcome) -> bool {
        let waiter = lock(&self.pending).remove(device_id);

        match waiter {
            Some(waiter) => {
                let delivered = waiter.tx.send(outcome).is_ok();
                debug!(device_id = %device_id, token = waiter.token, delivered, "Waiter resolved");
                delivered
            }
            None => {
                debug!(device_id = %device_id, ?outcome, "No waiter for dispense answer, dropped");
                false
            }
        }
    }

    /// Number of outstanding waiters.
    pub fn pending_count(&self) -> usize {
        lock(&self.pending).len()
    }

    /// Fails every outstanding waiter with `transport_unavailable`.
    pub fn cancel_all(&self) {
        let drained: Vec<_> = lock(&self.pending).drain().collect();
        for (device_id, waiter) in drained {
            let _ = waiter.tx.send(DispenseOutcome::Failed {
                reason: DispenseFailure::TransportUnavailable,
            });
            info!(device_id = %device_id, "Pending dispense cancelled");
        }
    }

    fn device_lock(&self, device_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        lock(&self.device_locks)
            .entry(device_id.to_string())
            .or_default()
            .clone()
    }

    fn register(&self, device_id: &str) -> (PendingGuard<'_>, oneshot::Receiver<DispenseOutcome>) {
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();

        if lock(&self.pending)
            .insert(device_id.to_string(), Waiter { token, tx })
            .is_some()
        {
            // Only possible if a caller bypassed the device lock.
            warn!(device_id = %device_id, "Replaced an outstanding waiter");
        }

        let guard = PendingGuard {
            pending: &self.pending,
            device_id: device_id.to_string(),
            token,
        };
        (guard, rx)
    }
}

#[async_trait]
impl Dispenser for DispenseCorrelator {
    async fn dispense_and_wait(&self, device_id: &str, timeout: Duration) -> DispenseOutcome {
        let device_lock = self.device_lock(device_id);
        let _serial = device_lock.lock().await;

        let (_guard, rx) = self.register(device_id);

        if let Err(err) = self.publisher.publish(device_id, &Command::Dispense).await {
            let reason = publish_failure(&err);
            warn!(device_id = %device_id, error = %err, reason = %reason, "Dispense command not sent");
            return DispenseOutcome::Failed { reason };
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => DispenseOutcome::Failed {
                reason: DispenseFailure::TransportUnavailable,
            },
            Err(_) => {
                warn!(device_id = %device_id, timeout_ms = timeout.as_millis() as u64, "Dispense timed out");
                DispenseOutcome::Failed {
                    reason: DispenseFailure::Timeout,
                }
            }
        }
    }

    async fn send_command(&self, device_id: &str, command: &Command) -> LinkResult<()> {
        self.publisher.publish(device_id, command).await?;
        info!(device_id = %device_id, cmd = %command, "Command sent");
        Ok(())
    }
}

fn publish_failure(err: &LinkError) -> DispenseFailure {
    match err {
        LinkError::NotConnected
        | LinkError::Disconnected
        | LinkError::ConnectionFailed(_)
        | LinkError::ShuttingDown => DispenseFailure::TransportUnavailable,
        _ => DispenseFailure::SendFailed,
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Removes its own waiter on drop, whatever the exit path.
struct PendingGuard<'a> {
    pending: &'a PendingMap,
    device_id: String,
    token: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        let mut pending = lock(self.pending);
        if pending.get(&self.device_id).map(|w| w.token) == Some(self.token) {
            pending.remove(&self.device_id);
        }
    }
}
