//! Event emission and subscription
//!
//! Health, migration and operation notifications are explicit messages: an
//! append-only log plus a subscriber list, rather than a callback web. One
//! lock covers both, so subscribers registered before an emission observe
//! events in emission order and the log is a faithful history. Delivery is
//! at-least-once per registered subscriber; there is no replay for late
//! subscribers (they read `history` instead).

use crate::types::{Capability, HealthStatus, MigrationState};
use serde::Serialize;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};

/// Emitted on every health status transition of a provider handle.
#[derive(Debug, Clone, Serialize)]
pub struct HealthEvent {
    pub capability: Capability,
    pub provider_id: String,
    pub previous: HealthStatus,
    pub current: HealthStatus,
    pub consecutive_failures: u32,
    pub latency: Option<Duration>,
    /// Whether the provider held the active binding when it transitioned.
    pub active: bool,
    pub at: SystemTime,
}

/// Emitted on every migration job state entry.
#[derive(Debug, Clone, Serialize)]
pub struct MigrationEvent {
    pub job_id: u64,
    pub capability: Capability,
    pub source_id: String,
    pub target_id: String,
    pub state: MigrationState,
    pub items_copied: u64,
    pub items_verified: u64,
    pub reason: Option<String>,
    pub at: SystemTime,
}

/// Emitted by the facade for every operation attempt chain, success or
/// failure.
#[derive(Debug, Clone, Serialize)]
pub struct OperationEvent {
    pub capability: Capability,
    pub provider_id: String,
    pub operation: &'static str,
    pub latency: Duration,
    pub outcome: OperationOutcome,
    pub at: SystemTime,
}

#[derive(Debug, Clone, Serialize)]
pub enum OperationOutcome {
    Success,
    /// Carries the error-kind label, never provider-specific content.
    Failure(String),
}

/// Envelope delivered to subscribers and retained in the log.
#[derive(Debug, Clone, Serialize)]
pub enum BackplaneEvent {
    Health(HealthEvent),
    Migration(MigrationEvent),
    Operation(OperationEvent),
}

impl BackplaneEvent {
    pub fn capability(&self) -> Capability {
        match self {
            BackplaneEvent::Health(e) => e.capability,
            BackplaneEvent::Migration(e) => e.capability,
            BackplaneEvent::Operation(e) => e.capability,
        }
    }
}

struct BusInner {
    subscribers: Vec<UnboundedSender<BackplaneEvent>>,
    log: Vec<BackplaneEvent>,
}

/// Shared event bus. Cheap to clone; all clones feed the same log and
/// subscriber list.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<Mutex<BusInner>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(BusInner {
                subscribers: Vec::new(),
                log: Vec::new(),
            })),
        }
    }

    /// Register a subscriber. Events emitted after this call are delivered
    /// in order; dropping the receiver unsubscribes on the next emission.
    pub fn subscribe(&self) -> UnboundedReceiver<BackplaneEvent> {
        let (tx, rx) = unbounded_channel();
        let mut inner = self.inner.lock().unwrap();
        inner.subscribers.push(tx);
        rx
    }

    /// Append to the log and fan out to live subscribers.
    pub fn emit(&self, event: BackplaneEvent) {
        let mut inner = self.inner.lock().unwrap();
        inner.log.push(event.clone());
        inner.subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// Full emission history, oldest first.
    pub fn history(&self) -> Vec<BackplaneEvent> {
        let inner = self.inner.lock().unwrap();
        inner.log.clone()
    }

    /// Emission history restricted to one capability.
    pub fn history_for(&self, capability: Capability) -> Vec<BackplaneEvent> {
        self.history()
            .into_iter()
            .filter(|e| e.capability() == capability)
            .collect()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
