//! Automatic failover policy
//!
//! The health monitor condemns providers but never touches routing. This
//! optional policy closes that loop: it watches the event stream, and when
//! the *active* provider of a capability transitions to `Unhealthy` it
//! promotes the best standby (effective status `Healthy`, then highest
//! priority, then lexical id for determinism) through the ordinary
//! non-forced activation path. It never passes `force` and never writes
//! health state, so the registry's ownership rules hold unchanged. With no
//! eligible standby it logs and waits for the next transition.

use crate::events::{BackplaneEvent, EventBus};
use crate::registry::CapabilityRegistry;
use crate::types::{Capability, HealthStatus};
use log::{debug, info, warn};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::task::JoinHandle;

/// Event-driven standby promotion for condemned active providers.
pub struct FailoverPolicy {
    registry: Arc<CapabilityRegistry>,
    events: EventBus,
    is_running: Arc<AtomicBool>,
    task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl FailoverPolicy {
    pub fn new(registry: Arc<CapabilityRegistry>, events: EventBus) -> Self {
        Self {
            registry,
            events,
            is_running: Arc::new(AtomicBool::new(false)),
            task: std::sync::Mutex::new(None),
        }
    }

    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::SeqCst)
    }

    /// Subscribe to the bus and start reacting. Idempotent.
    pub fn start(&self) {
        if self.is_running.swap(true, Ordering::SeqCst) {
            return;
        }
        let registry = self.registry.clone();
        let mut rx = self.events.subscribe();
        let is_running = self.is_running.clone();

        let handle = tokio::spawn(async move {
            info!("Failover policy started");
            while let Some(event) = rx.recv().await {
                if !is_running.load(Ordering::SeqCst) {
                    break;
                }
                let BackplaneEvent::Health(health) = event else {
                    continue;
                };
                if !health.active || health.current != HealthStatus::Unhealthy {
                    continue;
                }
                promote_standby(&registry, health.capability, &health.provider_id).await;
            }
            debug!("Failover policy loop exited");
        });
        *self.task.lock().unwrap() = Some(handle);
    }

    pub fn stop(&self) {
        if !self.is_running.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(handle) = self.task.lock().unwrap().take() {
            handle.abort();
        }
        info!("Failover policy stopped");
    }
}

impl Drop for FailoverPolicy {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn promote_standby(
    registry: &CapabilityRegistry,
    capability: Capability,
    condemned_id: &str,
) {
    let candidates = registry.providers(capability).await;
    let standby = candidates.iter().find(|handle| {
        handle.provider_id() != condemned_id
            && handle.effective_status() == HealthStatus::Healthy
    });

    let Some(standby) = standby else {
        warn!(
            "Active provider '{}' for capability '{}' is unhealthy and no healthy standby exists",
            condemned_id, capability
        );
        return;
    };

    match registry
        .set_active(capability, standby.provider_id(), false)
        .await
    {
        Ok(()) => info!(
            "Failover: capability '{}' promoted '{}' over unhealthy '{}'",
            capability,
            standby.provider_id(),
            condemned_id
        ),
        // Lost a race with a migration cutover or the standby was condemned
        // in between; the next transition retriggers us.
        Err(e) => warn!(
            "Failover for capability '{}' could not activate '{}': {}",
            capability,
            standby.provider_id(),
            e
        ),
    }
}
