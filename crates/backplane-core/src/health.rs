//! # Health Monitor
//!
//! Periodically probes every registered provider handle and applies the
//! transition rule through the registry's probe bookkeeping. Probes for one
//! cycle run fully in parallel and never block facade traffic.
//!
//! The monitor is deliberately side-effect-free with respect to routing: on
//! a transition it emits a [`HealthEvent`] (flagged when the condemned
//! provider held the active binding) but never swaps bindings itself;
//! failover is a separate policy reacting to the event stream. That keeps
//! the monitor trivially testable in isolation: drive [`HealthMonitor::
//! probe_cycle`] directly and observe events.
//!
//! Failure semantics: a probe timeout counts as a failure; adapter errors
//! are caught and counted, never propagated.

use crate::events::EventBus;
use crate::registry::{CapabilityRegistry, ProviderHandle};
use crate::types::HealthConfig;
use log::{debug, info, warn};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio::time::sleep;

/// Background prober for every handle in a registry.
pub struct HealthMonitor {
    registry: Arc<CapabilityRegistry>,
    events: EventBus,
    config: HealthConfig,
    is_running: Arc<AtomicBool>,
    task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl HealthMonitor {
    pub fn new(registry: Arc<CapabilityRegistry>, events: EventBus, config: HealthConfig) -> Self {
        Self {
            registry,
            events,
            config,
            is_running: Arc::new(AtomicBool::new(false)),
            task: std::sync::Mutex::new(None),
        }
    }

    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::SeqCst)
    }

    /// Start the periodic probe loop. Idempotent; a second start while
    /// running is a no-op.
    pub fn start(&self) {
        if self.is_running.swap(true, Ordering::SeqCst) {
            debug!("Health monitor already running");
            return;
        }

        let registry = self.registry.clone();
        let events = self.events.clone();
        let config = self.config.clone();
        let is_running = self.is_running.clone();

        let handle = tokio::spawn(async move {
            info!(
                "Health monitor started (interval {:?}, probe timeout {:?})",
                config.probe_interval, config.probe_timeout
            );
            loop {
                if !is_running.load(Ordering::SeqCst) {
                    break;
                }
                run_probe_cycle(&registry, &events, &config).await;
                sleep(config.probe_interval).await;
            }
            debug!("Health monitor loop exited");
        });
        *self.task.lock().unwrap() = Some(handle);
    }

    /// Stop the probe loop. Any in-flight cycle is cut short.
    pub fn stop(&self) {
        if !self.is_running.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(handle) = self.task.lock().unwrap().take() {
            handle.abort();
        }
        info!("Health monitor stopped");
    }

    /// Run one probe cycle synchronously. Public so tests and operators can
    /// drive health deterministically without the timer.
    pub async fn probe_cycle(&self) {
        run_probe_cycle(&self.registry, &self.events, &self.config).await;
    }
}

impl Drop for HealthMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn run_probe_cycle(registry: &CapabilityRegistry, events: &EventBus, config: &HealthConfig) {
    let mut handles: Vec<ProviderHandle> = Vec::new();
    for capability in registry.capabilities().await {
        handles.extend(registry.providers(capability).await);
    }
    // Pinned handles keep their override until it is cleared.
    handles.retain(|handle| !handle.is_overridden());
    if handles.is_empty() {
        return;
    }

    let probes = handles
        .iter()
        .map(|handle| probe_handle(handle, config.probe_timeout));
    let outcomes = futures::future::join_all(probes).await;

    for (handle, outcome) in handles.iter().zip(outcomes) {
        match registry
            .record_probe(
                handle.capability(),
                handle.provider_id(),
                outcome,
                config.unhealthy_after,
            )
            .await
        {
            Ok(Some(transition)) => {
                if transition.active
                    && transition.current == crate::types::HealthStatus::Unhealthy
                {
                    warn!(
                        "Active provider '{}' for capability '{}' is unhealthy",
                        transition.provider_id, transition.capability
                    );
                }
                events.emit(transition.into_event());
            }
            Ok(None) => {}
            Err(e) => {
                // The handle disappeared mid-cycle (concurrent shutdown).
                debug!(
                    "Dropping probe result for '{}'/'{}': {}",
                    handle.capability(),
                    handle.provider_id(),
                    e
                );
            }
        }
    }
}

async fn probe_handle(handle: &ProviderHandle, timeout: Duration) -> Result<Duration, String> {
    let provider = handle.provider();
    let started = Instant::now();
    match tokio::time::timeout(timeout, provider.probe()).await {
        Ok(Ok(())) => Ok(started.elapsed()),
        Ok(Err(e)) => Err(e.to_string()),
        Err(_) => Err(format!("probe timed out after {:?}", timeout)),
    }
}
