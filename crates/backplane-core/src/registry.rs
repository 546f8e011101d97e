//! # Capability Registry
//!
//! Owns every provider handle and the per-capability active binding. All
//! shared mutable state in the orchestrator funnels through here under a
//! single-writer discipline:
//!
//! - **Health state** is written only via [`CapabilityRegistry::record_probe`]
//!   (driven by the health monitor) and the harness override hook.
//! - **Active bindings** are written only via the locked activation path
//!   ([`CapabilityRegistry::set_active`]), used by migration cutover, the
//!   failover policy and the administrative override.
//! - The facade only reads, resolving the active handle on a shared lock.
//!
//! Activation writes for one capability serialize on that capability's swap
//! mutex, so a health-triggered failover and a manual activation cannot
//! interleave; the registry never exposes a capability with more than one
//! active handle, and a swap installs the replacement in the same critical
//! section that retires the old binding.

use crate::events::{BackplaneEvent, HealthEvent};
use crate::traits::{AdapterInstance, ProviderAdapter};
use crate::types::{
    Capability, CapabilityStatus, HealthStatus, ProviderDescriptor, ProviderHealth, ProviderStatus,
};
use crate::{BackplaneError, BackplaneResult};
use log::{debug, info, warn};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::{Mutex, RwLock};

#[derive(Debug, Clone)]
struct HealthState {
    status: HealthStatus,
    last_checked_at: Option<SystemTime>,
    consecutive_failures: u32,
    latency_sample: Option<Duration>,
    override_status: Option<HealthStatus>,
}

impl HealthState {
    fn new() -> Self {
        Self {
            status: HealthStatus::Unknown,
            last_checked_at: None,
            consecutive_failures: 0,
            latency_sample: None,
            override_status: None,
        }
    }

    fn effective(&self) -> HealthStatus {
        self.override_status.unwrap_or(self.status)
    }

    fn snapshot(&self) -> ProviderHealth {
        ProviderHealth {
            status: self.effective(),
            last_checked_at: self.last_checked_at,
            consecutive_failures: self.consecutive_failures,
            latency_sample: self.latency_sample,
            overridden: self.override_status.is_some(),
        }
    }
}

/// Runtime binding of a descriptor to its live adapter plus health state.
///
/// Cheap to clone; clones share the adapter and health state. The handle is
/// owned by the registry; adapters never mutate their own handle.
#[derive(Clone)]
pub struct ProviderHandle {
    descriptor: Arc<ProviderDescriptor>,
    instance: AdapterInstance,
    health: Arc<std::sync::RwLock<HealthState>>,
}

impl ProviderHandle {
    fn new(descriptor: ProviderDescriptor, instance: AdapterInstance) -> Self {
        Self {
            descriptor: Arc::new(descriptor),
            instance,
            health: Arc::new(std::sync::RwLock::new(HealthState::new())),
        }
    }

    pub fn provider_id(&self) -> &str {
        &self.descriptor.provider_id
    }

    pub fn capability(&self) -> Capability {
        self.descriptor.capability
    }

    pub fn descriptor(&self) -> &ProviderDescriptor {
        &self.descriptor
    }

    pub fn instance(&self) -> &AdapterInstance {
        &self.instance
    }

    /// Control-plane view of the adapter for probing and migration.
    pub fn provider(&self) -> Arc<dyn ProviderAdapter> {
        self.instance.provider()
    }

    pub fn health(&self) -> ProviderHealth {
        self.health.read().unwrap().snapshot()
    }

    /// Status with any override applied: the value routing decisions see.
    pub fn effective_status(&self) -> HealthStatus {
        self.health.read().unwrap().effective()
    }

    pub fn is_overridden(&self) -> bool {
        self.health.read().unwrap().override_status.is_some()
    }
}

impl std::fmt::Debug for ProviderHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderHandle")
            .field("provider_id", &self.descriptor.provider_id)
            .field("capability", &self.descriptor.capability)
            .field("status", &self.effective_status())
            .finish()
    }
}

/// A health status change produced by probe bookkeeping, ready to be turned
/// into a [`HealthEvent`] by the caller.
#[derive(Debug, Clone)]
pub struct HealthTransition {
    pub capability: Capability,
    pub provider_id: String,
    pub previous: HealthStatus,
    pub current: HealthStatus,
    pub consecutive_failures: u32,
    pub latency: Option<Duration>,
    /// Whether the provider held the active binding at transition time.
    pub active: bool,
}

impl HealthTransition {
    pub fn into_event(self) -> BackplaneEvent {
        BackplaneEvent::Health(HealthEvent {
            capability: self.capability,
            provider_id: self.provider_id,
            previous: self.previous,
            current: self.current,
            consecutive_failures: self.consecutive_failures,
            latency: self.latency,
            active: self.active,
            at: SystemTime::now(),
        })
    }
}

struct CapabilitySlot {
    handles: HashMap<String, ProviderHandle>,
    active: Option<String>,
    swap_lock: Arc<Mutex<()>>,
}

impl CapabilitySlot {
    fn new() -> Self {
        Self {
            handles: HashMap::new(),
            active: None,
            swap_lock: Arc::new(Mutex::new(())),
        }
    }
}

/// Registry of provider handles per capability with at most one active
/// binding each.
pub struct CapabilityRegistry {
    slots: RwLock<HashMap<Capability, CapabilitySlot>>,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self {
            slots: RwLock::new(HashMap::new()),
        }
    }

    /// Register an adapter under its descriptor. The new handle starts
    /// `Unknown` until its first probe and does not become active by itself.
    pub async fn register(
        &self,
        descriptor: ProviderDescriptor,
        instance: AdapterInstance,
    ) -> BackplaneResult<ProviderHandle> {
        if descriptor.capability != instance.capability() {
            return Err(BackplaneError::Config(format!(
                "descriptor '{}' declares capability '{}' but the adapter serves '{}'",
                descriptor.provider_id,
                descriptor.capability,
                instance.capability()
            )));
        }

        let mut slots = self.slots.write().await;
        let slot = slots
            .entry(descriptor.capability)
            .or_insert_with(CapabilitySlot::new);
        if slot.handles.contains_key(&descriptor.provider_id) {
            return Err(BackplaneError::Config(format!(
                "provider '{}' is already registered for capability '{}'",
                descriptor.provider_id, descriptor.capability
            )));
        }

        let handle = ProviderHandle::new(descriptor, instance);
        info!(
            "Registered provider '{}' for capability '{}'",
            handle.provider_id(),
            handle.capability()
        );
        slot.handles
            .insert(handle.provider_id().to_string(), handle.clone());
        Ok(handle)
    }

    /// Resolve the active handle for a capability (the facade's fast path).
    pub async fn active(&self, capability: Capability) -> BackplaneResult<ProviderHandle> {
        let slots = self.slots.read().await;
        let slot = slots
            .get(&capability)
            .ok_or_else(|| no_providers(capability))?;
        let active_id = slot
            .active
            .as_ref()
            .ok_or_else(|| BackplaneError::NotFound(format!(
                "no active provider for capability '{}'",
                capability
            )))?;
        slot.handles
            .get(active_id)
            .cloned()
            .ok_or_else(|| BackplaneError::NotFound(format!(
                "active provider '{}' is not registered for capability '{}'",
                active_id, capability
            )))
    }

    /// All handles for a capability, highest priority first, ties by id.
    pub async fn providers(&self, capability: Capability) -> Vec<ProviderHandle> {
        let slots = self.slots.read().await;
        let mut handles: Vec<ProviderHandle> = slots
            .get(&capability)
            .map(|slot| slot.handles.values().cloned().collect())
            .unwrap_or_default();
        handles.sort_by(|a, b| {
            b.descriptor()
                .priority
                .cmp(&a.descriptor().priority)
                .then_with(|| a.provider_id().cmp(b.provider_id()))
        });
        handles
    }

    /// Look up one handle by id.
    pub async fn handle(
        &self,
        capability: Capability,
        provider_id: &str,
    ) -> BackplaneResult<ProviderHandle> {
        let slots = self.slots.read().await;
        slots
            .get(&capability)
            .and_then(|slot| slot.handles.get(provider_id))
            .cloned()
            .ok_or_else(|| {
                BackplaneError::NotFound(format!(
                    "provider '{}' is not registered for capability '{}'",
                    provider_id, capability
                ))
            })
    }

    /// Capabilities with at least one registered provider.
    pub async fn capabilities(&self) -> Vec<Capability> {
        let slots = self.slots.read().await;
        let mut capabilities: Vec<Capability> = slots.keys().copied().collect();
        capabilities.sort();
        capabilities
    }

    /// Swap the active binding to `provider_id`.
    ///
    /// Serialized per capability on the swap mutex; the target's effective
    /// health is validated inside the critical section, so a cutover that
    /// raced a condemnation fails instead of activating a dead provider.
    /// `force` bypasses the health check and is reserved for the
    /// administrative override; no automated path passes it.
    pub async fn set_active(
        &self,
        capability: Capability,
        provider_id: &str,
        force: bool,
    ) -> BackplaneResult<()> {
        let swap_lock = {
            let slots = self.slots.read().await;
            let slot = slots
                .get(&capability)
                .ok_or_else(|| no_providers(capability))?;
            slot.swap_lock.clone()
        };
        let _guard = swap_lock.lock().await;

        let mut slots = self.slots.write().await;
        let slot = slots
            .get_mut(&capability)
            .ok_or_else(|| no_providers(capability))?;
        let handle = slot.handles.get(provider_id).ok_or_else(|| {
            BackplaneError::NotFound(format!(
                "provider '{}' is not registered for capability '{}'",
                provider_id, capability
            ))
        })?;

        let status = handle.effective_status();
        if status == HealthStatus::Unhealthy && !force {
            return Err(BackplaneError::Unhealthy(provider_id.to_string()));
        }
        if force && status == HealthStatus::Unhealthy {
            warn!(
                "Forcing activation of unhealthy provider '{}' for capability '{}'",
                provider_id, capability
            );
        }

        let previous = slot.active.replace(provider_id.to_string());
        info!(
            "Capability '{}' active binding: {} -> {}",
            capability,
            previous.as_deref().unwrap_or("<none>"),
            provider_id
        );
        Ok(())
    }

    /// Apply one probe outcome to a handle's health state and return the
    /// transition, if the effective status changed.
    ///
    /// This is the only write path for probed health: any success restores
    /// `Healthy` immediately, the first failure demotes to `Degraded`, and
    /// `unhealthy_after` consecutive failures condemn to `Unhealthy`. Fast
    /// recovery, slow condemnation.
    pub async fn record_probe(
        &self,
        capability: Capability,
        provider_id: &str,
        outcome: Result<Duration, String>,
        unhealthy_after: u32,
    ) -> BackplaneResult<Option<HealthTransition>> {
        let (handle, active) = {
            let slots = self.slots.read().await;
            let slot = slots
                .get(&capability)
                .ok_or_else(|| no_providers(capability))?;
            let handle = slot.handles.get(provider_id).cloned().ok_or_else(|| {
                BackplaneError::NotFound(format!(
                    "provider '{}' is not registered for capability '{}'",
                    provider_id, capability
                ))
            })?;
            let active = slot.active.as_deref() == Some(provider_id);
            (handle, active)
        };

        let mut health = handle.health.write().unwrap();
        let previous = health.effective();
        health.last_checked_at = Some(SystemTime::now());
        match outcome {
            Ok(latency) => {
                health.consecutive_failures = 0;
                health.latency_sample = Some(latency);
                health.status = HealthStatus::Healthy;
            }
            Err(reason) => {
                health.consecutive_failures = health.consecutive_failures.saturating_add(1);
                health.latency_sample = None;
                health.status = if health.consecutive_failures >= unhealthy_after {
                    HealthStatus::Unhealthy
                } else {
                    HealthStatus::Degraded
                };
                debug!(
                    "Probe failure {} for '{}'/'{}': {}",
                    health.consecutive_failures, capability, provider_id, reason
                );
            }
        }
        let current = health.effective();
        let consecutive_failures = health.consecutive_failures;
        let latency = health.latency_sample;
        drop(health);

        if previous == current {
            return Ok(None);
        }
        Ok(Some(HealthTransition {
            capability,
            provider_id: provider_id.to_string(),
            previous,
            current,
            consecutive_failures,
            latency,
            active,
        }))
    }

    /// Pin (or clear) a handle's effective status. Probing skips pinned
    /// handles until the override is cleared. Returns the transition when
    /// the effective status changed, so the caller can emit an event.
    pub async fn force_health(
        &self,
        capability: Capability,
        provider_id: &str,
        status: Option<HealthStatus>,
    ) -> BackplaneResult<Option<HealthTransition>> {
        let (handle, active) = {
            let slots = self.slots.read().await;
            let slot = slots
                .get(&capability)
                .ok_or_else(|| no_providers(capability))?;
            let handle = slot.handles.get(provider_id).cloned().ok_or_else(|| {
                BackplaneError::NotFound(format!(
                    "provider '{}' is not registered for capability '{}'",
                    provider_id, capability
                ))
            })?;
            let active = slot.active.as_deref() == Some(provider_id);
            (handle, active)
        };

        let mut health = handle.health.write().unwrap();
        let previous = health.effective();
        health.override_status = status;
        let current = health.effective();
        let consecutive_failures = health.consecutive_failures;
        let latency = health.latency_sample;
        drop(health);

        if previous == current {
            return Ok(None);
        }
        Ok(Some(HealthTransition {
            capability,
            provider_id: provider_id.to_string(),
            previous,
            current,
            consecutive_failures,
            latency,
            active,
        }))
    }

    /// Status report for one capability (without migration information; the
    /// orchestrator merges that in).
    pub async fn status(&self, capability: Capability) -> BackplaneResult<CapabilityStatus> {
        let active = {
            let slots = self.slots.read().await;
            let slot = slots
                .get(&capability)
                .ok_or_else(|| no_providers(capability))?;
            slot.active.clone()
        };
        let providers = self
            .providers(capability)
            .await
            .into_iter()
            .map(|handle| ProviderStatus {
                provider_id: handle.provider_id().to_string(),
                priority: handle.descriptor().priority,
                active: active.as_deref() == Some(handle.provider_id()),
                health: handle.health(),
            })
            .collect();
        Ok(CapabilityStatus {
            capability,
            active,
            providers,
            migration: None,
        })
    }
}

impl Default for CapabilityRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn no_providers(capability: Capability) -> BackplaneError {
    BackplaneError::NotFound(format!(
        "no providers registered for capability '{}'",
        capability
    ))
}
