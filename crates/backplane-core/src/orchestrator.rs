//! # Orchestrator Lifecycle and Administrative Surface
//!
//! The composition root. An [`Orchestrator`] is process-scoped state with an
//! explicit `initialize`/`shutdown` lifecycle rather than an implicit
//! singleton, so independent instances can coexist and each test builds its
//! own.
//!
//! `initialize` consumes a finalized boot description (descriptors, live
//! adapter instances, start-active flags), registers everything, installs
//! exactly one active binding per populated capability, and starts the
//! health monitor (plus the failover policy when enabled). The
//! administrative control surface (migration requests, cancellation,
//! forced activation, health overrides and status reports) lives here.

use crate::events::{BackplaneEvent, EventBus};
use crate::facade::ServiceFacade;
use crate::failover::FailoverPolicy;
use crate::health::HealthMonitor;
use crate::migration::{MigrationJob, MigrationManager};
use crate::registry::CapabilityRegistry;
use crate::traits::AdapterInstance;
use crate::types::{
    Capability, CapabilityStatus, HealthStatus, MigrationOptions, OrchestratorConfig,
    ProviderDescriptor,
};
use crate::{BackplaneError, BackplaneResult};
use log::{info, warn};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedReceiver;

/// One provider entry in the boot configuration.
pub struct ProviderRegistration {
    pub descriptor: ProviderDescriptor,
    pub instance: AdapterInstance,
    /// Serve traffic for the capability from startup. Exactly one
    /// registration per populated capability must set this.
    pub start_active: bool,
}

impl ProviderRegistration {
    pub fn new(descriptor: ProviderDescriptor, instance: AdapterInstance) -> Self {
        Self {
            descriptor,
            instance,
            start_active: false,
        }
    }

    pub fn active(mut self) -> Self {
        self.start_active = true;
        self
    }
}

/// Finalized, validated boot description the core consumes. Producing this
/// (file parsing, credential resolution) is the configuration manager's
/// job, outside the core.
pub struct BootConfig {
    pub providers: Vec<ProviderRegistration>,
}

impl BootConfig {
    pub fn new(providers: Vec<ProviderRegistration>) -> Self {
        Self { providers }
    }
}

/// A running orchestration core.
pub struct Orchestrator {
    config: OrchestratorConfig,
    registry: Arc<CapabilityRegistry>,
    events: EventBus,
    monitor: HealthMonitor,
    failover: Option<FailoverPolicy>,
    migrations: MigrationManager,
    facade: Arc<ServiceFacade>,
}

impl Orchestrator {
    /// Build and start an orchestrator from a finalized boot description.
    ///
    /// # Errors
    /// `Config` when a descriptor disagrees with its adapter's capability,
    /// a provider id collides, or a populated capability does not have
    /// exactly one `start_active` registration. Nothing is left running on
    /// error.
    pub async fn initialize(
        config: OrchestratorConfig,
        boot: BootConfig,
    ) -> BackplaneResult<Self> {
        let registry = Arc::new(CapabilityRegistry::new());
        let events = EventBus::new();

        let mut start_active: HashMap<Capability, Vec<String>> = HashMap::new();
        for registration in boot.providers {
            let capability = registration.descriptor.capability;
            let provider_id = registration.descriptor.provider_id.clone();
            registry
                .register(registration.descriptor, registration.instance)
                .await?;
            if registration.start_active {
                start_active.entry(capability).or_default().push(provider_id);
            }
        }

        for capability in registry.capabilities().await {
            match start_active.get(&capability).map(Vec::as_slice) {
                Some([provider_id]) => {
                    // Fresh handles are Unknown, never Unhealthy, so the
                    // non-forced path cannot reject the boot binding.
                    registry.set_active(capability, provider_id, false).await?;
                }
                Some(many) => {
                    return Err(BackplaneError::Config(format!(
                        "capability '{}' has {} start-active providers; exactly one required",
                        capability,
                        many.len()
                    )));
                }
                None => {
                    return Err(BackplaneError::Config(format!(
                        "capability '{}' has no start-active provider",
                        capability
                    )));
                }
            }
        }

        let monitor = HealthMonitor::new(registry.clone(), events.clone(), config.health.clone());
        monitor.start();

        let failover = if config.auto_failover {
            let policy = FailoverPolicy::new(registry.clone(), events.clone());
            policy.start();
            Some(policy)
        } else {
            None
        };

        let migrations =
            MigrationManager::new(registry.clone(), events.clone(), config.migration.clone());
        let facade = Arc::new(ServiceFacade::new(
            registry.clone(),
            events.clone(),
            config.clone(),
        ));

        info!(
            "Orchestrator initialized with capabilities {:?}",
            registry.capabilities().await
        );
        Ok(Self {
            config,
            registry,
            events,
            monitor,
            failover,
            migrations,
            facade,
        })
    }

    /// Stop background work: the failover policy, the health monitor, and
    /// any in-flight migrations (cancelled, then awaited within the
    /// configured grace period).
    pub async fn shutdown(&self) {
        if let Some(failover) = &self.failover {
            failover.stop();
        }
        self.monitor.stop();
        self.migrations.shutdown().await;
        info!("Orchestrator shut down");
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// The unified operation surface.
    pub fn facade(&self) -> &Arc<ServiceFacade> {
        &self.facade
    }

    pub fn registry(&self) -> &Arc<CapabilityRegistry> {
        &self.registry
    }

    pub fn monitor(&self) -> &HealthMonitor {
        &self.monitor
    }

    /// Subscribe to health, migration and operation events.
    pub fn subscribe(&self) -> UnboundedReceiver<BackplaneEvent> {
        self.events.subscribe()
    }

    /// Full event history, oldest first.
    pub fn history(&self) -> Vec<BackplaneEvent> {
        self.events.history()
    }

    /// Register an additional provider at runtime. The handle starts
    /// `Unknown` until its first probe; it does not become active.
    pub async fn register_provider(
        &self,
        descriptor: ProviderDescriptor,
        instance: AdapterInstance,
    ) -> BackplaneResult<()> {
        self.registry.register(descriptor, instance).await?;
        Ok(())
    }

    /// Start a migration of `capability` to `target_id`.
    pub async fn request_migration(
        &self,
        capability: Capability,
        target_id: &str,
        options: MigrationOptions,
    ) -> BackplaneResult<Arc<MigrationJob>> {
        self.migrations
            .request_migration(capability, target_id, options)
            .await
    }

    /// Cancel the in-flight migration for `capability`.
    pub async fn cancel_migration(&self, capability: Capability) -> BackplaneResult<()> {
        self.migrations.cancel_migration(capability).await
    }

    /// Administrative override: activate a provider regardless of health.
    pub async fn force_activate(
        &self,
        capability: Capability,
        provider_id: &str,
    ) -> BackplaneResult<()> {
        warn!(
            "Administrative override: forcing '{}' active for capability '{}'",
            provider_id, capability
        );
        self.registry.set_active(capability, provider_id, true).await
    }

    /// Harness hook: pin (or clear) a provider's effective health status.
    /// Emits the resulting health transition like a probe would.
    pub async fn force_health(
        &self,
        capability: Capability,
        provider_id: &str,
        status: Option<HealthStatus>,
    ) -> BackplaneResult<()> {
        if let Some(transition) = self
            .registry
            .force_health(capability, provider_id, status)
            .await?
        {
            self.events.emit(transition.into_event());
        }
        Ok(())
    }

    /// Status of one capability: active binding, all handles with health,
    /// and the most recent migration job.
    pub async fn get_status(&self, capability: Capability) -> BackplaneResult<CapabilityStatus> {
        let mut status = self.registry.status(capability).await?;
        status.migration = self.migrations.snapshot(capability).await;
        Ok(status)
    }

    /// Status of every populated capability.
    pub async fn status_all(&self) -> Vec<CapabilityStatus> {
        let mut statuses = Vec::new();
        for capability in self.registry.capabilities().await {
            if let Ok(status) = self.get_status(capability).await {
                statuses.push(status);
            }
        }
        statuses
    }
}
