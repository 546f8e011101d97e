//! Integration suite for the backplane orchestration core
//!
//! Every test builds its own [`Orchestrator`] over in-memory adapters from
//! `backplane-mem`, scripts failures through the adapters' fault
//! switchboards, and observes behavior through the facade, the event
//! stream and `get_status`.

use anyhow::Result;
use backplane_core::{
    AdapterInstance, BackplaneEvent, BootConfig, Capability, MigrationJob, MigrationState,
    Orchestrator, OrchestratorConfig, ProviderDescriptor, ProviderRegistration,
};
use backplane_mem::{MemAuth, MemDatabase, MemFunctions, MemObjectStore, MemRealtime};
use std::sync::Arc;
use std::time::Duration;

pub mod cutover_concurrency_test;
pub mod events_test;
pub mod facade_policy_test;
pub mod migration_test;

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Config with timings tightened for tests: fast retries, short timeouts,
/// small copy pages so multi-page code paths are exercised.
pub fn quick_config() -> OrchestratorConfig {
    let mut config = OrchestratorConfig::new();
    config.health.probe_interval = Duration::from_secs(30);
    config.health.probe_timeout = Duration::from_millis(200);
    config.retry.base_delay = Duration::from_millis(10);
    config.retry.max_delay = Duration::from_millis(40);
    config.breaker.cooldown = Duration::from_millis(150);
    config.migration.copy_batch_size = 4;
    config.migration.copy_unit_timeout = Duration::from_secs(2);
    config.migration.cancel_grace = Duration::from_millis(500);
    config.operation_timeout = Duration::from_secs(2);
    config
}

/// Two database providers: "alpha" boots active, "beta" stands by. The
/// adapter clones share state with the registered instances, so tests can
/// seed data and script faults after initialization.
pub struct DatabasePair {
    pub orchestrator: Orchestrator,
    pub alpha: MemDatabase,
    pub beta: MemDatabase,
}

pub async fn database_pair(config: OrchestratorConfig) -> Result<DatabasePair> {
    init_logging();
    let alpha = MemDatabase::new();
    let beta = MemDatabase::new();
    let boot = BootConfig::new(vec![
        ProviderRegistration::new(
            ProviderDescriptor::new("alpha", Capability::Database).with_priority(10),
            AdapterInstance::database(alpha.clone()),
        )
        .active(),
        ProviderRegistration::new(
            ProviderDescriptor::new("beta", Capability::Database).with_priority(5),
            AdapterInstance::database(beta.clone()),
        ),
    ]);
    let orchestrator = Orchestrator::initialize(config, boot).await?;
    log::info!("test harness: database pair ready (alpha active, beta standby)");
    Ok(DatabasePair {
        orchestrator,
        alpha,
        beta,
    })
}

/// One provider per capability, all active from boot.
pub struct FullStack {
    pub orchestrator: Orchestrator,
    pub db: MemDatabase,
    pub auth: MemAuth,
    pub store: MemObjectStore,
    pub hub: MemRealtime,
    pub funcs: MemFunctions,
}

pub async fn full_stack(config: OrchestratorConfig) -> Result<FullStack> {
    init_logging();
    let db = MemDatabase::new();
    let auth = MemAuth::new();
    let store = MemObjectStore::new();
    let hub = MemRealtime::new();
    let funcs = MemFunctions::new();
    let boot = BootConfig::new(vec![
        ProviderRegistration::new(
            ProviderDescriptor::new("db-main", Capability::Database),
            AdapterInstance::database(db.clone()),
        )
        .active(),
        ProviderRegistration::new(
            ProviderDescriptor::new("auth-main", Capability::Auth),
            AdapterInstance::auth(auth.clone()),
        )
        .active(),
        ProviderRegistration::new(
            ProviderDescriptor::new("store-main", Capability::Storage),
            AdapterInstance::storage(store.clone()),
        )
        .active(),
        ProviderRegistration::new(
            ProviderDescriptor::new("rt-main", Capability::Realtime),
            AdapterInstance::realtime(hub.clone()),
        )
        .active(),
        ProviderRegistration::new(
            ProviderDescriptor::new("fn-main", Capability::EdgeFunctions),
            AdapterInstance::edge_functions(funcs.clone()),
        )
        .active(),
    ]);
    let orchestrator = Orchestrator::initialize(config, boot).await?;
    log::info!("test harness: full stack ready (one provider per capability)");
    Ok(FullStack {
        orchestrator,
        db,
        auth,
        store,
        hub,
        funcs,
    })
}

/// Poll a migration job until it reaches a terminal state.
pub async fn wait_for_terminal(job: &Arc<MigrationJob>) -> MigrationState {
    for _ in 0..500 {
        if job.is_terminal() {
            return job.state();
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!(
        "migration job {} still in state {} after 5s",
        job.id(),
        job.state()
    );
}

/// Poll until a capability's active binding is `provider_id`.
pub async fn wait_for_active(
    orchestrator: &Orchestrator,
    capability: Capability,
    provider_id: &str,
) {
    for _ in 0..500 {
        if let Ok(status) = orchestrator.get_status(capability).await {
            if status.active.as_deref() == Some(provider_id) {
                return;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!(
        "capability '{}' never activated provider '{}'",
        capability, provider_id
    );
}

/// Migration state sequence for one capability, in emission order.
pub fn migration_states(events: &[BackplaneEvent], capability: Capability) -> Vec<MigrationState> {
    events
        .iter()
        .filter_map(|event| match event {
            BackplaneEvent::Migration(e) if e.capability == capability => Some(e.state),
            _ => None,
        })
        .collect()
}
