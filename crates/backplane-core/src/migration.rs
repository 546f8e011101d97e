//! # Migration Manager
//!
//! Executes controlled cutover of a capability from its active provider to
//! a candidate provider: bulk copy, integrity verification, and an atomic
//! activation swap, with rollback on failure.
//!
//! ## State machine
//!
//! `Planned -> Copying -> Verifying -> CuttingOver -> Completed`, with
//! `Failed` reachable from the three middle states and `RolledBack` from
//! `Failed` when rollback was requested. Every state entry emits a
//! [`MigrationEvent`] carrying the progress counters.
//!
//! Traffic moves only in `CuttingOver`: the registry re-validates the
//! target's health and swaps the binding inside one critical section under
//! the capability's swap lock. A failure anywhere earlier leaves the active
//! binding untouched, so rollback is data cleanup on the inactive target,
//! never a traffic operation.
//!
//! ## Copy pipeline
//!
//! Export pages stream from the source in stable key order while import
//! units run concurrently against the target, bounded by the configured
//! copy concurrency. Each unit (a page export or import) is retried up to
//! the configured limit under its own timeout before the job fails.
//!
//! ## Concurrency invariant
//!
//! At most one non-terminal job exists per capability; a second request
//! while one is in flight fails with `MigrationInProgress` and does not
//! disturb the first. Jobs are cancellable; cancellation is observed
//! between copy units and phases, so termination is eventual rather than
//! instantaneous.

use crate::events::{BackplaneEvent, EventBus, MigrationEvent};
use crate::registry::CapabilityRegistry;
use crate::traits::ProviderAdapter;
use crate::types::{
    Capability, ChecksumSpec, HealthStatus, MigrationConfig, MigrationOptions, MigrationSnapshot,
    MigrationState,
};
use crate::{BackplaneError, BackplaneResult};
use log::{debug, error, info, warn};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, SystemTime};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::sleep;

/// One in-flight (or finished) cutover.
pub struct MigrationJob {
    id: u64,
    capability: Capability,
    source_id: String,
    target_id: String,
    options: MigrationOptions,
    state: std::sync::RwLock<MigrationState>,
    items_copied: AtomicU64,
    items_verified: AtomicU64,
    cancel: AtomicBool,
    failure: std::sync::RwLock<Option<String>>,
}

impl MigrationJob {
    fn new(
        id: u64,
        capability: Capability,
        source_id: String,
        target_id: String,
        options: MigrationOptions,
    ) -> Self {
        Self {
            id,
            capability,
            source_id,
            target_id,
            options,
            state: std::sync::RwLock::new(MigrationState::Planned),
            items_copied: AtomicU64::new(0),
            items_verified: AtomicU64::new(0),
            cancel: AtomicBool::new(false),
            failure: std::sync::RwLock::new(None),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn capability(&self) -> Capability {
        self.capability
    }

    pub fn source_id(&self) -> &str {
        &self.source_id
    }

    pub fn target_id(&self) -> &str {
        &self.target_id
    }

    pub fn options(&self) -> MigrationOptions {
        self.options
    }

    pub fn state(&self) -> MigrationState {
        *self.state.read().unwrap()
    }

    pub fn is_terminal(&self) -> bool {
        self.state().is_terminal()
    }

    pub fn items_copied(&self) -> u64 {
        self.items_copied.load(Ordering::SeqCst)
    }

    pub fn items_verified(&self) -> u64 {
        self.items_verified.load(Ordering::SeqCst)
    }

    pub fn failure(&self) -> Option<String> {
        self.failure.read().unwrap().clone()
    }

    pub fn cancel_requested(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    fn request_cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    fn set_failure(&self, reason: String) {
        *self.failure.write().unwrap() = Some(reason);
    }

    pub fn snapshot(&self) -> MigrationSnapshot {
        MigrationSnapshot {
            job_id: self.id,
            capability: self.capability,
            source_id: self.source_id.clone(),
            target_id: self.target_id.clone(),
            state: self.state(),
            items_copied: self.items_copied(),
            items_verified: self.items_verified(),
            failure: self.failure(),
        }
    }
}

impl std::fmt::Debug for MigrationJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MigrationJob")
            .field("id", &self.id)
            .field("capability", &self.capability)
            .field("source_id", &self.source_id)
            .field("target_id", &self.target_id)
            .field("state", &self.state())
            .finish()
    }
}

/// Coordinates migration jobs against a registry, one per capability.
pub struct MigrationManager {
    registry: Arc<CapabilityRegistry>,
    events: EventBus,
    config: MigrationConfig,
    jobs: tokio::sync::RwLock<HashMap<Capability, Arc<MigrationJob>>>,
    tasks: std::sync::Mutex<HashMap<u64, JoinHandle<()>>>,
    next_job_id: AtomicU64,
}

impl MigrationManager {
    pub fn new(
        registry: Arc<CapabilityRegistry>,
        events: EventBus,
        config: MigrationConfig,
    ) -> Self {
        Self {
            registry,
            events,
            config,
            jobs: tokio::sync::RwLock::new(HashMap::new()),
            tasks: std::sync::Mutex::new(HashMap::new()),
            next_job_id: AtomicU64::new(0),
        }
    }

    /// Start a cutover of `capability` to `target_id`.
    ///
    /// Fails fast, before any data moves, with `NotFound` (unknown
    /// target, or no active source), `Config` (target already active),
    /// `TargetUnavailable` (target condemned) or `MigrationInProgress`
    /// (mutual exclusion). On success the job runs in the background; the
    /// returned handle tracks its progress.
    pub async fn request_migration(
        &self,
        capability: Capability,
        target_id: &str,
        options: MigrationOptions,
    ) -> BackplaneResult<Arc<MigrationJob>> {
        let source = self.registry.active(capability).await?;
        let target = self.registry.handle(capability, target_id).await?;

        if source.provider_id() == target_id {
            return Err(BackplaneError::Config(format!(
                "provider '{}' is already active for capability '{}'",
                target_id, capability
            )));
        }
        if target.effective_status() == HealthStatus::Unhealthy {
            return Err(BackplaneError::TargetUnavailable(format!(
                "provider '{}' is unhealthy",
                target_id
            )));
        }

        let job = {
            let mut jobs = self.jobs.write().await;
            if let Some(existing) = jobs.get(&capability) {
                if !existing.is_terminal() {
                    return Err(BackplaneError::MigrationInProgress(capability));
                }
            }
            let id = self.next_job_id.fetch_add(1, Ordering::SeqCst) + 1;
            let job = Arc::new(MigrationJob::new(
                id,
                capability,
                source.provider_id().to_string(),
                target_id.to_string(),
                options,
            ));
            jobs.insert(capability, job.clone());
            job
        };

        info!(
            "Migration {} planned for capability '{}': {} -> {}",
            job.id(),
            capability,
            job.source_id(),
            job.target_id()
        );
        transition(&self.events, &job, MigrationState::Planned, None);

        let task = tokio::spawn(run_job(
            self.registry.clone(),
            self.events.clone(),
            self.config.clone(),
            job.clone(),
            source.provider(),
            target.provider(),
        ));
        let mut tasks = self.tasks.lock().unwrap();
        tasks.retain(|_, handle| !handle.is_finished());
        tasks.insert(job.id(), task);
        Ok(job)
    }

    /// Request cancellation of the in-flight job for a capability. The job
    /// terminates eventually as `Failed` with reason `Cancelled`.
    pub async fn cancel_migration(&self, capability: Capability) -> BackplaneResult<()> {
        let jobs = self.jobs.read().await;
        match jobs.get(&capability) {
            Some(job) if !job.is_terminal() => {
                info!("Cancelling migration {} for capability '{}'", job.id(), capability);
                job.request_cancel();
                Ok(())
            }
            _ => Err(BackplaneError::NotFound(format!(
                "no migration in progress for capability '{}'",
                capability
            ))),
        }
    }

    /// Most recent job for a capability, if any.
    pub async fn job(&self, capability: Capability) -> Option<Arc<MigrationJob>> {
        self.jobs.read().await.get(&capability).cloned()
    }

    /// Snapshot of the most recent job for status reporting.
    pub async fn snapshot(&self, capability: Capability) -> Option<MigrationSnapshot> {
        self.job(capability).await.map(|job| job.snapshot())
    }

    /// Cancel everything in flight and wait for the background tasks within
    /// the configured grace period, aborting stragglers.
    pub async fn shutdown(&self) {
        {
            let jobs = self.jobs.read().await;
            for job in jobs.values() {
                if !job.is_terminal() {
                    job.request_cancel();
                }
            }
        }

        let handles: Vec<JoinHandle<()>> = {
            let mut tasks = self.tasks.lock().unwrap();
            tasks.drain().map(|(_, handle)| handle).collect()
        };
        if handles.is_empty() {
            return;
        }
        let aborters: Vec<_> = handles.iter().map(|h| h.abort_handle()).collect();
        if tokio::time::timeout(self.config.cancel_grace, futures::future::join_all(handles))
            .await
            .is_err()
        {
            warn!(
                "Migration tasks still running after {:?}; aborting",
                self.config.cancel_grace
            );
            for aborter in aborters {
                aborter.abort();
            }
        }
    }
}

fn transition(
    events: &EventBus,
    job: &Arc<MigrationJob>,
    state: MigrationState,
    reason: Option<String>,
) {
    *job.state.write().unwrap() = state;
    debug!(
        "Migration {} ('{}') entered state {}",
        job.id(),
        job.capability(),
        state
    );
    events.emit(BackplaneEvent::Migration(MigrationEvent {
        job_id: job.id(),
        capability: job.capability(),
        source_id: job.source_id().to_string(),
        target_id: job.target_id().to_string(),
        state,
        items_copied: job.items_copied(),
        items_verified: job.items_verified(),
        reason,
        at: SystemTime::now(),
    }));
}

async fn run_job(
    registry: Arc<CapabilityRegistry>,
    events: EventBus,
    config: MigrationConfig,
    job: Arc<MigrationJob>,
    source: Arc<dyn ProviderAdapter>,
    target: Arc<dyn ProviderAdapter>,
) {
    match execute_job(&registry, &events, &config, &job, &source, &target).await {
        Ok(()) => {
            info!(
                "Migration {} completed: capability '{}' now served by '{}' ({} items copied, {} verified)",
                job.id(),
                job.capability(),
                job.target_id(),
                job.items_copied(),
                job.items_verified()
            );
        }
        Err(e) => {
            error!(
                "Migration {} for capability '{}' failed in state {}: {}",
                job.id(),
                job.capability(),
                job.state(),
                e
            );
            job.set_failure(e.to_string());
            transition(&events, &job, MigrationState::Failed, Some(e.to_string()));

            // Activation never happened, so rollback is cleanup of the
            // partially-copied, still-inactive target.
            if job.options().rollback_on_failure {
                match target.purge().await {
                    Ok(()) => {
                        info!(
                            "Migration {} rolled back: target '{}' purged",
                            job.id(),
                            job.target_id()
                        );
                        transition(
                            &events,
                            &job,
                            MigrationState::RolledBack,
                            Some("partially-copied target data purged".to_string()),
                        );
                    }
                    Err(purge_err) => {
                        error!(
                            "Migration {} rollback purge of '{}' failed: {}",
                            job.id(),
                            job.target_id(),
                            purge_err
                        );
                    }
                }
            }
        }
    }
}

async fn execute_job(
    registry: &Arc<CapabilityRegistry>,
    events: &EventBus,
    config: &MigrationConfig,
    job: &Arc<MigrationJob>,
    source: &Arc<dyn ProviderAdapter>,
    target: &Arc<dyn ProviderAdapter>,
) -> BackplaneResult<()> {
    transition(events, job, MigrationState::Copying, None);
    copy_phase(config, job, source, target).await?;

    if job.cancel_requested() {
        return Err(BackplaneError::Cancelled);
    }

    if job.options().verify {
        transition(events, job, MigrationState::Verifying, None);
        verify_phase(config, job, source, target).await?;
    }

    if job.cancel_requested() {
        return Err(BackplaneError::Cancelled);
    }

    transition(events, job, MigrationState::CuttingOver, None);
    registry
        .set_active(job.capability(), job.target_id(), false)
        .await
        .map_err(|e| match e {
            BackplaneError::Unhealthy(id) => BackplaneError::TargetUnavailable(format!(
                "provider '{}' became unhealthy before cutover",
                id
            )),
            other => other,
        })?;

    transition(events, job, MigrationState::Completed, None);
    Ok(())
}

async fn copy_phase(
    config: &MigrationConfig,
    job: &Arc<MigrationJob>,
    source: &Arc<dyn ProviderAdapter>,
    target: &Arc<dyn ProviderAdapter>,
) -> BackplaneResult<()> {
    let concurrency = config.effective_copy_concurrency();
    let mut inflight: JoinSet<BackplaneResult<u64>> = JoinSet::new();
    let mut cursor: Option<String> = None;

    loop {
        if job.cancel_requested() {
            inflight.abort_all();
            return Err(BackplaneError::Cancelled);
        }

        let page = {
            let source = source.clone();
            let resume = cursor.clone();
            let limit = config.copy_batch_size;
            retry_unit(config, move || {
                let source = source.clone();
                let resume = resume.clone();
                async move { source.export(resume, limit).await }
            })
            .await?
        };
        let finished = page.next_cursor.is_none();

        if !page.items.is_empty() {
            while inflight.len() >= concurrency {
                join_one(&mut inflight).await?;
            }
            let target = target.clone();
            let job = job.clone();
            let config = config.clone();
            let items = page.items;
            inflight.spawn(async move {
                if job.cancel_requested() {
                    return Err(BackplaneError::Cancelled);
                }
                let imported = {
                    let target = target.clone();
                    retry_unit(&config, move || {
                        let target = target.clone();
                        let items = items.clone();
                        async move { target.import(items).await }
                    })
                    .await?
                };
                job.items_copied.fetch_add(imported, Ordering::SeqCst);
                Ok(imported)
            });
        }

        if finished {
            break;
        }
        cursor = page.next_cursor;
    }

    while !inflight.is_empty() {
        join_one(&mut inflight).await?;
    }
    Ok(())
}

async fn join_one(inflight: &mut JoinSet<BackplaneResult<u64>>) -> BackplaneResult<()> {
    match inflight.join_next().await {
        Some(Ok(Ok(_))) => Ok(()),
        Some(Ok(Err(e))) => {
            inflight.abort_all();
            Err(e)
        }
        Some(Err(join_err)) => {
            inflight.abort_all();
            Err(BackplaneError::Adapter(format!(
                "copy task failed: {}",
                join_err
            )))
        }
        None => Ok(()),
    }
}

async fn verify_phase(
    config: &MigrationConfig,
    job: &Arc<MigrationJob>,
    source: &Arc<dyn ProviderAdapter>,
    target: &Arc<dyn ProviderAdapter>,
) -> BackplaneResult<()> {
    let source_count = source.item_count().await?;
    let target_count = target.item_count().await?;
    if source_count.abs_diff(target_count) > config.count_tolerance {
        return Err(BackplaneError::VerificationFailed(format!(
            "record count mismatch: source={}, target={}",
            source_count, target_count
        )));
    }

    let spec = ChecksumSpec {
        sample_every: config.sample_every,
    };
    let source_digest = source.checksum(&spec).await?;
    let target_digest = target.checksum(&spec).await?;
    if source_digest != target_digest {
        return Err(BackplaneError::VerificationFailed(format!(
            "checksum mismatch: source={}, target={}",
            source_digest, target_digest
        )));
    }

    job.items_verified.store(target_count, Ordering::SeqCst);
    debug!(
        "Migration {} verified {} items (counts {}/{})",
        job.id(),
        target_count,
        source_count,
        target_count
    );
    Ok(())
}

/// Run one copy unit with per-attempt timeout and bounded retries.
async fn retry_unit<T, F, Fut>(config: &MigrationConfig, mut unit: F) -> BackplaneResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = BackplaneResult<T>>,
{
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        let result = match tokio::time::timeout(config.copy_unit_timeout, unit()).await {
            Ok(result) => result,
            Err(_) => Err(BackplaneError::Timeout(config.copy_unit_timeout)),
        };
        match result {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt < config.copy_retry_limit => {
                let delay = Duration::from_millis(100)
                    .saturating_mul(1 << (attempt - 1).min(4))
                    .min(Duration::from_secs(2));
                warn!(
                    "Copy unit attempt {}/{} failed ({}); retrying in {:?}",
                    attempt, config.copy_retry_limit, e, delay
                );
                sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}
