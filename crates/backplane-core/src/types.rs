//! Common types for backplane-core

use crate::{BackplaneError, BackplaneResult};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::time::{Duration, SystemTime};

/// A category of backend function served by providers.
///
/// The set is fixed; extending it means adding a variant and the matching
/// capability trait, never type-checking a concrete provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Capability {
    Database,
    Auth,
    Storage,
    Realtime,
    EdgeFunctions,
}

impl Capability {
    pub const ALL: [Capability; 5] = [
        Capability::Database,
        Capability::Auth,
        Capability::Storage,
        Capability::Realtime,
        Capability::EdgeFunctions,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::Database => "database",
            Capability::Auth => "auth",
            Capability::Storage => "storage",
            Capability::Realtime => "realtime",
            Capability::EdgeFunctions => "edge_functions",
        }
    }
}

impl std::fmt::Display for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Liveness classification of a provider handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
    /// Registered but not yet probed.
    Unknown,
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Unhealthy => "unhealthy",
            HealthStatus::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// Identity of one adapter instance. Immutable after registration.
///
/// `connection` is opaque to the core; it is carried for the adapter's
/// benefit and never inspected. `priority` breaks ties when several
/// providers are equally healthy (higher wins).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderDescriptor {
    pub provider_id: String,
    pub capability: Capability,
    #[serde(default)]
    pub connection: serde_json::Value,
    #[serde(default)]
    pub priority: i32,
}

impl ProviderDescriptor {
    pub fn new(provider_id: impl Into<String>, capability: Capability) -> Self {
        Self {
            provider_id: provider_id.into(),
            capability,
            connection: serde_json::Value::Null,
            priority: 0,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_connection(mut self, connection: serde_json::Value) -> Self {
        self.connection = connection;
        self
    }
}

/// Point-in-time snapshot of a handle's mutable health state.
#[derive(Debug, Clone, Serialize)]
pub struct ProviderHealth {
    pub status: HealthStatus,
    pub last_checked_at: Option<SystemTime>,
    pub consecutive_failures: u32,
    pub latency_sample: Option<Duration>,
    /// True when the status is pinned by a harness/operator override.
    pub overridden: bool,
}

/// Health probing tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    /// Delay between probe cycles.
    pub probe_interval: Duration,
    /// Per-probe timeout; a timed-out probe counts as a failure.
    pub probe_timeout: Duration,
    /// Consecutive failures before a provider is condemned to `Unhealthy`.
    pub unhealthy_after: u32,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            probe_interval: Duration::from_secs(30),
            probe_timeout: Duration::from_secs(5),
            unhealthy_after: 3,
        }
    }
}

/// Facade retry policy for operations classified as safely retryable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
        }
    }
}

impl RetryConfig {
    /// Exponential backoff for the given 1-based attempt number, capped at
    /// `max_delay`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        let delay = self.base_delay.saturating_mul(1u32 << shift);
        delay.min(self.max_delay)
    }
}

/// Per-provider circuit breaker tunables, applied at the facade.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerConfig {
    /// Consecutive facade-observed failures before the circuit opens.
    pub failure_threshold: u32,
    /// Cool-down before the circuit half-opens for a single trial call.
    pub cooldown: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::from_secs(30),
        }
    }
}

/// Migration execution tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationConfig {
    /// Items requested per export page.
    pub copy_batch_size: usize,
    /// Attempts per copy unit before the job fails.
    pub copy_retry_limit: u32,
    /// Timeout applied to each individual copy unit.
    pub copy_unit_timeout: Duration,
    /// Concurrent import units in flight; `None` derives from the CPU count.
    pub copy_concurrency: Option<usize>,
    /// Allowed absolute difference between source and target record counts.
    pub count_tolerance: u64,
    /// Checksum sampling stride: 1 hashes every item, `n` every n-th.
    pub sample_every: u64,
    /// Grace period for cancellation and shutdown to take effect.
    pub cancel_grace: Duration,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            copy_batch_size: 256,
            copy_retry_limit: 3,
            copy_unit_timeout: Duration::from_secs(10),
            copy_concurrency: None,
            count_tolerance: 0,
            sample_every: 1,
            cancel_grace: Duration::from_secs(5),
        }
    }
}

impl MigrationConfig {
    /// Effective copy concurrency, derived from the CPU count when not set.
    pub fn effective_copy_concurrency(&self) -> usize {
        self.copy_concurrency.unwrap_or_else(|| {
            let cpu_count = num_cpus::get();
            std::cmp::min(std::cmp::max(2, cpu_count / 2), 16)
        })
    }
}

/// Top-level configuration for one orchestrator instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    pub health: HealthConfig,
    pub retry: RetryConfig,
    pub breaker: BreakerConfig,
    pub migration: MigrationConfig,
    /// Timeout applied to each facade operation attempt.
    #[serde(default = "default_operation_timeout")]
    pub operation_timeout: Duration,
    /// Promote the best healthy standby when the active provider is
    /// condemned. Off by default; routing changes stay explicit unless the
    /// application opts in.
    #[serde(default)]
    pub auto_failover: bool,
}

fn default_operation_timeout() -> Duration {
    Duration::from_secs(10)
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            health: HealthConfig::default(),
            retry: RetryConfig::default(),
            breaker: BreakerConfig::default(),
            migration: MigrationConfig::default(),
            operation_timeout: default_operation_timeout(),
            auto_failover: false,
        }
    }
}

impl OrchestratorConfig {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Options for one migration request.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct MigrationOptions {
    /// Run the integrity check between copy and cutover.
    pub verify: bool,
    /// On failure, purge partially-copied target data and end `RolledBack`
    /// instead of leaving cleanup to the operator.
    pub rollback_on_failure: bool,
}

impl Default for MigrationOptions {
    fn default() -> Self {
        Self {
            verify: true,
            rollback_on_failure: false,
        }
    }
}

/// Migration job state machine.
///
/// `Failed` is reachable from `Copying`, `Verifying` and `CuttingOver`;
/// `RolledBack` only from `Failed` when rollback was requested. Activation
/// happens exclusively in `CuttingOver`, so failures before that state never
/// require a traffic rollback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MigrationState {
    Planned,
    Copying,
    Verifying,
    CuttingOver,
    Completed,
    Failed,
    RolledBack,
}

impl MigrationState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            MigrationState::Completed | MigrationState::Failed | MigrationState::RolledBack
        )
    }
}

impl std::fmt::Display for MigrationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            MigrationState::Planned => "planned",
            MigrationState::Copying => "copying",
            MigrationState::Verifying => "verifying",
            MigrationState::CuttingOver => "cutting_over",
            MigrationState::Completed => "completed",
            MigrationState::Failed => "failed",
            MigrationState::RolledBack => "rolled_back",
        };
        f.write_str(s)
    }
}

/// Snapshot of one migration job for status reporting.
#[derive(Debug, Clone, Serialize)]
pub struct MigrationSnapshot {
    pub job_id: u64,
    pub capability: Capability,
    pub source_id: String,
    pub target_id: String,
    pub state: MigrationState,
    pub items_copied: u64,
    pub items_verified: u64,
    pub failure: Option<String>,
}

/// One provider entry in a capability status report.
#[derive(Debug, Clone, Serialize)]
pub struct ProviderStatus {
    pub provider_id: String,
    pub priority: i32,
    pub active: bool,
    pub health: ProviderHealth,
}

/// Administrative status of one capability: the active binding, every
/// registered handle with health, and the most recent migration job.
#[derive(Debug, Clone, Serialize)]
pub struct CapabilityStatus {
    pub capability: Capability,
    pub active: Option<String>,
    pub providers: Vec<ProviderStatus>,
    pub migration: Option<MigrationSnapshot>,
}

/// Backend-neutral unit of migrated state. Adapters hex-encode binary
/// payloads so any two faithful adapters agree on the representation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortableItem {
    pub key: String,
    pub payload: serde_json::Value,
}

/// One page of a bulk export. An empty page with no cursor ends the scan.
#[derive(Debug, Clone)]
pub struct ExportPage {
    pub items: Vec<PortableItem>,
    pub next_cursor: Option<String>,
}

/// Sampling parameters for migration verification checksums.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChecksumSpec {
    /// Hash every n-th item in key order; 1 hashes everything.
    pub sample_every: u64,
}

impl Default for ChecksumSpec {
    fn default() -> Self {
        Self { sample_every: 1 }
    }
}

/// SHA-256 over the key-ordered sampled items, hex encoded.
///
/// This is the canonical digest adapters are expected to produce from their
/// own state so source and target can be compared across heterogeneous
/// backends.
pub fn checksum_items(items: &[PortableItem], spec: &ChecksumSpec) -> BackplaneResult<String> {
    let stride = spec.sample_every.max(1);
    let mut ordered: Vec<&PortableItem> = items.iter().collect();
    ordered.sort_by(|a, b| a.key.cmp(&b.key));

    let mut hasher = Sha256::new();
    for (index, item) in ordered.iter().enumerate() {
        if (index as u64) % stride != 0 {
            continue;
        }
        let payload = serde_json::to_vec(&item.payload)
            .map_err(|e| BackplaneError::Adapter(format!("unserializable payload: {}", e)))?;
        hasher.update(item.key.as_bytes());
        hasher.update([0u8]);
        hasher.update(&payload);
        hasher.update([0xffu8]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// A stored database record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub id: String,
    pub collection: String,
    pub data: serde_json::Value,
}

/// A provisioned user account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserAccount {
    pub user_id: String,
    pub username: String,
}

/// An authenticated session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub token: String,
    pub user_id: String,
    pub issued_at: SystemTime,
}

/// Metadata for a stored object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectInfo {
    pub bucket: String,
    pub key: String,
    pub size: u64,
}

/// A message delivered on a realtime channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelMessage {
    pub channel: String,
    pub sequence: u64,
    pub payload: serde_json::Value,
}
