//! # Capability Interfaces for the Orchestration Core
//!
//! This module defines the traits that make the orchestrator independent of
//! any concrete backend. Each provider ships an adapter implementing one of
//! the capability traits; the core selects between adapters at runtime by
//! provider identifier, never by concrete type.
//!
//! ## Adapter Traits
//!
//! ### [`ProviderAdapter`]
//! The control-plane surface every capability shares. This is the only
//! interface the registry, health monitor and migration manager depend on:
//! - **Probing**: a cheap liveness check for health monitoring
//! - **Bulk transfer**: paged `export` / `import` for migration copy
//! - **Verification**: record counts and sampled checksums
//! - **Cleanup**: purge of partially-copied state during rollback
//!
//! ### Capability operation traits
//! [`DatabaseAdapter`], [`AuthAdapter`], [`StorageAdapter`],
//! [`RealtimeAdapter`] and [`EdgeFunctionAdapter`] extend the control plane
//! with their data-plane operations. Only the service facade calls these.
//!
//! ## Design Principles
//!
//! ### Async-First
//! All traits use `async_trait` so adapters can wrap network SDKs, embedded
//! engines or in-process state without blocking the runtime.
//!
//! ### Closed error surface
//! Adapters signal failure through the [`BackplaneError`] taxonomy, almost
//! always [`BackplaneError::Adapter`] wrapping an opaque message. Provider
//! SDK error types never leak through these interfaces.
//!
//! ### Testability
//! The traits are object safe and the whole core is exercised against
//! in-memory adapters; any behavior observable here can be scripted in a
//! test without a real backend.

use crate::{
    BackplaneError, BackplaneResult, Capability, ChannelMessage, ChecksumSpec, ExportPage,
    ObjectInfo, PortableItem, Record, Session, UserAccount,
};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedReceiver;

/// Control-plane contract shared by every provider adapter.
///
/// # Implementation Requirements
///
/// - **Probe cheaply**: `probe` runs on every health cycle and must not
///   perform significant work (a connectivity ping, not a table scan).
/// - **Stable export order**: `export` must page through state in a stable
///   key order so a scan started before unrelated writes still terminates.
/// - **Canonical checksums**: `checksum` must hash the key-ordered sampled
///   items exactly as [`crate::checksum_items`] does, so digests compare
///   across heterogeneous backends.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// Cheap liveness check.
    ///
    /// # Errors
    /// Returns [`BackplaneError::Adapter`] when the backend is unreachable
    /// or refuses the check. The health monitor counts any error (or
    /// timeout) as a failed probe; errors are never propagated further.
    async fn probe(&self) -> BackplaneResult<()>;

    /// Number of migratable items currently held by this provider.
    ///
    /// Used by migration verification; must agree with what `export`
    /// enumerates.
    async fn item_count(&self) -> BackplaneResult<u64>;

    /// Export one page of state, resuming from `cursor`.
    ///
    /// Passing `None` starts a new scan. A returned page with no
    /// `next_cursor` ends the scan; its items may still be non-empty.
    async fn export(&self, cursor: Option<String>, limit: usize) -> BackplaneResult<ExportPage>;

    /// Import a batch of previously exported items, returning how many were
    /// written. Re-importing an item overwrites it, so a retried unit is
    /// safe.
    async fn import(&self, items: Vec<PortableItem>) -> BackplaneResult<u64>;

    /// Canonical digest of this provider's state under the given sampling.
    async fn checksum(&self, spec: &ChecksumSpec) -> BackplaneResult<String>;

    /// Remove all migratable state. Only invoked on inactive targets during
    /// migration rollback.
    async fn purge(&self) -> BackplaneResult<()>;
}

/// Document-style database operations.
///
/// Records live in named collections and carry provider-assigned string
/// ids. Payloads are opaque JSON; the core imposes no schema.
#[async_trait]
pub trait DatabaseAdapter: ProviderAdapter {
    /// Insert a new record and return it with its assigned id.
    ///
    /// Not assumed upsert-safe: the facade attempts `create` exactly once.
    async fn create(&self, collection: &str, data: serde_json::Value) -> BackplaneResult<Record>;

    /// Fetch a record by id, `None` when absent.
    async fn read(&self, collection: &str, id: &str) -> BackplaneResult<Option<Record>>;

    /// Apply `changes` to an existing record and return the updated record.
    ///
    /// # Errors
    /// [`BackplaneError::Adapter`] when the record does not exist.
    async fn update(
        &self,
        collection: &str,
        id: &str,
        changes: serde_json::Value,
    ) -> BackplaneResult<Record>;

    /// Delete a record, returning whether it existed.
    async fn delete(&self, collection: &str, id: &str) -> BackplaneResult<bool>;

    /// Return the records of `collection` whose data is a superset of
    /// `filter` (an empty filter matches everything).
    async fn query(
        &self,
        collection: &str,
        filter: serde_json::Value,
    ) -> BackplaneResult<Vec<Record>>;
}

/// Authentication operations.
#[async_trait]
pub trait AuthAdapter: ProviderAdapter {
    /// Provision a new account.
    async fn sign_up(&self, username: &str, secret: &str) -> BackplaneResult<UserAccount>;

    /// Authenticate and open a session.
    async fn sign_in(&self, username: &str, secret: &str) -> BackplaneResult<Session>;

    /// Invalidate a session token.
    async fn sign_out(&self, token: &str) -> BackplaneResult<()>;

    /// Resolve a token to its account, `None` when invalid or expired.
    async fn verify_token(&self, token: &str) -> BackplaneResult<Option<UserAccount>>;
}

/// Object storage operations.
#[async_trait]
pub trait StorageAdapter: ProviderAdapter {
    /// Store an object, overwriting any previous content at the key.
    async fn upload(&self, bucket: &str, key: &str, bytes: Vec<u8>) -> BackplaneResult<ObjectInfo>;

    /// Fetch an object's content, `None` when absent.
    async fn download(&self, bucket: &str, key: &str) -> BackplaneResult<Option<Vec<u8>>>;

    /// Remove an object, returning whether it existed.
    async fn remove(&self, bucket: &str, key: &str) -> BackplaneResult<bool>;

    /// List objects in a bucket under a key prefix.
    async fn list(&self, bucket: &str, prefix: &str) -> BackplaneResult<Vec<ObjectInfo>>;
}

/// Publish/subscribe messaging operations.
#[async_trait]
pub trait RealtimeAdapter: ProviderAdapter {
    /// Publish a message, returning the number of live subscribers it
    /// reached.
    async fn publish(&self, channel: &str, payload: serde_json::Value) -> BackplaneResult<u64>;

    /// Open a subscription on a channel. The receiver is bound to this
    /// provider instance and is not migrated on cutover.
    async fn subscribe(&self, channel: &str)
    -> BackplaneResult<UnboundedReceiver<ChannelMessage>>;
}

/// Serverless function invocation.
#[async_trait]
pub trait EdgeFunctionAdapter: ProviderAdapter {
    /// Invoke a named function with a JSON payload.
    async fn invoke(&self, name: &str, payload: serde_json::Value)
    -> BackplaneResult<serde_json::Value>;
}

#[derive(Clone)]
enum CapabilityOps {
    Database(Arc<dyn DatabaseAdapter>),
    Auth(Arc<dyn AuthAdapter>),
    Storage(Arc<dyn StorageAdapter>),
    Realtime(Arc<dyn RealtimeAdapter>),
    EdgeFunctions(Arc<dyn EdgeFunctionAdapter>),
}

/// A live adapter bound to its capability.
///
/// Holds the data-plane trait object for the facade and the shared
/// control-plane view for registry, health monitoring and migration, so the
/// orchestration paths stay capability-generic.
#[derive(Clone)]
pub struct AdapterInstance {
    capability: Capability,
    control: Arc<dyn ProviderAdapter>,
    ops: CapabilityOps,
}

impl AdapterInstance {
    pub fn database<A>(adapter: A) -> Self
    where
        A: DatabaseAdapter + 'static,
    {
        let adapter = Arc::new(adapter);
        Self {
            capability: Capability::Database,
            control: adapter.clone(),
            ops: CapabilityOps::Database(adapter),
        }
    }

    pub fn auth<A>(adapter: A) -> Self
    where
        A: AuthAdapter + 'static,
    {
        let adapter = Arc::new(adapter);
        Self {
            capability: Capability::Auth,
            control: adapter.clone(),
            ops: CapabilityOps::Auth(adapter),
        }
    }

    pub fn storage<A>(adapter: A) -> Self
    where
        A: StorageAdapter + 'static,
    {
        let adapter = Arc::new(adapter);
        Self {
            capability: Capability::Storage,
            control: adapter.clone(),
            ops: CapabilityOps::Storage(adapter),
        }
    }

    pub fn realtime<A>(adapter: A) -> Self
    where
        A: RealtimeAdapter + 'static,
    {
        let adapter = Arc::new(adapter);
        Self {
            capability: Capability::Realtime,
            control: adapter.clone(),
            ops: CapabilityOps::Realtime(adapter),
        }
    }

    pub fn edge_functions<A>(adapter: A) -> Self
    where
        A: EdgeFunctionAdapter + 'static,
    {
        let adapter = Arc::new(adapter);
        Self {
            capability: Capability::EdgeFunctions,
            control: adapter.clone(),
            ops: CapabilityOps::EdgeFunctions(adapter),
        }
    }

    pub fn capability(&self) -> Capability {
        self.capability
    }

    /// The control-plane view used by health probing and migration.
    pub fn provider(&self) -> Arc<dyn ProviderAdapter> {
        self.control.clone()
    }

    pub fn as_database(&self) -> BackplaneResult<Arc<dyn DatabaseAdapter>> {
        match &self.ops {
            CapabilityOps::Database(a) => Ok(a.clone()),
            _ => Err(self.mismatch(Capability::Database)),
        }
    }

    pub fn as_auth(&self) -> BackplaneResult<Arc<dyn AuthAdapter>> {
        match &self.ops {
            CapabilityOps::Auth(a) => Ok(a.clone()),
            _ => Err(self.mismatch(Capability::Auth)),
        }
    }

    pub fn as_storage(&self) -> BackplaneResult<Arc<dyn StorageAdapter>> {
        match &self.ops {
            CapabilityOps::Storage(a) => Ok(a.clone()),
            _ => Err(self.mismatch(Capability::Storage)),
        }
    }

    pub fn as_realtime(&self) -> BackplaneResult<Arc<dyn RealtimeAdapter>> {
        match &self.ops {
            CapabilityOps::Realtime(a) => Ok(a.clone()),
            _ => Err(self.mismatch(Capability::Realtime)),
        }
    }

    pub fn as_edge_functions(&self) -> BackplaneResult<Arc<dyn EdgeFunctionAdapter>> {
        match &self.ops {
            CapabilityOps::EdgeFunctions(a) => Ok(a.clone()),
            _ => Err(self.mismatch(Capability::EdgeFunctions)),
        }
    }

    fn mismatch(&self, wanted: Capability) -> BackplaneError {
        BackplaneError::Adapter(format!(
            "adapter serves capability '{}', not '{}'",
            self.capability, wanted
        ))
    }
}

impl std::fmt::Debug for AdapterInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdapterInstance")
            .field("capability", &self.capability)
            .finish()
    }
}
