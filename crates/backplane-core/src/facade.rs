//! # Unified Service Facade
//!
//! The single entry point application code calls. Every operation resolves
//! the capability's active handle from the registry, passes a per-provider
//! circuit breaker, runs under a per-attempt timeout, and emits one
//! [`OperationEvent`] with the final outcome, success or failure, for
//! observability.
//!
//! Operations classified as safely retryable are retried on transient
//! failures (timeouts and adapter errors) with exponential backoff; the
//! active handle is re-resolved on every attempt, so a retry that races a
//! cutover lands on the new provider. Non-idempotent operations (`create`
//! and everything else that mutates without being replay-safe) run exactly
//! once and surface the adapter's error directly.
//!
//! Circuit breakers are facade-owned, per provider handle, and distinct
//! from (though informed by the same failures as) monitor health: after a
//! configurable run of consecutive failures the breaker opens and
//! short-circuits calls with `CircuitOpen` until the cool-down elapses,
//! then half-opens for a single trial call.

use crate::events::{BackplaneEvent, EventBus, OperationEvent, OperationOutcome};
use crate::registry::CapabilityRegistry;
use crate::types::{
    Capability, ChannelMessage, ObjectInfo, OrchestratorConfig, Record, Session, UserAccount,
};
use crate::{BackplaneError, BackplaneResult};
use log::{debug, warn};
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{Instant, SystemTime};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::sleep;

/// Whether the facade may re-attempt an operation after a transient
/// failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RetryClass {
    Retryable,
    Once,
}

/// Externally visible circuit state for one provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Default)]
struct BreakerCore {
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    half_open_inflight: bool,
}

impl BreakerCore {
    /// Gate one attempt. `Ok(true)` admits the half-open trial call.
    fn try_acquire(&mut self, config: &crate::types::BreakerConfig) -> Result<bool, ()> {
        match self.opened_at {
            None => Ok(false),
            Some(at) => {
                if at.elapsed() >= config.cooldown {
                    if self.half_open_inflight {
                        Err(())
                    } else {
                        self.half_open_inflight = true;
                        Ok(true)
                    }
                } else {
                    Err(())
                }
            }
        }
    }

    fn on_success(&mut self) {
        self.consecutive_failures = 0;
        self.opened_at = None;
        self.half_open_inflight = false;
    }

    fn on_failure(&mut self, trial: bool, config: &crate::types::BreakerConfig) {
        if trial {
            // Failed trial re-opens for a fresh cool-down.
            self.opened_at = Some(Instant::now());
            self.half_open_inflight = false;
            return;
        }
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        if self.consecutive_failures >= config.failure_threshold {
            self.opened_at = Some(Instant::now());
            self.half_open_inflight = false;
        }
    }

    fn state(&self, config: &crate::types::BreakerConfig) -> BreakerState {
        match self.opened_at {
            None => BreakerState::Closed,
            Some(at) => {
                if at.elapsed() >= config.cooldown {
                    BreakerState::HalfOpen
                } else {
                    BreakerState::Open
                }
            }
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct OpCounters {
    attempts: u64,
    failures: u64,
}

/// Per-provider operation counters and circuit state.
#[derive(Debug, Clone, Serialize)]
pub struct ProviderOpStats {
    pub attempts: u64,
    pub failures: u64,
    pub breaker: BreakerState,
}

/// Facade-level statistics keyed by `capability:provider_id`.
#[derive(Debug, Clone, Serialize)]
pub struct FacadeStats {
    pub providers: HashMap<String, ProviderOpStats>,
}

/// The unified operation surface over whatever providers are active.
pub struct ServiceFacade {
    registry: Arc<CapabilityRegistry>,
    events: EventBus,
    config: OrchestratorConfig,
    breakers: Mutex<HashMap<String, BreakerCore>>,
    counters: Mutex<HashMap<String, OpCounters>>,
}

impl ServiceFacade {
    pub fn new(
        registry: Arc<CapabilityRegistry>,
        events: EventBus,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            registry,
            events,
            config,
            breakers: Mutex::new(HashMap::new()),
            counters: Mutex::new(HashMap::new()),
        }
    }

    // ---- database ----

    /// Insert a record. Attempted exactly once; a create is not assumed
    /// upsert-safe.
    pub async fn create(
        &self,
        collection: &str,
        data: serde_json::Value,
    ) -> BackplaneResult<Record> {
        let collection = collection.to_string();
        self.execute(
            Capability::Database,
            "database.create",
            RetryClass::Once,
            move |instance| {
                let collection = collection.clone();
                let data = data.clone();
                async move { instance.as_database()?.create(&collection, data).await }
            },
        )
        .await
    }

    pub async fn read(&self, collection: &str, id: &str) -> BackplaneResult<Option<Record>> {
        let collection = collection.to_string();
        let id = id.to_string();
        self.execute(
            Capability::Database,
            "database.read",
            RetryClass::Retryable,
            move |instance| {
                let collection = collection.clone();
                let id = id.clone();
                async move { instance.as_database()?.read(&collection, &id).await }
            },
        )
        .await
    }

    pub async fn update(
        &self,
        collection: &str,
        id: &str,
        changes: serde_json::Value,
    ) -> BackplaneResult<Record> {
        let collection = collection.to_string();
        let id = id.to_string();
        self.execute(
            Capability::Database,
            "database.update",
            RetryClass::Once,
            move |instance| {
                let collection = collection.clone();
                let id = id.clone();
                let changes = changes.clone();
                async move {
                    instance
                        .as_database()?
                        .update(&collection, &id, changes)
                        .await
                }
            },
        )
        .await
    }

    pub async fn delete(&self, collection: &str, id: &str) -> BackplaneResult<bool> {
        let collection = collection.to_string();
        let id = id.to_string();
        self.execute(
            Capability::Database,
            "database.delete",
            RetryClass::Once,
            move |instance| {
                let collection = collection.clone();
                let id = id.clone();
                async move { instance.as_database()?.delete(&collection, &id).await }
            },
        )
        .await
    }

    pub async fn query(
        &self,
        collection: &str,
        filter: serde_json::Value,
    ) -> BackplaneResult<Vec<Record>> {
        let collection = collection.to_string();
        self.execute(
            Capability::Database,
            "database.query",
            RetryClass::Retryable,
            move |instance| {
                let collection = collection.clone();
                let filter = filter.clone();
                async move { instance.as_database()?.query(&collection, filter).await }
            },
        )
        .await
    }

    // ---- auth ----

    pub async fn sign_up(&self, username: &str, secret: &str) -> BackplaneResult<UserAccount> {
        let username = username.to_string();
        let secret = secret.to_string();
        self.execute(
            Capability::Auth,
            "auth.sign_up",
            RetryClass::Once,
            move |instance| {
                let username = username.clone();
                let secret = secret.clone();
                async move { instance.as_auth()?.sign_up(&username, &secret).await }
            },
        )
        .await
    }

    pub async fn sign_in(&self, username: &str, secret: &str) -> BackplaneResult<Session> {
        let username = username.to_string();
        let secret = secret.to_string();
        self.execute(
            Capability::Auth,
            "auth.sign_in",
            RetryClass::Once,
            move |instance| {
                let username = username.clone();
                let secret = secret.clone();
                async move { instance.as_auth()?.sign_in(&username, &secret).await }
            },
        )
        .await
    }

    pub async fn sign_out(&self, token: &str) -> BackplaneResult<()> {
        let token = token.to_string();
        self.execute(
            Capability::Auth,
            "auth.sign_out",
            RetryClass::Once,
            move |instance| {
                let token = token.clone();
                async move { instance.as_auth()?.sign_out(&token).await }
            },
        )
        .await
    }

    pub async fn verify_token(&self, token: &str) -> BackplaneResult<Option<UserAccount>> {
        let token = token.to_string();
        self.execute(
            Capability::Auth,
            "auth.verify_token",
            RetryClass::Retryable,
            move |instance| {
                let token = token.clone();
                async move { instance.as_auth()?.verify_token(&token).await }
            },
        )
        .await
    }

    // ---- storage ----

    pub async fn upload(
        &self,
        bucket: &str,
        key: &str,
        bytes: Vec<u8>,
    ) -> BackplaneResult<ObjectInfo> {
        let bucket = bucket.to_string();
        let key = key.to_string();
        self.execute(
            Capability::Storage,
            "storage.upload",
            RetryClass::Once,
            move |instance| {
                let bucket = bucket.clone();
                let key = key.clone();
                let bytes = bytes.clone();
                async move { instance.as_storage()?.upload(&bucket, &key, bytes).await }
            },
        )
        .await
    }

    pub async fn download(&self, bucket: &str, key: &str) -> BackplaneResult<Option<Vec<u8>>> {
        let bucket = bucket.to_string();
        let key = key.to_string();
        self.execute(
            Capability::Storage,
            "storage.download",
            RetryClass::Retryable,
            move |instance| {
                let bucket = bucket.clone();
                let key = key.clone();
                async move { instance.as_storage()?.download(&bucket, &key).await }
            },
        )
        .await
    }

    pub async fn remove_object(&self, bucket: &str, key: &str) -> BackplaneResult<bool> {
        let bucket = bucket.to_string();
        let key = key.to_string();
        self.execute(
            Capability::Storage,
            "storage.remove",
            RetryClass::Once,
            move |instance| {
                let bucket = bucket.clone();
                let key = key.clone();
                async move { instance.as_storage()?.remove(&bucket, &key).await }
            },
        )
        .await
    }

    pub async fn list_objects(
        &self,
        bucket: &str,
        prefix: &str,
    ) -> BackplaneResult<Vec<ObjectInfo>> {
        let bucket = bucket.to_string();
        let prefix = prefix.to_string();
        self.execute(
            Capability::Storage,
            "storage.list",
            RetryClass::Retryable,
            move |instance| {
                let bucket = bucket.clone();
                let prefix = prefix.clone();
                async move { instance.as_storage()?.list(&bucket, &prefix).await }
            },
        )
        .await
    }

    // ---- realtime ----

    pub async fn publish(&self, channel: &str, payload: serde_json::Value) -> BackplaneResult<u64> {
        let channel = channel.to_string();
        self.execute(
            Capability::Realtime,
            "realtime.publish",
            RetryClass::Once,
            move |instance| {
                let channel = channel.clone();
                let payload = payload.clone();
                async move { instance.as_realtime()?.publish(&channel, payload).await }
            },
        )
        .await
    }

    /// Open a subscription on the provider active right now. The stream is
    /// bound to that provider and is not migrated on cutover; re-subscribe
    /// to attach to a newly activated provider.
    pub async fn subscribe(
        &self,
        channel: &str,
    ) -> BackplaneResult<UnboundedReceiver<ChannelMessage>> {
        let channel = channel.to_string();
        self.execute(
            Capability::Realtime,
            "realtime.subscribe",
            RetryClass::Once,
            move |instance| {
                let channel = channel.clone();
                async move { instance.as_realtime()?.subscribe(&channel).await }
            },
        )
        .await
    }

    // ---- edge functions ----

    pub async fn invoke(
        &self,
        name: &str,
        payload: serde_json::Value,
    ) -> BackplaneResult<serde_json::Value> {
        let name = name.to_string();
        self.execute(
            Capability::EdgeFunctions,
            "functions.invoke",
            RetryClass::Once,
            move |instance| {
                let name = name.clone();
                let payload = payload.clone();
                async move { instance.as_edge_functions()?.invoke(&name, payload).await }
            },
        )
        .await
    }

    /// Operation counters and breaker state per provider.
    pub fn stats(&self) -> FacadeStats {
        let counters = self.counters.lock().unwrap();
        let breakers = self.breakers.lock().unwrap();
        let mut providers = HashMap::new();
        for (key, counts) in counters.iter() {
            let breaker = breakers
                .get(key)
                .map(|core| core.state(&self.config.breaker))
                .unwrap_or(BreakerState::Closed);
            providers.insert(
                key.clone(),
                ProviderOpStats {
                    attempts: counts.attempts,
                    failures: counts.failures,
                    breaker,
                },
            );
        }
        FacadeStats { providers }
    }

    async fn execute<T, F, Fut>(
        &self,
        capability: Capability,
        operation: &'static str,
        class: RetryClass,
        f: F,
    ) -> BackplaneResult<T>
    where
        F: Fn(crate::traits::AdapterInstance) -> Fut,
        Fut: Future<Output = BackplaneResult<T>>,
    {
        let started = Instant::now();
        let max_attempts = match class {
            RetryClass::Retryable => self.config.retry.max_attempts.max(1),
            RetryClass::Once => 1,
        };
        let mut attempt = 0u32;

        let outcome: Result<(String, T), (Option<String>, BackplaneError)> = loop {
            attempt += 1;

            let handle = match self.registry.active(capability).await {
                Ok(handle) => handle,
                Err(e) => break Err((None, e)),
            };
            let provider_id = handle.provider_id().to_string();
            let key = breaker_key(capability, &provider_id);

            let trial = {
                let mut breakers = self.breakers.lock().unwrap();
                let core = breakers.entry(key.clone()).or_default();
                match core.try_acquire(&self.config.breaker) {
                    Ok(trial) => trial,
                    Err(()) => {
                        break Err((
                            Some(provider_id.clone()),
                            BackplaneError::CircuitOpen(provider_id),
                        ));
                    }
                }
            };

            let result = match tokio::time::timeout(
                self.config.operation_timeout,
                f(handle.instance().clone()),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(BackplaneError::Timeout(self.config.operation_timeout)),
            };

            // A non-transient error means the provider answered; only
            // transient outcomes feed the breaker.
            let provider_failed = matches!(&result, Err(e) if e.is_transient());
            {
                let mut breakers = self.breakers.lock().unwrap();
                let core = breakers.entry(key.clone()).or_default();
                if provider_failed {
                    core.on_failure(trial, &self.config.breaker);
                    if core.state(&self.config.breaker) == BreakerState::Open {
                        warn!(
                            "Circuit opened for provider '{}' on capability '{}'",
                            provider_id, capability
                        );
                    }
                } else {
                    core.on_success();
                }
            }
            {
                let mut counters = self.counters.lock().unwrap();
                let counts = counters.entry(key).or_default();
                counts.attempts += 1;
                if result.is_err() {
                    counts.failures += 1;
                }
            }

            match result {
                Ok(value) => break Ok((provider_id, value)),
                Err(e) => {
                    if class == RetryClass::Retryable && e.is_transient() && attempt < max_attempts
                    {
                        let delay = self.config.retry.delay_for(attempt);
                        debug!(
                            "Retrying {} on '{}' after {:?} (attempt {}/{}): {}",
                            operation, provider_id, delay, attempt, max_attempts, e
                        );
                        sleep(delay).await;
                        continue;
                    }
                    break Err((Some(provider_id), e));
                }
            }
        };

        let latency = started.elapsed();
        match outcome {
            Ok((provider_id, value)) => {
                self.events.emit(BackplaneEvent::Operation(OperationEvent {
                    capability,
                    provider_id,
                    operation,
                    latency,
                    outcome: OperationOutcome::Success,
                    at: SystemTime::now(),
                }));
                Ok(value)
            }
            Err((provider_id, e)) => {
                self.events.emit(BackplaneEvent::Operation(OperationEvent {
                    capability,
                    provider_id: provider_id.unwrap_or_default(),
                    operation,
                    latency,
                    outcome: OperationOutcome::Failure(e.kind().to_string()),
                    at: SystemTime::now(),
                }));
                Err(e)
            }
        }
    }
}

fn breaker_key(capability: Capability, provider_id: &str) -> String {
    format!("{}:{}", capability, provider_id)
}
