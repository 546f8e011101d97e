//! In-memory implementations of the capability adapter traits

use async_trait::async_trait;
use backplane_core::{
    AuthAdapter, BackplaneError, BackplaneResult, ChannelMessage, ChecksumSpec, DatabaseAdapter,
    EdgeFunctionAdapter, ExportPage, ObjectInfo, PortableItem, ProviderAdapter, RealtimeAdapter,
    Record, Session, StorageAdapter, UserAccount, checksum_items,
};
use serde_json::{Value, json};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};

/// Failure-injection switchboard shared by every mem adapter.
///
/// Clones share state, so a test can keep one handle and script the adapter
/// it registered: connectivity toggle, budgets of failed probes/operations,
/// and injected latency (which also lets probes and operations run into
/// their timeouts).
#[derive(Clone, Default)]
pub struct MemFaults {
    disconnected: Arc<AtomicBool>,
    fail_probes: Arc<AtomicU32>,
    fail_ops: Arc<AtomicU32>,
    delay: Arc<Mutex<Option<Duration>>>,
}

impl MemFaults {
    pub fn set_connected(&self, connected: bool) {
        self.disconnected.store(!connected, Ordering::SeqCst);
    }

    /// Fail the next `n` probes with an adapter error.
    pub fn fail_next_probes(&self, n: u32) {
        self.fail_probes.store(n, Ordering::SeqCst);
    }

    /// Fail the next `n` data/control operations with an adapter error.
    pub fn fail_next_ops(&self, n: u32) {
        self.fail_ops.store(n, Ordering::SeqCst);
    }

    /// Delay every probe and operation; `None` removes the delay.
    pub fn set_delay(&self, delay: Option<Duration>) {
        *self.delay.lock().unwrap() = delay;
    }

    async fn apply_delay(&self) {
        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }

    async fn gate_probe(&self) -> BackplaneResult<()> {
        self.apply_delay().await;
        if self.disconnected.load(Ordering::SeqCst) {
            return Err(BackplaneError::Adapter("backend offline".to_string()));
        }
        if take_budget(&self.fail_probes) {
            log::debug!("mem adapter: injecting probe failure");
            return Err(BackplaneError::Adapter("injected probe failure".to_string()));
        }
        Ok(())
    }

    async fn gate_op(&self) -> BackplaneResult<()> {
        self.apply_delay().await;
        if self.disconnected.load(Ordering::SeqCst) {
            return Err(BackplaneError::Adapter("backend offline".to_string()));
        }
        if take_budget(&self.fail_ops) {
            log::debug!("mem adapter: injecting operation failure");
            return Err(BackplaneError::Adapter(
                "injected operation failure".to_string(),
            ));
        }
        Ok(())
    }
}

fn take_budget(budget: &AtomicU32) -> bool {
    budget
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

/// Page an item list in key order the way a real backend would page a scan.
fn page_from(mut items: Vec<PortableItem>, cursor: Option<String>, limit: usize) -> ExportPage {
    items.sort_by(|a, b| a.key.cmp(&b.key));
    let start = match &cursor {
        Some(cursor) => items.partition_point(|item| item.key.as_str() <= cursor.as_str()),
        None => 0,
    };
    let end = (start + limit.max(1)).min(items.len());
    let page: Vec<PortableItem> = items[start..end].to_vec();
    let next_cursor = if end < items.len() {
        page.last().map(|item| item.key.clone())
    } else {
        None
    };
    ExportPage {
        items: page,
        next_cursor,
    }
}

fn split_key(key: &str) -> BackplaneResult<(&str, &str)> {
    key.split_once('/')
        .ok_or_else(|| BackplaneError::Adapter(format!("malformed portable key '{}'", key)))
}

// ---------------------------------------------------------------------------
// Database
// ---------------------------------------------------------------------------

/// In-memory document database: collections of JSON records.
#[derive(Clone, Default)]
pub struct MemDatabase {
    tables: Arc<Mutex<BTreeMap<String, BTreeMap<String, Value>>>>,
    next_id: Arc<AtomicU64>,
    faults: MemFaults,
}

impl MemDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn faults(&self) -> &MemFaults {
        &self.faults
    }

    /// Total records across all collections (test helper).
    pub fn record_count(&self) -> usize {
        let tables = self.tables.lock().unwrap();
        tables.values().map(BTreeMap::len).sum()
    }

    /// Seed a record with a fixed id (test helper).
    pub fn seed(&self, collection: &str, id: &str, data: Value) {
        let mut tables = self.tables.lock().unwrap();
        tables
            .entry(collection.to_string())
            .or_default()
            .insert(id.to_string(), data);
    }

    fn all_items(&self) -> Vec<PortableItem> {
        let tables = self.tables.lock().unwrap();
        tables
            .iter()
            .flat_map(|(collection, rows)| {
                rows.iter().map(move |(id, data)| PortableItem {
                    key: format!("{}/{}", collection, id),
                    payload: data.clone(),
                })
            })
            .collect()
    }
}

#[async_trait]
impl ProviderAdapter for MemDatabase {
    async fn probe(&self) -> BackplaneResult<()> {
        self.faults.gate_probe().await
    }

    async fn item_count(&self) -> BackplaneResult<u64> {
        self.faults.gate_op().await?;
        Ok(self.record_count() as u64)
    }

    async fn export(&self, cursor: Option<String>, limit: usize) -> BackplaneResult<ExportPage> {
        self.faults.gate_op().await?;
        Ok(page_from(self.all_items(), cursor, limit))
    }

    async fn import(&self, items: Vec<PortableItem>) -> BackplaneResult<u64> {
        self.faults.gate_op().await?;
        let mut tables = self.tables.lock().unwrap();
        let mut imported = 0u64;
        for item in items {
            let (collection, id) = split_key(&item.key)?;
            tables
                .entry(collection.to_string())
                .or_default()
                .insert(id.to_string(), item.payload);
            imported += 1;
        }
        Ok(imported)
    }

    async fn checksum(&self, spec: &ChecksumSpec) -> BackplaneResult<String> {
        self.faults.gate_op().await?;
        checksum_items(&self.all_items(), spec)
    }

    async fn purge(&self) -> BackplaneResult<()> {
        self.faults.gate_op().await?;
        self.tables.lock().unwrap().clear();
        Ok(())
    }
}

#[async_trait]
impl DatabaseAdapter for MemDatabase {
    async fn create(&self, collection: &str, data: Value) -> BackplaneResult<Record> {
        self.faults.gate_op().await?;
        let id = format!("rec-{:06}", self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        let mut tables = self.tables.lock().unwrap();
        tables
            .entry(collection.to_string())
            .or_default()
            .insert(id.clone(), data.clone());
        Ok(Record {
            id,
            collection: collection.to_string(),
            data,
        })
    }

    async fn read(&self, collection: &str, id: &str) -> BackplaneResult<Option<Record>> {
        self.faults.gate_op().await?;
        let tables = self.tables.lock().unwrap();
        Ok(tables
            .get(collection)
            .and_then(|rows| rows.get(id))
            .map(|data| Record {
                id: id.to_string(),
                collection: collection.to_string(),
                data: data.clone(),
            }))
    }

    async fn update(&self, collection: &str, id: &str, changes: Value) -> BackplaneResult<Record> {
        self.faults.gate_op().await?;
        let mut tables = self.tables.lock().unwrap();
        let rows = tables
            .get_mut(collection)
            .ok_or_else(|| no_record(collection, id))?;
        let current = rows.get_mut(id).ok_or_else(|| no_record(collection, id))?;
        match changes {
            Value::Object(patch) => {
                if let Value::Object(existing) = current {
                    for (key, value) in patch {
                        existing.insert(key, value);
                    }
                } else {
                    *current = Value::Object(patch);
                }
            }
            other => *current = other,
        }
        let data = current.clone();
        Ok(Record {
            id: id.to_string(),
            collection: collection.to_string(),
            data,
        })
    }

    async fn delete(&self, collection: &str, id: &str) -> BackplaneResult<bool> {
        self.faults.gate_op().await?;
        let mut tables = self.tables.lock().unwrap();
        Ok(tables
            .get_mut(collection)
            .map(|rows| rows.remove(id).is_some())
            .unwrap_or(false))
    }

    async fn query(&self, collection: &str, filter: Value) -> BackplaneResult<Vec<Record>> {
        self.faults.gate_op().await?;
        let tables = self.tables.lock().unwrap();
        let Some(rows) = tables.get(collection) else {
            return Ok(Vec::new());
        };
        let records = rows
            .iter()
            .filter(|(_, data)| matches_filter(data, &filter))
            .map(|(id, data)| Record {
                id: id.clone(),
                collection: collection.to_string(),
                data: data.clone(),
            })
            .collect();
        Ok(records)
    }
}

fn no_record(collection: &str, id: &str) -> BackplaneError {
    BackplaneError::Adapter(format!("no record '{}/{}'", collection, id))
}

fn matches_filter(data: &Value, filter: &Value) -> bool {
    match filter {
        Value::Null => true,
        Value::Object(wanted) if wanted.is_empty() => true,
        Value::Object(wanted) => match data {
            Value::Object(fields) => wanted
                .iter()
                .all(|(key, value)| fields.get(key) == Some(value)),
            _ => false,
        },
        _ => false,
    }
}

// ---------------------------------------------------------------------------
// Auth
// ---------------------------------------------------------------------------

#[derive(Clone)]
struct StoredUser {
    user_id: String,
    secret_hash: String,
}

/// In-memory authentication backend: accounts plus live session tokens.
///
/// Sessions are excluded from the migratable state; they are ephemeral and
/// only accounts move during a migration.
#[derive(Clone, Default)]
pub struct MemAuth {
    users: Arc<Mutex<BTreeMap<String, StoredUser>>>,
    sessions: Arc<Mutex<HashMap<String, String>>>,
    next_id: Arc<AtomicU64>,
    faults: MemFaults,
}

impl MemAuth {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn faults(&self) -> &MemFaults {
        &self.faults
    }

    fn all_items(&self) -> Vec<PortableItem> {
        let users = self.users.lock().unwrap();
        users
            .iter()
            .map(|(username, user)| PortableItem {
                key: format!("user/{}", username),
                payload: json!({
                    "user_id": user.user_id,
                    "secret_hash": user.secret_hash,
                }),
            })
            .collect()
    }
}

fn hash_secret(secret: &str) -> String {
    hex::encode(Sha256::digest(secret.as_bytes()))
}

#[async_trait]
impl ProviderAdapter for MemAuth {
    async fn probe(&self) -> BackplaneResult<()> {
        self.faults.gate_probe().await
    }

    async fn item_count(&self) -> BackplaneResult<u64> {
        self.faults.gate_op().await?;
        Ok(self.users.lock().unwrap().len() as u64)
    }

    async fn export(&self, cursor: Option<String>, limit: usize) -> BackplaneResult<ExportPage> {
        self.faults.gate_op().await?;
        Ok(page_from(self.all_items(), cursor, limit))
    }

    async fn import(&self, items: Vec<PortableItem>) -> BackplaneResult<u64> {
        self.faults.gate_op().await?;
        let mut users = self.users.lock().unwrap();
        let mut imported = 0u64;
        for item in items {
            let (kind, username) = split_key(&item.key)?;
            if kind != "user" {
                return Err(BackplaneError::Adapter(format!(
                    "unexpected portable key '{}'",
                    item.key
                )));
            }
            let user_id = item.payload["user_id"]
                .as_str()
                .ok_or_else(|| bad_payload(&item.key))?
                .to_string();
            let secret_hash = item.payload["secret_hash"]
                .as_str()
                .ok_or_else(|| bad_payload(&item.key))?
                .to_string();
            users.insert(
                username.to_string(),
                StoredUser {
                    user_id,
                    secret_hash,
                },
            );
            imported += 1;
        }
        Ok(imported)
    }

    async fn checksum(&self, spec: &ChecksumSpec) -> BackplaneResult<String> {
        self.faults.gate_op().await?;
        checksum_items(&self.all_items(), spec)
    }

    async fn purge(&self) -> BackplaneResult<()> {
        self.faults.gate_op().await?;
        self.users.lock().unwrap().clear();
        self.sessions.lock().unwrap().clear();
        Ok(())
    }
}

fn bad_payload(key: &str) -> BackplaneError {
    BackplaneError::Adapter(format!("malformed payload for portable key '{}'", key))
}

#[async_trait]
impl AuthAdapter for MemAuth {
    async fn sign_up(&self, username: &str, secret: &str) -> BackplaneResult<UserAccount> {
        self.faults.gate_op().await?;
        let mut users = self.users.lock().unwrap();
        if users.contains_key(username) {
            return Err(BackplaneError::Adapter(format!(
                "username '{}' already exists",
                username
            )));
        }
        let user_id = format!("user-{:04}", self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        users.insert(
            username.to_string(),
            StoredUser {
                user_id: user_id.clone(),
                secret_hash: hash_secret(secret),
            },
        );
        Ok(UserAccount {
            user_id,
            username: username.to_string(),
        })
    }

    async fn sign_in(&self, username: &str, secret: &str) -> BackplaneResult<Session> {
        self.faults.gate_op().await?;
        let user_id = {
            let users = self.users.lock().unwrap();
            let user = users.get(username).ok_or_else(invalid_credentials)?;
            if user.secret_hash != hash_secret(secret) {
                return Err(invalid_credentials());
            }
            user.user_id.clone()
        };
        let token = format!(
            "tok-{}-{:04}",
            user_id,
            self.next_id.fetch_add(1, Ordering::SeqCst) + 1
        );
        self.sessions
            .lock()
            .unwrap()
            .insert(token.clone(), username.to_string());
        Ok(Session {
            token,
            user_id,
            issued_at: SystemTime::now(),
        })
    }

    async fn sign_out(&self, token: &str) -> BackplaneResult<()> {
        self.faults.gate_op().await?;
        self.sessions.lock().unwrap().remove(token);
        Ok(())
    }

    async fn verify_token(&self, token: &str) -> BackplaneResult<Option<UserAccount>> {
        self.faults.gate_op().await?;
        let username = {
            let sessions = self.sessions.lock().unwrap();
            sessions.get(token).cloned()
        };
        let Some(username) = username else {
            return Ok(None);
        };
        let users = self.users.lock().unwrap();
        Ok(users.get(&username).map(|user| UserAccount {
            user_id: user.user_id.clone(),
            username,
        }))
    }
}

fn invalid_credentials() -> BackplaneError {
    BackplaneError::Adapter("invalid credentials".to_string())
}

// ---------------------------------------------------------------------------
// Object storage
// ---------------------------------------------------------------------------

/// In-memory object store: buckets of byte blobs, hex-encoded for export.
#[derive(Clone, Default)]
pub struct MemObjectStore {
    buckets: Arc<Mutex<BTreeMap<String, BTreeMap<String, Vec<u8>>>>>,
    faults: MemFaults,
}

impl MemObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn faults(&self) -> &MemFaults {
        &self.faults
    }

    fn all_items(&self) -> Vec<PortableItem> {
        let buckets = self.buckets.lock().unwrap();
        buckets
            .iter()
            .flat_map(|(bucket, objects)| {
                objects.iter().map(move |(key, bytes)| PortableItem {
                    key: format!("{}/{}", bucket, key),
                    payload: json!({ "hex": hex::encode(bytes) }),
                })
            })
            .collect()
    }
}

#[async_trait]
impl ProviderAdapter for MemObjectStore {
    async fn probe(&self) -> BackplaneResult<()> {
        self.faults.gate_probe().await
    }

    async fn item_count(&self) -> BackplaneResult<u64> {
        self.faults.gate_op().await?;
        let buckets = self.buckets.lock().unwrap();
        Ok(buckets.values().map(BTreeMap::len).sum::<usize>() as u64)
    }

    async fn export(&self, cursor: Option<String>, limit: usize) -> BackplaneResult<ExportPage> {
        self.faults.gate_op().await?;
        Ok(page_from(self.all_items(), cursor, limit))
    }

    async fn import(&self, items: Vec<PortableItem>) -> BackplaneResult<u64> {
        self.faults.gate_op().await?;
        let mut buckets = self.buckets.lock().unwrap();
        let mut imported = 0u64;
        for item in items {
            let (bucket, key) = split_key(&item.key)?;
            let encoded = item.payload["hex"]
                .as_str()
                .ok_or_else(|| bad_payload(&item.key))?;
            let bytes = hex::decode(encoded)
                .map_err(|e| BackplaneError::Adapter(format!("bad object payload: {}", e)))?;
            buckets
                .entry(bucket.to_string())
                .or_default()
                .insert(key.to_string(), bytes);
            imported += 1;
        }
        Ok(imported)
    }

    async fn checksum(&self, spec: &ChecksumSpec) -> BackplaneResult<String> {
        self.faults.gate_op().await?;
        checksum_items(&self.all_items(), spec)
    }

    async fn purge(&self) -> BackplaneResult<()> {
        self.faults.gate_op().await?;
        self.buckets.lock().unwrap().clear();
        Ok(())
    }
}

#[async_trait]
impl StorageAdapter for MemObjectStore {
    async fn upload(&self, bucket: &str, key: &str, bytes: Vec<u8>) -> BackplaneResult<ObjectInfo> {
        self.faults.gate_op().await?;
        let size = bytes.len() as u64;
        let mut buckets = self.buckets.lock().unwrap();
        buckets
            .entry(bucket.to_string())
            .or_default()
            .insert(key.to_string(), bytes);
        Ok(ObjectInfo {
            bucket: bucket.to_string(),
            key: key.to_string(),
            size,
        })
    }

    async fn download(&self, bucket: &str, key: &str) -> BackplaneResult<Option<Vec<u8>>> {
        self.faults.gate_op().await?;
        let buckets = self.buckets.lock().unwrap();
        Ok(buckets
            .get(bucket)
            .and_then(|objects| objects.get(key))
            .cloned())
    }

    async fn remove(&self, bucket: &str, key: &str) -> BackplaneResult<bool> {
        self.faults.gate_op().await?;
        let mut buckets = self.buckets.lock().unwrap();
        Ok(buckets
            .get_mut(bucket)
            .map(|objects| objects.remove(key).is_some())
            .unwrap_or(false))
    }

    async fn list(&self, bucket: &str, prefix: &str) -> BackplaneResult<Vec<ObjectInfo>> {
        self.faults.gate_op().await?;
        let buckets = self.buckets.lock().unwrap();
        let Some(objects) = buckets.get(bucket) else {
            return Ok(Vec::new());
        };
        Ok(objects
            .iter()
            .filter(|(key, _)| key.starts_with(prefix))
            .map(|(key, bytes)| ObjectInfo {
                bucket: bucket.to_string(),
                key: key.clone(),
                size: bytes.len() as u64,
            })
            .collect())
    }
}

// ---------------------------------------------------------------------------
// Realtime
// ---------------------------------------------------------------------------

/// In-memory publish/subscribe hub with retained message history.
///
/// The retained history is the migratable state; live subscriptions are
/// bound to this instance and are not exported.
#[derive(Clone, Default)]
pub struct MemRealtime {
    retained: Arc<Mutex<BTreeMap<String, Vec<Value>>>>,
    subscribers: Arc<Mutex<HashMap<String, Vec<UnboundedSender<ChannelMessage>>>>>,
    sequence: Arc<AtomicU64>,
    faults: MemFaults,
}

impl MemRealtime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn faults(&self) -> &MemFaults {
        &self.faults
    }

    fn all_items(&self) -> Vec<PortableItem> {
        let retained = self.retained.lock().unwrap();
        retained
            .iter()
            .flat_map(|(channel, messages)| {
                messages
                    .iter()
                    .enumerate()
                    .map(move |(index, payload)| PortableItem {
                        key: format!("{}/{:08}", channel, index),
                        payload: payload.clone(),
                    })
            })
            .collect()
    }
}

#[async_trait]
impl ProviderAdapter for MemRealtime {
    async fn probe(&self) -> BackplaneResult<()> {
        self.faults.gate_probe().await
    }

    async fn item_count(&self) -> BackplaneResult<u64> {
        self.faults.gate_op().await?;
        let retained = self.retained.lock().unwrap();
        Ok(retained.values().map(Vec::len).sum::<usize>() as u64)
    }

    async fn export(&self, cursor: Option<String>, limit: usize) -> BackplaneResult<ExportPage> {
        self.faults.gate_op().await?;
        Ok(page_from(self.all_items(), cursor, limit))
    }

    async fn import(&self, items: Vec<PortableItem>) -> BackplaneResult<u64> {
        self.faults.gate_op().await?;
        let mut retained = self.retained.lock().unwrap();
        let mut imported = 0u64;
        // Items arrive in key order, so per-channel message order survives.
        for item in items {
            let (channel, _) = split_key(&item.key)?;
            retained
                .entry(channel.to_string())
                .or_default()
                .push(item.payload);
            imported += 1;
        }
        Ok(imported)
    }

    async fn checksum(&self, spec: &ChecksumSpec) -> BackplaneResult<String> {
        self.faults.gate_op().await?;
        checksum_items(&self.all_items(), spec)
    }

    async fn purge(&self) -> BackplaneResult<()> {
        self.faults.gate_op().await?;
        self.retained.lock().unwrap().clear();
        Ok(())
    }
}

#[async_trait]
impl RealtimeAdapter for MemRealtime {
    async fn publish(&self, channel: &str, payload: Value) -> BackplaneResult<u64> {
        self.faults.gate_op().await?;
        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        self.retained
            .lock()
            .unwrap()
            .entry(channel.to_string())
            .or_default()
            .push(payload.clone());

        let message = ChannelMessage {
            channel: channel.to_string(),
            sequence,
            payload,
        };
        let mut subscribers = self.subscribers.lock().unwrap();
        let delivered = match subscribers.get_mut(channel) {
            Some(senders) => {
                senders.retain(|tx| tx.send(message.clone()).is_ok());
                senders.len() as u64
            }
            None => 0,
        };
        Ok(delivered)
    }

    async fn subscribe(
        &self,
        channel: &str,
    ) -> BackplaneResult<UnboundedReceiver<ChannelMessage>> {
        self.faults.gate_op().await?;
        let (tx, rx) = unbounded_channel();
        self.subscribers
            .lock()
            .unwrap()
            .entry(channel.to_string())
            .or_default()
            .push(tx);
        Ok(rx)
    }
}

// ---------------------------------------------------------------------------
// Edge functions
// ---------------------------------------------------------------------------

/// In-memory serverless function host.
///
/// Functions are JSON definitions rather than code: a definition with a
/// `"result"` field returns it verbatim, `{"echo": true}` returns the call
/// payload, anything else echoes name and input. Enough behavior to route
/// and migrate deployments without a real runtime.
#[derive(Clone, Default)]
pub struct MemFunctions {
    functions: Arc<Mutex<BTreeMap<String, Value>>>,
    faults: MemFaults,
}

impl MemFunctions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn faults(&self) -> &MemFaults {
        &self.faults
    }

    /// Deploy a function definition (setup helper; deployment surfaces are
    /// provider tooling, not a core operation).
    pub fn define(&self, name: &str, definition: Value) {
        self.functions
            .lock()
            .unwrap()
            .insert(name.to_string(), definition);
    }

    fn all_items(&self) -> Vec<PortableItem> {
        let functions = self.functions.lock().unwrap();
        functions
            .iter()
            .map(|(name, definition)| PortableItem {
                key: format!("fn/{}", name),
                payload: definition.clone(),
            })
            .collect()
    }
}

#[async_trait]
impl ProviderAdapter for MemFunctions {
    async fn probe(&self) -> BackplaneResult<()> {
        self.faults.gate_probe().await
    }

    async fn item_count(&self) -> BackplaneResult<u64> {
        self.faults.gate_op().await?;
        Ok(self.functions.lock().unwrap().len() as u64)
    }

    async fn export(&self, cursor: Option<String>, limit: usize) -> BackplaneResult<ExportPage> {
        self.faults.gate_op().await?;
        Ok(page_from(self.all_items(), cursor, limit))
    }

    async fn import(&self, items: Vec<PortableItem>) -> BackplaneResult<u64> {
        self.faults.gate_op().await?;
        let mut functions = self.functions.lock().unwrap();
        let mut imported = 0u64;
        for item in items {
            let (kind, name) = split_key(&item.key)?;
            if kind != "fn" {
                return Err(BackplaneError::Adapter(format!(
                    "unexpected portable key '{}'",
                    item.key
                )));
            }
            functions.insert(name.to_string(), item.payload);
            imported += 1;
        }
        Ok(imported)
    }

    async fn checksum(&self, spec: &ChecksumSpec) -> BackplaneResult<String> {
        self.faults.gate_op().await?;
        checksum_items(&self.all_items(), spec)
    }

    async fn purge(&self) -> BackplaneResult<()> {
        self.faults.gate_op().await?;
        self.functions.lock().unwrap().clear();
        Ok(())
    }
}

#[async_trait]
impl EdgeFunctionAdapter for MemFunctions {
    async fn invoke(&self, name: &str, payload: Value) -> BackplaneResult<Value> {
        self.faults.gate_op().await?;
        let definition = {
            let functions = self.functions.lock().unwrap();
            functions.get(name).cloned()
        };
        let Some(definition) = definition else {
            return Err(BackplaneError::Adapter(format!(
                "unknown function '{}'",
                name
            )));
        };
        if let Some(result) = definition.get("result") {
            return Ok(result.clone());
        }
        if definition.get("echo") == Some(&Value::Bool(true)) {
            return Ok(payload);
        }
        Ok(json!({ "function": name, "input": payload }))
    }
}
