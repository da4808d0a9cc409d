//! Result caching keyed by interface identity and resolved inputs.
//!
//! Two stores are provided: [`MemoryCache`] for single-process reuse and
//! [`FileCache`], which persists one record per invocation in the working
//! directory tree so an interrupted run can be resumed.

use async_trait::async_trait;
use pipecore::{Interface, Outputs};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex, PoisonError, Weak};
use thiserror::Error;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CacheError {
    #[error("IO error: {0}")]
    Io(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<std::io::Error> for CacheError {
    fn from(e: std::io::Error) -> Self {
        CacheError::Io(e.to_string())
    }
}

impl From<serde_json::Error> for CacheError {
    fn from(e: serde_json::Error) -> Self {
        CacheError::Serialization(e.to_string())
    }
}

/// Fingerprint of one invocation.
///
/// `scope` is the invocation's working directory relative to the workflow root;
/// `digest` hashes the interface identity, its fixed parameters and the resolved
/// inputs, so two invocations with the same digest compute the same thing.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheKey {
    pub scope: String,
    pub digest: String,
}

#[derive(Serialize)]
struct Fingerprint<'a> {
    interface: String,
    params: Option<&'a Outputs>,
    inputs: &'a Outputs,
}

impl CacheKey {
    pub fn compute(
        scope: impl Into<String>,
        interface: &Interface,
        inputs: &Outputs,
    ) -> Result<Self, CacheError> {
        let fingerprint = Fingerprint {
            interface: interface.fingerprint(),
            params: interface.params(),
            inputs,
        };
        let bytes = serde_json::to_vec(&fingerprint)?;
        Ok(Self {
            scope: scope.into(),
            digest: blake3::hash(&bytes).to_hex().to_string(),
        })
    }
}

/// Store of successful invocation results.
#[async_trait]
pub trait ResultCache: Send + Sync {
    async fn lookup(&self, key: &CacheKey) -> Result<Option<Outputs>, CacheError>;

    async fn store(&self, key: &CacheKey, outputs: &Outputs) -> Result<(), CacheError>;
}

/// In-memory cache. Lives as long as the runtime that owns it.
#[derive(Default)]
pub struct MemoryCache {
    entries: RwLock<HashMap<CacheKey, Outputs>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    pub async fn clear(&self) {
        self.entries.write().await.clear();
    }
}

#[async_trait]
impl ResultCache for MemoryCache {
    async fn lookup(&self, key: &CacheKey) -> Result<Option<Outputs>, CacheError> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn store(&self, key: &CacheKey, outputs: &Outputs) -> Result<(), CacheError> {
        self.entries
            .write()
            .await
            .insert(key.clone(), outputs.clone());
        Ok(())
    }
}

#[derive(Serialize, Deserialize)]
struct StoredResult {
    key: CacheKey,
    outputs: Outputs,
}

/// Durable cache writing `<root>/<scope>/_result_<digest>.json`.
pub struct FileCache {
    root: PathBuf,
}

impl FileCache {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn record_path(&self, key: &CacheKey) -> PathBuf {
        self.root
            .join(&key.scope)
            .join(format!("_result_{}.json", key.digest))
    }
}

#[async_trait]
impl ResultCache for FileCache {
    async fn lookup(&self, key: &CacheKey) -> Result<Option<Outputs>, CacheError> {
        let path = self.record_path(key);
        let raw = match tokio::fs::read(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        match serde_json::from_slice::<StoredResult>(&raw) {
            Ok(stored) if &stored.key == key => Ok(Some(stored.outputs)),
            Ok(_) => {
                tracing::warn!("Ignoring result record with mismatched key: {}", path.display());
                Ok(None)
            }
            Err(e) => {
                tracing::warn!("Ignoring unreadable result record {}: {}", path.display(), e);
                Ok(None)
            }
        }
    }

    async fn store(&self, key: &CacheKey, outputs: &Outputs) -> Result<(), CacheError> {
        let path = self.record_path(key);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let body = serde_json::to_vec_pretty(&StoredResult {
            key: key.clone(),
            outputs: outputs.clone(),
        })?;
        let staging = path.with_extension("json.tmp");
        tokio::fs::write(&staging, body).await?;
        tokio::fs::rename(&staging, &path).await?;
        Ok(())
    }
}

/// Per-key locks so that one key is computed at most once at a time.
///
/// Shared by every run on a runtime; a second requester for an in-flight key
/// waits for the first and then finds its result in the cache.
#[derive(Default)]
pub struct InFlight {
    slots: StdMutex<HashMap<CacheKey, Weak<Mutex<()>>>>,
}

impl InFlight {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(&self, key: &CacheKey) -> OwnedMutexGuard<()> {
        let slot = {
            let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
            slots.retain(|_, slot| slot.strong_count() > 0);
            match slots.get(key).and_then(Weak::upgrade) {
                Some(slot) => slot,
                None => {
                    let slot = Arc::new(Mutex::new(()));
                    slots.insert(key.clone(), Arc::downgrade(&slot));
                    slot
                }
            }
        };
        slot.lock_owned().await
    }

    pub fn in_flight(&self) -> usize {
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|slot| slot.strong_count() > 0)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pipecore::Value;

    fn inputs(x: i64) -> Outputs {
        let mut inputs = Outputs::new();
        inputs.insert("x".into(), Value::from(x));
        inputs
    }

    #[test]
    fn digest_depends_on_inputs_not_scope() {
        let a = CacheKey::compute("a", &Interface::Identity, &inputs(1)).unwrap();
        let b = CacheKey::compute("b", &Interface::Identity, &inputs(1)).unwrap();
        let c = CacheKey::compute("a", &Interface::Identity, &inputs(2)).unwrap();
        assert_eq!(a.digest, b.digest);
        assert_ne!(a, b);
        assert_ne!(a.digest, c.digest);
    }

    #[test]
    fn digest_depends_on_process_params() {
        let plain = Interface::Process {
            tool: "convert".into(),
            params: Outputs::new(),
        };
        let mut params = Outputs::new();
        params.insert("out_type".into(), Value::from("nii"));
        let with_params = Interface::Process {
            tool: "convert".into(),
            params,
        };
        let a = CacheKey::compute("n", &plain, &inputs(1)).unwrap();
        let b = CacheKey::compute("n", &with_params, &inputs(1)).unwrap();
        assert_ne!(a.digest, b.digest);
    }

    #[tokio::test]
    async fn file_cache_round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let cache = FileCache::new(dir.path());
        let key = CacheKey::compute("node/_0", &Interface::Identity, &inputs(3)).unwrap();

        assert_eq!(cache.lookup(&key).await.unwrap(), None);
        cache.store(&key, &inputs(3)).await.unwrap();
        assert!(cache.record_path(&key).exists());

        let reopened = FileCache::new(dir.path());
        assert_eq!(reopened.lookup(&key).await.unwrap(), Some(inputs(3)));
    }

    #[tokio::test]
    async fn corrupt_record_is_a_miss() {
        let dir = tempfile::tempdir().unwrap();
        let cache = FileCache::new(dir.path());
        let key = CacheKey::compute("node", &Interface::Identity, &inputs(1)).unwrap();
        let path = cache.record_path(&key);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, b"not json").unwrap();
        assert_eq!(cache.lookup(&key).await.unwrap(), None);
    }

    #[tokio::test]
    async fn in_flight_slots_are_released() {
        let flights = InFlight::new();
        let key = CacheKey::compute("n", &Interface::Identity, &inputs(1)).unwrap();
        let guard = flights.acquire(&key).await;
        assert_eq!(flights.in_flight(), 1);
        drop(guard);
        assert_eq!(flights.in_flight(), 0);
    }
}
