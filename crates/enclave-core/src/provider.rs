//! Multi-bucket object storage providers and creation watches.
//!
//! A remote enclave appends its log objects to a bucket named after its
//! project. The orchestrator needs three things from the storage deployment
//! behind an alias:
//!
//! - whether a bucket exists yet (the enclave creates it while booting)
//! - a [`StorageBackend`] bound to that bucket
//! - a watch yielding metadata of objects created under a prefix
//!
//! [`StorageRegistry`] maps alias names (e.g. `dedis`) to providers and is
//! injected wherever a component has to reach a deployment by alias.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc};

use crate::error::{Error, Result};
use crate::storage::{MemoryBackend, ObjectMeta, ObjectStoreBackend, StorageBackend};

/// Buffer of pending notifications per watch.
const WATCH_BUFFER: usize = 256;

/// Default interval between listings for providers without push notifications.
pub const DEFAULT_WATCH_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Stream of metadata for objects created under a watched prefix.
///
/// Yields `Err` once if the underlying transport fails; the watch is finished
/// afterwards. Dropping the watch stops the background forwarder.
#[derive(Debug)]
pub struct ObjectWatch {
    rx: mpsc::Receiver<Result<ObjectMeta>>,
}

impl ObjectWatch {
    /// Creates a watch and the sender its producer pushes into.
    #[must_use]
    pub fn channel() -> (mpsc::Sender<Result<ObjectMeta>>, Self) {
        let (tx, rx) = mpsc::channel(WATCH_BUFFER);
        (tx, Self { rx })
    }

    /// Waits for the next created object.
    ///
    /// Returns `None` when the producer has stopped.
    pub async fn next(&mut self) -> Option<Result<ObjectMeta>> {
        self.rx.recv().await
    }
}

fn matches_filter(meta: &ObjectMeta, prefix: &str, suffix: &str) -> bool {
    meta.path.starts_with(prefix) && meta.path.ends_with(suffix)
}

/// A storage deployment holding many buckets.
#[async_trait]
pub trait ObjectStoreProvider: Send + Sync + 'static {
    /// Returns true if the bucket exists.
    async fn bucket_exists(&self, bucket: &str) -> Result<bool>;

    /// Returns a backend bound to an existing bucket.
    async fn bucket(&self, bucket: &str) -> Result<Arc<dyn StorageBackend>>;

    /// Watches for objects created in `bucket` whose path starts with `prefix`
    /// and ends with `suffix`.
    ///
    /// Objects existing when the watch is established are not reported.
    async fn watch_created(&self, bucket: &str, prefix: &str, suffix: &str)
    -> Result<ObjectWatch>;
}

/// In-memory multi-bucket provider with push notifications.
#[derive(Debug, Default)]
pub struct MemoryObjectStore {
    buckets: RwLock<HashMap<String, Arc<MemoryBackend>>>,
}

impl MemoryObjectStore {
    /// Creates an empty provider.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a bucket, returning the existing one if already present.
    ///
    /// # Errors
    ///
    /// Returns an error if the bucket table lock is poisoned.
    pub fn create_bucket(&self, bucket: &str) -> Result<Arc<MemoryBackend>> {
        let mut buckets = self.buckets.write().map_err(|_| Error::Internal {
            message: "bucket table lock poisoned".into(),
        })?;
        Ok(Arc::clone(
            buckets
                .entry(bucket.to_string())
                .or_insert_with(|| Arc::new(MemoryBackend::new())),
        ))
    }

    fn lookup(&self, bucket: &str) -> Result<Option<Arc<MemoryBackend>>> {
        let buckets = self.buckets.read().map_err(|_| Error::Internal {
            message: "bucket table lock poisoned".into(),
        })?;
        Ok(buckets.get(bucket).cloned())
    }
}

#[async_trait]
impl ObjectStoreProvider for MemoryObjectStore {
    async fn bucket_exists(&self, bucket: &str) -> Result<bool> {
        Ok(self.lookup(bucket)?.is_some())
    }

    async fn bucket(&self, bucket: &str) -> Result<Arc<dyn StorageBackend>> {
        let backend = self
            .lookup(bucket)?
            .ok_or_else(|| Error::missing_bucket(bucket))?;
        Ok(backend)
    }

    async fn watch_created(
        &self,
        bucket: &str,
        prefix: &str,
        suffix: &str,
    ) -> Result<ObjectWatch> {
        let backend = self
            .lookup(bucket)?
            .ok_or_else(|| Error::missing_bucket(bucket))?;

        // Subscribe before returning so no write after this call is missed.
        let mut created = backend.subscribe_created();
        let (tx, watch) = ObjectWatch::channel();
        let prefix = prefix.to_string();
        let suffix = suffix.to_string();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = tx.closed() => return,
                    received = created.recv() => match received {
                        Ok(meta) => {
                            if matches_filter(&meta, &prefix, &suffix)
                                && tx.send(Ok(meta)).await.is_err()
                            {
                                return;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(missed)) => {
                            let _ = tx
                                .send(Err(Error::storage(format!(
                                    "creation watch lagged, {missed} notifications lost"
                                ))))
                                .await;
                            return;
                        }
                        Err(broadcast::error::RecvError::Closed) => return,
                    },
                }
            }
        });

        Ok(watch)
    }
}

/// S3-compatible provider (AWS or MinIO) addressed by one endpoint.
///
/// S3 offers no portable push notification, so creation watches are served
/// by listing the prefix every `poll_interval` and reporting unseen paths.
pub struct S3ObjectStore {
    endpoint: Option<String>,
    poll_interval: Duration,
    buckets: RwLock<HashMap<String, Arc<ObjectStoreBackend>>>,
}

impl std::fmt::Debug for S3ObjectStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3ObjectStore")
            .field("endpoint", &self.endpoint)
            .field("poll_interval", &self.poll_interval)
            .finish_non_exhaustive()
    }
}

impl S3ObjectStore {
    /// Creates a provider for the given endpoint (`None` means AWS).
    #[must_use]
    pub fn new(endpoint: Option<String>) -> Self {
        Self {
            endpoint,
            poll_interval: DEFAULT_WATCH_POLL_INTERVAL,
            buckets: RwLock::new(HashMap::new()),
        }
    }

    /// Overrides the listing interval used by creation watches.
    #[must_use]
    pub const fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    fn backend(&self, bucket: &str) -> Result<Arc<ObjectStoreBackend>> {
        if let Some(existing) = self
            .buckets
            .read()
            .map_err(|_| Error::Internal {
                message: "bucket cache lock poisoned".into(),
            })?
            .get(bucket)
        {
            return Ok(Arc::clone(existing));
        }

        let backend = Arc::new(ObjectStoreBackend::s3(bucket, self.endpoint.as_deref())?);
        self.buckets
            .write()
            .map_err(|_| Error::Internal {
                message: "bucket cache lock poisoned".into(),
            })?
            .insert(bucket.to_string(), Arc::clone(&backend));
        Ok(backend)
    }
}

#[async_trait]
impl ObjectStoreProvider for S3ObjectStore {
    async fn bucket_exists(&self, bucket: &str) -> Result<bool> {
        self.backend(bucket)?.bucket_exists().await
    }

    async fn bucket(&self, bucket: &str) -> Result<Arc<dyn StorageBackend>> {
        let backend = self.backend(bucket)?;
        Ok(backend)
    }

    async fn watch_created(
        &self,
        bucket: &str,
        prefix: &str,
        suffix: &str,
    ) -> Result<ObjectWatch> {
        let backend: Arc<dyn StorageBackend> = self.backend(bucket)?;
        poll_watch(backend, prefix, suffix, self.poll_interval).await
    }
}

/// Emulates a creation watch by periodically listing `prefix`.
///
/// The initial listing happens before this returns; only objects that appear
/// in later listings are reported, oldest first.
///
/// # Errors
///
/// Returns an error if the initial listing fails.
pub async fn poll_watch(
    backend: Arc<dyn StorageBackend>,
    prefix: &str,
    suffix: &str,
    poll_interval: Duration,
) -> Result<ObjectWatch> {
    let mut seen: HashSet<String> = backend
        .list(prefix)
        .await?
        .into_iter()
        .map(|meta| meta.path)
        .collect();

    let (tx, watch) = ObjectWatch::channel();
    let prefix = prefix.to_string();
    let suffix = suffix.to_string();

    tokio::spawn(async move {
        loop {
            tokio::select! {
                () = tx.closed() => return,
                () = tokio::time::sleep(poll_interval) => {}
            }

            let listed = match backend.list(&prefix).await {
                Ok(listed) => listed,
                Err(e) => {
                    let _ = tx.send(Err(e)).await;
                    return;
                }
            };

            let mut fresh: Vec<ObjectMeta> = listed
                .into_iter()
                .filter(|meta| matches_filter(meta, &prefix, &suffix))
                .filter(|meta| !seen.contains(&meta.path))
                .collect();
            fresh.sort_by(|a, b| {
                a.last_modified
                    .cmp(&b.last_modified)
                    .then_with(|| a.path.cmp(&b.path))
            });

            for meta in fresh {
                seen.insert(meta.path.clone());
                if tx.send(Ok(meta)).await.is_err() {
                    return;
                }
            }
        }
    });

    Ok(watch)
}

/// Registry of storage deployments keyed by alias.
#[derive(Clone, Default)]
pub struct StorageRegistry {
    providers: HashMap<String, Arc<dyn ObjectStoreProvider>>,
}

impl std::fmt::Debug for StorageRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut aliases: Vec<_> = self.providers.keys().collect();
        aliases.sort();
        f.debug_struct("StorageRegistry")
            .field("aliases", &aliases)
            .finish()
    }
}

impl StorageRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a provider under `alias`, replacing any previous one.
    #[must_use]
    pub fn with_provider(
        mut self,
        alias: impl Into<String>,
        provider: Arc<dyn ObjectStoreProvider>,
    ) -> Self {
        self.providers.insert(alias.into(), provider);
        self
    }

    /// Resolves the provider registered under `alias`.
    ///
    /// # Errors
    ///
    /// Returns `Error::UnknownAlias` for an unregistered alias.
    pub fn resolve(&self, alias: &str) -> Result<Arc<dyn ObjectStoreProvider>> {
        self.providers
            .get(alias)
            .cloned()
            .ok_or_else(|| Error::UnknownAlias {
                alias: alias.to_string(),
            })
    }
}
