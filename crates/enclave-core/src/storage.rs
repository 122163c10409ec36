//! Storage backend abstraction for a single object storage bucket.
//!
//! The contract covers what the orchestrator needs from a bucket:
//! - Whole-object reads and overwriting writes
//! - Object metadata including `last_modified`, which is how "most recent" is decided
//! - Prefix listing, since log object names are opaque and discovered by listing

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use object_store::path::Path as ObjectPath;
use object_store::{ObjectStore, PutPayload};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tokio::sync::broadcast;

use crate::error::{Error, Result};

/// Capacity of the creation notification channel of a [`MemoryBackend`].
const NOTIFICATION_CAPACITY: usize = 1024;

/// Metadata about a stored object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectMeta {
    /// Object path (key).
    pub path: String,
    /// Object size in bytes.
    pub size: u64,
    /// Last modification timestamp.
    pub last_modified: Option<DateTime<Utc>>,
}

/// Storage backend trait for one bucket.
#[async_trait]
pub trait StorageBackend: Send + Sync + 'static {
    /// Reads entire object.
    ///
    /// Returns `Error::NotFound` if object doesn't exist.
    async fn get(&self, path: &str) -> Result<Bytes>;

    /// Writes an object, replacing any previous content.
    async fn put(&self, path: &str, data: Bytes) -> Result<()>;

    /// Lists objects with the given prefix.
    ///
    /// **Ordering**: Results are returned in arbitrary order. Callers requiring
    /// deterministic order should sort the results.
    async fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>>;
}

/// In-memory storage backend for tests and local development.
///
/// Thread-safe via `RwLock`. Every successful write is also published on a
/// broadcast channel so in-memory providers can offer creation watches.
#[derive(Debug)]
pub struct MemoryBackend {
    objects: Arc<RwLock<HashMap<String, StoredObject>>>,
    created: broadcast::Sender<ObjectMeta>,
}

#[derive(Debug, Clone)]
struct StoredObject {
    data: Bytes,
    last_modified: DateTime<Utc>,
}

impl StoredObject {
    fn meta(&self, path: &str) -> ObjectMeta {
        ObjectMeta {
            path: path.to_string(),
            size: self.data.len() as u64,
            last_modified: Some(self.last_modified),
        }
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        let (created, _) = broadcast::channel(NOTIFICATION_CAPACITY);
        Self {
            objects: Arc::default(),
            created,
        }
    }
}

fn poisoned<T>(_: std::sync::PoisonError<T>) -> Error {
    Error::Internal {
        message: "lock poisoned".into(),
    }
}

impl MemoryBackend {
    /// Creates a new empty memory backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribes to metadata of every object written from now on.
    #[must_use]
    pub fn subscribe_created(&self) -> broadcast::Receiver<ObjectMeta> {
        self.created.subscribe()
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    async fn get(&self, path: &str) -> Result<Bytes> {
        let objects = self.objects.read().map_err(poisoned)?;

        objects
            .get(path)
            .map(|o| o.data.clone())
            .ok_or_else(|| Error::NotFound(format!("object not found: {path}")))
    }

    async fn put(&self, path: &str, data: Bytes) -> Result<()> {
        let stored = StoredObject {
            data,
            last_modified: Utc::now(),
        };
        let meta = stored.meta(path);
        self.objects
            .write()
            .map_err(poisoned)?
            .insert(path.to_string(), stored);

        // No receivers is the common case outside watches.
        let _ = self.created.send(meta);
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>> {
        let objects = self.objects.read().map_err(poisoned)?;

        Ok(objects
            .iter()
            .filter(|(k, _)| k.starts_with(prefix))
            .map(|(path, obj)| obj.meta(path))
            .collect())
    }
}

/// Storage backend over any `object_store` implementation (S3, MinIO, GCS).
#[derive(Clone)]
pub struct ObjectStoreBackend {
    store: Arc<dyn ObjectStore>,
    bucket: String,
}

impl std::fmt::Debug for ObjectStoreBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectStoreBackend")
            .field("bucket", &self.bucket)
            .finish_non_exhaustive()
    }
}

impl ObjectStoreBackend {
    /// Wraps an existing `object_store` client bound to `bucket`.
    #[must_use]
    pub fn new(store: Arc<dyn ObjectStore>, bucket: impl Into<String>) -> Self {
        Self {
            store,
            bucket: bucket.into(),
        }
    }

    /// Builds an S3-compatible backend for `bucket`.
    ///
    /// Credentials and region come from the standard `AWS_*` environment
    /// variables. A custom `endpoint` (e.g. a MinIO deployment) switches to
    /// path-style requests and allows plain HTTP.
    ///
    /// # Errors
    ///
    /// Returns an error if the client cannot be configured.
    pub fn s3(bucket: &str, endpoint: Option<&str>) -> Result<Self> {
        let mut builder = object_store::aws::AmazonS3Builder::from_env().with_bucket_name(bucket);
        if let Some(endpoint) = endpoint {
            builder = builder
                .with_endpoint(endpoint)
                .with_allow_http(true)
                .with_virtual_hosted_style_request(false);
        }
        let store = builder
            .build()
            .map_err(|e| Error::storage_with_source(format!("invalid S3 bucket {bucket}"), e))?;
        Ok(Self::new(Arc::new(store), bucket))
    }

    /// Returns the bucket this backend is bound to.
    #[must_use]
    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    /// Returns true if the bucket can be listed.
    ///
    /// # Errors
    ///
    /// Returns an error for failures other than a missing bucket.
    pub async fn bucket_exists(&self) -> Result<bool> {
        match self.store.list_with_delimiter(None).await {
            Ok(_) => Ok(true),
            Err(object_store::Error::NotFound { .. }) => Ok(false),
            Err(e) => Err(Error::storage_with_source(
                format!("failed to probe bucket {}", self.bucket),
                e,
            )),
        }
    }

    fn meta(meta: object_store::ObjectMeta) -> ObjectMeta {
        ObjectMeta {
            path: meta.location.to_string(),
            size: u64::try_from(meta.size).unwrap_or(u64::MAX),
            last_modified: Some(meta.last_modified),
        }
    }
}

#[async_trait]
impl StorageBackend for ObjectStoreBackend {
    async fn get(&self, path: &str) -> Result<Bytes> {
        let location = ObjectPath::from(path);
        let result = self.store.get(&location).await.map_err(|e| match e {
            object_store::Error::NotFound { .. } => {
                Error::NotFound(format!("object not found: {path}"))
            }
            other => Error::storage_with_source(format!("failed to get {path}"), other),
        })?;
        result
            .bytes()
            .await
            .map_err(|e| Error::storage_with_source(format!("failed to read {path}"), e))
    }

    async fn put(&self, path: &str, data: Bytes) -> Result<()> {
        self.store
            .put(&ObjectPath::from(path), PutPayload::from(data))
            .await
            .map(|_| ())
            .map_err(|e| Error::storage_with_source(format!("failed to put {path}"), e))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>> {
        let prefix_path = ObjectPath::from(prefix);
        let objects: Vec<object_store::ObjectMeta> = self
            .store
            .list(Some(&prefix_path))
            .try_collect()
            .await
            .map_err(|e| Error::storage_with_source(format!("failed to list {prefix}"), e))?;
        Ok(objects.into_iter().map(Self::meta).collect())
    }
}
