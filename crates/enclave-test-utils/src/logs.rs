//! Helpers that play the enclave's side of an enclave log.

use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, SecondsFormat, Utc};

use enclave_core::{
    MemoryBackend, MemoryObjectStore, ObjectStoreProvider, StorageBackend, StorageRegistry,
};
use enclave_flow::event::TaskEvent;

/// Alias the workflow resolves enclave logs under by default.
pub const LOG_ALIAS: &str = "dedis";

/// Registry with a single in-memory provider under [`LOG_ALIAS`].
pub fn memory_registry(store: &Arc<MemoryObjectStore>) -> StorageRegistry {
    let provider: Arc<dyn ObjectStoreProvider> = Arc::clone(store) as Arc<dyn ObjectStoreProvider>;
    StorageRegistry::new().with_provider(LOG_ALIAS, provider)
}

/// Encodes a log object the way an enclave writes it.
pub fn log_object(kind: &str, time: DateTime<Utc>, message: &str) -> Bytes {
    let body = serde_json::json!({
        "type": kind,
        "time": time.to_rfc3339_opts(SecondsFormat::Millis, true),
        "message": message,
        "details": "",
        "source": "enclave",
    });
    Bytes::from(serde_json::to_vec(&body).expect("log object encodes"))
}

/// Writes one event under `{prefix}/{name}.json`.
pub async fn write_log_event(backend: &MemoryBackend, prefix: &str, name: &str, event: &TaskEvent) {
    let body = Bytes::from(serde_json::to_vec(event).expect("event encodes"));
    let path = format!("{}/{name}.json", prefix.trim_end_matches('/'));
    backend.put(&path, body).await.expect("log object written");
}
