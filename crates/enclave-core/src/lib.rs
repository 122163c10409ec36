//! # enclave-core
//!
//! Core abstractions shared by every enclave orchestration component.
//!
//! This crate provides:
//!
//! - **Identifiers**: Strongly-typed IDs for tasks and projects
//! - **Storage**: A single-bucket object storage contract plus a multi-bucket
//!   provider contract with object-creation watches
//! - **Error Types**: Shared error definitions and result types
//! - **Observability**: Logging initialization and span helpers
//!
//! ## Example
//!
//! ```rust
//! use enclave_core::prelude::*;
//!
//! let task = TaskId::generate();
//! let project = ProjectUid::generate();
//! assert_ne!(task.to_string(), project.to_string());
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod error;
pub mod id;
pub mod observability;
pub mod provider;
pub mod storage;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::error::{Error, Result};
    pub use crate::id::{ProjectUid, TaskId};
    pub use crate::provider::{
        MemoryObjectStore, ObjectStoreProvider, ObjectWatch, S3ObjectStore, StorageRegistry,
    };
    pub use crate::storage::{MemoryBackend, ObjectMeta, ObjectStoreBackend, StorageBackend};
}

pub use error::{Error, Result};
pub use id::{ProjectUid, TaskId};
pub use observability::{LogFormat, init_logging};
pub use provider::{
    MemoryObjectStore, ObjectStoreProvider, ObjectWatch, S3ObjectStore, StorageRegistry,
};
pub use storage::{MemoryBackend, ObjectMeta, ObjectStoreBackend, StorageBackend};
