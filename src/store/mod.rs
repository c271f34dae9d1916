//! Document store abstraction and backends.

pub mod auth;
pub mod firestore;
pub mod memory;
pub mod path;

use std::future::Future;

use anyhow::Context;
use thiserror::Error;

use crate::config::{StoreBackend, StoreConfig};
use crate::report::Report;

pub use self::firestore::FirestoreStore;
pub use self::memory::MemoryStore;
pub use self::path::{DocumentPath, PathError};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("invalid document path: {0}")]
    Path(#[from] PathError),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("store returned {status}: {message}")]
    Status { status: u16, message: String },

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// A hierarchical document store with create-or-overwrite writes.
pub trait DocumentStore: Send + Sync {
    /// Backend name for logging.
    fn name(&self) -> &str;

    /// Create or overwrite the document at `path` with `report`.
    fn set(
        &self,
        path: &DocumentPath,
        report: &Report,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;
}

/// Store dispatches writes to the configured backend.
///
/// Uses enum dispatch rather than trait objects so `set` stays a plain
/// `impl Future` on the hot path.
pub enum Store {
    Firestore(FirestoreStore),
    Memory(MemoryStore),
}

impl Store {
    /// Initialize the configured backend.
    pub fn from_config(cfg: &StoreConfig) -> anyhow::Result<Self> {
        match cfg.backend {
            StoreBackend::Firestore => Ok(Self::Firestore(
                FirestoreStore::from_config(&cfg.firestore).context("initializing Firestore")?,
            )),
            StoreBackend::Memory => {
                tracing::warn!("using in-memory document store, data is not durable");
                Ok(Self::Memory(MemoryStore::new()))
            }
        }
    }
}

impl DocumentStore for Store {
    fn name(&self) -> &str {
        match self {
            Self::Firestore(s) => s.name(),
            Self::Memory(s) => s.name(),
        }
    }

    async fn set(&self, path: &DocumentPath, report: &Report) -> Result<(), StoreError> {
        match self {
            Self::Firestore(s) => s.set(path, report).await,
            Self::Memory(s) => s.set(path, report).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FirestoreConfig;

    #[tokio::test]
    async fn test_memory_backend_from_config() {
        let cfg = StoreConfig {
            backend: StoreBackend::Memory,
            ..Default::default()
        };
        let store = Store::from_config(&cfg).expect("store");
        assert_eq!(store.name(), "memory");

        let path = path::latest_snapshot_path("host-a").expect("path");
        store
            .set(&path, &Report::heartbeat("host-a", 1))
            .await
            .expect("set");
        match store {
            Store::Memory(mem) => assert_eq!(mem.len(), 1),
            Store::Firestore(_) => panic!("expected memory backend"),
        }
    }

    #[test]
    fn test_firestore_missing_credentials_fails() {
        let cfg = StoreConfig {
            backend: StoreBackend::Firestore,
            firestore: FirestoreConfig {
                credentials_path: "/nonexistent/key.json".into(),
                ..Default::default()
            },
        };
        assert!(Store::from_config(&cfg).is_err());
    }
}
