use std::sync::Arc;

use dashmap::DashMap;

use super::{DocumentPath, DocumentStore, StoreError};
use crate::report::Report;

/// In-process document store. Clones share the same documents.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    docs: Arc<DashMap<String, Report>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, path: &str) -> Option<Report> {
        self.docs.get(path).map(|entry| entry.value().clone())
    }

    pub fn len(&self) -> usize {
        self.docs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.docs.is_empty()
    }

    /// Sorted paths of every stored document.
    pub fn paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = self.docs.iter().map(|e| e.key().clone()).collect();
        paths.sort_unstable();
        paths
    }
}

impl DocumentStore for MemoryStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn set(&self, path: &DocumentPath, report: &Report) -> Result<(), StoreError> {
        self.docs.insert(path.as_str().to_string(), report.clone());
        tracing::trace!(path = %path, "stored document");
        Ok(())
    }
}
