use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use super::{Accumulator, Snapshot, SnapshotError};
use crate::report::{MemCounters, MemKey};

/// Process-local accumulator with the same drain semantics as the kernel map.
///
/// Clones share state, so a test can keep one handle for recording while the
/// agent owns another.
#[derive(Debug, Clone, Default)]
pub struct InMemoryAccumulator {
    entries: Arc<Mutex<BTreeMap<MemKey, MemCounters>>>,
    fail_next: Arc<AtomicBool>,
}

impl InMemoryAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_alloc(&self, pid: u32, command_name: &str, bytes: u64) {
        let mut entries = self.entries.lock();
        let counters = entries
            .entry(MemKey::new(pid, command_name))
            .or_default();
        counters.allocated_bytes = counters.allocated_bytes.saturating_add(bytes);
    }

    pub fn record_free(&self, pid: u32, command_name: &str, bytes: u64) {
        let mut entries = self.entries.lock();
        let counters = entries
            .entry(MemKey::new(pid, command_name))
            .or_default();
        counters.freed_bytes = counters.freed_bytes.saturating_add(bytes);
    }

    /// Make the next snapshot fail without draining.
    pub fn fail_next_snapshot(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl Accumulator for InMemoryAccumulator {
    fn snapshot(&mut self) -> Result<Snapshot, SnapshotError> {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(SnapshotError::Iterate("injected failure".to_string()));
        }

        let entries: Vec<(MemKey, MemCounters)> = {
            let map = self.entries.lock();
            map.iter().map(|(k, v)| (k.clone(), *v)).collect()
        };

        let mut map = self.entries.lock();
        for (key, _) in &entries {
            map.remove(key);
        }

        Ok(Snapshot {
            entries,
            delete_failures: 0,
        })
    }
}
