pub mod memory;

#[cfg(feature = "bpf")]
pub mod bpf;

use thiserror::Error;

use crate::report::{MemCounters, MemKey};

/// Failure to read the accumulator. The current tick emits nothing.
#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("iterating accumulator map: {0}")]
    Iterate(String),
}

/// Entries copied out of the accumulator during one drain.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    pub entries: Vec<(MemKey, MemCounters)>,
    /// Keys that could not be removed and will be observed again.
    pub delete_failures: usize,
}

impl Snapshot {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Source of per-process allocation counters.
///
/// A snapshot copies every entry first and only then removes the observed
/// keys, so counts added during the copy are kept for the next drain.
pub trait Accumulator: Send {
    fn snapshot(&mut self) -> Result<Snapshot, SnapshotError>;
}
