use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info, warn};

use super::queue::IngestReceiver;
use crate::export::health::HealthMetrics;
use crate::report::Report;
use crate::store::path::{latest_snapshot_path, report_path};
use crate::store::{DocumentPath, DocumentStore, StoreError};

const DOC_REPORT: &str = "report";
const DOC_LATEST: &str = "latest";

/// What happened to one report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistOutcome {
    /// Both the record and the latest snapshot were written.
    Stored,
    /// The record write failed; the snapshot was not attempted.
    RecordFailed,
    /// The record was written but the snapshot write failed.
    SnapshotFailed,
}

/// Single serial writer from the ingest queue into the document store.
pub struct Persister<S> {
    store: S,
    health: Arc<HealthMetrics>,
}

impl<S: DocumentStore> Persister<S> {
    pub fn new(store: S, health: Arc<HealthMetrics>) -> Self {
        Self { store, health }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Consume until the queue is closed and drained. Store failures never
    /// end the loop.
    pub async fn run(self, mut queue: IngestReceiver) -> S {
        info!(
            store = self.store.name(),
            capacity = queue.capacity(),
            "persister started"
        );

        let mut persisted: u64 = 0;
        while let Some(report) = queue.pop().await {
            if self.persist(&report).await == PersistOutcome::Stored {
                persisted += 1;
            }
        }

        info!(persisted, "persister stopped, queue closed");
        self.store
    }

    /// Write the record document, then the latest snapshot.
    pub async fn persist(&self, report: &Report) -> PersistOutcome {
        let record = match report_path(report) {
            Ok(path) => path,
            Err(e) => {
                self.record_error(DOC_REPORT);
                warn!(
                    system_id = %report.system_id,
                    pid = report.pid,
                    error = %e,
                    "invalid record path, report skipped",
                );
                return PersistOutcome::RecordFailed;
            }
        };

        if let Err(e) = self.write(DOC_REPORT, &record, report).await {
            warn!(path = %record, error = %e, "record write failed");
            return PersistOutcome::RecordFailed;
        }

        let latest = match latest_snapshot_path(&report.system_id) {
            Ok(path) => path,
            Err(e) => {
                self.record_error(DOC_LATEST);
                warn!(system_id = %report.system_id, error = %e, "invalid snapshot path");
                return PersistOutcome::SnapshotFailed;
            }
        };

        if let Err(e) = self.write(DOC_LATEST, &latest, report).await {
            warn!(path = %latest, error = %e, "latest snapshot write failed");
            return PersistOutcome::SnapshotFailed;
        }

        self.health.records_persisted.inc();
        debug!(path = %record, "report persisted");
        PersistOutcome::Stored
    }

    async fn write(
        &self,
        kind: &'static str,
        path: &DocumentPath,
        report: &Report,
    ) -> Result<(), StoreError> {
        let start = Instant::now();
        let result = self.store.set(path, report).await;
        self.health
            .store_write_duration
            .with_label_values(&[kind])
            .observe(start.elapsed().as_secs_f64());

        if result.is_err() {
            self.record_error(kind);
        }
        result
    }

    fn record_error(&self, kind: &str) {
        self.health
            .store_write_errors
            .with_label_values(&[kind])
            .inc();
    }
}

#[cfg(test)]
mod tests {
    use parking_lot::Mutex;

    use super::*;
    use crate::collector::queue::ingest_queue;
    use crate::store::MemoryStore;

    fn health() -> Arc<HealthMetrics> {
        Arc::new(HealthMetrics::new(":0").expect("metrics"))
    }

    fn sample() -> Report {
        Report {
            system_id: "host-a".to_string(),
            pid: 77,
            process: "leaky".to_string(),
            alloc_kb: 600,
            free_kb: 0,
            ratio: -1.0,
            leak_suspect: true,
            time_stamp: 1_700_000_000,
        }
    }

    /// Store that fails writes whose path contains a marker.
    #[derive(Default)]
    struct FlakyStore {
        fail_on: &'static str,
        writes: Mutex<Vec<String>>,
    }

    impl DocumentStore for FlakyStore {
        fn name(&self) -> &str {
            "flaky"
        }

        async fn set(&self, path: &DocumentPath, _report: &Report) -> Result<(), StoreError> {
            self.writes.lock().push(path.to_string());
            if !self.fail_on.is_empty() && path.as_str().contains(self.fail_on) {
                return Err(StoreError::Unavailable("injected".to_string()));
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_persist_writes_record_and_snapshot() {
        let persister = Persister::new(MemoryStore::new(), health());
        assert_eq!(persister.persist(&sample()).await, PersistOutcome::Stored);

        let store = persister.store();
        assert_eq!(
            store.paths(),
            vec![
                "systems/host-a/latest/snapshot".to_string(),
                "systems/host-a/reports/1700000000-host-a-77".to_string(),
            ]
        );
        assert_eq!(store.get("systems/host-a/latest/snapshot"), Some(sample()));
    }

    #[tokio::test]
    async fn test_persist_twice_is_idempotent() {
        let persister = Persister::new(MemoryStore::new(), health());
        persister.persist(&sample()).await;
        let first: Vec<_> = persister
            .store()
            .paths()
            .into_iter()
            .map(|p| (p.clone(), persister.store().get(&p)))
            .collect();

        persister.persist(&sample()).await;
        let second: Vec<_> = persister
            .store()
            .paths()
            .into_iter()
            .map(|p| (p.clone(), persister.store().get(&p)))
            .collect();

        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_record_failure_skips_snapshot() {
        let store = FlakyStore {
            fail_on: "/reports/",
            ..Default::default()
        };
        let persister = Persister::new(store, health());

        assert_eq!(
            persister.persist(&sample()).await,
            PersistOutcome::RecordFailed
        );
        assert_eq!(persister.store().writes.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_snapshot_failure_is_reported() {
        let store = FlakyStore {
            fail_on: "/latest/",
            ..Default::default()
        };
        let persister = Persister::new(store, health());

        assert_eq!(
            persister.persist(&sample()).await,
            PersistOutcome::SnapshotFailed
        );
        assert_eq!(persister.store().writes.lock().len(), 2);
    }

    #[tokio::test]
    async fn test_run_continues_after_failures_and_drains() {
        let store = FlakyStore {
            fail_on: "/reports/",
            ..Default::default()
        };
        let (tx, rx) = ingest_queue(8, None);
        for ts in 1..=3 {
            tx.push(Report {
                time_stamp: ts,
                ..sample()
            })
            .await
            .expect("push");
        }
        drop(tx);

        let store = Persister::new(store, health()).run(rx).await;
        assert_eq!(store.writes.lock().len(), 3);
    }

    #[tokio::test]
    async fn test_heartbeat_paths() {
        let persister = Persister::new(MemoryStore::new(), health());
        let hb = Report::heartbeat("host-a", 1_700_000_000);
        assert_eq!(persister.persist(&hb).await, PersistOutcome::Stored);

        let store = persister.store();
        assert_eq!(
            store.get("systems/host-a/reports/1700000000-host-a-0"),
            Some(hb.clone())
        );
        assert_eq!(store.get("systems/host-a/latest/snapshot"), Some(hb));
    }
}
