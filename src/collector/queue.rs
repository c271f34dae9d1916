//! Bounded FIFO between session handlers and the persister.

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::mpsc;

use crate::export::health::HealthMetrics;
use crate::report::Report;

/// Default number of reports buffered between intake and persistence.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("ingest queue closed")]
pub struct QueueClosed;

/// Producer half. Cloned into every session.
#[derive(Clone)]
pub struct IngestSender {
    tx: mpsc::Sender<Report>,
    health: Option<Arc<HealthMetrics>>,
}

/// Consumer half. Owned by the persister.
pub struct IngestReceiver {
    rx: mpsc::Receiver<Report>,
    capacity: usize,
    health: Option<Arc<HealthMetrics>>,
}

/// Create a queue holding at most `capacity` reports.
pub fn ingest_queue(
    capacity: usize,
    health: Option<Arc<HealthMetrics>>,
) -> (IngestSender, IngestReceiver) {
    let capacity = capacity.max(1);
    let (tx, rx) = mpsc::channel(capacity);

    if let Some(h) = &health {
        h.queue_capacity.set(capacity as f64);
    }

    (
        IngestSender {
            tx,
            health: health.clone(),
        },
        IngestReceiver {
            rx,
            capacity,
            health,
        },
    )
}

impl IngestSender {
    /// Enqueue, waiting while the queue is full.
    pub async fn push(&self, report: Report) -> Result<(), QueueClosed> {
        self.tx.send(report).await.map_err(|_| QueueClosed)?;
        if let Some(h) = &self.health {
            h.queue_depth.set(self.depth() as f64);
        }
        Ok(())
    }

    pub fn depth(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }
}

impl IngestReceiver {
    /// Next report in FIFO order; `None` once every sender is gone and the
    /// queue is drained.
    pub async fn pop(&mut self) -> Option<Report> {
        let report = self.rx.recv().await;
        if let Some(h) = &self.health {
            h.queue_depth.set(self.len() as f64);
        }
        report
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn test_fifo_order() {
        let (tx, mut rx) = ingest_queue(8, None);
        for ts in 1..=5 {
            tx.push(Report::heartbeat("h", ts)).await.expect("push");
        }
        assert_eq!(tx.depth(), 5);

        assert_eq!(rx.len(), 5);

        for ts in 1..=5 {
            assert_eq!(rx.pop().await.map(|r| r.time_stamp), Some(ts));
        }
        assert!(rx.is_empty());
    }

    #[tokio::test]
    async fn test_push_blocks_when_full() {
        let (tx, mut rx) = ingest_queue(2, None);
        tx.push(Report::heartbeat("h", 1)).await.expect("push");
        tx.push(Report::heartbeat("h", 2)).await.expect("push");

        let blocked =
            tokio::time::timeout(Duration::from_millis(50), tx.push(Report::heartbeat("h", 3)))
                .await;
        assert!(blocked.is_err(), "push should wait for free capacity");

        assert_eq!(rx.pop().await.map(|r| r.time_stamp), Some(1));
        tokio::time::timeout(Duration::from_secs(1), tx.push(Report::heartbeat("h", 3)))
            .await
            .expect("push after pop")
            .expect("queue open");
    }

    #[tokio::test]
    async fn test_closes_after_senders_drop() {
        let (tx, mut rx) = ingest_queue(4, None);
        tx.push(Report::heartbeat("h", 1)).await.expect("push");
        drop(tx);

        assert!(rx.pop().await.is_some());
        assert!(rx.pop().await.is_none());
    }

    #[tokio::test]
    async fn test_push_after_receiver_drop_fails() {
        let (tx, rx) = ingest_queue(4, None);
        drop(rx);
        assert_eq!(tx.push(Report::heartbeat("h", 1)).await, Err(QueueClosed));
    }
}
