use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::StreamExt;
use tokio::io::AsyncRead;
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::queue::IngestSender;
use crate::export::health::HealthMetrics;
use crate::report::now_unix;
use crate::transport::codec::{DecodeError, DecodedLine, ReportCodec};

/// Per-connection counters, logged when the session ends.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub lines: u64,
    pub reports: u64,
    pub decode_errors: u64,
    pub rejected: u64,
}

/// Read newline-delimited report records from one peer into the queue.
///
/// Ends on peer close, stream error, queue closure, or cancellation.
pub async fn handle_session<R>(
    stream: R,
    peer: SocketAddr,
    max_line_bytes: usize,
    queue: IngestSender,
    health: Arc<HealthMetrics>,
    cancel: CancellationToken,
) -> SessionStats
where
    R: AsyncRead + Unpin,
{
    let mut frames = FramedRead::new(stream, ReportCodec::with_max_line_bytes(max_line_bytes));
    let mut stats = SessionStats::default();

    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => {
                debug!(peer = %peer, "session cancelled");
                break;
            }
            frame = frames.next() => frame,
        };

        let line = match frame {
            None => break,
            Some(Ok(line)) => line,
            Some(Err(e)) => {
                warn!(peer = %peer, error = %e, "session read error");
                break;
            }
        };
        stats.lines += 1;

        let reports = match line {
            DecodedLine::Reports(reports) => reports,
            DecodedLine::Invalid(e) => {
                stats.decode_errors += 1;
                let reason = match &e {
                    DecodeError::Json(_) => "json",
                    DecodeError::LineTooLong { .. } => "too_long",
                };
                health.decode_errors.with_label_values(&[reason]).inc();
                warn!(peer = %peer, error = %e, "invalid JSON from peer, line skipped");
                continue;
            }
        };

        let received_at = now_unix();
        for mut report in reports {
            if report.system_id.is_empty() {
                stats.rejected += 1;
                health.records_rejected.inc();
                warn!(peer = %peer, pid = report.pid, "dropping report without SystemId");
                continue;
            }

            if report.time_stamp == 0 {
                report.time_stamp = received_at;
            }

            if queue.push(report).await.is_err() {
                warn!(peer = %peer, "ingest queue closed, ending session");
                return stats;
            }
            stats.reports += 1;
            health.records_received.inc();
        }
    }

    stats
}
