use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::console::ConsoleReporter;
use crate::config::{CollectorEndpointConfig, ReportMode};
use crate::export::health::HealthMetrics;
use crate::report::Report;
use crate::transport::{TransportClient, TransportError};

/// Destination of each tick's batch.
pub enum ReportSink {
    Network(TransportClient),
    Console(ConsoleReporter),
}

impl ReportSink {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Network(_) => "network",
            Self::Console(_) => "console",
        }
    }

    /// Emit one batch. Failures are logged and the batch is dropped.
    ///
    /// Returns `Err(TransportError::Cancelled)` only when shutdown interrupted
    /// a reconnect.
    pub async fn emit(
        &mut self,
        batch: &[Report],
        health: &HealthMetrics,
        cancel: &CancellationToken,
    ) -> Result<(), TransportError> {
        let heartbeat = is_heartbeat_batch(batch);

        match self {
            Self::Network(client) => match client.deliver(batch, cancel).await {
                Ok(()) => {
                    if heartbeat {
                        health.heartbeats.inc();
                        info!("sent heartbeat");
                    } else {
                        info!(reports = batch.len(), "sent reports");
                    }
                    Ok(())
                }
                Err(TransportError::Cancelled) => Err(TransportError::Cancelled),
                // Already logged and counted by the client.
                Err(_) => Ok(()),
            },
            Self::Console(console) => {
                if let Err(e) = console.emit(batch) {
                    warn!(error = %e, "writing console report");
                } else if heartbeat {
                    health.heartbeats.inc();
                }
                Ok(())
            }
        }
    }

    pub async fn close(&mut self) {
        if let Self::Network(client) = self {
            client.close().await;
        }
    }
}

fn is_heartbeat_batch(batch: &[Report]) -> bool {
    matches!(batch, [only] if only.is_heartbeat())
}

/// Build the sink for the configured mode.
pub fn for_mode(
    mode: ReportMode,
    endpoint: CollectorEndpointConfig,
    health: Arc<HealthMetrics>,
) -> ReportSink {
    match mode {
        ReportMode::Network => {
            ReportSink::Network(TransportClient::new(endpoint).with_metrics(health))
        }
        ReportMode::Console => ReportSink::Console(ConsoleReporter::new()),
    }
}
