use std::io;
use std::sync::Arc;
use std::time::Duration;

use futures_util::SinkExt;
use rand::Rng;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_util::codec::FramedWrite;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::codec::{CodecError, ReportCodec};
use crate::config::CollectorEndpointConfig;
use crate::export::health::HealthMetrics;
use crate::report::Report;

/// Connection lifecycle of the transport client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
        }
    }
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("shutdown requested")]
    Cancelled,

    #[error("not connected to collector")]
    NotConnected,

    #[error("writing batch: {0}")]
    Write(#[source] CodecError),
}

/// Push-only TCP client for the collector.
///
/// Dial attempts repeat forever at `retry_interval` plus jitter until they
/// succeed or the cancellation token fires. A failed write drops the batch
/// and the connection.
pub struct TransportClient {
    cfg: CollectorEndpointConfig,
    conn: Option<FramedWrite<TcpStream, ReportCodec>>,
    state: ConnectionState,
    health: Option<Arc<HealthMetrics>>,
}

impl TransportClient {
    pub fn new(cfg: CollectorEndpointConfig) -> Self {
        Self {
            cfg,
            conn: None,
            state: ConnectionState::Disconnected,
            health: None,
        }
    }

    /// Attach health metrics for connection and send accounting.
    pub fn with_metrics(mut self, health: Arc<HealthMetrics>) -> Self {
        self.health = Some(health);
        self
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn address(&self) -> &str {
        &self.cfg.address
    }

    /// Dial until connected or cancelled.
    pub async fn connect(&mut self, cancel: &CancellationToken) -> Result<(), TransportError> {
        self.conn = None;
        self.set_state(ConnectionState::Connecting);

        let mut attempt: u64 = 0;
        loop {
            attempt += 1;
            if let Some(h) = &self.health {
                h.connect_attempts.inc();
            }

            let result = tokio::select! {
                _ = cancel.cancelled() => {
                    self.set_state(ConnectionState::Disconnected);
                    return Err(TransportError::Cancelled);
                }
                result = dial(&self.cfg.address, self.cfg.connect_timeout) => result,
            };

            match result {
                Ok(stream) => {
                    self.conn = Some(FramedWrite::new(stream, ReportCodec::new()));
                    self.set_state(ConnectionState::Connected);
                    info!(address = %self.cfg.address, attempt, "connected to collector");
                    return Ok(());
                }
                Err(e) => {
                    if let Some(h) = &self.health {
                        h.connect_failures.inc();
                    }
                    let delay = retry_delay(self.cfg.retry_interval, self.cfg.retry_jitter);
                    warn!(
                        address = %self.cfg.address,
                        attempt,
                        retry_in = ?delay,
                        error = %e,
                        "collector dial failed",
                    );

                    tokio::select! {
                        _ = cancel.cancelled() => {
                            self.set_state(ConnectionState::Disconnected);
                            return Err(TransportError::Cancelled);
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    /// Write one batch as a single JSON line on the current connection.
    ///
    /// A write stalled by a peer that stopped reading is abandoned when
    /// `cancel` fires; the connection is dropped with the partial line.
    pub async fn send(
        &mut self,
        reports: &[Report],
        cancel: &CancellationToken,
    ) -> Result<(), TransportError> {
        let conn = self.conn.as_mut().ok_or(TransportError::NotConnected)?;

        let result = tokio::select! {
            _ = cancel.cancelled() => Err(TransportError::Cancelled),
            result = conn.send(reports) => result.map_err(TransportError::Write),
        };

        if result.is_err() {
            self.conn = None;
            self.set_state(ConnectionState::Disconnected);
        }
        result
    }

    /// Connect if needed, send, and start reconnecting right away when the
    /// write fails. The failed batch is not retried.
    pub async fn deliver(
        &mut self,
        reports: &[Report],
        cancel: &CancellationToken,
    ) -> Result<(), TransportError> {
        if self.conn.is_none() {
            self.connect(cancel).await?;
        }

        match self.send(reports, cancel).await {
            Ok(()) => {
                if let Some(h) = &self.health {
                    h.reports_sent.inc_by(reports.len() as f64);
                }
                Ok(())
            }
            Err(TransportError::Cancelled) => {
                warn!(
                    address = %self.cfg.address,
                    reports = reports.len(),
                    "shutdown interrupted send, batch dropped",
                );
                Err(TransportError::Cancelled)
            }
            Err(e) => {
                if let Some(h) = &self.health {
                    h.send_failures.inc();
                }
                warn!(
                    address = %self.cfg.address,
                    reports = reports.len(),
                    error = %e,
                    "send failed, batch dropped; reconnecting",
                );

                match self.connect(cancel).await {
                    Ok(()) | Err(TransportError::Cancelled) => {}
                    Err(other) => debug!(error = %other, "reconnect failed"),
                }
                Err(e)
            }
        }
    }

    /// Flush and drop the connection.
    pub async fn close(&mut self) {
        if let Some(mut conn) = self.conn.take() {
            if let Err(e) = conn.close().await {
                debug!(error = %e, "closing collector connection");
            }
        }
        self.set_state(ConnectionState::Disconnected);
    }

    fn set_state(&mut self, state: ConnectionState) {
        self.state = state;
        if let Some(h) = &self.health {
            h.collector_connected
                .set(if state == ConnectionState::Connected { 1.0 } else { 0.0 });
        }
    }
}

async fn dial(address: &str, timeout: Duration) -> io::Result<TcpStream> {
    let stream = tokio::time::timeout(timeout, TcpStream::connect(address))
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "connect timed out"))??;
    stream.set_nodelay(true)?;
    Ok(stream)
}

/// Base retry interval plus a uniform random share of `jitter`.
pub fn retry_delay(base: Duration, jitter: Duration) -> Duration {
    let jitter_ms = u64::try_from(jitter.as_millis()).unwrap_or(u64::MAX);
    if jitter_ms == 0 {
        return base;
    }
    base + Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
}
