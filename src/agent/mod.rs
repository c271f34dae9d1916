pub mod console;
pub mod sink;

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use self::sink::ReportSink;
use crate::classify::classify;
use crate::config::AgentConfig;
use crate::export::health::HealthMetrics;
use crate::report::{now_unix, Report};
use crate::tracer::Accumulator;
use crate::transport::TransportError;

/// Turns accumulator drains into report batches.
pub struct Sampler<A> {
    accumulator: A,
    system_id: String,
    health: Arc<HealthMetrics>,
}

impl<A: Accumulator> Sampler<A> {
    pub fn new(accumulator: A, system_id: String, health: Arc<HealthMetrics>) -> Self {
        Self {
            accumulator,
            system_id,
            health,
        }
    }

    /// Drain the accumulator and classify every entry, largest raw
    /// allocation first.
    ///
    /// An empty drain yields a single heartbeat. A failed drain yields
    /// `None` and nothing is emitted for the tick.
    pub fn build_batch(&mut self, now: i64) -> Option<Vec<Report>> {
        let mut snapshot = match self.accumulator.snapshot() {
            Ok(snapshot) => snapshot,
            Err(e) => {
                self.health.snapshot_errors.inc();
                error!(error = %e, "reading accumulator, skipping tick");
                return None;
            }
        };

        if snapshot.delete_failures > 0 {
            self.health
                .map_delete_failures
                .inc_by(snapshot.delete_failures as f64);
        }

        self.health.tracked_processes.set(snapshot.len() as f64);

        if snapshot.is_empty() {
            self.health.leak_suspects.set(0.0);
            return Some(vec![Report::heartbeat(self.system_id.clone(), now)]);
        }

        snapshot.entries.sort_by(|(ka, ca), (kb, cb)| {
            cb.allocated_bytes
                .cmp(&ca.allocated_bytes)
                .then(ka.pid.cmp(&kb.pid))
        });

        let batch: Vec<Report> = snapshot
            .entries
            .iter()
            .map(|(key, counters)| classify(key, counters, &self.system_id, now))
            .collect();

        let suspects = batch.iter().filter(|r| r.leak_suspect).count();
        self.health.leak_suspects.set(suspects as f64);
        if suspects > 0 {
            debug!(suspects, processes = batch.len(), "leak suspects this tick");
        }

        Some(batch)
    }
}

/// Agent runs the periodic sample-classify-emit loop.
pub struct Agent<A> {
    cfg: AgentConfig,
    system_id: String,
    health: Arc<HealthMetrics>,
    accumulator: Option<A>,
    cancel: CancellationToken,
    driver: Option<JoinHandle<()>>,
}

impl<A: Accumulator + 'static> Agent<A> {
    /// Creates a new Agent around a loaded accumulator.
    pub fn new(cfg: AgentConfig, system_id: String, accumulator: A) -> Result<Self> {
        let health =
            Arc::new(HealthMetrics::new(&cfg.health.addr).context("creating health metrics")?);

        Ok(Self {
            cfg,
            system_id,
            health,
            accumulator: Some(accumulator),
            cancel: CancellationToken::new(),
            driver: None,
        })
    }

    pub fn health(&self) -> Arc<HealthMetrics> {
        Arc::clone(&self.health)
    }

    pub fn system_id(&self) -> &str {
        &self.system_id
    }

    /// Start the health server and spawn the tick loop.
    ///
    /// In network mode the loop dials the collector before the first tick.
    pub async fn start(&mut self) -> Result<()> {
        if self.cfg.health.enabled {
            self.health
                .start()
                .await
                .context("starting health metrics server")?;
        }

        let accumulator = self.accumulator.take().context("agent already started")?;
        let sampler = Sampler::new(
            accumulator,
            self.system_id.clone(),
            Arc::clone(&self.health),
        );
        let sink = sink::for_mode(
            self.cfg.mode,
            self.cfg.collector.clone(),
            Arc::clone(&self.health),
        );

        info!(
            system_id = %self.system_id,
            mode = sink.name(),
            interval = ?self.cfg.interval,
            "agent started",
        );

        self.driver = Some(tokio::spawn(drive(
            sampler,
            sink,
            self.cfg.interval,
            Arc::clone(&self.health),
            self.cancel.child_token(),
        )));

        Ok(())
    }

    /// Stop ticking, close the connection, then release the accumulator.
    pub async fn stop(&mut self) -> Result<()> {
        self.cancel.cancel();

        if let Some(driver) = self.driver.take() {
            if let Err(e) = driver.await {
                error!(error = %e, "agent loop failed");
            }
        }

        self.health.stop().await?;

        Ok(())
    }
}

async fn drive<A: Accumulator>(
    mut sampler: Sampler<A>,
    mut sink: ReportSink,
    period: Duration,
    health: Arc<HealthMetrics>,
    cancel: CancellationToken,
) {
    if let ReportSink::Network(client) = &mut sink {
        info!(address = %client.address(), "connecting to collector");
        if client.connect(&cancel).await.is_err() {
            info!("shutdown before collector connection");
            return;
        }
    }

    let mut ticker = interval_at(tokio::time::Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let start = Instant::now();
                health.ticks.inc();

                if let Some(batch) = sampler.build_batch(now_unix()) {
                    if let Err(TransportError::Cancelled) = sink.emit(&batch, &health, &cancel).await {
                        break;
                    }
                }

                health.tick_duration.observe(start.elapsed().as_secs_f64());
            }
        }
    }

    sink.close().await;
    drop(sampler);
    info!("agent loop stopped");
}
