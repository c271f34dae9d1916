pub mod acceptor;
pub mod persister;
pub mod queue;
pub mod session;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use self::acceptor::Acceptor;
use self::persister::Persister;
use self::queue::ingest_queue;
use crate::config::CollectorConfig;
use crate::export::health::HealthMetrics;
use crate::store::DocumentStore;

/// Collector orchestrates the queue, the persister and the acceptor.
///
/// Shutdown order: stop accepting, end sessions, let the persister drain
/// what is already queued.
pub struct Collector<S> {
    cfg: CollectorConfig,
    health: Arc<HealthMetrics>,
    store: Option<S>,
    cancel: CancellationToken,
    local_addr: Option<SocketAddr>,
    acceptor_task: Option<JoinHandle<()>>,
    persister_task: Option<JoinHandle<S>>,
}

impl<S: DocumentStore + 'static> Collector<S> {
    /// Creates a new Collector around an initialized store client.
    pub fn new(cfg: CollectorConfig, store: S) -> Result<Self> {
        let health =
            Arc::new(HealthMetrics::new(&cfg.health.addr).context("creating health metrics")?);

        Ok(Self {
            cfg,
            health,
            store: Some(store),
            cancel: CancellationToken::new(),
            local_addr: None,
            acceptor_task: None,
            persister_task: None,
        })
    }

    pub fn health(&self) -> Arc<HealthMetrics> {
        Arc::clone(&self.health)
    }

    /// Address the acceptor is bound to, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Start the persister and the acceptor.
    pub async fn start(&mut self) -> Result<SocketAddr> {
        if self.cfg.health.enabled {
            self.health
                .start()
                .await
                .context("starting health metrics server")?;
        }

        let store = self.store.take().context("collector already started")?;
        info!(store = store.name(), "document store ready");

        // 1. Queue.
        let (tx, rx) = ingest_queue(self.cfg.queue_capacity, Some(Arc::clone(&self.health)));

        // 2. Persister.
        let persister = Persister::new(store, Arc::clone(&self.health));
        self.persister_task = Some(tokio::spawn(persister.run(rx)));

        // 3. Acceptor.
        let acceptor = Acceptor::bind(
            &self.cfg.listen_addr,
            self.cfg.max_line_bytes,
            Arc::clone(&self.health),
        )
        .await?;
        let local_addr = acceptor.local_addr();
        self.local_addr = Some(local_addr);
        self.acceptor_task = Some(tokio::spawn(acceptor.run(tx, self.cancel.child_token())));

        info!(addr = %local_addr, "collector fully started");

        Ok(local_addr)
    }

    /// Stop accepting, end sessions, drain the queue into the store.
    pub async fn stop(&mut self) -> Result<()> {
        self.cancel.cancel();

        if let Some(task) = self.acceptor_task.take() {
            if let Err(e) = task.await {
                error!(error = %e, "acceptor task failed");
            }
        }

        // Every queue sender is gone now; the persister exits once drained.
        if let Some(task) = self.persister_task.take() {
            task.await.context("waiting for persister")?;
        }

        self.health.stop().await?;

        Ok(())
    }
}
