use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::queue::IngestSender;
use super::session::handle_session;
use crate::config::expand_listen_addr;
use crate::export::health::HealthMetrics;

/// Pause after a failed accept so persistent errors (e.g. fd exhaustion)
/// do not spin.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// IPv4 TCP listener that runs one session task per connection.
pub struct Acceptor {
    listener: TcpListener,
    local_addr: SocketAddr,
    max_line_bytes: usize,
    health: Arc<HealthMetrics>,
}

impl Acceptor {
    /// Bind the listen address. Failure here is fatal for the collector.
    pub async fn bind(
        addr: &str,
        max_line_bytes: usize,
        health: Arc<HealthMetrics>,
    ) -> Result<Self> {
        let bind_addr = expand_listen_addr(addr);
        let resolved = resolve_ipv4(&bind_addr).await?;

        let listener = TcpListener::bind(resolved)
            .await
            .with_context(|| format!("listening on {bind_addr}"))?;
        let local_addr = listener.local_addr().context("getting local address")?;

        Ok(Self {
            listener,
            local_addr,
            max_line_bytes,
            health,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accept until cancelled, then wait for every session to finish.
    ///
    /// Sessions hold clones of `queue`; the queue closes once this returns
    /// and all of them are gone.
    pub async fn run(self, queue: IngestSender, cancel: CancellationToken) {
        info!(addr = %self.local_addr, "collector listening");

        let mut sessions = JoinSet::new();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                Some(joined) = sessions.join_next(), if !sessions.is_empty() => {
                    if let Err(e) = joined {
                        warn!(error = %e, "session task failed");
                    }
                }
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        self.spawn_session(&mut sessions, stream, peer, &queue, &cancel);
                    }
                    Err(e) => {
                        self.health.accept_errors.inc();
                        warn!(error = %e, "accept failed");
                        tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                    }
                },
            }
        }

        drop(queue);
        drop(self.listener);

        while let Some(joined) = sessions.join_next().await {
            if let Err(e) = joined {
                warn!(error = %e, "session task failed");
            }
        }

        info!("collector acceptor stopped");
    }

    fn spawn_session(
        &self,
        sessions: &mut JoinSet<()>,
        stream: TcpStream,
        peer: SocketAddr,
        queue: &IngestSender,
        cancel: &CancellationToken,
    ) {
        if let Err(e) = stream.set_nodelay(true) {
            debug!(peer = %peer, error = %e, "setting TCP_NODELAY");
        }

        self.health.sessions_accepted.inc();
        self.health.sessions_active.inc();
        info!(peer = %peer, "session opened");

        let queue = queue.clone();
        let health = Arc::clone(&self.health);
        let cancel = cancel.child_token();
        let max_line_bytes = self.max_line_bytes;

        sessions.spawn(async move {
            let stats = handle_session(
                stream,
                peer,
                max_line_bytes,
                queue,
                Arc::clone(&health),
                cancel,
            )
            .await;

            health.sessions_active.dec();
            info!(
                peer = %peer,
                lines = stats.lines,
                reports = stats.reports,
                decode_errors = stats.decode_errors,
                rejected = stats.rejected,
                "session closed",
            );
        });
    }
}

/// Resolve `host:port` (an IP literal or a hostname) to its first IPv4
/// address.
async fn resolve_ipv4(bind_addr: &str) -> Result<SocketAddr> {
    let candidates: Vec<SocketAddr> = tokio::net::lookup_host(bind_addr)
        .await
        .with_context(|| format!("resolving listen address {bind_addr}"))?
        .collect();

    match candidates.iter().find(|a| a.is_ipv4()) {
        Some(addr) => Ok(*addr),
        None => bail!("listen address {bind_addr} has no IPv4 address"),
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::AsyncWriteExt;

    use super::*;
    use crate::collector::queue::ingest_queue;
    use crate::report::Report;
    use crate::transport::codec::encode_batch;

    fn health() -> Arc<HealthMetrics> {
        Arc::new(HealthMetrics::new(":0").expect("metrics"))
    }

    #[tokio::test]
    async fn test_bind_rejects_ipv6() {
        assert!(Acceptor::bind("[::1]:0", 1024, health()).await.is_err());
    }

    #[tokio::test]
    async fn test_bind_resolves_hostname_to_ipv4() {
        let acceptor = Acceptor::bind("localhost:0", 1024, health())
            .await
            .expect("bind");
        assert!(acceptor.local_addr().is_ipv4());
        assert!(acceptor.local_addr().ip().is_loopback());
    }

    #[tokio::test]
    async fn test_bind_conflict_is_fatal() {
        let first = Acceptor::bind("127.0.0.1:0", 1024, health())
            .await
            .expect("bind");
        let taken = first.local_addr().to_string();
        assert!(Acceptor::bind(&taken, 1024, health()).await.is_err());
    }

    #[tokio::test]
    async fn test_concurrent_sessions_feed_one_queue() {
        let acceptor = Acceptor::bind("127.0.0.1:0", 1024, health())
            .await
            .expect("bind");
        let addr = acceptor.local_addr();
        let (tx, mut rx) = ingest_queue(16, None);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(acceptor.run(tx, cancel.clone()));

        let mut clients = Vec::new();
        for host in ["a", "b", "c"] {
            let mut stream = TcpStream::connect(addr).await.expect("connect");
            let line = encode_batch(&[Report::heartbeat(host, 1)]).expect("encode");
            stream.write_all(&line).await.expect("write");
            clients.push(stream);
        }

        let mut hosts = Vec::new();
        for _ in 0..3 {
            let report = tokio::time::timeout(Duration::from_secs(5), rx.pop())
                .await
                .expect("report in time")
                .expect("queue open");
            hosts.push(report.system_id);
        }
        hosts.sort();
        assert_eq!(hosts, vec!["a", "b", "c"]);

        cancel.cancel();
        task.await.expect("acceptor task");
        assert!(rx.pop().await.is_none());
    }
}
