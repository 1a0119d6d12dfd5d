//! UDP listener for the DNS front-end.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use anyhow::Result;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::debug;
use tracing::info;
use tracing::warn;

use super::DnsResolver;
use crate::constants::DNS_CACHE_PURGE_INTERVAL;
use crate::constants::DNS_MAX_PACKET;

pub struct DnsServer {
    addr: SocketAddr,
    join_handle: JoinHandle<()>,
    cancel_token: CancellationToken,
    task_tracker: TaskTracker,
}

impl DnsServer {
    pub async fn spawn(bind: &str, resolver: Arc<DnsResolver>) -> Result<Self> {
        let socket = UdpSocket::bind(bind)
            .await
            .with_context(|| format!("failed to bind dns socket on {bind}"))?;
        let addr = socket.local_addr().context("dns socket has no local address")?;
        let cancel_token = CancellationToken::new();
        let task_tracker = TaskTracker::new();

        task_tracker.spawn(run_cache_purge(
            Arc::clone(&resolver),
            DNS_CACHE_PURGE_INTERVAL,
            cancel_token.clone(),
        ));
        let join_handle = tokio::spawn(run_server(
            Arc::new(socket),
            resolver,
            cancel_token.clone(),
            task_tracker.clone(),
        ));
        info!(%addr, "dns server listening");
        Ok(Self {
            addr,
            join_handle,
            cancel_token,
            task_tracker,
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub async fn shutdown(self) -> Result<()> {
        info!("shutting down dns server");
        self.cancel_token.cancel();
        self.task_tracker.close();
        self.task_tracker.wait().await;
        self.join_handle.await.context("dns server task panicked")?;
        Ok(())
    }
}

async fn run_server(
    socket: Arc<UdpSocket>,
    resolver: Arc<DnsResolver>,
    cancel: CancellationToken,
    task_tracker: TaskTracker,
) {
    let mut buf = vec![0u8; DNS_MAX_PACKET];
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            received = socket.recv_from(&mut buf) => {
                let (len, peer) = match received {
                    Ok(received) => received,
                    Err(err) => {
                        warn!(error = %err, "dns receive failed");
                        continue;
                    }
                };
                let packet = buf[..len].to_vec();
                let socket = Arc::clone(&socket);
                let resolver = Arc::clone(&resolver);
                task_tracker.spawn(async move {
                    match resolver.handle_packet(&packet).await {
                        Ok(reply) => {
                            if let Err(err) = socket.send_to(&reply, peer).await {
                                debug!(%peer, error = %err, "dns reply failed");
                            }
                        }
                        Err(err) => debug!(%peer, error = %err, "dropping dns packet"),
                    }
                });
            }
        }
    }
}

async fn run_cache_purge(resolver: Arc<DnsResolver>, every: Duration, cancel: CancellationToken) {
    let mut ticker = interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let purged = resolver.purge_cache();
                debug!(purged, "purged dns answer cache");
            }
        }
    }
}
