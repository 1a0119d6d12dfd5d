//! Cluster transport.
//!
//! A [`Transport`] is a listener plus an outbound dialer. Raft RPC and the
//! forwarding service each get their own transport, but both share a single
//! TCP listener on the cluster bind address: every dialled connection starts
//! with one tag byte, and the [`Multiplexer`] routes accepted connections to
//! the transport registered for that tag. Past the tag byte the transport
//! never looks at the stream; framing belongs to the caller.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::AsyncReadExt;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::constants::DIAL_TIMEOUT;
use crate::constants::MAX_CONCURRENT_CONNECTIONS;

/// Tag byte of raft RPC connections.
pub const RAFT_TAG: u8 = 1;
/// Tag byte of follower to leader forwarding connections.
pub const FORWARD_TAG: u8 = 2;

/// Listener and dialer shared by the consensus layer and forwarding.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Waits for the next inbound connection.
    async fn accept(&self) -> io::Result<TcpStream>;

    /// Local listen address.
    fn addr(&self) -> SocketAddr;

    /// Opens a connection to a peer's cluster address.
    async fn dial(&self, address: &str, timeout: Duration) -> io::Result<TcpStream>;

    /// Stops accepting. Pending and future `accept` calls fail.
    fn close(&self);
}

/// Routes connections from one TCP listener to tagged transports.
pub struct Multiplexer {
    listener: TcpListener,
    addr: SocketAddr,
    routes: Mutex<HashMap<u8, mpsc::Sender<TcpStream>>>,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

impl Multiplexer {
    pub async fn bind(address: &str) -> io::Result<Arc<Self>> {
        let listener = TcpListener::bind(address).await?;
        let addr = listener.local_addr()?;
        info!(%addr, "cluster transport listening");
        Ok(Arc::new(Self {
            listener,
            addr,
            routes: Mutex::new(HashMap::new()),
            cancel: CancellationToken::new(),
            tracker: TaskTracker::new(),
        }))
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Registers the transport for `tag`. Registering a tag twice replaces the route.
    pub fn channel(&self, tag: u8) -> Arc<MuxTransport> {
        let (tx, rx) = mpsc::channel(MAX_CONCURRENT_CONNECTIONS);
        self.routes.lock().insert(tag, tx);
        Arc::new(MuxTransport {
            tag,
            addr: self.addr,
            rx: tokio::sync::Mutex::new(rx),
            closed: self.cancel.child_token(),
        })
    }

    /// Accept loop. Returns when [`Multiplexer::close`] is called.
    pub async fn serve(self: Arc<Self>) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    debug!(addr = %self.addr, "multiplexer stopping");
                    break;
                }
                accepted = self.listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(conn) => conn,
                        Err(err) => {
                            warn!(error = %err, "cluster accept failed");
                            continue;
                        }
                    };
                    let this = Arc::clone(&self);
                    self.tracker.spawn(async move {
                        this.route(stream, peer).await;
                    });
                }
            }
        }
        self.tracker.close();
        self.tracker.wait().await;
    }

    async fn route(&self, mut stream: TcpStream, peer: SocketAddr) {
        let tag = match tokio::time::timeout(DIAL_TIMEOUT, stream.read_u8()).await {
            Ok(Ok(tag)) => tag,
            Ok(Err(err)) => {
                debug!(%peer, error = %err, "connection closed before tag byte");
                return;
            }
            Err(_) => {
                warn!(%peer, "timed out waiting for tag byte");
                return;
            }
        };
        let route = self.routes.lock().get(&tag).cloned();
        match route {
            Some(tx) => {
                if tx.send(stream).await.is_err() {
                    debug!(%peer, tag, "transport closed, dropping connection");
                }
            }
            None => warn!(%peer, tag, "unknown transport tag"),
        }
    }

    /// Stops the accept loop and every transport created from this multiplexer.
    pub fn close(&self) {
        self.cancel.cancel();
    }
}

/// One tagged channel of a [`Multiplexer`].
pub struct MuxTransport {
    tag: u8,
    addr: SocketAddr,
    rx: tokio::sync::Mutex<mpsc::Receiver<TcpStream>>,
    closed: CancellationToken,
}

#[async_trait]
impl Transport for MuxTransport {
    async fn accept(&self) -> io::Result<TcpStream> {
        let mut rx = self.rx.lock().await;
        tokio::select! {
            _ = self.closed.cancelled() => Err(io::Error::new(io::ErrorKind::ConnectionAborted, "transport closed")),
            stream = rx.recv() => stream.ok_or_else(|| io::Error::new(io::ErrorKind::ConnectionAborted, "multiplexer stopped")),
        }
    }

    fn addr(&self) -> SocketAddr {
        self.addr
    }

    async fn dial(&self, address: &str, timeout: Duration) -> io::Result<TcpStream> {
        let mut stream = tokio::time::timeout(timeout, TcpStream::connect(address))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, format!("dial {address} timed out")))??;
        stream.set_nodelay(true)?;
        stream.write_all(&[self.tag]).await?;
        Ok(stream)
    }

    fn close(&self) {
        self.closed.cancel();
    }
}

/// Reads until EOF, failing if the peer sends more than `limit` bytes.
pub async fn read_message(stream: &mut TcpStream, limit: usize) -> io::Result<Vec<u8>> {
    let mut buf = Vec::new();
    (&mut *stream).take(limit as u64 + 1).read_to_end(&mut buf).await?;
    if buf.len() > limit {
        return Err(io::Error::new(io::ErrorKind::InvalidData, format!("message exceeds {limit} bytes")));
    }
    Ok(buf)
}

/// Writes one message and half-closes the stream.
pub async fn write_message(stream: &mut TcpStream, payload: &[u8]) -> io::Result<()> {
    stream.write_all(payload).await?;
    stream.shutdown().await
}

/// Client side of a one-shot exchange: send `payload`, read the full reply.
pub async fn round_trip(mut stream: TcpStream, payload: &[u8], limit: usize) -> io::Result<Vec<u8>> {
    write_message(&mut stream, payload).await?;
    read_message(&mut stream, limit).await
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn echo_once(transport: Arc<MuxTransport>, prefix: &'static [u8]) {
        let mut stream = transport.accept().await.unwrap();
        let msg = read_message(&mut stream, 1024).await.unwrap();
        let mut reply = prefix.to_vec();
        reply.extend_from_slice(&msg);
        write_message(&mut stream, &reply).await.unwrap();
    }

    #[tokio::test]
    async fn test_routes_by_tag() {
        let mux = Multiplexer::bind("127.0.0.1:0").await.unwrap();
        let raft = mux.channel(RAFT_TAG);
        let forward = mux.channel(FORWARD_TAG);
        let addr = mux.addr().to_string();
        tokio::spawn(Arc::clone(&mux).serve());

        tokio::spawn(echo_once(Arc::clone(&raft), b"raft:"));
        tokio::spawn(echo_once(Arc::clone(&forward), b"fwd:"));

        let stream = forward.dial(&addr, DIAL_TIMEOUT).await.unwrap();
        let reply = round_trip(stream, b"hello", 1024).await.unwrap();
        assert_eq!(reply, b"fwd:hello");

        let stream = raft.dial(&addr, DIAL_TIMEOUT).await.unwrap();
        let reply = round_trip(stream, b"vote", 1024).await.unwrap();
        assert_eq!(reply, b"raft:vote");

        mux.close();
    }

    #[tokio::test]
    async fn test_accept_fails_after_close() {
        let mux = Multiplexer::bind("127.0.0.1:0").await.unwrap();
        let transport = mux.channel(RAFT_TAG);
        transport.close();
        let err = transport.accept().await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionAborted);
    }

    #[tokio::test]
    async fn test_dial_refused() {
        let mux = Multiplexer::bind("127.0.0.1:0").await.unwrap();
        let transport = mux.channel(FORWARD_TAG);
        // Bind then drop to get a port nobody listens on.
        let port = {
            let l = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            l.local_addr().unwrap().port()
        };
        let result = transport.dial(&format!("127.0.0.1:{port}"), Duration::from_secs(2)).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_read_message_limit() {
        let mux = Multiplexer::bind("127.0.0.1:0").await.unwrap();
        let transport = mux.channel(FORWARD_TAG);
        let addr = mux.addr().to_string();
        tokio::spawn(Arc::clone(&mux).serve());

        let server = Arc::clone(&transport);
        let handle = tokio::spawn(async move {
            let mut stream = server.accept().await.unwrap();
            read_message(&mut stream, 4).await
        });
        let mut stream = transport.dial(&addr, DIAL_TIMEOUT).await.unwrap();
        write_message(&mut stream, b"too long").await.unwrap();
        let result = handle.await.unwrap();
        assert_eq!(result.unwrap_err().kind(), io::ErrorKind::InvalidData);
        mux.close();
    }
}
