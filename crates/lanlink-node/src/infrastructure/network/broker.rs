//! Two-phase peer connection broker.
//!
//! Phase A is a bootstrap call over the control HTTP surface: the initiating
//! node announces its hostname and control port, and the responder answers
//! with `host:port` for a freshly bound one-shot TCP listener. Phase B is
//! the initiator dialing that listener; the accepted stream becomes the
//! peer's long-lived message channel.
//!
//! The broker owns the connection tables. A peer is keyed by its control
//! endpoint, which both sides can derive independently, so simultaneous
//! connection attempts in the two directions collapse onto one entry.

use std::collections::HashMap;
use std::net::{IpAddr, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;

use lanlink_core::PeerEndpoint;
use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::channel::{spawn_receive_loop, ChannelError, Connection, HandlerRegistry};
use crate::runtime::Scheduler;

/// Rejections of an inbound bootstrap request. The display strings are the
/// protocol-visible failure reasons returned to the initiator.
#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("argument missing")]
    ArgumentMissing,

    #[error("address mismatch")]
    AddressMismatch,

    #[error("already connecting or connected")]
    AlreadyConnecting,

    #[error("listener setup failed: {0}")]
    Listener(#[from] std::io::Error),

    #[error("cannot resolve claimed address: {0}")]
    Resolve(String),
}

/// Failures of an outbound connection attempt.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("bootstrap request failed: {0}")]
    Bootstrap(#[from] reqwest::Error),

    #[error("bootstrap reply not understood: {0:?}")]
    BadBootstrapReply(String),

    #[error("data channel dial failed: {0}")]
    Dial(#[from] std::io::Error),

    #[error("cannot resolve data channel address: {0}")]
    Resolve(String),
}

#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Hostname this node claims in Phase A requests.
    pub advertised_host: String,
    /// Port the control HTTP surface actually bound.
    pub control_port: u16,
    /// How long a one-shot listener waits for the Phase B dial.
    pub handshake_timeout: Duration,
}

/// A peer mid-handshake. Inbound entries reserve the slot while the
/// one-shot listener waits; outbound entries reserve it while Phase A and B
/// run.
enum PendingPeer {
    Inbound,
    Outbound,
}

#[derive(Default)]
struct Tables {
    pending: HashMap<PeerEndpoint, PendingPeer>,
    established: HashMap<PeerEndpoint, Arc<Connection>>,
}

/// Summary of one established peer, as exposed on the status surface.
#[derive(Debug, Clone, Serialize)]
pub struct PeerInfo {
    pub endpoint: PeerEndpoint,
    pub hostname: String,
}

struct BrokerInner {
    config: BrokerConfig,
    scheduler: Scheduler,
    handlers: Arc<HandlerRegistry>,
    tables: Mutex<Tables>,
    http: reqwest::Client,
}

/// Shared handle to the connection broker. Cheap to clone.
#[derive(Clone)]
pub struct Broker {
    inner: Arc<BrokerInner>,
}

impl Broker {
    pub fn new(config: BrokerConfig, scheduler: Scheduler, handlers: Arc<HandlerRegistry>) -> Self {
        Self {
            inner: Arc::new(BrokerInner {
                config,
                scheduler,
                handlers,
                tables: Mutex::new(Tables::default()),
                http: reqwest::Client::new(),
            }),
        }
    }

    // ── Phase A, responder side ───────────────────────────────────────────────

    /// Handles an inbound bootstrap request from `remote`, the source
    /// address of the HTTP call. On success a one-shot listener is armed
    /// and its `host:port` dial target is returned for the reply body.
    ///
    /// # Errors
    ///
    /// Rejects requests missing the hostname or port argument, requests
    /// whose claimed hostname does not resolve to the caller's IP, and
    /// requests for a peer that is already pending or connected.
    pub async fn serve_connect(
        &self,
        remote: PeerEndpoint,
        claimed_host: Option<&str>,
        claimed_port: Option<u16>,
    ) -> Result<String, HandshakeError> {
        let (claimed_host, claimed_port) = match (claimed_host, claimed_port) {
            (Some(host), Some(port)) if !host.is_empty() => (host.to_owned(), port),
            _ => return Err(HandshakeError::ArgumentMissing),
        };

        // The claimed hostname must resolve back to where the request
        // actually came from, otherwise anyone could impersonate a peer.
        let resolved = {
            let host = claimed_host.clone();
            self.inner
                .scheduler
                .run_in_thread(move || (host.as_str(), claimed_port).to_socket_addrs())
                .await
                .map_err(|err| HandshakeError::Resolve(err.to_string()))?
                .map_err(|err| HandshakeError::Resolve(err.to_string()))?
        };
        let peer = resolved
            .into_iter()
            .find(|addr| addr.ip() == remote.ip())
            .ok_or(HandshakeError::AddressMismatch)?;

        // Bind outside the lock; only the table check needs it held.
        let listener = TcpListener::bind(("0.0.0.0", 0)).await?;
        let listener_port = listener.local_addr()?.port();
        {
            let mut tables = self.inner.tables.lock().await;
            if tables.pending.contains_key(&peer) || tables.established.contains_key(&peer) {
                return Err(HandshakeError::AlreadyConnecting);
            }
            tables.pending.insert(peer, PendingPeer::Inbound);
        }

        info!(%peer, host = %claimed_host, port = listener_port, "handshake accepted, listener armed");
        let broker = self.clone();
        let wait = self.inner.config.handshake_timeout;
        self.inner
            .scheduler
            .spawn("handshake-accept", async move {
                broker
                    .await_data_channel(peer, claimed_host, listener, wait)
                    .await;
                Ok(())
            });

        let reply_host = local_ip_toward(remote.ip())?;
        Ok(format!("{reply_host}:{listener_port}"))
    }

    /// Waits for the initiator's Phase B dial on the one-shot listener,
    /// disposing of the reservation if the dial never comes.
    async fn await_data_channel(
        &self,
        peer: PeerEndpoint,
        hostname: String,
        listener: TcpListener,
        wait: Duration,
    ) {
        match timeout(wait, listener.accept()).await {
            Ok(Ok((stream, from))) => {
                debug!(%peer, %from, "data channel accepted");
                self.promote(peer, hostname, stream).await;
            }
            Ok(Err(err)) => {
                warn!(%peer, error = %err, "data channel accept failed");
                self.discard_pending(peer).await;
            }
            Err(_) => {
                warn!(%peer, timeout = ?wait, "peer never dialed back, disposing listener");
                self.discard_pending(peer).await;
            }
        }
    }

    // ── Phase A and B, initiator side ─────────────────────────────────────────

    /// Connects to the peer whose control surface is at `endpoint`. A no-op
    /// when that peer is already pending or connected.
    ///
    /// # Errors
    ///
    /// Fails when the bootstrap HTTP call is rejected, the reply is not a
    /// `host:port` dial target, or the Phase B dial fails. The pending
    /// reservation is released on every failure path.
    pub async fn try_connect_to(&self, endpoint: PeerEndpoint) -> Result<(), BrokerError> {
        {
            let mut tables = self.inner.tables.lock().await;
            if tables.pending.contains_key(&endpoint)
                || tables.established.contains_key(&endpoint)
            {
                debug!(%endpoint, "already connecting or connected, skipping");
                return Ok(());
            }
            tables.pending.insert(endpoint, PendingPeer::Outbound);
        }

        match self.bootstrap_and_dial(endpoint).await {
            Ok((hostname, stream)) => {
                self.promote(endpoint, hostname, stream).await;
                Ok(())
            }
            Err(err) => {
                self.discard_pending(endpoint).await;
                Err(err)
            }
        }
    }

    async fn bootstrap_and_dial(
        &self,
        endpoint: PeerEndpoint,
    ) -> Result<(String, TcpStream), BrokerError> {
        let url = format!(
            "http://{endpoint}/connect?myAddress={}&myPort={}",
            self.inner.config.advertised_host, self.inner.config.control_port,
        );
        let body = self
            .inner
            .http
            .get(&url)
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;

        let target = body.trim();
        let (host, port) = target
            .rsplit_once(':')
            .ok_or_else(|| BrokerError::BadBootstrapReply(target.to_owned()))?;
        let port: u16 = port
            .parse()
            .map_err(|_| BrokerError::BadBootstrapReply(target.to_owned()))?;

        let dial = tokio::net::lookup_host((host, port))
            .await
            .map_err(|err| BrokerError::Resolve(err.to_string()))?
            .next()
            .ok_or_else(|| BrokerError::Resolve(format!("no addresses for {host}")))?;
        debug!(%endpoint, %dial, "dialing data channel");
        let stream = TcpStream::connect(dial).await?;
        Ok((host.to_owned(), stream))
    }

    // ── Table maintenance ─────────────────────────────────────────────────────

    /// Turns an accepted or dialed stream into an established connection
    /// and starts its receive loop.
    async fn promote(&self, endpoint: PeerEndpoint, hostname: String, stream: TcpStream) {
        let (read_half, write_half) = stream.into_split();
        let connection = Arc::new(Connection::new(endpoint, hostname.clone(), write_half));
        {
            let mut tables = self.inner.tables.lock().await;
            tables.pending.remove(&endpoint);
            if tables.established.contains_key(&endpoint) {
                // Both sides raced to connect and the other attempt won.
                warn!(%endpoint, "duplicate connection dropped");
                return;
            }
            tables.established.insert(endpoint, Arc::clone(&connection));
        }
        info!(%endpoint, host = %hostname, "peer connected");

        let broker = self.clone();
        let scheduler = self.inner.scheduler.clone();
        spawn_receive_loop(
            connection,
            read_half,
            Arc::clone(&self.inner.handlers),
            self.inner.scheduler.clone(),
            move |endpoint| {
                scheduler.spawn("peer-disconnect", async move {
                    broker.remove_peer(endpoint).await;
                    Ok(())
                });
            },
        );
    }

    async fn remove_peer(&self, endpoint: PeerEndpoint) {
        let mut tables = self.inner.tables.lock().await;
        if tables.established.remove(&endpoint).is_some() {
            info!(%endpoint, "peer disconnected");
        }
    }

    async fn discard_pending(&self, endpoint: PeerEndpoint) {
        let mut tables = self.inner.tables.lock().await;
        tables.pending.remove(&endpoint);
    }

    // ── Queries ───────────────────────────────────────────────────────────────

    /// Posts `name` with `payload` to every established peer, collecting
    /// each peer's send outcome.
    pub async fn broadcast(
        &self,
        name: &str,
        payload: Map<String, Value>,
    ) -> Vec<(PeerEndpoint, Result<(), ChannelError>)> {
        let connections: Vec<(PeerEndpoint, Arc<Connection>)> = {
            let tables = self.inner.tables.lock().await;
            tables
                .established
                .iter()
                .map(|(endpoint, connection)| (*endpoint, Arc::clone(connection)))
                .collect()
        };
        let sends = connections
            .into_iter()
            .map(|(endpoint, connection)| {
                let name = name.to_owned();
                let payload = payload.clone();
                async move { (endpoint, connection.post_message(&name, payload).await) }
            })
            .collect();
        self.inner.scheduler.wait_all(sends).await
    }

    /// Snapshot of every established peer.
    pub async fn peers(&self) -> Vec<PeerInfo> {
        let tables = self.inner.tables.lock().await;
        tables
            .established
            .iter()
            .map(|(endpoint, connection)| PeerInfo {
                endpoint: *endpoint,
                hostname: connection.hostname().to_owned(),
            })
            .collect()
    }

    pub async fn is_established(&self, endpoint: PeerEndpoint) -> bool {
        self.inner.tables.lock().await.established.contains_key(&endpoint)
    }

    pub async fn is_pending(&self, endpoint: PeerEndpoint) -> bool {
        self.inner.tables.lock().await.pending.contains_key(&endpoint)
    }

    pub async fn connection_to(&self, endpoint: PeerEndpoint) -> Option<Arc<Connection>> {
        self.inner
            .tables
            .lock()
            .await
            .established
            .get(&endpoint)
            .map(Arc::clone)
    }
}

/// Picks the local IP the OS would use to reach `remote`, via a connected
/// UDP socket that never sends a packet.
fn local_ip_toward(remote: IpAddr) -> std::io::Result<IpAddr> {
    let probe = std::net::UdpSocket::bind(("0.0.0.0", 0))?;
    probe.connect((remote, 9))?;
    Ok(probe.local_addr()?.ip())
}

// ── Tests ─────────────────────────────────────────────────────────────────────
