//! UDP presence discovery.
//!
//! Every node broadcasts a small announcement datagram on a well-known port
//! and listens for the announcements of others. Hearing a new host triggers
//! two things: an out-of-schedule announcement of our own, so the new host
//! learns about us quickly, and a connection attempt through the broker.
//!
//! A node also hears its own broadcasts. Those are filtered by comparing
//! the announced process id and source address against our own, so two
//! nodes on one machine still discover each other.

use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, ToSocketAddrs, UdpSocket as StdUdpSocket};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use futures::FutureExt;
use lanlink_core::{Announcement, PeerEndpoint};
use socket2::{Domain, Protocol, Socket, Type};
use thiserror::Error;
use tokio::net::UdpSocket;
use tracing::{debug, info, trace, warn};

use super::broker::Broker;
use crate::runtime::{Scheduler, Signal};

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("failed to bind discovery socket on {addr}: {source}")]
    BindFailed {
        addr: SocketAddr,
        source: std::io::Error,
    },
}

#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    /// UDP port announcements are broadcast on.
    pub discovery_port: u16,
    /// Control port advertised in our own announcements.
    pub control_port: u16,
    /// Delay between scheduled announcements.
    pub heartbeat_interval: Duration,
}

/// What to do with one received announcement.
#[derive(Debug, PartialEq, Eq)]
enum AnnouncementAction {
    /// Our own broadcast echoed back; ignore it.
    SelfBroadcast,
    /// A host we have already reacted to.
    KnownHost,
    /// First sighting; announce back and connect.
    NewHost,
}

struct DiscoveryInner {
    config: DiscoveryConfig,
    scheduler: Scheduler,
    broker: Broker,
    socket: UdpSocket,
    early_announce: Signal,
    known: StdMutex<HashSet<(PeerEndpoint, u32)>>,
    pid: u32,
}

/// Shared handle to the discovery engine. Cheap to clone.
#[derive(Clone)]
pub struct Discovery {
    inner: Arc<DiscoveryInner>,
}

impl Discovery {
    /// Binds the discovery socket and builds the engine. Nothing runs until
    /// [`Discovery::start`].
    ///
    /// # Errors
    ///
    /// Fails when the UDP port cannot be bound, even with address reuse.
    pub fn bind(
        config: DiscoveryConfig,
        scheduler: Scheduler,
        broker: Broker,
    ) -> Result<Self, DiscoveryError> {
        let socket = bind_discovery_socket(config.discovery_port)?;
        Ok(Self {
            inner: Arc::new(DiscoveryInner {
                config,
                scheduler,
                broker,
                socket,
                early_announce: Signal::new(),
                known: StdMutex::new(HashSet::new()),
                pid: std::process::id(),
            }),
        })
    }

    /// Starts the heartbeat and listener loops.
    pub fn start(&self) {
        let engine = self.clone();
        self.inner.scheduler.spawn("discovery-heartbeat", async move {
            engine.heartbeat_loop().await;
            Ok(())
        });
        let engine = self.clone();
        self.inner.scheduler.spawn("discovery-listen", async move {
            engine.listen_loop().await;
            Ok(())
        });
        info!(
            port = self.inner.config.discovery_port,
            interval = ?self.inner.config.heartbeat_interval,
            "discovery started"
        );
    }

    async fn heartbeat_loop(&self) {
        let inner = &self.inner;
        let datagram = Announcement {
            control_port: inner.config.control_port,
            pid: inner.pid,
        }
        .encode();
        let target = (Ipv4Addr::BROADCAST, inner.config.discovery_port);
        loop {
            if let Err(err) = inner.socket.send_to(&datagram, target).await {
                warn!(error = %err, "announcement broadcast failed");
            }
            // Wake early when a new host shows up, so it hears about us
            // without waiting out the full interval.
            let interval = inner.config.heartbeat_interval;
            let early = inner.early_announce.clone();
            inner
                .scheduler
                .wait_first(vec![
                    async move { tokio::time::sleep(interval).await }.boxed(),
                    async move { early.wait().await }.boxed(),
                ])
                .await;
        }
    }

    async fn listen_loop(&self) {
        let mut buf = [0u8; 64];
        loop {
            let (len, from) = match self.inner.socket.recv_from(&mut buf).await {
                Ok(received) => received,
                Err(err) => {
                    warn!(error = %err, "discovery receive failed");
                    continue;
                }
            };
            let announcement = match Announcement::decode(&buf[..len]) {
                Ok(announcement) => announcement,
                Err(err) => {
                    debug!(%from, error = %err, "ignoring malformed announcement");
                    continue;
                }
            };
            self.process_announcement(from, announcement).await;
        }
    }

    async fn process_announcement(&self, from: SocketAddr, announcement: Announcement) {
        let peer = SocketAddr::new(from.ip(), announcement.control_port);
        let local_ips = match self.inner.scheduler.run_in_thread(local_addresses).await {
            Ok(ips) => ips,
            Err(err) => {
                warn!(error = %err, "local address lookup failed, skipping announcement");
                return;
            }
        };

        let action = {
            let known = self.inner.known.lock().unwrap_or_else(|e| e.into_inner());
            classify(peer, announcement.pid, self.inner.pid, &local_ips, &known)
        };
        match action {
            AnnouncementAction::SelfBroadcast => {}
            AnnouncementAction::KnownHost => {
                trace!(%peer, "heartbeat from known host");
            }
            AnnouncementAction::NewHost => {
                info!(%peer, pid = announcement.pid, "new host discovered");
                {
                    let mut known =
                        self.inner.known.lock().unwrap_or_else(|e| e.into_inner());
                    known.insert((peer, announcement.pid));
                }
                self.inner.early_announce.set();
                let broker = self.inner.broker.clone();
                self.inner.scheduler.spawn("discovery-connect", async move {
                    broker.try_connect_to(peer).await?;
                    Ok(())
                });
            }
        }
    }
}

/// Decides how to react to an announcement. A broadcast is our own echo
/// when it carries our pid and originates from one of our addresses; a
/// restarted peer gets a fresh pid and is treated as new again.
fn classify(
    peer: PeerEndpoint,
    pid: u32,
    local_pid: u32,
    local_ips: &[IpAddr],
    known: &HashSet<(PeerEndpoint, u32)>,
) -> AnnouncementAction {
    let from_self =
        pid == local_pid && (peer.ip().is_loopback() || local_ips.contains(&peer.ip()));
    if from_self {
        return AnnouncementAction::SelfBroadcast;
    }
    if known.contains(&(peer, pid)) {
        return AnnouncementAction::KnownHost;
    }
    AnnouncementAction::NewHost
}

/// Every IP this machine answers to: whatever the hostname resolves to,
/// plus the interface address used for outbound traffic.
fn local_addresses() -> Vec<IpAddr> {
    let mut addresses = Vec::new();
    if let Ok(hostname) = whoami::fallible::hostname() {
        if let Ok(resolved) = (hostname.as_str(), 0u16).to_socket_addrs() {
            addresses.extend(resolved.map(|addr| addr.ip()));
        }
    }
    if let Ok(probe) = StdUdpSocket::bind(("0.0.0.0", 0)) {
        if probe.connect(("8.8.8.8", 80)).is_ok() {
            if let Ok(local) = probe.local_addr() {
                addresses.push(local.ip());
            }
        }
    }
    addresses
}

/// Binds the shared discovery port with address reuse and broadcast
/// enabled, so several nodes on one machine can all listen.
fn bind_discovery_socket(port: u16) -> Result<UdpSocket, DiscoveryError> {
    let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port);
    let bind = || -> std::io::Result<UdpSocket> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        socket.set_broadcast(true)?;
        socket.set_nonblocking(true)?;
        socket.bind(&addr.into())?;
        UdpSocket::from_std(socket.into())
    };
    bind().map_err(|source| DiscoveryError::BindFailed { addr, source })
}

// ── Tests ─────────────────────────────────────────────────────────────────────
