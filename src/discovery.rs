//! LAN session discovery: UDP advertisement and browsing.
//!
//! Hosts periodically announce every session in their registry as a
//! small bincode datagram; browsers listen on the discovery port and
//! keep a table of what they have heard. There is no "session lost"
//! signal — an advertisement that is not refreshed within `stale_after`
//! simply drops out of the table, which covers hosts that disappear
//! silently (crash, sleep, network change).
//!
//! ```text
//! SessionAdvertiser ── announce_interval ──► 255.255.255.255:port
//!                                                  │
//!                                     SessionDiscovery (per machine)
//!                                                  │
//!                                       discovered_sessions()
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::registry::SessionRegistry;

/// Default UDP port for session advertisements.
pub const DEFAULT_DISCOVERY_PORT: u16 = 41170;

/// Discovery configuration.
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    /// Port browsers listen on.
    pub discovery_port: u16,
    /// Where announcements are sent. Defaults to the IPv4 broadcast
    /// address; tests point this at loopback.
    pub target_addr: SocketAddr,
    /// How often each hosted session is re-announced.
    pub announce_interval: Duration,
    /// Advertisements older than this drop out of the discovered list.
    pub stale_after: Duration,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            discovery_port: DEFAULT_DISCOVERY_PORT,
            target_addr: SocketAddr::new(
                IpAddr::V4(Ipv4Addr::BROADCAST),
                DEFAULT_DISCOVERY_PORT,
            ),
            announce_interval: Duration::from_secs(2),
            stale_after: Duration::from_secs(6),
        }
    }
}

/// One session advertisement datagram.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Announcement {
    pub session_id: Uuid,
    pub name: String,
    pub host_name: String,
    pub document_type: String,
    /// TCP port the host serves WebSocket connections on.
    pub port: u16,
}

impl Announcement {
    /// Encode to binary (bincode).
    pub fn encode(&self) -> Result<Vec<u8>, String> {
        bincode::serde::encode_to_vec(self, bincode::config::standard()).map_err(|e| e.to_string())
    }

    /// Decode from binary.
    pub fn decode(bytes: &[u8]) -> Result<Self, String> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| e.to_string())?;
        Ok(msg)
    }
}

/// A session another host is advertising.
#[derive(Debug, Clone)]
pub struct DiscoveredSession {
    pub session_id: Uuid,
    /// Address the announcement came from.
    pub host: IpAddr,
    /// TCP port the session is served on.
    pub port: u16,
    pub name: String,
    pub host_name: String,
    pub document_type: String,
    last_seen: Instant,
}

impl DiscoveredSession {
    /// Time since the last refresh of this advertisement.
    pub fn age(&self) -> Duration {
        self.last_seen.elapsed()
    }
}

/// Periodically announces every session in the registry.
pub struct SessionAdvertiser {
    config: DiscoveryConfig,
    registry: Arc<SessionRegistry>,
    /// TCP port our host serves on, carried in each announcement.
    session_port: u16,
    handle: Option<JoinHandle<()>>,
}

impl SessionAdvertiser {
    pub fn new(config: DiscoveryConfig, registry: Arc<SessionRegistry>, session_port: u16) -> Self {
        Self {
            config,
            registry,
            session_port,
            handle: None,
        }
    }

    /// Begin announcing. Idempotent.
    pub async fn start(&mut self) -> std::io::Result<()> {
        if self.handle.is_some() {
            return Ok(());
        }

        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        socket.set_broadcast(true)?;

        let registry = self.registry.clone();
        let target = self.config.target_addr;
        let interval = self.config.announce_interval;
        let port = self.session_port;

        self.handle = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                for descriptor in registry.list_sessions().await {
                    let announcement = Announcement {
                        session_id: descriptor.session_id,
                        name: descriptor.name,
                        host_name: descriptor.host_name,
                        document_type: descriptor.document_type,
                        port,
                    };
                    match announcement.encode() {
                        Ok(bytes) => {
                            if let Err(e) = socket.send_to(&bytes, target).await {
                                log::warn!("Failed to announce session: {e}");
                            }
                        }
                        Err(e) => log::error!("Failed to encode announcement: {e}"),
                    }
                }
            }
        }));

        log::info!("Session advertiser started (target {})", self.config.target_addr);
        Ok(())
    }

    /// Stop announcing. Idempotent.
    pub fn stop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
            log::info!("Session advertiser stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle.is_some()
    }
}

impl Drop for SessionAdvertiser {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Listens for advertisements and keeps a staleness-pruned table.
pub struct SessionDiscovery {
    config: DiscoveryConfig,
    sessions: Arc<RwLock<HashMap<Uuid, DiscoveredSession>>>,
    handle: Option<JoinHandle<()>>,
}

impl SessionDiscovery {
    pub fn new(config: DiscoveryConfig) -> Self {
        Self {
            config,
            sessions: Arc::new(RwLock::new(HashMap::new())),
            handle: None,
        }
    }

    /// Begin listening for advertisements. Idempotent.
    pub async fn start_discovery(&mut self) -> std::io::Result<()> {
        if self.handle.is_some() {
            return Ok(());
        }

        let socket = UdpSocket::bind(("0.0.0.0", self.config.discovery_port)).await?;
        let sessions = self.sessions.clone();
        let stale_after = self.config.stale_after;

        self.handle = Some(tokio::spawn(async move {
            let mut buf = [0u8; 2048];
            let mut prune_ticker = tokio::time::interval(stale_after);
            loop {
                tokio::select! {
                    received = socket.recv_from(&mut buf) => {
                        let (len, src) = match received {
                            Ok(pair) => pair,
                            Err(e) => {
                                log::warn!("Discovery receive error: {e}");
                                continue;
                            }
                        };
                        match Announcement::decode(&buf[..len]) {
                            Ok(announcement) => {
                                log::trace!(
                                    "Heard session {} from {}",
                                    announcement.session_id,
                                    src
                                );
                                let mut table = sessions.write().await;
                                table.insert(announcement.session_id, DiscoveredSession {
                                    session_id: announcement.session_id,
                                    host: src.ip(),
                                    port: announcement.port,
                                    name: announcement.name,
                                    host_name: announcement.host_name,
                                    document_type: announcement.document_type,
                                    last_seen: Instant::now(),
                                });
                            }
                            Err(e) => log::debug!("Ignoring malformed announcement from {src}: {e}"),
                        }
                    }
                    _ = prune_ticker.tick() => {
                        let mut table = sessions.write().await;
                        prune_stale(&mut table, stale_after);
                    }
                }
            }
        }));

        log::info!(
            "Session discovery listening on port {}",
            self.config.discovery_port
        );
        Ok(())
    }

    /// Stop listening. The table is kept but no longer refreshed.
    /// Idempotent.
    pub fn stop_discovery(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
            log::info!("Session discovery stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle.is_some()
    }

    /// Point-in-time snapshot of currently-known advertisements, with
    /// stale entries pruned first.
    pub async fn discovered_sessions(&self) -> Vec<DiscoveredSession> {
        let mut table = self.sessions.write().await;
        prune_stale(&mut table, self.config.stale_after);
        table.values().cloned().collect()
    }
}

impl Drop for SessionDiscovery {
    fn drop(&mut self) {
        self.stop_discovery();
    }
}

/// Drop advertisements that have not been refreshed recently.
fn prune_stale(table: &mut HashMap<Uuid, DiscoveredSession>, stale_after: Duration) {
    table.retain(|id, session| {
        let fresh = session.last_seen.elapsed() < stale_after;
        if !fresh {
            log::debug!("Dropping stale session advertisement {id}");
        }
        fresh
    });
}
