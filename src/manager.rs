//! Named peers with shared passive listeners.
//!
//! Passive TCP peers on the same port share one listener. Accepted sockets
//! are routed to the peer whose configured `address` matches the source IP.
//! The listener lives as long as at least one peer references its port.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::ConnectMode;
use crate::error::{Result, SecsError};
use crate::session::{Session, SessionBuilder};
use crate::transport::Endpoint;

/// Pause after a failed accept.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

type Routes = Arc<Mutex<HashMap<IpAddr, mpsc::Sender<TcpStream>>>>;

struct Peer {
    session: Arc<dyn Session>,
    /// Port and source IP when routed through a shared listener.
    route: Option<(u16, IpAddr)>,
}

struct PortListener {
    routes: Routes,
    task: JoinHandle<()>,
    refs: usize,
}

/// Owns every configured peer session.
#[derive(Default)]
pub struct ConnectionManager {
    peers: tokio::sync::Mutex<HashMap<String, Peer>>,
    listeners: tokio::sync::Mutex<HashMap<u16, PortListener>>,
}

impl ConnectionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build, register and enable a peer.
    pub async fn add_peer(&self, builder: SessionBuilder) -> Result<Arc<dyn Session>> {
        let name = builder.name().to_string();
        let mut peers = self.peers.lock().await;
        if peers.contains_key(&name) {
            return Err(SecsError::DuplicatePeer(name));
        }

        let passive = match builder.settings().transport.tcp() {
            Some((address, port, ConnectMode::Passive)) => {
                let ip = address.parse::<IpAddr>().map_err(|_| {
                    SecsError::Config(format!(
                        "{}: passive peer address {:?} is not an IP address",
                        name, address
                    ))
                })?;
                Some((port, ip))
            }
            _ => None,
        };

        let (session, route) = match passive {
            Some((port, ip)) => {
                let incoming = self.route(port, ip, &name).await?;
                match builder.build_with_endpoint(Endpoint::routed(incoming)) {
                    Ok(session) => (session, Some((port, ip))),
                    Err(e) => {
                        self.unroute(port, ip).await;
                        return Err(e);
                    }
                }
            }
            None => (builder.build()?, None),
        };

        session.enable();
        tracing::info!("Added peer {}", name);
        peers.insert(
            name,
            Peer {
                session: session.clone(),
                route,
            },
        );
        Ok(session)
    }

    /// Disable and forget a peer, releasing its listener reference.
    pub async fn remove_peer(&self, name: &str) -> Result<()> {
        let peer = self
            .peers
            .lock()
            .await
            .remove(name)
            .ok_or_else(|| SecsError::UnknownPeer(name.to_string()))?;

        peer.session.disable().await;
        if let Some((port, ip)) = peer.route {
            self.unroute(port, ip).await;
        }
        tracing::info!("Removed peer {}", name);
        Ok(())
    }

    pub async fn peer(&self, name: &str) -> Option<Arc<dyn Session>> {
        self.peers.lock().await.get(name).map(|p| p.session.clone())
    }

    /// Names of all peers, sorted.
    pub async fn peers(&self) -> Vec<String> {
        let mut names: Vec<String> = self.peers.lock().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Disable every peer and close every listener.
    pub async fn stop(&self) {
        let peers: Vec<(String, Peer)> = self.peers.lock().await.drain().collect();
        for (name, peer) in peers {
            peer.session.disable().await;
            tracing::debug!("Stopped peer {}", name);
        }

        for (port, listener) in self.listeners.lock().await.drain() {
            listener.task.abort();
            tracing::debug!("Closed listener on port {}", port);
        }
    }

    #[cfg(test)]
    async fn listener_count(&self) -> usize {
        self.listeners.lock().await.len()
    }

    /// Register a route on the shared listener for `port`, binding it first
    /// if needed.
    async fn route(&self, port: u16, ip: IpAddr, name: &str) -> Result<mpsc::Receiver<TcpStream>> {
        let mut listeners = self.listeners.lock().await;

        if !listeners.contains_key(&port) {
            let listener = TcpListener::bind(SocketAddr::from(([0, 0, 0, 0], port))).await?;
            let routes = Routes::default();
            let task = tokio::spawn(accept_loop(listener, routes.clone(), port));
            tracing::info!("Listening on port {}", port);
            listeners.insert(
                port,
                PortListener {
                    routes,
                    task,
                    refs: 0,
                },
            );
        }

        let Some(entry) = listeners.get_mut(&port) else {
            return Err(SecsError::Config(format!("no listener on port {}", port)));
        };
        let mut routes = lock(&entry.routes);
        if routes.contains_key(&ip) {
            return Err(SecsError::Config(format!(
                "{}: {} is already routed on port {}",
                name, ip, port
            )));
        }
        let (tx, rx) = mpsc::channel(1);
        routes.insert(ip, tx);
        drop(routes);
        entry.refs += 1;
        Ok(rx)
    }

    async fn unroute(&self, port: u16, ip: IpAddr) {
        let mut listeners = self.listeners.lock().await;
        let Some(entry) = listeners.get_mut(&port) else {
            return;
        };

        lock(&entry.routes).remove(&ip);
        entry.refs = entry.refs.saturating_sub(1);
        if entry.refs == 0 {
            if let Some(listener) = listeners.remove(&port) {
                listener.task.abort();
                tracing::info!("Closed listener on port {}", port);
            }
        }
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        for listener in self.listeners.get_mut().values() {
            listener.task.abort();
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

async fn accept_loop(listener: TcpListener, routes: Routes, port: u16) {
    loop {
        let (stream, addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                tracing::warn!("Accept on port {} failed: {}", port, e);
                tokio::time::sleep(ACCEPT_BACKOFF).await;
                continue;
            }
        };

        let ip = addr.ip().to_canonical();
        let route = lock(&routes).get(&ip).cloned();
        match route {
            Some(tx) => {
                if tx.try_send(stream).is_err() {
                    tracing::warn!("Peer at {} is busy, dropping connection", addr);
                }
            }
            None => tracing::warn!("Connection from unknown peer {} on port {}", addr, port),
        }
    }
}
