use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::bail;
use rustc_hash::FxHashMap;
use tokio::sync::Notify;
use tokio::task::AbortHandle;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info};

use crate::config::StreamConfig;
use crate::error::{ListenError, StreamError};
use crate::listen_socket::{AcceptHandler, ListenSocket};
use crate::socket::{Socket, SocketRef, WeakSocketRef};
use crate::tunnel::{AppPort, PeerIdentity, Tunnel};
use crate::util::random::{Random, RngRandom};

/// Identifies one claim of a port, so that a stale holder can not release a later claim
pub(crate) type PortClaim = u64;

#[derive(Default)]
struct PortClaims {
    claims: FxHashMap<AppPort, PortClaim>,
    claim_counter: PortClaim,
}

/// Ports that have a listen socket in this context
#[derive(Default)]
pub(crate) struct PortRegistry {
    ports: Mutex<PortClaims>,
    released: Notify,
}

impl PortRegistry {
    fn lock(&self) -> std::sync::MutexGuard<'_, PortClaims> {
        self.ports.lock()
            .unwrap_or_else(|e| e.into_inner())
    }

    fn try_claim(&self, port: AppPort) -> Option<PortClaim> {
        let mut ports = self.lock();
        if ports.claims.contains_key(&port) {
            return None;
        }
        ports.claim_counter += 1;
        let claim = ports.claim_counter;
        ports.claims.insert(port, claim);
        Some(claim)
    }

    /// Claims `port`, waiting for a listen socket holding it to be closed. `None` for the
    ///  deadline waits indefinitely.
    async fn claim(&self, port: AppPort, deadline: Option<Instant>) -> Option<PortClaim> {
        loop {
            let released = self.released.notified();
            if let Some(claim) = self.try_claim(port) {
                return Some(claim);
            }
            debug!("port {} is in use - waiting for it to be released", port);
            with_deadline(deadline, released).await?;
        }
    }

    pub(crate) fn is_held(&self, port: AppPort, claim: PortClaim) -> bool {
        self.lock().claims.get(&port) == Some(&claim)
    }

    /// Releases `port` if `claim` still holds it
    pub(crate) fn release(&self, port: AppPort, claim: PortClaim) {
        let mut ports = self.lock();
        if ports.claims.get(&port) == Some(&claim) {
            ports.claims.remove(&port);
            drop(ports);
            self.released.notify_waiters();
        }
    }
}

/// Runs `f` until `deadline`, returning `None` if it expired first
async fn with_deadline<F: Future>(deadline: Option<Instant>, f: F) -> Option<F::Output> {
    match deadline {
        Some(deadline) => timeout_at(deadline, f).await.ok(),
        None => Some(f.await),
    }
}

/// The live sockets of a context, so they can be reset when the context shuts down
#[derive(Default)]
pub(crate) struct SocketRegistry {
    sockets: Mutex<Vec<WeakSocketRef>>,
}

impl SocketRegistry {
    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<WeakSocketRef>> {
        self.sockets.lock()
            .unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn register(&self, socket: &SocketRef) {
        let mut sockets = self.lock();
        sockets.retain(|s| s.upgrade().is_some());
        sockets.push(socket.downgrade());
    }

    fn take_all(&self) -> Vec<SocketRef> {
        std::mem::take(&mut *self.lock())
            .into_iter()
            .filter_map(|s| s.upgrade())
            .collect()
    }
}

/// Entry point for opening and accepting streams over a tunnel. Owns the registries of listen
///  ports and live sockets.
pub struct StreamContext {
    tunnel: Arc<dyn Tunnel>,
    random: Arc<dyn Random>,
    ports: Arc<PortRegistry>,
    sockets: Arc<SocketRegistry>,
    listeners: Mutex<Vec<(AppPort, PortClaim, AbortHandle)>>,
}

impl StreamContext {
    pub fn new(tunnel: Arc<dyn Tunnel>) -> StreamContext {
        Self::new_with_random(tunnel, Arc::new(RngRandom {}))
    }

    pub fn new_with_random(tunnel: Arc<dyn Tunnel>, random: Arc<dyn Random>) -> StreamContext {
        StreamContext {
            tunnel,
            random,
            ports: Default::default(),
            sockets: Default::default(),
            listeners: Default::default(),
        }
    }

    /// Opens a stream to `target`'s listener on `port`. Fails with [StreamError::Timeout] if the
    ///  channel is not ready and the handshake complete within `timeout`. A timeout that is too
    ///  large to be represented as a deadline waits indefinitely.
    pub async fn open(&self, target: PeerIdentity, port: AppPort, config: StreamConfig, timeout: Duration) -> anyhow::Result<Socket> {
        config.validate()?;
        let deadline = Instant::now().checked_add(timeout);

        debug!("opening stream to {} on port {}", target, port);
        let channel = match with_deadline(deadline, self.tunnel.open_channel(target, port)).await {
            Some(channel) => channel?,
            None => bail!(StreamError::Timeout),
        };

        let remaining = deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
            .unwrap_or(Duration::MAX);
        let socket = Socket::connect(Arc::new(config), channel, self.random.as_ref(), remaining).await?;
        self.sockets.register(&socket.socket_ref());
        Ok(socket)
    }

    /// Accepts inbound streams on `port`. Binding the port must complete within the configured
    ///  listen timeout, otherwise this fails with [ListenError::BindTimeout].
    pub async fn listen(&self, port: AppPort, config: StreamConfig, handler: Arc<dyn AcceptHandler>) -> anyhow::Result<ListenSocket> {
        config.validate()?;
        let deadline = Instant::now().checked_add(config.listen_timeout);

        let Some(claim) = self.ports.claim(port, deadline).await else {
            bail!(ListenError::BindTimeout);
        };

        let inbound = match with_deadline(deadline, self.tunnel.register_listener(port)).await {
            Some(Ok(inbound)) => inbound,
            Some(Err(e)) => {
                self.ports.release(port, claim);
                return Err(e);
            }
            None => {
                debug!("tunnel did not grant port {} in time", port);
                self.tunnel.unregister_listener(port);
                self.ports.release(port, claim);
                bail!(ListenError::BindTimeout);
            }
        };

        let listen_socket = ListenSocket::start(
            port,
            claim,
            self.tunnel.clone(),
            inbound,
            handler,
            Arc::new(config),
            self.random.clone(),
            self.ports.clone(),
            self.sockets.clone(),
        );

        let mut listeners = self.listeners.lock()
            .unwrap_or_else(|e| e.into_inner());
        listeners.retain(|(_, _, h)| !h.is_finished());
        listeners.push((port, claim, listen_socket.abort_handle()));
        Ok(listen_socket)
    }

    /// Stops all listen sockets, releasing their ports, and resets all live sockets of this
    ///  context. Listen sockets that are dropped afterwards leave the port alone.
    pub async fn shutdown(&self) {
        let listeners = std::mem::take(&mut *self.listeners.lock()
            .unwrap_or_else(|e| e.into_inner()));
        for (port, claim, accept_loop) in listeners {
            accept_loop.abort();
            if self.ports.is_held(port, claim) {
                self.tunnel.unregister_listener(port);
                self.ports.release(port, claim);
            }
        }

        let sockets = self.sockets.take_all();
        info!("shutting down stream context with {} live socket(s)", sockets.len());
        for socket in sockets {
            socket.reset().await;
        }
    }
}
