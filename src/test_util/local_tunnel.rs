use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use anyhow::bail;
use async_trait::async_trait;
use bytes::Bytes;
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::tunnel::{AppPort, ChannelEvent, ChannelSender, PeerIdentity, Tunnel, TunnelChannel};

/// How the local tunnel mistreats messages. The defaults deliver everything in order.
#[derive(Debug, Clone, Default)]
pub struct LinkConditions {
    /// drop every n-th message sent on the network (counting across all channels)
    pub drop_every_nth: Option<u64>,
    /// hold back every other message per channel and deliver it after the next one. A held
    ///  message with no successor is released after a short delay.
    pub swap_adjacent: bool,
}

const SWAP_HOLD_TIME: Duration = Duration::from_millis(5);

#[derive(Default)]
struct NetworkState {
    listeners: FxHashMap<(PeerIdentity, AppPort), mpsc::UnboundedSender<TunnelChannel>>,
    withheld_ports: FxHashSet<(PeerIdentity, AppPort)>,
    channel_ends: Vec<Weak<ChannelEnd>>,
}

/// An in-process tunnel network. Each [LocalTunnel] node created from it can open channels to
///  the listeners of all other nodes (and its own).
pub struct LocalTunnelNetwork {
    state: Mutex<NetworkState>,
    conditions: LinkConditions,
    messages_sent: AtomicU64,
}

impl LocalTunnelNetwork {
    pub fn new() -> Arc<LocalTunnelNetwork> {
        Self::with_conditions(LinkConditions::default())
    }

    pub fn with_conditions(conditions: LinkConditions) -> Arc<LocalTunnelNetwork> {
        Arc::new(LocalTunnelNetwork {
            state: Default::default(),
            conditions,
            messages_sent: AtomicU64::new(0),
        })
    }

    pub fn node(self: &Arc<Self>, identity: PeerIdentity) -> Arc<LocalTunnel> {
        Arc::new(LocalTunnel {
            network: self.clone(),
            identity,
        })
    }

    /// the total number of messages that were passed to the network, including dropped ones
    pub fn messages_sent(&self) -> u64 {
        self.messages_sent.load(Ordering::Acquire)
    }

    /// Listen registrations for this node and port are never granted
    pub fn withhold_listen_grant(&self, identity: PeerIdentity, port: AppPort) {
        self.lock_state().withheld_ports.insert((identity, port));
    }

    /// Reports the loss of all open channels to both of their ends
    pub fn sever_all(&self) {
        let ends = std::mem::take(&mut self.lock_state().channel_ends);
        for end in ends.iter().filter_map(|e| e.upgrade()) {
            if !end.closed.swap(true, Ordering::AcqRel) {
                let _ = end.own_events.send(ChannelEvent::Lost);
            }
        }
        debug!("severed all channels");
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, NetworkState> {
        // a panic while holding the lock can only happen in a failing test
        self.state.lock()
            .unwrap_or_else(|e| e.into_inner())
    }

    fn should_drop_next(&self) -> bool {
        let n = self.messages_sent.fetch_add(1, Ordering::AcqRel) + 1;
        match self.conditions.drop_every_nth {
            Some(k) if k > 0 => n % k == 0,
            _ => false,
        }
    }
}

/// One node's view of a [LocalTunnelNetwork]
pub struct LocalTunnel {
    network: Arc<LocalTunnelNetwork>,
    identity: PeerIdentity,
}

impl LocalTunnel {
    pub fn identity(&self) -> PeerIdentity {
        self.identity
    }
}

#[async_trait]
impl Tunnel for LocalTunnel {
    async fn open_channel(&self, target: PeerIdentity, port: AppPort) -> anyhow::Result<TunnelChannel> {
        let mut state = self.network.lock_state();

        let listener = match state.listeners.get(&(target, port)) {
            Some(l) => l.clone(),
            None => bail!("{} has no listener on port {}", target, port),
        };

        let (client_events_send, client_events) = mpsc::unbounded_channel();
        let (server_events_send, server_events) = mpsc::unbounded_channel();

        let client_end = ChannelEnd::new(self.network.clone(), client_events_send.clone(), server_events_send.clone());
        let server_end = ChannelEnd::new(self.network.clone(), server_events_send, client_events_send);
        state.channel_ends.push(Arc::downgrade(&client_end));
        state.channel_ends.push(Arc::downgrade(&server_end));
        drop(state);

        let server_channel = TunnelChannel {
            remote: self.identity,
            sender: server_end,
            events: server_events,
        };
        if listener.send(server_channel).is_err() {
            bail!("listener of {} on port {} is gone", target, port);
        }

        trace!("opened local channel {} -> {} on port {}", self.identity, target, port);
        Ok(TunnelChannel {
            remote: target,
            sender: client_end,
            events: client_events,
        })
    }

    async fn register_listener(&self, port: AppPort) -> anyhow::Result<mpsc::UnboundedReceiver<TunnelChannel>> {
        let key = (self.identity, port);
        {
            let mut state = self.network.lock_state();
            if !state.withheld_ports.contains(&key) {
                if state.listeners.get(&key).is_some_and(|l| !l.is_closed()) {
                    bail!("port {} of {} is already registered", port, self.identity);
                }
                let (send, recv) = mpsc::unbounded_channel();
                state.listeners.insert(key, send);
                return Ok(recv);
            }
        }

        debug!("listen registration for port {} of {} is withheld", port, self.identity);
        std::future::pending().await
    }

    fn unregister_listener(&self, port: AppPort) {
        self.network.lock_state().listeners.remove(&(self.identity, port));
    }
}

struct ChannelEnd {
    network: Arc<LocalTunnelNetwork>,
    own_events: mpsc::UnboundedSender<ChannelEvent>,
    peer_events: mpsc::UnboundedSender<ChannelEvent>,
    closed: AtomicBool,
    held_back: Arc<Mutex<Option<Bytes>>>,
}

impl ChannelEnd {
    fn new(network: Arc<LocalTunnelNetwork>, own_events: mpsc::UnboundedSender<ChannelEvent>, peer_events: mpsc::UnboundedSender<ChannelEvent>) -> Arc<ChannelEnd> {
        Arc::new(ChannelEnd {
            network,
            own_events,
            peer_events,
            closed: AtomicBool::new(false),
            held_back: Default::default(),
        })
    }

    fn deliver(&self, message: Bytes) {
        // the peer may have closed its end, which is fine for a best-effort channel
        let _ = self.peer_events.send(ChannelEvent::Message(message));
    }

    fn lock_held_back(&self) -> std::sync::MutexGuard<'_, Option<Bytes>> {
        self.held_back.lock()
            .unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl ChannelSender for ChannelEnd {
    async fn send(&self, message: Bytes) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        if self.network.should_drop_next() {
            trace!("local tunnel: dropping message of {} bytes", message.len());
            return;
        }
        if !self.network.conditions.swap_adjacent {
            self.deliver(message);
            return;
        }

        let previous = self.lock_held_back().take();
        match previous {
            Some(previous) => {
                self.deliver(message);
                self.deliver(previous);
            }
            None => {
                *self.lock_held_back() = Some(message);

                let held_back = self.held_back.clone();
                let peer_events = self.peer_events.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(SWAP_HOLD_TIME).await;
                    let still_held = held_back.lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .take();
                    if let Some(message) = still_held {
                        let _ = peer_events.send(ChannelEvent::Message(message));
                    }
                });
            }
        }
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.lock_held_back().take();
            let _ = self.peer_events.send(ChannelEvent::Destroyed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::test_peer_identity;
    use tokio::runtime::Builder;

    async fn connect(network: &Arc<LocalTunnelNetwork>) -> (TunnelChannel, TunnelChannel) {
        let server = network.node(test_peer_identity(1));
        let client = network.node(test_peer_identity(2));

        let mut inbound = server.register_listener(AppPort(10)).await.unwrap();
        let client_channel = client.open_channel(test_peer_identity(1), AppPort(10)).await.unwrap();
        let server_channel = inbound.recv().await.unwrap();
        (client_channel, server_channel)
    }

    async fn received(channel: &mut TunnelChannel, n: usize) -> Vec<ChannelEvent> {
        let mut result = Vec::new();
        for _ in 0..n {
            result.push(channel.events.recv().await.unwrap());
        }
        result
    }

    fn msg(b: &'static [u8]) -> ChannelEvent {
        ChannelEvent::Message(Bytes::from_static(b))
    }

    #[test]
    fn test_in_order_delivery() {
        let rt = Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let network = LocalTunnelNetwork::new();
            let (client, mut server) = connect(&network).await;
            assert_eq!(client.remote, test_peer_identity(1));
            assert_eq!(server.remote, test_peer_identity(2));

            client.sender.send(Bytes::from_static(b"a")).await;
            client.sender.send(Bytes::from_static(b"b")).await;
            assert_eq!(received(&mut server, 2).await, vec![msg(b"a"), msg(b"b")]);

            client.sender.close();
            assert_eq!(received(&mut server, 1).await, vec![ChannelEvent::Destroyed]);
            assert_eq!(network.messages_sent(), 2);
        });
    }

    #[test]
    fn test_drop_every_nth() {
        let rt = Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let network = LocalTunnelNetwork::with_conditions(LinkConditions { drop_every_nth: Some(2), swap_adjacent: false });
            let (client, mut server) = connect(&network).await;

            for b in [b"1", b"2", b"3", b"4", b"5"] {
                client.sender.send(Bytes::from_static(b)).await;
            }
            assert_eq!(received(&mut server, 3).await, vec![msg(b"1"), msg(b"3"), msg(b"5")]);
            assert!(server.events.try_recv().is_err());
        });
    }

    #[test]
    fn test_swap_adjacent() {
        let rt = Builder::new_current_thread().enable_all().start_paused(true).build().unwrap();
        rt.block_on(async {
            let network = LocalTunnelNetwork::with_conditions(LinkConditions { drop_every_nth: None, swap_adjacent: true });
            let (client, mut server) = connect(&network).await;

            for b in [b"1", b"2", b"3"] {
                client.sender.send(Bytes::from_static(b)).await;
            }
            // "3" is held back until the hold time expires
            assert_eq!(received(&mut server, 3).await, vec![msg(b"2"), msg(b"1"), msg(b"3")]);
        });
    }

    #[test]
    fn test_sever_all() {
        let rt = Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let network = LocalTunnelNetwork::new();
            let (mut client, mut server) = connect(&network).await;

            network.sever_all();
            assert_eq!(received(&mut client, 1).await, vec![ChannelEvent::Lost]);
            assert_eq!(received(&mut server, 1).await, vec![ChannelEvent::Lost]);

            client.sender.send(Bytes::from_static(b"x")).await;
            assert!(server.events.try_recv().is_err());
        });
    }

    #[test]
    fn test_open_without_listener_fails() {
        let rt = Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let network = LocalTunnelNetwork::new();
            let client = network.node(test_peer_identity(2));
            assert!(client.open_channel(test_peer_identity(1), AppPort(10)).await.is_err());
        });
    }

    #[test]
    fn test_double_registration_fails() {
        let rt = Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let network = LocalTunnelNetwork::new();
            let server = network.node(test_peer_identity(1));
            let _inbound = server.register_listener(AppPort(10)).await.unwrap();
            assert!(server.register_listener(AppPort(10)).await.is_err());

            server.unregister_listener(AppPort(10));
            assert!(server.register_listener(AppPort(10)).await.is_ok());
        });
    }
}
