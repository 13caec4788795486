use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, debug_span, info, Instrument};

use crate::config::StreamConfig;
use crate::context::{PortClaim, PortRegistry, SocketRegistry};
use crate::socket::Socket;
use crate::tunnel::{AppPort, Tunnel, TunnelChannel};
use crate::util::random::Random;

pub enum AcceptDecision {
    Accept,
    /// hands the socket back so the peer can be refused with a Reset
    Reject(Socket),
}

/// Application callback for inbound streams
#[async_trait]
pub trait AcceptHandler: Send + Sync + 'static {
    /// Called for every inbound stream once its Hello arrived. The socket is in `HandshakeWait`:
    ///  it can be written to, but data goes out only after the connection is accepted.
    async fn on_connection(&self, socket: Socket) -> AcceptDecision;
}

/// Accepts inbound streams on a port until it is closed or dropped
pub struct ListenSocket {
    port: AppPort,
    claim: PortClaim,
    tunnel: Arc<dyn Tunnel>,
    ports: Arc<PortRegistry>,
    accept_loop: JoinHandle<()>,
}

impl Drop for ListenSocket {
    fn drop(&mut self) {
        self.accept_loop.abort();
        // the context may have released the port on shutdown, and it may have been claimed again
        if self.ports.is_held(self.port, self.claim) {
            self.tunnel.unregister_listener(self.port);
            self.ports.release(self.port, self.claim);
        }
    }
}

impl ListenSocket {
    pub(crate) fn start(
        port: AppPort,
        claim: PortClaim,
        tunnel: Arc<dyn Tunnel>,
        inbound: mpsc::UnboundedReceiver<TunnelChannel>,
        handler: Arc<dyn AcceptHandler>,
        config: Arc<StreamConfig>,
        random: Arc<dyn Random>,
        ports: Arc<PortRegistry>,
        sockets: Arc<SocketRegistry>,
    ) -> ListenSocket {
        info!("listening on port {}", port);
        let accept_loop = tokio::spawn(
            Self::do_accept_loop(inbound, handler, config, random, sockets)
                .instrument(debug_span!("listen", %port))
        );

        ListenSocket {
            port,
            claim,
            tunnel,
            ports,
            accept_loop,
        }
    }

    pub fn port(&self) -> AppPort {
        self.port
    }

    pub(crate) fn abort_handle(&self) -> AbortHandle {
        self.accept_loop.abort_handle()
    }

    /// Stops accepting streams and releases the port. Streams that were accepted already are
    ///  not affected.
    pub fn close(self) {
        debug!("closing listen socket on port {}", self.port);
    }

    async fn do_accept_loop(
        mut inbound: mpsc::UnboundedReceiver<TunnelChannel>,
        handler: Arc<dyn AcceptHandler>,
        config: Arc<StreamConfig>,
        random: Arc<dyn Random>,
        sockets: Arc<SocketRegistry>,
    ) {
        while let Some(channel) = inbound.recv().await {
            debug!("inbound channel from {}", channel.remote);
            tokio::spawn(
                Self::handshake(channel, handler.clone(), config.clone(), random.clone(), sockets.clone())
                    .in_current_span()
            );
        }
        debug!("tunnel revoked the listener registration");
    }

    async fn handshake(channel: TunnelChannel, handler: Arc<dyn AcceptHandler>, config: Arc<StreamConfig>, random: Arc<dyn Random>, sockets: Arc<SocketRegistry>) {
        let remote = channel.remote;
        let socket = match Socket::await_hello(config, channel, random.as_ref()).await {
            Ok(socket) => socket,
            Err(e) => {
                debug!("no Hello from {}: {}", remote, e);
                return;
            }
        };

        let socket_ref = socket.socket_ref();
        sockets.register(&socket_ref);

        match handler.on_connection(socket).await {
            AcceptDecision::Accept => socket_ref.accept().await,
            AcceptDecision::Reject(socket) => {
                debug!("application rejected stream from {}", remote);
                socket.close().await;
            }
        }
    }
}
