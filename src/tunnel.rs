use std::fmt::{Debug, Display, Formatter};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
#[cfg(test)] use mockall::automock;
use tokio::sync::mpsc;

/// Cryptographic identity of a network participant, as managed by the tunnel substrate
#[derive(Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct PeerIdentity([u8; 32]);

impl PeerIdentity {
    pub fn from_bytes(bytes: [u8; 32]) -> PeerIdentity {
        PeerIdentity(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl Display for PeerIdentity {
    /// abbreviated, for logging
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        for b in &self.0[..4] {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

impl Debug for PeerIdentity {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "PeerIdentity({})", self)
    }
}

/// Application-level port: the tunnel routes inbound channels to the listener for their port
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Ord, PartialOrd)]
pub struct AppPort(pub u32);

impl Display for AppPort {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum ChannelEvent {
    /// one message, exactly as it was passed to [ChannelSender::send] on the other side
    Message(Bytes),
    /// the peer closed its end of the channel
    Destroyed,
    /// the tunnel lost the channel, e.g. because the route to the peer broke down
    Lost,
}

/// Sending side of a tunnel channel. Delivery is best effort: messages may be dropped,
///  duplicated or reordered, and there is no feedback either way.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ChannelSender: Send + Sync + 'static {
    async fn send(&self, message: Bytes);

    /// Releases the channel. Sending after closing is a no-op.
    fn close(&self);
}

/// A logical channel between two peers, as handed out by the tunnel substrate
pub struct TunnelChannel {
    pub remote: PeerIdentity,
    pub sender: Arc<dyn ChannelSender>,
    pub events: mpsc::UnboundedReceiver<ChannelEvent>,
}

impl Debug for TunnelChannel {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelChannel")
            .field("remote", &self.remote)
            .finish()
    }
}

/// The overlay tunnel substrate the stream layer is built on
#[async_trait]
pub trait Tunnel: Send + Sync + 'static {
    /// Opens a channel to `target`'s listener on `port`. Returns once the channel is ready,
    ///  or fails if the tunnel can not establish it.
    async fn open_channel(&self, target: PeerIdentity, port: AppPort) -> anyhow::Result<TunnelChannel>;

    /// Registers for inbound channels on `port`. The tunnel may take a while to grant the
    ///  registration, or fail it if the port is taken.
    async fn register_listener(&self, port: AppPort) -> anyhow::Result<mpsc::UnboundedReceiver<TunnelChannel>>;

    fn unregister_listener(&self, port: AppPort);
}
