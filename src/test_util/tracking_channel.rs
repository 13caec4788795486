use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use crate::message::{SessionId, StreamMessage};
use crate::tunnel::{ChannelEvent, ChannelSender, PeerIdentity, TunnelChannel};

/// A channel sender that records (decoded) messages instead of sending them
#[derive(Debug, Default)]
pub struct TrackingChannelSender {
    tracker: Mutex<Vec<(SessionId, StreamMessage)>>,
    closed: AtomicBool,
}

impl TrackingChannelSender {
    pub fn new() -> Arc<TrackingChannelSender> {
        Default::default()
    }

    /// Creates a channel whose sent messages are tracked by the returned sender, and whose
    ///  inbound events are fed through the returned event sender
    pub fn channel(remote: PeerIdentity) -> (TunnelChannel, Arc<TrackingChannelSender>, mpsc::UnboundedSender<ChannelEvent>) {
        let sender = TrackingChannelSender::new();
        let (events_send, events) = mpsc::unbounded_channel();
        let channel = TunnelChannel {
            remote,
            sender: sender.clone(),
            events,
        };
        (channel, sender, events_send)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<(SessionId, StreamMessage)>> {
        self.tracker.lock()
            .unwrap_or_else(|e| e.into_inner())
    }

    pub fn take_sent(&self) -> Vec<StreamMessage> {
        std::mem::take(&mut *self.lock())
            .into_iter()
            .map(|(_, m)| m)
            .collect()
    }

    pub fn sent_sessions(&self) -> Vec<SessionId> {
        self.lock().iter()
            .map(|(s, _)| *s)
            .collect()
    }

    pub fn assert_message_sent(&self, message: StreamMessage) {
        let mut lock = self.lock();
        if lock.is_empty() {
            panic!("no message was sent, expected {:?}", message);
        }
        let (_, actual) = lock.remove(0);
        assert_eq!(actual, message);
    }

    pub fn assert_no_remaining_messages(&self) {
        let lock = self.lock();
        assert!(lock.is_empty(), "unexpected messages: {:?}", lock);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

#[async_trait]
impl ChannelSender for TrackingChannelSender {
    async fn send(&self, message: Bytes) {
        match StreamMessage::deser(message) {
            Ok(decoded) => self.lock().push(decoded),
            Err(e) => panic!("socket sent an invalid message: {}", e),
        }
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}
