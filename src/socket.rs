use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use tokio::select;
use tokio::sync::{mpsc, oneshot, Notify, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, debug_span, info, trace, warn, Instrument};

use crate::backoff::RetransmitBackoff;
use crate::config::StreamConfig;
use crate::error::{StreamError, SubmitError, WriteFailure};
use crate::message::{HelloMessage, MessageKind, SessionId, StreamMessage};
use crate::receive_buffer::{DataOutcome, ReceiveBuffer};
use crate::send_window::SendWindow;
use crate::seq::SeqNr;
use crate::tunnel::{ChannelEvent, ChannelSender, PeerIdentity, TunnelChannel};
use crate::util::random::Random;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ConnectionState {
    /// client socket before the Hello is sent
    Init,
    /// server socket waiting for the Hello on a new channel
    Listen,
    HandshakeWait,
    Established,
    ReceiveCloseWait,
    ReceiveClosed,
    TransmitCloseWait,
    TransmitClosed,
    CloseWait,
    Closed,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ShutdownDirection {
    Read,
    Write,
    /// shuts down the transmit direction, then the receive direction, then closes the stream
    Both,
    /// closes the stream with a single Close exchange. Pending reads and writes fail with
    ///  `Shutdown`, and data that is not acknowledged yet is discarded.
    Close,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum Role {
    Client,
    Server,
}

/// Progress of a locally initiated half-close
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum HalfClose {
    Open,
    Closing,
    Closed,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum OperationKind {
    Read,
    Write,
    Shutdown,
}

type OperationId = u64;

/// `None` if the timeout is too long to be represented, i.e. there is no deadline
fn deadline_after(now: Instant, timeout: Duration) -> Option<Instant> {
    now.checked_add(timeout)
}

fn is_due(deadline: Option<Instant>, now: Instant) -> bool {
    deadline.is_some_and(|d| d <= now)
}

struct PendingRead {
    id: OperationId,
    deadline: Option<Instant>,
    reply: oneshot::Sender<Result<Bytes, StreamError>>,
}

struct PendingWrite {
    id: OperationId,
    /// first sequence number of this write
    start: SeqNr,
    /// sequence number after the last segment of this write
    end: SeqNr,
    len: usize,
    deadline: Option<Instant>,
    reply: oneshot::Sender<Result<usize, WriteFailure>>,
}

struct PendingShutdown {
    id: OperationId,
    direction: ShutdownDirection,
    deadline: Option<Instant>,
    reply: oneshot::Sender<Result<(), StreamError>>,
}

/// Client: waiting for HelloAck. Server: waiting for Hello.
struct PendingOpen {
    deadline: Option<Instant>,
    reply: oneshot::Sender<Result<(), StreamError>>,
}

/// A control message that is retransmitted until the peer acknowledges it
struct ControlRetransmit {
    message: StreamMessage,
    deadline: Instant,
    backoff: RetransmitBackoff,
}

struct SocketInner {
    config: Arc<StreamConfig>,
    role: Role,
    remote: PeerIdentity,
    session: SessionId,
    state: ConnectionState,
    channel: Arc<dyn ChannelSender>,
    wake: Arc<Notify>,

    local_isn: SeqNr,
    remote_isn: Option<SeqNr>,
    send_window: SendWindow,
    receive_buffer: ReceiveBuffer,
    /// the receive window in the last Ack that was sent
    advertised_window: u32,

    local_transmit: HalfClose,
    local_receive: HalfClose,
    remote_transmit_closed: bool,
    remote_receive_closed: bool,

    pending_open: Option<PendingOpen>,
    pending_read: Option<PendingRead>,
    pending_write: Option<PendingWrite>,
    pending_shutdown: Option<PendingShutdown>,
    control: Option<ControlRetransmit>,
    ack_deadline: Option<Instant>,
    linger_deadline: Option<Instant>,

    num_violations: u32,
    operation_counter: OperationId,
    /// set on the transition to `Closed`: every subsequent call fails with this error
    terminal_error: Option<StreamError>,
}

impl SocketInner {
    fn new(
        config: Arc<StreamConfig>,
        role: Role,
        remote: PeerIdentity,
        channel: Arc<dyn ChannelSender>,
        session: SessionId,
        local_isn: SeqNr,
        state: ConnectionState,
    ) -> SocketInner {
        let receive_buffer = ReceiveBuffer::new(SeqNr::ZERO, config.receive_buffer_size);
        let advertised_window = receive_buffer.window_remaining();

        SocketInner {
            send_window: SendWindow::new(&config, local_isn),
            receive_buffer,
            advertised_window,
            config,
            role,
            remote,
            session,
            state,
            channel,
            wake: Default::default(),
            local_isn,
            remote_isn: None,
            local_transmit: HalfClose::Open,
            local_receive: HalfClose::Open,
            remote_transmit_closed: false,
            remote_receive_closed: false,
            pending_open: None,
            pending_read: None,
            pending_write: None,
            pending_shutdown: None,
            control: None,
            ack_deadline: None,
            linger_deadline: None,
            num_violations: 0,
            operation_counter: 0,
            terminal_error: None,
        }
    }

    fn is_handshake_complete(&self) -> bool {
        !matches!(self.state, ConnectionState::Init | ConnectionState::Listen | ConnectionState::HandshakeWait)
    }

    fn next_operation_id(&mut self) -> OperationId {
        self.operation_counter += 1;
        self.operation_counter
    }

    fn check_usable(&self) -> Result<(), SubmitError> {
        match self.terminal_error {
            Some(e) => Err(SubmitError::Stream(e)),
            None => Ok(()),
        }
    }

    fn hello(&self) -> HelloMessage {
        HelloMessage {
            initial_seq: self.local_isn,
            receive_window: self.receive_buffer.window_remaining(),
        }
    }

    /// Derives the connection state from the half-close progress of both directions. The
    ///  handshake states and the final close states are set explicitly by their transitions.
    fn update_state(&mut self) {
        if !self.is_handshake_complete() || matches!(self.state, ConnectionState::CloseWait | ConnectionState::Closed) {
            return;
        }
        let new_state = match (self.local_transmit, self.local_receive) {
            (HalfClose::Open, HalfClose::Open) => ConnectionState::Established,
            (HalfClose::Closing, _) => ConnectionState::TransmitCloseWait,
            (_, HalfClose::Closing) => ConnectionState::ReceiveCloseWait,
            (HalfClose::Closed, HalfClose::Open) => ConnectionState::TransmitClosed,
            (HalfClose::Open, HalfClose::Closed) => ConnectionState::ReceiveClosed,
            (HalfClose::Closed, HalfClose::Closed) => return,
        };
        if new_state != self.state {
            debug!("{:?} -> {:?}", self.state, new_state);
            self.state = new_state;
        }
    }

    async fn send(&self, message: &StreamMessage) {
        trace!("sending {:?} to {}", message.kind(), self.remote);
        self.channel.send(message.to_bytes(self.session)).await;
    }

    async fn send_ack(&mut self) {
        let ack = self.receive_buffer.ack_message();
        self.advertised_window = ack.receive_window_remaining;
        self.ack_deadline = None;
        self.send(&StreamMessage::Ack(ack)).await;
    }

    fn schedule_ack(&mut self, now: Instant, hint: Option<Duration>) {
        let due = now + hint.unwrap_or(Duration::ZERO);
        self.ack_deadline = Some(match self.ack_deadline {
            Some(existing) if existing < due => existing,
            _ => due,
        });
    }

    async fn send_control(&mut self, message: StreamMessage, now: Instant) {
        let backoff = self.config.retransmit_backoff();
        let deadline = now + backoff.current();
        self.send(&message).await;
        self.control = Some(ControlRetransmit { message, deadline, backoff });
    }

    fn is_control_pending(&self, kind: MessageKind) -> bool {
        self.control.as_ref()
            .is_some_and(|c| c.message.kind() == kind)
    }

    async fn start_handshake(&mut self, now: Instant) {
        debug!("sending Hello to {}, initial sequence number {}", self.remote, self.local_isn);
        self.state = ConnectionState::HandshakeWait;
        self.send_control(StreamMessage::Hello(self.hello()), now).await;
    }

    /// Server side: the application accepted the connection
    async fn accept(&mut self, now: Instant) {
        if self.role != Role::Server || self.state != ConnectionState::HandshakeWait {
            return;
        }
        self.send(&StreamMessage::HelloAck(self.hello())).await;
        info!("accepted stream from {}", self.remote);
        self.state = ConnectionState::Established;
        self.update_state();
        self.transmit_new_data(now).await;
    }

    async fn reset(&mut self) {
        if self.state == ConnectionState::Closed {
            return;
        }
        self.send(&StreamMessage::Reset).await;
        self.teardown(StreamError::Shutdown);
    }

    async fn transmit_new_data(&mut self, now: Instant) {
        if !self.is_handshake_complete() || self.state == ConnectionState::Closed {
            return;
        }
        for data in self.send_window.poll_transmit(now) {
            trace!("sending data #{} with {} bytes", data.seq, data.payload.len());
            self.send(&StreamMessage::Data(data)).await;
        }
        self.drive_pending_shutdown(now).await;
    }

    /// Sends the control message for the shutdown in progress, if it can go out now and is not
    ///  being retransmitted already
    async fn drive_pending_shutdown(&mut self, now: Instant) {
        if self.pending_shutdown.is_none() || self.control.is_some() || !self.is_handshake_complete() {
            return;
        }
        if self.local_transmit == HalfClose::Closing {
            // everything written must be acknowledged before the peer learns that there is no more
            if self.send_window.is_empty() {
                self.send_control(StreamMessage::TransmitClose, now).await;
            }
        }
        else if self.local_receive == HalfClose::Closing {
            self.send_control(StreamMessage::ReceiveClose, now).await;
        }
        else if self.local_receive == HalfClose::Closed && self.local_transmit == HalfClose::Closed && self.state != ConnectionState::CloseWait {
            // direct full close, possibly requested before the handshake completed
            self.start_close(now).await;
        }
    }

    fn submit_read(&mut self, timeout: Duration, now: Instant) -> Result<(OperationId, oneshot::Receiver<Result<Bytes, StreamError>>), SubmitError> {
        self.check_usable()?;
        if self.local_receive != HalfClose::Open {
            return Err(SubmitError::Stream(StreamError::Shutdown));
        }
        if self.pending_read.as_ref().is_some_and(|r| r.reply.is_closed()) {
            trace!("previous read handle was dropped");
            self.pending_read = None;
        }
        if self.pending_read.is_some() {
            return Err(SubmitError::AlreadyPending);
        }

        let id = self.next_operation_id();
        let (reply, receiver) = oneshot::channel();
        self.pending_read = Some(PendingRead { id, deadline: deadline_after(now, timeout), reply });
        self.complete_read_if_possible(now);
        Ok((id, receiver))
    }

    fn complete_read_if_possible(&mut self, now: Instant) {
        let Some(read) = self.pending_read.as_ref() else {
            return;
        };
        if read.reply.is_closed() {
            // the application dropped the handle without waiting for it
            self.pending_read = None;
            return;
        }

        let result = if self.receive_buffer.has_ready_data() {
            let data = self.receive_buffer.take_ready();
            trace!("delivering {} bytes to the application", data.len());
            if (self.advertised_window as usize) < self.config.max_payload_size {
                // the peer may be waiting for the window to open
                self.schedule_ack(now, None);
            }
            Ok(data)
        }
        else if self.remote_transmit_closed {
            Err(StreamError::Shutdown)
        }
        else {
            return;
        };

        if let Some(read) = self.pending_read.take() {
            let _ = read.reply.send(result);
        }
    }

    async fn submit_write(&mut self, data: Bytes, timeout: Duration, now: Instant) -> Result<(OperationId, oneshot::Receiver<Result<usize, WriteFailure>>), SubmitError> {
        self.check_usable()?;
        if self.local_transmit != HalfClose::Open || self.remote_receive_closed {
            return Err(SubmitError::Stream(StreamError::Shutdown));
        }
        if self.pending_write.as_ref().is_some_and(|w| w.reply.is_closed()) {
            // same as a cancelled write: its segments stay queued
            trace!("previous write handle was dropped");
            self.pending_write = None;
        }
        if self.pending_write.is_some() {
            return Err(SubmitError::AlreadyPending);
        }

        let id = self.next_operation_id();
        let (reply, receiver) = oneshot::channel();
        if data.is_empty() {
            let _ = reply.send(Ok(0));
            return Ok((id, receiver));
        }

        let len = data.len();
        let start = self.send_window.send_next();
        let end = self.send_window.enqueue(data);
        self.pending_write = Some(PendingWrite { id, start, end, len, deadline: deadline_after(now, timeout), reply });

        self.transmit_new_data(now).await;
        Ok((id, receiver))
    }

    fn complete_write_if_done(&mut self) {
        let is_done = self.pending_write.as_ref()
            .is_some_and(|w| !self.send_window.send_base().is_before(w.end));
        if is_done {
            if let Some(write) = self.pending_write.take() {
                trace!("write of {} bytes is acknowledged", write.len);
                let _ = write.reply.send(Ok(write.len));
            }
        }
    }

    fn fail_write(&mut self, error: StreamError) {
        if let Some(write) = self.pending_write.take() {
            let unconfirmed_bytes = self.send_window.unconfirmed_bytes_from(write.start);
            let _ = write.reply.send(Err(WriteFailure { error, unconfirmed_bytes }));
        }
    }

    fn fail_read(&mut self, error: StreamError) {
        if let Some(read) = self.pending_read.take() {
            let _ = read.reply.send(Err(error));
        }
    }

    async fn submit_shutdown(&mut self, direction: ShutdownDirection, timeout: Duration, now: Instant) -> Result<(OperationId, oneshot::Receiver<Result<(), StreamError>>), SubmitError> {
        self.check_usable()?;
        if self.pending_shutdown.as_ref().is_some_and(|s| s.reply.is_closed()) {
            trace!("previous shutdown handle was dropped");
            self.pending_shutdown = None;
            self.release_shutdown_control();
        }
        if self.pending_shutdown.is_some() {
            return Err(SubmitError::AlreadyPending);
        }

        let id = self.next_operation_id();
        let (reply, receiver) = oneshot::channel();

        let is_done = match direction {
            ShutdownDirection::Write => self.local_transmit == HalfClose::Closed,
            ShutdownDirection::Read => self.local_receive == HalfClose::Closed,
            ShutdownDirection::Both | ShutdownDirection::Close => false,
        };
        if is_done {
            let _ = reply.send(Ok(()));
            return Ok((id, receiver));
        }

        debug!("shutting down {:?}", direction);
        self.pending_shutdown = Some(PendingShutdown { id, direction, deadline: deadline_after(now, timeout), reply });
        match direction {
            ShutdownDirection::Write => self.begin_transmit_close(now).await,
            ShutdownDirection::Read => self.begin_receive_close(now).await,
            ShutdownDirection::Both => self.continue_shutdown_both(now).await,
            ShutdownDirection::Close => self.begin_full_close(now).await,
        }
        Ok((id, receiver))
    }

    async fn begin_transmit_close(&mut self, now: Instant) {
        self.local_transmit = HalfClose::Closing;
        self.update_state();
        self.drive_pending_shutdown(now).await;
    }

    async fn begin_receive_close(&mut self, now: Instant) {
        self.local_receive = HalfClose::Closing;
        self.update_state();
        self.fail_read(StreamError::Shutdown);
        self.receive_buffer.clear();
        self.ack_deadline = None;
        self.drive_pending_shutdown(now).await;
    }

    async fn continue_shutdown_both(&mut self, now: Instant) {
        match (self.local_transmit, self.local_receive) {
            (HalfClose::Open, _) | (HalfClose::Closing, _) => self.begin_transmit_close(now).await,
            (HalfClose::Closed, HalfClose::Open) | (HalfClose::Closed, HalfClose::Closing) => self.begin_receive_close(now).await,
            (HalfClose::Closed, HalfClose::Closed) => {
                if self.state == ConnectionState::CloseWait {
                    self.take_over_close(now).await;
                }
                else {
                    self.start_close(now).await;
                }
            }
        }
    }

    /// An automatic close is in progress: it now has an owner
    async fn take_over_close(&mut self, now: Instant) {
        self.linger_deadline = None;
        if self.control.is_none() {
            self.send_control(StreamMessage::Close, now).await;
        }
    }

    async fn begin_full_close(&mut self, now: Instant) {
        if self.state == ConnectionState::CloseWait {
            self.take_over_close(now).await;
            return;
        }

        self.fail_read(StreamError::Shutdown);
        self.receive_buffer.clear();
        self.ack_deadline = None;
        self.fail_write(StreamError::Shutdown);
        self.send_window.clear();

        if !self.is_control_pending(MessageKind::Hello) {
            self.control = None;
        }
        self.local_transmit = HalfClose::Closed;
        self.local_receive = HalfClose::Closed;
        self.drive_pending_shutdown(now).await;
    }

    async fn on_half_close_complete(&mut self, direction: ShutdownDirection, now: Instant) {
        self.control = None;

        let is_requested_direction = self.pending_shutdown.as_ref()
            .is_some_and(|s| s.direction == direction);
        if is_requested_direction {
            if let Some(shutdown) = self.pending_shutdown.take() {
                let _ = shutdown.reply.send(Ok(()));
            }
        }

        if self.local_transmit == HalfClose::Closed && self.local_receive == HalfClose::Closed {
            self.start_close(now).await;
        }
        else {
            self.update_state();
            let is_shutting_down_both = self.pending_shutdown.as_ref()
                .is_some_and(|s| s.direction == ShutdownDirection::Both);
            if is_shutting_down_both {
                self.continue_shutdown_both(now).await;
            }
        }
    }

    async fn start_close(&mut self, now: Instant) {
        debug!("both directions are shut down - closing");
        self.state = ConnectionState::CloseWait;
        if self.pending_shutdown.is_none() {
            self.linger_deadline = deadline_after(now, self.config.linger_timeout);
        }
        self.send_control(StreamMessage::Close, now).await;
    }

    fn finish_close(&mut self) {
        if let Some(shutdown) = self.pending_shutdown.take() {
            let _ = shutdown.reply.send(Ok(()));
        }
        info!("stream to {} closed", self.remote);
        self.teardown(StreamError::Shutdown);
    }

    fn cancel(&mut self, kind: OperationKind, id: OperationId) {
        match kind {
            OperationKind::Read => {
                if self.pending_read.as_ref().is_some_and(|r| r.id == id) {
                    trace!("read cancelled");
                    self.pending_read = None;
                }
            }
            OperationKind::Write => {
                if self.pending_write.as_ref().is_some_and(|w| w.id == id) {
                    // the segments stay queued: the peer may have received some of them already
                    trace!("write cancelled");
                    self.pending_write = None;
                }
            }
            OperationKind::Shutdown => {
                if self.pending_shutdown.as_ref().is_some_and(|s| s.id == id) {
                    trace!("shutdown cancelled");
                    self.pending_shutdown = None;
                    self.release_shutdown_control();
                }
            }
        }
    }

    /// Stops retransmitting the control message of a shutdown that has no owner any more
    fn release_shutdown_control(&mut self) {
        if self.state == ConnectionState::CloseWait {
            if self.linger_deadline.is_none() {
                self.linger_deadline = deadline_after(Instant::now(), self.config.linger_timeout);
            }
        }
        else if !self.is_control_pending(MessageKind::Hello) {
            self.control = None;
        }
    }

    async fn on_violation(&mut self, is_severe: bool, reason: &str) {
        self.num_violations += 1;
        warn!("protocol violation by {}: {}", self.remote, reason);

        if is_severe || self.num_violations > self.config.max_protocol_violations {
            warn!("resetting stream to {} after {} protocol violation(s)", self.remote, self.num_violations);
            self.send(&StreamMessage::Reset).await;
            self.teardown(StreamError::ProtocolViolation);
        }
    }

    /// The transition to `Closed`. All pending completions are delivered with `error`, and all
    ///  resources are released. Idempotent.
    fn teardown(&mut self, error: StreamError) {
        if self.state == ConnectionState::Closed {
            return;
        }
        debug!("{:?} -> Closed: {}", self.state, error);
        self.state = ConnectionState::Closed;
        self.terminal_error = Some(error);

        if let Some(open) = self.pending_open.take() {
            let _ = open.reply.send(Err(error));
        }
        self.fail_read(error);
        self.fail_write(error);
        if let Some(shutdown) = self.pending_shutdown.take() {
            let _ = shutdown.reply.send(Err(error));
        }

        self.send_window.clear();
        self.receive_buffer.clear();
        self.control = None;
        self.ack_deadline = None;
        self.linger_deadline = None;

        self.channel.close();
        self.wake.notify_one();
    }

    fn next_deadline(&self) -> Option<Instant> {
        [
            self.pending_open.as_ref().and_then(|o| o.deadline),
            self.pending_read.as_ref().and_then(|r| r.deadline),
            self.pending_write.as_ref().and_then(|w| w.deadline),
            self.pending_shutdown.as_ref().and_then(|s| s.deadline),
            self.control.as_ref().map(|c| c.deadline),
            self.ack_deadline,
            self.linger_deadline,
            self.send_window.retransmit_deadline(),
        ]
            .into_iter()
            .flatten()
            .min()
    }

    async fn on_timer(&mut self, now: Instant) {
        if self.pending_open.as_ref().is_some_and(|o| is_due(o.deadline, now)) {
            debug!("handshake with {} timed out", self.remote);
            self.teardown(StreamError::Timeout);
            return;
        }
        if is_due(self.linger_deadline, now) {
            debug!("close exchange with {} timed out", self.remote);
            self.teardown(StreamError::Timeout);
            return;
        }

        if self.pending_read.as_ref().is_some_and(|r| is_due(r.deadline, now)) {
            trace!("read timed out");
            self.fail_read(StreamError::Timeout);
        }
        if self.pending_write.as_ref().is_some_and(|w| is_due(w.deadline, now)) {
            trace!("write timed out");
            self.fail_write(StreamError::Timeout);
        }
        if self.pending_shutdown.as_ref().is_some_and(|s| is_due(s.deadline, now)) {
            debug!("shutdown timed out");
            if let Some(shutdown) = self.pending_shutdown.take() {
                let _ = shutdown.reply.send(Err(StreamError::Timeout));
            }
            if self.state == ConnectionState::CloseWait {
                self.teardown(StreamError::Timeout);
                return;
            }
            self.release_shutdown_control();
        }

        if is_due(self.ack_deadline, now) {
            self.send_ack().await;
        }

        if let Some(control) = self.control.as_mut() {
            if control.deadline <= now {
                let timeout = control.backoff.on_timeout();
                control.deadline = now + timeout;
                let message = control.message.clone();
                debug!("retransmitting {:?}, next timeout {:?}", message.kind(), timeout);
                self.send(&message).await;
            }
        }

        if let Some(data) = self.send_window.on_retransmit_timeout(now) {
            self.send(&StreamMessage::Data(data)).await;
        }
        self.transmit_new_data(now).await;
    }

    async fn on_message(&mut self, buf: Bytes, now: Instant) {
        let (session, message) = match StreamMessage::deser(buf) {
            Ok(parsed) => parsed,
            Err(e) => {
                self.on_violation(false, &format!("malformed message: {}", e)).await;
                return;
            }
        };
        trace!("received {:?} in state {:?}", message.kind(), self.state);

        if self.state == ConnectionState::Listen {
            match message {
                StreamMessage::Hello(hello) => self.on_hello_while_listening(session, hello),
                other => self.on_violation(false, &format!("{:?} before Hello", other.kind())).await,
            }
            return;
        }

        if session != self.session {
            self.on_violation(false, &format!("message for session {}, expected {}", session, self.session)).await;
            return;
        }

        match message {
            StreamMessage::Hello(hello) => self.on_hello(hello).await,
            StreamMessage::HelloAck(hello) => self.on_hello_ack(hello, now).await,
            StreamMessage::Data(data) => {
                if !self.is_handshake_complete() {
                    // the HelloAck was lost: the peer retransmits the data after the handshake
                    trace!("data before the handshake completed - dropping");
                    return;
                }
                match self.local_receive {
                    HalfClose::Open => {}
                    HalfClose::Closing => return,
                    HalfClose::Closed => {
                        self.send(&StreamMessage::ReceiveCloseAck).await;
                        return;
                    }
                }

                let seq = data.seq;
                let outcome = self.receive_buffer.on_data(seq, data.payload);
                trace!("data #{}: {:?}", seq, outcome);
                self.schedule_ack(now, data.ack_deadline);
                if outcome == DataOutcome::Delivered {
                    self.complete_read_if_possible(now);
                }
            }
            StreamMessage::Ack(ack) => {
                if !self.is_handshake_complete() {
                    return;
                }
                match self.send_window.on_ack(&ack, now) {
                    Ok(outcome) => {
                        if outcome.confirmed_segments > 0 {
                            trace!("{} bytes confirmed", outcome.confirmed_bytes);
                            self.complete_write_if_done();
                        }
                        self.transmit_new_data(now).await;
                    }
                    Err(e) => self.on_violation(true, &format!("{:?}", e)).await,
                }
            }
            StreamMessage::TransmitClose => {
                if !self.remote_transmit_closed {
                    debug!("{} closed its transmit direction", self.remote);
                    self.remote_transmit_closed = true;
                }
                self.send(&StreamMessage::TransmitCloseAck).await;
                self.complete_read_if_possible(now);
            }
            StreamMessage::TransmitCloseAck => {
                if self.local_transmit == HalfClose::Closing && self.is_control_pending(MessageKind::TransmitClose) {
                    self.local_transmit = HalfClose::Closed;
                    self.on_half_close_complete(ShutdownDirection::Write, now).await;
                }
            }
            StreamMessage::ReceiveClose => {
                if !self.remote_receive_closed {
                    debug!("{} closed its receive direction", self.remote);
                    self.remote_receive_closed = true;
                    self.fail_write(StreamError::Shutdown);
                    self.send_window.clear();
                }
                self.send(&StreamMessage::ReceiveCloseAck).await;
                self.drive_pending_shutdown(now).await;
            }
            StreamMessage::ReceiveCloseAck => {
                if self.local_receive == HalfClose::Closing && self.is_control_pending(MessageKind::ReceiveClose) {
                    self.local_receive = HalfClose::Closed;
                    self.on_half_close_complete(ShutdownDirection::Read, now).await;
                }
            }
            StreamMessage::Close => {
                self.send(&StreamMessage::CloseAck).await;
                let is_closing_locally = self.state == ConnectionState::CloseWait
                    || self.pending_shutdown.as_ref()
                        .is_some_and(|s| matches!(s.direction, ShutdownDirection::Both | ShutdownDirection::Close));
                if is_closing_locally {
                    // both sides closed concurrently
                    self.finish_close();
                }
                else {
                    debug!("{} closed the stream", self.remote);
                    self.teardown(StreamError::Shutdown);
                }
            }
            StreamMessage::CloseAck => {
                if self.state == ConnectionState::CloseWait {
                    self.finish_close();
                }
            }
            StreamMessage::Reset => {
                debug!("{} reset the stream", self.remote);
                self.teardown(StreamError::Shutdown);
            }
        }
    }

    fn on_hello_while_listening(&mut self, session: SessionId, hello: HelloMessage) {
        debug!("Hello from {}: session {}, initial sequence number {}", self.remote, session, hello.initial_seq);
        self.session = session;
        tracing::Span::current().record("session", tracing::field::display(session));
        self.remote_isn = Some(hello.initial_seq);
        self.receive_buffer = ReceiveBuffer::new(hello.initial_seq, self.config.receive_buffer_size);
        self.send_window.set_peer_window(hello.receive_window);
        self.state = ConnectionState::HandshakeWait;

        if let Some(open) = self.pending_open.take() {
            let _ = open.reply.send(Ok(()));
        }
    }

    async fn on_hello(&mut self, hello: HelloMessage) {
        if self.role == Role::Client {
            self.on_violation(false, "Hello sent to the client side").await;
            return;
        }
        if self.remote_isn != Some(hello.initial_seq) {
            self.on_violation(true, "Hello with a different initial sequence number").await;
            return;
        }
        if self.is_handshake_complete() {
            // our HelloAck was lost
            trace!("re-sending HelloAck");
            self.send(&StreamMessage::HelloAck(self.hello())).await;
        }
    }

    async fn on_hello_ack(&mut self, hello: HelloMessage, now: Instant) {
        if self.role == Role::Server {
            self.on_violation(false, "HelloAck sent to the server side").await;
            return;
        }
        if self.state != ConnectionState::HandshakeWait {
            if self.remote_isn != Some(hello.initial_seq) {
                self.on_violation(true, "HelloAck with a different initial sequence number").await;
            }
            return;
        }

        self.remote_isn = Some(hello.initial_seq);
        self.receive_buffer = ReceiveBuffer::new(hello.initial_seq, self.config.receive_buffer_size);
        self.send_window.set_peer_window(hello.receive_window);
        self.control = None;
        self.state = ConnectionState::Established;
        info!("stream to {} established", self.remote);

        if let Some(open) = self.pending_open.take() {
            let _ = open.reply.send(Ok(()));
        }
        self.transmit_new_data(now).await;
    }
}

/// Shared access to a socket's state for the parts of the crate that drive it from outside
///  (completion handles, listen socket, context)
#[derive(Clone)]
pub(crate) struct SocketRef {
    inner: Arc<RwLock<SocketInner>>,
    wake: Arc<Notify>,
}

impl SocketRef {
    pub(crate) fn downgrade(&self) -> WeakSocketRef {
        WeakSocketRef {
            inner: Arc::downgrade(&self.inner),
            wake: self.wake.clone(),
        }
    }

    pub(crate) async fn accept(&self) {
        self.inner.write().await
            .accept(Instant::now()).await;
        self.wake.notify_one();
    }

    /// Sends a Reset unless the socket is closed already, and closes it
    pub(crate) async fn reset(&self) {
        self.inner.write().await
            .reset().await;
    }

    async fn cancel(&self, kind: OperationKind, id: OperationId) {
        self.inner.write().await
            .cancel(kind, id);
        self.wake.notify_one();
    }
}

#[derive(Clone)]
pub(crate) struct WeakSocketRef {
    inner: Weak<RwLock<SocketInner>>,
    wake: Arc<Notify>,
}

impl WeakSocketRef {
    pub(crate) fn upgrade(&self) -> Option<SocketRef> {
        self.inner.upgrade()
            .map(|inner| SocketRef { inner, wake: self.wake.clone() })
    }
}

/// The value a completion resolves to if its socket went away without delivering a result
pub trait CompletionOutcome {
    fn abandoned() -> Self;
}

impl CompletionOutcome for Result<Bytes, StreamError> {
    fn abandoned() -> Self {
        Err(StreamError::Shutdown)
    }
}

impl CompletionOutcome for Result<usize, WriteFailure> {
    fn abandoned() -> Self {
        Err(WriteFailure { error: StreamError::Shutdown, unconfirmed_bytes: 0 })
    }
}

impl CompletionOutcome for Result<(), StreamError> {
    fn abandoned() -> Self {
        Err(StreamError::Shutdown)
    }
}

/// Handle for a pending read, write or shutdown. Await it for the result, or cancel it.
pub struct Completion<T: CompletionOutcome> {
    socket_ref: SocketRef,
    kind: OperationKind,
    id: OperationId,
    receiver: oneshot::Receiver<T>,
}

/// Resolves to the in-order data that is available, or to `Shutdown` at the end of the stream
pub type ReadHandle = Completion<Result<Bytes, StreamError>>;
/// Resolves to the number of bytes written once the peer acknowledged all of them
pub type WriteHandle = Completion<Result<usize, WriteFailure>>;
pub type ShutdownHandle = Completion<Result<(), StreamError>>;

impl<T: CompletionOutcome> Completion<T> {
    /// Withdraws the operation. The completion is never delivered, and its timer is released.
    ///  Cancelling an operation that completed already has no effect.
    ///
    /// NB: A cancelled write's data stays queued for transmission.
    pub async fn cancel(self) {
        self.socket_ref.cancel(self.kind, self.id).await;
    }
}

impl<T: CompletionOutcome> Future for Completion<T> {
    type Output = T;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.receiver).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(_)) => Poll::Ready(T::abandoned()),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// A reliable, ordered, bidirectional byte stream to a remote peer.
///
/// There is at most one pending read and one pending write at any time. Dropping the socket
///  without closing it releases the tunnel channel without notifying the peer.
pub struct Socket {
    socket_ref: SocketRef,
    remote: PeerIdentity,
    driver: Option<JoinHandle<()>>,
}

impl Drop for Socket {
    fn drop(&mut self) {
        if let Some(handle) = self.driver.take() {
            handle.abort();
        }

        if let Ok(mut inner) = self.socket_ref.inner.try_write() {
            inner.teardown(StreamError::Shutdown);
        }
        else if let Ok(rt) = tokio::runtime::Handle::try_current() {
            let inner = self.socket_ref.inner.clone();
            rt.spawn(async move {
                inner.write().await
                    .teardown(StreamError::Shutdown);
            });
        }
    }
}

fn initial_sequence_number(config: &StreamConfig, random: &dyn Random) -> SeqNr {
    match config.testing_initial_sequence_number {
        Some(isn) => SeqNr::from_raw(isn),
        None => SeqNr::from_raw(random.next_u32()),
    }
}

impl Socket {
    fn spawn(inner: SocketInner, events: mpsc::UnboundedReceiver<ChannelEvent>) -> Socket {
        let remote = inner.remote;
        let wake = inner.wake.clone();
        let span = debug_span!("stream", peer = %remote, role = ?inner.role, session = tracing::field::Empty);
        if inner.role == Role::Client {
            span.record("session", tracing::field::display(inner.session));
        }

        let inner = Arc::new(RwLock::new(inner));
        let driver = tokio::spawn(Self::do_loop(inner.clone(), events, wake.clone()).instrument(span));

        Socket {
            socket_ref: SocketRef { inner, wake },
            remote,
            driver: Some(driver),
        }
    }

    /// Client side: performs the handshake on a freshly opened channel
    pub(crate) async fn connect(config: Arc<StreamConfig>, channel: TunnelChannel, random: &dyn Random, timeout: Duration) -> Result<Socket, StreamError> {
        let TunnelChannel { remote, sender, events } = channel;
        let isn = initial_sequence_number(&config, random);
        let session = SessionId::from_raw(random.next_u32());

        let now = Instant::now();
        let (reply, established) = oneshot::channel();
        let mut inner = SocketInner::new(config, Role::Client, remote, sender, session, isn, ConnectionState::Init);
        inner.pending_open = Some(PendingOpen { deadline: deadline_after(now, timeout), reply });
        inner.start_handshake(now).await;

        let socket = Self::spawn(inner, events);
        match established.await {
            Ok(Ok(())) => Ok(socket),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(StreamError::Shutdown),
        }
    }

    /// Server side: waits for the Hello on an inbound channel. The returned socket is in
    ///  `HandshakeWait` until it is accepted.
    pub(crate) async fn await_hello(config: Arc<StreamConfig>, channel: TunnelChannel, random: &dyn Random) -> Result<Socket, StreamError> {
        let TunnelChannel { remote, sender, events } = channel;
        let isn = initial_sequence_number(&config, random);

        let deadline = deadline_after(Instant::now(), config.handshake_timeout);
        let (reply, hello_received) = oneshot::channel();
        // the session id is the client's choice, this is replaced when the Hello arrives
        let placeholder_session = SessionId::from_raw(0);
        let mut inner = SocketInner::new(config, Role::Server, remote, sender, placeholder_session, isn, ConnectionState::Listen);
        inner.pending_open = Some(PendingOpen { deadline, reply });

        let socket = Self::spawn(inner, events);
        match hello_received.await {
            Ok(Ok(())) => Ok(socket),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(StreamError::Shutdown),
        }
    }

    pub(crate) fn socket_ref(&self) -> SocketRef {
        self.socket_ref.clone()
    }

    pub fn remote(&self) -> PeerIdentity {
        self.remote
    }

    pub async fn state(&self) -> ConnectionState {
        self.socket_ref.inner.read().await.state
    }

    /// Reads whatever in-order data is available, waiting up to `timeout` for data to arrive.
    ///
    /// After the peer shut down its transmit direction, reads return the remaining data and
    ///  then `Shutdown` to mark the end of the stream.
    pub async fn read(&self, timeout: Duration) -> Result<ReadHandle, SubmitError> {
        let (id, receiver) = self.socket_ref.inner.write().await
            .submit_read(timeout, Instant::now())?;
        self.socket_ref.wake.notify_one();

        Ok(Completion { socket_ref: self.socket_ref.clone(), kind: OperationKind::Read, id, receiver })
    }

    /// Sends `data`. The write completes when the peer acknowledged all of it, or fails with the
    ///  number of bytes that are not acknowledged when `timeout` expires.
    pub async fn write(&self, data: impl Into<Bytes>, timeout: Duration) -> Result<WriteHandle, SubmitError> {
        let (id, receiver) = self.socket_ref.inner.write().await
            .submit_write(data.into(), timeout, Instant::now()).await?;
        self.socket_ref.wake.notify_one();

        Ok(Completion { socket_ref: self.socket_ref.clone(), kind: OperationKind::Write, id, receiver })
    }

    /// Shuts down one or both directions of the stream, or closes it directly. Shutting down
    ///  both directions closes the stream once the peer acknowledged it.
    ///
    /// A timeout that is too large to be represented as a deadline (e.g. `Duration::MAX`) means
    ///  that the operation waits indefinitely. The same holds for reads and writes.
    pub async fn shutdown(&self, direction: ShutdownDirection, timeout: Duration) -> Result<ShutdownHandle, SubmitError> {
        let (id, receiver) = self.socket_ref.inner.write().await
            .submit_shutdown(direction, timeout, Instant::now()).await?;
        self.socket_ref.wake.notify_one();

        Ok(Completion { socket_ref: self.socket_ref.clone(), kind: OperationKind::Shutdown, id, receiver })
    }

    /// Releases the socket. If it is not closed yet, the peer is sent a Reset, and pending
    ///  operations complete with `Shutdown`.
    pub async fn close(self) {
        self.socket_ref.reset().await;
    }

    /// Active loop, runs until the socket is closed
    async fn do_loop(inner: Arc<RwLock<SocketInner>>, mut events: mpsc::UnboundedReceiver<ChannelEvent>, wake: Arc<Notify>) {
        loop {
            let next_deadline = {
                let inner = inner.read().await;
                if inner.state == ConnectionState::Closed {
                    break;
                }
                inner.next_deadline()
            };
            let timer_target = next_deadline.unwrap_or_else(Instant::now);

            select! {
                event = events.recv() => {
                    let mut inner = inner.write().await;
                    match event {
                        Some(ChannelEvent::Message(buf)) => {
                            inner.on_message(buf, Instant::now()).await;
                        }
                        Some(ChannelEvent::Destroyed) => {
                            if inner.state == ConnectionState::CloseWait {
                                // the peer completed the close and released the channel before its CloseAck got here
                                inner.finish_close();
                            }
                            else {
                                debug!("channel was closed by the peer");
                                inner.teardown(StreamError::ChannelLost);
                            }
                        }
                        Some(ChannelEvent::Lost) | None => {
                            warn!("tunnel channel to {} was lost", inner.remote);
                            inner.teardown(StreamError::ChannelLost);
                        }
                    }
                }
                _ = sleep_until(timer_target), if next_deadline.is_some() => {
                    inner.write().await
                        .on_timer(Instant::now()).await;
                }
                _ = wake.notified() => {}
            }
        }
        trace!("socket driver terminated");
    }
}
