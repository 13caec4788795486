use std::collections::VecDeque;

use bytes::{Bytes, BytesMut};
use tracing::trace;

use crate::ack_bitmap::{AckBitmap, ACK_BITMAP_BITS};
use crate::message::AckMessage;
use crate::seq::SeqNr;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum DataOutcome {
    /// the message was in sequence and is now available to the application
    Delivered,
    /// the message is ahead of `recv_base` and was buffered until the gap is filled
    Buffered,
    /// the message was received before
    Duplicate,
    /// the message is too far ahead to be tracked in the ack bitmap
    OutOfWindow,
    /// the message was in sequence, but the application did not read buffered data yet
    NoBufferSpace,
}

/// The receiving half of a socket: reassembles Data messages into an in-order byte stream.
///
/// `recv_base` is the next expected sequence number. Messages in the window
///  `(recv_base, recv_base + ACK_BITMAP_BITS]` are kept in `out_of_order`, indexed by their
///  distance from `recv_base` minus one - the same indexing the ack bitmap uses, so the bitmap
///  is derived from the buffer and can never refer to anything below `recv_base`.
///
/// In-order data is moved to `ready`, which is bounded by the configured buffer size. When
///  `ready` is full, in-sequence messages are not accepted, and `recv_base` does not advance -
///  the sender retransmits them once the application read something.
pub struct ReceiveBuffer {
    recv_base: SeqNr,
    out_of_order: VecDeque<Option<Bytes>>,
    /// the message at `recv_base` if it was received but did not fit into `ready`
    blocked: Option<Bytes>,
    ready: VecDeque<Bytes>,
    ready_len: usize,
    capacity: usize,
}

impl ReceiveBuffer {
    pub fn new(initial_seq: SeqNr, capacity: usize) -> ReceiveBuffer {
        ReceiveBuffer {
            recv_base: initial_seq,
            out_of_order: VecDeque::new(),
            blocked: None,
            ready: VecDeque::new(),
            ready_len: 0,
            capacity,
        }
    }

    pub fn recv_base(&self) -> SeqNr {
        self.recv_base
    }

    pub fn ready_len(&self) -> usize {
        self.ready_len
    }

    pub fn has_ready_data(&self) -> bool {
        self.ready_len > 0
    }

    pub fn window_remaining(&self) -> u32 {
        u32::try_from(self.capacity.saturating_sub(self.ready_len))
            .unwrap_or(u32::MAX)
    }

    pub fn on_data(&mut self, seq: SeqNr, payload: Bytes) -> DataOutcome {
        let distance = match seq.distance_from(self.recv_base) {
            None => {
                trace!("received #{} below receive base {} - discarding", seq, self.recv_base);
                return DataOutcome::Duplicate;
            }
            Some(d) => d,
        };

        if distance == 0 {
            if self.blocked.is_some() {
                return DataOutcome::Duplicate;
            }
            if self.ready_len + payload.len() > self.capacity {
                trace!("receive buffer is full - dropping in-sequence #{}", seq);
                return DataOutcome::NoBufferSpace;
            }
            self.push_ready(payload);
            self.drain_out_of_order();
            return DataOutcome::Delivered;
        }

        if !AckBitmap::is_in_window(self.recv_base, seq) {
            trace!("received #{} outside the receive window starting at {} - discarding", seq, self.recv_base);
            return DataOutcome::OutOfWindow;
        }

        let idx = (distance - 1) as usize;
        if self.out_of_order.len() <= idx {
            self.out_of_order.resize(idx + 1, None);
        }
        if self.out_of_order[idx].is_some() {
            return DataOutcome::Duplicate;
        }
        self.out_of_order[idx] = Some(payload);
        DataOutcome::Buffered
    }

    fn push_ready(&mut self, payload: Bytes) {
        self.ready_len += payload.len();
        if !payload.is_empty() {
            self.ready.push_back(payload);
        }
        self.recv_base = self.recv_base.next();
    }

    /// After `recv_base` advanced, the front of the out-of-order buffer corresponds to the new
    ///  `recv_base`: move contiguous entries to `ready` while there is space
    fn drain_out_of_order(&mut self) {
        while let Some(front) = self.out_of_order.pop_front() {
            match front {
                None => return,
                Some(payload) if self.ready_len + payload.len() <= self.capacity => {
                    trace!("delivering buffered #{}", self.recv_base);
                    self.push_ready(payload);
                }
                Some(payload) => {
                    trace!("receive buffer is full - holding back buffered #{}", self.recv_base);
                    self.blocked = Some(payload);
                    return;
                }
            }
        }
    }

    /// Takes all in-order data, and makes room for out-of-order data that is now contiguous
    pub fn take_ready(&mut self) -> Bytes {
        let result = if self.ready.len() == 1 {
            self.ready.pop_front().unwrap_or_default()
        }
        else {
            let mut buf = BytesMut::with_capacity(self.ready_len);
            for chunk in self.ready.drain(..) {
                buf.extend_from_slice(&chunk);
            }
            buf.freeze()
        };
        self.ready.clear();
        self.ready_len = 0;

        if let Some(payload) = self.blocked.take() {
            if payload.len() <= self.capacity {
                self.push_ready(payload);
                self.drain_out_of_order();
            }
            else {
                self.blocked = Some(payload);
            }
        }
        result
    }

    pub fn bitmap(&self) -> AckBitmap {
        let mut bitmap = AckBitmap::EMPTY;
        for (idx, entry) in self.out_of_order.iter().enumerate().take(ACK_BITMAP_BITS as usize) {
            if entry.is_some() {
                bitmap.set(self.recv_base, self.recv_base + (idx as u32 + 1));
            }
        }
        bitmap
    }

    pub fn ack_message(&self) -> AckMessage {
        AckMessage {
            base: self.recv_base,
            bitmap: self.bitmap(),
            receive_window_remaining: self.window_remaining(),
        }
    }

    /// Discards everything, e.g. after the local receive direction was shut down
    pub fn clear(&mut self) {
        self.out_of_order.clear();
        self.blocked = None;
        self.ready.clear();
        self.ready_len = 0;
    }
}
