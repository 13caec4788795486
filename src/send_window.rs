use std::collections::VecDeque;
use std::time::Duration;

use bytes::Bytes;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::backoff::RetransmitBackoff;
use crate::config::StreamConfig;
use crate::message::{AckMessage, DataMessage};
use crate::seq::SeqNr;

#[derive(Debug)]
struct OutstandingSegment {
    seq: SeqNr,
    payload: Bytes,
    ack_deadline: Option<Duration>,
    /// `None` until the segment is transmitted for the first time
    sent_at: Option<Instant>,
    retransmit_count: u32,
    selectively_acked: bool,
}

impl OutstandingSegment {
    fn to_message(&self) -> DataMessage {
        DataMessage {
            seq: self.seq,
            ack_deadline: self.ack_deadline,
            payload: self.payload.clone(),
        }
    }
}

#[derive(Debug, Default, Eq, PartialEq)]
pub struct AckOutcome {
    pub confirmed_segments: u32,
    pub confirmed_bytes: usize,
}

#[derive(Debug, Eq, PartialEq)]
pub enum AckError {
    /// The peer acknowledged sequence numbers that were never sent
    BeyondSendNext { ack_base: SeqNr, send_next: SeqNr },
}

/// The sending half of a socket: segments written data, keeps everything that is not
///  cumulatively acknowledged, and decides what goes on the wire when.
///
/// The outstanding queue holds exactly the segments with sequence numbers in
///  `[send_base, send_next)`, in order, so a segment's index is its distance from `send_base`.
///  Only the first `max_in_flight` segments of the queue are ever transmitted, and new segments
///  are only transmitted if they fit into the receive window the peer advertised last (except
///  when nothing is in flight, so a closed window is still tested with one segment).
pub struct SendWindow {
    send_base: SeqNr,
    send_next: SeqNr,
    outstanding: VecDeque<OutstandingSegment>,

    max_in_flight: u32,
    max_payload_size: usize,
    ack_deadline: Duration,

    peer_window: u32,
    backoff: RetransmitBackoff,
    retransmit_deadline: Option<Instant>,
}

impl SendWindow {
    pub fn new(config: &StreamConfig, initial_seq: SeqNr) -> SendWindow {
        SendWindow {
            send_base: initial_seq,
            send_next: initial_seq,
            outstanding: VecDeque::new(),
            max_in_flight: config.max_in_flight,
            max_payload_size: config.max_payload_size,
            ack_deadline: config.ack_deadline,
            peer_window: 0,
            backoff: config.retransmit_backoff(),
            retransmit_deadline: None,
        }
    }

    pub fn send_base(&self) -> SeqNr {
        self.send_base
    }

    pub fn send_next(&self) -> SeqNr {
        self.send_next
    }

    pub fn is_empty(&self) -> bool {
        self.outstanding.is_empty()
    }

    pub fn retransmit_deadline(&self) -> Option<Instant> {
        self.retransmit_deadline
    }

    pub fn set_peer_window(&mut self, peer_window: u32) {
        self.peer_window = peer_window;
    }

    /// Splits `data` into segments and appends them to the outstanding queue. Returns the
    ///  sequence number after the last segment, which marks the end of this write.
    ///
    /// The last segment asks for an immediate ack, so the write completes without waiting for
    ///  the peer's ack deadline.
    pub fn enqueue(&mut self, data: Bytes) -> SeqNr {
        let mut offs = 0;
        while offs < data.len() {
            let end = (offs + self.max_payload_size).min(data.len());
            let is_last = end == data.len();

            self.outstanding.push_back(OutstandingSegment {
                seq: self.send_next,
                payload: data.slice(offs..end),
                ack_deadline: Some(if is_last { Duration::ZERO } else { self.ack_deadline }),
                sent_at: None,
                retransmit_count: 0,
                selectively_acked: false,
            });
            self.send_next = self.send_next.next();
            offs = end;
        }
        trace!("enqueued {} bytes, send window is now [{}, {})", data.len(), self.send_base, self.send_next);
        self.send_next
    }

    fn bytes_in_flight(&self) -> usize {
        self.outstanding.iter()
            .filter(|s| s.sent_at.is_some())
            .map(|s| s.payload.len())
            .sum()
    }

    /// Marks segments that may go on the wire for the first time as sent and returns them
    pub fn poll_transmit(&mut self, now: Instant) -> Vec<DataMessage> {
        let mut result = Vec::new();
        let mut bytes_in_flight = self.bytes_in_flight();

        for segment in self.outstanding.iter_mut().take(self.max_in_flight as usize) {
            if segment.sent_at.is_some() {
                continue;
            }

            let fits_peer_window = bytes_in_flight + segment.payload.len() <= self.peer_window as usize;
            if !fits_peer_window && bytes_in_flight > 0 {
                trace!("peer window of {} bytes is exhausted", self.peer_window);
                break;
            }

            segment.sent_at = Some(now);
            bytes_in_flight += segment.payload.len();
            result.push(segment.to_message());
        }

        if !result.is_empty() && self.retransmit_deadline.is_none() {
            self.retransmit_deadline = Some(now + self.backoff.current());
        }
        result
    }

    pub fn on_ack(&mut self, ack: &AckMessage, now: Instant) -> Result<AckOutcome, AckError> {
        if ack.base.is_before(self.send_base) {
            trace!("stale ack for {} - send base is {}", ack.base, self.send_base);
            return Ok(AckOutcome::default());
        }
        if ack.base.is_after(self.send_next) {
            return Err(AckError::BeyondSendNext { ack_base: ack.base, send_next: self.send_next });
        }

        let mut outcome = AckOutcome::default();
        while self.send_base != ack.base {
            if let Some(segment) = self.outstanding.pop_front() {
                outcome.confirmed_segments += 1;
                outcome.confirmed_bytes += segment.payload.len();
            }
            self.send_base = self.send_base.next();
        }

        for seq in ack.bitmap.iter_set(ack.base) {
            if let Some(idx) = seq.distance_from(self.send_base) {
                if let Some(segment) = self.outstanding.get_mut(idx as usize) {
                    if segment.sent_at.is_some() {
                        segment.selectively_acked = true;
                    }
                }
            }
        }

        self.peer_window = ack.receive_window_remaining;

        if outcome.confirmed_segments > 0 {
            self.backoff.reset();
            self.retransmit_deadline = if self.outstanding.iter().any(|s| s.sent_at.is_some()) {
                Some(now + self.backoff.current())
            }
            else {
                None
            };
        }

        Ok(outcome)
    }

    /// Called when the retransmit deadline may have expired. Retransmits the oldest segment that
    ///  was neither cumulatively nor selectively acknowledged, and backs off the timeout.
    pub fn on_retransmit_timeout(&mut self, now: Instant) -> Option<DataMessage> {
        match self.retransmit_deadline {
            Some(deadline) if deadline <= now => {}
            _ => return None,
        }

        let timeout = self.backoff.on_timeout();
        let candidate = self.outstanding.iter_mut()
            .take(self.max_in_flight as usize)
            .find(|s| s.sent_at.is_some() && !s.selectively_acked);

        match candidate {
            Some(segment) => {
                segment.sent_at = Some(now);
                segment.retransmit_count += 1;
                debug!("retransmitting #{} (attempt {}), next timeout {:?}", segment.seq, segment.retransmit_count + 1, timeout);
                self.retransmit_deadline = Some(now + timeout);
                Some(segment.to_message())
            }
            None => {
                self.retransmit_deadline = None;
                None
            }
        }
    }

    /// Payload bytes of segments in `[from, send_next)` that are not cumulatively acknowledged
    pub fn unconfirmed_bytes_from(&self, from: SeqNr) -> usize {
        self.outstanding.iter()
            .filter(|s| !s.seq.is_before(from))
            .map(|s| s.payload.len())
            .sum()
    }

    /// Drops all outstanding segments, e.g. after the peer closed its receive direction
    pub fn clear(&mut self) {
        self.outstanding.clear();
        self.send_base = self.send_next;
        self.retransmit_deadline = None;
        self.backoff.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ack_bitmap::AckBitmap;
    use rstest::rstest;

    fn config(max_payload_size: usize, max_in_flight: u32) -> StreamConfig {
        StreamConfig {
            initial_retransmit_timeout: Duration::from_millis(100),
            max_retransmit_timeout: Duration::from_millis(1000),
            max_payload_size,
            max_in_flight,
            ..StreamConfig::default()
        }
    }

    fn ack(base: u32, bitmap: u64, window: u32) -> AckMessage {
        AckMessage {
            base: SeqNr::from_raw(base),
            bitmap: AckBitmap::from_raw(bitmap),
            receive_window_remaining: window,
        }
    }

    fn seqs(messages: &[DataMessage]) -> Vec<u32> {
        messages.iter().map(|m| m.seq.to_raw()).collect()
    }

    #[rstest]
    #[case::empty(0, 4, vec![])]
    #[case::single_small(3, 4, vec![3])]
    #[case::single_exact(4, 4, vec![4])]
    #[case::two(5, 4, vec![4, 1])]
    #[case::three_exact(12, 4, vec![4, 4, 4])]
    fn test_enqueue_segments(#[case] len: usize, #[case] max_payload_size: usize, #[case] expected_lens: Vec<usize>) {
        let mut window = SendWindow::new(&config(max_payload_size, 64), SeqNr::from_raw(10));
        window.set_peer_window(1000);

        let end = window.enqueue(Bytes::from(vec![7u8; len]));
        assert_eq!(end, SeqNr::from_raw(10 + expected_lens.len() as u32));

        let sent = window.poll_transmit(Instant::now());
        assert_eq!(sent.iter().map(|m| m.payload.len()).collect::<Vec<_>>(), expected_lens);

        // only the last segment of a write asks for an immediate ack
        for (i, m) in sent.iter().enumerate() {
            let expected_deadline = if i == sent.len() - 1 { Duration::ZERO } else { Duration::from_secs(5) };
            assert_eq!(m.ack_deadline, Some(expected_deadline));
        }
    }

    #[rstest]
    #[case::all_fit(4, 1000, vec![0, 1, 2])]
    #[case::in_flight_limit(2, 1000, vec![0, 1])]
    #[case::peer_window_limit(64, 8, vec![0, 1])]
    #[case::peer_window_partial(64, 7, vec![0])]
    #[case::closed_peer_window_sends_one(64, 0, vec![0])]
    fn test_poll_transmit_limits(#[case] max_in_flight: u32, #[case] peer_window: u32, #[case] expected: Vec<u32>) {
        let mut window = SendWindow::new(&config(4, max_in_flight), SeqNr::ZERO);
        window.set_peer_window(peer_window);
        window.enqueue(Bytes::from(vec![1u8; 12]));

        let sent = window.poll_transmit(Instant::now());
        assert_eq!(seqs(&sent), expected);
        assert!(window.retransmit_deadline().is_some());

        // nothing new until acks arrive
        assert!(window.poll_transmit(Instant::now()).is_empty());
    }

    #[rstest]
    #[case::nothing(100, 0, Ok(AckOutcome::default()), 100)]
    #[case::one(101, 0, Ok(AckOutcome { confirmed_segments: 1, confirmed_bytes: 4 }), 101)]
    #[case::all(104, 0, Ok(AckOutcome { confirmed_segments: 4, confirmed_bytes: 16 }), 104)]
    #[case::stale(99, 0, Ok(AckOutcome::default()), 100)]
    #[case::beyond(105, 0, Err(AckError::BeyondSendNext { ack_base: SeqNr::from_raw(105), send_next: SeqNr::from_raw(104) }), 100)]
    #[case::selective_only(100, 0b110, Ok(AckOutcome::default()), 100)]
    fn test_on_ack(#[case] base: u32, #[case] bitmap: u64, #[case] expected: Result<AckOutcome, AckError>, #[case] expected_send_base: u32) {
        let mut window = SendWindow::new(&config(4, 64), SeqNr::from_raw(100));
        window.set_peer_window(1000);
        window.enqueue(Bytes::from(vec![1u8; 16]));
        window.poll_transmit(Instant::now());

        assert_eq!(window.on_ack(&ack(base, bitmap, 1000), Instant::now()), expected);
        assert_eq!(window.send_base(), SeqNr::from_raw(expected_send_base));
        assert_eq!(window.send_next(), SeqNr::from_raw(104));
        assert_eq!(window.outstanding.len(), 104 - expected_send_base as usize);
    }

    #[test]
    fn test_ack_across_wraparound() {
        let mut window = SendWindow::new(&config(1, 64), SeqNr::from_raw(u32::MAX - 1));
        window.set_peer_window(1000);
        window.enqueue(Bytes::from_static(b"abcd"));
        let sent = window.poll_transmit(Instant::now());
        assert_eq!(seqs(&sent), vec![u32::MAX - 1, u32::MAX, 0, 1]);

        let outcome = window.on_ack(&ack(1, 0, 1000), Instant::now()).unwrap();
        assert_eq!(outcome, AckOutcome { confirmed_segments: 3, confirmed_bytes: 3 });
        assert_eq!(window.send_base(), SeqNr::from_raw(1));
        assert_eq!(window.unconfirmed_bytes_from(SeqNr::from_raw(u32::MAX - 1)), 1);
    }

    #[test]
    fn test_retransmit_skips_selectively_acked() {
        let start = Instant::now();
        let mut window = SendWindow::new(&config(1, 64), SeqNr::from_raw(10));
        window.set_peer_window(1000);
        window.enqueue(Bytes::from_static(b"abcd"));
        window.poll_transmit(start);

        // 11 and 12 arrived, 10 did not
        window.on_ack(&ack(10, 0b11, 1000), start).unwrap();

        assert!(window.on_retransmit_timeout(start + Duration::from_millis(99)).is_none());

        let t1 = start + Duration::from_millis(100);
        let retransmitted = window.on_retransmit_timeout(t1).unwrap();
        assert_eq!(retransmitted.seq, SeqNr::from_raw(10));
        assert_eq!(window.retransmit_deadline(), Some(t1 + Duration::from_millis(200)));

        // 10 arrived now: the next candidate is 13, since 11 and 12 are acknowledged
        window.on_ack(&ack(13, 0, 1000), t1).unwrap();
        assert_eq!(window.retransmit_deadline(), Some(t1 + Duration::from_millis(100)));
        let t2 = t1 + Duration::from_millis(100);
        assert_eq!(window.on_retransmit_timeout(t2).unwrap().seq, SeqNr::from_raw(13));
    }

    #[test]
    fn test_retransmit_backoff_is_capped() {
        let mut now = Instant::now();
        let mut window = SendWindow::new(&config(4, 64), SeqNr::ZERO);
        window.set_peer_window(1000);
        window.enqueue(Bytes::from_static(b"x"));
        window.poll_transmit(now);

        let mut timeouts = Vec::new();
        for _ in 0..6 {
            now = window.retransmit_deadline().unwrap();
            assert!(window.on_retransmit_timeout(now).is_some());
            timeouts.push((window.retransmit_deadline().unwrap() - now).as_millis());
        }
        assert_eq!(timeouts, vec![200, 400, 800, 1000, 1000, 1000]);
    }

    #[test]
    fn test_ack_disarms_timer_when_drained() {
        let now = Instant::now();
        let mut window = SendWindow::new(&config(4, 64), SeqNr::ZERO);
        window.set_peer_window(1000);
        window.enqueue(Bytes::from_static(b"xyz"));
        window.poll_transmit(now);

        window.on_ack(&ack(1, 0, 997), now).unwrap();
        assert!(window.is_empty());
        assert!(window.retransmit_deadline().is_none());
    }

    #[test]
    fn test_peer_window_reopens() {
        let now = Instant::now();
        let mut window = SendWindow::new(&config(4, 64), SeqNr::ZERO);
        window.set_peer_window(4);
        window.enqueue(Bytes::from(vec![0u8; 12]));
        assert_eq!(seqs(&window.poll_transmit(now)), vec![0]);

        window.on_ack(&ack(1, 0, 8), now).unwrap();
        assert_eq!(seqs(&window.poll_transmit(now)), vec![1, 2]);
    }

    #[test]
    fn test_clear() {
        let now = Instant::now();
        let mut window = SendWindow::new(&config(4, 64), SeqNr::from_raw(5));
        window.set_peer_window(100);
        window.enqueue(Bytes::from(vec![0u8; 12]));
        window.poll_transmit(now);

        window.clear();
        assert!(window.is_empty());
        assert_eq!(window.send_base(), SeqNr::from_raw(8));
        assert!(window.retransmit_deadline().is_none());
        assert_eq!(window.unconfirmed_bytes_from(SeqNr::from_raw(5)), 0);
    }
}
