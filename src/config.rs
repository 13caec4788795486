use std::time::Duration;
use anyhow::bail;
use crate::ack_bitmap::ACK_BITMAP_BITS;
use crate::message::MAX_DATA_PAYLOAD_LEN;

/// Retransmit timers are scheduled relative to the current instant, so their timeouts must stay
///  representable as deadlines
pub const RETRANSMIT_TIMEOUT_LIMIT: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Clone, Debug)]
pub struct StreamConfig {
    /// The first retransmit timeout for Data messages and for control messages that expect an
    ///  acknowledgement (Hello, TransmitClose, ReceiveClose, Close). The timeout backs off
    ///  exponentially while no progress is made, and is reset when an Ack advances the send window.
    pub initial_retransmit_timeout: Duration,
    /// Upper bound for the backed-off retransmit timeout
    pub max_retransmit_timeout: Duration,
    /// The factor by which the retransmit timeout is multiplied for each consecutive timeout,
    ///  in eighths (i.e. 16 doubles the timeout)
    pub retransmit_backoff_factor_eighths: u32,

    /// The maximum number of payload bytes in a single Data message. Writes are split into
    ///  Data messages of at most this size.
    pub max_payload_size: usize,

    /// The maximum number of Data messages that are sent but not cumulatively acknowledged.
    ///
    /// This can not exceed the width of the selective ack bitmap: the receiver can only buffer
    ///  messages whose position it can report.
    pub max_in_flight: u32,

    /// Advisory deadline for acknowledgements that a sender attaches to Data messages. The last
    ///  message of each write asks for an immediate ack instead.
    pub ack_deadline: Duration,

    /// The number of bytes of in-order data that is buffered until the application reads it.
    ///  Free space is advertised to the peer, which limits the data it sends.
    pub receive_buffer_size: usize,

    /// The time `listen()` waits for the port to become available
    pub listen_timeout: Duration,
    /// The time a listen socket waits for the Hello message on a newly opened channel
    pub handshake_timeout: Duration,
    /// Bound on the Close exchange that starts automatically when both directions were shut
    ///  down without a pending 'shutdown both' call
    pub linger_timeout: Duration,

    /// Malformed or session-mismatched messages are dropped. After this many of them, the
    ///  socket gives up on the peer and sends a Reset.
    pub max_protocol_violations: u32,

    /// Fixed initial sequence number, for testing sequence number wraparound. Initial sequence
    ///  numbers are random if this is `None`, which should be the case outside of tests.
    pub testing_initial_sequence_number: Option<u32>,
}

impl Default for StreamConfig {
    fn default() -> Self {
        StreamConfig {
            initial_retransmit_timeout: Duration::from_secs(10),
            max_retransmit_timeout: Duration::from_secs(60),
            retransmit_backoff_factor_eighths: 16,
            max_payload_size: 64000,
            max_in_flight: ACK_BITMAP_BITS,
            ack_deadline: Duration::from_secs(5),
            receive_buffer_size: 4_096_000,
            listen_timeout: Duration::from_secs(60),
            handshake_timeout: Duration::from_secs(30),
            linger_timeout: Duration::from_secs(30),
            max_protocol_violations: 8,
            testing_initial_sequence_number: None,
        }
    }
}

impl StreamConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.initial_retransmit_timeout.is_zero() {
            bail!("initial retransmit timeout must be positive");
        }
        if self.max_retransmit_timeout < self.initial_retransmit_timeout {
            bail!("max retransmit timeout {:?} is below the initial retransmit timeout {:?}", self.max_retransmit_timeout, self.initial_retransmit_timeout);
        }
        if self.max_retransmit_timeout > RETRANSMIT_TIMEOUT_LIMIT {
            bail!("max retransmit timeout {:?} exceeds the limit of {:?}", self.max_retransmit_timeout, RETRANSMIT_TIMEOUT_LIMIT);
        }
        if self.retransmit_backoff_factor_eighths < 8 {
            bail!("retransmit backoff factor must be at least 8 (i.e. 1.0)");
        }
        if self.max_payload_size == 0 {
            bail!("max payload size must be positive");
        }
        if self.max_payload_size > MAX_DATA_PAYLOAD_LEN {
            bail!("max payload size {} exceeds the limit of {}", self.max_payload_size, MAX_DATA_PAYLOAD_LEN);
        }
        if self.max_in_flight == 0 || self.max_in_flight > ACK_BITMAP_BITS {
            bail!("max in-flight messages must be between 1 and {}", ACK_BITMAP_BITS);
        }
        if self.receive_buffer_size < self.max_payload_size {
            bail!("receive buffer size {} must hold at least one message of {} bytes", self.receive_buffer_size, self.max_payload_size);
        }
        if u32::try_from(self.receive_buffer_size).is_err() {
            bail!("receive buffer size {} can not be advertised as a 32 bit window", self.receive_buffer_size);
        }
        Ok(())
    }

    pub fn retransmit_backoff(&self) -> crate::backoff::RetransmitBackoff {
        crate::backoff::RetransmitBackoff::new(
            self.initial_retransmit_timeout,
            self.max_retransmit_timeout,
            self.retransmit_backoff_factor_eighths,
        )
    }
}
