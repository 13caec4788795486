//! Reliable, ordered, bidirectional byte streams over an unreliable overlay tunnel.
//!
//! The tunnel substrate ([tunnel::Tunnel]) opens logical channels between peers and delivers
//!  messages on a best-effort basis: they may be lost, duplicated or reordered. A [socket::Socket]
//!  adds the guarantees of a stream on top:
//!
//! * A handshake (Hello / HelloAck) exchanges initial sequence numbers and receive windows.
//! * Writes are split into sequence-numbered Data messages. The receiver acknowledges them
//!   cumulatively with a bitmap of selectively received messages beyond that. Messages that
//!   are not acknowledged are retransmitted with exponential backoff.
//! * Reads deliver data strictly in sequence order, without gaps or duplicates.
//! * Each direction can be shut down separately (TransmitClose / ReceiveClose), followed by a
//!   Close exchange once both are shut down. Reset terminates a stream abruptly.
//!
//! Sequence numbers are 32 bit and wrap around, see [seq::SeqNr].
//!
//! ## Wire format
//!
//! All numbers are big endian. Every message starts with an eight byte header:
//!
//! ```ascii
//! 0: message size (u16), including the header
//! 2: message type (u16)
//! 4: session id (u32)
//! 8: type-specific body
//! ```
//!
//! Data (1) has the sequence number (u32), the ack deadline in millis (u32, `0xFFFF_FFFF` for
//!  none) and the payload. Ack (2) has the next expected sequence number (u32), a 64 bit
//!  bitmap of messages received beyond it, and the remaining receive window (u32). Hello (3)
//!  and HelloAck (4) have the sender's initial sequence number (u32) and receive window (u32).
//!  Reset (5) and the shutdown messages (6 to 11) have no body.
//!
//! ## Usage
//!
//! A [context::StreamContext] wraps a tunnel. [context::StreamContext::open] connects to a
//!  remote peer's port, [context::StreamContext::listen] accepts inbound streams and passes
//!  them to a [listen_socket::AcceptHandler].

pub mod ack_bitmap;
pub mod backoff;
pub mod config;
pub mod context;
pub mod error;
pub mod listen_socket;
pub mod message;
pub mod receive_buffer;
pub mod send_window;
pub mod seq;
pub mod socket;
pub mod tunnel;
pub mod util;
pub mod test_util;


#[cfg(test)]
mod test {
    use tracing::Level;

    #[ctor::ctor]
    fn init_test_logging() {
        tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(Level::TRACE)
            .try_init()
            .ok();
    }
}
