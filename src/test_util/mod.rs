//! Utilities for testing code that uses streams: an in-process tunnel that connects any number
//!  of nodes with configurable message loss and reordering, and a channel sender that records
//!  what a socket sent.
//!
//! These are part of the crate's regular (non-#[cfg(test)]) code so applications can use them
//!  for their own tests.

pub mod local_tunnel;
pub mod tracking_channel;

use crate::tunnel::PeerIdentity;

/// Creates a peer identity that is unique per number, for readable test code
pub fn test_peer_identity(number: u8) -> PeerIdentity {
    let mut bytes = [0u8; 32];
    bytes[0] = number;
    bytes[31] = number;
    PeerIdentity::from_bytes(bytes)
}
