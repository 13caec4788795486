use std::fmt::{Debug, Formatter};
use crate::seq::SeqNr;

/// Number of sequence numbers beyond the cumulative ack base that an Ack can report individually
pub const ACK_BITMAP_BITS: u32 = 64;

/// Selective acknowledgement bitmap relative to a cumulative base: bit `i` is set iff the
///  message with sequence number `base + 1 + i` was received.
///
/// The bitmap never stores the base itself - the base is the *next expected* sequence number, so
///  by definition it was not received yet.
#[derive(Copy, Clone, Eq, PartialEq, Default)]
pub struct AckBitmap(u64);

impl Debug for AckBitmap {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "AckBitmap({:#018x})", self.0)
    }
}

impl AckBitmap {
    pub const EMPTY: AckBitmap = AckBitmap(0);

    pub fn from_raw(value: u64) -> AckBitmap {
        AckBitmap(value)
    }

    pub fn to_raw(&self) -> u64 {
        self.0
    }

    /// Maps a sequence number to its bit index relative to `base`, if it is inside the window
    fn bit_index(base: SeqNr, seq: SeqNr) -> Option<u32> {
        match seq.distance_from(base) {
            Some(d) if d >= 1 && d <= ACK_BITMAP_BITS => Some(d - 1),
            _ => None,
        }
    }

    pub fn is_in_window(base: SeqNr, seq: SeqNr) -> bool {
        Self::bit_index(base, seq).is_some()
    }

    /// Marks `seq` as received. Returns `false` and leaves the bitmap unchanged if `seq` is
    ///  outside the window `(base, base + ACK_BITMAP_BITS]`
    pub fn set(&mut self, base: SeqNr, seq: SeqNr) -> bool {
        match Self::bit_index(base, seq) {
            Some(idx) => {
                self.0 |= 1u64 << idx;
                true
            }
            None => false,
        }
    }

    pub fn is_set(&self, base: SeqNr, seq: SeqNr) -> bool {
        match Self::bit_index(base, seq) {
            Some(idx) => self.0 & (1u64 << idx) != 0,
            None => false,
        }
    }

    /// Iterates the sequence numbers recorded in this bitmap, in ascending order
    pub fn iter_set(&self, base: SeqNr) -> impl Iterator<Item=SeqNr> {
        let bits = self.0;
        (0..ACK_BITMAP_BITS)
            .filter(move |idx| bits & (1u64 << idx) != 0)
            .map(move |idx| base + (idx + 1))
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }
}
