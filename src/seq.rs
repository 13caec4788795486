use std::cmp::Ordering;
use std::fmt::{Display, Formatter};
use std::ops::{Add, Sub};

/// A position in the 32-bit circular sequence space.
///
/// Sequence numbers wrap around at 2^32, so they have no total order. Two numbers are compared
///  by the sign of their wrapping difference: `a` is before `b` iff `(a - b) as i32 < 0`. This is
///  meaningful as long as the numbers being compared are less than 2^31 apart, which the
///  send window guarantees by a wide margin.
///
/// NB: There is no `Ord` impl, use [SeqNr::circular_cmp] instead.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct SeqNr(u32);

impl Display for SeqNr {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl SeqNr {
    pub const ZERO: SeqNr = SeqNr(0);

    pub fn from_raw(value: u32) -> Self {
        Self(value)
    }

    pub fn to_raw(&self) -> u32 {
        self.0
    }

    pub fn next(&self) -> SeqNr {
        SeqNr(self.0.wrapping_add(1))
    }

    pub fn is_before(&self, other: SeqNr) -> bool {
        (self.0.wrapping_sub(other.0) as i32) < 0
    }

    pub fn is_after(&self, other: SeqNr) -> bool {
        other.is_before(*self)
    }

    pub fn circular_cmp(&self, other: SeqNr) -> Ordering {
        if self == &other {
            Ordering::Equal
        }
        else if self.is_before(other) {
            Ordering::Less
        }
        else {
            Ordering::Greater
        }
    }

    /// Number of steps from `base` forward to `self`, or `None` if `self` is before `base`
    pub fn distance_from(&self, base: SeqNr) -> Option<u32> {
        if self.is_before(base) {
            None
        }
        else {
            Some(self.0.wrapping_sub(base.0))
        }
    }

    /// `true` iff `self` lies in the half-open range `[from, to)`
    pub fn is_in_range(&self, from: SeqNr, to: SeqNr) -> bool {
        !self.is_before(from) && self.is_before(to)
    }
}

impl Add<u32> for SeqNr {
    type Output = SeqNr;

    fn add(self, rhs: u32) -> Self::Output {
        SeqNr(self.0.wrapping_add(rhs))
    }
}

impl Sub<SeqNr> for SeqNr {
    type Output = u32;

    /// wrapping difference - callers are responsible for the ordering of the operands
    fn sub(self, rhs: SeqNr) -> Self::Output {
        self.0.wrapping_sub(rhs.0)
    }
}
