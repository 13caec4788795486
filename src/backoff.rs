use std::cmp::min;
use std::time::Duration;

/// Exponentially growing retransmit timeout with an upper bound.
///
/// Every timeout without progress multiplies the timeout by a configured factor (in eighths to
///  avoid floating point), up to a maximum. Progress resets it to the initial value.
#[derive(Debug, Clone)]
pub struct RetransmitBackoff {
    current: Duration,

    config_initial: Duration,
    config_max: Duration,
    config_factor_eighths: u32,
}

impl RetransmitBackoff {
    pub fn new(initial: Duration, max: Duration, factor_eighths: u32) -> RetransmitBackoff {
        assert!(factor_eighths >= 8);

        RetransmitBackoff {
            current: initial,
            config_initial: initial,
            config_max: max,
            config_factor_eighths: factor_eighths,
        }
    }

    pub fn current(&self) -> Duration {
        self.current
    }

    /// A timeout expired without progress: returns the timeout to use for the next attempt
    pub fn on_timeout(&mut self) -> Duration {
        let next = self.current
            .checked_mul(self.config_factor_eighths)
            .map(|d| d / 8)
            .unwrap_or(self.config_max);
        self.current = min(next, self.config_max);
        self.current
    }

    pub fn reset(&mut self) {
        self.current = self.config_initial;
    }
}
