//! Smoothed transfer rates from periodic byte-counter samples.

/// Number of samples averaged by [`RateSample`].
pub const RATE_WINDOW: usize = 5;

/// Fixed-size ring of recent byte-count deltas.
///
/// Fed once per rate tick with the cumulative byte counter; the rate is the
/// plain arithmetic mean of the last [`RATE_WINDOW`] deltas.
#[derive(Debug, Clone)]
pub struct RateSample {
    deltas: [u64; RATE_WINDOW],
    next: usize,
    filled: usize,
    last_total: Option<u64>,
}

impl Default for RateSample {
    fn default() -> Self {
        Self::new()
    }
}

impl RateSample {
    pub fn new() -> Self {
        Self {
            deltas: [0; RATE_WINDOW],
            next: 0,
            filled: 0,
            last_total: None,
        }
    }

    /// Records the current cumulative counter and returns the new mean.
    ///
    /// The first call only establishes the baseline. A counter that moves
    /// backwards (engine restart) is treated as a zero delta.
    pub fn record(&mut self, total: u64) -> u64 {
        if let Some(last) = self.last_total {
            self.deltas[self.next] = total.saturating_sub(last);
            self.next = (self.next + 1) % RATE_WINDOW;
            self.filled = (self.filled + 1).min(RATE_WINDOW);
        }
        self.last_total = Some(total);
        self.rate()
    }

    /// Mean of the recorded deltas, zero before any delta exists.
    pub fn rate(&self) -> u64 {
        if self.filled == 0 {
            return 0;
        }
        self.deltas[..self.filled].iter().sum::<u64>() / self.filled as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_sample_is_baseline() {
        let mut sample = RateSample::new();
        assert_eq!(sample.record(1_000_000), 0);
        assert_eq!(sample.record(1_000_100), 100);
    }

    #[test]
    fn test_mean_over_partial_window() {
        let mut sample = RateSample::new();
        sample.record(0);
        sample.record(100);
        assert_eq!(sample.record(400), 200); // (100 + 300) / 2
    }

    #[test]
    fn test_window_wraps_and_drops_old_deltas() {
        let mut sample = RateSample::new();
        let mut total = 0;
        sample.record(total);
        for _ in 0..RATE_WINDOW {
            total += 1000;
            sample.record(total);
        }
        assert_eq!(sample.rate(), 1000);

        for _ in 0..RATE_WINDOW {
            sample.record(total);
        }
        assert_eq!(sample.rate(), 0);
    }

    #[test]
    fn test_counter_reset_counts_as_zero() {
        let mut sample = RateSample::new();
        sample.record(5000);
        assert_eq!(sample.record(10), 0);
    }
}
