use std::time::Duration;

/// Fibonacci reconnect delay: seed, seed, 2*seed, 3*seed, 5*seed ... capped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Backoff {
    seed_ms: u64,
    cap_ms: u64,
    current_ms: u64,
    next_ms: u64,
}

impl Backoff {
    pub fn new(seed: Duration, cap: Duration) -> Self {
        Self::from_millis(seed.as_millis() as u64, cap.as_millis() as u64)
    }

    pub fn from_millis(seed_ms: u64, cap_ms: u64) -> Self {
        Self { seed_ms, cap_ms, current_ms: seed_ms, next_ms: seed_ms }
    }

    /// Delay the next call to `next_delay` will return.
    pub fn peek(&self) -> Duration {
        Duration::from_millis(self.current_ms.min(self.cap_ms))
    }

    pub fn next_delay(&mut self) -> Duration {
        let delay = self.peek();
        let sum = self.current_ms.saturating_add(self.next_ms);
        self.current_ms = self.next_ms;
        self.next_ms = sum;
        delay
    }

    pub fn reset(&mut self) {
        self.current_ms = self.seed_ms;
        self.next_ms = self.seed_ms;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::from_millis(1_000, 30_000)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fibonacci_sequence_is_capped() {
        let mut b = Backoff::default();
        let got: Vec<u64> = (0..10).map(|_| b.next_delay().as_millis() as u64).collect();
        assert_eq!(
            got,
            vec![1_000, 1_000, 2_000, 3_000, 5_000, 8_000, 13_000, 21_000, 30_000, 30_000]
        );
    }

    #[test]
    fn test_reset_returns_to_seed() {
        let mut b = Backoff::default();
        for _ in 0..6 {
            b.next_delay();
        }
        assert_eq!(b.peek(), Duration::from_millis(13_000));
        b.reset();
        assert_eq!(b.next_delay(), Duration::from_secs(1));
        assert_eq!(b.next_delay(), Duration::from_secs(1));
        assert_eq!(b.next_delay(), Duration::from_secs(2));
    }

    #[test]
    fn test_long_runs_do_not_overflow() {
        let mut b = Backoff::from_millis(1_000, 30_000);
        for _ in 0..500 {
            assert!(b.next_delay() <= Duration::from_secs(30));
        }
    }
}
