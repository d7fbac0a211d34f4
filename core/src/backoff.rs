//! Randomized retry backoff.
//!
//! Jitter comes from a seeded PCG stream so a test config with a fixed
//! seed produces the same delays every run. Production configs leave the
//! seed unset and draw one per ledger.

use crate::config::LedgerConfig;
use rand::{RngCore, SeedableRng};
use rand_pcg::Pcg64Mcg;
use std::time::Duration;

/// Largest doubling applied to the base step.
const MAX_DOUBLINGS: u32 = 6;

pub struct Backoff {
    base_ms: u64,
    jitter_ms: u64,
    inner: Pcg64Mcg,
}

impl Backoff {
    pub fn new(seed: u64, base_ms: u64, jitter_ms: u64) -> Self {
        // Spread nearby seeds across the state space.
        let derived_seed = seed ^ 0x9e37_79b9_7f4a_7c15;
        Self {
            base_ms,
            jitter_ms,
            inner: Pcg64Mcg::seed_from_u64(derived_seed),
        }
    }

    pub fn from_config(config: &LedgerConfig) -> Self {
        let seed = config.jitter_seed.unwrap_or_else(rand::random);
        Self::new(seed, config.backoff_base_ms, config.backoff_jitter_ms)
    }

    /// Delay before retry number `retry` (1-based).
    pub fn delay_for(&mut self, retry: u32) -> Duration {
        let doublings = retry.saturating_sub(1).min(MAX_DOUBLINGS);
        let step = self.base_ms.saturating_mul(1u64 << doublings);
        let jitter = if self.jitter_ms == 0 {
            0
        } else {
            self.inner.next_u64() % (self.jitter_ms + 1)
        };
        Duration::from_millis(step + jitter)
    }

    /// Block the current pass before retrying.
    pub fn pause(&mut self, retry: u32) {
        let delay = self.delay_for(retry);
        if !delay.is_zero() {
            log::debug!("Backing off {}ms before retry {retry}", delay.as_millis());
            std::thread::sleep(delay);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_seed_gives_same_delays() {
        let mut a = Backoff::new(7, 10, 50);
        let mut b = Backoff::new(7, 10, 50);
        let da: Vec<_> = (1..=4).map(|r| a.delay_for(r)).collect();
        let db: Vec<_> = (1..=4).map(|r| b.delay_for(r)).collect();
        assert_eq!(da, db);
    }

    #[test]
    fn step_doubles_and_jitter_is_bounded() {
        let mut backoff = Backoff::new(1, 10, 5);
        for retry in 1..=3u32 {
            let step = 10u64 << (retry - 1);
            let ms = backoff.delay_for(retry).as_millis() as u64;
            assert!(ms >= step && ms <= step + 5, "retry {retry}: {ms}ms");
        }
    }

    #[test]
    fn zero_config_never_sleeps() {
        let mut backoff = Backoff::new(3, 0, 0);
        assert!(backoff.delay_for(1).is_zero());
        assert!(backoff.delay_for(9).is_zero());
    }
}
