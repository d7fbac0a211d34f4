//! Optimistic snapshot guard around a recalculation pass.
//!
//! A pass captures the activity signature of its scope before reading,
//! computes, and commits only if the signature is unchanged. Otherwise the
//! result is discarded and the whole pass runs again after a randomized
//! backoff, up to a fixed number of retries.

use crate::{
    backoff::Backoff,
    error::{LedgerError, LedgerResult},
    types::Stamp,
};
use serde::{Deserialize, Serialize};

/// Cheap fingerprint of the event log in one scope.
///
/// Row counts include soft-deleted rows; together with the latest stamp
/// they change on every insert, edit, delete, restore or group move.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivitySignature {
    pub latest_expense: Option<Stamp>,
    pub expense_rows: i64,
    pub latest_settlement: Option<Stamp>,
    pub settlement_rows: i64,
}

/// Outcome of one guarded attempt.
pub enum Attempt<T> {
    Done(T),
    /// The signature moved; the attempt's results were discarded.
    Stale,
}

pub struct ConcurrencyGuard<'a> {
    max_retries: u32,
    backoff: &'a mut Backoff,
}

impl<'a> ConcurrencyGuard<'a> {
    pub fn new(max_retries: u32, backoff: &'a mut Backoff) -> Self {
        Self { max_retries, backoff }
    }

    /// Run `attempt` until it completes, fails, or goes stale more than
    /// `max_retries` times. Returns the result and the attempt count.
    pub fn run<T>(
        &mut self,
        label: &str,
        mut attempt: impl FnMut(u32) -> LedgerResult<Attempt<T>>,
    ) -> LedgerResult<(T, u32)> {
        let attempts = self.max_retries.saturating_add(1);
        for n in 1..=attempts {
            match attempt(n)? {
                Attempt::Done(value) => return Ok((value, n)),
                Attempt::Stale => {
                    log::warn!("{label}: ledger changed during attempt {n}/{attempts}");
                    if n < attempts {
                        self.backoff.pause(n);
                    }
                }
            }
        }
        Err(LedgerError::ConcurrencyExhausted { attempts })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn completes_after_stale_attempts() {
        let mut backoff = Backoff::new(1, 0, 0);
        let mut guard = ConcurrencyGuard::new(3, &mut backoff);
        let (value, attempts) = guard
            .run("test", |n| Ok(if n < 3 { Attempt::Stale } else { Attempt::Done(n * 10) }))
            .unwrap();
        assert_eq!((value, attempts), (30, 3));
    }

    #[test]
    fn exhaustion_reports_attempt_count() {
        let mut backoff = Backoff::new(1, 0, 0);
        let mut guard = ConcurrencyGuard::new(2, &mut backoff);
        let mut calls = 0;
        let err = guard
            .run::<()>("test", |_| {
                calls += 1;
                Ok(Attempt::Stale)
            })
            .unwrap_err();
        assert!(matches!(err, LedgerError::ConcurrencyExhausted { attempts: 3 }));
        assert_eq!(calls, 3);
    }

    #[test]
    fn errors_are_not_retried() {
        let mut backoff = Backoff::new(1, 0, 0);
        let mut guard = ConcurrencyGuard::new(5, &mut backoff);
        let mut calls = 0;
        let result = guard.run::<()>("test", |_| {
            calls += 1;
            Err(LedgerError::ZeroSumViolation { sum: 1.0, tolerance: 0.05 })
        });
        assert!(result.is_err());
        assert_eq!(calls, 1);
    }
}
