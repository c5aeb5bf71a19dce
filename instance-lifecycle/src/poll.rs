//! Bounded poll-until-ready loop shared by every wait in the crate

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::thread;
use std::time::Duration;
use tracing::debug;

/// How often and how many times to check a condition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollPolicy {
    pub interval_ms: u64,
    pub max_attempts: u32,
}

impl PollPolicy {
    pub const fn new(interval: Duration, max_attempts: u32) -> Self {
        Self {
            interval_ms: interval.as_millis() as u64,
            max_attempts,
        }
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    /// Upper bound on the time a wait can take
    pub fn budget(&self) -> Duration {
        self.interval() * self.max_attempts
    }
}

/// Outcome of a single check
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Poll<T> {
    Ready(T),
    Pending,
}

/// Check `condition` until it is ready, sleeping `policy.interval` between
/// attempts.
///
/// An `Err` from the condition is terminal and returned as is. Running out of
/// attempts yields [`Error::Timeout`] naming `operation`.
pub fn poll_until<T, F>(operation: &str, policy: &PollPolicy, mut condition: F) -> Result<T>
where
    F: FnMut() -> Result<Poll<T>>,
{
    for attempt in 1..=policy.max_attempts {
        match condition()? {
            Poll::Ready(value) => {
                debug!(operation, attempt, "condition met");
                return Ok(value);
            }
            Poll::Pending => {
                debug!(operation, attempt, max = policy.max_attempts, "still waiting");
            }
        }
        if attempt < policy.max_attempts && !policy.interval().is_zero() {
            thread::sleep(policy.interval());
        }
    }

    Err(Error::Timeout {
        operation: operation.to_string(),
        attempts: policy.max_attempts,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const FAST: PollPolicy = PollPolicy::new(Duration::ZERO, 5);

    #[test]
    fn returns_once_ready() {
        let mut calls = 0;
        let value = poll_until("counter", &FAST, || {
            calls += 1;
            Ok(if calls == 3 {
                Poll::Ready(calls)
            } else {
                Poll::Pending
            })
        })
        .unwrap();
        assert_eq!(value, 3);
        assert_eq!(calls, 3);
    }

    #[test]
    fn times_out_after_max_attempts() {
        let mut calls = 0;
        let err = poll_until::<(), _>("never", &FAST, || {
            calls += 1;
            Ok(Poll::Pending)
        })
        .unwrap_err();
        assert_eq!(calls, 5);
        match err {
            Error::Timeout {
                operation,
                attempts,
            } => {
                assert_eq!(operation, "never");
                assert_eq!(attempts, 5);
            }
            other => panic!("expected timeout, got {other:?}"),
        }
    }

    #[test]
    fn condition_error_stops_polling() {
        let mut calls = 0;
        let err = poll_until::<(), _>("fails", &FAST, || {
            calls += 1;
            Err(Error::Upstream("boom".into()))
        })
        .unwrap_err();
        assert_eq!(calls, 1);
        assert!(matches!(err, Error::Upstream(_)));
    }

    #[test]
    fn budget_is_interval_times_attempts() {
        let policy = PollPolicy::new(Duration::from_secs(2), 60);
        assert_eq!(policy.budget(), Duration::from_secs(120));
    }
}
