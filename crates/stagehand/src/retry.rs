use std::time::Duration;

use crate::error::{Error, Result};

/// Bounded retry with a fixed inter-attempt delay. Store writes go through
/// this policy; nothing else in a round is retried (build retries happen
/// across rounds, driven by the external scheduler).
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            delay: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            delay,
        }
    }

    /// Runs `op` until it succeeds or `max_attempts` is exhausted, sleeping
    /// `delay` between attempts. Returns the last error on exhaustion.
    pub fn run<T, F>(&self, what: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Result<T>,
    {
        let attempts = self.max_attempts.max(1);
        let mut last = None;
        for attempt in 1..=attempts {
            match op() {
                Ok(v) => return Ok(v),
                Err(e) => {
                    last = Some(e);
                    if attempt < attempts && !self.delay.is_zero() {
                        std::thread::sleep(self.delay);
                    }
                }
            }
        }
        let last = last
            .map(|e| e.to_string())
            .unwrap_or_else(|| "no attempts made".to_string());
        Err(Error::msg(format!(
            "{what} failed after {attempts} attempts: {last}"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    fn fast(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::new(max_attempts, Duration::ZERO)
    }

    #[test]
    fn first_success_short_circuits() {
        let calls = Cell::new(0u32);
        let out = fast(5).run("op", || {
            calls.set(calls.get() + 1);
            Ok(7)
        });
        assert_eq!(out.unwrap(), 7);
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn recovers_after_transient_failures() {
        let calls = Cell::new(0u32);
        let out = fast(5).run("op", || {
            calls.set(calls.get() + 1);
            if calls.get() < 4 {
                Err(Error::msg("transient"))
            } else {
                Ok("ref-9")
            }
        });
        assert_eq!(out.unwrap(), "ref-9");
        assert_eq!(calls.get(), 4);
    }

    #[test]
    fn exhaustion_reports_attempt_count_and_last_error() {
        let calls = Cell::new(0u32);
        let out: Result<()> = fast(5).run("publish", || {
            calls.set(calls.get() + 1);
            Err(Error::msg(format!("boom {}", calls.get())))
        });
        assert_eq!(calls.get(), 5);
        let msg = out.unwrap_err().to_string();
        assert!(msg.contains("publish failed after 5 attempts"), "{msg}");
        assert!(msg.contains("boom 5"), "{msg}");
    }

    #[test]
    fn zero_attempts_is_clamped_to_one() {
        let calls = Cell::new(0u32);
        let _ = fast(0).run("op", || -> Result<()> {
            calls.set(calls.get() + 1);
            Err(Error::msg("nope"))
        });
        assert_eq!(calls.get(), 1);
    }
}
