// Copyright 2026 Gart Contributors
// SPDX-License-Identifier: Apache-2.0

//! Bounded-polling and word-splitting helpers.

use std::time::{Duration, Instant};

/// Error produced when a bounded hardware poll gives up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("timed out polling hardware")]
pub struct PollTimeoutError;

/// Deadline tracker for hardware polling loops. Re-initialized per call,
/// never reused across operations.
#[derive(Debug, Clone, Copy)]
pub struct PollDeadline {
    deadline: Instant,
}

impl PollDeadline {
    pub fn after(timeout: Duration) -> Self {
        Self { deadline: Instant::now() + timeout }
    }

    pub fn expired(&self) -> bool {
        Instant::now() >= self.deadline
    }
}

/// Polls `done` until it returns true or `timeout` elapses, sleeping between
/// attempts with a doubling delay clamped to `[min_delay_us, max_delay_us]`.
///
/// The condition is always sampled once more after the deadline passes so a
/// slow scheduler cannot produce a spurious timeout.
pub fn poll_with_backoff(
    timeout: Duration,
    min_delay_us: u64,
    max_delay_us: u64,
    mut done: impl FnMut() -> bool,
) -> Result<(), PollTimeoutError> {
    let deadline = PollDeadline::after(timeout);
    let mut delay_us = min_delay_us.max(1);

    loop {
        if done() {
            return Ok(());
        }
        if deadline.expired() {
            break;
        }
        std::thread::sleep(Duration::from_micros(delay_us));
        delay_us = (delay_us << 1).min(max_delay_us.max(1));
    }

    if done() {
        return Ok(());
    }
    Err(PollTimeoutError)
}

#[inline]
pub const fn hi32_lo32_to_u64(hi: u32, lo: u32) -> u64 {
    ((hi as u64) << 32) | lo as u64
}

#[inline]
pub const fn u64_lo32(v: u64) -> u32 {
    v as u32
}

#[inline]
pub const fn u64_hi32(v: u64) -> u32 {
    (v >> 32) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn poll_succeeds_before_deadline() {
        let mut n = 0;
        let res = poll_with_backoff(Duration::from_millis(100), 1, 8, || {
            n += 1;
            n >= 3
        });
        assert_eq!(res, Ok(()));
        assert_eq!(n, 3);
    }

    #[test]
    fn poll_times_out() {
        let res = poll_with_backoff(Duration::from_millis(2), 1, 4, || false);
        assert_eq!(res, Err(PollTimeoutError));
    }

    #[test]
    fn word_splitting_round_trips() {
        let v = 0x1234_5678_9abc_def0_u64;
        assert_eq!(hi32_lo32_to_u64(u64_hi32(v), u64_lo32(v)), v);
    }
}
