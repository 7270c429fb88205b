// Copyright 2019 Zhizhesihai (Beijing) Technology Limited.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// See the License for the specific language governing permissions and
// limitations under the License.

use crate::core::store::RateLimiter;
use crate::error::{ErrorKind::MergeAborted, Result};

use std::f64;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

const MIN_PAUSE_CHECK_MSEC: f64 = 25.0;

// longest single wait, callers loop while they should keep sleeping
const MAX_PAUSE_MSEC: u64 = 250;

/// This is the `RateLimiter` that `IndexWriter` assigns to each running merge,
/// to give `MergeScheduler`s ionice like control.
///
/// It is merge-private, it wakes up if its rate changes while it's paused,
/// it tracks how much time it spent stopped and paused, and it supports
/// aborting. A rate of 0.0 MB/s pauses the merge until the rate is raised
/// again or the merge is aborted.
pub struct MergeRateLimiter {
    total_bytes_written: AtomicU64,
    abort: AtomicBool,
    state: Mutex<LimiterState>,
    cond: Condvar,
}

struct LimiterState {
    mb_per_sec: f64,
    last_time: Instant,
    min_pause_check_bytes: u64,
    total_paused: Duration,
    total_stopped: Duration,
}

#[derive(Debug, Eq, PartialEq)]
enum PauseResult {
    No,
    Stopped,
    Paused,
}

impl MergeRateLimiter {
    pub fn new() -> Self {
        Default::default()
    }

    fn maybe_pause(&self, bytes: u64, cur_time: Instant) -> Result<PauseResult> {
        let state = self.state.lock()?;
        // Now is a good time to abort the merge:
        self.check_abort()?;

        let seconds_to_pause = bytes as f64 / 1024.0 / 1024.0 / state.mb_per_sec;
        // Time we should sleep until; this is purely instantaneous rate (just
        // adds seconds onto the last time we had paused to). A stopped merge
        // has no target at all.
        let target_time = if seconds_to_pause.is_finite() && seconds_to_pause < 1.0e9 {
            state
                .last_time
                .checked_add(Duration::from_secs_f64(seconds_to_pause))
        } else {
            None
        };

        let mut cur_pause_dur = match target_time {
            Some(target) if target <= cur_time => return Ok(PauseResult::No),
            Some(target) => target - cur_time,
            None => Duration::from_millis(MAX_PAUSE_MSEC),
        };

        // minimum realistic wait/sleep time is about 1 msec, so we don't
        // bother unless it's > 2 msec:
        if cur_pause_dur <= Duration::from_millis(2) {
            return Ok(PauseResult::No);
        }
        if cur_pause_dur > Duration::from_millis(MAX_PAUSE_MSEC) {
            cur_pause_dur = Duration::from_millis(MAX_PAUSE_MSEC);
        }

        // the scheduler can wake us up here if it changes our target rate:
        let (state, _) = self.cond.wait_timeout(state, cur_pause_dur)?;

        if state.mb_per_sec == 0.0 {
            Ok(PauseResult::Stopped)
        } else {
            Ok(PauseResult::Paused)
        }
    }

    /// Fails with `MergeAborted` once `set_abort` was called.
    pub fn check_abort(&self) -> Result<()> {
        if self.aborted() {
            bail!(MergeAborted("merge is aborted".into()));
        }
        Ok(())
    }

    /// Marks the merge aborted and wakes it up if it is paused.
    pub fn set_abort(&self) {
        self.abort.store(true, Ordering::Release);
        let _l = self.state.lock();
        self.cond.notify_all();
    }

    pub fn aborted(&self) -> bool {
        self.abort.load(Ordering::Acquire)
    }

    pub fn total_bytes_written(&self) -> u64 {
        self.total_bytes_written.load(Ordering::Acquire)
    }

    /// Time spent throttled by a positive rate.
    pub fn total_paused(&self) -> Duration {
        self.state
            .lock()
            .map(|s| s.total_paused)
            .unwrap_or_default()
    }

    /// Time spent stopped by a 0.0 rate.
    pub fn total_stopped(&self) -> Duration {
        self.state
            .lock()
            .map(|s| s.total_stopped)
            .unwrap_or_default()
    }
}

impl Default for MergeRateLimiter {
    fn default() -> Self {
        let limiter = MergeRateLimiter {
            total_bytes_written: AtomicU64::new(0),
            abort: AtomicBool::new(false),
            state: Mutex::new(LimiterState {
                mb_per_sec: f64::INFINITY,
                last_time: Instant::now(),
                min_pause_check_bytes: 0,
                total_paused: Duration::default(),
                total_stopped: Duration::default(),
            }),
            cond: Condvar::new(),
        };
        limiter.set_mb_per_sec(f64::INFINITY);
        limiter
    }
}

impl RateLimiter for MergeRateLimiter {
    fn set_mb_per_sec(&self, mb_per_sec: f64) {
        // 0.0 is allowed: it means the merge is paused
        if mb_per_sec.is_nan() || mb_per_sec < 0.0 {
            warn!("CMS: ignore invalid merge rate {} MB/sec", mb_per_sec);
            return;
        }
        let mut state = match self.state.lock() {
            Ok(state) => state,
            Err(_) => return,
        };
        state.mb_per_sec = mb_per_sec;
        let check_value = MIN_PAUSE_CHECK_MSEC / 1000.0 * mb_per_sec * 1024.0 * 1024.0;
        let check_bytes = if check_value.is_infinite() {
            u64::max_value()
        } else {
            check_value as u64
        };
        state.min_pause_check_bytes = ::std::cmp::min(64 * 1024 * 1024, check_bytes);
        self.cond.notify_all();
    }

    fn mb_per_sec(&self) -> f64 {
        self.state.lock().map(|s| s.mb_per_sec).unwrap_or(f64::INFINITY)
    }

    fn pause(&self, bytes: u64) -> Result<Duration> {
        self.total_bytes_written.fetch_add(bytes, Ordering::AcqRel);

        let mut start = Instant::now();
        let mut cur_time = start;
        let mut paused = Duration::default();
        // loop because a wait may return early and we check again when our
        // rate limit is changed while we were pausing:
        loop {
            let result = self.maybe_pause(bytes, cur_time)?;
            if result == PauseResult::No {
                // Set to cur_time, not target time, to enforce the instant
                // rate, not the "averaged over all history" rate:
                self.state.lock()?.last_time = cur_time;
                break;
            }
            cur_time = Instant::now();
            let dur = cur_time - start;
            start = cur_time;

            let mut state = self.state.lock()?;
            // Separately track when merge was stopped vs rate limited:
            if result == PauseResult::Stopped {
                state.total_stopped += dur;
            } else {
                state.total_paused += dur;
            }
            paused += dur;
        }
        Ok(paused)
    }

    fn min_pause_check_bytes(&self) -> u64 {
        self.state
            .lock()
            .map(|s| s.min_pause_check_bytes)
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_unlimited_rate_never_pauses() -> Result<()> {
        let limiter = MergeRateLimiter::new();
        assert!(limiter.mb_per_sec().is_infinite());
        assert_eq!(limiter.min_pause_check_bytes(), 64 * 1024 * 1024);
        assert_eq!(limiter.pause(1024 * 1024)?, Duration::default());
        assert_eq!(limiter.total_bytes_written(), 1024 * 1024);
        Ok(())
    }

    #[test]
    fn test_stopped_merge_resumes_when_rate_raised() -> Result<()> {
        let limiter = Arc::new(MergeRateLimiter::new());
        limiter.set_mb_per_sec(0.0);
        assert_eq!(limiter.min_pause_check_bytes(), 0);

        let resumer = {
            let limiter = Arc::clone(&limiter);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(100));
                limiter.set_mb_per_sec(f64::INFINITY);
            })
        };
        let paused = limiter.pause(1)?;
        resumer.join().unwrap();
        assert!(paused >= Duration::from_millis(50));
        // woken by the new rate, so the wait counts as throttled
        assert!(limiter.total_paused() + limiter.total_stopped() >= Duration::from_millis(50));
        Ok(())
    }

    #[test]
    fn test_abort_wakes_stopped_merge() {
        let limiter = Arc::new(MergeRateLimiter::new());
        limiter.set_mb_per_sec(0.0);
        let aborter = {
            let limiter = Arc::clone(&limiter);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(50));
                limiter.set_abort();
            })
        };
        let err = limiter.pause(1).unwrap_err();
        aborter.join().unwrap();
        assert!(err.is_merge_aborted());
        assert!(limiter.aborted());
        assert!(limiter.check_abort().is_err());
    }

    #[test]
    fn test_invalid_rate_is_ignored() {
        let limiter = MergeRateLimiter::new();
        limiter.set_mb_per_sec(5.0);
        limiter.set_mb_per_sec(-1.0);
        assert!((limiter.mb_per_sec() - 5.0).abs() < f64::EPSILON);
        assert_eq!(
            limiter.min_pause_check_bytes(),
            (0.025 * 5.0 * 1024.0 * 1024.0) as u64
        );
    }
}
