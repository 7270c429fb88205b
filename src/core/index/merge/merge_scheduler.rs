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

use crate::core::index::merge::{MergeTrigger, OneMerge, OneMergeRunningInfo};
use crate::core::index::writer::IndexWriter;
use crate::core::store::RateLimiter;
use crate::error::{ErrorKind::IllegalArgument, Result};

use std::cmp::Ordering;
use std::f64;
use std::fmt;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, Weak};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};

/// Expert: `IndexWriter` uses an instance
/// implementing this interface to execute the merges
/// selected by a `MergePolicy`.  The default
/// MergeScheduler is `SerialMergeScheduler`.
pub trait MergeScheduler: Send + Sync + fmt::Debug {
    /// Run the merges provided by `IndexWriter::next_merge`.
    fn merge(
        &self,
        writer: &IndexWriter,
        trigger: MergeTrigger,
        new_merges_found: bool,
    ) -> Result<()>;

    /// Close this MergeScheduler.
    fn close(&self) -> Result<()>;

    fn merging_thread_count(&self) -> Option<usize> {
        None
    }
}

/// A `MergeScheduler` that simply does each merge
/// sequentially, using the current thread.
#[derive(Debug, Default)]
pub struct SerialMergeScheduler {
    // one merging thread at a time
    lock: Mutex<()>,
}

impl MergeScheduler for SerialMergeScheduler {
    fn merge(
        &self,
        writer: &IndexWriter,
        _trigger: MergeTrigger,
        _new_merges_found: bool,
    ) -> Result<()> {
        let _guard = self.lock.lock()?;
        while let Some(merge) = writer.next_merge() {
            debug!("SMS: run merge {}", merge.seg_string());
            writer.merge(merge)?;
        }
        Ok(())
    }

    fn close(&self) -> Result<()> {
        Ok(())
    }
}

struct ThreadSentinel;

struct MergeTaskInfo {
    merge: OneMergeRunningInfo,
    thread_id: ThreadId,
    live_sentinel: Weak<ThreadSentinel>,
    start_time: Instant,
}

impl MergeTaskInfo {
    fn thread_alive(&self) -> bool {
        self.live_sentinel.upgrade().is_some()
    }
}

// largest merges first
fn by_size_desc(a: &MergeTaskInfo, b: &MergeTaskInfo) -> Ordering {
    b.merge
        .estimated_merge_bytes
        .cmp(&a.merge.estimated_merge_bytes)
        .then_with(|| a.merge.id.cmp(&b.merge.id))
}

/// A `MergeScheduler` that runs each merge using a separate thread.
///
/// Specify the max number of threads that may run at once, and the maximum number
/// of simultaneous merges with `set_max_merges_and_threads`.
///
/// If the number of merges exceeds the max number of threads then the largest merges
/// are paused until one of the smaller merges completes.
///
/// If more than *max_merge_count* merges are requested then this class will forcefully
/// throttle the incoming threads by pausing until one more more merges complete.
#[derive(Clone)]
pub struct ConcurrentMergeScheduler {
    inner: Arc<ConcurrentMergeSchedulerInner>,
}

impl Default for ConcurrentMergeScheduler {
    fn default() -> Self {
        let max_thread_count = 1.max(4.min(num_cpus::get() / 2));
        ConcurrentMergeScheduler {
            inner: Arc::new(ConcurrentMergeSchedulerInner::new(
                max_thread_count + DEFAULT_EXTRA_MERGE_COUNT,
                max_thread_count,
            )),
        }
    }
}

impl ConcurrentMergeScheduler {
    pub fn new(max_merge_count: usize, max_thread_count: usize) -> Result<Self> {
        check_merges_and_threads(max_merge_count, max_thread_count)?;
        Ok(ConcurrentMergeScheduler {
            inner: Arc::new(ConcurrentMergeSchedulerInner::new(
                max_merge_count,
                max_thread_count,
            )),
        })
    }

    /// Expert: directly set the maximum number of merge threads and
    /// simultaneous merges allowed.
    pub fn set_max_merges_and_threads(
        &self,
        max_merge_count: usize,
        max_thread_count: usize,
    ) -> Result<()> {
        check_merges_and_threads(max_merge_count, max_thread_count)?;
        let mut state = self.inner.state.lock()?;
        state.max_merge_count = max_merge_count;
        state.max_thread_count = max_thread_count;
        state.update_merge_threads();
        Ok(())
    }

    pub fn max_merge_count(&self) -> usize {
        self.inner.state.lock().map(|s| s.max_merge_count).unwrap_or(0)
    }

    pub fn max_thread_count(&self) -> usize {
        self.inner.state.lock().map(|s| s.max_thread_count).unwrap_or(0)
    }

    /// Turn off auto IO throttling: merges below the big merge size and all
    /// others then run at full speed, unless they have to be paused.
    pub fn disable_auto_io_throttle(&self) -> Result<()> {
        let mut state = self.inner.state.lock()?;
        state.do_auto_io_throttle = false;
        state.update_merge_threads();
        Ok(())
    }

    pub fn set_force_merge_mb_per_sec(&self, mb_per_sec: f64) -> Result<()> {
        if !(mb_per_sec > 0.0) {
            bail!(IllegalArgument(format!(
                "force merge rate must be > 0, got {}",
                mb_per_sec
            )));
        }
        let mut state = self.inner.state.lock()?;
        state.force_merge_mb_per_sec = mb_per_sec;
        state.update_merge_threads();
        Ok(())
    }

    /// Blocks until every merge thread this scheduler started has exited.
    pub fn sync(&self) -> Result<()> {
        loop {
            let handles = {
                let mut state = self.inner.state.lock()?;
                ::std::mem::replace(&mut state.handles, vec![])
            };
            if handles.is_empty() {
                return Ok(());
            }
            let current = thread::current().id();
            for handle in handles {
                if handle.thread().id() == current {
                    continue;
                }
                if handle.join().is_err() {
                    warn!("CMS: a merge thread panicked");
                }
            }
        }
    }
}

impl fmt::Debug for ConcurrentMergeScheduler {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.inner.state.lock() {
            Ok(state) => write!(
                f,
                "ConcurrentMergeScheduler(max_merge_count={}, max_thread_count={}, \
                 target_mb_per_sec={:.1}, running={})",
                state.max_merge_count,
                state.max_thread_count,
                state.target_mb_per_sec,
                state.merge_tasks.len()
            ),
            Err(_) => write!(f, "ConcurrentMergeScheduler(poisoned)"),
        }
    }
}

fn check_merges_and_threads(max_merge_count: usize, max_thread_count: usize) -> Result<()> {
    if max_thread_count == 0 {
        bail!(IllegalArgument("max_thread_count should be at least 1".into()));
    }
    if max_thread_count > max_merge_count {
        bail!(IllegalArgument(format!(
            "max_thread_count should be <= max_merge_count (= {})",
            max_merge_count
        )));
    }
    Ok(())
}

struct ConcurrentMergeSchedulerInner {
    state: Mutex<SchedulerState>,
    cond: Condvar,
}

struct SchedulerState {
    merge_tasks: Vec<MergeTaskInfo>,
    handles: Vec<JoinHandle<()>>,
    max_merge_count: usize,
    max_thread_count: usize,
    // how many merge threads were ever started, names new ones
    merge_thread_count: usize,
    target_mb_per_sec: f64,
    do_auto_io_throttle: bool,
    force_merge_mb_per_sec: f64,
}

// Floor for IO write rate limit (we will never go any lower than this)
const MIN_MERGE_MB_PER_SEC: f64 = 5.0;

// Ceiling for IO write rate limit (we will never go any higher than this)
const MAX_MERGE_MB_PER_SEC: f64 = 10240.0;

// Initial value for IO write rate limit when do_auto_io_throttle is true
const START_MB_PER_SEC: f64 = 20.0;

// Merges below this size are not counted in the max_thread_count, i.e. they can freely run in
// their own thread (up until max_merge_count).
const MIN_BIG_MERGE_MB: f64 = 50.0;

const DEFAULT_EXTRA_MERGE_COUNT: usize = 5;

impl ConcurrentMergeSchedulerInner {
    fn new(max_merge_count: usize, max_thread_count: usize) -> Self {
        ConcurrentMergeSchedulerInner {
            state: Mutex::new(SchedulerState::new(max_merge_count, max_thread_count)),
            cond: Condvar::new(),
        }
    }

    /// Waits while too many merges are running and more are pending. Returns
    /// false if the caller is itself a merge thread and must not start more.
    fn maybe_stall<'a>(
        &self,
        writer: &IndexWriter,
        guard: MutexGuard<'a, SchedulerState>,
    ) -> Result<(bool, MutexGuard<'a, SchedulerState>)> {
        let thread_id = thread::current().id();
        let mut guard = guard;
        while writer.has_pending_merges() && guard.merge_thread_count() >= guard.max_merge_count
        {
            // This means merging has fallen too far behind: we
            // have already created max_merge_count threads, and
            // now there's at least one more merge pending.
            // Note that only max_thread_count of
            // those created merge threads will actually be
            // running; the rest will be paused (see
            // update_merge_threads).  We stall this producer
            // thread to prevent creation of new segments,
            // until merging has caught up:
            if guard.merge_tasks.iter().any(|t| t.thread_id == thread_id) {
                // Never stall a merge thread since this blocks the thread from
                // finishing and calling update_merge_threads, and blocking it
                // accomplishes nothing anyway (it's not really a segment producer):
                return Ok((false, guard));
            }
            debug!("CMS: too many merges; stalling...");
            let (g, _) = self.cond.wait_timeout(guard, Duration::from_millis(250))?;
            guard = g;
        }
        Ok((true, guard))
    }
}

impl SchedulerState {
    fn new(max_merge_count: usize, max_thread_count: usize) -> Self {
        SchedulerState {
            merge_tasks: vec![],
            handles: vec![],
            max_merge_count,
            max_thread_count,
            merge_thread_count: 0,
            target_mb_per_sec: START_MB_PER_SEC,
            do_auto_io_throttle: true,
            force_merge_mb_per_sec: f64::INFINITY,
        }
    }

    /// Pauses the largest merges when more big merges run than
    /// `max_thread_count`, and sets the rate of all others.
    fn update_merge_threads(&mut self) {
        let mut active_tasks: Vec<&MergeTaskInfo> = self
            .merge_tasks
            .iter()
            .filter(|t| !t.merge.rate_limiter.aborted())
            .collect();
        active_tasks.sort_by(|a, b| by_size_desc(a, b));

        let tasks_count = active_tasks.len();
        let min_big_merge_bytes = MIN_BIG_MERGE_MB * 1024.0 * 1024.0;

        let mut big_merge_count = 0;
        for i in (0..tasks_count).rev() {
            if active_tasks[i].merge.estimated_merge_bytes as f64 > min_big_merge_bytes {
                big_merge_count = i + 1;
                break;
            }
        }

        for (idx, task) in active_tasks.iter().enumerate() {
            // pause the thread if max_thread_count is smaller than the number of merge threads.
            let do_pause = idx + self.max_thread_count < big_merge_count;

            let new_mb_per_sec = if do_pause {
                0.0
            } else if task.merge.is_forced() {
                self.force_merge_mb_per_sec
            } else if !self.do_auto_io_throttle
                || (task.merge.estimated_merge_bytes as f64) < min_big_merge_bytes
            {
                f64::INFINITY
            } else {
                self.target_mb_per_sec
            };

            #[allow(clippy::float_cmp)]
            let changed = task.merge.rate_limiter.mb_per_sec() != new_mb_per_sec;
            if changed {
                debug!(
                    "CMS: merge {} now {}",
                    task.merge.id,
                    if do_pause {
                        "paused".to_string()
                    } else {
                        format!("at {:.1} MB/sec", new_mb_per_sec)
                    }
                );
            }
            task.merge.rate_limiter.set_mb_per_sec(new_mb_per_sec);
        }
    }

    /// Merge threads that are alive, not aborted and not the calling thread.
    fn merge_thread_count(&self) -> usize {
        let current_thread = thread::current().id();
        self.merge_tasks
            .iter()
            .filter(|t| {
                t.thread_id != current_thread && t.thread_alive() && !t.merge.rate_limiter.aborted()
            })
            .count()
    }

    fn update_io_throttle(&mut self, new_merge: &OneMerge) {
        if !self.do_auto_io_throttle {
            return;
        }

        let merge_mb = bytes_to_mb(new_merge.estimated_merge_bytes);
        if merge_mb < MIN_BIG_MERGE_MB {
            // Only watch non-trivial merges for throttling; this is safe because the MP must
            // eventually have to do larger merges:
            return;
        }

        let now = Instant::now();
        // Simplistic closed-loop feedback control: if we find any other similarly
        // sized merges running, then we are falling behind, so we bump up the
        // IO throttle, else we lower it:
        let new_back_log = self.is_back_log(now, new_merge.id, new_merge.estimated_merge_bytes);

        let mut cur_back_log = false;
        if !new_back_log {
            if self.merge_tasks.len() > self.max_thread_count {
                // If there are already more than the maximum merge threads allowed, count that as
                // backlog:
                cur_back_log = true;
            } else {
                // Now see if any still-running merges are backlog'd:
                cur_back_log = self.merge_tasks.iter().any(|task| {
                    self.is_back_log(now, task.merge.id, task.merge.estimated_merge_bytes)
                });
            }
        }

        if new_back_log {
            // This new merge adds to the backlog: increase IO throttle by 20%
            self.target_mb_per_sec = MAX_MERGE_MB_PER_SEC.min(self.target_mb_per_sec * 1.2);
        } else if !cur_back_log {
            // We are not falling behind: decrease IO throttle by 10%
            self.target_mb_per_sec = MIN_MERGE_MB_PER_SEC.max(self.target_mb_per_sec / 1.1);
        }
        debug!(
            "CMS: io throttle now {:.1} MB/sec (new_back_log={} cur_back_log={})",
            self.target_mb_per_sec, new_back_log, cur_back_log
        );

        let rate = if new_merge.max_num_segments.is_some() {
            self.force_merge_mb_per_sec
        } else {
            self.target_mb_per_sec
        };
        new_merge.rate_limiter.set_mb_per_sec(rate);
    }

    fn is_back_log(&self, now: Instant, merge_id: u32, estimated_merge_bytes: u64) -> bool {
        let merge_mb = bytes_to_mb(estimated_merge_bytes);
        self.merge_tasks.iter().any(|task| {
            if task.merge.id == merge_id
                || (task.merge.estimated_merge_bytes as f64) < MIN_BIG_MERGE_MB * 1024.0 * 1024.0
                || now.duration_since(task.start_time) <= Duration::from_secs(3)
            {
                return false;
            }
            let ratio = bytes_to_mb(task.merge.estimated_merge_bytes) / merge_mb;
            ratio > 0.3 && ratio < 3.0
        })
    }
}

impl MergeScheduler for ConcurrentMergeScheduler {
    fn merge(
        &self,
        writer: &IndexWriter,
        trigger: MergeTrigger,
        _new_merges_found: bool,
    ) -> Result<()> {
        let mut guard = self.inner.state.lock()?;

        if trigger == MergeTrigger::Closing {
            // Disable throttling on close:
            guard.target_mb_per_sec = MAX_MERGE_MB_PER_SEC;
            guard.update_merge_threads();
        }

        // First, quickly run through the newly proposed merges
        // and add any orthogonal merges (ie a merge not
        // involving segments already pending to be merged) to
        // the queue.  If we are way behind on merging, many of
        // these newly proposed merges will likely already be
        // registered.
        loop {
            let (valid, g) = self.inner.maybe_stall(writer, guard)?;
            guard = g;
            if !valid {
                debug!("CMS: merge thread won't start more merges while stalled");
                return Ok(());
            }

            let merge = match writer.next_merge() {
                Some(merge) => merge,
                None => {
                    debug!("CMS: no more merges pending; now return");
                    return Ok(());
                }
            };
            guard.update_io_throttle(&merge);

            let sentinel = Arc::new(ThreadSentinel);
            let live_sentinel = Arc::downgrade(&sentinel);
            let merge_info = merge.running_info();
            let merge_thread = MergeThread {
                index_writer: writer.clone(),
                merge_scheduler: self.clone(),
                _live_sentinel: sentinel,
            };
            let thread_name = format!("Sediment Merge Thread #{}", guard.merge_thread_count);
            debug!("CMS: launch new thread [{}]", thread_name);
            let spawned = thread::Builder::new()
                .name(thread_name)
                .spawn(move || merge_thread.run(merge));
            let handle = match spawned {
                Ok(handle) => handle,
                Err(e) => {
                    writer.abandon_merge(&merge_info);
                    return Err(e.into());
                }
            };
            guard.merge_thread_count += 1;
            guard.merge_tasks.push(MergeTaskInfo {
                merge: merge_info,
                thread_id: handle.thread().id(),
                live_sentinel,
                start_time: Instant::now(),
            });
            guard.handles.retain(|h| !h.is_finished());
            guard.handles.push(handle);
            guard.update_merge_threads();
        }
    }

    fn close(&self) -> Result<()> {
        self.sync()
    }

    fn merging_thread_count(&self) -> Option<usize> {
        self.inner.state.lock().ok().map(|s| s.merge_thread_count())
    }
}

fn bytes_to_mb(bytes: u64) -> f64 {
    bytes as f64 / 1024.0 / 1024.0
}

struct MergeThread {
    index_writer: IndexWriter,
    // a sentinel object used by MergeTaskInfo to determine whether target thread is alive
    _live_sentinel: Arc<ThreadSentinel>,
    merge_scheduler: ConcurrentMergeScheduler,
}

impl MergeThread {
    fn run(self, one_merge: OneMerge) {
        let id = one_merge.id;
        let seg_string = one_merge.seg_string();
        debug!("CMS: merge thread {:?} start", thread::current().name());
        match self.do_merge(one_merge) {
            Err(ref e) if e.is_merge_aborted() => {
                // OK to ignore
            }
            Err(e) => {
                error!("CMS: merge {} failed: {}", seg_string, e);
            }
            Ok(()) => {}
        }
        match self.merge_scheduler.inner.state.lock() {
            Ok(mut state) => {
                state.merge_tasks.retain(|t| t.merge.id != id);
                state.update_merge_threads();
            }
            Err(e) => error!("CMS: failed to unregister merge {}: {}", id, e),
        }
        // In case we had stalled indexing, we can now wake up
        // and possibly unstall:
        self.merge_scheduler.inner.cond.notify_all();
        debug!("CMS: merge thread {:?} end", thread::current().name());
    }

    fn do_merge(&self, merge: OneMerge) -> Result<()> {
        self.index_writer.merge(merge)?;

        // Let CMS run new merges if necessary
        match self
            .merge_scheduler
            .merge(&self.index_writer, MergeTrigger::MergeFinished, true)
        {
            Err(ref e) if e.is_already_closed() => Ok(()),
            res => res,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::index::merge::MergeRateLimiter;

    fn task(id: u32, mb: u64, forced: bool) -> (MergeTaskInfo, Arc<ThreadSentinel>) {
        let sentinel = Arc::new(ThreadSentinel);
        let info = MergeTaskInfo {
            merge: OneMergeRunningInfo {
                id,
                segments: vec![format!("_{}", id)],
                max_num_segments: if forced { Some(1) } else { None },
                estimated_merge_bytes: mb * 1024 * 1024,
                total_max_doc: 10,
                rate_limiter: Arc::new(MergeRateLimiter::new()),
            },
            thread_id: thread::current().id(),
            live_sentinel: Arc::downgrade(&sentinel),
            start_time: Instant::now(),
        };
        (info, sentinel)
    }

    fn rate_of(state: &SchedulerState, id: u32) -> f64 {
        state
            .merge_tasks
            .iter()
            .find(|t| t.merge.id == id)
            .map(|t| t.merge.rate_limiter.mb_per_sec())
            .unwrap_or(-1.0)
    }

    #[test]
    fn test_largest_merges_are_paused() {
        let mut state = SchedulerState::new(6, 2);
        let mut sentinels = vec![];
        for (id, mb) in [(0u32, 100u64), (1, 400), (2, 200), (3, 300)].iter() {
            let (t, s) = task(*id, *mb, false);
            state.merge_tasks.push(t);
            sentinels.push(s);
        }
        state.update_merge_threads();
        // the two smallest big merges run, the rest are paused
        assert_eq!(rate_of(&state, 1), 0.0);
        assert_eq!(rate_of(&state, 3), 0.0);
        assert_eq!(rate_of(&state, 2), START_MB_PER_SEC);
        assert_eq!(rate_of(&state, 0), START_MB_PER_SEC);

        // once the largest is gone the next one resumes
        state.merge_tasks.retain(|t| t.merge.id != 1);
        state.update_merge_threads();
        assert_eq!(rate_of(&state, 3), 0.0);
        state.merge_tasks.retain(|t| t.merge.id != 3);
        state.update_merge_threads();
        assert_eq!(rate_of(&state, 2), START_MB_PER_SEC);
    }

    #[test]
    fn test_small_and_forced_merges_rates() {
        let mut state = SchedulerState::new(6, 1);
        let (small, _s0) = task(0, 1, false);
        let (forced, _s1) = task(1, 60, true);
        state.merge_tasks.push(small);
        state.merge_tasks.push(forced);
        state.update_merge_threads();
        assert!(rate_of(&state, 0).is_infinite());
        assert!(rate_of(&state, 1).is_infinite());

        state.force_merge_mb_per_sec = 30.0;
        state.update_merge_threads();
        assert_eq!(rate_of(&state, 1), 30.0);
    }

    #[test]
    fn test_merge_thread_count_skips_dead_and_aborted() {
        let mut state = SchedulerState::new(6, 2);
        let (alive, _keep) = task(0, 1, false);
        let (dead, gone) = task(1, 1, false);
        let (aborted, _keep2) = task(2, 1, false);
        aborted.merge.rate_limiter.set_abort();
        drop(gone);
        state.merge_tasks.push(alive);
        state.merge_tasks.push(dead);
        state.merge_tasks.push(aborted);
        // all tasks were built on this thread, so they are not counted here
        assert_eq!(state.merge_thread_count(), 0);

        let state = Arc::new(Mutex::new(state));
        let counted = {
            let state = Arc::clone(&state);
            thread::spawn(move || state.lock().map(|s| s.merge_thread_count()).unwrap_or(0))
                .join()
                .unwrap()
        };
        assert_eq!(counted, 1);
    }

    #[test]
    fn test_invalid_settings_are_rejected() -> Result<()> {
        assert!(ConcurrentMergeScheduler::new(2, 0).is_err());
        assert!(ConcurrentMergeScheduler::new(1, 2).is_err());
        let cms = ConcurrentMergeScheduler::new(3, 1)?;
        assert_eq!(cms.max_merge_count(), 3);
        cms.set_max_merges_and_threads(4, 2)?;
        assert_eq!(cms.max_thread_count(), 2);
        assert!(cms.set_force_merge_mb_per_sec(0.0).is_err());

        let default = ConcurrentMergeScheduler::default();
        assert!(default.max_thread_count() >= 1);
        assert_eq!(
            default.max_merge_count(),
            default.max_thread_count() + DEFAULT_EXTRA_MERGE_COUNT
        );
        Ok(())
    }
}
