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

use crate::core::index::writer::{
    BufferedUpdatesStream, DocumentsWriterDeleteQueue, DocumentsWriterPerThread,
    DocumentsWriterPerThreadPool, FlushByRamOrCountsPolicy, FlushPolicy, IndexWriterConfig,
    ThreadState, ThreadStateInner,
};
use crate::error::Result;

use arc_swap::ArcSwap;

use std::collections::{HashMap, VecDeque};
use std::mem;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Duration;

/// This class controls `DocumentsWriterPerThread` flushing during
/// indexing. It tracks the memory consumption per
/// `DocumentsWriterPerThread` and uses a configured `FlushPolicy` to
/// decide if a `DocumentsWriterPerThread` must flush.
///
/// In addition to the `FlushPolicy` the flush control might set certain
/// `DocumentsWriterPerThread` as flush pending iff a
/// `DocumentsWriterPerThread` exceeds the
/// `IndexWriterConfig::ram_per_thread_hard_limit_mb` to prevent address
/// space exhaustion.
pub struct DocumentsWriterFlushControl {
    lock: Mutex<FlushControlState>,
    cond: Condvar,
    stall_control: DocumentsWriterStallControl,
    flush_policy: Arc<dyn FlushPolicy>,
    config: Arc<IndexWriterConfig>,
    per_thread_pool: Arc<DocumentsWriterPerThreadPool>,
    updates_stream: Arc<BufferedUpdatesStream>,
    // the queue new builders are created against, swapped by a full flush
    delete_queue: ArcSwap<DocumentsWriterDeleteQueue>,
    hard_max_bytes_per_dwpt: u64,
    full_flush: AtomicBool,
    flush_deletes: AtomicBool,
}

/// Counters and queues of `DocumentsWriterFlushControl`, only reachable
/// through its lock.
pub struct FlushControlState {
    active_bytes: u64,
    flush_bytes: u64,
    num_pending: usize,
    flush_queue: VecDeque<DocumentsWriterPerThread>,
    // builders that became pending on the new delete queue while a full
    // flush runs; they wait until the full flush is done
    blocked_flushes: VecDeque<BlockedFlush>,
    // key is the segment name of the checked out builder
    flushing_writers: HashMap<String, u64>,
    full_flush_buffer: Vec<DocumentsWriterPerThread>,
    closed: bool,
    peak_active_bytes: u64,
    peak_flush_bytes: u64,
}

impl FlushControlState {
    pub fn active_bytes(&self) -> u64 {
        self.active_bytes
    }

    pub fn flush_bytes(&self) -> u64 {
        self.flush_bytes
    }
}

struct BlockedFlush {
    dwpt: DocumentsWriterPerThread,
    bytes: u64,
}

impl DocumentsWriterFlushControl {
    pub fn new(
        config: Arc<IndexWriterConfig>,
        per_thread_pool: Arc<DocumentsWriterPerThreadPool>,
        updates_stream: Arc<BufferedUpdatesStream>,
        delete_queue: Arc<DocumentsWriterDeleteQueue>,
    ) -> Self {
        let flush_policy = Arc::new(FlushByRamOrCountsPolicy::new(Arc::clone(&config)));
        DocumentsWriterFlushControl {
            lock: Mutex::new(FlushControlState {
                active_bytes: 0,
                flush_bytes: 0,
                num_pending: 0,
                flush_queue: VecDeque::new(),
                blocked_flushes: VecDeque::new(),
                flushing_writers: HashMap::new(),
                full_flush_buffer: vec![],
                closed: false,
                peak_active_bytes: 0,
                peak_flush_bytes: 0,
            }),
            cond: Condvar::new(),
            stall_control: DocumentsWriterStallControl::default(),
            flush_policy,
            hard_max_bytes_per_dwpt: config.ram_per_thread_hard_limit_bytes(),
            config,
            per_thread_pool,
            updates_stream,
            delete_queue: ArcSwap::new(delete_queue),
            full_flush: AtomicBool::new(false),
            flush_deletes: AtomicBool::new(false),
        }
    }

    /// The delete queue new builders attach to.
    pub fn delete_queue(&self) -> Arc<DocumentsWriterDeleteQueue> {
        self.delete_queue.load_full()
    }

    pub fn set_delete_queue(&self, queue: Arc<DocumentsWriterDeleteQueue>) {
        self.delete_queue.store(queue);
    }

    pub fn active_bytes(&self) -> u64 {
        self.lock.lock().map(|l| l.active_bytes).unwrap_or(0)
    }

    pub fn flush_bytes(&self) -> u64 {
        self.lock.lock().map(|l| l.flush_bytes).unwrap_or(0)
    }

    pub fn net_bytes(&self) -> u64 {
        self.lock
            .lock()
            .map(|l| l.active_bytes + l.flush_bytes)
            .unwrap_or(0)
    }

    pub fn peak_bytes(&self) -> (u64, u64) {
        self.lock
            .lock()
            .map(|l| (l.peak_active_bytes, l.peak_flush_bytes))
            .unwrap_or((0, 0))
    }

    /// Bytes held by buffered deletes, queued and already frozen.
    pub fn delete_bytes_used(&self) -> u64 {
        self.delete_queue.load().bytes_used() + self.updates_stream.ram_bytes_used()
    }

    pub fn num_global_term_deletes(&self) -> usize {
        self.delete_queue.load().num_global_term_deletes() + self.updates_stream.num_terms()
    }

    fn stall_limit_bytes(&self) -> u64 {
        self.config.ram_buffer_size_bytes().unwrap_or(::std::u64::MAX)
    }

    fn commit_per_thread_bytes(
        &self,
        locked: &mut FlushControlState,
        state: &ThreadState,
        dwpt_bytes: u64,
    ) {
        let old = state.bytes_used();
        state.set_bytes_used(dwpt_bytes);
        // the builder's estimate only grows between flushes, but an abort
        // resets it to zero
        if state.flush_pending() {
            locked.flush_bytes = (locked.flush_bytes + dwpt_bytes).saturating_sub(old);
        } else {
            locked.active_bytes = (locked.active_bytes + dwpt_bytes).saturating_sub(old);
        }
    }

    /// Accounts for the document just added on `state`, consults the flush
    /// policy and returns the builder if it must be flushed now. The caller
    /// holds the state's lock.
    pub fn do_after_document(
        &self,
        state: &ThreadState,
        inner: &mut ThreadStateInner,
        is_update: bool,
    ) -> Result<Option<DocumentsWriterPerThread>> {
        let mut locked = self.lock.lock()?;
        let res = self.process_after_document(&mut locked, state, inner, is_update);
        self.update_stall_state(&mut locked);
        res
    }

    fn process_after_document(
        &self,
        locked: &mut FlushControlState,
        state: &ThreadState,
        inner: &mut ThreadStateInner,
        is_update: bool,
    ) -> Result<Option<DocumentsWriterPerThread>> {
        let (dwpt_bytes, num_docs) = match inner.dwpt.as_ref() {
            Some(dwpt) => (dwpt.bytes_used(), dwpt.num_docs_in_ram),
            None => return Ok(None),
        };
        state.set_num_docs_in_ram(num_docs);
        self.commit_per_thread_bytes(locked, state, dwpt_bytes);
        if !state.flush_pending() {
            if is_update {
                self.flush_policy.on_update(self, locked, state);
            } else {
                self.flush_policy.on_insert(self, locked, state);
            }
            if !state.flush_pending() && state.bytes_used() > self.hard_max_bytes_per_dwpt {
                // Safety check to prevent a single DWPT exceeding its RAM limit. This
                // is super important since we can not address more than 2048 MB per DWPT
                debug!(
                    "DWFC: thread state {} exceeds the hard limit with {} bytes",
                    state.index,
                    state.bytes_used()
                );
                self.set_flush_pending(locked, state);
            }
        }

        if self.full_flush.load(Ordering::Acquire) {
            if state.flush_pending() {
                self.checkout_and_block(locked, state, inner);
                return Ok(self.poll_flush_queue(locked));
            }
            Ok(None)
        } else if state.flush_pending() {
            Ok(self.internal_try_checkout_for_flush(locked, state, inner))
        } else {
            Ok(None)
        }
    }

    fn update_stall_state(&self, locked: &mut FlushControlState) -> bool {
        let limit = self.stall_limit_bytes();
        // we block indexing threads if net byte grows due to slow flushes
        // yet, for small ram buffers and large documents we can easily
        // reach the limit without any ongoing flushes. we need to ensure
        // that we don't stall/block if an ongoing or pending flush can
        // not free up enough memory to release the stall lock.
        let stall = locked.active_bytes + locked.flush_bytes > limit
            && locked.active_bytes < limit
            && !locked.closed;
        if locked.active_bytes > locked.peak_active_bytes {
            locked.peak_active_bytes = locked.active_bytes;
        }
        if locked.flush_bytes > locked.peak_flush_bytes {
            locked.peak_flush_bytes = locked.flush_bytes;
        }
        self.stall_control.update_stalled(stall);
        stall
    }

    /// Marks `state` flush pending and moves its bytes from active to flush
    /// bytes. A state without documents is left alone.
    pub fn set_flush_pending(&self, locked: &mut FlushControlState, state: &ThreadState) {
        debug_assert!(!state.flush_pending());
        if state.num_docs_in_ram() > 0 {
            // write access synced
            state.set_flush_pending(true);
            let bytes = state.bytes_used();
            locked.flush_bytes += bytes;
            locked.active_bytes = locked.active_bytes.saturating_sub(bytes);
            locked.num_pending += 1;
            debug!(
                "DWFC: thread state {} flush pending with {} docs, {} bytes",
                state.index,
                state.num_docs_in_ram(),
                bytes
            );
        }
        // don't assert on num_docs since we could hit an abort while
        // selecting that dwpt for flushing
    }

    /// Returns the state using the most RAM among the states that are not
    /// pending yet, or `None` if no other state uses more than `state`.
    pub fn find_largest_non_pending_writer(&self, state: &ThreadState) -> Option<Arc<ThreadState>> {
        let mut max_ram_so_far = state.bytes_used();
        let mut largest = None;
        for next in self.per_thread_pool.thread_states().unwrap_or_default() {
            if next.index == state.index || next.flush_pending() {
                continue;
            }
            let next_ram = next.bytes_used();
            if next_ram > max_ram_so_far && next.num_docs_in_ram() > 0 {
                max_ram_so_far = next_ram;
                largest = Some(next);
            }
        }
        largest
    }

    /// Discards the accounting of a builder that hit an aborting error and
    /// detaches it from `state`.
    pub fn do_on_abort(
        &self,
        state: &ThreadState,
        inner: &mut ThreadStateInner,
    ) -> Result<Option<DocumentsWriterPerThread>> {
        let mut locked = self.lock.lock()?;
        if state.flush_pending() {
            locked.flush_bytes = locked.flush_bytes.saturating_sub(state.bytes_used());
            locked.num_pending = locked.num_pending.saturating_sub(1);
        } else {
            locked.active_bytes = locked.active_bytes.saturating_sub(state.bytes_used());
        }
        // Take it out of the loop this DWPT is stale
        let dwpt = self.per_thread_pool.reset(state, inner, false);
        self.update_stall_state(&mut locked);
        Ok(dwpt)
    }

    pub fn do_on_delete(&self) -> Result<()> {
        let mut locked = self.lock.lock()?;
        // pass None this is a global delete no update
        self.flush_policy.on_delete(self, &mut locked, None);
        Ok(())
    }

    pub fn get_and_reset_apply_all_deletes(&self) -> bool {
        self.flush_deletes.swap(false, Ordering::AcqRel)
    }

    pub fn set_apply_all_deletes(&self) {
        self.flush_deletes.store(true, Ordering::Release)
    }

    /// Must be called once the builder returned by `do_after_document` or
    /// `next_pending_flush` is flushed, or failed to.
    pub fn do_after_flush(&self, dwpt: DocumentsWriterPerThread) -> Result<()> {
        let mut locked = self.lock.lock()?;
        self.do_after_flush_locked(&mut locked, &dwpt);
        Ok(())
    }

    fn do_after_flush_locked(&self, locked: &mut FlushControlState, dwpt: &DocumentsWriterPerThread) {
        debug_assert!(locked.flushing_writers.contains_key(dwpt.segment_name()));
        if let Some(bytes) = locked.flushing_writers.remove(dwpt.segment_name()) {
            locked.flush_bytes = locked.flush_bytes.saturating_sub(bytes);
        }
        self.update_stall_state(locked);
        self.cond.notify_all();
    }

    /// Blocks until every checked out builder finished flushing.
    pub fn wait_for_flush(&self) -> Result<()> {
        let mut locked = self.lock.lock()?;
        while !locked.flushing_writers.is_empty() {
            locked = self.cond.wait(locked)?;
        }
        Ok(())
    }

    pub fn num_flushing(&self) -> usize {
        self.lock.lock().map(|l| l.flushing_writers.len()).unwrap_or(0)
    }

    pub fn num_queued_flushes(&self) -> usize {
        self.lock.lock().map(|l| l.flush_queue.len()).unwrap_or(0)
    }

    pub fn num_blocked_flushes(&self) -> usize {
        self.lock.lock().map(|l| l.blocked_flushes.len()).unwrap_or(0)
    }

    fn poll_flush_queue(&self, locked: &mut FlushControlState) -> Option<DocumentsWriterPerThread> {
        let dwpt = locked.flush_queue.pop_front();
        if dwpt.is_some() {
            self.update_stall_state(locked);
        }
        dwpt
    }

    /// Returns the next builder to flush: a queued one first, otherwise any
    /// pending one whose state is not in use right now.
    pub fn next_pending_flush(&self) -> Result<Option<DocumentsWriterPerThread>> {
        let (num_pending, full_flush) = {
            let mut locked = self.lock.lock()?;
            if let Some(dwpt) = self.poll_flush_queue(&mut locked) {
                return Ok(Some(dwpt));
            }
            (locked.num_pending, self.full_flush.load(Ordering::Acquire))
        };
        if num_pending > 0 && !full_flush {
            // don't check if we are doing a full flush
            for next in self.per_thread_pool.thread_states()? {
                if next.flush_pending() {
                    if let Some(dwpt) = self.try_checkout_for_flush(&next)? {
                        return Ok(Some(dwpt));
                    }
                }
            }
        }
        Ok(None)
    }

    fn try_checkout_for_flush(&self, state: &ThreadState) -> Result<Option<DocumentsWriterPerThread>> {
        // the state lock comes first, the control lock is taken while holding it
        let mut inner = match state.try_lock()? {
            Some(guard) => guard,
            None => return Ok(None),
        };
        let mut locked = self.lock.lock()?;
        let dwpt = if state.flush_pending() {
            self.internal_try_checkout_for_flush(&mut locked, state, &mut inner)
        } else {
            None
        };
        self.update_stall_state(&mut locked);
        Ok(dwpt)
    }

    fn internal_try_checkout_for_flush(
        &self,
        locked: &mut FlushControlState,
        state: &ThreadState,
        inner: &mut ThreadStateInner,
    ) -> Option<DocumentsWriterPerThread> {
        debug_assert!(state.flush_pending());
        // We are pending so all memory is already moved to flush_bytes
        if inner.inited() {
            let bytes = state.bytes_used();
            let dwpt = self.per_thread_pool.reset(state, inner, false)?;
            debug_assert!(!locked.flushing_writers.contains_key(dwpt.segment_name()));
            locked
                .flushing_writers
                .insert(dwpt.segment_name().to_string(), bytes);
            locked.num_pending -= 1;
            Some(dwpt)
        } else {
            None
        }
    }

    fn checkout_and_block(
        &self,
        locked: &mut FlushControlState,
        state: &ThreadState,
        inner: &mut ThreadStateInner,
    ) {
        debug_assert!(state.flush_pending());
        debug_assert!(self.full_flush.load(Ordering::Acquire));
        // do that before replace!
        let bytes = state.bytes_used();
        if let Some(dwpt) = self.per_thread_pool.reset(state, inner, false) {
            locked.num_pending -= 1;
            debug!(
                "DWFC: blocking flush of {} until the full flush is done",
                dwpt.segment_name()
            );
            locked.blocked_flushes.push_back(BlockedFlush { dwpt, bytes });
        }
    }

    // moves the blocked builders of `flushing_queue` into the flush queue
    fn prune_blocked_queue(
        &self,
        locked: &mut FlushControlState,
        flushing_queue: &Arc<DocumentsWriterDeleteQueue>,
    ) {
        let blocked = mem::replace(&mut locked.blocked_flushes, VecDeque::new());
        for blocked_flush in blocked {
            if Arc::ptr_eq(&blocked_flush.dwpt.delete_queue, flushing_queue) {
                locked.flushing_writers.insert(
                    blocked_flush.dwpt.segment_name().to_string(),
                    blocked_flush.bytes,
                );
                locked.flush_queue.push_back(blocked_flush.dwpt);
            } else {
                locked.blocked_flushes.push_back(blocked_flush);
            }
        }
    }

    /// Set by the documents writer to signal that no new builder is handed
    /// out after close.
    pub fn set_closed(&self) -> Result<()> {
        let mut locked = self.lock.lock()?;
        locked.closed = true;
        self.update_stall_state(&mut locked);
        Ok(())
    }

    pub fn is_full_flush(&self) -> bool {
        self.full_flush.load(Ordering::Acquire)
    }

    /// Starts a full flush: swaps in a new delete queue and checks out every
    /// builder of the old one. Returns the sequence number of the flush and
    /// the queue being flushed.
    pub fn mark_for_full_flush(&self) -> Result<(u64, Arc<DocumentsWriterDeleteQueue>)> {
        let flushing_queue = self.delete_queue();
        let seq_no;
        {
            let mut locked = self.lock.lock()?;
            debug_assert!(!self.is_full_flush(), "called mark_for_full_flush twice");
            self.full_flush.store(true, Ordering::Release);
            // Insert a gap in seq_no of current active thread count, in the worst
            // case each of those threads now have one operation in flight. It's fine
            // if we have some sequence numbers that were never assigned:
            seq_no = flushing_queue.last_sequence_number()
                + self.per_thread_pool.active_thread_state_count() as u64
                + 2;
            flushing_queue
                .max_seq_no
                .store(seq_no + 1, Ordering::Release);
            // Set a new delete queue - all subsequent DWPT will use this queue until
            // we do another full flush
            let new_queue = Arc::new(DocumentsWriterDeleteQueue::with_generation(
                flushing_queue.generation + 1,
                seq_no + 1,
            ));
            self.delete_queue.store(new_queue);
            self.update_stall_state(&mut locked);
        }

        for next in self.per_thread_pool.thread_states()? {
            let mut inner = next.lock()?;
            let stale = match inner.dwpt.as_ref() {
                Some(dwpt) => Arc::ptr_eq(&dwpt.delete_queue, &flushing_queue),
                None => false,
            };
            if stale {
                self.add_flushable_state(&next, &mut inner)?;
            }
        }

        let mut locked = self.lock.lock()?;
        // make sure we move all DWPT that are where concurrently marked as
        // pending and moved to blocked are moved over to the flush queue. There is
        // a chance that this happens since we marking DWPT for full flush without
        // blocking indexing.
        self.prune_blocked_queue(&mut locked, &flushing_queue);
        let buffered = mem::replace(&mut locked.full_flush_buffer, vec![]);
        locked.flush_queue.extend(buffered);
        self.update_stall_state(&mut locked);
        debug!(
            "DWFC: full flush of {} marked, {} builders queued",
            flushing_queue,
            locked.flush_queue.len()
        );
        Ok((seq_no, flushing_queue))
    }

    /// Checks out the builder of a locked state that belongs to the delete
    /// queue of the running full flush.
    pub fn add_flushable_state(
        &self,
        state: &ThreadState,
        inner: &mut ThreadStateInner,
    ) -> Result<()> {
        debug_assert!(inner.inited());
        debug_assert!(self.is_full_flush());
        let num_docs = inner.dwpt.as_ref().map(|d| d.num_docs_in_ram).unwrap_or(0);
        let mut locked = self.lock.lock()?;
        if num_docs > 0 {
            state.set_num_docs_in_ram(num_docs);
            if !state.flush_pending() {
                self.set_flush_pending(&mut locked, state);
            }
            if let Some(dwpt) = self.internal_try_checkout_for_flush(&mut locked, state, inner) {
                locked.full_flush_buffer.push(dwpt);
            }
        } else {
            // make this state inactive
            self.per_thread_pool.reset(state, inner, false);
        }
        self.update_stall_state(&mut locked);
        Ok(())
    }

    /// Ends a successful full flush, releasing the builders blocked meanwhile.
    pub fn finish_full_flush(&self) -> Result<()> {
        let mut locked = self.lock.lock()?;
        debug_assert!(self.is_full_flush());
        debug_assert!(locked.flush_queue.is_empty());
        if !locked.blocked_flushes.is_empty() {
            let current = self.delete_queue();
            self.prune_blocked_queue(&mut locked, &current);
            debug_assert!(locked.blocked_flushes.is_empty());
        }
        self.full_flush.store(false, Ordering::Release);
        self.update_stall_state(&mut locked);
        Ok(())
    }

    /// Aborts every queued or blocked builder and ends the full flush.
    /// Returns the aborted builders so their documents can be accounted for.
    pub fn abort_full_flushes(&self) -> Result<Vec<DocumentsWriterPerThread>> {
        let res = self.abort_pending_flushes();
        self.full_flush.store(false, Ordering::Release);
        res
    }

    pub fn abort_pending_flushes(&self) -> Result<Vec<DocumentsWriterPerThread>> {
        let mut locked = self.lock.lock()?;
        let mut aborted = vec![];
        let flush_queue = mem::replace(&mut locked.flush_queue, VecDeque::new());
        for mut dwpt in flush_queue {
            dwpt.abort();
            self.do_after_flush_locked(&mut locked, &dwpt);
            aborted.push(dwpt);
        }
        let blocked = mem::replace(&mut locked.blocked_flushes, VecDeque::new());
        for BlockedFlush { mut dwpt, bytes } in blocked {
            locked
                .flushing_writers
                .insert(dwpt.segment_name().to_string(), bytes);
            dwpt.abort();
            self.do_after_flush_locked(&mut locked, &dwpt);
            aborted.push(dwpt);
        }
        let buffered = mem::replace(&mut locked.full_flush_buffer, vec![]);
        for mut dwpt in buffered {
            dwpt.abort();
            self.do_after_flush_locked(&mut locked, &dwpt);
            aborted.push(dwpt);
        }
        self.update_stall_state(&mut locked);
        Ok(aborted)
    }

    pub fn any_stalled_threads(&self) -> bool {
        self.stall_control.any_stalled_threads()
    }

    /// Blocks the calling thread while indexing is stalled.
    pub fn wait_if_stalled(&self) -> Result<()> {
        self.stall_control.wait_if_stalled()
    }

    pub fn stall_control(&self) -> &DocumentsWriterStallControl {
        &self.stall_control
    }

    pub fn per_thread_pool(&self) -> &Arc<DocumentsWriterPerThreadPool> {
        &self.per_thread_pool
    }
}

/// Controls the health status of a `DocumentsWriter` session. Incoming
/// indexing threads are blocked while flushing is significantly slower than
/// indexing, so the net memory used within an `IndexWriter` session can not
/// grow without bound.
///
/// Threads block once active plus flushing bytes exceed the RAM buffer
/// while the active bytes alone are below it, that is when only finishing
/// flushes can bring memory back under the budget. They are released as soon
/// as that no longer holds.
#[derive(Default)]
pub struct DocumentsWriterStallControl {
    stalled: AtomicBool,
    lock: Mutex<StallState>,
    cond: Condvar,
}

#[derive(Default)]
struct StallState {
    num_waiting: usize,
    was_stalled: bool,
}

impl DocumentsWriterStallControl {
    /// Updates the stalled flag and wakes every waiting thread, which then
    /// re-checks the flag.
    pub fn update_stalled(&self, stalled: bool) {
        if let Ok(mut state) = self.lock.lock() {
            if self.stalled.load(Ordering::Acquire) != stalled {
                self.stalled.store(stalled, Ordering::Release);
                if stalled {
                    debug!("DWFC: now stalled, indexing threads will block");
                    state.was_stalled = true;
                } else {
                    debug!("DWFC: no longer stalled");
                }
            }
            self.cond.notify_all();
        }
    }

    /// Blocks if documents writing is currently in a stalled state, until the
    /// next state change or at most a second.
    pub fn wait_if_stalled(&self) -> Result<()> {
        if self.stalled.load(Ordering::Acquire) {
            let mut state = self.lock.lock()?;
            // react on the first wakeup call!
            if self.stalled.load(Ordering::Acquire) {
                // don't loop here, the caller helps flushing and re-checks
                state.num_waiting += 1;
                let (mut guard, _) = self.cond.wait_timeout(state, Duration::from_secs(1))?;
                guard.num_waiting -= 1;
            }
        }
        Ok(())
    }

    pub fn any_stalled_threads(&self) -> bool {
        self.stalled.load(Ordering::Acquire)
    }

    pub fn has_blocked(&self) -> bool {
        self.lock.lock().map(|s| s.num_waiting > 0).unwrap_or(false)
    }

    pub fn was_stalled(&self) -> bool {
        self.lock.lock().map(|s| s.was_stalled).unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::doc::{Document, Field, FieldType, Term};
    use crate::core::store::{Directory, RAMDirectory};

    use std::sync::atomic::AtomicI64;
    use std::thread;

    fn control(config: IndexWriterConfig, max_states: usize) -> Arc<DocumentsWriterFlushControl> {
        let config = Arc::new(config);
        Arc::new(DocumentsWriterFlushControl::new(
            Arc::clone(&config),
            Arc::new(DocumentsWriterPerThreadPool::new(max_states)),
            Arc::new(BufferedUpdatesStream::default()),
            Arc::new(DocumentsWriterDeleteQueue::default()),
        ))
    }

    fn add(
        control: &DocumentsWriterFlushControl,
        dir: &Arc<dyn Directory>,
        state: &ThreadState,
        doc: &Document,
    ) -> Result<Option<DocumentsWriterPerThread>> {
        let mut inner = state.lock()?;
        if inner.dwpt.is_none() {
            inner.dwpt = Some(DocumentsWriterPerThread::new(
                format!("_{}", state.index),
                Arc::clone(dir),
                Arc::clone(dir),
                Arc::new(IndexWriterConfig::default()),
                control.delete_queue(),
                Arc::new(AtomicI64::new(0)),
            ));
        }
        if let Some(dwpt) = inner.dwpt.as_mut() {
            dwpt.update_document(doc, None)?;
        }
        control.do_after_document(state, &mut inner, false)
    }

    fn blob(len: usize) -> Document {
        Document::with_fields(vec![Field::new(
            "blob",
            &"x".repeat(len),
            FieldType::STORED_ONLY,
        )])
    }

    #[test]
    fn test_stall_until_flush_completes() -> Result<()> {
        let control = control(IndexWriterConfig::default().set_ram_buffer_size_mb(Some(1.0)), 2);
        let dir: Arc<dyn Directory> = Arc::new(RAMDirectory::new());
        let state = control.per_thread_pool().get_and_lock()?;

        assert!(add(&control, &dir, &state, &blob(400_000))?.is_none());
        assert!(add(&control, &dir, &state, &blob(400_000))?.is_none());
        assert!(!control.any_stalled_threads());
        // crossing the budget checks the builder out for flushing, which
        // leaves the flushing bytes above the budget while nothing is active
        let flushing = add(&control, &dir, &state, &blob(400_000))?.unwrap();
        assert_eq!(control.active_bytes(), 0);
        assert!(control.flush_bytes() > 1024 * 1024);
        assert!(control.any_stalled_threads());

        let waiter_control = Arc::clone(&control);
        let waiter = thread::spawn(move || waiter_control.wait_if_stalled());
        while !control.stall_control().has_blocked() {
            thread::yield_now();
        }

        control.do_after_flush(flushing)?;
        waiter.join().unwrap()?;
        assert!(!control.any_stalled_threads());
        assert!(control.stall_control().was_stalled());
        control.per_thread_pool().release(&state)?;
        Ok(())
    }

    #[test]
    fn test_hard_limit_forces_flush() -> Result<()> {
        let config = IndexWriterConfig::default()
            .set_ram_buffer_size_mb(None)
            .set_max_buffered_docs(Some(1000));
        let mut control = control(config, 1);
        Arc::get_mut(&mut control).unwrap().hard_max_bytes_per_dwpt = 100_000;
        let dir: Arc<dyn Directory> = Arc::new(RAMDirectory::new());
        let state = control.per_thread_pool().get_and_lock()?;
        assert!(add(&control, &dir, &state, &blob(60_000))?.is_none());
        let dwpt = add(&control, &dir, &state, &blob(60_000))?.unwrap();
        assert_eq!(dwpt.num_docs_in_ram, 2);
        // no RAM budget, nothing stalls
        assert!(!control.any_stalled_threads());
        control.do_after_flush(dwpt)?;
        Ok(())
    }

    #[test]
    fn test_full_flush_checks_out_every_builder() -> Result<()> {
        let control = control(IndexWriterConfig::default(), 2);
        let dir: Arc<dyn Directory> = Arc::new(RAMDirectory::new());
        let first = control.per_thread_pool().get_and_lock()?;
        let pool = Arc::clone(control.per_thread_pool());
        let second = thread::spawn(move || pool.get_and_lock()).join().unwrap()?;

        let doc = Document::with_fields(vec![Field::string("id", "1")]);
        add(&control, &dir, &first, &doc)?;
        add(&control, &dir, &second, &doc)?;
        control.delete_queue().add_delete_terms(vec![Term::from_text("id", "0")]);
        let old_queue = control.delete_queue();

        let (seq_no, flushing_queue) = control.mark_for_full_flush()?;
        assert!(Arc::ptr_eq(&old_queue, &flushing_queue));
        assert_eq!(control.delete_queue().generation, old_queue.generation + 1);
        assert!(control.delete_queue().last_sequence_number() >= seq_no);
        assert_eq!(control.num_queued_flushes(), 2);
        assert_eq!(control.num_flushing(), 2);

        // a builder of the new queue that becomes pending waits for the full flush
        let mut flushed = vec![];
        while let Some(dwpt) = control.next_pending_flush()? {
            assert!(Arc::ptr_eq(&dwpt.delete_queue, &flushing_queue));
            flushed.push(dwpt);
        }
        assert_eq!(flushed.len(), 2);
        for dwpt in flushed {
            control.do_after_flush(dwpt)?;
        }
        control.wait_for_flush()?;
        control.finish_full_flush()?;
        assert!(!control.is_full_flush());

        control.per_thread_pool().release(&first)?;
        control.per_thread_pool().release(&second)?;
        Ok(())
    }

    #[test]
    fn test_blocked_flush_released_after_full_flush() -> Result<()> {
        let config = IndexWriterConfig::default()
            .set_ram_buffer_size_mb(None)
            .set_max_buffered_docs(Some(2));
        let control = control(config, 1);
        let dir: Arc<dyn Directory> = Arc::new(RAMDirectory::new());
        let state = control.per_thread_pool().get_and_lock()?;
        let doc = Document::with_fields(vec![Field::string("id", "1")]);

        // nothing buffered, the full flush has nothing to check out
        let (_, _) = control.mark_for_full_flush()?;
        assert_eq!(control.num_queued_flushes(), 0);

        assert!(add(&control, &dir, &state, &doc)?.is_none());
        // pending during a full flush: blocked instead of returned
        assert!(add(&control, &dir, &state, &doc)?.is_none());
        assert_eq!(control.num_blocked_flushes(), 1);
        assert!(control.next_pending_flush()?.is_none());

        control.finish_full_flush()?;
        assert_eq!(control.num_blocked_flushes(), 0);
        let dwpt = control.next_pending_flush()?.unwrap();
        assert_eq!(dwpt.num_docs_in_ram, 2);
        control.do_after_flush(dwpt)?;
        assert_eq!(control.num_flushing(), 0);
        control.per_thread_pool().release(&state)?;
        Ok(())
    }
}
