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

use crate::core::codec::segment_infos::SegmentInfo;
use crate::core::doc::{Document, Term};
use crate::core::index::writer::{
    new_segment_name, BufferedUpdatesStream, DocumentsWriterDeleteQueue,
    DocumentsWriterFlushControl, DocumentsWriterFlushQueue, DocumentsWriterPerThread,
    DocumentsWriterPerThreadPool, FlushTicketPublisher, IndexWriterConfig, ThreadState,
    ThreadStateInner,
};
use crate::core::search::Query;
use crate::core::store::Directory;
use crate::error::{ErrorKind::AlreadyClosed, Result};

use crossbeam::queue::SegQueue;

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

/// Work the documents writer leaves for the index writer. Events are
/// queued by whichever thread produced them and processed by the index
/// writer once it no longer holds any of the documents writer's locks.
#[derive(Debug)]
pub enum WriterEvent {
    /// Buffered deletes must be resolved against the segments now.
    ApplyDeletes,
    /// A segment was flushed, publish the flush tickets and look for merges.
    MergePending,
    /// The flush queue grew past the number of indexing threads and must be
    /// purged before indexing continues.
    ForcedPurge,
    /// Flushing the given segment failed.
    FlushFailed(Arc<SegmentInfo>),
    /// Files written by a flush that no segment references anymore.
    DeleteNewFiles(HashSet<String>),
}

/// Accepts documents and deletes from many threads, routes each thread to
/// a `DocumentsWriterPerThread` and flushes those builders into segments.
///
/// Each added document is buffered by exactly one per-thread builder. A
/// builder, once selected for flushing, is detached from its thread state
/// and flushed by the thread that picked it, while the state receives a
/// fresh builder on its next use. Flushed segments are not handed to the
/// index writer directly: a ticket is taken when a flush starts and tickets
/// are published strictly in that order through `FlushTicketPublisher`.
///
/// Deletes are appended to the shared `DocumentsWriterDeleteQueue`. Every
/// builder keeps a slice of it and resolves the deletes that apply to its
/// own documents when it flushes, everything else is frozen into global
/// packets and resolved against the flushed segments by the index writer.
pub struct DocumentsWriter {
    lock: Mutex<()>,
    directory_orig: Arc<dyn Directory>,
    directory: Arc<dyn Directory>,
    config: Arc<IndexWriterConfig>,
    closed: AtomicBool,
    num_docs_in_ram: AtomicU32,
    ticket_queue: DocumentsWriterFlushQueue,
    // we preserve changes during a full flush since IW might not checkout
    // before we release all changes. NRT readers otherwise suddenly return
    // true from is_current while there are actually changes currently
    // committed. See also any_changes() & flush_all_threads
    pending_changes_in_current_full_flush: AtomicBool,
    per_thread_pool: Arc<DocumentsWriterPerThreadPool>,
    flush_control: DocumentsWriterFlushControl,
    pending_num_docs: Arc<AtomicI64>,
    segment_counter: Arc<AtomicU64>,
    events: SegQueue<WriterEvent>,
    last_seq_no: AtomicU64,
}

impl DocumentsWriter {
    pub fn new(
        config: Arc<IndexWriterConfig>,
        directory_orig: Arc<dyn Directory>,
        directory: Arc<dyn Directory>,
        updates_stream: Arc<BufferedUpdatesStream>,
        pending_num_docs: Arc<AtomicI64>,
        segment_counter: Arc<AtomicU64>,
    ) -> Self {
        let per_thread_pool = Arc::new(DocumentsWriterPerThreadPool::new(
            config.max_thread_states,
        ));
        let flush_control = DocumentsWriterFlushControl::new(
            Arc::clone(&config),
            Arc::clone(&per_thread_pool),
            updates_stream,
            Arc::new(DocumentsWriterDeleteQueue::default()),
        );
        DocumentsWriter {
            lock: Mutex::new(()),
            directory_orig,
            directory,
            config,
            closed: AtomicBool::new(false),
            num_docs_in_ram: AtomicU32::new(0),
            ticket_queue: DocumentsWriterFlushQueue::default(),
            pending_changes_in_current_full_flush: AtomicBool::new(false),
            per_thread_pool,
            flush_control,
            pending_num_docs,
            segment_counter,
            events: SegQueue::new(),
            last_seq_no: AtomicU64::new(0),
        }
    }

    pub fn flush_control(&self) -> &DocumentsWriterFlushControl {
        &self.flush_control
    }

    pub fn delete_queue(&self) -> Arc<DocumentsWriterDeleteQueue> {
        self.flush_control.delete_queue()
    }

    /// Returns how many docs are currently buffered in RAM.
    pub fn num_docs(&self) -> u32 {
        self.num_docs_in_ram.load(Ordering::Acquire)
    }

    pub fn last_seq_no(&self) -> u64 {
        self.last_seq_no.load(Ordering::Acquire)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            bail!(AlreadyClosed("this DocumentsWriter is closed".into()));
        }
        Ok(())
    }

    fn put_event(&self, event: WriterEvent) {
        self.events.push(event);
    }

    /// Takes the oldest unprocessed event.
    pub fn next_event(&self) -> Option<WriterEvent> {
        self.events.pop()
    }

    pub fn has_events(&self) -> bool {
        !self.events.is_empty()
    }

    /// Adds `doc` to the builder of the calling thread, atomically deleting
    /// every earlier document containing `del_term`. Returns the sequence
    /// number of the operation and whether events were queued.
    pub fn update_document(&self, doc: &Document, del_term: Option<Term>) -> Result<(u64, bool)> {
        self.update(del_term.is_some(), |dwpt| {
            dwpt.update_document(doc, del_term)
        })
    }

    /// Adds `docs` as one block of consecutive doc ids. Either all of them
    /// become visible or none.
    pub fn update_documents(
        &self,
        docs: &[Document],
        del_term: Option<Term>,
    ) -> Result<(u64, bool)> {
        self.update(del_term.is_some(), |dwpt| {
            dwpt.update_documents(docs, del_term)
        })
    }

    fn update<F>(&self, is_update: bool, op: F) -> Result<(u64, bool)>
    where
        F: FnOnce(&mut DocumentsWriterPerThread) -> Result<u64>,
    {
        let has_events = self.pre_update()?;
        let state = self.obtain_and_lock()?;
        let res = self.do_update(&state, is_update, op);
        self.per_thread_pool.release(&state)?;
        let (seq_no, flushing) = res?;
        let has_events = self.post_update(flushing, has_events)?;
        Ok((seq_no, has_events))
    }

    fn obtain_and_lock(&self) -> Result<Arc<ThreadState>> {
        self.ensure_open()?;
        self.per_thread_pool.get_and_lock()
    }

    fn do_update<F>(
        &self,
        state: &ThreadState,
        is_update: bool,
        op: F,
    ) -> Result<(u64, Option<DocumentsWriterPerThread>)>
    where
        F: FnOnce(&mut DocumentsWriterPerThread) -> Result<u64>,
    {
        let mut inner = state.lock()?;
        // This must happen after we've pulled the state because close and
        // rollback take every state lock before they proceed
        self.ensure_open()?;
        let stale = match inner.dwpt.as_ref() {
            Some(dwpt) => !Arc::ptr_eq(&dwpt.delete_queue, &self.flush_control.delete_queue()),
            None => false,
        };
        if stale {
            // a full flush swapped the queue while this state was idle and has
            // not reached it yet
            self.flush_control.add_flushable_state(state, &mut inner)?;
        }
        self.ensure_initialized(state, &mut inner)?;

        let (res, aborted) = match inner.dwpt.as_mut() {
            Some(dwpt) => {
                let before = dwpt.num_docs_in_ram;
                let res = op(dwpt);
                self.num_docs_in_ram
                    .fetch_add(dwpt.num_docs_in_ram - before, Ordering::AcqRel);
                (res, dwpt.is_aborted())
            }
            None => bail!(AlreadyClosed("no documents writer per thread".into())),
        };
        if aborted {
            // the builder is gone, its buffered documents with it
            if let Some(dwpt) = self.flush_control.do_on_abort(state, &mut inner)? {
                warn!(
                    "DW: aborting error on segment {} dropped {} buffered docs",
                    dwpt.segment_name(),
                    dwpt.num_docs_in_ram
                );
                self.discard(&dwpt);
            }
        }
        let seq_no = res?;
        let flushing = self
            .flush_control
            .do_after_document(state, &mut inner, is_update)?;
        state.set_last_seq_no(seq_no);
        self.last_seq_no.fetch_max(seq_no, Ordering::AcqRel);
        Ok((seq_no, flushing))
    }

    fn ensure_initialized(&self, state: &ThreadState, inner: &mut ThreadStateInner) -> Result<()> {
        if inner.dwpt.is_none() {
            if !state.is_active() {
                bail!(AlreadyClosed("this IndexWriter is closed".into()));
            }
            let segment_name = new_segment_name(&self.segment_counter);
            inner.dwpt = Some(DocumentsWriterPerThread::new(
                segment_name,
                Arc::clone(&self.directory_orig),
                Arc::clone(&self.directory),
                Arc::clone(&self.config),
                self.flush_control.delete_queue(),
                Arc::clone(&self.pending_num_docs),
            ));
        }
        Ok(())
    }

    // Forgets the documents of an aborted builder and schedules its files
    // for deletion.
    fn discard(&self, dwpt: &DocumentsWriterPerThread) {
        self.subtract_flushed_num_docs(dwpt.num_docs_in_ram);
        self.pending_num_docs
            .fetch_sub(i64::from(dwpt.num_docs_in_ram), Ordering::AcqRel);
        let mut files = dwpt.files_to_delete.clone();
        if let Ok(pending) = dwpt.pending_files() {
            files.extend(pending);
        }
        if !files.is_empty() {
            self.put_event(WriterEvent::DeleteNewFiles(files));
        }
    }

    fn subtract_flushed_num_docs(&self, num_flushed: u32) {
        let mut old_value = self.num_docs_in_ram.load(Ordering::Acquire);
        loop {
            let new_value = old_value.saturating_sub(num_flushed);
            match self.num_docs_in_ram.compare_exchange_weak(
                old_value,
                new_value,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(v) => old_value = v,
            }
        }
    }

    fn pre_update(&self) -> Result<bool> {
        self.ensure_open()?;
        let mut has_events = false;
        if self.flush_control.any_stalled_threads() || self.flush_control.num_queued_flushes() > 0 {
            // Help out flushing any queued DWPTs so we can un-stall:
            loop {
                // Try pick up pending threads here if possible
                while let Some(dwpt) = self.flush_control.next_pending_flush()? {
                    // Don't push the delete here since the update could fail!
                    has_events |= self.do_flush(dwpt)?;
                }
                self.flush_control.wait_if_stalled()?;
                if self.flush_control.num_queued_flushes() == 0 {
                    break;
                }
            }
        }
        Ok(has_events)
    }

    fn post_update(
        &self,
        flushing: Option<DocumentsWriterPerThread>,
        mut has_events: bool,
    ) -> Result<bool> {
        has_events |= self.apply_all_deletes(&self.flush_control.delete_queue())?;
        if let Some(dwpt) = flushing {
            has_events |= self.do_flush(dwpt)?;
        } else if let Some(next) = self.flush_control.next_pending_flush()? {
            has_events |= self.do_flush(next)?;
        }
        Ok(has_events)
    }

    /// Buffers a delete of every document containing any of `terms`.
    pub fn delete_terms(&self, terms: Vec<Term>) -> Result<(u64, bool)> {
        // The append must happen under the lock a full flush takes to swap
        // queues, otherwise it could land on a queue that was already frozen.
        let (delete_queue, seq_no) = {
            let _l = self.lock.lock()?;
            self.ensure_open()?;
            let delete_queue = self.flush_control.delete_queue();
            let seq_no = delete_queue.add_delete_terms(terms);
            (delete_queue, seq_no)
        };
        self.flush_control.do_on_delete()?;
        self.last_seq_no.fetch_max(seq_no, Ordering::AcqRel);
        let has_events = self.apply_all_deletes(&delete_queue)?;
        Ok((seq_no, has_events))
    }

    /// Buffers a delete of every document matching any of `queries`.
    pub fn delete_queries(&self, queries: Vec<Arc<dyn Query>>) -> Result<(u64, bool)> {
        // The append must happen under the lock a full flush takes to swap
        // queues, otherwise it could land on a queue that was already frozen.
        let (delete_queue, seq_no) = {
            let _l = self.lock.lock()?;
            self.ensure_open()?;
            let delete_queue = self.flush_control.delete_queue();
            let seq_no = delete_queue.add_delete_queries(queries);
            (delete_queue, seq_no)
        };
        self.flush_control.do_on_delete()?;
        self.last_seq_no.fetch_max(seq_no, Ordering::AcqRel);
        let has_events = self.apply_all_deletes(&delete_queue)?;
        Ok((seq_no, has_events))
    }

    fn apply_all_deletes(&self, delete_queue: &DocumentsWriterDeleteQueue) -> Result<bool> {
        if self.flush_control.get_and_reset_apply_all_deletes() {
            if !self.flush_control.is_full_flush() {
                self.ticket_queue.add_deletes(delete_queue)?;
            }
            // apply deletes event forces a purge
            self.put_event(WriterEvent::ApplyDeletes);
            return Ok(true);
        }
        Ok(false)
    }

    fn do_flush(&self, mut flushing_dwpt: DocumentsWriterPerThread) -> Result<bool> {
        loop {
            // Since with DWPT the flush process is concurrent and several
            // DWPT could flush at the same time we must maintain the order
            // of the flushes before we can apply the flushed segment and the
            // frozen global deletes it is buffering. The reason for this is
            // that the global deletes mark a certain point in time where we
            // took a DWPT out of rotation and freeze the global deletes.
            //
            // Example: A flush 'A' starts and freezes the global deletes, then
            // flush 'B' starts and freezes all deletes occurred since 'A' has
            // started. if 'B' finishes before 'A' we need to wait until 'A'
            // is done otherwise the deletes frozen by 'B' are not applied to
            // 'A' and we might miss to deletes documents in 'A'.
            let res = self.flush_dwpt(&mut flushing_dwpt);
            let backlog = res.is_ok()
                && self.ticket_queue.ticket_count() as usize
                    >= self.per_thread_pool.active_thread_state_count();
            self.flush_control.do_after_flush(flushing_dwpt)?;
            res?;
            if backlog {
                // This means there is a backlog: the one thread in
                // innerPurge can't keep up with all other threads flushing
                // segments. In this case we forcefully stall the producers.
                self.put_event(WriterEvent::ForcedPurge);
                break;
            }
            match self.flush_control.next_pending_flush()? {
                Some(next) => flushing_dwpt = next,
                None => break,
            }
        }
        // at least one segment was flushed above
        self.put_event(WriterEvent::MergePending);

        // If deletes alone are consuming > 1/2 our RAM buffer, force them all
        // to apply now. This is to prevent too-frequent flushing of a long
        // tail of tiny segments:
        if let Some(ram_buffer_bytes) = self.config.ram_buffer_size_bytes() {
            if self.flush_control.delete_bytes_used() > ram_buffer_bytes / 2 {
                if !self.apply_all_deletes(&self.flush_control.delete_queue())? {
                    debug!(
                        "DW: force apply deletes bytes_used={} vs ram_buffer={}",
                        self.flush_control.delete_bytes_used(),
                        ram_buffer_bytes
                    );
                    self.put_event(WriterEvent::ApplyDeletes);
                }
            }
        }
        Ok(true)
    }

    fn flush_dwpt(&self, dwpt: &mut DocumentsWriterPerThread) -> Result<()> {
        let ticket = self.ticket_queue.add_flush_ticket(dwpt)?;
        let flushing_docs = dwpt.num_docs_in_ram;
        let res = match dwpt.flush() {
            Ok(segment) => self.ticket_queue.add_segment(&ticket, segment),
            Err(e) => Err(e),
        };
        self.subtract_flushed_num_docs(flushing_docs);
        if !dwpt.files_to_delete.is_empty() {
            let files = ::std::mem::replace(&mut dwpt.files_to_delete, HashSet::new());
            self.put_event(WriterEvent::DeleteNewFiles(files));
        }
        if let Err(e) = res {
            warn!("DW: flush of segment {} failed: {}", dwpt.segment_name(), e);
            self.pending_num_docs
                .fetch_sub(i64::from(flushing_docs), Ordering::AcqRel);
            // make sure we are making progress: the ticket may hold global
            // deletes that still have to be published
            self.ticket_queue.mark_ticket_failed(&ticket)?;
            if let Ok(files) = dwpt.pending_files() {
                if !files.is_empty() {
                    self.put_event(WriterEvent::DeleteNewFiles(files));
                }
            }
            self.put_event(WriterEvent::FlushFailed(Arc::clone(&dwpt.segment_info)));
            return Err(e);
        }
        Ok(())
    }

    /// Publishes every ticket that is ready. With `forced` the calling
    /// thread waits for a concurrent purge to finish first.
    pub fn purge_buffer(&self, publisher: &dyn FlushTicketPublisher, forced: bool) -> Result<u32> {
        // Purge the flush queue under the publisher's own synchronization;
        // the ticket queue itself makes sure only one thread publishes at a
        // time and in order.
        if forced {
            self.ticket_queue.force_purge(publisher)
        } else {
            self.ticket_queue.try_purge(publisher)
        }
    }

    /// Flushes every builder that belongs to the current delete queue and
    /// publishes the result. Returns whether anything was flushed and the
    /// sequence number marking the end of the flushed operations.
    ///
    /// Must be followed by `finish_full_flush`, whatever the outcome.
    pub fn flush_all_threads(&self, publisher: &dyn FlushTicketPublisher) -> Result<(bool, u64)> {
        debug!("DW: start full flush");
        let (seq_no, flushing_delete_queue) = {
            let _l = self.lock.lock()?;
            self.pending_changes_in_current_full_flush
                .store(self.any_changes(), Ordering::Release);
            self.flush_control.mark_for_full_flush()?
        };
        let mut anything_flushed = false;
        // Help out with flushing:
        while let Some(flushing_dwpt) = self.flush_control.next_pending_flush()? {
            anything_flushed |= self.do_flush(flushing_dwpt)?;
        }
        // If a concurrent flush is still in flight wait for it
        self.flush_control.wait_for_flush()?;
        if !anything_flushed && flushing_delete_queue.any_changes() {
            // apply deletes if we did not flush any document
            debug!(
                "DW: {} apply all deletes during full flush",
                flushing_delete_queue
            );
            self.ticket_queue.add_deletes(&flushing_delete_queue)?;
        }
        self.ticket_queue.force_purge(publisher)?;
        debug_assert!(!flushing_delete_queue.any_changes() && !self.ticket_queue.has_tickets());
        Ok((anything_flushed, seq_no))
    }

    pub fn finish_full_flush(&self, success: bool) -> Result<()> {
        debug!("DW: finish full flush success={}", success);
        let res = if success {
            // Release the flush lock
            self.flush_control.finish_full_flush()
        } else {
            self.flush_control.abort_full_flushes().map(|aborted| {
                for dwpt in &aborted {
                    self.discard(dwpt);
                }
            })
        };
        self.pending_changes_in_current_full_flush
            .store(false, Ordering::Release);
        res
    }

    /// Returns true if any documents or deletes are buffered, or flushed
    /// segments still wait to be published.
    pub fn any_changes(&self) -> bool {
        // changes are either in a DWPT or in the deleteQueue.
        // yet if we currently flush deletes and / or dwpt there
        // could be a window where all changes are in the ticket queue
        // before they are published to the IW. ie we need to check if the
        // ticket queue has any tickets.
        let any_changes = self.num_docs() != 0
            || self.delete_queue().any_changes()
            || self.ticket_queue.has_tickets()
            || self
                .pending_changes_in_current_full_flush
                .load(Ordering::Acquire);
        if any_changes {
            trace!(
                "DW: any_changes? num_docs_in_ram={} deletes={} has_tickets={} pending_changes_in_full_flush={}",
                self.num_docs(),
                self.delete_queue().any_changes(),
                self.ticket_queue.has_tickets(),
                self.pending_changes_in_current_full_flush.load(Ordering::Acquire)
            );
        }
        any_changes
    }

    pub fn any_deletions(&self) -> bool {
        self.delete_queue().any_changes()
    }

    /// Locks every thread state, drops all buffered documents and deletes,
    /// then runs `after_abort` while indexing is still locked out. Returns
    /// what `after_abort` returned.
    pub fn lock_and_abort_all<T, F>(&self, after_abort: F) -> Result<T>
    where
        F: FnOnce(u32) -> Result<T>,
    {
        debug!("DW: lock_and_abort_all");
        let _l = self.lock.lock()?;
        self.per_thread_pool.set_abort();
        let res = self.abort_all_locked(after_abort);
        self.per_thread_pool.clear_abort()?;
        debug!("DW: finished lock_and_abort_all success={}", res.is_ok());
        res
    }

    fn abort_all_locked<T, F>(&self, after_abort: F) -> Result<T>
    where
        F: FnOnce(u32) -> Result<T>,
    {
        let delete_queue = self.delete_queue();
        delete_queue.clear()?;
        let states = self.per_thread_pool.thread_states()?;
        let mut guards: Vec<MutexGuard<ThreadStateInner>> = Vec::with_capacity(states.len());
        let mut aborted_doc_count = 0;
        for state in &states {
            let mut inner = state.lock()?;
            aborted_doc_count += self.abort_thread_state(state, &mut inner)?;
            guards.push(inner);
        }
        delete_queue.clear()?;
        // jump over any possible in flight ops:
        delete_queue.skip_sequence_number(states.len() as u64 + 1);
        for dwpt in self.flush_control.abort_pending_flushes()? {
            aborted_doc_count += dwpt.num_docs_in_ram;
            self.discard(&dwpt);
        }
        self.flush_control.wait_for_flush()?;
        debug!("DW: finished abort, {} docs dropped", aborted_doc_count);
        let res = after_abort(aborted_doc_count);
        drop(guards);
        res
    }

    /// Returns the number of documents dropped from the state's builder.
    fn abort_thread_state(&self, state: &ThreadState, inner: &mut ThreadStateInner) -> Result<u32> {
        if !inner.inited() {
            let closed = self.closed.load(Ordering::Acquire);
            self.per_thread_pool.reset(state, inner, closed);
            return Ok(0);
        }
        match self.flush_control.do_on_abort(state, inner)? {
            Some(mut dwpt) => {
                let aborted = dwpt.num_docs_in_ram;
                dwpt.abort();
                self.discard(&dwpt);
                if self.closed.load(Ordering::Acquire) {
                    self.per_thread_pool.reset(state, inner, true);
                }
                Ok(aborted)
            }
            None => Ok(0),
        }
    }

    /// Drops every buffered document and delete. Used when the index writer
    /// rolls back or deletes everything.
    pub fn abort(&self) -> Result<u32> {
        self.lock_and_abort_all(Ok)
    }

    /// No new builders are handed out after this.
    pub fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        self.flush_control.set_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::doc::{Field, FieldType};
    use crate::core::index::writer::{FlushedSegment, FrozenBufferedUpdates};
    use crate::core::store::RAMDirectory;
    use crate::error::ErrorKind;

    use std::thread;

    #[derive(Default)]
    struct RecordingPublisher {
        segments: Mutex<Vec<(String, i32, u32)>>,
        packets: Mutex<Vec<usize>>,
    }

    impl FlushTicketPublisher for RecordingPublisher {
        fn publish_flushed_segment(
            &self,
            segment: FlushedSegment,
            _global_packet: Option<FrozenBufferedUpdates>,
        ) -> Result<()> {
            self.segments.lock()?.push((
                segment.segment_info.name().to_string(),
                segment.segment_info.info.max_doc(),
                segment.del_count,
            ));
            Ok(())
        }

        fn publish_frozen_updates(&self, packet: FrozenBufferedUpdates) -> Result<()> {
            self.packets.lock()?.push(packet.num_term_deletes);
            Ok(())
        }
    }

    fn writer(config: IndexWriterConfig) -> (Arc<AtomicI64>, DocumentsWriter) {
        let dir: Arc<dyn Directory> = Arc::new(RAMDirectory::new());
        let pending = Arc::new(AtomicI64::new(0));
        let dw = DocumentsWriter::new(
            Arc::new(config),
            Arc::clone(&dir),
            dir,
            Arc::new(BufferedUpdatesStream::default()),
            Arc::clone(&pending),
            Arc::new(AtomicU64::new(0)),
        );
        (pending, dw)
    }

    fn doc(id: &str) -> Document {
        Document::with_fields(vec![
            Field::string("id", id),
            Field::new("body", "some text to index", FieldType::TEXT_STORED),
        ])
    }

    fn drain(dw: &DocumentsWriter) -> Vec<WriterEvent> {
        let mut events = vec![];
        while let Some(event) = dw.next_event() {
            events.push(event);
        }
        events
    }

    #[test]
    fn test_full_flush_publishes_buffered_docs() -> Result<()> {
        let (pending, dw) = writer(IndexWriterConfig::default());
        for i in 0..3 {
            let (_, has_events) = dw.update_document(&doc(&i.to_string()), None)?;
            assert!(!has_events);
        }
        assert_eq!(dw.num_docs(), 3);
        assert_eq!(pending.load(Ordering::Acquire), 3);
        assert!(dw.any_changes());

        let publisher = RecordingPublisher::default();
        let (flushed, seq_no) = dw.flush_all_threads(&publisher)?;
        dw.finish_full_flush(true)?;
        assert!(flushed);
        assert!(seq_no > 3);
        assert_eq!(dw.num_docs(), 0);
        assert_eq!(
            *publisher.segments.lock()?,
            vec![("_0".to_string(), 3, 0)]
        );
        assert!(!dw.any_changes());
        assert!(drain(&dw)
            .iter()
            .any(|e| matches!(e, WriterEvent::MergePending)));
        Ok(())
    }

    #[test]
    fn test_doc_count_flush_names_segments_in_order() -> Result<()> {
        let config = IndexWriterConfig::default()
            .set_ram_buffer_size_mb(None)
            .set_max_buffered_docs(Some(2));
        let (_, dw) = writer(config);
        let publisher = RecordingPublisher::default();
        let mut flushed_events = false;
        for i in 0..5 {
            let (_, has_events) = dw.update_document(&doc(&i.to_string()), None)?;
            flushed_events |= has_events;
        }
        assert!(flushed_events);
        dw.purge_buffer(&publisher, true)?;
        let names: Vec<_> = publisher
            .segments
            .lock()?
            .iter()
            .map(|(name, max_doc, _)| (name.clone(), *max_doc))
            .collect();
        assert_eq!(names, vec![("_0".to_string(), 2), ("_1".to_string(), 2)]);
        assert_eq!(dw.num_docs(), 1);
        Ok(())
    }

    #[test]
    fn test_update_deletes_earlier_doc_at_flush() -> Result<()> {
        let (_, dw) = writer(IndexWriterConfig::default());
        dw.update_document(&doc("1"), None)?;
        dw.update_document(&doc("2"), None)?;
        dw.update_document(&doc("1"), Some(Term::from_text("id", "1")))?;
        let publisher = RecordingPublisher::default();
        dw.flush_all_threads(&publisher)?;
        dw.finish_full_flush(true)?;
        assert_eq!(
            *publisher.segments.lock()?,
            vec![("_0".to_string(), 3, 1)]
        );
        Ok(())
    }

    #[test]
    fn test_delete_terms_trigger_apply_deletes() -> Result<()> {
        let config = IndexWriterConfig::default().set_max_buffered_delete_terms(Some(2));
        let (_, dw) = writer(config);
        let (_, has_events) = dw.delete_terms(vec![Term::from_text("id", "1")])?;
        assert!(!has_events);
        let (seq_no, has_events) = dw.delete_terms(vec![Term::from_text("id", "2")])?;
        assert!(has_events);
        assert_eq!(dw.last_seq_no(), seq_no);
        assert!(drain(&dw)
            .iter()
            .any(|e| matches!(e, WriterEvent::ApplyDeletes)));

        let publisher = RecordingPublisher::default();
        dw.purge_buffer(&publisher, true)?;
        assert_eq!(*publisher.packets.lock()?, vec![2]);
        assert!(!dw.any_changes());
        Ok(())
    }

    #[test]
    fn test_deletes_only_full_flush_publishes_packet() -> Result<()> {
        let (_, dw) = writer(IndexWriterConfig::default());
        dw.delete_terms(vec![Term::from_text("id", "7")])?;
        let publisher = RecordingPublisher::default();
        let (flushed, _) = dw.flush_all_threads(&publisher)?;
        dw.finish_full_flush(true)?;
        assert!(!flushed);
        assert!(publisher.segments.lock()?.is_empty());
        assert_eq!(*publisher.packets.lock()?, vec![1]);
        Ok(())
    }

    #[test]
    fn test_abort_drops_buffered_docs() -> Result<()> {
        let (pending, dw) = writer(IndexWriterConfig::default());
        for i in 0..4 {
            dw.update_document(&doc(&i.to_string()), None)?;
        }
        dw.delete_terms(vec![Term::from_text("id", "1")])?;
        let dropped = dw.lock_and_abort_all(|dropped| Ok(dropped))?;
        assert_eq!(dropped, 4);
        assert_eq!(dw.num_docs(), 0);
        assert_eq!(pending.load(Ordering::Acquire), 0);
        assert!(!dw.any_changes());

        // indexing continues after the abort
        dw.update_document(&doc("5"), None)?;
        assert_eq!(dw.num_docs(), 1);
        Ok(())
    }

    #[test]
    fn test_closed_writer_rejects_updates() -> Result<()> {
        let (_, dw) = writer(IndexWriterConfig::default());
        dw.close()?;
        match dw.update_document(&doc("1"), None) {
            Err(e) => assert!(matches!(e.kind(), ErrorKind::AlreadyClosed(_))),
            Ok(_) => panic!("closed writer accepted a document"),
        }
        Ok(())
    }

    #[test]
    fn test_concurrent_updates_are_all_flushed() -> Result<()> {
        let config = IndexWriterConfig::default()
            .set_ram_buffer_size_mb(None)
            .set_max_buffered_docs(Some(7));
        let (pending, dw) = writer(config);
        let dw = Arc::new(dw);
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let dw = Arc::clone(&dw);
                thread::spawn(move || -> Result<()> {
                    for i in 0..25 {
                        dw.update_document(&doc(&format!("{}-{}", t, i)), None)?;
                    }
                    Ok(())
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap()?;
        }
        let publisher = RecordingPublisher::default();
        dw.flush_all_threads(&publisher)?;
        dw.finish_full_flush(true)?;
        let total: i32 = publisher.segments.lock()?.iter().map(|s| s.1).sum();
        assert_eq!(total, 100);
        assert_eq!(pending.load(Ordering::Acquire), 100);
        assert_eq!(dw.num_docs(), 0);
        Ok(())
    }
}
