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

use crate::core::codec::segment_infos::{SegmentCommitInfo, SegmentInfo};
use crate::core::codec::Codec;
use crate::core::doc::{Document, Term};
use crate::core::index::writer::{
    BufferedUpdates, DeleteSlice, DocConsumer, DocumentsWriterDeleteQueue,
    FrozenBufferedUpdates, IndexWriterConfig, INDEX_MAX_DOCS,
};
use crate::core::store::{Directory, FlushInfo, IOContext, TrackingDirectoryWrapper};
use crate::core::util::{random_id, Bits, DocId, FixedBitSet};
use crate::error::{
    ErrorKind::{IllegalArgument, IllegalState},
    Result,
};

use thread_local::ThreadLocal;

use std::cell::Cell;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, RwLock, TryLockError};
use std::time::Instant;

pub const SOURCE_FLUSH: &str = "flush";

/// Builds one in-memory segment from the documents of the thread that
/// currently holds it, and flushes it to the directory.
pub struct DocumentsWriterPerThread {
    // tracks every file written for the segment under construction
    pub directory: Arc<TrackingDirectoryWrapper>,
    pub directory_orig: Arc<dyn Directory>,
    consumer: DocConsumer,
    pending_updates: BufferedUpdates,
    pub segment_info: Arc<SegmentInfo>,
    // true if we aborted
    aborted: bool,
    pub num_docs_in_ram: u32,
    // the queue this DWPT was created against, a full flush swaps in a new one
    pub delete_queue: Arc<DocumentsWriterDeleteQueue>,
    delete_slice: DeleteSlice,
    pending_num_docs: Arc<AtomicI64>,
    pub config: Arc<IndexWriterConfig>,
    pub files_to_delete: HashSet<String>,
}

impl DocumentsWriterPerThread {
    pub fn new(
        segment_name: String,
        directory_orig: Arc<dyn Directory>,
        directory: Arc<dyn Directory>,
        config: Arc<IndexWriterConfig>,
        delete_queue: Arc<DocumentsWriterDeleteQueue>,
        pending_num_docs: Arc<AtomicI64>,
    ) -> Self {
        let directory = Arc::new(TrackingDirectoryWrapper::new(directory));
        let mut diagnostics = HashMap::new();
        diagnostics.insert("source".to_string(), SOURCE_FLUSH.to_string());
        diagnostics.insert("os".to_string(), ::std::env::consts::OS.to_string());
        diagnostics.insert(
            "sediment.version".to_string(),
            env!("CARGO_PKG_VERSION").to_string(),
        );
        let segment_info = Arc::new(SegmentInfo::new(
            &segment_name,
            -1,
            Arc::clone(&directory_orig),
            false,
            Arc::clone(&config.codec),
            diagnostics,
            random_id(),
        ));
        let delete_slice = delete_queue.new_slice();
        debug!(
            "DWPT: init seg={} delete_queue={}",
            segment_name, delete_queue
        );
        DocumentsWriterPerThread {
            directory,
            directory_orig,
            consumer: DocConsumer::new(Arc::clone(&config.analyzer)),
            pending_updates: BufferedUpdates::new(&segment_name),
            segment_info,
            aborted: false,
            num_docs_in_ram: 0,
            delete_queue,
            delete_slice,
            pending_num_docs,
            config,
            files_to_delete: HashSet::new(),
        }
    }

    pub fn codec(&self) -> &Arc<dyn Codec> {
        &self.config.codec
    }

    pub fn segment_name(&self) -> &str {
        &self.segment_info.name
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted
    }

    /// Bytes held by the buffered documents and the private deletes.
    pub fn bytes_used(&self) -> u64 {
        self.consumer.bytes_used() + self.pending_updates.bytes_used
    }

    pub fn num_delete_terms(&self) -> usize {
        self.pending_updates.num_term_deletes()
    }

    // Anything that will add N docs to the index should reserve first to make sure it's allowed
    fn reserve_one_doc(&self) -> Result<()> {
        if self.pending_num_docs.fetch_add(1, Ordering::AcqRel) + 1 > i64::from(INDEX_MAX_DOCS) {
            // Reserve failed: put the one doc back and throw exc:
            self.pending_num_docs.fetch_sub(1, Ordering::AcqRel);
            bail!(IllegalArgument(format!(
                "number of documents in the index cannot exceed {}",
                INDEX_MAX_DOCS
            )));
        }
        Ok(())
    }

    fn unreserve_one_doc(&self) {
        self.pending_num_docs.fetch_sub(1, Ordering::AcqRel);
    }

    /// Adds one document, applying `del_term` to the documents buffered
    /// before it. Returns the sequence number of the operation.
    pub fn update_document(&mut self, doc: &Document, del_term: Option<Term>) -> Result<u64> {
        debug_assert!(!self.aborted);
        self.reserve_one_doc()?;
        let doc_id = self.num_docs_in_ram as DocId;

        // Even on a non-aborting error, the document is still added (but
        // marked deleted), so we don't need to un-reserve at that point.
        if let Err(e) = self.consumer.process_document(doc_id, doc) {
            if e.is_aborting() {
                self.unreserve_one_doc();
                self.abort();
            } else {
                warn!(
                    "DWPT: seg={} document {} failed and is marked deleted: {}",
                    self.segment_name(),
                    doc_id,
                    e
                );
                self.delete_doc_id(doc_id);
                self.num_docs_in_ram += 1;
            }
            return Err(e);
        }
        Ok(self.finish_document(del_term))
    }

    /// Adds a block of documents that get adjacent doc ids. If any document
    /// fails every document of the block is marked deleted.
    pub fn update_documents(&mut self, docs: &[Document], del_term: Option<Term>) -> Result<u64> {
        debug_assert!(!self.aborted);
        let start = self.num_docs_in_ram;
        for doc in docs {
            if let Err(e) = self.reserve_one_doc() {
                self.delete_block(start);
                return Err(e);
            }
            let doc_id = self.num_docs_in_ram as DocId;
            if let Err(e) = self.consumer.process_document(doc_id, doc) {
                if e.is_aborting() {
                    self.unreserve_one_doc();
                    self.abort();
                } else {
                    // Incr here because finish_document will not
                    // be called (because an error is being returned):
                    self.num_docs_in_ram += 1;
                    self.delete_block(start);
                }
                return Err(e);
            }
            self.num_docs_in_ram += 1;
        }

        // Apply del_term only after all indexing has
        // succeeded, but apply it only to docs prior to when
        // this batch started:
        let seq_no = if let Some(del_term) = del_term {
            let seq = self
                .delete_queue
                .add_term_to_slice(del_term, &mut self.delete_slice);
            self.delete_slice
                .apply(&mut self.pending_updates, start as DocId);
            seq
        } else {
            let (seq, changed) = self.delete_queue.update_slice(&mut self.delete_slice);
            if changed {
                self.delete_slice
                    .apply(&mut self.pending_updates, start as DocId);
            } else {
                self.delete_slice.reset();
            }
            seq
        };
        Ok(seq_no)
    }

    // the failing block keeps its doc ids, all of them deleted
    fn delete_block(&mut self, start: u32) {
        warn!(
            "DWPT: seg={} document block failed, marking docs {}..{} deleted",
            self.segment_name(),
            start,
            self.num_docs_in_ram
        );
        for doc_id in start..self.num_docs_in_ram {
            self.delete_doc_id(doc_id as DocId);
        }
    }

    // Buffer a specific docID for deletion. Currently only
    // used when we hit an exception when adding a document
    fn delete_doc_id(&mut self, doc_id: DocId) {
        // NOTE: we do not trigger flush here.  This is
        // potentially a RAM leak, if you have an app that tries
        // to add docs but every single doc always hits a
        // non-aborting exception.
        self.pending_updates.add_doc_id(doc_id);
    }

    fn finish_document(&mut self, del_term: Option<Term>) -> u64 {
        // here we actually finish the document in two steps:
        // 1. push the delete into the queue and update our slice
        // 2. increment the DWPT private document id.
        //
        // the updated slice we get from 1. holds all the deletes that have
        // occurred since we updated the slice the last time.
        let mut apply_slice = self.num_docs_in_ram > 0;
        let seq_no = if let Some(del_term) = del_term {
            let seq = self
                .delete_queue
                .add_term_to_slice(del_term.clone(), &mut self.delete_slice);
            debug_assert!(
                self.delete_slice.is_tail_item(&del_term),
                "expected the delete term as the tail item"
            );
            seq
        } else {
            let (seq, changed) = self.delete_queue.update_slice(&mut self.delete_slice);
            apply_slice = changed;
            seq
        };
        if apply_slice {
            self.delete_slice
                .apply(&mut self.pending_updates, self.num_docs_in_ram as DocId);
        } else {
            self.delete_slice.reset();
        }
        self.num_docs_in_ram += 1;
        seq_no
    }

    /// Prepares this DWPT for flushing. This method will freeze and return the
    /// `DocumentsWriterDeleteQueue`s global buffer and apply all pending deletes
    /// to this DWPT
    pub fn prepare_flush(&mut self) -> Result<FrozenBufferedUpdates> {
        debug_assert!(self.num_docs_in_ram > 0);
        let frozen_updates = self
            .delete_queue
            .freeze_global_buffer(Some(&mut self.delete_slice))?;
        // apply all deletes before we flush and release the delete slice
        self.delete_slice
            .apply(&mut self.pending_updates, self.num_docs_in_ram as DocId);
        debug_assert!(self.delete_slice.is_empty());
        self.delete_slice.reset();
        Ok(frozen_updates)
    }

    /// Flush all pending docs to a new segment
    pub fn flush(&mut self) -> Result<Option<FlushedSegment>> {
        debug_assert!(self.num_docs_in_ram > 0);
        debug_assert!(self.delete_slice.is_empty());
        if self.aborted {
            debug!("DWPT: flush: skip because aborting is set.");
            return Ok(None);
        }

        let res = self.do_flush();
        if res.is_err() {
            self.abort();
        }
        res.map(Some)
    }

    fn do_flush(&mut self) -> Result<FlushedSegment> {
        let t0 = Instant::now();
        let num_docs = self.num_docs_in_ram as i32;
        self.segment_info.set_max_doc(num_docs)?;
        let ctx = IOContext::Flush(FlushInfo::new(self.num_docs_in_ram, self.bytes_used()));

        // Apply delete-by-docID now (delete-byDocID only
        // happens when an exception is hit processing that
        // doc, eg if analyzer has some problem w/ the text):
        let mut live_docs: Option<FixedBitSet> = None;
        let mut del_count = 0u32;
        if !self.pending_updates.deleted_doc_ids.is_empty() {
            let mut bits = self
                .codec()
                .live_docs_format()
                .new_live_docs(num_docs as usize);
            for &doc_id in &self.pending_updates.deleted_doc_ids {
                if bits.get_and_clear(doc_id as usize) {
                    del_count += 1;
                }
            }
            live_docs = Some(bits);
        }

        // Delete terms only apply to the docs that were buffered before the
        // delete arrived:
        for (term, &limit) in &self.pending_updates.deleted_terms {
            if let Some(docs) = self.consumer.postings(term) {
                for &doc in docs {
                    if doc >= limit {
                        break;
                    }
                    let bits = live_docs.get_or_insert_with(|| {
                        self.config
                            .codec
                            .live_docs_format()
                            .new_live_docs(num_docs as usize)
                    });
                    if bits.get_and_clear(doc as usize) {
                        del_count += 1;
                    }
                }
            }
        }

        debug!(
            "DWPT: flush postings as segment '{}' num_docs={} del_count={}",
            self.segment_name(),
            num_docs,
            del_count
        );
        let codec = Arc::clone(&self.config.codec);
        let segment_name = self.segment_info.name.clone();
        self.consumer
            .flush(&codec, self.directory.as_ref(), &segment_name, num_docs, &ctx)?;
        self.segment_info
            .set_files(&self.directory.create_files()?)?;

        let segment_info_per_commit =
            Arc::new(SegmentCommitInfo::new(Arc::clone(&self.segment_info), 0, -1));

        // Deletes by query are resolved later against the flushed segment,
        // terms and doc ids are already folded into the live docs.
        let segment_updates = if self.pending_updates.deleted_queries.is_empty() {
            None
        } else {
            self.pending_updates.deleted_terms.clear();
            Some(FrozenBufferedUpdates::new(&mut self.pending_updates, true))
        };
        self.pending_updates.clear();

        let mut fs = FlushedSegment {
            segment_info: segment_info_per_commit,
            segment_updates,
            live_docs: live_docs.map(Arc::new),
            del_count,
        };
        self.seal_flushed_segment(&mut fs, &ctx)?;

        debug!(
            "DWPT: flushed segment {} with {} docs in {:?}",
            self.segment_name(),
            num_docs,
            t0.elapsed()
        );
        Ok(fs)
    }

    fn seal_flushed_segment(
        &mut self,
        flushed_segment: &mut FlushedSegment,
        ctx: &IOContext,
    ) -> Result<()> {
        let info = &flushed_segment.segment_info.info;
        if self.config.use_compound_file {
            let original_files = info.files();
            let cfs_dir = TrackingDirectoryWrapper::new(Arc::clone(&self.directory.directory));
            let res = self
                .codec()
                .compound_format()
                .write(&cfs_dir, info, ctx)
                .and_then(|_| info.set_files(&cfs_dir.create_files()?));
            if let Err(e) = res {
                for file in cfs_dir.create_files()? {
                    if let Err(del_err) = cfs_dir.delete_file(&file) {
                        warn!("DWPT: failed to delete partial file {}: {}", file, del_err);
                    }
                }
                return Err(e);
            }
            info.set_use_compound_file(true);
            // the originals are deleted once the segment is published
            self.files_to_delete.extend(original_files);
        }

        // Have codec write SegmentInfo.  Must do this after
        // creating CFS so that 1) .si isn't slurped into CFS,
        // and 2) .si reflects useCompoundFile=true change
        // above:
        self.codec()
            .segment_info_format()
            .write(self.directory.as_ref(), info, ctx)?;

        // Must write deleted docs after the CFS so we don't
        // slurp the del file into CFS:
        if let Some(ref live_docs) = flushed_segment.live_docs {
            debug_assert!(flushed_segment.del_count > 0);
            debug_assert_eq!(live_docs.len(), info.max_doc() as usize);
            self.codec().live_docs_format().write_live_docs(
                live_docs,
                self.directory.as_ref(),
                &flushed_segment.segment_info,
                flushed_segment.del_count as i32,
                ctx,
            )?;
            flushed_segment
                .segment_info
                .set_del_count(flushed_segment.del_count as i32)?;
            flushed_segment.segment_info.advance_del_gen();
        }
        Ok(())
    }

    /// Called if we hit an exception at a bad time (when
    /// updating the index files) and must discard all
    /// currently buffered docs.  This resets our state,
    /// discarding any docs added since last flush.
    pub fn abort(&mut self) {
        self.aborted = true;
        debug!("DWPT: now abort seg={}", self.segment_name());
        self.consumer.abort();
        self.pending_updates.clear();
        debug!("DWPT: done abort");
    }

    /// Files written so far, to be removed after an abort.
    pub fn pending_files(&self) -> Result<HashSet<String>> {
        self.directory.create_files()
    }
}

/// The result of flushing one DWPT, waiting in its ticket to be published.
pub struct FlushedSegment {
    pub segment_info: Arc<SegmentCommitInfo>,
    // deletes by query the segment still has to resolve against itself
    pub segment_updates: Option<FrozenBufferedUpdates>,
    pub live_docs: Option<Arc<FixedBitSet>>,
    pub del_count: u32,
}

/// `ThreadState` references and guards a `DocumentsWriterPerThread`
/// instance that is used during indexing to build a in-memory index
/// segment. `ThreadState` also holds all flush related per-thread
/// data controlled by `DocumentsWriterFlushControl`.
///
/// The builder is only reachable through the state's lock, so a
/// `ThreadState` is used by one thread at a time.
pub struct ThreadState {
    inner: Mutex<ThreadStateInner>,
    // write access guarded by DocumentsWriterFlushControl
    flush_pending: AtomicBool,
    // bytes of the builder as last accounted by the flush control
    bytes_used: AtomicU64,
    num_docs_in_ram: AtomicU32,
    // set by DocumentsWriter after each indexing op finishes
    last_seq_no: AtomicU64,
    // false once the writer closed, no new builder is installed then
    active: AtomicBool,
    // index in DocumentsWriterPerThreadPool
    pub index: usize,
}

pub struct ThreadStateInner {
    pub dwpt: Option<DocumentsWriterPerThread>,
}

impl ThreadStateInner {
    pub fn inited(&self) -> bool {
        self.dwpt.is_some()
    }
}

impl ThreadState {
    fn new(index: usize) -> Self {
        ThreadState {
            inner: Mutex::new(ThreadStateInner { dwpt: None }),
            flush_pending: AtomicBool::new(false),
            bytes_used: AtomicU64::new(0),
            num_docs_in_ram: AtomicU32::new(0),
            last_seq_no: AtomicU64::new(0),
            active: AtomicBool::new(true),
            index,
        }
    }

    pub fn lock(&self) -> Result<MutexGuard<ThreadStateInner>> {
        Ok(self.inner.lock()?)
    }

    /// `None` if another thread holds the state.
    pub fn try_lock(&self) -> Result<Option<MutexGuard<ThreadStateInner>>> {
        match self.inner.try_lock() {
            Ok(guard) => Ok(Some(guard)),
            Err(TryLockError::WouldBlock) => Ok(None),
            Err(TryLockError::Poisoned(e)) => Err(e.into()),
        }
    }

    pub fn flush_pending(&self) -> bool {
        self.flush_pending.load(Ordering::Acquire)
    }

    pub fn set_flush_pending(&self, pending: bool) {
        self.flush_pending.store(pending, Ordering::Release);
    }

    pub fn bytes_used(&self) -> u64 {
        self.bytes_used.load(Ordering::Acquire)
    }

    pub fn set_bytes_used(&self, bytes: u64) {
        self.bytes_used.store(bytes, Ordering::Release);
    }

    pub fn num_docs_in_ram(&self) -> u32 {
        self.num_docs_in_ram.load(Ordering::Acquire)
    }

    pub fn set_num_docs_in_ram(&self, num_docs: u32) {
        self.num_docs_in_ram.store(num_docs, Ordering::Release);
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub fn set_last_seq_no(&self, seq_no: u64) {
        self.last_seq_no.store(seq_no, Ordering::Release);
    }

    pub fn last_seq_no(&self) -> u64 {
        self.last_seq_no.load(Ordering::Acquire)
    }

    /// Detaches the builder and clears the accounting; a closed state stays
    /// inactive.
    pub fn reset(&self, inner: &mut ThreadStateInner, closed: bool) -> Option<DocumentsWriterPerThread> {
        let dwpt = inner.dwpt.take();
        self.flush_pending.store(false, Ordering::Release);
        self.bytes_used.store(0, Ordering::Release);
        self.num_docs_in_ram.store(0, Ordering::Release);
        if closed {
            self.active.store(false, Ordering::Release);
        }
        dwpt
    }
}

/// `DocumentsWriterPerThreadPool` controls `ThreadState` instances
/// and their thread assignments during indexing. Each `ThreadState` holds
/// a reference to a `DocumentsWriterPerThread` that is once a
/// `ThreadState` is obtained from the pool exclusively used for indexing a
/// single document by the obtaining thread. Each indexing thread must obtain
/// such a `ThreadState` to make progress.
///
/// Once a `DocumentsWriterPerThread` is selected for flush the thread pool
/// is reusing the flushing `DocumentsWriterPerThread`s ThreadState with a
/// new `DocumentsWriterPerThread` instance.
pub struct DocumentsWriterPerThreadPool {
    thread_states: RwLock<Vec<Arc<ThreadState>>>,
    // indices of the states no thread holds right now
    free_list: Mutex<Vec<usize>>,
    free_cond: Condvar,
    // the slot each thread used last
    affinity: ThreadLocal<Cell<Option<usize>>>,
    max_thread_states: usize,
    aborted: AtomicBool,
}

impl DocumentsWriterPerThreadPool {
    pub fn new(max_thread_states: usize) -> Self {
        DocumentsWriterPerThreadPool {
            thread_states: RwLock::new(vec![]),
            free_list: Mutex::new(Vec::with_capacity(max_thread_states)),
            free_cond: Condvar::new(),
            affinity: ThreadLocal::new(),
            max_thread_states,
            aborted: AtomicBool::new(false),
        }
    }

    /// Returns the active number of `ThreadState` instances.
    pub fn active_thread_state_count(&self) -> usize {
        self.thread_states.read().map(|s| s.len()).unwrap_or(0)
    }

    pub fn get_thread_state(&self, i: usize) -> Result<Arc<ThreadState>> {
        let guard = self.thread_states.read()?;
        match guard.get(i) {
            Some(state) => Ok(Arc::clone(state)),
            None => bail!(IllegalState(format!("no thread state {}", i))),
        }
    }

    pub fn thread_states(&self) -> Result<Vec<Arc<ThreadState>>> {
        Ok(self.thread_states.read()?.clone())
    }

    /// Stops handing out states until `clear_abort`.
    pub fn set_abort(&self) {
        self.aborted.store(true, Ordering::Release);
    }

    pub fn clear_abort(&self) -> Result<()> {
        let _guard = self.free_list.lock()?;
        self.aborted.store(false, Ordering::Release);
        self.free_cond.notify_all();
        Ok(())
    }

    /// Checks a state out to the calling thread, preferring the one it used
    /// last. Blocks while every state is checked out and no new one may be
    /// created. The caller still has to lock the returned state.
    pub fn get_and_lock(&self) -> Result<Arc<ThreadState>> {
        let affinity = self.affinity.get_or(|| Cell::new(None));
        let mut free = self.free_list.lock()?;
        loop {
            if !self.aborted.load(Ordering::Acquire) {
                if let Some(preferred) = affinity.get() {
                    if let Some(pos) = free.iter().position(|&i| i == preferred) {
                        free.swap_remove(pos);
                        return self.get_thread_state(preferred);
                    }
                }
                if let Some(idx) = free.pop() {
                    affinity.set(Some(idx));
                    return self.get_thread_state(idx);
                }
                let mut states = self.thread_states.write()?;
                if states.len() < self.max_thread_states {
                    let state = Arc::new(ThreadState::new(states.len()));
                    states.push(Arc::clone(&state));
                    affinity.set(Some(state.index));
                    return Ok(state);
                }
            }
            free = self.free_cond.wait(free)?;
        }
    }

    /// Returns a state checked out by `get_and_lock`.
    pub fn release(&self, state: &ThreadState) -> Result<()> {
        let mut free = self.free_list.lock()?;
        debug_assert!(!free.contains(&state.index));
        free.push(state.index);
        // In case any thread is waiting, wake one of them up since we just
        // released a thread state
        self.free_cond.notify_one();
        Ok(())
    }

    /// Detaches the builder of a locked state.
    pub fn reset(
        &self,
        state: &ThreadState,
        inner: &mut ThreadStateInner,
        closed: bool,
    ) -> Option<DocumentsWriterPerThread> {
        state.reset(inner, closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::doc::{Field, FieldType};
    use crate::core::index::reader::SegmentReader;
    use crate::core::search::TermQuery;
    use crate::core::store::RAMDirectory;
    use crate::error::ErrorKind;

    use std::thread;

    fn new_dwpt(
        name: &str,
        config: IndexWriterConfig,
        queue: &Arc<DocumentsWriterDeleteQueue>,
    ) -> (Arc<dyn Directory>, DocumentsWriterPerThread) {
        let dir: Arc<dyn Directory> = Arc::new(RAMDirectory::new());
        let dwpt = DocumentsWriterPerThread::new(
            name.to_string(),
            Arc::clone(&dir),
            Arc::clone(&dir),
            Arc::new(config),
            Arc::clone(queue),
            Arc::new(AtomicI64::new(0)),
        );
        (dir, dwpt)
    }

    fn doc(id: &str, body: &str) -> Document {
        Document::with_fields(vec![Field::string("id", id), Field::text("body", body)])
    }

    #[test]
    fn test_update_document_deletes_earlier_docs_only() -> Result<()> {
        let queue = Arc::new(DocumentsWriterDeleteQueue::default());
        let config = IndexWriterConfig::default().set_use_compound_file(false);
        let (_dir, mut dwpt) = new_dwpt("_0", config, &queue);

        let s1 = dwpt.update_document(&doc("1", "a"), None)?;
        let s2 = dwpt.update_document(&doc("1", "b"), Some(Term::from_text("id", "1")))?;
        assert!(s2 > s1);
        assert_eq!(dwpt.num_docs_in_ram, 2);
        assert_eq!(dwpt.num_delete_terms(), 1);

        let global = dwpt.prepare_flush()?;
        assert!(global.any());
        let flushed = dwpt.flush()?.unwrap();
        assert_eq!(flushed.del_count, 1);
        assert!(flushed.segment_updates.is_none());

        let info = &flushed.segment_info;
        assert_eq!(info.info.max_doc(), 2);
        assert_eq!(info.del_count(), 1);
        let reader = SegmentReader::open(info, &IOContext::READ)?;
        assert!(!reader.is_live(0));
        assert!(reader.is_live(1));
        assert_eq!(reader.stored_document(1)?.get("body"), Some("b"));
        Ok(())
    }

    #[test]
    fn test_deletes_from_other_threads_apply_to_buffered_docs() -> Result<()> {
        let queue = Arc::new(DocumentsWriterDeleteQueue::default());
        let config = IndexWriterConfig::default().set_use_compound_file(false);
        let (_dir, mut dwpt) = new_dwpt("_0", config, &queue);
        dwpt.update_document(&doc("1", "a"), None)?;
        dwpt.update_document(&doc("2", "a"), None)?;

        let other = Arc::clone(&queue);
        thread::spawn(move || {
            other.add_delete_queries(vec![Arc::new(TermQuery::new(Term::from_text(
                "body", "a",
            )))]);
        })
        .join()
        .unwrap();
        dwpt.update_document(&doc("3", "a"), None)?;

        dwpt.prepare_flush()?;
        let flushed = dwpt.flush()?.unwrap();
        let updates = flushed.segment_updates.unwrap();
        assert!(updates.is_segment_private);
        assert_eq!(updates.query_and_limits.len(), 1);
        // the query only covers the two docs added before it
        assert_eq!(updates.query_and_limits[0].1, 2);
        Ok(())
    }

    #[test]
    fn test_non_aborting_failure_marks_doc_deleted() -> Result<()> {
        let queue = Arc::new(DocumentsWriterDeleteQueue::default());
        let config = IndexWriterConfig::default().set_use_compound_file(true);
        let (dir, mut dwpt) = new_dwpt("_0", config, &queue);

        dwpt.update_document(&doc("1", "a"), None)?;
        let huge = "x".repeat(40_000);
        let bad = Document::with_fields(vec![Field::new("id", &huge, FieldType::STRING)]);
        let err = dwpt.update_document(&bad, None).unwrap_err();
        assert!(!err.is_aborting());
        assert!(!dwpt.is_aborted());
        dwpt.update_document(&doc("3", "c"), None)?;
        assert_eq!(dwpt.num_docs_in_ram, 3);

        dwpt.prepare_flush()?;
        let flushed = dwpt.flush()?.unwrap();
        assert_eq!(flushed.del_count, 1);
        let info = &flushed.segment_info;
        assert!(info.info.is_compound_file());
        assert!(info.info.files().iter().any(|f| f.ends_with(".cfs")));
        assert!(!dwpt.files_to_delete.is_empty());
        assert!(dir.list_all()?.iter().any(|f| f.ends_with(".liv")));

        let reader = SegmentReader::open(info, &IOContext::READ)?;
        assert_eq!(reader.num_docs(), 2);
        assert!(!reader.is_live(1));
        Ok(())
    }

    #[test]
    fn test_failed_block_is_deleted_whole() -> Result<()> {
        let queue = Arc::new(DocumentsWriterDeleteQueue::default());
        let config = IndexWriterConfig::default().set_use_compound_file(false);
        let (_dir, mut dwpt) = new_dwpt("_0", config, &queue);
        dwpt.update_document(&doc("0", "a"), None)?;

        let huge = "x".repeat(40_000);
        let block = vec![
            doc("1", "a"),
            Document::with_fields(vec![Field::new("id", &huge, FieldType::STRING)]),
            doc("3", "a"),
        ];
        assert!(dwpt.update_documents(&block, None).is_err());
        assert_eq!(dwpt.num_docs_in_ram, 3);

        dwpt.update_documents(&[doc("4", "a"), doc("5", "a")], None)?;
        dwpt.prepare_flush()?;
        let flushed = dwpt.flush()?.unwrap();
        assert_eq!(flushed.del_count, 2);
        let live = flushed.live_docs.unwrap();
        assert!(live.get(0));
        assert!(!live.get(1));
        assert!(!live.get(2));
        assert!(live.get(3));
        Ok(())
    }

    #[test]
    fn test_aborting_failure_discards_everything() -> Result<()> {
        #[derive(Debug)]
        struct ExplodingAnalyzer;
        impl crate::core::analysis::Analyzer for ExplodingAnalyzer {
            fn tokenize(&self, _field: &str, text: &str) -> Result<Vec<String>> {
                if text == "boom" {
                    bail!(ErrorKind::Aborting("analyzer state corrupt".into()));
                }
                Ok(vec![text.to_string()])
            }
        }

        let queue = Arc::new(DocumentsWriterDeleteQueue::default());
        let config = IndexWriterConfig::default().set_analyzer(Arc::new(ExplodingAnalyzer));
        let pending = Arc::new(AtomicI64::new(0));
        let dir: Arc<dyn Directory> = Arc::new(RAMDirectory::new());
        let mut dwpt = DocumentsWriterPerThread::new(
            "_0".into(),
            Arc::clone(&dir),
            dir,
            Arc::new(config),
            queue,
            Arc::clone(&pending),
        );
        dwpt.update_document(&doc("0", "fine"), None)?;
        let err = dwpt.update_document(&doc("1", "boom"), None).unwrap_err();
        assert!(err.is_aborting());
        assert!(dwpt.is_aborted());
        assert_eq!(pending.load(Ordering::Acquire), 1);
        assert_eq!(dwpt.bytes_used(), 0);
        Ok(())
    }

    #[test]
    fn test_pool_prefers_last_used_state() -> Result<()> {
        let pool = DocumentsWriterPerThreadPool::new(2);
        let first = pool.get_and_lock()?;
        pool.release(&first)?;
        let second = pool.get_and_lock()?;
        pool.release(&second)?;
        assert_eq!(first.index, second.index);
        assert_eq!(pool.active_thread_state_count(), 1);

        // a second thread gets its own state while ours is held
        let held = pool.get_and_lock()?;
        let pool = Arc::new(pool);
        let pool2 = Arc::clone(&pool);
        let other = thread::spawn(move || {
            let state = pool2.get_and_lock().unwrap();
            pool2.release(&state).unwrap();
            state.index
        })
        .join()
        .unwrap();
        assert_ne!(other, held.index);
        assert_eq!(pool.active_thread_state_count(), 2);
        pool.release(&held)?;
        Ok(())
    }

    #[test]
    fn test_pool_blocks_when_exhausted() -> Result<()> {
        let pool = Arc::new(DocumentsWriterPerThreadPool::new(1));
        let held = pool.get_and_lock()?;
        let pool2 = Arc::clone(&pool);
        let waiter = thread::spawn(move || {
            let state = pool2.get_and_lock().unwrap();
            let idx = state.index;
            pool2.release(&state).unwrap();
            idx
        });
        thread::sleep(::std::time::Duration::from_millis(50));
        pool.release(&held)?;
        assert_eq!(waiter.join().unwrap(), held.index);
        Ok(())
    }
}
