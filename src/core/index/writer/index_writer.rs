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

use crate::core::codec::segment_infos::{
    SegmentCommitInfo, SegmentInfo, SegmentInfos, WRITE_LOCK_NAME,
};
use crate::core::doc::{Document, Term};
use crate::core::index::merge::{
    DocMap, LiveDocsDocMap, MergeContext, MergeTrigger, OneMerge, OneMergeRunningInfo,
    SegmentMerger,
};
use crate::core::index::reader::{index_exists, StandardDirectoryReader};
use crate::core::index::writer::{
    BufferedUpdatesStream, DocumentsWriter, FlushTicketPublisher, FlushedSegment,
    FrozenBufferedUpdates, IndexFileDeleter, IndexWriterConfig, OpenMode,
    RateLimitFilterDirectory, ReaderPool, ReadersAndUpdates, WriterEvent,
};
use crate::core::search::{Query, MATCH_ALL};
use crate::core::store::{
    obtain_lock_with_timeout, Directory, IOContext, Lock, LockValidatingDirectoryWrapper,
    RateLimiter, TrackingDirectoryWrapper,
};
use crate::core::util::{random_id, to_base36, Bits, DocId};
use crate::error::{
    Error,
    ErrorKind::{AlreadyClosed, IllegalArgument, IllegalState, MergeAborted, RuntimeError},
    Result,
};

use std::collections::{HashMap, HashSet, VecDeque};
use std::env;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// Hard limit on the number of documents an index may hold. Leaves headroom
/// below `i32::MAX` for doc id arithmetic.
pub const INDEX_MAX_DOCS: i32 = i32::max_value() - 128;

const SOURCE_MERGE: &str = "merge";

/// Draws the next segment name from the writer-wide counter.
pub fn new_segment_name(counter: &AtomicU64) -> String {
    format!("_{}", to_base36(counter.fetch_add(1, Ordering::AcqRel)))
}

fn segments_string(infos: &SegmentInfos) -> String {
    infos
        .segments
        .iter()
        .map(|s| s.to_string())
        .collect::<Vec<_>>()
        .join(" ")
}

/// An `IndexWriter` creates and maintains an index.
///
/// The open mode of the `IndexWriterConfig` decides whether a new index is
/// created, or whether an existing index is opened. Note that you can open
/// an index with `OpenMode::Create` even while readers are using the index.
/// The old readers will continue to search the "point in time" snapshot they
/// had opened, and won't see the newly created index until they re-open. With
/// `OpenMode::CreateOrAppend` a new index is created if there is not already
/// an index at the provided path and otherwise the existing index is opened.
///
/// In either case, documents are added with `add_document` and removed with
/// `delete_documents_by_terms` or `delete_documents_by_queries`. A document
/// can be updated with `update_document`, which just deletes and then adds
/// the entire document. When finished adding, deleting and updating
/// documents, `close` should be called.
///
/// Each method that changes the index returns a sequence number, which
/// expresses the effective serialization of the operations across threads.
///
/// These changes are buffered in memory and periodically flushed to the
/// `Directory` (during the above method calls). A flush is triggered when
/// there are enough added documents since the last flush. Flushing is
/// triggered either by RAM usage of the documents (see
/// `IndexWriterConfig::set_ram_buffer_size_mb`) or the number of added
/// documents (see `IndexWriterConfig::set_max_buffered_docs`). The default is
/// to flush when RAM usage hits 16 MB. Note that flushing just moves the
/// internal buffered state into the index, but these changes are not visible
/// to readers until either `commit` or `close` is called. A flush may also
/// trigger one or more segment merges, run by the configured
/// `MergeScheduler`.
///
/// Opening an `IndexWriter` creates a lock file for the directory in use.
/// Trying to open another `IndexWriter` on the same directory fails with
/// `LockObtainFailed`.
///
/// Expert: `IndexWriter` allows an optional `IndexDeletionPolicy` to be
/// specified. You can use this to control when prior commits are deleted
/// from the index. The default policy is `KeepOnlyLastCommitDeletionPolicy`
/// which removes all prior commits as soon as a new commit is done.
///
/// Expert: `IndexWriter` allows you to separately change the `MergePolicy`
/// and the `MergeScheduler`. The `MergePolicy` is invoked whenever there are
/// changes to the segments in the index. Its role is to select which merges
/// to do, if any. The `MergeScheduler` is then invoked with the requested
/// merges and it decides when and how to run them.
///
/// NOTE: if the writer runs out of a resource (see
/// `ErrorKind::ResourceExhausted`) it records a tragic event and closes
/// itself, since internal state such as buffered documents, deletions and
/// reference counts may be corrupted. Any subsequent call fails with
/// `AlreadyClosed` naming the tragedy.
///
/// NOTE: `IndexWriter` instances are completely thread safe and cheap to
/// clone, all clones share one writer.
///
/// Clarification: check points (and commits)
///
/// The writer writes new index files to the directory without writing a new
/// segments_N file which references these new files. Each time the
/// `SegmentInfos` is changed, and matches the (possibly modified) directory
/// files, we have a new "check point". If the modified `SegmentInfos` is
/// written to disk as a new generation of segments_N, this check point is
/// also a commit. A new checkpoint always replaces the previous one and
/// becomes the new front of the index, which lets the `IndexFileDeleter`
/// delete files referenced only by stale checkpoints.
#[derive(Clone)]
pub struct IndexWriter {
    writer: Arc<IndexWriterInner>,
}

/// A merge that failed with something other than an abort, kept until the
/// next forced merge so `force_merge` can re-raise it.
struct MergeFailure {
    id: u32,
    segments: String,
    message: String,
    forced: bool,
}

/// Everything guarded by the writer lock.
struct WriterState {
    segment_infos: SegmentInfos,
    // the last committed segments, restored by rollback
    rollback_segments: Vec<Arc<SegmentCommitInfo>>,
    deleter: IndexFileDeleter,

    change_count: u64,
    last_commit_change_count: u64,
    pending_commit_change_count: u64,
    pending_commit: Option<SegmentInfos>,
    pending_seq_no: u64,
    files_to_commit: Option<HashSet<String>>,

    // segments of a running force_merge: true for the original segments,
    // false for the ones its merges produced
    segments_to_merge: HashMap<Arc<SegmentCommitInfo>, bool>,
    merge_max_num_segments: u32,
    merging_segments: HashSet<String>,
    pending_merges: VecDeque<OneMerge>,
    running_merges: HashMap<u32, OneMergeRunningInfo>,
    merge_exceptions: Vec<MergeFailure>,
    merge_gen: u64,
    stop_merges: bool,
}

impl WriterState {
    /// Called whenever the segment list changed: the deleter learns about
    /// the new files and the next commit will write a new segments_N.
    fn checkpoint(&mut self) -> Result<()> {
        self.change_count += 1;
        self.segment_infos.changed();
        self.deleter.checkpoint(&self.segment_infos, false)
    }

    /// Like `checkpoint` but leaves the segment list version alone, used when
    /// only per-segment files such as live docs changed.
    fn checkpoint_no_sis(&mut self) -> Result<()> {
        self.change_count += 1;
        self.deleter.checkpoint(&self.segment_infos, false)
    }

    fn has_forced_merges(&self) -> bool {
        self.pending_merges
            .iter()
            .any(|m| m.max_num_segments.is_some())
            || self.running_merges.values().any(|info| info.is_forced())
    }
}

struct WriterMergeContext<'a> {
    merging_segments: &'a HashSet<String>,
    reader_pool: &'a ReaderPool,
    merge_id_gen: &'a AtomicU32,
}

impl<'a> MergeContext for WriterMergeContext<'a> {
    fn num_deleted_docs(&self, info: &SegmentCommitInfo) -> i32 {
        match self.reader_pool.num_deleted_docs(info) {
            Ok(count) => count,
            Err(e) => {
                warn!("IW: failed to count deletes of {}: {}", info.name(), e);
                info.del_count()
            }
        }
    }

    fn merging_segments(&self) -> &HashSet<String> {
        self.merging_segments
    }

    fn next_merge_id(&self) -> u32 {
        self.merge_id_gen.fetch_add(1, Ordering::AcqRel)
    }
}

struct IndexWriterInner {
    config: Arc<IndexWriterConfig>,
    // the directory as handed in by the user
    directory_orig: Arc<dyn Directory>,
    // the same directory, validating the write lock on every write
    directory: Arc<dyn Directory>,
    write_lock: Mutex<Option<Arc<dyn Lock>>>,

    state: Mutex<WriterState>,
    cond: Condvar,
    closed: AtomicBool,
    closing: AtomicBool,
    tragedy: Mutex<Option<String>>,

    doc_writer: DocumentsWriter,
    buffered_updates_stream: Arc<BufferedUpdatesStream>,
    reader_pool: ReaderPool,
    // docs in the segment list plus docs still buffered
    pending_num_docs: Arc<AtomicI64>,
    segment_counter: Arc<AtomicU64>,
    merge_id_gen: AtomicU32,

    // serializes prepare_commit and commit
    commit_lock: Mutex<()>,
    // held by every path running a full flush
    full_flush_lock: Mutex<()>,
}

impl IndexWriter {
    /// Constructs a new writer per the settings given in `config`. If you
    /// want to make "live" changes to this writer instance, use `config()`.
    ///
    /// NOTE: after this writer is created, the given configuration instance
    /// cannot be passed to another writer.
    pub fn new(directory: Arc<dyn Directory>, config: IndexWriterConfig) -> Result<IndexWriter> {
        config.validate()?;
        let config = Arc::new(config);
        let write_lock: Arc<dyn Lock> = Arc::from(obtain_lock_with_timeout(
            directory.as_ref(),
            WRITE_LOCK_NAME,
            config.write_lock_timeout,
        )?);
        debug!("IW: obtained {} in {}", WRITE_LOCK_NAME, directory);
        match IndexWriterInner::new(directory, config, Arc::clone(&write_lock)) {
            Ok(inner) => Ok(IndexWriter {
                writer: Arc::new(inner),
            }),
            Err(e) => {
                if let Err(le) = write_lock.close() {
                    warn!("IW: failed to release {}: {}", WRITE_LOCK_NAME, le);
                }
                Err(e)
            }
        }
    }

    pub fn config(&self) -> &Arc<IndexWriterConfig> {
        &self.writer.config
    }

    /// Returns the directory this index resides in.
    pub fn directory(&self) -> &Arc<dyn Directory> {
        &self.writer.directory_orig
    }

    pub fn is_open(&self) -> bool {
        !self.writer.closed.load(Ordering::Acquire) && !self.writer.closing.load(Ordering::Acquire)
    }

    /// The error that forced this writer to close, if any.
    pub fn tragic_exception(&self) -> Option<String> {
        self.writer.tragedy.lock().ok().and_then(|t| t.clone())
    }

    /// Adds a document to this index.
    ///
    /// Note that each term in the document can be no longer than the max
    /// term length, or an error is returned and the document is not added.
    /// Returns the sequence number of this operation.
    pub fn add_document(&self, doc: &Document) -> Result<u64> {
        self.update_document(doc, None)
    }

    /// Atomically adds a block of documents with sequentially assigned
    /// document IDs, such that an external reader will see all or none of
    /// the documents.
    pub fn add_documents(&self, docs: &[Document]) -> Result<u64> {
        self.update_documents(docs, None)
    }

    /// Updates a document by first deleting the document(s) containing
    /// `term` and then adding the new document. The delete and then add are
    /// atomic as seen by a reader on the same index (flush may happen only
    /// after the add).
    pub fn update_document(&self, doc: &Document, term: Option<Term>) -> Result<u64> {
        self.writer.ensure_open(true)?;
        let res = self.writer.doc_writer.update_document(doc, term);
        self.after_update(res, "update_document")
    }

    /// Atomically deletes documents matching `term` and adds a block of
    /// documents with sequentially assigned document IDs.
    pub fn update_documents(&self, docs: &[Document], term: Option<Term>) -> Result<u64> {
        self.writer.ensure_open(true)?;
        let res = self.writer.doc_writer.update_documents(docs, term);
        self.after_update(res, "update_documents")
    }

    /// Deletes the document(s) containing any of the terms. All given deletes
    /// are applied and flushed atomically at the same time.
    pub fn delete_documents_by_terms(&self, terms: Vec<Term>) -> Result<u64> {
        self.writer.ensure_open(true)?;
        let res = self.writer.doc_writer.delete_terms(terms);
        self.after_update(res, "delete_documents_by_terms")
    }

    /// Deletes the document(s) matching any of the provided queries. A match
    /// all query turns into `delete_all`.
    pub fn delete_documents_by_queries(&self, queries: Vec<Arc<dyn Query>>) -> Result<u64> {
        self.writer.ensure_open(true)?;
        if queries.iter().any(|q| q.query_type() == MATCH_ALL) {
            return self.delete_all();
        }
        let res = self.writer.doc_writer.delete_queries(queries);
        self.after_update(res, "delete_documents_by_queries")
    }

    /// Delete all documents in the index.
    ///
    /// This method will drop all buffered documents and will remove all
    /// segments from the index. This change will not be visible until a
    /// `commit` has been called. This method can be rolled back using
    /// `rollback`.
    ///
    /// NOTE: this method is much faster than using
    /// `delete_documents_by_queries` with a match all query. Yet, this method
    /// also has different semantics compared to it, since internal data
    /// structures are cleared as well as all segment information is forcefully
    /// dropped. Pending and running merges are aborted.
    pub fn delete_all(&self) -> Result<u64> {
        self.writer.ensure_open(true)?;
        let res = self.delete_all_internal();
        self.writer.check_tragic(res, "delete_all")
    }

    fn delete_all_internal(&self) -> Result<u64> {
        let seq_no = {
            let _l = self.writer.full_flush_lock.lock()?;
            let inner = &self.writer;
            inner.doc_writer.lock_and_abort_all(|_| {
                let guard = inner.state.lock()?;
                let mut guard = inner.abort_merges(guard)?;
                let st = &mut *guard;
                st.stop_merges = false;
                // the buffered docs were already discounted by the abort
                inner
                    .pending_num_docs
                    .fetch_sub(st.segment_infos.total_max_doc(), Ordering::AcqRel);
                st.segment_infos.clear();
                st.segments_to_merge.clear();
                st.deleter.checkpoint(&st.segment_infos, false)?;
                inner.reader_pool.drop_all(false)?;
                st.change_count += 1;
                st.segment_infos.changed();
                inner.buffered_updates_stream.clear()?;
                Ok(inner.doc_writer.delete_queue().next_sequence_number())
            })?
        };
        self.process_events(false)?;
        Ok(seq_no)
    }

    fn after_update(&self, res: Result<(u64, bool)>, location: &str) -> Result<u64> {
        match res {
            Ok((seq_no, has_events)) => {
                if has_events || self.writer.doc_writer.has_events() {
                    let res = self.process_events(true);
                    self.writer.check_tragic(res, location)?;
                }
                Ok(seq_no)
            }
            Err(e) => {
                if e.is_tragic() {
                    return self.writer.check_tragic(Err(e), location);
                }
                if let Err(pe) = self.process_events(false) {
                    warn!("IW: failed to process events after {}: {}", location, pe);
                }
                Err(e)
            }
        }
    }

    fn process_events(&self, trigger_merge: bool) -> Result<bool> {
        let mut processed = false;
        while let Some(event) = self.writer.doc_writer.next_event() {
            processed = true;
            self.process_event(event, trigger_merge)?;
        }
        Ok(processed)
    }

    fn process_event(&self, event: WriterEvent, trigger_merge: bool) -> Result<()> {
        trace!("IW: process event {:?}", event);
        match event {
            WriterEvent::ApplyDeletes => {
                self.writer.purge(true)?;
                let mut guard = self.writer.state.lock()?;
                self.writer.apply_all_deletes_and_update(&mut guard)?;
            }
            WriterEvent::MergePending => {
                self.writer.purge(true)?;
                if trigger_merge {
                    self.maybe_merge_internal(MergeTrigger::SegmentFlush, None)?;
                }
            }
            WriterEvent::ForcedPurge => {
                self.writer.purge(true)?;
            }
            WriterEvent::FlushFailed(info) => {
                self.writer.state.lock()?.deleter.refresh(Some(info.name.as_str()))?;
            }
            WriterEvent::DeleteNewFiles(files) => {
                self.writer.state.lock()?.deleter.delete_new_files(&files);
            }
        }
        Ok(())
    }

    /// Moves all in-memory segments to the directory, but does not commit
    /// (fsync) them (call `commit` for that).
    pub fn flush(&self) -> Result<()> {
        let res = self.flush_internal(true, true);
        self.writer.check_tragic(res, "flush")
    }

    fn flush_internal(&self, trigger_merge: bool, apply_all_deletes: bool) -> Result<()> {
        // We can be called during close, when closing==true, so we must pass
        // false to ensure_open:
        self.writer.ensure_open(false)?;
        if self.do_flush(apply_all_deletes)? && trigger_merge {
            self.maybe_merge_internal(MergeTrigger::FullFlush, None)?;
        }
        Ok(())
    }

    fn do_flush(&self, apply_all_deletes: bool) -> Result<bool> {
        debug!("IW: start flush: apply_all_deletes={}", apply_all_deletes);
        let flushed = {
            let _l = self.writer.full_flush_lock.lock()?;
            let res = self.writer.doc_writer.flush_all_threads(&*self.writer);
            let finished = self.writer.doc_writer.finish_full_flush(res.is_ok());
            let (flushed, _) = res?;
            finished?;
            flushed
        };
        self.process_events(false)?;
        let applied = {
            let mut guard = self.writer.state.lock()?;
            self.writer.maybe_apply_deletes(&mut guard, apply_all_deletes)?
        };
        Ok(flushed || applied)
    }

    /// Expert: prepare for commit.
    ///
    /// This does the first phase of 2-phase commit: it flushes all pending
    /// changes, applies all deletes, writes the pending_segments_N file and
    /// syncs all referenced index files, such that a reader will not see the
    /// changes until `commit` is called. After calling this you must call
    /// either `commit` to finish the commit, or `rollback` to revert it and
    /// all other changes since the last commit.
    ///
    /// Returns the sequence number of the last operation in the commit.
    pub fn prepare_commit(&self) -> Result<u64> {
        self.writer.ensure_open(true)?;
        let res = {
            let _l = self.writer.commit_lock.lock()?;
            self.prepare_commit_internal()
        };
        self.writer.check_tragic(res, "prepare_commit")
    }

    fn prepare_commit_internal(&self) -> Result<u64> {
        self.writer.ensure_open(false)?;
        debug!("IW: prepare_commit: flush");
        if self.writer.state.lock()?.pending_commit.is_some() {
            bail!(IllegalState(
                "prepare_commit was already called with no corresponding call to commit".into()
            ));
        }

        let (any_changes, seq_no, to_commit) = {
            let _l = self.writer.full_flush_lock.lock()?;
            let res = self.flush_and_snapshot();
            let finished = self.writer.doc_writer.finish_full_flush(res.is_ok());
            let snapshot = res?;
            finished?;
            snapshot
        };

        let res = self.process_events(false).and_then(|_| {
            if any_changes {
                self.maybe_merge_internal(MergeTrigger::FullFlush, None)
            } else {
                Ok(())
            }
        });
        if let Err(e) = res {
            let mut guard = self.writer.state.lock()?;
            let st = &mut *guard;
            if let Some(files) = st.files_to_commit.take() {
                st.deleter.dec_ref_files(&files);
            }
            return Err(e);
        }

        self.writer.start_commit(to_commit)?;
        self.writer.state.lock()?.pending_seq_no = seq_no;
        Ok(seq_no)
    }

    /// Flushes everything and, under the writer lock, snapshots the segment
    /// list that the next commit will write. Must run under the full flush
    /// lock.
    fn flush_and_snapshot(&self) -> Result<(bool, u64, SegmentInfos)> {
        let (flushed, seq_no) = self.writer.doc_writer.flush_all_threads(&*self.writer)?;

        let mut guard = self.writer.state.lock()?;
        let st = &mut *guard;
        self.writer.maybe_apply_deletes(st, true)?;
        if self.writer.reader_pool.commit(&st.segment_infos)? {
            st.checkpoint_no_sis()?;
        }
        // Must clone the segment infos while we still hold fullFlushLock and
        // while sync'd so that no partial changes (eg a delete w/o
        // corresponding add from an update_document) can sneak into the
        // commit point:
        if st.change_count != st.last_commit_change_count {
            st.change_count += 1;
            st.segment_infos.changed();
        }
        let counter = self.writer.segment_counter.load(Ordering::Acquire) as i32;
        if counter > st.segment_infos.counter {
            st.segment_infos.counter = counter;
        }
        let to_commit = st.segment_infos.clone();
        st.pending_commit_change_count = st.change_count;

        // This protects the segment infos we are now going to commit. This
        // is important in case, eg, while we are trying to sync all
        // referenced files, a merge completes which would otherwise have
        // removed the files we are now syncing.
        let files = to_commit.files(false);
        st.deleter.inc_ref_files(&files);
        st.files_to_commit = Some(files);
        debug!("IW: prepare_commit: snapshot {}", segments_string(&to_commit));
        Ok((flushed, seq_no, to_commit))
    }

    /// Commits all pending changes (added and deleted documents, segment
    /// merges, added indexes, etc.) to the index, and syncs all referenced
    /// index files, such that a reader will see the changes and the index
    /// updates will survive an OS or machine crash or power loss.
    ///
    /// If `prepare_commit` was called before, this finishes that commit.
    /// Returns the sequence number of the last operation in the commit.
    pub fn commit(&self) -> Result<u64> {
        self.writer.ensure_open(true)?;
        let res = self.commit_internal();
        self.writer.check_tragic(res, "commit")
    }

    fn commit_internal(&self) -> Result<u64> {
        debug!("IW: commit: start");
        let _l = self.writer.commit_lock.lock()?;
        self.writer.ensure_open(false)?;

        let prepared = {
            let st = self.writer.state.lock()?;
            if st.pending_commit.is_some() {
                Some(st.pending_seq_no)
            } else {
                None
            }
        };
        let seq_no = match prepared {
            Some(seq_no) => {
                debug!("IW: commit: already prepared");
                seq_no
            }
            None => {
                debug!("IW: commit: now prepare");
                self.prepare_commit_internal()?
            }
        };
        self.writer.finish_commit()?;
        debug!("IW: commit: done");
        Ok(seq_no)
    }

    /// Closes all open resources and releases the write lock.
    ///
    /// If `IndexWriterConfig::commit_on_close` is true, this will attempt to
    /// gracefully shut down by writing any changes, waiting for any running
    /// merges, committing, and closing. In this case, note that:
    ///
    /// - If you called `prepare_commit` but failed to call `commit`, this
    ///   method fails with `IllegalState` and the writer is not closed.
    /// - If this method fails with any other error, the writer will be
    ///   closed, but changes may have been lost.
    ///
    /// Otherwise all changes since the last commit are rolled back.
    pub fn close(&self) -> Result<()> {
        debug!("IW: now close");
        let graceful = self.writer.config.commit_on_close && self.writer.tragedy.lock()?.is_none();
        if graceful {
            self.shutdown()
        } else {
            self.rollback()
        }
    }

    fn shutdown(&self) -> Result<()> {
        if self.writer.state.lock()?.pending_commit.is_some() {
            bail!(IllegalState(
                "cannot close: prepare_commit was already called with no corresponding call to \
                 commit"
                    .into()
            ));
        }
        // Ensure that only one thread actually gets to do the closing
        if self.writer.should_close(true)? {
            debug!("IW: now flush at close");
            let res = self
                .flush_internal(true, true)
                .and_then(|_| self.wait_for_merges_internal())
                .and_then(|_| self.commit_internal())
                .and_then(|_| self.writer.rollback_internal());
            let res = self.writer.check_tragic(res, "shutdown");
            if let Err(e) = res {
                if let Err(re) = self.writer.rollback_internal() {
                    warn!("IW: rollback after failed shutdown failed: {}", re);
                }
                return Err(e);
            }
        }
        Ok(())
    }

    /// Close the writer without committing any changes that have occurred
    /// since the last commit (or since it was opened, if commit hasn't been
    /// called). This removes any temporary files that had been created, after
    /// which the state of the index will be the same as it was when commit
    /// was last called or when this writer was first opened. This also clears
    /// a previous call to `prepare_commit`.
    pub fn rollback(&self) -> Result<()> {
        // Ensure that only one thread actually gets to do the closing, and
        // make sure no commit is also in progress:
        if self.writer.should_close(true)? {
            let _l = self.writer.commit_lock.lock()?;
            self.writer.rollback_internal()
        } else {
            Ok(())
        }
    }

    /// Expert: asks the merge policy whether any merges are necessary now and
    /// if so, runs the requested merges through the merge scheduler.
    pub fn maybe_merge(&self) -> Result<()> {
        let res = self.maybe_merge_internal(MergeTrigger::Explicit, None);
        self.writer.check_tragic(res, "maybe_merge")
    }

    fn maybe_merge_internal(
        &self,
        trigger: MergeTrigger,
        max_num_segments: Option<u32>,
    ) -> Result<()> {
        self.writer.ensure_open(false)?;
        let new_merges_found = {
            let mut guard = self.writer.state.lock()?;
            self.writer
                .update_pending_merges(&mut guard, trigger, max_num_segments)?
        };
        self.writer
            .config
            .merge_scheduler
            .merge(self, trigger, new_merges_found)
    }

    /// Expert: the merge scheduler calls this method to retrieve the next
    /// merge requested by the merge policy.
    pub fn next_merge(&self) -> Option<OneMerge> {
        let mut st = match self.writer.state.lock() {
            Ok(st) => st,
            Err(e) => {
                error!("IW: next_merge: {}", e);
                return None;
            }
        };
        let merge = st.pending_merges.pop_front()?;
        // Advance the merge from pending to running
        st.running_merges.insert(merge.id, merge.running_info());
        Some(merge)
    }

    /// Expert: returns true if there are merges waiting to be scheduled.
    pub fn has_pending_merges(&self) -> bool {
        self.writer
            .state
            .lock()
            .map(|st| !st.pending_merges.is_empty())
            .unwrap_or(false)
    }

    /// Unregisters a merge taken by `next_merge` that the scheduler could not
    /// start.
    pub fn abandon_merge(&self, info: &OneMergeRunningInfo) {
        match self.writer.state.lock() {
            Ok(mut st) => {
                for name in &info.segments {
                    st.merging_segments.remove(name);
                }
                st.running_merges.remove(&info.id);
            }
            Err(e) => error!("IW: failed to abandon merge {}: {}", info.id, e),
        }
        self.writer.cond.notify_all();
    }

    /// Merges the indicated segments, replacing them in the stack with a
    /// single segment.
    pub fn merge(&self, mut merge: OneMerge) -> Result<()> {
        let res = self.writer.merge(&mut merge);
        self.writer.check_tragic(res, "merge")
    }

    /// Forces merge policy to merge segments until there are `<=
    /// max_num_segments`. The actual merges to be executed are determined by
    /// the merge policy.
    ///
    /// This is a horribly costly operation, especially when you pass a small
    /// `max_num_segments`; usually you should only call this if the index is
    /// static (will no longer be changed).
    ///
    /// If `do_wait` is true this call blocks until all merges complete, and
    /// re-raises the first error a forced merge hit.
    pub fn force_merge(&self, max_num_segments: u32, do_wait: bool) -> Result<()> {
        self.writer.ensure_open(true)?;
        if max_num_segments < 1 {
            bail!(IllegalArgument(format!(
                "max_num_segments must be >= 1; got {}",
                max_num_segments
            )));
        }
        let res = self.force_merge_internal(max_num_segments, do_wait);
        self.writer.check_tragic(res, "force_merge")
    }

    fn force_merge_internal(&self, max_num_segments: u32, do_wait: bool) -> Result<()> {
        debug!("IW: force_merge: max_num_segments={}", max_num_segments);
        self.flush_internal(true, true)?;
        {
            let mut guard = self.writer.state.lock()?;
            let st = &mut *guard;
            st.merge_exceptions.clear();
            st.merge_gen += 1;
            st.segments_to_merge.clear();
            for info in &st.segment_infos.segments {
                st.segments_to_merge.insert(Arc::clone(info), true);
            }
            st.merge_max_num_segments = max_num_segments;

            // Now mark all pending & running merges for forced merge:
            for merge in st.pending_merges.iter_mut() {
                merge.max_num_segments = Some(max_num_segments);
            }
            for info in st.running_merges.values_mut() {
                info.max_num_segments = Some(max_num_segments);
            }
        }

        self.maybe_merge_internal(MergeTrigger::Explicit, Some(max_num_segments))?;

        if do_wait {
            let mut guard = self.writer.state.lock()?;
            loop {
                if let Some(ref tragedy) = *self.writer.tragedy.lock()? {
                    bail!(IllegalState(format!(
                        "this writer hit an unrecoverable error; cannot complete force_merge: {}",
                        tragedy
                    )));
                }
                if let Some(failure) = guard.merge_exceptions.iter().find(|f| f.forced) {
                    bail!(RuntimeError(format!(
                        "background merge hit exception: {}: {}",
                        failure.segments, failure.message
                    )));
                }
                if !guard.has_forced_merges() {
                    break;
                }
                guard = self.writer.do_wait(guard)?;
            }
        }

        // If close is called while we are still running, fail with
        // AlreadyClosed to let the caller know the merge did not finish.
        self.writer.ensure_open(true)
    }

    /// Forces merging of all segments that have deleted documents. The
    /// actual merges to be executed are determined by the merge policy.
    pub fn force_merge_deletes(&self, do_wait: bool) -> Result<()> {
        self.writer.ensure_open(true)?;
        let res = self.force_merge_deletes_internal(do_wait);
        self.writer.check_tragic(res, "force_merge_deletes")
    }

    fn force_merge_deletes_internal(&self, do_wait: bool) -> Result<()> {
        self.flush_internal(true, true)?;
        debug!("IW: force_merge_deletes: do_wait={}", do_wait);

        let ids = {
            let mut guard = self.writer.state.lock()?;
            let st = &mut *guard;
            st.merge_exceptions.clear();
            st.merge_gen += 1;
            let spec = {
                let ctx = self.writer.merge_context(st);
                self.writer
                    .config
                    .merge_policy
                    .find_forced_deletes_merges(&st.segment_infos, &ctx)?
            };
            let mut ids = HashSet::new();
            if let Some(spec) = spec {
                for merge in spec.merges {
                    let id = merge.id;
                    if self.writer.register_merge(st, merge)? {
                        ids.insert(id);
                    }
                }
            }
            ids
        };

        self.writer
            .config
            .merge_scheduler
            .merge(self, MergeTrigger::Explicit, !ids.is_empty())?;

        if do_wait && !ids.is_empty() {
            let mut guard = self.writer.state.lock()?;
            loop {
                if let Some(ref tragedy) = *self.writer.tragedy.lock()? {
                    bail!(IllegalState(format!(
                        "this writer hit an unrecoverable error; cannot complete \
                         force_merge_deletes: {}",
                        tragedy
                    )));
                }
                if let Some(failure) = guard.merge_exceptions.iter().find(|f| ids.contains(&f.id))
                {
                    bail!(RuntimeError(format!(
                        "background merge hit exception: {}: {}",
                        failure.segments, failure.message
                    )));
                }
                let running = guard.pending_merges.iter().any(|m| ids.contains(&m.id))
                    || guard.running_merges.keys().any(|id| ids.contains(id));
                if !running {
                    break;
                }
                guard = self.writer.do_wait(guard)?;
            }
        }
        Ok(())
    }

    /// Wait for any currently outstanding merges to finish.
    ///
    /// It is guaranteed that any merges started prior to calling this method
    /// will have completed once this method completes.
    pub fn wait_for_merges(&self) -> Result<()> {
        let res = self.wait_for_merges_internal();
        self.writer.check_tragic(res, "wait_for_merges")
    }

    fn wait_for_merges_internal(&self) -> Result<()> {
        // Give merge scheduler last chance to run, in case any pending merges
        // are waiting. We can't hold the writer lock when going into
        // merge because it can lead to deadlock.
        self.writer
            .config
            .merge_scheduler
            .merge(self, MergeTrigger::Closing, false)?;

        let mut guard = self.writer.state.lock()?;
        self.writer.ensure_open(false)?;
        debug!("IW: wait_for_merges");
        while !guard.pending_merges.is_empty() || !guard.running_merges.is_empty() {
            guard = self.writer.do_wait(guard)?;
        }
        debug!("IW: wait_for_merges done");
        Ok(())
    }

    /// Expert: returns a near-real-time reader on the index, covering every
    /// change made through this writer so far, committed or not.
    ///
    /// The reader holds its own snapshot of the live docs: later deletes
    /// through this writer are not visible to it. Opening the reader enables
    /// reader pooling on the writer, so the segment readers are shared with
    /// future merges and NRT reopens.
    pub fn get_reader(&self, apply_all_deletes: bool) -> Result<StandardDirectoryReader> {
        self.writer.ensure_open(true)?;
        let res = self.open_nrt_reader(apply_all_deletes);
        self.writer.check_tragic(res, "get_reader")
    }

    fn open_nrt_reader(&self, apply_all_deletes: bool) -> Result<StandardDirectoryReader> {
        let start = Instant::now();
        debug!("IW: flush at get_reader");
        self.writer.reader_pool.enable_reader_pooling();

        let (any_changes, reader) = {
            let _l = self.writer.full_flush_lock.lock()?;
            let res = self.flush_and_open_reader(apply_all_deletes);
            let finished = self.writer.doc_writer.finish_full_flush(res.is_ok());
            let opened = res?;
            finished?;
            opened
        };
        self.process_events(false)?;
        if any_changes {
            self.maybe_merge_internal(MergeTrigger::FullFlush, None)?;
        }
        debug!("IW: get_reader took {:?}", start.elapsed());
        Ok(reader)
    }

    fn flush_and_open_reader(
        &self,
        apply_all_deletes: bool,
    ) -> Result<(bool, StandardDirectoryReader)> {
        let (flushed, _) = self.writer.doc_writer.flush_all_threads(&*self.writer)?;

        let mut guard = self.writer.state.lock()?;
        let st = &mut *guard;
        let applied = self.writer.maybe_apply_deletes(st, apply_all_deletes)?;
        let infos = st.segment_infos.clone();
        let live = st.segment_infos.segments.clone();
        let mut readers = Vec::with_capacity(live.len());
        for info in &live {
            let rld = match self.writer.reader_pool.get(info, true)? {
                Some(rld) => rld,
                None => bail!(IllegalState(format!("no pooled reader for {}", info.name()))),
            };
            let reader = rld.get_readonly_clone(&IOContext::READ);
            if self.writer.reader_pool.release(&rld)? {
                st.checkpoint_no_sis()?;
            }
            readers.push(reader?);
        }
        debug!(
            "IW: return reader version={} reader={}",
            infos.version,
            segments_string(&infos)
        );
        let reader = StandardDirectoryReader::new(
            Arc::clone(&self.writer.directory_orig),
            readers,
            infos,
            apply_all_deletes,
        )?;
        Ok((flushed || applied, reader))
    }

    /// Returns total number of docs in this index, including docs not yet
    /// flushed (still in the RAM buffer), not counting deletions.
    pub fn max_doc(&self) -> Result<u32> {
        self.writer.ensure_open(false)?;
        let st = self.writer.state.lock()?;
        Ok(self.writer.doc_writer.num_docs() + st.segment_infos.total_max_doc() as u32)
    }

    /// Returns total number of docs in this index, including docs not yet
    /// flushed (still in the RAM buffer), and including deletions.
    ///
    /// NOTE: buffered deletions are not counted. If you really need these to
    /// be counted you should call `commit` first.
    pub fn num_docs(&self) -> Result<u32> {
        self.writer.ensure_open(false)?;
        let st = self.writer.state.lock()?;
        let mut count = self.writer.doc_writer.num_docs();
        for info in &st.segment_infos.segments {
            let deleted = self.writer.reader_pool.num_deleted_docs(info)?;
            count += (info.info.max_doc() - deleted) as u32;
        }
        Ok(count)
    }

    /// Number of segments in the current (uncommitted) segment list.
    pub fn segment_count(&self) -> Result<usize> {
        Ok(self.writer.state.lock()?.segment_infos.len())
    }

    /// Returns true if there may be changes that have not been committed.
    pub fn has_uncommitted_changes(&self) -> Result<bool> {
        let changed = {
            let st = self.writer.state.lock()?;
            st.change_count != st.last_commit_change_count
        };
        Ok(changed
            || self.writer.doc_writer.any_changes()
            || self.writer.buffered_updates_stream.any())
    }
}

impl Drop for IndexWriter {
    fn drop(&mut self) {
        if Arc::strong_count(&self.writer) == 1 && !self.writer.closed.load(Ordering::Acquire) {
            if let Err(e) = self.close() {
                error!("IW: close on drop failed: {}", e);
            }
        }
    }
}

impl IndexWriterInner {
    fn new(
        directory_orig: Arc<dyn Directory>,
        config: Arc<IndexWriterConfig>,
        write_lock: Arc<dyn Lock>,
    ) -> Result<Self> {
        let directory: Arc<dyn Directory> = Arc::new(LockValidatingDirectoryWrapper::new(
            Arc::clone(&directory_orig),
            Arc::clone(&write_lock),
        ));

        // list_all before we write anything in the directory
        let files = directory_orig.list_all()?;
        let index_exists = index_exists(directory_orig.as_ref())?;
        let create = match config.open_mode {
            OpenMode::Create => true,
            OpenMode::Append => false,
            OpenMode::CreateOrAppend => !index_exists,
        };

        let mut change_count = 0;
        let mut segment_infos = if create {
            // Try to read first. This is to allow create against an index
            // that's currently open for searching. In this case we write the
            // next segments_N file with no segments:
            let mut infos = if index_exists {
                match SegmentInfos::read_latest_commit(&directory_orig, &config.codec) {
                    Ok(mut infos) => {
                        infos.clear();
                        infos
                    }
                    Err(e) => {
                        debug!("IW: could not read existing commit, start fresh: {}", e);
                        SegmentInfos::default()
                    }
                }
            } else {
                SegmentInfos::default()
            };
            // Record that we have a change (zero out all segments) pending:
            infos.changed();
            change_count += 1;
            infos
        } else {
            let infos = SegmentInfos::read_latest_commit(&directory_orig, &config.codec)?;
            debug!("IW: init: loaded commit gen={}", infos.generation);
            infos
        };

        let rollback_segments = segment_infos.create_backup_segment_infos();

        // Default deleter (for backwards compatibility) is
        // KeepOnlyLastCommitDeleter:
        let deleter = IndexFileDeleter::new(
            &files,
            Arc::clone(&directory_orig),
            Arc::clone(&directory),
            &config.codec,
            Arc::clone(&config.deletion_policy),
            &mut segment_infos,
            index_exists,
        )?;
        if deleter.starting_commit_deleted() {
            // Deletion policy deleted the "head" commit point. We have to mark
            // ourself as changed so that if we are closed w/o any further
            // changes we write a new segments_N file.
            segment_infos.changed();
            change_count += 1;
        }

        let segment_counter = Arc::new(AtomicU64::new(segment_infos.counter.max(0) as u64));
        let pending_num_docs = Arc::new(AtomicI64::new(segment_infos.total_max_doc()));
        let buffered_updates_stream = Arc::new(BufferedUpdatesStream::default());
        let doc_writer = DocumentsWriter::new(
            Arc::clone(&config),
            Arc::clone(&directory_orig),
            Arc::clone(&directory),
            Arc::clone(&buffered_updates_stream),
            Arc::clone(&pending_num_docs),
            Arc::clone(&segment_counter),
        );
        let reader_pool = ReaderPool::new(Arc::clone(&directory), config.reader_pooling);

        debug!(
            "IW: init: create={} segments={} config={:?}",
            create,
            segments_string(&segment_infos),
            config
        );

        let state = WriterState {
            segment_infos,
            rollback_segments,
            deleter,
            change_count,
            last_commit_change_count: 0,
            pending_commit_change_count: 0,
            pending_commit: None,
            pending_seq_no: 0,
            files_to_commit: None,
            segments_to_merge: HashMap::new(),
            merge_max_num_segments: 0,
            merging_segments: HashSet::new(),
            pending_merges: VecDeque::new(),
            running_merges: HashMap::new(),
            merge_exceptions: vec![],
            merge_gen: 0,
            stop_merges: false,
        };

        Ok(IndexWriterInner {
            config,
            directory_orig,
            directory,
            write_lock: Mutex::new(Some(write_lock)),
            state: Mutex::new(state),
            cond: Condvar::new(),
            closed: AtomicBool::new(false),
            closing: AtomicBool::new(false),
            tragedy: Mutex::new(None),
            doc_writer,
            buffered_updates_stream,
            reader_pool,
            pending_num_docs,
            segment_counter,
            merge_id_gen: AtomicU32::new(0),
            commit_lock: Mutex::new(()),
            full_flush_lock: Mutex::new(()),
        })
    }

    /// Used internally to throw an `AlreadyClosed` if this writer has been
    /// closed or is in the process of closing.
    ///
    /// `fail_if_closing`: if true, also fail when the writer is in the
    /// process of closing (`closing == true`) but not yet done closing
    /// (`closed == false`).
    fn ensure_open(&self, fail_if_closing: bool) -> Result<()> {
        if let Some(ref tragedy) = *self.tragedy.lock()? {
            bail!(AlreadyClosed(format!(
                "this IndexWriter is closed, tragedy: {}",
                tragedy
            )));
        }
        if self.closed.load(Ordering::Acquire)
            || (fail_if_closing && self.closing.load(Ordering::Acquire))
        {
            bail!(AlreadyClosed("this IndexWriter is closed".into()));
        }
        Ok(())
    }

    /// Returns true if this thread should attempt to close, or false if the
    /// writer is already closed (or, if that flag is set, is being closed by
    /// another thread).
    fn should_close(&self, wait_for_close: bool) -> Result<bool> {
        let mut guard = self.state.lock()?;
        loop {
            if self.closed.load(Ordering::Acquire) {
                return Ok(false);
            }
            if !self.closing.load(Ordering::Acquire) {
                // We get to close
                self.closing.store(true, Ordering::Release);
                return Ok(true);
            }
            if !wait_for_close {
                return Ok(false);
            }
            // Another thread is presently trying to close; wait until it
            // finishes one way (closes successfully) or another (fails to
            // close)
            guard = self.do_wait(guard)?;
        }
    }

    fn do_wait<'a>(
        &self,
        guard: MutexGuard<'a, WriterState>,
    ) -> Result<MutexGuard<'a, WriterState>> {
        // The timeout guards against a notify we might have missed.
        let (guard, _) = self.cond.wait_timeout(guard, Duration::from_secs(1))?;
        Ok(guard)
    }

    /// Returns `res` unchanged, recording a tragic event and rolling back
    /// first if it carries an unrecoverable error. Never call this while
    /// holding the writer lock.
    fn check_tragic<T>(&self, res: Result<T>, location: &str) -> Result<T> {
        if let Err(ref e) = res {
            if e.is_tragic() {
                if let Err(te) = self.tragic_event(e, location) {
                    warn!("IW: handling tragic event hit error: {}", te);
                }
            }
        }
        res
    }

    fn tragic_event(&self, e: &Error, location: &str) -> Result<()> {
        error!("IW: hit tragic error inside {}: {}", location, e);
        {
            let mut tragedy = self.tragedy.lock()?;
            // the first tragedy wins
            if tragedy.is_none() {
                *tragedy = Some(e.to_string());
            }
        }
        self.cond.notify_all();
        // if we are already closed (e.g. called by rollback), this will be a
        // no-op.
        if self.should_close(false)? {
            self.rollback_internal()?;
        }
        Ok(())
    }

    fn purge(&self, forced: bool) -> Result<u32> {
        self.doc_writer.purge_buffer(self, forced)
    }

    fn merge_context<'a>(&'a self, st: &'a WriterState) -> WriterMergeContext<'a> {
        WriterMergeContext {
            merging_segments: &st.merging_segments,
            reader_pool: &self.reader_pool,
            merge_id_gen: &self.merge_id_gen,
        }
    }

    fn maybe_apply_deletes(&self, st: &mut WriterState, apply_all_deletes: bool) -> Result<bool> {
        if apply_all_deletes {
            debug!("IW: apply all deletes during flush");
            self.apply_all_deletes_and_update(st)?;
            return Ok(true);
        }
        debug!(
            "IW: don't apply deletes now del_terms={} bytes_used={}",
            self.buffered_updates_stream.num_terms(),
            self.buffered_updates_stream.ram_bytes_used()
        );
        Ok(false)
    }

    fn apply_all_deletes_and_update(&self, st: &mut WriterState) -> Result<()> {
        let result = self
            .buffered_updates_stream
            .apply_deletes_and_updates(&self.reader_pool, &st.segment_infos.segments)?;
        if result.any_deletes {
            st.checkpoint()?;
        }
        if !result.all_deleted.is_empty() {
            let mut dropped = false;
            for info in &result.all_deleted {
                // If a merge has already registered for this segment, we
                // leave it in the segment list. It will be dropped from the
                // merged segment when the merge commits.
                if st.merging_segments.contains(info.name()) {
                    continue;
                }
                debug!("IW: drop 100% deleted segment {}", info);
                st.segment_infos.remove(info);
                st.segments_to_merge.remove(info);
                self.pending_num_docs
                    .fetch_sub(i64::from(info.info.max_doc()), Ordering::AcqRel);
                self.reader_pool.drop(info)?;
                dropped = true;
            }
            if dropped {
                st.checkpoint()?;
            }
        }
        self.buffered_updates_stream.prune(&st.segment_infos)
    }

    /// Skips the commit if nothing changed since the last one. Otherwise
    /// writes pending_segments_N and syncs every file it references.
    fn start_commit(&self, mut to_commit: SegmentInfos) -> Result<()> {
        {
            let mut guard = self.state.lock()?;
            let st = &mut *guard;
            if st.pending_commit_change_count == st.last_commit_change_count {
                debug!("IW: skip start_commit(): no changes pending");
                if let Some(files) = st.files_to_commit.take() {
                    st.deleter.dec_ref_files(&files);
                }
                return Ok(());
            }
            debug!(
                "IW: start_commit index={} change_count={}",
                segments_string(&to_commit),
                st.change_count
            );
        }

        // Exception here means nothing is prepared (this method unwinds
        // everything it did on an exception)
        let res = match to_commit.prepare_commit(self.directory.as_ref()) {
            Ok(()) => {
                let files = to_commit.files(false);
                self.directory.sync(&files)
            }
            Err(e) => Err(e),
        };

        let mut guard = self.state.lock()?;
        let st = &mut *guard;
        match res {
            Ok(()) => {
                debug!("IW: done all syncs: {}", segments_string(&to_commit));
                st.pending_commit = Some(to_commit);
                Ok(())
            }
            Err(e) => {
                debug!("IW: hit error committing segments file: {}", e);
                to_commit.rollback_commit(self.directory.as_ref());
                // Hit exception
                if let Some(files) = st.files_to_commit.take() {
                    st.deleter.dec_ref_files(&files);
                }
                Err(e)
            }
        }
    }

    fn finish_commit(&self) -> Result<()> {
        let mut guard = self.state.lock()?;
        let st = &mut *guard;
        let mut pending = match st.pending_commit.take() {
            Some(pending) => pending,
            None => {
                debug!("IW: commit: pending_commit is None; skip");
                return Ok(());
            }
        };
        debug!("IW: commit: pending_commit is set");

        let res = match pending.finish_commit(self.directory.as_ref()) {
            Ok(segments_file) => {
                debug!("IW: commit: wrote segments file {}", segments_file);
                // we committed, if anything goes wrong after this, we are
                // screwed and it's a tragedy:
                st.deleter.checkpoint(&pending, true)
            }
            Err(e) => Err(e),
        };
        if res.is_ok() {
            st.segment_infos.update_generation(&pending);
            st.last_commit_change_count = st.pending_commit_change_count;
            st.rollback_segments = pending.create_backup_segment_infos();
        }
        // Matches the inc_ref done in prepare_commit:
        if let Some(files) = st.files_to_commit.take() {
            st.deleter.dec_ref_files(&files);
        }
        self.cond.notify_all();
        res
    }

    fn rollback_internal(&self) -> Result<()> {
        debug!("IW: rollback");
        let res = self.do_rollback_internal();
        if let Err(ref e) = res {
            warn!("IW: rollback hit error, still close: {}", e);
            // Must not hold the writer lock while closing the scheduler
            if let Err(se) = self.config.merge_scheduler.close() {
                warn!("IW: failed to close merge scheduler: {}", se);
            }
            if let Ok(mut guard) = self.state.lock() {
                let st = &mut *guard;
                if let Some(mut pending) = st.pending_commit.take() {
                    pending.rollback_commit(self.directory.as_ref());
                    if let Some(files) = st.files_to_commit.take() {
                        st.deleter.dec_ref_files(&files);
                    }
                }
                if let Err(pe) = self.reader_pool.drop_all(false) {
                    warn!("IW: failed to drop pooled readers: {}", pe);
                }
                st.deleter.close();
            }
            if let Err(le) = self.close_write_lock() {
                warn!("IW: failed to release {}: {}", WRITE_LOCK_NAME, le);
            }
        }
        {
            // waiters in should_close check these flags under the writer lock
            let _guard = self.state.lock();
            self.closed.store(true, Ordering::Release);
            self.closing.store(false, Ordering::Release);
        }
        // So any "concurrently closing" threads wake up and see that the
        // close has now completed:
        self.cond.notify_all();
        res
    }

    fn do_rollback_internal(&self) -> Result<()> {
        {
            let guard = self.state.lock()?;
            self.abort_merges(guard)?;
        }
        debug!("IW: rollback: done finish merges");

        // Must pre-close in case it increments changeCount so that we can
        // then set it to false before calling rollback_internal
        self.config.merge_scheduler.close()?;
        self.buffered_updates_stream.clear()?;
        // mark it as closed first to prevent subsequent indexing actions
        self.doc_writer.close()?;
        // don't sync on the writer here
        self.doc_writer.abort()?;

        let mut guard = self.state.lock()?;
        let st = &mut *guard;
        if let Some(mut pending) = st.pending_commit.take() {
            pending.rollback_commit(self.directory.as_ref());
            if let Some(files) = st.files_to_commit.take() {
                st.deleter.dec_ref_files(&files);
            }
            self.cond.notify_all();
        }
        self.reader_pool.drop_all(false)?;

        // Keep the same segment_infos instance but replace all of its
        // SegmentInfo instances so IndexFileDeleter will know about the
        // change
        let restored = st
            .rollback_segments
            .iter()
            .map(|info| Arc::new(info.as_ref().clone()))
            .collect();
        st.segment_infos.rollback_segment_infos(restored);
        self.pending_num_docs
            .store(st.segment_infos.total_max_doc(), Ordering::Release);
        debug!("IW: rollback: infos={}", segments_string(&st.segment_infos));

        if self.tragedy.lock()?.is_none() {
            // Ask deleter to locate unreferenced files & remove them ... only
            // when we are not experiencing a tragedy, else these methods
            // throw ACE:
            st.deleter.checkpoint(&st.segment_infos, false)?;
            st.deleter.refresh(None)?;
        }
        st.deleter.close();
        st.last_commit_change_count = st.change_count;
        self.closed.store(true, Ordering::Release);
        drop(guard);

        self.close_write_lock()
    }

    fn close_write_lock(&self) -> Result<()> {
        let lock = self.write_lock.lock()?.take();
        if let Some(lock) = lock {
            lock.close()?;
        }
        Ok(())
    }

    /// Aborts running merges and drops pending ones. Waits for the running
    /// merges to notice the abort and unregister before returning the guard.
    fn abort_merges<'a>(
        &self,
        mut guard: MutexGuard<'a, WriterState>,
    ) -> Result<MutexGuard<'a, WriterState>> {
        guard.stop_merges = true;

        // Abort all pending & running merges:
        while let Some(merge) = guard.pending_merges.pop_front() {
            debug!("IW: now abort pending merge {}", merge.seg_string());
            merge.rate_limiter.set_abort();
            self.merge_finish(&mut guard, &merge);
        }
        for info in guard.running_merges.values() {
            debug!("IW: now abort running merge {}", info.id);
            info.rate_limiter.set_abort();
        }

        // We wait here to make all merges stop. It should not take very long
        // because they periodically check if they are aborted.
        while !guard.running_merges.is_empty() {
            debug!(
                "IW: now wait for {} running merge(s) to abort",
                guard.running_merges.len()
            );
            guard = self.do_wait(guard)?;
        }
        self.cond.notify_all();
        debug!("IW: all running merges have aborted");
        Ok(guard)
    }

    /// Does finishing for a merge, which is fast but holds the writer lock.
    fn merge_finish(&self, st: &mut WriterState, merge: &OneMerge) {
        // forceMerge, addIndexes or waitForMerges may be waiting on merges
        // to finish.
        self.cond.notify_all();
        // It's possible we are called twice, eg if there was an exception
        // inside merge_init
        if merge.register_done {
            for info in &merge.segments {
                st.merging_segments.remove(info.name());
            }
        }
        st.running_merges.remove(&merge.id);
    }

    fn update_pending_merges(
        &self,
        st: &mut WriterState,
        trigger: MergeTrigger,
        max_num_segments: Option<u32>,
    ) -> Result<bool> {
        // In case infoStream was disabled on init, but then enabled at some
        // point, try again to log the config here:
        if st.stop_merges || self.tragedy.lock()?.is_some() {
            return Ok(false);
        }
        let spec = {
            let ctx = self.merge_context(st);
            match max_num_segments {
                Some(max) => self.config.merge_policy.find_forced_merges(
                    &st.segment_infos,
                    max,
                    &st.segments_to_merge,
                    &ctx,
                )?,
                None => self
                    .config
                    .merge_policy
                    .find_merges(trigger, &st.segment_infos, &ctx)?,
            }
        };
        let mut new_merges_found = false;
        if let Some(spec) = spec {
            for mut merge in spec.merges {
                if max_num_segments.is_some() {
                    merge.max_num_segments = max_num_segments;
                }
                new_merges_found |= self.register_merge(st, merge)?;
            }
        }
        Ok(new_merges_found)
    }

    /// Checks whether this merge involves any segments already participating
    /// in a merge. If not, this merge is "registered", meaning we record that
    /// its segments are now participating in a merge, and true is returned.
    /// Else (the merge conflicts) false is returned.
    fn register_merge(&self, st: &mut WriterState, mut merge: OneMerge) -> Result<bool> {
        if merge.register_done {
            return Ok(true);
        }
        if st.stop_merges {
            merge.rate_limiter.set_abort();
            bail!(MergeAborted(format!("merge is aborted: {}", merge.seg_string())));
        }
        for info in &merge.segments {
            if st.merging_segments.contains(info.name()) {
                debug!(
                    "IW: reject merge {}: segment {} is already marked for merge",
                    merge.seg_string(),
                    info.name()
                );
                return Ok(false);
            }
            if !st.segment_infos.contains(info) {
                debug!(
                    "IW: reject merge {}: segment {} does not exist in live infos",
                    merge.seg_string(),
                    info.name()
                );
                return Ok(false);
            }
        }

        merge.merge_gen = st.merge_gen;
        if merge
            .segments
            .iter()
            .any(|info| st.segments_to_merge.contains_key(info))
        {
            merge.max_num_segments = Some(st.merge_max_num_segments);
        }

        let mut estimated_merge_bytes = 0u64;
        let mut total_merge_bytes = 0u64;
        for info in &merge.segments {
            st.merging_segments.insert(info.name().to_string());
            let size = info.size_in_bytes().max(0) as u64;
            total_merge_bytes += size;
            let max_doc = info.info.max_doc();
            let del_ratio = if max_doc <= 0 {
                0.0
            } else {
                f64::from(self.reader_pool.num_deleted_docs(info)?) / f64::from(max_doc)
            };
            estimated_merge_bytes += (size as f64 * (1.0 - del_ratio)) as u64;
        }
        merge.estimated_merge_bytes = estimated_merge_bytes;
        merge.total_merge_bytes = total_merge_bytes;
        merge.register_done = true;

        debug!(
            "IW: add merge to pending_merges: {} [total {} pending]",
            merge.seg_string(),
            st.pending_merges.len() + 1
        );
        st.pending_merges.push_back(merge);
        Ok(true)
    }

    /// Runs one merge end to end on the calling thread.
    fn merge(&self, merge: &mut OneMerge) -> Result<()> {
        let res = match self.merge_init(merge) {
            Ok(()) => {
                debug!("IW: now merge {}", merge.seg_string());
                self.merge_middle(merge)
            }
            Err(e) => Err(e),
        };
        self.finish_merge(merge, res)
    }

    /// Unregisters a merge after it ran, whatever the outcome, and looks for
    /// merges that may now cascade.
    fn finish_merge(&self, merge: &mut OneMerge, res: Result<()>) -> Result<()> {
        let mut guard = self.state.lock()?;
        let st = &mut *guard;
        if res.is_err() || merge.is_aborted() {
            if let Err(e) = self.close_merge_readers(st, merge, false) {
                warn!(
                    "IW: failed to close merge readers of {}: {}",
                    merge.seg_string(),
                    e
                );
            }
        }
        let max_num_segments = st
            .running_merges
            .get(&merge.id)
            .and_then(|info| info.max_num_segments)
            .or(merge.max_num_segments);
        self.merge_finish(st, merge);

        match res {
            Err(e) => {
                debug!("IW: hit error during merge {}: {}", merge.seg_string(), e);
                if let Some(ref info) = merge.info {
                    if !st.segment_infos.contains(info) {
                        if let Err(re) = st.deleter.refresh(Some(info.name())) {
                            warn!("IW: failed to remove files of {}: {}", info.name(), re);
                        }
                    }
                }
                if e.is_merge_aborted() || merge.is_aborted() {
                    debug!("IW: merge {} aborted", merge.seg_string());
                    return Ok(());
                }
                if merge.merge_gen == st.merge_gen {
                    st.merge_exceptions.push(MergeFailure {
                        id: merge.id,
                        segments: merge.seg_string(),
                        message: e.to_string(),
                        forced: max_num_segments.is_some(),
                    });
                }
                Err(e)
            }
            Ok(()) => {
                if merge.info.is_some()
                    && !merge.is_aborted()
                    && (max_num_segments.is_some()
                        || (!self.closed.load(Ordering::Acquire)
                            && !self.closing.load(Ordering::Acquire)))
                {
                    // This merge (and, generally, any change to the segments)
                    // may now enable new merges, so we call merge policy &
                    // update pending merges.
                    self.update_pending_merges(st, MergeTrigger::MergeFinished, max_num_segments)?;
                }
                if let Some(start) = merge.merge_start_time {
                    debug!(
                        "IW: merge time {:?} for {} docs",
                        start.elapsed(),
                        merge.total_max_doc
                    );
                }
                Ok(())
            }
        }
    }

    /// Does initial setup for a merge, which is fast but holds the writer
    /// lock.
    fn merge_init(&self, merge: &mut OneMerge) -> Result<()> {
        let mut guard = self.state.lock()?;
        let st = &mut *guard;
        if let Some(ref tragedy) = *self.tragedy.lock()? {
            bail!(IllegalState(format!(
                "this writer hit an unrecoverable error; cannot merge: {}",
                tragedy
            )));
        }
        if merge.info.is_some() {
            // merge_init already done
            return Ok(());
        }
        merge.merge_start_time = Some(Instant::now());
        if merge.is_aborted() {
            return Ok(());
        }

        // Lock order: IW -> BD
        let result = self
            .buffered_updates_stream
            .apply_deletes_and_updates(&self.reader_pool, &merge.segments)?;
        if result.any_deletes {
            st.checkpoint()?;
        }
        if !result.all_deleted.is_empty() {
            for info in &result.all_deleted {
                debug!("IW: drop 100% deleted segment {}", info.name());
                st.segment_infos.remove(info);
                st.segments_to_merge.remove(info);
                st.merging_segments.remove(info.name());
                self.pending_num_docs
                    .fetch_sub(i64::from(info.info.max_doc()), Ordering::AcqRel);
                merge.segments.retain(|s| s.name() != info.name());
                self.reader_pool.drop(info)?;
            }
            st.checkpoint()?;
        }

        // Bind a new segment name here so even with ConcurrentMergePolicy we
        // keep deterministic segment names.
        let name = new_segment_name(&self.segment_counter);
        let mut diagnostics = HashMap::new();
        diagnostics.insert("source".to_string(), SOURCE_MERGE.to_string());
        diagnostics.insert("merge_factor".to_string(), merge.segments.len().to_string());
        if let Some(max) = merge.max_num_segments {
            diagnostics.insert("merge_max_num_segments".to_string(), max.to_string());
        }
        diagnostics.insert("os".to_string(), env::consts::OS.to_string());
        diagnostics.insert(
            "sediment.version".to_string(),
            env!("CARGO_PKG_VERSION").to_string(),
        );
        let si = SegmentInfo::new(
            &name,
            -1,
            Arc::clone(&self.directory_orig),
            false,
            Arc::clone(&self.config.codec),
            diagnostics,
            random_id(),
        );
        let info = Arc::new(SegmentCommitInfo::new(Arc::new(si), 0, -1));
        // Lock order: IW -> BD
        info.set_buffered_deletes_gen(result.gen as i64);
        debug!("IW: merge seg={} {}", name, merge.seg_string());
        merge.info = Some(info);
        self.buffered_updates_stream.prune(&st.segment_infos)
    }

    fn merge_middle(&self, merge: &mut OneMerge) -> Result<()> {
        merge.check_aborted()?;
        if merge.info.is_none() {
            return Ok(());
        }
        self.open_merge_readers(merge)?;
        merge.check_aborted()?;
        self.write_merged_segment(merge)
    }

    /// Opens (or reuses) a pooled reader for each segment of the merge and
    /// snapshots its live docs under the writer lock. Deletes arriving after
    /// the snapshot are carried over in `commit_merge`.
    fn open_merge_readers(&self, merge: &mut OneMerge) -> Result<()> {
        let context = IOContext::Merge(merge.store_merge_info());
        let segments = merge.segments.clone();
        for info in &segments {
            let rld = match self.reader_pool.get(info, true)? {
                Some(rld) => rld,
                None => bail!(IllegalState(format!(
                    "no pooled reader for merging segment {}",
                    info.name()
                ))),
            };
            let res = {
                // Hold the writer lock so deletes can not sneak in between
                // opening the reader and capturing its live docs.
                let _guard = self.state.lock()?;
                rld.reader_for_merge(&context)
                    .and_then(|reader| Ok((reader, rld.readonly_live_docs()?)))
            };
            match res {
                Ok((reader, live_docs)) => {
                    merge.readers.push(reader);
                    merge.live_docs_at_start.push(live_docs);
                }
                Err(e) => {
                    if let Err(re) = self.reader_pool.release(&rld) {
                        warn!("IW: failed to release reader of {}: {}", info.name(), re);
                    }
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    fn write_merged_segment(&self, merge: &mut OneMerge) -> Result<()> {
        let merged = merged_info(merge)?;
        let context = IOContext::Merge(merge.store_merge_info());

        // This is try/finally to make sure merger's readers are closed:
        let rate_limiter: Arc<dyn RateLimiter> = merge.rate_limiter.clone();
        let merge_directory: Arc<dyn Directory> = Arc::new(RateLimitFilterDirectory::new(
            Arc::clone(&self.directory),
            rate_limiter,
        ));
        let tracking = Arc::new(TrackingDirectoryWrapper::new(Arc::clone(&merge_directory)));
        let merger = SegmentMerger::new(
            merge.readers.clone(),
            merge.live_docs_at_start.clone(),
            Arc::clone(&merged.info),
            Arc::clone(&tracking) as Arc<dyn Directory>,
            context,
        )?;
        merge.check_aborted()?;

        if merger.should_merge() {
            let merged_docs = merger.merge()?;
            debug!(
                "IW: merge codec={} max_doc={} merged_docs={}",
                merged.info.codec.name(),
                merged.info.max_doc(),
                merged_docs
            );
        }
        merged.info.set_files(&tracking.create_files()?)?;
        let doc_maps = merger.merge_state.doc_maps.clone();

        if !merger.should_merge() {
            // Merge would produce a 0-doc segment, so we do nothing except
            // commit the merge to remove all the 0-doc segments that we
            // "merged":
            debug!("IW: merge away fully deleted segments");
            let mut guard = self.state.lock()?;
            self.commit_merge(&mut guard, merge, &doc_maps)?;
            return Ok(());
        }

        let use_compound_file = {
            let guard = self.state.lock()?;
            let ctx = self.merge_context(&guard);
            self.config
                .merge_policy
                .use_compound_file(&guard.segment_infos, &merged, &ctx)
        };
        if use_compound_file {
            debug!("IW: create compound file for {}", merged.name());
            let files_to_remove = merged.files();
            let cfs_dir = TrackingDirectoryWrapper::new(Arc::clone(&merge_directory));
            merged
                .info
                .codec
                .compound_format()
                .write(&cfs_dir, &merged.info, &context)?;
            merged.info.set_files(&cfs_dir.create_files()?)?;

            let mut guard = self.state.lock()?;
            // delete the original files, they were never incRef'd by the
            // deleter
            guard.deleter.delete_new_files(&files_to_remove);
            if merge.is_aborted() {
                debug!("IW: abort merge after building CFS");
                guard.deleter.delete_new_files(&merged.files());
                return Ok(());
            }
            merged.info.set_use_compound_file(true);
        }

        // Have codec write SegmentInfo. Must do this after creating CFS so
        // that 1) .si isn't slurped into CFS, and 2) .si reflects
        // use_compound_file=true change above:
        merged
            .info
            .codec
            .segment_info_format()
            .write(self.directory.as_ref(), &merged.info, &context)?;

        let mut guard = self.state.lock()?;
        self.commit_merge(&mut guard, merge, &doc_maps)?;
        Ok(())
    }

    /// Carries over deletes that hit the merged segments while the merge ran
    /// and splices the merged segment into the segment list. Returns false if
    /// the merge was aborted instead.
    fn commit_merge(
        &self,
        st: &mut WriterState,
        merge: &mut OneMerge,
        doc_maps: &[Arc<LiveDocsDocMap>],
    ) -> Result<bool> {
        if let Some(ref tragedy) = *self.tragedy.lock()? {
            bail!(IllegalState(format!(
                "this writer hit an unrecoverable error; cannot complete merge: {}",
                tragedy
            )));
        }
        let merged = merged_info(merge)?;
        debug!(
            "IW: commit_merge: {} index={}",
            merge.seg_string(),
            segments_string(&st.segment_infos)
        );

        // If merge was explicitly aborted, or, if rollback() or
        // rollbackTransaction() had been called since our merge started (which
        // results in an unqualified deleter.refresh() call that will remove
        // any index file that current segments does not reference), we abort
        // this merge
        if merge.is_aborted() {
            debug!("IW: commit_merge: skip: it was aborted");
            // In case we opened and pooled a reader for this segment, drop it
            // now. This ensures that we close the reader before trying to
            // delete any of its files.
            self.reader_pool.drop(&merged)?;
            // Must also remove the files of the merged segment, else they are
            // never deleted:
            st.deleter.delete_new_files(&merged.files());
            return Ok(false);
        }

        let merged_rld = self.carry_over_deletes(merge, &merged, doc_maps)?;

        // If the doc store we are using has been closed and is in now
        // compound format (but wasn't when we started), then we will switch
        // to the compound format as well:
        let max_doc = merged.info.max_doc();
        let drop_segment = merge.segments.is_empty()
            || max_doc == 0
            || merged_rld.as_ref().map_or(false, |rld| {
                rld.pending_delete_count() as i32 + merged.del_count() == max_doc
            });
        if let Some(ref rld) = merged_rld {
            if drop_segment {
                rld.drop_changes()?;
            }
            if self.reader_pool.release(rld)? {
                st.checkpoint_no_sis()?;
            }
        }

        debug!(
            "IW: after commit_merge: {} drop_segment={}",
            merged.name(),
            drop_segment
        );
        st.segment_infos
            .apply_merge_changes(&merge.segments, &merged, drop_segment);

        // Now deduct the deleted docs that we just reclaimed from this merge:
        let input_docs: i64 = merge
            .segments
            .iter()
            .map(|info| i64::from(info.info.max_doc()))
            .sum();
        let mut reclaimed = input_docs - i64::from(max_doc.max(0));
        if drop_segment {
            reclaimed += i64::from(max_doc.max(0));
        }
        self.pending_num_docs
            .fetch_sub(reclaimed, Ordering::AcqRel);

        if drop_segment {
            self.reader_pool.drop(&merged)?;
            // Safe: these files must exist
            st.deleter.delete_new_files(&merged.files());
        }

        // Must close before checkpoint, otherwise IFD won't be able to delete
        // the held-open files from the merge readers:
        let closed = self.close_merge_readers(st, merge, true);
        st.checkpoint()?;
        closed?;

        if !drop_segment {
            let forced = st
                .running_merges
                .get(&merge.id)
                .map_or(false, |info| info.is_forced())
                || merge.max_num_segments.is_some();
            if forced {
                st.segments_to_merge.insert(Arc::clone(&merged), false);
            }
        }
        Ok(true)
    }

    /// Replays deletes that arrived since the merge snapshot onto the merged
    /// segment's doc ids. Returns the merged segment's pooled state if any
    /// delete was carried over.
    fn carry_over_deletes(
        &self,
        merge: &OneMerge,
        merged: &Arc<SegmentCommitInfo>,
        doc_maps: &[Arc<LiveDocsDocMap>],
    ) -> Result<Option<Arc<ReadersAndUpdates>>> {
        let mut merged_rld: Option<Arc<ReadersAndUpdates>> = None;
        for (i, info) in merge.segments.iter().enumerate() {
            let doc_map = match doc_maps.get(i) {
                Some(doc_map) => doc_map,
                None => bail!(IllegalState(format!(
                    "no doc map for merged segment {}",
                    info.name()
                ))),
            };
            let rld = match self.reader_pool.get(info, false)? {
                Some(rld) => rld,
                None => bail!(IllegalState(format!(
                    "seg={} has no pooled reader",
                    info.name()
                ))),
            };
            let current = match rld.live_docs()? {
                Some(bits) => bits,
                // no deletes at all, so nothing new either
                None => continue,
            };
            let prev = merge.live_docs_at_start.get(i).and_then(|bits| bits.clone());
            if let Some(ref prev) = prev {
                if Arc::ptr_eq(prev, &current) {
                    continue;
                }
            }
            for j in 0..info.info.max_doc() as usize {
                let was_live = prev.as_ref().map_or(true, |bits| bits.get(j));
                if was_live && !current.get(j) {
                    if merged_rld.is_none() {
                        merged_rld = self.reader_pool.get(merged, true)?;
                    }
                    if let Some(ref rld) = merged_rld {
                        rld.delete(doc_map.get(j as DocId))?;
                    }
                }
            }
        }
        if let Some(ref rld) = merged_rld {
            debug!(
                "IW: {} new deletes since merge started",
                rld.pending_delete_count()
            );
        }
        Ok(merged_rld)
    }

    fn close_merge_readers(
        &self,
        st: &mut WriterState,
        merge: &mut OneMerge,
        drop: bool,
    ) -> Result<()> {
        let num_readers = merge.readers.len();
        merge.readers.clear();
        merge.live_docs_at_start.clear();
        let mut first_err = None;
        for info in merge.segments.iter().take(num_readers) {
            if let Err(e) = self.close_merge_reader(st, info, drop) {
                if first_err.is_none() {
                    first_err = Some(e);
                }
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    fn close_merge_reader(
        &self,
        st: &mut WriterState,
        info: &Arc<SegmentCommitInfo>,
        drop: bool,
    ) -> Result<()> {
        let rld = match self.reader_pool.get(info, false)? {
            Some(rld) => rld,
            None => return Ok(()),
        };
        if drop {
            rld.drop_changes()?;
        } else {
            rld.set_is_merging(false)?;
        }
        // the lookup took no reference, this releases the one the merge held
        if self.reader_pool.release(&rld)? {
            st.checkpoint_no_sis()?;
        }
        if drop {
            self.reader_pool.drop(info)?;
        }
        Ok(())
    }
}

fn merged_info(merge: &OneMerge) -> Result<Arc<SegmentCommitInfo>> {
    match merge.info {
        Some(ref info) => Ok(Arc::clone(info)),
        None => bail!(IllegalState(format!(
            "merge {} was not initialized",
            merge.seg_string()
        ))),
    }
}

impl FlushTicketPublisher for IndexWriterInner {
    fn publish_flushed_segment(
        &self,
        mut segment: FlushedSegment,
        global_packet: Option<FrozenBufferedUpdates>,
    ) -> Result<()> {
        let mut guard = self.state.lock()?;
        self.ensure_open(false)?;
        let st = &mut *guard;

        // Lock order IW -> BDS
        if let Some(packet) = global_packet {
            if packet.any() {
                debug!("IW: publish_flushed_segment: push global packet {}", packet);
                self.buffered_updates_stream.push(packet)?;
            }
        }
        // Publishing the segment must be sync'd on IW -> BDS to make sure
        // that no merge prunes away the seg. private delete packet
        let gen = match segment.segment_updates.take() {
            Some(packet) if packet.any() => self.buffered_updates_stream.push(packet)?,
            // Since we don't have a delete packet to apply we can get a new
            // generation right away
            _ => self.buffered_updates_stream.get_next_gen()?,
        };
        let info = segment.segment_info;
        info.set_buffered_deletes_gen(gen as i64);
        debug!("IW: publish sets new segment del_gen={} seg={}", gen, info);

        if segment.del_count as i32 >= info.info.max_doc() {
            debug!("IW: drop flushed segment {}: all docs deleted", info.name());
            self.pending_num_docs
                .fetch_sub(i64::from(info.info.max_doc()), Ordering::AcqRel);
            st.deleter.delete_new_files(&info.files());
            return Ok(());
        }
        st.segment_infos.add(info);
        st.checkpoint()
    }

    fn publish_frozen_updates(&self, packet: FrozenBufferedUpdates) -> Result<()> {
        let _guard = self.state.lock()?;
        if packet.any() {
            self.buffered_updates_stream.push(packet)?;
        }
        Ok(())
    }
}
