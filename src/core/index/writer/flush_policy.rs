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
    DocumentsWriterFlushControl, FlushControlState, IndexWriterConfig, ThreadState,
};

use std::sync::Arc;

/// `FlushPolicy` controls when segments are flushed from a RAM resident
/// internal data-structure to the `IndexWriter`s `Directory`.
///
/// Segments are traditionally flushed by:
/// - RAM consumption, configured via `IndexWriterConfig::ram_buffer_size_mb`
/// - Number of RAM resident documents, configured via
///   `IndexWriterConfig::max_buffered_docs`
///
/// The policy also applies pending delete operations (by term and/or query),
/// given the threshold set in `IndexWriterConfig::max_buffered_delete_terms`.
///
/// `IndexWriter` consults the provided `FlushPolicy` to control the
/// flushing process. The policy is informed for each added or updated document
/// as well as for each delete term. Based on the `FlushPolicy`, the
/// information provided via `ThreadState` and
/// `DocumentsWriterFlushControl`, the `FlushPolicy` decides if a
/// `DocumentsWriterPerThread` needs flushing and mark it as flush-pending
/// via `DocumentsWriterFlushControl::set_flush_pending`, or if deletes need
/// to be applied.
///
/// Every method is called with the flush control's lock held, passed in as
/// `locked`.
pub trait FlushPolicy: Send + Sync {
    /// Called for each delete term. If this is a delete triggered due to an update
    /// the given `ThreadState` is non-null.
    fn on_delete(
        &self,
        control: &DocumentsWriterFlushControl,
        locked: &mut FlushControlState,
        state: Option<&ThreadState>,
    );

    /// Called for each document update on the given `ThreadState`'s
    /// `DocumentsWriterPerThread`.
    fn on_update(
        &self,
        control: &DocumentsWriterFlushControl,
        locked: &mut FlushControlState,
        state: &ThreadState,
    ) {
        self.on_insert(control, locked, state);
        self.on_delete(control, locked, Some(state));
    }

    /// Called for each document addition on the given `ThreadState`s
    /// `DocumentsWriterPerThread`.
    fn on_insert(
        &self,
        control: &DocumentsWriterFlushControl,
        locked: &mut FlushControlState,
        state: &ThreadState,
    );
}

/// Default `FlushPolicy` implementation that flushes new segments based on
/// RAM used and document count depending on the IndexWriter's
/// `IndexWriterConfig`. It also applies pending deletes based on the
/// number of buffered delete terms.
///
/// - `on_delete` applies pending delete operations based on the global number
///   of buffered delete terms if `max_buffered_delete_terms` is enabled, or once
///   the deletes alone exceed the RAM buffer.
/// - `on_insert` flushes either on the number of documents per
///   `DocumentsWriterPerThread` or on the global active memory consumption in
///   the current indexing session if `max_buffered_docs` or
///   `ram_buffer_size_mb` is enabled respectively.
/// - `on_update` calls `on_insert` and `on_delete` in order.
///
/// If the RAM buffer is enabled, the largest ram consuming
/// `DocumentsWriterPerThread` will be marked as pending if the global active
/// plus flushing RAM consumption is >= the configured max RAM buffer.
pub struct FlushByRamOrCountsPolicy {
    config: Arc<IndexWriterConfig>,
}

impl FlushByRamOrCountsPolicy {
    pub fn new(config: Arc<IndexWriterConfig>) -> Self {
        FlushByRamOrCountsPolicy { config }
    }

    /// Marks the most ram consuming active `DocumentsWriterPerThread` flush
    /// pending
    fn mark_largest_writer_pending(
        &self,
        control: &DocumentsWriterFlushControl,
        locked: &mut FlushControlState,
        state: &ThreadState,
        current_bytes_used: u64,
    ) {
        let largest = control.find_largest_non_pending_writer(state);
        let largest = largest.as_ref().map(|s| s.as_ref()).unwrap_or(state);
        debug!(
            "DWFC: force flush thread state {} due to RAM usage {} bytes",
            largest.index, current_bytes_used
        );
        control.set_flush_pending(locked, largest);
    }
}

impl FlushPolicy for FlushByRamOrCountsPolicy {
    fn on_delete(
        &self,
        control: &DocumentsWriterFlushControl,
        _locked: &mut FlushControlState,
        _state: Option<&ThreadState>,
    ) {
        if self.config.flush_on_delete_terms() {
            // flush this state by num del terms
            if control.num_global_term_deletes() >= self.config.max_buffered_delete_terms() as usize
            {
                control.set_apply_all_deletes();
            }
        }
        if let Some(limit) = self.config.ram_buffer_size_bytes() {
            let delete_bytes = control.delete_bytes_used();
            if delete_bytes > limit {
                debug!(
                    "DWFC: force apply deletes, delete bytes {} exceed the RAM buffer {}",
                    delete_bytes, limit
                );
                control.set_apply_all_deletes();
            }
        }
    }

    fn on_insert(
        &self,
        control: &DocumentsWriterFlushControl,
        locked: &mut FlushControlState,
        state: &ThreadState,
    ) {
        if self.config.flush_on_doc_count()
            && state.num_docs_in_ram() >= self.config.max_buffered_docs()
        {
            // Flush this state by num docs
            control.set_flush_pending(locked, state);
        } else if let Some(limit) = self.config.ram_buffer_size_bytes() {
            // bytes still held by flushing builders count against the budget
            let total_ram = locked.active_bytes() + locked.flush_bytes();
            if total_ram >= limit {
                self.mark_largest_writer_pending(control, locked, state, total_ram);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::doc::{Document, Field, FieldType};
    use crate::core::index::writer::{
        BufferedUpdatesStream, DocumentsWriterDeleteQueue, DocumentsWriterPerThread,
        DocumentsWriterPerThreadPool,
    };
    use crate::core::store::{Directory, RAMDirectory};
    use crate::error::Result;

    use std::sync::atomic::AtomicI64;

    struct Harness {
        dir: Arc<dyn Directory>,
        config: Arc<IndexWriterConfig>,
        pool: Arc<DocumentsWriterPerThreadPool>,
        control: DocumentsWriterFlushControl,
    }

    impl Harness {
        fn new(config: IndexWriterConfig) -> Self {
            let config = Arc::new(config);
            let pool = Arc::new(DocumentsWriterPerThreadPool::new(4));
            let control = DocumentsWriterFlushControl::new(
                Arc::clone(&config),
                Arc::clone(&pool),
                Arc::new(BufferedUpdatesStream::default()),
                Arc::new(DocumentsWriterDeleteQueue::default()),
            );
            Harness {
                dir: Arc::new(RAMDirectory::new()),
                config,
                pool,
                control,
            }
        }

        // one document on `state`, returns the builder the control checked out
        fn index(
            &self,
            state: &Arc<ThreadState>,
            doc: &Document,
        ) -> Result<Option<DocumentsWriterPerThread>> {
            let mut guard = state.lock()?;
            if guard.dwpt.is_none() {
                guard.dwpt = Some(DocumentsWriterPerThread::new(
                    format!("_{}", state.index),
                    Arc::clone(&self.dir),
                    Arc::clone(&self.dir),
                    Arc::clone(&self.config),
                    self.control.delete_queue(),
                    Arc::new(AtomicI64::new(0)),
                ));
            }
            if let Some(dwpt) = guard.dwpt.as_mut() {
                dwpt.update_document(doc, None)?;
            }
            self.control.do_after_document(state, &mut guard, false)
        }
    }

    #[test]
    fn test_flush_by_doc_count() -> Result<()> {
        let config = IndexWriterConfig::default()
            .set_ram_buffer_size_mb(None)
            .set_max_buffered_docs(Some(100));
        let harness = Harness::new(config);
        let state = harness.pool.get_and_lock()?;
        let doc = Document::with_fields(vec![Field::string("id", "1")]);

        let mut checked_out = vec![];
        for _ in 0..101 {
            if let Some(dwpt) = harness.index(&state, &doc)? {
                checked_out.push(dwpt);
            }
        }
        assert_eq!(checked_out.len(), 1);
        assert_eq!(checked_out[0].num_docs_in_ram, 100);
        assert!(!state.flush_pending());
        assert_eq!(state.num_docs_in_ram(), 1);
        assert_eq!(harness.control.num_flushing(), 1);

        harness.control.do_after_flush(checked_out.remove(0))?;
        assert_eq!(harness.control.num_flushing(), 0);
        harness.pool.release(&state)?;
        Ok(())
    }

    #[test]
    fn test_flush_largest_writer_by_ram() -> Result<()> {
        let config = IndexWriterConfig::default().set_ram_buffer_size_mb(Some(1.0));
        let harness = Harness::new(config);
        let small = harness.pool.get_and_lock()?;
        let pool = Arc::clone(&harness.pool);
        // a second state, checked out from another thread
        let large = ::std::thread::spawn(move || pool.get_and_lock())
            .join()
            .unwrap()?;
        assert_ne!(small.index, large.index);

        let blob = |len: usize| {
            Document::with_fields(vec![Field::new(
                "blob",
                &"x".repeat(len),
                FieldType::STORED_ONLY,
            )])
        };
        assert!(harness.index(&large, &blob(600_000))?.is_none());
        // the RAM buffer fills up on the small state, the large one is picked
        assert!(harness.index(&small, &blob(500_000))?.is_none());
        assert!(large.flush_pending());
        assert!(!small.flush_pending());
        assert!(harness.control.flush_bytes() >= 600_000);

        let dwpt = harness.control.next_pending_flush()?.unwrap();
        assert_eq!(dwpt.segment_name(), &format!("_{}", large.index));
        harness.control.do_after_flush(dwpt)?;
        assert_eq!(harness.control.flush_bytes(), 0);
        Ok(())
    }

    #[test]
    fn test_flushing_bytes_count_against_ram_buffer() -> Result<()> {
        let config = IndexWriterConfig::default().set_ram_buffer_size_mb(Some(1.0));
        let harness = Harness::new(config);
        let first = harness.pool.get_and_lock()?;
        let pool = Arc::clone(&harness.pool);
        let second = ::std::thread::spawn(move || pool.get_and_lock())
            .join()
            .unwrap()?;

        let blob = |len: usize| {
            Document::with_fields(vec![Field::new(
                "blob",
                &"x".repeat(len),
                FieldType::STORED_ONLY,
            )])
        };
        assert!(harness.index(&first, &blob(600_000))?.is_none());
        assert!(harness.index(&second, &blob(500_000))?.is_none());
        assert!(first.flush_pending());
        let flushing = harness.control.next_pending_flush()?.unwrap();
        assert!(harness.control.flush_bytes() >= 600_000);
        assert!(harness.control.active_bytes() < 1024 * 1024);

        // active bytes alone stay below the budget, the flushing builder
        // pushes the total over it
        let small = Document::with_fields(vec![Field::string("id", "1")]);
        let dwpt = harness.index(&second, &small)?.unwrap();
        assert_eq!(dwpt.segment_name(), &format!("_{}", second.index));
        assert_eq!(harness.control.num_flushing(), 2);

        harness.control.do_after_flush(flushing)?;
        harness.control.do_after_flush(dwpt)?;
        assert_eq!(harness.control.flush_bytes(), 0);
        Ok(())
    }

    #[test]
    fn test_apply_deletes_by_term_count() -> Result<()> {
        let config = IndexWriterConfig::default().set_max_buffered_delete_terms(Some(2));
        let harness = Harness::new(config);
        let queue = harness.control.delete_queue();

        queue.add_delete_terms(vec![crate::core::doc::Term::from_text("id", "1")]);
        harness.control.do_on_delete()?;
        assert!(!harness.control.get_and_reset_apply_all_deletes());

        queue.add_delete_terms(vec![crate::core::doc::Term::from_text("id", "2")]);
        harness.control.do_on_delete()?;
        assert!(harness.control.get_and_reset_apply_all_deletes());
        assert!(!harness.control.get_and_reset_apply_all_deletes());
        Ok(())
    }
}
