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

use crate::core::doc::Term;
use crate::core::index::writer::{BufferedUpdates, FrozenBufferedUpdates};
use crate::core::search::Query;
use crate::core::util::{DocId, NO_MORE_DOCS};
use crate::error::Result;

use arc_swap::{ArcSwap, ArcSwapOption};

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// `DocumentsWriterDeleteQueue` is a non-blocking linked pending deletes
/// queue. In contrast to other queue implementation we only maintain the
/// tail of the queue. A delete queue is always used in a context of a set of
/// DWPTs and a global delete pool. Each of the DWPT and the global pool need to
/// maintain their 'own' head of the queue (as a `DeleteSlice` instance per
/// `DocumentsWriterPerThread`).
///
/// The difference between the DWPT and the global pool is that the DWPT starts
/// maintaining a head once it has added its first document since for its segments
/// private deletes only the deletes after that document are relevant. The global
/// pool instead starts maintaining the head once this instance is created by
/// taking the sentinel instance as its initial head.
///
/// Nodes are reference counted: a node stays alive while a slice can still
/// reach it and is freed once every slice moved past it.
///
/// When a DWPT updates a document it:
///
/// - consumes a document and finishes its processing
/// - updates its private `DeleteSlice` either by calling `update_slice` or
///   `add_term_to_slice` (if the document has a del term)
/// - applies all deletes in the slice to its private `BufferedUpdates` and resets it
/// - increments its internal document id
///
/// The DWPT also doesn't apply its current documents delete term until it has
/// updated its delete slice which ensures the consistency of the update. If the
/// update fails before the DeleteSlice could have been updated the del term
/// will also not be added to its private deletes neither to the global deletes.
pub struct DocumentsWriterDeleteQueue {
    // current end (latest delete operation) in the delete queue
    tail: ArcSwap<DeleteListNode>,
    // Used to record deletes against all prior (already written to disk) segments.
    // Whenever any segment flushes, we bundle up this set of deletes and insert
    // into the buffered updates stream before the newly flushed segment(s).
    global_data: Mutex<GlobalData>,
    pub generation: u64,
    next_seq_no: AtomicU64,
    // set once this queue is retired by a full flush
    pub max_seq_no: AtomicU64,
}

struct GlobalData {
    global_slice: DeleteSlice,
    global_buffered_updates: BufferedUpdates,
}

impl GlobalData {
    fn apply_global_updates(&mut self, doc_upto: DocId) {
        self.global_slice
            .apply(&mut self.global_buffered_updates, doc_upto);
    }
}

impl Default for DocumentsWriterDeleteQueue {
    fn default() -> Self {
        // seq_no must start at 1 because some APIs negate this to also return a boolean
        Self::with_generation(0, 1)
    }
}

impl DocumentsWriterDeleteQueue {
    pub fn with_generation(generation: u64, start_seq_no: u64) -> Self {
        Self::new(BufferedUpdates::new("global"), generation, start_seq_no)
    }

    pub fn new(
        global_buffered_updates: BufferedUpdates,
        generation: u64,
        start_seq_no: u64,
    ) -> Self {
        // we use a sentinel instance as our initial tail. No slice will ever try to
        // apply this tail since the head is always omitted
        let tail = Arc::new(DeleteListNode::new(DeleteNode::None));
        let global_slice = DeleteSlice::new(&tail);
        DocumentsWriterDeleteQueue {
            tail: ArcSwap::new(tail),
            global_data: Mutex::new(GlobalData {
                global_slice,
                global_buffered_updates,
            }),
            generation,
            next_seq_no: AtomicU64::new(start_seq_no),
            max_seq_no: AtomicU64::new(::std::i64::MAX as u64),
        }
    }

    pub fn add_delete_queries(&self, queries: Vec<Arc<dyn Query>>) -> u64 {
        let seq_no = self.add(DeleteNode::Queries(queries));
        self.try_apply_global_slice();
        seq_no
    }

    pub fn add_delete_terms(&self, terms: Vec<Term>) -> u64 {
        let seq_no = self.add(DeleteNode::Terms(terms));
        self.try_apply_global_slice();
        seq_no
    }

    /// Appends the del term of a document update and makes it the tail of
    /// `slice`, atomically with regards to that slice.
    pub fn add_term_to_slice(&self, term: Term, slice: &mut DeleteSlice) -> u64 {
        let node = Arc::new(DeleteListNode::new(DeleteNode::Term(term)));
        let seq_no = self.add_node(Arc::clone(&node));
        // If two threads update the same document with the same del term, one
        // of them must win. Taking our own node as the new slice tail guarantees
        // that a competing delete added right after us is applied on our next
        // slice update.
        slice.slice_tail = node;
        debug_assert!(!slice.is_empty());
        self.try_apply_global_slice();
        seq_no
    }

    fn add(&self, item: DeleteNode) -> u64 {
        self.add_node(Arc::new(DeleteListNode::new(item)))
    }

    // Michael-Scott append: link behind the observed tail, then swing the tail.
    // The seq_no is drawn once the node is linked, so seq_nos order appends
    // that do not overlap in time. Appends racing each other may get seq_nos
    // in either order.
    fn add_node(&self, node: Arc<DeleteListNode>) -> u64 {
        loop {
            let current = self.tail.load();
            if let Some(next) = current.next.load_full() {
                // another append is half done, help it along and retry
                self.tail.compare_and_swap(&current, next);
                continue;
            }
            let prev = current
                .next
                .compare_and_swap(&None::<Arc<DeleteListNode>>, Some(Arc::clone(&node)));
            if prev.is_none() {
                // failure means some other thread already advanced the tail
                self.tail.compare_and_swap(&current, node);
                return self.next_sequence_number();
            }
        }
    }

    pub fn any_changes(&self) -> bool {
        match self.global_data.lock() {
            Ok(guard) => {
                let tail = self.tail.load();
                guard.global_buffered_updates.any()
                    || !guard.global_slice.is_empty()
                    || !Arc::ptr_eq(&guard.global_slice.slice_tail, &*tail)
                    || tail.next.load().is_some()
            }
            Err(_) => true,
        }
    }

    pub fn next_sequence_number(&self) -> u64 {
        let no = self.next_seq_no.fetch_add(1, Ordering::AcqRel);
        debug_assert!(no < self.max_seq_no.load(Ordering::Acquire));
        no
    }

    /// Applies newly appended deletes to the global buffer, unless another
    /// thread is doing so right now.
    pub fn try_apply_global_slice(&self) {
        // It is sufficient to apply the deletes that have been added after the
        // current in-flight global slices tail the next time we can get the lock.
        if let Ok(mut guard) = self.global_data.try_lock() {
            let tail = self.tail.load_full();
            if !Arc::ptr_eq(&guard.global_slice.slice_tail, &tail) {
                guard.global_slice.slice_tail = tail;
                guard.apply_global_updates(NO_MORE_DOCS);
            }
        }
    }

    /// Moves every delete appended so far into the global buffer, freezes it
    /// and starts a new, empty one.
    pub fn freeze_global_buffer(
        &self,
        caller_slice: Option<&mut DeleteSlice>,
    ) -> Result<FrozenBufferedUpdates> {
        let mut guard = self.global_data.lock()?;
        let current_tail = self.tail.load_full();
        if let Some(slice) = caller_slice {
            if !Arc::ptr_eq(&current_tail, &slice.slice_tail) {
                slice.slice_tail = Arc::clone(&current_tail);
            }
        }

        if !Arc::ptr_eq(&guard.global_slice.slice_tail, &current_tail) {
            guard.global_slice.slice_tail = current_tail;
            guard.apply_global_updates(NO_MORE_DOCS);
        }
        let packet = FrozenBufferedUpdates::new(&mut guard.global_buffered_updates, false);
        guard.global_buffered_updates.clear();
        Ok(packet)
    }

    pub fn new_slice(&self) -> DeleteSlice {
        DeleteSlice::new(&self.tail.load_full())
    }

    /// Moves the slice tail to the current tail. Returns the operation's
    /// sequence number and whether new deletes arrived since the last update.
    pub fn update_slice(&self, slice: &mut DeleteSlice) -> (u64, bool) {
        let seq_no = self.next_sequence_number();
        let tail = self.tail.load_full();
        if !Arc::ptr_eq(&tail, &slice.slice_tail) {
            // new deletes arrived since we last checked
            slice.slice_tail = tail;
            (seq_no, true)
        } else {
            (seq_no, false)
        }
    }

    pub fn num_global_term_deletes(&self) -> usize {
        match self.global_data.lock() {
            Ok(guard) => guard.global_buffered_updates.num_term_deletes(),
            Err(_) => 0,
        }
    }

    pub fn bytes_used(&self) -> u64 {
        match self.global_data.lock() {
            Ok(guard) => guard.global_buffered_updates.bytes_used,
            Err(_) => 0,
        }
    }

    /// Drops every buffered global delete.
    pub fn clear(&self) -> Result<()> {
        let mut guard = self.global_data.lock()?;
        let current_tail = self.tail.load_full();
        guard.global_slice.slice_head = Arc::clone(&current_tail);
        guard.global_slice.slice_tail = current_tail;
        guard.global_buffered_updates.clear();
        Ok(())
    }

    pub fn last_sequence_number(&self) -> u64 {
        self.next_seq_no.load(Ordering::Acquire) - 1
    }

    /// Inserts a gap in the sequence numbers. This is used by the writer to
    /// skip over sequence numbers handed to in-flight operations.
    pub fn skip_sequence_number(&self, jump: u64) {
        self.next_seq_no.fetch_add(jump, Ordering::AcqRel);
    }
}

impl fmt::Display for DocumentsWriterDeleteQueue {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "DWDQ: [ generation: {} ]", self.generation)
    }
}

pub enum DeleteNode {
    Term(Term),
    Terms(Vec<Term>),
    Queries(Vec<Arc<dyn Query>>),
    // sentinel head
    None,
}

impl DeleteNode {
    fn apply(&self, buffered_deletes: &mut BufferedUpdates, doc_id_upto: DocId) {
        match self {
            DeleteNode::Term(t) => buffered_deletes.add_term(t.clone(), doc_id_upto),
            DeleteNode::Terms(terms) => {
                for t in terms {
                    buffered_deletes.add_term(t.clone(), doc_id_upto);
                }
            }
            DeleteNode::Queries(queries) => {
                for q in queries {
                    buffered_deletes.add_query(Arc::clone(q), doc_id_upto);
                }
            }
            DeleteNode::None => {}
        }
    }
}

pub struct DeleteListNode {
    item: DeleteNode,
    next: ArcSwapOption<DeleteListNode>,
}

impl DeleteListNode {
    fn new(item: DeleteNode) -> Self {
        DeleteListNode {
            item,
            next: ArcSwapOption::empty(),
        }
    }
}

impl Drop for DeleteListNode {
    // unlink iteratively, a long chain would otherwise overflow the stack
    fn drop(&mut self) {
        let mut next = self.next.swap(None);
        while let Some(node) = next {
            match Arc::try_unwrap(node) {
                Ok(node) => next = node.next.swap(None),
                Err(_) => break,
            }
        }
    }
}

/// A `[head, tail]` window into the delete queue; the head was already
/// applied, everything after it up to the tail is pending.
pub struct DeleteSlice {
    slice_head: Arc<DeleteListNode>,
    slice_tail: Arc<DeleteListNode>,
}

impl DeleteSlice {
    fn new(current_tail: &Arc<DeleteListNode>) -> Self {
        // Initially this is a 0 length slice pointing to the 'current' tail of
        // the queue. Once we update the slice we only need to assign the tail and
        // have a new slice
        DeleteSlice {
            slice_head: Arc::clone(current_tail),
            slice_tail: Arc::clone(current_tail),
        }
    }

    /// Applies every node after the head up to and including the tail, then
    /// resets the slice.
    pub fn apply(&mut self, del: &mut BufferedUpdates, doc_id_upto: DocId) {
        if self.is_empty() {
            // 0 length slice
            return;
        }
        // When we apply a slice we take the head and get its next as our first
        // item to apply and continue until we applied the tail. If the head and
        // tail in this slice are not equal then there will be at least one more
        // non-null node in the slice!
        let mut current = Arc::clone(&self.slice_head);
        loop {
            let next = match current.next.load_full() {
                Some(next) => next,
                None => {
                    debug_assert!(false, "slice tail is not reachable from its head");
                    break;
                }
            };
            next.item.apply(del, doc_id_upto);
            let done = Arc::ptr_eq(&next, &self.slice_tail);
            current = next;
            if done {
                break;
            }
        }
        self.reset();
    }

    pub fn reset(&mut self) {
        // Reset to a 0 length slice
        self.slice_head = Arc::clone(&self.slice_tail);
    }

    pub fn is_empty(&self) -> bool {
        Arc::ptr_eq(&self.slice_head, &self.slice_tail)
    }

    /// Whether the tail node is the update del term `term`.
    pub fn is_tail_item(&self, term: &Term) -> bool {
        match self.slice_tail.item {
            DeleteNode::Term(ref t) => t == term,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::search::TermQuery;

    use std::collections::HashSet;
    use std::thread;

    #[test]
    fn test_slices_pick_up_only_new_deletes() -> Result<()> {
        let queue = DocumentsWriterDeleteQueue::default();
        let mut slice1 = queue.new_slice();
        let mut updates1 = BufferedUpdates::new("_0");

        let seq1 = queue.add_delete_terms(vec![Term::from_text("id", "1")]);
        let (_, changed) = queue.update_slice(&mut slice1);
        assert!(changed);
        slice1.apply(&mut updates1, 5);
        assert_eq!(updates1.deleted_terms.get(&Term::from_text("id", "1")), Some(&5));

        // a slice created now misses the first delete
        let mut slice2 = queue.new_slice();
        let mut updates2 = BufferedUpdates::new("_1");
        let seq2 = queue.add_delete_terms(vec![Term::from_text("id", "2")]);
        assert!(seq2 > seq1);

        let (_, changed) = queue.update_slice(&mut slice2);
        assert!(changed);
        slice2.apply(&mut updates2, 3);
        assert_eq!(updates2.deleted_terms.len(), 1);
        assert!(updates2.deleted_terms.contains_key(&Term::from_text("id", "2")));

        // nothing new
        let (_, changed) = queue.update_slice(&mut slice2);
        assert!(!changed);
        assert!(slice2.is_empty());
        Ok(())
    }

    #[test]
    fn test_add_term_to_slice() -> Result<()> {
        let queue = DocumentsWriterDeleteQueue::default();
        let mut slice = queue.new_slice();
        let term = Term::from_text("id", "7");
        queue.add_term_to_slice(term.clone(), &mut slice);
        assert!(slice.is_tail_item(&term));
        assert!(!slice.is_empty());

        let mut updates = BufferedUpdates::new("_0");
        slice.apply(&mut updates, 2);
        assert_eq!(updates.deleted_terms.get(&term), Some(&2));
        assert!(slice.is_empty());
        Ok(())
    }

    #[test]
    fn test_freeze_global_buffer_twice() -> Result<()> {
        let queue = DocumentsWriterDeleteQueue::default();
        assert!(!queue.any_changes());
        queue.add_delete_terms(vec![Term::from_text("id", "1"), Term::from_text("id", "2")]);
        queue.add_delete_queries(vec![Arc::new(TermQuery::new(Term::from_text("body", "x")))]);
        assert!(queue.any_changes());

        let first = queue.freeze_global_buffer(None)?;
        assert!(first.any());
        assert_eq!(first.terms.size, 2);
        assert_eq!(first.query_and_limits.len(), 1);

        let second = queue.freeze_global_buffer(None)?;
        assert!(!second.any());
        assert!(!queue.any_changes());
        Ok(())
    }

    #[test]
    fn test_clear_drops_buffered_deletes() -> Result<()> {
        let queue = DocumentsWriterDeleteQueue::default();
        queue.add_delete_terms(vec![Term::from_text("id", "1")]);
        queue.try_apply_global_slice();
        assert_eq!(queue.num_global_term_deletes(), 1);
        assert!(queue.bytes_used() > 0);
        queue.clear()?;
        assert_eq!(queue.num_global_term_deletes(), 0);
        assert!(!queue.any_changes());
        Ok(())
    }

    #[test]
    fn test_sequence_numbers() {
        let queue = DocumentsWriterDeleteQueue::with_generation(3, 10);
        assert_eq!(queue.generation, 3);
        assert_eq!(queue.last_sequence_number(), 9);
        assert_eq!(queue.add_delete_terms(vec![Term::from_text("a", "b")]), 10);
        queue.skip_sequence_number(5);
        assert_eq!(queue.next_sequence_number(), 16);
        assert_eq!(queue.last_sequence_number(), 16);
    }

    #[test]
    fn test_concurrent_appends_are_never_lost() -> Result<()> {
        let queue = Arc::new(DocumentsWriterDeleteQueue::default());
        let mut slice = queue.new_slice();
        let threads = 8;
        let per_thread = 500;

        let mut handles = Vec::with_capacity(threads);
        for t in 0..threads {
            let queue = Arc::clone(&queue);
            handles.push(thread::spawn(move || {
                let mut seq_nos = Vec::with_capacity(per_thread);
                for i in 0..per_thread {
                    let term = Term::from_text("id", &format!("{}-{}", t, i));
                    seq_nos.push(queue.add_delete_terms(vec![term]));
                }
                seq_nos
            }));
        }
        let mut all_seq_nos = HashSet::new();
        for h in handles {
            for seq_no in h.join().unwrap() {
                assert!(all_seq_nos.insert(seq_no));
            }
        }
        assert_eq!(all_seq_nos.len(), threads * per_thread);

        let mut updates = BufferedUpdates::new("_0");
        queue.update_slice(&mut slice);
        slice.apply(&mut updates, 1);
        assert_eq!(updates.deleted_terms.len(), threads * per_thread);
        // each node is applied at most once
        assert_eq!(updates.num_term_deletes(), threads * per_thread);

        slice.apply(&mut updates, 1);
        assert_eq!(updates.num_term_deletes(), threads * per_thread);

        let frozen = queue.freeze_global_buffer(None)?;
        assert_eq!(frozen.terms.size, threads * per_thread);
        Ok(())
    }

    #[test]
    fn test_seq_nos_follow_list_order_per_thread() {
        let queue = Arc::new(DocumentsWriterDeleteQueue::default());
        let slice = queue.new_slice();
        let mut handles = Vec::with_capacity(4);
        for t in 0..4 {
            let queue = Arc::clone(&queue);
            handles.push(thread::spawn(move || {
                (0..1000)
                    .map(|i| {
                        let term = Term::from_text(&t.to_string(), &i.to_string());
                        (term.clone(), queue.add_delete_terms(vec![term]))
                    })
                    .collect::<Vec<_>>()
            }));
        }
        let mut seq_no_of = ::std::collections::HashMap::new();
        for h in handles {
            seq_no_of.extend(h.join().unwrap());
        }

        // appends of one thread never overlap, so their list order and seq_no
        // order agree
        let mut last_per_thread = ::std::collections::HashMap::new();
        let mut walked = 0;
        let mut node = slice.slice_head.next.load_full();
        while let Some(current) = node {
            if let DeleteNode::Terms(terms) = &current.item {
                let seq_no = seq_no_of[&terms[0]];
                let last = last_per_thread.entry(terms[0].field.clone()).or_insert(0);
                assert!(seq_no > *last);
                *last = seq_no;
                walked += 1;
            }
            node = current.next.load_full();
        }
        assert_eq!(walked, 4000);

        let last = queue.add_delete_terms(vec![Term::from_text("id", "last")]);
        assert!(seq_no_of.values().all(|seq_no| *seq_no < last));
    }

    #[test]
    fn test_long_chain_drops_iteratively() {
        let queue = DocumentsWriterDeleteQueue::default();
        let slice = queue.new_slice();
        for i in 0..100_000 {
            queue.add_delete_terms(vec![Term::from_text("id", &i.to_string())]);
        }
        drop(queue);
        drop(slice);
    }
}
