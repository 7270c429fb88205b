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

use crate::core::codec::segment_infos::{SegmentCommitInfo, SegmentInfos};
use crate::core::doc::Term;
use crate::core::index::writer::{
    PrefixCodedTerms, PrefixCodedTermsBuilder, ReaderPool, ReadersAndUpdates,
};
use crate::core::search::Query;
use crate::core::store::IOContext;
use crate::core::util::DocId;
use crate::error::Result;

use std::cmp::min;
use std::collections::HashMap;
use std::fmt;
use std::mem;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

// Rough logic: del docIDs are List<i32>.  Say list allocates ~2X size (2 * i32),
pub const BYTES_PER_DEL_DOCID: usize = 2 * mem::size_of::<DocId>();

/// Rough logic: hash-map has an array<index> varying load factor (say 2 * usize).
/// Term is object with two Vec(String is actual a Vec), each Vec cost 2 * usize (cap/size) +
/// vec.capasity * byte
pub const BYTES_PER_DEL_TERM: usize = 6 * mem::size_of::<usize>();

/// Rough logic: HashMap has an array<index> and array<entry> varying load factor
/// say (2 * pointer). Entry is (String, (Arc<dyn Query>, i32)), String cost 2 * usize +
/// string.len() * byte, Query we offen undercount (say 24 bytes).
pub const BYTES_PER_DEL_QUERY_IN_HASH: usize = 4 * mem::size_of::<usize>() + 28;

/// Holds buffered deletes by docID, term or query for a single segment.
/// This is used to hold buffered pending deletes against the to-be-flushed
/// segment. Once the deletes are pushed (on flush in DocumentsWriter), they
/// are converted to a `FrozenBufferedUpdates` instance.
///
/// NOTE: instances of this class are accessed either via a private
/// instance on DocumentWriterPerThread, or via sync'd code by
/// DocumentsWriterDeleteQueue
pub struct BufferedUpdates {
    pub num_term_deletes: AtomicUsize,
    pub deleted_terms: HashMap<Term, DocId>,
    // the key is string represent of query, query is share by multi-thread
    pub deleted_queries: HashMap<String, (Arc<dyn Query>, DocId)>,
    pub deleted_doc_ids: Vec<DocId>,
    pub bytes_used: u64,
    pub segment_name: String,
}

impl BufferedUpdates {
    pub fn new(name: &str) -> Self {
        BufferedUpdates {
            num_term_deletes: AtomicUsize::new(0),
            deleted_terms: HashMap::new(),
            deleted_queries: HashMap::new(),
            deleted_doc_ids: vec![],
            bytes_used: 0,
            segment_name: name.to_string(),
        }
    }

    pub fn add_doc_id(&mut self, doc_id: DocId) {
        self.deleted_doc_ids.push(doc_id);
        self.bytes_used += BYTES_PER_DEL_DOCID as u64;
    }

    pub fn add_query(&mut self, query: Arc<dyn Query>, doc_id_upto: DocId) {
        let query_str = format!("{}", &query);
        let key_len = query_str.len();
        if self
            .deleted_queries
            .insert(query_str, (query, doc_id_upto))
            .is_none()
        {
            self.bytes_used += (BYTES_PER_DEL_QUERY_IN_HASH + key_len) as u64;
        }
    }

    pub fn add_term(&mut self, term: Term, doc_id_upto: DocId) {
        let is_new = match self.deleted_terms.get(&term) {
            Some(current) if doc_id_upto < *current => {
                // Only record the new number if it's greater than the
                // current one.  This is important because if multiple
                // threads are replacing the same doc at nearly the
                // same time, it's possible that one thread that got a
                // higher docID is scheduled before the other
                // threads.  If we blindly replace than we can
                // incorrectly get both docs indexed.
                return;
            }
            Some(_) => false,
            None => true,
        };

        // delete on the same term twice still counts twice, the policy
        // uses the count to trigger applying deletes
        self.num_term_deletes.fetch_add(1, Ordering::AcqRel);
        if is_new {
            self.bytes_used += (BYTES_PER_DEL_TERM + term.ram_bytes_used()) as u64;
        }
        self.deleted_terms.insert(term, doc_id_upto);
    }

    pub fn num_term_deletes(&self) -> usize {
        self.num_term_deletes.load(Ordering::Acquire)
    }

    pub fn clear(&mut self) {
        self.deleted_terms.clear();
        self.deleted_queries.clear();
        self.deleted_doc_ids.clear();
        self.num_term_deletes.store(0, Ordering::Release);
        self.bytes_used = 0;
    }

    pub fn any(&self) -> bool {
        !self.deleted_terms.is_empty()
            || !self.deleted_doc_ids.is_empty()
            || !self.deleted_queries.is_empty()
    }
}

impl fmt::Display for BufferedUpdates {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "gen={}", self.segment_name)?;
        let num_terms = self.num_term_deletes();
        if num_terms != 0 {
            write!(
                f,
                " {} deleted terms (unique count={})",
                num_terms,
                self.deleted_terms.len()
            )?;
        }
        if !self.deleted_queries.is_empty() {
            write!(f, " {} deleted queries", self.deleted_queries.len())?;
        }
        if !self.deleted_doc_ids.is_empty() {
            write!(f, " {} deleted docIDs", self.deleted_doc_ids.len())?;
        }
        if self.bytes_used != 0 {
            write!(f, " bytes_used={}", self.bytes_used)?;
        }
        Ok(())
    }
}

/// Holds buffered deletes by term or query, once pushed. Pushed deletes are
/// write-once, so we shift to more memory efficient data structure to hold
/// them. We don't hold docIDs because these are applied on flush.
pub struct FrozenBufferedUpdates {
    pub terms: PrefixCodedTerms,
    // Parallel array of deleted query, and the doc_id_upto for each
    pub query_and_limits: Vec<(Arc<dyn Query>, DocId)>,
    pub num_term_deletes: usize,
    pub num_query_deletes: usize,
    pub bytes_used: u64,
    // assigned by BufferedUpdatesStream once pushed
    pub gen: u64,
    // set to true iff this frozen packet represents a segment private delete.
    // in that case is should only have queries
    pub is_segment_private: bool,
}

impl fmt::Display for FrozenBufferedUpdates {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.num_term_deletes > 0 {
            write!(
                f,
                " {} deleted terms (unique count={})",
                self.num_term_deletes, self.terms.size
            )?;
        }
        if !self.query_and_limits.is_empty() {
            write!(f, " {} deleted queries", self.query_and_limits.len())?;
        }
        if self.bytes_used != 0 {
            write!(f, " bytes_used={}", self.bytes_used)?;
        }
        Ok(())
    }
}

impl FrozenBufferedUpdates {
    /// Snapshots the terms and drains the queries of `deletes`; the caller
    /// clears it afterwards.
    pub fn new(deletes: &mut BufferedUpdates, is_segment_private: bool) -> Self {
        debug_assert!(!is_segment_private || deletes.deleted_terms.is_empty());

        let mut terms_array: Vec<&Term> = deletes.deleted_terms.keys().collect();
        terms_array.sort();

        let mut builder = PrefixCodedTermsBuilder::default();
        for t in terms_array {
            builder.add_term(t);
        }
        let terms = builder.finish();

        let query_and_limits: Vec<_> = deletes
            .deleted_queries
            .drain()
            .map(|(_key, value)| value)
            .collect();
        let num_query_deletes = query_and_limits.len();

        let bytes_used = (terms.ram_bytes_used()
            + query_and_limits.len() * BYTES_PER_DEL_QUERY_IN_HASH) as u64;

        FrozenBufferedUpdates {
            terms,
            query_and_limits,
            num_term_deletes: deletes.num_term_deletes.load(Ordering::Acquire),
            num_query_deletes,
            bytes_used,
            // used as a sentinel of invalid
            gen: u64::max_value(),
            is_segment_private,
        }
    }

    pub fn set_del_gen(&mut self, gen: u64) {
        debug_assert_eq!(self.gen, u64::max_value());
        self.gen = gen;
        self.terms.set_del_gen(gen);
    }

    pub fn any(&self) -> bool {
        self.terms.size > 0 || !self.query_and_limits.is_empty()
    }
}

/// Tracks the stream of `FrozenBufferedUpdates`.
/// When DocumentsWriterPerThread flushes, its buffered
/// deletes are appended to this stream.  We later
/// apply them (resolve them to the actual
/// docIDs, per segment) when a merge is started
/// (only to the to-be-merged segments).  We
/// also apply to all segments when NRT reader is pulled,
/// commit/close is called, or when too many deletes are
/// buffered and must be flushed (by RAM usage or by count).
///
/// Each packet is assigned a generation, and each flushed or
/// merged segment is also assigned a generation, so we can
/// track which packets to apply to any given segment.
pub struct BufferedUpdatesStream {
    lock: Mutex<()>,
    updates: Mutex<Vec<FrozenBufferedUpdates>>,
    // Starts at 1 so that SegmentInfos that have never had
    // deletes applied (whose bufferedDelGen defaults to 0)
    // will be correct:
    next_gen: AtomicU64,
    num_terms: AtomicUsize,
    num_queries: AtomicUsize,
    bytes_used: AtomicU64,
}

impl Default for BufferedUpdatesStream {
    fn default() -> Self {
        BufferedUpdatesStream {
            lock: Mutex::new(()),
            updates: Mutex::new(vec![]),
            next_gen: AtomicU64::new(1),
            num_terms: AtomicUsize::new(0),
            num_queries: AtomicUsize::new(0),
            bytes_used: AtomicU64::new(0),
        }
    }
}

impl BufferedUpdatesStream {
    // Append a new packet of buffered deletes to the stream:
    // setting its generation:
    pub fn push(&self, mut packet: FrozenBufferedUpdates) -> Result<u64> {
        // The insert operation must be atomic. If we let threads increment the gen
        // and push the packet afterwards we risk that packets are out of order.
        // With DWPT this is possible if two or more flushes are racing for pushing
        // updates. If the pushed packets get our of order would loose documents
        // since deletes are applied to the wrong segments.
        let _l = self.lock.lock()?;
        packet.set_del_gen(self.next_gen.fetch_add(1, Ordering::AcqRel));
        let mut updates = self.updates.lock()?;
        debug_assert!(packet.any());
        debug_assert!(updates.last().map_or(true, |last| last.gen < packet.gen));
        let del_gen = packet.gen;
        self.num_terms
            .fetch_add(packet.num_term_deletes, Ordering::AcqRel);
        self.num_queries
            .fetch_add(packet.num_query_deletes, Ordering::AcqRel);
        self.bytes_used
            .fetch_add(packet.bytes_used, Ordering::AcqRel);
        debug!(
            "BD: push deletes {} segment_private={} del_gen={} packet_count={} bytes_used={}",
            packet,
            packet.is_segment_private,
            del_gen,
            updates.len() + 1,
            self.bytes_used.load(Ordering::Acquire)
        );
        updates.push(packet);
        Ok(del_gen)
    }

    pub fn clear(&self) -> Result<()> {
        let _l = self.lock.lock()?;
        self.updates.lock()?.clear();
        self.next_gen.store(1, Ordering::Release);
        self.num_terms.store(0, Ordering::Release);
        self.num_queries.store(0, Ordering::Release);
        self.bytes_used.store(0, Ordering::Release);
        Ok(())
    }

    pub fn any(&self) -> bool {
        self.bytes_used.load(Ordering::Acquire) != 0
    }

    pub fn num_terms(&self) -> usize {
        self.num_terms.load(Ordering::Acquire)
    }

    pub fn ram_bytes_used(&self) -> u64 {
        self.bytes_used.load(Ordering::Acquire)
    }

    pub fn get_next_gen(&self) -> Result<u64> {
        let _l = self.lock.lock()?;
        Ok(self.next_gen.fetch_add(1, Ordering::AcqRel))
    }

    /// Resolves the buffered deleted Term/Query to docIDs, into their
    /// per-segment live docs. Returns the generation the given segments
    /// were brought up to and the segments that ended up 100% deleted.
    pub fn apply_deletes_and_updates(
        &self,
        pool: &ReaderPool,
        infos: &[Arc<SegmentCommitInfo>],
    ) -> Result<ApplyDeletesResult> {
        let _l = self.lock.lock()?;
        let start = Instant::now();

        let gen = self.next_gen.fetch_add(1, Ordering::AcqRel);

        if infos.is_empty() {
            return Ok(ApplyDeletesResult::new(false, gen, vec![]));
        }
        if !self.any() {
            debug!("BD: apply_deletes: no segments; skipping");
            return Ok(ApplyDeletesResult::new(false, gen, vec![]));
        }

        let updates = self.updates.lock()?;
        debug!(
            "BD: apply_deletes: open segment readers took {:?}; {} packets against {} segments",
            start.elapsed(),
            updates.len(),
            infos.len()
        );

        let mut total_del_count = 0usize;
        let mut any_written = false;
        let mut all_deleted = vec![];
        for info in infos {
            let seg_gen = info.buffered_deletes_gen();
            let packets: Vec<&FrozenBufferedUpdates> = updates
                .iter()
                .filter(|p| {
                    let packet_gen = p.gen as i64;
                    if p.is_segment_private {
                        packet_gen == seg_gen
                    } else {
                        packet_gen > seg_gen
                    }
                })
                .collect();
            if packets.is_empty() {
                continue;
            }

            let rld = match pool.get(info, true)? {
                Some(rld) => rld,
                None => continue,
            };
            let result = Self::apply_packets(&packets, &rld);
            // release even if applying failed
            let released = pool.release(&rld);
            let del_count = result?;
            any_written |= released?;

            if del_count > 0 {
                total_del_count += del_count;
                let full_del_count = info.del_count() + rld.pending_delete_count() as i32;
                debug_assert!(full_del_count <= info.info.max_doc());
                if full_del_count == info.info.max_doc() {
                    all_deleted.push(Arc::clone(info));
                }
            }
        }

        for info in infos {
            info.set_buffered_deletes_gen(gen as i64);
        }

        debug!(
            "BD: apply_deletes took {:?} for {} segments, {} newly deleted docs, {} fully \
             deleted segments, gen={}",
            start.elapsed(),
            infos.len(),
            total_del_count,
            all_deleted.len(),
            gen
        );

        Ok(ApplyDeletesResult {
            any_deletes: total_del_count > 0 || any_written,
            gen,
            all_deleted,
        })
    }

    // Returns how many docs this call newly deleted.
    fn apply_packets(
        packets: &[&FrozenBufferedUpdates],
        rld: &ReadersAndUpdates,
    ) -> Result<usize> {
        let reader = rld.reader(&IOContext::READ)?;
        let mut del_count = 0;
        for packet in packets {
            if !packet.is_segment_private {
                let mut iter = packet.terms.iterator();
                while let Some(term) = iter.next()? {
                    if let Some(docs) = reader.postings(&term) {
                        for &doc in docs {
                            if rld.delete(doc)? {
                                del_count += 1;
                            }
                        }
                    }
                }
            }
            for (query, limit) in &packet.query_and_limits {
                for doc in query.matching_docs(&reader)? {
                    if doc >= *limit {
                        // docs are ascending
                        break;
                    }
                    if rld.delete(doc)? {
                        del_count += 1;
                    }
                }
            }
        }
        Ok(del_count)
    }

    // Lock order IW -> BD
    /// Remove any BufferDeletes that we on longer need to store because
    /// all segments in the index have had the deletes applied.
    pub fn prune(&self, segment_infos: &SegmentInfos) -> Result<()> {
        let _l = self.lock.lock()?;
        let mut updates = self.updates.lock()?;

        let mut min_gen = i64::max_value();
        for info in &segment_infos.segments {
            min_gen = min(info.buffered_deletes_gen(), min_gen);
        }

        debug!(
            "BD: prune sis={} min_gen={} packet_count={}",
            segment_infos.len(),
            min_gen,
            updates.len()
        );

        let limit = updates.len();
        let idx = updates
            .iter()
            .position(|p| p.gen as i64 >= min_gen)
            .unwrap_or(limit);
        self.do_prune(&mut updates, idx);
        if updates.is_empty() {
            debug_assert_eq!(self.num_terms.load(Ordering::Acquire), 0);
            self.num_queries.store(0, Ordering::Release);
            self.bytes_used.store(0, Ordering::Release);
        }
        Ok(())
    }

    fn do_prune(&self, updates: &mut MutexGuard<Vec<FrozenBufferedUpdates>>, idx: usize) {
        if idx > 0 {
            debug!(
                "BD: prune_deletes: prune {} packets; {} packets remain.",
                idx,
                updates.len() - idx
            );
        }
        for packet in updates.drain(..idx) {
            debug_assert!(self.num_terms.load(Ordering::Acquire) >= packet.num_term_deletes);
            self.num_terms
                .fetch_sub(packet.num_term_deletes, Ordering::AcqRel);
            self.num_queries
                .fetch_sub(packet.num_query_deletes, Ordering::AcqRel);
            self.bytes_used
                .fetch_sub(packet.bytes_used, Ordering::AcqRel);
        }
    }
}

pub struct ApplyDeletesResult {
    // True if any actual deletes took place:
    pub any_deletes: bool,
    // Current gen, for the merged segment:
    pub gen: u64,
    // if non-empty, contains segment that are 100% deleted
    pub all_deleted: Vec<Arc<SegmentCommitInfo>>,
}

impl ApplyDeletesResult {
    fn new(any_deletes: bool, gen: u64, all_deleted: Vec<Arc<SegmentCommitInfo>>) -> Self {
        ApplyDeletesResult {
            any_deletes,
            gen,
            all_deleted,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::index::reader::write_segment;
    use crate::core::search::TermQuery;
    use crate::core::store::{Directory, RAMDirectory};

    use std::thread;

    fn frozen_terms(terms: &[(&str, &str)]) -> FrozenBufferedUpdates {
        let mut updates = BufferedUpdates::new("global");
        for (field, text) in terms {
            updates.add_term(Term::from_text(field, text), DocId::max_value());
        }
        FrozenBufferedUpdates::new(&mut updates, false)
    }

    #[test]
    fn test_add_term_keeps_highest_bound() {
        let mut updates = BufferedUpdates::new("_0");
        let term = Term::from_text("id", "x");
        updates.add_term(term.clone(), 5);
        let bytes = updates.bytes_used;
        assert!(bytes > 0);

        updates.add_term(term.clone(), 3);
        assert_eq!(updates.deleted_terms.get(&term), Some(&5));
        assert_eq!(updates.num_term_deletes(), 1);

        updates.add_term(term.clone(), 5);
        updates.add_term(term.clone(), 8);
        assert_eq!(updates.deleted_terms.get(&term), Some(&8));
        assert_eq!(updates.num_term_deletes(), 3);
        // only the first insertion of a key is accounted
        assert_eq!(updates.bytes_used, bytes);
    }

    #[test]
    fn test_add_term_from_racing_threads() -> Result<()> {
        let updates = Arc::new(Mutex::new(BufferedUpdates::new("_0")));
        let mut handles = vec![];
        for &upto in &[5, 3] {
            let updates = Arc::clone(&updates);
            handles.push(thread::spawn(move || {
                updates
                    .lock()
                    .unwrap()
                    .add_term(Term::from_text("f", "x"), upto);
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        let guard = updates.lock()?;
        assert_eq!(guard.deleted_terms.get(&Term::from_text("f", "x")), Some(&5));
        Ok(())
    }

    #[test]
    fn test_queries_doc_ids_and_clear() {
        let mut updates = BufferedUpdates::new("_0");
        assert!(!updates.any());
        let query: Arc<dyn Query> = Arc::new(TermQuery::new(Term::from_text("body", "a")));
        updates.add_query(Arc::clone(&query), 4);
        let after_first = updates.bytes_used;
        updates.add_query(query, 6);
        assert_eq!(updates.bytes_used, after_first);
        assert_eq!(updates.deleted_queries.len(), 1);

        updates.add_doc_id(1);
        updates.add_doc_id(1);
        assert_eq!(
            updates.bytes_used,
            after_first + 2 * BYTES_PER_DEL_DOCID as u64
        );
        assert!(updates.any());

        updates.clear();
        assert!(!updates.any());
        assert_eq!(updates.bytes_used, 0);
        assert_eq!(updates.num_term_deletes(), 0);
    }

    #[test]
    fn test_freeze_sorts_terms() -> Result<()> {
        let frozen = frozen_terms(&[("id", "b"), ("body", "z"), ("id", "a")]);
        assert_eq!(frozen.num_term_deletes, 3);
        assert_eq!(frozen.gen, u64::max_value());
        let mut iter = frozen.terms.iterator();
        let mut seen = vec![];
        while let Some(t) = iter.next()? {
            seen.push(t);
        }
        assert_eq!(
            seen,
            vec![
                Term::from_text("body", "z"),
                Term::from_text("id", "a"),
                Term::from_text("id", "b"),
            ]
        );
        Ok(())
    }

    #[test]
    fn test_push_assigns_increasing_gens_and_prune() -> Result<()> {
        let stream = BufferedUpdatesStream::default();
        assert!(!stream.any());
        let gen1 = stream.push(frozen_terms(&[("id", "1")]))?;
        let gen2 = stream.push(frozen_terms(&[("id", "2"), ("id", "3")]))?;
        assert!(gen2 > gen1);
        assert_eq!(stream.num_terms(), 3);
        assert!(stream.any());

        let mut infos = SegmentInfos::default();
        let dir: Arc<dyn Directory> = Arc::new(RAMDirectory::new());
        let si = write_segment(&dir, "_0", 4)?;
        si.set_buffered_deletes_gen(gen2 as i64);
        infos.add(si);

        stream.prune(&infos)?;
        assert_eq!(stream.num_terms(), 2);

        infos.segments[0].set_buffered_deletes_gen(gen2 as i64 + 1);
        stream.prune(&infos)?;
        assert_eq!(stream.num_terms(), 0);
        assert!(!stream.any());
        Ok(())
    }

    #[test]
    fn test_apply_global_and_private_packets() -> Result<()> {
        let dir: Arc<dyn Directory> = Arc::new(RAMDirectory::new());
        let pool = ReaderPool::new(Arc::clone(&dir), true);
        let stream = BufferedUpdatesStream::default();

        let seg0 = write_segment(&dir, "_0", 10)?;
        let seg1 = write_segment(&dir, "_1", 4)?;

        // seg1 was flushed with a private query delete limited to its first 2 docs
        let mut private = BufferedUpdates::new("_1");
        private.add_query(Arc::new(TermQuery::new(Term::from_text("body", "even"))), 2);
        let private_gen = stream.push(FrozenBufferedUpdates::new(&mut private, true))?;
        seg1.set_buffered_deletes_gen(private_gen as i64);
        seg0.set_buffered_deletes_gen(private_gen as i64 - 1);

        stream.push(frozen_terms(&[("id", "0003"), ("id", "0001")]))?;

        let infos = vec![Arc::clone(&seg0), Arc::clone(&seg1)];
        let result = stream.apply_deletes_and_updates(&pool, &infos)?;
        assert!(result.any_deletes);
        assert!(result.all_deleted.is_empty());

        // the global terms hit both segments, the private query only doc 0 of seg1
        assert_eq!(pool.num_deleted_docs(&seg0)?, 2);
        assert_eq!(pool.num_deleted_docs(&seg1)?, 3);
        assert_eq!(seg0.buffered_deletes_gen(), result.gen as i64);

        // everything is applied now
        let again = stream.apply_deletes_and_updates(&pool, &infos)?;
        assert!(!again.any_deletes);
        Ok(())
    }

    #[test]
    fn test_apply_reports_fully_deleted_segment() -> Result<()> {
        let dir: Arc<dyn Directory> = Arc::new(RAMDirectory::new());
        let pool = ReaderPool::new(Arc::clone(&dir), true);
        let stream = BufferedUpdatesStream::default();
        let seg = write_segment(&dir, "_0", 3)?;

        let mut updates = BufferedUpdates::new("global");
        updates.add_query(
            Arc::new(crate::core::search::MatchAllDocsQuery),
            DocId::max_value(),
        );
        stream.push(FrozenBufferedUpdates::new(&mut updates, false))?;

        let result = stream.apply_deletes_and_updates(&pool, &[Arc::clone(&seg)])?;
        assert_eq!(result.all_deleted.len(), 1);
        assert_eq!(result.all_deleted[0].name(), "_0");
        Ok(())
    }
}
