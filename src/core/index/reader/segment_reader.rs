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

use std::fmt;
use std::sync::Arc;

use crate::core::codec::segment_infos::SegmentCommitInfo;
use crate::core::codec::{Codec, InvertedSegment, TermPostings};
use crate::core::doc::{Document, Term};
use crate::core::index::reader::{IndexReader, LeafReaderContext};
use crate::core::store::{Directory, IOContext};
use crate::core::util::{Bits, DocId, FixedBitSet};
use crate::error::{ErrorKind::IllegalArgument, Result};

/// Holds the core readers shared by all `SegmentReader`s of one segment,
/// whatever their deletes.
pub struct SegmentCoreReaders {
    pub segment_name: String,
    max_doc: i32,
    postings: Vec<TermPostings>,
    stored: Vec<Document>,
}

impl SegmentCoreReaders {
    pub fn new(
        dir: &Arc<dyn Directory>,
        si: &SegmentCommitInfo,
        ctx: &IOContext,
    ) -> Result<SegmentCoreReaders> {
        let codec = &si.info.codec;
        let cfs_dir = if si.info.is_compound_file() {
            codec
                .compound_format()
                .get_compound_reader(Arc::clone(dir), &si.info, ctx)?
        } else {
            Arc::clone(dir)
        };
        let segment = codec
            .postings_format()
            .read(cfs_dir.as_ref(), &si.info.name, ctx)?;
        if segment.max_doc != si.info.max_doc() {
            bail!(IllegalArgument(format!(
                "segment {} holds {} docs but its info says {}",
                si.info.name,
                segment.max_doc,
                si.info.max_doc()
            )));
        }
        Ok(SegmentCoreReaders::from_segment(&si.info.name, segment))
    }

    pub fn from_segment(name: &str, segment: InvertedSegment) -> SegmentCoreReaders {
        SegmentCoreReaders {
            segment_name: name.to_string(),
            max_doc: segment.max_doc,
            postings: segment.postings,
            stored: segment.stored,
        }
    }

    fn postings(&self, term: &Term) -> Option<&[DocId]> {
        self.postings
            .binary_search_by(|p| p.term.cmp(term))
            .ok()
            .map(|idx| self.postings[idx].docs.as_slice())
    }
}

/// IndexReader implementation over a single segment.
///
/// Instances pointing to the same segment (but with different deletes)
/// share the same core data.
pub struct SegmentReader {
    pub si: Arc<SegmentCommitInfo>,
    // None means every doc is live
    live_docs: Option<Arc<FixedBitSet>>,
    num_docs: i32,
    pub core: Arc<SegmentCoreReaders>,
    pub is_nrt: bool,
}

impl SegmentReader {
    /// Constructs a new SegmentReader with a new core.
    pub fn open(si: &Arc<SegmentCommitInfo>, ctx: &IOContext) -> Result<SegmentReader> {
        let core = Arc::new(SegmentCoreReaders::new(&si.info.directory, si, ctx)?);
        let num_docs = si.info.max_doc() - si.del_count();

        let live_docs = if si.has_deletions() {
            let codec: &Arc<dyn Codec> = &si.info.codec;
            let bits = codec.live_docs_format().read_live_docs(
                si.info.directory.as_ref(),
                si,
                &IOContext::READ,
            )?;
            Some(Arc::new(bits))
        } else {
            debug_assert_eq!(si.del_count(), 0);
            None
        };

        Ok(SegmentReader {
            si: Arc::clone(si),
            live_docs,
            num_docs,
            core,
            is_nrt: false,
        })
    }

    /// Create a new SegmentReader sharing core from a previous SegmentReader
    /// and using the provided in-memory live docs.
    pub fn with_live_docs(
        si: Arc<SegmentCommitInfo>,
        sr: &SegmentReader,
        live_docs: Option<Arc<FixedBitSet>>,
        num_docs: i32,
        is_nrt: bool,
    ) -> Result<SegmentReader> {
        let max_doc = si.info.max_doc();
        if num_docs > max_doc {
            bail!(IllegalArgument(format!(
                "num_docs={}, but max_doc={}",
                num_docs, max_doc
            )));
        }
        if let Some(ref bits) = live_docs {
            if bits.len() != max_doc as usize {
                bail!(IllegalArgument(format!(
                    "max_doc={}, but live_docs.len()={}",
                    max_doc,
                    bits.len()
                )));
            }
        }
        Ok(SegmentReader {
            si,
            live_docs,
            num_docs,
            core: Arc::clone(&sr.core),
            is_nrt,
        })
    }

    pub fn name(&self) -> &str {
        &self.si.info.name
    }

    pub fn max_doc(&self) -> i32 {
        self.core.max_doc
    }

    pub fn num_docs(&self) -> i32 {
        self.num_docs
    }

    pub fn num_deleted_docs(&self) -> i32 {
        self.max_doc() - self.num_docs
    }

    pub fn live_docs(&self) -> Option<&Arc<FixedBitSet>> {
        self.live_docs.as_ref()
    }

    pub fn is_live(&self, doc: DocId) -> bool {
        self.check_bounds(doc);
        match self.live_docs {
            Some(ref bits) => bits.get(doc as usize),
            None => true,
        }
    }

    pub fn check_bounds(&self, doc_id: DocId) {
        debug_assert!(
            doc_id >= 0 && doc_id < self.max_doc(),
            "doc_id={} max_doc={}",
            doc_id,
            self.max_doc()
        );
    }

    /// Docs containing `term`, ascending, deleted ones included.
    pub fn postings(&self, term: &Term) -> Option<&[DocId]> {
        self.core.postings(term)
    }

    pub fn doc_freq(&self, term: &Term) -> i32 {
        self.postings(term).map_or(0, |docs| docs.len() as i32)
    }

    /// All terms of the segment with their postings, in term order.
    pub fn terms(&self) -> &[TermPostings] {
        &self.core.postings
    }

    pub fn stored_document(&self, doc_id: DocId) -> Result<&Document> {
        match self.core.stored.get(doc_id as usize) {
            Some(doc) if doc_id >= 0 => Ok(doc),
            _ => bail!(IllegalArgument(format!(
                "doc {} out of bounds for segment {} with max_doc {}",
                doc_id,
                self.name(),
                self.max_doc()
            ))),
        }
    }
}

impl IndexReader for SegmentReader {
    fn leaves(&self) -> Vec<LeafReaderContext<'_>> {
        vec![LeafReaderContext::new(self, 0, 0)]
    }

    fn document(&self, doc_id: DocId) -> Result<Document> {
        self.stored_document(doc_id).map(Document::clone)
    }

    fn max_doc(&self) -> i32 {
        SegmentReader::max_doc(self)
    }

    fn num_docs(&self) -> i32 {
        self.num_docs
    }
}

impl fmt::Display for SegmentReader {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "SegmentReader({}, num_docs={})", self.si, self.num_docs)
    }
}

impl fmt::Debug for SegmentReader {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::core::codec::segment_infos::SegmentInfo;
    use crate::core::codec::DefaultCodec;
    use crate::core::doc::Field;
    use crate::core::search::{MatchAllDocsQuery, Query, TermQuery};
    use crate::core::store::RAMDirectory;
    use crate::core::util::random_id;
    use std::collections::HashMap;

    /// Writes a segment where doc `i` has `id:i` and `body:even|odd`.
    pub(crate) fn write_segment(
        dir: &Arc<dyn Directory>,
        name: &str,
        max_doc: i32,
    ) -> Result<Arc<SegmentCommitInfo>> {
        let codec = DefaultCodec::shared();
        let mut postings = vec![];
        let mut stored = vec![];
        for i in 0..max_doc {
            postings.push(TermPostings {
                term: Term::from_text("id", &format!("{:04}", i)),
                docs: vec![i],
            });
            stored.push(Document::with_fields(vec![Field::string(
                "id",
                &format!("{:04}", i),
            )]));
        }
        let evens: Vec<DocId> = (0..max_doc).filter(|d| d % 2 == 0).collect();
        let odds: Vec<DocId> = (0..max_doc).filter(|d| d % 2 == 1).collect();
        postings.push(TermPostings {
            term: Term::from_text("body", "even"),
            docs: evens,
        });
        postings.push(TermPostings {
            term: Term::from_text("body", "odd"),
            docs: odds,
        });
        postings.sort_by(|a, b| a.term.cmp(&b.term));
        let segment = InvertedSegment {
            max_doc,
            postings,
            stored,
        };
        codec
            .postings_format()
            .write(dir.as_ref(), name, &segment, &IOContext::Default)?;
        let info = SegmentInfo::new(
            name,
            max_doc,
            Arc::clone(dir),
            false,
            Arc::clone(&codec),
            HashMap::new(),
            random_id(),
        );
        let files = codec.postings_format().files(name).into_iter().collect();
        info.set_files(&files)?;
        codec
            .segment_info_format()
            .write(dir.as_ref(), &info, &IOContext::Default)?;
        Ok(Arc::new(SegmentCommitInfo::new(Arc::new(info), 0, -1)))
    }

    #[test]
    fn test_open_and_query() -> Result<()> {
        let dir: Arc<dyn Directory> = Arc::new(RAMDirectory::new());
        let si = write_segment(&dir, "_0", 10)?;
        let reader = SegmentReader::open(&si, &IOContext::READ)?;
        assert_eq!(reader.max_doc(), 10);
        assert_eq!(reader.num_docs(), 10);
        assert_eq!(reader.doc_freq(&Term::from_text("body", "even")), 5);
        assert_eq!(reader.postings(&Term::from_text("body", "none")), None);
        assert_eq!(reader.stored_document(3)?.get("id"), Some("0003"));
        assert!(reader.stored_document(10).is_err());

        let query = TermQuery::new(Term::from_text("id", "0007"));
        assert_eq!(query.matching_docs(&reader)?, vec![7]);
        assert_eq!(MatchAllDocsQuery.matching_docs(&reader)?.len(), 10);
        Ok(())
    }

    #[test]
    fn test_with_live_docs_shares_core() -> Result<()> {
        let dir: Arc<dyn Directory> = Arc::new(RAMDirectory::new());
        let si = write_segment(&dir, "_0", 4)?;
        let reader = SegmentReader::open(&si, &IOContext::READ)?;
        let mut bits = FixedBitSet::all_set(4);
        bits.clear(1);
        let nrt = SegmentReader::with_live_docs(
            Arc::clone(&si),
            &reader,
            Some(Arc::new(bits)),
            3,
            true,
        )?;
        assert!(Arc::ptr_eq(&nrt.core, &reader.core));
        assert!(!nrt.is_live(1));
        assert!(reader.is_live(1));
        assert_eq!(nrt.count(&MatchAllDocsQuery)?, 3);

        assert!(SegmentReader::with_live_docs(Arc::clone(&si), &reader, None, 5, true).is_err());
        Ok(())
    }

    #[test]
    fn test_open_reads_compound_and_live_docs() -> Result<()> {
        let dir: Arc<dyn Directory> = Arc::new(RAMDirectory::new());
        let si = write_segment(&dir, "_2", 3)?;
        let codec = DefaultCodec::shared();

        codec
            .compound_format()
            .write(dir.as_ref(), &si.info, &IOContext::Default)?;
        si.info.set_use_compound_file(true);

        let mut bits = FixedBitSet::all_set(3);
        bits.clear(0);
        codec
            .live_docs_format()
            .write_live_docs(&bits, dir.as_ref(), &si, 1, &IOContext::Default)?;
        si.advance_del_gen();
        si.set_del_count(1)?;
        // remove the packed originals to be sure reads go through the compound file
        for f in codec.postings_format().files("_2") {
            dir.delete_file(&f)?;
        }

        let reader = SegmentReader::open(&si, &IOContext::READ)?;
        assert_eq!(reader.num_docs(), 2);
        assert!(!reader.is_live(0));
        assert_eq!(reader.doc_freq(&Term::from_text("body", "odd")), 1);
        Ok(())
    }
}
