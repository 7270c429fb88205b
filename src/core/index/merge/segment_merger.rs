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
use crate::core::codec::{Codec, InvertedSegment, TermPostings};
use crate::core::doc::Term;
use crate::core::index::merge::{DocMap, MergeState};
use crate::core::index::reader::SegmentReader;
use crate::core::store::{Directory, IOContext};
use crate::core::util::{DocId, FixedBitSet};
use crate::error::{
    ErrorKind::{IllegalArgument, IllegalState},
    Result,
};

use std::collections::BTreeMap;
use std::sync::Arc;

/// The SegmentMerger class combines two or more Segments, represented by an
/// IndexReader, into a single Segment.  Call the merge method to combine the
/// segments
pub struct SegmentMerger {
    directory: Arc<dyn Directory>,
    codec: Arc<dyn Codec>,
    context: IOContext,
    segment_info: Arc<SegmentInfo>,
    pub merge_state: MergeState,
}

impl SegmentMerger {
    pub fn new(
        readers: Vec<Arc<SegmentReader>>,
        live_docs: Vec<Option<Arc<FixedBitSet>>>,
        segment_info: Arc<SegmentInfo>,
        directory: Arc<dyn Directory>,
        context: IOContext,
    ) -> Result<Self> {
        if !context.is_merge() {
            bail!(IllegalArgument("IOContext should be merge!".into()));
        }
        let codec = Arc::clone(&segment_info.codec);
        let merge_state = MergeState::new(readers, live_docs)?;
        segment_info.set_max_doc(merge_state.merged_max_doc)?;
        Ok(SegmentMerger {
            directory,
            codec,
            context,
            segment_info,
            merge_state,
        })
    }

    /// True if any merging should happen
    pub fn should_merge(&self) -> bool {
        self.merge_state.merged_max_doc > 0
    }

    /// Merges the readers into the directory passed to the constructor,
    /// returning the number of docs merged.
    pub fn merge(&self) -> Result<i32> {
        if !self.should_merge() {
            bail!(IllegalState(
                "Merge would result in 0 document segment".into()
            ));
        }
        let segment = InvertedSegment {
            max_doc: self.merge_state.merged_max_doc,
            postings: self.merge_terms(),
            stored: self.merge_fields()?,
        };
        if segment.stored.len() != segment.max_doc as usize {
            bail!(IllegalState(format!(
                "merged {} stored docs but expected {}",
                segment.stored.len(),
                segment.max_doc
            )));
        }
        self.codec.postings_format().write(
            self.directory.as_ref(),
            &self.segment_info.name,
            &segment,
            &self.context,
        )?;
        Ok(segment.max_doc)
    }

    /// Merge stored fields from each of the segments into the new one.
    fn merge_fields(&self) -> Result<Vec<crate::core::doc::Document>> {
        let mut stored = Vec::with_capacity(self.merge_state.merged_max_doc as usize);
        for (idx, reader) in self.merge_state.readers.iter().enumerate() {
            for doc in 0..reader.max_doc() {
                if self.merge_state.is_live(idx, doc) {
                    stored.push(reader.stored_document(doc)?.clone());
                }
            }
        }
        Ok(stored)
    }

    /// Remaps the postings of every reader, dropping deleted docs and terms
    /// left without any doc.
    fn merge_terms(&self) -> Vec<TermPostings> {
        let mut merged: BTreeMap<&Term, Vec<DocId>> = BTreeMap::new();
        for (reader, doc_map) in self
            .merge_state
            .readers
            .iter()
            .zip(self.merge_state.doc_maps.iter())
        {
            for postings in reader.terms() {
                let docs = postings
                    .docs
                    .iter()
                    .map(|&doc| doc_map.get(doc))
                    .filter(|&doc| doc >= 0);
                merged.entry(&postings.term).or_default().extend(docs);
            }
        }
        merged
            .into_iter()
            .filter(|(_, docs)| !docs.is_empty())
            .map(|(term, docs)| TermPostings {
                term: term.clone(),
                docs,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::codec::segment_infos::SegmentCommitInfo;
    use crate::core::codec::DefaultCodec;
    use crate::core::index::reader::write_segment;
    use crate::core::store::{MergeInfo, RAMDirectory};
    use crate::core::util::random_id;

    use std::collections::HashMap;

    #[test]
    fn test_merge_drops_deleted_docs() -> Result<()> {
        let dir: Arc<dyn Directory> = Arc::new(RAMDirectory::new());
        let r0 = Arc::new(SegmentReader::open(&write_segment(&dir, "_0", 4)?, &IOContext::READ)?);
        let r1 = Arc::new(SegmentReader::open(&write_segment(&dir, "_1", 2)?, &IOContext::READ)?);
        let mut bits = FixedBitSet::all_set(4);
        bits.clear(1);

        let info = Arc::new(SegmentInfo::new(
            "_2",
            -1,
            Arc::clone(&dir),
            false,
            DefaultCodec::shared(),
            HashMap::new(),
            random_id(),
        ));
        let ctx = IOContext::Merge(MergeInfo::new(6, 0, false, None));
        let merger = SegmentMerger::new(
            vec![r0, r1],
            vec![Some(Arc::new(bits)), None],
            Arc::clone(&info),
            Arc::clone(&dir),
            ctx,
        )?;
        assert!(merger.should_merge());
        assert_eq!(merger.merge()?, 5);
        assert_eq!(info.max_doc(), 5);

        let files = DefaultCodec::shared()
            .postings_format()
            .files("_2")
            .into_iter()
            .collect();
        info.set_files(&files)?;
        let merged = SegmentReader::open(
            &Arc::new(SegmentCommitInfo::new(Arc::clone(&info), 0, -1)),
            &IOContext::READ,
        )?;
        assert_eq!(merged.max_doc(), 5);
        // "_0" docs 0, 2, 3 then "_1" docs 0, 1
        let ids: Vec<String> = (0..5)
            .map(|d| merged.stored_document(d).map(|doc| doc.get("id").unwrap_or("").to_string()))
            .collect::<Result<_>>()?;
        assert_eq!(ids, vec!["0000", "0002", "0003", "0000", "0001"]);
        assert_eq!(
            merged.postings(&Term::from_text("body", "even")),
            Some(&[0, 1, 3][..])
        );
        assert_eq!(merged.postings(&Term::from_text("id", "0001")), Some(&[4][..]));
        Ok(())
    }

    #[test]
    fn test_merge_of_only_deleted_docs_is_refused() -> Result<()> {
        let dir: Arc<dyn Directory> = Arc::new(RAMDirectory::new());
        let r0 = Arc::new(SegmentReader::open(&write_segment(&dir, "_0", 2)?, &IOContext::READ)?);
        let info = Arc::new(SegmentInfo::new(
            "_1",
            -1,
            Arc::clone(&dir),
            false,
            DefaultCodec::shared(),
            HashMap::new(),
            random_id(),
        ));
        let ctx = IOContext::Merge(MergeInfo::new(2, 0, false, None));
        let merger = SegmentMerger::new(
            vec![r0],
            vec![Some(Arc::new(FixedBitSet::new(2)))],
            info,
            dir,
            ctx,
        )?;
        assert!(!merger.should_merge());
        assert!(merger.merge().is_err());
        Ok(())
    }

    #[test]
    fn test_requires_merge_context() -> Result<()> {
        let dir: Arc<dyn Directory> = Arc::new(RAMDirectory::new());
        let info = Arc::new(SegmentInfo::new(
            "_1",
            -1,
            Arc::clone(&dir),
            false,
            DefaultCodec::shared(),
            HashMap::new(),
            random_id(),
        ));
        assert!(SegmentMerger::new(vec![], vec![], info, dir, IOContext::Default).is_err());
        Ok(())
    }
}
