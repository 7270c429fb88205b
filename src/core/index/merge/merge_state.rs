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

use crate::core::index::reader::SegmentReader;
use crate::core::util::{Bits, DocId, FixedBitSet};
use crate::error::{ErrorKind::IllegalArgument, Result};

use std::sync::Arc;

/// A map of doc IDs use for merge.
pub trait DocMap {
    /// Return the mapped doc_id or -1 if the given doc is not mapped
    fn get(&self, doc_id: DocId) -> DocId;
}

/// `DocMap` based on live docs `Bits`: live docs keep their relative order
/// and are shifted down past the deleted ones, then offset by `doc_base`.
#[derive(Debug)]
pub struct LiveDocsDocMap {
    // new id relative to doc_base, -1 for deleted docs
    new_ids: Vec<DocId>,
    doc_base: DocId,
    num_live: i32,
}

impl LiveDocsDocMap {
    pub fn new(live_docs: Option<&FixedBitSet>, max_doc: i32, doc_base: DocId) -> Self {
        let mut new_ids = Vec::with_capacity(max_doc as usize);
        let mut next = 0;
        for doc in 0..max_doc {
            if live_docs.map_or(true, |bits| bits.get(doc as usize)) {
                new_ids.push(next);
                next += 1;
            } else {
                new_ids.push(-1);
            }
        }
        LiveDocsDocMap {
            new_ids,
            doc_base,
            num_live: next,
        }
    }

    pub fn doc_base(&self) -> DocId {
        self.doc_base
    }

    pub fn num_live(&self) -> i32 {
        self.num_live
    }
}

impl DocMap for LiveDocsDocMap {
    fn get(&self, doc_id: DocId) -> DocId {
        match self.new_ids.get(doc_id as usize) {
            Some(&id) if doc_id >= 0 && id >= 0 => self.doc_base + id,
            _ => -1,
        }
    }
}

/// Holds common state used during segment merging.
pub struct MergeState {
    /// Maps document IDs from old segments to document IDs in the new segment
    pub doc_maps: Vec<Arc<LiveDocsDocMap>>,
    pub readers: Vec<Arc<SegmentReader>>,
    /// Live docs of each reader as of the moment the merge started.
    pub live_docs: Vec<Option<Arc<FixedBitSet>>>,
    pub max_docs: Vec<i32>,
    /// Number of docs the merged segment will hold.
    pub merged_max_doc: i32,
}

impl MergeState {
    pub fn new(
        readers: Vec<Arc<SegmentReader>>,
        live_docs: Vec<Option<Arc<FixedBitSet>>>,
    ) -> Result<Self> {
        if readers.len() != live_docs.len() {
            bail!(IllegalArgument(format!(
                "{} readers but {} live docs",
                readers.len(),
                live_docs.len()
            )));
        }
        let mut doc_maps = Vec::with_capacity(readers.len());
        let mut max_docs = Vec::with_capacity(readers.len());
        let mut doc_base = 0;
        for (reader, bits) in readers.iter().zip(live_docs.iter()) {
            let max_doc = reader.max_doc();
            if let Some(bits) = bits {
                if bits.len() != max_doc as usize {
                    bail!(IllegalArgument(format!(
                        "live docs of {} hold {} bits for max_doc {}",
                        reader.name(),
                        bits.len(),
                        max_doc
                    )));
                }
            }
            let doc_map = LiveDocsDocMap::new(bits.as_ref().map(|b| b.as_ref()), max_doc, doc_base);
            doc_base += doc_map.num_live();
            doc_maps.push(Arc::new(doc_map));
            max_docs.push(max_doc);
        }
        Ok(MergeState {
            doc_maps,
            readers,
            live_docs,
            max_docs,
            merged_max_doc: doc_base,
        })
    }

    pub fn is_live(&self, reader_idx: usize, doc: DocId) -> bool {
        match self.live_docs[reader_idx] {
            Some(ref bits) => bits.get(doc as usize),
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::index::reader::write_segment;
    use crate::core::store::{Directory, IOContext, RAMDirectory};

    #[test]
    fn test_live_docs_doc_map() {
        let mut bits = FixedBitSet::all_set(6);
        bits.clear(1);
        bits.clear(4);
        let map = LiveDocsDocMap::new(Some(&bits), 6, 10);
        assert_eq!(map.num_live(), 4);
        let mapped: Vec<DocId> = (0..6).map(|d| map.get(d)).collect();
        assert_eq!(mapped, vec![10, -1, 11, 12, -1, 13]);
        assert_eq!(map.get(6), -1);

        let all = LiveDocsDocMap::new(None, 3, 0);
        assert_eq!((0..3).map(|d| all.get(d)).collect::<Vec<_>>(), vec![0, 1, 2]);
    }

    #[test]
    fn test_merge_state_stacks_doc_bases() -> Result<()> {
        let dir: Arc<dyn Directory> = Arc::new(RAMDirectory::new());
        let r0 = Arc::new(SegmentReader::open(&write_segment(&dir, "_0", 4)?, &IOContext::READ)?);
        let r1 = Arc::new(SegmentReader::open(&write_segment(&dir, "_1", 3)?, &IOContext::READ)?);
        let mut bits = FixedBitSet::all_set(4);
        bits.clear(0);
        let state = MergeState::new(vec![r0, r1], vec![Some(Arc::new(bits)), None])?;
        assert_eq!(state.merged_max_doc, 6);
        assert_eq!(state.doc_maps[1].doc_base(), 3);
        assert_eq!(state.doc_maps[0].get(0), -1);
        assert_eq!(state.doc_maps[1].get(2), 5);
        assert!(!state.is_live(0, 0));
        Ok(())
    }
}
