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

mod directory_reader;

pub use self::directory_reader::*;

mod segment_reader;

pub use self::segment_reader::*;

#[cfg(test)]
pub(crate) use self::segment_reader::tests::write_segment;

use crate::core::doc::{Document, Term};
use crate::core::search::Query;
use crate::core::util::DocId;
use crate::error::Result;

/// A point-in-time view of an index.
///
/// Changes made through an `IndexWriter` are not visible until a new reader
/// is opened, either from the last commit or from the writer itself.
pub trait IndexReader {
    fn leaves(&self) -> Vec<LeafReaderContext<'_>>;
    fn document(&self, doc_id: DocId) -> Result<Document>;
    fn max_doc(&self) -> i32;
    fn num_docs(&self) -> i32;
    fn num_deleted_docs(&self) -> i32 {
        self.max_doc() - self.num_docs()
    }
    fn has_deletions(&self) -> bool {
        self.num_deleted_docs() > 0
    }

    /// Number of documents containing `term`, deleted ones included.
    fn doc_freq(&self, term: &Term) -> i32 {
        self.leaves()
            .iter()
            .map(|ctx| ctx.reader.doc_freq(term))
            .sum()
    }

    /// Number of live documents matching `query`.
    fn count(&self, query: &dyn Query) -> Result<usize> {
        let mut total = 0;
        for ctx in self.leaves() {
            for doc in query.matching_docs(ctx.reader)? {
                if ctx.reader.is_live(doc) {
                    total += 1;
                }
            }
        }
        Ok(total)
    }

    fn leaf_reader_for_doc(&self, doc: DocId) -> Option<LeafReaderContext<'_>> {
        let leaves = self.leaves();
        let idx = leaves.iter().rposition(|ctx| ctx.doc_base <= doc)?;
        let ctx = leaves[idx];
        if doc - ctx.doc_base < ctx.reader.max_doc() {
            Some(ctx)
        } else {
            None
        }
    }
}

/// A segment reader together with its position in the composite reader.
#[derive(Clone, Copy)]
pub struct LeafReaderContext<'a> {
    /// The reader's ord in the top-level's leaves array
    pub ord: usize,
    /// The reader's absolute doc base
    pub doc_base: DocId,
    pub reader: &'a SegmentReader,
}

impl<'a> LeafReaderContext<'a> {
    pub fn new(reader: &'a SegmentReader, ord: usize, doc_base: DocId) -> Self {
        LeafReaderContext {
            ord,
            doc_base,
            reader,
        }
    }
}
