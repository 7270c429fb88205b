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

use crate::core::codec::segment_infos::{SegmentInfos, INDEX_FILE_SEGMENTS};
use crate::core::codec::Codec;
use crate::core::doc::Document;
use crate::core::index::reader::{IndexReader, LeafReaderContext, SegmentReader};
use crate::core::store::{Directory, IOContext};
use crate::core::util::DocId;
use crate::error::{ErrorKind::IllegalArgument, Result};

/// Returns true if an index likely exists at the specified directory. Note
/// that a corrupt index, or one whose first commit is still in progress,
/// also counts as existing.
pub fn index_exists(directory: &dyn Directory) -> Result<bool> {
    let prefix = format!("{}_", INDEX_FILE_SEGMENTS);
    Ok(directory.list_all()?.iter().any(|f| f.starts_with(&prefix)))
}

/// A composite reader over the segments of one commit, or of the writer's
/// current in-memory state for a near real-time reader.
pub struct StandardDirectoryReader {
    directory: Arc<dyn Directory>,
    segment_infos: SegmentInfos,
    max_doc: i32,
    num_docs: i32,
    starts: Vec<i32>,
    readers: Vec<Arc<SegmentReader>>,
    apply_all_deletes: bool,
}

impl StandardDirectoryReader {
    /// Opens the latest commit in `directory`.
    pub fn open(directory: Arc<dyn Directory>, codec: &Arc<dyn Codec>) -> Result<Self> {
        let segment_infos = SegmentInfos::read_latest_commit(&directory, codec)?;
        let mut readers = Vec::with_capacity(segment_infos.len());
        for seg_info in &segment_infos.segments {
            readers.push(Arc::new(SegmentReader::open(seg_info, &IOContext::READ)?));
        }
        StandardDirectoryReader::new(directory, readers, segment_infos, false)
    }

    pub fn new(
        directory: Arc<dyn Directory>,
        readers: Vec<Arc<SegmentReader>>,
        segment_infos: SegmentInfos,
        apply_all_deletes: bool,
    ) -> Result<Self> {
        let mut starts = Vec::with_capacity(readers.len() + 1);
        let mut max_doc: i64 = 0;
        let mut num_docs = 0;
        for r in &readers {
            starts.push(max_doc as i32);
            max_doc += r.max_doc() as i64;
            num_docs += r.num_docs();
        }
        if max_doc > i64::from(::std::i32::MAX) {
            bail!(IllegalArgument(format!(
                "too many documents, composite readers can hold at most {}",
                ::std::i32::MAX
            )));
        }
        starts.push(max_doc as i32);

        Ok(StandardDirectoryReader {
            directory,
            segment_infos,
            max_doc: max_doc as i32,
            num_docs,
            starts,
            readers,
            apply_all_deletes,
        })
    }

    pub fn directory(&self) -> &Arc<dyn Directory> {
        &self.directory
    }

    pub fn segment_infos(&self) -> &SegmentInfos {
        &self.segment_infos
    }

    /// Version of the segment infos this reader was opened on.
    pub fn version(&self) -> i64 {
        self.segment_infos.version
    }

    pub fn apply_all_deletes(&self) -> bool {
        self.apply_all_deletes
    }

    pub fn segment_readers(&self) -> &[Arc<SegmentReader>] {
        &self.readers
    }
}

impl IndexReader for StandardDirectoryReader {
    fn leaves(&self) -> Vec<LeafReaderContext<'_>> {
        self.readers
            .iter()
            .enumerate()
            .map(|(i, r)| LeafReaderContext::new(r.as_ref(), i, self.starts[i]))
            .collect()
    }

    fn document(&self, doc_id: DocId) -> Result<Document> {
        match self.leaf_reader_for_doc(doc_id) {
            Some(ctx) => ctx.reader.document(doc_id - ctx.doc_base),
            None => bail!(IllegalArgument(format!(
                "doc {} out of bounds, max_doc={}",
                doc_id, self.max_doc
            ))),
        }
    }

    fn max_doc(&self) -> i32 {
        self.max_doc
    }

    fn num_docs(&self) -> i32 {
        self.num_docs
    }
}

impl fmt::Debug for StandardDirectoryReader {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "StandardDirectoryReader(")?;
        for (i, r) in self.readers.iter().enumerate() {
            if i > 0 {
                write!(f, " ")?;
            }
            write!(f, "{}", r.si)?;
        }
        write!(f, ")")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::codec::DefaultCodec;
    use crate::core::doc::Term;
    use crate::core::index::reader::write_segment;
    use crate::core::search::TermQuery;
    use crate::core::store::RAMDirectory;

    #[test]
    fn test_open_latest_commit() -> Result<()> {
        let dir: Arc<dyn Directory> = Arc::new(RAMDirectory::new());
        let codec = DefaultCodec::shared();
        assert!(!index_exists(dir.as_ref())?);
        assert!(StandardDirectoryReader::open(Arc::clone(&dir), &codec)
            .unwrap_err()
            .is_not_found());

        let mut infos = SegmentInfos::default();
        let a = infos.new_segment_name();
        infos.add(write_segment(&dir, &a, 4)?);
        let b = infos.new_segment_name();
        infos.add(write_segment(&dir, &b, 6)?);
        infos.prepare_commit(dir.as_ref())?;
        infos.finish_commit(dir.as_ref())?;
        assert!(index_exists(dir.as_ref())?);

        let reader = StandardDirectoryReader::open(Arc::clone(&dir), &codec)?;
        assert_eq!(reader.max_doc(), 10);
        assert_eq!(reader.num_docs(), 10);
        assert_eq!(reader.leaves().len(), 2);
        assert_eq!(reader.doc_freq(&Term::from_text("body", "even")), 5);
        assert_eq!(reader.count(&TermQuery::new(Term::from_text("id", "0005")))?, 1);
        // second segment, local doc 1
        assert_eq!(reader.document(5)?.get("id"), Some("0001"));
        assert!(reader.document(10).is_err());
        Ok(())
    }
}
