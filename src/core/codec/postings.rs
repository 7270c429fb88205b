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

use crate::core::codec::{read_index_file, segment_file_name, write_index_file};
use crate::core::doc::{Document, Term};
use crate::core::store::{Directory, IOContext};
use crate::core::util::DocId;
use crate::error::{ErrorKind::CorruptIndex, Result};

/// The postings of one term: every doc containing it, ascending.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TermPostings {
    pub term: Term,
    pub docs: Vec<DocId>,
}

/// The decoded content of one segment: postings sorted by term and the
/// stored fields of every document, indexed by doc id.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InvertedSegment {
    pub max_doc: i32,
    pub postings: Vec<TermPostings>,
    pub stored: Vec<Document>,
}

impl InvertedSegment {
    /// Checks the invariants every writer must uphold before encoding.
    pub fn validate(&self) -> Result<()> {
        if self.stored.len() != self.max_doc as usize {
            bail!(CorruptIndex(format!(
                "stored fields hold {} docs but max_doc is {}",
                self.stored.len(),
                self.max_doc
            )));
        }
        for pair in self.postings.windows(2) {
            if pair[0].term >= pair[1].term {
                bail!(CorruptIndex(format!(
                    "terms out of order: {} >= {}",
                    pair[0].term, pair[1].term
                )));
            }
        }
        for p in &self.postings {
            if p.docs.iter().any(|&d| d < 0 || d >= self.max_doc)
                || p.docs.windows(2).any(|w| w[0] >= w[1])
            {
                bail!(CorruptIndex(format!("invalid postings for term {}", p.term)));
            }
        }
        Ok(())
    }
}

/// Encodes/decodes the postings and stored fields of a segment.
pub trait PostingsFormat: Send + Sync + fmt::Debug {
    fn write(
        &self,
        dir: &dyn Directory,
        segment_name: &str,
        segment: &InvertedSegment,
        ctx: &IOContext,
    ) -> Result<()>;

    fn read(&self, dir: &dyn Directory, segment_name: &str, ctx: &IOContext)
        -> Result<InvertedSegment>;

    /// Names of the files `write` creates for this segment.
    fn files(&self, segment_name: &str) -> Vec<String>;
}

const POSTINGS_EXTENSION: &str = "pst";
const STORED_EXTENSION: &str = "fdt";
const POSTINGS_CODEC: &str = "SedimentPostings";
const STORED_CODEC: &str = "SedimentStoredFields";
const VERSION_START: u32 = 0;
const VERSION_CURRENT: u32 = VERSION_START;

#[derive(Serialize, Deserialize)]
struct PostingsData {
    max_doc: i32,
    postings: Vec<TermPostings>,
}

/// Postings and stored fields as JSON payloads inside checksummed files.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonPostingsFormat;

impl PostingsFormat for JsonPostingsFormat {
    fn write(
        &self,
        dir: &dyn Directory,
        segment_name: &str,
        segment: &InvertedSegment,
        ctx: &IOContext,
    ) -> Result<()> {
        segment.validate()?;
        let postings = serde_json::to_vec(&PostingsData {
            max_doc: segment.max_doc,
            postings: segment.postings.clone(),
        })?;
        write_index_file(
            dir,
            &segment_file_name(segment_name, "", POSTINGS_EXTENSION),
            POSTINGS_CODEC,
            VERSION_CURRENT,
            &postings,
            ctx,
        )?;
        let stored = serde_json::to_vec(&segment.stored)?;
        write_index_file(
            dir,
            &segment_file_name(segment_name, "", STORED_EXTENSION),
            STORED_CODEC,
            VERSION_CURRENT,
            &stored,
            ctx,
        )
    }

    fn read(
        &self,
        dir: &dyn Directory,
        segment_name: &str,
        ctx: &IOContext,
    ) -> Result<InvertedSegment> {
        let postings = read_index_file(
            dir,
            &segment_file_name(segment_name, "", POSTINGS_EXTENSION),
            POSTINGS_CODEC,
            VERSION_START,
            VERSION_CURRENT,
            ctx,
        )?;
        let data: PostingsData = serde_json::from_slice(&postings)?;
        let stored = read_index_file(
            dir,
            &segment_file_name(segment_name, "", STORED_EXTENSION),
            STORED_CODEC,
            VERSION_START,
            VERSION_CURRENT,
            ctx,
        )?;
        let stored: Vec<Document> = serde_json::from_slice(&stored)?;
        let segment = InvertedSegment {
            max_doc: data.max_doc,
            postings: data.postings,
            stored,
        };
        segment.validate()?;
        Ok(segment)
    }

    fn files(&self, segment_name: &str) -> Vec<String> {
        vec![
            segment_file_name(segment_name, "", POSTINGS_EXTENSION),
            segment_file_name(segment_name, "", STORED_EXTENSION),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::store::RAMDirectory;

    fn sample() -> InvertedSegment {
        InvertedSegment {
            max_doc: 2,
            postings: vec![
                TermPostings {
                    term: Term::from_text("body", "fox"),
                    docs: vec![0, 1],
                },
                TermPostings {
                    term: Term::from_text("id", "1"),
                    docs: vec![1],
                },
            ],
            stored: vec![Document::new(), Document::new()],
        }
    }

    #[test]
    fn test_write_then_read() -> Result<()> {
        let dir = RAMDirectory::new();
        let format = JsonPostingsFormat;
        format.write(&dir, "_0", &sample(), &IOContext::Default)?;
        let mut listed = dir.list_all()?;
        listed.sort();
        let mut files = format.files("_0");
        files.sort();
        assert_eq!(listed, files);

        let read = format.read(&dir, "_0", &IOContext::READ)?;
        assert_eq!(read.max_doc, 2);
        assert_eq!(read.postings, sample().postings);
        Ok(())
    }

    #[test]
    fn test_validate_rejects_unsorted_terms() {
        let mut segment = sample();
        segment.postings.reverse();
        assert!(segment.validate().is_err());

        let mut segment = sample();
        segment.postings[0].docs = vec![1, 0];
        assert!(segment.validate().is_err());
    }
}
