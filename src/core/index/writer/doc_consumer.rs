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

use crate::core::analysis::Analyzer;
use crate::core::codec::{Codec, InvertedSegment, TermPostings};
use crate::core::doc::{Document, Term};
use crate::core::store::{Directory, IOContext};
use crate::core::util::DocId;
use crate::error::{ErrorKind::IllegalArgument, Result};

use std::collections::HashMap;
use std::mem;
use std::sync::Arc;

/// Absolute hard maximum length for a term, in bytes once encoded as UTF8.
/// If a term arrives from the analyzer longer than this length, an error is
/// returned and the document is not indexed.
pub const MAX_TERM_LENGTH: usize = 32766;

// Rough logic: a hash map entry holding the term and its Vec of doc ids.
const BYTES_PER_POSTING_TERM: usize = 8 * mem::size_of::<usize>();
const BYTES_PER_POSTING: usize = mem::size_of::<DocId>();
const BYTES_PER_STORED_FIELD: usize = 4 * mem::size_of::<usize>();

/// Inverts documents into in-memory postings and buffers their stored
/// fields until the segment is flushed.
pub struct DocConsumer {
    analyzer: Arc<dyn Analyzer>,
    postings: HashMap<Term, Vec<DocId>>,
    stored: Vec<Document>,
    bytes_used: u64,
}

impl DocConsumer {
    pub fn new(analyzer: Arc<dyn Analyzer>) -> Self {
        DocConsumer {
            analyzer,
            postings: HashMap::new(),
            stored: vec![],
            bytes_used: 0,
        }
    }

    /// Adds `doc` as `doc_id`. Either the whole document is buffered or,
    /// on error, nothing of it.
    pub fn process_document(&mut self, doc_id: DocId, doc: &Document) -> Result<()> {
        debug_assert!(doc_id as usize >= self.stored.len());

        // invert first so a failing field leaves no partial postings behind
        let mut terms = Vec::new();
        for field in &doc.fields {
            if !field.field_type.indexed {
                continue;
            }
            if field.field_type.tokenized {
                for token in self.analyzer.tokenize(&field.name, &field.value)? {
                    terms.push(Self::check_term(&field.name, token)?);
                }
            } else {
                terms.push(Self::check_term(&field.name, field.value.clone())?);
            }
        }

        for term in terms {
            let docs = match self.postings.get_mut(&term) {
                Some(docs) => docs,
                None => {
                    self.bytes_used += (BYTES_PER_POSTING_TERM + term.ram_bytes_used()) as u64;
                    self.postings.entry(term).or_insert_with(Vec::new)
                }
            };
            if docs.last() != Some(&doc_id) {
                docs.push(doc_id);
                self.bytes_used += BYTES_PER_POSTING as u64;
            }
        }

        let mut stored = Document::new();
        for field in &doc.fields {
            if field.field_type.stored {
                self.bytes_used +=
                    (BYTES_PER_STORED_FIELD + field.name.len() + field.value.len()) as u64;
                stored.add(field.clone());
            }
        }
        self.pad_stored(doc_id as usize);
        self.stored.push(stored);
        Ok(())
    }

    fn check_term(field: &str, text: String) -> Result<Term> {
        if text.len() > MAX_TERM_LENGTH {
            let prefix: String = text.chars().take(30).collect();
            bail!(IllegalArgument(format!(
                "Document contains at least one immense term in field=\"{}\" (whose UTF8 \
                 encoding is longer than the max length {}), all of which were skipped. The \
                 prefix of the first immense term is: '{}...'",
                field, MAX_TERM_LENGTH, prefix
            )));
        }
        Ok(Term::new(field.to_string(), text.into_bytes()))
    }

    // documents that failed keep their doc id with no stored fields
    fn pad_stored(&mut self, len: usize) {
        while self.stored.len() < len {
            self.stored.push(Document::new());
        }
    }

    /// Docs buffered so far that contain `term`, ascending.
    pub fn postings(&self, term: &Term) -> Option<&[DocId]> {
        self.postings.get(term).map(|docs| docs.as_slice())
    }

    pub fn bytes_used(&self) -> u64 {
        self.bytes_used
    }

    pub fn num_terms(&self) -> usize {
        self.postings.len()
    }

    /// Writes everything buffered as segment `segment_name` holding
    /// `num_docs` docs, and resets this consumer.
    pub fn flush(
        &mut self,
        codec: &Arc<dyn Codec>,
        dir: &dyn Directory,
        segment_name: &str,
        num_docs: i32,
        context: &IOContext,
    ) -> Result<()> {
        let mut postings: Vec<TermPostings> = self
            .postings
            .drain()
            .map(|(term, docs)| TermPostings { term, docs })
            .collect();
        postings.sort_by(|a, b| a.term.cmp(&b.term));

        self.pad_stored(num_docs as usize);
        let stored = mem::replace(&mut self.stored, vec![]);
        self.bytes_used = 0;

        let segment = InvertedSegment {
            max_doc: num_docs,
            postings,
            stored,
        };
        codec
            .postings_format()
            .write(dir, segment_name, &segment, context)
    }

    pub fn abort(&mut self) {
        self.postings.clear();
        self.stored.clear();
        self.bytes_used = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::analysis::WhitespaceAnalyzer;
    use crate::core::codec::DefaultCodec;
    use crate::core::doc::{Field, FieldType};
    use crate::core::store::RAMDirectory;
    use crate::error::ErrorKind;

    #[derive(Debug)]
    struct FailingAnalyzer;

    impl Analyzer for FailingAnalyzer {
        fn tokenize(&self, field: &str, text: &str) -> Result<Vec<String>> {
            if text.contains("boom") {
                bail!(ErrorKind::Aborting(format!("analyzer blew up on {}", field)));
            }
            if text.contains("bad") {
                bail!(IllegalArgument(format!("bad token in {}", field)));
            }
            WhitespaceAnalyzer.tokenize(field, text)
        }
    }

    fn doc(id: &str, body: &str) -> Document {
        Document::with_fields(vec![Field::string("id", id), Field::text("body", body)])
    }

    #[test]
    fn test_invert_and_dedupe() -> Result<()> {
        let mut consumer = DocConsumer::new(Arc::new(WhitespaceAnalyzer));
        consumer.process_document(0, &doc("a", "red red fox"))?;
        consumer.process_document(1, &doc("b", "blue fox"))?;
        assert_eq!(
            consumer.postings(&Term::from_text("body", "red")),
            Some(&[0][..])
        );
        assert_eq!(
            consumer.postings(&Term::from_text("body", "fox")),
            Some(&[0, 1][..])
        );
        assert_eq!(consumer.postings(&Term::from_text("id", "b")), Some(&[1][..]));
        assert_eq!(consumer.num_terms(), 5);
        assert!(consumer.bytes_used() > 0);
        Ok(())
    }

    #[test]
    fn test_failed_document_leaves_nothing_behind() -> Result<()> {
        let mut consumer = DocConsumer::new(Arc::new(FailingAnalyzer));
        consumer.process_document(0, &doc("a", "fine"))?;
        let bytes = consumer.bytes_used();

        let err = consumer.process_document(1, &doc("b", "bad"));
        assert!(!err.unwrap_err().is_aborting());
        let err = consumer.process_document(1, &doc("b", "boom"));
        assert!(err.unwrap_err().is_aborting());
        assert_eq!(consumer.postings(&Term::from_text("id", "b")), None);
        assert_eq!(consumer.bytes_used(), bytes);

        let huge = "x".repeat(MAX_TERM_LENGTH + 1);
        let keyword = Document::with_fields(vec![Field::new("id", &huge, FieldType::STRING)]);
        let err = consumer.process_document(1, &keyword).unwrap_err();
        assert!(!err.is_aborting());

        consumer.process_document(2, &doc("c", "fine"))?;
        assert_eq!(
            consumer.postings(&Term::from_text("body", "fine")),
            Some(&[0, 2][..])
        );
        Ok(())
    }

    #[test]
    fn test_flush_writes_readable_segment() -> Result<()> {
        let dir = RAMDirectory::new();
        let codec = DefaultCodec::shared();
        let mut consumer = DocConsumer::new(Arc::new(WhitespaceAnalyzer));
        consumer.process_document(0, &doc("a", "one two"))?;
        // doc 1 failed and was skipped
        consumer.process_document(2, &doc("c", "two"))?;
        consumer.flush(&codec, &dir, "_0", 3, &IOContext::Default)?;
        assert_eq!(consumer.bytes_used(), 0);
        assert_eq!(consumer.num_terms(), 0);

        let segment = codec.postings_format().read(&dir, "_0", &IOContext::READ)?;
        assert_eq!(segment.max_doc, 3);
        assert_eq!(segment.stored.len(), 3);
        assert_eq!(segment.stored[1], Document::new());
        let two = segment
            .postings
            .iter()
            .find(|p| p.term == Term::from_text("body", "two"))
            .map(|p| p.docs.clone());
        assert_eq!(two, Some(vec![0, 2]));
        Ok(())
    }
}
