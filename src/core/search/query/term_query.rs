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

use crate::core::doc::Term;
use crate::core::index::reader::SegmentReader;
use crate::core::search::Query;
use crate::core::util::DocId;
use crate::error::Result;

pub const TERM: &str = "term";

/// A Query that matches documents containing a term.
#[derive(Clone, Debug, PartialEq)]
pub struct TermQuery {
    pub term: Term,
}

impl TermQuery {
    pub fn new(term: Term) -> TermQuery {
        TermQuery { term }
    }

    #[inline]
    pub fn term(&self) -> &Term {
        &self.term
    }
}

impl Query for TermQuery {
    fn matching_docs(&self, reader: &SegmentReader) -> Result<Vec<DocId>> {
        Ok(reader.postings(&self.term).map(<[DocId]>::to_vec).unwrap_or_default())
    }

    fn query_type(&self) -> &'static str {
        TERM
    }
}

impl fmt::Display for TermQuery {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "TermQuery(field: {}, term: {})", self.term.field, String::from_utf8_lossy(&self.term.bytes))
    }
}
