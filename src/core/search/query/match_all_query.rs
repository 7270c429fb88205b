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

use crate::core::index::reader::SegmentReader;
use crate::core::search::Query;
use crate::core::util::DocId;
use crate::error::Result;

pub const MATCH_ALL: &str = "match_all";

/// A query that matches all documents.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct MatchAllDocsQuery;

impl Query for MatchAllDocsQuery {
    fn matching_docs(&self, reader: &SegmentReader) -> Result<Vec<DocId>> {
        Ok((0..reader.max_doc()).collect())
    }

    fn query_type(&self) -> &'static str {
        MATCH_ALL
    }
}

impl fmt::Display for MatchAllDocsQuery {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "MatchAllDocsQuery()")
    }
}
