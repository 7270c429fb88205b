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
use crate::core::util::DocId;
use crate::error::Result;

mod term_query;

pub use self::term_query::*;

mod match_all_query;

pub use self::match_all_query::*;

/// The abstract base for queries.
///
/// A query only needs to enumerate the documents it matches in one segment:
/// the writer uses queries to resolve deletes, never to rank.
pub trait Query: fmt::Display + fmt::Debug + Send + Sync {
    /// The doc ids of `reader` this query matches, ascending. Deleted
    /// documents may be included; callers filter them with the live docs.
    fn matching_docs(&self, reader: &SegmentReader) -> Result<Vec<DocId>>;

    fn query_type(&self) -> &'static str;
}
