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

use crate::error::Result;
use std::cmp::Ordering;
use std::fmt;

/// A Term represents a word from text.  This is the unit of search.  It is
/// composed of two elements, the text of the word, as a string, and the name of
/// the field that the text occurred in.
///
/// Note that terms may represent more than words from text fields, but also
/// things like dates, email addresses, urls, etc.
#[derive(Clone, Debug, PartialEq, Hash, Eq, Serialize, Deserialize)]
pub struct Term {
    pub field: String,
    pub bytes: Vec<u8>,
}

impl Term {
    /// Constructs a Term with the given field and bytes.
    pub fn new(field: String, bytes: Vec<u8>) -> Term {
        Term { field, bytes }
    }

    pub fn from_text(field: &str, text: &str) -> Term {
        Term::new(field.to_string(), text.as_bytes().to_vec())
    }

    /// Returns the field of this term.   The field indicates
    /// the part of a document which this term came from.
    pub fn field(&self) -> &str {
        &self.field
    }

    /// Returns the text of this term.
    pub fn text(&self) -> Result<String> {
        Ok(String::from_utf8(self.bytes.clone())?)
    }

    pub fn is_empty(&self) -> bool {
        self.field.is_empty() && self.bytes.is_empty()
    }

    /// Rough heap footprint, used for RAM accounting of buffered deletes.
    pub fn ram_bytes_used(&self) -> usize {
        self.field.len() + self.bytes.len()
    }
}

impl PartialOrd for Term {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Term {
    fn cmp(&self, other: &Self) -> Ordering {
        let res = self.field.cmp(&other.field);
        if res == Ordering::Equal {
            self.bytes.cmp(&other.bytes)
        } else {
            res
        }
    }
}

impl fmt::Display for Term {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}:{}", self.field, String::from_utf8_lossy(&self.bytes))
    }
}
