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

use crate::core::doc::Term;
use crate::error::{ErrorKind::CorruptIndex, Result};

use std::cmp::{min, Ordering};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};

/// Prefix codes a sorted list of terms into one byte buffer.
///
/// Each entry stores how many leading bytes it shares with the previous term,
/// switching field only when the field changes.
pub struct PrefixCodedTerms {
    buffer: Vec<u8>,
    pub size: usize,
    del_gen: AtomicU64,
}

impl Default for PrefixCodedTerms {
    fn default() -> Self {
        PrefixCodedTerms::new(Vec::new(), 0)
    }
}

impl PrefixCodedTerms {
    fn new(buffer: Vec<u8>, size: usize) -> Self {
        PrefixCodedTerms {
            buffer,
            size,
            del_gen: AtomicU64::new(0),
        }
    }

    /// Records del gen for this packet.
    pub fn set_del_gen(&self, del_gen: u64) {
        self.del_gen.store(del_gen, AtomicOrdering::Release);
    }

    pub fn del_gen(&self) -> u64 {
        self.del_gen.load(AtomicOrdering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    pub fn ram_bytes_used(&self) -> usize {
        self.buffer.len() + 2 * ::std::mem::size_of::<usize>()
    }

    pub fn iterator(&self) -> PrefixCodedTermsIterator<'_> {
        PrefixCodedTermsIterator {
            buffer: &self.buffer,
            pos: 0,
            field: String::new(),
            bytes: Vec::new(),
        }
    }
}

#[derive(Default)]
pub struct PrefixCodedTermsBuilder {
    output: Vec<u8>,
    last_term: Option<Term>,
    size: usize,
}

impl PrefixCodedTermsBuilder {
    /// Adds a term. Terms must be added in `Term` order without duplicates.
    pub fn add_term(&mut self, term: &Term) {
        debug_assert!(self
            .last_term
            .as_ref()
            .map_or(true, |last| last.cmp(term) == Ordering::Less));

        let (prefix, same_field) = match self.last_term {
            Some(ref last) => (
                shared_prefix_len(&last.bytes, &term.bytes),
                last.field == term.field,
            ),
            None => (0, false),
        };
        let suffix = term.bytes.len() - prefix;

        if same_field {
            write_vint(&mut self.output, (prefix << 1) as u32);
        } else {
            write_vint(&mut self.output, (prefix << 1 | 1) as u32);
            write_vint(&mut self.output, term.field.len() as u32);
            self.output.extend_from_slice(term.field.as_bytes());
        }
        write_vint(&mut self.output, suffix as u32);
        self.output.extend_from_slice(&term.bytes[prefix..]);
        self.last_term = Some(term.clone());
        self.size += 1;
    }

    pub fn finish(self) -> PrefixCodedTerms {
        PrefixCodedTerms::new(self.output, self.size)
    }
}

fn shared_prefix_len(term1: &[u8], term2: &[u8]) -> usize {
    let end = min(term1.len(), term2.len());
    for i in 0..end {
        if term1[i] != term2[i] {
            return i;
        }
    }
    end
}

fn write_vint(out: &mut Vec<u8>, mut v: u32) {
    while v >= 0x80 {
        out.push((v & 0x7f) as u8 | 0x80);
        v >>= 7;
    }
    out.push(v as u8);
}

/// Iterates the terms of a `PrefixCodedTerms` in the order they were added.
///
/// Not a `std::iter::Iterator` because decoding can fail.
pub struct PrefixCodedTermsIterator<'a> {
    buffer: &'a [u8],
    pos: usize,
    field: String,
    bytes: Vec<u8>,
}

impl<'a> PrefixCodedTermsIterator<'a> {
    fn read_byte(&mut self) -> Result<u8> {
        match self.buffer.get(self.pos) {
            Some(b) => {
                self.pos += 1;
                Ok(*b)
            }
            None => bail!(CorruptIndex("truncated prefix coded terms".into())),
        }
    }

    fn read_vint(&mut self) -> Result<usize> {
        let mut v = 0usize;
        let mut shift = 0;
        loop {
            let b = self.read_byte()?;
            v |= ((b & 0x7f) as usize) << shift;
            if b & 0x80 == 0 {
                return Ok(v);
            }
            shift += 7;
            if shift > 28 {
                bail!(CorruptIndex("vint is too long".into()));
            }
        }
    }

    fn read_bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        let buffer = self.buffer;
        match buffer.get(self.pos..self.pos + len) {
            Some(bytes) => {
                self.pos += len;
                Ok(bytes)
            }
            None => bail!(CorruptIndex("truncated prefix coded terms".into())),
        }
    }

    /// Field of the term last returned by `next`.
    pub fn field(&self) -> &str {
        &self.field
    }

    /// Decodes the next term, or `None` once every term was read.
    pub fn next(&mut self) -> Result<Option<Term>> {
        if self.pos >= self.buffer.len() {
            return Ok(None);
        }
        let code = self.read_vint()?;
        if code & 1 != 0 {
            let len = self.read_vint()?;
            let field = self.read_bytes(len)?;
            self.field = String::from_utf8(field.to_vec())?;
        }
        let prefix = code >> 1;
        let suffix = self.read_vint()?;
        if prefix > self.bytes.len() {
            bail!(CorruptIndex(format!(
                "prefix {} longer than previous term",
                prefix
            )));
        }
        self.bytes.truncate(prefix);
        let tail = self.read_bytes(suffix)?;
        self.bytes.extend_from_slice(tail);
        Ok(Some(Term::new(self.field.clone(), self.bytes.clone())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefix_coded_terms() -> Result<()> {
        let mut terms = vec![
            Term::from_text("id", "doc-10"),
            Term::from_text("body", "quick"),
            Term::from_text("id", "doc-1"),
            Term::from_text("body", "quiet"),
            Term::from_text("id", "x"),
        ];
        terms.sort();

        let mut builder = PrefixCodedTermsBuilder::default();
        for t in &terms {
            builder.add_term(t);
        }
        let coded = builder.finish();
        assert_eq!(coded.size, 5);
        coded.set_del_gen(7);
        assert_eq!(coded.del_gen(), 7);

        let mut iter = coded.iterator();
        let mut decoded = vec![];
        while let Some(term) = iter.next()? {
            assert_eq!(iter.field(), term.field());
            decoded.push(term);
        }
        assert_eq!(decoded, terms);
        Ok(())
    }

    #[test]
    fn test_empty_and_truncated() -> Result<()> {
        let coded = PrefixCodedTerms::default();
        assert!(coded.is_empty());
        assert!(coded.iterator().next()?.is_none());

        let truncated = PrefixCodedTerms::new(vec![0x03, 0x05, b'a'], 1);
        assert!(truncated.iterator().next().is_err());
        Ok(())
    }
}
