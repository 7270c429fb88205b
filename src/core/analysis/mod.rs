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

use std::fmt;

// NOTE: this length is length by byte, so it's different from Lucene's word length
pub const MAX_WORD_LEN: usize = 511;

/// An Analyzer turns the value of a tokenized field into index terms.
pub trait Analyzer: Send + Sync + fmt::Debug {
    fn tokenize(&self, field: &str, text: &str) -> Result<Vec<String>>;
}

/// Divides text at whitespace characters. Tokens longer than
/// `MAX_WORD_LEN` bytes are split.
#[derive(Debug, Default)]
pub struct WhitespaceAnalyzer;

impl Analyzer for WhitespaceAnalyzer {
    fn tokenize(&self, _field: &str, text: &str) -> Result<Vec<String>> {
        let mut tokens = Vec::new();
        for word in text.split_whitespace() {
            if word.len() <= MAX_WORD_LEN {
                tokens.push(word.to_string());
                continue;
            }
            let mut current = String::with_capacity(MAX_WORD_LEN);
            for c in word.chars() {
                if current.len() + c.len_utf8() > MAX_WORD_LEN {
                    tokens.push(current);
                    current = String::with_capacity(MAX_WORD_LEN);
                }
                current.push(c);
            }
            if !current.is_empty() {
                tokens.push(current);
            }
        }
        Ok(tokens)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_whitespace_analyzer() -> Result<()> {
        let tokens = WhitespaceAnalyzer.tokenize("body", "  quick brown\tfox\n")?;
        assert_eq!(tokens, vec!["quick", "brown", "fox"]);

        let long = "a".repeat(MAX_WORD_LEN + 10);
        let tokens = WhitespaceAnalyzer.tokenize("body", &long)?;
        assert_eq!(tokens.len(), 2);
        assert_eq!(tokens[0].len(), MAX_WORD_LEN);
        assert_eq!(tokens[1].len(), 10);
        Ok(())
    }
}
