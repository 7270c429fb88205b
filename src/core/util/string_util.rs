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

use rand::{thread_rng, Rng};

use crate::error::{ErrorKind::CorruptIndex, Result};

pub const ID_LENGTH: usize = 16;

/// Generates a non-cryptographic globally unique id.
pub fn random_id() -> [u8; ID_LENGTH] {
    let mut id = [0u8; ID_LENGTH];
    thread_rng().fill(&mut id);
    id
}

pub fn id2str(id: &[u8]) -> String {
    let strs: Vec<String> = id.iter().map(|b| format!("{:02X}", b)).collect();
    strs.join("")
}

/// Parses an id printed by `id2str`.
pub fn str2id(s: &str) -> Result<[u8; ID_LENGTH]> {
    if s.len() != ID_LENGTH * 2 || !s.is_ascii() {
        bail!(CorruptIndex(format!("invalid segment id: {}", s)));
    }
    let mut id = [0u8; ID_LENGTH];
    for (i, b) in id.iter_mut().enumerate() {
        *b = u8::from_str_radix(&s[i * 2..i * 2 + 2], 16)?;
    }
    Ok(id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_string_round_trip() -> Result<()> {
        let id = random_id();
        assert_eq!(str2id(&id2str(&id))?, id);
        assert!(str2id("00").is_err());
        assert!(str2id(&"zz".repeat(ID_LENGTH)).is_err());
        Ok(())
    }
}
