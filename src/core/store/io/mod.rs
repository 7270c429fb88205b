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

use std::io::{Read, Write};

/// Abstract base class for output to a file in a Directory.  A random-access
/// output stream.  Used for all index output operations.
pub trait IndexOutput: Write + Send {
    fn name(&self) -> &str;

    /// Returns the current position in this file, where the next write will occur.
    fn file_pointer(&self) -> i64;
}

/// Abstract base class for input from a file in a `Directory`.
pub trait IndexInput: Read + Send {
    fn name(&self) -> &str;

    /// The number of bytes in the file.
    fn len(&self) -> u64;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn read_to_vec(&mut self) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(self.len() as usize);
        self.read_to_end(&mut buf)?;
        Ok(buf)
    }
}
