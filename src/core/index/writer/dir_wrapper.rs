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

use crate::core::store::{Directory, IOContext, IndexInput, IndexOutput, Lock, RateLimiter};
use crate::error::Result;

use std::collections::HashSet;
use std::fmt;
use std::io::{self, Write};
use std::sync::Arc;

/// Throttles the outputs a merge creates with the merge's own rate limiter.
///
/// Every other operation passes straight through.
pub struct RateLimitFilterDirectory {
    dir: Arc<dyn Directory>,
    rate_limiter: Arc<dyn RateLimiter>,
}

impl RateLimitFilterDirectory {
    pub fn new(dir: Arc<dyn Directory>, rate_limiter: Arc<dyn RateLimiter>) -> Self {
        RateLimitFilterDirectory { dir, rate_limiter }
    }
}

impl Directory for RateLimitFilterDirectory {
    fn list_all(&self) -> Result<Vec<String>> {
        self.dir.list_all()
    }

    fn file_length(&self, name: &str) -> Result<i64> {
        self.dir.file_length(name)
    }

    fn create_output(&self, name: &str, context: &IOContext) -> Result<Box<dyn IndexOutput>> {
        let output = self.dir.create_output(name, context)?;
        if !context.is_merge() {
            return Ok(output);
        }
        Ok(Box::new(RateLimitIndexOutput::new(
            Arc::clone(&self.rate_limiter),
            output,
        )))
    }

    fn open_input(&self, name: &str, ctx: &IOContext) -> Result<Box<dyn IndexInput>> {
        self.dir.open_input(name, ctx)
    }

    fn delete_file(&self, name: &str) -> Result<()> {
        self.dir.delete_file(name)
    }

    fn sync(&self, names: &HashSet<String>) -> Result<()> {
        self.dir.sync(names)
    }

    fn sync_meta_data(&self) -> Result<()> {
        self.dir.sync_meta_data()
    }

    fn rename(&self, source: &str, dest: &str) -> Result<()> {
        self.dir.rename(source, dest)
    }

    fn obtain_lock(&self, name: &str) -> Result<Box<dyn Lock>> {
        self.dir.obtain_lock(name)
    }
}

impl fmt::Display for RateLimitFilterDirectory {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "RateLimitFilterDirectory({})", self.dir)
    }
}

/// An `IndexOutput` that pauses every `min_pause_check_bytes` written bytes.
pub struct RateLimitIndexOutput {
    delegate: Box<dyn IndexOutput>,
    rate_limiter: Arc<dyn RateLimiter>,
    /// How many bytes we've written since we last called rate_limiter.pause.
    bytes_since_last_pause: u64,
    /// Cached here not not always have to call RateLimiter#getMinPauseCheckBytes()
    /// which does volatile read.
    current_min_pause_check_bytes: u64,
}

impl RateLimitIndexOutput {
    pub fn new(rate_limiter: Arc<dyn RateLimiter>, delegate: Box<dyn IndexOutput>) -> Self {
        let current_min_pause_check_bytes = rate_limiter.min_pause_check_bytes();
        RateLimitIndexOutput {
            delegate,
            rate_limiter,
            bytes_since_last_pause: 0,
            current_min_pause_check_bytes,
        }
    }

    fn check_rate(&mut self) -> io::Result<()> {
        if self.bytes_since_last_pause > self.current_min_pause_check_bytes {
            self.rate_limiter
                .pause(self.bytes_since_last_pause)
                .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;
            self.bytes_since_last_pause = 0;
            self.current_min_pause_check_bytes = self.rate_limiter.min_pause_check_bytes();
        }
        Ok(())
    }
}

impl IndexOutput for RateLimitIndexOutput {
    fn name(&self) -> &str {
        self.delegate.name()
    }

    fn file_pointer(&self) -> i64 {
        self.delegate.file_pointer()
    }
}

impl Write for RateLimitIndexOutput {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.delegate.write(buf)?;
        self.bytes_since_last_pause += n as u64;
        self.check_rate()?;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.delegate.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::index::merge::MergeRateLimiter;
    use crate::core::store::{read_file, write_file, MergeInfo, RAMDirectory};

    #[test]
    fn test_merge_outputs_are_rate_limited() -> Result<()> {
        let raw: Arc<dyn Directory> = Arc::new(RAMDirectory::new());
        let limiter = Arc::new(MergeRateLimiter::new());
        let dir = RateLimitFilterDirectory::new(Arc::clone(&raw), limiter.clone());

        let merge_ctx = IOContext::Merge(MergeInfo::new(10, 1024, false, None));
        write_file(&dir, "_1.pst", &[7u8; 1024], &merge_ctx)?;
        assert_eq!(read_file(raw.as_ref(), "_1.pst", &IOContext::READ)?.len(), 1024);

        // an aborted merge can not write past the first pause check
        limiter.set_mb_per_sec(0.0001);
        limiter.set_abort();
        let min_bytes = limiter.min_pause_check_bytes() as usize;
        let bytes = vec![1u8; min_bytes + 1];
        assert!(write_file(&dir, "_2.pst", &bytes, &merge_ctx).is_err());

        // flushes are never throttled
        write_file(&dir, "_3.pst", &bytes, &IOContext::Default)?;
        Ok(())
    }
}
