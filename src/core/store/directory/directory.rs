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

use std::collections::HashSet;
use std::fmt;
use std::io::{self, Write};
use std::sync::Arc;

use crate::core::store::{IOContext, IndexInput, IndexOutput, Lock};
use crate::error::Result;

/// A Directory is a flat list of files.
///
/// Files may be written once, when they are created.  Once a file is created it may only
/// be opened for read, or deleted.
pub trait Directory: fmt::Display + Send + Sync {
    /// Returns the names of all files in the directory, sorted.
    fn list_all(&self) -> Result<Vec<String>>;

    /// Returns the length of a file in the directory.
    fn file_length(&self, name: &str) -> Result<i64>;

    /// Creates a new, empty file in the directory with the given name.
    /// Returns a stream writing this file.
    fn create_output(&self, name: &str, context: &IOContext) -> Result<Box<dyn IndexOutput>>;

    fn open_input(&self, name: &str, ctx: &IOContext) -> Result<Box<dyn IndexInput>>;

    /// Removes an existing file in the directory.
    ///
    /// Fails with an io error while the file can not be removed yet, e.g. because
    /// it is still open; callers that own the file retry later.
    fn delete_file(&self, name: &str) -> Result<()>;

    /// Ensure that any writes to these files are moved to
    /// stable storage.
    fn sync(&self, names: &HashSet<String>) -> Result<()>;

    /// Ensure that directory metadata, such as recent file renames, are made durable.
    fn sync_meta_data(&self) -> Result<()>;

    /// Renames `source` to `dest`, replacing `dest` if it exists.
    fn rename(&self, source: &str, dest: &str) -> Result<()>;

    /// Returns an exclusive lock on `name`, or fails with `LockObtainFailed` if
    /// it is already held.
    fn obtain_lock(&self, name: &str) -> Result<Box<dyn Lock>>;

    fn copy_from(
        &self,
        from: &dyn Directory,
        src: &str,
        dest: &str,
        ctx: &IOContext,
    ) -> Result<()> {
        let mut is = from.open_input(src, ctx)?;
        let mut os = self.create_output(dest, ctx)?;
        io::copy(&mut is, &mut os)?;
        os.flush()?;
        Ok(())
    }
}

/// Reads a whole file into memory.
pub fn read_file(dir: &dyn Directory, name: &str, ctx: &IOContext) -> Result<Vec<u8>> {
    let mut input = dir.open_input(name, ctx)?;
    input.read_to_vec()
}

/// Writes `bytes` as the complete content of a new file.
pub fn write_file(dir: &dyn Directory, name: &str, bytes: &[u8], ctx: &IOContext) -> Result<()> {
    let mut output = dir.create_output(name, ctx)?;
    output.write_all(bytes)?;
    output.flush()?;
    Ok(())
}

/// This struct makes a best-effort check that a provided
/// `Lock` is valid before any destructive filesystem operation.
pub struct LockValidatingDirectoryWrapper {
    dir: Arc<dyn Directory>,
    write_lock: Arc<dyn Lock>,
}

impl LockValidatingDirectoryWrapper {
    pub fn new(dir: Arc<dyn Directory>, write_lock: Arc<dyn Lock>) -> Self {
        LockValidatingDirectoryWrapper { dir, write_lock }
    }
}

impl Directory for LockValidatingDirectoryWrapper {
    fn list_all(&self) -> Result<Vec<String>> {
        self.dir.list_all()
    }

    fn file_length(&self, name: &str) -> Result<i64> {
        self.dir.file_length(name)
    }

    fn create_output(&self, name: &str, context: &IOContext) -> Result<Box<dyn IndexOutput>> {
        self.write_lock.ensure_valid()?;
        self.dir.create_output(name, context)
    }

    fn open_input(&self, name: &str, ctx: &IOContext) -> Result<Box<dyn IndexInput>> {
        self.dir.open_input(name, ctx)
    }

    fn delete_file(&self, name: &str) -> Result<()> {
        self.write_lock.ensure_valid()?;
        self.dir.delete_file(name)
    }

    fn sync(&self, names: &HashSet<String>) -> Result<()> {
        self.write_lock.ensure_valid()?;
        self.dir.sync(names)
    }

    fn sync_meta_data(&self) -> Result<()> {
        self.write_lock.ensure_valid()?;
        self.dir.sync_meta_data()
    }

    fn rename(&self, source: &str, dest: &str) -> Result<()> {
        self.write_lock.ensure_valid()?;
        self.dir.rename(source, dest)
    }

    fn obtain_lock(&self, name: &str) -> Result<Box<dyn Lock>> {
        self.dir.obtain_lock(name)
    }

    fn copy_from(
        &self,
        from: &dyn Directory,
        src: &str,
        dest: &str,
        ctx: &IOContext,
    ) -> Result<()> {
        self.write_lock.ensure_valid()?;
        self.dir.copy_from(from, src, dest, ctx)
    }
}

impl fmt::Display for LockValidatingDirectoryWrapper {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "LockValidatingDirectoryWrapper({})", self.dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::store::RAMDirectory;

    #[test]
    fn test_lock_validating_wrapper_rejects_after_release() -> Result<()> {
        let raw: Arc<dyn Directory> = Arc::new(RAMDirectory::new());
        let lock: Arc<dyn Lock> = Arc::from(raw.obtain_lock("write.lock")?);
        let dir = LockValidatingDirectoryWrapper::new(Arc::clone(&raw), Arc::clone(&lock));

        write_file(&dir, "_0.si", b"abc", &IOContext::Default)?;
        assert_eq!(read_file(&dir, "_0.si", &IOContext::READ)?, b"abc".to_vec());

        lock.close()?;
        assert!(dir.create_output("_1.si", &IOContext::Default).is_err());
        assert!(dir.delete_file("_0.si").is_err());
        // reads are not guarded
        assert_eq!(dir.file_length("_0.si")?, 3);
        Ok(())
    }
}
