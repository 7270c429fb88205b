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

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::io::{self, Cursor, Read, Write};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use crate::core::store::{Directory, IOContext, IndexInput, IndexOutput, Lock};
use crate::error::{
    ErrorKind::{AlreadyClosed, IllegalState, LockObtainFailed},
    Result,
};

struct RAMFile {
    data: RwLock<Vec<u8>>,
    open_inputs: AtomicUsize,
}

impl RAMFile {
    fn new() -> Self {
        RAMFile {
            data: RwLock::new(Vec::new()),
            open_inputs: AtomicUsize::new(0),
        }
    }
}

/// A memory-resident `Directory` implementation.
///
/// When `refuse_delete_open_files` is on, deleting a file that still has an
/// open input fails the way it does on platforms that pin open files.
pub struct RAMDirectory {
    files: RwLock<HashMap<String, Arc<RAMFile>>>,
    locks: Arc<Mutex<HashSet<String>>>,
    refuse_delete_open_files: AtomicBool,
}

impl RAMDirectory {
    pub fn new() -> RAMDirectory {
        RAMDirectory {
            files: RwLock::new(HashMap::new()),
            locks: Arc::new(Mutex::new(HashSet::new())),
            refuse_delete_open_files: AtomicBool::new(false),
        }
    }

    pub fn set_refuse_delete_open_files(&self, refuse: bool) {
        self.refuse_delete_open_files
            .store(refuse, Ordering::Release);
    }

    pub fn file_exists(&self, name: &str) -> bool {
        self.files
            .read()
            .map(|files| files.contains_key(name))
            .unwrap_or(false)
    }

    /// Total bytes held by all files.
    pub fn ram_bytes_used(&self) -> Result<usize> {
        let files = self.files.read()?;
        let mut total = 0;
        for file in files.values() {
            total += file.data.read()?.len();
        }
        Ok(total)
    }

    fn file(&self, name: &str) -> Result<Arc<RAMFile>> {
        match self.files.read()?.get(name) {
            Some(f) => Ok(Arc::clone(f)),
            None => Err(io::Error::new(io::ErrorKind::NotFound, name.to_string()).into()),
        }
    }
}

impl Directory for RAMDirectory {
    fn list_all(&self) -> Result<Vec<String>> {
        let mut names: Vec<String> = self.files.read()?.keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    fn file_length(&self, name: &str) -> Result<i64> {
        let file = self.file(name)?;
        let len = file.data.read()?.len();
        Ok(len as i64)
    }

    fn create_output(&self, name: &str, _context: &IOContext) -> Result<Box<dyn IndexOutput>> {
        let mut files = self.files.write()?;
        if files.contains_key(name) {
            bail!(IllegalState(format!("file {} already exists", name)));
        }
        let file = Arc::new(RAMFile::new());
        files.insert(name.to_string(), Arc::clone(&file));
        Ok(Box::new(RAMOutput {
            name: name.to_string(),
            file,
            pos: 0,
        }))
    }

    fn open_input(&self, name: &str, _ctx: &IOContext) -> Result<Box<dyn IndexInput>> {
        let file = self.file(name)?;
        let data = file.data.read()?.clone();
        file.open_inputs.fetch_add(1, Ordering::AcqRel);
        Ok(Box::new(RAMInput {
            name: name.to_string(),
            len: data.len() as u64,
            cursor: Cursor::new(data),
            file,
        }))
    }

    fn delete_file(&self, name: &str) -> Result<()> {
        let mut files = self.files.write()?;
        let still_open = match files.get(name) {
            Some(f) => f.open_inputs.load(Ordering::Acquire) > 0,
            None => {
                return Err(io::Error::new(io::ErrorKind::NotFound, name.to_string()).into());
            }
        };
        if still_open && self.refuse_delete_open_files.load(Ordering::Acquire) {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                format!("file {} is still open and can not be deleted", name),
            )
            .into());
        }
        files.remove(name);
        Ok(())
    }

    fn sync(&self, _names: &HashSet<String>) -> Result<()> {
        Ok(())
    }

    fn sync_meta_data(&self) -> Result<()> {
        Ok(())
    }

    fn rename(&self, source: &str, dest: &str) -> Result<()> {
        let mut files = self.files.write()?;
        match files.remove(source) {
            Some(f) => {
                files.insert(dest.to_string(), f);
                Ok(())
            }
            None => Err(io::Error::new(io::ErrorKind::NotFound, source.to_string()).into()),
        }
    }

    fn obtain_lock(&self, name: &str) -> Result<Box<dyn Lock>> {
        if !self.locks.lock()?.insert(name.to_string()) {
            bail!(LockObtainFailed(format!("lock instance already obtained: {}", name)));
        }
        Ok(Box::new(RAMLock {
            name: name.to_string(),
            locks: Arc::clone(&self.locks),
            closed: AtomicBool::new(false),
        }))
    }
}

impl fmt::Display for RAMDirectory {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "RAMDirectory@{:p}", self)
    }
}

struct RAMOutput {
    name: String,
    file: Arc<RAMFile>,
    pos: i64,
}

impl Write for RAMOutput {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.file.data.write() {
            Ok(mut data) => {
                data.extend_from_slice(buf);
                self.pos += buf.len() as i64;
                Ok(buf.len())
            }
            Err(_) => Err(io::Error::new(io::ErrorKind::Other, "poisoned ram file")),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl IndexOutput for RAMOutput {
    fn name(&self) -> &str {
        &self.name
    }

    fn file_pointer(&self) -> i64 {
        self.pos
    }
}

struct RAMInput {
    name: String,
    len: u64,
    cursor: Cursor<Vec<u8>>,
    file: Arc<RAMFile>,
}

impl Read for RAMInput {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.cursor.read(buf)
    }
}

impl IndexInput for RAMInput {
    fn name(&self) -> &str {
        &self.name
    }

    fn len(&self) -> u64 {
        self.len
    }
}

impl Drop for RAMInput {
    fn drop(&mut self) {
        self.file.open_inputs.fetch_sub(1, Ordering::AcqRel);
    }
}

struct RAMLock {
    name: String,
    locks: Arc<Mutex<HashSet<String>>>,
    closed: AtomicBool,
}

impl Lock for RAMLock {
    fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.locks.lock()?.remove(&self.name);
        Ok(())
    }

    fn ensure_valid(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            bail!(AlreadyClosed(format!("lock instance already released: {}", self.name)));
        }
        if !self.locks.lock()?.contains(&self.name) {
            bail!(AlreadyClosed(format!("lock {} was cleared externally", self.name)));
        }
        Ok(())
    }
}

impl Drop for RAMLock {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!("release lock {} failed: {:?}", self.name, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::store::{read_file, write_file};

    #[test]
    fn test_write_read_rename_delete() -> Result<()> {
        let dir = RAMDirectory::new();
        write_file(&dir, "_0.pst", b"postings", &IOContext::Default)?;
        assert!(dir.create_output("_0.pst", &IOContext::Default).is_err());
        assert_eq!(dir.file_length("_0.pst")?, 8);

        dir.rename("_0.pst", "_1.pst")?;
        assert_eq!(dir.list_all()?, vec!["_1.pst".to_string()]);
        assert_eq!(read_file(&dir, "_1.pst", &IOContext::READ)?, b"postings".to_vec());

        dir.delete_file("_1.pst")?;
        assert!(dir.delete_file("_1.pst").unwrap_err().is_not_found());
        assert!(dir.list_all()?.is_empty());
        Ok(())
    }

    #[test]
    fn test_refuse_delete_of_open_file() -> Result<()> {
        let dir = RAMDirectory::new();
        dir.set_refuse_delete_open_files(true);
        write_file(&dir, "_0.si", b"x", &IOContext::Default)?;

        let input = dir.open_input("_0.si", &IOContext::READ)?;
        assert!(dir.delete_file("_0.si").is_err());
        assert!(dir.file_exists("_0.si"));
        drop(input);
        dir.delete_file("_0.si")?;
        assert!(!dir.file_exists("_0.si"));
        Ok(())
    }

    #[test]
    fn test_lock_is_exclusive() -> Result<()> {
        let dir = RAMDirectory::new();
        let lock = dir.obtain_lock("write.lock")?;
        assert!(dir.obtain_lock("write.lock").is_err());
        lock.ensure_valid()?;
        drop(lock);
        let again = dir.obtain_lock("write.lock")?;
        again.close()?;
        assert!(again.ensure_valid().is_err());
        Ok(())
    }
}
