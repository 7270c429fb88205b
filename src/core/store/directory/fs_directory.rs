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
use std::fs;
use std::io::{self, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use crate::core::store::{Directory, IOContext, IndexInput, IndexOutput, Lock};
use crate::error::{
    ErrorKind::{AlreadyClosed, IllegalState, LockObtainFailed},
    Result,
};

lazy_static! {
    /// Lock files held by this process, shared by every `FSDirectory` instance.
    static ref LOCK_HELD: Mutex<HashSet<PathBuf>> = Mutex::new(HashSet::new());
}

/// a straightforward `Directory` implementations use std::fs::File.
pub struct FSDirectory {
    pub directory: PathBuf,
}

impl FSDirectory {
    pub fn with_path<T: AsRef<Path> + ?Sized>(directory: &T) -> Result<FSDirectory> {
        let directory = directory.as_ref();
        if !Path::exists(directory) {
            fs::create_dir_all(directory)?;
        } else if !Path::is_dir(directory) {
            bail!(IllegalState(format!(
                "Path {:?} exists but is not directory",
                directory
            )))
        }

        Ok(FSDirectory {
            directory: From::from(directory),
        })
    }

    pub fn resolve(&self, name: &str) -> PathBuf {
        self.directory.join(name)
    }

    fn fsync(&self, path: &Path, is_dir: bool) -> Result<()> {
        // If the file is a directory we have to open read-only, for regular files we must
        // open r/w for the fsync to have an effect.
        let file = if is_dir {
            fs::File::open(path)?
        } else {
            fs::OpenOptions::new().append(true).open(path)?
        };
        file.sync_all()?;
        Ok(())
    }
}

impl Directory for FSDirectory {
    fn list_all(&self) -> Result<Vec<String>> {
        let mut result = Vec::new();
        for entry in fs::read_dir(&self.directory)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                continue;
            }
            if let Ok(filename) = entry.file_name().into_string() {
                result.push(filename);
            }
        }
        result.sort();
        Ok(result)
    }

    fn file_length(&self, name: &str) -> Result<i64> {
        let path = self.resolve(name);
        let meta = fs::metadata(&path)?;
        if meta.is_dir() {
            bail!(IllegalState(format!(
                "file_length should not be called for directory: {}",
                path.display()
            )))
        }
        Ok(meta.len() as i64)
    }

    fn create_output(&self, name: &str, _context: &IOContext) -> Result<Box<dyn IndexOutput>> {
        let file = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(self.resolve(name))?;
        Ok(Box::new(FSIndexOutput {
            name: name.to_string(),
            writer: BufWriter::new(file),
            written: 0,
        }))
    }

    fn open_input(&self, name: &str, _ctx: &IOContext) -> Result<Box<dyn IndexInput>> {
        let file = fs::File::open(self.resolve(name))?;
        let len = file.metadata()?.len();
        Ok(Box::new(FSIndexInput {
            name: name.to_string(),
            file,
            len,
        }))
    }

    fn delete_file(&self, name: &str) -> Result<()> {
        fs::remove_file(self.resolve(name))?;
        Ok(())
    }

    fn sync(&self, names: &HashSet<String>) -> Result<()> {
        for name in names {
            let path = self.resolve(name);
            self.fsync(&path, false)?;
        }
        Ok(())
    }

    fn sync_meta_data(&self) -> Result<()> {
        self.fsync(&self.directory, true)
    }

    fn rename(&self, source: &str, dest: &str) -> Result<()> {
        fs::rename(self.resolve(source), self.resolve(dest))?;
        Ok(())
    }

    fn obtain_lock(&self, name: &str) -> Result<Box<dyn Lock>> {
        let real_path = self.resolve(name);
        if !LOCK_HELD.lock()?.insert(real_path.clone()) {
            bail!(LockObtainFailed(format!(
                "lock held by this process: {}",
                real_path.display()
            )));
        }
        match fs::OpenOptions::new()
            .write(true)
            .create(true)
            .open(&real_path)
        {
            Ok(_) => Ok(Box::new(NativeFSLock {
                real_path,
                closed: AtomicBool::new(false),
            })),
            Err(e) => {
                LOCK_HELD.lock()?.remove(&real_path);
                Err(e.into())
            }
        }
    }
}

impl fmt::Display for FSDirectory {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "FSDirectory({})", self.directory.display())
    }
}

pub struct FSIndexOutput {
    name: String,
    writer: BufWriter<fs::File>,
    written: i64,
}

impl Write for FSIndexOutput {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.writer.write(buf)?;
        self.written += n as i64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.writer.flush()
    }
}

impl IndexOutput for FSIndexOutput {
    fn name(&self) -> &str {
        &self.name
    }

    fn file_pointer(&self) -> i64 {
        self.written
    }
}

pub struct FSIndexInput {
    name: String,
    file: fs::File,
    len: u64,
}

impl Read for FSIndexInput {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.file.read(buf)
    }
}

impl IndexInput for FSIndexInput {
    fn name(&self) -> &str {
        &self.name
    }

    fn len(&self) -> u64 {
        self.len
    }
}

/// A lock backed by a lock file plus the process wide held-lock set.
pub struct NativeFSLock {
    real_path: PathBuf,
    closed: AtomicBool,
}

impl Lock for NativeFSLock {
    fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let removed = LOCK_HELD.lock()?.remove(&self.real_path);
        if !removed {
            bail!(AlreadyClosed(format!(
                "Lock path was cleared but never marked as held: {:?}",
                self.real_path
            )));
        }
        if let Err(e) = fs::remove_file(&self.real_path) {
            if e.kind() != io::ErrorKind::NotFound {
                return Err(e.into());
            }
        }
        Ok(())
    }

    fn ensure_valid(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            bail!(AlreadyClosed("Lock instance already released".into()));
        }
        if !LOCK_HELD.lock()?.contains(&self.real_path) {
            bail!(AlreadyClosed(
                "Lock path unexpectedly cleared from map".into()
            ));
        }
        if !self.real_path.exists() {
            bail!(AlreadyClosed(format!(
                "Lock file {:?} was removed externally",
                self.real_path
            )));
        }
        Ok(())
    }
}

impl Drop for NativeFSLock {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!("release lock {:?} failed: {:?}", self.real_path, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::store::{read_file, write_file};
    use tempfile::TempDir;

    #[test]
    fn test_fs_directory_roundtrip() -> Result<()> {
        let tmp = TempDir::new()?;
        let dir = FSDirectory::with_path(tmp.path())?;
        write_file(&dir, "_0.pst", b"hello", &IOContext::Default)?;
        assert_eq!(dir.file_length("_0.pst")?, 5);
        assert_eq!(read_file(&dir, "_0.pst", &IOContext::READ)?, b"hello".to_vec());

        dir.rename("_0.pst", "_0.fdt")?;
        let mut names = HashSet::new();
        names.insert("_0.fdt".to_string());
        dir.sync(&names)?;
        dir.sync_meta_data()?;
        assert_eq!(dir.list_all()?, vec!["_0.fdt".to_string()]);

        dir.delete_file("_0.fdt")?;
        assert!(dir.delete_file("_0.fdt").unwrap_err().is_not_found());
        Ok(())
    }

    #[test]
    fn test_fs_lock() -> Result<()> {
        let tmp = TempDir::new()?;
        let dir = FSDirectory::with_path(tmp.path())?;
        let lock = dir.obtain_lock("write.lock")?;
        assert!(dir.obtain_lock("write.lock").is_err());
        lock.ensure_valid()?;
        lock.close()?;
        assert!(lock.ensure_valid().is_err());
        let relock = dir.obtain_lock("write.lock")?;
        relock.ensure_valid()?;
        Ok(())
    }
}
