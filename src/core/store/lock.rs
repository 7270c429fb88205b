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

use crate::core::store::Directory;
use crate::error::{ErrorKind::LockObtainFailed, Result};

use std::thread;
use std::time::{Duration, Instant};

/// How long to sleep between attempts while waiting for a held lock.
pub const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// An inter process mutex lock, obtained through `Directory::obtain_lock`.
pub trait Lock: Sync + Send {
    /// Releases exclusive access.
    fn close(&self) -> Result<()>;

    /// Best effort check that this lock is still valid. Locks
    /// could become invalidated externally for a number of reasons,
    /// for example if a user deletes the lock file manually.
    fn ensure_valid(&self) -> Result<()>;
}

/// Tries to obtain `lock_name`, polling until `timeout` elapses while
/// another owner holds it.
pub fn obtain_lock_with_timeout(
    dir: &dyn Directory,
    lock_name: &str,
    timeout: Duration,
) -> Result<Box<dyn Lock>> {
    let start = Instant::now();
    loop {
        match dir.obtain_lock(lock_name) {
            Ok(lock) => return Ok(lock),
            Err(e) => {
                let held = match e.kind() {
                    LockObtainFailed(_) => true,
                    _ => false,
                };
                if !held || start.elapsed() >= timeout {
                    return Err(e);
                }
                trace!("lock {} is held in {}, retrying", lock_name, dir);
                thread::sleep(LOCK_POLL_INTERVAL);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::store::RAMDirectory;
    use std::sync::Arc;

    #[test]
    fn test_obtain_with_timeout_waits_for_release() -> Result<()> {
        let dir = Arc::new(RAMDirectory::new());
        let lock = dir.obtain_lock("write.lock")?;

        // held and timeout elapsed
        assert!(obtain_lock_with_timeout(dir.as_ref(), "write.lock", Duration::from_millis(60)).is_err());

        let releaser = thread::spawn(move || {
            thread::sleep(Duration::from_millis(100));
            lock.close()
        });
        let second =
            obtain_lock_with_timeout(dir.as_ref(), "write.lock", Duration::from_secs(5))?;
        second.ensure_valid()?;
        releaser.join().unwrap()?;
        Ok(())
    }
}
