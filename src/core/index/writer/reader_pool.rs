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

use crate::core::codec::segment_infos::{SegmentCommitInfo, SegmentInfos};
use crate::core::index::reader::SegmentReader;
use crate::core::store::{Directory, IOContext, TrackingDirectoryWrapper};
use crate::core::util::{Bits, DocId, FixedBitSet};
use crate::error::{ErrorKind::IllegalState, Result};

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

/// Holds shared SegmentReader instances. IndexWriter uses
/// SegmentReaders for 1) applying deletes, 2) doing
/// merges, 3) handing out a real-time reader.  This pool
/// reuses instances of the SegmentReaders in all these
/// places if it is in "near real-time mode" (get_reader()
/// has been called on this instance).
pub struct ReaderPool {
    reader_map: Mutex<HashMap<String, Arc<ReadersAndUpdates>>>,
    pooling: AtomicBool,
    directory: Arc<dyn Directory>,
}

impl ReaderPool {
    pub fn new(directory: Arc<dyn Directory>, pooling: bool) -> Self {
        ReaderPool {
            reader_map: Mutex::new(HashMap::new()),
            pooling: AtomicBool::new(pooling),
            directory,
        }
    }

    pub fn enable_reader_pooling(&self) {
        self.pooling.store(true, Ordering::Release);
    }

    pub fn is_pooling(&self) -> bool {
        self.pooling.load(Ordering::Acquire)
    }

    /// Obtain a ReadersAndLiveDocs instance from the reader pool. If
    /// `create` is true, you must later call `release`.
    pub fn get(
        &self,
        info: &Arc<SegmentCommitInfo>,
        create: bool,
    ) -> Result<Option<Arc<ReadersAndUpdates>>> {
        let mut readers = self.reader_map.lock()?;
        let rld = match readers.get(info.name()) {
            Some(rld) => {
                debug_assert!(Arc::ptr_eq(&rld.info, info) || rld.info.as_ref() == info.as_ref());
                Arc::clone(rld)
            }
            None => {
                if !create {
                    return Ok(None);
                }
                // steal initial reference
                let rld = Arc::new(ReadersAndUpdates::new(Arc::clone(info)));
                readers.insert(info.name().to_string(), Arc::clone(&rld));
                rld
            }
        };
        if create {
            // return ref to caller
            rld.inc_ref();
        }
        Ok(Some(rld))
    }

    /// Releases a reference obtained by `get`. Returns whether live docs
    /// were written, in which case the caller must checkpoint.
    pub fn release(&self, rld: &Arc<ReadersAndUpdates>) -> Result<bool> {
        // Matches inc_ref in get:
        rld.dec_ref();

        let mut changed = false;
        if !self.is_pooling() && rld.ref_count() == 1 {
            let mut readers = self.reader_map.lock()?;
            // This is the last ref to this RLD, and we're not pooling, so remove it
            if rld.ref_count() == 1 && readers.contains_key(rld.info.name()) {
                changed = rld.write_live_docs(&self.directory)?;
                rld.drop_readers()?;
                readers.remove(rld.info.name());
            }
        }
        Ok(changed)
    }

    /// Drops the pooled readers of a segment that left the index.
    pub fn drop(&self, info: &SegmentCommitInfo) -> Result<()> {
        let rld = self.reader_map.lock()?.remove(info.name());
        if let Some(rld) = rld {
            debug_assert_eq!(rld.info.as_ref(), info);
            rld.drop_readers()?;
        }
        Ok(())
    }

    pub fn any_pending_deletes(&self) -> Result<bool> {
        let readers = self.reader_map.lock()?;
        Ok(readers.values().any(|rld| rld.pending_delete_count() > 0))
    }

    /// Remove all our references to readers, and commits any pending changes
    /// when `do_save` is true. Returns whether anything was written.
    pub fn drop_all(&self, do_save: bool) -> Result<bool> {
        let mut readers = self.reader_map.lock()?;
        let mut first_err = None;
        let mut changed = false;
        for (_, rld) in readers.drain() {
            let res = if do_save {
                rld.write_live_docs(&self.directory)
            } else {
                rld.drop_changes()?;
                Ok(false)
            };
            match res {
                Ok(wrote) => changed |= wrote,
                Err(e) => {
                    if first_err.is_none() {
                        first_err = Some(e);
                    }
                }
            }
            // Important to remove as-we-go, not with .clear()
            // in the end, in case we hit an exception;
            // otherwise we could over-decref if close() is
            // called again:
            if let Err(e) = rld.drop_readers() {
                if first_err.is_none() {
                    first_err = Some(e);
                }
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(changed),
        }
    }

    /// Commit live docs changes for the segment readers for the provided infos.
    /// Returns whether anything was written.
    pub fn commit(&self, infos: &SegmentInfos) -> Result<bool> {
        let readers = self.reader_map.lock()?;
        let mut changed = false;
        for info in &infos.segments {
            if let Some(rld) = readers.get(info.name()) {
                debug_assert_eq!(rld.info.as_ref(), info.as_ref());
                changed |= rld.write_live_docs(&self.directory)?;
            }
        }
        Ok(changed)
    }

    /// Obtain the number of deleted docs for a pooled reader. If the reader
    /// isn't being pooled, the segmentInfo's del count is returned.
    pub fn num_deleted_docs(&self, info: &SegmentCommitInfo) -> Result<i32> {
        let readers = self.reader_map.lock()?;
        let pending = readers
            .get(info.name())
            .map_or(0, |rld| rld.pending_delete_count());
        Ok(info.del_count() + pending as i32)
    }
}

/// Tracks the live docs and the shared reader of one segment while the
/// writer buffers deletes against it.
pub struct ReadersAndUpdates {
    pub info: Arc<SegmentCommitInfo>,
    // Tracks how many consumers are using this instance:
    ref_count: AtomicU32,
    inner: Mutex<ReadersAndUpdatesInner>,
}

struct ReadersAndUpdatesInner {
    // Set once (null, and then maybe set, and never set again):
    reader: Option<Arc<SegmentReader>>,
    // Holds the current shared (readonly) live_docs, or None when every
    // doc is live:
    live_docs: Option<Arc<FixedBitSet>>,
    // How many further deletions we've done against
    // live_docs vs when we loaded it or last wrote it:
    pending_delete_count: u32,
    // True if the current live_docs is referenced by an
    // external NRT reader:
    live_docs_shared: bool,
    // Indicates whether this segment is currently being merged.
    is_merging: bool,
}

impl ReadersAndUpdates {
    pub fn new(info: Arc<SegmentCommitInfo>) -> Self {
        ReadersAndUpdates {
            info,
            ref_count: AtomicU32::new(1),
            inner: Mutex::new(ReadersAndUpdatesInner {
                reader: None,
                live_docs: None,
                pending_delete_count: 0,
                live_docs_shared: true,
                is_merging: false,
            }),
        }
    }

    pub fn inc_ref(&self) {
        let rc = self.ref_count.fetch_add(1, Ordering::AcqRel);
        debug_assert!(rc > 0);
    }

    pub fn dec_ref(&self) {
        let rc = self.ref_count.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(rc > 0);
    }

    pub fn ref_count(&self) -> u32 {
        self.ref_count.load(Ordering::Acquire)
    }

    pub fn pending_delete_count(&self) -> u32 {
        self.inner
            .lock()
            .map(|inner| inner.pending_delete_count)
            .unwrap_or(0)
    }

    pub fn is_merging(&self) -> bool {
        self.inner.lock().map(|inner| inner.is_merging).unwrap_or(false)
    }

    pub fn set_is_merging(&self, merging: bool) -> Result<()> {
        self.inner.lock()?.is_merging = merging;
        Ok(())
    }

    fn create_reader_if_not_exist_locked(
        &self,
        inner: &mut MutexGuard<ReadersAndUpdatesInner>,
        context: &IOContext,
    ) -> Result<Arc<SegmentReader>> {
        if let Some(ref reader) = inner.reader {
            return Ok(Arc::clone(reader));
        }
        // We steal returned ref:
        let reader = Arc::new(SegmentReader::open(&self.info, context)?);
        if inner.live_docs.is_none() {
            inner.live_docs = reader.live_docs().cloned();
        }
        inner.reader = Some(Arc::clone(&reader));
        Ok(reader)
    }

    pub fn create_reader_if_not_exist(&self, context: &IOContext) -> Result<()> {
        let mut inner = self.inner.lock()?;
        self.create_reader_if_not_exist_locked(&mut inner, context)?;
        Ok(())
    }

    /// Returns the pooled reader. Its live docs are those from when it was
    /// opened; the current ones are held here.
    pub fn reader(&self, context: &IOContext) -> Result<Arc<SegmentReader>> {
        let mut inner = self.inner.lock()?;
        self.create_reader_if_not_exist_locked(&mut inner, context)
    }

    /// Returns a reader for merge, this method applies field updates if there
    /// are any and marks that this segment is currently merging.
    pub fn reader_for_merge(&self, context: &IOContext) -> Result<Arc<SegmentReader>> {
        self.inner.lock()?.is_merging = true;
        self.get_readonly_clone(context)
    }

    /// Returns a ref to a clone. NOTE: you should decRef() the reader when you're
    /// done (ie do not call close()).
    pub fn get_readonly_clone(&self, context: &IOContext) -> Result<Arc<SegmentReader>> {
        let mut inner = self.inner.lock()?;
        let reader = self.create_reader_if_not_exist_locked(&mut inner, context)?;
        inner.live_docs_shared = true;
        match inner.live_docs {
            Some(ref live_docs) => {
                let num_docs = self.info.info.max_doc()
                    - self.info.del_count()
                    - inner.pending_delete_count as i32;
                Ok(Arc::new(SegmentReader::with_live_docs(
                    Arc::clone(&self.info),
                    &reader,
                    Some(Arc::clone(live_docs)),
                    num_docs,
                    true,
                )?))
            }
            None => {
                // No deletes, just use the same reader
                debug_assert!(reader.live_docs().is_none());
                Ok(reader)
            }
        }
    }

    /// The live docs as of now; `None` means every doc is live. The returned
    /// bits are marked shared so later deletes copy them first.
    pub fn readonly_live_docs(&self) -> Result<Option<Arc<FixedBitSet>>> {
        let mut inner = self.inner.lock()?;
        inner.live_docs_shared = true;
        Ok(inner.live_docs.clone())
    }

    /// The live docs as of now, for callers that only look at them while
    /// holding the writer lock.
    pub fn live_docs(&self) -> Result<Option<Arc<FixedBitSet>>> {
        Ok(self.inner.lock()?.live_docs.clone())
    }

    fn init_writable_live_docs_locked(
        &self,
        inner: &mut MutexGuard<ReadersAndUpdatesInner>,
    ) -> Result<()> {
        if !inner.live_docs_shared {
            return Ok(());
        }
        if inner.live_docs.is_none() && self.info.has_deletions() {
            // the on-disk deletes must be loaded before we add ours
            self.create_reader_if_not_exist_locked(inner, &IOContext::READ)?;
        }
        let codec = &self.info.info.codec;
        let bits = match inner.live_docs {
            // copy on write
            Some(ref bits) => bits.as_ref().clone(),
            None => codec
                .live_docs_format()
                .new_live_docs(self.info.info.max_doc() as usize),
        };
        inner.live_docs = Some(Arc::new(bits));
        inner.live_docs_shared = false;
        Ok(())
    }

    pub fn init_writable_live_docs(&self) -> Result<()> {
        let mut inner = self.inner.lock()?;
        self.init_writable_live_docs_locked(&mut inner)
    }

    /// Marks `doc_id` deleted. Returns false if it was already deleted.
    pub fn delete(&self, doc_id: DocId) -> Result<bool> {
        let mut inner = self.inner.lock()?;
        self.init_writable_live_docs_locked(&mut inner)?;
        let max_doc = self.info.info.max_doc();
        if doc_id < 0 || doc_id >= max_doc {
            bail!(IllegalState(format!(
                "doc {} out of bounds for segment {} with max_doc {}",
                doc_id,
                self.info.name(),
                max_doc
            )));
        }
        let did_delete = match inner.live_docs {
            Some(ref mut bits) => Arc::make_mut(bits).get_and_clear(doc_id as usize),
            None => false,
        };
        if did_delete {
            inner.pending_delete_count += 1;
        }
        Ok(did_delete)
    }

    /// Discard (don't save) changes when we are dropping the reader; this is
    /// used only on the sub-readers after a successful merge. If deletes had
    /// accumulated on those sub-readers while the merge is running, by now we
    /// have carried forward those deletes onto the newly merged segment, so
    /// we can discard them on the sub-readers.
    pub fn drop_changes(&self) -> Result<()> {
        let mut inner = self.inner.lock()?;
        inner.pending_delete_count = 0;
        inner.is_merging = false;
        Ok(())
    }

    /// Drops the pooled reader and the pool's own reference.
    pub fn drop_readers(&self) -> Result<()> {
        self.inner.lock()?.reader = None;
        self.dec_ref();
        Ok(())
    }

    /// Commit live docs to the directory (writes new `_X_N.liv` file).
    /// Returns true if we wrote a new file.
    pub fn write_live_docs(&self, dir: &Arc<dyn Directory>) -> Result<bool> {
        let mut inner = self.inner.lock()?;
        if inner.pending_delete_count == 0 {
            return Ok(false);
        }
        let live_docs = match inner.live_docs {
            Some(ref bits) => Arc::clone(bits),
            None => bail!(IllegalState(format!(
                "segment {} has {} pending deletes but no live docs",
                self.info.name(),
                inner.pending_delete_count
            ))),
        };
        debug_assert_eq!(live_docs.len(), self.info.info.max_doc() as usize);

        // We can write directly to the actual name (vs to a .tmp & renaming
        // it) because the file is not live until segments file is written:
        let tracking_dir = TrackingDirectoryWrapper::new(Arc::clone(dir));
        let codec = &self.info.info.codec;
        let res = codec.live_docs_format().write_live_docs(
            &live_docs,
            &tracking_dir,
            &self.info,
            inner.pending_delete_count as i32,
            &IOContext::Default,
        );
        if let Err(e) = res {
            // Advance only the nextWriteDelGen so that a 2nd
            // attempt to write will write to a new file
            self.info.advance_next_write_del_gen();

            // Delete any partially created file(s):
            for file_name in tracking_dir.create_files()? {
                if let Err(del_err) = tracking_dir.delete_file(&file_name) {
                    warn!(
                        "IW: failed to delete partial live docs file {}: {:?}",
                        file_name, del_err
                    );
                }
            }
            return Err(e);
        }

        // If we hit an exc in the line above (eg disk full)
        // then info's delGen remains pointing to the previous
        // (successfully written) del docs:
        self.info.advance_del_gen();
        self.info
            .set_del_count(self.info.del_count() + inner.pending_delete_count as i32)?;
        inner.pending_delete_count = 0;
        Ok(true)
    }
}

impl fmt::Display for ReadersAndUpdates {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "ReadersAndLiveDocs(seg={} pending_deletes={})",
            self.info,
            self.pending_delete_count()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::index::reader::write_segment;
    use crate::core::store::RAMDirectory;

    #[test]
    fn test_delete_and_write_live_docs() -> Result<()> {
        let dir: Arc<dyn Directory> = Arc::new(RAMDirectory::new());
        let info = write_segment(&dir, "_0", 10)?;
        let rld = ReadersAndUpdates::new(Arc::clone(&info));

        assert!(rld.delete(3)?);
        assert!(!rld.delete(3)?);
        assert!(rld.delete(7)?);
        assert_eq!(rld.pending_delete_count(), 2);
        assert!(rld.delete(10).is_err());

        let gen = info.next_write_del_gen();
        assert!(rld.write_live_docs(&dir)?);
        assert_eq!(rld.pending_delete_count(), 0);
        assert_eq!(info.del_count(), 2);
        assert_eq!(info.del_gen(), gen);
        // nothing pending anymore
        assert!(!rld.write_live_docs(&dir)?);

        // a fresh reader sees the persisted deletes
        let reader = SegmentReader::open(&info, &IOContext::READ)?;
        assert_eq!(reader.num_docs(), 8);
        assert!(!reader.is_live(3));
        Ok(())
    }

    #[test]
    fn test_readonly_clone_is_isolated() -> Result<()> {
        let dir: Arc<dyn Directory> = Arc::new(RAMDirectory::new());
        let info = write_segment(&dir, "_0", 6)?;
        let rld = ReadersAndUpdates::new(Arc::clone(&info));

        // no deletes yet: the pooled reader itself
        let untouched = rld.get_readonly_clone(&IOContext::READ)?;
        assert_eq!(untouched.num_docs(), 6);

        rld.delete(1)?;
        let clone = rld.get_readonly_clone(&IOContext::READ)?;
        assert_eq!(clone.num_docs(), 5);
        assert!(!clone.is_live(1));

        rld.delete(2)?;
        assert!(clone.is_live(2));
        assert_eq!(clone.num_docs(), 5);
        assert_eq!(untouched.num_docs(), 6);

        let later = rld.get_readonly_clone(&IOContext::READ)?;
        assert!(!later.is_live(2));
        assert_eq!(later.num_docs(), 4);
        Ok(())
    }

    #[test]
    fn test_existing_deletes_are_loaded_before_new_ones() -> Result<()> {
        let dir: Arc<dyn Directory> = Arc::new(RAMDirectory::new());
        let info = write_segment(&dir, "_0", 4)?;
        let first = ReadersAndUpdates::new(Arc::clone(&info));
        first.delete(0)?;
        first.write_live_docs(&dir)?;

        let second = ReadersAndUpdates::new(Arc::clone(&info));
        assert!(!second.delete(0)?);
        assert!(second.delete(1)?);
        let live = second.live_docs()?;
        assert_eq!(live.map(|bits| bits.cardinality()), Some(2));
        Ok(())
    }

    #[test]
    fn test_pool_release_without_pooling_writes_and_drops() -> Result<()> {
        let dir: Arc<dyn Directory> = Arc::new(RAMDirectory::new());
        let info = write_segment(&dir, "_0", 5)?;
        let pool = ReaderPool::new(Arc::clone(&dir), false);

        assert!(pool.get(&info, false)?.is_none());
        let rld = pool.get(&info, true)?.unwrap();
        assert_eq!(rld.ref_count(), 2);
        rld.delete(4)?;
        assert!(pool.any_pending_deletes()?);
        assert_eq!(pool.num_deleted_docs(&info)?, 1);

        assert!(pool.release(&rld)?);
        assert!(pool.get(&info, false)?.is_none());
        assert_eq!(info.del_count(), 1);
        assert!(!pool.any_pending_deletes()?);
        Ok(())
    }

    #[test]
    fn test_pool_keeps_readers_when_pooling() -> Result<()> {
        let dir: Arc<dyn Directory> = Arc::new(RAMDirectory::new());
        let info = write_segment(&dir, "_0", 5)?;
        let pool = ReaderPool::new(Arc::clone(&dir), true);

        let rld = pool.get(&info, true)?.unwrap();
        rld.delete(0)?;
        assert!(!pool.release(&rld)?);
        let again = pool.get(&info, false)?.unwrap();
        assert!(Arc::ptr_eq(&rld, &again));
        assert_eq!(info.del_count(), 0);

        let mut infos = SegmentInfos::default();
        infos.add(Arc::clone(&info));
        assert!(pool.commit(&infos)?);
        assert_eq!(info.del_count(), 1);
        assert!(!pool.commit(&infos)?);

        rld.delete(1)?;
        assert!(!pool.drop_all(false)?);
        assert_eq!(info.del_count(), 1);
        assert!(pool.get(&info, false)?.is_none());
        Ok(())
    }
}
