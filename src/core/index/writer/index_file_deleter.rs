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

use crate::core::codec::segment_infos::{
    generation_from_segments_file_name, is_segments_file, matches_codec_file_pattern,
    parse_generation, parse_segment_name, SegmentInfos, INDEX_FILE_OLD_SEGMENT_GEN,
    INDEX_FILE_PENDING_SEGMENTS, INDEX_FILE_SEGMENTS, WRITE_LOCK_NAME,
};
use crate::core::codec::Codec;
use crate::core::index::writer::{CommitPoint, IndexDeletionPolicy};
use crate::core::store::Directory;
use crate::core::util::from_base36;
use crate::error::{ErrorKind::IllegalState, Result};

use std::cmp::max;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::mem;
use std::sync::Arc;

/// This class keeps track of each SegmentInfos instance that
/// is still "live", either because it corresponds to a
/// segments_N file in the Directory (a "commit", i.e. a
/// committed SegmentInfos) or because it's an in-memory
/// SegmentInfos that a writer is actively updating but has
/// not yet committed.  This class uses simple reference
/// counting to map the live SegmentInfos instances to
/// individual files in the Directory.
///
/// The same directory file may be referenced by more than
/// one commit. Therefore we count how many commits reference each file.
/// When all the commits referencing a certain file have been
/// deleted, the refcount for that file becomes zero, and the
/// file is deleted.
///
/// A separate deletion policy interface (`IndexDeletionPolicy`) is
/// consulted on creation (`on_init`) and once per commit (`on_commit`),
/// to decide when a commit should be removed.
///
/// It is the business of the `IndexDeletionPolicy` to choose when to
/// delete commit points. The actual mechanics of file deletion, retrying,
/// etc, derived from the deletion of commit points is the business of the
/// `IndexFileDeleter`.
///
/// Deletes that fail, e.g. because a reader still has the file open, are
/// remembered and retried by `delete_pending_files`.
///
/// Note that you must hold the write.lock before instantiating this
/// class. It opens segments_N file(s) directly with no retry logic.
pub struct IndexFileDeleter {
    /// Reference count for all files in the index. Counts
    /// how many existing commits reference a file.
    ref_counts: HashMap<String, RefCount>,
    /// Holds all commits (segments_N) currently in the index.
    /// this will have just 1 commit if you are using the default
    /// delete policy (KeepOnlyLastCommitDeletionPolicy). Other policies
    /// may leave commit points live for longer in which case this list
    /// would be longer than 1.
    commits: Vec<CommitPoint>,
    /// Holds files we had inc_ref'd from the previous non-commit checkpoint:
    last_files: Vec<String>,
    /// Files whose delete failed, retried later.
    deletable: HashSet<String>,
    directory_orig: Arc<dyn Directory>,
    directory: Arc<dyn Directory>,
    policy: Arc<dyn IndexDeletionPolicy>,
    starting_commit_deleted: bool,
    last_segment_infos: Option<SegmentInfos>,
}

impl IndexFileDeleter {
    /// Initializes the deleter: ref-counts every commit found in `files`,
    /// deletes unreferenced index files, lets the policy delete old commits
    /// and protects `segment_infos`, whose generations are inflated past
    /// anything found in the directory.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        files: &[String],
        directory_orig: Arc<dyn Directory>,
        directory: Arc<dyn Directory>,
        codec: &Arc<dyn Codec>,
        policy: Arc<dyn IndexDeletionPolicy>,
        segment_infos: &mut SegmentInfos,
        initial_index_exists: bool,
    ) -> Result<IndexFileDeleter> {
        let mut deleter = IndexFileDeleter {
            ref_counts: HashMap::new(),
            commits: vec![],
            last_files: vec![],
            deletable: HashSet::new(),
            directory_orig,
            directory,
            policy,
            starting_commit_deleted: false,
            last_segment_infos: None,
        };
        deleter.init(files, codec, segment_infos, initial_index_exists)?;
        Ok(deleter)
    }

    fn init(
        &mut self,
        files: &[String],
        codec: &Arc<dyn Codec>,
        segment_infos: &mut SegmentInfos,
        initial_index_exists: bool,
    ) -> Result<()> {
        let current_segments_file = segment_infos.segment_file_name();
        debug!(
            "IFD: init: current segments file is {:?}",
            current_segments_file
        );

        let mut current_commit_generation = None;
        for filename in files {
            if filename == WRITE_LOCK_NAME || !is_index_file_name(filename) {
                continue;
            }
            // Add this file to ref_counts with initial count 0:
            self.ref_counts.entry(filename.clone()).or_default();

            if is_segments_file(filename) {
                // This is a commit (segments or segments_N), and
                // it's valid (<= the max gen).  Load it, then
                // incref all files it refers to:
                debug!("IFD: init: load commit {}", filename);
                let sis = SegmentInfos::read_commit(&self.directory_orig, codec, filename)?;
                self.commits.push(CommitPoint::new(&sis)?);
                if sis.generation == segment_infos.generation {
                    current_commit_generation = Some(sis.generation);
                }
                self.inc_ref_by_segment(&sis, true);
                let newer = match self.last_segment_infos {
                    Some(ref last) => sis.generation > last.generation,
                    None => true,
                };
                if newer {
                    self.last_segment_infos = Some(sis);
                }
            }
        }

        if let Some(ref current_segments_file) = current_segments_file {
            if current_commit_generation.is_none() && initial_index_exists {
                // We did not in fact see the segments_N file
                // corresponding to the segmentInfos that was passed
                // in.  Yet, it must exist, because our caller holds
                // the write lock.  This can happen when the directory
                // listing was stale (eg when index accessed via NFS
                // client with stale directory listing cache).  So we
                // try now to explicitly open this commit point:
                debug!(
                    "IFD: init: commit {} is missing from the listing, reading it explicitly",
                    current_segments_file
                );
                let sis =
                    SegmentInfos::read_commit(&self.directory_orig, codec, current_segments_file)?;
                self.commits.push(CommitPoint::new(&sis)?);
                current_commit_generation = Some(sis.generation);
                self.inc_ref_by_segment(&sis, true);
            }
        }

        // We keep commits list in sorted order (oldest to newest):
        self.commits.sort_by_key(|c| c.generation());

        // ref_counts only includes "normal" filenames (does not include write.lock)
        let known: Vec<String> = self.ref_counts.keys().cloned().collect();
        inflate_gens(segment_infos, &known)?;

        // Now delete anything with ref count at 0.  These are
        // presumably abandoned files eg due to crash of
        // IndexWriter.
        let mut to_delete = HashSet::new();
        for (filename, rc) in &self.ref_counts {
            if rc.count == 0 {
                // A segments_N file should never have ref count 0 on init:
                if filename.starts_with(INDEX_FILE_SEGMENTS) && filename != INDEX_FILE_OLD_SEGMENT_GEN {
                    bail!(IllegalState(format!(
                        "file \"{}\" has ref_count=0, which should never happen on init",
                        filename
                    )));
                }
                debug!("IFD: init: removing unreferenced file \"{}\"", filename);
                to_delete.insert(filename.clone());
            }
        }
        for filename in &to_delete {
            self.ref_counts.remove(filename);
        }
        self.delete_files(&to_delete);

        // Finally, give policy a chance to remove things on
        // startup:
        self.policy.on_init(&mut self.commits)?;

        // Always protect the incoming segmentInfos since
        // sometime it may not be the most recent commit
        self.checkpoint(segment_infos, false)?;

        self.starting_commit_deleted = match current_commit_generation {
            Some(gen) => self
                .commits
                .iter()
                .any(|c| c.generation() == gen && c.is_deleted()),
            None => false,
        };

        self.delete_commits()
    }

    /// Whether the deletion policy removed the commit the writer was opened on.
    pub fn starting_commit_deleted(&self) -> bool {
        self.starting_commit_deleted
    }

    /// The most recent commit found in the directory on init.
    pub fn last_segment_infos(&self) -> Option<&SegmentInfos> {
        self.last_segment_infos.as_ref()
    }

    /// The live commits, oldest first.
    pub fn commits(&self) -> &[CommitPoint] {
        &self.commits
    }

    /// Files whose deletion failed and will be retried.
    pub fn pending_deletes(&self) -> &HashSet<String> {
        &self.deletable
    }

    /// For definition of "check point" see IndexWriter comments:
    /// "Clarification: Check Points (and commits)".
    ///
    /// Writer calls this when it has made a "consistent
    /// change" to the index, meaning new files are written to
    /// the index and the in-memory SegmentInfos have been
    /// modified to point to those files.
    ///
    /// This may or may not be a commit (segments_N may or may
    /// not have been written).
    ///
    /// We simply incref the files referenced by the new
    /// SegmentInfos and decref the files we had previously
    /// seen (if any).
    ///
    /// If this is a commit, we also call the policy to give it
    /// a chance to remove other commits.  If any commits are
    /// removed, we decref their files as well.
    pub fn checkpoint(&mut self, segment_infos: &SegmentInfos, is_commit: bool) -> Result<()> {
        // Try again now to delete any previously un-deletable files (because
        // they were in use, on Windows):
        self.delete_pending_files();

        // incref the files:
        self.inc_ref_by_segment(segment_infos, is_commit);

        if is_commit {
            // Append to our commits list:
            self.commits.push(CommitPoint::new(segment_infos)?);
            // Tell policy so it can remove commits:
            self.policy.on_commit(&mut self.commits)?;
            // Decref files for commits that were deleted by the policy:
            self.delete_commits()
        } else {
            // DecRef old files from the last checkpoint, if any:
            let last_files = mem::replace(&mut self.last_files, vec![]);
            self.dec_ref_files(&last_files);
            // Save files so we can decr on next checkpoint/commit:
            self.last_files.extend(segment_infos.files(false));
            Ok(())
        }
    }

    pub fn exists(&self, filename: &str) -> bool {
        self.ref_counts
            .get(filename)
            .map_or(false, |rc| rc.count > 0)
    }

    pub fn ref_count(&self, filename: &str) -> u32 {
        self.ref_counts.get(filename).map_or(0, |rc| rc.count)
    }

    pub fn inc_ref_by_segment(&mut self, segment_infos: &SegmentInfos, is_commit: bool) {
        // If this is a commit point, also incRef the
        // segments_N file:
        for file in segment_infos.files(is_commit) {
            self.inc_ref(&file);
        }
    }

    pub fn inc_ref_files<'a, I>(&mut self, files: I)
    where
        I: IntoIterator<Item = &'a String>,
    {
        for file in files {
            self.inc_ref(file);
        }
    }

    fn inc_ref(&mut self, filename: &str) {
        trace!("IFD: inc_ref \"{}\"", filename);
        self.ref_counts
            .entry(filename.to_string())
            .or_default()
            .inc_ref();
    }

    pub fn dec_ref_by_segment(&mut self, segment_infos: &SegmentInfos) {
        let files = segment_infos.files(false);
        self.dec_ref_files(&files);
    }

    /// Decrefs all provided files and deletes those no longer referenced.
    /// A delete that fails is queued for retry instead of failing the call.
    pub fn dec_ref_files<'a, I>(&mut self, files: I)
    where
        I: IntoIterator<Item = &'a String>,
    {
        let mut to_delete = HashSet::new();
        for file in files {
            if self.dec_ref(file) {
                to_delete.insert(file.clone());
            }
        }
        self.delete_files(&to_delete);
    }

    /// Returns true if the file should now be deleted.
    fn dec_ref(&mut self, filename: &str) -> bool {
        trace!("IFD: dec_ref \"{}\"", filename);
        let rc = self.ref_counts.entry(filename.to_string()).or_default();
        if rc.dec_ref() == 0 {
            // This file is no longer referenced by any past
            // commit points nor by the in-memory SegmentInfos:
            self.ref_counts.remove(filename);
            true
        } else {
            false
        }
    }

    /// Remove the CommitPoints the policy marked deleted, decref'ing all
    /// files of each.
    fn delete_commits(&mut self) -> Result<()> {
        let (deleted, kept): (Vec<CommitPoint>, Vec<CommitPoint>) =
            mem::replace(&mut self.commits, vec![])
                .into_iter()
                .partition(|c| c.is_deleted());
        // keeps the sort
        self.commits = kept;
        for commit in &deleted {
            debug!(
                "IFD: delete commit \"{}\"",
                commit.segments_file_name()
            );
            self.dec_ref_files(commit.file_names());
        }
        Ok(())
    }

    // Deletes segments_N files first, so that a crash in the middle never
    // leaves an index whose last commit references missing files.
    fn delete_files(&mut self, names: &HashSet<String>) {
        let (segments, others): (Vec<&String>, Vec<&String>) = names
            .iter()
            .partition(|name| name.starts_with(INDEX_FILE_SEGMENTS));
        for name in segments.into_iter().chain(others) {
            self.delete_file(name);
        }
    }

    fn delete_file(&mut self, filename: &str) {
        debug!("IFD: delete \"{}\"", filename);
        match self.directory.delete_file(filename) {
            Ok(()) => {
                self.deletable.remove(filename);
            }
            Err(ref e) if e.is_not_found() => {
                self.deletable.remove(filename);
            }
            Err(e) => {
                // Some operating systems (e.g. Windows) don't permit a file to be
                // deleted while it is opened for read (e.g. by another process or
                // thread). So we assume that when a delete fails it is because the
                // file is in use, and we will retry later:
                debug!(
                    "IFD: unable to remove file \"{}\": {}; will re-try later.",
                    filename, e
                );
                self.deletable.insert(filename.to_string());
            }
        }
    }

    /// Retries every delete that failed before.
    pub fn delete_pending_files(&mut self) {
        if self.deletable.is_empty() {
            return;
        }
        let pending = mem::replace(&mut self.deletable, HashSet::new());
        debug!("IFD: retry deleting {} files", pending.len());
        for filename in pending {
            // a pending file may have been re-created and referenced since
            if !self.exists(&filename) {
                self.delete_file(&filename);
            }
        }
    }

    /// Deletes the specified files, but only if they are new
    /// (have not yet been incref'd).
    pub fn delete_new_files<'a, I>(&mut self, files: I)
    where
        I: IntoIterator<Item = &'a String>,
    {
        // NOTE: it's very unusual yet possible for the
        // refCount to be present and 0: it can happen if you
        // open IW on a crashed index, and it removes a bunch
        // of unref'd files, and then you add new docs / do
        // merging, and it reuses that segment name.
        let filtered: HashSet<String> = files
            .into_iter()
            .filter(|f| !self.exists(f))
            .cloned()
            .collect();
        debug!("IFD: delete new files {:?}", filtered);
        self.delete_files(&filtered);
    }

    /// Writer calls this when it has hit an error and had to
    /// roll back, to tell us that there may now be
    /// unreferenced files in the filesystem.  So we re-list
    /// the filesystem and delete such files.  If `segment_name`
    /// is given, we will only delete files corresponding to
    /// that segment.
    pub fn refresh(&mut self, segment_name: Option<&str>) -> Result<()> {
        let files = self.directory.list_all()?;
        let segment_prefixes =
            segment_name.map(|name| (format!("{}.", name), format!("{}_", name)));
        let mut to_delete = HashSet::new();
        for filename in files {
            if filename == WRITE_LOCK_NAME || self.ref_counts.contains_key(&filename) {
                continue;
            }
            let in_segment = match segment_prefixes {
                Some((ref dot, ref underscore)) => {
                    filename.starts_with(dot.as_str()) || filename.starts_with(underscore.as_str())
                }
                None => true,
            };
            // we only try to clear out pending_segments_N during rollback(),
            // because we don't ref-count it
            if in_segment
                && (is_index_file_name(&filename)
                    || filename.starts_with(INDEX_FILE_PENDING_SEGMENTS))
            {
                // Unreferenced file, so remove it
                debug!(
                    "IFD: refresh: removing newly created unreferenced file \"{}\"",
                    filename
                );
                to_delete.insert(filename);
            }
        }
        self.delete_files(&to_delete);
        Ok(())
    }

    /// Releases the files of the last checkpoint and retries pending deletes.
    pub fn close(&mut self) {
        if !self.last_files.is_empty() {
            let files = mem::replace(&mut self.last_files, vec![]);
            self.dec_ref_files(&files);
        }
        self.delete_pending_files();
    }
}

impl fmt::Debug for IndexFileDeleter {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("IndexFileDeleter")
            .field("directory", &self.directory_orig.to_string())
            .field("commits", &self.commits)
            .field("ref_counts", &self.ref_counts)
            .field("deletable", &self.deletable)
            .finish()
    }
}

fn is_index_file_name(filename: &str) -> bool {
    matches_codec_file_pattern(filename)
        || filename.starts_with(INDEX_FILE_SEGMENTS)
        || filename.starts_with(INDEX_FILE_PENDING_SEGMENTS)
}

/// Set all gens beyond what we currently see in the directory, to avoid
/// double-write in cases where the previous IndexWriter did not gracefully
/// close/rollback (e.g. os/machine crashed or lost power).
fn inflate_gens(infos: &mut SegmentInfos, files: &[String]) -> Result<()> {
    let mut max_segment_gen = ::std::i64::MIN;
    let mut max_segment_name: i64 = -1;

    // the union of live docs gens (and maybe others, in the future) per segment
    let mut max_per_segment_gen: HashMap<&str, u64> = HashMap::new();

    for filename in files {
        if filename == INDEX_FILE_OLD_SEGMENT_GEN || filename == WRITE_LOCK_NAME {
            // do nothing
        } else if filename.starts_with(INDEX_FILE_SEGMENTS) {
            // trash file: we have to handle this since we allow anything
            // starting with 'segments' here
            if let Ok(gen) = generation_from_segments_file_name(filename) {
                max_segment_gen = max(gen, max_segment_gen);
            }
        } else if filename.starts_with(INDEX_FILE_PENDING_SEGMENTS) {
            // the first 8 bytes are "pending_"
            if let Ok(gen) = generation_from_segments_file_name(&filename[8..]) {
                max_segment_gen = max(gen, max_segment_gen);
            }
        } else {
            let segment_name = parse_segment_name(filename);
            debug_assert!(segment_name.starts_with('_'));

            if filename.to_lowercase().ends_with(".tmp") {
                // A temp file: don't try to look at its gen
                continue;
            }

            if let Some(n) = segment_name.get(1..).and_then(from_base36) {
                max_segment_name = max(max_segment_name, n as i64);
            }

            let mut cur_gen = max_per_segment_gen.get(segment_name).cloned().unwrap_or(0);
            if let Ok(gen) = parse_generation(filename) {
                cur_gen = max(cur_gen, gen);
            }
            max_per_segment_gen.insert(segment_name, cur_gen);
        }
    }

    // Generation is advanced before write:
    infos.generation = max(infos.generation, max_segment_gen);
    if i64::from(infos.counter) < max_segment_name + 1 {
        infos.counter = (max_segment_name + 1) as i32;
    }

    for info in &infos.segments {
        let gen = max_per_segment_gen
            .get(info.info.name.as_str())
            .cloned()
            .unwrap_or(0) as i64;
        if info.next_write_del_gen() < gen + 1 {
            info.set_next_write_del_gen(gen + 1);
        }
    }
    Ok(())
}

#[derive(Default)]
struct RefCount {
    // fix for LUCENE-2545: assert that a file is not inc'ed after it was already fully dec'ed
    inited: bool,
    count: u32,
}

impl RefCount {
    fn inc_ref(&mut self) -> u32 {
        if !self.inited {
            self.inited = true;
        } else {
            debug_assert!(self.count > 0);
        }
        self.count += 1;
        self.count
    }

    fn dec_ref(&mut self) -> u32 {
        debug_assert!(self.count > 0);
        self.count = self.count.saturating_sub(1);
        self.count
    }
}

impl fmt::Debug for RefCount {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::codec::DefaultCodec;
    use crate::core::index::reader::write_segment;
    use crate::core::index::writer::{KeepOnlyLastCommitDeletionPolicy, NoDeletionPolicy};
    use crate::core::store::{write_file, IOContext, RAMDirectory};

    fn commit(dir: &Arc<dyn Directory>, infos: &mut SegmentInfos) -> Result<String> {
        infos.prepare_commit(dir.as_ref())?;
        infos.finish_commit(dir.as_ref())
    }

    fn open(
        dir: &Arc<dyn Directory>,
        policy: Arc<dyn IndexDeletionPolicy>,
    ) -> Result<(SegmentInfos, IndexFileDeleter)> {
        let codec = DefaultCodec::shared();
        let mut infos = SegmentInfos::read_latest_commit(dir, &codec)?;
        let files = dir.list_all()?;
        let deleter = IndexFileDeleter::new(
            &files,
            Arc::clone(dir),
            Arc::clone(dir),
            &codec,
            policy,
            &mut infos,
            true,
        )?;
        Ok((infos, deleter))
    }

    #[test]
    fn test_init_removes_unreferenced_files() -> Result<()> {
        let dir: Arc<dyn Directory> = Arc::new(RAMDirectory::new());
        let mut infos = SegmentInfos::default();
        infos.add(write_segment(&dir, "_0", 4)?);
        commit(&dir, &mut infos)?;
        // leftovers of a crashed writer
        let orphan = write_segment(&dir, "_5", 2)?;
        write_file(dir.as_ref(), "unrelated.txt", b"keep", &IOContext::Default)?;

        let (infos, deleter) = open(&dir, Arc::new(KeepOnlyLastCommitDeletionPolicy))?;
        for file in orphan.files() {
            assert!(!dir.list_all()?.contains(&file), "{} survived", file);
        }
        assert!(dir.list_all()?.contains(&"unrelated.txt".to_string()));
        // the crashed segment name is never reused
        assert_eq!(infos.counter, 6);
        assert_eq!(deleter.commits().len(), 1);
        assert!(deleter.exists("segments_1"));
        for file in infos.files(false) {
            // referenced by the commit and the checkpoint
            assert_eq!(deleter.ref_count(&file), 2);
        }
        Ok(())
    }

    #[test]
    fn test_new_commit_deletes_previous_one() -> Result<()> {
        let dir: Arc<dyn Directory> = Arc::new(RAMDirectory::new());
        let mut infos = SegmentInfos::default();
        infos.add(write_segment(&dir, "_0", 2)?);
        commit(&dir, &mut infos)?;
        let (mut infos, mut deleter) = open(&dir, Arc::new(KeepOnlyLastCommitDeletionPolicy))?;

        let replaced = infos.segments[0].files();
        infos.clear();
        infos.add(write_segment(&dir, "_1", 3)?);
        deleter.checkpoint(&infos, false)?;
        commit(&dir, &mut infos)?;
        deleter.checkpoint(&infos, true)?;

        let files = dir.list_all()?;
        assert!(!files.contains(&"segments_1".to_string()));
        assert!(files.contains(&"segments_2".to_string()));
        for file in replaced {
            assert!(!files.contains(&file));
        }
        assert_eq!(deleter.commits().len(), 1);
        assert_eq!(deleter.commits()[0].generation(), 2);
        Ok(())
    }

    #[test]
    fn test_no_deletion_policy_keeps_commits() -> Result<()> {
        let dir: Arc<dyn Directory> = Arc::new(RAMDirectory::new());
        let mut infos = SegmentInfos::default();
        infos.add(write_segment(&dir, "_0", 2)?);
        commit(&dir, &mut infos)?;
        let (mut infos, mut deleter) = open(&dir, Arc::new(NoDeletionPolicy))?;
        infos.add(write_segment(&dir, "_1", 2)?);
        commit(&dir, &mut infos)?;
        deleter.checkpoint(&infos, true)?;

        let files = dir.list_all()?;
        assert!(files.contains(&"segments_1".to_string()));
        assert!(files.contains(&"segments_2".to_string()));
        assert_eq!(deleter.commits().len(), 2);
        Ok(())
    }

    #[test]
    fn test_failed_delete_is_retried() -> Result<()> {
        let ram = Arc::new(RAMDirectory::new());
        let dir: Arc<dyn Directory> = Arc::clone(&ram) as Arc<dyn Directory>;
        let mut infos = SegmentInfos::default();
        infos.add(write_segment(&dir, "_0", 2)?);
        commit(&dir, &mut infos)?;
        let (mut infos, mut deleter) = open(&dir, Arc::new(KeepOnlyLastCommitDeletionPolicy))?;

        let si_file = "_0.si".to_string();
        assert!(infos.files(false).contains(&si_file));
        let reader = dir.open_input(&si_file, &IOContext::READ)?;
        ram.set_refuse_delete_open_files(true);

        infos.clear();
        deleter.checkpoint(&infos, false)?;
        commit(&dir, &mut infos)?;
        deleter.checkpoint(&infos, true)?;
        assert!(ram.file_exists(&si_file));
        assert!(deleter.pending_deletes().contains(&si_file));

        drop(reader);
        deleter.delete_pending_files();
        assert!(!ram.file_exists(&si_file));
        assert!(deleter.pending_deletes().is_empty());
        Ok(())
    }

    #[test]
    fn test_delete_new_files_skips_referenced() -> Result<()> {
        let dir: Arc<dyn Directory> = Arc::new(RAMDirectory::new());
        let mut infos = SegmentInfos::default();
        infos.add(write_segment(&dir, "_0", 2)?);
        commit(&dir, &mut infos)?;
        let (_, mut deleter) = open(&dir, Arc::new(KeepOnlyLastCommitDeletionPolicy))?;

        let fresh = write_segment(&dir, "_1", 2)?;
        let mut files = fresh.files();
        files.insert("_0.si".to_string());
        deleter.delete_new_files(&files);
        let listed = dir.list_all()?;
        assert!(listed.contains(&"_0.si".to_string()));
        for file in fresh.files() {
            assert!(!listed.contains(&file));
        }
        Ok(())
    }

    #[test]
    fn test_refresh_only_touches_named_segment() -> Result<()> {
        let dir: Arc<dyn Directory> = Arc::new(RAMDirectory::new());
        let mut infos = SegmentInfos::default();
        infos.add(write_segment(&dir, "_0", 2)?);
        commit(&dir, &mut infos)?;
        let (_, mut deleter) = open(&dir, Arc::new(KeepOnlyLastCommitDeletionPolicy))?;

        let a = write_segment(&dir, "_1", 2)?;
        let b = write_segment(&dir, "_2", 2)?;
        deleter.refresh(Some("_1"))?;
        let listed = dir.list_all()?;
        assert!(a.files().iter().all(|f| !listed.contains(f)));
        assert!(b.files().iter().all(|f| listed.contains(f)));

        deleter.refresh(None)?;
        let listed = dir.list_all()?;
        assert!(b.files().iter().all(|f| !listed.contains(f)));
        assert!(listed.contains(&"segments_1".to_string()));
        Ok(())
    }
}
