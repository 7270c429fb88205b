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
use std::hash::{Hash, Hasher};
use std::io;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicI64, Ordering as AtomicOrdering};
use std::sync::{Arc, RwLock};

use crate::core::codec::segment_infos::{
    file_name_from_generation, generation_from_segments_file_name, get_last_commit_generation,
    matches_codec_file_pattern, strip_segment_name, INDEX_FILE_PENDING_SEGMENTS,
    INDEX_FILE_SEGMENTS,
};
use crate::core::codec::{read_index_file, write_index_file, Codec};
use crate::core::store::{Directory, IOContext};
use crate::core::util::{id2str, str2id, to_base36, ID_LENGTH};
use crate::error::{
    ErrorKind::{CorruptIndex, IllegalArgument, IllegalState},
    Result,
};

const SEGMENTS_CODEC: &str = "segments";
const SEGMENT_VERSION_START: u32 = 0;
const SEGMENT_VERSION_CURRENT: u32 = SEGMENT_VERSION_START;

/// Information about a segment such as its name, directory, and files related
/// to the segment.
pub struct SegmentInfo {
    pub name: String,
    /// -1 until the merge that produces this segment knows its size
    max_doc: AtomicI32,
    pub directory: Arc<dyn Directory>,
    is_compound_file: AtomicBool,
    pub id: [u8; ID_LENGTH],
    pub codec: Arc<dyn Codec>,
    pub diagnostics: HashMap<String, String>,
    set_files: RwLock<HashSet<String>>,
}

impl SegmentInfo {
    pub fn new(
        name: &str,
        max_doc: i32,
        directory: Arc<dyn Directory>,
        is_compound_file: bool,
        codec: Arc<dyn Codec>,
        diagnostics: HashMap<String, String>,
        id: [u8; ID_LENGTH],
    ) -> SegmentInfo {
        SegmentInfo {
            name: name.to_string(),
            max_doc: AtomicI32::new(max_doc),
            directory,
            is_compound_file: AtomicBool::new(is_compound_file),
            id,
            codec,
            diagnostics,
            set_files: RwLock::new(HashSet::new()),
        }
    }

    pub fn max_doc(&self) -> i32 {
        self.max_doc.load(AtomicOrdering::Acquire)
    }

    pub fn set_max_doc(&self, max_doc: i32) -> Result<()> {
        if self
            .max_doc
            .compare_exchange(-1, max_doc, AtomicOrdering::AcqRel, AtomicOrdering::Acquire)
            .is_err()
        {
            bail!(IllegalState(format!(
                "max_doc of {} was already set",
                self.name
            )));
        }
        Ok(())
    }

    pub fn is_compound_file(&self) -> bool {
        self.is_compound_file.load(AtomicOrdering::Acquire)
    }

    pub fn set_use_compound_file(&self, use_compound: bool) {
        self.is_compound_file
            .store(use_compound, AtomicOrdering::Release)
    }

    /// Return all files referenced by this SegmentInfo.
    pub fn files(&self) -> HashSet<String> {
        match self.set_files.read() {
            Ok(files) => files.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn set_files(&self, files: &HashSet<String>) -> Result<()> {
        let mut named = HashSet::with_capacity(files.len());
        for f in files {
            self.check_file_name(f)?;
            named.insert(self.named_for_this_segment(f));
        }
        *self.set_files.write()? = named;
        Ok(())
    }

    pub fn add_file(&self, file: &str) -> Result<()> {
        self.check_file_name(file)?;
        let file = self.named_for_this_segment(file);
        self.set_files.write()?.insert(file);
        Ok(())
    }

    fn check_file_name(&self, file: &str) -> Result<()> {
        if !matches_codec_file_pattern(file) {
            bail!(IllegalArgument(format!("invalid codec file name: {}", file)));
        }
        if file.to_lowercase().ends_with(".tmp") {
            bail!(IllegalArgument(format!(
                "invalid codec file name, can't end with .tmp extension: {}",
                file
            )));
        }
        Ok(())
    }

    fn named_for_this_segment(&self, file: &str) -> String {
        let mut name = self.name.clone();
        name.push_str(strip_segment_name(file));
        name
    }
}

impl Clone for SegmentInfo {
    fn clone(&self) -> Self {
        SegmentInfo {
            name: self.name.clone(),
            max_doc: AtomicI32::new(self.max_doc()),
            directory: Arc::clone(&self.directory),
            is_compound_file: AtomicBool::new(self.is_compound_file()),
            id: self.id,
            codec: Arc::clone(&self.codec),
            diagnostics: self.diagnostics.clone(),
            set_files: RwLock::new(self.files()),
        }
    }
}

impl fmt::Display for SegmentInfo {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let cfs = if self.is_compound_file() { 'c' } else { 'C' };
        write!(f, "{}({}):{}{}", self.name, self.codec.name(), cfs, self.max_doc())
    }
}

impl fmt::Debug for SegmentInfo {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self)
    }
}

/// Embeds a shared `SegmentInfo` and adds per-commit fields.
pub struct SegmentCommitInfo {
    pub info: Arc<SegmentInfo>,
    /// How many deleted docs in the segment
    del_count: AtomicI32,
    /// Generation number of the live docs file (-1 if there are no deletes yet)
    del_gen: AtomicI64,
    /// Normally 1 + del_gen, unless an error was hit on last attempt to write
    next_write_del_gen: AtomicI64,
    size_in_bytes: AtomicI64,
    // only used in-RAM by the writer to track buffered deletes,
    // never written to or read from the directory
    buffered_deletes_gen: AtomicI64,
}

impl SegmentCommitInfo {
    pub fn new(info: Arc<SegmentInfo>, del_count: i32, del_gen: i64) -> SegmentCommitInfo {
        SegmentCommitInfo {
            info,
            del_count: AtomicI32::new(del_count),
            del_gen: AtomicI64::new(del_gen),
            next_write_del_gen: AtomicI64::new(if del_gen == -1 { 1 } else { del_gen + 1 }),
            size_in_bytes: AtomicI64::new(-1),
            buffered_deletes_gen: AtomicI64::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.info.name
    }

    /// Returns all files in use by this segment, including the current live docs.
    pub fn files(&self) -> HashSet<String> {
        let mut files = self.info.files();
        self.info.codec.live_docs_format().files(self, &mut files);
        files
    }

    pub fn has_deletions(&self) -> bool {
        self.del_gen() != -1
    }

    pub fn del_count(&self) -> i32 {
        self.del_count.load(AtomicOrdering::Acquire)
    }

    pub fn set_del_count(&self, del_count: i32) -> Result<()> {
        if del_count < 0 || del_count > self.info.max_doc() {
            bail!(IllegalArgument(format!(
                "invalid del_count {} for segment {}",
                del_count, self
            )));
        }
        self.del_count.store(del_count, AtomicOrdering::Release);
        Ok(())
    }

    /// Number of live documents once the committed deletes are applied.
    pub fn num_docs(&self) -> i32 {
        self.info.max_doc() - self.del_count()
    }

    pub fn del_gen(&self) -> i64 {
        self.del_gen.load(AtomicOrdering::Acquire)
    }

    pub fn next_write_del_gen(&self) -> i64 {
        self.next_write_del_gen.load(AtomicOrdering::Acquire)
    }

    pub fn set_next_write_del_gen(&self, gen: i64) {
        self.next_write_del_gen.store(gen, AtomicOrdering::Release)
    }

    /// Skips a generation whose file may be partially written.
    pub fn advance_next_write_del_gen(&self) {
        self.next_write_del_gen.fetch_add(1, AtomicOrdering::AcqRel);
    }

    /// Called once the live docs for `next_write_del_gen` are durable.
    pub fn advance_del_gen(&self) {
        let gen = self.next_write_del_gen();
        self.del_gen.store(gen, AtomicOrdering::Release);
        self.next_write_del_gen
            .store(gen + 1, AtomicOrdering::Release);
        self.size_in_bytes.store(-1, AtomicOrdering::Release);
    }

    pub fn size_in_bytes(&self) -> i64 {
        let mut size = self.size_in_bytes.load(AtomicOrdering::Acquire);
        if size == -1 {
            let mut sum = 0;
            for name in self.files() {
                match self.info.directory.file_length(&name) {
                    Ok(l) => sum += l,
                    Err(e) => warn!("get file '{}' length failed by '{:?}'", name, e),
                }
            }
            size = sum;
            self.size_in_bytes.store(size, AtomicOrdering::Release);
        }
        size
    }

    pub fn buffered_deletes_gen(&self) -> i64 {
        self.buffered_deletes_gen.load(AtomicOrdering::Acquire)
    }

    pub fn set_buffered_deletes_gen(&self, gen: i64) {
        self.buffered_deletes_gen.store(gen, AtomicOrdering::Release);
    }
}

impl Clone for SegmentCommitInfo {
    fn clone(&self) -> Self {
        let other = SegmentCommitInfo::new(Arc::clone(&self.info), self.del_count(), self.del_gen());
        // a failed live docs write may have left next_write_del_gen ahead
        other.set_next_write_del_gen(self.next_write_del_gen());
        other.set_buffered_deletes_gen(self.buffered_deletes_gen());
        other
    }
}

impl Hash for SegmentCommitInfo {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.info.name.hash(state);
    }
}

impl PartialEq for SegmentCommitInfo {
    fn eq(&self, other: &SegmentCommitInfo) -> bool {
        self.info.name == other.info.name
    }
}

impl Eq for SegmentCommitInfo {}

impl fmt::Display for SegmentCommitInfo {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.info)?;
        let del_count = self.del_count();
        if del_count != 0 {
            write!(f, "/{}", del_count)?;
        }
        if self.has_deletions() {
            write!(f, ":delGen={}", self.del_gen())?;
        }
        Ok(())
    }
}

impl fmt::Debug for SegmentCommitInfo {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self)
    }
}

#[derive(Serialize, Deserialize)]
struct SegmentEntry {
    name: String,
    id: String,
    codec: String,
    del_gen: i64,
    del_count: i32,
}

#[derive(Serialize, Deserialize)]
struct SegmentsData {
    version: i64,
    counter: i32,
    segments: Vec<SegmentEntry>,
    user_data: HashMap<String, String>,
}

/// A collection of segment infos with methods for operating on those segments
/// in relation to the file system.
///
/// The active segments in the index are stored in the segment info file,
/// `segments_N`. There may be one or more `segments_N` files in the index;
/// however, the one with the largest generation is the active one (when older
/// `segments_N` files are present it's because they temporarily cannot be
/// deleted, or a custom deletion policy is in use).
#[derive(Debug)]
pub struct SegmentInfos {
    /// Used to name new segments.
    pub counter: i32,
    /// Counts how often the index has been changed.
    pub version: i64,
    // generation of the "segments_N" for the next commit
    pub generation: i64,
    // generation of the "segments_N" file we last successfully read or wrote; this
    // is normally the same as generation except if a commit was interrupted
    pub last_generation: i64,
    pub segments: Vec<Arc<SegmentCommitInfo>>,
    pub user_data: HashMap<String, String>,
    // true after prepare_commit and before finish_commit or rollback_commit
    pending_commit: bool,
}

impl Default for SegmentInfos {
    fn default() -> Self {
        SegmentInfos {
            counter: 0,
            version: 0,
            generation: 0,
            last_generation: 0,
            segments: vec![],
            user_data: HashMap::new(),
            pending_commit: false,
        }
    }
}

/// Deep copy: every `SegmentCommitInfo` is cloned so later delete generation
/// changes on the writer's instance do not leak into a commit in progress.
impl Clone for SegmentInfos {
    fn clone(&self) -> Self {
        SegmentInfos {
            counter: self.counter,
            version: self.version,
            generation: self.generation,
            last_generation: self.last_generation,
            segments: self.create_backup_segment_infos(),
            user_data: self.user_data.clone(),
            pending_commit: false,
        }
    }
}

#[allow(clippy::len_without_is_empty)]
impl SegmentInfos {
    fn next_pending_generation(&self) -> u64 {
        if self.generation == -1 {
            1
        } else {
            self.generation as u64 + 1
        }
    }

    /// Get the segments_N filename in use by this segment infos.
    pub fn segment_file_name(&self) -> Option<String> {
        if self.last_generation <= 0 {
            None
        } else {
            Some(file_name_from_generation(
                INDEX_FILE_SEGMENTS,
                "",
                self.last_generation as u64,
            ))
        }
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn update_generation(&mut self, other: &SegmentInfos) {
        self.last_generation = other.last_generation;
        self.generation = other.generation;
    }

    /// Returns a fresh segment name and advances the counter.
    pub fn new_segment_name(&mut self) -> String {
        let name = format!("_{}", to_base36(self.counter as u64));
        self.counter += 1;
        self.changed();
        name
    }

    pub fn rollback_commit(&mut self, dir: &dyn Directory) {
        if self.pending_commit {
            self.pending_commit = false;
            // generation was advanced by prepare_commit, last_generation was not
            let pending =
                file_name_from_generation(INDEX_FILE_PENDING_SEGMENTS, "", self.generation as u64);
            if let Err(e) = dir.delete_file(&pending) {
                warn!(
                    "SegmentInfos: rollback_commit delete file '{}' failed by '{:?}'",
                    &pending, e
                );
            }
        }
    }

    /// Writes the new segments file as `pending_segments_N`, invisible to
    /// readers. It must be followed by `finish_commit` or `rollback_commit`.
    pub fn prepare_commit(&mut self, dir: &dyn Directory) -> Result<()> {
        if self.pending_commit {
            bail!(IllegalState("prepare_commit was already called".into()));
        }
        let next_generation = self.next_pending_generation();
        let pending = file_name_from_generation(INDEX_FILE_PENDING_SEGMENTS, "", next_generation);
        // always advance the generation on write
        self.generation = next_generation as i64;

        let res = self.write_payload().and_then(|payload| {
            write_index_file(
                dir,
                &pending,
                SEGMENTS_CODEC,
                SEGMENT_VERSION_CURRENT,
                &payload,
                &IOContext::Default,
            )?;
            let mut sync_files = HashSet::with_capacity(1);
            sync_files.insert(pending.clone());
            dir.sync(&sync_files)
        });
        match res {
            Ok(()) => {
                self.pending_commit = true;
                Ok(())
            }
            Err(e) => {
                if let Err(err) = dir.delete_file(&pending) {
                    debug!("delete file '{}' failed by: '{:?}'", &pending, err);
                }
                Err(e)
            }
        }
    }

    fn write_payload(&self) -> Result<Vec<u8>> {
        let mut segments = Vec::with_capacity(self.segments.len());
        for commit in &self.segments {
            let del_count = commit.del_count();
            if del_count < 0 || del_count > commit.info.max_doc() {
                bail!(IllegalState(format!(
                    "cannot write segment {}: invalid del_count {}",
                    commit.info.name, del_count
                )));
            }
            segments.push(SegmentEntry {
                name: commit.info.name.clone(),
                id: id2str(&commit.info.id),
                codec: commit.info.codec.name().to_string(),
                del_gen: commit.del_gen(),
                del_count,
            });
        }
        let data = SegmentsData {
            version: self.version,
            counter: self.counter,
            segments,
            user_data: self.user_data.clone(),
        };
        Ok(serde_json::to_vec(&data)?)
    }

    /// Renames `pending_segments_N` to `segments_N`, returning the committed name.
    pub fn finish_commit(&mut self, dir: &dyn Directory) -> Result<String> {
        if !self.pending_commit {
            bail!(IllegalState("prepare_commit was not called".into()));
        }

        let src =
            file_name_from_generation(INDEX_FILE_PENDING_SEGMENTS, "", self.generation as u64);
        let dest = file_name_from_generation(INDEX_FILE_SEGMENTS, "", self.generation as u64);

        if let Err(e) = dir.rename(&src, &dest).and_then(|_| dir.sync_meta_data()) {
            self.rollback_commit(dir);
            return Err(e);
        }

        self.pending_commit = false;
        self.last_generation = self.generation;
        Ok(dest)
    }

    /// Returns all file names referenced by the segments, and optionally the
    /// segments_N file itself. Recomputed on each invocation.
    pub fn files(&self, include_segments_file: bool) -> HashSet<String> {
        let mut files = HashSet::new();
        if include_segments_file {
            if let Some(segment_file_name) = self.segment_file_name() {
                files.insert(segment_file_name);
            }
        }
        for info in &self.segments {
            files.extend(info.files());
        }
        files
    }

    pub fn total_max_doc(&self) -> i64 {
        self.segments.iter().map(|s| s.info.max_doc() as i64).sum()
    }

    pub fn total_num_docs(&self) -> i64 {
        self.segments.iter().map(|s| s.num_docs() as i64).sum()
    }

    pub fn create_backup_segment_infos(&self) -> Vec<Arc<SegmentCommitInfo>> {
        self.segments
            .iter()
            .map(|s| Arc::new(s.as_ref().clone()))
            .collect()
    }

    pub fn rollback_segment_infos(&mut self, infos: Vec<Arc<SegmentCommitInfo>>) {
        self.segments = infos;
    }

    pub fn add(&mut self, si: Arc<SegmentCommitInfo>) {
        self.segments.push(si);
    }

    pub fn clear(&mut self) {
        self.segments.clear();
    }

    pub fn remove(&mut self, si: &SegmentCommitInfo) {
        self.segments.retain(|s| s.info.name != si.info.name);
    }

    pub fn contains(&self, si: &SegmentCommitInfo) -> bool {
        self.segments.iter().any(|s| s.info.name == si.info.name)
    }

    pub fn index_of(&self, si: &SegmentCommitInfo) -> Option<usize> {
        self.segments
            .iter()
            .position(|s| s.info.name == si.info.name)
    }

    pub fn changed(&mut self) {
        self.version += 1;
    }

    /// Replaces `merged_away` with `merged`, at the position of the first
    /// merged-away segment, or removes them all if `drop_segment`.
    pub fn apply_merge_changes(
        &mut self,
        merged_away: &[Arc<SegmentCommitInfo>],
        merged: &Arc<SegmentCommitInfo>,
        drop_segment: bool,
    ) {
        let merged_names: HashSet<&str> = merged_away.iter().map(|s| s.name()).collect();
        let mut inserted = false;
        let mut result = Vec::with_capacity(self.segments.len());
        for seg in self.segments.drain(..) {
            if merged_names.contains(seg.name()) {
                if !inserted && !drop_segment {
                    result.push(Arc::clone(merged));
                    inserted = true;
                }
            } else {
                result.push(seg);
            }
        }
        // every input was removed concurrently, so the merged segment must be fully
        // deleted too; keep it at the front unless it is being dropped
        if !inserted && !drop_segment {
            result.insert(0, Arc::clone(merged));
        }
        self.segments = result;
    }

    /// Reads a particular segments_N file.
    pub fn read_commit(
        directory: &Arc<dyn Directory>,
        codec: &Arc<dyn Codec>,
        segment_file_name: &str,
    ) -> Result<SegmentInfos> {
        let generation = generation_from_segments_file_name(segment_file_name)?;
        let payload = read_index_file(
            directory.as_ref(),
            segment_file_name,
            SEGMENTS_CODEC,
            SEGMENT_VERSION_START,
            SEGMENT_VERSION_CURRENT,
            &IOContext::READ,
        )?;
        let data: SegmentsData = serde_json::from_slice(&payload)?;

        let mut infos = SegmentInfos {
            counter: data.counter,
            version: data.version,
            generation,
            last_generation: generation,
            segments: Vec::with_capacity(data.segments.len()),
            user_data: data.user_data,
            pending_commit: false,
        };
        for entry in data.segments {
            if entry.codec != codec.name() {
                bail!(CorruptIndex(format!(
                    "segment {} was written by unknown codec {}",
                    entry.name, entry.codec
                )));
            }
            let id = str2id(&entry.id)?;
            let info = codec.segment_info_format().read(
                directory,
                &entry.name,
                &id,
                codec,
                &IOContext::READ,
            )?;
            if entry.del_count < 0 || entry.del_count > info.max_doc() {
                bail!(CorruptIndex(format!(
                    "invalid deletion count: {} vs max_doc={} for segment {}",
                    entry.del_count,
                    info.max_doc(),
                    entry.name
                )));
            }
            let commit = SegmentCommitInfo::new(Arc::new(info), entry.del_count, entry.del_gen);
            infos.segments.push(Arc::new(commit));
        }
        Ok(infos)
    }

    /// Finds the most recent segments_N file and reads it, retrying once with
    /// a fresh listing if a concurrent commit replaced it meanwhile.
    pub fn read_latest_commit(
        directory: &Arc<dyn Directory>,
        codec: &Arc<dyn Codec>,
    ) -> Result<SegmentInfos> {
        let mut last_gen = -1;
        loop {
            let files = directory.list_all()?;
            let gen = get_last_commit_generation(&files);
            if gen == -1 {
                return Err(io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("no segments* file found in {}: files: {:?}", directory, files),
                )
                .into());
            }
            let name = file_name_from_generation(INDEX_FILE_SEGMENTS, "", gen as u64);
            match SegmentInfos::read_commit(directory, codec, &name) {
                Ok(infos) => return Ok(infos),
                Err(e) => {
                    if gen <= last_gen {
                        return Err(e);
                    }
                    debug!("reading {} failed by '{:?}', retrying", name, e);
                    last_gen = gen;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::codec::DefaultCodec;
    use crate::core::store::RAMDirectory;
    use crate::core::util::random_id;

    fn new_info(dir: &Arc<dyn Directory>, codec: &Arc<dyn Codec>, name: &str) -> Result<SegmentInfo> {
        let info = SegmentInfo::new(
            name,
            10,
            Arc::clone(dir),
            false,
            Arc::clone(codec),
            HashMap::new(),
            random_id(),
        );
        let mut files = HashSet::new();
        files.insert(format!("{}.pst", name));
        info.set_files(&files)?;
        codec
            .segment_info_format()
            .write(dir.as_ref(), &info, &IOContext::Default)?;
        Ok(info)
    }

    #[test]
    fn test_two_phase_commit_then_read() -> Result<()> {
        let dir: Arc<dyn Directory> = Arc::new(RAMDirectory::new());
        let codec = DefaultCodec::shared();
        let mut infos = SegmentInfos::default();
        let name = infos.new_segment_name();
        assert_eq!(name, "_0");
        let info = new_info(&dir, &codec, &name)?;
        let commit = SegmentCommitInfo::new(Arc::new(info), 3, -1);
        infos.add(Arc::new(commit));

        infos.prepare_commit(dir.as_ref())?;
        assert!(infos.prepare_commit(dir.as_ref()).is_err());
        assert_eq!(dir.list_all()?.iter().filter(|f| f.starts_with("pending_")).count(), 1);
        // not visible yet
        assert!(SegmentInfos::read_latest_commit(&dir, &codec).is_err());

        let committed = infos.finish_commit(dir.as_ref())?;
        assert_eq!(committed, "segments_1");
        assert_eq!(infos.segment_file_name(), Some(committed));

        let read = SegmentInfos::read_latest_commit(&dir, &codec)?;
        assert_eq!(read.generation, 1);
        assert_eq!(read.counter, 1);
        assert_eq!(read.len(), 1);
        assert_eq!(read.segments[0].del_count(), 3);
        assert_eq!(read.segments[0].info.max_doc(), 10);
        assert!(read.files(true).contains("segments_1"));
        assert!(read.files(true).contains("_0.pst"));
        Ok(())
    }

    #[test]
    fn test_rollback_commit_removes_pending_file() -> Result<()> {
        let dir: Arc<dyn Directory> = Arc::new(RAMDirectory::new());
        let mut infos = SegmentInfos::default();
        infos.prepare_commit(dir.as_ref())?;
        infos.rollback_commit(dir.as_ref());
        assert!(dir.list_all()?.is_empty());
        assert!(infos.finish_commit(dir.as_ref()).is_err());
        Ok(())
    }

    #[test]
    fn test_apply_merge_changes() -> Result<()> {
        let dir: Arc<dyn Directory> = Arc::new(RAMDirectory::new());
        let codec = DefaultCodec::shared();
        let mut infos = SegmentInfos::default();
        let mut all = vec![];
        for _ in 0..4 {
            let name = infos.new_segment_name();
            let seg = Arc::new(SegmentCommitInfo::new(
                Arc::new(new_info(&dir, &codec, &name)?),
                0,
                -1,
            ));
            all.push(Arc::clone(&seg));
            infos.add(seg);
        }
        let merged = Arc::new(SegmentCommitInfo::new(
            Arc::new(new_info(&dir, &codec, "_9")?),
            0,
            -1,
        ));
        infos.apply_merge_changes(&[Arc::clone(&all[1]), Arc::clone(&all[2])], &merged, false);
        let names: Vec<&str> = infos.segments.iter().map(|s| s.name()).collect();
        assert_eq!(names, vec!["_0", "_9", "_3"]);

        infos.apply_merge_changes(&[Arc::clone(&all[0])], &merged, true);
        let names: Vec<&str> = infos.segments.iter().map(|s| s.name()).collect();
        assert_eq!(names, vec!["_9", "_3"]);
        Ok(())
    }

    #[test]
    fn test_del_gen_advance() {
        let dir: Arc<dyn Directory> = Arc::new(RAMDirectory::new());
        let info = SegmentInfo::new(
            "_0",
            -1,
            dir,
            false,
            DefaultCodec::shared(),
            HashMap::new(),
            random_id(),
        );
        assert!(info.set_max_doc(5).is_ok());
        assert!(info.set_max_doc(6).is_err());
        let commit = SegmentCommitInfo::new(Arc::new(info), 0, -1);
        assert!(!commit.has_deletions());
        assert_eq!(commit.next_write_del_gen(), 1);
        commit.advance_del_gen();
        assert_eq!(commit.del_gen(), 1);
        assert_eq!(commit.next_write_del_gen(), 2);
        assert!(commit.set_del_count(6).is_err());

        let clone = commit.clone();
        commit.advance_del_gen();
        assert_eq!(clone.del_gen(), 1);
        assert_eq!(commit.del_gen(), 2);
    }
}
