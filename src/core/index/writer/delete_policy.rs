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

use crate::core::codec::segment_infos::SegmentInfos;
use crate::error::Result;

use std::collections::{HashMap, HashSet};
use std::fmt;

/// A point-in-time commit of the index: one `segments_N` file and every
/// file it references. Commits are handed to the `IndexDeletionPolicy`,
/// which may mark them deleted.
#[derive(Clone)]
pub struct CommitPoint {
    files: HashSet<String>,
    segments_file_name: String,
    generation: i64,
    segment_count: usize,
    user_data: HashMap<String, String>,
    deleted: bool,
}

impl CommitPoint {
    /// Captures `segment_infos`, which must have been committed.
    pub fn new(segment_infos: &SegmentInfos) -> Result<CommitPoint> {
        let segments_file_name = match segment_infos.segment_file_name() {
            Some(name) => name,
            None => bail!("segment infos of a commit point has no segments file"),
        };
        Ok(CommitPoint {
            files: segment_infos.files(true),
            segments_file_name,
            generation: segment_infos.generation,
            segment_count: segment_infos.len(),
            user_data: segment_infos.user_data.clone(),
            deleted: false,
        })
    }

    pub fn segments_file_name(&self) -> &str {
        &self.segments_file_name
    }

    /// All index files referenced by this commit, the segments file included.
    pub fn file_names(&self) -> &HashSet<String> {
        &self.files
    }

    pub fn generation(&self) -> i64 {
        self.generation
    }

    pub fn segment_count(&self) -> usize {
        self.segment_count
    }

    pub fn user_data(&self) -> &HashMap<String, String> {
        &self.user_data
    }

    /// Marks this commit for deletion. Its files are removed once no other
    /// commit and no checkpoint of the writer references them.
    pub fn delete(&mut self) {
        self.deleted = true;
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted
    }
}

impl fmt::Debug for CommitPoint {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "CommitPoint({}, deleted={})",
            self.segments_file_name, self.deleted
        )
    }
}

/// Expert: policy for deletion of stale commits.
///
/// Implement this interface, and pass it through `IndexWriterConfig`, to
/// customize when older point-in-time commits are deleted from the index
/// directory. The default deletion policy is
/// `KeepOnlyLastCommitDeletionPolicy`, which always removes old commits as
/// soon as a new commit is done.
///
/// A policy that keeps older commits around gives readers of those commits
/// time to move on, at the price of more disk space.
pub trait IndexDeletionPolicy: Send + Sync {
    /// This is called once when a writer is first instantiated to give the
    /// policy a chance to remove old commit points.
    ///
    /// `commits` is sorted by age, the 0th one is the oldest commit. The
    /// last one is the most recent one, be careful not to delete it unless
    /// you can afford to lose the index content. For a new index this is
    /// invoked with an empty slice.
    fn on_init(&self, commits: &mut [CommitPoint]) -> Result<()>;

    /// This is called each time the writer completed a commit. This gives
    /// the policy a chance to remove old commit points with each commit.
    ///
    /// Not called at all if the writer is rolled back.
    fn on_commit(&self, commits: &mut [CommitPoint]) -> Result<()>;
}

/// This `IndexDeletionPolicy` implementation that keeps only the most
/// recent commit and immediately removes all prior commits after a new
/// commit is done.
#[derive(Debug, Default)]
pub struct KeepOnlyLastCommitDeletionPolicy;

impl IndexDeletionPolicy for KeepOnlyLastCommitDeletionPolicy {
    /// Deletes all commits except the most recent one.
    fn on_init(&self, commits: &mut [CommitPoint]) -> Result<()> {
        // Note that commits.len() should normally be 1:
        self.on_commit(commits)
    }

    /// Deletes all commits except the most recent one.
    fn on_commit(&self, commits: &mut [CommitPoint]) -> Result<()> {
        // Note that commits.len() should normally be 2 (if not called by
        // on_init above):
        if let Some((_, older)) = commits.split_last_mut() {
            for commit in older {
                commit.delete();
            }
        }
        Ok(())
    }
}

/// An `IndexDeletionPolicy` which keeps all index commits around, never
/// deleting them.
#[derive(Debug, Default)]
pub struct NoDeletionPolicy;

impl IndexDeletionPolicy for NoDeletionPolicy {
    fn on_init(&self, _commits: &mut [CommitPoint]) -> Result<()> {
        Ok(())
    }

    fn on_commit(&self, _commits: &mut [CommitPoint]) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn commit(gen: i64) -> CommitPoint {
        CommitPoint {
            files: HashSet::new(),
            segments_file_name: format!("segments_{}", gen),
            generation: gen,
            segment_count: 0,
            user_data: HashMap::new(),
            deleted: false,
        }
    }

    #[test]
    fn test_keep_only_last_commit() -> Result<()> {
        let mut commits = vec![commit(1), commit(2), commit(3)];
        KeepOnlyLastCommitDeletionPolicy.on_commit(&mut commits)?;
        let deleted: Vec<_> = commits.iter().map(|c| c.is_deleted()).collect();
        assert_eq!(deleted, vec![true, true, false]);

        let mut empty: Vec<CommitPoint> = vec![];
        KeepOnlyLastCommitDeletionPolicy.on_init(&mut empty)?;
        Ok(())
    }

    #[test]
    fn test_no_deletion_keeps_everything() -> Result<()> {
        let mut commits = vec![commit(1), commit(2)];
        NoDeletionPolicy.on_init(&mut commits)?;
        NoDeletionPolicy.on_commit(&mut commits)?;
        assert!(commits.iter().all(|c| !c.is_deleted()));
        Ok(())
    }
}
