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
use crate::core::index::merge::MergeRateLimiter;
use crate::core::index::reader::SegmentReader;
use crate::core::store::MergeInfo;
use crate::core::util::FixedBitSet;
use crate::error::{
    ErrorKind::{IllegalArgument, IllegalState},
    Result,
};

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::f64;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

pub const DEFAULT_NO_CFS_RATIO: f64 = 0.1;

pub const DEFAULT_MAX_CFS_SEGMENT_SIZE: u64 = i64::max_value() as u64;

/// Merge is passed to `MergePolicy#find_merges` to indicate the
/// event that triggered the merge.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum MergeTrigger {
    /// Merge was triggered by a segment flush.
    SegmentFlush,
    /// Merge was triggered by a full flush. Full flushes can be caused
    /// by a commit, NRT reader reopen or a close call on the IndexWriter.
    FullFlush,
    /// Merge has been triggered explicitly by the user.
    Explicit,
    /// Merge was triggered by a successfully finished merge.
    MergeFinished,
    /// Merge was triggered by a closing IndexWriter.
    Closing,
}

/// What a merge policy may ask the writer while it selects merges. The
/// writer answers under its own lock, so the view is consistent for the
/// whole call.
pub trait MergeContext {
    /// Deleted docs of the segment, including deletes not yet written.
    fn num_deleted_docs(&self, info: &SegmentCommitInfo) -> i32;

    /// Names of the segments registered with a running or pending merge.
    fn merging_segments(&self) -> &HashSet<String>;

    fn next_merge_id(&self) -> u32;
}

/// Expert: a MergePolicy determines the sequence of
/// primitive merge operations.
///
/// Whenever the segments in an index have been altered by `IndexWriter`,
/// either the addition of a newly flushed segment or a previous merge that
/// may now need to cascade, `IndexWriter` invokes `find_merges` to give the
/// MergePolicy a chance to pick merges that are now required. When
/// `IndexWriter::force_merge` is called, it calls `find_forced_merges`
/// and the MergePolicy should then return the necessary merges.
///
/// Note that the policy can return more than one merge at a time. In this
/// case, if the writer is using `SerialMergeScheduler`, the merges will be
/// run sequentially but if it is using `ConcurrentMergeScheduler` they
/// will be run concurrently.
///
/// The default MergePolicy is `TieredMergePolicy`.
pub trait MergePolicy: Send + Sync + fmt::Debug {
    /// Determine what set of merge operations are now necessary on the index.
    /// `IndexWriter` calls this whenever there is a change to the segments,
    /// always under its lock.
    fn find_merges(
        &self,
        merge_trigger: MergeTrigger,
        segment_infos: &SegmentInfos,
        ctx: &dyn MergeContext,
    ) -> Result<Option<MergeSpecification>>;

    /// Determine what set of merge operations is necessary in order to merge
    /// to `<=` the specified segment count. `segments_to_merge` holds the
    /// segments the force merge started with (`true`) and the segments
    /// produced by its merges so far (`false`).
    fn find_forced_merges(
        &self,
        segment_infos: &SegmentInfos,
        max_segment_count: u32,
        segments_to_merge: &HashMap<Arc<SegmentCommitInfo>, bool>,
        ctx: &dyn MergeContext,
    ) -> Result<Option<MergeSpecification>>;

    /// Determine what set of merge operations is necessary in order to expunge
    /// all deletes from the index.
    fn find_forced_deletes_merges(
        &self,
        segment_infos: &SegmentInfos,
        ctx: &dyn MergeContext,
    ) -> Result<Option<MergeSpecification>>;

    fn max_cfs_segment_size(&self) -> u64;

    fn no_cfs_ratio(&self) -> f64;

    /// Returns true if a new segment (regardless of its origin) should use the
    /// compound file format. The default implementation returns `true` iff the
    /// size of the given merged info is less or equal to `max_cfs_segment_size`
    /// and the size is less or equal to the total index size times
    /// `no_cfs_ratio`, otherwise `false`.
    fn use_compound_file(
        &self,
        infos: &SegmentInfos,
        merged_info: &SegmentCommitInfo,
        ctx: &dyn MergeContext,
    ) -> bool {
        let no_cfs_ratio = self.no_cfs_ratio();
        if no_cfs_ratio <= 0.0 {
            return false;
        }
        let merged_info_size = self.size(merged_info, ctx);
        if merged_info_size > self.max_cfs_segment_size() as i64 {
            return false;
        }
        if no_cfs_ratio >= 1.0 {
            return true;
        }
        let total_size: i64 = infos.segments.iter().map(|info| self.size(info, ctx)).sum();
        merged_info_size as f64 <= no_cfs_ratio * total_size as f64
    }

    /// Byte size of the segment, pro-rated by its percentage of deletes.
    fn size(&self, info: &SegmentCommitInfo, ctx: &dyn MergeContext) -> i64 {
        let byte_size = info.size_in_bytes();
        let max_doc = info.info.max_doc();
        if max_doc <= 0 {
            return byte_size;
        }
        let del_ratio = ctx.num_deleted_docs(info) as f64 / max_doc as f64;
        (byte_size as f64 * (1.0 - del_ratio)) as i64
    }

    /// Returns true if this single info is already fully merged: it has no
    /// pending deletes and matches the current compound file setting.
    fn is_merged(
        &self,
        infos: &SegmentInfos,
        info: &SegmentCommitInfo,
        ctx: &dyn MergeContext,
    ) -> bool {
        ctx.num_deleted_docs(info) == 0
            && self.use_compound_file(infos, info, ctx) == info.info.is_compound_file()
    }
}

/// A MergeSpecification instance provides the information
/// necessary to perform multiple merges.  It simply
/// contains a list of `OneMerge` instances.
#[derive(Default)]
pub struct MergeSpecification {
    pub merges: Vec<OneMerge>,
}

impl MergeSpecification {
    pub fn add(&mut self, merge: OneMerge) {
        self.merges.push(merge);
    }

    fn into_option(self) -> Option<MergeSpecification> {
        if self.merges.is_empty() {
            None
        } else {
            Some(self)
        }
    }
}

impl fmt::Display for MergeSpecification {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "MergeSpec:")?;
        for (i, merge) in self.merges.iter().enumerate() {
            write!(f, "\n  {}: {}", i + 1, merge)?;
        }
        Ok(())
    }
}

/// OneMerge provides the information necessary to perform
/// an individual primitive merge operation, resulting in
/// a single new segment.  The merge spec includes the
/// subset of segments to be merged.
///
/// A OneMerge is owned by whoever holds it: the writer's pending queue,
/// then the thread executing it. The writer and the scheduler keep a
/// `OneMergeRunningInfo` to watch or abort it meanwhile.
pub struct OneMerge {
    pub id: u32,
    /// segments to be merged
    pub segments: Vec<Arc<SegmentCommitInfo>>,
    /// The merged segment, once the merge was initialized.
    pub info: Option<Arc<SegmentCommitInfo>>,
    pub register_done: bool,
    pub merge_gen: u64,
    /// Set by force merge, the number of segments it merges down to.
    pub max_num_segments: Option<u32>,
    /// Estimated size in bytes of the merged segment.
    pub estimated_merge_bytes: u64,
    /// Sum of the byte sizes of all inputs, set when the merge is registered.
    pub total_merge_bytes: u64,
    /// Total number of documents in segments to be merged, not accounting for deletions.
    pub total_max_doc: u32,
    /// a private `RateLimiter` for this merge, used to rate limit writes and abort.
    pub rate_limiter: Arc<MergeRateLimiter>,
    /// Readers opened by the merge, one per input.
    pub readers: Vec<Arc<SegmentReader>>,
    /// The live docs of each input as of the moment its reader was opened.
    pub live_docs_at_start: Vec<Option<Arc<FixedBitSet>>>,
    pub merge_start_time: Option<Instant>,
}

impl OneMerge {
    pub fn new(segments: Vec<Arc<SegmentCommitInfo>>, id: u32) -> Result<Self> {
        if segments.is_empty() {
            bail!(IllegalArgument("segments must not be empty".into()));
        }
        let total_max_doc: i32 = segments.iter().map(|s| s.info.max_doc()).sum();
        Ok(OneMerge {
            id,
            segments,
            info: None,
            register_done: false,
            merge_gen: 0,
            max_num_segments: None,
            estimated_merge_bytes: 0,
            total_merge_bytes: 0,
            total_max_doc: total_max_doc as u32,
            rate_limiter: Arc::new(MergeRateLimiter::new()),
            readers: vec![],
            live_docs_at_start: vec![],
            merge_start_time: None,
        })
    }

    pub fn running_info(&self) -> OneMergeRunningInfo {
        OneMergeRunningInfo {
            id: self.id,
            segments: self.segments.iter().map(|s| s.name().to_string()).collect(),
            max_num_segments: self.max_num_segments,
            estimated_merge_bytes: self.estimated_merge_bytes,
            total_max_doc: self.total_max_doc,
            rate_limiter: Arc::clone(&self.rate_limiter),
        }
    }

    pub fn store_merge_info(&self) -> MergeInfo {
        MergeInfo::new(
            self.total_max_doc,
            self.estimated_merge_bytes,
            false,
            self.max_num_segments,
        )
    }

    pub fn is_aborted(&self) -> bool {
        self.rate_limiter.aborted()
    }

    pub fn check_aborted(&self) -> Result<()> {
        self.rate_limiter.check_abort()
    }

    /// Live docs of the merged segment's inputs, summed.
    pub fn total_num_docs(&self) -> Result<i32> {
        if self.readers.len() != self.segments.len() {
            bail!(IllegalState(format!(
                "merge {} has {} readers for {} segments",
                self.id,
                self.readers.len(),
                self.segments.len()
            )));
        }
        Ok(self.readers.iter().map(|r| r.num_docs()).sum())
    }

    pub fn seg_string(&self) -> String {
        let names: Vec<String> = self.segments.iter().map(|s| s.to_string()).collect();
        names.join(" ")
    }
}

impl fmt::Display for OneMerge {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.seg_string())?;
        if let Some(ref info) = self.info {
            write!(f, " into {}", info.name())?;
        }
        if let Some(max) = self.max_num_segments {
            write!(f, " [max_num_segments={}]", max)?;
        }
        if self.is_aborted() {
            write!(f, " [ABORTED]")?;
        }
        Ok(())
    }
}

/// What the writer and the merge scheduler track of a merge that is owned
/// by someone else.
#[derive(Clone)]
pub struct OneMergeRunningInfo {
    pub id: u32,
    pub segments: Vec<String>,
    pub max_num_segments: Option<u32>,
    pub estimated_merge_bytes: u64,
    pub total_max_doc: u32,
    pub rate_limiter: Arc<MergeRateLimiter>,
}

impl OneMergeRunningInfo {
    pub fn is_forced(&self) -> bool {
        self.max_num_segments.is_some()
    }
}

/// Merges segments of approximately equal size, subject to
/// an allowed number of segments per tier. This merge
/// policy is able to merge non-adjacent segments, and
/// separates how many segments are merged at once
/// (`set_max_merge_at_once`) from how many segments are allowed
/// per tier (`set_segments_per_tier`).  This merge
/// policy also does not over-merge (i.e. cascade merges).
///
/// For normal merging, this policy first computes a
/// "budget" of how many segments are allowed to be in the
/// index.  If the index is over-budget, then the policy
/// sorts segments by decreasing size (pro-rating by percent
/// deletes), and then finds the least-cost merge.  Merge
/// cost is measured by a combination of the "skew" of the
/// merge (size of largest segment divided by smallest segment),
/// total merge size and percent deletes reclaimed,
/// so that merges with lower skew, smaller size
/// and those reclaiming more deletes, are favored.
///
/// If a merge will produce a segment that's larger than
/// `set_max_merged_segment_mb`, then the policy will
/// merge fewer segments (down to 1 at once, if that one has
/// deletions) to keep the segment size under budget.
///
/// NOTE: This policy always merges by byte size
/// of the segments, always pro-rates by percent deletes,
/// and does not apply any maximum segment size during
/// force merge.
#[derive(Debug, Clone)]
pub struct TieredMergePolicy {
    no_cfs_ratio: f64,
    max_cfs_segment_size: u64,
    max_merge_at_once: u32,
    max_merged_segment_bytes: u64,
    max_merge_at_once_explicit: u32,
    floor_segment_bytes: u64,
    segs_per_tier: f64,
    force_merge_deletes_pct_allowed: f64,
    reclaim_deletes_weight: f64,
}

impl Default for TieredMergePolicy {
    fn default() -> Self {
        TieredMergePolicy {
            no_cfs_ratio: DEFAULT_NO_CFS_RATIO,
            max_cfs_segment_size: DEFAULT_MAX_CFS_SEGMENT_SIZE,
            max_merge_at_once: 10,
            max_merged_segment_bytes: 5 * 1024 * 1024 * 1024,
            max_merge_at_once_explicit: 30,
            floor_segment_bytes: 2 * 1024 * 1024,
            segs_per_tier: 10.0,
            force_merge_deletes_pct_allowed: 10.0,
            reclaim_deletes_weight: 2.0,
        }
    }
}

fn mb_to_bytes_clamped(mb: f64) -> u64 {
    let bytes = mb * 1024.0 * 1024.0;
    if bytes > i64::max_value() as f64 {
        i64::max_value() as u64
    } else {
        bytes as u64
    }
}

impl TieredMergePolicy {
    /// Maximum number of segments to be merged at a time during "normal"
    /// merging. Default is 10.
    pub fn set_max_merge_at_once(&mut self, v: u32) -> Result<()> {
        if v < 2 {
            bail!(IllegalArgument(format!(
                "max_merge_at_once must be > 1, got {}",
                v
            )));
        }
        self.max_merge_at_once = v;
        Ok(())
    }

    /// Maximum number of segments to be merged at a time, during force merge
    /// or force merge deletes. Default is 30.
    pub fn set_max_merge_at_once_explicit(&mut self, v: u32) -> Result<()> {
        if v < 2 {
            bail!(IllegalArgument(format!(
                "max_merge_at_once_explicit must be > 1, got {}",
                v
            )));
        }
        self.max_merge_at_once_explicit = v;
        Ok(())
    }

    /// Sets the allowed number of segments per tier. Smaller values mean more
    /// merging but fewer segments. Default is 10.0.
    pub fn set_segments_per_tier(&mut self, v: f64) -> Result<()> {
        if !(v >= 2.0) {
            bail!(IllegalArgument(format!(
                "segments_per_tier must be >= 2.0, got {}",
                v
            )));
        }
        self.segs_per_tier = v;
        Ok(())
    }

    /// Maximum sized segment to produce during normal merging. Default is 5 GB.
    pub fn set_max_merged_segment_mb(&mut self, v: f64) -> Result<()> {
        if !(v >= 0.0) {
            bail!(IllegalArgument(format!(
                "max_merged_segment_mb must be >= 0, got {}",
                v
            )));
        }
        self.max_merged_segment_bytes = mb_to_bytes_clamped(v);
        Ok(())
    }

    /// Segments smaller than this are "rounded up" to this size, ie treated as
    /// equal (floor) size for merge selection. Default is 2 MB.
    pub fn set_floor_segment_mb(&mut self, v: f64) -> Result<()> {
        if !(v > 0.0) {
            bail!(IllegalArgument(format!(
                "floor_segment_mb must be > 0.0, got {}",
                v
            )));
        }
        self.floor_segment_bytes = mb_to_bytes_clamped(v);
        Ok(())
    }

    /// Controls how aggressively merges that reclaim more deletions are
    /// favored. 0.0 means deletions don't impact merge selection.
    pub fn set_reclaim_deletes_weight(&mut self, v: f64) -> Result<()> {
        if !(v >= 0.0) {
            bail!(IllegalArgument(format!(
                "reclaim_deletes_weight must be >= 0.0, got {}",
                v
            )));
        }
        self.reclaim_deletes_weight = v;
        Ok(())
    }

    /// When force merging deletes, only segments whose percentage of deletes
    /// exceeds this threshold are merged. Default is 10.0.
    pub fn set_force_merge_deletes_pct_allowed(&mut self, v: f64) -> Result<()> {
        if !(v >= 0.0 && v <= 100.0) {
            bail!(IllegalArgument(format!(
                "force_merge_deletes_pct_allowed must be between 0.0 and 100.0, got {}",
                v
            )));
        }
        self.force_merge_deletes_pct_allowed = v;
        Ok(())
    }

    pub fn set_no_cfs_ratio(&mut self, v: f64) -> Result<()> {
        if !(v >= 0.0 && v <= 1.0) {
            bail!(IllegalArgument(format!(
                "no_cfs_ratio must be 0.0 to 1.0 inclusive, got {}",
                v
            )));
        }
        self.no_cfs_ratio = v;
        Ok(())
    }

    pub fn set_max_cfs_segment_size_mb(&mut self, v: f64) -> Result<()> {
        if !(v >= 0.0) {
            bail!(IllegalArgument(format!(
                "max_cfs_segment_size_mb must be >= 0, got {}",
                v
            )));
        }
        self.max_cfs_segment_size = mb_to_bytes_clamped(v);
        Ok(())
    }

    fn floor_size(&self, bytes: i64) -> i64 {
        bytes.max(self.floor_segment_bytes as i64)
    }

    fn sorted_by_size_desc<'a>(
        &self,
        infos: &'a [Arc<SegmentCommitInfo>],
        ctx: &dyn MergeContext,
    ) -> Vec<(&'a Arc<SegmentCommitInfo>, i64)> {
        let mut sorted: Vec<_> = infos.iter().map(|info| (info, self.size(info, ctx))).collect();
        sorted.sort_by(|(i1, s1), (i2, s2)| compare_size_desc(i1, *s1, i2, *s2));
        sorted
    }

    /// Scores one merge candidate; lower scores are better.
    fn score(
        &self,
        candidate: &[(&Arc<SegmentCommitInfo>, i64)],
        hit_too_large: bool,
    ) -> MergeScore {
        let mut total_before_merge_bytes = 0;
        let mut total_after_merge_bytes = 0;
        let mut total_after_merge_bytes_floored = 0;
        for (info, seg_bytes) in candidate {
            total_after_merge_bytes += *seg_bytes;
            total_after_merge_bytes_floored += self.floor_size(*seg_bytes);
            total_before_merge_bytes += info.size_in_bytes();
        }

        // Roughly measure "skew" of the merge, i.e. how
        // "balanced" the merge is (whether the segments are
        // about the same size), which can range from
        // 1.0/numSegsBeingMerged (good) to 1.0 (poor). Heavily
        // lopsided merges (skew near 1.0) is no good; it means
        // O(N^2) merge cost over time:
        let skew = if hit_too_large {
            // Pretend the merge has perfect skew; skew doesn't
            // matter in this case because this merge will not
            // "cascade" and so it cannot lead to N^2 merge cost
            // over time:
            1.0 / self.max_merge_at_once as f64
        } else {
            self.floor_size(candidate[0].1) as f64 / total_after_merge_bytes_floored as f64
        };

        // Strongly favor merges with less skew (smaller
        // mergeScore is better):
        let mut merge_score = skew;

        // Gently favor smaller merges over bigger ones.  We
        // don't want to make this exponent too large else we
        // can end up doing poor merges of small segments in
        // order to avoid the large merges:
        merge_score *= (total_after_merge_bytes as f64).powf(0.05);

        // Strongly favor merges that reclaim deletes:
        let non_del_ratio = if total_before_merge_bytes > 0 {
            total_after_merge_bytes as f64 / total_before_merge_bytes as f64
        } else {
            1.0
        };
        merge_score *= non_del_ratio.powf(self.reclaim_deletes_weight);

        MergeScore::new(merge_score, skew, non_del_ratio)
    }
}

// Descending by size, ties broken by name.
fn compare_size_desc(
    o1: &SegmentCommitInfo,
    sz1: i64,
    o2: &SegmentCommitInfo,
    sz2: i64,
) -> Ordering {
    sz2.cmp(&sz1).then_with(|| o1.info.name.cmp(&o2.info.name))
}

impl MergePolicy for TieredMergePolicy {
    fn find_merges(
        &self,
        merge_trigger: MergeTrigger,
        segment_infos: &SegmentInfos,
        ctx: &dyn MergeContext,
    ) -> Result<Option<MergeSpecification>> {
        if segment_infos.len() == 0 {
            return Ok(None);
        }
        let merging = ctx.merging_segments();
        let infos_sorted = self.sorted_by_size_desc(&segment_infos.segments, ctx);

        // Compute total index bytes & print details about the index
        let mut total_index_bytes = 0;
        let mut min_segment_bytes = i64::max_value();
        for (info, seg_bytes) in &infos_sorted {
            min_segment_bytes = min_segment_bytes.min(*seg_bytes);
            total_index_bytes += *seg_bytes;
            trace!(
                "TMP: seg={} size={:.3} MB{}",
                info,
                *seg_bytes as f64 / 1024.0 / 1024.0,
                if merging.contains(info.name()) {
                    " [merging]"
                } else {
                    ""
                }
            );
        }

        // If we have too-large segments, grace them out
        // of the max_segment_count:
        let mut too_big_count = 0;
        while too_big_count < infos_sorted.len() {
            let seg_bytes = infos_sorted[too_big_count].1;
            if (seg_bytes as f64) < self.max_merged_segment_bytes as f64 / 2.0 {
                break;
            }
            total_index_bytes -= seg_bytes;
            too_big_count += 1;
        }

        let min_segment_bytes = self.floor_size(min_segment_bytes);

        // Compute max allowed segs in the index
        let mut level_size = min_segment_bytes;
        let mut bytes_left = total_index_bytes;
        let mut allowed_seg_count = 0.0;
        loop {
            let seg_count_level = bytes_left as f64 / level_size as f64;
            if seg_count_level < self.segs_per_tier {
                allowed_seg_count += seg_count_level.ceil();
                break;
            }
            allowed_seg_count += self.segs_per_tier;
            bytes_left -= (self.segs_per_tier * level_size as f64) as i64;
            level_size = level_size.saturating_mul(self.max_merge_at_once as i64);
        }
        let allowed_seg_count_int = allowed_seg_count as usize;

        let max_merge_at_once = self.max_merge_at_once as usize;
        let mut to_be_merged: HashSet<&str> = HashSet::new();
        let mut spec = MergeSpecification::default();

        // Cycle to possibly select more than one merge:
        loop {
            let mut merging_bytes = 0;

            // Gather eligible segments for merging, ie segments
            // not already being merged and not already picked (by
            // prior iteration of this loop) for merging:
            let mut eligible = vec![];
            for &(info, seg_bytes) in &infos_sorted[too_big_count..] {
                if merging.contains(info.name()) {
                    merging_bytes += seg_bytes;
                } else if !to_be_merged.contains(info.name()) {
                    eligible.push((info, seg_bytes));
                }
            }

            let max_merge_is_running = merging_bytes >= self.max_merged_segment_bytes as i64;

            debug!(
                "TMP: trigger={:?} seg_count={} eligible={} allowed={} too_big={}",
                merge_trigger,
                infos_sorted.len(),
                eligible.len(),
                allowed_seg_count_int,
                too_big_count
            );

            if eligible.len() <= allowed_seg_count_int || eligible.len() < max_merge_at_once {
                return Ok(spec.into_option());
            }

            // OK we are over budget -- find best merge!
            let mut best_score: Option<MergeScore> = None;
            let mut best = vec![];
            let mut best_too_large = false;
            let mut best_merge_bytes = 0;

            // Consider all merge starts:
            for start_idx in 0..=eligible.len() - max_merge_at_once {
                let mut total_after_merge_bytes = 0;
                let mut candidate = vec![];
                let mut hit_too_large = false;
                for &(info, seg_bytes) in &eligible[start_idx..] {
                    if candidate.len() >= max_merge_at_once {
                        break;
                    }
                    if total_after_merge_bytes + seg_bytes > self.max_merged_segment_bytes as i64 {
                        hit_too_large = true;
                        // NOTE: we continue, so that we can try
                        // "packing" smaller segments into this merge
                        // to see if we can get closer to the max
                        // size; this in general is not perfect since
                        // this is really "bin packing" and we'd have
                        // to try different permutations.
                        continue;
                    }
                    candidate.push((info, seg_bytes));
                    total_after_merge_bytes += seg_bytes;
                }
                // We should never see an empty candidate: we iterated over
                // max_merge_at_once segments, and already pre-excluded the
                // too-large segments:
                if candidate.is_empty() {
                    continue;
                }

                let score = self.score(&candidate, hit_too_large);
                trace!(
                    "TMP: maybe={:?} score={} {} too_large={} size={:.3} MB",
                    candidate.iter().map(|(i, _)| i.name()).collect::<Vec<_>>(),
                    score.score(),
                    score.explanation(),
                    hit_too_large,
                    total_after_merge_bytes as f64 / 1024.0 / 1024.0
                );

                // If we are already running a max sized merge
                // (max_merge_is_running), don't allow another max
                // sized merge to kick off:
                let better = best_score
                    .as_ref()
                    .map_or(true, |best| score.score() < best.score());
                if better && (!hit_too_large || !max_merge_is_running) {
                    best = candidate;
                    best_score = Some(score);
                    best_too_large = hit_too_large;
                    best_merge_bytes = total_after_merge_bytes;
                }
            }

            match best_score {
                Some(score) if !best.is_empty() => {
                    let segments: Vec<_> = best.iter().map(|(info, _)| Arc::clone(info)).collect();
                    for (info, _) in &best {
                        to_be_merged.insert(info.name());
                    }
                    let merge = OneMerge::new(segments, ctx.next_merge_id())?;
                    debug!(
                        "TMP: add merge={} size={:.3} MB score={} {}{}",
                        merge.seg_string(),
                        best_merge_bytes as f64 / 1024.0 / 1024.0,
                        score.score(),
                        score.explanation(),
                        if best_too_large { " [max merge]" } else { "" }
                    );
                    spec.add(merge);
                }
                _ => return Ok(spec.into_option()),
            }
        }
    }

    fn find_forced_merges(
        &self,
        segment_infos: &SegmentInfos,
        max_segment_count: u32,
        segments_to_merge: &HashMap<Arc<SegmentCommitInfo>, bool>,
        ctx: &dyn MergeContext,
    ) -> Result<Option<MergeSpecification>> {
        debug!(
            "TMP: find_forced_merges max_segment_count={} infos={} segments_to_merge={}",
            max_segment_count,
            segment_infos.len(),
            segments_to_merge.len()
        );
        if max_segment_count < 1 {
            bail!(IllegalArgument(format!(
                "max_segment_count must be >= 1, got {}",
                max_segment_count
            )));
        }
        let merging = ctx.merging_segments();
        let mut eligible = vec![];
        let mut force_merge_running = false;
        let mut segment_is_original = false;
        for info in &segment_infos.segments {
            if let Some(is_original) = segments_to_merge.get(info) {
                segment_is_original = *is_original;
                if merging.contains(info.name()) {
                    force_merge_running = true;
                } else {
                    eligible.push(Arc::clone(info));
                }
            }
        }

        if eligible.is_empty() {
            return Ok(None);
        }

        let max_segment_count = max_segment_count as usize;
        if (max_segment_count > 1 && eligible.len() <= max_segment_count)
            || (max_segment_count == 1
                && eligible.len() == 1
                && (!segment_is_original || self.is_merged(segment_infos, &eligible[0], ctx)))
        {
            debug!("TMP: already merged");
            return Ok(None);
        }

        let eligible: Vec<Arc<SegmentCommitInfo>> = self
            .sorted_by_size_desc(&eligible, ctx)
            .into_iter()
            .map(|(info, _)| Arc::clone(info))
            .collect();

        let max_merge_at_once_explicit = self.max_merge_at_once_explicit as usize;
        let mut end = eligible.len();
        let mut spec = MergeSpecification::default();

        // Do full merges, first, backwards:
        while end >= max_merge_at_once_explicit + max_segment_count - 1 {
            let segments = eligible[end - max_merge_at_once_explicit..end].to_vec();
            let merge = OneMerge::new(segments, ctx.next_merge_id())?;
            debug!("TMP: add merge={}", merge.seg_string());
            spec.add(merge);
            end -= max_merge_at_once_explicit;
        }

        if spec.merges.is_empty() && !force_merge_running {
            // Do final merge
            let num_to_merge = end + 1 - max_segment_count;
            let segments = eligible[end - num_to_merge..end].to_vec();
            let merge = OneMerge::new(segments, ctx.next_merge_id())?;
            debug!("TMP: add final merge={}", merge.seg_string());
            spec.add(merge);
        }

        Ok(spec.into_option())
    }

    fn find_forced_deletes_merges(
        &self,
        segment_infos: &SegmentInfos,
        ctx: &dyn MergeContext,
    ) -> Result<Option<MergeSpecification>> {
        debug!(
            "TMP: find_forced_deletes_merges infos={} pct_allowed={}",
            segment_infos.len(),
            self.force_merge_deletes_pct_allowed
        );
        let merging = ctx.merging_segments();
        let mut eligible = vec![];
        for info in &segment_infos.segments {
            let max_doc = info.info.max_doc();
            if max_doc <= 0 {
                continue;
            }
            let pct_deletes = 100.0 * ctx.num_deleted_docs(info) as f64 / max_doc as f64;
            if pct_deletes > self.force_merge_deletes_pct_allowed && !merging.contains(info.name())
            {
                eligible.push(Arc::clone(info));
            }
        }

        if eligible.is_empty() {
            return Ok(None);
        }

        let eligible: Vec<Arc<SegmentCommitInfo>> = self
            .sorted_by_size_desc(&eligible, ctx)
            .into_iter()
            .map(|(info, _)| Arc::clone(info))
            .collect();

        let mut spec = MergeSpecification::default();
        // Don't enforce max merged size here: app is explicitly
        // calling force_merge_deletes, and knows this may take a
        // long time / produce big segments (like force_merge):
        for chunk in eligible.chunks(self.max_merge_at_once_explicit as usize) {
            let merge = OneMerge::new(chunk.to_vec(), ctx.next_merge_id())?;
            debug!("TMP: add merge={}", merge.seg_string());
            spec.add(merge);
        }
        Ok(spec.into_option())
    }

    fn max_cfs_segment_size(&self) -> u64 {
        self.max_cfs_segment_size
    }

    fn no_cfs_ratio(&self) -> f64 {
        self.no_cfs_ratio
    }
}

struct MergeScore {
    merge_score: f64,
    skew: f64,
    non_del_ratio: f64,
}

impl MergeScore {
    fn new(merge_score: f64, skew: f64, non_del_ratio: f64) -> Self {
        MergeScore {
            merge_score,
            skew,
            non_del_ratio,
        }
    }

    fn score(&self) -> f64 {
        self.merge_score
    }

    /// Human readable explanation of how the merge got this score.
    fn explanation(&self) -> String {
        format!("skew={:.3} non_del_ratio={:.3}", self.skew, self.non_del_ratio)
    }
}

/// A MergePolicy which never returns merges to execute. Use it if you want
/// to prevent segment merges.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoMergePolicy;

impl MergePolicy for NoMergePolicy {
    fn find_merges(
        &self,
        _merge_trigger: MergeTrigger,
        _segment_infos: &SegmentInfos,
        _ctx: &dyn MergeContext,
    ) -> Result<Option<MergeSpecification>> {
        Ok(None)
    }

    fn find_forced_merges(
        &self,
        _segment_infos: &SegmentInfos,
        _max_segment_count: u32,
        _segments_to_merge: &HashMap<Arc<SegmentCommitInfo>, bool>,
        _ctx: &dyn MergeContext,
    ) -> Result<Option<MergeSpecification>> {
        Ok(None)
    }

    fn find_forced_deletes_merges(
        &self,
        _segment_infos: &SegmentInfos,
        _ctx: &dyn MergeContext,
    ) -> Result<Option<MergeSpecification>> {
        Ok(None)
    }

    fn max_cfs_segment_size(&self) -> u64 {
        DEFAULT_MAX_CFS_SEGMENT_SIZE
    }

    fn no_cfs_ratio(&self) -> f64 {
        1.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::index::reader::write_segment;
    use crate::core::store::{Directory, RAMDirectory};

    use std::sync::atomic::{AtomicU32, Ordering as AtomicOrdering};

    #[derive(Default)]
    struct FakeContext {
        merging: HashSet<String>,
        deletes: HashMap<String, i32>,
        next_id: AtomicU32,
    }

    impl MergeContext for FakeContext {
        fn num_deleted_docs(&self, info: &SegmentCommitInfo) -> i32 {
            self.deletes.get(info.name()).cloned().unwrap_or(0)
        }

        fn merging_segments(&self) -> &HashSet<String> {
            &self.merging
        }

        fn next_merge_id(&self) -> u32 {
            self.next_id.fetch_add(1, AtomicOrdering::AcqRel)
        }
    }

    fn infos_with(dir: &Arc<dyn Directory>, count: usize, max_doc: i32) -> Result<SegmentInfos> {
        let mut infos = SegmentInfos::default();
        for _ in 0..count {
            let name = infos.new_segment_name();
            infos.add(write_segment(dir, &name, max_doc)?);
        }
        Ok(infos)
    }

    fn names(merge: &OneMerge) -> Vec<String> {
        let mut names: Vec<String> = merge.segments.iter().map(|s| s.name().to_string()).collect();
        names.sort();
        names
    }

    #[test]
    fn test_tiered_merges_once_a_tier_is_full() -> Result<()> {
        let dir: Arc<dyn Directory> = Arc::new(RAMDirectory::new());
        let policy = TieredMergePolicy::default();
        let ctx = FakeContext::default();

        let mut infos = infos_with(&dir, 9, 5)?;
        assert!(policy
            .find_merges(MergeTrigger::SegmentFlush, &infos, &ctx)?
            .is_none());

        infos.add(write_segment(&dir, "_9", 5)?);
        let spec = policy
            .find_merges(MergeTrigger::SegmentFlush, &infos, &ctx)?
            .expect("ten floor sized segments must merge");
        assert_eq!(spec.merges.len(), 1);
        assert_eq!(spec.merges[0].segments.len(), 10);
        assert_eq!(spec.merges[0].total_max_doc, 50);
        assert_eq!(spec.merges[0].id, 0);
        Ok(())
    }

    #[test]
    fn test_tiered_skips_merging_segments() -> Result<()> {
        let dir: Arc<dyn Directory> = Arc::new(RAMDirectory::new());
        let policy = TieredMergePolicy::default();
        let infos = infos_with(&dir, 11, 3)?;
        let mut ctx = FakeContext::default();
        ctx.merging.insert("_3".to_string());

        let spec = policy
            .find_merges(MergeTrigger::FullFlush, &infos, &ctx)?
            .expect("ten eligible segments remain");
        assert_eq!(spec.merges.len(), 1);
        assert!(!names(&spec.merges[0]).contains(&"_3".to_string()));

        ctx.merging.insert("_4".to_string());
        assert!(policy
            .find_merges(MergeTrigger::FullFlush, &infos, &ctx)?
            .is_none());
        Ok(())
    }

    #[test]
    fn test_forced_merge_to_one_segment() -> Result<()> {
        let dir: Arc<dyn Directory> = Arc::new(RAMDirectory::new());
        let policy = TieredMergePolicy::default();
        let ctx = FakeContext::default();
        let infos = infos_with(&dir, 3, 4)?;
        let to_merge: HashMap<_, _> = infos.segments.iter().map(|s| (Arc::clone(s), true)).collect();

        let spec = policy
            .find_forced_merges(&infos, 1, &to_merge, &ctx)?
            .expect("three segments must merge into one");
        assert_eq!(spec.merges.len(), 1);
        assert_eq!(names(&spec.merges[0]), vec!["_0", "_1", "_2"]);

        // a single original segment without deletes is already merged
        let other: Arc<dyn Directory> = Arc::new(RAMDirectory::new());
        let single = infos_with(&other, 1, 4)?;
        let to_merge: HashMap<_, _> = single.segments.iter().map(|s| (Arc::clone(s), true)).collect();
        assert!(policy.find_forced_merges(&single, 1, &to_merge, &ctx)?.is_none());

        // but one with deletes is rewritten
        let mut ctx = FakeContext::default();
        ctx.deletes.insert("_0".to_string(), 1);
        let spec = policy
            .find_forced_merges(&single, 1, &to_merge, &ctx)?
            .expect("deletes must be expunged");
        assert_eq!(spec.merges[0].segments.len(), 1);
        Ok(())
    }

    #[test]
    fn test_forced_merge_to_many_segments() -> Result<()> {
        let dir: Arc<dyn Directory> = Arc::new(RAMDirectory::new());
        let policy = TieredMergePolicy::default();
        let ctx = FakeContext::default();
        let infos = infos_with(&dir, 5, 4)?;
        let to_merge: HashMap<_, _> = infos.segments.iter().map(|s| (Arc::clone(s), true)).collect();

        let spec = policy
            .find_forced_merges(&infos, 2, &to_merge, &ctx)?
            .expect("five segments exceed two");
        assert_eq!(spec.merges.len(), 1);
        assert_eq!(spec.merges[0].segments.len(), 4);

        assert!(policy.find_forced_merges(&infos, 5, &to_merge, &ctx)?.is_none());
        assert!(policy.find_forced_merges(&infos, 0, &to_merge, &ctx).is_err());
        Ok(())
    }

    #[test]
    fn test_forced_merge_waits_for_running_merge() -> Result<()> {
        let dir: Arc<dyn Directory> = Arc::new(RAMDirectory::new());
        let policy = TieredMergePolicy::default();
        let infos = infos_with(&dir, 3, 4)?;
        let to_merge: HashMap<_, _> = infos.segments.iter().map(|s| (Arc::clone(s), true)).collect();
        let mut ctx = FakeContext::default();
        ctx.merging.insert("_0".to_string());
        assert!(policy.find_forced_merges(&infos, 1, &to_merge, &ctx)?.is_none());
        Ok(())
    }

    #[test]
    fn test_forced_deletes_merge_picks_segments_over_threshold() -> Result<()> {
        let dir: Arc<dyn Directory> = Arc::new(RAMDirectory::new());
        let policy = TieredMergePolicy::default();
        let infos = infos_with(&dir, 3, 20)?;
        let mut ctx = FakeContext::default();
        // 25%, 5% and none
        ctx.deletes.insert("_0".to_string(), 5);
        ctx.deletes.insert("_1".to_string(), 1);

        let spec = policy
            .find_forced_deletes_merges(&infos, &ctx)?
            .expect("_0 is over the threshold");
        assert_eq!(spec.merges.len(), 1);
        assert_eq!(names(&spec.merges[0]), vec!["_0"]);

        ctx.merging.insert("_0".to_string());
        assert!(policy.find_forced_deletes_merges(&infos, &ctx)?.is_none());
        Ok(())
    }

    #[test]
    fn test_size_is_prorated_by_deletes() -> Result<()> {
        let dir: Arc<dyn Directory> = Arc::new(RAMDirectory::new());
        let policy = TieredMergePolicy::default();
        let infos = infos_with(&dir, 1, 10)?;
        let info = &infos.segments[0];
        let mut ctx = FakeContext::default();
        let full = policy.size(info, &ctx);
        assert_eq!(full, info.size_in_bytes());
        ctx.deletes.insert("_0".to_string(), 5);
        assert_eq!(policy.size(info, &ctx), (full as f64 * 0.5) as i64);
        Ok(())
    }

    #[test]
    fn test_use_compound_file_by_ratio() -> Result<()> {
        let dir: Arc<dyn Directory> = Arc::new(RAMDirectory::new());
        let ctx = FakeContext::default();
        let infos = infos_with(&dir, 20, 4)?;
        let mut policy = TieredMergePolicy::default();
        // one of twenty equal segments is within 10% of the index
        assert!(policy.use_compound_file(&infos, &infos.segments[0], &ctx));

        policy.set_no_cfs_ratio(0.0)?;
        assert!(!policy.use_compound_file(&infos, &infos.segments[0], &ctx));
        policy.set_no_cfs_ratio(1.0)?;
        policy.set_max_cfs_segment_size_mb(0.0)?;
        assert!(!policy.use_compound_file(&infos, &infos.segments[0], &ctx));
        Ok(())
    }

    #[test]
    fn test_setters_reject_invalid_values() {
        let mut policy = TieredMergePolicy::default();
        assert!(policy.set_max_merge_at_once(1).is_err());
        assert!(policy.set_max_merge_at_once_explicit(0).is_err());
        assert!(policy.set_segments_per_tier(1.5).is_err());
        assert!(policy.set_max_merged_segment_mb(-1.0).is_err());
        assert!(policy.set_floor_segment_mb(0.0).is_err());
        assert!(policy.set_reclaim_deletes_weight(-0.1).is_err());
        assert!(policy.set_force_merge_deletes_pct_allowed(101.0).is_err());
        assert!(policy.set_no_cfs_ratio(1.5).is_err());
        assert!(policy.set_segments_per_tier(f64::NAN).is_err());
        assert!(policy.set_segments_per_tier(4.0).is_ok());
    }

    #[test]
    fn test_no_merge_policy_never_merges() -> Result<()> {
        let dir: Arc<dyn Directory> = Arc::new(RAMDirectory::new());
        let ctx = FakeContext::default();
        let infos = infos_with(&dir, 12, 2)?;
        let to_merge: HashMap<_, _> = infos.segments.iter().map(|s| (Arc::clone(s), true)).collect();
        let policy = NoMergePolicy;
        assert!(policy.find_merges(MergeTrigger::Explicit, &infos, &ctx)?.is_none());
        assert!(policy.find_forced_merges(&infos, 1, &to_merge, &ctx)?.is_none());
        assert!(policy.find_forced_deletes_merges(&infos, &ctx)?.is_none());
        Ok(())
    }

    #[test]
    fn test_one_merge_requires_segments() {
        assert!(OneMerge::new(vec![], 0).is_err());
    }
}
