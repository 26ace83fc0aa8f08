//! Merge policies for segment management.
//!
//! A policy looks at the committed-or-flushed segments that are not already
//! being merged and proposes disjoint sets of them to merge. Selection is
//! purely advisory; the writer decides when to run the candidates.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// What the policy knows about one segment.
#[derive(Debug, Clone, PartialEq)]
pub struct SegmentSizeInfo {
    pub id: u64,
    pub name: String,
    pub doc_count: u32,
    pub del_count: u32,
    /// Bytes on storage, live-docs file included.
    pub size_bytes: u64,
    /// Already an input of a running merge.
    pub is_merging: bool,
}

impl SegmentSizeInfo {
    pub fn deletion_ratio(&self) -> f64 {
        if self.doc_count == 0 {
            0.0
        } else {
            self.del_count as f64 / self.doc_count as f64
        }
    }

    /// Size with deleted documents discounted.
    pub fn live_size_bytes(&self) -> u64 {
        (self.size_bytes as f64 * (1.0 - self.deletion_ratio())) as u64
    }
}

/// Why a merge was proposed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeStrategy {
    SizeBased,
    DeletionBased,
    Forced,
}

/// A proposed merge.
#[derive(Debug, Clone, PartialEq)]
pub struct MergeCandidate {
    /// Ids of the input segments.
    pub segments: Vec<u64>,
    /// Higher runs first.
    pub priority: f64,
    pub estimated_size: u64,
    pub strategy: MergeStrategy,
}

/// Trait for defining merge policies.
pub trait MergePolicy: Send + Sync + std::fmt::Debug {
    /// Merges worth running now, highest priority first. Candidates never
    /// share a segment.
    fn select_merges(&self, segments: &[SegmentSizeInfo]) -> Vec<MergeCandidate>;

    /// Merges that bring the index down to at most `max_segments` segments.
    /// Called repeatedly until it returns nothing.
    fn select_forced_merges(
        &self,
        segments: &[SegmentSizeInfo],
        max_segments: usize,
    ) -> Vec<MergeCandidate> {
        smallest_first(segments, max_segments, usize::MAX)
    }

    /// Policy configuration as key-value pairs, logged when a writer opens.
    fn get_config(&self) -> HashMap<String, String>;
}

/// One forced-merge step: the smallest segments, enough of them to reach
/// `max_segments`, at most `max_at_once`. A lone segment with deletions is
/// rewritten when a single segment is requested.
fn smallest_first(
    segments: &[SegmentSizeInfo],
    max_segments: usize,
    max_at_once: usize,
) -> Vec<MergeCandidate> {
    let max_segments = max_segments.max(1);
    let eligible: Vec<&SegmentSizeInfo> = segments.iter().filter(|s| !s.is_merging).collect();

    if segments.len() <= max_segments {
        return match eligible.as_slice() {
            [only] if max_segments == 1 && segments.len() == 1 && only.del_count > 0 => {
                vec![MergeCandidate {
                    segments: vec![only.id],
                    priority: 1.0,
                    estimated_size: only.live_size_bytes(),
                    strategy: MergeStrategy::Forced,
                }]
            }
            _ => Vec::new(),
        };
    }

    let mut by_size = eligible;
    by_size.sort_by_key(|s| (s.live_size_bytes(), s.id));
    let take = (segments.len() - max_segments + 1)
        .min(max_at_once.max(2))
        .min(by_size.len());
    if take < 2 {
        return Vec::new();
    }

    let chosen = &by_size[..take];
    vec![MergeCandidate {
        segments: chosen.iter().map(|s| s.id).collect(),
        priority: 1.0,
        estimated_size: chosen.iter().map(|s| s.live_size_bytes()).sum(),
        strategy: MergeStrategy::Forced,
    }]
}

/// Settings of [`TieredMergePolicy`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TieredMergePolicyConfig {
    /// Segments a tier may hold before it is merged.
    pub segments_per_tier: usize,

    /// Upper bound on the inputs of one merge.
    pub max_merge_at_once: usize,

    /// Segments smaller than this are treated as this size when tiering.
    pub floor_segment_bytes: u64,

    /// Natural merges never produce a segment larger than this.
    pub max_merged_segment_bytes: u64,

    /// Deletion ratio above which a segment is reclaimed early.
    pub deletion_threshold: f64,

    /// Minimum segment count to trigger merge.
    pub min_merge_segments: usize,
}

impl Default for TieredMergePolicyConfig {
    fn default() -> Self {
        TieredMergePolicyConfig {
            segments_per_tier: 10,
            max_merge_at_once: 10,
            floor_segment_bytes: 2 * 1024 * 1024,
            max_merged_segment_bytes: 5 * 1024 * 1024 * 1024,
            deletion_threshold: 0.2,
            min_merge_segments: 2,
        }
    }
}

/// Groups segments into tiers of exponentially growing size and merges the
/// smallest segments of a tier once it holds more than
/// `segments_per_tier` of them.
#[derive(Debug, Clone, Default)]
pub struct TieredMergePolicy {
    config: TieredMergePolicyConfig,
}

impl TieredMergePolicy {
    pub fn new(config: TieredMergePolicyConfig) -> Self {
        TieredMergePolicy { config }
    }

    pub fn config(&self) -> &TieredMergePolicyConfig {
        &self.config
    }

    fn tier_of(&self, segment: &SegmentSizeInfo) -> u32 {
        let floor = self.config.floor_segment_bytes.max(1) as f64;
        let base = self.config.segments_per_tier.max(2) as f64;
        let size = (segment.live_size_bytes() as f64).max(floor);
        (size / floor).log(base).floor() as u32
    }

    /// Group segments by tier, smallest first within a tier.
    fn group_by_tier<'a>(
        &self,
        segments: &'a [SegmentSizeInfo],
    ) -> HashMap<u32, Vec<&'a SegmentSizeInfo>> {
        let mut tiers: HashMap<u32, Vec<&SegmentSizeInfo>> = HashMap::new();
        for segment in segments {
            if !segment.is_merging {
                tiers.entry(self.tier_of(segment)).or_default().push(segment);
            }
        }
        for tier_segments in tiers.values_mut() {
            tier_segments.sort_by_key(|s| (s.live_size_bytes(), s.id));
        }
        tiers
    }

    fn size_candidate(&self, segments: &[&SegmentSizeInfo]) -> Option<MergeCandidate> {
        if segments.len() <= self.config.segments_per_tier
            || segments.len() < self.config.min_merge_segments
        {
            return None;
        }

        let mut chosen = Vec::new();
        let mut estimated_size = 0;
        for segment in segments.iter().take(self.config.max_merge_at_once) {
            let size = segment.live_size_bytes();
            if !chosen.is_empty() && estimated_size + size > self.config.max_merged_segment_bytes {
                break;
            }
            chosen.push(segment.id);
            estimated_size += size;
        }
        if chosen.len() < self.config.min_merge_segments.max(2) {
            return None;
        }

        let priority = 10.0 + (segments.len() as f64 - self.config.segments_per_tier as f64);
        Some(MergeCandidate {
            segments: chosen,
            priority,
            estimated_size,
            strategy: MergeStrategy::SizeBased,
        })
    }

    fn deletion_candidate(&self, segments: &[&SegmentSizeInfo]) -> Option<MergeCandidate> {
        let high_deletion: Vec<_> = segments
            .iter()
            .filter(|s| s.deletion_ratio() > self.config.deletion_threshold)
            .take(self.config.max_merge_at_once)
            .collect();
        if high_deletion.len() < self.config.min_merge_segments.max(2) {
            return None;
        }

        let avg_deletion_ratio = high_deletion.iter().map(|s| s.deletion_ratio()).sum::<f64>()
            / high_deletion.len() as f64;
        Some(MergeCandidate {
            segments: high_deletion.iter().map(|s| s.id).collect(),
            priority: 5.0 + (avg_deletion_ratio * 10.0),
            estimated_size: high_deletion.iter().map(|s| s.live_size_bytes()).sum(),
            strategy: MergeStrategy::DeletionBased,
        })
    }
}

impl MergePolicy for TieredMergePolicy {
    fn select_merges(&self, segments: &[SegmentSizeInfo]) -> Vec<MergeCandidate> {
        let mut candidates = Vec::new();
        let mut taken = std::collections::HashSet::new();

        let mut tiers: Vec<_> = self.group_by_tier(segments).into_iter().collect();
        tiers.sort_by_key(|(tier, _)| *tier);
        for (_, tier_segments) in &tiers {
            if let Some(candidate) = self.size_candidate(tier_segments) {
                taken.extend(candidate.segments.iter().copied());
                candidates.push(candidate);
            }
        }

        let remaining: Vec<&SegmentSizeInfo> = segments
            .iter()
            .filter(|s| !s.is_merging && !taken.contains(&s.id))
            .collect();
        if let Some(candidate) = self.deletion_candidate(&remaining) {
            candidates.push(candidate);
        }

        candidates.sort_by(|a, b| b.priority.total_cmp(&a.priority));
        candidates
    }

    fn select_forced_merges(
        &self,
        segments: &[SegmentSizeInfo],
        max_segments: usize,
    ) -> Vec<MergeCandidate> {
        smallest_first(segments, max_segments, self.config.max_merge_at_once)
    }

    fn get_config(&self) -> HashMap<String, String> {
        let mut config = HashMap::new();
        config.insert("policy_type".to_string(), "tiered".to_string());
        config.insert(
            "segments_per_tier".to_string(),
            self.config.segments_per_tier.to_string(),
        );
        config.insert(
            "max_merge_at_once".to_string(),
            self.config.max_merge_at_once.to_string(),
        );
        config.insert(
            "floor_segment_bytes".to_string(),
            self.config.floor_segment_bytes.to_string(),
        );
        config.insert(
            "max_merged_segment_bytes".to_string(),
            self.config.max_merged_segment_bytes.to_string(),
        );
        config.insert(
            "deletion_threshold".to_string(),
            self.config.deletion_threshold.to_string(),
        );
        config
    }
}

/// Never proposes natural merges. Forced merges still run.
#[derive(Debug, Clone, Default)]
pub struct NoMergePolicy;

impl MergePolicy for NoMergePolicy {
    fn select_merges(&self, _segments: &[SegmentSizeInfo]) -> Vec<MergeCandidate> {
        Vec::new()
    }

    fn get_config(&self) -> HashMap<String, String> {
        let mut config = HashMap::new();
        config.insert("policy_type".to_string(), "no_merge".to_string());
        config
    }
}
