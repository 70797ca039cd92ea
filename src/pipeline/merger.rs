//! Seam resolution: combining chunk results into one whole-volume result.
//!
//! Each detection is translated from chunk-local to global coordinates and
//! kept only if its centroid lies in the chunk's ownership interval (see
//! [`ChunkRegion::owns`]). Results are keyed by chunk index, so the merged
//! output does not depend on the order chunks arrive in and merging the same
//! chunk twice changes nothing.

use crate::pipeline::analyzer::Detection;
use crate::pipeline::worker_pool::ChunkResult;
use crate::plan::ChunkRegion;
use crate::volume::VolumeShape;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

/// A chunk that contributed nothing to the merged result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkGap {
    pub region: ChunkRegion,
    pub reason: String,
}

/// Accumulates chunk results for one volume.
#[derive(Debug, Clone)]
pub struct SeamMerger {
    shape: VolumeShape,
    claimed: BTreeMap<usize, Vec<Detection>>,
    gaps: BTreeMap<usize, ChunkGap>,
    discarded: BTreeMap<usize, usize>,
}

impl SeamMerger {
    pub fn new(shape: VolumeShape) -> Self {
        Self {
            shape,
            claimed: BTreeMap::new(),
            gaps: BTreeMap::new(),
            discarded: BTreeMap::new(),
        }
    }

    /// Add one chunk's result. Returns the number of objects it claims.
    ///
    /// A succeeded result replaces any earlier gap recorded for the same chunk.
    /// A failed result never replaces an earlier success.
    pub fn merge(&mut self, result: &ChunkResult) -> usize {
        let index = result.region.index;
        if !result.is_succeeded() {
            if !self.claimed.contains_key(&index) {
                let reason = result
                    .error
                    .clone()
                    .unwrap_or_else(|| result.status.to_string());
                self.gaps.insert(
                    index,
                    ChunkGap {
                        region: result.region,
                        reason,
                    },
                );
            }
            return 0;
        }

        let origin = result.region.origin();
        let mut owned = Vec::with_capacity(result.detections.len());
        for detection in &result.detections {
            let global = detection.translated(origin);
            if self.shape.contains_point(&global.centroid) && result.region.owns(&global.centroid) {
                owned.push(global);
            }
        }
        owned.sort_by(|a, b| compare_detections(a, b));

        let kept = owned.len();
        let dropped = result.detections.len() - kept;
        debug!(
            "Chunk {}: {} objects claimed, {} left to neighbours",
            index, kept, dropped
        );
        self.gaps.remove(&index);
        self.discarded.insert(index, dropped);
        self.claimed.insert(index, owned);
        kept
    }

    /// Chunks merged successfully so far.
    pub fn merged_chunks(&self) -> usize {
        self.claimed.len()
    }

    pub fn gaps(&self) -> impl Iterator<Item = &ChunkGap> {
        self.gaps.values()
    }

    /// Final result: objects sorted by chunk then position, gaps by index.
    pub fn finish(&self) -> WholeVolumeResult {
        let objects: Vec<Detection> = self.claimed.values().flatten().cloned().collect();
        WholeVolumeResult {
            shape: self.shape,
            object_count: objects.len(),
            objects,
            chunks_merged: self.claimed.len(),
            objects_discarded_at_seams: self.discarded.values().sum(),
            gaps: self.gaps.values().cloned().collect(),
        }
    }
}

fn compare_detections(a: &Detection, b: &Detection) -> std::cmp::Ordering {
    a.centroid
        .iter()
        .zip(b.centroid.iter())
        .map(|(x, y)| x.total_cmp(y))
        .find(|o| o.is_ne())
        .unwrap_or(std::cmp::Ordering::Equal)
        .then(a.channel.cmp(&b.channel))
}

/// Deduplicated whole-volume result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WholeVolumeResult {
    pub shape: VolumeShape,
    pub object_count: usize,
    pub objects: Vec<Detection>,
    pub chunks_merged: usize,
    /// Objects reported in overlap margins and left to the owning neighbour
    pub objects_discarded_at_seams: usize,
    /// Chunks that failed or never ran
    pub gaps: Vec<ChunkGap>,
}

impl WholeVolumeResult {
    pub fn is_complete(&self) -> bool {
        self.gaps.is_empty()
    }
}
