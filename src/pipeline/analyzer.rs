//! Per-chunk analysis.
//!
//! An analyzer receives the voxels of a chunk's outer box and reports objects
//! in chunk-local coordinates (relative to the outer box origin). Translation
//! to global coordinates and seam attribution happen in the merger.

use crate::config::{AnalyzerKind, Config};
use crate::plan::ChunkRegion;
use anyhow::{ensure, Result};
use ndarray::{s, ArrayView3, ArrayView4};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Review state of a detected object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DetectionFlag {
    #[default]
    Unverified,
    Confirmed,
    Rejected,
}

/// A detected object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    /// Sub-voxel centroid `[z, y, x]`
    pub centroid: [f64; 3],

    /// Lower corner of the bounding region `[z, y, x]`
    pub bounds_min: [f64; 3],

    /// Upper corner of the bounding region `[z, y, x]`
    pub bounds_max: [f64; 3],

    /// Object radius in voxels
    pub radius: f64,

    /// Detection confidence in `[0, 1]`
    pub confidence: f64,

    #[serde(default)]
    pub flag: DetectionFlag,

    /// Channel the object was found in
    pub channel: usize,
}

impl Detection {
    /// Copy shifted by `origin` voxels.
    pub fn translated(&self, origin: [usize; 3]) -> Self {
        let shift = |p: [f64; 3]| [p[0] + origin[0] as f64, p[1] + origin[1] as f64, p[2] + origin[2] as f64];
        Self {
            centroid: shift(self.centroid),
            bounds_min: shift(self.bounds_min),
            bounds_max: shift(self.bounds_max),
            ..self.clone()
        }
    }
}

/// Analysis run on one chunk. Implementations must be pure functions of the
/// voxels they are given so that overlapping chunks agree on shared objects.
pub trait ChunkAnalyzer: Send + Sync {
    /// Short name for logs and reports.
    fn name(&self) -> &str;

    /// Largest radius of any reported object, in voxels.
    fn max_object_radius(&self) -> f64;

    /// Smallest overlap margin for which every chunk reports the same objects
    /// in its owned region as a whole-volume run would.
    fn required_margin(&self) -> usize {
        self.max_object_radius().ceil() as usize
    }

    /// Detect objects in `data` (the chunk's outer box, `[z, y, x, channel]`).
    fn analyze(&self, region: &ChunkRegion, data: ArrayView4<'_, u16>) -> Result<Vec<Detection>>;
}

/// Build the analyzer selected by the configuration profile.
pub fn build_analyzer(config: &Config) -> Arc<dyn ChunkAnalyzer> {
    match config.profile.kind {
        AnalyzerKind::Peaks => Arc::new(PeakDetector {
            threshold: config.profile.threshold,
            min_separation: config.profile.min_separation,
            radius: config.profile.max_object_radius,
            channel: config.input.channel,
        }),
    }
}

/// Reports bright local maxima.
///
/// A voxel is a peak when it reaches `threshold` and is the strict maximum of
/// the cube of half-width `min_separation` around it, equal values being
/// resolved in favour of the first voxel in `[z, y, x]` order. The centroid is
/// the intensity-weighted mean of the 3x3x3 neighbourhood. Both rules only
/// look `min_separation` voxels away, so chunks overlapping by more than that
/// report identical objects in their owned region.
#[derive(Debug, Clone)]
pub struct PeakDetector {
    pub threshold: u16,
    pub min_separation: usize,
    pub radius: f64,
    /// Analyze one channel instead of all of them
    pub channel: Option<usize>,
}

impl PeakDetector {
    fn detect_channel(&self, volume: ArrayView3<'_, u16>, channel: usize) -> Vec<Detection> {
        let (nz, ny, nx) = volume.dim();
        (0..nz)
            .into_par_iter()
            .flat_map_iter(|z| {
                let mut found = Vec::new();
                for y in 0..ny {
                    for x in 0..nx {
                        if self.is_peak(&volume, [z, y, x]) {
                            found.push(self.detection_at(&volume, [z, y, x], channel));
                        }
                    }
                }
                found
            })
            .collect()
    }

    fn is_peak(&self, volume: &ArrayView3<'_, u16>, at: [usize; 3]) -> bool {
        let value = volume[at];
        if value < self.threshold {
            return false;
        }
        let (lo, hi) = window(volume.dim(), at, self.min_separation);
        for z in lo[0]..hi[0] {
            for y in lo[1]..hi[1] {
                for x in lo[2]..hi[2] {
                    let other = volume[[z, y, x]];
                    if other > value || (other == value && [z, y, x] < at) {
                        return false;
                    }
                }
            }
        }
        true
    }

    fn detection_at(&self, volume: &ArrayView3<'_, u16>, at: [usize; 3], channel: usize) -> Detection {
        let (lo, hi) = window(volume.dim(), at, 1);
        let neighbourhood = volume.slice(s![lo[0]..hi[0], lo[1]..hi[1], lo[2]..hi[2]]);

        let mut weight = 0.0;
        let mut sum = [0.0f64; 3];
        for ((dz, dy, dx), &v) in neighbourhood.indexed_iter() {
            let w = v as f64;
            weight += w;
            sum[0] += w * (lo[0] + dz) as f64;
            sum[1] += w * (lo[1] + dy) as f64;
            sum[2] += w * (lo[2] + dx) as f64;
        }
        let centroid = if weight > 0.0 {
            [sum[0] / weight, sum[1] / weight, sum[2] / weight]
        } else {
            [at[0] as f64, at[1] as f64, at[2] as f64]
        };

        Detection {
            centroid,
            bounds_min: centroid.map(|c| c - self.radius),
            bounds_max: centroid.map(|c| c + self.radius),
            radius: self.radius,
            confidence: volume[at] as f64 / u16::MAX as f64,
            flag: DetectionFlag::Unverified,
            channel,
        }
    }
}

impl ChunkAnalyzer for PeakDetector {
    fn name(&self) -> &str {
        "peaks"
    }

    fn max_object_radius(&self) -> f64 {
        self.radius
    }

    fn required_margin(&self) -> usize {
        (self.radius.ceil() as usize).max(self.min_separation + 1)
    }

    fn analyze(&self, region: &ChunkRegion, data: ArrayView4<'_, u16>) -> Result<Vec<Detection>> {
        ensure!(
            data.shape()[..3] == region.outer.shape(),
            "chunk {} data shape {:?} does not match outer box {}",
            region.index,
            data.shape(),
            region.outer
        );
        let channels = data.shape()[3];
        let selected: Vec<usize> = match self.channel {
            Some(c) => {
                ensure!(c < channels, "channel {} not in volume with {} channel(s)", c, channels);
                vec![c]
            }
            None => (0..channels).collect(),
        };

        let mut detections = Vec::new();
        for c in selected {
            detections.extend(self.detect_channel(data.index_axis(ndarray::Axis(3), c), c));
        }
        Ok(detections)
    }
}

/// Half-open window of half-width `radius` around `at`, clipped to `dim`.
fn window(dim: (usize, usize, usize), at: [usize; 3], radius: usize) -> ([usize; 3], [usize; 3]) {
    let dims = [dim.0, dim.1, dim.2];
    let mut lo = [0; 3];
    let mut hi = [0; 3];
    for i in 0..3 {
        lo[i] = at[i].saturating_sub(radius);
        hi[i] = (at[i] + radius + 1).min(dims[i]);
    }
    (lo, hi)
}
