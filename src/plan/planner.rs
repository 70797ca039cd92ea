//! Chunk planning.
//!
//! The planner cuts a volume into slabs along one axis. Each slab has an inner
//! box (the canonical, non-overlapping part) and an outer box padded by the
//! overlap margin on both sides and clamped to the volume.

use crate::config::{ChunkingConfig, Config};
use crate::error::{PipelineError, Result};
use crate::volume::{Axis, Box3, ChunkFootprint, VolumeAddressSpace, VolumeShape};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, info};

/// Fallback when available memory cannot be determined.
const FALLBACK_MEMORY_BYTES: u64 = 8 * 1024 * 1024 * 1024;

/// One planned chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkRegion {
    /// Stable index in ascending spatial order
    pub index: usize,

    /// Axis the volume is split along
    pub axis: Axis,

    /// Authoritative, non-overlapping box
    pub inner: Box3,

    /// Padded box that is actually read and analyzed
    pub outer: Box3,
}

impl ChunkRegion {
    /// Whether this chunk owns a centroid given in global coordinates.
    ///
    /// Along the split axis the chunk owns `(start, end]`, and chunk 0 also
    /// owns its start face. A centroid exactly on a seam therefore belongs to
    /// the lower-index chunk. The other axes are not split, so any position
    /// inside the volume on them is owned.
    pub fn owns(&self, centroid: &[f64; 3]) -> bool {
        let i = self.axis.index();
        let p = centroid[i];
        let start = self.inner.start[i] as f64;
        let end = self.inner.end[i] as f64;
        let lower_ok = if self.index == 0 { p >= start } else { p > start };
        lower_ok && p <= end
    }

    /// Voxels in the outer box.
    pub fn outer_voxels(&self) -> u64 {
        self.outer.voxel_count()
    }

    /// Offset of the outer box origin in global coordinates.
    pub fn origin(&self) -> [usize; 3] {
        self.outer.start
    }
}

impl fmt::Display for ChunkRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "chunk {} inner {} outer {}", self.index, self.inner, self.outer)
    }
}

/// What the caller asked for along the split axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkTarget {
    /// Derive the length from the memory budget
    Auto,
    /// Fixed nominal length
    Size(usize),
    /// Fixed number of chunks
    Count(usize),
}

impl ChunkTarget {
    pub fn from_config(chunking: &ChunkingConfig) -> Self {
        match (chunking.chunk_size, chunking.chunk_count) {
            (Some(size), _) => ChunkTarget::Size(size),
            (None, Some(count)) => ChunkTarget::Count(count),
            (None, None) => ChunkTarget::Auto,
        }
    }
}

/// Ordered chunk regions for one volume.
#[derive(Debug, Clone)]
pub struct ChunkPlan {
    shape: VolumeShape,
    footprint: ChunkFootprint,
    regions: Vec<ChunkRegion>,
    bytes_per_voxel_cost: f64,
}

impl ChunkPlan {
    pub fn shape(&self) -> &VolumeShape {
        &self.shape
    }

    pub fn footprint(&self) -> &ChunkFootprint {
        &self.footprint
    }

    pub fn regions(&self) -> &[ChunkRegion] {
        &self.regions
    }

    pub fn len(&self) -> usize {
        self.regions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }

    pub fn region(&self, index: usize) -> Option<&ChunkRegion> {
        self.regions.get(index)
    }

    /// Largest outer box voxel count in the plan.
    pub fn max_outer_voxels(&self) -> u64 {
        self.regions.iter().map(|r| r.outer_voxels()).max().unwrap_or(0)
    }

    /// Estimated working memory of the largest chunk, in bytes.
    pub fn peak_chunk_bytes(&self) -> u64 {
        self.estimated_bytes(self.max_outer_voxels())
    }

    /// Estimated working memory for a number of outer-box voxels.
    pub fn estimated_bytes(&self, voxels: u64) -> u64 {
        (voxels as f64 * self.shape.channels as f64 * self.bytes_per_voxel_cost).ceil() as u64
    }

    /// Stable identifier of the geometry of this plan. Two plans with the
    /// same fingerprint have identical regions.
    pub fn fingerprint(&self) -> String {
        let [z, y, x] = self.shape.dims;
        format!(
            "z{}y{}x{}c{}:{}:{}:{}",
            z,
            y,
            x,
            self.shape.channels,
            self.footprint.axis,
            self.footprint.length,
            self.footprint.margin
        )
    }
}

/// Produces chunk plans from a volume shape and a resource budget.
#[derive(Debug, Clone)]
pub struct ChunkPlanner {
    axis: Option<Axis>,
    target: ChunkTarget,
    margin: usize,
    min_len: usize,
    max_len: usize,
    max_chunks: usize,
    bytes_per_voxel_cost: f64,
    memory_fraction: f64,
    available_bytes: u64,
    workers: usize,
}

impl ChunkPlanner {
    /// Planner with the given overlap margin and default sizing parameters.
    pub fn new(margin: usize) -> Self {
        let defaults = ChunkingConfig::default();
        Self {
            axis: None,
            target: ChunkTarget::Auto,
            margin,
            min_len: defaults.min_chunk_len,
            max_len: defaults.max_chunk_len,
            max_chunks: defaults.max_chunks,
            bytes_per_voxel_cost: defaults.bytes_per_voxel_cost,
            memory_fraction: defaults.memory_fraction,
            available_bytes: FALLBACK_MEMORY_BYTES,
            workers: 1,
        }
    }

    /// Planner configured from a job configuration, querying available memory
    /// unless a fixed budget is configured.
    pub fn from_config(config: &Config) -> Self {
        let chunking = &config.chunking;
        let available_bytes = match chunking.memory_budget_gb {
            Some(gb) => (gb * 1024.0 * 1024.0 * 1024.0) as u64,
            None => available_memory_bytes(),
        };
        Self {
            axis: chunking.axis,
            target: ChunkTarget::from_config(chunking),
            margin: config.overlap_margin(),
            min_len: chunking.min_chunk_len,
            max_len: chunking.max_chunk_len,
            max_chunks: chunking.max_chunks,
            bytes_per_voxel_cost: chunking.bytes_per_voxel_cost,
            memory_fraction: chunking.memory_fraction,
            available_bytes,
            workers: config.processing.worker_limit(),
        }
    }

    pub fn with_axis(mut self, axis: Axis) -> Self {
        self.axis = Some(axis);
        self
    }

    pub fn with_target(mut self, target: ChunkTarget) -> Self {
        self.target = target;
        self
    }

    pub fn with_max_chunks(mut self, max_chunks: usize) -> Self {
        self.max_chunks = max_chunks.max(1);
        self
    }

    /// Memory available to the pool and the number of workers sharing it.
    pub fn with_memory(mut self, available_bytes: u64, workers: usize) -> Self {
        self.available_bytes = available_bytes;
        self.workers = workers.max(1);
        self
    }

    pub fn margin(&self) -> usize {
        self.margin
    }

    /// Memory the pool may use in total.
    pub fn memory_budget(&self) -> u64 {
        (self.available_bytes as f64 * self.memory_fraction) as u64
    }

    /// Plan chunks for a volume.
    pub fn plan(&self, shape: VolumeShape, voxel_bytes: usize) -> Result<ChunkPlan> {
        if self.margin == 0 {
            return Err(PipelineError::config("overlap margin must be at least 1 voxel"));
        }
        if shape.dims.iter().any(|&d| d == 0) {
            return Err(PipelineError::config(format!("volume shape {} is empty", shape)));
        }

        let axis = self.axis.unwrap_or_else(|| dominant_axis(&shape));
        let extent = shape.extent(axis);
        let mut length = match self.target {
            ChunkTarget::Size(size) => size,
            ChunkTarget::Count(count) => extent.div_ceil(count.max(1)),
            ChunkTarget::Auto => self.auto_length(&shape, axis),
        }
        .clamp(1, extent);

        if extent.div_ceil(length) > self.max_chunks {
            let grown = extent.div_ceil(self.max_chunks);
            debug!(
                "Chunk count {} exceeds limit {}, growing length {} -> {}",
                extent.div_ceil(length),
                self.max_chunks,
                length,
                grown
            );
            length = grown;
        }

        let footprint = ChunkFootprint {
            axis,
            length,
            margin: self.margin,
        };
        let space = VolumeAddressSpace::new(shape, voxel_bytes, footprint)?;
        let regions = (0..space.chunk_count())
            .map(|index| {
                Ok(ChunkRegion {
                    index,
                    axis,
                    inner: space.inner_box(index)?,
                    outer: space.outer_box(index)?,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        info!(
            "Planned {} chunks along {} (length {}, margin {}) for {}",
            regions.len(),
            axis,
            length,
            self.margin,
            shape
        );

        Ok(ChunkPlan {
            shape,
            footprint,
            regions,
            bytes_per_voxel_cost: self.bytes_per_voxel_cost,
        })
    }

    /// Chunk length whose outer box fits one worker's share of the budget.
    fn auto_length(&self, shape: &VolumeShape, axis: Axis) -> usize {
        let per_worker = self.memory_budget() as f64 / self.workers as f64;
        let cross_section: f64 = Axis::ALL
            .iter()
            .filter(|&&a| a != axis)
            .map(|&a| shape.extent(a) as f64)
            .product::<f64>()
            * shape.channels as f64;
        let outer_len = per_worker / (self.bytes_per_voxel_cost * cross_section);
        let inner_len = (outer_len.floor() as usize).saturating_sub(2 * self.margin);
        let length = inner_len.clamp(self.min_len, self.max_len);
        debug!(
            "Memory sizing: {:.1} MB per worker, cross-section {} voxels -> length {}",
            per_worker / 1_048_576.0,
            cross_section,
            length
        );
        length
    }
}

/// Largest axis, ties resolved x, then y, then z.
pub fn dominant_axis(shape: &VolumeShape) -> Axis {
    let mut best = Axis::X;
    for axis in [Axis::Y, Axis::Z] {
        if shape.extent(axis) > shape.extent(best) {
            best = axis;
        }
    }
    best
}

/// Available system memory in bytes.
pub fn available_memory_bytes() -> u64 {
    #[cfg(target_os = "linux")]
    {
        if let Ok(content) = std::fs::read_to_string("/proc/meminfo") {
            if let Some(bytes) = parse_meminfo(&content) {
                return bytes;
            }
        }
    }
    FALLBACK_MEMORY_BYTES
}

fn parse_meminfo(content: &str) -> Option<u64> {
    content
        .lines()
        .find(|line| line.starts_with("MemAvailable:"))
        .and_then(|line| line.split_whitespace().nth(1))
        .and_then(|kb| kb.parse::<u64>().ok())
        .map(|kb| kb * 1024)
}
