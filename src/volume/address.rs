//! Volume geometry: axes, boxes and the chunk address space.
//!
//! All coordinates are stored in `[z, y, x]` order, matching the z-major byte
//! layout of volumes on disk. Boxes are half-open: `start` is inclusive and
//! `end` is exclusive.

use crate::error::{PipelineError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A spatial axis of a volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Axis {
    Z,
    Y,
    X,
}

impl Axis {
    /// All axes in storage order.
    pub const ALL: [Axis; 3] = [Axis::Z, Axis::Y, Axis::X];

    /// Index of this axis in a `[z, y, x]` array.
    pub fn index(self) -> usize {
        match self {
            Axis::Z => 0,
            Axis::Y => 1,
            Axis::X => 2,
        }
    }
}

impl fmt::Display for Axis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Axis::Z => "z",
            Axis::Y => "y",
            Axis::X => "x",
        };
        f.write_str(name)
    }
}

/// Shape of a volume: spatial dimensions plus channel count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VolumeShape {
    /// Spatial extents in `[z, y, x]` order
    pub dims: [usize; 3],

    /// Number of channels per voxel
    pub channels: usize,
}

impl VolumeShape {
    pub fn new(dims: [usize; 3], channels: usize) -> Self {
        Self { dims, channels }
    }

    /// Extent along one axis.
    pub fn extent(&self, axis: Axis) -> usize {
        self.dims[axis.index()]
    }

    /// Total voxel count (spatial only).
    pub fn voxel_count(&self) -> u64 {
        self.dims.iter().map(|&d| d as u64).product()
    }

    /// Box covering the whole volume.
    pub fn full_box(&self) -> Box3 {
        Box3::new([0, 0, 0], self.dims)
    }

    /// Whether a point in continuous voxel coordinates lies inside the volume.
    ///
    /// The volume spans `[0, extent]` along each axis; the upper face is
    /// included so that every centroid reported by an analyzer has an owner.
    pub fn contains_point(&self, point: &[f64; 3]) -> bool {
        point
            .iter()
            .zip(self.dims.iter())
            .all(|(&p, &d)| p >= 0.0 && p <= d as f64)
    }
}

impl fmt::Display for VolumeShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}x{}x{} (x,y,z) with {} channel(s)",
            self.dims[2], self.dims[1], self.dims[0], self.channels
        )
    }
}

/// Axis-aligned, half-open box of voxels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Box3 {
    /// Inclusive start in `[z, y, x]` order
    pub start: [usize; 3],

    /// Exclusive end in `[z, y, x]` order
    pub end: [usize; 3],
}

impl Box3 {
    pub fn new(start: [usize; 3], end: [usize; 3]) -> Self {
        Self { start, end }
    }

    /// Length along one axis.
    pub fn len(&self, axis: Axis) -> usize {
        let i = axis.index();
        self.end[i].saturating_sub(self.start[i])
    }

    /// Shape in `[z, y, x]` order.
    pub fn shape(&self) -> [usize; 3] {
        [self.len(Axis::Z), self.len(Axis::Y), self.len(Axis::X)]
    }

    /// Number of voxels in the box.
    pub fn voxel_count(&self) -> u64 {
        self.shape().iter().map(|&d| d as u64).product()
    }

    /// True if the box has no voxels.
    pub fn is_empty(&self) -> bool {
        self.voxel_count() == 0
    }

    /// Whether `other` lies fully within this box.
    pub fn contains_box(&self, other: &Box3) -> bool {
        (0..3).all(|i| other.start[i] >= self.start[i] && other.end[i] <= self.end[i])
    }

    /// Intersection of two boxes, if non-empty.
    pub fn intersect(&self, other: &Box3) -> Option<Box3> {
        let mut start = [0; 3];
        let mut end = [0; 3];
        for i in 0..3 {
            start[i] = self.start[i].max(other.start[i]);
            end[i] = self.end[i].min(other.end[i]);
            if start[i] >= end[i] {
                return None;
            }
        }
        Some(Box3 { start, end })
    }

    /// Copy of this box with one axis replaced.
    pub fn with_axis(mut self, axis: Axis, start: usize, end: usize) -> Self {
        self.start[axis.index()] = start;
        self.end[axis.index()] = end;
        self
    }
}

impl fmt::Display for Box3 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[z {}:{}, y {}:{}, x {}:{}]",
            self.start[0], self.end[0], self.start[1], self.end[1], self.start[2], self.end[2]
        )
    }
}

/// How a volume is cut into chunks: one split axis, a nominal chunk length
/// along it, and the overlap margin added on each side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkFootprint {
    pub axis: Axis,
    pub length: usize,
    pub margin: usize,
}

/// A contiguous byte range in a volume's data file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteSpan {
    pub offset: u64,
    pub len: u64,
}

/// Pure mapping from chunk indices to regions and byte addresses.
///
/// Never touches pixel data.
#[derive(Debug, Clone)]
pub struct VolumeAddressSpace {
    shape: VolumeShape,
    voxel_bytes: usize,
    footprint: ChunkFootprint,
}

impl VolumeAddressSpace {
    /// Create an address space; the footprint length must be positive.
    pub fn new(shape: VolumeShape, voxel_bytes: usize, footprint: ChunkFootprint) -> Result<Self> {
        if footprint.length == 0 {
            return Err(PipelineError::config("chunk length must be > 0"));
        }
        if shape.dims.iter().any(|&d| d == 0) || shape.channels == 0 {
            return Err(PipelineError::config(format!("volume shape {} is empty", shape)));
        }
        Ok(Self {
            shape,
            voxel_bytes,
            footprint,
        })
    }

    pub fn shape(&self) -> &VolumeShape {
        &self.shape
    }

    pub fn footprint(&self) -> &ChunkFootprint {
        &self.footprint
    }

    /// Number of chunks along the split axis.
    pub fn chunk_count(&self) -> usize {
        self.shape
            .extent(self.footprint.axis)
            .div_ceil(self.footprint.length)
    }

    /// Canonical, non-overlapping box of a chunk.
    pub fn inner_box(&self, index: usize) -> Result<Box3> {
        if index >= self.chunk_count() {
            return Err(PipelineError::Bounds {
                region: format!("chunk {}", index),
                shape: format!("{} chunks", self.chunk_count()),
            });
        }
        let axis = self.footprint.axis;
        let extent = self.shape.extent(axis);
        let start = index * self.footprint.length;
        let end = (start + self.footprint.length).min(extent);
        Ok(self.shape.full_box().with_axis(axis, start, end))
    }

    /// Padded box of a chunk, clamped to the volume.
    pub fn outer_box(&self, index: usize) -> Result<Box3> {
        let inner = self.inner_box(index)?;
        let axis = self.footprint.axis;
        let extent = self.shape.extent(axis);
        let i = axis.index();
        let start = inner.start[i].saturating_sub(self.footprint.margin);
        let end = (inner.end[i] + self.footprint.margin).min(extent);
        Ok(inner.with_axis(axis, start, end))
    }

    /// Fail with a bounds error if the region is empty or leaves the volume.
    pub fn check_region(&self, region: &Box3) -> Result<()> {
        if region.is_empty() || !self.shape.full_box().contains_box(region) {
            return Err(PipelineError::Bounds {
                region: region.to_string(),
                shape: self.shape.to_string(),
            });
        }
        Ok(())
    }

    /// Bytes occupied by one voxel across all channels.
    pub fn bytes_per_voxel(&self) -> u64 {
        (self.voxel_bytes * self.shape.channels) as u64
    }

    /// Byte offset of a voxel in the z-major data file.
    pub fn voxel_offset(&self, z: usize, y: usize, x: usize) -> u64 {
        let [_, ny, nx] = self.shape.dims;
        ((z as u64 * ny as u64 + y as u64) * nx as u64 + x as u64) * self.bytes_per_voxel()
    }

    /// Smallest byte span containing every voxel of the region.
    pub fn byte_span(&self, region: &Box3) -> Result<ByteSpan> {
        self.check_region(region)?;
        let first = self.voxel_offset(region.start[0], region.start[1], region.start[2]);
        let last = self.voxel_offset(region.end[0] - 1, region.end[1] - 1, region.end[2] - 1);
        Ok(ByteSpan {
            offset: first,
            len: last - first + self.bytes_per_voxel(),
        })
    }

    /// Contiguous x-runs of the region, one per `(z, y)` row, in file order.
    pub fn row_spans(&self, region: &Box3) -> Result<Vec<ByteSpan>> {
        self.check_region(region)?;
        let run_len = region.len(Axis::X) as u64 * self.bytes_per_voxel();
        let mut spans = Vec::with_capacity(region.len(Axis::Z) * region.len(Axis::Y));
        for z in region.start[0]..region.end[0] {
            for y in region.start[1]..region.end[1] {
                spans.push(ByteSpan {
                    offset: self.voxel_offset(z, y, region.start[2]),
                    len: run_len,
                });
            }
        }
        Ok(spans)
    }

    /// Byte span of a chunk's outer box.
    pub fn chunk_byte_span(&self, index: usize) -> Result<ByteSpan> {
        let outer = self.outer_box(index)?;
        self.byte_span(&outer)
    }
}
