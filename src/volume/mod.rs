//! Volume geometry and storage.

mod address;
mod format;

pub use address::{Axis, Box3, ByteSpan, ChunkFootprint, VolumeAddressSpace, VolumeShape};
pub use format::{
    volume_paths, Plane, RawVolume, RawVolumeWriter, VolumeInfo, VolumeSource, VoxelType,
    VOLUME_INFO_VERSION,
};

#[cfg(test)]
pub(crate) use format::MemoryVolume;
