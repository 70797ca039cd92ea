//! On-disk volume format: raw z-major voxel data plus a JSON metadata sidecar.
//!
//! A volume named `brain` is stored as `brain.raw` (little-endian voxels laid out
//! `[z][y][x][channel]`) and `brain.json` ([`VolumeInfo`]). Region reads open
//! their own file handle and use positional reads, so any number of workers can
//! read overlapping regions concurrently.

use super::address::{Axis, Box3, ChunkFootprint, VolumeAddressSpace, VolumeShape};
use crate::error::{PipelineError, Result};
use ndarray::{Array3, Array4};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Metadata format version; bump on any incompatible change to [`VolumeInfo`].
pub const VOLUME_INFO_VERSION: u32 = 1;

/// Storage type of a single channel value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VoxelType {
    U8,
    U16,
}

impl VoxelType {
    /// Bytes per channel value.
    pub fn size(self) -> usize {
        match self {
            VoxelType::U8 => 1,
            VoxelType::U16 => 2,
        }
    }
}

/// Planar orientation of a volume relative to its acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Plane {
    /// Original orientation
    #[default]
    Xy,
    /// z and y swapped
    Xz,
    /// Reordered to (x, z, y)
    Yz,
}

impl Plane {
    /// Source axis for each destination axis, in `[z, y, x]` order.
    pub fn source_axes(self) -> [Axis; 3] {
        match self {
            Plane::Xy => [Axis::Z, Axis::Y, Axis::X],
            Plane::Xz => [Axis::Y, Axis::Z, Axis::X],
            Plane::Yz => [Axis::X, Axis::Z, Axis::Y],
        }
    }
}

/// Metadata sidecar for a stored volume.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VolumeInfo {
    /// Metadata format version
    pub version: u32,

    /// Spatial shape and channels
    pub shape: VolumeShape,

    /// Voxel storage type
    pub voxel_type: VoxelType,

    /// Voxel size in micrometres, `[z, y, x]`
    #[serde(default = "default_resolution")]
    pub resolution: [f64; 3],

    /// Objective magnification
    #[serde(default)]
    pub magnification: Option<f64>,

    /// Optical zoom
    #[serde(default)]
    pub zoom: Option<f64>,

    /// Planar orientation
    #[serde(default)]
    pub plane: Plane,

    /// Scaling relative to the originally imported volume, `[z, y, x]`
    #[serde(default)]
    pub scaling: Option<[f64; 3]>,

    /// Per-channel low intensity bound (0.5th percentile), when known
    #[serde(default)]
    pub near_min: Option<Vec<f64>>,

    /// Per-channel high intensity bound (99.5th percentile), when known
    #[serde(default)]
    pub near_max: Option<Vec<f64>>,
}

fn default_resolution() -> [f64; 3] {
    [1.0, 1.0, 1.0]
}

impl VolumeInfo {
    /// Metadata for a fresh volume with unit resolution.
    pub fn new(shape: VolumeShape, voxel_type: VoxelType) -> Self {
        Self {
            version: VOLUME_INFO_VERSION,
            shape,
            voxel_type,
            resolution: default_resolution(),
            magnification: None,
            zoom: None,
            plane: Plane::Xy,
            scaling: None,
            near_min: None,
            near_max: None,
        }
    }

    /// Expected size of the data file in bytes.
    pub fn data_len(&self) -> u64 {
        self.shape.voxel_count() * (self.shape.channels * self.voxel_type.size()) as u64
    }

    /// Check version and shape.
    pub fn validate(&self) -> Result<()> {
        if self.version != VOLUME_INFO_VERSION {
            return Err(PipelineError::config(format!(
                "unsupported volume metadata version {} (expected {})",
                self.version, VOLUME_INFO_VERSION
            )));
        }
        if self.shape.dims.iter().any(|&d| d == 0) || self.shape.channels == 0 {
            return Err(PipelineError::config(format!(
                "volume shape {} has an empty dimension",
                self.shape
            )));
        }
        if self.resolution.iter().any(|&r| !(r > 0.0)) {
            return Err(PipelineError::config("volume resolution must be positive"));
        }
        Ok(())
    }
}

/// Sidecar and data paths for a volume, derived from any of `name`,
/// `name.json` or `name.raw`.
pub fn volume_paths(path: &Path) -> (PathBuf, PathBuf) {
    let stem = match path.extension().and_then(|e| e.to_str()) {
        Some("json") | Some("raw") => path.with_extension(""),
        _ => path.to_path_buf(),
    };
    (stem.with_extension("json"), stem.with_extension("raw"))
}

/// Random-access, read-only view of a volume.
pub trait VolumeSource: Send + Sync {
    /// Shape of the volume.
    fn shape(&self) -> VolumeShape;

    /// Read a region as `[z, y, x, channel]`, widening to `u16`.
    fn read_region(&self, region: &Box3) -> Result<Array4<u16>>;
}

/// A volume stored in the raw + sidecar format.
#[derive(Debug, Clone)]
pub struct RawVolume {
    info: VolumeInfo,
    data_path: PathBuf,
    address: VolumeAddressSpace,
}

impl RawVolume {
    /// Open an existing volume and check that its data file matches the metadata.
    pub fn open(path: &Path) -> Result<Self> {
        let (info_path, data_path) = volume_paths(path);
        let contents = std::fs::read_to_string(&info_path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => {
                PipelineError::NotFound(info_path.display().to_string())
            }
            _ => PipelineError::Io(e),
        })?;
        let info: VolumeInfo = serde_json::from_str(&contents)?;
        info.validate()?;

        let actual = std::fs::metadata(&data_path)
            .map_err(|_| PipelineError::NotFound(data_path.display().to_string()))?
            .len();
        if actual != info.data_len() {
            return Err(PipelineError::config(format!(
                "{} holds {} bytes but metadata describes {}",
                data_path.display(),
                actual,
                info.data_len()
            )));
        }

        Self::from_parts(info, data_path)
    }

    fn from_parts(info: VolumeInfo, data_path: PathBuf) -> Result<Self> {
        let footprint = ChunkFootprint {
            axis: Axis::Z,
            length: info.shape.dims[0],
            margin: 0,
        };
        let address = VolumeAddressSpace::new(info.shape, info.voxel_type.size(), footprint)?;
        Ok(Self {
            info,
            data_path,
            address,
        })
    }

    pub fn info(&self) -> &VolumeInfo {
        &self.info
    }

    pub fn data_path(&self) -> &Path {
        &self.data_path
    }

    /// Write a whole volume from a `[z, y, x, channel]` array.
    pub fn create(path: &Path, mut info: VolumeInfo, data: &Array4<u16>) -> Result<Self> {
        let dims = data.shape();
        info.shape = VolumeShape::new([dims[0], dims[1], dims[2]], dims[3]);
        let mut writer = RawVolumeWriter::create(path, info)?;
        for z in 0..dims[0] {
            writer.write_plane(&data.index_axis(ndarray::Axis(0), z).to_owned())?;
        }
        writer.finish()
    }

    fn decode(&self, bytes: &[u8], out: &mut Vec<u16>) {
        match self.info.voxel_type {
            VoxelType::U8 => out.extend(bytes.iter().map(|&b| b as u16)),
            VoxelType::U16 => out.extend(
                bytes
                    .chunks_exact(2)
                    .map(|pair| u16::from_le_bytes([pair[0], pair[1]])),
            ),
        }
    }
}

impl VolumeSource for RawVolume {
    fn shape(&self) -> VolumeShape {
        self.info.shape
    }

    fn read_region(&self, region: &Box3) -> Result<Array4<u16>> {
        let spans = self.address.row_spans(region)?;
        let channels = self.info.shape.channels;
        let mut file = File::open(&self.data_path)?;
        let mut values = Vec::with_capacity(region.voxel_count() as usize * channels);
        let mut buf = Vec::new();

        for span in spans {
            buf.resize(span.len as usize, 0);
            file.seek(SeekFrom::Start(span.offset))?;
            file.read_exact(&mut buf)?;
            self.decode(&buf, &mut values);
        }

        let [z, y, x] = region.shape();
        Array4::from_shape_vec((z, y, x, channels), values)
            .map_err(|e| PipelineError::config(format!("region shape mismatch: {}", e)))
    }
}

/// Streams a volume to disk one z-plane at a time.
pub struct RawVolumeWriter {
    info: VolumeInfo,
    info_path: PathBuf,
    data_path: PathBuf,
    writer: BufWriter<File>,
    planes_written: usize,
}

impl RawVolumeWriter {
    /// Start writing a volume described by `info`.
    pub fn create(path: &Path, info: VolumeInfo) -> Result<Self> {
        info.validate()?;
        let (info_path, data_path) = volume_paths(path);
        if let Some(parent) = data_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let writer = BufWriter::new(File::create(&data_path)?);
        Ok(Self {
            info,
            info_path,
            data_path,
            writer,
            planes_written: 0,
        })
    }

    /// Append the next z-plane, shaped `[y, x, channel]`.
    pub fn write_plane(&mut self, plane: &Array3<u16>) -> Result<()> {
        let [_, ny, nx] = self.info.shape.dims;
        let expected = (ny, nx, self.info.shape.channels);
        if plane.dim() != expected || self.planes_written >= self.info.shape.dims[0] {
            return Err(PipelineError::config(format!(
                "plane {} with shape {:?} does not fit volume {}",
                self.planes_written,
                plane.dim(),
                self.info.shape
            )));
        }
        for &value in plane.iter() {
            match self.info.voxel_type {
                VoxelType::U8 => self.writer.write_all(&[value.min(u8::MAX as u16) as u8])?,
                VoxelType::U16 => self.writer.write_all(&value.to_le_bytes())?,
            }
        }
        self.planes_written += 1;
        Ok(())
    }

    /// Flush data, then write the sidecar so a readable sidecar implies complete data.
    pub fn finish(mut self) -> Result<RawVolume> {
        if self.planes_written != self.info.shape.dims[0] {
            return Err(PipelineError::config(format!(
                "wrote {} of {} planes",
                self.planes_written, self.info.shape.dims[0]
            )));
        }
        self.writer.flush()?;
        std::fs::write(&self.info_path, serde_json::to_string_pretty(&self.info)?)?;
        RawVolume::from_parts(self.info, self.data_path)
    }
}

/// In-memory volume for tests.
#[cfg(test)]
pub(crate) struct MemoryVolume {
    pub data: Array4<u16>,
}

#[cfg(test)]
impl VolumeSource for MemoryVolume {
    fn shape(&self) -> VolumeShape {
        let d = self.data.shape();
        VolumeShape::new([d[0], d[1], d[2]], d[3])
    }

    fn read_region(&self, region: &Box3) -> Result<Array4<u16>> {
        use ndarray::s;
        if !self.shape().full_box().contains_box(region) {
            return Err(PipelineError::Bounds {
                region: region.to_string(),
                shape: self.shape().to_string(),
            });
        }
        Ok(self
            .data
            .slice(s![
                region.start[0]..region.end[0],
                region.start[1]..region.end[1],
                region.start[2]..region.end[2],
                ..
            ])
            .to_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn ramp(dims: [usize; 3], channels: usize) -> Array4<u16> {
        Array4::from_shape_fn((dims[0], dims[1], dims[2], channels), |(z, y, x, c)| {
            (z * 1000 + y * 100 + x * 10 + c) as u16
        })
    }

    #[test]
    fn test_read_region_matches_source() {
        let dir = TempDir::new().unwrap();
        let data = ramp([4, 5, 6], 2);
        let info = VolumeInfo::new(VolumeShape::new([4, 5, 6], 2), VoxelType::U16);
        let volume = RawVolume::create(&dir.path().join("vol"), info, &data).unwrap();

        let region = Box3::new([1, 2, 3], [3, 5, 6]);
        let read = volume.read_region(&region).unwrap();
        assert_eq!(read.dim(), (2, 3, 3, 2));
        assert_eq!(read[[0, 0, 0, 0]], data[[1, 2, 3, 0]]);
        assert_eq!(read[[1, 2, 2, 1]], data[[2, 4, 5, 1]]);
    }

    #[test]
    fn test_open_validates_data_length() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("vol");
        let info = VolumeInfo::new(VolumeShape::new([2, 2, 2], 1), VoxelType::U8);
        RawVolume::create(&path, info, &ramp([2, 2, 2], 1)).unwrap();

        let reopened = RawVolume::open(&path.with_extension("json")).unwrap();
        assert_eq!(reopened.info().voxel_type, VoxelType::U8);

        std::fs::write(path.with_extension("raw"), [0u8; 3]).unwrap();
        assert!(matches!(RawVolume::open(&path), Err(PipelineError::Config(_))));
    }

    #[test]
    fn test_open_missing_volume_is_not_found() {
        let dir = TempDir::new().unwrap();
        let result = RawVolume::open(&dir.path().join("missing"));
        assert!(matches!(result, Err(PipelineError::NotFound(_))));
    }

    #[test]
    fn test_read_out_of_bounds_region() {
        let dir = TempDir::new().unwrap();
        let info = VolumeInfo::new(VolumeShape::new([2, 2, 2], 1), VoxelType::U16);
        let volume = RawVolume::create(&dir.path().join("vol"), info, &ramp([2, 2, 2], 1)).unwrap();
        let result = volume.read_region(&Box3::new([0, 0, 0], [3, 2, 2]));
        assert!(matches!(result, Err(PipelineError::Bounds { .. })));
    }

    #[test]
    fn test_unsupported_version_rejected() {
        let mut info = VolumeInfo::new(VolumeShape::new([1, 1, 1], 1), VoxelType::U8);
        info.version = 99;
        assert!(info.validate().is_err());
    }

    #[test]
    fn test_volume_paths() {
        let (info, data) = volume_paths(Path::new("/data/brain.json"));
        assert_eq!(info, PathBuf::from("/data/brain.json"));
        assert_eq!(data, PathBuf::from("/data/brain.raw"));
        let (info, _) = volume_paths(Path::new("/data/brain"));
        assert_eq!(info, PathBuf::from("/data/brain.json"));
    }
}
