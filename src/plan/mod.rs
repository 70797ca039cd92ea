//! Chunk planning: cutting a volume into overlapping regions.

mod planner;

pub use planner::{
    available_memory_bytes, dominant_axis, ChunkPlan, ChunkPlanner, ChunkRegion, ChunkTarget,
};
