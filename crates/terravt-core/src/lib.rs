//! # Terravt Core
//!
//! CPU-side foundation of the Terravt terrain virtual texturing system.
//!
//! This crate provides the data structures that do not touch the GPU:
//! - **Config**: every tunable of the streaming system, serde-loadable and validated
//! - **Codec**: bit-packed page IDs, LRU keys and sector-info records
//! - **Atlas**: array-indexed quadtree allocator for the indirection address space
//! - **LRU**: arena-backed least-recently-used cache for physical page slots
//! - **LOD**: camera-distance LOD selection and sector radius search
//! - **Job**: spawn-then-join background worker used by the feedback pipeline
//! - **Sweep**: allocator stress scenario shared by the tests and the CLI

pub mod atlas;
pub mod codec;
pub mod config;
pub mod job;
pub mod lod;
pub mod lru;
pub mod math;
pub mod sweep;

pub use atlas::{ImageInfo, ImageKey, VirtualImageAtlas};
pub use codec::{LruKey, PageId, SectorInfoRecord};
pub use config::VirtualTextureConfig;
pub use job::BackgroundJob;
pub use lru::LruCache;
pub use math::Sector;
pub use sweep::{run_allocator_sweep, SweepReport};

use thiserror::Error;

/// Virtual texturing errors
#[derive(Error, Debug)]
pub enum VirtualTextureError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Terrain size {terrain_size} is not a multiple of the sector size {sector_size}")]
    TerrainNotSectorAligned { terrain_size: u32, sector_size: u32 },

    #[error("Background job '{0}' panicked")]
    JobPanicked(String),

    #[error("Failed to spawn background job: {0}")]
    JobSpawn(#[source] std::io::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type for virtual texturing operations
pub type VtResult<T> = Result<T, VirtualTextureError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = VirtualTextureError::TerrainNotSectorAligned {
            terrain_size: 1000,
            sector_size: 64,
        };
        assert_eq!(
            err.to_string(),
            "Terrain size 1000 is not a multiple of the sector size 64"
        );

        let err = VirtualTextureError::JobPanicked("deduplicate".into());
        assert_eq!(err.to_string(), "Background job 'deduplicate' panicked");
    }
}
