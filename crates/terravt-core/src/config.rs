//! Virtual Texture Configuration
//!
//! All tunables of the streaming system. Sizes are expressed either in
//! texels, in pages (one page = `page_size()` texels) or in sectors, as
//! noted per field.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::math::ceil_log2;
use crate::{VirtualTextureError, VtResult};

/// Number of phases in the feedback dither schedule
pub const DITHER_PERIOD: u32 = 64;

/// Side of the Bayer dither matrix
pub const DITHER_SIZE: u32 = 8;

/// Virtual texture configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VirtualTextureConfig {
    /// Terrain extent in world units (square, multiple of the sector size)
    pub terrain_size: u32,
    /// log2 of the sector size in world units
    pub sector_size_shift: u32,
    /// log2 of the page size in texels
    pub page_size_shift: u32,
    /// Filtering border on each side of a physical page, in texels
    pub border_size: u32,
    /// Side of the indirection texture mip 0, in pages
    pub indirection_texture_size: u32,
    /// Smallest virtual image a sector may get, in texels
    pub minimal_virtual_image_size: u32,
    /// Texels per world unit at the highest LOD
    pub max_texel_density: u32,
    /// Squared distance at which the first LOD step happens
    pub switch_distance: f32,
    /// Squared XZ distance the camera must travel before LODs are recomputed
    pub camera_position_sqr_delta_threshold: f32,
    /// Preload radius around the camera sector, in sectors
    pub sector_preload_distance: f32,
    /// Capacity of the sector-info write batch
    pub max_preload_sector: u32,
    /// Number of physical page slots
    pub max_physical_page_count: u32,
    /// Pages rendered into the physical atlas per frame
    pub rendering_page_per_frame: u32,
    /// Capacity of each indirection write batch
    pub update_indirection_per_frame: u32,
    /// Downscale factor of the feedback buffer relative to the viewport
    pub page_id_downscale: u32,
    /// Frames to wait for a readback before giving up
    pub readback_timeout: u32,
    /// Initial capacity of the deduplicated page list
    pub max_deduplicated_page_count: u32,
}

impl Default for VirtualTextureConfig {
    fn default() -> Self {
        Self {
            terrain_size: 4096,
            sector_size_shift: 6,
            page_size_shift: 8,
            border_size: 4,
            indirection_texture_size: 1024,
            minimal_virtual_image_size: 2048,
            max_texel_density: 1024,
            switch_distance: 64.0 * 64.0 * 1.5,
            camera_position_sqr_delta_threshold: 4.0,
            sector_preload_distance: 6.0,
            max_preload_sector: 256,
            // ~400 pages at 1080p, ~700 at 1440p, over 1200 at 4K
            max_physical_page_count: 1023,
            rendering_page_per_frame: 16,
            update_indirection_per_frame: 64,
            page_id_downscale: 8,
            readback_timeout: 8,
            max_deduplicated_page_count: 256,
        }
    }
}

impl VirtualTextureConfig {
    /// Create the default configuration for a terrain of the given extent
    pub fn with_terrain_size(terrain_size: u32) -> Self {
        Self {
            terrain_size,
            ..Self::default()
        }
    }

    /// Sector size in world units
    pub fn sector_size(&self) -> u32 {
        1 << self.sector_size_shift
    }

    /// Number of sectors along one side of the terrain
    pub fn sector_count(&self) -> u32 {
        self.terrain_size >> self.sector_size_shift
    }

    /// Page size in texels
    pub fn page_size(&self) -> u32 {
        1 << self.page_size_shift
    }

    /// Physical page side including the border on both sides
    pub fn page_size_with_border(&self) -> u32 {
        self.page_size() + 2 * self.border_size
    }

    /// Highest virtual image size of a sector, in texels
    pub fn highest_resolution(&self) -> u32 {
        self.sector_size() * self.max_texel_density
    }

    /// log2 of the pages per sector side at the highest resolution
    pub fn max_virtual_page_size_shift(&self) -> u32 {
        ceil_log2(self.highest_resolution()).saturating_sub(self.page_size_shift)
    }

    /// Pages per sector side at the highest resolution
    pub fn max_virtual_page_size(&self) -> u32 {
        1 << self.max_virtual_page_size_shift()
    }

    /// Smallest virtual image, in pages
    pub fn minimal_image_pages(&self) -> u32 {
        self.minimal_virtual_image_size >> self.page_size_shift
    }

    /// Mip levels of the indirection texture (one per physical mip)
    pub fn indirection_mip_count(&self) -> u32 {
        self.max_virtual_page_size_shift() + 1
    }

    /// Check every size relationship the allocator and codecs rely on
    pub fn validate(&self) -> VtResult<()> {
        let invalid = |msg: String| Err(VirtualTextureError::InvalidConfig(msg));

        if self.terrain_size == 0 {
            return invalid("terrain_size must be non-zero".into());
        }
        if self.terrain_size % self.sector_size() != 0 {
            return Err(VirtualTextureError::TerrainNotSectorAligned {
                terrain_size: self.terrain_size,
                sector_size: self.sector_size(),
            });
        }
        if !self.max_texel_density.is_power_of_two() {
            return invalid(format!(
                "max_texel_density {} must be a power of two",
                self.max_texel_density
            ));
        }
        if self.highest_resolution() < self.page_size() {
            return invalid("highest resolution is smaller than one page".into());
        }
        if self.max_virtual_page_size_shift() > 15 {
            return invalid("too many mip levels for the 4-bit page ID fields".into());
        }
        if !self.indirection_texture_size.is_power_of_two()
            || self.indirection_texture_size > 4096
        {
            return invalid(format!(
                "indirection_texture_size {} must be a power of two no larger than 4096",
                self.indirection_texture_size
            ));
        }
        if self.max_virtual_page_size() > self.indirection_texture_size {
            return invalid("a full-resolution image does not fit the indirection texture".into());
        }
        if !self.minimal_virtual_image_size.is_power_of_two()
            || self.minimal_virtual_image_size < self.page_size()
            || self.minimal_virtual_image_size > self.highest_resolution()
        {
            return invalid(format!(
                "minimal_virtual_image_size {} must be a power of two between one page and the highest resolution",
                self.minimal_virtual_image_size
            ));
        }
        if self.sector_count() > (1 << 16) {
            return invalid("terrain has too many sectors for 24-bit LRU keys".into());
        }
        if self.switch_distance <= 0.0 {
            return invalid("switch_distance must be positive".into());
        }
        let preload_side = 2 * self.sector_preload_distance.ceil() as u32 + 1;
        if preload_side * preload_side > self.max_preload_sector {
            return invalid(format!(
                "preload distance {} can track more than max_preload_sector ({}) sectors",
                self.sector_preload_distance, self.max_preload_sector
            ));
        }
        if self.max_physical_page_count == 0 || self.max_physical_page_count >= u16::MAX as u32 {
            return invalid("max_physical_page_count must be in 1..65535".into());
        }
        if self.update_indirection_per_frame < 4 {
            return invalid("update_indirection_per_frame must be at least 4".into());
        }
        if !self.page_id_downscale.is_power_of_two() || self.page_id_downscale > DITHER_SIZE {
            return invalid(format!(
                "page_id_downscale {} must be a power of two no larger than {}",
                self.page_id_downscale, DITHER_SIZE
            ));
        }
        if self.readback_timeout == 0 {
            return invalid("readback_timeout must be at least one frame".into());
        }
        Ok(())
    }

    /// Load and validate a configuration from a JSON file
    pub fn from_json_file(path: &Path) -> VtResult<Self> {
        let text = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&text)?;
        config.validate()?;
        log::info!("Loaded virtual texture config from {}", path.display());
        Ok(config)
    }

    /// Serialize to pretty-printed JSON
    pub fn to_json_string(&self) -> VtResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Write the configuration to a JSON file
    pub fn save_json(&self, path: &Path) -> VtResult<()> {
        std::fs::write(path, self.to_json_string()?)?;
        Ok(())
    }
}
