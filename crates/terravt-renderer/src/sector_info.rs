//! Sector-Info Texture
//!
//! One texel per terrain sector locating its current image region, rewritten
//! in full (clear then update) whenever the set of images changes.

use terravt_core::codec::SectorInfoRecord;
use terravt_core::{ImageInfo, Sector, VirtualTextureConfig};

use crate::gpu::{GpuDevice, SectorInfoWrite};

#[derive(Debug)]
pub struct SectorInfoTexture {
    capacity: usize,
    pending: Vec<SectorInfoWrite>,
}

impl SectorInfoTexture {
    pub fn new(config: &VirtualTextureConfig) -> Self {
        let capacity = config.max_preload_sector as usize;
        Self {
            capacity,
            pending: Vec::with_capacity(capacity),
        }
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Buffer the record of an allocated image
    pub fn update_sector(&mut self, sector: Sector, image: &ImageInfo) {
        if self.pending.len() >= self.capacity {
            debug_assert!(false, "sector-info batch is full");
            log::warn!("Dropping sector-info record of {sector}: batch is full");
            return;
        }
        self.pending.push(SectorInfoWrite {
            sector,
            record: SectorInfoRecord::encode(image.x, image.z, image.size),
        });
    }

    /// Clear the texture and write every buffered record
    pub fn flush(&mut self, device: &mut impl GpuDevice) {
        device.clear_sector_info_texture();
        if !self.pending.is_empty() {
            device.update_sector_info_texture(&self.pending);
        }
        self.pending.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::ResourceLayout;
    use crate::software::SoftwareDevice;
    use glam::{IVec2, UVec2};

    #[test]
    fn test_flush_replaces_previous_records() {
        let config = VirtualTextureConfig::with_terrain_size(512);
        let mut device = SoftwareDevice::new();
        device.allocate_resources(&ResourceLayout::from_config(&config));
        let mut texture = SectorInfoTexture::new(&config);

        let image = ImageInfo { node_index: 5, x: 256, z: 0, size: 256 };
        texture.update_sector(IVec2::new(2, 3), &image);
        texture.flush(&mut device);
        assert_eq!(texture.pending_len(), 0);
        let record = device.sector_record(IVec2::new(2, 3)).unwrap();
        assert_eq!(record.decode(), (UVec2::new(256, 0), 256));

        texture.update_sector(IVec2::new(1, 1), &ImageInfo { node_index: 9, x: 8, z: 16, size: 8 });
        texture.flush(&mut device);
        assert_eq!(device.sector_record(IVec2::new(2, 3)), Some(SectorInfoRecord(0)));
        assert_eq!(device.sector_record(IVec2::new(1, 1)).unwrap().decode(), (UVec2::new(8, 16), 8));
    }
}
