//! Virtual Texture Context
//!
//! The state every stage shares: configuration, the image atlas, the tracked
//! sectors and their images, and the GPU-side components. Passed explicitly
//! by reference to each stage.

use ahash::{AHashMap, AHashSet};
use glam::{UVec2, Vec2};

use terravt_core::codec::PageId;
use terravt_core::math::sector_of;
use terravt_core::{ImageInfo, ImageKey, Sector, VirtualImageAtlas, VirtualTextureConfig, VtResult};

use crate::gpu::GpuDevice;
use crate::indirection::IndirectionTexture;
use crate::physical::PhysicalPageAtlas;
use crate::sector_info::SectorInfoTexture;

/// Shared state of the virtual texturing system
#[derive(Debug)]
pub struct VirtualTextureContext {
    config: VirtualTextureConfig,
    pub atlas: VirtualImageAtlas,
    pub indirection: IndirectionTexture,
    pub physical: PhysicalPageAtlas,
    pub sector_info: SectorInfoTexture,
    sectors: AHashMap<Sector, ImageInfo>,
    image_to_sector: AHashMap<ImageKey, Sector>,
    images: AHashSet<ImageKey>,
}

impl VirtualTextureContext {
    /// Validate `config` and create the GPU-side components on `device`
    pub fn new(config: VirtualTextureConfig, device: &mut impl GpuDevice) -> VtResult<Self> {
        config.validate()?;
        Ok(Self {
            atlas: VirtualImageAtlas::from_config(&config),
            indirection: IndirectionTexture::new(&config, device),
            physical: PhysicalPageAtlas::new(&config),
            sector_info: SectorInfoTexture::new(&config),
            sectors: AHashMap::new(),
            image_to_sector: AHashMap::new(),
            images: AHashSet::new(),
            config,
        })
    }

    pub fn config(&self) -> &VirtualTextureConfig {
        &self.config
    }

    /// Number of tracked sectors, allocated or not
    pub fn sector_count(&self) -> usize {
        self.sectors.len()
    }

    pub fn is_tracked(&self, sector: Sector) -> bool {
        self.sectors.contains_key(&sector)
    }

    /// Current image of a tracked sector (`size == 0` if unallocated)
    pub fn image_of(&self, sector: Sector) -> Option<ImageInfo> {
        self.sectors.get(&sector).copied()
    }

    /// Sector owning the image whose region is `key`
    pub fn owner_of(&self, key: &ImageKey) -> Option<Sector> {
        self.image_to_sector.get(key).copied()
    }

    /// Tracked sectors in a stable order
    pub fn sorted_sectors(&self) -> Vec<(Sector, ImageInfo)> {
        let mut sectors: Vec<_> = self.sectors.iter().map(|(s, i)| (*s, *i)).collect();
        sectors.sort_unstable_by_key(|(s, _)| (s.x, s.y));
        sectors
    }

    /// Regions of every allocated image
    pub fn image_keys(&self) -> impl Iterator<Item = &ImageKey> {
        self.images.iter()
    }

    pub fn image_count(&self) -> usize {
        self.images.len()
    }

    /// Start tracking `sector` without an image
    pub fn track_sector(&mut self, sector: Sector) -> bool {
        if self.sectors.contains_key(&sector) {
            return false;
        }
        self.sectors.insert(sector, ImageInfo::default());
        true
    }

    /// Stop tracking `sector`: free its region and clear its page table entries
    pub fn untrack_sector(&mut self, device: &mut impl GpuDevice, sector: Sector) -> Option<ImageInfo> {
        let image = self.sectors.remove(&sector)?;
        if image.is_allocated() {
            let key = image.key();
            self.image_to_sector.remove(&key);
            self.images.remove(&key);
            self.atlas.remove_sector(sector);
            self.indirection.remove_virtual_image(device, &image);
            log::debug!("Sector {sector} left the preload range, freed {key:?}");
        }
        Some(image)
    }

    /// Record `new` as the image of `sector` and return the previous one
    ///
    /// Only the mappings change; the caller remaps and frees the old region.
    pub fn swap_image(&mut self, sector: Sector, new: ImageInfo) -> ImageInfo {
        let old = self.sectors.insert(sector, new).unwrap_or_default();
        if old.is_allocated() {
            let old_key = old.key();
            self.image_to_sector.remove(&old_key);
            self.images.remove(&old_key);
        }
        let key = new.key();
        self.image_to_sector.insert(key, sector);
        self.images.insert(key);
        old
    }

    /// Page covering world position `position_xz` at `mip`, if its sector has an image
    ///
    /// The mip is clamped to the image's coarsest level.
    pub fn page_id_at(&self, position_xz: Vec2, mip: u32) -> Option<PageId> {
        let sector_size = self.config.sector_size();
        let sector = sector_of(position_xz, sector_size);
        let image = self.image_of(sector).filter(ImageInfo::is_allocated)?;

        let local = (position_xz - sector.as_vec2() * sector_size as f32) / sector_size as f32;
        let page = (local * image.size as f32)
            .floor()
            .as_uvec2()
            .min(UVec2::splat(image.size - 1));
        let log = image.size_log2();
        let mip = mip.min(log);
        let position = UVec2::new(image.x, image.z) + page;
        Some(PageId::new(position.x >> mip, position.y >> mip, mip, log))
    }

    /// Check that the sector map, the image maps and the atlas agree
    pub fn is_consistent(&self) -> bool {
        let mut allocated = 0;
        for (sector, image) in &self.sectors {
            if !image.is_allocated() {
                continue;
            }
            allocated += 1;
            let key = image.key();
            if self.owner_of(&key) != Some(*sector) || !self.images.contains(&key) {
                log::warn!("Sector {sector} and its image {key:?} are not mapped both ways");
                return false;
            }
            if !self.atlas.is_node_used(image.node_index) {
                log::warn!("Image of sector {sector} sits on a free atlas node");
                return false;
            }
        }

        if allocated != self.images.len() || allocated != self.image_to_sector.len() {
            log::warn!(
                "{allocated} allocated sectors but {} images and {} owners",
                self.images.len(),
                self.image_to_sector.len()
            );
            return false;
        }
        if self.atlas.occupied_count() != allocated {
            log::warn!("{} atlas nodes occupied for {allocated} images", self.atlas.occupied_count());
            return false;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::ResourceLayout;
    use crate::software::SoftwareDevice;
    use glam::IVec2;

    fn setup() -> (SoftwareDevice, VirtualTextureContext) {
        let config = VirtualTextureConfig::with_terrain_size(512);
        let mut device = SoftwareDevice::new();
        device.allocate_resources(&ResourceLayout::from_config(&config));
        let context = VirtualTextureContext::new(config, &mut device).unwrap();
        (device, context)
    }

    #[test]
    fn test_rejects_invalid_config() {
        let mut device = SoftwareDevice::new();
        let config = VirtualTextureConfig::with_terrain_size(500);
        assert!(VirtualTextureContext::new(config, &mut device).is_err());
    }

    #[test]
    fn test_swap_and_untrack_keep_maps_in_sync() {
        let (mut device, mut context) = setup();
        let sector = IVec2::new(2, 1);
        assert!(context.track_sector(sector));
        assert!(!context.track_sector(sector));
        assert!(context.is_consistent());

        let first = context.atlas.insert_image(sector, 4096).unwrap();
        assert_eq!(context.swap_image(sector, first), ImageInfo::default());
        assert_eq!(context.owner_of(&first.key()), Some(sector));
        assert!(context.is_consistent());

        let second = context.atlas.insert_image(sector, 8192).unwrap();
        let old = context.swap_image(sector, second);
        context.atlas.remove_image(&old);
        assert_eq!(old, first);
        assert_eq!(context.owner_of(&first.key()), None);
        assert_eq!(context.image_count(), 1);
        assert!(context.is_consistent());

        assert_eq!(context.untrack_sector(&mut device, sector), Some(second));
        assert_eq!(context.sector_count(), 0);
        assert_eq!(context.image_count(), 0);
        assert_eq!(context.atlas.occupied_count(), 0);
        assert!(context.is_consistent());
    }

    #[test]
    fn test_page_id_at() {
        let (_, mut context) = setup();
        let sector = IVec2::new(1, 0);
        context.track_sector(sector);
        assert_eq!(context.page_id_at(Vec2::new(70.0, 10.0), 0), None);

        // 16 pages at the origin of the atlas
        let image = context.atlas.insert_image(sector, 4096).unwrap();
        context.swap_image(sector, image);
        assert_eq!((image.x, image.z, image.size), (0, 0, 16));

        // Quarter of the way into the sector along x, half along z
        let page = context.page_id_at(Vec2::new(80.0, 32.0), 0).unwrap();
        assert_eq!(page, PageId::new(4, 8, 0, 4));
        let coarse = context.page_id_at(Vec2::new(80.0, 32.0), 2).unwrap();
        assert_eq!(coarse, PageId::new(1, 2, 2, 4));
        let clamped = context.page_id_at(Vec2::new(127.9, 63.9), 9).unwrap();
        assert_eq!(clamped, PageId::new(0, 0, 4, 4));
    }
}
