//! Physical Page Atlas
//!
//! Fixed array of equally sized page slots (base colour and mask layers).
//! Slots are addressed by index; which page a slot holds is decided by the
//! page cache.

use glam::UVec2;

use terravt_core::codec::PageId;
use terravt_core::{Sector, VirtualTextureConfig};

use crate::gpu::{GpuDevice, PhysicalPageParams};

#[derive(Debug, Clone, Copy)]
pub struct PhysicalPageAtlas {
    page_count: u32,
    page_size_with_border: u32,
}

impl PhysicalPageAtlas {
    pub fn new(config: &VirtualTextureConfig) -> Self {
        Self {
            page_count: config.max_physical_page_count,
            page_size_with_border: config.page_size_with_border(),
        }
    }

    /// Number of slots
    pub fn page_count(&self) -> u32 {
        self.page_count
    }

    /// Thread groups per side of one page render (8×8 threads, 2×2 texels each)
    pub fn thread_groups(&self) -> u32 {
        self.page_size_with_border / 4
    }

    /// Render `page` of `sector` into `slot`
    pub fn render(&self, device: &mut impl GpuDevice, sector: Sector, local_page: UVec2, page: PageId, slot: u16) {
        debug_assert!((slot as u32) < self.page_count, "slot {slot} outside the physical atlas");
        device.render_physical_page(&PhysicalPageParams {
            sector,
            local_page,
            mip: page.mip,
            size_log2: page.size_log2,
            slot,
            thread_groups: self.thread_groups(),
        });
    }
}
