//! Indirection Texture
//!
//! The page table: one `u16` physical slot per virtual page per mip level,
//! [`INVALID_SLOT`] when nothing is resident. Writes are buffered into two
//! bounded batches (mip 0 and everything above) and flushed once per frame;
//! region clears and remaps are dispatched immediately.

use glam::UVec2;

use terravt_core::codec::{PageId, INVALID_SLOT};
use terravt_core::{ImageInfo, VirtualTextureConfig};

use crate::gpu::{GpuDevice, IndirectionBatch, IndirectionWrite, RemapParams};

/// CPU side of the indirection texture
#[derive(Debug)]
pub struct IndirectionTexture {
    size: u32,
    mip_count: u32,
    batch_capacity: usize,
    mip0_writes: Vec<IndirectionWrite>,
    mip_writes: Vec<IndirectionWrite>,
}

impl IndirectionTexture {
    /// Set up the write batches and clear every mip of the texture
    pub fn new(config: &VirtualTextureConfig, device: &mut impl GpuDevice) -> Self {
        let batch_capacity = config.update_indirection_per_frame as usize;
        let texture = Self {
            size: config.indirection_texture_size,
            mip_count: config.indirection_mip_count(),
            batch_capacity,
            mip0_writes: Vec::with_capacity(batch_capacity),
            mip_writes: Vec::with_capacity(batch_capacity),
        };

        for mip in 0..texture.mip_count {
            let side = (texture.size >> mip).max(1);
            device.remap_indirection_region(&RemapParams::clear(mip, UVec2::ZERO, side));
        }
        texture
    }

    /// Side of mip 0 in pages
    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn mip_count(&self) -> u32 {
        self.mip_count
    }

    /// Buffered writes not yet flushed
    pub fn pending_writes(&self) -> usize {
        self.mip0_writes.len() + self.mip_writes.len()
    }

    /// Both batches can take another page and its clear
    pub fn is_update_array_far_from_full(&self) -> bool {
        self.mip0_writes.len() + 2 < self.batch_capacity && self.mip_writes.len() + 2 < self.batch_capacity
    }

    /// Buffer `slot` as the entry of `page`
    pub fn add_update(&mut self, page: PageId, slot: u16) {
        let (batch, name) = if page.mip == 0 {
            (&mut self.mip0_writes, "mip 0")
        } else {
            (&mut self.mip_writes, "mip")
        };

        if batch.len() >= self.batch_capacity {
            debug_assert!(false, "indirection {name} batch is full");
            log::warn!("Dropping indirection write for {page:?}: {name} batch is full");
            return;
        }
        batch.push(IndirectionWrite {
            x: page.x,
            z: page.z,
            mip: page.mip,
            slot,
        });
    }

    /// Buffer a clear of `page`'s entry
    pub fn add_clear(&mut self, page: PageId) {
        self.add_update(page, INVALID_SLOT);
    }

    /// Dispatch both batches and reset them
    pub fn flush(&mut self, device: &mut impl GpuDevice) {
        if !self.mip0_writes.is_empty() {
            device.write_indirection_entries(IndirectionBatch::Mip0, &self.mip0_writes);
        }
        if !self.mip_writes.is_empty() {
            device.write_indirection_entries(IndirectionBatch::AllMips, &self.mip_writes);
        }
        self.mip0_writes.clear();
        self.mip_writes.clear();
    }

    /// Clear every mip of an image's region
    pub fn remove_virtual_image(&self, device: &mut impl GpuDevice, image: &ImageInfo) {
        if !image.is_allocated() {
            return;
        }
        let origin = UVec2::new(image.x, image.z);
        for mip in 0..=image.size_log2() {
            device.remap_indirection_region(&RemapParams::clear(mip, origin >> mip, image.size >> mip));
        }
    }

    /// Move an image's entries from `old` to `new` after a resize
    ///
    /// Growing shifts every mip of the old region one or more levels up in
    /// the new one, leaving the new finest mips empty. Shrinking drops the
    /// old finest mips and shifts the rest down.
    pub fn remap_virtual_image(&self, device: &mut impl GpuDevice, old: &ImageInfo, new: &ImageInfo) {
        debug_assert!(old.is_allocated() && new.is_allocated());
        debug_assert_ne!(old.size, new.size, "remap between equal sizes");
        debug_assert!(!old.overlaps(new), "remap between overlapping regions");

        let old_origin = UVec2::new(old.x, old.z);
        let new_origin = UVec2::new(new.x, new.z);
        let old_log = old.size_log2();
        let new_log = new.size_log2();

        if new.size > old.size {
            let delta = new_log - old_log;
            for mip in 0..=old_log {
                device.remap_indirection_region(&RemapParams::copy(
                    mip,
                    old_origin >> mip,
                    mip + delta,
                    new_origin >> (mip + delta),
                    old.size >> mip,
                ));
            }
        } else {
            let delta = old_log - new_log;
            for mip in 0..delta {
                device.remap_indirection_region(&RemapParams::clear(mip, old_origin >> mip, old.size >> mip));
            }
            for mip in 0..=new_log {
                device.remap_indirection_region(&RemapParams::copy(
                    mip + delta,
                    old_origin >> (mip + delta),
                    mip,
                    new_origin >> mip,
                    new.size >> mip,
                ));
            }
        }
    }
}
