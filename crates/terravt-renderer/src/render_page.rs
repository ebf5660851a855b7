//! Physical Page Rendering
//!
//! Works through the sorted page list a few pages per frame. Each page is
//! looked up in the page cache by its canonical key; a hit only refreshes the
//! page table entry, a miss evicts the least recently used slot, clears the
//! evicted page's entry if its owner still addresses it, and renders the new
//! page into the slot.

use serde::Serialize;

use terravt_core::codec::{LruKey, PageId};
use terravt_core::{ImageKey, LruCache};

use crate::context::VirtualTextureContext;
use crate::gpu::GpuDevice;

/// What one rendering frame did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RenderReport {
    pub rendered: usize,
    pub cache_hits: usize,
    pub evictions_cleared: usize,
    pub unknown_pages: usize,
}

/// Owner of the page cache and the per-frame page budget
#[derive(Debug)]
pub struct PageRenderer {
    cache: LruCache<LruKey, u16>,
    pages: Vec<u32>,
    cursor: usize,
    pages_per_frame: usize,
}

impl PageRenderer {
    /// Create the cache, filled with one placeholder per physical slot
    pub fn new(slot_count: u32, pages_per_frame: u32) -> Self {
        let mut cache = LruCache::new(slot_count as usize);
        for slot in 0..slot_count {
            cache.insert(LruKey::placeholder(slot), slot as u16);
        }
        Self {
            cache,
            pages: Vec::new(),
            cursor: 0,
            pages_per_frame: pages_per_frame as usize,
        }
    }

    pub fn cache(&self) -> &LruCache<LruKey, u16> {
        &self.cache
    }

    /// Begin a new sorted page list
    pub fn start(&mut self, pages: Vec<u32>) {
        log::debug!("Rendering pass over {} pages", pages.len());
        self.pages = pages;
        self.cursor = 0;
    }

    pub fn is_finished(&self) -> bool {
        self.cursor >= self.pages.len()
    }

    /// Pages not yet visited
    pub fn remaining(&self) -> usize {
        self.pages.len() - self.cursor.min(self.pages.len())
    }

    /// Drop the current list without rendering the rest
    pub fn cancel(&mut self) {
        self.pages.clear();
        self.cursor = 0;
    }

    /// Process pages until the frame budget or the indirection batches run
    /// out, then flush the page table writes
    pub fn render_frame(&mut self, context: &mut VirtualTextureContext, device: &mut impl GpuDevice) -> RenderReport {
        let _span = tracing::trace_span!("vt.render_pages").entered();
        let mut report = RenderReport::default();

        while !self.is_finished()
            && report.rendered < self.pages_per_frame
            && context.indirection.is_update_array_far_from_full()
        {
            let page = PageId::unpack(self.pages[self.cursor]);
            self.cursor += 1;
            self.process_page(context, device, page, &mut report);
        }

        context.indirection.flush(device);
        report
    }

    fn process_page(
        &mut self,
        context: &mut VirtualTextureContext,
        device: &mut impl GpuDevice,
        page: PageId,
        report: &mut RenderReport,
    ) {
        let max_shift = context.config().max_virtual_page_size_shift();
        if page.mip > page.size_log2 || page.size_log2 > max_shift {
            report.unknown_pages += 1;
            log::warn!("Ignoring malformed page {page:?}");
            return;
        }

        let origin = page.region_origin();
        let image = ImageKey {
            x: origin.x,
            z: origin.y,
            size: page.image_size_pages(),
        };
        let Some(sector) = context.owner_of(&image) else {
            report.unknown_pages += 1;
            log::warn!("No sector owns the image of page {page:?}");
            return;
        };

        let local_page = page.local_page();
        let key = LruKey::encode(sector, local_page, page.mip, page.size_log2, max_shift);

        let slot = match self.cache.touch(&key).copied() {
            Some(slot) => {
                report.cache_hits += 1;
                slot
            }
            None => {
                let Some((evicted, slot)) = self.cache.remove_last() else {
                    debug_assert!(false, "page cache is empty");
                    return;
                };
                if !evicted.is_placeholder() && clear_evicted_entry(context, evicted, max_shift) {
                    report.evictions_cleared += 1;
                }

                let inserted = self.cache.insert(key, slot);
                debug_assert!(inserted, "page cache rejected {key:?}");
                context.physical.render(device, sector, local_page, page, slot);
                report.rendered += 1;
                slot
            }
        };

        context.indirection.add_update(page, slot);
    }
}

/// Clear the entry an evicted page occupies in its owner's current image
///
/// Skipped when the owner is gone or the page is finer than the owner's
/// current resolution.
fn clear_evicted_entry(context: &mut VirtualTextureContext, evicted: LruKey, max_shift: u32) -> bool {
    let sector = evicted.owner_sector(max_shift);
    let Some(image) = context.image_of(sector).filter(|image| image.is_allocated()) else {
        return false;
    };

    let (_, physical_mip) = evicted.decode();
    let size_log2 = image.size_log2();
    let Some(mip) = (physical_mip + size_log2).checked_sub(max_shift) else {
        return false;
    };

    let local = evicted.sector_local_page(max_shift) >> physical_mip;
    let page = PageId::new((image.x >> mip) + local.x, (image.z >> mip) + local.y, mip, size_log2);
    context.indirection.add_clear(page);
    true
}
