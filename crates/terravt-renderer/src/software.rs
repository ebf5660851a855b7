//! Software Device
//!
//! CPU reference implementation of [`GpuDevice`]. Every kernel is emulated on
//! plain arrays so the whole pipeline can run headless: the indirection mips,
//! the sector-info texture, the contents of each physical slot and the
//! page-ID buffer. Readbacks complete after a configurable number of
//! submitted frames and can be dropped or failed on demand through a
//! [`ReadbackControl`] handle.

use std::collections::VecDeque;
use std::sync::Arc;

use glam::{IVec2, UVec2, Vec2, Vec3};
use parking_lot::Mutex;
use serde::Serialize;

use terravt_core::codec::{PageId, SectorInfoRecord, INVALID_SLOT};

use crate::context::VirtualTextureContext;
use crate::gpu::{
    FeedbackParams, GpuDevice, IndirectionBatch, IndirectionWrite, PhysicalPageParams, ReadbackRequest,
    RemapMode, RemapParams, ResourceLayout, SectorInfoWrite,
};

/// Dispatch counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DeviceCounters {
    pub submits: u64,
    pub remap_copies: u64,
    pub remap_clears: u64,
    pub indirection_writes: u64,
    pub sector_info_updates: u64,
    pub pages_rendered: u64,
    pub feedback_passes: u64,
    pub readbacks_requested: u64,
    pub readbacks_delivered: u64,
    pub readbacks_dropped: u64,
}

struct PendingReadback {
    request: ReadbackRequest,
    data: Vec<u32>,
    frames_left: u32,
}

struct ReadbackQueue {
    pending: VecDeque<PendingReadback>,
    latency: u32,
    drop_next: u32,
    fail_next: u32,
}

/// Shared handle steering readback delivery of a [`SoftwareDevice`]
#[derive(Clone)]
pub struct ReadbackControl {
    queue: Arc<Mutex<ReadbackQueue>>,
}

impl ReadbackControl {
    /// Frames between a request and its completion (at least one)
    pub fn set_latency(&self, frames: u32) {
        self.queue.lock().latency = frames.max(1);
    }

    /// Never complete the next `count` requests
    pub fn drop_next(&self, count: u32) {
        self.queue.lock().drop_next += count;
    }

    /// Complete the next `count` requests with the error flag set
    pub fn fail_next(&self, count: u32) {
        self.queue.lock().fail_next += count;
    }

    pub fn pending(&self) -> usize {
        self.queue.lock().pending.len()
    }
}

/// CPU emulation of the virtual texturing GPU resources
pub struct SoftwareDevice {
    indirection_size: u32,
    indirection: Vec<Vec<u16>>,
    sector_count: u32,
    sector_info: Vec<u32>,
    physical: Vec<Option<PhysicalPageParams>>,
    page_id_size: UVec2,
    page_id_buffer: Vec<u32>,
    visible_pages: Vec<u32>,
    last_feedback: Option<FeedbackParams>,
    bound: bool,
    readbacks: Arc<Mutex<ReadbackQueue>>,
    counters: DeviceCounters,
}

impl Default for SoftwareDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl SoftwareDevice {
    /// Create a device with one-frame readback latency; resources are
    /// created by [`GpuDevice::allocate_resources`]
    pub fn new() -> Self {
        Self {
            indirection_size: 0,
            indirection: Vec::new(),
            sector_count: 0,
            sector_info: Vec::new(),
            physical: Vec::new(),
            page_id_size: UVec2::ZERO,
            page_id_buffer: Vec::new(),
            visible_pages: Vec::new(),
            last_feedback: None,
            bound: false,
            readbacks: Arc::new(Mutex::new(ReadbackQueue {
                pending: VecDeque::new(),
                latency: 1,
                drop_next: 0,
                fail_next: 0,
            })),
            counters: DeviceCounters::default(),
        }
    }

    pub fn readback_control(&self) -> ReadbackControl {
        ReadbackControl {
            queue: self.readbacks.clone(),
        }
    }

    /// Packed page IDs the next feedback pass will output
    pub fn set_visible_pages(&mut self, pages: impl IntoIterator<Item = PageId>) {
        self.visible_pages.clear();
        self.visible_pages.extend(pages.into_iter().map(PageId::pack));
    }

    pub fn counters(&self) -> &DeviceCounters {
        &self.counters
    }

    pub fn is_bound(&self) -> bool {
        self.bound
    }

    pub fn last_feedback(&self) -> Option<FeedbackParams> {
        self.last_feedback
    }

    pub fn page_id_buffer(&self) -> &[u32] {
        &self.page_id_buffer
    }

    pub fn page_id_buffer_size(&self) -> UVec2 {
        self.page_id_size
    }

    pub fn indirection_mip_count(&self) -> u32 {
        self.indirection.len() as u32
    }

    /// Raw indirection entry, `None` outside the texture
    pub fn indirection_entry(&self, mip: u32, x: u32, z: u32) -> Option<u16> {
        let side = self.mip_side(mip)?;
        if x >= side || z >= side {
            return None;
        }
        Some(self.indirection[mip as usize][(z * side + x) as usize])
    }

    /// Resolve a page the way the sampling shader does: walk up the mip chain
    /// until a resident entry is found, at most to the image's top mip.
    ///
    /// Returns the slot and the mip it was found at.
    pub fn lookup(&self, page: PageId) -> Option<(u16, u32)> {
        (page.mip..=page.size_log2).find_map(|mip| {
            let shift = mip - page.mip;
            match self.indirection_entry(mip, page.x >> shift, page.z >> shift) {
                Some(slot) if slot != INVALID_SLOT => Some((slot, mip)),
                _ => None,
            }
        })
    }

    /// Count of non-empty entries over every mip
    pub fn resident_entry_count(&self) -> usize {
        self.indirection
            .iter()
            .map(|mip| mip.iter().filter(|&&slot| slot != INVALID_SLOT).count())
            .sum()
    }

    pub fn sector_record(&self, sector: IVec2) -> Option<SectorInfoRecord> {
        let index = self.sector_index(sector)?;
        Some(SectorInfoRecord(self.sector_info[index]))
    }

    /// Page last rendered into `slot`
    pub fn slot_content(&self, slot: u16) -> Option<PhysicalPageParams> {
        self.physical.get(slot as usize).copied().flatten()
    }

    fn mip_side(&self, mip: u32) -> Option<u32> {
        if (mip as usize) < self.indirection.len() {
            Some((self.indirection_size >> mip).max(1))
        } else {
            None
        }
    }

    fn sector_index(&self, sector: IVec2) -> Option<usize> {
        let count = self.sector_count as i32;
        if sector.x < 0 || sector.y < 0 || sector.x >= count || sector.y >= count {
            return None;
        }
        Some((sector.y * count + sector.x) as usize)
    }

    fn rect_in_bounds(&self, mip: u32, offset: UVec2, extent: u32) -> bool {
        self.mip_side(mip)
            .is_some_and(|side| offset.x + extent <= side && offset.y + extent <= side)
    }

    fn advance_readbacks(&mut self) {
        let mut ready = Vec::new();
        {
            let mut queue = self.readbacks.lock();
            for pending in queue.pending.iter_mut() {
                pending.frames_left = pending.frames_left.saturating_sub(1);
            }
            while queue.pending.front().is_some_and(|p| p.frames_left == 0) {
                if let Some(pending) = queue.pending.pop_front() {
                    ready.push(pending);
                }
            }
        }

        for pending in ready {
            self.counters.readbacks_delivered += 1;
            pending.request.complete(pending.data);
        }
    }
}

impl GpuDevice for SoftwareDevice {
    fn allocate_resources(&mut self, layout: &ResourceLayout) {
        let desc = &layout.indirection;
        self.indirection_size = desc.width;
        // Uninitialised memory until the first clear
        self.indirection = (0..desc.mip_count)
            .map(|mip| {
                let side = (desc.width >> mip).max(1) as usize;
                vec![0; side * side]
            })
            .collect();

        self.sector_count = layout.sector_info.width;
        self.sector_info = vec![0; (self.sector_count * self.sector_count) as usize];
        self.physical = vec![None; layout.physical_base_color.layers as usize];
        log::debug!(
            "Software device: {} indirection mips, {}x{} sectors, {} physical slots",
            self.indirection.len(),
            self.sector_count,
            self.sector_count,
            self.physical.len()
        );
    }

    fn bind_resources(&mut self) {
        self.bound = true;
    }

    fn remap_indirection_region(&mut self, params: &RemapParams) {
        let extent = params.extent;
        if !self.rect_in_bounds(params.dst_mip, params.dst_offset, extent)
            || !self.rect_in_bounds(params.src_mip, params.src_offset, extent)
        {
            debug_assert!(false, "remap outside the indirection texture: {params:?}");
            log::warn!("Ignoring out-of-bounds indirection remap {params:?}");
            return;
        }

        let Some(dst_side) = self.mip_side(params.dst_mip) else {
            return;
        };
        match params.mode {
            RemapMode::Clear => {
                self.counters.remap_clears += 1;
                let dst = &mut self.indirection[params.dst_mip as usize];
                for z in 0..extent {
                    let row = ((params.dst_offset.y + z) * dst_side + params.dst_offset.x) as usize;
                    dst[row..row + extent as usize].fill(INVALID_SLOT);
                }
            }
            RemapMode::Copy => {
                self.counters.remap_copies += 1;
                let Some(src_side) = self.mip_side(params.src_mip) else {
                    return;
                };
                let src = &self.indirection[params.src_mip as usize];
                let mut staged = Vec::with_capacity((extent * extent) as usize);
                for z in 0..extent {
                    let row = ((params.src_offset.y + z) * src_side + params.src_offset.x) as usize;
                    staged.extend_from_slice(&src[row..row + extent as usize]);
                }

                let dst = &mut self.indirection[params.dst_mip as usize];
                for (z, chunk) in staged.chunks(extent as usize).enumerate() {
                    let row = ((params.dst_offset.y + z as u32) * dst_side + params.dst_offset.x) as usize;
                    dst[row..row + extent as usize].copy_from_slice(chunk);
                }
            }
        }
    }

    fn write_indirection_entries(&mut self, batch: IndirectionBatch, entries: &[IndirectionWrite]) {
        for entry in entries {
            debug_assert_eq!(batch == IndirectionBatch::Mip0, entry.mip == 0, "{entry:?} in {batch:?}");
            let Some(side) = self.mip_side(entry.mip) else {
                log::warn!("Indirection write to missing mip {}", entry.mip);
                continue;
            };
            if entry.x >= side || entry.z >= side {
                log::warn!("Indirection write outside mip {}: {entry:?}", entry.mip);
                continue;
            }
            self.indirection[entry.mip as usize][(entry.z * side + entry.x) as usize] = entry.slot;
            self.counters.indirection_writes += 1;
        }
    }

    fn clear_sector_info_texture(&mut self) {
        self.sector_info.fill(0);
    }

    fn update_sector_info_texture(&mut self, entries: &[SectorInfoWrite]) {
        for entry in entries {
            match self.sector_index(entry.sector) {
                Some(index) => self.sector_info[index] = entry.record.0,
                None => log::warn!("Sector-info write outside the terrain: {}", entry.sector),
            }
        }
        self.counters.sector_info_updates += 1;
    }

    fn render_physical_page(&mut self, params: &PhysicalPageParams) {
        match self.physical.get_mut(params.slot as usize) {
            Some(slot) => {
                *slot = Some(*params);
                self.counters.pages_rendered += 1;
            }
            None => log::warn!("Physical page render into missing slot {}", params.slot),
        }
    }

    fn allocate_page_id_buffer(&mut self, size: UVec2) {
        self.page_id_size = size;
        self.page_id_buffer = vec![0; (size.x * size.y) as usize];
    }

    fn clear_page_id_buffer(&mut self, size: UVec2) {
        debug_assert_eq!(size, self.page_id_size);
        self.page_id_buffer.fill(0);
    }

    fn begin_feedback(&mut self, params: &FeedbackParams) {
        self.last_feedback = Some(*params);
        self.counters.feedback_passes += 1;
        let len = self.page_id_buffer.len();
        if self.visible_pages.len() > len {
            log::debug!(
                "Feedback buffer holds {len} texels, {} visible pages truncated",
                self.visible_pages.len() - len
            );
        }
        for (texel, &page) in self.page_id_buffer.iter_mut().zip(&self.visible_pages) {
            *texel = page;
        }
    }

    fn request_page_id_readback(&mut self, request: ReadbackRequest) {
        self.counters.readbacks_requested += 1;
        debug_assert_eq!(request.buffer_size, self.page_id_size);

        let mut queue = self.readbacks.lock();
        if queue.drop_next > 0 {
            queue.drop_next -= 1;
            self.counters.readbacks_dropped += 1;
            log::debug!("Dropping readback {:?}", request.ticket);
            return;
        }
        if queue.fail_next > 0 {
            queue.fail_next -= 1;
            drop(queue);
            request.fail();
            return;
        }

        let frames_left = queue.latency;
        queue.pending.push_back(PendingReadback {
            request,
            data: self.page_id_buffer.clone(),
            frames_left,
        });
    }

    fn poll(&mut self) {
        self.advance_readbacks();
    }

    fn submit(&mut self) {
        self.counters.submits += 1;
        self.bound = false;
        self.advance_readbacks();
    }
}

/// Pages the terrain shading would output for a camera over flat ground
///
/// Samples the camera position at mip 0, then `rings` rings of `per_ring`
/// points; ring `r` lies `8 << r` units away and is sampled at mip `r`.
pub fn sample_visible_pages(context: &VirtualTextureContext, camera: Vec3, rings: u32, per_ring: u32) -> Vec<PageId> {
    let centre = Vec2::new(camera.x, camera.z);
    let mut pages: Vec<PageId> = context.page_id_at(centre, 0).into_iter().collect();
    for ring in 0..rings {
        let radius = (8u32 << ring) as f32;
        for i in 0..per_ring {
            let angle = i as f32 / per_ring as f32 * std::f32::consts::TAU;
            let position = centre + Vec2::from_angle(angle) * radius;
            pages.extend(context.page_id_at(position, ring));
        }
    }
    pages
}
