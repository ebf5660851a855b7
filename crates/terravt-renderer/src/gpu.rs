//! GPU Interface
//!
//! The compute procedures the virtual texturing pipeline dispatches, behind
//! the [`GpuDevice`] trait. Parameter blocks mirror the fixed layouts the
//! kernels consume; the kernels themselves live with the host renderer.

use crossbeam::channel::Sender;
use glam::{IVec2, UVec2};

use terravt_core::codec::SectorInfoRecord;
use terravt_core::VirtualTextureConfig;

/// Texture formats used by the virtual texturing resources
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextureFormat {
    /// Indirection entries (physical slot per virtual page)
    R16Uint,
    /// Sector-info records and packed page IDs
    R32Uint,
    /// Physical page colour and mask layers
    Rgba8Unorm,
}

/// Persistent texture descriptor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextureDesc {
    pub name: &'static str,
    pub width: u32,
    pub height: u32,
    pub layers: u32,
    pub mip_count: u32,
    pub format: TextureFormat,
}

/// Every persistent resource the pipeline needs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceLayout {
    pub indirection: TextureDesc,
    pub sector_info: TextureDesc,
    pub physical_base_color: TextureDesc,
    pub physical_mask: TextureDesc,
}

impl ResourceLayout {
    pub fn from_config(config: &VirtualTextureConfig) -> Self {
        let page = config.page_size_with_border();
        let physical = |name| TextureDesc {
            name,
            width: page,
            height: page,
            layers: config.max_physical_page_count,
            mip_count: 1,
            format: TextureFormat::Rgba8Unorm,
        };

        Self {
            indirection: TextureDesc {
                name: "vt_indirection",
                width: config.indirection_texture_size,
                height: config.indirection_texture_size,
                layers: 1,
                mip_count: config.indirection_mip_count(),
                format: TextureFormat::R16Uint,
            },
            sector_info: TextureDesc {
                name: "vt_sector_info",
                width: config.sector_count(),
                height: config.sector_count(),
                layers: 1,
                mip_count: 1,
                format: TextureFormat::R32Uint,
            },
            physical_base_color: physical("vt_physical_base_color"),
            physical_mask: physical("vt_physical_mask"),
        }
    }
}

/// What a remap dispatch does to its destination rectangle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemapMode {
    /// Copy `extent`² entries from the source mip
    Copy,
    /// Fill `extent`² entries with the empty slot
    Clear,
}

/// Parameter block of the indirection remap kernel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemapParams {
    pub mode: RemapMode,
    pub src_mip: u32,
    pub dst_mip: u32,
    /// Side of the rectangle in entries
    pub extent: u32,
    pub src_offset: UVec2,
    pub dst_offset: UVec2,
}

impl RemapParams {
    pub fn copy(src_mip: u32, src_offset: UVec2, dst_mip: u32, dst_offset: UVec2, extent: u32) -> Self {
        Self {
            mode: RemapMode::Copy,
            src_mip,
            dst_mip,
            extent,
            src_offset,
            dst_offset,
        }
    }

    pub fn clear(mip: u32, offset: UVec2, extent: u32) -> Self {
        Self {
            mode: RemapMode::Clear,
            src_mip: mip,
            dst_mip: mip,
            extent,
            src_offset: offset,
            dst_offset: offset,
        }
    }

    /// 4×4 thread groups, at least one
    pub fn thread_groups(&self) -> u32 {
        (self.extent >> 2).max(1)
    }
}

/// One buffered indirection write
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IndirectionWrite {
    pub x: u32,
    pub z: u32,
    pub mip: u32,
    pub slot: u16,
}

/// Which update dispatch a batch goes to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndirectionBatch {
    /// Writes targeting mip 0 only
    Mip0,
    /// Writes targeting any mip above 0
    AllMips,
}

/// Parameter block of the physical page render kernel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhysicalPageParams {
    pub sector: IVec2,
    /// Page offset inside the sector's image, in mip-0 pages
    pub local_page: UVec2,
    pub mip: u32,
    pub size_log2: u32,
    /// Target layer in the physical atlas
    pub slot: u16,
    /// Thread groups per side
    pub thread_groups: u32,
}

impl PhysicalPageParams {
    /// `[sector.x, sector.z, local.x, local.z, mip, size_log2]`
    pub fn to_words(&self) -> [u32; 6] {
        [
            self.sector.x as u32,
            self.sector.y as u32,
            self.local_page.x,
            self.local_page.y,
            self.mip,
            self.size_log2,
        ]
    }
}

/// One sector-info texel update
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SectorInfoWrite {
    pub sector: IVec2,
    pub record: SectorInfoRecord,
}

/// Feedback pass parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeedbackParams {
    /// Page-ID buffer size in texels
    pub buffer_size: UVec2,
    /// Sub-pixel sampled inside each downscaled block this frame
    pub dither: UVec2,
}

/// Identifies one readback request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ReadbackTicket(pub u64);

/// Delivered once per readback request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadbackCompletion {
    pub ticket: ReadbackTicket,
    pub data: Vec<u32>,
    pub has_error: bool,
}

/// Non-blocking copy of the page-ID buffer back to the host
#[derive(Debug, Clone)]
pub struct ReadbackRequest {
    pub ticket: ReadbackTicket,
    pub buffer_size: UVec2,
    pub completion: Sender<ReadbackCompletion>,
}

impl ReadbackRequest {
    /// Deliver the copied buffer; a closed channel means nobody waits anymore
    pub fn complete(self, data: Vec<u32>) {
        self.send(data, false);
    }

    pub fn fail(self) {
        self.send(Vec::new(), true);
    }

    fn send(self, data: Vec<u32>, has_error: bool) {
        let completion = ReadbackCompletion {
            ticket: self.ticket,
            data,
            has_error,
        };
        if self.completion.send(completion).is_err() {
            log::debug!("Readback {:?} completed after its receiver was dropped", self.ticket);
        }
    }
}

/// The GPU procedures the pipeline invokes
///
/// Calls are recorded in order; `submit` ends the frame's command stream.
pub trait GpuDevice {
    /// Create the persistent textures
    fn allocate_resources(&mut self, layout: &ResourceLayout);

    /// Bind the indirection, sector-info and physical textures for this frame's shading
    fn bind_resources(&mut self);

    fn remap_indirection_region(&mut self, params: &RemapParams);

    fn write_indirection_entries(&mut self, batch: IndirectionBatch, entries: &[IndirectionWrite]);

    fn clear_sector_info_texture(&mut self);

    fn update_sector_info_texture(&mut self, entries: &[SectorInfoWrite]);

    fn render_physical_page(&mut self, params: &PhysicalPageParams);

    /// (Re)create the page-ID buffer at `size`
    fn allocate_page_id_buffer(&mut self, size: UVec2);

    fn clear_page_id_buffer(&mut self, size: UVec2);

    /// Route this frame's visible-page output into the page-ID buffer
    fn begin_feedback(&mut self, params: &FeedbackParams);

    fn request_page_id_readback(&mut self, request: ReadbackRequest);

    /// Let pending asynchronous work make progress without submitting
    fn poll(&mut self);

    fn submit(&mut self);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam::channel::unbounded;

    #[test]
    fn test_layout_from_default_config() {
        let layout = ResourceLayout::from_config(&VirtualTextureConfig::default());
        assert_eq!(layout.indirection.width, 1024);
        assert_eq!(layout.indirection.mip_count, 9);
        assert_eq!(layout.indirection.format, TextureFormat::R16Uint);
        assert_eq!(layout.sector_info.width, 64);
        assert_eq!(layout.physical_base_color.width, 264);
        assert_eq!(layout.physical_mask.layers, 1023);
    }

    #[test]
    fn test_remap_thread_groups() {
        assert_eq!(RemapParams::clear(0, UVec2::ZERO, 256).thread_groups(), 64);
        assert_eq!(RemapParams::clear(8, UVec2::ZERO, 1).thread_groups(), 1);
    }

    #[test]
    fn test_readback_request_delivers_once() {
        let (tx, rx) = unbounded();
        let request = ReadbackRequest {
            ticket: ReadbackTicket(7),
            buffer_size: UVec2::new(2, 2),
            completion: tx,
        };
        request.complete(vec![1, 2, 3, 4]);

        let completion = rx.try_recv().unwrap();
        assert_eq!(completion.ticket, ReadbackTicket(7));
        assert_eq!(completion.data, vec![1, 2, 3, 4]);
        assert!(!completion.has_error);
        assert!(rx.try_recv().is_err());
    }
}
