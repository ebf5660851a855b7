//! Feedback Pass
//!
//! Prepares the page-ID buffer the terrain shading writes visible pages
//! into. The buffer is a downscaled copy of the viewport; which pixel of each
//! downscaled block gets sampled rotates through an 8×8 Bayer pattern so the
//! whole screen is covered over 64 frames.

use glam::UVec2;

use terravt_core::config::{DITHER_PERIOD, DITHER_SIZE};

use crate::gpu::{FeedbackParams, GpuDevice};

/// Ordered dither visiting every cell of an 8×8 block once per period
pub const BAYER_DITHER_8X8: [[u32; 8]; 8] = [
    [0, 32, 8, 40, 2, 34, 10, 42],
    [48, 16, 56, 24, 50, 18, 58, 26],
    [12, 44, 4, 36, 14, 46, 6, 38],
    [60, 28, 52, 20, 62, 30, 54, 22],
    [3, 35, 11, 43, 1, 33, 9, 41],
    [51, 19, 59, 27, 49, 17, 57, 25],
    [15, 47, 7, 39, 13, 45, 5, 37],
    [63, 31, 55, 23, 61, 29, 53, 21],
];

/// Sub-pixel sampled at dither `phase` inside a `downscale`² block
pub fn dither_offset(phase: u32, downscale: u32) -> UVec2 {
    let phase = phase % DITHER_PERIOD;
    let d = BAYER_DITHER_8X8[(phase / DITHER_SIZE) as usize][(phase % DITHER_SIZE) as usize];
    UVec2::new((d / DITHER_SIZE) % downscale, (d % DITHER_SIZE) % downscale)
}

/// Page-ID buffer size for a viewport
pub fn page_id_buffer_size(viewport: UVec2, downscale: u32) -> UVec2 {
    viewport / downscale + UVec2::ONE
}

#[derive(Debug)]
pub struct FeedbackStage {
    downscale: u32,
    phase: u32,
    buffer_size: Option<UVec2>,
}

impl FeedbackStage {
    pub fn new(downscale: u32) -> Self {
        Self {
            downscale,
            phase: 0,
            buffer_size: None,
        }
    }

    pub fn phase(&self) -> u32 {
        self.phase
    }

    /// Size of the current page-ID buffer, once allocated
    pub fn buffer_size(&self) -> Option<UVec2> {
        self.buffer_size
    }

    /// Advance the dither, make sure the buffer matches the viewport, clear
    /// it and route this frame's visible pages into it
    pub fn execute(&mut self, device: &mut impl GpuDevice, viewport: UVec2) -> FeedbackParams {
        let _span = tracing::trace_span!("vt.feedback").entered();
        self.phase = (self.phase + 1) % DITHER_PERIOD;

        let size = page_id_buffer_size(viewport, self.downscale);
        if self.buffer_size != Some(size) {
            log::debug!("Allocating {}x{} page-ID buffer", size.x, size.y);
            device.allocate_page_id_buffer(size);
            self.buffer_size = Some(size);
        }
        device.clear_page_id_buffer(size);

        let params = FeedbackParams {
            buffer_size: size,
            dither: dither_offset(self.phase, self.downscale),
        };
        device.begin_feedback(&params);
        params
    }
}
