//! Sector Streaming
//!
//! Keeps the tracked sector set centred on the camera and every tracked
//! sector's image sized for its distance. Reallocation is two-phase: all new
//! images are inserted while the old ones are still claimed, then each sector
//! is switched over, its page table entries remapped and the old region
//! cleared and freed.

use ahash::AHashSet;
use glam::{Vec2, Vec3};
use serde::Serialize;

use terravt_core::lod::{is_multi_step_change, sectors_in_range, target_image_size};
use terravt_core::math::{sector_center, sector_of};
use terravt_core::{ImageInfo, Sector};

use crate::context::VirtualTextureContext;
use crate::gpu::GpuDevice;

/// What one streaming update did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StreamingReport {
    pub sectors_added: usize,
    pub sectors_removed: usize,
    pub reallocated: usize,
    pub failed: usize,
    pub multi_step: usize,
    pub sector_info_rewritten: bool,
}

/// Sector set and LOD maintenance
#[derive(Debug, Default)]
pub struct StreamingStage {
    last_camera_sector: Option<Sector>,
    last_camera_xz: Option<Vec2>,
    retry_reallocation: bool,
    swaps: Vec<(Sector, ImageInfo, ImageInfo)>,
}

impl StreamingStage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forget the camera history so the next update rebuilds everything
    pub fn reset(&mut self) {
        self.last_camera_sector = None;
        self.last_camera_xz = None;
        self.retry_reallocation = false;
    }

    pub fn update(
        &mut self,
        context: &mut VirtualTextureContext,
        device: &mut impl GpuDevice,
        camera_position: Vec3,
    ) -> StreamingReport {
        let _span = tracing::trace_span!("vt.reallocate").entered();
        let mut report = StreamingReport::default();
        let camera_xz = Vec2::new(camera_position.x, camera_position.z);
        let camera_sector = sector_of(camera_xz, context.config().sector_size());

        if self.last_camera_sector != Some(camera_sector) {
            self.last_camera_sector = Some(camera_sector);
            self.update_sector_set(context, device, camera_sector, &mut report);
        }

        let moved = self.last_camera_xz.is_none_or(|last| {
            last.distance_squared(camera_xz) >= context.config().camera_position_sqr_delta_threshold
        });
        if moved || self.retry_reallocation || report.sectors_added > 0 {
            self.last_camera_xz = Some(camera_xz);
            self.reallocate(context, device, camera_xz, &mut report);
        }

        if report.sectors_added + report.sectors_removed + report.reallocated > 0 {
            for (sector, image) in context.sorted_sectors() {
                if image.is_allocated() {
                    context.sector_info.update_sector(sector, &image);
                }
            }
            context.sector_info.flush(device);
            report.sector_info_rewritten = true;
        }

        report
    }

    fn update_sector_set(
        &mut self,
        context: &mut VirtualTextureContext,
        device: &mut impl GpuDevice,
        camera_sector: Sector,
        report: &mut StreamingReport,
    ) {
        let config = context.config();
        let wanted: AHashSet<Sector> =
            sectors_in_range(camera_sector, config.sector_count(), config.sector_preload_distance)
                .into_iter()
                .collect();

        for (sector, _) in context.sorted_sectors() {
            if !wanted.contains(&sector) {
                context.untrack_sector(device, sector);
                report.sectors_removed += 1;
            }
        }
        for &sector in &wanted {
            if context.track_sector(sector) {
                report.sectors_added += 1;
            }
        }

        log::debug!(
            "Camera entered sector {camera_sector}: {} sectors tracked (+{} -{})",
            context.sector_count(),
            report.sectors_added,
            report.sectors_removed
        );
    }

    fn reallocate(
        &mut self,
        context: &mut VirtualTextureContext,
        device: &mut impl GpuDevice,
        camera_xz: Vec2,
        report: &mut StreamingReport,
    ) {
        let config = context.config().clone();
        let sector_size = config.sector_size();
        self.swaps.clear();

        for (sector, old) in context.sorted_sectors() {
            let size = target_image_size(sector_center(sector, sector_size), camera_xz, &config);
            let old_size = old.size << config.page_size_shift;
            if size == old_size {
                continue;
            }

            match context.atlas.insert_image(sector, size) {
                Some(new) => {
                    if is_multi_step_change(old_size, size) {
                        report.multi_step += 1;
                        log::warn!("Sector {sector} jumped from {old_size} to {size} texels");
                    } else {
                        log::debug!("Sector {sector} resized from {old_size} to {size} texels");
                    }
                    self.swaps.push((sector, old, new));
                }
                None => {
                    report.failed += 1;
                    log::warn!("Atlas full: sector {sector} keeps its {old_size} texel image instead of {size}");
                }
            }
        }

        for (sector, old, new) in self.swaps.drain(..) {
            context.swap_image(sector, new);
            if old.is_allocated() {
                context.indirection.remap_virtual_image(device, &old, &new);
                context.indirection.remove_virtual_image(device, &old);
                context.atlas.remove_image(&old);
            }
            report.reallocated += 1;
        }

        self.retry_reallocation = report.failed > 0;
    }
}
