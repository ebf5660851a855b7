//! Virtual Texture System
//!
//! Owns the device, the shared context and the pipeline. The host calls
//! [`VirtualTextureSystem::execute_frame`] once per frame; shutting down
//! drains in-flight GPU work and releases every sector.

use std::time::Duration;

use terravt_core::{VirtualTextureConfig, VtResult};

use crate::context::VirtualTextureContext;
use crate::gpu::{GpuDevice, ResourceLayout};
use crate::pipeline::{FrameInput, Pipeline, PipelineStats, Stage};

/// Bounded wait for in-flight readbacks when the system is dropped
const DROP_DRAIN_TIMEOUT: Duration = Duration::from_millis(100);

/// Terrain virtual texturing bound to one GPU device
pub struct VirtualTextureSystem<D: GpuDevice> {
    device: D,
    context: VirtualTextureContext,
    pipeline: Pipeline,
    frame_number: u64,
    active: bool,
}

impl<D: GpuDevice> VirtualTextureSystem<D> {
    /// Validate `config`, create the GPU resources and clear the page table
    pub fn new(config: VirtualTextureConfig, mut device: D) -> VtResult<Self> {
        config.validate()?;
        device.allocate_resources(&ResourceLayout::from_config(&config));
        let context = VirtualTextureContext::new(config, &mut device)?;
        let pipeline = Pipeline::new(context.config());
        device.submit();

        log::info!(
            "Virtual texturing enabled: {0}x{0} sectors, {1} physical pages of {2} texels",
            context.config().sector_count(),
            context.config().max_physical_page_count,
            context.config().page_size_with_border()
        );

        Ok(Self {
            device,
            context,
            pipeline,
            frame_number: 0,
            active: true,
        })
    }

    /// Run one frame of the pipeline and submit the device's work
    pub fn execute_frame(&mut self, input: FrameInput) -> VtResult<()> {
        if !self.active {
            log::info!("Virtual texturing resumed");
            self.active = true;
        }

        self.frame_number += 1;
        self.device.bind_resources();
        let result = self.pipeline.execute_frame(&mut self.context, &mut self.device, &input);
        self.device.submit();
        result
    }

    pub fn frame_number(&self) -> u64 {
        self.frame_number
    }

    pub fn stage(&self) -> &Stage {
        self.pipeline.stage()
    }

    pub fn stats(&self) -> &PipelineStats {
        self.pipeline.stats()
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    pub fn context(&self) -> &VirtualTextureContext {
        &self.context
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    pub fn device_mut(&mut self) -> &mut D {
        &mut self.device
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Drain in-flight work, then free every sector and clear its page table
    /// and sector-info entries
    ///
    /// Returns false if a readback had to be abandoned. The next
    /// [`Self::execute_frame`] starts over from an empty sector set.
    pub fn shutdown(&mut self, max_wait: Duration) -> bool {
        if !self.active {
            return true;
        }

        let drained = self.pipeline.shutdown(&mut self.device, max_wait);
        let sectors = self.context.sorted_sectors();
        for (sector, _) in &sectors {
            self.context.untrack_sector(&mut self.device, *sector);
        }
        self.context.sector_info.flush(&mut self.device);
        self.device.submit();
        self.active = false;

        log::info!("Virtual texturing disabled, released {} sectors", sectors.len());
        drained
    }
}

impl<D: GpuDevice> Drop for VirtualTextureSystem<D> {
    fn drop(&mut self) {
        self.shutdown(DROP_DRAIN_TIMEOUT);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::software::{sample_visible_pages, SoftwareDevice};
    use glam::{IVec2, UVec2, Vec3};
    use terravt_core::codec::SectorInfoRecord;

    const VIEWPORT: UVec2 = UVec2::new(640, 360);

    fn system() -> VirtualTextureSystem<SoftwareDevice> {
        let config = VirtualTextureConfig::with_terrain_size(1024);
        VirtualTextureSystem::new(config, SoftwareDevice::new()).unwrap()
    }

    /// Feed the pages visible from `camera` and run one frame
    fn step(system: &mut VirtualTextureSystem<SoftwareDevice>, camera: Vec3) {
        let visible = sample_visible_pages(system.context(), camera, 4, 16);
        system.device_mut().set_visible_pages(visible);
        system
            .execute_frame(FrameInput {
                camera_position: camera,
                viewport: VIEWPORT,
            })
            .unwrap();
    }

    fn run_cycles(system: &mut VirtualTextureSystem<SoftwareDevice>, camera: Vec3, cycles: u64) {
        let target = system.stats().cycles_completed + cycles;
        for _ in 0..500 {
            if system.stats().cycles_completed >= target {
                return;
            }
            step(system, camera);
        }
        panic!("pipeline did not complete {cycles} cycles: {:?}", system.stats());
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let config = VirtualTextureConfig::with_terrain_size(1000);
        assert!(VirtualTextureSystem::new(config, SoftwareDevice::new()).is_err());
    }

    #[test]
    fn test_stage_sequence() {
        let mut system = system();
        let camera = Vec3::new(512.5, 2.0, 512.5);
        let mut stages = vec![system.stage().name()];
        for _ in 0..6 {
            step(&mut system, camera);
            stages.push(system.stage().name());
        }
        assert_eq!(
            stages,
            [
                "Waiting",
                "ReallocateVirtualPage",
                "FeedBack",
                "RequestAsyncReadBack",
                "ReadingBack",
                "SortPageId",
                "RenderingPage",
            ]
        );
        assert!(!system.device().is_bound());
        assert_eq!(system.device().counters().submits, 7);
    }

    #[test]
    fn test_full_cycle_makes_visible_pages_resident() {
        let mut system = system();
        let camera = Vec3::new(512.5, 2.0, 512.5);
        run_cycles(&mut system, camera, 1);

        let stats = system.stats().clone();
        assert_eq!(stats.readbacks_completed, 1);
        assert_eq!(stats.unknown_pages, 0);
        assert_eq!(stats.pages_rendered, stats.pages_requested);
        assert!(stats.pages_requested > system.context().image_count() as u64);

        let max_shift = system.context().config().max_virtual_page_size_shift();
        for page in sample_visible_pages(system.context(), camera, 4, 16) {
            let (slot, mip) = system.device().lookup(page).unwrap();
            assert_eq!(mip, page.mip, "{page:?} resolved at a coarser mip");
            let content = system.device().slot_content(slot).unwrap();
            assert_eq!((content.mip, content.size_log2), (page.mip, page.size_log2));
            assert_eq!(content.local_page, page.local_page());
            assert!(content.sector.x >= 0 && content.size_log2 <= max_shift);
        }
        assert!(system.context().is_consistent());
    }

    #[test]
    fn test_second_cycle_hits_the_cache() {
        let mut system = system();
        let camera = Vec3::new(512.5, 2.0, 512.5);
        run_cycles(&mut system, camera, 1);
        let rendered = system.stats().pages_rendered;

        run_cycles(&mut system, camera, 1);
        let stats = system.stats();
        assert_eq!(stats.pages_rendered, rendered);
        assert_eq!(stats.cache_hits, rendered);
    }

    #[test]
    fn test_stats_serialize_to_json() {
        let mut system = system();
        run_cycles(&mut system, Vec3::new(512.5, 2.0, 512.5), 1);

        let stats = serde_json::to_value(system.stats()).unwrap();
        assert_eq!(stats["cycles_completed"], 1);
        assert_eq!(stats["readbacks_completed"], 1);
        assert_eq!(stats["pages_rendered"], system.stats().pages_rendered);

        let counters = serde_json::to_value(system.device().counters()).unwrap();
        assert_eq!(counters["pages_rendered"], system.stats().pages_rendered);
        assert_eq!(counters["readbacks_delivered"], 1);
    }

    #[test]
    fn test_lost_readback_times_out() {
        let mut system = system();
        system.device().readback_control().drop_next(1);
        run_cycles(&mut system, Vec3::new(300.0, 0.0, 300.0), 1);

        let stats = system.stats();
        assert_eq!(stats.readback_timeouts, 1);
        assert_eq!(stats.readbacks_requested, 2);
        assert_eq!(stats.readbacks_completed, 1);
    }

    #[test]
    fn test_late_completion_is_discarded() {
        let mut system = system();
        system.device().readback_control().set_latency(12);
        let camera = Vec3::new(300.0, 0.0, 300.0);
        for _ in 0..30 {
            step(&mut system, camera);
        }

        let stats = system.stats();
        assert!(stats.readback_timeouts >= 1);
        assert!(stats.stale_readbacks >= 1);
        assert_eq!(stats.readbacks_completed, 0);
        assert_eq!(stats.cycles_completed, 0);
    }

    #[test]
    fn test_failed_readback_renders_only_whole_images() {
        let mut system = system();
        system.device().readback_control().fail_next(1);
        run_cycles(&mut system, Vec3::new(512.5, 0.0, 512.5), 1);

        let stats = system.stats();
        assert_eq!(stats.pages_requested, system.context().image_count() as u64);
        for (_, image) in system.context().sorted_sectors() {
            assert!(image.is_allocated());
            let page = terravt_core::PageId::whole_image(image.x, image.z, image.size);
            assert!(system.device().lookup(page).is_some());
        }
    }

    #[test]
    fn test_moving_camera_keeps_state_consistent() {
        let mut system = system();
        let mut camera = Vec3::new(200.0, 5.0, 300.0);
        for frame in 0..400 {
            camera.x += 1.5;
            camera.z += 0.5;
            step(&mut system, camera);
            assert!(system.context().is_consistent(), "frame {frame}");
        }

        let stats = system.stats();
        assert_eq!(stats.failed_allocations, 0);
        assert_eq!(stats.unknown_pages, 0);
        assert!(stats.sectors_removed > 0);
        assert!(stats.cycles_completed > 0);
    }

    #[test]
    fn test_shutdown_leaves_no_residue() {
        let mut system = system();
        let mut camera = Vec3::new(400.0, 0.0, 400.0);
        run_cycles(&mut system, camera, 1);
        for _ in 0..60 {
            camera.x += 4.0;
            step(&mut system, camera);
        }
        let tracked = system.context().sorted_sectors();
        assert!(!tracked.is_empty());

        assert!(system.shutdown(Duration::from_millis(50)));
        assert!(!system.is_active());
        let context = system.context();
        assert_eq!(context.sector_count(), 0);
        assert_eq!(context.image_count(), 0);
        assert_eq!(context.atlas.occupied_count(), 0);
        assert!(context.is_consistent());
        assert_eq!(system.device().resident_entry_count(), 0);
        for (sector, _) in tracked {
            assert_eq!(system.device().sector_record(sector), Some(SectorInfoRecord(0)));
        }
        assert!(matches!(system.stage(), Stage::Waiting));
    }

    #[test]
    fn test_shutdown_drains_in_flight_readback() {
        let mut system = system();
        system.device().readback_control().set_latency(3);
        let camera = Vec3::new(512.5, 0.0, 512.5);
        for _ in 0..4 {
            step(&mut system, camera);
        }
        assert!(matches!(system.stage(), Stage::ReadingBack));
        assert!(system.shutdown(Duration::from_secs(1)));
        assert_eq!(system.device().readback_control().pending(), 0);
    }

    #[test]
    fn test_resume_after_shutdown() {
        let mut system = system();
        let camera = Vec3::new(512.5, 0.0, 512.5);
        run_cycles(&mut system, camera, 1);
        system.shutdown(Duration::from_millis(10));

        run_cycles(&mut system, camera, 1);
        assert!(system.is_active());
        assert!(system.context().is_tracked(IVec2::new(8, 8)));
        assert!(system.context().is_consistent());
    }
}
