//! Pipeline State Machine
//!
//! One feedback cycle spans several frames: reallocate, render feedback,
//! request the readback, wait for it, deduplicate on a worker thread, sort,
//! then render missing pages over as many frames as needed. The machine makes
//! exactly one transition per frame and each stage's work runs in the frame
//! it is entered.

use std::time::Duration;

use glam::{UVec2, Vec3};
use serde::Serialize;

use terravt_core::{BackgroundJob, ImageKey, VirtualTextureConfig, VtResult};

use crate::context::VirtualTextureContext;
use crate::dedup::{sort_by_priority, spawn_deduplicate};
use crate::feedback::FeedbackStage;
use crate::gpu::GpuDevice;
use crate::readback::{ReadbackTracker, ReadbackWait};
use crate::render_page::{PageRenderer, RenderReport};
use crate::streaming::{StreamingReport, StreamingStage};

/// Per-frame inputs from the host renderer
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameInput {
    pub camera_position: Vec3,
    pub viewport: UVec2,
}

/// Pipeline stage, holding the data handed from one stage to the next
#[derive(Debug, Default)]
pub enum Stage {
    #[default]
    Waiting,
    ReallocateVirtualPage,
    FeedBack,
    RequestAsyncReadBack,
    ReadingBack,
    Deduplicate {
        readback: Vec<u32>,
    },
    SortPageId {
        job: BackgroundJob<Vec<u32>>,
    },
    RenderingPage,
}

impl Stage {
    pub fn name(&self) -> &'static str {
        match self {
            Stage::Waiting => "Waiting",
            Stage::ReallocateVirtualPage => "ReallocateVirtualPage",
            Stage::FeedBack => "FeedBack",
            Stage::RequestAsyncReadBack => "RequestAsyncReadBack",
            Stage::ReadingBack => "ReadingBack",
            Stage::Deduplicate { .. } => "Deduplicate",
            Stage::SortPageId { .. } => "SortPageId",
            Stage::RenderingPage => "RenderingPage",
        }
    }
}

/// Running totals over the lifetime of a pipeline
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PipelineStats {
    pub frames: u64,
    pub cycles_completed: u64,
    pub readbacks_requested: u64,
    pub readbacks_completed: u64,
    pub readback_timeouts: u64,
    pub stale_readbacks: u64,
    pub pages_requested: u64,
    pub pages_rendered: u64,
    pub cache_hits: u64,
    pub evictions_cleared: u64,
    pub unknown_pages: u64,
    pub sectors_added: u64,
    pub sectors_removed: u64,
    pub reallocations: u64,
    pub failed_allocations: u64,
    pub multi_step_changes: u64,
}

impl PipelineStats {
    fn record_streaming(&mut self, report: &StreamingReport) {
        self.sectors_added += report.sectors_added as u64;
        self.sectors_removed += report.sectors_removed as u64;
        self.reallocations += report.reallocated as u64;
        self.failed_allocations += report.failed as u64;
        self.multi_step_changes += report.multi_step as u64;
    }

    fn record_render(&mut self, report: &RenderReport) {
        self.pages_rendered += report.rendered as u64;
        self.cache_hits += report.cache_hits as u64;
        self.evictions_cleared += report.evictions_cleared as u64;
        self.unknown_pages += report.unknown_pages as u64;
    }
}

/// The per-frame stage machine and the stages it drives
#[derive(Debug)]
pub struct Pipeline {
    stage: Stage,
    streaming: StreamingStage,
    feedback: FeedbackStage,
    readback: ReadbackTracker,
    renderer: PageRenderer,
    dedup_capacity: usize,
    stats: PipelineStats,
}

impl Pipeline {
    pub fn new(config: &VirtualTextureConfig) -> Self {
        Self {
            stage: Stage::Waiting,
            streaming: StreamingStage::new(),
            feedback: FeedbackStage::new(config.page_id_downscale),
            readback: ReadbackTracker::new(config.readback_timeout),
            renderer: PageRenderer::new(config.max_physical_page_count, config.rendering_page_per_frame),
            dedup_capacity: config.max_deduplicated_page_count as usize,
            stats: PipelineStats::default(),
        }
    }

    pub fn stage(&self) -> &Stage {
        &self.stage
    }

    pub fn stats(&self) -> &PipelineStats {
        &self.stats
    }

    pub fn renderer(&self) -> &PageRenderer {
        &self.renderer
    }

    pub fn feedback(&self) -> &FeedbackStage {
        &self.feedback
    }

    /// Consume a finished readback, then run the current stage and move to the next
    ///
    /// If a stage fails the machine is left in `Waiting`.
    pub fn execute_frame(
        &mut self,
        context: &mut VirtualTextureContext,
        device: &mut impl GpuDevice,
        input: &FrameInput,
    ) -> VtResult<()> {
        self.stats.frames += 1;

        if matches!(self.stage, Stage::ReadingBack) {
            if let Some(readback) = self.readback.take_completion() {
                self.stats.readbacks_completed += 1;
                self.stage = Stage::Deduplicate { readback };
            }
        }

        let stage = std::mem::take(&mut self.stage);
        let previous = stage.name();
        let _span = tracing::trace_span!("vt.frame", stage = previous).entered();
        let next = self.run_stage(stage, context, device, input)?;
        if next.name() != previous {
            log::debug!("Virtual texture stage {previous} -> {}", next.name());
        }
        self.stage = next;
        self.stats.stale_readbacks = self.readback.stale_discarded();
        Ok(())
    }

    fn run_stage(
        &mut self,
        stage: Stage,
        context: &mut VirtualTextureContext,
        device: &mut impl GpuDevice,
        input: &FrameInput,
    ) -> VtResult<Stage> {
        let next = match stage {
            Stage::Waiting => Stage::ReallocateVirtualPage,
            Stage::ReallocateVirtualPage => {
                let report = self.streaming.update(context, device, input.camera_position);
                self.stats.record_streaming(&report);
                Stage::FeedBack
            }
            Stage::FeedBack => {
                self.feedback.execute(device, input.viewport);
                Stage::RequestAsyncReadBack
            }
            Stage::RequestAsyncReadBack => match self.feedback.buffer_size() {
                Some(size) => {
                    self.readback.request(device, size);
                    self.stats.readbacks_requested += 1;
                    Stage::ReadingBack
                }
                None => Stage::Waiting,
            },
            Stage::ReadingBack => match self.readback.tick() {
                ReadbackWait::Waiting => Stage::ReadingBack,
                ReadbackWait::TimedOut => {
                    self.stats.readback_timeouts += 1;
                    Stage::Waiting
                }
            },
            Stage::Deduplicate { readback } => {
                let images: Vec<ImageKey> = context.image_keys().copied().collect();
                let job = spawn_deduplicate(readback, images, self.dedup_capacity)?;
                Stage::SortPageId { job }
            }
            Stage::SortPageId { job } => {
                let pages = {
                    let _span = tracing::trace_span!("vt.sort").entered();
                    let mut pages = job.join()?;
                    sort_by_priority(&mut pages);
                    pages
                };
                self.stats.pages_requested += pages.len() as u64;
                self.renderer.start(pages);
                self.render(context, device);
                Stage::RenderingPage
            }
            Stage::RenderingPage => {
                if self.renderer.is_finished() {
                    self.stats.cycles_completed += 1;
                    Stage::Waiting
                } else {
                    self.render(context, device);
                    Stage::RenderingPage
                }
            }
        };
        Ok(next)
    }

    fn render(&mut self, context: &mut VirtualTextureContext, device: &mut impl GpuDevice) {
        let report = self.renderer.render_frame(context, device);
        self.stats.record_render(&report);
    }

    /// Wait for any in-flight work and return to `Waiting`
    ///
    /// Returns false if the readback had to be abandoned.
    pub fn shutdown(&mut self, device: &mut impl GpuDevice, max_wait: Duration) -> bool {
        let drained = self.readback.drain(device, max_wait);
        if let Stage::SortPageId { job } = std::mem::take(&mut self.stage) {
            if job.join().is_err() {
                log::warn!("Deduplication job panicked during shutdown");
            }
        }
        self.renderer.cancel();
        self.streaming.reset();
        drained
    }
}
