//! # Terravt Renderer
//!
//! GPU-facing half of the Terravt terrain virtual texturing system.
//!
//! ## Features
//! - `GpuDevice` trait covering every compute procedure the pipeline dispatches
//! - Indirection texture with batched writes and mip-shifting region remaps
//! - Sector streaming with two-phase image reallocation
//! - Feedback, readback, deduplication and page rendering stages
//! - Enum-driven per-frame state machine owned by `VirtualTextureSystem`
//! - `SoftwareDevice`, a CPU reference backend for headless runs and tests

pub mod context;
pub mod dedup;
pub mod feedback;
pub mod gpu;
pub mod indirection;
pub mod physical;
pub mod pipeline;
pub mod readback;
pub mod render_page;
pub mod sector_info;
pub mod software;
pub mod streaming;
pub mod system;

pub use context::VirtualTextureContext;
pub use gpu::{GpuDevice, ResourceLayout};
pub use pipeline::{FrameInput, Pipeline, PipelineStats, Stage};
pub use software::{sample_visible_pages, ReadbackControl, SoftwareDevice};
pub use system::VirtualTextureSystem;
