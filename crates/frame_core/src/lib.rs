//! # Frame Core
//!
//! Per-frame execution core for a Vulkan renderer: a ring of in-flight frame
//! slots, deferred teardown, aligned uniform packing and batched draw
//! submission.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use frame_core::prelude::*;
//! use frame_core::vulkan::{VulkanDevice, Window};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = EngineConfig::default();
//!     let mut window = Window::new(&config.application_name, config.window_extent)?;
//!     let device = VulkanDevice::new(&mut window, &config)?;
//!
//!     let mut frames = FrameOrchestrator::init(device, config)?;
//!     let material = frames.create_material("defaultmesh", &PipelineDesc::new("tri_mesh.vert.spv", "default_lit.frag.spv"))?;
//!     let triangle = frames.upload_geometry("triangle", &Mesh::triangle())?;
//!     frames.add_renderable(RenderableEntry::new(triangle, material, Matrix4::identity()))?;
//!
//!     while !window.should_close() {
//!         window.poll_events();
//!         frames.draw_one_frame()?;
//!     }
//!     frames.cleanup()?;
//!     Ok(())
//! }
//! ```
//!
//! Everything above the device talks to [`gpu::GpuDevice`], so the same frame
//! loop runs against [`headless::RecordingDevice`] in tests.

#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions, clippy::similar_names, clippy::too_many_arguments)]

pub mod config;
pub mod deletion_queue;
pub mod draw_batcher;
pub mod error;
pub mod frame_ring;
pub mod gpu;
pub mod headless;
pub mod logging;
pub mod mesh;
pub mod orchestrator;
pub mod registry;
pub mod scene;
pub mod uniform;
pub mod vulkan;

pub use config::{EngineConfig, Extent};
pub use error::{FrameError, FrameResult, GpuError, GpuResult};
pub use orchestrator::{FrameOrchestrator, FrameState};

/// Common imports for applications
pub mod prelude {
    pub use crate::{
        config::{EngineConfig, Extent},
        deletion_queue::DeletionQueue,
        draw_batcher::BindStats,
        error::{FrameError, FrameResult},
        gpu::{GpuDevice, PipelineDesc},
        mesh::{Mesh, Vertex},
        orchestrator::{FrameOrchestrator, FrameState},
        registry::{GeometryHandle, MaterialHandle},
        scene::{CameraPolicy, RenderableEntry},
    };
    pub use nalgebra::{Matrix4, Vector3};
}
