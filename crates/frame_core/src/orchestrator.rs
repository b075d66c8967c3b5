//! Top-level per-frame state machine
//!
//! ```text
//! Idle -> AcquireTarget -> RecordCommands -> Submit -> Present -> Idle
//!    \________________________ any error ________________________/-> Aborted
//! ```
//!
//! `AcquireTarget` waits on the current slot's fence, resets it and acquires
//! a swapchain image. `RecordCommands` records the render pass and the draw
//! list. `Submit` queues the work and `Present` hands the image back to the
//! swapchain. Returning to `Idle` advances the frame counter, which moves the
//! ring to the next slot.
//!
//! Any device error moves the machine to `Aborted`. There is no retry; every
//! later frame fails with [`FrameError::Aborted`] and the application is
//! expected to clean up and exit.

use crate::config::EngineConfig;
use crate::deletion_queue::DeletionQueue;
use crate::draw_batcher::{sort_for_batching, BindStats, DrawBatcher};
use crate::error::{EntryKind, FrameError, FrameResult, RegistryError};
use crate::frame_ring::FrameRing;
use crate::gpu::{BufferUsage, ClearValues, GpuDevice, PipelineDesc, ResourceId};
use crate::mesh::Mesh;
use crate::registry::{GeometryHandle, MaterialHandle, ResourceRegistry};
use crate::scene::{flash_clear_color, CameraPolicy, RenderableEntry};

/// Where the orchestrator is in the current frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameState {
    /// Between frames
    Idle,
    /// Waiting on the slot fence and acquiring an image
    AcquireTarget,
    /// Recording the slot's command target
    RecordCommands,
    /// Submitting recorded work
    Submit,
    /// Presenting the rendered image
    Present,
    /// A fatal error occurred; no further frames are drawn
    Aborted,
}

/// Drives the frame ring, batcher and device through one frame at a time
pub struct FrameOrchestrator<D: GpuDevice + 'static> {
    device: D,
    config: EngineConfig,
    ring: FrameRing,
    registry: ResourceRegistry,
    batcher: DrawBatcher,
    renderables: Vec<RenderableEntry>,
    deletion_queue: DeletionQueue<D>,
    state: FrameState,
    initialized: bool,
    last_stats: BindStats,
}

impl<D: GpuDevice + 'static> FrameOrchestrator<D> {
    /// Validate `config` and create the frame ring on `device`
    ///
    /// Only a fully initialized orchestrator is returned. If any object fails
    /// to create, everything created so far is released before the error is
    /// returned.
    pub fn init(mut device: D, config: EngineConfig) -> FrameResult<Self> {
        config.validate()?;

        let alignment = device.min_uniform_buffer_offset_alignment();
        if alignment != 0 && !alignment.is_power_of_two() {
            return Err(FrameError::Setup(format!(
                "minUniformBufferOffsetAlignment {alignment} is not a power of two"
            )));
        }

        let mut deletion_queue = DeletionQueue::new();
        let ring = match FrameRing::create(&mut device, &config, &mut deletion_queue) {
            Ok(ring) => ring,
            Err(err) => {
                log::error!("Frame ring creation failed: {err}");
                if let Err(teardown) = deletion_queue.flush(&mut device) {
                    log::error!("Releasing partially created frame ring failed: {teardown}");
                }
                return Err(err);
            }
        };

        log::info!(
            "Frame orchestrator initialized: {} slots, {} max objects, {:?} fence timeout",
            ring.len(),
            ring.max_objects(),
            config.fence_timeout()
        );

        Ok(Self {
            device,
            config,
            ring,
            registry: ResourceRegistry::new(),
            batcher: DrawBatcher::default(),
            renderables: Vec::new(),
            deletion_queue,
            state: FrameState::Idle,
            initialized: true,
            last_stats: BindStats::default(),
        })
    }

    fn require_initialized(&self) -> FrameResult<()> {
        if self.initialized {
            Ok(())
        } else {
            Err(FrameError::NotInitialized)
        }
    }

    fn register_destroy(&mut self, resource: impl Into<ResourceId> + 'static) {
        let resource = resource.into();
        self.deletion_queue.register(move |device: &mut D| device.destroy(resource));
    }

    /// Build a pipeline from `desc` and register it as material `name`
    pub fn create_material(&mut self, name: &str, desc: &PipelineDesc) -> FrameResult<MaterialHandle> {
        self.require_initialized()?;
        if self.registry.get_material(name).is_some() {
            return Err(RegistryError::DuplicateName {
                kind: EntryKind::Material,
                name: name.to_string(),
            }
            .into());
        }

        let (pipeline, layout) = self
            .device
            .create_pipeline(desc)
            .map_err(|source| FrameError::Setup(format!("failed to build pipeline for material '{name}': {source}")))?;
        self.register_destroy(layout);
        self.register_destroy(pipeline);

        let handle = self.registry.add_material(name, pipeline, layout)?;
        log::info!("Created material '{name}'");
        Ok(handle)
    }

    /// Upload `mesh` into a new vertex buffer and register it as geometry `name`
    pub fn upload_geometry(&mut self, name: &str, mesh: &Mesh) -> FrameResult<GeometryHandle> {
        self.require_initialized()?;
        if self.registry.get_geometry(name).is_some() {
            return Err(RegistryError::DuplicateName {
                kind: EntryKind::Geometry,
                name: name.to_string(),
            }
            .into());
        }
        if mesh.vertices.is_empty() {
            return Err(FrameError::Setup(format!("geometry '{name}' has no vertices")));
        }

        let bytes = mesh.as_bytes();
        let buffer = self
            .device
            .create_buffer(bytes.len() as u64, BufferUsage::Vertex)
            .map_err(|source| FrameError::Setup(format!("failed to create vertex buffer for '{name}': {source}")))?;
        self.register_destroy(buffer);
        self.device
            .write_buffer(buffer, 0, bytes)
            .map_err(FrameError::op("upload vertex data"))?;

        let handle = self.registry.add_geometry(name, buffer, mesh.vertex_count())?;
        log::info!("Uploaded geometry '{name}' ({} vertices)", mesh.vertex_count());
        Ok(handle)
    }

    /// Append an entry to the draw list
    ///
    /// Fails without modifying the list when the per-slot object capacity is
    /// already reached.
    pub fn add_renderable(&mut self, entry: RenderableEntry) -> FrameResult<()> {
        if self.renderables.len() >= self.ring.max_objects() {
            return Err(FrameError::ObjectCapacityExceeded {
                requested: self.renderables.len() + 1,
                capacity: self.ring.max_objects(),
            });
        }
        self.renderables.push(entry);
        Ok(())
    }

    /// Empty the draw list
    pub fn clear_renderables(&mut self) {
        self.renderables.clear();
    }

    /// Reorder the draw list to minimize binds
    pub fn sort_renderables(&mut self) {
        sort_for_batching(&mut self.renderables);
    }

    /// Current draw list
    pub fn renderables(&self) -> &[RenderableEntry] {
        &self.renderables
    }

    /// Material and geometry lookup
    pub fn registry(&self) -> &ResourceRegistry {
        &self.registry
    }

    /// Replace the camera placement used for the camera block
    pub fn set_camera(&mut self, camera: CameraPolicy) {
        self.batcher.set_camera(camera);
    }

    /// State machine position
    pub fn state(&self) -> FrameState {
        self.state
    }

    /// Frames completed so far
    pub fn frame_number(&self) -> u64 {
        self.ring.frame_number()
    }

    /// Bind statistics of the last completed frame
    pub fn last_frame_stats(&self) -> BindStats {
        self.last_stats
    }

    /// Whether `init` succeeded and `cleanup` has not run
    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Active configuration
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Frame slots
    pub fn ring(&self) -> &FrameRing {
        &self.ring
    }

    /// Underlying device
    pub fn device(&self) -> &D {
        &self.device
    }

    /// Underlying device, mutably
    pub fn device_mut(&mut self) -> &mut D {
        &mut self.device
    }

    /// Render and present one frame
    ///
    /// On error the orchestrator enters [`FrameState::Aborted`] and every
    /// later call returns [`FrameError::Aborted`].
    pub fn draw_one_frame(&mut self) -> FrameResult<BindStats> {
        if self.state == FrameState::Aborted {
            return Err(FrameError::Aborted);
        }
        self.require_initialized()?;

        match self.render_frame() {
            Ok(stats) => {
                self.last_stats = stats;
                Ok(stats)
            }
            Err(err) => {
                log::error!(
                    "Frame {} aborted in {:?}: {err}",
                    self.ring.frame_number(),
                    self.state
                );
                self.state = FrameState::Aborted;
                Err(err)
            }
        }
    }

    fn render_frame(&mut self) -> FrameResult<BindStats> {
        let timeout = self.config.fence_timeout();
        let frame_number = self.ring.frame_number();
        let slot = self.ring.current().clone();
        log::trace!("Frame {frame_number} using slot {}", self.ring.current_index());

        self.state = FrameState::AcquireTarget;
        self.device
            .wait_fence(slot.render_fence, timeout)
            .map_err(FrameError::gpu("render fence", timeout))?;
        self.device
            .reset_fence(slot.render_fence)
            .map_err(FrameError::op("reset render fence"))?;
        let image_index = self
            .device
            .acquire_next_image(slot.image_acquired, timeout)
            .map_err(FrameError::gpu("swapchain image", timeout))?;

        self.state = FrameState::RecordCommands;
        let target = slot.commands;
        self.device
            .reset_commands(target)
            .map_err(FrameError::op("reset command buffer"))?;
        self.device
            .begin_commands(target)
            .map_err(FrameError::op("begin command buffer"))?;
        let clear = ClearValues {
            color: flash_clear_color(frame_number, self.config.clear_color_period),
            depth: 1.0,
        };
        self.device
            .begin_render_pass(target, image_index, clear)
            .map_err(FrameError::op("begin render pass"))?;
        let stats = self
            .batcher
            .draw_objects(&mut self.device, &self.ring, &self.registry, &self.renderables)?;
        self.device
            .end_render_pass(target)
            .map_err(FrameError::op("end render pass"))?;
        self.device
            .end_commands(target)
            .map_err(FrameError::op("end command buffer"))?;

        self.state = FrameState::Submit;
        self.device
            .submit(target, slot.image_acquired, slot.render_finished, slot.render_fence)
            .map_err(FrameError::op("queue submit"))?;

        self.state = FrameState::Present;
        self.device
            .present(image_index, slot.render_finished)
            .map_err(FrameError::op("queue present"))?;

        self.ring.advance();
        self.state = FrameState::Idle;
        Ok(stats)
    }

    /// Draw frames until `should_quit` returns true
    ///
    /// `should_quit` is checked between frames; the application polls its
    /// window events there. Returns the number of frames drawn.
    pub fn run(&mut self, mut should_quit: impl FnMut() -> bool) -> FrameResult<u64> {
        self.require_initialized()?;
        if self.state == FrameState::Aborted {
            return Err(FrameError::Aborted);
        }

        let start = self.ring.frame_number();
        while !should_quit() {
            self.draw_one_frame()?;
        }
        let frames = self.ring.frame_number() - start;
        log::info!("Frame loop finished after {frames} frames");
        Ok(frames)
    }

    /// Wait for the GPU to go idle and destroy everything in reverse order
    ///
    /// Calling it again is a no-op. If the device cannot confirm idleness the
    /// deletion queue is left untouched, since its resources may still be in
    /// use.
    pub fn cleanup(&mut self) -> FrameResult<()> {
        if !self.initialized {
            return Ok(());
        }
        self.initialized = false;
        self.renderables.clear();

        log::info!("Cleaning up frame orchestrator ({} deferred actions)", self.deletion_queue.len());
        self.device.wait_idle().map_err(FrameError::op("wait idle"))?;
        self.deletion_queue.flush(&mut self.device)
    }
}

impl<D: GpuDevice + 'static> Drop for FrameOrchestrator<D> {
    fn drop(&mut self) {
        if let Err(err) = self.cleanup() {
            log::error!("Cleanup on drop failed: {err}");
        }
    }
}
