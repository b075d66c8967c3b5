//! Device abstraction consumed by the frame core
//!
//! The frame ring, draw batcher and orchestrator only ever talk to a
//! [`GpuDevice`]. The Vulkan backend implements it on top of ash; the headless
//! backend implements it in memory so the frame loop can run under test.
//!
//! Every GPU object is named by a typed handle wrapping one [`ResourceId`].
//! Backends store their native objects in a [`ResourceArena`] keyed by that id,
//! so a handle is plain data: it can be copied into deletion-queue closures and
//! registry records without borrowing the device.

use std::path::PathBuf;
use std::time::Duration;

use ash::vk;
use slotmap::SlotMap;

use crate::config::Extent;
use crate::error::{GpuError, GpuResult};

slotmap::new_key_type! {
    /// Arena key shared by every GPU handle type
    pub struct ResourceId;
}

macro_rules! gpu_handle {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub struct $name(pub ResourceId);

        impl $name {
            /// Untyped arena key
            pub fn resource(self) -> ResourceId {
                self.0
            }
        }

        impl From<$name> for ResourceId {
            fn from(handle: $name) -> Self {
                handle.0
            }
        }
    };
}

gpu_handle!(
    /// CPU-observable completion signal
    FenceId
);
gpu_handle!(
    /// GPU-only ordering signal
    SemaphoreId
);
gpu_handle!(
    /// Command recording target (pool + primary command buffer)
    CommandTargetId
);
gpu_handle!(
    /// Host-visible buffer
    BufferId
);
gpu_handle!(
    /// Compiled graphics pipeline
    PipelineId
);
gpu_handle!(
    /// Pipeline layout (descriptor set layouts + push constant range)
    PipelineLayoutId
);
gpu_handle!(
    /// Allocated descriptor set
    DescriptorSetId
);

/// How a buffer will be bound
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferUsage {
    /// Uniform buffer, possibly bound with a dynamic offset
    Uniform,
    /// Shader storage buffer
    Storage,
    /// Vertex input
    Vertex,
}

/// Descriptor set layouts every pipeline layout is built from
///
/// Set 0 (`Global`) holds the camera uniform at binding 0 and the dynamically
/// offset scene uniform at binding 1. Set 1 (`Objects`) holds the per-object
/// storage buffer at binding 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DescriptorLayoutKind {
    /// Camera + scene parameters
    Global,
    /// Per-object data array
    Objects,
}

impl DescriptorLayoutKind {
    /// Set index the layout occupies in every pipeline layout
    pub const fn set_index(self) -> u32 {
        match self {
            Self::Global => 0,
            Self::Objects => 1,
        }
    }
}

/// Descriptor type of one binding
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescriptorKind {
    /// Plain uniform buffer
    UniformBuffer,
    /// Uniform buffer selected with a dynamic offset at bind time
    UniformBufferDynamic,
    /// Storage buffer
    StorageBuffer,
}

/// One buffer binding written into a descriptor set
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DescriptorBinding {
    /// Binding number within the set
    pub binding: u32,
    /// Descriptor type
    pub kind: DescriptorKind,
    /// Buffer to bind
    pub buffer: BufferId,
    /// Byte offset of the bound range
    pub offset: u64,
    /// Byte length of the bound range
    pub range: u64,
}

/// Fixed-function and shader state for one pipeline
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineDesc {
    /// Compiled SPIR-V vertex shader
    pub vertex_shader: PathBuf,
    /// Compiled SPIR-V fragment shader
    pub fragment_shader: PathBuf,
    /// Primitive topology
    pub topology: vk::PrimitiveTopology,
    /// Fill, line or point rasterization
    pub polygon_mode: vk::PolygonMode,
    /// Face culling
    pub cull_mode: vk::CullModeFlags,
    /// Depth test + write with `LESS_OR_EQUAL`
    pub depth_test: bool,
}

impl PipelineDesc {
    /// Triangle-list pipeline with depth testing and no culling
    pub fn new(vertex_shader: impl Into<PathBuf>, fragment_shader: impl Into<PathBuf>) -> Self {
        Self {
            vertex_shader: vertex_shader.into(),
            fragment_shader: fragment_shader.into(),
            topology: vk::PrimitiveTopology::TRIANGLE_LIST,
            polygon_mode: vk::PolygonMode::FILL,
            cull_mode: vk::CullModeFlags::NONE,
            depth_test: true,
        }
    }

    /// Override the polygon mode
    pub fn with_polygon_mode(mut self, mode: vk::PolygonMode) -> Self {
        self.polygon_mode = mode;
        self
    }

    /// Override face culling
    pub fn with_cull_mode(mut self, mode: vk::CullModeFlags) -> Self {
        self.cull_mode = mode;
        self
    }

    /// Enable or disable depth testing
    pub fn with_depth_test(mut self, enabled: bool) -> Self {
        self.depth_test = enabled;
        self
    }
}

/// Attachment clear values for the frame's render pass
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClearValues {
    /// RGBA clear color
    pub color: [f32; 4],
    /// Depth clear value
    pub depth: f32,
}

impl Default for ClearValues {
    fn default() -> Self {
        Self {
            color: [0.0, 0.0, 0.0, 1.0],
            depth: 1.0,
        }
    }
}

/// Operations the frame core drives on a GPU
///
/// Recording operations take the command target they record into; a backend
/// may reject them with `GpuError::InvalidOperation` when the target is not in
/// the recording state.
pub trait GpuDevice {
    /// `minUniformBufferOffsetAlignment` of the device (power of two or zero)
    fn min_uniform_buffer_offset_alignment(&self) -> u64;

    /// Extent of the presentable images
    fn swapchain_extent(&self) -> Extent;

    /// Create a fence, optionally already signaled
    fn create_fence(&mut self, signaled: bool) -> GpuResult<FenceId>;

    /// Create a binary semaphore
    fn create_semaphore(&mut self) -> GpuResult<SemaphoreId>;

    /// Create a resettable command recording target
    fn create_command_target(&mut self) -> GpuResult<CommandTargetId>;

    /// Create a host-visible buffer of `size` bytes
    fn create_buffer(&mut self, size: u64, usage: BufferUsage) -> GpuResult<BufferId>;

    /// Copy `data` into `buffer` at `offset` (map, copy, unmap)
    fn write_buffer(&mut self, buffer: BufferId, offset: u64, data: &[u8]) -> GpuResult<()>;

    /// Build a pipeline and its layout
    fn create_pipeline(&mut self, desc: &PipelineDesc) -> GpuResult<(PipelineId, PipelineLayoutId)>;

    /// Allocate a descriptor set of `layout` and write `bindings` into it
    fn create_descriptor_set(
        &mut self,
        layout: DescriptorLayoutKind,
        bindings: &[DescriptorBinding],
    ) -> GpuResult<DescriptorSetId>;

    /// Destroy any resource created by this device
    fn destroy(&mut self, resource: ResourceId) -> GpuResult<()>;

    /// Block until `fence` is signaled or `timeout` elapses
    fn wait_fence(&mut self, fence: FenceId, timeout: Duration) -> GpuResult<()>;

    /// Return `fence` to the unsignaled state
    fn reset_fence(&mut self, fence: FenceId) -> GpuResult<()>;

    /// Acquire the next presentable image, signaling `signal` when it is ready
    fn acquire_next_image(&mut self, signal: SemaphoreId, timeout: Duration) -> GpuResult<u32>;

    /// Discard previous contents of the target
    fn reset_commands(&mut self, target: CommandTargetId) -> GpuResult<()>;

    /// Begin one-time-submit recording
    fn begin_commands(&mut self, target: CommandTargetId) -> GpuResult<()>;

    /// Finish recording
    fn end_commands(&mut self, target: CommandTargetId) -> GpuResult<()>;

    /// Begin the frame render pass on swapchain image `image_index`
    fn begin_render_pass(&mut self, target: CommandTargetId, image_index: u32, clear: ClearValues) -> GpuResult<()>;

    /// End the frame render pass
    fn end_render_pass(&mut self, target: CommandTargetId) -> GpuResult<()>;

    /// Bind a graphics pipeline
    fn bind_pipeline(&mut self, target: CommandTargetId, pipeline: PipelineId) -> GpuResult<()>;

    /// Bind descriptor sets starting at `first_set`
    fn bind_descriptor_sets(
        &mut self,
        target: CommandTargetId,
        layout: PipelineLayoutId,
        first_set: u32,
        sets: &[DescriptorSetId],
        dynamic_offsets: &[u32],
    ) -> GpuResult<()>;

    /// Bind vertex buffer binding 0
    fn bind_vertex_buffer(&mut self, target: CommandTargetId, buffer: BufferId) -> GpuResult<()>;

    /// Push vertex-stage constants inline into the command stream
    fn push_constants(&mut self, target: CommandTargetId, layout: PipelineLayoutId, data: &[u8]) -> GpuResult<()>;

    /// Record a non-indexed draw
    fn draw(
        &mut self,
        target: CommandTargetId,
        vertex_count: u32,
        instance_count: u32,
        first_vertex: u32,
        first_instance: u32,
    ) -> GpuResult<()>;

    /// Submit recorded work: wait on `wait`, then signal `signal` and `fence`
    fn submit(
        &mut self,
        target: CommandTargetId,
        wait: SemaphoreId,
        signal: SemaphoreId,
        fence: FenceId,
    ) -> GpuResult<()>;

    /// Present `image_index` once `wait` is signaled
    fn present(&mut self, image_index: u32, wait: SemaphoreId) -> GpuResult<()>;

    /// Block until all submitted work has completed
    fn wait_idle(&mut self) -> GpuResult<()>;

    /// Write a plain-old-data value into `buffer` at `offset`
    fn write_pod<T: bytemuck::Pod>(&mut self, buffer: BufferId, offset: u64, value: &T) -> GpuResult<()>
    where
        Self: Sized,
    {
        self.write_buffer(buffer, offset, bytemuck::bytes_of(value))
    }
}

/// Slot-keyed storage for a backend's native resource records
pub struct ResourceArena<R> {
    records: SlotMap<ResourceId, R>,
}

impl<R> ResourceArena<R> {
    /// Create an empty arena
    pub fn new() -> Self {
        Self { records: SlotMap::with_key() }
    }

    /// Store a record and return its key
    pub fn insert(&mut self, record: R) -> ResourceId {
        self.records.insert(record)
    }

    /// Look up a live record
    pub fn get(&self, id: ResourceId) -> GpuResult<&R> {
        self.records.get(id).ok_or(GpuError::UnknownResource)
    }

    /// Look up a live record mutably
    pub fn get_mut(&mut self, id: ResourceId) -> GpuResult<&mut R> {
        self.records.get_mut(id).ok_or(GpuError::UnknownResource)
    }

    /// Remove a record, failing on stale ids
    pub fn remove(&mut self, id: ResourceId) -> GpuResult<R> {
        self.records.remove(id).ok_or(GpuError::UnknownResource)
    }

    /// Whether `id` is live
    pub fn contains(&self, id: ResourceId) -> bool {
        self.records.contains_key(id)
    }

    /// Number of live records
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether the arena is empty
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Iterate live records
    pub fn iter(&self) -> impl Iterator<Item = (ResourceId, &R)> {
        self.records.iter()
    }

    /// Remove and yield every record
    pub fn drain(&mut self) -> impl Iterator<Item = (ResourceId, R)> + '_ {
        self.records.drain()
    }
}

impl<R> Default for ResourceArena<R> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_arena_rejects_stale_ids() {
        let mut arena = ResourceArena::new();
        let id = arena.insert("fence");
        assert_eq!(arena.get(id), Ok(&"fence"));
        assert_eq!(arena.remove(id), Ok("fence"));
        assert_eq!(arena.get(id), Err(GpuError::UnknownResource));
        assert_eq!(arena.remove(id), Err(GpuError::UnknownResource));

        // Slot reuse must not resurrect the old handle
        let reused = arena.insert("semaphore");
        assert_ne!(reused, id);
        assert!(!arena.contains(id));
    }

    #[test]
    fn test_handles_convert_to_resource_ids() {
        let mut arena = ResourceArena::new();
        let fence = FenceId(arena.insert(()));
        let id: ResourceId = fence.into();
        assert_eq!(id, fence.resource());
    }

    #[test]
    fn test_pipeline_desc_defaults() {
        let desc = PipelineDesc::new("a.vert.spv", "a.frag.spv").with_polygon_mode(vk::PolygonMode::LINE);
        assert_eq!(desc.topology, vk::PrimitiveTopology::TRIANGLE_LIST);
        assert_eq!(desc.polygon_mode, vk::PolygonMode::LINE);
        assert!(desc.depth_test);
        assert_eq!(DescriptorLayoutKind::Objects.set_index(), 1);
    }
}
