//! Draw list submission with redundant-bind elimination
//!
//! The batcher writes the current slot's per-frame data and then records one
//! draw per renderable, in list order. Pipeline and descriptor state are only
//! rebound when the material changes, and the vertex buffer only when the
//! geometry changes, so a list sorted by material (then geometry) records the
//! fewest state transitions.
//!
//! Entry `i` of the draw list owns entry `i` of the slot's object array and is
//! drawn with `first_instance = i`; the vertex shader uses the instance index
//! to fetch its object data.

use crate::error::{FrameError, FrameResult};
use crate::frame_ring::FrameRing;
use crate::gpu::{DescriptorLayoutKind, GpuDevice};
use crate::registry::{GeometryHandle, MaterialHandle, ResourceRegistry};
use crate::scene::{CameraPolicy, GpuObjectData, MeshPushConstants, RenderableEntry, SceneParameters};

/// State transitions recorded for one frame
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BindStats {
    /// Pipeline binds (each followed by one descriptor-set bind)
    pub pipeline_binds: u32,
    /// Vertex buffer binds
    pub vertex_buffer_binds: u32,
    /// Draw commands recorded
    pub draws: u32,
    /// Entries skipped because a handle did not resolve
    pub skipped: u32,
}

/// Records a frame's draw list against the current frame slot
///
/// An entry whose material or geometry handle does not resolve in the
/// registry is a caller bug. It is skipped with a warning and counted in
/// [`BindStats::skipped`]; its object-array entry is still written so the
/// remaining draws keep their indices.
#[derive(Debug, Clone, Default)]
pub struct DrawBatcher {
    camera: CameraPolicy,
}

impl DrawBatcher {
    /// Batcher using `camera` for the per-frame camera block
    pub fn new(camera: CameraPolicy) -> Self {
        Self { camera }
    }

    /// Camera placement in use
    pub fn camera(&self) -> &CameraPolicy {
        &self.camera
    }

    /// Replace the camera placement
    pub fn set_camera(&mut self, camera: CameraPolicy) {
        self.camera = camera;
    }

    /// Write the current slot's camera block, scene replica and object array
    ///
    /// Must only be called after the slot's render fence has been waited on.
    pub fn write_frame_data<D: GpuDevice>(
        &self,
        device: &mut D,
        ring: &FrameRing,
        renderables: &[RenderableEntry],
    ) -> FrameResult<()> {
        if renderables.len() > ring.max_objects() {
            return Err(FrameError::ObjectCapacityExceeded {
                requested: renderables.len(),
                capacity: ring.max_objects(),
            });
        }

        let camera = self.camera.camera_data(device.swapchain_extent());
        ring.write_camera(device, &camera)
            .map_err(FrameError::op("write camera buffer"))?;

        let scene = SceneParameters::animated(ring.frame_number()).gpu_data();
        ring.write_scene(device, &scene)
            .map_err(FrameError::op("write scene buffer"))?;

        let objects: Vec<GpuObjectData> = renderables
            .iter()
            .map(|entry| GpuObjectData { model: entry.transform.into() })
            .collect();
        ring.write_objects(device, &objects)
    }

    /// Record binds, push constants and draws for `renderables`
    ///
    /// The slot's command target must be inside the frame's render pass.
    pub fn record_draws<D: GpuDevice>(
        &self,
        device: &mut D,
        ring: &FrameRing,
        registry: &ResourceRegistry,
        renderables: &[RenderableEntry],
    ) -> FrameResult<BindStats> {
        let slot = ring.current();
        let target = slot.commands;
        let scene_offset = ring
            .scene_layout()
            .dynamic_offset(ring.current_index())
            .ok_or_else(|| FrameError::Setup(format!("scene replica {} has no 32-bit offset", ring.current_index())))?;

        let mut stats = BindStats::default();
        let mut last_material: Option<MaterialHandle> = None;
        let mut last_geometry: Option<GeometryHandle> = None;

        for (index, entry) in renderables.iter().enumerate() {
            let (Some(material), Some(geometry)) =
                (registry.material(entry.material), registry.geometry(entry.geometry))
            else {
                log::warn!(
                    "Skipping draw #{index}: unresolved material {:?} or geometry {:?}",
                    entry.material,
                    entry.geometry
                );
                stats.skipped += 1;
                continue;
            };

            if last_material != Some(entry.material) {
                device
                    .bind_pipeline(target, material.pipeline)
                    .map_err(FrameError::op("bind pipeline"))?;
                device
                    .bind_descriptor_sets(
                        target,
                        material.layout,
                        DescriptorLayoutKind::Global.set_index(),
                        &[slot.global_descriptor, slot.object_descriptor],
                        &[scene_offset],
                    )
                    .map_err(FrameError::op("bind descriptor sets"))?;
                last_material = Some(entry.material);
                stats.pipeline_binds += 1;
            }

            if last_geometry != Some(entry.geometry) {
                device
                    .bind_vertex_buffer(target, geometry.vertex_buffer)
                    .map_err(FrameError::op("bind vertex buffer"))?;
                last_geometry = Some(entry.geometry);
                stats.vertex_buffer_binds += 1;
            }

            let constants = MeshPushConstants::from_transform(&entry.transform);
            device
                .push_constants(target, material.layout, bytemuck::bytes_of(&constants))
                .map_err(FrameError::op("push constants"))?;

            let instance = u32::try_from(index).map_err(|_| FrameError::ObjectCapacityExceeded {
                requested: renderables.len(),
                capacity: u32::MAX as usize,
            })?;
            device
                .draw(target, geometry.vertex_count, 1, 0, instance)
                .map_err(FrameError::op("draw"))?;
            stats.draws += 1;
        }

        log::trace!(
            "Frame {}: {} draws, {} pipeline binds, {} vertex binds, {} skipped",
            ring.frame_number(),
            stats.draws,
            stats.pipeline_binds,
            stats.vertex_buffer_binds,
            stats.skipped
        );
        Ok(stats)
    }

    /// Write the frame data, then record the draw list
    pub fn draw_objects<D: GpuDevice>(
        &self,
        device: &mut D,
        ring: &FrameRing,
        registry: &ResourceRegistry,
        renderables: &[RenderableEntry],
    ) -> FrameResult<BindStats> {
        self.write_frame_data(device, ring, renderables)?;
        self.record_draws(device, ring, registry, renderables)
    }
}

/// Stable sort grouping draws by material, then geometry
///
/// Sorting changes list indices, so it must happen before the list is handed
/// to the batcher.
pub fn sort_for_batching(renderables: &mut [RenderableEntry]) {
    renderables.sort_by_key(|entry| (entry.material, entry.geometry));
}
