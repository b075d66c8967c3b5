//! Ring of overlapping in-flight frames
//!
//! Each slot owns the synchronization objects, command target and buffers
//! needed to record and submit one frame. Slot `k` is reused every N frames,
//! and only after its render-complete fence from the previous use has been
//! waited on; that wait is what makes it safe for the CPU to overwrite the
//! slot's buffers.
//!
//! The scene uniform buffer is the one resource shared by all slots. It holds
//! N alignment-padded replicas, and slot `k` only ever writes replica `k`.

use crate::config::EngineConfig;
use crate::deletion_queue::DeletionQueue;
use crate::error::{FrameError, FrameResult, GpuError, GpuResult};
use crate::gpu::{
    BufferId, BufferUsage, CommandTargetId, DescriptorBinding, DescriptorKind, DescriptorLayoutKind,
    DescriptorSetId, FenceId, GpuDevice, ResourceId, SemaphoreId,
};
use crate::scene::{GpuCameraData, GpuObjectData, GpuSceneData};
use crate::uniform::ReplicaLayout;

/// Resources exclusively owned by one ring entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameSlot {
    /// Signaled when the GPU finished this slot's previous submission
    pub render_fence: FenceId,
    /// Signaled when the acquired swapchain image is ready to be rendered to
    pub image_acquired: SemaphoreId,
    /// Signaled when rendering finished and the image may be presented
    pub render_finished: SemaphoreId,
    /// Command recording target
    pub commands: CommandTargetId,
    /// One `GpuCameraData` block
    pub camera_buffer: BufferId,
    /// `max_objects` `GpuObjectData` entries
    pub object_buffer: BufferId,
    /// Set 0: camera + dynamically offset scene replica
    pub global_descriptor: DescriptorSetId,
    /// Set 1: object array
    pub object_descriptor: DescriptorSetId,
}

/// N frame slots plus the frame counter selecting between them
#[derive(Debug)]
pub struct FrameRing {
    slots: Vec<FrameSlot>,
    scene_buffer: BufferId,
    scene_layout: ReplicaLayout,
    max_objects: usize,
    frame_number: u64,
}

fn register_destroy<D: GpuDevice + 'static>(queue: &mut DeletionQueue<D>, resource: impl Into<ResourceId> + 'static) {
    let resource = resource.into();
    queue.register(move |device: &mut D| device.destroy(resource));
}

fn setup(what: &'static str) -> impl FnOnce(GpuError) -> FrameError {
    move |source| FrameError::Setup(format!("failed to create {what}: {source}"))
}

impl FrameRing {
    /// Create `config.frame_slots` slots and the shared scene buffer
    ///
    /// Every object's teardown is registered with `deletion_queue` right after
    /// it is created. Any failure is fatal; objects created before the failure
    /// are still released by flushing the queue.
    pub fn create<D: GpuDevice + 'static>(
        device: &mut D,
        config: &EngineConfig,
        deletion_queue: &mut DeletionQueue<D>,
    ) -> FrameResult<Self> {
        let slot_count = config.frame_slots;
        let max_objects = config.max_objects;
        if slot_count == 0 || max_objects == 0 {
            return Err(FrameError::Setup(format!(
                "frame ring needs at least one slot and one object, got {slot_count} slots and {max_objects} objects"
            )));
        }
        let scene_layout = ReplicaLayout::of::<GpuSceneData>(device.min_uniform_buffer_offset_alignment(), slot_count);
        if scene_layout.dynamic_offset(slot_count - 1).is_none() {
            return Err(FrameError::Setup(format!(
                "scene replicas with stride {} do not fit 32-bit dynamic offsets",
                scene_layout.stride()
            )));
        }
        let camera_size = std::mem::size_of::<GpuCameraData>() as u64;
        let object_size = std::mem::size_of::<GpuObjectData>()
            .checked_mul(max_objects)
            .and_then(|bytes| u64::try_from(bytes).ok())
            .ok_or_else(|| FrameError::Setup(format!("object buffer for {max_objects} objects overflows")))?;

        log::info!(
            "Creating frame ring: {slot_count} slots, {max_objects} objects/slot, scene stride {} bytes",
            scene_layout.stride()
        );

        struct PartialSlot {
            render_fence: FenceId,
            image_acquired: SemaphoreId,
            render_finished: SemaphoreId,
            commands: CommandTargetId,
            camera_buffer: BufferId,
            object_buffer: BufferId,
        }

        let mut partial = Vec::with_capacity(slot_count);
        for _ in 0..slot_count {
            // Signaled so the first use of the slot does not block
            let render_fence = device.create_fence(true).map_err(setup("render fence"))?;
            register_destroy(deletion_queue, render_fence);

            let image_acquired = device.create_semaphore().map_err(setup("image-acquired semaphore"))?;
            register_destroy(deletion_queue, image_acquired);
            let render_finished = device.create_semaphore().map_err(setup("render-finished semaphore"))?;
            register_destroy(deletion_queue, render_finished);

            let commands = device.create_command_target().map_err(setup("command target"))?;
            register_destroy(deletion_queue, commands);

            let camera_buffer = device
                .create_buffer(camera_size, BufferUsage::Uniform)
                .map_err(setup("camera buffer"))?;
            register_destroy(deletion_queue, camera_buffer);

            let object_buffer = device
                .create_buffer(object_size, BufferUsage::Storage)
                .map_err(setup("object buffer"))?;
            register_destroy(deletion_queue, object_buffer);

            partial.push(PartialSlot {
                render_fence,
                image_acquired,
                render_finished,
                commands,
                camera_buffer,
                object_buffer,
            });
        }

        let scene_buffer = device
            .create_buffer(scene_layout.total_size(), BufferUsage::Uniform)
            .map_err(setup("scene buffer"))?;
        register_destroy(deletion_queue, scene_buffer);

        let mut slots = Vec::with_capacity(slot_count);
        for slot in partial {
            let global_descriptor = device
                .create_descriptor_set(
                    DescriptorLayoutKind::Global,
                    &[
                        DescriptorBinding {
                            binding: 0,
                            kind: DescriptorKind::UniformBuffer,
                            buffer: slot.camera_buffer,
                            offset: 0,
                            range: camera_size,
                        },
                        DescriptorBinding {
                            binding: 1,
                            kind: DescriptorKind::UniformBufferDynamic,
                            buffer: scene_buffer,
                            offset: 0,
                            range: scene_layout.block_size(),
                        },
                    ],
                )
                .map_err(setup("global descriptor set"))?;
            register_destroy(deletion_queue, global_descriptor);

            let object_descriptor = device
                .create_descriptor_set(
                    DescriptorLayoutKind::Objects,
                    &[DescriptorBinding {
                        binding: 0,
                        kind: DescriptorKind::StorageBuffer,
                        buffer: slot.object_buffer,
                        offset: 0,
                        range: object_size,
                    }],
                )
                .map_err(setup("object descriptor set"))?;
            register_destroy(deletion_queue, object_descriptor);

            slots.push(FrameSlot {
                render_fence: slot.render_fence,
                image_acquired: slot.image_acquired,
                render_finished: slot.render_finished,
                commands: slot.commands,
                camera_buffer: slot.camera_buffer,
                object_buffer: slot.object_buffer,
                global_descriptor,
                object_descriptor,
            });
        }

        Ok(Self {
            slots,
            scene_buffer,
            scene_layout,
            max_objects,
            frame_number: 0,
        })
    }

    /// Number of slots
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether the ring has no slots
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Frames started so far
    pub fn frame_number(&self) -> u64 {
        self.frame_number
    }

    /// Slot index used by `frame_number`
    pub fn slot_index_for(&self, frame_number: u64) -> usize {
        (frame_number % self.slots.len() as u64) as usize
    }

    /// Slot index of the current frame
    pub fn current_index(&self) -> usize {
        self.slot_index_for(self.frame_number)
    }

    /// Slot of the current frame (`frame_number mod N`)
    pub fn current(&self) -> &FrameSlot {
        &self.slots[self.current_index()]
    }

    /// Slot by index
    pub fn slot(&self, index: usize) -> Option<&FrameSlot> {
        self.slots.get(index)
    }

    /// All slots
    pub fn slots(&self) -> &[FrameSlot] {
        &self.slots
    }

    /// Move to the next frame
    pub fn advance(&mut self) {
        self.frame_number += 1;
    }

    /// Buffer shared by all slots holding the scene replicas
    pub fn scene_buffer(&self) -> BufferId {
        self.scene_buffer
    }

    /// Placement of the scene replicas
    pub fn scene_layout(&self) -> ReplicaLayout {
        self.scene_layout
    }

    /// Capacity of each slot's object array
    pub fn max_objects(&self) -> usize {
        self.max_objects
    }

    /// Overwrite the current slot's camera block
    pub fn write_camera<D: GpuDevice>(&self, device: &mut D, camera: &GpuCameraData) -> GpuResult<()> {
        device.write_pod(self.current().camera_buffer, 0, camera)
    }

    /// Overwrite the current slot's scene replica
    pub fn write_scene<D: GpuDevice>(&self, device: &mut D, scene: &GpuSceneData) -> GpuResult<()> {
        let offset = self.scene_layout.offset(self.current_index());
        device.write_pod(self.scene_buffer, offset, scene)
    }

    /// Overwrite the first `objects.len()` entries of the current slot's object array
    pub fn write_objects<D: GpuDevice>(&self, device: &mut D, objects: &[GpuObjectData]) -> FrameResult<()> {
        if objects.len() > self.max_objects {
            return Err(FrameError::ObjectCapacityExceeded {
                requested: objects.len(),
                capacity: self.max_objects,
            });
        }
        if objects.is_empty() {
            return Ok(());
        }
        device
            .write_buffer(self.current().object_buffer, 0, bytemuck::cast_slice(objects))
            .map_err(FrameError::op("write object buffer"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::headless::RecordingDevice;

    fn ring_with(slots: usize) -> (RecordingDevice, DeletionQueue<RecordingDevice>, FrameRing) {
        let mut device = RecordingDevice::new();
        let mut queue = DeletionQueue::new();
        let config = EngineConfig::default().with_frame_slots(slots).with_max_objects(16);
        let ring = FrameRing::create(&mut device, &config, &mut queue).unwrap();
        (device, queue, ring)
    }

    #[test]
    fn test_slot_selection_is_periodic() {
        let (mut device, mut queue, mut ring) = ring_with(2);
        let n = ring.len();
        let mut visits = vec![0usize; n];
        let mut seen = Vec::new();
        for frame in 0..(2 * n as u64) {
            assert_eq!(ring.frame_number(), frame);
            visits[ring.current_index()] += 1;
            seen.push(ring.current().clone());
            ring.advance();
        }
        assert!(visits.iter().all(|&count| count == 2));
        for frame in 0..n {
            assert_eq!(seen[frame], seen[frame + n]);
        }
        queue.flush(&mut device).unwrap();
    }

    #[test]
    fn test_slots_do_not_share_resources() {
        let (mut device, mut queue, ring) = ring_with(3);
        let slots = ring.slots();
        for (i, a) in slots.iter().enumerate() {
            for b in &slots[i + 1..] {
                assert_ne!(a.render_fence, b.render_fence);
                assert_ne!(a.commands, b.commands);
                assert_ne!(a.camera_buffer, b.camera_buffer);
                assert_ne!(a.object_buffer, b.object_buffer);
            }
        }
        queue.flush(&mut device).unwrap();
    }

    #[test]
    fn test_fences_start_signaled() {
        let (mut device, mut queue, ring) = ring_with(2);
        for slot in ring.slots() {
            assert_eq!(device.fence_signaled(slot.render_fence), Some(true));
        }
        queue.flush(&mut device).unwrap();
    }

    #[test]
    fn test_scene_buffer_sized_for_padded_replicas() {
        let (mut device, mut queue, ring) = ring_with(2);
        assert_eq!(ring.scene_layout().stride(), 256);
        assert_eq!(device.buffer_contents(ring.scene_buffer()).map(<[u8]>::len), Some(512));
        queue.flush(&mut device).unwrap();
    }

    #[test]
    fn test_flush_releases_everything_in_reverse() {
        let (mut device, mut queue, _ring) = ring_with(2);
        let live = device.live_resources();
        // 6 per slot + scene buffer + 2 descriptor sets per slot
        assert_eq!(live, 2 * 6 + 1 + 2 * 2);
        assert_eq!(queue.len(), live);

        queue.flush(&mut device).unwrap();
        assert_eq!(device.live_resources(), 0);
    }

    #[test]
    fn test_creation_failure_is_setup_error() {
        let mut device = RecordingDevice::new();
        device.fail_next(crate::headless::FailPoint::CreateSemaphore, ash::vk::Result::ERROR_OUT_OF_HOST_MEMORY);
        let mut queue = DeletionQueue::new();
        let err = FrameRing::create(&mut device, &EngineConfig::default(), &mut queue).unwrap_err();
        assert!(matches!(err, FrameError::Setup(_)));

        // The fence created before the failure is still released
        assert_eq!(device.live_resources(), 1);
        queue.flush(&mut device).unwrap();
        assert_eq!(device.live_resources(), 0);
    }

    #[test]
    fn test_oversized_object_array_is_setup_error() {
        let mut device = RecordingDevice::new();
        let mut queue = DeletionQueue::new();
        let config = EngineConfig::default().with_max_objects(1 << 59);
        let err = FrameRing::create(&mut device, &config, &mut queue).unwrap_err();
        assert!(matches!(err, FrameError::Setup(_)));
        assert_eq!(device.live_resources(), 0);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_unaddressable_scene_replica_is_setup_error() {
        let mut device = RecordingDevice::new().with_min_alignment(1 << 31);
        let mut queue = DeletionQueue::new();
        let config = EngineConfig::default().with_frame_slots(3);
        let err = FrameRing::create(&mut device, &config, &mut queue).unwrap_err();
        assert!(matches!(err, FrameError::Setup(_)));
        assert_eq!(device.live_resources(), 0);
    }

    #[test]
    fn test_write_objects_respects_capacity() {
        let (mut device, mut queue, ring) = ring_with(2);
        let objects = vec![GpuObjectData { model: [[0.0; 4]; 4] }; 17];
        let err = ring.write_objects(&mut device, &objects).unwrap_err();
        assert!(matches!(err, FrameError::ObjectCapacityExceeded { requested: 17, capacity: 16 }));
        assert!(ring.write_objects(&mut device, &objects[..16]).is_ok());
        queue.flush(&mut device).unwrap();
    }
}
