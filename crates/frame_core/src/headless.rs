//! In-memory device that records every call
//!
//! `RecordingDevice` implements [`GpuDevice`] without a GPU. It keeps the
//! state a driver would validate (fence and semaphore signal state, command
//! buffer lifecycle, resource references) and rejects misuse with
//! `GpuError::InvalidOperation`, so the frame loop's ordering rules can be
//! checked in tests.
//!
//! Submitted work completes immediately unless the GPU is stalled, in which
//! case fences stay unsignaled until [`RecordingDevice::complete_pending`] or
//! `wait_idle` runs. While work is pending, host writes into any buffer range
//! its command target bound are rejected.

use std::collections::HashMap;
use std::time::Duration;

use ash::vk;

use crate::config::Extent;
use crate::error::{GpuError, GpuResult};
use crate::gpu::{
    BufferId, BufferUsage, ClearValues, CommandTargetId, DescriptorBinding, DescriptorKind, DescriptorLayoutKind,
    DescriptorSetId, FenceId, GpuDevice, PipelineDesc, PipelineId, PipelineLayoutId, ResourceArena,
    ResourceId, SemaphoreId,
};

/// Operations that can be made to fail once with [`RecordingDevice::fail_next`]
#[allow(missing_docs)] // Named after the GpuDevice method they fail
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailPoint {
    CreateFence,
    CreateSemaphore,
    CreateCommandTarget,
    CreateBuffer,
    WriteBuffer,
    CreatePipeline,
    CreateDescriptorSet,
    Destroy,
    WaitFence,
    ResetFence,
    AcquireImage,
    BeginCommands,
    EndCommands,
    Draw,
    Submit,
    Present,
    WaitIdle,
}

/// One call observed by the device, in call order
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq)]
pub enum RecordedCommand {
    WaitFence(FenceId),
    ResetFence(FenceId),
    AcquireImage { signal: SemaphoreId, image_index: u32 },
    ResetCommands(CommandTargetId),
    BeginCommands(CommandTargetId),
    BeginRenderPass { target: CommandTargetId, image_index: u32, clear: ClearValues },
    EndRenderPass(CommandTargetId),
    BindPipeline { target: CommandTargetId, pipeline: PipelineId },
    BindDescriptorSets {
        target: CommandTargetId,
        layout: PipelineLayoutId,
        first_set: u32,
        sets: Vec<DescriptorSetId>,
        dynamic_offsets: Vec<u32>,
    },
    BindVertexBuffer { target: CommandTargetId, buffer: BufferId },
    PushConstants { target: CommandTargetId, layout: PipelineLayoutId, data: Vec<u8> },
    Draw {
        target: CommandTargetId,
        vertex_count: u32,
        instance_count: u32,
        first_vertex: u32,
        first_instance: u32,
    },
    EndCommands(CommandTargetId),
    Submit { target: CommandTargetId, wait: SemaphoreId, signal: SemaphoreId, fence: FenceId },
    Present { image_index: u32, wait: SemaphoreId },
    WaitIdle,
    Destroy(ResourceId),
    WriteBuffer { buffer: BufferId, offset: u64, len: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CommandState {
    Initial,
    Recording,
    InRenderPass,
    Executable,
    Pending,
}

#[derive(Debug)]
enum Record {
    Fence { signaled: bool },
    Semaphore { signaled: bool },
    CommandTarget { state: CommandState },
    Buffer { usage: BufferUsage, data: Vec<u8> },
    Pipeline { layout: ResourceId },
    PipelineLayout,
    DescriptorSet { layout: DescriptorLayoutKind, bindings: Vec<DescriptorBinding> },
}

/// Byte range of a buffer read by recorded commands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct BoundRange {
    buffer: BufferId,
    start: u64,
    end: u64,
}

impl BoundRange {
    fn overlaps(&self, buffer: BufferId, start: u64, end: u64) -> bool {
        self.buffer == buffer && start < self.end && self.start < end
    }
}

impl Record {
    fn kind(&self) -> &'static str {
        match self {
            Self::Fence { .. } => "fence",
            Self::Semaphore { .. } => "semaphore",
            Self::CommandTarget { .. } => "command target",
            Self::Buffer { .. } => "buffer",
            Self::Pipeline { .. } => "pipeline",
            Self::PipelineLayout => "pipeline layout",
            Self::DescriptorSet { .. } => "descriptor set",
        }
    }
}

fn invalid(message: impl Into<String>) -> GpuError {
    GpuError::InvalidOperation(message.into())
}

/// Headless [`GpuDevice`] with command recording and fault injection
pub struct RecordingDevice {
    resources: ResourceArena<Record>,
    commands: Vec<RecordedCommand>,
    extent: Extent,
    min_alignment: u64,
    image_count: u32,
    next_image: u32,
    stalled: bool,
    pending: Vec<(CommandTargetId, FenceId)>,
    bound: HashMap<CommandTargetId, Vec<BoundRange>>,
    failures: HashMap<FailPoint, vk::Result>,
}

impl RecordingDevice {
    /// 1700x900 swapchain of three images, 256-byte uniform alignment
    pub fn new() -> Self {
        Self::with_extent(Extent::default())
    }

    /// Device presenting images of `extent`
    pub fn with_extent(extent: Extent) -> Self {
        Self {
            resources: ResourceArena::new(),
            commands: Vec::new(),
            extent,
            min_alignment: 256,
            image_count: 3,
            next_image: 0,
            stalled: false,
            pending: Vec::new(),
            bound: HashMap::new(),
            failures: HashMap::new(),
        }
    }

    /// Override the reported `minUniformBufferOffsetAlignment`
    pub fn with_min_alignment(mut self, alignment: u64) -> Self {
        self.min_alignment = alignment;
        self
    }

    /// Override the number of swapchain images
    pub fn with_image_count(mut self, count: u32) -> Self {
        self.image_count = count.max(1);
        self
    }

    /// Make the next call of `point` fail with `result`
    pub fn fail_next(&mut self, point: FailPoint, result: vk::Result) {
        self.failures.insert(point, result);
    }

    /// Keep submitted work pending so its fences never signal
    pub fn stall_gpu(&mut self, stalled: bool) {
        self.stalled = stalled;
    }

    /// Finish every pending submission
    pub fn complete_pending(&mut self) {
        for (target, fence) in std::mem::take(&mut self.pending) {
            if let Ok(Record::CommandTarget { state }) = self.resources.get_mut(target.resource()) {
                *state = CommandState::Executable;
            }
            if let Ok(Record::Fence { signaled }) = self.resources.get_mut(fence.resource()) {
                *signaled = true;
            }
        }
    }

    /// Every call recorded so far
    pub fn commands(&self) -> &[RecordedCommand] {
        &self.commands
    }

    /// Drain the call log
    pub fn take_commands(&mut self) -> Vec<RecordedCommand> {
        std::mem::take(&mut self.commands)
    }

    /// Number of live resources
    pub fn live_resources(&self) -> usize {
        self.resources.len()
    }

    /// Whether `resource` is live
    pub fn is_live(&self, resource: impl Into<ResourceId>) -> bool {
        self.resources.contains(resource.into())
    }

    /// Current bytes of a buffer
    pub fn buffer_contents(&self, buffer: BufferId) -> Option<&[u8]> {
        match self.resources.get(buffer.resource()) {
            Ok(Record::Buffer { data, .. }) => Some(data),
            _ => None,
        }
    }

    /// Usage a buffer was created with
    pub fn buffer_usage(&self, buffer: BufferId) -> Option<BufferUsage> {
        match self.resources.get(buffer.resource()) {
            Ok(Record::Buffer { usage, .. }) => Some(*usage),
            _ => None,
        }
    }

    /// Signal state of a fence
    pub fn fence_signaled(&self, fence: FenceId) -> Option<bool> {
        match self.resources.get(fence.resource()) {
            Ok(Record::Fence { signaled }) => Some(*signaled),
            _ => None,
        }
    }

    /// Layout kind of a descriptor set
    pub fn descriptor_layout(&self, set: DescriptorSetId) -> Option<DescriptorLayoutKind> {
        match self.resources.get(set.resource()) {
            Ok(Record::DescriptorSet { layout, .. }) => Some(*layout),
            _ => None,
        }
    }

    fn check(&mut self, point: FailPoint) -> GpuResult<()> {
        match self.failures.remove(&point) {
            Some(result) => Err(GpuError::from(result)),
            None => Ok(()),
        }
    }

    fn fence_mut(&mut self, fence: FenceId) -> GpuResult<&mut bool> {
        match self.resources.get_mut(fence.resource())? {
            Record::Fence { signaled } => Ok(signaled),
            _ => Err(GpuError::ResourceKindMismatch { expected: "fence" }),
        }
    }

    fn semaphore_mut(&mut self, semaphore: SemaphoreId) -> GpuResult<&mut bool> {
        match self.resources.get_mut(semaphore.resource())? {
            Record::Semaphore { signaled } => Ok(signaled),
            _ => Err(GpuError::ResourceKindMismatch { expected: "semaphore" }),
        }
    }

    fn command_state(&mut self, target: CommandTargetId) -> GpuResult<&mut CommandState> {
        match self.resources.get_mut(target.resource())? {
            Record::CommandTarget { state } => Ok(state),
            _ => Err(GpuError::ResourceKindMismatch { expected: "command target" }),
        }
    }

    fn expect_kind(&self, resource: ResourceId, expected: &'static str) -> GpuResult<()> {
        let record = self.resources.get(resource)?;
        if record.kind() == expected {
            Ok(())
        } else {
            Err(GpuError::ResourceKindMismatch { expected })
        }
    }

    fn transition(
        &mut self,
        target: CommandTargetId,
        from: CommandState,
        to: CommandState,
        operation: &str,
    ) -> GpuResult<()> {
        let state = self.command_state(target)?;
        if *state != from {
            return Err(invalid(format!("{operation} requires {from:?} command target, found {state:?}")));
        }
        *state = to;
        Ok(())
    }

    fn require_in_render_pass(&mut self, target: CommandTargetId, operation: &str) -> GpuResult<()> {
        let state = self.command_state(target)?;
        if *state != CommandState::InRenderPass {
            return Err(invalid(format!("{operation} recorded outside a render pass ({state:?})")));
        }
        Ok(())
    }

    fn bind_range(&mut self, target: CommandTargetId, range: BoundRange) {
        self.bound.entry(target).or_default().push(range);
    }

    fn in_use_by_pending_work(&self, buffer: BufferId, start: u64, end: u64) -> bool {
        self.pending.iter().any(|(target, _)| {
            self.bound
                .get(target)
                .is_some_and(|ranges| ranges.iter().any(|range| range.overlaps(buffer, start, end)))
        })
    }

    fn referenced_by_live_object(&self, resource: ResourceId) -> bool {
        self.resources.iter().any(|(_, record)| match record {
            Record::Pipeline { layout } => *layout == resource,
            Record::DescriptorSet { bindings, .. } => bindings.iter().any(|b| b.buffer.resource() == resource),
            _ => false,
        })
    }
}

impl Default for RecordingDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl GpuDevice for RecordingDevice {
    fn min_uniform_buffer_offset_alignment(&self) -> u64 {
        self.min_alignment
    }

    fn swapchain_extent(&self) -> Extent {
        self.extent
    }

    fn create_fence(&mut self, signaled: bool) -> GpuResult<FenceId> {
        self.check(FailPoint::CreateFence)?;
        Ok(FenceId(self.resources.insert(Record::Fence { signaled })))
    }

    fn create_semaphore(&mut self) -> GpuResult<SemaphoreId> {
        self.check(FailPoint::CreateSemaphore)?;
        Ok(SemaphoreId(self.resources.insert(Record::Semaphore { signaled: false })))
    }

    fn create_command_target(&mut self) -> GpuResult<CommandTargetId> {
        self.check(FailPoint::CreateCommandTarget)?;
        Ok(CommandTargetId(self.resources.insert(Record::CommandTarget {
            state: CommandState::Initial,
        })))
    }

    fn create_buffer(&mut self, size: u64, usage: BufferUsage) -> GpuResult<BufferId> {
        self.check(FailPoint::CreateBuffer)?;
        if size == 0 {
            return Err(invalid("buffer size must be non-zero"));
        }
        let size = usize::try_from(size).map_err(|_| GpuError::Api(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY))?;
        Ok(BufferId(self.resources.insert(Record::Buffer {
            usage,
            data: vec![0; size],
        })))
    }

    fn write_buffer(&mut self, buffer: BufferId, offset: u64, bytes: &[u8]) -> GpuResult<()> {
        self.check(FailPoint::WriteBuffer)?;
        let len = bytes.len() as u64;
        if self.in_use_by_pending_work(buffer, offset, offset.saturating_add(len)) {
            return Err(invalid(format!(
                "write of {len} bytes at {offset} into a buffer range read by pending work"
            )));
        }
        let data = match self.resources.get_mut(buffer.resource())? {
            Record::Buffer { data, .. } => data,
            _ => return Err(GpuError::ResourceKindMismatch { expected: "buffer" }),
        };
        let start = offset as usize;
        let end = start
            .checked_add(bytes.len())
            .filter(|&end| end <= data.len())
            .ok_or_else(|| invalid(format!("write of {} bytes at {offset} overruns buffer of {}", bytes.len(), data.len())))?;
        data[start..end].copy_from_slice(bytes);
        self.commands.push(RecordedCommand::WriteBuffer { buffer, offset, len });
        Ok(())
    }

    fn create_pipeline(&mut self, _desc: &PipelineDesc) -> GpuResult<(PipelineId, PipelineLayoutId)> {
        self.check(FailPoint::CreatePipeline)?;
        let layout = self.resources.insert(Record::PipelineLayout);
        let pipeline = self.resources.insert(Record::Pipeline { layout });
        Ok((PipelineId(pipeline), PipelineLayoutId(layout)))
    }

    fn create_descriptor_set(
        &mut self,
        layout: DescriptorLayoutKind,
        bindings: &[DescriptorBinding],
    ) -> GpuResult<DescriptorSetId> {
        self.check(FailPoint::CreateDescriptorSet)?;
        for binding in bindings {
            self.expect_kind(binding.buffer.resource(), "buffer")?;
        }
        let mut bindings = bindings.to_vec();
        bindings.sort_by_key(|binding| binding.binding);
        Ok(DescriptorSetId(self.resources.insert(Record::DescriptorSet { layout, bindings })))
    }

    fn destroy(&mut self, resource: ResourceId) -> GpuResult<()> {
        self.check(FailPoint::Destroy)?;
        let record = self.resources.get(resource)?;
        if let Record::CommandTarget { state: CommandState::Pending } = record {
            return Err(invalid("command target destroyed while its work is pending"));
        }
        if self.referenced_by_live_object(resource) {
            let kind = record.kind();
            return Err(invalid(format!("{kind} destroyed while still referenced")));
        }
        self.resources.remove(resource)?;
        self.commands.push(RecordedCommand::Destroy(resource));
        Ok(())
    }

    fn wait_fence(&mut self, fence: FenceId, _timeout: Duration) -> GpuResult<()> {
        self.check(FailPoint::WaitFence)?;
        let signaled = *self.fence_mut(fence)?;
        self.commands.push(RecordedCommand::WaitFence(fence));
        if signaled {
            Ok(())
        } else {
            Err(GpuError::Timeout)
        }
    }

    fn reset_fence(&mut self, fence: FenceId) -> GpuResult<()> {
        self.check(FailPoint::ResetFence)?;
        *self.fence_mut(fence)? = false;
        self.commands.push(RecordedCommand::ResetFence(fence));
        Ok(())
    }

    fn acquire_next_image(&mut self, signal: SemaphoreId, _timeout: Duration) -> GpuResult<u32> {
        self.check(FailPoint::AcquireImage)?;
        let semaphore = self.semaphore_mut(signal)?;
        if *semaphore {
            return Err(invalid("acquire would signal a semaphore that is already signaled"));
        }
        *semaphore = true;

        let image_index = self.next_image;
        self.next_image = (self.next_image + 1) % self.image_count;
        self.commands.push(RecordedCommand::AcquireImage { signal, image_index });
        Ok(image_index)
    }

    fn reset_commands(&mut self, target: CommandTargetId) -> GpuResult<()> {
        let state = self.command_state(target)?;
        if *state == CommandState::Pending {
            return Err(invalid("command target reset while its work is pending"));
        }
        *state = CommandState::Initial;
        self.bound.remove(&target);
        self.commands.push(RecordedCommand::ResetCommands(target));
        Ok(())
    }

    fn begin_commands(&mut self, target: CommandTargetId) -> GpuResult<()> {
        self.check(FailPoint::BeginCommands)?;
        self.transition(target, CommandState::Initial, CommandState::Recording, "begin")?;
        self.commands.push(RecordedCommand::BeginCommands(target));
        Ok(())
    }

    fn end_commands(&mut self, target: CommandTargetId) -> GpuResult<()> {
        self.check(FailPoint::EndCommands)?;
        self.transition(target, CommandState::Recording, CommandState::Executable, "end")?;
        self.commands.push(RecordedCommand::EndCommands(target));
        Ok(())
    }

    fn begin_render_pass(&mut self, target: CommandTargetId, image_index: u32, clear: ClearValues) -> GpuResult<()> {
        if image_index >= self.image_count {
            return Err(invalid(format!("swapchain image {image_index} out of range")));
        }
        self.transition(target, CommandState::Recording, CommandState::InRenderPass, "begin render pass")?;
        self.commands.push(RecordedCommand::BeginRenderPass { target, image_index, clear });
        Ok(())
    }

    fn end_render_pass(&mut self, target: CommandTargetId) -> GpuResult<()> {
        self.transition(target, CommandState::InRenderPass, CommandState::Recording, "end render pass")?;
        self.commands.push(RecordedCommand::EndRenderPass(target));
        Ok(())
    }

    fn bind_pipeline(&mut self, target: CommandTargetId, pipeline: PipelineId) -> GpuResult<()> {
        self.require_in_render_pass(target, "pipeline bind")?;
        self.expect_kind(pipeline.resource(), "pipeline")?;
        self.commands.push(RecordedCommand::BindPipeline { target, pipeline });
        Ok(())
    }

    fn bind_descriptor_sets(
        &mut self,
        target: CommandTargetId,
        layout: PipelineLayoutId,
        first_set: u32,
        sets: &[DescriptorSetId],
        dynamic_offsets: &[u32],
    ) -> GpuResult<()> {
        self.require_in_render_pass(target, "descriptor bind")?;
        self.expect_kind(layout.resource(), "pipeline layout")?;
        let mut ranges = Vec::new();
        let mut dynamic = dynamic_offsets.iter();
        for set in sets {
            let Record::DescriptorSet { bindings, .. } = self.resources.get(set.resource())? else {
                return Err(GpuError::ResourceKindMismatch { expected: "descriptor set" });
            };
            // Dynamic offsets are consumed in set order, then binding order
            for binding in bindings {
                let mut start = binding.offset;
                if binding.kind == DescriptorKind::UniformBufferDynamic {
                    let offset = dynamic
                        .next()
                        .ok_or_else(|| invalid("fewer dynamic offsets than dynamic bindings"))?;
                    start += u64::from(*offset);
                }
                ranges.push(BoundRange {
                    buffer: binding.buffer,
                    start,
                    end: start + binding.range,
                });
            }
        }
        if dynamic.next().is_some() {
            return Err(invalid("more dynamic offsets than dynamic bindings"));
        }
        if dynamic_offsets.iter().any(|&offset| self.min_alignment != 0 && u64::from(offset) % self.min_alignment != 0) {
            return Err(invalid(format!(
                "dynamic offsets {dynamic_offsets:?} not aligned to {}",
                self.min_alignment
            )));
        }
        self.commands.push(RecordedCommand::BindDescriptorSets {
            target,
            layout,
            first_set,
            sets: sets.to_vec(),
            dynamic_offsets: dynamic_offsets.to_vec(),
        });
        for range in ranges {
            self.bind_range(target, range);
        }
        Ok(())
    }

    fn bind_vertex_buffer(&mut self, target: CommandTargetId, buffer: BufferId) -> GpuResult<()> {
        self.require_in_render_pass(target, "vertex buffer bind")?;
        self.expect_kind(buffer.resource(), "buffer")?;
        self.bind_range(target, BoundRange { buffer, start: 0, end: u64::MAX });
        self.commands.push(RecordedCommand::BindVertexBuffer { target, buffer });
        Ok(())
    }

    fn push_constants(&mut self, target: CommandTargetId, layout: PipelineLayoutId, data: &[u8]) -> GpuResult<()> {
        self.require_in_render_pass(target, "push constants")?;
        self.expect_kind(layout.resource(), "pipeline layout")?;
        self.commands.push(RecordedCommand::PushConstants {
            target,
            layout,
            data: data.to_vec(),
        });
        Ok(())
    }

    fn draw(
        &mut self,
        target: CommandTargetId,
        vertex_count: u32,
        instance_count: u32,
        first_vertex: u32,
        first_instance: u32,
    ) -> GpuResult<()> {
        self.check(FailPoint::Draw)?;
        self.require_in_render_pass(target, "draw")?;
        self.commands.push(RecordedCommand::Draw {
            target,
            vertex_count,
            instance_count,
            first_vertex,
            first_instance,
        });
        Ok(())
    }

    fn submit(
        &mut self,
        target: CommandTargetId,
        wait: SemaphoreId,
        signal: SemaphoreId,
        fence: FenceId,
    ) -> GpuResult<()> {
        self.check(FailPoint::Submit)?;
        if *self.command_state(target)? != CommandState::Executable {
            return Err(invalid("submitted command target is not executable"));
        }
        if !*self.semaphore_mut(wait)? {
            return Err(invalid("submit waits on a semaphore nothing will signal"));
        }
        if *self.semaphore_mut(signal)? {
            return Err(invalid("submit signals a semaphore that is already signaled"));
        }
        if *self.fence_mut(fence)? {
            return Err(invalid("submit fence must be unsignaled"));
        }

        *self.semaphore_mut(wait)? = false;
        *self.semaphore_mut(signal)? = true;
        *self.command_state(target)? = CommandState::Pending;
        self.pending.push((target, fence));
        self.commands.push(RecordedCommand::Submit { target, wait, signal, fence });

        if !self.stalled {
            self.complete_pending();
        }
        Ok(())
    }

    fn present(&mut self, image_index: u32, wait: SemaphoreId) -> GpuResult<()> {
        self.check(FailPoint::Present)?;
        if image_index >= self.image_count {
            return Err(invalid(format!("presented image {image_index} out of range")));
        }
        let semaphore = self.semaphore_mut(wait)?;
        if !*semaphore {
            return Err(invalid("present waits on a semaphore nothing will signal"));
        }
        *semaphore = false;
        self.commands.push(RecordedCommand::Present { image_index, wait });
        Ok(())
    }

    fn wait_idle(&mut self) -> GpuResult<()> {
        self.check(FailPoint::WaitIdle)?;
        self.complete_pending();
        self.commands.push(RecordedCommand::WaitIdle);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recording(device: &mut RecordingDevice) -> CommandTargetId {
        let target = device.create_command_target().unwrap();
        device.reset_commands(target).unwrap();
        device.begin_commands(target).unwrap();
        target
    }

    #[test]
    fn test_submit_signals_fence_and_consumes_wait() {
        let mut device = RecordingDevice::new();
        let fence = device.create_fence(false).unwrap();
        let acquired = device.create_semaphore().unwrap();
        let finished = device.create_semaphore().unwrap();
        let target = recording(&mut device);
        device.end_commands(target).unwrap();

        let image = device.acquire_next_image(acquired, Duration::from_secs(1)).unwrap();
        device.submit(target, acquired, finished, fence).unwrap();
        assert_eq!(device.fence_signaled(fence), Some(true));
        device.present(image, finished).unwrap();

        // Both semaphores are back to unsignaled
        assert!(device.present(image, finished).is_err());
        assert!(device.submit(target, acquired, finished, fence).is_err());
    }

    #[test]
    fn test_stalled_fence_times_out() {
        let mut device = RecordingDevice::new();
        device.stall_gpu(true);
        let fence = device.create_fence(false).unwrap();
        let acquired = device.create_semaphore().unwrap();
        let finished = device.create_semaphore().unwrap();
        let target = recording(&mut device);
        device.end_commands(target).unwrap();
        device.acquire_next_image(acquired, Duration::from_secs(1)).unwrap();
        device.submit(target, acquired, finished, fence).unwrap();

        assert_eq!(device.wait_fence(fence, Duration::from_millis(1)), Err(GpuError::Timeout));
        assert!(device.reset_commands(target).is_err());

        device.wait_idle().unwrap();
        assert!(device.wait_fence(fence, Duration::from_millis(1)).is_ok());
    }

    #[test]
    fn test_draw_outside_render_pass_is_rejected() {
        let mut device = RecordingDevice::new();
        let target = recording(&mut device);
        assert!(matches!(device.draw(target, 3, 1, 0, 0), Err(GpuError::InvalidOperation(_))));

        device.begin_render_pass(target, 0, ClearValues::default()).unwrap();
        device.draw(target, 3, 1, 0, 0).unwrap();
        assert!(device.end_commands(target).is_err());
        device.end_render_pass(target).unwrap();
        device.end_commands(target).unwrap();
    }

    #[test]
    fn test_buffer_writes_are_bounds_checked() {
        let mut device = RecordingDevice::new();
        let buffer = device.create_buffer(8, BufferUsage::Uniform).unwrap();
        device.write_buffer(buffer, 4, &[1, 2, 3, 4]).unwrap();
        assert_eq!(device.buffer_contents(buffer), Some(&[0, 0, 0, 0, 1, 2, 3, 4][..]));
        assert!(device.write_buffer(buffer, 6, &[1, 2, 3]).is_err());
    }

    #[test]
    fn test_destroy_respects_references() {
        let mut device = RecordingDevice::new();
        let buffer = device.create_buffer(64, BufferUsage::Storage).unwrap();
        let set = device
            .create_descriptor_set(
                DescriptorLayoutKind::Objects,
                &[DescriptorBinding {
                    binding: 0,
                    kind: crate::gpu::DescriptorKind::StorageBuffer,
                    buffer,
                    offset: 0,
                    range: 64,
                }],
            )
            .unwrap();

        assert!(matches!(device.destroy(buffer.resource()), Err(GpuError::InvalidOperation(_))));
        device.destroy(set.resource()).unwrap();
        device.destroy(buffer.resource()).unwrap();
        assert_eq!(device.destroy(buffer.resource()), Err(GpuError::UnknownResource));
        assert_eq!(device.live_resources(), 0);
    }

    #[test]
    fn test_injected_failure_fires_once() {
        let mut device = RecordingDevice::new();
        device.fail_next(FailPoint::CreateFence, vk::Result::ERROR_OUT_OF_DEVICE_MEMORY);
        assert_eq!(
            device.create_fence(true),
            Err(GpuError::Api(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY))
        );
        assert!(device.create_fence(true).is_ok());
    }

    fn dynamic_set(device: &mut RecordingDevice, buffer: BufferId) -> DescriptorSetId {
        device
            .create_descriptor_set(
                DescriptorLayoutKind::Global,
                &[DescriptorBinding {
                    binding: 1,
                    kind: DescriptorKind::UniformBufferDynamic,
                    buffer,
                    offset: 0,
                    range: 80,
                }],
            )
            .unwrap()
    }

    #[test]
    fn test_misaligned_dynamic_offset_is_rejected() {
        let mut device = RecordingDevice::new();
        let (_, layout) = device.create_pipeline(&PipelineDesc::new("v.spv", "f.spv")).unwrap();
        let scene = device.create_buffer(512, BufferUsage::Uniform).unwrap();
        let set = dynamic_set(&mut device, scene);
        let target = recording(&mut device);
        device.begin_render_pass(target, 0, ClearValues::default()).unwrap();
        assert!(device.bind_descriptor_sets(target, layout, 0, &[set], &[80]).is_err());
        assert!(device.bind_descriptor_sets(target, layout, 0, &[set], &[]).is_err());
        assert!(device.bind_descriptor_sets(target, layout, 0, &[set], &[256]).is_ok());
    }

    #[test]
    fn test_writes_into_pending_ranges_are_rejected() {
        let mut device = RecordingDevice::new();
        device.stall_gpu(true);
        let (_, layout) = device.create_pipeline(&PipelineDesc::new("v.spv", "f.spv")).unwrap();
        let scene = device.create_buffer(512, BufferUsage::Uniform).unwrap();
        let other = device.create_buffer(64, BufferUsage::Uniform).unwrap();
        let set = dynamic_set(&mut device, scene);
        let fence = device.create_fence(false).unwrap();
        let acquired = device.create_semaphore().unwrap();
        let finished = device.create_semaphore().unwrap();

        let target = recording(&mut device);
        device.begin_render_pass(target, 0, ClearValues::default()).unwrap();
        device.bind_descriptor_sets(target, layout, 0, &[set], &[256]).unwrap();
        device.end_render_pass(target).unwrap();
        device.end_commands(target).unwrap();
        device.acquire_next_image(acquired, Duration::from_secs(1)).unwrap();
        device.submit(target, acquired, finished, fence).unwrap();

        // Only the replica at 256..336 is read by the pending submission
        assert!(matches!(device.write_buffer(scene, 256, &[1; 80]), Err(GpuError::InvalidOperation(_))));
        assert!(device.write_buffer(scene, 300, &[1; 4]).is_err());
        device.write_buffer(scene, 0, &[1; 80]).unwrap();
        device.write_buffer(other, 0, &[1; 64]).unwrap();

        device.complete_pending();
        device.write_buffer(scene, 256, &[2; 80]).unwrap();
        let writes: Vec<(u64, u64)> = device
            .commands()
            .iter()
            .filter_map(|command| match command {
                RecordedCommand::WriteBuffer { buffer, offset, len } if *buffer == scene => Some((*offset, *len)),
                _ => None,
            })
            .collect();
        assert_eq!(writes, vec![(0, 80), (256, 80)]);
    }
}
