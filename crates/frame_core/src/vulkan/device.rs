//! [`GpuDevice`] implementation on ash

use std::time::Duration;

use ash::{vk, Device};

use super::buffer::AllocatedBuffer;
use super::context::VulkanContext;
use super::pipeline::{create_graphics_pipeline, create_pipeline_layout};
use super::render_pass::{Framebuffers, RenderPass};
use super::swapchain::{DepthImage, Swapchain};
use super::window::Window;
use crate::config::{EngineConfig, Extent, MAX_FRAME_SLOTS};
use crate::error::{FrameError, GpuError, GpuResult};
use crate::gpu::{
    BufferId, BufferUsage, ClearValues, CommandTargetId, DescriptorBinding, DescriptorKind, DescriptorLayoutKind,
    DescriptorSetId, FenceId, GpuDevice, PipelineDesc, PipelineId, PipelineLayoutId, ResourceArena, ResourceId,
    SemaphoreId,
};

/// Native object behind a [`ResourceId`]
#[derive(Debug, Clone, Copy)]
enum VkResource {
    Fence(vk::Fence),
    Semaphore(vk::Semaphore),
    CommandTarget {
        pool: vk::CommandPool,
        buffer: vk::CommandBuffer,
    },
    Buffer(AllocatedBuffer),
    Pipeline(vk::Pipeline),
    PipelineLayout(vk::PipelineLayout),
    DescriptorSet(vk::DescriptorSet),
}

impl VkResource {
    const fn kind(&self) -> &'static str {
        match self {
            Self::Fence(_) => "fence",
            Self::Semaphore(_) => "semaphore",
            Self::CommandTarget { .. } => "command target",
            Self::Buffer(_) => "buffer",
            Self::Pipeline(_) => "pipeline",
            Self::PipelineLayout(_) => "pipeline layout",
            Self::DescriptorSet(_) => "descriptor set",
        }
    }
}

fn descriptor_type(kind: DescriptorKind) -> vk::DescriptorType {
    match kind {
        DescriptorKind::UniformBuffer => vk::DescriptorType::UNIFORM_BUFFER,
        DescriptorKind::UniformBufferDynamic => vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC,
        DescriptorKind::StorageBuffer => vk::DescriptorType::STORAGE_BUFFER,
    }
}

fn setup_error(what: &'static str) -> impl FnOnce(vk::Result) -> FrameError {
    move |result| FrameError::Setup(format!("{what}: {result:?}"))
}

/// Vulkan device that owns everything from the instance to the framebuffers
///
/// Objects requested through [`GpuDevice`] live in an arena and are destroyed
/// when the frame core's deletion queue calls [`GpuDevice::destroy`]. Anything
/// still in the arena at drop time is destroyed with a warning.
pub struct VulkanDevice {
    resources: ResourceArena<VkResource>,
    descriptor_pool: vk::DescriptorPool,
    global_layout: vk::DescriptorSetLayout,
    objects_layout: vk::DescriptorSetLayout,
    // Drop order below: framebuffers, depth, render pass, swapchain, context
    framebuffers: Framebuffers,
    #[allow(dead_code)]
    depth: DepthImage,
    render_pass: RenderPass,
    swapchain: Swapchain,
    context: VulkanContext,
}

impl VulkanDevice {
    /// Bring up Vulkan for `window`
    pub fn new(window: &mut Window, config: &EngineConfig) -> Result<Self, FrameError> {
        let context = VulkanContext::new(window, &config.application_name, config.validation_enabled())?;

        let window_extent = window.framebuffer_extent();
        let swapchain = Swapchain::new(
            context.device(),
            &context.device.swapchain_loader,
            context.surface,
            &context.surface_loader,
            &context.physical,
            vk::Extent2D {
                width: window_extent.width,
                height: window_extent.height,
            },
        )?;
        let render_pass = RenderPass::new_forward_pass(context.device(), swapchain.format())?;
        let depth = DepthImage::new(context.device(), &context.physical, swapchain.extent())?;
        let framebuffers = Framebuffers::new(
            context.device(),
            &render_pass,
            swapchain.image_views(),
            depth.view(),
            swapchain.extent(),
        )?;

        let mut this = Self {
            resources: ResourceArena::new(),
            descriptor_pool: vk::DescriptorPool::null(),
            global_layout: vk::DescriptorSetLayout::null(),
            objects_layout: vk::DescriptorSetLayout::null(),
            framebuffers,
            depth,
            render_pass,
            swapchain,
            context,
        };
        this.create_descriptor_objects()?;

        log::info!("Vulkan device ready");
        Ok(this)
    }

    fn create_descriptor_objects(&mut self) -> Result<(), FrameError> {
        let global_bindings = [
            vk::DescriptorSetLayoutBinding::builder()
                .binding(0)
                .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
                .descriptor_count(1)
                .stage_flags(vk::ShaderStageFlags::VERTEX)
                .build(),
            vk::DescriptorSetLayoutBinding::builder()
                .binding(1)
                .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC)
                .descriptor_count(1)
                .stage_flags(vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT)
                .build(),
        ];
        let object_bindings = [vk::DescriptorSetLayoutBinding::builder()
            .binding(0)
            .descriptor_type(vk::DescriptorType::STORAGE_BUFFER)
            .descriptor_count(1)
            .stage_flags(vk::ShaderStageFlags::VERTEX)
            .build()];

        let device = self.context.device();
        let info = vk::DescriptorSetLayoutCreateInfo::builder().bindings(&global_bindings);
        self.global_layout = unsafe { device.create_descriptor_set_layout(&info, None) }
            .map_err(setup_error("Failed to create global set layout"))?;
        let info = vk::DescriptorSetLayoutCreateInfo::builder().bindings(&object_bindings);
        self.objects_layout = unsafe { device.create_descriptor_set_layout(&info, None) }
            .map_err(setup_error("Failed to create object set layout"))?;

        let slots = MAX_FRAME_SLOTS as u32;
        let pool_sizes = [
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::UNIFORM_BUFFER,
                descriptor_count: slots,
            },
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC,
                descriptor_count: slots,
            },
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::STORAGE_BUFFER,
                descriptor_count: slots,
            },
        ];
        let pool_info = vk::DescriptorPoolCreateInfo::builder()
            .flags(vk::DescriptorPoolCreateFlags::FREE_DESCRIPTOR_SET)
            .max_sets(slots * 2)
            .pool_sizes(&pool_sizes);
        self.descriptor_pool = unsafe { device.create_descriptor_pool(&pool_info, None) }
            .map_err(setup_error("Failed to create descriptor pool"))?;
        Ok(())
    }

    fn raw(&self) -> &Device {
        self.context.device()
    }

    fn set_layout(&self, kind: DescriptorLayoutKind) -> vk::DescriptorSetLayout {
        match kind {
            DescriptorLayoutKind::Global => self.global_layout,
            DescriptorLayoutKind::Objects => self.objects_layout,
        }
    }

    fn fence(&self, id: FenceId) -> GpuResult<vk::Fence> {
        match self.resources.get(id.resource())? {
            VkResource::Fence(fence) => Ok(*fence),
            _ => Err(GpuError::ResourceKindMismatch { expected: "fence" }),
        }
    }

    fn semaphore(&self, id: SemaphoreId) -> GpuResult<vk::Semaphore> {
        match self.resources.get(id.resource())? {
            VkResource::Semaphore(semaphore) => Ok(*semaphore),
            _ => Err(GpuError::ResourceKindMismatch { expected: "semaphore" }),
        }
    }

    fn command_buffer(&self, id: CommandTargetId) -> GpuResult<vk::CommandBuffer> {
        match self.resources.get(id.resource())? {
            VkResource::CommandTarget { buffer, .. } => Ok(*buffer),
            _ => Err(GpuError::ResourceKindMismatch {
                expected: "command target",
            }),
        }
    }

    fn buffer(&self, id: BufferId) -> GpuResult<AllocatedBuffer> {
        match self.resources.get(id.resource())? {
            VkResource::Buffer(buffer) => Ok(*buffer),
            _ => Err(GpuError::ResourceKindMismatch { expected: "buffer" }),
        }
    }

    fn pipeline(&self, id: PipelineId) -> GpuResult<vk::Pipeline> {
        match self.resources.get(id.resource())? {
            VkResource::Pipeline(pipeline) => Ok(*pipeline),
            _ => Err(GpuError::ResourceKindMismatch { expected: "pipeline" }),
        }
    }

    fn pipeline_layout(&self, id: PipelineLayoutId) -> GpuResult<vk::PipelineLayout> {
        match self.resources.get(id.resource())? {
            VkResource::PipelineLayout(layout) => Ok(*layout),
            _ => Err(GpuError::ResourceKindMismatch {
                expected: "pipeline layout",
            }),
        }
    }

    fn descriptor_set(&self, id: DescriptorSetId) -> GpuResult<vk::DescriptorSet> {
        match self.resources.get(id.resource())? {
            VkResource::DescriptorSet(set) => Ok(*set),
            _ => Err(GpuError::ResourceKindMismatch {
                expected: "descriptor set",
            }),
        }
    }

    /// # Safety
    /// No pending GPU work may reference `resource`.
    unsafe fn destroy_native(&self, resource: VkResource) -> GpuResult<()> {
        let device = self.raw();
        match resource {
            VkResource::Fence(fence) => device.destroy_fence(fence, None),
            VkResource::Semaphore(semaphore) => device.destroy_semaphore(semaphore, None),
            VkResource::CommandTarget { pool, .. } => device.destroy_command_pool(pool, None),
            VkResource::Buffer(buffer) => buffer.destroy(device),
            VkResource::Pipeline(pipeline) => device.destroy_pipeline(pipeline, None),
            VkResource::PipelineLayout(layout) => device.destroy_pipeline_layout(layout, None),
            VkResource::DescriptorSet(set) => device.free_descriptor_sets(self.descriptor_pool, &[set])?,
        }
        Ok(())
    }
}

impl GpuDevice for VulkanDevice {
    fn min_uniform_buffer_offset_alignment(&self) -> u64 {
        self.context.physical.properties.limits.min_uniform_buffer_offset_alignment
    }

    fn swapchain_extent(&self) -> Extent {
        let extent = self.swapchain.extent();
        Extent::new(extent.width, extent.height)
    }

    fn create_fence(&mut self, signaled: bool) -> GpuResult<FenceId> {
        let flags = if signaled {
            vk::FenceCreateFlags::SIGNALED
        } else {
            vk::FenceCreateFlags::empty()
        };
        let info = vk::FenceCreateInfo::builder().flags(flags);
        let fence = unsafe { self.raw().create_fence(&info, None)? };
        Ok(FenceId(self.resources.insert(VkResource::Fence(fence))))
    }

    fn create_semaphore(&mut self) -> GpuResult<SemaphoreId> {
        let info = vk::SemaphoreCreateInfo::builder();
        let semaphore = unsafe { self.raw().create_semaphore(&info, None)? };
        Ok(SemaphoreId(self.resources.insert(VkResource::Semaphore(semaphore))))
    }

    fn create_command_target(&mut self) -> GpuResult<CommandTargetId> {
        let device = self.raw();
        let pool_info = vk::CommandPoolCreateInfo::builder()
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
            .queue_family_index(self.context.physical.graphics_family);
        let pool = unsafe { device.create_command_pool(&pool_info, None)? };

        let alloc_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let buffer = match unsafe { device.allocate_command_buffers(&alloc_info) } {
            Ok(buffers) => buffers.first().copied(),
            Err(result) => {
                unsafe { device.destroy_command_pool(pool, None) };
                return Err(result.into());
            }
        };
        let Some(buffer) = buffer else {
            unsafe { device.destroy_command_pool(pool, None) };
            return Err(GpuError::InvalidOperation("driver returned no command buffer".to_string()));
        };

        Ok(CommandTargetId(
            self.resources.insert(VkResource::CommandTarget { pool, buffer }),
        ))
    }

    fn create_buffer(&mut self, size: u64, usage: BufferUsage) -> GpuResult<BufferId> {
        let buffer = AllocatedBuffer::new(self.raw(), &self.context.physical.memory_properties, size, usage)?;
        log::debug!("Created {usage:?} buffer of {size} bytes");
        Ok(BufferId(self.resources.insert(VkResource::Buffer(buffer))))
    }

    fn write_buffer(&mut self, buffer: BufferId, offset: u64, data: &[u8]) -> GpuResult<()> {
        self.buffer(buffer)?.write(self.raw(), offset, data)
    }

    fn create_pipeline(&mut self, desc: &PipelineDesc) -> GpuResult<(PipelineId, PipelineLayoutId)> {
        let device = self.raw();
        let layout = create_pipeline_layout(device, &[self.global_layout, self.objects_layout])?;
        let pipeline = match create_graphics_pipeline(device, self.render_pass.handle(), layout, desc) {
            Ok(pipeline) => pipeline,
            Err(err) => {
                unsafe { device.destroy_pipeline_layout(layout, None) };
                return Err(err);
            }
        };

        let layout = PipelineLayoutId(self.resources.insert(VkResource::PipelineLayout(layout)));
        let pipeline = PipelineId(self.resources.insert(VkResource::Pipeline(pipeline)));
        Ok((pipeline, layout))
    }

    fn create_descriptor_set(
        &mut self,
        layout: DescriptorLayoutKind,
        bindings: &[DescriptorBinding],
    ) -> GpuResult<DescriptorSetId> {
        let buffer_infos = bindings
            .iter()
            .map(|binding| {
                Ok(vk::DescriptorBufferInfo {
                    buffer: self.buffer(binding.buffer)?.buffer,
                    offset: binding.offset,
                    range: binding.range,
                })
            })
            .collect::<GpuResult<Vec<_>>>()?;

        let set_layouts = [self.set_layout(layout)];
        let alloc_info = vk::DescriptorSetAllocateInfo::builder()
            .descriptor_pool(self.descriptor_pool)
            .set_layouts(&set_layouts);
        let set = unsafe { self.raw().allocate_descriptor_sets(&alloc_info)? }
            .first()
            .copied()
            .ok_or_else(|| GpuError::InvalidOperation("driver returned no descriptor set".to_string()))?;

        let writes: Vec<vk::WriteDescriptorSet> = bindings
            .iter()
            .zip(&buffer_infos)
            .map(|(binding, info)| {
                vk::WriteDescriptorSet::builder()
                    .dst_set(set)
                    .dst_binding(binding.binding)
                    .descriptor_type(descriptor_type(binding.kind))
                    .buffer_info(std::slice::from_ref(info))
                    .build()
            })
            .collect();
        unsafe { self.raw().update_descriptor_sets(&writes, &[]) };

        Ok(DescriptorSetId(self.resources.insert(VkResource::DescriptorSet(set))))
    }

    fn destroy(&mut self, resource: ResourceId) -> GpuResult<()> {
        let native = self.resources.remove(resource)?;
        log::trace!("Destroying {}", native.kind());
        unsafe { self.destroy_native(native) }
    }

    fn wait_fence(&mut self, fence: FenceId, timeout: Duration) -> GpuResult<()> {
        let fence = self.fence(fence)?;
        let timeout_ns = u64::try_from(timeout.as_nanos()).unwrap_or(u64::MAX);
        unsafe { self.raw().wait_for_fences(&[fence], true, timeout_ns)? };
        Ok(())
    }

    fn reset_fence(&mut self, fence: FenceId) -> GpuResult<()> {
        let fence = self.fence(fence)?;
        unsafe { self.raw().reset_fences(&[fence])? };
        Ok(())
    }

    fn acquire_next_image(&mut self, signal: SemaphoreId, timeout: Duration) -> GpuResult<u32> {
        let semaphore = self.semaphore(signal)?;
        let timeout_ns = u64::try_from(timeout.as_nanos()).unwrap_or(u64::MAX);
        let (image_index, suboptimal) = unsafe {
            self.swapchain.loader().acquire_next_image(
                self.swapchain.handle(),
                timeout_ns,
                semaphore,
                vk::Fence::null(),
            )?
        };
        if suboptimal {
            log::warn!("Swapchain is suboptimal for the surface");
        }
        Ok(image_index)
    }

    fn reset_commands(&mut self, target: CommandTargetId) -> GpuResult<()> {
        let buffer = self.command_buffer(target)?;
        unsafe {
            self.raw()
                .reset_command_buffer(buffer, vk::CommandBufferResetFlags::empty())?;
        }
        Ok(())
    }

    fn begin_commands(&mut self, target: CommandTargetId) -> GpuResult<()> {
        let buffer = self.command_buffer(target)?;
        let info = vk::CommandBufferBeginInfo::builder().flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        unsafe { self.raw().begin_command_buffer(buffer, &info)? };
        Ok(())
    }

    fn end_commands(&mut self, target: CommandTargetId) -> GpuResult<()> {
        let buffer = self.command_buffer(target)?;
        unsafe { self.raw().end_command_buffer(buffer)? };
        Ok(())
    }

    fn begin_render_pass(&mut self, target: CommandTargetId, image_index: u32, clear: ClearValues) -> GpuResult<()> {
        let buffer = self.command_buffer(target)?;
        let framebuffer = self
            .framebuffers
            .get(image_index)
            .ok_or_else(|| GpuError::InvalidOperation(format!("no framebuffer for image {image_index}")))?;
        let extent = self.swapchain.extent();

        let clear_values = [
            vk::ClearValue {
                color: vk::ClearColorValue { float32: clear.color },
            },
            vk::ClearValue {
                depth_stencil: vk::ClearDepthStencilValue {
                    depth: clear.depth,
                    stencil: 0,
                },
            },
        ];
        let render_area = vk::Rect2D {
            offset: vk::Offset2D { x: 0, y: 0 },
            extent,
        };
        let info = vk::RenderPassBeginInfo::builder()
            .render_pass(self.render_pass.handle())
            .framebuffer(framebuffer)
            .render_area(render_area)
            .clear_values(&clear_values);
        let viewport = vk::Viewport {
            x: 0.0,
            y: 0.0,
            width: extent.width as f32,
            height: extent.height as f32,
            min_depth: 0.0,
            max_depth: 1.0,
        };

        let device = self.raw();
        unsafe {
            device.cmd_begin_render_pass(buffer, &info, vk::SubpassContents::INLINE);
            device.cmd_set_viewport(buffer, 0, &[viewport]);
            device.cmd_set_scissor(buffer, 0, &[render_area]);
        }
        Ok(())
    }

    fn end_render_pass(&mut self, target: CommandTargetId) -> GpuResult<()> {
        let buffer = self.command_buffer(target)?;
        unsafe { self.raw().cmd_end_render_pass(buffer) };
        Ok(())
    }

    fn bind_pipeline(&mut self, target: CommandTargetId, pipeline: PipelineId) -> GpuResult<()> {
        let buffer = self.command_buffer(target)?;
        let pipeline = self.pipeline(pipeline)?;
        unsafe {
            self.raw()
                .cmd_bind_pipeline(buffer, vk::PipelineBindPoint::GRAPHICS, pipeline);
        }
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
        let buffer = self.command_buffer(target)?;
        let layout = self.pipeline_layout(layout)?;
        let sets = sets
            .iter()
            .map(|&set| self.descriptor_set(set))
            .collect::<GpuResult<Vec<_>>>()?;
        unsafe {
            self.raw().cmd_bind_descriptor_sets(
                buffer,
                vk::PipelineBindPoint::GRAPHICS,
                layout,
                first_set,
                &sets,
                dynamic_offsets,
            );
        }
        Ok(())
    }

    fn bind_vertex_buffer(&mut self, target: CommandTargetId, buffer: BufferId) -> GpuResult<()> {
        let command_buffer = self.command_buffer(target)?;
        let vertex_buffer = self.buffer(buffer)?;
        unsafe {
            self.raw()
                .cmd_bind_vertex_buffers(command_buffer, 0, &[vertex_buffer.buffer], &[0]);
        }
        Ok(())
    }

    fn push_constants(&mut self, target: CommandTargetId, layout: PipelineLayoutId, data: &[u8]) -> GpuResult<()> {
        let buffer = self.command_buffer(target)?;
        let layout = self.pipeline_layout(layout)?;
        unsafe {
            self.raw()
                .cmd_push_constants(buffer, layout, vk::ShaderStageFlags::VERTEX, 0, data);
        }
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
        let buffer = self.command_buffer(target)?;
        unsafe {
            self.raw()
                .cmd_draw(buffer, vertex_count, instance_count, first_vertex, first_instance);
        }
        Ok(())
    }

    fn submit(
        &mut self,
        target: CommandTargetId,
        wait: SemaphoreId,
        signal: SemaphoreId,
        fence: FenceId,
    ) -> GpuResult<()> {
        let command_buffers = [self.command_buffer(target)?];
        let wait_semaphores = [self.semaphore(wait)?];
        let signal_semaphores = [self.semaphore(signal)?];
        let fence = self.fence(fence)?;
        let wait_stages = [vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT];

        let submit_info = vk::SubmitInfo::builder()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(&command_buffers)
            .signal_semaphores(&signal_semaphores)
            .build();
        unsafe {
            self.raw()
                .queue_submit(self.context.device.graphics_queue, &[submit_info], fence)?;
        }
        Ok(())
    }

    fn present(&mut self, image_index: u32, wait: SemaphoreId) -> GpuResult<()> {
        let wait_semaphores = [self.semaphore(wait)?];
        let swapchains = [self.swapchain.handle()];
        let image_indices = [image_index];
        let present_info = vk::PresentInfoKHR::builder()
            .wait_semaphores(&wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);
        let suboptimal = unsafe {
            self.swapchain
                .loader()
                .queue_present(self.context.device.present_queue, &present_info)?
        };
        if suboptimal {
            log::warn!("Presented to a suboptimal swapchain");
        }
        Ok(())
    }

    fn wait_idle(&mut self) -> GpuResult<()> {
        unsafe { self.raw().device_wait_idle()? };
        Ok(())
    }
}

impl Drop for VulkanDevice {
    fn drop(&mut self) {
        unsafe {
            let _ = self.raw().device_wait_idle();
        }

        if !self.resources.is_empty() {
            log::warn!(
                "{} GPU resources were never handed to the deletion queue; destroying them now",
                self.resources.len()
            );
        }
        let mut leftovers: Vec<VkResource> = self.resources.drain().map(|(_, resource)| resource).collect();
        // Pipelines before their layouts, descriptor sets before buffers
        leftovers.sort_by_key(|resource| match resource {
            VkResource::Pipeline(_) | VkResource::DescriptorSet(_) => 0,
            _ => 1,
        });
        for resource in leftovers {
            if let Err(err) = unsafe { self.destroy_native(resource) } {
                log::error!("Failed to destroy leftover {}: {err}", resource.kind());
            }
        }

        let device = self.raw();
        unsafe {
            device.destroy_descriptor_pool(self.descriptor_pool, None);
            device.destroy_descriptor_set_layout(self.objects_layout, None);
            device.destroy_descriptor_set_layout(self.global_layout, None);
        }
    }
}
