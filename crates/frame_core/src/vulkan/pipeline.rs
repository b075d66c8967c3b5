//! SPIR-V loading and graphics pipeline construction

use std::ffi::CStr;
use std::io::Cursor;
use std::path::Path;

use ash::{vk, Device};

use crate::error::{GpuError, GpuResult};
use crate::gpu::PipelineDesc;
use crate::mesh::Vertex;
use crate::scene::MeshPushConstants;

const ENTRY_POINT: &CStr = unsafe { CStr::from_bytes_with_nul_unchecked(b"main\0") };

/// Read and validate a SPIR-V file into words
pub fn read_spirv(path: &Path) -> GpuResult<Vec<u32>> {
    let shader_error = |reason: String| {
        log::error!("Failed to load shader {path:?}: {reason}");
        GpuError::ShaderLoad {
            path: path.to_path_buf(),
            reason,
        }
    };

    let bytes = std::fs::read(path).map_err(|err| shader_error(err.to_string()))?;
    ash::util::read_spv(&mut Cursor::new(bytes)).map_err(|err| shader_error(err.to_string()))
}

/// Shader module destroyed on drop
pub struct ShaderModule {
    device: Device,
    module: vk::ShaderModule,
}

impl ShaderModule {
    /// Compile a module from SPIR-V words
    pub fn from_words(device: &Device, words: &[u32]) -> GpuResult<Self> {
        let create_info = vk::ShaderModuleCreateInfo::builder().code(words);
        let module = unsafe { device.create_shader_module(&create_info, None)? };
        Ok(Self {
            device: device.clone(),
            module,
        })
    }

    /// Load and compile a SPIR-V file
    pub fn from_file(device: &Device, path: &Path) -> GpuResult<Self> {
        let words = read_spirv(path)?;
        log::debug!("Loaded shader {path:?} ({} words)", words.len());
        Self::from_words(device, &words)
    }

    fn stage(&self, stage: vk::ShaderStageFlags) -> vk::PipelineShaderStageCreateInfo {
        vk::PipelineShaderStageCreateInfo::builder()
            .stage(stage)
            .module(self.module)
            .name(ENTRY_POINT)
            .build()
    }
}

impl Drop for ShaderModule {
    fn drop(&mut self) {
        unsafe { self.device.destroy_shader_module(self.module, None) };
    }
}

/// Pipeline layout over `set_layouts` with the vertex-stage push constant range
pub fn create_pipeline_layout(device: &Device, set_layouts: &[vk::DescriptorSetLayout]) -> GpuResult<vk::PipelineLayout> {
    let push_constant_ranges = [vk::PushConstantRange {
        stage_flags: vk::ShaderStageFlags::VERTEX,
        offset: 0,
        size: std::mem::size_of::<MeshPushConstants>() as u32,
    }];
    let create_info = vk::PipelineLayoutCreateInfo::builder()
        .set_layouts(set_layouts)
        .push_constant_ranges(&push_constant_ranges);
    Ok(unsafe { device.create_pipeline_layout(&create_info, None)? })
}

/// Build a graphics pipeline for `desc` against `render_pass`
///
/// Viewport and scissor are dynamic and set at the start of every render pass.
/// Shader modules live only for the duration of this call.
pub fn create_graphics_pipeline(
    device: &Device,
    render_pass: vk::RenderPass,
    layout: vk::PipelineLayout,
    desc: &PipelineDesc,
) -> GpuResult<vk::Pipeline> {
    let vertex_shader = ShaderModule::from_file(device, &desc.vertex_shader)?;
    let fragment_shader = ShaderModule::from_file(device, &desc.fragment_shader)?;
    let stages = [
        vertex_shader.stage(vk::ShaderStageFlags::VERTEX),
        fragment_shader.stage(vk::ShaderStageFlags::FRAGMENT),
    ];

    let bindings = [Vertex::binding_description()];
    let attributes = Vertex::attribute_descriptions();
    let vertex_input = vk::PipelineVertexInputStateCreateInfo::builder()
        .vertex_binding_descriptions(&bindings)
        .vertex_attribute_descriptions(&attributes);

    let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::builder()
        .topology(desc.topology)
        .primitive_restart_enable(false);

    let viewport_state = vk::PipelineViewportStateCreateInfo::builder()
        .viewport_count(1)
        .scissor_count(1);
    let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
    let dynamic_state = vk::PipelineDynamicStateCreateInfo::builder().dynamic_states(&dynamic_states);

    let rasterizer = vk::PipelineRasterizationStateCreateInfo::builder()
        .depth_clamp_enable(false)
        .rasterizer_discard_enable(false)
        .polygon_mode(desc.polygon_mode)
        .line_width(1.0)
        .cull_mode(desc.cull_mode)
        .front_face(vk::FrontFace::CLOCKWISE)
        .depth_bias_enable(false);

    let multisampling = vk::PipelineMultisampleStateCreateInfo::builder()
        .sample_shading_enable(false)
        .rasterization_samples(vk::SampleCountFlags::TYPE_1)
        .min_sample_shading(1.0);

    let depth_stencil = vk::PipelineDepthStencilStateCreateInfo::builder()
        .depth_test_enable(desc.depth_test)
        .depth_write_enable(desc.depth_test)
        .depth_compare_op(if desc.depth_test {
            vk::CompareOp::LESS_OR_EQUAL
        } else {
            vk::CompareOp::ALWAYS
        })
        .depth_bounds_test_enable(false)
        .stencil_test_enable(false)
        .min_depth_bounds(0.0)
        .max_depth_bounds(1.0);

    let color_blend_attachments = [vk::PipelineColorBlendAttachmentState::builder()
        .color_write_mask(
            vk::ColorComponentFlags::R
                | vk::ColorComponentFlags::G
                | vk::ColorComponentFlags::B
                | vk::ColorComponentFlags::A,
        )
        .blend_enable(false)
        .build()];
    let color_blending = vk::PipelineColorBlendStateCreateInfo::builder()
        .logic_op_enable(false)
        .attachments(&color_blend_attachments);

    let create_info = vk::GraphicsPipelineCreateInfo::builder()
        .stages(&stages)
        .vertex_input_state(&vertex_input)
        .input_assembly_state(&input_assembly)
        .viewport_state(&viewport_state)
        .rasterization_state(&rasterizer)
        .multisample_state(&multisampling)
        .depth_stencil_state(&depth_stencil)
        .color_blend_state(&color_blending)
        .dynamic_state(&dynamic_state)
        .layout(layout)
        .render_pass(render_pass)
        .subpass(0)
        .build();

    let pipelines = unsafe { device.create_graphics_pipelines(vk::PipelineCache::null(), &[create_info], None) }
        .map_err(|(_, result)| {
            log::error!("vkCreateGraphicsPipelines failed: {result:?}");
            GpuError::from(result)
        })?;
    pipelines
        .into_iter()
        .next()
        .ok_or_else(|| GpuError::InvalidOperation("driver returned no pipeline".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_shader_is_a_shader_load_error() {
        let path = Path::new("definitely/not/here.vert.spv");
        match read_spirv(path) {
            Err(GpuError::ShaderLoad { path: failed, .. }) => assert_eq!(failed, path),
            other => panic!("expected ShaderLoad, got {other:?}"),
        }
    }

    #[test]
    fn test_truncated_spirv_is_rejected() {
        let dir = std::env::temp_dir().join(format!("frame_core_spv_{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("truncated.spv");
        std::fs::write(&path, [0x03, 0x02, 0x23]).unwrap();

        assert!(matches!(read_spirv(&path), Err(GpuError::ShaderLoad { .. })));
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_valid_magic_number_is_accepted() {
        let dir = std::env::temp_dir().join(format!("frame_core_spv_ok_{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("header.spv");
        let words: [u32; 2] = [0x0723_0203, 0x0001_0000];
        let bytes: Vec<u8> = words.iter().flat_map(|word| word.to_le_bytes()).collect();
        std::fs::write(&path, bytes).unwrap();

        assert_eq!(read_spirv(&path).unwrap(), words.to_vec());
        std::fs::remove_dir_all(&dir).unwrap();
    }
}
