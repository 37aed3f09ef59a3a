//! Graphics and compute pipelines for dynamic rendering.

use ash::vk;
use crate::error::RhiError;
use crate::pipeline::{PipelineDesc, ShaderBinary, ShaderProgram};
use crate::vulkan::utility;

pub(crate) struct PipelineEntry {
    pub pipeline: vk::Pipeline,
    pub layout: vk::PipelineLayout,
    pub set_layout: vk::DescriptorSetLayout,
    pub bind_point: vk::PipelineBindPoint,
}

impl PipelineEntry {
    /// # Safety
    /// The pipeline must not be referenced by pending command buffers.
    pub(crate) unsafe fn destroy(self, device: &ash::Device) {
        unsafe {
            device.destroy_pipeline(self.pipeline, None);
            device.destroy_pipeline_layout(self.layout, None);
            device.destroy_descriptor_set_layout(self.set_layout, None);
        }
    }
}

pub(crate) fn create_pipeline(device: &ash::Device, desc: &PipelineDesc) -> Result<PipelineEntry, RhiError> {
    let bindings: Vec<vk::DescriptorSetLayoutBinding> = desc
        .bindings
        .iter()
        .map(|slot| {
            vk::DescriptorSetLayoutBinding::default()
                .binding(slot.binding)
                .descriptor_type(utility::descriptor_type(slot.kind))
                .descriptor_count(slot.count)
                .stage_flags(utility::shader_stages(slot.stages))
        })
        .collect();
    let set_layout_info = vk::DescriptorSetLayoutCreateInfo::default().bindings(&bindings);
    let set_layout = unsafe { device.create_descriptor_set_layout(&set_layout_info, None)? };

    let layout_info = vk::PipelineLayoutCreateInfo::default().set_layouts(std::slice::from_ref(&set_layout));
    let layout = match unsafe { device.create_pipeline_layout(&layout_info, None) } {
        Ok(layout) => layout,
        Err(err) => {
            unsafe { device.destroy_descriptor_set_layout(set_layout, None) };
            return Err(err.into());
        }
    };

    let created = match &desc.program {
        ShaderProgram::Graphics { vertex, fragment } => create_graphics(device, desc, layout, vertex, fragment),
        ShaderProgram::Compute(compute) => create_compute(device, layout, compute),
    };

    match created {
        Ok((pipeline, bind_point)) => Ok(PipelineEntry { pipeline, layout, set_layout, bind_point }),
        Err(err) => {
            unsafe {
                device.destroy_pipeline_layout(layout, None);
                device.destroy_descriptor_set_layout(set_layout, None);
            }
            Err(RhiError::PipelineCreation { name: desc.name.clone(), reason: err.to_string() })
        }
    }
}

fn create_shader_module(device: &ash::Device, binary: &ShaderBinary) -> Result<vk::ShaderModule, vk::Result> {
    let create_info = vk::ShaderModuleCreateInfo::default().code(binary.words());
    unsafe { device.create_shader_module(&create_info, None) }
}

fn create_graphics(
    device: &ash::Device,
    desc: &PipelineDesc,
    layout: vk::PipelineLayout,
    vertex: &ShaderBinary,
    fragment: &ShaderBinary,
) -> Result<(vk::Pipeline, vk::PipelineBindPoint), vk::Result> {
    let vertex_module = create_shader_module(device, vertex)?;
    let fragment_module = match create_shader_module(device, fragment) {
        Ok(module) => module,
        Err(err) => {
            unsafe { device.destroy_shader_module(vertex_module, None) };
            return Err(err);
        }
    };

    let entry_point = c"main";
    let shader_stages = [
        vk::PipelineShaderStageCreateInfo::default()
            .stage(vk::ShaderStageFlags::VERTEX)
            .module(vertex_module)
            .name(entry_point),
        vk::PipelineShaderStageCreateInfo::default()
            .stage(vk::ShaderStageFlags::FRAGMENT)
            .module(fragment_module)
            .name(entry_point),
    ];

    // Stimulus passes generate their geometry in the vertex shader.
    let vertex_input_state = vk::PipelineVertexInputStateCreateInfo::default();
    let input_assembly_state = vk::PipelineInputAssemblyStateCreateInfo::default()
        .topology(utility::topology(desc.topology));
    let viewport_state = vk::PipelineViewportStateCreateInfo::default()
        .viewport_count(1)
        .scissor_count(1);
    let rasterization_state = vk::PipelineRasterizationStateCreateInfo::default()
        .polygon_mode(vk::PolygonMode::FILL)
        .cull_mode(vk::CullModeFlags::NONE)
        .front_face(vk::FrontFace::COUNTER_CLOCKWISE)
        .line_width(1.0);
    let multisample_state = vk::PipelineMultisampleStateCreateInfo::default()
        .rasterization_samples(vk::SampleCountFlags::TYPE_1);

    let blend_attachments: Vec<vk::PipelineColorBlendAttachmentState> = desc
        .color_formats
        .iter()
        .map(|_| {
            vk::PipelineColorBlendAttachmentState::default()
                .blend_enable(desc.blend_enabled)
                .src_color_blend_factor(vk::BlendFactor::SRC_ALPHA)
                .dst_color_blend_factor(vk::BlendFactor::ONE_MINUS_SRC_ALPHA)
                .color_blend_op(vk::BlendOp::ADD)
                .src_alpha_blend_factor(vk::BlendFactor::ONE)
                .dst_alpha_blend_factor(vk::BlendFactor::ZERO)
                .alpha_blend_op(vk::BlendOp::ADD)
                .color_write_mask(vk::ColorComponentFlags::RGBA)
        })
        .collect();
    let color_blend_state = vk::PipelineColorBlendStateCreateInfo::default().attachments(&blend_attachments);

    let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
    let dynamic_state = vk::PipelineDynamicStateCreateInfo::default().dynamic_states(&dynamic_states);

    let color_formats: Vec<vk::Format> = desc.color_formats.iter().copied().map(utility::vk_format).collect();
    let mut rendering_info = vk::PipelineRenderingCreateInfo::default().color_attachment_formats(&color_formats);

    let pipeline_info = vk::GraphicsPipelineCreateInfo::default()
        .stages(&shader_stages)
        .vertex_input_state(&vertex_input_state)
        .input_assembly_state(&input_assembly_state)
        .viewport_state(&viewport_state)
        .rasterization_state(&rasterization_state)
        .multisample_state(&multisample_state)
        .color_blend_state(&color_blend_state)
        .dynamic_state(&dynamic_state)
        .layout(layout)
        .push_next(&mut rendering_info);

    let pipelines = unsafe { device.create_graphics_pipelines(vk::PipelineCache::null(), &[pipeline_info], None) }
        .map_err(|e| e.1);

    unsafe {
        device.destroy_shader_module(vertex_module, None);
        device.destroy_shader_module(fragment_module, None);
    }
    Ok((pipelines?[0], vk::PipelineBindPoint::GRAPHICS))
}

fn create_compute(
    device: &ash::Device,
    layout: vk::PipelineLayout,
    compute: &ShaderBinary,
) -> Result<(vk::Pipeline, vk::PipelineBindPoint), vk::Result> {
    let module = create_shader_module(device, compute)?;
    let stage = vk::PipelineShaderStageCreateInfo::default()
        .stage(vk::ShaderStageFlags::COMPUTE)
        .module(module)
        .name(c"main");
    let pipeline_info = vk::ComputePipelineCreateInfo::default().stage(stage).layout(layout);

    let pipelines = unsafe { device.create_compute_pipelines(vk::PipelineCache::null(), &[pipeline_info], None) }
        .map_err(|e| e.1);
    unsafe { device.destroy_shader_module(module, None) };
    Ok((pipelines?[0], vk::PipelineBindPoint::COMPUTE))
}
