//! Descriptor, render pass and graphics pipeline construction.
//!
//! Thin declarative builders gather the repetitive array plumbing; the
//! `create_*` functions turn them into live objects.

use crate::error::RendererResult;
use crate::renderer::resource::Buffer;
use ash::{util::read_spv, vk, Device};
use std::{ffi::CStr, fs::File, path::Path};

const SHADER_ENTRY_POINT: &CStr = unsafe { CStr::from_bytes_with_nul_unchecked(b"main\0") };

/// Capacity declaration for a descriptor pool.
#[derive(Default)]
pub struct DescriptorPoolSizes {
    sizes: Vec<vk::DescriptorPoolSize>,
}

impl DescriptorPoolSizes {
    pub fn add(mut self, ty: vk::DescriptorType, descriptor_count: u32) -> Self {
        self.sizes.push(vk::DescriptorPoolSize {
            ty,
            descriptor_count,
        });
        self
    }
}

/// Binding list for a descriptor set layout.
#[derive(Default)]
pub struct DescriptorBindings {
    bindings: Vec<vk::DescriptorSetLayoutBinding>,
}

impl DescriptorBindings {
    pub fn add(
        mut self,
        binding: u32,
        descriptor_type: vk::DescriptorType,
        descriptor_count: u32,
        stages: vk::ShaderStageFlags,
    ) -> Self {
        self.bindings.push(
            vk::DescriptorSetLayoutBinding::builder()
                .binding(binding)
                .descriptor_type(descriptor_type)
                .descriptor_count(descriptor_count)
                .stage_flags(stages)
                .build(),
        );
        self
    }
}

/// Attachment list for a single-subpass render pass.
///
/// Attachments are referenced in the order they are added; at most one may
/// be a depth attachment.
#[derive(Default)]
pub struct RenderPassLayout {
    attachments: Vec<vk::AttachmentDescription>,
    color_refs: Vec<vk::AttachmentReference>,
    depth_ref: Option<vk::AttachmentReference>,
}

impl RenderPassLayout {
    pub fn add_color_attachment(self, format: vk::Format, final_layout: vk::ImageLayout) -> Self {
        self.add_attachment(
            format,
            final_layout,
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            false,
        )
    }

    pub fn add_depth_attachment(self, format: vk::Format) -> Self {
        self.add_attachment(
            format,
            vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
            vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
            true,
        )
    }

    fn add_attachment(
        mut self,
        format: vk::Format,
        final_layout: vk::ImageLayout,
        reference_layout: vk::ImageLayout,
        depth: bool,
    ) -> Self {
        let attachment = vk::AttachmentDescription::builder()
            .format(format)
            .samples(vk::SampleCountFlags::TYPE_1)
            .load_op(vk::AttachmentLoadOp::CLEAR)
            .store_op(vk::AttachmentStoreOp::STORE)
            .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
            .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .final_layout(final_layout)
            .build();

        let reference = vk::AttachmentReference {
            attachment: self.attachments.len() as u32,
            layout: reference_layout,
        };
        self.attachments.push(attachment);
        if depth {
            self.depth_ref = Some(reference);
        } else {
            self.color_refs.push(reference);
        }
        self
    }
}

/// Vertex input declaration for a pipeline.
#[derive(Default)]
pub struct VertexLayout {
    bindings: Vec<vk::VertexInputBindingDescription>,
    attributes: Vec<vk::VertexInputAttributeDescription>,
}

impl VertexLayout {
    pub fn add_binding(mut self, binding: u32, stride: u32) -> Self {
        self.bindings.push(
            vk::VertexInputBindingDescription::builder()
                .binding(binding)
                .stride(stride)
                .input_rate(vk::VertexInputRate::VERTEX)
                .build(),
        );
        self
    }

    pub fn add_attribute(
        mut self,
        binding: u32,
        location: u32,
        format: vk::Format,
        offset: u32,
    ) -> Self {
        self.attributes.push(
            vk::VertexInputAttributeDescription::builder()
                .binding(binding)
                .location(location)
                .format(format)
                .offset(offset)
                .build(),
        );
        self
    }
}

/// Inputs for [`create_graphics_pipeline`].
pub struct PipelineDesc<'a> {
    pub vertex_shader: vk::ShaderModule,
    pub fragment_shader: vk::ShaderModule,
    pub vertex_layout: &'a VertexLayout,
    pub layout: vk::PipelineLayout,
    pub render_pass: vk::RenderPass,
}

pub fn create_descriptor_pool(
    device: &Device,
    max_sets: u32,
    pool_sizes: &DescriptorPoolSizes,
) -> RendererResult<vk::DescriptorPool> {
    log::debug!("Creating descriptor pool for {max_sets} sets");
    let create_info = vk::DescriptorPoolCreateInfo::builder()
        .flags(vk::DescriptorPoolCreateFlags::FREE_DESCRIPTOR_SET)
        .max_sets(max_sets)
        .pool_sizes(&pool_sizes.sizes);
    let pool = unsafe { device.create_descriptor_pool(&create_info, None)? };
    Ok(pool)
}

pub fn create_descriptor_set_layout(
    device: &Device,
    bindings: &DescriptorBindings,
) -> RendererResult<vk::DescriptorSetLayout> {
    let create_info = vk::DescriptorSetLayoutCreateInfo::builder().bindings(&bindings.bindings);
    let layout = unsafe { device.create_descriptor_set_layout(&create_info, None)? };
    Ok(layout)
}

pub fn allocate_descriptor_set(
    device: &Device,
    pool: vk::DescriptorPool,
    layout: vk::DescriptorSetLayout,
) -> RendererResult<vk::DescriptorSet> {
    let layouts = [layout];
    let allocate_info = vk::DescriptorSetAllocateInfo::builder()
        .descriptor_pool(pool)
        .set_layouts(&layouts);
    let set = unsafe { device.allocate_descriptor_sets(&allocate_info)? }
        .into_iter()
        .next()
        .unwrap_or_default();
    Ok(set)
}

/// Points a buffer descriptor at the whole of `buffer`.
pub fn write_buffer_descriptor(
    device: &Device,
    set: vk::DescriptorSet,
    binding: u32,
    descriptor_type: vk::DescriptorType,
    buffer: &Buffer,
) {
    let buffer_info = [vk::DescriptorBufferInfo {
        buffer: buffer.buffer,
        offset: 0,
        range: buffer.size,
    }];
    let write = vk::WriteDescriptorSet::builder()
        .dst_set(set)
        .dst_binding(binding)
        .descriptor_type(descriptor_type)
        .buffer_info(&buffer_info)
        .build();
    unsafe { device.update_descriptor_sets(&[write], &[]) };
}

/// Points a combined image sampler descriptor at `view`.
pub fn write_image_descriptor(
    device: &Device,
    set: vk::DescriptorSet,
    binding: u32,
    view: vk::ImageView,
    sampler: vk::Sampler,
    layout: vk::ImageLayout,
) {
    let image_info = [vk::DescriptorImageInfo {
        sampler,
        image_view: view,
        image_layout: layout,
    }];
    let write = vk::WriteDescriptorSet::builder()
        .dst_set(set)
        .dst_binding(binding)
        .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
        .image_info(&image_info)
        .build();
    unsafe { device.update_descriptor_sets(&[write], &[]) };
}

/// Creates a single-subpass render pass over the declared attachments.
pub fn create_render_pass(
    device: &Device,
    layout: &RenderPassLayout,
) -> RendererResult<vk::RenderPass> {
    let mut subpass = vk::SubpassDescription::builder()
        .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
        .color_attachments(&layout.color_refs);
    if let Some(depth_ref) = layout.depth_ref.as_ref() {
        subpass = subpass.depth_stencil_attachment(depth_ref);
    }
    let subpasses = [subpass.build()];

    let dependencies = [vk::SubpassDependency::builder()
        .src_subpass(vk::SUBPASS_EXTERNAL)
        .dst_subpass(0)
        .src_stage_mask(
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
                | vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS,
        )
        .src_access_mask(vk::AccessFlags::empty())
        .dst_stage_mask(
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
                | vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS,
        )
        .dst_access_mask(
            vk::AccessFlags::COLOR_ATTACHMENT_WRITE
                | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
        )
        .build()];

    let create_info = vk::RenderPassCreateInfo::builder()
        .attachments(&layout.attachments)
        .subpasses(&subpasses)
        .dependencies(&dependencies);
    let render_pass = unsafe { device.create_render_pass(&create_info, None)? };
    Ok(render_pass)
}

/// Creates one framebuffer per color view, each sharing the depth view.
pub fn create_framebuffers(
    device: &Device,
    render_pass: vk::RenderPass,
    extent: vk::Extent2D,
    color_views: &[vk::ImageView],
    depth_view: Option<vk::ImageView>,
) -> RendererResult<Vec<vk::Framebuffer>> {
    let mut framebuffers = Vec::with_capacity(color_views.len());
    for color_view in color_views {
        let mut attachments = vec![*color_view];
        if let Some(depth_view) = depth_view {
            attachments.push(depth_view);
        }
        let create_info = vk::FramebufferCreateInfo::builder()
            .render_pass(render_pass)
            .attachments(&attachments)
            .width(extent.width)
            .height(extent.height)
            .layers(1);
        framebuffers.push(unsafe { device.create_framebuffer(&create_info, None)? });
    }
    Ok(framebuffers)
}

/// Loads a SPIR-V module from disk.
pub fn create_shader_module<P: AsRef<Path>>(
    device: &Device,
    path: P,
) -> RendererResult<vk::ShaderModule> {
    log::debug!("Loading shader module {}", path.as_ref().display());
    let mut file = File::open(path)?;
    let code = read_spv(&mut file)?;
    let create_info = vk::ShaderModuleCreateInfo::builder().code(&code);
    let module = unsafe { device.create_shader_module(&create_info, None)? };
    Ok(module)
}

pub fn create_pipeline_layout(
    device: &Device,
    set_layouts: &[vk::DescriptorSetLayout],
    push_constant_ranges: &[vk::PushConstantRange],
) -> RendererResult<vk::PipelineLayout> {
    let create_info = vk::PipelineLayoutCreateInfo::builder()
        .set_layouts(set_layouts)
        .push_constant_ranges(push_constant_ranges);
    let layout = unsafe { device.create_pipeline_layout(&create_info, None)? };
    Ok(layout)
}

/// Creates a sampler with linear filtering and repeat addressing.
pub fn create_sampler(device: &Device) -> RendererResult<vk::Sampler> {
    let create_info = vk::SamplerCreateInfo::builder()
        .mag_filter(vk::Filter::LINEAR)
        .min_filter(vk::Filter::LINEAR)
        .mipmap_mode(vk::SamplerMipmapMode::LINEAR)
        .address_mode_u(vk::SamplerAddressMode::REPEAT)
        .address_mode_v(vk::SamplerAddressMode::REPEAT)
        .address_mode_w(vk::SamplerAddressMode::REPEAT)
        .max_lod(1.0);
    let sampler = unsafe { device.create_sampler(&create_info, None)? };
    Ok(sampler)
}

/// Creates the graphics pipeline.
///
/// Fixed state: triangle lists, no culling, counter-clockwise front faces,
/// depth test and write with `LESS`, no blending. Viewport and scissor are
/// dynamic so the pipeline survives swapchain resizes.
pub fn create_graphics_pipeline(
    device: &Device,
    desc: &PipelineDesc,
) -> RendererResult<vk::Pipeline> {
    log::debug!("Creating graphics pipeline");

    let stages = [
        vk::PipelineShaderStageCreateInfo::builder()
            .stage(vk::ShaderStageFlags::VERTEX)
            .module(desc.vertex_shader)
            .name(SHADER_ENTRY_POINT)
            .build(),
        vk::PipelineShaderStageCreateInfo::builder()
            .stage(vk::ShaderStageFlags::FRAGMENT)
            .module(desc.fragment_shader)
            .name(SHADER_ENTRY_POINT)
            .build(),
    ];

    let vertex_input_info = vk::PipelineVertexInputStateCreateInfo::builder()
        .vertex_binding_descriptions(&desc.vertex_layout.bindings)
        .vertex_attribute_descriptions(&desc.vertex_layout.attributes);

    let input_assembly_info = vk::PipelineInputAssemblyStateCreateInfo::builder()
        .topology(vk::PrimitiveTopology::TRIANGLE_LIST)
        .primitive_restart_enable(false);

    let viewport_info = vk::PipelineViewportStateCreateInfo::builder()
        .viewport_count(1)
        .scissor_count(1);

    let rasterizer_info = vk::PipelineRasterizationStateCreateInfo::builder()
        .depth_clamp_enable(false)
        .rasterizer_discard_enable(false)
        .polygon_mode(vk::PolygonMode::FILL)
        .line_width(1.0)
        .cull_mode(vk::CullModeFlags::NONE)
        .front_face(vk::FrontFace::COUNTER_CLOCKWISE)
        .depth_bias_enable(false);

    let multisampling_info = vk::PipelineMultisampleStateCreateInfo::builder()
        .sample_shading_enable(false)
        .rasterization_samples(vk::SampleCountFlags::TYPE_1);

    let depth_stencil_info = vk::PipelineDepthStencilStateCreateInfo::builder()
        .depth_test_enable(true)
        .depth_write_enable(true)
        .depth_compare_op(vk::CompareOp::LESS)
        .depth_bounds_test_enable(false)
        .stencil_test_enable(false);

    let color_blend_attachments = [vk::PipelineColorBlendAttachmentState::builder()
        .color_write_mask(
            vk::ColorComponentFlags::R
                | vk::ColorComponentFlags::G
                | vk::ColorComponentFlags::B
                | vk::ColorComponentFlags::A,
        )
        .blend_enable(false)
        .build()];
    let color_blending_info = vk::PipelineColorBlendStateCreateInfo::builder()
        .logic_op_enable(false)
        .attachments(&color_blend_attachments);

    let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
    let dynamic_state_info =
        vk::PipelineDynamicStateCreateInfo::builder().dynamic_states(&dynamic_states);

    let create_info = vk::GraphicsPipelineCreateInfo::builder()
        .stages(&stages)
        .vertex_input_state(&vertex_input_info)
        .input_assembly_state(&input_assembly_info)
        .viewport_state(&viewport_info)
        .rasterization_state(&rasterizer_info)
        .multisample_state(&multisampling_info)
        .depth_stencil_state(&depth_stencil_info)
        .color_blend_state(&color_blending_info)
        .dynamic_state(&dynamic_state_info)
        .layout(desc.layout)
        .render_pass(desc.render_pass)
        .subpass(0)
        .build();

    let pipeline = unsafe {
        device
            .create_graphics_pipelines(vk::PipelineCache::null(), &[create_info], None)
            .map_err(|(_, error)| error)?[0]
    };
    Ok(pipeline)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attachments_are_referenced_in_declaration_order() {
        let layout = RenderPassLayout::default()
            .add_color_attachment(vk::Format::B8G8R8A8_UNORM, vk::ImageLayout::PRESENT_SRC_KHR)
            .add_depth_attachment(vk::Format::D32_SFLOAT);

        assert_eq!(layout.attachments.len(), 2);
        assert_eq!(layout.color_refs.len(), 1);
        assert_eq!(layout.color_refs[0].attachment, 0);

        let depth_ref = layout.depth_ref.unwrap();
        assert_eq!(depth_ref.attachment, 1);
        assert_eq!(
            depth_ref.layout,
            vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL
        );
    }

    #[test]
    fn attachments_clear_on_load_and_store_on_write() {
        let layout = RenderPassLayout::default()
            .add_color_attachment(vk::Format::B8G8R8A8_UNORM, vk::ImageLayout::PRESENT_SRC_KHR);

        let attachment = layout.attachments[0];
        assert_eq!(attachment.load_op, vk::AttachmentLoadOp::CLEAR);
        assert_eq!(attachment.store_op, vk::AttachmentStoreOp::STORE);
        assert_eq!(attachment.initial_layout, vk::ImageLayout::UNDEFINED);
        assert_eq!(attachment.final_layout, vk::ImageLayout::PRESENT_SRC_KHR);
    }

    #[test]
    fn vertex_layout_collects_bindings_and_attributes() {
        let layout = VertexLayout::default()
            .add_binding(0, 24)
            .add_attribute(0, 0, vk::Format::R32G32B32_SFLOAT, 0)
            .add_attribute(0, 1, vk::Format::R32G32B32_SFLOAT, 12);

        assert_eq!(layout.bindings.len(), 1);
        assert_eq!(layout.bindings[0].stride, 24);
        assert_eq!(layout.attributes.len(), 2);
        assert_eq!(layout.attributes[1].offset, 12);
    }

    #[test]
    fn descriptor_bindings_carry_stage_flags() {
        let bindings = DescriptorBindings::default()
            .add(0, vk::DescriptorType::UNIFORM_BUFFER, 1, vk::ShaderStageFlags::VERTEX)
            .add(
                1,
                vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
                1,
                vk::ShaderStageFlags::FRAGMENT,
            );

        assert_eq!(bindings.bindings.len(), 2);
        assert_eq!(bindings.bindings[0].stage_flags, vk::ShaderStageFlags::VERTEX);
        assert_eq!(
            bindings.bindings[1].descriptor_type,
            vk::DescriptorType::COMBINED_IMAGE_SAMPLER
        );
    }
}
