//! Swaying quad textured with a procedural checkerboard.
//!
//! Compile the shaders first: `./shaders/compile_shaders.sh`.

mod common;

use ash::vk;
use common::{create_uniform_buffer, run_demo, upload_buffer, DemoScene, RenderTarget};
use prism_renderer::renderer::pipeline::{
    allocate_descriptor_set, create_descriptor_pool, create_descriptor_set_layout,
    create_graphics_pipeline, create_pipeline_layout, create_sampler, create_shader_module,
    write_buffer_descriptor, write_image_descriptor, DescriptorBindings, DescriptorPoolSizes,
    PipelineDesc, VertexLayout,
};
use prism_renderer::{Buffer, FrameDraw, Image, Renderer, RendererResult, Scene};
use std::error::Error;
use std::mem;
use ultraviolet::{projection, Mat4, Vec3};

const TEXTURE_SIZE: u32 = 256;
const SQUARE_SIZE: u32 = 32;

#[derive(Clone, Copy)]
#[repr(C)]
struct Vertex {
    position: [f32; 3],
    uv: [f32; 2],
}

#[derive(Clone, Copy)]
#[repr(C)]
struct Transform {
    mvp: Mat4,
}

const VERTICES: [Vertex; 4] = [
    Vertex {
        position: [-0.5, -0.5, 0.0],
        uv: [0.0, 0.0],
    },
    Vertex {
        position: [0.5, -0.5, 0.0],
        uv: [1.0, 0.0],
    },
    Vertex {
        position: [0.5, 0.5, 0.0],
        uv: [1.0, 1.0],
    },
    Vertex {
        position: [-0.5, 0.5, 0.0],
        uv: [0.0, 1.0],
    },
];
const INDICES: [u16; 6] = [0, 1, 2, 2, 3, 0];

struct TexturedQuad {
    target: RenderTarget,
    descriptor_pool: vk::DescriptorPool,
    descriptor_set_layout: vk::DescriptorSetLayout,
    descriptor_set: vk::DescriptorSet,
    pipeline_layout: vk::PipelineLayout,
    pipeline: vk::Pipeline,
    vertex_buffer: Buffer,
    index_buffer: Buffer,
    uniform_buffer: Buffer,
    texture: Image,
    texture_view: vk::ImageView,
    sampler: vk::Sampler,
    angle: f32,
}

impl TexturedQuad {
    fn new(renderer: &mut Renderer) -> Result<Self, Box<dyn Error>> {
        let target = RenderTarget::new(renderer)?;

        let vertex_buffer =
            upload_buffer(renderer, &VERTICES, vk::BufferUsageFlags::VERTEX_BUFFER)?;
        let index_buffer = upload_buffer(renderer, &INDICES, vk::BufferUsageFlags::INDEX_BUFFER)?;
        let uniform_buffer = create_uniform_buffer::<Transform>(renderer)?;

        let (texture, texture_view) = create_checkerboard_texture(renderer)?;
        let sampler = create_sampler(renderer.device())?;

        let device = renderer.device();
        let bindings = DescriptorBindings::default()
            .add(
                0,
                vk::DescriptorType::UNIFORM_BUFFER,
                1,
                vk::ShaderStageFlags::VERTEX,
            )
            .add(
                1,
                vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
                1,
                vk::ShaderStageFlags::FRAGMENT,
            );
        let descriptor_set_layout = create_descriptor_set_layout(device, &bindings)?;
        let pool_sizes = DescriptorPoolSizes::default()
            .add(vk::DescriptorType::UNIFORM_BUFFER, 1)
            .add(vk::DescriptorType::COMBINED_IMAGE_SAMPLER, 1);
        let descriptor_pool = create_descriptor_pool(device, 1, &pool_sizes)?;
        let descriptor_set = allocate_descriptor_set(device, descriptor_pool, descriptor_set_layout)?;
        write_buffer_descriptor(
            device,
            descriptor_set,
            0,
            vk::DescriptorType::UNIFORM_BUFFER,
            &uniform_buffer,
        );
        write_image_descriptor(
            device,
            descriptor_set,
            1,
            texture_view,
            sampler,
            texture.layout(),
        );

        let pipeline_layout = create_pipeline_layout(device, &[descriptor_set_layout], &[])?;

        let vertex_layout = VertexLayout::default()
            .add_binding(0, mem::size_of::<Vertex>() as u32)
            .add_attribute(0, 0, vk::Format::R32G32B32_SFLOAT, 0)
            .add_attribute(0, 1, vk::Format::R32G32_SFLOAT, 12);

        let vertex_shader = create_shader_module(device, "shaders/texture.vert.spv")?;
        let fragment_shader = create_shader_module(device, "shaders/texture.frag.spv")?;
        let pipeline = create_graphics_pipeline(
            device,
            &PipelineDesc {
                vertex_shader,
                fragment_shader,
                vertex_layout: &vertex_layout,
                layout: pipeline_layout,
                render_pass: target.render_pass,
            },
        )?;
        unsafe {
            device.destroy_shader_module(vertex_shader, None);
            device.destroy_shader_module(fragment_shader, None);
        }

        Ok(Self {
            target,
            descriptor_pool,
            descriptor_set_layout,
            descriptor_set,
            pipeline_layout,
            pipeline,
            vertex_buffer,
            index_buffer,
            uniform_buffer,
            texture,
            texture_view,
            sampler,
            angle: 0.0,
        })
    }
}

/// Builds a checkerboard texture and uploads it through a staging buffer on
/// the transfer queue.
fn create_checkerboard_texture(
    renderer: &Renderer,
) -> RendererResult<(Image, vk::ImageView)> {
    let mut pixels = Vec::with_capacity((TEXTURE_SIZE * TEXTURE_SIZE * 4) as usize);
    for y in 0..TEXTURE_SIZE {
        for x in 0..TEXTURE_SIZE {
            let even = ((x / SQUARE_SIZE) + (y / SQUARE_SIZE)) % 2 == 0;
            let value = if even { 0xec } else { 0x1a };
            pixels.extend_from_slice(&[value, value, value, 0xff]);
        }
    }

    let allocator = renderer.allocator();
    let staging = allocator.create_buffer(
        pixels.len() as vk::DeviceSize,
        vk::BufferUsageFlags::TRANSFER_SRC,
        vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
    )?;
    allocator.write_resource(&staging, &pixels)?;

    let mut texture = allocator.create_image_2d(
        TEXTURE_SIZE,
        TEXTURE_SIZE,
        4,
        vk::ImageUsageFlags::TRANSFER_DST | vk::ImageUsageFlags::SAMPLED,
        vk::Format::R8G8B8A8_UNORM,
        vk::MemoryPropertyFlags::DEVICE_LOCAL,
    )?;

    renderer.with_sync_transfer(|command_buffer| {
        renderer.cmd_change_image_layout(
            command_buffer,
            &mut texture,
            vk::AccessFlags::empty(),
            vk::AccessFlags::TRANSFER_WRITE,
            vk::PipelineStageFlags::TOP_OF_PIPE,
            vk::PipelineStageFlags::TRANSFER,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            vk::ImageAspectFlags::COLOR,
        );
        renderer.cmd_copy_buffer_to_image(
            command_buffer,
            &staging,
            &texture,
            vk::ImageAspectFlags::COLOR,
        );
        renderer.cmd_change_image_layout(
            command_buffer,
            &mut texture,
            vk::AccessFlags::TRANSFER_WRITE,
            vk::AccessFlags::SHADER_READ,
            vk::PipelineStageFlags::TRANSFER,
            vk::PipelineStageFlags::FRAGMENT_SHADER,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            vk::ImageAspectFlags::COLOR,
        );
        Ok(())
    })?;

    allocator.destroy_buffer(staging);

    let view = allocator.create_image_view_2d(&texture, vk::ImageAspectFlags::COLOR)?;
    Ok((texture, view))
}

impl Scene for TexturedQuad {
    fn update(&mut self, renderer: &mut Renderer, delta: f32) -> RendererResult<()> {
        self.angle += delta;

        let extent = renderer.extent();
        let aspect = extent.width as f32 / extent.height as f32;
        let projection = projection::perspective_vk(60f32.to_radians(), aspect, 0.1, 10.0);
        let view = Mat4::look_at(Vec3::new(0.0, 0.0, 1.5), Vec3::zero(), Vec3::unit_y());
        let model = Mat4::from_rotation_y(self.angle.sin() * 0.8);

        let transform = Transform {
            mvp: projection * view * model,
        };
        renderer
            .allocator()
            .write_resource(&self.uniform_buffer, &[transform])
    }

    fn frame(&self) -> FrameDraw<'_> {
        FrameDraw {
            render_pass: self.target.render_pass,
            framebuffers: &self.target.framebuffers,
            pipeline: self.pipeline,
            pipeline_layout: self.pipeline_layout,
            descriptor_set: self.descriptor_set,
            vertex_buffer: self.vertex_buffer.buffer,
            index_buffer: self.index_buffer.buffer,
            index_type: vk::IndexType::UINT16,
            index_count: INDICES.len() as u32,
        }
    }

    fn swapchain_rebuilt(&mut self, renderer: &mut Renderer) -> RendererResult<()> {
        self.target.rebuild(renderer)
    }
}

impl DemoScene for TexturedQuad {
    fn destroy(mut self, renderer: &mut Renderer) {
        let device = renderer.device();
        unsafe {
            device.destroy_pipeline(self.pipeline, None);
            device.destroy_pipeline_layout(self.pipeline_layout, None);
            device.destroy_descriptor_pool(self.descriptor_pool, None);
            device.destroy_descriptor_set_layout(self.descriptor_set_layout, None);
            device.destroy_sampler(self.sampler, None);
            device.destroy_image_view(self.texture_view, None);
        }
        let allocator = renderer.allocator();
        allocator.destroy_image(self.texture);
        allocator.destroy_buffer(self.uniform_buffer);
        allocator.destroy_buffer(self.index_buffer);
        allocator.destroy_buffer(self.vertex_buffer);
        self.target.destroy(renderer);
    }
}

fn main() -> Result<(), Box<dyn Error>> {
    run_demo("textured quad", TexturedQuad::new)
}
