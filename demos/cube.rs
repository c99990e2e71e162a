//! Rotating colored cube.
//!
//! Compile the shaders first: `./shaders/compile_shaders.sh`.

mod common;

use ash::vk;
use common::{create_uniform_buffer, run_demo, upload_buffer, DemoScene, RenderTarget};
use prism_renderer::renderer::pipeline::{
    allocate_descriptor_set, create_descriptor_pool, create_descriptor_set_layout,
    create_graphics_pipeline, create_pipeline_layout, create_shader_module,
    write_buffer_descriptor, DescriptorBindings, DescriptorPoolSizes, PipelineDesc, VertexLayout,
};
use prism_renderer::{Buffer, FrameDraw, Renderer, RendererResult, Scene};
use std::error::Error;
use std::mem;
use ultraviolet::{projection, Mat4, Vec3};

#[derive(Clone, Copy)]
#[repr(C)]
struct Vertex {
    position: [f32; 3],
    color: [f32; 3],
}

#[derive(Clone, Copy)]
#[repr(C)]
struct Transform {
    mvp: Mat4,
}

const fn vertex(position: [f32; 3], color: [f32; 3]) -> Vertex {
    Vertex { position, color }
}

const VERTICES: [Vertex; 8] = [
    vertex([-0.5, -0.5, -0.5], [0.0, 0.0, 0.0]),
    vertex([0.5, -0.5, -0.5], [1.0, 0.0, 0.0]),
    vertex([0.5, 0.5, -0.5], [1.0, 1.0, 0.0]),
    vertex([-0.5, 0.5, -0.5], [0.0, 1.0, 0.0]),
    vertex([-0.5, -0.5, 0.5], [0.0, 0.0, 1.0]),
    vertex([0.5, -0.5, 0.5], [1.0, 0.0, 1.0]),
    vertex([0.5, 0.5, 0.5], [1.0, 1.0, 1.0]),
    vertex([-0.5, 0.5, 0.5], [0.0, 1.0, 1.0]),
];

#[rustfmt::skip]
const INDICES: [u16; 36] = [
    0, 1, 2, 2, 3, 0, // back
    4, 6, 5, 6, 4, 7, // front
    0, 3, 7, 7, 4, 0, // left
    1, 5, 6, 6, 2, 1, // right
    3, 2, 6, 6, 7, 3, // top
    0, 4, 5, 5, 1, 0, // bottom
];

struct Cube {
    target: RenderTarget,
    descriptor_pool: vk::DescriptorPool,
    descriptor_set_layout: vk::DescriptorSetLayout,
    descriptor_set: vk::DescriptorSet,
    pipeline_layout: vk::PipelineLayout,
    pipeline: vk::Pipeline,
    vertex_buffer: Buffer,
    index_buffer: Buffer,
    uniform_buffer: Buffer,
    angle: f32,
}

impl Cube {
    fn new(renderer: &mut Renderer) -> Result<Self, Box<dyn Error>> {
        let target = RenderTarget::new(renderer)?;

        let vertex_buffer =
            upload_buffer(renderer, &VERTICES, vk::BufferUsageFlags::VERTEX_BUFFER)?;
        let index_buffer = upload_buffer(renderer, &INDICES, vk::BufferUsageFlags::INDEX_BUFFER)?;
        let uniform_buffer = create_uniform_buffer::<Transform>(renderer)?;

        let device = renderer.device();
        let bindings = DescriptorBindings::default().add(
            0,
            vk::DescriptorType::UNIFORM_BUFFER,
            1,
            vk::ShaderStageFlags::VERTEX,
        );
        let descriptor_set_layout = create_descriptor_set_layout(device, &bindings)?;
        let pool_sizes = DescriptorPoolSizes::default().add(vk::DescriptorType::UNIFORM_BUFFER, 1);
        let descriptor_pool = create_descriptor_pool(device, 1, &pool_sizes)?;
        let descriptor_set = allocate_descriptor_set(device, descriptor_pool, descriptor_set_layout)?;
        write_buffer_descriptor(
            device,
            descriptor_set,
            0,
            vk::DescriptorType::UNIFORM_BUFFER,
            &uniform_buffer,
        );

        let pipeline_layout = create_pipeline_layout(device, &[descriptor_set_layout], &[])?;

        let vertex_layout = VertexLayout::default()
            .add_binding(0, mem::size_of::<Vertex>() as u32)
            .add_attribute(0, 0, vk::Format::R32G32B32_SFLOAT, 0)
            .add_attribute(0, 1, vk::Format::R32G32B32_SFLOAT, 12);

        let vertex_shader = create_shader_module(device, "shaders/color.vert.spv")?;
        let fragment_shader = create_shader_module(device, "shaders/color.frag.spv")?;
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
            angle: 0.0,
        })
    }
}

impl Scene for Cube {
    fn update(&mut self, renderer: &mut Renderer, delta: f32) -> RendererResult<()> {
        self.angle += delta;

        let extent = renderer.extent();
        let aspect = extent.width as f32 / extent.height as f32;
        let projection = projection::perspective_vk(60f32.to_radians(), aspect, 0.1, 10.0);
        let view = Mat4::look_at(Vec3::new(1.5, 1.5, 2.5), Vec3::zero(), Vec3::unit_y());
        let model = Mat4::from_rotation_y(self.angle) * Mat4::from_rotation_x(self.angle * 0.5);

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

impl DemoScene for Cube {
    fn destroy(mut self, renderer: &mut Renderer) {
        let device = renderer.device();
        unsafe {
            device.destroy_pipeline(self.pipeline, None);
            device.destroy_pipeline_layout(self.pipeline_layout, None);
            device.destroy_descriptor_pool(self.descriptor_pool, None);
            device.destroy_descriptor_set_layout(self.descriptor_set_layout, None);
        }
        let allocator = renderer.allocator();
        allocator.destroy_buffer(self.uniform_buffer);
        allocator.destroy_buffer(self.index_buffer);
        allocator.destroy_buffer(self.vertex_buffer);
        self.target.destroy(renderer);
    }
}

fn main() -> Result<(), Box<dyn Error>> {
    run_demo("cube", Cube::new)
}
