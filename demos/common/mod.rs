#![allow(dead_code)]

use ash::vk;
use prism_renderer::renderer::pipeline::{
    create_framebuffers, create_render_pass, RenderPassLayout,
};
use prism_renderer::{Buffer, RenderWindow, Renderer, RendererResult, Scene, DEPTH_FORMAT};
use raw_window_handle::{
    HasRawDisplayHandle, HasRawWindowHandle, RawDisplayHandle, RawWindowHandle,
};
use std::error::Error;
use std::mem;
use winit::{
    dpi::PhysicalSize,
    event::{Event, WindowEvent},
    event_loop::{ControlFlow, EventLoop},
    window::{Window, WindowBuilder},
};

/// A scene that also knows how to release its GPU objects.
pub trait DemoScene: Scene + Sized + 'static {
    fn destroy(self, renderer: &mut Renderer);
}

/// Winit window wrapper satisfying the renderer's window contract.
pub struct DemoWindow {
    window: Window,
    title: String,
}

impl DemoWindow {
    pub fn request_redraw(&self) {
        self.window.request_redraw();
    }
}

unsafe impl HasRawWindowHandle for DemoWindow {
    fn raw_window_handle(&self) -> RawWindowHandle {
        self.window.raw_window_handle()
    }
}

unsafe impl HasRawDisplayHandle for DemoWindow {
    fn raw_display_handle(&self) -> RawDisplayHandle {
        self.window.raw_display_handle()
    }
}

impl RenderWindow for DemoWindow {
    fn width(&self) -> u32 {
        self.window.inner_size().width
    }

    fn height(&self) -> u32 {
        self.window.inner_size().height
    }

    fn title(&self) -> &str {
        &self.title
    }
}

/// Opens a window, builds a renderer and a scene, then drives the frame
/// loop until the window is closed.
pub fn run_demo<S, F>(title: &str, create: F) -> Result<(), Box<dyn Error>>
where
    S: DemoScene,
    F: FnOnce(&mut Renderer) -> Result<S, Box<dyn Error>>,
{
    simple_logger::SimpleLogger::new().env().init()?;

    let event_loop = EventLoop::new()?;
    let window = WindowBuilder::new()
        .with_title(title)
        .with_inner_size(PhysicalSize::new(1024u32, 768))
        .build(&event_loop)?;
    let window = DemoWindow {
        window,
        title: title.to_owned(),
    };

    let mut renderer = Renderer::new(&window)?;
    let mut scene = Some(create(&mut renderer)?);
    let mut renderer = Some(renderer);

    event_loop.run(move |event, elwt| {
        elwt.set_control_flow(ControlFlow::Poll);
        match event {
            Event::WindowEvent {
                event: WindowEvent::CloseRequested,
                ..
            } => elwt.exit(),
            Event::WindowEvent {
                event: WindowEvent::RedrawRequested,
                ..
            } => {
                if let (Some(renderer), Some(scene)) = (renderer.as_mut(), scene.as_mut()) {
                    if let Err(error) = renderer.run_frame(scene) {
                        log::error!("Frame failed: {error}");
                        elwt.exit();
                    }
                }
            }
            Event::AboutToWait => window.request_redraw(),
            Event::LoopExiting => {
                // Scene resources must go before the renderer they were
                // allocated from.
                if let Some(renderer) = renderer.as_mut() {
                    if let Err(error) = renderer.wait_idle() {
                        log::error!("Wait idle failed: {error}");
                    }
                    if let Some(scene) = scene.take() {
                        scene.destroy(renderer);
                    }
                }
                renderer.take();
            }
            _ => (),
        }
    })?;

    Ok(())
}

/// Render pass and framebuffers targeting the swapchain plus the renderer's
/// depth buffer.
pub struct RenderTarget {
    pub render_pass: vk::RenderPass,
    pub framebuffers: Vec<vk::Framebuffer>,
}

impl RenderTarget {
    pub fn new(renderer: &Renderer) -> RendererResult<Self> {
        let layout = RenderPassLayout::default()
            .add_color_attachment(renderer.swapchain().format, vk::ImageLayout::PRESENT_SRC_KHR)
            .add_depth_attachment(DEPTH_FORMAT);
        let render_pass = create_render_pass(renderer.device(), &layout)?;
        let framebuffers = Self::build_framebuffers(renderer, render_pass)?;
        Ok(Self {
            render_pass,
            framebuffers,
        })
    }

    /// Replaces the framebuffers after a swapchain rebuild. The render pass
    /// is format-compatible and survives.
    pub fn rebuild(&mut self, renderer: &Renderer) -> RendererResult<()> {
        self.destroy_framebuffers(renderer);
        self.framebuffers = Self::build_framebuffers(renderer, self.render_pass)?;
        Ok(())
    }

    pub fn destroy(&mut self, renderer: &Renderer) {
        self.destroy_framebuffers(renderer);
        unsafe { renderer.device().destroy_render_pass(self.render_pass, None) };
    }

    fn build_framebuffers(
        renderer: &Renderer,
        render_pass: vk::RenderPass,
    ) -> RendererResult<Vec<vk::Framebuffer>> {
        let framebuffers = create_framebuffers(
            renderer.device(),
            render_pass,
            renderer.extent(),
            renderer.swapchain().image_views(),
            Some(renderer.depth_view()),
        )?;
        Ok(framebuffers)
    }

    fn destroy_framebuffers(&mut self, renderer: &Renderer) {
        for framebuffer in self.framebuffers.drain(..) {
            unsafe { renderer.device().destroy_framebuffer(framebuffer, None) };
        }
    }
}

/// Uploads `data` into a device-local buffer through a staging copy on the
/// transfer queue.
pub fn upload_buffer<T: Copy>(
    renderer: &Renderer,
    data: &[T],
    usage: vk::BufferUsageFlags,
) -> RendererResult<Buffer> {
    let size = mem::size_of_val(data) as vk::DeviceSize;
    let allocator = renderer.allocator();

    let staging = allocator.create_buffer(
        size,
        vk::BufferUsageFlags::TRANSFER_SRC,
        vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
    )?;
    allocator.write_resource(&staging, data)?;

    let buffer = allocator.create_buffer(
        size,
        usage | vk::BufferUsageFlags::TRANSFER_DST,
        vk::MemoryPropertyFlags::DEVICE_LOCAL,
    )?;

    renderer.with_sync_transfer(|command_buffer| {
        renderer.cmd_copy_buffer(command_buffer, &staging, &buffer);
        Ok(())
    })?;

    allocator.destroy_buffer(staging);
    Ok(buffer)
}

/// Creates a host-visible uniform buffer sized for one `T`.
pub fn create_uniform_buffer<T: Copy>(renderer: &Renderer) -> RendererResult<Buffer> {
    let buffer = renderer.allocator().create_buffer(
        mem::size_of::<T>() as vk::DeviceSize,
        vk::BufferUsageFlags::UNIFORM_BUFFER,
        vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
    )?;
    Ok(buffer)
}
