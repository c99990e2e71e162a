//! Renderer lifecycle: instance, surface, devices, swapchain, per-frame
//! submission and teardown.

mod device;
mod extensions;
mod frame;
pub mod pipeline;
mod resource;
mod swapchain;

pub use device::RenderDevice;
pub use extensions::{ExtensionChain, InstanceExtension};
pub use frame::{FrameDraw, FrameStatus};
pub use resource::{find_memory_type_index, Buffer, GpuResource, Image, ResourceAllocator};
pub use swapchain::Swapchain;

use crate::error::{RendererError, RendererResult};
use crate::timer::Timer;
use crate::window::RenderWindow;
use ash::{
    extensions::khr::{Surface, Swapchain as SwapchainLoader},
    vk, Device, Entry, Instance,
};
use frame::{Acquire, FrameBackend, FrameProtocol, Present};
use std::ffi::{CStr, CString};
use std::os::raw::c_char;

/// Format of the depth attachment owned by the renderer.
pub const DEPTH_FORMAT: vk::Format = vk::Format::D32_SFLOAT;

const VALIDATION_LAYER: &CStr =
    unsafe { CStr::from_bytes_with_nul_unchecked(b"VK_LAYER_KHRONOS_validation\0") };

/// Application-side hooks driven by [`Renderer::run_frame`].
pub trait Scene {
    /// Advances the simulation by `delta` seconds and refreshes any
    /// per-frame GPU data.
    fn update(&mut self, renderer: &mut Renderer, delta: f32) -> RendererResult<()>;

    /// Returns the draw parameters for the current frame.
    fn frame(&self) -> FrameDraw<'_>;

    /// Rebuilds size-dependent objects after a swapchain recreation.
    fn swapchain_rebuilt(&mut self, renderer: &mut Renderer) -> RendererResult<()>;
}

/// Owner of the device, swapchain and frame loop state.
pub struct Renderer {
    _entry: Entry,
    instance: Instance,
    surface: Surface,
    surface_khr: vk::SurfaceKHR,
    devices: Vec<RenderDevice>,
    selected: usize,
    allocator: ResourceAllocator,
    graphics_command_pool: vk::CommandPool,
    transfer_command_pool: vk::CommandPool,
    graphics_command_buffer: vk::CommandBuffer,
    transfer_command_buffer: vk::CommandBuffer,
    swapchain: Swapchain,
    depth_image: Option<Image>,
    depth_image_view: vk::ImageView,
    image_acquired_semaphore: vk::Semaphore,
    render_finished_semaphore: vk::Semaphore,
    frame_fence: vk::Fence,
    protocol: FrameProtocol,
    timer: Timer,
    fallback_extent: vk::Extent2D,
}

impl Renderer {
    /// Brings up the full stack against `window`: instance, surface, one
    /// logical device per capable adapter, command pools, swapchain, depth
    /// buffer and frame synchronization objects.
    pub fn new<W: RenderWindow>(window: &W) -> RendererResult<Self> {
        log::debug!("Creating renderer");

        let entry = unsafe { Entry::load()? };
        let instance = create_instance(&entry, window)?;

        let surface = Surface::new(&entry, &instance);
        let surface_khr = unsafe {
            ash_window::create_surface(
                &entry,
                &instance,
                window.raw_display_handle(),
                window.raw_window_handle(),
                None,
            )?
        };

        let devices = device::enumerate_render_devices(&instance, &surface, surface_khr)?;
        let device_types: Vec<_> = devices
            .iter()
            .map(|device| device.properties.device_type)
            .collect();
        let selected = device::best_device_index(&device_types);
        log::debug!("Selected device: {}", devices[selected].name());

        let allocator = ResourceAllocator::new(
            devices[selected].device.clone(),
            devices[selected].memory_properties,
        );

        let (graphics_command_pool, graphics_command_buffer) = create_command_pool_and_buffer(
            &devices[selected].device,
            devices[selected].graphics_queue_index,
        )?;
        let (transfer_command_pool, transfer_command_buffer) = create_command_pool_and_buffer(
            &devices[selected].device,
            devices[selected].transfer_queue_index,
        )?;

        let fallback_extent = vk::Extent2D {
            width: window.width(),
            height: window.height(),
        };
        let surface_format = devices[selected].surface_formats[0];
        let swapchain_loader = SwapchainLoader::new(&instance, &devices[selected].device);
        let swapchain = Swapchain::new(
            swapchain_loader,
            &devices[selected].device,
            surface_khr,
            &devices[selected].surface_capabilities,
            surface_format,
            fallback_extent,
        )?;

        let (depth_image, depth_image_view) =
            create_depth_resources(&allocator, swapchain.extent)?;

        let device = &devices[selected].device;
        let semaphore_info = vk::SemaphoreCreateInfo::builder();
        let image_acquired_semaphore = unsafe { device.create_semaphore(&semaphore_info, None)? };
        let render_finished_semaphore = unsafe { device.create_semaphore(&semaphore_info, None)? };
        // The fence starts unsignalled: it is only waited on after the frame
        // that signals it has been submitted.
        let fence_info = vk::FenceCreateInfo::builder();
        let frame_fence = unsafe { device.create_fence(&fence_info, None)? };

        Ok(Self {
            _entry: entry,
            instance,
            surface,
            surface_khr,
            devices,
            selected,
            allocator,
            graphics_command_pool,
            transfer_command_pool,
            graphics_command_buffer,
            transfer_command_buffer,
            swapchain,
            depth_image: Some(depth_image),
            depth_image_view,
            image_acquired_semaphore,
            render_finished_semaphore,
            frame_fence,
            protocol: FrameProtocol::default(),
            timer: Timer::start(),
            fallback_extent,
        })
    }

    /// The logical device of the selected adapter.
    pub fn device(&self) -> &Device {
        &self.devices[self.selected].device
    }

    /// The selected adapter and its capability snapshot.
    pub fn render_device(&self) -> &RenderDevice {
        &self.devices[self.selected]
    }

    pub fn allocator(&self) -> &ResourceAllocator {
        &self.allocator
    }

    pub fn swapchain(&self) -> &Swapchain {
        &self.swapchain
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.swapchain.extent
    }

    pub fn depth_view(&self) -> vk::ImageView {
        self.depth_image_view
    }

    pub fn graphics_queue(&self) -> vk::Queue {
        self.devices[self.selected].graphics_queue
    }

    pub fn transfer_queue(&self) -> vk::Queue {
        self.devices[self.selected].transfer_queue
    }

    /// Blocks until the device has finished all submitted work.
    pub fn wait_idle(&self) -> RendererResult<()> {
        unsafe { self.device().device_wait_idle()? };
        Ok(())
    }

    /// Runs one frame of `scene`: update with the elapsed delta, render, and
    /// on a stale surface rebuild the swapchain and notify the scene.
    pub fn run_frame<S: Scene>(&mut self, scene: &mut S) -> RendererResult<()> {
        let delta = self.timer.tick();
        scene.update(self, delta)?;

        let draw = scene.frame();
        let status = self.render_frame(&draw)?;

        match status {
            FrameStatus::Presented => Ok(()),
            FrameStatus::SurfaceStale => {
                self.recreate_swapchain()?;
                scene.swapchain_rebuilt(self)
            }
        }
    }

    /// Renders and presents one frame described by `draw`.
    ///
    /// A [`FrameStatus::SurfaceStale`] result means nothing further can be
    /// rendered until [`Renderer::recreate_swapchain`] has run.
    pub fn render_frame(&mut self, draw: &FrameDraw) -> RendererResult<FrameStatus> {
        let selected = &self.devices[self.selected];
        let mut backend = CoreFrame {
            device: &selected.device,
            swapchain: &self.swapchain,
            graphics_queue: selected.graphics_queue,
            command_buffer: self.graphics_command_buffer,
            image_acquired: self.image_acquired_semaphore,
            render_finished: self.render_finished_semaphore,
            fence: self.frame_fence,
            draw,
        };

        let mut protocol = self.protocol;
        let status = protocol.run(&mut backend);
        self.protocol = protocol;
        status
    }

    /// Rebuilds the swapchain and depth buffer against the current surface
    /// state. Waits for the device to go idle first.
    pub fn recreate_swapchain(&mut self) -> RendererResult<()> {
        log::debug!("Recreating swapchain");

        let device = self.devices[self.selected].device.clone();
        unsafe { device.device_wait_idle()? };

        let capabilities = unsafe {
            self.surface.get_physical_device_surface_capabilities(
                self.devices[self.selected].physical_device,
                self.surface_khr,
            )?
        };
        self.devices[self.selected].surface_capabilities = capabilities;

        self.swapchain
            .recreate(&device, self.surface_khr, &capabilities, self.fallback_extent)?;

        unsafe { device.destroy_image_view(self.depth_image_view, None) };
        if let Some(image) = self.depth_image.take() {
            self.allocator.destroy_image(image);
        }
        let (depth_image, depth_image_view) =
            create_depth_resources(&self.allocator, self.swapchain.extent)?;
        self.depth_image = Some(depth_image);
        self.depth_image_view = depth_image_view;

        Ok(())
    }

    /// Records transfer commands through `record`, submits them on the
    /// transfer queue and waits for the queue to go idle before returning.
    pub fn with_sync_transfer<R, F>(&self, record: F) -> RendererResult<R>
    where
        F: FnOnce(vk::CommandBuffer) -> RendererResult<R>,
    {
        let device = self.device();
        let command_buffer = self.transfer_command_buffer;

        let begin_info = vk::CommandBufferBeginInfo::builder()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        unsafe { device.begin_command_buffer(command_buffer, &begin_info)? };
        let recorded = record(command_buffer);
        unsafe { device.end_command_buffer(command_buffer)? };

        // Nothing was submitted if recording failed; the queue is idle.
        let value = recorded?;

        let command_buffers = [command_buffer];
        let submit_info = vk::SubmitInfo::builder()
            .command_buffers(&command_buffers)
            .build();
        let queue = self.transfer_queue();
        let submitted = unsafe { device.queue_submit(queue, &[submit_info], vk::Fence::null()) };
        let idled = unsafe { device.queue_wait_idle(queue) };
        submitted?;
        idled?;

        Ok(value)
    }

    /// Records a whole-image layout transition, updating the image's tracked
    /// layout.
    #[allow(clippy::too_many_arguments)]
    pub fn cmd_change_image_layout(
        &self,
        command_buffer: vk::CommandBuffer,
        image: &mut Image,
        src_access: vk::AccessFlags,
        dst_access: vk::AccessFlags,
        src_stage: vk::PipelineStageFlags,
        dst_stage: vk::PipelineStageFlags,
        new_layout: vk::ImageLayout,
        aspects: vk::ImageAspectFlags,
    ) {
        let barrier = image.layout_barrier(src_access, dst_access, new_layout, aspects);
        unsafe {
            self.device().cmd_pipeline_barrier(
                command_buffer,
                src_stage,
                dst_stage,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[barrier],
            )
        };
    }

    /// Cube map variant of [`Renderer::cmd_change_image_layout`].
    #[allow(clippy::too_many_arguments)]
    pub fn cmd_change_cube_image_layout(
        &self,
        command_buffer: vk::CommandBuffer,
        image: &mut Image,
        src_access: vk::AccessFlags,
        dst_access: vk::AccessFlags,
        src_stage: vk::PipelineStageFlags,
        dst_stage: vk::PipelineStageFlags,
        new_layout: vk::ImageLayout,
        aspects: vk::ImageAspectFlags,
    ) {
        let barriers = image.cube_layout_barriers(src_access, dst_access, new_layout, aspects);
        unsafe {
            self.device().cmd_pipeline_barrier(
                command_buffer,
                src_stage,
                dst_stage,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &barriers,
            )
        };
    }

    /// Records a full copy from `src` into `dst`.
    pub fn cmd_copy_buffer(&self, command_buffer: vk::CommandBuffer, src: &Buffer, dst: &Buffer) {
        let region = vk::BufferCopy {
            src_offset: 0,
            dst_offset: 0,
            size: src.size.min(dst.size),
        };
        unsafe {
            self.device()
                .cmd_copy_buffer(command_buffer, src.buffer, dst.buffer, &[region])
        };
    }

    /// Records a copy of tightly packed texels from `src` into `dst`, which
    /// must already be in its transfer destination layout.
    pub fn cmd_copy_buffer_to_image(
        &self,
        command_buffer: vk::CommandBuffer,
        src: &Buffer,
        dst: &Image,
        aspects: vk::ImageAspectFlags,
    ) {
        let region = buffer_image_copy(dst, aspects, 0, 0);
        unsafe {
            self.device().cmd_copy_buffer_to_image(
                command_buffer,
                src.buffer,
                dst.image,
                dst.layout(),
                &[region],
            )
        };
    }

    /// Cube map variant of [`Renderer::cmd_copy_buffer_to_image`]: `src`
    /// holds the six faces back to back.
    pub fn cmd_copy_buffer_to_cube_image(
        &self,
        command_buffer: vk::CommandBuffer,
        src: &Buffer,
        dst: &Image,
        aspects: vk::ImageAspectFlags,
    ) {
        let face_size =
            u64::from(dst.width) * u64::from(dst.height) * u64::from(dst.channels);
        let regions: Vec<_> = (0..6)
            .map(|face| buffer_image_copy(dst, aspects, face, u64::from(face) * face_size))
            .collect();
        unsafe {
            self.device().cmd_copy_buffer_to_image(
                command_buffer,
                src.buffer,
                dst.image,
                dst.layout(),
                &regions,
            )
        };
    }
}

impl Drop for Renderer {
    fn drop(&mut self) {
        log::debug!("Destroying renderer");
        unsafe {
            let device = &self.devices[self.selected].device;
            let _ = device.device_wait_idle();

            device.destroy_fence(self.frame_fence, None);
            device.destroy_semaphore(self.render_finished_semaphore, None);
            device.destroy_semaphore(self.image_acquired_semaphore, None);

            device.destroy_image_view(self.depth_image_view, None);
            if let Some(image) = self.depth_image.take() {
                self.allocator.destroy_image(image);
            }

            self.swapchain.destroy(device);

            device.free_command_buffers(
                self.transfer_command_pool,
                &[self.transfer_command_buffer],
            );
            device.free_command_buffers(
                self.graphics_command_pool,
                &[self.graphics_command_buffer],
            );
            device.destroy_command_pool(self.transfer_command_pool, None);
            device.destroy_command_pool(self.graphics_command_pool, None);

            for render_device in &self.devices {
                render_device.device.destroy_device(None);
            }
            self.surface.destroy_surface(self.surface_khr, None);
            self.instance.destroy_instance(None);
        }
    }
}

fn create_instance<W: RenderWindow>(entry: &Entry, window: &W) -> RendererResult<Instance> {
    let app_name = CString::new(window.title())
        .map_err(|error| RendererError::Init(error.to_string()))?;
    let app_info = vk::ApplicationInfo::builder()
        .application_name(app_name.as_c_str())
        .application_version(vk::make_api_version(0, 0, 1, 0))
        .api_version(vk::API_VERSION_1_2);

    let mut extension_names =
        ash_window::enumerate_required_extensions(window.raw_display_handle())?.to_vec();
    let mut layer_names: Vec<*const c_char> = Vec::new();
    let mut chain = ExtensionChain::default();

    if cfg!(debug_assertions) {
        extension_names.push(vk::KhrGetSurfaceCapabilities2Fn::name().as_ptr());
        extension_names.push(vk::ExtValidationFeaturesFn::name().as_ptr());
        layer_names.push(VALIDATION_LAYER.as_ptr());
        chain = chain.push(InstanceExtension::validation_features(vec![
            vk::ValidationFeatureEnableEXT::GPU_ASSISTED,
            vk::ValidationFeatureEnableEXT::BEST_PRACTICES,
            vk::ValidationFeatureEnableEXT::SYNCHRONIZATION_VALIDATION,
        ]));
    }

    let mut create_info = vk::InstanceCreateInfo::builder()
        .application_info(&app_info)
        .enabled_layer_names(&layer_names)
        .enabled_extension_names(&extension_names)
        .build();
    create_info.p_next = chain.head();

    let instance = unsafe { entry.create_instance(&create_info, None)? };
    Ok(instance)
}

fn create_command_pool_and_buffer(
    device: &Device,
    queue_family_index: u32,
) -> RendererResult<(vk::CommandPool, vk::CommandBuffer)> {
    let pool_info = vk::CommandPoolCreateInfo::builder()
        .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
        .queue_family_index(queue_family_index);
    let pool = unsafe { device.create_command_pool(&pool_info, None)? };

    let allocate_info = vk::CommandBufferAllocateInfo::builder()
        .command_pool(pool)
        .level(vk::CommandBufferLevel::PRIMARY)
        .command_buffer_count(1);
    let buffer = unsafe { device.allocate_command_buffers(&allocate_info)? }
        .into_iter()
        .next()
        .unwrap_or_default();

    Ok((pool, buffer))
}

fn create_depth_resources(
    allocator: &ResourceAllocator,
    extent: vk::Extent2D,
) -> RendererResult<(Image, vk::ImageView)> {
    let image = allocator.create_image_2d(
        extent.width,
        extent.height,
        4,
        vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT,
        DEPTH_FORMAT,
        vk::MemoryPropertyFlags::DEVICE_LOCAL,
    )?;
    let view = allocator.create_image_view_2d(&image, vk::ImageAspectFlags::DEPTH)?;
    Ok((image, view))
}

fn buffer_image_copy(
    image: &Image,
    aspects: vk::ImageAspectFlags,
    base_array_layer: u32,
    buffer_offset: vk::DeviceSize,
) -> vk::BufferImageCopy {
    vk::BufferImageCopy::builder()
        .buffer_offset(buffer_offset)
        .buffer_row_length(0)
        .buffer_image_height(0)
        .image_subresource(vk::ImageSubresourceLayers {
            aspect_mask: aspects,
            mip_level: 0,
            base_array_layer,
            layer_count: 1,
        })
        .image_offset(vk::Offset3D { x: 0, y: 0, z: 0 })
        .image_extent(vk::Extent3D {
            width: image.width,
            height: image.height,
            depth: 1,
        })
        .build()
}

/// Device-backed implementation of the frame protocol.
struct CoreFrame<'a> {
    device: &'a Device,
    swapchain: &'a Swapchain,
    graphics_queue: vk::Queue,
    command_buffer: vk::CommandBuffer,
    image_acquired: vk::Semaphore,
    render_finished: vk::Semaphore,
    fence: vk::Fence,
    draw: &'a FrameDraw<'a>,
}

impl FrameBackend for CoreFrame<'_> {
    fn image_count(&self) -> u32 {
        self.swapchain.image_count()
    }

    fn acquire(&mut self) -> RendererResult<Acquire> {
        let acquired = unsafe {
            self.swapchain.loader().acquire_next_image(
                self.swapchain.khr(),
                u64::MAX,
                self.image_acquired,
                vk::Fence::null(),
            )
        };
        match acquired {
            // A suboptimal image is still usable; the present result will
            // report the staleness.
            Ok((index, _suboptimal)) => Ok(Acquire::Image(index)),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(Acquire::OutOfDate),
            Err(error) => Err(error.into()),
        }
    }

    fn record_and_submit(&mut self, image_index: u32) -> RendererResult<()> {
        let device = self.device;
        let command_buffer = self.command_buffer;
        let draw = self.draw;
        let extent = self.swapchain.extent;

        let begin_info = vk::CommandBufferBeginInfo::builder();
        unsafe { device.begin_command_buffer(command_buffer, &begin_info)? };

        let clear_values = [
            vk::ClearValue {
                color: vk::ClearColorValue {
                    float32: [0.0, 0.0, 0.0, 1.0],
                },
            },
            vk::ClearValue {
                depth_stencil: vk::ClearDepthStencilValue {
                    depth: 1.0,
                    stencil: 0,
                },
            },
        ];
        let render_area = vk::Rect2D {
            offset: vk::Offset2D { x: 0, y: 0 },
            extent,
        };
        let render_pass_begin = vk::RenderPassBeginInfo::builder()
            .render_pass(draw.render_pass)
            .framebuffer(draw.framebuffers[image_index as usize])
            .render_area(render_area)
            .clear_values(&clear_values);

        unsafe {
            device.cmd_begin_render_pass(
                command_buffer,
                &render_pass_begin,
                vk::SubpassContents::INLINE,
            );
            device.cmd_bind_pipeline(
                command_buffer,
                vk::PipelineBindPoint::GRAPHICS,
                draw.pipeline,
            );
            device.cmd_bind_descriptor_sets(
                command_buffer,
                vk::PipelineBindPoint::GRAPHICS,
                draw.pipeline_layout,
                0,
                &[draw.descriptor_set],
                &[],
            );
            device.cmd_bind_vertex_buffers(command_buffer, 0, &[draw.vertex_buffer], &[0]);
            device.cmd_bind_index_buffer(command_buffer, draw.index_buffer, 0, draw.index_type);

            let viewport = vk::Viewport {
                x: 0.0,
                y: 0.0,
                width: extent.width as f32,
                height: extent.height as f32,
                min_depth: 0.0,
                max_depth: 1.0,
            };
            device.cmd_set_viewport(command_buffer, 0, &[viewport]);
            device.cmd_set_scissor(command_buffer, 0, &[render_area]);

            device.cmd_draw_indexed(command_buffer, draw.index_count, 1, 0, 0, 0);
            device.cmd_end_render_pass(command_buffer);
            device.end_command_buffer(command_buffer)?;
        }

        let wait_semaphores = [self.image_acquired];
        let wait_stages = [vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT];
        let command_buffers = [command_buffer];
        let signal_semaphores = [self.render_finished];
        let submit_info = vk::SubmitInfo::builder()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(&command_buffers)
            .signal_semaphores(&signal_semaphores)
            .build();
        unsafe { device.queue_submit(self.graphics_queue, &[submit_info], self.fence)? };

        Ok(())
    }

    fn present(&mut self, image_index: u32) -> RendererResult<Present> {
        let wait_semaphores = [self.render_finished];
        let swapchains = [self.swapchain.khr()];
        let image_indices = [image_index];
        let present_info = vk::PresentInfoKHR::builder()
            .wait_semaphores(&wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        let presented = unsafe {
            self.swapchain
                .loader()
                .queue_present(self.graphics_queue, &present_info)
        };
        match presented {
            Ok(false) => Ok(Present::Done),
            Ok(true) => Ok(Present::Stale),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(Present::Stale),
            Err(error) => Err(error.into()),
        }
    }

    fn wait_and_reset_fence(&mut self) -> RendererResult<()> {
        unsafe {
            self.device.wait_for_fences(&[self.fence], true, u64::MAX)?;
            self.device.reset_fences(&[self.fence])?;
        }
        Ok(())
    }
}
