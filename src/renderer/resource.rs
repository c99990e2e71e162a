//! Buffer and image allocation.
//!
//! The allocator owns a handle to the logical device and the memory
//! properties of the physical device it was created from. Every resource is
//! backed by a dedicated `vk::DeviceMemory` allocation; there is no
//! sub-allocation.

use crate::error::{RendererError, RendererResult};
use ash::{util::Align, vk, Device};
use std::mem;

const CUBE_LAYERS: u32 = 6;

/// Returns the lowest memory type index acceptable to `requirements` whose
/// property flags contain all of `required_properties`.
pub fn find_memory_type_index(
    requirements: &vk::MemoryRequirements,
    memory_properties: &vk::PhysicalDeviceMemoryProperties,
    required_properties: vk::MemoryPropertyFlags,
) -> RendererResult<u32> {
    for index in 0..memory_properties.memory_type_count {
        let supported = requirements.memory_type_bits & (1 << index) != 0;
        let sufficient = memory_properties.memory_types[index as usize]
            .property_flags
            .contains(required_properties);
        if supported && sufficient {
            return Ok(index);
        }
    }
    Err(RendererError::NoCompatibleMemoryType)
}

/// Common surface of allocated resources: the bound memory and the logical
/// byte size host writes operate on.
pub trait GpuResource {
    fn memory(&self) -> vk::DeviceMemory;
    fn logical_size(&self) -> vk::DeviceSize;
}

/// A buffer bound to its own device memory allocation.
pub struct Buffer {
    pub buffer: vk::Buffer,
    pub size: vk::DeviceSize,
    pub requirements: vk::MemoryRequirements,
    memory: vk::DeviceMemory,
}

impl GpuResource for Buffer {
    fn memory(&self) -> vk::DeviceMemory {
        self.memory
    }

    fn logical_size(&self) -> vk::DeviceSize {
        self.size
    }
}

/// An image bound to its own device memory allocation.
///
/// The image remembers the layout it was last transitioned to, so barriers
/// built with [`Image::layout_barrier`] always carry the correct
/// `old_layout`.
pub struct Image {
    pub image: vk::Image,
    pub size: vk::DeviceSize,
    pub requirements: vk::MemoryRequirements,
    pub width: u32,
    pub height: u32,
    pub channels: u32,
    pub format: vk::Format,
    memory: vk::DeviceMemory,
    layout: vk::ImageLayout,
}

impl GpuResource for Image {
    fn memory(&self) -> vk::DeviceMemory {
        self.memory
    }

    fn logical_size(&self) -> vk::DeviceSize {
        self.size
    }
}

impl Image {
    pub fn layout(&self) -> vk::ImageLayout {
        self.layout
    }

    /// Builds a barrier moving the whole image from its tracked layout to
    /// `new_layout`, and records `new_layout` as the tracked layout.
    pub fn layout_barrier(
        &mut self,
        src_access: vk::AccessFlags,
        dst_access: vk::AccessFlags,
        new_layout: vk::ImageLayout,
        aspects: vk::ImageAspectFlags,
    ) -> vk::ImageMemoryBarrier {
        let barrier = self.layer_barrier(src_access, dst_access, new_layout, aspects, 0, 1);
        self.layout = new_layout;
        barrier
    }

    /// Cube map variant of [`Image::layout_barrier`]: one barrier per face
    /// layer.
    pub fn cube_layout_barriers(
        &mut self,
        src_access: vk::AccessFlags,
        dst_access: vk::AccessFlags,
        new_layout: vk::ImageLayout,
        aspects: vk::ImageAspectFlags,
    ) -> Vec<vk::ImageMemoryBarrier> {
        let barriers = (0..CUBE_LAYERS)
            .map(|layer| self.layer_barrier(src_access, dst_access, new_layout, aspects, layer, 1))
            .collect();
        self.layout = new_layout;
        barriers
    }

    fn layer_barrier(
        &self,
        src_access: vk::AccessFlags,
        dst_access: vk::AccessFlags,
        new_layout: vk::ImageLayout,
        aspects: vk::ImageAspectFlags,
        base_array_layer: u32,
        layer_count: u32,
    ) -> vk::ImageMemoryBarrier {
        vk::ImageMemoryBarrier::builder()
            .src_access_mask(src_access)
            .dst_access_mask(dst_access)
            .old_layout(self.layout)
            .new_layout(new_layout)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .image(self.image)
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: aspects,
                base_mip_level: 0,
                level_count: 1,
                base_array_layer,
                layer_count,
            })
            .build()
    }
}

/// Allocates, writes and frees device resources.
pub struct ResourceAllocator {
    device: Device,
    memory_properties: vk::PhysicalDeviceMemoryProperties,
}

impl ResourceAllocator {
    pub(crate) fn new(
        device: Device,
        memory_properties: vk::PhysicalDeviceMemoryProperties,
    ) -> Self {
        Self {
            device,
            memory_properties,
        }
    }

    /// Creates a buffer and binds it to a fresh memory allocation.
    pub fn create_buffer(
        &self,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        memory_flags: vk::MemoryPropertyFlags,
    ) -> RendererResult<Buffer> {
        log::debug!("Creating buffer of {size} bytes");

        let create_info = vk::BufferCreateInfo::builder()
            .size(size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        let buffer = unsafe { self.device.create_buffer(&create_info, None)? };

        let requirements = unsafe { self.device.get_buffer_memory_requirements(buffer) };
        let memory = self.allocate(&requirements, memory_flags)?;
        unsafe { self.device.bind_buffer_memory(buffer, memory, 0)? };

        Ok(Buffer {
            buffer,
            size,
            requirements,
            memory,
        })
    }

    /// Creates a 2D image and binds it to a fresh memory allocation.
    ///
    /// The image starts in `PREINITIALIZED` layout with optimal tiling; move
    /// it where it belongs with a layout barrier before first use.
    pub fn create_image_2d(
        &self,
        width: u32,
        height: u32,
        channels: u32,
        usage: vk::ImageUsageFlags,
        format: vk::Format,
        memory_flags: vk::MemoryPropertyFlags,
    ) -> RendererResult<Image> {
        self.create_image(width, height, channels, usage, format, memory_flags, false)
    }

    /// Cube map variant of [`ResourceAllocator::create_image_2d`]: six
    /// square layers of side `length`, flagged cube-compatible.
    pub fn create_image_cube(
        &self,
        length: u32,
        channels: u32,
        usage: vk::ImageUsageFlags,
        format: vk::Format,
        memory_flags: vk::MemoryPropertyFlags,
    ) -> RendererResult<Image> {
        self.create_image(length, length, channels, usage, format, memory_flags, true)
    }

    #[allow(clippy::too_many_arguments)]
    fn create_image(
        &self,
        width: u32,
        height: u32,
        channels: u32,
        usage: vk::ImageUsageFlags,
        format: vk::Format,
        memory_flags: vk::MemoryPropertyFlags,
        cube: bool,
    ) -> RendererResult<Image> {
        log::debug!("Creating {width}x{height} image (cube: {cube})");

        let (layers, flags) = if cube {
            (CUBE_LAYERS, vk::ImageCreateFlags::CUBE_COMPATIBLE)
        } else {
            (1, vk::ImageCreateFlags::empty())
        };

        let create_info = vk::ImageCreateInfo::builder()
            .flags(flags)
            .image_type(vk::ImageType::TYPE_2D)
            .format(format)
            .extent(vk::Extent3D {
                width,
                height,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(layers)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::PREINITIALIZED);
        let image = unsafe { self.device.create_image(&create_info, None)? };

        let requirements = unsafe { self.device.get_image_memory_requirements(image) };
        let memory = self.allocate(&requirements, memory_flags)?;
        unsafe { self.device.bind_image_memory(image, memory, 0)? };

        let size =
            u64::from(width) * u64::from(height) * u64::from(channels) * u64::from(layers);
        Ok(Image {
            image,
            size,
            requirements,
            width,
            height,
            channels,
            format,
            memory,
            layout: vk::ImageLayout::PREINITIALIZED,
        })
    }

    /// Creates a plain 2D view covering the whole image.
    pub fn create_image_view_2d(
        &self,
        image: &Image,
        aspects: vk::ImageAspectFlags,
    ) -> RendererResult<vk::ImageView> {
        self.create_image_view(image, vk::ImageViewType::TYPE_2D, aspects)
    }

    /// Creates a cube view covering all six faces.
    pub fn create_image_view_cube(
        &self,
        image: &Image,
        aspects: vk::ImageAspectFlags,
    ) -> RendererResult<vk::ImageView> {
        self.create_image_view(image, vk::ImageViewType::CUBE, aspects)
    }

    fn create_image_view(
        &self,
        image: &Image,
        view_type: vk::ImageViewType,
        aspects: vk::ImageAspectFlags,
    ) -> RendererResult<vk::ImageView> {
        let create_info = vk::ImageViewCreateInfo::builder()
            .image(image.image)
            .view_type(view_type)
            .format(image.format)
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: aspects,
                base_mip_level: 0,
                level_count: vk::REMAINING_MIP_LEVELS,
                base_array_layer: 0,
                layer_count: vk::REMAINING_ARRAY_LAYERS,
            });
        let view = unsafe { self.device.create_image_view(&create_info, None)? };
        Ok(view)
    }

    /// Copies `data` into the resource's memory through a persistent-free
    /// map/copy/unmap. The resource must live in host-visible memory and
    /// `data` must span exactly its logical size.
    pub fn write_resource<R: GpuResource, T: Copy>(
        &self,
        resource: &R,
        data: &[T],
    ) -> RendererResult<()> {
        let size = resource.logical_size();
        unsafe {
            let pointer = self.device.map_memory(
                resource.memory(),
                0,
                size,
                vk::MemoryMapFlags::empty(),
            )?;
            let mut align = Align::new(pointer, mem::align_of::<T>() as _, size);
            align.copy_from_slice(data);
            self.device.unmap_memory(resource.memory());
        }
        Ok(())
    }

    pub fn destroy_buffer(&self, buffer: Buffer) {
        unsafe {
            self.device.destroy_buffer(buffer.buffer, None);
            self.device.free_memory(buffer.memory, None);
        }
    }

    pub fn destroy_image(&self, image: Image) {
        unsafe {
            self.device.destroy_image(image.image, None);
            self.device.free_memory(image.memory, None);
        }
    }

    fn allocate(
        &self,
        requirements: &vk::MemoryRequirements,
        memory_flags: vk::MemoryPropertyFlags,
    ) -> RendererResult<vk::DeviceMemory> {
        let memory_type_index =
            find_memory_type_index(requirements, &self.memory_properties, memory_flags)?;
        let allocate_info = vk::MemoryAllocateInfo::builder()
            .allocation_size(requirements.size)
            .memory_type_index(memory_type_index);
        let memory = unsafe { self.device.allocate_memory(&allocate_info, None)? };
        Ok(memory)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory_properties(
        type_flags: &[vk::MemoryPropertyFlags],
    ) -> vk::PhysicalDeviceMemoryProperties {
        let mut properties = vk::PhysicalDeviceMemoryProperties {
            memory_type_count: type_flags.len() as u32,
            ..Default::default()
        };
        for (index, flags) in type_flags.iter().enumerate() {
            properties.memory_types[index].property_flags = *flags;
        }
        properties
    }

    fn requirements(memory_type_bits: u32) -> vk::MemoryRequirements {
        vk::MemoryRequirements {
            size: 1024,
            alignment: 256,
            memory_type_bits,
        }
    }

    #[test]
    fn lowest_acceptable_memory_type_wins() {
        let properties = memory_properties(&[
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        ]);

        let index = find_memory_type_index(
            &requirements(0b111),
            &properties,
            vk::MemoryPropertyFlags::HOST_VISIBLE,
        )
        .unwrap();
        assert_eq!(index, 1);
    }

    #[test]
    fn memory_type_bits_filter_candidates() {
        let properties = memory_properties(&[
            vk::MemoryPropertyFlags::HOST_VISIBLE,
            vk::MemoryPropertyFlags::HOST_VISIBLE,
        ]);

        // Only type 1 is allowed by the requirements mask.
        let index = find_memory_type_index(
            &requirements(0b10),
            &properties,
            vk::MemoryPropertyFlags::HOST_VISIBLE,
        )
        .unwrap();
        assert_eq!(index, 1);
    }

    #[test]
    fn superset_of_required_flags_is_acceptable() {
        let properties = memory_properties(&[vk::MemoryPropertyFlags::HOST_VISIBLE
            | vk::MemoryPropertyFlags::HOST_COHERENT
            | vk::MemoryPropertyFlags::HOST_CACHED]);

        let index = find_memory_type_index(
            &requirements(0b1),
            &properties,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        )
        .unwrap();
        assert_eq!(index, 0);
    }

    #[test]
    fn no_match_is_an_error() {
        let properties = memory_properties(&[vk::MemoryPropertyFlags::DEVICE_LOCAL]);

        let result = find_memory_type_index(
            &requirements(0b1),
            &properties,
            vk::MemoryPropertyFlags::HOST_VISIBLE,
        );
        assert!(matches!(result, Err(RendererError::NoCompatibleMemoryType)));
    }

    fn test_image() -> Image {
        Image {
            image: vk::Image::null(),
            size: 64 * 64 * 4,
            requirements: requirements(0b1),
            width: 64,
            height: 64,
            channels: 4,
            format: vk::Format::R8G8B8A8_UNORM,
            memory: vk::DeviceMemory::null(),
            layout: vk::ImageLayout::PREINITIALIZED,
        }
    }

    #[test]
    fn barriers_chain_from_the_tracked_layout() {
        let mut image = test_image();

        let first = image.layout_barrier(
            vk::AccessFlags::empty(),
            vk::AccessFlags::TRANSFER_WRITE,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            vk::ImageAspectFlags::COLOR,
        );
        assert_eq!(first.old_layout, vk::ImageLayout::PREINITIALIZED);
        assert_eq!(first.new_layout, vk::ImageLayout::TRANSFER_DST_OPTIMAL);

        let second = image.layout_barrier(
            vk::AccessFlags::TRANSFER_WRITE,
            vk::AccessFlags::SHADER_READ,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            vk::ImageAspectFlags::COLOR,
        );
        assert_eq!(second.old_layout, vk::ImageLayout::TRANSFER_DST_OPTIMAL);
        assert_eq!(image.layout(), vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
    }

    #[test]
    fn cube_barriers_cover_each_face_once() {
        let mut image = test_image();

        let barriers = image.cube_layout_barriers(
            vk::AccessFlags::empty(),
            vk::AccessFlags::TRANSFER_WRITE,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            vk::ImageAspectFlags::COLOR,
        );

        assert_eq!(barriers.len(), 6);
        for (layer, barrier) in barriers.iter().enumerate() {
            assert_eq!(barrier.subresource_range.base_array_layer, layer as u32);
            assert_eq!(barrier.subresource_range.layer_count, 1);
            assert_eq!(barrier.old_layout, vk::ImageLayout::PREINITIALIZED);
        }
        assert_eq!(image.layout(), vk::ImageLayout::TRANSFER_DST_OPTIMAL);
    }
}
