//! Physical device enumeration, queue family selection and logical device
//! creation.

use crate::error::{RendererError, RendererResult};
use ash::{
    extensions::khr::{Surface, Swapchain as SwapchainLoader},
    vk, Device, Instance,
};
use std::ffi::CStr;

/// A physical device together with its capability snapshot and the logical
/// device and queues created from it.
pub struct RenderDevice {
    pub physical_device: vk::PhysicalDevice,
    pub properties: vk::PhysicalDeviceProperties,
    pub features: vk::PhysicalDeviceFeatures,
    pub memory_properties: vk::PhysicalDeviceMemoryProperties,
    pub queue_family_properties: Vec<vk::QueueFamilyProperties>,
    pub surface_capabilities: vk::SurfaceCapabilitiesKHR,
    pub surface_formats: Vec<vk::SurfaceFormatKHR>,
    pub device: Device,
    pub graphics_queue_index: u32,
    pub transfer_queue_index: u32,
    pub graphics_queue: vk::Queue,
    pub transfer_queue: vk::Queue,
}

impl RenderDevice {
    pub fn name(&self) -> String {
        unsafe { CStr::from_ptr(self.properties.device_name.as_ptr()) }
            .to_string_lossy()
            .into_owned()
    }
}

/// Capabilities of one queue family, decoupled from the live device so the
/// selection logic runs on plain data.
#[derive(Debug, Clone, Copy)]
pub(crate) struct QueueFamilyInfo {
    pub flags: vk::QueueFlags,
    pub queue_count: u32,
    pub supports_present: bool,
}

/// Picks the (graphics, transfer) queue family indices.
///
/// Graphics is the first family that can both draw and present. Transfer
/// prefers a dedicated DMA family (transfer without graphics or compute),
/// then a compute-only family, and falls back to sharing the graphics
/// family. Returns `None` when no family can drive the surface.
pub(crate) fn graphics_and_transfer_queue_indices(
    families: &[QueueFamilyInfo],
) -> Option<(u32, u32)> {
    let mut graphics = None;
    let mut transfer = None;
    let mut compute = None;

    for (index, family) in families.iter().enumerate() {
        let index = index as u32;

        if graphics.is_none()
            && family.supports_present
            && family.flags.contains(vk::QueueFlags::GRAPHICS)
        {
            graphics = Some(index);
        }

        let transfer_only = family.flags.contains(vk::QueueFlags::TRANSFER)
            && !family.flags.contains(vk::QueueFlags::GRAPHICS)
            && !family.flags.contains(vk::QueueFlags::COMPUTE);
        if transfer.is_none() && transfer_only {
            transfer = Some(index);
        }

        // Compute families implicitly support transfer operations.
        let compute_only = family.flags.contains(vk::QueueFlags::COMPUTE)
            && !family.flags.contains(vk::QueueFlags::GRAPHICS);
        if compute.is_none() && compute_only {
            compute = Some(index);
        }

        if graphics.is_some() && transfer.is_some() {
            break;
        }
    }

    let graphics = graphics?;
    let transfer = transfer.or(compute).unwrap_or(graphics);
    Some((graphics, transfer))
}

/// Index of the preferred device: discrete, then integrated, then CPU, then
/// whatever comes first.
pub(crate) fn best_device_index(device_types: &[vk::PhysicalDeviceType]) -> usize {
    let find = |wanted: vk::PhysicalDeviceType| {
        device_types.iter().position(|device_type| *device_type == wanted)
    };

    find(vk::PhysicalDeviceType::DISCRETE_GPU)
        .or_else(|| find(vk::PhysicalDeviceType::INTEGRATED_GPU))
        .or_else(|| find(vk::PhysicalDeviceType::CPU))
        .unwrap_or(0)
}

/// Creates a [`RenderDevice`] for every physical device able to present to
/// the surface.
pub(crate) fn enumerate_render_devices(
    instance: &Instance,
    surface: &Surface,
    surface_khr: vk::SurfaceKHR,
) -> RendererResult<Vec<RenderDevice>> {
    let physical_devices = unsafe { instance.enumerate_physical_devices()? };
    if physical_devices.is_empty() {
        return Err(RendererError::NoPhysicalDevice);
    }

    let mut devices = Vec::with_capacity(physical_devices.len());
    for physical_device in physical_devices {
        if let Some(device) = create_render_device(instance, surface, surface_khr, physical_device)? {
            devices.push(device);
        }
    }

    if devices.is_empty() {
        return Err(RendererError::NoGraphicsQueue);
    }
    Ok(devices)
}

fn create_render_device(
    instance: &Instance,
    surface: &Surface,
    surface_khr: vk::SurfaceKHR,
    physical_device: vk::PhysicalDevice,
) -> RendererResult<Option<RenderDevice>> {
    let queue_family_properties =
        unsafe { instance.get_physical_device_queue_family_properties(physical_device) };

    let mut families = Vec::with_capacity(queue_family_properties.len());
    for (index, family) in queue_family_properties.iter().enumerate() {
        let supports_present = unsafe {
            surface.get_physical_device_surface_support(physical_device, index as u32, surface_khr)?
        };
        families.push(QueueFamilyInfo {
            flags: family.queue_flags,
            queue_count: family.queue_count,
            supports_present,
        });
    }

    let (graphics_queue_index, transfer_queue_index) =
        match graphics_and_transfer_queue_indices(&families) {
            Some(indices) => indices,
            None => return Ok(None),
        };

    let properties = unsafe { instance.get_physical_device_properties(physical_device) };
    let features = unsafe { instance.get_physical_device_features(physical_device) };
    let memory_properties =
        unsafe { instance.get_physical_device_memory_properties(physical_device) };
    let surface_capabilities = unsafe {
        surface.get_physical_device_surface_capabilities(physical_device, surface_khr)?
    };
    let surface_formats =
        unsafe { surface.get_physical_device_surface_formats(physical_device, surface_khr)? };

    let shared_family = graphics_queue_index == transfer_queue_index;
    let shared_family_has_spare_queue =
        shared_family && families[graphics_queue_index as usize].queue_count > 1;

    // When graphics and transfer share a family with more than one queue,
    // request two queues so transfers don't serialize behind rendering.
    let shared_priorities = [1.0f32, 0.0];
    let single_priority = [1.0f32];
    let queue_create_infos = if !shared_family {
        vec![
            vk::DeviceQueueCreateInfo::builder()
                .queue_family_index(graphics_queue_index)
                .queue_priorities(&single_priority)
                .build(),
            vk::DeviceQueueCreateInfo::builder()
                .queue_family_index(transfer_queue_index)
                .queue_priorities(&single_priority)
                .build(),
        ]
    } else if shared_family_has_spare_queue {
        vec![vk::DeviceQueueCreateInfo::builder()
            .queue_family_index(graphics_queue_index)
            .queue_priorities(&shared_priorities)
            .build()]
    } else {
        vec![vk::DeviceQueueCreateInfo::builder()
            .queue_family_index(graphics_queue_index)
            .queue_priorities(&single_priority)
            .build()]
    };

    // Enable every feature the device reported by chaining the queried set.
    let mut enabled_features = vk::PhysicalDeviceFeatures2::builder()
        .features(features)
        .build();
    let device_extension_ptrs = [SwapchainLoader::name().as_ptr()];
    let device_create_info = vk::DeviceCreateInfo::builder()
        .queue_create_infos(&queue_create_infos)
        .enabled_extension_names(&device_extension_ptrs)
        .push_next(&mut enabled_features);

    let device = unsafe { instance.create_device(physical_device, &device_create_info, None)? };

    let graphics_queue = unsafe { device.get_device_queue(graphics_queue_index, 0) };
    let transfer_queue = if !shared_family {
        unsafe { device.get_device_queue(transfer_queue_index, 0) }
    } else if shared_family_has_spare_queue {
        unsafe { device.get_device_queue(graphics_queue_index, 1) }
    } else {
        graphics_queue
    };

    let render_device = RenderDevice {
        physical_device,
        properties,
        features,
        memory_properties,
        queue_family_properties,
        surface_capabilities,
        surface_formats,
        device,
        graphics_queue_index,
        transfer_queue_index,
        graphics_queue,
        transfer_queue,
    };

    log::debug!(
        "Created logical device for {} (graphics family {}, transfer family {})",
        render_device.name(),
        graphics_queue_index,
        transfer_queue_index
    );

    Ok(Some(render_device))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn family(flags: vk::QueueFlags, queue_count: u32, supports_present: bool) -> QueueFamilyInfo {
        QueueFamilyInfo {
            flags,
            queue_count,
            supports_present,
        }
    }

    #[test]
    fn graphics_requires_present_support() {
        let families = [
            family(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE, 1, false),
            family(vk::QueueFlags::GRAPHICS, 1, true),
        ];
        let (graphics, transfer) = graphics_and_transfer_queue_indices(&families).unwrap();
        assert_eq!(graphics, 1);
        assert_eq!(transfer, 1);
    }

    #[test]
    fn no_presentable_graphics_family_yields_none() {
        let families = [
            family(vk::QueueFlags::COMPUTE, 1, false),
            family(vk::QueueFlags::TRANSFER, 1, true),
        ];
        assert!(graphics_and_transfer_queue_indices(&families).is_none());
    }

    #[test]
    fn dedicated_transfer_family_is_preferred() {
        let families = [
            family(
                vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER,
                1,
                true,
            ),
            family(vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER, 2, false),
            family(vk::QueueFlags::TRANSFER, 2, false),
        ];
        let (graphics, transfer) = graphics_and_transfer_queue_indices(&families).unwrap();
        assert_eq!(graphics, 0);
        assert_eq!(transfer, 2);
    }

    #[test]
    fn compute_only_family_beats_sharing_graphics() {
        let families = [
            family(
                vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER,
                1,
                true,
            ),
            family(vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER, 2, false),
        ];
        let (graphics, transfer) = graphics_and_transfer_queue_indices(&families).unwrap();
        assert_eq!(graphics, 0);
        assert_eq!(transfer, 1);
    }

    #[test]
    fn transfer_falls_back_to_graphics_family() {
        let families = [family(
            vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER,
            1,
            true,
        )];
        let (graphics, transfer) = graphics_and_transfer_queue_indices(&families).unwrap();
        assert_eq!(graphics, 0);
        assert_eq!(transfer, 0);
    }

    #[test]
    fn discrete_gpu_wins_over_integrated() {
        let types = [
            vk::PhysicalDeviceType::INTEGRATED_GPU,
            vk::PhysicalDeviceType::DISCRETE_GPU,
        ];
        assert_eq!(best_device_index(&types), 1);
    }

    #[test]
    fn integrated_gpu_wins_over_cpu() {
        let types = [
            vk::PhysicalDeviceType::CPU,
            vk::PhysicalDeviceType::INTEGRATED_GPU,
        ];
        assert_eq!(best_device_index(&types), 1);
    }

    #[test]
    fn unknown_types_fall_back_to_first() {
        let types = [
            vk::PhysicalDeviceType::OTHER,
            vk::PhysicalDeviceType::VIRTUAL_GPU,
        ];
        assert_eq!(best_device_index(&types), 0);
    }
}
