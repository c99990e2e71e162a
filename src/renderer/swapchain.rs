//! Swapchain creation, recreation and teardown.

use crate::error::RendererResult;
use ash::{extensions::khr::Swapchain as SwapchainLoader, vk, Device};

/// The swapchain, its images and one view per image.
pub struct Swapchain {
    loader: SwapchainLoader,
    khr: vk::SwapchainKHR,
    pub format: vk::Format,
    pub color_space: vk::ColorSpaceKHR,
    pub extent: vk::Extent2D,
    images: Vec<vk::Image>,
    image_views: Vec<vk::ImageView>,
}

impl Swapchain {
    pub(crate) fn new(
        loader: SwapchainLoader,
        device: &Device,
        surface_khr: vk::SurfaceKHR,
        capabilities: &vk::SurfaceCapabilitiesKHR,
        surface_format: vk::SurfaceFormatKHR,
        fallback_extent: vk::Extent2D,
    ) -> RendererResult<Self> {
        let (khr, extent, images, image_views) = create_swapchain_resources(
            &loader,
            device,
            surface_khr,
            capabilities,
            surface_format,
            fallback_extent,
        )?;

        Ok(Self {
            loader,
            khr,
            format: surface_format.format,
            color_space: surface_format.color_space,
            extent,
            images,
            image_views,
        })
    }

    /// Destroys the current chain and builds a new one against the freshly
    /// queried surface capabilities, reusing the loader and format.
    pub(crate) fn recreate(
        &mut self,
        device: &Device,
        surface_khr: vk::SurfaceKHR,
        capabilities: &vk::SurfaceCapabilitiesKHR,
        fallback_extent: vk::Extent2D,
    ) -> RendererResult<()> {
        let surface_format = vk::SurfaceFormatKHR {
            format: self.format,
            color_space: self.color_space,
        };

        self.destroy(device);

        let (khr, extent, images, image_views) = create_swapchain_resources(
            &self.loader,
            device,
            surface_khr,
            capabilities,
            surface_format,
            fallback_extent,
        )?;

        self.khr = khr;
        self.extent = extent;
        self.images = images;
        self.image_views = image_views;
        Ok(())
    }

    pub(crate) fn loader(&self) -> &SwapchainLoader {
        &self.loader
    }

    pub(crate) fn khr(&self) -> vk::SwapchainKHR {
        self.khr
    }

    pub fn image_count(&self) -> u32 {
        self.images.len() as u32
    }

    pub fn image_views(&self) -> &[vk::ImageView] {
        &self.image_views
    }

    pub(crate) fn destroy(&mut self, device: &Device) {
        unsafe {
            for view in self.image_views.drain(..) {
                device.destroy_image_view(view, None);
            }
            self.loader.destroy_swapchain(self.khr, None);
            self.khr = vk::SwapchainKHR::null();
        }
        self.images.clear();
    }
}

type SwapchainResources = (
    vk::SwapchainKHR,
    vk::Extent2D,
    Vec<vk::Image>,
    Vec<vk::ImageView>,
);

fn create_swapchain_resources(
    loader: &SwapchainLoader,
    device: &Device,
    surface_khr: vk::SurfaceKHR,
    capabilities: &vk::SurfaceCapabilitiesKHR,
    surface_format: vk::SurfaceFormatKHR,
    fallback_extent: vk::Extent2D,
) -> RendererResult<SwapchainResources> {
    let extent = surface_extent(capabilities, fallback_extent);

    log::debug!(
        "Creating swapchain ({}x{}, {:?})",
        extent.width,
        extent.height,
        surface_format.format
    );

    let create_info = vk::SwapchainCreateInfoKHR::builder()
        .surface(surface_khr)
        .min_image_count(capabilities.min_image_count)
        .image_format(surface_format.format)
        .image_color_space(surface_format.color_space)
        .image_extent(extent)
        .image_array_layers(1)
        .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT)
        .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
        .pre_transform(capabilities.current_transform)
        .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
        .present_mode(vk::PresentModeKHR::IMMEDIATE)
        .clipped(true);
    let khr = unsafe { loader.create_swapchain(&create_info, None)? };

    let images = unsafe { loader.get_swapchain_images(khr)? };
    let mut image_views = Vec::with_capacity(images.len());
    for image in &images {
        let view_info = vk::ImageViewCreateInfo::builder()
            .image(*image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(surface_format.format)
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                base_mip_level: 0,
                level_count: vk::REMAINING_MIP_LEVELS,
                base_array_layer: 0,
                layer_count: vk::REMAINING_ARRAY_LAYERS,
            });
        image_views.push(unsafe { device.create_image_view(&view_info, None)? });
    }

    Ok((khr, extent, images, image_views))
}

/// Prefers the surface's reported current extent; when the platform leaves
/// it unset (both components at `u32::MAX`) the window size is clamped to
/// the supported range instead.
fn surface_extent(
    capabilities: &vk::SurfaceCapabilitiesKHR,
    fallback_extent: vk::Extent2D,
) -> vk::Extent2D {
    if capabilities.current_extent.width != u32::MAX {
        return capabilities.current_extent;
    }

    vk::Extent2D {
        width: fallback_extent.width.clamp(
            capabilities.min_image_extent.width,
            capabilities.max_image_extent.width,
        ),
        height: fallback_extent.height.clamp(
            capabilities.min_image_extent.height,
            capabilities.max_image_extent.height,
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn capabilities(current: (u32, u32), min: (u32, u32), max: (u32, u32)) -> vk::SurfaceCapabilitiesKHR {
        vk::SurfaceCapabilitiesKHR {
            current_extent: vk::Extent2D {
                width: current.0,
                height: current.1,
            },
            min_image_extent: vk::Extent2D {
                width: min.0,
                height: min.1,
            },
            max_image_extent: vk::Extent2D {
                width: max.0,
                height: max.1,
            },
            ..Default::default()
        }
    }

    #[test]
    fn current_extent_wins_when_reported() {
        let capabilities = capabilities((800, 600), (1, 1), (4096, 4096));
        let extent = surface_extent(
            &capabilities,
            vk::Extent2D {
                width: 1920,
                height: 1080,
            },
        );
        assert_eq!((extent.width, extent.height), (800, 600));
    }

    #[test]
    fn unset_current_extent_falls_back_to_clamped_window_size() {
        let capabilities = capabilities((u32::MAX, u32::MAX), (200, 200), (1000, 1000));
        let extent = surface_extent(
            &capabilities,
            vk::Extent2D {
                width: 1920,
                height: 100,
            },
        );
        assert_eq!((extent.width, extent.height), (1000, 200));
    }
}
