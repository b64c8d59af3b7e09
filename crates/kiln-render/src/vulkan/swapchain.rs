use ash::prelude::VkResult;
use ash::vk;
use kiln_core::config::PresentMode;
use tracing::debug;

use crate::backend::{SwapchainImages, SwapchainRequest};

fn present_mode_to_vk(mode: PresentMode) -> vk::PresentModeKHR {
    match mode {
        PresentMode::Fifo => vk::PresentModeKHR::FIFO,
        PresentMode::Mailbox => vk::PresentModeKHR::MAILBOX,
        PresentMode::Immediate => vk::PresentModeKHR::IMMEDIATE,
    }
}

/// BGRA8 unorm if offered, else whatever the surface lists first.
fn choose_format(formats: &[vk::SurfaceFormatKHR]) -> Option<vk::SurfaceFormatKHR> {
    formats
        .iter()
        .find(|f| {
            f.format == vk::Format::B8G8R8A8_UNORM
                && f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
        })
        .or_else(|| formats.first())
        .copied()
}

/// `None` when the surface lets the swapchain pick its own size.
pub fn current_extent(caps: &vk::SurfaceCapabilitiesKHR) -> Option<[u32; 2]> {
    (caps.current_extent.width != u32::MAX)
        .then_some([caps.current_extent.width, caps.current_extent.height])
}

pub struct SwapchainLoaders<'a> {
    pub surface: &'a ash::khr::surface::Instance,
    pub swapchain: &'a ash::khr::swapchain::Device,
    pub device: &'a ash::Device,
    pub physical_device: vk::PhysicalDevice,
    pub surface_khr: vk::SurfaceKHR,
}

pub fn create(loaders: &SwapchainLoaders<'_>, request: &SwapchainRequest) -> VkResult<SwapchainImages> {
    let (caps, formats, modes) = unsafe {
        (
            loaders
                .surface
                .get_physical_device_surface_capabilities(loaders.physical_device, loaders.surface_khr)?,
            loaders
                .surface
                .get_physical_device_surface_formats(loaders.physical_device, loaders.surface_khr)?,
            loaders
                .surface
                .get_physical_device_surface_present_modes(loaders.physical_device, loaders.surface_khr)?,
        )
    };
    let format = choose_format(&formats).ok_or(vk::Result::ERROR_FORMAT_NOT_SUPPORTED)?;

    let wanted = present_mode_to_vk(request.present_mode);
    // FIFO is the only mode every implementation must support.
    let present_mode = if modes.contains(&wanted) {
        wanted
    } else {
        vk::PresentModeKHR::FIFO
    };

    let extent = current_extent(&caps).unwrap_or([
        request.extent[0].clamp(caps.min_image_extent.width, caps.max_image_extent.width),
        request.extent[1].clamp(caps.min_image_extent.height, caps.max_image_extent.height),
    ]);

    let mut image_count = request.image_count.max(caps.min_image_count);
    if caps.max_image_count > 0 {
        image_count = image_count.min(caps.max_image_count);
    }

    let create_info = vk::SwapchainCreateInfoKHR::default()
        .surface(loaders.surface_khr)
        .min_image_count(image_count)
        .image_format(format.format)
        .image_color_space(format.color_space)
        .image_extent(vk::Extent2D {
            width: extent[0],
            height: extent[1],
        })
        .image_array_layers(1)
        .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSFER_DST)
        .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
        .pre_transform(caps.current_transform)
        .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
        .present_mode(present_mode)
        .clipped(true);

    let swapchain = unsafe { loaders.swapchain.create_swapchain(&create_info, None)? };
    let images = match unsafe { loaders.swapchain.get_swapchain_images(swapchain) } {
        Ok(images) => images,
        Err(e) => {
            unsafe { loaders.swapchain.destroy_swapchain(swapchain, None) };
            return Err(e);
        }
    };

    let mut views = Vec::with_capacity(images.len());
    for &image in &images {
        let view_info = vk::ImageViewCreateInfo::default()
            .image(image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(format.format)
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                base_mip_level: 0,
                level_count: 1,
                base_array_layer: 0,
                layer_count: 1,
            });
        match unsafe { loaders.device.create_image_view(&view_info, None) } {
            Ok(view) => views.push(view),
            Err(e) => {
                unsafe {
                    for view in views {
                        loaders.device.destroy_image_view(view, None);
                    }
                    loaders.swapchain.destroy_swapchain(swapchain, None);
                }
                return Err(e);
            }
        }
    }

    debug!(
        width = extent[0],
        height = extent[1],
        images = images.len(),
        ?present_mode,
        format = ?format.format,
        "swapchain created"
    );
    Ok(SwapchainImages {
        swapchain,
        format: format.format,
        extent,
        images,
        views,
    })
}

pub fn destroy(loaders: &SwapchainLoaders<'_>, swapchain: &SwapchainImages) {
    unsafe {
        for &view in &swapchain.views {
            loaders.device.destroy_image_view(view, None);
        }
        loaders.swapchain.destroy_swapchain(swapchain.swapchain, None);
    }
}
