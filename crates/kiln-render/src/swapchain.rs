use ash::vk;
use bitflags::bitflags;
use kiln_core::config::SwapchainConfig;
use tracing::{debug, info};

use crate::backend::{GpuBackend, ImageAllocation, ImageDesc, SwapchainImages, SwapchainRequest};
use crate::error::{RenderError, VkResultExt};

/// Format of the offscreen color target draws render into.
pub const COLOR_FORMAT: vk::Format = vk::Format::R16G16B16A16_SFLOAT;
pub const DEPTH_FORMAT: vk::Format = vk::Format::D32_SFLOAT;

bitflags! {
    /// Pending presentation-side work, consumed at the start of a frame.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct DirtyFlags: u32 {
        /// Swapchain images no longer match the surface.
        const SWAPCHAIN = 1 << 0;
        /// Offscreen targets must follow the new extent.
        const RENDER_TARGETS = 1 << 1;
    }
}

pub struct RenderTargets {
    pub color: ImageAllocation,
    pub depth: ImageAllocation,
}

impl RenderTargets {
    fn create<B: GpuBackend>(backend: &mut B, extent: [u32; 2]) -> Result<Self, RenderError> {
        let color = backend
            .create_image(&ImageDesc {
                extent,
                format: COLOR_FORMAT,
                usage: vk::ImageUsageFlags::COLOR_ATTACHMENT
                    | vk::ImageUsageFlags::TRANSFER_SRC
                    | vk::ImageUsageFlags::TRANSFER_DST,
                aspect: vk::ImageAspectFlags::COLOR,
            })
            .vk("vkCreateImage")?;
        let depth = match backend.create_image(&ImageDesc {
            extent,
            format: DEPTH_FORMAT,
            usage: vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT,
            aspect: vk::ImageAspectFlags::DEPTH,
        }) {
            Ok(depth) => depth,
            Err(e) => {
                backend.destroy_image(&color);
                return Err(e).vk("vkCreateImage");
            }
        };
        Ok(Self { color, depth })
    }

    fn destroy<B: GpuBackend>(&self, backend: &mut B) {
        backend.destroy_image(&self.depth);
        backend.destroy_image(&self.color);
    }
}

/// Swapchain images plus the offscreen targets sized to match them.
/// Always rebuilt wholesale.
pub struct SwapchainState {
    images: Option<SwapchainImages>,
    targets: Option<RenderTargets>,
    extent: [u32; 2],
    pending_extent: Option<[u32; 2]>,
    dirty: DirtyFlags,
    rebuilds: u64,
    config: SwapchainConfig,
}

impl SwapchainState {
    pub fn new<B: GpuBackend>(
        backend: &mut B,
        extent: [u32; 2],
        config: &SwapchainConfig,
    ) -> Result<Self, RenderError> {
        let mut state = Self {
            images: None,
            targets: None,
            extent,
            pending_extent: Some(extent),
            dirty: DirtyFlags::all(),
            rebuilds: 0,
            config: config.clone(),
        };
        state.create(backend, extent)?;
        state.dirty = DirtyFlags::empty();
        state.pending_extent = None;
        Ok(state)
    }

    pub fn dirty(&self) -> DirtyFlags {
        self.dirty
    }

    pub fn extent(&self) -> [u32; 2] {
        self.extent
    }

    pub fn rebuilds(&self) -> u64 {
        self.rebuilds
    }

    pub fn images(&self) -> Option<&SwapchainImages> {
        self.images.as_ref()
    }

    pub fn targets(&self) -> Option<&RenderTargets> {
        self.targets.as_ref()
    }

    /// Explicit resize signal from the window.
    pub fn request_resize(&mut self, width: u32, height: u32) {
        self.pending_extent = Some([width, height]);
        self.dirty |= DirtyFlags::SWAPCHAIN | DirtyFlags::RENDER_TARGETS;
        debug!(width, height, "resize requested");
    }

    /// Acquire or present reported the swapchain as out of date.
    pub fn mark_stale(&mut self) {
        self.dirty |= DirtyFlags::SWAPCHAIN | DirtyFlags::RENDER_TARGETS;
    }

    /// Rebuilds if dirty. Returns `false` when there is nothing to render
    /// into (zero-area surface), in which case the flags stay set.
    pub fn rebuild_if_dirty<B: GpuBackend>(&mut self, backend: &mut B) -> Result<bool, RenderError> {
        if self.dirty.is_empty() {
            return Ok(self.images.is_some());
        }

        let extent = match self.pending_extent {
            Some(extent) => extent,
            None => backend
                .surface_extent()
                .vk("vkGetPhysicalDeviceSurfaceCapabilitiesKHR")?
                .unwrap_or(self.extent),
        };
        if extent[0] == 0 || extent[1] == 0 {
            debug!("surface has zero area, deferring swapchain rebuild");
            return Ok(false);
        }

        // Stop the world: nothing may still reference the old images.
        backend.device_wait_idle().vk("vkDeviceWaitIdle")?;
        self.destroy(backend);
        self.create(backend, extent)?;

        self.rebuilds += 1;
        self.pending_extent = None;
        self.dirty = DirtyFlags::empty();
        info!(width = extent[0], height = extent[1], rebuilds = self.rebuilds, "swapchain rebuilt");
        Ok(true)
    }

    fn create<B: GpuBackend>(&mut self, backend: &mut B, extent: [u32; 2]) -> Result<(), RenderError> {
        let images = backend
            .create_swapchain(&SwapchainRequest {
                extent,
                present_mode: self.config.present_mode,
                image_count: self.config.image_count,
            })
            .vk("vkCreateSwapchainKHR")?;
        let extent = images.extent;
        let targets = match RenderTargets::create(backend, extent) {
            Ok(targets) => targets,
            Err(e) => {
                backend.destroy_swapchain(&images);
                return Err(e);
            }
        };
        self.images = Some(images);
        self.targets = Some(targets);
        self.extent = extent;
        Ok(())
    }

    pub fn destroy<B: GpuBackend>(&mut self, backend: &mut B) {
        if let Some(targets) = self.targets.take() {
            targets.destroy(backend);
        }
        if let Some(images) = self.images.take() {
            backend.destroy_swapchain(&images);
        }
    }
}
