//! The seam between the engine and a device.
//!
//! The engine decides *what* happens each frame (which uploads, which
//! barriers, which draws) and hands the backend plain descriptions plus a
//! recorded command list. [`crate::vulkan::VulkanBackend`] executes them on a
//! real device; [`crate::headless::HeadlessBackend`] executes them in host
//! memory.

use ash::prelude::VkResult;
use ash::vk;
use kiln_core::config::{DescriptorPoolConfig, PresentMode};
use kiln_protocol::RecordedCommand;

#[derive(Debug, Clone, Copy)]
pub struct BufferDesc {
    pub size: u64,
    pub usage: vk::BufferUsageFlags,
    /// Place in host-visible memory.
    pub mappable: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct BufferAllocation {
    pub buffer: vk::Buffer,
    pub size: u64,
    /// Host-visible and coherent: writable with a plain map/copy/unmap.
    pub host_coherent: bool,
    pub device_address: Option<vk::DeviceAddress>,
}

#[derive(Debug, Clone, Copy)]
pub struct ImageDesc {
    pub extent: [u32; 2],
    pub format: vk::Format,
    pub usage: vk::ImageUsageFlags,
    pub aspect: vk::ImageAspectFlags,
}

#[derive(Debug, Clone, Copy)]
pub struct ImageAllocation {
    pub image: vk::Image,
    pub view: vk::ImageView,
    pub extent: [u32; 2],
    pub format: vk::Format,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayoutBinding {
    pub binding: u32,
    pub descriptor_type: vk::DescriptorType,
    pub count: u32,
    pub stages: vk::ShaderStageFlags,
}

#[derive(Debug, Clone, Copy)]
pub struct GraphicsPipelineDesc {
    pub layout: vk::PipelineLayout,
    pub vertex: Option<vk::ShaderModule>,
    pub fragment: Option<vk::ShaderModule>,
    pub color_format: vk::Format,
    pub depth_format: vk::Format,
}

#[derive(Debug, Clone, Copy)]
pub enum DescriptorWrite {
    Buffer {
        binding: u32,
        descriptor_type: vk::DescriptorType,
        buffer: vk::Buffer,
    },
    Image {
        binding: u32,
        descriptor_type: vk::DescriptorType,
        view: vk::ImageView,
        layout: vk::ImageLayout,
        sampler: Option<vk::Sampler>,
    },
}

/// Objects owned by one frame in flight.
#[derive(Debug, Clone, Copy)]
pub struct FrameSync {
    pub command_pool: vk::CommandPool,
    pub command_buffer: vk::CommandBuffer,
    pub image_available: vk::Semaphore,
    pub render_complete: vk::Semaphore,
    /// Created signaled so the first wait returns immediately.
    pub in_flight: vk::Fence,
}

#[derive(Debug, Clone, Copy)]
pub struct SwapchainRequest {
    pub extent: [u32; 2],
    pub present_mode: PresentMode,
    pub image_count: u32,
}

#[derive(Debug, Clone)]
pub struct SwapchainImages {
    pub swapchain: vk::SwapchainKHR,
    pub format: vk::Format,
    pub extent: [u32; 2],
    pub images: Vec<vk::Image>,
    pub views: Vec<vk::ImageView>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireOutcome {
    Image(u32),
    /// The swapchain no longer matches the surface and must be rebuilt.
    Stale,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresentOutcome {
    Presented,
    Stale,
}

#[derive(Debug, Clone, Copy)]
pub struct SubmitDesc {
    pub command_buffer: vk::CommandBuffer,
    pub wait_semaphore: vk::Semaphore,
    pub wait_stage: vk::PipelineStageFlags2,
    pub signal_semaphore: vk::Semaphore,
    pub fence: vk::Fence,
}

pub trait GpuBackend {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    // ── Buffers ─────────────────────────────────────────────
    fn create_buffer(&mut self, desc: &BufferDesc) -> VkResult<BufferAllocation>;
    /// Map, copy `data` at `offset`, unmap. Only valid for mappable buffers.
    fn write_buffer(&mut self, buffer: vk::Buffer, offset: u64, data: &[u8]) -> VkResult<()>;
    fn destroy_buffer(&mut self, buffer: vk::Buffer);

    // ── Images ──────────────────────────────────────────────
    fn create_image(&mut self, desc: &ImageDesc) -> VkResult<ImageAllocation>;
    fn destroy_image(&mut self, image: &ImageAllocation);
    fn create_sampler(&mut self) -> VkResult<vk::Sampler>;
    fn destroy_sampler(&mut self, sampler: vk::Sampler);

    // ── Shaders and pipelines ───────────────────────────────
    fn create_shader_module(&mut self, code: &[u32]) -> VkResult<vk::ShaderModule>;
    fn destroy_shader_module(&mut self, module: vk::ShaderModule);
    fn create_descriptor_set_layout(
        &mut self,
        bindings: &[LayoutBinding],
    ) -> VkResult<vk::DescriptorSetLayout>;
    fn destroy_descriptor_set_layout(&mut self, layout: vk::DescriptorSetLayout);
    fn create_pipeline_layout(
        &mut self,
        set_layout: vk::DescriptorSetLayout,
        push_constants: &[vk::PushConstantRange],
    ) -> VkResult<vk::PipelineLayout>;
    fn destroy_pipeline_layout(&mut self, layout: vk::PipelineLayout);
    fn create_graphics_pipeline(&mut self, desc: &GraphicsPipelineDesc) -> VkResult<vk::Pipeline>;
    fn destroy_pipeline(&mut self, pipeline: vk::Pipeline);

    // ── Descriptors ─────────────────────────────────────────
    fn create_descriptor_pool(&mut self, config: &DescriptorPoolConfig)
        -> VkResult<vk::DescriptorPool>;
    fn destroy_descriptor_pool(&mut self, pool: vk::DescriptorPool);
    fn allocate_descriptor_set(
        &mut self,
        pool: vk::DescriptorPool,
        layout: vk::DescriptorSetLayout,
    ) -> VkResult<vk::DescriptorSet>;
    fn free_descriptor_sets(
        &mut self,
        pool: vk::DescriptorPool,
        sets: &[vk::DescriptorSet],
    ) -> VkResult<()>;
    fn write_descriptor_set(&mut self, set: vk::DescriptorSet, writes: &[DescriptorWrite]);

    // ── Frame synchronization ───────────────────────────────
    fn create_frame_sync(&mut self) -> VkResult<FrameSync>;
    fn destroy_frame_sync(&mut self, sync: &FrameSync);
    fn wait_for_fence(&mut self, fence: vk::Fence, timeout_ns: u64) -> VkResult<()>;
    fn reset_fence(&mut self, fence: vk::Fence) -> VkResult<()>;
    fn fence_signaled(&mut self, fence: vk::Fence) -> VkResult<bool>;
    /// Reset `command_buffer`, record `commands` into it and end it.
    fn record(
        &mut self,
        command_buffer: vk::CommandBuffer,
        commands: &[RecordedCommand],
    ) -> VkResult<()>;
    fn submit(&mut self, submit: &SubmitDesc) -> VkResult<()>;
    fn device_wait_idle(&mut self) -> VkResult<()>;

    // ── Presentation ────────────────────────────────────────
    /// Current surface size, if the surface reports a fixed one.
    fn surface_extent(&mut self) -> VkResult<Option<[u32; 2]>>;
    fn create_swapchain(&mut self, request: &SwapchainRequest) -> VkResult<SwapchainImages>;
    fn destroy_swapchain(&mut self, swapchain: &SwapchainImages);
    fn acquire_next_image(
        &mut self,
        swapchain: vk::SwapchainKHR,
        signal: vk::Semaphore,
    ) -> VkResult<AcquireOutcome>;
    fn present(
        &mut self,
        swapchain: vk::SwapchainKHR,
        image_index: u32,
        wait: vk::Semaphore,
    ) -> VkResult<PresentOutcome>;
}
