//! [`GpuBackend`] on a real Vulkan 1.3 device through `ash`.
//!
//! The device must have been created with `synchronization2`,
//! `dynamicRendering` and `bufferDeviceAddress` enabled and the
//! `VK_KHR_swapchain` extension loaded.

mod memory;
mod pipeline;
mod replay;
mod swapchain;

use std::collections::HashMap;

use ash::prelude::VkResult;
use ash::vk;
use kiln_core::config::DescriptorPoolConfig;
use kiln_protocol::RecordedCommand;
use tracing::{debug, info, warn};

use crate::backend::{
    AcquireOutcome, BufferAllocation, BufferDesc, DescriptorWrite, FrameSync, GpuBackend,
    GraphicsPipelineDesc, ImageAllocation, ImageDesc, LayoutBinding, PresentOutcome, SubmitDesc,
    SwapchainImages, SwapchainRequest,
};
use crate::error::{RenderError, VkResultExt};
use memory::{find_memory_type, flags_for, BufferMemory};
use swapchain::SwapchainLoaders;

/// Objects created by the application's bootstrap code. The backend uses
/// them but never destroys them; tear them down after the render context
/// is gone.
pub struct VulkanDevice {
    pub entry: ash::Entry,
    pub instance: ash::Instance,
    pub physical_device: vk::PhysicalDevice,
    pub device: ash::Device,
    pub queue: vk::Queue,
    pub queue_family_index: u32,
    pub surface: vk::SurfaceKHR,
}

pub struct VulkanBackend {
    raw: VulkanDevice,
    surface_loader: ash::khr::surface::Instance,
    swapchain_loader: ash::khr::swapchain::Device,
    memory_properties: vk::PhysicalDeviceMemoryProperties,
    buffers: HashMap<vk::Buffer, BufferMemory>,
    images: HashMap<vk::Image, vk::DeviceMemory>,
}

impl VulkanBackend {
    pub fn new(raw: VulkanDevice) -> Result<Self, RenderError> {
        let surface_loader = ash::khr::surface::Instance::new(&raw.entry, &raw.instance);
        let swapchain_loader = ash::khr::swapchain::Device::new(&raw.instance, &raw.device);
        let memory_properties = unsafe {
            raw.instance
                .get_physical_device_memory_properties(raw.physical_device)
        };
        let supported = unsafe {
            surface_loader.get_physical_device_surface_support(
                raw.physical_device,
                raw.queue_family_index,
                raw.surface,
            )
        }
        .vk("vkGetPhysicalDeviceSurfaceSupportKHR")?;
        if !supported {
            warn!(family = raw.queue_family_index, "queue family cannot present to the surface");
            return Err(RenderError::Vulkan {
                call: "vkGetPhysicalDeviceSurfaceSupportKHR",
                result: vk::Result::ERROR_SURFACE_LOST_KHR,
            });
        }

        let properties = unsafe {
            raw.instance
                .get_physical_device_properties(raw.physical_device)
        };
        let name = properties
            .device_name_as_c_str()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "unknown".into());
        info!(
            device = %name,
            memory_types = memory_properties.memory_type_count,
            "vulkan backend ready"
        );

        Ok(Self {
            raw,
            surface_loader,
            swapchain_loader,
            memory_properties,
            buffers: HashMap::new(),
            images: HashMap::new(),
        })
    }

    pub fn device(&self) -> &ash::Device {
        &self.raw.device
    }

    /// Hands the bootstrap objects back for teardown.
    pub fn into_raw(self) -> VulkanDevice {
        self.raw
    }

    fn loaders(&self) -> SwapchainLoaders<'_> {
        SwapchainLoaders {
            surface: &self.surface_loader,
            swapchain: &self.swapchain_loader,
            device: &self.raw.device,
            physical_device: self.raw.physical_device,
            surface_khr: self.raw.surface,
        }
    }

    fn allocate(
        &self,
        requirements: vk::MemoryRequirements,
        mappable: bool,
        device_address: bool,
    ) -> VkResult<(vk::DeviceMemory, vk::MemoryPropertyFlags)> {
        let (required, preferred) = flags_for(mappable);
        let (type_index, flags) = find_memory_type(
            &self.memory_properties,
            requirements.memory_type_bits,
            required,
            preferred,
        )
        .ok_or(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY)?;

        let mut flags_info =
            vk::MemoryAllocateFlagsInfo::default().flags(vk::MemoryAllocateFlags::DEVICE_ADDRESS);
        let mut alloc_info = vk::MemoryAllocateInfo::default()
            .allocation_size(requirements.size)
            .memory_type_index(type_index);
        if device_address {
            alloc_info = alloc_info.push_next(&mut flags_info);
        }
        let memory = unsafe { self.raw.device.allocate_memory(&alloc_info, None)? };
        Ok((memory, flags))
    }
}

impl GpuBackend for VulkanBackend {
    fn name(&self) -> &'static str {
        "vulkan"
    }

    // ── Buffers ─────────────────────────────────────────────

    fn create_buffer(&mut self, desc: &BufferDesc) -> VkResult<BufferAllocation> {
        let device = &self.raw.device;
        let create_info = vk::BufferCreateInfo::default()
            .size(desc.size)
            .usage(desc.usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        let buffer = unsafe { device.create_buffer(&create_info, None)? };
        let requirements = unsafe { device.get_buffer_memory_requirements(buffer) };

        let wants_address = desc
            .usage
            .contains(vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS);
        let (memory, flags) = match self.allocate(requirements, desc.mappable, wants_address) {
            Ok(allocated) => allocated,
            Err(e) => {
                unsafe { device.destroy_buffer(buffer, None) };
                return Err(e);
            }
        };
        if let Err(e) = unsafe { device.bind_buffer_memory(buffer, memory, 0) } {
            unsafe {
                device.destroy_buffer(buffer, None);
                device.free_memory(memory, None);
            }
            return Err(e);
        }

        let device_address = wants_address.then(|| unsafe {
            device.get_buffer_device_address(&vk::BufferDeviceAddressInfo::default().buffer(buffer))
        });
        let host_visible = flags.contains(vk::MemoryPropertyFlags::HOST_VISIBLE);
        let host_coherent = host_visible && flags.contains(vk::MemoryPropertyFlags::HOST_COHERENT);
        self.buffers.insert(
            buffer,
            BufferMemory {
                memory,
                size: desc.size,
                host_visible,
                host_coherent,
            },
        );
        Ok(BufferAllocation {
            buffer,
            size: desc.size,
            host_coherent,
            device_address,
        })
    }

    fn write_buffer(&mut self, buffer: vk::Buffer, offset: u64, data: &[u8]) -> VkResult<()> {
        let mem = *self
            .buffers
            .get(&buffer)
            .ok_or(vk::Result::ERROR_MEMORY_MAP_FAILED)?;
        let in_range = offset
            .checked_add(data.len() as u64)
            .is_some_and(|end| end <= mem.size);
        if !mem.host_visible || !in_range {
            return Err(vk::Result::ERROR_MEMORY_MAP_FAILED);
        }
        let device = &self.raw.device;
        unsafe {
            let ptr = device.map_memory(mem.memory, 0, vk::WHOLE_SIZE, vk::MemoryMapFlags::empty())?;
            // SAFETY: the mapping covers the whole allocation, which is at
            // least `mem.size` bytes, and the range was checked above.
            std::ptr::copy_nonoverlapping(
                data.as_ptr(),
                (ptr as *mut u8).add(offset as usize),
                data.len(),
            );
            if !mem.host_coherent {
                let range = vk::MappedMemoryRange::default()
                    .memory(mem.memory)
                    .offset(0)
                    .size(vk::WHOLE_SIZE);
                if let Err(e) = device.flush_mapped_memory_ranges(&[range]) {
                    device.unmap_memory(mem.memory);
                    return Err(e);
                }
            }
            device.unmap_memory(mem.memory);
        }
        Ok(())
    }

    fn destroy_buffer(&mut self, buffer: vk::Buffer) {
        let Some(mem) = self.buffers.remove(&buffer) else {
            return;
        };
        unsafe {
            self.raw.device.destroy_buffer(buffer, None);
            self.raw.device.free_memory(mem.memory, None);
        }
    }

    // ── Images ──────────────────────────────────────────────

    fn create_image(&mut self, desc: &ImageDesc) -> VkResult<ImageAllocation> {
        let device = &self.raw.device;
        let create_info = vk::ImageCreateInfo::default()
            .image_type(vk::ImageType::TYPE_2D)
            .format(desc.format)
            .extent(vk::Extent3D {
                width: desc.extent[0],
                height: desc.extent[1],
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(1)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(desc.usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);
        let image = unsafe { device.create_image(&create_info, None)? };
        let requirements = unsafe { device.get_image_memory_requirements(image) };

        let memory = match self.allocate(requirements, false, false) {
            Ok((memory, _)) => memory,
            Err(e) => {
                unsafe { device.destroy_image(image, None) };
                return Err(e);
            }
        };
        let view_info = vk::ImageViewCreateInfo::default()
            .image(image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(desc.format)
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: desc.aspect,
                base_mip_level: 0,
                level_count: 1,
                base_array_layer: 0,
                layer_count: 1,
            });
        let view = unsafe {
            device
                .bind_image_memory(image, memory, 0)
                .and_then(|()| device.create_image_view(&view_info, None))
        };
        let view = match view {
            Ok(view) => view,
            Err(e) => {
                unsafe {
                    device.destroy_image(image, None);
                    device.free_memory(memory, None);
                }
                return Err(e);
            }
        };

        self.images.insert(image, memory);
        Ok(ImageAllocation {
            image,
            view,
            extent: desc.extent,
            format: desc.format,
        })
    }

    fn destroy_image(&mut self, image: &ImageAllocation) {
        let Some(memory) = self.images.remove(&image.image) else {
            return;
        };
        unsafe {
            self.raw.device.destroy_image_view(image.view, None);
            self.raw.device.destroy_image(image.image, None);
            self.raw.device.free_memory(memory, None);
        }
    }

    fn create_sampler(&mut self) -> VkResult<vk::Sampler> {
        let create_info = vk::SamplerCreateInfo::default()
            .mag_filter(vk::Filter::NEAREST)
            .min_filter(vk::Filter::NEAREST)
            .mipmap_mode(vk::SamplerMipmapMode::NEAREST)
            .address_mode_u(vk::SamplerAddressMode::REPEAT)
            .address_mode_v(vk::SamplerAddressMode::REPEAT)
            .address_mode_w(vk::SamplerAddressMode::REPEAT)
            .max_lod(vk::LOD_CLAMP_NONE);
        unsafe { self.raw.device.create_sampler(&create_info, None) }
    }

    fn destroy_sampler(&mut self, sampler: vk::Sampler) {
        unsafe { self.raw.device.destroy_sampler(sampler, None) };
    }

    // ── Shaders and pipelines ───────────────────────────────

    fn create_shader_module(&mut self, code: &[u32]) -> VkResult<vk::ShaderModule> {
        let create_info = vk::ShaderModuleCreateInfo::default().code(code);
        unsafe { self.raw.device.create_shader_module(&create_info, None) }
    }

    fn destroy_shader_module(&mut self, module: vk::ShaderModule) {
        unsafe { self.raw.device.destroy_shader_module(module, None) };
    }

    fn create_descriptor_set_layout(
        &mut self,
        bindings: &[LayoutBinding],
    ) -> VkResult<vk::DescriptorSetLayout> {
        let vk_bindings: Vec<vk::DescriptorSetLayoutBinding> = bindings
            .iter()
            .map(|b| {
                vk::DescriptorSetLayoutBinding::default()
                    .binding(b.binding)
                    .descriptor_type(b.descriptor_type)
                    .descriptor_count(b.count)
                    .stage_flags(b.stages)
            })
            .collect();
        let create_info = vk::DescriptorSetLayoutCreateInfo::default().bindings(&vk_bindings);
        unsafe { self.raw.device.create_descriptor_set_layout(&create_info, None) }
    }

    fn destroy_descriptor_set_layout(&mut self, layout: vk::DescriptorSetLayout) {
        unsafe { self.raw.device.destroy_descriptor_set_layout(layout, None) };
    }

    fn create_pipeline_layout(
        &mut self,
        set_layout: vk::DescriptorSetLayout,
        push_constants: &[vk::PushConstantRange],
    ) -> VkResult<vk::PipelineLayout> {
        let set_layouts = [set_layout];
        let create_info = vk::PipelineLayoutCreateInfo::default()
            .set_layouts(&set_layouts)
            .push_constant_ranges(push_constants);
        unsafe { self.raw.device.create_pipeline_layout(&create_info, None) }
    }

    fn destroy_pipeline_layout(&mut self, layout: vk::PipelineLayout) {
        unsafe { self.raw.device.destroy_pipeline_layout(layout, None) };
    }

    fn create_graphics_pipeline(&mut self, desc: &GraphicsPipelineDesc) -> VkResult<vk::Pipeline> {
        pipeline::create_graphics_pipeline(&self.raw.device, desc)
    }

    fn destroy_pipeline(&mut self, pipeline: vk::Pipeline) {
        unsafe { self.raw.device.destroy_pipeline(pipeline, None) };
    }

    // ── Descriptors ─────────────────────────────────────────

    fn create_descriptor_pool(
        &mut self,
        config: &DescriptorPoolConfig,
    ) -> VkResult<vk::DescriptorPool> {
        let pool_sizes: Vec<vk::DescriptorPoolSize> = [
            (vk::DescriptorType::UNIFORM_BUFFER, config.uniform_buffers),
            (vk::DescriptorType::STORAGE_BUFFER, config.storage_buffers),
            (
                vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
                config.combined_image_samplers,
            ),
            (vk::DescriptorType::STORAGE_IMAGE, config.storage_images),
        ]
        .into_iter()
        .filter(|(_, count)| *count > 0)
        .map(|(ty, descriptor_count)| vk::DescriptorPoolSize {
            ty,
            descriptor_count,
        })
        .collect();
        let create_info = vk::DescriptorPoolCreateInfo::default()
            .flags(vk::DescriptorPoolCreateFlags::FREE_DESCRIPTOR_SET)
            .max_sets(config.max_sets)
            .pool_sizes(&pool_sizes);
        unsafe { self.raw.device.create_descriptor_pool(&create_info, None) }
    }

    fn destroy_descriptor_pool(&mut self, pool: vk::DescriptorPool) {
        unsafe { self.raw.device.destroy_descriptor_pool(pool, None) };
    }

    fn allocate_descriptor_set(
        &mut self,
        pool: vk::DescriptorPool,
        layout: vk::DescriptorSetLayout,
    ) -> VkResult<vk::DescriptorSet> {
        let layouts = [layout];
        let alloc_info = vk::DescriptorSetAllocateInfo::default()
            .descriptor_pool(pool)
            .set_layouts(&layouts);
        let sets = unsafe { self.raw.device.allocate_descriptor_sets(&alloc_info)? };
        sets.into_iter()
            .next()
            .ok_or(vk::Result::ERROR_OUT_OF_POOL_MEMORY)
    }

    fn free_descriptor_sets(
        &mut self,
        pool: vk::DescriptorPool,
        sets: &[vk::DescriptorSet],
    ) -> VkResult<()> {
        unsafe { self.raw.device.free_descriptor_sets(pool, sets) }
    }

    fn write_descriptor_set(&mut self, set: vk::DescriptorSet, writes: &[DescriptorWrite]) {
        for write in writes {
            match *write {
                DescriptorWrite::Buffer {
                    binding,
                    descriptor_type,
                    buffer,
                } => {
                    let infos = [vk::DescriptorBufferInfo {
                        buffer,
                        offset: 0,
                        range: vk::WHOLE_SIZE,
                    }];
                    let vk_write = vk::WriteDescriptorSet::default()
                        .dst_set(set)
                        .dst_binding(binding)
                        .descriptor_type(descriptor_type)
                        .buffer_info(&infos);
                    unsafe { self.raw.device.update_descriptor_sets(&[vk_write], &[]) };
                }
                DescriptorWrite::Image {
                    binding,
                    descriptor_type,
                    view,
                    layout,
                    sampler,
                } => {
                    let infos = [vk::DescriptorImageInfo {
                        sampler: sampler.unwrap_or_default(),
                        image_view: view,
                        image_layout: layout,
                    }];
                    let vk_write = vk::WriteDescriptorSet::default()
                        .dst_set(set)
                        .dst_binding(binding)
                        .descriptor_type(descriptor_type)
                        .image_info(&infos);
                    unsafe { self.raw.device.update_descriptor_sets(&[vk_write], &[]) };
                }
            }
        }
    }

    // ── Frame synchronization ───────────────────────────────

    fn create_frame_sync(&mut self) -> VkResult<FrameSync> {
        let device = &self.raw.device;
        let pool_info = vk::CommandPoolCreateInfo::default()
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
            .queue_family_index(self.raw.queue_family_index);
        let command_pool = unsafe { device.create_command_pool(&pool_info, None)? };

        let made = create_sync_objects(device, command_pool);

        match made {
            Ok((command_buffer, image_available, render_complete, in_flight)) => Ok(FrameSync {
                command_pool,
                command_buffer,
                image_available,
                render_complete,
                in_flight,
            }),
            Err(e) => {
                // Frees any command buffer allocated from it.
                unsafe { device.destroy_command_pool(command_pool, None) };
                Err(e)
            }
        }
    }

    fn destroy_frame_sync(&mut self, sync: &FrameSync) {
        let device = &self.raw.device;
        unsafe {
            device.destroy_fence(sync.in_flight, None);
            device.destroy_semaphore(sync.render_complete, None);
            device.destroy_semaphore(sync.image_available, None);
            device.destroy_command_pool(sync.command_pool, None);
        }
    }

    fn wait_for_fence(&mut self, fence: vk::Fence, timeout_ns: u64) -> VkResult<()> {
        unsafe { self.raw.device.wait_for_fences(&[fence], true, timeout_ns) }
    }

    fn reset_fence(&mut self, fence: vk::Fence) -> VkResult<()> {
        unsafe { self.raw.device.reset_fences(&[fence]) }
    }

    fn fence_signaled(&mut self, fence: vk::Fence) -> VkResult<bool> {
        unsafe { self.raw.device.get_fence_status(fence) }
    }

    fn record(
        &mut self,
        command_buffer: vk::CommandBuffer,
        commands: &[RecordedCommand],
    ) -> VkResult<()> {
        let device = &self.raw.device;
        unsafe {
            device.reset_command_buffer(command_buffer, vk::CommandBufferResetFlags::empty())?;
            let begin_info = vk::CommandBufferBeginInfo::default()
                .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
            device.begin_command_buffer(command_buffer, &begin_info)?;
        }
        replay::replay(device, command_buffer, commands);
        unsafe { device.end_command_buffer(command_buffer) }
    }

    fn submit(&mut self, submit: &SubmitDesc) -> VkResult<()> {
        let waits = [vk::SemaphoreSubmitInfo::default()
            .semaphore(submit.wait_semaphore)
            .stage_mask(submit.wait_stage)];
        let signals = [vk::SemaphoreSubmitInfo::default()
            .semaphore(submit.signal_semaphore)
            .stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS)];
        let command_buffers =
            [vk::CommandBufferSubmitInfo::default().command_buffer(submit.command_buffer)];
        let submit_info = vk::SubmitInfo2::default()
            .wait_semaphore_infos(&waits)
            .command_buffer_infos(&command_buffers)
            .signal_semaphore_infos(&signals);
        unsafe {
            self.raw
                .device
                .queue_submit2(self.raw.queue, &[submit_info], submit.fence)
        }
    }

    fn device_wait_idle(&mut self) -> VkResult<()> {
        unsafe { self.raw.device.device_wait_idle() }
    }

    // ── Presentation ────────────────────────────────────────

    fn surface_extent(&mut self) -> VkResult<Option<[u32; 2]>> {
        let caps = unsafe {
            self.surface_loader
                .get_physical_device_surface_capabilities(self.raw.physical_device, self.raw.surface)?
        };
        Ok(swapchain::current_extent(&caps))
    }

    fn create_swapchain(&mut self, request: &SwapchainRequest) -> VkResult<SwapchainImages> {
        swapchain::create(&self.loaders(), request)
    }

    fn destroy_swapchain(&mut self, images: &SwapchainImages) {
        swapchain::destroy(&self.loaders(), images);
    }

    fn acquire_next_image(
        &mut self,
        swapchain: vk::SwapchainKHR,
        signal: vk::Semaphore,
    ) -> VkResult<AcquireOutcome> {
        let result = unsafe {
            self.swapchain_loader
                .acquire_next_image(swapchain, u64::MAX, signal, vk::Fence::null())
        };
        match result {
            Ok((index, suboptimal)) => {
                if suboptimal {
                    // Still presentable; the present will report it stale.
                    debug!(index, "acquired suboptimal swapchain image");
                }
                Ok(AcquireOutcome::Image(index))
            }
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(AcquireOutcome::Stale),
            Err(e) => Err(e),
        }
    }

    fn present(
        &mut self,
        swapchain: vk::SwapchainKHR,
        image_index: u32,
        wait: vk::Semaphore,
    ) -> VkResult<PresentOutcome> {
        let waits = [wait];
        let swapchains = [swapchain];
        let indices = [image_index];
        let present_info = vk::PresentInfoKHR::default()
            .wait_semaphores(&waits)
            .swapchains(&swapchains)
            .image_indices(&indices);
        match unsafe {
            self.swapchain_loader
                .queue_present(self.raw.queue, &present_info)
        } {
            Ok(false) => Ok(PresentOutcome::Presented),
            Ok(true) | Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(PresentOutcome::Stale),
            Err(e) => Err(e),
        }
    }
}

fn create_sync_objects(
    device: &ash::Device,
    command_pool: vk::CommandPool,
) -> VkResult<(vk::CommandBuffer, vk::Semaphore, vk::Semaphore, vk::Fence)> {
    let alloc_info = vk::CommandBufferAllocateInfo::default()
        .command_pool(command_pool)
        .level(vk::CommandBufferLevel::PRIMARY)
        .command_buffer_count(1);
    let command_buffer = unsafe { device.allocate_command_buffers(&alloc_info)? }
        .into_iter()
        .next()
        .ok_or(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY)?;

    let semaphore_info = vk::SemaphoreCreateInfo::default();
    let image_available = unsafe { device.create_semaphore(&semaphore_info, None)? };
    let render_complete = match unsafe { device.create_semaphore(&semaphore_info, None) } {
        Ok(s) => s,
        Err(e) => {
            unsafe { device.destroy_semaphore(image_available, None) };
            return Err(e);
        }
    };
    let fence_info = vk::FenceCreateInfo::default().flags(vk::FenceCreateFlags::SIGNALED);
    let in_flight = match unsafe { device.create_fence(&fence_info, None) } {
        Ok(f) => f,
        Err(e) => {
            unsafe {
                device.destroy_semaphore(image_available, None);
                device.destroy_semaphore(render_complete, None);
            }
            return Err(e);
        }
    };
    Ok((command_buffer, image_available, render_complete, in_flight))
}
