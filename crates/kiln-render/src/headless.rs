//! Software device.
//!
//! Buffers and images are host byte vectors. A submission stays pending
//! until something waits on its fence (or on the whole device); only then
//! are its commands executed, in submission order, the way a GPU would
//! retire them. Every protocol violation the engine could make against a
//! real driver (re-recording an in-flight command buffer, submitting with a
//! signaled fence, waiting on a fence nobody will signal, touching a
//! destroyed object, copying into an image in the wrong layout) is recorded
//! in [`HeadlessLog::validation_errors`].

use std::collections::VecDeque;

use ash::prelude::VkResult;
use ash::vk::{self, Handle};
use kiln_core::config::DescriptorPoolConfig;
use kiln_protocol::RecordedCommand;
use rustc_hash::{FxHashMap, FxHashSet};
use tracing::{debug, warn};

use crate::backend::{
    AcquireOutcome, BufferAllocation, BufferDesc, DescriptorWrite, FrameSync, GpuBackend,
    GraphicsPipelineDesc, ImageAllocation, ImageDesc, LayoutBinding, PresentOutcome, SubmitDesc,
    SwapchainImages, SwapchainRequest,
};

const SWAPCHAIN_FORMAT: vk::Format = vk::Format::B8G8R8A8_UNORM;

struct HeadlessBuffer {
    data: Vec<u8>,
    mappable: bool,
}

struct HeadlessImage {
    data: Vec<u8>,
    extent: [u32; 2],
    bytes_per_pixel: u32,
    layout: vk::ImageLayout,
    last_clear: Option<[f32; 4]>,
}

struct PoolState {
    max_sets: u32,
    live: u32,
}

struct Submission {
    command_buffer: vk::CommandBuffer,
    commands: Vec<RecordedCommand>,
    fence: vk::Fence,
}

struct HeadlessSwapchain {
    images: Vec<vk::Image>,
    next_image: u32,
}

/// What the device saw, for inspection by tests and tools.
#[derive(Debug, Default)]
pub struct HeadlessLog {
    /// Command lists in submission order.
    pub submissions: Vec<Vec<RecordedCommand>>,
    pub acquires: u32,
    /// Swapchain image index of every present.
    pub presents: Vec<u32>,
    pub device_idle_waits: u32,
    pub swapchains_created: u32,
    /// Highest number of submissions pending at once.
    pub max_in_flight: usize,
    pub validation_errors: Vec<String>,
}

pub struct HeadlessBackend {
    next_handle: u64,
    buffers: FxHashMap<vk::Buffer, HeadlessBuffer>,
    images: FxHashMap<vk::Image, HeadlessImage>,
    views: FxHashMap<vk::ImageView, vk::Image>,
    samplers: FxHashSet<vk::Sampler>,
    modules: FxHashSet<vk::ShaderModule>,
    set_layouts: FxHashMap<vk::DescriptorSetLayout, Vec<LayoutBinding>>,
    pipeline_layouts: FxHashSet<vk::PipelineLayout>,
    pipelines: FxHashSet<vk::Pipeline>,
    pools: FxHashMap<vk::DescriptorPool, PoolState>,
    descriptor_sets: FxHashMap<vk::DescriptorSet, (vk::DescriptorPool, Vec<DescriptorWrite>)>,
    fences: FxHashMap<vk::Fence, bool>,
    semaphores: FxHashMap<vk::Semaphore, bool>,
    command_pools: FxHashSet<vk::CommandPool>,
    command_buffers: FxHashMap<vk::CommandBuffer, Vec<RecordedCommand>>,
    pending: VecDeque<Submission>,
    swapchains: FxHashMap<vk::SwapchainKHR, HeadlessSwapchain>,
    surface_extent: Option<[u32; 2]>,
    acquire_script: VecDeque<AcquireOutcome>,
    present_script: VecDeque<PresentOutcome>,
    log: HeadlessLog,
}

impl Default for HeadlessBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl HeadlessBackend {
    pub fn new() -> Self {
        Self {
            next_handle: 1,
            buffers: FxHashMap::default(),
            images: FxHashMap::default(),
            views: FxHashMap::default(),
            samplers: FxHashSet::default(),
            modules: FxHashSet::default(),
            set_layouts: FxHashMap::default(),
            pipeline_layouts: FxHashSet::default(),
            pipelines: FxHashSet::default(),
            pools: FxHashMap::default(),
            descriptor_sets: FxHashMap::default(),
            fences: FxHashMap::default(),
            semaphores: FxHashMap::default(),
            command_pools: FxHashSet::default(),
            command_buffers: FxHashMap::default(),
            pending: VecDeque::new(),
            swapchains: FxHashMap::default(),
            surface_extent: None,
            acquire_script: VecDeque::new(),
            present_script: VecDeque::new(),
            log: HeadlessLog::default(),
        }
    }

    fn next_raw(&mut self) -> u64 {
        let raw = self.next_handle;
        self.next_handle += 1;
        raw
    }

    fn violation(&mut self, message: String) {
        warn!("headless validation: {}", message);
        self.log.validation_errors.push(message);
    }

    // ── Scripting ───────────────────────────────────────────

    /// Queue the result of an upcoming acquire; unscripted acquires succeed.
    pub fn script_acquire(&mut self, outcome: AcquireOutcome) {
        self.acquire_script.push_back(outcome);
    }

    /// Queue the result of an upcoming present; unscripted presents succeed.
    pub fn script_present(&mut self, outcome: PresentOutcome) {
        self.present_script.push_back(outcome);
    }

    /// Size the surface reports when the engine rebuilds without an explicit
    /// resize. `None` means "whatever you asked for".
    pub fn set_surface_extent(&mut self, extent: Option<[u32; 2]>) {
        self.surface_extent = extent;
    }

    /// Execute every pending submission, as if the GPU caught up.
    pub fn complete_all(&mut self) {
        while let Some(submission) = self.pending.pop_front() {
            self.retire(submission);
        }
    }

    // ── Inspection ──────────────────────────────────────────

    pub fn log(&self) -> &HeadlessLog {
        &self.log
    }

    pub fn buffer_contents(&self, buffer: vk::Buffer) -> Option<&[u8]> {
        self.buffers.get(&buffer).map(|b| b.data.as_slice())
    }

    pub fn image_contents(&self, image: vk::Image) -> Option<&[u8]> {
        self.images.get(&image).map(|i| i.data.as_slice())
    }

    pub fn image_layout(&self, image: vk::Image) -> Option<vk::ImageLayout> {
        self.images.get(&image).map(|i| i.layout)
    }

    pub fn image_clear_color(&self, image: vk::Image) -> Option<[f32; 4]> {
        self.images.get(&image).and_then(|i| i.last_clear)
    }

    pub fn descriptor_writes(&self, set: vk::DescriptorSet) -> Option<&[DescriptorWrite]> {
        self.descriptor_sets.get(&set).map(|(_, w)| w.as_slice())
    }

    pub fn image_for_view(&self, view: vk::ImageView) -> Option<vk::Image> {
        self.views.get(&view).copied()
    }

    pub fn live_buffers(&self) -> usize {
        self.buffers.len()
    }

    pub fn live_images(&self) -> usize {
        self.images.len()
    }

    pub fn live_samplers(&self) -> usize {
        self.samplers.len()
    }

    pub fn live_pipelines(&self) -> usize {
        self.pipelines.len()
    }

    pub fn live_descriptor_sets(&self) -> usize {
        self.descriptor_sets.len()
    }

    pub fn in_flight(&self) -> usize {
        self.pending.len()
    }

    // ── Execution ───────────────────────────────────────────

    fn retire(&mut self, submission: Submission) {
        let mut in_rendering = false;
        let mut pipeline_bound = false;
        for command in &submission.commands {
            self.execute(command, &mut in_rendering, &mut pipeline_bound);
        }
        if let Some(signaled) = self.fences.get_mut(&submission.fence) {
            *signaled = true;
        }
        debug!(command_buffer = ?submission.command_buffer, commands = submission.commands.len(), "submission retired");
    }

    fn execute(&mut self, command: &RecordedCommand, in_rendering: &mut bool, pipeline_bound: &mut bool) {
        match command {
            RecordedCommand::CopyBuffer { src, dst, region } => {
                let Some(source) = self.buffers.get(src) else {
                    return self.violation(format!("copy from destroyed buffer {:?}", src));
                };
                let start = region.src_offset as usize;
                let end = start + region.size as usize;
                if end > source.data.len() {
                    return self.violation(format!("copy source range {}..{} out of bounds", start, end));
                }
                let bytes = source.data[start..end].to_vec();
                let Some(dest) = self.buffers.get_mut(dst) else {
                    return self.violation(format!("copy into destroyed buffer {:?}", dst));
                };
                let at = region.dst_offset as usize;
                if at + bytes.len() > dest.data.len() {
                    return self.violation(format!("copy destination offset {} out of bounds", at));
                }
                dest.data[at..at + bytes.len()].copy_from_slice(&bytes);
            }

            RecordedCommand::CopyBufferToImage { src, dst, region } => {
                let Some(source) = self.buffers.get(src) else {
                    return self.violation(format!("copy from destroyed buffer {:?}", src));
                };
                let source = source.data.clone();
                let Some(image) = self.images.get_mut(dst) else {
                    return self.violation(format!("copy into destroyed image {:?}", dst));
                };
                if image.layout != vk::ImageLayout::TRANSFER_DST_OPTIMAL {
                    let layout = image.layout;
                    return self.violation(format!("buffer to image copy with image in {:?}", layout));
                }
                let bpp = image.bytes_per_pixel as usize;
                let row_len = region.image_extent[0] as usize * bpp;
                let image_row = image.extent[0] as usize * bpp;
                for row in 0..region.image_extent[1] as usize {
                    let from = region.buffer_offset as usize + row * row_len;
                    let y = region.image_offset[1] as usize + row;
                    let to = y * image_row + region.image_offset[0] as usize * bpp;
                    if from + row_len > source.len() || to + row_len > image.data.len() {
                        return self.violation("buffer to image copy out of bounds".to_string());
                    }
                    image.data[to..to + row_len].copy_from_slice(&source[from..from + row_len]);
                }
            }

            RecordedCommand::MemoryBarrier(_) => {}

            RecordedCommand::ImageBarrier(barrier) => {
                let Some(image) = self.images.get_mut(&barrier.image) else {
                    return self.violation(format!("barrier on destroyed image {:?}", barrier.image));
                };
                let current = image.layout;
                image.layout = barrier.new_layout;
                if barrier.old_layout != vk::ImageLayout::UNDEFINED && barrier.old_layout != current {
                    self.violation(format!(
                        "barrier expects {:?} but image is in {:?}",
                        barrier.old_layout, current
                    ));
                }
            }

            RecordedCommand::ClearColorImage { image, color } => {
                let Some(target) = self.images.get_mut(image) else {
                    return self.violation(format!("clear of destroyed image {:?}", image));
                };
                if target.layout != vk::ImageLayout::GENERAL {
                    let layout = target.layout;
                    return self.violation(format!("clear with image in {:?}", layout));
                }
                target.last_clear = Some(*color);
            }

            RecordedCommand::BeginRendering(info) => {
                let color_ok = self.image_layout(info.color_image)
                    == Some(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL);
                let depth_ok = self.image_layout(info.depth_image)
                    == Some(vk::ImageLayout::DEPTH_ATTACHMENT_OPTIMAL);
                if !color_ok || !depth_ok {
                    self.violation("rendering began with attachments in the wrong layout".to_string());
                }
                *in_rendering = true;
            }

            RecordedCommand::EndRendering => {
                if !*in_rendering {
                    self.violation("end rendering outside a rendering scope".to_string());
                }
                *in_rendering = false;
            }

            RecordedCommand::BindPipeline { pipeline } => {
                if !self.pipelines.contains(pipeline) {
                    self.violation(format!("bind of destroyed pipeline {:?}", pipeline));
                }
                *pipeline_bound = true;
            }

            RecordedCommand::BindDescriptorSet { set, .. } => {
                if !self.descriptor_sets.contains_key(set) {
                    self.violation(format!("bind of freed descriptor set {:?}", set));
                }
            }

            RecordedCommand::BindIndexBuffer { buffer, .. } => {
                if !self.buffers.contains_key(buffer) {
                    self.violation(format!("bind of destroyed index buffer {:?}", buffer));
                }
            }

            RecordedCommand::DrawIndexed { .. } => {
                if !*in_rendering || !*pipeline_bound {
                    self.violation("draw outside rendering or without a pipeline".to_string());
                }
            }

            RecordedCommand::BlitImage { src, dst, .. } => {
                let src_ok = self.image_layout(*src) == Some(vk::ImageLayout::TRANSFER_SRC_OPTIMAL);
                let dst_ok = self.image_layout(*dst) == Some(vk::ImageLayout::TRANSFER_DST_OPTIMAL);
                if !src_ok || !dst_ok {
                    self.violation("blit with images in the wrong layout".to_string());
                }
            }

            RecordedCommand::SetViewport(_)
            | RecordedCommand::SetScissor(_)
            | RecordedCommand::PushConstants { .. } => {}
        }
    }

    fn make_image(&mut self, extent: [u32; 2], format: vk::Format) -> vk::Image {
        let image = vk::Image::from_raw(self.next_raw());
        let bytes_per_pixel = bytes_per_pixel(format);
        self.images.insert(
            image,
            HeadlessImage {
                data: vec![0; (extent[0] * extent[1] * bytes_per_pixel) as usize],
                extent,
                bytes_per_pixel,
                layout: vk::ImageLayout::UNDEFINED,
                last_clear: None,
            },
        );
        image
    }
}

fn bytes_per_pixel(format: vk::Format) -> u32 {
    match format {
        vk::Format::R8_UNORM => 1,
        vk::Format::R8G8_UNORM => 2,
        vk::Format::R16G16B16A16_SFLOAT => 8,
        vk::Format::R32G32B32A32_SFLOAT => 16,
        _ => 4,
    }
}

impl GpuBackend for HeadlessBackend {
    fn name(&self) -> &'static str {
        "headless"
    }

    fn create_buffer(&mut self, desc: &BufferDesc) -> VkResult<BufferAllocation> {
        let raw = self.next_raw();
        let buffer = vk::Buffer::from_raw(raw);
        self.buffers.insert(
            buffer,
            HeadlessBuffer {
                data: vec![0; desc.size as usize],
                mappable: desc.mappable,
            },
        );
        let device_address = desc
            .usage
            .contains(vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS)
            .then_some(raw << 16);
        Ok(BufferAllocation {
            buffer,
            size: desc.size,
            host_coherent: desc.mappable,
            device_address,
        })
    }

    fn write_buffer(&mut self, buffer: vk::Buffer, offset: u64, data: &[u8]) -> VkResult<()> {
        let Some(target) = self.buffers.get_mut(&buffer) else {
            self.violation(format!("map of destroyed buffer {:?}", buffer));
            return Err(vk::Result::ERROR_MEMORY_MAP_FAILED);
        };
        let start = offset as usize;
        let end = start + data.len();
        if !target.mappable || end > target.data.len() {
            self.violation(format!("invalid host write {}..{} to {:?}", start, end, buffer));
            return Err(vk::Result::ERROR_MEMORY_MAP_FAILED);
        }
        target.data[start..end].copy_from_slice(data);
        Ok(())
    }

    fn destroy_buffer(&mut self, buffer: vk::Buffer) {
        if self.pending.iter().any(|s| references_buffer(&s.commands, buffer)) {
            self.violation(format!("buffer {:?} destroyed while in use by the device", buffer));
        }
        self.buffers.remove(&buffer);
    }

    fn create_image(&mut self, desc: &ImageDesc) -> VkResult<ImageAllocation> {
        let image = self.make_image(desc.extent, desc.format);
        let view = vk::ImageView::from_raw(self.next_raw());
        self.views.insert(view, image);
        Ok(ImageAllocation {
            image,
            view,
            extent: desc.extent,
            format: desc.format,
        })
    }

    fn destroy_image(&mut self, image: &ImageAllocation) {
        self.views.remove(&image.view);
        self.images.remove(&image.image);
    }

    fn create_sampler(&mut self) -> VkResult<vk::Sampler> {
        let sampler = vk::Sampler::from_raw(self.next_raw());
        self.samplers.insert(sampler);
        Ok(sampler)
    }

    fn destroy_sampler(&mut self, sampler: vk::Sampler) {
        self.samplers.remove(&sampler);
    }

    fn create_shader_module(&mut self, code: &[u32]) -> VkResult<vk::ShaderModule> {
        if code.is_empty() {
            return Err(vk::Result::ERROR_INITIALIZATION_FAILED);
        }
        let module = vk::ShaderModule::from_raw(self.next_raw());
        self.modules.insert(module);
        Ok(module)
    }

    fn destroy_shader_module(&mut self, module: vk::ShaderModule) {
        self.modules.remove(&module);
    }

    fn create_descriptor_set_layout(
        &mut self,
        bindings: &[LayoutBinding],
    ) -> VkResult<vk::DescriptorSetLayout> {
        let layout = vk::DescriptorSetLayout::from_raw(self.next_raw());
        self.set_layouts.insert(layout, bindings.to_vec());
        Ok(layout)
    }

    fn destroy_descriptor_set_layout(&mut self, layout: vk::DescriptorSetLayout) {
        self.set_layouts.remove(&layout);
    }

    fn create_pipeline_layout(
        &mut self,
        set_layout: vk::DescriptorSetLayout,
        _push_constants: &[vk::PushConstantRange],
    ) -> VkResult<vk::PipelineLayout> {
        if !self.set_layouts.contains_key(&set_layout) {
            return Err(vk::Result::ERROR_UNKNOWN);
        }
        let layout = vk::PipelineLayout::from_raw(self.next_raw());
        self.pipeline_layouts.insert(layout);
        Ok(layout)
    }

    fn destroy_pipeline_layout(&mut self, layout: vk::PipelineLayout) {
        self.pipeline_layouts.remove(&layout);
    }

    fn create_graphics_pipeline(&mut self, desc: &GraphicsPipelineDesc) -> VkResult<vk::Pipeline> {
        let modules_ok = [desc.vertex, desc.fragment]
            .iter()
            .flatten()
            .all(|m| self.modules.contains(m));
        if !modules_ok || !self.pipeline_layouts.contains(&desc.layout) {
            return Err(vk::Result::ERROR_UNKNOWN);
        }
        let pipeline = vk::Pipeline::from_raw(self.next_raw());
        self.pipelines.insert(pipeline);
        Ok(pipeline)
    }

    fn destroy_pipeline(&mut self, pipeline: vk::Pipeline) {
        self.pipelines.remove(&pipeline);
    }

    fn create_descriptor_pool(
        &mut self,
        config: &DescriptorPoolConfig,
    ) -> VkResult<vk::DescriptorPool> {
        let pool = vk::DescriptorPool::from_raw(self.next_raw());
        self.pools.insert(
            pool,
            PoolState {
                max_sets: config.max_sets,
                live: 0,
            },
        );
        Ok(pool)
    }

    fn destroy_descriptor_pool(&mut self, pool: vk::DescriptorPool) {
        self.pools.remove(&pool);
        self.descriptor_sets.retain(|_, (owner, _)| *owner != pool);
    }

    fn allocate_descriptor_set(
        &mut self,
        pool: vk::DescriptorPool,
        layout: vk::DescriptorSetLayout,
    ) -> VkResult<vk::DescriptorSet> {
        if !self.set_layouts.contains_key(&layout) {
            return Err(vk::Result::ERROR_UNKNOWN);
        }
        let state = self.pools.get_mut(&pool).ok_or(vk::Result::ERROR_UNKNOWN)?;
        if state.live >= state.max_sets {
            return Err(vk::Result::ERROR_OUT_OF_POOL_MEMORY);
        }
        state.live += 1;
        let set = vk::DescriptorSet::from_raw(self.next_raw());
        self.descriptor_sets.insert(set, (pool, Vec::new()));
        Ok(set)
    }

    fn free_descriptor_sets(
        &mut self,
        pool: vk::DescriptorPool,
        sets: &[vk::DescriptorSet],
    ) -> VkResult<()> {
        for set in sets {
            if self.descriptor_sets.remove(set).is_some() {
                if let Some(state) = self.pools.get_mut(&pool) {
                    state.live = state.live.saturating_sub(1);
                }
            }
        }
        Ok(())
    }

    fn write_descriptor_set(&mut self, set: vk::DescriptorSet, writes: &[DescriptorWrite]) {
        match self.descriptor_sets.get_mut(&set) {
            Some((_, stored)) => stored.extend_from_slice(writes),
            None => self.violation(format!("write to unknown descriptor set {:?}", set)),
        }
    }

    fn create_frame_sync(&mut self) -> VkResult<FrameSync> {
        let command_pool = vk::CommandPool::from_raw(self.next_raw());
        let command_buffer = vk::CommandBuffer::from_raw(self.next_raw());
        let image_available = vk::Semaphore::from_raw(self.next_raw());
        let render_complete = vk::Semaphore::from_raw(self.next_raw());
        let in_flight = vk::Fence::from_raw(self.next_raw());

        self.command_pools.insert(command_pool);
        self.command_buffers.insert(command_buffer, Vec::new());
        self.semaphores.insert(image_available, false);
        self.semaphores.insert(render_complete, false);
        self.fences.insert(in_flight, true);

        Ok(FrameSync {
            command_pool,
            command_buffer,
            image_available,
            render_complete,
            in_flight,
        })
    }

    fn destroy_frame_sync(&mut self, sync: &FrameSync) {
        self.command_buffers.remove(&sync.command_buffer);
        self.command_pools.remove(&sync.command_pool);
        self.semaphores.remove(&sync.image_available);
        self.semaphores.remove(&sync.render_complete);
        self.fences.remove(&sync.in_flight);
    }

    fn wait_for_fence(&mut self, fence: vk::Fence, _timeout_ns: u64) -> VkResult<()> {
        loop {
            match self.fences.get(&fence) {
                None => return Err(vk::Result::ERROR_UNKNOWN),
                Some(true) => return Ok(()),
                Some(false) => {}
            }
            match self.pending.pop_front() {
                Some(submission) => self.retire(submission),
                None => {
                    self.violation(format!("wait on fence {:?} that nothing will signal", fence));
                    return Err(vk::Result::TIMEOUT);
                }
            }
        }
    }

    fn reset_fence(&mut self, fence: vk::Fence) -> VkResult<()> {
        if self.pending.iter().any(|s| s.fence == fence) {
            self.violation(format!("reset of fence {:?} still owned by a submission", fence));
        }
        let signaled = self.fences.get_mut(&fence).ok_or(vk::Result::ERROR_UNKNOWN)?;
        *signaled = false;
        Ok(())
    }

    fn fence_signaled(&mut self, fence: vk::Fence) -> VkResult<bool> {
        self.fences.get(&fence).copied().ok_or(vk::Result::ERROR_UNKNOWN)
    }

    fn record(
        &mut self,
        command_buffer: vk::CommandBuffer,
        commands: &[RecordedCommand],
    ) -> VkResult<()> {
        if self.pending.iter().any(|s| s.command_buffer == command_buffer) {
            self.violation(format!(
                "command buffer {:?} re-recorded while in flight",
                command_buffer
            ));
        }
        let stored = self
            .command_buffers
            .get_mut(&command_buffer)
            .ok_or(vk::Result::ERROR_UNKNOWN)?;
        stored.clear();
        stored.extend_from_slice(commands);
        Ok(())
    }

    fn submit(&mut self, submit: &SubmitDesc) -> VkResult<()> {
        match self.fences.get(&submit.fence) {
            Some(false) => {}
            Some(true) => self.violation(format!("submit with signaled fence {:?}", submit.fence)),
            None => return Err(vk::Result::ERROR_UNKNOWN),
        }
        match self.semaphores.get_mut(&submit.wait_semaphore) {
            Some(signaled) if *signaled => *signaled = false,
            _ => self.violation(format!(
                "submit waits on unsignaled semaphore {:?}",
                submit.wait_semaphore
            )),
        }
        if let Some(signaled) = self.semaphores.get_mut(&submit.signal_semaphore) {
            *signaled = true;
        }

        let commands = self
            .command_buffers
            .get(&submit.command_buffer)
            .cloned()
            .ok_or(vk::Result::ERROR_UNKNOWN)?;
        self.log.submissions.push(commands.clone());
        self.pending.push_back(Submission {
            command_buffer: submit.command_buffer,
            commands,
            fence: submit.fence,
        });
        self.log.max_in_flight = self.log.max_in_flight.max(self.pending.len());
        Ok(())
    }

    fn device_wait_idle(&mut self) -> VkResult<()> {
        self.complete_all();
        self.log.device_idle_waits += 1;
        Ok(())
    }

    fn surface_extent(&mut self) -> VkResult<Option<[u32; 2]>> {
        Ok(self.surface_extent)
    }

    fn create_swapchain(&mut self, request: &SwapchainRequest) -> VkResult<SwapchainImages> {
        let extent = self.surface_extent.unwrap_or(request.extent);
        let swapchain = vk::SwapchainKHR::from_raw(self.next_raw());
        let count = request.image_count.max(2);
        let mut images = Vec::with_capacity(count as usize);
        let mut views = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let image = self.make_image(extent, SWAPCHAIN_FORMAT);
            let view = vk::ImageView::from_raw(self.next_raw());
            self.views.insert(view, image);
            images.push(image);
            views.push(view);
        }
        self.swapchains.insert(
            swapchain,
            HeadlessSwapchain {
                images: images.clone(),
                next_image: 0,
            },
        );
        self.log.swapchains_created += 1;
        Ok(SwapchainImages {
            swapchain,
            format: SWAPCHAIN_FORMAT,
            extent,
            images,
            views,
        })
    }

    fn destroy_swapchain(&mut self, swapchain: &SwapchainImages) {
        if let Some(state) = self.swapchains.remove(&swapchain.swapchain) {
            for image in state.images {
                self.images.remove(&image);
            }
        }
        for view in &swapchain.views {
            self.views.remove(view);
        }
    }

    fn acquire_next_image(
        &mut self,
        swapchain: vk::SwapchainKHR,
        signal: vk::Semaphore,
    ) -> VkResult<AcquireOutcome> {
        self.log.acquires += 1;
        if let Some(AcquireOutcome::Stale) = self.acquire_script.front() {
            self.acquire_script.pop_front();
            return Ok(AcquireOutcome::Stale);
        }
        self.acquire_script.pop_front();

        let state = self
            .swapchains
            .get_mut(&swapchain)
            .ok_or(vk::Result::ERROR_SURFACE_LOST_KHR)?;
        let index = state.next_image;
        state.next_image = (state.next_image + 1) % state.images.len() as u32;
        match self.semaphores.get_mut(&signal) {
            Some(signaled) if !*signaled => *signaled = true,
            _ => self.violation(format!("acquire signals busy semaphore {:?}", signal)),
        }
        Ok(AcquireOutcome::Image(index))
    }

    fn present(
        &mut self,
        swapchain: vk::SwapchainKHR,
        image_index: u32,
        wait: vk::Semaphore,
    ) -> VkResult<PresentOutcome> {
        if !self.swapchains.contains_key(&swapchain) {
            return Err(vk::Result::ERROR_SURFACE_LOST_KHR);
        }
        match self.semaphores.get_mut(&wait) {
            Some(signaled) if *signaled => *signaled = false,
            _ => self.violation(format!("present waits on unsignaled semaphore {:?}", wait)),
        }
        self.log.presents.push(image_index);
        Ok(self.present_script.pop_front().unwrap_or(PresentOutcome::Presented))
    }
}

fn references_buffer(commands: &[RecordedCommand], buffer: vk::Buffer) -> bool {
    commands.iter().any(|c| match c {
        RecordedCommand::CopyBuffer { src, dst, .. } => *src == buffer || *dst == buffer,
        RecordedCommand::CopyBufferToImage { src, .. } => *src == buffer,
        RecordedCommand::BindIndexBuffer { buffer: b, .. } => *b == buffer,
        _ => false,
    })
}
