//! The engine facade. Owns every table, cache and per-frame object, and
//! drives one frame at a time against a [`GpuBackend`].

use std::collections::BTreeMap;

use ash::vk;
use kiln_core::{
    BufferHandle, DescriptorHandle, KilnConfig, ProgramHandle, ShaderHandle, TextureHandle,
};
use kiln_protocol::resource::{
    BufferKind, DescriptorResource, DescriptorType, ShaderStage, TextureFormat, TextureInfo,
};
use kiln_protocol::{DrawBuilder, DrawPushConstants, Frame, RecordedCommand, ShaderReflection};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::backend::{
    AcquireOutcome, BufferDesc, GpuBackend, GraphicsPipelineDesc, ImageDesc, LayoutBinding,
    PresentOutcome, SubmitDesc,
};
use crate::batch::{prepare_batch, record_batch, transition_textures, BatchTarget};
use crate::cache::{DescriptorSetCache, PipelineCache};
use crate::error::{RenderError, VkResultExt};
use crate::frame::FrameSynchronizer;
use crate::shader::SPIRV_MAGIC;
use crate::slots::{
    BufferSlot, DescriptorSlot, PendingLayouts, ProgramSlot, ResourceTables, ShaderSlot,
    TextureSlot,
};
use crate::swapchain::{DirtyFlags, SwapchainState, COLOR_FORMAT, DEPTH_FORMAT};
use crate::upload::{apply_uploads, DirtyEntry, UploadQueue, UploadTarget};

/// What happened to the draws handed to [`RenderContext::frame`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameStatus {
    Presented,
    /// Submitted, but the present reported a stale swapchain; it will be
    /// rebuilt at the start of the next frame.
    PresentStale,
    /// Nothing was submitted (stale acquire or zero-area surface).
    Dropped,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RenderStats {
    pub frames_presented: u64,
    pub frames_dropped: u64,
    pub present_stale: u64,
    pub draws_recorded: u64,
    pub uploads_direct: u64,
    pub uploads_staged: u64,
    /// Updates dropped because their target was destroyed first.
    pub uploads_skipped: u64,
    pub upload_bytes: u64,
    pub swapchain_rebuilds: u64,
    pub descriptor_set_hits: u64,
    pub descriptor_set_misses: u64,
}

pub struct RenderContext<B: GpuBackend> {
    backend: B,
    config: KilnConfig,
    tables: ResourceTables,
    uploads: UploadQueue,
    descriptor_sets: DescriptorSetCache,
    pipelines: PipelineCache,
    frames: FrameSynchronizer,
    swapchain: SwapchainState,
    frame: Frame,
    default_texture: TextureHandle,
    stats: RenderStats,
    shut_down: bool,
}

impl<B: GpuBackend> RenderContext<B> {
    /// Creates the descriptor pool, both frame contexts, the swapchain with
    /// its offscreen targets, and the default white texture.
    pub fn new(mut backend: B, config: KilnConfig, extent: [u32; 2]) -> Result<Self, RenderError> {
        config.validate()?;

        let pool = backend
            .create_descriptor_pool(&config.descriptors)
            .vk("vkCreateDescriptorPool")?;
        let frames = FrameSynchronizer::new(&mut backend)?;
        let swapchain = SwapchainState::new(&mut backend, extent, &config.swapchain)?;

        let mut ctx = Self {
            tables: ResourceTables::new(&config.limits),
            uploads: UploadQueue::default(),
            descriptor_sets: DescriptorSetCache::new(pool),
            pipelines: PipelineCache::default(),
            frames,
            swapchain,
            frame: Frame::with_capacity(config.limits.max_draws),
            default_texture: TextureHandle::NONE,
            stats: RenderStats::default(),
            shut_down: false,
            backend,
            config,
        };

        let size = ctx.config.render.default_texture_size;
        let info = TextureInfo::new(size, size, TextureFormat::Rgba8Unorm);
        let white = ctx.create_texture(info)?;
        ctx.update_texture(white, 0, &vec![0xFF; info.size_bytes() as usize])?;
        ctx.default_texture = white;

        info!(
            backend = ctx.backend.name(),
            width = ctx.swapchain.extent()[0],
            height = ctx.swapchain.extent()[1],
            max_draws = ctx.config.limits.max_draws,
            "render context created"
        );
        Ok(ctx)
    }

    // ── Textures ────────────────────────────────────────────

    pub fn create_texture(&mut self, info: TextureInfo) -> Result<TextureHandle, RenderError> {
        if info.width == 0 || info.height == 0 {
            return Err(RenderError::ZeroSize("texture"));
        }
        let alloc = self
            .backend
            .create_image(&ImageDesc {
                extent: [info.width, info.height],
                format: info.format.to_vk(),
                usage: info.usage(),
                aspect: vk::ImageAspectFlags::COLOR,
            })
            .vk("vkCreateImage")?;
        let handle = match self.tables.textures.insert(TextureSlot {
            alloc,
            info,
            layout: vk::ImageLayout::UNDEFINED,
        }) {
            Ok(handle) => handle,
            Err(e) => {
                self.backend.destroy_image(&alloc);
                return Err(e.into());
            }
        };
        debug!(%handle, width = info.width, height = info.height, format = ?info.format, "texture created");
        Ok(handle)
    }

    /// Queues a write of whole rows starting at byte `offset`.
    pub fn update_texture(
        &mut self,
        handle: TextureHandle,
        offset: u64,
        data: &[u8],
    ) -> Result<(), RenderError> {
        let info = self.tables.texture(handle)?.info;
        let size = data.len() as u64;
        let capacity = info.size_bytes();
        if offset.checked_add(size).map_or(true, |end| end > capacity) {
            error!(%handle, offset, size, capacity, "texture update out of range");
            return Err(RenderError::UpdateOutOfRange {
                kind: "texture",
                offset,
                size,
                capacity,
            });
        }
        let row_pitch = info.row_pitch();
        if offset % row_pitch != 0 || size % row_pitch != 0 {
            error!(%handle, offset, size, row_pitch, "texture update does not cover whole rows");
            return Err(RenderError::UnalignedTextureUpdate {
                row_pitch,
                offset,
                size,
            });
        }
        if data.is_empty() {
            return Ok(());
        }
        self.uploads.push(DirtyEntry {
            target: UploadTarget::Texture(handle),
            offset,
            data: data.to_vec(),
        });
        Ok(())
    }

    /// Destroys the texture, its sampler and every cached descriptor set
    /// that references it. The default texture cannot be destroyed.
    pub fn destroy_texture(&mut self, handle: TextureHandle) -> Result<(), RenderError> {
        if handle == self.default_texture {
            return Err(RenderError::invalid(handle));
        }
        let slot = self
            .tables
            .textures
            .remove(handle)
            .ok_or_else(|| RenderError::invalid(handle))?;

        let default_texture = self.default_texture;
        let referencing = self.descriptors_where(|resource| {
            ResourceTables::referenced_texture(resource, default_texture) == Some(handle)
        });
        self.evict_descriptors(&referencing)?;
        self.descriptor_sets.destroy_sampler(&mut self.backend, handle);
        self.backend.destroy_image(&slot.alloc);
        debug!(%handle, "texture destroyed");
        Ok(())
    }

    // ── Buffers ─────────────────────────────────────────────

    pub fn create_uniform_buffer(
        &mut self,
        size: u64,
        data: Option<&[u8]>,
    ) -> Result<BufferHandle, RenderError> {
        self.create_buffer(BufferKind::Uniform, size, data)
    }

    /// Vertex data is read by shaders through its device address.
    pub fn create_vertex_buffer(
        &mut self,
        size: u64,
        data: Option<&[u8]>,
    ) -> Result<BufferHandle, RenderError> {
        self.create_buffer(BufferKind::Vertex, size, data)
    }

    /// 32-bit indices.
    pub fn create_index_buffer(
        &mut self,
        size: u64,
        data: Option<&[u8]>,
    ) -> Result<BufferHandle, RenderError> {
        self.create_buffer(BufferKind::Index, size, data)
    }

    pub fn create_storage_buffer(
        &mut self,
        size: u64,
        data: Option<&[u8]>,
    ) -> Result<BufferHandle, RenderError> {
        self.create_buffer(BufferKind::Storage, size, data)
    }

    fn create_buffer(
        &mut self,
        kind: BufferKind,
        size: u64,
        data: Option<&[u8]>,
    ) -> Result<BufferHandle, RenderError> {
        if size == 0 {
            return Err(RenderError::ZeroSize(kind.name()));
        }
        if let Some(data) = data {
            if data.len() as u64 > size {
                return Err(RenderError::UpdateOutOfRange {
                    kind: kind.name(),
                    offset: 0,
                    size: data.len() as u64,
                    capacity: size,
                });
            }
        }

        let alloc = self
            .backend
            .create_buffer(&BufferDesc {
                size,
                usage: kind.usage(),
                mappable: kind.mappable(),
            })
            .vk("vkCreateBuffer")?;
        let handle = match self.tables.buffers.insert(BufferSlot { alloc, kind }) {
            Ok(handle) => handle,
            Err(e) => {
                self.backend.destroy_buffer(alloc.buffer);
                return Err(e.into());
            }
        };
        debug!(%handle, kind = kind.name(), size, coherent = alloc.host_coherent, "buffer created");

        if let Some(data) = data {
            self.update_buffer(handle, 0, data)?;
        }
        Ok(handle)
    }

    pub fn update_buffer(
        &mut self,
        handle: BufferHandle,
        offset: u64,
        data: &[u8],
    ) -> Result<(), RenderError> {
        let slot = self.tables.buffer(handle)?;
        let size = data.len() as u64;
        let capacity = slot.alloc.size;
        if offset.checked_add(size).map_or(true, |end| end > capacity) {
            error!(%handle, offset, size, capacity, "buffer update out of range");
            return Err(RenderError::UpdateOutOfRange {
                kind: slot.kind.name(),
                offset,
                size,
                capacity,
            });
        }
        if data.is_empty() {
            return Ok(());
        }
        self.uploads.push(DirtyEntry {
            target: UploadTarget::Buffer(handle),
            offset,
            data: data.to_vec(),
        });
        Ok(())
    }

    pub fn destroy_buffer(&mut self, handle: BufferHandle) -> Result<(), RenderError> {
        let slot = self
            .tables
            .buffers
            .remove(handle)
            .ok_or_else(|| RenderError::invalid(handle))?;
        let referencing =
            self.descriptors_where(|resource| *resource == DescriptorResource::Buffer(handle));
        self.evict_descriptors(&referencing)?;
        self.backend.destroy_buffer(slot.alloc.buffer);
        debug!(%handle, "buffer destroyed");
        Ok(())
    }

    // ── Shaders and programs ────────────────────────────────

    pub fn create_shader(
        &mut self,
        code: &[u32],
        reflection: ShaderReflection,
    ) -> Result<ShaderHandle, RenderError> {
        match code.first() {
            Some(&SPIRV_MAGIC) => {}
            Some(&word) => {
                return Err(RenderError::InvalidSpirv(format!(
                    "bad magic number {:#010x}",
                    word
                )))
            }
            None => return Err(RenderError::InvalidSpirv("empty module".into())),
        }
        reflection.validate()?;

        let module = self
            .backend
            .create_shader_module(code)
            .vk("vkCreateShaderModule")?;
        let stage = reflection.stage;
        let handle = match self.tables.shaders.insert(ShaderSlot { module, reflection }) {
            Ok(handle) => handle,
            Err(e) => {
                self.backend.destroy_shader_module(module);
                return Err(e.into());
            }
        };
        debug!(%handle, ?stage, words = code.len(), "shader created");
        Ok(handle)
    }

    /// Programs built from the shader keep working; the pipeline no longer
    /// needs the module.
    pub fn destroy_shader(&mut self, handle: ShaderHandle) -> Result<(), RenderError> {
        let slot = self
            .tables
            .shaders
            .remove(handle)
            .ok_or_else(|| RenderError::invalid(handle))?;
        self.backend.destroy_shader_module(slot.module);
        debug!(%handle, "shader destroyed");
        Ok(())
    }

    /// Links up to two stages into a pipeline. Bindings with the same index
    /// are merged across stages and must agree on their type.
    pub fn create_program(
        &mut self,
        vertex: Option<ShaderHandle>,
        fragment: Option<ShaderHandle>,
    ) -> Result<ProgramHandle, RenderError> {
        if vertex.is_none() && fragment.is_none() {
            return Err(RenderError::EmptyProgram);
        }

        let mut stages = Vec::with_capacity(2);
        for (handle, expected) in [(vertex, ShaderStage::Vertex), (fragment, ShaderStage::Fragment)] {
            let Some(handle) = handle else { continue };
            let slot = self.tables.shader(handle)?;
            if slot.reflection.stage != expected {
                return Err(RenderError::StageMismatch {
                    expected: stage_name(expected),
                    actual: stage_name(slot.reflection.stage),
                });
            }
            stages.push(slot);
        }

        let mut bindings: BTreeMap<u32, LayoutBinding> = BTreeMap::new();
        let mut push_ranges: BTreeMap<(u32, u32), vk::ShaderStageFlags> = BTreeMap::new();
        let mut all_stages = vk::ShaderStageFlags::empty();
        for slot in &stages {
            let stage = slot.reflection.stage.to_vk();
            all_stages |= stage;
            for reflected in &slot.reflection.bindings {
                let ty = reflected.descriptor_type.to_vk();
                match bindings.get_mut(&reflected.binding) {
                    Some(existing) if existing.descriptor_type != ty => {
                        return Err(RenderError::ConflictingBinding {
                            binding: reflected.binding,
                            first: existing.descriptor_type,
                            second: ty,
                        });
                    }
                    Some(existing) => {
                        existing.stages |= stage;
                        existing.count = existing.count.max(reflected.count);
                    }
                    None => {
                        bindings.insert(
                            reflected.binding,
                            LayoutBinding {
                                binding: reflected.binding,
                                descriptor_type: ty,
                                count: reflected.count,
                                stages: stage,
                            },
                        );
                    }
                }
            }
            for range in &slot.reflection.push_constants {
                *push_ranges
                    .entry((range.offset, range.size))
                    .or_insert(vk::ShaderStageFlags::empty()) |= stage;
            }
        }
        // Every draw pushes the same block, so a program that declares
        // nothing still gets a range covering it.
        if push_ranges.is_empty() {
            push_ranges.insert((0, DrawPushConstants::SIZE), all_stages);
        }
        let push_stages = push_ranges
            .values()
            .fold(vk::ShaderStageFlags::empty(), |acc, s| acc | *s);
        let ranges: Vec<vk::PushConstantRange> = push_ranges
            .iter()
            .map(|(&(offset, size), &stage_flags)| vk::PushConstantRange {
                stage_flags,
                offset,
                size,
            })
            .collect();
        let bindings: Vec<LayoutBinding> = bindings.into_values().collect();
        let vertex_module = vertex.and_then(|h| self.tables.shaders.get(h)).map(|s| s.module);
        let fragment_module = fragment.and_then(|h| self.tables.shaders.get(h)).map(|s| s.module);

        let set_layout = self
            .backend
            .create_descriptor_set_layout(&bindings)
            .vk("vkCreateDescriptorSetLayout")?;
        let pipeline_layout = match self.backend.create_pipeline_layout(set_layout, &ranges) {
            Ok(layout) => layout,
            Err(e) => {
                self.backend.destroy_descriptor_set_layout(set_layout);
                return Err(e).vk("vkCreatePipelineLayout");
            }
        };
        let pipeline = match self.backend.create_graphics_pipeline(&GraphicsPipelineDesc {
            layout: pipeline_layout,
            vertex: vertex_module,
            fragment: fragment_module,
            color_format: COLOR_FORMAT,
            depth_format: DEPTH_FORMAT,
        }) {
            Ok(pipeline) => pipeline,
            Err(e) => {
                self.backend.destroy_pipeline_layout(pipeline_layout);
                self.backend.destroy_descriptor_set_layout(set_layout);
                return Err(e).vk("vkCreateGraphicsPipelines");
            }
        };

        let binding_count = bindings.len();
        let handle = match self.tables.programs.insert(ProgramSlot {
            set_layout,
            pipeline_layout,
            bindings,
            push_stages,
        }) {
            Ok(handle) => handle,
            Err(e) => {
                self.backend.destroy_pipeline(pipeline);
                self.backend.destroy_pipeline_layout(pipeline_layout);
                self.backend.destroy_descriptor_set_layout(set_layout);
                return Err(e.into());
            }
        };
        self.pipelines.insert(pipeline_layout, pipeline);
        debug!(%handle, bindings = binding_count, push_ranges = ranges.len(), "program created");
        Ok(handle)
    }

    pub fn destroy_program(&mut self, handle: ProgramHandle) -> Result<(), RenderError> {
        let slot = self
            .tables
            .programs
            .remove(handle)
            .ok_or_else(|| RenderError::invalid(handle))?;
        self.descriptor_sets
            .evict_program(&mut self.backend, handle)?;
        if let Some(pipeline) = self.pipelines.remove(slot.pipeline_layout) {
            self.backend.destroy_pipeline(pipeline);
        }
        self.backend.destroy_pipeline_layout(slot.pipeline_layout);
        self.backend.destroy_descriptor_set_layout(slot.set_layout);
        debug!(%handle, "program destroyed");
        Ok(())
    }

    // ── Descriptors ─────────────────────────────────────────

    pub fn create_descriptor(
        &mut self,
        name: impl Into<String>,
        descriptor_type: DescriptorType,
        resource: DescriptorResource,
    ) -> Result<DescriptorHandle, RenderError> {
        if !resource.compatible_with(descriptor_type) {
            return Err(RenderError::IncompatibleResource(descriptor_type));
        }
        match resource {
            DescriptorResource::Buffer(buffer) => {
                self.tables.buffer(buffer)?;
            }
            DescriptorResource::Texture(Some(texture)) => {
                self.tables.texture(texture)?;
            }
            DescriptorResource::Texture(None) => {}
            DescriptorResource::StorageImage(texture) => {
                if !self.tables.texture(texture)?.info.storage {
                    return Err(RenderError::IncompatibleResource(descriptor_type));
                }
            }
        }

        let name = name.into();
        let handle = self.tables.descriptors.insert(DescriptorSlot {
            name: name.clone(),
            descriptor_type,
            resource,
        })?;
        debug!(%handle, name = %name, ?descriptor_type, "descriptor created");
        Ok(handle)
    }

    pub fn destroy_descriptor(&mut self, handle: DescriptorHandle) -> Result<(), RenderError> {
        self.tables
            .descriptors
            .remove(handle)
            .ok_or_else(|| RenderError::invalid(handle))?;
        self.descriptor_sets
            .evict_descriptor(&mut self.backend, handle)?;
        debug!(%handle, "descriptor destroyed");
        Ok(())
    }

    fn descriptors_where(
        &self,
        mut matches: impl FnMut(&DescriptorResource) -> bool,
    ) -> Vec<DescriptorHandle> {
        self.tables
            .descriptors
            .iter()
            .filter(|(_, slot)| matches(&slot.resource))
            .map(|(handle, _)| handle)
            .collect()
    }

    fn evict_descriptors(&mut self, descriptors: &[DescriptorHandle]) -> Result<(), RenderError> {
        if descriptors.is_empty() {
            return Ok(());
        }
        self.descriptor_sets.evict(&mut self.backend, |key| {
            key.descriptors.iter().any(|d| descriptors.contains(d))
        })?;
        Ok(())
    }

    // ── Draws ───────────────────────────────────────────────

    pub fn begin_draw(&self) -> DrawBuilder {
        DrawBuilder::new()
    }

    /// Finalizes `draw` for `program` and appends it to the current frame.
    pub fn submit(&mut self, draw: DrawBuilder, program: ProgramHandle) -> Result<(), RenderError> {
        if self.shut_down {
            return Err(RenderError::ShutDown);
        }
        let draw = draw.build(program)?;

        let program_slot = self.tables.program(program)?;
        self.tables.buffer(draw.vertex_buffer)?;
        self.tables.buffer(draw.index_buffer)?;
        if !draw.instance_buffer.is_none() {
            self.tables.buffer(draw.instance_buffer)?;
        }
        if draw.descriptors.len() != program_slot.bindings.len() {
            error!(%program, supplied = draw.descriptors.len(), "descriptor count does not match program bindings");
            return Err(RenderError::BindingCountMismatch {
                program: program.to_string(),
                expected: program_slot.bindings.len(),
                supplied: draw.descriptors.len(),
            });
        }
        for (binding, &handle) in program_slot.bindings.iter().zip(draw.descriptors.iter()) {
            let descriptor = self.tables.descriptor(handle)?;
            let expected = DescriptorType::from_vk(binding.descriptor_type)
                .ok_or(RenderError::IncompatibleResource(descriptor.descriptor_type))?;
            if descriptor.descriptor_type != expected {
                error!(%program, descriptor = %handle, binding = binding.binding, "descriptor type does not match binding");
                return Err(RenderError::DescriptorTypeMismatch {
                    descriptor: format!("{} ({})", handle, descriptor.name),
                    binding: binding.binding,
                    expected,
                    actual: descriptor.descriptor_type,
                });
            }
            // The resource may have been destroyed after the descriptor was made.
            match descriptor.resource {
                DescriptorResource::Buffer(buffer) => {
                    self.tables.buffer(buffer)?;
                }
                DescriptorResource::Texture(Some(texture))
                | DescriptorResource::StorageImage(texture) => {
                    self.tables.texture(texture)?;
                }
                DescriptorResource::Texture(None) => {}
            }
        }

        self.frame.push(draw)?;
        Ok(())
    }

    // ── Frame ───────────────────────────────────────────────

    /// Uploads pending data, records and submits every submitted draw, and
    /// presents. The draw list is empty afterwards whatever the outcome.
    pub fn frame(&mut self) -> Result<FrameStatus, RenderError> {
        if self.shut_down {
            return Err(RenderError::ShutDown);
        }
        let result = self.run_frame();
        self.frame.clear();
        result
    }

    fn run_frame(&mut self) -> Result<FrameStatus, RenderError> {
        // Rebuild (a full device-idle stop) before anything else touches
        // the swapchain.
        let was_dirty = !self.swapchain.dirty().is_empty();
        let usable = self.swapchain.rebuild_if_dirty(&mut self.backend)?;
        if was_dirty && self.swapchain.dirty().is_empty() {
            self.frames.release_retired(&mut self.backend);
            self.stats.swapchain_rebuilds = self.swapchain.rebuilds();
        }
        if !usable {
            self.stats.frames_dropped += 1;
            return Ok(FrameStatus::Dropped);
        }

        // Every lookup and descriptor allocation happens here, before the
        // frame context is waited on or an image acquired, so a draw whose
        // resources were destroyed since submit fails without side effects.
        let batch = prepare_batch(
            &mut self.backend,
            &self.tables,
            &mut self.descriptor_sets,
            &self.pipelines,
            self.default_texture,
            &self.frame,
        )?;

        let timeout = self.config.render.fence_timeout_ns();
        self.frames.wait_current(&mut self.backend, timeout)?;

        let (Some(images), Some(targets)) = (self.swapchain.images(), self.swapchain.targets())
        else {
            self.stats.frames_dropped += 1;
            return Ok(FrameStatus::Dropped);
        };
        let swapchain = images.swapchain;

        // Uploads and texture transitions are built before the acquire too.
        // The queue and the tracked layouts only change once the submit has
        // gone through; until then a failed or dropped frame leaves both
        // as they were.
        let mut commands: Vec<RecordedCommand> = Vec::new();
        let mut layouts = PendingLayouts::default();
        let upload_report = apply_uploads(
            &mut self.backend,
            &self.tables,
            self.uploads.entries(),
            &mut layouts,
            &mut commands,
            &mut self.frames.current_mut().retired_staging,
        )?;
        transition_textures(&batch, &mut layouts, &mut commands);

        let signal = self.frames.current().sync.image_available;
        let image_index = match self
            .backend
            .acquire_next_image(swapchain, signal)
            .vk("vkAcquireNextImageKHR")?
        {
            AcquireOutcome::Image(index) => index,
            AcquireOutcome::Stale => {
                warn!(frame = self.frames.current_index(), "swapchain stale on acquire, dropping frame");
                self.swapchain.mark_stale();
                self.stats.frames_dropped += 1;
                return Ok(FrameStatus::Dropped);
            }
        };

        let target = BatchTarget {
            targets,
            swapchain_image: images.images[image_index as usize],
            swapchain_extent: images.extent,
            clear_color: self.config.render.clear_color,
        };
        let batch_report = record_batch(&batch, &target, &mut commands);

        let sync = self.frames.current().sync;
        self.frames.begin_submission(&mut self.backend)?;
        self.backend
            .record(sync.command_buffer, &commands)
            .vk("vkEndCommandBuffer")?;
        self.backend
            .submit(&SubmitDesc {
                command_buffer: sync.command_buffer,
                wait_semaphore: sync.image_available,
                wait_stage: vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT,
                signal_semaphore: sync.render_complete,
                fence: sync.in_flight,
            })
            .vk("vkQueueSubmit2")?;
        self.uploads.clear();
        layouts.commit(&mut self.tables);
        let submitted_frame = self.frames.current_index();
        self.frames.advance();

        self.stats.draws_recorded += batch_report.draws as u64;
        self.stats.uploads_direct += upload_report.direct as u64;
        self.stats.uploads_staged += upload_report.staged as u64;
        self.stats.uploads_skipped += upload_report.skipped as u64;
        self.stats.upload_bytes += upload_report.bytes;
        self.stats.descriptor_set_hits = self.descriptor_sets.hits();
        self.stats.descriptor_set_misses = self.descriptor_sets.misses();

        let status = match self
            .backend
            .present(swapchain, image_index, sync.render_complete)
            .vk("vkQueuePresentKHR")?
        {
            PresentOutcome::Presented => {
                self.stats.frames_presented += 1;
                FrameStatus::Presented
            }
            PresentOutcome::Stale => {
                warn!(frame = submitted_frame, "swapchain stale on present");
                self.swapchain.mark_stale();
                self.stats.present_stale += 1;
                FrameStatus::PresentStale
            }
        };
        debug!(
            frame = submitted_frame,
            image = image_index,
            draws = batch_report.draws,
            commands = commands.len(),
            "frame submitted"
        );
        Ok(status)
    }

    /// Window size changed; the swapchain is rebuilt at the next frame.
    pub fn resize(&mut self, width: u32, height: u32) {
        self.swapchain.request_resize(width, height);
    }

    /// Blocks until the device is idle and frees every retired staging buffer.
    pub fn wait_idle(&mut self) -> Result<(), RenderError> {
        self.backend.device_wait_idle().vk("vkDeviceWaitIdle")?;
        self.frames.release_retired(&mut self.backend);
        Ok(())
    }

    // ── Inspection ──────────────────────────────────────────

    pub fn stats(&self) -> RenderStats {
        self.stats
    }

    /// Index of the frame context the next frame records into.
    pub fn current_frame(&self) -> usize {
        self.frames.current_index()
    }

    pub fn dirty_flags(&self) -> DirtyFlags {
        self.swapchain.dirty()
    }

    pub fn descriptor_set_cache_len(&self) -> usize {
        self.descriptor_sets.len()
    }

    /// The pipeline draws with `program` bind, looked up in the pipeline
    /// cache by the program's layout.
    pub fn pipeline(&self, program: ProgramHandle) -> Option<vk::Pipeline> {
        let slot = self.tables.programs.get(program)?;
        self.pipelines.get(slot.pipeline_layout)
    }

    /// The cached set for this program and descriptor list, if one was built.
    pub fn descriptor_set(
        &self,
        program: ProgramHandle,
        descriptors: &[DescriptorHandle],
    ) -> Option<vk::DescriptorSet> {
        self.descriptor_sets.get(program, descriptors)
    }

    pub fn pipeline_cache_len(&self) -> usize {
        self.pipelines.len()
    }

    pub fn sampler_count(&self) -> usize {
        self.descriptor_sets.sampler_count()
    }

    /// Frame contexts whose GPU work has not completed.
    pub fn in_flight(&mut self) -> Result<usize, RenderError> {
        self.frames.in_flight(&mut self.backend)
    }

    pub fn pending_uploads(&self) -> usize {
        self.uploads.entries().len()
    }

    pub fn queued_draws(&self) -> usize {
        self.frame.len()
    }

    pub fn default_texture(&self) -> TextureHandle {
        self.default_texture
    }

    pub fn config(&self) -> &KilnConfig {
        &self.config
    }

    pub fn extent(&self) -> [u32; 2] {
        self.swapchain.extent()
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    pub fn buffer_raw(&self, handle: BufferHandle) -> Result<vk::Buffer, RenderError> {
        Ok(self.tables.buffer(handle)?.alloc.buffer)
    }

    pub fn texture_image(&self, handle: TextureHandle) -> Result<vk::Image, RenderError> {
        Ok(self.tables.texture(handle)?.alloc.image)
    }

    /// Swapchain and offscreen color images, for inspection.
    pub fn color_target(&self) -> Option<vk::Image> {
        self.swapchain.targets().map(|t| t.color.image)
    }

    // ── Shutdown ────────────────────────────────────────────

    /// Waits for the device and destroys everything the context owns. Later
    /// frames and submissions fail with [`RenderError::ShutDown`].
    pub fn shutdown(&mut self) -> Result<(), RenderError> {
        self.release_all()
    }

    fn release_all(&mut self) -> Result<(), RenderError> {
        if self.shut_down {
            return Ok(());
        }
        self.shut_down = true;
        self.backend.device_wait_idle().vk("vkDeviceWaitIdle")?;
        self.frames.release_retired(&mut self.backend);

        // Reverse dependency order: sets and programs before the shaders,
        // images and buffers they were built from.
        self.tables.descriptors.drain();
        self.descriptor_sets.destroy(&mut self.backend);
        for (_, program) in self.tables.programs.drain() {
            if let Some(pipeline) = self.pipelines.remove(program.pipeline_layout) {
                self.backend.destroy_pipeline(pipeline);
            }
            self.backend.destroy_pipeline_layout(program.pipeline_layout);
            self.backend.destroy_descriptor_set_layout(program.set_layout);
        }
        for (_, shader) in self.tables.shaders.drain() {
            self.backend.destroy_shader_module(shader.module);
        }
        for (_, texture) in self.tables.textures.drain() {
            self.backend.destroy_image(&texture.alloc);
        }
        for (_, buffer) in self.tables.buffers.drain() {
            self.backend.destroy_buffer(buffer.alloc.buffer);
        }
        self.frames.destroy(&mut self.backend);
        self.swapchain.destroy(&mut self.backend);
        info!(frames = self.frames.submitted(), "render context shut down");
        Ok(())
    }
}

impl<B: GpuBackend> Drop for RenderContext<B> {
    fn drop(&mut self) {
        if let Err(e) = self.release_all() {
            error!("failed to release render context: {}", e);
        }
    }
}

fn stage_name(stage: ShaderStage) -> &'static str {
    match stage {
        ShaderStage::Vertex => "vertex",
        ShaderStage::Fragment => "fragment",
    }
}
