use ash::vk;
use kiln_core::{DescriptorHandle, ProgramHandle, TextureHandle};
use kiln_protocol::draw::DescriptorList;
use kiln_protocol::resource::{DescriptorResource, DescriptorType};
use rustc_hash::FxHashMap;
use tracing::{debug, trace};

use crate::backend::{DescriptorWrite, GpuBackend};
use crate::error::{RenderError, VkResultExt};
use crate::slots::ResourceTables;

/// Identity of a descriptor set: the program plus the ordered descriptor
/// list. Compared by full equality, so distinct inputs never share a set.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DescriptorSetKey {
    pub program: ProgramHandle,
    pub descriptors: DescriptorList,
}

/// Content-addressed descriptor sets plus the per-texture samplers they
/// reference. Entries live until something they reference is destroyed.
pub struct DescriptorSetCache {
    pool: vk::DescriptorPool,
    sets: FxHashMap<DescriptorSetKey, vk::DescriptorSet>,
    samplers: FxHashMap<TextureHandle, vk::Sampler>,
    hits: u64,
    misses: u64,
}

impl DescriptorSetCache {
    pub fn new(pool: vk::DescriptorPool) -> Self {
        Self {
            pool,
            sets: FxHashMap::default(),
            samplers: FxHashMap::default(),
            hits: 0,
            misses: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.sets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sets.is_empty()
    }

    pub fn sampler_count(&self) -> usize {
        self.samplers.len()
    }

    pub fn hits(&self) -> u64 {
        self.hits
    }

    pub fn misses(&self) -> u64 {
        self.misses
    }

    pub fn get(&self, program: ProgramHandle, descriptors: &[DescriptorHandle]) -> Option<vk::DescriptorSet> {
        let key = DescriptorSetKey {
            program,
            descriptors: descriptors.iter().copied().collect(),
        };
        self.sets.get(&key).copied()
    }

    /// Returns the set for (`program`, `descriptors`), building it on first
    /// use. Texture descriptors with no resource bind `default_texture`.
    pub fn resolve<B: GpuBackend>(
        &mut self,
        backend: &mut B,
        tables: &ResourceTables,
        default_texture: TextureHandle,
        program: ProgramHandle,
        descriptors: &DescriptorList,
    ) -> Result<vk::DescriptorSet, RenderError> {
        let key = DescriptorSetKey {
            program,
            descriptors: descriptors.clone(),
        };
        if let Some(set) = self.sets.get(&key) {
            self.hits += 1;
            return Ok(*set);
        }

        let program_slot = tables.program(program)?;
        if descriptors.len() != program_slot.bindings.len() {
            tracing::error!(%program, "descriptor count does not match program bindings");
            return Err(RenderError::BindingCountMismatch {
                program: program.to_string(),
                expected: program_slot.bindings.len(),
                supplied: descriptors.len(),
            });
        }

        let mut writes = Vec::with_capacity(descriptors.len());
        for (binding, &handle) in program_slot.bindings.iter().zip(descriptors.iter()) {
            let descriptor = tables.descriptor(handle)?;
            let expected = DescriptorType::from_vk(binding.descriptor_type)
                .ok_or(RenderError::IncompatibleResource(descriptor.descriptor_type))?;
            if descriptor.descriptor_type != expected {
                return Err(RenderError::DescriptorTypeMismatch {
                    descriptor: format!("{} ({})", handle, descriptor.name),
                    binding: binding.binding,
                    expected,
                    actual: descriptor.descriptor_type,
                });
            }

            let write = match descriptor.resource {
                DescriptorResource::Buffer(buffer) => DescriptorWrite::Buffer {
                    binding: binding.binding,
                    descriptor_type: binding.descriptor_type,
                    buffer: tables.buffer(buffer)?.alloc.buffer,
                },
                DescriptorResource::Texture(texture) => {
                    let texture = texture.unwrap_or(default_texture);
                    let view = tables.texture(texture)?.alloc.view;
                    let sampler = self.sampler_for(backend, texture)?;
                    DescriptorWrite::Image {
                        binding: binding.binding,
                        descriptor_type: binding.descriptor_type,
                        view,
                        layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                        sampler: Some(sampler),
                    }
                }
                DescriptorResource::StorageImage(texture) => DescriptorWrite::Image {
                    binding: binding.binding,
                    descriptor_type: binding.descriptor_type,
                    view: tables.texture(texture)?.alloc.view,
                    layout: vk::ImageLayout::GENERAL,
                    sampler: None,
                },
            };
            writes.push(write);
        }

        let set = backend
            .allocate_descriptor_set(self.pool, program_slot.set_layout)
            .vk("vkAllocateDescriptorSets")?;
        backend.write_descriptor_set(set, &writes);

        self.misses += 1;
        debug!(%program, descriptors = descriptors.len(), cached = self.sets.len() + 1, "descriptor set built");
        self.sets.insert(key, set);
        Ok(set)
    }

    fn sampler_for<B: GpuBackend>(
        &mut self,
        backend: &mut B,
        texture: TextureHandle,
    ) -> Result<vk::Sampler, RenderError> {
        if let Some(sampler) = self.samplers.get(&texture) {
            return Ok(*sampler);
        }
        let sampler = backend.create_sampler().vk("vkCreateSampler")?;
        trace!(%texture, "sampler created");
        self.samplers.insert(texture, sampler);
        Ok(sampler)
    }

    /// Frees every cached set whose key matches `stale`.
    pub fn evict<B: GpuBackend>(
        &mut self,
        backend: &mut B,
        mut stale: impl FnMut(&DescriptorSetKey) -> bool,
    ) -> Result<usize, RenderError> {
        let mut freed = Vec::new();
        self.sets.retain(|key, set| {
            if stale(key) {
                freed.push(*set);
                false
            } else {
                true
            }
        });
        if !freed.is_empty() {
            backend
                .free_descriptor_sets(self.pool, &freed)
                .vk("vkFreeDescriptorSets")?;
            debug!(count = freed.len(), "descriptor sets evicted");
        }
        Ok(freed.len())
    }

    pub fn evict_program<B: GpuBackend>(
        &mut self,
        backend: &mut B,
        program: ProgramHandle,
    ) -> Result<usize, RenderError> {
        self.evict(backend, |key| key.program == program)
    }

    pub fn evict_descriptor<B: GpuBackend>(
        &mut self,
        backend: &mut B,
        descriptor: DescriptorHandle,
    ) -> Result<usize, RenderError> {
        self.evict(backend, |key| key.descriptors.contains(&descriptor))
    }

    pub fn destroy_sampler<B: GpuBackend>(&mut self, backend: &mut B, texture: TextureHandle) {
        if let Some(sampler) = self.samplers.remove(&texture) {
            backend.destroy_sampler(sampler);
        }
    }

    /// Releases the pool (and with it every set) and all samplers.
    pub fn destroy<B: GpuBackend>(&mut self, backend: &mut B) {
        for (_, sampler) in self.samplers.drain() {
            backend.destroy_sampler(sampler);
        }
        self.sets.clear();
        backend.destroy_descriptor_pool(self.pool);
        self.pool = vk::DescriptorPool::null();
    }
}

/// Compiled pipelines keyed by pipeline-layout identity. Filled when a
/// program is created, never rebuilt per frame.
#[derive(Default)]
pub struct PipelineCache {
    pipelines: FxHashMap<vk::PipelineLayout, vk::Pipeline>,
}

impl PipelineCache {
    pub fn insert(&mut self, layout: vk::PipelineLayout, pipeline: vk::Pipeline) {
        self.pipelines.insert(layout, pipeline);
    }

    pub fn get(&self, layout: vk::PipelineLayout) -> Option<vk::Pipeline> {
        self.pipelines.get(&layout).copied()
    }

    pub fn remove(&mut self, layout: vk::PipelineLayout) -> Option<vk::Pipeline> {
        self.pipelines.remove(&layout)
    }

    pub fn len(&self) -> usize {
        self.pipelines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pipelines.is_empty()
    }
}
