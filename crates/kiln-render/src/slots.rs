use ash::vk;
use kiln_core::config::LimitsConfig;
use kiln_core::handle::{Buffer, Descriptor, Program, Shader, Texture};
use kiln_core::{
    BufferHandle, DescriptorHandle, ProgramHandle, ShaderHandle, SlotTable, TextureHandle,
};
use kiln_protocol::resource::{BufferKind, DescriptorResource, DescriptorType, TextureInfo};
use kiln_protocol::ShaderReflection;
use rustc_hash::FxHashMap;

use crate::backend::{BufferAllocation, ImageAllocation, LayoutBinding};
use crate::error::RenderError;

pub struct BufferSlot {
    pub alloc: BufferAllocation,
    pub kind: BufferKind,
}

pub struct TextureSlot {
    pub alloc: ImageAllocation,
    pub info: TextureInfo,
    /// Layout the image will be in once all submitted work has executed.
    pub layout: vk::ImageLayout,
}

pub struct ShaderSlot {
    pub module: vk::ShaderModule,
    pub reflection: ShaderReflection,
}

pub struct ProgramSlot {
    pub set_layout: vk::DescriptorSetLayout,
    /// Also the key of the program's pipeline in the pipeline cache.
    pub pipeline_layout: vk::PipelineLayout,
    /// Merged stage bindings, sorted by binding index.
    pub bindings: Vec<LayoutBinding>,
    pub push_stages: vk::ShaderStageFlags,
}

pub struct DescriptorSlot {
    pub name: String,
    pub descriptor_type: DescriptorType,
    pub resource: DescriptorResource,
}

/// One generational table per resource family.
pub struct ResourceTables {
    pub buffers: SlotTable<Buffer, BufferSlot>,
    pub textures: SlotTable<Texture, TextureSlot>,
    pub shaders: SlotTable<Shader, ShaderSlot>,
    pub programs: SlotTable<Program, ProgramSlot>,
    pub descriptors: SlotTable<Descriptor, DescriptorSlot>,
}

impl ResourceTables {
    pub fn new(limits: &LimitsConfig) -> Self {
        Self {
            buffers: SlotTable::new(limits.max_buffers),
            textures: SlotTable::new(limits.max_textures),
            shaders: SlotTable::new(limits.max_shaders),
            programs: SlotTable::new(limits.max_programs),
            descriptors: SlotTable::new(limits.max_descriptors),
        }
    }

    pub fn buffer(&self, handle: BufferHandle) -> Result<&BufferSlot, RenderError> {
        self.buffers
            .get(handle)
            .ok_or_else(|| RenderError::invalid(handle))
    }

    pub fn texture(&self, handle: TextureHandle) -> Result<&TextureSlot, RenderError> {
        self.textures
            .get(handle)
            .ok_or_else(|| RenderError::invalid(handle))
    }

    pub fn shader(&self, handle: ShaderHandle) -> Result<&ShaderSlot, RenderError> {
        self.shaders
            .get(handle)
            .ok_or_else(|| RenderError::invalid(handle))
    }

    pub fn program(&self, handle: ProgramHandle) -> Result<&ProgramSlot, RenderError> {
        self.programs
            .get(handle)
            .ok_or_else(|| RenderError::invalid(handle))
    }

    pub fn descriptor(&self, handle: DescriptorHandle) -> Result<&DescriptorSlot, RenderError> {
        self.descriptors
            .get(handle)
            .ok_or_else(|| RenderError::invalid(handle))
    }

    /// Texture an image descriptor resolves to, substituting `fallback` for
    /// the "no resource" sentinel.
    pub fn referenced_texture(
        resource: &DescriptorResource,
        fallback: TextureHandle,
    ) -> Option<TextureHandle> {
        match resource {
            DescriptorResource::Texture(Some(texture)) => Some(*texture),
            DescriptorResource::Texture(None) => Some(fallback),
            DescriptorResource::StorageImage(texture) => Some(*texture),
            DescriptorResource::Buffer(_) => None,
        }
    }
}

/// Texture layouts as changed by commands recorded for a frame that has not
/// been submitted yet. Committed to the slots only once the submit went
/// through, so an abandoned frame leaves the tracked layouts untouched.
#[derive(Debug, Default)]
pub struct PendingLayouts {
    layouts: FxHashMap<TextureHandle, vk::ImageLayout>,
}

impl PendingLayouts {
    /// Layout `handle` will be in after the commands recorded so far;
    /// `committed` is the slot's layout when nothing was recorded for it.
    pub fn current(&self, handle: TextureHandle, committed: vk::ImageLayout) -> vk::ImageLayout {
        self.layouts.get(&handle).copied().unwrap_or(committed)
    }

    pub fn set(&mut self, handle: TextureHandle, layout: vk::ImageLayout) {
        self.layouts.insert(handle, layout);
    }

    pub fn commit(self, tables: &mut ResourceTables) {
        for (handle, layout) in self.layouts {
            if let Some(slot) = tables.textures.get_mut(handle) {
                slot.layout = layout;
            }
        }
    }
}
