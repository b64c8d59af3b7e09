use ash::vk;
use kiln_core::{BufferHandle, TextureHandle};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DescriptorType {
    UniformBuffer,
    StorageBuffer,
    CombinedImageSampler,
    StorageImage,
}

impl DescriptorType {
    pub fn to_vk(self) -> vk::DescriptorType {
        match self {
            DescriptorType::UniformBuffer => vk::DescriptorType::UNIFORM_BUFFER,
            DescriptorType::StorageBuffer => vk::DescriptorType::STORAGE_BUFFER,
            DescriptorType::CombinedImageSampler => vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
            DescriptorType::StorageImage => vk::DescriptorType::STORAGE_IMAGE,
        }
    }

    pub fn from_vk(ty: vk::DescriptorType) -> Option<Self> {
        match ty {
            vk::DescriptorType::UNIFORM_BUFFER => Some(DescriptorType::UniformBuffer),
            vk::DescriptorType::STORAGE_BUFFER => Some(DescriptorType::StorageBuffer),
            vk::DescriptorType::COMBINED_IMAGE_SAMPLER => {
                Some(DescriptorType::CombinedImageSampler)
            }
            vk::DescriptorType::STORAGE_IMAGE => Some(DescriptorType::StorageImage),
            _ => None,
        }
    }
}

/// What a descriptor points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescriptorResource {
    Buffer(BufferHandle),
    /// Sampled texture; `None` binds the default opaque-white texture.
    Texture(Option<TextureHandle>),
    StorageImage(TextureHandle),
}

impl DescriptorResource {
    pub fn compatible_with(&self, ty: DescriptorType) -> bool {
        matches!(
            (self, ty),
            (
                DescriptorResource::Buffer(_),
                DescriptorType::UniformBuffer | DescriptorType::StorageBuffer
            ) | (
                DescriptorResource::Texture(_),
                DescriptorType::CombinedImageSampler
            ) | (
                DescriptorResource::StorageImage(_),
                DescriptorType::StorageImage
            )
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferKind {
    Uniform,
    Vertex,
    Index,
    Storage,
    /// Transient upload source, owned by the engine.
    Staging,
}

impl BufferKind {
    pub fn usage(self) -> vk::BufferUsageFlags {
        match self {
            BufferKind::Uniform => {
                vk::BufferUsageFlags::UNIFORM_BUFFER | vk::BufferUsageFlags::TRANSFER_DST
            }
            BufferKind::Vertex => {
                vk::BufferUsageFlags::STORAGE_BUFFER
                    | vk::BufferUsageFlags::TRANSFER_DST
                    | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS
            }
            BufferKind::Index => {
                vk::BufferUsageFlags::INDEX_BUFFER | vk::BufferUsageFlags::TRANSFER_DST
            }
            BufferKind::Storage => {
                vk::BufferUsageFlags::STORAGE_BUFFER
                    | vk::BufferUsageFlags::TRANSFER_DST
                    | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS
            }
            BufferKind::Staging => vk::BufferUsageFlags::TRANSFER_SRC,
        }
    }

    /// Whether the allocation should live in host-visible memory.
    pub fn mappable(self) -> bool {
        matches!(self, BufferKind::Uniform | BufferKind::Staging)
    }

    pub fn name(self) -> &'static str {
        match self {
            BufferKind::Uniform => "uniform",
            BufferKind::Vertex => "vertex",
            BufferKind::Index => "index",
            BufferKind::Storage => "storage",
            BufferKind::Staging => "staging",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TextureFormat {
    R8Unorm,
    Rg8Unorm,
    Rgba8Unorm,
    Rgba8Srgb,
    Bgra8Unorm,
    Rgba16Float,
    R32Float,
    Rgba32Float,
}

impl TextureFormat {
    pub fn to_vk(self) -> vk::Format {
        match self {
            TextureFormat::R8Unorm => vk::Format::R8_UNORM,
            TextureFormat::Rg8Unorm => vk::Format::R8G8_UNORM,
            TextureFormat::Rgba8Unorm => vk::Format::R8G8B8A8_UNORM,
            TextureFormat::Rgba8Srgb => vk::Format::R8G8B8A8_SRGB,
            TextureFormat::Bgra8Unorm => vk::Format::B8G8R8A8_UNORM,
            TextureFormat::Rgba16Float => vk::Format::R16G16B16A16_SFLOAT,
            TextureFormat::R32Float => vk::Format::R32_SFLOAT,
            TextureFormat::Rgba32Float => vk::Format::R32G32B32A32_SFLOAT,
        }
    }

    pub fn bytes_per_pixel(self) -> u32 {
        match self {
            TextureFormat::R8Unorm => 1,
            TextureFormat::Rg8Unorm => 2,
            TextureFormat::Rgba8Unorm
            | TextureFormat::Rgba8Srgb
            | TextureFormat::Bgra8Unorm
            | TextureFormat::R32Float => 4,
            TextureFormat::Rgba16Float => 8,
            TextureFormat::Rgba32Float => 16,
        }
    }
}

/// 2D, single-mip texture description.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextureInfo {
    pub width: u32,
    pub height: u32,
    pub format: TextureFormat,
    /// Also usable as a storage image.
    #[serde(default)]
    pub storage: bool,
}

impl TextureInfo {
    pub fn new(width: u32, height: u32, format: TextureFormat) -> Self {
        Self {
            width,
            height,
            format,
            storage: false,
        }
    }

    pub fn row_pitch(&self) -> u64 {
        self.width as u64 * self.format.bytes_per_pixel() as u64
    }

    pub fn size_bytes(&self) -> u64 {
        self.row_pitch() * self.height as u64
    }

    pub fn usage(&self) -> vk::ImageUsageFlags {
        let mut usage = vk::ImageUsageFlags::TRANSFER_DST | vk::ImageUsageFlags::SAMPLED;
        if self.storage {
            usage |= vk::ImageUsageFlags::STORAGE;
        }
        usage
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShaderStage {
    Vertex,
    Fragment,
}

impl ShaderStage {
    pub fn to_vk(self) -> vk::ShaderStageFlags {
        match self {
            ShaderStage::Vertex => vk::ShaderStageFlags::VERTEX,
            ShaderStage::Fragment => vk::ShaderStageFlags::FRAGMENT,
        }
    }
}
