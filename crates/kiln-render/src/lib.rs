pub mod backend;
pub mod batch;
pub mod cache;
pub mod context;
pub mod error;
pub mod frame;
pub mod headless;
pub mod shader;
pub mod slots;
pub mod swapchain;
pub mod upload;
pub mod vulkan;

pub use backend::GpuBackend;
pub use context::{FrameStatus, RenderContext, RenderStats};
pub use error::RenderError;
pub use headless::HeadlessBackend;
pub use swapchain::DirtyFlags;
pub use vulkan::{VulkanBackend, VulkanDevice};

pub use kiln_protocol::resource::{DescriptorResource, DescriptorType, TextureFormat, TextureInfo};
pub use kiln_protocol::{DrawBuilder, ShaderReflection};
