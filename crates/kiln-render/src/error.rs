use ash::vk;
use kiln_core::handle::{Handle, ResourceKind};
use kiln_core::CoreError;
use kiln_protocol::resource::DescriptorType;
use kiln_protocol::ProtocolError;

#[derive(Debug, thiserror::Error)]
pub enum RenderError {
    #[error("{call} failed: {result}")]
    Vulkan {
        call: &'static str,
        result: vk::Result,
    },

    #[error("invalid {kind} handle: {handle}")]
    InvalidHandle { kind: &'static str, handle: String },

    #[error("{kind} update out of range: offset {offset} + {size} bytes exceeds {capacity}")]
    UpdateOutOfRange {
        kind: &'static str,
        offset: u64,
        size: u64,
        capacity: u64,
    },

    #[error("texture updates must cover whole rows of {row_pitch} bytes (offset {offset}, size {size})")]
    UnalignedTextureUpdate { row_pitch: u64, offset: u64, size: u64 },

    #[error("program {program} declares {expected} bindings but the draw supplies {supplied} descriptors")]
    BindingCountMismatch {
        program: String,
        expected: usize,
        supplied: usize,
    },

    #[error("descriptor {descriptor} is {actual:?} but binding {binding} expects {expected:?}")]
    DescriptorTypeMismatch {
        descriptor: String,
        binding: u32,
        expected: DescriptorType,
        actual: DescriptorType,
    },

    #[error("descriptor resource cannot be bound as {0:?}")]
    IncompatibleResource(DescriptorType),

    #[error("binding {binding} declared as {first:?} in one stage and {second:?} in another")]
    ConflictingBinding {
        binding: u32,
        first: vk::DescriptorType,
        second: vk::DescriptorType,
    },

    #[error("expected a {expected} shader, got a {actual} shader")]
    StageMismatch {
        expected: &'static str,
        actual: &'static str,
    },

    #[error("no pipeline cached for program {0}")]
    MissingPipeline(String),

    #[error("a program needs at least one shader stage")]
    EmptyProgram,

    #[error("zero-sized {0}")]
    ZeroSize(&'static str),

    #[error("render context has been shut down")]
    ShutDown,

    #[error("invalid SPIR-V: {0}")]
    InvalidSpirv(String),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Core(#[from] CoreError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl RenderError {
    pub fn invalid<K: ResourceKind>(handle: Handle<K>) -> Self {
        tracing::error!(%handle, "operation on invalid handle");
        RenderError::InvalidHandle {
            kind: K::NAME,
            handle: handle.to_string(),
        }
    }

    pub fn is_device_lost(&self) -> bool {
        matches!(
            self,
            RenderError::Vulkan {
                result: vk::Result::ERROR_DEVICE_LOST,
                ..
            }
        )
    }
}

/// Attach the failing entry point to a raw `vk::Result`.
pub trait VkResultExt<T> {
    fn vk(self, call: &'static str) -> Result<T, RenderError>;
}

impl<T> VkResultExt<T> for Result<T, vk::Result> {
    fn vk(self, call: &'static str) -> Result<T, RenderError> {
        self.map_err(|result| {
            tracing::error!(call, ?result, "graphics API call failed");
            RenderError::Vulkan { call, result }
        })
    }
}
