pub mod config;
pub mod error;
pub mod handle;
pub mod slot_table;

pub use config::KilnConfig;
pub use error::CoreError;
pub use handle::{
    BufferHandle, DescriptorHandle, Handle, ProgramHandle, ShaderHandle, TextureHandle,
};
pub use slot_table::SlotTable;
