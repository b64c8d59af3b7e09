pub mod commands;
pub mod draw;
pub mod error;
pub mod reflection;
pub mod resource;

pub use commands::RecordedCommand;
pub use draw::{DrawBuilder, DrawCommand, DrawPushConstants, Frame};
pub use error::ProtocolError;
pub use reflection::ShaderReflection;
