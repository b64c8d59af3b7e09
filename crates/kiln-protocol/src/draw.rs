use kiln_core::{BufferHandle, DescriptorHandle, ProgramHandle};
use smallvec::SmallVec;

use crate::error::ProtocolError;

/// Descriptors a single draw may bind.
pub const MAX_DRAW_DESCRIPTORS: usize = 16;

/// Column-major 4x4 matrix.
pub type Mat4 = [f32; 16];

pub const IDENTITY: Mat4 = [
    1.0, 0.0, 0.0, 0.0, //
    0.0, 1.0, 0.0, 0.0, //
    0.0, 0.0, 1.0, 0.0, //
    0.0, 0.0, 0.0, 1.0,
];

pub type DescriptorList = SmallVec<[DescriptorHandle; MAX_DRAW_DESCRIPTORS]>;

/// Per-draw push block. Shaders read vertices through `vertex_address`
/// (vertex pulling); no vertex-input state is bound.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct DrawPushConstants {
    pub view_proj: Mat4,
    pub model: Mat4,
    pub camera_pos: [f32; 4],
    pub vertex_address: u64,
    /// 0 when the draw has no instance buffer.
    pub instance_address: u64,
}

impl DrawPushConstants {
    pub const SIZE: u32 = std::mem::size_of::<Self>() as u32;
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ViewportRect {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

/// Immutable state snapshot of one draw.
#[derive(Debug, Clone, PartialEq)]
pub struct DrawCommand {
    pub view_proj: Mat4,
    pub model: Mat4,
    pub camera_pos: [f32; 3],
    pub vertex_buffer: BufferHandle,
    pub index_buffer: BufferHandle,
    pub instance_buffer: BufferHandle,
    pub program: ProgramHandle,
    pub descriptors: DescriptorList,
    /// `None` covers the whole render target.
    pub viewport: Option<ViewportRect>,
}

impl Default for DrawCommand {
    fn default() -> Self {
        Self {
            view_proj: IDENTITY,
            model: IDENTITY,
            camera_pos: [0.0; 3],
            vertex_buffer: BufferHandle::NONE,
            index_buffer: BufferHandle::NONE,
            instance_buffer: BufferHandle::NONE,
            program: ProgramHandle::NONE,
            descriptors: SmallVec::new(),
            viewport: None,
        }
    }
}

/// In-progress draw. Returned by `begin_draw`, consumed when the draw is
/// submitted.
#[derive(Debug, Clone, Default)]
#[must_use = "a draw is only recorded once it is submitted"]
pub struct DrawBuilder {
    draw: DrawCommand,
    overflow: usize,
}

impl DrawBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn transform(mut self, model: Mat4) -> Self {
        self.draw.model = model;
        self
    }

    pub fn view_proj(mut self, view_proj: Mat4) -> Self {
        self.draw.view_proj = view_proj;
        self
    }

    pub fn camera_pos(mut self, camera_pos: [f32; 3]) -> Self {
        self.draw.camera_pos = camera_pos;
        self
    }

    pub fn vertex_buffer(mut self, buffer: BufferHandle) -> Self {
        self.draw.vertex_buffer = buffer;
        self
    }

    pub fn index_buffer(mut self, buffer: BufferHandle) -> Self {
        self.draw.index_buffer = buffer;
        self
    }

    pub fn instance_buffer(mut self, buffer: BufferHandle) -> Self {
        self.draw.instance_buffer = buffer;
        self
    }

    /// Appends the next descriptor; order must follow the program's bindings.
    pub fn descriptor(mut self, descriptor: DescriptorHandle) -> Self {
        if self.draw.descriptors.len() < MAX_DRAW_DESCRIPTORS {
            self.draw.descriptors.push(descriptor);
        } else {
            self.overflow += 1;
        }
        self
    }

    pub fn viewport(mut self, viewport: ViewportRect) -> Self {
        self.draw.viewport = Some(viewport);
        self
    }

    pub fn peek(&self) -> &DrawCommand {
        &self.draw
    }

    /// Finalizes the draw for `program`. Checks only what the builder itself
    /// can know; handle validity is checked by the context.
    pub fn build(mut self, program: ProgramHandle) -> Result<DrawCommand, ProtocolError> {
        if self.overflow > 0 {
            return Err(ProtocolError::TooManyDescriptors {
                count: MAX_DRAW_DESCRIPTORS + self.overflow,
                max: MAX_DRAW_DESCRIPTORS,
            });
        }
        if self.draw.vertex_buffer.is_none() {
            return Err(ProtocolError::MissingBuffer("vertex"));
        }
        if self.draw.index_buffer.is_none() {
            return Err(ProtocolError::MissingBuffer("index"));
        }
        self.draw.program = program;
        Ok(self.draw)
    }
}

/// Ordered, bounded list of draws collected over one logical tick.
#[derive(Debug)]
pub struct Frame {
    draws: Vec<DrawCommand>,
    capacity: usize,
}

impl Frame {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            draws: Vec::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, draw: DrawCommand) -> Result<(), ProtocolError> {
        if self.draws.len() >= self.capacity {
            return Err(ProtocolError::FrameFull {
                capacity: self.capacity,
            });
        }
        self.draws.push(draw);
        Ok(())
    }

    pub fn draws(&self) -> &[DrawCommand] {
        &self.draws
    }

    pub fn len(&self) -> usize {
        self.draws.len()
    }

    pub fn is_empty(&self) -> bool {
        self.draws.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Resets every draw and the count; storage is kept for the next tick.
    pub fn clear(&mut self) {
        self.draws.clear();
    }
}
