use ash::vk;

use crate::draw::DrawPushConstants;

// ============================================================================
// Plain command payloads
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferCopy {
    pub src_offset: u64,
    pub dst_offset: u64,
    pub size: u64,
}

/// Copies `image_extent` texels from a tightly packed buffer into the
/// color aspect of mip 0, layer 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferImageCopy {
    pub buffer_offset: u64,
    pub image_offset: [i32; 2],
    pub image_extent: [u32; 2],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryBarrier {
    pub src_stage: vk::PipelineStageFlags2,
    pub src_access: vk::AccessFlags2,
    pub dst_stage: vk::PipelineStageFlags2,
    pub dst_access: vk::AccessFlags2,
}

impl MemoryBarrier {
    /// Orders a transfer write before every vertex-fetch and shader read
    /// that may consume the destination later in the frame.
    pub fn transfer_to_shader_read() -> Self {
        Self {
            src_stage: vk::PipelineStageFlags2::TRANSFER,
            src_access: vk::AccessFlags2::TRANSFER_WRITE,
            dst_stage: vk::PipelineStageFlags2::VERTEX_ATTRIBUTE_INPUT
                | vk::PipelineStageFlags2::INDEX_INPUT
                | vk::PipelineStageFlags2::VERTEX_SHADER
                | vk::PipelineStageFlags2::FRAGMENT_SHADER,
            dst_access: vk::AccessFlags2::VERTEX_ATTRIBUTE_READ
                | vk::AccessFlags2::INDEX_READ
                | vk::AccessFlags2::SHADER_READ,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageBarrier {
    pub image: vk::Image,
    pub aspect: vk::ImageAspectFlags,
    pub old_layout: vk::ImageLayout,
    pub new_layout: vk::ImageLayout,
    pub src_stage: vk::PipelineStageFlags2,
    pub src_access: vk::AccessFlags2,
    pub dst_stage: vk::PipelineStageFlags2,
    pub dst_access: vk::AccessFlags2,
}

impl ImageBarrier {
    /// Full-pipeline layout transition covering every mip and layer.
    pub fn layout(
        image: vk::Image,
        aspect: vk::ImageAspectFlags,
        old_layout: vk::ImageLayout,
        new_layout: vk::ImageLayout,
    ) -> Self {
        Self {
            image,
            aspect,
            old_layout,
            new_layout,
            src_stage: vk::PipelineStageFlags2::ALL_COMMANDS,
            src_access: vk::AccessFlags2::MEMORY_WRITE,
            dst_stage: vk::PipelineStageFlags2::ALL_COMMANDS,
            dst_access: vk::AccessFlags2::MEMORY_WRITE | vk::AccessFlags2::MEMORY_READ,
        }
    }

    pub fn color(image: vk::Image, old: vk::ImageLayout, new: vk::ImageLayout) -> Self {
        Self::layout(image, vk::ImageAspectFlags::COLOR, old, new)
    }

    pub fn depth(image: vk::Image, old: vk::ImageLayout, new: vk::ImageLayout) -> Self {
        Self::layout(image, vk::ImageAspectFlags::DEPTH, old, new)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Viewport {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub min_depth: f32,
    pub max_depth: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rect2D {
    pub offset: [i32; 2],
    pub extent: [u32; 2],
}

/// Dynamic-rendering scope over the offscreen targets. Color is loaded,
/// depth is cleared to `depth_clear`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RenderingInfo {
    pub color_image: vk::Image,
    pub color_view: vk::ImageView,
    pub depth_image: vk::Image,
    pub depth_view: vk::ImageView,
    pub extent: [u32; 2],
    pub depth_clear: f32,
}

// ============================================================================
// Recorded command stream
// ============================================================================

/// One command in a frame's recorded sequence.
///
/// The engine builds the whole frame as a `Vec<RecordedCommand>`; a backend
/// replays it onto its command buffer in order.
#[derive(Debug, Clone)]
pub enum RecordedCommand {
    CopyBuffer {
        src: vk::Buffer,
        dst: vk::Buffer,
        region: BufferCopy,
    },
    CopyBufferToImage {
        src: vk::Buffer,
        dst: vk::Image,
        region: BufferImageCopy,
    },
    MemoryBarrier(MemoryBarrier),
    ImageBarrier(ImageBarrier),
    /// Clear a color image that is in GENERAL layout.
    ClearColorImage {
        image: vk::Image,
        color: [f32; 4],
    },
    BeginRendering(RenderingInfo),
    EndRendering,
    BindPipeline {
        pipeline: vk::Pipeline,
    },
    BindDescriptorSet {
        layout: vk::PipelineLayout,
        set: vk::DescriptorSet,
    },
    SetViewport(Viewport),
    SetScissor(Rect2D),
    /// 32-bit indices.
    BindIndexBuffer {
        buffer: vk::Buffer,
        offset: u64,
    },
    PushConstants {
        layout: vk::PipelineLayout,
        stages: vk::ShaderStageFlags,
        data: DrawPushConstants,
    },
    DrawIndexed {
        index_count: u32,
        instance_count: u32,
    },
    /// Scaled blit from TRANSFER_SRC to TRANSFER_DST layout.
    BlitImage {
        src: vk::Image,
        src_extent: [u32; 2],
        dst: vk::Image,
        dst_extent: [u32; 2],
    },
}

impl RecordedCommand {
    pub fn name(&self) -> &'static str {
        match self {
            RecordedCommand::CopyBuffer { .. } => "CopyBuffer",
            RecordedCommand::CopyBufferToImage { .. } => "CopyBufferToImage",
            RecordedCommand::MemoryBarrier(_) => "MemoryBarrier",
            RecordedCommand::ImageBarrier(_) => "ImageBarrier",
            RecordedCommand::ClearColorImage { .. } => "ClearColorImage",
            RecordedCommand::BeginRendering(_) => "BeginRendering",
            RecordedCommand::EndRendering => "EndRendering",
            RecordedCommand::BindPipeline { .. } => "BindPipeline",
            RecordedCommand::BindDescriptorSet { .. } => "BindDescriptorSet",
            RecordedCommand::SetViewport(_) => "SetViewport",
            RecordedCommand::SetScissor(_) => "SetScissor",
            RecordedCommand::BindIndexBuffer { .. } => "BindIndexBuffer",
            RecordedCommand::PushConstants { .. } => "PushConstants",
            RecordedCommand::DrawIndexed { .. } => "DrawIndexed",
            RecordedCommand::BlitImage { .. } => "BlitImage",
        }
    }
}
