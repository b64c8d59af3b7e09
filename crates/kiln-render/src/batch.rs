//! Turns a frame's draw list into a recorded command sequence.
//!
//! Split in two so that nothing fallible runs between acquiring a
//! swapchain image and submitting: [`prepare_batch`] does every lookup and
//! allocation up front, [`record_batch`] only emits commands.

use ash::vk;
use kiln_core::{DescriptorHandle, ProgramHandle, TextureHandle};
use kiln_protocol::commands::{ImageBarrier, Rect2D, RenderingInfo, Viewport};
use kiln_protocol::draw::ViewportRect;
use kiln_protocol::resource::DescriptorResource;
use kiln_protocol::{DrawPushConstants, Frame, RecordedCommand};
use tracing::trace;

use crate::backend::GpuBackend;
use crate::cache::{DescriptorSetCache, PipelineCache};
use crate::error::RenderError;
use crate::slots::{PendingLayouts, ResourceTables};
use crate::swapchain::RenderTargets;

/// Where the batch renders and presents.
pub struct BatchTarget<'a> {
    pub targets: &'a RenderTargets,
    pub swapchain_image: vk::Image,
    pub swapchain_extent: [u32; 2],
    pub clear_color: [f32; 4],
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BatchReport {
    pub draws: usize,
    pub pipeline_binds: usize,
    pub descriptor_binds: usize,
    pub viewport_changes: usize,
}

/// One draw with every handle already resolved to a device object.
struct PreparedDraw {
    program: ProgramHandle,
    pipeline: vk::Pipeline,
    pipeline_layout: vk::PipelineLayout,
    push_stages: vk::ShaderStageFlags,
    set: vk::DescriptorSet,
    index_buffer: vk::Buffer,
    index_count: u32,
    push: DrawPushConstants,
    viewport: Option<ViewportRect>,
}

/// An image a draw samples or stores to, and the layout it needs.
struct TextureUse {
    texture: TextureHandle,
    image: vk::Image,
    committed: vk::ImageLayout,
    required: vk::ImageLayout,
}

/// A frame's draw list after every lookup that can fail has been done.
/// Recording it cannot fail.
pub struct PreparedBatch {
    draws: Vec<PreparedDraw>,
    textures: Vec<TextureUse>,
}

/// Resolves pipelines, descriptor sets and buffers for every draw in
/// `frame`. Handles destroyed since `submit` and descriptor pool exhaustion
/// surface here, before any swapchain image is acquired.
pub fn prepare_batch<B: GpuBackend>(
    backend: &mut B,
    tables: &ResourceTables,
    cache: &mut DescriptorSetCache,
    pipelines: &PipelineCache,
    default_texture: TextureHandle,
    frame: &Frame,
) -> Result<PreparedBatch, RenderError> {
    let mut draws = Vec::with_capacity(frame.len());
    let mut textures = Vec::new();

    for draw in frame.draws() {
        let program = tables.program(draw.program)?;
        let pipeline = pipelines.get(program.pipeline_layout).ok_or_else(|| {
            tracing::error!(program = %draw.program, "no cached pipeline for program");
            RenderError::MissingPipeline(draw.program.to_string())
        })?;
        let set = cache.resolve(backend, tables, default_texture, draw.program, &draw.descriptors)?;
        collect_texture_uses(tables, default_texture, &draw.descriptors, &mut textures)?;

        let index_buffer = tables.buffer(draw.index_buffer)?;
        let vertex_buffer = tables.buffer(draw.vertex_buffer)?;
        let instance_address = if draw.instance_buffer.is_none() {
            0
        } else {
            tables
                .buffer(draw.instance_buffer)?
                .alloc
                .device_address
                .unwrap_or(0)
        };

        draws.push(PreparedDraw {
            program: draw.program,
            pipeline,
            pipeline_layout: program.pipeline_layout,
            push_stages: program.push_stages,
            set,
            index_buffer: index_buffer.alloc.buffer,
            index_count: (index_buffer.alloc.size / 4) as u32,
            push: DrawPushConstants {
                view_proj: draw.view_proj,
                model: draw.model,
                camera_pos: [draw.camera_pos[0], draw.camera_pos[1], draw.camera_pos[2], 1.0],
                vertex_address: vertex_buffer.alloc.device_address.unwrap_or(0),
                instance_address,
            },
            viewport: draw.viewport,
        });
    }

    Ok(PreparedBatch { draws, textures })
}

/// Sampled textures must be in SHADER_READ_ONLY and storage images in
/// GENERAL by the time the render pass starts.
fn collect_texture_uses(
    tables: &ResourceTables,
    default_texture: TextureHandle,
    descriptors: &[DescriptorHandle],
    uses: &mut Vec<TextureUse>,
) -> Result<(), RenderError> {
    for &handle in descriptors {
        let resource = tables.descriptor(handle)?.resource;
        let Some(texture) = ResourceTables::referenced_texture(&resource, default_texture) else {
            continue;
        };
        let required = match resource {
            DescriptorResource::StorageImage(_) => vk::ImageLayout::GENERAL,
            _ => vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        };
        let slot = tables.texture(texture)?;
        uses.push(TextureUse {
            texture,
            image: slot.alloc.image,
            committed: slot.layout,
            required,
        });
    }
    Ok(())
}

/// Moves every texture the batch reads into the layout its descriptor
/// expects. Must follow the upload commands, which leave their own
/// layouts in `layouts`.
pub fn transition_textures(
    batch: &PreparedBatch,
    layouts: &mut PendingLayouts,
    commands: &mut Vec<RecordedCommand>,
) {
    for used in &batch.textures {
        let current = layouts.current(used.texture, used.committed);
        if current != used.required {
            commands.push(RecordedCommand::ImageBarrier(ImageBarrier::color(
                used.image,
                current,
                used.required,
            )));
            layouts.set(used.texture, used.required);
        }
    }
}

/// Records the render pass over the offscreen targets, the draw loop and
/// the blit into the swapchain image.
pub fn record_batch(
    batch: &PreparedBatch,
    target: &BatchTarget<'_>,
    commands: &mut Vec<RecordedCommand>,
) -> BatchReport {
    let color = target.targets.color;
    let depth = target.targets.depth;
    let extent = color.extent;

    commands.push(RecordedCommand::ImageBarrier(ImageBarrier::color(
        color.image,
        vk::ImageLayout::UNDEFINED,
        vk::ImageLayout::GENERAL,
    )));
    commands.push(RecordedCommand::ClearColorImage {
        image: color.image,
        color: target.clear_color,
    });
    commands.push(RecordedCommand::ImageBarrier(ImageBarrier::color(
        color.image,
        vk::ImageLayout::GENERAL,
        vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
    )));
    commands.push(RecordedCommand::ImageBarrier(ImageBarrier::depth(
        depth.image,
        vk::ImageLayout::UNDEFINED,
        vk::ImageLayout::DEPTH_ATTACHMENT_OPTIMAL,
    )));
    commands.push(RecordedCommand::BeginRendering(RenderingInfo {
        color_image: color.image,
        color_view: color.view,
        depth_image: depth.image,
        depth_view: depth.view,
        extent,
        // Inverted depth: far plane at 0.
        depth_clear: 0.0,
    }));

    let mut report = BatchReport::default();
    let mut last_program: Option<ProgramHandle> = None;
    let mut last_set = vk::DescriptorSet::null();
    let mut last_viewport: Option<ViewportRect> = None;

    for draw in &batch.draws {
        let viewport = draw.viewport.unwrap_or(ViewportRect {
            x: 0.0,
            y: 0.0,
            width: extent[0] as f32,
            height: extent[1] as f32,
        });

        let program_changed = last_program != Some(draw.program);
        if program_changed {
            commands.push(RecordedCommand::BindPipeline {
                pipeline: draw.pipeline,
            });
            report.pipeline_binds += 1;
        }
        if program_changed || draw.set != last_set {
            commands.push(RecordedCommand::BindDescriptorSet {
                layout: draw.pipeline_layout,
                set: draw.set,
            });
            report.descriptor_binds += 1;
        }
        if program_changed || last_viewport != Some(viewport) {
            commands.push(RecordedCommand::SetViewport(Viewport {
                x: viewport.x,
                y: viewport.y,
                width: viewport.width,
                height: viewport.height,
                min_depth: 0.0,
                max_depth: 1.0,
            }));
            commands.push(RecordedCommand::SetScissor(scissor_for(&viewport)));
            report.viewport_changes += 1;
        }
        last_program = Some(draw.program);
        last_set = draw.set;
        last_viewport = Some(viewport);

        commands.push(RecordedCommand::BindIndexBuffer {
            buffer: draw.index_buffer,
            offset: 0,
        });
        commands.push(RecordedCommand::PushConstants {
            layout: draw.pipeline_layout,
            stages: draw.push_stages,
            data: draw.push,
        });
        commands.push(RecordedCommand::DrawIndexed {
            index_count: draw.index_count,
            instance_count: 1,
        });
        report.draws += 1;
    }

    commands.push(RecordedCommand::EndRendering);

    commands.push(RecordedCommand::ImageBarrier(ImageBarrier::color(
        color.image,
        vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
        vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
    )));
    commands.push(RecordedCommand::ImageBarrier(ImageBarrier::color(
        target.swapchain_image,
        vk::ImageLayout::UNDEFINED,
        vk::ImageLayout::TRANSFER_DST_OPTIMAL,
    )));
    commands.push(RecordedCommand::BlitImage {
        src: color.image,
        src_extent: extent,
        dst: target.swapchain_image,
        dst_extent: target.swapchain_extent,
    });
    commands.push(RecordedCommand::ImageBarrier(ImageBarrier::color(
        target.swapchain_image,
        vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        vk::ImageLayout::PRESENT_SRC_KHR,
    )));

    trace!(
        draws = report.draws,
        pipeline_binds = report.pipeline_binds,
        descriptor_binds = report.descriptor_binds,
        "batch recorded"
    );
    report
}

fn scissor_for(viewport: &ViewportRect) -> Rect2D {
    Rect2D {
        offset: [viewport.x.max(0.0) as i32, viewport.y.max(0.0) as i32],
        extent: [viewport.width.max(0.0) as u32, viewport.height.max(0.0) as u32],
    }
}
