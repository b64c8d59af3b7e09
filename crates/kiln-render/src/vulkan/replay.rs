use ash::vk;
use kiln_protocol::commands::{ImageBarrier, MemoryBarrier};
use kiln_protocol::RecordedCommand;

fn full_range(aspect: vk::ImageAspectFlags) -> vk::ImageSubresourceRange {
    vk::ImageSubresourceRange {
        aspect_mask: aspect,
        base_mip_level: 0,
        level_count: vk::REMAINING_MIP_LEVELS,
        base_array_layer: 0,
        layer_count: vk::REMAINING_ARRAY_LAYERS,
    }
}

fn color_layers() -> vk::ImageSubresourceLayers {
    vk::ImageSubresourceLayers {
        aspect_mask: vk::ImageAspectFlags::COLOR,
        mip_level: 0,
        base_array_layer: 0,
        layer_count: 1,
    }
}

fn memory_barrier(cb: vk::CommandBuffer, device: &ash::Device, b: &MemoryBarrier) {
    let barriers = [vk::MemoryBarrier2::default()
        .src_stage_mask(b.src_stage)
        .src_access_mask(b.src_access)
        .dst_stage_mask(b.dst_stage)
        .dst_access_mask(b.dst_access)];
    let dependency = vk::DependencyInfo::default().memory_barriers(&barriers);
    unsafe { device.cmd_pipeline_barrier2(cb, &dependency) };
}

fn image_barrier(cb: vk::CommandBuffer, device: &ash::Device, b: &ImageBarrier) {
    let barriers = [vk::ImageMemoryBarrier2::default()
        .src_stage_mask(b.src_stage)
        .src_access_mask(b.src_access)
        .dst_stage_mask(b.dst_stage)
        .dst_access_mask(b.dst_access)
        .old_layout(b.old_layout)
        .new_layout(b.new_layout)
        .image(b.image)
        .subresource_range(full_range(b.aspect))];
    let dependency = vk::DependencyInfo::default().image_memory_barriers(&barriers);
    unsafe { device.cmd_pipeline_barrier2(cb, &dependency) };
}

/// Replays `commands` into a command buffer that is in the recording state.
pub fn replay(device: &ash::Device, cb: vk::CommandBuffer, commands: &[RecordedCommand]) {
    for cmd in commands {
        match cmd {
            RecordedCommand::CopyBuffer { src, dst, region } => {
                let regions = [vk::BufferCopy {
                    src_offset: region.src_offset,
                    dst_offset: region.dst_offset,
                    size: region.size,
                }];
                unsafe { device.cmd_copy_buffer(cb, *src, *dst, &regions) };
            }

            RecordedCommand::CopyBufferToImage { src, dst, region } => {
                let regions = [vk::BufferImageCopy {
                    buffer_offset: region.buffer_offset,
                    buffer_row_length: 0,
                    buffer_image_height: 0,
                    image_subresource: color_layers(),
                    image_offset: vk::Offset3D {
                        x: region.image_offset[0],
                        y: region.image_offset[1],
                        z: 0,
                    },
                    image_extent: vk::Extent3D {
                        width: region.image_extent[0],
                        height: region.image_extent[1],
                        depth: 1,
                    },
                }];
                unsafe {
                    device.cmd_copy_buffer_to_image(
                        cb,
                        *src,
                        *dst,
                        vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                        &regions,
                    );
                }
            }

            RecordedCommand::MemoryBarrier(b) => memory_barrier(cb, device, b),

            RecordedCommand::ImageBarrier(b) => image_barrier(cb, device, b),

            RecordedCommand::ClearColorImage { image, color } => {
                let value = vk::ClearColorValue { float32: *color };
                let ranges = [full_range(vk::ImageAspectFlags::COLOR)];
                unsafe {
                    device.cmd_clear_color_image(cb, *image, vk::ImageLayout::GENERAL, &value, &ranges);
                }
            }

            RecordedCommand::BeginRendering(info) => {
                let color = [vk::RenderingAttachmentInfo::default()
                    .image_view(info.color_view)
                    .image_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
                    .load_op(vk::AttachmentLoadOp::LOAD)
                    .store_op(vk::AttachmentStoreOp::STORE)];
                let depth = vk::RenderingAttachmentInfo::default()
                    .image_view(info.depth_view)
                    .image_layout(vk::ImageLayout::DEPTH_ATTACHMENT_OPTIMAL)
                    .load_op(vk::AttachmentLoadOp::CLEAR)
                    .store_op(vk::AttachmentStoreOp::STORE)
                    .clear_value(vk::ClearValue {
                        depth_stencil: vk::ClearDepthStencilValue {
                            depth: info.depth_clear,
                            stencil: 0,
                        },
                    });
                let rendering = vk::RenderingInfo::default()
                    .render_area(vk::Rect2D {
                        offset: vk::Offset2D { x: 0, y: 0 },
                        extent: vk::Extent2D {
                            width: info.extent[0],
                            height: info.extent[1],
                        },
                    })
                    .layer_count(1)
                    .color_attachments(&color)
                    .depth_attachment(&depth);
                unsafe { device.cmd_begin_rendering(cb, &rendering) };
            }

            RecordedCommand::EndRendering => unsafe {
                device.cmd_end_rendering(cb);
            },

            RecordedCommand::BindPipeline { pipeline } => unsafe {
                device.cmd_bind_pipeline(cb, vk::PipelineBindPoint::GRAPHICS, *pipeline);
            },

            RecordedCommand::BindDescriptorSet { layout, set } => unsafe {
                device.cmd_bind_descriptor_sets(
                    cb,
                    vk::PipelineBindPoint::GRAPHICS,
                    *layout,
                    0,
                    &[*set],
                    &[],
                );
            },

            RecordedCommand::SetViewport(vp) => {
                let viewports = [vk::Viewport {
                    x: vp.x,
                    y: vp.y,
                    width: vp.width,
                    height: vp.height,
                    min_depth: vp.min_depth,
                    max_depth: vp.max_depth,
                }];
                unsafe { device.cmd_set_viewport(cb, 0, &viewports) };
            }

            RecordedCommand::SetScissor(s) => {
                let scissors = [vk::Rect2D {
                    offset: vk::Offset2D {
                        x: s.offset[0],
                        y: s.offset[1],
                    },
                    extent: vk::Extent2D {
                        width: s.extent[0],
                        height: s.extent[1],
                    },
                }];
                unsafe { device.cmd_set_scissor(cb, 0, &scissors) };
            }

            RecordedCommand::BindIndexBuffer { buffer, offset } => unsafe {
                device.cmd_bind_index_buffer(cb, *buffer, *offset, vk::IndexType::UINT32);
            },

            RecordedCommand::PushConstants {
                layout,
                stages,
                data,
            } => unsafe {
                device.cmd_push_constants(cb, *layout, *stages, 0, bytemuck::bytes_of(data));
            },

            RecordedCommand::DrawIndexed {
                index_count,
                instance_count,
            } => unsafe {
                device.cmd_draw_indexed(cb, *index_count, *instance_count, 0, 0, 0);
            },

            RecordedCommand::BlitImage {
                src,
                src_extent,
                dst,
                dst_extent,
            } => {
                let corner = |e: &[u32; 2]| vk::Offset3D {
                    x: e[0] as i32,
                    y: e[1] as i32,
                    z: 1,
                };
                let regions = [vk::ImageBlit {
                    src_subresource: color_layers(),
                    src_offsets: [vk::Offset3D::default(), corner(src_extent)],
                    dst_subresource: color_layers(),
                    dst_offsets: [vk::Offset3D::default(), corner(dst_extent)],
                }];
                unsafe {
                    device.cmd_blit_image(
                        cb,
                        *src,
                        vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                        *dst,
                        vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                        &regions,
                        vk::Filter::LINEAR,
                    );
                }
            }
        }
    }
}
