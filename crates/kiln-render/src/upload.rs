//! Deferred CPU to GPU data movement.
//!
//! `update_*` calls only append a [`DirtyEntry`]; the whole queue is applied
//! once per frame, in submission order, right before the draw batch is
//! recorded. Entries stay queued until that frame is submitted, so a frame
//! abandoned halfway applies them again next time. Reapplying is harmless:
//! every entry overwrites the same bytes with the same data.

use ash::vk;
use kiln_core::{BufferHandle, TextureHandle};
use kiln_protocol::commands::{BufferCopy, BufferImageCopy, ImageBarrier, MemoryBarrier};
use kiln_protocol::resource::BufferKind;
use kiln_protocol::RecordedCommand;
use tracing::{debug, trace, warn};

use crate::backend::{BufferDesc, GpuBackend};
use crate::error::{RenderError, VkResultExt};
use crate::slots::{PendingLayouts, ResourceTables};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadTarget {
    Buffer(BufferHandle),
    Texture(TextureHandle),
}

/// One pending write. The bytes are copied out of the caller's slice when
/// the update is queued.
#[derive(Debug, Clone)]
pub struct DirtyEntry {
    pub target: UploadTarget,
    pub offset: u64,
    pub data: Vec<u8>,
}

#[derive(Debug, Default)]
pub struct UploadQueue {
    entries: Vec<DirtyEntry>,
}

impl UploadQueue {
    pub fn push(&mut self, entry: DirtyEntry) {
        trace!(target_handle = ?entry.target, offset = entry.offset, size = entry.data.len(), "upload queued");
        self.entries.push(entry);
    }

    pub fn entries(&self) -> &[DirtyEntry] {
        &self.entries
    }

    /// Drops every entry; called once the frame that applied them has
    /// been submitted.
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct UploadReport {
    pub direct: usize,
    pub staged: usize,
    pub skipped: usize,
    pub bytes: u64,
}

/// Applies `entries` in order.
///
/// Direct writes happen immediately. Staged writes append copy and barrier
/// commands to `commands` and push their staging buffer onto `retired`,
/// which the caller must keep alive until the frame's fence has signaled.
/// Texture layout changes go to `layouts`. Entries whose target was
/// destroyed after the update was queued are skipped.
pub fn apply_uploads<B: GpuBackend>(
    backend: &mut B,
    tables: &ResourceTables,
    entries: &[DirtyEntry],
    layouts: &mut PendingLayouts,
    commands: &mut Vec<RecordedCommand>,
    retired: &mut Vec<vk::Buffer>,
) -> Result<UploadReport, RenderError> {
    let mut report = UploadReport::default();

    for entry in entries {
        let size = entry.data.len() as u64;
        match entry.target {
            UploadTarget::Buffer(handle) => {
                let Some(slot) = tables.buffers.get(handle) else {
                    warn!(%handle, "dropping upload for destroyed buffer");
                    report.skipped += 1;
                    continue;
                };
                let dst = slot.alloc;

                if dst.host_coherent {
                    backend
                        .write_buffer(dst.buffer, entry.offset, &entry.data)
                        .vk("vkMapMemory")?;
                    report.direct += 1;
                } else {
                    let staging = stage(backend, &entry.data, retired)?;
                    commands.push(RecordedCommand::CopyBuffer {
                        src: staging,
                        dst: dst.buffer,
                        region: BufferCopy {
                            src_offset: 0,
                            dst_offset: entry.offset,
                            size,
                        },
                    });
                    commands.push(RecordedCommand::MemoryBarrier(
                        MemoryBarrier::transfer_to_shader_read(),
                    ));
                    report.staged += 1;
                }
            }

            UploadTarget::Texture(handle) => {
                let Some(slot) = tables.textures.get(handle) else {
                    warn!(%handle, "dropping upload for destroyed texture");
                    report.skipped += 1;
                    continue;
                };
                let row_pitch = slot.info.row_pitch();
                let first_row = (entry.offset / row_pitch) as i32;
                let rows = (size / row_pitch) as u32;
                let image = slot.alloc.image;
                let old_layout = layouts.current(handle, slot.layout);

                let staging = stage(backend, &entry.data, retired)?;
                commands.push(RecordedCommand::ImageBarrier(ImageBarrier::color(
                    image,
                    old_layout,
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                )));
                commands.push(RecordedCommand::CopyBufferToImage {
                    src: staging,
                    dst: image,
                    region: BufferImageCopy {
                        buffer_offset: 0,
                        image_offset: [0, first_row],
                        image_extent: [slot.info.width, rows],
                    },
                });
                commands.push(RecordedCommand::ImageBarrier(ImageBarrier::color(
                    image,
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                )));
                layouts.set(handle, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
                report.staged += 1;
            }
        }
        report.bytes += size;
    }

    if report.direct + report.staged + report.skipped > 0 {
        debug!(
            direct = report.direct,
            staged = report.staged,
            skipped = report.skipped,
            bytes = report.bytes,
            "uploads applied"
        );
    }
    Ok(report)
}

fn stage<B: GpuBackend>(
    backend: &mut B,
    data: &[u8],
    retired: &mut Vec<vk::Buffer>,
) -> Result<vk::Buffer, RenderError> {
    let staging = backend
        .create_buffer(&BufferDesc {
            size: data.len() as u64,
            usage: BufferKind::Staging.usage(),
            mappable: true,
        })
        .vk("vkCreateBuffer")?;
    // Retire first so a failed write still gets cleaned up.
    retired.push(staging.buffer);
    backend
        .write_buffer(staging.buffer, 0, data)
        .vk("vkMapMemory")?;
    Ok(staging.buffer)
}
