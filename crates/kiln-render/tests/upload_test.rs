//! Integration test: upload queue
//!
//! Deferred buffer and texture writes: ordering, the direct vs staged path
//! choice, texture layout transitions and the call-time range checks.
//!
//! Run with: cargo test -p kiln-render --test upload_test -- --nocapture

mod common;

use ash::vk;
use kiln_protocol::resource::{TextureFormat, TextureInfo};
use kiln_protocol::RecordedCommand;
use kiln_core::BufferHandle;
use kiln_render::{FrameStatus, HeadlessBackend, RenderContext, RenderError};

fn copies_into(commands: &[RecordedCommand], dst_buffer: vk::Buffer) -> usize {
    commands
        .iter()
        .filter(|c| matches!(c, RecordedCommand::CopyBuffer { dst, .. } if *dst == dst_buffer))
        .count()
}

#[test]
fn test_split_update_staged_buffer() {
    let mut ctx = common::context();
    let buffer = ctx.create_storage_buffer(256, None).expect("create buffer");

    let x = [0xAAu8; 128];
    let y = [0x55u8; 128];
    ctx.update_buffer(buffer, 0, &x).expect("update low half");
    ctx.update_buffer(buffer, 128, &y).expect("update high half");
    assert_eq!(ctx.pending_uploads(), 3, "default texture plus two halves");

    assert_eq!(ctx.frame().expect("frame"), FrameStatus::Presented);
    assert_eq!(ctx.pending_uploads(), 0);
    ctx.wait_idle().expect("wait idle");

    let raw = ctx.buffer_raw(buffer).expect("raw buffer");
    let contents = ctx.backend().buffer_contents(raw).expect("buffer contents");
    assert_eq!(&contents[..128], &x[..]);
    assert_eq!(&contents[128..], &y[..]);

    let submission = &ctx.backend().log().submissions[0];
    assert_eq!(copies_into(submission, raw), 2, "device-local buffers take the staged path");
    println!("stats: {:?}", ctx.stats());
    common::assert_no_validation_errors(&ctx);
}

#[test]
fn test_split_update_direct_buffer() {
    let mut ctx = common::context();
    let buffer = ctx.create_uniform_buffer(256, None).expect("create buffer");

    ctx.update_buffer(buffer, 0, &[1u8; 128]).expect("update low half");
    ctx.update_buffer(buffer, 128, &[2u8; 128]).expect("update high half");
    ctx.frame().expect("frame");

    let raw = ctx.buffer_raw(buffer).expect("raw buffer");
    // Direct writes land at apply time, before the GPU runs anything.
    let contents = ctx.backend().buffer_contents(raw).expect("buffer contents");
    assert!(contents[..128].iter().all(|&b| b == 1));
    assert!(contents[128..].iter().all(|&b| b == 2));

    let submission = &ctx.backend().log().submissions[0];
    assert_eq!(copies_into(submission, raw), 0, "coherent memory must not be staged");
    let stats = ctx.stats();
    assert_eq!(stats.uploads_direct, 2);
    assert_eq!(stats.uploads_staged, 1, "only the default texture is staged");
    common::assert_no_validation_errors(&ctx);
}

#[test]
fn test_initial_data_is_queued_at_offset_zero() {
    let mut ctx = common::context();
    let data: Vec<u8> = (0..64).collect();
    let buffer = ctx
        .create_storage_buffer(128, Some(&data))
        .expect("create buffer");
    ctx.frame().expect("frame");
    ctx.wait_idle().expect("wait idle");

    let raw = ctx.buffer_raw(buffer).expect("raw buffer");
    let contents = ctx.backend().buffer_contents(raw).expect("buffer contents");
    assert_eq!(&contents[..64], &data[..]);
    assert!(contents[64..].iter().all(|&b| b == 0));
}

#[test]
fn test_frames_without_updates_leave_contents_alone() {
    let mut ctx = common::context();
    let buffer = ctx.create_storage_buffer(16, None).expect("create buffer");
    ctx.update_buffer(buffer, 0, &[7u8; 16]).expect("update");

    ctx.frame().expect("first frame");
    ctx.frame().expect("second frame");
    ctx.frame().expect("third frame");
    ctx.wait_idle().expect("wait idle");

    let raw = ctx.buffer_raw(buffer).expect("raw buffer");
    assert_eq!(ctx.backend().buffer_contents(raw), Some(&[7u8; 16][..]));

    let log = ctx.backend().log();
    assert_eq!(copies_into(&log.submissions[0], raw), 1);
    assert_eq!(copies_into(&log.submissions[1], raw), 0);
    assert_eq!(copies_into(&log.submissions[2], raw), 0);
}

#[test]
fn test_same_handle_updates_apply_in_order() {
    let mut ctx = common::context();
    let buffer = ctx.create_storage_buffer(8, None).expect("create buffer");
    ctx.update_buffer(buffer, 0, &[1u8; 8]).expect("first update");
    ctx.update_buffer(buffer, 0, &[2u8; 4]).expect("second update");
    ctx.frame().expect("frame");
    ctx.wait_idle().expect("wait idle");

    let raw = ctx.buffer_raw(buffer).expect("raw buffer");
    assert_eq!(
        ctx.backend().buffer_contents(raw),
        Some(&[2u8, 2, 2, 2, 1, 1, 1, 1][..])
    );
    assert_eq!(
        copies_into(&ctx.backend().log().submissions[0], raw),
        2,
        "entries are not coalesced"
    );
}

#[test]
fn test_staged_copy_is_followed_by_barrier() {
    let mut ctx = common::context();
    let buffer = ctx.create_vertex_buffer(32, None).expect("create buffer");
    ctx.update_buffer(buffer, 0, &[9u8; 32]).expect("update");
    ctx.frame().expect("frame");

    let raw = ctx.buffer_raw(buffer).expect("raw buffer");
    let submission = &ctx.backend().log().submissions[0];
    let copy_at = submission
        .iter()
        .position(|c| matches!(c, RecordedCommand::CopyBuffer { dst, .. } if *dst == raw))
        .expect("copy recorded");
    match &submission[copy_at + 1] {
        RecordedCommand::MemoryBarrier(barrier) => {
            assert_eq!(barrier.src_access, vk::AccessFlags2::TRANSFER_WRITE);
            assert!(barrier.dst_stage.contains(vk::PipelineStageFlags2::VERTEX_SHADER));
        }
        other => panic!("expected MemoryBarrier, got {:?}", other),
    }
}

#[test]
fn test_texture_upload_transitions_and_copies_rows() {
    let mut ctx = common::context();
    let info = TextureInfo::new(4, 4, TextureFormat::Rgba8Unorm);
    let texture = ctx.create_texture(info).expect("create texture");

    // Rows 1 and 2 of a 16-byte-pitch image.
    let rows: Vec<u8> = (0..32).collect();
    ctx.update_texture(texture, 16, &rows).expect("update rows");
    ctx.frame().expect("frame");
    ctx.wait_idle().expect("wait idle");

    let image = ctx.texture_image(texture).expect("image");
    assert_eq!(
        ctx.backend().image_layout(image),
        Some(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)
    );
    let contents = ctx.backend().image_contents(image).expect("image contents");
    assert!(contents[..16].iter().all(|&b| b == 0));
    assert_eq!(&contents[16..48], &rows[..]);
    assert!(contents[48..].iter().all(|&b| b == 0));

    let submission = &ctx.backend().log().submissions[0];
    let copy = submission
        .iter()
        .find_map(|c| match c {
            RecordedCommand::CopyBufferToImage { dst, region, .. } if *dst == image => Some(*region),
            _ => None,
        })
        .expect("image copy recorded");
    assert_eq!(copy.image_offset, [0, 1]);
    assert_eq!(copy.image_extent, [4, 2]);
    common::assert_no_validation_errors(&ctx);
}

#[test]
fn test_second_texture_upload_starts_from_shader_read() {
    let mut ctx = common::context();
    let texture = ctx
        .create_texture(TextureInfo::new(2, 2, TextureFormat::R8Unorm))
        .expect("create texture");
    ctx.update_texture(texture, 0, &[1, 2, 3, 4]).expect("first update");
    ctx.frame().expect("first frame");
    ctx.update_texture(texture, 2, &[5, 6]).expect("second update");
    ctx.frame().expect("second frame");
    ctx.wait_idle().expect("wait idle");

    let image = ctx.texture_image(texture).expect("image");
    assert_eq!(ctx.backend().image_contents(image), Some(&[1u8, 2, 5, 6][..]));
    common::assert_no_validation_errors(&ctx);
}

#[test]
fn test_out_of_range_update_rejected() {
    let mut ctx = common::context();
    let buffer = ctx.create_storage_buffer(256, None).expect("create buffer");

    match ctx.update_buffer(buffer, 200, &[0u8; 100]) {
        Err(RenderError::UpdateOutOfRange {
            offset,
            size,
            capacity,
            ..
        }) => {
            assert_eq!((offset, size, capacity), (200, 100, 256));
        }
        other => panic!("expected UpdateOutOfRange, got {:?}", other),
    }
    match ctx.update_buffer(buffer, u64::MAX, &[0u8; 2]) {
        Err(RenderError::UpdateOutOfRange { .. }) => {}
        other => panic!("expected UpdateOutOfRange on overflow, got {:?}", other),
    }
    match ctx.create_uniform_buffer(4, Some(&[0u8; 8])) {
        Err(RenderError::UpdateOutOfRange { .. }) => {}
        other => panic!("expected UpdateOutOfRange for oversized initial data, got {:?}", other),
    }
    assert_eq!(ctx.pending_uploads(), 1, "only the default texture is queued");
}

#[test]
fn test_partial_row_texture_update_rejected() {
    let mut ctx = common::context();
    let texture = ctx
        .create_texture(TextureInfo::new(4, 4, TextureFormat::Rgba8Unorm))
        .expect("create texture");

    match ctx.update_texture(texture, 4, &[0u8; 16]) {
        Err(RenderError::UnalignedTextureUpdate { row_pitch, .. }) => assert_eq!(row_pitch, 16),
        other => panic!("expected UnalignedTextureUpdate, got {:?}", other),
    }
    match ctx.update_texture(texture, 0, &[0u8; 20]) {
        Err(RenderError::UnalignedTextureUpdate { .. }) => {}
        other => panic!("expected UnalignedTextureUpdate, got {:?}", other),
    }
    match ctx.update_texture(texture, 48, &[0u8; 32]) {
        Err(RenderError::UpdateOutOfRange { .. }) => {}
        other => panic!("expected UpdateOutOfRange, got {:?}", other),
    }
}

#[test]
fn test_zero_sized_buffer_rejected() {
    let mut ctx = common::context();
    match ctx.create_index_buffer(0, None) {
        Err(RenderError::ZeroSize(kind)) => assert_eq!(kind, "index"),
        other => panic!("expected ZeroSize, got {:?}", other),
    }
}

#[test]
fn test_update_for_destroyed_buffer_is_dropped() {
    let mut ctx = common::context();
    let buffer = ctx.create_storage_buffer(16, None).expect("create buffer");
    ctx.update_buffer(buffer, 0, &[3u8; 16]).expect("update");
    ctx.destroy_buffer(buffer).expect("destroy");

    assert_eq!(ctx.frame().expect("frame"), FrameStatus::Presented);
    assert_eq!(ctx.stats().uploads_staged, 1, "only the default texture");
    assert_eq!(ctx.stats().uploads_skipped, 1);
    common::assert_no_validation_errors(&ctx);
}

/// Creates a 128-byte buffer, queues `repeats` identical writes of 64 bytes
/// at offset 32, renders one frame and returns the buffer contents.
fn contents_after_repeated_update(
    create: fn(&mut RenderContext<HeadlessBackend>) -> BufferHandle,
    repeats: usize,
) -> Vec<u8> {
    let mut ctx = common::context();
    let buffer = create(&mut ctx);
    for _ in 0..repeats {
        ctx.update_buffer(buffer, 32, &[7u8; 64]).expect("update");
    }
    assert_eq!(ctx.frame().expect("frame"), FrameStatus::Presented);
    ctx.wait_idle().expect("wait idle");
    common::assert_no_validation_errors(&ctx);

    let raw = ctx.buffer_raw(buffer).expect("raw buffer");
    ctx.backend()
        .buffer_contents(raw)
        .expect("buffer contents")
        .to_vec()
}

#[test]
fn test_repeated_identical_update_matches_single_update() {
    let paths: [(&str, fn(&mut RenderContext<HeadlessBackend>) -> BufferHandle); 2] = [
        ("staged", |ctx| ctx.create_storage_buffer(128, None).expect("create buffer")),
        ("direct", |ctx| ctx.create_uniform_buffer(128, None).expect("create buffer")),
    ];
    for (path, create) in paths {
        let once = contents_after_repeated_update(create, 1);
        let twice = contents_after_repeated_update(create, 2);
        println!("{} path: {} bytes compared", path, once.len());
        assert_eq!(once, twice, "{} path: applying the same entry twice changed the result", path);
        assert!(once[..32].iter().all(|&b| b == 0), "{} path: bytes before the range", path);
        assert!(once[32..96].iter().all(|&b| b == 7), "{} path: updated range", path);
        assert!(once[96..].iter().all(|&b| b == 0), "{} path: bytes after the range", path);
    }
}
