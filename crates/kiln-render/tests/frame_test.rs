//! Integration test: frame loop and swapchain lifecycle
//!
//! Double-buffered submission, stale acquire/present handling, resize
//! rebuilds, staging retirement and shutdown, all against the headless
//! device.
//!
//! Run with: cargo test -p kiln-render --test frame_test -- --nocapture

mod common;

use ash::vk;
use kiln_protocol::draw::{ViewportRect, IDENTITY};
use kiln_protocol::resource::{DescriptorResource, DescriptorType, TextureFormat, TextureInfo};
use kiln_protocol::RecordedCommand;
use kiln_render::backend::{AcquireOutcome, PresentOutcome};
use kiln_render::{DirtyFlags, FrameStatus, RenderError};

fn translation(x: f32) -> [f32; 16] {
    let mut m = IDENTITY;
    m[12] = x;
    m
}

#[test]
fn test_stale_acquire_drops_frame_without_submitting() {
    let mut ctx = common::context();
    let program = common::program(&mut ctx, &[]);
    let (vb, ib) = common::triangle(&mut ctx);
    let pending_before = ctx.pending_uploads();

    let draw = ctx.begin_draw().vertex_buffer(vb).index_buffer(ib);
    ctx.submit(draw, program).expect("submit draw");
    ctx.backend_mut().script_acquire(AcquireOutcome::Stale);

    assert_eq!(ctx.frame().expect("frame"), FrameStatus::Dropped);
    assert_eq!(ctx.current_frame(), 0, "a dropped frame must not advance");
    assert!(ctx.backend().log().submissions.is_empty(), "nothing may be submitted");
    assert!(ctx.dirty_flags().contains(DirtyFlags::SWAPCHAIN));
    assert_eq!(ctx.queued_draws(), 0, "the draw list is dropped");
    assert_eq!(ctx.pending_uploads(), pending_before, "uploads wait for the next frame");
    assert_eq!(ctx.stats().frames_dropped, 1);

    // The next tick rebuilds and renders normally.
    let draw = ctx.begin_draw().vertex_buffer(vb).index_buffer(ib);
    ctx.submit(draw, program).expect("resubmit draw");
    assert_eq!(ctx.frame().expect("frame"), FrameStatus::Presented);
    assert!(ctx.dirty_flags().is_empty());
    assert_eq!(ctx.current_frame(), 1);
    assert_eq!(ctx.stats().swapchain_rebuilds, 1);
    assert_eq!(ctx.backend().log().swapchains_created, 2);
    common::assert_no_validation_errors(&ctx);
}

#[test]
fn test_at_most_two_frames_in_flight() {
    let mut ctx = common::context();
    let program = common::program(&mut ctx, &[]);
    let (vb, ib) = common::triangle(&mut ctx);

    for i in 0..10 {
        let draw = ctx.begin_draw().vertex_buffer(vb).index_buffer(ib);
        ctx.submit(draw, program).expect("submit draw");
        assert_eq!(ctx.frame().expect("frame"), FrameStatus::Presented);
        assert_eq!(ctx.current_frame(), (i + 1) % 2);
        let in_flight = ctx.in_flight().expect("fence status");
        assert!(in_flight <= 2, "frame {}: {} contexts in flight", i, in_flight);
    }

    let log = ctx.backend().log();
    println!("max in flight: {}", log.max_in_flight);
    assert_eq!(log.max_in_flight, 2);
    assert_eq!(log.submissions.len(), 10);
    assert_eq!(log.presents, vec![0, 1, 2, 0, 1, 2, 0, 1, 2, 0]);
    assert_eq!(ctx.stats().frames_presented, 10);
    common::assert_no_validation_errors(&ctx);
}

#[test]
fn test_draws_are_recorded_in_submission_order() {
    let mut ctx = common::context();
    let program = common::program(&mut ctx, &[]);
    let (vb, ib) = common::triangle(&mut ctx);

    for i in 0..5 {
        let draw = ctx
            .begin_draw()
            .transform(translation(i as f32))
            .camera_pos([0.0, 0.0, -(i as f32)])
            .vertex_buffer(vb)
            .index_buffer(ib);
        ctx.submit(draw, program).expect("submit draw");
    }
    assert_eq!(ctx.queued_draws(), 5);
    ctx.frame().expect("frame");
    assert_eq!(ctx.queued_draws(), 0, "the draw list is consumed by the frame");

    let submission = &ctx.backend().log().submissions[0];
    let pushed: Vec<f32> = submission
        .iter()
        .filter_map(|c| match c {
            RecordedCommand::PushConstants { data, .. } => Some(data.model[12]),
            _ => None,
        })
        .collect();
    assert_eq!(pushed, vec![0.0, 1.0, 2.0, 3.0, 4.0]);

    let draws: Vec<u32> = submission
        .iter()
        .filter_map(|c| match c {
            RecordedCommand::DrawIndexed { index_count, .. } => Some(*index_count),
            _ => None,
        })
        .collect();
    assert_eq!(draws, vec![3; 5]);
    assert_eq!(ctx.stats().draws_recorded, 5);

    // Vertices are pulled through the buffer's device address.
    let raw = ctx.buffer_raw(vb).expect("raw vertex buffer");
    let address = submission.iter().find_map(|c| match c {
        RecordedCommand::PushConstants { data, .. } => Some(data.vertex_address),
        _ => None,
    });
    assert_eq!(address, Some(ash::vk::Handle::as_raw(raw) << 16));
    common::assert_no_validation_errors(&ctx);
}

#[test]
fn test_viewport_change_reissues_viewport_only() {
    let mut ctx = common::context();
    let program = common::program(&mut ctx, &[]);
    let (vb, ib) = common::triangle(&mut ctx);
    let half = ViewportRect {
        x: 0.0,
        y: 0.0,
        width: 32.0,
        height: 48.0,
    };

    let first = ctx.begin_draw().vertex_buffer(vb).index_buffer(ib);
    ctx.submit(first, program).expect("submit first");
    let second = ctx
        .begin_draw()
        .vertex_buffer(vb)
        .index_buffer(ib)
        .viewport(half);
    ctx.submit(second, program).expect("submit second");
    ctx.frame().expect("frame");

    let submission = &ctx.backend().log().submissions[0];
    let viewports: Vec<[f32; 2]> = submission
        .iter()
        .filter_map(|c| match c {
            RecordedCommand::SetViewport(v) => Some([v.width, v.height]),
            _ => None,
        })
        .collect();
    assert_eq!(viewports, vec![[64.0, 48.0], [32.0, 48.0]]);
    let binds = submission
        .iter()
        .filter(|c| matches!(c, RecordedCommand::BindPipeline { .. }))
        .count();
    assert_eq!(binds, 1);
}

#[test]
fn test_frame_full_rejects_extra_draws() {
    let mut config = common::test_config();
    config.limits.max_draws = 2;
    let mut ctx = common::context_with(config);
    let program = common::program(&mut ctx, &[]);
    let (vb, ib) = common::triangle(&mut ctx);

    for _ in 0..2 {
        let draw = ctx.begin_draw().vertex_buffer(vb).index_buffer(ib);
        ctx.submit(draw, program).expect("submit draw");
    }
    let draw = ctx.begin_draw().vertex_buffer(vb).index_buffer(ib);
    match ctx.submit(draw, program) {
        Err(RenderError::Protocol(e)) => println!("rejected: {}", e),
        other => panic!("expected FrameFull, got {:?}", other),
    }
    ctx.frame().expect("frame");
    assert_eq!(ctx.stats().draws_recorded, 2);
}

#[test]
fn test_stale_present_still_advances() {
    let mut ctx = common::context();
    ctx.backend_mut().script_present(PresentOutcome::Stale);

    assert_eq!(ctx.frame().expect("frame"), FrameStatus::PresentStale);
    assert_eq!(ctx.current_frame(), 1, "submitted work is not unwound");
    assert_eq!(ctx.backend().log().submissions.len(), 1);
    assert!(ctx.dirty_flags().contains(DirtyFlags::SWAPCHAIN));
    assert_eq!(ctx.stats().present_stale, 1);

    assert_eq!(ctx.frame().expect("frame"), FrameStatus::Presented);
    assert_eq!(ctx.backend().log().swapchains_created, 2);
    assert!(ctx.dirty_flags().is_empty());
    common::assert_no_validation_errors(&ctx);
}

#[test]
fn test_stale_rebuild_follows_surface_size() {
    let mut ctx = common::context();
    ctx.frame().expect("first frame");
    ctx.backend_mut().set_surface_extent(Some([80, 60]));
    ctx.backend_mut().script_acquire(AcquireOutcome::Stale);

    assert_eq!(ctx.frame().expect("stale frame"), FrameStatus::Dropped);
    assert_eq!(ctx.frame().expect("rebuilt frame"), FrameStatus::Presented);
    assert_eq!(ctx.extent(), [80, 60]);
    common::assert_no_validation_errors(&ctx);
}

#[test]
fn test_resize_rebuilds_after_device_idle() {
    let mut ctx = common::context();
    ctx.frame().expect("first frame");
    let idle_before = ctx.backend().log().device_idle_waits;

    ctx.resize(128, 96);
    assert_eq!(
        ctx.dirty_flags(),
        DirtyFlags::SWAPCHAIN | DirtyFlags::RENDER_TARGETS
    );
    assert_eq!(ctx.extent(), common::EXTENT, "nothing happens until the next frame");

    assert_eq!(ctx.frame().expect("frame"), FrameStatus::Presented);
    assert_eq!(ctx.extent(), [128, 96]);
    assert!(ctx.dirty_flags().is_empty());
    let log = ctx.backend().log();
    assert!(log.device_idle_waits > idle_before, "rebuild must wait for the device");
    assert_eq!(log.swapchains_created, 2);
    assert_eq!(ctx.stats().swapchain_rebuilds, 1);

    let submission = log.submissions.last().expect("submission");
    let blit = submission.iter().find_map(|c| match c {
        RecordedCommand::BlitImage { dst_extent, .. } => Some(*dst_extent),
        _ => None,
    });
    assert_eq!(blit, Some([128, 96]));
    common::assert_no_validation_errors(&ctx);
}

#[test]
fn test_zero_area_resize_defers_rebuild() {
    let mut ctx = common::context();
    ctx.resize(0, 0);

    assert_eq!(ctx.frame().expect("minimized frame"), FrameStatus::Dropped);
    assert!(ctx.dirty_flags().contains(DirtyFlags::SWAPCHAIN));
    assert!(ctx.backend().log().submissions.is_empty());
    assert_eq!(ctx.backend().log().swapchains_created, 1);

    ctx.resize(32, 32);
    assert_eq!(ctx.frame().expect("restored frame"), FrameStatus::Presented);
    assert_eq!(ctx.extent(), [32, 32]);
    common::assert_no_validation_errors(&ctx);
}

#[test]
fn test_staging_freed_only_after_fence_retires() {
    let mut ctx = common::context();
    let buffer = ctx.create_storage_buffer(16, None).expect("create buffer");
    ctx.update_buffer(buffer, 0, &[1u8; 16]).expect("update");
    assert_eq!(ctx.backend().live_buffers(), 1);

    // Frame 0 stages the default texture and the update.
    ctx.frame().expect("frame 0");
    assert_eq!(ctx.backend().live_buffers(), 3);

    // Frame 1 uses the other context; frame 0 may still be executing.
    ctx.frame().expect("frame 1");
    assert_eq!(ctx.backend().live_buffers(), 3);

    // Frame 2 waits on frame 0's fence and only then frees its staging.
    ctx.frame().expect("frame 2");
    assert_eq!(ctx.backend().live_buffers(), 1);
    common::assert_no_validation_errors(&ctx);
}

#[test]
fn test_clear_color_from_config() {
    let mut config = common::test_config();
    config.render.clear_color = [0.1, 0.2, 0.3, 1.0];
    let mut ctx = common::context_with(config);
    ctx.frame().expect("frame");
    ctx.wait_idle().expect("wait idle");

    let target = ctx.color_target().expect("color target");
    assert_eq!(ctx.backend().image_clear_color(target), Some([0.1, 0.2, 0.3, 1.0]));
}

#[test]
fn test_shutdown_releases_everything() {
    let mut ctx = common::context();
    let program = common::program(&mut ctx, &[(0, DescriptorType::CombinedImageSampler)]);
    let (vb, ib) = common::triangle(&mut ctx);
    let texture_desc = ctx
        .create_descriptor(
            "albedo",
            DescriptorType::CombinedImageSampler,
            kiln_protocol::resource::DescriptorResource::Texture(None),
        )
        .expect("create descriptor");
    let draw = ctx
        .begin_draw()
        .vertex_buffer(vb)
        .index_buffer(ib)
        .descriptor(texture_desc);
    ctx.submit(draw, program).expect("submit draw");
    ctx.frame().expect("frame");

    ctx.shutdown().expect("shutdown");
    let backend = ctx.backend();
    assert_eq!(backend.live_buffers(), 0);
    assert_eq!(backend.live_images(), 0);
    assert_eq!(backend.live_samplers(), 0);
    assert_eq!(backend.live_pipelines(), 0);
    assert_eq!(backend.live_descriptor_sets(), 0);
    assert_eq!(backend.in_flight(), 0);
    common::assert_no_validation_errors(&ctx);

    match ctx.frame() {
        Err(RenderError::ShutDown) => {}
        other => panic!("expected ShutDown, got {:?}", other),
    }
    // A second shutdown is a no-op.
    ctx.shutdown().expect("second shutdown");
}

#[test]
fn test_failed_frame_keeps_uploads_and_sync_state() {
    let mut ctx = common::context();
    let program = common::program(&mut ctx, &[(0, DescriptorType::UniformBuffer)]);
    let (vb, ib) = common::triangle(&mut ctx);
    let ubo = ctx.create_uniform_buffer(16, None).expect("create ubo");
    let desc = ctx
        .create_descriptor("globals", DescriptorType::UniformBuffer, DescriptorResource::Buffer(ubo))
        .expect("create descriptor");
    let storage = ctx.create_storage_buffer(16, None).expect("create storage buffer");
    ctx.frame().expect("warm-up frame");

    ctx.update_buffer(storage, 0, &[0xAB; 16]).expect("queue update");
    let draw = ctx.begin_draw().vertex_buffer(vb).index_buffer(ib).descriptor(desc);
    ctx.submit(draw, program).expect("submit draw");
    // Destroyed between submit and frame: recording must fail.
    ctx.destroy_descriptor(desc).expect("destroy descriptor");

    let submissions = ctx.backend().log().submissions.len();
    match ctx.frame() {
        Err(RenderError::InvalidHandle { kind, .. }) => assert_eq!(kind, "descriptor"),
        other => panic!("expected InvalidHandle, got {:?}", other),
    }
    assert_eq!(ctx.backend().log().submissions.len(), submissions);
    assert_eq!(ctx.current_frame(), 1, "a failed frame must not advance");
    assert_eq!(ctx.pending_uploads(), 1, "the update stays queued");
    assert_eq!(ctx.queued_draws(), 0);

    assert_eq!(ctx.frame().expect("next frame"), FrameStatus::Presented);
    ctx.wait_idle().expect("wait idle");
    let raw = ctx.buffer_raw(storage).expect("storage buffer");
    let contents = ctx.backend().buffer_contents(raw).expect("contents");
    println!("storage contents: {:?}", &contents[..4]);
    assert_eq!(contents, &[0xAB; 16]);
    assert_eq!(ctx.pending_uploads(), 0);
    common::assert_no_validation_errors(&ctx);
}

#[test]
fn test_descriptor_pool_exhaustion_is_retryable() {
    let mut config = common::test_config();
    config.descriptors.max_sets = 1;
    let mut ctx = common::context_with(config);
    let program = common::program(&mut ctx, &[(0, DescriptorType::UniformBuffer)]);
    let (vb, ib) = common::triangle(&mut ctx);
    let ubo = ctx.create_uniform_buffer(16, None).expect("create ubo");
    let first = ctx
        .create_descriptor("first", DescriptorType::UniformBuffer, DescriptorResource::Buffer(ubo))
        .expect("first");
    let second = ctx
        .create_descriptor("second", DescriptorType::UniformBuffer, DescriptorResource::Buffer(ubo))
        .expect("second");
    let pending = ctx.pending_uploads();

    for desc in [first, second] {
        let draw = ctx.begin_draw().vertex_buffer(vb).index_buffer(ib).descriptor(desc);
        ctx.submit(draw, program).expect("submit draw");
    }
    match ctx.frame() {
        Err(RenderError::Vulkan { call, result }) => {
            assert_eq!(call, "vkAllocateDescriptorSets");
            assert_eq!(result, vk::Result::ERROR_OUT_OF_POOL_MEMORY);
        }
        other => panic!("expected pool exhaustion, got {:?}", other),
    }
    assert!(ctx.backend().log().submissions.is_empty());
    assert_eq!(ctx.current_frame(), 0);
    assert_eq!(ctx.pending_uploads(), pending);

    let draw = ctx.begin_draw().vertex_buffer(vb).index_buffer(ib).descriptor(first);
    ctx.submit(draw, program).expect("submit draw");
    assert_eq!(ctx.frame().expect("frame"), FrameStatus::Presented);
    assert_eq!(ctx.pending_uploads(), 0);
    assert_eq!(ctx.descriptor_set_cache_len(), 1);
    common::assert_no_validation_errors(&ctx);
}

#[test]
fn test_dropped_frame_keeps_texture_layouts() {
    let mut ctx = common::context();
    let program = common::program(&mut ctx, &[(0, DescriptorType::CombinedImageSampler)]);
    let (vb, ib) = common::triangle(&mut ctx);
    let texture = ctx
        .create_texture(TextureInfo::new(2, 2, TextureFormat::Rgba8Unorm))
        .expect("create texture");
    ctx.update_texture(texture, 0, &[0x40; 16]).expect("queue texture update");
    let desc = ctx
        .create_descriptor(
            "albedo",
            DescriptorType::CombinedImageSampler,
            DescriptorResource::Texture(Some(texture)),
        )
        .expect("create descriptor");

    let draw = ctx.begin_draw().vertex_buffer(vb).index_buffer(ib).descriptor(desc);
    ctx.submit(draw, program).expect("submit draw");
    ctx.backend_mut().script_acquire(AcquireOutcome::Stale);
    assert_eq!(ctx.frame().expect("dropped frame"), FrameStatus::Dropped);

    // The retry records the same transitions from the real layouts.
    let draw = ctx.begin_draw().vertex_buffer(vb).index_buffer(ib).descriptor(desc);
    ctx.submit(draw, program).expect("resubmit draw");
    assert_eq!(ctx.frame().expect("frame"), FrameStatus::Presented);
    ctx.wait_idle().expect("wait idle");

    let image = ctx.texture_image(texture).expect("texture image");
    assert_eq!(
        ctx.backend().image_layout(image),
        Some(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)
    );
    assert_eq!(ctx.backend().image_contents(image), Some(&[0x40u8; 16][..]));
    common::assert_no_validation_errors(&ctx);
}
