//! Integration test: handle validity at the engine surface
//!
//! Never-issued, destroyed and stale generational handles must be rejected
//! by every operation that takes them.
//!
//! Run with: cargo test -p kiln-render --test handle_test -- --nocapture

mod common;

use kiln_core::{BufferHandle, DescriptorHandle, ProgramHandle, ShaderHandle, TextureHandle};
use kiln_protocol::resource::{DescriptorResource, DescriptorType, TextureFormat, TextureInfo};
use kiln_render::RenderError;

fn expect_invalid<T: std::fmt::Debug>(result: Result<T, RenderError>, kind: &str) {
    match result {
        Err(RenderError::InvalidHandle { kind: k, handle }) => {
            assert_eq!(k, kind);
            println!("rejected {} {}", k, handle);
        }
        other => panic!("expected InvalidHandle({}), got {:?}", kind, other),
    }
}

#[test]
fn test_never_created_handles_rejected() {
    let mut ctx = common::context();

    expect_invalid(ctx.destroy_buffer(BufferHandle::from_raw_parts(7, 1)), "buffer");
    expect_invalid(ctx.destroy_texture(TextureHandle::from_raw_parts(9, 3)), "texture");
    expect_invalid(ctx.destroy_shader(ShaderHandle::from_raw_parts(1, 1)), "shader");
    expect_invalid(ctx.destroy_program(ProgramHandle::from_raw_parts(2, 1)), "program");
    expect_invalid(ctx.destroy_descriptor(DescriptorHandle::from_raw_parts(4, 2)), "descriptor");
    expect_invalid(ctx.update_buffer(BufferHandle::NONE, 0, &[1, 2, 3]), "buffer");
    expect_invalid(ctx.update_texture(TextureHandle::NONE, 0, &[0; 4]), "texture");
    assert_eq!(ctx.pending_uploads(), 1, "rejected updates queue nothing");
}

#[test]
fn test_double_destroy_rejected() {
    let mut ctx = common::context();
    let buffer = ctx.create_uniform_buffer(64, None).expect("create buffer");
    ctx.destroy_buffer(buffer).expect("first destroy");
    expect_invalid(ctx.destroy_buffer(buffer), "buffer");

    let texture = ctx
        .create_texture(TextureInfo::new(2, 2, TextureFormat::Rgba8Unorm))
        .expect("create texture");
    ctx.destroy_texture(texture).expect("first destroy");
    expect_invalid(ctx.destroy_texture(texture), "texture");
    assert_eq!(ctx.backend().live_buffers(), 0);
}

#[test]
fn test_stale_handle_after_slot_reuse() {
    let mut ctx = common::context();
    let old = ctx.create_storage_buffer(32, None).expect("create buffer");
    ctx.destroy_buffer(old).expect("destroy");
    let new = ctx.create_storage_buffer(32, None).expect("create replacement");

    assert_eq!(old.index(), new.index(), "the freed slot is reused");
    assert_ne!(old, new);
    assert!(new.generation() > old.generation());

    expect_invalid(ctx.update_buffer(old, 0, &[1; 4]), "buffer");
    expect_invalid(ctx.buffer_raw(old), "buffer");
    ctx.update_buffer(new, 0, &[1; 4]).expect("update through the live handle");
}

#[test]
fn test_default_texture_cannot_be_destroyed() {
    let mut ctx = common::context();
    let default_texture = ctx.default_texture();
    expect_invalid(ctx.destroy_texture(default_texture), "texture");
    assert!(ctx.texture_image(default_texture).is_ok());
}

#[test]
fn test_submit_validates_every_handle() {
    let mut ctx = common::context();
    let program = common::program(&mut ctx, &[]);
    let (vb, ib) = common::triangle(&mut ctx);

    let missing_program = ctx.begin_draw().vertex_buffer(vb).index_buffer(ib);
    expect_invalid(
        ctx.submit(missing_program, ProgramHandle::from_raw_parts(5, 1)),
        "program",
    );

    let stale_instance = ctx.create_storage_buffer(16, None).expect("instance buffer");
    ctx.destroy_buffer(stale_instance).expect("destroy instance buffer");
    let draw = ctx
        .begin_draw()
        .vertex_buffer(vb)
        .index_buffer(ib)
        .instance_buffer(stale_instance);
    expect_invalid(ctx.submit(draw, program), "buffer");

    ctx.destroy_buffer(ib).expect("destroy index buffer");
    let draw = ctx.begin_draw().vertex_buffer(vb).index_buffer(ib);
    expect_invalid(ctx.submit(draw, program), "buffer");
    assert_eq!(ctx.queued_draws(), 0);
}

#[test]
fn test_descriptor_over_destroyed_resource_rejected() {
    let mut ctx = common::context();
    let program = common::program(&mut ctx, &[(0, DescriptorType::CombinedImageSampler)]);
    let (vb, ib) = common::triangle(&mut ctx);
    let texture = ctx
        .create_texture(TextureInfo::new(2, 2, TextureFormat::Rgba8Unorm))
        .expect("create texture");
    let desc = ctx
        .create_descriptor(
            "albedo",
            DescriptorType::CombinedImageSampler,
            DescriptorResource::Texture(Some(texture)),
        )
        .expect("create descriptor");
    ctx.destroy_texture(texture).expect("destroy texture");

    let draw = ctx.begin_draw().vertex_buffer(vb).index_buffer(ib).descriptor(desc);
    expect_invalid(ctx.submit(draw, program), "texture");

    // Creating a descriptor over a dead resource fails up front.
    expect_invalid(
        ctx.create_descriptor(
            "late",
            DescriptorType::CombinedImageSampler,
            DescriptorResource::Texture(Some(texture)),
        ),
        "texture",
    );
}

#[test]
fn test_program_from_destroyed_shader_rejected() {
    let mut ctx = common::context();
    let vs = common::shader(&mut ctx, kiln_protocol::resource::ShaderStage::Vertex, &[]);
    ctx.destroy_shader(vs).expect("destroy shader");
    expect_invalid(ctx.create_program(Some(vs), None), "shader");
}
