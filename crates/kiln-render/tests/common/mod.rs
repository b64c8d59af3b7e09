//! Shared setup for the render integration tests. Everything runs on the
//! headless backend, so no GPU is needed.

#![allow(dead_code)]

use kiln_core::config::KilnConfig;
use kiln_core::{BufferHandle, ProgramHandle, ShaderHandle};
use kiln_protocol::resource::{DescriptorType, ShaderStage};
use kiln_protocol::ShaderReflection;
use kiln_render::shader::SPIRV_MAGIC;
use kiln_render::{HeadlessBackend, RenderContext};

/// Smallest module the context accepts: a SPIR-V 1.3 header and nothing else.
pub const SPIRV_STUB: [u32; 5] = [SPIRV_MAGIC, 0x0001_0300, 0, 1, 0];

pub const EXTENT: [u32; 2] = [64, 48];

pub fn init_tracing() {
    kiln_common::logging::init_logging_with_default("debug");
}

/// Test defaults: a small default texture keeps the staging copies short.
pub fn test_config() -> KilnConfig {
    let mut config = KilnConfig::default();
    config.render.default_texture_size = 4;
    config
}

pub fn context() -> RenderContext<HeadlessBackend> {
    context_with(test_config())
}

pub fn context_with(config: KilnConfig) -> RenderContext<HeadlessBackend> {
    init_tracing();
    RenderContext::new(HeadlessBackend::new(), config, EXTENT).expect("create render context")
}

pub fn shader(
    ctx: &mut RenderContext<HeadlessBackend>,
    stage: ShaderStage,
    bindings: &[(u32, DescriptorType)],
) -> ShaderHandle {
    let mut reflection = ShaderReflection::new(stage);
    for &(binding, ty) in bindings {
        reflection = reflection.with_binding(binding, ty);
    }
    ctx.create_shader(&SPIRV_STUB, reflection)
        .expect("create shader")
}

/// Vertex + fragment program; the fragment stage declares `bindings`.
pub fn program(
    ctx: &mut RenderContext<HeadlessBackend>,
    bindings: &[(u32, DescriptorType)],
) -> ProgramHandle {
    let vs = shader(ctx, ShaderStage::Vertex, &[]);
    let fs = shader(ctx, ShaderStage::Fragment, bindings);
    ctx.create_program(Some(vs), Some(fs))
        .expect("create program")
}

/// One triangle: three vertices of (x, y, z, w) floats and three u32 indices.
pub fn triangle(ctx: &mut RenderContext<HeadlessBackend>) -> (BufferHandle, BufferHandle) {
    let vertices: [f32; 12] = [
        0.0, 0.5, 0.0, 1.0, //
        -0.5, -0.5, 0.0, 1.0, //
        0.5, -0.5, 0.0, 1.0,
    ];
    let indices: [u32; 3] = [0, 1, 2];
    let vb = ctx
        .create_vertex_buffer(48, Some(bytemuck::cast_slice(&vertices)))
        .expect("create vertex buffer");
    let ib = ctx
        .create_index_buffer(12, Some(bytemuck::cast_slice(&indices)))
        .expect("create index buffer");
    (vb, ib)
}

pub fn assert_no_validation_errors(ctx: &RenderContext<HeadlessBackend>) {
    let errors = &ctx.backend().log().validation_errors;
    assert!(errors.is_empty(), "validation errors: {:#?}", errors);
}
