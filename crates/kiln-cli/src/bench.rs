//! Headless frame benchmark: drives a `RenderContext` over the software
//! device with randomized draws and reports the engine's counters.

use std::time::{Duration, Instant};

use anyhow::Context;
use kiln_core::{BufferHandle, DescriptorHandle, KilnConfig, ProgramHandle};
use kiln_protocol::draw::IDENTITY;
use kiln_protocol::resource::{DescriptorResource, DescriptorType, ShaderStage};
use kiln_protocol::ShaderReflection;
use kiln_render::backend::AcquireOutcome;
use kiln_render::shader::SPIRV_MAGIC;
use kiln_render::{FrameStatus, HeadlessBackend, RenderContext, RenderStats};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, info};

/// The software device never looks past the header.
const SPIRV_HEADER: [u32; 5] = [SPIRV_MAGIC, 0x0001_0300, 0, 1, 0];

/// Surface size the benchmark renders at.
const EXTENT: [u32; 2] = [1280, 720];

pub struct BenchOptions {
    pub frames: u32,
    pub draws: u32,
    pub programs: u32,
    pub stale_every: u32,
    pub seed: u64,
}

#[derive(Debug, serde::Serialize)]
pub struct BenchReport {
    pub frames: u32,
    pub presented: u32,
    pub present_stale: u32,
    pub dropped: u32,
    pub elapsed_ms: f64,
    pub frames_per_second: f64,
    pub descriptor_sets: usize,
    pub pipelines: usize,
    pub stats: RenderStats,
}

struct Scene {
    programs: Vec<ProgramHandle>,
    globals: DescriptorHandle,
    globals_buffer: BufferHandle,
    vertices: BufferHandle,
    indices: BufferHandle,
}

fn build_scene(
    ctx: &mut RenderContext<HeadlessBackend>,
    programs: u32,
) -> anyhow::Result<Scene> {
    let mut handles = Vec::with_capacity(programs as usize);
    for _ in 0..programs {
        let vs = ctx
            .create_shader(
                &SPIRV_HEADER,
                ShaderReflection::new(ShaderStage::Vertex)
                    .with_binding(0, DescriptorType::UniformBuffer),
            )
            .context("create vertex shader")?;
        let fs = ctx
            .create_shader(
                &SPIRV_HEADER,
                ShaderReflection::new(ShaderStage::Fragment)
                    .with_binding(0, DescriptorType::UniformBuffer)
                    .with_binding(1, DescriptorType::CombinedImageSampler),
            )
            .context("create fragment shader")?;
        handles.push(ctx.create_program(Some(vs), Some(fs)).context("link program")?);
        // Linked pipelines keep what they need from the modules.
        ctx.destroy_shader(vs)?;
        ctx.destroy_shader(fs)?;
    }

    // A unit quad, pulled by address in the vertex stage.
    let quad: [f32; 16] = [
        -0.5, -0.5, 0.0, 1.0, //
        0.5, -0.5, 0.0, 1.0, //
        0.5, 0.5, 0.0, 1.0, //
        -0.5, 0.5, 0.0, 1.0,
    ];
    let indices: [u32; 6] = [0, 1, 2, 2, 3, 0];
    let vertices = ctx
        .create_vertex_buffer(64, Some(bytemuck::cast_slice(&quad)))
        .context("create vertex buffer")?;
    let indices = ctx
        .create_index_buffer(24, Some(bytemuck::cast_slice(&indices)))
        .context("create index buffer")?;
    let globals_buffer = ctx
        .create_uniform_buffer(64, None)
        .context("create uniform buffer")?;
    let globals = ctx.create_descriptor(
        "globals",
        DescriptorType::UniformBuffer,
        DescriptorResource::Buffer(globals_buffer),
    )?;

    Ok(Scene {
        programs: handles,
        globals,
        globals_buffer,
        vertices,
        indices,
    })
}

pub fn run(config: KilnConfig, options: &BenchOptions) -> anyhow::Result<BenchReport> {
    if options.programs == 0 {
        anyhow::bail!("--programs must be at least 1");
    }

    let mut ctx = RenderContext::new(HeadlessBackend::new(), config, EXTENT)
        .context("failed to create render context")?;
    let scene = build_scene(&mut ctx, options.programs)?;
    let albedo = ctx.create_descriptor(
        "albedo",
        DescriptorType::CombinedImageSampler,
        DescriptorResource::Texture(None),
    )?;
    let mut rng = StdRng::seed_from_u64(options.seed);

    info!(
        frames = options.frames,
        draws = options.draws,
        programs = options.programs,
        seed = options.seed,
        "starting headless bench"
    );

    let mut presented = 0;
    let mut present_stale = 0;
    let mut dropped = 0;
    let start = Instant::now();
    for frame in 0..options.frames {
        if options.stale_every > 0 && frame > 0 && frame % options.stale_every == 0 {
            ctx.backend_mut().script_acquire(AcquireOutcome::Stale);
        }

        let time = frame as f32 / 60.0;
        let globals: [f32; 16] = [time; 16];
        ctx.update_buffer(scene.globals_buffer, 0, bytemuck::cast_slice(&globals))?;

        for i in 0..options.draws {
            let mut model = IDENTITY;
            model[12] = rng.gen_range(-1.0..1.0);
            model[13] = rng.gen_range(-1.0..1.0);
            model[14] = rng.gen_range(0.0..1.0);
            let program = scene.programs[(i % options.programs) as usize];
            let draw = ctx
                .begin_draw()
                .transform(model)
                .vertex_buffer(scene.vertices)
                .index_buffer(scene.indices)
                .descriptor(scene.globals)
                .descriptor(albedo);
            ctx.submit(draw, program)
                .with_context(|| format!("submit draw {} of frame {}", i, frame))?;
        }

        match ctx.frame().with_context(|| format!("frame {}", frame))? {
            FrameStatus::Presented => presented += 1,
            FrameStatus::PresentStale => present_stale += 1,
            FrameStatus::Dropped => {
                debug!(frame, "frame dropped");
                dropped += 1;
            }
        }
    }
    ctx.wait_idle()?;
    let elapsed = start.elapsed();

    let report = BenchReport {
        frames: options.frames,
        presented,
        present_stale,
        dropped,
        elapsed_ms: elapsed.as_secs_f64() * 1000.0,
        frames_per_second: fps(options.frames, elapsed),
        descriptor_sets: ctx.descriptor_set_cache_len(),
        pipelines: ctx.pipeline_cache_len(),
        stats: ctx.stats(),
    };
    let violations = ctx.backend().log().validation_errors.len();
    ctx.shutdown().context("shutdown")?;
    if violations > 0 {
        anyhow::bail!("headless device reported {} validation errors", violations);
    }
    Ok(report)
}

fn fps(frames: u32, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs > 0.0 {
        frames as f64 / secs
    } else {
        0.0
    }
}

pub fn print_report(report: &BenchReport) {
    let stats = &report.stats;
    println!("Headless bench");
    println!("  Frames:            {}", report.frames);
    println!("  Presented:         {}", report.presented);
    println!("  Present stale:     {}", report.present_stale);
    println!("  Dropped:           {}", report.dropped);
    println!(
        "  Elapsed:           {:.1} ms ({:.0} fps)",
        report.elapsed_ms, report.frames_per_second
    );
    println!("  Draws recorded:    {}", stats.draws_recorded);
    println!(
        "  Uploads:           {} direct, {} staged, {} skipped ({} bytes)",
        stats.uploads_direct, stats.uploads_staged, stats.uploads_skipped, stats.upload_bytes
    );
    println!("  Swapchain rebuilds: {}", stats.swapchain_rebuilds);
    println!(
        "  Descriptor sets:   {} cached ({} hits, {} misses)",
        report.descriptor_sets, stats.descriptor_set_hits, stats.descriptor_set_misses
    );
    println!("  Pipelines:         {}", report.pipelines);
}
