// =============================================================================
// LEGACY SHIM - headless driver
// =============================================================================
//
// Runs a scripted legacy-API workload against the streaming engine so its
// frame pacing, ring usage and caches can be watched in the logs.
//
// FRAME FLOW:
// 1. Clear the back buffer
// 2. Update transforms and lights (dirty bits only)
// 3. Discard-lock the dynamic vertex buffer, draw, then append with NoOverwrite
// 4. Draw an indexed static mesh and a user-pointer fan
// 5. Present (persist dynamic buffers, signal fence, rotate back buffer)
//
// =============================================================================

use anyhow::{Context, Result};
use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec3};
use std::fs::OpenOptions;
use std::sync::Arc;
use std::time::Instant;

use legacy_shim::backend::host::HostDevice;
use legacy_shim::backend::{GpuDevice, IndexFormat};
use legacy_shim::config::{BackendKind, Config};
use legacy_shim::shaders::{PrecompiledShaders, FVF_DIFFUSE, FVF_XYZ};
use legacy_shim::state::{ClearFlags, Light, LightType, Material, PrimitiveType, RenderStateType, TransformKind};
use legacy_shim::{LegacyDevice, LockMode};

/// Position + packed diffuse colour (FVF_XYZ | FVF_DIFFUSE).
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct Vertex {
    position: [f32; 3],
    color: u32,
}

const STRIDE: u32 = std::mem::size_of::<Vertex>() as u32;
const TRIANGLES_PER_BATCH: u32 = 64;

// =============================================================================
// ENTRY POINT
// =============================================================================

fn main() -> Result<()> {
    // Load configuration from config.toml
    let config = Config::load();

    // Initialize logging
    init_logging(&config)?;
    log::info!("Starting legacy shim driver");
    log::info!(
        "Back buffers: {} at {}x{}, ring {} KiB",
        config.device.back_buffer_count,
        config.presentation.width,
        config.presentation.height,
        config.device.ring_buffer_size / 1024
    );

    let gpu = create_backend(&config)?;
    let shaders = PrecompiledShaders::builtin();
    if !shaders.has_code() {
        log::warn!("Built without glslc; fixed-function shaders are empty");
    }

    let mut device = LegacyDevice::new(gpu.clone(), Box::new(shaders), &config.device_settings())
        .context("Failed to create legacy device")?;

    let mut workload = Workload::new(&mut device)?;
    let started = Instant::now();
    for frame in 0..config.demo.frames {
        workload
            .render(&mut device, frame, config.presentation.clear_color)
            .with_context(|| format!("Frame {} failed", frame))?;

        if config.debug.stats_interval > 0 && (frame + 1) % config.debug.stats_interval == 0 {
            log_stats(&device, frame + 1, started);
        }
    }

    log_stats(&device, config.demo.frames, started);
    drop(device);
    gpu.wait_idle().context("Failed to drain the GPU")?;
    log::info!("Done");
    Ok(())
}

/// Initialize logging with optional file output
fn init_logging(config: &Config) -> Result<()> {
    use env_logger::{Builder, Target};

    let mut builder = Builder::from_default_env();
    builder.filter_level(config.log_level());

    if config.debug.log_to_file {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&config.debug.log_file)
            .with_context(|| format!("Failed to open log file {}", config.debug.log_file))?;
        builder.target(Target::Pipe(Box::new(file)));
    }

    builder.init();
    Ok(())
}

fn create_backend(config: &Config) -> Result<Arc<dyn GpuDevice>> {
    match config.device.backend {
        BackendKind::Host => Ok(Arc::new(HostDevice::with_completion(config.device.host_completion))),

        #[cfg(feature = "vulkan")]
        BackendKind::Vulkan => {
            let enable_validation = cfg!(debug_assertions) && config.device.validation_layers;
            let device = legacy_shim::backend::VulkanDevice::new("legacy-shim", enable_validation)
                .context("Failed to create Vulkan device")?;
            Ok(device)
        }

        #[cfg(not(feature = "vulkan"))]
        BackendKind::Vulkan => {
            log::warn!("Built without the `vulkan` feature; falling back to the host backend");
            Ok(Arc::new(HostDevice::with_completion(config.device.host_completion)))
        }
    }
}

fn log_stats(device: &LegacyDevice, frames: u64, started: Instant) {
    let stats = device.frames().stats();
    let caches = device.resolver().stats();
    let elapsed = started.elapsed().as_secs_f32().max(f32::EPSILON);
    log::info!(
        "{} frames ({:.0} fps): {} blocking waits, {} buffers / {} KiB persisted, ring {} KiB in use",
        frames,
        frames as f32 / elapsed,
        stats.blocking_waits,
        stats.persisted_buffers,
        stats.persisted_bytes / 1024,
        stats.ring_used_bytes / 1024
    );
    log::info!(
        "Caches: pipelines {}/{} hit/miss, pixel shaders {}/{}, samplers {}/{}, {} constant uploads",
        caches.pipelines.hits,
        caches.pipelines.misses,
        caches.pixel_shaders.hits,
        caches.pixel_shaders.misses,
        caches.samplers.hits,
        caches.samplers.misses,
        caches.uploads
    );
}

// =============================================================================
// WORKLOAD
// =============================================================================

struct Workload {
    dynamic_vertices: legacy_shim::StreamingBuffer,
    static_vertices: legacy_shim::StreamingBuffer,
    indices: legacy_shim::IndexBuffer,
}

impl Workload {
    fn new(device: &mut LegacyDevice) -> Result<Self> {
        let batch_bytes = TRIANGLES_PER_BATCH * 3 * STRIDE;
        let dynamic_vertices = device.create_vertex_buffer(batch_bytes * 2, true)?;

        // ─── Static quad, written once ───
        let quad = [
            vertex(-0.5, -0.5, 0xFFFF_0000),
            vertex(0.5, -0.5, 0xFF00_FF00),
            vertex(0.5, 0.5, 0xFF00_00FF),
            vertex(-0.5, 0.5, 0xFFFF_FFFF),
        ];
        let static_vertices = device.create_vertex_buffer(4 * STRIDE, false)?;
        device
            .lock(&static_vertices, 0, 4 * STRIDE, LockMode::Normal)?
            .write(0, bytemuck::cast_slice(&quad))?;

        let index_data: [u16; 6] = [0, 1, 2, 0, 2, 3];
        let indices = device.create_index_buffer(12, IndexFormat::U16, false)?;
        device
            .lock(&indices, 0, 12, LockMode::Normal)?
            .write(0, bytemuck::cast_slice(&index_data))?;

        // ─── Fixed-function state ───
        device.set_fvf(FVF_XYZ | FVF_DIFFUSE);
        device.set_render_state(RenderStateType::Lighting, 1);
        device.set_render_state(RenderStateType::Ambient, 0xFF20_2020);
        device.set_material(Material {
            diffuse: [1.0; 4],
            ambient: [1.0; 4],
            ..Default::default()
        });
        device.set_light(
            0,
            Light {
                light_type: LightType::Directional,
                direction: Vec3::new(0.0, -1.0, 1.0).normalize(),
                ..Default::default()
            },
        );
        device.light_enable(0, true)?;
        device.set_transform(
            TransformKind::View,
            Mat4::look_at_rh(Vec3::new(0.0, 0.0, 3.0), Vec3::ZERO, Vec3::Y),
        )?;
        device.set_transform(
            TransformKind::Projection,
            Mat4::perspective_rh(60f32.to_radians(), 16.0 / 9.0, 0.1, 100.0),
        )?;

        Ok(Self {
            dynamic_vertices,
            static_vertices,
            indices,
        })
    }

    fn render(&mut self, device: &mut LegacyDevice, frame: u64, clear_color: u32) -> Result<()> {
        device.clear(ClearFlags::TARGET | ClearFlags::ZBUFFER, clear_color, 1.0, 0);

        let angle = frame as f32 * 0.02;
        device.set_transform(TransformKind::World, Mat4::from_rotation_y(angle))?;

        // ─── Dynamic geometry: discard, then append ───
        let batch = particle_batch(frame, 0);
        let batch_bytes = batch.len() as u32 * STRIDE;
        device
            .lock(&self.dynamic_vertices, 0, batch_bytes, LockMode::Discard)?
            .write(0, bytemuck::cast_slice(&batch))?;
        device.set_stream_source(0, Some(self.dynamic_vertices.clone()), STRIDE)?;
        device.draw_primitive(PrimitiveType::TriangleList, 0, TRIANGLES_PER_BATCH)?;

        let batch = particle_batch(frame, 1);
        device
            .lock(&self.dynamic_vertices, batch_bytes, batch_bytes, LockMode::NoOverwrite)?
            .write(0, bytemuck::cast_slice(&batch))?;
        device.draw_primitive(PrimitiveType::TriangleList, TRIANGLES_PER_BATCH * 3, TRIANGLES_PER_BATCH)?;

        // ─── Static indexed quad ───
        device.set_transform(TransformKind::World, Mat4::from_translation(Vec3::new(1.0, 0.0, 0.0)))?;
        device.set_stream_source(0, Some(self.static_vertices.clone()), STRIDE)?;
        device.set_indices(Some(self.indices.clone()), 0);
        device.draw_indexed_primitive(PrimitiveType::TriangleList, 0, 4, 0, 2)?;

        // ─── User-pointer fan ───
        let fan: Vec<Vertex> = (0..8)
            .map(|i| {
                if i == 0 {
                    return vertex(0.0, 0.0, 0xFFFF_FF00);
                }
                let a = (i - 1) as f32 / 6.0 * std::f32::consts::TAU + angle;
                vertex(a.cos() * 0.3, a.sin() * 0.3, 0xFF80_80FF)
            })
            .collect();
        device.set_transform(TransformKind::World, Mat4::from_translation(Vec3::new(-1.0, 0.0, 0.0)))?;
        device.draw_primitive_up(PrimitiveType::TriangleFan, 6, bytemuck::cast_slice(&fan), STRIDE)?;

        device.present()?;
        Ok(())
    }
}

fn vertex(x: f32, y: f32, color: u32) -> Vertex {
    Vertex {
        position: [x, y, 0.0],
        color,
    }
}

/// A ring of small triangles that drifts with the frame number.
fn particle_batch(frame: u64, half: u32) -> Vec<Vertex> {
    let mut out = Vec::with_capacity(TRIANGLES_PER_BATCH as usize * 3);
    for i in 0..TRIANGLES_PER_BATCH {
        let t = (i + half * TRIANGLES_PER_BATCH) as f32 * 0.05 + frame as f32 * 0.01;
        let (x, y) = (t.cos() * 0.8, t.sin() * 0.8);
        out.push(vertex(x, y, 0xFFFF_8000));
        out.push(vertex(x + 0.02, y, 0xFFFF_8000));
        out.push(vertex(x, y + 0.02, 0xFFFF_8000));
    }
    out
}
