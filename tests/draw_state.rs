use std::sync::Arc;

use glam::{Mat4, Vec3};
use legacy_shim::backend::host::{CompletionMode, HostDevice, HostTexture};
use legacy_shim::backend::{ConstantSlot, GpuDevice, GpuTexture, PrimitiveTopology, TextureFormat};
use legacy_shim::shaders::{PrecompiledShaders, FVF_DIFFUSE, FVF_XYZ};
use legacy_shim::state::{Material, RenderStateType, TransformKind};
use legacy_shim::{DirtyFlags, DrawError, DrawStateResolver, FrameConfig, FrameScheduler, ResolverConfig};
use pretty_assertions::assert_eq;

struct Harness {
    host: Arc<HostDevice>,
    frames: FrameScheduler,
    resolver: DrawStateResolver,
}

impl Harness {
    fn new(mode: CompletionMode) -> Self {
        let host = Arc::new(HostDevice::with_completion(mode));
        let device: Arc<dyn GpuDevice> = host.clone();
        let frames = FrameScheduler::new(
            device.clone(),
            &FrameConfig {
                ring_buffer_size: 256 * 1024,
                width: 128,
                height: 128,
                ..Default::default()
            },
        )
        .unwrap();
        let mut resolver = DrawStateResolver::new(
            device,
            Box::new(PrecompiledShaders::new(&[], &[])),
            ResolverConfig::default(),
        )
        .unwrap();
        resolver.set_fvf(FVF_XYZ | FVF_DIFFUSE);
        Self { host, frames, resolver }
    }

    fn draw(&mut self) -> Result<(), DrawError> {
        self.resolver
            .prepare_draw(&mut self.frames, PrimitiveTopology::TriangleList)?;
        self.frames.command_list().draw(3, 0);
        Ok(())
    }
}

#[test]
fn prepare_flushes_every_dirty_category() {
    let mut h = Harness::new(CompletionMode::Immediate);
    assert_eq!(h.resolver.dirty(), DirtyFlags::all());

    h.draw().unwrap();
    assert_eq!(h.resolver.dirty(), DirtyFlags::empty());
    assert_eq!(h.resolver.stats().uploads, 4);
}

#[test]
fn repeated_draws_hit_the_pipeline_cache() {
    let mut h = Harness::new(CompletionMode::Immediate);

    h.draw().unwrap();
    h.draw().unwrap();

    let stats = h.resolver.stats();
    assert_eq!(stats.pipelines.misses, 1);
    assert_eq!(stats.pipelines.hits, 1);
    assert_eq!(stats.vertex_shaders.misses, 1);
    assert_eq!(h.host.stats().pipelines_created, 1);
    // Nothing changed between the draws.
    assert_eq!(stats.uploads, 4);

    // A different topology is a different pipeline.
    h.resolver
        .prepare_draw(&mut h.frames, PrimitiveTopology::LineList)
        .unwrap();
    assert_eq!(h.host.stats().pipelines_created, 2);
}

#[test]
fn a_new_command_list_rebinds_everything() {
    let mut h = Harness::new(CompletionMode::Immediate);

    h.draw().unwrap();
    h.frames.submit(true).unwrap();
    h.draw().unwrap();

    assert_eq!(h.resolver.stats().uploads, 8);
    assert_eq!(h.resolver.stats().pipelines.hits, 1);

    h.frames.submit(true).unwrap();
    let draws = h.host.draws();
    assert_eq!(draws.len(), 2);
    // The second list starts without bindings, so every slot must be rebound.
    assert!(draws[1].pipeline.is_some());
    assert_eq!(draws[1].constants.len(), 4);
}

#[test]
fn each_draw_sees_its_own_constants() {
    let mut h = Harness::new(CompletionMode::Deferred);

    h.resolver
        .set_transform(TransformKind::World, Mat4::from_translation(Vec3::X))
        .unwrap();
    h.draw().unwrap();
    h.resolver
        .set_transform(TransformKind::World, Mat4::from_translation(Vec3::Y))
        .unwrap();
    h.draw().unwrap();

    h.frames.submit(true).unwrap();
    h.host.retire_all();

    let draws = h.host.draws();
    assert_eq!(draws.len(), 2);
    let first = &draws[0].constants[&ConstantSlot::Transforms];
    let second = &draws[1].constants[&ConstantSlot::Transforms];
    assert_ne!(first, second);
    // Untouched slots share one upload.
    assert_eq!(
        draws[0].constants[&ConstantSlot::Pixel],
        draws[1].constants[&ConstantSlot::Pixel]
    );
    assert_eq!(h.resolver.stats().uploads, 5);
}

#[test]
fn material_reaches_the_pixel_constants() {
    let mut h = Harness::new(CompletionMode::Immediate);
    let diffuse = [0.25f32, 0.5, 0.75, 1.0];
    h.resolver.set_material(Material {
        diffuse,
        ..Default::default()
    });
    h.draw().unwrap();
    h.frames.submit(false).unwrap();

    let draws = h.host.draws();
    let pixel = &draws[0].constants[&ConstantSlot::Pixel];
    assert_eq!(&pixel[..16], bytemuck::cast_slice::<f32, u8>(&diffuse));
}

#[test]
fn lights_are_counted_only_while_lighting_is_on() {
    // num_lights follows the eight 112-byte light records.
    const NUM_LIGHTS: usize = 112 * 8;
    let num_lights = |bytes: &[u8]| u32::from_le_bytes(bytes[NUM_LIGHTS..NUM_LIGHTS + 4].try_into().unwrap());

    let mut h = Harness::new(CompletionMode::Immediate);
    h.resolver.light_enable(0, true).unwrap();
    h.resolver.light_enable(3, true).unwrap();
    h.draw().unwrap();

    h.resolver.set_render_state(RenderStateType::Lighting, 0);
    assert!(h.resolver.dirty().contains(DirtyFlags::LIGHTS));
    h.draw().unwrap();
    h.frames.submit(false).unwrap();

    let draws = h.host.draws();
    assert_eq!(num_lights(&draws[0].constants[&ConstantSlot::Lights]), 2);
    assert_eq!(num_lights(&draws[1].constants[&ConstantSlot::Lights]), 0);
}

#[test]
fn at_most_eight_lights_can_be_enabled() {
    let mut h = Harness::new(CompletionMode::Immediate);
    for index in 0..8 {
        h.resolver.light_enable(index, true).unwrap();
    }
    assert!(matches!(h.resolver.light_enable(8, true), Err(DrawError::InvalidCall(_))));

    // Re-enabling an active light is fine, and disabling frees a slot.
    h.resolver.light_enable(2, true).unwrap();
    h.resolver.light_enable(2, false).unwrap();
    h.resolver.light_enable(8, true).unwrap();
    assert_eq!(h.resolver.enabled_lights(), &[0, 1, 3, 4, 5, 6, 7, 8]);
}

#[test]
fn identical_samplers_are_created_once() {
    let mut h = Harness::new(CompletionMode::Immediate);

    h.draw().unwrap();
    let created = h.host.stats().samplers_created;
    assert_eq!(created, 1);

    h.frames.submit(true).unwrap();
    h.draw().unwrap();
    assert_eq!(h.host.stats().samplers_created, created);
    assert_eq!(h.resolver.stats().samplers.misses, 1);
}

#[test]
fn bound_textures_are_kept_alive_and_bound() {
    let mut h = Harness::new(CompletionMode::Immediate);
    let texture: Arc<dyn GpuTexture> = Arc::new(HostTexture::new(4, 4, TextureFormat::Bgra8Unorm));

    h.resolver.set_texture(0, Some(texture.clone())).unwrap();
    h.draw().unwrap();
    assert_eq!(h.frames.kept_alive_count(), 1);

    h.frames.submit(false).unwrap();
    let draws = h.host.draws();
    assert_eq!(draws[0].textures.get(&0), Some(&texture.descriptor()));
    assert!(h.resolver.set_texture(8, None).is_err());
}

#[test]
fn drawing_without_a_vertex_shader_fails() {
    let mut h = Harness::new(CompletionMode::Immediate);
    h.resolver.set_fvf(0);
    assert!(matches!(h.draw(), Err(DrawError::MissingVertexShader)));
}
