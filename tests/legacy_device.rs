use std::sync::Arc;

use legacy_shim::backend::host::{CompletionMode, HostDevice};
use legacy_shim::backend::{GpuDevice, IndexFormat};
use legacy_shim::shaders::{PrecompiledShaders, FVF_DIFFUSE, FVF_XYZ};
use legacy_shim::state::{ClearFlags, PrimitiveType};
use legacy_shim::{DeviceSettings, DrawError, FrameConfig, LegacyDevice, LockMode};
use pretty_assertions::assert_eq;

// Position (3 floats) plus a packed diffuse colour.
const STRIDE: u32 = 16;

fn device(mode: CompletionMode) -> (Arc<HostDevice>, LegacyDevice) {
    let host = Arc::new(HostDevice::with_completion(mode));
    let gpu: Arc<dyn GpuDevice> = host.clone();
    let settings = DeviceSettings {
        frame: FrameConfig {
            ring_buffer_size: 256 * 1024,
            width: 200,
            height: 100,
            ..Default::default()
        },
        ..Default::default()
    };
    let mut device = LegacyDevice::new(gpu, Box::new(PrecompiledShaders::new(&[], &[])), &settings).unwrap();
    device.set_fvf(FVF_XYZ | FVF_DIFFUSE);
    (host, device)
}

fn vertices(count: usize, seed: u8) -> Vec<u8> {
    (0..count * STRIDE as usize).map(|i| seed.wrapping_add(i as u8)).collect()
}

#[test]
fn draw_primitive_reads_the_bound_stream() {
    let (host, mut device) = device(CompletionMode::Immediate);
    let data = vertices(3, 0);
    let vb = device.create_vertex_buffer(data.len() as u32, false).unwrap();
    device
        .lock(&vb, 0, data.len() as u32, LockMode::Normal)
        .unwrap()
        .copy_from_slice(&data);
    device.set_stream_source(0, Some(vb), STRIDE).unwrap();

    device.draw_primitive(PrimitiveType::TriangleList, 0, 1).unwrap();
    device.present().unwrap();

    let draws = host.draws();
    assert_eq!(draws.len(), 1);
    assert_eq!(draws[0].vertex_count, 3);
    assert!(!draws[0].indexed);
    assert_eq!(draws[0].strides[&0], STRIDE);
    assert_eq!(draws[0].vertices[&0], data);
}

#[test]
fn primitive_counts_become_vertex_counts() {
    let (host, mut device) = device(CompletionMode::Immediate);
    let vb = device.create_vertex_buffer(64 * STRIDE, false).unwrap();
    device.set_stream_source(0, Some(vb), STRIDE).unwrap();

    device.draw_primitive(PrimitiveType::PointList, 0, 5).unwrap();
    device.draw_primitive(PrimitiveType::LineList, 0, 5).unwrap();
    device.draw_primitive(PrimitiveType::LineStrip, 0, 5).unwrap();
    device.draw_primitive(PrimitiveType::TriangleList, 0, 5).unwrap();
    device.draw_primitive(PrimitiveType::TriangleStrip, 2, 5).unwrap();
    device.present().unwrap();

    let counts: Vec<_> = host.draws().iter().map(|d| (d.vertex_count, d.first_vertex)).collect();
    assert_eq!(counts, vec![(5, 0), (10, 0), (6, 0), (15, 0), (7, 2)]);
}

#[test]
fn fans_need_the_user_pointer_path() {
    let (host, mut device) = device(CompletionMode::Immediate);
    assert!(matches!(
        device.draw_primitive(PrimitiveType::TriangleFan, 0, 2),
        Err(DrawError::UnsupportedPrimitive(PrimitiveType::TriangleFan))
    ));

    let data = vertices(4, 10);
    device
        .draw_primitive_up(PrimitiveType::TriangleFan, 2, &data, STRIDE)
        .unwrap();
    device.present().unwrap();

    let draws = host.draws();
    assert_eq!(draws[0].vertex_count, 6);
    let stride = STRIDE as usize;
    let vertex = |i: usize| &data[i * stride..(i + 1) * stride];
    let expected: Vec<u8> = [0, 1, 2, 0, 2, 3].iter().flat_map(|&i| vertex(i).to_vec()).collect();
    assert_eq!(draws[0].vertices[&0], expected);
}

#[test]
fn user_pointer_draws_validate_their_input() {
    let (_host, mut device) = device(CompletionMode::Immediate);
    let data = vertices(2, 0);
    assert!(matches!(
        device.draw_primitive_up(PrimitiveType::TriangleList, 1, &data, STRIDE),
        Err(DrawError::InvalidCall(_))
    ));
    assert!(matches!(
        device.draw_primitive_up(PrimitiveType::TriangleList, 1, &data, 0),
        Err(DrawError::InvalidCall(_))
    ));
}

#[test]
fn indexed_draws_bind_the_index_buffer() {
    let (host, mut device) = device(CompletionMode::Immediate);
    let vb = device.create_vertex_buffer(4 * STRIDE, false).unwrap();
    device.set_stream_source(0, Some(vb), STRIDE).unwrap();

    assert!(matches!(
        device.draw_indexed_primitive(PrimitiveType::TriangleList, 0, 4, 0, 2),
        Err(DrawError::InvalidCall(_))
    ));

    let indices: [u16; 6] = [0, 1, 2, 2, 1, 3];
    let ib = device.create_index_buffer(12, IndexFormat::U16, true).unwrap();
    device
        .lock(&ib, 0, 12, LockMode::Discard)
        .unwrap()
        .write(0, bytemuck::cast_slice(&indices))
        .unwrap();
    device.set_indices(Some(ib), 1);

    device
        .draw_indexed_primitive(PrimitiveType::TriangleList, 0, 4, 0, 2)
        .unwrap();
    device.present().unwrap();

    let draws = host.draws();
    assert!(draws[0].indexed);
    assert_eq!(draws[0].vertex_count, 6);
    assert_eq!(draws[0].base_vertex, 1);
    let bound = draws[0].indices.as_ref().unwrap();
    assert_eq!(&bound[..12], bytemuck::cast_slice::<u16, u8>(&indices));
}

#[test]
fn dynamic_streams_can_be_refilled_between_draws() {
    let (host, mut device) = device(CompletionMode::Deferred);
    let vb = device.create_vertex_buffer(3 * STRIDE, true).unwrap();
    device.set_stream_source(0, Some(vb.clone()), STRIDE).unwrap();

    let first = vertices(3, 0);
    let second = vertices(3, 100);
    for data in [&first, &second] {
        device
            .lock(&vb, 0, 0, LockMode::Discard)
            .unwrap()
            .write(0, data)
            .unwrap();
        device.draw_primitive(PrimitiveType::TriangleList, 0, 1).unwrap();
    }
    device.present().unwrap();
    host.retire_all();

    let draws = host.draws();
    assert_eq!(draws.len(), 2);
    assert_eq!(draws[0].vertices[&0], first);
    assert_eq!(draws[1].vertices[&0], second);

    // The last contents were persisted for later frames.
    let backing = vb.backing();
    let host_buffer = backing
        .as_any()
        .downcast_ref::<legacy_shim::backend::host::HostBuffer>()
        .unwrap();
    assert_eq!(host_buffer.read(0, second.len()), second);
}

#[test]
fn zero_primitives_draw_nothing() {
    let (host, mut device) = device(CompletionMode::Immediate);
    device.draw_primitive(PrimitiveType::TriangleList, 0, 0).unwrap();
    device
        .draw_primitive_up(PrimitiveType::TriangleList, 0, &[], STRIDE)
        .unwrap();
    device.present().unwrap();
    assert!(host.draws().is_empty());
}

#[test]
fn draws_need_a_vertex_declaration() {
    let (_host, mut device) = device(CompletionMode::Immediate);
    device.set_fvf(0);
    assert!(matches!(
        device.draw_primitive(PrimitiveType::TriangleList, 0, 1),
        Err(DrawError::MissingVertexShader)
    ));
}

#[test]
fn present_rotates_back_buffers() {
    let (host, mut device) = device(CompletionMode::Immediate);
    assert_eq!(device.frames().current_back_buffer(), 0);

    device.clear(ClearFlags::TARGET | ClearFlags::ZBUFFER, 0xFF00_FF00, 1.0, 0);
    device.present().unwrap();
    assert_eq!(device.frames().current_back_buffer(), 1);
    device.present().unwrap();
    assert_eq!(device.frames().current_back_buffer(), 0);

    let clears = host.clears();
    assert_eq!(clears.len(), 1);
    assert_eq!(clears[0].flags, ClearFlags::TARGET | ClearFlags::ZBUFFER);
    assert_eq!(clears[0].color, [0.0, 1.0, 0.0, 1.0]);
    assert_eq!(host.stats().presents, 2);
}

#[test]
fn reset_resizes_and_unbinds_streams() {
    let (host, mut device) = device(CompletionMode::Immediate);
    let vb = device.create_vertex_buffer(3 * STRIDE, false).unwrap();
    device.set_stream_source(0, Some(vb), STRIDE).unwrap();

    device.reset(320, 240).unwrap();
    assert_eq!(device.frames().extent(), (320, 240));
    assert_eq!(device.resolver().viewport(device.frames()).width, 320);

    device.draw_primitive(PrimitiveType::TriangleList, 0, 1).unwrap();
    device.present().unwrap();
    assert!(host.draws()[0].vertices.is_empty());
}

#[test]
fn oversized_draw_ranges_are_invalid_calls() {
    let (host, mut device) = device(CompletionMode::Immediate);
    let vb = device.create_vertex_buffer(4 * STRIDE, false).unwrap();
    device.set_stream_source(0, Some(vb), STRIDE).unwrap();

    assert!(matches!(
        device.draw_primitive(PrimitiveType::TriangleStrip, u32::MAX - 1, 4),
        Err(DrawError::InvalidCall(_))
    ));
    assert!(matches!(
        device.draw_primitive(PrimitiveType::TriangleList, 0, u32::MAX / 2),
        Err(DrawError::InvalidCall(_))
    ));
    assert!(matches!(
        device.draw_primitive_up(PrimitiveType::TriangleFan, u32::MAX, &[], STRIDE),
        Err(DrawError::InvalidCall(_))
    ));

    let ib = device.create_index_buffer(12, IndexFormat::U16, false).unwrap();
    device.set_indices(Some(ib), 0);
    assert!(matches!(
        device.draw_indexed_primitive(PrimitiveType::TriangleList, u32::MAX, 2, 0, 1),
        Err(DrawError::InvalidCall(_))
    ));

    device.present().unwrap();
    assert!(host.draws().is_empty());
}
