//! Integration test: draw builder and frame list
//!
//! Run with: cargo test -p kiln-protocol --test draw_test -- --nocapture

use kiln_core::{BufferHandle, DescriptorHandle, ProgramHandle};
use kiln_protocol::draw::{ViewportRect, IDENTITY, MAX_DRAW_DESCRIPTORS};
use kiln_protocol::{DrawBuilder, DrawPushConstants, Frame, ProtocolError};

fn buffers() -> (BufferHandle, BufferHandle) {
    (
        BufferHandle::from_raw_parts(1, 1),
        BufferHandle::from_raw_parts(2, 1),
    )
}

#[test]
fn test_builder_defaults_and_setters() {
    let (vb, ib) = buffers();
    let program = ProgramHandle::from_raw_parts(3, 1);
    let mut model = IDENTITY;
    model[13] = 2.5;
    let viewport = ViewportRect {
        x: 4.0,
        y: 8.0,
        width: 16.0,
        height: 32.0,
    };

    let draw = DrawBuilder::new()
        .transform(model)
        .camera_pos([1.0, 2.0, 3.0])
        .vertex_buffer(vb)
        .index_buffer(ib)
        .descriptor(DescriptorHandle::from_raw_parts(1, 1))
        .descriptor(DescriptorHandle::from_raw_parts(2, 1))
        .viewport(viewport)
        .build(program)
        .expect("build");

    assert_eq!(draw.program, program);
    assert_eq!(draw.model, model);
    assert_eq!(draw.view_proj, IDENTITY, "view_proj defaults to identity");
    assert_eq!(draw.camera_pos, [1.0, 2.0, 3.0]);
    assert!(draw.instance_buffer.is_none());
    assert_eq!(draw.descriptors.len(), 2);
    assert_eq!(draw.descriptors[1], DescriptorHandle::from_raw_parts(2, 1));
    assert_eq!(draw.viewport, Some(viewport));
}

#[test]
fn test_builder_requires_vertex_and_index_buffers() {
    let (vb, ib) = buffers();
    let program = ProgramHandle::from_raw_parts(1, 1);

    match DrawBuilder::new().index_buffer(ib).build(program) {
        Err(ProtocolError::MissingBuffer(which)) => assert_eq!(which, "vertex"),
        other => panic!("expected MissingBuffer, got {:?}", other),
    }
    match DrawBuilder::new().vertex_buffer(vb).build(program) {
        Err(ProtocolError::MissingBuffer(which)) => assert_eq!(which, "index"),
        other => panic!("expected MissingBuffer, got {:?}", other),
    }
}

#[test]
fn test_builder_rejects_descriptor_overflow() {
    let (vb, ib) = buffers();
    let mut builder = DrawBuilder::new().vertex_buffer(vb).index_buffer(ib);
    for i in 0..MAX_DRAW_DESCRIPTORS as u32 + 2 {
        builder = builder.descriptor(DescriptorHandle::from_raw_parts(i + 1, 1));
    }
    assert_eq!(builder.peek().descriptors.len(), MAX_DRAW_DESCRIPTORS);

    match builder.build(ProgramHandle::from_raw_parts(1, 1)) {
        Err(ProtocolError::TooManyDescriptors { count, max }) => {
            assert_eq!(count, MAX_DRAW_DESCRIPTORS + 2);
            assert_eq!(max, MAX_DRAW_DESCRIPTORS);
        }
        other => panic!("expected TooManyDescriptors, got {:?}", other),
    }
}

#[test]
fn test_frame_is_bounded_and_ordered() {
    let (vb, ib) = buffers();
    let mut frame = Frame::with_capacity(3);
    for i in 1..=3 {
        let draw = DrawBuilder::new()
            .vertex_buffer(vb)
            .index_buffer(ib)
            .build(ProgramHandle::from_raw_parts(i, 1))
            .expect("build");
        frame.push(draw).expect("push");
    }
    let extra = DrawBuilder::new()
        .vertex_buffer(vb)
        .index_buffer(ib)
        .build(ProgramHandle::from_raw_parts(9, 1))
        .expect("build");
    match frame.push(extra) {
        Err(ProtocolError::FrameFull { capacity }) => assert_eq!(capacity, 3),
        other => panic!("expected FrameFull, got {:?}", other),
    }

    let order: Vec<u32> = frame.draws().iter().map(|d| d.program.index()).collect();
    assert_eq!(order, vec![1, 2, 3]);

    frame.clear();
    assert!(frame.is_empty());
    assert_eq!(frame.capacity(), 3);
}

#[test]
fn test_push_block_layout() {
    // Two matrices, a vec4 and two device addresses.
    assert_eq!(DrawPushConstants::SIZE, 64 + 64 + 16 + 8 + 8);
    assert_eq!(DrawPushConstants::SIZE % 4, 0);
}
