//! Integration test: shader reflection files
//!
//! Run with: cargo test -p kiln-protocol --test reflection_test -- --nocapture

use kiln_protocol::resource::{DescriptorType, ShaderStage};
use kiln_protocol::{ProtocolError, ShaderReflection};

#[test]
fn test_parse_full_reflection() {
    let toml = r#"
stage = "fragment"

[[bindings]]
binding = 0
descriptor_type = "uniform_buffer"

[[bindings]]
binding = 1
descriptor_type = "combined_image_sampler"
count = 4

[[push_constants]]
offset = 0
size = 160
"#;
    let reflection = ShaderReflection::from_toml(toml).expect("parse");
    assert_eq!(reflection.stage, ShaderStage::Fragment);
    assert_eq!(reflection.bindings.len(), 2);
    assert_eq!(reflection.bindings[0].count, 1, "count defaults to 1");
    assert_eq!(reflection.bindings[1].descriptor_type, DescriptorType::CombinedImageSampler);
    assert_eq!(reflection.bindings[1].count, 4);
    assert_eq!(reflection.push_constants[0].size, 160);
}

#[test]
fn test_stage_only_reflection() {
    let reflection = ShaderReflection::from_toml("stage = \"vertex\"\n").expect("parse");
    assert_eq!(reflection, ShaderReflection::new(ShaderStage::Vertex));
}

#[test]
fn test_serialized_reflection_parses_back() {
    let reflection = ShaderReflection::new(ShaderStage::Vertex)
        .with_binding(0, DescriptorType::StorageBuffer)
        .with_push_constants(0, 64);
    let text = reflection.to_toml().expect("serialize");
    println!("{}", text);
    assert_eq!(ShaderReflection::from_toml(&text).expect("parse"), reflection);
}

#[test]
fn test_invalid_reflections_rejected() {
    let duplicate = ShaderReflection::new(ShaderStage::Fragment)
        .with_binding(2, DescriptorType::UniformBuffer)
        .with_binding(2, DescriptorType::StorageBuffer);
    match duplicate.validate() {
        Err(ProtocolError::InvalidReflection(msg)) => assert!(msg.contains("declared twice")),
        other => panic!("expected InvalidReflection, got {:?}", other),
    }

    let misaligned = ShaderReflection::new(ShaderStage::Vertex).with_push_constants(2, 16);
    assert!(matches!(
        misaligned.validate(),
        Err(ProtocolError::InvalidReflection(_))
    ));

    let zero_count = r#"
stage = "fragment"
[[bindings]]
binding = 0
descriptor_type = "storage_image"
count = 0
"#;
    assert!(matches!(
        ShaderReflection::from_toml(zero_count),
        Err(ProtocolError::InvalidReflection(_))
    ));
}

#[test]
fn test_unknown_descriptor_type_is_a_parse_error() {
    let toml = r#"
stage = "fragment"
[[bindings]]
binding = 0
descriptor_type = "acceleration_structure"
"#;
    match ShaderReflection::from_toml(toml) {
        Err(ProtocolError::Parse(_)) => {}
        other => panic!("expected Parse, got {:?}", other),
    }
}
