use std::collections::HashSet;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;
use crate::resource::{DescriptorType, ShaderStage};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReflectedBinding {
    pub binding: u32,
    pub descriptor_type: DescriptorType,
    #[serde(default = "default_count")]
    pub count: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PushConstantRange {
    pub offset: u32,
    pub size: u32,
}

/// Binding and push-constant metadata for one compiled shader, produced by
/// an external reflection step and stored next to the bytecode.
///
/// ```toml
/// stage = "fragment"
///
/// [[bindings]]
/// binding = 0
/// descriptor_type = "combined_image_sampler"
///
/// [[push_constants]]
/// offset = 0
/// size = 160
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShaderReflection {
    pub stage: ShaderStage,
    #[serde(default)]
    pub bindings: Vec<ReflectedBinding>,
    #[serde(default)]
    pub push_constants: Vec<PushConstantRange>,
}

impl ShaderReflection {
    pub fn new(stage: ShaderStage) -> Self {
        Self {
            stage,
            bindings: Vec::new(),
            push_constants: Vec::new(),
        }
    }

    pub fn with_binding(mut self, binding: u32, descriptor_type: DescriptorType) -> Self {
        self.bindings.push(ReflectedBinding {
            binding,
            descriptor_type,
            count: 1,
        });
        self
    }

    pub fn with_push_constants(mut self, offset: u32, size: u32) -> Self {
        self.push_constants.push(PushConstantRange { offset, size });
        self
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ProtocolError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, ProtocolError> {
        let reflection: ShaderReflection =
            toml::from_str(content).map_err(|e| ProtocolError::Parse(e.to_string()))?;
        reflection.validate()?;
        Ok(reflection)
    }

    pub fn to_toml(&self) -> Result<String, ProtocolError> {
        toml::to_string_pretty(self).map_err(|e| ProtocolError::Parse(e.to_string()))
    }

    /// Rejects duplicate binding indices, zero-sized descriptor arrays and
    /// empty or misaligned push-constant ranges.
    pub fn validate(&self) -> Result<(), ProtocolError> {
        let mut seen = HashSet::new();
        for b in &self.bindings {
            if !seen.insert(b.binding) {
                return Err(ProtocolError::InvalidReflection(format!(
                    "binding {} declared twice",
                    b.binding
                )));
            }
            if b.count == 0 {
                return Err(ProtocolError::InvalidReflection(format!(
                    "binding {} has a descriptor count of 0",
                    b.binding
                )));
            }
        }
        for pc in &self.push_constants {
            if pc.size == 0 || pc.offset % 4 != 0 || pc.size % 4 != 0 {
                return Err(ProtocolError::InvalidReflection(format!(
                    "push constant range {}+{} must be non-empty and 4-byte aligned",
                    pc.offset, pc.size
                )));
            }
        }
        Ok(())
    }
}

fn default_count() -> u32 {
    1
}
