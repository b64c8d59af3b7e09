use std::path::Path;

use crate::error::RenderError;

pub const SPIRV_MAGIC: u32 = 0x0723_0203;

/// Reads compiled SPIR-V from disk.
pub fn load_spirv(path: impl AsRef<Path>) -> Result<Vec<u32>, RenderError> {
    let bytes = std::fs::read(path.as_ref())?;
    spirv_words(&bytes)
}

/// Reinterprets little- or big-endian SPIR-V bytes as words, checking the
/// magic number and length.
pub fn spirv_words(bytes: &[u8]) -> Result<Vec<u32>, RenderError> {
    if bytes.len() % 4 != 0 {
        return Err(RenderError::InvalidSpirv(format!(
            "length {} is not a multiple of 4",
            bytes.len()
        )));
    }
    if bytes.len() < 20 {
        return Err(RenderError::InvalidSpirv("shorter than the 5-word header".into()));
    }

    let mut words: Vec<u32> = bytes
        .chunks_exact(4)
        .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect();
    if words[0] == SPIRV_MAGIC.swap_bytes() {
        for word in &mut words {
            *word = word.swap_bytes();
        }
    }
    if words[0] != SPIRV_MAGIC {
        return Err(RenderError::InvalidSpirv(format!(
            "bad magic number {:#010x}",
            words[0]
        )));
    }
    Ok(words)
}

/// (major, minor) from the SPIR-V header.
pub fn spirv_version(words: &[u32]) -> Option<(u8, u8)> {
    let version = *words.get(1)?;
    Some((((version >> 16) & 0xff) as u8, ((version >> 8) & 0xff) as u8))
}
