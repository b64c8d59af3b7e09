use ash::vk;

/// Picks a memory type allowed by `type_bits` that has every `required`
/// flag, preferring the one that also has the most `preferred` flags.
pub fn find_memory_type(
    properties: &vk::PhysicalDeviceMemoryProperties,
    type_bits: u32,
    required: vk::MemoryPropertyFlags,
    preferred: vk::MemoryPropertyFlags,
) -> Option<(u32, vk::MemoryPropertyFlags)> {
    let count = properties.memory_type_count as usize;
    properties.memory_types[..count]
        .iter()
        .enumerate()
        .filter(|(i, ty)| type_bits & (1 << i) != 0 && ty.property_flags.contains(required))
        .max_by_key(|(_, ty)| (ty.property_flags & preferred).as_raw().count_ones())
        .map(|(i, ty)| (i as u32, ty.property_flags))
}

/// Memory flags for a buffer or image allocation.
pub fn flags_for(mappable: bool) -> (vk::MemoryPropertyFlags, vk::MemoryPropertyFlags) {
    if mappable {
        (
            vk::MemoryPropertyFlags::HOST_VISIBLE,
            vk::MemoryPropertyFlags::HOST_COHERENT,
        )
    } else {
        (
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
            vk::MemoryPropertyFlags::empty(),
        )
    }
}

/// An allocation the backend owns alongside its buffer.
#[derive(Debug, Clone, Copy)]
pub struct BufferMemory {
    pub memory: vk::DeviceMemory,
    pub size: u64,
    pub host_visible: bool,
    pub host_coherent: bool,
}
