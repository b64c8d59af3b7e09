use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;

/// Marker for the resource family a [`Handle`] points into.
pub trait ResourceKind: 'static {
    /// Human readable table name, used in logs and errors.
    const NAME: &'static str;
}

macro_rules! resource_kinds {
    ($($kind:ident => $name:literal, $alias:ident;)*) => {
        $(
            #[derive(Debug)]
            pub enum $kind {}

            impl ResourceKind for $kind {
                const NAME: &'static str = $name;
            }

            pub type $alias = Handle<$kind>;
        )*
    };
}

resource_kinds! {
    Buffer => "buffer", BufferHandle;
    Texture => "texture", TextureHandle;
    Shader => "shader", ShaderHandle;
    Program => "program", ProgramHandle;
    Descriptor => "descriptor", DescriptorHandle;
}

/// Opaque reference to one slot of a [`crate::SlotTable`].
///
/// A handle is the pair (slot index, generation). Index 0 is never issued,
/// so [`Handle::NONE`] (and `Default`) mean "no handle". The generation is
/// compared against the slot's current one on every lookup, which makes a
/// handle to a destroyed slot permanently invalid even after the slot is
/// reused.
pub struct Handle<K> {
    index: u32,
    generation: u32,
    _kind: PhantomData<fn() -> K>,
}

impl<K> Handle<K> {
    pub const NONE: Self = Self {
        index: 0,
        generation: 0,
        _kind: PhantomData,
    };

    pub(crate) const fn new(index: u32, generation: u32) -> Self {
        Self {
            index,
            generation,
            _kind: PhantomData,
        }
    }

    /// Rebuild a handle from its raw parts. Lookups still validate it.
    pub const fn from_raw_parts(index: u32, generation: u32) -> Self {
        Self::new(index, generation)
    }

    pub const fn index(self) -> u32 {
        self.index
    }

    pub const fn generation(self) -> u32 {
        self.generation
    }

    pub const fn is_none(self) -> bool {
        self.index == 0
    }

    /// Packs the handle into one integer (generation in the high half).
    pub const fn to_bits(self) -> u64 {
        ((self.generation as u64) << 32) | self.index as u64
    }
}

impl<K> Clone for Handle<K> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<K> Copy for Handle<K> {}

impl<K> PartialEq for Handle<K> {
    fn eq(&self, other: &Self) -> bool {
        self.index == other.index && self.generation == other.generation
    }
}

impl<K> Eq for Handle<K> {}

impl<K> Hash for Handle<K> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.to_bits().hash(state);
    }
}

impl<K> PartialOrd for Handle<K> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl<K> Ord for Handle<K> {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.index, self.generation).cmp(&(other.index, other.generation))
    }
}

impl<K> Default for Handle<K> {
    fn default() -> Self {
        Self::NONE
    }
}

impl<K: ResourceKind> fmt::Debug for Handle<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}v{}", K::NAME, self.index, self.generation)
    }
}

impl<K: ResourceKind> fmt::Display for Handle<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}
