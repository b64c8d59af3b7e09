use tracing::trace;

use crate::error::CoreError;
use crate::handle::{Handle, ResourceKind};

struct Slot<V> {
    generation: u32,
    value: Option<V>,
}

/// Fixed-capacity generational arena.
///
/// `insert` takes a slot from the free list (or appends a new one) and bumps
/// its generation; `remove` empties the slot, bumps the generation again and
/// returns the slot to the free list. Slot 0 is a permanent sentinel so no
/// issued handle ever has index 0.
pub struct SlotTable<K: ResourceKind, V> {
    slots: Vec<Slot<V>>,
    free: Vec<u32>,
    capacity: usize,
    live: usize,
    _kind: std::marker::PhantomData<fn() -> K>,
}

impl<K: ResourceKind, V> SlotTable<K, V> {
    pub fn new(capacity: usize) -> Self {
        let mut slots = Vec::with_capacity(capacity.min(1024) + 1);
        slots.push(Slot {
            generation: 0,
            value: None,
        });
        Self {
            slots,
            free: Vec::new(),
            capacity,
            live: 0,
            _kind: std::marker::PhantomData,
        }
    }

    pub fn insert(&mut self, value: V) -> Result<Handle<K>, CoreError> {
        let index = match self.free.pop() {
            Some(index) => index,
            None => {
                // Slot 0 is the sentinel, so usable slots are 1..=capacity.
                if self.slots.len() > self.capacity {
                    return Err(CoreError::TableFull {
                        table: K::NAME,
                        capacity: self.capacity,
                    });
                }
                self.slots.push(Slot {
                    generation: 0,
                    value: None,
                });
                (self.slots.len() - 1) as u32
            }
        };

        let slot = &mut self.slots[index as usize];
        slot.generation = slot.generation.wrapping_add(1);
        slot.value = Some(value);
        self.live += 1;

        let handle = Handle::new(index, slot.generation);
        trace!(%handle, "slot allocated");
        Ok(handle)
    }

    pub fn get(&self, handle: Handle<K>) -> Option<&V> {
        if handle.is_none() {
            return None;
        }
        self.slots
            .get(handle.index() as usize)
            .filter(|slot| slot.generation == handle.generation())
            .and_then(|slot| slot.value.as_ref())
    }

    pub fn get_mut(&mut self, handle: Handle<K>) -> Option<&mut V> {
        if handle.is_none() {
            return None;
        }
        self.slots
            .get_mut(handle.index() as usize)
            .filter(|slot| slot.generation == handle.generation())
            .and_then(|slot| slot.value.as_mut())
    }

    pub fn contains(&self, handle: Handle<K>) -> bool {
        self.get(handle).is_some()
    }

    /// Empties the slot behind `handle`. Returns `None` for a handle that is
    /// not currently valid (never issued, already removed, or stale).
    pub fn remove(&mut self, handle: Handle<K>) -> Option<V> {
        if !self.contains(handle) {
            return None;
        }
        let slot = &mut self.slots[handle.index() as usize];
        let value = slot.value.take();
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(handle.index());
        self.live -= 1;
        trace!(%handle, "slot released");
        value
    }

    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn iter(&self) -> impl Iterator<Item = (Handle<K>, &V)> {
        self.slots.iter().enumerate().filter_map(|(index, slot)| {
            slot.value
                .as_ref()
                .map(|value| (Handle::new(index as u32, slot.generation), value))
        })
    }

    /// Removes every live entry, handing each to the caller.
    pub fn drain(&mut self) -> Vec<(Handle<K>, V)> {
        let mut out = Vec::with_capacity(self.live);
        for (index, slot) in self.slots.iter_mut().enumerate().skip(1) {
            if let Some(value) = slot.value.take() {
                out.push((Handle::new(index as u32, slot.generation), value));
                slot.generation = slot.generation.wrapping_add(1);
                self.free.push(index as u32);
            }
        }
        self.live = 0;
        out
    }
}
