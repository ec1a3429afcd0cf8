//! Dense id-keyed storage
//!
//! [`IdArena`] keeps records in a contiguous slot vector with a side
//! `id -> slot` index. Removal tombstones the slot and pushes it on a free
//! list; the slot's generation is bumped so stale [`ArenaIndex`] handles
//! stop resolving instead of aliasing whatever reuses the slot.

use std::collections::HashMap;

/// Stable handle to an arena slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ArenaIndex {
    slot: usize,
    generation: u32,
}

#[derive(Debug)]
enum Slot<T> {
    Occupied {
        id: String,
        generation: u32,
        value: T,
    },
    Tombstone {
        generation: u32,
    },
}

#[derive(Debug)]
pub struct IdArena<T> {
    slots: Vec<Slot<T>>,
    index: HashMap<String, usize>,
    free: Vec<usize>,
}

impl<T> IdArena<T> {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            index: HashMap::new(),
            free: Vec::new(),
        }
    }

    /// Insert under `id`. An occupied id hands the value back unchanged.
    pub fn insert(&mut self, id: impl Into<String>, value: T) -> Result<ArenaIndex, T> {
        let id = id.into();
        if self.index.contains_key(&id) {
            return Err(value);
        }
        let (slot, generation) = match self.free.pop() {
            Some(slot) => {
                let generation = match &self.slots[slot] {
                    Slot::Tombstone { generation } => generation.wrapping_add(1),
                    Slot::Occupied { generation, .. } => generation.wrapping_add(1),
                };
                self.slots[slot] = Slot::Occupied {
                    id: id.clone(),
                    generation,
                    value,
                };
                (slot, generation)
            }
            None => {
                self.slots.push(Slot::Occupied {
                    id: id.clone(),
                    generation: 0,
                    value,
                });
                (self.slots.len() - 1, 0)
            }
        };
        self.index.insert(id, slot);
        Ok(ArenaIndex { slot, generation })
    }

    pub fn get(&self, id: &str) -> Option<&T> {
        let slot = *self.index.get(id)?;
        match &self.slots[slot] {
            Slot::Occupied { value, .. } => Some(value),
            Slot::Tombstone { .. } => None,
        }
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut T> {
        let slot = *self.index.get(id)?;
        match &mut self.slots[slot] {
            Slot::Occupied { value, .. } => Some(value),
            Slot::Tombstone { .. } => None,
        }
    }

    pub fn get_by_index(&self, index: ArenaIndex) -> Option<&T> {
        match self.slots.get(index.slot)? {
            Slot::Occupied {
                generation, value, ..
            } if *generation == index.generation => Some(value),
            _ => None,
        }
    }

    pub fn index_of(&self, id: &str) -> Option<ArenaIndex> {
        let slot = *self.index.get(id)?;
        match &self.slots[slot] {
            Slot::Occupied { generation, .. } => Some(ArenaIndex {
                slot,
                generation: *generation,
            }),
            Slot::Tombstone { .. } => None,
        }
    }

    /// Tombstone the slot for `id` and return its value.
    pub fn remove(&mut self, id: &str) -> Option<T> {
        let slot = self.index.remove(id)?;
        let generation = match &self.slots[slot] {
            Slot::Occupied { generation, .. } => *generation,
            Slot::Tombstone { .. } => return None,
        };
        let old = std::mem::replace(&mut self.slots[slot], Slot::Tombstone { generation });
        self.free.push(slot);
        match old {
            Slot::Occupied { value, .. } => Some(value),
            Slot::Tombstone { .. } => None,
        }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Live entries in slot order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &T)> {
        self.slots.iter().filter_map(|slot| match slot {
            Slot::Occupied { id, value, .. } => Some((id.as_str(), value)),
            Slot::Tombstone { .. } => None,
        })
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&str, &mut T)> {
        self.slots.iter_mut().filter_map(|slot| match slot {
            Slot::Occupied { id, value, .. } => Some((id.as_str(), value)),
            Slot::Tombstone { .. } => None,
        })
    }

    pub fn ids(&self) -> Vec<String> {
        self.iter().map(|(id, _)| id.to_string()).collect()
    }

    pub fn values(&self) -> impl Iterator<Item = &T> {
        self.iter().map(|(_, v)| v)
    }

    pub fn clear(&mut self) {
        self.slots.clear();
        self.index.clear();
        self.free.clear();
    }
}

impl<T> Default for IdArena<T> {
    fn default() -> Self {
        Self::new()
    }
}
