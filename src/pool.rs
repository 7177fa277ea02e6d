//! Free-list backed arenas for operation records and target state machines.
//!
//! Each window owns one arena per record type and the registry owns a second, global, arena.
//! A [Handle] remembers which of the two it came from so `free` always returns a record to its own arena.
use std::marker::PhantomData;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum PoolKind {
    Window,
    Global,
}

/// Generation checked index into an [Arena].
pub(crate) struct Handle<T> {
    index: u32,
    generation: u32,
    pool: PoolKind,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for Handle<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Handle<T> {}

impl<T> PartialEq for Handle<T> {
    fn eq(&self, other: &Self) -> bool {
        self.index == other.index && self.generation == other.generation && self.pool == other.pool
    }
}

impl<T> Eq for Handle<T> {}

impl<T> std::fmt::Debug for Handle<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{:?}[{}:{}]", self.pool, self.index, self.generation)
    }
}

impl<T> Handle<T> {
    pub(crate) fn pool(&self) -> PoolKind {
        self.pool
    }

    pub(crate) fn to_bits(&self) -> u64 {
        ((self.generation as u64) << 32) | self.index as u64
    }

    pub(crate) fn from_bits(bits: u64, pool: PoolKind) -> Self {
        Handle {
            index: bits as u32,
            generation: (bits >> 32) as u32,
            pool,
            _marker: PhantomData,
        }
    }
}

enum Slot<T> {
    Occupied { generation: u32, value: T },
    Vacant { generation: u32 },
}

// upfront reservation cap, larger arenas grow on demand up to their capacity
const PREALLOC_LIMIT: usize = 4096;

pub(crate) struct Arena<T> {
    id: &'static str,
    kind: PoolKind,
    slots: Vec<Slot<T>>,
    free_entries: Vec<u32>,
    capacity: usize,
    live: usize,
}

impl<T> Arena<T> {
    pub(crate) fn new(id: &'static str, kind: PoolKind, capacity: usize) -> Arena<T> {
        Arena {
            id,
            kind,
            slots: Vec::with_capacity(capacity.min(PREALLOC_LIMIT)),
            free_entries: Vec::new(),
            capacity,
            live: 0,
        }
    }

    /// Hands `value` back if the arena is at capacity.
    pub(crate) fn try_alloc(&mut self, value: T) -> Result<Handle<T>, T> {
        if let Some(index) = self.free_entries.pop() {
            let generation = match &self.slots[index as usize] {
                Slot::Vacant { generation } | Slot::Occupied { generation, .. } => *generation,
            };
            self.slots[index as usize] = Slot::Occupied { generation, value };
            self.live += 1;
            Ok(self.handle(index, generation))
        } else if self.slots.len() < self.capacity {
            let index = self.slots.len() as u32;
            self.slots.push(Slot::Occupied {
                generation: 0,
                value,
            });
            self.live += 1;
            Ok(self.handle(index, 0))
        } else {
            Err(value)
        }
    }

    fn handle(&self, index: u32, generation: u32) -> Handle<T> {
        Handle {
            index,
            generation,
            pool: self.kind,
            _marker: PhantomData,
        }
    }

    pub(crate) fn get(&self, h: Handle<T>) -> Option<&T> {
        match self.slots.get(h.index as usize) {
            Some(Slot::Occupied { generation, value }) if *generation == h.generation => Some(value),
            _ => None,
        }
    }

    pub(crate) fn get_mut(&mut self, h: Handle<T>) -> Option<&mut T> {
        match self.slots.get_mut(h.index as usize) {
            Some(Slot::Occupied { generation, value }) if *generation == h.generation => Some(value),
            _ => None,
        }
    }

    pub(crate) fn free(&mut self, h: Handle<T>) -> Option<T> {
        let generation = match self.slots.get(h.index as usize) {
            Some(Slot::Occupied { generation, .. }) if *generation == h.generation => *generation,
            _ => return None,
        };
        let old = std::mem::replace(
            &mut self.slots[h.index as usize],
            Slot::Vacant {
                generation: generation.wrapping_add(1),
            },
        );
        self.free_entries.push(h.index);
        self.live -= 1;
        match old {
            Slot::Occupied { value, .. } => Some(value),
            Slot::Vacant { .. } => None,
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.live
    }

    pub(crate) fn id(&self) -> &'static str {
        self.id
    }
}

/// A window arena paired with the global arena, borrowed together for one operation.
pub(crate) struct PoolPair<'a, T> {
    pub(crate) win: &'a mut Arena<T>,
    pub(crate) global: &'a mut Arena<T>,
}

impl<'a, T> PoolPair<'a, T> {
    pub(crate) fn new(win: &'a mut Arena<T>, global: &'a mut Arena<T>) -> Self {
        PoolPair { win, global }
    }

    /// window arena first, then the global one
    pub(crate) fn alloc(&mut self, value: T) -> Result<Handle<T>, T> {
        match self.win.try_alloc(value) {
            Ok(h) => Ok(h),
            Err(value) => {
                tracing::trace!("{} full, falling back to {}", self.win.id(), self.global.id());
                self.global.try_alloc(value)
            }
        }
    }

    pub(crate) fn get(&self, h: Handle<T>) -> Option<&T> {
        match h.pool() {
            PoolKind::Window => self.win.get(h),
            PoolKind::Global => self.global.get(h),
        }
    }

    pub(crate) fn get_mut(&mut self, h: Handle<T>) -> Option<&mut T> {
        match h.pool() {
            PoolKind::Window => self.win.get_mut(h),
            PoolKind::Global => self.global.get_mut(h),
        }
    }

    pub(crate) fn free(&mut self, h: Handle<T>) -> Option<T> {
        match h.pool() {
            PoolKind::Window => self.win.free(h),
            PoolKind::Global => self.global.free(h),
        }
    }
}
