//! Reference table mapping guest-visible handles to host objects.
//!
//! A handle is a non-zero `u32`: the low 24 bits hold the slot index plus one, the high 8 bits
//! the slot's generation. Freeing a slot bumps its generation, so a handle kept across a release
//! stops resolving even after the slot is reused (until the generation wraps after 256 reuses).

use std::fmt;
use std::num::NonZeroU32;

use thiserror::Error;

const INDEX_BITS: u32 = 24;
const INDEX_MASK: u32 = (1 << INDEX_BITS) - 1;

/// Hard ceiling imposed by the handle encoding.
pub const MAX_SLOTS: usize = INDEX_MASK as usize;

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Handle(NonZeroU32);

impl Handle {
    /// `None` when the slot bits are zero (including `0` itself), which never names an object.
    pub fn from_raw(raw: u32) -> Option<Self> {
        if raw & INDEX_MASK == 0 {
            return None;
        }
        NonZeroU32::new(raw).map(Handle)
    }

    pub fn raw(self) -> u32 {
        self.0.get()
    }

    fn new(slot: usize, generation: u8) -> Self {
        debug_assert!(slot < MAX_SLOTS);
        let raw = (u32::from(generation) << INDEX_BITS) | (slot as u32 + 1);
        // `slot + 1` is never zero.
        Handle(NonZeroU32::new(raw).unwrap_or(NonZeroU32::MIN))
    }

    fn slot(self) -> usize {
        // Slot bits are non-zero for every constructed handle.
        (self.raw() & INDEX_MASK).saturating_sub(1) as usize
    }

    fn generation(self) -> u8 {
        (self.raw() >> INDEX_BITS) as u8
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Handle({}v{})", self.slot() + 1, self.generation())
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.raw())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum HandleError {
    #[error("invalid object handle {0}")]
    InvalidHandle(u32),
    #[error("object handle {0} released twice")]
    DoubleFree(u32),
    #[error("object reference table is full ({limit} live handles)")]
    TableFull { limit: usize },
}

enum Slot<T> {
    Occupied { generation: u8, value: T },
    /// `generation` is the generation of the last occupant.
    Vacant { generation: u8, next_free: Option<usize> },
}

pub struct HandleTable<T> {
    slots: Vec<Slot<T>>,
    free_head: Option<usize>,
    live: usize,
    limit: usize,
}

impl<T> Default for HandleTable<T> {
    fn default() -> Self {
        Self::with_limit(MAX_SLOTS)
    }
}

impl<T> fmt::Debug for HandleTable<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandleTable")
            .field("live", &self.live)
            .field("slots", &self.slots.len())
            .field("limit", &self.limit)
            .finish()
    }
}

impl<T> HandleTable<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Caps the number of simultaneously live handles (clamped to [`MAX_SLOTS`]).
    pub fn with_limit(limit: usize) -> Self {
        Self {
            slots: Vec::new(),
            free_head: None,
            live: 0,
            limit: limit.min(MAX_SLOTS),
        }
    }

    pub fn allocate(&mut self, value: T) -> Result<Handle, HandleError> {
        if self.live >= self.limit {
            return Err(HandleError::TableFull { limit: self.limit });
        }

        let reusable = self.free_head.and_then(|slot| match self.slots[slot] {
            Slot::Vacant {
                generation,
                next_free,
            } => Some((slot, generation, next_free)),
            Slot::Occupied { .. } => None,
        });

        let handle = match reusable {
            Some((slot, generation, next_free)) => {
                let generation = generation.wrapping_add(1);
                self.free_head = next_free;
                self.slots[slot] = Slot::Occupied { generation, value };
                Handle::new(slot, generation)
            }
            None => {
                let slot = self.slots.len();
                if slot >= MAX_SLOTS {
                    return Err(HandleError::TableFull { limit: self.limit });
                }
                self.slots.push(Slot::Occupied {
                    generation: 0,
                    value,
                });
                Handle::new(slot, 0)
            }
        };

        self.live += 1;
        Ok(handle)
    }

    pub fn resolve(&self, handle: Handle) -> Result<&T, HandleError> {
        match self.slots.get(handle.slot()) {
            Some(Slot::Occupied { generation, value }) if *generation == handle.generation() => {
                Ok(value)
            }
            _ => Err(HandleError::InvalidHandle(handle.raw())),
        }
    }

    /// Resolves a raw guest-supplied handle; `0` and any value with zero slot bits are invalid.
    pub fn resolve_raw(&self, raw: u32) -> Result<&T, HandleError> {
        let handle = Handle::from_raw(raw).ok_or(HandleError::InvalidHandle(raw))?;
        self.resolve(handle)
    }

    pub fn deallocate(&mut self, handle: Handle) -> Result<T, HandleError> {
        let slot = handle.slot();
        match self.slots.get(slot) {
            Some(Slot::Occupied { generation, .. }) if *generation == handle.generation() => {}
            Some(Slot::Vacant { generation, .. }) if *generation == handle.generation() => {
                return Err(HandleError::DoubleFree(handle.raw()));
            }
            _ => return Err(HandleError::InvalidHandle(handle.raw())),
        }

        let vacant = Slot::Vacant {
            generation: handle.generation(),
            next_free: self.free_head,
        };
        match std::mem::replace(&mut self.slots[slot], vacant) {
            Slot::Occupied { value, .. } => {
                self.free_head = Some(slot);
                self.live -= 1;
                Ok(value)
            }
            previous @ Slot::Vacant { .. } => {
                self.slots[slot] = previous;
                Err(HandleError::InvalidHandle(handle.raw()))
            }
        }
    }

    pub fn deallocate_raw(&mut self, raw: u32) -> Result<T, HandleError> {
        let handle = Handle::from_raw(raw).ok_or(HandleError::InvalidHandle(raw))?;
        self.deallocate(handle)
    }

    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    pub fn capacity_limit(&self) -> usize {
        self.limit
    }

    pub fn iter(&self) -> impl Iterator<Item = (Handle, &T)> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(slot, entry)| match entry {
                Slot::Occupied { generation, value } => Some((Handle::new(slot, *generation), value)),
                Slot::Vacant { .. } => None,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_then_resolve_returns_the_object() {
        let mut table = HandleTable::new();
        let a = table.allocate("a").unwrap();
        let b = table.allocate("b").unwrap();
        assert_ne!(a, b);
        assert_eq!(a.raw(), 1, "first handle skips the reserved 0");
        assert_eq!(table.resolve(a), Ok(&"a"));
        assert_eq!(table.resolve(b), Ok(&"b"));
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn resolve_after_deallocate_fails() {
        let mut table = HandleTable::new();
        let a = table.allocate(1).unwrap();
        assert_eq!(table.deallocate(a), Ok(1));
        assert_eq!(table.resolve(a), Err(HandleError::InvalidHandle(a.raw())));
        assert!(table.is_empty());
    }

    #[test]
    fn double_free_is_reported() {
        let mut table = HandleTable::new();
        let a = table.allocate(1).unwrap();
        table.deallocate(a).unwrap();
        assert_eq!(table.deallocate(a), Err(HandleError::DoubleFree(a.raw())));
    }

    #[test]
    fn unknown_and_zero_handles_are_invalid() {
        let mut table: HandleTable<u8> = HandleTable::new();
        assert_eq!(table.resolve_raw(0), Err(HandleError::InvalidHandle(0)));
        assert_eq!(table.resolve_raw(9), Err(HandleError::InvalidHandle(9)));
        assert_eq!(table.deallocate_raw(0), Err(HandleError::InvalidHandle(0)));
        assert_eq!(table.deallocate_raw(3), Err(HandleError::InvalidHandle(3)));
    }

    #[test]
    fn generation_without_slot_bits_is_invalid() {
        let mut table: HandleTable<u8> = HandleTable::new();
        table.allocate(7).unwrap();
        for raw in [0x0100_0000, 0xff00_0000] {
            assert_eq!(Handle::from_raw(raw), None);
            assert_eq!(table.resolve_raw(raw), Err(HandleError::InvalidHandle(raw)));
            assert_eq!(table.deallocate_raw(raw), Err(HandleError::InvalidHandle(raw)));
        }
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn freed_slot_is_reused_without_aliasing_live_handles() {
        let mut table = HandleTable::new();
        let first = table.allocate("first").unwrap();
        table.deallocate(first).unwrap();
        let second = table.allocate("second").unwrap();
        let third = table.allocate("third").unwrap();

        assert_ne!(second, third);
        assert_eq!(table.resolve(second), Ok(&"second"));
        assert_eq!(table.resolve(third), Ok(&"third"));
        // `second` reuses the freed slot under a new generation.
        assert_eq!(second.slot(), first.slot());
        assert_ne!(second, first);
    }

    #[test]
    fn stale_handle_does_not_resolve_to_new_occupant() {
        let mut table = HandleTable::new();
        let stale = table.allocate("old").unwrap();
        table.deallocate(stale).unwrap();
        let fresh = table.allocate("new").unwrap();

        assert_eq!(table.resolve(stale), Err(HandleError::InvalidHandle(stale.raw())));
        assert_eq!(table.deallocate(stale), Err(HandleError::InvalidHandle(stale.raw())));
        assert_eq!(table.resolve(fresh), Ok(&"new"));
    }

    #[test]
    fn limit_caps_live_handles() {
        let mut table = HandleTable::with_limit(2);
        let a = table.allocate(1).unwrap();
        table.allocate(2).unwrap();
        assert_eq!(table.allocate(3), Err(HandleError::TableFull { limit: 2 }));

        table.deallocate(a).unwrap();
        assert!(table.allocate(3).is_ok());
    }

    #[test]
    fn iter_lists_live_entries() {
        let mut table = HandleTable::new();
        let a = table.allocate('a').unwrap();
        let b = table.allocate('b').unwrap();
        table.deallocate(a).unwrap();
        let live: Vec<_> = table.iter().collect();
        assert_eq!(live, vec![(b, &'b')]);
    }
}
