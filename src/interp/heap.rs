//! Reference-counted object heap of the embedded interpreter.
//!
//! Slots are reused through a free list. Every reuse bumps the slot's
//! generation, so a stale `ObjId` never aliases a newer object.

use std::fmt;

use super::object::ObjectData;

/// Opaque identity of a foreign object.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjId {
    index: u32,
    generation: u32,
}

impl ObjId {
    /// The null handle. Never refers to a live object.
    pub const NULL: ObjId = ObjId {
        index: u32::MAX,
        generation: u32::MAX,
    };

    #[inline]
    pub fn is_null(self) -> bool {
        self == Self::NULL
    }

    #[inline]
    pub fn index(self) -> u32 {
        self.index
    }

    #[inline]
    pub fn generation(self) -> u32 {
        self.generation
    }
}

impl fmt::Debug for ObjId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            f.write_str("ObjId(NULL)")
        } else {
            write!(f, "ObjId({}@{})", self.index, self.generation)
        }
    }
}

impl fmt::Display for ObjId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            f.write_str("<null>")
        } else {
            write!(f, "0x{:x}@{}", self.index, self.generation)
        }
    }
}

/// Errors reported by the heap for invalid handles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum HeapError {
    #[error("null foreign handle")]
    Null,

    #[error("foreign object {0} has already been freed")]
    Freed(ObjId),
}

struct Entry {
    refcount: isize,
    data: ObjectData,
}

struct Slot {
    generation: u32,
    entry: Option<Entry>,
}

/// Snapshot of heap counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeapStats {
    pub live: usize,
    pub allocations: u64,
    pub frees: u64,
}

#[derive(Default)]
pub struct Heap {
    slots: Vec<Slot>,
    free_list: Vec<u32>,
    stats: HeapStats,
}

impl Heap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a new object. The caller owns the returned reference.
    pub fn allocate(&mut self, data: ObjectData) -> ObjId {
        let entry = Entry { refcount: 1, data };

        let id = if let Some(index) = self.free_list.pop() {
            let slot = &mut self.slots[index as usize];
            slot.generation = slot.generation.wrapping_add(1);
            slot.entry = Some(entry);
            ObjId {
                index,
                generation: slot.generation,
            }
        } else {
            let index = self.slots.len() as u32;
            self.slots.push(Slot {
                generation: 0,
                entry: Some(entry),
            });
            ObjId {
                index,
                generation: 0,
            }
        };

        self.stats.live += 1;
        self.stats.allocations += 1;
        id
    }

    fn entry(&self, id: ObjId) -> Result<&Entry, HeapError> {
        if id.is_null() {
            return Err(HeapError::Null);
        }

        self.slots
            .get(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.entry.as_ref())
            .ok_or(HeapError::Freed(id))
    }

    fn entry_mut(&mut self, id: ObjId) -> Result<&mut Entry, HeapError> {
        if id.is_null() {
            return Err(HeapError::Null);
        }

        self.slots
            .get_mut(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.entry.as_mut())
            .ok_or(HeapError::Freed(id))
    }

    #[inline]
    pub fn is_live(&self, id: ObjId) -> bool {
        self.entry(id).is_ok()
    }

    pub fn get(&self, id: ObjId) -> Result<&ObjectData, HeapError> {
        self.entry(id).map(|e| &e.data)
    }

    pub fn get_mut(&mut self, id: ObjId) -> Result<&mut ObjectData, HeapError> {
        self.entry_mut(id).map(|e| &mut e.data)
    }

    /// Current reference count, or `None` for null/freed handles.
    pub fn refcount(&self, id: ObjId) -> Option<isize> {
        self.entry(id).ok().map(|e| e.refcount)
    }

    pub fn incref(&mut self, id: ObjId) -> Result<(), HeapError> {
        self.entry_mut(id)?.refcount += 1;
        Ok(())
    }

    /// Decrement the count and free the object (and its children) at zero.
    ///
    /// Returns the remaining count of `id`.
    pub fn decref(&mut self, id: ObjId) -> Result<isize, HeapError> {
        let entry = self.entry_mut(id)?;
        entry.refcount -= 1;
        let remaining = entry.refcount;

        if remaining == 0 {
            self.free(id);
        }

        Ok(remaining)
    }

    /// Free `root`, then release every child reference. Iterative so deeply
    /// nested containers and long traceback chains cannot overflow the stack.
    fn free(&mut self, root: ObjId) {
        let mut worklist = vec![root];

        while let Some(id) = worklist.pop() {
            let slot = &mut self.slots[id.index as usize];
            let Some(entry) = slot.entry.take() else {
                continue;
            };

            self.free_list.push(id.index);
            self.stats.live -= 1;
            self.stats.frees += 1;

            let mut children = Vec::new();
            entry.data.children(&mut children);

            for child in children {
                if let Ok(child_entry) = self.entry_mut(child) {
                    child_entry.refcount -= 1;
                    if child_entry.refcount == 0 {
                        worklist.push(child);
                    }
                }
            }
        }
    }

    pub fn stats(&self) -> HeapStats {
        self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_and_free() {
        let mut heap = Heap::new();
        let id = heap.allocate(ObjectData::Int(7));

        assert!(heap.is_live(id));
        assert_eq!(heap.refcount(id), Some(1));
        assert_eq!(heap.decref(id), Ok(0));
        assert!(!heap.is_live(id));
        assert_eq!(heap.stats().live, 0);
    }

    #[test]
    fn test_stale_handle_after_slot_reuse() {
        let mut heap = Heap::new();
        let old = heap.allocate(ObjectData::Int(1));
        heap.decref(old).unwrap();

        let new = heap.allocate(ObjectData::Int(2));
        assert_eq!(old.index(), new.index());
        assert_ne!(old.generation(), new.generation());

        assert_eq!(heap.incref(old), Err(HeapError::Freed(old)));
        assert_eq!(heap.refcount(new), Some(1));
    }

    #[test]
    fn test_free_releases_children() {
        let mut heap = Heap::new();
        let a = heap.allocate(ObjectData::Int(1));
        let b = heap.allocate(ObjectData::Int(2));
        heap.incref(b).unwrap();

        let list = heap.allocate(ObjectData::List(vec![a, b]));
        heap.decref(list).unwrap();

        assert!(!heap.is_live(a));
        assert_eq!(heap.refcount(b), Some(1));
    }

    #[test]
    fn test_null_handle() {
        let mut heap = Heap::new();
        assert_eq!(heap.decref(ObjId::NULL), Err(HeapError::Null));
        assert!(!heap.is_live(ObjId::NULL));
    }
}
