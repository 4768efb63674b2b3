use std::collections::BTreeMap;

use crate::types::PioType;

/// One staging slot: data from several variables that share an I/O
/// decomposition, packed back to back so a single rearrangement moves all
/// of them.
#[derive(Debug)]
pub struct WriteMultiBuffer {
    /// Decomposition this slot stages for.
    pub ioid: i32,
    /// True if every variable in the slot is a record variable.
    pub recordvar: bool,
    /// Elements contributed per variable; identical across the slot.
    pub arraylen: usize,
    /// Element type shared by the slot.
    pub piotype: PioType,
    /// Variable ids, one per packed array.
    pub vids: Vec<i32>,
    /// Record index per packed array (-1 for non-record variables).
    pub frames: Vec<i32>,
    /// Per-variable fill value as element bytes; empty when unset.
    pub fillvalues: Vec<Vec<u8>>,
    /// `vids.len() * arraylen * elem_size` bytes of staged data.
    pub data: Vec<u8>,
}

impl WriteMultiBuffer {
    pub fn num_arrays(&self) -> usize {
        self.vids.len()
    }
}

/// Per-file multi-variable cache, keyed by decomposition id.
///
/// Slots are created by `alloc`, grown by `realloc` when another variable
/// is appended, and dropped by `free`/`clear`. A freed id stays in the map
/// with no buffer, so `get` distinguishes "never allocated" from "freed"
/// only by returning `None` for both; emptiness is tracked by counting live
/// slots rather than scanning.
#[derive(Default)]
pub struct MvCache {
    slots: BTreeMap<i32, Option<WriteMultiBuffer>>,
    valid: usize,
}

impl MvCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// The live slot for `ioid`, if any.
    pub fn get(&self, ioid: i32) -> Option<&WriteMultiBuffer> {
        self.slots.get(&ioid).and_then(|s| s.as_ref())
    }

    pub fn get_mut(&mut self, ioid: i32) -> Option<&mut WriteMultiBuffer> {
        self.slots.get_mut(&ioid).and_then(|s| s.as_mut())
    }

    /// Bind a fresh slot to `ioid`. Any previous live slot for the id is
    /// replaced without affecting the live count.
    pub fn alloc(&mut self, slot: WriteMultiBuffer) -> &mut WriteMultiBuffer {
        let ioid = slot.ioid;
        let prev = self.slots.insert(ioid, Some(slot));
        if !matches!(prev, Some(Some(_))) {
            self.valid += 1;
        }
        self.slots.get_mut(&ioid).unwrap().as_mut().unwrap()
    }

    /// Grow the staged data of an existing slot in place. The slot must
    /// have been allocated first.
    pub fn realloc(&mut self, ioid: i32, bytes: usize) -> Option<&mut WriteMultiBuffer> {
        let slot = self.get_mut(ioid)?;
        slot.data.resize(bytes, 0);
        Some(slot)
    }

    /// Release the buffer for `ioid`; `get` returns `None` afterwards.
    pub fn free(&mut self, ioid: i32) -> Option<WriteMultiBuffer> {
        let entry = self.slots.get_mut(&ioid)?;
        let taken = entry.take();
        if taken.is_some() {
            self.valid -= 1;
        }
        taken
    }

    /// Drop every live slot. The cache must be empty at file close.
    pub fn clear(&mut self) {
        for (_, slot) in self.slots.iter_mut() {
            if slot.take().is_some() {
                self.valid -= 1;
            }
        }
        debug_assert!(self.is_empty());
        self.slots.clear();
    }

    /// True when no live buffer is bound to any ioid.
    pub fn is_empty(&self) -> bool {
        self.valid == 0
    }

    /// Ids of live slots in ascending order.
    pub fn live_ioids(&self) -> Vec<i32> {
        self.slots
            .iter()
            .filter(|(_, s)| s.is_some())
            .map(|(&id, _)| id)
            .collect()
    }

    /// Total staged bytes across live slots.
    pub fn staged_bytes(&self) -> usize {
        self.slots
            .values()
            .filter_map(|s| s.as_ref())
            .map(|s| s.data.len())
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slot(ioid: i32, bytes: usize) -> WriteMultiBuffer {
        WriteMultiBuffer {
            ioid,
            recordvar: false,
            arraylen: bytes / 4,
            piotype: PioType::Int,
            vids: vec![0],
            frames: vec![-1],
            fillvalues: vec![Vec::new()],
            data: vec![0u8; bytes],
        }
    }

    #[test]
    fn test_alloc_get_free() {
        let mut cache = MvCache::new();
        assert!(cache.is_empty());
        assert!(cache.get(7).is_none());

        cache.alloc(slot(7, 16));
        assert!(!cache.is_empty());
        assert_eq!(cache.get(7).unwrap().data.len(), 16);

        cache.free(7);
        assert!(cache.get(7).is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_realloc_grows_in_place() {
        let mut cache = MvCache::new();
        cache.alloc(slot(3, 8));
        cache.get_mut(3).unwrap().data[..8].copy_from_slice(&[1, 2, 3, 4, 5, 6, 7, 8]);
        cache.realloc(3, 16).unwrap();
        let s = cache.get(3).unwrap();
        assert_eq!(s.data.len(), 16);
        assert_eq!(&s.data[..8], &[1, 2, 3, 4, 5, 6, 7, 8]);
        assert!(!cache.is_empty());
    }

    #[test]
    fn test_clear_empties_everything() {
        let mut cache = MvCache::new();
        cache.alloc(slot(1, 4));
        cache.alloc(slot(2, 4));
        cache.alloc(slot(5, 4));
        assert_eq!(cache.live_ioids(), vec![1, 2, 5]);
        assert_eq!(cache.staged_bytes(), 12);
        cache.clear();
        assert!(cache.is_empty());
        assert!(cache.get(1).is_none());
        assert_eq!(cache.staged_bytes(), 0);
    }

    #[test]
    fn test_free_then_realloc_fails() {
        let mut cache = MvCache::new();
        cache.alloc(slot(9, 4));
        cache.free(9);
        assert!(cache.realloc(9, 8).is_none());
    }
}
