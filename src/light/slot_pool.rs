//! Bounded free list of shadow-map slot indices.

use serde::{Deserialize, Serialize};

/// Index of a shadow map slot owned by [`crate::ShadowCaster`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ShadowSlotIndex(pub u16);

impl ShadowSlotIndex {
    pub fn as_usize(self) -> usize {
        usize::from(self.0)
    }
}

#[derive(Debug, Clone, Copy)]
enum ShadowSlot {
    /// Owned by the light stored at this light-pool index.
    Taken { owner: u16 },
    Free { next: Option<u16> },
}

/// Fixed-capacity allocator for shadow slots.
///
/// The pool stores only bookkeeping; the GPU payload for each slot lives in the
/// shadow caster and is addressed by the same index.
#[derive(Debug, Clone)]
pub struct ShadowSlotPool {
    slots: Vec<ShadowSlot>,
    free_head: Option<u16>,
    live: usize,
}

impl ShadowSlotPool {
    pub fn new(capacity: u16) -> Self {
        let slots = (0..capacity)
            .map(|index| ShadowSlot::Free {
                next: index.checked_add(1).filter(|next| *next < capacity),
            })
            .collect();

        Self {
            slots,
            free_head: (capacity > 0).then_some(0),
            live: 0,
        }
    }

    pub fn capacity(&self) -> u16 {
        self.slots.len() as u16
    }

    pub fn live_count(&self) -> usize {
        self.live
    }

    pub fn is_exhausted(&self) -> bool {
        self.free_head.is_none()
    }

    /// Takes a free slot for the light at `owner`, or `None` when the pool is exhausted.
    pub fn allocate(&mut self, owner: u16) -> Option<ShadowSlotIndex> {
        let index = self.free_head?;
        let ShadowSlot::Free { next } = self.slots[usize::from(index)] else {
            return None;
        };
        self.slots[usize::from(index)] = ShadowSlot::Taken { owner };
        self.free_head = next;
        self.live += 1;
        Some(ShadowSlotIndex(index))
    }

    /// Returns a slot to the pool. Freeing an unknown or already free slot is a no-op.
    pub fn free(&mut self, index: ShadowSlotIndex) -> bool {
        match self.slots.get(index.as_usize()) {
            Some(ShadowSlot::Taken { .. }) => {
                self.slots[index.as_usize()] = ShadowSlot::Free {
                    next: self.free_head,
                };
                self.free_head = Some(index.0);
                self.live -= 1;
                true
            }
            _ => false,
        }
    }

    /// Light-pool index of the light holding `index`.
    pub fn owner(&self, index: ShadowSlotIndex) -> Option<u16> {
        match self.slots.get(index.as_usize()) {
            Some(ShadowSlot::Taken { owner }) => Some(*owner),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn slots_are_unique_until_exhausted() {
        let mut pool = ShadowSlotPool::new(4);
        let taken: HashSet<_> = (0..4).map(|owner| pool.allocate(owner).unwrap()).collect();
        assert_eq!(taken.len(), 4);
        assert!(pool.is_exhausted());
        assert_eq!(pool.allocate(9), None);
    }

    #[test]
    fn double_free_is_a_no_op() {
        let mut pool = ShadowSlotPool::new(2);
        let slot = pool.allocate(5).unwrap();
        assert_eq!(pool.owner(slot), Some(5));
        assert!(pool.free(slot));
        assert!(!pool.free(slot));
        assert_eq!(pool.live_count(), 0);
        assert_eq!(pool.owner(slot), None);
        assert!(!pool.free(ShadowSlotIndex(40)));
    }

    #[test]
    fn last_freed_slot_is_handed_out_next() {
        let mut pool = ShadowSlotPool::new(3);
        let a = pool.allocate(0).unwrap();
        let _b = pool.allocate(1).unwrap();
        pool.free(a);
        assert_eq!(pool.allocate(2), Some(a));
    }
}
