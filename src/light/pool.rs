//! Fixed-capacity generational slot storage for light records.

use log::trace;

/// State of a single pool slot.
#[derive(Debug, Clone)]
pub(crate) enum SlotState<T> {
    Live(T),
    Free { next: Option<u16> },
}

#[derive(Debug, Clone)]
struct Slot<T> {
    generation: u8,
    state: SlotState<T>,
}

/// Bounded pool with an intrusive free list threaded through the free slots.
///
/// Allocation pops the free-list head and freeing pushes onto it, so both are O(1)
/// and the most recently freed slot is reused first. A slot's generation is bumped
/// every time it is freed.
#[derive(Debug, Clone)]
pub struct LightPool<T> {
    slots: Vec<Slot<T>>,
    free_head: Option<u16>,
    live: usize,
}

impl<T> LightPool<T> {
    pub fn with_capacity(capacity: u16) -> Self {
        let slots = (0..capacity)
            .map(|index| Slot {
                generation: 0,
                state: SlotState::Free {
                    next: index.checked_add(1).filter(|next| *next < capacity),
                },
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

    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    pub fn is_full(&self) -> bool {
        self.free_head.is_none()
    }

    /// Stores `item` in a free slot, returning its index and current generation.
    pub fn insert(&mut self, item: T) -> Option<(u16, u8)> {
        let index = self.free_head?;
        let slot = &mut self.slots[usize::from(index)];
        let next = match slot.state {
            SlotState::Free { next } => next,
            SlotState::Live(_) => return None,
        };

        slot.state = SlotState::Live(item);
        self.free_head = next;
        self.live += 1;
        trace!("[LightPool] insert slot {index} gen {}", slot.generation);
        Some((index, slot.generation))
    }

    /// Removes the record when `generation` still matches, then bumps the generation.
    pub fn remove(&mut self, index: u16, generation: u8) -> Option<T> {
        if !self.is_valid(index, generation) {
            return None;
        }

        let slot = &mut self.slots[usize::from(index)];
        let previous = std::mem::replace(
            &mut slot.state,
            SlotState::Free {
                next: self.free_head,
            },
        );
        slot.generation = slot.generation.wrapping_add(1);
        self.free_head = Some(index);
        self.live -= 1;

        match previous {
            SlotState::Live(item) => Some(item),
            SlotState::Free { .. } => None,
        }
    }

    pub fn get(&self, index: u16, generation: u8) -> Option<&T> {
        let slot = self.slots.get(usize::from(index))?;
        match &slot.state {
            SlotState::Live(item) if slot.generation == generation => Some(item),
            _ => None,
        }
    }

    pub fn get_mut(&mut self, index: u16, generation: u8) -> Option<&mut T> {
        let slot = self.slots.get_mut(usize::from(index))?;
        match &mut slot.state {
            SlotState::Live(item) if slot.generation == generation => Some(item),
            _ => None,
        }
    }

    /// Record at `index` regardless of generation, if live.
    pub fn get_by_index(&self, index: u16) -> Option<&T> {
        match &self.slots.get(usize::from(index))?.state {
            SlotState::Live(item) => Some(item),
            SlotState::Free { .. } => None,
        }
    }

    pub fn generation(&self, index: u16) -> Option<u8> {
        self.slots.get(usize::from(index)).map(|slot| slot.generation)
    }

    pub fn is_valid(&self, index: u16, generation: u8) -> bool {
        self.get(index, generation).is_some()
    }

    /// Live records with their slot index and generation.
    pub fn iter(&self) -> impl Iterator<Item = (u16, u8, &T)> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| match &slot.state {
                SlotState::Live(item) => Some((index as u16, slot.generation, item)),
                SlotState::Free { .. } => None,
            })
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (u16, &mut T)> + '_ {
        self.slots
            .iter_mut()
            .enumerate()
            .filter_map(|(index, slot)| match &mut slot.state {
                SlotState::Live(item) => Some((index as u16, item)),
                SlotState::Free { .. } => None,
            })
    }

    /// Per-slot view including free slots, in index order.
    pub fn slots(&self) -> impl Iterator<Item = Option<&T>> + '_ {
        self.slots.iter().map(|slot| match &slot.state {
            SlotState::Live(item) => Some(item),
            SlotState::Free { .. } => None,
        })
    }

    pub(crate) fn live_slots_mut(&mut self) -> Vec<&mut T> {
        self.iter_mut().map(|(_, item)| item).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_until_full() {
        let mut pool = LightPool::with_capacity(3);
        assert!(pool.insert('a').is_some());
        assert!(pool.insert('b').is_some());
        assert!(pool.insert('c').is_some());
        assert!(pool.is_full());
        assert_eq!(pool.insert('d'), None);
        assert_eq!(pool.len(), 3);
    }

    #[test]
    fn freed_slot_is_reused_first_with_new_generation() {
        let mut pool = LightPool::with_capacity(4);
        let (_, _) = pool.insert(1).unwrap();
        let (index, generation) = pool.insert(2).unwrap();
        assert_eq!(pool.remove(index, generation), Some(2));

        let (reused, new_generation) = pool.insert(3).unwrap();
        assert_eq!(reused, index);
        assert_eq!(new_generation, generation.wrapping_add(1));
        assert!(pool.get(index, generation).is_none());
        assert_eq!(pool.get(index, new_generation), Some(&3));
    }

    #[test]
    fn stale_remove_is_rejected() {
        let mut pool = LightPool::with_capacity(2);
        let (index, generation) = pool.insert(7).unwrap();
        assert_eq!(pool.remove(index, generation), Some(7));
        assert_eq!(pool.remove(index, generation), None);
        assert_eq!(pool.len(), 0);
        assert_eq!(pool.remove(99, 0), None);
    }

    #[test]
    fn generation_wraps() {
        let mut pool = LightPool::with_capacity(1);
        for _ in 0..256 {
            let (index, generation) = pool.insert(()).unwrap();
            pool.remove(index, generation);
        }
        assert_eq!(pool.generation(0), Some(0));
    }

    #[test]
    fn zero_capacity_pool_is_always_full() {
        let mut pool: LightPool<u8> = LightPool::with_capacity(0);
        assert!(pool.is_full());
        assert_eq!(pool.insert(1), None);
    }
}
