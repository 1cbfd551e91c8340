//! N-buffered ring of native plane buffers used by the overlay backends.
//!
//! A slot moves through `back` (free, next to be written) → `pending`
//! (written by a commit, not yet shown) → `push` (handed to the plane,
//! waiting for displayed feedback) → `front` (on screen). A commit that
//! arrives while another is still pending overwrites the pending slot, so
//! only the newest content reaches the plane.

use tracing::trace;

use crate::resources::NativeBufferId;

/// Smallest and largest ring depths accepted from configuration.
pub const MIN_RING_DEPTH: usize = 2;
pub const MAX_RING_DEPTH: usize = 8;

/// Buffer held in a ring slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NativeSlot {
    pub buffer: NativeBufferId,
    pub width: u32,
    pub height: u32,
    /// Wrapped client memory rather than a controller allocation; never
    /// reused for a later commit.
    pub wrapped: bool,
}

#[derive(Debug)]
pub struct NativeRing {
    slots: Vec<Option<NativeSlot>>,
    back: usize,
    pending: Option<usize>,
    push: Option<usize>,
    front: Option<usize>,
}

impl NativeRing {
    pub fn new(depth: usize) -> Self {
        let depth = depth.clamp(MIN_RING_DEPTH, MAX_RING_DEPTH);
        Self {
            slots: vec![None; depth],
            back: 0,
            pending: None,
            push: None,
            front: None,
        }
    }

    pub fn depth(&self) -> usize {
        self.slots.len()
    }

    fn busy(&self, index: usize) -> bool {
        self.push == Some(index) || self.front == Some(index)
    }

    /// Slot the next commit should write. A pending slot is reused; otherwise
    /// the first idle slot from `back` onwards. `None` means every slot is
    /// either on screen or waiting for displayed feedback.
    pub fn acquire_back(&self) -> Option<usize> {
        if let Some(pending) = self.pending {
            return Some(pending);
        }
        let depth = self.slots.len();
        (0..depth)
            .map(|step| (self.back + step) % depth)
            .find(|&index| !self.busy(index))
    }

    pub fn slot(&self, index: usize) -> Option<NativeSlot> {
        self.slots.get(index).copied().flatten()
    }

    /// Stores `slot` at `index` and returns whatever it replaced.
    pub fn replace(&mut self, index: usize, slot: NativeSlot) -> Option<NativeSlot> {
        self.slots.get_mut(index).and_then(|s| s.replace(slot))
    }

    /// Marks a written slot as the newest content.
    pub fn queue(&mut self, index: usize) {
        trace!("ring: slot {} pending", index);
        self.pending = Some(index);
        self.back = (index + 1) % self.slots.len();
    }

    pub fn pending(&self) -> Option<NativeSlot> {
        self.pending.and_then(|i| self.slot(i))
    }

    pub fn front(&self) -> Option<NativeSlot> {
        self.front.and_then(|i| self.slot(i))
    }

    /// The slot currently handed to the plane and not yet displayed.
    pub fn pushed(&self) -> Option<NativeSlot> {
        self.push.and_then(|i| self.slot(i))
    }

    /// Moves the pending slot to `push` for presentation.
    pub fn take_pending_for_push(&mut self) -> Option<NativeSlot> {
        let index = self.pending.take()?;
        self.push = Some(index);
        self.slot(index)
    }

    /// Displayed feedback for the pushed slot: it becomes the front and the
    /// old front is free again. Returns the freed slot's content when it was
    /// wrapped client memory, which must now be released.
    pub fn mark_displayed(&mut self) -> Option<NativeSlot> {
        let index = self.push.take()?;
        let previous = self.front.replace(index);
        trace!("ring: slot {} displayed", index);
        match previous {
            Some(old) if old != index => match self.slot(old) {
                Some(slot) if slot.wrapped => self.slots[old].take(),
                _ => None,
            },
            _ => None,
        }
    }

    /// Empties the ring, returning every buffer it held.
    pub fn drain_all(&mut self) -> Vec<NativeBufferId> {
        self.pending = None;
        self.push = None;
        self.front = None;
        self.back = 0;
        self.slots
            .iter_mut()
            .filter_map(|s| s.take())
            .map(|s| s.buffer)
            .collect()
    }

    pub fn buffers(&self) -> impl Iterator<Item = NativeBufferId> + '_ {
        self.slots.iter().flatten().map(|s| s.buffer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slot(id: u32) -> NativeSlot {
        NativeSlot {
            buffer: NativeBufferId::new(id),
            width: 4,
            height: 4,
            wrapped: false,
        }
    }

    #[test]
    fn test_depth_is_clamped() {
        assert_eq!(NativeRing::new(0).depth(), MIN_RING_DEPTH);
        assert_eq!(NativeRing::new(64).depth(), MAX_RING_DEPTH);
        assert_eq!(NativeRing::new(3).depth(), 3);
    }

    #[test]
    fn test_pending_slot_is_overwritten() {
        let mut ring = NativeRing::new(3);
        let first = ring.acquire_back().unwrap();
        ring.replace(first, slot(1));
        ring.queue(first);
        assert_eq!(ring.acquire_back(), Some(first), "A pending slot is rewritten by the next commit.");
    }

    #[test]
    fn test_slots_cycle_through_push_and_front() {
        let mut ring = NativeRing::new(2);
        let a = ring.acquire_back().unwrap();
        ring.replace(a, slot(1));
        ring.queue(a);
        assert_eq!(ring.take_pending_for_push(), Some(slot(1)));
        ring.mark_displayed();
        assert_eq!(ring.front(), Some(slot(1)));

        let b = ring.acquire_back().unwrap();
        assert_ne!(a, b);
        ring.replace(b, slot(2));
        ring.queue(b);
        ring.take_pending_for_push();
        assert_eq!(ring.acquire_back(), None, "Front and push occupy both slots.");

        ring.mark_displayed();
        assert_eq!(ring.front(), Some(slot(2)));
        assert_eq!(ring.acquire_back(), Some(a));
    }

    #[test]
    fn test_wrapped_front_is_returned_when_replaced() {
        let mut ring = NativeRing::new(2);
        let wrapped = NativeSlot {
            wrapped: true,
            ..slot(7)
        };
        ring.replace(0, wrapped);
        ring.queue(0);
        ring.take_pending_for_push();
        assert_eq!(ring.mark_displayed(), None);

        ring.replace(1, slot(8));
        ring.queue(1);
        ring.take_pending_for_push();
        assert_eq!(ring.mark_displayed(), Some(wrapped));
        assert_eq!(ring.slot(0), None);
    }

    #[test]
    fn test_drain_all_returns_every_buffer() {
        let mut ring = NativeRing::new(3);
        ring.replace(0, slot(1));
        ring.replace(2, slot(3));
        ring.queue(2);
        let mut drained = ring.drain_all();
        drained.sort();
        assert_eq!(drained, vec![NativeBufferId::new(1), NativeBufferId::new(3)]);
        assert!(ring.pending().is_none());
        assert_eq!(ring.buffers().count(), 0);
    }
}
