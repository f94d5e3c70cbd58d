//! Intrusive membership lists for tracked entries
//!
//! Every tracked entry lives in an index-stable slot and belongs to at most
//! one of the environment's two lists. Links are slot indices rather than
//! pointers, and a [`RefId`] carries the generation of its slot, so a handle
//! to an entry that has since been released is recognised instead of being
//! followed into someone else's slot.

use std::iter::successors;

/// Handle to a tracked entry, as handed out to native code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RefId {
    index: u32,
    generation: u32,
}

impl RefId {
    /// Pack the handle into an integer, e.g. to pass it through a C `void*`
    pub fn into_raw(self) -> u64 {
        (u64::from(self.generation) << 32) | u64::from(self.index)
    }

    pub fn from_raw(raw: u64) -> Self {
        Self {
            index: raw as u32,
            generation: (raw >> 32) as u32,
        }
    }
}

/// The two lists an environment keeps its entries in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ListKind {
    /// Entries without a finalize callback
    Live,
    /// Entries holding a finalize callback; torn down first
    Finalizing,
}

impl ListKind {
    #[inline]
    const fn slot(self) -> usize {
        match self {
            ListKind::Live => 0,
            ListKind::Finalizing => 1,
        }
    }
}

/// What a handle currently refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum HandleState {
    Live,
    /// Issued once, the entry has since been removed
    Released,
    /// Never issued by this tracker
    Invalid,
}

/// Links of one entry. All `None` while unlinked.
#[derive(Debug, Default, Clone, Copy)]
struct TrackedNode {
    list: Option<ListKind>,
    prev: Option<u32>,
    next: Option<u32>,
}

struct Slot<T> {
    generation: u32,
    node: TrackedNode,
    value: Option<T>,
}

/// Slot arena plus the heads of both lists
pub(crate) struct Tracker<T> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
    heads: [Option<u32>; 2],
    lens: [usize; 2],
}

impl<T> Tracker<T> {
    pub(crate) fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: Vec::with_capacity(capacity),
            free: Vec::new(),
            heads: [None; 2],
            lens: [0; 2],
        }
    }

    /// Store `value` in a free slot. The new entry is not linked yet.
    pub(crate) fn insert(&mut self, value: T) -> RefId {
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.value = Some(value);
            slot.node = TrackedNode::default();
            return RefId {
                index,
                generation: slot.generation,
            };
        }

        let index = u32::try_from(self.slots.len()).unwrap_or_else(|_| {
            crate::error::fatal_error("Tracker::insert", "reference table exhausted")
        });
        self.slots.push(Slot {
            generation: 0,
            node: TrackedNode::default(),
            value: Some(value),
        });
        RefId {
            index,
            generation: 0,
        }
    }

    fn slot(&self, id: RefId) -> Option<&Slot<T>> {
        self.slots
            .get(id.index as usize)
            .filter(|slot| slot.generation == id.generation && slot.value.is_some())
    }

    pub(crate) fn state(&self, id: RefId) -> HandleState {
        match self.slots.get(id.index as usize) {
            Some(slot) if slot.generation == id.generation && slot.value.is_some() => {
                HandleState::Live
            }
            Some(slot) if id.generation < slot.generation => HandleState::Released,
            _ => HandleState::Invalid,
        }
    }

    pub(crate) fn get(&self, id: RefId) -> Option<&T> {
        self.slot(id)?.value.as_ref()
    }

    pub(crate) fn get_mut(&mut self, id: RefId) -> Option<&mut T> {
        self.slots
            .get_mut(id.index as usize)
            .filter(|slot| slot.generation == id.generation)?
            .value
            .as_mut()
    }

    pub(crate) fn contains(&self, id: RefId) -> bool {
        self.slot(id).is_some()
    }

    /// Unlink and drop the entry, retiring its handle.
    pub(crate) fn remove(&mut self, id: RefId) -> Option<T> {
        if !self.contains(id) {
            return None;
        }
        self.unlink(id);
        let slot = &mut self.slots[id.index as usize];
        let value = slot.value.take();
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(id.index);
        value
    }

    /// Insert the entry as the new head of `list`.
    ///
    /// # Panics
    /// Panics if the entry is already a member of a list.
    pub(crate) fn link(&mut self, id: RefId, list: ListKind) {
        let Some(slot) = self.slot(id) else {
            return;
        };
        assert!(
            slot.node.list.is_none(),
            "tracked node is already linked into {:?}",
            slot.node.list
        );

        let old_head = self.heads[list.slot()];
        self.slots[id.index as usize].node = TrackedNode {
            list: Some(list),
            prev: None,
            next: old_head,
        };
        if let Some(head) = old_head {
            self.slots[head as usize].node.prev = Some(id.index);
        }
        self.heads[list.slot()] = Some(id.index);
        self.lens[list.slot()] += 1;
    }

    /// Remove the entry from whatever list holds it. Returns `false` if it
    /// was not linked.
    pub(crate) fn unlink(&mut self, id: RefId) -> bool {
        let Some(node) = self.slot(id).map(|slot| slot.node) else {
            return false;
        };
        let Some(list) = node.list else {
            return false;
        };

        match node.prev {
            Some(prev) => self.slots[prev as usize].node.next = node.next,
            None => self.heads[list.slot()] = node.next,
        }
        if let Some(next) = node.next {
            self.slots[next as usize].node.prev = node.prev;
        }
        self.slots[id.index as usize].node = TrackedNode::default();
        self.lens[list.slot()] -= 1;
        true
    }

    pub(crate) fn first(&self, list: ListKind) -> Option<RefId> {
        self.heads[list.slot()].map(|index| self.id_at(index))
    }

    pub(crate) fn list_of(&self, id: RefId) -> Option<ListKind> {
        self.slot(id)?.node.list
    }

    pub(crate) fn len(&self, list: ListKind) -> usize {
        self.lens[list.slot()]
    }

    /// Walk `list` from its head
    pub(crate) fn iter(&self, list: ListKind) -> impl Iterator<Item = RefId> + '_ {
        successors(self.heads[list.slot()], |&index| {
            self.slots[index as usize].node.next
        })
        .map(|index| self.id_at(index))
    }

    fn id_at(&self, index: u32) -> RefId {
        RefId {
            index,
            generation: self.slots[index as usize].generation,
        }
    }
}
