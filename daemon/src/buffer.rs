//! Fixed-capacity slot ring backing one producer.
//!
//! The ring is a plain state machine with no I/O. The producer task owns it
//! and drives every transition:
//!
//! ```text
//! Empty --insert--> Referenced --begin_loading--> Loading --complete--> Ready
//!   ^                                                |                   |
//!   +-------------------- fail ----------------------+---- take_ready ---+
//! ```
//!
//! Each load carries a ticket. Completions whose ticket no longer matches the
//! slot (because the slot was flushed, failed or reused) are rejected and the
//! caller drops the late result.

use crate::content::Content;
use crate::loader::Loaded;
use common::SlotState;

enum Slot {
    Empty,
    Referenced(Content),
    Loading { content: Content, ticket: u64 },
    Ready { content: Content, order: u64 },
}

impl Slot {
    fn state(&self) -> SlotState {
        match self {
            Slot::Empty => SlotState::Empty,
            Slot::Referenced(_) => SlotState::Referenced,
            Slot::Loading { .. } => SlotState::Loading,
            Slot::Ready { .. } => SlotState::Ready,
        }
    }
}

/// Content removed from the ring by [`SlotRing::flush`], tagged with the
/// state its slot was in.
#[derive(Debug)]
pub enum Flushed {
    Referenced(Content),
    Loading(Content),
    Ready(Content),
}

impl Flushed {
    pub fn into_content(self) -> Content {
        match self {
            Flushed::Referenced(c) | Flushed::Loading(c) | Flushed::Ready(c) => c,
        }
    }
}

/// A Ready item taken out of the ring.
///
/// Keeps its slot and readiness order so it can be put back if the hand-off
/// to a consumer fails.
#[derive(Debug)]
pub struct Taken {
    pub slot: usize,
    order: u64,
    pub content: Content,
}

pub struct SlotRing {
    slots: Vec<Slot>,
    next_order: u64,
    internal_errors: u64,
}

impl SlotRing {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: (0..capacity.max(1)).map(|_| Slot::Empty).collect(),
            next_order: 0,
            internal_errors: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn state(&self, slot: usize) -> Option<SlotState> {
        self.slots.get(slot).map(Slot::state)
    }

    pub fn states(&self) -> Vec<SlotState> {
        self.slots.iter().map(Slot::state).collect()
    }

    pub fn count(&self, state: SlotState) -> usize {
        self.slots.iter().filter(|s| s.state() == state).count()
    }

    /// Number of times content arrived with no Empty slot to hold it
    pub fn internal_errors(&self) -> u64 {
        self.internal_errors
    }

    /// Content held by a slot, whatever its state
    pub fn content(&self, slot: usize) -> Option<&Content> {
        match self.slots.get(slot)? {
            Slot::Empty => None,
            Slot::Referenced(content)
            | Slot::Loading { content, .. }
            | Slot::Ready { content, .. } => Some(content),
        }
    }

    /// Place content into the first Empty slot.
    ///
    /// Hands the content back when every slot is occupied. That only
    /// happens when more production was scheduled than there is room for,
    /// so it is counted as an internal error.
    pub fn insert(&mut self, mut content: Content) -> Result<usize, Content> {
        match self.slots.iter().position(|s| matches!(s, Slot::Empty)) {
            Some(index) => {
                content.mark_buffered();
                self.slots[index] = Slot::Referenced(content);
                Ok(index)
            }
            None => {
                self.internal_errors += 1;
                Err(content)
            }
        }
    }

    /// Move a Referenced slot to Loading under `ticket`
    pub fn begin_loading(&mut self, slot: usize, ticket: u64) -> bool {
        let Some(entry) = self.slots.get_mut(slot) else {
            return false;
        };
        match std::mem::replace(entry, Slot::Empty) {
            Slot::Referenced(content) => {
                *entry = Slot::Loading { content, ticket };
                true
            }
            other => {
                *entry = other;
                false
            }
        }
    }

    fn is_loading(&self, slot: usize, ticket: u64) -> bool {
        matches!(
            self.slots.get(slot),
            Some(Slot::Loading { ticket: t, .. }) if *t == ticket
        )
    }

    /// Attach a finished load to its slot and mark it Ready.
    ///
    /// Returns the load result untouched if the slot is no longer loading
    /// this ticket.
    pub fn complete(&mut self, slot: usize, ticket: u64, loaded: Loaded) -> Result<(), Loaded> {
        if !self.is_loading(slot, ticket) {
            return Err(loaded);
        }
        let Slot::Loading { mut content, .. } = std::mem::replace(&mut self.slots[slot], Slot::Empty)
        else {
            return Err(loaded);
        };

        if let Some(derived) = loaded.derived_reference {
            content.assign_reference(derived);
        }
        content.mark_loaded_at(loaded.loaded_at);
        content.set_element(loaded.renderable);
        content.mark_decoded();

        let order = self.next_order;
        self.next_order += 1;
        self.slots[slot] = Slot::Ready { content, order };
        Ok(())
    }

    /// Empty a slot whose load failed. `None` if the ticket is stale.
    pub fn fail(&mut self, slot: usize, ticket: u64) -> Option<Content> {
        if !self.is_loading(slot, ticket) {
            return None;
        }
        match std::mem::replace(&mut self.slots[slot], Slot::Empty) {
            Slot::Loading { content, .. } => Some(content),
            _ => None,
        }
    }

    /// Take the Ready item that became ready first
    pub fn take_ready(&mut self) -> Option<Taken> {
        let slot = self
            .slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| match s {
                Slot::Ready { order, .. } => Some((i, *order)),
                _ => None,
            })
            .min_by_key(|(_, order)| *order)
            .map(|(i, _)| i)?;

        match std::mem::replace(&mut self.slots[slot], Slot::Empty) {
            Slot::Ready { content, order } => Some(Taken {
                slot,
                order,
                content,
            }),
            _ => None,
        }
    }

    /// Return an item whose hand-off failed to the slot it came from
    pub fn put_back(&mut self, taken: Taken) {
        match self.slots.get_mut(taken.slot) {
            Some(entry) if matches!(entry, Slot::Empty) => {
                *entry = Slot::Ready {
                    content: taken.content,
                    order: taken.order,
                };
            }
            _ => {
                self.internal_errors += 1;
                log::error!(
                    "Slot {} was reused before {} could be put back; dropping it",
                    taken.slot,
                    taken.content.reference()
                );
            }
        }
    }

    /// Empty every slot, returning what they held
    pub fn flush(&mut self) -> Vec<Flushed> {
        self.slots
            .iter_mut()
            .filter_map(|entry| match std::mem::replace(entry, Slot::Empty) {
                Slot::Empty => None,
                Slot::Referenced(content) => Some(Flushed::Referenced(content)),
                Slot::Loading { content, .. } => Some(Flushed::Loading(content)),
                Slot::Ready { content, .. } => Some(Flushed::Ready(content)),
            })
            .collect()
    }
}
