use std::fmt::{
    Display,
    Formatter,
};

use index_vec::IndexVec;
use rustc_hash::FxHashMap;
use tracing::debug;

index_vec::define_index_type! {
    pub struct SlotId = u32;

    DISPLAY_FORMAT = "slot{}";
}

/// A handle to a stack resident spill location.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct SpillSlot {
    pub id: SlotId,
    pub bytes: u32,
}

impl Display for SpillSlot {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}[{}]", self.id, self.bytes)
    }
}

/// The most nested path a spill of the slot's value has happened in.
///
/// Decides whether a reverse spill may give the slot back right away or has to leave it
/// to an outer path that still reloads from it.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default, Display)]
pub enum SpillDepth {
    #[default]
    Unprotected,
    Mainline,
    Hot,
    Cold,
}

/// The spill slot a virtual register is currently backed by.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct BackingSlot {
    pub slot: SpillSlot,
    pub depth: SpillDepth,
}

pub trait BackingStore {
    fn allocate_slot(&mut self, bytes: u32) -> SpillSlot;

    fn release_slot(&mut self, slot: SpillSlot);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct SlotInfo {
    bytes: u32,
    in_use: bool,
}

/// Spill slots of a single stack frame.
///
/// Released slots are handed out again for requests of the same size.
#[derive(Debug, Clone, Default)]
pub struct StackFrame {
    slots: IndexVec<SlotId, SlotInfo>,
    free: FxHashMap<u32, Vec<SlotId>>,
}

impl StackFrame {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_in_use(&self, slot: SpillSlot) -> bool {
        self.slots[slot.id].in_use
    }

    pub fn slots_in_use(&self) -> usize {
        self.slots.iter().filter(|info| info.in_use).count()
    }

    /// Number of slots the frame has to reserve space for.
    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    pub fn size_in_bytes(&self) -> u32 {
        self.slots.iter().map(|info| info.bytes).sum()
    }
}

impl BackingStore for StackFrame {
    fn allocate_slot(&mut self, bytes: u32) -> SpillSlot {
        let id = match self.free.get_mut(&bytes).and_then(Vec::pop) {
            Some(id) => {
                self.slots[id].in_use = true;
                id
            }
            None => self.slots.push(SlotInfo {
                bytes,
                in_use: true,
            }),
        };
        debug!("Allocated spill slot {id} of {bytes} bytes");
        SpillSlot { id, bytes }
    }

    fn release_slot(&mut self, slot: SpillSlot) {
        let info = &mut self.slots[slot.id];
        assert!(info.in_use, "Spill slot {} released twice", slot.id);
        info.in_use = false;
        self.free.entry(info.bytes).or_default().push(slot.id);
        debug!("Released spill slot {}", slot.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn should_reuse_released_slots_of_the_same_size() {
        let mut frame = StackFrame::new();
        let a = frame.allocate_slot(8);
        let b = frame.allocate_slot(4);
        frame.release_slot(a);
        let c = frame.allocate_slot(4);
        assert_ne!(c.id, a.id, "A four byte request must not reuse an eight byte slot");
        let d = frame.allocate_slot(8);
        assert_eq!(d.id, a.id);
        assert_eq!(frame.slot_count(), 3);
        assert_eq!(frame.size_in_bytes(), 16);
        assert!(frame.is_in_use(b));
        assert_eq!(frame.slots_in_use(), 3);
    }

    #[test]
    #[should_panic(expected = "released twice")]
    fn should_reject_double_release() {
        let mut frame = StackFrame::new();
        let slot = frame.allocate_slot(16);
        frame.release_slot(slot);
        frame.release_slot(slot);
    }
}
