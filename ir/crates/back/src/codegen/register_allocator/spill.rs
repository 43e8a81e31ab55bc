use tracing::debug;

use crate::codegen::{
    machine::{
        backing_store::{
            BackingSlot,
            BackingStore,
            SpillDepth,
        },
        Backend,
        PhysicalRegister,
        RegClass,
        RegMask,
        Size,
        TargetMachine,
        VRegRef,
    },
    register_allocator::{
        AllocError,
        PathPhase,
        RegisterAssigner,
    },
};

/// Bytes of stack a spilled value of `class` and `size` occupies.
pub fn spill_bytes(class: RegClass, size: Size) -> u32 {
    match class {
        RegClass::Gpr if size <= Size::DWord => 4,
        RegClass::Gpr | RegClass::Fpr => 8,
        RegClass::Vrf => 16,
    }
}

impl<TM: TargetMachine, BS: BackingStore> RegisterAssigner<'_, '_, TM, BS> {
    /// Evicts `vreg` from its register into its spill slot and returns the register.
    ///
    /// Going backwards, the value is reloaded from the slot right after the current instruction.
    pub(super) fn spill(&mut self, vreg: VRegRef) -> TM::Reg {
        let virt = &self.func.vregs[vreg];
        let reg = virt
            .assigned
            .unwrap_or_else(|| panic!("Spilling {virt} which is not in a register"));
        assert!(!virt.placeholder, "Spilling placeholder {virt}");
        let (class, size) = (virt.class, virt.size);
        let mut backing = match virt.backing_store {
            Some(backing) => backing,
            None => BackingSlot {
                slot: self.store.allocate_slot(spill_bytes(class, size)),
                depth: SpillDepth::Unprotected,
            },
        };
        backing.depth = match (self.phase, backing.depth) {
            (PathPhase::Mainline, _) => SpillDepth::Mainline,
            (PathPhase::Hot, SpillDepth::Mainline) => SpillDepth::Mainline,
            (PathPhase::Hot, _) => SpillDepth::Hot,
            (PathPhase::Cold, depth @ (SpillDepth::Mainline | SpillDepth::Hot)) => depth,
            (PathPhase::Cold, _) => SpillDepth::Cold,
        };
        debug!(
            "Spilling {} from {} to {} at depth {}",
            self.func.vregs[vreg],
            reg.name(),
            backing.slot,
            backing.depth
        );
        self.emit_fixup(TM::Backend::spill_load(class, size, reg, backing.slot));
        if self.phase != PathPhase::Cold {
            self.spilled.insert(vreg);
        }
        self.func.vregs[vreg].backing_store = Some(backing);
        self.file.unbind(reg, &mut self.func.vregs);
        reg
    }

    /// Brings a spilled `vreg` back into a register of `mask`.
    ///
    /// The store that follows the instruction reads the register, so it cannot be one the instruction overwrites.
    pub(super) fn reverse_spill(&mut self, vreg: VRegRef, mask: RegMask) -> Result<TM::Reg, AllocError> {
        let target = self.find_or_free_register(vreg, mask & !self.clobbered)?;
        self.reverse_spill_into(vreg, target);
        Ok(target)
    }

    /// Binds `vreg` to `target` and stores it into its slot right after the current instruction.
    pub(super) fn reverse_spill_into(&mut self, vreg: VRegRef, target: TM::Reg) {
        self.file.bind(target, vreg, &mut self.func.vregs);
        let virt = &self.func.vregs[vreg];
        let (class, size) = (virt.class, virt.size);
        let Some(backing) = virt.backing_store else {
            debug!("{virt} has no slot to store to in {}", target.name());
            return;
        };
        debug!(
            "Reverse spilling {} from {} into {}",
            virt,
            backing.slot,
            target.name()
        );
        self.emit_fixup(TM::Backend::spill_store(class, size, target, backing.slot));
        let release = match self.phase {
            PathPhase::Cold => {
                matches!(backing.depth, SpillDepth::Unprotected | SpillDepth::Cold) || self.at_cold_entry
            }
            PathPhase::Hot => {
                self.spilled.shift_remove(&vreg);
                backing.depth == SpillDepth::Hot
            }
            PathPhase::Mainline => {
                self.spilled.shift_remove(&vreg);
                true
            }
        };
        if release {
            self.store.release_slot(backing.slot);
            self.func.vregs[vreg].backing_store = None;
        } else if self.phase == PathPhase::Hot {
            // The mainline reloads from the slot too, keep it until it is reverse spilled there.
            self.func.vregs[vreg].backing_store = Some(BackingSlot {
                depth: SpillDepth::Unprotected,
                ..backing
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn should_size_slots_by_class() {
        assert_eq!(spill_bytes(RegClass::Gpr, Size::DWord), 4);
        assert_eq!(spill_bytes(RegClass::Gpr, Size::QWord), 8);
        assert_eq!(spill_bytes(RegClass::Fpr, Size::DWord), 8);
        assert_eq!(spill_bytes(RegClass::Vrf, Size::OWord), 16);
    }
}
