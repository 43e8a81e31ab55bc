use tracing::{
    debug,
    warn,
};

use crate::codegen::{
    machine::{
        backing_store::BackingStore,
        Backend,
        PhysicalRegister,
        RegClass,
        RegMask,
        Size,
        TargetMachine,
        VRegRef,
    },
    register_allocator::{
        register_file::RegState,
        spill::spill_bytes,
        AllocError,
        RegisterAssigner,
        RegisterFilePolicy,
    },
};

impl<TM: TargetMachine, BS: BackingStore> RegisterAssigner<'_, '_, TM, BS> {
    /// Forces `vreg` into `target` at the current instruction, moving whatever is in the way.
    pub(super) fn coerce(&mut self, vreg: VRegRef, target: TM::Reg) -> Result<(), AllocError> {
        let current = self.func.vregs[vreg].assigned;
        if current == Some(target) {
            return Ok(());
        }
        debug!(
            "Coercing {} from {:?} into {}",
            self.func.vregs[vreg],
            current.map(|reg| reg.name()),
            target.name()
        );
        self.evict_overlap(vreg, target)?;
        match self.file.state(target) {
            RegState::Locked => {
                warn!(
                    "Coercing {} into locked register {}",
                    self.func.vregs[vreg],
                    target.name()
                );
                self.move_into(vreg, current, target);
            }
            RegState::Free | RegState::Unlatched => self.move_into(vreg, current, target),
            RegState::Assigned | RegState::Blocked => {
                let occupant = self
                    .file
                    .owner(target)
                    .unwrap_or_else(|| panic!("{} is occupied without an owner", target.name()));
                self.displace(vreg, current, target, occupant)?;
            }
        }
        Ok(())
    }

    /// Moves `vreg` from `current` into the free register `target`.
    fn move_into(&mut self, vreg: VRegRef, current: Option<TM::Reg>, target: TM::Reg) {
        match current {
            Some(old) => {
                let (class, size) = self.class_and_size(vreg);
                self.emit_fixup(TM::Backend::copy(class, size, old, target));
                self.file.bind(target, vreg, &mut self.func.vregs);
                self.file.unlatch(old);
            }
            None if self.func.vregs[vreg].is_spilled() => self.reverse_spill_into(vreg, target),
            None => self.file.bind(target, vreg, &mut self.func.vregs),
        }
    }

    /// Makes room for `vreg` in `target`, which `occupant` holds right now.
    fn displace(
        &mut self,
        vreg: VRegRef,
        current: Option<TM::Reg>,
        target: TM::Reg,
        occupant: VRegRef,
    ) -> Result<(), AllocError> {
        if self.pinned.contains(target) {
            return Err(self.irrecoverable(vreg, occupant, target));
        }
        let occupant_mask = self.operand_mask(occupant, false);
        if let Some(old) = current {
            let can_exchange = occupant_mask.contains(old)
                && !self.pinned.contains(old)
                && self.file.state(old) != RegState::Locked
                && TM::RegisterFilePolicy::is_assignable(old, self.func.vregs[occupant].used_in_mem_ref);
            if can_exchange {
                self.exchange(vreg, occupant, target, old);
                return Ok(());
            }
        }
        let target_state = self.file.state(target);
        // Neither register may serve as the spare.
        self.file.block(target);
        if let Some(old) = current {
            self.file.block(old);
        }
        let spare = match self.find_best_free_register(occupant, occupant_mask) {
            Some(spare) => Some(spare),
            None => self.try_free_best_register(occupant, occupant_mask),
        };
        match spare {
            Some(spare) => {
                let (class, size) = self.class_and_size(occupant);
                debug!(
                    "Relocating {} from {} to {}",
                    self.func.vregs[occupant],
                    target.name(),
                    spare.name()
                );
                let mut fixups = Vec::with_capacity(2);
                if let Some(old) = current {
                    fixups.push(TM::Backend::copy(class, size, old, target));
                }
                fixups.push(TM::Backend::copy(class, size, target, spare));
                self.emit_fixups(fixups);
                self.file.bind(spare, occupant, &mut self.func.vregs);
                if target_state == RegState::Blocked {
                    self.file.block(spare);
                }
                let real = self.file.get_mut(target);
                real.owner = None;
                real.state = RegState::Free;
                match current {
                    Some(old) => {
                        self.file.bind(target, vreg, &mut self.func.vregs);
                        self.file.unlatch(old);
                    }
                    None if self.func.vregs[vreg].is_spilled() => self.reverse_spill_into(vreg, target),
                    None => self.file.bind(target, vreg, &mut self.func.vregs),
                }
            }
            None if target_state == RegState::Blocked => {
                return Err(self.irrecoverable(vreg, occupant, target));
            }
            None => {
                self.spill(occupant);
                self.move_into(vreg, current, target);
            }
        }
        Ok(())
    }

    /// Swaps the contents of `target` and `old` so `vreg` ends up in `target` and `occupant` in `old`.
    fn exchange(&mut self, vreg: VRegRef, occupant: VRegRef, target: TM::Reg, old: TM::Reg) {
        let (class, size) = self.class_and_size(vreg);
        debug!(
            "Exchanging {} in {} with {} in {}",
            self.func.vregs[vreg],
            old.name(),
            self.func.vregs[occupant],
            target.name()
        );
        match self.find_swap_register(class, target, old) {
            Some(middle) => self.emit_fixups([
                TM::Backend::copy(class, size, middle, target),
                TM::Backend::copy(class, size, target, old),
                TM::Backend::copy(class, size, old, middle),
            ]),
            None => {
                let slot = self.store.allocate_slot(spill_bytes(class, size));
                self.emit_fixups([
                    TM::Backend::spill_store(class, size, target, slot),
                    TM::Backend::copy(class, size, target, old),
                    TM::Backend::spill_load(class, size, old, slot),
                ]);
                self.store.release_slot(slot);
            }
        }
        let target_state = self.file.state(target);
        let old_state = self.file.state(old);
        self.file.get_mut(target).owner = Some(vreg);
        self.file.get_mut(old).owner = Some(occupant);
        self.file.set_state(target, old_state);
        self.file.set_state(old, target_state);
        self.func.vregs[vreg].assigned = Some(target);
        self.func.vregs[occupant].assigned = Some(old);
    }

    /// A register that can hold a value in passing while two others are exchanged.
    ///
    /// Registers held by placeholders are fair game since their contents are dead.
    fn find_swap_register(
        &self,
        class: RegClass,
        target: TM::Reg,
        old: TM::Reg,
    ) -> Option<TM::Reg> {
        let mut mask = TM::RegisterFilePolicy::assignable(class) & !self.pinned;
        mask.remove(target);
        mask.remove(old);
        self.file.best_weight(mask, RegMask::EMPTY).or_else(|| {
            self.file.registers(mask).find(|reg| {
                matches!(self.file.state(*reg), RegState::Assigned | RegState::Blocked)
                    && self.file.is_claimable(*reg)
                    && self
                        .file
                        .owner(*reg)
                        .map_or(false, |owner| self.func.vregs[owner].placeholder)
            })
        })
    }

    /// Spills whatever another class keeps in the storage `target` shares.
    fn evict_overlap(&mut self, vreg: VRegRef, target: TM::Reg) -> Result<(), AllocError> {
        let Some(overlap) = target.overlaps() else {
            return Ok(());
        };
        let Some(owner) = self.file.owner(overlap) else {
            return Ok(());
        };
        match self.file.state(overlap) {
            RegState::Assigned if !self.pinned.contains(overlap) => {
                debug!(
                    "Spilling {} out of {} which overlaps {}",
                    self.func.vregs[owner],
                    overlap.name(),
                    target.name()
                );
                self.spill(owner);
                Ok(())
            }
            RegState::Assigned | RegState::Blocked | RegState::Locked => {
                Err(self.irrecoverable(vreg, owner, overlap))
            }
            RegState::Free | RegState::Unlatched => Ok(()),
        }
    }

    fn class_and_size(&self, vreg: VRegRef) -> (RegClass, Size) {
        let vreg = &self.func.vregs[vreg];
        (vreg.class, vreg.size)
    }

    fn irrecoverable(&self, vreg: VRegRef, occupant: VRegRef, reg: TM::Reg) -> AllocError {
        AllocError::IrrecoverableCoercion {
            vreg: self.func.vregs[vreg].to_string(),
            occupant: self.func.vregs[occupant].to_string(),
            reg: reg.name(),
        }
    }
}
