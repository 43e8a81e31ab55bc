use std::cmp::Reverse;

use smallvec::SmallVec;
use tracing::{
    debug,
    trace,
};

use crate::codegen::{
    machine::{
        backing_store::BackingStore,
        Association,
        Backend,
        PhysicalRegister,
        RegClass,
        RegMask,
        TargetMachine,
        VRegRef,
    },
    register_allocator::{
        register_file::{
            RegState,
            PAIR_SIBLING_WEIGHT,
        },
        AllocError,
        PairLegality,
        PairRole,
        RegisterAssigner,
        RegisterFilePolicy,
    },
};

impl<TM: TargetMachine, BS: BackingStore> RegisterAssigner<'_, '_, TM, BS> {
    /// Makes sure `vreg` sits in a register of `mask` at the current instruction and books the reference.
    pub(super) fn assign_single(&mut self, vreg: VRegRef, mask: RegMask) -> Result<TM::Reg, AllocError> {
        let reg = match self.func.vregs[vreg].assigned {
            Some(current) if mask.contains(current) => current,
            Some(current) => self.shuffle(vreg, current, mask)?,
            None if self.func.vregs[vreg].is_spilled() => self.reverse_spill(vreg, mask)?,
            None => {
                let reg = self.find_or_free_register(vreg, mask)?;
                self.file.bind(reg, vreg, &mut self.func.vregs);
                reg
            }
        };
        trace!("{} is in {}", self.func.vregs[vreg], reg.name());
        self.consume_use(vreg);
        Ok(reg)
    }

    pub(super) fn find_or_free_register(
        &mut self,
        vreg: VRegRef,
        mask: RegMask,
    ) -> Result<TM::Reg, AllocError> {
        match self.find_best_free_register(vreg, mask) {
            Some(reg) => Ok(reg),
            None => self.free_best_register(vreg, mask),
        }
    }

    /// Picks the free register under `mask` that suits `vreg` best and claims it.
    pub(super) fn find_best_free_register(&mut self, vreg: VRegRef, mask: RegMask) -> Option<TM::Reg> {
        let (class, association, sibling, interference) = {
            let vreg = &self.func.vregs[vreg];
            (vreg.class, vreg.association, vreg.sibling, vreg.interference)
        };
        let role = match association {
            Association::FirstOfPair => Some(PairRole::First),
            Association::SecondOfPair => Some(PairRole::Second),
            Association::None | Association::Real(_) => None,
        };
        if let Some(role) = role {
            if self.config.enable_pair_association && TM::PairLegality::supports_pairs(class) {
                let candidate = match self.partner_of_sibling(sibling, role, mask) {
                    Some(reg) => Some(reg),
                    None => {
                        let best = self.find_best_legal_pair_member(class, role, mask);
                        if let Some(other) = best.and_then(TM::PairLegality::sibling) {
                            self.file.set_weight(other, PAIR_SIBLING_WEIGHT);
                        }
                        best
                    }
                };
                if let Some(reg) = candidate.filter(|reg| self.is_available(*reg)) {
                    self.file.claim(reg);
                    return Some(reg);
                }
            }
        }
        if let Association::Real(reg) = association {
            if mask.contains(reg) && self.is_available(reg) {
                self.file.claim(reg);
                return Some(reg);
            }
        }
        let best = self.file.best_weight(mask, interference);
        if let Some(reg) = best {
            self.file.claim(reg);
        }
        best
    }

    fn is_available(&self, reg: TM::Reg) -> bool {
        self.file.is_free(reg) && self.file.is_claimable(reg)
    }

    /// The register that completes a pair with the one the sibling of a pair half already sits in.
    fn partner_of_sibling(
        &self,
        sibling: Option<VRegRef>,
        role: PairRole,
        mask: RegMask,
    ) -> Option<TM::Reg> {
        let sibling_reg = self.func.vregs[sibling?].assigned?;
        if !TM::PairLegality::has_role(sibling_reg, role.other()) {
            return None;
        }
        TM::PairLegality::sibling(sibling_reg)
            .filter(|reg| self.is_legal_pair_member(*reg, role, true, mask))
    }

    pub(super) fn is_legal_pair_member(
        &self,
        reg: TM::Reg,
        role: PairRole,
        allow_blocked: bool,
        mask: RegMask,
    ) -> bool {
        if !mask.contains(reg) || !TM::PairLegality::has_role(reg, role) {
            return false;
        }
        if self.file.state(reg) == RegState::Locked {
            return false;
        }
        TM::PairLegality::sibling(reg).map_or(false, |sibling| match self.file.state(sibling) {
            RegState::Locked => false,
            RegState::Blocked => allow_blocked,
            _ => true,
        })
    }

    /// Cheapest free register that can take `role` in a pair, preferring ones whose sibling is free too.
    ///
    /// Falls back to any legal register, free or not, so the caller still learns where the pair would go.
    fn find_best_legal_pair_member(
        &self,
        class: RegClass,
        role: PairRole,
        mask: RegMask,
    ) -> Option<TM::Reg> {
        let mut with_free_sibling: Option<(TM::Reg, u32)> = None;
        let mut without_free_sibling: Option<(TM::Reg, u32)> = None;
        let mut last_legal = None;
        for reg in self
            .file
            .registers(mask & RegMask::of_class::<TM::Reg>(class))
        {
            if !self.is_legal_pair_member(reg, role, false, mask) {
                continue;
            }
            last_legal = Some(reg);
            if !self.is_available(reg) {
                continue;
            }
            let weight = self.file.weight(reg);
            let sibling_free = TM::PairLegality::sibling(reg).map_or(false, |sibling| self.is_available(sibling));
            let best = if sibling_free {
                &mut with_free_sibling
            } else {
                &mut without_free_sibling
            };
            if best.map_or(true, |(_, best_weight)| weight < best_weight) {
                *best = Some((reg, weight));
            }
        }
        with_free_sibling
            .or(without_free_sibling)
            .map(|(reg, _)| reg)
            .or(last_legal)
    }

    /// Moves `vreg` out of `current`, which the current instruction cannot use, into a register of `mask`.
    fn shuffle(&mut self, vreg: VRegRef, current: TM::Reg, mask: RegMask) -> Result<TM::Reg, AllocError> {
        let target = self.find_or_free_register(vreg, mask & !self.clobbered)?;
        let (class, size) = {
            let vreg = &self.func.vregs[vreg];
            (vreg.class, vreg.size)
        };
        debug!(
            "Shuffling {} from {} to {}",
            self.func.vregs[vreg],
            current.name(),
            target.name()
        );
        self.emit_fixup(TM::Backend::copy(class, size, current, target));
        self.file.bind(target, vreg, &mut self.func.vregs);
        self.file.unlatch(current);
        Ok(target)
    }

    pub(super) fn free_best_register(&mut self, vreg: VRegRef, mask: RegMask) -> Result<TM::Reg, AllocError> {
        self.try_free_best_register(vreg, mask)
            .ok_or_else(|| {
                let virt = &self.func.vregs[vreg];
                AllocError::OutOfRegisters {
                    vreg: virt.to_string(),
                    class: virt.class,
                    mask,
                }
            })
    }

    /// Spills the occupant of the register under `mask` that is cheapest to give up.
    pub(super) fn try_free_best_register(&mut self, vreg: VRegRef, mask: RegMask) -> Option<TM::Reg> {
        let victim = self.select_victim(vreg, mask)?;
        let owner = self
            .file
            .owner(victim)
            .unwrap_or_else(|| panic!("{} is assigned without an owner", victim.name()));
        debug!(
            "Freeing {} held by {} for {}",
            victim.name(),
            self.func.vregs[owner],
            self.func.vregs[vreg]
        );
        Some(self.spill(owner))
    }

    fn select_victim(&self, vreg: VRegRef, mask: RegMask) -> Option<TM::Reg> {
        let virt = &self.func.vregs[vreg];
        let mut candidates: SmallVec<[TM::Reg; 16]> = self
            .file
            .registers(mask)
            .filter(|reg| {
                let real = self.file.get(*reg);
                real.state == RegState::Assigned
                    && real.owner.is_some()
                    && !self.pinned.contains(*reg)
                    && self.file.is_claimable(*reg)
                    && TM::RegisterFilePolicy::is_assignable(*reg, virt.used_in_mem_ref)
            })
            .collect();
        if candidates.is_empty() {
            return None;
        }
        let owner_of = |reg: TM::Reg| {
            self.file
                .owner(reg)
                .unwrap_or_else(|| panic!("{} is assigned without an owner", reg.name()))
        };
        let preferred = match virt.association {
            Association::Real(reg) => candidates.iter().position(|candidate| *candidate == reg),
            _ => None,
        }
        .or_else(|| {
            candidates
                .iter()
                .position(|candidate| !self.func.vregs[owner_of(*candidate)].used_in_mem_ref)
        });
        if let Some(preferred) = preferred {
            candidates.swap(0, preferred);
        }
        // Values the next few instructions need are the worst to give up.
        candidates
            .iter()
            .copied()
            .min_by_key(|reg| Reverse(self.next_reference(owner_of(*reg)).unwrap_or(usize::MAX)))
    }

    /// How many upcoming instructions pass before `vreg` is referenced again, within the lookahead window.
    pub(super) fn next_reference(&self, vreg: VRegRef) -> Option<usize> {
        self.upcoming()
            .take(self.config.victim_lookahead)
            .take_while(|(instr, _)| !instr.is_label())
            .position(|(instr, conditions)| {
                instr.references(vreg) || conditions.map_or(false, |conditions| conditions.references(vreg))
            })
    }
}
