use tracing::debug;

use crate::codegen::{
    machine::{
        backing_store::BackingStore,
        Association,
        PhysicalRegister,
        RegClass,
        RegMask,
        TargetMachine,
        VRegRef,
    },
    register_allocator::{
        register_file::RegState,
        AllocError,
        PairLegality,
        PairRole,
        RegisterAssigner,
    },
};

impl<TM: TargetMachine, BS: BackingStore> RegisterAssigner<'_, '_, TM, BS> {
    /// Puts `high` and `low` into a legal register pair of `mask` and books one reference of each.
    pub(super) fn assign_pair(
        &mut self,
        high: VRegRef,
        low: VRegRef,
        mask: RegMask,
    ) -> Result<(TM::Reg, TM::Reg), AllocError> {
        let class = self.func.vregs[high].class;
        if !TM::PairLegality::supports_pairs(class) {
            return Err(AllocError::IllegalPairClass { class });
        }
        let (high_reg, low_reg) = self.select_pair(class, high, low, mask)?;
        debug!(
            "Assigning pair {}:{} to {}:{}",
            self.func.vregs[high],
            self.func.vregs[low],
            high_reg.name(),
            low_reg.name()
        );
        if self.func.vregs[low].assigned == Some(low_reg) {
            self.file.block(low_reg);
        }
        self.coerce(high, high_reg)?;
        self.file.block(high_reg);
        self.coerce(low, low_reg)?;
        self.file.block(low_reg);
        assert!(
            TM::PairLegality::is_legal_pair(high_reg, low_reg),
            "{}:{} is not a legal pair",
            high_reg.name(),
            low_reg.name()
        );
        self.consume_use(high);
        self.consume_use(low);
        Ok((high_reg, low_reg))
    }

    fn select_pair(
        &mut self,
        class: RegClass,
        high: VRegRef,
        low: VRegRef,
        mask: RegMask,
    ) -> Result<(TM::Reg, TM::Reg), AllocError> {
        let high_current = self.func.vregs[high].assigned;
        let low_current = self.func.vregs[low].assigned;
        if let (Some(high_reg), Some(low_reg)) = (high_current, low_current) {
            if TM::PairLegality::is_legal_pair(high_reg, low_reg)
                && mask.contains(high_reg)
                && mask.contains(low_reg)
            {
                return Ok((high_reg, low_reg));
            }
        }
        if let Some(high_reg) = high_current {
            if let Some(low_reg) = self.usable_sibling(high_reg, PairRole::First, low, mask) {
                return Ok((high_reg, low_reg));
            }
        }
        if let Some(low_reg) = low_current {
            if let Some(high_reg) = self.usable_sibling(low_reg, PairRole::Second, high, mask) {
                return Ok((high_reg, low_reg));
            }
        }
        if let Some(pair) = self.find_best_free_register_pair(class, mask) {
            return Ok(pair);
        }
        self.free_best_register_pair(class, high, low, mask)
    }

    /// The sibling of `reg`, if `reg` can take `role` and the sibling can be taken over by `other_half`.
    fn usable_sibling(
        &self,
        reg: TM::Reg,
        role: PairRole,
        other_half: VRegRef,
        mask: RegMask,
    ) -> Option<TM::Reg> {
        if !self.is_legal_pair_member(reg, role, true, mask) {
            return None;
        }
        TM::PairLegality::sibling(reg).filter(|sibling| {
            mask.contains(*sibling)
                && (!self.pinned.contains(*sibling) || self.file.owner(*sibling) == Some(other_half))
        })
    }

    /// The free legal pair under `mask` with the lowest combined weight.
    fn find_best_free_register_pair(&mut self, class: RegClass, mask: RegMask) -> Option<(TM::Reg, TM::Reg)> {
        let best = TM::PairLegality::legal_pairs(class)
            .into_iter()
            .filter(|(high, low)| {
                [*high, *low].iter().all(|reg| {
                    mask.contains(*reg) && self.file.is_free(*reg) && self.file.is_claimable(*reg)
                })
            })
            .min_by_key(|(high, low)| self.file.weight(*high) + self.file.weight(*low));
        if let Some((high, low)) = best {
            self.file.claim(high);
            self.file.claim(low);
        }
        best
    }

    /// Spills the occupants of the legal pair under `mask` that is cheapest to free up.
    fn free_best_register_pair(
        &mut self,
        class: RegClass,
        high: VRegRef,
        low: VRegRef,
        mask: RegMask,
    ) -> Result<(TM::Reg, TM::Reg), AllocError> {
        let (high_reg, low_reg) = TM::PairLegality::legal_pairs(class)
            .into_iter()
            .filter(|(high_reg, low_reg)| {
                [*high_reg, *low_reg].iter().all(|reg| {
                    mask.contains(*reg)
                        && !self.pinned.contains(*reg)
                        && self.file.is_claimable(*reg)
                        && !matches!(self.file.state(*reg), RegState::Locked | RegState::Blocked)
                })
            })
            .min_by_key(|pair| self.pair_eviction_cost(*pair, high, low))
            .ok_or(AllocError::NoLegalPair { class, mask })?;
        for reg in [high_reg, low_reg] {
            if let Some(owner) = self.file.owner(reg).filter(|_| self.file.state(reg) == RegState::Assigned) {
                self.spill(owner);
            }
            self.file.claim(reg);
        }
        Ok((high_reg, low_reg))
    }

    /// Orders victim pairs by spill count, then by how soon the spilled values are needed again,
    /// then by how many of them are memory bases. An associated register breaks the remaining ties.
    fn pair_eviction_cost(
        &self,
        (high_reg, low_reg): (TM::Reg, TM::Reg),
        high: VRegRef,
        low: VRegRef,
    ) -> (usize, usize, usize, bool) {
        let mut spills = 0;
        let mut urgency = 0;
        let mut mem_bases = 0;
        for reg in [high_reg, low_reg] {
            let Some(owner) = self.file.owner(reg).filter(|_| !self.file.is_free(reg)) else {
                continue;
            };
            spills += 1;
            urgency += self
                .next_reference(owner)
                .map_or(0, |distance| self.config.victim_lookahead - distance);
            if self.func.vregs[owner].used_in_mem_ref {
                mem_bases += 1;
            }
        }
        let associated = [(high, high_reg), (low, low_reg)]
            .into_iter()
            .any(|(vreg, reg)| self.func.vregs[vreg].association == Association::Real(reg));
        (spills, urgency, mem_bases, !associated)
    }
}
