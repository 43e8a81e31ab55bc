use std::fmt::{
    Display,
    Formatter,
};

use slotmap::SlotMap;
use tracing::trace;

use crate::codegen::{
    machine::{
        abi::CallingConvention,
        reg::Association,
        PhysicalRegister,
        RegMask,
        TargetMachine,
        VReg,
        VRegRef,
    },
    register_allocator::RegisterFilePolicy,
};

pub const HEAVIEST_WEIGHT: u32 = 0xffff;
pub const PAIR_SIBLING_WEIGHT: u32 = 0x8000;
pub const INITIAL_PRESERVED_WEIGHT: u32 = 0x1000;
pub const ASSOCIATED_WEIGHT: u32 = 0x800;
pub const PLACEHOLDER_WEIGHT: u32 = 0x100;
pub const LOW_PRIORITY_WEIGHT: u32 = 0xc0;
pub const BASIC_WEIGHT: u32 = 0x80;

pub type VRegs<TM> = SlotMap<VRegRef, VReg<TM>>;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Display)]
pub enum RegState {
    Free,
    Assigned,
    /// Excluded from assignment until the current instruction is done.
    Blocked,
    /// Free, but the previous owner has not been cleared yet.
    Unlatched,
    /// Reserved for the whole function.
    Locked,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RealRegister<TM: TargetMachine> {
    pub reg: TM::Reg,
    pub state: RegState,
    pub owner: Option<VRegRef>,
    pub weight: u32,
    pub assigned_in_function: bool,
}

impl<TM: TargetMachine> RealRegister<TM> {
    pub const fn is_free(&self) -> bool {
        matches!(self.state, RegState::Free | RegState::Unlatched)
    }

    pub const fn is_occupied(&self) -> bool {
        matches!(
            self.state,
            RegState::Assigned | RegState::Blocked | RegState::Locked
        )
    }
}

/// Per target register file setup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterFileConfig {
    pub locked: RegMask,
    pub preserved: RegMask,
}

impl RegisterFileConfig {
    pub fn for_target<TM: TargetMachine>() -> Self {
        Self {
            locked: RegMask::from_regs(
                TM::CallingConvention::locked_registers().iter().copied(),
            ),
            preserved: RegMask::from_regs(
                TM::CallingConvention::preserved_registers().iter().copied(),
            ),
        }
    }

    #[must_use]
    pub fn lock<R: PhysicalRegister>(mut self, regs: impl IntoIterator<Item = R>) -> Self {
        for reg in regs {
            self.locked.insert(reg);
        }
        self
    }
}

#[derive(Debug, Clone)]
pub struct RegisterFile<TM: TargetMachine> {
    pub(super) regs: Vec<RealRegister<TM>>,
    pub(super) associations: Vec<Option<VRegRef>>,
    config: RegisterFileConfig,
}

impl<TM: TargetMachine> RegisterFile<TM> {
    pub fn new(config: RegisterFileConfig) -> Self {
        let regs = TM::Reg::all()
            .iter()
            .map(|reg| RealRegister {
                reg: *reg,
                state: if config.locked.contains(*reg) {
                    RegState::Locked
                } else {
                    RegState::Free
                },
                owner: None,
                weight: TM::RegisterFilePolicy::base_weight(*reg),
                assigned_in_function: false,
            })
            .collect::<Vec<_>>();
        let associations = vec![None; regs.len()];
        Self {
            regs,
            associations,
            config,
        }
    }

    pub const fn config(&self) -> &RegisterFileConfig {
        &self.config
    }

    pub fn get(&self, reg: TM::Reg) -> &RealRegister<TM> {
        &self.regs[reg.index()]
    }

    pub fn get_mut(&mut self, reg: TM::Reg) -> &mut RealRegister<TM> {
        &mut self.regs[reg.index()]
    }

    pub fn iter(&self) -> impl Iterator<Item = &RealRegister<TM>> {
        self.regs.iter()
    }

    pub fn state(&self, reg: TM::Reg) -> RegState {
        self.get(reg).state
    }

    pub fn set_state(&mut self, reg: TM::Reg, state: RegState) {
        self.get_mut(reg).state = state;
    }

    pub fn owner(&self, reg: TM::Reg) -> Option<VRegRef> {
        self.get(reg).owner
    }

    pub fn weight(&self, reg: TM::Reg) -> u32 {
        self.get(reg).weight
    }

    pub fn set_weight(&mut self, reg: TM::Reg, weight: u32) {
        self.get_mut(reg).weight = weight;
    }

    pub fn is_free(&self, reg: TM::Reg) -> bool {
        self.get(reg).is_free()
    }

    /// The register does not share storage with an occupied register of another class.
    pub fn is_claimable(&self, reg: TM::Reg) -> bool {
        reg.overlaps()
            .map_or(true, |overlap| !self.get(overlap).is_occupied())
    }

    /// Registers of `mask` in register file order.
    pub fn registers(&self, mask: RegMask) -> impl Iterator<Item = TM::Reg> {
        mask.iter::<TM::Reg>()
    }

    /// The free register under `mask` that is cheapest to take.
    ///
    /// Registers in `interference` lose against any register outside of it.
    pub fn best_weight(&self, mask: RegMask, interference: RegMask) -> Option<TM::Reg> {
        let mut best: Option<(TM::Reg, u32, bool)> = None;
        for reg in self.registers(mask) {
            let real = self.get(reg);
            if !real.is_free() || !self.is_claimable(reg) {
                continue;
            }
            let interferes = interference.contains(reg);
            let better = match best {
                None => true,
                Some((_, best_weight, best_interferes)) => {
                    (best_interferes && !interferes)
                        || ((best_interferes || !interferes) && real.weight < best_weight)
                }
            };
            if better {
                best = Some((reg, real.weight, interferes));
            }
        }
        best.map(|(reg, _, _)| reg)
    }

    /// Clears the stale owner of an unlatched register.
    pub fn claim(&mut self, reg: TM::Reg) {
        let real = self.get_mut(reg);
        if real.state == RegState::Unlatched {
            real.owner = None;
            real.state = RegState::Free;
        }
    }

    /// Links `reg` and `vreg` to each other.
    pub fn bind(&mut self, reg: TM::Reg, vreg: VRegRef, vregs: &mut VRegs<TM>) {
        self.claim(reg);
        let real = self.get_mut(reg);
        if real.state == RegState::Locked {
            vregs[vreg].assigned = Some(reg);
            vregs[vreg].live = true;
            return;
        }
        debug_assert!(
            real.is_free() || real.owner == Some(vreg),
            "Binding {} to {} which is owned by {:?}",
            vregs[vreg],
            reg.name(),
            real.owner
        );
        if real.state != RegState::Blocked {
            real.state = RegState::Assigned;
        }
        real.owner = Some(vreg);
        real.assigned_in_function = true;
        vregs[vreg].assigned = Some(reg);
        vregs[vreg].live = true;
    }

    /// Clears the links between `reg` and its owner and frees the register.
    pub fn unbind(&mut self, reg: TM::Reg, vregs: &mut VRegs<TM>) {
        let real = self.get_mut(reg);
        if let Some(owner) = real.owner.take() {
            if vregs[owner].assigned == Some(reg) {
                vregs[owner].assigned = None;
            }
        }
        if real.state != RegState::Locked {
            real.state = RegState::Free;
        }
    }

    /// Marks a register its owner has moved away from.
    pub fn unlatch(&mut self, reg: TM::Reg) {
        let real = self.get_mut(reg);
        if real.state != RegState::Locked {
            real.state = RegState::Unlatched;
        }
    }

    pub fn block(&mut self, reg: TM::Reg) {
        let real = self.get_mut(reg);
        if real.state == RegState::Assigned {
            real.state = RegState::Blocked;
        }
    }

    pub fn unblock_all(&mut self) {
        for real in &mut self.regs {
            if real.state == RegState::Blocked {
                real.state = RegState::Assigned;
            }
        }
    }

    pub fn free_unlatched(&mut self) {
        for real in &mut self.regs {
            if real.state == RegState::Unlatched {
                real.owner = None;
                real.state = RegState::Free;
            }
        }
    }

    pub fn association(&self, reg: TM::Reg) -> Option<VRegRef> {
        self.associations[reg.index()]
    }

    pub fn set_association(&mut self, reg: TM::Reg, vreg: Option<VRegRef>) {
        self.associations[reg.index()] = vreg;
    }

    /// Recomputes the weights of all unlocked registers from the current associations.
    pub fn set_weights_from_associations(&mut self, vregs: &mut VRegs<TM>) {
        for index in 0..self.regs.len() {
            let reg = self.regs[index].reg;
            if self.regs[index].state == RegState::Locked {
                continue;
            }
            let associated = self.associations[index].filter(|vreg| vregs.contains_key(*vreg));
            if let Some(vreg) = associated {
                let vreg = &mut vregs[vreg];
                if !matches!(
                    vreg.association,
                    Association::FirstOfPair | Association::SecondOfPair
                ) {
                    vreg.association = Association::Real(reg);
                }
            }
            let weight = if self.config.preserved.contains(reg) && !self.regs[index].assigned_in_function {
                INITIAL_PRESERVED_WEIGHT
            } else {
                match associated {
                    None => TM::RegisterFilePolicy::base_weight(reg),
                    Some(vreg) if vregs[vreg].placeholder => PLACEHOLDER_WEIGHT,
                    Some(_) => ASSOCIATED_WEIGHT,
                }
            };
            self.regs[index].weight = weight;
        }
    }

    /// Asserts that every assigned register and its owner point at each other.
    pub fn verify(&self, vregs: &VRegs<TM>) {
        for real in &self.regs {
            match real.state {
                RegState::Assigned | RegState::Blocked => {
                    let owner = real
                        .owner
                        .unwrap_or_else(|| panic!("{} is {} without an owner", real.reg.name(), real.state));
                    assert_eq!(
                        vregs[owner].assigned,
                        Some(real.reg),
                        "{} is owned by {} which is assigned to {:?}",
                        real.reg.name(),
                        vregs[owner],
                        vregs[owner].assigned.map(|reg| reg.name())
                    );
                    assert!(vregs[owner].live, "{} owns {} but is dead", vregs[owner], real.reg.name());
                }
                RegState::Free => {
                    assert!(real.owner.is_none(), "Free register {} has an owner", real.reg.name());
                }
                RegState::Unlatched | RegState::Locked => {}
            }
        }
        for (vreg_ref, vreg) in vregs {
            let Some(reg) = vreg.assigned else {
                continue;
            };
            let real = self.get(reg);
            if real.state == RegState::Locked {
                continue;
            }
            assert_eq!(
                real.owner,
                Some(vreg_ref),
                "{vreg} is assigned to {} which is owned by {:?}",
                reg.name(),
                real.owner
            );
            assert!(
                matches!(real.state, RegState::Assigned | RegState::Blocked),
                "{vreg} is assigned to {} which is {}",
                reg.name(),
                real.state
            );
        }
    }

    pub fn trace_state(&self, vregs: &VRegs<TM>) {
        trace!("{}", RegisterFileDisplay { file: self, vregs });
    }
}

struct RegisterFileDisplay<'a, TM: TargetMachine> {
    file: &'a RegisterFile<TM>,
    vregs: &'a VRegs<TM>,
}

impl<TM: TargetMachine> Display for RegisterFileDisplay<'_, TM> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        for real in self.file.iter().filter(|real| real.owner.is_some()) {
            let Some(owner) = real.owner else {
                continue;
            };
            write!(f, "{}={}({}) ", real.reg.name(), self.vregs[owner], real.state)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codegen::{
        machine::{
            Function,
            RegClass,
            Size,
        },
        targets::s390x::{
            PhysicalRegister as Reg,
            Target,
        },
    };

    fn file() -> RegisterFile<Target> {
        RegisterFile::new(RegisterFileConfig::for_target::<Target>())
    }

    #[test]
    fn should_lock_linkage_registers() {
        let file = file();
        for reg in [Reg::GPR13, Reg::GPR14, Reg::GPR15] {
            assert_eq!(file.state(reg), RegState::Locked, "{} should be locked", reg.name());
        }
        assert_eq!(file.state(Reg::GPR0), RegState::Free);
    }

    #[test]
    fn should_keep_links_symmetric() {
        let mut file = file();
        let mut func = Function::<Target>::new("f".into());
        let v = func.alloc_vreg(RegClass::Gpr, Size::QWord);
        file.bind(Reg::GPR3, v, &mut func.vregs);
        assert_eq!(file.owner(Reg::GPR3), Some(v));
        assert_eq!(func.vregs[v].assigned(), Some(Reg::GPR3));
        file.verify(&func.vregs);
        file.unbind(Reg::GPR3, &mut func.vregs);
        assert_eq!(func.vregs[v].assigned(), None);
        assert_eq!(file.state(Reg::GPR3), RegState::Free);
        file.verify(&func.vregs);
    }

    #[test]
    fn should_prefer_lower_weights_and_avoid_interference() {
        let mut file = file();
        let gprs = RegMask::from_regs([Reg::GPR1, Reg::GPR2, Reg::GPR3]);
        file.set_weight(Reg::GPR1, ASSOCIATED_WEIGHT);
        assert_eq!(file.best_weight(gprs, RegMask::EMPTY), Some(Reg::GPR2));
        let interference = RegMask::from_regs([Reg::GPR2]);
        assert_eq!(file.best_weight(gprs, interference), Some(Reg::GPR3));
        let only_interfering = RegMask::from_regs([Reg::GPR2]);
        assert_eq!(file.best_weight(only_interfering, interference), Some(Reg::GPR2));
        assert_eq!(file.best_weight(RegMask::from_regs([Reg::GPR15]), RegMask::EMPTY), None);
    }

    #[test]
    fn should_not_hand_out_registers_overlapping_occupied_ones() {
        let mut file = file();
        let mut func = Function::<Target>::new("f".into());
        let v = func.alloc_vreg(RegClass::Fpr, Size::QWord);
        file.bind(Reg::FPR4, v, &mut func.vregs);
        assert!(!file.is_claimable(Reg::VRF4));
        assert!(file.is_claimable(Reg::VRF20));
        let mask = RegMask::from_regs([Reg::VRF4, Reg::VRF20]);
        file.set_weight(Reg::VRF20, HEAVIEST_WEIGHT);
        assert_eq!(file.best_weight(mask, RegMask::EMPTY), Some(Reg::VRF20));
    }

    #[test]
    fn should_weigh_registers_by_association() {
        let mut file = file();
        let mut func = Function::<Target>::new("f".into());
        let v = func.alloc_vreg(RegClass::Gpr, Size::QWord);
        let placeholder = func.alloc_placeholder(RegClass::Gpr, Size::QWord);
        file.set_association(Reg::GPR2, Some(v));
        file.set_association(Reg::GPR3, Some(placeholder));
        file.set_weights_from_associations(&mut func.vregs);
        assert_eq!(file.weight(Reg::GPR1), BASIC_WEIGHT);
        assert_eq!(file.weight(Reg::GPR2), ASSOCIATED_WEIGHT);
        assert_eq!(file.weight(Reg::GPR3), PLACEHOLDER_WEIGHT);
        assert_eq!(file.weight(Reg::GPR8), INITIAL_PRESERVED_WEIGHT);
        assert_eq!(file.weight(Reg::VRF1), LOW_PRIORITY_WEIGHT);
        assert_eq!(func.vregs[v].association, Association::Real(Reg::GPR2));
    }

    #[test]
    fn should_release_unlatched_registers() {
        let mut file = file();
        let mut func = Function::<Target>::new("f".into());
        let v = func.alloc_vreg(RegClass::Gpr, Size::QWord);
        file.bind(Reg::GPR4, v, &mut func.vregs);
        file.bind(Reg::GPR5, v, &mut func.vregs);
        file.unlatch(Reg::GPR4);
        assert!(file.is_free(Reg::GPR4));
        file.free_unlatched();
        assert_eq!(file.owner(Reg::GPR4), None);
        file.verify(&func.vregs);
    }
}
