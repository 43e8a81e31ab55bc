use smallvec::SmallVec;

use crate::codegen::machine::{
    PhysicalRegister,
    RegClass,
    RegMask,
};

/// Target rules for handing out registers.
pub trait RegisterFilePolicy {
    type Reg: PhysicalRegister;

    /// Registers a virtual register of `class` may ever be assigned to.
    fn assignable(class: RegClass) -> RegMask;

    /// Registers that can be the base of a storage operand.
    fn memory_base_registers() -> RegMask;

    fn is_assignable(reg: Self::Reg, used_in_mem_ref: bool) -> bool {
        !used_in_mem_ref || Self::memory_base_registers().contains(reg)
    }

    /// Weight of a register nobody is associated with.
    fn base_weight(reg: Self::Reg) -> u32;

    /// Maps global register numbers of the code generator to real registers.
    fn global_register_table() -> &'static [Self::Reg];
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum PairRole {
    First,
    Second,
}

impl PairRole {
    pub const fn other(self) -> Self {
        match self {
            Self::First => Self::Second,
            Self::Second => Self::First,
        }
    }
}

/// Which registers form hardware pairs.
pub trait PairLegality {
    type Reg: PhysicalRegister;

    fn supports_pairs(class: RegClass) -> bool;

    /// The register can hold the high half of a pair.
    fn is_first(reg: Self::Reg) -> bool;

    /// The register can hold the low half of a pair.
    fn is_second(reg: Self::Reg) -> bool;

    /// The other register of the pair `reg` belongs to.
    fn sibling(reg: Self::Reg) -> Option<Self::Reg>;

    fn has_role(reg: Self::Reg, role: PairRole) -> bool {
        match role {
            PairRole::First => Self::is_first(reg),
            PairRole::Second => Self::is_second(reg),
        }
    }

    fn is_legal_pair(high: Self::Reg, low: Self::Reg) -> bool {
        Self::is_first(high) && Self::sibling(high) == Some(low)
    }

    /// All legal `(high, low)` pairs of `class` in register file order.
    fn legal_pairs(class: RegClass) -> SmallVec<[(Self::Reg, Self::Reg); 16]> {
        Self::Reg::all()
            .iter()
            .copied()
            .filter(|reg| reg.class() == class && Self::is_first(*reg))
            .filter_map(|high| Self::sibling(high).map(|low| (high, low)))
            .collect()
    }
}
