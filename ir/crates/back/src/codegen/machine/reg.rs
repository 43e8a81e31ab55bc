use std::fmt::{
    Display,
    Formatter,
};

use slotmap::new_key_type;

use crate::codegen::machine::{
    backing_store::BackingSlot,
    function::Function,
    isa::{
        PhysicalRegister,
        RegMask,
    },
    RegClass,
    Size,
    TargetMachine,
};

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Register<TM: TargetMachine> {
    Virtual(VRegRef),
    Physical(TM::Reg),
}

impl<TM: TargetMachine> From<VRegRef> for Register<TM> {
    fn from(vreg: VRegRef) -> Self {
        Self::Virtual(vreg)
    }
}

impl<TM: TargetMachine> Register<TM> {
    pub const fn try_as_virtual(&self) -> Option<VRegRef> {
        match self {
            Self::Virtual(virt_reg) => Some(*virt_reg),
            Self::Physical(_) => None,
        }
    }

    pub const fn try_as_physical(&self) -> Option<TM::Reg> {
        match self {
            Self::Virtual(_) => None,
            Self::Physical(phys_reg) => Some(*phys_reg),
        }
    }

    pub fn display<'func>(&self, func: &'func Function<TM>) -> RegisterDisplay<'func, TM> {
        RegisterDisplay { func, reg: *self }
    }
}

pub struct RegisterDisplay<'func, TM: TargetMachine> {
    func: &'func Function<TM>,
    reg: Register<TM>,
}

impl<TM: TargetMachine> Display for RegisterDisplay<'_, TM> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self.reg {
            Register::Virtual(virt_reg) => write!(f, "{}", self.func.vregs[virt_reg]),
            Register::Physical(phys_reg) => write!(f, "%{}", phys_reg.name()),
        }
    }
}

/// Two registers that have to be assigned to a hardware pair.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct RegPair<TM: TargetMachine> {
    pub high: Register<TM>,
    pub low: Register<TM>,
}

impl<TM: TargetMachine> RegPair<TM> {
    pub const fn new(high: Register<TM>, low: Register<TM>) -> Self {
        Self { high, low }
    }
}

new_key_type! {
    pub struct VRegRef;
}

/// Where a virtual register would like to end up.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default)]
pub enum Association<R> {
    #[default]
    None,
    Real(R),
    /// Even register of a general purpose pair, or the first register of a floating point pair.
    FirstOfPair,
    /// Odd register of a general purpose pair, or the second register of a floating point pair.
    SecondOfPair,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct VReg<TM: TargetMachine> {
    pub class: RegClass,
    pub size: Size,
    pub symbol: String,
    pub association: Association<TM::Reg>,
    /// The other half, if this register is part of a declared pair.
    pub sibling: Option<VRegRef>,
    /// Registers that are about to be needed by someone else.
    pub interference: RegMask,
    /// Stands in for a register killed at a dependency site, e.g. a volatile register at a call.
    pub placeholder: bool,
    pub(crate) used_in_mem_ref: bool,
    pub(crate) live: bool,
    pub(crate) assigned: Option<TM::Reg>,
    pub(crate) total_uses: u32,
    pub(crate) future_uses: u32,
    pub(crate) backing_store: Option<BackingSlot>,
}

impl<TM: TargetMachine> VReg<TM> {
    pub fn new(class: RegClass, size: Size, symbol: String) -> Self {
        Self {
            class,
            size,
            symbol,
            association: Association::None,
            sibling: None,
            interference: RegMask::EMPTY,
            placeholder: false,
            used_in_mem_ref: false,
            live: false,
            assigned: None,
            total_uses: 0,
            future_uses: 0,
            backing_store: None,
        }
    }

    pub const fn assigned(&self) -> Option<TM::Reg> {
        self.assigned
    }

    pub const fn is_live(&self) -> bool {
        self.live
    }

    pub const fn total_uses(&self) -> u32 {
        self.total_uses
    }

    pub const fn future_uses(&self) -> u32 {
        self.future_uses
    }

    pub const fn is_used_in_mem_ref(&self) -> bool {
        self.used_in_mem_ref
    }

    pub const fn backing_store(&self) -> Option<BackingSlot> {
        self.backing_store
    }

    /// The value has been assigned before in this pass and lives in memory right now.
    pub const fn is_spilled(&self) -> bool {
        self.assigned.is_none() && self.future_uses != self.total_uses
    }
}

impl<TM: TargetMachine> Display for VReg<TM> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.symbol)
    }
}
