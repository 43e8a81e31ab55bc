use std::fmt::Debug;

pub use backend::Backend;
pub use backing_store::{
    BackingStore,
    SpillSlot,
    StackFrame,
};
pub use dependency::{
    Dependency,
    DependencyConditions,
    Requirement,
};
pub use function::{
    Function,
    InstrStream,
    OutOfLineSection,
};
pub use instr::{
    Instr,
    InstrId,
    LabelId,
    SectionId,
};
pub use isa::{
    MachInstr,
    PhysicalRegister,
    RegMask,
};
pub use reg::{
    Association,
    RegPair,
    Register,
    VReg,
    VRegRef,
};

use crate::codegen::{
    machine::abi::CallingConvention,
    register_allocator::{
        PairLegality,
        RegisterFilePolicy,
    },
};

pub mod abi;
pub mod backend;
pub mod backing_store;
pub mod dependency;
pub mod function;
pub mod instr;
pub mod isa;
pub mod reg;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Display)]
pub enum Size {
    Byte,
    Word,
    DWord,
    QWord,
    OWord,
}

impl Size {
    pub fn from_bit_width(bit_width: u32) -> Self {
        if bit_width <= 8 {
            Self::Byte
        } else if bit_width <= 16 {
            Self::Word
        } else if bit_width <= 32 {
            Self::DWord
        } else if bit_width <= 64 {
            Self::QWord
        } else if bit_width <= 128 {
            Self::OWord
        } else {
            panic!("Invalid bit width: {}", bit_width)
        }
    }

    pub const fn bit_width(&self) -> u32 {
        match self {
            Self::Byte => 8,
            Self::Word => 16,
            Self::DWord => 32,
            Self::QWord => 64,
            Self::OWord => 128,
        }
    }

    pub const fn bytes(&self) -> u32 {
        self.bit_width() / 8
    }
}

impl PartialOrd for Size {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        self.bit_width().partial_cmp(&other.bit_width())
    }
}

/// The register kinds of the register file.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Display, IntoStaticStr, VariantArray)]
pub enum RegClass {
    Gpr,
    Fpr,
    Vrf,
}

impl RegClass {
    pub fn all() -> &'static [Self] {
        <Self as strum::VariantArray>::VARIANTS
    }
}

pub trait TargetMachine: Debug + Default + Copy + Clone + PartialEq + Eq + 'static {
    type Reg: PhysicalRegister;

    type Instr: MachInstr<TM = Self>;

    type CallingConvention: CallingConvention<Reg = Self::Reg>;

    type Backend: Backend<TM = Self>;

    type RegisterFilePolicy: RegisterFilePolicy<Reg = Self::Reg>;

    type PairLegality: PairLegality<Reg = Self::Reg>;
}
