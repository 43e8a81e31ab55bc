use smallvec::{
    smallvec,
    SmallVec,
};
use strum::VariantArray;

pub use linkage::ElfLinkage;

use crate::codegen::{
    machine,
    machine::{
        backend,
        backing_store::SpillSlot,
        instr::{
            Access,
            InstrOperand,
            InstrOperandMut,
            LabelId,
            MemRef,
        },
        isa::PhysicalRegister as MachPhysicalRegister,
        RegClass,
        RegMask,
        Size,
        TargetMachine,
    },
    register_allocator::{
        register_file::{
            BASIC_WEIGHT,
            LOW_PRIORITY_WEIGHT,
        },
        PairLegality,
        RegisterFilePolicy,
    },
};

mod linkage;

#[derive(Debug, Default, Copy, Clone, Eq, PartialEq, Hash)]
pub struct Target;

impl TargetMachine for Target {
    type Reg = PhysicalRegister;
    type Instr = Instr;
    type CallingConvention = ElfLinkage;
    type Backend = Backend;
    type RegisterFilePolicy = RegisterPolicy;
    type PairLegality = PairPolicy;
}

pub type Register = machine::Register<Target>;
pub type RegPair = machine::RegPair<Target>;
pub type Mem = MemRef<Target>;

#[derive(Debug, Clone, PartialEq, Eq, IntoStaticStr)]
pub enum Instr {
    /// 32 bit register copy.
    LR { dest: Register, src: Register },
    LGR { dest: Register, src: Register },
    LDR { dest: Register, src: Register },
    VLR { dest: Register, src: Register },
    LHI { dest: Register, imm: i64 },
    LGHI { dest: Register, imm: i64 },
    CHI { lhs: Register, imm: i64 },
    CGHI { lhs: Register, imm: i64 },
    AR { dest: Register, src: Register },
    AGR { dest: Register, src: Register },
    SR { dest: Register, src: Register },
    L { dest: Register, mem: Mem },
    LG { dest: Register, mem: Mem },
    ST { src: Register, mem: Mem },
    STG { src: Register, mem: Mem },
    LD { dest: Register, mem: Mem },
    STD { src: Register, mem: Mem },
    VL { dest: Register, mem: Mem },
    VST { src: Register, mem: Mem },
    /// Multiplies the odd register of the pair, the product spans both.
    MR { pair: RegPair, src: Register },
    /// Divides the pair, remainder ends up in the even register and quotient in the odd one.
    DR { pair: RegPair, src: Register },
    ADBR { dest: Register, src: Register },
    /// Extended precision add on floating point register pairs.
    AXBR { dest: RegPair, src: RegPair },
    VA { dest: Register, lhs: Register, rhs: Register },
    BRASL { callee: &'static str },
    BRC { mask: u8, target: LabelId },
}

impl machine::isa::MachInstr for Instr {
    type TM = Target;

    fn name(&self) -> &'static str {
        self.into()
    }

    fn operands(&self) -> SmallVec<[InstrOperand<Self::TM>; 3]> {
        match self {
            Self::LR { dest, src }
            | Self::LGR { dest, src }
            | Self::LDR { dest, src }
            | Self::VLR { dest, src } => smallvec![
                InstrOperand::Reg(*dest, Access::Write),
                InstrOperand::Reg(*src, Access::Read)
            ],
            Self::LHI { dest, imm } | Self::LGHI { dest, imm } => {
                smallvec![InstrOperand::Reg(*dest, Access::Write), InstrOperand::Imm(*imm)]
            }
            Self::CHI { lhs, imm } | Self::CGHI { lhs, imm } => {
                smallvec![InstrOperand::Reg(*lhs, Access::Read), InstrOperand::Imm(*imm)]
            }
            Self::AR { dest, src }
            | Self::AGR { dest, src }
            | Self::SR { dest, src }
            | Self::ADBR { dest, src } => smallvec![
                InstrOperand::Reg(*dest, Access::ReadWrite),
                InstrOperand::Reg(*src, Access::Read)
            ],
            Self::L { dest, mem }
            | Self::LG { dest, mem }
            | Self::LD { dest, mem }
            | Self::VL { dest, mem } => {
                smallvec![InstrOperand::Reg(*dest, Access::Write), InstrOperand::Mem(*mem)]
            }
            Self::ST { src, mem }
            | Self::STG { src, mem }
            | Self::STD { src, mem }
            | Self::VST { src, mem } => {
                smallvec![InstrOperand::Mem(*mem), InstrOperand::Reg(*src, Access::Read)]
            }
            Self::MR { pair, src } | Self::DR { pair, src } => smallvec![
                InstrOperand::Pair(*pair, Access::ReadWrite),
                InstrOperand::Reg(*src, Access::Read)
            ],
            Self::AXBR { dest, src } => smallvec![
                InstrOperand::Pair(*dest, Access::ReadWrite),
                InstrOperand::Pair(*src, Access::Read)
            ],
            Self::VA { dest, lhs, rhs } => smallvec![
                InstrOperand::Reg(*dest, Access::Write),
                InstrOperand::Reg(*lhs, Access::Read),
                InstrOperand::Reg(*rhs, Access::Read)
            ],
            Self::BRASL { .. } => smallvec![],
            Self::BRC { target, .. } => smallvec![InstrOperand::Label(*target)],
        }
    }

    fn operands_mut(&mut self) -> SmallVec<[InstrOperandMut<'_, Self::TM>; 3]> {
        match self {
            Self::LR { dest, src }
            | Self::LGR { dest, src }
            | Self::LDR { dest, src }
            | Self::VLR { dest, src } => smallvec![
                InstrOperandMut::Reg(dest, Access::Write),
                InstrOperandMut::Reg(src, Access::Read)
            ],
            Self::LHI { dest, imm } | Self::LGHI { dest, imm } => {
                smallvec![InstrOperandMut::Reg(dest, Access::Write), InstrOperandMut::Imm(imm)]
            }
            Self::CHI { lhs, imm } | Self::CGHI { lhs, imm } => {
                smallvec![InstrOperandMut::Reg(lhs, Access::Read), InstrOperandMut::Imm(imm)]
            }
            Self::AR { dest, src }
            | Self::AGR { dest, src }
            | Self::SR { dest, src }
            | Self::ADBR { dest, src } => smallvec![
                InstrOperandMut::Reg(dest, Access::ReadWrite),
                InstrOperandMut::Reg(src, Access::Read)
            ],
            Self::L { dest, mem }
            | Self::LG { dest, mem }
            | Self::LD { dest, mem }
            | Self::VL { dest, mem } => {
                smallvec![InstrOperandMut::Reg(dest, Access::Write), InstrOperandMut::Mem(mem)]
            }
            Self::ST { src, mem }
            | Self::STG { src, mem }
            | Self::STD { src, mem }
            | Self::VST { src, mem } => {
                smallvec![InstrOperandMut::Mem(mem), InstrOperandMut::Reg(src, Access::Read)]
            }
            Self::MR { pair, src } | Self::DR { pair, src } => smallvec![
                InstrOperandMut::Pair(pair, Access::ReadWrite),
                InstrOperandMut::Reg(src, Access::Read)
            ],
            Self::AXBR { dest, src } => smallvec![
                InstrOperandMut::Pair(dest, Access::ReadWrite),
                InstrOperandMut::Pair(src, Access::Read)
            ],
            Self::VA { dest, lhs, rhs } => smallvec![
                InstrOperandMut::Reg(dest, Access::Write),
                InstrOperandMut::Reg(lhs, Access::Read),
                InstrOperandMut::Reg(rhs, Access::Read)
            ],
            Self::BRASL { .. } => smallvec![],
            Self::BRC { target, .. } => smallvec![InstrOperandMut::Label(target)],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoStaticStr, VariantArray, Hash)]
pub enum PhysicalRegister {
    GPR0,
    GPR1,
    GPR2,
    GPR3,
    GPR4,
    GPR5,
    GPR6,
    GPR7,
    GPR8,
    GPR9,
    GPR10,
    GPR11,
    GPR12,
    GPR13,
    GPR14,
    GPR15,
    FPR0,
    FPR1,
    FPR2,
    FPR3,
    FPR4,
    FPR5,
    FPR6,
    FPR7,
    FPR8,
    FPR9,
    FPR10,
    FPR11,
    FPR12,
    FPR13,
    FPR14,
    FPR15,
    VRF0,
    VRF1,
    VRF2,
    VRF3,
    VRF4,
    VRF5,
    VRF6,
    VRF7,
    VRF8,
    VRF9,
    VRF10,
    VRF11,
    VRF12,
    VRF13,
    VRF14,
    VRF15,
    VRF16,
    VRF17,
    VRF18,
    VRF19,
    VRF20,
    VRF21,
    VRF22,
    VRF23,
    VRF24,
    VRF25,
    VRF26,
    VRF27,
    VRF28,
    VRF29,
    VRF30,
    VRF31,
}

const FIRST_FPR: usize = PhysicalRegister::FPR0 as usize;
const FIRST_VRF: usize = PhysicalRegister::VRF0 as usize;

impl MachPhysicalRegister for PhysicalRegister {
    fn name(&self) -> &'static str {
        self.into()
    }

    fn all() -> &'static [Self] {
        Self::VARIANTS
    }

    fn class(&self) -> RegClass {
        match self.index() {
            index if index < FIRST_FPR => RegClass::Gpr,
            index if index < FIRST_VRF => RegClass::Fpr,
            _ => RegClass::Vrf,
        }
    }

    fn index(&self) -> usize {
        *self as usize
    }

    #[allow(clippy::cast_possible_truncation)]
    fn number(&self) -> u8 {
        let base = match self.class() {
            RegClass::Gpr => 0,
            RegClass::Fpr => FIRST_FPR,
            RegClass::Vrf => FIRST_VRF,
        };
        (self.index() - base) as u8
    }

    fn size(&self) -> Size {
        match self.class() {
            RegClass::Gpr | RegClass::Fpr => Size::QWord,
            RegClass::Vrf => Size::OWord,
        }
    }

    fn overlaps(&self) -> Option<Self> {
        let number = usize::from(self.number());
        match self.class() {
            RegClass::Gpr => None,
            RegClass::Fpr => Self::from_index(FIRST_VRF + number),
            RegClass::Vrf if number < 16 => Self::from_index(FIRST_FPR + number),
            RegClass::Vrf => None,
        }
    }
}

#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub struct Backend;

impl backend::Backend for Backend {
    type TM = Target;

    fn copy(class: RegClass, size: Size, dest: PhysicalRegister, src: PhysicalRegister) -> Instr {
        let (dest, src) = (Register::Physical(dest), Register::Physical(src));
        match class {
            RegClass::Gpr if size <= Size::DWord => Instr::LR { dest, src },
            RegClass::Gpr => Instr::LGR { dest, src },
            RegClass::Fpr => Instr::LDR { dest, src },
            RegClass::Vrf => Instr::VLR { dest, src },
        }
    }

    fn spill_load(class: RegClass, size: Size, dest: PhysicalRegister, slot: SpillSlot) -> Instr {
        let (dest, mem) = (Register::Physical(dest), MemRef::Spill(slot));
        match class {
            RegClass::Gpr if size <= Size::DWord => Instr::L { dest, mem },
            RegClass::Gpr => Instr::LG { dest, mem },
            RegClass::Fpr => Instr::LD { dest, mem },
            RegClass::Vrf => Instr::VL { dest, mem },
        }
    }

    fn spill_store(class: RegClass, size: Size, src: PhysicalRegister, slot: SpillSlot) -> Instr {
        let (src, mem) = (Register::Physical(src), MemRef::Spill(slot));
        match class {
            RegClass::Gpr if size <= Size::DWord => Instr::ST { src, mem },
            RegClass::Gpr => Instr::STG { src, mem },
            RegClass::Fpr => Instr::STD { src, mem },
            RegClass::Vrf => Instr::VST { src, mem },
        }
    }
}

#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub struct RegisterPolicy;

impl RegisterFilePolicy for RegisterPolicy {
    type Reg = PhysicalRegister;

    fn assignable(class: RegClass) -> RegMask {
        RegMask::of_class::<PhysicalRegister>(class)
    }

    /// GPR0 reads as zero when used as a base register.
    fn memory_base_registers() -> RegMask {
        let mut mask = RegMask::of_class::<PhysicalRegister>(RegClass::Gpr);
        mask.remove(PhysicalRegister::GPR0);
        mask
    }

    fn base_weight(reg: PhysicalRegister) -> u32 {
        // The low vector registers share their storage with the floating point registers.
        if reg.class() == RegClass::Vrf && reg.number() < 16 {
            LOW_PRIORITY_WEIGHT
        } else {
            BASIC_WEIGHT
        }
    }

    fn global_register_table() -> &'static [PhysicalRegister] {
        &[
            PhysicalRegister::GPR1,
            PhysicalRegister::GPR2,
            PhysicalRegister::GPR3,
            PhysicalRegister::GPR4,
            PhysicalRegister::GPR5,
            PhysicalRegister::GPR0,
            PhysicalRegister::GPR6,
            PhysicalRegister::GPR7,
            PhysicalRegister::GPR8,
            PhysicalRegister::GPR9,
            PhysicalRegister::GPR10,
            PhysicalRegister::GPR11,
            PhysicalRegister::GPR12,
            PhysicalRegister::FPR0,
            PhysicalRegister::FPR1,
            PhysicalRegister::FPR2,
            PhysicalRegister::FPR3,
            PhysicalRegister::FPR4,
            PhysicalRegister::FPR5,
            PhysicalRegister::FPR6,
            PhysicalRegister::FPR7,
            PhysicalRegister::FPR8,
            PhysicalRegister::FPR9,
            PhysicalRegister::FPR10,
            PhysicalRegister::FPR11,
            PhysicalRegister::FPR12,
            PhysicalRegister::FPR13,
            PhysicalRegister::FPR14,
            PhysicalRegister::FPR15,
        ]
    }
}

/// Even/odd general purpose pairs and floating point pairs that are two registers apart.
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub struct PairPolicy;

impl PairLegality for PairPolicy {
    type Reg = PhysicalRegister;

    fn supports_pairs(class: RegClass) -> bool {
        matches!(class, RegClass::Gpr | RegClass::Fpr)
    }

    fn is_first(reg: PhysicalRegister) -> bool {
        match reg.class() {
            RegClass::Gpr => reg.number() % 2 == 0,
            RegClass::Fpr => reg.number() % 4 < 2,
            RegClass::Vrf => false,
        }
    }

    fn is_second(reg: PhysicalRegister) -> bool {
        match reg.class() {
            RegClass::Gpr => reg.number() % 2 == 1,
            RegClass::Fpr => reg.number() % 4 >= 2,
            RegClass::Vrf => false,
        }
    }

    fn sibling(reg: PhysicalRegister) -> Option<PhysicalRegister> {
        let index = reg.index();
        match reg.class() {
            RegClass::Gpr if Self::is_first(reg) => PhysicalRegister::from_index(index + 1),
            RegClass::Gpr => PhysicalRegister::from_index(index - 1),
            RegClass::Fpr if Self::is_first(reg) => PhysicalRegister::from_index(index + 2),
            RegClass::Fpr => PhysicalRegister::from_index(index - 2),
            RegClass::Vrf => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn should_overlap_floating_point_and_low_vector_registers() {
        assert_eq!(PhysicalRegister::FPR5.overlaps(), Some(PhysicalRegister::VRF5));
        assert_eq!(PhysicalRegister::VRF15.overlaps(), Some(PhysicalRegister::FPR15));
        assert_eq!(PhysicalRegister::VRF16.overlaps(), None);
        assert_eq!(PhysicalRegister::GPR5.overlaps(), None);
        assert_eq!(PhysicalRegister::VRF31.index(), 63);
        assert_eq!(PhysicalRegister::FPR9.number(), 9);
    }

    #[test]
    fn should_form_legal_pairs() {
        let gpr_pairs = PairPolicy::legal_pairs(RegClass::Gpr);
        assert_eq!(gpr_pairs.len(), 8);
        assert!(PairPolicy::is_legal_pair(PhysicalRegister::GPR2, PhysicalRegister::GPR3));
        assert!(!PairPolicy::is_legal_pair(PhysicalRegister::GPR3, PhysicalRegister::GPR4));
        let fpr_pairs = PairPolicy::legal_pairs(RegClass::Fpr);
        assert_eq!(
            fpr_pairs.iter().map(|(high, _)| high.number()).collect::<Vec<_>>(),
            vec![0, 1, 4, 5, 8, 9, 12, 13]
        );
        assert!(PairPolicy::is_legal_pair(PhysicalRegister::FPR1, PhysicalRegister::FPR3));
        assert!(!PairPolicy::is_legal_pair(PhysicalRegister::FPR2, PhysicalRegister::FPR4));
        assert!(PairPolicy::legal_pairs(RegClass::Vrf).is_empty());
    }

    #[test]
    fn should_pick_copy_and_spill_instructions_by_class() {
        let slot = SpillSlot {
            id: machine::backing_store::SlotId::new(0),
            bytes: 8,
        };
        let copy = <Backend as backend::Backend>::copy(
            RegClass::Gpr,
            Size::DWord,
            PhysicalRegister::GPR1,
            PhysicalRegister::GPR2,
        );
        assert_eq!(
            copy,
            Instr::LR {
                dest: Register::Physical(PhysicalRegister::GPR1),
                src: Register::Physical(PhysicalRegister::GPR2),
            }
        );
        let load = <Backend as backend::Backend>::spill_load(
            RegClass::Fpr,
            Size::QWord,
            PhysicalRegister::FPR1,
            slot,
        );
        assert!(matches!(load, Instr::LD { .. }));
        let store = <Backend as backend::Backend>::spill_store(
            RegClass::Vrf,
            Size::OWord,
            PhysicalRegister::VRF17,
            slot,
        );
        assert!(matches!(store, Instr::VST { .. }));
        assert!(!RegisterPolicy::memory_base_registers().contains(PhysicalRegister::GPR0));
    }
}
