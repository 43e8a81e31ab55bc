use std::fmt::{
    Display,
    Formatter,
};

use iter_tools::Itertools;
use smallvec::{
    smallvec,
    SmallVec,
};

use crate::codegen::machine::{
    backing_store::SpillSlot,
    function::Function,
    isa::MachInstr as MInstr,
    reg::{
        RegPair,
        Register,
        VRegRef,
    },
    PhysicalRegister,
    TargetMachine,
};

index_vec::define_index_type! {
    pub struct InstrId = u32;

    DISPLAY_FORMAT = "instr{}";
}

index_vec::define_index_type! {
    pub struct LabelId = u32;

    DISPLAY_FORMAT = "L{}";
}

index_vec::define_index_type! {
    pub struct SectionId = u32;

    DISPLAY_FORMAT = "ool{}";
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Instr<TM: TargetMachine> {
    Pseudo(PseudoInstr<TM>),
    Machine(TM::Instr),
}

impl<TM: TargetMachine> Instr<TM> {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Pseudo(pseudo) => pseudo.name(),
            Self::Machine(machine) => machine.name(),
        }
    }

    pub fn operands(&self) -> SmallVec<[InstrOperand<TM>; 3]> {
        match self {
            Self::Pseudo(pseudo) => pseudo.operands(),
            Self::Machine(machine) => machine.operands(),
        }
    }

    pub fn operands_mut(&mut self) -> SmallVec<[InstrOperandMut<'_, TM>; 3]> {
        match self {
            Self::Pseudo(pseudo) => pseudo.operands_mut(),
            Self::Machine(machine) => machine.operands_mut(),
        }
    }

    /// Every virtual register the operands of this instruction refer to, once per reference.
    pub fn virtual_refs(&self) -> SmallVec<[VRegRef; 3]> {
        self.operands()
            .iter()
            .flat_map(InstrOperand::registers)
            .filter_map(|reg| reg.try_as_virtual())
            .collect()
    }

    pub fn references(&self, vreg: VRegRef) -> bool {
        self.virtual_refs().contains(&vreg)
    }

    pub const fn is_label(&self) -> bool {
        matches!(
            self,
            Self::Pseudo(PseudoInstr::Label(_) | PseudoInstr::MergePoint(_))
        )
    }

    pub const fn try_as_machine(&self) -> Option<&TM::Instr> {
        match self {
            Self::Pseudo(_) => None,
            Self::Machine(machine) => Some(machine),
        }
    }

    pub fn display<'func>(&'func self, func: &'func Function<TM>) -> InstrDisplay<'func, TM> {
        InstrDisplay { func, instr: self }
    }
}

pub struct InstrDisplay<'func, TM: TargetMachine> {
    func: &'func Function<TM>,
    instr: &'func Instr<TM>,
}

impl<TM: TargetMachine> Display for InstrDisplay<'_, TM> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.instr.name())?;
        let operands = self.instr.operands();
        if !operands.is_empty() {
            write!(
                f,
                " {}",
                operands
                    .iter()
                    .map(|operand| operand.display(self.func).to_string())
                    .join(", ")
            )?;
        }
        Ok(())
    }
}

/// How an instruction accesses a register operand.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Access {
    Read,
    Write,
    ReadWrite,
}

impl Access {
    pub const fn reads(self) -> bool {
        matches!(self, Self::Read | Self::ReadWrite)
    }

    pub const fn writes(self) -> bool {
        matches!(self, Self::Write | Self::ReadWrite)
    }
}

/// A storage operand.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum MemRef<TM: TargetMachine> {
    /// Displacement off a base register. The base register can never be GPR0.
    BaseDisp { base: Register<TM>, disp: i32 },
    Spill(SpillSlot),
}

impl<TM: TargetMachine> MemRef<TM> {
    pub const fn base(&self) -> Option<Register<TM>> {
        match self {
            Self::BaseDisp { base, .. } => Some(*base),
            Self::Spill(_) => None,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum InstrOperand<TM: TargetMachine> {
    Reg(Register<TM>, Access),
    Pair(RegPair<TM>, Access),
    Mem(MemRef<TM>),
    Imm(i64),
    Label(LabelId),
}

impl<TM: TargetMachine> InstrOperand<TM> {
    pub fn registers(&self) -> SmallVec<[Register<TM>; 2]> {
        match self {
            Self::Reg(reg, _) => smallvec![*reg],
            Self::Pair(pair, _) => smallvec![pair.high, pair.low],
            Self::Mem(mem) => mem.base().into_iter().collect(),
            Self::Imm(_) | Self::Label(_) => SmallVec::new(),
        }
    }

    pub fn display<'func>(&self, func: &'func Function<TM>) -> InstrOperandDisplay<'func, TM> {
        InstrOperandDisplay {
            func,
            operand: *self,
        }
    }
}

pub struct InstrOperandDisplay<'func, TM: TargetMachine> {
    func: &'func Function<TM>,
    operand: InstrOperand<TM>,
}

impl<TM: TargetMachine> Display for InstrOperandDisplay<'_, TM> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self.operand {
            InstrOperand::Reg(reg, _) => write!(f, "{}", reg.display(self.func)),
            InstrOperand::Pair(pair, _) => write!(
                f,
                "{}:{}",
                pair.high.display(self.func),
                pair.low.display(self.func)
            ),
            InstrOperand::Mem(MemRef::BaseDisp { base, disp }) => {
                write!(f, "{disp}({})", base.display(self.func))
            }
            InstrOperand::Mem(MemRef::Spill(slot)) => write!(f, "{slot}"),
            InstrOperand::Imm(imm) => write!(f, "{imm}"),
            InstrOperand::Label(label) => write!(f, "{label}"),
        }
    }
}

#[derive(Debug)]
pub enum InstrOperandMut<'a, TM: TargetMachine> {
    Reg(&'a mut Register<TM>, Access),
    Pair(&'a mut RegPair<TM>, Access),
    Mem(&'a mut MemRef<TM>),
    Imm(&'a mut i64),
    Label(&'a mut LabelId),
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum PseudoInstr<TM: TargetMachine> {
    Label(LabelId),
    Ret(Option<Register<TM>>),
    /// Sets which virtual register each listed real register is associated with.
    Assoc(SmallVec<[(TM::Reg, Option<VRegRef>); 4]>),
    /// Mainline branch into the cold stream of an out of line section.
    BranchToCold(SectionId),
    /// Mainline label where the hot path and the cold stream of a section join.
    MergePoint(SectionId),
    /// Last instruction of a cold stream, branching back to the merge point.
    ReturnToMerge(SectionId),
}

impl<TM: TargetMachine> PseudoInstr<TM> {
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Label(_) => "LABEL",
            Self::Ret(_) => "RET",
            Self::Assoc(_) => "ASSOC",
            Self::BranchToCold(_) => "BRCOLD",
            Self::MergePoint(_) => "MERGE",
            Self::ReturnToMerge(_) => "BRMERGE",
        }
    }

    pub fn operands(&self) -> SmallVec<[InstrOperand<TM>; 3]> {
        match self {
            Self::Label(label) => smallvec![InstrOperand::Label(*label)],
            Self::Ret(value) => value
                .iter()
                .map(|reg| InstrOperand::Reg(*reg, Access::Read))
                .collect(),
            Self::Assoc(_)
            | Self::BranchToCold(_)
            | Self::MergePoint(_)
            | Self::ReturnToMerge(_) => SmallVec::new(),
        }
    }

    pub fn operands_mut(&mut self) -> SmallVec<[InstrOperandMut<'_, TM>; 3]> {
        match self {
            Self::Label(label) => smallvec![InstrOperandMut::Label(label)],
            Self::Ret(value) => value
                .iter_mut()
                .map(|reg| InstrOperandMut::Reg(reg, Access::Read))
                .collect(),
            Self::Assoc(_)
            | Self::BranchToCold(_)
            | Self::MergePoint(_)
            | Self::ReturnToMerge(_) => SmallVec::new(),
        }
    }
}

impl<TM: TargetMachine> Display for PseudoInstr<TM> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Label(label) => write!(f, "{label}:"),
            Self::Ret(_) => write!(f, "RET"),
            Self::Assoc(associations) => write!(
                f,
                "ASSOC {}",
                associations
                    .iter()
                    .map(|(reg, vreg)| format!("{}={vreg:?}", reg.name()))
                    .join(", ")
            ),
            Self::BranchToCold(section) => write!(f, "BRCOLD {section}"),
            Self::MergePoint(section) => write!(f, "MERGE {section}:"),
            Self::ReturnToMerge(section) => write!(f, "BRMERGE {section}"),
        }
    }
}
