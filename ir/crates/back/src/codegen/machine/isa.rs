use std::{
    fmt::{
        Debug,
        Display,
        Formatter,
    },
    hash::Hash,
    ops::{
        BitAnd,
        BitOr,
        Not,
    },
};

use smallvec::SmallVec;

use crate::codegen::machine::{
    instr::{
        InstrOperand,
        InstrOperandMut,
    },
    RegClass,
    Size,
    TargetMachine,
};

pub trait PhysicalRegister: Debug + Clone + Copy + PartialEq + Eq + Hash + Sized + 'static {
    fn name(&self) -> &'static str;

    /// All registers of the register file, ordered by [`PhysicalRegister::index`].
    fn all() -> &'static [Self];

    fn class(&self) -> RegClass;

    /// Position of the register in the register file. Must be below 64.
    fn index(&self) -> usize;

    /// Ordinal number of the register within its class.
    fn number(&self) -> u8;

    fn size(&self) -> Size;

    /// The register of another class that shares storage with this one.
    ///
    /// E.g. on z/Architecture, FPR3 is the leftmost doubleword of VRF3.
    fn overlaps(&self) -> Option<Self>;

    fn from_index(index: usize) -> Option<Self> {
        Self::all().get(index).copied()
    }

    fn mask(&self) -> RegMask {
        RegMask::of(self.index())
    }

    fn interferes_with(self, other: Self) -> bool {
        self == other || self.overlaps() == Some(other)
    }
}

/// A set of registers of the register file, one bit per [`PhysicalRegister::index`].
#[derive(Copy, Clone, Default, PartialEq, Eq, Hash)]
pub struct RegMask(u64);

impl RegMask {
    pub const EMPTY: Self = Self(0);
    pub const ALL: Self = Self(u64::MAX);

    pub const fn of(index: usize) -> Self {
        Self(1 << index)
    }

    pub fn from_regs<R: PhysicalRegister>(regs: impl IntoIterator<Item = R>) -> Self {
        regs.into_iter().fold(Self::EMPTY, |mask, reg| mask | reg.mask())
    }

    pub fn of_class<R: PhysicalRegister>(class: RegClass) -> Self {
        Self::from_regs(R::all().iter().copied().filter(|reg| reg.class() == class))
    }

    pub const fn bits(self) -> u64 {
        self.0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn contains<R: PhysicalRegister>(self, reg: R) -> bool {
        self.0 & reg.mask().0 != 0
    }

    pub fn insert<R: PhysicalRegister>(&mut self, reg: R) {
        self.0 |= reg.mask().0;
    }

    pub fn remove<R: PhysicalRegister>(&mut self, reg: R) {
        self.0 &= !reg.mask().0;
    }

    pub const fn len(self) -> u32 {
        self.0.count_ones()
    }

    /// Iterates the registers in the mask in register file order.
    pub fn iter<R: PhysicalRegister>(self) -> impl Iterator<Item = R> {
        R::all()
            .iter()
            .copied()
            .filter(move |reg| self.contains(*reg))
    }
}

impl BitOr for RegMask {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self::Output {
        Self(self.0 | rhs.0)
    }
}

impl BitAnd for RegMask {
    type Output = Self;

    fn bitand(self, rhs: Self) -> Self::Output {
        Self(self.0 & rhs.0)
    }
}

impl Not for RegMask {
    type Output = Self;

    fn not(self) -> Self::Output {
        Self(!self.0)
    }
}

impl Debug for RegMask {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "RegMask({:#018x})", self.0)
    }
}

impl Display for RegMask {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

pub trait MachInstr: Debug + PartialEq + Eq + Clone {
    type TM: TargetMachine;

    fn name(&self) -> &'static str;

    /// The operands of the instruction. Targets come before sources.
    fn operands(&self) -> SmallVec<[InstrOperand<Self::TM>; 3]>;

    fn operands_mut(&mut self) -> SmallVec<[InstrOperandMut<'_, Self::TM>; 3]>;
}
