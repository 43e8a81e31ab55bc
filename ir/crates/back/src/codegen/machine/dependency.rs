use smallvec::SmallVec;

use crate::codegen::machine::{
    reg::VRegRef,
    TargetMachine,
};

/// Where a virtual register has to be at a dependency site.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Requirement<TM: TargetMachine> {
    Fixed(TM::Reg),
    AnyReg,
    /// The value has to live in its spill slot.
    Spilled,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct Dependency<TM: TargetMachine> {
    pub vreg: VRegRef,
    pub requirement: Requirement<TM>,
}

impl<TM: TargetMachine> Dependency<TM> {
    pub const fn new(vreg: VRegRef, requirement: Requirement<TM>) -> Self {
        Self { vreg, requirement }
    }

    pub const fn fixed(vreg: VRegRef, reg: TM::Reg) -> Self {
        Self::new(vreg, Requirement::Fixed(reg))
    }
}

/// Register requirements attached to an instruction.
///
/// Pre conditions hold right before the instruction executes, post conditions right after it.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DependencyConditions<TM: TargetMachine> {
    pub pre: SmallVec<[Dependency<TM>; 4]>,
    pub post: SmallVec<[Dependency<TM>; 4]>,
}

impl<TM: TargetMachine> DependencyConditions<TM> {
    pub fn new() -> Self {
        Self {
            pre: SmallVec::new(),
            post: SmallVec::new(),
        }
    }

    pub fn add_pre_condition(&mut self, vreg: VRegRef, requirement: Requirement<TM>) {
        self.pre.push(Dependency::new(vreg, requirement));
    }

    pub fn add_post_condition(&mut self, vreg: VRegRef, requirement: Requirement<TM>) {
        self.post.push(Dependency::new(vreg, requirement));
    }

    pub fn references(&self, vreg: VRegRef) -> bool {
        self.pre
            .iter()
            .chain(self.post.iter())
            .any(|dependency| dependency.vreg == vreg)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Dependency<TM>> {
        self.pre.iter().chain(self.post.iter())
    }
}
