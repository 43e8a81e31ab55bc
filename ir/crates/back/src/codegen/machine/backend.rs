use crate::codegen::machine::{
    backing_store::SpillSlot,
    RegClass,
    Size,
    TargetMachine,
};

type Reg<B> = <<B as Backend>::TM as TargetMachine>::Reg;
type BackInstr<B> = <<B as Backend>::TM as TargetMachine>::Instr;

/// Creates the instructions the register assigner has to insert.
pub trait Backend {
    type TM: TargetMachine;

    /// Copies `src` into `dest`.
    fn copy(class: RegClass, size: Size, dest: Reg<Self>, src: Reg<Self>) -> BackInstr<Self>;

    /// Loads `dest` from a spill slot.
    fn spill_load(class: RegClass, size: Size, dest: Reg<Self>, slot: SpillSlot) -> BackInstr<Self>;

    /// Stores `src` into a spill slot.
    fn spill_store(class: RegClass, size: Size, src: Reg<Self>, slot: SpillSlot) -> BackInstr<Self>;
}
