use crate::codegen::machine::{
    isa::PhysicalRegister,
    RegClass,
    Size,
};

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Slot<R: PhysicalRegister> {
    Register(R),
    Stack,
}

/// The linkage a function is compiled for.
pub trait CallingConvention {
    type Reg: PhysicalRegister;

    fn parameter_slots(
        params: impl Iterator<Item = (RegClass, Size)>,
    ) -> impl Iterator<Item = Slot<Self::Reg>>;

    fn return_slot(class: RegClass, size: Size) -> Slot<Self::Reg>;

    /// Registers a callee has to restore before returning.
    fn preserved_registers() -> &'static [Self::Reg];

    /// Registers reserved for the whole function, e.g. the stack pointer.
    fn locked_registers() -> &'static [Self::Reg];

    /// Registers a call clobbers.
    fn volatile_registers() -> &'static [Self::Reg];

    fn is_preserved(reg: Self::Reg) -> bool {
        Self::preserved_registers().contains(&reg)
    }
}
