use crate::codegen::{
    machine::{
        abi::{
            calling_convention::Slot,
            CallingConvention,
        },
        RegClass,
        Size,
    },
    targets::s390x::PhysicalRegister,
};

/// The 64 bit ELF linkage of z/Architecture.
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub struct ElfLinkage;

const GPR_PARAMETERS: [PhysicalRegister; 5] = [
    PhysicalRegister::GPR2,
    PhysicalRegister::GPR3,
    PhysicalRegister::GPR4,
    PhysicalRegister::GPR5,
    PhysicalRegister::GPR6,
];

const FPR_PARAMETERS: [PhysicalRegister; 4] = [
    PhysicalRegister::FPR0,
    PhysicalRegister::FPR2,
    PhysicalRegister::FPR4,
    PhysicalRegister::FPR6,
];

const VRF_PARAMETERS: [PhysicalRegister; 8] = [
    PhysicalRegister::VRF24,
    PhysicalRegister::VRF25,
    PhysicalRegister::VRF26,
    PhysicalRegister::VRF27,
    PhysicalRegister::VRF28,
    PhysicalRegister::VRF29,
    PhysicalRegister::VRF30,
    PhysicalRegister::VRF31,
];

impl CallingConvention for ElfLinkage {
    type Reg = PhysicalRegister;

    fn parameter_slots(
        params: impl Iterator<Item = (RegClass, Size)>,
    ) -> impl Iterator<Item = Slot<Self::Reg>> {
        let mut used = [0usize; 3];
        params.map(move |(class, _)| {
            let (available, used): (&[PhysicalRegister], &mut usize) = match class {
                RegClass::Gpr => (GPR_PARAMETERS.as_slice(), &mut used[0]),
                RegClass::Fpr => (FPR_PARAMETERS.as_slice(), &mut used[1]),
                RegClass::Vrf => (VRF_PARAMETERS.as_slice(), &mut used[2]),
            };
            match available.get(*used) {
                Some(reg) => {
                    *used += 1;
                    Slot::Register(*reg)
                }
                None => Slot::Stack,
            }
        })
    }

    fn return_slot(class: RegClass, _size: Size) -> Slot<Self::Reg> {
        match class {
            RegClass::Gpr => Slot::Register(PhysicalRegister::GPR2),
            RegClass::Fpr => Slot::Register(PhysicalRegister::FPR0),
            RegClass::Vrf => Slot::Register(PhysicalRegister::VRF24),
        }
    }

    fn preserved_registers() -> &'static [Self::Reg] {
        &[
            PhysicalRegister::GPR6,
            PhysicalRegister::GPR7,
            PhysicalRegister::GPR8,
            PhysicalRegister::GPR9,
            PhysicalRegister::GPR10,
            PhysicalRegister::GPR11,
            PhysicalRegister::GPR12,
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

    /// Literal pool base, return address and stack pointer.
    fn locked_registers() -> &'static [Self::Reg] {
        &[
            PhysicalRegister::GPR13,
            PhysicalRegister::GPR14,
            PhysicalRegister::GPR15,
        ]
    }

    fn volatile_registers() -> &'static [Self::Reg] {
        &[
            PhysicalRegister::GPR0,
            PhysicalRegister::GPR1,
            PhysicalRegister::GPR2,
            PhysicalRegister::GPR3,
            PhysicalRegister::GPR4,
            PhysicalRegister::GPR5,
            PhysicalRegister::FPR0,
            PhysicalRegister::FPR1,
            PhysicalRegister::FPR2,
            PhysicalRegister::FPR3,
            PhysicalRegister::FPR4,
            PhysicalRegister::FPR5,
            PhysicalRegister::FPR6,
            PhysicalRegister::FPR7,
        ]
    }
}
