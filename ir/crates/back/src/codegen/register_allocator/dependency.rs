use tracing::debug;

use crate::codegen::{
    machine::{
        backing_store::BackingStore,
        dependency::{
            Dependency,
            Requirement,
        },
        PhysicalRegister,
        TargetMachine,
    },
    register_allocator::{
        AllocError,
        RegisterAssigner,
    },
};

impl<TM: TargetMachine, BS: BackingStore> RegisterAssigner<'_, '_, TM, BS> {
    /// Establishes one side of the dependency conditions of the current instruction.
    ///
    /// Registers that satisfy a condition stay pinned until the instruction is done.
    pub(super) fn assign_dependencies(&mut self, dependencies: &[Dependency<TM>]) -> Result<(), AllocError> {
        if dependencies.is_empty() {
            return Ok(());
        }
        for dependency in dependencies {
            if let Requirement::Fixed(reg) = dependency.requirement {
                if self.func.vregs[dependency.vreg].assigned == Some(reg) {
                    self.pin(reg);
                }
            }
        }
        for dependency in dependencies {
            if let Requirement::Fixed(reg) = dependency.requirement {
                if self.func.vregs[dependency.vreg].assigned != Some(reg) {
                    self.coerce(dependency.vreg, reg)?;
                    self.pin(reg);
                }
            }
        }
        for dependency in dependencies {
            if dependency.requirement != Requirement::AnyReg {
                continue;
            }
            let reg = match self.func.vregs[dependency.vreg].assigned {
                Some(reg) => reg,
                None => {
                    let mask = self.operand_mask(dependency.vreg, false);
                    if self.func.vregs[dependency.vreg].is_spilled() {
                        self.reverse_spill(dependency.vreg, mask)?
                    } else {
                        let reg = self.find_or_free_register(dependency.vreg, mask)?;
                        self.file
                            .bind(reg, dependency.vreg, &mut self.func.vregs);
                        reg
                    }
                }
            };
            self.pin(reg);
        }
        for dependency in dependencies {
            if dependency.requirement != Requirement::Spilled {
                continue;
            }
            if let Some(reg) = self.func.vregs[dependency.vreg].assigned {
                debug!(
                    "{} has to be in memory, moving it out of {}",
                    self.func.vregs[dependency.vreg],
                    reg.name()
                );
                self.spill(dependency.vreg);
            }
        }
        for dependency in dependencies {
            self.consume_use(dependency.vreg);
        }
        Ok(())
    }
}
