use tracing::debug;

use crate::codegen::{
    machine::{
        PhysicalRegister,
        TargetMachine,
        VRegRef,
    },
    register_allocator::register_file::{
        RegState,
        RegisterFile,
        VRegs,
    },
};

#[derive(Debug, Clone, PartialEq, Eq)]
struct RegisterSnapshot {
    state: RegState,
    owner: Option<VRegRef>,
    weight: u32,
    association: Option<VRegRef>,
    assigned_in_function: bool,
}

/// The register file as it was at a merge point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterFileSnapshot {
    regs: Vec<RegisterSnapshot>,
}

impl<TM: TargetMachine> RegisterFile<TM> {
    pub fn snapshot(&self) -> RegisterFileSnapshot {
        RegisterFileSnapshot {
            regs: self
                .regs
                .iter()
                .zip(&self.associations)
                .map(|(real, association)| RegisterSnapshot {
                    state: real.state,
                    owner: real.owner,
                    weight: real.weight,
                    association: *association,
                    assigned_in_function: real.assigned_in_function,
                })
                .collect(),
        }
    }

    /// Puts every register back the way `snapshot` saw it and relinks the owners.
    ///
    /// Owners that died since the snapshot was taken are dropped instead.
    pub fn restore(&mut self, snapshot: &RegisterFileSnapshot, vregs: &mut VRegs<TM>) {
        assert_eq!(self.regs.len(), snapshot.regs.len());
        for (real, saved) in self.regs.iter().zip(&snapshot.regs) {
            let Some(owner) = real.owner else {
                continue;
            };
            if saved.owner != Some(owner) && vregs[owner].assigned == Some(real.reg) {
                vregs[owner].assigned = None;
            }
        }
        for ((real, association), saved) in self
            .regs
            .iter_mut()
            .zip(self.associations.iter_mut())
            .zip(&snapshot.regs)
        {
            real.state = saved.state;
            real.owner = saved.owner;
            real.weight = saved.weight;
            real.assigned_in_function |= saved.assigned_in_function;
            *association = saved.association;
            if !matches!(saved.state, RegState::Assigned | RegState::Blocked) {
                continue;
            }
            let owner = saved
                .owner
                .unwrap_or_else(|| panic!("{} was {} without an owner", real.reg.name(), saved.state));
            if vregs[owner].future_uses == 0 {
                debug!("Dropping {} from {} since it is dead", vregs[owner], real.reg.name());
                real.owner = None;
                real.state = RegState::Free;
                if vregs[owner].assigned == Some(real.reg) {
                    vregs[owner].assigned = None;
                }
            } else {
                vregs[owner].assigned = Some(real.reg);
                vregs[owner].live = true;
            }
        }
    }
}
