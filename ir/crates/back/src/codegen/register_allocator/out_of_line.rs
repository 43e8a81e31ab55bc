use smallvec::SmallVec;
use tracing::{
    debug,
    info,
};

use crate::codegen::{
    machine::{
        backing_store::{
            BackingSlot,
            BackingStore,
            SpillDepth,
        },
        dependency::{
            Dependency,
            Requirement,
        },
        instr::SectionId,
        Backend,
        RegMask,
        TargetMachine,
    },
    register_allocator::{
        register_file::RegState,
        AllocError,
        PathPhase,
        RegisterAssigner,
        Walk,
    },
};

impl<TM: TargetMachine, BS: BackingStore> RegisterAssigner<'_, '_, TM, BS> {
    /// Remembers the registers at the merge point; everything up to the branch is the hot path.
    pub(super) fn enter_hot_path(&mut self, section: SectionId) {
        assert_eq!(
            self.phase,
            PathPhase::Mainline,
            "Out of line sections do not nest"
        );
        debug!("Entering the hot path of {section}");
        self.phase = PathPhase::Hot;
        self.snapshots.insert(section, self.file.snapshot());
    }

    /// Assigns the cold stream of `section`, starting from the registers at its merge point.
    pub(super) fn assign_cold_stream(&mut self, section: SectionId) -> Result<(), AllocError> {
        let entry_conditions = self.entry_conditions();
        let snapshot = self
            .snapshots
            .remove(&section)
            .unwrap_or_else(|| panic!("{section} is branched to before its merge point"));
        let entry = self.func.sections[section].entry;
        let cold = self.func.sections[section].cold.clone();
        info!("Assigning registers for the cold stream of {section}");
        self.file.restore(&snapshot, &mut self.func.vregs);
        self.phase = PathPhase::Cold;
        self.cold_entry = Some((entry, entry_conditions));
        self.walks.push(Walk::new(cold));
        self.walk()?;
        // The stream did not start with its entry label.
        self.reconcile_cold_entry()?;
        let cold = self.finish_walk();
        self.assigned_sections.insert(section, cold);
        self.phase = PathPhase::Mainline;
        self.file.free_unlatched();
        Ok(())
    }

    /// Where the hot path expects every value to be right at the branch.
    fn entry_conditions(&self) -> SmallVec<[Dependency<TM>; 16]> {
        let in_registers = self.file.iter().filter_map(|real| match (real.state, real.owner) {
            (RegState::Assigned | RegState::Blocked, Some(owner)) => Some(Dependency::fixed(owner, real.reg)),
            _ => None,
        });
        let in_memory = self
            .spilled
            .iter()
            .copied()
            .filter(|vreg| {
                let vreg = &self.func.vregs[*vreg];
                vreg.assigned.is_none() && vreg.backing_store.is_some()
            })
            .map(|vreg| Dependency::new(vreg, Requirement::Spilled));
        in_registers.chain(in_memory).collect()
    }

    /// Moves the values from where the cold stream has them to where the hot path expects them.
    ///
    /// Nothing is booked as a reference here.
    pub(super) fn reconcile_cold_entry(&mut self) -> Result<(), AllocError> {
        let Some((entry, conditions)) = self.cold_entry.take() else {
            return Ok(());
        };
        debug!("Reconciling registers at {entry}");
        self.at_cold_entry = true;
        let result = self.apply_entry_conditions(&conditions);
        self.at_cold_entry = false;
        self.file.unblock_all();
        self.pinned = RegMask::EMPTY;
        result
    }

    fn apply_entry_conditions(&mut self, conditions: &[Dependency<TM>]) -> Result<(), AllocError> {
        let still_needed = |this: &Self, dependency: &Dependency<TM>| this.func.vregs[dependency.vreg].future_uses > 0;
        for dependency in conditions {
            if dependency.requirement != Requirement::Spilled || !still_needed(self, dependency) {
                continue;
            }
            let vreg = &self.func.vregs[dependency.vreg];
            let Some(reg) = vreg.assigned else {
                continue;
            };
            let backing = vreg
                .backing_store
                .unwrap_or_else(|| panic!("{vreg} is spilled on the hot path without a slot"));
            let (class, size) = (vreg.class, vreg.size);
            self.emit_fixup(TM::Backend::spill_load(class, size, reg, backing.slot));
            self.file.unbind(reg, &mut self.func.vregs);
            self.func.vregs[dependency.vreg].backing_store = Some(BackingSlot {
                depth: SpillDepth::Mainline,
                ..backing
            });
        }
        for dependency in conditions {
            let Requirement::Fixed(reg) = dependency.requirement else {
                continue;
            };
            if !still_needed(self, dependency) {
                continue;
            }
            let vreg = &mut self.func.vregs[dependency.vreg];
            if vreg.assigned.is_some() {
                if let Some(backing) = vreg.backing_store.take() {
                    self.store.release_slot(backing.slot);
                }
            }
            if self.func.vregs[dependency.vreg].assigned == Some(reg) {
                self.pin(reg);
            }
        }
        for dependency in conditions {
            let Requirement::Fixed(reg) = dependency.requirement else {
                continue;
            };
            if !still_needed(self, dependency) || self.func.vregs[dependency.vreg].assigned == Some(reg) {
                continue;
            }
            self.coerce(dependency.vreg, reg)?;
            self.pin(reg);
        }
        Ok(())
    }
}
