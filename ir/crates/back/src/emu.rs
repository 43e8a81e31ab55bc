//! Checks register assignment by running the original and the rewritten function side by side.
//!
//! Values are not computed. Every definition of a virtual register creates a fresh tag and
//! every read of a virtual register checks that the real register it was rewritten to holds
//! the latest tag of that virtual.

use anyhow::{
    anyhow,
    bail,
    ensure,
    Result,
};
use rustc_hash::{
    FxHashMap,
    FxHashSet,
};
use tracing::{
    debug,
    trace,
};

use crate::codegen::machine::{
    abi::{
        calling_convention::Slot,
        CallingConvention,
    },
    backing_store::SlotId,
    instr::{
        Access,
        InstrOperand,
        MemRef,
        PseudoInstr,
        SectionId,
    },
    DependencyConditions,
    Function,
    Instr,
    InstrId,
    InstrStream,
    PhysicalRegister,
    Register,
    Requirement,
    TargetMachine,
    VRegRef,
};

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
struct Tag {
    vreg: VRegRef,
    version: u32,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum Location<R> {
    Reg(R),
    Slot(SlotId),
}

pub struct Emulator<'func, TM: TargetMachine> {
    original: &'func Function<TM>,
    assigned: &'func Function<TM>,
    regs: FxHashMap<TM::Reg, Tag>,
    slots: FxHashMap<SlotId, Tag>,
    versions: FxHashMap<VRegRef, u32>,
    cold_paths: FxHashSet<SectionId>,
    executed: usize,
}

impl<'func, TM: TargetMachine> Emulator<'func, TM> {
    pub fn new(original: &'func Function<TM>, assigned: &'func Function<TM>) -> Self {
        Self {
            original,
            assigned,
            regs: FxHashMap::default(),
            slots: FxHashMap::default(),
            versions: FxHashMap::default(),
            cold_paths: FxHashSet::default(),
            executed: 0,
        }
    }

    /// Branches into the cold stream of `section` instead of falling through to the hot path.
    #[must_use]
    pub fn take_cold_path(mut self, section: SectionId) -> Self {
        self.cold_paths.insert(section);
        self
    }

    /// Number of instructions executed, synthesized ones included.
    pub const fn executed(&self) -> usize {
        self.executed
    }

    pub fn run(&mut self) -> Result<()> {
        let (original, assigned) = (self.original, self.assigned);
        debug!("Emulating {}", original.name);
        let params = &original.params;
        let slots = TM::CallingConvention::parameter_slots(params.iter().map(|param| {
            let param = &original.vregs[*param];
            (param.class, param.size)
        }))
        .collect::<Vec<_>>();
        for (param, slot) in params.iter().copied().zip(slots) {
            if let Slot::Register(reg) = slot {
                self.define(param, reg);
            }
        }
        self.run_stream(&original.body, &assigned.body)
    }

    fn run_stream(&mut self, original: &InstrStream<TM>, assigned: &InstrStream<TM>) -> Result<()> {
        let mut original_ids = original
            .instructions
            .indices()
            .filter(|id| !matches!(original.instructions[*id], Instr::Pseudo(PseudoInstr::Assoc(_))));
        let mut assigned_id = assigned.instructions.indices().next();
        while let Some(id) = assigned_id {
            let instr = &assigned.instructions[id];
            assigned_id = next_index(assigned, id);
            self.executed += 1;
            if assigned.is_synthesized(id) {
                self.execute_synthesized(instr)?;
                continue;
            }
            let original_id = original_ids
                .next()
                .ok_or_else(|| anyhow!("{} has no counterpart in the original", instr.name()))?;
            let original_instr = &original.instructions[original_id];
            ensure!(
                original_instr.name() == instr.name(),
                "Expected {} but found {}",
                original_instr.name(),
                instr.name()
            );
            self.execute(original_instr, instr, original.conditions.get(&original_id))?;
            match original_instr {
                Instr::Pseudo(PseudoInstr::BranchToCold(section)) if self.cold_paths.contains(section) => {
                    let (original_fn, assigned_fn) = (self.original, self.assigned);
                    self.run_stream(
                        &original_fn.sections[*section].cold,
                        &assigned_fn.sections[*section].cold,
                    )?;
                    let merge = Instr::Pseudo(PseudoInstr::MergePoint(*section));
                    for original_id in original_ids.by_ref() {
                        if original.instructions[original_id] == merge {
                            break;
                        }
                    }
                    let merge_id = assigned
                        .instructions
                        .iter_enumerated()
                        .find(|(_, instr)| **instr == merge)
                        .map(|(id, _)| id)
                        .ok_or_else(|| anyhow!("{section} has no merge point"))?;
                    assigned_id = next_index(assigned, merge_id);
                }
                Instr::Pseudo(PseudoInstr::ReturnToMerge(_) | PseudoInstr::Ret(_)) => return Ok(()),
                _ => {}
            }
        }
        ensure!(
            original_ids.next().is_none(),
            "The rewritten stream ended early"
        );
        Ok(())
    }

    fn execute(
        &mut self,
        original: &Instr<TM>,
        assigned: &Instr<TM>,
        conditions: Option<&DependencyConditions<TM>>,
    ) -> Result<()> {
        trace!("Executing {}", assigned.name());
        if let Some(conditions) = conditions {
            for dependency in &conditions.pre {
                if let Requirement::Fixed(reg) = dependency.requirement {
                    self.check(dependency.vreg, reg)?;
                }
            }
        }
        let mut defined = Vec::new();
        for (original_operand, assigned_operand) in original.operands().iter().zip(assigned.operands().iter()) {
            let access = match original_operand {
                InstrOperand::Reg(_, access) | InstrOperand::Pair(_, access) => *access,
                InstrOperand::Mem(_) => Access::Read,
                InstrOperand::Imm(_) | InstrOperand::Label(_) => continue,
            };
            for (original_reg, assigned_reg) in original_operand
                .registers()
                .into_iter()
                .zip(assigned_operand.registers())
            {
                let Register::Physical(reg) = assigned_reg else {
                    bail!("{} still refers to a virtual register", assigned.name());
                };
                match original_reg {
                    Register::Virtual(vreg) => {
                        if access.reads() {
                            self.check(vreg, reg)?;
                        }
                        if access.writes() {
                            defined.push((vreg, reg));
                        }
                    }
                    Register::Physical(expected) => ensure!(
                        expected == reg,
                        "{} was rewritten to {}",
                        expected.name(),
                        reg.name()
                    ),
                }
            }
        }
        if let Some(conditions) = conditions {
            for dependency in &conditions.post {
                let Requirement::Fixed(reg) = dependency.requirement else {
                    continue;
                };
                if self.original.vregs[dependency.vreg].placeholder {
                    self.regs.remove(&reg);
                } else if !defined.iter().any(|(vreg, _)| *vreg == dependency.vreg) {
                    defined.push((dependency.vreg, reg));
                }
            }
        }
        for (vreg, reg) in defined {
            self.define(vreg, reg);
        }
        Ok(())
    }

    /// Moves a tag from the one location the instruction reads to the one it writes.
    fn execute_synthesized(&mut self, instr: &Instr<TM>) -> Result<()> {
        let mut source = None;
        let mut dest = None;
        for operand in instr.operands() {
            match operand {
                InstrOperand::Reg(Register::Physical(reg), access) if access.writes() => {
                    dest = Some(Location::Reg(reg));
                }
                InstrOperand::Reg(Register::Physical(reg), _) => source = Some(Location::Reg(reg)),
                InstrOperand::Mem(MemRef::Spill(slot)) => {
                    if dest.is_none() && source.is_none() {
                        // Stores list the slot first.
                        dest = Some(Location::Slot(slot.id));
                    } else {
                        source = Some(Location::Slot(slot.id));
                    }
                }
                _ => bail!("{} is not a copy, load or store", instr.name()),
            }
        }
        let (Some(source), Some(dest)) = (source, dest) else {
            bail!("{} does not move a value", instr.name());
        };
        let tag = match source {
            Location::Reg(reg) => self.regs.get(&reg).copied(),
            Location::Slot(slot) => self.slots.get(&slot).copied(),
        };
        trace!("Moving {tag:?} from {source:?} to {dest:?}");
        match (dest, tag) {
            (Location::Reg(reg), Some(tag)) => {
                self.regs.insert(reg, tag);
            }
            (Location::Reg(reg), None) => {
                self.regs.remove(&reg);
            }
            (Location::Slot(slot), Some(tag)) => {
                self.slots.insert(slot, tag);
            }
            (Location::Slot(slot), None) => {
                self.slots.remove(&slot);
            }
        }
        Ok(())
    }

    fn define(&mut self, vreg: VRegRef, reg: TM::Reg) {
        let version = self.versions.entry(vreg).or_default();
        *version += 1;
        let tag = Tag {
            vreg,
            version: *version,
        };
        if let Some(overlap) = reg.overlaps() {
            self.regs.remove(&overlap);
        }
        self.regs.insert(reg, tag);
    }

    fn check(&self, vreg: VRegRef, reg: TM::Reg) -> Result<()> {
        let Some(version) = self.versions.get(&vreg).copied() else {
            // Reads of values that were never defined carry no information.
            return Ok(());
        };
        let expected = Tag { vreg, version };
        let found = self.regs.get(&reg).copied();
        ensure!(
            found == Some(expected),
            "{} should hold {} version {} but holds {:?}",
            reg.name(),
            self.original.vregs[vreg],
            version,
            found.map(|tag| (self.original.vregs[tag.vreg].to_string(), tag.version))
        );
        Ok(())
    }
}

fn next_index<TM: TargetMachine>(stream: &InstrStream<TM>, id: InstrId) -> Option<InstrId> {
    let next = id + 1;
    (next.index() < stream.len()).then_some(next)
}
