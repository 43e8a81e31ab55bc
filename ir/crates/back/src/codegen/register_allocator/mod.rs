use std::hash::BuildHasherDefault;

use index_vec::IndexVec;
use indexmap::IndexSet;
use iter_tools::Itertools;
pub use policy::{
    PairLegality,
    PairRole,
    RegisterFilePolicy,
};
pub use register_file::{
    RealRegister,
    RegState,
    RegisterFile,
    RegisterFileConfig,
};
use rustc_hash::{
    FxHashMap,
    FxHashSet,
    FxHasher,
};
use smallvec::SmallVec;
pub use snapshot::RegisterFileSnapshot;
use thiserror::Error;
use tracing::{
    debug,
    info,
};

use crate::codegen::machine::{
    abi::{
        calling_convention::Slot,
        CallingConvention,
    },
    backing_store::BackingStore,
    dependency::{
        Dependency,
        DependencyConditions,
        Requirement,
    },
    function::InstrStream,
    instr::{
        Access,
        InstrOperand,
        InstrOperandMut,
        MemRef,
        PseudoInstr,
        SectionId,
    },
    reg::RegPair,
    Function,
    Instr,
    InstrId,
    LabelId,
    PhysicalRegister,
    RegClass,
    RegMask,
    Register,
    TargetMachine,
    VRegRef,
};

mod coerce;
mod dependency;
mod out_of_line;
mod pair;
mod policy;
pub mod register_file;
mod single;
mod snapshot;
mod spill;

type FxIndexSet<T> = IndexSet<T, BuildHasherDefault<FxHasher>>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AllocError {
    #[error("no {class} register left to assign {vreg} under mask {mask}")]
    OutOfRegisters {
        vreg: String,
        class: RegClass,
        mask: RegMask,
    },
    #[error("cannot move {occupant} out of {reg} to make room for {vreg}")]
    IrrecoverableCoercion {
        vreg: String,
        occupant: String,
        reg: &'static str,
    },
    #[error("{class} registers do not form pairs")]
    IllegalPairClass { class: RegClass },
    #[error("no legal {class} pair left under mask {mask}")]
    NoLegalPair { class: RegClass, mask: RegMask },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AssignerConfig {
    /// Steer the halves of declared pairs towards legal pair registers when they are first assigned.
    pub enable_pair_association: bool,
    /// How many upcoming instructions victim selection looks at before it gives up on ties.
    pub victim_lookahead: usize,
    /// Check the register file invariants after every instruction, even in release builds.
    pub verify: bool,
}

impl Default for AssignerConfig {
    fn default() -> Self {
        Self {
            enable_pair_association: true,
            victim_lookahead: 8,
            verify: false,
        }
    }
}

impl AssignerConfig {
    pub fn verifying() -> Self {
        Self {
            verify: true,
            ..Self::default()
        }
    }
}

/// Which instruction stream of an out of line section the walk is in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum PathPhase {
    Mainline,
    Hot,
    Cold,
}

/// One instruction stream being walked backwards.
#[derive(Debug)]
struct Walk<TM: TargetMachine> {
    pending: IndexVec<InstrId, Instr<TM>>,
    conditions: FxHashMap<InstrId, DependencyConditions<TM>>,
    /// Finished instructions in reverse program order, flagged if synthesized.
    emitted: Vec<(Instr<TM>, bool)>,
    /// Instructions to place right after the current one, in reverse program order.
    fixups: Vec<Instr<TM>>,
}

impl<TM: TargetMachine> Walk<TM> {
    fn new(stream: InstrStream<TM>) -> Self {
        Self {
            pending: stream.instructions,
            conditions: stream.conditions,
            emitted: Vec::new(),
            fixups: Vec::new(),
        }
    }

    fn next(&mut self) -> Option<(Instr<TM>, Option<DependencyConditions<TM>>)> {
        let instr = self.pending.pop()?;
        let conditions = self.conditions.remove(&self.pending.next_idx());
        Some((instr, conditions))
    }

    fn finish(mut self) -> InstrStream<TM> {
        self.emitted
            .extend(self.fixups.drain(..).map(|fixup| (fixup, true)));
        let mut stream = InstrStream::default();
        for (instr, synthesized) in self.emitted.into_iter().rev() {
            let id = stream.push(instr);
            if synthesized {
                stream.synthesized.insert(id);
            }
        }
        stream
    }
}

/// Assigns real registers to the virtual registers of a function.
///
/// Walks the instructions in reverse program order. A virtual register becomes live at its
/// last use and dies at its definition. The use counts tell whether a virtual that is not
/// in a register has never been seen yet or has been spilled further down the stream.
pub struct RegisterAssigner<'func, 'store, TM: TargetMachine, BS: BackingStore> {
    func: &'func mut Function<TM>,
    store: &'store mut BS,
    config: AssignerConfig,
    file: RegisterFile<TM>,
    phase: PathPhase,
    /// Virtuals spilled outside of cold streams that have not been reverse spilled yet.
    spilled: FxIndexSet<VRegRef>,
    snapshots: FxHashMap<SectionId, RegisterFileSnapshot>,
    cold_entry: Option<(LabelId, SmallVec<[Dependency<TM>; 16]>)>,
    at_cold_entry: bool,
    assigned_sections: FxHashMap<SectionId, InstrStream<TM>>,
    walks: Vec<Walk<TM>>,
    /// Registers that operands of the current instruction have been rewritten to.
    pinned: RegMask,
    /// Registers the current instruction overwrites through its post conditions.
    clobbered: RegMask,
    /// Virtuals whose earliest reference is the current instruction, retired once all of its operands are placed.
    dying: Option<SmallVec<[VRegRef; 4]>>,
}

impl<'func, 'store, TM: TargetMachine, BS: BackingStore> RegisterAssigner<'func, 'store, TM, BS> {
    pub fn new(func: &'func mut Function<TM>, store: &'store mut BS) -> Self {
        Self::with_config(
            func,
            store,
            AssignerConfig::default(),
            RegisterFileConfig::for_target::<TM>(),
        )
    }

    pub fn with_config(
        func: &'func mut Function<TM>,
        store: &'store mut BS,
        config: AssignerConfig,
        file_config: RegisterFileConfig,
    ) -> Self {
        Self {
            func,
            store,
            config,
            file: RegisterFile::new(file_config),
            phase: PathPhase::Mainline,
            spilled: FxIndexSet::default(),
            snapshots: FxHashMap::default(),
            cold_entry: None,
            at_cold_entry: false,
            assigned_sections: FxHashMap::default(),
            walks: Vec::new(),
            pinned: RegMask::EMPTY,
            clobbered: RegMask::EMPTY,
            dying: None,
        }
    }

    pub const fn register_file(&self) -> &RegisterFile<TM> {
        &self.file
    }

    /// Assigns registers to every instruction of the function.
    ///
    /// On error the instruction streams of the function are left untouched.
    pub fn run(&mut self) -> Result<(), AllocError> {
        info!("Assigning registers for {}", self.func.name);
        self.count_uses();
        let body = self.func.body.clone();
        self.walks.push(Walk::new(body));
        self.walk()?;
        self.assign_parameters()?;
        let body = self.finish_walk();
        self.func.body = body;
        for (section, cold) in self.assigned_sections.drain() {
            self.func.sections[section].cold = cold;
        }
        debug_assert!(
            self.func
                .vregs
                .values()
                .all(|vreg| vreg.future_uses == 0 && vreg.assigned.is_none()),
            "Virtual registers survived the function entry"
        );
        info!("Finished assigning registers for {}", self.func.name);
        Ok(())
    }

    fn count_uses(&mut self) {
        let mut uses: FxHashMap<VRegRef, u32> = FxHashMap::default();
        let mut mem_bases: FxHashSet<VRegRef> = FxHashSet::default();
        for stream in self.func.streams() {
            for vreg in stream.virtual_refs() {
                *uses.entry(vreg).or_default() += 1;
            }
            for instr in &stream.instructions {
                for operand in instr.operands() {
                    if let InstrOperand::Mem(MemRef::BaseDisp {
                        base: Register::Virtual(base),
                        ..
                    }) = operand
                    {
                        mem_bases.insert(base);
                    }
                }
            }
        }
        for param in &self.func.params {
            *uses.entry(*param).or_default() += 1;
        }
        for (vreg_ref, vreg) in &mut self.func.vregs {
            let count = uses.get(&vreg_ref).copied().unwrap_or_default();
            vreg.total_uses = count;
            vreg.future_uses = count;
            vreg.live = false;
            vreg.assigned = None;
            vreg.backing_store = None;
            vreg.used_in_mem_ref = mem_bases.contains(&vreg_ref);
        }
    }

    fn walk(&mut self) -> Result<(), AllocError> {
        while let Some((instr, conditions)) = self.walk_mut().next() {
            self.assign_instruction(instr, conditions)?;
        }
        Ok(())
    }

    fn walk_mut(&mut self) -> &mut Walk<TM> {
        self.walks
            .last_mut()
            .unwrap_or_else(|| panic!("No instruction stream is being walked"))
    }

    fn finish_walk(&mut self) -> InstrStream<TM> {
        self.walks
            .pop()
            .unwrap_or_else(|| panic!("No instruction stream is being walked"))
            .finish()
    }

    /// Instructions that come before the current one in program order, closest first.
    fn upcoming(&self) -> impl Iterator<Item = (&Instr<TM>, Option<&DependencyConditions<TM>>)> {
        self.walks.last().into_iter().flat_map(|walk| {
            walk.pending
                .iter_enumerated()
                .rev()
                .map(|(id, instr)| (instr, walk.conditions.get(&id)))
        })
    }

    /// Places `instr` right after the current instruction.
    fn emit_fixup(&mut self, instr: TM::Instr) {
        self.walk_mut().fixups.push(Instr::Machine(instr));
    }

    /// Places `instrs` right after the current instruction, keeping their order.
    fn emit_fixups(&mut self, instrs: impl IntoIterator<Item = TM::Instr>) {
        let instrs = instrs.into_iter().collect_vec();
        for instr in instrs.into_iter().rev() {
            self.emit_fixup(instr);
        }
    }

    fn retire_instruction(&mut self, instr: Instr<TM>) {
        let walk = self.walk_mut();
        walk.emitted
            .extend(walk.fixups.drain(..).map(|fixup| (fixup, true)));
        walk.emitted.push((instr, false));
    }

    fn assign_instruction(
        &mut self,
        instr: Instr<TM>,
        conditions: Option<DependencyConditions<TM>>,
    ) -> Result<(), AllocError> {
        match &instr {
            Instr::Pseudo(PseudoInstr::Assoc(associations)) => {
                for (reg, vreg) in associations {
                    self.file.set_association(*reg, *vreg);
                }
                return Ok(());
            }
            Instr::Pseudo(PseudoInstr::MergePoint(section)) => {
                self.enter_hot_path(*section);
                self.retire_instruction(instr);
                return Ok(());
            }
            _ => {}
        }
        self.file
            .set_weights_from_associations(&mut self.func.vregs);
        let mut instr = instr;
        self.assign_operands(&mut instr, conditions.as_ref())?;
        if let Instr::Pseudo(PseudoInstr::Label(label)) = instr {
            if self.cold_entry.as_ref().map(|(entry, _)| *entry) == Some(label) {
                self.reconcile_cold_entry()?;
            }
        }
        let branch = match instr {
            Instr::Pseudo(PseudoInstr::BranchToCold(section)) => Some(section),
            _ => None,
        };
        self.retire_instruction(instr);
        if let Some(section) = branch {
            self.assign_cold_stream(section)?;
        }
        self.file.free_unlatched();
        self.file.trace_state(&self.func.vregs);
        self.check_invariants();
        Ok(())
    }

    fn assign_operands(
        &mut self,
        instr: &mut Instr<TM>,
        conditions: Option<&DependencyConditions<TM>>,
    ) -> Result<(), AllocError> {
        // Registers the instruction already refers to must not be taken away from it.
        let referenced = instr
            .virtual_refs()
            .into_iter()
            .chain(conditions.into_iter().flat_map(|conditions| {
                conditions.iter().map(|dependency| dependency.vreg).collect_vec()
            }))
            .collect_vec();
        for vreg in referenced {
            if let Some(reg) = self.func.vregs[vreg].assigned {
                self.file.block(reg);
            }
        }
        self.pinned = RegMask::EMPTY;
        self.clobbered = RegMask::EMPTY;
        if let Some(conditions) = conditions {
            self.assign_dependencies(&conditions.post)?;
            self.clobbered = RegMask::from_regs(conditions.post.iter().filter_map(|dependency| {
                match dependency.requirement {
                    Requirement::Fixed(reg) => Some(reg),
                    Requirement::AnyReg | Requirement::Spilled => None,
                }
            }));
        }
        // Every value the instruction reads keeps its register until all operands are placed.
        self.dying = Some(SmallVec::new());
        if let Some(conditions) = conditions {
            self.assign_dependencies(&conditions.pre)?;
        }
        let is_ret = matches!(instr, Instr::Pseudo(PseudoInstr::Ret(_)));
        for operand in instr.operands_mut() {
            match operand {
                InstrOperandMut::Reg(reg, access) => {
                    let Register::Virtual(vreg) = *reg else {
                        continue;
                    };
                    let real = if is_ret {
                        self.assign_return_value(vreg)?
                    } else {
                        let mask = self.operand_mask(vreg, false);
                        self.assign_single(vreg, mask)?
                    };
                    self.pin(real);
                    *reg = Register::Physical(real);
                    if access == Access::Write {
                        self.kill_on_hot_path(vreg);
                    }
                }
                InstrOperandMut::Pair(pair, access) => {
                    let (high, low) = match (pair.high, pair.low) {
                        (Register::Virtual(high), Register::Virtual(low)) => {
                            let mask = self.operand_mask(high, false) & self.operand_mask(low, false);
                            self.assign_pair(high, low, mask)?
                        }
                        (high, low) => (
                            self.assign_pair_half(high)?,
                            self.assign_pair_half(low)?,
                        ),
                    };
                    self.pin(high);
                    self.pin(low);
                    let vregs = [pair.high, pair.low];
                    *pair = RegPair::new(Register::Physical(high), Register::Physical(low));
                    if access == Access::Write {
                        for vreg in vregs.iter().filter_map(Register::try_as_virtual) {
                            self.kill_on_hot_path(vreg);
                        }
                    }
                }
                InstrOperandMut::Mem(MemRef::BaseDisp { base, .. }) => {
                    let Register::Virtual(vreg) = *base else {
                        continue;
                    };
                    let mask = self.operand_mask(vreg, true);
                    let real = self.assign_single(vreg, mask)?;
                    self.pin(real);
                    *base = Register::Physical(real);
                }
                InstrOperandMut::Mem(_) | InstrOperandMut::Imm(_) | InstrOperandMut::Label(_) => {}
            }
        }
        for vreg in self.dying.take().into_iter().flatten() {
            self.retire(vreg);
        }
        self.file.unblock_all();
        self.pinned = RegMask::EMPTY;
        self.clobbered = RegMask::EMPTY;
        Ok(())
    }

    fn assign_pair_half(&mut self, reg: Register<TM>) -> Result<TM::Reg, AllocError> {
        match reg {
            Register::Physical(reg) => Ok(reg),
            Register::Virtual(vreg) => {
                let mask = self.operand_mask(vreg, false);
                self.assign_single(vreg, mask)
            }
        }
    }

    fn pin(&mut self, reg: TM::Reg) {
        self.pinned.insert(reg);
        self.file.block(reg);
    }

    /// Registers `vreg` may be assigned to when it appears in an operand.
    fn operand_mask(&self, vreg: VRegRef, mem_base: bool) -> RegMask {
        let vreg = &self.func.vregs[vreg];
        let mask = TM::RegisterFilePolicy::assignable(vreg.class);
        if mem_base || vreg.used_in_mem_ref {
            mask & TM::RegisterFilePolicy::memory_base_registers()
        } else {
            mask
        }
    }

    fn assign_return_value(&mut self, vreg: VRegRef) -> Result<TM::Reg, AllocError> {
        let (class, size) = {
            let vreg = &self.func.vregs[vreg];
            (vreg.class, vreg.size)
        };
        match TM::CallingConvention::return_slot(class, size) {
            Slot::Register(reg) => {
                self.coerce(vreg, reg)?;
                self.consume_use(vreg);
                Ok(reg)
            }
            Slot::Stack => {
                let mask = self.operand_mask(vreg, false);
                self.assign_single(vreg, mask)
            }
        }
    }

    /// Moves the parameters into the registers the linkage passes them in.
    fn assign_parameters(&mut self) -> Result<(), AllocError> {
        let params = self.func.params.clone();
        let slots = TM::CallingConvention::parameter_slots(params.iter().map(|param| {
            let param = &self.func.vregs[*param];
            (param.class, param.size)
        }))
        .collect_vec();
        for (param, slot) in params.iter().copied().zip(slots) {
            match slot {
                Slot::Register(reg) => {
                    debug!("{} is passed in {}", self.func.vregs[param], reg.name());
                    self.coerce(param, reg)?;
                    self.file.block(reg);
                }
                Slot::Stack => debug!("{} is passed on the stack", self.func.vregs[param]),
            }
        }
        for param in params {
            self.consume_use(param);
        }
        self.file.unblock_all();
        self.file.free_unlatched();
        self.check_invariants();
        Ok(())
    }

    /// Books one processed reference of `vreg` and retires it once no references are left.
    fn consume_use(&mut self, vreg: VRegRef) {
        let virt = &mut self.func.vregs[vreg];
        assert!(virt.future_uses > 0, "{virt} has a negative future use count");
        virt.future_uses -= 1;
        if virt.future_uses > 0 {
            return;
        }
        match &mut self.dying {
            Some(dying) => dying.push(vreg),
            None => self.retire(vreg),
        }
    }

    /// Releases the register and spill slot of a virtual that has no references left.
    fn retire(&mut self, vreg: VRegRef) {
        let virt = &mut self.func.vregs[vreg];
        debug!("{virt} is dead");
        virt.live = false;
        let backing_store = virt.backing_store.take();
        if let Some(reg) = virt.assigned {
            if self.file.state(reg) == RegState::Locked {
                virt.assigned = None;
                if self.file.owner(reg) == Some(vreg) {
                    self.file.get_mut(reg).owner = None;
                }
            } else {
                self.file.unbind(reg, &mut self.func.vregs);
            }
        }
        if let Some(backing_store) = backing_store {
            self.store.release_slot(backing_store.slot);
        }
        self.spilled.shift_remove(&vreg);
    }

    /// A hot path definition starts the live range even if the cold stream defines the value too.
    fn kill_on_hot_path(&mut self, vreg: VRegRef) {
        if self.phase != PathPhase::Hot || self.func.vregs[vreg].future_uses == 0 {
            return;
        }
        debug!("{} starts its range on the hot path", self.func.vregs[vreg]);
        if let Some(reg) = self.func.vregs[vreg].assigned {
            self.file.unbind(reg, &mut self.func.vregs);
        }
        self.func.vregs[vreg].live = false;
    }

    fn check_invariants(&self) {
        if !(self.config.verify || cfg!(debug_assertions)) {
            return;
        }
        self.file.verify(&self.func.vregs);
        for vreg in self.func.vregs.values() {
            assert!(
                vreg.future_uses <= vreg.total_uses,
                "{vreg} has more future than total uses"
            );
            if self.phase != PathPhase::Cold && vreg.live && vreg.future_uses > 0 {
                assert!(
                    vreg.assigned.is_some() || vreg.backing_store.is_some(),
                    "{vreg} is live without a location"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests;
