use std::fmt::{
    Display,
    Formatter,
};

use index_vec::IndexVec;
use rustc_hash::{
    FxHashMap,
    FxHashSet,
};
use slotmap::SlotMap;
use smallvec::SmallVec;
use tracing::debug;

use crate::codegen::machine::{
    dependency::DependencyConditions,
    instr::{
        LabelId,
        SectionId,
    },
    reg::{
        Association,
        VReg,
    },
    Instr,
    InstrId,
    RegClass,
    Size,
    TargetMachine,
    VRegRef,
};

pub mod builder;

/// A straight line of instructions together with the dependency conditions attached to them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstrStream<TM: TargetMachine> {
    pub instructions: IndexVec<InstrId, Instr<TM>>,
    pub conditions: FxHashMap<InstrId, DependencyConditions<TM>>,
    /// Instructions inserted by the register assigner.
    pub synthesized: FxHashSet<InstrId>,
}

impl<TM: TargetMachine> Default for InstrStream<TM> {
    fn default() -> Self {
        Self {
            instructions: IndexVec::new(),
            conditions: FxHashMap::default(),
            synthesized: FxHashSet::default(),
        }
    }
}

impl<TM: TargetMachine> InstrStream<TM> {
    pub fn push(&mut self, instr: Instr<TM>) -> InstrId {
        self.instructions.push(instr)
    }

    pub fn push_with_conditions(
        &mut self,
        instr: Instr<TM>,
        conditions: DependencyConditions<TM>,
    ) -> InstrId {
        let id = self.instructions.push(instr);
        self.conditions.insert(id, conditions);
        id
    }

    pub fn len(&self) -> usize {
        self.instructions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instructions.is_empty()
    }

    pub fn is_synthesized(&self, id: InstrId) -> bool {
        self.synthesized.contains(&id)
    }

    /// All virtual registers referenced by the stream, once per reference.
    pub fn virtual_refs(&self) -> impl Iterator<Item = VRegRef> + '_ {
        self.instructions
            .iter()
            .flat_map(Instr::virtual_refs)
            .chain(
                self.conditions
                    .values()
                    .flat_map(|conditions| conditions.iter().map(|dependency| dependency.vreg)),
            )
    }
}

/// A rarely executed instruction stream placed out of line.
///
/// The mainline branches to the cold stream with a [`BranchToCold`] and the cold stream
/// returns to the [`MergePoint`] that ends the hot path.
///
/// [`BranchToCold`]: crate::codegen::machine::instr::PseudoInstr::BranchToCold
/// [`MergePoint`]: crate::codegen::machine::instr::PseudoInstr::MergePoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutOfLineSection<TM: TargetMachine> {
    pub entry: LabelId,
    pub cold: InstrStream<TM>,
}

#[derive(Debug, Clone)]
pub struct Function<TM: TargetMachine> {
    pub name: String,
    pub vregs: SlotMap<VRegRef, VReg<TM>>,
    pub params: SmallVec<[VRegRef; 4]>,
    pub body: InstrStream<TM>,
    pub sections: IndexVec<SectionId, OutOfLineSection<TM>>,
    next_label: LabelId,
}

impl<TM: TargetMachine> Function<TM> {
    pub fn new(name: String) -> Self {
        Self {
            name,
            vregs: SlotMap::with_key(),
            params: SmallVec::new(),
            body: InstrStream::default(),
            sections: IndexVec::new(),
            next_label: LabelId::new(0),
        }
    }

    pub fn alloc_vreg(&mut self, class: RegClass, size: Size) -> VRegRef {
        let symbol = format!("v{}", self.vregs.len());
        self.vregs.insert(VReg::new(class, size, symbol))
    }

    /// Allocates the two halves of a register pair, high half first.
    pub fn alloc_pair(&mut self, class: RegClass, size: Size) -> (VRegRef, VRegRef) {
        let high = self.alloc_vreg(class, size);
        let low = self.alloc_vreg(class, size);
        self.vregs[high].sibling = Some(low);
        self.vregs[high].association = Association::FirstOfPair;
        self.vregs[low].sibling = Some(high);
        self.vregs[low].association = Association::SecondOfPair;
        debug!("Allocated pair {}:{}", self.vregs[high], self.vregs[low]);
        (high, low)
    }

    pub fn alloc_placeholder(&mut self, class: RegClass, size: Size) -> VRegRef {
        let vreg = self.alloc_vreg(class, size);
        self.vregs[vreg].placeholder = true;
        vreg
    }

    pub fn get_vreg(&self, vreg: VRegRef) -> &VReg<TM> {
        &self.vregs[vreg]
    }

    pub fn associate(&mut self, vreg: VRegRef, reg: TM::Reg) {
        self.vregs[vreg].association = Association::Real(reg);
    }

    pub fn create_label(&mut self) -> LabelId {
        let label = self.next_label;
        self.next_label += 1;
        label
    }

    pub fn streams(&self) -> impl Iterator<Item = &InstrStream<TM>> {
        std::iter::once(&self.body).chain(self.sections.iter().map(|section| &section.cold))
    }

    /// Returns true if no instruction refers to a virtual register anymore.
    pub fn is_fully_assigned(&self) -> bool {
        self.streams()
            .all(|stream| stream.instructions.iter().all(|instr| instr.virtual_refs().is_empty()))
    }
}

impl<TM: TargetMachine> Display for Function<TM> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "function {}:", self.name)?;
        for instr in &self.body.instructions {
            writeln!(f, "  {}", instr.display(self))?;
        }
        for (section_id, section) in self.sections.iter_enumerated() {
            writeln!(f, "{section_id}:")?;
            for instr in &section.cold.instructions {
                writeln!(f, "  {}", instr.display(self))?;
            }
        }
        Ok(())
    }
}
