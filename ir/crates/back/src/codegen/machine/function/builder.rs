use iter_tools::Itertools;
use smallvec::SmallVec;
use tracing::debug;

use crate::codegen::{
    machine::{
        abi::{
            calling_convention::Slot,
            CallingConvention,
        },
        dependency::{
            DependencyConditions,
            Requirement,
        },
        function::{
            Function,
            InstrStream,
            OutOfLineSection,
        },
        instr::{
            PseudoInstr,
            SectionId,
        },
        Instr,
        InstrId,
        LabelId,
        PhysicalRegister,
        RegClass,
        Register,
        Size,
        TargetMachine,
        VRegRef,
    },
    register_allocator::RegisterFilePolicy,
};

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum Cursor {
    Body,
    Cold(SectionId),
}

/// Builds the input of the register assigner, the way instruction selection would.
#[derive(Debug)]
pub struct FunctionBuilder<TM: TargetMachine> {
    function: Function<TM>,
    cursor: Cursor,
}

impl<TM: TargetMachine> FunctionBuilder<TM> {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            function: Function::new(name.into()),
            cursor: Cursor::Body,
        }
    }

    pub fn param(&mut self, class: RegClass, size: Size) -> VRegRef {
        let vreg = self.function.alloc_vreg(class, size);
        self.function.params.push(vreg);
        vreg
    }

    pub fn vreg(&mut self, class: RegClass, size: Size) -> VRegRef {
        self.function.alloc_vreg(class, size)
    }

    pub fn pair(&mut self, class: RegClass, size: Size) -> (VRegRef, VRegRef) {
        self.function.alloc_pair(class, size)
    }

    pub fn function(&mut self) -> &mut Function<TM> {
        &mut self.function
    }

    fn stream(&mut self) -> &mut InstrStream<TM> {
        match self.cursor {
            Cursor::Body => &mut self.function.body,
            Cursor::Cold(section) => &mut self.function.sections[section].cold,
        }
    }

    pub fn push(&mut self, instr: TM::Instr) -> InstrId {
        self.stream().push(Instr::Machine(instr))
    }

    pub fn push_with_conditions(
        &mut self,
        instr: TM::Instr,
        conditions: DependencyConditions<TM>,
    ) -> InstrId {
        self.stream()
            .push_with_conditions(Instr::Machine(instr), conditions)
    }

    pub fn label(&mut self) -> LabelId {
        let label = self.function.create_label();
        self.stream().push(Instr::Pseudo(PseudoInstr::Label(label)));
        label
    }

    pub fn ret(&mut self, value: Option<VRegRef>) -> InstrId {
        self.stream()
            .push(Instr::Pseudo(PseudoInstr::Ret(value.map(Register::Virtual))))
    }

    pub fn associate(&mut self, associations: &[(TM::Reg, Option<VRegRef>)]) -> InstrId {
        for (reg, vreg) in associations {
            debug!("Associating {:?} with {}", vreg, reg.name());
        }
        self.stream().push(Instr::Pseudo(PseudoInstr::Assoc(
            associations.iter().copied().collect(),
        )))
    }

    /// Associates virtual registers with real registers given by their global register number.
    ///
    /// Numbers the target does not know are ignored.
    pub fn associate_globals(&mut self, associations: &[(usize, Option<VRegRef>)]) -> InstrId {
        let table = <TM::RegisterFilePolicy as RegisterFilePolicy>::global_register_table();
        let associations = associations
            .iter()
            .filter_map(|(number, vreg)| table.get(*number).map(|reg| (*reg, *vreg)))
            .collect_vec();
        self.associate(&associations)
    }

    /// Emits a call.
    ///
    /// Arguments are pinned to their parameter registers right before the call, the result
    /// to the return register right after it and every other volatile register is killed.
    pub fn call(&mut self, instr: TM::Instr, args: &[VRegRef], result: Option<VRegRef>) -> InstrId {
        let mut conditions = DependencyConditions::new();
        let slots = TM::CallingConvention::parameter_slots(args.iter().map(|arg| {
            let vreg = &self.function.vregs[*arg];
            (vreg.class, vreg.size)
        }))
        .collect_vec();
        for (arg, slot) in args.iter().copied().zip(slots) {
            match slot {
                Slot::Register(reg) => conditions.add_pre_condition(arg, Requirement::Fixed(reg)),
                Slot::Stack => unimplemented!("Stack arguments are passed by the caller's stores"),
            }
        }
        let mut result_reg = None;
        if let Some(result) = result {
            let vreg = &self.function.vregs[result];
            if let Slot::Register(reg) = TM::CallingConvention::return_slot(vreg.class, vreg.size) {
                conditions.add_post_condition(result, Requirement::Fixed(reg));
                result_reg = Some(reg);
            }
        }
        let killed: SmallVec<[TM::Reg; 16]> = TM::CallingConvention::volatile_registers()
            .iter()
            .copied()
            .filter(|reg| Some(*reg) != result_reg)
            .collect();
        for reg in killed {
            let placeholder = self.function.alloc_placeholder(reg.class(), reg.size());
            conditions.add_post_condition(placeholder, Requirement::Fixed(reg));
        }
        self.push_with_conditions(instr, conditions)
    }

    /// Branches to a new out of line section. Instructions pushed afterwards form the hot path.
    pub fn branch_to_cold(&mut self) -> SectionId {
        assert_eq!(self.cursor, Cursor::Body, "Out of line sections do not nest");
        let entry = self.function.create_label();
        let section = self.function.sections.push(OutOfLineSection {
            entry,
            cold: InstrStream::default(),
        });
        self.function
            .body
            .push(Instr::Pseudo(PseudoInstr::BranchToCold(section)));
        section
    }

    /// Ends the hot path of `section`.
    pub fn merge(&mut self, section: SectionId) -> InstrId {
        assert_eq!(self.cursor, Cursor::Body, "The merge point belongs to the mainline");
        self.function
            .body
            .push(Instr::Pseudo(PseudoInstr::MergePoint(section)))
    }

    /// Continues in the cold stream of `section`.
    pub fn switch_to_cold(&mut self, section: SectionId) {
        self.cursor = Cursor::Cold(section);
        let entry = self.function.sections[section].entry;
        if self.stream().is_empty() {
            self.stream().push(Instr::Pseudo(PseudoInstr::Label(entry)));
        }
    }

    /// Ends the cold stream of `section` and continues in the mainline.
    pub fn return_to_merge(&mut self, section: SectionId) {
        assert_eq!(self.cursor, Cursor::Cold(section));
        self.stream()
            .push(Instr::Pseudo(PseudoInstr::ReturnToMerge(section)));
        self.cursor = Cursor::Body;
    }

    pub fn finish(self) -> Function<TM> {
        assert_eq!(self.cursor, Cursor::Body, "Unterminated cold stream");
        self.function
    }
}
