use rand::{
    rngs::StdRng,
    seq::SliceRandom,
    Rng,
    SeedableRng,
};
use tracing_test::traced_test;

use crate::{
    codegen::{
        machine::{
            abi::CallingConvention,
            backing_store::{
                SlotId,
                SpillSlot,
            },
            function::builder::FunctionBuilder,
            instr::{
                MemRef,
                PseudoInstr,
            },
            DependencyConditions,
            Function,
            Instr,
            InstrId,
            PhysicalRegister as _,
            RegClass,
            Requirement,
            SectionId,
            Size,
            StackFrame,
            VRegRef,
        },
        register_allocator::{
            AllocError,
            AssignerConfig,
            PairLegality,
            RegisterAssigner,
            RegisterFileConfig,
        },
        targets::s390x::{
            ElfLinkage,
            Instr as S390,
            PairPolicy,
            PhysicalRegister as Reg,
            RegPair,
            Register,
            Target,
        },
    },
    emu::Emulator,
};

fn assign(func: &Function<Target>, file_config: RegisterFileConfig) -> (Function<Target>, StackFrame) {
    let mut assigned = func.clone();
    let mut frame = StackFrame::new();
    RegisterAssigner::with_config(
        &mut assigned,
        &mut frame,
        AssignerConfig::verifying(),
        file_config,
    )
    .run()
    .unwrap_or_else(|err| panic!("Failed to assign registers: {err}\n{func}"));
    (assigned, frame)
}

fn try_assign(func: &mut Function<Target>, file_config: RegisterFileConfig) -> Result<(), AllocError> {
    let mut frame = StackFrame::new();
    RegisterAssigner::with_config(func, &mut frame, AssignerConfig::verifying(), file_config).run()
}

fn emulate(original: &Function<Target>, assigned: &Function<Target>, cold_paths: &[SectionId]) {
    let mut emulator = cold_paths
        .iter()
        .fold(Emulator::new(original, assigned), |emulator, section| {
            emulator.take_cold_path(*section)
        });
    emulator
        .run()
        .unwrap_or_else(|err| panic!("{err}\n{original}\n{assigned}"));
}

fn only(allowed: &[Reg]) -> RegisterFileConfig {
    RegisterFileConfig::for_target::<Target>().lock(
        Reg::all()
            .iter()
            .copied()
            .filter(|reg| !allowed.contains(reg)),
    )
}

fn phys(reg: Reg) -> Register {
    Register::Physical(reg)
}

fn virt(vreg: VRegRef) -> Register {
    Register::Virtual(vreg)
}

fn base(vreg: VRegRef, disp: i32) -> MemRef<Target> {
    MemRef::BaseDisp {
        base: virt(vreg),
        disp,
    }
}

fn physical_registers(func: &Function<Target>) -> Vec<Reg> {
    func.streams()
        .flat_map(|stream| stream.instructions.iter())
        .flat_map(Instr::operands)
        .flat_map(|operand| operand.registers())
        .filter_map(|reg| reg.try_as_physical())
        .collect()
}

#[test]
#[traced_test]
fn should_spill_and_reload_when_a_single_register_is_available() {
    let mut builder = FunctionBuilder::<Target>::new("single");
    let v1 = builder.vreg(RegClass::Gpr, Size::DWord);
    let v2 = builder.vreg(RegClass::Gpr, Size::DWord);
    builder.push(S390::CHI { lhs: virt(v1), imm: 1 });
    builder.push(S390::CHI { lhs: virt(v2), imm: 2 });
    builder.push(S390::CHI { lhs: virt(v1), imm: 3 });
    builder.ret(None);
    let func = builder.finish();
    let (assigned, frame) = assign(&func, only(&[Reg::GPR0]));
    let r0 = phys(Reg::GPR0);
    let slot = SpillSlot {
        id: SlotId::new(0),
        bytes: 4,
    };
    let expected = vec![
        Instr::Machine(S390::CHI { lhs: r0, imm: 1 }),
        Instr::Machine(S390::ST {
            src: r0,
            mem: MemRef::Spill(slot),
        }),
        Instr::Machine(S390::CHI { lhs: r0, imm: 2 }),
        Instr::Machine(S390::L {
            dest: r0,
            mem: MemRef::Spill(slot),
        }),
        Instr::Machine(S390::CHI { lhs: r0, imm: 3 }),
        Instr::Pseudo(PseudoInstr::Ret(None)),
    ];
    assert_eq!(assigned.body.instructions.raw, expected, "{assigned}");
    assert!(assigned.body.is_synthesized(InstrId::new(1)));
    assert!(assigned.body.is_synthesized(InstrId::new(3)));
    assert!(!assigned.body.is_synthesized(InstrId::new(2)));
    assert_eq!(frame.slot_count(), 1);
    assert_eq!(frame.slots_in_use(), 0);
    assert!(logs_contain("Spilling v0 from GPR0"));
    for vreg in assigned.vregs.values() {
        assert!(!vreg.is_live(), "{vreg} is still live");
        assert_eq!(vreg.future_uses(), 0);
    }
}

#[test]
#[traced_test]
fn should_fail_when_an_instruction_needs_more_registers_than_there_are() {
    let mut builder = FunctionBuilder::<Target>::new("starved");
    let v1 = builder.vreg(RegClass::Gpr, Size::QWord);
    let v2 = builder.vreg(RegClass::Gpr, Size::QWord);
    builder.push(S390::AGR {
        dest: virt(v1),
        src: virt(v2),
    });
    builder.push(S390::CGHI { lhs: virt(v1), imm: 0 });
    builder.ret(None);
    let mut func = builder.finish();
    let original = func.body.clone();
    let err = try_assign(&mut func, only(&[Reg::GPR0])).unwrap_err();
    assert!(
        matches!(err, AllocError::OutOfRegisters { class: RegClass::Gpr, .. }),
        "{err}"
    );
    assert_eq!(func.body, original, "A failed run must leave the function untouched");
}

#[test]
#[traced_test]
fn should_place_pair_halves_into_a_legal_pair() {
    let mut builder = FunctionBuilder::<Target>::new("pair");
    let (high, low) = builder.pair(RegClass::Gpr, Size::DWord);
    let src = builder.vreg(RegClass::Gpr, Size::DWord);
    builder.push(S390::LHI { dest: virt(high), imm: 0 });
    builder.push(S390::LHI { dest: virt(low), imm: 7 });
    builder.push(S390::LHI { dest: virt(src), imm: 3 });
    builder.push(S390::MR {
        pair: RegPair::new(virt(high), virt(low)),
        src: virt(src),
    });
    builder.push(S390::CHI { lhs: virt(high), imm: 0 });
    builder.push(S390::CHI { lhs: virt(low), imm: 0 });
    builder.ret(None);
    let func = builder.finish();
    let (assigned, frame) = assign(&func, RegisterFileConfig::for_target::<Target>());
    let pair = assigned
        .body
        .instructions
        .iter()
        .find_map(|instr| match instr {
            Instr::Machine(S390::MR { pair, .. }) => Some(*pair),
            _ => None,
        })
        .unwrap();
    let (Register::Physical(high), Register::Physical(low)) = (pair.high, pair.low) else {
        panic!("MR was not assigned: {assigned}");
    };
    assert!(
        PairPolicy::is_legal_pair(high, low),
        "{}:{} is not a legal pair",
        high.name(),
        low.name()
    );
    assert_eq!(frame.slots_in_use(), 0);
    emulate(&func, &assigned, &[]);
}

#[test]
#[traced_test]
fn should_move_a_pair_half_next_to_its_sibling() {
    let mut builder = FunctionBuilder::<Target>::new("split_pair");
    let (high, low) = builder.pair(RegClass::Gpr, Size::DWord);
    let src = builder.vreg(RegClass::Gpr, Size::DWord);
    builder.push(S390::LHI { dest: virt(high), imm: 0 });
    builder.push(S390::LHI { dest: virt(low), imm: 7 });
    builder.push(S390::LHI { dest: virt(src), imm: 3 });
    builder.push(S390::MR {
        pair: RegPair::new(virt(high), virt(low)),
        src: virt(src),
    });
    let mut conditions = DependencyConditions::new();
    conditions.add_pre_condition(high, Requirement::Fixed(Reg::GPR3));
    conditions.add_pre_condition(low, Requirement::Fixed(Reg::GPR5));
    builder.push_with_conditions(S390::CHI { lhs: virt(high), imm: 0 }, conditions);
    builder.ret(None);
    let func = builder.finish();
    let (assigned, _) = assign(&func, RegisterFileConfig::for_target::<Target>());
    let (mr, pair) = assigned
        .body
        .instructions
        .iter_enumerated()
        .find_map(|(id, instr)| match instr {
            Instr::Machine(S390::MR { pair, .. }) => Some((id, *pair)),
            _ => None,
        })
        .unwrap();
    assert_eq!(pair, RegPair::new(phys(Reg::GPR4), phys(Reg::GPR5)));
    let fixup = mr + 1;
    assert!(assigned.body.is_synthesized(fixup));
    assert_eq!(
        assigned.body.instructions[fixup],
        Instr::Machine(S390::LR {
            dest: phys(Reg::GPR3),
            src: phys(Reg::GPR4),
        })
    );
    emulate(&func, &assigned, &[]);
}

#[test]
#[traced_test]
fn should_reject_pairs_of_vector_registers() {
    let mut builder = FunctionBuilder::<Target>::new("vector_pair");
    let (high, low) = builder.pair(RegClass::Vrf, Size::OWord);
    builder.push(S390::AXBR {
        dest: RegPair::new(virt(high), virt(low)),
        src: RegPair::new(virt(high), virt(low)),
    });
    builder.ret(None);
    let mut func = builder.finish();
    assert_eq!(
        try_assign(&mut func, RegisterFileConfig::for_target::<Target>()),
        Err(AllocError::IllegalPairClass { class: RegClass::Vrf })
    );
}

#[test]
#[traced_test]
fn should_fail_when_no_legal_pair_is_left() {
    let mut builder = FunctionBuilder::<Target>::new("no_pair");
    let (high, low) = builder.pair(RegClass::Gpr, Size::DWord);
    let src = builder.vreg(RegClass::Gpr, Size::DWord);
    builder.push(S390::DR {
        pair: RegPair::new(virt(high), virt(low)),
        src: virt(src),
    });
    builder.ret(None);
    let mut func = builder.finish();
    let err = try_assign(&mut func, only(&[Reg::GPR1, Reg::GPR2])).unwrap_err();
    assert!(
        matches!(err, AllocError::NoLegalPair { class: RegClass::Gpr, .. }),
        "{err}"
    );
}

#[test]
#[traced_test]
fn should_warn_when_coercing_into_a_locked_register() {
    let mut builder = FunctionBuilder::<Target>::new("locked");
    let v = builder.vreg(RegClass::Gpr, Size::QWord);
    builder.push(S390::LGHI { dest: virt(v), imm: 1 });
    let mut conditions = DependencyConditions::new();
    conditions.add_pre_condition(v, Requirement::Fixed(Reg::GPR13));
    builder.push_with_conditions(S390::CGHI { lhs: virt(v), imm: 0 }, conditions);
    builder.ret(None);
    let func = builder.finish();
    let (assigned, _) = assign(&func, RegisterFileConfig::for_target::<Target>());
    assert!(logs_contain("locked register GPR13"));
    assert_eq!(
        assigned.body.instructions[InstrId::new(1)],
        Instr::Machine(S390::CGHI {
            lhs: phys(Reg::GPR13),
            imm: 0,
        })
    );
}

#[test]
#[traced_test]
fn should_spill_values_sharing_storage_with_a_coerced_register() {
    let mut builder = FunctionBuilder::<Target>::new("overlap");
    let ptr = builder.param(RegClass::Gpr, Size::QWord);
    let f = builder.vreg(RegClass::Fpr, Size::QWord);
    let w = builder.vreg(RegClass::Vrf, Size::OWord);
    builder.push(S390::LD {
        dest: virt(f),
        mem: base(ptr, 0),
    });
    builder.push(S390::VL {
        dest: virt(w),
        mem: base(ptr, 16),
    });
    let mut conditions = DependencyConditions::new();
    conditions.add_pre_condition(w, Requirement::Fixed(Reg::VRF4));
    builder.push_with_conditions(
        S390::VST {
            src: virt(w),
            mem: base(ptr, 32),
        },
        conditions,
    );
    let mut conditions = DependencyConditions::new();
    conditions.add_pre_condition(f, Requirement::Fixed(Reg::FPR4));
    builder.push_with_conditions(
        S390::STD {
            src: virt(f),
            mem: base(ptr, 48),
        },
        conditions,
    );
    builder.ret(None);
    let func = builder.finish();
    let (assigned, frame) = assign(&func, RegisterFileConfig::for_target::<Target>());
    let reloads = assigned
        .body
        .instructions
        .iter()
        .filter(|instr| {
            matches!(
                instr,
                Instr::Machine(S390::LD {
                    dest: Register::Physical(Reg::FPR4),
                    mem: MemRef::Spill(_),
                })
            )
        })
        .count();
    assert_eq!(reloads, 1, "{assigned}");
    assert_eq!(frame.slots_in_use(), 0);
    emulate(&func, &assigned, &[]);
}

#[test]
#[traced_test]
fn should_prefer_associated_registers() {
    let mut builder = FunctionBuilder::<Target>::new("assoc");
    let v = builder.vreg(RegClass::Gpr, Size::QWord);
    builder.push(S390::LGHI { dest: virt(v), imm: 1 });
    builder.push(S390::CGHI { lhs: virt(v), imm: 0 });
    builder.associate_globals(&[(2, Some(v))]);
    builder.ret(None);
    let func = builder.finish();
    let (assigned, _) = assign(&func, RegisterFileConfig::for_target::<Target>());
    assert_eq!(
        assigned.body.instructions.raw,
        vec![
            Instr::Machine(S390::LGHI {
                dest: phys(Reg::GPR3),
                imm: 1,
            }),
            Instr::Machine(S390::CGHI {
                lhs: phys(Reg::GPR3),
                imm: 0,
            }),
            Instr::Pseudo(PseudoInstr::Ret(None)),
        ],
        "Association instructions are dropped"
    );
}

#[test]
#[traced_test]
fn should_move_values_into_memory_for_spilled_dependencies() {
    let mut builder = FunctionBuilder::<Target>::new("in_memory");
    let v = builder.vreg(RegClass::Gpr, Size::QWord);
    let u = builder.vreg(RegClass::Gpr, Size::QWord);
    builder.push(S390::LGHI { dest: virt(v), imm: 1 });
    builder.push(S390::LGHI { dest: virt(u), imm: 2 });
    let mut conditions = DependencyConditions::new();
    conditions.add_pre_condition(v, Requirement::Spilled);
    builder.push_with_conditions(S390::CGHI { lhs: virt(u), imm: 0 }, conditions);
    builder.push(S390::CGHI { lhs: virt(v), imm: 0 });
    builder.ret(None);
    let func = builder.finish();
    let (assigned, frame) = assign(&func, RegisterFileConfig::for_target::<Target>());
    let names = assigned
        .body
        .instructions
        .iter()
        .map(Instr::name)
        .collect::<Vec<_>>();
    assert_eq!(
        names,
        vec!["LGHI", "STG", "LGHI", "CGHI", "LG", "CGHI", "RET"],
        "{assigned}"
    );
    assert_eq!(frame.slots_in_use(), 0);
    emulate(&func, &assigned, &[]);
}

#[test]
#[traced_test]
fn should_keep_values_out_of_registers_a_call_clobbers() {
    let mut builder = FunctionBuilder::<Target>::new("call");
    let arg = builder.param(RegClass::Gpr, Size::QWord);
    let x = builder.vreg(RegClass::Gpr, Size::QWord);
    let result = builder.vreg(RegClass::Gpr, Size::QWord);
    builder.push(S390::LGHI { dest: virt(x), imm: 1 });
    builder.call(S390::BRASL { callee: "callee" }, &[arg], Some(result));
    builder.push(S390::AGR {
        dest: virt(x),
        src: virt(result),
    });
    builder.ret(Some(x));
    let func = builder.finish();
    let (assigned, _) = assign(&func, RegisterFileConfig::for_target::<Target>());
    let Instr::Machine(S390::LGHI {
        dest: Register::Physical(x_reg),
        ..
    }) = assigned.body.instructions[InstrId::new(0)]
    else {
        panic!("Expected the definition of x first: {assigned}");
    };
    assert!(
        !ElfLinkage::volatile_registers().contains(&x_reg),
        "x lives across the call in volatile {}",
        x_reg.name()
    );
    emulate(&func, &assigned, &[]);
}

fn out_of_line_function(clobber_on_cold_path: bool) -> (Function<Target>, SectionId) {
    let mut builder = FunctionBuilder::<Target>::new("out_of_line");
    let a = builder.param(RegClass::Gpr, Size::QWord);
    let x = builder.vreg(RegClass::Gpr, Size::QWord);
    builder.push(S390::LGHI { dest: virt(x), imm: 1 });
    let section = builder.branch_to_cold();
    builder.push(S390::AGR {
        dest: virt(x),
        src: virt(a),
    });
    builder.merge(section);
    builder.push(S390::AGR {
        dest: virt(x),
        src: virt(a),
    });
    builder.ret(Some(x));
    builder.switch_to_cold(section);
    if clobber_on_cold_path {
        builder.call(S390::BRASL { callee: "slow_path" }, &[], None);
    } else {
        let y = builder.vreg(RegClass::Gpr, Size::QWord);
        builder.push(S390::LGHI { dest: virt(y), imm: 5 });
        builder.push(S390::AGR {
            dest: virt(x),
            src: virt(y),
        });
    }
    builder.return_to_merge(section);
    (builder.finish(), section)
}

#[test]
#[traced_test]
fn should_agree_on_registers_at_both_ends_of_a_cold_stream() {
    let (func, section) = out_of_line_function(false);
    let (assigned, frame) = assign(&func, RegisterFileConfig::for_target::<Target>());
    assert!(assigned.is_fully_assigned(), "{assigned}");
    assert_eq!(frame.slots_in_use(), 0);
    emulate(&func, &assigned, &[]);
    emulate(&func, &assigned, &[section]);
}

#[test]
#[traced_test]
fn should_restore_the_hot_path_registers_at_the_cold_entry() {
    let (func, section) = out_of_line_function(true);
    let (assigned, frame) = assign(&func, RegisterFileConfig::for_target::<Target>());
    let cold = &assigned.sections[section].cold;
    assert_eq!(
        cold.instructions[InstrId::new(0)],
        Instr::Pseudo(PseudoInstr::Label(func.sections[section].entry))
    );
    assert!(
        cold.is_synthesized(InstrId::new(1)),
        "Values are moved right after the entry label: {assigned}"
    );
    assert_eq!(frame.slots_in_use(), 0);
    emulate(&func, &assigned, &[]);
    emulate(&func, &assigned, &[section]);
}

fn pick_def(rng: &mut StdRng, defined: &mut Vec<VRegRef>, fresh: &mut Vec<VRegRef>) -> VRegRef {
    if defined.is_empty() || rng.gen_bool(0.4) {
        if let Some(vreg) = fresh.pop() {
            defined.push(vreg);
            return vreg;
        }
    }
    *defined.choose(rng).unwrap()
}

/// Straight line code that only reads values after defining them.
fn random_program(rng: &mut StdRng) -> Function<Target> {
    let mut builder = FunctionBuilder::<Target>::new("random");
    let mut defined = (0..rng.gen_range(0..=2))
        .map(|_| builder.param(RegClass::Gpr, Size::QWord))
        .collect::<Vec<_>>();
    let mut fresh = (0..12)
        .map(|_| builder.vreg(RegClass::Gpr, Size::QWord))
        .collect::<Vec<_>>();
    for _ in 0..rng.gen_range(10..60) {
        let (Some(used), Some(other)) = (defined.choose(rng).copied(), defined.choose(rng).copied()) else {
            let def = pick_def(rng, &mut defined, &mut fresh);
            builder.push(S390::LGHI {
                dest: virt(def),
                imm: 0,
            });
            continue;
        };
        let instr = match rng.gen_range(0..6) {
            0 => S390::LGHI {
                dest: virt(pick_def(rng, &mut defined, &mut fresh)),
                imm: 1,
            },
            1 => S390::AGR {
                dest: virt(used),
                src: virt(other),
            },
            2 => S390::LGR {
                dest: virt(pick_def(rng, &mut defined, &mut fresh)),
                src: virt(used),
            },
            3 => S390::CGHI {
                lhs: virt(used),
                imm: 0,
            },
            4 => S390::STG {
                src: virt(used),
                mem: base(other, 8),
            },
            _ => S390::LG {
                dest: virt(pick_def(rng, &mut defined, &mut fresh)),
                mem: base(used, 16),
            },
        };
        builder.push(instr);
    }
    let value = defined.choose(rng).copied().filter(|_| rng.gen_bool(0.5));
    builder.ret(value);
    builder.finish()
}

#[test]
#[traced_test]
fn should_preserve_every_value_of_random_programs() {
    let allowed = [Reg::GPR0, Reg::GPR1, Reg::GPR2, Reg::GPR3, Reg::GPR4, Reg::GPR5];
    let mut rng = StdRng::seed_from_u64(0x5390);
    for _ in 0..200 {
        let func = random_program(&mut rng);
        let (assigned, frame) = assign(&func, only(&allowed));
        assert!(assigned.is_fully_assigned(), "{assigned}");
        assert_eq!(frame.slots_in_use(), 0, "{assigned}");
        for reg in physical_registers(&assigned) {
            assert!(allowed.contains(&reg), "{} is locked: {assigned}", reg.name());
        }
        for instr in &assigned.body.instructions {
            let mem = match instr {
                Instr::Machine(S390::STG { mem, .. } | S390::LG { mem, .. }) => mem,
                _ => continue,
            };
            assert_ne!(
                mem.base(),
                Some(phys(Reg::GPR0)),
                "GPR0 cannot be a base register: {assigned}"
            );
        }
        emulate(&func, &assigned, &[]);
    }
}

#[test]
#[traced_test]
fn should_never_hand_out_locked_registers_for_pairs() {
    let mut rng = StdRng::seed_from_u64(0x9a12);
    for _ in 0..50 {
        let allowed = Reg::all()
            .iter()
            .copied()
            .filter(|reg| reg.class() == RegClass::Gpr && reg.number() < 13 && rng.gen_bool(0.5))
            .collect::<Vec<_>>();
        let mut builder = FunctionBuilder::<Target>::new("pairs");
        let (high, low) = builder.pair(RegClass::Gpr, Size::DWord);
        let src = builder.vreg(RegClass::Gpr, Size::DWord);
        builder.push(S390::LHI { dest: virt(high), imm: 9 });
        builder.push(S390::LHI { dest: virt(low), imm: 4 });
        builder.push(S390::LHI { dest: virt(src), imm: 2 });
        builder.push(S390::DR {
            pair: RegPair::new(virt(high), virt(low)),
            src: virt(src),
        });
        builder.push(S390::CHI { lhs: virt(low), imm: 0 });
        builder.ret(None);
        let func = builder.finish();
        let mut assigned = func.clone();
        let result = try_assign(&mut assigned, only(&allowed));
        let has_pair = PairPolicy::legal_pairs(RegClass::Gpr)
            .iter()
            .any(|(high, low)| allowed.contains(high) && allowed.contains(low));
        match result {
            Ok(()) => {
                assert!(has_pair);
                for reg in physical_registers(&assigned) {
                    assert!(allowed.contains(&reg), "{} is locked: {assigned}", reg.name());
                }
                emulate(&func, &assigned, &[]);
            }
            Err(AllocError::NoLegalPair { .. }) => assert!(!has_pair),
            Err(AllocError::OutOfRegisters { .. }) => {
                assert!(allowed.len() < 3, "{allowed:?} should fit a pair and a divisor");
            }
            Err(err) => panic!("{err}"),
        }
    }
}

#[test]
#[traced_test]
fn should_not_reload_into_a_register_the_same_instruction_defines() {
    let mut builder = FunctionBuilder::<Target>::new("defined_and_reloaded");
    let v0 = builder.vreg(RegClass::Gpr, Size::QWord);
    let v1 = builder.vreg(RegClass::Gpr, Size::QWord);
    let v2 = builder.vreg(RegClass::Gpr, Size::QWord);
    builder.push(S390::LGHI { dest: virt(v0), imm: 1 });
    builder.push(S390::LGHI { dest: virt(v2), imm: 3 });
    builder.push(S390::LG {
        dest: virt(v1),
        mem: base(v0, 16),
    });
    builder.push(S390::CGHI { lhs: virt(v2), imm: 0 });
    builder.push(S390::CGHI { lhs: virt(v1), imm: 0 });
    builder.push(S390::CGHI { lhs: virt(v0), imm: 0 });
    builder.push(S390::CGHI { lhs: virt(v2), imm: 0 });
    builder.ret(None);
    let func = builder.finish();
    let (assigned, frame) = assign(&func, only(&[Reg::GPR1, Reg::GPR2]));
    let (dest, base_reg) = assigned
        .body
        .instructions
        .iter()
        .find_map(|instr| match instr {
            Instr::Machine(S390::LG {
                dest,
                mem: MemRef::BaseDisp { base, .. },
            }) => Some((*dest, *base)),
            _ => None,
        })
        .unwrap();
    assert_ne!(dest, base_reg, "{assigned}");
    assert_eq!(frame.slots_in_use(), 0);
    emulate(&func, &assigned, &[]);
}

#[test]
#[traced_test]
fn should_evict_the_pair_whose_values_are_needed_last() {
    let mut builder = FunctionBuilder::<Target>::new("pair_victim");
    let values = (0..4)
        .map(|_| builder.vreg(RegClass::Gpr, Size::DWord))
        .collect::<Vec<_>>();
    let (high, low) = builder.pair(RegClass::Gpr, Size::DWord);
    let src = builder.vreg(RegClass::Gpr, Size::DWord);
    for (imm, value) in values.iter().enumerate() {
        builder.push(S390::LHI {
            dest: virt(*value),
            imm: imm as i64,
        });
    }
    builder.push(S390::CHI { lhs: virt(values[0]), imm: 0 });
    builder.push(S390::CHI { lhs: virt(values[1]), imm: 0 });
    builder.push(S390::DR {
        pair: RegPair::new(virt(high), virt(low)),
        src: virt(src),
    });
    let homes = [Reg::GPR2, Reg::GPR3, Reg::GPR4, Reg::GPR5];
    for (value, home) in values.iter().zip(homes) {
        let mut conditions = DependencyConditions::new();
        conditions.add_pre_condition(*value, Requirement::Fixed(home));
        builder.push_with_conditions(S390::CHI { lhs: virt(*value), imm: 0 }, conditions);
    }
    builder.ret(None);
    let func = builder.finish();
    let (assigned, frame) = assign(
        &func,
        only(&[Reg::GPR1, Reg::GPR2, Reg::GPR3, Reg::GPR4, Reg::GPR5]),
    );
    let pair = assigned
        .body
        .instructions
        .iter()
        .find_map(|instr| match instr {
            Instr::Machine(S390::DR { pair, .. }) => Some(*pair),
            _ => None,
        })
        .unwrap();
    assert_eq!(
        pair,
        RegPair::new(phys(Reg::GPR4), phys(Reg::GPR5)),
        "GPR2:GPR3 holds values the instructions right before the division need: {assigned}"
    );
    assert_eq!(frame.slots_in_use(), 0);
    emulate(&func, &assigned, &[]);
}

/// Extended precision additions over three floating point pairs loaded from memory.
fn random_float_pair_program(rng: &mut StdRng) -> Function<Target> {
    let mut builder = FunctionBuilder::<Target>::new("float_pairs");
    let ptr = builder.param(RegClass::Gpr, Size::QWord);
    let pairs = (0..3)
        .map(|_| builder.pair(RegClass::Fpr, Size::QWord))
        .collect::<Vec<_>>();
    for (index, (high, low)) in pairs.iter().copied().enumerate() {
        let disp = 16 * index as i32;
        builder.push(S390::LD {
            dest: virt(high),
            mem: base(ptr, disp),
        });
        builder.push(S390::LD {
            dest: virt(low),
            mem: base(ptr, disp + 8),
        });
    }
    for _ in 0..rng.gen_range(4..20) {
        let dest = rng.gen_range(0..pairs.len());
        let src = (dest + rng.gen_range(1..pairs.len())) % pairs.len();
        if rng.gen_bool(0.7) {
            builder.push(S390::AXBR {
                dest: RegPair::new(virt(pairs[dest].0), virt(pairs[dest].1)),
                src: RegPair::new(virt(pairs[src].0), virt(pairs[src].1)),
            });
        } else {
            let half = if rng.gen_bool(0.5) {
                pairs[dest].0
            } else {
                pairs[dest].1
            };
            builder.push(S390::STD {
                src: virt(half),
                mem: base(ptr, 64),
            });
        }
    }
    builder.ret(None);
    builder.finish()
}

#[test]
#[traced_test]
fn should_keep_floating_point_pairs_legal_under_random_masks() {
    let mut rng = StdRng::seed_from_u64(0xa8b7);
    let float_pairs = PairPolicy::legal_pairs(RegClass::Fpr);
    for _ in 0..50 {
        let pair_count = rng.gen_range(2..=4);
        let mut allowed = vec![Reg::GPR2, Reg::GPR3, Reg::GPR4, Reg::GPR5];
        for (high, low) in float_pairs.choose_multiple(&mut rng, pair_count) {
            allowed.push(*high);
            allowed.push(*low);
        }
        let func = random_float_pair_program(&mut rng);
        let (assigned, frame) = assign(&func, only(&allowed));
        for instr in &assigned.body.instructions {
            let Instr::Machine(S390::AXBR { dest, src }) = instr else {
                continue;
            };
            for pair in [dest, src] {
                let (Register::Physical(high), Register::Physical(low)) = (pair.high, pair.low) else {
                    panic!("AXBR was not assigned: {assigned}");
                };
                assert!(
                    PairPolicy::is_legal_pair(high, low),
                    "{}:{} is not a legal pair: {assigned}",
                    high.name(),
                    low.name()
                );
            }
        }
        for reg in physical_registers(&assigned) {
            assert!(allowed.contains(&reg), "{} is locked: {assigned}", reg.name());
        }
        assert_eq!(frame.slots_in_use(), 0, "{assigned}");
        emulate(&func, &assigned, &[]);
    }
}

fn is_spill_store(instr: &Instr<Target>) -> bool {
    matches!(
        instr,
        Instr::Machine(S390::STG {
            mem: MemRef::Spill(_),
            ..
        })
    )
}

#[test]
#[traced_test]
fn should_store_values_spilled_after_the_merge_point_on_both_paths() {
    let mut builder = FunctionBuilder::<Target>::new("spilled_after_merge");
    let v = builder.vreg(RegClass::Gpr, Size::QWord);
    let w = builder.vreg(RegClass::Gpr, Size::QWord);
    let (a, b, c) = (
        builder.vreg(RegClass::Gpr, Size::QWord),
        builder.vreg(RegClass::Gpr, Size::QWord),
        builder.vreg(RegClass::Gpr, Size::QWord),
    );
    builder.push(S390::LGHI { dest: virt(v), imm: 1 });
    builder.push(S390::LGHI { dest: virt(w), imm: 2 });
    let section = builder.branch_to_cold();
    builder.push(S390::CGHI { lhs: virt(v), imm: 0 });
    let merge = builder.merge(section);
    builder.push(S390::LGHI { dest: virt(a), imm: 3 });
    builder.push(S390::LGHI { dest: virt(b), imm: 4 });
    builder.push(S390::LGHI { dest: virt(c), imm: 5 });
    builder.push(S390::AGR {
        dest: virt(a),
        src: virt(b),
    });
    builder.push(S390::AGR {
        dest: virt(a),
        src: virt(c),
    });
    builder.push(S390::CGHI { lhs: virt(a), imm: 0 });
    builder.push(S390::CGHI { lhs: virt(v), imm: 0 });
    builder.push(S390::CGHI { lhs: virt(w), imm: 0 });
    builder.ret(None);
    builder.switch_to_cold(section);
    builder.push(S390::CGHI { lhs: virt(v), imm: 1 });
    builder.return_to_merge(section);
    let func = builder.finish();
    let (assigned, frame) = assign(&func, only(&[Reg::GPR1, Reg::GPR2, Reg::GPR3]));
    let merge = assigned
        .body
        .instructions
        .iter()
        .position(|instr| *instr == func.body.instructions[merge])
        .unwrap();
    assert!(
        assigned
            .body
            .instructions
            .iter()
            .take(merge)
            .any(is_spill_store),
        "The hot path stores v before the merge point: {assigned}"
    );
    assert!(
        assigned.sections[section]
            .cold
            .instructions
            .iter()
            .any(is_spill_store),
        "The cold stream stores v before returning: {assigned}"
    );
    assert_eq!(frame.slots_in_use(), 0);
    emulate(&func, &assigned, &[]);
    emulate(&func, &assigned, &[section]);
}

#[test]
#[traced_test]
fn should_release_slots_of_values_spilled_inside_the_cold_stream() {
    let mut builder = FunctionBuilder::<Target>::new("spilled_in_cold");
    let v = builder.vreg(RegClass::Gpr, Size::QWord);
    let temps = (0..3)
        .map(|_| builder.vreg(RegClass::Gpr, Size::QWord))
        .collect::<Vec<_>>();
    builder.push(S390::LGHI { dest: virt(v), imm: 1 });
    let section = builder.branch_to_cold();
    builder.merge(section);
    builder.push(S390::CGHI { lhs: virt(v), imm: 0 });
    builder.ret(None);
    builder.switch_to_cold(section);
    for (imm, temp) in temps.iter().enumerate() {
        builder.push(S390::LGHI {
            dest: virt(*temp),
            imm: imm as i64,
        });
    }
    builder.push(S390::AGR {
        dest: virt(temps[0]),
        src: virt(temps[1]),
    });
    builder.push(S390::AGR {
        dest: virt(temps[0]),
        src: virt(temps[2]),
    });
    builder.push(S390::CGHI {
        lhs: virt(temps[0]),
        imm: 0,
    });
    builder.return_to_merge(section);
    let func = builder.finish();
    let (assigned, frame) = assign(&func, only(&[Reg::GPR1, Reg::GPR2, Reg::GPR3]));
    let cold = &assigned.sections[section].cold;
    let reloads = cold
        .instructions
        .iter()
        .filter(|instr| {
            matches!(
                instr,
                Instr::Machine(S390::LG {
                    mem: MemRef::Spill(_),
                    ..
                })
            )
        })
        .count();
    assert!(reloads > 0, "v is reloaded inside the cold stream: {assigned}");
    assert!(
        !assigned.body.instructions.iter().any(is_spill_store),
        "The mainline keeps v in a register: {assigned}"
    );
    assert_eq!(frame.slots_in_use(), 0);
    emulate(&func, &assigned, &[]);
    emulate(&func, &assigned, &[section]);
}
