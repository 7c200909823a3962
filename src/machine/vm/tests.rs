use super::*;
use crate::machine::assembler::assemble;
use crate::machine::errors::{Access, AsmErrorKind};
use crate::machine::isa::Opcode;
use crate::machine::{STACK_BASE, STACK_TOP};
use crate::utils::test_utils::utils::{loaded, r, run_to_halt};
use std::collections::HashSet;

#[test]
fn new_emulator_is_uninitialized() {
    let mut emu = Emulator::new();
    assert_eq!(emu.state(), EngineState::Uninitialized);
    assert_eq!(
        emu.step(),
        Err(EmulatorError::NotReady {
            state: EngineState::Uninitialized
        })
    );
    assert_eq!(
        emu.load_code(&[0]),
        Err(EmulatorError::NotReady {
            state: EngineState::Uninitialized
        })
    );
    emu.initialize();
    assert_eq!(emu.state(), EngineState::Ready);
}

#[test]
fn mov_then_store_to_mailbox() {
    let mut emu = loaded("MOV R0, #4\nSTR R0, [#0x30000]\n");
    assert_eq!(emu.code_len(), 2);
    assert_eq!(emu.registers().pc, CODE_BASE);
    assert_eq!(emu.registers()[Register::SP], STACK_TOP);

    emu.step().unwrap();
    let report = emu.step().unwrap();

    assert_eq!(report.snapshot.data[0], 4);
    assert_eq!(report.snapshot.mailbox(), 4);
    assert_eq!(report.snapshot.registers[r(0)], 4);
    assert_eq!(report.stores.len(), 1);
    assert_eq!(
        report.stores[0].mailbox_command(),
        Some(MailboxCommand::Right)
    );
    assert_eq!(emu.state(), EngineState::Running);
}

#[test]
fn mailbox_write_twice_is_two_events() {
    let mut emu = loaded("MOV R0, #4\nSTR R0, [#0x30000]\nSTR R0, [#0x30000]\nHALT\n");
    let summary = run_to_halt(&mut emu, 10);
    assert_eq!(summary.steps, 4);
    assert_eq!(summary.stores.len(), 2);
    let commands: Vec<_> = summary.commands().collect();
    assert_eq!(commands, vec![MailboxCommand::Right, MailboxCommand::Right]);
}

#[test]
fn movement_instructions_store_commands() {
    let mut emu = loaded("UP\nDOWN\nLEFT\nRIGHT\nRIGHT\nHALT\n");
    let summary = run_to_halt(&mut emu, 10);
    let commands: Vec<_> = summary.commands().collect();
    assert_eq!(
        commands,
        vec![
            MailboxCommand::Up,
            MailboxCommand::Down,
            MailboxCommand::Left,
            MailboxCommand::Right,
            MailboxCommand::Right,
        ]
    );
    assert_eq!(emu.snapshot().mailbox(), MailboxCommand::Right.word());
}

#[test]
fn branch_to_undefined_label_produces_nothing() {
    let err = assemble("MOV R0, #1\nB missing\nHALT\n").unwrap_err();
    assert_eq!(err.kind, AsmErrorKind::UnresolvedSymbol);
    assert!(err.message.contains("missing"));
}

#[test]
fn step_back_on_fresh_engine() {
    let mut emu = Emulator::new();
    emu.reset();
    let before = emu.snapshot();
    assert_eq!(emu.step_back(), Err(EmulatorError::NothingToUndo));
    assert_eq!(emu.snapshot(), before);
    assert!(!emu.can_step_back());
}

#[test]
fn reset_is_idempotent() {
    let mut emu = loaded("MOV R0, #1\nUP\nHALT\n");
    run_to_halt(&mut emu, 10);

    emu.reset();
    let once = emu.snapshot();
    emu.reset();
    assert_eq!(emu.snapshot(), once);
    assert_eq!(emu.code_len(), 0);
    assert!(emu.history().is_empty());
}

#[test]
fn assembly_is_deterministic() {
    let source = "start: MOV R0, #3\nloop: SUB R0, R0, #1\nCMP R0, #0\nBNE loop\nHALT\n";
    assert_eq!(assemble(source).unwrap().code, assemble(source).unwrap().code);
}

const ROUND_TRIP: &str = "\
        .data
steps:  .word 0
path:   .byte 1, 1, 4, 2
        .text
        MOV R4, #0
        MOV R5, #path
walk:   LDRB R0, [R5]
        BL emit
        ADD R5, R5, #1
        ADD R4, R4, #1
        CMP R4, #4
        BLT walk
        STR R4, [steps]
        HALT

emit:   PUSH LR
        PUSH R0
        STR R0, [MAILBOX]
        POP R0
        POP LR
        RET
";

#[test]
fn replay_to_start_restores_load_state() {
    let mut emu = loaded(ROUND_TRIP);
    let at_load = emu.snapshot();

    let summary = run_to_halt(&mut emu, 200);
    let commands: Vec<_> = summary.commands().collect();
    assert_eq!(
        commands,
        vec![
            MailboxCommand::Up,
            MailboxCommand::Up,
            MailboxCommand::Right,
            MailboxCommand::Down,
        ]
    );
    let steps_addr = assemble(ROUND_TRIP).unwrap().symbol("steps").unwrap();
    assert_eq!(emu.read_memory(steps_addr, 4).unwrap(), 4u32.to_le_bytes());
    assert_eq!(emu.registers()[Register::SP], STACK_TOP);

    let (undone, report) = emu.replay_to_start().unwrap();
    assert_eq!(undone as u64, summary.steps);
    assert_eq!(report.snapshot, at_load);
    assert_eq!(emu.snapshot(), at_load);
    assert_eq!(emu.state(), EngineState::Ready);
    assert!(!emu.can_step_back());
}

#[test]
fn replay_then_rerun_is_identical() {
    let mut emu = loaded(ROUND_TRIP);
    let first = run_to_halt(&mut emu, 200);
    let end = emu.snapshot();
    emu.replay_to_start().unwrap();
    let second = run_to_halt(&mut emu, 200);
    assert_eq!(first, second);
    assert_eq!(emu.snapshot(), end);
}

#[test]
fn replay_at_start_is_noop() {
    let mut emu = loaded("HALT\n");
    let before = emu.snapshot();
    let (undone, _) = emu.replay_to_start().unwrap();
    assert_eq!(undone, 0);
    assert_eq!(emu.snapshot(), before);
}

const PREAMBLE: &str = "\
start:  MOV R1, #5
        MOV R2, #-3
        MOV R3, #0x30008
        MOV LR, #0x10000
        PUSH R1
        CMP R1, R2
";
const PREAMBLE_STEPS: usize = 6;

/// One sample per opcode.
const SAMPLES: &[&str] = &[
    "HALT",
    "NOP",
    "MOV R0, R1",
    "MOV R0, #7",
    "MVN R0, R1",
    "ADD R0, R1, R2",
    "ADD R0, R1, #1",
    "SUB R0, R1, R2",
    "SUB R0, R1, #1",
    "MUL R0, R1, R2",
    "AND R0, R1, R2",
    "AND R0, R1, #6",
    "ORR R0, R1, R2",
    "ORR R0, R1, #6",
    "EOR R0, R1, R2",
    "EOR R0, R1, #6",
    "LSL R0, R1, R2",
    "LSL R0, R1, #2",
    "LSR R0, R2, R1",
    "LSR R0, R2, #1",
    "ASR R0, R2, R1",
    "ASR R0, R2, #1",
    "CMP R1, R2",
    "CMP R1, #5",
    "LDR R0, [R3]",
    "LDR R0, [#0x30000]",
    "STR R1, [R3, #4]",
    "STR R1, [#0x30010]",
    "LDRB R0, [R3, #1]",
    "LDRB R0, [#0x30001]",
    "STRB R1, [R3, #-1]",
    "STRB R1, [#0x30020]",
    "PUSH R2",
    "POP R0",
    "B start",
    "BEQ start",
    "BNE start",
    "BLT start",
    "BGE start",
    "BGT start",
    "BLE start",
    "BLO start",
    "BHS start",
    "BL start",
    "BX LR",
    "RET",
    "UP",
    "DOWN",
    "LEFT",
    "RIGHT",
];

#[test]
fn every_instruction_steps_back_exactly() {
    let mut covered = HashSet::new();

    for sample in SAMPLES {
        let mut emu = loaded(&format!("{PREAMBLE}        {sample}\n"));
        for _ in 0..PREAMBLE_STEPS {
            emu.step().unwrap();
        }
        let word = emu.read_memory(emu.registers().pc, 4).unwrap();
        let instr = Instruction::decode(u32::from_le_bytes(word.try_into().unwrap())).unwrap();
        covered.insert(instr.opcode());

        let before = emu.snapshot();
        emu.step().unwrap_or_else(|e| panic!("`{sample}` faulted: {e}"));
        emu.step_back().unwrap();
        assert_eq!(emu.snapshot(), before, "`{sample}` did not step back exactly");
    }

    let all: HashSet<Opcode> = Opcode::ALL.iter().copied().collect();
    assert_eq!(covered, all);
}

#[test]
fn add_and_sub_flags() {
    let mut emu = loaded(
        "MOV R1, #1\nLSL R1, R1, #31\nSUB R2, R1, #1\nADD R3, R2, #1\nADD R4, R1, R1\nHALT\n",
    );
    emu.step().unwrap();
    emu.step().unwrap();
    assert_eq!(emu.registers()[r(1)], 0x8000_0000);
    assert_eq!(emu.registers().flags.to_string(), "N---");

    emu.step().unwrap();
    assert_eq!(emu.registers()[r(2)], 0x7FFF_FFFF);
    assert_eq!(emu.registers().flags.to_string(), "--CV");

    emu.step().unwrap();
    assert_eq!(emu.registers()[r(3)], 0x8000_0000);
    assert_eq!(emu.registers().flags.to_string(), "N--V");

    emu.step().unwrap();
    assert_eq!(emu.registers()[r(4)], 0);
    assert_eq!(emu.registers().flags.to_string(), "-ZCV");
}

#[test]
fn compare_borrow_and_unsigned_branches() {
    let mut emu = loaded(
        "\
        MOV R0, #1
        CMP R0, #2
        BLO lower
        MOV R1, #99
lower:  MOV R2, #-1
        CMP R2, R0
        BHS done
        MOV R1, #98
done:   HALT
",
    );
    run_to_halt(&mut emu, 20);
    assert_eq!(emu.registers()[r(1)], 0);
    assert!(emu.registers().flags.c);
}

#[test]
fn shifts_set_carry_from_last_bit_out() {
    let mut emu = loaded("MOV R0, #3\nLSR R1, R0, #1\nMOV R2, #-8\nASR R3, R2, #2\nLSL R4, R0, #0\nHALT\n");
    emu.step().unwrap();
    emu.step().unwrap();
    assert_eq!(emu.registers()[r(1)], 1);
    assert!(emu.registers().flags.c);
    emu.step().unwrap();
    emu.step().unwrap();
    assert_eq!(emu.registers()[r(3)], (-2i32) as u32);
    assert!(!emu.registers().flags.c);
    assert!(emu.registers().flags.n);
    emu.step().unwrap();
    assert_eq!(emu.registers()[r(4)], 3);
    assert!(!emu.registers().flags.c);
}

#[test]
fn mov_leaves_flags() {
    let mut emu = loaded("CMP R0, #0\nMOV R1, #5\nMVN R2, R1\nHALT\n");
    emu.step().unwrap();
    let flags = emu.registers().flags;
    assert!(flags.z);
    emu.step().unwrap();
    emu.step().unwrap();
    assert_eq!(emu.registers().flags, flags);
    assert_eq!(emu.registers()[r(2)], !5u32);
}

#[test]
fn counting_loop() {
    let mut emu = loaded(
        "\
        MOV R0, #0
loop:   ADD R0, R0, #1
        CMP R0, #5
        BLT loop
        HALT
",
    );
    let summary = run_to_halt(&mut emu, 100);
    assert_eq!(emu.registers()[r(0)], 5);
    assert_eq!(summary.steps, 1 + 5 * 3 + 1);
}

#[test]
fn call_and_return_through_stack() {
    let mut emu = loaded(
        "\
        MOV R0, #1
        BL func
        UP
        HALT
func:   PUSH LR
        ADD R0, R0, #1
        POP LR
        RET
",
    );
    let summary = run_to_halt(&mut emu, 20);
    assert_eq!(emu.registers()[r(0)], 2);
    assert_eq!(emu.registers()[Register::SP], STACK_TOP);
    assert_eq!(emu.registers()[Register::LR], CODE_BASE + 8);
    assert_eq!(summary.commands().collect::<Vec<_>>(), vec![MailboxCommand::Up]);
}

#[test]
fn halt_keeps_pc_and_blocks_stepping() {
    let mut emu = loaded("NOP\nHALT\n");
    run_to_halt(&mut emu, 10);
    assert_eq!(emu.registers().pc, CODE_BASE + 4);
    assert_eq!(emu.state(), EngineState::Halted);
    assert!(!emu.can_step_forward());
    assert_eq!(
        emu.step(),
        Err(EmulatorError::NotReady {
            state: EngineState::Halted
        })
    );

    assert!(emu.can_step_back());
    emu.step_back().unwrap();
    assert_eq!(emu.state(), EngineState::Running);
    assert_eq!(emu.registers().pc, CODE_BASE + 4);
}

#[test]
fn run_respects_step_budget() {
    let mut emu = loaded("loop: B loop\n");
    let summary = emu.run(100).unwrap();
    assert_eq!(summary.steps, 100);
    assert!(!summary.halted);
    assert_eq!(emu.history().len(), 100);
    assert_eq!(emu.state(), EngineState::Running);
}

#[test]
fn store_outside_regions_faults_without_mutation() {
    for target in ["0x31000", "0x30FFE", "0x10000", "0x0"] {
        let mut emu = loaded(&format!("MOV R0, #-1\nSTR R0, [#{target}]\nHALT\n"));
        emu.step().unwrap();
        let before = emu.snapshot();

        let err = emu.step().unwrap_err();
        assert!(
            matches!(
                err,
                EmulatorError::MemoryFault {
                    access: Access::Write,
                    ..
                }
            ),
            "{target}: {err:?}"
        );
        assert_eq!(emu.state(), EngineState::Faulted);
        let after = emu.snapshot();
        assert_eq!(after.registers, before.registers);
        assert_eq!(after.code, before.code);
        assert_eq!(after.stack, before.stack);
        assert_eq!(after.data, before.data);
        assert_eq!(emu.history().len(), 1);
    }
}

#[test]
fn load_outside_regions_faults() {
    let mut emu = loaded("MOV R1, #0x21000\nLDR R0, [R1]\n");
    emu.step().unwrap();
    assert_eq!(
        emu.step(),
        Err(EmulatorError::MemoryFault {
            addr: STACK_TOP,
            len: 4,
            access: Access::Read
        })
    );
}

#[test]
fn pop_from_empty_stack_faults() {
    let mut emu = loaded("POP R0\n");
    assert!(matches!(emu.step(), Err(EmulatorError::MemoryFault { .. })));
}

#[test]
fn push_below_stack_faults() {
    let mut emu = loaded("MOV SP, #0x20000\nPUSH R0\n");
    emu.step().unwrap();
    assert!(matches!(
        emu.step(),
        Err(EmulatorError::MemoryFault {
            addr,
            access: Access::Write,
            ..
        }) if addr == STACK_BASE - 4
    ));
}

#[test]
fn faulted_engine_needs_reset() {
    let mut emu = loaded("STR R0, [#0x10000]\n");
    assert!(emu.step().is_err());
    assert!(!emu.can_step_forward());
    assert!(!emu.can_step_back());
    assert_eq!(
        emu.step_back(),
        Err(EmulatorError::NotReady {
            state: EngineState::Faulted
        })
    );
    assert!(emu.replay_to_start().is_err());

    // last valid state stays queryable
    assert_eq!(emu.registers().pc, CODE_BASE);

    emu.reset();
    assert_eq!(emu.state(), EngineState::Ready);
}

#[test]
fn running_past_loaded_code_is_decode_fault() {
    let mut emu = loaded("NOP\n");
    emu.step().unwrap();
    assert_eq!(
        emu.step(),
        Err(EmulatorError::DecodeFault {
            pc: CODE_BASE + 4,
            reason: DecodeFaultReason::OutsideProgram
        })
    );
    assert_eq!(emu.state(), EngineState::Faulted);
    assert_eq!(emu.history().len(), 1);
}

#[test]
fn misaligned_branch_target_is_decode_fault() {
    let mut emu = loaded("B 0x10002\nNOP\n");
    emu.step().unwrap();
    assert_eq!(
        emu.step(),
        Err(EmulatorError::DecodeFault {
            pc: CODE_BASE + 2,
            reason: DecodeFaultReason::Misaligned
        })
    );
}

#[test]
fn unknown_opcode_is_decode_fault() {
    let mut emu = Emulator::new();
    emu.reset();
    emu.load_code(&[0xEE00_0000]).unwrap();
    assert_eq!(
        emu.step(),
        Err(EmulatorError::DecodeFault {
            pc: CODE_BASE,
            reason: DecodeFaultReason::UnknownOpcode { opcode: 0xEE }
        })
    );
}

#[test]
fn empty_code_cannot_step() {
    let mut emu = Emulator::new();
    emu.reset();
    assert!(!emu.can_step_forward());
    assert!(matches!(
        emu.step(),
        Err(EmulatorError::DecodeFault {
            reason: DecodeFaultReason::OutsideProgram,
            ..
        })
    ));
}

#[test]
fn load_code_rules() {
    let mut emu = Emulator::new();
    emu.reset();
    let too_big = vec![0u32; REGION_WORDS + 1];
    assert_eq!(
        emu.load_code(&too_big),
        Err(EmulatorError::ProgramTooLarge {
            words: REGION_WORDS + 1,
            capacity: REGION_WORDS
        })
    );
    assert_eq!(emu.code_len(), 0);
    assert!(emu.snapshot().code.iter().all(|&b| b == 0));

    emu.load_code(&[0x0100_0000, 0]).unwrap();
    assert_eq!(emu.read_memory(CODE_BASE, 4).unwrap(), vec![0, 0, 0, 1]);
    emu.step().unwrap();
    assert_eq!(
        emu.load_code(&[0]),
        Err(EmulatorError::NotReady {
            state: EngineState::Running
        })
    );
}

#[test]
fn oversized_data_image_is_rejected_before_loading() {
    let mut emu = Emulator::new();
    emu.reset();
    let program = Program {
        code: vec![0x0100_0000, 0],
        data: vec![7; REGION_SIZE + 1],
        ..Program::default()
    };
    let err = emu.load_program(&program).unwrap_err();
    assert_eq!(
        err,
        EmulatorError::DataTooLarge {
            bytes: REGION_SIZE + 1,
            capacity: REGION_SIZE
        }
    );
    assert!(!err.is_fault());
    assert_eq!(emu.state(), EngineState::Ready);
    assert_eq!(emu.code_len(), 0);
    assert_eq!(emu.read_memory(DATA_BASE, 1).unwrap(), vec![0]);
}

#[test]
fn write_memory_preseeds_data() {
    let mut emu = loaded("LDR R0, [#0x30100]\nHALT\n");
    emu.write_memory(DATA_BASE + 0x100, &42u32.to_le_bytes()).unwrap();
    run_to_halt(&mut emu, 10);
    assert_eq!(emu.registers()[r(0)], 42);
    assert_eq!(
        emu.write_memory(DATA_BASE, &[1]),
        Err(EmulatorError::NotReady {
            state: EngineState::Halted
        })
    );
    assert!(emu.read_memory(DATA_BASE + REGION_SIZE as u32, 1).is_err());
}

#[test]
fn load_through_label_above_word() {
    let mut emu = loaded(".data\nflag: .byte 1\ncount:\n.word 5\n.text\nLDR R0, [count]\nHALT\n");
    run_to_halt(&mut emu, 10);
    assert_eq!(emu.registers()[r(0)], 5);
}

#[test]
fn program_data_image_is_loaded() {
    let emu = loaded(".data\nmsg: .ascii \"go\"\n.text\nHALT\n");
    assert_eq!(emu.read_memory(DATA_BASE + 4, 2).unwrap(), b"go");
}

#[test]
fn report_tracks_source_line() {
    let mut emu = loaded("; header\nMOV R0, #1\n\nADD R0, R0, #1\nHALT\n");
    assert_eq!(emu.current_line(), Some(2));
    let report = emu.step().unwrap();
    assert_eq!(report.pc, CODE_BASE + 4);
    assert_eq!(report.line, Some(4));
    let report = emu.step_back().unwrap();
    assert_eq!(report.line, Some(2));
    assert!(report.stores.is_empty());
}

#[test]
fn step_predicates_follow_history() {
    let mut emu = loaded("NOP\nNOP\nHALT\n");
    assert!(emu.can_step_forward());
    assert!(!emu.can_step_back());
    emu.step().unwrap();
    assert!(emu.can_step_back());
    emu.step_back().unwrap();
    assert_eq!(emu.state(), EngineState::Ready);
    assert!(!emu.can_step_back());
}

#[test]
fn execute_is_pure() {
    let machine = MachineState::new();
    let instr = Instruction::StrAbs {
        rd: r(0),
        addr: MAILBOX_ADDR,
    };
    let effects = execute(&machine, instr).unwrap();
    assert_eq!(effects.stores, vec![(MAILBOX_ADDR, vec![0, 0, 0, 0])]);
    assert_eq!(effects.pc, 4);
    assert!(effects.registers.is_empty());
    assert_eq!(machine, MachineState::new());

    let fault = execute(&machine, Instruction::Pop { rd: r(0) });
    assert!(matches!(fault, Err(EmulatorError::MemoryFault { .. })));
}

#[test]
fn square_demo_walks_twelve_cells() {
    let source = include_str!("../../../demos/square.asm");
    let mut emu = loaded(source);
    let summary = run_to_halt(&mut emu, 1_000);

    let commands: Vec<_> = summary.commands().collect();
    assert_eq!(commands.len(), 12);
    assert!(commands[..3].iter().all(|&c| c == MailboxCommand::Up));
    assert!(commands[9..].iter().all(|&c| c == MailboxCommand::Left));

    let moves = assemble(source).unwrap().symbol("moves").unwrap();
    assert_eq!(emu.read_memory(moves, 4).unwrap(), 12u32.to_le_bytes());
}
