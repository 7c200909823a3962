//! Execution engine.
//!
//! [`execute`] computes what one instruction does as a pure function of the
//! machine state; [`Emulator`] applies those [`Effects`], records the undo
//! information with the [`HistoryManager`] and drives the lifecycle state
//! machine. All arithmetic wraps at 32 bits.

use crate::machine::errors::{DecodeFaultReason, EmulatorError};
use crate::machine::history::{HistoryManager, StepRecord};
use crate::machine::isa::Instruction;
use crate::machine::memory::RegionKind;
use crate::machine::program::{Program, source_line};
use crate::machine::registers::{Flags, Register, RegisterFile};
use crate::machine::state::{
    EngineState, MachineSnapshot, MachineState, RunSummary, StepReport, StoreEvent,
};
use crate::machine::{
    CODE_BASE, DATA_BASE, MAILBOX_ADDR, MailboxCommand, REGION_SIZE, REGION_WORDS, STACK_TOP,
    WORD_SIZE, Word,
};

#[cfg(test)]
mod tests;

macro_rules! exec_vm {
    (
        exec = $exec:ident,
        instr = $instr:expr,
        { $( $variant:ident { $( $field:ident ),* } => $handler:ident ( $( $arg:expr ),* ) ),* $(,)? }
    ) => {
        match $instr {
            $(
                Instruction::$variant { $( $field ),* } => $exec.$handler( $( $arg ),* ),
            )*
        }
    };
}

/// Changes one instruction makes, computed without touching the machine.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Effects {
    /// Register writes in order; a later write to the same register wins.
    pub registers: Vec<(Register, u32)>,
    /// New flags, when the instruction sets them.
    pub flags: Option<Flags>,
    /// Program counter after the instruction.
    pub pc: u32,
    /// Bounds-checked stores, in order.
    pub stores: Vec<(u32, Vec<u8>)>,
    pub halted: bool,
}

#[derive(Debug, Clone, Copy)]
enum Shift {
    Lsl,
    Lsr,
    Asr,
}

/// Applies a shift and returns the result with the carry-out.
///
/// Only the low byte of `amount` counts. A zero amount keeps `carry`.
fn shift(kind: Shift, value: u32, amount: u32, carry: bool) -> (u32, bool) {
    let n = amount & 0xFF;
    if n == 0 {
        return (value, carry);
    }
    match kind {
        Shift::Lsl => match n {
            1..=31 => (value << n, (value >> (32 - n)) & 1 == 1),
            32 => (0, value & 1 == 1),
            _ => (0, false),
        },
        Shift::Lsr => match n {
            1..=31 => (value >> n, (value >> (n - 1)) & 1 == 1),
            32 => (0, value >> 31 == 1),
            _ => (0, false),
        },
        Shift::Asr => match n {
            1..=31 => (((value as i32) >> n) as u32, (value >> (n - 1)) & 1 == 1),
            _ => (((value as i32) >> 31) as u32, value >> 31 == 1),
        },
    }
}

/// Per-instruction view of the machine: reads live state, writes effects.
struct Exec<'m> {
    machine: &'m MachineState,
    effects: Effects,
}

impl Exec<'_> {
    fn reg(&self, reg: Register) -> u32 {
        self.machine.registers[reg]
    }

    fn flags(&self) -> Flags {
        self.machine.registers.flags
    }

    fn pc(&self) -> u32 {
        self.machine.registers.pc
    }

    fn set(&mut self, reg: Register, value: u32) {
        self.effects.registers.push((reg, value));
    }

    fn store(&mut self, addr: u32, bytes: &[u8]) -> Result<(), EmulatorError> {
        self.machine.memory.check_store(addr, bytes.len())?;
        self.effects.stores.push((addr, bytes.to_vec()));
        Ok(())
    }

    fn op_halt(&mut self) -> Result<(), EmulatorError> {
        self.effects.halted = true;
        self.effects.pc = self.pc();
        Ok(())
    }

    fn op_nop(&mut self) -> Result<(), EmulatorError> {
        Ok(())
    }

    fn op_mov(&mut self, rd: Register, value: u32) -> Result<(), EmulatorError> {
        self.set(rd, value);
        Ok(())
    }

    fn op_add(&mut self, rd: Register, a: u32, b: u32) -> Result<(), EmulatorError> {
        let (result, carry) = a.overflowing_add(b);
        self.set(rd, result);
        self.effects.flags = Some(Flags {
            n: result >> 31 == 1,
            z: result == 0,
            c: carry,
            v: ((a ^ result) & (b ^ result)) >> 31 == 1,
        });
        Ok(())
    }

    fn subtract(&mut self, a: u32, b: u32) -> u32 {
        let result = a.wrapping_sub(b);
        self.effects.flags = Some(Flags {
            n: result >> 31 == 1,
            z: result == 0,
            c: a >= b,
            v: ((a ^ b) & (a ^ result)) >> 31 == 1,
        });
        result
    }

    fn op_sub(&mut self, rd: Register, a: u32, b: u32) -> Result<(), EmulatorError> {
        let result = self.subtract(a, b);
        self.set(rd, result);
        Ok(())
    }

    fn op_cmp(&mut self, a: u32, b: u32) -> Result<(), EmulatorError> {
        self.subtract(a, b);
        Ok(())
    }

    /// Writes a result that only updates N and Z.
    fn op_logic(&mut self, rd: Register, result: u32) -> Result<(), EmulatorError> {
        self.set(rd, result);
        self.effects.flags = Some(self.flags().with_nz(result));
        Ok(())
    }

    fn op_shift(
        &mut self,
        rd: Register,
        kind: Shift,
        value: u32,
        amount: u32,
    ) -> Result<(), EmulatorError> {
        let flags = self.flags();
        let (result, carry) = shift(kind, value, amount, flags.c);
        self.set(rd, result);
        self.effects.flags = Some(Flags {
            c: carry,
            ..flags.with_nz(result)
        });
        Ok(())
    }

    fn op_load_word(&mut self, rd: Register, addr: u32) -> Result<(), EmulatorError> {
        let value = self.machine.memory.read_word(addr)?;
        self.set(rd, value);
        Ok(())
    }

    fn op_load_byte(&mut self, rd: Register, addr: u32) -> Result<(), EmulatorError> {
        let value = self.machine.memory.read_byte(addr)?;
        self.set(rd, u32::from(value));
        Ok(())
    }

    fn op_store_word(&mut self, addr: u32, value: u32) -> Result<(), EmulatorError> {
        self.store(addr, &value.to_le_bytes())
    }

    fn op_store_byte(&mut self, addr: u32, value: u32) -> Result<(), EmulatorError> {
        self.store(addr, &[value as u8])
    }

    fn op_push(&mut self, rd: Register) -> Result<(), EmulatorError> {
        let sp = self.reg(Register::SP).wrapping_sub(WORD_SIZE as u32);
        self.store(sp, &self.reg(rd).to_le_bytes())?;
        self.set(Register::SP, sp);
        Ok(())
    }

    fn op_pop(&mut self, rd: Register) -> Result<(), EmulatorError> {
        let sp = self.reg(Register::SP);
        let value = self.machine.memory.read_word(sp)?;
        self.set(Register::SP, sp.wrapping_add(WORD_SIZE as u32));
        self.set(rd, value);
        Ok(())
    }

    fn op_branch(&mut self, target: u32, taken: bool) -> Result<(), EmulatorError> {
        if taken {
            self.effects.pc = target;
        }
        Ok(())
    }

    fn op_call(&mut self, target: u32) -> Result<(), EmulatorError> {
        self.set(Register::LR, self.pc().wrapping_add(WORD_SIZE as u32));
        self.effects.pc = target;
        Ok(())
    }

    /// Movement instructions are ordinary word stores to the mailbox.
    fn op_move_robot(&mut self, command: MailboxCommand) -> Result<(), EmulatorError> {
        self.op_store_word(MAILBOX_ADDR, command.word())
    }
}

/// Computes the effects of `instr` against `machine`.
///
/// A memory access outside the regions (or a store into code) fails with
/// [`EmulatorError::MemoryFault`] and yields no effects.
pub fn execute(machine: &MachineState, instr: Instruction) -> Result<Effects, EmulatorError> {
    let mut x = Exec {
        machine,
        effects: Effects {
            pc: machine.registers.pc.wrapping_add(WORD_SIZE as u32),
            ..Effects::default()
        },
    };
    let flags = x.flags();

    let outcome = exec_vm! {
        exec = x,
        instr = instr,
        {
            // Control
            Halt {} => op_halt(),
            Nop {} => op_nop(),
            // Moves
            MovReg { rd, rm } => op_mov(rd, x.reg(rm)),
            MovImm { rd, imm } => op_mov(rd, imm as u32),
            MvnReg { rd, rm } => op_mov(rd, !x.reg(rm)),
            // Arithmetic
            AddReg { rd, rn, rm } => op_add(rd, x.reg(rn), x.reg(rm)),
            AddImm { rd, rn, imm } => op_add(rd, x.reg(rn), imm as u32),
            SubReg { rd, rn, rm } => op_sub(rd, x.reg(rn), x.reg(rm)),
            SubImm { rd, rn, imm } => op_sub(rd, x.reg(rn), imm as u32),
            Mul { rd, rn, rm } => op_logic(rd, x.reg(rn).wrapping_mul(x.reg(rm))),
            // Logic
            AndReg { rd, rn, rm } => op_logic(rd, x.reg(rn) & x.reg(rm)),
            AndImm { rd, rn, imm } => op_logic(rd, x.reg(rn) & imm as u32),
            OrrReg { rd, rn, rm } => op_logic(rd, x.reg(rn) | x.reg(rm)),
            OrrImm { rd, rn, imm } => op_logic(rd, x.reg(rn) | imm as u32),
            EorReg { rd, rn, rm } => op_logic(rd, x.reg(rn) ^ x.reg(rm)),
            EorImm { rd, rn, imm } => op_logic(rd, x.reg(rn) ^ imm as u32),
            // Shifts
            LslReg { rd, rn, rm } => op_shift(rd, Shift::Lsl, x.reg(rn), x.reg(rm)),
            LslImm { rd, rn, imm } => op_shift(rd, Shift::Lsl, x.reg(rn), u32::from(imm)),
            LsrReg { rd, rn, rm } => op_shift(rd, Shift::Lsr, x.reg(rn), x.reg(rm)),
            LsrImm { rd, rn, imm } => op_shift(rd, Shift::Lsr, x.reg(rn), u32::from(imm)),
            AsrReg { rd, rn, rm } => op_shift(rd, Shift::Asr, x.reg(rn), x.reg(rm)),
            AsrImm { rd, rn, imm } => op_shift(rd, Shift::Asr, x.reg(rn), u32::from(imm)),
            // Compare
            CmpReg { rn, rm } => op_cmp(x.reg(rn), x.reg(rm)),
            CmpImm { rn, imm } => op_cmp(x.reg(rn), imm as u32),
            // Load / store
            LdrOff { rd, rn, offset } => op_load_word(rd, x.reg(rn).wrapping_add(offset as u32)),
            LdrAbs { rd, addr } => op_load_word(rd, addr),
            StrOff { rd, rn, offset } => op_store_word(x.reg(rn).wrapping_add(offset as u32), x.reg(rd)),
            StrAbs { rd, addr } => op_store_word(addr, x.reg(rd)),
            LdrbOff { rd, rn, offset } => op_load_byte(rd, x.reg(rn).wrapping_add(offset as u32)),
            LdrbAbs { rd, addr } => op_load_byte(rd, addr),
            StrbOff { rd, rn, offset } => op_store_byte(x.reg(rn).wrapping_add(offset as u32), x.reg(rd)),
            StrbAbs { rd, addr } => op_store_byte(addr, x.reg(rd)),
            Push { rd } => op_push(rd),
            Pop { rd } => op_pop(rd),
            // Branches
            B { target } => op_branch(target, true),
            Beq { target } => op_branch(target, flags.z),
            Bne { target } => op_branch(target, !flags.z),
            Blt { target } => op_branch(target, flags.n != flags.v),
            Bge { target } => op_branch(target, flags.n == flags.v),
            Bgt { target } => op_branch(target, !flags.z && flags.n == flags.v),
            Ble { target } => op_branch(target, flags.z || flags.n != flags.v),
            Blo { target } => op_branch(target, !flags.c),
            Bhs { target } => op_branch(target, flags.c),
            Bl { target } => op_call(target),
            Bx { rn } => op_branch(x.reg(rn), true),
            Ret {} => op_branch(x.reg(Register::LR), true),
            // Movement
            Up {} => op_move_robot(MailboxCommand::Up),
            Down {} => op_move_robot(MailboxCommand::Down),
            Left {} => op_move_robot(MailboxCommand::Left),
            Right {} => op_move_robot(MailboxCommand::Right),
        }
    };
    outcome?;

    Ok(x.effects)
}

/// The reversible emulator: machine state, lifecycle and step history.
#[derive(Debug, Clone)]
pub struct Emulator {
    machine: MachineState,
    state: EngineState,
    history: HistoryManager,
    /// Number of loaded code words.
    code_len: usize,
    /// Source line of each loaded code word, when known.
    lines: Vec<u32>,
}

impl Emulator {
    /// Creates an emulator in `Uninitialized`.
    pub fn new() -> Self {
        Self {
            machine: MachineState::new(),
            state: EngineState::Uninitialized,
            history: HistoryManager::new(),
            code_len: 0,
            lines: Vec::new(),
        }
    }

    /// Same as [`reset`](Self::reset).
    pub fn initialize(&mut self) {
        self.reset();
    }

    /// Zeroes registers and memory, drops code and history, and enters `Ready`.
    pub fn reset(&mut self) {
        self.machine.clear();
        self.history.clear();
        self.code_len = 0;
        self.lines.clear();
        self.state = EngineState::Ready;
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    pub fn registers(&self) -> &RegisterFile {
        &self.machine.registers
    }

    pub fn history(&self) -> &HistoryManager {
        &self.history
    }

    /// Number of loaded code words.
    pub fn code_len(&self) -> usize {
        self.code_len
    }

    pub fn snapshot(&self) -> MachineSnapshot {
        MachineSnapshot::capture(self.state, &self.machine)
    }

    fn require_ready(&self) -> Result<(), EmulatorError> {
        match self.state {
            EngineState::Ready => Ok(()),
            state => Err(EmulatorError::NotReady { state }),
        }
    }

    /// Replaces the code region with `words` and sets the load-time `PC` and `SP`.
    ///
    /// Only allowed in `Ready`. Clears the step history.
    pub fn load_code(&mut self, words: &[Word]) -> Result<(), EmulatorError> {
        self.require_ready()?;
        if words.len() > REGION_WORDS {
            return Err(EmulatorError::ProgramTooLarge {
                words: words.len(),
                capacity: REGION_WORDS,
            });
        }

        let code = &mut self.machine.memory.region_mut(RegionKind::Code)[..];
        code.fill(0);
        for (slot, word) in code.chunks_exact_mut(WORD_SIZE).zip(words) {
            slot.copy_from_slice(&word.to_le_bytes());
        }

        self.machine.registers.pc = CODE_BASE;
        self.machine.registers[Register::SP] = STACK_TOP;
        self.history.clear();
        self.code_len = words.len();
        self.lines.clear();
        crate::debug!("loaded {} code words", words.len());
        Ok(())
    }

    /// Loads an assembled program: code words, line map and initial data image.
    pub fn load_program(&mut self, program: &Program) -> Result<(), EmulatorError> {
        self.require_ready()?;
        if program.data.len() > REGION_SIZE {
            return Err(EmulatorError::DataTooLarge {
                bytes: program.data.len(),
                capacity: REGION_SIZE,
            });
        }
        self.load_code(&program.code)?;
        self.machine.memory.write(DATA_BASE, &program.data)?;
        self.lines = program.lines.clone();
        Ok(())
    }

    /// Writes raw bytes, code region included. Only allowed in `Ready`; not undoable.
    pub fn write_memory(&mut self, addr: u32, bytes: &[u8]) -> Result<(), EmulatorError> {
        self.require_ready()?;
        self.machine.memory.write(addr, bytes)
    }

    /// Reads raw bytes in any state.
    pub fn read_memory(&self, addr: u32, len: usize) -> Result<Vec<u8>, EmulatorError> {
        Ok(self.machine.memory.read(addr, len)?.to_vec())
    }

    pub fn can_step_forward(&self) -> bool {
        self.state.can_step() && self.code_len > 0
    }

    pub fn can_step_back(&self) -> bool {
        self.can_rewind() && !self.history.is_empty()
    }

    fn can_rewind(&self) -> bool {
        matches!(
            self.state,
            EngineState::Ready | EngineState::Running | EngineState::Halted
        )
    }

    /// 1-based source line of the instruction at `pc`, when known.
    pub fn current_line(&self) -> Option<usize> {
        source_line(&self.lines, self.machine.registers.pc)
    }

    /// Snapshot plus instruction pointer for the current state.
    pub fn report(&self) -> StepReport {
        self.report_with(Vec::new())
    }

    fn report_with(&self, stores: Vec<StoreEvent>) -> StepReport {
        StepReport {
            snapshot: self.snapshot(),
            pc: self.machine.registers.pc,
            line: self.current_line(),
            stores,
        }
    }

    fn fault(&mut self, err: EmulatorError) -> EmulatorError {
        if err.is_fault() {
            crate::debug!("engine faulted: {err}");
            self.state = EngineState::Faulted;
        }
        err
    }

    fn fetch(&self, pc: u32) -> Result<Instruction, EmulatorError> {
        let decode_fault = |reason| EmulatorError::DecodeFault { pc, reason };
        let offset = pc
            .checked_sub(CODE_BASE)
            .filter(|&off| (off as usize) < self.code_len * WORD_SIZE)
            .ok_or(decode_fault(DecodeFaultReason::OutsideProgram))?;
        if offset as usize % WORD_SIZE != 0 {
            return Err(decode_fault(DecodeFaultReason::Misaligned));
        }
        let word = self.machine.memory.read_word(pc)?;
        Instruction::decode(word).map_err(decode_fault)
    }

    /// Executes one instruction.
    ///
    /// Faults move the engine to `Faulted`, leave the machine untouched and
    /// record nothing.
    pub fn step(&mut self) -> Result<StepReport, EmulatorError> {
        if !self.state.can_step() {
            return Err(EmulatorError::NotReady { state: self.state });
        }

        let instr = self
            .fetch(self.machine.registers.pc)
            .map_err(|e| self.fault(e))?;
        let effects = execute(&self.machine, instr).map_err(|e| self.fault(e))?;
        let record = StepRecord::capture(
            self.state,
            &self.machine,
            effects.registers.iter().map(|(reg, _)| *reg),
            effects.stores.iter().map(|(addr, bytes)| (*addr, bytes.len())),
        )
        .map_err(|e| self.fault(e))?;

        let Effects {
            registers,
            flags,
            pc,
            stores,
            halted,
        } = effects;
        for (addr, bytes) in &stores {
            self.machine.memory.write(*addr, bytes)?;
        }
        for (reg, value) in registers {
            self.machine.registers[reg] = value;
        }
        if let Some(flags) = flags {
            self.machine.registers.flags = flags;
        }
        self.machine.registers.pc = pc;

        self.history.record_step(record);
        self.state = if halted {
            EngineState::Halted
        } else {
            EngineState::Running
        };

        let stores = stores
            .into_iter()
            .map(|(addr, bytes)| StoreEvent { addr, bytes })
            .collect();
        Ok(self.report_with(stores))
    }

    /// Undoes the most recent step.
    ///
    /// Returns to the engine state the step started from.
    pub fn step_back(&mut self) -> Result<StepReport, EmulatorError> {
        if !self.can_rewind() {
            return Err(EmulatorError::NotReady { state: self.state });
        }
        self.state = self.history.undo(&mut self.machine)?;
        Ok(self.report())
    }

    /// Undoes every recorded step, returning how many were undone.
    ///
    /// The loaded code is kept; registers and memory return to their
    /// load-time values.
    pub fn replay_to_start(&mut self) -> Result<(usize, StepReport), EmulatorError> {
        if !self.can_rewind() {
            return Err(EmulatorError::NotReady { state: self.state });
        }
        let mut undone = 0;
        while !self.history.is_empty() {
            self.state = self.history.undo(&mut self.machine)?;
            undone += 1;
        }
        Ok((undone, self.report()))
    }

    /// Steps until halt or until `max_steps` steps have run.
    pub fn run(&mut self, max_steps: u64) -> Result<RunSummary, EmulatorError> {
        if !self.state.can_step() {
            return Err(EmulatorError::NotReady { state: self.state });
        }
        let mut summary = RunSummary {
            steps: 0,
            halted: false,
            stores: Vec::new(),
        };
        while summary.steps < max_steps && self.state != EngineState::Halted {
            let report = self.step()?;
            summary.steps += 1;
            summary.stores.extend(report.stores);
        }
        summary.halted = self.state == EngineState::Halted;
        Ok(summary)
    }
}

impl Default for Emulator {
    fn default() -> Self {
        Self::new()
    }
}
