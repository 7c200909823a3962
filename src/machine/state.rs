//! Engine lifecycle, live machine state, and the copies handed to observers.

use crate::machine::memory::{Memory, RegionKind};
use crate::machine::registers::RegisterFile;
use crate::machine::{MAILBOX_ADDR, MailboxCommand, WORD_SIZE, Word};
use std::fmt;

/// Lifecycle state of the execution engine.
///
/// `Uninitialized -> Ready -> Running -> Halted`, with `Faulted` reachable
/// from any stepping state and left only through a reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Uninitialized,
    Ready,
    Running,
    Halted,
    Faulted,
}

impl EngineState {
    /// Whether `step` is allowed.
    pub fn can_step(self) -> bool {
        matches!(self, Self::Ready | Self::Running)
    }
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Uninitialized => "uninitialized",
            Self::Ready => "ready",
            Self::Running => "running",
            Self::Halted => "halted",
            Self::Faulted => "faulted",
        })
    }
}

/// Registers and memory mutated by the execution engine.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MachineState {
    pub registers: RegisterFile,
    pub memory: Memory,
}

impl MachineState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Zeroes registers and all memory regions.
    pub fn clear(&mut self) {
        self.registers = RegisterFile::new();
        self.memory.clear();
    }
}

/// An independent copy of the register file and all three regions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MachineSnapshot {
    pub state: EngineState,
    pub registers: RegisterFile,
    pub code: Vec<u8>,
    pub stack: Vec<u8>,
    pub data: Vec<u8>,
}

impl MachineSnapshot {
    pub(crate) fn capture(state: EngineState, machine: &MachineState) -> Self {
        let copy = |kind| machine.memory.region(kind).as_slice().to_vec();
        Self {
            state,
            registers: machine.registers.clone(),
            code: copy(RegionKind::Code),
            stack: copy(RegionKind::Stack),
            data: copy(RegionKind::Data),
        }
    }

    pub fn pc(&self) -> u32 {
        self.registers.pc
    }

    pub fn region(&self, kind: RegionKind) -> &[u8] {
        match kind {
            RegionKind::Code => &self.code,
            RegionKind::Stack => &self.stack,
            RegionKind::Data => &self.data,
        }
    }

    /// Current value of the mailbox word.
    pub fn mailbox(&self) -> Word {
        let mut raw = [0u8; WORD_SIZE];
        raw.copy_from_slice(&self.data[..WORD_SIZE]);
        Word::from_le_bytes(raw)
    }
}

/// Bytes written to memory by one executed instruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreEvent {
    pub addr: u32,
    pub bytes: Vec<u8>,
}

impl StoreEvent {
    /// The movement command, when this is a word store of 1..=4 to the mailbox.
    pub fn mailbox_command(&self) -> Option<MailboxCommand> {
        if self.addr != MAILBOX_ADDR {
            return None;
        }
        let raw: [u8; WORD_SIZE] = self.bytes.as_slice().try_into().ok()?;
        MailboxCommand::from_word(Word::from_le_bytes(raw))
    }
}

/// What observers see after a debugging control: the new snapshot, the
/// instruction pointer with its source line, and any stores performed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepReport {
    pub snapshot: MachineSnapshot,
    pub pc: u32,
    /// 1-based source line of the instruction at `pc`, when known.
    pub line: Option<usize>,
    pub stores: Vec<StoreEvent>,
}

/// Result of running until halt or a step budget.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub steps: u64,
    pub halted: bool,
    pub stores: Vec<StoreEvent>,
}

impl RunSummary {
    /// Movement commands in the order they were written.
    pub fn commands(&self) -> impl Iterator<Item = MailboxCommand> + '_ {
        self.stores.iter().filter_map(StoreEvent::mailbox_command)
    }
}
