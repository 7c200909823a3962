//! Assembler and reversible emulator for the robot processor.
//!
//! # Architecture
//!
//! - **Registers**: `R0`..`R12`, `SP` (`R13`), `LR` (`R14`), plus `PC` and `NZCV` flags
//! - **Memory**: three fixed 4 KiB regions (code, stack, data), byte addressable,
//!   every access bounds-checked against a single region
//! - **Instruction format**: one little-endian 32-bit word per instruction
//!   (`[31:24] opcode | [23:20] Rd | [19:16] Rn | [15:0] imm16`)
//! - **Reversibility**: every step records the registers and bytes it overwrote,
//!   so execution can be walked back to the load-time state
//!
//! # Modules
//!
//! - [`assembler`]: two-pass source to [`program::Program`] translation and diagnostics
//! - [`errors`]: assembly and execution error types
//! - [`isa`]: instruction table, encoding, decoding and disassembly
//! - [`program`]: assembled program and its binary image format
//! - [`registers`] / [`memory`] / [`state`]: machine state and snapshots
//! - [`history`]: step records for stepping backward
//! - [`vm`]: the execution engine
//! - [`worker`]: the engine hosted on a tokio task behind a request channel

pub mod assembler;
pub mod errors;
pub mod history;
pub mod isa;
#[cfg(test)]
mod isa_static_check;
pub mod memory;
pub mod program;
pub mod registers;
pub mod state;
pub mod vm;
pub mod worker;

/// A machine word.
pub type Word = u32;

/// Width of a machine word in bytes.
pub const WORD_SIZE: usize = 4;

/// Number of words in each memory region.
pub const REGION_WORDS: usize = 1024;

/// Size of each memory region in bytes.
pub const REGION_SIZE: usize = REGION_WORDS * WORD_SIZE;

/// Base address of the code region.
pub const CODE_BASE: u32 = 0x0001_0000;

/// Base address of the stack region.
pub const STACK_BASE: u32 = 0x0002_0000;

/// Base address of the data region.
pub const DATA_BASE: u32 = 0x0003_0000;

/// Initial stack pointer; the stack grows downward from the top of its region.
pub const STACK_TOP: u32 = STACK_BASE + REGION_SIZE as u32;

/// Address of the actuator mailbox word (first word of the data region).
pub const MAILBOX_ADDR: u32 = DATA_BASE;

/// Movement command published through the mailbox.
///
/// The emulator never interprets mailbox stores; this mapping is the contract
/// with whatever drives the robot.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MailboxCommand {
    Up = 1,
    Down = 2,
    Left = 3,
    Right = 4,
}

impl MailboxCommand {
    /// Interprets a word stored to the mailbox.
    pub fn from_word(word: Word) -> Option<Self> {
        match word {
            1 => Some(Self::Up),
            2 => Some(Self::Down),
            3 => Some(Self::Left),
            4 => Some(Self::Right),
            _ => None,
        }
    }

    pub const fn word(self) -> Word {
        self as Word
    }
}

impl std::fmt::Display for MailboxCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Up => "up",
            Self::Down => "down",
            Self::Left => "left",
            Self::Right => "right",
        })
    }
}
