//! Assembler and reversible instruction emulator for a grid-robot teaching game.
//!
//! Source text is assembled into fixed-width machine words, loaded into a
//! modeled processor with code, stack and data regions, and stepped forward or
//! backward one instruction at a time. Stores to the mailbox word drive the
//! robot; the emulator itself never interprets them.

pub mod machine;
pub mod types;
pub mod utils;
