//! Step records for walking execution backward.
//!
//! Each executed instruction leaves one [`StepRecord`] holding only what it
//! overwrote: the program counter, the flags, the registers it wrote and the
//! memory bytes it stored over. Records live in an arena indexed by step
//! sequence number, newest last.

use crate::machine::errors::EmulatorError;
use crate::machine::registers::{Flags, Register};
use crate::machine::state::{EngineState, MachineState};

/// What one step changed, as it was before the step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepRecord {
    /// Engine state to resume in when this step is undone.
    pub prior: EngineState,
    pub pc: u32,
    pub flags: Flags,
    /// Prior values of the registers the step wrote.
    pub registers: Vec<(Register, u32)>,
    /// Prior contents of the byte ranges the step stored to.
    pub memory: Vec<(u32, Vec<u8>)>,
}

impl StepRecord {
    /// Captures the prior values of `registers` and of the `len`-byte ranges
    /// at each store address, before the step is applied.
    pub fn capture(
        prior: EngineState,
        machine: &MachineState,
        registers: impl IntoIterator<Item = Register>,
        stores: impl IntoIterator<Item = (u32, usize)>,
    ) -> Result<Self, EmulatorError> {
        let memory = stores
            .into_iter()
            .map(|(addr, len)| Ok((addr, machine.memory.read(addr, len)?.to_vec())))
            .collect::<Result<Vec<_>, EmulatorError>>()?;
        Ok(Self {
            prior,
            pc: machine.registers.pc,
            flags: machine.registers.flags,
            registers: registers
                .into_iter()
                .map(|reg| (reg, machine.registers[reg]))
                .collect(),
            memory,
        })
    }

    /// Writes the captured values back.
    fn restore(&self, machine: &mut MachineState) -> Result<(), EmulatorError> {
        for (addr, bytes) in self.memory.iter().rev() {
            machine.memory.write(*addr, bytes)?;
        }
        for (reg, value) in self.registers.iter().rev() {
            machine.registers[*reg] = *value;
        }
        machine.registers.pc = self.pc;
        machine.registers.flags = self.flags;
        Ok(())
    }
}

/// Arena of step records, one per executed step since the last load.
#[derive(Debug, Clone, Default)]
pub struct HistoryManager {
    records: Vec<StepRecord>,
}

impl HistoryManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a record and returns its sequence index.
    pub fn record_step(&mut self, record: StepRecord) -> usize {
        self.records.push(record);
        self.records.len() - 1
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn clear(&mut self) {
        self.records.clear();
    }

    /// Pops the newest record and restores what it captured.
    ///
    /// Returns the engine state to resume in. The record stays in place if
    /// restoring fails.
    pub fn undo(&mut self, machine: &mut MachineState) -> Result<EngineState, EmulatorError> {
        let record = self.records.last().ok_or(EmulatorError::NothingToUndo)?;
        record.restore(machine)?;
        let prior = record.prior;
        self.records.pop();
        Ok(prior)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine::{CODE_BASE, DATA_BASE};

    #[test]
    fn undo_on_empty_history() {
        let mut history = HistoryManager::new();
        let mut machine = MachineState::new();
        assert_eq!(history.undo(&mut machine), Err(EmulatorError::NothingToUndo));
        assert_eq!(machine, MachineState::new());
    }

    #[test]
    fn capture_then_undo_restores_registers_and_bytes() {
        let r1 = Register::new(1).unwrap();
        let mut machine = MachineState::new();
        machine.registers.pc = CODE_BASE;
        machine.registers[r1] = 7;
        machine.memory.write(DATA_BASE, &[1, 2, 3, 4]).unwrap();
        let before = machine.clone();

        let mut history = HistoryManager::new();
        let record =
            StepRecord::capture(EngineState::Ready, &machine, [r1], [(DATA_BASE + 1, 2)]).unwrap();
        assert_eq!(record.memory, vec![(DATA_BASE + 1, vec![2, 3])]);
        assert_eq!(history.record_step(record), 0);

        machine.registers[r1] = 99;
        machine.registers.pc = CODE_BASE + 4;
        machine.registers.flags.z = true;
        machine.memory.write(DATA_BASE + 1, &[9, 9]).unwrap();

        assert_eq!(history.undo(&mut machine), Ok(EngineState::Ready));
        assert_eq!(machine, before);
        assert!(history.is_empty());
    }

    #[test]
    fn records_are_indexed_by_sequence() {
        let mut machine = MachineState::new();
        let mut history = HistoryManager::new();
        for seq in 0..3 {
            let record = StepRecord::capture(EngineState::Running, &machine, [], []).unwrap();
            assert_eq!(history.record_step(record), seq);
        }
        assert_eq!(history.len(), 3);
        assert_eq!(history.undo(&mut machine), Ok(EngineState::Running));
        assert_eq!(history.len(), 2);
        history.clear();
        assert!(history.is_empty());
        assert_eq!(history.undo(&mut machine), Err(EmulatorError::NothingToUndo));
    }

    #[test]
    fn capture_outside_memory_fails() {
        let machine = MachineState::new();
        assert!(StepRecord::capture(EngineState::Running, &machine, [], [(0, 4)]).is_err());
    }
}
