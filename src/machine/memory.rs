//! The three fixed memory regions and bounds-checked access to them.
//!
//! Every access must lie entirely inside one region; anything else is a
//! [`EmulatorError::MemoryFault`]. Accesses need not be aligned.

use crate::machine::errors::{Access, EmulatorError};
use crate::machine::{CODE_BASE, DATA_BASE, REGION_SIZE, STACK_BASE, WORD_SIZE, Word};
use std::fmt;
use std::ops::{Index, IndexMut};
use std::slice::SliceIndex;

/// Identifies one of the memory regions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionKind {
    Code,
    Stack,
    Data,
}

impl RegionKind {
    pub const ALL: [RegionKind; 3] = [RegionKind::Code, RegionKind::Stack, RegionKind::Data];

    pub const fn base(self) -> u32 {
        match self {
            Self::Code => CODE_BASE,
            Self::Stack => STACK_BASE,
            Self::Data => DATA_BASE,
        }
    }

    /// Whether instructions may store into the region.
    pub const fn writable(self) -> bool {
        !matches!(self, Self::Code)
    }

    const fn slot(self) -> usize {
        match self {
            Self::Code => 0,
            Self::Stack => 1,
            Self::Data => 2,
        }
    }
}

impl fmt::Display for RegionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Code => "code",
            Self::Stack => "stack",
            Self::Data => "data",
        })
    }
}

/// A contiguous, fixed-size, byte-addressable buffer at a base address.
///
/// Indexing (`[]`) is by offset from the base, not by absolute address.
#[derive(Clone, PartialEq, Eq)]
pub struct MemoryRegion {
    kind: RegionKind,
    bytes: Vec<u8>,
}

impl MemoryRegion {
    fn new(kind: RegionKind) -> Self {
        Self {
            kind,
            bytes: vec![0; REGION_SIZE],
        }
    }

    pub fn kind(&self) -> RegionKind {
        self.kind
    }

    pub fn base(&self) -> u32 {
        self.kind.base()
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    /// Offset of `[addr, addr + len)` inside this region, if fully contained.
    fn offset_of(&self, addr: u32, len: usize) -> Option<usize> {
        let offset = addr.checked_sub(self.base())? as usize;
        let end = offset.checked_add(len)?;
        (end <= self.bytes.len()).then_some(offset)
    }

    fn clear(&mut self) {
        self.bytes.fill(0);
    }
}

impl fmt::Debug for MemoryRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryRegion")
            .field("kind", &self.kind)
            .field("base", &format_args!("{:#010x}", self.base()))
            .field("len", &self.bytes.len())
            .finish()
    }
}

impl<T: SliceIndex<[u8]>> Index<T> for MemoryRegion {
    type Output = T::Output;

    fn index(&self, index: T) -> &Self::Output {
        &self.bytes[index]
    }
}

impl<T: SliceIndex<[u8]>> IndexMut<T> for MemoryRegion {
    fn index_mut(&mut self, index: T) -> &mut Self::Output {
        &mut self.bytes[index]
    }
}

/// Code, stack and data regions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Memory {
    regions: [MemoryRegion; 3],
}

impl Memory {
    pub fn new() -> Self {
        Self {
            regions: RegionKind::ALL.map(MemoryRegion::new),
        }
    }

    pub fn region(&self, kind: RegionKind) -> &MemoryRegion {
        &self.regions[kind.slot()]
    }

    pub(crate) fn region_mut(&mut self, kind: RegionKind) -> &mut MemoryRegion {
        &mut self.regions[kind.slot()]
    }

    /// Zeroes every region.
    pub fn clear(&mut self) {
        self.regions.iter_mut().for_each(MemoryRegion::clear);
    }

    /// Finds the region wholly containing `[addr, addr + len)`.
    fn locate(&self, addr: u32, len: usize) -> Option<(RegionKind, usize)> {
        self.regions
            .iter()
            .find_map(|region| Some((region.kind, region.offset_of(addr, len)?)))
    }

    fn locate_or_fault(
        &self,
        addr: u32,
        len: usize,
        access: Access,
    ) -> Result<(RegionKind, usize), EmulatorError> {
        self.locate(addr, len)
            .ok_or(EmulatorError::MemoryFault { addr, len, access })
    }

    /// Reads `len` bytes starting at `addr`.
    pub fn read(&self, addr: u32, len: usize) -> Result<&[u8], EmulatorError> {
        let (kind, offset) = self.locate_or_fault(addr, len, Access::Read)?;
        Ok(&self.region(kind)[offset..offset + len])
    }

    /// Reads a little-endian word.
    pub fn read_word(&self, addr: u32) -> Result<Word, EmulatorError> {
        let mut raw = [0u8; WORD_SIZE];
        raw.copy_from_slice(self.read(addr, WORD_SIZE)?);
        Ok(Word::from_le_bytes(raw))
    }

    pub fn read_byte(&self, addr: u32) -> Result<u8, EmulatorError> {
        Ok(self.read(addr, 1)?[0])
    }

    /// Checks that an instruction may store `len` bytes at `addr`.
    ///
    /// Stores must fit in one region and may not target code.
    pub fn check_store(&self, addr: u32, len: usize) -> Result<(), EmulatorError> {
        let (kind, _) = self.locate_or_fault(addr, len, Access::Write)?;
        if !kind.writable() {
            return Err(EmulatorError::MemoryFault {
                addr,
                len,
                access: Access::Write,
            });
        }
        Ok(())
    }

    /// Writes `bytes` at `addr` in any region, code included.
    ///
    /// Used for loading and pre-seeding; instruction stores go through
    /// [`check_store`](Self::check_store) first.
    pub fn write(&mut self, addr: u32, bytes: &[u8]) -> Result<(), EmulatorError> {
        let (kind, offset) = self.locate_or_fault(addr, bytes.len(), Access::Write)?;
        self.region_mut(kind)[offset..offset + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }
}

impl Default for Memory {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine::STACK_TOP;

    #[test]
    fn new_memory_is_zeroed() {
        let memory = Memory::new();
        for kind in RegionKind::ALL {
            let region = memory.region(kind);
            assert_eq!(region.len(), REGION_SIZE);
            assert!(region.as_slice().iter().all(|&b| b == 0));
        }
    }

    #[test]
    fn word_roundtrip_little_endian() {
        let mut memory = Memory::new();
        memory.write(DATA_BASE + 8, &0xDEAD_BEEFu32.to_le_bytes()).unwrap();
        assert_eq!(memory.read_word(DATA_BASE + 8).unwrap(), 0xDEAD_BEEF);
        assert_eq!(memory.read_byte(DATA_BASE + 8).unwrap(), 0xEF);
        assert_eq!(memory.region(RegionKind::Data)[8], 0xEF);
    }

    #[test]
    fn region_indexes_by_offset_and_range() {
        let mut memory = Memory::new();
        memory.region_mut(RegionKind::Stack)[4..8].copy_from_slice(&[1, 2, 3, 4]);
        memory.region_mut(RegionKind::Stack)[9] = 7;
        let stack = memory.region(RegionKind::Stack);
        assert_eq!(&stack[4..8], &[1, 2, 3, 4]);
        assert_eq!(stack[9], 7);
        assert_eq!(memory.read_word(STACK_BASE + 4).unwrap(), 0x0403_0201);
    }

    #[test]
    fn unaligned_access_allowed() {
        let mut memory = Memory::new();
        memory.write(STACK_BASE + 1, &[1, 2, 3, 4]).unwrap();
        assert_eq!(memory.read_word(STACK_BASE + 1).unwrap(), 0x0403_0201);
    }

    #[test]
    fn last_word_in_region_is_accessible() {
        let memory = Memory::new();
        assert!(memory.read_word(STACK_TOP - 4).is_ok());
        assert!(memory.read_word(STACK_TOP - 3).is_err());
    }

    #[test]
    fn access_outside_regions_faults() {
        let memory = Memory::new();
        assert_eq!(
            memory.read_word(0),
            Err(EmulatorError::MemoryFault {
                addr: 0,
                len: 4,
                access: Access::Read
            })
        );
        assert!(memory.read_byte(DATA_BASE + REGION_SIZE as u32).is_err());
        assert!(memory.read_word(u32::MAX - 1).is_err());
    }

    #[test]
    fn store_into_code_faults_but_write_succeeds() {
        let mut memory = Memory::new();
        assert!(memory.check_store(CODE_BASE, 4).is_err());
        assert!(memory.check_store(DATA_BASE, 4).is_ok());
        memory.write(CODE_BASE, &[0xAA]).unwrap();
        assert_eq!(memory.read_byte(CODE_BASE).unwrap(), 0xAA);
    }

    #[test]
    fn failed_write_leaves_memory_untouched() {
        let mut memory = Memory::new();
        let before = memory.clone();
        assert!(memory.write(DATA_BASE + REGION_SIZE as u32 - 2, &[1, 2, 3, 4]).is_err());
        assert_eq!(memory, before);
    }

    #[test]
    fn clear_zeroes_all_regions() {
        let mut memory = Memory::new();
        memory.write(DATA_BASE, &[9; 16]).unwrap();
        memory.write(STACK_BASE, &[9; 16]).unwrap();
        memory.clear();
        assert_eq!(memory, Memory::new());
    }
}
