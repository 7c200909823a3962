//! Assembled program representation and serialization.
//!
//! A [`Program`] carries the code words, the initial data-region image, the
//! source line of every code word, and the symbol table. It serializes to a
//! portable image with a magic header and format version.

use crate::machine::errors::ImageError;
use crate::machine::isa::Instruction;
use crate::machine::{CODE_BASE, REGION_SIZE, REGION_WORDS, WORD_SIZE, Word};
use crate::types::encoding::{Decode, Encode};
use asmbot_derive::BinaryCodec;
use std::fmt::Write;

/// Magic bytes identifying a serialized program image.
const MAGIC: &[u8; 6] = b"ASMBOT";

/// Current image format version.
const CURRENT_VERSION: Version = Version::new(0, 1, 0);

/// Semantic version for image format compatibility.
#[derive(Debug, PartialEq, Eq, BinaryCodec)]
struct Version {
    major: u8,
    minor: u8,
    patch: u8,
}

impl Version {
    const fn new(major: u8, minor: u8, patch: u8) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }
}

/// Looks up the line of the code word at `addr` in a per-word line map.
pub(crate) fn source_line(lines: &[u32], addr: u32) -> Option<usize> {
    let offset = addr.checked_sub(CODE_BASE)? as usize;
    if offset % WORD_SIZE != 0 {
        return None;
    }
    lines.get(offset / WORD_SIZE).map(|&line| line as usize)
}

/// Output of the assembler, ready to load into the emulator.
#[derive(Debug, Clone, Default, PartialEq, Eq, BinaryCodec)]
pub struct Program {
    /// Machine words, loaded at `CODE_BASE`.
    pub code: Vec<Word>,
    /// Initial data-region contents, loaded at `DATA_BASE`.
    pub data: Vec<u8>,
    /// 1-based source line of each code word.
    pub lines: Vec<u32>,
    /// Symbols and their values, sorted by name.
    pub symbols: Vec<(String, u32)>,
}

impl Program {
    /// Number of code words.
    pub fn len(&self) -> usize {
        self.code.len()
    }

    pub fn is_empty(&self) -> bool {
        self.code.is_empty()
    }

    /// Value of a symbol.
    pub fn symbol(&self, name: &str) -> Option<u32> {
        self.symbols
            .binary_search_by(|(s, _)| s.as_str().cmp(name))
            .ok()
            .map(|i| self.symbols[i].1)
    }

    /// Renders an address / word / disassembly listing, with source text when given.
    pub fn listing(&self, source: Option<&str>) -> String {
        let source_lines: Vec<&str> = source.map(|s| s.lines().collect()).unwrap_or_default();
        let mut out = String::new();

        for (i, &word) in self.code.iter().enumerate() {
            let addr = CODE_BASE + (i * WORD_SIZE) as u32;
            let text = match Instruction::decode(word) {
                Ok(instr) => instr.to_string(),
                Err(_) => format!(".word {word:#010x}"),
            };
            let line = self.lines.get(i).copied().unwrap_or(0);
            let _ = write!(out, "{addr:#010x}  {word:08x}  {text:<24}");
            match source_lines.get((line as usize).wrapping_sub(1)) {
                Some(src) => {
                    let _ = writeln!(out, "; {line:>4} | {}", src.trim());
                }
                None => {
                    let _ = writeln!(out, "; {line:>4}");
                }
            }
        }

        if !self.symbols.is_empty() {
            let _ = writeln!(out, "\nsymbols:");
            for (name, value) in &self.symbols {
                let _ = writeln!(out, "  {value:#010x}  {name}");
            }
        }
        out
    }

    /// Serializes the program to a portable binary image.
    ///
    /// The output includes a magic header and version for compatibility checking.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        MAGIC.encode(&mut out);
        CURRENT_VERSION.encode(&mut out);
        self.encode(&mut out);
        out
    }

    /// Deserializes a program image.
    ///
    /// Validates the magic header and version, and rejects images whose code
    /// or data would not fit their regions.
    pub fn from_bytes(mut input: &[u8]) -> Result<Self, ImageError> {
        if input.len() < MAGIC.len() {
            return Err(ImageError::Malformed {
                reason: "truncated",
            });
        }

        if &<[u8; 6]>::decode(&mut input)? != MAGIC {
            return Err(ImageError::Malformed {
                reason: "bad magic",
            });
        }

        if Version::decode(&mut input)? != CURRENT_VERSION {
            return Err(ImageError::Malformed {
                reason: "unsupported version",
            });
        }

        let program = Program::decode(&mut input)?;
        if !input.is_empty() {
            return Err(ImageError::Malformed {
                reason: "trailing bytes",
            });
        }
        if program.code.len() > REGION_WORDS || program.data.len() > REGION_SIZE {
            return Err(ImageError::Malformed {
                reason: "program exceeds its memory region",
            });
        }
        if program.lines.len() != program.code.len() {
            return Err(ImageError::Malformed {
                reason: "line map does not match code length",
            });
        }
        Ok(program)
    }
}
