use std::fmt;
use std::ops::{Index, IndexMut};

/// A general-purpose register, `R0`..`R14`.
///
/// `R13` is the stack pointer and `R14` the link register.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Register(u8);

impl Register {
    /// Number of general-purpose registers.
    pub const COUNT: usize = 15;
    pub const SP: Register = Register(13);
    pub const LR: Register = Register(14);

    /// Returns the register with the given index, if it exists.
    pub const fn new(index: u8) -> Option<Self> {
        if (index as usize) < Self::COUNT {
            Some(Self(index))
        } else {
            None
        }
    }

    pub const fn index(self) -> usize {
        self.0 as usize
    }

    /// Parses a register name, case-insensitively: `r0`..`r14`, `sp`, `lr`.
    pub fn parse(name: &str) -> Option<Self> {
        if name.eq_ignore_ascii_case("sp") {
            return Some(Self::SP);
        }
        if name.eq_ignore_ascii_case("lr") {
            return Some(Self::LR);
        }
        let digits = name.strip_prefix(['r', 'R'])?;
        // Reject forms like "r+1" or "r01" that `parse` would otherwise accept.
        if digits.is_empty()
            || !digits.bytes().all(|b| b.is_ascii_digit())
            || (digits.len() > 1 && digits.starts_with('0'))
        {
            return None;
        }
        Self::new(digits.parse().ok()?)
    }

    /// Iterates `R0`..`R14` in order.
    pub fn all() -> impl Iterator<Item = Register> {
        (0..Self::COUNT as u8).map(Register)
    }
}

impl fmt::Display for Register {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::SP => f.write_str("SP"),
            Self::LR => f.write_str("LR"),
            Register(n) => write!(f, "R{n}"),
        }
    }
}

/// Condition flags.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Flags {
    /// Negative: bit 31 of the result.
    pub n: bool,
    /// Zero: the result is zero.
    pub z: bool,
    /// Carry: unsigned carry-out, no-borrow, or last bit shifted out.
    pub c: bool,
    /// Overflow: signed overflow.
    pub v: bool,
}

impl Flags {
    /// Updates N and Z from `result`, leaving C and V.
    pub(crate) fn with_nz(self, result: u32) -> Self {
        Self {
            n: result >> 31 == 1,
            z: result == 0,
            ..self
        }
    }
}

impl fmt::Display for Flags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let bit = |set: bool, c: char| if set { c } else { '-' };
        write!(
            f,
            "{}{}{}{}",
            bit(self.n, 'N'),
            bit(self.z, 'Z'),
            bit(self.c, 'C'),
            bit(self.v, 'V')
        )
    }
}

/// The register file: general-purpose registers, program counter and flags.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RegisterFile {
    regs: [u32; Register::COUNT],
    pub pc: u32,
    pub flags: Flags,
}

impl RegisterFile {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, reg: Register) -> u32 {
        self.regs[reg.index()]
    }

    pub fn set(&mut self, reg: Register, value: u32) {
        self.regs[reg.index()] = value;
    }
}

impl Index<Register> for RegisterFile {
    type Output = u32;

    fn index(&self, reg: Register) -> &u32 {
        &self.regs[reg.index()]
    }
}

impl IndexMut<Register> for RegisterFile {
    fn index_mut(&mut self, reg: Register) -> &mut u32 {
        &mut self.regs[reg.index()]
    }
}

impl fmt::Display for RegisterFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, reg) in Register::all().enumerate() {
            let sep = if i % 4 == 3 { "\n" } else { "  " };
            write!(f, "{:>3}={:#010x}{}", reg.to_string(), self[reg], sep)?;
        }
        write!(f, " PC={:#010x}  NZCV={}", self.pc, self.flags)
    }
}
