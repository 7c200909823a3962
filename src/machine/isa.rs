//! Instruction Set Architecture (ISA) definitions.
//!
//! The [`for_each_instruction!`](crate::for_each_instruction) macro holds the
//! canonical instruction table and invokes a callback macro for code
//! generation, so encoding, decoding, operand checking and the fingerprint test
//! all derive from one definition.
//!
//! This module generates:
//! - [`Opcode`] with mnemonic and operand syntax, and `TryFrom<u8>`
//! - [`Instruction`], a decoded instruction with typed fields, plus
//!   `encode`, `decode`, `from_operands` and `operands`
//!
//! # Word Format
//!
//! Every instruction is one 32-bit word:
//!
//! ```text
//! 31      24 23  20 19  16 15                    0
//! | opcode  |  Rd  |  Rn  |  imm16 / 000..0 Rm   |
//! | opcode  |  Rd  |          imm20 / addr20     |
//! ```
//!
//! `imm16` and `imm20` are two's complement and sign-extended; `addr20` is an
//! unsigned absolute address. Immediate shift amounts sit in the low bits of
//! the imm16 slot and are limited to 0..=32. Bits not used by a form must be zero.

use crate::machine::Word;
use crate::machine::errors::{DecodeFaultReason, OperandError};
use crate::machine::registers::Register;
use std::fmt;

const IMM20_MASK: u32 = 0x000F_FFFF;

/// Largest immediate shift amount.
const MAX_SHIFT: u8 = 32;

/// Operand shapes accepted by the assembler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Syntax {
    /// `R0`..`R12`, `SP`, `LR`
    Reg,
    /// `#expr`
    Imm,
    /// `[Rn]` or `[Rn, #expr]`
    MemOffset,
    /// `[#expr]` or `[label]`
    MemAbs,
    /// `label` or an absolute address
    Target,
}

impl Syntax {
    pub fn describe(self) -> &'static str {
        match self {
            Syntax::Reg => "register",
            Syntax::Imm => "#immediate",
            Syntax::MemOffset => "[register, #offset]",
            Syntax::MemAbs => "[address]",
            Syntax::Target => "label",
        }
    }
}

/// A resolved operand: a register or an integer value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperandValue {
    Reg(Register),
    Int(i64),
}

impl OperandValue {
    fn register(self) -> Result<Register, OperandError> {
        match self {
            OperandValue::Reg(reg) => Ok(reg),
            OperandValue::Int(_) => Err(OperandError::ExpectedRegister),
        }
    }

    fn int(self) -> Result<i64, OperandError> {
        match self {
            OperandValue::Int(v) => Ok(v),
            OperandValue::Reg(_) => Err(OperandError::ExpectedValue),
        }
    }
}

/// Invokes a callback macro with the complete instruction definition list.
///
/// Entry format: `Variant = opcode, "MNEMONIC" (syntax, ..) => [field: Kind, ..]`.
/// Syntax lists the source operands; fields list the word fields they fill,
/// in the same order (a `MemOffset` operand fills two fields).
#[macro_export]
macro_rules! for_each_instruction {
    ($callback:ident) => {
        $callback! {
            // =========================
            // Control
            // =========================
            /// HALT ; stop execution, PC stays on this instruction
            Halt = 0x00, "HALT" () => [],
            /// NOP ; do nothing
            Nop = 0x01, "NOP" () => [],
            // =========================
            // Moves
            // =========================
            /// MOV rd, rm ; rd = rm
            MovReg = 0x10, "MOV" (Reg, Reg) => [rd: Rd, rm: Rm],
            /// MOV rd, #imm20 ; rd = sign_extend(imm20)
            MovImm = 0x11, "MOV" (Reg, Imm) => [rd: Rd, imm: Imm20],
            /// MVN rd, rm ; rd = !rm
            MvnReg = 0x12, "MVN" (Reg, Reg) => [rd: Rd, rm: Rm],
            // =========================
            // Arithmetic
            // =========================
            /// ADD rd, rn, rm ; rd = rn + rm, sets NZCV
            AddReg = 0x20, "ADD" (Reg, Reg, Reg) => [rd: Rd, rn: Rn, rm: Rm],
            /// ADD rd, rn, #imm16 ; rd = rn + imm16, sets NZCV
            AddImm = 0x21, "ADD" (Reg, Reg, Imm) => [rd: Rd, rn: Rn, imm: Imm16],
            /// SUB rd, rn, rm ; rd = rn - rm, sets NZCV
            SubReg = 0x22, "SUB" (Reg, Reg, Reg) => [rd: Rd, rn: Rn, rm: Rm],
            /// SUB rd, rn, #imm16 ; rd = rn - imm16, sets NZCV
            SubImm = 0x23, "SUB" (Reg, Reg, Imm) => [rd: Rd, rn: Rn, imm: Imm16],
            /// MUL rd, rn, rm ; rd = rn * rm (low 32 bits), sets NZ
            Mul = 0x24, "MUL" (Reg, Reg, Reg) => [rd: Rd, rn: Rn, rm: Rm],
            // =========================
            // Logic
            // =========================
            /// AND rd, rn, rm ; rd = rn & rm, sets NZ
            AndReg = 0x28, "AND" (Reg, Reg, Reg) => [rd: Rd, rn: Rn, rm: Rm],
            /// AND rd, rn, #imm16 ; rd = rn & imm16, sets NZ
            AndImm = 0x29, "AND" (Reg, Reg, Imm) => [rd: Rd, rn: Rn, imm: Imm16],
            /// ORR rd, rn, rm ; rd = rn | rm, sets NZ
            OrrReg = 0x2A, "ORR" (Reg, Reg, Reg) => [rd: Rd, rn: Rn, rm: Rm],
            /// ORR rd, rn, #imm16 ; rd = rn | imm16, sets NZ
            OrrImm = 0x2B, "ORR" (Reg, Reg, Imm) => [rd: Rd, rn: Rn, imm: Imm16],
            /// EOR rd, rn, rm ; rd = rn ^ rm, sets NZ
            EorReg = 0x2C, "EOR" (Reg, Reg, Reg) => [rd: Rd, rn: Rn, rm: Rm],
            /// EOR rd, rn, #imm16 ; rd = rn ^ imm16, sets NZ
            EorImm = 0x2D, "EOR" (Reg, Reg, Imm) => [rd: Rd, rn: Rn, imm: Imm16],
            // =========================
            // Shifts
            // =========================
            /// LSL rd, rn, rm ; rd = rn << rm, sets NZC
            LslReg = 0x30, "LSL" (Reg, Reg, Reg) => [rd: Rd, rn: Rn, rm: Rm],
            /// LSL rd, rn, #imm ; rd = rn << imm (0..=32), sets NZC
            LslImm = 0x31, "LSL" (Reg, Reg, Imm) => [rd: Rd, rn: Rn, imm: Shamt],
            /// LSR rd, rn, rm ; rd = rn >> rm (logical), sets NZC
            LsrReg = 0x32, "LSR" (Reg, Reg, Reg) => [rd: Rd, rn: Rn, rm: Rm],
            /// LSR rd, rn, #imm ; rd = rn >> imm (logical, 0..=32), sets NZC
            LsrImm = 0x33, "LSR" (Reg, Reg, Imm) => [rd: Rd, rn: Rn, imm: Shamt],
            /// ASR rd, rn, rm ; rd = rn >> rm (arithmetic), sets NZC
            AsrReg = 0x34, "ASR" (Reg, Reg, Reg) => [rd: Rd, rn: Rn, rm: Rm],
            /// ASR rd, rn, #imm ; rd = rn >> imm (arithmetic, 0..=32), sets NZC
            AsrImm = 0x35, "ASR" (Reg, Reg, Imm) => [rd: Rd, rn: Rn, imm: Shamt],
            // =========================
            // Compare
            // =========================
            /// CMP rn, rm ; flags from rn - rm
            CmpReg = 0x38, "CMP" (Reg, Reg) => [rn: Rn, rm: Rm],
            /// CMP rn, #imm16 ; flags from rn - imm16
            CmpImm = 0x39, "CMP" (Reg, Imm) => [rn: Rn, imm: Imm16],
            // =========================
            // Load / store
            // =========================
            /// LDR rd, [rn, #off] ; rd = word at rn + off
            LdrOff = 0x40, "LDR" (Reg, MemOffset) => [rd: Rd, rn: Rn, offset: Imm16],
            /// LDR rd, [#addr] ; rd = word at addr
            LdrAbs = 0x41, "LDR" (Reg, MemAbs) => [rd: Rd, addr: Addr20],
            /// STR rd, [rn, #off] ; word at rn + off = rd
            StrOff = 0x42, "STR" (Reg, MemOffset) => [rd: Rd, rn: Rn, offset: Imm16],
            /// STR rd, [#addr] ; word at addr = rd
            StrAbs = 0x43, "STR" (Reg, MemAbs) => [rd: Rd, addr: Addr20],
            /// LDRB rd, [rn, #off] ; rd = zero_extend(byte at rn + off)
            LdrbOff = 0x44, "LDRB" (Reg, MemOffset) => [rd: Rd, rn: Rn, offset: Imm16],
            /// LDRB rd, [#addr] ; rd = zero_extend(byte at addr)
            LdrbAbs = 0x45, "LDRB" (Reg, MemAbs) => [rd: Rd, addr: Addr20],
            /// STRB rd, [rn, #off] ; byte at rn + off = rd & 0xFF
            StrbOff = 0x46, "STRB" (Reg, MemOffset) => [rd: Rd, rn: Rn, offset: Imm16],
            /// STRB rd, [#addr] ; byte at addr = rd & 0xFF
            StrbAbs = 0x47, "STRB" (Reg, MemAbs) => [rd: Rd, addr: Addr20],
            /// PUSH rd ; SP -= 4, word at SP = rd
            Push = 0x48, "PUSH" (Reg) => [rd: Rd],
            /// POP rd ; rd = word at SP, SP += 4
            Pop = 0x49, "POP" (Reg) => [rd: Rd],
            // =========================
            // Branches
            // =========================
            /// B target ; PC = target
            B = 0x50, "B" (Target) => [target: Addr20],
            /// BEQ target ; branch if Z
            Beq = 0x51, "BEQ" (Target) => [target: Addr20],
            /// BNE target ; branch if !Z
            Bne = 0x52, "BNE" (Target) => [target: Addr20],
            /// BLT target ; branch if N != V
            Blt = 0x53, "BLT" (Target) => [target: Addr20],
            /// BGE target ; branch if N == V
            Bge = 0x54, "BGE" (Target) => [target: Addr20],
            /// BGT target ; branch if !Z && N == V
            Bgt = 0x55, "BGT" (Target) => [target: Addr20],
            /// BLE target ; branch if Z || N != V
            Ble = 0x56, "BLE" (Target) => [target: Addr20],
            /// BLO target ; branch if !C (unsigned lower)
            Blo = 0x57, "BLO" (Target) => [target: Addr20],
            /// BHS target ; branch if C (unsigned higher or same)
            Bhs = 0x58, "BHS" (Target) => [target: Addr20],
            /// BL target ; LR = PC + 4, PC = target
            Bl = 0x59, "BL" (Target) => [target: Addr20],
            /// BX rn ; PC = rn
            Bx = 0x5A, "BX" (Reg) => [rn: Rn],
            /// RET ; PC = LR
            Ret = 0x5B, "RET" () => [],
            // =========================
            // Movement
            // =========================
            /// UP ; word at MAILBOX = 1
            Up = 0x60, "UP" () => [],
            /// DOWN ; word at MAILBOX = 2
            Down = 0x61, "DOWN" () => [],
            /// LEFT ; word at MAILBOX = 3
            Left = 0x62, "LEFT" () => [],
            /// RIGHT ; word at MAILBOX = 4
            Right = 0x63, "RIGHT" () => [],
        }
    };
}

macro_rules! define_instructions {
    // ---------- field types ----------
    (@ty Rd) => { Register };
    (@ty Rn) => { Register };
    (@ty Rm) => { Register };
    (@ty Imm16) => { i16 };
    (@ty Imm20) => { i32 };
    (@ty Shamt) => { u8 };
    (@ty Addr20) => { u32 };

    // ---------- encoding ----------
    (@encode Rd, $v:expr) => { ($v.index() as u32) << 20 };
    (@encode Rn, $v:expr) => { ($v.index() as u32) << 16 };
    (@encode Rm, $v:expr) => { $v.index() as u32 };
    (@encode Imm16, $v:expr) => { ($v as u16) as u32 };
    (@encode Imm20, $v:expr) => { ($v as u32) & IMM20_MASK };
    (@encode Shamt, $v:expr) => { $v as u32 };
    (@encode Addr20, $v:expr) => { $v & IMM20_MASK };

    // ---------- decoding ----------
    (@decode Rd, $w:expr) => { register_field($w >> 20)? };
    (@decode Rn, $w:expr) => { register_field($w >> 16)? };
    (@decode Rm, $w:expr) => { register_field($w)? };
    (@decode Imm16, $w:expr) => { ($w & 0xFFFF) as u16 as i16 };
    (@decode Imm20, $w:expr) => { ((($w & IMM20_MASK) << 12) as i32) >> 12 };
    (@decode Shamt, $w:expr) => { shift_field($w)? };
    (@decode Addr20, $w:expr) => { $w & IMM20_MASK };

    // ---------- operand values ----------
    (@value Rd, $v:expr) => { OperandValue::Reg($v) };
    (@value Rn, $v:expr) => { OperandValue::Reg($v) };
    (@value Rm, $v:expr) => { OperandValue::Reg($v) };
    (@value Imm16, $v:expr) => { OperandValue::Int(i64::from($v)) };
    (@value Imm20, $v:expr) => { OperandValue::Int(i64::from($v)) };
    (@value Shamt, $v:expr) => { OperandValue::Int(i64::from($v)) };
    (@value Addr20, $v:expr) => { OperandValue::Int(i64::from($v)) };

    // ---------- operand packing ----------
    (@from Rd, $it:ident) => { next_operand(&mut $it)?.register()? };
    (@from Rn, $it:ident) => { next_operand(&mut $it)?.register()? };
    (@from Rm, $it:ident) => { next_operand(&mut $it)?.register()? };
    (@from Imm16, $it:ident) => { imm16(next_operand(&mut $it)?.int()?)? };
    (@from Imm20, $it:ident) => { imm20(next_operand(&mut $it)?.int()?)? };
    (@from Shamt, $it:ident) => { shift_amount(next_operand(&mut $it)?.int()?)? };
    (@from Addr20, $it:ident) => { addr20(next_operand(&mut $it)?.int()?)? };

    (
        $(
            $(#[$doc:meta])*
            $name:ident = $opcode:literal, $mnemonic:literal ( $( $syntax:ident ),* ) => [
                $( $field:ident : $kind:ident ),* $(,)?
            ]
        ),* $(,)?
    ) => {
        // =========================
        // Opcode enum
        // =========================
        #[repr(u8)]
        #[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
        pub enum Opcode {
            $(
                $(#[$doc])*
                $name = $opcode,
            )*
        }

        impl TryFrom<u8> for Opcode {
            type Error = DecodeFaultReason;

            fn try_from(value: u8) -> Result<Self, Self::Error> {
                match value {
                    $( $opcode => Ok(Opcode::$name), )*
                    _ => Err(DecodeFaultReason::UnknownOpcode { opcode: value }),
                }
            }
        }

        impl Opcode {
            /// Every opcode in table order.
            pub const ALL: &'static [Opcode] = &[ $( Opcode::$name, )* ];

            /// Returns the assembly mnemonic for this opcode.
            pub const fn mnemonic(self) -> &'static str {
                match self {
                    $( Opcode::$name => $mnemonic, )*
                }
            }

            /// Returns the source operand shapes, in order.
            pub const fn syntax(self) -> &'static [Syntax] {
                match self {
                    $( Opcode::$name => &[ $( Syntax::$syntax ),* ], )*
                }
            }
        }

        // =========================
        // Decoded instruction
        // =========================
        #[derive(Copy, Clone, Debug, PartialEq, Eq)]
        pub enum Instruction {
            $(
                $(#[$doc])*
                $name { $( $field: define_instructions!(@ty $kind) ),* },
            )*
        }

        impl Instruction {
            pub const fn opcode(&self) -> Opcode {
                match self {
                    $( Instruction::$name { .. } => Opcode::$name, )*
                }
            }

            /// Packs the instruction into its machine word.
            pub fn encode(&self) -> Word {
                match self {
                    $(
                        Instruction::$name { $( $field ),* } => {
                            (($opcode as u32) << 24) $( | define_instructions!(@encode $kind, *$field) )*
                        }
                    )*
                }
            }

            /// Unpacks a machine word.
            ///
            /// Rejects unknown opcodes, register fields naming no register, and
            /// words with bits set outside the fields of their form.
            pub fn decode(word: Word) -> Result<Self, DecodeFaultReason> {
                let instr = match Opcode::try_from((word >> 24) as u8)? {
                    $(
                        Opcode::$name => Instruction::$name {
                            $( $field: define_instructions!(@decode $kind, word), )*
                        },
                    )*
                };
                if instr.encode() != word {
                    return Err(DecodeFaultReason::ReservedBits);
                }
                Ok(instr)
            }

            /// Builds an instruction from resolved operands in field order,
            /// range-checking every value against its field width.
            pub fn from_operands(
                opcode: Opcode,
                operands: &[OperandValue],
            ) -> Result<Self, OperandError> {
                let mut it = operands.iter().copied();
                let instr = match opcode {
                    $(
                        Opcode::$name => Instruction::$name {
                            $( $field: define_instructions!(@from $kind, it), )*
                        },
                    )*
                };
                if it.next().is_some() {
                    return Err(OperandError::Extra);
                }
                Ok(instr)
            }

            /// Field values in field order; the inverse of [`from_operands`](Self::from_operands).
            pub fn operands(&self) -> Vec<OperandValue> {
                match self {
                    $(
                        Instruction::$name { $( $field ),* } => {
                            vec![ $( define_instructions!(@value $kind, *$field) ),* ]
                        }
                    )*
                }
            }
        }
    };
}

for_each_instruction!(define_instructions);

impl Opcode {
    /// Opcodes spelled `mnemonic`, compared case-insensitively.
    pub fn with_mnemonic(mnemonic: &str) -> impl Iterator<Item = Opcode> + '_ {
        Self::ALL
            .iter()
            .copied()
            .filter(move |op| op.mnemonic().eq_ignore_ascii_case(mnemonic))
    }
}

fn register_field(bits: u32) -> Result<Register, DecodeFaultReason> {
    Register::new((bits & 0xF) as u8).ok_or(DecodeFaultReason::InvalidRegister)
}

fn next_operand(it: &mut impl Iterator<Item = OperandValue>) -> Result<OperandValue, OperandError> {
    it.next().ok_or(OperandError::Missing)
}

fn imm16(value: i64) -> Result<i16, OperandError> {
    i16::try_from(value).map_err(|_| OperandError::OutOfRange {
        value,
        field: "signed 16-bit immediate",
    })
}

fn imm20(value: i64) -> Result<i32, OperandError> {
    if (-(1 << 19)..(1 << 19)).contains(&value) {
        Ok(value as i32)
    } else {
        Err(OperandError::OutOfRange {
            value,
            field: "signed 20-bit immediate",
        })
    }
}

fn shift_field(word: Word) -> Result<u8, DecodeFaultReason> {
    u8::try_from(word & 0xFFFF)
        .ok()
        .filter(|&n| n <= MAX_SHIFT)
        .ok_or(DecodeFaultReason::ReservedBits)
}

fn shift_amount(value: i64) -> Result<u8, OperandError> {
    u8::try_from(value)
        .ok()
        .filter(|&n| n <= MAX_SHIFT)
        .ok_or(OperandError::OutOfRange {
            value,
            field: "shift amount (0..=32)",
        })
}

fn addr20(value: i64) -> Result<u32, OperandError> {
    if (0..=i64::from(IMM20_MASK)).contains(&value) {
        Ok(value as u32)
    } else {
        Err(OperandError::OutOfRange {
            value,
            field: "20-bit address",
        })
    }
}

fn next_register<'a>(
    values: &mut impl Iterator<Item = &'a OperandValue>,
) -> Result<Register, fmt::Error> {
    match values.next() {
        Some(OperandValue::Reg(reg)) => Ok(*reg),
        _ => Err(fmt::Error),
    }
}

fn next_int<'a>(values: &mut impl Iterator<Item = &'a OperandValue>) -> Result<i64, fmt::Error> {
    match values.next() {
        Some(OperandValue::Int(v)) => Ok(*v),
        _ => Err(fmt::Error),
    }
}

/// Disassembles in the syntax the assembler accepts.
impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let opcode = self.opcode();
        let operands = self.operands();
        let mut values = operands.iter();

        f.write_str(opcode.mnemonic())?;
        for (i, syntax) in opcode.syntax().iter().enumerate() {
            f.write_str(if i == 0 { " " } else { ", " })?;
            match syntax {
                Syntax::Reg => write!(f, "{}", next_register(&mut values)?)?,
                Syntax::Imm => write!(f, "#{}", next_int(&mut values)?)?,
                Syntax::MemOffset => {
                    let base = next_register(&mut values)?;
                    match next_int(&mut values)? {
                        0 => write!(f, "[{base}]")?,
                        offset => write!(f, "[{base}, #{offset}]")?,
                    }
                }
                Syntax::MemAbs => write!(f, "[#{:#x}]", next_int(&mut values)?)?,
                Syntax::Target => write!(f, "{:#x}", next_int(&mut values)?)?,
            }
        }
        Ok(())
    }
}
