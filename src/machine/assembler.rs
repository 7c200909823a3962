//! Assembly language parser and two-pass assembler.
//!
//! Converts source text into a [`Program`]: code words for the code region and
//! an initial image of the data region. Operand shapes come from the
//! instruction table in [`isa`](crate::machine::isa), so the assembler never
//! lists instructions itself.
//!
//! # Syntax
//!
//! ```text
//! [label:] MNEMONIC operand, operand, ...   ; comment
//! [label:] .directive value, ...            // comment
//! ```
//!
//! - Mnemonics and directives are case-insensitive, labels are case-sensitive
//! - Registers: `R0`..`R12`, `SP`, `LR` (also `R13`, `R14`)
//! - Immediates: `#expr`, where `expr` adds and subtracts decimal, `0x` hex,
//!   `0b` binary, `'c'` character literals and symbols
//! - Memory operands: `[Rn]`, `[Rn, #off]`, `[#addr]`, `[label]`
//! - Branch targets: `label` or an absolute address
//! - Sections: `.text` (default) and `.data`
//! - Data directives (`.data` only): `.word`, `.byte`, `.space`/`.skip`,
//!   `.ascii`, `.asciz`/`.string`, `.align n` (to `2^n` bytes)
//! - `.equ NAME, expr` / `.set` define constants; `.global`/`.globl` are ignored
//!
//! Data allocation starts after the mailbox word; the builtin symbol `MAILBOX`
//! names the mailbox address.
//!
//! # Passes
//!
//! Pass 1 scans every line, selects an opcode for each instruction, sizes the
//! code and data sections and defines labels. All symbol references are then
//! checked. Pass 2 evaluates operands, range-checks them and encodes.

use crate::machine::errors::AsmError;
use crate::machine::isa::{Instruction, Opcode, OperandValue, Syntax};
use crate::machine::program::Program;
use crate::machine::registers::Register;
use crate::machine::{CODE_BASE, DATA_BASE, MAILBOX_ADDR, REGION_SIZE, REGION_WORDS, WORD_SIZE};
use std::collections::HashMap;
use std::fmt::Write;
use std::num::IntErrorKind;

const LABEL_SUFFIX: u8 = b':';
const IMMEDIATE_PREFIX: char = '#';
const MAILBOX_SYMBOL: &str = "MAILBOX";
/// Largest `.align` exponent (one whole region).
const MAX_ALIGN_POWER: i64 = 12;

/// Formats a compiler-style diagnostic for an assembly failure.
pub fn render_diagnostic(file: &str, source: &str, err: &AsmError) -> String {
    let mut diag = String::new();
    let _ = writeln!(diag, "error: {}: {}", err.kind, err.message);
    let _ = writeln!(diag, " --> {file}:{}:{}", err.line, err.column);

    if let Some(raw_line) = source.lines().nth(err.line.saturating_sub(1)) {
        let line_text = raw_line.trim_end_matches('\r');
        let underline: String = line_text
            .bytes()
            .take(err.column.saturating_sub(1))
            .map(|b| if b == b'\t' { '\t' } else { ' ' })
            .collect();
        let _ = writeln!(diag, "     |");
        let _ = writeln!(diag, "{:>4} | {}", err.line, line_text);
        let _ = writeln!(diag, "     | {underline}^");
    }

    diag
}

/// Assembles a full source string.
///
/// Fails on the first error found. No partial program is returned.
pub fn assemble(source: &str) -> Result<Program, AsmError> {
    let mut ctx = AsmContext::new();
    for (index, raw) in source.lines().enumerate() {
        let line_no = index + 1;
        let line = scan_line(line_no, raw)?;
        ctx.first_pass_line(line_no, line)?;
    }
    ctx.check_references()?;
    ctx.emit()
}

/// Section that pass 1 is currently filling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Section {
    Text,
    Data,
}

#[derive(Debug, Clone, Copy)]
struct Token<'a> {
    text: &'a str,
    /// 1-based column in the line.
    column: usize,
}

/// One source line split into its parts.
#[derive(Debug, Default)]
struct Line<'a> {
    label: Option<Token<'a>>,
    head: Option<Token<'a>>,
    operands: Vec<Token<'a>>,
}

#[derive(Debug, Clone, Copy)]
enum TermValue<'a> {
    Number(i64),
    Symbol(&'a str),
}

#[derive(Debug, Clone, Copy)]
struct Term<'a> {
    negate: bool,
    column: usize,
    value: TermValue<'a>,
}

/// A sum of signed terms.
#[derive(Debug, Clone)]
struct Expr<'a> {
    column: usize,
    terms: Vec<Term<'a>>,
}

impl<'a> Expr<'a> {
    fn zero(column: usize) -> Self {
        Self {
            column,
            terms: Vec::new(),
        }
    }

    fn symbols(&self) -> impl Iterator<Item = (&'a str, usize)> + '_ {
        self.terms.iter().filter_map(|term| match term.value {
            TermValue::Symbol(name) => Some((name, term.column)),
            TermValue::Number(_) => None,
        })
    }
}

/// A parsed operand before symbol resolution.
#[derive(Debug, Clone)]
enum Operand<'a> {
    Reg(Register),
    Imm(Expr<'a>),
    MemOffset(Register, Expr<'a>),
    MemAbs(Expr<'a>),
    /// A bare expression, used as a branch target.
    Bare(Expr<'a>),
    Str(Vec<u8>),
}

impl<'a> Operand<'a> {
    fn fits(&self, syntax: Syntax) -> bool {
        matches!(
            (syntax, self),
            (Syntax::Reg, Operand::Reg(_))
                | (Syntax::Imm, Operand::Imm(_))
                | (Syntax::MemOffset, Operand::MemOffset(..))
                | (Syntax::MemAbs, Operand::MemAbs(_))
                | (Syntax::Target, Operand::Bare(_) | Operand::Imm(_))
        )
    }

    fn expr(&self) -> Option<&Expr<'a>> {
        match self {
            Operand::Imm(e) | Operand::MemOffset(_, e) | Operand::MemAbs(e) | Operand::Bare(e) => {
                Some(e)
            }
            Operand::Reg(_) | Operand::Str(_) => None,
        }
    }
}

#[derive(Debug)]
enum StatementKind<'a> {
    Instruction {
        opcode: Opcode,
        operands: Vec<(Operand<'a>, usize)>,
    },
    Words {
        offset: usize,
        values: Vec<Expr<'a>>,
    },
    Bytes {
        offset: usize,
        values: Vec<Expr<'a>>,
    },
    Ascii {
        offset: usize,
        bytes: Vec<u8>,
    },
}

/// A statement recorded by pass 1 for encoding in pass 2.
#[derive(Debug)]
struct Statement<'a> {
    line: usize,
    column: usize,
    kind: StatementKind<'a>,
}

impl<'a> Statement<'a> {
    fn exprs(&self) -> Box<dyn Iterator<Item = &Expr<'a>> + '_> {
        match &self.kind {
            StatementKind::Instruction { operands, .. } => {
                Box::new(operands.iter().filter_map(|(op, _)| op.expr()))
            }
            StatementKind::Words { values, .. } | StatementKind::Bytes { values, .. } => {
                Box::new(values.iter())
            }
            StatementKind::Ascii { .. } => Box::new(std::iter::empty()),
        }
    }
}

/// Assembly context for symbol tracking and section sizing.
struct AsmContext<'a> {
    symbols: HashMap<&'a str, i64>,
    statements: Vec<Statement<'a>>,
    section: Section,
    /// Code size in words.
    code_len: usize,
    /// Next free data offset in bytes.
    data_len: usize,
    /// First statement that pushed a section past its region.
    overflow: Option<AsmError>,
    /// Data labels on their own lines, waiting for the next allocation.
    pending_labels: Vec<&'a str>,
}

impl<'a> AsmContext<'a> {
    fn new() -> Self {
        Self {
            symbols: HashMap::new(),
            statements: Vec::new(),
            section: Section::Text,
            code_len: 0,
            data_len: WORD_SIZE,
            overflow: None,
            pending_labels: Vec::new(),
        }
    }

    /// Address the next statement in the current section will occupy.
    fn location(&self) -> i64 {
        match self.section {
            Section::Text => i64::from(CODE_BASE) + (self.code_len * WORD_SIZE) as i64,
            Section::Data => i64::from(DATA_BASE) + self.data_len as i64,
        }
    }

    /// Registers a symbol. Register names and existing symbols are rejected.
    fn define_label(&mut self, line_no: usize, name: &Token<'a>, value: i64) -> Result<(), AsmError> {
        if Register::parse(name.text).is_some() {
            return Err(AsmError::syntax(
                line_no,
                name.column,
                format!("`{}` is a register name", name.text),
            ));
        }
        if name.text == MAILBOX_SYMBOL || self.symbols.contains_key(name.text) {
            return Err(AsmError::syntax(
                line_no,
                name.column,
                format!("duplicate symbol `{}`", name.text),
            ));
        }
        self.symbols.insert(name.text, value);
        Ok(())
    }

    fn resolve_label(&self, name: &str) -> Option<i64> {
        match self.symbols.get(name) {
            Some(value) => Some(*value),
            None if name == MAILBOX_SYMBOL => Some(i64::from(MAILBOX_ADDR)),
            None => None,
        }
    }

    fn evaluate(&self, line_no: usize, expr: &Expr<'a>) -> Result<i64, AsmError> {
        let mut total: i64 = 0;
        for term in &expr.terms {
            let value = match term.value {
                TermValue::Number(n) => n,
                TermValue::Symbol(name) => self
                    .resolve_label(name)
                    .ok_or_else(|| AsmError::unresolved(line_no, term.column, name))?,
            };
            let value = if term.negate {
                value.checked_neg()
            } else {
                Some(value)
            };
            total = value
                .and_then(|v| total.checked_add(v))
                .ok_or_else(|| AsmError::encoding(line_no, expr.column, "expression overflows"))?;
        }
        Ok(total)
    }

    fn first_pass_line(&mut self, line_no: usize, line: Line<'a>) -> Result<(), AsmError> {
        let Line {
            label,
            head,
            operands,
        } = line;
        let directive = head
            .filter(|h| h.text.starts_with('.'))
            .map(|h| h.text.to_ascii_lowercase());

        let in_data = self.section == Section::Data;
        // labels name the aligned word
        if in_data && directive.as_deref() == Some(".word") {
            self.data_len = self.data_len.next_multiple_of(WORD_SIZE);
        }
        if let Some(label) = label {
            let addr = self.location();
            self.define_label(line_no, &label, addr)?;
            if in_data && head.is_none() {
                self.pending_labels.push(label.text);
            }
        }

        let Some(head) = head else {
            return Ok(());
        };
        match directive.as_deref() {
            // `.align` padding is skipped over too
            Some(".align") if in_data => {}
            Some(".word" | ".byte" | ".space" | ".skip" | ".ascii" | ".asciz" | ".string")
                if in_data =>
            {
                let addr = self.location();
                for name in self.pending_labels.drain(..) {
                    self.symbols.insert(name, addr);
                }
            }
            _ => self.pending_labels.clear(),
        }
        match directive {
            Some(name) => self.directive(line_no, head, &name, operands),
            None => self.instruction(line_no, head, operands),
        }
    }

    fn instruction(
        &mut self,
        line_no: usize,
        head: Token<'a>,
        tokens: Vec<Token<'a>>,
    ) -> Result<(), AsmError> {
        if self.section != Section::Text {
            return Err(AsmError::syntax(
                line_no,
                head.column,
                format!("`{}` must appear in the .text section", head.text),
            ));
        }

        let operands = tokens
            .iter()
            .map(|tok| Ok((parse_operand(line_no, tok)?, tok.column)))
            .collect::<Result<Vec<_>, AsmError>>()?;
        let opcode = select_opcode(line_no, &head, &operands)?;

        if self.code_len == REGION_WORDS && self.overflow.is_none() {
            self.overflow = Some(AsmError::encoding(
                line_no,
                head.column,
                format!("code exceeds the {REGION_WORDS}-word code region"),
            ));
        }
        self.code_len += 1;
        self.statements.push(Statement {
            line: line_no,
            column: head.column,
            kind: StatementKind::Instruction { opcode, operands },
        });
        Ok(())
    }

    fn directive(
        &mut self,
        line_no: usize,
        head: Token<'a>,
        name: &str,
        operands: Vec<Token<'a>>,
    ) -> Result<(), AsmError> {
        match name {
            ".text" | ".data" => {
                if let Some(extra) = operands.first() {
                    return Err(AsmError::syntax(
                        line_no,
                        extra.column,
                        format!("`{name}` takes no operands"),
                    ));
                }
                self.section = if name == ".text" {
                    Section::Text
                } else {
                    Section::Data
                };
                Ok(())
            }
            ".global" | ".globl" => {
                if operands.is_empty() {
                    return Err(AsmError::syntax(
                        line_no,
                        head.column,
                        format!("`{name}` expects a symbol"),
                    ));
                }
                for symbol in &operands {
                    expect_identifier(line_no, symbol)?;
                }
                Ok(())
            }
            ".equ" | ".set" => {
                let [symbol, value] = operands.as_slice() else {
                    return Err(AsmError::syntax(
                        line_no,
                        head.column,
                        format!("`{name}` expects a name and a value"),
                    ));
                };
                expect_identifier(line_no, symbol)?;
                let expr = parse_expr(line_no, value.text, value.column)?;
                let v = self.evaluate(line_no, &expr)?;
                if word_bits(v).is_none() {
                    return Err(AsmError::encoding(
                        line_no,
                        value.column,
                        format!("value {v} does not fit in a word"),
                    ));
                }
                self.define_label(line_no, symbol, v)
            }
            ".word" | ".byte" | ".space" | ".skip" | ".ascii" | ".asciz" | ".string"
            | ".align" => {
                if self.section != Section::Data {
                    return Err(AsmError::syntax(
                        line_no,
                        head.column,
                        format!("`{name}` is only allowed in the .data section"),
                    ));
                }
                self.data_directive(line_no, head, name, operands)?;
                if self.data_len > REGION_SIZE && self.overflow.is_none() {
                    self.overflow = Some(AsmError::encoding(
                        line_no,
                        head.column,
                        format!("data exceeds the {REGION_SIZE}-byte data region"),
                    ));
                }
                Ok(())
            }
            _ => Err(AsmError::syntax(
                line_no,
                head.column,
                format!("unknown directive `{}`", head.text),
            )),
        }
    }

    fn data_directive(
        &mut self,
        line_no: usize,
        head: Token<'a>,
        name: &str,
        operands: Vec<Token<'a>>,
    ) -> Result<(), AsmError> {
        if operands.is_empty() {
            return Err(AsmError::syntax(
                line_no,
                head.column,
                format!("`{name}` expects at least one operand"),
            ));
        }
        let offset = self.data_len;

        let kind = match name {
            ".word" | ".byte" => {
                let values = operands
                    .iter()
                    .map(|tok| parse_expr(line_no, tok.text, tok.column))
                    .collect::<Result<Vec<_>, _>>()?;
                if name == ".word" {
                    self.data_len += values.len() * WORD_SIZE;
                    StatementKind::Words { offset, values }
                } else {
                    self.data_len += values.len();
                    StatementKind::Bytes { offset, values }
                }
            }
            ".ascii" | ".asciz" | ".string" => {
                let mut bytes = Vec::new();
                for tok in &operands {
                    if !tok.text.starts_with('"') {
                        return Err(AsmError::syntax(
                            line_no,
                            tok.column,
                            "expected a string literal",
                        ));
                    }
                    bytes.extend(parse_string(line_no, tok)?);
                    if name != ".ascii" {
                        bytes.push(0);
                    }
                }
                self.data_len += bytes.len();
                StatementKind::Ascii { offset, bytes }
            }
            // `.space`, `.skip` and `.align` take a constant known in pass 1
            _ => {
                let [amount] = operands.as_slice() else {
                    return Err(AsmError::syntax(
                        line_no,
                        operands[1].column,
                        format!("`{name}` expects one operand"),
                    ));
                };
                let expr = parse_expr(line_no, amount.text, amount.column)?;
                let value = self.evaluate(line_no, &expr)?;
                if name == ".align" {
                    if !(0..=MAX_ALIGN_POWER).contains(&value) {
                        return Err(AsmError::encoding(
                            line_no,
                            amount.column,
                            format!("alignment power {value} is outside 0..={MAX_ALIGN_POWER}"),
                        ));
                    }
                    self.data_len = self.data_len.next_multiple_of(1 << value);
                } else {
                    let size = usize::try_from(value)
                        .ok()
                        .filter(|&n| n <= REGION_SIZE)
                        .ok_or_else(|| {
                            AsmError::encoding(
                                line_no,
                                amount.column,
                                format!("size {value} is outside 0..={REGION_SIZE}"),
                            )
                        })?;
                    self.data_len += size;
                }
                return Ok(());
            }
        };

        self.statements.push(Statement {
            line: line_no,
            column: head.column,
            kind,
        });
        Ok(())
    }

    /// Fails on the first reference to a symbol that was never defined, then
    /// on the first section overflow.
    fn check_references(&mut self) -> Result<(), AsmError> {
        for stmt in &self.statements {
            for expr in stmt.exprs() {
                for (name, column) in expr.symbols() {
                    if self.resolve_label(name).is_none() {
                        return Err(AsmError::unresolved(stmt.line, column, name));
                    }
                }
            }
        }
        match self.overflow.take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Pass 2: evaluate operands and encode.
    fn emit(self) -> Result<Program, AsmError> {
        let mut code = Vec::with_capacity(self.code_len);
        let mut lines = Vec::with_capacity(self.code_len);
        let mut data = if self.data_len > WORD_SIZE {
            vec![0u8; self.data_len]
        } else {
            Vec::new()
        };

        for stmt in &self.statements {
            match &stmt.kind {
                StatementKind::Instruction { opcode, operands } => {
                    let mut values = Vec::with_capacity(operands.len() + 1);
                    let mut value_column = None;
                    for (operand, column) in operands {
                        match operand {
                            Operand::Reg(reg) => values.push(OperandValue::Reg(*reg)),
                            Operand::MemOffset(reg, expr) => {
                                values.push(OperandValue::Reg(*reg));
                                values.push(OperandValue::Int(self.evaluate(stmt.line, expr)?));
                                value_column.get_or_insert(*column);
                            }
                            Operand::Imm(expr) | Operand::MemAbs(expr) | Operand::Bare(expr) => {
                                values.push(OperandValue::Int(self.evaluate(stmt.line, expr)?));
                                value_column.get_or_insert(*column);
                            }
                            Operand::Str(_) => {
                                return Err(AsmError::syntax(
                                    stmt.line,
                                    *column,
                                    "unexpected string literal",
                                ));
                            }
                        }
                    }
                    let instr = Instruction::from_operands(*opcode, &values).map_err(|e| {
                        AsmError::encoding(stmt.line, value_column.unwrap_or(stmt.column), e.to_string())
                    })?;
                    code.push(instr.encode());
                    lines.push(stmt.line as u32);
                }
                StatementKind::Words { offset, values } => {
                    for (i, expr) in values.iter().enumerate() {
                        let value = self.evaluate(stmt.line, expr)?;
                        let word = word_bits(value).ok_or_else(|| {
                            AsmError::encoding(
                                stmt.line,
                                expr.column,
                                format!("value {value} does not fit in a word"),
                            )
                        })?;
                        let at = offset + i * WORD_SIZE;
                        data[at..at + WORD_SIZE].copy_from_slice(&word.to_le_bytes());
                    }
                }
                StatementKind::Bytes { offset, values } => {
                    for (i, expr) in values.iter().enumerate() {
                        let value = self.evaluate(stmt.line, expr)?;
                        let byte = u8::try_from(value)
                            .ok()
                            .or_else(|| i8::try_from(value).ok().map(|b| b as u8))
                            .ok_or_else(|| {
                                AsmError::encoding(
                                    stmt.line,
                                    expr.column,
                                    format!("value {value} does not fit in a byte"),
                                )
                            })?;
                        data[offset + i] = byte;
                    }
                }
                StatementKind::Ascii { offset, bytes } if !bytes.is_empty() => {
                    data[*offset..*offset + bytes.len()].copy_from_slice(bytes);
                }
                StatementKind::Ascii { .. } => {}
            }
        }

        let mut symbols: Vec<(String, u32)> = self
            .symbols
            .iter()
            .map(|(name, value)| (name.to_string(), *value as u32))
            .collect();
        symbols.sort();

        Ok(Program {
            code,
            data,
            lines,
            symbols,
        })
    }
}

/// Bit pattern of a value that fits a word as either signed or unsigned.
fn word_bits(value: i64) -> Option<u32> {
    u32::try_from(value)
        .ok()
        .or_else(|| i32::try_from(value).ok().map(|v| v as u32))
}

/// Picks the opcode whose operand syntax matches the parsed operands.
fn select_opcode(
    line_no: usize,
    head: &Token<'_>,
    operands: &[(Operand<'_>, usize)],
) -> Result<Opcode, AsmError> {
    let mut forms = Vec::new();
    for opcode in Opcode::with_mnemonic(head.text) {
        let syntax = opcode.syntax();
        if syntax.len() == operands.len()
            && syntax.iter().zip(operands).all(|(s, (op, _))| op.fits(*s))
        {
            return Ok(opcode);
        }
        forms.push(describe_form(opcode));
    }

    if forms.is_empty() {
        return Err(AsmError::syntax(
            line_no,
            head.column,
            format!("unknown instruction `{}`", head.text),
        ));
    }
    Err(AsmError::syntax(
        line_no,
        head.column,
        format!(
            "invalid operands for `{}`; expected {}",
            head.text.to_ascii_uppercase(),
            forms.join(" or ")
        ),
    ))
}

fn describe_form(opcode: Opcode) -> String {
    let syntax: Vec<&str> = opcode.syntax().iter().map(|s| s.describe()).collect();
    if syntax.is_empty() {
        format!("`{}`", opcode.mnemonic())
    } else {
        format!("`{} {}`", opcode.mnemonic(), syntax.join(", "))
    }
}

// =========================
// Line scanning
// =========================

fn is_ident_start(b: u8) -> bool {
    b.is_ascii_alphabetic() || b == b'_' || b == b'.'
}

fn is_ident_char(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_' || b == b'.'
}

fn ident_end(bytes: &[u8], start: usize) -> usize {
    start + bytes[start..].iter().take_while(|&&b| is_ident_char(b)).count()
}

fn skip_whitespace(bytes: &[u8], start: usize) -> usize {
    start
        + bytes[start..]
            .iter()
            .take_while(|b| b.is_ascii_whitespace())
            .count()
}

fn unexpected(line_no: usize, text: &str, pos: usize, column: usize) -> AsmError {
    let found = text[pos..].chars().next().unwrap_or(' ');
    AsmError::syntax(line_no, column, format!("unexpected `{found}`"))
}

fn expect_identifier(line_no: usize, tok: &Token<'_>) -> Result<(), AsmError> {
    let bytes = tok.text.as_bytes();
    if !bytes.is_empty() && is_ident_start(bytes[0]) && ident_end(bytes, 0) == bytes.len() {
        Ok(())
    } else {
        Err(AsmError::syntax(
            line_no,
            tok.column,
            format!("expected a symbol name, found `{}`", tok.text),
        ))
    }
}

/// Drops a `;` or `//` comment that is not inside a string or character literal.
fn strip_comment(line_no: usize, line: &str) -> Result<&str, AsmError> {
    let bytes = line.as_bytes();
    let mut quote: Option<(u8, usize)> = None;
    let mut i = 0;

    while i < bytes.len() {
        let b = bytes[i];
        match quote {
            Some((q, _)) => {
                if b == b'\\' {
                    i += 1;
                } else if b == q {
                    quote = None;
                }
            }
            None => {
                if b == b';' || (b == b'/' && bytes.get(i + 1) == Some(&b'/')) {
                    return Ok(&line[..i]);
                }
                if b == b'"' || b == b'\'' {
                    quote = Some((b, i));
                }
            }
        }
        i += 1;
    }

    if let Some((q, start)) = quote {
        let what = if q == b'"' { "string" } else { "character" };
        return Err(AsmError::syntax(
            line_no,
            start + 1,
            format!("unterminated {what} literal"),
        ));
    }
    Ok(line)
}

/// Splits on commas outside brackets and literals; `column` is that of `text[0]`.
fn split_operands<'a>(
    line_no: usize,
    text: &'a str,
    column: usize,
) -> Result<Vec<Token<'a>>, AsmError> {
    let mut out = Vec::new();
    if text.trim().is_empty() {
        return Ok(out);
    }

    let bytes = text.as_bytes();
    let mut push = |start: usize, end: usize| {
        let segment = &text[start..end];
        let trimmed = segment.trim();
        let lead = segment.len() - segment.trim_start().len();
        if trimmed.is_empty() {
            return Err(AsmError::syntax(line_no, column + start + lead, "empty operand"));
        }
        out.push(Token {
            text: trimmed,
            column: column + start + lead,
        });
        Ok(())
    };

    let mut depth = 0usize;
    let mut quote: Option<u8> = None;
    let mut start = 0;
    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        match quote {
            Some(_) if b == b'\\' => i += 1,
            Some(q) if b == q => quote = None,
            Some(_) => {}
            None => match b {
                b'"' | b'\'' => quote = Some(b),
                b'[' => depth += 1,
                b']' => depth = depth.saturating_sub(1),
                b',' if depth == 0 => {
                    push(start, i)?;
                    start = i + 1;
                }
                _ => {}
            },
        }
        i += 1;
    }
    push(start, bytes.len())?;

    Ok(out)
}

/// Splits a line into label, head and operands.
fn scan_line(line_no: usize, raw: &str) -> Result<Line<'_>, AsmError> {
    let code = strip_comment(line_no, raw)?;
    let bytes = code.as_bytes();
    let mut line = Line::default();

    let mut pos = skip_whitespace(bytes, 0);
    if pos >= bytes.len() {
        return Ok(line);
    }
    if !is_ident_start(bytes[pos]) {
        return Err(unexpected(line_no, code, pos, pos + 1));
    }
    let mut end = ident_end(bytes, pos);

    if bytes.get(end) == Some(&LABEL_SUFFIX) {
        line.label = Some(Token {
            text: &code[pos..end],
            column: pos + 1,
        });
        pos = skip_whitespace(bytes, end + 1);
        if pos >= bytes.len() {
            return Ok(line);
        }
        if !is_ident_start(bytes[pos]) {
            return Err(unexpected(line_no, code, pos, pos + 1));
        }
        end = ident_end(bytes, pos);
    }

    line.head = Some(Token {
        text: &code[pos..end],
        column: pos + 1,
    });
    if end < bytes.len() && !bytes[end].is_ascii_whitespace() {
        return Err(unexpected(line_no, code, end, end + 1));
    }
    line.operands = split_operands(line_no, &code[end..], end + 1)?;
    Ok(line)
}

// =========================
// Operands and expressions
// =========================

/// `Some` for a register name, `None` for text that does not look like one.
fn parse_register(line_no: usize, tok: &Token<'_>) -> Result<Option<Register>, AsmError> {
    if let Some(reg) = Register::parse(tok.text) {
        return Ok(Some(reg));
    }
    let bytes = tok.text.as_bytes();
    if bytes.len() > 1 && matches!(bytes[0], b'r' | b'R') && bytes[1..].iter().all(u8::is_ascii_digit) {
        return Err(AsmError::encoding(
            line_no,
            tok.column,
            format!("invalid register `{}`", tok.text),
        ));
    }
    Ok(None)
}

fn parse_operand<'a>(line_no: usize, tok: &Token<'a>) -> Result<Operand<'a>, AsmError> {
    let text = tok.text;

    if let Some(rest) = text.strip_prefix('[') {
        let Some(inner) = rest.strip_suffix(']') else {
            return Err(AsmError::syntax(
                line_no,
                tok.column,
                "expected `]` to close the memory operand",
            ));
        };
        let parts = split_operands(line_no, inner, tok.column + 1)?;
        return match parts.as_slice() {
            [] => Err(AsmError::syntax(line_no, tok.column, "empty memory operand")),
            [single] => {
                if let Some(expr) = single.text.strip_prefix(IMMEDIATE_PREFIX) {
                    Ok(Operand::MemAbs(parse_expr(line_no, expr, single.column + 1)?))
                } else if let Some(reg) = parse_register(line_no, single)? {
                    Ok(Operand::MemOffset(reg, Expr::zero(single.column)))
                } else {
                    Ok(Operand::MemAbs(parse_expr(line_no, single.text, single.column)?))
                }
            }
            [base, offset] => {
                let reg = parse_register(line_no, base)?.ok_or_else(|| {
                    AsmError::syntax(line_no, base.column, "expected a base register")
                })?;
                let Some(expr) = offset.text.strip_prefix(IMMEDIATE_PREFIX) else {
                    return Err(AsmError::syntax(
                        line_no,
                        offset.column,
                        "expected `#offset`",
                    ));
                };
                Ok(Operand::MemOffset(
                    reg,
                    parse_expr(line_no, expr, offset.column + 1)?,
                ))
            }
            [_, _, extra, ..] => Err(AsmError::syntax(
                line_no,
                extra.column,
                "too many parts in memory operand",
            )),
        };
    }

    if let Some(expr) = text.strip_prefix(IMMEDIATE_PREFIX) {
        return Ok(Operand::Imm(parse_expr(line_no, expr, tok.column + 1)?));
    }
    if text.starts_with('"') {
        return Ok(Operand::Str(parse_string(line_no, tok)?));
    }
    if let Some(reg) = parse_register(line_no, tok)? {
        return Ok(Operand::Reg(reg));
    }
    Ok(Operand::Bare(parse_expr(line_no, text, tok.column)?))
}

fn escape(c: char) -> Option<char> {
    match c {
        'n' => Some('\n'),
        't' => Some('\t'),
        'r' => Some('\r'),
        '0' => Some('\0'),
        '\\' | '\'' | '"' => Some(c),
        _ => None,
    }
}

/// Decodes a double-quoted literal filling the whole token.
fn parse_string(line_no: usize, tok: &Token<'_>) -> Result<Vec<u8>, AsmError> {
    let mut out = Vec::new();
    let mut chars = tok.text.char_indices().skip(1);

    while let Some((idx, c)) = chars.next() {
        match c {
            '\\' => {
                let escaped = chars.next().and_then(|(_, e)| escape(e)).ok_or_else(|| {
                    AsmError::syntax(line_no, tok.column + idx, "unknown escape sequence")
                })?;
                out.push(escaped as u8);
            }
            '"' => {
                if idx + 1 != tok.text.len() {
                    return Err(AsmError::syntax(
                        line_no,
                        tok.column + idx + 1,
                        "unexpected text after string literal",
                    ));
                }
                return Ok(out);
            }
            _ => {
                let mut buf = [0u8; 4];
                out.extend_from_slice(c.encode_utf8(&mut buf).as_bytes());
            }
        }
    }
    Err(AsmError::syntax(line_no, tok.column, "unterminated string literal"))
}

/// Parses `'c'` at the start of `text`; returns the value and bytes consumed.
fn parse_char(line_no: usize, text: &str, column: usize) -> Result<(i64, usize), AsmError> {
    let mut chars = text.char_indices().skip(1);
    let value = match chars.next() {
        Some((_, '\\')) => chars
            .next()
            .and_then(|(_, e)| escape(e))
            .ok_or_else(|| AsmError::syntax(line_no, column, "unknown escape sequence"))?,
        Some((_, '\'')) | None => {
            return Err(AsmError::syntax(line_no, column, "empty character literal"));
        }
        Some((_, c)) => c,
    };
    match chars.next() {
        Some((idx, '\'')) => Ok((i64::from(u32::from(value)), idx + 1)),
        _ => Err(AsmError::syntax(line_no, column, "expected closing `'`")),
    }
}

fn parse_number(line_no: usize, text: &str, column: usize) -> Result<i64, AsmError> {
    let (digits, radix) = if let Some(hex) = text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        (hex, 16)
    } else if let Some(bin) = text.strip_prefix("0b").or_else(|| text.strip_prefix("0B")) {
        (bin, 2)
    } else {
        (text, 10)
    };
    i64::from_str_radix(digits, radix).map_err(|e| match e.kind() {
        IntErrorKind::PosOverflow | IntErrorKind::NegOverflow => {
            AsmError::encoding(line_no, column, format!("number `{text}` is too large"))
        }
        _ => AsmError::syntax(line_no, column, format!("invalid number `{text}`")),
    })
}

/// Parses `term (+|- term)*`; `column` is that of `text[0]`.
fn parse_expr<'a>(line_no: usize, text: &'a str, column: usize) -> Result<Expr<'a>, AsmError> {
    let bytes = text.as_bytes();
    let mut terms = Vec::new();
    let mut negate = false;
    let mut expect_term = true;
    let mut i = skip_whitespace(bytes, 0);
    let start_column = column + i;

    while i < bytes.len() {
        let b = bytes[i];
        if expect_term {
            match b {
                b'-' => {
                    negate = !negate;
                    i += 1;
                }
                b'+' => i += 1,
                b'\'' => {
                    let (value, len) = parse_char(line_no, &text[i..], column + i)?;
                    terms.push(Term {
                        negate,
                        column: column + i,
                        value: TermValue::Number(value),
                    });
                    i += len;
                    negate = false;
                    expect_term = false;
                }
                b'0'..=b'9' => {
                    let end = ident_end(bytes, i);
                    let value = parse_number(line_no, &text[i..end], column + i)?;
                    terms.push(Term {
                        negate,
                        column: column + i,
                        value: TermValue::Number(value),
                    });
                    i = end;
                    negate = false;
                    expect_term = false;
                }
                _ if is_ident_start(b) => {
                    let end = ident_end(bytes, i);
                    terms.push(Term {
                        negate,
                        column: column + i,
                        value: TermValue::Symbol(&text[i..end]),
                    });
                    i = end;
                    negate = false;
                    expect_term = false;
                }
                _ => return Err(unexpected(line_no, text, i, column + i)),
            }
        } else {
            match b {
                b'+' => expect_term = true,
                b'-' => {
                    expect_term = true;
                    negate = true;
                }
                _ => return Err(unexpected(line_no, text, i, column + i)),
            }
            i += 1;
        }
        i = skip_whitespace(bytes, i);
    }

    if expect_term {
        return Err(AsmError::syntax(line_no, column + i, "expected a value"));
    }
    Ok(Expr {
        column: start_column,
        terms,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine::errors::AsmErrorKind;

    fn r(index: u8) -> Register {
        Register::new(index).unwrap()
    }

    fn assemble_err(source: &str) -> AsmError {
        assemble(source).unwrap_err()
    }

    #[test]
    fn assemble_mov_and_mailbox_store() {
        let program = assemble("MOV R0, #4\nSTR R0, [#0x30000]\n").unwrap();
        assert_eq!(program.code, vec![0x1100_0004, 0x4303_0000]);
        assert_eq!(program.lines, vec![1, 2]);
        assert!(program.data.is_empty());
    }

    #[test]
    fn forward_branch_resolves() {
        let program = assemble("  B end\n  NOP\nend: HALT\n").unwrap();
        assert_eq!(
            program.code[0],
            Instruction::B {
                target: CODE_BASE + 8
            }
            .encode()
        );
        assert_eq!(program.symbol("end"), Some(CODE_BASE + 8));
    }

    #[test]
    fn undefined_label_error() {
        let err = assemble_err("MOV R0, #1\nB nowhere\n");
        assert_eq!(err.kind, AsmErrorKind::UnresolvedSymbol);
        assert_eq!((err.line, err.column), (2, 3));
        assert!(err.message.contains("`nowhere`"));
    }

    #[test]
    fn duplicate_label_error() {
        let err = assemble_err("a: NOP\na: NOP\n");
        assert_eq!(err.kind, AsmErrorKind::Syntax);
        assert_eq!((err.line, err.column), (2, 1));

        let err = assemble_err("MAILBOX: NOP\n");
        assert_eq!(err.kind, AsmErrorKind::Syntax);
    }

    #[test]
    fn register_name_cannot_be_label() {
        let err = assemble_err("sp: NOP\n");
        assert_eq!(err.kind, AsmErrorKind::Syntax);
    }

    #[test]
    fn unknown_instruction_error() {
        let err = assemble_err("NOP\n   JUMP R0\n");
        assert_eq!(err.kind, AsmErrorKind::Syntax);
        assert_eq!((err.line, err.column), (2, 4));
        assert!(err.message.contains("`JUMP`"));
    }

    #[test]
    fn operand_shape_mismatch_lists_forms() {
        let err = assemble_err("MOV R0, label\n");
        assert_eq!(err.kind, AsmErrorKind::Syntax);
        assert!(err.message.contains("`MOV register, #immediate`"));
    }

    #[test]
    fn immediate_out_of_range_is_encoding_error() {
        let err = assemble_err("ADD R0, R0, #40000\n");
        assert_eq!(err.kind, AsmErrorKind::Encoding);
        assert_eq!((err.line, err.column), (1, 13));

        let err = assemble_err("MOV R0, #0x80000\n");
        assert_eq!(err.kind, AsmErrorKind::Encoding);
    }

    #[test]
    fn shift_amount_limited_to_word_width() {
        let err = assemble_err("LSL R0, R0, #-1\n");
        assert_eq!(err.kind, AsmErrorKind::Encoding);
        assert_eq!((err.line, err.column), (1, 13));
        assert!(err.message.contains("shift amount"));

        let err = assemble_err("LSR R0, R0, #33\n");
        assert_eq!(err.kind, AsmErrorKind::Encoding);

        let program = assemble("ASR R1, R2, #32\nLSL R1, R2, #0\n").unwrap();
        assert_eq!(
            Instruction::decode(program.code[0]),
            Ok(Instruction::AsrImm {
                rd: r(1),
                rn: r(2),
                imm: 32
            })
        );
    }

    #[test]
    fn invalid_register_is_encoding_error() {
        let err = assemble_err("MOV R15, #1\n");
        assert_eq!(err.kind, AsmErrorKind::Encoding);
        assert_eq!(err.column, 5);
        assert!(err.message.contains("`R15`"));
    }

    #[test]
    fn empty_operand_is_syntax_error() {
        let err = assemble_err("ADD R0,, R1\n");
        assert_eq!(err.kind, AsmErrorKind::Syntax);
        assert_eq!(err.message, "empty operand");
    }

    #[test]
    fn comments_whitespace_and_case_are_insignificant() {
        let plain = assemble("MOV R0, #4\nSTR R0, [#0x30000]\nHALT\n").unwrap();
        let noisy = assemble(
            "; drive up\n\n\tmov r0,#4   // four\n  str R0 , [ #0x30000 ] ; store\n\n halt\n",
        )
        .unwrap();
        assert_eq!(plain.code, noisy.code);
    }

    #[test]
    fn assembly_is_deterministic() {
        let source = ".data\nx: .word 1, 2\ny: .byte 3\n.text\nstart: LDR R0, [x]\nB start\n";
        let first = assemble(source).unwrap();
        let second = assemble(source).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.to_bytes(), second.to_bytes());
    }

    #[test]
    fn expressions_and_constants() {
        let program = assemble(
            ".equ STEP, 4\nMOV R0, #STEP+1\nMOV R1, #'A'\nMOV R2, #-0x10\nMOV R3, #0b101\nMOV R4, #';'\n",
        )
        .unwrap();
        let imms: Vec<i32> = program
            .code
            .iter()
            .map(|&w| match Instruction::decode(w) {
                Ok(Instruction::MovImm { imm, .. }) => imm,
                other => panic!("unexpected {other:?}"),
            })
            .collect();
        assert_eq!(imms, vec![5, 65, -16, 5, 59]);
        assert_eq!(program.symbol("STEP"), Some(4));
    }

    #[test]
    fn equ_rejects_forward_reference() {
        let err = assemble_err(".equ A, B\n.equ B, 1\n");
        assert_eq!(err.kind, AsmErrorKind::UnresolvedSymbol);
    }

    #[test]
    fn mailbox_symbol_is_builtin() {
        let program = assemble("STR R0, [MAILBOX]\n").unwrap();
        assert_eq!(
            Instruction::decode(program.code[0]),
            Ok(Instruction::StrAbs {
                rd: r(0),
                addr: MAILBOX_ADDR
            })
        );
    }

    #[test]
    fn memory_operand_forms() {
        let program = assemble("LDR R1, [SP]\nSTRB R1, [R2, #-1]\nLDRB R3, [#0x30004]\n").unwrap();
        let decoded: Vec<_> = program
            .code
            .iter()
            .map(|&w| Instruction::decode(w).unwrap())
            .collect();
        assert_eq!(
            decoded,
            vec![
                Instruction::LdrOff {
                    rd: r(1),
                    rn: Register::SP,
                    offset: 0
                },
                Instruction::StrbOff {
                    rd: r(1),
                    rn: r(2),
                    offset: -1
                },
                Instruction::LdrbAbs {
                    rd: r(3),
                    addr: DATA_BASE + 4
                },
            ]
        );
    }

    #[test]
    fn data_section_layout() {
        let source = "\
.data
msg:    .asciz \"hi\"
val:    .word 7
buf:    .space 3
tail:   .byte -1, 255
.text
        LDR R0, [val]
        HALT
";
        let program = assemble(source).unwrap();
        assert_eq!(program.symbol("msg"), Some(DATA_BASE + 4));
        assert_eq!(program.symbol("val"), Some(DATA_BASE + 8));
        assert_eq!(program.symbol("buf"), Some(DATA_BASE + 12));
        assert_eq!(program.symbol("tail"), Some(DATA_BASE + 15));
        assert_eq!(&program.data[4..7], b"hi\0");
        assert_eq!(&program.data[8..12], &7u32.to_le_bytes());
        assert_eq!(&program.data[15..17], &[0xFF, 0xFF]);
        assert_eq!(program.data.len(), 17);
        assert_eq!(
            Instruction::decode(program.code[0]),
            Ok(Instruction::LdrAbs {
                rd: r(0),
                addr: DATA_BASE + 8
            })
        );
    }

    #[test]
    fn label_on_own_line_names_aligned_word() {
        let source = "\
.data
b:      .byte 1
w:
        ; comment lines do not detach the label
        .word 5
a:
        .align 4
        .byte 9
end:
.text
        LDR R0, [w]
        HALT
";
        let program = assemble(source).unwrap();
        assert_eq!(program.symbol("b"), Some(DATA_BASE + 4));
        assert_eq!(program.symbol("w"), Some(DATA_BASE + 8));
        assert_eq!(program.symbol("a"), Some(DATA_BASE + 16));
        assert_eq!(program.symbol("end"), Some(DATA_BASE + 17));
        assert_eq!(&program.data[8..12], &5u32.to_le_bytes());
        assert_eq!(program.data[16], 9);
        assert_eq!(
            Instruction::decode(program.code[0]),
            Ok(Instruction::LdrAbs {
                rd: r(0),
                addr: DATA_BASE + 8
            })
        );
    }

    #[test]
    fn word_can_reference_code_label() {
        let program = assemble(".data\nptr: .word entry\n.text\nentry: HALT\n").unwrap();
        assert_eq!(&program.data[4..8], &CODE_BASE.to_le_bytes());
    }

    #[test]
    fn data_directive_outside_data_section() {
        let err = assemble_err(".word 1\n");
        assert_eq!(err.kind, AsmErrorKind::Syntax);
    }

    #[test]
    fn instruction_inside_data_section() {
        let err = assemble_err(".data\nNOP\n");
        assert_eq!(err.kind, AsmErrorKind::Syntax);
        assert_eq!(err.line, 2);
    }

    #[test]
    fn unknown_directive() {
        let err = assemble_err(".bogus 1\n");
        assert_eq!(err.kind, AsmErrorKind::Syntax);
    }

    #[test]
    fn byte_out_of_range() {
        let err = assemble_err(".data\n.byte 256\n");
        assert_eq!(err.kind, AsmErrorKind::Encoding);
    }

    #[test]
    fn unterminated_string() {
        let err = assemble_err(".data\n.ascii \"open\n");
        assert_eq!(err.kind, AsmErrorKind::Syntax);
        assert_eq!((err.line, err.column), (2, 8));
    }

    #[test]
    fn code_overflow_is_encoding_error() {
        let source = "NOP\n".repeat(REGION_WORDS + 1);
        let err = assemble_err(&source);
        assert_eq!(err.kind, AsmErrorKind::Encoding);
        assert_eq!(err.line, REGION_WORDS + 1);

        assert!(assemble(&"NOP\n".repeat(REGION_WORDS)).is_ok());
    }

    #[test]
    fn data_overflow_is_encoding_error() {
        let err = assemble_err(".data\n.space 4092\n.byte 1\n");
        assert_eq!(err.kind, AsmErrorKind::Encoding);
        assert_eq!(err.line, 3);
    }

    #[test]
    fn unresolved_reported_before_overflow() {
        let mut source = "NOP\n".repeat(REGION_WORDS + 1);
        source.push_str("B missing\n");
        let err = assemble_err(&source);
        assert_eq!(err.kind, AsmErrorKind::UnresolvedSymbol);
    }

    #[test]
    fn render_diagnostic_points_at_column() {
        let source = "MOV R0, #1\nB   nowhere\n";
        let err = assemble_err(source);
        let diag = render_diagnostic("prog.asm", source, &err);
        let lines: Vec<&str> = diag.lines().collect();
        assert_eq!(lines[0], "error: unresolved symbol: undefined symbol `nowhere`");
        assert_eq!(lines[1], " --> prog.asm:2:5");
        assert_eq!(lines[3], "   2 | B   nowhere");
        assert_eq!(lines[4], "     |     ^");
    }

    #[test]
    fn split_operands_respects_brackets_and_quotes() {
        let parts = split_operands(1, " R0, [R1, #4], ','", 4).unwrap();
        let texts: Vec<_> = parts.iter().map(|t| t.text).collect();
        assert_eq!(texts, vec!["R0", "[R1, #4]", "','"]);
        assert_eq!(parts[1].column, 9);
    }
}
