//! Frame-state computation: executing a CIE/FDE instruction stream up to
//! a target address.
//!
//! The interpreter produces one [FrameState] per unwind step: the rule
//! for the canonical frame address and a rule per register column.
//! Expression rules keep their DWARF bytes; only the small subset needed
//! to resolve a CFA and saved-register locations is evaluated here, a
//! complete expression evaluator is out of scope.

use std::collections::BTreeMap;
use std::ops::Range;

use crate::cfi::{CieRecord, FdeRecord};
use crate::encoding::{Cursor, PointerBases};
use crate::{Error, Result};

const DW_CFA_NOP: u8 = 0x00;
const DW_CFA_SET_LOC: u8 = 0x01;
const DW_CFA_ADVANCE_LOC1: u8 = 0x02;
const DW_CFA_ADVANCE_LOC2: u8 = 0x03;
const DW_CFA_ADVANCE_LOC4: u8 = 0x04;
const DW_CFA_OFFSET_EXTENDED: u8 = 0x05;
const DW_CFA_RESTORE_EXTENDED: u8 = 0x06;
const DW_CFA_UNDEFINED: u8 = 0x07;
const DW_CFA_SAME_VALUE: u8 = 0x08;
const DW_CFA_REGISTER: u8 = 0x09;
const DW_CFA_REMEMBER_STATE: u8 = 0x0a;
const DW_CFA_RESTORE_STATE: u8 = 0x0b;
const DW_CFA_DEF_CFA: u8 = 0x0c;
const DW_CFA_DEF_CFA_REGISTER: u8 = 0x0d;
const DW_CFA_DEF_CFA_OFFSET: u8 = 0x0e;
const DW_CFA_DEF_CFA_EXPRESSION: u8 = 0x0f;
const DW_CFA_EXPRESSION: u8 = 0x10;
const DW_CFA_OFFSET_EXTENDED_SF: u8 = 0x11;
const DW_CFA_DEF_CFA_SF: u8 = 0x12;
const DW_CFA_DEF_CFA_OFFSET_SF: u8 = 0x13;
const DW_CFA_VAL_OFFSET: u8 = 0x14;
const DW_CFA_VAL_OFFSET_SF: u8 = 0x15;
const DW_CFA_VAL_EXPRESSION: u8 = 0x16;
const DW_CFA_GNU_ARGS_SIZE: u8 = 0x2e;
const DW_CFA_GNU_NEGATIVE_OFFSET_EXTENDED: u8 = 0x2f;

/// How instructions outside the implemented set are treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvalMode {
    /// Stop interpreting and return the rows computed so far.
    Advisory,

    /// Fail on the first unimplemented instruction.
    Strict,
}

/// Rule producing the canonical frame address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CfaRule {
    /// CFA = value of `register` + `offset`.
    RegisterOffset {
        /// Base register.
        register: u16,
        /// Signed addend.
        offset: i64,
    },

    /// CFA = result of the DWARF expression at this section range.
    Expression(Range<usize>),
}

/// Rule recovering one register's value in the caller's frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegisterRule {
    /// The value is unrecoverable.
    Undefined,

    /// The register was not touched.
    SameValue,

    /// The value was saved at CFA + offset.
    Offset(i64),

    /// The value is CFA + offset itself.
    ValOffset(i64),

    /// The value lives in another register.
    Register(u16),

    /// The value was saved at the address an expression computes.
    Expression(Range<usize>),

    /// The value is what an expression computes.
    ValExpression(Range<usize>),
}

/// Unwind rules in effect at one address.
#[derive(Debug, Clone)]
pub struct FrameState {
    /// Canonical-frame-address rule.
    pub cfa: CfaRule,

    /// Per-register rules. A register with no entry keeps its value
    /// (same-value default).
    pub registers: BTreeMap<u16, RegisterRule>,

    /// Column holding the return address.
    pub return_address_register: u16,

    /// Whether the covering FDE describes a signal frame.
    pub signal_frame: bool,
}

/// Register and memory access an expression evaluation may need.
pub trait ExprContext {
    /// Current value of a register, if known.
    fn register(&mut self, register: u16) -> Option<u64>;

    /// One address-sized word of memory, if readable.
    fn read_word(&mut self, addr: u64) -> Option<u64>;
}

/// Executes the CIE's initial instructions and the FDE's instruction
/// stream up to `target`, producing the rules in effect there.
pub fn evaluate(
    data: &[u8],
    section_vaddr: u64,
    little_endian: bool,
    cie: &CieRecord,
    fde: &FdeRecord,
    target: u64,
    mode: EvalMode,
) -> Result<FrameState> {
    let mut interp = Interpreter {
        data,
        section_vaddr,
        little_endian,
        cie,
        loc: fde.start,
        target,
        mode,
        cfa: None,
        registers: BTreeMap::new(),
        initial_registers: BTreeMap::new(),
        stack: Vec::new(),
    };

    let reached_target = interp.run(cie.initial_instructions.clone())?;

    interp.initial_registers = interp.registers.clone();

    if !reached_target {
        interp.run(fde.instructions.clone())?;
    }

    let cfa = interp.cfa.ok_or(Error::BadProgram("no CFA rule defined"))?;

    Ok(FrameState {
        cfa,
        registers: interp.registers,
        return_address_register: cie.return_address_register,
        signal_frame: cie.signal_frame,
    })
}

struct Interpreter<'a> {
    data: &'a [u8],
    section_vaddr: u64,
    little_endian: bool,
    cie: &'a CieRecord,

    loc: u64,
    target: u64,
    mode: EvalMode,

    cfa: Option<CfaRule>,
    registers: BTreeMap<u16, RegisterRule>,
    initial_registers: BTreeMap<u16, RegisterRule>,
    stack: Vec<(Option<CfaRule>, BTreeMap<u16, RegisterRule>)>,
}

impl Interpreter<'_> {
    /// Runs one instruction stream. Returns whether a row past the target
    /// address was reached (the current rules then answer the query).
    fn run(&mut self, range: Range<usize>) -> Result<bool> {
        let end = range.end.min(self.data.len());

        let mut cursor = Cursor::new(&self.data[..end], self.little_endian);
        cursor.set_pos(range.start);

        while cursor.pos() < end {
            let op = cursor.u8()?;

            let advance = match op >> 6 {
                1 => Some(u64::from(op & 0x3f) * self.cie.code_align),
                2 => {
                    let offset = cursor.uleb128()? as i64 * self.cie.data_align;
                    self.registers
                        .insert(u16::from(op & 0x3f), RegisterRule::Offset(offset));
                    None
                }
                3 => {
                    self.restore(u16::from(op & 0x3f));
                    None
                }
                _ => self.extended(op, &mut cursor)?,
            };

            if let Some(delta) = advance {
                let next_loc = self.loc.saturating_add(delta);

                if next_loc > self.target {
                    return Ok(true);
                }

                self.loc = next_loc;
            }
        }

        Ok(false)
    }

    /// Handles one zero-primary-opcode instruction. Returns an advance
    /// delta when the instruction starts a new row.
    fn extended(&mut self, op: u8, cursor: &mut Cursor<'_>) -> Result<Option<u64>> {
        match op {
            DW_CFA_NOP => (),
            DW_CFA_SET_LOC => {
                let addr = cursor.read_encoded(
                    self.cie.fde_encoding,
                    self.section_vaddr,
                    &PointerBases::default(),
                    self.cie.address_size,
                )?;

                if addr > self.target {
                    return Ok(Some(u64::MAX));
                }

                self.loc = addr;
            }
            DW_CFA_ADVANCE_LOC1 => {
                return Ok(Some(u64::from(cursor.u8()?) * self.cie.code_align));
            }
            DW_CFA_ADVANCE_LOC2 => {
                return Ok(Some(u64::from(cursor.u16()?) * self.cie.code_align));
            }
            DW_CFA_ADVANCE_LOC4 => {
                return Ok(Some(u64::from(cursor.u32()?) * self.cie.code_align));
            }
            DW_CFA_OFFSET_EXTENDED => {
                let register = self.register(cursor.uleb128()?)?;
                let offset = cursor.uleb128()? as i64 * self.cie.data_align;
                self.registers.insert(register, RegisterRule::Offset(offset));
            }
            DW_CFA_OFFSET_EXTENDED_SF => {
                let register = self.register(cursor.uleb128()?)?;
                let offset = cursor.sleb128()? * self.cie.data_align;
                self.registers.insert(register, RegisterRule::Offset(offset));
            }
            DW_CFA_GNU_NEGATIVE_OFFSET_EXTENDED => {
                let register = self.register(cursor.uleb128()?)?;
                let offset = -(cursor.uleb128()? as i64) * self.cie.data_align;
                self.registers.insert(register, RegisterRule::Offset(offset));
            }
            DW_CFA_RESTORE_EXTENDED => {
                let register = self.register(cursor.uleb128()?)?;
                self.restore(register);
            }
            DW_CFA_UNDEFINED => {
                let register = self.register(cursor.uleb128()?)?;
                self.registers.insert(register, RegisterRule::Undefined);
            }
            DW_CFA_SAME_VALUE => {
                let register = self.register(cursor.uleb128()?)?;
                self.registers.insert(register, RegisterRule::SameValue);
            }
            DW_CFA_REGISTER => {
                let register = self.register(cursor.uleb128()?)?;
                let source = self.register(cursor.uleb128()?)?;
                self.registers
                    .insert(register, RegisterRule::Register(source));
            }
            DW_CFA_REMEMBER_STATE => {
                self.stack.push((self.cfa.clone(), self.registers.clone()));
            }
            DW_CFA_RESTORE_STATE => {
                let (cfa, registers) = self
                    .stack
                    .pop()
                    .ok_or(Error::BadProgram("restore_state on an empty stack"))?;

                self.cfa = cfa;
                self.registers = registers;
            }
            DW_CFA_DEF_CFA => {
                let register = self.register(cursor.uleb128()?)?;
                let offset = cursor.uleb128()? as i64;
                self.cfa = Some(CfaRule::RegisterOffset { register, offset });
            }
            DW_CFA_DEF_CFA_SF => {
                let register = self.register(cursor.uleb128()?)?;
                let offset = cursor.sleb128()? * self.cie.data_align;
                self.cfa = Some(CfaRule::RegisterOffset { register, offset });
            }
            DW_CFA_DEF_CFA_REGISTER => {
                let register = self.register(cursor.uleb128()?)?;

                match self.cfa {
                    Some(CfaRule::RegisterOffset {
                        register: ref mut r,
                        ..
                    }) => *r = register,
                    _ => return Err(Error::BadProgram("CFA register change without a CFA")),
                }
            }
            DW_CFA_DEF_CFA_OFFSET => {
                let offset = cursor.uleb128()? as i64;

                match self.cfa {
                    Some(CfaRule::RegisterOffset { offset: ref mut o, .. }) => *o = offset,
                    _ => return Err(Error::BadProgram("CFA offset change without a CFA")),
                }
            }
            DW_CFA_DEF_CFA_OFFSET_SF => {
                let offset = cursor.sleb128()? * self.cie.data_align;

                match self.cfa {
                    Some(CfaRule::RegisterOffset { offset: ref mut o, .. }) => *o = offset,
                    _ => return Err(Error::BadProgram("CFA offset change without a CFA")),
                }
            }
            DW_CFA_DEF_CFA_EXPRESSION => {
                let block = self.block(cursor)?;
                self.cfa = Some(CfaRule::Expression(block));
            }
            DW_CFA_EXPRESSION => {
                let register = self.register(cursor.uleb128()?)?;
                let block = self.block(cursor)?;
                self.registers
                    .insert(register, RegisterRule::Expression(block));
            }
            DW_CFA_VAL_OFFSET => {
                let register = self.register(cursor.uleb128()?)?;
                let offset = cursor.uleb128()? as i64 * self.cie.data_align;
                self.registers
                    .insert(register, RegisterRule::ValOffset(offset));
            }
            DW_CFA_VAL_OFFSET_SF => {
                let register = self.register(cursor.uleb128()?)?;
                let offset = cursor.sleb128()? * self.cie.data_align;
                self.registers
                    .insert(register, RegisterRule::ValOffset(offset));
            }
            DW_CFA_VAL_EXPRESSION => {
                let register = self.register(cursor.uleb128()?)?;
                let block = self.block(cursor)?;
                self.registers
                    .insert(register, RegisterRule::ValExpression(block));
            }
            DW_CFA_GNU_ARGS_SIZE => {
                cursor.uleb128()?;
            }
            op => match self.mode {
                EvalMode::Strict => return Err(Error::UnsupportedOpcode(op)),
                EvalMode::Advisory => {
                    // The operand layout is unknown, so the rest of the
                    // stream is unusable; the rows so far still stand.
                    tracing::warn!(op = format_args!("{op:#x}"), "unknown CFI opcode");
                    return Ok(Some(u64::MAX));
                }
            },
        }

        Ok(None)
    }

    /// Reads an expression block, returning its absolute section range.
    fn block(&self, cursor: &mut Cursor<'_>) -> Result<Range<usize>> {
        let len = cursor.uleb128()? as usize;
        let start = cursor.pos();

        cursor.skip(len)?;

        Ok(start..start + len)
    }

    fn restore(&mut self, register: u16) {
        match self.initial_registers.get(&register) {
            Some(rule) => {
                self.registers.insert(register, rule.clone());
            }
            None => {
                self.registers.remove(&register);
            }
        }
    }

    fn register(&self, value: u64) -> Result<u16> {
        u16::try_from(value).map_err(|_| Error::BadProgram("register number out of range"))
    }
}

/// Resolves a frame state's CFA rule to a value.
pub fn cfa_value(
    data: &[u8],
    little_endian: bool,
    address_size: u8,
    state: &FrameState,
    ctx: &mut dyn ExprContext,
) -> Result<u64> {
    match state.cfa {
        CfaRule::RegisterOffset { register, offset } => ctx
            .register(register)
            .map(|value| value.wrapping_add_signed(offset))
            .ok_or(Error::ExpressionOperand),
        CfaRule::Expression(ref range) => {
            let block = data.get(range.clone()).ok_or(Error::Truncated(range.start))?;

            evaluate_expression(block, little_endian, address_size, None, ctx)
        }
    }
}

/// Resolves one register's unwound value under a frame state.
///
/// Returns `None` when the rule says the value is unrecoverable or the
/// context cannot provide an operand.
pub fn register_value(
    data: &[u8],
    little_endian: bool,
    address_size: u8,
    state: &FrameState,
    register: u16,
    cfa: u64,
    ctx: &mut dyn ExprContext,
) -> Result<Option<u64>> {
    let rule = state
        .registers
        .get(&register)
        .unwrap_or(&RegisterRule::SameValue);

    let value = match *rule {
        RegisterRule::Undefined => None,
        RegisterRule::SameValue => ctx.register(register),
        RegisterRule::Offset(offset) => ctx.read_word(cfa.wrapping_add_signed(offset)),
        RegisterRule::ValOffset(offset) => Some(cfa.wrapping_add_signed(offset)),
        RegisterRule::Register(source) => ctx.register(source),
        RegisterRule::Expression(ref range) => {
            let block = data.get(range.clone()).ok_or(Error::Truncated(range.start))?;
            let addr = evaluate_expression(block, little_endian, address_size, Some(cfa), ctx)?;

            ctx.read_word(addr)
        }
        RegisterRule::ValExpression(ref range) => {
            let block = data.get(range.clone()).ok_or(Error::Truncated(range.start))?;

            Some(evaluate_expression(
                block,
                little_endian,
                address_size,
                Some(cfa),
                ctx,
            )?)
        }
    };

    Ok(value)
}

const DW_OP_ADDR: u8 = 0x03;
const DW_OP_DEREF: u8 = 0x06;
const DW_OP_CONST1U: u8 = 0x08;
const DW_OP_CONST1S: u8 = 0x09;
const DW_OP_CONST2U: u8 = 0x0a;
const DW_OP_CONST2S: u8 = 0x0b;
const DW_OP_CONST4U: u8 = 0x0c;
const DW_OP_CONST4S: u8 = 0x0d;
const DW_OP_CONST8U: u8 = 0x0e;
const DW_OP_CONST8S: u8 = 0x0f;
const DW_OP_CONSTU: u8 = 0x10;
const DW_OP_CONSTS: u8 = 0x11;
const DW_OP_DUP: u8 = 0x12;
const DW_OP_DROP: u8 = 0x13;
const DW_OP_SWAP: u8 = 0x16;
const DW_OP_AND: u8 = 0x1a;
const DW_OP_MINUS: u8 = 0x1c;
const DW_OP_MUL: u8 = 0x1e;
const DW_OP_PLUS: u8 = 0x22;
const DW_OP_PLUS_UCONST: u8 = 0x23;
const DW_OP_SHL: u8 = 0x24;
const DW_OP_SHR: u8 = 0x25;
const DW_OP_LIT0: u8 = 0x30;
const DW_OP_LIT31: u8 = 0x4f;
const DW_OP_REG0: u8 = 0x50;
const DW_OP_REG31: u8 = 0x6f;
const DW_OP_BREG0: u8 = 0x70;
const DW_OP_BREG31: u8 = 0x8f;
const DW_OP_REGX: u8 = 0x90;
const DW_OP_BREGX: u8 = 0x92;

/// Evaluates the unwinding subset of DWARF expressions.
///
/// `initial` seeds the stack (the CFA, for register-rule expressions).
pub fn evaluate_expression(
    block: &[u8],
    little_endian: bool,
    address_size: u8,
    initial: Option<u64>,
    ctx: &mut dyn ExprContext,
) -> Result<u64> {
    let mut cursor = Cursor::new(block, little_endian);
    let mut stack: Vec<u64> = initial.into_iter().collect();

    fn pop(stack: &mut Vec<u64>) -> Result<u64> {
        stack.pop().ok_or(Error::BadProgram("expression stack underflow"))
    }

    while cursor.remaining() > 0 {
        let op = cursor.u8()?;

        match op {
            DW_OP_ADDR => {
                let value = if address_size == 8 {
                    cursor.u64()?
                } else {
                    u64::from(cursor.u32()?)
                };
                stack.push(value);
            }
            DW_OP_DEREF => {
                let addr = pop(&mut stack)?;
                let value = ctx.read_word(addr).ok_or(Error::ExpressionOperand)?;
                stack.push(value);
            }
            DW_OP_CONST1U => stack.push(u64::from(cursor.u8()?)),
            DW_OP_CONST1S => stack.push(cursor.u8()? as i8 as i64 as u64),
            DW_OP_CONST2U => stack.push(u64::from(cursor.u16()?)),
            DW_OP_CONST2S => stack.push(cursor.u16()? as i16 as i64 as u64),
            DW_OP_CONST4U => stack.push(u64::from(cursor.u32()?)),
            DW_OP_CONST4S => stack.push(cursor.u32()? as i32 as i64 as u64),
            DW_OP_CONST8U | DW_OP_CONST8S => stack.push(cursor.u64()?),
            DW_OP_CONSTU => stack.push(cursor.uleb128()?),
            DW_OP_CONSTS => stack.push(cursor.sleb128()? as u64),
            DW_OP_DUP => {
                let top = *stack.last().ok_or(Error::BadProgram("expression stack underflow"))?;
                stack.push(top);
            }
            DW_OP_DROP => {
                pop(&mut stack)?;
            }
            DW_OP_SWAP => {
                let a = pop(&mut stack)?;
                let b = pop(&mut stack)?;
                stack.push(a);
                stack.push(b);
            }
            DW_OP_AND => {
                let a = pop(&mut stack)?;
                let b = pop(&mut stack)?;
                stack.push(a & b);
            }
            DW_OP_MINUS => {
                let a = pop(&mut stack)?;
                let b = pop(&mut stack)?;
                stack.push(b.wrapping_sub(a));
            }
            DW_OP_MUL => {
                let a = pop(&mut stack)?;
                let b = pop(&mut stack)?;
                stack.push(a.wrapping_mul(b));
            }
            DW_OP_PLUS => {
                let a = pop(&mut stack)?;
                let b = pop(&mut stack)?;
                stack.push(a.wrapping_add(b));
            }
            DW_OP_PLUS_UCONST => {
                let addend = cursor.uleb128()?;
                let a = pop(&mut stack)?;
                stack.push(a.wrapping_add(addend));
            }
            DW_OP_SHL => {
                let a = pop(&mut stack)?;
                let b = pop(&mut stack)?;
                stack.push(b.wrapping_shl(a as u32));
            }
            DW_OP_SHR => {
                let a = pop(&mut stack)?;
                let b = pop(&mut stack)?;
                stack.push(b.wrapping_shr(a as u32));
            }
            op @ DW_OP_LIT0..=DW_OP_LIT31 => stack.push(u64::from(op - DW_OP_LIT0)),
            op @ DW_OP_REG0..=DW_OP_REG31 => {
                let value = ctx
                    .register(u16::from(op - DW_OP_REG0))
                    .ok_or(Error::ExpressionOperand)?;
                stack.push(value);
            }
            op @ DW_OP_BREG0..=DW_OP_BREG31 => {
                let offset = cursor.sleb128()?;
                let value = ctx
                    .register(u16::from(op - DW_OP_BREG0))
                    .ok_or(Error::ExpressionOperand)?;
                stack.push(value.wrapping_add_signed(offset));
            }
            DW_OP_REGX => {
                let register = u16::try_from(cursor.uleb128()?)
                    .map_err(|_| Error::BadProgram("register number out of range"))?;
                let value = ctx.register(register).ok_or(Error::ExpressionOperand)?;
                stack.push(value);
            }
            DW_OP_BREGX => {
                let register = u16::try_from(cursor.uleb128()?)
                    .map_err(|_| Error::BadProgram("register number out of range"))?;
                let offset = cursor.sleb128()?;
                let value = ctx.register(register).ok_or(Error::ExpressionOperand)?;
                stack.push(value.wrapping_add_signed(offset));
            }
            op => return Err(Error::UnsupportedExpression(op)),
        }
    }

    let value = pop(&mut stack)?;

    Ok(if address_size == 4 {
        value & 0xffff_ffff
    } else {
        value
    })
}
