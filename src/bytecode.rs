//! Module defining the bytecode instruction set and the disassembler.
//!
//! Instructions are variable-length: a one-byte opcode followed by 0–5
//! operands. Operand sizes are fixed per opcode and operand position;
//! the emitter and the disassembler share the same tables so they cannot
//! drift apart.

use std::fmt::Write;

/// A bytecode instruction opcode.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
#[repr(u8)]
pub enum Opcode {
    Breakpoint = 0x01,
    LoadInt8,
    LoadConst8,
    LoadConst,
    LoadFun8,
    LoadFun,
    LoadTrue,
    LoadFalse,
    LoadVoid,
    LoadArray,
    LoadObj,
    LoadObjProto,
    LoadIter,
    Move,
    Get,
    GetElem8,
    GetRange,
    GetProp8,
    GetProto,
    GetGlobal,
    GetModGlobal,
    GetModElem,
    GetMod,
    Set,
    SetElem8,
    SetProp8,
    SetGlobal,
    Push,
    PushEx,
    Del,
    DelProp8,
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Shl,
    Shr,
    Shru,
    Not,
    And,
    Or,
    Xor,
    Type,
    CmpEq,
    CmpNe,
    CmpLe,
    CmpLt,
    HasDp,
    HasDpProp8,
    HasSh,
    HasShProp8,
    Instanceof,
    Jump,
    JumpCond,
    JumpNotCond,
    NextJump,
    Next,
    Bind,
    BindSelf,
    BindDefaults,
    Call,
    CallN,
    CallFun,
    Return,
    TailCall,
    TailCallN,
    TailCallFun,
    Yield,
    Throw,
    Catch,
    Cancel,
}

pub const MAX_OPCODE: u8 = Opcode::Cancel as u8;

impl Opcode {
    #[must_use]
    pub fn from_u8(byte: u8) -> Option<Self> {
        if byte >= Opcode::Breakpoint as u8 && byte <= MAX_OPCODE {
            // The enum is a dense range starting at Breakpoint.
            Some(unsafe { std::mem::transmute::<u8, Opcode>(byte) })
        } else {
            None
        }
    }

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Breakpoint => "BREAKPOINT",
            Self::LoadInt8 => "LOAD.INT8",
            Self::LoadConst8 => "LOAD.CONST8",
            Self::LoadConst => "LOAD.CONST",
            Self::LoadFun8 => "LOAD.FUN8",
            Self::LoadFun => "LOAD.FUN",
            Self::LoadTrue => "LOAD.TRUE",
            Self::LoadFalse => "LOAD.FALSE",
            Self::LoadVoid => "LOAD.VOID",
            Self::LoadArray => "LOAD.ARRAY",
            Self::LoadObj => "LOAD.OBJ",
            Self::LoadObjProto => "LOAD.OBJ.PROTO",
            Self::LoadIter => "LOAD.ITER",
            Self::Move => "MOVE",
            Self::Get => "GET",
            Self::GetElem8 => "GET.ELEM8",
            Self::GetRange => "GET.RANGE",
            Self::GetProp8 => "GET.PROP8",
            Self::GetProto => "GET.PROTO",
            Self::GetGlobal => "GET.GLOBAL",
            Self::GetModGlobal => "GET.MOD.GLOBAL",
            Self::GetModElem => "GET.MOD.ELEM",
            Self::GetMod => "GET.MOD",
            Self::Set => "SET",
            Self::SetElem8 => "SET.ELEM8",
            Self::SetProp8 => "SET.PROP8",
            Self::SetGlobal => "SET.GLOBAL",
            Self::Push => "PUSH",
            Self::PushEx => "PUSH.EX",
            Self::Del => "DEL",
            Self::DelProp8 => "DEL.PROP8",
            Self::Add => "ADD",
            Self::Sub => "SUB",
            Self::Mul => "MUL",
            Self::Div => "DIV",
            Self::Mod => "MOD",
            Self::Shl => "SHL",
            Self::Shr => "SHR",
            Self::Shru => "SHRU",
            Self::Not => "NOT",
            Self::And => "AND",
            Self::Or => "OR",
            Self::Xor => "XOR",
            Self::Type => "TYPE",
            Self::CmpEq => "CMP.EQ",
            Self::CmpNe => "CMP.NE",
            Self::CmpLe => "CMP.LE",
            Self::CmpLt => "CMP.LT",
            Self::HasDp => "HAS.DP",
            Self::HasDpProp8 => "HAS.DP.PROP8",
            Self::HasSh => "HAS.SH",
            Self::HasShProp8 => "HAS.SH.PROP8",
            Self::Instanceof => "INSTANCEOF",
            Self::Jump => "JUMP",
            Self::JumpCond => "JUMP.COND",
            Self::JumpNotCond => "JUMP.NOT.COND",
            Self::NextJump => "NEXT.JUMP",
            Self::Next => "NEXT",
            Self::Bind => "BIND",
            Self::BindSelf => "BIND.SELF",
            Self::BindDefaults => "BIND.DEFAULTS",
            Self::Call => "CALL",
            Self::CallN => "CALL.N",
            Self::CallFun => "CALL.FUN",
            Self::Return => "RETURN",
            Self::TailCall => "TAIL.CALL",
            Self::TailCallN => "TAIL.CALL.N",
            Self::TailCallFun => "TAIL.CALL.FUN",
            Self::Yield => "YIELD",
            Self::Throw => "THROW",
            Self::Catch => "CATCH",
            Self::Cancel => "CANCEL",
        }
    }

    #[must_use]
    pub const fn num_operands(self) -> usize {
        match self {
            Self::Breakpoint | Self::Cancel => 0,

            Self::LoadTrue
            | Self::LoadFalse
            | Self::LoadVoid
            | Self::LoadObj
            | Self::Jump
            | Self::Return
            | Self::Throw => 1,

            Self::LoadConst8
            | Self::LoadConst
            | Self::LoadInt8
            | Self::LoadFun8
            | Self::LoadFun
            | Self::LoadArray
            | Self::LoadObjProto
            | Self::LoadIter
            | Self::Move
            | Self::GetProto
            | Self::GetGlobal
            | Self::SetGlobal
            | Self::GetMod
            | Self::Del
            | Self::DelProp8
            | Self::Not
            | Self::Type
            | Self::JumpCond
            | Self::JumpNotCond
            | Self::BindSelf
            | Self::BindDefaults
            | Self::Catch
            | Self::Push
            | Self::PushEx
            | Self::Yield
            | Self::Next => 2,

            Self::Get
            | Self::GetElem8
            | Self::GetProp8
            | Self::GetModGlobal
            | Self::GetModElem
            | Self::Set
            | Self::SetElem8
            | Self::SetProp8
            | Self::Add
            | Self::Sub
            | Self::Mul
            | Self::Div
            | Self::Mod
            | Self::Shl
            | Self::Shr
            | Self::Shru
            | Self::And
            | Self::Or
            | Self::Xor
            | Self::CmpEq
            | Self::CmpNe
            | Self::CmpLe
            | Self::CmpLt
            | Self::HasDp
            | Self::HasDpProp8
            | Self::HasSh
            | Self::HasShProp8
            | Self::Instanceof
            | Self::Bind
            | Self::NextJump
            | Self::TailCall
            | Self::TailCallFun => 3,

            Self::Call | Self::CallFun | Self::TailCallN | Self::GetRange => 4,

            Self::CallN => 5,
        }
    }

    /// Size in bytes of the given operand.
    #[must_use]
    pub const fn operand_size(self, op: usize) -> usize {
        match self {
            Self::LoadConst | Self::LoadFun | Self::GetMod => {
                if op > 0 {
                    2
                } else {
                    1
                }
            }

            Self::GetGlobal | Self::Catch => {
                if op > 0 {
                    4
                } else {
                    1
                }
            }

            Self::GetModElem => match op {
                0 => 1,
                1 => 2,
                _ => 4,
            },

            Self::SetGlobal | Self::Jump | Self::JumpCond | Self::JumpNotCond => {
                if op == 0 {
                    4
                } else {
                    1
                }
            }

            Self::GetModGlobal => {
                if op == 1 {
                    2
                } else {
                    1
                }
            }

            Self::NextJump => {
                if op == 2 {
                    4
                } else {
                    1
                }
            }

            _ => 1,
        }
    }

    /// For a PC-relative jump operand, the number of operand bytes that
    /// follow it within the same instruction; the jump base is the
    /// address just past those. `None` when the operand is not an
    /// offset.
    #[must_use]
    pub const fn offset_operand_tail(self, op: usize) -> Option<usize> {
        match (self, op) {
            (Self::Jump, 0) => Some(0),
            (Self::JumpCond | Self::JumpNotCond, 0) => Some(1),
            (Self::Catch, 1) => Some(0),
            (Self::NextJump, 2) => Some(0),
            _ => None,
        }
    }

    /// Does this instruction transfer control via a PC-relative offset?
    #[must_use]
    pub fn jump_operand(self) -> Option<usize> {
        match self {
            Self::Jump | Self::JumpCond | Self::JumpNotCond => Some(0),
            Self::Catch => Some(1),
            Self::NextJump => Some(2),
            _ => None,
        }
    }

    /// Is the given operand a register index?
    #[must_use]
    pub const fn is_register(self, op: usize) -> bool {
        match self {
            Self::LoadConst8
            | Self::LoadConst
            | Self::LoadInt8
            | Self::LoadFun8
            | Self::LoadFun
            | Self::LoadArray
            | Self::LoadObjProto
            | Self::LoadIter
            | Self::GetGlobal
            | Self::GetModElem
            | Self::GetMod
            | Self::DelProp8
            | Self::BindSelf
            | Self::Catch => op == 0,

            Self::GetElem8 | Self::GetProp8 | Self::HasDpProp8 | Self::HasShProp8 => op <= 1,

            Self::GetModGlobal | Self::SetElem8 | Self::SetProp8 | Self::Bind => op != 1,

            Self::SetGlobal | Self::JumpCond | Self::JumpNotCond => op != 0,

            Self::CallN => op < 4,

            Self::CallFun | Self::TailCallN => op < 3,

            Self::TailCallFun | Self::NextJump => op < 2,

            Self::Jump | Self::Breakpoint | Self::Cancel => false,

            _ => true,
        }
    }

    /// Is the given one-byte operand sign-extended?
    #[must_use]
    pub const fn is_signed(self, op: usize) -> bool {
        matches!(
            (self, op),
            (Self::LoadInt8, 1) | (Self::GetElem8, 2) | (Self::SetElem8, 1)
        )
    }

    /// Does the given operand index the constant pool?
    #[must_use]
    pub const fn is_constant(self, op: usize) -> bool {
        match self {
            Self::LoadConst8
            | Self::LoadConst
            | Self::LoadFun8
            | Self::LoadFun
            | Self::GetProp8
            | Self::SetProp8
            | Self::DelProp8
            | Self::HasDpProp8
            | Self::HasShProp8 => !self.is_register(op),

            _ => false,
        }
    }

    /// Total encoded size of an instruction with this opcode.
    #[must_use]
    pub fn instr_size(self) -> usize {
        let mut size = 1;
        for op in 0..self.num_operands() {
            size += self.operand_size(op);
        }
        size
    }
}

/// One decoded instruction.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedInstr {
    pub offset: u32,
    pub opcode: Opcode,
    /// Operand values; signed slots are sign-extended.
    pub operands: Vec<i64>,
    pub size: usize,
}

impl DecodedInstr {
    /// Absolute target of this instruction's jump operand, if it has
    /// one. The base is the address immediately after the operand plus
    /// any tail operands of the same instruction.
    #[must_use]
    pub fn jump_target(&self) -> Option<u32> {
        let op = self.opcode.jump_operand()?;
        let mut base = self.offset as i64 + 1;
        for i in 0..=op {
            base += self.opcode.operand_size(i) as i64;
        }
        base += self.opcode.offset_operand_tail(op).unwrap_or(0) as i64;
        Some((base + self.operands[op]) as u32)
    }
}

/// Decode the instruction at `offset`; `None` if the opcode is invalid
/// or the instruction is truncated.
#[must_use]
pub fn decode_instr(code: &[u8], offset: u32) -> Option<DecodedInstr> {
    let start = offset as usize;
    let opcode = Opcode::from_u8(*code.get(start)?)?;

    let mut operands = Vec::with_capacity(opcode.num_operands());
    let mut pos = start + 1;

    for op in 0..opcode.num_operands() {
        let size = opcode.operand_size(op);
        let bytes = code.get(pos..pos + size)?;

        let mut value: i64 = 0;
        for (i, &b) in bytes.iter().enumerate() {
            value |= i64::from(b) << (8 * i);
        }

        // Sign-extend signed one-byte slots and four-byte jump offsets.
        if size == 1 && opcode.is_signed(op) {
            value = i64::from(value as u8 as i8);
        } else if size == 4 && opcode.offset_operand_tail(op).is_some() {
            value = i64::from(value as u32 as i32);
        }

        operands.push(value);
        pos += size;
    }

    Some(DecodedInstr {
        offset,
        opcode,
        operands,
        size: pos - start,
    })
}

/// Iterate over all instructions in a code blob.
pub fn instructions(code: &[u8]) -> impl Iterator<Item = DecodedInstr> + '_ {
    let mut offset = 0u32;
    std::iter::from_fn(move || {
        if (offset as usize) >= code.len() {
            return None;
        }
        let instr = decode_instr(code, offset)?;
        offset += instr.size as u32;
        Some(instr)
    })
}

/// Render one instruction the way the command-line disassembler prints
/// it.
#[must_use]
pub fn format_instr(instr: &DecodedInstr) -> String {
    let mut out = String::new();
    let _ = write!(out, "{:05x}: {:<14}", instr.offset, instr.opcode.name());

    for (i, &value) in instr.operands.iter().enumerate() {
        let sep = if i == 0 { " " } else { ", " };
        if instr.opcode.is_register(i) {
            let _ = write!(out, "{}r{}", sep, value);
        } else if instr.opcode.offset_operand_tail(i).is_some() {
            let target = instr.jump_target().unwrap_or(0);
            let _ = write!(out, "{}@{:05x}", sep, target);
        } else {
            let _ = write!(out, "{}{}", sep, value);
        }
    }

    out
}

/// Disassemble a whole code blob, one instruction per line.
#[must_use]
pub fn disassemble(code: &[u8]) -> String {
    let mut out = String::new();
    for instr in instructions(code) {
        out.push_str(&format_instr(&instr));
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn operand_sizes_cover_all_operands() {
        for byte in 1..=MAX_OPCODE {
            let opcode = Opcode::from_u8(byte).expect("dense opcode range");
            assert!(opcode.instr_size() >= 1 + opcode.num_operands());
        }
    }

    #[test]
    fn jump_target_accounts_for_tail_operands() {
        // JUMP.COND <offs32> <reg>: base is after the whole instruction.
        let mut code = vec![Opcode::JumpCond as u8];
        code.extend_from_slice(&3i32.to_le_bytes());
        code.push(0); // r0
        let instr = decode_instr(&code, 0).unwrap();
        assert_eq!(instr.size, 6);
        assert_eq!(instr.jump_target(), Some(9));
    }
}
