//! x86-64 instruction decoder.
//!
//! Decodes the engine's supported subset: the common integer data
//! processing, load/store, stack and control-flow forms in their 32 and
//! 64-bit operand sizes. Anything outside the subset reports an error so
//! the translation layer can surface it as an untranslatable address.
//! Legacy 16-bit operand-size and segment/rep/lock prefixes are not
//! supported.

use crate::codec::{CodecError, Result};
use crate::inst::*;
use crate::regs::Reg;

struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
    pc: u64,
}

impl<'a> Cursor<'a> {
    fn new(bytes: &'a [u8], pc: u64) -> Self {
        Self { bytes, pos: 0, pc }
    }

    fn peek(&self) -> Result<u8> {
        self.bytes
            .get(self.pos)
            .copied()
            .ok_or(CodecError::Truncated { pc: self.pc })
    }

    fn u8(&mut self) -> Result<u8> {
        let b = self.peek()?;
        self.pos += 1;
        Ok(b)
    }

    fn i8(&mut self) -> Result<i8> {
        Ok(self.u8()? as i8)
    }

    fn u16(&mut self) -> Result<u16> {
        let lo = self.u8()? as u16;
        let hi = self.u8()? as u16;
        Ok(lo | hi << 8)
    }

    fn i32(&mut self) -> Result<i32> {
        let mut v = 0u32;
        for i in 0..4 {
            v |= (self.u8()? as u32) << (8 * i);
        }
        Ok(v as i32)
    }

    fn i64(&mut self) -> Result<i64> {
        let mut v = 0u64;
        for i in 0..8 {
            v |= (self.u8()? as u64) << (8 * i);
        }
        Ok(v as i64)
    }
}

/// REX prefix bits.
#[derive(Clone, Copy, Default)]
struct Rex {
    w: bool,
    r: u8,
    x: u8,
    b: u8,
}

impl Rex {
    fn from_byte(b: u8) -> Self {
        Self {
            w: b & 0x8 != 0,
            r: (b >> 2) & 1,
            x: (b >> 1) & 1,
            b: b & 1,
        }
    }
}

/// ModRM r/m operand.
enum RmOp {
    Reg(Reg),
    Mem(MemRef),
}

fn reg_of(field: u8) -> Reg {
    // Fields are 4 bits, always in range.
    Reg::from_index(field).unwrap_or(Reg::Rax)
}

/// Decode ModRM (and SIB/displacement). Returns the extended reg field
/// and the r/m operand.
fn decode_modrm(cur: &mut Cursor<'_>, rex: Rex) -> Result<(u8, RmOp)> {
    let modrm = cur.u8()?;
    let mode = modrm >> 6;
    let reg = ((modrm >> 3) & 7) | (rex.r << 3);
    let rm = modrm & 7;

    if mode == 3 {
        return Ok((reg, RmOp::Reg(reg_of(rm | (rex.b << 3)))));
    }

    let mut mem = MemRef {
        base: None,
        index: None,
        scale: 1,
        disp: 0,
        rip: false,
    };

    if rm == 4 {
        // SIB byte.
        let sib = cur.u8()?;
        let scale = 1u8 << (sib >> 6);
        let index_field = ((sib >> 3) & 7) | (rex.x << 3);
        let base_field = (sib & 7) | (rex.b << 3);

        // Index field 100 with REX.X clear means "no index".
        if index_field != 4 {
            mem.index = Some(reg_of(index_field));
            mem.scale = scale;
        }
        if (sib & 7) == 5 && mode == 0 {
            // No base, disp32 follows.
            mem.disp = cur.i32()?;
            return Ok((reg, RmOp::Mem(mem)));
        }
        mem.base = Some(reg_of(base_field));
    } else if rm == 5 && mode == 0 {
        // RIP-relative.
        mem.rip = true;
        mem.disp = cur.i32()?;
        return Ok((reg, RmOp::Mem(mem)));
    } else {
        mem.base = Some(reg_of(rm | (rex.b << 3)));
    }

    match mode {
        0 => {}
        1 => mem.disp = cur.i8()? as i32,
        2 => mem.disp = cur.i32()?,
        _ => unreachable!(),
    }
    Ok((reg, RmOp::Mem(mem)))
}

fn rm_operands_store(reg: u8, rm: RmOp) -> Operands {
    // r/m destination, register source (the 0x89-style direction).
    match rm {
        RmOp::Reg(dst) => Operands::RegReg {
            dst,
            src: reg_of(reg),
        },
        RmOp::Mem(mem) => Operands::MemReg {
            mem,
            src: reg_of(reg),
        },
    }
}

fn rm_operands_load(reg: u8, rm: RmOp) -> Operands {
    // register destination, r/m source (the 0x8B-style direction).
    match rm {
        RmOp::Reg(src) => Operands::RegReg {
            dst: reg_of(reg),
            src,
        },
        RmOp::Mem(mem) => Operands::RegMem {
            dst: reg_of(reg),
            mem,
        },
    }
}

fn rm_operands_unary(rm: RmOp) -> Operands {
    match rm {
        RmOp::Reg(reg) => Operands::Reg { reg },
        RmOp::Mem(mem) => Operands::Mem { mem },
    }
}

fn rm_operands_imm(rm: RmOp, imm: i64) -> Operands {
    match rm {
        RmOp::Reg(dst) => Operands::RegImm { dst, imm },
        RmOp::Mem(mem) => Operands::MemImm { mem, imm },
    }
}

/// ALU group-1 operation selected by the ModRM reg field.
fn alu_group_op(field: u8) -> Option<OpId> {
    match field & 7 {
        0 => Some(OP_ADD),
        1 => Some(OP_OR),
        4 => Some(OP_AND),
        5 => Some(OP_SUB),
        6 => Some(OP_XOR),
        7 => Some(OP_CMP),
        _ => None,
    }
}

/// Shift group-2 operation selected by the ModRM reg field.
fn shift_group_op(field: u8) -> Option<OpId> {
    match field & 7 {
        4 => Some(OP_SHL),
        5 => Some(OP_SHR),
        7 => Some(OP_SAR),
        _ => None,
    }
}

/// Decode a single instruction at guest address `pc`.
pub fn decode(bytes: &[u8], pc: u64) -> Result<DecodedInst> {
    let mut cur = Cursor::new(bytes, pc);
    let mut rex = Rex::default();

    // Prefixes. REX must immediately precede the opcode.
    loop {
        let b = cur.peek()?;
        match b {
            0x40..=0x4f => {
                rex = Rex::from_byte(b);
                cur.pos += 1;
                break;
            }
            0x26 | 0x2e | 0x36 | 0x3e | 0x64 | 0x65 | 0x66 | 0x67 | 0xf0 | 0xf2 | 0xf3 => {
                return Err(CodecError::UnsupportedPrefix { prefix: b, pc });
            }
            _ => break,
        }
    }

    let width = if rex.w { Width::Q } else { Width::D };
    let opcode = cur.u8()?;

    let (opid, operands, w, mem_w) = match opcode {
        // push/pop r64 (operand size is always 64-bit).
        0x50..=0x57 => {
            let reg = reg_of((opcode - 0x50) | (rex.b << 3));
            (OP_PUSH, Operands::Reg { reg }, Width::Q, Width::Q)
        }
        0x58..=0x5f => {
            let reg = reg_of((opcode - 0x58) | (rex.b << 3));
            (OP_POP, Operands::Reg { reg }, Width::Q, Width::Q)
        }
        0x68 => {
            let imm = cur.i32()? as i64;
            (OP_PUSH, Operands::Imm { imm }, Width::Q, Width::Q)
        }
        0x6a => {
            let imm = cur.i8()? as i64;
            (OP_PUSH, Operands::Imm { imm }, Width::Q, Width::Q)
        }
        // jcc rel8
        0x70..=0x7f => {
            let disp = cur.i8()? as i64;
            (
                OpId::from_condition_code(opcode - 0x70),
                Operands::Rel { disp },
                Width::Q,
                Width::Q,
            )
        }
        // ALU group 1, imm32 / imm8.
        0x81 | 0x83 => {
            let (field, rm) = decode_modrm(&mut cur, rex)?;
            let op = alu_group_op(field).ok_or(CodecError::InvalidEncoding {
                pc,
                reason: "unsupported group-1 operation",
            })?;
            let imm = if opcode == 0x81 {
                cur.i32()? as i64
            } else {
                cur.i8()? as i64
            };
            (op, rm_operands_imm(rm, imm), width, width)
        }
        0x85 => {
            let (reg, rm) = decode_modrm(&mut cur, rex)?;
            (OP_TEST, rm_operands_store(reg, rm), width, width)
        }
        0x87 => {
            let (reg, rm) = decode_modrm(&mut cur, rex)?;
            (OP_XCHG, rm_operands_store(reg, rm), width, width)
        }
        0x89 => {
            let (reg, rm) = decode_modrm(&mut cur, rex)?;
            (OP_MOV, rm_operands_store(reg, rm), width, width)
        }
        0x8b => {
            let (reg, rm) = decode_modrm(&mut cur, rex)?;
            (OP_MOV, rm_operands_load(reg, rm), width, width)
        }
        0x8d => {
            let (reg, rm) = decode_modrm(&mut cur, rex)?;
            match rm {
                RmOp::Mem(mem) => (
                    OP_LEA,
                    Operands::RegMem {
                        dst: reg_of(reg),
                        mem,
                    },
                    width,
                    width,
                ),
                RmOp::Reg(_) => {
                    return Err(CodecError::InvalidEncoding {
                        pc,
                        reason: "lea with register operand",
                    });
                }
            }
        }
        0x90 => {
            if rex.b != 0 {
                return Err(CodecError::UnsupportedOpcode { opcode, pc });
            }
            (OP_NOP, Operands::None, Width::Q, Width::Q)
        }
        // mov r, imm32 / imm64.
        0xb8..=0xbf => {
            let reg = reg_of((opcode - 0xb8) | (rex.b << 3));
            if rex.w {
                let imm = cur.i64()?;
                (OP_MOV, Operands::RegImm { dst: reg, imm }, Width::Q, Width::Q)
            } else {
                // 32-bit immediate, zero-extended by hardware.
                let imm = cur.i32()? as u32 as i64;
                (OP_MOV, Operands::RegImm { dst: reg, imm }, Width::D, Width::D)
            }
        }
        // Shift group 2, imm8.
        0xc1 => {
            let (field, rm) = decode_modrm(&mut cur, rex)?;
            let op = shift_group_op(field).ok_or(CodecError::InvalidEncoding {
                pc,
                reason: "unsupported group-2 operation",
            })?;
            let imm = cur.u8()? as i64;
            (op, rm_operands_imm(rm, imm), width, width)
        }
        0xc2 => {
            let imm = cur.u16()? as i64;
            (OP_RET, Operands::Imm { imm }, Width::Q, Width::Q)
        }
        0xc3 => (OP_RET, Operands::None, Width::Q, Width::Q),
        0xc7 => {
            let (field, rm) = decode_modrm(&mut cur, rex)?;
            if field & 7 != 0 {
                return Err(CodecError::InvalidEncoding {
                    pc,
                    reason: "0xc7 with nonzero reg field",
                });
            }
            let imm = cur.i32()? as i64;
            (OP_MOV, rm_operands_imm(rm, imm), width, width)
        }
        0xcc => (OP_INT3, Operands::None, Width::Q, Width::Q),
        // Shift group 2 by cl.
        0xd3 => {
            let (field, rm) = decode_modrm(&mut cur, rex)?;
            let op = shift_group_op(field).ok_or(CodecError::InvalidEncoding {
                pc,
                reason: "unsupported group-2 operation",
            })?;
            (op, rm_operands_unary(rm), width, width)
        }
        0xe8 => {
            let disp = cur.i32()? as i64;
            (OP_CALL, Operands::Rel { disp }, Width::Q, Width::Q)
        }
        0xe9 => {
            let disp = cur.i32()? as i64;
            (OP_JMP, Operands::Rel { disp }, Width::Q, Width::Q)
        }
        0xeb => {
            let disp = cur.i8()? as i64;
            (OP_JMP, Operands::Rel { disp }, Width::Q, Width::Q)
        }
        0xff => {
            let (field, rm) = decode_modrm(&mut cur, rex)?;
            match field & 7 {
                0 => (OP_INC, rm_operands_unary(rm), width, width),
                1 => (OP_DEC, rm_operands_unary(rm), width, width),
                2 => (OP_CALL, rm_operands_unary(rm), Width::Q, Width::Q),
                4 => (OP_JMP, rm_operands_unary(rm), Width::Q, Width::Q),
                6 => (OP_PUSH, rm_operands_unary(rm), Width::Q, Width::Q),
                _ => {
                    return Err(CodecError::InvalidEncoding {
                        pc,
                        reason: "unsupported 0xff group operation",
                    });
                }
            }
        }
        // ALU group 1, r/m forms.
        0x01 => alu_pair(&mut cur, rex, OP_ADD, width, true)?,
        0x03 => alu_pair(&mut cur, rex, OP_ADD, width, false)?,
        0x09 => alu_pair(&mut cur, rex, OP_OR, width, true)?,
        0x0b => alu_pair(&mut cur, rex, OP_OR, width, false)?,
        0x21 => alu_pair(&mut cur, rex, OP_AND, width, true)?,
        0x23 => alu_pair(&mut cur, rex, OP_AND, width, false)?,
        0x29 => alu_pair(&mut cur, rex, OP_SUB, width, true)?,
        0x2b => alu_pair(&mut cur, rex, OP_SUB, width, false)?,
        0x31 => alu_pair(&mut cur, rex, OP_XOR, width, true)?,
        0x33 => alu_pair(&mut cur, rex, OP_XOR, width, false)?,
        0x39 => alu_pair(&mut cur, rex, OP_CMP, width, true)?,
        0x3b => alu_pair(&mut cur, rex, OP_CMP, width, false)?,
        // Two-byte opcodes.
        0x0f => {
            let op2 = cur.u8()?;
            match op2 {
                0x05 => (OP_SYSCALL, Operands::None, Width::Q, Width::Q),
                // Multi-byte nop: consume the ModRM form, keep no operands.
                0x1f => {
                    let _ = decode_modrm(&mut cur, rex)?;
                    (OP_NOP, Operands::None, Width::Q, Width::Q)
                }
                0x80..=0x8f => {
                    let disp = cur.i32()? as i64;
                    (
                        OpId::from_condition_code(op2 - 0x80),
                        Operands::Rel { disp },
                        Width::Q,
                        Width::Q,
                    )
                }
                0xaf => {
                    let (reg, rm) = decode_modrm(&mut cur, rex)?;
                    (OP_IMUL, rm_operands_load(reg, rm), width, width)
                }
                0xb6 => {
                    let (reg, rm) = decode_modrm(&mut cur, rex)?;
                    (OP_MOVZX, rm_operands_load(reg, rm), width, Width::B)
                }
                0xb7 => {
                    let (reg, rm) = decode_modrm(&mut cur, rex)?;
                    (OP_MOVZX, rm_operands_load(reg, rm), width, Width::W)
                }
                _ => return Err(CodecError::UnsupportedOpcode { opcode: op2, pc }),
            }
        }
        _ => return Err(CodecError::UnsupportedOpcode { opcode, pc }),
    };

    let mut inst = DecodedInst::new(opid, pc, cur.pos as u8, w, operands);
    inst.mem_width = mem_w;
    Ok(inst)
}

fn alu_pair(
    cur: &mut Cursor<'_>,
    rex: Rex,
    op: OpId,
    width: Width,
    store_direction: bool,
) -> Result<(OpId, Operands, Width, Width)> {
    let (reg, rm) = decode_modrm(cur, rex)?;
    let operands = if store_direction {
        rm_operands_store(reg, rm)
    } else {
        rm_operands_load(reg, rm)
    };
    Ok((op, operands, width, width))
}
