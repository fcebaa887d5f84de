//! x86-64 instruction encoder.
//!
//! Two layers: `encode` re-encodes a `DecodedInst` (used when the
//! translator rewrites an operand, e.g. swapping a rip-relative memory
//! reference for a scratch-register base), and the `asm` helpers build
//! the fixed-shape instructions the patch and prologue emitters need.

use crate::codec::{CodecError, Result};
use crate::inst::*;
use crate::regs::Reg;

fn rex_byte(w: bool, r: bool, x: bool, b: bool) -> u8 {
    0x40 | (w as u8) << 3 | (r as u8) << 2 | (x as u8) << 1 | b as u8
}

fn push_rex(buf: &mut Vec<u8>, w: bool, r: bool, x: bool, b: bool) {
    if w || r || x || b {
        buf.push(rex_byte(w, r, x, b));
    }
}

fn modrm(mode: u8, reg: u8, rm: u8) -> u8 {
    (mode << 6) | ((reg & 7) << 3) | (rm & 7)
}

fn push_i32(buf: &mut Vec<u8>, v: i32) {
    buf.extend_from_slice(&v.to_le_bytes());
}

fn scale_log2(scale: u8) -> Result<u8> {
    match scale {
        1 => Ok(0),
        2 => Ok(1),
        4 => Ok(2),
        8 => Ok(3),
        _ => Err(CodecError::NotEncodable {
            reason: "scale must be 1, 2, 4 or 8",
        }),
    }
}

/// Emit opcode + ModRM for a register r/m operand.
fn emit_reg_rm(buf: &mut Vec<u8>, w: bool, opcode: &[u8], reg_field: u8, rm: Reg) {
    push_rex(buf, w, reg_field >= 8, false, rm.needs_rex());
    buf.extend_from_slice(opcode);
    buf.push(modrm(3, reg_field, rm.low3()));
}

/// Emit opcode + ModRM/SIB/disp for a memory r/m operand.
fn emit_mem_rm(buf: &mut Vec<u8>, w: bool, opcode: &[u8], reg_field: u8, mem: &MemRef) -> Result<()> {
    if mem.index == Some(Reg::Rsp) {
        return Err(CodecError::NotEncodable {
            reason: "rsp cannot be an index register",
        });
    }
    let x = mem.index.is_some_and(Reg::needs_rex);
    let b = mem.base.is_some_and(Reg::needs_rex);
    push_rex(buf, w, reg_field >= 8, x, b);
    buf.extend_from_slice(opcode);

    if mem.rip {
        buf.push(modrm(0, reg_field, 5));
        push_i32(buf, mem.disp);
        return Ok(());
    }

    match (mem.base, mem.index) {
        (None, None) => {
            // Absolute disp32 via SIB with no base.
            buf.push(modrm(0, reg_field, 4));
            buf.push((4 << 3) | 5);
            push_i32(buf, mem.disp);
        }
        (None, Some(index)) => {
            buf.push(modrm(0, reg_field, 4));
            buf.push((scale_log2(mem.scale)? << 6) | (index.low3() << 3) | 5);
            push_i32(buf, mem.disp);
        }
        (Some(base), index) => {
            let need_sib = index.is_some() || base.low3() == 4;
            // rbp/r13 as base cannot use the no-displacement form.
            let mode = if mem.disp == 0 && base.low3() != 5 {
                0
            } else if i8::try_from(mem.disp).is_ok() {
                1
            } else {
                2
            };
            if need_sib {
                buf.push(modrm(mode, reg_field, 4));
                let index_field = index.map_or(4, Reg::low3);
                buf.push((scale_log2(mem.scale)? << 6) | (index_field << 3) | base.low3());
            } else {
                buf.push(modrm(mode, reg_field, base.low3()));
            }
            match mode {
                1 => buf.push(mem.disp as i8 as u8),
                2 => push_i32(buf, mem.disp),
                _ => {}
            }
        }
    }
    Ok(())
}

fn check_width(inst: &DecodedInst) -> Result<bool> {
    match inst.width {
        Width::Q => Ok(true),
        Width::D => Ok(false),
        _ => Err(CodecError::NotEncodable {
            reason: "only 32 and 64-bit operand sizes are encodable",
        }),
    }
}

fn imm32(imm: i64) -> Result<i32> {
    i32::try_from(imm).map_err(|_| CodecError::NotEncodable {
        reason: "immediate does not fit 32 bits",
    })
}

/// ALU group-1 opcode triple: (r/m,r form), (r,r/m form), ModRM group field.
fn alu_opcodes(opid: OpId) -> Option<(u8, u8, u8)> {
    match opid {
        OP_ADD => Some((0x01, 0x03, 0)),
        OP_OR => Some((0x09, 0x0b, 1)),
        OP_AND => Some((0x21, 0x23, 4)),
        OP_SUB => Some((0x29, 0x2b, 5)),
        OP_XOR => Some((0x31, 0x33, 6)),
        OP_CMP => Some((0x39, 0x3b, 7)),
        _ => None,
    }
}

fn shift_field(opid: OpId) -> Option<u8> {
    match opid {
        OP_SHL => Some(4),
        OP_SHR => Some(5),
        OP_SAR => Some(7),
        _ => None,
    }
}

/// Encode an instruction back to bytes.
///
/// Produces a canonical encoding; it may differ byte-for-byte from the
/// originally decoded form (e.g. rel8 branches re-encode as rel32) while
/// keeping the same semantics.
pub fn encode(inst: &DecodedInst) -> Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(15);

    if let Some((mr, rm, group)) = alu_opcodes(inst.opid) {
        let w = check_width(inst)?;
        match &inst.operands {
            Operands::RegReg { dst, src } => emit_reg_rm(&mut buf, w, &[mr], src.index(), *dst),
            Operands::MemReg { mem, src } => emit_mem_rm(&mut buf, w, &[mr], src.index(), mem)?,
            Operands::RegMem { dst, mem } => emit_mem_rm(&mut buf, w, &[rm], dst.index(), mem)?,
            Operands::RegImm { dst, imm } => {
                let imm = imm32(*imm)?;
                if let Ok(v) = i8::try_from(imm) {
                    emit_reg_rm(&mut buf, w, &[0x83], group, *dst);
                    buf.push(v as u8);
                } else {
                    emit_reg_rm(&mut buf, w, &[0x81], group, *dst);
                    push_i32(&mut buf, imm);
                }
            }
            Operands::MemImm { mem, imm } => {
                let imm = imm32(*imm)?;
                if let Ok(v) = i8::try_from(imm) {
                    emit_mem_rm(&mut buf, w, &[0x83], group, mem)?;
                    buf.push(v as u8);
                } else {
                    emit_mem_rm(&mut buf, w, &[0x81], group, mem)?;
                    push_i32(&mut buf, imm);
                }
            }
            _ => {
                return Err(CodecError::NotEncodable {
                    reason: "bad ALU operand pattern",
                });
            }
        }
        return Ok(buf);
    }

    if let Some(field) = shift_field(inst.opid) {
        let w = check_width(inst)?;
        match &inst.operands {
            Operands::RegImm { dst, imm } => {
                emit_reg_rm(&mut buf, w, &[0xc1], field, *dst);
                buf.push(*imm as u8);
            }
            Operands::MemImm { mem, imm } => {
                emit_mem_rm(&mut buf, w, &[0xc1], field, mem)?;
                buf.push(*imm as u8);
            }
            Operands::Reg { reg } => emit_reg_rm(&mut buf, w, &[0xd3], field, *reg),
            Operands::Mem { mem } => emit_mem_rm(&mut buf, w, &[0xd3], field, mem)?,
            _ => {
                return Err(CodecError::NotEncodable {
                    reason: "bad shift operand pattern",
                });
            }
        }
        return Ok(buf);
    }

    match (inst.opid, &inst.operands) {
        (OP_MOV, Operands::RegReg { dst, src }) => {
            emit_reg_rm(&mut buf, check_width(inst)?, &[0x89], src.index(), *dst);
        }
        (OP_MOV, Operands::MemReg { mem, src }) => {
            emit_mem_rm(&mut buf, check_width(inst)?, &[0x89], src.index(), mem)?;
        }
        (OP_MOV, Operands::RegMem { dst, mem }) => {
            emit_mem_rm(&mut buf, check_width(inst)?, &[0x8b], dst.index(), mem)?;
        }
        (OP_MOV, Operands::RegImm { dst, imm }) => {
            let w = check_width(inst)?;
            if !w {
                push_rex(&mut buf, false, false, false, dst.needs_rex());
                buf.push(0xb8 + dst.low3());
                push_i32(&mut buf, *imm as u32 as i32);
            } else if let Ok(v) = i32::try_from(*imm) {
                emit_reg_rm(&mut buf, true, &[0xc7], 0, *dst);
                push_i32(&mut buf, v);
            } else {
                buf.push(rex_byte(true, false, false, dst.needs_rex()));
                buf.push(0xb8 + dst.low3());
                buf.extend_from_slice(&(*imm as u64).to_le_bytes());
            }
        }
        (OP_MOV, Operands::MemImm { mem, imm }) => {
            emit_mem_rm(&mut buf, check_width(inst)?, &[0xc7], 0, mem)?;
            push_i32(&mut buf, imm32(*imm)?);
        }
        (OP_MOVZX, Operands::RegReg { dst, src }) => {
            let op = if inst.mem_width == Width::B { 0xb6 } else { 0xb7 };
            emit_reg_rm(&mut buf, check_width(inst)?, &[0x0f, op], dst.index(), *src);
        }
        (OP_MOVZX, Operands::RegMem { dst, mem }) => {
            let op = if inst.mem_width == Width::B { 0xb6 } else { 0xb7 };
            emit_mem_rm(&mut buf, check_width(inst)?, &[0x0f, op], dst.index(), mem)?;
        }
        (OP_LEA, Operands::RegMem { dst, mem }) => {
            emit_mem_rm(&mut buf, check_width(inst)?, &[0x8d], dst.index(), mem)?;
        }
        (OP_TEST, Operands::RegReg { dst, src }) => {
            emit_reg_rm(&mut buf, check_width(inst)?, &[0x85], src.index(), *dst);
        }
        (OP_TEST, Operands::MemReg { mem, src }) => {
            emit_mem_rm(&mut buf, check_width(inst)?, &[0x85], src.index(), mem)?;
        }
        (OP_XCHG, Operands::RegReg { dst, src }) => {
            emit_reg_rm(&mut buf, check_width(inst)?, &[0x87], src.index(), *dst);
        }
        (OP_XCHG, Operands::MemReg { mem, src }) => {
            emit_mem_rm(&mut buf, check_width(inst)?, &[0x87], src.index(), mem)?;
        }
        (OP_IMUL, Operands::RegReg { dst, src }) => {
            emit_reg_rm(&mut buf, check_width(inst)?, &[0x0f, 0xaf], dst.index(), *src);
        }
        (OP_IMUL, Operands::RegMem { dst, mem }) => {
            emit_mem_rm(&mut buf, check_width(inst)?, &[0x0f, 0xaf], dst.index(), mem)?;
        }
        (OP_INC, ops) => {
            encode_unary(&mut buf, check_width(inst)?, 0, ops)?;
        }
        (OP_DEC, ops) => {
            encode_unary(&mut buf, check_width(inst)?, 1, ops)?;
        }
        (OP_PUSH, Operands::Reg { reg }) => {
            push_rex(&mut buf, false, false, false, reg.needs_rex());
            buf.push(0x50 + reg.low3());
        }
        (OP_PUSH, Operands::Imm { imm }) => {
            if let Ok(v) = i8::try_from(*imm) {
                buf.push(0x6a);
                buf.push(v as u8);
            } else {
                buf.push(0x68);
                push_i32(&mut buf, imm32(*imm)?);
            }
        }
        (OP_PUSH, Operands::Mem { mem }) => {
            emit_mem_rm(&mut buf, false, &[0xff], 6, mem)?;
        }
        (OP_POP, Operands::Reg { reg }) => {
            push_rex(&mut buf, false, false, false, reg.needs_rex());
            buf.push(0x58 + reg.low3());
        }
        (OP_NOP, _) => buf.push(0x90),
        (OP_RET, Operands::None) => buf.push(0xc3),
        (OP_RET, Operands::Imm { imm }) => {
            buf.push(0xc2);
            buf.extend_from_slice(&(*imm as u16).to_le_bytes());
        }
        (OP_CALL, Operands::Rel { disp }) => {
            buf.push(0xe8);
            push_i32(&mut buf, imm32(*disp)?);
        }
        (OP_CALL, Operands::Reg { reg }) => emit_reg_rm(&mut buf, false, &[0xff], 2, *reg),
        (OP_CALL, Operands::Mem { mem }) => emit_mem_rm(&mut buf, false, &[0xff], 2, mem)?,
        (OP_JMP, Operands::Rel { disp }) => {
            buf.push(0xe9);
            push_i32(&mut buf, imm32(*disp)?);
        }
        (OP_JMP, Operands::Reg { reg }) => emit_reg_rm(&mut buf, false, &[0xff], 4, *reg),
        (OP_JMP, Operands::Mem { mem }) => emit_mem_rm(&mut buf, false, &[0xff], 4, mem)?,
        (OP_SYSCALL, _) => buf.extend_from_slice(&[0x0f, 0x05]),
        (OP_INT3, _) => buf.push(0xcc),
        (opid, Operands::Rel { disp }) if opid.condition_code().is_some() => {
            buf.push(0x0f);
            buf.push(0x80 + opid.condition_code().unwrap_or(0));
            push_i32(&mut buf, imm32(*disp)?);
        }
        _ => {
            return Err(CodecError::NotEncodable {
                reason: "unsupported instruction form",
            });
        }
    }
    Ok(buf)
}

fn encode_unary(buf: &mut Vec<u8>, w: bool, field: u8, ops: &Operands) -> Result<()> {
    match ops {
        Operands::Reg { reg } => {
            emit_reg_rm(buf, w, &[0xff], field, *reg);
            Ok(())
        }
        Operands::Mem { mem } => emit_mem_rm(buf, w, &[0xff], field, mem),
        _ => Err(CodecError::NotEncodable {
            reason: "bad unary operand pattern",
        }),
    }
}

/// Fixed-shape instruction builders for emitted instrumentation.
///
/// Every builder produces a deterministic length so relocation offsets
/// can be computed before the final bytes exist.
pub mod asm {
    use super::*;

    /// `mov dst, src` (64-bit). 3 bytes.
    pub fn mov_rr(dst: Reg, src: Reg) -> Vec<u8> {
        vec![
            rex_byte(true, src.needs_rex(), false, dst.needs_rex()),
            0x89,
            modrm(3, src.low3(), dst.low3()),
        ]
    }

    /// `movabs reg, imm64`. Always the 10-byte form.
    pub fn mov_ri64(reg: Reg, imm: u64) -> Vec<u8> {
        let mut buf = vec![rex_byte(true, false, false, reg.needs_rex()), 0xb8 + reg.low3()];
        buf.extend_from_slice(&imm.to_le_bytes());
        buf
    }

    /// `mov [rip + disp], src` (64-bit). 7 bytes.
    pub fn mov_store_rip(disp: i32, src: Reg) -> Vec<u8> {
        let mut buf = vec![
            rex_byte(true, src.needs_rex(), false, false),
            0x89,
            modrm(0, src.low3(), 5),
        ];
        buf.extend_from_slice(&disp.to_le_bytes());
        buf
    }

    /// `mov dst, [rip + disp]` (64-bit). 7 bytes.
    pub fn mov_load_rip(dst: Reg, disp: i32) -> Vec<u8> {
        let mut buf = vec![
            rex_byte(true, dst.needs_rex(), false, false),
            0x8b,
            modrm(0, dst.low3(), 5),
        ];
        buf.extend_from_slice(&disp.to_le_bytes());
        buf
    }

    /// `mov dword [rip + disp], imm32`. 10 bytes.
    pub fn mov_store_imm32_rip(disp: i32, imm: u32) -> Vec<u8> {
        let mut buf = vec![0xc7, modrm(0, 0, 5)];
        buf.extend_from_slice(&disp.to_le_bytes());
        buf.extend_from_slice(&imm.to_le_bytes());
        buf
    }

    /// `jmp rel32`. 5 bytes.
    pub fn jmp_rel32(disp: i32) -> Vec<u8> {
        let mut buf = vec![0xe9];
        buf.extend_from_slice(&disp.to_le_bytes());
        buf
    }

    /// `jmp [rip + disp]`. 6 bytes.
    pub fn jmp_rip(disp: i32) -> Vec<u8> {
        let mut buf = vec![0xff, modrm(0, 4, 5)];
        buf.extend_from_slice(&disp.to_le_bytes());
        buf
    }

    /// `jcc rel8`. 2 bytes.
    pub fn jcc_rel8(cc: u8, disp: i8) -> Vec<u8> {
        vec![0x70 + (cc & 0xf), disp as u8]
    }

    /// `push reg`. 1 or 2 bytes.
    pub fn push_r(reg: Reg) -> Vec<u8> {
        if reg.needs_rex() {
            vec![0x41, 0x50 + reg.low3()]
        } else {
            vec![0x50 + reg.low3()]
        }
    }

    /// `pop reg`. 1 or 2 bytes.
    pub fn pop_r(reg: Reg) -> Vec<u8> {
        if reg.needs_rex() {
            vec![0x41, 0x58 + reg.low3()]
        } else {
            vec![0x58 + reg.low3()]
        }
    }

    pub fn pushfq() -> Vec<u8> {
        vec![0x9c]
    }

    pub fn popfq() -> Vec<u8> {
        vec![0x9d]
    }

    pub fn cld() -> Vec<u8> {
        vec![0xfc]
    }

    pub fn ret() -> Vec<u8> {
        vec![0xc3]
    }

    /// `fxsave64 [rip + disp]`. 8 bytes.
    pub fn fxsave64_rip(disp: i32) -> Vec<u8> {
        let mut buf = vec![0x48, 0x0f, 0xae, modrm(0, 0, 5)];
        buf.extend_from_slice(&disp.to_le_bytes());
        buf
    }

    /// `fxrstor64 [rip + disp]`. 8 bytes.
    pub fn fxrstor64_rip(disp: i32) -> Vec<u8> {
        let mut buf = vec![0x48, 0x0f, 0xae, modrm(0, 1, 5)];
        buf.extend_from_slice(&disp.to_le_bytes());
        buf
    }

    /// `lea rsp, [rsp + disp]` — adjust rsp without touching flags. 8 bytes.
    pub fn lea_rsp_disp(disp: i32) -> Vec<u8> {
        let mut buf = vec![0x48, 0x8d, modrm(2, Reg::Rsp.low3(), 4), (4 << 3) | Reg::Rsp.low3()];
        buf.extend_from_slice(&disp.to_le_bytes());
        buf
    }
}
