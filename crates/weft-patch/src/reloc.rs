//! Relocatable instruction templates.
//!
//! A `RelocatableInst` is one machine instruction whose final bytes
//! depend on values unknown until it is placed into an ExecBlock: the
//! code page base, the context address, or the patch's guest PC.
//! `materialize` is pure; every variant has a fixed encoded length so
//! offsets can be computed before the bytes exist.

use weft_isa::{asm, Reg};

/// Late-bound inputs for materialisation.
#[derive(Clone, Copy, Debug)]
pub struct RelocFrame {
    /// Absolute address of the ExecBlock code page.
    pub code_base: u64,
    /// Absolute address of the block's `Context`.
    pub ctx_base: u64,
    /// Offset of this instruction within the code page.
    pub host_offset: usize,
    /// Guest address of the patched instruction.
    pub guest_pc: u64,
    /// Offset of the block epilogue within the code page.
    pub epilogue_offset: usize,
}

impl RelocFrame {
    /// rip-relative displacement from the end of an instruction of
    /// `inst_len` bytes at `host_offset` to a context field.
    fn ctx_disp(&self, inst_len: usize, field_offset: usize) -> i32 {
        let next = self.code_base + self.host_offset as u64 + inst_len as u64;
        let target = self.ctx_base + field_offset as u64;
        target.wrapping_sub(next) as i64 as i32
    }
}

/// One instruction with late-bound operands.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RelocatableInst {
    /// Finished position-independent bytes.
    Raw(Vec<u8>),
    /// `mov [context + offset], reg`.
    SaveReg { reg: Reg, offset: usize },
    /// `mov reg, [context + offset]`.
    LoadReg { reg: Reg, offset: usize },
    /// `mov dword [context + offset], imm32`.
    StoreImm32 { offset: usize, value: u32 },
    /// `movabs reg, value`.
    MovImm64 { reg: Reg, value: u64 },
    /// `movabs reg, guest_pc + delta`.
    GuestPcToReg { reg: Reg, delta: i64 },
    /// `movabs reg, <host address bytes_after past this instruction>`.
    ///
    /// Used to compute the resume point stored into the selector.
    ResumeAddrToReg { reg: Reg, bytes_after: usize },
    /// `jmp [context + offset]` — indirect jump through a context cell.
    JmpCtxCell { offset: usize },
    /// `jmp` to the block epilogue.
    JmpEpilogue,
}

impl RelocatableInst {
    /// Encoded length, independent of the relocation inputs.
    pub fn encoded_len(&self) -> usize {
        match self {
            RelocatableInst::Raw(bytes) => bytes.len(),
            RelocatableInst::SaveReg { .. } | RelocatableInst::LoadReg { .. } => 7,
            RelocatableInst::StoreImm32 { .. } => 10,
            RelocatableInst::MovImm64 { .. }
            | RelocatableInst::GuestPcToReg { .. }
            | RelocatableInst::ResumeAddrToReg { .. } => 10,
            RelocatableInst::JmpCtxCell { .. } => 6,
            RelocatableInst::JmpEpilogue => 5,
        }
    }

    /// Produce the final bytes for this instruction at the frame's
    /// position. Pure and idempotent.
    pub fn materialize(&self, frame: &RelocFrame) -> Vec<u8> {
        match self {
            RelocatableInst::Raw(bytes) => bytes.clone(),
            RelocatableInst::SaveReg { reg, offset } => {
                asm::mov_store_rip(frame.ctx_disp(7, *offset), *reg)
            }
            RelocatableInst::LoadReg { reg, offset } => {
                asm::mov_load_rip(*reg, frame.ctx_disp(7, *offset))
            }
            RelocatableInst::StoreImm32 { offset, value } => {
                asm::mov_store_imm32_rip(frame.ctx_disp(10, *offset), *value)
            }
            RelocatableInst::MovImm64 { reg, value } => asm::mov_ri64(*reg, *value),
            RelocatableInst::GuestPcToReg { reg, delta } => {
                asm::mov_ri64(*reg, frame.guest_pc.wrapping_add(*delta as u64))
            }
            RelocatableInst::ResumeAddrToReg { reg, bytes_after } => {
                let resume =
                    frame.code_base + frame.host_offset as u64 + 10 + *bytes_after as u64;
                asm::mov_ri64(*reg, resume)
            }
            RelocatableInst::JmpCtxCell { offset } => asm::jmp_rip(frame.ctx_disp(6, *offset)),
            RelocatableInst::JmpEpilogue => {
                let disp = frame.epilogue_offset as i64 - (frame.host_offset as i64 + 5);
                asm::jmp_rel32(disp as i32)
            }
        }
    }
}

/// Total encoded length of a relocatable sequence.
pub fn sequence_len(insts: &[RelocatableInst]) -> usize {
    insts.iter().map(RelocatableInst::encoded_len).sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(host_offset: usize) -> RelocFrame {
        RelocFrame {
            code_base: 0x10000,
            ctx_base: 0x11000,
            host_offset,
            guest_pc: 0x400000,
            epilogue_offset: 0x80,
        }
    }

    #[test]
    fn test_lengths_match_materialized_bytes() {
        let f = frame(0);
        let insts = [
            RelocatableInst::Raw(vec![0x90, 0x90]),
            RelocatableInst::SaveReg { reg: Reg::R11, offset: 0x40 },
            RelocatableInst::LoadReg { reg: Reg::Rax, offset: 0x40 },
            RelocatableInst::StoreImm32 { offset: 0x10, value: 7 },
            RelocatableInst::MovImm64 { reg: Reg::Rbx, value: u64::MAX },
            RelocatableInst::GuestPcToReg { reg: Reg::R10, delta: -4 },
            RelocatableInst::ResumeAddrToReg { reg: Reg::R11, bytes_after: 19 },
            RelocatableInst::JmpCtxCell { offset: 0x48 },
            RelocatableInst::JmpEpilogue,
        ];
        for inst in &insts {
            assert_eq!(
                inst.materialize(&f).len(),
                inst.encoded_len(),
                "length mismatch for {:?}",
                inst
            );
        }
    }

    #[test]
    fn test_materialize_is_idempotent() {
        let f = frame(0x20);
        let inst = RelocatableInst::SaveReg { reg: Reg::Rax, offset: 0x38 };
        assert_eq!(inst.materialize(&f), inst.materialize(&f));
    }

    #[test]
    fn test_save_reg_displacement() {
        // Instruction at code 0x10000+0x10, 7 bytes; context field at
        // 0x11000+0x38. disp = 0x11038 - 0x10017.
        let f = frame(0x10);
        let bytes = RelocatableInst::SaveReg { reg: Reg::Rax, offset: 0x38 }.materialize(&f);
        let disp = i32::from_le_bytes([bytes[3], bytes[4], bytes[5], bytes[6]]);
        assert_eq!(disp, (0x11038 - 0x10017) as i32);
    }

    #[test]
    fn test_resume_addr_value() {
        let f = frame(0x30);
        let bytes =
            RelocatableInst::ResumeAddrToReg { reg: Reg::R11, bytes_after: 19 }.materialize(&f);
        let value = u64::from_le_bytes(bytes[2..10].try_into().unwrap());
        assert_eq!(value, 0x10000 + 0x30 + 10 + 19);
    }

    #[test]
    fn test_guest_pc_delta() {
        let f = frame(0);
        let bytes = RelocatableInst::GuestPcToReg { reg: Reg::Rax, delta: 5 }.materialize(&f);
        let value = u64::from_le_bytes(bytes[2..10].try_into().unwrap());
        assert_eq!(value, 0x400005);
    }

    #[test]
    fn test_jmp_epilogue_displacement() {
        let f = frame(0x20);
        let bytes = RelocatableInst::JmpEpilogue.materialize(&f);
        assert_eq!(bytes[0], 0xe9);
        let disp = i32::from_le_bytes([bytes[1], bytes[2], bytes[3], bytes[4]]);
        // Jump from end of instruction (0x25) to 0x80.
        assert_eq!(disp, 0x80 - 0x25);
    }
}
