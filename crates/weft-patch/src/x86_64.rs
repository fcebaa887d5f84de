//! x86-64 patch recipes and block prologue/epilogue.
//!
//! Rewrite recipes:
//! - plain data processing is re-encoded unchanged;
//! - rip-relative operands are rewritten against a materialised
//!   absolute guest address (directly for `lea`, through the spilled
//!   scratch register otherwise);
//! - direct branches store the taken/fall-through guest PC into the
//!   context rip slot and exit through the epilogue;
//! - indirect branches evaluate the target into the scratch register
//!   first; calls and returns simulate the guest stack effect;
//! - `syscall`/`int3` execute natively and end the sequence.

use weft_isa::{asm, encode, DecodedInst, MachineCodec, MemRef, Operands, Reg, X86Codec, OP_CALL,
    OP_INT3, OP_JMP, OP_LEA, OP_RET, OP_SYSCALL};
use weft_state::Context;

use crate::backend::{BlockLayout, MachineBackend};
use crate::gen::{pack_origin, store_ctx_u64, ExitCause, GenCtx, GenError, InstPosition,
    PatchGenerator};
use crate::patch::Patch;
use crate::reloc::RelocatableInst;

/// The x86-64 machine backend.
pub struct X86Backend {
    codec: X86Codec,
    /// Save/restore the fxsave image in the prologue/epilogue.
    enable_fpr: bool,
}

impl X86Backend {
    pub fn new(codec: X86Codec, enable_fpr: bool) -> Self {
        Self { codec, enable_fpr }
    }

    fn gen_ctx<'a>(inst: &'a DecodedInst, inst_id: u16, temp: Reg) -> GenCtx<'a> {
        GenCtx {
            inst,
            inst_id,
            temp,
            position: InstPosition::PreInst,
        }
    }

    /// Rewrite an instruction with a rip-relative memory operand: the
    /// absolute guest address is materialised into the scratch register
    /// and the operand re-encoded against it.
    fn rewrite_rip_operand(&self, patch: &mut Patch) -> Result<(), GenError> {
        let inst = patch.inst.clone();
        let mem = match inst.explicit_mem() {
            Some(mem) if mem.rip => mem,
            _ => {
                patch.push_body(RelocatableInst::Raw(encode(&inst)?));
                return Ok(());
            }
        };
        let target = inst.next_address().wrapping_add(mem.disp as i64 as u64);

        // lea dst, [rip + d] degenerates to a constant load.
        if inst.opid == OP_LEA {
            if let Operands::RegMem { dst, .. } = inst.operands {
                patch.push_body(RelocatableInst::MovImm64 { reg: dst, value: target });
                return Ok(());
            }
        }

        let temp = patch.require_temp()?;
        let rewritten = DecodedInst {
            operands: swap_mem(&inst.operands, MemRef::base(temp)),
            ..inst.clone()
        };
        patch.push_body(RelocatableInst::MovImm64 { reg: temp, value: target });
        patch.push_body(RelocatableInst::Raw(encode(&rewritten)?));
        Ok(())
    }

    fn build_terminator(&self, patch: &mut Patch) -> Result<(), GenError> {
        let inst = patch.inst.clone();
        let inst_id = patch.inst_id;
        let next = inst.next_address();
        patch.ends_block = true;

        if let Some(cc) = inst.opid.condition_code() {
            // jcc <taken>: a native jcc picks between two rip stores.
            //   jcc taken          (2 bytes)
            //   store rip = fall   (20)
            //   jmp done           (2)
            //   taken: store rip = taken (20)
            //   done:
            let taken = inst.rel_target().unwrap_or(next);
            patch.push_term(RelocatableInst::Raw(asm::jcc_rel8(cc, 22)));
            patch.extend_term(store_ctx_u64(Context::RIP_OFF, next));
            patch.push_term(RelocatableInst::Raw(vec![0xeb, 20]));
            patch.extend_term(store_ctx_u64(Context::RIP_OFF, taken));
            return Ok(());
        }

        match inst.opid {
            OP_JMP => match inst.operands {
                Operands::Rel { .. } => {
                    let target = inst.rel_target().unwrap_or(next);
                    patch.extend_term(store_ctx_u64(Context::RIP_OFF, target));
                }
                _ => {
                    let temp = patch.require_temp()?;
                    let ctx = Self::gen_ctx(&inst, inst_id, temp);
                    patch.extend_term(PatchGenerator::GetOperand { index: 0 }.lower(&ctx)?);
                    patch.push_term(RelocatableInst::SaveReg {
                        reg: temp,
                        offset: Context::RIP_OFF,
                    });
                }
            },
            OP_CALL => {
                let temp = patch.require_temp()?;
                let ctx = Self::gen_ctx(&inst, inst_id, temp);
                match inst.operands {
                    Operands::Rel { .. } => {
                        let target = inst.rel_target().unwrap_or(next);
                        patch.extend_term(store_ctx_u64(Context::RIP_OFF, target));
                    }
                    _ => {
                        // Evaluate the target before the return address
                        // is pushed, as the hardware does.
                        patch.extend_term(PatchGenerator::GetOperand { index: 0 }.lower(&ctx)?);
                        patch.push_term(RelocatableInst::SaveReg {
                            reg: temp,
                            offset: Context::RIP_OFF,
                        });
                    }
                }
                patch.extend_term(PatchGenerator::SimulateCall { ret_addr: next }.lower(&ctx)?);
            }
            OP_RET => {
                let temp = patch.require_temp()?;
                let ctx = Self::gen_ctx(&inst, inst_id, temp);
                patch.extend_term(PatchGenerator::SimulateRet.lower(&ctx)?);
                if let Operands::Imm { imm } = inst.operands {
                    // ret imm16 releases extra stack without touching flags.
                    patch.push_term(RelocatableInst::Raw(asm::lea_rsp_disp(imm as i32)));
                }
            }
            OP_SYSCALL => {
                patch.push_body(RelocatableInst::Raw(vec![0x0f, 0x05]));
                patch.extend_term(store_ctx_u64(Context::RIP_OFF, next));
            }
            OP_INT3 => {
                patch.push_body(RelocatableInst::Raw(vec![0xcc]));
                patch.extend_term(store_ctx_u64(Context::RIP_OFF, next));
            }
            _ => {
                return Err(GenError::BadOperand {
                    index: 0,
                    mnemonic: inst.mnemonic(),
                });
            }
        }
        Ok(())
    }
}

fn swap_mem(operands: &Operands, new: MemRef) -> Operands {
    match *operands {
        Operands::RegMem { dst, .. } => Operands::RegMem { dst, mem: new },
        Operands::MemReg { src, .. } => Operands::MemReg { mem: new, src },
        Operands::MemImm { imm, .. } => Operands::MemImm { mem: new, imm },
        Operands::Mem { .. } => Operands::Mem { mem: new },
        other => other,
    }
}

impl MachineBackend for X86Backend {
    fn codec(&self) -> &dyn MachineCodec {
        &self.codec
    }

    fn make_patch(&self, inst: &DecodedInst, inst_id: u16) -> Result<Patch, GenError> {
        let mut patch = Patch::new(inst.clone(), inst_id);
        if inst.ends_block() {
            self.build_terminator(&mut patch)?;
        } else if inst.uses_rip() {
            self.rewrite_rip_operand(&mut patch)?;
        } else {
            patch.push_body(RelocatableInst::Raw(encode(inst)?));
        }
        Ok(patch)
    }

    fn fallthrough_exit(&self, next_pc: u64, inst_id: u16) -> Vec<RelocatableInst> {
        let mut out = Vec::with_capacity(5);
        out.extend(store_ctx_u64(Context::RIP_OFF, next_pc));
        out.extend(store_ctx_u64(
            Context::ORIGIN_OFF,
            pack_origin(ExitCause::Terminator, inst_id) as u64,
        ));
        out.push(RelocatableInst::JmpEpilogue);
        out
    }

    fn emit_prologue(&self, layout: &BlockLayout) -> Vec<u8> {
        let mut a = CtxAsm::new(layout, 0);

        // Save the host registers the epilogue will restore.
        a.save_ctx(Context::HOST_RSP_OFF, Reg::Rsp);
        a.save_ctx(Context::HOST_RBX_OFF, Reg::Rbx);
        a.save_ctx(Context::HOST_RBP_OFF, Reg::Rbp);
        a.save_ctx(Context::HOST_R12_OFF, Reg::R12);
        a.save_ctx(Context::HOST_R13_OFF, Reg::R13);
        a.save_ctx(Context::HOST_R14_OFF, Reg::R14);
        a.save_ctx(Context::HOST_R15_OFF, Reg::R15);

        if self.enable_fpr {
            a.raw_ctx(8, Context::FPR_OFF, |disp| asm::fxrstor64_rip(disp));
        }

        // Guest eflags, while still on the host stack.
        a.load_ctx(Reg::Rax, Context::EFLAGS_OFF);
        a.raw(asm::push_r(Reg::Rax));
        a.raw(asm::popfq());

        // Guest registers; rsp last, then dispatch through the selector.
        for reg in [
            Reg::Rax,
            Reg::Rbx,
            Reg::Rcx,
            Reg::Rdx,
            Reg::Rsi,
            Reg::Rdi,
            Reg::R8,
            Reg::R9,
            Reg::R10,
            Reg::R11,
            Reg::R12,
            Reg::R13,
            Reg::R14,
            Reg::R15,
            Reg::Rbp,
        ] {
            a.load_ctx(reg, Context::gpr_offset(reg));
        }
        a.load_ctx(Reg::Rsp, Context::gpr_offset(Reg::Rsp));
        a.raw_ctx(6, Context::SELECTOR_OFF, asm::jmp_rip);

        a.finish()
    }

    fn emit_epilogue(&self, layout: &BlockLayout, at_offset: usize) -> Vec<u8> {
        let mut a = CtxAsm::new(layout, at_offset);

        // Guest registers out, including rsp.
        for reg in Reg::ALL {
            a.save_ctx(Context::gpr_offset(reg), reg);
        }
        // Back on the host stack before touching it.
        a.load_ctx(Reg::Rsp, Context::HOST_RSP_OFF);

        // Guest eflags (rax is already saved above).
        a.raw(asm::pushfq());
        a.raw(asm::pop_r(Reg::Rax));
        a.save_ctx(Context::EFLAGS_OFF, Reg::Rax);

        if self.enable_fpr {
            a.raw_ctx(8, Context::FPR_OFF, |disp| asm::fxsave64_rip(disp));
        }

        a.load_ctx(Reg::Rbx, Context::HOST_RBX_OFF);
        a.load_ctx(Reg::Rbp, Context::HOST_RBP_OFF);
        a.load_ctx(Reg::R12, Context::HOST_R12_OFF);
        a.load_ctx(Reg::R13, Context::HOST_R13_OFF);
        a.load_ctx(Reg::R14, Context::HOST_R14_OFF);
        a.load_ctx(Reg::R15, Context::HOST_R15_OFF);

        a.raw(asm::cld());
        a.raw(asm::ret());
        a.finish()
    }

    fn transfer_stub(&self) -> (Vec<RelocatableInst>, Vec<RelocatableInst>) {
        let stub = vec![RelocatableInst::JmpCtxCell {
            offset: Context::SCRATCH_OFF,
        }];
        let mut landing = Vec::with_capacity(3);
        landing.extend(store_ctx_u64(
            Context::ORIGIN_OFF,
            pack_origin(ExitCause::TransferReturn, 0) as u64,
        ));
        landing.push(RelocatableInst::JmpEpilogue);
        (stub, landing)
    }

    fn max_patch_len(&self) -> usize {
        256
    }
}

/// Tiny emitter for the prologue/epilogue: tracks the absolute position
/// so context accesses can be rip-relative.
struct CtxAsm {
    buf: Vec<u8>,
    code_base: u64,
    ctx_base: u64,
    offset: usize,
}

impl CtxAsm {
    fn new(layout: &BlockLayout, at_offset: usize) -> Self {
        Self {
            buf: Vec::with_capacity(256),
            code_base: layout.code_base,
            ctx_base: layout.ctx_base,
            offset: at_offset,
        }
    }

    fn disp(&self, inst_len: usize, field: usize) -> i32 {
        let next = self.code_base + (self.offset + self.buf.len() + inst_len) as u64;
        let target = self.ctx_base + field as u64;
        target.wrapping_sub(next) as i64 as i32
    }

    fn save_ctx(&mut self, field: usize, reg: Reg) {
        let d = self.disp(7, field);
        self.buf.extend(asm::mov_store_rip(d, reg));
    }

    fn load_ctx(&mut self, reg: Reg, field: usize) {
        let d = self.disp(7, field);
        self.buf.extend(asm::mov_load_rip(reg, d));
    }

    fn raw_ctx(&mut self, inst_len: usize, field: usize, f: impl Fn(i32) -> Vec<u8>) {
        let d = self.disp(inst_len, field);
        let bytes = f(d);
        debug_assert_eq!(bytes.len(), inst_len);
        self.buf.extend(bytes);
    }

    fn raw(&mut self, bytes: Vec<u8>) {
        self.buf.extend(bytes);
    }

    fn finish(self) -> Vec<u8> {
        self.buf
    }
}
