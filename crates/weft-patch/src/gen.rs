//! Patch generators.
//!
//! A `PatchGenerator` lowers one semantic effect into a sequence of
//! `RelocatableInst`: marking an event for the host, breaking to the
//! epilogue, materialising an operand into a scratch register, or
//! simulating the stack effect of a call/return.

use thiserror::Error;
use weft_isa::{asm, encode, CodecError, DecodedInst, MemRef, Operands, Reg};
use weft_state::Context;

use crate::reloc::RelocatableInst;

/// Where instrumentation fires relative to the original instruction.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum InstPosition {
    PreInst,
    PostInst,
}

/// Why a block broke back to the host, packed into the origin cell.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum ExitCause {
    PreInst = 1,
    PostInst = 2,
    /// Sequence ended: a control transfer set the guest rip.
    Terminator = 3,
    /// The transfer bridge regained control from native execution.
    TransferReturn = 4,
}

impl ExitCause {
    pub fn from_u8(v: u8) -> Option<ExitCause> {
        match v {
            1 => Some(ExitCause::PreInst),
            2 => Some(ExitCause::PostInst),
            3 => Some(ExitCause::Terminator),
            4 => Some(ExitCause::TransferReturn),
            _ => None,
        }
    }
}

/// Pack an exit event for the origin cell: cause in the low byte, the
/// block-local instruction id in the upper half.
pub fn pack_origin(cause: ExitCause, inst_id: u16) -> u32 {
    (cause as u32) | (inst_id as u32) << 16
}

/// Decode an origin cell. Zero means "no event".
pub fn unpack_origin(origin: u64) -> Option<(ExitCause, u16)> {
    let cause = ExitCause::from_u8((origin & 0xff) as u8)?;
    Some((cause, (origin >> 16) as u16))
}

/// Generation errors.
#[derive(Debug, Error)]
pub enum GenError {
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),
    #[error("no scratch register available for instruction at {pc:#x}")]
    NoScratchRegister { pc: u64 },
    #[error("operand {index} of {mnemonic} cannot be materialised")]
    BadOperand { index: usize, mnemonic: &'static str },
}

/// Context handed to generator lowering.
pub struct GenCtx<'a> {
    pub inst: &'a DecodedInst,
    /// Block-local instruction id, baked into event marks.
    pub inst_id: u16,
    /// Scratch register spilled for this patch.
    pub temp: Reg,
    pub position: InstPosition,
}

/// Byte length of the break-to-host trailer that follows the resume
/// address materialisation: selector store, temp reload, epilogue jump.
const BREAK_TAIL_LEN: usize = 7 + 7 + 5;

/// Scratch register preference order. The engine picks the first one
/// the instruction does not touch.
const TEMP_CANDIDATES: [Reg; 8] = [
    Reg::R11,
    Reg::R10,
    Reg::R9,
    Reg::R8,
    Reg::Rcx,
    Reg::Rdx,
    Reg::Rsi,
    Reg::Rbx,
];

/// Pick a scratch register not used by the instruction.
pub fn pick_temp(inst: &DecodedInst) -> Result<Reg, GenError> {
    let used = inst.regs_used();
    TEMP_CANDIDATES
        .iter()
        .copied()
        .find(|r| used & r.bit() == 0)
        .ok_or(GenError::NoScratchRegister { pc: inst.address })
}

/// A semantic effect to splice into a patch.
#[derive(Clone, Debug)]
pub enum PatchGenerator {
    /// Write the packed exit event and (where meaningful) the guest rip
    /// into the context, so the host can attribute the break.
    EventMark,
    /// Store the resume address into the selector and jump to the
    /// epilogue. The spilled temp is reloaded before leaving.
    BreakToHost,
    /// Materialise operand `index` of the instruction into the temp.
    GetOperand { index: usize },
    /// Load an immediate into the temp.
    WriteTemp { value: u64 },
    /// Push a return address onto the guest stack through the temp.
    SimulateCall { ret_addr: u64 },
    /// Pop the guest stack into the rip slot through the temp.
    SimulateRet,
}

impl PatchGenerator {
    pub fn lower(&self, ctx: &GenCtx<'_>) -> Result<Vec<RelocatableInst>, GenError> {
        match self {
            PatchGenerator::EventMark => Ok(lower_event_mark(ctx)),
            PatchGenerator::BreakToHost => Ok(lower_break_to_host(ctx.temp)),
            PatchGenerator::GetOperand { index } => lower_get_operand(ctx, *index),
            PatchGenerator::WriteTemp { value } => Ok(vec![RelocatableInst::MovImm64 {
                reg: ctx.temp,
                value: *value,
            }]),
            PatchGenerator::SimulateCall { ret_addr } => Ok(vec![
                RelocatableInst::MovImm64 {
                    reg: ctx.temp,
                    value: *ret_addr,
                },
                RelocatableInst::Raw(asm::push_r(ctx.temp)),
            ]),
            PatchGenerator::SimulateRet => Ok(vec![
                RelocatableInst::Raw(asm::pop_r(ctx.temp)),
                RelocatableInst::SaveReg {
                    reg: ctx.temp,
                    offset: Context::RIP_OFF,
                },
            ]),
        }
    }
}

/// Store a 64-bit value into a context cell as two 32-bit immediate
/// stores — no register is touched and flags are preserved.
pub fn store_ctx_u64(offset: usize, value: u64) -> [RelocatableInst; 2] {
    [
        RelocatableInst::StoreImm32 {
            offset,
            value: value as u32,
        },
        RelocatableInst::StoreImm32 {
            offset: offset + 4,
            value: (value >> 32) as u32,
        },
    ]
}

fn lower_event_mark(ctx: &GenCtx<'_>) -> Vec<RelocatableInst> {
    let cause = match ctx.position {
        InstPosition::PreInst => ExitCause::PreInst,
        InstPosition::PostInst => ExitCause::PostInst,
    };
    let mut out = Vec::with_capacity(4);
    out.extend(store_ctx_u64(
        Context::ORIGIN_OFF,
        pack_origin(cause, ctx.inst_id) as u64,
    ));
    // Keep the guest rip current for the host. For a post-instruction
    // event on a control transfer the rip slot was already written by
    // the terminator lowering, so leave it alone.
    let rip = match ctx.position {
        InstPosition::PreInst => Some(ctx.inst.address),
        InstPosition::PostInst if !ctx.inst.ends_block() => Some(ctx.inst.next_address()),
        InstPosition::PostInst => None,
    };
    if let Some(rip) = rip {
        out.extend(store_ctx_u64(Context::RIP_OFF, rip));
    }
    out
}

/// The break-to-host tail: resume address into the spilled temp, temp
/// into the selector, temp reloaded from its context slot, jump to the
/// epilogue. Execution resumes right past the jump on next entry.
fn lower_break_to_host(temp: Reg) -> Vec<RelocatableInst> {
    vec![
        RelocatableInst::ResumeAddrToReg {
            reg: temp,
            bytes_after: BREAK_TAIL_LEN,
        },
        RelocatableInst::SaveReg {
            reg: temp,
            offset: Context::SELECTOR_OFF,
        },
        RelocatableInst::LoadReg {
            reg: temp,
            offset: Context::gpr_offset(temp),
        },
        RelocatableInst::JmpEpilogue,
    ]
}

fn lower_get_operand(ctx: &GenCtx<'_>, index: usize) -> Result<Vec<RelocatableInst>, GenError> {
    let inst = ctx.inst;
    let temp = ctx.temp;
    if index != 0 {
        return Err(GenError::BadOperand {
            index,
            mnemonic: inst.mnemonic(),
        });
    }
    match inst.operands {
        Operands::Reg { reg } => Ok(vec![RelocatableInst::Raw(asm::mov_rr(temp, reg))]),
        Operands::Rel { .. } => {
            let target = inst.rel_target().unwrap_or(inst.next_address());
            Ok(vec![RelocatableInst::MovImm64 { reg: temp, value: target }])
        }
        Operands::Mem { mem } => {
            if mem.rip {
                // The pointer lives at a guest-pc-relative location;
                // materialise its absolute address, then load through it.
                let loc = inst.next_address().wrapping_add(mem.disp as i64 as u64);
                let load = load_through(temp, MemRef::base(temp), inst)?;
                Ok(vec![
                    RelocatableInst::MovImm64 { reg: temp, value: loc },
                    RelocatableInst::Raw(load),
                ])
            } else {
                Ok(vec![RelocatableInst::Raw(load_through(temp, mem, inst)?)])
            }
        }
        _ => Err(GenError::BadOperand {
            index,
            mnemonic: inst.mnemonic(),
        }),
    }
}

fn load_through(temp: Reg, mem: MemRef, inst: &DecodedInst) -> Result<Vec<u8>, GenError> {
    let load = DecodedInst::new(
        weft_isa::OP_MOV,
        inst.address,
        0,
        weft_isa::Width::Q,
        Operands::RegMem { dst: temp, mem },
    );
    Ok(encode(&load)?)
}
