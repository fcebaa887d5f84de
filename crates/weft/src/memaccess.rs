//! Memory-access extraction.
//!
//! At an instrumentation break the full guest register file is
//! available, so the engine evaluates the instruction's memory operands
//! against it and reads the accessed bytes from process memory (the
//! guest runs in our own address space). Reads are captured before the
//! instruction executes, writes after, matching the positions the
//! shadow rules break at.

use weft_isa::{DecodedInst, MemLoc, MemOperand, Operands, OP_RET};
use weft_state::GprState;

use crate::action::MemoryAccessType;

/// One recorded architectural memory access.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MemoryAccess {
    /// Address of the accessing instruction.
    pub inst_address: u64,
    /// Address accessed.
    pub access_address: u64,
    /// Value read or written. Zero (with `value_known == false`) for a
    /// write observed before the instruction executed.
    pub value: u64,
    /// Access size in bytes.
    pub size: u8,
    pub kind: MemoryAccessType,
    /// Whether `value` reflects the bytes actually transferred.
    pub value_known: bool,
}

/// Effective address of one memory operand.
///
/// `pre` tells whether the registers reflect the state before or after
/// the instruction executed; the implicit stack slots move with rsp.
pub fn effective_address(
    inst: &DecodedInst,
    op: &MemOperand,
    gpr: &GprState,
    pre: bool,
) -> u64 {
    match op.loc {
        MemLoc::Explicit(mem) => {
            if mem.rip {
                return inst.next_address().wrapping_add(mem.disp as i64 as u64);
            }
            let base = mem.base.map_or(0, |r| gpr.get(r));
            let index = mem.index.map_or(0, |r| gpr.get(r).wrapping_mul(mem.scale as u64));
            base.wrapping_add(index).wrapping_add(mem.disp as i64 as u64)
        }
        MemLoc::StackPush => {
            if pre {
                gpr.rsp.wrapping_sub(8)
            } else {
                gpr.rsp
            }
        }
        MemLoc::StackPop => {
            if pre {
                gpr.rsp
            } else {
                // rsp already advanced past the slot; ret imm16 also
                // released the extra bytes.
                let extra = match (inst.opid, &inst.operands) {
                    (OP_RET, Operands::Imm { imm }) => *imm as u64,
                    _ => 0,
                };
                gpr.rsp.wrapping_sub(8).wrapping_sub(extra)
            }
        }
    }
}

/// Read up to 8 bytes from process memory.
///
/// # Safety
///
/// `addr` must be readable for `size` bytes. The engine only calls this
/// for addresses the guest instruction itself accesses at this point.
unsafe fn read_value(addr: u64, size: u8) -> u64 {
    let mut value = 0u64;
    std::ptr::copy_nonoverlapping(
        addr as *const u8,
        &mut value as *mut u64 as *mut u8,
        (size as usize).min(8),
    );
    value
}

/// Extract the instruction's memory accesses against the given register
/// state.
///
/// With `pre` set, read operands carry their exact value and write
/// operands are reported address-only; after execution the roles swap.
///
/// # Safety
///
/// The register state must be the guest state at the corresponding
/// boundary of this instruction, so that every computed address is one
/// the instruction actually accesses (and is therefore mapped).
pub unsafe fn extract_accesses(
    inst: &DecodedInst,
    gpr: &GprState,
    pre: bool,
) -> Vec<MemoryAccess> {
    let mut out = Vec::new();
    for op in inst.memory_operands() {
        let addr = effective_address(inst, &op, gpr, pre);
        if op.kind.reads() {
            let value_known = pre;
            out.push(MemoryAccess {
                inst_address: inst.address,
                access_address: addr,
                value: read_value(addr, op.width.bytes()),
                size: op.width.bytes(),
                kind: MemoryAccessType::Read,
                value_known,
            });
        }
        if op.kind.writes() {
            let value_known = !pre;
            out.push(MemoryAccess {
                inst_address: inst.address,
                access_address: addr,
                value: if value_known {
                    read_value(addr, op.width.bytes())
                } else {
                    0
                },
                size: op.width.bytes(),
                kind: MemoryAccessType::Write,
                value_known,
            });
        }
    }
    out
}
