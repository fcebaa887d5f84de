//! Per-block execution context.
//!
//! A `Context` lives at the start of each ExecBlock's data page. The
//! prologue saves the host registers into `HostState` and loads the
//! guest state; the epilogue does the reverse. Emitted code reaches the
//! context through rip-relative displacements derived from the offset
//! constants below.

use weft_isa::Reg;

use crate::fpr::FprState;
use crate::gpr::GprState;

/// Host registers saved across a block execution, plus the exit cells.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct HostState {
    pub rsp: u64,
    pub rbx: u64,
    pub rbp: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    /// Absolute host address at which the prologue resumes execution.
    pub selector: u64,
    /// Packed exit event written by the patch that broke to host.
    pub origin: u64,
    /// Scratch cell, used as the indirect target of the transfer bridge.
    pub scratch: u64,
}

/// The per-block context: host save area, guest register file, guest
/// FPU/SSE image.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct Context {
    pub host: HostState,
    pub gpr: GprState,
    pub fpr: FprState,
}

impl Context {
    pub const HOST_OFF: usize = std::mem::offset_of!(Context, host);
    pub const GPR_OFF: usize = std::mem::offset_of!(Context, gpr);
    pub const FPR_OFF: usize = std::mem::offset_of!(Context, fpr);

    pub const SELECTOR_OFF: usize =
        Self::HOST_OFF + std::mem::offset_of!(HostState, selector);
    pub const ORIGIN_OFF: usize = Self::HOST_OFF + std::mem::offset_of!(HostState, origin);
    pub const SCRATCH_OFF: usize = Self::HOST_OFF + std::mem::offset_of!(HostState, scratch);

    pub const HOST_RSP_OFF: usize = Self::HOST_OFF + std::mem::offset_of!(HostState, rsp);
    pub const HOST_RBX_OFF: usize = Self::HOST_OFF + std::mem::offset_of!(HostState, rbx);
    pub const HOST_RBP_OFF: usize = Self::HOST_OFF + std::mem::offset_of!(HostState, rbp);
    pub const HOST_R12_OFF: usize = Self::HOST_OFF + std::mem::offset_of!(HostState, r12);
    pub const HOST_R13_OFF: usize = Self::HOST_OFF + std::mem::offset_of!(HostState, r13);
    pub const HOST_R14_OFF: usize = Self::HOST_OFF + std::mem::offset_of!(HostState, r14);
    pub const HOST_R15_OFF: usize = Self::HOST_OFF + std::mem::offset_of!(HostState, r15);

    pub const RIP_OFF: usize = Self::GPR_OFF + std::mem::offset_of!(GprState, rip);
    pub const EFLAGS_OFF: usize = Self::GPR_OFF + std::mem::offset_of!(GprState, eflags);

    /// Context offset of a guest register slot.
    pub const fn gpr_offset(reg: Reg) -> usize {
        Self::GPR_OFF + GprState::reg_offset(reg)
    }

    pub const fn new() -> Self {
        Self {
            host: HostState {
                rsp: 0,
                rbx: 0,
                rbp: 0,
                r12: 0,
                r13: 0,
                r14: 0,
                r15: 0,
                selector: 0,
                origin: 0,
                scratch: 0,
            },
            gpr: GprState::new(),
            fpr: FprState::new(),
        }
    }
}
