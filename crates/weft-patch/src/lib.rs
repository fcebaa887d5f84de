//! Instruction rewriting and instrumentation rules for the weft DBI
//! engine.
//!
//! The pipeline: a decoded instruction becomes a `Patch` through the
//! `MachineBackend` recipes (pass-through, pc-relative rewrite, or
//! control-flow lowering), matching `InstrRule`s splice generator
//! output around it, and the assembled `RelocatableInst` sequence is
//! materialised into an ExecBlock.

mod backend;
mod cond;
mod gen;
mod patch;
mod reloc;
mod rule;
mod x86_64;

pub use backend::{BlockLayout, MachineBackend};
pub use cond::PatchCondition;
pub use gen::{
    pack_origin, pick_temp, store_ctx_u64, unpack_origin, ExitCause, GenCtx, GenError,
    InstPosition, PatchGenerator,
};
pub use patch::Patch;
pub use reloc::{sequence_len, RelocFrame, RelocatableInst};
pub use rule::InstrRule;
pub use x86_64::X86Backend;
