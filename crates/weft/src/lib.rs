//! weft — a user-mode dynamic binary instrumentation engine.
//!
//! weft takes native x86-64 code at a target address and produces an
//! instrumented variant running inside controlled ExecBlocks, invoking
//! user callbacks before, after or around each original instruction
//! while preserving the original semantics.
//!
//! # Example
//!
//! ```ignore
//! use weft::{Vm, InstPosition, VmAction};
//!
//! let mut vm = Vm::with_defaults();
//! vm.add_instrumented_range(code_start, code_end)?;
//! vm.add_code_cb(InstPosition::PreInst, std::rc::Rc::new(|ctx| {
//!     println!("{:#x}", ctx.gpr.rip);
//!     VmAction::Continue
//! }));
//! vm.run(code_start, code_end)?;
//! ```

mod action;
mod analysis;
mod engine;
mod error;
mod maps;
mod memaccess;
mod vm;

pub use action::{
    CallbackCtx, InstCallback, InstrRuleCallback, InstrRuleDataCbk, MemoryAccessType, VmAction,
    VmCallback, VmState, EVENT_BASIC_BLOCK_ENTRY, EVENT_BASIC_BLOCK_EXIT, EVENT_BASIC_BLOCK_NEW,
    EVENT_EXEC_TRANSFER_CALL, EVENT_EXEC_TRANSFER_RETURN, EVENT_SEQUENCE_ENTRY,
    EVENT_SEQUENCE_EXIT, EVENT_SYSCALL_ENTRY, EVENT_SYSCALL_EXIT, EVENT_TRANSLATION_ERROR,
    INVALID_EVENT_ID, VIRTUAL_ID_MASK,
};
pub use analysis::{
    analyze, InstAnalysis, ANALYSIS_DISASSEMBLY, ANALYSIS_INSTRUCTION, ANALYSIS_OPERANDS,
    ANALYSIS_SYMBOL,
};
pub use engine::{Engine, EngineConfig};
pub use error::{Error, Result};
pub use maps::{current_process_maps, MemoryMap, PF_EXEC, PF_NONE, PF_READ, PF_WRITE};
pub use memaccess::{effective_address, MemoryAccess};
pub use vm::Vm;

// The rewriting and cache layers, re-exported for embedders that build
// custom rules or inspect blocks.
pub use weft_exec::{BlockConfig, BlockState, ExecBlock, ExecBlockManager};
pub use weft_isa::{DecodedInst, MachineCodec, OpId, Operands, Reg, X86Codec};
pub use weft_patch::{
    ExitCause, InstPosition, InstrRule, MachineBackend, Patch, PatchCondition, PatchGenerator,
    RelocatableInst, X86Backend,
};
pub use weft_range::{Range, RangeSet};
pub use weft_state::{Context, FprState, GprState, HostState};
