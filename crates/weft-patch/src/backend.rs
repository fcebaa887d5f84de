//! Machine backend capability.
//!
//! Everything architecture-specific the engine and block manager need:
//! decoding, patch recipes, the block prologue/epilogue, and the
//! transfer stubs. The engine, manager and rule engine stay
//! architecture-neutral behind this trait.

use weft_isa::{DecodedInst, MachineCodec};

use crate::gen::GenError;
use crate::patch::Patch;
use crate::reloc::RelocatableInst;

/// Addresses of one ExecBlock's pages, for prologue/epilogue emission.
#[derive(Clone, Copy, Debug)]
pub struct BlockLayout {
    /// Absolute address of the code page.
    pub code_base: u64,
    /// Absolute address of the block's `Context`.
    pub ctx_base: u64,
}

pub trait MachineBackend {
    fn codec(&self) -> &dyn MachineCodec;

    /// Decode one instruction at `pc`.
    fn decode(&self, bytes: &[u8], pc: u64) -> Result<DecodedInst, GenError> {
        Ok(self.codec().decode(bytes, pc)?)
    }

    /// Build the base patch for one instruction: pass through plain
    /// data processing, rewrite pc-relative operands, lower control
    /// flow to rip stores and an epilogue exit.
    fn make_patch(&self, inst: &DecodedInst, inst_id: u16) -> Result<Patch, GenError>;

    /// Synthetic sequence exit used when translation stops without a
    /// terminator (range end, capacity, instruction cap).
    fn fallthrough_exit(&self, next_pc: u64, inst_id: u16) -> Vec<RelocatableInst>;

    /// Emit the block prologue (host save, guest restore, selector
    /// dispatch), placed at code offset 0.
    fn emit_prologue(&self, layout: &BlockLayout) -> Vec<u8>;

    /// Emit the block epilogue (guest save, host restore, return),
    /// placed at `at_offset`.
    fn emit_epilogue(&self, layout: &BlockLayout, at_offset: usize) -> Vec<u8>;

    /// The transfer bridge pieces: the entry stub that jumps through
    /// the context scratch cell, and the landing pad native code
    /// returns to.
    fn transfer_stub(&self) -> (Vec<RelocatableInst>, Vec<RelocatableInst>);

    /// Worst-case encoded size of a fully instrumented patch, used for
    /// capacity planning.
    fn max_patch_len(&self) -> usize;
}
