//! The ExecBlock: a code/data page pair holding instrumented sequences.
//!
//! Layout of the code region:
//!
//! ```text
//! offset 0:            prologue (host save, guest restore, selector jump)
//! offset E:            epilogue (guest save, host restore, ret)
//! offset E + len:      patches, appended sequence by sequence
//! ```
//!
//! The data region starts with the `Context`. Entering the block runs
//! the prologue, which dispatches through `Context.host.selector`;
//! every exit path stores a packed event into `Context.host.origin` and
//! jumps to the epilogue.

use thiserror::Error;
use tracing::trace;

use weft_patch::{BlockLayout, MachineBackend, RelocFrame, RelocatableInst};
use weft_state::Context;

use crate::pages::{ExecPages, PageError};

/// Per-block lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlockState {
    /// Prologue/epilogue written, no patches yet.
    Empty,
    /// Code region RW, patches may be appended.
    Writing,
    /// Writes complete, permissions not yet flipped.
    Sealed,
    /// Code region RX, ready to run.
    Executable,
    /// Dropped from the cache; kept only until deallocation.
    Invalidated,
}

/// Block errors.
#[derive(Debug, Error)]
pub enum BlockError {
    #[error("page error: {0}")]
    Page(#[from] PageError),

    #[error("code region full: needed {needed} bytes, {available} available")]
    NoSpace { needed: usize, available: usize },

    #[error("operation invalid in state {state:?}")]
    InvalidState { state: BlockState },
}

/// One cached guest sequence inside a block.
#[derive(Clone, Copy, Debug)]
pub struct SeqEntry {
    pub start_pc: u64,
    pub end_pc: u64,
    /// Code offset of the sequence's first patch.
    pub entry_offset: usize,
    /// First block-local instruction id of the sequence.
    pub first_inst: u16,
    /// One past the last instruction id.
    pub end_inst: u16,
}

/// One patched guest instruction inside a block.
#[derive(Clone, Copy, Debug)]
pub struct InstSlot {
    pub guest_pc: u64,
    pub guest_len: u8,
    /// Code offset of the patch's first byte.
    pub host_offset: u32,
    /// One past the patch's last byte.
    pub host_end: u32,
}

pub struct ExecBlock {
    pages: ExecPages,
    cursor: usize,
    epilogue_offset: usize,
    seqs: Vec<SeqEntry>,
    insts: Vec<InstSlot>,
    state: BlockState,
}

impl ExecBlock {
    /// Allocate a block and write its prologue and epilogue.
    pub fn new(
        backend: &dyn MachineBackend,
        code_pages: usize,
        data_pages: usize,
    ) -> Result<Self, BlockError> {
        let pages = ExecPages::new(code_pages, data_pages)?;

        // SAFETY: the data region is at least one page and Context fits.
        unsafe {
            pages.data_ptr().cast::<Context>().write(Context::new());
        }

        let layout = BlockLayout {
            code_base: pages.code_ptr() as u64,
            ctx_base: pages.data_ptr() as u64,
        };
        let prologue = backend.emit_prologue(&layout);
        let epilogue_offset = prologue.len();
        let epilogue = backend.emit_epilogue(&layout, epilogue_offset);

        // SAFETY: prologue+epilogue are far smaller than one page.
        unsafe {
            std::ptr::copy_nonoverlapping(prologue.as_ptr(), pages.code_ptr(), prologue.len());
            std::ptr::copy_nonoverlapping(
                epilogue.as_ptr(),
                pages.code_ptr().add(epilogue_offset),
                epilogue.len(),
            );
        }

        Ok(Self {
            pages,
            cursor: epilogue_offset + epilogue.len(),
            epilogue_offset,
            seqs: Vec::new(),
            insts: Vec::new(),
            state: BlockState::Empty,
        })
    }

    pub fn code_base(&self) -> u64 {
        self.pages.code_ptr() as u64
    }

    pub fn ctx_base(&self) -> u64 {
        self.pages.data_ptr() as u64
    }

    pub fn state(&self) -> BlockState {
        self.state
    }

    pub fn epilogue_offset(&self) -> usize {
        self.epilogue_offset
    }

    pub fn context(&self) -> &Context {
        // SAFETY: the data region holds an initialised Context for the
        // lifetime of the block.
        unsafe { &*(self.pages.data_ptr() as *const Context) }
    }

    pub fn context_mut(&mut self) -> &mut Context {
        // SAFETY: as above, and &mut self gives exclusive access.
        unsafe { &mut *(self.pages.data_ptr() as *mut Context) }
    }

    /// Bytes still available for patches.
    pub fn available(&self) -> usize {
        self.pages.code_size() - self.cursor
    }

    /// Flip the code region writable so sequences can be appended.
    pub fn make_writable(&mut self) -> Result<(), BlockError> {
        match self.state {
            BlockState::Empty | BlockState::Writing => Ok(()),
            BlockState::Executable | BlockState::Sealed => {
                self.pages.make_code_writable()?;
                self.state = BlockState::Writing;
                Ok(())
            }
            BlockState::Invalidated => Err(BlockError::InvalidState { state: self.state }),
        }
    }

    /// Materialise and append a relocatable sequence; returns its code
    /// offset.
    pub fn append(
        &mut self,
        relocs: &[RelocatableInst],
        guest_pc: u64,
    ) -> Result<usize, BlockError> {
        match self.state {
            BlockState::Empty => self.state = BlockState::Writing,
            BlockState::Writing => {}
            state => return Err(BlockError::InvalidState { state }),
        }

        let needed: usize = relocs.iter().map(RelocatableInst::encoded_len).sum();
        if needed > self.available() {
            return Err(BlockError::NoSpace {
                needed,
                available: self.available(),
            });
        }

        let start = self.cursor;
        for inst in relocs {
            let frame = RelocFrame {
                code_base: self.code_base(),
                ctx_base: self.ctx_base(),
                host_offset: self.cursor,
                guest_pc,
                epilogue_offset: self.epilogue_offset,
            };
            let bytes = inst.materialize(&frame);
            // SAFETY: bounds were checked against the code region above.
            unsafe {
                std::ptr::copy_nonoverlapping(
                    bytes.as_ptr(),
                    self.pages.code_ptr().add(self.cursor),
                    bytes.len(),
                );
            }
            self.cursor += bytes.len();
        }
        trace!(offset = start, bytes = needed, guest_pc, "patch appended");
        Ok(start)
    }

    /// Record an appended instruction for the host/guest index.
    pub fn note_inst(&mut self, slot: InstSlot) -> u16 {
        let id = self.insts.len() as u16;
        self.insts.push(slot);
        id
    }

    /// Open a new sequence at the current cursor.
    pub fn start_sequence(&mut self, start_pc: u64) -> u16 {
        let id = self.seqs.len() as u16;
        self.seqs.push(SeqEntry {
            start_pc,
            end_pc: start_pc,
            entry_offset: self.cursor,
            first_inst: self.insts.len() as u16,
            end_inst: self.insts.len() as u16,
        });
        id
    }

    pub fn end_sequence(&mut self, seq_id: u16, end_pc: u64) {
        let end_inst = self.insts.len() as u16;
        if let Some(seq) = self.seqs.get_mut(seq_id as usize) {
            seq.end_pc = end_pc;
            seq.end_inst = end_inst;
        }
    }

    pub fn sequence(&self, seq_id: u16) -> Option<&SeqEntry> {
        self.seqs.get(seq_id as usize)
    }

    pub fn sequences(&self) -> &[SeqEntry] {
        &self.seqs
    }

    pub fn inst(&self, inst_id: u16) -> Option<&InstSlot> {
        self.insts.get(inst_id as usize)
    }

    /// Sequence containing a block-local instruction id.
    pub fn seq_of_inst(&self, inst_id: u16) -> Option<u16> {
        self.seqs
            .iter()
            .position(|s| s.first_inst <= inst_id && inst_id < s.end_inst)
            .map(|i| i as u16)
    }

    /// Map a host address inside this block back to the guest PC of the
    /// covering patch, for postmortem reporting.
    pub fn host_to_guest(&self, host_addr: u64) -> Option<u64> {
        let base = self.code_base();
        if host_addr < base || host_addr >= base + self.pages.code_size() as u64 {
            return None;
        }
        let off = (host_addr - base) as u32;
        self.insts
            .iter()
            .find(|s| s.host_offset <= off && off < s.host_end)
            .map(|s| s.guest_pc)
    }

    /// Seal the block and flip the code region executable.
    pub fn finalize(&mut self) -> Result<(), BlockError> {
        match self.state {
            BlockState::Writing | BlockState::Empty => {
                self.state = BlockState::Sealed;
                self.pages.make_code_exec()?;
                self.state = BlockState::Executable;
                Ok(())
            }
            BlockState::Executable => Ok(()),
            state => Err(BlockError::InvalidState { state }),
        }
    }

    pub fn invalidate(&mut self) {
        self.state = BlockState::Invalidated;
    }

    /// Point the selector at a sequence entry.
    pub fn select_sequence(&mut self, seq_id: u16) {
        if let Some(entry_offset) = self.sequence(seq_id).map(|s| s.entry_offset) {
            let base = self.code_base();
            self.context_mut().host.selector = base + entry_offset as u64;
        }
    }

    /// Enter the block through its prologue. Returns the packed origin
    /// cell written by the exit path, clearing it for the next entry.
    ///
    /// # Safety
    ///
    /// The block must contain well-formed instrumented code and the
    /// context's guest state (in particular rsp for any stack-using
    /// patch) must be valid for it.
    pub unsafe fn execute(&mut self) -> Result<u64, BlockError> {
        if self.state != BlockState::Executable {
            return Err(BlockError::InvalidState { state: self.state });
        }
        let entry: unsafe extern "C" fn() = std::mem::transmute(self.code_base() as *const u8);
        entry();
        let ctx = self.context_mut();
        let origin = ctx.host.origin;
        ctx.host.origin = 0;
        Ok(origin)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use weft_isa::X86Codec;
    use weft_patch::X86Backend;

    fn backend() -> X86Backend {
        X86Backend::new(X86Codec::default(), false)
    }

    #[test]
    fn test_new_block_state_machine() {
        let b = backend();
        let mut block = ExecBlock::new(&b, 1, 1).expect("block");
        assert_eq!(block.state(), BlockState::Empty);

        block
            .append(&[RelocatableInst::Raw(vec![0x90])], 0x1000)
            .expect("append");
        assert_eq!(block.state(), BlockState::Writing);

        block.finalize().expect("finalize");
        assert_eq!(block.state(), BlockState::Executable);

        // Appending to an executable block is a state error until it is
        // made writable again.
        assert!(matches!(
            block.append(&[RelocatableInst::Raw(vec![0x90])], 0x1001),
            Err(BlockError::InvalidState { .. })
        ));
        block.make_writable().expect("writable");
        assert_eq!(block.state(), BlockState::Writing);
    }

    #[test]
    fn test_append_returns_no_space() {
        let b = backend();
        let mut block = ExecBlock::new(&b, 1, 1).expect("block");
        let huge = vec![RelocatableInst::Raw(vec![0x90; 8192])];
        assert!(matches!(
            block.append(&huge, 0x1000),
            Err(BlockError::NoSpace { .. })
        ));
    }

    #[test]
    fn test_sequence_bookkeeping() {
        let b = backend();
        let mut block = ExecBlock::new(&b, 1, 1).expect("block");
        let seq = block.start_sequence(0x1000);
        let off = block
            .append(&[RelocatableInst::Raw(vec![0x90])], 0x1000)
            .unwrap();
        block.note_inst(InstSlot {
            guest_pc: 0x1000,
            guest_len: 1,
            host_offset: off as u32,
            host_end: off as u32 + 1,
        });
        block.end_sequence(seq, 0x1001);

        let entry = block.sequence(seq).unwrap();
        assert_eq!(entry.start_pc, 0x1000);
        assert_eq!(entry.end_pc, 0x1001);
        assert_eq!(entry.first_inst, 0);
        assert_eq!(entry.end_inst, 1);
        let entry_offset = entry.entry_offset;
        assert_eq!(block.seq_of_inst(0), Some(seq));

        // seq_index is monotonically increasing in both coordinates.
        let seq2 = block.start_sequence(0x2000);
        block
            .append(&[RelocatableInst::Raw(vec![0x90])], 0x2000)
            .unwrap();
        block.end_sequence(seq2, 0x2001);
        assert!(block.sequence(seq2).unwrap().entry_offset > entry_offset);
    }

    #[test]
    fn test_host_to_guest_mapping() {
        let b = backend();
        let mut block = ExecBlock::new(&b, 1, 1).expect("block");
        let off = block
            .append(&[RelocatableInst::Raw(vec![0x90, 0x90])], 0x4000)
            .unwrap();
        block.note_inst(InstSlot {
            guest_pc: 0x4000,
            guest_len: 2,
            host_offset: off as u32,
            host_end: off as u32 + 2,
        });
        let base = block.code_base();
        assert_eq!(block.host_to_guest(base + off as u64), Some(0x4000));
        assert_eq!(block.host_to_guest(base + off as u64 + 1), Some(0x4000));
        assert_eq!(block.host_to_guest(base), None); // prologue
        assert_eq!(block.host_to_guest(0), None);
    }

    #[test]
    fn test_selector_points_at_sequence() {
        let b = backend();
        let mut block = ExecBlock::new(&b, 1, 1).expect("block");
        let seq = block.start_sequence(0x1000);
        block
            .append(&[RelocatableInst::Raw(vec![0x90])], 0x1000)
            .unwrap();
        block.end_sequence(seq, 0x1001);
        block.select_sequence(seq);
        let expected = block.code_base() + block.sequence(seq).unwrap().entry_offset as u64;
        assert_eq!(block.context().host.selector, expected);
    }
}
