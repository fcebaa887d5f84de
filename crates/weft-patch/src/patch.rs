//! The patch: one original instruction and its rewritten form.

use weft_isa::DecodedInst;
use weft_state::Context;

use crate::gen::{pack_origin, store_ctx_u64, ExitCause, GenCtx, GenError, InstPosition, PatchGenerator};
use crate::reloc::{sequence_len, RelocatableInst};

/// The rewritten form of a single original instruction plus any spliced
/// instrumentation.
///
/// Segments are assembled in order: temp spill, pre-instruction
/// instrumentation, the (rewritten) original body, the terminator
/// logic, post-instruction instrumentation, and the exit. Executing the
/// result against the prevailing context yields the same guest-state
/// transition as the original instruction.
#[derive(Clone, Debug)]
pub struct Patch {
    pub inst: DecodedInst,
    /// Block-local instruction id baked into event marks.
    pub inst_id: u16,
    /// Scratch register spilled for the patch, if any segment needs one.
    pub temp: Option<weft_isa::Reg>,
    pre: Vec<RelocatableInst>,
    body: Vec<RelocatableInst>,
    term: Vec<RelocatableInst>,
    post: Vec<RelocatableInst>,
    /// Whether this patch ends its sequence (emits a terminator exit).
    pub ends_block: bool,
    has_pre_break: bool,
    has_post_break: bool,
}

impl Patch {
    pub fn new(inst: DecodedInst, inst_id: u16) -> Self {
        Self {
            inst,
            inst_id,
            temp: None,
            pre: Vec::new(),
            body: Vec::new(),
            term: Vec::new(),
            post: Vec::new(),
            ends_block: false,
            has_pre_break: false,
            has_post_break: false,
        }
    }

    pub fn guest_addr(&self) -> u64 {
        self.inst.address
    }

    pub fn guest_len(&self) -> u8 {
        self.inst.size
    }

    /// Allocate (or reuse) the patch's scratch register.
    pub fn require_temp(&mut self) -> Result<weft_isa::Reg, GenError> {
        if let Some(t) = self.temp {
            return Ok(t);
        }
        let t = crate::gen::pick_temp(&self.inst)?;
        self.temp = Some(t);
        Ok(t)
    }

    pub fn push_body(&mut self, inst: RelocatableInst) {
        self.body.push(inst);
    }

    pub fn push_term(&mut self, inst: RelocatableInst) {
        self.term.push(inst);
    }

    pub fn extend_term(&mut self, insts: impl IntoIterator<Item = RelocatableInst>) {
        self.term.extend(insts);
    }

    pub fn has_break(&self, position: InstPosition) -> bool {
        match position {
            InstPosition::PreInst => self.has_pre_break,
            InstPosition::PostInst => self.has_post_break,
        }
    }

    /// Splice an event mark and break at the given position. One break
    /// per position serves every matching rule; the host walks the
    /// cached callbacks in registration order when it fires.
    pub fn add_event_break(&mut self, position: InstPosition) -> Result<(), GenError> {
        if self.has_break(position) {
            return Ok(());
        }
        let temp = self.require_temp()?;
        let ctx = GenCtx {
            inst: &self.inst,
            inst_id: self.inst_id,
            temp,
            position,
        };
        let mut insts = PatchGenerator::EventMark.lower(&ctx)?;
        insts.extend(PatchGenerator::BreakToHost.lower(&ctx)?);
        match position {
            InstPosition::PreInst => {
                self.pre.extend(insts);
                self.has_pre_break = true;
            }
            InstPosition::PostInst => {
                self.post.extend(insts);
                self.has_post_break = true;
            }
        }
        Ok(())
    }

    /// Splice raw generator output at a position (no break).
    pub fn add_generators(
        &mut self,
        position: InstPosition,
        generators: &[PatchGenerator],
    ) -> Result<(), GenError> {
        let temp = self.require_temp()?;
        let ctx = GenCtx {
            inst: &self.inst,
            inst_id: self.inst_id,
            temp,
            position,
        };
        let mut out = Vec::new();
        for g in generators {
            out.extend(g.lower(&ctx)?);
        }
        match position {
            InstPosition::PreInst => self.pre.extend(out),
            InstPosition::PostInst => self.post.extend(out),
        }
        Ok(())
    }

    /// Assemble the full relocatable sequence for this patch.
    pub fn assemble(&self) -> Vec<RelocatableInst> {
        let mut out = Vec::with_capacity(
            2 + self.pre.len() + self.body.len() + self.term.len() + self.post.len() + 3,
        );
        if let Some(t) = self.temp {
            out.push(RelocatableInst::SaveReg {
                reg: t,
                offset: Context::gpr_offset(t),
            });
        }
        out.extend(self.pre.iter().cloned());
        out.extend(self.body.iter().cloned());
        out.extend(self.term.iter().cloned());
        out.extend(self.post.iter().cloned());
        // The epilogue stores every real register into the guest file,
        // so the spilled temp must hold its guest value again on every
        // path that leaves the patch.
        if let Some(t) = self.temp {
            out.push(RelocatableInst::LoadReg {
                reg: t,
                offset: Context::gpr_offset(t),
            });
        }
        if self.ends_block {
            out.extend(store_ctx_u64(
                Context::ORIGIN_OFF,
                pack_origin(ExitCause::Terminator, self.inst_id) as u64,
            ));
            out.push(RelocatableInst::JmpEpilogue);
        }
        out
    }

    /// Encoded byte length of the assembled patch.
    pub fn encoded_len(&self) -> usize {
        sequence_len(&self.assemble())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use weft_isa::{decode, encode};

    fn patch_for(bytes: &[u8], pc: u64) -> Patch {
        let inst = decode(bytes, pc).unwrap();
        let mut p = Patch::new(inst.clone(), 0);
        p.push_body(RelocatableInst::Raw(encode(&inst).unwrap()));
        p
    }

    #[test]
    fn test_plain_patch_is_just_the_body() {
        let p = patch_for(&[0x48, 0x89, 0xc3], 0x1000);
        let seq = p.assemble();
        assert_eq!(seq.len(), 1);
        assert_eq!(p.encoded_len(), 3);
    }

    #[test]
    fn test_event_break_adds_spill_and_restore() {
        let mut p = patch_for(&[0x48, 0x89, 0xc3], 0x1000);
        p.add_event_break(InstPosition::PreInst).unwrap();
        let seq = p.assemble();
        // spill, origin lo/hi, rip lo/hi, resume, selector store, temp
        // reload, epilogue jump, body, trailing restore.
        assert!(matches!(seq[0], RelocatableInst::SaveReg { .. }));
        assert!(matches!(seq.last(), Some(RelocatableInst::LoadReg { .. })));
        // The body comes after the pre break.
        let jmp_idx = seq
            .iter()
            .position(|i| matches!(i, RelocatableInst::JmpEpilogue))
            .unwrap();
        let body_idx = seq
            .iter()
            .position(|i| matches!(i, RelocatableInst::Raw(_)))
            .unwrap();
        assert!(body_idx > jmp_idx);
    }

    #[test]
    fn test_event_break_is_idempotent_per_position() {
        let mut p = patch_for(&[0x48, 0x89, 0xc3], 0x1000);
        p.add_event_break(InstPosition::PreInst).unwrap();
        let len = p.encoded_len();
        p.add_event_break(InstPosition::PreInst).unwrap();
        assert_eq!(p.encoded_len(), len);
        p.add_event_break(InstPosition::PostInst).unwrap();
        assert!(p.encoded_len() > len);
    }

    #[test]
    fn test_terminator_patch_emits_exit() {
        let inst = decode(&[0xc3], 0x1000).unwrap();
        let mut p = Patch::new(inst, 7);
        p.ends_block = true;
        let seq = p.assemble();
        assert!(matches!(seq.last(), Some(RelocatableInst::JmpEpilogue)));
        assert!(matches!(
            seq[seq.len() - 3],
            RelocatableInst::StoreImm32 { offset, value }
                if offset == Context::ORIGIN_OFF
                    && value == pack_origin(ExitCause::Terminator, 7)
        ));
    }
}
