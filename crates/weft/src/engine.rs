//! The engine: translation on miss, block dispatch, callback delivery.

use std::rc::Rc;

use rustc_hash::{FxHashMap, FxHashSet};
use tracing::{debug, trace, warn};

use weft_exec::{BlockConfig, ExecBlockManager, TransferBridge};
use weft_isa::{DecodedInst, X86Codec, OP_SYSCALL};
use weft_patch::{
    unpack_origin, ExitCause, InstPosition, InstrRule, MachineBackend, PatchCondition, X86Backend,
};
use weft_range::{Range, RangeSet};
use weft_state::{FprState, GprState};

use crate::action::{
    CallbackCtx, InstCallback, InstrRuleCallback, MemoryAccessType, VmAction, VmCallback, VmState,
    EVENT_BASIC_BLOCK_ENTRY, EVENT_BASIC_BLOCK_EXIT, EVENT_BASIC_BLOCK_NEW,
    EVENT_EXEC_TRANSFER_CALL, EVENT_EXEC_TRANSFER_RETURN, EVENT_SEQUENCE_ENTRY,
    EVENT_SEQUENCE_EXIT, EVENT_SYSCALL_ENTRY, EVENT_SYSCALL_EXIT, EVENT_TRANSLATION_ERROR,
    INVALID_EVENT_ID, VIRTUAL_ID_MASK,
};
use crate::analysis::{analyze, InstAnalysis};
use crate::error::{Error, Result};
use crate::memaccess::{extract_accesses, MemoryAccess};

/// Engine construction options.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// CPU model string forwarded to the codec.
    pub cpu: String,
    /// Machine attribute flags forwarded to the codec.
    pub mattrs: Vec<String>,
    /// Save/restore the guest FPU/SSE image on block entry/exit.
    pub enable_fpr: bool,
    /// ExecBlock sizing.
    pub block: BlockConfig,
    /// Cap on instructions per translated sequence.
    pub max_seq_insts: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cpu: String::new(),
            mattrs: Vec::new(),
            enable_fpr: true,
            block: BlockConfig::default(),
            max_seq_insts: 128,
        }
    }
}

/// A cached callback reference inside a sequence's matcher set.
enum CachedCbk {
    /// Registered engine rule, resolved at fire time so deletions take
    /// effect even on still-cached code.
    Rule(u32),
    /// Callback produced by a dynamic rule expansion for this site.
    Inline(InstCallback),
}

struct InstMeta {
    inst: DecodedInst,
    pre: Vec<CachedCbk>,
    post: Vec<CachedCbk>,
}

/// Per-sequence metadata attached to the code cache. Regenerable: it is
/// dropped and rebuilt whenever the owning block is invalidated.
pub(crate) struct SeqMeta {
    insts: Vec<InstMeta>,
}

enum RulePayload {
    Callback(InstCallback),
    /// Forces breaks so the engine can record memory accesses.
    Recorder,
    Dynamic {
        cbk: InstrRuleCallback,
        analysis: u32,
    },
}

struct EngineRule {
    id: u32,
    rule: InstrRule,
    payload: RulePayload,
}

struct EventRule {
    id: u32,
    mask: u32,
    cbk: VmCallback,
}

/// The top-level orchestrator: owns the code cache, the rule tables and
/// the guest state; translates on miss and dispatches ExecBlocks.
pub struct Engine {
    backend: Rc<dyn MachineBackend>,
    manager: ExecBlockManager<SeqMeta>,
    bridge: Option<TransferBridge>,
    rules: Vec<EngineRule>,
    event_rules: Vec<EventRule>,
    next_id: u32,
    instrumented: RangeSet<u64>,
    gpr: GprState,
    fpr: FprState,
    /// Sequence-scoped access ring, cleared on sequence entry.
    bb_accesses: Vec<MemoryAccess>,
    /// Directions currently recorded (bit 0 read, bit 1 write).
    record_mask: u8,
    untranslatable: FxHashSet<u64>,
    /// Decoded instructions of cached code, for analysis queries.
    analysis_cache: FxHashMap<u64, DecodedInst>,
    /// Block/sequence most recently dispatched.
    cur: Option<(u32, u16)>,
    config: EngineConfig,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Self {
        let codec = X86Codec::new(config.cpu.clone(), config.mattrs.clone());
        let backend: Rc<dyn MachineBackend> =
            Rc::new(X86Backend::new(codec, config.enable_fpr));
        let manager = ExecBlockManager::new(Rc::clone(&backend), config.block);
        Self {
            backend,
            manager,
            bridge: None,
            rules: Vec::new(),
            event_rules: Vec::new(),
            next_id: 0,
            instrumented: RangeSet::new(),
            gpr: GprState::new(),
            fpr: FprState::new(),
            bb_accesses: Vec::new(),
            record_mask: 0,
            untranslatable: FxHashSet::default(),
            analysis_cache: FxHashMap::default(),
            cur: None,
            config,
        }
    }

    // ------------------------------------------------------------------
    // Guest state
    // ------------------------------------------------------------------

    pub fn gpr(&self) -> &GprState {
        &self.gpr
    }

    pub fn gpr_mut(&mut self) -> &mut GprState {
        &mut self.gpr
    }

    pub fn fpr(&self) -> &FprState {
        &self.fpr
    }

    pub fn fpr_mut(&mut self) -> &mut FprState {
        &mut self.fpr
    }

    pub fn set_gpr(&mut self, gpr: &GprState) {
        self.gpr = *gpr;
    }

    pub fn set_fpr(&mut self, fpr: &FprState) {
        self.fpr = *fpr;
    }

    // ------------------------------------------------------------------
    // Instrumented ranges
    // ------------------------------------------------------------------

    pub fn add_instrumented_range(&mut self, start: u64, end: u64) {
        self.instrumented.add(Range::new(start, end));
    }

    pub fn remove_instrumented_range(&mut self, start: u64, end: u64) {
        let range = Range::new(start, end);
        self.instrumented.remove(range);
        self.manager.clear_range(range);
    }

    pub fn remove_all_instrumented_ranges(&mut self) {
        self.instrumented.clear();
        self.clear_all_cache();
    }

    pub fn instrumented_ranges(&self) -> &RangeSet<u64> {
        &self.instrumented
    }

    // ------------------------------------------------------------------
    // Rule registration
    // ------------------------------------------------------------------

    fn alloc_id(&mut self) -> Option<u32> {
        let id = self.next_id;
        if id >= VIRTUAL_ID_MASK {
            return None;
        }
        self.next_id += 1;
        Some(id)
    }

    fn flush_rule_range(&mut self, range: &RangeSet<u64>) {
        if range.is_empty() {
            self.manager.clear_all();
            self.analysis_cache.clear();
        } else {
            for r in range.ranges() {
                self.manager.clear_range(*r);
            }
        }
    }

    fn add_rule_payload(&mut self, rule: InstrRule, payload: RulePayload) -> u32 {
        let Some(id) = self.alloc_id() else {
            return INVALID_EVENT_ID;
        };
        self.flush_rule_range(&rule.range.clone());
        self.rules.push(EngineRule { id, rule, payload });
        debug!(id, "instrumentation rule added");
        id
    }

    /// Register a callback rule. Adding a rule invalidates cached code
    /// in its range.
    pub fn add_instr_rule(&mut self, rule: InstrRule, cbk: InstCallback) -> u32 {
        self.add_rule_payload(rule, RulePayload::Callback(cbk))
    }

    /// Register a dynamic rule, expanded per matching instruction at
    /// translation time.
    pub fn add_dynamic_rule(
        &mut self,
        range: RangeSet<u64>,
        analysis: u32,
        cbk: InstrRuleCallback,
    ) -> u32 {
        let rule = InstrRule::callback_rule(PatchCondition::True, InstPosition::PreInst)
            .with_range(range);
        // The breaks are decided by the expansion, not the carrier rule.
        let rule = InstrRule {
            break_to_host: false,
            ..rule
        };
        self.add_rule_payload(rule, RulePayload::Dynamic { cbk, analysis })
    }

    pub fn add_vm_event_cb(&mut self, mask: u32, cbk: VmCallback) -> u32 {
        if mask == 0 {
            return INVALID_EVENT_ID;
        }
        let Some(id) = self.alloc_id() else {
            return INVALID_EVENT_ID;
        };
        self.event_rules.push(EventRule { id, mask, cbk });
        id
    }

    /// Enable access recording for a direction by installing the shadow
    /// rules that force a break at every matching instruction.
    pub fn record_memory_access(&mut self, kind: MemoryAccessType) -> bool {
        if kind.reads() && self.record_mask & 1 == 0 {
            self.record_mask |= 1;
            self.add_rule_payload(
                InstrRule::callback_rule(PatchCondition::DoesReadAccess, InstPosition::PreInst),
                RulePayload::Recorder,
            );
        }
        if kind.writes() && self.record_mask & 2 == 0 {
            self.record_mask |= 2;
            self.add_rule_payload(
                InstrRule::callback_rule(PatchCondition::DoesWriteAccess, InstPosition::PostInst),
                RulePayload::Recorder,
            );
        }
        true
    }

    /// Remove one registration by id. Cached code overlapping the
    /// rule's range is invalidated so the removal takes effect.
    pub fn delete_instrumentation(&mut self, id: u32) -> bool {
        if let Some(at) = self.rules.iter().position(|r| r.id == id) {
            let rule = self.rules.remove(at);
            self.flush_rule_range(&rule.rule.range);
            debug!(id, "instrumentation rule deleted");
            return true;
        }
        if let Some(at) = self.event_rules.iter().position(|r| r.id == id) {
            self.event_rules.remove(at);
            return true;
        }
        false
    }

    pub fn delete_all_instrumentations(&mut self) {
        self.rules.clear();
        self.event_rules.clear();
        self.record_mask = 0;
        self.clear_all_cache();
    }

    // ------------------------------------------------------------------
    // Cache control
    // ------------------------------------------------------------------

    pub fn clear_all_cache(&mut self) {
        self.manager.clear_all();
        self.analysis_cache.clear();
        self.untranslatable.clear();
    }

    pub fn clear_cache(&mut self, start: u64, end: u64) {
        let range = Range::new(start, end);
        self.manager.clear_range(range);
        self.analysis_cache.retain(|pc, _| !range.contains(*pc));
        self.untranslatable.retain(|pc| !range.contains(*pc));
    }

    /// Translate (if needed) the sequence starting at `pc`.
    pub fn precache_basic_block(&mut self, pc: u64) -> bool {
        self.instrumented.contains(pc) && self.resolve(pc).is_ok()
    }

    /// The ExecBlock most recently dispatched.
    pub fn cur_exec_block(&self) -> Option<&weft_exec::ExecBlock> {
        self.cur.and_then(|(block_id, _)| self.manager.block(block_id))
    }

    /// Map a host address inside the code cache back to the guest PC of
    /// the covering patch (postmortem signal reporting).
    pub fn host_to_guest(&self, host_addr: u64) -> Option<u64> {
        self.manager.host_to_guest(host_addr)
    }

    /// Analysis of a cached instruction.
    pub fn get_inst_analysis(&self, pc: u64, analysis_mask: u32) -> Option<InstAnalysis> {
        let inst = self.analysis_cache.get(&pc)?;
        let maps = if analysis_mask & crate::analysis::ANALYSIS_SYMBOL != 0 {
            crate::maps::current_process_maps(false).ok()
        } else {
            None
        };
        Some(analyze(
            self.backend.codec(),
            inst,
            analysis_mask,
            maps.as_deref(),
        ))
    }

    // ------------------------------------------------------------------
    // Translation
    // ------------------------------------------------------------------

    fn resolve(&mut self, pc: u64) -> Result<(u32, u16)> {
        if let Some(key) = self.manager.lookup(pc) {
            return Ok(key);
        }
        self.translate(pc)
    }

    fn translate(&mut self, pc: u64) -> Result<(u32, u16)> {
        if self.untranslatable.contains(&pc) {
            return Err(Error::Translation {
                pc,
                reason: "previously failed".into(),
            });
        }
        let region = *self.instrumented.find(pc).ok_or(Error::InvalidArgument(
            "translation requested outside the instrumented ranges",
        ))?;

        let capacity = self.manager.seq_capacity();
        // Room kept for the synthetic fallthrough exit.
        let exit_reserve = 64;

        let mut patches = Vec::new();
        let mut metas: Vec<InstMeta> = Vec::new();
        let mut cursor = pc;
        let mut bytes_used = 0usize;
        let mut fallthrough = None;

        loop {
            if cursor >= region.end || patches.len() >= self.config.max_seq_insts {
                fallthrough = Some(cursor);
                break;
            }
            let window = (region.end - cursor).min(16) as usize;
            // SAFETY: the caller configured [cursor, region.end) as an
            // instrumented (readable) code range.
            let code = unsafe { std::slice::from_raw_parts(cursor as *const u8, window) };
            let inst = match self.backend.decode(code, cursor) {
                Ok(inst) => inst,
                Err(err) => {
                    if patches.is_empty() {
                        warn!(pc = cursor, %err, "untranslatable instruction");
                        self.untranslatable.insert(cursor);
                        self.fire_vm_event(
                            EVENT_TRANSLATION_ERROR,
                            VmState {
                                event: EVENT_TRANSLATION_ERROR,
                                basic_block_start: cursor,
                                basic_block_end: cursor,
                                sequence_start: cursor,
                                sequence_end: cursor,
                            },
                        );
                        return Err(Error::Translation {
                            pc: cursor,
                            reason: err.to_string(),
                        });
                    }
                    // Stop the sequence before the undecodable bytes;
                    // reaching them at run time reports the error there.
                    fallthrough = Some(cursor);
                    break;
                }
            };

            let inst_id = patches.len() as u16;
            let mut patch = self
                .backend
                .make_patch(&inst, inst_id)
                .map_err(|e| Error::Translation {
                    pc: cursor,
                    reason: e.to_string(),
                })?;

            // Syscalls always break on both sides so the VM events fire
            // with the guest state materialised.
            if inst.opid == OP_SYSCALL {
                patch
                    .add_event_break(InstPosition::PreInst)
                    .and_then(|_| patch.add_event_break(InstPosition::PostInst))
                    .map_err(|e| Error::Translation {
                        pc: cursor,
                        reason: e.to_string(),
                    })?;
            }

            let mut pre = Vec::new();
            let mut post = Vec::new();
            for er in &self.rules {
                if !er.rule.matches(&inst) {
                    continue;
                }
                match &er.payload {
                    RulePayload::Callback(_) => {
                        er.rule.instrument(&mut patch).map_err(|e| Error::Translation {
                            pc: cursor,
                            reason: e.to_string(),
                        })?;
                        match er.rule.position {
                            InstPosition::PreInst => pre.push(CachedCbk::Rule(er.id)),
                            InstPosition::PostInst => post.push(CachedCbk::Rule(er.id)),
                        }
                    }
                    RulePayload::Recorder => {
                        er.rule.instrument(&mut patch).map_err(|e| Error::Translation {
                            pc: cursor,
                            reason: e.to_string(),
                        })?;
                    }
                    RulePayload::Dynamic { cbk, analysis } => {
                        let a = analyze(self.backend.codec(), &inst, *analysis, None);
                        for item in cbk(&a) {
                            patch.add_event_break(item.position).map_err(|e| {
                                Error::Translation {
                                    pc: cursor,
                                    reason: e.to_string(),
                                }
                            })?;
                            match item.position {
                                InstPosition::PreInst => {
                                    pre.push(CachedCbk::Inline(item.callback));
                                }
                                InstPosition::PostInst => {
                                    post.push(CachedCbk::Inline(item.callback));
                                }
                            }
                        }
                    }
                }
            }

            let patch_len = patch.encoded_len();
            if bytes_used + patch_len + exit_reserve > capacity {
                if patches.is_empty() {
                    return Err(Error::Translation {
                        pc: cursor,
                        reason: "instrumented instruction exceeds block capacity".into(),
                    });
                }
                fallthrough = Some(cursor);
                break;
            }
            bytes_used += patch_len;

            let ends = patch.ends_block;
            self.analysis_cache.insert(cursor, inst.clone());
            metas.push(InstMeta { inst, pre, post });
            cursor += patch.guest_len() as u64;
            patches.push(patch);
            if ends {
                break;
            }
        }

        let end_pc = cursor;
        trace!(
            start = pc,
            end = end_pc,
            insts = patches.len(),
            bytes = bytes_used,
            split = fallthrough.is_some(),
            "sequence translated"
        );
        let key = self
            .manager
            .write_sequence(&patches, fallthrough, SeqMeta { insts: metas })?;

        self.fire_vm_event(
            EVENT_BASIC_BLOCK_NEW,
            VmState {
                event: EVENT_BASIC_BLOCK_NEW,
                basic_block_start: pc,
                basic_block_end: end_pc,
                sequence_start: pc,
                sequence_end: end_pc,
            },
        );
        Ok(key)
    }

    // ------------------------------------------------------------------
    // Dispatch
    // ------------------------------------------------------------------

    /// Run instrumented from `start` until `stop` is reached, a
    /// callback returns `Stop`, or an error surfaces.
    pub fn run(&mut self, start: u64, stop: u64) -> Result<()> {
        self.gpr.rip = start;

        'dispatch: loop {
            let pc = self.gpr.rip;
            if pc == stop {
                return Ok(());
            }
            if !self.instrumented.contains(pc) {
                match self.transfer_call(pc)? {
                    VmAction::Stop => return Ok(()),
                    _ => continue 'dispatch,
                }
            }

            let (block_id, seq_id) = self.resolve(pc)?;
            self.cur = Some((block_id, seq_id));
            let (seq_start, seq_end) = {
                let block = self.manager.block(block_id).ok_or(Error::InvalidArgument(
                    "cached block vanished during dispatch",
                ))?;
                let seq = block.sequence(seq_id).ok_or(Error::InvalidArgument(
                    "cached sequence vanished during dispatch",
                ))?;
                (seq.start_pc, seq.end_pc)
            };

            self.bb_accesses.clear();
            let entry_state = VmState {
                event: EVENT_BASIC_BLOCK_ENTRY | EVENT_SEQUENCE_ENTRY,
                basic_block_start: seq_start,
                basic_block_end: seq_end,
                sequence_start: seq_start,
                sequence_end: seq_end,
            };
            if self.fire_vm_event(entry_state.event, entry_state) == VmAction::Stop {
                return Ok(());
            }

            let mut resume = false;
            loop {
                let origin = {
                    let gpr = self.gpr;
                    let fpr = self.fpr;
                    let block = self.manager.block_mut(block_id).ok_or(
                        Error::InvalidArgument("cached block vanished during dispatch"),
                    )?;
                    if !resume {
                        block.select_sequence(seq_id);
                    }
                    let ctx = block.context_mut();
                    ctx.gpr = gpr;
                    ctx.fpr = fpr;
                    // SAFETY: the block holds code this engine
                    // translated, entered with the guest state the
                    // patches were generated against.
                    let origin = unsafe { block.execute()? };
                    let ctx = block.context();
                    self.gpr = ctx.gpr;
                    self.fpr = ctx.fpr;
                    origin
                };

                let Some((cause, inst_id)) = unpack_origin(origin) else {
                    return Err(Error::CorruptOrigin { origin });
                };

                match cause {
                    ExitCause::Terminator => {
                        let exit_state = VmState {
                            event: EVENT_BASIC_BLOCK_EXIT | EVENT_SEQUENCE_EXIT,
                            ..entry_state
                        };
                        if self.fire_vm_event(exit_state.event, exit_state) == VmAction::Stop {
                            return Ok(());
                        }
                        continue 'dispatch;
                    }
                    ExitCause::PreInst | ExitCause::PostInst => {
                        let action =
                            self.fire_inst_callbacks(block_id, seq_id, inst_id, cause)?;
                        match action {
                            VmAction::Stop => return Ok(()),
                            VmAction::BreakToVm => continue 'dispatch,
                            VmAction::Continue => {
                                // The patch left the selector at its
                                // resume point.
                                resume = true;
                            }
                        }
                    }
                    ExitCause::TransferReturn => {
                        return Err(Error::CorruptOrigin { origin });
                    }
                }
            }
        }
    }

    fn fire_inst_callbacks(
        &mut self,
        block_id: u32,
        seq_id: u16,
        inst_id: u16,
        cause: ExitCause,
    ) -> Result<VmAction> {
        let pre = cause == ExitCause::PreInst;

        // Pull what we need out of the cached metadata first; the
        // callback invocation needs disjoint borrows of the guest state.
        let (inst, cbks) = {
            let meta = self
                .manager
                .meta(block_id, seq_id)
                .and_then(|m| m.insts.get(inst_id as usize))
                .ok_or(Error::InvalidArgument("event for an unknown instruction"))?;
            let list = if pre { &meta.pre } else { &meta.post };
            let mut cbks: Vec<InstCallback> = Vec::with_capacity(list.len());
            for c in list {
                match c {
                    CachedCbk::Rule(id) => {
                        // Deleted rules are skipped lazily.
                        if let Some(er) = self.rules.iter().find(|r| r.id == *id) {
                            if let RulePayload::Callback(cb) = &er.payload {
                                cbks.push(Rc::clone(cb));
                            }
                        }
                    }
                    CachedCbk::Inline(cb) => cbks.push(Rc::clone(cb)),
                }
            }
            (meta.inst.clone(), cbks)
        };

        // Record this instruction's accesses into the sequence ring at
        // the position the shadow rules break at.
        if (pre && self.record_mask & 1 != 0 && inst.reads_memory())
            || (!pre && self.record_mask & 2 != 0 && inst.writes_memory())
        {
            // SAFETY: the guest state was captured at this instruction's
            // boundary; the addresses are the ones it accesses.
            let recorded = unsafe { extract_accesses(&inst, &self.gpr, pre) };
            self.bb_accesses.extend(
                recorded
                    .into_iter()
                    .filter(|a| if pre { a.kind.reads() } else { a.kind.writes() }),
            );
        }

        let mut action = VmAction::Continue;

        // Syscall boundaries surface as VM events.
        if inst.opid == OP_SYSCALL {
            let bit = if pre { EVENT_SYSCALL_ENTRY } else { EVENT_SYSCALL_EXIT };
            let state = VmState {
                event: bit,
                basic_block_start: inst.address,
                basic_block_end: inst.next_address(),
                sequence_start: inst.address,
                sequence_end: inst.next_address(),
            };
            action = action.merge(self.fire_vm_event(bit, state));
        }

        if cbks.is_empty() {
            return Ok(action);
        }

        let analysis = analyze(
            self.backend.codec(),
            &inst,
            crate::analysis::ANALYSIS_INSTRUCTION
                | crate::analysis::ANALYSIS_DISASSEMBLY
                | crate::analysis::ANALYSIS_OPERANDS,
            None,
        );
        // SAFETY: as for the recording above.
        let inst_accesses = unsafe { extract_accesses(&inst, &self.gpr, pre) };

        for cb in cbks {
            let mut ctx = CallbackCtx::new(
                &mut self.gpr,
                &mut self.fpr,
                Some(&analysis),
                &inst_accesses,
                &self.bb_accesses,
            );
            action = action.merge(cb(&mut ctx));
        }
        Ok(action)
    }

    fn fire_vm_event(&mut self, bits: u32, state: VmState) -> VmAction {
        let cbks: Vec<VmCallback> = self
            .event_rules
            .iter()
            .filter(|e| e.mask & bits != 0)
            .map(|e| Rc::clone(&e.cbk))
            .collect();
        let mut action = VmAction::Continue;
        for cb in cbks {
            let mut ctx = CallbackCtx::new(&mut self.gpr, &mut self.fpr, None, &[], &[]);
            action = action.merge(cb(&state, &mut ctx));
        }
        action
    }

    // ------------------------------------------------------------------
    // Exec transfer
    // ------------------------------------------------------------------

    /// Run non-instrumented code natively: repoint the guest return
    /// address at the bridge landing, jump to the target with the full
    /// guest context, and capture the state when the callee returns.
    fn transfer_call(&mut self, target: u64) -> Result<VmAction> {
        debug!(target, "exec transfer");
        if self.bridge.is_none() {
            self.bridge = Some(TransferBridge::new(self.manager.backend().as_ref())?);
        }

        let mut action = self.fire_vm_event(
            EVENT_EXEC_TRANSFER_CALL,
            VmState {
                event: EVENT_EXEC_TRANSFER_CALL,
                basic_block_start: target,
                basic_block_end: target,
                sequence_start: target,
                sequence_end: target,
            },
        );
        if action == VmAction::Stop {
            return Ok(action);
        }

        let landing = self
            .bridge
            .as_ref()
            .map(TransferBridge::landing_addr)
            .unwrap_or(0);

        // SAFETY: the guest rsp points at the return address the
        // translated call just pushed; we swap it for the landing pad
        // and restore the original once the callee comes back.
        let saved_ret = unsafe {
            let slot = self.gpr.rsp as *mut u64;
            let saved = slot.read();
            slot.write(landing);
            saved
        };

        let bridge = self.bridge.as_mut().expect("bridge initialised above");
        {
            let ctx = bridge.context_mut();
            ctx.gpr = self.gpr;
            ctx.fpr = self.fpr;
        }
        bridge.arm(target);
        // SAFETY: [rsp] now holds the landing address; the bridge stub
        // jumps to `target` with the guest context loaded.
        let origin = unsafe { bridge.execute()? };
        {
            let ctx = bridge.context();
            self.gpr = ctx.gpr;
            self.fpr = ctx.fpr;
        }
        match unpack_origin(origin) {
            Some((ExitCause::TransferReturn, _)) => {}
            _ => return Err(Error::CorruptOrigin { origin }),
        }
        self.gpr.rip = saved_ret;

        action = action.merge(self.fire_vm_event(
            EVENT_EXEC_TRANSFER_RETURN,
            VmState {
                event: EVENT_EXEC_TRANSFER_RETURN,
                basic_block_start: target,
                basic_block_end: target,
                sequence_start: target,
                sequence_end: target,
            },
        ));
        Ok(action)
    }

    // ------------------------------------------------------------------
    // Snapshot
    // ------------------------------------------------------------------

    /// Duplicate the rule tables and guest state into a fresh engine.
    /// The code cache is not cloned; the copy re-translates lazily.
    pub fn snapshot(&self) -> Result<Engine> {
        let mut copy = Engine::new(self.config.clone());
        copy.next_id = self.next_id;
        copy.instrumented = self.instrumented.clone();
        copy.gpr = self.gpr;
        copy.fpr = self.fpr;
        copy.record_mask = self.record_mask;
        for er in &self.rules {
            copy.rules.push(EngineRule {
                id: er.id,
                rule: er.rule.clone(),
                payload: match &er.payload {
                    RulePayload::Callback(cb) => RulePayload::Callback(Rc::clone(cb)),
                    RulePayload::Recorder => RulePayload::Recorder,
                    RulePayload::Dynamic { cbk, analysis } => RulePayload::Dynamic {
                        cbk: Rc::clone(cbk),
                        analysis: *analysis,
                    },
                },
            });
        }
        for ev in &self.event_rules {
            copy.event_rules.push(EventRule {
                id: ev.id,
                mask: ev.mask,
                cbk: Rc::clone(&ev.cbk),
            });
        }
        Ok(copy)
    }
}

