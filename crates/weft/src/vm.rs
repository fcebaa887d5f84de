//! The user-facing VM surface.
//!
//! Wraps the engine with the registration API: code callbacks by
//! position, address, range or mnemonic; memory-access callbacks,
//! including the range-filtered kind dispatched through the singleton
//! read/write gates; VM events; dynamic rules; and the call helper.
//!
//! Identifier space: engine rules use plain ids; memory-range registry
//! entries are tagged with the MSB (`VIRTUAL_ID_MASK`). A gate exists
//! iff at least one registry entry requires it.

use std::cell::RefCell;
use std::rc::Rc;

use tracing::debug;

use weft_patch::{InstPosition, InstrRule, PatchCondition};
use weft_range::{Range, RangeSet};
use weft_state::{FprState, GprState};

use crate::action::{
    InstCallback, InstrRuleCallback, MemoryAccessType, VmAction, VmCallback, INVALID_EVENT_ID,
    VIRTUAL_ID_MASK,
};
use crate::analysis::InstAnalysis;
use crate::engine::{Engine, EngineConfig};
use crate::error::{Error, Result};
use crate::maps::{current_process_maps, MemoryMap};

/// Return-address sentinel used by `call`.
const FAKE_RET_ADDR: u64 = 0x2a;

struct MemCbEntry {
    kind: MemoryAccessType,
    range: Range<u64>,
    cbk: InstCallback,
}

type MemCbList = Rc<RefCell<Vec<(u32, MemCbEntry)>>>;

/// A weft virtual machine: one engine plus the user registration state.
pub struct Vm {
    engine: Engine,
    mem_cbs: MemCbList,
    mem_cb_id: u32,
    read_gate: u32,
    write_gate: u32,
}

impl Vm {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            engine: Engine::new(config),
            mem_cbs: Rc::new(RefCell::new(Vec::new())),
            mem_cb_id: 0,
            read_gate: INVALID_EVENT_ID,
            write_gate: INVALID_EVENT_ID,
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(EngineConfig::default())
    }

    // ------------------------------------------------------------------
    // Guest state
    // ------------------------------------------------------------------

    pub fn gpr_state(&self) -> &GprState {
        self.engine.gpr()
    }

    pub fn gpr_state_mut(&mut self) -> &mut GprState {
        self.engine.gpr_mut()
    }

    pub fn set_gpr_state(&mut self, gpr: &GprState) {
        self.engine.set_gpr(gpr);
    }

    pub fn fpr_state(&self) -> &FprState {
        self.engine.fpr()
    }

    pub fn fpr_state_mut(&mut self) -> &mut FprState {
        self.engine.fpr_mut()
    }

    pub fn set_fpr_state(&mut self, fpr: &FprState) {
        self.engine.set_fpr(fpr);
    }

    // ------------------------------------------------------------------
    // Instrumented ranges
    // ------------------------------------------------------------------

    pub fn add_instrumented_range(&mut self, start: u64, end: u64) -> Result<()> {
        if start >= end {
            return Err(Error::InvalidArgument("empty or inverted range"));
        }
        self.engine.add_instrumented_range(start, end);
        Ok(())
    }

    pub fn remove_instrumented_range(&mut self, start: u64, end: u64) {
        self.engine.remove_instrumented_range(start, end);
    }

    pub fn remove_all_instrumented_ranges(&mut self) {
        self.engine.remove_all_instrumented_ranges();
    }

    /// Instrument every executable mapping of the process.
    pub fn instrument_all_executable_maps(&mut self) -> Result<bool> {
        let maps = current_process_maps(false)?;
        let mut any = false;
        for m in maps.iter().filter(|m| m.is_executable() && m.is_readable()) {
            self.engine.add_instrumented_range(m.range.start, m.range.end);
            any = true;
        }
        Ok(any)
    }

    /// Instrument the executable mappings of one module.
    pub fn add_instrumented_module(&mut self, name: &str) -> Result<bool> {
        let maps = current_process_maps(false)?;
        Ok(self.apply_module_maps(&maps, name, true))
    }

    /// Instrument the module containing `addr`.
    pub fn add_instrumented_module_from_addr(&mut self, addr: u64) -> Result<bool> {
        let maps = current_process_maps(false)?;
        let Some(name) = maps
            .iter()
            .find(|m| m.range.contains(addr))
            .map(|m| m.name.clone())
        else {
            return Ok(false);
        };
        Ok(self.apply_module_maps(&maps, &name, true))
    }

    pub fn remove_instrumented_module(&mut self, name: &str) -> Result<bool> {
        let maps = current_process_maps(false)?;
        Ok(self.apply_module_maps(&maps, name, false))
    }

    pub fn remove_instrumented_module_from_addr(&mut self, addr: u64) -> Result<bool> {
        let maps = current_process_maps(false)?;
        let Some(name) = maps
            .iter()
            .find(|m| m.range.contains(addr))
            .map(|m| m.name.clone())
        else {
            return Ok(false);
        };
        Ok(self.apply_module_maps(&maps, &name, false))
    }

    fn apply_module_maps(&mut self, maps: &[MemoryMap], name: &str, add: bool) -> bool {
        let mut any = false;
        for m in maps.iter().filter(|m| m.is_executable() && m.name == name) {
            if add {
                self.engine.add_instrumented_range(m.range.start, m.range.end);
            } else {
                self.engine.remove_instrumented_range(m.range.start, m.range.end);
            }
            any = true;
        }
        any
    }

    // ------------------------------------------------------------------
    // Execution
    // ------------------------------------------------------------------

    /// Run instrumented from `start` until `stop`.
    ///
    /// A one-shot pre-instruction rule at `stop` turns the stop address
    /// into a `Stop` disposition; the engine also stops if dispatch
    /// reaches `stop` outside the instrumented ranges.
    pub fn run(&mut self, start: u64, stop: u64) -> Result<()> {
        let mut stop_range = RangeSet::new();
        stop_range.add(Range::new(stop, stop.wrapping_add(1)));
        let stop_cb = self.engine.add_instr_rule(
            InstrRule::callback_rule(PatchCondition::AddressIs(stop), InstPosition::PreInst)
                .with_range(stop_range),
            Rc::new(|_| VmAction::Stop),
        );
        let result = self.engine.run(start, stop);
        self.engine.delete_instrumentation(stop_cb);
        result
    }

    /// Call `function` under instrumentation with the System V integer
    /// argument convention, using the guest stack configured in the
    /// GPR state. Returns the guest's rax.
    pub fn call(&mut self, function: u64, args: &[u64]) -> Result<u64> {
        let gpr = self.engine.gpr_mut();
        if gpr.rsp == 0 {
            return Err(Error::InvalidArgument("no guest stack pointer set"));
        }

        let reg_args = [
            &mut gpr.rdi,
            &mut gpr.rsi,
            &mut gpr.rdx,
            &mut gpr.rcx,
            &mut gpr.r8,
            &mut gpr.r9,
        ];
        for (slot, value) in reg_args.into_iter().zip(args.iter()) {
            *slot = *value;
        }

        let stack_args = args.get(6..).unwrap_or(&[]);
        let mut rsp = gpr.rsp & !0xf;
        // Keep the ABI alignment contract: rsp % 16 == 8 at entry,
        // after the return address is pushed.
        if stack_args.len() % 2 == 1 {
            rsp = rsp.wrapping_sub(8);
        }
        // SAFETY: the caller configured rsp inside a writable guest
        // stack with room for the arguments.
        unsafe {
            for value in stack_args.iter().rev() {
                rsp = rsp.wrapping_sub(8);
                (rsp as *mut u64).write(*value);
            }
            rsp = rsp.wrapping_sub(8);
            (rsp as *mut u64).write(FAKE_RET_ADDR);
        }
        gpr.rsp = rsp;

        self.run(function, FAKE_RET_ADDR)?;
        Ok(self.engine.gpr().rax)
    }

    // ------------------------------------------------------------------
    // Instruction callbacks
    // ------------------------------------------------------------------

    /// Callback on every instrumented instruction.
    pub fn add_code_cb(&mut self, position: InstPosition, cbk: InstCallback) -> u32 {
        self.engine
            .add_instr_rule(InstrRule::callback_rule(PatchCondition::True, position), cbk)
    }

    /// Callback on the instruction at `address`.
    pub fn add_code_addr_cb(
        &mut self,
        address: u64,
        position: InstPosition,
        cbk: InstCallback,
    ) -> u32 {
        let mut range = RangeSet::new();
        range.add(Range::new(address, address.wrapping_add(1)));
        self.engine.add_instr_rule(
            InstrRule::callback_rule(PatchCondition::AddressIs(address), position)
                .with_range(range),
            cbk,
        )
    }

    /// Callback on instructions within `[start, end)`.
    pub fn add_code_range_cb(
        &mut self,
        start: u64,
        end: u64,
        position: InstPosition,
        cbk: InstCallback,
    ) -> u32 {
        if start >= end {
            return INVALID_EVENT_ID;
        }
        let mut range = RangeSet::new();
        range.add(Range::new(start, end));
        self.engine.add_instr_rule(
            InstrRule::callback_rule(
                PatchCondition::InstructionInRange(Range::new(start, end)),
                position,
            )
            .with_range(range),
            cbk,
        )
    }

    /// Callback on instructions whose mnemonic matches (case
    /// insensitive, trailing `*` wildcard).
    pub fn add_mnemonic_cb(
        &mut self,
        mnemonic: &str,
        position: InstPosition,
        cbk: InstCallback,
    ) -> u32 {
        if mnemonic.is_empty() {
            return INVALID_EVENT_ID;
        }
        self.engine.add_instr_rule(
            InstrRule::callback_rule(PatchCondition::MnemonicIs(mnemonic.to_string()), position),
            cbk,
        )
    }

    // ------------------------------------------------------------------
    // Memory callbacks
    // ------------------------------------------------------------------

    /// Enable memory-access recording for a direction; idempotent.
    pub fn record_memory_access(&mut self, kind: MemoryAccessType) -> bool {
        self.engine.record_memory_access(kind)
    }

    /// Callback on every instruction performing the given access kind.
    pub fn add_mem_access_cb(&mut self, kind: MemoryAccessType, cbk: InstCallback) -> u32 {
        self.record_memory_access(kind);
        let rule = match kind {
            MemoryAccessType::Read => {
                InstrRule::callback_rule(PatchCondition::DoesReadAccess, InstPosition::PreInst)
            }
            MemoryAccessType::Write => {
                InstrRule::callback_rule(PatchCondition::DoesWriteAccess, InstPosition::PostInst)
            }
            MemoryAccessType::ReadWrite => InstrRule::callback_rule(
                PatchCondition::Or(vec![
                    PatchCondition::DoesReadAccess,
                    PatchCondition::DoesWriteAccess,
                ]),
                InstPosition::PostInst,
            ),
        };
        self.engine.add_instr_rule(rule, cbk)
    }

    /// Range-filtered memory callback on a single address.
    pub fn add_mem_addr_cb(
        &mut self,
        address: u64,
        kind: MemoryAccessType,
        cbk: InstCallback,
    ) -> u32 {
        self.add_mem_range_cb(address, address.wrapping_add(1), kind, cbk)
    }

    /// Range-filtered memory callback: fires on instructions whose
    /// accesses of the requested kind overlap `[start, end)`. Dispatch
    /// goes through the singleton read/write gates.
    pub fn add_mem_range_cb(
        &mut self,
        start: u64,
        end: u64,
        kind: MemoryAccessType,
        cbk: InstCallback,
    ) -> u32 {
        if start >= end {
            return INVALID_EVENT_ID;
        }
        if kind == MemoryAccessType::Read && self.read_gate == INVALID_EVENT_ID {
            self.read_gate = self.install_read_gate();
        }
        if kind.writes() && self.write_gate == INVALID_EVENT_ID {
            self.write_gate = self.install_write_gate();
        }

        let id = self.mem_cb_id;
        if id >= VIRTUAL_ID_MASK {
            return INVALID_EVENT_ID;
        }
        self.mem_cb_id += 1;
        self.mem_cbs.borrow_mut().push((
            id,
            MemCbEntry {
                kind,
                range: Range::new(start, end),
                cbk,
            },
        ));
        debug!(id, start, end, "memory range callback added");
        id | VIRTUAL_ID_MASK
    }

    fn install_read_gate(&mut self) -> u32 {
        let entries = Rc::clone(&self.mem_cbs);
        let gate: InstCallback = Rc::new(move |ctx| {
            let mut read_range = RangeSet::new();
            for a in ctx.inst_memory_access() {
                if a.kind.reads() {
                    read_range.add(Range::new(
                        a.access_address,
                        a.access_address.wrapping_add(a.size as u64),
                    ));
                }
            }
            let targets: Vec<InstCallback> = entries
                .borrow()
                .iter()
                .filter(|(_, e)| e.kind == MemoryAccessType::Read && read_range.overlaps(&e.range))
                .map(|(_, e)| Rc::clone(&e.cbk))
                .collect();
            let mut action = VmAction::Continue;
            for cb in targets {
                action = action.merge(cb(ctx));
            }
            action
        });
        self.add_mem_access_cb(MemoryAccessType::Read, gate)
    }

    fn install_write_gate(&mut self) -> u32 {
        let entries = Rc::clone(&self.mem_cbs);
        let gate: InstCallback = Rc::new(move |ctx| {
            let mut read_range = RangeSet::new();
            let mut write_range = RangeSet::new();
            for a in ctx.inst_memory_access() {
                let r = Range::new(a.access_address, a.access_address.wrapping_add(a.size as u64));
                if a.kind.reads() {
                    read_range.add(r);
                }
                if a.kind.writes() {
                    write_range.add(r);
                }
            }
            // Entries wanting writes fire on a write overlap; pure
            // read+write entries also fire on a read overlap (the
            // read-only case is the read gate's).
            let targets: Vec<InstCallback> = entries
                .borrow()
                .iter()
                .filter(|(_, e)| {
                    (e.kind.writes() && write_range.overlaps(&e.range))
                        || (e.kind == MemoryAccessType::ReadWrite
                            && read_range.overlaps(&e.range))
                })
                .map(|(_, e)| Rc::clone(&e.cbk))
                .collect();
            let mut action = VmAction::Continue;
            for cb in targets {
                action = action.merge(cb(ctx));
            }
            action
        });
        self.add_mem_access_cb(MemoryAccessType::ReadWrite, gate)
    }

    // ------------------------------------------------------------------
    // VM events and dynamic rules
    // ------------------------------------------------------------------

    pub fn add_vm_event_cb(&mut self, mask: u32, cbk: VmCallback) -> u32 {
        self.engine.add_vm_event_cb(mask, cbk)
    }

    /// Dynamic rule over every instrumented instruction.
    pub fn add_instr_rule(&mut self, analysis: u32, cbk: InstrRuleCallback) -> u32 {
        self.engine.add_dynamic_rule(RangeSet::new(), analysis, cbk)
    }

    /// Dynamic rule over `[start, end)`.
    pub fn add_instr_rule_range(
        &mut self,
        start: u64,
        end: u64,
        analysis: u32,
        cbk: InstrRuleCallback,
    ) -> u32 {
        if start >= end {
            return INVALID_EVENT_ID;
        }
        let mut range = RangeSet::new();
        range.add(Range::new(start, end));
        self.engine.add_dynamic_rule(range, analysis, cbk)
    }

    // ------------------------------------------------------------------
    // Deletion
    // ------------------------------------------------------------------

    /// Remove one registration. Virtual ids map to registry entries:
    /// one id, one entry, removed on first match.
    pub fn delete_instrumentation(&mut self, id: u32) -> bool {
        if id & VIRTUAL_ID_MASK != 0 {
            let id = id & !VIRTUAL_ID_MASK;
            let mut entries = self.mem_cbs.borrow_mut();
            if let Some(at) = entries.iter().position(|(eid, _)| *eid == id) {
                entries.remove(at);
                return true;
            }
            false
        } else {
            self.engine.delete_instrumentation(id)
        }
    }

    pub fn delete_all_instrumentations(&mut self) {
        self.engine.delete_all_instrumentations();
        self.mem_cbs.borrow_mut().clear();
        self.read_gate = INVALID_EVENT_ID;
        self.write_gate = INVALID_EVENT_ID;
    }

    // ------------------------------------------------------------------
    // Cache and analysis
    // ------------------------------------------------------------------

    pub fn precache_basic_block(&mut self, pc: u64) -> bool {
        self.engine.precache_basic_block(pc)
    }

    pub fn clear_all_cache(&mut self) {
        self.engine.clear_all_cache();
    }

    pub fn clear_cache(&mut self, start: u64, end: u64) {
        self.engine.clear_cache(start, end);
    }

    /// Analysis of a cached instruction.
    pub fn get_inst_analysis(&self, pc: u64, analysis_mask: u32) -> Option<InstAnalysis> {
        self.engine.get_inst_analysis(pc, analysis_mask)
    }

    /// Duplicate the registration state into a fresh VM with an empty
    /// code cache.
    pub fn snapshot(&self) -> Result<Vm> {
        let mut engine = self.engine.snapshot()?;
        // The copied gate rules capture the original registry; drop
        // them and re-install against the copy's own registry.
        if self.read_gate != INVALID_EVENT_ID {
            engine.delete_instrumentation(self.read_gate);
        }
        if self.write_gate != INVALID_EVENT_ID {
            engine.delete_instrumentation(self.write_gate);
        }
        let entries: Vec<(u32, MemCbEntry)> = self
            .mem_cbs
            .borrow()
            .iter()
            .map(|(id, e)| {
                (
                    *id,
                    MemCbEntry {
                        kind: e.kind,
                        range: e.range,
                        cbk: Rc::clone(&e.cbk),
                    },
                )
            })
            .collect();
        let mut vm = Vm {
            engine,
            mem_cbs: Rc::new(RefCell::new(entries)),
            mem_cb_id: self.mem_cb_id,
            read_gate: INVALID_EVENT_ID,
            write_gate: INVALID_EVENT_ID,
        };
        if self.read_gate != INVALID_EVENT_ID {
            vm.read_gate = vm.install_read_gate();
        }
        if self.write_gate != INVALID_EVENT_ID {
            vm.write_gate = vm.install_write_gate();
        }
        Ok(vm)
    }
}
