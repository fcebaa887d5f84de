//! Rule engine behavior: callback ordering, action aggregation, memory
//! callbacks and cache invalidation on rule changes.

mod support;

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use support::{vm_for, GuestCode, GuestStack};
use weft::{
    InstPosition, MemoryAccessType, VmAction, ANALYSIS_DISASSEMBLY, ANALYSIS_INSTRUCTION,
    EVENT_BASIC_BLOCK_ENTRY, EVENT_BASIC_BLOCK_EXIT, EVENT_BASIC_BLOCK_NEW, INVALID_EVENT_ID,
    InstrRuleDataCbk,
};

/// mov rbx, rax ; mov rcx, rbx ; xor rax, rax
fn shuffle_code() -> GuestCode {
    GuestCode::new(&[
        0x48, 0x89, 0xc3, 0x48, 0x89, 0xd9, 0x48, 0x31, 0xc0,
    ])
}

#[test]
fn counts_every_instruction() {
    let code = shuffle_code();
    let mut vm = vm_for(&code);

    let pre = Rc::new(Cell::new(0u64));
    let post = Rc::new(Cell::new(0u64));
    let p = Rc::clone(&pre);
    vm.add_code_cb(
        InstPosition::PreInst,
        Rc::new(move |_| {
            p.set(p.get() + 1);
            VmAction::Continue
        }),
    );
    let q = Rc::clone(&post);
    vm.add_code_cb(
        InstPosition::PostInst,
        Rc::new(move |_| {
            q.set(q.get() + 1);
            VmAction::Continue
        }),
    );

    vm.run(code.base(), code.end()).expect("run");
    assert_eq!(pre.get(), 3);
    assert_eq!(post.get(), 3);
}

#[test]
fn callbacks_fire_in_registration_order() {
    let code = shuffle_code();
    let mut vm = vm_for(&code);

    let trace: Rc<RefCell<Vec<u32>>> = Rc::new(RefCell::new(Vec::new()));
    for tag in [1u32, 2, 3] {
        let t = Rc::clone(&trace);
        vm.add_code_addr_cb(
            code.base(),
            InstPosition::PreInst,
            Rc::new(move |_| {
                t.borrow_mut().push(tag);
                VmAction::Continue
            }),
        );
    }

    vm.run(code.base(), code.end()).expect("run");
    assert_eq!(*trace.borrow(), vec![1, 2, 3]);
}

#[test]
fn pre_fires_before_post_around_original() {
    // Watch rbx around `mov rbx, rax`: the pre callback still sees the
    // old value, the post callback the new one.
    let code = shuffle_code();
    let mut vm = vm_for(&code);
    vm.gpr_state_mut().rax = 0x1111;
    vm.gpr_state_mut().rbx = 0x2222;

    let seen: Rc<RefCell<Vec<u64>>> = Rc::new(RefCell::new(Vec::new()));
    let s = Rc::clone(&seen);
    vm.add_code_addr_cb(
        code.base(),
        InstPosition::PreInst,
        Rc::new(move |ctx| {
            s.borrow_mut().push(ctx.gpr.rbx);
            VmAction::Continue
        }),
    );
    let s = Rc::clone(&seen);
    vm.add_code_addr_cb(
        code.base(),
        InstPosition::PostInst,
        Rc::new(move |ctx| {
            s.borrow_mut().push(ctx.gpr.rbx);
            VmAction::Continue
        }),
    );

    vm.run(code.base(), code.end()).expect("run");
    assert_eq!(*seen.borrow(), vec![0x2222, 0x1111]);
}

#[test]
fn vm_action_aggregation_keeps_most_severe() {
    let code = shuffle_code();
    let target = code.base() + 3;
    let mut vm = vm_for(&code);
    vm.gpr_state_mut().rax = 0x9999;

    let fired = Rc::new(Cell::new(0u32));
    for action in [VmAction::Continue, VmAction::Stop, VmAction::BreakToVm] {
        let f = Rc::clone(&fired);
        vm.add_code_addr_cb(
            target,
            InstPosition::PreInst,
            Rc::new(move |_| {
                f.set(f.get() + 1);
                action
            }),
        );
    }

    vm.run(code.base(), code.end()).expect("run");
    // All three ran, and Stop won: execution halted at the target.
    assert_eq!(fired.get(), 3);
    assert_eq!(vm.gpr_state().rip, target);
    // The first instruction executed, the second did not.
    assert_eq!(vm.gpr_state().rbx, 0x9999);
    assert_eq!(vm.gpr_state().rcx, 0);
}

#[test]
fn stop_callback_halts_at_target() {
    let code = shuffle_code();
    let target = code.base() + 6;
    let mut vm = vm_for(&code);
    vm.gpr_state_mut().rax = 0xabcd;

    let id = vm.add_code_addr_cb(target, InstPosition::PreInst, Rc::new(|_| VmAction::Stop));
    assert_ne!(id, INVALID_EVENT_ID);

    // The stop address is unreachable; the callback stops the run.
    vm.run(code.base(), code.base() + 0x1000).expect("run");
    assert_eq!(vm.gpr_state().rip, target);
    // xor rax, rax never executed.
    assert_eq!(vm.gpr_state().rax, 0xabcd);
}

#[test]
fn deleted_rule_no_longer_fires() {
    let code = shuffle_code();
    let mut vm = vm_for(&code);

    let count = Rc::new(Cell::new(0u32));
    let c = Rc::clone(&count);
    let id = vm.add_code_cb(
        InstPosition::PreInst,
        Rc::new(move |_| {
            c.set(c.get() + 1);
            VmAction::Continue
        }),
    );

    vm.run(code.base(), code.end()).expect("run");
    assert_eq!(count.get(), 3);

    assert!(vm.delete_instrumentation(id));
    // The affected cache was invalidated; the lazy re-translation no
    // longer contains the rule.
    vm.run(code.base(), code.end()).expect("run");
    assert_eq!(count.get(), 3);
}

#[test]
fn mnemonic_callback_matches_once() {
    let code = shuffle_code();
    let mut vm = vm_for(&code);

    let count = Rc::new(Cell::new(0u32));
    let c = Rc::clone(&count);
    vm.add_mnemonic_cb(
        "XOR",
        InstPosition::PreInst,
        Rc::new(move |_| {
            c.set(c.get() + 1);
            VmAction::Continue
        }),
    );

    vm.run(code.base(), code.end()).expect("run");
    assert_eq!(count.get(), 1);
}

#[test]
fn range_callback_filters_addresses() {
    let code = shuffle_code();
    let mut vm = vm_for(&code);

    let count = Rc::new(Cell::new(0u32));
    let c = Rc::clone(&count);
    // Covers only the first two instructions.
    vm.add_code_range_cb(
        code.base(),
        code.base() + 6,
        InstPosition::PreInst,
        Rc::new(move |_| {
            c.set(c.get() + 1);
            VmAction::Continue
        }),
    );

    vm.run(code.base(), code.end()).expect("run");
    assert_eq!(count.get(), 2);
}

#[test]
fn memory_range_callback_filters_accesses() {
    // Guest reads 8 bytes at buf+16 and writes 4 bytes at buf+200; the
    // registered range only covers the first 64 bytes.
    let buf = vec![0u8; 256].into_boxed_slice();
    let buf_addr = buf.as_ptr() as u64;

    #[rustfmt::skip]
    let code = GuestCode::new(&[
        0x48, 0x8b, 0x43, 0x10,                               // mov rax, [rbx+16]
        0xc7, 0x83, 0xc8, 0x00, 0x00, 0x00,
        0x07, 0x00, 0x00, 0x00,                               // mov dword [rbx+200], 7
    ]);
    let mut vm = vm_for(&code);
    vm.gpr_state_mut().rbx = buf_addr;

    let hits: Rc<RefCell<Vec<u64>>> = Rc::new(RefCell::new(Vec::new()));
    let h = Rc::clone(&hits);
    let id = vm.add_mem_range_cb(
        buf_addr,
        buf_addr + 64,
        MemoryAccessType::ReadWrite,
        Rc::new(move |ctx| {
            h.borrow_mut().push(ctx.gpr.rip);
            VmAction::Continue
        }),
    );
    assert_ne!(id, INVALID_EVENT_ID);

    vm.run(code.base(), code.end()).expect("run");

    // Exactly one hit: the read. The write at buf+200 is filtered out.
    assert_eq!(hits.borrow().len(), 1);
    // The write still happened architecturally.
    assert_eq!(
        u32::from_le_bytes(buf[200..204].try_into().unwrap()),
        7
    );
}

#[test]
fn inst_memory_access_reports_operands() {
    let data: u64 = 0x5566778899aabbcc;
    let data_addr = &data as *const u64 as u64;

    let code = GuestCode::new(&[
        0x48, 0x8b, 0x03, // mov rax, [rbx]
    ]);
    let mut vm = vm_for(&code);
    vm.gpr_state_mut().rbx = data_addr;
    vm.record_memory_access(MemoryAccessType::ReadWrite);

    let seen: Rc<RefCell<Vec<(u64, u8, u64)>>> = Rc::new(RefCell::new(Vec::new()));
    let s = Rc::clone(&seen);
    vm.add_code_addr_cb(
        code.base(),
        InstPosition::PreInst,
        Rc::new(move |ctx| {
            for a in ctx.inst_memory_access() {
                s.borrow_mut().push((a.access_address, a.size, a.value));
            }
            VmAction::Continue
        }),
    );

    vm.run(code.base(), code.end()).expect("run");

    assert_eq!(*seen.borrow(), vec![(data_addr, 8, data)]);
}

#[test]
fn bb_memory_access_accumulates_in_order() {
    let data: [u64; 2] = [0x11, 0x22];
    let data_addr = data.as_ptr() as u64;

    #[rustfmt::skip]
    let code = GuestCode::new(&[
        0x48, 0x8b, 0x03,       // mov rax, [rbx]
        0x48, 0x8b, 0x4b, 0x08, // mov rcx, [rbx+8]
    ]);
    let mut vm = vm_for(&code);
    vm.gpr_state_mut().rbx = data_addr;
    vm.record_memory_access(MemoryAccessType::Read);

    let seen: Rc<RefCell<Vec<u64>>> = Rc::new(RefCell::new(Vec::new()));
    let s = Rc::clone(&seen);
    vm.add_code_addr_cb(
        code.base() + 3,
        InstPosition::PreInst,
        Rc::new(move |ctx| {
            for a in ctx.bb_memory_access() {
                s.borrow_mut().push(a.access_address);
            }
            VmAction::Continue
        }),
    );

    vm.run(code.base(), code.end()).expect("run");

    // Execution order, up to and including the current instruction: the
    // first load plus the second load's own read.
    assert_eq!(*seen.borrow(), vec![data_addr, data_addr + 8]);
}

#[test]
fn basic_block_events_fire() {
    let code = shuffle_code();
    let mut vm = vm_for(&code);

    let news = Rc::new(Cell::new(0u32));
    let entries = Rc::new(Cell::new(0u32));
    let exits = Rc::new(Cell::new(0u32));
    let (n, e, x) = (Rc::clone(&news), Rc::clone(&entries), Rc::clone(&exits));
    vm.add_vm_event_cb(
        EVENT_BASIC_BLOCK_NEW | EVENT_BASIC_BLOCK_ENTRY | EVENT_BASIC_BLOCK_EXIT,
        Rc::new(move |state, _| {
            if state.event & EVENT_BASIC_BLOCK_NEW != 0 {
                n.set(n.get() + 1);
            }
            if state.event & EVENT_BASIC_BLOCK_ENTRY != 0 {
                e.set(e.get() + 1);
                assert_eq!(state.basic_block_start, state.sequence_start);
            }
            if state.event & EVENT_BASIC_BLOCK_EXIT != 0 {
                x.set(x.get() + 1);
            }
            VmAction::Continue
        }),
    );

    vm.run(code.base(), code.end()).expect("run");
    assert_eq!(news.get(), 1);
    assert_eq!(entries.get(), 1);
    assert_eq!(exits.get(), 1);
}

#[test]
fn dynamic_rule_expands_per_instruction() {
    let code = shuffle_code();
    let mut vm = vm_for(&code);

    let count = Rc::new(Cell::new(0u32));
    let c = Rc::clone(&count);
    vm.add_instr_rule(
        ANALYSIS_INSTRUCTION | ANALYSIS_DISASSEMBLY,
        Rc::new(move |analysis| {
            // Only instrument the xor.
            if analysis.mnemonic != "xor" {
                return Vec::new();
            }
            let c = Rc::clone(&c);
            vec![InstrRuleDataCbk {
                position: InstPosition::PreInst,
                callback: Rc::new(move |_| {
                    c.set(c.get() + 1);
                    VmAction::Continue
                }),
            }]
        }),
    );

    vm.run(code.base(), code.end()).expect("run");
    assert_eq!(count.get(), 1);
}

#[test]
fn callback_can_mutate_guest_state() {
    let code = shuffle_code();
    let mut vm = vm_for(&code);
    vm.gpr_state_mut().rax = 1;

    // Rewrite rax before the first mov copies it.
    vm.add_code_addr_cb(
        code.base(),
        InstPosition::PreInst,
        Rc::new(|ctx| {
            ctx.gpr.rax = 0x7777;
            VmAction::Continue
        }),
    );

    vm.run(code.base(), code.end()).expect("run");
    assert_eq!(vm.gpr_state().rbx, 0x7777);
    assert_eq!(vm.gpr_state().rcx, 0x7777);
}

#[test]
fn snapshot_shares_rules_not_cache() {
    let code = shuffle_code();
    let mut vm = vm_for(&code);
    vm.gpr_state_mut().rax = 5;

    let count = Rc::new(Cell::new(0u32));
    let c = Rc::clone(&count);
    vm.add_code_cb(
        InstPosition::PreInst,
        Rc::new(move |_| {
            c.set(c.get() + 1);
            VmAction::Continue
        }),
    );

    let mut copy = vm.snapshot().expect("snapshot");
    assert_eq!(copy.gpr_state().rax, 5);

    copy.run(code.base(), code.end()).expect("run");
    assert_eq!(count.get(), 3);
    assert_eq!(copy.gpr_state().rbx, 5);
    // The original is untouched.
    assert_eq!(vm.gpr_state().rbx, 0);
}

#[test]
fn analysis_of_cached_instructions() {
    let code = shuffle_code();
    let mut vm = vm_for(&code);
    vm.run(code.base(), code.end()).expect("run");

    let a = vm
        .get_inst_analysis(code.base(), ANALYSIS_INSTRUCTION | ANALYSIS_DISASSEMBLY)
        .expect("cached analysis");
    assert_eq!(a.mnemonic, "mov");
    assert_eq!(a.disassembly.as_deref(), Some("mov rbx, rax"));
    assert_eq!(a.inst_size, 3);

    // Instructions never translated have no cached analysis.
    assert!(vm.get_inst_analysis(0x10, ANALYSIS_INSTRUCTION).is_none());
}

#[test]
fn call_helper_passes_arguments() {
    // max(rdi, rsi): cmp rdi, rsi ; jae a ; mov rax, rsi ; ret
    //                a: mov rax, rdi ; ret
    #[rustfmt::skip]
    let code = GuestCode::new(&[
        0x48, 0x39, 0xf7,       // 0: cmp rdi, rsi
        0x73, 0x04,             // 3: jae 9
        0x48, 0x89, 0xf0,       // 5: mov rax, rsi
        0xc3,                   // 8: ret
        0x48, 0x89, 0xf8,       // 9: mov rax, rdi
        0xc3,                   // 12: ret
    ]);
    let stack = GuestStack::new();
    let mut vm = vm_for(&code);
    vm.gpr_state_mut().rsp = stack.top();

    assert_eq!(vm.call(code.base(), &[3, 11]).expect("call"), 11);
    assert_eq!(vm.call(code.base(), &[42, 11]).expect("call"), 42);
}
