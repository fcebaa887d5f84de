//! End-to-end execution: translated code must produce the same guest
//! state transitions as native execution.

mod support;

use std::cell::Cell;
use std::rc::Rc;

use support::{vm_for, write_stack_slot, GuestCode, GuestStack};
use weft::{VmAction, EVENT_EXEC_TRANSFER_CALL, EVENT_EXEC_TRANSFER_RETURN, EVENT_SYSCALL_ENTRY,
    EVENT_SYSCALL_EXIT};

#[test]
fn gpr_shuffle() {
    // mov rbx, rax ; mov rcx, rbx ; xor rax, rax
    let code = GuestCode::new(&[
        0x48, 0x89, 0xc3, // mov rbx, rax
        0x48, 0x89, 0xd9, // mov rcx, rbx
        0x48, 0x31, 0xc0, // xor rax, rax
    ]);
    let mut vm = vm_for(&code);
    vm.gpr_state_mut().rax = 0xdeadbeef;

    vm.run(code.base(), code.end()).expect("run");

    let gpr = vm.gpr_state();
    assert_eq!(gpr.rbx, 0xdeadbeef);
    assert_eq!(gpr.rcx, 0xdeadbeef);
    assert_eq!(gpr.rax, 0);
    assert_eq!(gpr.rip, code.end());
}

#[test]
fn pc_relative_lea() {
    // lea rax, [rip + 8] ; ret
    let code = GuestCode::new(&[
        0x48, 0x8d, 0x05, 0x08, 0x00, 0x00, 0x00, // lea rax, [rip+8]
        0xc3, // ret
    ]);
    let stack = GuestStack::new();
    let sentinel = 0x5afe_0000u64;

    let mut vm = vm_for(&code);
    let rsp = stack.top() - 8;
    write_stack_slot(rsp, sentinel);
    vm.gpr_state_mut().rsp = rsp;

    vm.run(code.base(), sentinel).expect("run");

    // Identical to native: rax = lea address + instruction length + 8.
    assert_eq!(vm.gpr_state().rax, code.base() + 7 + 8);
    assert_eq!(vm.gpr_state().rip, sentinel);
    // The return consumed the sentinel slot.
    assert_eq!(vm.gpr_state().rsp, rsp + 8);
}

/// Recursive fibonacci, all calls and returns instrumented.
#[test]
fn fibonacci_recursion() {
    #[rustfmt::skip]
    let code = GuestCode::new(&[
        // fib:
        0x48, 0x83, 0xff, 0x02,       //  0: cmp rdi, 2
        0x73, 0x04,                   //  4: jae rec
        0x48, 0x89, 0xf8,             //  6: mov rax, rdi
        0xc3,                         //  9: ret
        // rec:
        0x57,                         // 10: push rdi
        0x48, 0x83, 0xef, 0x01,       // 11: sub rdi, 1
        0xe8, 0xec, 0xff, 0xff, 0xff, // 15: call fib
        0x5f,                         // 20: pop rdi
        0x50,                         // 21: push rax
        0x48, 0x83, 0xef, 0x02,       // 22: sub rdi, 2
        0xe8, 0xe1, 0xff, 0xff, 0xff, // 26: call fib
        0x59,                         // 31: pop rcx
        0x48, 0x01, 0xc8,             // 32: add rax, rcx
        0xc3,                         // 35: ret
    ]);
    let stack = GuestStack::new();

    let mut vm = vm_for(&code);
    vm.gpr_state_mut().rsp = stack.top();

    let result = vm.call(code.base(), &[10]).expect("call");
    assert_eq!(result, 55);
}

#[test]
fn conditional_loop() {
    #[rustfmt::skip]
    let code = GuestCode::new(&[
        0x48, 0x31, 0xc0,                         //  0: xor rax, rax
        0x48, 0xc7, 0xc1, 0x05, 0x00, 0x00, 0x00, //  3: mov rcx, 5
        // loop:
        0x48, 0x01, 0xc8,                         // 10: add rax, rcx
        0x48, 0x83, 0xe9, 0x01,                   // 13: sub rcx, 1
        0x75, 0xf7,                               // 17: jne loop
    ]);
    let mut vm = vm_for(&code);

    vm.run(code.base(), code.end()).expect("run");

    assert_eq!(vm.gpr_state().rax, 5 + 4 + 3 + 2 + 1);
    assert_eq!(vm.gpr_state().rcx, 0);
}

#[test]
fn indirect_jump_in_range() {
    let code = GuestCode::new(&[
        0xff, 0xe0, // 0: jmp rax
        0xcc, 0xcc, // 2: never reached
        0x90,       // 4: nop
    ]);
    let mut vm = vm_for(&code);
    vm.gpr_state_mut().rax = code.base() + 4;

    vm.run(code.base(), code.end()).expect("run");
    assert_eq!(vm.gpr_state().rip, code.end());
}

#[test]
fn syscall_getpid() {
    // mov eax, 39 ; syscall
    let code = GuestCode::new(&[
        0xb8, 0x27, 0x00, 0x00, 0x00, // mov eax, 39 (getpid)
        0x0f, 0x05, // syscall
    ]);
    let mut vm = vm_for(&code);

    let entries = Rc::new(Cell::new(0u32));
    let exits = Rc::new(Cell::new(0u32));
    let (e, x) = (Rc::clone(&entries), Rc::clone(&exits));
    vm.add_vm_event_cb(
        EVENT_SYSCALL_ENTRY | EVENT_SYSCALL_EXIT,
        Rc::new(move |state, _| {
            if state.event & EVENT_SYSCALL_ENTRY != 0 {
                e.set(e.get() + 1);
            }
            if state.event & EVENT_SYSCALL_EXIT != 0 {
                x.set(x.get() + 1);
            }
            VmAction::Continue
        }),
    );

    vm.run(code.base(), code.end()).expect("run");

    assert_eq!(vm.gpr_state().rax, std::process::id() as u64);
    assert_eq!(entries.get(), 1);
    assert_eq!(exits.get(), 1);
}

extern "C" fn native_add_one(x: u64) -> u64 {
    x.wrapping_add(1)
}

/// A call leaving the instrumented ranges runs natively through the
/// transfer bridge and resumes instrumented at the return address.
#[test]
fn exec_transfer_to_native() {
    let code = GuestCode::new(&[
        0xff, 0xd0, // 0: call rax
        0x48, 0x89, 0xc3, // 2: mov rbx, rax
    ]);
    let stack = GuestStack::new();

    let mut vm = vm_for(&code);
    vm.gpr_state_mut().rsp = stack.top();
    vm.gpr_state_mut().rax = native_add_one as usize as u64;
    vm.gpr_state_mut().rdi = 41;

    let calls = Rc::new(Cell::new(0u32));
    let rets = Rc::new(Cell::new(0u32));
    let (c, r) = (Rc::clone(&calls), Rc::clone(&rets));
    vm.add_vm_event_cb(
        EVENT_EXEC_TRANSFER_CALL | EVENT_EXEC_TRANSFER_RETURN,
        Rc::new(move |state, _| {
            if state.event & EVENT_EXEC_TRANSFER_CALL != 0 {
                c.set(c.get() + 1);
            }
            if state.event & EVENT_EXEC_TRANSFER_RETURN != 0 {
                r.set(r.get() + 1);
            }
            VmAction::Continue
        }),
    );

    vm.run(code.base(), code.end()).expect("run");

    assert_eq!(vm.gpr_state().rbx, 42);
    assert_eq!(calls.get(), 1);
    assert_eq!(rets.get(), 1);
    // The native return consumed the bridged return address.
    assert_eq!(vm.gpr_state().rsp, stack.top());
}

#[test]
fn rip_relative_load() {
    // The load target sits right after the code: mov rax, [rip + 1].
    // 7-byte instruction followed by one padding byte, then the data.
    let mut bytes = vec![
        0x48, 0x8b, 0x05, 0x01, 0x00, 0x00, 0x00, // mov rax, [rip+1]
        0x90, // nop (also the run stop point)
    ];
    bytes.extend_from_slice(&0x1122334455667788u64.to_le_bytes());
    let code = GuestCode::new(&bytes);

    let mut vm = vm_for(&code);
    // Only the instructions are code; stop before the data.
    vm.remove_all_instrumented_ranges();
    vm.add_instrumented_range(code.base(), code.base() + 8)
        .expect("range");

    vm.run(code.base(), code.base() + 8).expect("run");
    assert_eq!(vm.gpr_state().rax, 0x1122334455667788);
}

#[test]
fn cache_survives_repeated_runs() {
    let code = GuestCode::new(&[
        0x48, 0xff, 0xc0, // inc rax
    ]);
    let mut vm = vm_for(&code);

    for expected in 1..=5u64 {
        vm.run(code.base(), code.end()).expect("run");
        assert_eq!(vm.gpr_state().rax, expected);
        vm.gpr_state_mut().rip = 0;
    }
}

#[test]
fn clear_cache_retranslates_deterministically() {
    let code = GuestCode::new(&[
        0x48, 0x89, 0xc3, // mov rbx, rax
        0x48, 0x31, 0xc0, // xor rax, rax
    ]);
    let mut vm = vm_for(&code);
    vm.gpr_state_mut().rax = 7;
    vm.run(code.base(), code.end()).expect("run");
    assert_eq!(vm.gpr_state().rbx, 7);

    vm.clear_all_cache();
    vm.gpr_state_mut().rax = 9;
    vm.run(code.base(), code.end()).expect("run");
    assert_eq!(vm.gpr_state().rbx, 9);
    assert_eq!(vm.gpr_state().rax, 0);
}

#[test]
fn untranslatable_instruction_reports_error() {
    // ud2 is outside the supported subset.
    let code = GuestCode::new(&[0x0f, 0x0b]);
    let mut vm = vm_for(&code);
    let err = vm.run(code.base(), code.end()).unwrap_err();
    assert!(matches!(err, weft::Error::Translation { pc, .. } if pc == code.base()));
}

#[test]
fn precache_basic_block() {
    let code = GuestCode::new(&[0x90, 0xc3]);
    let mut vm = vm_for(&code);
    assert!(vm.precache_basic_block(code.base()));
    // Outside the instrumented ranges nothing is precached.
    assert!(!vm.precache_basic_block(0x10));
}
