//! Shared fixtures: guest code buffers, guest stacks, VM construction.
#![allow(dead_code)]

use weft::{EngineConfig, Vm};

/// A guest code buffer at a stable address.
pub struct GuestCode {
    buf: Box<[u8]>,
}

impl GuestCode {
    pub fn new(bytes: &[u8]) -> Self {
        Self {
            buf: bytes.to_vec().into_boxed_slice(),
        }
    }

    pub fn base(&self) -> u64 {
        self.buf.as_ptr() as u64
    }

    pub fn end(&self) -> u64 {
        self.base() + self.buf.len() as u64
    }
}

/// A guest stack; `top()` is 16-byte aligned with headroom above it.
pub struct GuestStack {
    mem: Box<[u8]>,
}

impl GuestStack {
    pub fn new() -> Self {
        Self {
            mem: vec![0u8; 64 * 1024].into_boxed_slice(),
        }
    }

    pub fn top(&self) -> u64 {
        let end = self.mem.as_ptr() as u64 + self.mem.len() as u64 - 256;
        end & !0xf
    }
}

/// Route engine tracing to the test output when RUST_LOG is set.
pub fn init_logging() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// A VM instrumenting exactly the given code buffer.
pub fn vm_for(code: &GuestCode) -> Vm {
    init_logging();
    let mut vm = Vm::new(EngineConfig::default());
    vm.add_instrumented_range(code.base(), code.end())
        .expect("instrumented range");
    vm
}

/// Write a 64-bit value onto the guest stack slot at `addr`.
pub fn write_stack_slot(addr: u64, value: u64) {
    unsafe { (addr as *mut u64).write(value) }
}
