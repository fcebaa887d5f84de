//! The transfer bridge.
//!
//! Runs code outside the instrumented ranges natively: a dedicated
//! block whose only sequence jumps indirectly through the context
//! scratch cell. The engine repoints the guest return address at the
//! landing pad, so when the native callee returns, the landing stores a
//! transfer-return event and exits through the epilogue with the full
//! guest context captured.

use weft_patch::MachineBackend;
use weft_state::Context;

use crate::block::{BlockError, ExecBlock};

pub struct TransferBridge {
    block: ExecBlock,
    stub_offset: usize,
    landing_offset: usize,
}

impl TransferBridge {
    pub fn new(backend: &dyn MachineBackend) -> Result<Self, BlockError> {
        let mut block = ExecBlock::new(backend, 1, 1)?;
        let (stub, landing) = backend.transfer_stub();
        let stub_offset = block.append(&stub, 0)?;
        let landing_offset = block.append(&landing, 0)?;
        block.finalize()?;
        Ok(Self {
            block,
            stub_offset,
            landing_offset,
        })
    }

    /// Host address native code returns to.
    pub fn landing_addr(&self) -> u64 {
        self.block.code_base() + self.landing_offset as u64
    }

    pub fn context(&self) -> &Context {
        self.block.context()
    }

    pub fn context_mut(&mut self) -> &mut Context {
        self.block.context_mut()
    }

    /// Arm the bridge: enter at the stub, jump to `target`.
    pub fn arm(&mut self, target: u64) {
        let entry = self.block.code_base() + self.stub_offset as u64;
        let ctx = self.block.context_mut();
        ctx.host.scratch = target;
        ctx.host.selector = entry;
    }

    /// Run the armed bridge.
    ///
    /// # Safety
    ///
    /// The context's guest state must be valid for the target function:
    /// in particular, `[rsp]` must hold the landing address so the
    /// callee's return re-enters the bridge.
    pub unsafe fn execute(&mut self) -> Result<u64, BlockError> {
        self.block.execute()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use weft_isa::X86Codec;
    use weft_patch::X86Backend;

    #[test]
    fn test_bridge_layout() {
        let backend = X86Backend::new(X86Codec::default(), false);
        let mut bridge = TransferBridge::new(&backend).expect("bridge");
        assert!(bridge.landing_addr() > bridge.block.code_base());

        bridge.arm(0xdeadbeef);
        assert_eq!(bridge.context().host.scratch, 0xdeadbeef);
        assert_eq!(
            bridge.context().host.selector,
            bridge.block.code_base() + bridge.stub_offset as u64
        );
    }
}
