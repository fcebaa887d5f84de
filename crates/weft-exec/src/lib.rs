//! Executable code cache for the weft DBI engine.
//!
//! `ExecBlock` is the page-pair unit holding instrumented sequences
//! plus their prologue/epilogue; `ExecBlockManager` is the cache from
//! guest PCs to blocks; `TransferBridge` runs non-instrumented code
//! natively while keeping the context-switch discipline.

mod block;
mod bridge;
mod manager;
mod pages;

pub use block::{BlockError, BlockState, ExecBlock, InstSlot, SeqEntry};
pub use bridge::TransferBridge;
pub use manager::{BlockConfig, ExecBlockManager};
pub use pages::{flush_icache, page_size, ExecPages, PageError};
