//! Guest and host register state for the weft DBI engine.
//!
//! The structs here are `#[repr(C)]` with layouts the emitted code
//! addresses by constant displacement. Layout changes must be mirrored
//! in the layout tests, which pin every offset the JIT relies on.

mod context;
mod fpr;
mod gpr;

pub use context::{Context, HostState};
pub use fpr::{FprState, FCW_DEFAULT, MXCSR_DEFAULT};
pub use gpr::{GprState, EFLAGS_DEFAULT};
