//! x86-64 instruction model for the weft DBI engine.
//!
//! Provides the decoded-instruction representation the translation
//! pipeline rewrites, a decoder and encoder for the supported subset,
//! and the `MachineCodec` capability trait the engine consumes.

mod codec;
mod decode;
mod encode;
mod fmt;
mod inst;
mod regs;

pub use codec::{
    CodecError, MachineCodec, OperandAccess, OperandInfo, RegisterInfo, Result, X86Codec,
    width_suffix,
};
pub use decode::decode;
pub use encode::{asm, encode};
pub use fmt::format_inst;
pub use inst::{
    AccessKind, DecodedInst, MemLoc, MemOperand, MemRef, OpId, Operands, Width, OP_ADD, OP_AND,
    OP_CALL, OP_CMP, OP_DEC, OP_IMUL, OP_INC, OP_INT3, OP_JA, OP_JAE, OP_JB, OP_JBE, OP_JE,
    OP_JG, OP_JGE, OP_JL, OP_JLE, OP_JMP, OP_JNE, OP_JNO, OP_JNP, OP_JNS, OP_JO, OP_JP, OP_JS,
    OP_LEA, OP_MOV, OP_MOVZX, OP_NOP, OP_OR, OP_POP, OP_PUSH, OP_RET, OP_SAR, OP_SHL, OP_SHR,
    OP_SUB, OP_SYSCALL, OP_TEST, OP_XCHG, OP_XOR,
};
pub use regs::{CALL_ARG_REGS, CALLEE_SAVED, NUM_GPR, Reg};
