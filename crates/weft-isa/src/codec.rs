//! Machine codec capability.
//!
//! The engine core consumes instruction decode/encode and register
//! queries through the `MachineCodec` trait so the translation pipeline
//! stays independent of the concrete disassembler.

use thiserror::Error;

use crate::decode;
use crate::encode;
use crate::fmt::format_inst;
use crate::inst::{DecodedInst, Operands, Width};
use crate::regs::Reg;

/// Codec errors.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("truncated instruction at {pc:#x}")]
    Truncated { pc: u64 },
    #[error("unsupported opcode {opcode:#04x} at {pc:#x}")]
    UnsupportedOpcode { opcode: u8, pc: u64 },
    #[error("unsupported prefix {prefix:#04x} at {pc:#x}")]
    UnsupportedPrefix { prefix: u8, pc: u64 },
    #[error("invalid encoding at {pc:#x}: {reason}")]
    InvalidEncoding { pc: u64, reason: &'static str },
    #[error("operand not encodable: {reason}")]
    NotEncodable { reason: &'static str },
}

pub type Result<T> = std::result::Result<T, CodecError>;

/// Register class and naming information.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RegisterInfo {
    pub name: &'static str,
    pub size: u8,
    pub callee_saved: bool,
}

/// Description of one operand, for analysis consumers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum OperandInfo {
    Reg { reg: Reg, access: OperandAccess },
    Imm { value: i64 },
    Mem { segment_free: bool },
    PcRel { target: u64 },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OperandAccess {
    Read,
    Write,
    ReadWrite,
}

/// Decode/encode capability over one architecture.
pub trait MachineCodec {
    /// Decode one instruction from `bytes` located at guest address `pc`.
    fn decode(&self, bytes: &[u8], pc: u64) -> Result<DecodedInst>;

    /// Encode an instruction back to bytes.
    fn encode(&self, inst: &DecodedInst) -> Result<Vec<u8>>;

    /// Register naming and class information.
    fn register_info(&self, reg: Reg) -> RegisterInfo;

    /// Operand description for analysis, by operand index.
    fn operand_info(&self, inst: &DecodedInst, idx: usize) -> Option<OperandInfo>;

    /// Render the instruction for diagnostics.
    fn disassemble(&self, inst: &DecodedInst) -> String;

    /// Maximum encoded instruction length.
    fn max_inst_len(&self) -> usize;
}

/// The x86-64 codec.
///
/// The CPU model string and attribute flags are accepted for interface
/// parity and recorded for diagnostics; the supported subset does not
/// change with them.
#[derive(Clone, Debug, Default)]
pub struct X86Codec {
    cpu: String,
    mattrs: Vec<String>,
}

impl X86Codec {
    pub fn new(cpu: impl Into<String>, mattrs: Vec<String>) -> Self {
        Self {
            cpu: cpu.into(),
            mattrs,
        }
    }

    pub fn cpu(&self) -> &str {
        &self.cpu
    }

    pub fn mattrs(&self) -> &[String] {
        &self.mattrs
    }
}

impl MachineCodec for X86Codec {
    fn decode(&self, bytes: &[u8], pc: u64) -> Result<DecodedInst> {
        decode::decode(bytes, pc)
    }

    fn encode(&self, inst: &DecodedInst) -> Result<Vec<u8>> {
        encode::encode(inst)
    }

    fn register_info(&self, reg: Reg) -> RegisterInfo {
        RegisterInfo {
            name: reg.name(),
            size: 8,
            callee_saved: crate::regs::CALLEE_SAVED.contains(&reg),
        }
    }

    fn operand_info(&self, inst: &DecodedInst, idx: usize) -> Option<OperandInfo> {
        let write_first = matches!(
            inst.opid,
            crate::inst::OP_MOV | crate::inst::OP_MOVZX | crate::inst::OP_LEA | crate::inst::OP_POP
        );
        let first_access = if write_first {
            OperandAccess::Write
        } else {
            OperandAccess::ReadWrite
        };
        match (&inst.operands, idx) {
            (Operands::Reg { reg }, 0) => Some(OperandInfo::Reg {
                reg: *reg,
                access: first_access,
            }),
            (Operands::RegReg { dst, .. }, 0) => Some(OperandInfo::Reg {
                reg: *dst,
                access: first_access,
            }),
            (Operands::RegReg { src, .. }, 1) => Some(OperandInfo::Reg {
                reg: *src,
                access: OperandAccess::Read,
            }),
            (Operands::RegImm { dst, .. }, 0) => Some(OperandInfo::Reg {
                reg: *dst,
                access: first_access,
            }),
            (Operands::RegImm { imm, .. }, 1) => Some(OperandInfo::Imm { value: *imm }),
            (Operands::RegMem { dst, .. }, 0) => Some(OperandInfo::Reg {
                reg: *dst,
                access: first_access,
            }),
            (Operands::RegMem { .. }, 1) => Some(OperandInfo::Mem { segment_free: true }),
            (Operands::MemReg { .. }, 0) => Some(OperandInfo::Mem { segment_free: true }),
            (Operands::MemReg { src, .. }, 1) => Some(OperandInfo::Reg {
                reg: *src,
                access: OperandAccess::Read,
            }),
            (Operands::MemImm { .. }, 0) => Some(OperandInfo::Mem { segment_free: true }),
            (Operands::MemImm { imm, .. }, 1) => Some(OperandInfo::Imm { value: *imm }),
            (Operands::Mem { .. }, 0) => Some(OperandInfo::Mem { segment_free: true }),
            (Operands::Imm { imm }, 0) => Some(OperandInfo::Imm { value: *imm }),
            (Operands::Rel { .. }, 0) => inst.rel_target().map(|target| OperandInfo::PcRel { target }),
            _ => None,
        }
    }

    fn disassemble(&self, inst: &DecodedInst) -> String {
        format_inst(inst)
    }

    fn max_inst_len(&self) -> usize {
        15
    }
}

/// Width helper for display.
pub fn width_suffix(width: Width) -> &'static str {
    match width {
        Width::B => "byte",
        Width::W => "word",
        Width::D => "dword",
        Width::Q => "qword",
    }
}
