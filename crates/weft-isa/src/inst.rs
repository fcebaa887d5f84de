//! Decoded instruction model.
//!
//! A `DecodedInst` carries the operation identifier, the operand pattern
//! and enough classification (control flow, register use, memory
//! operands) for the translation pipeline to rewrite it.

use crate::regs::Reg;

/// Instruction identifier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct OpId(pub u16);

pub const OP_MOV: OpId = OpId(0);
pub const OP_MOVZX: OpId = OpId(1);
pub const OP_LEA: OpId = OpId(2);
pub const OP_ADD: OpId = OpId(3);
pub const OP_SUB: OpId = OpId(4);
pub const OP_AND: OpId = OpId(5);
pub const OP_OR: OpId = OpId(6);
pub const OP_XOR: OpId = OpId(7);
pub const OP_CMP: OpId = OpId(8);
pub const OP_TEST: OpId = OpId(9);
pub const OP_IMUL: OpId = OpId(10);
pub const OP_SHL: OpId = OpId(11);
pub const OP_SHR: OpId = OpId(12);
pub const OP_SAR: OpId = OpId(13);
pub const OP_INC: OpId = OpId(14);
pub const OP_DEC: OpId = OpId(15);
pub const OP_PUSH: OpId = OpId(16);
pub const OP_POP: OpId = OpId(17);
pub const OP_XCHG: OpId = OpId(18);
pub const OP_NOP: OpId = OpId(19);
pub const OP_RET: OpId = OpId(20);
pub const OP_CALL: OpId = OpId(21);
pub const OP_JMP: OpId = OpId(22);
pub const OP_SYSCALL: OpId = OpId(23);
pub const OP_INT3: OpId = OpId(24);

// Conditional jumps, in condition-code order (Jcc = OP_JCC_BASE + cc).
pub const OP_JO: OpId = OpId(32);
pub const OP_JNO: OpId = OpId(33);
pub const OP_JB: OpId = OpId(34);
pub const OP_JAE: OpId = OpId(35);
pub const OP_JE: OpId = OpId(36);
pub const OP_JNE: OpId = OpId(37);
pub const OP_JBE: OpId = OpId(38);
pub const OP_JA: OpId = OpId(39);
pub const OP_JS: OpId = OpId(40);
pub const OP_JNS: OpId = OpId(41);
pub const OP_JP: OpId = OpId(42);
pub const OP_JNP: OpId = OpId(43);
pub const OP_JL: OpId = OpId(44);
pub const OP_JGE: OpId = OpId(45);
pub const OP_JLE: OpId = OpId(46);
pub const OP_JG: OpId = OpId(47);

pub(crate) const OP_JCC_BASE: u16 = 32;

impl OpId {
    /// Condition code if this is a conditional jump.
    pub fn condition_code(self) -> Option<u8> {
        if (OP_JCC_BASE..OP_JCC_BASE + 16).contains(&self.0) {
            Some((self.0 - OP_JCC_BASE) as u8)
        } else {
            None
        }
    }

    pub const fn from_condition_code(cc: u8) -> OpId {
        OpId(OP_JCC_BASE + (cc & 0xf) as u16)
    }

    pub fn mnemonic(self) -> &'static str {
        match self {
            OP_MOV => "mov",
            OP_MOVZX => "movzx",
            OP_LEA => "lea",
            OP_ADD => "add",
            OP_SUB => "sub",
            OP_AND => "and",
            OP_OR => "or",
            OP_XOR => "xor",
            OP_CMP => "cmp",
            OP_TEST => "test",
            OP_IMUL => "imul",
            OP_SHL => "shl",
            OP_SHR => "shr",
            OP_SAR => "sar",
            OP_INC => "inc",
            OP_DEC => "dec",
            OP_PUSH => "push",
            OP_POP => "pop",
            OP_XCHG => "xchg",
            OP_NOP => "nop",
            OP_RET => "ret",
            OP_CALL => "call",
            OP_JMP => "jmp",
            OP_SYSCALL => "syscall",
            OP_INT3 => "int3",
            OP_JO => "jo",
            OP_JNO => "jno",
            OP_JB => "jb",
            OP_JAE => "jae",
            OP_JE => "je",
            OP_JNE => "jne",
            OP_JBE => "jbe",
            OP_JA => "ja",
            OP_JS => "js",
            OP_JNS => "jns",
            OP_JP => "jp",
            OP_JNP => "jnp",
            OP_JL => "jl",
            OP_JGE => "jge",
            OP_JLE => "jle",
            OP_JG => "jg",
            _ => "??",
        }
    }
}

/// Operand width in bytes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum Width {
    B = 1,
    W = 2,
    D = 4,
    Q = 8,
}

impl Width {
    pub const fn bytes(self) -> u8 {
        self as u8
    }
}

/// A memory reference: `[base + index*scale + disp]` or `[rip + disp]`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MemRef {
    pub base: Option<Reg>,
    pub index: Option<Reg>,
    pub scale: u8,
    pub disp: i32,
    pub rip: bool,
}

impl MemRef {
    pub const fn base(base: Reg) -> Self {
        MemRef {
            base: Some(base),
            index: None,
            scale: 1,
            disp: 0,
            rip: false,
        }
    }

    pub const fn base_disp(base: Reg, disp: i32) -> Self {
        MemRef {
            base: Some(base),
            index: None,
            scale: 1,
            disp,
            rip: false,
        }
    }

    pub const fn rip(disp: i32) -> Self {
        MemRef {
            base: None,
            index: None,
            scale: 1,
            disp,
            rip: true,
        }
    }

    /// Registers the address computation reads.
    pub fn regs_used(&self) -> u16 {
        let mut mask = 0;
        if let Some(b) = self.base {
            mask |= b.bit();
        }
        if let Some(i) = self.index {
            mask |= i.bit();
        }
        mask
    }
}

/// Operand patterns (covers the supported x86-64 forms).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Operands {
    /// No explicit operands (ret, nop, syscall, int3).
    None,
    /// Single register (push/pop/inc/dec r64, shift by cl).
    Reg { reg: Reg },
    /// Register-to-register, destination first.
    RegReg { dst: Reg, src: Reg },
    /// Register destination with immediate.
    RegImm { dst: Reg, imm: i64 },
    /// Register destination with memory source (loads, lea).
    RegMem { dst: Reg, mem: MemRef },
    /// Memory destination with register source (stores).
    MemReg { mem: MemRef, src: Reg },
    /// Memory destination with immediate.
    MemImm { mem: MemRef, imm: i64 },
    /// Single memory operand (jmp/call/push/inc/dec m64).
    Mem { mem: MemRef },
    /// Single immediate (push imm, ret imm16).
    Imm { imm: i64 },
    /// PC-relative branch displacement (target = end of inst + disp).
    Rel { disp: i64 },
}

/// How a memory operand is accessed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AccessKind {
    Read,
    Write,
    ReadWrite,
}

impl AccessKind {
    pub fn reads(self) -> bool {
        matches!(self, AccessKind::Read | AccessKind::ReadWrite)
    }

    pub fn writes(self) -> bool {
        matches!(self, AccessKind::Write | AccessKind::ReadWrite)
    }
}

/// Location of a memory operand.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MemLoc {
    /// Encoded in the instruction.
    Explicit(MemRef),
    /// Implicit push slot: `[rsp - 8]` before, `[rsp]` after execution.
    StackPush,
    /// Implicit pop slot: `[rsp]` before execution.
    StackPop,
}

/// One architectural memory operand of an instruction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MemOperand {
    pub loc: MemLoc,
    pub kind: AccessKind,
    pub width: Width,
}

/// A fully decoded instruction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DecodedInst {
    pub opid: OpId,
    /// Guest address of the instruction.
    pub address: u64,
    /// Encoded length in bytes.
    pub size: u8,
    /// Operand width.
    pub width: Width,
    /// Width of the memory operand when it differs (movzx).
    pub mem_width: Width,
    pub operands: Operands,
}

impl DecodedInst {
    pub fn new(opid: OpId, address: u64, size: u8, width: Width, operands: Operands) -> Self {
        Self {
            opid,
            address,
            size,
            width,
            mem_width: width,
            operands,
        }
    }

    pub fn mnemonic(&self) -> &'static str {
        self.opid.mnemonic()
    }

    /// Guest address of the next instruction.
    pub fn next_address(&self) -> u64 {
        self.address.wrapping_add(self.size as u64)
    }

    /// Branch target for PC-relative control flow.
    pub fn rel_target(&self) -> Option<u64> {
        match self.operands {
            Operands::Rel { disp } => Some(self.next_address().wrapping_add(disp as u64)),
            _ => None,
        }
    }

    pub fn is_conditional_branch(&self) -> bool {
        self.opid.condition_code().is_some()
    }

    pub fn is_branch(&self) -> bool {
        self.opid == OP_JMP || self.is_conditional_branch()
    }

    pub fn is_call(&self) -> bool {
        self.opid == OP_CALL
    }

    pub fn is_return(&self) -> bool {
        self.opid == OP_RET
    }

    /// Whether this instruction ends a basic block.
    pub fn ends_block(&self) -> bool {
        self.is_branch()
            || self.is_call()
            || self.is_return()
            || self.opid == OP_SYSCALL
            || self.opid == OP_INT3
    }

    /// Whether the instruction has a rip-relative memory operand.
    pub fn uses_rip(&self) -> bool {
        match self.operands {
            Operands::RegMem { mem, .. }
            | Operands::MemReg { mem, .. }
            | Operands::MemImm { mem, .. }
            | Operands::Mem { mem } => mem.rip,
            Operands::Rel { .. } => true,
            _ => false,
        }
    }

    /// Mask of registers read or written by the instruction, including
    /// implicit uses. Used to pick scratch registers that do not collide.
    pub fn regs_used(&self) -> u16 {
        let mut mask = match self.operands {
            Operands::None | Operands::Imm { .. } | Operands::Rel { .. } => 0,
            Operands::Reg { reg } => reg.bit(),
            Operands::RegReg { dst, src } => dst.bit() | src.bit(),
            Operands::RegImm { dst, .. } => dst.bit(),
            Operands::RegMem { dst, mem } => dst.bit() | mem.regs_used(),
            Operands::MemReg { mem, src } => src.bit() | mem.regs_used(),
            Operands::MemImm { mem, .. } => mem.regs_used(),
            Operands::Mem { mem } => mem.regs_used(),
        };
        match self.opid {
            OP_PUSH | OP_POP | OP_CALL | OP_RET => mask |= Reg::Rsp.bit(),
            OP_SHL | OP_SHR | OP_SAR => {
                // Shift-by-cl form carries a bare register operand.
                if matches!(self.operands, Operands::Reg { .. } | Operands::Mem { .. }) {
                    mask |= Reg::Rcx.bit();
                }
            }
            OP_SYSCALL => {
                mask |= Reg::Rax.bit()
                    | Reg::Rcx.bit()
                    | Reg::Rdx.bit()
                    | Reg::Rsi.bit()
                    | Reg::Rdi.bit()
                    | Reg::R8.bit()
                    | Reg::R9.bit()
                    | Reg::R10.bit()
                    | Reg::R11.bit();
            }
            _ => {}
        }
        mask
    }

    /// The explicit memory reference, if the instruction has one.
    pub fn explicit_mem(&self) -> Option<MemRef> {
        match self.operands {
            Operands::RegMem { mem, .. }
            | Operands::MemReg { mem, .. }
            | Operands::MemImm { mem, .. }
            | Operands::Mem { mem } => Some(mem),
            _ => None,
        }
    }

    /// Architectural memory operands of the instruction.
    ///
    /// One entry per operand, with the direction and access width. `lea`
    /// computes an address but touches no memory, so it reports none.
    pub fn memory_operands(&self) -> Vec<MemOperand> {
        let mut ops = Vec::new();
        let width = self.mem_width;
        match self.opid {
            OP_LEA | OP_NOP => {}
            OP_PUSH => {
                if let Some(mem) = self.explicit_mem() {
                    ops.push(MemOperand {
                        loc: MemLoc::Explicit(mem),
                        kind: AccessKind::Read,
                        width,
                    });
                }
                ops.push(MemOperand {
                    loc: MemLoc::StackPush,
                    kind: AccessKind::Write,
                    width: Width::Q,
                });
            }
            OP_POP => ops.push(MemOperand {
                loc: MemLoc::StackPop,
                kind: AccessKind::Read,
                width: Width::Q,
            }),
            OP_CALL => {
                if let Some(mem) = self.explicit_mem() {
                    ops.push(MemOperand {
                        loc: MemLoc::Explicit(mem),
                        kind: AccessKind::Read,
                        width: Width::Q,
                    });
                }
                ops.push(MemOperand {
                    loc: MemLoc::StackPush,
                    kind: AccessKind::Write,
                    width: Width::Q,
                });
            }
            OP_RET => ops.push(MemOperand {
                loc: MemLoc::StackPop,
                kind: AccessKind::Read,
                width: Width::Q,
            }),
            OP_JMP => {
                if let Some(mem) = self.explicit_mem() {
                    ops.push(MemOperand {
                        loc: MemLoc::Explicit(mem),
                        kind: AccessKind::Read,
                        width: Width::Q,
                    });
                }
            }
            _ => {
                if let Some(mem) = self.explicit_mem() {
                    let kind = match self.operands {
                        // Loads.
                        Operands::RegMem { .. } => AccessKind::Read,
                        // Stores and read-modify-write forms.
                        Operands::MemReg { .. } => match self.opid {
                            OP_MOV => AccessKind::Write,
                            OP_CMP | OP_TEST => AccessKind::Read,
                            _ => AccessKind::ReadWrite,
                        },
                        Operands::MemImm { .. } => match self.opid {
                            OP_MOV => AccessKind::Write,
                            OP_CMP | OP_TEST => AccessKind::Read,
                            _ => AccessKind::ReadWrite,
                        },
                        Operands::Mem { .. } => match self.opid {
                            OP_INC | OP_DEC | OP_SHL | OP_SHR | OP_SAR => AccessKind::ReadWrite,
                            _ => AccessKind::Read,
                        },
                        _ => return ops,
                    };
                    ops.push(MemOperand {
                        loc: MemLoc::Explicit(mem),
                        kind,
                        width,
                    });
                }
            }
        }
        ops
    }

    pub fn reads_memory(&self) -> bool {
        self.memory_operands().iter().any(|m| m.kind.reads())
    }

    pub fn writes_memory(&self) -> bool {
        self.memory_operands().iter().any(|m| m.kind.writes())
    }
}
