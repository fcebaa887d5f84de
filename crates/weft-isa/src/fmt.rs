//! Instruction rendering for diagnostics and analysis output.

use std::fmt::Write;

use crate::codec::width_suffix;
use crate::inst::{DecodedInst, MemRef, Operands, OP_LEA};
use crate::regs::Reg;

fn reg_name(reg: Reg, wide: bool) -> &'static str {
    if wide {
        reg.name()
    } else {
        reg.name32()
    }
}

fn fmt_mem(out: &mut String, mem: &MemRef) {
    out.push('[');
    let mut first = true;
    if mem.rip {
        out.push_str("rip");
        first = false;
    }
    if let Some(base) = mem.base {
        out.push_str(base.name());
        first = false;
    }
    if let Some(index) = mem.index {
        if !first {
            out.push_str(" + ");
        }
        out.push_str(index.name());
        if mem.scale > 1 {
            let _ = write!(out, "*{}", mem.scale);
        }
        first = false;
    }
    if mem.disp != 0 || first {
        if first {
            let _ = write!(out, "{:#x}", mem.disp);
        } else if mem.disp < 0 {
            let _ = write!(out, " - {:#x}", -(mem.disp as i64));
        } else {
            let _ = write!(out, " + {:#x}", mem.disp);
        }
    }
    out.push(']');
}

/// Render an instruction in Intel syntax.
pub fn format_inst(inst: &DecodedInst) -> String {
    let wide = inst.width.bytes() == 8;
    let mut out = String::from(inst.mnemonic());

    let mem_prefix = |out: &mut String| {
        let _ = write!(out, "{} ptr ", width_suffix(if inst.opid == OP_LEA {
            inst.width
        } else {
            inst.mem_width
        }));
    };

    match &inst.operands {
        Operands::None => {}
        Operands::Reg { reg } => {
            let _ = write!(out, " {}", reg_name(*reg, wide));
        }
        Operands::RegReg { dst, src } => {
            let _ = write!(out, " {}, {}", reg_name(*dst, wide), reg_name(*src, wide));
        }
        Operands::RegImm { dst, imm } => {
            let _ = write!(out, " {}, {:#x}", reg_name(*dst, wide), imm);
        }
        Operands::RegMem { dst, mem } => {
            let _ = write!(out, " {}, ", reg_name(*dst, wide));
            if inst.opid != OP_LEA {
                mem_prefix(&mut out);
            }
            fmt_mem(&mut out, mem);
        }
        Operands::MemReg { mem, src } => {
            out.push(' ');
            mem_prefix(&mut out);
            fmt_mem(&mut out, mem);
            let _ = write!(out, ", {}", reg_name(*src, wide));
        }
        Operands::MemImm { mem, imm } => {
            out.push(' ');
            mem_prefix(&mut out);
            fmt_mem(&mut out, mem);
            let _ = write!(out, ", {:#x}", imm);
        }
        Operands::Mem { mem } => {
            out.push(' ');
            mem_prefix(&mut out);
            fmt_mem(&mut out, mem);
        }
        Operands::Imm { imm } => {
            let _ = write!(out, " {:#x}", imm);
        }
        Operands::Rel { .. } => {
            if let Some(target) = inst.rel_target() {
                let _ = write!(out, " {:#x}", target);
            }
        }
    }
    out
}
