//! Instruction analysis exposed to callbacks.

use weft_isa::{DecodedInst, MachineCodec, OperandInfo};

use crate::maps::MemoryMap;

// Analysis granularity bits.
pub const ANALYSIS_INSTRUCTION: u32 = 1 << 0;
pub const ANALYSIS_DISASSEMBLY: u32 = 1 << 1;
pub const ANALYSIS_OPERANDS: u32 = 1 << 2;
pub const ANALYSIS_SYMBOL: u32 = 1 << 3;

/// Analysis of one decoded instruction. Fields beyond the instruction
/// basics are populated according to the requested analysis mask.
#[derive(Clone, Debug)]
pub struct InstAnalysis {
    pub address: u64,
    pub inst_size: u8,
    pub mnemonic: &'static str,
    pub affect_control_flow: bool,
    pub is_branch: bool,
    pub is_call: bool,
    pub is_return: bool,
    pub may_load: bool,
    pub may_store: bool,
    /// With `ANALYSIS_DISASSEMBLY`.
    pub disassembly: Option<String>,
    /// With `ANALYSIS_OPERANDS`.
    pub operands: Option<Vec<OperandInfo>>,
    /// With `ANALYSIS_SYMBOL`: name of the mapping containing the
    /// instruction.
    pub module: Option<String>,
}

/// Build an analysis at the requested granularity.
pub fn analyze(
    codec: &dyn MachineCodec,
    inst: &DecodedInst,
    mask: u32,
    maps: Option<&[MemoryMap]>,
) -> InstAnalysis {
    let disassembly = if mask & ANALYSIS_DISASSEMBLY != 0 {
        Some(codec.disassemble(inst))
    } else {
        None
    };
    let operands = if mask & ANALYSIS_OPERANDS != 0 {
        let mut ops = Vec::new();
        let mut idx = 0;
        while let Some(op) = codec.operand_info(inst, idx) {
            ops.push(op);
            idx += 1;
        }
        Some(ops)
    } else {
        None
    };
    let module = if mask & ANALYSIS_SYMBOL != 0 {
        maps.and_then(|maps| {
            maps.iter()
                .find(|m| m.range.contains(inst.address))
                .map(|m| m.name.clone())
        })
    } else {
        None
    };

    InstAnalysis {
        address: inst.address,
        inst_size: inst.size,
        mnemonic: inst.mnemonic(),
        affect_control_flow: inst.ends_block(),
        is_branch: inst.is_branch(),
        is_call: inst.is_call(),
        is_return: inst.is_return(),
        may_load: inst.reads_memory(),
        may_store: inst.writes_memory(),
        disassembly,
        operands,
        module,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use weft_isa::{decode, X86Codec};

    #[test]
    fn test_analysis_basics() {
        let codec = X86Codec::default();
        let inst = decode(&[0xe8, 0x00, 0x00, 0x00, 0x00], 0x1000).unwrap();
        let a = analyze(&codec, &inst, ANALYSIS_INSTRUCTION, None);
        assert_eq!(a.address, 0x1000);
        assert_eq!(a.inst_size, 5);
        assert_eq!(a.mnemonic, "call");
        assert!(a.is_call);
        assert!(a.affect_control_flow);
        assert!(a.may_store); // pushes the return address
        assert!(a.disassembly.is_none());
        assert!(a.operands.is_none());
    }

    #[test]
    fn test_analysis_disassembly_and_operands() {
        let codec = X86Codec::default();
        let inst = decode(&[0x48, 0x89, 0xc3], 0).unwrap();
        let a = analyze(
            &codec,
            &inst,
            ANALYSIS_DISASSEMBLY | ANALYSIS_OPERANDS,
            None,
        );
        assert_eq!(a.disassembly.as_deref(), Some("mov rbx, rax"));
        assert_eq!(a.operands.as_ref().map(Vec::len), Some(2));
    }

    #[test]
    fn test_analysis_module_lookup() {
        use weft_range::Range;
        let codec = X86Codec::default();
        let inst = decode(&[0x90], 0x1500).unwrap();
        let maps = vec![MemoryMap {
            range: Range::new(0x1000, 0x2000),
            permission: crate::maps::PF_READ | crate::maps::PF_EXEC,
            name: "libfoo.so".into(),
        }];
        let a = analyze(&codec, &inst, ANALYSIS_SYMBOL, Some(&maps));
        assert_eq!(a.module.as_deref(), Some("libfoo.so"));
    }
}
