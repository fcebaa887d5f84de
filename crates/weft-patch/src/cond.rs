//! Patch conditions.
//!
//! A `PatchCondition` is a side-effect-free predicate over a decoded
//! instruction, deciding whether an instrumentation rule applies.

use weft_isa::DecodedInst;
use weft_range::Range;

/// Boolean predicate over a decoded instruction.
#[derive(Clone, Debug)]
pub enum PatchCondition {
    /// Always matches.
    True,
    /// Mnemonic comparison, case-insensitive, with an optional trailing
    /// `*` wildcard (`"j*"` matches every jump).
    MnemonicIs(String),
    /// Matches the instruction at exactly this address.
    AddressIs(u64),
    /// Matches instructions whose address falls in `[start, end)`.
    InstructionInRange(Range<u64>),
    /// Matches instructions that read memory.
    DoesReadAccess,
    /// Matches instructions that write memory.
    DoesWriteAccess,
    /// All children match.
    And(Vec<PatchCondition>),
    /// At least one child matches.
    Or(Vec<PatchCondition>),
}

impl PatchCondition {
    pub fn matches(&self, inst: &DecodedInst) -> bool {
        match self {
            PatchCondition::True => true,
            PatchCondition::MnemonicIs(pattern) => mnemonic_matches(pattern, inst.mnemonic()),
            PatchCondition::AddressIs(addr) => inst.address == *addr,
            PatchCondition::InstructionInRange(range) => range.contains(inst.address),
            PatchCondition::DoesReadAccess => inst.reads_memory(),
            PatchCondition::DoesWriteAccess => inst.writes_memory(),
            PatchCondition::And(children) => children.iter().all(|c| c.matches(inst)),
            PatchCondition::Or(children) => children.iter().any(|c| c.matches(inst)),
        }
    }
}

fn mnemonic_matches(pattern: &str, mnemonic: &str) -> bool {
    if let Some(prefix) = pattern.strip_suffix('*') {
        mnemonic.len() >= prefix.len() && mnemonic[..prefix.len()].eq_ignore_ascii_case(prefix)
    } else {
        pattern.eq_ignore_ascii_case(mnemonic)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use weft_isa::decode;

    fn inst(bytes: &[u8], pc: u64) -> DecodedInst {
        decode(bytes, pc).expect("decode")
    }

    #[test]
    fn test_true_and_address() {
        let i = inst(&[0xc3], 0x1000);
        assert!(PatchCondition::True.matches(&i));
        assert!(PatchCondition::AddressIs(0x1000).matches(&i));
        assert!(!PatchCondition::AddressIs(0x1001).matches(&i));
    }

    #[test]
    fn test_mnemonic_wildcard() {
        let je = inst(&[0x74, 0x02], 0);
        assert!(PatchCondition::MnemonicIs("je".into()).matches(&je));
        assert!(PatchCondition::MnemonicIs("JE".into()).matches(&je));
        assert!(PatchCondition::MnemonicIs("j*".into()).matches(&je));
        assert!(!PatchCondition::MnemonicIs("jmp".into()).matches(&je));
        assert!(PatchCondition::MnemonicIs("*".into()).matches(&je));
    }

    #[test]
    fn test_range_condition() {
        let i = inst(&[0x90], 0x2000);
        let r = PatchCondition::InstructionInRange(Range::new(0x2000, 0x3000));
        assert!(r.matches(&i));
        let r = PatchCondition::InstructionInRange(Range::new(0x2001, 0x3000));
        assert!(!r.matches(&i));
    }

    #[test]
    fn test_access_conditions() {
        // mov rax, [rbx] reads
        let load = inst(&[0x48, 0x8b, 0x03], 0);
        assert!(PatchCondition::DoesReadAccess.matches(&load));
        assert!(!PatchCondition::DoesWriteAccess.matches(&load));

        // mov [rbx], rax writes
        let store = inst(&[0x48, 0x89, 0x03], 0);
        assert!(PatchCondition::DoesWriteAccess.matches(&store));
        assert!(!PatchCondition::DoesReadAccess.matches(&store));

        // push rax writes through rsp
        let push = inst(&[0x50], 0);
        assert!(PatchCondition::DoesWriteAccess.matches(&push));

        // add [rbx], rax reads and writes
        let rmw = inst(&[0x48, 0x01, 0x03], 0);
        assert!(PatchCondition::DoesReadAccess.matches(&rmw));
        assert!(PatchCondition::DoesWriteAccess.matches(&rmw));

        // mov rax, rbx touches no memory
        let mov = inst(&[0x48, 0x89, 0xd8], 0);
        assert!(!PatchCondition::DoesReadAccess.matches(&mov));
        assert!(!PatchCondition::DoesWriteAccess.matches(&mov));
    }

    #[test]
    fn test_combinators() {
        let i = inst(&[0x48, 0x8b, 0x03], 0x1000);
        let both = PatchCondition::And(vec![
            PatchCondition::DoesReadAccess,
            PatchCondition::AddressIs(0x1000),
        ]);
        assert!(both.matches(&i));
        let either = PatchCondition::Or(vec![
            PatchCondition::DoesWriteAccess,
            PatchCondition::AddressIs(0x1000),
        ]);
        assert!(either.matches(&i));
        let neither = PatchCondition::Or(vec![
            PatchCondition::DoesWriteAccess,
            PatchCondition::AddressIs(0x2000),
        ]);
        assert!(!neither.matches(&i));
    }
}
