//! Guest general-purpose register file.
//!
//! Layout must match the displacements baked into emitted code exactly;
//! the prologue/epilogue and every context access in a patch address
//! these fields by constant offset.

use weft_isa::Reg;

/// Guest general-purpose architectural state.
///
/// At every host/guest boundary this reflects the guest's registers as
/// if the original (uninstrumented) code had executed.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GprState {
    pub rax: u64,
    pub rbx: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rbp: u64,
    pub rsp: u64,
    pub rip: u64,
    pub eflags: u64,
}

/// Default eflags value: reserved bit 1 and IF set.
pub const EFLAGS_DEFAULT: u64 = 0x202;

impl GprState {
    pub const fn new() -> Self {
        Self {
            rax: 0,
            rbx: 0,
            rcx: 0,
            rdx: 0,
            rsi: 0,
            rdi: 0,
            r8: 0,
            r9: 0,
            r10: 0,
            r11: 0,
            r12: 0,
            r13: 0,
            r14: 0,
            r15: 0,
            rbp: 0,
            rsp: 0,
            rip: 0,
            eflags: EFLAGS_DEFAULT,
        }
    }

    /// Byte offset of a register's slot within the struct.
    pub const fn reg_offset(reg: Reg) -> usize {
        match reg {
            Reg::Rax => std::mem::offset_of!(GprState, rax),
            Reg::Rbx => std::mem::offset_of!(GprState, rbx),
            Reg::Rcx => std::mem::offset_of!(GprState, rcx),
            Reg::Rdx => std::mem::offset_of!(GprState, rdx),
            Reg::Rsi => std::mem::offset_of!(GprState, rsi),
            Reg::Rdi => std::mem::offset_of!(GprState, rdi),
            Reg::R8 => std::mem::offset_of!(GprState, r8),
            Reg::R9 => std::mem::offset_of!(GprState, r9),
            Reg::R10 => std::mem::offset_of!(GprState, r10),
            Reg::R11 => std::mem::offset_of!(GprState, r11),
            Reg::R12 => std::mem::offset_of!(GprState, r12),
            Reg::R13 => std::mem::offset_of!(GprState, r13),
            Reg::R14 => std::mem::offset_of!(GprState, r14),
            Reg::R15 => std::mem::offset_of!(GprState, r15),
            Reg::Rbp => std::mem::offset_of!(GprState, rbp),
            Reg::Rsp => std::mem::offset_of!(GprState, rsp),
        }
    }

    pub const fn get(&self, reg: Reg) -> u64 {
        match reg {
            Reg::Rax => self.rax,
            Reg::Rbx => self.rbx,
            Reg::Rcx => self.rcx,
            Reg::Rdx => self.rdx,
            Reg::Rsi => self.rsi,
            Reg::Rdi => self.rdi,
            Reg::R8 => self.r8,
            Reg::R9 => self.r9,
            Reg::R10 => self.r10,
            Reg::R11 => self.r11,
            Reg::R12 => self.r12,
            Reg::R13 => self.r13,
            Reg::R14 => self.r14,
            Reg::R15 => self.r15,
            Reg::Rbp => self.rbp,
            Reg::Rsp => self.rsp,
        }
    }

    pub fn set(&mut self, reg: Reg, value: u64) {
        match reg {
            Reg::Rax => self.rax = value,
            Reg::Rbx => self.rbx = value,
            Reg::Rcx => self.rcx = value,
            Reg::Rdx => self.rdx = value,
            Reg::Rsi => self.rsi = value,
            Reg::Rdi => self.rdi = value,
            Reg::R8 => self.r8 = value,
            Reg::R9 => self.r9 = value,
            Reg::R10 => self.r10 = value,
            Reg::R11 => self.r11 = value,
            Reg::R12 => self.r12 = value,
            Reg::R13 => self.r13 = value,
            Reg::R14 => self.r14 = value,
            Reg::R15 => self.r15 = value,
            Reg::Rbp => self.rbp = value,
            Reg::Rsp => self.rsp = value,
        }
    }
}

impl Default for GprState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use memoffset::offset_of;

    #[test]
    fn test_gpr_layout() {
        // Displacements baked into emitted code depend on this exact layout.
        assert_eq!(offset_of!(GprState, rax), 0);
        assert_eq!(offset_of!(GprState, rbx), 8);
        assert_eq!(offset_of!(GprState, rcx), 16);
        assert_eq!(offset_of!(GprState, rdx), 24);
        assert_eq!(offset_of!(GprState, rsi), 32);
        assert_eq!(offset_of!(GprState, rdi), 40);
        assert_eq!(offset_of!(GprState, r8), 48);
        assert_eq!(offset_of!(GprState, r15), 104);
        assert_eq!(offset_of!(GprState, rbp), 112);
        assert_eq!(offset_of!(GprState, rsp), 120);
        assert_eq!(offset_of!(GprState, rip), 128);
        assert_eq!(offset_of!(GprState, eflags), 136);
        assert_eq!(std::mem::size_of::<GprState>(), 144);
    }

    #[test]
    fn test_reg_offset_matches_fields() {
        assert_eq!(GprState::reg_offset(Reg::Rax), offset_of!(GprState, rax));
        assert_eq!(GprState::reg_offset(Reg::Rsp), offset_of!(GprState, rsp));
        assert_eq!(GprState::reg_offset(Reg::R11), offset_of!(GprState, r11));
    }

    #[test]
    fn test_get_set_roundtrip() {
        let mut gpr = GprState::new();
        assert_eq!(gpr.eflags, EFLAGS_DEFAULT);
        for reg in Reg::ALL {
            gpr.set(reg, 0x1000 + reg.index() as u64);
        }
        for reg in Reg::ALL {
            assert_eq!(gpr.get(reg), 0x1000 + reg.index() as u64);
        }
    }
}
