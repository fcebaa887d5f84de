//! Guest floating-point and SIMD state.
//!
//! The layout is the 512-byte `fxsave64` image; the block prologue and
//! epilogue restore and save it with a single instruction each.

/// Guest FPU/SSE architectural state (`fxsave64` image).
#[repr(C, align(16))]
#[derive(Clone, Copy)]
pub struct FprState {
    pub fcw: u16,
    pub fsw: u16,
    pub ftw: u8,
    _reserved0: u8,
    pub fop: u16,
    pub fip: u64,
    pub fdp: u64,
    pub mxcsr: u32,
    pub mxcsr_mask: u32,
    /// x87 stack registers, 16 bytes per slot.
    pub st: [[u8; 16]; 8],
    /// XMM registers.
    pub xmm: [[u8; 16]; 16],
    _reserved1: [u8; 96],
}

/// Default x87 control word: all exceptions masked, 64-bit precision.
pub const FCW_DEFAULT: u16 = 0x037f;

/// Default MXCSR: all exceptions masked, round to nearest.
pub const MXCSR_DEFAULT: u32 = 0x1f80;

impl FprState {
    pub const fn new() -> Self {
        Self {
            fcw: FCW_DEFAULT,
            fsw: 0,
            ftw: 0,
            _reserved0: 0,
            fop: 0,
            fip: 0,
            fdp: 0,
            mxcsr: MXCSR_DEFAULT,
            mxcsr_mask: 0,
            st: [[0; 16]; 8],
            xmm: [[0; 16]; 16],
            _reserved1: [0; 96],
        }
    }

    pub fn xmm(&self, n: usize) -> &[u8; 16] {
        &self.xmm[n]
    }

    pub fn set_xmm(&mut self, n: usize, value: [u8; 16]) {
        self.xmm[n] = value;
    }
}

impl Default for FprState {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for FprState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FprState")
            .field("fcw", &self.fcw)
            .field("fsw", &self.fsw)
            .field("mxcsr", &self.mxcsr)
            .finish_non_exhaustive()
    }
}
