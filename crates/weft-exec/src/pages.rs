//! Page-pair allocation for ExecBlocks.
//!
//! Each block owns one anonymous mapping split into a code region and a
//! data region. The code region flips between RW (translation) and RX
//! (execution); the data region, which holds the `Context`, stays RW.

use std::ffi::c_void;
use std::num::NonZeroUsize;
use std::ptr::NonNull;

use nix::sys::mman::{mmap_anonymous, mprotect, munmap, MapFlags, ProtFlags};
use thiserror::Error;

/// Page allocation and protection errors.
#[derive(Debug, Error)]
pub enum PageError {
    #[error("mmap failed: {0}")]
    MmapFailed(#[from] nix::Error),

    #[error("invalid page count")]
    InvalidSize,
}

/// Host page size.
pub fn page_size() -> usize {
    // SAFETY: sysconf(_SC_PAGESIZE) has no preconditions.
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size > 0 {
        size as usize
    } else {
        4096
    }
}

/// Instruction-cache synchronisation point after code writes.
///
/// x86-64 keeps instruction fetch coherent with data writes; the jump
/// into freshly written code is the only serialisation needed.
pub fn flush_icache(_start: *const u8, _len: usize) {}

/// An RW/RX page pair backing one ExecBlock.
pub struct ExecPages {
    region: NonNull<c_void>,
    code_size: usize,
    data_size: usize,
}

impl ExecPages {
    /// Map `code_pages + data_pages` anonymous pages, all RW.
    pub fn new(code_pages: usize, data_pages: usize) -> Result<Self, PageError> {
        if code_pages == 0 || data_pages == 0 {
            return Err(PageError::InvalidSize);
        }
        let page = page_size();
        let code_size = code_pages * page;
        let data_size = data_pages * page;
        let total = NonZeroUsize::new(code_size + data_size).ok_or(PageError::InvalidSize)?;

        // SAFETY: anonymous private mapping, no address hint.
        let region = unsafe {
            mmap_anonymous(
                None,
                total,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_PRIVATE,
            )?
        };

        Ok(Self {
            region,
            code_size,
            data_size,
        })
    }

    pub fn code_ptr(&self) -> *mut u8 {
        self.region.as_ptr().cast()
    }

    pub fn data_ptr(&self) -> *mut u8 {
        // SAFETY: data region starts right after the code region, inside
        // the same mapping.
        unsafe { self.code_ptr().add(self.code_size) }
    }

    pub fn code_size(&self) -> usize {
        self.code_size
    }

    pub fn data_size(&self) -> usize {
        self.data_size
    }

    /// Flip the code region to RX.
    pub fn make_code_exec(&self) -> Result<(), PageError> {
        // SAFETY: the region covers code_size bytes of our own mapping.
        unsafe {
            mprotect(
                self.region,
                self.code_size,
                ProtFlags::PROT_READ | ProtFlags::PROT_EXEC,
            )?;
        }
        flush_icache(self.code_ptr(), self.code_size);
        Ok(())
    }

    /// Flip the code region back to RW for translation.
    pub fn make_code_writable(&self) -> Result<(), PageError> {
        // SAFETY: as above.
        unsafe {
            mprotect(
                self.region,
                self.code_size,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
            )?;
        }
        Ok(())
    }
}

impl Drop for ExecPages {
    fn drop(&mut self) {
        // SAFETY: region/total match the original mapping.
        unsafe {
            let _ = munmap(self.region, self.code_size + self.data_size);
        }
    }
}

// ExecPages owns its mapping exclusively.
unsafe impl Send for ExecPages {}
