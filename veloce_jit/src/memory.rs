//! Executable code pages with write-xor-execute handling.

use crate::error::Error::CodePageAllocation;
use crate::error::Result;
use std::ptr;

/// Page-aligned memory that holds generated code.
///
/// Pages are mapped writable, filled, and then flipped to read-execute; they are never writable
/// and executable at the same time. Publication to other threads happens through the protection
/// flip, which is a full barrier.
#[derive(Debug)]
pub(crate) struct ExecutableMemory {
    address: *mut u8,
    length: usize,
}

// the pages are immutable after `make_executable` and freed exactly once in `drop`
unsafe impl Send for ExecutableMemory {}
unsafe impl Sync for ExecutableMemory {}

impl ExecutableMemory {
    /// Maps writable pages large enough for `size` bytes of code.
    pub(crate) fn allocate(size: usize) -> Result<Self> {
        let page_size = usize::try_from(unsafe { libc::sysconf(libc::_SC_PAGESIZE) })
            .map_err(|error| CodePageAllocation(error.to_string()))?;
        let length = size.div_ceil(page_size).max(1) * page_size;
        let address = unsafe {
            libc::mmap(
                ptr::null_mut(),
                length,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if address == libc::MAP_FAILED {
            return Err(CodePageAllocation(format!(
                "mmap of {length} bytes failed"
            )));
        }
        Ok(ExecutableMemory {
            address: address.cast::<u8>(),
            length,
        })
    }

    /// Copies the code into the pages; only valid while still writable.
    pub(crate) fn write(&mut self, code: &[u8]) -> Result<()> {
        if code.len() > self.length {
            return Err(CodePageAllocation(format!(
                "code of {} bytes exceeds mapping of {} bytes",
                code.len(),
                self.length
            )));
        }
        unsafe {
            ptr::copy_nonoverlapping(code.as_ptr(), self.address, code.len());
        }
        Ok(())
    }

    /// Flips the pages from read-write to read-execute.
    pub(crate) fn make_executable(&mut self) -> Result<()> {
        let result = unsafe {
            libc::mprotect(
                self.address.cast::<libc::c_void>(),
                self.length,
                libc::PROT_READ | libc::PROT_EXEC,
            )
        };
        if result != 0 {
            return Err(CodePageAllocation("mprotect failed".to_string()));
        }
        Ok(())
    }

    pub(crate) fn as_ptr(&self) -> *const u8 {
        self.address
    }
}

impl Drop for ExecutableMemory {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.address.cast::<libc::c_void>(), self.length);
        }
    }
}
