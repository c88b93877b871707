//! Executable memory management using mmap.
//!
//! The JIT writes finished machine code into a page-aligned mapping that is
//! writable during emission and flipped to read+execute before the first
//! call (W^X platforms require the flip).

use std::ptr::NonNull;

/// Error type for memory operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryError {
    AllocationFailed,
    ProtectionFailed,
    InvalidSize,
    WriteAfterFreeze,
}

impl std::fmt::Display for MemoryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MemoryError::AllocationFailed => write!(f, "memory allocation failed"),
            MemoryError::ProtectionFailed => write!(f, "memory protection change failed"),
            MemoryError::InvalidSize => write!(f, "invalid memory size"),
            MemoryError::WriteAfterFreeze => write!(f, "memory is already executable"),
        }
    }
}

impl std::error::Error for MemoryError {}

/// A block of page-aligned memory allocated via mmap.
///
/// Initially writable and not executable; `make_executable` freezes it.
#[derive(Debug)]
pub struct ExecutableMemory {
    ptr: NonNull<u8>,
    size: usize,
    executable: bool,
}

impl ExecutableMemory {
    /// Allocate a writable block of at least `size` bytes, rounded up to
    /// whole pages.
    pub fn new(size: usize) -> Result<Self, MemoryError> {
        if size == 0 {
            return Err(MemoryError::InvalidSize);
        }

        let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize };
        let aligned_size = (size + page_size - 1) & !(page_size - 1);

        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                aligned_size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(MemoryError::AllocationFailed);
        }

        let ptr = NonNull::new(ptr as *mut u8).ok_or(MemoryError::AllocationFailed)?;
        Ok(Self {
            ptr,
            size: aligned_size,
            executable: false,
        })
    }

    /// Copy `code` to the start of the block.
    pub fn write(&mut self, code: &[u8]) -> Result<(), MemoryError> {
        if self.executable {
            return Err(MemoryError::WriteAfterFreeze);
        }
        if code.len() > self.size {
            return Err(MemoryError::InvalidSize);
        }

        unsafe {
            std::ptr::copy_nonoverlapping(code.as_ptr(), self.ptr.as_ptr(), code.len());
        }
        Ok(())
    }

    /// Flip the block to read+execute. No further writes are possible.
    pub fn make_executable(&mut self) -> Result<(), MemoryError> {
        if self.executable {
            return Ok(());
        }

        let result = unsafe {
            libc::mprotect(
                self.ptr.as_ptr() as *mut libc::c_void,
                self.size,
                libc::PROT_READ | libc::PROT_EXEC,
            )
        };
        if result != 0 {
            return Err(MemoryError::ProtectionFailed);
        }

        self.executable = true;
        Ok(())
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn is_executable(&self) -> bool {
        self.executable
    }
}

impl Drop for ExecutableMemory {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.ptr.as_ptr() as *mut libc::c_void, self.size);
        }
    }
}

// The mapping is exclusively owned; sending it to another thread is fine.
unsafe impl Send for ExecutableMemory {}
