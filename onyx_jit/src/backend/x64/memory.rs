//! Executable memory for compiled code and stubs.
//!
//! Buffers follow a write-then-execute lifecycle: allocated read-write
//! for emission, flipped to read-execute before the first run, and only
//! ever made writable again through the code patch buffer. Allocation
//! failure is the one recoverable compile error (the caller stays in the
//! interpreter), so `new` returns `Option` instead of aborting.

use std::ptr::NonNull;

// =============================================================================
// Platform layer
// =============================================================================

#[cfg(unix)]
mod platform {
    use std::ptr;

    pub const PAGE_SIZE: usize = 4096;

    /// Allocate read-write pages.
    pub unsafe fn alloc_rw(size: usize) -> *mut u8 {
        // SAFETY: anonymous private mapping with null hint is always valid.
        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            ptr::null_mut()
        } else {
            ptr as *mut u8
        }
    }

    /// Release pages.
    pub unsafe fn free(ptr: *mut u8, size: usize) {
        // SAFETY: caller passes a region obtained from alloc_rw.
        unsafe {
            libc::munmap(ptr as *mut _, size);
        }
    }

    /// Flip pages to read-execute.
    pub unsafe fn make_executable(ptr: *mut u8, size: usize) -> bool {
        // SAFETY: caller passes a mapped region.
        unsafe { libc::mprotect(ptr as *mut _, size, libc::PROT_READ | libc::PROT_EXEC) == 0 }
    }

    /// Flip pages to read-write.
    pub unsafe fn make_writable(ptr: *mut u8, size: usize) -> bool {
        // SAFETY: caller passes a mapped region.
        unsafe { libc::mprotect(ptr as *mut _, size, libc::PROT_READ | libc::PROT_WRITE) == 0 }
    }
}

#[cfg(windows)]
mod platform {
    use std::ptr;
    use windows_sys::Win32::System::Memory::{
        VirtualAlloc, VirtualFree, VirtualProtect, MEM_COMMIT, MEM_RELEASE, MEM_RESERVE,
        PAGE_EXECUTE_READ, PAGE_READWRITE,
    };

    pub const PAGE_SIZE: usize = 4096;

    pub unsafe fn alloc_rw(size: usize) -> *mut u8 {
        // SAFETY: null base address requests a fresh reservation.
        unsafe {
            VirtualAlloc(ptr::null(), size, MEM_COMMIT | MEM_RESERVE, PAGE_READWRITE) as *mut u8
        }
    }

    pub unsafe fn free(ptr: *mut u8, _size: usize) {
        // SAFETY: caller passes a region obtained from alloc_rw.
        unsafe {
            VirtualFree(ptr as *mut _, 0, MEM_RELEASE);
        }
    }

    pub unsafe fn make_executable(ptr: *mut u8, size: usize) -> bool {
        let mut old = 0;
        // SAFETY: caller passes a mapped region.
        unsafe { VirtualProtect(ptr as *mut _, size, PAGE_EXECUTE_READ, &mut old) != 0 }
    }

    pub unsafe fn make_writable(ptr: *mut u8, size: usize) -> bool {
        let mut old = 0;
        // SAFETY: caller passes a mapped region.
        unsafe { VirtualProtect(ptr as *mut _, size, PAGE_READWRITE, &mut old) != 0 }
    }
}

pub use platform::PAGE_SIZE;

// =============================================================================
// Executable Buffer
// =============================================================================

/// A page-aligned block of executable memory.
pub struct ExecutableBuffer {
    ptr: NonNull<u8>,
    capacity: usize,
    len: usize,
    is_executable: bool,
}

impl ExecutableBuffer {
    /// Allocate a buffer with at least `min_capacity` bytes, rounded up
    /// to whole pages. `None` means executable pages are exhausted.
    pub fn new(min_capacity: usize) -> Option<Self> {
        let capacity = align_to_page(min_capacity.max(PAGE_SIZE));
        // SAFETY: fresh allocation of a page-aligned size.
        let ptr = unsafe { platform::alloc_rw(capacity) };
        let ptr = NonNull::new(ptr)?;
        Some(ExecutableBuffer {
            ptr,
            capacity,
            len: 0,
            is_executable: false,
        })
    }

    /// Allocate a buffer and copy finished code into it. The buffer is
    /// left writable; callers finalize with `make_executable`.
    pub fn from_code(code: &[u8]) -> Option<Self> {
        let mut buffer = Self::new(code.len())?;
        buffer.emit_bytes(code);
        Some(buffer)
    }

    /// Bytes written so far.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Total allocated capacity.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Whether the buffer is currently executable.
    #[inline]
    pub fn is_executable(&self) -> bool {
        self.is_executable
    }

    /// Base address.
    #[inline]
    pub fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }

    /// Base address as an integer, for patch arithmetic.
    #[inline]
    pub fn base_addr(&self) -> usize {
        self.ptr.as_ptr() as usize
    }

    /// The written bytes.
    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: 0..len was written through emit_bytes.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    /// Append raw bytes.
    ///
    /// # Panics
    /// If the buffer is executable or full: both are compiler bugs.
    pub fn emit_bytes(&mut self, bytes: &[u8]) {
        assert!(!self.is_executable, "write to executable buffer");
        assert!(self.len + bytes.len() <= self.capacity, "buffer overflow");
        // SAFETY: bounds asserted above; region is writable.
        unsafe {
            std::ptr::copy_nonoverlapping(
                bytes.as_ptr(),
                self.ptr.as_ptr().add(self.len),
                bytes.len(),
            );
        }
        self.len += bytes.len();
    }

    /// Flip to read-execute. Idempotent.
    pub fn make_executable(&mut self) -> bool {
        if self.is_executable {
            return true;
        }
        // SAFETY: the whole capacity is one mapping we own.
        let ok = unsafe { platform::make_executable(self.ptr.as_ptr(), self.capacity) };
        if ok {
            self.is_executable = true;
        }
        ok
    }

    /// Flip to read-write. Only the code patch buffer calls this on
    /// installed code. Idempotent.
    pub fn make_writable(&mut self) -> bool {
        if !self.is_executable {
            return true;
        }
        // SAFETY: the whole capacity is one mapping we own.
        let ok = unsafe { platform::make_writable(self.ptr.as_ptr(), self.capacity) };
        if ok {
            self.is_executable = false;
        }
        ok
    }

    /// Entry point at a byte offset as a typed function pointer.
    ///
    /// # Safety
    /// The buffer must be executable and the code at `offset` must match
    /// the signature `F`.
    #[inline]
    pub unsafe fn as_fn_at<F: Copy>(&self, offset: usize) -> F {
        debug_assert!(self.is_executable, "buffer must be executable");
        debug_assert!(offset < self.len, "entry offset out of bounds");
        debug_assert_eq!(
            std::mem::size_of::<F>(),
            std::mem::size_of::<*const ()>(),
            "F must be a function pointer"
        );
        let ptr = unsafe { self.ptr.as_ptr().add(offset) };
        // SAFETY: caller guarantees signature compatibility.
        unsafe { std::mem::transmute_copy(&ptr) }
    }

    /// Entry point at offset 0.
    ///
    /// # Safety
    /// Same as `as_fn_at`.
    #[inline]
    pub unsafe fn as_fn<F: Copy>(&self) -> F {
        // SAFETY: forwarded contract.
        unsafe { self.as_fn_at(0) }
    }
}

impl Drop for ExecutableBuffer {
    fn drop(&mut self) {
        // SAFETY: ptr/capacity came from platform::alloc_rw.
        unsafe {
            platform::free(self.ptr.as_ptr(), self.capacity);
        }
    }
}

// SAFETY: the buffer owns its mapping; synchronization of patching is the
// caller's job (the patch lock in JitContext).
unsafe impl Send for ExecutableBuffer {}
unsafe impl Sync for ExecutableBuffer {}

#[inline]
const fn align_to_page(size: usize) -> usize {
    (size + PAGE_SIZE - 1) & !(PAGE_SIZE - 1)
}

// =============================================================================
// Raw region protection (for the code patch buffer)
// =============================================================================

#[inline]
fn page_span(addr: usize, len: usize) -> (usize, usize) {
    let start = addr & !(PAGE_SIZE - 1);
    let end = align_to_page(addr + len);
    (start, end - start)
}

/// Flip the pages covering `addr..addr+len` to read-write.
///
/// # Safety
/// The region must lie inside a live executable-memory mapping.
pub(crate) unsafe fn protect_region_writable(addr: usize, len: usize) -> bool {
    let (start, span) = page_span(addr, len);
    // SAFETY: caller guarantees the span is mapped.
    unsafe { platform::make_writable(start as *mut u8, span) }
}

/// Flip the pages covering `addr..addr+len` back to read-execute.
///
/// # Safety
/// The region must lie inside a live executable-memory mapping.
pub(crate) unsafe fn protect_region_executable(addr: usize, len: usize) -> bool {
    let (start, span) = page_span(addr, len);
    // SAFETY: caller guarantees the span is mapped.
    unsafe { platform::make_executable(start as *mut u8, span) }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocation_rounds_to_pages() {
        let buffer = ExecutableBuffer::new(1).expect("allocation failed");
        assert_eq!(buffer.capacity(), PAGE_SIZE);
        assert!(buffer.is_empty());
        assert!(!buffer.is_executable());
    }

    #[test]
    fn test_emit_and_read_back() {
        let mut buffer = ExecutableBuffer::new(64).expect("allocation failed");
        buffer.emit_bytes(&[0x90, 0xC3]);
        assert_eq!(buffer.len(), 2);
        assert_eq!(buffer.as_slice(), &[0x90, 0xC3]);
    }

    #[test]
    fn test_from_code() {
        let buffer = ExecutableBuffer::from_code(&[1, 2, 3, 4]).expect("allocation failed");
        assert_eq!(buffer.as_slice(), &[1, 2, 3, 4]);
        assert!(!buffer.is_executable());
    }

    #[test]
    fn test_permission_lifecycle() {
        let mut buffer = ExecutableBuffer::from_code(&[0xC3]).expect("allocation failed");
        assert!(buffer.make_executable());
        assert!(buffer.is_executable());
        assert!(buffer.make_executable());
        assert!(buffer.make_writable());
        assert!(!buffer.is_executable());
    }

    #[test]
    #[should_panic(expected = "write to executable buffer")]
    fn test_write_to_executable_is_fatal() {
        let mut buffer = ExecutableBuffer::from_code(&[0xC3]).expect("allocation failed");
        buffer.make_executable();
        buffer.emit_bytes(&[0x90]);
    }

    #[test]
    #[cfg(all(target_arch = "x86_64", any(unix, windows)))]
    fn test_execute_trivial_code() {
        // mov eax, 42; ret
        let mut buffer = ExecutableBuffer::from_code(&[0xB8, 0x2A, 0x00, 0x00, 0x00, 0xC3])
            .expect("allocation failed");
        assert!(buffer.make_executable());

        type F = unsafe extern "C" fn() -> i32;
        // SAFETY: buffer holds a complete C-ABI function.
        let f: F = unsafe { buffer.as_fn() };
        assert_eq!(unsafe { f() }, 42);
    }
}
