//! Thin wrappers over the memory-related system calls the protected pool needs.
//!
//! Only Unix-like targets are supported: the worker relies on `mmap`, `mlock`
//! and `madvise(MADV_DONTDUMP)` to keep the private key out of swap and core dumps.

use log::debug;
use once_cell::sync::Lazy;
use std::ptr::{self, NonNull};
use thiserror::Error;
use zeroize::Zeroize;

/// Errors that can occur during memory-related system calls.
#[derive(Error, Debug)]
pub enum MemcallError {
    /// The system call failed; the message carries `errno` as rendered by the OS.
    #[error("system call failed: {0}")]
    SystemError(String),

    /// Invalid arguments were provided to the operation.
    #[error("invalid arguments: {0}")]
    InvalidArgument(String),
}

type Result<T> = std::result::Result<T, MemcallError>;

pub(crate) static PAGE_SIZE: Lazy<usize> = Lazy::new(page_size::get);

/// Memory protection flags accepted by [`protect`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryProtection {
    #[cfg_attr(not(test), allow(dead_code))]
    NoAccess,
    #[cfg_attr(not(test), allow(dead_code))]
    ReadOnly,
    ReadWrite,
}

/// Rounds `size` up to a whole number of pages.
pub(crate) fn round_to_page_size(size: usize) -> usize {
    let remainder = size % *PAGE_SIZE;
    if remainder == 0 {
        size
    } else {
        size + (*PAGE_SIZE - remainder)
    }
}

/// A page-aligned anonymous mapping. The mapping is never handed out as a
/// `&'static mut` slice; callers go through [`Region::as_slice`] / [`Region::as_mut_slice`].
pub(crate) struct Region {
    ptr: NonNull<u8>,
    len: usize,
}

// The region is exclusively owned; access is serialized by its owner.
unsafe impl Send for Region {}
unsafe impl Sync for Region {}

impl Region {
    pub(crate) fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    pub(crate) fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }

    fn as_void(&self) -> *mut libc::c_void {
        self.ptr.as_ptr().cast::<libc::c_void>()
    }
}

fn last_os_error() -> String {
    std::io::Error::last_os_error().to_string()
}

/// Maps a new zero-filled read/write region of at least `size` bytes.
pub(crate) fn alloc(size: usize) -> Result<Region> {
    if size == 0 {
        return Err(MemcallError::InvalidArgument(
            "cannot map an empty region".into(),
        ));
    }
    let len = round_to_page_size(size);
    let raw = unsafe {
        libc::mmap(
            ptr::null_mut(),
            len,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANON,
            -1,
            0,
        )
    };
    if raw == libc::MAP_FAILED {
        return Err(MemcallError::SystemError(format!(
            "could not allocate {} bytes [Err: {}]",
            len,
            last_os_error()
        )));
    }
    let ptr = NonNull::new(raw.cast::<u8>()).ok_or_else(|| {
        MemcallError::SystemError("mmap returned a null mapping".into())
    })?;
    let mut region = Region { ptr, len };
    region.as_mut_slice().zeroize();
    debug!("memcall: mapped {} bytes", len);
    Ok(region)
}

/// Changes the protection of the whole region.
pub(crate) fn protect(region: &Region, protection: MemoryProtection) -> Result<()> {
    let prot = match protection {
        MemoryProtection::NoAccess => libc::PROT_NONE,
        MemoryProtection::ReadOnly => libc::PROT_READ,
        MemoryProtection::ReadWrite => libc::PROT_READ | libc::PROT_WRITE,
    };
    let result = unsafe { libc::mprotect(region.as_void(), region.len, prot) };
    if result != 0 {
        return Err(MemcallError::SystemError(format!(
            "could not set {:?} on {:p} [Err: {}]",
            protection,
            region.ptr,
            last_os_error()
        )));
    }
    Ok(())
}

/// Locks the region into RAM and, on Linux, excludes it from core dumps.
pub(crate) fn lock(region: &Region) -> Result<()> {
    #[cfg(target_os = "linux")]
    unsafe {
        libc::madvise(region.as_void(), region.len, libc::MADV_DONTDUMP);
    }

    let result = unsafe { libc::mlock(region.as_void(), region.len) };
    if result != 0 {
        return Err(MemcallError::SystemError(format!(
            "could not acquire lock on {:p}, limit reached? [Err: {}]",
            region.ptr,
            last_os_error()
        )));
    }
    Ok(())
}

pub(crate) fn unlock(region: &Region) -> Result<()> {
    let result = unsafe { libc::munlock(region.as_void(), region.len) };
    if result != 0 {
        return Err(MemcallError::SystemError(format!(
            "could not free lock on {:p} [Err: {}]",
            region.ptr,
            last_os_error()
        )));
    }
    Ok(())
}

/// Wipes and unmaps the region.
pub(crate) fn free(mut region: Region) -> Result<()> {
    protect(&region, MemoryProtection::ReadWrite)?;
    region.as_mut_slice().zeroize();
    let result = unsafe { libc::munmap(region.as_void(), region.len) };
    if result != 0 {
        return Err(MemcallError::SystemError(format!(
            "could not deallocate {:p} [Err: {}]",
            region.ptr,
            last_os_error()
        )));
    }
    Ok(())
}

/// Disables creation of core dump files for the current process.
pub fn disable_core_dumps() -> Result<()> {
    let rlimit = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    let result = unsafe { libc::setrlimit(libc::RLIMIT_CORE, &rlimit) };
    if result != 0 {
        return Err(MemcallError::SystemError(format!(
            "could not set rlimit [Err: {}]",
            last_os_error()
        )));
    }
    Ok(())
}
