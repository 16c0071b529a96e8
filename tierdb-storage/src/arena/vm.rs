//! Virtual address management on top of raw `mmap`/`munmap`.

use std::fs::File;
use std::io;
use std::os::unix::io::AsRawFd;
use std::ptr;

use tierdb_core::utils::{align_up, is_power_of_two};
use tierdb_core::{Error, Result};

use super::types::PAGE_SIZE;

/// Refuses to clobber an existing mapping where the kernel supports it.
#[cfg(target_os = "linux")]
const MAP_FIXED_FLAG: libc::c_int = libc::MAP_FIXED_NOREPLACE;
#[cfg(not(target_os = "linux"))]
const MAP_FIXED_FLAG: libc::c_int = libc::MAP_FIXED;

/// Find an `alignment`-aligned range of `size` bytes that is unmapped right now.
///
/// The range is reserved with a read-only anonymous mapping and released before
/// returning, so another mapping may claim it before the caller binds it.
pub(crate) fn reserve_address(size: usize, alignment: usize) -> Result<usize> {
    if !is_power_of_two(alignment) {
        return Err(Error::InvalidArgument {
            message: format!("alignment {} is not a power of two", alignment),
        });
    }
    if size == 0 {
        return Err(Error::InvalidArgument {
            message: "cannot reserve an empty address range".to_string(),
        });
    }

    let span = size + alignment;
    // SAFETY: a fresh anonymous mapping chosen by the kernel aliases nothing.
    let p = unsafe {
        libc::mmap(
            ptr::null_mut(),
            span,
            libc::PROT_READ,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        )
    };
    if p == libc::MAP_FAILED {
        let e = io::Error::last_os_error();
        return Err(Error::Io {
            message: format!("reserving {} bytes of address space: {}", span, e),
            source: e,
        });
    }

    let base = p as usize;
    // SAFETY: `p..p+span` is exactly the mapping created above.
    unsafe {
        libc::munmap(p, span);
    }
    Ok(align_up(base, alignment))
}

/// Map the whole page file at exactly `addr`, shared and writable.
pub(crate) fn map_page_fixed(file: &File, addr: usize) -> Result<()> {
    // SAFETY: MAP_FIXED_NOREPLACE fails instead of replacing an existing mapping;
    // the file is one page long.
    let ret = unsafe {
        libc::mmap(
            addr as *mut libc::c_void,
            PAGE_SIZE,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED | MAP_FIXED_FLAG,
            file.as_raw_fd(),
            0,
        )
    };

    if ret == libc::MAP_FAILED {
        let e = io::Error::last_os_error();
        if e.raw_os_error() == Some(libc::EEXIST) {
            return Err(Error::AddressRace { addr });
        }
        return Err(Error::Io {
            message: format!("mapping page at {:#x}: {}", addr, e),
            source: e,
        });
    }

    if ret as usize != addr {
        // Kernels without MAP_FIXED_NOREPLACE treat the address as a hint.
        // SAFETY: `ret` is the page mapping that was just created.
        unsafe {
            libc::munmap(ret, PAGE_SIZE);
        }
        return Err(Error::AddressRace { addr });
    }
    Ok(())
}

pub(crate) fn unmap_range(addr: usize, len: usize) {
    if len == 0 {
        return;
    }
    // SAFETY: callers only pass ranges the arena mapped itself.
    let rc = unsafe { libc::munmap(addr as *mut libc::c_void, len) };
    if rc != 0 {
        tracing::warn!(
            addr = %format!("{:#x}", addr),
            len,
            error = %io::Error::last_os_error(),
            "munmap failed"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reserved_address_is_aligned() {
        let addr = reserve_address(3 * PAGE_SIZE, PAGE_SIZE).unwrap();
        assert_eq!(addr % PAGE_SIZE, 0);
        assert_ne!(addr, 0);
    }

    #[test]
    fn test_rejects_bad_arguments() {
        assert!(reserve_address(PAGE_SIZE, 3).is_err());
        assert!(reserve_address(0, PAGE_SIZE).is_err());
    }
}
