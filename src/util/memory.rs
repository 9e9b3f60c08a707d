use crate::util::Address;
use crate::vm::VirtualMemory;
use std::io::Result;

pub fn zero(start: Address, len: usize) {
    let ptr = start.to_mut_ptr();
    wrap_libc_call(&|| unsafe { libc::memset(ptr, 0, len) }, ptr).unwrap()
}

/// Reserve a range of address space without backing it with physical
/// memory. The range must be committed before use.
pub fn mmap_reserve(size: usize) -> Result<Address> {
    let prot = libc::PROT_NONE;
    let flags = libc::MAP_ANON | libc::MAP_PRIVATE | libc::MAP_NORESERVE;
    let ret = unsafe { libc::mmap(std::ptr::null_mut(), size, prot, flags, -1, 0) };
    if ret == libc::MAP_FAILED {
        Err(std::io::Error::last_os_error())
    } else {
        Ok(Address::from_mut_ptr(ret))
    }
}

/// Commit a previously reserved range. The committed memory is zeroed.
pub fn mmap_commit(start: Address, size: usize) -> Result<()> {
    wrap_libc_call(
        &|| unsafe {
            libc::mprotect(start.to_mut_ptr(), size, libc::PROT_READ | libc::PROT_WRITE)
        },
        0,
    )
}

/// Return a committed range to the reserved-but-uncommitted state.
pub fn mmap_uncommit(start: Address, size: usize) -> Result<()> {
    wrap_libc_call(
        &|| unsafe { libc::madvise(start.to_mut_ptr(), size, libc::MADV_DONTNEED) },
        0,
    )?;
    wrap_libc_call(
        &|| unsafe { libc::mprotect(start.to_mut_ptr(), size, libc::PROT_NONE) },
        0,
    )
}

pub fn try_munmap(start: Address, size: usize) -> Result<()> {
    wrap_libc_call(&|| unsafe { libc::munmap(start.to_mut_ptr(), size) }, 0)
}

fn wrap_libc_call<T: PartialEq>(f: &dyn Fn() -> T, expect: T) -> Result<()> {
    let ret = f();
    if ret == expect {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

/// [`VirtualMemory`] capability backed by anonymous mmap. This is the
/// implementation a hosting runtime would hand to the region allocator on a
/// POSIX system.
#[derive(Default)]
pub struct MmapMemory;

impl VirtualMemory for MmapMemory {
    fn reserve(&self, size: usize) -> Address {
        match mmap_reserve(size) {
            Ok(addr) => addr,
            Err(e) => {
                warn!("failed to reserve {} bytes: {}", size, e);
                Address::ZERO
            }
        }
    }

    fn commit(&self, start: Address, size: usize) -> bool {
        mmap_commit(start, size).is_ok()
    }

    fn uncommit(&self, start: Address, size: usize) -> bool {
        mmap_uncommit(start, size).is_ok()
    }

    fn release(&self, start: Address, size: usize) {
        let _ = try_munmap(start, size);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::constants::BYTES_IN_PAGE;

    #[test]
    fn reserve_commit_uncommit() {
        let size = 4 * BYTES_IN_PAGE;
        let start = mmap_reserve(size).unwrap();
        assert!(!start.is_zero());
        assert!(mmap_commit(start, size).is_ok());
        unsafe { start.store::<usize>(0xdead) };
        assert_eq!(unsafe { start.load::<usize>() }, 0xdead);
        assert!(mmap_uncommit(start, size).is_ok());
        assert!(try_munmap(start, size).is_ok());
    }
}
