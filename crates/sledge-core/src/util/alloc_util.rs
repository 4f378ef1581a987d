use std::io;

/// Unmap memory
///
/// # Safety
/// * `addr` must be a valid pointer to a memory region previously allocated by `mmap`
/// * `len` must be less than or equal the length of that region
pub unsafe fn munmap<P>(addr: *mut P, len: usize) {
    let r = unsafe { libc::munmap(addr as *mut libc::c_void, len) };
    assert_eq!(
        r,
        0,
        "munmap({:x}, {}): {}",
        addr as usize,
        len,
        io::Error::last_os_error()
    );
}

/// Maps anonymous read/write pages intended to hold jitted code.
///
/// The pages start writable; call [`protect_exec`] after copying the code
/// to drop the write permission.
pub fn mmap_code(len: usize) -> Result<*mut u8, io::Error> {
    use libc::{MAP_ANONYMOUS, MAP_PRIVATE, PROT_READ, PROT_WRITE};

    let v = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            len,
            PROT_READ | PROT_WRITE,
            MAP_PRIVATE | MAP_ANONYMOUS,
            -1,
            0,
        )
    };
    if v == libc::MAP_FAILED {
        return Err(io::Error::last_os_error());
    }
    Ok(v as *mut u8)
}

/// Remaps code pages read/execute.
///
/// # Safety
/// `addr`/`len` must denote a region previously returned by [`mmap_code`].
pub unsafe fn protect_exec(addr: *mut u8, len: usize) -> Result<(), io::Error> {
    let r = unsafe { libc::mprotect(addr as *mut libc::c_void, len, libc::PROT_READ | libc::PROT_EXEC) };
    if r != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}
