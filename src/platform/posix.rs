// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// POSIX mapping primitives for channel segments.
//
// The controller owns segment creation; the application side only maps a
// descriptor it received over the control socket. The memfd helper exists
// for the in-process mirror of the controller's layout step (tests,
// benchmarks, mock controllers).

use std::ffi::CString;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

/// Check that `fd` refers to an open descriptor.
pub fn check_fd(fd: RawFd) -> io::Result<()> {
    if unsafe { libc::fcntl(fd, libc::F_GETFD) } == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Size of the object behind `fd`.
pub fn fd_size(fd: RawFd) -> io::Result<usize> {
    let mut stat: libc::stat = unsafe { std::mem::zeroed() };
    if unsafe { libc::fstat(fd, &mut stat) } == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(stat.st_size as usize)
}

/// Map `len` bytes of `fd` read/write, shared and populated, huge-page
/// backed when the kernel allows it.
///
/// Segments created with plain memfd or shm_open are not huge-page backed,
/// so a failed MAP_HUGETLB attempt falls back to a normal mapping.
pub fn map_shared(fd: RawFd, len: usize) -> io::Result<*mut u8> {
    let base_flags = libc::MAP_SHARED | libc::MAP_POPULATE;

    let mem = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            len,
            libc::PROT_READ | libc::PROT_WRITE,
            base_flags | libc::MAP_HUGETLB,
            fd,
            0,
        )
    };
    if mem != libc::MAP_FAILED {
        return Ok(mem as *mut u8);
    }

    log::debug!("huge-page mapping unavailable, falling back to regular pages");
    let mem = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            len,
            libc::PROT_READ | libc::PROT_WRITE,
            base_flags,
            fd,
            0,
        )
    };
    if mem == libc::MAP_FAILED {
        return Err(io::Error::last_os_error());
    }
    Ok(mem as *mut u8)
}

/// Unmap a region returned by [`map_shared`].
///
/// # Safety
/// `ptr`/`len` must describe a live mapping and nothing may reference it
/// afterwards.
pub unsafe fn unmap(ptr: *mut u8, len: usize) {
    libc::munmap(ptr as *mut libc::c_void, len);
}

/// Create an anonymous memory segment of `len` bytes.
pub fn memfd_segment(name: &str, len: usize) -> io::Result<OwnedFd> {
    let c_name = CString::new(name).map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    let fd = unsafe { libc::memfd_create(c_name.as_ptr(), 0) };
    if fd == -1 {
        return Err(io::Error::last_os_error());
    }
    let fd = unsafe { OwnedFd::from_raw_fd(fd) };
    if unsafe { libc::ftruncate(fd.as_raw_fd(), len as libc::off_t) } == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(fd)
}
