//! Fixed-address huge-page registered memory.
//!
//! The switch writes every worker's aggregation buffer through the same
//! remote address, so each worker must map its region at an identical
//! virtual address. Huge pages keep the region physically contiguous
//! enough for the NIC; if none are available the mapping falls back to
//! normal pages and is locked instead.

use crate::error::{RdmaError, Result};
use std::os::raw::c_int;

const HUGE_PAGE_SIZE: usize = 2 * 1024 * 1024;

/// A host memory region mapped at a caller-chosen virtual address and
/// registered with the NIC for remote write.
pub struct PinnedRegion {
    mr: *mut ibverbs_sys::ibv_mr,
    addr: *mut u8,
    len: usize,
}

unsafe impl Send for PinnedRegion {}
unsafe impl Sync for PinnedRegion {}

impl PinnedRegion {
    pub(crate) fn map_and_register(
        pd: *mut ibverbs_sys::ibv_pd,
        addr: usize,
        len: usize,
    ) -> Result<Self> {
        // Round up to whole huge pages.
        let map_len = (len + HUGE_PAGE_SIZE - 1) & !(HUGE_PAGE_SIZE - 1);

        unsafe {
            let mut buf = libc::mmap(
                addr as *mut libc::c_void,
                map_len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_HUGETLB | libc::MAP_FIXED,
                -1,
                0,
            );
            if buf == libc::MAP_FAILED {
                tracing::warn!(
                    addr,
                    len = map_len,
                    "huge-page mapping failed, falling back to locked normal pages"
                );
                buf = libc::mmap(
                    addr as *mut libc::c_void,
                    map_len,
                    libc::PROT_READ | libc::PROT_WRITE,
                    libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_FIXED,
                    -1,
                    0,
                );
                if buf == libc::MAP_FAILED {
                    return Err(RdmaError::Io(std::io::Error::last_os_error()));
                }
                if libc::mlock(buf, map_len) != 0 {
                    let err = std::io::Error::last_os_error();
                    libc::munmap(buf, map_len);
                    return Err(RdmaError::Io(err));
                }
            }
            if buf as usize != addr {
                libc::munmap(buf, map_len);
                return Err(RdmaError::Setup(format!(
                    "mapping landed at {:#x}, requested {addr:#x}",
                    buf as usize
                )));
            }

            let access = ibverbs_sys::ibv_access_flags::IBV_ACCESS_LOCAL_WRITE
                | ibverbs_sys::ibv_access_flags::IBV_ACCESS_REMOTE_WRITE;
            let mr = ibverbs_sys::ibv_reg_mr(pd, buf, map_len, access.0 as c_int);
            if mr.is_null() {
                libc::munmap(buf, map_len);
                return Err(RdmaError::Setup(format!(
                    "ibv_reg_mr failed for {map_len} bytes at {addr:#x}"
                )));
            }

            tracing::debug!(addr, len = map_len, "registered fixed-address region");

            Ok(Self {
                mr,
                addr: buf as *mut u8,
                len: map_len,
            })
        }
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.addr
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn lkey(&self) -> u32 {
        unsafe { (*self.mr).lkey }
    }

    pub fn rkey(&self) -> u32 {
        unsafe { (*self.mr).rkey }
    }
}

impl Drop for PinnedRegion {
    fn drop(&mut self) {
        unsafe {
            if !self.mr.is_null() {
                ibverbs_sys::ibv_dereg_mr(self.mr);
            }
            if !self.addr.is_null() {
                libc::munmap(self.addr as *mut libc::c_void, self.len);
            }
        }
    }
}
