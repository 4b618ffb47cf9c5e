//! Tracee memory access. Reads and writes pick the cheapest tier that can
//! serve them: a tracer-local view of a shared mapping, the cached
//! /proc/<tid>/mem fd, and finally word-wise PTRACE_PEEKDATA/POKEDATA,
//! which also covers the window before the mem fd exists.

use crate::{
    address_space::memory_range::MemoryRange,
    bindings::ptrace::{PTRACE_PEEKDATA, PTRACE_POKEDATA},
    kernel_abi::syscalls,
    remote_ptr::{RemotePtr, Void},
    remote_syscalls::RemoteSyscalls,
    scoped_fd::ScopedFd,
    task::{PtraceData, Task, WriteFlags},
    util::{ceil_page_size, floor_page_size, pwrite_all_fallible},
};
use libc::{c_void, pread64, EPERM};
use nix::{
    errno::{errno, Errno},
    fcntl::OFlag,
    sys::mman::{MapFlags, ProtFlags},
};
use std::{
    cmp::min,
    ffi::CString,
    mem::{size_of, zeroed},
    ptr::copy_nonoverlapping,
    slice,
};

impl Task {
    /// Open /proc/<tid>/mem for our AddressSpace, closing any old fd
    /// first. Returns false if the process no longer exists.
    pub fn open_mem_fd(&mut self) -> bool {
        // Use ptrace for any access needed while switching fds.
        self.vm().set_mem_fd(ScopedFd::new());

        if !self.is_stopped {
            log!(
                crate::log::LogWarn,
                "Can't retrieve mem fd for {}; process not stopped, racing with exec?",
                self.tid
            );
            return false;
        }

        let path = format!("/proc/{}/mem", self.tid);
        let fd = ScopedFd::open_path(path.as_str(), OFlag::O_RDWR | OFlag::O_CLOEXEC);
        if !fd.is_open() {
            log!(
                crate::log::LogInfo,
                "Can't retrieve mem fd for {}; process no longer exists?",
                self.tid
            );
            return false;
        }
        self.vm().set_mem_fd(fd);
        true
    }

    pub fn open_mem_fd_if_needed(&mut self) {
        if !self.vm().mem_fd().is_open() {
            self.open_mem_fd();
        }
    }

    /// Read up to `buf.len()` bytes, returning how many were read.
    /// Err(()) only when nothing could be read at all and an error
    /// occurred.
    pub fn read_bytes_fallible(
        &mut self,
        addr: RemotePtr<Void>,
        buf: &mut [u8],
    ) -> Result<usize, ()> {
        if buf.is_empty() {
            return Ok(0);
        }

        if let Some(found) = self.vm().local_mapping(addr, buf.len()) {
            buf.copy_from_slice(&found[..buf.len()]);
            return Ok(buf.len());
        }

        if !self.vm().mem_fd().is_open() {
            return Ok(self.read_bytes_ptrace(addr, buf));
        }

        let mut all_read = 0;
        while all_read < buf.len() {
            Errno::clear();
            let mem_fd = self.vm().mem_fd().as_raw();
            let remaining = buf.len() - all_read;
            let nread: isize = unsafe {
                pread64(
                    mem_fd,
                    buf[all_read..].as_mut_ptr().cast::<c_void>(),
                    remaining,
                    (addr.as_usize() + all_read) as libc::off64_t,
                )
            };
            // The mem fd opened very early in an exec refers to the
            // address space before the exec; reads from it return 0 with
            // errno 0. Reopening gets us the post-exec address space.
            if 0 == nread && 0 == all_read && 0 == errno() {
                if !self.open_mem_fd() {
                    return Ok(0);
                }
                continue;
            }
            if nread <= 0 {
                if all_read > 0 {
                    // Some data was read; report success and swallow the
                    // error.
                    Errno::clear();
                    return Ok(all_read);
                }
                return Err(());
            }
            all_read += nread as usize;
        }

        Ok(all_read)
    }

    /// Read exactly `buf.len()` bytes. Shortfalls either set `*ok` to
    /// false or, without an `ok` out-parameter, are fatal.
    pub fn read_bytes_helper(
        &mut self,
        addr: RemotePtr<Void>,
        buf: &mut [u8],
        ok: Option<&mut bool>,
    ) {
        let result_nread = self.read_bytes_fallible(addr, buf);
        match result_nread {
            Ok(nread) if nread == buf.len() => (),
            _ => {
                let nread = result_nread.unwrap_or(0);
                match ok {
                    Some(ok) => *ok = false,
                    None => {
                        ed_assert!(
                            self,
                            false,
                            "Should have read {} bytes from {}, but only read {}",
                            buf.len(),
                            addr,
                            nread
                        );
                    }
                }
            }
        }
    }

    /// Read bytes or die.
    pub fn read_bytes(&mut self, addr: RemotePtr<Void>, buf: &mut [u8]) {
        self.read_bytes_helper(addr, buf, None)
    }

    /// Read the NUL-terminated string at `child_addr`. Reads page by page:
    /// only [child_addr, end-of-page) is guaranteed mapped, and the NUL
    /// may sit in the last mapped page.
    pub fn read_c_str(&mut self, child_addr: RemotePtr<u8>) -> CString {
        let mut p: RemotePtr<Void> = RemotePtr::cast(child_addr);
        let mut s: Vec<u8> = Vec::new();
        loop {
            let end_of_page: RemotePtr<Void> = ceil_page_size(p.as_usize() + 1).into();
            let nbytes = end_of_page - p;
            let mut buf = vec![0u8; nbytes];
            self.read_bytes_helper(p, &mut buf, None);
            match memchr::memchr(0, &buf) {
                Some(pos) => {
                    s.extend_from_slice(&buf[..pos]);
                    // No interior NULs by construction.
                    return unsafe { CString::from_vec_unchecked(s) };
                }
                None => {
                    s.extend_from_slice(&buf);
                    p = end_of_page;
                }
            }
        }
    }

    /// Write exactly `buf.len()` bytes through the tier hierarchy.
    pub fn write_bytes_helper(
        &mut self,
        addr: RemotePtr<Void>,
        buf: &[u8],
        ok: Option<&mut bool>,
        flags: WriteFlags,
    ) {
        if buf.is_empty() {
            return;
        }

        if let Some(local) = self.vm().local_mapping_mut(addr, buf.len()) {
            local[..buf.len()].copy_from_slice(buf);
            return;
        }

        if !self.vm().mem_fd().is_open() {
            let nwritten = self.write_bytes_ptrace(addr, buf);
            if nwritten > 0 {
                let vm = self.vm();
                vm.notify_written(self, addr, nwritten, flags);
            }
            if let Some(ok) = ok {
                if nwritten < buf.len() {
                    *ok = false;
                }
            }
            return;
        }

        Errno::clear();
        let nwritten_result = safe_pwrite64(self, buf, addr);
        // See the comment in read_bytes_fallible: a stale pre-exec mem fd
        // reads and writes as empty.
        if let Ok(0) = nwritten_result {
            self.open_mem_fd();
            return self.write_bytes_helper(addr, buf, ok, flags);
        }
        if errno() == EPERM {
            fatal!(
                "Can't write to /proc/{}/mem\n\
                 Maybe you need to disable grsecurity MPROTECT with:\n\
                 setfattr -n user.pax.flags -v 'emr' <executable>",
                self.tid
            );
        }

        let nwritten = nwritten_result.unwrap_or(0);
        match ok {
            Some(ok) => {
                if nwritten < buf.len() {
                    *ok = false;
                }
            }
            None => {
                ed_assert_eq!(
                    self,
                    nwritten,
                    buf.len(),
                    "Should have written {} bytes to {}, but only wrote {}",
                    buf.len(),
                    addr,
                    nwritten
                );
            }
        }
        if nwritten > 0 {
            let vm = self.vm();
            vm.notify_written(self, addr, nwritten, flags);
        }
    }

    /// Write bytes or die.
    pub fn write_bytes(&mut self, addr: RemotePtr<Void>, buf: &[u8]) {
        self.write_bytes_helper(addr, buf, None, WriteFlags::empty())
    }

    /// Read via PTRACE_PEEKDATA. Slow; the fallback of last resort.
    /// Returns the number of bytes actually read.
    pub(crate) fn read_bytes_ptrace(&self, addr: RemotePtr<Void>, buf: &mut [u8]) -> usize {
        let mut nread: usize = 0;
        // ptrace operates on the word size of the host. Only read aligned
        // words: that way we can always read the last byte before an
        // unmapped region.
        let word_size = size_of::<isize>();
        Errno::clear();
        while nread < buf.len() {
            let start = addr.as_usize() + nread;
            let start_word = start & !(word_size - 1);
            let length = min(start_word + word_size - start, buf.len() - nread);

            let v = self.fallible_ptrace(
                PTRACE_PEEKDATA,
                RemotePtr::new(start_word),
                &mut PtraceData::None,
            );
            if errno() != 0 {
                break;
            }
            unsafe {
                copy_nonoverlapping(
                    (&v as *const isize as *const u8).add(start - start_word),
                    buf.as_mut_ptr().add(nread),
                    length,
                );
            }
            nread += length;
        }
        nread
    }

    /// Write via PTRACE_POKEDATA, merging partial words with a preceding
    /// peek. Returns the number of bytes actually written.
    pub(crate) fn write_bytes_ptrace(&self, addr: RemotePtr<Void>, buf: &[u8]) -> usize {
        let mut nwritten: usize = 0;
        let word_size = size_of::<isize>();
        Errno::clear();
        while nwritten < buf.len() {
            let start = addr.as_usize() + nwritten;
            let start_word = start & !(word_size - 1);
            let length = min(start_word + word_size - start, buf.len() - nwritten);

            let mut v: isize = 0;
            if length < word_size {
                v = self.fallible_ptrace(
                    PTRACE_PEEKDATA,
                    RemotePtr::new(start_word),
                    &mut PtraceData::None,
                );
                if errno() != 0 {
                    break;
                }
            }
            unsafe {
                copy_nonoverlapping(
                    buf.as_ptr().add(nwritten),
                    (&mut v as *mut isize as *mut u8).add(start - start_word),
                    length,
                );
            }
            self.fallible_ptrace(
                PTRACE_POKEDATA,
                RemotePtr::new(start_word),
                &mut PtraceData::ReadWord(v as usize),
            );
            if errno() != 0 {
                break;
            }
            nwritten += length;
        }
        nwritten
    }
}

/// pwrite() to /proc/.../mem fails on some kernels when the target region
/// is PROT_NONE, and writing through read-only MAP_SHARED mappings fails
/// even when the file was opened read-write
/// (https://bugzilla.kernel.org/show_bug.cgi?id=99101). Temporarily add
/// PROT_WRITE to the mappings in the way, write, and restore.
pub(crate) fn safe_pwrite64(
    t: &mut Task,
    buf: &[u8],
    addr: RemotePtr<Void>,
) -> Result<usize, ()> {
    let vm = t.vm();
    let write_range = MemoryRange::from_range(
        RemotePtr::new(floor_page_size(addr.as_usize())),
        RemotePtr::new(ceil_page_size(addr.as_usize() + buf.len())),
    );
    let mut mappings_to_fix: Vec<(MemoryRange, ProtFlags)> = Vec::new();
    for m in vm.mappings_intersecting(write_range) {
        if m.map.prot().contains(ProtFlags::PROT_WRITE) {
            continue;
        }
        if !m.map.prot().contains(ProtFlags::PROT_READ)
            || m.map.flags().contains(MapFlags::MAP_SHARED)
        {
            let range = MemoryRange::from_range(m.map.start(), m.map.end());
            mappings_to_fix.push((range, m.map.prot()));
        }
    }

    let mem_fd = vm.mem_fd().as_raw();
    if mappings_to_fix.is_empty() {
        return pwrite_all_fallible(mem_fd, buf, addr.as_isize());
    }

    let mprotect_syscallno = syscalls(t.arch()).mprotect;
    let mut remote = RemoteSyscalls::new(t);
    for (range, prot) in &mappings_to_fix {
        remote.infallible_syscall(
            mprotect_syscallno,
            &[
                range.start().as_usize(),
                range.size(),
                (*prot | ProtFlags::PROT_WRITE).bits() as usize,
            ],
        );
    }

    let nwritten_result = pwrite_all_fallible(mem_fd, buf, addr.as_isize());

    for (range, prot) in &mappings_to_fix {
        remote.infallible_syscall(
            mprotect_syscallno,
            &[range.start().as_usize(), range.size(), prot.bits() as usize],
        );
    }

    nwritten_result
}

/// Read one `D` from `child_addr`. Shortfalls set `*ok` to false or are
/// fatal without an `ok` out-parameter.
pub fn read_val_mem<D>(t: &mut Task, child_addr: RemotePtr<D>, ok: Option<&mut bool>) -> D {
    let mut v: D = unsafe { zeroed() };
    let u8_slice =
        unsafe { slice::from_raw_parts_mut(&mut v as *mut D as *mut u8, size_of::<D>()) };
    t.read_bytes_helper(RemotePtr::cast(child_addr), u8_slice, ok);
    v
}

/// Read `count` values from `child_addr`.
pub fn read_mem<D: Clone>(
    t: &mut Task,
    child_addr: RemotePtr<D>,
    count: usize,
    ok: Option<&mut bool>,
) -> Vec<D> {
    let mut v: Vec<D> = Vec::with_capacity(count);
    v.resize(count, unsafe { zeroed() });
    let u8_slice = unsafe {
        slice::from_raw_parts_mut(v.as_mut_ptr() as *mut u8, count * size_of::<D>())
    };
    t.read_bytes_helper(RemotePtr::cast(child_addr), u8_slice, ok);
    v
}

/// Write one `D` to `child_addr`.
pub fn write_val_mem<D>(t: &mut Task, child_addr: RemotePtr<D>, val: &D, ok: Option<&mut bool>) {
    write_val_mem_with_flags(t, child_addr, val, ok, WriteFlags::empty())
}

pub fn write_val_mem_with_flags<D>(
    t: &mut Task,
    child_addr: RemotePtr<D>,
    val: &D,
    ok: Option<&mut bool>,
    flags: WriteFlags,
) {
    let data_slice =
        unsafe { slice::from_raw_parts(val as *const D as *const u8, size_of::<D>()) };
    t.write_bytes_helper(RemotePtr::cast(child_addr), data_slice, ok, flags);
}

/// Write an array of `D`s to `child_addr`.
pub fn write_mem<D>(t: &mut Task, child_addr: RemotePtr<D>, val: &[D], ok: Option<&mut bool>) {
    let data_slice = unsafe {
        slice::from_raw_parts(val.as_ptr().cast::<u8>(), val.len() * size_of::<D>())
    };
    t.write_bytes_helper(RemotePtr::cast(child_addr), data_slice, ok, WriteFlags::empty());
}
