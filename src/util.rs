use crate::{
    bindings::signal::{SI_KERNEL, TRAP_BRKPT},
    scoped_fd::ScopedFd,
};
use libc::{pid_t, pwrite64};
use nix::{
    errno::{errno, Errno},
    sched::{sched_setaffinity, CpuSet},
    unistd::{sysconf, Pid, SysconfVar},
};
use std::{
    convert::TryInto,
    ffi::{c_void, CStr, CString, OsString},
    fs::File,
    io::Read,
    mem::size_of,
    os::unix::ffi::OsStrExt,
};

lazy_static! {
    static ref SYSTEM_PAGE_SIZE: usize = page_size_init();
    static ref XSAVE_AREA_SIZE: usize = xsave_area_size_init();
}

fn page_size_init() -> usize {
    sysconf(SysconfVar::PAGE_SIZE)
        .unwrap()
        .unwrap()
        .try_into()
        .unwrap()
}

pub fn page_size() -> usize {
    *SYSTEM_PAGE_SIZE
}

pub fn ceil_page_size(size: usize) -> usize {
    (size + page_size() - 1) & !(page_size() - 1)
}

pub fn floor_page_size(size: usize) -> usize {
    size & !(page_size() - 1)
}

#[cfg(target_arch = "x86_64")]
use core::arch::x86_64::{__cpuid, __cpuid_count};
#[cfg(target_arch = "x86")]
use core::arch::x86::{__cpuid, __cpuid_count};

const CPUID_GETFEATURES: u32 = 0x1;
const CPUID_GETXSAVE: u32 = 0xd;
const OSXSAVE_FEATURE_FLAG: u32 = 1 << 26;

fn xsave_area_size_init() -> usize {
    let features = unsafe { __cpuid(CPUID_GETFEATURES) };
    if features.ecx & OSXSAVE_FEATURE_FLAG == 0 {
        return 0;
    }
    // Use the largest possible area all the time even when it might not be
    // needed. Simpler that way.
    let xsave = unsafe { __cpuid_count(CPUID_GETXSAVE, 0) };
    xsave.ecx as usize
}

/// The native XSAVE area size reported by CPUID, or 0 when the CPU has no
/// XSAVE. Probed once per process.
pub fn xsave_area_size() -> usize {
    *XSAVE_AREA_SIZE
}

/// A SIGTRAP si_code the kernel uses for breakpoint traps.
pub fn is_kernel_trap(si_code: i32) -> bool {
    // SI_KERNEL is reported on old kernels and hypervisors, TRAP_BRKPT
    // everywhere else.
    si_code == SI_KERNEL || si_code == TRAP_BRKPT
}

/// Is the thread group currently a zombie? Also true when the process is
/// gone entirely; the caller treats both as "dead".
pub fn is_zombie_process(tgid: pid_t) -> bool {
    let path = format!("/proc/{}/status", tgid);
    let mut buf = String::new();
    match File::open(&path).and_then(|mut f| f.read_to_string(&mut buf)) {
        Err(_) => true,
        Ok(_) => {
            for line in buf.lines() {
                if let Some(state) = line.strip_prefix("State:") {
                    return state.trim_start().starts_with('Z');
                }
            }
            // Unclear what the state is; don't keep waiting on it.
            true
        }
    }
}

/// Parse the kernel file offset of `fd` in task `tid` from
/// /proc/<tid>/fdinfo/<fd>, field `pos:`. Returns -1 when absent.
pub fn read_fd_offset(tid: pid_t, fd: i32) -> i64 {
    let path = format!("/proc/{}/fdinfo/{}", tid, fd);
    let mut buf = String::new();
    if File::open(&path)
        .and_then(|mut f| f.read_to_string(&mut buf))
        .is_err()
    {
        return -1;
    }
    for line in buf.lines() {
        if let Some(pos) = line.strip_prefix("pos:") {
            if let Ok(v) = pos.trim().parse::<i64>() {
                return v;
            }
        }
    }
    -1
}

pub fn to_timeval(t: f64) -> libc::timeval {
    debug_assert!(t >= 0.0);
    let tv_sec = t.floor() as libc::time_t;
    let tv_usec = ((t - tv_sec as f64) * 1_000_000.0) as libc::suseconds_t;
    libc::timeval { tv_sec, tv_usec }
}

/// Pin the calling process to one CPU. Returns false if the CPU isn't
/// available.
pub fn set_cpu_affinity(cpu: u32) -> bool {
    let mut mask = CpuSet::new();
    mask.set(cpu as usize).unwrap();
    sched_setaffinity(Pid::from_raw(0), &mask).is_ok()
}

/// View any plain-old-data value as raw bytes.
pub fn u8_slice<T>(v: &T) -> &[u8] {
    unsafe { std::slice::from_raw_parts(v as *const T as *const u8, size_of::<T>()) }
}

pub fn u8_slice_mut<T>(v: &mut T) -> &mut [u8] {
    unsafe { std::slice::from_raw_parts_mut(v as *mut T as *mut u8, size_of::<T>()) }
}

/// Async-signal-safe full write, for use between fork and exec.
pub fn write_all(fd: i32, mut buf: &[u8]) {
    while !buf.is_empty() {
        let ret = unsafe { libc::write(fd, buf.as_ptr() as *const c_void, buf.len()) };
        if ret <= 0 {
            return;
        }
        buf = &buf[ret as usize..];
    }
}

/// Positional write that reports partial progress instead of asserting.
/// Err(()) only when nothing could be written and an error occurred.
pub fn pwrite_all_fallible(fd: i32, buf_initial: &[u8], offset: isize) -> Result<usize, ()> {
    let mut written: usize = 0;
    let mut buf = buf_initial;
    while !buf.is_empty() {
        Errno::clear();
        let ret = unsafe {
            pwrite64(
                fd,
                buf.as_ptr() as *const c_void,
                buf.len(),
                (offset + written as isize) as libc::off64_t,
            )
        };
        if ret <= 0 {
            if written > 0 {
                Errno::clear();
                return Ok(written);
            }
            if ret == 0 && errno() == 0 {
                return Ok(0);
            }
            return Err(());
        }
        written += ret as usize;
        buf = &buf_initial[written..];
    }
    Ok(written)
}

/// The argv/envp dance: allocate before fork, borrow after.
pub fn to_cstring_array(args: &[OsString]) -> Vec<CString> {
    args.iter()
        .map(|a| CString::new(a.as_bytes()).unwrap())
        .collect()
}

pub fn to_cstr_array(args: &[CString]) -> Vec<&CStr> {
    args.iter().map(|a| a.as_c_str()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_arithmetic() {
        let p = page_size();
        assert_eq!(0, ceil_page_size(0));
        assert_eq!(p, ceil_page_size(1));
        assert_eq!(p, ceil_page_size(p));
        assert_eq!(2 * p, ceil_page_size(p + 1));
        assert_eq!(0, floor_page_size(p - 1));
        assert_eq!(p, floor_page_size(p));
    }

    #[test]
    fn timeval_conversion() {
        let tv = to_timeval(1.5);
        assert_eq!(1, tv.tv_sec);
        assert_eq!(500_000, tv.tv_usec);
        let tv = to_timeval(0.01);
        assert_eq!(0, tv.tv_sec);
        assert_eq!(10_000, tv.tv_usec);
    }

    #[test]
    fn fd_offset_of_proc_self() {
        // stdin may be anything, but fdinfo for an fd we just opened is
        // well defined.
        let f = std::fs::File::open("/proc/self/status").unwrap();
        use std::os::unix::io::AsRawFd;
        assert_eq!(0, read_fd_offset(nix::unistd::getpid().as_raw(), f.as_raw_fd()));
    }

    #[test]
    fn own_process_is_not_zombie() {
        assert!(!is_zombie_process(nix::unistd::getpid().as_raw()));
        // A tid that can't exist reads as dead.
        assert!(is_zombie_process(-1));
    }
}
