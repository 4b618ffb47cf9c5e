//! Constants that are part of the kernel ABI but missing from (or
//! inconsistently present in) the libc crate.

#![allow(non_upper_case_globals)]

use libc::c_int;

pub const SECCOMP_RET_ALLOW: u32 = 0x7fff_0000;
pub const SECCOMP_RET_TRACE: u32 = 0x7ff0_0000;
pub const SECCOMP_RET_DATA: u32 = 0x0000_ffff;

/// fcntl commands for routing the perf counter overflow signal to one
/// specific thread.
pub const F_SETSIG: c_int = 10;
pub const F_SETOWN_EX: c_int = 15;
pub const F_OWNER_TID: c_int = 0;

#[repr(C)]
#[derive(Copy, Clone)]
pub struct f_owner_ex {
    pub type_: c_int,
    pub pid: libc::pid_t,
}

/// fcntl(F_DUPFD*) operations the fd-table dispatcher cares about.
pub const F_DUPFD: usize = 0;
pub const F_DUPFD_CLOEXEC: usize = 1030;

/// The `ipc` multiplexer call number for shmdt on x86.
pub const SHMDT_IPC_CALL: u32 = 22;

/// arch_prctl codes, also used by PTRACE_ARCH_PRCTL.
pub const ARCH_SET_GS: u32 = 0x1001;
pub const ARCH_SET_FS: u32 = 0x1002;
pub const ARCH_GET_FS: u32 = 0x1003;
pub const ARCH_GET_GS: u32 = 0x1004;
