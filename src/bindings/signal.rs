//! The raw siginfo layout on x86-64. PTRACE_GETSIGINFO fills all 128 bytes,
//! and the synthesized TIME_SLICE_SIGNAL stop needs to write the sigpoll
//! member, which libc's opaque siginfo_t does not allow.

#![allow(non_camel_case_types)]

use crate::kernel_metadata::signal_name;
use libc::{c_long, pid_t, uid_t};
use std::fmt;

pub const SI_USER: i32 = 0;
pub const SI_KERNEL: i32 = 0x80;
pub const TRAP_BRKPT: i32 = 1;
pub const TRAP_TRACE: i32 = 2;
pub const POLL_IN: i32 = 1;

const SI_PAD_SIZE: usize = 28;

#[repr(C)]
#[derive(Copy, Clone)]
pub struct sifields_kill {
    pub si_pid: pid_t,
    pub si_uid: uid_t,
}

#[repr(C)]
#[derive(Copy, Clone)]
pub struct sifields_sigfault {
    pub si_addr: usize,
}

#[repr(C)]
#[derive(Copy, Clone)]
pub struct sifields_sigpoll {
    pub si_band: c_long,
    pub si_fd: i32,
}

#[repr(C)]
#[derive(Copy, Clone)]
pub union sifields {
    pub padding: [i32; SI_PAD_SIZE],
    pub kill: sifields_kill,
    pub sigfault: sifields_sigfault,
    pub sigpoll: sifields_sigpoll,
}

#[repr(C)]
#[derive(Copy, Clone)]
pub struct siginfo_t {
    pub si_signo: i32,
    pub si_errno: i32,
    pub si_code: i32,
    pub _sifields: sifields,
}

impl siginfo_t {
    pub fn si_fd(&self) -> i32 {
        unsafe { self._sifields.sigpoll.si_fd }
    }

    pub fn si_addr(&self) -> usize {
        unsafe { self._sifields.sigfault.si_addr }
    }
}

impl Default for siginfo_t {
    fn default() -> Self {
        unsafe { std::mem::zeroed() }
    }
}

impl fmt::Debug for siginfo_t {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{{signo: {}, errno: {}, code: {}}}",
            signal_name(self.si_signo),
            self.si_errno,
            self.si_code
        )
    }
}

const_assert_eq!(std::mem::size_of::<siginfo_t>(), 128);
const_assert_eq!(
    std::mem::size_of::<siginfo_t>(),
    std::mem::size_of::<libc::siginfo_t>()
);
