//! The general-purpose register cache. The tracer is a 64-bit process, so
//! the kernel always hands us the native (x86-64) `user_regs_struct`; a
//! 32-bit tracee's registers appear in the low halves with the compat
//! segment selectors. The arch tag rides along so syscall-argument and
//! user-area-offset mapping can follow the tracee's ABI.

use crate::{
    kernel_abi::SupportedArch,
    remote_code_ptr::RemoteCodePtr,
    remote_ptr::{RemotePtr, Void},
};
use libc::user_regs_struct;
use std::{
    fmt::{self, Debug, Formatter},
    mem::size_of,
};

pub const X86_TF_FLAG: usize = 0x100;

/// Values the kernel uses for interrupted-syscall restarts; a syscall
/// result in this set means "will restart".
const ERESTARTSYS: isize = 512;
const ERESTARTNOINTR: isize = 513;
const ERESTARTNOHAND: isize = 514;
const ERESTART_RESTARTBLOCK: isize = 516;

/// The i386 user_regs_struct layout, needed when a tracee manipulates
/// another 32-bit tracee through ptrace.
#[repr(C)]
#[derive(Copy, Clone, Default)]
pub struct X86UserRegs {
    pub ebx: i32,
    pub ecx: i32,
    pub edx: i32,
    pub esi: i32,
    pub edi: i32,
    pub ebp: i32,
    pub eax: i32,
    pub xds: i32,
    pub xes: i32,
    pub xfs: i32,
    pub xgs: i32,
    pub orig_eax: i32,
    pub eip: i32,
    pub xcs: i32,
    pub eflags: i32,
    pub esp: i32,
    pub xss: i32,
}

const_assert_eq!(size_of::<X86UserRegs>(), 17 * 4);

#[derive(Copy, Clone)]
pub struct Registers {
    arch: SupportedArch,
    u: user_regs_struct,
}

impl Registers {
    pub fn new(arch: SupportedArch) -> Registers {
        Registers {
            arch,
            u: unsafe { std::mem::zeroed() },
        }
    }

    pub fn arch(&self) -> SupportedArch {
        self.arch
    }

    pub fn set_arch(&mut self, arch: SupportedArch) {
        self.arch = arch;
    }

    pub fn set_from_ptrace(&mut self, ptrace_regs: &user_regs_struct) {
        self.u = *ptrace_regs;
    }

    pub fn get_ptrace(&self) -> user_regs_struct {
        self.u
    }

    /// Install a register file laid out for `arch`, as written by a tracee
    /// performing ptrace on another tracee.
    pub fn set_from_ptrace_for_arch(&mut self, arch: SupportedArch, data: &[u8]) {
        match arch {
            SupportedArch::X64 => {
                debug_assert_eq!(data.len(), size_of::<user_regs_struct>());
                let mut regs: user_regs_struct = unsafe { std::mem::zeroed() };
                unsafe {
                    std::ptr::copy_nonoverlapping(
                        data.as_ptr(),
                        &mut regs as *mut _ as *mut u8,
                        size_of::<user_regs_struct>(),
                    );
                }
                self.u = regs;
            }
            SupportedArch::X86 => {
                debug_assert_eq!(data.len(), size_of::<X86UserRegs>());
                let mut regs = X86UserRegs::default();
                unsafe {
                    std::ptr::copy_nonoverlapping(
                        data.as_ptr(),
                        &mut regs as *mut _ as *mut u8,
                        size_of::<X86UserRegs>(),
                    );
                }
                self.u.rbx = regs.ebx as u32 as u64;
                self.u.rcx = regs.ecx as u32 as u64;
                self.u.rdx = regs.edx as u32 as u64;
                self.u.rsi = regs.esi as u32 as u64;
                self.u.rdi = regs.edi as u32 as u64;
                self.u.rbp = regs.ebp as u32 as u64;
                self.u.rax = regs.eax as u32 as u64;
                self.u.orig_rax = regs.orig_eax as i64 as u64;
                self.u.rip = regs.eip as u32 as u64;
                self.u.eflags = regs.eflags as u32 as u64;
                self.u.rsp = regs.esp as u32 as u64;
                self.u.cs = regs.xcs as u32 as u64;
                self.u.ss = regs.xss as u32 as u64;
                self.u.ds = regs.xds as u32 as u64;
                self.u.es = regs.xes as u32 as u64;
                self.u.fs = regs.xfs as u32 as u64;
                self.u.gs = regs.xgs as u32 as u64;
            }
        }
        self.arch = arch;
    }

    pub fn ip(&self) -> RemoteCodePtr {
        RemoteCodePtr::new(self.u.rip as usize)
    }

    pub fn set_ip(&mut self, addr: RemoteCodePtr) {
        self.u.rip = addr.as_usize() as u64;
    }

    pub fn sp(&self) -> RemotePtr<Void> {
        RemotePtr::new(self.u.rsp as usize)
    }

    pub fn set_sp(&mut self, addr: RemotePtr<Void>) {
        self.u.rsp = addr.as_usize() as u64;
    }

    /// The syscall number for a syscall currently being entered, or the
    /// result once it has exited.
    pub fn syscallno(&self) -> isize {
        self.u.rax as isize
    }

    pub fn set_syscallno(&mut self, syscallno: isize) {
        self.u.rax = syscallno as u64;
    }

    /// The syscall number saved by the kernel at syscall entry; survives
    /// the result overwriting ax.
    pub fn original_syscallno(&self) -> isize {
        self.u.orig_rax as isize
    }

    pub fn set_original_syscallno(&mut self, syscallno: isize) {
        self.u.orig_rax = syscallno as u64;
    }

    pub fn syscall_result(&self) -> usize {
        self.u.rax as usize
    }

    pub fn syscall_result_signed(&self) -> isize {
        self.u.rax as isize
    }

    pub fn set_syscall_result(&mut self, result: usize) {
        self.u.rax = result as u64;
    }

    pub fn set_syscall_result_signed(&mut self, result: isize) {
        self.u.rax = result as u64;
    }

    pub fn syscall_failed(&self) -> bool {
        let result = self.syscall_result_signed();
        (-4096..0).contains(&result)
    }

    pub fn syscall_may_restart(&self) -> bool {
        matches!(
            -self.syscall_result_signed(),
            ERESTARTSYS | ERESTARTNOINTR | ERESTARTNOHAND | ERESTART_RESTARTBLOCK
        )
    }

    pub fn flags(&self) -> usize {
        self.u.eflags as usize
    }

    pub fn set_flags(&mut self, value: usize) {
        self.u.eflags = value as u64;
    }

    pub fn singlestep_flag(&self) -> bool {
        self.flags() & X86_TF_FLAG != 0
    }

    pub fn clear_singlestep_flag(&mut self) {
        let flags = self.flags() & !X86_TF_FLAG;
        self.set_flags(flags);
    }

    pub fn cs(&self) -> usize {
        self.u.cs as usize
    }

    pub fn cx(&self) -> usize {
        self.u.rcx as usize
    }

    pub fn set_cx(&mut self, value: usize) {
        self.u.rcx = value as u64;
    }

    pub fn set_r8(&mut self, value: u64) {
        self.u.r8 = value;
    }

    pub fn set_r9(&mut self, value: u64) {
        self.u.r9 = value;
    }

    pub fn set_r10(&mut self, value: u64) {
        self.u.r10 = value;
    }

    pub fn set_r11(&mut self, value: u64) {
        self.u.r11 = value;
    }

    pub fn set_fs_base(&mut self, base: u64) {
        self.u.fs_base = base;
    }

    pub fn set_gs_base(&mut self, base: u64) {
        self.u.gs_base = base;
    }

    pub fn fs_base(&self) -> u64 {
        self.u.fs_base
    }

    pub fn gs_base(&self) -> u64 {
        self.u.gs_base
    }

    pub fn arg1(&self) -> usize {
        self.arg(1)
    }
    pub fn arg1_signed(&self) -> isize {
        self.arg(1) as isize
    }
    pub fn arg2(&self) -> usize {
        self.arg(2)
    }
    pub fn arg2_signed(&self) -> isize {
        self.arg(2) as isize
    }
    pub fn arg3(&self) -> usize {
        self.arg(3)
    }
    pub fn arg3_signed(&self) -> isize {
        self.arg(3) as isize
    }
    pub fn arg4(&self) -> usize {
        self.arg(4)
    }
    pub fn arg4_signed(&self) -> isize {
        self.arg(4) as isize
    }
    pub fn arg5(&self) -> usize {
        self.arg(5)
    }
    pub fn arg6(&self) -> usize {
        self.arg(6)
    }

    /// Syscall arguments follow the tracee ABI: rdi/rsi/rdx/r10/r8/r9 on
    /// x86-64, ebx/ecx/edx/esi/edi/ebp on x86.
    pub fn arg(&self, index: usize) -> usize {
        let v = match (self.arch, index) {
            (SupportedArch::X64, 1) => self.u.rdi,
            (SupportedArch::X64, 2) => self.u.rsi,
            (SupportedArch::X64, 3) => self.u.rdx,
            (SupportedArch::X64, 4) => self.u.r10,
            (SupportedArch::X64, 5) => self.u.r8,
            (SupportedArch::X64, 6) => self.u.r9,
            (SupportedArch::X86, 1) => self.u.rbx,
            (SupportedArch::X86, 2) => self.u.rcx,
            (SupportedArch::X86, 3) => self.u.rdx,
            (SupportedArch::X86, 4) => self.u.rsi,
            (SupportedArch::X86, 5) => self.u.rdi,
            (SupportedArch::X86, 6) => self.u.rbp,
            _ => panic!("syscall arg {} out of range", index),
        };
        v as usize
    }

    pub fn set_arg(&mut self, index: usize, value: usize) {
        let value = value as u64;
        match (self.arch, index) {
            (SupportedArch::X64, 1) => self.u.rdi = value,
            (SupportedArch::X64, 2) => self.u.rsi = value,
            (SupportedArch::X64, 3) => self.u.rdx = value,
            (SupportedArch::X64, 4) => self.u.r10 = value,
            (SupportedArch::X64, 5) => self.u.r8 = value,
            (SupportedArch::X64, 6) => self.u.r9 = value,
            (SupportedArch::X86, 1) => self.u.rbx = value,
            (SupportedArch::X86, 2) => self.u.rcx = value,
            (SupportedArch::X86, 3) => self.u.rdx = value,
            (SupportedArch::X86, 4) => self.u.rsi = value,
            (SupportedArch::X86, 5) => self.u.rdi = value,
            (SupportedArch::X86, 6) => self.u.rbp = value,
            _ => panic!("syscall arg {} out of range", index),
        }
    }

    pub fn set_arg1(&mut self, value: usize) {
        self.set_arg(1, value);
    }
    pub fn set_arg2(&mut self, value: usize) {
        self.set_arg(2, value);
    }
    pub fn set_arg3(&mut self, value: usize) {
        self.set_arg(3, value);
    }
    pub fn set_arg4(&mut self, value: usize) {
        self.set_arg(4, value);
    }
    pub fn set_arg5(&mut self, value: usize) {
        self.set_arg(5, value);
    }
    pub fn set_arg6(&mut self, value: usize) {
        self.set_arg(6, value);
    }

    /// Emulate a POKEUSER write landing inside the GP register area of the
    /// tracee-arch `user` struct.
    pub fn write_register_by_user_offset(&mut self, offset: usize, value: usize) {
        match self.arch {
            SupportedArch::X64 => {
                if offset % 8 != 0 || offset >= size_of::<user_regs_struct>() {
                    return;
                }
                let regs =
                    unsafe { &mut *(&mut self.u as *mut user_regs_struct as *mut [u64; 27]) };
                regs[offset / 8] = value as u64;
            }
            SupportedArch::X86 => {
                if offset % 4 != 0 || offset >= size_of::<X86UserRegs>() {
                    return;
                }
                let value = value as u32 as u64;
                match offset / 4 {
                    0 => self.u.rbx = value,
                    1 => self.u.rcx = value,
                    2 => self.u.rdx = value,
                    3 => self.u.rsi = value,
                    4 => self.u.rdi = value,
                    5 => self.u.rbp = value,
                    6 => self.u.rax = value,
                    7 => self.u.ds = value,
                    8 => self.u.es = value,
                    9 => self.u.fs = value,
                    10 => self.u.gs = value,
                    11 => self.u.orig_rax = value,
                    12 => self.u.rip = value,
                    13 => self.u.cs = value,
                    14 => self.u.eflags = value,
                    15 => self.u.rsp = value,
                    16 => self.u.ss = value,
                    _ => (),
                }
            }
        }
    }

    /// Bit-for-bit equality of the ABI-visible register file.
    pub fn matches(&self, other: &Registers) -> bool {
        let a = crate::util::u8_slice(&self.u);
        let b = crate::util::u8_slice(&other.u);
        a == b
    }
}

impl Debug for Registers {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{{arch: {:?}, ip: {}, sp: {}, ax: {:#x}, orig_ax: {:#x}, flags: {:#x}}}",
            self.arch,
            self.ip(),
            self.sp(),
            self.u.rax,
            self.u.orig_rax,
            self.u.eflags
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn args_follow_tracee_abi() {
        let mut r = Registers::new(SupportedArch::X64);
        for i in 1..=6 {
            r.set_arg(i, 0x100 + i);
        }
        for i in 1..=6 {
            assert_eq!(0x100 + i, r.arg(i));
        }

        let mut r32 = Registers::new(SupportedArch::X86);
        r32.set_arg1(0xdead);
        // arg1 on x86 is ebx; on x64 it would be rdi.
        assert_eq!(0xdead, r32.arg(1));
        r32.set_arch(SupportedArch::X64);
        assert_ne!(0xdead, r32.arg(1));
    }

    #[test]
    fn set_get_round_trip_is_bit_exact() {
        let mut a = Registers::new(SupportedArch::X64);
        a.set_ip(RemoteCodePtr::new(0x7000_1234));
        a.set_sp(RemotePtr::new(0x7fff_0000));
        a.set_syscallno(59);
        a.set_original_syscallno(59);
        a.set_flags(0x246);
        let ptrace_regs = a.get_ptrace();
        let mut b = Registers::new(SupportedArch::X64);
        b.set_from_ptrace(&ptrace_regs);
        assert!(a.matches(&b));
    }

    #[test]
    fn singlestep_flag() {
        let mut r = Registers::new(SupportedArch::X64);
        r.set_flags(0x246 | X86_TF_FLAG);
        assert!(r.singlestep_flag());
        r.clear_singlestep_flag();
        assert!(!r.singlestep_flag());
        assert_eq!(0x246, r.flags());
    }

    #[test]
    fn syscall_failure_boundaries() {
        let mut r = Registers::new(SupportedArch::X64);
        r.set_syscall_result_signed(-1);
        assert!(r.syscall_failed());
        r.set_syscall_result_signed(-4095);
        assert!(r.syscall_failed());
        r.set_syscall_result_signed(0);
        assert!(!r.syscall_failed());
        r.set_syscall_result_signed(-4097);
        assert!(!r.syscall_failed());
        r.set_syscall_result_signed(-(ERESTARTSYS));
        assert!(r.syscall_may_restart());
    }

    #[test]
    fn x86_register_file_conversion() {
        let mut regs32 = X86UserRegs::default();
        regs32.eax = -38; // ENOSYS
        regs32.eip = 0x0804_8000u32 as i32;
        regs32.ebx = 7;
        let bytes =
            unsafe { std::slice::from_raw_parts(&regs32 as *const _ as *const u8, 17 * 4) };
        let mut r = Registers::new(SupportedArch::X64);
        r.set_from_ptrace_for_arch(SupportedArch::X86, bytes);
        assert_eq!(SupportedArch::X86, r.arch());
        assert_eq!(0x0804_8000, r.ip().as_usize());
        assert_eq!(7, r.arg(1));
    }
}
