//! The syscall ABI differs between the two supported architectures in the
//! numbers assigned to syscalls, the instruction used to enter the kernel,
//! and the parameter ordering of clone(). Everything arch-specific the
//! control plane needs is collected here as compile-time tables indexed by
//! the task's current arch tag; callers dispatch once per operation.

use crate::{
    remote_code_ptr::RemoteCodePtr,
    remote_ptr::RemotePtr,
    task::Task,
};

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SupportedArch {
    X86,
    X64,
}

#[cfg(target_arch = "x86_64")]
pub const REWIND_NATIVE_ARCH: SupportedArch = SupportedArch::X64;
#[cfg(target_arch = "x86")]
pub const REWIND_NATIVE_ARCH: SupportedArch = SupportedArch::X86;

/// How the clone() syscall orders its pointer parameters.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum CloneParameterOrdering {
    /// x86: flags, stack, parent_tid, tls, child_tid
    FlagsStackParentTLSChild,
    /// x86-64: flags, stack, parent_tid, child_tid, tls
    FlagsStackParentChildTLS,
}

/// What the tls argument to clone() points at.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum CloneTLSType {
    /// x86: a user_desc describing a GDT entry.
    UserDescPointer,
    /// x86-64: the new fs base value itself.
    PthreadStructurePointer,
}

/// Per-arch syscall numbers; -1 marks a syscall the arch doesn't have.
pub struct SyscallTable {
    pub write: i32,
    pub pwrite64: i32,
    pub writev: i32,
    pub pwritev: i32,
    pub close: i32,
    pub dup: i32,
    pub dup2: i32,
    pub dup3: i32,
    pub fcntl: i32,
    pub fcntl64: i32,
    pub mmap: i32,
    pub mmap2: i32,
    pub mprotect: i32,
    pub munmap: i32,
    pub mremap: i32,
    pub brk: i32,
    pub madvise: i32,
    pub shmdt: i32,
    pub ipc: i32,
    pub set_thread_area: i32,
    pub prctl: i32,
    pub arch_prctl: i32,
    pub ptrace: i32,
    pub unshare: i32,
    pub execve: i32,
    pub clone: i32,
    pub openat: i32,
    pub gettid: i32,
    pub lseek: i32,
    pub _llseek: i32,
}

pub const X86_SYSCALLS: SyscallTable = SyscallTable {
    write: 4,
    pwrite64: 181,
    writev: 146,
    pwritev: 334,
    close: 6,
    dup: 41,
    dup2: 63,
    dup3: 330,
    fcntl: 55,
    fcntl64: 221,
    mmap: 90,
    mmap2: 192,
    mprotect: 125,
    munmap: 91,
    mremap: 163,
    brk: 45,
    madvise: 219,
    shmdt: -1,
    ipc: 117,
    set_thread_area: 243,
    prctl: 172,
    arch_prctl: 384,
    ptrace: 26,
    unshare: 310,
    execve: 11,
    clone: 120,
    openat: 295,
    gettid: 224,
    lseek: 19,
    _llseek: 140,
};

pub const X64_SYSCALLS: SyscallTable = SyscallTable {
    write: 1,
    pwrite64: 18,
    writev: 20,
    pwritev: 296,
    close: 3,
    dup: 32,
    dup2: 33,
    dup3: 292,
    fcntl: 72,
    fcntl64: -1,
    mmap: 9,
    mmap2: -1,
    mprotect: 10,
    munmap: 11,
    mremap: 25,
    brk: 12,
    madvise: 28,
    shmdt: 67,
    ipc: -1,
    set_thread_area: 205,
    prctl: 157,
    arch_prctl: 158,
    ptrace: 101,
    unshare: 272,
    execve: 59,
    clone: 56,
    openat: 257,
    gettid: 186,
    lseek: 8,
    _llseek: -1,
};

pub fn syscalls(arch: SupportedArch) -> &'static SyscallTable {
    match arch {
        SupportedArch::X86 => &X86_SYSCALLS,
        SupportedArch::X64 => &X64_SYSCALLS,
    }
}

pub fn clone_parameter_ordering(arch: SupportedArch) -> CloneParameterOrdering {
    match arch {
        SupportedArch::X86 => CloneParameterOrdering::FlagsStackParentTLSChild,
        SupportedArch::X64 => CloneParameterOrdering::FlagsStackParentChildTLS,
    }
}

pub fn clone_tls_type(arch: SupportedArch) -> CloneTLSType {
    match arch {
        SupportedArch::X86 => CloneTLSType::UserDescPointer,
        SupportedArch::X64 => CloneTLSType::PthreadStructurePointer,
    }
}

pub fn is_mprotect_syscall(sys: i32, arch: SupportedArch) -> bool {
    sys == syscalls(arch).mprotect
}

/// Every kernel entry instruction we may have to step over is two bytes:
/// `syscall` (0f 05), `int $0x80` (cd 80) and `sysenter` (0f 34).
pub const SYSCALL_INSTRUCTION_LENGTH: usize = 2;

pub fn syscall_instruction_length(_arch: SupportedArch) -> usize {
    SYSCALL_INSTRUCTION_LENGTH
}

/// The canonical kernel-entry instruction we plant for remote syscalls.
pub fn syscall_instruction_bytes(arch: SupportedArch) -> [u8; SYSCALL_INSTRUCTION_LENGTH] {
    match arch {
        SupportedArch::X86 => [0xcd, 0x80],
        SupportedArch::X64 => [0x0f, 0x05],
    }
}

/// True if the two bytes at `ptr` are any form of kernel entry instruction.
/// Reads through the task, tolerating unmapped addresses.
pub fn is_at_syscall_instruction(t: &mut Task, ptr: RemoteCodePtr) -> bool {
    let mut code = [0u8; SYSCALL_INSTRUCTION_LENGTH];
    let mut ok = true;
    t.read_bytes_helper(
        RemotePtr::cast(ptr.to_data_ptr::<u8>()),
        &mut code,
        Some(&mut ok),
    );
    if !ok {
        return false;
    }
    code == [0x0f, 0x05] || code == [0xcd, 0x80] || code == [0x0f, 0x34]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_spot_checks() {
        assert_eq!(10, syscalls(SupportedArch::X64).mprotect);
        assert_eq!(125, syscalls(SupportedArch::X86).mprotect);
        assert_eq!(59, syscalls(SupportedArch::X64).execve);
        assert_eq!(11, syscalls(SupportedArch::X86).execve);
        assert_eq!(-1, syscalls(SupportedArch::X64).mmap2);
        assert_eq!(-1, syscalls(SupportedArch::X86).shmdt);
        assert_eq!(117, syscalls(SupportedArch::X86).ipc);
    }

    #[test]
    fn entry_instructions() {
        assert_eq!([0x0f, 0x05], syscall_instruction_bytes(SupportedArch::X64));
        assert_eq!([0xcd, 0x80], syscall_instruction_bytes(SupportedArch::X86));
    }
}
