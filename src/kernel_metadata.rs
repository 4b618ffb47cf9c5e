//! Human-readable names for kernel identifiers, for diagnostics only.

use crate::bindings::ptrace::*;
use crate::kernel_abi::{syscalls, SupportedArch};

pub fn signal_name(sig: i32) -> String {
    // The realtime signals spread across a range instead of having names.
    if (libc::SIGRTMIN()..=libc::SIGRTMAX()).contains(&sig) {
        return format!("SIGRT{}", sig - libc::SIGRTMIN());
    }

    let name = match sig {
        libc::SIGHUP => "SIGHUP",
        libc::SIGINT => "SIGINT",
        libc::SIGQUIT => "SIGQUIT",
        libc::SIGILL => "SIGILL",
        libc::SIGTRAP => "SIGTRAP",
        libc::SIGABRT => "SIGABRT",
        libc::SIGBUS => "SIGBUS",
        libc::SIGFPE => "SIGFPE",
        libc::SIGKILL => "SIGKILL",
        libc::SIGUSR1 => "SIGUSR1",
        libc::SIGSEGV => "SIGSEGV",
        libc::SIGUSR2 => "SIGUSR2",
        libc::SIGPIPE => "SIGPIPE",
        libc::SIGALRM => "SIGALRM",
        libc::SIGTERM => "SIGTERM",
        libc::SIGSTKFLT => "SIGSTKFLT",
        libc::SIGCHLD => "SIGCHLD",
        libc::SIGCONT => "SIGCONT",
        libc::SIGSTOP => "SIGSTOP",
        libc::SIGTSTP => "SIGTSTP",
        libc::SIGTTIN => "SIGTTIN",
        libc::SIGTTOU => "SIGTTOU",
        libc::SIGURG => "SIGURG",
        libc::SIGXCPU => "SIGXCPU",
        libc::SIGXFSZ => "SIGXFSZ",
        libc::SIGVTALRM => "SIGVTALRM",
        libc::SIGPROF => "SIGPROF",
        libc::SIGWINCH => "SIGWINCH",
        libc::SIGIO => "SIGIO",
        libc::SIGPWR => "SIGPWR",
        libc::SIGSYS => "SIGSYS",
        _ => return format!("signal({})", sig),
    };
    name.to_owned()
}

pub fn errno_name(err: i32) -> String {
    if err == 0 {
        return "SUCCESS".to_owned();
    }
    let e = nix::errno::Errno::from_i32(err);
    if e == nix::errno::Errno::UnknownErrno {
        format!("errno({})", err)
    } else {
        format!("{:?}", e)
    }
}

pub fn ptrace_event_name(event: u32) -> String {
    let name = match event {
        PTRACE_EVENT_FORK => "PTRACE_EVENT_FORK",
        PTRACE_EVENT_VFORK => "PTRACE_EVENT_VFORK",
        PTRACE_EVENT_CLONE => "PTRACE_EVENT_CLONE",
        PTRACE_EVENT_EXEC => "PTRACE_EVENT_EXEC",
        PTRACE_EVENT_VFORK_DONE => "PTRACE_EVENT_VFORK_DONE",
        PTRACE_EVENT_EXIT => "PTRACE_EVENT_EXIT",
        PTRACE_EVENT_SECCOMP => "PTRACE_EVENT_SECCOMP",
        PTRACE_EVENT_SECCOMP_OBSOLETE => "PTRACE_EVENT_SECCOMP_OBSOLETE",
        PTRACE_EVENT_STOP => "PTRACE_EVENT_STOP",
        _ => return format!("PTRACE_EVENT({})", event),
    };
    name.to_owned()
}

pub fn ptrace_req_name(request: u32) -> String {
    let name = match request {
        PTRACE_TRACEME => "PTRACE_TRACEME",
        PTRACE_PEEKTEXT => "PTRACE_PEEKTEXT",
        PTRACE_PEEKDATA => "PTRACE_PEEKDATA",
        PTRACE_PEEKUSER => "PTRACE_PEEKUSER",
        PTRACE_POKETEXT => "PTRACE_POKETEXT",
        PTRACE_POKEDATA => "PTRACE_POKEDATA",
        PTRACE_POKEUSER => "PTRACE_POKEUSER",
        PTRACE_CONT => "PTRACE_CONT",
        PTRACE_KILL => "PTRACE_KILL",
        PTRACE_SINGLESTEP => "PTRACE_SINGLESTEP",
        PTRACE_GETREGS => "PTRACE_GETREGS",
        PTRACE_SETREGS => "PTRACE_SETREGS",
        PTRACE_GETFPREGS => "PTRACE_GETFPREGS",
        PTRACE_SETFPREGS => "PTRACE_SETFPREGS",
        PTRACE_ATTACH => "PTRACE_ATTACH",
        PTRACE_DETACH => "PTRACE_DETACH",
        PTRACE_GETFPXREGS => "PTRACE_GETFPXREGS",
        PTRACE_SETFPXREGS => "PTRACE_SETFPXREGS",
        PTRACE_SYSCALL => "PTRACE_SYSCALL",
        PTRACE_SYSEMU => "PTRACE_SYSEMU",
        PTRACE_SYSEMU_SINGLESTEP => "PTRACE_SYSEMU_SINGLESTEP",
        PTRACE_ARCH_PRCTL => "PTRACE_ARCH_PRCTL",
        PTRACE_SETOPTIONS => "PTRACE_SETOPTIONS",
        PTRACE_GETEVENTMSG => "PTRACE_GETEVENTMSG",
        PTRACE_GETSIGINFO => "PTRACE_GETSIGINFO",
        PTRACE_SETSIGINFO => "PTRACE_SETSIGINFO",
        PTRACE_GETREGSET => "PTRACE_GETREGSET",
        PTRACE_SETREGSET => "PTRACE_SETREGSET",
        PTRACE_SEIZE => "PTRACE_SEIZE",
        PTRACE_INTERRUPT => "PTRACE_INTERRUPT",
        PTRACE_LISTEN => "PTRACE_LISTEN",
        _ => return format!("PTRACE_REQUEST({})", request),
    };
    name.to_owned()
}

/// Best-effort syscall naming: the calls the dispatcher handles are named,
/// everything else falls back to the raw number.
pub fn syscall_name(sys: i32, arch: SupportedArch) -> String {
    let t = syscalls(arch);
    let name = if sys == t.write {
        "write"
    } else if sys == t.pwrite64 {
        "pwrite64"
    } else if sys == t.writev {
        "writev"
    } else if sys == t.pwritev {
        "pwritev"
    } else if sys == t.close {
        "close"
    } else if sys == t.dup {
        "dup"
    } else if sys == t.dup2 {
        "dup2"
    } else if sys == t.dup3 {
        "dup3"
    } else if sys == t.fcntl || sys == t.fcntl64 {
        "fcntl"
    } else if sys == t.mmap || sys == t.mmap2 {
        "mmap"
    } else if sys == t.mprotect {
        "mprotect"
    } else if sys == t.munmap {
        "munmap"
    } else if sys == t.mremap {
        "mremap"
    } else if sys == t.brk {
        "brk"
    } else if sys == t.madvise {
        "madvise"
    } else if sys == t.shmdt {
        "shmdt"
    } else if sys == t.ipc {
        "ipc"
    } else if sys == t.set_thread_area {
        "set_thread_area"
    } else if sys == t.prctl {
        "prctl"
    } else if sys == t.arch_prctl {
        "arch_prctl"
    } else if sys == t.ptrace {
        "ptrace"
    } else if sys == t.unshare {
        "unshare"
    } else if sys == t.execve {
        "execve"
    } else if sys == t.clone {
        "clone"
    } else if sys == t.openat {
        "openat"
    } else if sys == t.gettid {
        "gettid"
    } else if sys == t.lseek {
        "lseek"
    } else if sys == t._llseek {
        "_llseek"
    } else {
        return format!("syscall({})", sys);
    };
    name.to_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names() {
        assert_eq!("SIGTRAP", signal_name(libc::SIGTRAP));
        assert_eq!("SIGRT0", signal_name(libc::SIGRTMIN()));
        assert_eq!("PTRACE_EVENT_EXIT", ptrace_event_name(PTRACE_EVENT_EXIT));
        assert_eq!("execve", syscall_name(59, SupportedArch::X64));
        assert_eq!("execve", syscall_name(11, SupportedArch::X86));
        assert_eq!("syscall(9999)", syscall_name(9999, SupportedArch::X64));
    }
}
