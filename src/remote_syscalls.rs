//! Execute syscalls inside a stopped tracee. A syscall instruction is
//! planted at the current ip (the original bytes are restored afterwards),
//! registers are staged per call, and the tracee is driven through the
//! entry and exit stops. The tracee's registers, memory and wait status
//! are restored when the helper is dropped, so callers see no trace of the
//! excursion.

use crate::{
    bindings::ptrace::{
        PTRACE_EVENT_CLONE, PTRACE_EVENT_EXIT, PTRACE_EVENT_FORK, PTRACE_EVENT_VFORK,
    },
    kernel_abi::{syscall_instruction_bytes, syscalls, SupportedArch},
    kernel_metadata::{errno_name, syscall_name},
    registers::Registers,
    remote_code_ptr::RemoteCodePtr,
    remote_ptr::{RemotePtr, Void},
    session::Session,
    task::{ResumeRequest, Task, TicksRequest, WaitRequest, WriteFlags},
    wait_status::WaitStatus,
};
use libc::{pid_t, ESRCH, SEEK_SET};

pub struct RemoteSyscalls<'a> {
    t: &'a mut Task,
    initial_regs: Registers,
    initial_wait_status: WaitStatus,
    syscall_ip: RemoteCodePtr,
    replaced_bytes: Vec<u8>,
    /// The tid reported by a clone/fork performed remotely.
    new_tid_: Option<pid_t>,
    /// Scratch allocations stack downward from here.
    fixed_sp: RemotePtr<Void>,
}

impl<'a> RemoteSyscalls<'a> {
    pub fn new(t: &'a mut Task) -> RemoteSyscalls<'a> {
        ed_assert!(t, t.is_stopped(), "Remote syscalls need a stopped task");
        let initial_regs = *t.regs_ref();
        let initial_wait_status = t.status();
        let syscall_ip = initial_regs.ip();

        let insn = syscall_instruction_bytes(t.arch());
        let mut replaced_bytes = vec![0u8; insn.len()];
        t.read_bytes_helper(syscall_ip.to_data_ptr(), &mut replaced_bytes, None);
        if replaced_bytes != insn {
            t.write_bytes_helper(
                syscall_ip.to_data_ptr(),
                &insn,
                None,
                WriteFlags::IS_BREAKPOINT_RELATED,
            );
        }

        // Leave the x86-64 redzone alone.
        let fixed_sp = initial_regs.sp() - 128usize;

        RemoteSyscalls {
            t,
            initial_regs,
            initial_wait_status,
            syscall_ip,
            replaced_bytes,
            new_tid_: None,
            fixed_sp,
        }
    }

    pub fn task(&self) -> &Task {
        self.t
    }

    pub fn task_mut(&mut self) -> &mut Task {
        self.t
    }

    pub fn arch(&self) -> SupportedArch {
        self.initial_regs.arch()
    }

    pub fn initial_regs(&self) -> &Registers {
        &self.initial_regs
    }

    /// The tid reported by the last remote clone/fork, if one completed.
    pub fn new_tid(&self) -> Option<pid_t> {
        self.new_tid_
    }

    /// Perform one syscall and return its raw result. -ESRCH means the
    /// task died mid-call; the caller must handle the synthesized exit.
    pub fn syscall(&mut self, syscallno: i32, args: &[usize]) -> isize {
        ed_assert!(self.t, args.len() <= 6);
        if self.t.is_dying() {
            // A previous remote call saw the task die; don't try to run it
            // again.
            return -ESRCH as isize;
        }
        let mut callregs = self.initial_regs;
        callregs.set_ip(self.syscall_ip);
        callregs.set_sp(self.fixed_sp);
        callregs.set_syscallno(syscallno as isize);
        for (i, arg) in args.iter().enumerate() {
            callregs.set_arg(i + 1, *arg);
        }
        self.t.set_regs(&callregs);

        if !self.advance_to_syscall_entry() {
            return -ESRCH as isize;
        }
        {
            let arch = self.arch();
            let observed = self.t.regs_ref().original_syscallno();
            ed_assert_eq!(
                self.t,
                observed,
                syscallno as isize,
                "Tracee entered {} instead of requested {}",
                syscall_name(observed as i32, arch),
                syscall_name(syscallno, arch)
            );
        }
        if !self.advance_to_syscall_exit() {
            return -ESRCH as isize;
        }
        self.t.regs_ref().syscall_result_signed()
    }

    /// A syscall whose failure is a bug, not an environment condition.
    /// Task death is not a failure: the caller's teardown continues
    /// against the synthesized exit event.
    pub fn infallible_syscall(&mut self, syscallno: i32, args: &[usize]) -> isize {
        let result = self.syscall(syscallno, args);
        let arch = self.arch();
        ed_assert!(
            self.t,
            result >= 0 || result < -4096 || result == -ESRCH as isize,
            "Remote {} failed with errno {}",
            syscall_name(syscallno, arch),
            errno_name((-result) as i32)
        );
        result
    }

    /// A forked child inherits the planted syscall instruction and the
    /// staged registers; undo both there, just as the drop of this helper
    /// will undo them in the parent.
    pub fn restore_state_to(&mut self, child: &mut Task) {
        let insn = syscall_instruction_bytes(child.arch());
        if self.replaced_bytes != insn {
            let replaced = self.replaced_bytes.clone();
            let mut ok = true;
            child.write_bytes_helper(
                self.syscall_ip.to_data_ptr(),
                &replaced,
                Some(&mut ok),
                WriteFlags::IS_BREAKPOINT_RELATED,
            );
        }
        let regs = self.initial_regs;
        child.set_regs(&regs);
        child.flush_regs();
    }

    /// Seek the given child fd, accounting for the 32-bit ABI's split
    /// offset.
    pub fn infallible_lseek(&mut self, fd: i32, offset: i64) {
        match self.arch() {
            SupportedArch::X64 => {
                let lseek = syscalls(SupportedArch::X64).lseek;
                self.infallible_syscall(
                    lseek,
                    &[fd as usize, offset as usize, SEEK_SET as usize],
                );
            }
            SupportedArch::X86 => {
                let llseek = syscalls(SupportedArch::X86)._llseek;
                let mut result_mem = AutoRestoreMem::new(self, None, 8);
                let result_addr = result_mem.get().unwrap();
                let hi = ((offset as u64) >> 32) as usize;
                let lo = (offset as u64) as u32 as usize;
                result_mem.remote().infallible_syscall(
                    llseek,
                    &[
                        fd as usize,
                        hi,
                        lo,
                        result_addr.as_usize(),
                        SEEK_SET as usize,
                    ],
                );
            }
        }
    }

    /// Run the staged registers to the syscall-entry stop, consuming any
    /// seccomp event the filter generates for our injected call. Returns
    /// false if the task died.
    fn advance_to_syscall_entry(&mut self) -> bool {
        loop {
            self.t.resume_execution(
                ResumeRequest::ResumeSyscall,
                WaitRequest::ResumeWait,
                TicksRequest::ResumeNoTicks,
                None,
            );
            if self.t.ptrace_event() == Some(PTRACE_EVENT_EXIT) {
                return false;
            }
            if self.t.is_ptrace_seccomp_event() {
                continue;
            }
            if self.t.status().is_syscall() {
                return true;
            }
            if self.t.group_stop_sig().is_some() {
                continue;
            }
            if let Some(sig) = self.t.stop_sig() {
                if self.t.session().is_recording() && !Session::is_ignored_signal(Some(sig)) {
                    self.t.stash_sig();
                }
                continue;
            }
            ed_assert!(
                self.t,
                false,
                "Unexpected stop {} while entering remote syscall",
                self.t.status()
            );
        }
    }

    /// Run from the entry stop to the exit stop. Clone-family events along
    /// the way record the new tid.
    fn advance_to_syscall_exit(&mut self) -> bool {
        loop {
            self.t.resume_execution(
                ResumeRequest::ResumeSyscall,
                WaitRequest::ResumeWait,
                TicksRequest::ResumeNoTicks,
                None,
            );
            match self.t.ptrace_event() {
                Some(PTRACE_EVENT_EXIT) => return false,
                Some(PTRACE_EVENT_CLONE) | Some(PTRACE_EVENT_FORK) | Some(PTRACE_EVENT_VFORK) => {
                    self.new_tid_ = Some(self.t.get_ptrace_eventmsg_pid());
                    continue;
                }
                Some(_) => {
                    ed_assert!(
                        self.t,
                        false,
                        "Unexpected event {} while exiting remote syscall",
                        self.t.status()
                    );
                }
                None => (),
            }
            if self.t.status().is_syscall() {
                return true;
            }
            if self.t.group_stop_sig().is_some() {
                continue;
            }
            if let Some(sig) = self.t.stop_sig() {
                if self.t.session().is_recording() && !Session::is_ignored_signal(Some(sig)) {
                    self.t.stash_sig();
                }
                continue;
            }
            ed_assert!(
                self.t,
                false,
                "Unexpected stop {} while exiting remote syscall",
                self.t.status()
            );
        }
    }
}

impl Drop for RemoteSyscalls<'_> {
    fn drop(&mut self) {
        // The restore writes tolerate a task that died mid-excursion.
        let insn = syscall_instruction_bytes(self.t.arch());
        if self.replaced_bytes != insn {
            let replaced = self.replaced_bytes.clone();
            let mut ok = true;
            self.t.write_bytes_helper(
                self.syscall_ip.to_data_ptr(),
                &replaced,
                Some(&mut ok),
                WriteFlags::IS_BREAKPOINT_RELATED,
            );
        }
        if self.t.is_stopped() {
            let regs = self.initial_regs;
            self.t.set_regs(&regs);
            self.t.flush_regs();
        }
        // A synthesized exit event must stay visible to the caller.
        if !self.t.is_dying() {
            self.t.wait_status = self.initial_wait_status;
        }
    }
}

/// Scratch memory in the tracee, allocated below the stack pointer and
/// restored byte-for-byte on drop.
pub struct AutoRestoreMem<'a, 'b> {
    remote: &'a mut RemoteSyscalls<'b>,
    addr: Option<RemotePtr<Void>>,
    saved: Vec<u8>,
    len: usize,
}

impl<'a, 'b> AutoRestoreMem<'a, 'b> {
    /// Reserve `len` bytes, initialized from `data` when given.
    pub fn new(
        remote: &'a mut RemoteSyscalls<'b>,
        data: Option<&[u8]>,
        len: usize,
    ) -> AutoRestoreMem<'a, 'b> {
        if let Some(d) = data {
            debug_assert_eq!(d.len(), len);
        }
        let sp = remote.fixed_sp - len;
        // Keep the injected syscall's stack clear of our scratch.
        remote.fixed_sp = sp;

        let mut saved = vec![0u8; len];
        let mut ok = true;
        remote
            .t
            .read_bytes_helper(sp, &mut saved, Some(&mut ok));
        let addr = if ok { Some(sp) } else { None };
        if ok {
            if let Some(d) = data {
                remote
                    .t
                    .write_bytes_helper(sp, d, Some(&mut ok), WriteFlags::empty());
            }
        }
        AutoRestoreMem {
            remote,
            addr: if ok { addr } else { None },
            saved,
            len,
        }
    }

    /// Place a NUL-terminated string in scratch memory.
    pub fn push_cstr(remote: &'a mut RemoteSyscalls<'b>, s: &std::ffi::CStr) -> Self {
        let bytes = s.to_bytes_with_nul();
        Self::new(remote, Some(bytes), bytes.len())
    }

    /// The scratch address, or None if the tracee's stack was unusable.
    pub fn get(&self) -> Option<RemotePtr<Void>> {
        self.addr
    }

    pub fn remote(&mut self) -> &mut RemoteSyscalls<'b> {
        self.remote
    }
}

impl Drop for AutoRestoreMem<'_, '_> {
    fn drop(&mut self) {
        if let Some(addr) = self.addr {
            let saved = self.saved.clone();
            let mut ok = true;
            self.remote
                .t
                .write_bytes_helper(addr, &saved, Some(&mut ok), WriteFlags::empty());
        }
        self.remote.fixed_sp = self.remote.fixed_sp + self.len;
    }
}
