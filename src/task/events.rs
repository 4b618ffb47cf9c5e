//! Stop interpretation: driving syscall entry/exit, classifying SIGTRAPs,
//! updating the shared tables on syscall exits, and the exec transition.

use crate::{
    address_space::{AddressSpace, DS_SINGLESTEP, DS_WATCHPOINT_ANY},
    bindings::ptrace::{
        PTRACE_ARCH_PRCTL, PTRACE_EVENT_EXIT, PTRACE_GETREGS, PTRACE_POKEUSER, PTRACE_SETFPREGS,
        PTRACE_SETFPXREGS, PTRACE_SETREGS, PTRACE_SETREGSET, NT_FPREGSET, NT_PRSTATUS,
        NT_X86_XSTATE,
    },
    extra_registers::ExtraRegisters,
    file_monitor,
    kernel_abi::{
        is_at_syscall_instruction, is_mprotect_syscall, syscall_instruction_length, syscalls,
        SupportedArch,
    },
    kernel_supplement::{
        ARCH_GET_FS, ARCH_GET_GS, ARCH_SET_FS, ARCH_SET_GS, F_DUPFD, F_DUPFD_CLOEXEC,
        SHMDT_IPC_CALL,
    },
    registers::{Registers, X86UserRegs},
    remote_code_ptr::RemoteCodePtr,
    remote_ptr::{RemotePtr, Void},
    session::{prname_from_exe_image, PtraceSyscallSeccompOrdering, Session},
    task::{
        memory::{read_mem, read_val_mem},
        ResumeRequest, Task, TicksRequest, TrapReasons, WaitRequest,
    },
    util::is_kernel_trap,
    wait_status::WaitStatus,
};
use super::wait::is_singlestep_resume;
use crate::address_space::BreakpointType;
use libc::{pid_t, CLONE_FILES, ENOSYS, PR_SET_NAME, PR_SET_SECCOMP, SECCOMP_MODE_FILTER, SIGTRAP};
use std::{ffi::OsStr, mem::size_of};

#[repr(C)]
#[derive(Copy, Clone, Default)]
struct X64Iovec {
    base: u64,
    len: u64,
}

#[repr(C)]
#[derive(Copy, Clone, Default)]
struct X86Iovec {
    base: u32,
    len: u32,
}

impl Task {
    /// We're in user space with registers set up to perform a syscall.
    /// Continue into the kernel, consuming exactly one syscall-entry stop
    /// and (when the seccomp filter is live) exactly one seccomp event,
    /// in whichever order this kernel delivers them.
    pub fn enter_syscall(&mut self) {
        let mut need_ptrace_syscall_event = !self.seccomp_bpf_enabled
            || self.session().syscall_seccomp_ordering()
                == PtraceSyscallSeccompOrdering::SeccompBeforeSyscall;
        let mut need_seccomp_event = self.seccomp_bpf_enabled;
        while need_ptrace_syscall_event || need_seccomp_event {
            let resume_how = if need_ptrace_syscall_event {
                ResumeRequest::ResumeSyscall
            } else {
                ResumeRequest::ResumeCont
            };
            self.resume_execution(
                resume_how,
                WaitRequest::ResumeWait,
                TicksRequest::ResumeNoTicks,
                None,
            );
            if self.is_ptrace_seccomp_event() {
                ed_assert!(self, need_seccomp_event);
                need_seccomp_event = false;
                continue;
            }
            ed_assert!(self, self.ptrace_event().is_none());
            if self.session().is_recording() && self.group_stop_sig().is_some() {
                self.stash_group_stop();
                continue;
            }

            if self.stop_sig().is_none() {
                ed_assert!(self, need_ptrace_syscall_event);
                need_ptrace_syscall_event = false;
                continue;
            }
            if Session::is_ignored_signal(self.stop_sig()) && self.session().is_replaying() {
                continue;
            }
            ed_assert!(
                self,
                self.session().is_recording(),
                " got unexpected signal {}",
                self.stop_sig().unwrap()
            );
            self.stash_sig();
        }
    }

    /// We observed syscall entry (via seccomp event or syscall-stop).
    /// Continue to the syscall-exit trap. False if the process exits
    /// first.
    pub fn exit_syscall(&mut self) -> bool {
        // With syscall-before-seccomp ordering we may be at the entry trap
        // with the seccomp event still to come; bring us past it.
        let mut will_see_seccomp = self.seccomp_bpf_enabled
            && self.session().syscall_seccomp_ordering()
                == PtraceSyscallSeccompOrdering::SyscallBeforeSeccomp
            && !self.is_ptrace_seccomp_event();
        loop {
            self.resume_execution(
                ResumeRequest::ResumeSyscall,
                WaitRequest::ResumeWait,
                TicksRequest::ResumeNoTicks,
                None,
            );
            if will_see_seccomp && self.is_ptrace_seccomp_event() {
                will_see_seccomp = false;
                continue;
            }
            if self.ptrace_event() == Some(PTRACE_EVENT_EXIT) {
                return false;
            }
            ed_assert!(self, self.ptrace_event().is_none());
            if self.stop_sig().is_none() {
                let arch = self.arch();
                self.canonicalize_regs(arch);
                return true;
            }
            if Session::is_ignored_signal(self.stop_sig()) && self.session().is_replaying() {
                continue;
            }
            ed_assert!(self, self.session().is_recording());
            self.stash_sig();
        }
    }

    /// This must be an emulated syscall entered through SYSEMU (not
    /// checked). Step over the syscall instruction to "exit" the emulated
    /// syscall and land in a signal-stop, leaving registers as they were.
    ///
    /// The single-step re-executes the instruction at the syscall ip, so
    /// an internal breakpoint is planted there first in case control flow
    /// escapes.
    pub fn finish_emulated_syscall(&mut self) {
        let r = *self.regs_ref();
        let ip = r.ip();

        let vm = self.vm();
        let bkpt_set = vm.add_breakpoint(self, ip, BreakpointType::BkptInternal);

        self.resume_execution(
            ResumeRequest::ResumeSysemuSinglestep,
            WaitRequest::ResumeWait,
            // Not counting ticks also avoids counting an event when the
            // instruction after the syscall is a conditional branch.
            TicksRequest::ResumeNoTicks,
            None,
        );

        if bkpt_set {
            vm.remove_breakpoint(self, ip, BreakpointType::BkptInternal);
        }

        let stop_ok = self.stop_sig().map_or(false, |s| {
            s.as_raw() == SIGTRAP || Session::is_ignored_signal(Some(s))
        });
        ed_assert!(
            self,
            stop_ok || self.ptrace_event() == Some(PTRACE_EVENT_EXIT),
            "Unexpected stop {} finishing emulated syscall",
            self.status()
        );

        self.set_regs(&r);
        self.wait_status = WaitStatus::default();
    }

    /// We just entered a syscall; exit it and reset state so the syscall
    /// can be re-entered exactly as it was first called. False if the
    /// process exits instead.
    pub fn exit_syscall_and_prepare_restart(&mut self) -> bool {
        let mut r: Registers = *self.regs_ref();
        let syscallno = r.original_syscallno() as i32;
        let arch = r.arch();
        log!(
            crate::log::LogDebug,
            "exit_syscall_and_prepare_restart from syscall {}",
            crate::kernel_metadata::syscall_name(syscallno, arch)
        );
        // Hijack the syscall into a harmless gettid.
        r.set_original_syscallno(syscalls(arch).gettid as isize);
        self.set_regs(&r);
        if !self.exit_syscall() {
            // The tracee suddenly exited; make it look like we really
            // entered the original syscall so the exit event records
            // something sensible.
            r.set_original_syscallno(syscallno as isize);
            r.set_syscall_result_signed(-ENOSYS as isize);
            self.set_regs(&r);
            return false;
        }
        log!(crate::log::LogDebug, "exit_syscall_and_prepare_restart done");

        // Restore the registers to what they were just before the tracee
        // trapped at the syscall.
        r.set_original_syscallno(-1);
        r.set_syscallno(syscallno as isize);
        r.set_ip(r.ip() - syscall_instruction_length(arch));
        self.set_regs(&r);
        true
    }

    /// Which ABI the syscall instruction just before the current ip was
    /// issued under.
    pub fn detect_syscall_arch(&mut self) -> SupportedArch {
        let arch = self.arch();
        let code_ptr = self.regs_ref().ip().decrement_by_syscall_insn_length(arch);
        let mut insn = [0u8; 2];
        let mut ok = true;
        self.read_bytes_helper(
            RemotePtr::cast(code_ptr.to_data_ptr::<u8>()),
            &mut insn,
            Some(&mut ok),
        );
        ed_assert!(self, ok, "Can't read syscall instruction at {}", code_ptr);
        match insn {
            [0x0f, 0x05] => SupportedArch::X64,
            [0xcd, 0x80] | [0x0f, 0x34] => SupportedArch::X86,
            _ => {
                ed_assert!(self, false, "No syscall instruction at {}", code_ptr);
                unreachable!()
            }
        }
    }

    /// Determine why a SIGTRAP occurred. Uses debug_status() but doesn't
    /// consume it.
    pub fn compute_trap_reasons(&mut self) -> TrapReasons {
        ed_assert_eq!(self, self.stop_sig().map(|s| s.as_raw()), Some(SIGTRAP));
        let mut reasons = TrapReasons::default();
        let status = self.debug_status();
        reasons.singlestep = status & DS_SINGLESTEP != 0;

        let addr_last_execution_resume = self.address_of_last_execution_resume;
        if is_singlestep_resume(self.how_last_execution_resumed)
            && is_at_syscall_instruction(self, addr_last_execution_resume)
            && self.ip()
                == addr_last_execution_resume.increment_by_syscall_insn_length(self.arch())
        {
            // The kernel does not set DS_SINGLESTEP when stepping over a
            // syscall instruction; detect that here.
            reasons.singlestep = true;
        }

        // Single-stepping hides watchpoint firings on some hypervisors;
        // value snapshots catch changed write-watchpoints regardless.
        if status & (DS_WATCHPOINT_ANY | DS_SINGLESTEP) != 0 {
            let vm = self.vm();
            let singlestep_start = if is_singlestep_resume(self.how_last_execution_resumed) {
                addr_last_execution_resume
            } else {
                RemoteCodePtr::null()
            };
            vm.notify_watchpoint_fired(self, status, singlestep_start);
        }
        reasons.watchpoint =
            self.vm().has_any_watchpoint_changes() || (status & DS_WATCHPOINT_ANY != 0);

        // If a breakpoint fired, this would be its address.
        let ip_at_breakpoint = self.ip().decrement_by_bkpt_insn_length(self.arch());
        if reasons.singlestep {
            reasons.breakpoint =
                AddressSpace::is_breakpoint_instruction(self, addr_last_execution_resume);
            if reasons.breakpoint {
                ed_assert_eq!(self, addr_last_execution_resume, ip_at_breakpoint);
            }
        } else if reasons.watchpoint {
            // We didn't single-step, so watchpoint state is accurate. The
            // only way the last instruction could have triggered a
            // watchpoint and be a breakpoint instruction is an EXEC
            // watchpoint at the breakpoint address.
            reasons.breakpoint = self.vm().has_exec_watchpoint_fired(ip_at_breakpoint)
                && AddressSpace::is_breakpoint_instruction(self, ip_at_breakpoint);
        } else {
            let si = *self.get_siginfo();
            ed_assert_eq!(self, SIGTRAP, si.si_signo, " expected SIGTRAP, got {:?}", si);
            reasons.breakpoint = is_kernel_trap(si.si_code);
            if reasons.breakpoint {
                let is_a_breakpoint =
                    AddressSpace::is_breakpoint_instruction(self, ip_at_breakpoint);
                ed_assert!(
                    self,
                    is_a_breakpoint,
                    " expected breakpoint at {}, got siginfo {:?}",
                    ip_at_breakpoint,
                    si
                );
            }
        }
        reasons
    }

    /// Call this just before exiting a syscall: task attributes and the
    /// shared tables often need updating based on the finishing syscall.
    /// Use `regs` instead of the cached registers; some registers may not
    /// be committed to the task yet.
    pub fn on_syscall_exit(&mut self, sys: i32, arch: SupportedArch, regs: &Registers) {
        let nr = syscalls(arch);

        // mprotect can change the protection of part of the range before
        // failing; every other failing syscall changed nothing.
        if regs.syscall_failed() && !is_mprotect_syscall(sys, arch) {
            return;
        }

        if sys == nr.brk || sys == nr.mmap || sys == nr.mmap2 || sys == nr.mremap {
            log!(
                crate::log::LogDebug,
                "(brk/mmap/mmap2/mremap are handled by the remote map layer)"
            );
            return;
        }

        if sys == nr.mprotect {
            let addr: RemotePtr<Void> = regs.arg1().into();
            let num_bytes = regs.arg2();
            let prot =
                nix::sys::mman::ProtFlags::from_bits_truncate(regs.arg3_signed() as i32);
            self.vm().protect(addr, num_bytes, prot);
            return;
        }

        if sys == nr.munmap {
            let addr: RemotePtr<Void> = regs.arg1().into();
            let num_bytes = regs.arg2();
            self.vm().unmap(addr, num_bytes);
            return;
        }

        if sys == nr.shmdt {
            return self.process_shmdt(regs.arg1().into());
        }

        if sys == nr.ipc && regs.arg1() as u32 == SHMDT_IPC_CALL {
            return self.process_shmdt(regs.arg5().into());
        }

        if sys == nr.madvise {
            let addr: RemotePtr<Void> = regs.arg1().into();
            let num_bytes = regs.arg2();
            let advice = regs.arg3() as i32;
            self.vm().advise(addr, num_bytes, advice);
            return;
        }

        if sys == nr.set_thread_area {
            self.set_thread_area(regs.arg1().into());
            return;
        }

        if sys == nr.prctl {
            match regs.arg1_signed() as i32 {
                PR_SET_SECCOMP => {
                    if regs.arg2() == SECCOMP_MODE_FILTER as usize
                        && self.session().is_recording()
                    {
                        self.seccomp_bpf_enabled = true;
                    }
                }
                PR_SET_NAME => {
                    self.update_prname(regs.arg2().into());
                }
                _ => (),
            }
            return;
        }

        if sys == nr.dup || sys == nr.dup2 || sys == nr.dup3 {
            let ft = self.fd_table();
            ft.borrow_mut()
                .did_dup(regs.arg1() as i32, regs.syscall_result() as i32);
            return;
        }

        if sys == nr.fcntl || sys == nr.fcntl64 {
            if regs.arg2() == F_DUPFD || regs.arg2() == F_DUPFD_CLOEXEC {
                let ft = self.fd_table();
                ft.borrow_mut()
                    .did_dup(regs.arg1() as i32, regs.syscall_result() as i32);
            }
            return;
        }

        if sys == nr.close {
            let ft = self.fd_table();
            ft.borrow_mut().did_close(regs.arg1() as i32);
            return;
        }

        if sys == nr.unshare {
            if regs.arg1() & CLONE_FILES as usize != 0 {
                let ft = self.fd_table();
                ft.borrow_mut().task_set_mut().erase(self.serial());
                let new_fds = ft.borrow().clone_into_task(self);
                self.fds = Some(new_fds);
            }
            return;
        }

        if sys == nr.write || sys == nr.pwrite64 {
            let fd = regs.arg1_signed() as i32;
            let mut ranges: Vec<file_monitor::Range> = Vec::new();
            let amount = regs.syscall_result_signed();
            if amount > 0 {
                ranges.push(file_monitor::Range::new(regs.arg2().into(), amount as usize));
            }
            let offset = pwrite_offset(sys, arch, regs);
            let ft = self.fd_table();
            ft.borrow().did_write(self, fd, &ranges, offset);
            return;
        }

        if sys == nr.writev || sys == nr.pwritev {
            let fd = regs.arg1_signed() as i32;
            let ranges = self.ranges_of_writev(arch, regs);
            let offset = pwrite_offset(sys, arch, regs);
            let ft = self.fd_table();
            ft.borrow().did_write(self, fd, &ranges, offset);
            return;
        }

        if sys == nr.ptrace {
            self.process_ptrace(arch, regs);
        }
    }

    /// The written ranges of a writev-family call, clipped to the number
    /// of bytes the kernel reported written.
    fn ranges_of_writev(&mut self, arch: SupportedArch, regs: &Registers) -> Vec<file_monitor::Range> {
        let mut ranges = Vec::new();
        let mut written = regs.syscall_result_signed();
        ed_assert!(self, written >= 0);
        match arch {
            SupportedArch::X64 => {
                let iovs = read_mem::<X64Iovec>(
                    self,
                    RemotePtr::new(regs.arg2()),
                    regs.arg3(),
                    None,
                );
                for iov in iovs {
                    let amount = std::cmp::min(written, iov.len as isize);
                    if amount > 0 {
                        ranges.push(file_monitor::Range::new(
                            RemotePtr::new(iov.base as usize),
                            amount as usize,
                        ));
                        written -= amount;
                    }
                }
            }
            SupportedArch::X86 => {
                let iovs = read_mem::<X86Iovec>(
                    self,
                    RemotePtr::new(regs.arg2()),
                    regs.arg3(),
                    None,
                );
                for iov in iovs {
                    let amount = std::cmp::min(written, iov.len as isize);
                    if amount > 0 {
                        ranges.push(file_monitor::Range::new(
                            RemotePtr::new(iov.base as usize),
                            amount as usize,
                        ));
                        written -= amount;
                    }
                }
            }
        }
        ranges
    }

    fn process_shmdt(&mut self, addr: RemotePtr<Void>) {
        // The whole mapping starting at `addr` goes away.
        let vm = self.vm();
        match vm.get_shm_size(addr) {
            Some(size) => {
                vm.remove_shm_size(addr);
                vm.unmap(addr, size);
            }
            None => {
                ed_assert!(self, false, "shmdt of unknown segment at {}", addr);
            }
        }
    }

    /// A tracee used ptrace on another tracee: apply register-state
    /// mutations to the sub-tracee's *cached* state so nested ptrace is
    /// transparent.
    fn process_ptrace(&mut self, arch: SupportedArch, regs: &Registers) {
        let request = regs.arg1() as u32;
        let pid = regs.arg2_signed() as pid_t;
        let maybe_tracee = self.session().find_task_from_rec_tid(pid);
        match request {
            PTRACE_SETREGS => {
                let tracee_rc = maybe_tracee.unwrap();
                let size = match arch {
                    SupportedArch::X64 => size_of::<libc::user_regs_struct>(),
                    SupportedArch::X86 => size_of::<X86UserRegs>(),
                };
                let data = read_mem::<u8>(self, RemotePtr::new(regs.arg4()), size, None);
                let mut tracee = tracee_rc.borrow_mut();
                let mut r: Registers = *tracee.regs_ref();
                r.set_from_ptrace_for_arch(arch, &data);
                tracee.set_regs(&r);
            }
            PTRACE_SETFPREGS => {
                let tracee_rc = maybe_tracee.unwrap();
                let data = read_mem::<u8>(
                    self,
                    RemotePtr::new(regs.arg4()),
                    crate::extra_registers::FXSAVE_SIZE,
                    None,
                );
                let mut tracee = tracee_rc.borrow_mut();
                let mut r: ExtraRegisters = tracee.extra_regs().clone();
                r.set_user_fpregs_struct(arch, &data);
                tracee.set_extra_regs(&r);
            }
            PTRACE_SETFPXREGS => {
                let tracee_rc = maybe_tracee.unwrap();
                let data = read_mem::<u8>(
                    self,
                    RemotePtr::new(regs.arg4()),
                    crate::extra_registers::FXSAVE_SIZE,
                    None,
                );
                let mut tracee = tracee_rc.borrow_mut();
                let mut r = tracee.extra_regs().clone();
                r.set_user_fpxregs_struct(&data);
                tracee.set_extra_regs(&r);
            }
            PTRACE_SETREGSET => {
                let tracee_rc = maybe_tracee.unwrap();
                match regs.arg3() as u32 {
                    NT_PRSTATUS => {
                        let size = match arch {
                            SupportedArch::X64 => size_of::<libc::user_regs_struct>(),
                            SupportedArch::X86 => size_of::<X86UserRegs>(),
                        };
                        let set = self.ptrace_get_regs_set(arch, regs, size);
                        let mut tracee = tracee_rc.borrow_mut();
                        let mut r = *tracee.regs_ref();
                        r.set_from_ptrace_for_arch(arch, &set);
                        tracee.set_regs(&r);
                    }
                    NT_FPREGSET => {
                        let set = self.ptrace_get_regs_set(
                            arch,
                            regs,
                            crate::extra_registers::FXSAVE_SIZE,
                        );
                        let mut tracee = tracee_rc.borrow_mut();
                        let mut r = tracee.extra_regs().clone();
                        r.set_user_fpregs_struct(arch, &set);
                        tracee.set_extra_regs(&r);
                    }
                    NT_X86_XSTATE => {
                        let min_size = {
                            let mut tracee = tracee_rc.borrow_mut();
                            ed_assert_eq!(
                                &*tracee,
                                tracee.extra_regs().format(),
                                crate::extra_registers::Format::XSave,
                                "Unknown ExtraRegisters format"
                            );
                            tracee.extra_regs().data_size()
                        };
                        let set = self.ptrace_get_regs_set(arch, regs, min_size);
                        let mut tracee = tracee_rc.borrow_mut();
                        let tracee_arch = tracee.arch();
                        let mut r = ExtraRegisters::new(tracee_arch);
                        let ok = r.set_to_raw_data(
                            tracee_arch,
                            crate::extra_registers::Format::XSave,
                            &set,
                        );
                        ed_assert!(&*tracee, ok, "Invalid XSAVE data");
                        tracee.set_extra_regs(&r);
                    }
                    _ => {
                        ed_assert!(
                            self,
                            false,
                            "Unknown regset type; should have been rejected earlier"
                        );
                    }
                }
            }
            PTRACE_POKEUSER => {
                let tracee_rc = maybe_tracee.unwrap();
                let mut tracee = tracee_rc.borrow_mut();
                let addr: usize = regs.arg3();
                let data = regs.arg4();
                let regs_size = match arch {
                    SupportedArch::X64 => size_of::<libc::user_regs_struct>(),
                    SupportedArch::X86 => size_of::<X86UserRegs>(),
                };
                if addr < regs_size {
                    let mut r: Registers = *tracee.regs_ref();
                    r.write_register_by_user_offset(addr, data);
                    tracee.set_regs(&r);
                } else {
                    let u_debugreg_offset = offset_of!(libc::user, u_debugreg);
                    let word = size_of::<usize>();
                    if addr >= u_debugreg_offset && addr < u_debugreg_offset + 8 * word {
                        let regno = (addr - u_debugreg_offset) / word;
                        tracee.set_debug_reg(regno, data);
                    }
                }
            }
            PTRACE_ARCH_PRCTL => {
                let code = regs.arg4() as u32;
                match code {
                    ARCH_GET_FS | ARCH_GET_GS => (),
                    ARCH_SET_FS | ARCH_SET_GS => {
                        let tracee_rc = maybe_tracee.unwrap();
                        let mut tracee = tracee_rc.borrow_mut();
                        let mut r: Registers = *tracee.regs_ref();
                        if regs.arg3() == 0 {
                            // Pre-4.7 kernels don't set a zero fs/gs base
                            // through the regset path correctly; forward
                            // the real ptrace call.
                            tracee.ptrace_if_alive(
                                PTRACE_ARCH_PRCTL,
                                regs.arg3().into(),
                                &mut crate::task::PtraceData::ReadWord(regs.arg4()),
                            );
                        }
                        if code == ARCH_SET_FS {
                            r.set_fs_base(regs.arg3() as u64);
                        } else {
                            r.set_gs_base(regs.arg3() as u64);
                        }
                        tracee.set_regs(&r);
                    }
                    _ => {
                        let tracee_rc = maybe_tracee.unwrap();
                        let tracee = tracee_rc.borrow();
                        ed_assert!(&*tracee, false, "Should have been detected earlier");
                    }
                }
            }
            _ => (),
        }
    }

    /// Dig the regset buffer out of the iovec a tracee passed to
    /// PTRACE_SETREGSET.
    fn ptrace_get_regs_set(
        &mut self,
        arch: SupportedArch,
        regs: &Registers,
        min_size: usize,
    ) -> Vec<u8> {
        let (base, len) = match arch {
            SupportedArch::X64 => {
                let iov = read_val_mem::<X64Iovec>(self, RemotePtr::new(regs.arg4()), None);
                (iov.base as usize, iov.len as usize)
            }
            SupportedArch::X86 => {
                let iov = read_val_mem::<X86Iovec>(self, RemotePtr::new(regs.arg4()), None);
                (iov.base as usize, iov.len as usize)
            }
        };
        ed_assert!(
            self,
            len >= min_size,
            "Should have been caught during prepare_ptrace"
        );
        read_mem::<u8>(self, RemotePtr::new(base), len, None)
    }

    /// The tracee completed an execve: registers must be re-read under the
    /// kernel-reported arch, the address space is replaced wholesale, and
    /// the fd table is cloned since the kernel unshares it on exec.
    pub fn post_exec_for_exe(&mut self, exe_file: &OsStr) {
        // Clean up our old buffers through a stopped sibling sharing the
        // dying address space, if there is one. (They can't be cleaned up
        // before the exec: it might have failed.)
        let mut stopped_sibling = None;
        let mut other_task_in_address_space = false;
        for t in self.vm().task_set().iter_except(self.serial()) {
            other_task_in_address_space = true;
            if t.borrow().is_stopped() {
                stopped_sibling = Some(t);
                break;
            }
        }
        match stopped_sibling {
            Some(sibling) => {
                let syscallbuf_child = self.syscallbuf_child;
                let syscallbuf_size = self.syscallbuf_size;
                let scratch_ptr = self.scratch_ptr;
                let scratch_size = self.scratch_size;
                let mut sib = sibling.borrow_mut();
                let mut remote = crate::remote_syscalls::RemoteSyscalls::new(&mut sib);
                super::lifecycle::unmap_buffers_for(
                    &mut remote,
                    RemotePtr::cast(syscallbuf_child),
                    syscallbuf_size,
                    scratch_ptr,
                    scratch_size,
                );
            }
            None => {
                if other_task_in_address_space {
                    // No stopped task to run the unmaps in; the buffers
                    // leak until the address space dies.
                    log!(
                        crate::log::LogWarn,
                        "Intentionally leaking syscallbuf after exec for task {}",
                        self.tid
                    );
                }
            }
        }

        self.vm().task_set_mut().erase(self.serial());
        self.fd_table().borrow_mut().task_set_mut().erase(self.serial());

        // did_waitpid skipped the register refresh at the exec event;
        // refresh now and let the code segment tell us the new arch.
        let mut ptrace_regs: libc::user_regs_struct = unsafe { std::mem::zeroed() };
        self.ptrace_if_alive(
            PTRACE_GETREGS,
            RemotePtr::null(),
            &mut crate::task::PtraceData::WriteInto(crate::util::u8_slice_mut(
                &mut ptrace_regs,
            )),
        );
        let mut new_regs = Registers::new(arch_of_exec_regs(&ptrace_regs));
        new_regs.set_from_ptrace(&ptrace_regs);
        // Rewrite the syscall number to execve *for the new arch*. If the
        // arch changed, the old arch's execve number would otherwise be
        // misinterpreted under the new arch.
        new_regs.set_original_syscallno(syscalls(new_regs.arch()).execve as isize);
        self.registers = new_regs;
        self.registers_dirty = true;

        self.extra_registers = ExtraRegisters::new(self.arch());
        self.extra_registers_known = false;
        let mut e = self.extra_regs().clone();
        e.reset();
        self.set_extra_regs(&e);

        self.syscallbuf_child = RemotePtr::null();
        self.syscallbuf_size = 0;
        self.scratch_ptr = RemotePtr::null();
        self.scratch_size = 0;
        self.desched_fd_child = -1;
        self.cloned_file_data_fd_child = -1;
        self.preload_globals = None;
        self.thread_group().borrow_mut().execed = true;
        self.thread_areas_.clear();
        self.thread_locals = [0u8; crate::preload_interface::PRELOAD_THREAD_LOCALS_SIZE];

        let exec_count = self.vm().uid().exec_count() + 1;
        let session = self.session();
        let new_vm = session.create_vm(exe_file, self.rec_tid, self.serial(), exec_count);
        new_vm.task_set_mut().insert(self);
        self.as_ = Some(new_vm);
        // It's barely documented, but Linux unshares the fd table on exec.
        let new_fds = self.fd_table().borrow().clone_into_task(self);
        self.fds = Some(new_fds);
        self.prname = prname_from_exe_image(exe_file).to_os_string();
    }

    /// The execve syscall exited successfully; remote syscalls are safe
    /// from here on.
    pub fn post_exec_syscall(&mut self) {
        let arch = self.arch();
        self.canonicalize_regs(arch);
        self.open_mem_fd();
    }

    /// True if this thread group has execed.
    pub fn execed(&self) -> bool {
        self.thread_group().borrow().execed
    }
}

/// The ABI the exec landed in, from the code segment selector.
fn arch_of_exec_regs(regs: &libc::user_regs_struct) -> SupportedArch {
    if regs.cs == 0x33 {
        SupportedArch::X64
    } else {
        SupportedArch::X86
    }
}

/// The file offset of a positional write, assembled from two 32-bit words
/// on 32-bit arches; -1 for the non-positional variants.
fn pwrite_offset(sys: i32, arch: SupportedArch, regs: &Registers) -> i64 {
    let nr = syscalls(arch);
    if sys == nr.write || sys == nr.writev {
        return -1;
    }
    match arch {
        SupportedArch::X64 => regs.arg4() as i64,
        SupportedArch::X86 => ((regs.arg5() as u64) << 32 | regs.arg4() as u64) as i64,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn positional_write_offsets() {
        let mut r = Registers::new(SupportedArch::X86);
        r.set_arg4(0x1000);
        r.set_arg5(0x2);
        let nr86 = syscalls(SupportedArch::X86);
        assert_eq!(0x2_0000_1000, pwrite_offset(nr86.pwrite64, SupportedArch::X86, &r));
        assert_eq!(-1, pwrite_offset(nr86.write, SupportedArch::X86, &r));

        let mut r64 = Registers::new(SupportedArch::X64);
        r64.set_arg4(0x1234_5678_9abc);
        let nr64 = syscalls(SupportedArch::X64);
        assert_eq!(
            0x1234_5678_9abc,
            pwrite_offset(nr64.pwrite64, SupportedArch::X64, &r64)
        );
        assert_eq!(-1, pwrite_offset(nr64.writev, SupportedArch::X64, &r64));
    }

    #[test]
    fn exec_arch_detection() {
        let mut regs: libc::user_regs_struct = unsafe { std::mem::zeroed() };
        regs.cs = 0x33;
        assert_eq!(SupportedArch::X64, arch_of_exec_regs(&regs));
        regs.cs = 0x23;
        assert_eq!(SupportedArch::X86, arch_of_exec_regs(&regs));
    }
}
