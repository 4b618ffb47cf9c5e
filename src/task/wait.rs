//! Resume/wait: every transition between "running" and "stopped" goes
//! through here, and `did_waitpid` is the single point where a kernel stop
//! becomes visible task state.

use crate::{
    bindings::{
        ptrace::{PTRACE_EVENT_EXEC, PTRACE_EVENT_EXIT, PTRACE_GETREGS, PTRACE_GETSIGINFO, PTRACE_INTERRUPT},
        signal::{siginfo_t, POLL_IN},
    },
    kernel_abi::SupportedArch,
    kernel_metadata::ptrace_req_name,
    perf_counters::TIME_SLICE_SIGNAL,
    registers::Registers,
    remote_ptr::RemotePtr,
    sig::Sig,
    task::{PtraceData, ResumeRequest, Task, TicksRequest, WaitRequest, MAX_TICKS_REQUEST},
    ticks::Ticks,
    util::{is_zombie_process, to_timeval, u8_slice_mut},
    wait_status::WaitStatus,
};
use crate::address_space::BreakpointType;
use libc::{itimerval, pid_t, setitimer, waitpid, EINTR, ITIMER_REAL, SIGKILL, SIGTRAP, WNOHANG, __WALL};
use nix::errno::errno;
use std::{cmp::max, ptr};

/// A group-stop immediately after PTRACE_INTERRUPT may report SIGTRAP or
/// (undocumented, but observed) SIGSTOP.
pub(crate) fn is_signal_triggered_by_ptrace_interrupt(group_stop_sig: Option<Sig>) -> bool {
    match group_stop_sig {
        Some(sig) => sig.as_raw() == SIGTRAP || sig == crate::sig::SIGSTOP,
        None => false,
    }
}

pub(crate) fn is_singlestep_resume(request: ResumeRequest) -> bool {
    request == ResumeRequest::ResumeSinglestep
        || request == ResumeRequest::ResumeSysemuSinglestep
}

impl Task {
    /// Resume execution `how`, delivering `maybe_sig` if nonzero. After
    /// resuming, `wait_how`. The perf counters are rearmed per
    /// `tick_period`.
    ///
    /// All tracee execution goes through here.
    pub fn resume_execution(
        &mut self,
        how: ResumeRequest,
        wait_how: WaitRequest,
        tick_period: TicksRequest,
        maybe_sig: Option<Sig>,
    ) {
        ed_assert!(self, self.is_stopped);
        ed_assert!(
            self,
            !self.seen_ptrace_exit_event,
            "Resuming a task that has already reported PTRACE_EVENT_EXIT"
        );

        match tick_period {
            TicksRequest::ResumeNoTicks => (),
            TicksRequest::ResumeUnlimitedTicks => {
                self.hpc.reset(0);
            }
            TicksRequest::ResumeWithTicksRequest(tr) => {
                ed_assert!(self, tr <= MAX_TICKS_REQUEST);
                let adjusted_tr = max(1, tr);
                self.hpc.reset(adjusted_tr);
            }
        }
        let sig_string = match maybe_sig {
            Some(sig) => format!(", signal: {}", sig),
            None => String::new(),
        };
        log!(
            crate::log::LogDebug,
            "resuming execution of tid {} with {}{} tick_period: {:?}",
            self.tid,
            ptrace_req_name(how as u32),
            sig_string,
            tick_period
        );
        self.address_of_last_execution_resume = self.ip();
        self.how_last_execution_resumed = how;
        self.set_debug_status(0);

        self.flush_regs();

        let mut wait_ret: pid_t = 0;
        if self.session().is_recording() {
            // A stopped task can be woken by a SIGKILL and advance to the
            // PTRACE_EVENT_EXIT stop just before our resume. The resume
            // would let it continue and exit, denying us the event and the
            // cleanup it gates. Poll for that stop here. The race isn't
            // fully closed (the SIGKILL can land after this poll), but the
            // window is tiny.
            let mut raw_status: i32 = 0;
            wait_ret = unsafe { waitpid(self.tid, &mut raw_status, WNOHANG | __WALL) };
            ed_assert!(
                self,
                wait_ret >= 0,
                "waitpid({}, NOHANG) failed with {}",
                self.tid,
                wait_ret
            );
            let status = WaitStatus::new(raw_status);
            if wait_ret == self.tid {
                // Sometimes a SIGKILLed child doesn't even produce a
                // PTRACE_EVENT_EXIT, just the bare exit status.
                ed_assert!(
                    self,
                    status.ptrace_event() == Some(PTRACE_EVENT_EXIT)
                        || status.fatal_sig() == Some(SIGKILL),
                    "got {:?}",
                    status
                );
            } else {
                ed_assert!(
                    self,
                    wait_ret == 0,
                    "waitpid({}, NOHANG) failed with {}",
                    self.tid,
                    wait_ret
                );
            }
        }
        if wait_ret == self.tid {
            log!(crate::log::LogDebug, "Task {} exited unexpectedly", self.tid);
            // wait() will report the ptrace-exit event.
            self.detected_unexpected_exit = true;
        } else {
            match maybe_sig {
                None => {
                    self.ptrace_if_alive(how as u32, RemotePtr::null(), &mut PtraceData::None);
                }
                Some(sig) => {
                    self.ptrace_if_alive(
                        how as u32,
                        RemotePtr::null(),
                        &mut PtraceData::ReadWord(sig.as_raw() as usize),
                    );
                }
            }
        }

        self.is_stopped = false;
        self.extra_registers_known = false;
        if wait_how == WaitRequest::ResumeWait {
            self.wait(None);
        }
    }

    /// Block until this task's status changes. Expects the wait to end in
    /// a stop. If `maybe_interrupt_after_elapsed` is given (recording
    /// only), a real-timer SIGALRM breaks the wait after that many seconds
    /// and the task is nudged with PTRACE_INTERRUPT.
    pub fn wait(&mut self, maybe_interrupt_after_elapsed: Option<f64>) {
        let interrupt_after_elapsed = maybe_interrupt_after_elapsed.unwrap_or(0.0);
        debug_assert!(interrupt_after_elapsed >= 0.0);
        log!(
            crate::log::LogDebug,
            "going into blocking waitpid({}) ...",
            self.tid
        );
        ed_assert!(self, !self.unstable.get(), "Don't wait for unstable tasks");
        ed_assert!(
            self,
            self.session().is_recording() || interrupt_after_elapsed == 0.0
        );

        if self.wait_unexpected_exit() {
            return;
        }

        let mut status: WaitStatus;
        let mut sent_wait_interrupt = false;
        let mut ret: pid_t;
        loop {
            if interrupt_after_elapsed > 0.0 {
                let mut timer: itimerval = unsafe { std::mem::zeroed() };
                timer.it_value = to_timeval(interrupt_after_elapsed);
                unsafe {
                    setitimer(ITIMER_REAL, &timer, ptr::null_mut());
                }
            }
            let mut raw_status: i32 = 0;
            ret = unsafe { waitpid(self.tid, &mut raw_status, __WALL) };
            status = WaitStatus::new(raw_status);
            if interrupt_after_elapsed > 0.0 {
                let timer: itimerval = unsafe { std::mem::zeroed() };
                unsafe { setitimer(ITIMER_REAL, &timer, ptr::null_mut()) };
            }
            if ret >= 0 || errno() != EINTR {
                // waitpid was not interrupted by the alarm.
                break;
            }

            if is_zombie_process(self.real_tgid()) {
                // The process is dead; stop waiting for it or we might
                // never make progress. It's unclear why waitpid doesn't
                // simply return in this situation, but in some cases it
                // never does.
                log!(
                    crate::log::LogWarn,
                    "Synthesizing PTRACE_EVENT_EXIT for zombie process {}",
                    self.tid
                );
                status = WaitStatus::for_ptrace_event(PTRACE_EVENT_EXIT);
                ret = self.tid;
                break;
            }

            if !sent_wait_interrupt && interrupt_after_elapsed > 0.0 {
                self.ptrace_if_alive(PTRACE_INTERRUPT, RemotePtr::null(), &mut PtraceData::None);
                sent_wait_interrupt = true;
                self.expecting_ptrace_interrupt_stop = 2;
            }
        }

        if ret >= 0 && status.exit_code().is_some() {
            // A non-stopping exit status came back. That shouldn't happen:
            // a PTRACE_EVENT_EXIT should be observed first, and we kill
            // the task before waiting again, leaving the exit code to
            // detach-and-reap. But it is seen, rarely, when many threads
            // die at once; accept it and normalize.
            ed_assert!(
                self,
                !self.seen_ptrace_exit_event,
                "A PTRACE_EVENT_EXIT was observed for this task, but somehow forgotten"
            );
            log!(
                crate::log::LogWarn,
                "Synthesizing PTRACE_EVENT_EXIT for process {} exited with {}",
                self.tid,
                status.exit_code().unwrap()
            );
            status = WaitStatus::for_ptrace_event(PTRACE_EVENT_EXIT);
        }

        log!(
            crate::log::LogDebug,
            "  waitpid({}) returns {}; status {}",
            self.tid,
            ret,
            status
        );
        ed_assert!(
            self,
            self.tid == ret,
            "waitpid({}) failed with {}",
            self.tid,
            ret
        );

        if sent_wait_interrupt {
            log!(crate::log::LogWarn, "Forced to PTRACE_INTERRUPT tracee");
            if !is_signal_triggered_by_ptrace_interrupt(status.group_stop_sig()) {
                log!(
                    crate::log::LogWarn,
                    "  PTRACE_INTERRUPT raced with another event {:?}",
                    status
                );
            }
        }
        self.did_waitpid(status);
    }

    /// Like wait(), but don't block. True if a status was collected.
    pub fn try_wait(&mut self) -> bool {
        if self.wait_unexpected_exit() {
            return true;
        }

        let mut raw_status: i32 = 0;
        let ret = unsafe { waitpid(self.tid, &mut raw_status, WNOHANG | __WALL) };
        ed_assert!(
            self,
            ret >= 0,
            "waitpid({}, NOHANG) failed with {}",
            self.tid,
            ret
        );
        log!(
            crate::log::LogDebug,
            "waitpid({}, NOHANG) returns {}, status {}",
            self.tid,
            ret,
            WaitStatus::new(raw_status)
        );
        if ret == self.tid {
            self.did_waitpid(WaitStatus::new(raw_status));
            return true;
        }
        false
    }

    /// Report an unexpected (SIGKILL) exit detected at resume time, once.
    pub(crate) fn wait_unexpected_exit(&mut self) -> bool {
        if self.detected_unexpected_exit {
            log!(
                crate::log::LogDebug,
                "Unexpected (SIGKILL) exit was detected; reporting it now"
            );
            self.detected_unexpected_exit = false;
            self.did_waitpid(WaitStatus::for_ptrace_event(PTRACE_EVENT_EXIT));
            return true;
        }
        false
    }

    /// Commit `status` as if wait()/try_wait() had returned it. This is
    /// the only place task state is refreshed from a kernel stop.
    pub fn did_waitpid(&mut self, mut status: WaitStatus) {
        // After PTRACE_INTERRUPT, any of the next two stops may be the
        // group-stop it induced: the interrupt usually lets an
        // already-queued stop win, so we can see that stop first and the
        // interrupt group-stop right after it. While the counter is
        // positive, a group-stop is assumed to be interrupt-induced and
        // re-classified as the timeslice signal.
        let mut siginfo_overridden = false;
        if self.expecting_ptrace_interrupt_stop > 0 {
            self.expecting_ptrace_interrupt_stop -= 1;
            if is_signal_triggered_by_ptrace_interrupt(status.group_stop_sig()) {
                if self.session().is_recording() {
                    // Force this timeslice to end.
                    self.session().expire_timeslice();
                }
                status = WaitStatus::for_stop_sig(unsafe {
                    Sig::from_raw_unchecked(TIME_SLICE_SIGNAL)
                });
                self.pending_siginfo = siginfo_t::default();
                self.pending_siginfo.si_signo = TIME_SLICE_SIGNAL;
                self.pending_siginfo.si_code = POLL_IN;
                unsafe {
                    self.pending_siginfo._sifields.sigpoll.si_fd = self.hpc.ticks_interrupt_fd();
                }
                siginfo_overridden = true;
                self.expecting_ptrace_interrupt_stop = 0;
            }
        }

        if !siginfo_overridden && status.stop_sig().is_some() {
            let mut local_pending_siginfo = siginfo_t::default();
            if !self.ptrace_if_alive(
                PTRACE_GETSIGINFO,
                RemotePtr::null(),
                &mut PtraceData::WriteInto(u8_slice_mut(&mut local_pending_siginfo)),
            ) {
                log!(
                    crate::log::LogDebug,
                    "Unexpected process death for {}",
                    self.tid
                );
                status = WaitStatus::for_ptrace_event(PTRACE_EVENT_EXIT);
            }
            self.pending_siginfo = local_pending_siginfo;
        }

        let original_syscallno = self.registers.original_syscallno();
        log!(crate::log::LogDebug, "  (refreshing register cache)");
        // An unstable exit can mean the task exited without being run, in
        // which case pending register changes are now irrelevant and are
        // simply discarded in favor of whatever the kernel has.
        if status.ptrace_event() != Some(PTRACE_EVENT_EXIT) {
            ed_assert!(
                self,
                !self.registers_dirty,
                "Registers shouldn't already be dirty"
            );
        }
        // If we never resumed the task we don't need to read the
        // registers. At an exec stop the arch may be changing, so the
        // register read is left to the post-exec flow.
        if !self.is_stopped && status.ptrace_event() != Some(PTRACE_EVENT_EXEC) {
            let mut ptrace_regs: libc::user_regs_struct = unsafe { std::mem::zeroed() };
            if self.ptrace_if_alive(
                PTRACE_GETREGS,
                RemotePtr::null(),
                &mut PtraceData::WriteInto(u8_slice_mut(&mut ptrace_regs)),
            ) {
                self.registers.set_from_ptrace(&ptrace_regs);
                // The tracee's arch is whatever its code segment says it
                // is: Linux always uses the same GDT selectors for long
                // mode and compat mode.
                let a = arch_from_cs(self.registers.cs());
                if a != self.registers.arch() {
                    self.registers = Registers::new(a);
                    self.registers.set_from_ptrace(&ptrace_regs);
                }
            } else {
                log!(
                    crate::log::LogDebug,
                    "Unexpected process death for {}",
                    self.tid
                );
                status = WaitStatus::for_ptrace_event(PTRACE_EVENT_EXIT);
            }
        }

        self.is_stopped = true;
        self.wait_status = status;
        let more_ticks: Ticks = self.hpc.read_ticks(self);
        // Stop counting here, because things we do to the tracee from now
        // on would otherwise generate ticks.
        self.hpc.stop_counting();
        self.session().accumulate_ticks_processed(more_ticks);
        self.ticks += more_ticks;

        if status.ptrace_event() == Some(PTRACE_EVENT_EXIT) {
            self.seen_ptrace_exit_event = true;
            return;
        }

        if self.registers.singlestep_flag() {
            self.registers.clear_singlestep_flag();
            self.registers_dirty = true;
        }

        // Resuming at a breakpoint and hitting it immediately resets the
        // original syscall number to -1. Undo that, so resume-at-a-
        // breakpoint is a no-op for register state.
        if let Some(vm) = self.as_.clone() {
            if vm.get_breakpoint_type_at_addr(self.address_of_last_execution_resume)
                != BreakpointType::BkptNone
                && self.stop_sig().map(|s| s.as_raw()) == Some(SIGTRAP)
                && self.ptrace_event().is_none()
                && self.ip()
                    == self
                        .address_of_last_execution_resume
                        .increment_by_bkpt_insn_length(self.arch())
            {
                ed_assert_eq!(self, more_ticks, 0);
                self.registers.set_original_syscallno(original_syscallno);
                self.registers_dirty = true;
            }
        }
    }
}

/// Linux compat tasks run with the 32-bit GDT code selector loaded; long
/// mode tasks with the 64-bit one.
fn arch_from_cs(cs: usize) -> SupportedArch {
    const USER_CS_64: usize = 0x33;
    if cs == USER_CS_64 {
        SupportedArch::X64
    } else {
        SupportedArch::X86
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interrupt_group_stop_signals() {
        assert!(is_signal_triggered_by_ptrace_interrupt(Some(
            crate::sig::SIGTRAP
        )));
        assert!(is_signal_triggered_by_ptrace_interrupt(Some(
            crate::sig::SIGSTOP
        )));
        assert!(!is_signal_triggered_by_ptrace_interrupt(Some(
            crate::sig::SIGCHLD
        )));
        assert!(!is_signal_triggered_by_ptrace_interrupt(None));
    }

    #[test]
    fn singlestep_resume_requests() {
        assert!(is_singlestep_resume(ResumeRequest::ResumeSinglestep));
        assert!(is_singlestep_resume(ResumeRequest::ResumeSysemuSinglestep));
        assert!(!is_singlestep_resume(ResumeRequest::ResumeSyscall));
        assert!(!is_singlestep_resume(ResumeRequest::ResumeCont));
    }

    #[test]
    fn cs_selector_identifies_arch() {
        assert_eq!(SupportedArch::X64, arch_from_cs(0x33));
        assert_eq!(SupportedArch::X86, arch_from_cs(0x23));
    }
}
