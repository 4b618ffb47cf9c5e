//! A single tracee thread and every ptrace interaction with it.
//!
//! The submodules split the control plane along its seams: `wait` drives
//! resume/wait and the post-wait commit point, `events` interprets stops
//! and updates the shared tables, `memory` reads and writes tracee memory
//! through the tiered fallbacks, `lifecycle` spawns, clones, captures and
//! destroys tasks.

pub mod events;
pub mod lifecycle;
pub mod memory;
pub mod wait;

use crate::{
    address_space::{AddressSpaceSharedPtr, DebugRegs, WatchType},
    bindings::{
        kernel::user_desc,
        ptrace::*,
        signal::siginfo_t,
    },
    extra_registers::{ExtraRegisters, Format},
    fd_table::FdTableSharedPtr,
    kernel_abi::SupportedArch,
    kernel_metadata::{errno_name, ptrace_req_name, syscall_name},
    perf_counters::PerfCounters,
    preload_interface::{syscallbuf_hdr, SyscallbufLockedWhy, PRELOAD_THREAD_LOCALS_SIZE},
    registers::Registers,
    remote_code_ptr::RemoteCodePtr,
    remote_ptr::{RemotePtr, Void},
    scoped_fd::ScopedFd,
    session::{SessionSharedPtr, SessionSharedWeakPtr},
    taskish_uid::TaskUid,
    thread_group::ThreadGroupSharedPtr,
    ticks::Ticks,
    util::{u8_slice, u8_slice_mut, xsave_area_size},
    wait_status::WaitStatus,
};
use libc::{iovec, pid_t, EAGAIN, ENOMEM, ENOSYS};
use nix::{
    errno::{errno, Errno},
    fcntl::{readlink, OFlag},
    sys::stat::{lstat, stat, FileStat},
};
use std::{
    cell::{Cell, RefCell},
    ffi::{c_void, OsStr, OsString},
    mem::size_of,
    ptr,
    rc::{Rc, Weak},
};

pub type TaskSharedPtr = Rc<RefCell<Task>>;
pub type TaskSharedWeakPtr = Weak<RefCell<Task>>;

const NUM_X86_DEBUG_REGS: usize = 8;
const NUM_X86_WATCHPOINTS: usize = 4;

/// Ways to resume execution; the values are the matching ptrace requests.
/// The PTRACE_SYSEMU* requests aren't part of the portable ptrace API, so
/// a strong type keeps callers from confusing their arguments.
#[repr(u32)]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ResumeRequest {
    ResumeCont = PTRACE_CONT,
    ResumeSinglestep = PTRACE_SINGLESTEP,
    ResumeSyscall = PTRACE_SYSCALL,
    ResumeSysemu = PTRACE_SYSEMU,
    ResumeSysemuSinglestep = PTRACE_SYSEMU_SINGLESTEP,
}

#[derive(Copy, Clone, Eq, PartialEq)]
pub enum WaitRequest {
    /// After resuming, blocking-wait until the tracee status changes.
    ResumeWait,
    /// Don't wait after resuming.
    ResumeNonblocking,
}

/// Don't request more than this many ticks.
pub const MAX_TICKS_REQUEST: u64 = 2_000_000_000;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TicksRequest {
    /// No ticks are expected; the counters aren't touched. Cheaper, and
    /// avoids kernels that report counter advances made in kernel mode.
    ResumeNoTicks,
    ResumeUnlimitedTicks,
    /// Interrupt after this many ticks. Clamped to 1..=MAX_TICKS_REQUEST.
    ResumeWithTicksRequest(u64),
}

bitflags! {
    /// How a clone/fork shares resources between parent and child.
    pub struct CloneFlags: u32 {
        /// Child will share the table of signal dispositions.
        const CLONE_SHARE_SIGHANDLERS = 1 << 0;
        /// Child will join its parent's thread group.
        const CLONE_SHARE_THREAD_GROUP = 1 << 1;
        /// Child will share its parent's address space.
        const CLONE_SHARE_VM = 1 << 2;
        /// Child will share its parent's file descriptor table.
        const CLONE_SHARE_FILES = 1 << 3;
        /// Kernel will clear and notify the tid futex on task exit.
        const CLONE_CLEARTID = 1 << 4;
        /// Set the thread area from the tls clone argument.
        const CLONE_SET_TLS = 1 << 5;
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum CloneReason {
    /// Cloning a task in the same session due to tracee fork()/clone().
    TraceeClone,
    /// Cloning a task into a new session as a checkpoint leader.
    SessionCloneLeader,
    /// Cloning a task into the same session to recreate threads while
    /// restoring a checkpoint.
    SessionCloneNonleader,
}

bitflags! {
    pub struct WriteFlags: u32 {
        const IS_BREAKPOINT_RELATED = 0x1;
    }
}

/// Why a SIGTRAP stop happened. All three can be true at once.
#[derive(Copy, Clone, Debug, Default)]
pub struct TrapReasons {
    pub singlestep: bool,
    pub watchpoint: bool,
    pub breakpoint: bool,
}

/// Everything needed to reconstruct a task in a forked session:
/// registers, names, thread areas, buffer handles and the cloned-file-data
/// fd's kernel offset. Produced by capture_state, consumed by copy_state.
#[derive(Clone)]
pub struct CapturedState {
    pub ticks: Ticks,
    pub regs: Registers,
    pub extra_regs: ExtraRegisters,
    pub prname: OsString,
    pub thread_areas: Vec<user_desc>,
    pub syscallbuf_child: RemotePtr<syscallbuf_hdr>,
    pub syscallbuf_size: usize,
    pub preload_globals: Option<RemotePtr<Void>>,
    pub scratch_ptr: RemotePtr<Void>,
    pub scratch_size: usize,
    pub top_of_stack: RemotePtr<Void>,
    pub cloned_file_data_offset: i64,
    pub thread_locals: ThreadLocals,
    pub rec_tid: pid_t,
    pub serial: u32,
    pub desched_fd_child: i32,
    pub cloned_file_data_fd_child: i32,
    pub wait_status: WaitStatus,
}

/// The out-of-band data argument of a ptrace call.
pub enum PtraceData<'a> {
    WriteInto(&'a mut [u8]),
    ReadFrom(&'a [u8]),
    ReadWord(usize),
    None,
}

impl PtraceData<'_> {
    fn get_addr(&mut self) -> *mut u8 {
        match self {
            PtraceData::WriteInto(s) => s.as_mut_ptr(),
            PtraceData::ReadFrom(s) => s.as_ptr() as *mut u8,
            PtraceData::ReadWord(w) => *w as *mut u8,
            PtraceData::None => ptr::null_mut(),
        }
    }

    fn describe(&self) -> String {
        match self {
            PtraceData::WriteInto(s) => format!("<out {} bytes>", s.len()),
            PtraceData::ReadFrom(s) => format!("{:02x?}", &s[..std::cmp::min(s.len(), 16)]),
            PtraceData::ReadWord(w) => format!("{:#x}", w),
            PtraceData::None => "<none>".into(),
        }
    }
}

pub type ThreadLocals = [u8; PRELOAD_THREAD_LOCALS_SIZE];

/// Everything the tracer knows about one tracee thread.
pub struct Task {
    /// True when assumptions about the status of this task have been
    /// invalidated and can only be re-established by a waitpid() that may
    /// never come. Only set for dying tasks, usually when the whole thread
    /// group is being killed.
    pub unstable: Cell<bool>,
    /// exit() or exit_group() with one task was called, so the exit can be
    /// treated as stable.
    pub stable_exit: bool,

    /// May-block syscalls get their outparams redirected to this scratch
    /// mapping so the kernel's writes land at a deterministic point in the
    /// recording. Mapped in the child; the last page doubles as an
    /// alternate stack for buffered-syscall code.
    pub scratch_ptr: RemotePtr<Void>,
    pub scratch_size: usize,

    /// The child's desched counter event fd, or -1.
    pub desched_fd_child: i32,
    /// The child's cloned-file-data fd, or -1.
    pub cloned_file_data_fd_child: i32,

    pub hpc: PerfCounters,

    /// The real OS tid of the tracee.
    pub tid: pid_t,
    /// The recorded tid: same as `tid` during recording, the tid from the
    /// recording during replay. Constant for the task's life.
    pub rec_tid: pid_t,

    pub syscallbuf_size: usize,
    /// The tracee's mapping of its syscall buffer, null until initialized.
    pub syscallbuf_child: RemotePtr<syscallbuf_hdr>,
    /// The tracee's preload-globals block, if the preload library reported
    /// one.
    pub preload_globals: Option<RemotePtr<Void>>,
    /// Mirror of the tracee's preload thread-locals block.
    pub thread_locals: ThreadLocals,

    serial: u32,
    pub(crate) as_: Option<AddressSpaceSharedPtr>,
    pub(crate) fds: Option<FdTableSharedPtr>,
    pub(crate) prname: OsString,
    /// All ticks seen by this task since it was created.
    pub(crate) ticks: Ticks,
    /// When `is_stopped`, the tracee's registers.
    pub(crate) registers: Registers,
    /// Where we last resumed execution, and how.
    pub(crate) address_of_last_execution_resume: RemoteCodePtr,
    pub(crate) how_last_execution_resumed: ResumeRequest,
    /// True when we know via waitpid() that the task is stopped and we
    /// haven't resumed it.
    pub(crate) is_stopped: bool,
    /// True once the tracee enabled its seccomp filter via prctl().
    pub(crate) seccomp_bpf_enabled: bool,
    /// True when we consumed a PTRACE_EVENT_EXIT that was about to race
    /// with a resume (SIGKILL arrived while stopped).
    pub(crate) detected_unexpected_exit: bool,
    /// True when `registers` has changes not yet flushed to the kernel.
    pub(crate) registers_dirty: bool,
    pub(crate) extra_registers: ExtraRegisters,
    pub(crate) extra_registers_known: bool,
    session_: SessionSharedWeakPtr,
    pub(crate) tg: Option<ThreadGroupSharedPtr>,
    /// Entries set by set_thread_area() or the tls clone argument; one per
    /// entry_number.
    pub(crate) thread_areas_: Vec<user_desc>,
    /// The stack argument passed to clone(); for threads, the top of the
    /// user-allocated stack.
    pub(crate) top_of_stack: RemotePtr<Void>,
    /// The most recent status as returned by waitpid().
    pub wait_status: WaitStatus,
    /// The most recent siginfo, captured when wait_status has a pending
    /// signal.
    pub(crate) pending_siginfo: siginfo_t,
    /// A PTRACE_EVENT_EXIT has been observed for this task.
    pub(crate) seen_ptrace_exit_event: bool,
    /// After PTRACE_INTERRUPT, either of the next two stops may be the
    /// interrupt-induced group-stop; see did_waitpid.
    pub(crate) expecting_ptrace_interrupt_stop: u32,
    /// Signals observed at awkward points during recording, to be
    /// delivered once the current dispatch completes.
    pub(crate) stashed_signals: Vec<siginfo_t>,
    pub(crate) stashed_group_stops: Vec<WaitStatus>,

    pub(crate) weak_self: TaskSharedWeakPtr,
}

impl Task {
    pub(crate) fn new(
        session: &SessionSharedPtr,
        tid: pid_t,
        rec_tid: pid_t,
        serial: u32,
        a: SupportedArch,
    ) -> Task {
        let adjusted_rec_tid = if rec_tid > 0 { rec_tid } else { tid };
        Task {
            unstable: Cell::new(false),
            stable_exit: false,
            scratch_ptr: Default::default(),
            scratch_size: 0,
            // Initialized along with the syscall buffer.
            desched_fd_child: -1,
            cloned_file_data_fd_child: -1,
            hpc: PerfCounters::new(tid),
            tid,
            rec_tid: adjusted_rec_tid,
            syscallbuf_size: 0,
            syscallbuf_child: Default::default(),
            preload_globals: None,
            thread_locals: [0u8; PRELOAD_THREAD_LOCALS_SIZE],
            serial,
            as_: None,
            fds: None,
            prname: "???".into(),
            ticks: 0,
            registers: Registers::new(a),
            address_of_last_execution_resume: Default::default(),
            how_last_execution_resumed: ResumeRequest::ResumeCont,
            is_stopped: false,
            seccomp_bpf_enabled: false,
            detected_unexpected_exit: false,
            registers_dirty: false,
            extra_registers: ExtraRegisters::new(a),
            extra_registers_known: false,
            session_: Rc::downgrade(session),
            tg: None,
            thread_areas_: vec![],
            top_of_stack: Default::default(),
            wait_status: Default::default(),
            pending_siginfo: Default::default(),
            seen_ptrace_exit_event: false,
            expecting_ptrace_interrupt_stop: 0,
            stashed_signals: vec![],
            stashed_group_stops: vec![],
            weak_self: Weak::new(),
        }
    }

    pub fn weak_self_ptr(&self) -> TaskSharedWeakPtr {
        self.weak_self.clone()
    }

    pub fn serial(&self) -> u32 {
        self.serial
    }

    pub fn tuid(&self) -> TaskUid {
        TaskUid::new_with(self.rec_tid, self.serial)
    }

    pub fn session(&self) -> SessionSharedPtr {
        self.session_.upgrade().unwrap()
    }

    /// Return total number of ticks ever executed by this task.
    pub fn tick_count(&self) -> Ticks {
        self.ticks
    }

    /// Called after the first exec, when the session first enters a
    /// consistent state. Ticks accumulated while setting the child up are
    /// flushed.
    pub fn flush_inconsistent_state(&mut self) {
        self.ticks = 0;
    }

    pub fn vm(&self) -> AddressSpaceSharedPtr {
        self.as_.as_ref().unwrap().clone()
    }

    pub fn fd_table(&self) -> FdTableSharedPtr {
        self.fds.as_ref().unwrap().clone()
    }

    pub fn thread_group(&self) -> ThreadGroupSharedPtr {
        self.tg.as_ref().unwrap().clone()
    }

    /// The id of this task's recorded thread group.
    pub fn tgid(&self) -> pid_t {
        self.thread_group().borrow().tgid
    }

    /// The id of the real OS thread group.
    pub fn real_tgid(&self) -> pid_t {
        self.thread_group().borrow().real_tgid
    }

    /// The "task name": what prctl(PR_GET_NAME) would say.
    pub fn name(&self) -> &OsStr {
        &self.prname
    }

    pub fn arch(&self) -> SupportedArch {
        self.registers.arch()
    }

    pub fn ip(&self) -> RemoteCodePtr {
        self.registers.ip()
    }

    pub fn is_running(&self) -> bool {
        !self.is_stopped
    }

    pub fn is_stopped(&self) -> bool {
        self.is_stopped
    }

    pub fn status(&self) -> WaitStatus {
        self.wait_status
    }

    pub fn set_status(&mut self, status: WaitStatus) {
        self.wait_status = status;
    }

    pub fn clear_wait_status(&mut self) {
        self.wait_status = WaitStatus::default();
    }

    pub fn ptrace_event(&self) -> Option<u32> {
        self.wait_status.ptrace_event()
    }

    pub fn stop_sig(&self) -> Option<crate::sig::Sig> {
        self.wait_status.stop_sig()
    }

    pub fn group_stop_sig(&self) -> Option<crate::sig::Sig> {
        self.wait_status.group_stop_sig()
    }

    /// The siginfo at the current signal-stop. Not meaningful otherwise.
    pub fn get_siginfo(&self) -> &siginfo_t {
        &self.pending_siginfo
    }

    pub fn is_dying(&self) -> bool {
        self.seen_ptrace_exit_event || self.detected_unexpected_exit
    }

    /// True if the current stop is the seccomp event generated when a
    /// traced syscall is entered.
    pub fn is_ptrace_seccomp_event(&self) -> bool {
        matches!(
            self.ptrace_event(),
            Some(PTRACE_EVENT_SECCOMP) | Some(PTRACE_EVENT_SECCOMP_OBSOLETE)
        )
    }

    /// Return the current registers. Asserts the cache is valid.
    pub fn regs_ref(&self) -> &Registers {
        ed_assert!(self, self.is_stopped);
        &self.registers
    }

    /// Assuming ip() is just past a breakpoint instruction, adjust it
    /// backwards to point at that breakpoint instruction.
    pub fn move_ip_before_breakpoint(&mut self) {
        let mut r = *self.regs_ref();
        r.set_ip(r.ip().decrement_by_bkpt_insn_length(self.arch()));
        self.set_regs(&r);
    }

    /// Set the tracee's registers to `regs`. Lazy: the write-through to
    /// the kernel happens on the next flush.
    pub fn set_regs(&mut self, regs: &Registers) {
        ed_assert!(self, self.is_stopped);
        self.registers = *regs;
        self.registers_dirty = true;
    }

    /// Ensure registers are flushed back to the underlying task.
    pub fn flush_regs(&mut self) {
        if self.registers_dirty {
            ed_assert!(self, self.is_stopped);
            let ptrace_regs = self.registers.get_ptrace();
            self.ptrace_if_alive(
                PTRACE_SETREGS,
                RemotePtr::null(),
                &mut PtraceData::ReadFrom(u8_slice(&ptrace_regs)),
            );
            self.registers_dirty = false;
        }
    }

    /// The extended registers, read lazily. The transport is whatever the
    /// CPU supports: XSAVE via NT_X86_XSTATE, else FPXREGS on x86 /
    /// FPREGS on x86-64. Sizes are fixed at first use.
    pub fn extra_regs(&mut self) -> &ExtraRegisters {
        if !self.extra_registers_known {
            let arch = self.arch();
            let xsave_size = xsave_area_size();
            if xsave_size > 0 {
                log!(
                    crate::log::LogDebug,
                    "  (refreshing extra-register cache using XSAVE)"
                );
                let mut data = vec![0u8; xsave_size];
                let mut vec = iovec {
                    iov_base: data.as_mut_ptr() as *mut c_void,
                    iov_len: data.len(),
                };
                self.xptrace(
                    PTRACE_GETREGSET,
                    RemotePtr::new(NT_X86_XSTATE as usize),
                    &mut PtraceData::WriteInto(u8_slice_mut(&mut vec)),
                );
                // The kernel may return less than the full XSTATE.
                data.truncate(vec.iov_len);
                self.extra_registers.set_to_raw_data(arch, Format::XSave, &data);
            } else {
                match arch {
                    SupportedArch::X86 => {
                        log!(
                            crate::log::LogDebug,
                            "  (refreshing extra-register cache using FPXREGS)"
                        );
                        let mut data = [0u8; crate::extra_registers::FXSAVE_SIZE];
                        self.xptrace(
                            PTRACE_GETFPXREGS,
                            RemotePtr::null(),
                            &mut PtraceData::WriteInto(&mut data),
                        );
                        self.extra_registers
                            .set_to_raw_data(arch, Format::XSave, &data);
                    }
                    SupportedArch::X64 => {
                        // x86-64 without XSAVE; Xeon E5620 is in this class.
                        log!(
                            crate::log::LogDebug,
                            "  (refreshing extra-register cache using FPREGS)"
                        );
                        let mut data = [0u8; crate::extra_registers::FXSAVE_SIZE];
                        self.xptrace(
                            PTRACE_GETFPREGS,
                            RemotePtr::null(),
                            &mut PtraceData::WriteInto(&mut data),
                        );
                        self.extra_registers
                            .set_to_raw_data(arch, Format::XSave, &data);
                    }
                }
            }
            self.extra_registers_known = true;
        }
        &self.extra_registers
    }

    /// Set the tracee's extra registers, writing through to the kernel via
    /// the same transport extra_regs() used.
    pub fn set_extra_regs(&mut self, regs: &ExtraRegisters) {
        ed_assert!(self, !regs.empty(), "Trying to set empty ExtraRegisters");
        ed_assert_eq!(
            self,
            regs.arch(),
            self.arch(),
            "Trying to set wrong arch ExtraRegisters"
        );
        self.extra_registers = regs.clone();
        self.extra_registers_known = true;

        if xsave_area_size() > 0 {
            let mut vec = iovec {
                iov_base: self.extra_registers.data_mut().as_mut_ptr() as *mut c_void,
                iov_len: self.extra_registers.data_size(),
            };
            self.ptrace_if_alive(
                PTRACE_SETREGSET,
                RemotePtr::new(NT_X86_XSTATE as usize),
                &mut PtraceData::ReadFrom(u8_slice(&vec)),
            );
        } else {
            let data = self.extra_registers.data();
            match self.arch() {
                SupportedArch::X86 => {
                    self.ptrace_if_alive(
                        PTRACE_SETFPXREGS,
                        RemotePtr::null(),
                        &mut PtraceData::ReadFrom(&data),
                    );
                }
                SupportedArch::X64 => {
                    self.ptrace_if_alive(
                        PTRACE_SETFPREGS,
                        RemotePtr::null(),
                        &mut PtraceData::ReadFrom(&data),
                    );
                }
            }
        }
    }

    /// Make the ptrace request and return its raw result, leaving errno
    /// for the caller to interpret.
    pub(crate) fn fallible_ptrace(
        &self,
        request: u32,
        addr: RemotePtr<Void>,
        data: &mut PtraceData,
    ) -> isize {
        unsafe { ptrace(request, self.tid, addr.as_usize(), data.get_addr()) as isize }
    }

    /// Like fallible_ptrace() but completely infallible: any error is a
    /// bug.
    pub(crate) fn xptrace(&self, request: u32, addr: RemotePtr<Void>, data: &mut PtraceData) {
        Errno::clear();
        self.fallible_ptrace(request, addr, data);
        let err = errno();
        ed_assert!(
            self,
            err == 0,
            "ptrace({}, {}, addr={}, data={}) failed with errno {}",
            ptrace_req_name(request),
            self.tid,
            addr,
            data.describe(),
            errno_name(err)
        );
    }

    /// Like xptrace() except ESRCH is tolerated and reported by returning
    /// false: the task can die of SIGKILL at any time during recording.
    pub(crate) fn ptrace_if_alive(
        &self,
        request: u32,
        addr: RemotePtr<Void>,
        data: &mut PtraceData,
    ) -> bool {
        Errno::clear();
        self.fallible_ptrace(request, addr, data);
        if errno() == libc::ESRCH {
            log!(
                crate::log::LogDebug,
                "ptrace_if_alive tid {} was not alive",
                self.tid
            );
            return false;
        }
        let err = errno();
        ed_assert!(
            self,
            err == 0,
            "ptrace({}, {}, addr={}, data={}) failed with errno {}",
            ptrace_req_name(request),
            self.tid,
            addr,
            data.describe(),
            errno_name(err)
        );
        true
    }

    /// The ptrace message associated with the current ptrace event, e.g.
    /// the new child's tid at PTRACE_EVENT_CLONE.
    pub fn get_ptrace_eventmsg_pid(&self) -> pid_t {
        let mut msg: usize = 0;
        self.xptrace(
            PTRACE_GETEVENTMSG,
            RemotePtr::null(),
            &mut PtraceData::WriteInto(u8_slice_mut(&mut msg)),
        );
        msg as pid_t
    }

    /// Stat `fd` in the context of this task's fd table.
    pub fn stat_fd(&self, fd: i32) -> FileStat {
        let path = format!("/proc/{}/fd/{}", self.tid, fd);
        let res = stat(path.as_str());
        ed_assert!(self, res.is_ok());
        res.unwrap()
    }

    /// Lstat `fd` in the context of this task's fd table.
    pub fn lstat_fd(&self, fd: i32) -> FileStat {
        let path = format!("/proc/{}/fd/{}", self.tid, fd);
        let res = lstat(path.as_str());
        ed_assert!(self, res.is_ok());
        res.unwrap()
    }

    /// Open `fd` in the context of this task's fd table.
    pub fn open_fd(&self, fd: i32, flags: OFlag) -> ScopedFd {
        let path = format!("/proc/{}/fd/{}", self.tid, fd);
        ScopedFd::open_path(path.as_str(), flags)
    }

    /// The name of the file referenced by `fd` in this task's fd table.
    pub fn file_name_of_fd(&self, fd: i32) -> OsString {
        let path = format!("/proc/{}/fd/{}", self.tid, fd);
        readlink(path.as_str()).unwrap_or_default()
    }

    /// Syscalls have side effects on registers (e.g. setting the flags
    /// register). Perform those side effects on `registers` so it looks
    /// like a syscall happened.
    pub fn canonicalize_regs(&mut self, syscall_arch: SupportedArch) {
        ed_assert!(self, self.is_stopped);

        match self.registers.arch() {
            SupportedArch::X64 => {
                match syscall_arch {
                    SupportedArch::X86 => {
                        // The int $0x80 compatibility handling clears
                        // r8-r11 on entry.
                        self.registers.set_r8(0x0);
                        self.registers.set_r9(0x0);
                        self.registers.set_r10(0x0);
                        self.registers.set_r11(0x0);
                    }
                    SupportedArch::X64 => {
                        // The 'syscall' instruction copies RFLAGS into R11
                        // on entry; if we single-stepped in, TF would be
                        // set there and differ between record and replay.
                        // 0x246 matches the flags value below, which makes
                        // this idempotent.
                        self.registers.set_r11(0x246);
                        // 'syscall' copies the return address into RCX;
                        // the kernel normally leaves -1 there by the time
                        // we see a trap, but not in every situation.
                        self.registers.set_cx(-1isize as usize);
                    }
                };
                // A failed execve has been observed clearing all flags.
                // 0x246 is ZF+PF+IF+reserved, the result of clearing a
                // register with xor.
                self.registers.set_flags(0x246);
            }
            SupportedArch::X86 => {
                // SYSENTER handling modifies EBP and EFLAGS on entry, and
                // in a VMWare guest the EFLAGS changes are
                // nondeterministic. Cover that up.
                self.registers.set_flags(0x246);
            }
        }

        self.registers_dirty = true;
    }

    /// Call this when performing a clone syscall in this task. Returns
    /// true if the call completed and we're at a PTRACE_EVENT_CLONE/FORK/
    /// VFORK stop, false if the syscall needs to be retried or resumed.
    pub fn clone_syscall_is_complete(
        &self,
        pid: &mut Option<pid_t>,
        syscall_arch: SupportedArch,
    ) -> bool {
        if let Some(event) = self.ptrace_event() {
            if event == PTRACE_EVENT_CLONE
                || event == PTRACE_EVENT_FORK
                || event == PTRACE_EVENT_VFORK
            {
                *pid = Some(self.get_ptrace_eventmsg_pid());
                return true;
            }
            ed_assert!(self, false, "Unexpected ptrace event: {}", event);
        }

        // EAGAIN can happen here due to fork failing under load. The
        // caller must handle this. ENOSYS means the arch check rejected
        // the syscall number.
        let result = self.registers.syscall_result_signed();
        ed_assert!(
            self,
            self.registers.syscall_may_restart()
                || -ENOSYS as isize == result
                || -EAGAIN as isize == result
                || -ENOMEM as isize == result,
            "Unexpected task status {} ({} syscall errno: {})",
            self.status(),
            syscall_name(self.registers.original_syscallno() as i32, syscall_arch),
            errno_name(-result as i32)
        );
        false
    }

    /// Merge a thread-area descriptor into our list by entry_number.
    pub fn set_thread_area(&mut self, tls: RemotePtr<user_desc>) {
        // user_desc is word-size independent, so one read covers both
        // arches.
        let desc: user_desc = memory::read_val_mem(self, tls, None);
        set_thread_area_core(&mut self.thread_areas_, desc);
    }

    pub fn thread_areas(&self) -> &[user_desc] {
        &self.thread_areas_
    }

    /// Re-read the 16-byte name after a successful prctl(PR_SET_NAME).
    pub fn update_prname(&mut self, child_addr: RemotePtr<Void>) {
        let mut buf = vec![0u8; 16];
        let res = self.read_bytes_fallible(child_addr, &mut buf);
        ed_assert!(self, res.is_ok());
        let bytes_read = res.unwrap();
        ed_assert!(self, bytes_read > 0);
        buf.truncate(buf.iter().position(|&b| b == 0).unwrap_or(bytes_read));
        use std::os::unix::ffi::OsStringExt;
        self.prname = OsString::from_vec(buf);
    }

    /// Stash a signal observed at an awkward point, for the recording
    /// path to deliver later.
    pub fn stash_sig(&mut self) {
        let si = self.pending_siginfo;
        log!(
            crate::log::LogDebug,
            "stashing signal {:?} for task {}",
            si,
            self.tid
        );
        self.stashed_signals.push(si);
    }

    pub fn stash_group_stop(&mut self) {
        let status = self.wait_status;
        self.stashed_group_stops.push(status);
    }

    pub fn has_stashed_sig(&self) -> bool {
        !self.stashed_signals.is_empty()
    }

    pub fn pop_stashed_sig(&mut self) -> Option<siginfo_t> {
        self.stashed_signals.pop()
    }

    /// The number of bytes currently recorded in the syscall buffer,
    /// including the header.
    pub fn syscallbuf_data_size(&mut self) -> usize {
        let addr = RemotePtr::<u32>::cast(
            RemotePtr::<u8>::cast(self.syscallbuf_child)
                + offset_of!(syscallbuf_hdr, num_rec_bytes),
        );
        memory::read_val_mem::<u32>(self, addr, None) as usize + size_of::<syscallbuf_hdr>()
    }

    /// Zero the syscall buffer's counters and recorded data, so that
    /// checkpoint save/restore only needs to preserve the data area.
    pub fn reset_syscallbuf(&mut self) {
        let hdr_addr = self.syscallbuf_child;
        if hdr_addr.is_null() {
            return;
        }

        let num_rec_bytes_addr = RemotePtr::<u32>::cast(
            RemotePtr::<u8>::cast(hdr_addr) + offset_of!(syscallbuf_hdr, num_rec_bytes),
        );
        let num_rec_bytes: u32 = memory::read_val_mem(self, num_rec_bytes_addr, None);
        if num_rec_bytes > 0 {
            let data_start = RemotePtr::<u8>::cast(hdr_addr + 1usize);
            let zeros = vec![0u8; num_rec_bytes as usize];
            self.write_bytes_helper(
                RemotePtr::cast(data_start),
                &zeros,
                None,
                WriteFlags::empty(),
            );
        }

        let zero = 0u32;
        for field_offset in &[
            offset_of!(syscallbuf_hdr, num_rec_bytes),
            offset_of!(syscallbuf_hdr, mprotect_record_count),
            offset_of!(syscallbuf_hdr, mprotect_record_count_completed),
            offset_of!(syscallbuf_hdr, blocked_sigs_generation),
        ] {
            let addr =
                RemotePtr::<u32>::cast(RemotePtr::<u8>::cast(hdr_addr) + *field_offset);
            memory::write_val_mem(self, addr, &zero, None);
        }
    }

    /// Lock or unlock the syscall buffer on behalf of the tracer. Only has
    /// an effect once the buffer is initialized.
    pub fn set_syscallbuf_locked(&mut self, locked: bool) {
        if self.syscallbuf_child.is_null() {
            return;
        }
        let addr = RemotePtr::<u8>::cast(self.syscallbuf_child)
            + offset_of!(syscallbuf_hdr, locked);
        let locked_before: u8 = memory::read_val_mem(self, addr, None);
        let before = SyscallbufLockedWhy::from_bits_truncate(locked_before);
        let after = if locked {
            before | SyscallbufLockedWhy::TRACER
        } else {
            before & !SyscallbufLockedWhy::TRACER
        };
        if after != before {
            memory::write_val_mem(self, addr, &after.bits(), None);
        }
    }

    /// The debug status register (DR6). Always cleared on resume, so it
    /// only reflects events since the last stop.
    pub fn debug_status(&self) -> usize {
        Errno::clear();
        let status =
            self.fallible_ptrace(PTRACE_PEEKUSER, dr_user_word_offset(6).into(), &mut PtraceData::None);
        if errno() != 0 && errno() != libc::ESRCH {
            ed_assert!(self, false, "PEEKUSER of debug status failed");
        }
        status as usize
    }

    pub fn set_debug_status(&self, status: usize) {
        self.set_debug_reg(6, status);
    }

    pub fn get_debug_reg(&self, regno: usize) -> usize {
        Errno::clear();
        let result = self.fallible_ptrace(
            PTRACE_PEEKUSER,
            dr_user_word_offset(regno).into(),
            &mut PtraceData::None,
        );
        if errno() == libc::ESRCH {
            return 0;
        }
        result as usize
    }

    pub fn set_debug_reg(&self, regno: usize, value: usize) -> bool {
        Errno::clear();
        self.fallible_ptrace(
            PTRACE_POKEUSER,
            dr_user_word_offset(regno).into(),
            &mut PtraceData::ReadWord(value),
        );
        errno() == 0 || errno() == libc::ESRCH
    }

    /// Program the debug registers to the given watchpoint configurations,
    /// updating the control register appropriately. Atomic to the caller:
    /// either all of `regs` is enabled and true returned, or none are and
    /// false is returned.
    pub fn set_debug_regs(&self, regs: &DebugRegs) -> bool {
        // Reset the debug status since the programmed set is changing, and
        // clear DR7 first so a partial failure leaves nothing armed.
        self.ptrace_if_alive(
            PTRACE_POKEUSER,
            dr_user_word_offset(6).into(),
            &mut PtraceData::ReadWord(0),
        );
        self.ptrace_if_alive(
            PTRACE_POKEUSER,
            dr_user_word_offset(7).into(),
            &mut PtraceData::ReadWord(0),
        );
        let dr7 = match compose_dr7(regs) {
            Some(dr7) => dr7,
            None => return false,
        };

        for (i, reg) in regs.iter().enumerate() {
            Errno::clear();
            self.fallible_ptrace(
                PTRACE_POKEUSER,
                dr_user_word_offset(i).into(),
                &mut PtraceData::ReadWord(reg.addr.as_usize()),
            );
            if errno() != 0 {
                return false;
            }
        }

        Errno::clear();
        self.fallible_ptrace(
            PTRACE_POKEUSER,
            dr_user_word_offset(7).into(),
            &mut PtraceData::ReadWord(dr7),
        );
        errno() == 0
    }
}

pub(crate) fn set_thread_area_core(thread_areas: &mut Vec<user_desc>, desc: user_desc) {
    for t in thread_areas.iter_mut() {
        if t.entry_number == desc.entry_number {
            *t = desc;
            return;
        }
    }
    thread_areas.push(desc);
}

fn dr_user_word_offset(i: usize) -> usize {
    debug_assert!(i < NUM_X86_DEBUG_REGS);
    offset_of!(libc::user, u_debugreg) + size_of::<usize>() * i
}

/// The encoding of watched-length values in DR7.
fn num_bytes_to_dr_len(num_bytes: usize) -> Option<usize> {
    match num_bytes {
        1 => Some(0x0),
        2 => Some(0x1),
        8 => Some(0x2),
        4 => Some(0x3),
        _ => None,
    }
}

/// Pack watchpoint configurations into a DR7 value: local-enable bits in
/// the low byte, type and length fields packed from bit 16. None when the
/// configurations can't be expressed.
pub(crate) fn compose_dr7(regs: &DebugRegs) -> Option<usize> {
    if regs.len() > NUM_X86_WATCHPOINTS {
        return None;
    }
    let mut dr7: usize = 0;
    for (i, reg) in regs.iter().enumerate() {
        let len = num_bytes_to_dr_len(reg.num_bytes)?;
        if reg.type_ == WatchType::WatchExec && reg.num_bytes != 1 {
            return None;
        }
        dr7 |= 1 << (2 * i);
        dr7 |= (reg.type_ as usize) << (16 + 4 * i);
        dr7 |= len << (18 + 4 * i);
    }
    Some(dr7)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address_space::WatchConfig;
    use crate::remote_ptr::RemotePtr;

    #[test]
    fn dr7_for_one_write_watchpoint() {
        let regs = vec![WatchConfig::new(
            RemotePtr::new(0x1000),
            4,
            WatchType::WatchWrite,
        )];
        // The canonical value for a 4-byte write watch in DR0.
        assert_eq!(Some(0xd0001), compose_dr7(&regs));
    }

    #[test]
    fn dr7_packs_slots_independently() {
        let regs = vec![
            WatchConfig::new(RemotePtr::new(0x1000), 1, WatchType::WatchExec),
            WatchConfig::new(RemotePtr::new(0x2000), 8, WatchType::WatchReadWrite),
        ];
        let dr7 = compose_dr7(&regs).unwrap();
        // Slot 0: exec len 1 -> type 0 len 0, local enable bit 0.
        assert_eq!(1, dr7 & 0x3);
        assert_eq!(0, (dr7 >> 16) & 0xf);
        // Slot 1: read-write len 8 -> type 3, len 2.
        assert_eq!(0x4, dr7 & 0xc);
        assert_eq!(0x3, (dr7 >> 20) & 0x3);
        assert_eq!(0x2, (dr7 >> 22) & 0x3);
    }

    #[test]
    fn dr7_rejects_overcommit_and_bad_lengths() {
        let mk = |n: usize| {
            (0..n)
                .map(|i| {
                    WatchConfig::new(RemotePtr::new(0x1000 + 8 * i), 4, WatchType::WatchWrite)
                })
                .collect::<Vec<_>>()
        };
        assert!(compose_dr7(&mk(4)).is_some());
        assert!(compose_dr7(&mk(5)).is_none());
        let bad = vec![WatchConfig::new(RemotePtr::new(0x1000), 3, WatchType::WatchWrite)];
        assert!(compose_dr7(&bad).is_none());
        let bad_exec = vec![WatchConfig::new(RemotePtr::new(0x1000), 4, WatchType::WatchExec)];
        assert!(compose_dr7(&bad_exec).is_none());
    }

    #[test]
    fn thread_area_merge_by_entry_number() {
        let mut areas: Vec<user_desc> = vec![];
        let mut d1 = user_desc::default();
        d1.entry_number = 12;
        d1.base_addr = 0x1000;
        set_thread_area_core(&mut areas, d1);
        let mut d2 = user_desc::default();
        d2.entry_number = 13;
        set_thread_area_core(&mut areas, d2);
        assert_eq!(2, areas.len());
        let mut d3 = user_desc::default();
        d3.entry_number = 12;
        d3.base_addr = 0x2000;
        set_thread_area_core(&mut areas, d3);
        assert_eq!(2, areas.len());
        assert_eq!(0x2000, areas[0].base_addr);
    }
}
