//! Task creation and teardown: the initial spawn, attaching tasks for
//! kernel-reported clones/forks, checkpoint capture/restore, buffer
//! teardown and the final detach.

use crate::{
    bindings::ptrace::*,
    fd_table::FdTable,
    file_monitor::{MagicSaveDataMonitor, PreserveFileMonitor, StdioMonitor},
    flags::Flags,
    kernel_abi::{
        clone_parameter_ordering, clone_tls_type, syscalls, CloneParameterOrdering, CloneTLSType,
        REWIND_NATIVE_ARCH,
    },
    kernel_metadata::errno_name,
    remote_ptr::{RemotePtr, Void},
    remote_syscalls::{AutoRestoreMem, RemoteSyscalls},
    scoped_fd::ScopedFd,
    seccomp_bpf::SeccompFilter,
    session::SessionSharedPtr,
    sig,
    task::{CapturedState, CloneFlags, CloneReason, PtraceData, Task, TaskSharedPtr},
    util::{read_fd_offset, set_cpu_affinity, to_cstr_array, to_cstring_array, u8_slice, write_all},
    REWIND_MAGIC_SAVE_DATA_FD, REWIND_RESERVED_ROOT_DIR_FD,
};
use libc::{
    pid_t, prctl, sock_fprog, syscall, SYS_write, CLONE_CHILD_CLEARTID, CLONE_FILES, CLONE_FS,
    CLONE_SETTLS, CLONE_SIGHAND, CLONE_SYSVSEM, CLONE_THREAD, CLONE_VM, EAGAIN, ECHILD, EINVAL,
    EPERM, ESRCH, PR_SET_NO_NEW_PRIVS, PR_SET_PDEATHSIG, PR_SET_SECCOMP, PR_SET_TSC,
    PR_TSC_SIGSEGV, SECCOMP_MODE_FILTER, SIGCHLD, SIGKILL, STDERR_FILENO, STDOUT_FILENO, __WALL,
};
use nix::{
    errno::{errno, Errno},
    sys::{
        signal::{kill, sigaction, signal, SaFlags, SigAction, SigHandler, SigSet, Signal},
        stat::Mode,
    },
    fcntl::{open, OFlag},
    unistd::{dup2, execve, fork, getpid, setsid, ForkResult, Pid},
};
use std::{
    cell::RefCell,
    ffi::{CStr, CString, OsStr, OsString},
    mem::size_of_val,
    os::raw::c_int,
    os::unix::ffi::OsStrExt,
    ptr,
    rc::Rc,
};

// The signal handler needs to do nothing; the signal's only job is to make
// a blocking waitpid return EINTR.
extern "C" fn handle_alarm_signal(_sig: c_int) {}

impl Task {
    /// Fork and exec the initial tracee. If something goes wrong in the
    /// child before the exec, its message is readable through the
    /// session's spawn error channel.
    pub fn spawn(
        session: &SessionSharedPtr,
        exe_path: &OsStr,
        argv: &[OsString],
        envp: &[OsString],
        rec_tid: pid_t,
    ) -> TaskSharedPtr {
        debug_assert!(session.tasks().len() == 0);

        if let Some(cpu) = session.cpu_binding() {
            // Set CPU affinity now, before we create any tracees, so they
            // all inherit it. The tracer is bound to the same CPU as the
            // tracees since counter behavior is only comparable that way.
            if !set_cpu_affinity(cpu) {
                fatal!("Can't bind to requested CPU {}", cpu);
            }
        }

        let error_fd = session.create_spawn_error_pipe();

        // After fork() in a multithreaded process the child may only call
        // async-signal-safe functions, and malloc is not one of them. Do
        // every allocation before forking.
        let exe_path_cstr = CString::new(exe_path.as_bytes()).unwrap();
        let argv_array = to_cstring_array(argv);
        let envp_array = to_cstring_array(envp);
        let mut filter = create_seccomp_filter();
        let prog = sock_fprog {
            len: filter.filters.len() as u16,
            filter: filter.filters.as_mut_ptr(),
        };
        let is_replaying = session.is_replaying();
        let is_recording = session.is_recording();

        let tid: pid_t;
        loop {
            // fork() can fail with EAGAIN due to temporary load problems;
            // retry those.
            match unsafe { fork() } {
                Ok(ForkResult::Child) => {
                    run_initial_child(
                        is_replaying,
                        is_recording,
                        &error_fd,
                        &exe_path_cstr,
                        &to_cstr_array(&argv_array),
                        &to_cstr_array(&envp_array),
                        &prog,
                    );
                    // run_initial_child never returns.
                }
                Ok(ForkResult::Parent { child }) => {
                    tid = child.as_raw();
                    break;
                }
                Err(nix::Error::Sys(Errno::EAGAIN)) => continue,
                Err(_) => fatal!("Failed to fork"),
            }
        }

        // Keep the window between fork() and PTRACE_SEIZE minimal: until
        // EXITKILL is in force, a tracer crash leaks a stopped child.
        let mut options = PTRACE_O_TRACESYSGOOD | PTRACE_O_TRACEFORK | PTRACE_O_TRACECLONE;
        if !Flags::get().disable_ptrace_exit_events {
            options |= PTRACE_O_TRACEEXIT;
        }
        if is_recording {
            options |= PTRACE_O_TRACEVFORK | PTRACE_O_TRACESECCOMP | PTRACE_O_TRACEEXEC;
        }

        Errno::clear();
        let mut res = unsafe {
            ptrace(
                PTRACE_SEIZE,
                tid,
                0,
                (options | PTRACE_O_EXITKILL) as usize as *mut u8,
            )
        };
        if res < 0 && errno() == EINVAL {
            // PTRACE_O_EXITKILL was added in 3.8 and is only needed for
            // more robust cleanup; tolerate its absence.
            res = unsafe { ptrace(PTRACE_SEIZE, tid, 0, options as usize as *mut u8) };
        }
        if res != 0 {
            // The tracee may already be dead, but its exit status hasn't
            // been reaped, so there's no danger of seizing the wrong
            // process.
            let seize_errno = errno();
            kill(Pid::from_raw(tid), Signal::SIGKILL).unwrap_or(());
            let hint = if seize_errno == EPERM {
                format!(
                    "; child probably died before reaching SIGSTOP\nChild's message: {:?}",
                    session.read_spawned_task_error()
                )
            } else {
                String::new()
            };
            fatal!(
                "PTRACE_SEIZE failed for tid {} with {}{}",
                tid,
                errno_name(seize_errno),
                hint
            );
        }

        let serial = session.next_task_serial();
        let t = Task::new(session, tid, rec_tid, serial, REWIND_NATIVE_ARCH);
        let wrapped_t: TaskSharedPtr = Rc::new(RefCell::new(t));
        wrapped_t.borrow_mut().weak_self = Rc::downgrade(&wrapped_t);

        {
            let mut t = wrapped_t.borrow_mut();
            let tg = session.create_tg(t.rec_tid, t.tid);
            tg.borrow_mut().task_set_mut().insert(&t);
            t.tg = Some(tg);

            let vm = session.create_vm(exe_path, t.rec_tid, t.serial(), 0);
            vm.task_set_mut().insert(&t);
            t.as_ = Some(vm);

            let fds = FdTable::create();
            {
                let mut table = fds.borrow_mut();
                table.task_set_mut().insert(&t);
                setup_fd_table(&mut table);
            }
            t.fds = Some(fds);
        }

        // Install the SIGALRM handler now, without SA_RESTART, so blocking
        // waitpid() calls can be interrupted.
        let sa = SigAction::new(
            SigHandler::Handler(handle_alarm_signal),
            SaFlags::empty(),
            SigSet::empty(),
        );
        unsafe { sigaction(Signal::SIGALRM, &sa) }.unwrap();

        session.track_task(rec_tid, wrapped_t.clone());

        {
            let mut t = wrapped_t.borrow_mut();
            t.wait(None);
            if t.ptrace_event() == Some(PTRACE_EVENT_EXIT) {
                fatal!(
                    "Tracee died before reaching SIGSTOP\nChild's message: {:?}",
                    session.read_spawned_task_error()
                );
            }
            // SIGSTOP can be reported as a signal-stop or a group-stop,
            // depending on whether PTRACE_SEIZE raced with its delivery.
            if t.stop_sig() != Some(sig::SIGSTOP) && t.group_stop_sig() != Some(sig::SIGSTOP) {
                fatal!(
                    "Unexpected stop {}\nChild's message: {:?}",
                    t.status(),
                    session.read_spawned_task_error()
                );
            }
            t.clear_wait_status();
            t.open_mem_fd();
        }
        wrapped_t
    }

    /// Attach a new Task for a child the kernel just reported via
    /// PTRACE_EVENT_CLONE/FORK/VFORK. `flags` reflect the clone flags the
    /// tracee used; `new_tid` comes from the event message.
    #[allow(clippy::too_many_arguments)]
    pub fn clone_task(
        &mut self,
        reason: CloneReason,
        flags: CloneFlags,
        stack: RemotePtr<Void>,
        tls: RemotePtr<Void>,
        _cleartid_addr: RemotePtr<i32>,
        new_tid: pid_t,
        new_rec_tid: Option<pid_t>,
        new_serial: u32,
        maybe_other_session: Option<SessionSharedPtr>,
    ) -> TaskSharedPtr {
        let new_task_session = match maybe_other_session {
            Some(other) => {
                ed_assert_ne!(self, reason, CloneReason::TraceeClone);
                other
            }
            None => {
                ed_assert_eq!(self, reason, CloneReason::TraceeClone);
                self.session()
            }
        };

        let mut t = Task::new(
            &new_task_session,
            new_tid,
            new_rec_tid.unwrap_or(0),
            new_serial,
            self.arch(),
        );

        if flags.contains(CloneFlags::CLONE_SHARE_VM) {
            t.as_ = self.as_.clone();
            if !stack.is_null() {
                // Guess that the low page of the stack argument is a
                // stack; name it so it reads like /proc/maps would.
                let last_stack_byte: RemotePtr<Void> = stack - 1usize;
                if let Some(mapping) = self.vm().mapping_of(last_stack_byte) {
                    if !mapping.map.is_heap() {
                        let m = &mapping.map;
                        log!(
                            crate::log::LogDebug,
                            "mapping stack for {} at {}",
                            new_tid,
                            m
                        );
                        self.vm().map(
                            m.start(),
                            m.size(),
                            m.prot(),
                            m.flags(),
                            m.file_offset_bytes(),
                            OsStr::new("[stack]"),
                            m.device(),
                            m.inode(),
                            crate::address_space::MappingFlags::empty(),
                            None,
                        );
                    }
                }
            }
        } else {
            t.as_ = Some(new_task_session.clone_vm(
                &self.vm(),
                t.rec_tid,
                new_serial,
            ));
        }

        t.syscallbuf_size = self.syscallbuf_size;
        t.preload_globals = self.preload_globals;
        t.seccomp_bpf_enabled = self.seccomp_bpf_enabled;

        let rc_t: TaskSharedPtr = Rc::new(RefCell::new(t));
        rc_t.borrow_mut().weak_self = Rc::downgrade(&rc_t);

        {
            let mut ref_t = rc_t.borrow_mut();
            // The fd table is either shared or copied; either way any
            // monitors stay valid.
            if flags.contains(CloneFlags::CLONE_SHARE_FILES) {
                ref_t.fds = self.fds.clone();
                ref_t.fd_table().borrow_mut().task_set_mut().insert(&ref_t);
            } else {
                let new_fds = self.fd_table().borrow().clone_into_task(&ref_t);
                ref_t.fds = Some(new_fds);
            }

            ref_t.top_of_stack = stack;
            // Clone children, both thread and fork, inherit the parent's
            // prname.
            ref_t.prname = self.prname.clone();

            // wait() before anything that may use ptrace on the child's
            // memory.
            ref_t.wait(None);

            if flags.contains(CloneFlags::CLONE_SHARE_THREAD_GROUP) {
                ref_t.tg = self.tg.clone();
            } else {
                let tg = new_task_session.create_tg(ref_t.rec_tid, ref_t.tid);
                ref_t.tg = Some(tg);
            }
            ref_t
                .thread_group()
                .borrow_mut()
                .task_set_mut()
                .insert(&ref_t);

            ref_t.vm().task_set_mut().insert(&ref_t);
            ref_t.open_mem_fd_if_needed();
            ref_t.thread_areas_ = self.thread_areas_.clone();
            if flags.contains(CloneFlags::CLONE_SET_TLS)
                && clone_tls_type(ref_t.arch()) == CloneTLSType::UserDescPointer
            {
                ref_t.set_thread_area(RemotePtr::cast(tls));
            }

            if reason == CloneReason::TraceeClone {
                if !flags.contains(CloneFlags::CLONE_SHARE_VM) {
                    // The child's copied address space still contains
                    // every member's syscall buffers and scratch; unmap
                    // them there. The parent's own scratch is left in
                    // place: parts of it may be live as the syscallbuf
                    // alternate stack.
                    let parent_syscallbuf_child = self.syscallbuf_child;
                    let parent_syscallbuf_size = self.syscallbuf_size;
                    let mut remote = RemoteSyscalls::new(&mut ref_t);
                    unmap_buffers_for(
                        &mut remote,
                        RemotePtr::cast(parent_syscallbuf_child),
                        parent_syscallbuf_size,
                        RemotePtr::null(),
                        0,
                    );
                    for sibling in self.vm().task_set().iter_except(self.serial()) {
                        let sib = sibling.borrow();
                        let sib_syscallbuf = sib.syscallbuf_child;
                        let sib_syscallbuf_size = sib.syscallbuf_size;
                        let sib_scratch = sib.scratch_ptr;
                        let sib_scratch_size = sib.scratch_size;
                        drop(sib);
                        unmap_buffers_for(
                            &mut remote,
                            RemotePtr::cast(sib_syscallbuf),
                            sib_syscallbuf_size,
                            sib_scratch,
                            sib_scratch_size,
                        );
                    }
                }

                if flags.contains(CloneFlags::CLONE_SHARE_FILES) {
                    // The child must not close the parent's fds; they are
                    // owned by `self`.
                    ref_t.desched_fd_child = -1;
                    ref_t.cloned_file_data_fd_child = -1;
                } else {
                    // The copied fd table holds every member's buffer
                    // fds; close them in the child.
                    let parent_desched = self.desched_fd_child;
                    let parent_cloned_data = self.cloned_file_data_fd_child;
                    let mut remote = RemoteSyscalls::new(&mut ref_t);
                    close_buffers_for(&mut remote, parent_desched, parent_cloned_data);
                    for sibling in self.fd_table().borrow().task_set().iter_except(self.serial())
                    {
                        let sib = sibling.borrow();
                        let fds = (sib.desched_fd_child, sib.cloned_file_data_fd_child);
                        drop(sib);
                        close_buffers_for(&mut remote, fds.0, fds.1);
                    }
                }
            }
        }

        new_task_session.track_task(rc_t.borrow().rec_tid, rc_t.clone());
        rc_t
    }

    /// Grab this task's state for reconstructing an identical copy via
    /// os_fork_into/os_clone_into + copy_state.
    pub fn capture_state(&mut self) -> CapturedState {
        let cloned_file_data_offset = if self.cloned_file_data_fd_child >= 0 {
            read_fd_offset(self.tid, self.cloned_file_data_fd_child)
        } else {
            0
        };
        CapturedState {
            ticks: self.ticks,
            regs: *self.regs_ref(),
            extra_regs: self.extra_regs().clone(),
            prname: self.prname.clone(),
            thread_areas: self.thread_areas_.clone(),
            syscallbuf_child: self.syscallbuf_child,
            syscallbuf_size: self.syscallbuf_size,
            preload_globals: self.preload_globals,
            scratch_ptr: self.scratch_ptr,
            scratch_size: self.scratch_size,
            top_of_stack: self.top_of_stack,
            cloned_file_data_offset,
            thread_locals: self.thread_locals,
            rec_tid: self.rec_tid,
            serial: self.serial(),
            desched_fd_child: self.desched_fd_child,
            cloned_file_data_fd_child: self.cloned_file_data_fd_child,
            wait_status: self.wait_status,
        }
    }

    /// Make this task an identical copy of the captured one in every way
    /// relevant to replay. This task must have been created by
    /// os_fork_into/os_clone_into; metadata is copied locally, the rest is
    /// injected through remote syscalls.
    pub fn copy_state(&mut self, state: &CapturedState) {
        self.set_regs(&state.regs);
        self.set_extra_regs(&state.extra_regs);
        {
            let arch = self.arch();
            let prctl_no = syscalls(arch).prctl;
            let set_thread_area_no = syscalls(arch).set_thread_area;
            let mut remote = RemoteSyscalls::new(self);
            {
                let prname_cstr =
                    CString::new(state.prname.as_os_str().as_bytes()).unwrap();
                let mut remote_prname = AutoRestoreMem::push_cstr(&mut remote, &prname_cstr);
                log!(crate::log::LogDebug, "    setting name to {:?}", state.prname);
                let child_addr = remote_prname.get().unwrap();
                remote_prname.remote().infallible_syscall(
                    prctl_no,
                    &[libc::PR_SET_NAME as usize, child_addr.as_usize()],
                );
            }

            // Reinstate the thread areas. On x86-64 TLS travels in fs/gs
            // base, which the register restore already covered.
            if clone_tls_type(arch) == CloneTLSType::UserDescPointer {
                for area in &state.thread_areas {
                    let bytes = u8_slice(area);
                    let mut remote_tls =
                        AutoRestoreMem::new(&mut remote, Some(bytes), bytes.len());
                    let addr = remote_tls.get().unwrap();
                    log!(crate::log::LogDebug, "    setting tls {}", addr);
                    remote_tls
                        .remote()
                        .infallible_syscall(set_thread_area_no, &[addr.as_usize()]);
                }
            }

            if !state.syscallbuf_child.is_null() && state.cloned_file_data_fd_child >= 0 {
                // The fds themselves were preserved by the fork; only the
                // kernel offset needs restoring.
                remote.infallible_lseek(
                    state.cloned_file_data_fd_child,
                    state.cloned_file_data_offset,
                );
            }
        }
        self.thread_areas_ = state.thread_areas.clone();
        self.syscallbuf_size = state.syscallbuf_size;
        ed_assert!(
            self,
            self.syscallbuf_child.is_null(),
            "Syscallbuf should not already be initialized in clone"
        );
        if !state.syscallbuf_child.is_null() {
            self.desched_fd_child = state.desched_fd_child;
            self.cloned_file_data_fd_child = state.cloned_file_data_fd_child;
            self.syscallbuf_child = state.syscallbuf_child;
        }
        self.preload_globals = state.preload_globals;
        self.thread_locals = state.thread_locals;
        // The scratch buffer is a private mapping; the CoW copy made by
        // forking the address space has the semantics we want.
        self.scratch_ptr = state.scratch_ptr;
        self.scratch_size = state.scratch_size;
        // Whatever the source's last wait status was is what ours would
        // have been.
        self.wait_status = state.wait_status;
        self.ticks = state.ticks;
    }

    /// Fork this task into another session, for checkpointing.
    pub fn os_fork_into(&mut self, session: SessionSharedPtr) -> TaskSharedPtr {
        let rec_tid = self.rec_tid;
        let serial = self.serial();
        let mut remote = RemoteSyscalls::new(self);
        let child = os_clone(
            CloneReason::SessionCloneLeader,
            session,
            &mut remote,
            rec_tid,
            serial,
            // A CLEARTID futex is likely in use; it isn't set up here but
            // in copy_state. No SETTID flags either: that earlier work is
            // copied by forking the address space.
            SIGCHLD as usize,
            None,
            None,
            None,
            None,
        );
        // The fork child inherited the setup made for the clone call;
        // "finish" the excursion there too, even though the child never
        // made any syscalls itself.
        remote.restore_state_to(&mut child.borrow_mut());
        child
    }

    /// Tear down this task's syscallbuf and scratch in the tracee. The
    /// task must be in a state where remote syscalls work. Idempotent.
    pub fn destroy_buffers(&mut self) {
        let saved_syscallbuf_child = self.syscallbuf_child;
        let syscallbuf_size = self.syscallbuf_size;
        let scratch_ptr = self.scratch_ptr;
        let scratch_size = self.scratch_size;
        // Clear syscallbuf_child now so nothing tries to use the buffer
        // while it is being torn down.
        self.syscallbuf_child = RemotePtr::null();
        {
            let mut remote = RemoteSyscalls::new(self);
            unmap_buffers_for(
                &mut remote,
                RemotePtr::cast(saved_syscallbuf_child),
                syscallbuf_size,
                scratch_ptr,
                scratch_size,
            );
        }
        self.scratch_ptr = RemotePtr::null();
        let desched = self.desched_fd_child;
        let cloned_data = self.cloned_file_data_fd_child;
        {
            let mut remote = RemoteSyscalls::new(self);
            close_buffers_for(&mut remote, desched, cloned_data);
        }
        self.desched_fd_child = -1;
        self.cloned_file_data_fd_child = -1;
    }

    /// Detach and tear down. For a stable exit the PTRACE_EVENT_EXIT must
    /// have been seen and the buffers destroyed; unstable tasks are
    /// abandoned (possibly leaking a zombie). Removing this task from its
    /// thread group, address space and fd table is the last thing that
    /// happens before the Task is dropped.
    pub fn destroy(&mut self, maybe_detach: Option<bool>) {
        let detach = maybe_detach.unwrap_or(true);
        if detach {
            log!(
                crate::log::LogDebug,
                "task {} (rec:{}) is dying ...",
                self.tid,
                self.rec_tid
            );
            self.fallible_ptrace(PTRACE_DETACH, RemotePtr::null(), &mut PtraceData::None);
        }

        if self.unstable.get() {
            log!(
                crate::log::LogWarn,
                "{} is unstable; not blocking on its termination",
                self.tid
            );
            // This probably leaks a zombie for the tracer's lifetime.
            // Unstable exits may have skipped destroy_buffers(); at least
            // take the shared mapping out of the bookkeeping.
            if !self.syscallbuf_child.is_null() {
                let addr = RemotePtr::cast(self.syscallbuf_child);
                let size = self.syscallbuf_size;
                self.vm().unmap(addr, size);
            }
        } else {
            ed_assert!(self, self.seen_ptrace_exit_event);
            ed_assert!(self, self.syscallbuf_child.is_null());
        }

        let serial = self.serial();
        let tg = self.thread_group();
        tg.borrow_mut().task_set_mut().erase(serial);
        if !self.unstable.get()
            && tg.borrow().task_set().is_empty()
            && !self.session().is_recording()
        {
            // Reap the zombie.
            let ret = unsafe { libc::waitpid(tg.borrow().real_tgid, ptr::null_mut(), __WALL) };
            if ret == -1 {
                ed_assert!(self, errno() == ECHILD || errno() == ESRCH);
            } else {
                ed_assert_eq!(self, ret, tg.borrow().real_tgid);
            }
        }
        self.vm().task_set_mut().erase(serial);
        self.fd_table().borrow_mut().task_set_mut().erase(serial);

        self.session().on_destroy_task(self.rec_tid);
        log!(crate::log::LogDebug, "  dead");
    }
}

/// Make the OS-level calls to clone the remote task and attach a Task to
/// the result. Transient clone failures (EAGAIN under load) are retried.
#[allow(clippy::too_many_arguments)]
pub fn os_clone(
    reason: CloneReason,
    session: SessionSharedPtr,
    remote: &mut RemoteSyscalls,
    rec_child_tid: pid_t,
    new_serial: u32,
    base_flags: usize,
    maybe_stack: Option<RemotePtr<Void>>,
    maybe_ptid: Option<RemotePtr<i32>>,
    maybe_tls: Option<RemotePtr<Void>>,
    maybe_ctid: Option<RemotePtr<i32>>,
) -> TaskSharedPtr {
    let stack = maybe_stack.unwrap_or_else(RemotePtr::null);
    let ptid = maybe_ptid.unwrap_or_else(RemotePtr::null);
    let tls = maybe_tls.unwrap_or_else(RemotePtr::null);
    let ctid = maybe_ctid.unwrap_or_else(RemotePtr::null);

    let mut ret: isize;
    loop {
        ret = perform_remote_clone(remote, base_flags, stack, ptid, tls, ctid);
        if ret != -(EAGAIN as isize) {
            break;
        }
    }
    ed_assert!(
        remote.task(),
        ret >= 0,
        "remote clone failed with errno {}",
        errno_name(-ret as i32)
    );

    let new_tid = remote.new_tid().unwrap();
    remote.task_mut().clone_task(
        reason,
        clone_flags_to_task_flags(base_flags),
        stack,
        tls,
        ctid,
        new_tid,
        Some(rec_child_tid),
        new_serial,
        Some(session),
    )
}

/// Recreate a captured thread inside the leader's process.
pub fn os_clone_into(state: &CapturedState, remote: &mut RemoteSyscalls) -> TaskSharedPtr {
    let session = remote.task().session();
    os_clone(
        CloneReason::SessionCloneNonleader,
        session,
        remote,
        state.rec_tid,
        state.serial,
        // The SIGHAND/SYSVSEM flags are mirrored from glibc to stay clear
        // of kernel-bug territory. CLONE_SETTLS is omitted: tls is set up
        // later in copy_state.
        (CLONE_VM | CLONE_FS | CLONE_FILES | CLONE_SIGHAND | CLONE_THREAD | CLONE_SYSVSEM)
            as usize,
        Some(state.top_of_stack),
        None,
        None,
        None,
    )
}

fn perform_remote_clone(
    remote: &mut RemoteSyscalls,
    base_flags: usize,
    stack: RemotePtr<Void>,
    ptid: RemotePtr<i32>,
    tls: RemotePtr<Void>,
    ctid: RemotePtr<i32>,
) -> isize {
    let arch = remote.arch();
    let clone_no = syscalls(arch).clone;
    match clone_parameter_ordering(arch) {
        CloneParameterOrdering::FlagsStackParentTLSChild => remote.syscall(
            clone_no,
            &[
                base_flags,
                stack.as_usize(),
                ptid.as_usize(),
                tls.as_usize(),
                ctid.as_usize(),
            ],
        ),
        CloneParameterOrdering::FlagsStackParentChildTLS => remote.syscall(
            clone_no,
            &[
                base_flags,
                stack.as_usize(),
                ptid.as_usize(),
                ctid.as_usize(),
                tls.as_usize(),
            ],
        ),
    }
}

/// Translate kernel clone() flag bits into our resource-sharing flags.
pub fn clone_flags_to_task_flags(flags_arg: usize) -> CloneFlags {
    let mut flags = CloneFlags::empty();
    // The rest of the flags are handled by the kernel alone.
    if flags_arg & CLONE_CHILD_CLEARTID as usize != 0 {
        flags |= CloneFlags::CLONE_CLEARTID;
    }
    if flags_arg & CLONE_SETTLS as usize != 0 {
        flags |= CloneFlags::CLONE_SET_TLS;
    }
    if flags_arg & CLONE_SIGHAND as usize != 0 {
        flags |= CloneFlags::CLONE_SHARE_SIGHANDLERS;
    }
    if flags_arg & CLONE_THREAD as usize != 0 {
        flags |= CloneFlags::CLONE_SHARE_THREAD_GROUP;
    }
    if flags_arg & CLONE_VM as usize != 0 {
        flags |= CloneFlags::CLONE_SHARE_VM;
    }
    if flags_arg & CLONE_FILES as usize != 0 {
        flags |= CloneFlags::CLONE_SHARE_FILES;
    }
    flags
}

/// Remotely munmap a task's scratch and syscall buffer and drop them from
/// the address-space bookkeeping.
pub(crate) fn unmap_buffers_for(
    remote: &mut RemoteSyscalls,
    saved_syscallbuf_child: RemotePtr<Void>,
    syscallbuf_size: usize,
    scratch_ptr: RemotePtr<Void>,
    scratch_size: usize,
) {
    let arch = remote.arch();
    let munmap_no = syscalls(arch).munmap;
    if !scratch_ptr.is_null() {
        remote.infallible_syscall(munmap_no, &[scratch_ptr.as_usize(), scratch_size]);
        let vm = remote.task().vm();
        vm.unmap(scratch_ptr, scratch_size);
    }
    if !saved_syscallbuf_child.is_null() {
        remote.infallible_syscall(
            munmap_no,
            &[saved_syscallbuf_child.as_usize(), syscallbuf_size],
        );
        let vm = remote.task().vm();
        vm.unmap(saved_syscallbuf_child, syscallbuf_size);
    }
}

/// Remotely close a task's desched-event and cloned-file-data fds and
/// update the fd table.
pub(crate) fn close_buffers_for(
    remote: &mut RemoteSyscalls,
    desched_fd_child: i32,
    cloned_file_data_fd_child: i32,
) {
    let arch = remote.arch();
    let close_no = syscalls(arch).close;
    if desched_fd_child >= 0 {
        if remote.task().session().is_recording() {
            remote.infallible_syscall(close_no, &[desched_fd_child as usize]);
        }
        let ft = remote.task().fd_table();
        ft.borrow_mut().did_close(desched_fd_child);
    }
    if cloned_file_data_fd_child >= 0 {
        remote.infallible_syscall(close_no, &[cloned_file_data_fd_child as usize]);
        let ft = remote.task().fd_table();
        ft.borrow_mut().did_close(cloned_file_data_fd_child);
    }
}

fn create_seccomp_filter() -> SeccompFilter {
    // Syscalls from the buffered-syscall entry points would be allow-
    // listed here; everything else traps to the tracer. The filter is
    // installed during both recording and replay so the tracee observes
    // the same environment, even though replay emulates the prctl.
    let mut f = SeccompFilter::new();
    f.trace();
    f
}

fn setup_fd_table(fds: &mut FdTable) {
    fds.add_monitor(STDOUT_FILENO, Rc::new(StdioMonitor::new(STDOUT_FILENO)));
    fds.add_monitor(STDERR_FILENO, Rc::new(StdioMonitor::new(STDERR_FILENO)));
    fds.add_monitor(
        REWIND_MAGIC_SAVE_DATA_FD,
        Rc::new(MagicSaveDataMonitor::new()),
    );
    fds.add_monitor(
        REWIND_RESERVED_ROOT_DIR_FD,
        Rc::new(PreserveFileMonitor::new()),
    );
}

/// Everything the child runs between fork and exec. Only async-signal-safe
/// calls allowed; allocations happened before the fork.
fn run_initial_child(
    is_replaying: bool,
    is_recording: bool,
    err_fd: &ScopedFd,
    exe_path_cstr: &CStr,
    argv_array: &[&CStr],
    envp_array: &[&CStr],
    seccomp_prog: &sock_fprog,
) -> ! {
    let pid = getpid();

    set_up_process(is_replaying, is_recording, err_fd);
    // The preceding setup must happen before the SIGSTOP: after it,
    // replay emulates almost all syscalls, but the ones above must run
    // for real.

    // Signal to the tracer that we're configured.
    kill(pid, Signal::SIGSTOP).unwrap_or(());

    // This must run after the tracer has taken ptrace control: once the
    // filter is installed every trapped syscall needs a ptracer or the
    // tracee is killed.
    set_up_seccomp_filter(seccomp_prog, err_fd);

    // Retire a nonzero, variable number of conditional branches so the
    // tracer can check at the first trap that the tick counter works.
    let start = rand::random::<u32>() % 5;
    let num_its = start + 5;
    let mut sum: u32 = 0;
    for i in start..num_its {
        sum = sum.wrapping_add(i);
    }
    unsafe { syscall(SYS_write, -1, &sum, size_of_val(&sum)) };

    match execve(exe_path_cstr, argv_array, envp_array) {
        Err(nix::Error::Sys(Errno::ENOENT)) => spawned_child_fatal_error(
            err_fd,
            &format!(
                "execve failed: '{:?}' (or interpreter) not found",
                exe_path_cstr
            ),
        ),
        _ => spawned_child_fatal_error(
            err_fd,
            &format!("execve of '{:?}' failed", exe_path_cstr),
        ),
    }
}

/// Prepare the child for being recorded/replayed: shut off the direct
/// sources of nondeterminism and set up the reserved fds.
fn set_up_process(is_replaying: bool, _is_recording: bool, err_fd: &ScopedFd) {
    // CLOEXEC so the original fds are closed by the coming exec.
    let maybe_fd_magic = open(
        "/dev/null",
        OFlag::O_WRONLY | OFlag::O_CLOEXEC,
        Mode::empty(),
    );
    if maybe_fd_magic.is_err() {
        spawned_child_fatal_error(err_fd, "error opening /dev/null");
    }
    let fd_magic = maybe_fd_magic.unwrap();
    let maybe_dup_magic = dup2(fd_magic, REWIND_MAGIC_SAVE_DATA_FD);
    if maybe_dup_magic.is_err() || maybe_dup_magic.unwrap() != REWIND_MAGIC_SAVE_DATA_FD {
        spawned_child_fatal_error(err_fd, "error duping to MAGIC_SAVE_DATA_FD");
    }

    let maybe_fd_root = open(
        "/",
        OFlag::O_PATH | OFlag::O_DIRECTORY | OFlag::O_CLOEXEC,
        Mode::empty(),
    );
    if maybe_fd_root.is_err() {
        spawned_child_fatal_error(err_fd, "error opening root directory");
    }
    let maybe_dup_root = dup2(maybe_fd_root.unwrap(), REWIND_RESERVED_ROOT_DIR_FD);
    if maybe_dup_root.is_err() || maybe_dup_root.unwrap() != REWIND_RESERVED_ROOT_DIR_FD {
        spawned_child_fatal_error(err_fd, "error duping to RESERVED_ROOT_DIR_FD");
    }

    if is_replaying {
        // The replaying tasks should silently reap any terminating
        // children.
        if unsafe { signal(Signal::SIGCHLD, SigHandler::SigIgn) }.is_err() {
            spawned_child_fatal_error(err_fd, "error ignoring SIGCHLD");
        }

        // If the tracer dies, don't let runaway replay tasks drag down
        // the machine.
        if unsafe { prctl(PR_SET_PDEATHSIG, SIGKILL) } < 0 {
            spawned_child_fatal_error(err_fd, "Couldn't set parent-death signal");
        }

        // Put replaying processes in their own session, out of reach of
        // terminal signals (SIGTSTP/SIGINT/SIGWINCH). Failure is ignored.
        setsid().unwrap_or_else(|_| Pid::from_raw(0));
    }

    // Trap to the tracer on 'rdtsc' so the timestamp can be recorded and
    // replayed deterministically.
    if unsafe { prctl(PR_SET_TSC, PR_TSC_SIGSEGV, 0, 0, 0) } < 0 {
        spawned_child_fatal_error(err_fd, "error setting up prctl");
    }

    if unsafe { prctl(PR_SET_NO_NEW_PRIVS, 1, 0, 0, 0) } < 0 {
        spawned_child_fatal_error(
            err_fd,
            "prctl(NO_NEW_PRIVS) failed, SECCOMP_FILTER is not available: your\n\
             kernel is too old.",
        );
    }
}

/// Must be called after the tracer has taken ptrace control; the filter
/// demands a ptracer once installed.
fn set_up_seccomp_filter(prog: &sock_fprog, err_fd: &ScopedFd) {
    // During replay the prctl is emulated, not passed to the kernel.
    if unsafe { prctl(PR_SET_SECCOMP, SECCOMP_MODE_FILTER, prog as *const sock_fprog, 0, 0) } < 0
    {
        spawned_child_fatal_error(
            err_fd,
            "prctl(SECCOMP) failed, SECCOMP_FILTER is not available: your\n\
             kernel is too old.",
        );
    }
    // Anything that happens from this point on gets filtered.
}

fn spawned_child_fatal_error(err_fd: &ScopedFd, msg: &str) -> ! {
    write_all(err_fd.as_raw(), msg.as_bytes());
    let errno_suffix = format!(" ({})", errno_name(errno()));
    write_all(err_fd.as_raw(), errno_suffix.as_bytes());
    unsafe { libc::_exit(1) }
}
