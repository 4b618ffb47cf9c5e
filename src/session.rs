//! The session context a task family runs in: recording or replaying, the
//! task table, serial allocation, tick accounting and the few contracts
//! the control plane exchanges with the scheduler and the spawn error
//! channel. Trace I/O itself lives elsewhere.

use crate::{
    address_space::{AddressSpace, AddressSpaceSharedPtr},
    perf_counters::TIME_SLICE_SIGNAL,
    scoped_fd::ScopedFd,
    sig,
    sig::Sig,
    task::TaskSharedPtr,
    thread_group::{ThreadGroup, ThreadGroupSharedPtr},
    ticks::Ticks,
};
use libc::pid_t;
use nix::{
    fcntl::OFlag,
    sys::utsname::uname,
    unistd::{pipe2, read},
};
use std::{
    cell::{Cell, Ref, RefCell, RefMut},
    collections::BTreeMap,
    ffi::OsStr,
    os::unix::ffi::OsStrExt,
    rc::{Rc, Weak},
};

pub type SessionSharedPtr = Rc<Session>;
pub type SessionSharedWeakPtr = Weak<Session>;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SessionMode {
    Recording,
    Replaying,
}

/// Whether the kernel reports the seccomp event before or after the
/// syscall-entry stop. The order flipped in Linux 4.8.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum PtraceSyscallSeccompOrdering {
    SeccompBeforeSyscall,
    SyscallBeforeSeccomp,
}

pub struct Session {
    weak_self: RefCell<SessionSharedWeakPtr>,
    mode: SessionMode,
    /// All tasks, keyed by recorded tid.
    tasks: RefCell<BTreeMap<pid_t, TaskSharedPtr>>,
    next_serial: Cell<u32>,
    ticks_processed: Cell<Ticks>,
    /// Set when a PTRACE_INTERRUPT-induced stop should end the current
    /// scheduling quantum; the scheduler consumes it.
    timeslice_expired: Cell<bool>,
    syscall_seccomp_ordering: PtraceSyscallSeccompOrdering,
    /// Read end of the pipe spawned children report fatal setup errors on.
    spawn_error_rx: RefCell<ScopedFd>,
}

impl Session {
    pub fn new(mode: SessionMode) -> SessionSharedPtr {
        let session = Rc::new(Session {
            weak_self: RefCell::new(Weak::new()),
            mode,
            tasks: RefCell::new(BTreeMap::new()),
            next_serial: Cell::new(1),
            ticks_processed: Cell::new(0),
            timeslice_expired: Cell::new(false),
            syscall_seccomp_ordering: detect_syscall_seccomp_ordering(),
            spawn_error_rx: RefCell::new(ScopedFd::new()),
        });
        *session.weak_self.borrow_mut() = Rc::downgrade(&session);
        session
    }

    pub fn weak_self_ptr(&self) -> SessionSharedWeakPtr {
        self.weak_self.borrow().clone()
    }

    pub fn mode(&self) -> SessionMode {
        self.mode
    }

    pub fn is_recording(&self) -> bool {
        self.mode == SessionMode::Recording
    }

    pub fn is_replaying(&self) -> bool {
        self.mode == SessionMode::Replaying
    }

    pub fn next_task_serial(&self) -> u32 {
        let serial = self.next_serial.get();
        self.next_serial.set(serial + 1);
        serial
    }

    pub fn tasks(&self) -> Ref<BTreeMap<pid_t, TaskSharedPtr>> {
        self.tasks.borrow()
    }

    pub fn tasks_mut(&self) -> RefMut<BTreeMap<pid_t, TaskSharedPtr>> {
        self.tasks.borrow_mut()
    }

    pub fn track_task(&self, rec_tid: pid_t, t: TaskSharedPtr) {
        self.tasks.borrow_mut().insert(rec_tid, t);
    }

    pub fn find_task_from_rec_tid(&self, rec_tid: pid_t) -> Option<TaskSharedPtr> {
        self.tasks.borrow().get(&rec_tid).cloned()
    }

    pub fn on_destroy_task(&self, rec_tid: pid_t) {
        self.tasks.borrow_mut().remove(&rec_tid);
    }

    pub fn accumulate_ticks_processed(&self, ticks: Ticks) {
        self.ticks_processed.set(self.ticks_processed.get() + ticks);
    }

    pub fn ticks_processed(&self) -> Ticks {
        self.ticks_processed.get()
    }

    /// The scheduler contract: a PTRACE_INTERRUPT-induced stop in
    /// recording forces the current quantum to end.
    pub fn expire_timeslice(&self) {
        self.timeslice_expired.set(true);
    }

    pub fn take_timeslice_expired(&self) -> bool {
        self.timeslice_expired.replace(false)
    }

    pub fn timeslice_expired(&self) -> bool {
        self.timeslice_expired.get()
    }

    pub fn syscall_seccomp_ordering(&self) -> PtraceSyscallSeccompOrdering {
        self.syscall_seccomp_ordering
    }

    /// Kernel-internal signals that replay silently continues past rather
    /// than delivering.
    pub fn is_ignored_signal(sig: Option<Sig>) -> bool {
        match sig {
            Some(s) => {
                s == sig::SIGSTOP
                    || s == sig::SIGCHLD
                    || s == sig::SIGWINCH
                    || s == sig::SIGPROF
                    || s.as_raw() == TIME_SLICE_SIGNAL
            }
            None => false,
        }
    }

    /// Which CPU the trace binds tracees (and the tracer) to, if any.
    pub fn cpu_binding(&self) -> Option<u32> {
        crate::flags::Flags::get().bind_cpu
    }

    /// Create the error channel for a spawned child; returns the write end
    /// to pass across fork.
    pub fn create_spawn_error_pipe(&self) -> ScopedFd {
        let (rx, tx) = pipe2(OFlag::O_CLOEXEC).unwrap();
        *self.spawn_error_rx.borrow_mut() = ScopedFd::from_raw(rx);
        ScopedFd::from_raw(tx)
    }

    /// Collect whatever the dying child managed to report.
    pub fn read_spawned_task_error(&self) -> String {
        let fd = self.spawn_error_rx.borrow();
        if !fd.is_open() {
            return String::new();
        }
        let mut buf = [0u8; 1024];
        match read(fd.as_raw(), &mut buf) {
            Ok(n) => String::from_utf8_lossy(&buf[..n]).into_owned(),
            Err(_) => String::new(),
        }
    }

    pub fn create_vm(
        &self,
        exe_image: &OsStr,
        leader_tid: pid_t,
        leader_serial: u32,
        exec_count: u32,
    ) -> AddressSpaceSharedPtr {
        AddressSpace::new(
            self.weak_self_ptr(),
            exe_image,
            leader_tid,
            leader_serial,
            exec_count,
        )
    }

    pub fn clone_vm(
        &self,
        vm: &AddressSpace,
        leader_tid: pid_t,
        leader_serial: u32,
    ) -> AddressSpaceSharedPtr {
        vm.clone_for_fork(self.weak_self_ptr(), leader_tid, leader_serial)
    }

    pub fn create_tg(&self, tgid: pid_t, real_tgid: pid_t) -> ThreadGroupSharedPtr {
        ThreadGroup::new(self.weak_self_ptr(), tgid, real_tgid, self.next_task_serial())
    }
}

fn detect_syscall_seccomp_ordering() -> PtraceSyscallSeccompOrdering {
    let info = uname();
    let release = info.release();
    let mut parts = release.split(|c: char| !c.is_ascii_digit());
    let major: u32 = parts.next().and_then(|s| s.parse().ok()).unwrap_or(0);
    let minor: u32 = parts.next().and_then(|s| s.parse().ok()).unwrap_or(0);
    if (major, minor) >= (4, 8) {
        PtraceSyscallSeccompOrdering::SyscallBeforeSeccomp
    } else {
        PtraceSyscallSeccompOrdering::SeccompBeforeSyscall
    }
}

/// The prname a fresh task family gets from its exe path.
pub fn prname_from_exe_image(exe_image: &OsStr) -> &OsStr {
    let bytes = exe_image.as_bytes();
    let pos = bytes.iter().rposition(|&c| c == b'/').map_or(0, |p| p + 1);
    OsStr::from_bytes(&bytes[pos..])
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::convert::TryFrom;

    #[test]
    fn serials_are_monotone() {
        let s = Session::new(SessionMode::Recording);
        let a = s.next_task_serial();
        let b = s.next_task_serial();
        assert!(b > a);
    }

    #[test]
    fn ignored_signal_class() {
        assert!(Session::is_ignored_signal(Some(sig::SIGSTOP)));
        assert!(Session::is_ignored_signal(Some(sig::SIGCHLD)));
        assert!(Session::is_ignored_signal(Some(
            Sig::try_from(TIME_SLICE_SIGNAL).unwrap()
        )));
        assert!(!Session::is_ignored_signal(Some(sig::SIGTRAP)));
        assert!(!Session::is_ignored_signal(None));
    }

    #[test]
    fn timeslice_expiry_is_consumed_once() {
        let s = Session::new(SessionMode::Recording);
        assert!(!s.timeslice_expired());
        s.expire_timeslice();
        assert!(s.take_timeslice_expired());
        assert!(!s.take_timeslice_expired());
    }

    #[test]
    fn prname_is_the_exe_basename() {
        assert_eq!(
            OsStr::new("true"),
            prname_from_exe_image(OsStr::new("/bin/true"))
        );
        assert_eq!(OsStr::new("ls"), prname_from_exe_image(OsStr::new("ls")));
    }
}
