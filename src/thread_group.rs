use crate::{
    session::{SessionSharedPtr, SessionSharedWeakPtr},
    task::Task,
    task_set::TaskSet,
    taskish_uid::ThreadGroupUid,
    wait_status::WaitStatus,
};
use libc::pid_t;
use std::{
    cell::RefCell,
    rc::{Rc, Weak},
};

pub type ThreadGroupSharedPtr = Rc<RefCell<ThreadGroup>>;
pub type ThreadGroupSharedWeakPtr = Weak<RefCell<ThreadGroup>>;

/// Tracks a group of tasks sharing a thread-group id, rooted at the child
/// of `fork()` that became the ancestor of all other threads in the group.
/// Each constituent task owns a reference to this.
pub struct ThreadGroup {
    tasks: TaskSet,
    pub tgid: pid_t,
    pub real_tgid: pid_t,
    pub exit_status: WaitStatus,
    /// Whether this thread group has execed.
    pub execed: bool,

    session_: SessionSharedWeakPtr,
    serial: u32,
    weak_self: ThreadGroupSharedWeakPtr,
}

impl ThreadGroup {
    pub fn new(
        session: SessionSharedWeakPtr,
        tgid: pid_t,
        real_tgid: pid_t,
        serial: u32,
    ) -> ThreadGroupSharedPtr {
        log!(
            crate::log::LogDebug,
            "creating new thread group {} (real tgid: {})",
            tgid,
            real_tgid
        );
        let tg = ThreadGroup {
            tasks: TaskSet::new(),
            tgid,
            real_tgid,
            exit_status: Default::default(),
            execed: false,
            session_: session,
            serial,
            weak_self: Weak::new(),
        };
        let shared = Rc::new(RefCell::new(tg));
        shared.borrow_mut().weak_self = Rc::downgrade(&shared);
        shared
    }

    pub fn task_set(&self) -> &TaskSet {
        &self.tasks
    }

    pub fn task_set_mut(&mut self) -> &mut TaskSet {
        &mut self.tasks
    }

    pub fn session(&self) -> SessionSharedPtr {
        self.session_.upgrade().unwrap()
    }

    pub fn try_session(&self) -> Option<SessionSharedPtr> {
        self.session_.upgrade()
    }

    pub fn tguid(&self) -> ThreadGroupUid {
        ThreadGroupUid::new_with(self.tgid, self.serial)
    }

    pub fn weak_self_ptr(&self) -> ThreadGroupSharedWeakPtr {
        self.weak_self.clone()
    }

    /// Mark every member as "unstable": the kernel is reaping the group in
    /// an unknown order (exit_group or a core-dumping signal), so looking
    /// runnable no longer means a task can be waited on. Scheduling control
    /// is handed back to the kernel and members are detached without being
    /// harvested.
    pub fn destabilize(&self, active_task: &Task) {
        log!(
            crate::log::LogDebug,
            "destabilizing thread group {}",
            self.tgid
        );
        active_task.unstable.set(true);
        for t in self.task_set().iter_except(active_task.serial()) {
            t.borrow().unstable.set(true);
            log!(
                crate::log::LogDebug,
                "  destabilized task {}",
                t.borrow().tid
            );
        }
    }
}
