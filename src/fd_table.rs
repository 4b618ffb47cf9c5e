//! The file-descriptor table shared by tasks created with CLONE_FILES.
//! The control plane notifies it on dup/close/write syscall exits; it
//! routes those to any monitors attached to the fds involved.

use crate::{
    file_monitor::{FileMonitor, Range},
    task::Task,
    task_set::TaskSet,
};
use std::{cell::RefCell, collections::HashMap, rc::Rc};

pub type FdTableSharedPtr = Rc<RefCell<FdTable>>;

pub struct FdTable {
    tasks: TaskSet,
    monitors: HashMap<i32, Rc<dyn FileMonitor>>,
}

impl FdTable {
    pub fn create() -> FdTableSharedPtr {
        Rc::new(RefCell::new(FdTable {
            tasks: TaskSet::new(),
            monitors: HashMap::new(),
        }))
    }

    pub fn task_set(&self) -> &TaskSet {
        &self.tasks
    }

    pub fn task_set_mut(&mut self) -> &mut TaskSet {
        &mut self.tasks
    }

    pub fn add_monitor(&mut self, fd: i32, monitor: Rc<dyn FileMonitor>) {
        // Overwriting an existing monitor is deliberate: the old fd
        // meaning is gone.
        self.monitors.insert(fd, monitor);
    }

    pub fn is_monitoring(&self, fd: i32) -> bool {
        self.monitors.contains_key(&fd)
    }

    pub fn monitor_of(&self, fd: i32) -> Option<Rc<dyn FileMonitor>> {
        self.monitors.get(&fd).cloned()
    }

    /// dup/dup2/dup3 or fcntl(DUPFD*) succeeded: the monitor travels with
    /// the duplicated fd.
    pub fn did_dup(&mut self, from: i32, to: i32) {
        if to < 0 {
            return;
        }
        match self.monitors.get(&from) {
            Some(m) => {
                let m = m.clone();
                self.monitors.insert(to, m);
            }
            None => {
                self.monitors.remove(&to);
            }
        }
    }

    pub fn did_close(&mut self, fd: i32) {
        if let Some(m) = self.monitors.get(&fd) {
            if m.is_preserved() {
                // The tracee can't really close this fd; keep monitoring.
                return;
            }
        }
        self.monitors.remove(&fd);
    }

    /// write/writev/pwrite64/pwritev succeeded on `fd`.
    pub fn did_write(&self, t: &mut Task, fd: i32, ranges: &[Range], offset: i64) {
        if let Some(m) = self.monitors.get(&fd) {
            m.did_write(t, ranges, offset);
        }
    }

    /// A private copy for a task that unshared its fd table (clone without
    /// CLONE_FILES, unshare(CLONE_FILES), or exec).
    pub fn clone_into_task(&self, t: &Task) -> FdTableSharedPtr {
        let mut tasks = TaskSet::new();
        tasks.insert(t);
        Rc::new(RefCell::new(FdTable {
            tasks,
            monitors: self.monitors.clone(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file_monitor::{FileMonitorType, PreserveFileMonitor, StdioMonitor};

    #[test]
    fn dup_carries_the_monitor() {
        let table = FdTable::create();
        let mut t = table.borrow_mut();
        t.add_monitor(1, Rc::new(StdioMonitor::new(1)));
        t.did_dup(1, 7);
        assert!(t.is_monitoring(7));
        assert_eq!(
            FileMonitorType::Stdio,
            t.monitor_of(7).unwrap().file_monitor_type()
        );
        // Duplicating an unmonitored fd over a monitored one clears it.
        t.did_dup(3, 7);
        assert!(!t.is_monitoring(7));
    }

    #[test]
    fn preserved_fds_survive_close() {
        let table = FdTable::create();
        let mut t = table.borrow_mut();
        t.add_monitor(999, Rc::new(PreserveFileMonitor::new()));
        t.did_close(999);
        assert!(t.is_monitoring(999));
        t.add_monitor(5, Rc::new(StdioMonitor::new(5)));
        t.did_close(5);
        assert!(!t.is_monitoring(5));
    }
}
