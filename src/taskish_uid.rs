use libc::pid_t;
use std::marker::PhantomData;
use std::ops::Deref;

/// An ID unique within a session, stable across replays of the same trace.
/// Needed because tids can be recycled during a long-running session.
#[derive(Copy, Clone, Eq, PartialEq, PartialOrd, Ord, Hash, Debug)]
pub struct TaskishUid<T> {
    tid_: pid_t,
    serial_: u32,
    phantom_data: PhantomData<T>,
}

impl<T> TaskishUid<T> {
    pub fn new() -> TaskishUid<T> {
        TaskishUid {
            tid_: 0,
            serial_: 0,
            phantom_data: PhantomData,
        }
    }

    pub fn new_with(tid: pid_t, serial: u32) -> TaskishUid<T> {
        TaskishUid {
            tid_: tid,
            serial_: serial,
            phantom_data: PhantomData,
        }
    }

    pub fn tid(&self) -> pid_t {
        self.tid_
    }

    pub fn serial(&self) -> u32 {
        self.serial_
    }
}

impl<T> Default for TaskishUid<T> {
    fn default() -> Self {
        TaskishUid::new()
    }
}

// Placeholder referent types; deriving traits through PhantomData requires
// the parameter itself to implement them.
#[derive(Copy, Clone, PartialOrd, PartialEq, Eq, Ord, Hash, Debug)]
pub struct TaskStandIn;
#[derive(Copy, Clone, PartialOrd, PartialEq, Eq, Ord, Hash, Debug)]
pub struct ThreadGroupStandIn;
#[derive(Copy, Clone, PartialOrd, PartialEq, Eq, Ord, Hash, Debug)]
pub struct AddressSpaceStandIn;

pub type TaskUid = TaskishUid<TaskStandIn>;
pub type ThreadGroupUid = TaskishUid<ThreadGroupStandIn>;

/// An AddressSpace's identity additionally carries the count of execs that
/// produced it, since exec replaces the address space of the same task.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct AddressSpaceUid {
    taskish: TaskishUid<AddressSpaceStandIn>,
    exec_count: u32,
}

impl AddressSpaceUid {
    pub fn new() -> AddressSpaceUid {
        AddressSpaceUid {
            taskish: TaskishUid::new(),
            exec_count: 0,
        }
    }

    pub fn new_with(tid: pid_t, serial: u32, exec_count: u32) -> AddressSpaceUid {
        AddressSpaceUid {
            taskish: TaskishUid::new_with(tid, serial),
            exec_count,
        }
    }

    pub fn exec_count(&self) -> u32 {
        self.exec_count
    }
}

impl Default for AddressSpaceUid {
    fn default() -> Self {
        AddressSpaceUid::new()
    }
}

impl Deref for AddressSpaceUid {
    type Target = TaskishUid<AddressSpaceStandIn>;

    fn deref(&self) -> &Self::Target {
        &self.taskish
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_space_uids_order_by_tid_then_serial_then_exec() {
        let a = AddressSpaceUid::new_with(1, 1, 2);
        let b = AddressSpaceUid::new_with(0, 2, 3);
        let c = AddressSpaceUid::new_with(0, 1, 4);
        let d = AddressSpaceUid::new_with(0, 0, 9);
        assert!(a > b);
        assert!(b > c);
        assert!(c > d);
        assert_eq!(b.tid(), c.tid());
    }

    #[test]
    fn task_uids_order_by_tid_then_serial() {
        let a = TaskUid::new_with(1, 1);
        let b = TaskUid::new_with(0, 9);
        let c = TaskUid::new_with(0, 7);
        assert!(a > b);
        assert!(b > c);
    }
}
