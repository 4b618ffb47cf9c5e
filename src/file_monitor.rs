//! Monitors attached to particular tracee fds. The fd table consults them
//! when the dispatcher observes writes to monitored streams.

use crate::{
    remote_ptr::{RemotePtr, Void},
    task::Task,
};

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum FileMonitorType {
    Stdio,
    MagicSaveData,
    Preserved,
}

/// A contiguous range of written tracee memory.
#[derive(Copy, Clone, Debug)]
pub struct Range {
    pub data: RemotePtr<Void>,
    pub length: usize,
}

impl Range {
    pub fn new(data: RemotePtr<Void>, length: usize) -> Range {
        Range { data, length }
    }
}

pub trait FileMonitor {
    fn file_monitor_type(&self) -> FileMonitorType;

    /// Whether tracee attempts to close or dup over this fd should be
    /// hidden from the tracee.
    fn is_preserved(&self) -> bool {
        false
    }

    /// Notification of a successful write/writev/pwrite*/pwritev through
    /// this fd. `offset` is the file offset for the positional variants,
    /// -1 otherwise.
    fn did_write(&self, _t: &mut Task, _ranges: &[Range], _offset: i64) {}
}

/// Monitors stdout/stderr so recorded output can be synchronized with
/// event processing.
pub struct StdioMonitor {
    fd: i32,
}

impl StdioMonitor {
    pub fn new(fd: i32) -> StdioMonitor {
        StdioMonitor { fd }
    }
}

impl FileMonitor for StdioMonitor {
    fn file_monitor_type(&self) -> FileMonitorType {
        FileMonitorType::Stdio
    }

    fn did_write(&self, t: &mut Task, ranges: &[Range], _offset: i64) {
        let total: usize = ranges.iter().map(|r| r.length).sum();
        log!(
            crate::log::LogDebug,
            "stdio fd {} of task {} wrote {} bytes",
            self.fd,
            t.tid,
            total
        );
    }
}

/// The write sink tracees use to submit data for cross-run verification.
pub struct MagicSaveDataMonitor;

impl MagicSaveDataMonitor {
    pub fn new() -> MagicSaveDataMonitor {
        MagicSaveDataMonitor
    }
}

impl Default for MagicSaveDataMonitor {
    fn default() -> Self {
        MagicSaveDataMonitor::new()
    }
}

impl FileMonitor for MagicSaveDataMonitor {
    fn file_monitor_type(&self) -> FileMonitorType {
        FileMonitorType::MagicSaveData
    }

    fn did_write(&self, t: &mut Task, ranges: &[Range], _offset: i64) {
        // The data itself goes to the trace stream; here we just pull it
        // out of the tracee so short reads surface immediately.
        for r in ranges {
            let mut buf = vec![0u8; r.length];
            t.read_bytes_helper(r.data, &mut buf, None);
        }
    }
}

/// Marks an fd that must survive tracee interference (the reserved root
/// dir fd, the magic-save-data fd).
pub struct PreserveFileMonitor;

impl PreserveFileMonitor {
    pub fn new() -> PreserveFileMonitor {
        PreserveFileMonitor
    }
}

impl Default for PreserveFileMonitor {
    fn default() -> Self {
        PreserveFileMonitor::new()
    }
}

impl FileMonitor for PreserveFileMonitor {
    fn file_monitor_type(&self) -> FileMonitorType {
        FileMonitorType::Preserved
    }

    fn is_preserved(&self) -> bool {
        true
    }
}
