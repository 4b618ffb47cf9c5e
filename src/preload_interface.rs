//! The contract with the syscall-buffer library that gets injected into
//! tracees. The library itself is a separate artifact; the control plane
//! only needs the shared-buffer header layout, the shared-mapping naming
//! scheme and the size of the per-thread locals block it mirrors.

use libc::pid_t;

/// Size of the block of thread-local state mirrored between tracer and
/// tracee through the distinguished shared mapping.
pub const PRELOAD_THREAD_LOCALS_SIZE: usize = 104;

bitflags! {
    /// Why the syscall buffer is currently locked against new records.
    pub struct SyscallbufLockedWhy: u8 {
        /// The tracee is in the middle of manipulating the buffer.
        const TRACEE = 0x1;
        /// The tracer has locked it (e.g. around checkpointing).
        const TRACER = 0x2;
    }
}

/// Header of a tracee's shared syscall buffer. Must match the layout the
/// preload library compiles against; records follow the header.
#[repr(C)]
#[derive(Copy, Clone, Default)]
pub struct syscallbuf_hdr {
    /// Bytes of recorded data after this header.
    pub num_rec_bytes: u32,
    /// mprotect calls recorded via the buffered path.
    pub mprotect_record_count: u32,
    /// The prefix of those already applied to the address-space map.
    pub mprotect_record_count_completed: u32,
    /// Incremented whenever the blocked-signal set changes.
    pub blocked_sigs_generation: u32,
    /// Nonzero forces the next buffer flush to be aborted.
    pub abort_commit: u8,
    /// Nonzero when the tracee failed mid-arm of the desched event.
    pub failed_during_preparation: u8,
    /// SyscallbufLockedWhy bits.
    pub locked: u8,
    /// Nonzero while a desched event could fire for the current record.
    pub desched_signal_may_be_relevant: u8,
}

/// Per-record header in the syscall buffer.
#[repr(C)]
#[derive(Copy, Clone, Default)]
pub struct syscallbuf_record {
    /// Bytes in this record, including this header, not padded.
    pub size: u32,
    pub syscallno: u16,
    pub desched: u8,
    pub _padding: u8,
    pub ret: i64,
}

/// Records are word-aligned in the buffer.
pub fn stored_record_size(size: u32) -> u32 {
    (size + 7) & !7u32
}

/// Name of the shared mapping backing a task's syscall buffer.
pub fn syscallbuf_mapping_name(rec_tid: pid_t) -> String {
    format!("syscallbuf.{}", rec_tid)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem::size_of;

    #[test]
    fn header_field_offsets_are_stable() {
        assert_eq!(0, offset_of!(syscallbuf_hdr, num_rec_bytes));
        assert_eq!(4, offset_of!(syscallbuf_hdr, mprotect_record_count));
        assert_eq!(
            8,
            offset_of!(syscallbuf_hdr, mprotect_record_count_completed)
        );
        assert_eq!(14, offset_of!(syscallbuf_hdr, locked));
        assert_eq!(16, size_of::<syscallbuf_hdr>());
    }

    #[test]
    fn record_sizes_align_to_words() {
        assert_eq!(16, stored_record_size(16));
        assert_eq!(24, stored_record_size(17));
        assert_eq!(24, stored_record_size(23));
    }

    #[test]
    fn mapping_names_embed_the_recorded_tid() {
        assert_eq!("syscallbuf.123", syscallbuf_mapping_name(123));
    }
}
