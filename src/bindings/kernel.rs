//! Kernel structs libc doesn't (portably) export.

#![allow(non_camel_case_types)]

/// The GDT entry descriptor passed to set_thread_area / clone(CLONE_SETTLS).
/// Word-size independent, which capture/restore of thread areas relies on.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct user_desc {
    pub entry_number: u32,
    pub base_addr: u32,
    pub limit: u32,
    /// Bitfield: seg_32bit, contents:2, read_exec_only, limit_in_pages,
    /// seg_not_present, useable, (x86-64: lm).
    pub flags: u32,
}

/// The data a seccomp filter program inspects.
#[repr(C)]
#[derive(Copy, Clone)]
pub struct seccomp_data {
    pub nr: i32,
    pub arch: u32,
    pub instruction_pointer: u64,
    pub args: [u64; 6],
}
