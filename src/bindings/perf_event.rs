//! perf_event_open ABI. libc exposes neither the attribute block nor the
//! ioctls, so they are spelled out here. The attribute flags live in one
//! u64 bitfield in the kernel; we keep them as mask constants over a plain
//! `flags` word.

#![allow(non_upper_case_globals)]

use libc::c_ulong;

pub const PERF_TYPE_HARDWARE: u32 = 0;
pub const PERF_TYPE_RAW: u32 = 4;

pub const PERF_COUNT_HW_CPU_CYCLES: u64 = 0;

// _IO('$', 0..4); PERIOD is _IOW('$', 4, u64).
pub const PERF_EVENT_IOC_ENABLE: c_ulong = 0x2400;
pub const PERF_EVENT_IOC_DISABLE: c_ulong = 0x2401;
pub const PERF_EVENT_IOC_RESET: c_ulong = 0x2403;
pub const PERF_EVENT_IOC_PERIOD: c_ulong = 0x4008_2404;

// Bit positions inside perf_event_attr.flags.
pub const ATTR_DISABLED: u64 = 1 << 0;
pub const ATTR_PINNED: u64 = 1 << 2;
pub const ATTR_EXCLUSIVE: u64 = 1 << 3;
pub const ATTR_EXCLUDE_USER: u64 = 1 << 4;
pub const ATTR_EXCLUDE_KERNEL: u64 = 1 << 5;
pub const ATTR_EXCLUDE_HV: u64 = 1 << 6;
pub const ATTR_EXCLUDE_GUEST: u64 = 1 << 20;

/// The leading fields of the kernel's perf_event_attr, through
/// `sample_max_stack`. `size` is set to the size of this struct; newer
/// kernel fields default to zero, which is what we want for all of them.
#[repr(C)]
#[derive(Copy, Clone)]
pub struct perf_event_attr {
    pub type_: u32,
    pub size: u32,
    pub config: u64,
    pub sample_period: u64,
    pub sample_type: u64,
    pub read_format: u64,
    pub flags: u64,
    pub wakeup_events: u32,
    pub bp_type: u32,
    pub bp_addr: u64,
    pub bp_len: u64,
    pub branch_sample_type: u64,
    pub sample_regs_user: u64,
    pub sample_stack_user: u32,
    pub clockid: i32,
    pub sample_regs_intr: u64,
    pub aux_watermark: u32,
    pub sample_max_stack: u16,
    pub __reserved_2: u16,
}

impl Default for perf_event_attr {
    fn default() -> Self {
        let mut attr: perf_event_attr = unsafe { std::mem::zeroed() };
        attr.size = std::mem::size_of::<perf_event_attr>() as u32;
        attr
    }
}

const_assert_eq!(std::mem::size_of::<perf_event_attr>(), 112);
