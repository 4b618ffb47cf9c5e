//! Per-task hardware performance counters. Ticks are retired conditional
//! branches (taken branches on AMD Zen), counted in userspace only. One
//! counter fd doubles as the interrupt source: it is programmed to overflow
//! after a requested number of ticks and routed to the tracer thread as
//! TIME_SLICE_SIGNAL.

use crate::{
    bindings::perf_event::*,
    flags::Flags,
    kernel_metadata::signal_name,
    kernel_supplement::{f_owner_ex, F_OWNER_TID, F_SETOWN_EX, F_SETSIG},
    scoped_fd::ScopedFd,
    task::Task,
    ticks::Ticks,
};
use libc::{c_ulong, fcntl, ioctl, pid_t, F_SETFL, O_ASYNC};
use nix::{
    errno::errno,
    poll::{poll, PollFd, PollFlags},
    unistd::read,
};
use raw_cpuid::CpuId;
use std::{
    io::{stderr, Write},
    mem::size_of,
    os::unix::io::RawFd,
};

/// Linux doesn't use SIGSTKFLT so we hope tracees don't either.
pub const TIME_SLICE_SIGNAL: i32 = libc::SIGSTKFLT;

const NUM_BRANCHES: u64 = 500;

/// When an interrupt is requested, at most this many further ticks may
/// elapse before it is delivered.
const SKID_SIZE: Ticks = 100;
const AMD_SKID_SIZE: Ticks = 1000;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TicksSemantics {
    RetiredConditionalBranches,
    TakenBranches,
}

/// The per-microarchitecture event selection. The raw event codes follow
/// the Intel/AMD performance monitoring event tables (umask << 8 | evtsel,
/// with the generic-PMU 0x51 prefix Intel tooling uses).
#[derive(Copy, Clone)]
struct PmuConfig {
    name: &'static str,
    ticks_event: u64,
    minus_ticks_event: u64,
    skid_size: Ticks,
    semantics: TicksSemantics,
}

fn intel_rcb(name: &'static str) -> PmuConfig {
    PmuConfig {
        name,
        ticks_event: 0x5101c4, // BR_INST_RETIRED.CONDITIONAL
        minus_ticks_event: 0,
        skid_size: SKID_SIZE,
        semantics: TicksSemantics::RetiredConditionalBranches,
    }
}

/// Identify the CPU and pick its event codes, or die describing the
/// environment. Full cpu-type list at http://sandpile.org/x86/cpuid.htm
fn pmu_config() -> PmuConfig {
    if let Some(forced) = &Flags::get().forced_uarch {
        let forced = forced.to_lowercase();
        // Accept any name we know, e.g. "skylake".
        let known: &[PmuConfig] = &[
            intel_rcb("Intel Sandy Bridge"),
            intel_rcb("Intel Ivy Bridge"),
            intel_rcb("Intel Haswell"),
            intel_rcb("Intel Broadwell"),
            intel_rcb("Intel Skylake"),
            intel_rcb("Intel Kabylake"),
            intel_rcb("Intel Cometlake"),
        ];
        for config in known {
            if config.name.to_lowercase().contains(&forced) {
                log!(crate::log::LogInfo, "Using forced uarch {}", config.name);
                return *config;
            }
        }
        clean_fatal!("Forced uarch {} isn't known", forced);
    }

    let cpuid = CpuId::new();
    let vendor = cpuid.get_vendor_info().unwrap().as_string().to_owned();
    if vendor != "GenuineIntel" && vendor != "AuthenticAMD" {
        clean_fatal!("Unknown CPU vendor '{}'", vendor);
    }

    let info = cpuid.get_feature_info().unwrap();
    let cpu_type: u32 = ((info.model_id() as u32) << 4)
        + ((info.family_id() as u32) << 8)
        + ((info.extended_model_id() as u32) << 16);
    match cpu_type {
        0x106A0 | 0x106E0 | 0x206E0 => intel_rcb("Intel Nehalem"),
        0x20650 | 0x206C0 | 0x206F0 => intel_rcb("Intel Westmere"),
        0x206A0 | 0x206D0 | 0x306E0 => intel_rcb("Intel Sandy Bridge"),
        0x306A0 => intel_rcb("Intel Ivy Bridge"),
        0x306C0 | 0x306F0 | 0x40650 | 0x40660 => intel_rcb("Intel Haswell"),
        0x306D0 | 0x40670 | 0x406F0 | 0x50660 => intel_rcb("Intel Broadwell"),
        0x406E0 | 0x50650 | 0x506E0 => intel_rcb("Intel Skylake"),
        0x30670 | 0x406C0 | 0x50670 => PmuConfig {
            name: "Intel Silvermont",
            ticks_event: 0x517ec4,
            minus_ticks_event: 0,
            skid_size: SKID_SIZE,
            semantics: TicksSemantics::RetiredConditionalBranches,
        },
        0x506F0 => PmuConfig {
            name: "Intel Goldmont",
            ticks_event: 0x517ec4,
            minus_ticks_event: 0,
            skid_size: SKID_SIZE,
            semantics: TicksSemantics::RetiredConditionalBranches,
        },
        0x806E0 | 0x906E0 => intel_rcb("Intel Kabylake"),
        0xA0660 => intel_rcb("Intel Cometlake"),
        0x30F00 => PmuConfig {
            name: "AMD Family 15h Revision 30h",
            ticks_event: 0xc4,
            minus_ticks_event: 0xc6,
            skid_size: 250,
            semantics: TicksSemantics::TakenBranches,
        },
        0x00F10 if info.extended_family_id() == 8 => {
            if !Flags::get().suppress_environment_warnings {
                write!(
                    stderr(),
                    "You have a Ryzen CPU. The Ryzen retired-conditional-branches\n\
                     hardware performance counter is not accurate enough to be\n\
                     reliable for record and replay.\n"
                )
                .unwrap();
            }
            PmuConfig {
                name: "AMD Ryzen",
                ticks_event: 0x5100d1,
                minus_ticks_event: 0,
                skid_size: AMD_SKID_SIZE,
                semantics: TicksSemantics::RetiredConditionalBranches,
            }
        }
        _ => {
            if vendor == "AuthenticAMD" {
                clean_fatal!("AMD CPU type {:#x} unknown", cpu_type);
            } else {
                clean_fatal!("Intel CPU type {:#x} unknown", cpu_type);
            }
        }
    }
}

struct PmuAttributes {
    config: PmuConfig,
    ticks_attr: perf_event_attr,
    cycles_attr: perf_event_attr,
    has_ioc_period_bug: bool,
    activate_useless_counter: bool,
}

lazy_static! {
    static ref PMU: PmuAttributes = probe_pmu();
}

fn new_perf_event_attr(type_id: u32, config: u64) -> perf_event_attr {
    let mut attr = perf_event_attr::default();
    attr.type_ = type_id;
    attr.config = config;
    // Our events must count userspace tracee code only.
    attr.flags = ATTR_EXCLUDE_KERNEL | ATTR_EXCLUDE_GUEST;
    attr
}

fn probe_pmu() -> PmuAttributes {
    let config = pmu_config();
    let ticks_attr = new_perf_event_attr(PERF_TYPE_RAW, config.ticks_event);
    let cycles_attr = new_perf_event_attr(PERF_TYPE_HARDWARE, PERF_COUNT_HW_CPU_CYCLES);

    let has_ioc_period_bug = detect_ioc_period_bug(ticks_attr);
    check_working_counter(ticks_attr);

    // Some CPUs turn the whole PMU off when no events remain scheduled,
    // which is very expensive to undo. A cycles counter we never read keeps
    // it awake on kernels with the IOC_PERIOD bug.
    let activate_useless_counter = has_ioc_period_bug;
    log!(
        crate::log::LogDebug,
        "Initialized PMU: {} (ioc_period_bug={})",
        config.name,
        has_ioc_period_bug
    );
    PmuAttributes {
        config,
        ticks_attr,
        cycles_attr,
        has_ioc_period_bug,
        activate_useless_counter,
    }
}

/// Pre-4.7 kernels can't change the period of a running counter with
/// PERF_EVENT_IOC_PERIOD; the new period silently doesn't take effect.
fn detect_ioc_period_bug(mut attr: perf_event_attr) -> bool {
    attr.sample_period = 0xffff_ffff;
    attr.flags |= ATTR_EXCLUDE_KERNEL;
    let fd = start_counter(0, -1, &mut attr);

    let new_period: u64 = 1;
    if perf_ioctl(&fd, PERF_EVENT_IOC_PERIOD, &new_period as *const u64) != 0 {
        fatal!("ioctl(PERF_EVENT_IOC_PERIOD) failed");
    }

    let mut poll_fds = [PollFd::new(fd.as_raw(), PollFlags::POLLIN)];
    poll(&mut poll_fds, 0).unwrap();
    poll_fds[0].revents().map_or(true, |r| r.is_empty())
}

fn check_working_counter(mut attr: perf_event_attr) {
    attr.sample_period = 0;
    let fd = start_counter(0, -1, &mut attr);
    do_branches();
    let events = read_counter(&fd);
    if events < NUM_BRANCHES {
        fatal!(
            "Got {} branch events, expected at least {}.\n\n\
             The hardware performance counter seems to not be working. Check\n\
             that hardware performance counters are working by running\n\
             `perf stat --event=r{:#x} true` and checking that it reports a\n\
             nonzero number of events; also check that no other software is\n\
             holding the counters.",
            events,
            NUM_BRANCHES,
            attr.config
        );
    }
}

/// Do NUM_BRANCHES conditional branches that can't be optimized out, so the
/// freshly-opened counter has something to count.
fn do_branches() {
    let mut accumulator: u32 = unsafe { libc::rand() as u32 }
        .wrapping_mul(2)
        .wrapping_add(1);
    for _ in 0..NUM_BRANCHES {
        if accumulator == 0 {
            break;
        }
        accumulator = accumulator.wrapping_mul(7).wrapping_add(2) & 0xffffff;
    }
    // Volatile sink so the loop above survives optimization.
    unsafe { std::ptr::write_volatile(&mut accumulator as *mut u32, accumulator) };
}

fn start_counter(tid: pid_t, group_fd: i32, attr: &mut perf_event_attr) -> ScopedFd {
    if group_fd == -1 {
        attr.flags |= ATTR_PINNED;
    } else {
        attr.flags &= !ATTR_PINNED;
    }

    let fd = unsafe {
        libc::syscall(
            libc::SYS_perf_event_open,
            attr as *mut perf_event_attr,
            tid,
            -1,
            group_fd,
            0,
        ) as RawFd
    };
    if fd <= 0 {
        if errno() == libc::EACCES {
            fatal!(
                "Permission denied to use 'perf_event_open'; are hardware perf\n\
                 events available? See /proc/sys/kernel/perf_event_paranoid."
            );
        }
        if errno() == libc::ENOENT {
            fatal!(
                "Unable to open performance counter with 'perf_event_open';\n\
                 are hardware perf events available?"
            );
        }
        fatal!("Failed to initialize counter");
    }
    ScopedFd::from_raw(fd)
}

fn read_counter(fd: &ScopedFd) -> u64 {
    let mut buf = [0u8; size_of::<u64>()];
    match read(fd.as_raw(), &mut buf) {
        Ok(nread) if nread == buf.len() => u64::from_le_bytes(buf),
        _ => fatal!("Could not read perf counter"),
    }
}

fn perf_ioctl(fd: &ScopedFd, request: c_ulong, arg: *const u64) -> i32 {
    unsafe { ioctl(fd.as_raw(), request, arg) }
}

fn perf_ioctl_null(fd: &ScopedFd, request: c_ulong) -> i32 {
    unsafe { ioctl(fd.as_raw(), request, 0) }
}

fn make_counter_async(fd: &ScopedFd, signal: i32) {
    if unsafe {
        fcntl(fd.as_raw(), F_SETFL, O_ASYNC) != 0 || fcntl(fd.as_raw(), F_SETSIG, signal) != 0
    } {
        fatal!(
            "Failed to make ticks counter ASYNC with {}",
            signal_name(signal)
        );
    }
}

pub struct PerfCounters {
    tid: pid_t,
    // Overflow of this fd generates TIME_SLICE_SIGNAL. On CPUs whose ticks
    // event overcounts (AMD 15h), a second grouped counter is subtracted.
    fd_ticks_interrupt: ScopedFd,
    fd_minus_ticks_measure: ScopedFd,
    fd_useless_counter: ScopedFd,
    // Only valid while `counting`.
    counting_period: Ticks,
    started: bool,
    counting: bool,
}

impl PerfCounters {
    pub fn new(tid: pid_t) -> PerfCounters {
        PerfCounters {
            tid,
            fd_ticks_interrupt: ScopedFd::new(),
            fd_minus_ticks_measure: ScopedFd::new(),
            fd_useless_counter: ScopedFd::new(),
            counting_period: 0,
            started: false,
            counting: false,
        }
    }

    pub fn ticks_semantics() -> TicksSemantics {
        PMU.config.semantics
    }

    pub fn set_tid(&mut self, tid: pid_t) {
        self.stop();
        self.tid = tid;
    }

    /// Reset all counters to 0 and program an interrupt after
    /// `ticks_period` ticks (the hardware may trigger somewhat later, up to
    /// the skid size). Must be called while the task is stopped, before it
    /// is resumed. A period of zero means don't interrupt at all.
    pub fn reset(&mut self, ticks_period: Ticks) {
        let mut period = ticks_period;
        if period == 0 && !PMU.has_ioc_period_bug {
            // A counter can't be switched between sampling and
            // non-sampling with IOC_PERIOD, so use a huge period instead.
            period = 1 << 60;
        }

        if !self.started || PMU.has_ioc_period_bug {
            self.stop();
            log!(
                crate::log::LogDebug,
                "Recreating counters for {} with period {}",
                self.tid,
                period
            );
            let mut attr = PMU.ticks_attr;
            attr.sample_period = period;
            self.fd_ticks_interrupt = start_counter(self.tid, -1, &mut attr);
            if PMU.config.minus_ticks_event != 0 {
                let mut minus_attr =
                    new_perf_event_attr(PERF_TYPE_RAW, PMU.config.minus_ticks_event);
                self.fd_minus_ticks_measure =
                    start_counter(self.tid, self.fd_ticks_interrupt.as_raw(), &mut minus_attr);
            }
            if PMU.activate_useless_counter && !self.fd_useless_counter.is_open() {
                // Deliberately not in the same group: it must stay
                // scheduled at all times.
                let mut cycles_attr = PMU.cycles_attr;
                self.fd_useless_counter = start_counter(self.tid, -1, &mut cycles_attr);
            }

            let own = f_owner_ex {
                type_: F_OWNER_TID,
                pid: self.tid,
            };
            if unsafe {
                fcntl(
                    self.fd_ticks_interrupt.as_raw(),
                    F_SETOWN_EX,
                    &own as *const f_owner_ex,
                )
            } != 0
            {
                fatal!("Failed to SETOWN_EX ticks event fd");
            }
            make_counter_async(&self.fd_ticks_interrupt, TIME_SLICE_SIGNAL);
        } else {
            log!(
                crate::log::LogDebug,
                "Resetting counters for {} with period {}",
                self.tid,
                period
            );
            if perf_ioctl_null(&self.fd_ticks_interrupt, PERF_EVENT_IOC_RESET) != 0 {
                fatal!("ioctl(PERF_EVENT_IOC_RESET) failed");
            }
            if perf_ioctl(&self.fd_ticks_interrupt, PERF_EVENT_IOC_PERIOD, &period) != 0 {
                fatal!("ioctl(PERF_EVENT_IOC_PERIOD) failed with period {}", period);
            }
            if perf_ioctl_null(&self.fd_ticks_interrupt, PERF_EVENT_IOC_ENABLE) != 0 {
                fatal!("ioctl(PERF_EVENT_IOC_ENABLE) failed");
            }
            if self.fd_minus_ticks_measure.is_open() {
                if perf_ioctl_null(&self.fd_minus_ticks_measure, PERF_EVENT_IOC_RESET) != 0 {
                    fatal!("ioctl(PERF_EVENT_IOC_RESET) failed");
                }
                if perf_ioctl_null(&self.fd_minus_ticks_measure, PERF_EVENT_IOC_ENABLE) != 0 {
                    fatal!("ioctl(PERF_EVENT_IOC_ENABLE) failed");
                }
            }
        }

        self.started = true;
        self.counting = true;
        self.counting_period = period;
    }

    /// Close the counter fds. They are reopened on the next reset().
    pub fn stop(&mut self) {
        if !self.started {
            return;
        }
        self.started = false;
        self.fd_ticks_interrupt.close();
        self.fd_minus_ticks_measure.close();
        self.fd_useless_counter.close();
    }

    /// Suspend counting until the next reset, so tracer-induced work can't
    /// pollute the count. May close the fds if the kernel requires it.
    pub fn stop_counting(&mut self) {
        if !self.counting {
            return;
        }
        self.counting = false;
        if PMU.has_ioc_period_bug {
            self.stop();
        } else {
            perf_ioctl_null(&self.fd_ticks_interrupt, PERF_EVENT_IOC_DISABLE);
            if self.fd_minus_ticks_measure.is_open() {
                perf_ioctl_null(&self.fd_minus_ticks_measure, PERF_EVENT_IOC_DISABLE);
            }
        }
    }

    /// Read the current tick count. `t` is for diagnostics.
    pub fn read_ticks(&self, t: &Task) -> Ticks {
        if !self.started || !self.counting {
            return 0;
        }

        let skid = if t.session().is_recording() {
            Self::recording_skid_size()
        } else {
            Self::skid_size()
        };
        let adjusted_period = self.counting_period + skid;

        let mut val = read_counter(&self.fd_ticks_interrupt);
        if self.fd_minus_ticks_measure.is_open() {
            val -= read_counter(&self.fd_minus_ticks_measure);
        }
        ed_assert!(
            t,
            self.counting_period == 0 || val <= adjusted_period,
            "Detected {} ticks, expected no more than {}",
            val,
            adjusted_period
        );
        val
    }

    /// The fd that generates the ticks-counter signal, for synthesized
    /// siginfo.
    pub fn ticks_interrupt_fd(&self) -> RawFd {
        self.fd_ticks_interrupt.as_raw()
    }

    pub fn skid_size() -> Ticks {
        PMU.config.skid_size
    }

    /// More skid shows up in practice during recording, in particular
    /// around asynchronously delivered signals.
    pub fn recording_skid_size() -> Ticks {
        Self::skid_size() * 5
    }
}

impl Drop for PerfCounters {
    fn drop(&mut self) {
        self.stop()
    }
}
