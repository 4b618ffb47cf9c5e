//! The per-task tracee control plane of a deterministic record-and-replay
//! debugger for native Linux processes.
//!
//! A `Task` represents one tracee thread. It mediates every ptrace
//! interaction with the kernel, drives the thread through its
//! syscall/signal/event state machine, manages the thread's view of shared
//! resources (address space, fd table, thread group) and bootstraps new
//! tasks: the initial spawn, `clone`/`fork` into the trace, and `execve`
//! transitions.

#![allow(clippy::needless_return)]

#[macro_use]
extern crate lazy_static;
#[macro_use]
extern crate bitflags;
#[macro_use]
extern crate memoffset;
#[macro_use]
extern crate static_assertions;

#[macro_use]
pub mod log;

pub mod address_space;
pub mod bindings;
pub mod extra_registers;
pub mod fd_table;
pub mod file_monitor;
pub mod flags;
pub mod kernel_abi;
pub mod kernel_metadata;
pub mod kernel_supplement;
pub mod perf_counters;
pub mod preload_interface;
pub mod registers;
pub mod remote_code_ptr;
pub mod remote_ptr;
pub mod remote_syscalls;
pub mod scoped_fd;
pub mod seccomp_bpf;
pub mod session;
pub mod sig;
pub mod task;
pub mod task_set;
pub mod taskish_uid;
pub mod thread_group;
pub mod ticks;
pub mod util;
pub mod wait_status;

/// Tracees can write data to this special fd that they want verified across
/// record/replay. To simplify things it is a valid fd opened to /dev/null
/// during recording. Tracees may close it or dup() something over it; if
/// that happens it loses its magical properties.
pub const REWIND_MAGIC_SAVE_DATA_FD: i32 = 999;

/// This fd gives tracees access to the original root directory after a
/// chroot(). Tracee close()es of this fd are silently ignored and tracee
/// dup()s to it fail with EBADF. Set up during both recording and replay.
pub const REWIND_RESERVED_ROOT_DIR_FD: i32 = 1000;
