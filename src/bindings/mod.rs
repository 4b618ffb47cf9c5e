//! Handwritten kernel ABI the distributions' libc doesn't export: ptrace
//! requests beyond the portable set, the perf_event_open attribute block,
//! the raw siginfo layout and a few user-area structs.

pub mod kernel;
pub mod perf_event;
pub mod ptrace;
pub mod signal;
