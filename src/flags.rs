use std::env;

lazy_static! {
    static ref FLAGS: Flags = Flags::from_env();
}

/// Process-wide configuration, captured once at startup from the
/// environment and immutable afterwards.
#[derive(Clone)]
pub struct Flags {
    /// Don't listen for PTRACE_EVENT_EXIT events, to exercise the paths
    /// that handle kernels which fail to deliver them.
    pub disable_ptrace_exit_events: bool,
    /// Suppress warnings about environmental features outside our control.
    pub suppress_environment_warnings: bool,
    /// Force things that would otherwise fatally abort (e.g. tolerating
    /// IN_TX perf counts on buggy KVM hosts).
    pub force_things: bool,
    /// User override for CPU microarchitecture detection, e.g. when running
    /// under an emulator that reports unhelpful CPUID values.
    pub forced_uarch: Option<String>,
    /// Bind tracer and tracees to this CPU. Performance counter values are
    /// only comparable between runs when all tracees stay on one CPU.
    pub bind_cpu: Option<u32>,
}

impl Flags {
    pub fn get() -> &'static Flags {
        &FLAGS
    }

    fn from_env() -> Flags {
        Flags {
            disable_ptrace_exit_events: env::var_os("REWIND_NO_PTRACE_EXIT_EVENTS").is_some(),
            suppress_environment_warnings: env::var_os("REWIND_SUPPRESS_ENVIRONMENT_WARNINGS")
                .is_some(),
            force_things: env::var_os("REWIND_FORCE_THINGS").is_some(),
            forced_uarch: env::var("REWIND_FORCED_UARCH").ok(),
            bind_cpu: env::var("REWIND_BIND_CPU")
                .ok()
                .and_then(|v| v.parse::<u32>().ok()),
        }
    }
}
