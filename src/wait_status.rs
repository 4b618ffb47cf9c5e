use crate::{
    bindings::ptrace::PTRACE_EVENT_STOP,
    kernel_metadata::{ptrace_event_name, signal_name},
    sig,
    sig::Sig,
};
use libc::{SIGTRAP, WEXITSTATUS, WIFEXITED, WIFSIGNALED, WIFSTOPPED, WSTOPSIG, WTERMSIG};
use std::{
    convert::TryFrom,
    fmt::{self, Display, Formatter},
};

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum WaitType {
    /// Task exited normally.
    Exit,
    /// Task exited due to a fatal signal.
    FatalSignal,
    /// Task is in a signal-delivery-stop.
    SignalStop,
    /// Task is in a group-stop. Requires PTRACE_SEIZE to be distinguishable
    /// from a signal-stop.
    GroupStop,
    /// Task is in a syscall-stop flagged by PTRACE_O_TRACESYSGOOD.
    SyscallStop,
    /// Task is in a PTRACE_EVENT stop other than PTRACE_EVENT_STOP.
    PtraceEvent,
}

/// A decoded waitpid status word.
#[derive(Copy, Clone, Eq, PartialEq)]
pub struct WaitStatus {
    status: i32,
}

impl WaitStatus {
    pub fn new(status: i32) -> WaitStatus {
        WaitStatus { status }
    }

    pub fn get(&self) -> i32 {
        self.status
    }

    pub fn wait_type(&self) -> WaitType {
        if self.exit_code().is_some() {
            return WaitType::Exit;
        }
        if self.fatal_sig().is_some() {
            return WaitType::FatalSignal;
        }
        if self.stop_sig().is_some() {
            return WaitType::SignalStop;
        }
        if self.group_stop_sig().is_some() {
            return WaitType::GroupStop;
        }
        if self.is_syscall() {
            return WaitType::SyscallStop;
        }
        if self.ptrace_event().is_some() {
            return WaitType::PtraceEvent;
        }
        fatal!("Status {:#x} not understood", self.status);
    }

    /// Exit code when the task exited normally, otherwise None.
    pub fn exit_code(&self) -> Option<i32> {
        if unsafe { WIFEXITED(self.status) } {
            Some(unsafe { WEXITSTATUS(self.status) })
        } else {
            None
        }
    }

    pub fn fatal_sig(&self) -> Option<i32> {
        if !unsafe { WIFSIGNALED(self.status) } {
            return None;
        }
        let termsig = unsafe { WTERMSIG(self.status) };
        if termsig > 0 {
            Some(termsig)
        } else {
            None
        }
    }

    /// Signal-delivery-stop signal, otherwise None. A zero stop signal
    /// (rare, observed via PTRACE_INTERRUPT) reads as SIGSTOP.
    pub fn stop_sig(&self) -> Option<Sig> {
        // Any nonzero event byte means a ptrace event or (under SEIZE) a
        // group-stop, not a signal-delivery-stop.
        if !unsafe { WIFSTOPPED(self.status) } || (self.status >> 16) & 0xff != 0 {
            return None;
        }
        let mut s = unsafe { WSTOPSIG(self.status) };
        if s == SIGTRAP | 0x80 {
            // A syscall-stop under PTRACE_O_TRACESYSGOOD.
            return None;
        }
        s &= !0x80;
        if s == 0 {
            return Some(sig::SIGSTOP);
        }
        Sig::try_from(s).ok()
    }

    /// Group-stop signal, otherwise None.
    pub fn group_stop_sig(&self) -> Option<Sig> {
        if !unsafe { WIFSTOPPED(self.status) }
            || (self.status >> 16) & 0xff != PTRACE_EVENT_STOP as i32
        {
            return None;
        }
        let s = unsafe { WSTOPSIG(self.status) } & !0x80;
        if s == 0 {
            return Some(sig::SIGSTOP);
        }
        Sig::try_from(s).ok()
    }

    pub fn is_syscall(&self) -> bool {
        if self.ptrace_event().is_some() || !unsafe { WIFSTOPPED(self.status) } {
            return false;
        }
        unsafe { WSTOPSIG(self.status) == SIGTRAP | 0x80 }
    }

    /// The ptrace event, excluding PTRACE_EVENT_STOP which is reported as a
    /// group-stop.
    pub fn ptrace_event(&self) -> Option<u32> {
        let event = ((self.status >> 16) & 0xff) as u32;
        if event == PTRACE_EVENT_STOP || event == 0 {
            None
        } else {
            Some(event)
        }
    }

    pub fn is_ptrace_event(&self, event: u32) -> bool {
        self.ptrace_event() == Some(event)
    }

    /// The signal for any stopped type; None for exits and fatal signals.
    pub fn ptrace_signal(&self) -> Option<i32> {
        if unsafe { WIFSTOPPED(self.status) } {
            Some(unsafe { WSTOPSIG(self.status) } & 0x7f)
        } else {
            None
        }
    }

    pub fn for_exit_code(code: i32) -> WaitStatus {
        debug_assert!((0..0x100).contains(&code));
        WaitStatus { status: code << 8 }
    }

    pub fn for_fatal_sig(sig: Sig) -> WaitStatus {
        WaitStatus {
            status: sig.as_raw(),
        }
    }

    pub fn for_stop_sig(sig: Sig) -> WaitStatus {
        WaitStatus {
            status: (sig.as_raw() << 8) | 0x7f,
        }
    }

    pub fn for_group_sig(sig: Sig) -> WaitStatus {
        WaitStatus {
            status: ((PTRACE_EVENT_STOP as i32) << 16) | (sig.as_raw() << 8) | 0x7f,
        }
    }

    pub fn for_ptrace_event(ptrace_event: u32) -> WaitStatus {
        debug_assert!((1..0x100).contains(&ptrace_event));
        WaitStatus {
            status: ((ptrace_event as i32) << 16) | (SIGTRAP << 8) | 0x7f,
        }
    }
}

impl Default for WaitStatus {
    fn default() -> Self {
        WaitStatus::new(0)
    }
}

impl Display for WaitStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.status)?;
        match self.wait_type() {
            WaitType::Exit => write!(f, " (EXIT-{})", self.exit_code().unwrap()),
            WaitType::FatalSignal => {
                write!(f, " (FATAL-{})", signal_name(self.fatal_sig().unwrap()))
            }
            WaitType::SignalStop => write!(f, " (STOP-{})", self.stop_sig().unwrap()),
            WaitType::GroupStop => {
                write!(f, " (GROUP-STOP-{})", self.group_stop_sig().unwrap())
            }
            WaitType::SyscallStop => write!(f, " (SYSCALL)"),
            WaitType::PtraceEvent => {
                write!(f, " ({})", ptrace_event_name(self.ptrace_event().unwrap()))
            }
        }
    }
}

impl fmt::Debug for WaitStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bindings::ptrace::PTRACE_EVENT_EXIT;

    #[test]
    fn exit_round_trip() {
        let st = WaitStatus::for_exit_code(0);
        assert_eq!(WaitType::Exit, st.wait_type());
        assert_eq!(Some(0), st.exit_code());
        assert_eq!(None, st.ptrace_event());
        assert_eq!(None, st.stop_sig());
    }

    #[test]
    fn stop_sig_round_trip() {
        let st = WaitStatus::for_stop_sig(sig::SIGSTOP);
        assert_eq!(WaitType::SignalStop, st.wait_type());
        assert_eq!(Some(sig::SIGSTOP), st.stop_sig());
        assert!(!st.is_syscall());
    }

    #[test]
    fn group_stop_is_not_signal_stop() {
        let st = WaitStatus::for_group_sig(sig::SIGSTOP);
        assert_eq!(WaitType::GroupStop, st.wait_type());
        assert_eq!(None, st.stop_sig());
        assert_eq!(Some(sig::SIGSTOP), st.group_stop_sig());
        // PTRACE_EVENT_STOP must not read as a ptrace event.
        assert_eq!(None, st.ptrace_event());
    }

    #[test]
    fn ptrace_event_round_trip() {
        let st = WaitStatus::for_ptrace_event(PTRACE_EVENT_EXIT);
        assert_eq!(WaitType::PtraceEvent, st.wait_type());
        assert_eq!(Some(PTRACE_EVENT_EXIT), st.ptrace_event());
        assert!(st.is_ptrace_event(PTRACE_EVENT_EXIT));
        assert_eq!(None, st.stop_sig());
    }

    #[test]
    fn syscall_stop_decoding() {
        // TRACESYSGOOD sets bit 7 of the stop signal.
        let st = WaitStatus::new(((SIGTRAP | 0x80) << 8) | 0x7f);
        assert_eq!(WaitType::SyscallStop, st.wait_type());
        assert!(st.is_syscall());
        assert_eq!(None, st.stop_sig());
        assert_eq!(Some(SIGTRAP), st.ptrace_signal());
    }

    #[test]
    fn fatal_signal_decoding() {
        let st = WaitStatus::for_fatal_sig(sig::SIGKILL);
        assert_eq!(WaitType::FatalSignal, st.wait_type());
        assert_eq!(Some(libc::SIGKILL), st.fatal_sig());
    }
}
