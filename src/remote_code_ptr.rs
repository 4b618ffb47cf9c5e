use crate::{
    kernel_abi::{syscall_instruction_length, SupportedArch},
    remote_ptr::RemotePtr,
};
use std::{
    fmt::{self, Debug, Display, Formatter},
    ops::{Add, Sub},
};

/// The length of a software breakpoint instruction (int3).
pub const BKPT_INSTRUCTION_LENGTH: usize = 1;
pub const BKPT_INSTRUCTION: u8 = 0xcc;

/// A pointer into tracee code. Kept distinct from `RemotePtr` so that
/// breakpoint- and syscall-instruction arithmetic can't be applied to data
/// pointers by accident.
#[derive(Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct RemoteCodePtr {
    ptr: usize,
}

impl RemoteCodePtr {
    pub fn new(ptr: usize) -> RemoteCodePtr {
        RemoteCodePtr { ptr }
    }

    pub fn null() -> RemoteCodePtr {
        Self::new(0)
    }

    pub fn is_null(self) -> bool {
        self.ptr == 0
    }

    pub fn as_usize(self) -> usize {
        self.ptr
    }

    /// The value as it appears in the ip register.
    pub fn register_value(self) -> usize {
        self.ptr
    }

    pub fn to_data_ptr<T>(self) -> RemotePtr<T> {
        RemotePtr::new(self.ptr)
    }

    pub fn increment_by_bkpt_insn_length(self, _arch: SupportedArch) -> RemoteCodePtr {
        Self::new(self.ptr + BKPT_INSTRUCTION_LENGTH)
    }

    pub fn decrement_by_bkpt_insn_length(self, _arch: SupportedArch) -> RemoteCodePtr {
        Self::new(self.ptr - BKPT_INSTRUCTION_LENGTH)
    }

    pub fn increment_by_syscall_insn_length(self, arch: SupportedArch) -> RemoteCodePtr {
        Self::new(self.ptr + syscall_instruction_length(arch))
    }

    pub fn decrement_by_syscall_insn_length(self, arch: SupportedArch) -> RemoteCodePtr {
        Self::new(self.ptr - syscall_instruction_length(arch))
    }
}

impl From<usize> for RemoteCodePtr {
    fn from(ptr: usize) -> Self {
        Self::new(ptr)
    }
}

impl<T> From<RemotePtr<T>> for RemoteCodePtr {
    fn from(ptr: RemotePtr<T>) -> Self {
        Self::new(ptr.as_usize())
    }
}

impl Add<usize> for RemoteCodePtr {
    type Output = Self;

    fn add(self, delta: usize) -> Self {
        Self::new(self.ptr + delta)
    }
}

impl Sub<usize> for RemoteCodePtr {
    type Output = Self;

    fn sub(self, delta: usize) -> Self {
        Self::new(self.ptr - delta)
    }
}

impl Display for RemoteCodePtr {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.ptr)
    }
}

impl Debug for RemoteCodePtr {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.ptr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn breakpoint_arithmetic_round_trips() {
        let p = RemoteCodePtr::new(0x1000);
        let q = p.increment_by_bkpt_insn_length(SupportedArch::X64);
        assert_eq!(0x1001, q.as_usize());
        assert_eq!(p, q.decrement_by_bkpt_insn_length(SupportedArch::X64));
    }

    #[test]
    fn syscall_arithmetic() {
        let p = RemoteCodePtr::new(0x1000);
        assert_eq!(
            0x1002,
            p.increment_by_syscall_insn_length(SupportedArch::X86).as_usize()
        );
        assert_eq!(
            0x0ffe,
            p.decrement_by_syscall_insn_length(SupportedArch::X64).as_usize()
        );
    }
}
