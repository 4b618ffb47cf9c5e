//! Builds the seccomp-bpf program installed in the initial tracee: by
//! default every syscall generates a PTRACE_EVENT_SECCOMP stop; syscalls
//! issued from the buffered-syscall call sites are allowed straight
//! through.

use crate::{
    bindings::kernel::seccomp_data,
    kernel_supplement::{SECCOMP_RET_ALLOW, SECCOMP_RET_DATA, SECCOMP_RET_TRACE},
    remote_code_ptr::RemoteCodePtr,
};
use libc::{sock_filter, BPF_ABS, BPF_JEQ, BPF_JMP, BPF_K, BPF_LD, BPF_RET, BPF_W};
use std::convert::TryInto;

fn bpf_stmt(code: u16, k: u32) -> sock_filter {
    sock_filter {
        code,
        jt: 0,
        jf: 0,
        k,
    }
}

fn bpf_jump(code: u16, k: u32, jt: u8, jf: u8) -> sock_filter {
    sock_filter { code, jt, jf, k }
}

#[derive(Clone, Default)]
pub struct SeccompFilter {
    pub filters: Vec<sock_filter>,
}

impl SeccompFilter {
    pub fn new() -> SeccompFilter {
        SeccompFilter {
            filters: Vec::new(),
        }
    }

    pub fn allow(&mut self) {
        self.filters
            .push(bpf_stmt((BPF_RET + BPF_K) as u16, SECCOMP_RET_ALLOW));
    }

    pub fn trace(&mut self) {
        self.filters.push(bpf_stmt(
            (BPF_RET + BPF_K) as u16,
            SECCOMP_RET_TRACE | SECCOMP_RET_DATA,
        ));
    }

    pub fn allow_syscalls_from_callsite(&mut self, ip: RemoteCodePtr) {
        let inst_ptr = offset_of!(seccomp_data, instruction_pointer) as u32;
        let v: u32 = ip.register_value().try_into().unwrap();
        self.filters
            .push(bpf_stmt((BPF_LD + BPF_W + BPF_ABS) as u16, inst_ptr));
        self.filters
            .push(bpf_jump((BPF_JMP + BPF_JEQ + BPF_K) as u16, v, 0, 1));
        self.allow();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trace_everything_filter() {
        let mut f = SeccompFilter::new();
        f.trace();
        assert_eq!(1, f.filters.len());
        assert_eq!((BPF_RET + BPF_K) as u16, f.filters[0].code);
        assert_eq!(SECCOMP_RET_TRACE | SECCOMP_RET_DATA, f.filters[0].k);
    }

    #[test]
    fn callsite_allowance_precedes_trace() {
        let mut f = SeccompFilter::new();
        f.allow_syscalls_from_callsite(RemoteCodePtr::new(0x7000_0000));
        f.trace();
        assert_eq!(4, f.filters.len());
        // load ip, compare, allow, fall through to trace
        assert_eq!((BPF_LD + BPF_W + BPF_ABS) as u16, f.filters[0].code);
        assert_eq!(0x7000_0000, f.filters[1].k);
        assert_eq!(SECCOMP_RET_ALLOW, f.filters[2].k);
    }
}
