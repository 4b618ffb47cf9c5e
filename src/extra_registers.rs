//! The extended register block: x87/SSE/AVX state in the CPU's native
//! XSAVE layout. The first 512 bytes are always an FXSAVE image, which is
//! also exactly what PTRACE_GETFPREGS/GETFPXREGS traffic in, so legacy
//! transports fill a prefix of the same buffer.

use crate::kernel_abi::SupportedArch;

/// Byte offset of the x87 control word inside an (F)XSAVE image.
const FCTRL_OFFSET: usize = 0;
/// Byte offset of MXCSR inside an (F)XSAVE image.
const MXCSR_OFFSET: usize = 24;

/// Size of the legacy FXSAVE region, present in all formats we handle.
pub const FXSAVE_SIZE: usize = 512;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Format {
    None,
    XSave,
}

#[derive(Clone)]
pub struct ExtraRegisters {
    format_: Format,
    arch_: SupportedArch,
    data_: Vec<u8>,
}

impl ExtraRegisters {
    pub fn new(arch: SupportedArch) -> ExtraRegisters {
        ExtraRegisters {
            format_: Format::None,
            arch_: arch,
            data_: Vec::new(),
        }
    }

    pub fn format(&self) -> Format {
        self.format_
    }

    pub fn arch(&self) -> SupportedArch {
        self.arch_
    }

    pub fn data(&self) -> Vec<u8> {
        self.data_.clone()
    }

    pub fn data_bytes(&self) -> &[u8] {
        self.data_.as_slice()
    }

    pub fn data_mut(&mut self) -> &mut Vec<u8> {
        &mut self.data_
    }

    pub fn data_size(&self) -> usize {
        self.data_.len()
    }

    pub fn empty(&self) -> bool {
        self.data_.is_empty()
    }

    /// Adopt raw register data in our own CPU's layout. Returns false when
    /// the data is too short to be an FXSAVE image.
    pub fn set_to_raw_data(&mut self, arch: SupportedArch, format: Format, data: &[u8]) -> bool {
        self.arch_ = arch;
        self.format_ = format;
        if format == Format::None {
            self.data_.clear();
            return true;
        }
        if data.len() < FXSAVE_SIZE {
            return false;
        }
        self.data_ = data.to_vec();
        true
    }

    /// Overlay a user_fpregs_struct (the FXSAVE prefix) onto this block,
    /// preserving any extended area beyond it.
    pub fn set_user_fpregs_struct(&mut self, _arch: SupportedArch, data: &[u8]) {
        let n = std::cmp::min(data.len(), FXSAVE_SIZE);
        if self.data_.len() < n {
            self.data_.resize(n, 0);
        }
        self.data_[..n].copy_from_slice(&data[..n]);
        self.format_ = Format::XSave;
    }

    /// Same overlay for the FPX (fxsr) flavor used by 32-bit tracees.
    pub fn set_user_fpxregs_struct(&mut self, data: &[u8]) {
        self.set_user_fpregs_struct(self.arch_, data);
    }

    /// Reset to the state a fresh execve produces: everything zero except
    /// the x87 control word and MXCSR, which the kernel initializes to
    /// their architectural defaults.
    pub fn reset(&mut self) {
        for b in self.data_.iter_mut() {
            *b = 0;
        }
        if self.data_.len() >= FXSAVE_SIZE {
            self.data_[FCTRL_OFFSET..FCTRL_OFFSET + 2].copy_from_slice(&0x037fu16.to_le_bytes());
            self.data_[MXCSR_OFFSET..MXCSR_OFFSET + 4]
                .copy_from_slice(&0x1f80u32.to_le_bytes());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reset_writes_architectural_defaults() {
        let mut e = ExtraRegisters::new(SupportedArch::X64);
        assert!(e.set_to_raw_data(SupportedArch::X64, Format::XSave, &[0xffu8; 832]));
        e.reset();
        assert_eq!(0x7f, e.data_bytes()[0]);
        assert_eq!(0x03, e.data_bytes()[1]);
        assert_eq!(&[0x80, 0x1f, 0, 0], &e.data_bytes()[24..28]);
        assert!(e.data_bytes()[28..].iter().all(|&b| b == 0));
    }

    #[test]
    fn raw_data_must_hold_an_fxsave_image() {
        let mut e = ExtraRegisters::new(SupportedArch::X64);
        assert!(!e.set_to_raw_data(SupportedArch::X64, Format::XSave, &[0u8; 100]));
        assert!(e.set_to_raw_data(SupportedArch::X64, Format::None, &[]));
        assert!(e.empty());
    }

    #[test]
    fn fpregs_overlay_preserves_extended_area() {
        let mut e = ExtraRegisters::new(SupportedArch::X64);
        assert!(e.set_to_raw_data(SupportedArch::X64, Format::XSave, &[0xaau8; 832]));
        e.set_user_fpregs_struct(SupportedArch::X64, &[0x55u8; FXSAVE_SIZE]);
        assert!(e.data_bytes()[..FXSAVE_SIZE].iter().all(|&b| b == 0x55));
        assert!(e.data_bytes()[FXSAVE_SIZE..].iter().all(|&b| b == 0xaa));
    }
}
