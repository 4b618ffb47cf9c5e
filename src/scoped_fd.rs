use nix::{
    fcntl::{open, OFlag},
    sys::stat::Mode,
    unistd::close,
    NixPath,
};
use std::os::unix::io::RawFd;

/// An owned file descriptor, closed on drop. A negative fd means "not open".
pub struct ScopedFd {
    fd: RawFd,
}

impl ScopedFd {
    pub fn new() -> ScopedFd {
        ScopedFd { fd: -1 }
    }

    pub fn from_raw(fd: RawFd) -> ScopedFd {
        ScopedFd { fd }
    }

    pub fn open_path<P: ?Sized + NixPath>(path: &P, flags: OFlag) -> ScopedFd {
        let fd = open(path, flags, Mode::empty()).unwrap_or(-1);
        ScopedFd { fd }
    }

    pub fn is_open(&self) -> bool {
        self.fd >= 0
    }

    pub fn as_raw(&self) -> RawFd {
        self.fd
    }

    pub fn close(&mut self) {
        if self.fd >= 0 {
            // Ignore errors; the fd may have been closed behind our back.
            close(self.fd).unwrap_or(());
        }
        self.fd = -1;
    }

    /// Relinquish ownership of the fd without closing it.
    pub fn extract(&mut self) -> RawFd {
        let fd = self.fd;
        self.fd = -1;
        fd
    }
}

impl Default for ScopedFd {
    fn default() -> Self {
        ScopedFd::new()
    }
}

impl Drop for ScopedFd {
    fn drop(&mut self) {
        self.close()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn closed_by_default() {
        let fd = ScopedFd::new();
        assert!(!fd.is_open());
        assert_eq!(-1, fd.as_raw());
    }

    #[test]
    fn extract_disowns() {
        let mut fd = ScopedFd::open_path("/dev/null", OFlag::O_RDONLY);
        assert!(fd.is_open());
        let raw = fd.extract();
        assert!(!fd.is_open());
        nix::unistd::close(raw).unwrap();
    }
}
