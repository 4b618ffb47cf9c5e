use super::memory_range::MemoryRange;
use crate::remote_ptr::{RemotePtr, Void};
use nix::sys::mman::{MapFlags, ProtFlags};
use std::{
    ffi::{OsStr, OsString},
    fmt::{self, Display, Formatter},
    ops::Deref,
};

/// A mapping as the kernel would describe it in /proc/<pid>/maps: address
/// range, protection, flags and backing file identity.
#[derive(Clone, Debug)]
pub struct KernelMapping {
    range: MemoryRange,
    fsname: OsString,
    device: u64,
    inode: u64,
    prot: ProtFlags,
    flags: MapFlags,
    file_offset_bytes: u64,
}

pub const NO_DEVICE: u64 = 0;
pub const NO_INODE: u64 = 0;

impl KernelMapping {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        start: RemotePtr<Void>,
        end: RemotePtr<Void>,
        fsname: &OsStr,
        device: u64,
        inode: u64,
        prot: ProtFlags,
        flags: MapFlags,
        file_offset_bytes: u64,
    ) -> KernelMapping {
        KernelMapping {
            range: MemoryRange::from_range(start, end),
            fsname: fsname.to_os_string(),
            device,
            inode,
            prot,
            flags,
            file_offset_bytes,
        }
    }

    pub fn fsname(&self) -> &OsStr {
        &self.fsname
    }

    pub fn device(&self) -> u64 {
        self.device
    }

    pub fn inode(&self) -> u64 {
        self.inode
    }

    pub fn prot(&self) -> ProtFlags {
        self.prot
    }

    pub fn flags(&self) -> MapFlags {
        self.flags
    }

    pub fn file_offset_bytes(&self) -> u64 {
        self.file_offset_bytes
    }

    pub fn is_heap(&self) -> bool {
        self.fsname == *"[heap]"
    }

    pub fn is_stack(&self) -> bool {
        self.fsname.to_string_lossy().starts_with("[stack")
    }

    pub fn is_vdso(&self) -> bool {
        self.fsname == *"[vdso]"
    }

    pub fn is_real_device(&self) -> bool {
        self.device != NO_DEVICE
    }

    /// A copy of this mapping restricted to `range`, with the file offset
    /// advanced to match.
    pub fn subrange(&self, range: MemoryRange) -> KernelMapping {
        debug_assert!(self.range.contains_range(&range));
        let offset_delta = (range.start() - self.range.start()) as u64;
        KernelMapping {
            range,
            fsname: self.fsname.clone(),
            device: self.device,
            inode: self.inode,
            prot: self.prot,
            flags: self.flags,
            file_offset_bytes: self.file_offset_bytes + offset_delta,
        }
    }

    pub fn set_prot(&mut self, prot: ProtFlags) {
        self.prot = prot;
    }
}

impl Deref for KernelMapping {
    type Target = MemoryRange;

    fn deref(&self) -> &Self::Target {
        &self.range
    }
}

impl Display for KernelMapping {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {:?} {:?} {:?} off:{:#x}",
            self.range, self.fsname, self.prot, self.flags, self.file_offset_bytes
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subrange_advances_file_offset() {
        let km = KernelMapping::new(
            RemotePtr::new(0x1000),
            RemotePtr::new(0x3000),
            OsStr::new("/lib/libfoo.so"),
            8,
            42,
            ProtFlags::PROT_READ,
            MapFlags::MAP_PRIVATE,
            0x2000,
        );
        let sub = km.subrange(MemoryRange::new_range(RemotePtr::new(0x2000), 0x1000));
        assert_eq!(0x3000, sub.file_offset_bytes());
        assert_eq!(0x1000, sub.size());
        assert_eq!(km.fsname(), sub.fsname());
    }

    #[test]
    fn special_names() {
        let heap = KernelMapping::new(
            RemotePtr::new(0x1000),
            RemotePtr::new(0x2000),
            OsStr::new("[heap]"),
            NO_DEVICE,
            NO_INODE,
            ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
            MapFlags::MAP_PRIVATE | MapFlags::MAP_ANONYMOUS,
            0,
        );
        assert!(heap.is_heap());
        assert!(!heap.is_stack());
        assert!(!heap.is_real_device());
    }
}
