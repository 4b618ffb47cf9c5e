//! The address space shared by all tasks created with CLONE_VM. The
//! control plane notifies it of map/unmap/protect/advise syscall exits and
//! of every write into tracee memory; it owns the software breakpoints,
//! the hardware watchpoint bookkeeping and the per-VM /proc/<tid>/mem fd.

pub mod kernel_mapping;
pub mod memory_range;

use crate::{
    remote_code_ptr::{RemoteCodePtr, BKPT_INSTRUCTION},
    remote_ptr::{RemotePtr, Void},
    scoped_fd::ScopedFd,
    session::{SessionSharedPtr, SessionSharedWeakPtr},
    task::{Task, WriteFlags},
    task_set::TaskSet,
    taskish_uid::AddressSpaceUid,
};
use kernel_mapping::KernelMapping;
use libc::pid_t;
use memory_range::MemoryRange;
use nix::sys::mman::{MapFlags, ProtFlags};
use std::{
    cell::{Ref, RefCell, RefMut},
    collections::{BTreeMap, HashMap},
    ffi::{OsStr, OsString},
    rc::Rc,
};

pub type AddressSpaceSharedPtr = Rc<AddressSpace>;
pub type DebugRegs = Vec<WatchConfig>;

const NUM_X86_WATCHPOINTS: usize = 4;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum BreakpointType {
    BkptNone,
    /// A trap for internal purposes, e.g. stepping over emulated syscalls.
    BkptInternal,
    /// A trap set on behalf of a debugger user.
    BkptUser,
}

/// These values match the encoding of the type field in DR7.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(usize)]
pub enum WatchType {
    WatchExec = 0x00,
    WatchWrite = 0x01,
    WatchReadWrite = 0x03,
}

/// Bits of the debug status register (DR6).
pub const DS_WATCHPOINT_ANY: usize = 0xf;
pub const DS_SINGLESTEP: usize = 1 << 14;

#[derive(Copy, Clone, Debug)]
pub struct WatchConfig {
    pub addr: RemotePtr<Void>,
    pub num_bytes: usize,
    pub type_: WatchType,
}

impl WatchConfig {
    pub fn new(addr: RemotePtr<Void>, num_bytes: usize, type_: WatchType) -> WatchConfig {
        WatchConfig {
            addr,
            num_bytes,
            type_,
        }
    }
}

bitflags! {
    pub struct MappingFlags: u32 {
        /// This mapping is a task's syscall buffer.
        const IS_SYSCALLBUF = 0x1;
        /// This mapping is a task's scratch area.
        const IS_SCRATCH = 0x2;
        /// This mapping holds the preload thread-locals block.
        const IS_THREAD_LOCALS = 0x4;
    }
}

/// One mapping in the VM, with an optional tracer-local view of the same
/// memory for shared mappings.
#[derive(Clone)]
pub struct Mapping {
    pub map: KernelMapping,
    pub flags: MappingFlags,
    pub local_addr: Option<*mut u8>,
}

impl Mapping {
    pub fn new(map: KernelMapping) -> Mapping {
        Mapping {
            map,
            flags: MappingFlags::empty(),
            local_addr: None,
        }
    }
}

struct Breakpoint {
    internal_count: u32,
    user_count: u32,
    /// The byte the int3 replaced; restored on removal.
    overwritten_data: u8,
}

impl Breakpoint {
    fn bp_type(&self) -> BreakpointType {
        if self.user_count > 0 {
            BreakpointType::BkptUser
        } else {
            BreakpointType::BkptInternal
        }
    }

    fn do_ref(&mut self, which: BreakpointType) {
        match which {
            BreakpointType::BkptInternal => self.internal_count += 1,
            BreakpointType::BkptUser => self.user_count += 1,
            BreakpointType::BkptNone => (),
        }
    }

    fn do_unref(&mut self, which: BreakpointType) -> u32 {
        match which {
            BreakpointType::BkptInternal => self.internal_count -= 1,
            BreakpointType::BkptUser => self.user_count -= 1,
            BreakpointType::BkptNone => (),
        }
        self.internal_count + self.user_count
    }
}

struct Watchpoint {
    exec_count: u32,
    read_count: u32,
    write_count: u32,
    /// Snapshot of the watched bytes, to detect changes that the hardware
    /// hides (e.g. single-stepping on VMs that don't raise watchpoints).
    value_bytes: Vec<u8>,
    value_valid: bool,
    changed: bool,
    /// Debug registers assigned to this watchpoint by the last
    /// successful allocation.
    assigned_regs: Vec<u8>,
}

impl Watchpoint {
    fn new(num_bytes: usize) -> Watchpoint {
        Watchpoint {
            exec_count: 0,
            read_count: 0,
            write_count: 0,
            value_bytes: vec![0; num_bytes],
            value_valid: false,
            changed: false,
            assigned_regs: Vec::new(),
        }
    }

    fn watched_type(&self) -> WatchType {
        if self.read_count > 0 {
            WatchType::WatchReadWrite
        } else if self.write_count > 0 {
            WatchType::WatchWrite
        } else {
            debug_assert!(self.exec_count > 0);
            WatchType::WatchExec
        }
    }

    fn watches_exec(&self) -> bool {
        self.exec_count > 0
    }

    fn watches_read(&self) -> bool {
        self.read_count > 0
    }

    /// Read-write watchers watch writes too.
    fn watches_write(&self) -> bool {
        self.write_count > 0 || self.read_count > 0
    }

    fn do_ref(&mut self, type_: WatchType) {
        match type_ {
            WatchType::WatchExec => self.exec_count += 1,
            WatchType::WatchWrite => self.write_count += 1,
            WatchType::WatchReadWrite => self.read_count += 1,
        }
    }

    fn do_unref(&mut self, type_: WatchType) -> u32 {
        match type_ {
            WatchType::WatchExec => self.exec_count -= 1,
            WatchType::WatchWrite => self.write_count -= 1,
            WatchType::WatchReadWrite => self.read_count -= 1,
        }
        self.exec_count + self.read_count + self.write_count
    }
}

pub struct AddressSpace {
    session_: SessionSharedWeakPtr,
    leader_tid_: pid_t,
    leader_serial: u32,
    exec_count: u32,
    exe_image_: RefCell<OsString>,
    tasks: RefCell<TaskSet>,
    mem: RefCell<BTreeMap<MemoryRange, Mapping>>,
    shm_sizes: RefCell<HashMap<RemotePtr<Void>, usize>>,
    mem_fd_: RefCell<ScopedFd>,
    breakpoints: RefCell<BTreeMap<RemoteCodePtr, Breakpoint>>,
    watchpoints: RefCell<BTreeMap<MemoryRange, Watchpoint>>,
}

impl AddressSpace {
    pub fn new(
        session: SessionSharedWeakPtr,
        exe_image: &OsStr,
        leader_tid: pid_t,
        leader_serial: u32,
        exec_count: u32,
    ) -> AddressSpaceSharedPtr {
        log!(
            crate::log::LogDebug,
            "creating address space for {} (exec count {})",
            leader_tid,
            exec_count
        );
        Rc::new(AddressSpace {
            session_: session,
            leader_tid_: leader_tid,
            leader_serial,
            exec_count,
            exe_image_: RefCell::new(exe_image.to_os_string()),
            tasks: RefCell::new(TaskSet::new()),
            mem: RefCell::new(BTreeMap::new()),
            shm_sizes: RefCell::new(HashMap::new()),
            mem_fd_: RefCell::new(ScopedFd::new()),
            breakpoints: RefCell::new(BTreeMap::new()),
            watchpoints: RefCell::new(BTreeMap::new()),
        })
    }

    /// The copy used when a tracee forks without CLONE_VM: same mappings
    /// and breakpoints (memory contents were CoW-copied by the kernel),
    /// fresh mem fd, no tracer-local views.
    pub fn clone_for_fork(
        &self,
        session: SessionSharedWeakPtr,
        leader_tid: pid_t,
        leader_serial: u32,
    ) -> AddressSpaceSharedPtr {
        let mut mem = self.mem.borrow().clone();
        for m in mem.values_mut() {
            m.local_addr = None;
        }
        let breakpoints = self
            .breakpoints
            .borrow()
            .iter()
            .map(|(addr, bp)| {
                (
                    *addr,
                    Breakpoint {
                        internal_count: bp.internal_count,
                        user_count: bp.user_count,
                        overwritten_data: bp.overwritten_data,
                    },
                )
            })
            .collect();
        Rc::new(AddressSpace {
            session_: session,
            leader_tid_: leader_tid,
            leader_serial,
            exec_count: 0,
            exe_image_: RefCell::new(self.exe_image_.borrow().clone()),
            tasks: RefCell::new(TaskSet::new()),
            mem: RefCell::new(mem),
            shm_sizes: RefCell::new(self.shm_sizes.borrow().clone()),
            mem_fd_: RefCell::new(ScopedFd::new()),
            breakpoints: RefCell::new(breakpoints),
            watchpoints: RefCell::new(BTreeMap::new()),
        })
    }

    pub fn session(&self) -> SessionSharedPtr {
        self.session_.upgrade().unwrap()
    }

    pub fn uid(&self) -> AddressSpaceUid {
        AddressSpaceUid::new_with(self.leader_tid_, self.leader_serial, self.exec_count)
    }

    pub fn exec_count(&self) -> u32 {
        self.exec_count
    }

    pub fn leader_tid(&self) -> pid_t {
        self.leader_tid_
    }

    pub fn exe_image(&self) -> OsString {
        self.exe_image_.borrow().clone()
    }

    pub fn task_set(&self) -> Ref<TaskSet> {
        self.tasks.borrow()
    }

    pub fn task_set_mut(&self) -> RefMut<TaskSet> {
        self.tasks.borrow_mut()
    }

    pub fn mem_fd(&self) -> Ref<ScopedFd> {
        self.mem_fd_.borrow()
    }

    pub fn set_mem_fd(&self, fd: ScopedFd) {
        *self.mem_fd_.borrow_mut() = fd;
    }

    /// All ranges starting at or below `addr` are `<=` this probe, so the
    /// last of them is the only candidate that can contain `addr`.
    fn probe_for(addr: RemotePtr<Void>) -> MemoryRange {
        MemoryRange::from_range(addr, RemotePtr::new(usize::MAX))
    }

    /// The mapping containing `addr`, if any.
    pub fn mapping_of(&self, addr: RemotePtr<Void>) -> Option<Mapping> {
        let mem = self.mem.borrow();
        let probe = Self::probe_for(addr);
        mem.range(..=probe)
            .next_back()
            .filter(|(range, _)| range.contains(addr))
            .map(|(_, m)| m.clone())
    }

    /// All mappings intersecting `range`, in address order.
    pub fn mappings_intersecting(&self, range: MemoryRange) -> Vec<Mapping> {
        self.mem
            .borrow()
            .iter()
            .filter(|(r, _)| r.intersects(&range))
            .map(|(_, m)| m.clone())
            .collect()
    }

    /// A tracer-local view of [addr, addr+size) when the whole range lies
    /// in one mapping we share with the tracee.
    pub fn local_mapping(&self, addr: RemotePtr<Void>, size: usize) -> Option<&'static [u8]> {
        self.local_mapping_mut(addr, size).map(|s| &*s)
    }

    pub fn local_mapping_mut(
        &self,
        addr: RemotePtr<Void>,
        size: usize,
    ) -> Option<&'static mut [u8]> {
        let mem = self.mem.borrow();
        let probe = Self::probe_for(addr);
        let (range, m) = mem
            .range(..=probe)
            .next_back()
            .filter(|(range, _)| range.contains(addr))?;
        let local = m.local_addr?;
        if !range.contains_range(&MemoryRange::new_range(addr, size)) {
            return None;
        }
        let offset = addr - range.start();
        // The mapping outlives every caller: it's only torn down on unmap,
        // which requires the tracee to be stopped and no local views in
        // use.
        Some(unsafe { std::slice::from_raw_parts_mut(local.add(offset), size) })
    }

    /// Record a new mapping, replacing anything it overlaps.
    #[allow(clippy::too_many_arguments)]
    pub fn map(
        &self,
        addr: RemotePtr<Void>,
        num_bytes: usize,
        prot: ProtFlags,
        flags: MapFlags,
        file_offset_bytes: u64,
        fsname: &OsStr,
        device: u64,
        inode: u64,
        mapping_flags: MappingFlags,
        local_addr: Option<*mut u8>,
    ) -> KernelMapping {
        let num_bytes = crate::util::ceil_page_size(num_bytes);
        let km = KernelMapping::new(
            addr,
            addr + num_bytes,
            fsname,
            device,
            inode,
            prot,
            flags,
            file_offset_bytes,
        );
        log!(crate::log::LogDebug, "mapping {}", km);
        self.unmap_internal(addr, num_bytes);
        let mut mapping = Mapping::new(km.clone());
        mapping.flags = mapping_flags;
        mapping.local_addr = local_addr;
        self.mem
            .borrow_mut()
            .insert(MemoryRange::new_range(addr, num_bytes), mapping);
        km
    }

    /// munmap observed (or the mapping is being replaced).
    pub fn unmap(&self, addr: RemotePtr<Void>, num_bytes: usize) {
        let num_bytes = crate::util::ceil_page_size(num_bytes);
        log!(
            crate::log::LogDebug,
            "unmapping [{}, {})",
            addr,
            addr + num_bytes
        );
        if num_bytes == 0 {
            return;
        }
        self.unmap_internal(addr, num_bytes);
    }

    fn unmap_internal(&self, addr: RemotePtr<Void>, num_bytes: usize) {
        let unmapped = MemoryRange::new_range(addr, num_bytes);
        let mut mem = self.mem.borrow_mut();
        let overlapping: Vec<MemoryRange> = mem
            .keys()
            .filter(|r| r.intersects(&unmapped))
            .cloned()
            .collect();
        for range in overlapping {
            let m = mem.remove(&range).unwrap();
            if let Some(local) = m.local_addr {
                let unmap_start = std::cmp::max(range.start(), unmapped.start());
                // Drop the whole local view; partial local unmaps don't
                // happen for the shared buffers we track locally.
                if unmap_start == range.start() {
                    unsafe {
                        libc::munmap(local as *mut libc::c_void, range.size());
                    }
                }
            }
            // Keep any pieces outside the unmapped range.
            if range.start() < unmapped.start() {
                let left = MemoryRange::from_range(range.start(), unmapped.start());
                let mut piece = Mapping::new(m.map.subrange(left));
                piece.flags = m.flags;
                mem.insert(left, piece);
            }
            if unmapped.end() < range.end() {
                let right = MemoryRange::from_range(unmapped.end(), range.end());
                let mut piece = Mapping::new(m.map.subrange(right));
                piece.flags = m.flags;
                mem.insert(right, piece);
            }
        }
    }

    /// mprotect observed. Called even when the syscall failed, because the
    /// kernel may have applied the protection to a prefix of the range.
    pub fn protect(&self, addr: RemotePtr<Void>, num_bytes: usize, prot: ProtFlags) {
        let num_bytes = crate::util::ceil_page_size(num_bytes);
        let protected = MemoryRange::new_range(addr, num_bytes);
        log!(
            crate::log::LogDebug,
            "protecting {} with {:?}",
            protected,
            prot
        );
        let mut mem = self.mem.borrow_mut();
        let overlapping: Vec<MemoryRange> = mem
            .keys()
            .filter(|r| r.intersects(&protected))
            .cloned()
            .collect();
        for range in overlapping {
            let m = mem.remove(&range).unwrap();
            let mid = range.intersect(&protected);
            if range.start() < mid.start() {
                let left = MemoryRange::from_range(range.start(), mid.start());
                let mut piece = Mapping::new(m.map.subrange(left));
                piece.flags = m.flags;
                piece.local_addr = m.local_addr;
                mem.insert(left, piece);
            }
            {
                let mut km = m.map.subrange(mid);
                km.set_prot(prot);
                let mut piece = Mapping::new(km);
                piece.flags = m.flags;
                piece.local_addr = m
                    .local_addr
                    .map(|l| unsafe { l.add(mid.start() - range.start()) });
                mem.insert(mid, piece);
            }
            if mid.end() < range.end() {
                let right = MemoryRange::from_range(mid.end(), range.end());
                let mut piece = Mapping::new(m.map.subrange(right));
                piece.flags = m.flags;
                piece.local_addr = m
                    .local_addr
                    .map(|l| unsafe { l.add(right.start() - range.start()) });
                mem.insert(right, piece);
            }
        }
    }

    /// madvise observed; only bookkeeping-relevant advice matters.
    pub fn advise(&self, addr: RemotePtr<Void>, num_bytes: usize, advice: i32) {
        log!(
            crate::log::LogDebug,
            "advising [{}, {}) with {}",
            addr,
            addr + num_bytes,
            advice
        );
        if advice == libc::MADV_DONTNEED {
            // Private anonymous pages read back as zero afterwards; any
            // local view of a shared mapping stays coherent by itself.
        }
    }

    pub fn set_shm_size(&self, addr: RemotePtr<Void>, size: usize) {
        self.shm_sizes.borrow_mut().insert(addr, size);
    }

    pub fn get_shm_size(&self, addr: RemotePtr<Void>) -> Option<usize> {
        self.shm_sizes.borrow().get(&addr).copied()
    }

    pub fn remove_shm_size(&self, addr: RemotePtr<Void>) {
        self.shm_sizes.borrow_mut().remove(&addr);
    }

    /// A write to tracee memory completed; keep breakpoint bookkeeping
    /// coherent with the new bytes.
    pub fn notify_written(
        &self,
        t: &mut Task,
        addr: RemotePtr<Void>,
        num_bytes: usize,
        flags: WriteFlags,
    ) {
        if !flags.contains(WriteFlags::IS_BREAKPOINT_RELATED) {
            self.maybe_update_breakpoints(t, addr, num_bytes);
        }
    }

    /// The tracee overwrote memory holding breakpoints: adopt the new byte
    /// as the data-to-restore and re-plant the trap instruction.
    fn maybe_update_breakpoints(&self, t: &mut Task, addr: RemotePtr<Void>, num_bytes: usize) {
        let written = MemoryRange::new_range(addr, num_bytes);
        let to_update: Vec<RemoteCodePtr> = self
            .breakpoints
            .borrow()
            .keys()
            .filter(|bkpt_addr| written.contains(bkpt_addr.to_data_ptr()))
            .cloned()
            .collect();
        for bkpt_addr in to_update {
            let mut new_data: u8 = 0;
            t.read_bytes_helper(
                bkpt_addr.to_data_ptr(),
                crate::util::u8_slice_mut(&mut new_data),
                None,
            );
            if new_data == BKPT_INSTRUCTION {
                continue;
            }
            self.breakpoints
                .borrow_mut()
                .get_mut(&bkpt_addr)
                .unwrap()
                .overwritten_data = new_data;
            t.write_bytes_helper(
                bkpt_addr.to_data_ptr(),
                &[BKPT_INSTRUCTION],
                None,
                WriteFlags::IS_BREAKPOINT_RELATED,
            );
        }
    }

    pub fn add_breakpoint(&self, t: &mut Task, addr: RemoteCodePtr, type_: BreakpointType) -> bool {
        let exists = self.breakpoints.borrow().contains_key(&addr);
        if !exists {
            let mut overwritten_data: u8 = 0;
            let mut ok = true;
            t.read_bytes_helper(
                addr.to_data_ptr(),
                crate::util::u8_slice_mut(&mut overwritten_data),
                Some(&mut ok),
            );
            if !ok {
                return false;
            }
            t.write_bytes_helper(
                addr.to_data_ptr(),
                &[BKPT_INSTRUCTION],
                Some(&mut ok),
                WriteFlags::IS_BREAKPOINT_RELATED,
            );
            if !ok {
                return false;
            }
            self.breakpoints.borrow_mut().insert(
                addr,
                Breakpoint {
                    internal_count: 0,
                    user_count: 0,
                    overwritten_data,
                },
            );
        }
        self.breakpoints
            .borrow_mut()
            .get_mut(&addr)
            .unwrap()
            .do_ref(type_);
        true
    }

    pub fn remove_breakpoint(&self, t: &mut Task, addr: RemoteCodePtr, type_: BreakpointType) {
        let mut restore: Option<u8> = None;
        {
            let mut breakpoints = self.breakpoints.borrow_mut();
            if let Some(bp) = breakpoints.get_mut(&addr) {
                if bp.do_unref(type_) == 0 {
                    restore = Some(bp.overwritten_data);
                    breakpoints.remove(&addr);
                }
            }
        }
        if let Some(data) = restore {
            t.write_bytes_helper(
                addr.to_data_ptr(),
                &[data],
                None,
                WriteFlags::IS_BREAKPOINT_RELATED,
            );
        }
    }

    pub fn remove_all_breakpoints(&self, t: &mut Task) {
        let addrs: Vec<RemoteCodePtr> = self.breakpoints.borrow().keys().cloned().collect();
        for addr in addrs {
            let data = self.breakpoints.borrow()[&addr].overwritten_data;
            t.write_bytes_helper(
                addr.to_data_ptr(),
                &[data],
                None,
                WriteFlags::IS_BREAKPOINT_RELATED,
            );
        }
        self.breakpoints.borrow_mut().clear();
    }

    pub fn get_breakpoint_type_at_addr(&self, addr: RemoteCodePtr) -> BreakpointType {
        self.breakpoints
            .borrow()
            .get(&addr)
            .map_or(BreakpointType::BkptNone, |bp| bp.bp_type())
    }

    /// Is the instruction at `ip` really a trap instruction in tracee
    /// memory right now?
    pub fn is_breakpoint_instruction(t: &mut Task, ip: RemoteCodePtr) -> bool {
        let mut byte: u8 = 0;
        let mut ok = true;
        t.read_bytes_helper(
            ip.to_data_ptr(),
            crate::util::u8_slice_mut(&mut byte),
            Some(&mut ok),
        );
        ok && byte == BKPT_INSTRUCTION
    }

    pub fn has_breakpoints(&self) -> bool {
        !self.breakpoints.borrow().is_empty()
    }

    pub fn has_watchpoints(&self) -> bool {
        !self.watchpoints.borrow().is_empty()
    }

    /// Add a watchpoint and reprogram the debug registers of every member
    /// task. False (with nothing armed on any task) when the 4 hardware
    /// slots can't cover the watched set.
    pub fn add_watchpoint(
        &self,
        t: &mut Task,
        addr: RemotePtr<Void>,
        num_bytes: usize,
        type_: WatchType,
    ) -> bool {
        let range = MemoryRange::new_range(addr, num_bytes);
        {
            let mut watchpoints = self.watchpoints.borrow_mut();
            let wp = watchpoints
                .entry(range)
                .or_insert_with(|| Watchpoint::new(num_bytes));
            wp.do_ref(type_);
        }
        self.update_watchpoint_value(t, range);
        if !self.allocate_watchpoints(t) {
            self.remove_watchpoint(t, addr, num_bytes, type_);
            return false;
        }
        true
    }

    pub fn remove_watchpoint(
        &self,
        t: &mut Task,
        addr: RemotePtr<Void>,
        num_bytes: usize,
        type_: WatchType,
    ) {
        let range = MemoryRange::new_range(addr, num_bytes);
        {
            let mut watchpoints = self.watchpoints.borrow_mut();
            if let Some(wp) = watchpoints.get_mut(&range) {
                if wp.do_unref(type_) == 0 {
                    watchpoints.remove(&range);
                }
            }
        }
        self.allocate_watchpoints(t);
    }

    pub fn remove_all_watchpoints(&self, t: &mut Task) {
        self.watchpoints.borrow_mut().clear();
        self.allocate_watchpoints(t);
    }

    /// The current watchpoint set as debug-register configurations, split
    /// into hardware-sized aligned chunks. None when it doesn't fit.
    fn watchpoint_configs(&self) -> Option<Vec<(MemoryRange, Vec<WatchConfig>)>> {
        let watchpoints = self.watchpoints.borrow();
        let mut result = Vec::new();
        let mut total = 0usize;
        for (range, wp) in watchpoints.iter() {
            let mut configs = Vec::new();
            match wp.watched_type() {
                WatchType::WatchExec => {
                    // Execution watchpoints watch one instruction address.
                    configs.push(WatchConfig::new(range.start(), 1, WatchType::WatchExec));
                }
                type_ => {
                    let mut addr = range.start();
                    while addr < range.end() {
                        let remaining = range.end() - addr;
                        let mut size = 8;
                        while size > 1 && (addr.as_usize() % size != 0 || size > remaining) {
                            size /= 2;
                        }
                        configs.push(WatchConfig::new(addr, size, type_));
                        addr = addr + size;
                    }
                }
            }
            total += configs.len();
            if total > NUM_X86_WATCHPOINTS {
                return None;
            }
            result.push((*range, configs));
        }
        Some(result)
    }

    /// Program the hardware for the current watchpoint set on all member
    /// tasks. On failure every task ends with no watchpoints armed.
    fn allocate_watchpoints(&self, t: &mut Task) -> bool {
        let maybe_configs = self.watchpoint_configs();

        let ok = match &maybe_configs {
            None => false,
            Some(configs) => {
                let mut regs: DebugRegs = Vec::new();
                for (_, chunk) in configs.iter() {
                    regs.extend_from_slice(chunk);
                }
                let mut all_ok = t.set_debug_regs(&regs);
                for other in self.task_set().iter_except(t.serial()) {
                    all_ok = all_ok && other.borrow().set_debug_regs(&regs);
                }
                all_ok
            }
        };

        if !ok {
            t.set_debug_regs(&Vec::new());
            for other in self.task_set().iter_except(t.serial()) {
                other.borrow().set_debug_regs(&Vec::new());
            }
            let mut watchpoints = self.watchpoints.borrow_mut();
            for wp in watchpoints.values_mut() {
                wp.assigned_regs.clear();
            }
            return false;
        }

        // Record which DR slots each watchpoint occupies, in allocation
        // order.
        let configs = maybe_configs.unwrap();
        let mut watchpoints = self.watchpoints.borrow_mut();
        let mut next_reg: u8 = 0;
        for (range, chunk) in configs.iter() {
            let wp = watchpoints.get_mut(range).unwrap();
            wp.assigned_regs.clear();
            for _ in chunk {
                wp.assigned_regs.push(next_reg);
                next_reg += 1;
            }
        }
        true
    }

    /// Refresh the value snapshot of one watchpoint, noting a change if
    /// the watched bytes differ from the last snapshot.
    fn update_watchpoint_value(&self, t: &mut Task, range: MemoryRange) {
        let mut buf = vec![0u8; range.size()];
        let mut ok = true;
        t.read_bytes_helper(range.start(), &mut buf, Some(&mut ok));
        let mut watchpoints = self.watchpoints.borrow_mut();
        let wp = match watchpoints.get_mut(&range) {
            Some(wp) => wp,
            None => return,
        };
        if !ok {
            wp.value_valid = false;
            return;
        }
        if wp.value_valid && wp.value_bytes != buf {
            wp.changed = true;
        }
        wp.value_bytes = buf;
        wp.value_valid = true;
    }

    /// The debug status after a SIGTRAP names the DR slots that fired;
    /// translate that (plus value changes observable after a single-step)
    /// into per-watchpoint "changed" flags.
    pub fn notify_watchpoint_fired(
        &self,
        t: &mut Task,
        debug_status: usize,
        address_of_singlestep_start: RemoteCodePtr,
    ) {
        {
            let mut watchpoints = self.watchpoints.borrow_mut();
            for (range, wp) in watchpoints.iter_mut() {
                let fired_in_hw = wp
                    .assigned_regs
                    .iter()
                    .any(|&r| debug_status & (1 << r as usize) != 0);
                // On Skylake, at least, singlestepping through the
                // instruction immediately before a hardware execution
                // watchpoint reports singlestep completion *and* the
                // watchpoint as triggered; the latter is incorrect. Ignore
                // exec triggers that aren't on the instruction we just
                // tried to execute.
                let read_triggered = wp.watches_read() && fired_in_hw;
                let exec_triggered = wp.watches_exec()
                    && (address_of_singlestep_start.is_null()
                        || range.start() == address_of_singlestep_start.to_data_ptr::<Void>())
                    && fired_in_hw;
                if read_triggered || exec_triggered {
                    wp.changed = true;
                }
            }
        }

        // Write watchpoints trigger on a change of the watched bytes, not
        // on the status bits: in some configurations (e.g. 32-bit guests
        // under VMWare) the watchpoint bits aren't set on singlestep.
        let write_ranges: Vec<MemoryRange> = self
            .watchpoints
            .borrow()
            .iter()
            .filter(|(_, wp)| wp.watches_write())
            .map(|(range, _)| *range)
            .collect();
        for range in write_ranges {
            self.update_watchpoint_value(t, range);
        }
    }

    pub fn has_any_watchpoint_changes(&self) -> bool {
        self.watchpoints.borrow().values().any(|wp| wp.changed)
    }

    /// Did an exec watchpoint at `ip` fire since the last
    /// consume_watchpoint_changes?
    pub fn has_exec_watchpoint_fired(&self, ip: RemoteCodePtr) -> bool {
        self.watchpoints.borrow().iter().any(|(range, wp)| {
            wp.changed
                && wp.watches_exec()
                && range.start() == ip.to_data_ptr::<Void>()
        })
    }

    pub fn consume_watchpoint_changes(&self) -> Vec<WatchConfig> {
        let mut result = Vec::new();
        let mut watchpoints = self.watchpoints.borrow_mut();
        for (range, wp) in watchpoints.iter_mut() {
            if wp.changed {
                result.push(WatchConfig::new(
                    range.start(),
                    range.size(),
                    wp.watched_type(),
                ));
                wp.changed = false;
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn range(start: usize, size: usize) -> MemoryRange {
        MemoryRange::new_range(RemotePtr::new(start), size)
    }

    fn test_vm() -> AddressSpaceSharedPtr {
        AddressSpace::new(std::rc::Weak::new(), OsStr::new("/bin/true"), 100, 1, 0)
    }

    fn map_anon(vm: &AddressSpace, start: usize, size: usize) {
        vm.map(
            RemotePtr::new(start),
            size,
            ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
            MapFlags::MAP_PRIVATE | MapFlags::MAP_ANONYMOUS,
            0,
            OsStr::new(""),
            kernel_mapping::NO_DEVICE,
            kernel_mapping::NO_INODE,
            MappingFlags::empty(),
            None,
        );
    }

    #[test]
    fn mapping_lookup() {
        let vm = test_vm();
        map_anon(&vm, 0x10000, 0x4000);
        assert!(vm.mapping_of(RemotePtr::new(0x10000)).is_some());
        assert!(vm.mapping_of(RemotePtr::new(0x13fff)).is_some());
        assert!(vm.mapping_of(RemotePtr::new(0x14000)).is_none());
        assert!(vm.mapping_of(RemotePtr::new(0xffff)).is_none());
    }

    #[test]
    fn unmap_splits_mappings() {
        let vm = test_vm();
        map_anon(&vm, 0x10000, 0x4000);
        vm.unmap(RemotePtr::new(0x11000), 0x1000);
        assert!(vm.mapping_of(RemotePtr::new(0x10000)).is_some());
        assert!(vm.mapping_of(RemotePtr::new(0x11000)).is_none());
        assert!(vm.mapping_of(RemotePtr::new(0x12000)).is_some());
        let pieces = vm.mappings_intersecting(range(0x10000, 0x4000));
        assert_eq!(2, pieces.len());
    }

    #[test]
    fn protect_splits_and_updates() {
        let vm = test_vm();
        map_anon(&vm, 0x10000, 0x3000);
        vm.protect(RemotePtr::new(0x11000), 0x1000, ProtFlags::PROT_NONE);
        let m = vm.mapping_of(RemotePtr::new(0x11000)).unwrap();
        assert_eq!(ProtFlags::PROT_NONE, m.map.prot());
        let m = vm.mapping_of(RemotePtr::new(0x10000)).unwrap();
        assert!(m.map.prot().contains(ProtFlags::PROT_READ));
        assert_eq!(3, vm.mappings_intersecting(range(0x10000, 0x3000)).len());
    }

    #[test]
    fn replacing_map_unmaps_overlap() {
        let vm = test_vm();
        map_anon(&vm, 0x10000, 0x2000);
        map_anon(&vm, 0x11000, 0x2000);
        let pieces = vm.mappings_intersecting(range(0x0f000, 0x10000));
        assert_eq!(2, pieces.len());
        assert_eq!(RemotePtr::new(0x10000), pieces[0].map.start());
        assert_eq!(RemotePtr::new(0x11000), pieces[0].map.end());
        assert_eq!(RemotePtr::new(0x11000), pieces[1].map.start());
        assert_eq!(RemotePtr::new(0x13000), pieces[1].map.end());
    }

    #[test]
    fn shm_sizes() {
        let vm = test_vm();
        vm.set_shm_size(RemotePtr::new(0x7000), 0x3000);
        assert_eq!(Some(0x3000), vm.get_shm_size(RemotePtr::new(0x7000)));
        vm.remove_shm_size(RemotePtr::new(0x7000));
        assert_eq!(None, vm.get_shm_size(RemotePtr::new(0x7000)));
    }

    fn test_task() -> (crate::session::SessionSharedPtr, Task) {
        let session = crate::session::Session::new(crate::session::SessionMode::Recording);
        let serial = session.next_task_serial();
        let t = Task::new(&session, 1, 1, serial, crate::kernel_abi::REWIND_NATIVE_ARCH);
        (session, t)
    }

    /// Plant an exec watchpoint directly, as if allocation had assigned it
    /// to debug register `dr`, without touching a live tracee.
    fn plant_exec_watchpoint(vm: &AddressSpace, start: usize, dr: u8) {
        let range = MemoryRange::new_range(RemotePtr::new(start), 1);
        let mut wp = Watchpoint::new(1);
        wp.exec_count = 1;
        wp.assigned_regs.push(dr);
        vm.watchpoints.borrow_mut().insert(range, wp);
    }

    #[test]
    fn exec_watchpoint_trigger_requires_matching_singlestep_address() {
        let vm = test_vm();
        let (_session, mut t) = test_task();
        plant_exec_watchpoint(&vm, 0x5000, 0);

        // Singlestep ended on a different instruction; the DR0 status bit
        // is the spurious Skylake report and must be ignored.
        vm.notify_watchpoint_fired(&mut t, 0x1, RemoteCodePtr::new(0x6000));
        assert!(!vm.has_any_watchpoint_changes());
        assert!(!vm.has_exec_watchpoint_fired(RemoteCodePtr::new(0x5000)));

        // Singlestep ended exactly on the watched instruction.
        vm.notify_watchpoint_fired(&mut t, 0x1, RemoteCodePtr::new(0x5000));
        assert!(vm.has_any_watchpoint_changes());
        assert!(vm.has_exec_watchpoint_fired(RemoteCodePtr::new(0x5000)));
        assert!(!vm.has_exec_watchpoint_fired(RemoteCodePtr::new(0x6000)));
    }

    #[test]
    fn exec_watchpoint_trigger_without_singlestep() {
        let vm = test_vm();
        let (_session, mut t) = test_task();
        plant_exec_watchpoint(&vm, 0x5000, 0);

        // The wrong DR slot doesn't trigger anything.
        vm.notify_watchpoint_fired(&mut t, 0x2, RemoteCodePtr::null());
        assert!(!vm.has_any_watchpoint_changes());

        // Outside a singlestep there is nothing to filter against; the
        // status bit alone decides.
        vm.notify_watchpoint_fired(&mut t, 0x1, RemoteCodePtr::null());
        assert!(vm.has_any_watchpoint_changes());
        assert!(vm.has_exec_watchpoint_fired(RemoteCodePtr::new(0x5000)));

        let changed = vm.consume_watchpoint_changes();
        assert_eq!(1, changed.len());
        assert!(!vm.has_any_watchpoint_changes());
    }
}
