//! # Virtual-memory manager.
//!
//! The VM manager keeps one logical-page table per task and services faults
//! against it. A logical page starts `Empty` (zero-fill on first touch),
//! becomes `Resident` when a frame backs it, and `Swapped` once a swap slot
//! holds its bytes; memory-mapped pages are `Mapped` and resolve through the
//! mmap layer instead of swap. The task's [`page_table`] is the
//! authoritative resident map; the logical pages are the supplementary
//! metadata that says how to materialize an address that is not mapped.
//!
//! Under memory pressure [`Vm::ensure`] runs the eviction loop: pick the
//! least recently used resident page, prefer dropping a clean swapped-in
//! page (its slot still holds valid data), rewrite re-dirtied swapped pages
//! from scratch, and otherwise unmap the victim first — forcing racing
//! accesses into a fault — before writing it to a fresh swap slot.
//!
//! A single lock serializes logical-page metadata and page-table mutation;
//! the lock ordering is VM lock, then swap or mmap bookkeeping, then the
//! filesystem — never the reverse.
//!
//! [`page_table`]: page_table::PageTable

pub mod frame;
pub mod mmap;
pub mod page_table;
pub mod swap;

use crate::fs::File;
use crate::{KernelError, PAGE_SIZE};
use self::frame::{Frame, FramePool};
use self::mmap::Mmap;
use self::page_table::PageTable;
use std::collections::BTreeMap;
use std::sync::Mutex;
use self::swap::SwapArea;

/// A user virtual address.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Va(pub usize);

impl Va {
    /// The address rounded down to its page base.
    #[inline]
    pub fn page_base(self) -> Va {
        Va(self.0 & !(PAGE_SIZE - 1))
    }

    /// The offset within the page.
    #[inline]
    pub fn page_offset(self) -> usize {
        self.0 & (PAGE_SIZE - 1)
    }

    /// Whether the address is page-aligned.
    #[inline]
    pub fn is_page_aligned(self) -> bool {
        self.page_offset() == 0
    }
}

/// Identifier of a thread of the managed system.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct TaskId(pub u64);

/// Addresses below this bound are reserved and always fault.
pub const MIN_USER_ADDR: usize = 1 << 16;

// Upper bound of evictions per allocation attempt.
const EVICT_BATCH: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PageState {
    // Registered but never materialized; reads see zeros.
    Empty,
    // A frame backs the page; no swap copy exists.
    Resident,
    // A swap slot holds the page. The page may additionally be resident:
    // that is the clean swapped-in case the eviction fast path lives for.
    Swapped,
    // Backed by a shared mmap kpage; never goes to swap.
    Mapped,
}

pub(crate) struct VmPage {
    pub state: PageState,
    pub readonly: bool,
    // Pin count; a pinned page stays out of the eviction LRU.
    pub pinned: usize,
}

pub(crate) struct TaskVm {
    pub page_table: PageTable,
    pub pages: BTreeMap<Va, VmPage>,
}

pub(crate) struct VmInner {
    pub tasks: BTreeMap<TaskId, TaskVm>,
    // Exactly the resident, swap-evictable logical pages.
    pub lru: crate::lru::LruList<(TaskId, Va)>,
}

/// The virtual-memory manager.
pub struct Vm {
    pub(crate) inner: Mutex<VmInner>,
    pub(crate) frames: FramePool,
    pub(crate) swap: SwapArea,
    pub(crate) mmap: Mmap,
}

impl Vm {
    /// Bring up the manager with `frames` physical frames and the given
    /// swap file (see [`swap::SWAP_FILE_NAME`]; it must exist at boot).
    pub fn new(frames: usize, swap_file: File) -> Self {
        let vm = Self {
            inner: Mutex::new(VmInner {
                tasks: BTreeMap::new(),
                lru: crate::lru::LruList::new(),
            }),
            frames: FramePool::new(frames),
            swap: SwapArea::new(swap_file),
            mmap: Mmap::new(),
        };
        log::info!("initialized user virtual memory");
        vm
    }

    /// Register a task before any of its pages are managed.
    pub fn register_task(&self, task: TaskId) -> Result<(), KernelError> {
        let mut inner = self.inner.lock().unwrap();
        match inner.tasks.entry(task) {
            std::collections::btree_map::Entry::Occupied(_) => Err(KernelError::InvalidArgument),
            std::collections::btree_map::Entry::Vacant(entry) => {
                entry.insert(TaskVm {
                    page_table: PageTable::new(),
                    pages: BTreeMap::new(),
                });
                Ok(())
            }
        }
    }

    /// Register a logical page in `Empty` state.
    ///
    /// No frame is allocated; the first [`ensure`] materializes zeros.
    /// Duplicate addresses are rejected.
    ///
    /// [`ensure`]: Vm::ensure
    pub fn alloc_zero(&self, task: TaskId, addr: Va, readonly: bool) -> Result<(), KernelError> {
        check_addr(addr)?;
        let mut inner = self.inner.lock().unwrap();
        let task_vm = inner.tasks.get_mut(&task).ok_or(KernelError::BadAddress)?;
        if task_vm.pages.contains_key(&addr) {
            return Err(KernelError::InvalidArgument);
        }
        task_vm.pages.insert(
            addr,
            VmPage {
                state: PageState::Empty,
                readonly,
                pinned: 0,
            },
        );
        Ok(())
    }

    /// Make `addr` resident, allocating, swapping in, or loading from the
    /// mapped file as the page's state demands.
    ///
    /// Returns `BadAddress` for unknown or reserved addresses and
    /// `NoMemory` when neither a free frame nor an evictable page exists.
    pub fn ensure(&self, task: TaskId, addr: Va) -> Result<(), KernelError> {
        check_addr(addr)?;
        let mut inner = self.inner.lock().unwrap();
        let inner = &mut *inner;

        let task_vm = inner.tasks.get_mut(&task).ok_or(KernelError::BadAddress)?;
        if task_vm.page_table.is_mapped(addr) {
            let page = &task_vm.pages[&addr];
            if matches!(page.state, PageState::Resident | PageState::Swapped) && page.pinned == 0 {
                inner.lru.touch((task, addr));
            }
            return Ok(());
        }

        let state = match task_vm.pages.get(&addr) {
            Some(page) => page.state,
            None => return Err(KernelError::BadAddress),
        };
        match state {
            PageState::Empty => {
                let frame = self.frame_or_evict(inner)?;
                let task_vm = inner.tasks.get_mut(&task).unwrap();
                let page = task_vm.pages.get_mut(&addr).unwrap();
                task_vm.page_table.map(addr, frame, !page.readonly);
                page.state = PageState::Resident;
                inner.lru.touch((task, addr));
                Ok(())
            }
            PageState::Swapped => {
                let frame = self.frame_or_evict(inner)?;
                {
                    let mut data = frame.contents();
                    self.swap.read_and_retain(task, addr, &mut data[..])?;
                }
                let task_vm = inner.tasks.get_mut(&task).unwrap();
                let readonly = task_vm.pages[&addr].readonly;
                task_vm.page_table.map(addr, frame, !readonly);
                inner.lru.touch((task, addr));
                Ok(())
            }
            PageState::Mapped => self.mmap_fault(inner, task, addr),
            PageState::Resident => unreachable!("resident page must be mapped"),
        }
    }

    /// [`alloc_zero`] composed with [`ensure`]; the page is removed again
    /// if it cannot be materialized.
    ///
    /// [`alloc_zero`]: Vm::alloc_zero
    /// [`ensure`]: Vm::ensure
    pub fn alloc_and_ensure(
        &self,
        task: TaskId,
        addr: Va,
        readonly: bool,
    ) -> Result<(), KernelError> {
        self.alloc_zero(task, addr, readonly)?;
        match self.ensure(task, addr) {
            Ok(()) => Ok(()),
            Err(e) => {
                let _ = self.dispose(task, addr);
                Err(e)
            }
        }
    }

    /// Unmap and forget a logical page, freeing its frame and swap slot.
    ///
    /// Mapped-file pages are unmapped through [`Vm::mmap_close`], not here.
    pub fn dispose(&self, task: TaskId, addr: Va) -> Result<(), KernelError> {
        check_addr(addr)?;
        let mut inner = self.inner.lock().unwrap();
        let inner = &mut *inner;
        let task_vm = inner.tasks.get_mut(&task).ok_or(KernelError::BadAddress)?;
        let state = match task_vm.pages.get(&addr) {
            Some(page) => page.state,
            None => return Err(KernelError::BadAddress),
        };
        match state {
            PageState::Mapped => return Err(KernelError::InvalidArgument),
            PageState::Empty => {}
            PageState::Resident | PageState::Swapped => {
                task_vm.page_table.unmap(addr);
                inner.lru.remove(&(task, addr));
                if state == PageState::Swapped {
                    self.swap.dispose(task, addr, 1);
                }
            }
        }
        task_vm.pages.remove(&addr);
        Ok(())
    }

    /// Tear down a task: write back and drop its file mappings, free every
    /// frame and swap slot, and forget its page tables.
    pub fn clean(&self, task: TaskId) {
        self.mmap_clean(task);
        let mut inner = self.inner.lock().unwrap();
        let inner = &mut *inner;
        if let Some(task_vm) = inner.tasks.remove(&task) {
            for addr in task_vm.pages.keys() {
                inner.lru.remove(&(task, *addr));
            }
            // Frames are freed as the page table drops.
            drop(task_vm);
        }
        self.swap.clean(task);
    }

    /// Timer hook: fold accessed bits into the page LRU.
    ///
    /// Touches no storage, so it is callable from interrupt context in the
    /// surrounding system.
    pub fn tick(&self, task: TaskId) {
        let mut inner = self.inner.lock().unwrap();
        let inner = &mut *inner;
        let Some(task_vm) = inner.tasks.get_mut(&task) else {
            return;
        };
        for addr in task_vm.page_table.mapped() {
            if task_vm.page_table.is_accessed(addr) {
                task_vm.page_table.set_accessed(addr, false);
                let page = &task_vm.pages[&addr];
                if matches!(page.state, PageState::Resident | PageState::Swapped)
                    && page.pinned == 0
                {
                    inner.lru.touch((task, addr));
                }
            }
        }
    }

    /// Copy `dest.len()` bytes of user memory at `addr` into `dest`,
    /// faulting pages in as needed.
    pub fn load(&self, task: TaskId, addr: Va, dest: &mut [u8]) -> Result<(), KernelError> {
        let len = dest.len();
        self.access(task, addr, len, false, |frame, offset, pos, n| {
            dest[pos..pos + n].copy_from_slice(&frame.contents()[offset..offset + n]);
        })
    }

    /// Copy `src` into user memory at `addr`, faulting pages in as needed
    /// and honoring the read-only bit.
    pub fn store(&self, task: TaskId, addr: Va, src: &[u8]) -> Result<(), KernelError> {
        self.access(task, addr, src.len(), true, |frame, offset, pos, n| {
            frame.contents()[offset..offset + n].copy_from_slice(&src[pos..pos + n]);
        })
    }

    // Walk [addr, addr + len) page by page, faulting each page in and
    // applying `op` with the frame, in-page offset, buffer position and
    // chunk length. Stores require the WRITABLE bit and set DIRTY.
    fn access(
        &self,
        task: TaskId,
        addr: Va,
        len: usize,
        write: bool,
        mut op: impl FnMut(&Frame, usize, usize, usize),
    ) -> Result<(), KernelError> {
        let mut pos = 0;
        while pos < len {
            let cur = Va(addr.0 + pos);
            let base = cur.page_base();
            let offset = cur.page_offset();
            let chunk = (PAGE_SIZE - offset).min(len - pos);
            loop {
                self.ensure(task, base)?;
                let mut inner = self.inner.lock().unwrap();
                let inner = &mut *inner;
                let task_vm = inner.tasks.get_mut(&task).ok_or(KernelError::BadAddress)?;
                let Some(frame) = task_vm.page_table.lookup(base) else {
                    // Evicted between the fault and the access; retry.
                    continue;
                };
                if write && !task_vm.page_table.is_writable(base) {
                    return Err(KernelError::BadAddress);
                }
                task_vm.page_table.set_accessed(base, true);
                if write {
                    task_vm.page_table.set_dirty(base, true);
                }
                op(&frame, offset, pos, chunk);
                break;
            }
            pos += chunk;
        }
        Ok(())
    }

    /// Whether the logical page at `addr` was registered read-only.
    ///
    /// `BadAddress` when no logical page covers the address.
    pub fn is_readonly(&self, task: TaskId, addr: Va) -> Result<bool, KernelError> {
        check_addr(addr)?;
        let inner = self.inner.lock().unwrap();
        let task_vm = inner.tasks.get(&task).ok_or(KernelError::BadAddress)?;
        task_vm
            .pages
            .get(&addr)
            .map(|page| page.readonly)
            .ok_or(KernelError::BadAddress)
    }

    /// Start an [`EnsureGroup`] for `task`.
    ///
    /// The group pins the pages added to it, keeping them resident until it
    /// drops — the tool for multi-step accesses that must not fault midway.
    pub fn ensure_group(&self, task: TaskId) -> EnsureGroup<'_> {
        EnsureGroup {
            vm: self,
            task,
            pages: Vec::new(),
        }
    }

    // Unpin one page previously pinned by an EnsureGroup.
    fn unpin(&self, task: TaskId, addr: Va) {
        let mut inner = self.inner.lock().unwrap();
        let inner = &mut *inner;
        let Some(task_vm) = inner.tasks.get_mut(&task) else {
            return;
        };
        let Some(page) = task_vm.pages.get_mut(&addr) else {
            return;
        };
        assert!(page.pinned > 0, "unpin of an unpinned page");
        page.pinned -= 1;
        if page.pinned == 0
            && task_vm.page_table.is_mapped(addr)
            && matches!(page.state, PageState::Resident | PageState::Swapped)
        {
            inner.lru.touch((task, addr));
        }
    }

    /// Whether `addr` currently has a resident frame.
    pub fn is_resident(&self, task: TaskId, addr: Va) -> bool {
        let inner = self.inner.lock().unwrap();
        inner
            .tasks
            .get(&task)
            .map(|t| t.page_table.is_mapped(addr))
            .unwrap_or(false)
    }

    /// Number of physical frames currently allocated.
    pub fn frames_in_use(&self) -> usize {
        self.frames.in_use()
    }

    /// Number of free swap slots.
    pub fn swap_free_slots(&self) -> usize {
        self.swap.free_slots()
    }

    // Allocate a frame, evicting resident pages to swap when the pool is
    // dry. `NoMemory` when eviction cannot make room either.
    pub(crate) fn frame_or_evict(&self, inner: &mut VmInner) -> Result<Frame, KernelError> {
        loop {
            if let Some(frame) = self.frames.alloc_zeroed() {
                return Ok(frame);
            }
            if !self.evict_some(inner) {
                return Err(KernelError::NoMemory);
            }
        }
    }

    // The eviction loop. Frees up to EVICT_BATCH frames; returns whether
    // any frame was freed.
    fn evict_some(&self, inner: &mut VmInner) -> bool {
        let mut freed = 0;
        while freed < EVICT_BATCH {
            // (1) The least recently used resident page.
            let Some(&(task, addr)) = inner.lru.peek_least() else {
                break;
            };
            let task_vm = inner.tasks.get_mut(&task).unwrap();
            let frame = task_vm
                .page_table
                .lookup(addr)
                .expect("page LRU holds only resident pages");

            let state = task_vm.pages[&addr].state;
            if state == PageState::Swapped {
                if !task_vm.page_table.is_dirty(addr) {
                    // (2.1) The slot still matches memory: drop the frame,
                    // and tell swap the slot is now the only copy.
                    task_vm.page_table.unmap(addr);
                    inner.lru.remove(&(task, addr));
                    drop(frame);
                    self.swap.mark_swapped_out(task, addr);
                    freed += 1;
                    continue;
                }
                // (2.2) Re-dirtied since swap-in: the slot is stale. Drop
                // it and let a later round treat this as a fresh eviction.
                task_vm.page_table.set_dirty(addr, false);
                task_vm.pages.get_mut(&addr).unwrap().state = PageState::Resident;
                inner.lru.touch((task, addr));
                let disposed = self.swap.dispose(task, addr, 1);
                debug_assert!(disposed);
                continue;
            }

            // (3) Unmap before the write so a racing access faults instead
            // of reading a page that is about to leave.
            let readonly = task_vm.pages[&addr].readonly;
            task_vm.page_table.unmap(addr);
            inner.lru.remove(&(task, addr));
            task_vm.pages.get_mut(&addr).unwrap().state = PageState::Swapped;

            // (4) Write the frame out; slot reclaim may notify a victim.
            let data = *frame.contents();
            let result = self
                .swap
                .alloc_and_write(task, addr, &data, |reclaimed| {
                    if let Some(victim_vm) = inner.tasks.get_mut(&reclaimed.owner) {
                        if let Some(page) = victim_vm.pages.get_mut(&reclaimed.base) {
                            if page.state == PageState::Swapped {
                                page.state = PageState::Resident;
                            }
                        }
                    }
                });
            match result {
                Ok(()) => {
                    // (5.1) The frame is free.
                    drop(frame);
                    freed += 1;
                }
                Err(e) => {
                    // (5.2) Swap is exhausted or failed: restore the
                    // mapping and stop.
                    log::warn!("eviction aborted, swap write failed: {:?}", e);
                    let task_vm = inner.tasks.get_mut(&task).unwrap();
                    task_vm.page_table.map(addr, frame, !readonly);
                    task_vm.pages.get_mut(&addr).unwrap().state = PageState::Resident;
                    inner.lru.touch((task, addr));
                    break;
                }
            }
        }
        freed > 0
    }
}

/// A set of pages held resident on behalf of one task.
///
/// Faulting a page in says nothing about how long it stays; an operation
/// that copies through several user pages (a system-call buffer walk) pins
/// them here first so the eviction loop passes them over. Every page added
/// is unpinned when the group drops, on all exit paths.
pub struct EnsureGroup<'a> {
    vm: &'a Vm,
    task: TaskId,
    pages: Vec<Va>,
}

impl EnsureGroup<'_> {
    /// Fault `addr` in and pin it for the lifetime of the group.
    pub fn add(&mut self, addr: Va) -> Result<(), KernelError> {
        loop {
            self.vm.ensure(self.task, addr)?;
            let mut inner = self.vm.inner.lock().unwrap();
            let inner = &mut *inner;
            let task_vm = inner
                .tasks
                .get_mut(&self.task)
                .ok_or(KernelError::BadAddress)?;
            if !task_vm.page_table.is_mapped(addr) {
                // Evicted between the fault and the pin; fault again.
                continue;
            }
            let page = task_vm.pages.get_mut(&addr).ok_or(KernelError::BadAddress)?;
            page.pinned += 1;
            if page.pinned == 1 {
                inner.lru.remove(&(self.task, addr));
            }
            self.pages.push(addr);
            return Ok(());
        }
    }

    /// Unpin `addr` early, returning whether the group was holding it.
    pub fn remove(&mut self, addr: Va) -> bool {
        match self.pages.iter().position(|&a| a == addr) {
            Some(i) => {
                self.pages.swap_remove(i);
                self.vm.unpin(self.task, addr);
                true
            }
            None => false,
        }
    }
}

impl Drop for EnsureGroup<'_> {
    fn drop(&mut self) {
        for addr in self.pages.drain(..) {
            self.vm.unpin(self.task, addr);
        }
    }
}

fn check_addr(addr: Va) -> Result<(), KernelError> {
    assert!(addr.is_page_aligned(), "page operations take aligned addresses");
    if addr.0 < MIN_USER_ADDR {
        return Err(KernelError::BadAddress);
    }
    Ok(())
}
