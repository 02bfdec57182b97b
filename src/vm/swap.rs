//! # Swap area.
//!
//! The swap area lives in a regular file of the filesystem (`swap.dsk`,
//! sized before boot); its length in pages bounds the swap capacity. A
//! bitmap tracks free slots, a per-slot record remembers which (task, user
//! address) the slot holds, and an LRU orders the slots whose page is
//! currently resident *and* clean — those still match memory, so under swap
//! pressure the least recently used one can be reclaimed without any I/O,
//! as long as the owner is told its page no longer has a swap copy.
//!
//! All slot bookkeeping happens in short critical sections under the area's
//! lock; the page-sized file I/O runs through the filesystem and the block
//! cache. The area denies writes to its file at initialization and briefly
//! allows them around its own slot writes, so foreign writers observe short
//! writes for the swap file's lifetime.

use super::{TaskId, Va};
use crate::fs::File;
use crate::lru::LruList;
use crate::{KernelError, PAGE_SIZE};
use std::collections::BTreeMap;
use std::sync::Mutex;

/// Name of the swap file, looked up at boot on the root filesystem.
pub const SWAP_FILE_NAME: &str = "/swap.dsk";

// A slot currently holding a page.
struct SlotRecord {
    owner: TaskId,
    base: Va,
}

struct SwapInner {
    file: File,
    slots: usize,
    used: Vec<u8>,
    records: Vec<Option<SlotRecord>>,
    // Slots whose page is resident and clean; reclaim candidates.
    clean_lru: LruList<usize>,
    by_owner: BTreeMap<(TaskId, Va), usize>,
}

/// A page's worth of swap that was reclaimed to satisfy an allocation.
///
/// The owner's logical page no longer has a swap copy; the VM manager must
/// flip it back from `Swapped` to `Resident` before a stale swap-in can
/// happen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reclaimed {
    /// Task that owned the reclaimed slot.
    pub owner: TaskId,
    /// Page-aligned user address the slot was holding.
    pub base: Va,
}

/// The swap area over its backing file.
pub struct SwapArea {
    inner: Mutex<SwapInner>,
}

impl SwapArea {
    /// Adopt `file` as the swap backing store.
    ///
    /// The file's length in pages bounds the swap capacity. Write denial is
    /// asserted for the area's lifetime.
    pub fn new(mut file: File) -> Self {
        file.deny_write();
        let slots = file.len() / PAGE_SIZE;
        log::info!("swap: {} slots ({} KiB)", slots, slots * PAGE_SIZE / 1024);
        Self {
            inner: Mutex::new(SwapInner {
                file,
                slots,
                used: vec![0; slots.div_ceil(8)],
                records: (0..slots).map(|_| None).collect(),
                clean_lru: LruList::new(),
                by_owner: BTreeMap::new(),
            }),
        }
    }

    /// Number of slots in the area.
    pub fn slots(&self) -> usize {
        self.inner.lock().unwrap().slots
    }

    /// Number of currently free slots.
    pub fn free_slots(&self) -> usize {
        let inner = self.inner.lock().unwrap();
        inner.slots - crate::bitset::count_ones(&inner.used, inner.slots)
    }

    /// Find slots for `src` (one per page), write the pages out, and record
    /// `owner`/`base` per slot.
    ///
    /// When no slot is free and a single page is requested, the least
    /// recently used clean swapped-in slot is reclaimed; `on_reclaim` runs
    /// before this call returns so the victim's state can be fixed up by the
    /// caller. Multi-page allocations never reclaim. Fails with `NoMemory`
    /// when the area is exhausted.
    pub fn alloc_and_write(
        &self,
        owner: TaskId,
        base: Va,
        src: &[u8],
        on_reclaim: impl FnOnce(Reclaimed),
    ) -> Result<(), KernelError> {
        debug_assert!(!src.is_empty());
        let pages = src.len().div_ceil(PAGE_SIZE);
        let mut inner = self.inner.lock().unwrap();
        debug_assert!(pages <= inner.slots.max(1));

        let start = match find_free_run(&inner.used, inner.slots, pages) {
            Some(start) => start,
            // Don't bother making room for multiple pages.
            None if pages == 1 => match inner.reclaim_one() {
                Some((slot, victim)) => {
                    on_reclaim(victim);
                    slot
                }
                None => return Err(KernelError::NoMemory),
            },
            None => return Err(KernelError::NoMemory),
        };
        for i in 0..pages {
            crate::bitset::mark(&mut inner.used, start + i);
        }

        inner.file.allow_write();
        let result = (|| {
            for i in 0..pages {
                let slot = start + i;
                let chunk = &src[i * PAGE_SIZE..src.len().min((i + 1) * PAGE_SIZE)];
                let wrote = inner.file.write_at(slot * PAGE_SIZE, chunk)?;
                if wrote != chunk.len() {
                    return Err(KernelError::IOError);
                }
            }
            Ok(())
        })();
        inner.file.deny_write();

        if let Err(e) = result {
            for i in 0..pages {
                crate::bitset::reset(&mut inner.used, start + i);
            }
            return Err(e);
        }

        for i in 0..pages {
            let slot = start + i;
            let page_base = Va(base.0 + i * PAGE_SIZE);
            let old = inner.by_owner.insert((owner, page_base), slot);
            debug_assert!(old.is_none(), "swap slot already owned for this page");
            inner.records[slot] = Some(SlotRecord {
                owner,
                base: page_base,
            });
        }
        Ok(())
    }

    /// Copy pages back from the owner's slots into `dest`.
    ///
    /// Each slot stays allocated and moves to the front of the clean
    /// swapped-in LRU: the page is resident again and still matches its
    /// slot.
    pub fn read_and_retain(
        &self,
        owner: TaskId,
        base: Va,
        dest: &mut [u8],
    ) -> Result<(), KernelError> {
        debug_assert!(!dest.is_empty());
        let pages = dest.len().div_ceil(PAGE_SIZE);
        let mut inner = self.inner.lock().unwrap();
        for i in 0..pages {
            let page_base = Va(base.0 + i * PAGE_SIZE);
            let slot = *inner
                .by_owner
                .get(&(owner, page_base))
                .ok_or(KernelError::BadAddress)?;
            let chunk_end = dest.len().min((i + 1) * PAGE_SIZE);
            let chunk = &mut dest[i * PAGE_SIZE..chunk_end];
            let read = inner.file.read_at(slot * PAGE_SIZE, chunk)?;
            if read != chunk.len() {
                return Err(KernelError::IOError);
            }
            inner.clean_lru.touch(slot);
        }
        Ok(())
    }

    /// Drop `pages` slots of `owner` starting at `base`, clearing their
    /// bitmap bits.
    ///
    /// Returns whether every slot was found.
    pub fn dispose(&self, owner: TaskId, base: Va, pages: usize) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let mut all = true;
        for i in 0..pages {
            let page_base = Va(base.0 + i * PAGE_SIZE);
            all &= inner.dispose_page(owner, page_base);
        }
        all
    }

    /// Note that the clean swapped-in page at (`owner`, `base`) was evicted
    /// from memory: its slot is now the only copy and leaves the reclaim
    /// LRU.
    pub fn mark_swapped_out(&self, owner: TaskId, base: Va) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(&slot) = inner.by_owner.get(&(owner, base)) {
            inner.clean_lru.remove(&slot);
        }
    }

    /// Dispose every slot owned by `owner`.
    pub fn clean(&self, owner: TaskId) {
        let mut inner = self.inner.lock().unwrap();
        let doomed: Vec<Va> = inner
            .by_owner
            .range((owner, Va(0))..=(owner, Va(usize::MAX)))
            .map(|(&(_, base), _)| base)
            .collect();
        for base in doomed {
            inner.dispose_page(owner, base);
        }
    }
}

impl SwapInner {
    // Reclaim the least recently used clean swapped-in slot.
    fn reclaim_one(&mut self) -> Option<(usize, Reclaimed)> {
        let slot = self.clean_lru.pop_least()?;
        let record = self.records[slot].take().expect("LRU slot has a record");
        self.by_owner.remove(&(record.owner, record.base));
        crate::bitset::reset(&mut self.used, slot);
        log::debug!(
            "swap: reclaimed clean slot {} of task {:?}",
            slot,
            record.owner
        );
        Some((
            slot,
            Reclaimed {
                owner: record.owner,
                base: record.base,
            },
        ))
    }

    fn dispose_page(&mut self, owner: TaskId, base: Va) -> bool {
        match self.by_owner.remove(&(owner, base)) {
            Some(slot) => {
                self.clean_lru.remove(&slot);
                self.records[slot] = None;
                crate::bitset::reset(&mut self.used, slot);
                true
            }
            None => false,
        }
    }
}

// First run of `run` consecutive free slots, if any.
fn find_free_run(used: &[u8], slots: usize, run: usize) -> Option<usize> {
    let mut len = 0;
    for i in 0..slots {
        if crate::bitset::get(used, i) {
            len = 0;
        } else {
            len += 1;
            if len == run {
                return Some(i + 1 - run);
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::BlockCache;
    use crate::dev::MemDisk;
    use crate::fs::{OpenOptions, Pifs};
    use std::sync::Arc;

    fn swap_with_slots(slots: usize) -> SwapArea {
        let cache = Arc::new(BlockCache::new(Arc::new(MemDisk::new(3000)), 32));
        let fs = Arc::new(Pifs::new(cache));
        fs.format().unwrap();
        let file = File::open(&fs, SWAP_FILE_NAME, OpenOptions::FileMustCreate).unwrap();
        file.write_at(0, &vec![0u8; slots * PAGE_SIZE]).unwrap();
        SwapArea::new(file)
    }

    fn page(byte: u8) -> Vec<u8> {
        vec![byte; PAGE_SIZE]
    }

    #[test]
    fn capacity_comes_from_the_file_length() {
        let swap = swap_with_slots(3);
        assert_eq!(swap.slots(), 3);
        assert_eq!(swap.free_slots(), 3);
    }

    #[test]
    fn write_then_read_retains_the_slot() {
        let swap = swap_with_slots(2);
        let (t, base) = (TaskId(1), Va(0x10000));
        swap.alloc_and_write(t, base, &page(0xab), |_| panic!("no reclaim"))
            .unwrap();
        assert_eq!(swap.free_slots(), 1);

        let mut buf = page(0);
        swap.read_and_retain(t, base, &mut buf).unwrap();
        assert_eq!(buf, page(0xab));
        // Still allocated: reading back again works.
        swap.read_and_retain(t, base, &mut buf).unwrap();
        assert_eq!(swap.free_slots(), 1);
    }

    #[test]
    fn dispose_frees_the_bitmap_bit() {
        let swap = swap_with_slots(2);
        let (t, base) = (TaskId(1), Va(0x10000));
        swap.alloc_and_write(t, base, &page(1), |_| {}).unwrap();
        assert!(swap.dispose(t, base, 1));
        assert!(!swap.dispose(t, base, 1));
        assert_eq!(swap.free_slots(), 2);
    }

    #[test]
    fn exhaustion_reclaims_the_lru_clean_slot() {
        let swap = swap_with_slots(2);
        let t = TaskId(1);
        let (a, b, c) = (Va(0x10000), Va(0x20000), Va(0x30000));
        swap.alloc_and_write(t, a, &page(1), |_| {}).unwrap();
        swap.alloc_and_write(t, b, &page(2), |_| {}).unwrap();

        // Swap both back in; `a` is the colder clean slot, then touch `a`
        // to make `b` the reclaim candidate.
        let mut buf = page(0);
        swap.read_and_retain(t, a, &mut buf).unwrap();
        swap.read_and_retain(t, b, &mut buf).unwrap();
        swap.read_and_retain(t, a, &mut buf).unwrap();

        let mut reclaimed = None;
        swap.alloc_and_write(t, c, &page(3), |r| reclaimed = Some(r))
            .unwrap();
        assert_eq!(
            reclaimed,
            Some(Reclaimed { owner: t, base: b }),
            "least recently used clean slot is the victim"
        );

        // The victim's slot now belongs to `c`.
        swap.read_and_retain(t, c, &mut buf).unwrap();
        assert_eq!(buf, page(3));
        assert!(swap.read_and_retain(t, b, &mut buf).is_err());
    }

    #[test]
    fn swapped_out_slots_are_not_reclaimable() {
        let swap = swap_with_slots(1);
        let t = TaskId(1);
        let (a, b) = (Va(0x10000), Va(0x20000));
        swap.alloc_and_write(t, a, &page(1), |_| {}).unwrap();

        let mut buf = page(0);
        swap.read_and_retain(t, a, &mut buf).unwrap();
        // `a` is evicted again while clean: its slot is the only copy.
        swap.mark_swapped_out(t, a);

        assert_eq!(
            swap.alloc_and_write(t, b, &page(2), |_| panic!("must not reclaim")),
            Err(KernelError::NoMemory)
        );
    }

    #[test]
    fn clean_drops_everything_of_one_owner() {
        let swap = swap_with_slots(4);
        let (t1, t2) = (TaskId(1), TaskId(2));
        swap.alloc_and_write(t1, Va(0x10000), &page(1), |_| {}).unwrap();
        swap.alloc_and_write(t1, Va(0x20000), &page(2), |_| {}).unwrap();
        swap.alloc_and_write(t2, Va(0x10000), &page(3), |_| {}).unwrap();

        swap.clean(t1);
        assert_eq!(swap.free_slots(), 3);

        let mut buf = page(0);
        swap.read_and_retain(t2, Va(0x10000), &mut buf).unwrap();
        assert_eq!(buf, page(3));
    }

    #[test]
    fn multi_page_writes_span_contiguous_slots() {
        let swap = swap_with_slots(4);
        let t = TaskId(1);
        let mut src = page(0xaa);
        src.extend_from_slice(&page(0xbb));
        swap.alloc_and_write(t, Va(0x10000), &src, |_| {}).unwrap();
        assert_eq!(swap.free_slots(), 2);

        let mut buf = page(0);
        swap.read_and_retain(t, Va(0x11000), &mut buf).unwrap();
        assert_eq!(buf, page(0xbb));
    }

    #[test]
    fn foreign_writes_to_the_swap_file_are_denied() {
        let cache = Arc::new(BlockCache::new(Arc::new(MemDisk::new(3000)), 32));
        let fs = Arc::new(Pifs::new(cache));
        fs.format().unwrap();
        let file = File::open(&fs, SWAP_FILE_NAME, OpenOptions::FileMustCreate).unwrap();
        file.write_at(0, &vec![0u8; 2 * PAGE_SIZE]).unwrap();
        let foreign = file.reopen();
        let swap = SwapArea::new(file);

        assert_eq!(foreign.write_at(0, b"intruder").unwrap(), 0);
        // The area itself still writes fine.
        swap.alloc_and_write(TaskId(1), Va(0x10000), &page(9), |_| {})
            .unwrap();
    }
}
