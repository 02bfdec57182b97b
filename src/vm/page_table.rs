//! Emulated per-task page directory.
//!
//! The process page table is the authoritative map from user virtual
//! addresses to resident frames; the VM manager's logical pages are the
//! supplementary metadata. Entries carry the hardware-style flag bits the
//! eviction loop samples: ACCESSED is set on every touch through the
//! user-access helpers, DIRTY on every store.
//!
//! Mutations happen only inside the VM manager's critical section.

use super::frame::Frame;
use super::Va;
use bitflags::bitflags;
use std::collections::BTreeMap;

bitflags! {
    /// Flag bits of one page-table entry.
    pub struct PteFlags: u8 {
        /// The entry maps a frame.
        const PRESENT = 0b0001;
        /// Stores are allowed.
        const WRITABLE = 0b0010;
        /// The page was touched since the bit was last cleared.
        const ACCESSED = 0b0100;
        /// The page was written since the bit was last cleared.
        const DIRTY = 0b1000;
    }
}

struct Pte {
    frame: Frame,
    flags: PteFlags,
}

/// One task's address translations.
pub struct PageTable {
    entries: BTreeMap<Va, Pte>,
}

impl Default for PageTable {
    fn default() -> Self {
        Self::new()
    }
}

impl PageTable {
    /// An empty page table.
    pub fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }

    /// Install a translation from `va` to `frame`.
    ///
    /// The address must be page-aligned and not currently mapped.
    pub fn map(&mut self, va: Va, frame: Frame, writable: bool) {
        debug_assert!(va.is_page_aligned());
        let mut flags = PteFlags::PRESENT;
        if writable {
            flags |= PteFlags::WRITABLE;
        }
        let old = self.entries.insert(va, Pte { frame, flags });
        debug_assert!(old.is_none(), "double mapping of a user address");
    }

    /// Remove the translation for `va`, returning its frame.
    pub fn unmap(&mut self, va: Va) -> Option<Frame> {
        self.entries.remove(&va).map(|pte| pte.frame)
    }

    /// The frame `va` maps to, if any.
    pub fn lookup(&self, va: Va) -> Option<Frame> {
        self.entries.get(&va).map(|pte| pte.frame.clone())
    }

    /// Whether `va` is mapped.
    pub fn is_mapped(&self, va: Va) -> bool {
        self.entries.contains_key(&va)
    }

    /// Whether stores to `va` are allowed.
    pub fn is_writable(&self, va: Va) -> bool {
        self.entries
            .get(&va)
            .map(|pte| pte.flags.contains(PteFlags::WRITABLE))
            .unwrap_or(false)
    }

    /// Whether the DIRTY bit of `va` is set.
    pub fn is_dirty(&self, va: Va) -> bool {
        self.entries
            .get(&va)
            .map(|pte| pte.flags.contains(PteFlags::DIRTY))
            .unwrap_or(false)
    }

    /// Set or clear the DIRTY bit of `va`.
    pub fn set_dirty(&mut self, va: Va, dirty: bool) {
        if let Some(pte) = self.entries.get_mut(&va) {
            pte.flags.set(PteFlags::DIRTY, dirty);
        }
    }

    /// Whether the ACCESSED bit of `va` is set.
    pub fn is_accessed(&self, va: Va) -> bool {
        self.entries
            .get(&va)
            .map(|pte| pte.flags.contains(PteFlags::ACCESSED))
            .unwrap_or(false)
    }

    /// Set or clear the ACCESSED bit of `va`.
    pub fn set_accessed(&mut self, va: Va, accessed: bool) {
        if let Some(pte) = self.entries.get_mut(&va) {
            pte.flags.set(PteFlags::ACCESSED, accessed);
        }
    }

    /// Every mapped address, in order.
    pub fn mapped(&self) -> Vec<Va> {
        self.entries.keys().copied().collect()
    }

    /// Number of mapped addresses.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is mapped.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::super::frame::FramePool;
    use super::*;

    #[test]
    fn map_lookup_unmap() {
        let pool = FramePool::new(2);
        let mut pt = PageTable::new();
        let va = Va(0x20000);
        pt.map(va, pool.alloc_zeroed().unwrap(), true);

        assert!(pt.is_mapped(va));
        assert!(pt.is_writable(va));
        assert!(!pt.is_dirty(va));
        assert!(pt.lookup(va).is_some());
        assert_eq!(pt.mapped(), vec![va]);

        let frame = pt.unmap(va).unwrap();
        drop(frame);
        assert!(!pt.is_mapped(va));
        assert_eq!(pool.in_use(), 0);
    }

    #[test]
    fn flag_bits_toggle_independently() {
        let pool = FramePool::new(1);
        let mut pt = PageTable::new();
        let va = Va(0x30000);
        pt.map(va, pool.alloc_zeroed().unwrap(), false);

        pt.set_accessed(va, true);
        pt.set_dirty(va, true);
        assert!(pt.is_accessed(va) && pt.is_dirty(va));
        assert!(!pt.is_writable(va));

        pt.set_accessed(va, false);
        assert!(!pt.is_accessed(va) && pt.is_dirty(va));
        pt.set_dirty(va, false);
        assert!(!pt.is_dirty(va));
    }
}
