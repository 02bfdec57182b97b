//! In-memory inodes.
//!
//! An [`Inode`] is the live handle for an on-disk file or directory,
//! identified by the sector of its head record. The filesystem keeps at most
//! one inode per sector in its open table; reopening a path yields the same
//! `Arc` with a bumped open count. When the open count reaches zero and the
//! inode is marked deleted, the on-disk sectors are released on close.

use crate::dev::Sector;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

static NEXT_INUM: AtomicU64 = AtomicU64::new(1);

/// Mutable inode metadata, updated under the filesystem's device lock.
pub(super) struct InodeMeta {
    /// File size in bytes, or number of entries for directories.
    pub length: usize,
    /// Number of open handles on this inode.
    pub open_count: usize,
    /// Number of handles that currently deny writes.
    pub deny_write_count: usize,
    /// Whether the inode will be deleted when the last handle closes.
    pub deleted: bool,
}

/// In-memory handle for an on-disk file or directory.
pub struct Inode {
    inum: u64,
    sector: Sector,
    parent: Sector,
    is_directory: bool,
    pub(super) meta: Mutex<InodeMeta>,
}

impl std::fmt::Debug for Inode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Inode")
            .field("inum", &self.inum)
            .field("sector", &self.sector)
            .field("parent", &self.parent)
            .field("is_directory", &self.is_directory)
            .finish()
    }
}

impl Inode {
    pub(super) fn new(sector: Sector, parent: Sector, is_directory: bool, length: usize) -> Self {
        let inum = NEXT_INUM.fetch_add(1, Ordering::Relaxed);
        if inum == u64::MAX {
            log::warn!("inode numbers flew over, expect errors");
        }
        Self {
            inum,
            sector,
            parent,
            is_directory,
            meta: Mutex::new(InodeMeta {
                length,
                open_count: 0,
                deny_write_count: 0,
                deleted: false,
            }),
        }
    }

    /// Instance-unique inode number.
    pub fn inum(&self) -> u64 {
        self.inum
    }

    /// Sector of the inode's head record.
    pub fn sector(&self) -> Sector {
        self.sector
    }

    /// Sector of the parent directory's record; the header sector for the
    /// root directory.
    pub fn parent(&self) -> Sector {
        self.parent
    }

    /// Whether the inode is a directory.
    pub fn is_directory(&self) -> bool {
        self.is_directory
    }

    /// File size in bytes, or entry count for directories.
    pub fn length(&self) -> usize {
        self.meta.lock().unwrap().length
    }

    /// Number of open handles.
    pub fn open_count(&self) -> usize {
        self.meta.lock().unwrap().open_count
    }

    /// Number of handles currently denying writes.
    pub fn deny_write_count(&self) -> usize {
        self.meta.lock().unwrap().deny_write_count
    }

    /// Whether the inode is scheduled for deletion at last close.
    pub fn is_deleted(&self) -> bool {
        self.meta.lock().unwrap().deleted
    }
}
