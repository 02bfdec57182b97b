//! On-disk layout of the filesystem.
//!
//! Every on-disk record is exactly one 512-byte sector and begins with a
//! 4-byte ASCII magic: `"PIFS"` for the header, `"FLDR"` for a directory,
//! `"FILE"` for a file. The records in this module match the packed binary
//! layout byte for byte; they are loaded from and stored to cache pages with
//! unaligned copies. All multi-byte fields are little-endian.
//!
//! ```text
//! sector 0    Header   magic, root pointer, block count, used-sector bitmap
//! sector 1    Folder   root directory
//! sector n    Folder   entries + overflow pointer to the next chain sector
//! sector m    File     length, parent, attrs, extent list + overflow pointer
//! ```
//!
//! The magics are a debug aid against corruption, not a typing mechanism:
//! readers classify a sector with [`RecordKind`] and panic on records that
//! cannot exist at the place they were reached from.

use crate::dev::{Sector, SECTOR_SIZE};
use bitflags::bitflags;
use num_enum::TryFromPrimitive;

/// Maximum length of a file or directory name, in bytes.
pub const NAME_LENGTH: usize = 16;
/// Bytes of the used-sector bitmap inside the header.
pub const USED_MAP_BYTES: usize = 498;
/// Largest device the bitmap can describe, in sectors.
pub const MAX_SECTORS: usize = USED_MAP_BYTES * 8;
/// Directory entries per directory record.
pub const FOLDER_ENTRIES: usize = 25;
/// Extents per file record.
pub const FILE_EXTENTS: usize = 98;
/// Longest extent a single reference can describe, in sectors.
pub const EXTENT_MAX_SECTORS: usize = u8::MAX as usize;

/// The sector holding the [`Header`].
///
/// Must stay at zero: the code treats sector number 0 as the null pointer in
/// overflow and parent fields.
pub const HEADER_SECTOR: Sector = Sector(0);
/// The sector holding the root [`Folder`].
pub const ROOT_SECTOR: Sector = Sector(1);

/// Classification of an on-disk record by its leading magic word.
#[derive(Debug, Clone, Copy, Eq, PartialEq, TryFromPrimitive)]
#[repr(u32)]
pub enum RecordKind {
    /// `"PIFS"` — the filesystem header.
    Header = 0x5346_4950,
    /// `"FLDR"` — a directory record.
    Folder = 0x5244_4c46,
    /// `"FILE"` — a file record.
    File = 0x454c_4946,
}

impl RecordKind {
    /// Classify a raw sector by its magic word.
    pub fn of(buf: &[u8; SECTOR_SIZE]) -> Option<RecordKind> {
        let word = u32::from_le_bytes(buf[..4].try_into().unwrap());
        RecordKind::try_from(word).ok()
    }
}

bitflags! {
    /// File attribute bits. Reserved for the surrounding operating system's
    /// permission checks; the core stores them verbatim.
    pub struct FileAttrs: u8 {
        /// File may be read.
        const READABLE = 0b001;
        /// File may be written.
        const WRITABLE = 0b010;
        /// File may be executed.
        const EXECUTABLE = 0b100;
    }
}

/// A record that occupies exactly one sector.
///
/// Provides the unaligned load/store used to move records between cache
/// pages and memory. Implementors are packed structs whose every byte
/// pattern is a valid value.
pub trait Record: Copy {
    /// The record's magic word.
    const KIND: RecordKind;

    /// Load a record from a raw sector.
    fn from_bytes(buf: &[u8; SECTOR_SIZE]) -> Self {
        debug_assert_eq!(RecordKind::of(buf), Some(Self::KIND));
        unsafe { core::ptr::read_unaligned(buf.as_ptr() as *const Self) }
    }

    /// Store the record into a raw sector.
    fn store(&self, buf: &mut [u8; SECTOR_SIZE]) {
        unsafe {
            core::ptr::copy_nonoverlapping(
                self as *const Self as *const u8,
                buf.as_mut_ptr(),
                SECTOR_SIZE,
            )
        }
    }

    /// Whether the raw sector carries this record's magic.
    fn check(buf: &[u8; SECTOR_SIZE]) -> bool {
        RecordKind::of(buf) == Some(Self::KIND)
    }
}

/// The filesystem header, stored in sector 0.
#[repr(C, packed)]
#[derive(Clone, Copy)]
pub struct Header {
    /// `"PIFS"`.
    pub magic: [u8; 4],
    /// Could act as a pointer to an overflow bucket; always zero.
    pub reserved: u32,
    /// Sector of the root directory record.
    pub root_folder: u32,
    /// Number of sectors the device held at format time.
    pub block_count: u16,
    /// Used-sector bitmap; bit `n` set means sector `n` is allocated.
    pub used_map: [u8; USED_MAP_BYTES],
}

const_assert!(core::mem::size_of::<Header>() == SECTOR_SIZE);

impl Record for Header {
    const KIND: RecordKind = RecordKind::Header;
}

impl Header {
    /// A zeroed header carrying the magic.
    pub fn empty() -> Self {
        Self {
            magic: *b"PIFS",
            reserved: 0,
            root_folder: 0,
            block_count: 0,
            used_map: [0; USED_MAP_BYTES],
        }
    }
}

/// One name→sector binding inside a directory record.
#[repr(C, packed)]
#[derive(Clone, Copy)]
pub struct FolderEntry {
    /// The entry name, NUL-padded when shorter than [`NAME_LENGTH`].
    pub name: [u8; NAME_LENGTH],
    /// Sector of the child's record; never zero for a live entry.
    pub block: u32,
}

impl FolderEntry {
    /// Build an entry for `name`, which must fit [`NAME_LENGTH`] bytes.
    pub fn new(name: &[u8], block: Sector) -> Self {
        debug_assert!(!name.is_empty() && name.len() <= NAME_LENGTH);
        let mut bytes = [0; NAME_LENGTH];
        bytes[..name.len()].copy_from_slice(name);
        Self {
            name: bytes,
            block: block.into_u32(),
        }
    }

    /// Whether this entry binds `name`.
    pub fn matches(&self, name: &[u8]) -> bool {
        self.name[..name.len()] == *name
            && (name.len() == NAME_LENGTH || self.name[name.len()] == 0)
    }

    /// The entry name without NUL padding.
    pub fn name_bytes(&self) -> &[u8] {
        let len = self
            .name
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(NAME_LENGTH);
        &self.name[..len]
    }
}

/// A directory record: up to [`FOLDER_ENTRIES`] entries plus an overflow
/// pointer to the next record of the chain.
#[repr(C, packed)]
#[derive(Clone, Copy)]
pub struct Folder {
    /// `"FLDR"`.
    pub magic: [u8; 4],
    /// Next chained directory sector, or 0.
    pub extends: u32,
    /// Number of live entries in this record.
    pub entries_count: u8,
    /// The entries; only the first `entries_count` are meaningful.
    pub entries: [FolderEntry; FOLDER_ENTRIES],
    /// Padding.
    pub reserved: [u8; 3],
}

const_assert!(core::mem::size_of::<Folder>() == SECTOR_SIZE);

impl Record for Folder {
    const KIND: RecordKind = RecordKind::Folder;
}

impl Folder {
    /// An empty directory record carrying the magic.
    pub fn empty() -> Self {
        Self {
            magic: *b"FLDR",
            extends: 0,
            entries_count: 0,
            entries: [FolderEntry {
                name: [0; NAME_LENGTH],
                block: 0,
            }; FOLDER_ENTRIES],
            reserved: [0; 3],
        }
    }
}

/// A contiguous run of sectors recorded in a file record.
#[repr(C, packed)]
#[derive(Clone, Copy)]
pub struct ExtentRef {
    /// First sector of the run.
    pub start: u32,
    /// Number of sectors in the run; never zero for a live extent.
    pub count: u8,
}

/// A file record: length and parent in the head record, extents in the head
/// and any chained continuation records.
///
/// In continuation records only `magic`, `extends`, `extent_count` and
/// `extents` are meaningful.
#[repr(C, packed)]
#[derive(Clone, Copy)]
pub struct FileRecord {
    /// `"FILE"`.
    pub magic: [u8; 4],
    /// Continuation record holding further extents, or 0.
    pub extends: u32,
    /// File size in bytes.
    pub length: u32,
    /// Sector of the parent directory's record.
    pub folder: u32,
    /// Attribute bits, see [`FileAttrs`].
    pub attrs: u8,
    /// Number of live extents in this record.
    pub extent_count: u8,
    /// The extents; only the first `extent_count` are meaningful.
    pub extents: [ExtentRef; FILE_EXTENTS],
    /// Could act as a pointer to a long filename; always zero.
    pub reserved: u32,
}

const_assert!(core::mem::size_of::<FileRecord>() == SECTOR_SIZE);

impl Record for FileRecord {
    const KIND: RecordKind = RecordKind::File;
}

impl FileRecord {
    /// An empty file record carrying the magic.
    pub fn empty(parent: Sector) -> Self {
        Self {
            magic: *b"FILE",
            extends: 0,
            length: 0,
            folder: parent.into_u32(),
            attrs: (FileAttrs::READABLE | FileAttrs::WRITABLE).bits(),
            extent_count: 0,
            extents: [ExtentRef { start: 0, count: 0 }; FILE_EXTENTS],
            reserved: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_round_trip_through_sectors() {
        let mut folder = Folder::empty();
        folder.entries[0] = FolderEntry::new(b"boot", Sector(7));
        folder.entries_count = 1;
        folder.extends = 42;

        let mut buf = [0u8; SECTOR_SIZE];
        folder.store(&mut buf);
        assert_eq!(RecordKind::of(&buf), Some(RecordKind::Folder));

        let loaded = Folder::from_bytes(&buf);
        assert_eq!(loaded.entries_count, 1);
        assert_eq!({ loaded.extends }, 42);
        let entry = loaded.entries[0];
        assert!(entry.matches(b"boot"));
        assert_eq!({ entry.block }, 7);
    }

    #[test]
    fn entry_name_matching_respects_padding() {
        let entry = FolderEntry::new(b"swap.dsk", Sector(3));
        assert!(entry.matches(b"swap.dsk"));
        assert!(!entry.matches(b"swap.ds"));
        assert!(!entry.matches(b"swap.dsk2"));
        assert_eq!(entry.name_bytes(), b"swap.dsk");

        let full = FolderEntry::new(b"sixteen-byte-nam", Sector(4));
        assert!(full.matches(b"sixteen-byte-nam"));
        assert_eq!(full.name_bytes(), b"sixteen-byte-nam");
    }

    #[test]
    fn magic_classification_rejects_noise() {
        let buf = [0u8; SECTOR_SIZE];
        assert_eq!(RecordKind::of(&buf), None);

        let mut buf = [0u8; SECTOR_SIZE];
        Header::empty().store(&mut buf);
        assert!(Header::check(&buf));
        assert!(!Folder::check(&buf));
    }
}
