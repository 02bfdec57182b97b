//! # PIFS, the flat on-disk filesystem.
//!
//! PIFS stores hierarchical directories and extent-mapped files on a sector
//! device, reached exclusively through the block cache. The on-disk shape is
//! deliberately small: one header sector with a free-sector bitmap, one
//! record per directory or file, and overflow chaining when a record's
//! fixed capacity runs out (26th directory entry, 99th file extent).
//!
//! All paths are absolute and delivered canonical; names are case-sensitive
//! and at most 16 bytes; a trailing `/` requires the path to resolve to a
//! directory. Creation happens during [`Pifs::open`], steered by
//! [`OpenOptions`]; deep creation of missing intermediate directories is not
//! supported.
//!
//! Deletion is deferred: [`Pifs::delete_file`] and [`Pifs::delete_folder`]
//! unlink the name immediately, but the record's sectors and bitmap bits are
//! released only when the last open handle is closed.
//!
//! Every operation acquires the per-device reader/writer lock: lookups and
//! reads run in parallel, creation/deletion/writes exclude everything else.
//! Record I/O respects the cache's one-lease-per-thread contract by copying
//! records out of the cache, mutating them in memory, and storing them back
//! through a fresh lease.

pub mod file;
pub mod inode;
pub mod layout;

pub use self::file::File;
pub use self::inode::Inode;

use crate::cache::BlockCache;
use crate::dev::{Sector, SECTOR_SIZE};
use crate::{bitset, KernelError};
use self::layout::{
    ExtentRef, FileRecord, Folder, FolderEntry, Header, Record, RecordKind, EXTENT_MAX_SECTORS,
    FILE_EXTENTS, FOLDER_ENTRIES, HEADER_SECTOR, MAX_SECTORS, NAME_LENGTH, ROOT_SECTOR,
};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

const MASK_NO: u8 = 0b0001;
const MASK_MUST: u8 = 0b0010;
const MASK_FILE: u8 = 0b0100;
const MASK_FOLDER: u8 = 0b1000;

/// How [`Pifs::open`] treats the terminal path segment.
///
/// The discriminants carry the mask bits the syscall layer hands down:
/// `NO` forbids creation, `MUST` requires it, `FILE`/`FOLDER` pin the kind.
#[derive(Debug, Clone, Copy, Eq, PartialEq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum OpenOptions {
    /// Open whatever exists; never create.
    NoCreate = 0b0001,
    /// Open a file, creating it if missing.
    FileMayCreate = 0b0100,
    /// Open an existing file.
    FileNoCreate = 0b0101,
    /// Create a file; fail if the path exists.
    FileMustCreate = 0b0110,
    /// Open a directory, creating it if missing.
    FolderMayCreate = 0b1000,
    /// Open an existing directory.
    FolderNoCreate = 0b1001,
    /// Create a directory; fail if the path exists.
    FolderMustCreate = 0b1010,
}

impl OpenOptions {
    #[inline]
    fn mask(self) -> u8 {
        self.into()
    }

    #[inline]
    fn no_create(self) -> bool {
        self.mask() & MASK_NO != 0
    }

    #[inline]
    fn must_create(self) -> bool {
        self.mask() & MASK_MUST != 0
    }

    #[inline]
    fn wants_file(self) -> bool {
        self.mask() & MASK_FILE != 0
    }

    #[inline]
    fn wants_folder(self) -> bool {
        self.mask() & MASK_FOLDER != 0
    }
}

// Result of walking a path down the directory tree.
enum Traversal<'p> {
    // The full path resolved to `sector`, child of `parent`.
    Found { sector: Sector, parent: Sector },
    // Everything up to `parent` resolved; `rest` (no leading slash) did not.
    Missing { parent: Sector, rest: &'p str },
}

struct PifsInner {
    cache: Arc<BlockCache>,
    open_inodes: BTreeMap<Sector, Arc<Inode>>,
}

/// A mounted PIFS device.
///
/// Wrap it in an [`Arc`] to share between the filesystem consumers; the
/// embedded reader/writer lock linearizes all operations on the device.
pub struct Pifs {
    inner: RwLock<PifsInner>,
}

impl Pifs {
    /// Mount the filesystem living on `cache`'s device.
    ///
    /// No on-disk state is touched; run [`Pifs::sanity_check`] to validate
    /// an existing filesystem or [`Pifs::format`] to create one.
    pub fn new(cache: Arc<BlockCache>) -> Self {
        Self {
            inner: RwLock::new(PifsInner {
                cache,
                open_inodes: BTreeMap::new(),
            }),
        }
    }

    /// Write a fresh, empty filesystem onto the device.
    ///
    /// Zeroes the header, sizes the bitmap from the device, marks the header
    /// and root sectors used, and initializes the root directory.
    pub fn format(&self) -> Result<(), KernelError> {
        let inner = self.inner.write().unwrap();
        let device_sectors = inner.cache.device().sector_count() as usize;
        if device_sectors <= ROOT_SECTOR.into_u32() as usize {
            return Err(KernelError::NotSupportedOperation);
        }
        let blocks = device_sectors.min(MAX_SECTORS);
        if blocks < device_sectors {
            log::warn!(
                "pifs: device has {} sectors, bitmap covers {}; tail is unused",
                device_sectors,
                blocks
            );
        }

        let mut header = Header::empty();
        header.block_count = blocks as u16;
        header.root_folder = ROOT_SECTOR.into_u32();
        bitset::mark(&mut header.used_map, HEADER_SECTOR.into_u32() as usize);
        bitset::mark(&mut header.used_map, ROOT_SECTOR.into_u32() as usize);
        inner.store_record(HEADER_SECTOR, &header)?;
        inner.store_record(ROOT_SECTOR, &Folder::empty())?;

        log::info!("pifs: formatted device with {} sectors", blocks);
        Ok(())
    }

    /// Verify the header magic and the root-folder pointer.
    pub fn sanity_check(&self) -> Result<(), KernelError> {
        let inner = self.inner.read().unwrap();
        let buf = inner.read_raw(HEADER_SECTOR)?;
        if !Header::check(&buf) {
            return Err(KernelError::FilesystemCorrupted("bad header magic"));
        }
        let header = Header::from_bytes(&buf);
        let root = header.root_folder;
        let blocks = header.block_count;
        if root == 0 || root as usize >= blocks as usize {
            return Err(KernelError::FilesystemCorrupted("bad root pointer"));
        }
        Ok(())
    }

    /// Flush every dirty cached sector to the device.
    pub fn flush(&self) -> Result<(), KernelError> {
        self.inner.read().unwrap().cache.flush_all()
    }

    /// Number of set bits in the used-sector bitmap.
    pub fn used_sector_count(&self) -> Result<usize, KernelError> {
        let inner = self.inner.read().unwrap();
        let header = inner.header()?;
        Ok(bitset::count_ones(
            &header.used_map,
            header.block_count as usize,
        ))
    }

    /// Open `path`, possibly creating its terminal segment, and return its
    /// inode with the open count bumped.
    ///
    /// See [`OpenOptions`] for the creation contract. Missing intermediate
    /// directories are never created.
    pub fn open(&self, path: &str, opts: OpenOptions) -> Result<Arc<Inode>, KernelError> {
        if !path.starts_with('/') {
            return Err(KernelError::InvalidArgument);
        }
        let trailing_slash = path.len() > 1 && path.ends_with('/');

        let mut inner = self.inner.write().unwrap();
        let root = Sector(inner.header()?.root_folder);
        match inner.traverse(root, path)? {
            Traversal::Found { sector, parent } => {
                if opts.must_create() {
                    return Err(KernelError::FileExist);
                }
                let buf = inner.read_raw(sector)?;
                let is_dir = match RecordKind::of(&buf) {
                    Some(RecordKind::Folder) => true,
                    Some(RecordKind::File) => false,
                    _ => panic!(
                        "sector {} of the filesystem is messed up",
                        sector.into_u32()
                    ),
                };
                if is_dir {
                    if opts.wants_file() {
                        return Err(KernelError::IsDirectory);
                    }
                } else if opts.wants_folder() || trailing_slash {
                    return Err(KernelError::NotDirectory);
                }
                let inode = match inner.open_inodes.get(&sector) {
                    Some(inode) => inode.clone(),
                    None => {
                        let inode = Arc::new(inner.scan_inode(sector, parent)?);
                        inner.open_inodes.insert(sector, inode.clone());
                        inode
                    }
                };
                inode.meta.lock().unwrap().open_count += 1;
                Ok(inode)
            }
            Traversal::Missing { parent, rest } => {
                if opts.no_create() {
                    return Err(KernelError::NoSuchEntry);
                }
                // Only "name" or "name/" may remain; "mkdir -p" is not
                // supported.
                let (name, tail) = match rest.split_once('/') {
                    Some((name, tail)) => (name, tail),
                    None => (rest, ""),
                };
                if !tail.is_empty() {
                    return Err(KernelError::NoSuchEntry);
                }
                let make_folder = opts.wants_folder() || rest.ends_with('/');
                if opts.wants_file() && make_folder {
                    return Err(KernelError::InvalidArgument);
                }
                if name.len() > NAME_LENGTH {
                    return Err(KernelError::NameTooLong);
                }

                let sector = inner.create_node(parent, name.as_bytes(), make_folder)?;
                let inode = Arc::new(Inode::new(sector, parent, make_folder, 0));
                inode.meta.lock().unwrap().open_count = 1;
                inner.open_inodes.insert(sector, inode.clone());
                Ok(inode)
            }
        }
    }

    /// Reopen an inode that is already open, bumping its open count.
    pub fn reopen(&self, inode: &Arc<Inode>) {
        let mut meta = inode.meta.lock().unwrap();
        assert!(meta.open_count > 0, "reopen of a closed inode");
        meta.open_count += 1;
    }

    /// Close one handle on `inode`.
    ///
    /// When the open count reaches zero the inode leaves the open table; if
    /// it was marked deleted, its record chain and data sectors are released
    /// and the bitmap bits cleared.
    pub fn close(&self, inode: &Arc<Inode>) -> Result<(), KernelError> {
        let mut inner = self.inner.write().unwrap();
        let (last, deleted) = {
            let mut meta = inode.meta.lock().unwrap();
            assert!(meta.open_count > 0, "close of a closed inode");
            meta.open_count -= 1;
            (meta.open_count == 0, meta.deleted)
        };
        if !last {
            return Ok(());
        }
        inner.open_inodes.remove(&inode.sector());
        if deleted {
            log::debug!(
                "pifs: releasing sectors of deleted inode {} (sector {})",
                inode.inum(),
                inode.sector().into_u32()
            );
            inner.release_sectors(inode)?;
        }
        Ok(())
    }

    /// Read up to `dest.len()` bytes starting at byte `offset`.
    ///
    /// Returns the number of bytes read, which is short at end of file.
    pub fn read(
        &self,
        inode: &Inode,
        offset: usize,
        dest: &mut [u8],
    ) -> Result<usize, KernelError> {
        let inner = self.inner.read().unwrap();
        if inode.is_directory() {
            return Err(KernelError::IsDirectory);
        }
        let length = inode.length();
        if offset >= length || dest.is_empty() {
            return Ok(0);
        }
        let n = dest.len().min(length - offset);
        let sectors = inner.data_sectors(inode.sector())?;

        let mut copied = 0;
        while copied < n {
            let pos = offset + copied;
            let (index, in_sector) = (pos / SECTOR_SIZE, pos % SECTOR_SIZE);
            let chunk = (SECTOR_SIZE - in_sector).min(n - copied);
            let lease = inner.cache.read(sectors[index])?;
            dest[copied..copied + chunk]
                .copy_from_slice(&lease.data().bytes[in_sector..in_sector + chunk]);
            drop(lease);
            copied += chunk;
        }
        Ok(n)
    }

    /// Write `src` starting at byte `offset`, extending the file as needed.
    ///
    /// Extension allocates sectors from the header bitmap, merging into the
    /// last extent when contiguous and spilling extents into continuation
    /// records past the per-record limit. A gap between the current end of
    /// file and `offset` is zero-filled. Returns the number of bytes
    /// written; allocation failure yields a short count, and a write-denied
    /// inode yields zero.
    pub fn write(&self, inode: &Inode, offset: usize, src: &[u8]) -> Result<usize, KernelError> {
        let inner = self.inner.write().unwrap();
        if inode.is_directory() {
            return Err(KernelError::IsDirectory);
        }
        if src.is_empty() {
            return Ok(0);
        }
        if inode.deny_write_count() > 0 {
            return Ok(0);
        }

        let length = inode.length();
        let mut chain = inner.load_file_chain(inode.sector())?;
        let mut sectors = flatten_extents(&chain);

        // Grow the sector map to cover the write: take all the missing
        // sectors from the bitmap in one pass, then thread them onto the
        // extent list, zeroing each so gap bytes read back as zeros. A
        // shortfall leaves the write short.
        let wanted = (offset + src.len()).div_ceil(SECTOR_SIZE);
        if sectors.len() < wanted {
            let mut fresh = Vec::new();
            inner.with_header_mut(|header| {
                bitset::find_and_set(
                    &mut header.used_map,
                    header.block_count as usize,
                    wanted - sectors.len(),
                    |n| fresh.push(Sector(n as u32)),
                );
            })?;

            let mut unused = Vec::new();
            let mut fresh = fresh.into_iter();
            for sector in fresh.by_ref() {
                if !inner.append_sector(&mut chain, sector)? {
                    // No room for a continuation record.
                    unused.push(sector);
                    break;
                }
                inner.zero_sector(sector)?;
                sectors.push(sector);
            }
            unused.extend(fresh);
            if !unused.is_empty() {
                inner.free_sectors(&unused)?;
            }
        }

        let capacity = sectors.len() * SECTOR_SIZE;
        let end = (offset + src.len()).min(capacity);
        if end <= offset {
            inner.store_file_chain(&chain)?;
            return Ok(0);
        }

        let mut copied = 0;
        while offset + copied < end {
            let pos = offset + copied;
            let (index, in_sector) = (pos / SECTOR_SIZE, pos % SECTOR_SIZE);
            let chunk = (SECTOR_SIZE - in_sector).min(end - pos);
            let lease = if chunk == SECTOR_SIZE {
                inner.cache.write(sectors[index])?
            } else {
                inner.cache.read(sectors[index])?
            };
            {
                let mut data = lease.data();
                data.bytes[in_sector..in_sector + chunk]
                    .copy_from_slice(&src[copied..copied + chunk]);
                data.dirty = true;
            }
            drop(lease);
            copied += chunk;
        }

        let new_length = length.max(end);
        chain[0].1.length = new_length as u32;
        inner.store_file_chain(&chain)?;
        inode.meta.lock().unwrap().length = new_length;
        Ok(copied)
    }

    /// Return the `index`-th entry name of a directory, in iteration order
    /// across its overflow chain, or `None` past the end.
    pub fn readdir(&self, inode: &Inode, index: usize) -> Result<Option<String>, KernelError> {
        let inner = self.inner.read().unwrap();
        if !inode.is_directory() {
            return Err(KernelError::NotDirectory);
        }
        let mut cur = inode.sector();
        let mut skip = index;
        loop {
            let folder = inner.load_folder(cur)?;
            let count = folder.entries_count as usize;
            if skip < count {
                let entry = folder.entries[skip];
                return Ok(Some(
                    String::from_utf8_lossy(entry.name_bytes()).into_owned(),
                ));
            }
            skip -= count;
            if folder.extends == 0 {
                return Ok(None);
            }
            cur = Sector(folder.extends);
        }
    }

    /// Mark a file deleted and unlink its directory entry.
    ///
    /// The name disappears immediately; sectors are released when the last
    /// open handle closes.
    pub fn delete_file(&self, inode: &Arc<Inode>) -> Result<(), KernelError> {
        if inode.is_directory() {
            return Err(KernelError::IsDirectory);
        }
        let mut inner = self.inner.write().unwrap();
        inner.unlink(inode)
    }

    /// Mark a directory deleted and unlink it from its parent.
    ///
    /// Succeeds only for an empty, non-root directory.
    pub fn delete_folder(&self, inode: &Arc<Inode>) -> Result<(), KernelError> {
        if !inode.is_directory() {
            return Err(KernelError::NotDirectory);
        }
        let mut inner = self.inner.write().unwrap();
        if inode.sector() == Sector(inner.header()?.root_folder) {
            return Err(KernelError::Busy);
        }
        if inode.length() != 0 {
            return Err(KernelError::DirectoryNotEmpty);
        }
        inner.unlink(inode)
    }

    // Convenience methods:

    /// Create an empty file at `path`.
    pub fn create_file(&self, path: &str) -> Result<(), KernelError> {
        let inode = self.open(path, OpenOptions::FileMustCreate)?;
        self.close(&inode)
    }

    /// Create an empty directory at `path`.
    pub fn create_folder(&self, path: &str) -> Result<(), KernelError> {
        let inode = self.open(path, OpenOptions::FolderMustCreate)?;
        self.close(&inode)
    }

    /// Delete the file at `path`.
    pub fn delete_file_path(&self, path: &str) -> Result<(), KernelError> {
        let inode = self.open(path, OpenOptions::FileNoCreate)?;
        let result = self.delete_file(&inode);
        self.close(&inode)?;
        result
    }

    /// Delete the directory at `path`.
    pub fn delete_folder_path(&self, path: &str) -> Result<(), KernelError> {
        let inode = self.open(path, OpenOptions::FolderNoCreate)?;
        let result = self.delete_folder(&inode);
        self.close(&inode)?;
        result
    }

    /// Whether `path` resolves to anything.
    pub fn exists(&self, path: &str) -> bool {
        match self.open(path, OpenOptions::NoCreate) {
            Ok(inode) => {
                let _ = self.close(&inode);
                true
            }
            Err(_) => false,
        }
    }

    /// Length of the file at `path`, in bytes.
    pub fn length_of(&self, path: &str) -> Result<usize, KernelError> {
        let inode = self.open(path, OpenOptions::FileNoCreate)?;
        let length = inode.length();
        self.close(&inode)?;
        Ok(length)
    }
}

impl PifsInner {
    fn read_raw(&self, sector: Sector) -> Result<[u8; SECTOR_SIZE], KernelError> {
        let mut buf = [0; SECTOR_SIZE];
        self.cache.read_in(sector, &mut buf)?;
        Ok(buf)
    }

    fn store_record<R: Record>(&self, sector: Sector, record: &R) -> Result<(), KernelError> {
        let lease = self.cache.write(sector)?;
        let mut data = lease.data();
        record.store(&mut data.bytes);
        data.dirty = true;
        Ok(())
    }

    fn zero_sector(&self, sector: Sector) -> Result<(), KernelError> {
        let lease = self.cache.write(sector)?;
        let mut data = lease.data();
        data.bytes = [0; SECTOR_SIZE];
        data.dirty = true;
        Ok(())
    }

    fn load_folder(&self, sector: Sector) -> Result<Folder, KernelError> {
        let buf = self.read_raw(sector)?;
        if !Folder::check(&buf) {
            panic!(
                "sector {} of the filesystem is messed up",
                sector.into_u32()
            );
        }
        let folder = Folder::from_bytes(&buf);
        if folder.entries_count as usize > FOLDER_ENTRIES {
            panic!(
                "sector {} of the filesystem is messed up",
                sector.into_u32()
            );
        }
        Ok(folder)
    }

    fn load_file_record(&self, sector: Sector) -> Result<FileRecord, KernelError> {
        let buf = self.read_raw(sector)?;
        if !FileRecord::check(&buf) {
            panic!(
                "sector {} of the filesystem is messed up",
                sector.into_u32()
            );
        }
        let record = FileRecord::from_bytes(&buf);
        if record.extent_count as usize > FILE_EXTENTS {
            panic!(
                "sector {} of the filesystem is messed up",
                sector.into_u32()
            );
        }
        Ok(record)
    }

    fn header(&self) -> Result<Header, KernelError> {
        let buf = self.read_raw(HEADER_SECTOR)?;
        if !Header::check(&buf) {
            panic!("filesystem header is messed up");
        }
        Ok(Header::from_bytes(&buf))
    }

    fn with_header_mut<T>(
        &self,
        f: impl FnOnce(&mut Header) -> T,
    ) -> Result<T, KernelError> {
        let lease = self.cache.read(HEADER_SECTOR)?;
        let mut data = lease.data();
        if !Header::check(&data.bytes) {
            panic!("filesystem header is messed up");
        }
        let mut header = Header::from_bytes(&data.bytes);
        let result = f(&mut header);
        header.store(&mut data.bytes);
        data.dirty = true;
        Ok(result)
    }

    // Allocate one sector from the header bitmap; `None` when the device is
    // full.
    fn alloc_sector(&self) -> Result<Option<Sector>, KernelError> {
        self.with_header_mut(|header| {
            bitset::find_and_set_one(&mut header.used_map, header.block_count as usize)
                .map(|n| Sector(n as u32))
        })
    }

    fn free_sectors(&self, sectors: &[Sector]) -> Result<(), KernelError> {
        self.with_header_mut(|header| {
            for sector in sectors {
                bitset::reset(&mut header.used_map, sector.into_u32() as usize);
            }
        })
    }

    // Walk `path` (absolute) down from the root.
    fn traverse<'p>(
        &self,
        root: Sector,
        path: &'p str,
    ) -> Result<Traversal<'p>, KernelError> {
        let mut cur = root;
        let mut parent = HEADER_SECTOR;
        let mut rest = &path[1..];
        loop {
            if rest.is_empty() {
                return Ok(Traversal::Found {
                    sector: cur,
                    parent,
                });
            }
            let remaining = rest;
            let (seg, tail) = match rest.split_once('/') {
                Some((seg, tail)) => (seg, tail),
                None => (rest, ""),
            };
            if seg.is_empty() {
                if tail.is_empty() {
                    // Trailing slash.
                    return Ok(Traversal::Found {
                        sector: cur,
                        parent,
                    });
                }
                return Err(KernelError::InvalidArgument);
            }
            if seg.len() > NAME_LENGTH {
                return Err(KernelError::NameTooLong);
            }

            let buf = self.read_raw(cur)?;
            match RecordKind::of(&buf) {
                Some(RecordKind::Folder) => {}
                Some(RecordKind::File) => return Err(KernelError::NotDirectory),
                _ => panic!(
                    "sector {} of the filesystem is messed up",
                    cur.into_u32()
                ),
            }
            match self.find_entry(cur, seg.as_bytes())? {
                Some(child) => {
                    parent = cur;
                    cur = child;
                    rest = tail;
                }
                None => {
                    return Ok(Traversal::Missing {
                        parent: cur,
                        rest: remaining,
                    })
                }
            }
        }
    }

    // Search the directory chain rooted at `folder` for `name`.
    fn find_entry(&self, folder: Sector, name: &[u8]) -> Result<Option<Sector>, KernelError> {
        let mut cur = folder;
        loop {
            let record = self.load_folder(cur)?;
            for i in 0..record.entries_count as usize {
                let entry = record.entries[i];
                if entry.matches(name) {
                    if entry.block == 0 {
                        panic!(
                            "sector {} of the filesystem is messed up",
                            cur.into_u32()
                        );
                    }
                    return Ok(Some(Sector(entry.block)));
                }
            }
            if record.extends == 0 {
                return Ok(None);
            }
            cur = Sector(record.extends);
        }
    }

    // Build the in-memory inode for an on-disk record, scanning kind and
    // length.
    fn scan_inode(&self, sector: Sector, parent: Sector) -> Result<Inode, KernelError> {
        let buf = self.read_raw(sector)?;
        match RecordKind::of(&buf) {
            Some(RecordKind::Folder) => {
                let mut length = 0;
                let mut cur = sector;
                loop {
                    let folder = self.load_folder(cur)?;
                    length += folder.entries_count as usize;
                    if folder.extends == 0 {
                        break;
                    }
                    cur = Sector(folder.extends);
                }
                Ok(Inode::new(sector, parent, true, length))
            }
            Some(RecordKind::File) => {
                let record = FileRecord::from_bytes(&buf);
                Ok(Inode::new(sector, parent, false, record.length as usize))
            }
            _ => panic!(
                "sector {} of the filesystem is messed up",
                sector.into_u32()
            ),
        }
    }

    // Create a file or folder record named `name` under `parent`.
    fn create_node(
        &mut self,
        parent: Sector,
        name: &[u8],
        is_dir: bool,
    ) -> Result<Sector, KernelError> {
        let sector = self.alloc_sector()?.ok_or(KernelError::NoSpace)?;
        if let Err(e) = self.insert_entry(parent, name, sector) {
            self.free_sectors(&[sector])?;
            return Err(e);
        }
        if is_dir {
            self.store_record(sector, &Folder::empty())?;
        } else {
            self.store_record(sector, &FileRecord::empty(parent))?;
        }
        if let Some(inode) = self.open_inodes.get(&parent) {
            inode.meta.lock().unwrap().length += 1;
        }
        Ok(sector)
    }

    // Add a directory entry, allocating an overflow record when the chain is
    // full.
    fn insert_entry(
        &self,
        folder: Sector,
        name: &[u8],
        child: Sector,
    ) -> Result<(), KernelError> {
        let mut cur = folder;
        loop {
            let mut record = self.load_folder(cur)?;
            let count = record.entries_count as usize;
            if count < FOLDER_ENTRIES {
                record.entries[count] = FolderEntry::new(name, child);
                record.entries_count += 1;
                return self.store_record(cur, &record);
            }
            if record.extends != 0 {
                cur = Sector(record.extends);
                continue;
            }
            // Chain is full: allocate the overflow record and link it in.
            let overflow = self.alloc_sector()?.ok_or(KernelError::NoSpace)?;
            let mut next = Folder::empty();
            next.entries[0] = FolderEntry::new(name, child);
            next.entries_count = 1;
            self.store_record(overflow, &next)?;
            record.extends = overflow.into_u32();
            return self.store_record(cur, &record);
        }
    }

    // Remove the entry binding `child` from the chain rooted at `folder`.
    fn remove_entry(&self, folder: Sector, child: Sector) -> Result<(), KernelError> {
        let mut cur = folder;
        loop {
            let mut record = self.load_folder(cur)?;
            let count = record.entries_count as usize;
            if let Some(i) = (0..count).position(|i| record.entries[i].block == child.into_u32())
            {
                record.entries[i] = record.entries[count - 1];
                record.entries_count -= 1;
                return self.store_record(cur, &record);
            }
            if record.extends == 0 {
                panic!(
                    "sector {} of the filesystem is messed up",
                    folder.into_u32()
                );
            }
            cur = Sector(record.extends);
        }
    }

    // Mark an inode deleted and drop its name from the parent directory.
    fn unlink(&mut self, inode: &Arc<Inode>) -> Result<(), KernelError> {
        {
            let mut meta = inode.meta.lock().unwrap();
            if meta.deleted {
                return Ok(());
            }
            meta.deleted = true;
        }
        self.open_inodes.remove(&inode.sector());
        self.remove_entry(inode.parent(), inode.sector())?;
        if let Some(parent) = self.open_inodes.get(&inode.parent()) {
            let mut meta = parent.meta.lock().unwrap();
            meta.length -= 1;
        }
        Ok(())
    }

    // Load the record chain of a file, head first.
    fn load_file_chain(
        &self,
        head: Sector,
    ) -> Result<Vec<(Sector, FileRecord)>, KernelError> {
        let mut chain = Vec::new();
        let mut cur = head;
        loop {
            let record = self.load_file_record(cur)?;
            let extends = record.extends;
            chain.push((cur, record));
            if extends == 0 {
                return Ok(chain);
            }
            cur = Sector(extends);
        }
    }

    fn store_file_chain(&self, chain: &[(Sector, FileRecord)]) -> Result<(), KernelError> {
        for (sector, record) in chain {
            self.store_record(*sector, record)?;
        }
        Ok(())
    }

    // Thread one pre-allocated data sector onto the extent list, merging
    // into the last extent when contiguous. `Ok(false)` when a continuation
    // record was needed but could not be allocated; the sector is then
    // still the caller's to release.
    fn append_sector(
        &self,
        chain: &mut Vec<(Sector, FileRecord)>,
        sector: Sector,
    ) -> Result<bool, KernelError> {
        let (_, last) = chain.last_mut().unwrap();
        let count = last.extent_count as usize;
        if count > 0 {
            let mut extent = last.extents[count - 1];
            if extent.start + extent.count as u32 == sector.into_u32()
                && (extent.count as usize) < EXTENT_MAX_SECTORS
            {
                extent.count += 1;
                last.extents[count - 1] = extent;
                return Ok(true);
            }
        }
        if count < FILE_EXTENTS {
            last.extents[count] = ExtentRef {
                start: sector.into_u32(),
                count: 1,
            };
            last.extent_count += 1;
            return Ok(true);
        }

        // The record is full: chain a continuation record. Its length and
        // folder fields are ignored.
        let overflow = match self.alloc_sector()? {
            Some(overflow) => overflow,
            None => return Ok(false),
        };
        let head_parent = chain[0].1.folder;
        let mut next = FileRecord::empty(Sector(head_parent));
        next.extents[0] = ExtentRef {
            start: sector.into_u32(),
            count: 1,
        };
        next.extent_count = 1;
        let (_, last) = chain.last_mut().unwrap();
        last.extends = overflow.into_u32();
        chain.push((overflow, next));
        Ok(true)
    }

    // All data sectors of a file, in file order.
    fn data_sectors(&self, head: Sector) -> Result<Vec<Sector>, KernelError> {
        let chain = self.load_file_chain(head)?;
        Ok(flatten_extents(&chain))
    }

    // Release every sector owned by a deleted inode: data extents and the
    // record chain for files, the record chain for directories.
    fn release_sectors(&self, inode: &Arc<Inode>) -> Result<(), KernelError> {
        let mut doomed = Vec::new();
        if inode.is_directory() {
            let mut cur = inode.sector();
            loop {
                let folder = self.load_folder(cur)?;
                doomed.push(cur);
                if folder.extends == 0 {
                    break;
                }
                cur = Sector(folder.extends);
            }
        } else {
            let chain = self.load_file_chain(inode.sector())?;
            doomed.extend(flatten_extents(&chain));
            doomed.extend(chain.iter().map(|(sector, _)| *sector));
        }
        self.free_sectors(&doomed)
    }
}

// Flatten a file's extent lists into the ordered data-sector map.
fn flatten_extents(chain: &[(Sector, FileRecord)]) -> Vec<Sector> {
    let mut sectors = Vec::new();
    for (_, record) in chain {
        for i in 0..record.extent_count as usize {
            let extent = record.extents[i];
            for off in 0..extent.count as u32 {
                sectors.push(Sector(extent.start + off));
            }
        }
    }
    sectors
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dev::MemDisk;

    fn fresh_fs(sectors: u32) -> Pifs {
        let cache = Arc::new(BlockCache::new(Arc::new(MemDisk::new(sectors)), 16));
        let fs = Pifs::new(cache);
        fs.format().unwrap();
        fs
    }

    #[test]
    fn format_and_sanity_check() {
        let fs = fresh_fs(4000);
        fs.sanity_check().unwrap();
        // Header and root.
        assert_eq!(fs.used_sector_count().unwrap(), 2);
    }

    #[test]
    fn format_clamps_oversized_devices_to_the_bitmap() {
        // 4000 sectors exceed the 3984-bit bitmap; the tail goes unused.
        let fs = fresh_fs(4000);
        fs.sanity_check().unwrap();

        let cache = Arc::new(BlockCache::new(Arc::new(MemDisk::new(1)), 4));
        let fs = Pifs::new(cache);
        assert_eq!(fs.format(), Err(KernelError::NotSupportedOperation));
    }

    #[test]
    fn root_opens_with_no_create() {
        let fs = fresh_fs(400);
        let root = fs.open("/", OpenOptions::NoCreate).unwrap();
        assert!(root.is_directory());
        assert_eq!(root.sector(), ROOT_SECTOR);
        fs.close(&root).unwrap();
    }

    #[test]
    fn file_write_read_round_trip() {
        let fs = fresh_fs(4000);
        let inode = fs.open("/foo", OpenOptions::FileMustCreate).unwrap();
        assert_eq!(fs.write(&inode, 0, b"hello").unwrap(), 5);
        fs.close(&inode).unwrap();

        let inode = fs.open("/foo", OpenOptions::NoCreate).unwrap();
        assert_eq!(inode.length(), 5);
        let mut buf = [0u8; 5];
        assert_eq!(fs.read(&inode, 0, &mut buf).unwrap(), 5);
        assert_eq!(&buf, b"hello");
        fs.close(&inode).unwrap();
    }

    #[test]
    fn reads_are_short_at_eof() {
        let fs = fresh_fs(400);
        let inode = fs.open("/f", OpenOptions::FileMustCreate).unwrap();
        fs.write(&inode, 0, b"abc").unwrap();
        let mut buf = [0u8; 16];
        assert_eq!(fs.read(&inode, 0, &mut buf).unwrap(), 3);
        assert_eq!(fs.read(&inode, 3, &mut buf).unwrap(), 0);
        assert_eq!(fs.read(&inode, 100, &mut buf).unwrap(), 0);
        fs.close(&inode).unwrap();
    }

    #[test]
    fn writes_cross_sector_boundaries() {
        let fs = fresh_fs(4000);
        let inode = fs.open("/big", OpenOptions::FileMustCreate).unwrap();
        let data: Vec<u8> = (0..3000u32).map(|i| (i % 251) as u8).collect();
        assert_eq!(fs.write(&inode, 0, &data).unwrap(), data.len());
        let mut out = vec![0u8; data.len()];
        assert_eq!(fs.read(&inode, 0, &mut out).unwrap(), data.len());
        assert_eq!(out, data);

        // Overwrite a range spanning the first sector boundary.
        fs.write(&inode, 500, &[0xee; 100]).unwrap();
        let mut out = [0u8; 100];
        fs.read(&inode, 500, &mut out).unwrap();
        assert_eq!(out, [0xee; 100]);
        fs.close(&inode).unwrap();
    }

    #[test]
    fn gap_writes_zero_fill() {
        let fs = fresh_fs(4000);
        let inode = fs.open("/gap", OpenOptions::FileMustCreate).unwrap();
        fs.write(&inode, 0, b"head").unwrap();
        fs.write(&inode, 1500, b"tail").unwrap();
        assert_eq!(inode.length(), 1504);

        let mut buf = vec![0xffu8; 1504];
        fs.read(&inode, 0, &mut buf).unwrap();
        assert_eq!(&buf[..4], b"head");
        assert!(buf[4..1500].iter().all(|&b| b == 0));
        assert_eq!(&buf[1500..], b"tail");
        fs.close(&inode).unwrap();
    }

    #[test]
    fn open_option_contract() {
        let fs = fresh_fs(4000);
        assert_eq!(
            fs.open("/nope", OpenOptions::NoCreate).unwrap_err(),
            KernelError::NoSuchEntry
        );
        assert_eq!(
            fs.open("/nope", OpenOptions::FileNoCreate).unwrap_err(),
            KernelError::NoSuchEntry
        );

        fs.create_file("/f").unwrap();
        assert_eq!(
            fs.open("/f", OpenOptions::FileMustCreate).unwrap_err(),
            KernelError::FileExist
        );
        assert_eq!(
            fs.open("/f", OpenOptions::FolderNoCreate).unwrap_err(),
            KernelError::NotDirectory
        );
        assert_eq!(
            fs.open("/f/", OpenOptions::NoCreate).unwrap_err(),
            KernelError::NotDirectory
        );

        fs.create_folder("/d").unwrap();
        assert_eq!(
            fs.open("/d", OpenOptions::FileNoCreate).unwrap_err(),
            KernelError::IsDirectory
        );
        let d = fs.open("/d/", OpenOptions::NoCreate).unwrap();
        assert!(d.is_directory());
        fs.close(&d).unwrap();

        // Deep creation is not supported.
        assert_eq!(
            fs.open("/x/y", OpenOptions::FileMayCreate).unwrap_err(),
            KernelError::NoSuchEntry
        );
        // Segment too long.
        assert_eq!(
            fs.open("/abcdefghijklmnopq", OpenOptions::FileMayCreate)
                .unwrap_err(),
            KernelError::NameTooLong
        );
    }

    #[test]
    fn nested_folders_resolve() {
        let fs = fresh_fs(4000);
        fs.create_folder("/a").unwrap();
        fs.create_folder("/a/b").unwrap();
        fs.create_file("/a/b/c").unwrap();
        assert!(fs.exists("/a/b/c"));

        let b = fs.open("/a/b", OpenOptions::FolderNoCreate).unwrap();
        assert_eq!(b.length(), 1);
        fs.close(&b).unwrap();

        // A file in the middle of a path is an error.
        assert_eq!(
            fs.open("/a/b/c/d", OpenOptions::NoCreate).unwrap_err(),
            KernelError::NotDirectory
        );
    }

    #[test]
    fn directory_overflow_preserves_iteration_order() {
        let fs = fresh_fs(4000);
        let names: Vec<String> = (0..26).map(|i| format!("f{:02}", i)).collect();
        for name in &names {
            fs.create_file(&format!("/{}", name)).unwrap();
        }
        let root = fs.open("/", OpenOptions::NoCreate).unwrap();
        assert_eq!(root.length(), 26);
        for (i, name) in names.iter().enumerate() {
            assert_eq!(fs.readdir(&root, i).unwrap().as_deref(), Some(name.as_str()));
        }
        assert_eq!(fs.readdir(&root, 26).unwrap(), None);
        fs.close(&root).unwrap();

        // All 26 still resolve by name, including the overflow entry.
        assert!(fs.exists("/f25"));
    }

    #[test]
    fn deferred_deletion_releases_sectors_at_last_close() {
        let fs = fresh_fs(4000);
        let inode = fs.open("/doomed", OpenOptions::FileMustCreate).unwrap();
        fs.write(&inode, 0, &[7u8; 2048]).unwrap();
        let used_before = fs.used_sector_count().unwrap();

        fs.delete_file_path("/doomed").unwrap();
        // Name is gone, sectors are not.
        assert!(!fs.exists("/doomed"));
        assert_eq!(fs.used_sector_count().unwrap(), used_before);

        fs.close(&inode).unwrap();
        // Record sector + 4 data sectors released.
        assert_eq!(fs.used_sector_count().unwrap(), used_before - 5);
    }

    #[test]
    fn folder_deletion_requires_empty_non_root() {
        let fs = fresh_fs(4000);
        fs.create_folder("/d").unwrap();
        fs.create_file("/d/f").unwrap();
        assert_eq!(
            fs.delete_folder_path("/d").unwrap_err(),
            KernelError::DirectoryNotEmpty
        );

        fs.delete_file_path("/d/f").unwrap();
        fs.delete_folder_path("/d").unwrap();
        assert!(!fs.exists("/d"));

        let root = fs.open("/", OpenOptions::NoCreate).unwrap();
        let err = fs.delete_folder(&root).unwrap_err();
        assert_eq!(err, KernelError::Busy);
        fs.close(&root).unwrap();
    }

    #[test]
    fn same_inode_for_concurrent_opens() {
        let fs = fresh_fs(400);
        fs.create_file("/shared").unwrap();
        let a = fs.open("/shared", OpenOptions::FileNoCreate).unwrap();
        let b = fs.open("/shared", OpenOptions::FileNoCreate).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.open_count(), 2);
        fs.close(&a).unwrap();
        fs.close(&b).unwrap();
    }

    #[test]
    fn bitmap_parity_matches_reachable_sectors() {
        let fs = fresh_fs(4000);
        fs.create_folder("/d").unwrap();
        for i in 0..30 {
            let path = format!("/d/f{:02}", i);
            let inode = fs.open(&path, OpenOptions::FileMustCreate).unwrap();
            fs.write(&inode, 0, &vec![i as u8; 600]).unwrap();
            fs.close(&inode).unwrap();
        }
        // header + root + /d record + overflow of /d + 30 * (record + 2 data)
        let expected = 2 + 1 + 1 + 30 * 3;
        assert_eq!(fs.used_sector_count().unwrap(), expected);
    }
}
