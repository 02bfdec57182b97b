//! Positioned file handles.
//!
//! A [`File`] couples an open inode with a cursor and a per-handle
//! deny-write mark. Handles on the same inode share its contents and its
//! deny-write count; `reopen` takes an independent cursor on the same inode.
//! Dropping a handle closes it, releasing any deny mark first.

use super::inode::Inode;
use super::{OpenOptions, Pifs};
use crate::KernelError;
use std::sync::Arc;

/// An open file with a cursor.
pub struct File {
    pifs: Arc<Pifs>,
    inode: Arc<Inode>,
    pos: usize,
    deny_write: bool,
    closed: bool,
}

impl std::fmt::Debug for File {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("File")
            .field("inode", &self.inode)
            .field("pos", &self.pos)
            .field("deny_write", &self.deny_write)
            .field("closed", &self.closed)
            .finish()
    }
}

impl File {
    /// Open `path` as a file with the given options.
    pub fn open(pifs: &Arc<Pifs>, path: &str, opts: OpenOptions) -> Result<File, KernelError> {
        let inode = pifs.open(path, opts)?;
        if inode.is_directory() {
            pifs.close(&inode)?;
            return Err(KernelError::IsDirectory);
        }
        Ok(File {
            pifs: pifs.clone(),
            inode,
            pos: 0,
            deny_write: false,
            closed: false,
        })
    }

    /// Open a new handle for the same inode as this one, with its own
    /// cursor at position zero.
    pub fn reopen(&self) -> File {
        self.pifs.reopen(&self.inode);
        File {
            pifs: self.pifs.clone(),
            inode: self.inode.clone(),
            pos: 0,
            deny_write: false,
            closed: false,
        }
    }

    /// The inode behind this handle.
    pub fn inode(&self) -> &Arc<Inode> {
        &self.inode
    }

    /// File size in bytes.
    pub fn len(&self) -> usize {
        self.inode.length()
    }

    /// Whether the file is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Read from the cursor, advancing it by the number of bytes read.
    pub fn read(&mut self, dest: &mut [u8]) -> Result<usize, KernelError> {
        let n = self.pifs.read(&self.inode, self.pos, dest)?;
        self.pos += n;
        Ok(n)
    }

    /// Read at `offset` without touching the cursor.
    pub fn read_at(&self, offset: usize, dest: &mut [u8]) -> Result<usize, KernelError> {
        self.pifs.read(&self.inode, offset, dest)
    }

    /// Write at the cursor, advancing it by the number of bytes written.
    pub fn write(&mut self, src: &[u8]) -> Result<usize, KernelError> {
        let n = self.pifs.write(&self.inode, self.pos, src)?;
        self.pos += n;
        Ok(n)
    }

    /// Write at `offset` without touching the cursor.
    pub fn write_at(&self, offset: usize, src: &[u8]) -> Result<usize, KernelError> {
        self.pifs.write(&self.inode, offset, src)
    }

    /// Move the cursor to `pos` bytes from the start of the file.
    pub fn seek(&mut self, pos: usize) {
        self.pos = pos;
    }

    /// The cursor position.
    pub fn tell(&self) -> usize {
        self.pos
    }

    /// Prevent write operations on the underlying inode until
    /// [`allow_write`] is called or this handle is closed.
    ///
    /// [`allow_write`]: File::allow_write
    pub fn deny_write(&mut self) {
        if !self.deny_write {
            self.deny_write = true;
            self.inode.meta.lock().unwrap().deny_write_count += 1;
        }
    }

    /// Re-enable write operations on the underlying inode.
    ///
    /// Writes might still be denied by some other handle on the same inode.
    pub fn allow_write(&mut self) {
        if self.deny_write {
            self.deny_write = false;
            let mut meta = self.inode.meta.lock().unwrap();
            assert!(meta.deny_write_count > 0);
            meta.deny_write_count -= 1;
        }
    }

    /// Close the handle, releasing its deny mark and open count.
    pub fn close(mut self) -> Result<(), KernelError> {
        self.do_close()
    }

    fn do_close(&mut self) -> Result<(), KernelError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.allow_write();
        self.pifs.close(&self.inode)
    }
}

impl Drop for File {
    fn drop(&mut self) {
        let _ = self.do_close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::BlockCache;
    use crate::dev::MemDisk;

    fn fresh_fs() -> Arc<Pifs> {
        let cache = Arc::new(BlockCache::new(Arc::new(MemDisk::new(1000)), 16));
        let fs = Arc::new(Pifs::new(cache));
        fs.format().unwrap();
        fs
    }

    #[test]
    fn cursor_advances_on_read_and_write() {
        let fs = fresh_fs();
        let mut f = File::open(&fs, "/f", OpenOptions::FileMustCreate).unwrap();
        assert_eq!(f.write(b"hello ").unwrap(), 6);
        assert_eq!(f.write(b"world").unwrap(), 5);
        assert_eq!(f.tell(), 11);
        assert_eq!(f.len(), 11);

        f.seek(0);
        let mut buf = [0u8; 11];
        assert_eq!(f.read(&mut buf).unwrap(), 11);
        assert_eq!(&buf, b"hello world");
        assert_eq!(f.read(&mut buf).unwrap(), 0);
        f.close().unwrap();
    }

    #[test]
    fn reopen_shares_the_inode_with_its_own_cursor() {
        let fs = fresh_fs();
        let mut a = File::open(&fs, "/f", OpenOptions::FileMustCreate).unwrap();
        a.write(b"shared").unwrap();

        let mut b = a.reopen();
        assert!(Arc::ptr_eq(a.inode(), b.inode()));
        assert_eq!(b.tell(), 0);
        let mut buf = [0u8; 6];
        assert_eq!(b.read(&mut buf).unwrap(), 6);
        assert_eq!(&buf, b"shared");
        assert_eq!(a.tell(), 6);
    }

    #[test]
    fn deny_write_makes_writes_short() {
        let fs = fresh_fs();
        let mut one = File::open(&fs, "/f", OpenOptions::FileMustCreate).unwrap();
        let mut two = one.reopen();

        one.deny_write();
        assert_eq!(two.write(b"refused").unwrap(), 0);
        assert_eq!(two.len(), 0);

        one.allow_write();
        assert_eq!(two.write(b"granted").unwrap(), 7);
        assert_eq!(two.len(), 7);
    }

    #[test]
    fn closing_a_denying_handle_releases_the_mark() {
        let fs = fresh_fs();
        let mut one = File::open(&fs, "/f", OpenOptions::FileMustCreate).unwrap();
        let two = one.reopen();

        one.deny_write();
        drop(one);
        assert_eq!(two.write_at(0, b"ok").unwrap(), 2);
    }

    #[test]
    fn directories_do_not_open_as_files() {
        let fs = fresh_fs();
        fs.create_folder("/d").unwrap();
        assert_eq!(
            File::open(&fs, "/d", OpenOptions::FolderNoCreate).unwrap_err(),
            KernelError::IsDirectory
        );
        // The failed open does not leak an open count.
        let d = fs.open("/d", OpenOptions::FolderNoCreate).unwrap();
        assert_eq!(d.open_count(), 1);
        fs.close(&d).unwrap();
    }
}
