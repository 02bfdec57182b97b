//! # Memory-mapped files.
//!
//! A mapped file is shared by inode: all aliases of the same file — across
//! tasks and map ids — resolve their page faults to the same kernel-resident
//! frames (kpages), so stores through one alias are visible through every
//! other. One [`Region`] per inode owns a reopened file handle (an
//! independent cursor on the shared inode), the kpage map keyed by page
//! index, and the alias count; one alias per (owner, map id) records which
//! user pages it has bound.
//!
//! File I/O for mapped pages runs on a dedicated writer task: a queue
//! guarded by a semaphore counting queued work. Faults enqueue a `Read` with
//! a completion semaphore and wait; disposing the last alias of a dirty
//! kpage enqueues a `Write` that finishes asynchronously. The writer drains
//! a batch per wakeup, reaches the disk through the filesystem (taking the
//! per-device lock around each I/O), and exits when it dequeues the
//! shutdown task.
//!
//! Mapped pages never go to the swap area: their backing store is the file
//! itself, so they stay out of the swap-eviction LRU.

use super::frame::Frame;
use super::{PageState, TaskId, Va, Vm, VmInner, VmPage};
use crate::fs::File;
use crate::sync::Semaphore;
use crate::{KernelError, PAGE_SIZE};
use crossbeam_queue::SegQueue;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

/// Identifier of one alias of a mapped region, unique per manager.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd)]
pub struct MapId(pub u32);

enum IoKind {
    Read,
    Write,
}

enum WriterTask {
    Io {
        file: Arc<Mutex<File>>,
        page_num: usize,
        length: usize,
        frame: Frame,
        kind: IoKind,
        done: Option<Arc<Semaphore>>,
    },
    Barrier {
        done: Arc<Semaphore>,
    },
    Exit,
}

// One page of file contents, shared by every alias of the region.
struct Kpage {
    frame: Frame,
    dirty: bool,
    // Number of bound upages.
    refs: usize,
}

struct Region {
    file: Arc<Mutex<File>>,
    length: usize,
    kpages: BTreeMap<usize, Kpage>,
    alias_count: usize,
}

struct Upage {
    page_num: usize,
    // Whether a fault has bound this upage to a kpage.
    bound: bool,
}

struct Alias {
    region: crate::dev::Sector,
    upages: BTreeMap<Va, Upage>,
}

struct MmapState {
    regions: BTreeMap<crate::dev::Sector, Region>,
    aliases: BTreeMap<(TaskId, u32), Alias>,
    // (owner, user address) -> map id, for the fault path.
    upage_index: BTreeMap<(TaskId, Va), u32>,
    next_id: u32,
}

/// Bookkeeping and writer task of the mapped-file subsystem.
pub(crate) struct Mmap {
    state: Mutex<MmapState>,
    queue: Arc<SegQueue<WriterTask>>,
    pending: Arc<Semaphore>,
    writer: Mutex<Option<JoinHandle<()>>>,
}

impl Mmap {
    pub(crate) fn new() -> Self {
        let queue: Arc<SegQueue<WriterTask>> = Arc::new(SegQueue::new());
        let pending = Arc::new(Semaphore::new(0));
        let writer = {
            let (queue, pending) = (queue.clone(), pending.clone());
            std::thread::Builder::new()
                .name("mmap-writer".into())
                .spawn(move || writer_loop(queue, pending))
                .expect("spawning the mmap writer")
        };
        Self {
            state: Mutex::new(MmapState {
                regions: BTreeMap::new(),
                aliases: BTreeMap::new(),
                upage_index: BTreeMap::new(),
                next_id: 0,
            }),
            queue,
            pending,
            writer: Mutex::new(Some(writer)),
        }
    }

    fn enqueue(&self, task: WriterTask) {
        self.queue.push(task);
        self.pending.signal();
    }
}

impl Drop for Mmap {
    fn drop(&mut self) {
        self.enqueue(WriterTask::Exit);
        if let Some(writer) = self.writer.lock().unwrap().take() {
            let _ = writer.join();
        }
    }
}

fn writer_loop(queue: Arc<SegQueue<WriterTask>>, pending: Arc<Semaphore>) {
    log::debug!("mmap writer running");
    loop {
        pending.wait().forget();
        let mut batch = vec![queue.pop().expect("semaphore counts queued tasks")];
        while let Some(permit) = pending.try_wait() {
            permit.forget();
            batch.push(queue.pop().expect("semaphore counts queued tasks"));
        }
        for task in batch {
            match task {
                WriterTask::Io {
                    file,
                    page_num,
                    length,
                    frame,
                    kind,
                    done,
                } => {
                    let start = page_num * PAGE_SIZE;
                    let len = PAGE_SIZE.min(length.saturating_sub(start));
                    match kind {
                        IoKind::Read => {
                            let mut data = frame.contents();
                            let filled = if len > 0 {
                                match file.lock().unwrap().read_at(start, &mut data[..len]) {
                                    Ok(n) => n,
                                    Err(e) => {
                                        log::warn!("mmap read of page {} failed: {:?}", page_num, e);
                                        0
                                    }
                                }
                            } else {
                                0
                            };
                            // Tail beyond the file length reads as zeros.
                            data[filled..].fill(0);
                        }
                        IoKind::Write => {
                            if len > 0 {
                                let data = frame.contents();
                                if let Err(e) = file.lock().unwrap().write_at(start, &data[..len]) {
                                    log::warn!(
                                        "mmap write-back of page {} failed: {:?}",
                                        page_num,
                                        e
                                    );
                                }
                            }
                        }
                    }
                    if let Some(done) = done {
                        done.signal();
                    }
                }
                WriterTask::Barrier { done } => done.signal(),
                WriterTask::Exit => {
                    log::debug!("mmap writer stopping");
                    return;
                }
            }
        }
    }
}

impl Vm {
    /// Register an alias of `file`'s mapped region for `owner`, returning a
    /// fresh map id.
    ///
    /// The region reopens the file for an independent cursor; subsequent
    /// [`Vm::mmap_map_page`] calls bind user pages one by one.
    pub fn mmap_acquire(&self, owner: TaskId, file: &File) -> Result<MapId, KernelError> {
        let mut state = self.mmap.state.lock().unwrap();
        let sector = file.inode().sector();
        if !state.regions.contains_key(&sector) {
            let reopened = file.reopen();
            let length = reopened.len();
            state.regions.insert(
                sector,
                Region {
                    file: Arc::new(Mutex::new(reopened)),
                    length,
                    kpages: BTreeMap::new(),
                    alias_count: 0,
                },
            );
        }
        state.regions.get_mut(&sector).unwrap().alias_count += 1;

        state.next_id += 1;
        let id = state.next_id;
        state.aliases.insert(
            (owner, id),
            Alias {
                region: sector,
                upages: BTreeMap::new(),
            },
        );
        log::debug!(
            "mmap: task {:?} acquired map {} of inode at sector {}",
            owner,
            id,
            sector.into_u32()
        );
        Ok(MapId(id))
    }

    /// Number of pages an alias spans (the region length rounded up).
    pub fn mmap_pages_count(&self, owner: TaskId, id: MapId) -> Result<usize, KernelError> {
        let state = self.mmap.state.lock().unwrap();
        let alias = state
            .aliases
            .get(&(owner, id.0))
            .ok_or(KernelError::InvalidArgument)?;
        Ok(state.regions[&alias.region].length.div_ceil(PAGE_SIZE))
    }

    /// Bind the `nth_page` of the alias's region to user address `addr`.
    ///
    /// The page materializes on first fault.
    pub fn mmap_map_page(
        &self,
        owner: TaskId,
        id: MapId,
        addr: Va,
        nth_page: usize,
    ) -> Result<(), KernelError> {
        if addr.0 < super::MIN_USER_ADDR {
            return Err(KernelError::BadAddress);
        }
        assert!(addr.is_page_aligned(), "page operations take aligned addresses");

        let mut inner = self.inner.lock().unwrap();
        let task_vm = inner.tasks.get_mut(&owner).ok_or(KernelError::BadAddress)?;
        if task_vm.pages.contains_key(&addr) {
            return Err(KernelError::InvalidArgument);
        }

        let mut state = self.mmap.state.lock().unwrap();
        let state = &mut *state;
        let alias = state
            .aliases
            .get_mut(&(owner, id.0))
            .ok_or(KernelError::InvalidArgument)?;
        let region_pages = state.regions[&alias.region].length.div_ceil(PAGE_SIZE);
        if nth_page >= region_pages {
            return Err(KernelError::InvalidArgument);
        }
        alias.upages.insert(
            addr,
            Upage {
                page_num: nth_page,
                bound: false,
            },
        );
        state.upage_index.insert((owner, addr), id.0);
        task_vm.pages.insert(
            addr,
            VmPage {
                state: PageState::Mapped,
                readonly: false,
                pinned: 0,
            },
        );
        Ok(())
    }

    /// Map the whole of `file` at `base`: acquire an alias and bind every
    /// page of the region consecutively.
    pub fn mmap_open(&self, owner: TaskId, file: &File, base: Va) -> Result<MapId, KernelError> {
        let id = self.mmap_acquire(owner, file)?;
        let pages = self.mmap_pages_count(owner, id)?;
        for n in 0..pages {
            if let Err(e) = self.mmap_map_page(owner, id, Va(base.0 + n * PAGE_SIZE), n) {
                let _ = self.mmap_close(owner, id);
                return Err(e);
            }
        }
        Ok(id)
    }

    /// Unmap every page of the alias and drop it.
    ///
    /// A kpage whose last reference goes away is written back to the file
    /// if any alias dirtied it; when the region's alias list becomes empty
    /// the region and its file handle are dropped with it.
    pub fn mmap_close(&self, owner: TaskId, id: MapId) -> Result<(), KernelError> {
        let mut inner = self.inner.lock().unwrap();
        let inner = &mut *inner;
        let mut state = self.mmap.state.lock().unwrap();
        let state = &mut *state;

        let alias = state
            .aliases
            .remove(&(owner, id.0))
            .ok_or(KernelError::InvalidArgument)?;
        let region_key = alias.region;
        for (addr, upage) in alias.upages {
            state.upage_index.remove(&(owner, addr));
            let dirty = match inner.tasks.get_mut(&owner) {
                Some(task_vm) => {
                    let dirty = task_vm.page_table.is_dirty(addr);
                    task_vm.page_table.unmap(addr);
                    task_vm.pages.remove(&addr);
                    dirty
                }
                None => false,
            };
            if !upage.bound {
                continue;
            }
            let region = state.regions.get_mut(&region_key).unwrap();
            let kpage = region.kpages.get_mut(&upage.page_num).unwrap();
            kpage.dirty |= dirty;
            kpage.refs -= 1;
            if kpage.refs == 0 {
                let kpage = region.kpages.remove(&upage.page_num).unwrap();
                if kpage.dirty {
                    self.mmap.enqueue(WriterTask::Io {
                        file: region.file.clone(),
                        page_num: upage.page_num,
                        length: region.length,
                        frame: kpage.frame,
                        kind: IoKind::Write,
                        done: None,
                    });
                }
            }
        }

        let region = state.regions.get_mut(&region_key).unwrap();
        region.alias_count -= 1;
        if region.alias_count == 0 {
            state.regions.remove(&region_key);
            log::debug!(
                "mmap: region at sector {} dropped",
                region_key.into_u32()
            );
        }
        Ok(())
    }

    /// Drop every alias `owner` still holds.
    pub fn mmap_clean(&self, owner: TaskId) {
        let ids: Vec<u32> = {
            let state = self.mmap.state.lock().unwrap();
            state
                .aliases
                .range((owner, 0)..=(owner, u32::MAX))
                .map(|(&(_, id), _)| id)
                .collect()
        };
        for id in ids {
            let _ = self.mmap_close(owner, MapId(id));
        }
    }

    /// Wait until every write-back queued so far has reached the
    /// filesystem.
    pub fn mmap_sync(&self) {
        let done = Arc::new(Semaphore::new(0));
        self.mmap.enqueue(WriterTask::Barrier { done: done.clone() });
        done.wait().forget();
    }

    // The fault path for `Mapped` pages: bind the upage to its kpage,
    // materializing the kpage through the writer task if needed, and map
    // the shared frame.
    pub(crate) fn mmap_fault(
        &self,
        inner: &mut VmInner,
        owner: TaskId,
        addr: Va,
    ) -> Result<(), KernelError> {
        let mut state = self.mmap.state.lock().unwrap();
        let state = &mut *state;
        let id = *state
            .upage_index
            .get(&(owner, addr))
            .ok_or(KernelError::BadAddress)?;
        let alias = state.aliases.get_mut(&(owner, id)).unwrap();
        let region_key = alias.region;
        let page_num = alias.upages[&addr].page_num;

        let region = state.regions.get_mut(&region_key).unwrap();
        let frame = match region.kpages.get_mut(&page_num) {
            Some(kpage) => {
                kpage.refs += 1;
                kpage.frame.clone()
            }
            None => {
                let frame = self.frame_or_evict(inner)?;
                let done = Arc::new(Semaphore::new(0));
                self.mmap.enqueue(WriterTask::Io {
                    file: region.file.clone(),
                    page_num,
                    length: region.length,
                    frame: frame.clone(),
                    kind: IoKind::Read,
                    done: Some(done.clone()),
                });
                done.wait().forget();
                region.kpages.insert(
                    page_num,
                    Kpage {
                        frame: frame.clone(),
                        dirty: false,
                        refs: 1,
                    },
                );
                frame
            }
        };

        state
            .aliases
            .get_mut(&(owner, id))
            .unwrap()
            .upages
            .get_mut(&addr)
            .unwrap()
            .bound = true;

        let task_vm = inner.tasks.get_mut(&owner).unwrap();
        let readonly = task_vm.pages[&addr].readonly;
        task_vm.page_table.map(addr, frame, !readonly);
        Ok(())
    }
}
