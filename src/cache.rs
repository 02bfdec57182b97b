//! # Block cache.
//!
//! The block cache buffers a bounded set of device sectors in memory with
//! at-most-one-copy-per-sector semantics and write-back durability. Every
//! consumer of the disk — the filesystem for its records and data, the swap
//! area through the filesystem — reaches sectors through leases handed out
//! here, so a sector's bytes live in exactly one place while anyone is
//! looking at them.
//!
//! A [`Lease`] is a counted, scoped reservation of a cached page. While any
//! lease on a page is outstanding the page is pinned; when the last lease is
//! returned the page moves to the disposable LRU, where it remains valid for
//! future hits until its frame is reclaimed for another sector. Dirty pages
//! are flushed when their frame is reclaimed, on [`BlockCache::flush`], or on
//! [`BlockCache::flush_all`].
//!
//! Admission is gated by a counting semaphore with one permit per
//! outstanding lease. Combined with the caller contract that a thread holds
//! at most one lease per cache at a time (checked in debug builds), a granted
//! permit guarantees that a free or disposable frame exists, so "out of
//! frames" is expressed by blocking at the semaphore and never by an error.
//!
//! Page state transitions:
//!
//! ```text
//!              miss (evict + read)            return
//!   Evicted ──────────────────────▶ InUse ◀──────────▶ Disposable{Clean,Dirty}
//!      ▲                                                   │
//!      └───────────────── reclaim (flush if dirty) ────────┘
//! ```

use crate::dev::{BlockDevice, Sector, SECTOR_SIZE};
use crate::lru::LruList;
use crate::sync::{Permit, Semaphore};
use crate::KernelError;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

/// One cached sector's buffer and its dirty flag.
pub struct PageData {
    /// The sector contents.
    pub bytes: [u8; SECTOR_SIZE],
    /// Whether the buffer differs from the device.
    ///
    /// Callers that modify `bytes` must set this before returning the lease.
    pub dirty: bool,
}

/// A cached page. The buffer is behind its own lock so leaseholders can
/// access it after the cache's internal lock is released.
pub struct BlockPage {
    data: Mutex<PageData>,
}

impl BlockPage {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            data: Mutex::new(PageData {
                bytes: [0; SECTOR_SIZE],
                dirty: false,
            }),
        })
    }
}

// A frame of the cache arena currently bound to a sector.
struct Frame {
    page: Arc<BlockPage>,
    sector: Sector,
    lease_count: usize,
}

struct CacheState {
    // sector -> arena index, for every bound frame (in use or disposable).
    map: BTreeMap<Sector, usize>,
    frames: Vec<Option<Frame>>,
    free: Vec<usize>,
    // Arena indices with lease_count == 0, least recently returned first.
    disposable: LruList<usize>,
}

/// A write-back cache of device sectors.
///
/// The cache may be used concurrently without destroying metadata; callers
/// must serialize access to the actual sector contents themselves (the
/// filesystem does so with its per-device reader/writer lock).
pub struct BlockCache {
    device: Arc<dyn BlockDevice>,
    // One permit per outstanding lease; capacity permits total.
    slots: Semaphore,
    state: Mutex<CacheState>,
}

impl BlockCache {
    /// Create a cache of `capacity` sector frames over `device`.
    pub fn new(device: Arc<dyn BlockDevice>, capacity: usize) -> Self {
        assert!(capacity > 0);
        log::info!("block cache: {} frames of {} bytes", capacity, SECTOR_SIZE);
        Self {
            device,
            slots: Semaphore::new(capacity),
            state: Mutex::new(CacheState {
                map: BTreeMap::new(),
                frames: (0..capacity).map(|_| None).collect(),
                free: (0..capacity).collect(),
                disposable: LruList::new(),
            }),
        }
    }

    /// The underlying device.
    pub fn device(&self) -> &Arc<dyn BlockDevice> {
        &self.device
    }

    /// Return a lease on a page holding the current contents of `sector`.
    ///
    /// On a hit the page is pinned as-is; on a miss a frame is reclaimed
    /// (flushing the evicted page if dirty) and the sector is read from the
    /// device. Blocks while every frame is pinned by other leases.
    pub fn read(&self, sector: Sector) -> Result<Lease<'_>, KernelError> {
        self.acquire(sector, true)
    }

    /// Return a lease on a page that will be overwritten entirely.
    ///
    /// The buffer contents are undefined; no device read occurs. The caller
    /// must fill the buffer and set `dirty` before returning the lease.
    pub fn write(&self, sector: Sector) -> Result<Lease<'_>, KernelError> {
        self.acquire(sector, false)
    }

    fn acquire(&self, sector: Sector, load: bool) -> Result<Lease<'_>, KernelError> {
        debug_lease_tracker::enter(self);
        let permit = self.slots.wait();

        let mut state = self.state.lock().unwrap();
        if let Some(&idx) = state.map.get(&sector) {
            if state.frames[idx].as_ref().unwrap().lease_count == 0 {
                state.disposable.remove(&idx);
            }
            let frame = state.frames[idx].as_mut().unwrap();
            frame.lease_count += 1;
            let page = frame.page.clone();
            return Ok(Lease {
                cache: self,
                sector,
                page,
                _permit: permit,
            });
        }

        // Miss. The admission permit guarantees a frame can be obtained.
        let idx = match self.reclaim_frame(&mut state) {
            Ok(idx) => idx,
            Err(e) => {
                debug_lease_tracker::leave(self);
                return Err(e);
            }
        };

        let page = BlockPage::new();
        if load {
            let mut data = page.data.lock().unwrap();
            if let Err(e) = self.device.read_sector(sector, &mut data.bytes) {
                drop(data);
                state.free.push(idx);
                debug_lease_tracker::leave(self);
                return Err(e);
            }
        }
        state.frames[idx] = Some(Frame {
            page: page.clone(),
            sector,
            lease_count: 1,
        });
        state.map.insert(sector, idx);
        Ok(Lease {
            cache: self,
            sector,
            page,
            _permit: permit,
        })
    }

    // Take a frame from the free list, or evict the least recently used
    // disposable page, flushing it first if dirty. On flush failure the
    // page stays cached and dirty.
    fn reclaim_frame(&self, state: &mut CacheState) -> Result<usize, KernelError> {
        if let Some(idx) = state.free.pop() {
            return Ok(idx);
        }
        let idx = state
            .disposable
            .pop_least()
            .expect("admission permit held, yet no frame is reclaimable");
        let frame = state.frames[idx].as_ref().unwrap();
        let (sector, page) = (frame.sector, frame.page.clone());
        {
            let mut data = page.data.lock().unwrap();
            if data.dirty {
                if let Err(e) = self.device.write_sector(sector, &data.bytes) {
                    drop(data);
                    state.disposable.touch(idx);
                    return Err(e);
                }
                data.dirty = false;
            }
        }
        state.map.remove(&sector);
        state.frames[idx] = None;
        Ok(idx)
    }

    // Called by Lease::drop: the current operation no longer uses the page.
    fn release(&self, sector: Sector) {
        let mut state = self.state.lock().unwrap();
        let idx = *state.map.get(&sector).expect("released page must be cached");
        let frame = state.frames[idx].as_mut().unwrap();
        frame.lease_count -= 1;
        if frame.lease_count == 0 {
            state.disposable.touch(idx);
        }
        debug_lease_tracker::leave(self);
    }

    /// If the leased page is dirty, synchronously write it to the device and
    /// clear the dirty flag.
    pub fn flush(&self, lease: &Lease<'_>) -> Result<(), KernelError> {
        let mut data = lease.page.data.lock().unwrap();
        if data.dirty {
            self.device.write_sector(lease.sector, &data.bytes)?;
            data.dirty = false;
        }
        Ok(())
    }

    /// Flush every cached dirty page to the device.
    pub fn flush_all(&self) -> Result<(), KernelError> {
        let state = self.state.lock().unwrap();
        for frame in state.frames.iter().flatten() {
            let mut data = frame.page.data.lock().unwrap();
            if data.dirty {
                self.device.write_sector(frame.sector, &data.bytes)?;
                data.dirty = false;
            }
        }
        Ok(())
    }

    /// Read `sector` and copy its contents into `dest`.
    pub fn read_in(&self, sector: Sector, dest: &mut [u8; SECTOR_SIZE]) -> Result<(), KernelError> {
        let lease = self.read(sector)?;
        dest.copy_from_slice(&lease.data().bytes);
        Ok(())
    }

    /// Overwrite `sector` with `src` through the cache.
    pub fn write_out(&self, sector: Sector, src: &[u8; SECTOR_SIZE]) -> Result<(), KernelError> {
        let lease = self.write(sector)?;
        {
            let mut data = lease.data();
            data.bytes.copy_from_slice(src);
            data.dirty = true;
        }
        Ok(())
    }
}

/// A counted, scoped reservation of a cache page.
///
/// While the lease lives, the page cannot be evicted. Dropping the lease
/// returns the page; when its lease count reaches zero it joins the
/// disposable LRU.
///
/// Holding more than one lease at a time on the same cache from a single
/// thread permits deadlock and is rejected in debug builds.
pub struct Lease<'a> {
    cache: &'a BlockCache,
    sector: Sector,
    page: Arc<BlockPage>,
    _permit: Permit<'a>,
}

impl Lease<'_> {
    /// The sector this lease covers.
    pub fn sector(&self) -> Sector {
        self.sector
    }

    /// Lock the page buffer for inspection or modification.
    ///
    /// Callers that modify the bytes must set [`PageData::dirty`].
    pub fn data(&self) -> MutexGuard<'_, PageData> {
        self.page.data.lock().unwrap()
    }
}

impl Drop for Lease<'_> {
    fn drop(&mut self) {
        self.cache.release(self.sector);
    }
}

// Debug-build enforcement of the one-lease-per-thread-per-cache contract.
#[cfg(debug_assertions)]
mod debug_lease_tracker {
    use super::BlockCache;
    use std::cell::RefCell;

    thread_local! {
        static HELD: RefCell<Vec<usize>> = const { RefCell::new(Vec::new()) };
    }

    pub fn enter(cache: &BlockCache) {
        let key = cache as *const _ as usize;
        HELD.with(|held| {
            let mut held = held.borrow_mut();
            assert!(
                !held.contains(&key),
                "thread already holds a lease on this block cache"
            );
            held.push(key);
        });
    }

    pub fn leave(cache: &BlockCache) {
        let key = cache as *const _ as usize;
        HELD.with(|held| {
            let mut held = held.borrow_mut();
            let pos = held.iter().position(|&k| k == key).unwrap();
            held.swap_remove(pos);
        });
    }
}

#[cfg(not(debug_assertions))]
mod debug_lease_tracker {
    use super::BlockCache;

    #[inline]
    pub fn enter(_cache: &BlockCache) {}

    #[inline]
    pub fn leave(_cache: &BlockCache) {}
}
