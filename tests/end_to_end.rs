//! End-to-end scenarios across the storage and memory-management core:
//! filesystem round trips, directory overflow, eviction under pressure,
//! deny-write arbitration, deferred deletion, and reader/writer ordering.

use reos::cache::BlockCache;
use reos::dev::MemDisk;
use reos::fs::{File, OpenOptions, Pifs};
use reos::vm::swap::SWAP_FILE_NAME;
use reos::vm::{TaskId, Va, Vm, MIN_USER_ADDR};
use reos::{KernelError, PAGE_SIZE};
use std::sync::Arc;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn format_device(sectors: u32, cache_frames: usize) -> Arc<Pifs> {
    init_logging();
    let cache = Arc::new(BlockCache::new(Arc::new(MemDisk::new(sectors)), cache_frames));
    let fs = Arc::new(Pifs::new(cache));
    fs.format().unwrap();
    fs.sanity_check().unwrap();
    fs
}

fn boot_vm(fs: &Arc<Pifs>, frames: usize, swap_pages: usize) -> Vm {
    let swap_file = File::open(fs, SWAP_FILE_NAME, OpenOptions::FileMustCreate).unwrap();
    swap_file
        .write_at(0, &vec![0u8; swap_pages * PAGE_SIZE])
        .unwrap();
    Vm::new(frames, swap_file)
}

fn va(n: usize) -> Va {
    Va(MIN_USER_ADDR + n * PAGE_SIZE)
}

// Scenario 1: hello round trip through format, create, write, close, reopen.
#[test]
fn hello_round_trip() {
    let fs = format_device(4000, 32);

    let inode = fs.open("/foo", OpenOptions::FileMustCreate).unwrap();
    assert_eq!(fs.write(&inode, 0, b"hello").unwrap(), 5);
    fs.close(&inode).unwrap();

    let inode = fs.open("/foo", OpenOptions::NoCreate).unwrap();
    assert_eq!(inode.length(), 5);
    let mut buf = [0u8; 5];
    assert_eq!(fs.read(&inode, 0, &mut buf).unwrap(), 5);
    assert_eq!(&buf, b"hello");
    fs.close(&inode).unwrap();

    // Same identity on reopen while open elsewhere.
    let a = fs.open("/foo", OpenOptions::NoCreate).unwrap();
    let b = fs.open("/foo", OpenOptions::NoCreate).unwrap();
    assert!(Arc::ptr_eq(&a, &b));
    fs.close(&a).unwrap();
    fs.close(&b).unwrap();
}

// Scenario 2: 26 files in the root; the last entry lives in the overflow
// sector and iteration order is insertion order.
#[test]
fn directory_overflow_iteration() {
    let fs = format_device(4000, 32);
    let names: Vec<String> = (0..26).map(|i| format!("f{:02}", i)).collect();
    for name in &names {
        fs.create_file(&format!("/{}", name)).unwrap();
    }

    let root = fs.open("/", OpenOptions::NoCreate).unwrap();
    for (i, name) in names.iter().enumerate() {
        assert_eq!(
            fs.readdir(&root, i).unwrap().as_deref(),
            Some(name.as_str()),
            "index {}",
            i
        );
    }
    assert_eq!(fs.readdir(&root, 26).unwrap(), None);
    fs.close(&root).unwrap();
}

// Scenario 3: 32 pages of distinct patterns survive eviction through the
// swap file, and reading them back does not rewrite clean slots.
#[test]
fn eviction_preserves_patterns_and_swap_stays_clean() {
    let fs = format_device(3900, 64);
    let a = fs.open("/a", OpenOptions::FileMustCreate).unwrap();
    fs.write(&a, 0, &vec![0x11u8; 4096]).unwrap();
    fs.close(&a).unwrap();

    let vm = boot_vm(&fs, 16, 64);
    let t = TaskId(1);
    vm.register_task(t).unwrap();

    let pages = 32;
    for i in 0..pages {
        vm.alloc_zero(t, va(i), false).unwrap();
        vm.store(t, va(i), &vec![(i as u8) * 3 + 1; PAGE_SIZE]).unwrap();
    }

    // The 33rd page keeps the pressure on.
    vm.alloc_zero(t, va(pages), false).unwrap();
    vm.ensure(t, va(pages)).unwrap();
    assert!(vm.frames_in_use() <= 16);

    for i in 0..pages {
        let mut buf = vec![0u8; PAGE_SIZE];
        vm.load(t, va(i), &mut buf).unwrap();
        assert_eq!(buf, vec![(i as u8) * 3 + 1; PAGE_SIZE], "page {}", i);
    }

    // Clean swap-ins leave the swap file untouched: snapshot, re-read
    // every page, compare.
    let swap_len = fs.length_of(SWAP_FILE_NAME).unwrap();
    let snapshot = {
        let f = File::open(&fs, SWAP_FILE_NAME, OpenOptions::FileNoCreate).unwrap();
        let mut all = vec![0u8; swap_len];
        f.read_at(0, &mut all).unwrap();
        all
    };
    for i in 0..pages {
        let mut buf = vec![0u8; PAGE_SIZE];
        vm.load(t, va(i), &mut buf).unwrap();
    }
    let after = {
        let f = File::open(&fs, SWAP_FILE_NAME, OpenOptions::FileNoCreate).unwrap();
        let mut all = vec![0u8; swap_len];
        f.read_at(0, &mut all).unwrap();
        all
    };
    assert_eq!(snapshot, after);

    vm.clean(t);
    assert_eq!(vm.frames_in_use(), 0);
}

// Scenario 4: deny_write on one handle makes writes through another handle
// short until allowed again.
#[test]
fn deny_write_arbitration() {
    let fs = format_device(1000, 16);
    let mut one = File::open(&fs, "/a", OpenOptions::FileMustCreate).unwrap();
    let two = one.reopen();

    one.deny_write();
    assert_eq!(two.write_at(0, b"denied").unwrap(), 0);

    one.allow_write();
    assert_eq!(two.write_at(0, b"granted").unwrap(), 7);
    let mut buf = [0u8; 7];
    two.read_at(0, &mut buf).unwrap();
    assert_eq!(&buf, b"granted");
}

// Scenario 5: deleting a file with a live handle defers the sector release
// to the last close.
#[test]
fn deferred_deletion() {
    let fs = format_device(4000, 32);
    let inode = fs.open("/a", OpenOptions::FileMustCreate).unwrap();
    fs.write(&inode, 0, &vec![0xabu8; 3 * 512]).unwrap();
    let used_while_open = fs.used_sector_count().unwrap();

    fs.delete_file_path("/a").unwrap();
    assert!(!fs.exists("/a"));
    assert_eq!(
        fs.used_sector_count().unwrap(),
        used_while_open,
        "sectors stay reserved while a handle is open"
    );

    // The surviving handle still reads the data.
    let mut buf = vec![0u8; 3 * 512];
    assert_eq!(fs.read(&inode, 0, &mut buf).unwrap(), buf.len());
    assert!(buf.iter().all(|&b| b == 0xab));

    fs.close(&inode).unwrap();
    // Record sector + three data sectors come back.
    assert_eq!(fs.used_sector_count().unwrap(), used_while_open - 4);
}

// Scenario 6: two readers and a writer on one inode; every read observes a
// uniform (un-torn) view.
#[test]
fn readers_see_consistent_views() {
    use crossbeam_utils::thread;

    let fs = format_device(4000, 64);
    let size = 2000;
    let inode = fs.open("/shared", OpenOptions::FileMustCreate).unwrap();
    fs.write(&inode, 0, &vec![0xaau8; size]).unwrap();

    thread::scope(|scope| {
        for _ in 0..2 {
            let fs = &fs;
            let inode = &inode;
            scope.spawn(move |_| {
                for _ in 0..50 {
                    let mut buf = vec![0u8; size];
                    assert_eq!(fs.read(inode, 0, &mut buf).unwrap(), size);
                    let first = buf[0];
                    assert!(
                        first == 0xaa || first == 0xbb,
                        "unexpected byte {:#x}",
                        first
                    );
                    assert!(
                        buf.iter().all(|&b| b == first),
                        "torn read: mixed old and new contents"
                    );
                }
            });
        }
        let fs = &fs;
        let inode = &inode;
        scope.spawn(move |_| {
            assert_eq!(fs.write(inode, 0, &vec![0xbbu8; size]).unwrap(), size);
        });
    })
    .unwrap();

    // The writer's result is visible once everyone is done.
    let mut buf = vec![0u8; size];
    fs.read(&inode, 0, &mut buf).unwrap();
    assert!(buf.iter().all(|&b| b == 0xbb));
    fs.close(&inode).unwrap();
}

// A file fragmented across more than 98 extents spills into a continuation
// record and reads back intact.
#[test]
fn extent_overflow_through_interleaved_appends() {
    let fs = format_device(3900, 32);
    let a = fs.open("/a", OpenOptions::FileMustCreate).unwrap();
    let b = fs.open("/b", OpenOptions::FileMustCreate).unwrap();

    // Alternating appends interleave sector allocation, so every appended
    // sector of /a is discontiguous and costs a fresh extent.
    let rounds = 120;
    for i in 0..rounds {
        let chunk_a = vec![i as u8; 512];
        let chunk_b = vec![0x80 | (i as u8 & 0x3f); 512];
        assert_eq!(fs.write(&a, i * 512, &chunk_a).unwrap(), 512);
        assert_eq!(fs.write(&b, i * 512, &chunk_b).unwrap(), 512);
    }
    assert_eq!(inode_len(&fs, "/a"), rounds * 512);

    for i in 0..rounds {
        let mut buf = [0u8; 512];
        assert_eq!(fs.read(&a, i * 512, &mut buf).unwrap(), 512);
        assert_eq!(buf, [i as u8; 512], "chunk {}", i);
    }
    fs.close(&a).unwrap();
    fs.close(&b).unwrap();

    // Deleting the fragmented file returns every sector, continuation
    // records included.
    let before = fs.used_sector_count().unwrap();
    fs.delete_file_path("/a").unwrap();
    let released = before - fs.used_sector_count().unwrap();
    assert_eq!(released, rounds + 2, "data sectors + head + continuation");
}

fn inode_len(fs: &Arc<Pifs>, path: &str) -> usize {
    fs.length_of(path).unwrap()
}

// Filesystem writes running beside VM pressure: the swap file and user
// files share the device without stepping on each other.
#[test]
fn swap_and_files_share_the_device() {
    let fs = format_device(3900, 64);
    let vm = boot_vm(&fs, 4, 16);
    let t = TaskId(7);
    vm.register_task(t).unwrap();

    for i in 0..8 {
        vm.alloc_zero(t, va(i), false).unwrap();
        vm.store(t, va(i), &[i as u8 + 1; 100]).unwrap();

        let path = format!("/file{}", i);
        let inode = fs.open(&path, OpenOptions::FileMustCreate).unwrap();
        fs.write(&inode, 0, &[0xf0 | i as u8; 700]).unwrap();
        fs.close(&inode).unwrap();
    }

    for i in 0..8 {
        let mut page = [0u8; 100];
        vm.load(t, va(i), &mut page).unwrap();
        assert_eq!(page, [i as u8 + 1; 100], "vm page {}", i);

        let path = format!("/file{}", i);
        let inode = fs.open(&path, OpenOptions::NoCreate).unwrap();
        let mut buf = [0u8; 700];
        assert_eq!(fs.read(&inode, 0, &mut buf).unwrap(), 700);
        assert_eq!(buf, [0xf0 | i as u8; 700], "file {}", i);
        fs.close(&inode).unwrap();
    }

    vm.clean(t);
    assert_eq!(vm.swap_free_slots(), 16);

    // Everything dirty reaches the device on flush; a reread of the raw
    // cache-backed fs still agrees.
    fs.flush().unwrap();
    assert!(fs.exists("/file3"));
}

// Mapped files interact with the rest: map, mutate, close, and observe the
// bytes through the ordinary file API.
#[test]
fn mmap_write_back_reaches_the_file() {
    let fs = format_device(3900, 64);
    let vm = boot_vm(&fs, 8, 8);
    let t = TaskId(1);
    vm.register_task(t).unwrap();

    let f = File::open(&fs, "/mapped", OpenOptions::FileMustCreate).unwrap();
    f.write_at(0, &vec![0u8; PAGE_SIZE]).unwrap();

    let id = vm.mmap_open(t, &f, va(0)).unwrap();
    vm.store(t, va(0), b"through the mapping").unwrap();
    vm.mmap_close(t, id).unwrap();
    vm.mmap_sync();

    let mut buf = [0u8; 19];
    f.read_at(0, &mut buf).unwrap();
    assert_eq!(&buf, b"through the mapping");
}

// Reserved low addresses fault, registered-but-unknown addresses fault, and
// out-of-memory surfaces as NoMemory.
#[test]
fn fault_classification() {
    let fs = format_device(1000, 16);
    let vm = boot_vm(&fs, 1, 0);
    let t = TaskId(1);
    vm.register_task(t).unwrap();

    assert_eq!(vm.ensure(t, Va(0x8000)), Err(KernelError::BadAddress));
    assert_eq!(vm.ensure(t, va(0)), Err(KernelError::BadAddress));

    vm.alloc_zero(t, va(0), false).unwrap();
    vm.ensure(t, va(0)).unwrap();
    // One frame, zero swap slots: the second page cannot be materialized.
    vm.alloc_zero(t, va(1), false).unwrap();
    assert_eq!(vm.ensure(t, va(1)), Err(KernelError::NoMemory));
}
