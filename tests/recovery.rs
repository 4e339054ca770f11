//! Crash-recovery tests: synthetic interruption points are staged by
//! writing info slots directly into the pool, the handle is dropped
//! without the clean-shutdown transition, and the reopened pool must land
//! in one of the two legal states of the interrupted operation.

use std::io::{Seek, SeekFrom, Write};
use std::path::PathBuf;

use cinnabar::heap::layout::{
    chunk_data_off, chunk_flags_word_off, chunk_header_off, lane_off, ChunkHeader,
    CHUNK_SIZE, CHUNK_TYPE_RUN, CHUNK_USED_FLAG_WORD, INFO_SLOT_SIZE, INFO_SLOT_TABLE_OFF,
    INFO_SLOT_TYPE_ALLOC, INFO_SLOT_TYPE_FREE, INFO_SLOT_TYPE_REALLOC, INFO_SLOT_TYPE_UNKNOWN,
    REDO_LANE_ENTRIES,
};
use cinnabar::{
    ctl, AllocClassDesc, AllocClassParams, AllocClassRange, CtlArg, HeaderKind, Pool, PoolOffset,
    RedoLog, RedoOp,
};

const TEST_POOL_SIZE: u64 = 64 * 1024 * 1024;

fn pool_path(name: &str) -> PathBuf {
    let path = std::env::temp_dir().join(format!(
        "cinnabar-recovery-{}-{}.pool",
        name,
        std::process::id()
    ));
    let _ = std::fs::remove_file(&path);
    path
}

unsafe fn write_u64(pool: &Pool, off: u64, value: u64) {
    std::ptr::write(pool.pdirect(PoolOffset::new(off)) as *mut u64, value);
}

unsafe fn read_u64(pool: &Pool, off: u64) -> u64 {
    std::ptr::read(pool.pdirect(PoolOffset::new(off)) as *const u64)
}

/// Stages an info slot the way an interrupted operation would have left it.
unsafe fn write_slot(pool: &Pool, idx: usize, ty: u32, payload: [u64; 3]) {
    let base = pool.pdirect(PoolOffset::new(
        (INFO_SLOT_TABLE_OFF + idx * INFO_SLOT_SIZE) as u64,
    ));
    std::ptr::write(base as *mut u32, ty);
    std::ptr::write(base.add(4) as *mut u32, 0);
    for (i, v) in payload.iter().enumerate() {
        std::ptr::write(base.add(8 + i * 8) as *mut u64, *v);
    }
}

unsafe fn slot_is_clear(pool: &Pool, idx: usize) -> bool {
    let base = pool.pdirect(PoolOffset::new(
        (INFO_SLOT_TABLE_OFF + idx * INFO_SLOT_SIZE) as u64,
    ));
    (0..INFO_SLOT_SIZE).all(|i| std::ptr::read(base.add(i)) == 0)
}

unsafe fn chunk_header(pool: &Pool, zone: usize, chunk: usize) -> ChunkHeader {
    std::ptr::read(
        pool.pdirect(PoolOffset::new(chunk_header_off(zone, chunk) as u64)) as *const ChunkHeader
    )
}

#[test]
fn interrupted_alloc_rolls_back() {
    let path = pool_path("alloc");
    let pool = Pool::create(&path, "test", TEST_POOL_SIZE, 0o600).unwrap();

    // the destination word lives in a free chunk's data; the offset was
    // published but the chunk flag never flipped
    let dest = chunk_data_off(0, 1) as u64;
    unsafe {
        write_u64(&pool, dest, dest);
        write_slot(&pool, 0, INFO_SLOT_TYPE_ALLOC, [dest, 0, 0]);
    }
    pool.crash();

    let pool = Pool::open(&path, "test").unwrap();
    unsafe {
        assert_eq!(read_u64(&pool, dest), 0, "destination must be nulled");
        assert!(slot_is_clear(&pool, 0));
        assert!(!chunk_header(&pool, 0, 1).is_used());
    }
    pool.close().unwrap();
    assert!(Pool::check(&path, "test").unwrap());
    std::fs::remove_file(&path).unwrap();
}

#[test]
fn committed_publish_is_replayed_on_reopen() {
    let path = pool_path("lane");
    let pool = Pool::create(&path, "test", TEST_POOL_SIZE, 0o600).unwrap();

    let mut anchor = 0u64;
    let target;
    unsafe {
        // an anchor chunk hosts the destination word inside the pool
        pool.pmalloc(&mut anchor, 64).unwrap();
        let cell = pool.pdirect(PoolOffset::new(anchor)) as *mut u64;
        pool.pmalloc(cell, 4096).unwrap();
        target = *cell;
        pool.pfree(cell).unwrap();
        assert_eq!(*cell, 0);

        // stage a committed but unprocessed redo pair in lane 0, as a
        // crash right after the publish store would leave it
        let log = RedoLog::new(
            pool.pdirect(PoolOffset::NULL),
            TEST_POOL_SIZE as usize,
            lane_off(0),
            REDO_LANE_ENTRIES,
        );
        let chunk = cinnabar::heap::layout::chunk_by_offset(target).unwrap();
        log.store(&[
            (anchor, target, RedoOp::Set),
            (
                chunk_flags_word_off(chunk.0, chunk.1) as u64,
                CHUNK_USED_FLAG_WORD,
                RedoOp::Or,
            ),
        ]);
    }
    pool.crash();

    let pool = Pool::open(&path, "test").unwrap();
    unsafe {
        assert_eq!(
            read_u64(&pool, anchor),
            target,
            "the committed pair must roll forward"
        );
    }
    assert_eq!(
        pool.alloc_usable_size(PoolOffset::new(target)).unwrap(),
        CHUNK_SIZE,
        "the chunk flag must come back with the publish"
    );
    unsafe {
        let cell = pool.pdirect(PoolOffset::new(anchor)) as *mut u64;
        pool.pfree(cell).unwrap();
        pool.pfree(&mut anchor).unwrap();
    }
    pool.close().unwrap();
    assert!(Pool::check(&path, "test").unwrap());
    std::fs::remove_file(&path).unwrap();
}

#[test]
fn interrupted_free_restores_the_chunk() {
    let path = pool_path("free");
    let pool = Pool::create(&path, "test", TEST_POOL_SIZE, 0o600).unwrap();

    let mut anchor = 0u64;
    let target;
    unsafe {
        // an anchor chunk hosts the destination word inside the pool
        pool.pmalloc(&mut anchor, 64).unwrap();
        let cell = pool.pdirect(PoolOffset::new(anchor)) as *mut u64;
        pool.pmalloc(cell, 4096).unwrap();
        target = *cell;

        // the free guard went up but the used flag was never cleared
        write_slot(&pool, 0, INFO_SLOT_TYPE_FREE, [anchor, 0, 0]);
    }
    pool.crash();

    let pool = Pool::open(&path, "test").unwrap();
    unsafe {
        assert_eq!(read_u64(&pool, anchor), target, "offset must be untouched");
        assert!(slot_is_clear(&pool, 0));
    }
    assert_eq!(
        pool.alloc_usable_size(PoolOffset::new(target)).unwrap(),
        CHUNK_SIZE,
        "the chunk must still be live"
    );
    pool.close().unwrap();
    assert!(Pool::check(&path, "test").unwrap());
    std::fs::remove_file(&path).unwrap();
}

#[test]
fn interrupted_realloc_restores_the_old_block() {
    let path = pool_path("realloc");
    let pool = Pool::create(&path, "test", TEST_POOL_SIZE, 0o600).unwrap();

    let mut anchor = 0u64;
    let mut staging = 0u64;
    let old;
    let fresh;
    unsafe {
        pool.pmalloc(&mut anchor, 64).unwrap();
        let cell = pool.pdirect(PoolOffset::new(anchor)) as *mut u64;
        pool.pmalloc(cell, 4096).unwrap();
        old = *cell;

        // a second allocation plays the part of the newly allocated block
        pool.pmalloc(&mut staging, 4096).unwrap();
        fresh = staging;

        // published, old block not yet released, guard still up
        write_u64(&pool, anchor, fresh);
        write_slot(&pool, 0, INFO_SLOT_TYPE_REALLOC, [anchor, old, 0]);
    }
    pool.crash();

    let pool = Pool::open(&path, "test").unwrap();
    unsafe {
        assert_eq!(read_u64(&pool, anchor), old, "old offset must come back");
        assert!(slot_is_clear(&pool, 0));
    }
    assert!(pool.alloc_usable_size(PoolOffset::new(old)).is_ok());
    assert!(
        pool.alloc_usable_size(PoolOffset::new(fresh)).is_err(),
        "the new chunk must be rolled back to free"
    );
    pool.close().unwrap();
    assert!(Pool::check(&path, "test").unwrap());
    std::fs::remove_file(&path).unwrap();
}

#[test]
fn interrupted_run_alloc_nulls_the_pointer_only() {
    let path = pool_path("run");
    let pool = Pool::create(&path, "test", TEST_POOL_SIZE, 0o600).unwrap();

    let mut params = CtlArg::ClassParams(AllocClassParams {
        fail_no_matching_class: false,
        granularity: 8,
        limit: 0,
    });
    pool.ctl("heap.alloc_class.reset", None, Some(&mut params))
        .unwrap();
    let mut huge = CtlArg::ClassDesc(AllocClassDesc {
        header_kind: HeaderKind::None,
        unit_size: CHUNK_SIZE,
        units_per_block: 1,
    });
    pool.ctl("heap.alloc_class.1.desc", None, Some(&mut huge))
        .unwrap();
    let mut desc = CtlArg::ClassDesc(AllocClassDesc {
        header_kind: HeaderKind::Minimal,
        unit_size: 128,
        units_per_block: 1000,
    });
    pool.ctl("heap.alloc_class.0.desc", None, Some(&mut desc))
        .unwrap();
    let mut range = CtlArg::MapRange(AllocClassRange {
        class_id: 0,
        start: 1,
        end: 128,
    });
    pool.ctl("heap.alloc_class.map.range", None, Some(&mut range))
        .unwrap();

    let mut anchor = 0u64;
    let run_off;
    let run_chunk;
    unsafe {
        pool.pmalloc(&mut anchor, 100 * 1024).unwrap();
        let cell = pool.pdirect(PoolOffset::new(anchor)) as *mut u64;
        pool.pmalloc(cell, 100).unwrap();
        run_off = *cell;
        run_chunk = cinnabar::heap::layout::chunk_by_offset(run_off).unwrap();

        // replay the guard of that alloc as if it never came down
        write_slot(&pool, 0, INFO_SLOT_TYPE_ALLOC, [anchor, 0, 0]);
    }
    pool.crash();

    let pool = Pool::open(&path, "test").unwrap();
    unsafe {
        assert_eq!(read_u64(&pool, anchor), 0, "destination must be nulled");
        let hdr = chunk_header(&pool, run_chunk.0, run_chunk.1);
        assert_eq!(hdr.ty, CHUNK_TYPE_RUN);
        assert!(hdr.is_used(), "a run chunk stays live through recovery");
    }
    pool.close().unwrap();
    assert!(Pool::check(&path, "test").unwrap());
    std::fs::remove_file(&path).unwrap();
}

#[test]
fn slot_clear_residue_is_finished() {
    let path = pool_path("residue");
    let pool = Pool::create(&path, "test", TEST_POOL_SIZE, 0o600).unwrap();
    unsafe {
        // an interrupted slot clear: type already unknown, payload not yet
        // zeroed
        write_slot(&pool, 5, INFO_SLOT_TYPE_UNKNOWN, [0xdead, 0xbeef, 0]);
    }
    pool.crash();

    let pool = Pool::open(&path, "test").unwrap();
    unsafe {
        assert!(slot_is_clear(&pool, 5));
    }
    pool.close().unwrap();
    std::fs::remove_file(&path).unwrap();
}

#[test]
fn broken_primary_header_recovers_from_backup() {
    let path = pool_path("backup");
    let pool = Pool::create(&path, "test", TEST_POOL_SIZE, 0o600).unwrap();

    let mut p = 0u64;
    unsafe {
        pool.pmalloc(&mut p, 1024).unwrap();
    }
    pool.close().unwrap();

    // scribble over the primary header on disk
    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .open(&path)
        .unwrap();
    file.seek(SeekFrom::Start(0)).unwrap();
    file.write_all(&[0xff; 1024]).unwrap();
    drop(file);

    let pool = Pool::open(&path, "test").unwrap();
    assert_eq!(
        pool.alloc_usable_size(PoolOffset::new(p)).unwrap(),
        CHUNK_SIZE
    );
    pool.close().unwrap();
    assert!(Pool::check(&path, "test").unwrap());
    std::fs::remove_file(&path).unwrap();
}

#[test]
fn torn_close_reopens_cleanly() {
    let path = pool_path("torn");
    let pool = Pool::create(&path, "test", TEST_POOL_SIZE, 0o600).unwrap();
    let mut p = 0u64;
    unsafe {
        pool.pmalloc(&mut p, 1024).unwrap();
    }
    // no clean shutdown at all
    pool.crash();

    let pool = Pool::open(&path, "test").unwrap();
    assert!(pool.alloc_usable_size(PoolOffset::new(p)).is_ok());
    unsafe {
        let mut q = p;
        pool.pfree(&mut q).unwrap();
        assert_eq!(q, 0);
    }
    pool.close().unwrap();
    assert!(Pool::check(&path, "test").unwrap());
    std::fs::remove_file(&path).unwrap();
}

#[test]
fn alloc_free_cycle_leaves_a_consistent_pool() {
    let path = pool_path("cycle");
    let pool = Pool::create(&path, "test", TEST_POOL_SIZE, 0o600).unwrap();

    unsafe {
        let mut cells = [0u64; 16];
        for (i, cell) in cells.iter_mut().enumerate() {
            pool.pmalloc(cell, (i + 1) * 1000).unwrap();
        }
        for cell in cells.iter_mut().rev() {
            pool.pfree(cell).unwrap();
        }
    }

    let mut allocated = CtlArg::U64(0);
    let mut freed = CtlArg::U64(0);
    ctl(Some(&pool), "stats.heap.allocated", Some(&mut allocated), None).unwrap();
    ctl(Some(&pool), "stats.heap.freed", Some(&mut freed), None).unwrap();
    match (&allocated, &freed) {
        (CtlArg::U64(a), CtlArg::U64(f)) => assert_eq!(a, f),
        _ => unreachable!(),
    }

    pool.close().unwrap();
    assert!(Pool::check(&path, "test").unwrap());
    std::fs::remove_file(&path).unwrap();
}
