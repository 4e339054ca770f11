//! CTL integration tests: heap statistics and the allocation-class
//! interface against a live pool.

use std::path::PathBuf;

use cinnabar::heap::layout::CHUNK_SIZE;
use cinnabar::{
    ctl, AllocClassDesc, AllocClassParams, AllocClassRange, CtlArg, Error, HeaderKind, Pool,
    PoolOffset,
};

const TEST_POOL_SIZE: u64 = 64 * 1024 * 1024;

fn pool_path(name: &str) -> PathBuf {
    let path = std::env::temp_dir().join(format!(
        "cinnabar-ctl-{}-{}.pool",
        name,
        std::process::id()
    ));
    let _ = std::fs::remove_file(&path);
    path
}

fn read_u64_leaf(pool: &Pool, name: &str) -> u64 {
    let mut arg = CtlArg::U64(u64::MAX);
    pool.ctl(name, Some(&mut arg), None).unwrap();
    match arg {
        CtlArg::U64(v) => v,
        _ => unreachable!(),
    }
}

fn set_class(pool: &Pool, id: usize, header_kind: HeaderKind, unit_size: usize, upb: u32) {
    let mut desc = CtlArg::ClassDesc(AllocClassDesc {
        header_kind,
        unit_size,
        units_per_block: upb,
    });
    pool.ctl(&format!("heap.alloc_class.{}.desc", id), None, Some(&mut desc))
        .unwrap();
}

fn map_range(pool: &Pool, class_id: usize, start: usize, end: usize) {
    let mut range = CtlArg::MapRange(AllocClassRange {
        class_id,
        start,
        end,
    });
    pool.ctl("heap.alloc_class.map.range", None, Some(&mut range))
        .unwrap();
}

#[test]
fn heap_stats_follow_the_allocator() {
    let path = pool_path("stats");
    let pool = Pool::create(&path, "test", TEST_POOL_SIZE, 0o600).unwrap();

    assert_eq!(read_u64_leaf(&pool, "stats.heap.allocated"), 0);
    assert_eq!(read_u64_leaf(&pool, "stats.heap.freed"), 0);
    assert_eq!(read_u64_leaf(&pool, "stats.heap.active_zones"), 1);

    let mut p = 0u64;
    unsafe {
        pool.pmalloc(&mut p, 64).unwrap();
        pool.pfree(&mut p).unwrap();
    }

    // the huge class rounds a tiny allocation up to a whole chunk
    assert_eq!(read_u64_leaf(&pool, "stats.heap.allocated"), CHUNK_SIZE as u64);
    assert_eq!(read_u64_leaf(&pool, "stats.heap.freed"), CHUNK_SIZE as u64);

    pool.close().unwrap();
    std::fs::remove_file(&path).unwrap();
}

#[test]
fn alloc_class_scenario() {
    let path = pool_path("classes");
    let pool = Pool::create(&path, "test", TEST_POOL_SIZE, 0o600).unwrap();

    let mut params = CtlArg::ClassParams(AllocClassParams {
        fail_no_matching_class: true,
        granularity: 16,
        limit: 1024 * 1024,
    });
    pool.ctl("heap.alloc_class.reset", None, Some(&mut params))
        .unwrap();

    let mut p = 0u64;
    unsafe {
        // no classes at all
        assert!(matches!(pool.pmalloc(&mut p, 128), Err(Error::Inval)));
    }

    set_class(&pool, 0, HeaderKind::Minimal, 128, 1000);
    set_class(&pool, 1, HeaderKind::Compact, 1024, 1000);

    unsafe {
        // classes registered but no range mapped yet
        assert!(matches!(pool.pmalloc(&mut p, 128), Err(Error::Inval)));
    }

    map_range(&pool, 0, 17, 128);
    map_range(&pool, 1, 129, 1024);

    unsafe {
        pool.pmalloc(&mut p, 128).unwrap();
        assert_eq!(pool.alloc_usable_size(PoolOffset::new(p)).unwrap(), 128);
        pool.pfree(&mut p).unwrap();

        // below and above every mapped range
        assert!(matches!(pool.pmalloc(&mut p, 8), Err(Error::Inval)));
        assert!(matches!(pool.pmalloc(&mut p, 2048), Err(Error::Inval)));

        // a compact-header block takes an extra unit for its header
        pool.pmalloc(&mut p, 1024).unwrap();
        assert_eq!(
            pool.alloc_usable_size(PoolOffset::new(p)).unwrap(),
            2 * 1024 - 16
        );
        pool.pfree(&mut p).unwrap();
    }

    let mut back = CtlArg::ClassDesc(AllocClassDesc {
        header_kind: HeaderKind::None,
        unit_size: 0,
        units_per_block: 0,
    });
    pool.ctl("heap.alloc_class.0.desc", Some(&mut back), None)
        .unwrap();
    match back {
        CtlArg::ClassDesc(desc) => {
            assert_eq!(desc.header_kind, HeaderKind::Minimal);
            assert_eq!(desc.unit_size, 128);
            assert_eq!(desc.units_per_block, 1000);
        }
        _ => unreachable!(),
    }

    // unknown class ids do not read back
    let mut bad = CtlArg::ClassDesc(AllocClassDesc {
        header_kind: HeaderKind::None,
        unit_size: 0,
        units_per_block: 0,
    });
    assert!(pool
        .ctl("heap.alloc_class.6.desc", Some(&mut bad), None)
        .is_err());

    pool.close().unwrap();
    std::fs::remove_file(&path).unwrap();
}

#[test]
fn class_mapped_alloc_free_cycle_reuses_the_block() {
    let path = pool_path("cycle");
    let pool = Pool::create(&path, "test", TEST_POOL_SIZE, 0o600).unwrap();

    let mut params = CtlArg::ClassParams(AllocClassParams {
        fail_no_matching_class: false,
        granularity: 8,
        limit: 0,
    });
    pool.ctl("heap.alloc_class.reset", None, Some(&mut params))
        .unwrap();
    set_class(&pool, 1, HeaderKind::None, CHUNK_SIZE, 1);
    set_class(&pool, 0, HeaderKind::Minimal, 128, 1000);
    map_range(&pool, 0, 17, 128);

    let mut p = 0u64;
    let mut q = 0u64;
    unsafe {
        pool.pmalloc(&mut p, 128).unwrap();
        let first = p;
        pool.pfree(&mut p).unwrap();

        assert_eq!(read_u64_leaf(&pool, "stats.heap.allocated"), 128);
        assert_eq!(read_u64_leaf(&pool, "stats.heap.freed"), 128);

        pool.pmalloc(&mut q, 128).unwrap();
        assert_eq!(q, first, "the freed unit must be handed out again");
        pool.pfree(&mut q).unwrap();
    }

    pool.close().unwrap();
    assert!(Pool::check(&path, "test").unwrap());
    std::fs::remove_file(&path).unwrap();
}

#[test]
fn parser_and_test_leaves() {
    // exercised without any pool, as the global leaves must be
    assert!(ctl(None, "a.b.c.d", Some(&mut CtlArg::Int(0)), None).is_err());

    let mut r = CtlArg::Int(1);
    let mut w = CtlArg::Int(0);
    ctl(None, "debug.test_rw", Some(&mut r), Some(&mut w)).unwrap();
    assert!(matches!(r, CtlArg::Int(0)));
    assert!(matches!(w, CtlArg::Int(1)));

    let path = pool_path("parser");
    let pool = Pool::create(&path, "test", TEST_POOL_SIZE, 0o600).unwrap();
    let mut out = CtlArg::U64(u64::MAX);
    ctl(Some(&pool), "stats.heap.allocated", Some(&mut out), None).unwrap();
    assert!(matches!(out, CtlArg::U64(0)));

    pool.close().unwrap();
    std::fs::remove_file(&path).unwrap();
}
