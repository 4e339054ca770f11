//! CTL: the dotted-name parameter tree
//!
//! Statistics and tunables are exposed as a tree of named nodes with read
//! and/or write callbacks at the leaves. A query tokenises the name on `.`
//! and descends through the children arrays; argument validity follows the
//! node: reading a write-only leaf, writing a read-only leaf, passing no
//! argument at all or an argument of the wrong shape are all invalid.
//!
//! Global leaves (the `debug.test_*` self-tests and the prefault toggles)
//! work without a pool handle.

use std::sync::atomic::Ordering;

use crate::bucket::{AllocClass, ClassRange, HeaderKind};
use crate::error::Error;
use crate::pool::{Pool, PREFAULT_AT_CREATE, PREFAULT_AT_OPEN};
use crate::result::Result;

/// Description of one allocation class, as read and written through
/// `heap.alloc_class.<id>.desc`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocClassDesc {
    pub header_kind: HeaderKind,
    pub unit_size: usize,
    pub units_per_block: u32,
}

/// Arguments of `heap.alloc_class.reset`.
#[derive(Debug, Clone, Copy)]
pub struct AllocClassParams {
    pub fail_no_matching_class: bool,
    pub granularity: usize,
    pub limit: usize,
}

/// Arguments of `heap.alloc_class.map.range`: sizes in `[start, end]` are
/// served by `class_id`.
#[derive(Debug, Clone, Copy)]
pub struct AllocClassRange {
    pub class_id: usize,
    pub start: usize,
    pub end: usize,
}

/// A typed CTL argument. The variant must match what the leaf expects.
#[derive(Debug)]
pub enum CtlArg {
    U64(u64),
    Int(i32),
    Bool(bool),
    ClassDesc(AllocClassDesc),
    ClassParams(AllocClassParams),
    MapRange(AllocClassRange),
}

struct CtlCtx<'a> {
    pool: Option<&'a Pool>,
    index: Option<usize>,
}

impl<'a> CtlCtx<'a> {
    fn pool(&self) -> Result<&'a Pool> {
        self.pool.ok_or(Error::Inval)
    }

    fn index(&self) -> Result<usize> {
        self.index.ok_or(Error::Inval)
    }
}

type Callback = fn(&CtlCtx, &mut CtlArg) -> Result<()>;

/// One node of the tree. A node matching any numeric token carries the
/// name `"*"` and passes the parsed index down through the context.
struct Node {
    name: &'static str,
    read: Option<Callback>,
    write: Option<Callback>,
    children: &'static [Node],
}

const fn leaf_ro(name: &'static str, read: Callback) -> Node {
    Node {
        name,
        read: Some(read),
        write: None,
        children: &[],
    }
}

const fn leaf_wo(name: &'static str, write: Callback) -> Node {
    Node {
        name,
        read: None,
        write: Some(write),
        children: &[],
    }
}

const fn leaf_rw(name: &'static str, read: Callback, write: Callback) -> Node {
    Node {
        name,
        read: Some(read),
        write: Some(write),
        children: &[],
    }
}

const fn child(name: &'static str, children: &'static [Node]) -> Node {
    Node {
        name,
        read: None,
        write: None,
        children,
    }
}

fn stats_heap_allocated_read(ctx: &CtlCtx, arg: &mut CtlArg) -> Result<()> {
    let pool = ctx.pool()?;
    match arg {
        CtlArg::U64(out) => {
            *out = pool.stats().allocated();
            Ok(())
        }
        _ => Err(Error::Inval),
    }
}

fn stats_heap_freed_read(ctx: &CtlCtx, arg: &mut CtlArg) -> Result<()> {
    let pool = ctx.pool()?;
    match arg {
        CtlArg::U64(out) => {
            *out = pool.stats().freed();
            Ok(())
        }
        _ => Err(Error::Inval),
    }
}

fn stats_heap_active_zones_read(ctx: &CtlCtx, arg: &mut CtlArg) -> Result<()> {
    let pool = ctx.pool()?;
    match arg {
        CtlArg::U64(out) => {
            *out = pool.zones_active() as u64;
            Ok(())
        }
        _ => Err(Error::Inval),
    }
}

// The test leaves set the read argument to 0 and the write argument to 1,
// so a caller can observe which callbacks ran.

fn debug_test_read(_ctx: &CtlCtx, arg: &mut CtlArg) -> Result<()> {
    match arg {
        CtlArg::Int(v) => {
            *v = 0;
            Ok(())
        }
        _ => Err(Error::Inval),
    }
}

fn debug_test_write(_ctx: &CtlCtx, arg: &mut CtlArg) -> Result<()> {
    match arg {
        CtlArg::Int(v) => {
            *v = 1;
            Ok(())
        }
        _ => Err(Error::Inval),
    }
}

fn prefault_at_create_write(_ctx: &CtlCtx, arg: &mut CtlArg) -> Result<()> {
    match arg {
        CtlArg::Bool(v) => {
            PREFAULT_AT_CREATE.store(*v, Ordering::Relaxed);
            Ok(())
        }
        _ => Err(Error::Inval),
    }
}

fn prefault_at_open_write(_ctx: &CtlCtx, arg: &mut CtlArg) -> Result<()> {
    match arg {
        CtlArg::Bool(v) => {
            PREFAULT_AT_OPEN.store(*v, Ordering::Relaxed);
            Ok(())
        }
        _ => Err(Error::Inval),
    }
}

fn alloc_class_desc_read(ctx: &CtlCtx, arg: &mut CtlArg) -> Result<()> {
    let pool = ctx.pool()?;
    let id = ctx.index()?;
    let class = pool
        .classes()
        .lock()
        .unwrap()
        .class(id)
        .ok_or(Error::Inval)?;
    match arg {
        CtlArg::ClassDesc(desc) => {
            *desc = AllocClassDesc {
                header_kind: class.header,
                unit_size: class.unit_size,
                units_per_block: class.units_per_block,
            };
            Ok(())
        }
        _ => Err(Error::Inval),
    }
}

fn alloc_class_desc_write(ctx: &CtlCtx, arg: &mut CtlArg) -> Result<()> {
    let pool = ctx.pool()?;
    let id = ctx.index()?;
    match arg {
        CtlArg::ClassDesc(desc) => pool.classes().lock().unwrap().register(
            id,
            AllocClass {
                unit_size: desc.unit_size,
                units_per_block: desc.units_per_block,
                header: desc.header_kind,
            },
        ),
        _ => Err(Error::Inval),
    }
}

fn alloc_class_reset_write(ctx: &CtlCtx, arg: &mut CtlArg) -> Result<()> {
    let pool = ctx.pool()?;
    match arg {
        CtlArg::ClassParams(params) => {
            pool.classes().lock().unwrap().reset(
                params.fail_no_matching_class,
                params.granularity,
                params.limit,
            );
            Ok(())
        }
        _ => Err(Error::Inval),
    }
}

fn alloc_class_map_range_write(ctx: &CtlCtx, arg: &mut CtlArg) -> Result<()> {
    let pool = ctx.pool()?;
    match arg {
        CtlArg::MapRange(range) => pool.classes().lock().unwrap().map_range(ClassRange {
            class_id: range.class_id,
            start: range.start,
            end: range.end,
        }),
        _ => Err(Error::Inval),
    }
}

static STATS_HEAP: [Node; 3] = [
    leaf_ro("allocated", stats_heap_allocated_read),
    leaf_ro("freed", stats_heap_freed_read),
    leaf_ro("active_zones", stats_heap_active_zones_read),
];

static STATS: [Node; 1] = [child("heap", &STATS_HEAP)];

static DEBUG: [Node; 3] = [
    leaf_ro("test_ro", debug_test_read),
    leaf_wo("test_wo", debug_test_write),
    leaf_rw("test_rw", debug_test_read, debug_test_write),
];

static ALLOC_CLASS_ID: [Node; 1] = [leaf_rw("desc", alloc_class_desc_read, alloc_class_desc_write)];

static ALLOC_CLASS_MAP: [Node; 1] = [leaf_wo("range", alloc_class_map_range_write)];

static ALLOC_CLASS: [Node; 3] = [
    leaf_wo("reset", alloc_class_reset_write),
    child("map", &ALLOC_CLASS_MAP),
    child("*", &ALLOC_CLASS_ID),
];

static HEAP: [Node; 1] = [child("alloc_class", &ALLOC_CLASS)];

static PREFAULT: [Node; 2] = [
    leaf_wo("at_create", prefault_at_create_write),
    leaf_wo("at_open", prefault_at_open_write),
];

static ROOT: [Node; 4] = [
    child("debug", &DEBUG),
    child("stats", &STATS),
    child("heap", &HEAP),
    child("prefault", &PREFAULT),
];

/// Reads and/or writes the parameter at `name`.
///
/// A read leaf fills `read_arg`, a write leaf consumes (and may update)
/// `write_arg`; when both are given the read runs first. Unknown paths and
/// invalid argument combinations report [`Error::Inval`].
pub fn ctl(
    pool: Option<&Pool>,
    name: &str,
    mut read_arg: Option<&mut CtlArg>,
    mut write_arg: Option<&mut CtlArg>,
) -> Result<()> {
    let mut ctx = CtlCtx { pool, index: None };
    let mut nodes: &[Node] = &ROOT;
    let mut found: Option<&Node> = None;

    for token in name.split('.') {
        let mut next = nodes.iter().find(|n| n.name == token);
        if next.is_none() && !token.is_empty() {
            if let Ok(index) = token.parse::<usize>() {
                if let Some(indexed) = nodes.iter().find(|n| n.name == "*") {
                    ctx.index = Some(index);
                    next = Some(indexed);
                }
            }
        }
        let Some(node) = next else {
            return Err(Error::Inval);
        };
        nodes = node.children;
        found = Some(node);
    }

    // discard invalid calls, including mostly-correct ones with an
    // extraneous argument
    let Some(node) = found else {
        return Err(Error::Inval);
    };
    if read_arg.is_none() && write_arg.is_none() {
        return Err(Error::Inval);
    }
    if read_arg.is_some() && node.read.is_none() {
        return Err(Error::Inval);
    }
    if write_arg.is_some() && node.write.is_none() {
        return Err(Error::Inval);
    }

    if let Some(arg) = read_arg.as_deref_mut() {
        node.read.unwrap()(&ctx, arg)?;
    }
    if let Some(arg) = write_arg.as_deref_mut() {
        node.write.unwrap()(&ctx, arg)?;
    }
    Ok(())
}
