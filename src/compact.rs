//! Online compaction: rebuild the live version into a fresh file.
//!
//! Every publication appends a new path, so superseded nodes accumulate
//! until the file is mostly history. When the trigger predicate fires, the
//! compactor walks the tree reachable from the current root, writes each
//! node into a temp file at version 0, and swaps the temp file in as the
//! live one while holding the region exclusively. Writers and readers are
//! parked on the resize flag and the region lock for the duration.
//!
//! Failures leave the original file untouched: the temp file is removed,
//! the error logged, and no retry is attempted until the trigger fires
//! again.

use std::sync::atomic::Ordering;
use std::thread;

use triomphe::Arc;

use crate::{
    codec,
    error::corruption,
    node::INode,
    region::MappedRegion,
    repr::{Metadata, INIT_ROOT_OFFSET},
    store::StoreInner,
    Error,
};

pub(crate) fn compactor_loop(inner: Arc<StoreInner>) {
    while inner.compact_signal.wait() {
        if inner.is_closed() {
            break;
        }
        match run(&inner) {
            Ok(meta) => info!(
                "compaction complete, live set rebuilt into {} tail bytes",
                meta.next_free
            ),
            Err(Error::StoreClosed) => break,
            Err(err) => error!("compaction failed: {err}"),
        }
    }
}

fn run(inner: &StoreInner) -> Result<Metadata, Error> {
    // own the resize flag for the whole rebuild so no grow interleaves and
    // entrants stop queueing on the region lock
    while inner
        .resizing
        .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
        .is_err()
    {
        if inner.is_closed() {
            return Err(Error::StoreClosed);
        }
        thread::yield_now();
    }
    let result = run_exclusive(inner);
    inner.resizing.store(false, Ordering::Release);
    result
}

fn run_exclusive(inner: &StoreInner) -> Result<Metadata, Error> {
    let mut region = inner.region.write();
    let meta = region.load_metadata();
    let temp_path = inner.opts.temp_path();
    let swap_path = inner.opts.swap_path();
    debug!(
        "compacting version {} ({} tail bytes) into {temp_path:?}",
        meta.version, meta.next_free
    );

    let result = (|| {
        let mut temp = MappedRegion::create(&temp_path)?;
        let root = codec::read_inode(region.bytes(), meta.root_offset, meta.next_free)?;
        let next_free = rebuild(region.bytes(), meta.next_free, &mut temp, root, INIT_ROOT_OFFSET)?;
        temp.store_metadata(Metadata {
            version: 0,
            root_offset: INIT_ROOT_OFFSET,
            next_free,
        });
        temp.flush_all()?;
        drop(temp);
        region.swap_in(&temp_path, &swap_path)?;
        region.validate_metadata()
    })();
    if result.is_err() {
        let _ = std::fs::remove_file(&temp_path);
    }
    result
}

/// Writes the subtree rooted at `node` into the temp region at `offset`,
/// children laid out depth-first after the node's own leaf, every version
/// reset to 0. Returns the offset right past the subtree.
fn rebuild(
    src: &[u8],
    src_limit: u64,
    temp: &mut MappedRegion,
    mut node: Box<INode>,
    offset: u64,
) -> Result<u64, Error> {
    node.version = 0;
    node.leaf.version = 0;
    node.start_offset = offset;
    node.end_offset = offset + node.fixed_len() - 1;
    node.leaf.start_offset = node.end_offset + 1;
    node.leaf.end_offset = node.leaf.start_offset + node.leaf.disk_len() - 1;

    let mut next = node.leaf.end_offset + 1;
    let mut child_offsets = Vec::with_capacity(node.children.len());
    for child in &node.children {
        let Some(child_offset) = child.disk_offset() else {
            return Err(corruption!("published tree contains an in-memory child"));
        };
        let child_node = codec::read_inode(src, child_offset, src_limit)?;
        child_offsets.push(next);
        next = rebuild(src, src_limit, temp, child_node, next)?;
    }

    temp.grow_to(node.leaf.end_offset + 1)?;
    let mut bytes = Vec::with_capacity((node.fixed_len() + node.leaf.disk_len()) as usize);
    codec::write_node(&node, &child_offsets, &mut bytes);
    temp.write_at(offset, &bytes)?;
    Ok(next)
}
