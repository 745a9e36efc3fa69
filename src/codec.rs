//! Translation between the on-disk layout and in-memory nodes.
//!
//! Deserializers bounds-check every field against the slice they are handed
//! and against the published tail offset, surfacing violations as corruption.
//! `serialize_path` lays out a freshly built path the way the publisher
//! appends it: each node's fixed part, its child offset words, its own leaf,
//! then the subtrees of the children written by the same transaction; children
//! of earlier versions are referenced by their existing offsets only.

use smallvec::SmallVec;
use zerocopy::{AsBytes, FromBytes};

use crate::{
    error::corruption,
    node::{Bitmap, Child, INode, LNode},
    pool::NodePool,
    repr::{
        LeU16, LeU32, LeU64, LeafHeader, MetaBlock, Metadata, NodeHeader, CHILD_PTR_LEN,
        LEAF_HEADER_LEN, META_LEN, NODE_HEADER_LEN,
    },
    Error,
};

/// Decodes the 24 byte metadata header from an exact-sized slice.
pub(crate) fn read_metadata(bytes: &[u8]) -> Result<Metadata, Error> {
    if bytes.len() != META_LEN {
        return Err(corruption!("metadata length {} != {META_LEN}", bytes.len()));
    }
    let block = MetaBlock::read_from(bytes)
        .ok_or_else(|| corruption!("metadata block failed to decode"))?;
    Ok(block.into())
}

/// Encodes the metadata header.
pub(crate) fn write_metadata(meta: Metadata) -> [u8; META_LEN] {
    let mut out = [0u8; META_LEN];
    out.copy_from_slice(MetaBlock::from(meta).as_bytes());
    out
}

/// Decodes the internal node starting at `offset`, along with its own leaf.
/// Children stay unexpanded (offset references). `limit` is the published
/// tail: every offset the node mentions must fall inside `[24, limit)`.
pub(crate) fn read_inode(bytes: &[u8], offset: u64, limit: u64) -> Result<Box<INode>, Error> {
    if offset < META_LEN as u64 || offset >= limit {
        return Err(corruption!("node offset {offset} outside [24, {limit})"));
    }
    let start = offset as usize;
    let header = bytes
        .get(start..start + NODE_HEADER_LEN)
        .and_then(NodeHeader::read_from)
        .ok_or_else(|| corruption!("node header at {offset} exceeds the view"))?;
    if header.start_offset.get() != offset {
        return Err(corruption!(
            "node at {offset} claims start {}",
            header.start_offset.get()
        ));
    }
    let bitmap = Bitmap::from_words(header.bitmap.map(|word| word.get()));
    let child_count = bitmap.len();
    let end_offset = header.end_offset.get();
    let expected_end = offset + (NODE_HEADER_LEN + child_count * CHILD_PTR_LEN) as u64 - 1;
    if end_offset != expected_end || end_offset >= limit {
        return Err(corruption!(
            "node at {offset} with {child_count} children ends at {end_offset}, expected {expected_end} < {limit}"
        ));
    }
    let words = bytes
        .get(start + NODE_HEADER_LEN..=end_offset as usize)
        .ok_or_else(|| corruption!("node child table at {offset} exceeds the view"))?;
    let mut children = SmallVec::with_capacity(child_count);
    for word in words.chunks_exact(CHILD_PTR_LEN) {
        let child_offset = u64::from_le_bytes(word.try_into().unwrap());
        if child_offset < META_LEN as u64 || child_offset >= limit {
            return Err(corruption!(
                "node at {offset} references child at {child_offset}, outside [24, {limit})"
            ));
        }
        children.push(Child::Disk(child_offset));
    }
    let leaf_offset = header.leaf_offset.get();
    if leaf_offset != end_offset + 1 {
        return Err(corruption!(
            "node at {offset} places its leaf at {leaf_offset}, expected {}",
            end_offset + 1
        ));
    }
    let leaf = read_lnode(bytes, leaf_offset, limit)?;
    Ok(Box::new(INode {
        version: header.version.get(),
        start_offset: offset,
        end_offset,
        bitmap,
        leaf,
        children,
    }))
}

/// Decodes the leaf node starting at `offset`.
pub(crate) fn read_lnode(bytes: &[u8], offset: u64, limit: u64) -> Result<Box<LNode>, Error> {
    if offset < META_LEN as u64 || offset >= limit {
        return Err(corruption!("leaf offset {offset} outside [24, {limit})"));
    }
    let start = offset as usize;
    let header = bytes
        .get(start..start + LEAF_HEADER_LEN)
        .and_then(LeafHeader::read_from)
        .ok_or_else(|| corruption!("leaf header at {offset} exceeds the view"))?;
    if header.start_offset.get() != offset {
        return Err(corruption!(
            "leaf at {offset} claims start {}",
            header.start_offset.get()
        ));
    }
    let end_offset = header.end_offset.get();
    if end_offset < offset + LEAF_HEADER_LEN as u64 - 1 || end_offset >= limit {
        return Err(corruption!(
            "leaf at {offset} ends at {end_offset}, outside [{}, {limit})",
            offset + LEAF_HEADER_LEN as u64 - 1
        ));
    }
    let total = (end_offset - offset + 1) as usize;
    let key_len = usize::from(header.key_len.get());
    if LEAF_HEADER_LEN + key_len > total {
        return Err(corruption!(
            "leaf at {offset} claims a {key_len} byte key in a {total} byte frame"
        ));
    }
    let payload = bytes
        .get(start + LEAF_HEADER_LEN..start + total)
        .ok_or_else(|| corruption!("leaf payload at {offset} exceeds the view"))?;
    Ok(Box::new(LNode {
        version: header.version.get(),
        start_offset: offset,
        end_offset,
        key: payload[..key_len].to_vec(),
        value: payload[key_len..].to_vec(),
    }))
}

/// Serialized length of a freshly built subtree: this node, its leaf, and
/// every same-transaction child below it.
fn subtree_len(node: &INode) -> u64 {
    let mut total = node.fixed_len() + node.leaf.disk_len();
    for child in &node.children {
        if let Child::Mem(child) = child {
            total += subtree_len(child);
        }
    }
    total
}

/// Serializes the path rooted at `root` as it will appear in the file
/// starting at `start_offset`, consuming the path and recycling its nodes.
pub(crate) fn serialize_path(root: Box<INode>, start_offset: u64, pool: &NodePool) -> Vec<u8> {
    let mut out = Vec::with_capacity(subtree_len(&root) as usize);
    emit_subtree(root, start_offset, pool, &mut out);
    out
}

fn emit_subtree(mut node: Box<INode>, offset: u64, pool: &NodePool, out: &mut Vec<u8>) {
    node.start_offset = offset;
    node.end_offset = offset + node.fixed_len() - 1;
    node.leaf.start_offset = node.end_offset + 1;
    node.leaf.end_offset = node.leaf.start_offset + node.leaf.disk_len() - 1;

    let mut bitmap_words = [LeU32::new(0); 8];
    for (word, value) in bitmap_words.iter_mut().zip(node.bitmap.words()) {
        *word = LeU32::new(*value);
    }
    let header = NodeHeader {
        version: LeU64::new(node.version),
        start_offset: LeU64::new(node.start_offset),
        end_offset: LeU64::new(node.end_offset),
        bitmap: bitmap_words,
        leaf_offset: LeU64::new(node.leaf.start_offset),
    };
    out.extend_from_slice(header.as_bytes());

    // child words; in-path children land inline right after the leaf
    let mut inline_lens: SmallVec<[u64; 4]> = SmallVec::new();
    let mut next = node.leaf.end_offset + 1;
    for child in &node.children {
        match child {
            Child::Disk(child_offset) => out.extend_from_slice(&child_offset.to_le_bytes()),
            Child::Mem(child) => {
                debug_assert_eq!(child.version, node.version);
                out.extend_from_slice(&next.to_le_bytes());
                let len = subtree_len(child);
                inline_lens.push(len);
                next += len;
            }
        }
    }

    emit_leaf(&node.leaf, out);

    let mut next = node.leaf.end_offset + 1;
    let mut inline_lens = inline_lens.into_iter();
    for child in std::mem::take(&mut node.children) {
        if let Child::Mem(child) = child {
            emit_subtree(child, next, pool, out);
            next += inline_lens.next().unwrap_or(0);
        }
    }

    pool.release_internal(node);
}

fn emit_leaf(leaf: &LNode, out: &mut Vec<u8>) {
    let header = LeafHeader {
        version: LeU64::new(leaf.version),
        start_offset: LeU64::new(leaf.start_offset),
        end_offset: LeU64::new(leaf.end_offset),
        key_len: LeU16::new(leaf.key.len() as u16),
    };
    out.extend_from_slice(header.as_bytes());
    out.extend_from_slice(&leaf.key);
    out.extend_from_slice(&leaf.value);
}

/// Serializes a standalone node, used for compaction rebuilds where the
/// child offsets are already final.
pub(crate) fn write_node(
    node: &INode,
    child_offsets: &[u64],
    out: &mut Vec<u8>,
) {
    debug_assert_eq!(node.children.len(), child_offsets.len());
    let mut bitmap_words = [LeU32::new(0); 8];
    for (word, value) in bitmap_words.iter_mut().zip(node.bitmap.words()) {
        *word = LeU32::new(*value);
    }
    let header = NodeHeader {
        version: LeU64::new(node.version),
        start_offset: LeU64::new(node.start_offset),
        end_offset: LeU64::new(node.end_offset),
        bitmap: bitmap_words,
        leaf_offset: LeU64::new(node.leaf.start_offset),
    };
    out.extend_from_slice(header.as_bytes());
    for child_offset in child_offsets {
        out.extend_from_slice(&child_offset.to_le_bytes());
    }
    emit_leaf(&node.leaf, out);
}
