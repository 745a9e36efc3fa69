//! On-disk layout of the store file.
//!
//! The file starts with a 24 byte metadata header followed by a heterogeneous
//! stream of serialized internal and leaf nodes. All multi-byte integers are
//! little-endian. Nodes are never overwritten; superseded ones linger until
//! compaction rebuilds the file.

use std::mem::size_of;

use zerocopy::{
    byteorder::{LittleEndian, U16, U32, U64},
    AsBytes, FromBytes, FromZeroes, Unaligned,
};

pub(crate) type LeU16 = U16<LittleEndian>;
pub(crate) type LeU32 = U32<LittleEndian>;
pub(crate) type LeU64 = U64<LittleEndian>;

/// Byte length of the metadata header.
pub(crate) const META_LEN: usize = size_of::<MetaBlock>();
/// Fixed prefix of a serialized internal node, up to (and including) the
/// leaf offset word. The child offset words follow.
pub(crate) const NODE_HEADER_LEN: usize = size_of::<NodeHeader>();
/// Fixed prefix of a serialized leaf node. Key and value bytes follow.
pub(crate) const LEAF_HEADER_LEN: usize = size_of::<LeafHeader>();
/// Byte length of one child offset word.
pub(crate) const CHILD_PTR_LEN: usize = size_of::<u64>();
/// File offset of the first root node, right past the metadata header.
pub(crate) const INIT_ROOT_OFFSET: u64 = META_LEN as u64;

/// Byte offsets of the three metadata words.
pub(crate) const META_VERSION_AT: usize = 0;
pub(crate) const META_ROOT_AT: usize = 8;
pub(crate) const META_NEXT_FREE_AT: usize = 16;

/// The metadata header at bytes `0..24` of the file.
#[derive(Debug, Clone, Copy, FromZeroes, FromBytes, AsBytes, Unaligned)]
#[repr(C)]
pub(crate) struct MetaBlock {
    /// Version of the currently published root.
    pub version: LeU64,
    /// File offset of the currently published root node.
    pub root_offset: LeU64,
    /// First byte past the last serialized node; the append tail.
    pub next_free: LeU64,
}

/// Fixed-size prefix of a serialized internal node.
///
/// `popcount(bitmap)` child offset words follow the header, in ascending
/// index order, and the node's own leaf is serialized at `leaf_offset`
/// (immediately after the child words).
#[derive(Debug, Clone, Copy, FromZeroes, FromBytes, AsBytes, Unaligned)]
#[repr(C)]
pub(crate) struct NodeHeader {
    pub version: LeU64,
    /// Offset of the first byte of this node.
    pub start_offset: LeU64,
    /// Offset of the last byte of the fixed part, inclusive.
    pub end_offset: LeU64,
    /// 256 bit sparse index; bit `k` marks a child slot for byte `k`.
    pub bitmap: [LeU32; 8],
    /// Offset of this node's own leaf.
    pub leaf_offset: LeU64,
}

/// Fixed-size prefix of a serialized leaf node.
///
/// The key follows the header, then the value; the value length is whatever
/// remains up to `end_offset` (inclusive).
#[derive(Debug, Clone, Copy, FromZeroes, FromBytes, AsBytes, Unaligned)]
#[repr(C)]
pub(crate) struct LeafHeader {
    pub version: LeU64,
    pub start_offset: LeU64,
    pub end_offset: LeU64,
    pub key_len: LeU16,
}

const _: () = assert!(META_LEN == 24);
const _: () = assert!(NODE_HEADER_LEN == 64);
const _: () = assert!(LEAF_HEADER_LEN == 26);

/// A consistent snapshot of the store's metadata header.
///
/// Passed to compaction trigger predicates and returned by
/// [`crate::Store::metadata`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Metadata {
    /// Version of the currently published root.
    pub version: u64,
    /// File offset at which the published root node begins.
    pub root_offset: u64,
    /// First byte beyond the last serialized node.
    pub next_free: u64,
}

impl From<MetaBlock> for Metadata {
    fn from(block: MetaBlock) -> Self {
        Metadata {
            version: block.version.get(),
            root_offset: block.root_offset.get(),
            next_free: block.next_free.get(),
        }
    }
}

impl From<Metadata> for MetaBlock {
    fn from(meta: Metadata) -> Self {
        MetaBlock {
            version: LeU64::new(meta.version),
            root_offset: LeU64::new(meta.root_offset),
            next_free: LeU64::new(meta.next_free),
        }
    }
}
