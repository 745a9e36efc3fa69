//! Path-copy mutations and lookups over the trie.
//!
//! Key bytes index the 256-way fan out one byte per level; a key of length
//! `L` can terminate in the own-leaf slot of the internal node at depth `L`.
//! The own leaf of a node only ever holds a key that sorts at or before every
//! key in the node's subtrees, which is what makes own-leaf-first enumeration
//! come out in ascending order.
//!
//! Mutations operate on a working tree owned by one update transaction:
//! nodes already carrying the transaction's version are modified in place,
//! anything older is materialized from the mapped file, re-tagged, and
//! spliced in as an in-memory child.

use crate::{
    codec,
    error::corruption,
    node::{Child, INode, LNode},
    pool::NodePool,
    Error, KeyValuePair,
};

/// Everything a traversal needs: the mapped byte view, the node pools, the
/// transaction's version, and the published tail bounding all node offsets.
pub(crate) struct WalkCtx<'a> {
    pub bytes: &'a [u8],
    pub pool: &'a NodePool,
    pub version: u64,
    pub limit: u64,
}

impl WalkCtx<'_> {
    /// Materializes the internal node at `offset` from the mapped view.
    pub fn load_inode(&self, offset: u64) -> Result<Box<INode>, Error> {
        codec::read_inode(self.bytes, offset, self.limit)
    }

    fn new_leaf(&self, key: &[u8], value: &[u8]) -> Box<LNode> {
        let mut leaf = self.pool.acquire_leaf();
        leaf.version = self.version;
        leaf.key.extend_from_slice(key);
        leaf.value.extend_from_slice(value);
        leaf
    }

    fn empty_leaf(&self) -> Box<LNode> {
        let mut leaf = self.pool.acquire_leaf();
        leaf.version = self.version;
        leaf
    }

    fn replace_leaf(&self, node: &mut INode, key: &[u8], value: &[u8]) {
        let old = std::mem::replace(&mut node.leaf, self.new_leaf(key, value));
        self.pool.release_leaf(old);
    }

    /// Inserts or updates `key` in the working subtree rooted at `node`,
    /// which must already carry the transaction's version.
    pub fn put(&self, node: &mut INode, key: &[u8], value: &[u8], depth: usize) -> Result<(), Error> {
        debug_assert_eq!(node.version, self.version);
        node.leaf.version = self.version;

        if depth == key.len() {
            // the key terminates in this node's own leaf slot
            if node.leaf.key == key {
                if node.leaf.value != value {
                    self.replace_leaf(node, key, value);
                }
                return Ok(());
            }
            let displaced = std::mem::replace(&mut node.leaf, self.new_leaf(key, value));
            return self.reinsert_displaced(node, displaced, depth);
        }

        let index = key[depth];
        if node.bitmap.get(index) {
            return self.descend_put(node, index, key, value, depth);
        }
        if depth == 0 {
            // the root's leaf slot stays unoccupied; everything fans out
            return self.attach_new_child(node, index, key, value, depth);
        }
        if node.leaf.key == key {
            if node.leaf.value != value {
                self.replace_leaf(node, key, value);
            }
            Ok(())
        } else if !node.leaf.has_key() && node.children.is_empty() {
            self.replace_leaf(node, key, value);
            Ok(())
        } else if !node.leaf.has_key() {
            self.attach_new_child(node, index, key, value, depth)
        } else if node.leaf.key.len() == depth {
            // the resident key terminates here, so it sorts before anything
            // reachable through the children and can stay put
            self.attach_new_child(node, index, key, value, depth)
        } else {
            // both keys extend past this node: route both into children, the
            // leaf slot must not hold a key that could sort after a subtree
            let displaced = std::mem::replace(&mut node.leaf, self.empty_leaf());
            self.attach_new_child(node, index, key, value, depth)?;
            self.reinsert_displaced(node, displaced, depth)
        }
    }

    /// Re-routes a leaf displaced from a node's own slot into the children,
    /// descending into an existing child when the slot is already taken.
    fn reinsert_displaced(
        &self,
        node: &mut INode,
        displaced: Box<LNode>,
        depth: usize,
    ) -> Result<(), Error> {
        if !displaced.has_key() {
            self.pool.release_leaf(displaced);
            return Ok(());
        }
        let Some(&index) = displaced.key.get(depth) else {
            return Err(corruption!(
                "displaced key of length {} at depth {depth}",
                displaced.key.len()
            ));
        };
        let result = if node.bitmap.get(index) {
            self.descend_put(node, index, &displaced.key, &displaced.value, depth)
        } else {
            self.attach_new_child(node, index, &displaced.key, &displaced.value, depth)
        };
        self.pool.release_leaf(displaced);
        result
    }

    /// Sets the bit for `index`, builds a fresh child subtree holding
    /// `(key, value)`, and splices it into the dense child table.
    fn attach_new_child(
        &self,
        node: &mut INode,
        index: u8,
        key: &[u8],
        value: &[u8],
        depth: usize,
    ) -> Result<(), Error> {
        node.bitmap.set(index);
        let position = node.bitmap.dense_position(index);
        let mut child = self.pool.acquire_internal();
        child.version = self.version;
        self.put(&mut child, key, value, depth + 1)?;
        node.children.insert(position, Child::Mem(child));
        Ok(())
    }

    /// Descends into the existing child for `index`, materializing it from
    /// the file when it belongs to an earlier version.
    fn descend_put(
        &self,
        node: &mut INode,
        index: u8,
        key: &[u8],
        value: &[u8],
        depth: usize,
    ) -> Result<(), Error> {
        let position = node.bitmap.dense_position(index);
        let slot = node
            .children
            .get_mut(position)
            .ok_or_else(|| corruption!("child table shorter than bitmap at depth {depth}"))?;
        match slot {
            Child::Mem(child) => self.put(child, key, value, depth + 1),
            Child::Disk(offset) => {
                let mut child = self.load_inode(*offset)?;
                child.version = self.version;
                self.put(&mut child, key, value, depth + 1)?;
                *slot = Child::Mem(child);
                Ok(())
            }
        }
    }

    /// Looks `key` up in the snapshot (or working) subtree rooted at `node`.
    pub fn get(&self, node: &INode, key: &[u8], depth: usize) -> Result<Option<KeyValuePair>, Error> {
        if node.leaf.has_key() && node.leaf.key == key {
            return Ok(Some(pair_of(&node.leaf)));
        }
        if depth >= key.len() {
            return Ok(None);
        }
        let index = key[depth];
        if !node.bitmap.get(index) {
            return Ok(None);
        }
        let position = node.bitmap.dense_position(index);
        match node.children.get(position) {
            None => Err(corruption!("child table shorter than bitmap at depth {depth}")),
            Some(Child::Mem(child)) => self.get(child, key, depth + 1),
            Some(Child::Disk(offset)) => {
                let child = self.load_inode(*offset)?;
                self.get(&child, key, depth + 1)
            }
        }
    }

    /// Removes `key` from the working subtree rooted at `node`. Deleting an
    /// absent key succeeds without touching anything below this node.
    pub fn delete(&self, node: &mut INode, key: &[u8], depth: usize) -> Result<(), Error> {
        debug_assert_eq!(node.version, self.version);
        if node.leaf.has_key() && node.leaf.key == key {
            let old = std::mem::replace(&mut node.leaf, self.empty_leaf());
            self.pool.release_leaf(old);
            return Ok(());
        }
        if depth >= key.len() {
            return Ok(());
        }
        let index = key[depth];
        if !node.bitmap.get(index) {
            return Ok(());
        }
        let position = node.bitmap.dense_position(index);
        let slot = node
            .children
            .get_mut(position)
            .ok_or_else(|| corruption!("child table shorter than bitmap at depth {depth}"))?;
        let vacated = match slot {
            Child::Mem(child) => {
                self.delete(child, key, depth + 1)?;
                child.is_vacant()
            }
            Child::Disk(offset) => {
                let mut child = self.load_inode(*offset)?;
                child.version = self.version;
                self.delete(&mut child, key, depth + 1)?;
                let vacant = child.is_vacant();
                *slot = Child::Mem(child);
                vacant
            }
        };
        if vacated {
            // the child holds no key and no children anymore, contract it
            node.bitmap.clear(index);
            if let Child::Mem(child) = node.children.remove(position) {
                self.pool.release_internal(child);
            }
        }
        Ok(())
    }
}

pub(crate) fn pair_of(leaf: &LNode) -> KeyValuePair {
    KeyValuePair {
        version: leaf.version,
        key: leaf.key.clone(),
        value: leaf.value.clone(),
    }
}
