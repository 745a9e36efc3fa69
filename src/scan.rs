//! Ordered traversals over a snapshot root.
//!
//! A node emits its own leaf before descending into its children in ascending
//! index order, which yields ascending key order overall. The start and end
//! bound keys are carried down only along their prefix paths; everywhere else
//! the walk emits every live leaf it encounters. Bound checks on the leaves
//! themselves compare full keys, so the frontier paths need no special cases.

use crate::{
    error::corruption,
    node::{Child, INode},
    tree::{pair_of, WalkCtx},
    tx::TransformFn,
    Error, KeyValuePair,
};

pub(crate) struct Scan<'a> {
    ctx: &'a WalkCtx<'a>,
    min_version: u64,
    remaining: usize,
    transform: Option<&'a TransformFn>,
    out: Vec<KeyValuePair>,
}

impl<'a> Scan<'a> {
    pub fn new(
        ctx: &'a WalkCtx<'a>,
        min_version: u64,
        max_count: usize,
        transform: Option<&'a TransformFn>,
    ) -> Self {
        Scan {
            ctx,
            min_version,
            remaining: max_count,
            transform,
            out: Vec::new(),
        }
    }

    pub fn into_pairs(self) -> Vec<KeyValuePair> {
        self.out
    }

    /// Walks the subtree rooted at `node`, collecting keys in
    /// `[lo, hi]` (either bound optional) until the count runs out.
    pub fn walk(
        &mut self,
        node: &INode,
        lo: Option<&[u8]>,
        hi: Option<&[u8]>,
        depth: usize,
    ) -> Result<(), Error> {
        if self.remaining == 0 {
            return Ok(());
        }
        let leaf = &node.leaf;
        if leaf.has_key()
            && leaf.version >= self.min_version
            && lo.map_or(true, |l| leaf.key.as_slice() >= l)
            && hi.map_or(true, |h| leaf.key.as_slice() <= h)
        {
            self.emit(pair_of(leaf));
        }
        if let Some(h) = hi {
            if depth >= h.len() {
                // every key below extends the upper bound's prefix
                return Ok(());
            }
        }
        for (position, index) in node.bitmap.iter().enumerate() {
            if self.remaining == 0 {
                return Ok(());
            }
            let mut child_lo = None;
            if let Some(l) = lo {
                if depth < l.len() {
                    if index < l[depth] {
                        continue;
                    }
                    if index == l[depth] {
                        child_lo = Some(l);
                    }
                }
            }
            let mut child_hi = None;
            if let Some(h) = hi {
                if index > h[depth] {
                    return Ok(());
                }
                if index == h[depth] {
                    child_hi = Some(h);
                }
            }
            match node.children.get(position) {
                None => {
                    return Err(corruption!(
                        "child table shorter than bitmap at depth {depth}"
                    ))
                }
                Some(Child::Mem(child)) => self.walk(child, child_lo, child_hi, depth + 1)?,
                Some(Child::Disk(offset)) => {
                    let child = self.ctx.load_inode(*offset)?;
                    self.walk(&child, child_lo, child_hi, depth + 1)?;
                }
            }
        }
        Ok(())
    }

    fn emit(&mut self, pair: KeyValuePair) {
        let pair = match self.transform {
            Some(transform) => transform(pair),
            None => pair,
        };
        self.out.push(pair);
        self.remaining -= 1;
    }
}
