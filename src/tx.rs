//! Transactions over one consistent snapshot of the store.
//!
//! A view transaction materializes the published root once and runs every
//! read against it. An update transaction works on a private copy of the
//! root whose version is one past the snapshot; reads inside the body
//! observe the body's own writes, and all mutations become visible together
//! when the publication succeeds.

use std::fmt;

use parking_lot::RwLockReadGuard;

use crate::{
    error::error_validation,
    node::INode,
    pool::NodePool,
    region::MappedRegion,
    repr::Metadata,
    scan::Scan,
    tree::WalkCtx,
    Error, KeyValuePair,
};

/// Transform applied to each pair before it is returned to the caller.
pub type TransformFn = dyn Fn(KeyValuePair) -> KeyValuePair + Sync;

/// Options for [`Transaction::iterate`] and [`Transaction::range`].
#[derive(Default, Clone, Copy)]
pub struct RangeOpts<'a> {
    /// Only pairs written at this version or later are returned.
    /// Defaults to 0 (everything).
    pub min_version: Option<u64>,
    /// Transform applied to each returned pair.
    pub transform: Option<&'a TransformFn>,
}

impl fmt::Debug for RangeOpts<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RangeOpts")
            .field("min_version", &self.min_version)
            .field("transform", &self.transform.map(|t| t as *const _))
            .finish()
    }
}

/// A transaction handed to the bodies of [`crate::Store::view_tx`] and
/// [`crate::Store::update_tx`].
pub struct Transaction<'a> {
    pub(crate) region: RwLockReadGuard<'a, MappedRegion>,
    pub(crate) pool: &'a NodePool,
    pub(crate) root: Box<INode>,
    pub(crate) meta: Metadata,
    /// Version the transaction operates at: the snapshot version for views,
    /// one past it for updates.
    pub(crate) version: u64,
    pub(crate) write: bool,
}

fn validate_key(key: &[u8]) -> Result<(), Error> {
    if key.is_empty() {
        return Err(Error::validation("keys must not be empty"));
    }
    if key.len() > usize::from(u16::MAX) {
        return Err(error_validation!(
            "key length {} exceeds the 65535 byte limit",
            key.len()
        ));
    }
    Ok(())
}

impl Transaction<'_> {
    fn walk_ctx(&self) -> WalkCtx<'_> {
        WalkCtx {
            bytes: self.region.bytes(),
            pool: self.pool,
            version: self.version,
            limit: self.meta.next_free,
        }
    }

    /// Retrieves the pair stored under `key`, applying `transform` to it
    /// when one is given. Inside an update transaction this observes the
    /// transaction's own writes.
    pub fn get(
        &self,
        key: &[u8],
        transform: Option<&TransformFn>,
    ) -> Result<Option<KeyValuePair>, Error> {
        if key.is_empty() {
            return Ok(None);
        }
        let pair = self.walk_ctx().get(&self.root, key, 0)?;
        Ok(match (pair, transform) {
            (Some(pair), Some(transform)) => Some(transform(pair)),
            (pair, _) => pair,
        })
    }

    /// Inserts or updates `key`. Only valid in an update transaction.
    pub fn put(&mut self, key: &[u8], value: &[u8]) -> Result<(), Error> {
        if !self.write {
            return Err(Error::WriteTransactionRequired);
        }
        validate_key(key)?;
        let ctx = WalkCtx {
            bytes: self.region.bytes(),
            pool: self.pool,
            version: self.version,
            limit: self.meta.next_free,
        };
        ctx.put(&mut self.root, key, value, 0)
    }

    /// Removes `key`. Deleting an absent key succeeds. Only valid in an
    /// update transaction.
    pub fn delete(&mut self, key: &[u8]) -> Result<(), Error> {
        if !self.write {
            return Err(Error::WriteTransactionRequired);
        }
        validate_key(key)?;
        let ctx = WalkCtx {
            bytes: self.region.bytes(),
            pool: self.pool,
            version: self.version,
            limit: self.meta.next_free,
        };
        ctx.delete(&mut self.root, key, 0)
    }

    /// Returns up to `max_count` pairs with key ≥ `start_key` in ascending
    /// key order. `max_count` of zero yields an empty list.
    pub fn iterate(
        &self,
        start_key: &[u8],
        max_count: usize,
        opts: RangeOpts<'_>,
    ) -> Result<Vec<KeyValuePair>, Error> {
        let ctx = self.walk_ctx();
        let mut scan = Scan::new(
            &ctx,
            opts.min_version.unwrap_or(0),
            max_count,
            opts.transform,
        );
        let lo = (!start_key.is_empty()).then_some(start_key);
        scan.walk(&self.root, lo, None, 0)?;
        Ok(scan.into_pairs())
    }

    /// Returns all pairs with `start_key ≤ key ≤ end_key` in ascending key
    /// order. Errors when `start_key > end_key`.
    pub fn range(
        &self,
        start_key: &[u8],
        end_key: &[u8],
        opts: RangeOpts<'_>,
    ) -> Result<Vec<KeyValuePair>, Error> {
        if start_key > end_key {
            return Err(Error::validation("start key is greater than end key"));
        }
        let ctx = self.walk_ctx();
        let mut scan = Scan::new(&ctx, opts.min_version.unwrap_or(0), usize::MAX, opts.transform);
        let lo = (!start_key.is_empty()).then_some(start_key);
        scan.walk(&self.root, lo, Some(end_key), 0)?;
        Ok(scan.into_pairs())
    }
}
