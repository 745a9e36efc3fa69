//! Loamdb is an embedded, persistent, ordered key/value store.
//!
//! The entire store lives in a single memory-mapped, append-only file that is
//! organized as a 256-ary versioned radix trie (an ordered array mapped trie)
//! with copy-on-write path semantics. Writers build new paths in memory and
//! publish them atomically by bumping the version word in the file header,
//! so readers always traverse an immutable snapshot and never block writers.
//!
//! Highlights:
//!
//! * Keys and values are arbitrary byte strings, ordered lexicographically.
//! * Multi-version concurrency control: many concurrent readers, concurrent
//!   writers serialized only at the final compare-and-swap publication step.
//! * Serializable transactions via [`Store::view_tx`] and [`Store::update_tx`];
//!   all mutations in one update body become visible atomically.
//! * Ordered scans via [`Transaction::range`] and [`Transaction::iterate`].
//! * Background workers grow the mapped file on demand and flush dirty pages
//!   opportunistically; an online compactor rebuilds the file down to the
//!   live version when a configurable trigger fires.
//!
//! ```no_run
//! use loamdb::{Store, StoreOptions};
//!
//! let store = Store::open(StoreOptions::new("/tmp/loam", "data"))?;
//! store.update_tx(|tx| {
//!     tx.put(b"hello", b"world")?;
//!     tx.put(b"hell", b"o")
//! })?;
//! store.view_tx(|tx| {
//!     let pair = tx.get(b"hello", None)?.unwrap();
//!     assert_eq!(pair.value, b"world");
//!     Ok(())
//! })?;
//! # Ok::<(), loamdb::Error>(())
//! ```
//!
//! A store is a plain value: open as many as needed on different files. One
//! store must not be opened from multiple processes at once; concurrency is
//! between threads of a single process.
#![warn(missing_docs)]

#[macro_use]
extern crate derive_more;
#[macro_use]
extern crate log;

mod error;

mod codec;
mod compact;
mod node;
mod options;
mod pool;
mod region;
mod repr;
mod scan;
mod store;
mod tree;
mod tx;

#[cfg(test)]
mod tests;

pub use error::Error;
pub use options::{CompactTriggerFn, StoreOptions};
pub use repr::Metadata;
pub use store::Store;
pub use tx::{RangeOpts, Transaction, TransformFn};

/// A key/value pair returned by reads and scans, tagged with the version of
/// the publication that last wrote its leaf.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValuePair {
    /// Version of the publication that wrote this leaf.
    pub version: u64,
    /// The key, exactly as stored.
    pub key: Vec<u8>,
    /// The value, exactly as stored.
    pub value: Vec<u8>,
}
