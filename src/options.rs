use std::{
    fmt,
    path::{Path, PathBuf},
};

use triomphe::Arc;

use crate::{pool::DEFAULT_POOL_SIZE, repr::Metadata, Error};

/// Compaction trigger predicate, evaluated against the metadata after each
/// successful publication. Returning `true` schedules a compaction.
pub type CompactTriggerFn = Box<dyn Fn(&Metadata) -> bool + Send + Sync + 'static>;

/// Version threshold of the default compaction trigger.
pub(crate) const DEFAULT_COMPACT_VERSION: u64 = 1_000_000;

/// Options for opening a [`crate::Store`].
#[derive(Clone)]
#[non_exhaustive]
pub struct StoreOptions {
    pub(crate) path: PathBuf,
    pub(crate) filename: String,
    /// Soft cap on the number of internal and leaf nodes retained by the
    /// recycling pools.
    ///
    /// Default: `1_000_000`
    pub node_pool_size: usize,
    /// Disables compaction entirely; the file only ever grows.
    ///
    /// Default: `false`
    pub append_only: bool,
    /// Compaction trigger predicate; `None` uses the default trigger, which
    /// fires once the published version reaches 10⁶.
    pub(crate) compact_trigger: Option<Arc<CompactTriggerFn>>,
}

impl fmt::Debug for StoreOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreOptions")
            .field("path", &self.path)
            .field("filename", &self.filename)
            .field("node_pool_size", &self.node_pool_size)
            .field("append_only", &self.append_only)
            .field(
                "compact_trigger",
                &self.compact_trigger.as_ref().map(Arc::as_ptr),
            )
            .finish()
    }
}

impl StoreOptions {
    /// Creates options for a store in directory `path` with the given base
    /// file name. The directory is created on open if it doesn't exist.
    pub fn new(path: impl AsRef<Path>, filename: impl Into<String>) -> Self {
        StoreOptions {
            path: path.as_ref().to_path_buf(),
            filename: filename.into(),
            node_pool_size: DEFAULT_POOL_SIZE,
            append_only: false,
            compact_trigger: None,
        }
    }

    /// Sets (or clears) the compaction trigger predicate.
    pub fn set_compact_trigger(&mut self, trigger: Option<CompactTriggerFn>) {
        self.compact_trigger = trigger.map(Arc::new);
    }

    pub(crate) fn validate(&self) -> Result<(), Error> {
        if self.filename.is_empty() {
            return Err(Error::validation("filename must not be empty"));
        }
        if self.filename.contains(std::path::is_separator) {
            return Err(Error::validation(
                "filename must not contain path separators",
            ));
        }
        Ok(())
    }

    /// Whether a compaction should be scheduled for this metadata snapshot.
    pub(crate) fn should_compact(&self, meta: &Metadata) -> bool {
        if self.append_only {
            return false;
        }
        match &self.compact_trigger {
            Some(trigger) => trigger(meta),
            None => meta.version >= DEFAULT_COMPACT_VERSION,
        }
    }

    /// Path of the primary store file.
    pub(crate) fn primary_path(&self) -> PathBuf {
        self.path.join(&self.filename)
    }

    /// Path of the transient compaction output file.
    pub(crate) fn temp_path(&self) -> PathBuf {
        self.path.join(format!("{}temp", self.filename))
    }

    /// Path of the transient compaction swap name.
    pub(crate) fn swap_path(&self) -> PathBuf {
        self.path.join(format!("{}swap", self.filename))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation() {
        assert!(StoreOptions::new("/tmp", "data").validate().is_ok());
        assert!(StoreOptions::new("/tmp", "").validate().is_err());
        assert!(StoreOptions::new("/tmp", "a/b").validate().is_err());
    }

    #[test]
    fn trigger_defaults() {
        let mut opts = StoreOptions::new("/tmp", "data");
        let mut meta = Metadata {
            version: DEFAULT_COMPACT_VERSION - 1,
            root_offset: 24,
            next_free: 114,
        };
        assert!(!opts.should_compact(&meta));
        meta.version += 1;
        assert!(opts.should_compact(&meta));

        opts.set_compact_trigger(Some(Box::new(|m| m.next_free > 1000)));
        assert!(!opts.should_compact(&meta));
        meta.next_free = 2000;
        assert!(opts.should_compact(&meta));

        opts.append_only = true;
        assert!(!opts.should_compact(&meta));
    }
}
