//! The store: open/close lifecycle, the publication step, and the
//! background resize and flush workers.

use std::{
    fs,
    sync::atomic::{AtomicBool, Ordering},
    sync::mpsc,
    thread,
};

use parking_lot::{Mutex, RwLock};
use triomphe::Arc;

use crate::{
    codec, compact,
    node::INode,
    options::StoreOptions,
    pool::NodePool,
    region::MappedRegion,
    repr::{Metadata, INIT_ROOT_OFFSET},
    tree::WalkCtx,
    tx::Transaction,
    Error,
};

/// A single-slot coalescing wakeup channel: signalling while a wakeup is
/// already pending is a no-op, so bursts collapse into one run of the
/// receiving worker.
#[derive(Debug)]
pub(crate) struct Signal {
    tx: mpsc::SyncSender<()>,
    rx: Mutex<mpsc::Receiver<()>>,
}

impl Signal {
    fn new() -> Self {
        let (tx, rx) = mpsc::sync_channel(1);
        Signal {
            tx,
            rx: Mutex::new(rx),
        }
    }

    /// Non-blocking; drops the signal when one is already pending.
    pub fn notify(&self) {
        let _ = self.tx.try_send(());
    }

    /// Blocks until a signal arrives. Returns false when the channel died.
    pub fn wait(&self) -> bool {
        self.rx.lock().recv().is_ok()
    }
}

#[derive(Debug)]
pub(crate) struct StoreInner {
    pub opts: StoreOptions,
    pub region: RwLock<MappedRegion>,
    /// Set while a resize or compaction owns the region; entrants spin on it
    /// before taking shared access so they don't pile up on the lock.
    pub resizing: AtomicBool,
    pub closed: AtomicBool,
    pub pool: NodePool,
    pub resize_signal: Signal,
    pub flush_signal: Signal,
    pub compact_signal: Signal,
    workers: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl StoreInner {
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn check_open(&self) -> Result<(), Error> {
        if self.is_closed() {
            Err(Error::StoreClosed)
        } else {
            Ok(())
        }
    }

    /// Spins while a resize or compaction is in flight.
    pub fn wait_resize(&self) {
        while self.resizing.load(Ordering::Acquire) && !self.is_closed() {
            thread::yield_now();
        }
    }

    /// Attempts to publish a freshly built path whose root carries version
    /// `V+1` over a file currently at `V`. Returns the new metadata on
    /// success and `None` when the caller must retry; either way the path's
    /// nodes end up back in the pool.
    fn publish(&self, region: &MappedRegion, root: Box<INode>) -> Result<Option<Metadata>, Error> {
        let root_version = root.version;
        if self.resizing.load(Ordering::Acquire) {
            self.pool.release_internal(root);
            return Ok(None);
        }
        let meta = region.load_metadata();
        if meta.version + 1 != root_version {
            // someone else published since this transaction began
            self.pool.release_internal(root);
            return Ok(None);
        }
        let path = codec::serialize_path(root, meta.next_free, &self.pool);
        let next_free = meta.next_free + path.len() as u64;
        if next_free > region.len() {
            // hand the region to the resize worker unless one is on the way
            if self
                .resizing
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                self.resize_signal.notify();
            }
            return Ok(None);
        }
        if region
            .version_word()
            .compare_exchange(meta.version, root_version, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Ok(None);
        }
        // Publication order: next-free first, then the bytes, then the root
        // offset. Readers observing the new version see a tail covering the
        // new bytes, and nobody follows the root into them before the copy
        // lands.
        region.next_free_word().store(next_free, Ordering::Release);
        if let Err(err) = region.write_at(meta.next_free, &path) {
            region.next_free_word().store(meta.next_free, Ordering::Release);
            region.root_word().store(meta.root_offset, Ordering::Release);
            region.version_word().store(meta.version, Ordering::Release);
            return Err(err);
        }
        region.root_word().store(meta.next_free, Ordering::Release);
        self.flush_signal.notify();
        Ok(Some(Metadata {
            version: root_version,
            root_offset: meta.next_free,
            next_free,
        }))
    }

    fn resize_loop(inner: Arc<StoreInner>) {
        while inner.resize_signal.wait() {
            if inner.is_closed() {
                inner.resizing.store(false, Ordering::Release);
                break;
            }
            let mut region = inner.region.write();
            let result = region.grow();
            drop(region);
            inner.resizing.store(false, Ordering::Release);
            match result {
                Ok(len) => debug!("grew mapped region to {len} bytes"),
                Err(err) => error!("mapped region resize failed: {err}"),
            }
        }
    }

    fn flush_loop(inner: Arc<StoreInner>) {
        while inner.flush_signal.wait() {
            if inner.is_closed() {
                break;
            }
            inner.wait_resize();
            let region = inner.region.read();
            let meta = region.load_metadata();
            match region.flush_range(0, meta.next_free) {
                Ok(()) => trace!("flushed {} bytes", meta.next_free),
                Err(err) => error!("background flush failed: {err}"),
            }
        }
    }
}

/// An embedded, persistent, ordered key/value store backed by one
/// memory-mapped append-only file.
///
/// Dropping the store closes it, waiting for the background workers.
#[derive(Debug)]
pub struct Store {
    inner: Arc<StoreInner>,
}

impl Store {
    /// Opens the store described by `opts`, creating and initializing the
    /// file when it doesn't exist yet.
    pub fn open(opts: StoreOptions) -> Result<Store, Error> {
        opts.validate()?;
        fs::create_dir_all(&opts.path)?;
        let primary = opts.primary_path();
        let (region, created) = MappedRegion::open(&primary)?;
        let pool = NodePool::new(opts.node_pool_size);
        let meta = if created {
            // version 0 root: no keys, no children
            let root = pool.acquire_internal();
            let path = codec::serialize_path(root, INIT_ROOT_OFFSET, &pool);
            region.write_at(INIT_ROOT_OFFSET, &path)?;
            let meta = Metadata {
                version: 0,
                root_offset: INIT_ROOT_OFFSET,
                next_free: INIT_ROOT_OFFSET + path.len() as u64,
            };
            region.write_at(0, &codec::write_metadata(meta))?;
            region.flush_range(0, meta.next_free)?;
            meta
        } else {
            region.validate_metadata()?
        };
        let spawn_compactor = !opts.append_only;
        let filename = opts.filename.clone();
        let inner = Arc::new(StoreInner {
            opts,
            region: RwLock::new(region),
            resizing: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            pool,
            resize_signal: Signal::new(),
            flush_signal: Signal::new(),
            compact_signal: Signal::new(),
            workers: Mutex::new(Vec::new()),
        });
        {
            let mut workers = inner.workers.lock();
            workers.push(spawn_worker(&filename, "resize", inner.clone(), StoreInner::resize_loop));
            workers.push(spawn_worker(&filename, "flush", inner.clone(), StoreInner::flush_loop));
            if spawn_compactor {
                workers.push(spawn_worker(
                    &filename,
                    "compact",
                    inner.clone(),
                    compact::compactor_loop,
                ));
            }
        }
        info!(
            "opened store {primary:?} at version {} ({} tail bytes)",
            meta.version, meta.next_free
        );
        Ok(Store { inner })
    }

    /// Runs `body` against a read-only snapshot of the current version.
    /// Never retries; the snapshot is consistent for the body's lifetime.
    pub fn view_tx(
        &self,
        body: impl FnOnce(&mut Transaction<'_>) -> Result<(), Error>,
    ) -> Result<(), Error> {
        let inner = &*self.inner;
        inner.check_open()?;
        inner.wait_resize();
        let region = inner.region.read();
        let meta = region.load_metadata();
        let root = WalkCtx {
            bytes: region.bytes(),
            pool: &inner.pool,
            version: meta.version,
            limit: meta.next_free,
        }
        .load_inode(meta.root_offset)?;
        let mut tx = Transaction {
            region,
            pool: &inner.pool,
            root,
            meta,
            version: meta.version,
            write: false,
        };
        let result = body(&mut tx);
        let Transaction { root, .. } = tx;
        inner.pool.release_internal(root);
        result
    }

    /// Runs `body` against a private working tree one version past the
    /// current one, then publishes it atomically. Contention (a lost
    /// publication race or an in-flight resize) re-runs the body against a
    /// fresh snapshot; an error returned by the body aborts without retry
    /// and nothing is published.
    pub fn update_tx(
        &self,
        mut body: impl FnMut(&mut Transaction<'_>) -> Result<(), Error>,
    ) -> Result<(), Error> {
        let inner = &*self.inner;
        loop {
            inner.check_open()?;
            inner.wait_resize();
            let region = inner.region.read();
            let meta = region.load_metadata();
            let mut root = WalkCtx {
                bytes: region.bytes(),
                pool: &inner.pool,
                version: meta.version + 1,
                limit: meta.next_free,
            }
            .load_inode(meta.root_offset)?;
            root.version = meta.version + 1;
            let mut tx = Transaction {
                region,
                pool: &inner.pool,
                root,
                meta,
                version: meta.version + 1,
                write: true,
            };
            if let Err(err) = body(&mut tx) {
                let Transaction { root, .. } = tx;
                inner.pool.release_internal(root);
                return Err(err);
            }
            let Transaction { region, root, .. } = tx;
            let published = inner.publish(&region, root)?;
            drop(region);
            match published {
                Some(new_meta) => {
                    if inner.opts.should_compact(&new_meta) {
                        inner.compact_signal.notify();
                    }
                    return Ok(());
                }
                None => thread::yield_now(),
            }
        }
    }

    /// A consistent snapshot of the metadata header.
    pub fn metadata(&self) -> Result<Metadata, Error> {
        self.inner.check_open()?;
        self.inner.wait_resize();
        Ok(self.inner.region.read().load_metadata())
    }

    /// Current size of the backing file in bytes.
    pub fn file_size(&self) -> Result<u64, Error> {
        self.inner.check_open()?;
        self.inner.wait_resize();
        self.inner.region.read().file_len()
    }

    /// Closes the store: stops the background workers, flushes the mapped
    /// region, and releases the file. Idempotent.
    pub fn close(&self) -> Result<(), Error> {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.inner.resize_signal.notify();
        self.inner.flush_signal.notify();
        self.inner.compact_signal.notify();
        let workers = std::mem::take(&mut *self.inner.workers.lock());
        for worker in workers {
            let _ = worker.join();
        }
        let region = self.inner.region.read();
        region.flush_all()?;
        debug!("closed store {:?}", region.path());
        Ok(())
    }

    /// Closes the store and deletes its file.
    pub fn remove(&self) -> Result<(), Error> {
        self.close()?;
        fs::remove_file(self.inner.opts.primary_path())?;
        Ok(())
    }
}

impl Drop for Store {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

fn spawn_worker(
    filename: &str,
    role: &str,
    inner: Arc<StoreInner>,
    work: fn(Arc<StoreInner>),
) -> thread::JoinHandle<()> {
    thread::Builder::new()
        .name(format!("loamdb-{role}-{filename}"))
        .spawn(move || work(inner))
        .unwrap()
}
