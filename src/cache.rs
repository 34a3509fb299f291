//! Most callers interact with the cache through the `ImageCache`
//! defined here.  A lookup first probes the memory tier on the
//! calling thread; on a miss it may continue, on the background pool,
//! to the disk tier and then to the network, as far as the caller's
//! [`Depth`] allows.  Concurrent lookups of the same URL share a
//! single background load, and every waiting delegate hears about the
//! outcome on the delivery executor.
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Weak;
use std::time::Duration;
use std::time::SystemTime;

use derivative::Derivative;
use image::DynamicImage;

use crate::audit;
use crate::audit::AuditReport;
use crate::decode::Decoder;
use crate::decode::ImageDecoder;
use crate::delegate::Deliver;
use crate::delegate::Delegate;
use crate::delegate::DeliveryThread;
use crate::disk;
use crate::disk::DiskEntry;
use crate::disk::DiskStore;
use crate::error::Error;
use crate::error::Result;
use crate::fetch::Fetcher;
use crate::fetch::HttpFetcher;
use crate::fetch::DEFAULT_TIMEOUT;
use crate::in_flight::InFlightRegistry;
use crate::in_flight::Join;
use crate::key::HashedKey;
use crate::memory::MemoryStore;
use crate::Depth;

/// Default number of background threads doing disk and network I/O.
const DEFAULT_IO_THREADS: usize = 4;

/// Delegates are only referenced weakly.
type Waiter<I> = Weak<dyn Delegate<I>>;

/// Where background work runs: a runtime we own, or one the caller
/// lent us.  Either way we only use its blocking pool.
#[derive(Debug)]
enum Workers {
    Owned(Option<tokio::runtime::Runtime>),
    Borrowed(tokio::runtime::Handle),
}

impl Workers {
    fn spawn(&self, work: impl FnOnce() + Send + 'static) {
        let handle = match self {
            Workers::Owned(Some(runtime)) => runtime.handle(),
            // Only during drop; `work` is dropped unrun.
            Workers::Owned(None) => return,
            Workers::Borrowed(handle) => handle,
        };

        // Dropping the `JoinHandle` detaches the task.  A runtime that
        // is shutting down drops `work` instead of running it.
        let _ = handle.spawn_blocking(work);
    }
}

impl Drop for Workers {
    fn drop(&mut self) {
        // Don't wait for downloads in flight: they only hold on to the
        // shared state, not to the runtime.
        if let Workers::Owned(runtime) = self {
            if let Some(runtime) = runtime.take() {
                runtime.shutdown_background();
            }
        }
    }
}

/// State shared between the `ImageCache` handles and background tasks.
#[derive(Derivative)]
#[derivative(Debug(bound = ""))]
struct Shared<I: Send + Sync + 'static> {
    disk: DiskStore,
    memory: MemoryStore<I>,
    #[derivative(Debug = "ignore")]
    in_flight: InFlightRegistry<Waiter<I>>,
    #[derivative(Debug = "ignore")]
    decoder: Arc<dyn Decoder<Image = I>>,
    #[derivative(Debug = "ignore")]
    fetcher: Arc<dyn Fetcher>,
    #[derivative(Debug = "ignore")]
    delivery: Arc<dyn Deliver>,
}

/// Construct an [`ImageCache`] with this builder.
///
/// The default builder decodes with [`ImageDecoder`], downloads with
/// an [`HttpFetcher`], delivers callbacks on a [`DeliveryThread`],
/// runs I/O on an owned pool of four threads, and puts the cache
/// root under the user's caches directory.
#[derive(Derivative)]
#[derivative(Debug(bound = ""))]
pub struct CacheBuilder<I: Send + Sync + 'static> {
    root: Option<PathBuf>,
    app_id: String,
    #[derivative(Debug = "ignore")]
    decoder: Arc<dyn Decoder<Image = I>>,
    #[derivative(Debug = "ignore")]
    fetcher: Option<Arc<dyn Fetcher>>,
    http_timeout: Duration,
    #[derivative(Debug = "ignore")]
    delivery: Option<Arc<dyn Deliver>>,
    memory_budget: Option<usize>,
    io_threads: usize,
    runtime: Option<tokio::runtime::Handle>,
}

impl Default for CacheBuilder<DynamicImage> {
    fn default() -> Self {
        CacheBuilder::with_decoder(ImageDecoder)
    }
}

impl CacheBuilder<DynamicImage> {
    /// Returns a fresh builder for a cache of [`DynamicImage`]s.
    pub fn new() -> Self {
        Self::default()
    }
}

impl<I: Send + Sync + 'static> CacheBuilder<I> {
    /// Returns a fresh builder for a cache of images decoded by
    /// `decoder`.
    pub fn with_decoder(decoder: impl Decoder<Image = I> + 'static) -> Self {
        CacheBuilder {
            root: None,
            app_id: env!("CARGO_PKG_NAME").to_owned(),
            decoder: Arc::new(decoder),
            fetcher: None,
            http_timeout: DEFAULT_TIMEOUT,
            delivery: None,
            memory_budget: None,
            io_threads: DEFAULT_IO_THREADS,
            runtime: None,
        }
    }

    /// Sets the cache root directory.
    pub fn root(mut self, path: impl AsRef<Path>) -> Self {
        self.root = Some(path.as_ref().to_owned());
        self
    }

    /// Sets the application identifier used for the default root,
    /// `<user caches>/<app_id>/TJImageCache`.
    pub fn app_id(mut self, app_id: impl Into<String>) -> Self {
        self.app_id = app_id.into();
        self
    }

    /// Sets the network collaborator.
    pub fn fetcher(mut self, fetcher: Arc<dyn Fetcher>) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    /// Sets the timeout of the default [`HttpFetcher`].  Ignored when
    /// a fetcher is set explicitly.
    pub fn http_timeout(mut self, timeout: Duration) -> Self {
        self.http_timeout = timeout;
        self
    }

    /// Sets the executor for delegate callbacks.
    pub fn delivery(mut self, delivery: Arc<dyn Deliver>) -> Self {
        self.delivery = Some(delivery);
        self
    }

    /// Bounds the memory tier to `budget`, in units of
    /// [`Decoder::cost`].  `None`, the default, leaves eviction to
    /// memory pressure signals.
    pub fn memory_budget(mut self, budget: Option<usize>) -> Self {
        self.memory_budget = budget;
        self
    }

    /// Sets the size of the owned background pool.
    pub fn io_threads(mut self, count: usize) -> Self {
        self.io_threads = count.max(1);
        self
    }

    /// Runs background work on the blocking pool of an existing tokio
    /// runtime instead of an owned one.
    pub fn runtime(mut self, handle: tokio::runtime::Handle) -> Self {
        self.runtime = Some(handle);
        self
    }

    /// Creates the cache root if needed and returns the cache.
    ///
    /// # Errors
    ///
    /// Fails if there is no root and no default root, if the root can't
    /// be created, or if the background threads can't be spawned.
    pub fn build(self) -> Result<ImageCache<I>> {
        let root = match self.root {
            Some(root) => root,
            None => disk::default_root_path(&self.app_id).ok_or(Error::NoDefaultRoot)?,
        };
        let disk = DiskStore::open(root)?;

        let fetcher = match self.fetcher {
            Some(fetcher) => fetcher,
            None => Arc::new(HttpFetcher::new(self.http_timeout)),
        };
        let delivery = match self.delivery {
            Some(delivery) => delivery,
            None => Arc::new(DeliveryThread::spawn()?),
        };
        let workers = match self.runtime {
            Some(handle) => Workers::Borrowed(handle),
            None => Workers::Owned(Some(
                tokio::runtime::Builder::new_multi_thread()
                    .worker_threads(1)
                    .max_blocking_threads(self.io_threads)
                    .thread_name("tjimage-io")
                    .build()?,
            )),
        };

        tracing::info!(root = %disk.root().display(), "image cache configured");
        Ok(ImageCache {
            shared: Arc::new(Shared {
                disk,
                memory: MemoryStore::new(self.memory_budget),
                in_flight: InFlightRegistry::default(),
                decoder: self.decoder,
                fetcher,
                delivery,
            }),
            workers: Arc::new(workers),
        })
    }
}

/// A URL-keyed cache of decoded images over a memory tier, a disk
/// tier rooted in one directory, and the network.
///
/// `ImageCache` handles are cheap to clone and share all their state.
#[derive(Derivative)]
#[derivative(Debug(bound = ""), Clone(bound = ""))]
pub struct ImageCache<I: Send + Sync + 'static> {
    shared: Arc<Shared<I>>,
    workers: Arc<Workers>,
}

impl<I: Send + Sync + 'static> Shared<I> {
    /// Stores a freshly decoded image in memory and returns it.
    fn remember(&self, key: &HashedKey, image: I) -> Arc<I> {
        let cost = self.decoder.cost(&image);
        let image = Arc::new(image);

        self.memory.put(key.clone(), Arc::clone(&image), cost);
        image
    }

    /// Loads `key` from disk, or from the network if `depth` allows.
    fn load(&self, key: &HashedKey, url: &str, depth: Depth) -> Option<Arc<I>> {
        match self.disk.read(key) {
            Ok(Some(bytes)) => match self.decoder.decode(&bytes) {
                Ok(image) => {
                    tracing::debug!(%url, "disk hit");
                    return Some(self.remember(key, image));
                }
                Err(e) => {
                    tracing::warn!(%url, error = %e, "deleting corrupt cache entry");
                    if let Err(e) = self.disk.delete(key) {
                        tracing::warn!(%url, error = %e, "failed to delete corrupt cache entry");
                    }
                }
            },
            Ok(None) => tracing::debug!(%url, "disk miss"),
            Err(e) => tracing::warn!(%url, error = %e, "failed to read cache entry"),
        }

        if depth < Depth::Internet {
            return None;
        }

        self.download(key, url)
    }

    /// Fetches, decodes, persists and remembers the image at `url`.
    fn download(&self, key: &HashedKey, url: &str) -> Option<Arc<I>> {
        let mut bytes = Vec::new();

        if let Err(e) = self.fetcher.fetch(url, &mut bytes) {
            tracing::warn!(%url, error = %e, "download failed");
            return None;
        }

        // Decode first, so undecodable bytes never reach the disk.
        let image = match self.decoder.decode(&bytes) {
            Ok(image) => image,
            Err(e) => {
                tracing::warn!(%url, error = %e, "downloaded bytes are not an image");
                return None;
            }
        };

        // The image is still good if we can't persist it; the next
        // lookup after it leaves memory will simply download it again.
        if let Err(e) = self.disk.write(key, &bytes) {
            tracing::warn!(%url, error = %e, "failed to persist downloaded image");
        }

        tracing::debug!(%url, size = bytes.len(), "downloaded");
        Some(self.remember(key, image))
    }

    fn succeed(&self, key: &HashedKey, url: &str, image: Arc<I>) -> usize {
        self.in_flight.complete(key, |waiter| {
            let image = Arc::clone(&image);
            let url = url.to_owned();

            self.delivery.deliver(Box::new(move || {
                if let Some(delegate) = waiter.upgrade() {
                    delegate.did_get_image(&image, &url);
                }
            }));
        })
    }

    /// Fails the ticket for `key`, unless a lookup deeper than
    /// `reached` joined it; returns that deeper depth as `Err`.
    fn fail(&self, key: &HashedKey, url: &str, reached: Depth) -> std::result::Result<usize, Depth> {
        self.in_flight.complete_at(key, reached, |waiter| {
            let url = url.to_owned();

            self.delivery.deliver(Box::new(move || {
                if let Some(delegate) = waiter.upgrade() {
                    delegate.did_fail_to_get_image(&url);
                }
            }));
        })
    }

    /// Background half of a lookup: resolves the ticket for `key` and
    /// fans the outcome out to its waiters.  Lookups that join while
    /// we work may deepen the ticket, in which case we keep going.
    fn resolve(&self, key: &HashedKey, url: &str, depth: Depth) {
        let mut depth = self.in_flight.depth(key).unwrap_or(depth).max(depth);

        loop {
            let loaded = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                self.load(key, url, depth)
            }))
            .unwrap_or_else(|_| {
                tracing::warn!(%url, "image load panicked");
                None
            });

            let notified = match loaded {
                Some(image) => self.succeed(key, url, image),
                None => match self.fail(key, url, depth) {
                    Ok(notified) => notified,
                    Err(deeper) => {
                        tracing::debug!(%url, ?deeper, "lookup deepened while in flight");
                        depth = deeper;
                        continue;
                    }
                },
            };

            tracing::trace!(%url, notified, "lookup resolved");
            return;
        }
    }
}

/// A started ticket on its way to the background pool.  If the pool
/// drops it without running it, e.g., because the runtime is shutting
/// down, its waiters are told the lookup failed rather than left
/// waiting forever.
struct Resolution<I: Send + Sync + 'static> {
    shared: Arc<Shared<I>>,
    key: HashedKey,
    url: String,
    depth: Depth,
    ran: bool,
}

impl<I: Send + Sync + 'static> Resolution<I> {
    fn run(mut self) {
        self.ran = true;
        self.shared.resolve(&self.key, &self.url, self.depth);
    }
}

impl<I: Send + Sync + 'static> Drop for Resolution<I> {
    fn drop(&mut self) {
        if !self.ran {
            tracing::warn!(url = %self.url, "background pool dropped lookup");
            let _ = self.shared.fail(&self.key, &self.url, Depth::Internet);
        }
    }
}

impl<I: Send + Sync + 'static> ImageCache<I> {
    /// Returns the hashed key, i.e., the cache file name, for `url`.
    pub fn hash(url: &str) -> String {
        crate::key::hash(url)
    }

    /// Returns the cache root directory.
    pub fn root(&self) -> &Path {
        self.shared.disk.root()
    }

    /// Looks `url` up, descending at most to `depth`.
    ///
    /// Returns the image immediately on a memory hit, without calling
    /// `delegate`.  Otherwise returns `None`; if `depth` allows going
    /// past memory, the lookup continues in the background and
    /// `delegate`, if it is still alive by then, hears about the
    /// outcome on the delivery executor.  Concurrent lookups of the
    /// same URL share a single load.
    pub fn image_at_url(
        &self,
        url: &str,
        depth: Depth,
        delegate: Option<&Arc<dyn Delegate<I>>>,
    ) -> Option<Arc<I>> {
        let key = HashedKey::from_url(url);

        if let Some(image) = self.shared.memory.get(&key) {
            tracing::trace!(%url, "memory hit");
            return Some(image);
        }

        if depth < Depth::Disk {
            return None;
        }

        match self
            .shared
            .in_flight
            .join_or_start(&key, depth, delegate.map(Arc::downgrade))
        {
            Join::Joined => tracing::debug!(%url, "joined in-flight lookup"),
            Join::Started => {
                let resolution = Resolution {
                    shared: Arc::clone(&self.shared),
                    key,
                    url: url.to_owned(),
                    depth,
                    ran: false,
                };

                self.workers.spawn(move || resolution.run());
            }
        }

        None
    }

    /// Looks `url` up through every tier, without a delegate.
    pub fn image(&self, url: &str) -> Option<Arc<I>> {
        self.image_at_url(url, Depth::Internet, None)
    }

    /// Looks `url` up through every tier, notifying `delegate`.
    pub fn image_with_delegate(&self, url: &str, delegate: &Arc<dyn Delegate<I>>) -> Option<Arc<I>> {
        self.image_at_url(url, Depth::Internet, Some(delegate))
    }

    /// Detaches `delegate` from the pending lookup of `url`.  The load
    /// itself carries on, so the cache still fills up.  Returns
    /// whether `delegate` was waiting.
    pub fn cancel_waiter(&self, url: &str, delegate: &Arc<dyn Delegate<I>>) -> bool {
        let target = Arc::downgrade(delegate);

        self.shared
            .in_flight
            .cancel_waiter(&HashedKey::from_url(url), |waiter| Weak::ptr_eq(waiter, &target))
    }

    /// Returns the nearest tier holding the image for `url`:
    /// [`Depth::Memory`], [`Depth::Disk`], or [`Depth::Internet`] if
    /// it would have to be downloaded.
    pub fn depth_for_image_at_url(&self, url: &str) -> Depth {
        let key = HashedKey::from_url(url);

        if self.shared.memory.contains(&key) {
            Depth::Memory
        } else if self.shared.disk.contains(&key) {
            Depth::Disk
        } else {
            Depth::Internet
        }
    }

    /// Drops the image for `url` from memory and disk.  Lookups in
    /// flight are not cancelled.
    pub fn remove_image_at_url(&self, url: &str) {
        let key = HashedKey::from_url(url);

        self.shared.memory.remove(&key);
        if let Err(e) = self.shared.disk.delete(&key) {
            tracing::warn!(%url, error = %e, "failed to remove cache entry");
        }
    }

    /// Drops every image from memory.  The disk is untouched.
    pub fn dump_memory_cache(&self) {
        self.shared.memory.clear();
    }

    /// Deletes every entry from disk.  Memory is untouched.
    pub fn dump_disk_cache(&self) {
        if let Err(e) = self.shared.disk.delete_all() {
            tracing::warn!(error = %e, "failed to dump disk cache");
        }
    }

    /// Releases every image in memory that no caller holds.  Returns
    /// how many were released.
    ///
    /// Callbacks still waiting on the delivery executor hold the image
    /// they deliver, so an image that was just loaded stays until its
    /// delegates have been called.
    pub fn handle_memory_pressure(&self) -> usize {
        let released = self.shared.memory.release_unused();

        tracing::debug!(released, "memory pressure");
        released
    }

    /// Returns a handler for the host's low-memory notifications.  The
    /// handler does not keep the cache alive.
    pub fn memory_pressure_handler(&self) -> impl Fn() + Send + Sync + 'static {
        let shared = Arc::downgrade(&self.shared);

        move || {
            if let Some(shared) = shared.upgrade() {
                shared.memory.release_unused();
            }
        }
    }

    /// Computes the total size of the disk tier in the background and
    /// passes it, in bytes, to `completion` on the delivery executor.
    pub fn get_disk_cache_size(&self, completion: impl FnOnce(u64) + Send + 'static) {
        let shared = Arc::clone(&self.shared);

        self.workers.spawn(move || {
            let size = shared.disk.total_size().unwrap_or_else(|e| {
                tracing::warn!(error = %e, "failed to size disk cache");
                0
            });

            shared.delivery.deliver(Box::new(move || completion(size)));
        });
    }

    /// Audits the disk tier on the calling thread: deletes each entry
    /// for which `keep` returns false, unless its image is in memory.
    pub fn audit_now(&self, keep: impl FnMut(&DiskEntry) -> bool) -> std::io::Result<AuditReport> {
        audit::audit(&self.shared.disk, &self.shared.memory, keep)
    }

    /// Audits the disk tier in the background; see
    /// [`ImageCache::audit_now`].
    pub fn audit_cache(&self, keep: impl FnMut(&DiskEntry) -> bool + Send + 'static) {
        self.audit_cache_then(keep, |_| {});
    }

    /// Audits the disk tier in the background, then passes the report
    /// to `on_complete` on the delivery executor.
    pub fn audit_cache_then(
        &self,
        keep: impl FnMut(&DiskEntry) -> bool + Send + 'static,
        on_complete: impl FnOnce(AuditReport) + Send + 'static,
    ) {
        let shared = Arc::clone(&self.shared);

        self.workers.spawn(move || {
            let report = audit::audit(&shared.disk, &shared.memory, keep).unwrap_or_else(|e| {
                tracing::warn!(error = %e, "audit failed");
                AuditReport::default()
            });

            tracing::info!(
                examined = report.examined,
                removed = report.removed,
                "audit complete"
            );
            shared.delivery.deliver(Box::new(move || on_complete(report)));
        });
    }

    /// Deletes, in the background, entries created before `date`.
    pub fn audit_cache_removing_files_older_than(&self, date: SystemTime) {
        self.audit_cache(audit::created_since(date));
    }

    /// Deletes, in the background, entries last read before `date`.
    pub fn audit_cache_removing_files_last_accessed_before(&self, date: SystemTime) {
        self.audit_cache(audit::accessed_since(date));
    }
}
