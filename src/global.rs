//! A process-wide [`ImageCache`] for call sites that don't want to
//! thread a cache handle around.  The global cache starts out
//! unconfigured; until one of the `configure` functions succeeds,
//! every operation except [`hash`] is a no-op that returns nothing.
//!
//! Configuring again with the same root is a no-op.  Configuring with
//! a different root replaces the cache, which drops its memory tier
//! and forgets lookups in flight: their delegates never hear back.
use std::path::Path;
use std::sync::Arc;
use std::time::SystemTime;

use image::DynamicImage;
use parking_lot::RwLock;

use crate::audit::AuditReport;
use crate::cache::CacheBuilder;
use crate::cache::ImageCache;
use crate::delegate::Delegate;
use crate::disk;
use crate::disk::DiskEntry;
use crate::error::Error;
use crate::error::Result;
use crate::Depth;

type GlobalCache = ImageCache<DynamicImage>;

static CACHE: RwLock<Option<Arc<GlobalCache>>> = parking_lot::const_rwlock(None);

/// Replaces the global cache with `cache`, and drops the previous one
/// outside the lock.
fn install(cache: Option<GlobalCache>) {
    let previous = std::mem::replace(&mut *CACHE.write(), cache.map(Arc::new));

    if let Some(previous) = previous {
        tracing::info!(root = %previous.root().display(), "global image cache replaced");
    }
}

/// Configures the global cache under the user's caches directory.
pub fn configure_with_default_root_path() -> Result<()> {
    let root = disk::default_root_path(env!("CARGO_PKG_NAME")).ok_or(Error::NoDefaultRoot)?;

    configure_with_root_path(root)
}

/// Configures the global cache with its disk tier at `path`, creating
/// the directory if needed.  On failure, the current configuration is
/// left alone.
pub fn configure_with_root_path(path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();

    if let Some(cache) = &*CACHE.read() {
        if cache.root() == path {
            return Ok(());
        }
    }

    install(Some(CacheBuilder::new().root(path).build()?));
    Ok(())
}

/// Installs a custom-built cache as the global cache.
pub fn configure_with(cache: GlobalCache) {
    install(Some(cache));
}

/// Unconfigures the global cache.
pub fn reset() {
    install(None);
}

/// Returns the global cache.
///
/// # Errors
///
/// Fails with [`Error::Unconfigured`] until a `configure` function
/// succeeds.
pub fn shared() -> Result<Arc<GlobalCache>> {
    CACHE.read().clone().ok_or(Error::Unconfigured)
}

fn with_cache<T>(default: T, op: impl FnOnce(&GlobalCache) -> T) -> T {
    match shared() {
        Ok(cache) => op(&cache),
        Err(_) => {
            tracing::debug!("global image cache used before configuration");
            default
        }
    }
}

/// Returns the hashed key for `url`.  Works without configuration.
pub fn hash(url: &str) -> String {
    crate::key::hash(url)
}

/// See [`ImageCache::image_at_url`].
pub fn image_at_url(
    url: &str,
    depth: Depth,
    delegate: Option<&Arc<dyn Delegate<DynamicImage>>>,
) -> Option<Arc<DynamicImage>> {
    with_cache(None, |cache| cache.image_at_url(url, depth, delegate))
}

/// See [`ImageCache::image`].
pub fn image(url: &str) -> Option<Arc<DynamicImage>> {
    with_cache(None, |cache| cache.image(url))
}

/// See [`ImageCache::image_with_delegate`].
pub fn image_with_delegate(
    url: &str,
    delegate: &Arc<dyn Delegate<DynamicImage>>,
) -> Option<Arc<DynamicImage>> {
    with_cache(None, |cache| cache.image_with_delegate(url, delegate))
}

/// See [`ImageCache::cancel_waiter`].
pub fn cancel_waiter(url: &str, delegate: &Arc<dyn Delegate<DynamicImage>>) -> bool {
    with_cache(false, |cache| cache.cancel_waiter(url, delegate))
}

/// See [`ImageCache::depth_for_image_at_url`].  Unconfigured, every
/// image is [`Depth::Internet`] away.
pub fn depth_for_image_at_url(url: &str) -> Depth {
    with_cache(Depth::Internet, |cache| cache.depth_for_image_at_url(url))
}

/// See [`ImageCache::remove_image_at_url`].
pub fn remove_image_at_url(url: &str) {
    with_cache((), |cache| cache.remove_image_at_url(url))
}

/// See [`ImageCache::dump_memory_cache`].
pub fn dump_memory_cache() {
    with_cache((), |cache| cache.dump_memory_cache())
}

/// See [`ImageCache::dump_disk_cache`].
pub fn dump_disk_cache() {
    with_cache((), |cache| cache.dump_disk_cache())
}

/// See [`ImageCache::handle_memory_pressure`].
pub fn handle_memory_pressure() -> usize {
    with_cache(0, |cache| cache.handle_memory_pressure())
}

/// See [`ImageCache::get_disk_cache_size`].  Unconfigured,
/// `completion` is dropped without running.
pub fn get_disk_cache_size(completion: impl FnOnce(u64) + Send + 'static) {
    with_cache((), |cache| cache.get_disk_cache_size(completion))
}

/// See [`ImageCache::audit_cache`].
pub fn audit_cache(keep: impl FnMut(&DiskEntry) -> bool + Send + 'static) {
    with_cache((), |cache| cache.audit_cache(keep))
}

/// See [`ImageCache::audit_cache_then`].
pub fn audit_cache_then(
    keep: impl FnMut(&DiskEntry) -> bool + Send + 'static,
    on_complete: impl FnOnce(AuditReport) + Send + 'static,
) {
    with_cache((), |cache| cache.audit_cache_then(keep, on_complete))
}

/// See [`ImageCache::audit_cache_removing_files_older_than`].
pub fn audit_cache_removing_files_older_than(date: SystemTime) {
    with_cache((), |cache| cache.audit_cache_removing_files_older_than(date))
}

/// See [`ImageCache::audit_cache_removing_files_last_accessed_before`].
pub fn audit_cache_removing_files_last_accessed_before(date: SystemTime) {
    with_cache((), |cache| {
        cache.audit_cache_removing_files_last_accessed_before(date)
    })
}

/// The global cache is process state, so its whole lifecycle is
/// exercised in a single test.
#[cfg(test)]
mod test {
    use super::*;
    use std::time::Duration;
    use test_dir::{DirBuilder, TestDir};

    use crate::cache::test::StaticFetcher;

    struct Forward(flume::Sender<Option<(u32, u32)>>);

    impl Delegate<DynamicImage> for Forward {
        fn did_get_image(&self, image: &Arc<DynamicImage>, _url: &str) {
            let _ = self.0.send(Some((image.width(), image.height())));
        }

        fn did_fail_to_get_image(&self, _url: &str) {
            let _ = self.0.send(None);
        }
    }

    fn png_bytes() -> Vec<u8> {
        let mut bytes = Vec::new();

        DynamicImage::new_rgb8(4, 3)
            .write_to(&mut std::io::Cursor::new(&mut bytes), image::ImageFormat::Png)
            .expect("encoding must succeed");
        bytes
    }

    #[test]
    fn test_global_lifecycle() {
        const URL: &str = "https://ex/global.png";
        let temp = TestDir::temp();
        let (tx, rx) = flume::unbounded();
        let delegate: Arc<dyn Delegate<DynamicImage>> = Arc::new(Forward(tx));

        // Unconfigured: everything fails fast, except hashing.
        reset();
        assert!(matches!(shared(), Err(Error::Unconfigured)));
        assert_eq!(hash(""), "d41d8cd98f00b204e9800998ecf8427e");
        assert!(image_at_url(URL, Depth::Internet, Some(&delegate)).is_none());
        assert_eq!(depth_for_image_at_url(URL), Depth::Internet);
        remove_image_at_url(URL);
        dump_disk_cache();
        assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());

        let fetcher = StaticFetcher::new(&png_bytes());
        configure_with(
            CacheBuilder::new()
                .root(temp.path("first"))
                .fetcher(fetcher.clone())
                .build()
                .expect("build must succeed"),
        );
        let first = shared().expect("must be configured");

        assert!(image_with_delegate(URL, &delegate).is_none());
        assert_eq!(
            rx.recv_timeout(Duration::from_secs(10))
                .expect("delegate must be called"),
            Some((4, 3))
        );
        assert_eq!(depth_for_image_at_url(URL), Depth::Memory);
        assert!(image(URL).is_some());
        assert_eq!(fetcher.calls(), 1);

        // Same root: nothing changes.
        configure_with_root_path(temp.path("first")).expect("configure must succeed");
        assert!(Arc::ptr_eq(&first, &shared().expect("must be configured")));
        assert_eq!(depth_for_image_at_url(URL), Depth::Memory);

        // New root: fresh memory tier, and the new directory exists.
        configure_with_root_path(temp.path("second")).expect("configure must succeed");
        assert!(temp.path("second").is_dir());
        assert!(!Arc::ptr_eq(&first, &shared().expect("must be configured")));
        assert_eq!(depth_for_image_at_url(URL), Depth::Internet);
        drop(first);

        reset();
        assert!(image(URL).is_none());
    }
}
