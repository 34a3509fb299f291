//! TJImageCache is a URL-keyed cache of decoded images, with three
//! tiers: an in-memory map of decoded images, a directory of raw
//! image files on disk, and the network.  Lookups are cheap and never
//! block on I/O: a memory hit returns the image immediately, and
//! anything else continues on a background pool, after which a
//! [`Delegate`] hears about the outcome.
//!
//! # Keys and files
//!
//! Every URL maps to the lowercase hexadecimal MD5 digest of its
//! UTF-8 bytes ([`hash`]).  The disk tier stores the raw downloaded
//! bytes for a URL in a file named after that digest, directly under
//! the cache root, and nothing else: files whose names don't look
//! like a digest are ignored (and never deleted) by the cache.
//!
//! Entries are published atomically, by renaming a fully written
//! temporary file into place, so readers only ever see complete
//! files.  An entry's modification time is its creation date, and
//! its access time is stamped whenever the cache reads it back; the
//! [audit](ImageCache::audit_cache) pass uses these dates to expire
//! entries.
//!
//! # Lookup depth
//!
//! Callers cap how far a lookup may go with a [`Depth`]:
//!
//! - `Depth::Memory` only probes the memory tier, on the calling
//!   thread, and never schedules work;
//! - `Depth::Disk` may also read (and decode) the file on disk;
//! - `Depth::Internet` may also download, decode, and persist the
//!   image.
//!
//! Concurrent lookups of the same URL share one background load:
//! however many callers ask, the cache issues at most one download
//! per URL at a time, and every delegate waiting on that URL is
//! notified once.  Failed loads are not remembered, so the next
//! lookup tries again.
//!
//! # Memory
//!
//! Decoded images are immutable and shared as `Arc`s.  The memory
//! tier gives up images that no caller holds when the host signals
//! memory pressure ([`ImageCache::memory_pressure_handler`]), and may
//! additionally be bounded by a cost budget, in which case it evicts
//! least recently used images first.  Auditing never deletes the disk
//! entry for an image that is currently in memory.
//!
//! # Callbacks
//!
//! The cache only holds weak references to delegates; a delegate that
//! is dropped before its lookup completes is simply not called.
//! Callbacks never run on the I/O pool: they go through a [`Deliver`]
//! executor, by default a dedicated [`DeliveryThread`], or a
//! [`MainQueue`] drained by the application's own main loop.
//!
//! # Global cache
//!
//! Applications that want a single process-wide cache can use the
//! [`global`] module's free functions, after calling
//! [`global::configure_with_root_path`] or
//! [`global::configure_with_default_root_path`].
pub mod audit;
mod cache;
pub mod decode;
pub mod delegate;
pub mod disk;
pub mod error;
pub mod fetch;
pub mod global;
pub mod in_flight;
mod key;
mod key_locks;
pub mod memory;
mod trigger;

pub use audit::AuditReport;
pub use cache::CacheBuilder;
pub use cache::ImageCache;
pub use decode::Decoder;
pub use decode::ImageDecoder;
pub use delegate::Delegate;
pub use delegate::Deliver;
pub use delegate::DeliveryThread;
pub use delegate::MainQueue;
pub use disk::DiskEntry;
pub use error::Error;
pub use error::Result;
pub use fetch::Fetcher;
pub use fetch::HttpFetcher;
pub use key::hash;
pub use key::HashedKey;

/// How far a lookup may go to find an image.  Depths are ordered from
/// nearest to farthest tier.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Depth {
    /// Only the in-memory tier.
    Memory,
    /// The in-memory tier, then the disk.
    Disk,
    /// Every tier, downloading as a last resort.
    #[default]
    Internet,
}

#[test]
fn test_depth_order() {
    assert!(Depth::Memory < Depth::Disk);
    assert!(Depth::Disk < Depth::Internet);
    assert_eq!(Depth::default(), Depth::Internet);
}
