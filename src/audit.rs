//! Audits walk the disk tier and let the caller decide, entry by
//! entry, what stays.  The walk takes a snapshot-free pass over the
//! directory listing and holds no lock across entries; each deletion
//! only holds that key's write lock.
//!
//! Entries whose image is resident in the memory tier are never
//! deleted, whatever the predicate says: a memory hit means someone
//! is using the image right now.  Audits only ever touch the disk.
use std::io::Result;
use std::time::SystemTime;

use crate::disk::DiskEntry;
use crate::disk::DiskStore;
use crate::memory::MemoryStore;

/// What an audit pass did.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AuditReport {
    /// Entries shown to the predicate.
    pub examined: usize,
    /// Entries the predicate rejected and that were deleted.
    pub removed: usize,
    /// Entries the predicate rejected but that were kept because their
    /// image is in memory.
    pub retained_in_memory: usize,
}

/// Runs `keep` on every entry of `disk`, and deletes the entries for
/// which it returns false, except those resident in `memory`.
pub fn audit<I>(
    disk: &DiskStore,
    memory: &MemoryStore<I>,
    mut keep: impl FnMut(&DiskEntry) -> bool,
) -> Result<AuditReport> {
    let mut report = AuditReport::default();

    for entry in disk.enumerate()? {
        report.examined += 1;
        if keep(&entry) {
            continue;
        }

        if disk.delete_unless(&entry.key, || memory.contains(&entry.key))? {
            tracing::debug!(key = %entry.key, "audit removed entry");
            report.removed += 1;
        } else {
            report.retained_in_memory += 1;
        }
    }

    Ok(report)
}

/// Predicate that keeps entries created at or after `date`.
pub fn created_since(date: SystemTime) -> impl Fn(&DiskEntry) -> bool + Send + 'static {
    move |entry| entry.created >= date
}

/// Predicate that keeps entries last accessed at or after `date`.
pub fn accessed_since(date: SystemTime) -> impl Fn(&DiskEntry) -> bool + Send + 'static {
    move |entry| entry.last_access >= date
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::key::HashedKey;
    use filetime::FileTime;
    use std::sync::Arc;
    use std::time::Duration;
    use test_dir::{DirBuilder, TestDir};

    const DAY: Duration = Duration::from_secs(24 * 3600);
    const HOUR: Duration = Duration::from_secs(3600);

    fn key(url: &str) -> HashedKey {
        HashedKey::from_url(url)
    }

    fn populate(disk: &DiskStore, urls: &[&str]) {
        for url in urls {
            disk.write(&key(url), url.as_bytes())
                .expect("write must succeed");
        }
    }

    /// Rejecting everything removes every entry not held in memory.
    #[test]
    fn test_reject_all_spares_memory() {
        let temp = TestDir::temp();
        let disk = DiskStore::open(temp.path("cache")).expect("open must succeed");
        let memory = MemoryStore::default();

        populate(&disk, &["a", "b", "c", "d"]);
        memory.put(key("b"), Arc::new(()), 1);
        // Memory-only entries don't matter to the audit.
        memory.put(key("e"), Arc::new(()), 1);

        let report = audit(&disk, &memory, |_| false).expect("audit must succeed");
        assert_eq!(
            report,
            AuditReport {
                examined: 4,
                removed: 3,
                retained_in_memory: 1,
            }
        );

        assert!(!disk.contains(&key("a")));
        assert!(disk.contains(&key("b")));
        assert!(!disk.contains(&key("c")));
        assert!(!disk.contains(&key("d")));
        // Audits never touch memory.
        assert_eq!(memory.len(), 2);
    }

    /// Keeping everything deletes nothing, and the predicate sees every
    /// entry exactly once.
    #[test]
    fn test_keep_all() {
        let temp = TestDir::temp();
        let disk = DiskStore::open(temp.path("cache")).expect("open must succeed");
        let memory = MemoryStore::<()>::default();

        populate(&disk, &["a", "b", "c"]);

        let mut seen = Vec::new();
        let report = audit(&disk, &memory, |entry| {
            seen.push(entry.key.clone());
            true
        })
        .expect("audit must succeed");

        seen.sort();
        let mut expected = vec![key("a"), key("b"), key("c")];
        expected.sort();
        assert_eq!(seen, expected);
        assert_eq!(report.removed, 0);
        assert_eq!(disk.enumerate().expect("enumerate must succeed").count(), 3);
    }

    /// One file created ten days ago, one an hour ago; removing files
    /// older than a day only removes the first.
    #[test]
    fn test_created_since() {
        let temp = TestDir::temp();
        let disk = DiskStore::open(temp.path("cache")).expect("open must succeed");
        let memory = MemoryStore::<()>::default();
        let now = SystemTime::now();

        populate(&disk, &["old", "new"]);
        for (url, age) in [("old", 10 * DAY), ("new", HOUR)] {
            filetime::set_file_mtime(
                temp.path("cache").join(key(url).as_str()),
                FileTime::from_system_time(now - age),
            )
            .expect("set mtime must succeed");
        }

        let report = audit(&disk, &memory, created_since(now - DAY)).expect("audit must succeed");
        assert_eq!(report.removed, 1);
        assert!(!disk.contains(&key("old")));
        assert!(disk.contains(&key("new")));
    }

    /// Same, by last access time.
    #[test]
    fn test_accessed_since() {
        let temp = TestDir::temp();
        let disk = DiskStore::open(temp.path("cache")).expect("open must succeed");
        let memory = MemoryStore::<()>::default();
        let now = SystemTime::now();

        populate(&disk, &["stale", "fresh"]);
        for (url, age) in [("stale", 10 * DAY), ("fresh", HOUR)] {
            filetime::set_file_atime(
                temp.path("cache").join(key(url).as_str()),
                FileTime::from_system_time(now - age),
            )
            .expect("set atime must succeed");
        }

        let report = audit(&disk, &memory, accessed_since(now - DAY)).expect("audit must succeed");
        assert_eq!(report.removed, 1);
        assert!(!disk.contains(&key("stale")));
        assert!(disk.contains(&key("fresh")));
    }

    /// The boundary date itself is kept.
    #[test]
    fn test_boundary_is_kept() {
        let date = SystemTime::UNIX_EPOCH + DAY;
        let entry = DiskEntry {
            key: key("a"),
            created: date,
            last_access: date,
        };

        assert!(created_since(date)(&entry));
        assert!(accessed_since(date)(&entry));
        assert!(!created_since(date + HOUR)(&entry));
        assert!(!accessed_since(date + HOUR)(&entry));
    }
}
