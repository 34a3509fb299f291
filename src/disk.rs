//! The disk store owns a flat cache root directory where the entry
//! for a [`HashedKey`] is the file named after that key, holding the
//! raw bytes exactly as downloaded.  There are no subdirectories and
//! no extensions.
//!
//! Entries are published atomically: bytes go to a temporary file
//! (named with a leading dot, so it can never be mistaken for a key)
//! in the same directory, the file is marked read-only, and then
//! renamed over the final name.  Readers never see a partial entry,
//! and a reader that managed to open an entry keeps reading the
//! original bytes even if the entry is concurrently replaced or
//! deleted.
//!
//! Each entry carries two timestamps, both read from the filesystem:
//! its creation date is the modification time, which is set when the
//! entry is published and never touched afterwards, and its last
//! access date is the access time, which the store stamps explicitly
//! whenever it reads an entry (so `noatime` or `relatime` mounts do
//! not matter).
use filetime::FileTime;
use std::fs::File;
use std::io::Error;
use std::io::ErrorKind;
use std::io::Read;
use std::io::Result;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;
use std::time::SystemTime;

use crate::key::HashedKey;
use crate::key_locks::KeyLocks;
use crate::trigger::PeriodicTrigger;

/// Name of the directory created under the platform's caches
/// directory.
pub const ROOT_DIRECTORY_NAME: &str = "TJImageCache";

/// Temporary files are created with this prefix directly in the
/// cache root.
const TEMP_PREFIX: &str = ".tmp";

/// Sweep abandoned temporary files roughly every this many writes.
const SWEEP_PERIOD: u64 = 100;

/// Delete temporary files with mtime older than this age.
#[cfg(not(test))]
const MAX_TEMP_FILE_AGE: Duration = Duration::from_secs(3600);

// We want a more eager timeout in tests.
#[cfg(test)]
const MAX_TEMP_FILE_AGE: Duration = Duration::from_secs(2);

/// Size and timestamps of one cached file.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EntryMetadata {
    /// File size in bytes.
    pub size: u64,
    /// When the entry was published.
    pub created: SystemTime,
    /// When the entry was last read.
    pub last_access: SystemTime,
}

/// One cached file, as found by [`DiskStore::enumerate`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DiskEntry {
    pub key: HashedKey,
    pub created: SystemTime,
    pub last_access: SystemTime,
}

/// Checks whether the error is for a missing file: NotFound, or a
/// stale NFS handle.  Things do go missing from caches, so both are
/// plain misses.
fn is_absent_file_error(error: &Error) -> bool {
    if error.kind() == ErrorKind::NotFound {
        true
    } else if let Some(errno) = error.raw_os_error() {
        errno == libc::ESTALE
    } else {
        false
    }
}

/// Removes a file if it exists.
fn ensure_file_removed(path: &Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if is_absent_file_error(&e) => Ok(()),
        err => err,
    }
}

/// Marks the file at `path` as read-only.
fn set_read_only(path: &Path) -> Result<()> {
    let mut permissions = std::fs::symlink_metadata(path)?.permissions();

    permissions.set_readonly(true);
    std::fs::set_permissions(path, permissions)
}

/// Deletes temporary files in `root` with mtime older than
/// `MAX_TEMP_FILE_AGE`: they were left behind by writers that crashed
/// before publishing.
fn sweep_temporary_files(root: &Path) -> Result<()> {
    let threshold = match SystemTime::now().checked_sub(MAX_TEMP_FILE_AGE) {
        Some(time) => time,
        None => return Ok(()),
    };

    let mut temp = root.to_owned();
    for dirent in std::fs::read_dir(root)?.flatten() {
        let is_temp = dirent
            .file_name()
            .to_str()
            .map_or(false, |name| name.starts_with(TEMP_PREFIX));
        if !is_temp {
            continue;
        }

        let mut handle = || -> Result<()> {
            let mtime = dirent.metadata()?.modified()?;

            if mtime < threshold {
                temp.push(dirent.file_name());
                let ret = ensure_file_removed(&temp);
                temp.pop();

                ret?;
            }

            Ok(())
        };

        let _ = handle();
    }

    Ok(())
}

/// Returns the key and metadata for `dirent` if it is a cache entry:
/// a regular file whose name is a hashed key.
fn entry_metadata(dirent: &std::fs::DirEntry) -> Option<(HashedKey, std::fs::Metadata)> {
    let key = HashedKey::parse(dirent.file_name().to_str()?)?;
    let meta = match dirent.metadata() {
        Ok(meta) => meta,
        Err(e) => {
            if !is_absent_file_error(&e) {
                tracing::debug!(key = %key, error = %e, "failed to stat cache entry");
            }
            return None;
        }
    };

    if meta.is_file() {
        Some((key, meta))
    } else {
        None
    }
}

fn to_entry_metadata(meta: &std::fs::Metadata) -> Result<EntryMetadata> {
    Ok(EntryMetadata {
        size: meta.len(),
        created: meta.modified()?,
        last_access: meta.accessed()?,
    })
}

/// Returns the OS-appropriate default cache root for `app_id`:
/// `<user caches>/<app_id>/TJImageCache`.
pub fn default_root_path(app_id: &str) -> Option<PathBuf> {
    let mut path = dirs::cache_dir()?;

    path.push(app_id);
    path.push(ROOT_DIRECTORY_NAME);
    Some(path)
}

/// A `DiskStore` manages the files directly under one cache root.
#[derive(Debug)]
pub struct DiskStore {
    root: PathBuf,
    // Serialises publications and deletions of the same key.
    locks: KeyLocks,
    // Initialised to sweep temporary files roughly every
    // `SWEEP_PERIOD` writes.
    sweep: PeriodicTrigger,
}

/// Lazy iterator over the entries of a [`DiskStore`], as returned by
/// [`DiskStore::enumerate`].  Entries are unordered; files added or
/// removed during iteration may or may not show up.
#[derive(Debug)]
pub struct Entries {
    inner: std::fs::ReadDir,
}

impl Iterator for Entries {
    type Item = DiskEntry;

    fn next(&mut self) -> Option<DiskEntry> {
        for dirent in self.inner.by_ref().flatten() {
            if let Some((key, meta)) = entry_metadata(&dirent) {
                match to_entry_metadata(&meta) {
                    Ok(stats) => {
                        return Some(DiskEntry {
                            key,
                            created: stats.created,
                            last_access: stats.last_access,
                        })
                    }
                    Err(e) => tracing::debug!(key = %key, error = %e, "no timestamps for entry"),
                }
            }
        }

        None
    }
}

impl DiskStore {
    /// Opens the cache root at `root`, creating it if necessary, and
    /// sweeps old temporary files out of it.
    ///
    /// # Errors
    ///
    /// Returns `Err` if `root` does not exist and we fail to create it.
    pub fn open(root: impl Into<PathBuf>) -> Result<DiskStore> {
        let root = root.into();

        std::fs::create_dir_all(&root)?;
        if let Err(e) = sweep_temporary_files(&root) {
            tracing::debug!(root = %root.display(), error = %e, "failed to sweep temporary files");
        }

        Ok(DiskStore {
            root,
            locks: KeyLocks::default(),
            sweep: PeriodicTrigger::new(SWEEP_PERIOD),
        })
    }

    /// Returns the cache root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn entry_path(&self, key: &HashedKey) -> PathBuf {
        self.root.join(key.as_str())
    }

    /// Returns the bytes cached for `key`, or `None` if there is no
    /// such entry.  Stamps the entry's last access time.
    pub fn read(&self, key: &HashedKey) -> Result<Option<Vec<u8>>> {
        let mut file = match File::open(self.entry_path(key)) {
            Ok(file) => file,
            Err(e) if is_absent_file_error(&e) => return Ok(None),
            Err(e) => return Err(e),
        };

        // From here on, we hold the inode: a concurrent delete or
        // replacement does not affect what we read.
        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes)?;

        if let Err(e) = filetime::set_file_handle_times(&file, Some(FileTime::now()), None) {
            tracing::debug!(key = %key, error = %e, "failed to stamp access time");
        }

        Ok(Some(bytes))
    }

    /// Atomically publishes `bytes` as the entry for `key`, replacing
    /// any previous entry.
    ///
    /// On failure, the cache root is always in a valid state: either
    /// the old entry or no entry remains under the final name.
    pub fn write(&self, key: &HashedKey, bytes: &[u8]) -> Result<()> {
        if self.sweep.event() {
            let _ = sweep_temporary_files(&self.root);
        }

        let mut tmp = tempfile::Builder::new()
            .prefix(TEMP_PREFIX)
            .tempfile_in(&self.root)?;
        tmp.write_all(bytes)?;
        // We don't fsync: it's a cache, so losing recent entries after
        // a crash is acceptable.
        set_read_only(tmp.path())?;

        let _guard = self.locks.lock(key);
        tmp.persist(self.entry_path(key))
            .map(|_| ())
            .map_err(|e| e.error)
    }

    /// Returns the size and timestamps of the entry for `key`, or
    /// `None` if there is no such entry.  Does not count as an access.
    pub fn stat(&self, key: &HashedKey) -> Result<Option<EntryMetadata>> {
        match std::fs::metadata(self.entry_path(key)) {
            Ok(meta) if meta.is_file() => Ok(Some(to_entry_metadata(&meta)?)),
            Ok(_) => Ok(None),
            Err(e) if is_absent_file_error(&e) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Returns whether there is an entry for `key`.
    pub fn contains(&self, key: &HashedKey) -> bool {
        matches!(self.stat(key), Ok(Some(_)))
    }

    /// Removes the entry for `key`, if any.
    pub fn delete(&self, key: &HashedKey) -> Result<()> {
        let _guard = self.locks.lock(key);
        ensure_file_removed(&self.entry_path(key))
    }

    /// Removes the entry for `key` if `keep()`, evaluated while
    /// holding the key's write lock, returns false.  Returns whether
    /// the entry was removed.
    pub(crate) fn delete_unless(&self, key: &HashedKey, keep: impl FnOnce() -> bool) -> Result<bool> {
        let _guard = self.locks.lock(key);

        if keep() {
            return Ok(false);
        }

        ensure_file_removed(&self.entry_path(key))?;
        Ok(true)
    }

    /// Removes every entry under the root.  The root directory itself,
    /// and any file that is not an entry, stay.
    pub fn delete_all(&self) -> Result<()> {
        let mut path = self.root.clone();

        for dirent in std::fs::read_dir(&self.root)?.flatten() {
            if let Some((key, _)) = entry_metadata(&dirent) {
                let _guard = self.locks.lock(&key);

                path.push(key.as_str());
                let ret = ensure_file_removed(&path);
                path.pop();

                ret?;
            }
        }

        Ok(())
    }

    /// Returns the sum of the sizes of all entries, in bytes.
    pub fn total_size(&self) -> Result<u64> {
        Ok(std::fs::read_dir(&self.root)?
            .flatten()
            .filter_map(|dirent| entry_metadata(&dirent))
            .map(|(_, meta)| meta.len())
            .sum())
    }

    /// Lists the entries under the root, lazily.
    pub fn enumerate(&self) -> Result<Entries> {
        Ok(Entries {
            inner: std::fs::read_dir(&self.root)?,
        })
    }
}
