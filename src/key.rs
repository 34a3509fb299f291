//! Cache keys are derived from URLs with MD5.  The digest is not a
//! security measure: it only gives every URL a stable, fixed-length,
//! filesystem-safe name, and matches the layout of existing cache
//! directories.
use std::fmt;

/// Number of hex digits in a [`HashedKey`].
pub const HASHED_KEY_LEN: usize = 32;

/// A `HashedKey` is the 32-character lowercase hexadecimal MD5 digest
/// of a URL's UTF-8 bytes.  It doubles as the name of the cached file
/// under the cache root.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HashedKey(String);

impl HashedKey {
    /// Hashes `url` into a `HashedKey`.
    pub fn from_url(url: &str) -> HashedKey {
        use extendhash::md5;
        use std::fmt::Write;

        let digest = md5::compute_hash(url.as_bytes());
        let mut hex = String::with_capacity(HASHED_KEY_LEN);
        for byte in digest.iter() {
            // Writing to a `String` can't fail.
            let _ = write!(hex, "{:02x}", byte);
        }

        HashedKey(hex)
    }

    /// Accepts `name` as a `HashedKey` if it looks like one: exactly
    /// 32 lowercase hex digits.  Directory listings go through this
    /// filter, so stray files in the cache root are never mistaken
    /// for entries.
    pub fn parse(name: &str) -> Option<HashedKey> {
        let valid = name.len() == HASHED_KEY_LEN
            && name
                .bytes()
                .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));

        if valid {
            Some(HashedKey(name.to_owned()))
        } else {
            None
        }
    }

    /// Returns the hex digest.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns the first 64 bits of the digest, for sharding.
    pub(crate) fn prefix_u64(&self) -> u64 {
        // Always 32 hex digits, so the first 16 parse.
        u64::from_str_radix(&self.0[..16], 16).unwrap_or(0)
    }
}

impl fmt::Display for HashedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for HashedKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Returns the hex MD5 digest of `url`, the name of its cache file.
pub fn hash(url: &str) -> String {
    HashedKey::from_url(url).0
}

#[test]
fn test_known_digests() {
    assert_eq!(hash(""), "d41d8cd98f00b204e9800998ecf8427e");
    assert_eq!(hash("a"), "0cc175b9c0f1b6a831c399e269772661");
    assert_eq!(
        hash("The quick brown fox jumps over the lazy dog"),
        "9e107d9d372bb6826bd81d3542a419d6"
    );
}

#[test]
fn test_parse() {
    assert!(HashedKey::parse("0cc175b9c0f1b6a831c399e269772661").is_some());
    // Uppercase, short, and temporary names are not keys.
    assert!(HashedKey::parse("0CC175B9C0F1B6A831C399E269772661").is_none());
    assert!(HashedKey::parse("0cc175b9").is_none());
    assert!(HashedKey::parse(".tmpAbc123").is_none());
    assert!(HashedKey::parse("0cc175b9c0f1b6a831c399e26977266z").is_none());
}

#[test]
fn test_prefix() {
    let key = HashedKey::parse("0000000000000001ffffffffffffffff").expect("valid key");
    assert_eq!(key.prefix_u64(), 1);
}
