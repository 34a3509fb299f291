//! Writers and deleters of the same cache file must not interleave:
//! a delete racing a publish could otherwise remove the new file, or
//! an audit could remove an entry that a writer just refreshed.
//! `KeyLocks` stripes a fixed array of mutexes over [`HashedKey`]s.
//! Readers never take these locks; they rely on atomic renames.
//!
//! Keys are MD5 digests, so they are already well mixed, but the
//! stripe index still goes through a keyed multiplicative hash:
//! cache roots may contain files planted by other programs.
use parking_lot::Mutex;
use parking_lot::MutexGuard;

use crate::key::HashedKey;

/// Number of lock stripes per cache root.
const NUM_STRIPES: usize = 64;

/// Dietzfelbinger-style multiply-add mixer, with parameters derived
/// from a SHA-256 of a fixed seed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct StripeHash {
    multiplier: u64,
    addend: u64,
}

/// Maps values in `[0, u64::MAX]` to `[0, domain)` linearly; returns
/// 0 when `domain == 0`.
#[inline(always)]
const fn reduce(x: u64, domain: usize) -> usize {
    ((domain as u128 * x as u128) >> 64) as usize
}

impl StripeHash {
    const fn new_keyed(seed: &[u8]) -> StripeHash {
        use extendhash::sha256;

        let hash = sha256::compute_hash(seed);
        let multiplier = [
            hash[0], hash[1], hash[2], hash[3], hash[4], hash[5], hash[6], hash[7],
        ];
        let addend = [
            hash[8], hash[9], hash[10], hash[11], hash[12], hash[13], hash[14], hash[15],
        ];

        StripeHash {
            multiplier: u64::from_le_bytes(multiplier) | 1,
            addend: u64::from_le_bytes(addend),
        }
    }

    #[inline(always)]
    const fn map(&self, value: u64, range: usize) -> usize {
        reduce(
            value
                .wrapping_mul(self.multiplier)
                .wrapping_add(self.addend),
            range,
        )
    }
}

const STRIPE_HASH: StripeHash = StripeHash::new_keyed(b"tjimage-cache key stripes");

/// A fixed set of mutexes, each guarding every key that maps to it.
#[derive(Debug)]
pub(crate) struct KeyLocks {
    stripes: Box<[Mutex<()>]>,
}

impl Default for KeyLocks {
    fn default() -> Self {
        KeyLocks {
            stripes: (0..NUM_STRIPES).map(|_| Mutex::new(())).collect(),
        }
    }
}

impl KeyLocks {
    fn stripe(&self, key: &HashedKey) -> usize {
        STRIPE_HASH.map(key.prefix_u64(), self.stripes.len())
    }

    /// Blocks until the caller has exclusive write access to `key`.
    pub fn lock(&self, key: &HashedKey) -> MutexGuard<'_, ()> {
        self.stripes[self.stripe(key)].lock()
    }
}

#[test]
fn test_reduce() {
    assert_eq!(reduce(0, 0), 0);
    assert_eq!(reduce(u64::MAX, 0), 0);
    assert_eq!(reduce(0, 17), 0);
    assert_eq!(reduce(1 + u64::MAX / 17, 17), 1);
    assert_eq!(reduce(u64::MAX, 17), 16);
}

/// Every key maps to a valid stripe, and the mapping is stable.
#[test]
fn test_stripe_in_range() {
    let locks = KeyLocks::default();

    for i in 0..1000 {
        let key = HashedKey::from_url(&format!("https://example.com/{}.png", i));
        let stripe = locks.stripe(&key);

        assert!(stripe < NUM_STRIPES);
        assert_eq!(stripe, locks.stripe(&key));
    }
}

/// A thousand keys should not all collide on a handful of stripes.
#[test]
fn test_stripes_spread() {
    let locks = KeyLocks::default();
    let mut used = [false; NUM_STRIPES];

    for i in 0..1000 {
        let key = HashedKey::from_url(&format!("https://example.com/{}.png", i));
        used[locks.stripe(&key)] = true;
    }

    assert!(used.iter().filter(|x| **x).count() > NUM_STRIPES / 2);
}
