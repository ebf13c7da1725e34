//! # Content Resolver
//!
//! Maps a content digest to its bytes and type tag so gossip can refer to
//! content by digest instead of resending it.
//!
//! ## Double Cache
//!
//! [`DoubleCacheContentResolver`] keeps two LRU tiers:
//!
//! ```text
//!  insert/hit ──► [ fast tier ] ──demote LRU──► [ second tier ] ──evict LRU──► gone
//!                      ▲                              │
//!                      └────────── promote on hit ────┘
//! ```
//!
//! The fast tier holds the most recently inserted or accessed entries. When
//! it overflows, its least recently used entry moves to the second tier
//! instead of being dropped. The second tier evicts outright. The total
//! number of entries never exceeds the configured capacity.
//!
//! An optional `next` resolver (for example a disk-backed store) receives
//! every insert and delete, and serves misses from both tiers.
//!
//! ## Content Addressing
//!
//! Every stored entry satisfies `digest(payload) == key`. Inserts that break
//! this are rejected, so a digest can never map to two different payloads.

use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};

use lru::LruCache;
use tracing::trace;

use crate::identity::{Hash, digest};
use crate::messages::MAX_CONTENT_SIZE;

/// Default total number of cached entries across both tiers.
pub const DEFAULT_CAPACITY: usize = 1024;

/// Default number of entries in the fast tier.
pub const DEFAULT_FAST_CAPACITY: usize = 128;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Content {
    pub content_type: u8,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContentError {
    /// The payload does not hash to the digest it was stored under.
    DigestMismatch { expected: Hash, actual: Hash },
    /// The payload exceeds the configured maximum size.
    TooLarge { size: usize, max: usize },
}

impl std::fmt::Display for ContentError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ContentError::DigestMismatch { expected, actual } => write!(
                f,
                "content digest mismatch: expected {}, got {}",
                hex::encode(&expected[..8]),
                hex::encode(&actual[..8])
            ),
            ContentError::TooLarge { size, max } => {
                write!(f, "content too large: {size} bytes (max {max})")
            }
        }
    }
}

impl std::error::Error for ContentError {}

/// Storage for content addressed by digest.
///
/// Implementations serialize access internally; every method takes `&self`.
pub trait ContentResolver: Send + Sync + 'static {
    fn insert_content(&self, digest: Hash, content_type: u8, data: Vec<u8>) -> Result<(), ContentError>;

    fn content(&self, digest: &Hash) -> Option<Content>;

    fn has_content(&self, digest: &Hash) -> bool {
        self.content(digest).is_some()
    }

    fn delete_content(&self, digest: &Hash);
}

#[derive(Clone, Debug)]
pub struct DoubleCacheConfig {
    /// Total entries across both tiers.
    pub capacity: usize,
    /// Entries in the fast tier. Clamped below `capacity`.
    pub fast_capacity: usize,
    /// Largest accepted payload in bytes.
    pub max_content_size: usize,
}

impl Default for DoubleCacheConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            fast_capacity: DEFAULT_FAST_CAPACITY,
            max_content_size: MAX_CONTENT_SIZE,
        }
    }
}

struct Tiers {
    fast: LruCache<Hash, Content>,
    slow: LruCache<Hash, Content>,
}

impl Tiers {
    /// Put `entry` at the front of the fast tier, demoting whatever falls out.
    fn promote(&mut self, key: Hash, entry: Content) {
        if let Some((demoted_key, demoted)) = self.fast.push(key, entry)
            && demoted_key != key
            && let Some((evicted, _)) = self.slow.push(demoted_key, demoted)
            && evicted != demoted_key
        {
            trace!(digest = %hex::encode(&evicted[..8]), "content evicted from second tier");
        }
    }
}

pub struct DoubleCacheContentResolver {
    tiers: Mutex<Tiers>,
    max_content_size: usize,
    next: Option<Arc<dyn ContentResolver>>,
}

impl DoubleCacheContentResolver {
    pub fn new(config: DoubleCacheConfig, next: Option<Arc<dyn ContentResolver>>) -> Self {
        let capacity = config.capacity.max(2);
        let fast = config.fast_capacity.clamp(1, capacity - 1);
        let slow = capacity - fast;
        Self {
            tiers: Mutex::new(Tiers {
                fast: LruCache::new(NonZeroUsize::new(fast).unwrap_or(NonZeroUsize::MIN)),
                slow: LruCache::new(NonZeroUsize::new(slow).unwrap_or(NonZeroUsize::MIN)),
            }),
            max_content_size: config.max_content_size,
            next,
        }
    }

    /// Number of entries held in memory (fast, second).
    pub fn tier_lens(&self) -> (usize, usize) {
        let tiers = self.lock();
        (tiers.fast.len(), tiers.slow.len())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Tiers> {
        self.tiers.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for DoubleCacheContentResolver {
    fn default() -> Self {
        Self::new(DoubleCacheConfig::default(), None)
    }
}

impl ContentResolver for DoubleCacheContentResolver {
    fn insert_content(&self, key: Hash, content_type: u8, data: Vec<u8>) -> Result<(), ContentError> {
        if data.len() > self.max_content_size {
            return Err(ContentError::TooLarge {
                size: data.len(),
                max: self.max_content_size,
            });
        }
        let actual = digest(&data);
        if actual != key {
            return Err(ContentError::DigestMismatch {
                expected: key,
                actual,
            });
        }

        // First writer wins: a re-insert only refreshes recency.
        {
            let mut tiers = self.lock();
            let existing = match tiers.fast.pop(&key) {
                Some(hit) => Some(hit),
                None => tiers.slow.pop(&key),
            };
            if let Some(existing) = existing {
                tiers.promote(key, existing);
                return Ok(());
            }
        }

        if let Some(next) = &self.next {
            next.insert_content(key, content_type, data.clone())?;
        }
        self.lock().promote(key, Content { content_type, data });
        Ok(())
    }

    fn content(&self, key: &Hash) -> Option<Content> {
        {
            let mut tiers = self.lock();
            if let Some(hit) = tiers.fast.get(key) {
                return Some(hit.clone());
            }
            if let Some(hit) = tiers.slow.pop(key) {
                tiers.promote(*key, hit.clone());
                return Some(hit);
            }
        }

        let hit = self.next.as_ref()?.content(key)?;
        self.lock().promote(*key, hit.clone());
        Some(hit)
    }

    fn has_content(&self, key: &Hash) -> bool {
        {
            let tiers = self.lock();
            if tiers.fast.contains(key) || tiers.slow.contains(key) {
                return true;
            }
        }
        self.next.as_ref().is_some_and(|next| next.has_content(key))
    }

    fn delete_content(&self, key: &Hash) {
        {
            let mut tiers = self.lock();
            tiers.fast.pop(key);
            tiers.slow.pop(key);
        }
        if let Some(next) = &self.next {
            next.delete_content(key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(i: u32) -> (Hash, Vec<u8>) {
        let data = format!("payload-{i}").into_bytes();
        (digest(&data), data)
    }

    fn resolver(capacity: usize, fast: usize) -> DoubleCacheContentResolver {
        DoubleCacheContentResolver::new(
            DoubleCacheConfig {
                capacity,
                fast_capacity: fast,
                ..Default::default()
            },
            None,
        )
    }

    #[test]
    fn reinsert_keeps_first_content_type_in_either_tier() {
        let cache = resolver(16, 2);
        let (key, data) = payload(1);
        cache.insert_content(key, 1, data.clone()).unwrap();
        cache.insert_content(key, 2, data.clone()).unwrap();
        assert_eq!(cache.content(&key).unwrap().content_type, 1);

        for i in 10..12 {
            let (k, d) = payload(i);
            cache.insert_content(k, 0, d).unwrap();
        }
        assert_eq!(cache.tier_lens(), (2, 1), "first entry demoted to the second tier");
        cache.insert_content(key, 3, data).unwrap();
        assert_eq!(cache.content(&key).unwrap().content_type, 1);
    }

    #[test]
    fn insert_then_lookup_returns_exact_bytes() {
        let cache = resolver(16, 4);
        let (key, data) = payload(1);
        cache.insert_content(key, 3, data.clone()).unwrap();

        let hit = cache.content(&key).expect("must hit");
        assert_eq!(hit.data, data);
        assert_eq!(hit.content_type, 3);
        assert!(cache.has_content(&key));
    }

    #[test]
    fn entries_beyond_fast_tier_are_demoted_not_lost() {
        let cache = resolver(16, 4);
        let items: Vec<_> = (0..10).map(payload).collect();
        for (key, data) in &items {
            cache.insert_content(*key, 0, data.clone()).unwrap();
        }
        assert_eq!(cache.tier_lens(), (4, 6));

        // The earliest inserts live in the second tier now.
        for (key, data) in &items {
            assert_eq!(&cache.content(key).expect("both tiers hit").data, data);
        }
    }

    #[test]
    fn second_tier_hit_is_promoted() {
        let cache = resolver(8, 2);
        let items: Vec<_> = (0..4).map(payload).collect();
        for (key, data) in &items {
            cache.insert_content(*key, 0, data.clone()).unwrap();
        }
        let oldest = items[0].0;
        {
            let tiers = cache.lock();
            assert!(tiers.slow.contains(&oldest));
        }
        cache.content(&oldest).unwrap();
        let tiers = cache.lock();
        assert!(tiers.fast.contains(&oldest));
        assert!(!tiers.slow.contains(&oldest));
    }

    #[test]
    fn total_capacity_is_bounded_and_oldest_go_first() {
        let cache = resolver(6, 2);
        let items: Vec<_> = (0..20).map(payload).collect();
        for (key, data) in &items {
            cache.insert_content(*key, 0, data.clone()).unwrap();
        }
        let (fast, slow) = cache.tier_lens();
        assert_eq!(fast + slow, 6);
        assert!(!cache.has_content(&items[0].0));
        assert!(cache.has_content(&items[19].0));
        assert!(cache.has_content(&items[14].0));
    }

    #[test]
    fn digest_mismatch_is_rejected() {
        let cache = resolver(8, 2);
        let (_, data) = payload(1);
        let err = cache.insert_content([9u8; 32], 0, data).unwrap_err();
        assert!(matches!(err, ContentError::DigestMismatch { .. }));
        assert!(!cache.has_content(&[9u8; 32]));
    }

    #[test]
    fn oversize_content_is_rejected() {
        let cache = DoubleCacheContentResolver::new(
            DoubleCacheConfig {
                max_content_size: 4,
                ..Default::default()
            },
            None,
        );
        let data = vec![0u8; 5];
        let err = cache.insert_content(digest(&data), 0, data).unwrap_err();
        assert_eq!(err, ContentError::TooLarge { size: 5, max: 4 });
    }

    #[test]
    fn delete_removes_from_both_tiers() {
        let cache = resolver(8, 2);
        let items: Vec<_> = (0..4).map(payload).collect();
        for (key, data) in &items {
            cache.insert_content(*key, 0, data.clone()).unwrap();
        }
        cache.delete_content(&items[0].0);
        cache.delete_content(&items[3].0);
        cache.delete_content(&items[3].0);
        assert!(!cache.has_content(&items[0].0));
        assert!(!cache.has_content(&items[3].0));
        assert!(cache.has_content(&items[1].0));
    }

    #[test]
    fn reinserting_same_content_is_idempotent() {
        let cache = resolver(8, 2);
        let (key, data) = payload(1);
        cache.insert_content(key, 1, data.clone()).unwrap();
        cache.insert_content(key, 1, data.clone()).unwrap();
        assert_eq!(cache.tier_lens(), (1, 0));
    }

    #[test]
    fn next_resolver_backs_misses() {
        let backing = Arc::new(resolver(64, 8));
        let cache = DoubleCacheContentResolver::new(
            DoubleCacheConfig {
                capacity: 4,
                fast_capacity: 2,
                ..Default::default()
            },
            Some(backing.clone()),
        );
        let items: Vec<_> = (0..10).map(payload).collect();
        for (key, data) in &items {
            cache.insert_content(*key, 0, data.clone()).unwrap();
        }
        // Evicted from memory but still served from the backing store.
        assert_eq!(cache.content(&items[0].0).unwrap().data, items[0].1);
        assert!(backing.has_content(&items[0].0));

        cache.delete_content(&items[0].0);
        assert!(!backing.has_content(&items[0].0));
    }
}
