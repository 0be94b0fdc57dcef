//! Cache of deterministic fading per band and node pair.

use std::collections::HashMap;

use super::layers::TotalFading;

/// Cache key: band name plus the two endpoint addresses in sorted order, so
/// `(a, b)` and `(b, a)` share an entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    band: String,
    low: String,
    high: String,
}

impl CacheKey {
    pub fn new(band: &str, a: &str, b: &str) -> Self {
        let (low, high) = if a <= b { (a, b) } else { (b, a) };
        CacheKey {
            band: band.to_string(),
            low: low.to_string(),
            high: high.to_string(),
        }
    }

    fn touches(&self, address: &str) -> bool {
        self.low == address || self.high == address
    }
}

#[derive(Default)]
pub struct FadingCache {
    entries: HashMap<CacheKey, TotalFading>,
    hits: u64,
    misses: u64,
}

impl FadingCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&mut self, key: &CacheKey) -> Option<&TotalFading> {
        match self.entries.get(key) {
            Some(entry) => {
                self.hits += 1;
                Some(entry)
            }
            None => {
                self.misses += 1;
                None
            }
        }
    }

    pub fn insert(&mut self, key: CacheKey, fading: TotalFading) {
        self.entries.insert(key, fading);
    }

    /// Drop every entry with `address` as an endpoint. Returns the number of
    /// entries removed.
    pub fn invalidate(&mut self, address: &str) -> usize {
        let before = self.entries.len();
        self.entries.retain(|key, _| !key.touches(address));
        before - self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// `(hits, misses)` since creation.
    pub fn hit_stats(&self) -> (u64, u64) {
        (self.hits, self.misses)
    }
}
