//! Generation-bounded memoization for per-entity rendered images.
//!
//! Keys are structural hashes over a function identity plus its logical
//! arguments; the images themselves never participate in a key. Entries are
//! stamped with the frame iteration that created them and evicted once the
//! current iteration has moved past them by a fixed window. Eviction is
//! generation-based rather than wall-clock so that a given timeline renders
//! identically on every run.

use std::collections::HashMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::rc::Rc;

use image::RgbaImage;

#[derive(Debug)]
struct Entry {
    image: Rc<RgbaImage>,
    stamp: u64,
}

#[derive(Debug)]
pub struct FrameCache {
    entries: HashMap<u64, Entry>,
    max_age: u64,
    generation: u64,
}

impl FrameCache {
    pub fn new(max_age: u64) -> Self {
        Self {
            entries: HashMap::new(),
            max_age,
            generation: 0,
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, key: u64) -> Option<Rc<RgbaImage>> {
        self.entries.get(&key).map(|e| Rc::clone(&e.image))
    }

    pub fn insert(&mut self, key: u64, image: Rc<RgbaImage>) {
        self.entries.insert(
            key,
            Entry {
                image,
                stamp: self.generation,
            },
        );
    }

    /// Ends the current frame: evicts expired entries, then advances the
    /// iteration counter.
    pub fn advance(&mut self) {
        let generation = self.generation;
        let max_age = self.max_age;
        self.entries
            .retain(|_, entry| generation - entry.stamp < max_age);
        self.generation += 1;
    }
}

/// Structural cache key: the calling function's identity plus its explicit
/// arguments. `DefaultHasher` is keyed with fixed constants, so the result
/// is stable across runs.
pub fn cache_key(func: &'static str, args: impl Hash) -> u64 {
    let mut hasher = DefaultHasher::new();
    func.hash(&mut hasher);
    args.hash(&mut hasher);
    hasher.finish()
}

/// Hashable stand-in for an f64 argument.
pub fn hash_f64(value: f64) -> u64 {
    value.to_bits()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn image() -> Rc<RgbaImage> {
        Rc::new(RgbaImage::new(4, 4))
    }

    #[test]
    fn keys_are_deterministic_and_distinct() {
        assert_eq!(cache_key("ship", (1u32, 2i32)), cache_key("ship", (1u32, 2i32)));
        assert_ne!(cache_key("ship", (1u32, 2i32)), cache_key("plane", (1u32, 2i32)));
        assert_ne!(cache_key("ship", (1u32, 2i32)), cache_key("ship", (1u32, 3i32)));
    }

    #[test]
    fn entries_survive_within_the_window() {
        let mut cache = FrameCache::new(10);
        cache.insert(1, image());
        for _ in 0..9 {
            cache.advance();
        }
        assert!(cache.get(1).is_some());
    }

    #[test]
    fn entries_expire_after_the_window() {
        let mut cache = FrameCache::new(10);
        cache.insert(1, image());
        for _ in 0..11 {
            cache.advance();
        }
        assert!(cache.get(1).is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn reinsert_refreshes_the_stamp() {
        let mut cache = FrameCache::new(10);
        cache.insert(1, image());
        for _ in 0..5 {
            cache.advance();
        }
        cache.insert(1, image());
        for _ in 0..8 {
            cache.advance();
        }
        assert!(cache.get(1).is_some());
    }
}
