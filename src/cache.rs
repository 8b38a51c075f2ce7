//! Per-worker response cache keyed by a content fingerprint.
//!
//! Eviction is FIFO by insertion order, not LRU: a hit does not reorder
//! entries. O(1) insert and evict, no bookkeeping on the read path.

use std::collections::{HashMap, VecDeque};

use image::RgbImage;
use sha2::{Digest, Sha256};

use crate::protocol::TextLine;

pub type Fingerprint = [u8; 32];

/// Fingerprint of a decoded image plus the request parameters that change
/// the produced result (target filter, rotation flag).
pub fn fingerprint(image: &RgbImage, target_text: Option<&str>, use_angle_cls: bool) -> Fingerprint {
    let mut hasher = Sha256::new();
    hasher.update(image.width().to_le_bytes());
    hasher.update(image.height().to_le_bytes());
    hasher.update(image.as_raw());
    hasher.update([0xff]);
    if let Some(target) = target_text {
        hasher.update(target.as_bytes());
    }
    hasher.update([u8::from(use_angle_cls)]);
    hasher.finalize().into()
}

#[derive(Debug)]
pub struct FifoCache {
    capacity: usize,
    order: VecDeque<Fingerprint>,
    entries: HashMap<Fingerprint, Vec<TextLine>>,
}

impl FifoCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            order: VecDeque::with_capacity(capacity),
            entries: HashMap::with_capacity(capacity),
        }
    }

    pub fn get(&self, key: &Fingerprint) -> Option<&Vec<TextLine>> {
        self.entries.get(key)
    }

    /// Insert, evicting the oldest entry when over capacity. Re-inserting an
    /// existing key updates the value but keeps its original queue position.
    pub fn insert(&mut self, key: Fingerprint, value: Vec<TextLine>) {
        if self.entries.insert(key, value).is_none() {
            self.order.push_back(key);
            if self.order.len() > self.capacity {
                if let Some(oldest) = self.order.pop_front() {
                    self.entries.remove(&oldest);
                }
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    fn key(n: u8) -> Fingerprint {
        let mut k = [0u8; 32];
        k[0] = n;
        k
    }

    fn line(text: &str) -> Vec<TextLine> {
        vec![TextLine {
            text: text.into(),
            confidence: 1.0,
            points: [[0.0; 2]; 4],
        }]
    }

    #[test]
    fn hit_returns_stored_value() {
        let mut cache = FifoCache::new(4);
        cache.insert(key(1), line("a"));
        assert_eq!(cache.get(&key(1)).unwrap()[0].text, "a");
        assert!(cache.get(&key(2)).is_none());
    }

    #[test]
    fn evicts_oldest_first() {
        let mut cache = FifoCache::new(32);
        for n in 0..32 {
            cache.insert(key(n), line("x"));
        }
        assert_eq!(cache.len(), 32);

        // The 33rd distinct entry pushes out the very first one.
        cache.insert(key(32), line("y"));
        assert_eq!(cache.len(), 32);
        assert!(cache.get(&key(0)).is_none());
        assert!(cache.get(&key(1)).is_some());
        assert!(cache.get(&key(32)).is_some());
    }

    #[test]
    fn hits_do_not_change_eviction_order() {
        let mut cache = FifoCache::new(2);
        cache.insert(key(1), line("a"));
        cache.insert(key(2), line("b"));

        // Touch the oldest entry; FIFO must still evict it next.
        assert!(cache.get(&key(1)).is_some());
        cache.insert(key(3), line("c"));
        assert!(cache.get(&key(1)).is_none());
        assert!(cache.get(&key(2)).is_some());
    }

    #[test]
    fn fingerprint_varies_with_pixels_and_params() {
        let red = RgbImage::from_pixel(2, 2, Rgb([255, 0, 0]));
        let blue = RgbImage::from_pixel(2, 2, Rgb([0, 0, 255]));

        let base = fingerprint(&red, None, false);
        assert_ne!(base, fingerprint(&blue, None, false));
        assert_ne!(base, fingerprint(&red, Some("gold"), false));
        assert_ne!(base, fingerprint(&red, None, true));
        assert_eq!(base, fingerprint(&red, None, false));
    }
}
