use crate::flow::FlowKey;
use crate::hashing::{bucket, FlowHasher, HashRole};

const WORD_BITS: usize = 64;

/// Bit vector that flags the first packet of a flow in a period.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NoveltyFilter {
    filter_size: usize,
    hash_function_count: usize,
    words: Vec<u64>,
    num_items: usize,
}

impl NoveltyFilter {
    pub fn build_novelty_filter(filter_size: usize, hash_function_count: usize) -> NoveltyFilter {
        let words = vec![0; (filter_size + WORD_BITS - 1) / WORD_BITS];
        NoveltyFilter {
            filter_size,
            hash_function_count,
            words,
            num_items: 0,
        }
    }

    pub fn index<H: FlowHasher + ?Sized>(&self, hasher: &H, key: &FlowKey) -> Vec<usize> {
        (0..self.hash_function_count)
            .map(|i| bucket(hasher.hash(key, HashRole::Novelty(i as u32)), self.filter_size))
            .collect()
    }

    /// Sets every bit of `key` and returns true if at least one was unset.
    pub fn insert<H: FlowHasher + ?Sized>(&mut self, hasher: &H, key: &FlowKey) -> bool {
        let mut novel = false;
        for bit in self.index(hasher, key) {
            let (word, mask) = (bit / WORD_BITS, 1u64 << (bit % WORD_BITS));
            if self.words[word] & mask == 0 {
                self.words[word] |= mask;
                novel = true;
            }
        }
        if novel {
            self.num_items += 1;
        }
        novel
    }

    pub fn clear(&mut self) {
        for w in self.words.iter_mut() {
            *w = 0;
        }
        self.num_items = 0;
    }

    pub fn get_num_items(&self) -> usize {
        self.num_items
    }

    /// Fraction of bits set.
    pub fn get_load(&self) -> f32 {
        let set: u32 = self.words.iter().map(|w| w.count_ones()).sum();
        set as f32 / self.filter_size as f32
    }

    pub fn footprint(&self) -> usize {
        self.words.len() * std::mem::size_of::<u64>()
    }
}
