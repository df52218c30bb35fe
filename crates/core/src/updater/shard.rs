//! # Sharding
//!
//! Routes identity hashes to workers using only the top bits of the hash.

use super::types::IdHash;

/// Maps hashes onto `[0, workers)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Shard {
    workers: usize,
    bits: u32,
}

impl Shard {
    /// `workers` must be at least one; zero is treated as one.
    pub fn new(workers: usize) -> Self {
        let workers = workers.max(1);
        let bits = usize::BITS - (workers - 1).leading_zeros();
        Self { workers, bits }
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    pub fn bits(&self) -> u32 {
        self.bits
    }

    /// Worker index for `id`. A pure function of the hash for a given worker count.
    pub fn index(&self, id: &IdHash) -> usize {
        if self.bits == 0 {
            return 0;
        }
        let mut head = [0u8; 8];
        head.copy_from_slice(&id.0[..8]);
        let top = u64::from_be_bytes(head) >> (64 - self.bits);
        // Multiply-shift keeps the result below `workers` when it is not a power of two.
        ((u128::from(top) * self.workers as u128) >> self.bits) as usize
    }
}
