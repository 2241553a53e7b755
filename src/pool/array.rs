use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::ArrayPoolConfig;
use crate::errors::{MemtuneError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketStats {
    pub size: usize,
    pub pooled: usize,
    /// Element capacity held by the pooled buffers
    pub capacity: usize,
}

/// Size-bucketed free lists of `Vec<T>`.
///
/// Requests round up to the smallest bucket that fits and clamp to the
/// largest one; buffers come back cleared with their capacity intact.
#[derive(Debug)]
pub struct BucketArrayPool<T> {
    buckets: Vec<usize>,
    free: Vec<Vec<Vec<T>>>,
    max_per_bucket: usize,
}

impl<T> BucketArrayPool<T> {
    pub fn new(config: &ArrayPoolConfig) -> Result<Self> {
        Self::with_buckets(config.buckets.clone(), config.max_per_bucket)
    }

    pub fn with_buckets(mut buckets: Vec<usize>, max_per_bucket: usize) -> Result<Self> {
        buckets.retain(|&size| size > 0);
        buckets.sort_unstable();
        buckets.dedup();
        if buckets.is_empty() {
            return Err(MemtuneError::configuration("Array pool needs at least one non-zero bucket"));
        }

        let free = buckets.iter().map(|_| Vec::new()).collect();
        Ok(Self {
            buckets,
            free,
            max_per_bucket,
        })
    }

    pub fn buckets(&self) -> &[usize] {
        &self.buckets
    }

    /// Index of the smallest bucket holding `size`, or of the largest bucket
    fn bucket_index(&self, size: usize) -> usize {
        self.buckets
            .iter()
            .position(|&bucket| bucket >= size)
            .unwrap_or(self.buckets.len() - 1)
    }

    pub fn bucket_for(&self, size: usize) -> usize {
        self.buckets[self.bucket_index(size)]
    }

    pub fn allocate(&mut self, size: usize) -> Vec<T> {
        let index = self.bucket_index(size);
        match self.free[index].pop() {
            Some(mut buffer) => {
                buffer.clear();
                buffer
            }
            None => Vec::with_capacity(self.buckets[index]),
        }
    }

    /// Returns false when the bucket was full and the buffer was dropped
    pub fn deallocate(&mut self, mut buffer: Vec<T>) -> bool {
        let index = self.bucket_index(buffer.len());
        if self.free[index].len() >= self.max_per_bucket {
            debug!("Bucket {} is full, dropping buffer", self.buckets[index]);
            return false;
        }
        buffer.clear();
        self.free[index].push(buffer);
        true
    }

    /// Buffers waiting in the bucket that `size` maps to
    pub fn pooled(&self, size: usize) -> usize {
        self.free[self.bucket_index(size)].len()
    }

    pub fn clear(&mut self) {
        for bucket in &mut self.free {
            bucket.clear();
        }
    }

    pub fn stats(&self) -> Vec<BucketStats> {
        self.buckets
            .iter()
            .zip(&self.free)
            .map(|(&size, free)| BucketStats {
                size,
                pooled: free.len(),
                capacity: free.iter().map(Vec::capacity).sum(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ladder() -> BucketArrayPool<u8> {
        BucketArrayPool::with_buckets(vec![16, 32, 64, 128], 2).unwrap()
    }

    #[test]
    fn test_rounds_up_and_clamps() {
        let mut pool = ladder();
        assert_eq!(pool.bucket_for(50), 64);
        assert_eq!(pool.bucket_for(16), 16);
        assert_eq!(pool.bucket_for(5000), 128);
        assert_eq!(pool.allocate(50).capacity(), 64);
        assert_eq!(pool.allocate(5000).capacity(), 128);
    }

    #[test]
    fn test_reuse_keeps_capacity() {
        let mut pool = ladder();
        let mut buffer = pool.allocate(30);
        buffer.extend_from_slice(&[7u8; 30]);
        let capacity = buffer.capacity();

        assert!(pool.deallocate(buffer));
        assert_eq!(pool.pooled(30), 1);

        let again = pool.allocate(20);
        assert!(again.is_empty());
        assert_eq!(again.capacity(), capacity);
        assert_eq!(pool.pooled(30), 0);
    }

    #[test]
    fn test_bucket_cap_drops_overflow() {
        let mut pool = ladder();
        for _ in 0..2 {
            assert!(pool.deallocate(vec![0u8; 10]));
        }
        assert!(!pool.deallocate(vec![0u8; 10]));
        assert_eq!(pool.pooled(10), 2);

        pool.clear();
        assert!(pool.stats().iter().all(|bucket| bucket.pooled == 0));
    }

    #[test]
    fn test_rejects_empty_ladder() {
        assert!(BucketArrayPool::<u8>::with_buckets(vec![0], 4).is_err());
        let pool = BucketArrayPool::<u8>::with_buckets(vec![64, 16, 64], 4).unwrap();
        assert_eq!(pool.buckets(), &[16, 64]);
    }
}
