use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use super::array::BucketArrayPool;
use super::resource::Poolable;
use crate::config::defaults::{BUFFER_HANDOFF_FRAGMENTS, BUFFER_MAX_REUSABLE_BYTES};

/// Array pool shared by every buffer of one thread
pub type SharedArrayPool = Rc<RefCell<BucketArrayPool<String>>>;

pub fn shared_array_pool(pool: BucketArrayPool<String>) -> SharedArrayPool {
    Rc::new(RefCell::new(pool))
}

/// Incremental string assembly over a list of fragments
#[derive(Debug, Default)]
pub struct PooledBuffer {
    fragments: Vec<String>,
    length: usize,
    array_pool: Option<SharedArrayPool>,
}

impl PooledBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Buffer whose fragment storage comes from, and returns to, `array_pool`
    pub fn with_array_pool(array_pool: SharedArrayPool) -> Self {
        let fragments = array_pool.borrow_mut().allocate(BUFFER_HANDOFF_FRAGMENTS);
        Self {
            fragments,
            length: 0,
            array_pool: Some(array_pool),
        }
    }

    pub fn append(&mut self, fragment: &str) -> &mut Self {
        self.length += fragment.len();
        self.fragments.push(fragment.to_string());
        self
    }

    /// Total bytes appended
    pub fn len(&self) -> usize {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    pub fn fragment_count(&self) -> usize {
        self.fragments.len()
    }
}

impl fmt::Display for PooledBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for fragment in &self.fragments {
            f.write_str(fragment)?;
        }
        Ok(())
    }
}

impl Poolable for PooledBuffer {
    /// Large fragment lists go back to the array pool; small ones are cleared in place
    fn reset(&mut self) {
        self.length = 0;
        match &self.array_pool {
            Some(array_pool) if self.fragments.len() > BUFFER_HANDOFF_FRAGMENTS => {
                let mut array_pool = array_pool.borrow_mut();
                let storage = std::mem::take(&mut self.fragments);
                array_pool.deallocate(storage);
                self.fragments = array_pool.allocate(BUFFER_HANDOFF_FRAGMENTS);
            }
            _ => self.fragments.clear(),
        }
    }

    fn is_reusable(&mut self) -> bool {
        self.length < BUFFER_MAX_REUSABLE_BYTES
    }

    fn estimated_size(&self) -> usize {
        std::mem::size_of::<Self>()
            + self.fragments.capacity() * std::mem::size_of::<String>()
            + self.fragments.iter().map(String::capacity).sum::<usize>()
    }
}

/// Factory for registering `PooledBuffer` with a `ResourcePool`
pub fn buffer_factory(array_pool: SharedArrayPool) -> impl FnMut() -> anyhow::Result<PooledBuffer> {
    move || Ok(PooledBuffer::with_array_pool(array_pool.clone()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn array_pool() -> SharedArrayPool {
        shared_array_pool(BucketArrayPool::with_buckets(vec![16, 32, 64], 4).unwrap())
    }

    #[test]
    fn test_append_tracks_length() {
        let mut buffer = PooledBuffer::new();
        buffer.append("hello").append(", ").append("world");
        assert_eq!(buffer.len(), 12);
        assert_eq!(buffer.fragment_count(), 3);
        assert_eq!(buffer.to_string(), "hello, world");
    }

    #[test]
    fn test_small_reset_keeps_storage() {
        let shared = array_pool();
        let mut buffer = PooledBuffer::with_array_pool(shared.clone());
        for _ in 0..BUFFER_HANDOFF_FRAGMENTS {
            buffer.append("x");
        }
        buffer.reset();
        assert!(buffer.is_empty());
        assert_eq!(buffer.fragment_count(), 0);
        assert!(shared.borrow().stats().iter().all(|bucket| bucket.pooled == 0));
    }

    #[test]
    fn test_large_reset_hands_storage_back() {
        let shared = array_pool();
        let mut buffer = PooledBuffer::with_array_pool(shared.clone());
        for _ in 0..20 {
            buffer.append("fragment");
        }
        buffer.reset();
        assert!(buffer.is_empty());
        assert_eq!(shared.borrow().pooled(20), 1);
        assert_eq!(buffer.to_string(), "");
    }

    #[test]
    fn test_oversized_buffer_not_reusable() {
        let mut buffer = PooledBuffer::new();
        assert!(buffer.is_reusable());
        buffer.append(&"a".repeat(BUFFER_MAX_REUSABLE_BYTES));
        assert!(!buffer.is_reusable());
    }
}
