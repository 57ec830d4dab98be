//! Growable pool of descriptor slots with index recycling.
//!
//! Indices stay stable for the lifetime of an acquisition. Released slots are
//! scrubbed and handed out again before the pool grows.

/// Pool of `T` values addressed by index.
pub struct DescriptorPool<T> {
    entries: Vec<Option<T>>,
    free: Vec<usize>,
    factory: Box<dyn Fn() -> T + Send + Sync>,
    growth: usize,
}

impl<T> DescriptorPool<T> {
    /// Create an empty pool that grows by `growth` slots at a time.
    pub fn new(growth: usize, factory: impl Fn() -> T + Send + Sync + 'static) -> Self {
        DescriptorPool {
            entries: Vec::new(),
            free: Vec::new(),
            factory: Box::new(factory),
            growth: growth.max(1),
        }
    }

    /// Add `growth` slots and return the first new index, which is not put
    /// on the free list.
    fn grow(&mut self) -> usize {
        let start = self.entries.len();
        self.entries.reserve(self.growth);
        self.entries.extend((0..self.growth).map(|_| None));
        // hand out low indices first
        self.free.extend((start + 1..start + self.growth).rev());
        start
    }

    /// Take a free slot, growing the pool when none is left.
    pub fn acquire(&mut self) -> (&mut T, usize) {
        let index = match self.free.pop() {
            Some(index) => index,
            None => self.grow(),
        };
        let slot = &mut self.entries[index];
        let value = slot.insert((self.factory)());
        (value, index)
    }

    /// Return a slot to the pool. Releasing a free or out-of-range index is a
    /// no-op and returns `false`.
    pub fn release(&mut self, index: usize) -> bool {
        match self.entries.get_mut(index) {
            Some(slot @ Some(_)) => {
                *slot = None;
                self.free.push(index);
                true
            }
            _ => false,
        }
    }

    pub fn get(&self, index: usize) -> Option<&T> {
        self.entries.get(index).and_then(Option::as_ref)
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut T> {
        self.entries.get_mut(index).and_then(Option::as_mut)
    }

    /// Slots currently acquired.
    pub fn len(&self) -> usize {
        self.entries.len() - self.free.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.entries.len()
    }

    pub fn free_count(&self) -> usize {
        self.free.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_grows_in_steps() {
        let mut pool = DescriptorPool::new(4, || 0u32);
        for expected in 0..5 {
            let (_, index) = pool.acquire();
            assert_eq!(index, expected);
        }
        assert_eq!(pool.capacity(), 8);
        assert_eq!(pool.len(), 5);
        assert_eq!(pool.free_count(), 3);
    }

    #[test]
    fn test_release_is_idempotent() {
        let mut pool = DescriptorPool::new(2, || 7u64);
        let (_, index) = pool.acquire();
        assert!(pool.release(index));
        let free_after_first = pool.free_count();
        assert!(!pool.release(index));
        assert_eq!(pool.free_count(), free_after_first);
        assert!(!pool.release(99));
    }

    #[test]
    fn test_released_index_is_reused_and_scrubbed() {
        let mut pool = DescriptorPool::new(2, || 0u32);
        let (value, index) = pool.acquire();
        *value = 42;
        pool.release(index);
        assert!(pool.get(index).is_none());
        let (value, again) = pool.acquire();
        assert_eq!(again, index);
        assert_eq!(*value, 0);
    }
}
