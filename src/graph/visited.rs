//! Generation-based visited set for graph traversal.
//!
//! Replaces `HashSet<u32>` with O(1) array indexing. Each `clear()`
//! increments a generation counter instead of zeroing the array; a full
//! memset happens only when the u16 counter wraps. A small pool recycles
//! sets across queries so searches do not allocate.

use parking_lot::Mutex;

/// Membership test over internal ids with O(1) amortized reset.
#[derive(Debug)]
pub struct VisitedSet {
    data: Vec<u16>,
    generation: u16,
}

impl VisitedSet {
    pub fn new(capacity: usize) -> Self {
        Self {
            data: vec![0u16; capacity],
            generation: 1,
        }
    }

    /// Reset the set. O(1) amortized; full memset only every 65534 calls.
    pub fn clear(&mut self) {
        if self.generation == u16::MAX {
            self.data.fill(0);
            self.generation = 1;
        } else {
            self.generation += 1;
        }
    }

    /// Grow to cover at least `cap` ids.
    pub fn ensure_capacity(&mut self, cap: usize) {
        if cap > self.data.len() {
            self.data.resize(cap, 0);
        }
    }

    /// Mark `id` visited. Returns `true` if it was newly inserted.
    #[inline]
    pub fn test_and_set(&mut self, id: u32) -> bool {
        let idx = id as usize;
        if self.data[idx] == self.generation {
            false
        } else {
            self.data[idx] = self.generation;
            true
        }
    }

    /// Membership check without mutation.
    #[inline]
    pub fn contains(&self, id: u32) -> bool {
        self.data[id as usize] == self.generation
    }
}

/// Pool of visited sets shared across queries on one index.
#[derive(Debug, Default)]
pub struct VisitedPool {
    free: Mutex<Vec<VisitedSet>>,
}

impl VisitedPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take a cleared set sized for at least `capacity` ids.
    pub fn acquire(&self, capacity: usize) -> VisitedSet {
        let mut set = self.free.lock().pop().unwrap_or_else(|| VisitedSet::new(capacity));
        set.ensure_capacity(capacity);
        set.clear();
        set
    }

    /// Return a set to the pool for reuse.
    pub fn release(&self, set: VisitedSet) {
        self.free.lock().push(set);
    }
}
