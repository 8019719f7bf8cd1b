//! Layout definitions for key/value caches.
//!
//! Cache storage is `[slots, slot_len, heads, head_dim]`. Without a block
//! table a slot is one sequence (`slot_len` = maximum sequence length); with
//! one, a slot is a physical page and `slot_len` is the page size.

/// Declarative description of a cache layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheLayout {
    /// Sequences (direct) or pages (paged) held by the cache.
    pub slots: usize,
    /// Positions per slot.
    pub slot_len: usize,
    /// Number of key/value heads stored in the cache.
    pub heads: usize,
    /// Dimensionality of each head.
    pub head_dim: usize,
}

impl CacheLayout {
    pub fn numel(&self) -> usize {
        self.slots * self.slot_len * self.heads * self.head_dim
    }

    /// Offset of the first element of `(slot, pos, head)`.
    #[inline]
    pub fn offset(&self, slot: usize, pos: usize, head: usize) -> usize {
        ((slot * self.slot_len + pos) * self.heads + head) * self.head_dim
    }

    pub fn dims(&self) -> (usize, usize, usize, usize) {
        (self.slots, self.slot_len, self.heads, self.head_dim)
    }
}
