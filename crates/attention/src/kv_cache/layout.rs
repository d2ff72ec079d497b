//! Layout definitions for key/value caches.
//!
//! These helpers describe how cached tensors are ordered in memory across
//! batch items, heads, and sequence positions.

/// Declarative description of a cache layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheLayout {
    pub batch: usize,
    /// Number of key/value heads stored in the cache.
    pub num_kv_heads: usize,
    /// Maximum sequence length captured by the cache.
    pub max_seq_len: usize,
    /// Dimensionality of each head.
    pub head_dim: usize,
}

impl CacheLayout {
    /// Shape of each buffer, `[batch, num_kv_heads, max_seq_len, head_dim]`.
    pub fn dims(&self) -> (usize, usize, usize, usize) {
        (self.batch, self.num_kv_heads, self.max_seq_len, self.head_dim)
    }
}
