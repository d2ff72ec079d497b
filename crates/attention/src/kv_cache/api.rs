//! Public traits describing key/value cache behaviour.

use candle_core::{DType, Tensor};

use crate::core::Result;

/// Counters describing cache traffic since construction.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Token positions written (overwrites included).
    pub tokens_written: usize,
    /// Successful reads of the valid range.
    pub reads: usize,
    /// Reads refused because nothing had been written.
    pub misses: usize,
    pub resets: usize,
}

/// Cache storing projected keys and values across decoding steps.
///
/// Keys and values are laid out `[batch, kv_heads, position, head_dim]`.
pub trait KeyValueCache {
    /// Store `keys`/`values` (`[batch, kv_heads, positions.len(), head_dim]`)
    /// at the given absolute positions, overwriting existing entries.
    fn write(&mut self, keys: &Tensor, values: &Tensor, positions: &[usize]) -> Result<()>;

    /// The valid range `[0, cursor]` of cached keys and values.
    fn view(&mut self) -> Result<(Tensor, Tensor)>;

    /// Zero the buffers and rewind the cursor.
    fn reset(&mut self) -> Result<()>;

    /// Number of positions in the valid range (`cursor + 1`, or 0 when empty).
    fn valid_len(&self) -> usize;

    /// Highest position written since the last reset.
    fn cursor(&self) -> Option<usize>;

    fn dtype(&self) -> DType;

    fn stats(&self) -> CacheStats;
}
