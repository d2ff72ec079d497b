//! Fixed-capacity key/value cache.
//!
//! Both buffers are allocated once with layout
//! `[batch, kv_heads, max_seq_len, head_dim]`. Writes land at caller-chosen
//! absolute positions and may overwrite earlier entries; the cursor tracks the
//! highest position written so reads return the prefix `[0, cursor]`.

use std::cell::Cell;
use std::marker::PhantomData;

use candle_core::{DType, Device, Tensor};

use crate::core::{AttentionError, Result};
use crate::kv_cache::api::{CacheStats, KeyValueCache};
use crate::kv_cache::layout::CacheLayout;

#[derive(Debug)]
pub struct StaticKvCache {
    layout: CacheLayout,
    dtype: DType,
    device: Device,
    keys: Tensor,
    values: Tensor,
    cursor: Option<usize>,
    stats: CacheStats,
    _not_sync: PhantomData<Cell<()>>,
}

impl StaticKvCache {
    pub fn new(layout: CacheLayout, dtype: DType, device: &Device) -> Result<Self> {
        let (batch, heads, max_seq_len, head_dim) = layout.dims();
        if batch == 0 || heads == 0 || max_seq_len == 0 || head_dim == 0 {
            return Err(AttentionError::config(format!(
                "cache dimensions must be non-zero, got {layout:?}"
            )));
        }
        if !matches!(dtype, DType::F32 | DType::F16 | DType::BF16) {
            return Err(AttentionError::UnsupportedDType {
                requested: format!("{dtype:?}"),
            });
        }
        let keys = Tensor::zeros(layout.dims(), dtype, device)?;
        let values = Tensor::zeros(layout.dims(), dtype, device)?;
        log::info!(
            "kv-cache init: batch={} kv_heads={} max_seq_len={} head_dim={} dtype={:?}",
            batch,
            heads,
            max_seq_len,
            head_dim,
            dtype
        );
        Ok(Self {
            layout,
            dtype,
            device: device.clone(),
            keys,
            values,
            cursor: None,
            stats: CacheStats::default(),
            _not_sync: PhantomData,
        })
    }

    pub fn layout(&self) -> &CacheLayout {
        &self.layout
    }

    pub fn batch_size(&self) -> usize {
        self.layout.batch
    }

    pub fn max_seq_len(&self) -> usize {
        self.layout.max_seq_len
    }

    pub fn is_empty(&self) -> bool {
        self.cursor.is_none()
    }

    fn validate_write(&self, keys: &Tensor, values: &Tensor, positions: &[usize]) -> Result<()> {
        let (batch, heads, seq_len, head_dim) = keys.dims4().map_err(|_| {
            AttentionError::shape(format!(
                "cache keys must be [batch, kv_heads, seq_len, head_dim], got {:?}",
                keys.dims()
            ))
        })?;
        if batch != self.layout.batch
            || heads != self.layout.num_kv_heads
            || head_dim != self.layout.head_dim
        {
            return Err(AttentionError::shape(format!(
                "cache keys shape mismatch: expected [{}, {}, seq_len, {}], got {:?}",
                self.layout.batch,
                self.layout.num_kv_heads,
                self.layout.head_dim,
                keys.dims()
            )));
        }
        if values.dims() != keys.dims() {
            return Err(AttentionError::shape(format!(
                "cache values shape {:?} must match keys {:?}",
                values.dims(),
                keys.dims()
            )));
        }
        if keys.dtype() != self.dtype || values.dtype() != self.dtype {
            return Err(AttentionError::UnsupportedDType {
                requested: format!(
                    "cache stores {:?}, got keys={:?} values={:?}",
                    self.dtype,
                    keys.dtype(),
                    values.dtype()
                ),
            });
        }
        if positions.len() != seq_len {
            return Err(AttentionError::shape(format!(
                "{} positions supplied for {seq_len} cached tokens",
                positions.len()
            )));
        }
        if let Some(&bad) = positions.iter().find(|&&p| p >= self.layout.max_seq_len) {
            return Err(AttentionError::state(format!(
                "position {bad} exceeds cache capacity {}",
                self.layout.max_seq_len
            )));
        }
        Ok(())
    }
}

/// Split positions into maximal runs of consecutive values, returned as
/// `(offset into positions, first position, run length)`.
fn contiguous_runs(positions: &[usize]) -> Vec<(usize, usize, usize)> {
    let mut runs: Vec<(usize, usize, usize)> = Vec::new();
    for (idx, &pos) in positions.iter().enumerate() {
        if let Some((_, start, len)) = runs.last_mut() {
            if *start + *len == pos {
                *len += 1;
                continue;
            }
        }
        runs.push((idx, pos, 1));
    }
    runs
}

impl KeyValueCache for StaticKvCache {
    fn write(&mut self, keys: &Tensor, values: &Tensor, positions: &[usize]) -> Result<()> {
        self.validate_write(keys, values, positions)?;
        let Some(&highest) = positions.iter().max() else {
            return Ok(());
        };

        let (batch, heads, _, head_dim) = self.layout.dims();
        // Runs are applied in order, so a repeated position keeps its last write.
        for (offset, start, len) in contiguous_runs(positions) {
            let ranges = [0..batch, 0..heads, start..start + len, 0..head_dim];
            let key_chunk = keys.narrow(2, offset, len)?.contiguous()?;
            let value_chunk = values.narrow(2, offset, len)?.contiguous()?;
            self.keys = self.keys.slice_assign(&ranges, &key_chunk)?;
            self.values = self.values.slice_assign(&ranges, &value_chunk)?;
        }

        self.cursor = Some(self.cursor.map_or(highest, |c| c.max(highest)));
        self.stats.tokens_written += positions.len();
        log::debug!(
            "kv-cache write: positions={}..={} cursor={:?}",
            positions[0],
            positions[positions.len() - 1],
            self.cursor
        );
        Ok(())
    }

    fn view(&mut self) -> Result<(Tensor, Tensor)> {
        let Some(cursor) = self.cursor else {
            self.stats.misses += 1;
            return Err(AttentionError::state(
                "cache read before any key/value was written",
            ));
        };
        let len = cursor + 1;
        let keys = self.keys.narrow(2, 0, len)?;
        let values = self.values.narrow(2, 0, len)?;
        self.stats.reads += 1;
        Ok((keys, values))
    }

    fn reset(&mut self) -> Result<()> {
        self.keys = Tensor::zeros(self.layout.dims(), self.dtype, &self.device)?;
        self.values = Tensor::zeros(self.layout.dims(), self.dtype, &self.device)?;
        self.cursor = None;
        self.stats.resets += 1;
        log::debug!("kv-cache reset");
        Ok(())
    }

    fn valid_len(&self) -> usize {
        self.cursor.map_or(0, |c| c + 1)
    }

    fn cursor(&self) -> Option<usize> {
        self.cursor
    }

    fn dtype(&self) -> DType {
        self.dtype
    }

    fn stats(&self) -> CacheStats {
        self.stats.clone()
    }
}
