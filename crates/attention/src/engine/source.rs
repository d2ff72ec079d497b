//! Runtime selection between fresh key/value inputs and the attached cache.

use candle_core::{DType, Tensor};

use crate::core::Result;

/// Where a forward pass takes its keys and values from.
#[derive(Debug, Clone, Copy)]
pub enum KvSource<'a> {
    /// Project keys and values from this `[batch, seq_len, embed_dim]` input.
    Fresh(&'a Tensor),
    /// Reuse everything written to the cache so far.
    Cached,
}

impl<'a> KvSource<'a> {
    /// Pick a source from a placeholder tensor: all-NaN means "no input,
    /// reuse the cache", anything else is projected.
    pub fn detect(tensor: &'a Tensor) -> Result<Self> {
        if tensor.elem_count() == 0 || !tensor.dtype().is_float() {
            return Ok(Self::Fresh(tensor));
        }
        let values = tensor.to_dtype(DType::F32)?;
        let all_nan = values.ne(&values)?.min_all()?.to_vec0::<u8>()? == 1;
        if all_nan {
            log::debug!("kv source: NaN placeholder detected, selecting cache");
            Ok(Self::Cached)
        } else {
            Ok(Self::Fresh(tensor))
        }
    }

    pub fn is_fresh(&self) -> bool {
        matches!(self, Self::Fresh(_))
    }

    pub fn is_cached(&self) -> bool {
        matches!(self, Self::Cached)
    }
}

impl<'a> From<&'a Tensor> for KvSource<'a> {
    fn from(tensor: &'a Tensor) -> Self {
        Self::Fresh(tensor)
    }
}
