//! Exact scaled dot-product attention.
//!
//! Scores, softmax and the value reduction run in f32 whatever the input dtype;
//! the result is cast back to the dtype of `q`.

use std::sync::OnceLock;

use candle_core::{DType, Tensor};
use candle_nn::ops::softmax_last_dim;

use crate::core::{Attention, AttentionError, Result};
use crate::masks::{to_additive, MASK_DTYPE};

/// Numerically stable, portable attention kernel.
#[derive(Debug, Default)]
pub struct ExactAttention {
    first_call: OnceLock<()>,
}

impl ExactAttention {
    pub fn new() -> Self {
        Self::default()
    }

    fn validate_mask(
        &self,
        mask: &Tensor,
        q: &Tensor,
        (batch, heads, q_len, k_len): (usize, usize, usize, usize),
    ) -> Result<()> {
        if !q.device().same_device(mask.device()) {
            return Err(AttentionError::shape(
                "mask must reside on the same device as q",
            ));
        }
        if mask.dtype() != MASK_DTYPE {
            return Err(AttentionError::UnsupportedDType {
                requested: format!("mask expects dtype {MASK_DTYPE:?}, got {:?}", mask.dtype()),
            });
        }
        let (mb, mh, mq, mk) = mask.dims4().map_err(|_| {
            AttentionError::shape(format!(
                "mask must have shape [batch, heads|1, q_len, k_len], got {:?}",
                mask.dims()
            ))
        })?;
        if mb != batch || mq != q_len || mk != k_len || (mh != 1 && mh != heads) {
            return Err(AttentionError::shape(format!(
                "mask shape mismatch: expected [{batch}, 1|{heads}, {q_len}, {k_len}] got [{mb}, {mh}, {mq}, {mk}]"
            )));
        }
        Ok(())
    }
}

impl Attention for ExactAttention {
    fn attend(&self, q: &Tensor, k: &Tensor, v: &Tensor, mask: Option<&Tensor>) -> Result<Tensor> {
        let device = q.device();
        if !device.same_device(k.device()) || !device.same_device(v.device()) {
            return Err(AttentionError::shape(
                "q, k, v must reside on the same device",
            ));
        }

        let dtype = q.dtype();
        if dtype != k.dtype() || dtype != v.dtype() {
            return Err(AttentionError::UnsupportedDType {
                requested: format!(
                    "q, k, v must share a dtype, got {dtype:?}/{:?}/{:?}",
                    k.dtype(),
                    v.dtype()
                ),
            });
        }
        if !matches!(dtype, DType::F32 | DType::F16 | DType::BF16) {
            return Err(AttentionError::UnsupportedDType {
                requested: format!("{dtype:?}"),
            });
        }

        let (batch, heads, q_len, head_dim) = q.dims4().map_err(|_| {
            AttentionError::shape("q must have shape [batch, heads, seq_len, head_dim]")
        })?;
        let (kb, kh, k_len, kd) = k.dims4().map_err(|_| {
            AttentionError::shape("k must have shape [batch, heads, seq_len, head_dim]")
        })?;
        let (vb, vh, vk, vd) = v.dims4().map_err(|_| {
            AttentionError::shape("v must have shape [batch, heads, seq_len, head_dim]")
        })?;
        if kb != batch || kh != heads || kd != head_dim {
            return Err(AttentionError::shape(format!(
                "k shape mismatch: expected [{batch}, {heads}, ?, {head_dim}] got [{kb}, {kh}, {k_len}, {kd}]"
            )));
        }
        if vb != batch || vh != heads || vk != k_len || vd != head_dim {
            return Err(AttentionError::shape(format!(
                "v shape mismatch: expected [{batch}, {heads}, {k_len}, {head_dim}] got [{vb}, {vh}, {vk}, {vd}]"
            )));
        }
        if let Some(mask) = mask {
            self.validate_mask(mask, q, (batch, heads, q_len, k_len))?;
        }

        if self.first_call.set(()).is_ok() {
            log::info!(
                "attention::reference init dtype={dtype:?} heads={heads} head_dim={head_dim} masked={}",
                mask.is_some()
            );
        }

        let merged = batch * heads;
        let q_view = q
            .to_dtype(DType::F32)?
            .contiguous()?
            .reshape((merged, q_len, head_dim))?;
        let k_view = k
            .to_dtype(DType::F32)?
            .contiguous()?
            .reshape((merged, k_len, head_dim))?;
        let v_view = v
            .to_dtype(DType::F32)?
            .contiguous()?
            .reshape((merged, k_len, head_dim))?;

        let scale = 1.0 / (head_dim as f64).sqrt();
        let mut scores = q_view
            .matmul(&k_view.t()?.contiguous()?)?
            .affine(scale, 0.0)?
            .reshape((batch, heads, q_len, k_len))?;

        if let Some(mask) = mask {
            let additive = to_additive(mask, DType::F32)?;
            scores = scores.broadcast_add(&additive)?;
        }

        let probs = softmax_last_dim(&scores.reshape((merged, q_len, k_len))?)?;
        let output = probs
            .matmul(&v_view)?
            .reshape((batch, heads, q_len, head_dim))?;
        Ok(output.to_dtype(dtype)?)
    }
}
