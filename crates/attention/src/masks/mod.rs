//! Mask utilities shared by attention implementations.
//!
//! Masks are boolean tensors with dtype [`MASK_DTYPE`] (`u8`): `1` where a
//! query may attend to a key and `0` where it may not. Kernels turn them into
//! additive `0.0` / `f32::NEG_INFINITY` tensors with [`to_additive`] just
//! before the softmax.

pub mod causal;
pub mod padding;

use candle_core::{DType, Result, Tensor};

/// Dtype shared by all boolean masks.
pub const MASK_DTYPE: DType = DType::U8;

pub use causal::{build_causal_mask, select_rows};
pub use padding::padding_mask_from_lengths;

/// Convert a boolean mask into an additive one of the same shape.
pub fn to_additive(mask: &Tensor, dtype: DType) -> Result<Tensor> {
    let dims = mask.dims();
    let keep = Tensor::zeros(dims, dtype, mask.device())?;
    let drop = Tensor::full(f32::NEG_INFINITY, dims, mask.device())?.to_dtype(dtype)?;
    mask.where_cond(&keep, &drop)
}
