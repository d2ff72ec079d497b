//! Core traits and types shared across attention implementations.
//!
//! Kernels operate on tensors with layout `[batch, n_heads, seq_len, head_dim]`.
//! The output tensor mirrors the input layout, and reductions accumulate in
//! `f32` regardless of the incoming dtype (`bf16`, `f16`, or `f32`).

pub mod config;
pub mod errors;

use candle_core::Tensor;

pub use config::AttentionConfig;
pub use errors::{AttentionError, Result};

/// Unified interface for scaled dot-product attention kernels.
///
/// * `q` is `[batch, n_heads, q_len, head_dim]`; `k` and `v` are
///   `[batch, n_heads, k_len, head_dim]`.
/// * The returned tensor mirrors the layout and dtype of `q`.
/// * Masks, when present, are boolean (`u8`, non-zero = may attend) and shaped
///   `[batch, 1 or n_heads, q_len, k_len]`.
pub trait Attention {
    fn attend(&self, q: &Tensor, k: &Tensor, v: &Tensor, mask: Option<&Tensor>) -> Result<Tensor>;
}
