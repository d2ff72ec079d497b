//! Builders for padding masks used to drop padded keys.

use candle_core::{Device, Result, Tensor};

/// Boolean `[batch, q_len, k_len]` mask that keeps the first `key_lengths[b]`
/// keys of each batch element. Lengths beyond `k_len` are clamped.
pub fn padding_mask_from_lengths(
    device: &Device,
    key_lengths: &[usize],
    q_len: usize,
    k_len: usize,
) -> Result<Tensor> {
    let batch = key_lengths.len();
    let mut data = vec![0u8; batch * q_len * k_len];

    for (b, &valid) in key_lengths.iter().enumerate() {
        let valid = valid.min(k_len);
        for q in 0..q_len {
            let row_start = (b * q_len + q) * k_len;
            data[row_start..row_start + valid].fill(1);
        }
    }

    Tensor::from_vec(data, (batch, q_len, k_len), device)
}
