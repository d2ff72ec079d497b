//! Builders for causal attention masks.

use candle_core::{bail, Device, Result, Tensor};

use super::MASK_DTYPE;

/// Lower-triangular `[max_seq_len, max_seq_len]` mask: row `p` allows keys
/// `0..=p`.
pub fn build_causal_mask(device: &Device, max_seq_len: usize) -> Result<Tensor> {
    let mut data = vec![0u8; max_seq_len * max_seq_len];
    for q in 0..max_seq_len {
        let row = q * max_seq_len;
        data[row..=row + q].fill(1);
    }
    Tensor::from_vec(data, (max_seq_len, max_seq_len), device)
}

/// Pick the rows of a `[L, L]` mask for the given query positions, producing
/// the `[1, positions.len(), L]` mask a decode step passes to the engine.
pub fn select_rows(mask: &Tensor, positions: &[usize]) -> Result<Tensor> {
    if mask.dtype() != MASK_DTYPE {
        bail!("mask must use {MASK_DTYPE:?}, got {:?}", mask.dtype());
    }
    let (rows, _cols) = mask.dims2()?;
    if positions.is_empty() {
        bail!("positions must not be empty");
    }
    if let Some(&bad) = positions.iter().find(|&&p| p >= rows) {
        bail!("position {bad} outside mask with {rows} rows");
    }
    let ids: Vec<u32> = positions.iter().map(|&p| p as u32).collect();
    let ids = Tensor::from_vec(ids, positions.len(), mask.device())?;
    mask.index_select(&ids, 0)?.unsqueeze(0)
}
