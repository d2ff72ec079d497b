#![allow(dead_code)]

use std::collections::HashMap;

use anyhow::{anyhow, Result};
use attention::{AttentionConfig, MultiHeadAttention};
use candle_core::{DType, Device, Tensor};
use embedding::positional::rope::inverse_frequencies;
use layers::LinearInit;

pub fn llama_block(embed_dim: usize, num_heads: usize, num_kv_heads: usize, head_dim: usize) -> AttentionConfig {
    AttentionConfig {
        embed_dim,
        num_heads,
        num_kv_heads,
        head_dim,
        max_seq_len: 128,
        rope_base: 500_000.0,
        rope_scale_factor: 32.0,
    }
}

pub fn build_engine(config: &AttentionConfig) -> Result<MultiHeadAttention> {
    Ok(MultiHeadAttention::with_init(
        config.clone(),
        &LinearInit::fan_in_uniform(),
        &Device::Cpu,
        DType::F32,
    )?)
}

/// A second engine carrying the same weights as `source`.
pub fn twin(source: &MultiHeadAttention) -> Result<MultiHeadAttention> {
    let mut copy = build_engine(source.config())?;
    copy.load_state_dict(&source.state_dict())?;
    Ok(copy)
}

pub fn random_input(batch: usize, seq_len: usize, embed_dim: usize) -> Result<Tensor> {
    Ok(Tensor::randn(0f32, 1.0, (batch, seq_len, embed_dim), &Device::Cpu)?)
}

pub fn max_abs_diff(a: &Tensor, b: &Tensor) -> Result<f32> {
    Ok(a
        .to_dtype(DType::F32)?
        .sub(&b.to_dtype(DType::F32)?)?
        .abs()?
        .max_all()?
        .to_vec0::<f32>()?)
}

struct Dense {
    rows: usize,
    cols: usize,
    data: Vec<f32>,
}

impl Dense {
    fn from_state(state: &HashMap<String, Tensor>, name: &str) -> Result<Self> {
        let weight = state
            .get(name)
            .ok_or_else(|| anyhow!("missing weight {name}"))?;
        let (rows, cols) = weight.dims2()?;
        let data = weight.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?;
        Ok(Self { rows, cols, data })
    }

    /// `tokens[t] @ W^T` for every token.
    fn apply(&self, tokens: &[Vec<f32>]) -> Vec<Vec<f32>> {
        tokens
            .iter()
            .map(|token| {
                (0..self.rows)
                    .map(|r| {
                        let row = &self.data[r * self.cols..(r + 1) * self.cols];
                        row.iter().zip(token).map(|(w, x)| (*w as f64) * (*x as f64)).sum::<f64>() as f32
                    })
                    .collect()
            })
            .collect()
    }
}

fn rotate(head: &mut [f32], position: usize, freqs: &[f64]) {
    for (i, freq) in freqs.iter().enumerate() {
        let angle = position as f64 * freq;
        let (sin, cos) = (angle.sin() as f32, angle.cos() as f32);
        let (x0, x1) = (head[2 * i], head[2 * i + 1]);
        head[2 * i] = x0 * cos - x1 * sin;
        head[2 * i + 1] = x1 * cos + x0 * sin;
    }
}

/// Loop-based multi-head attention with rotary embeddings and no cache.
///
/// Query and key/value tokens share `positions`. With `causal`, query `i`
/// only sees keys whose position is at most `positions[i]`.
pub fn reference_forward(
    config: &AttentionConfig,
    state: &HashMap<String, Tensor>,
    query: &Tensor,
    kv: &Tensor,
    positions: &[usize],
    causal: bool,
) -> Result<Tensor> {
    let (batch, seq_len, embed_dim) = query.dims3()?;
    let heads = config.num_heads;
    let kv_heads = config.num_kv_heads;
    let head_dim = config.head_dim;
    let groups = heads / kv_heads;
    let freqs = inverse_frequencies(&config.rope_config());
    let scale = 1.0 / (head_dim as f64).sqrt();

    let wq = Dense::from_state(state, "q_proj.weight")?;
    let wk = Dense::from_state(state, "k_proj.weight")?;
    let wv = Dense::from_state(state, "v_proj.weight")?;
    let wo = Dense::from_state(state, "output_proj.weight")?;

    let query = query.to_dtype(DType::F32)?.to_vec3::<f32>()?;
    let kv = kv.to_dtype(DType::F32)?.to_vec3::<f32>()?;
    let mut output = Vec::with_capacity(batch * seq_len * embed_dim);

    for b in 0..batch {
        let mut q = wq.apply(&query[b]);
        let mut k = wk.apply(&kv[b]);
        let v = wv.apply(&kv[b]);
        for t in 0..seq_len {
            for h in 0..heads {
                rotate(&mut q[t][h * head_dim..(h + 1) * head_dim], positions[t], &freqs);
            }
            for h in 0..kv_heads {
                rotate(&mut k[t][h * head_dim..(h + 1) * head_dim], positions[t], &freqs);
            }
        }

        let mut merged = vec![vec![0f32; heads * head_dim]; seq_len];
        for h in 0..heads {
            let kv_h = h / groups;
            for i in 0..seq_len {
                let qi = &q[i][h * head_dim..(h + 1) * head_dim];
                let scores: Vec<Option<f64>> = (0..seq_len)
                    .map(|j| {
                        if causal && positions[j] > positions[i] {
                            return None;
                        }
                        let kj = &k[j][kv_h * head_dim..(kv_h + 1) * head_dim];
                        let dot: f64 = qi.iter().zip(kj).map(|(a, b)| (*a as f64) * (*b as f64)).sum();
                        Some(dot * scale)
                    })
                    .collect();
                let max = scores
                    .iter()
                    .flatten()
                    .fold(f64::NEG_INFINITY, |acc, s| acc.max(*s));
                let weights: Vec<f64> = scores
                    .iter()
                    .map(|s| s.map_or(0.0, |s| (s - max).exp()))
                    .collect();
                let denom: f64 = weights.iter().sum();
                for d in 0..head_dim {
                    let acc: f64 = weights
                        .iter()
                        .enumerate()
                        .map(|(j, w)| w * v[j][kv_h * head_dim + d] as f64)
                        .sum();
                    merged[i][h * head_dim + d] = (acc / denom) as f32;
                }
            }
        }

        for token in wo.apply(&merged) {
            output.extend(token);
        }
    }

    Ok(Tensor::from_vec(output, (batch, seq_len, embed_dim), &Device::Cpu)?)
}
