//! Rotary positional embeddings.
//!
//! Tables are f32 tensors shaped `[max_seq_len, head_dim / 2]` holding the
//! sine and cosine of `position * inv_freq[i]`. Rotation pairs adjacent
//! features `(x[2i], x[2i + 1])` of every head, so inputs are laid out as
//! `[batch, n_heads, seq_len, head_dim]` with an even `head_dim`.
//!
//! Frequencies follow the geometric schedule `theta^(-2i / head_dim)`. The
//! [`RopeScaling::Llama3`] variant stretches low frequencies for long-context
//! checkpoints and leaves high frequencies untouched, interpolating smoothly in
//! between.

use std::f64::consts::PI;

use candle_core::{bail, DType, Device, Result, Tensor};

/// Configuration for building rotary positional embeddings.
#[derive(Debug, Clone, PartialEq)]
pub struct RopeConfig {
    /// Per-head dimensionality of the representations being rotated.
    pub head_dim: usize,
    /// Base angle parameter θ controlling the frequency spectrum.
    pub rope_theta: f32,
    /// Number of absolute positions covered by the precomputed tables.
    pub max_seq_len: usize,
    /// Strategy used to rescale frequencies for extended context lengths.
    pub scaling: RopeScaling,
}

impl Default for RopeConfig {
    fn default() -> Self {
        Self {
            head_dim: 0,
            rope_theta: 10_000.0,
            max_seq_len: 0,
            scaling: RopeScaling::default(),
        }
    }
}

/// Available frequency scaling strategies.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum RopeScaling {
    /// Unscaled geometric schedule.
    #[default]
    None,
    /// Llama-3 wavelength-banded scaling.
    Llama3 {
        scale_factor: f32,
        low_freq_factor: f32,
        high_freq_factor: f32,
        old_context_len: usize,
    },
}

impl RopeScaling {
    /// Llama-3 scaling with the published band factors (1, 4) and an 8k
    /// original context.
    pub fn llama3(scale_factor: f32) -> Self {
        Self::Llama3 {
            scale_factor,
            low_freq_factor: 1.0,
            high_freq_factor: 4.0,
            old_context_len: 8192,
        }
    }
}

impl RopeConfig {
    /// Check the geometry and scaling parameters.
    pub fn validate(&self) -> Result<()> {
        if self.head_dim == 0 {
            bail!("head_dim must be non-zero");
        }
        if self.head_dim % 2 != 0 {
            bail!("head_dim must be even to pair dimensions, got {}", self.head_dim);
        }
        if self.max_seq_len == 0 {
            bail!("max_seq_len must be non-zero");
        }
        if !(self.rope_theta > 0.0) {
            bail!("rope_theta must be positive, got {}", self.rope_theta);
        }
        if let RopeScaling::Llama3 {
            scale_factor,
            low_freq_factor,
            high_freq_factor,
            old_context_len,
        } = self.scaling
        {
            if !(scale_factor > 0.0) {
                bail!("llama3 scale_factor must be positive, got {scale_factor}");
            }
            if !(low_freq_factor > 0.0) || high_freq_factor <= low_freq_factor {
                bail!(
                    "llama3 frequency band requires 0 < low ({low_freq_factor}) < high ({high_freq_factor})"
                );
            }
            if old_context_len == 0 {
                bail!("llama3 old_context_len must be non-zero");
            }
        }
        Ok(())
    }
}

/// Inverse frequencies for each of the `head_dim / 2` rotation pairs, after
/// scaling.
pub fn inverse_frequencies(cfg: &RopeConfig) -> Vec<f64> {
    let base = cfg.rope_theta as f64;
    let dim = cfg.head_dim as f64;
    let raw = (0..cfg.head_dim / 2).map(|idx| base.powf(-((2 * idx) as f64) / dim));

    match cfg.scaling {
        RopeScaling::None => raw.collect(),
        RopeScaling::Llama3 {
            scale_factor,
            low_freq_factor,
            high_freq_factor,
            old_context_len,
        } => {
            let scale = scale_factor as f64;
            let low = low_freq_factor as f64;
            let high = high_freq_factor as f64;
            let old_ctx = old_context_len as f64;
            let low_freq_wavelen = old_ctx / low;
            let high_freq_wavelen = old_ctx / high;
            raw.map(|freq| {
                let wavelen = 2.0 * PI / freq;
                if wavelen < high_freq_wavelen {
                    freq
                } else if wavelen > low_freq_wavelen {
                    freq / scale
                } else {
                    let smooth = (old_ctx / wavelen - low) / (high - low);
                    (1.0 - smooth) * freq / scale + smooth * freq
                }
            })
            .collect()
        }
    }
}

/// Produce a stable fingerprint describing the effective rotary geometry.
pub fn scaling_fingerprint(cfg: &RopeConfig) -> String {
    let mut fingerprint = format!(
        "head_dim={};theta={:.6};max_seq={}",
        cfg.head_dim, cfg.rope_theta, cfg.max_seq_len
    );
    match cfg.scaling {
        RopeScaling::None => fingerprint.push_str(";mode=none"),
        RopeScaling::Llama3 {
            scale_factor,
            low_freq_factor,
            high_freq_factor,
            old_context_len,
        } => fingerprint.push_str(&format!(
            ";mode=llama3;scale={scale_factor:.6};low={low_freq_factor:.6};high={high_freq_factor:.6};old_ctx={old_context_len}"
        )),
    }
    fingerprint
}

/// Rotate `x` (`[batch, n_heads, seq_len, head_dim]`) with per-row tables.
///
/// `sin` and `cos` are shaped `[seq_len, head_dim / 2]`, one row per token of
/// `x`, so callers control which absolute position each token receives. The
/// rotation runs in f32 and the output keeps the dtype of `x`.
pub fn apply_rotary(x: &Tensor, sin: &Tensor, cos: &Tensor) -> Result<Tensor> {
    let (batch, heads, seq_len, head_dim) = x.dims4()?;
    if head_dim % 2 != 0 {
        bail!("head_dim must be even to pair dimensions, got {head_dim}");
    }
    let half_dim = head_dim / 2;
    if sin.dims2()? != (seq_len, half_dim) || cos.dims2()? != (seq_len, half_dim) {
        bail!(
            "rotary tables must be [{seq_len}, {half_dim}], got sin={:?} cos={:?}",
            sin.dims(),
            cos.dims()
        );
    }

    let sin_b = sin
        .to_dtype(DType::F32)?
        .reshape((1, 1, seq_len, half_dim))?
        .broadcast_as((batch, heads, seq_len, half_dim))?;
    let cos_b = cos
        .to_dtype(DType::F32)?
        .reshape((1, 1, seq_len, half_dim))?
        .broadcast_as((batch, heads, seq_len, half_dim))?;

    let dtype = x.dtype();
    let pairs = x
        .to_dtype(DType::F32)?
        .contiguous()?
        .reshape((batch, heads, seq_len, half_dim, 2))?;
    let even = pairs.narrow(4, 0, 1)?.squeeze(4)?;
    let odd = pairs.narrow(4, 1, 1)?.squeeze(4)?;

    let rotated_even = even.mul(&cos_b)?.sub(&odd.mul(&sin_b)?)?;
    let rotated_odd = odd.mul(&cos_b)?.add(&even.mul(&sin_b)?)?;

    Tensor::stack(&[&rotated_even, &rotated_odd], 4)?
        .reshape((batch, heads, seq_len, head_dim))?
        .to_dtype(dtype)
}

/// Precomputed rotary tables indexed by absolute position.
#[derive(Debug, Clone)]
pub struct RotaryEmbedding {
    config: RopeConfig,
    sin: Tensor,
    cos: Tensor,
}

impl RotaryEmbedding {
    /// Build the sine/cosine tables for `config.max_seq_len` positions.
    pub fn new(config: RopeConfig, device: &Device) -> Result<Self> {
        config.validate()?;

        let inv_freqs = inverse_frequencies(&config);
        let half_dim = inv_freqs.len();
        let mut sin_data = Vec::with_capacity(config.max_seq_len * half_dim);
        let mut cos_data = Vec::with_capacity(config.max_seq_len * half_dim);
        for pos in 0..config.max_seq_len {
            let pos_f = pos as f64;
            for &inv_freq in &inv_freqs {
                let angle = pos_f * inv_freq;
                sin_data.push(angle.sin() as f32);
                cos_data.push(angle.cos() as f32);
            }
        }
        let sin = Tensor::from_vec(sin_data, (config.max_seq_len, half_dim), device)?;
        let cos = Tensor::from_vec(cos_data, (config.max_seq_len, half_dim), device)?;

        log::debug!("rope tables built: {}", scaling_fingerprint(&config));
        Ok(Self { config, sin, cos })
    }

    pub fn config(&self) -> &RopeConfig {
        &self.config
    }

    pub fn head_dim(&self) -> usize {
        self.config.head_dim
    }

    pub fn max_seq_len(&self) -> usize {
        self.config.max_seq_len
    }

    pub fn device(&self) -> &Device {
        self.sin.device()
    }

    /// Full `(sin, cos)` tables shaped `[max_seq_len, head_dim / 2]`.
    pub fn tables(&self) -> (&Tensor, &Tensor) {
        (&self.sin, &self.cos)
    }

    /// Gather table rows for arbitrary absolute positions.
    pub fn sin_cos_rows(&self, positions: &[usize]) -> Result<(Tensor, Tensor)> {
        if positions.is_empty() {
            bail!("positions must not be empty");
        }
        if let Some(&bad) = positions.iter().find(|&&p| p >= self.config.max_seq_len) {
            bail!(
                "position {bad} outside rotary table of {} positions",
                self.config.max_seq_len
            );
        }
        let ids: Vec<u32> = positions.iter().map(|&p| p as u32).collect();
        let ids = Tensor::from_vec(ids, positions.len(), self.sin.device())?;
        let sin = self.sin.index_select(&ids, 0)?;
        let cos = self.cos.index_select(&ids, 0)?;
        Ok((sin, cos))
    }

    /// Rotate `x` (`[batch, n_heads, seq_len, head_dim]`), assigning
    /// `positions[i]` to token `i`.
    pub fn apply(&self, x: &Tensor, positions: &[usize]) -> Result<Tensor> {
        let (_b, _h, seq_len, head_dim) = x.dims4()?;
        if head_dim != self.config.head_dim {
            bail!(
                "input head_dim {head_dim} does not match rotary head_dim {}",
                self.config.head_dim
            );
        }
        if positions.len() != seq_len {
            bail!(
                "positions length {} does not match sequence length {seq_len}",
                positions.len()
            );
        }
        let (sin, cos) = self.sin_cos_rows(positions)?;
        apply_rotary(x, &sin, &cos)
    }
}
