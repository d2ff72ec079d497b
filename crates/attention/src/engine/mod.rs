//! Multi-head attention with rotary positions, grouped-query heads and an
//! optional static key/value cache.
//!
//! A forward pass projects the query, rotates it at the supplied absolute
//! positions and then takes keys/values from a [`KvSource`]:
//!
//! * [`KvSource::Fresh`] projects and rotates a new key/value input. With a
//!   cache attached the result is written at the same positions and the whole
//!   valid prefix is read back, so earlier steps stay visible.
//! * [`KvSource::Cached`] reads the valid prefix of the cache as-is.
//!
//! Key/value heads are then repeated to match the query heads and handed to
//! [`ExactAttention`]. The engine never builds a causal mask itself; callers
//! pass one when they want causality.

mod source;
mod state;


use candle_core::{DType, Device, Tensor};
use embedding::positional::rope::{scaling_fingerprint, RotaryEmbedding};
use layers::{checks, Linear, LinearConfig, LinearInit};

use crate::core::{Attention, AttentionConfig, AttentionError, Result};
use crate::kv_cache::{CacheLayout, KeyValueCache, StaticKvCache};
use crate::masks::MASK_DTYPE;
use crate::reference::ExactAttention;

pub use source::KvSource;
pub use state::{K_PROJ_WEIGHT, OUTPUT_PROJ_WEIGHT, Q_PROJ_WEIGHT, V_PROJ_WEIGHT};

/// Attention block owning its projections, rotary tables and cache.
#[derive(Debug)]
pub struct MultiHeadAttention {
    config: AttentionConfig,
    q_proj: Linear,
    k_proj: Linear,
    v_proj: Linear,
    output_proj: Linear,
    rotary: RotaryEmbedding,
    attention: ExactAttention,
    cache: Option<StaticKvCache>,
    setup_locked: bool,
}

impl MultiHeadAttention {
    /// Assemble an engine from prebuilt projections and rotary tables.
    ///
    /// Projections are `[out, in]` without bias: q `[q_dim, embed_dim]`, k and
    /// v `[kv_dim, embed_dim]`, output `[embed_dim, q_dim]`. The rotary tables
    /// must match `head_dim` and cover at least `max_seq_len` positions.
    pub fn new(
        config: AttentionConfig,
        q_proj: Linear,
        k_proj: Linear,
        v_proj: Linear,
        output_proj: Linear,
        rotary: RotaryEmbedding,
    ) -> Result<Self> {
        config.validate()?;

        let expected = [
            ("q_proj", &q_proj, LinearConfig::new(config.embed_dim, config.q_dim())),
            ("k_proj", &k_proj, LinearConfig::new(config.embed_dim, config.kv_dim())),
            ("v_proj", &v_proj, LinearConfig::new(config.embed_dim, config.kv_dim())),
            ("output_proj", &output_proj, LinearConfig::new(config.q_dim(), config.embed_dim)),
        ];
        for (name, proj, want) in &expected {
            if proj.config() != want {
                return Err(AttentionError::config(format!(
                    "{name} maps {} -> {}, expected {} -> {}",
                    proj.config().input_dim,
                    proj.config().output_dim,
                    want.input_dim,
                    want.output_dim
                )));
            }
            if proj.dtype() != q_proj.dtype() || !proj.device().same_device(q_proj.device()) {
                return Err(AttentionError::config(format!(
                    "{name} must share dtype and device with q_proj ({:?})",
                    q_proj.dtype()
                )));
            }
        }

        if rotary.head_dim() != config.head_dim {
            return Err(AttentionError::config(format!(
                "rotary head_dim {} does not match head_dim {}",
                rotary.head_dim(),
                config.head_dim
            )));
        }
        if rotary.max_seq_len() < config.max_seq_len {
            return Err(AttentionError::config(format!(
                "rotary tables cover {} positions, max_seq_len is {}",
                rotary.max_seq_len(),
                config.max_seq_len
            )));
        }
        if !rotary.device().same_device(q_proj.device()) {
            return Err(AttentionError::config(
                "rotary tables must live on the projection device",
            ));
        }

        log::info!(
            "attention init embed_dim={} heads={} kv_heads={} head_dim={} max_seq_len={} dtype={:?} rope={}",
            config.embed_dim,
            config.num_heads,
            config.num_kv_heads,
            config.head_dim,
            config.max_seq_len,
            q_proj.dtype(),
            scaling_fingerprint(rotary.config())
        );

        Ok(Self {
            config,
            q_proj,
            k_proj,
            v_proj,
            output_proj,
            rotary,
            attention: ExactAttention::new(),
            cache: None,
            setup_locked: false,
        })
    }

    /// Build an engine with freshly initialised projections and rotary tables
    /// derived from `config`.
    pub fn with_init(
        config: AttentionConfig,
        init: &LinearInit,
        device: &Device,
        dtype: DType,
    ) -> Result<Self> {
        config.validate()?;
        let q_proj = Linear::with_init(
            LinearConfig::new(config.embed_dim, config.q_dim()),
            init,
            device,
            dtype,
        )?;
        let k_proj = Linear::with_init(
            LinearConfig::new(config.embed_dim, config.kv_dim()),
            init,
            device,
            dtype,
        )?;
        let v_proj = Linear::with_init(
            LinearConfig::new(config.embed_dim, config.kv_dim()),
            init,
            device,
            dtype,
        )?;
        let output_proj = Linear::with_init(
            LinearConfig::new(config.q_dim(), config.embed_dim),
            init,
            device,
            dtype,
        )?;
        let rotary = RotaryEmbedding::new(config.rope_config(), device)?;
        Self::new(config, q_proj, k_proj, v_proj, output_proj, rotary)
    }

    pub fn config(&self) -> &AttentionConfig {
        &self.config
    }

    pub fn dtype(&self) -> DType {
        self.q_proj.dtype()
    }

    pub fn device(&self) -> &Device {
        self.q_proj.device()
    }

    pub fn rotary(&self) -> &RotaryEmbedding {
        &self.rotary
    }

    /// The attached cache, if any.
    pub fn cache(&self) -> Option<&StaticKvCache> {
        self.cache.as_ref()
    }

    pub fn caches_are_setup(&self) -> bool {
        self.cache.is_some()
    }

    /// Attach a zeroed cache of `[batch_size, num_kv_heads, max_seq_len,
    /// head_dim]`.
    ///
    /// A second call fails until [`reset_cache`](Self::reset_cache) runs.
    pub fn setup_cache(&mut self, batch_size: usize, dtype: DType, max_seq_len: usize) -> Result<()> {
        if self.setup_locked {
            return Err(AttentionError::state(
                "kv cache already set up; call reset_cache before setting it up again",
            ));
        }
        if batch_size == 0 || max_seq_len == 0 {
            return Err(AttentionError::config(format!(
                "cache needs a non-zero batch and length, got batch={batch_size} max_seq_len={max_seq_len}"
            )));
        }
        if max_seq_len > self.config.max_seq_len {
            return Err(AttentionError::config(format!(
                "cache length {max_seq_len} exceeds max_seq_len {}",
                self.config.max_seq_len
            )));
        }

        let layout = CacheLayout {
            batch: batch_size,
            num_kv_heads: self.config.num_kv_heads,
            max_seq_len,
            head_dim: self.config.head_dim,
        };
        let cache = StaticKvCache::new(layout, dtype, self.q_proj.device())?;
        self.cache = Some(cache);
        self.setup_locked = true;
        Ok(())
    }

    /// Zero the cache and rewind its cursor. The cache stays attached and a
    /// later `setup_cache` is allowed again. No-op without a cache.
    pub fn reset_cache(&mut self) -> Result<()> {
        match self.cache.as_mut() {
            Some(cache) => cache.reset()?,
            None => log::debug!("reset_cache called without an attached cache"),
        }
        self.setup_locked = false;
        Ok(())
    }

    /// Attend `query` (`[batch, seq_len, embed_dim]`) over keys and values
    /// from `kv`.
    ///
    /// `mask` is boolean (`u8`, 1 = may attend) shaped `[batch, seq_len, L]`
    /// or `[seq_len, L]`, with `L` at least the number of keys attended; only
    /// its first columns are used. `input_pos` gives each query token's
    /// absolute position and defaults to `0..seq_len`.
    pub fn forward(
        &mut self,
        query: &Tensor,
        kv: KvSource<'_>,
        mask: Option<&Tensor>,
        input_pos: Option<&[usize]>,
    ) -> Result<Tensor> {
        let (batch, seq_len) = self.check_input("query", query)?;
        let positions = self.resolve_positions(input_pos, seq_len)?;
        if let Some(cache) = &self.cache {
            if cache.batch_size() != batch {
                return Err(AttentionError::state(format!(
                    "input batch {batch} does not match cache batch {}",
                    cache.batch_size()
                )));
            }
        }

        if let KvSource::Fresh(input) = kv {
            let (kv_batch, kv_len) = self.check_input("kv input", input)?;
            if kv_batch != batch || kv_len != seq_len {
                return Err(AttentionError::shape(format!(
                    "kv input is [{kv_batch}, {kv_len}, ..], query is [{batch}, {seq_len}, ..]"
                )));
            }
        }
        // Validate the mask against the key length before the cache is touched.
        let k_len = self.key_len(kv, &positions)?;
        let mask = match mask {
            Some(mask) => Some(prepare_mask(mask, batch, seq_len, k_len)?),
            None => None,
        };

        let heads = self.config.num_heads;
        let kv_heads = self.config.num_kv_heads;
        let head_dim = self.config.head_dim;

        let q = project_heads(&self.q_proj, query, heads, head_dim)?;
        let q = self.rotary.apply(&q, &positions)?;

        let (k, v) = match kv {
            KvSource::Fresh(input) => {
                let k = project_heads(&self.k_proj, input, kv_heads, head_dim)?;
                let k = self.rotary.apply(&k, &positions)?;
                let v = project_heads(&self.v_proj, input, kv_heads, head_dim)?;
                match self.cache.as_mut() {
                    Some(cache) => {
                        let dtype = cache.dtype();
                        cache.write(&k.to_dtype(dtype)?, &v.to_dtype(dtype)?, &positions)?;
                        let (k, v) = cache.view()?;
                        log::debug!(
                            "attention forward: fresh kv written, attending {} cached positions",
                            cache.valid_len()
                        );
                        (k.to_dtype(q.dtype())?, v.to_dtype(q.dtype())?)
                    }
                    None => {
                        log::debug!("attention forward: fresh kv without cache");
                        (k, v)
                    }
                }
            }
            KvSource::Cached => {
                let cache = self.cache.as_mut().ok_or_else(|| {
                    AttentionError::state("cache reuse requested but no cache is set up")
                })?;
                let (k, v) = cache.view()?;
                log::debug!(
                    "attention forward: reusing {} cached positions",
                    cache.valid_len()
                );
                (k.to_dtype(q.dtype())?, v.to_dtype(q.dtype())?)
            }
        };

        let groups = self.config.num_kv_groups();
        let k = repeat_kv(&k, groups)?;
        let v = repeat_kv(&v, groups)?;

        let attended = self.attention.attend(&q, &k, &v, mask.as_ref())?;
        let merged = attended
            .transpose(1, 2)?
            .contiguous()?
            .reshape((batch, seq_len, heads * head_dim))?;
        Ok(self.output_proj.forward(&merged)?)
    }

    /// Number of keys the forward pass will attend.
    fn key_len(&self, kv: KvSource<'_>, positions: &[usize]) -> Result<usize> {
        let highest = positions.last().copied().unwrap_or(0);
        match (kv, &self.cache) {
            (KvSource::Fresh(_), None) => Ok(positions.len()),
            (KvSource::Fresh(_), Some(cache)) => Ok(cache.valid_len().max(highest + 1)),
            (KvSource::Cached, None) => Err(AttentionError::state(
                "cache reuse requested but no cache is set up",
            )),
            (KvSource::Cached, Some(cache)) if cache.is_empty() => Err(AttentionError::state(
                "cache reuse requested before anything was cached",
            )),
            (KvSource::Cached, Some(cache)) => Ok(cache.valid_len()),
        }
    }

    fn check_input(&self, name: &str, input: &Tensor) -> Result<(usize, usize)> {
        checks::expect_batch_seq_hidden(name, input, self.config.embed_dim)
            .map_err(|err| AttentionError::shape(err.to_string()))?;
        let (batch, seq_len, _) = input.dims3()?;
        if input.dtype() != self.dtype() {
            return Err(AttentionError::UnsupportedDType {
                requested: format!(
                    "{name} is {:?} but the projections are {:?}",
                    input.dtype(),
                    self.dtype()
                ),
            });
        }
        Ok((batch, seq_len))
    }

    fn resolve_positions(&self, input_pos: Option<&[usize]>, seq_len: usize) -> Result<Vec<usize>> {
        let positions = match input_pos {
            Some(pos) => pos.to_vec(),
            None => (0..seq_len).collect(),
        };
        if positions.len() != seq_len {
            return Err(AttentionError::shape(format!(
                "{} positions supplied for {seq_len} query tokens",
                positions.len()
            )));
        }
        if positions.windows(2).any(|w| w[1] < w[0]) {
            return Err(AttentionError::shape(format!(
                "positions must be non-decreasing, got {positions:?}"
            )));
        }
        let limit = self
            .cache
            .as_ref()
            .map_or(self.config.max_seq_len, StaticKvCache::max_seq_len);
        if let Some(&bad) = positions.iter().find(|&&p| p >= limit) {
            return Err(AttentionError::state(format!(
                "position {bad} is outside the {limit} addressable positions"
            )));
        }
        Ok(positions)
    }
}

/// Project `[batch, seq_len, embed_dim]` and split heads into
/// `[batch, heads, seq_len, head_dim]`.
fn project_heads(proj: &Linear, input: &Tensor, heads: usize, head_dim: usize) -> Result<Tensor> {
    let (batch, seq_len, _) = input.dims3()?;
    let projected = proj.forward(input)?;
    Ok(projected
        .reshape((batch, seq_len, heads, head_dim))?
        .transpose(1, 2)?
        .contiguous()?)
}

/// Repeat each key/value head `n_rep` times so query head `h` reads kv head
/// `h / n_rep`.
fn repeat_kv(xs: &Tensor, n_rep: usize) -> Result<Tensor> {
    if n_rep == 1 {
        return Ok(xs.clone());
    }
    let (batch, kv_heads, seq_len, head_dim) = xs.dims4()?;
    Ok(Tensor::cat(&vec![xs; n_rep], 2)?.reshape((batch, kv_heads * n_rep, seq_len, head_dim))?)
}

/// Normalise a `[b, s, L]` or `[s, L]` boolean mask to `[b, 1, s, k_len]`.
fn prepare_mask(mask: &Tensor, batch: usize, seq_len: usize, k_len: usize) -> Result<Tensor> {
    if mask.dtype() != MASK_DTYPE {
        return Err(AttentionError::UnsupportedDType {
            requested: format!("mask must be {MASK_DTYPE:?}, got {:?}", mask.dtype()),
        });
    }
    let mask = match mask.rank() {
        2 => mask.unsqueeze(0)?,
        3 => mask.clone(),
        _ => {
            return Err(AttentionError::shape(format!(
                "mask must be [batch, seq_len, L] or [seq_len, L], got {:?}",
                mask.dims()
            )))
        }
    };
    let (mask_batch, rows, cols) = mask.dims3()?;
    if (mask_batch != batch && mask_batch != 1) || rows != seq_len || cols < k_len {
        return Err(AttentionError::shape(format!(
            "mask {:?} cannot cover batch={batch} seq_len={seq_len} keys={k_len}",
            mask.dims()
        )));
    }
    Ok(mask
        .narrow(2, 0, k_len)?
        .unsqueeze(1)?
        .broadcast_as((batch, 1, seq_len, k_len))?
        .contiguous()?)
}
