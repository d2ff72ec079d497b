//! Static configuration of a multi-head attention block.
//!
//! [`AttentionConfig`] captures the head geometry and rotary parameters. It can
//! be built in code or loaded from a JSON/TOML file; either way it is checked
//! by [`AttentionConfig::validate`] before an engine accepts it.

use std::fs;
use std::path::Path;

use embedding::positional::rope::{RopeConfig, RopeScaling};
use serde::Deserialize;

use crate::core::{AttentionError, Result};

fn default_rope_base() -> f32 {
    10_000.0
}

fn default_rope_scale_factor() -> f32 {
    1.0
}

/// Head geometry and rotary parameters for one attention block.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct AttentionConfig {
    /// Width of the residual stream entering and leaving the block.
    pub embed_dim: usize,
    /// Number of query heads.
    pub num_heads: usize,
    /// Number of key/value heads; each serves `num_heads / num_kv_heads` query heads.
    pub num_kv_heads: usize,
    pub head_dim: usize,
    /// Positions covered by the rotary tables and the largest cache allowed.
    pub max_seq_len: usize,
    #[serde(default = "default_rope_base")]
    pub rope_base: f32,
    /// Llama-3 frequency scale; `1.0` leaves the schedule unscaled.
    #[serde(default = "default_rope_scale_factor")]
    pub rope_scale_factor: f32,
}

impl AttentionConfig {
    /// Load a configuration from `.json` or `.toml` (the default for unknown
    /// or missing extensions is TOML) and validate it.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)?;
        let config: AttentionConfig = match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => serde_json::from_str(&contents)?,
            Some("toml") | None => toml::from_str(&contents)?,
            Some(other) => {
                return Err(AttentionError::ConfigFormat(format!(
                    "unsupported configuration extension '{other}'"
                )));
            }
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let mut errors = Vec::new();

        for (name, value) in [
            ("embed_dim", self.embed_dim),
            ("num_heads", self.num_heads),
            ("num_kv_heads", self.num_kv_heads),
            ("head_dim", self.head_dim),
            ("max_seq_len", self.max_seq_len),
        ] {
            if value == 0 {
                errors.push(format!("{name} must be greater than 0"));
            }
        }

        if self.num_kv_heads > self.num_heads {
            errors.push(format!(
                "num_kv_heads ({}) must not exceed num_heads ({})",
                self.num_kv_heads, self.num_heads
            ));
        }
        if self.num_kv_heads > 0 && self.num_heads % self.num_kv_heads != 0 {
            errors.push(format!(
                "num_heads ({}) must be divisible by num_kv_heads ({})",
                self.num_heads, self.num_kv_heads
            ));
        }
        if self.head_dim % 2 != 0 {
            errors.push(format!(
                "head_dim ({}) must be even for rotary embeddings",
                self.head_dim
            ));
        }
        if !(self.rope_base > 0.0) {
            errors.push(format!("rope_base must be positive, got {}", self.rope_base));
        }
        if !(self.rope_scale_factor >= 1.0) {
            errors.push(format!(
                "rope_scale_factor must be >= 1, got {}",
                self.rope_scale_factor
            ));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(AttentionError::config(errors.join("; ")))
        }
    }

    /// Width of the concatenated query heads.
    pub fn q_dim(&self) -> usize {
        self.num_heads * self.head_dim
    }

    /// Width of the concatenated key (or value) heads.
    pub fn kv_dim(&self) -> usize {
        self.num_kv_heads * self.head_dim
    }

    /// Query heads sharing each key/value head.
    pub fn num_kv_groups(&self) -> usize {
        self.num_heads / self.num_kv_heads
    }

    /// Rotary configuration derived from the head geometry.
    pub fn rope_config(&self) -> RopeConfig {
        let scaling = if self.rope_scale_factor > 1.0 {
            RopeScaling::llama3(self.rope_scale_factor)
        } else {
            RopeScaling::None
        };
        RopeConfig {
            head_dim: self.head_dim,
            rope_theta: self.rope_base,
            max_seq_len: self.max_seq_len,
            scaling,
        }
    }
}
