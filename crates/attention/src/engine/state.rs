//! Named weights of an engine and their safetensors persistence.

use std::collections::HashMap;
use std::path::Path;

use candle_core::Tensor;
use layers::checks::FLOAT_DTYPES;

use super::MultiHeadAttention;
use crate::core::{AttentionError, Result};

pub const Q_PROJ_WEIGHT: &str = "q_proj.weight";
pub const K_PROJ_WEIGHT: &str = "k_proj.weight";
pub const V_PROJ_WEIGHT: &str = "v_proj.weight";
pub const OUTPUT_PROJ_WEIGHT: &str = "output_proj.weight";

const WEIGHT_NAMES: [&str; 4] = [Q_PROJ_WEIGHT, K_PROJ_WEIGHT, V_PROJ_WEIGHT, OUTPUT_PROJ_WEIGHT];

impl MultiHeadAttention {
    /// Current projection weights keyed by name.
    pub fn state_dict(&self) -> HashMap<String, Tensor> {
        WEIGHT_NAMES
            .iter()
            .zip([&self.q_proj, &self.k_proj, &self.v_proj, &self.output_proj])
            .map(|(name, proj)| (name.to_string(), proj.weight().clone()))
            .collect()
    }

    /// Copy weights from `state` into this engine, casting to the engine dtype
    /// and device. Nothing is modified unless every entry is valid.
    pub fn load_state_dict(&mut self, state: &HashMap<String, Tensor>) -> Result<()> {
        let mut unknown: Vec<&str> = state
            .keys()
            .map(String::as_str)
            .filter(|key| !WEIGHT_NAMES.contains(key))
            .collect();
        if !unknown.is_empty() {
            unknown.sort_unstable();
            return Err(AttentionError::config(format!(
                "unexpected weights in state dict: {}",
                unknown.join(", ")
            )));
        }

        let mut incoming = Vec::with_capacity(WEIGHT_NAMES.len());
        for (name, proj) in WEIGHT_NAMES
            .iter()
            .zip([&self.q_proj, &self.k_proj, &self.v_proj, &self.output_proj])
        {
            let tensor = state
                .get(*name)
                .ok_or_else(|| AttentionError::config(format!("state dict is missing {name}")))?;
            let expected = proj.config().weight_dims();
            if tensor.dims() != expected {
                return Err(AttentionError::shape(format!(
                    "{name} must be {expected:?}, got {:?}",
                    tensor.dims()
                )));
            }
            if !FLOAT_DTYPES.contains(&tensor.dtype()) {
                return Err(AttentionError::UnsupportedDType {
                    requested: format!("{name} has dtype {:?}", tensor.dtype()),
                });
            }
            incoming.push(tensor);
        }

        for (proj, tensor) in [
            &mut self.q_proj,
            &mut self.k_proj,
            &mut self.v_proj,
            &mut self.output_proj,
        ]
        .into_iter()
        .zip(incoming)
        {
            proj.copy_weight_from(tensor)?;
        }
        log::debug!("attention weights loaded from state dict");
        Ok(())
    }

    /// Write the state dict to a safetensors file.
    pub fn save_safetensors(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        candle_core::safetensors::save(&self.state_dict(), path)?;
        log::info!("attention weights saved to {}", path.display());
        Ok(())
    }

    /// Load weights previously written by [`save_safetensors`](Self::save_safetensors).
    pub fn load_safetensors(&mut self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let tensors = candle_core::safetensors::load(path, self.device())?;
        self.load_state_dict(&tensors)?;
        log::info!("attention weights loaded from {}", path.display());
        Ok(())
    }
}
