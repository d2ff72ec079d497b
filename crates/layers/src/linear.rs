//! Bias-free linear projection helpers.
//!
//! Linear layers expect inputs shaped `(batch, seq, in_dim)` or `(rows, in_dim)`
//! and return tensors with the same leading dimensions and `out_dim` features.
//! Weights are stored `[out_dim, in_dim]`, matching the checkpoint convention
//! used by the reference attention modules. Half-precision weights are promoted
//! to f32 for the matmul and the result is cast back to the weight dtype.
//! Initialisation policies mirror common transformer recipes (Glorot, Kaiming,
//! scaled variants) so downstream crates can share a single implementation.

use candle_core::{DType, Device, Error, Result, Tensor};

use crate::checks;

/// Configuration shared by dense projection layers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinearConfig {
    /// Incoming feature dimension.
    pub input_dim: usize,
    /// Output feature dimension.
    pub output_dim: usize,
}

impl LinearConfig {
    pub fn new(input_dim: usize, output_dim: usize) -> Self {
        Self {
            input_dim,
            output_dim,
        }
    }

    /// Expected weight dimensions, `[output_dim, input_dim]`.
    pub fn weight_dims(&self) -> [usize; 2] {
        [self.output_dim, self.input_dim]
    }
}

/// Supported weight initialisation policies for transformer projections.
#[derive(Debug, Clone)]
pub enum LinearInit {
    /// Xavier/Glorot uniform initialisation.
    XavierUniform,
    /// Xavier/Glorot normal initialisation.
    XavierNormal,
    /// Kaiming/He uniform initialisation.
    KaimingUniform { negative_slope: f64 },
    /// Kaiming/He normal initialisation.
    KaimingNormal { negative_slope: f64 },
    /// Scales another policy to support deep network stabilisation.
    Scaled { base: Box<LinearInit>, scale: f64 },
}

impl LinearInit {
    /// Convenience helper to scale an existing policy.
    pub fn scaled(base: LinearInit, scale: f64) -> Self {
        Self::Scaled {
            base: Box::new(base),
            scale,
        }
    }

    /// Kaiming uniform with slope `sqrt(5)`, i.e. `U(-1/sqrt(fan_in), 1/sqrt(fan_in))`.
    pub fn fan_in_uniform() -> Self {
        Self::KaimingUniform {
            negative_slope: 5f64.sqrt(),
        }
    }

    fn sample(&self, shape: (usize, usize), device: &Device, dtype: DType) -> Result<Tensor> {
        let (out_dim, in_dim) = shape;
        let (fan_in, fan_out) = (in_dim as f64, out_dim as f64);
        let weight_f32 = match self {
            LinearInit::XavierUniform => {
                let bound = (6.0f64 / (fan_in + fan_out)).sqrt();
                Tensor::rand(-bound as f32, bound as f32, shape, device)?
            }
            LinearInit::XavierNormal => {
                let std = (2.0f64 / (fan_in + fan_out)).sqrt();
                Tensor::randn(0f32, std as f32, shape, device)?
            }
            LinearInit::KaimingUniform { negative_slope } => {
                let gain = (2.0f64 / (1.0 + negative_slope.powi(2))).sqrt();
                let bound = (3.0f64).sqrt() * gain / fan_in.sqrt();
                Tensor::rand(-bound as f32, bound as f32, shape, device)?
            }
            LinearInit::KaimingNormal { negative_slope } => {
                let gain = (2.0f64 / (1.0 + negative_slope.powi(2))).sqrt();
                let std = gain / fan_in.sqrt();
                Tensor::randn(0f32, std as f32, shape, device)?
            }
            LinearInit::Scaled { base, scale } => {
                let sampled = base.sample(shape, device, DType::F32)?;
                sampled.affine(*scale, 0.0)?
            }
        };
        weight_f32.to_dtype(dtype)
    }
}

/// Dense projection without a bias term.
#[derive(Debug, Clone)]
pub struct Linear {
    config: LinearConfig,
    weight: Tensor,
}

impl Linear {
    /// Constructs a linear layer from a pre-existing `[out, in]` weight.
    pub fn new(config: LinearConfig, weight: Tensor) -> Result<Self> {
        Self::validate_weight(&config, &weight)?;
        Ok(Self { config, weight })
    }

    /// Constructs a linear layer whose configuration is read off the weight.
    pub fn from_weight(weight: Tensor) -> Result<Self> {
        checks::expect_rank("linear.weight", &weight, 2)?;
        let (output_dim, input_dim) = weight.dims2()?;
        Self::new(LinearConfig::new(input_dim, output_dim), weight)
    }

    /// Builds a linear layer with randomly initialised weights following `init`.
    pub fn with_init(
        config: LinearConfig,
        init: &LinearInit,
        device: &Device,
        dtype: DType,
    ) -> Result<Self> {
        let weight = init.sample((config.output_dim, config.input_dim), device, dtype)?;
        Self::new(config, weight)
    }

    pub fn config(&self) -> &LinearConfig {
        &self.config
    }

    pub fn weight(&self) -> &Tensor {
        &self.weight
    }

    pub fn dtype(&self) -> DType {
        self.weight.dtype()
    }

    pub fn device(&self) -> &Device {
        self.weight.device()
    }

    /// Replaces the weight with a copy of `value`, cast to the current dtype
    /// and device.
    pub fn copy_weight_from(&mut self, value: &Tensor) -> Result<()> {
        checks::expect_shape("linear.weight", value, &self.config.weight_dims())?;
        checks::expect_dtype_in("linear.weight", value, &checks::FLOAT_DTYPES)?;
        let copied = value
            .to_device(self.weight.device())?
            .to_dtype(self.weight.dtype())?
            .contiguous()?
            .copy()?;
        self.weight = copied;
        Ok(())
    }

    fn validate_weight(config: &LinearConfig, weight: &Tensor) -> Result<()> {
        if config.input_dim == 0 || config.output_dim == 0 {
            return Err(Error::Msg(format!(
                "linear dimensions must be non-zero, got {config:?}"
            )));
        }
        checks::expect_rank("linear.weight", weight, 2)?;
        checks::expect_shape("linear.weight", weight, &config.weight_dims())?;
        checks::expect_dtype_in("linear.weight", weight, &checks::FLOAT_DTYPES)?;
        Ok(())
    }

    /// Dtype the matmul runs in. Half-precision storage is promoted to f32.
    pub fn compute_dtype(&self) -> DType {
        match self.weight.dtype() {
            DType::F16 | DType::BF16 => DType::F32,
            other => other,
        }
    }

    /// Applies `hidden @ weight^T`, returning the weight dtype.
    pub fn forward(&self, hidden: &Tensor) -> Result<Tensor> {
        checks::expect_same_dtype("linear.input", hidden, "linear.weight", &self.weight)?;
        let compute = self.compute_dtype();
        let input = hidden.to_dtype(compute)?.contiguous()?;
        let weight_t = self.weight.to_dtype(compute)?.t()?;
        let output = match input.dims() {
            [batch, seq, hidden_dim] if *hidden_dim == self.config.input_dim => {
                let (batch, seq) = (*batch, *seq);
                input
                    .reshape((batch * seq, self.config.input_dim))?
                    .matmul(&weight_t)?
                    .reshape((batch, seq, self.config.output_dim))?
            }
            [_, hidden_dim] if *hidden_dim == self.config.input_dim => input.matmul(&weight_t)?,
            dims => {
                return Err(Error::Msg(format!(
                    "linear expects input shaped [B, T, {in_dim}] or [T, {in_dim}], got {dims:?}",
                    in_dim = self.config.input_dim
                )))
            }
        };
        output.to_dtype(self.weight.dtype())
    }
}
