//! Error types emitted by the attention engine.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, AttentionError>;

/// Attention-specific error category.
#[derive(Debug, Error)]
pub enum AttentionError {
    /// Invalid static configuration detected at construction time.
    #[error("invalid attention config: {context}")]
    Config { context: String },
    /// The supplied tensor shapes do not align with the documented contract.
    #[error("invalid tensor shape: {context}")]
    Shape { context: String },
    /// Cache misuse: double setup, reads without a cache, out-of-range positions.
    #[error("invalid cache state: {context}")]
    State { context: String },
    /// The kernel does not support the requested data type.
    #[error("unsupported dtype {requested}")]
    UnsupportedDType { requested: String },
    #[error("unsupported configuration format: {0}")]
    ConfigFormat(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json config error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("toml config error: {0}")]
    Toml(#[from] toml::de::Error),
    /// A backend-specific failure propagated to the caller.
    #[error(transparent)]
    Backend(#[from] candle_core::Error),
}

impl AttentionError {
    pub fn config(context: impl Into<String>) -> Self {
        Self::Config {
            context: context.into(),
        }
    }

    pub fn shape(context: impl Into<String>) -> Self {
        Self::Shape {
            context: context.into(),
        }
    }

    pub fn state(context: impl Into<String>) -> Self {
        Self::State {
            context: context.into(),
        }
    }
}
