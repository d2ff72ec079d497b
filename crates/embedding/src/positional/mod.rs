//! Positional encodings.

pub mod rope;

pub use rope::{apply_rotary, inverse_frequencies, RopeConfig, RopeScaling, RotaryEmbedding};
