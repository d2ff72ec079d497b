//! Building blocks for transformer layers.
//!
//! Hosts the bias-free dense projections used by attention and the shared
//! tensor validation helpers.

pub mod checks;
pub mod linear;

pub use linear::{Linear, LinearConfig, LinearInit};
