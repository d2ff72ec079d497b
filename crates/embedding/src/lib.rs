//! Embedding crate
//!
//! The positional module exposes rotary positional embeddings: the scaled
//! frequency schedule, precomputed sine/cosine tables, and the pure rotation
//! applied to query and key heads.

pub mod positional;

pub use positional::*;
