//! KV-cache-aware multi-head attention.
//!
//! [`MultiHeadAttention`] projects a `[batch, seq_len, embed_dim]` query,
//! applies rotary position embeddings at caller-supplied absolute positions,
//! and attends over keys/values that are either projected from a fresh input
//! or read back from a static cache ([`KvSource`]). Grouped-query attention is
//! supported by sharing each key/value head across several query heads.
//!
//! Scores are computed in `f32` by [`ExactAttention`]; results keep the dtype
//! of the projections (bf16, f16, or f32). Masks are boolean `u8` tensors
//! where `1` marks an allowed query/key pair. The engine never synthesizes a
//! causal mask; see [`masks`] for builders.

pub mod core;
pub mod engine;
pub mod kv_cache;
pub mod masks;
pub mod reference;

pub use core::{Attention, AttentionConfig, AttentionError, Result};
pub use engine::{KvSource, MultiHeadAttention};
pub use kv_cache::{CacheLayout, CacheStats, KeyValueCache, StaticKvCache};
pub use reference::ExactAttention;
