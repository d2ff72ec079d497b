//! Interfaces and helpers for key/value cache management.
//!
//! The engine uses these utilities to persist projected keys and values across
//! decoding steps.

pub mod api;
pub mod layout;
pub mod static_cache;

pub use api::{CacheStats, KeyValueCache};
pub use layout::CacheLayout;
pub use static_cache::StaticKvCache;

#[cfg(test)]
mod tests;
