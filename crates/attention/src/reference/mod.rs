//! Portable, exact scaled dot-product attention.
//!
//! This path favours clarity over absolute performance and is the kernel the
//! engine runs after projection, rotation and head expansion.

pub mod exact;

pub use exact::ExactAttention;
