//! Visitor-to-variant bucketing for ExperiFlow experiments.
//!
//! Provides the deterministic HMAC-SHA256 [`Assigner`], the non-deterministic
//! [`select_random_variant`] fallback, and visitor identity derivation.

pub mod assigner;
pub mod identity;

pub use assigner::{select_random_variant, Assigner, BUCKET_COUNT};
pub use identity::VisitorIdentity;
