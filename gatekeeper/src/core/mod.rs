//! Pure, deterministic gatekeeper logic. No I/O.

pub mod compound;
pub mod confidence;
pub mod examples;
pub mod invariants;
pub mod patterns;
pub mod sanitize;
pub mod similarity;
pub mod tree;
pub mod types;
