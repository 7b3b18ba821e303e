//! Oracle-backed agents: the classifier and the decomposer.

pub mod classifier;
pub mod decomposer;

pub use classifier::{Classification, ClassifyInput, Classifier};
pub use decomposer::{DecompositionRejected, Decomposer, Proposal, ProposalSource};
