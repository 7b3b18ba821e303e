//! Optional external memory collaborator.

/// Supplies free-text evidence about what the user usually means.
///
/// Consulted by the intent layer only when alignment confidence is low.
pub trait MemoryProvider: Send + Sync {
    fn alignment_evidence(&self, request: &str) -> Option<String>;
}
