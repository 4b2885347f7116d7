pub mod ranktable;
pub mod reconciler;

pub use reconciler::ArtifactReconciler;
pub use reconciler::ArtifactTarget;
pub use reconciler::ReconcileError;
pub use reconciler::RetryPolicy;
pub use reconciler::UpsertOutcome;
