use async_trait::async_trait;

use experiflow_types::{Result, TransformSpec, Variant};

// ---------------------------------------------------------------------------
// ExperimentSource
// ---------------------------------------------------------------------------

/// Where the orchestrator gets variant lists and transform specs from.
///
/// Implementations hold no per-request state and are shared across requests.
#[async_trait]
pub trait ExperimentSource: Send + Sync {
    /// Live variant list for `experiment_id`, in the order the service serves it.
    async fn variants(&self, experiment_id: &str) -> Result<Vec<Variant>>;

    /// The transform spec for one variant of `experiment_id`.
    async fn transform_spec(&self, experiment_id: &str, variant_id: &str) -> Result<TransformSpec>;
}

#[async_trait]
impl<T: ExperimentSource + ?Sized> ExperimentSource for std::sync::Arc<T> {
    async fn variants(&self, experiment_id: &str) -> Result<Vec<Variant>> {
        (**self).variants(experiment_id).await
    }

    async fn transform_spec(&self, experiment_id: &str, variant_id: &str) -> Result<TransformSpec> {
        (**self).transform_spec(experiment_id, variant_id).await
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
