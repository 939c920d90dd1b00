//! Per-response experiment orchestration.
//!
//! For each configured experiment, in order: resolve the visitor's variant,
//! fetch its transform spec, and rewrite the HTML body. Every stage shares one
//! deadline. Any failure leaves the body as it was and is reported only through
//! the `X-EF-Transform` header. Compressed, non-UTF-8 and empty bodies are
//! never rewritten.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::header::CONTENT_LENGTH;
use http::{HeaderMap, HeaderValue};
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info, warn};

use experiflow_assign::{select_random_variant, Assigner};
use experiflow_client::ExperimentSource;
use experiflow_dom::transform_html;
use experiflow_types::{ExperiflowError, Result, TransformStatus};

use crate::headers::{
    append_assignment_cookie, assignment_cookie_name, is_html, untransformable_reason,
    write_observability_headers,
};
use crate::visitor::VisitorContext;

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// Static experiment configuration, shared read-only by every request.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Experiments to attempt, in application order.
    pub experiment_ids: Vec<String>,
    /// Budget for one experiment attempt, across all of its stages.
    pub transform_timeout: Duration,
    /// Cookie holding a stable visitor id, if the site sets one.
    pub user_id_cookie: Option<String>,
    /// Log attempt outcomes at `info`/`warn` rather than `debug`.
    pub enable_logging: bool,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            experiment_ids: Vec::new(),
            transform_timeout: Duration::from_millis(50),
            user_id_cookie: None,
            enable_logging: true,
        }
    }
}

/// The parts of an origin response the orchestrator may rewrite.
#[derive(Debug, Clone, Default)]
pub struct ProxiedResponse {
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// Outcome of one (request, experiment) attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct AttemptReport {
    pub experiment_id: String,
    /// Empty if the attempt failed before a variant was resolved.
    pub variant_id: String,
    /// Value reported in `X-EF-Variant`.
    pub variant_key: String,
    pub status: TransformStatus,
    /// A fresh assignment cookie was emitted.
    pub new_assignment: bool,
    /// Operations that matched at least one node (hit path only).
    pub operations_applied: usize,
    pub error: Option<String>,
}

impl AttemptReport {
    pub fn new(experiment_id: impl Into<String>) -> Self {
        Self {
            experiment_id: experiment_id.into(),
            variant_id: String::new(),
            variant_key: String::new(),
            status: TransformStatus::Miss,
            new_assignment: false,
            operations_applied: 0,
            error: None,
        }
    }
}

/// The orchestrator. Holds no per-request state.
pub struct Orchestrator {
    config: OrchestratorConfig,
    assigner: Assigner,
    source: Arc<dyn ExperimentSource>,
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

impl Orchestrator {
    pub fn new(config: OrchestratorConfig, assigner: Assigner, source: Arc<dyn ExperimentSource>) -> Self {
        Self {
            config,
            assigner,
            source,
        }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Attempt every configured experiment against `response`.
    ///
    /// Non-HTML responses are left alone and produce no reports. Never fails:
    /// the body is either fully transformed or byte-identical to the input.
    pub async fn modify_response(
        &self,
        visitor: &VisitorContext,
        response: &mut ProxiedResponse,
    ) -> Vec<AttemptReport> {
        if self.config.experiment_ids.is_empty() || !is_html(&response.headers) {
            return Vec::new();
        }

        let started = Instant::now();
        let mut reports = Vec::with_capacity(self.config.experiment_ids.len());
        for experiment_id in &self.config.experiment_ids {
            let report = self.attempt(experiment_id, visitor, response).await;
            write_observability_headers(&mut response.headers, &report, started.elapsed());
            self.log_attempt(&report, started.elapsed());
            reports.push(report);
        }
        reports
    }

    async fn attempt(
        &self,
        experiment_id: &str,
        visitor: &VisitorContext,
        response: &mut ProxiedResponse,
    ) -> AttemptReport {
        let deadline = Instant::now() + self.config.transform_timeout;
        let mut report = AttemptReport::new(experiment_id);

        match self.run_attempt(experiment_id, visitor, response, deadline, &mut report).await {
            Ok(status) => report.status = status,
            Err(e) => {
                report.status = e.transform_status();
                report.error = Some(e.to_string());
            }
        }
        report
    }

    async fn run_attempt(
        &self,
        experiment_id: &str,
        visitor: &VisitorContext,
        response: &mut ProxiedResponse,
        deadline: Instant,
        report: &mut AttemptReport,
    ) -> Result<TransformStatus> {
        // Nothing is fetched or assigned for a body that cannot be rewritten.
        if let Some(reason) = untransformable_reason(&response.headers, &response.body) {
            return Err(ExperiflowError::UntransformableBody(reason));
        }

        // resolving_variant
        let cookie_name = assignment_cookie_name(experiment_id);
        match visitor.cookie(&cookie_name).filter(|v| !v.is_empty()) {
            Some(variant_id) => {
                report.variant_id = variant_id.to_string();
            }
            None => {
                let variants = self
                    .within(deadline, "fetching variants", self.source.variants(experiment_id))
                    .await?;

                let identity = self.assigner.derive_user_id(
                    self.config
                        .user_id_cookie
                        .as_deref()
                        .and_then(|name| visitor.cookie(name)),
                    visitor.client_ip.as_deref(),
                    visitor.user_agent.as_deref(),
                );
                // An anonymous token never repeats, so hashing it buys nothing.
                let chosen = if identity.is_ephemeral() {
                    select_random_variant(&variants)
                } else {
                    self.assigner
                        .assign_variant(identity.as_str(), experiment_id, &variants)
                };
                let chosen = chosen.ok_or_else(|| ExperiflowError::NoVariants {
                    experiment: experiment_id.to_string(),
                })?;

                debug!(
                    experiment = experiment_id,
                    variant = %chosen.name,
                    control = chosen.is_control,
                    identity = identity.tier(),
                    "Assigned visitor to variant"
                );
                report.variant_id = chosen.id.clone();
                report.variant_key = chosen.name.clone();
                report.new_assignment = true;

                if !append_assignment_cookie(&mut response.headers, experiment_id, &chosen.id) {
                    warn!(experiment = experiment_id, variant = %chosen.id, "Variant id cannot be stored in a cookie");
                }
            }
        }

        // fetching_spec
        let spec = self
            .within(
                deadline,
                "fetching transform spec",
                self.source.transform_spec(experiment_id, &report.variant_id),
            )
            .await?;
        if report.variant_key.is_empty() {
            report.variant_key = spec.variant_key.clone();
        }
        if spec.is_control() {
            return Ok(TransformStatus::Control);
        }

        // transforming
        let body = response.body.clone();
        let operations = spec.operations;
        let task = tokio::task::spawn_blocking(move || transform_html(&body, &operations));
        let output = match timeout_at(deadline, task).await {
            Err(_) => return Err(self.deadline_error("transforming document")),
            Ok(Err(join)) => return Err(ExperiflowError::Other(format!("transform task failed: {join}"))),
            Ok(Ok(result)) => result?,
        };

        report.operations_applied = output.report.applied;
        let html = Bytes::from(output.html);
        response
            .headers
            .insert(CONTENT_LENGTH, HeaderValue::from(html.len()));
        response.body = html;
        Ok(TransformStatus::Hit)
    }

    /// Run `fut` against the attempt deadline.
    async fn within<T>(
        &self,
        deadline: Instant,
        stage: &str,
        fut: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        timeout_at(deadline, fut)
            .await
            .map_err(|_| self.deadline_error(stage))?
    }

    fn deadline_error(&self, stage: &str) -> ExperiflowError {
        ExperiflowError::DeadlineExceeded {
            stage: stage.to_string(),
            timeout_ms: self.config.transform_timeout.as_millis() as u64,
        }
    }

    fn log_attempt(&self, report: &AttemptReport, elapsed: Duration) {
        let elapsed_ms = elapsed.as_millis() as u64;
        if !self.config.enable_logging {
            debug!(
                experiment = %report.experiment_id,
                variant = %report.variant_key,
                status = %report.status,
                elapsed_ms,
                "Experiment attempt finished"
            );
            return;
        }
        match (&report.status, &report.error) {
            (TransformStatus::Hit, _) => info!(
                experiment = %report.experiment_id,
                variant = %report.variant_key,
                operations = report.operations_applied,
                elapsed_ms,
                "Applied transform"
            ),
            (TransformStatus::Control, _) => info!(
                experiment = %report.experiment_id,
                variant = %report.variant_key,
                elapsed_ms,
                "Control variant, body untouched"
            ),
            (status, error) => warn!(
                experiment = %report.experiment_id,
                status = %status,
                error = error.as_deref().unwrap_or(""),
                elapsed_ms,
                "Experiment attempt failed open"
            ),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
