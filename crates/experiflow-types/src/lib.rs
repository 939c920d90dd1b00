//! Shared types and errors for the ExperiFlow edge proxy.
//!
//! This crate provides the foundational types used across all other ExperiFlow crates:
//! - `ExperiflowError`: unified error taxonomy
//! - `Operation` / `TransformSpec`: the document edits for one variant
//! - `Variant`: one treatment arm and its traffic share
//! - `TransformStatus`: the externally reported outcome of an attempt

use serde::{Deserialize, Serialize};

/// Unified error type for all ExperiFlow subsystems.
#[derive(Debug, thiserror::Error)]
pub enum ExperiflowError {
    // === Experiment Service Errors ===
    #[error("Experiment API {endpoint} returned HTTP {status}: {message}")]
    Api {
        endpoint: String,
        status: u16,
        message: String,
    },

    #[error("Failed to decode response from {endpoint}: {message}")]
    Decode { endpoint: String, message: String },

    #[error("No variants found for experiment '{experiment}'")]
    NoVariants { experiment: String },

    // === Deadline ===
    #[error("Deadline of {timeout_ms}ms exceeded while {stage}")]
    DeadlineExceeded { stage: String, timeout_ms: u64 },

    // === Document Errors ===
    #[error("HTML parse error: {0}")]
    Parse(String),

    #[error("HTML render error: {0}")]
    Render(String),

    #[error("Response body cannot be rewritten: {0}")]
    UntransformableBody(String),

    // === Configuration ===
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // === Generic ===
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

impl ExperiflowError {
    /// Returns `true` if the error came from the shared per-experiment deadline.
    pub fn is_timeout(&self) -> bool {
        matches!(self, ExperiflowError::DeadlineExceeded { .. })
    }

    /// The `X-EF-Transform` value an attempt that failed with this error reports.
    pub fn transform_status(&self) -> TransformStatus {
        if self.is_timeout() {
            TransformStatus::Timeout
        } else {
            TransformStatus::Miss
        }
    }
}

/// A convenience alias for `Result<T, ExperiflowError>`.
pub type Result<T> = std::result::Result<T, ExperiflowError>;

// ---------------------------------------------------------------------------
// OperationKind
// ---------------------------------------------------------------------------

/// The `type` of an [`Operation`].
///
/// Unrecognised names decode into [`OperationKind::Unknown`] so that one bad
/// entry never rejects the whole spec.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum OperationKind {
    SetText,
    SetStyle,
    SetAttr,
    SetHtml,
    Remove,
    Hide,
    Show,
    Unknown(String),
}

impl OperationKind {
    /// Wire name of the operation type.
    pub fn as_str(&self) -> &str {
        match self {
            OperationKind::SetText => "setText",
            OperationKind::SetStyle => "setStyle",
            OperationKind::SetAttr => "setAttr",
            OperationKind::SetHtml => "setHTML",
            OperationKind::Remove => "remove",
            OperationKind::Hide => "hide",
            OperationKind::Show => "show",
            OperationKind::Unknown(name) => name,
        }
    }
}

impl From<String> for OperationKind {
    fn from(name: String) -> Self {
        match name.as_str() {
            "setText" => OperationKind::SetText,
            "setStyle" => OperationKind::SetStyle,
            "setAttr" => OperationKind::SetAttr,
            "setHTML" => OperationKind::SetHtml,
            "remove" => OperationKind::Remove,
            "hide" => OperationKind::Hide,
            "show" => OperationKind::Show,
            _ => OperationKind::Unknown(name),
        }
    }
}

impl From<OperationKind> for String {
    fn from(kind: OperationKind) -> Self {
        kind.as_str().to_string()
    }
}

impl Default for OperationKind {
    fn default() -> Self {
        OperationKind::Unknown(String::new())
    }
}

impl std::fmt::Display for OperationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Operation / TransformSpec
// ---------------------------------------------------------------------------

/// A single document edit.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Operation {
    #[serde(rename = "type")]
    pub kind: OperationKind,
    pub selector: String,
    pub value: String,
    /// CSS property for `setStyle`, attribute key for `setAttr`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub property: Option<String>,
    /// Advisory only. Operations are applied in the order supplied.
    pub priority: i32,
}

impl Operation {
    pub fn new(kind: OperationKind, selector: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            kind,
            selector: selector.into(),
            value: value.into(),
            property: None,
            priority: 0,
        }
    }

    pub fn with_property(mut self, property: impl Into<String>) -> Self {
        self.property = Some(property.into());
        self
    }
}

/// The ordered set of edits associated with one (experiment, variant) pair.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransformSpec {
    pub version: String,
    pub experiment_id: String,
    pub variant_id: String,
    pub variant_key: String,
    pub operations: Vec<Operation>,
    pub ttl: i64,
    pub cache_key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub experiment_version: Option<String>,
}

impl TransformSpec {
    /// A transform spec with no operations is the control path.
    pub fn is_control(&self) -> bool {
        self.operations.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Variant / assignment shapes
// ---------------------------------------------------------------------------

/// One treatment arm of an experiment.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Variant {
    pub id: String,
    pub name: String,
    pub is_control: bool,
    /// Share of traffic in `[0, 1]`.
    pub traffic_allocation: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssignmentRequest {
    pub experiment_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssignmentResponse {
    pub variant_id: String,
    pub variant_key: String,
}

// ---------------------------------------------------------------------------
// TransformStatus
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransformStatus {
    /// Operations were applied and the body was replaced.
    Hit,
    /// The spec carried no operations; the body is untouched.
    Control,
    /// The attempt failed for a reason other than the deadline.
    Miss,
    /// The shared deadline expired.
    Timeout,
}

impl TransformStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransformStatus::Hit => "hit",
            TransformStatus::Control => "control",
            TransformStatus::Miss => "miss",
            TransformStatus::Timeout => "timeout",
        }
    }
}

impl std::fmt::Display for TransformStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
