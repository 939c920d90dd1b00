//! Selector-driven mutation of parsed HTML documents.

pub mod document;
pub mod mutate;
pub mod selector;
pub mod style;

pub use document::Document;
pub use mutate::{apply_operation, apply_operations, BatchReport, OperationError};
pub use selector::{find_nodes, Selector};
pub use style::{Declaration, InlineStyle};

use experiflow_types::{Operation, Result};

/// Result of a complete parse → mutate → render pass.
#[derive(Debug, Clone)]
pub struct TransformOutput {
    pub html: String,
    pub report: BatchReport,
}

/// Parse `body`, apply `operations` in order, and render the result.
///
/// Only parse and render failures are errors; per-operation failures are
/// recorded in the report.
pub fn transform_html(body: &[u8], operations: &[Operation]) -> Result<TransformOutput> {
    let document = Document::parse_bytes(body)?;
    let report = apply_operations(&document, operations);
    let html = document.render()?;
    Ok(TransformOutput { html, report })
}
