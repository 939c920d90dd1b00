//! Per-operation mutation semantics and batch application.

use markup5ever_rcdom::Handle;
use tracing::{debug, warn};

use experiflow_types::{Operation, OperationKind};

use crate::document::{
    append_child, clear_children, detach, get_attr, is_element, new_text, parse_fragment_nodes,
    set_attr, Document,
};
use crate::selector::{find_nodes, Selector};
use crate::style::InlineStyle;

/// Why a single operation was skipped. Never aborts the batch.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OperationError {
    #[error("selector '{selector}' matched no nodes")]
    NoMatch { selector: String },

    #[error("unknown operation type '{0}'")]
    UnknownType(String),

    #[error("{kind} requires a property")]
    MissingProperty { kind: OperationKind },
}

/// Outcome of applying a batch of operations to one document.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BatchReport {
    /// Operations that matched at least one node.
    pub applied: usize,
    /// Skipped operations, by index into the batch.
    pub failures: Vec<(usize, OperationError)>,
}

impl BatchReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Single-node mutations
// ---------------------------------------------------------------------------

/// Replace all children with a single text node.
pub fn set_text(node: &Handle, value: &str) {
    clear_children(node);
    append_child(node, new_text(value));
}

/// Upsert (or delete, for an empty value) one property of the inline style.
pub fn set_style(node: &Handle, property: &str, value: &str) {
    if !is_element(node) {
        return;
    }
    let mut style = InlineStyle::parse(&get_attr(node, "style").unwrap_or_default());
    style.set(property, value);
    set_attr(node, "style", &style.to_string());
}

/// Replace all children with `html` parsed as a fragment inside a `<div>`.
pub fn set_html(node: &Handle, html: &str) {
    clear_children(node);
    for child in parse_fragment_nodes(html) {
        append_child(node, child);
    }
}

pub fn hide(node: &Handle) {
    set_style(node, "display", "none");
}

pub fn show(node: &Handle) {
    set_style(node, "display", "");
}

// ---------------------------------------------------------------------------
// Operations
// ---------------------------------------------------------------------------

fn required_property(op: &Operation) -> Result<&str, OperationError> {
    op.property
        .as_deref()
        .filter(|p| !p.is_empty())
        .ok_or_else(|| OperationError::MissingProperty {
            kind: op.kind.clone(),
        })
}

/// Apply `op` to every node under `root` its selector matches. Returns the
/// number of nodes touched.
pub fn apply_operation(root: &Handle, op: &Operation) -> Result<usize, OperationError> {
    if let OperationKind::Unknown(name) = &op.kind {
        return Err(OperationError::UnknownType(name.clone()));
    }
    let property = match op.kind {
        OperationKind::SetStyle | OperationKind::SetAttr => Some(required_property(op)?),
        _ => None,
    };

    let selector = Selector::parse(&op.selector);
    let nodes = find_nodes(root, &selector);
    if nodes.is_empty() {
        return Err(OperationError::NoMatch {
            selector: op.selector.clone(),
        });
    }

    for node in &nodes {
        match (&op.kind, property) {
            (OperationKind::SetText, _) => set_text(node, &op.value),
            (OperationKind::SetStyle, Some(p)) => set_style(node, p, &op.value),
            (OperationKind::SetAttr, Some(p)) => {
                set_attr(node, p, &op.value);
            }
            (OperationKind::SetHtml, _) => set_html(node, &op.value),
            (OperationKind::Remove, _) => {
                detach(node);
            }
            (OperationKind::Hide, _) => hide(node),
            (OperationKind::Show, _) => show(node),
            _ => {}
        }
    }
    Ok(nodes.len())
}

/// Apply `operations` in the order given. Individual failures are logged and
/// recorded; the batch always runs to completion.
pub fn apply_operations(document: &Document, operations: &[Operation]) -> BatchReport {
    let mut report = BatchReport::default();
    for (index, op) in operations.iter().enumerate() {
        match apply_operation(document.root(), op) {
            Ok(count) => {
                debug!(index, kind = %op.kind, selector = %op.selector, nodes = count, "Applied operation");
                report.applied += 1;
            }
            Err(e) => {
                warn!(index, kind = %op.kind, selector = %op.selector, error = %e, "Skipped operation");
                report.failures.push((index, e));
            }
        }
    }
    report
}
