//! Experiment orchestration for HTML responses passing through the proxy.

pub mod headers;
pub mod orchestrator;
pub mod visitor;

pub use orchestrator::{AttemptReport, Orchestrator, OrchestratorConfig, ProxiedResponse};
pub use visitor::VisitorContext;
