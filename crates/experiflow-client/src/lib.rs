//! Boundary to the remote experiment service.

pub mod api;
pub mod source;

pub use api::ApiClient;
pub use source::ExperimentSource;
