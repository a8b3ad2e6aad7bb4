use crate::rules::NodeField;
use upstream::UpstreamError;

/// Failure to derive an aggregation key from a request.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum KeyError {
    #[error("no aggregation rule matched request for {type_url:?}")]
    NoMatch { type_url: String },

    #[error("node field {0} is empty or missing")]
    EmptyNodeField(NodeField),

    #[error("resource name index {index} out of range ({len} names requested)")]
    ResourceIndexOutOfRange { index: i64, len: usize },
}

#[derive(thiserror::Error, Debug)]
pub enum OrchestratorError {
    #[error("could not compute aggregation key: {0}")]
    KeyMatch(#[from] KeyError),

    #[error("invalid request: {0}")]
    InvalidRequest(#[from] UpstreamError),
}
