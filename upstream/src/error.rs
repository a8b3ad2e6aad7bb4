use std::time::Duration;

#[derive(thiserror::Error, Debug)]
pub enum UpstreamError {
    #[error("could not connect to upstream {address}: {source}")]
    Dial {
        address: String,
        #[source]
        source: TransportError,
    },

    #[error("unsupported type url: {0:?}")]
    UnsupportedTypeUrl(String),

    #[error("request has no node identity")]
    MissingNode,
}

/// Failures of the underlying stream. These never reach callers of
/// `UpstreamClient::open_stream` as values: they close the response channel.
#[derive(thiserror::Error, Debug)]
pub enum TransportError {
    #[error("invalid upstream address: {0}")]
    InvalidAddress(String),

    #[error("connection error: {0}")]
    Connection(String),

    #[error("stream error: {0}")]
    Stream(#[from] tonic::Status),

    #[error("could not decode response: {0}")]
    Decode(#[from] prost::DecodeError),

    #[error("stream closed")]
    StreamClosed,

    #[error("timed out after {0:?}")]
    Timeout(Duration),
}
