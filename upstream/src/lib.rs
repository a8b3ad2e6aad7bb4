//! Client side of the relay: opens discovery streams to the origin management
//! server and hands their responses to the caller.
//!
//! Each call to [`UpstreamClient::open_stream`] produces an independent stream.
//! Sharing streams between identical requests is the job of the caller.

mod client;
pub mod config;
mod error;
pub mod message;
pub mod metrics_defs;
pub mod transport;

#[cfg(any(test, feature = "testutils"))]
pub mod testutils;

pub use client::{ResponseReceiver, StreamShutdown, StreamState, UpstreamClient};
pub use config::{CallOptions, UpstreamConfig};
pub use error::{TransportError, UpstreamError};
pub use message::{DiscoveryRequest, DiscoveryResponse, Node, validate_request};
