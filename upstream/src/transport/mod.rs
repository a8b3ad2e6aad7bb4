//! The seam between the upstream client and the wire.
//!
//! `UpstreamClient` only ever talks to a `Transport`. The gRPC implementation is
//! used in production, tests plug in an in-memory origin instead.

use crate::error::TransportError;
use crate::message::{DiscoveryRequest, DiscoveryResponse};
use async_trait::async_trait;

pub mod grpc;

/// Factory for bidirectional discovery streams to the origin server.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Opens a new stream and sends `initial` as its first message.
    ///
    /// Every call produces an independent stream.
    async fn open_stream(
        &self,
        initial: &DiscoveryRequest,
    ) -> Result<Box<dyn TransportStream>, TransportError>;
}

/// One open discovery stream. Dropping it closes the stream.
#[async_trait]
pub trait TransportStream: Send {
    async fn send(&mut self, request: &DiscoveryRequest) -> Result<(), TransportError>;

    /// Receives the next response.
    ///
    /// Returns `Ok(None)` once the origin closed the stream cleanly.
    async fn recv(&mut self) -> Result<Option<DiscoveryResponse>, TransportError>;
}
