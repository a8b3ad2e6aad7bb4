use crate::config::CallOptions;
use crate::error::{TransportError, UpstreamError};
use crate::message::{DiscoveryRequest, DiscoveryResponse, validate_request};
use crate::metrics_defs::{
    ACK_FAILURES, RESPONSES_RECEIVED, STREAMS_CLOSED, STREAMS_FAILED, STREAMS_OPENED,
};
use crate::transport::grpc::GrpcTransport;
use crate::transport::{Transport, TransportStream};
use shared::counter;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const RESPONSE_CHANNEL_BUFFER_SIZE: usize = 16;

/// Receives the responses of one upstream stream, in arrival order.
/// `recv` returns `None` once the stream is torn down.
pub type ResponseReceiver = mpsc::Receiver<DiscoveryResponse>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum StreamState {
    Connecting = 0,
    Streaming = 1,
    Closed = 2,
}

/// The state only ever moves forward, so `Closed` is absorbing no matter how
/// many teardown triggers race.
#[derive(Debug)]
struct StateCell(AtomicU8);

impl StateCell {
    fn new() -> Self {
        StateCell(AtomicU8::new(StreamState::Connecting as u8))
    }

    fn advance(&self, to: StreamState) {
        self.0.fetch_max(to as u8, Ordering::AcqRel);
    }

    fn get(&self) -> StreamState {
        match self.0.load(Ordering::Acquire) {
            0 => StreamState::Connecting,
            1 => StreamState::Streaming,
            _ => StreamState::Closed,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum CloseReason {
    Shutdown,
    ReceiverDropped,
    UpstreamClosed,
    StreamError,
    AckTimeout,
}

impl CloseReason {
    fn as_str(&self) -> &'static str {
        match self {
            CloseReason::Shutdown => "shutdown",
            CloseReason::ReceiverDropped => "receiver_dropped",
            CloseReason::UpstreamClosed => "upstream_closed",
            CloseReason::StreamError => "stream_error",
            CloseReason::AckTimeout => "ack_timeout",
        }
    }
}

/// Handle that tears down one stream opened by [`UpstreamClient::open_stream`].
///
/// `shutdown` is idempotent and may race with the client's governing token and
/// with the origin closing the stream; only the first trigger has any effect.
#[derive(Clone, Debug)]
pub struct StreamShutdown {
    token: CancellationToken,
    state: Arc<StateCell>,
}

impl StreamShutdown {
    pub fn shutdown(&self) {
        self.token.cancel();
    }

    pub fn state(&self) -> StreamState {
        self.state.get()
    }

    pub fn is_closed(&self) -> bool {
        self.state() == StreamState::Closed
    }
}

struct ClientInner {
    transport: Arc<dyn Transport>,
    options: CallOptions,
    token: CancellationToken,
    next_stream_id: AtomicU64,
}

/// Client for the origin management server.
///
/// Every stream opened through the client lives under the governing token passed
/// at construction. Cancelling that token closes all of them, including streams
/// still being established.
#[derive(Clone)]
pub struct UpstreamClient {
    inner: Arc<ClientInner>,
}

impl UpstreamClient {
    /// Connects to the origin server over gRPC.
    pub async fn connect(
        address: &str,
        options: CallOptions,
        token: CancellationToken,
    ) -> Result<Self, UpstreamError> {
        let transport = GrpcTransport::connect(address, options.timeout)
            .await
            .map_err(|source| UpstreamError::Dial {
                address: address.to_string(),
                source,
            })?;

        tracing::info!(address, "connected to upstream");

        Ok(Self::with_transport(Arc::new(transport), options, token))
    }

    pub fn with_transport(
        transport: Arc<dyn Transport>,
        options: CallOptions,
        token: CancellationToken,
    ) -> Self {
        UpstreamClient {
            inner: Arc::new(ClientInner {
                transport,
                options,
                token,
                next_stream_id: AtomicU64::new(0),
            }),
        }
    }

    /// True once the governing token has been cancelled.
    pub fn is_shut_down(&self) -> bool {
        self.inner.token.is_cancelled()
    }

    /// Opens a new, independent upstream stream and sends `request` on it.
    ///
    /// Only request validation fails with an error. If the stream cannot be
    /// established within the call timeout, or the client is shutting down, the
    /// returned receiver is already closed.
    pub async fn open_stream(
        &self,
        request: DiscoveryRequest,
    ) -> Result<(ResponseReceiver, StreamShutdown), UpstreamError> {
        validate_request(&request)?;

        let stream_id = self.inner.next_stream_id.fetch_add(1, Ordering::Relaxed);
        let token = self.inner.token.child_token();
        let state = Arc::new(StateCell::new());
        let shutdown = StreamShutdown {
            token: token.clone(),
            state: state.clone(),
        };
        let (tx, rx) = mpsc::channel(RESPONSE_CHANNEL_BUFFER_SIZE);

        let request = request.initial();
        let timeout = self.inner.options.timeout;

        let established = tokio::select! {
            biased;
            _ = token.cancelled() => Err(None),
            result = tokio::time::timeout(timeout, self.inner.transport.open_stream(&request)) => {
                match result {
                    Ok(Ok(stream)) => Ok(stream),
                    Ok(Err(e)) => Err(Some(e)),
                    Err(_) => Err(Some(TransportError::Timeout(timeout))),
                }
            }
        };

        let stream = match established {
            Ok(stream) => stream,
            Err(error) => {
                match error {
                    Some(e) => {
                        counter!(STREAMS_FAILED).increment(1);
                        tracing::warn!(
                            stream_id,
                            type_url = %request.type_url,
                            error = %e,
                            "could not establish upstream stream"
                        );
                    }
                    None => {
                        tracing::debug!(stream_id, "client is shutting down, not opening stream");
                    }
                }
                state.advance(StreamState::Closed);
                return Ok((rx, shutdown));
            }
        };

        state.advance(StreamState::Streaming);
        counter!(STREAMS_OPENED).increment(1);
        tracing::debug!(
            stream_id,
            type_url = %request.type_url,
            node_id = request.node_id().unwrap_or_default(),
            "upstream stream established"
        );

        tokio::spawn(run_stream(StreamTask {
            stream_id,
            stream,
            request,
            tx,
            token,
            state,
            timeout,
        }));

        Ok((rx, shutdown))
    }
}

struct StreamTask {
    stream_id: u64,
    stream: Box<dyn TransportStream>,
    request: DiscoveryRequest,
    tx: mpsc::Sender<DiscoveryResponse>,
    token: CancellationToken,
    state: Arc<StateCell>,
    timeout: Duration,
}

/// Forwards responses from the origin and acknowledges each one, until a
/// teardown trigger fires. This task owns the response sender, so the channel
/// is closed exactly once, after the transport stream.
async fn run_stream(task: StreamTask) {
    let StreamTask {
        stream_id,
        mut stream,
        request,
        tx,
        token,
        state,
        timeout,
    } = task;

    let reason = loop {
        let received = tokio::select! {
            biased;
            _ = token.cancelled() => break CloseReason::Shutdown,
            _ = tx.closed() => break CloseReason::ReceiverDropped,
            received = stream.recv() => received,
        };

        let response = match received {
            Ok(Some(response)) => response,
            Ok(None) => break CloseReason::UpstreamClosed,
            Err(e) => {
                tracing::warn!(stream_id, error = %e, "upstream stream failed");
                break CloseReason::StreamError;
            }
        };

        counter!(RESPONSES_RECEIVED).increment(1);
        tracing::trace!(
            stream_id,
            version = %response.version_info,
            nonce = %response.nonce,
            "received upstream response"
        );

        let ack = request.ack(&response);

        tokio::select! {
            biased;
            _ = token.cancelled() => break CloseReason::Shutdown,
            sent = tx.send(response) => {
                if sent.is_err() {
                    break CloseReason::ReceiverDropped;
                }
            }
        }

        let acked = tokio::select! {
            biased;
            _ = token.cancelled() => break CloseReason::Shutdown,
            acked = tokio::time::timeout(timeout, stream.send(&ack)) => acked,
        };

        match acked {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                counter!(ACK_FAILURES).increment(1);
                tracing::warn!(stream_id, error = %e, "could not acknowledge upstream response");
                break CloseReason::StreamError;
            }
            Err(_) => {
                counter!(ACK_FAILURES).increment(1);
                tracing::warn!(stream_id, ?timeout, "timed out acknowledging upstream response");
                break CloseReason::AckTimeout;
            }
        }
    };

    state.advance(StreamState::Closed);
    drop(stream);
    drop(tx);

    counter!(STREAMS_CLOSED, "reason" => reason.as_str()).increment(1);
    tracing::debug!(stream_id, reason = reason.as_str(), "upstream stream closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{CLUSTER_TYPE_URL, LISTENER_TYPE_URL, Node};
    use crate::testutils::{MockOrigin, response};

    fn cluster_request() -> DiscoveryRequest {
        DiscoveryRequest::new(CLUSTER_TYPE_URL, Node::new("n1"))
    }

    fn client(origin: &MockOrigin, token: CancellationToken) -> UpstreamClient {
        UpstreamClient::with_transport(
            Arc::new(origin.clone()),
            CallOptions {
                timeout: Duration::from_secs(5),
            },
            token,
        )
    }

    async fn recv(rx: &mut ResponseReceiver) -> Option<DiscoveryResponse> {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for the response channel")
    }

    #[tokio::test]
    async fn test_responses_arrive_in_order_and_are_acknowledged() {
        let origin = MockOrigin::new();
        let client = client(&origin, CancellationToken::new());

        let (mut rx, shutdown) = client
            .open_stream(cluster_request().with_version("stale"))
            .await
            .unwrap();
        assert_eq!(shutdown.state(), StreamState::Streaming);

        origin.push(response(CLUSTER_TYPE_URL, "v0"));
        origin.push(response(CLUSTER_TYPE_URL, "v1"));

        assert_eq!(recv(&mut rx).await.unwrap().version_info, "v0");
        assert_eq!(recv(&mut rx).await.unwrap().version_info, "v1");

        // The initial request plus one acknowledgement per response
        assert!(origin.wait_for_requests(3).await);
        let requests = origin.requests();
        assert_eq!(requests[0].version_info, "");
        assert_eq!(requests[0].response_nonce, "");
        assert_eq!(requests[1].version_info, "v0");
        assert_eq!(requests[1].response_nonce, "nonce-v0");
        assert_eq!(requests[2].version_info, "v1");
        assert_eq!(requests[2].response_nonce, "nonce-v1");
    }

    #[tokio::test]
    async fn test_shutdown_closes_the_response_channel() {
        let origin = MockOrigin::new();
        let client = client(&origin, CancellationToken::new());

        let (mut rx, shutdown) = client.open_stream(cluster_request()).await.unwrap();
        origin.push(response(CLUSTER_TYPE_URL, "v0"));
        assert_eq!(recv(&mut rx).await.unwrap().version_info, "v0");

        shutdown.shutdown();
        assert!(recv(&mut rx).await.is_none());
        assert!(shutdown.is_closed());
        assert!(origin.wait_for_open_streams(0).await);

        // Further pushes never reach the closed channel
        origin.push(response(CLUSTER_TYPE_URL, "v1"));
        assert!(recv(&mut rx).await.is_none());
    }

    #[tokio::test]
    async fn test_upstream_close_closes_the_response_channel() {
        let origin = MockOrigin::new();
        let client = client(&origin, CancellationToken::new());

        let (mut rx, shutdown) = client.open_stream(cluster_request()).await.unwrap();
        origin.close_all();

        assert!(recv(&mut rx).await.is_none());
        assert!(shutdown.is_closed());
    }

    #[tokio::test]
    async fn test_stream_error_closes_the_response_channel() {
        let origin = MockOrigin::new();
        let client = client(&origin, CancellationToken::new());

        let (mut rx, _shutdown) = client.open_stream(cluster_request()).await.unwrap();
        origin.push(response(CLUSTER_TYPE_URL, "v0"));
        origin.fail_all();

        assert_eq!(recv(&mut rx).await.unwrap().version_info, "v0");
        assert!(recv(&mut rx).await.is_none());
    }

    #[tokio::test]
    async fn test_cancelling_the_client_closes_every_stream() {
        let origin = MockOrigin::new();
        let token = CancellationToken::new();
        let client = client(&origin, token.clone());

        // No dedup at this layer: identical requests open independent streams
        let (mut rx1, _) = client.open_stream(cluster_request()).await.unwrap();
        let (mut rx2, _) = client.open_stream(cluster_request()).await.unwrap();
        assert_eq!(origin.streams_opened(), 2);

        origin.push(response(CLUSTER_TYPE_URL, "v0"));
        token.cancel();

        while recv(&mut rx1).await.is_some() {}
        while recv(&mut rx2).await.is_some() {}
        assert!(origin.wait_for_open_streams(0).await);
        assert!(client.is_shut_down());
    }

    #[tokio::test]
    async fn test_open_after_cancellation_returns_a_closed_channel() {
        let origin = MockOrigin::new();
        let token = CancellationToken::new();
        let client = client(&origin, token.clone());
        token.cancel();

        let (mut rx, shutdown) = client.open_stream(cluster_request()).await.unwrap();
        assert!(recv(&mut rx).await.is_none());
        assert!(shutdown.is_closed());
        assert_eq!(origin.streams_opened(), 0);
    }

    #[tokio::test]
    async fn test_cancellation_while_connecting() {
        let origin = MockOrigin::new();
        origin.stall_streams(true);
        let token = CancellationToken::new();
        let client = client(&origin, token.clone());

        let opening = tokio::spawn({
            let client = client.clone();
            async move { client.open_stream(cluster_request()).await }
        });
        assert!(origin.wait_for_requests(1).await);
        token.cancel();

        let (mut rx, shutdown) = opening.await.unwrap().unwrap();
        assert!(recv(&mut rx).await.is_none());
        assert!(shutdown.is_closed());
    }

    #[tokio::test]
    async fn test_repeated_and_racing_shutdown() {
        let origin = MockOrigin::new();
        let token = CancellationToken::new();
        let client = client(&origin, token.clone());

        let (mut rx, shutdown) = client.open_stream(cluster_request()).await.unwrap();

        let mut racers = Vec::new();
        for _ in 0..8 {
            let shutdown = shutdown.clone();
            racers.push(tokio::spawn(async move { shutdown.shutdown() }));
        }
        racers.push(tokio::spawn({
            let token = token.clone();
            async move { token.cancel() }
        }));
        origin.close_all();
        for racer in racers {
            racer.await.unwrap();
        }
        shutdown.shutdown();

        assert!(recv(&mut rx).await.is_none());
        assert!(recv(&mut rx).await.is_none());
        assert!(shutdown.is_closed());
    }

    #[tokio::test]
    async fn test_invalid_request_fails_before_any_io() {
        let origin = MockOrigin::new();
        let client = client(&origin, CancellationToken::new());

        let result = client
            .open_stream(DiscoveryRequest::new("type.googleapis.com/unknown", Node::new("n1")))
            .await;
        assert!(matches!(result, Err(UpstreamError::UnsupportedTypeUrl(_))));

        let result = client
            .open_stream(DiscoveryRequest {
                type_url: LISTENER_TYPE_URL.into(),
                ..Default::default()
            })
            .await;
        assert!(matches!(result, Err(UpstreamError::MissingNode)));
        assert!(origin.requests().is_empty());
    }

    #[tokio::test]
    async fn test_transport_failures_surface_as_closed_channels() {
        let origin = MockOrigin::new();
        origin.refuse_streams(true);
        let client = client(&origin, CancellationToken::new());

        let (mut rx, shutdown) = client.open_stream(cluster_request()).await.unwrap();
        assert!(recv(&mut rx).await.is_none());
        assert!(shutdown.is_closed());
    }

    #[tokio::test]
    async fn test_establishment_timeout() {
        let origin = MockOrigin::new();
        origin.stall_streams(true);
        let client = UpstreamClient::with_transport(
            Arc::new(origin.clone()),
            CallOptions {
                timeout: Duration::from_millis(50),
            },
            CancellationToken::new(),
        );

        let (mut rx, shutdown) = client.open_stream(cluster_request()).await.unwrap();
        assert!(recv(&mut rx).await.is_none());
        assert!(shutdown.is_closed());
    }

    #[tokio::test]
    async fn test_dropping_the_receiver_tears_down_the_stream() {
        let origin = MockOrigin::new();
        let client = client(&origin, CancellationToken::new());

        let (rx, shutdown) = client.open_stream(cluster_request()).await.unwrap();
        assert_eq!(origin.open_streams(), 1);

        drop(rx);
        assert!(origin.wait_for_open_streams(0).await);
        assert!(shutdown.is_closed());
    }
}
