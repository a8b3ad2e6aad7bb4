use envoy_types::pb::envoy::service::discovery::v3::{
    DeltaDiscoveryRequest, DeltaDiscoveryResponse, DiscoveryRequest as ProtoRequest,
    DiscoveryResponse as ProtoResponse,
    aggregated_discovery_service_server::{
        AggregatedDiscoveryService, AggregatedDiscoveryServiceServer,
    },
};
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_stream::wrappers::TcpListenerStream;
use tokio_stream::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;
use tonic::{Request, Response, Status};
use upstream::message::CLUSTER_TYPE_URL;
use upstream::{CallOptions, DiscoveryRequest, Node, UpstreamClient, UpstreamError};

/// Origin that serves `versions` one at a time: the first on the initial
/// request, each following one on the acknowledgement of the previous.
struct VersionedOrigin {
    versions: Vec<&'static str>,
    requests: Arc<Mutex<Vec<ProtoRequest>>>,
}

#[tonic::async_trait]
impl AggregatedDiscoveryService for VersionedOrigin {
    type StreamAggregatedResourcesStream =
        Pin<Box<dyn Stream<Item = Result<ProtoResponse, Status>> + Send>>;

    async fn stream_aggregated_resources(
        &self,
        request: Request<tonic::Streaming<ProtoRequest>>,
    ) -> Result<Response<Self::StreamAggregatedResourcesStream>, Status> {
        let mut inbound = request.into_inner();
        let versions = self.versions.clone();
        let requests = self.requests.clone();

        let outbound = async_stream::try_stream! {
            let mut next = versions.into_iter();
            while let Some(req) = inbound.next().await {
                let req = req?;
                let type_url = req.type_url.clone();
                requests.lock().push(req);
                if let Some(version) = next.next() {
                    yield ProtoResponse {
                        version_info: version.to_string(),
                        type_url,
                        nonce: format!("nonce-{version}"),
                        ..Default::default()
                    };
                }
            }
        };

        Ok(Response::new(Box::pin(outbound)))
    }

    type DeltaAggregatedResourcesStream =
        Pin<Box<dyn Stream<Item = Result<DeltaDiscoveryResponse, Status>> + Send>>;

    async fn delta_aggregated_resources(
        &self,
        _request: Request<tonic::Streaming<DeltaDiscoveryRequest>>,
    ) -> Result<Response<Self::DeltaAggregatedResourcesStream>, Status> {
        Err(Status::unimplemented("delta discovery is not served"))
    }
}

async fn start_origin(versions: Vec<&'static str>) -> (SocketAddr, Arc<Mutex<Vec<ProtoRequest>>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let requests = Arc::new(Mutex::new(Vec::new()));

    let origin = VersionedOrigin {
        versions,
        requests: requests.clone(),
    };
    tokio::spawn(async move {
        tonic::transport::Server::builder()
            .add_service(AggregatedDiscoveryServiceServer::new(origin))
            .serve_with_incoming(TcpListenerStream::new(listener))
            .await
            .unwrap();
    });

    (addr, requests)
}

fn options() -> CallOptions {
    CallOptions {
        timeout: Duration::from_secs(5),
    }
}

async fn wait_for_requests(requests: &Mutex<Vec<ProtoRequest>>, count: usize) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while requests.lock().len() < count {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("origin did not receive the expected requests");
}

#[tokio::test]
async fn test_stream_over_grpc() {
    let (addr, requests) = start_origin(vec!["v0", "v1"]).await;
    let client = UpstreamClient::connect(&addr.to_string(), options(), CancellationToken::new())
        .await
        .unwrap();

    let request =
        DiscoveryRequest::new(CLUSTER_TYPE_URL, Node::new("n1")).with_resource_names(["c1"]);
    let (mut rx, shutdown) = client.open_stream(request).await.unwrap();

    let first = rx.recv().await.unwrap();
    let second = rx.recv().await.unwrap();
    assert_eq!(first.version_info, "v0");
    assert_eq!(second.version_info, "v1");
    assert_eq!(second.nonce, "nonce-v1");

    wait_for_requests(&requests, 3).await;
    {
        let requests = requests.lock();
        assert_eq!(requests.len(), 3);
        assert_eq!(requests[0].version_info, "");
        assert_eq!(requests[0].response_nonce, "");
        assert_eq!(requests[0].node.as_ref().unwrap().id, "n1");
        assert_eq!(requests[0].resource_names, vec!["c1"]);
        assert_eq!(requests[1].response_nonce, "nonce-v0");
        assert_eq!(requests[2].version_info, "v1");
    }

    shutdown.shutdown();
    assert!(rx.recv().await.is_none());
}

#[tokio::test]
async fn test_governing_token_closes_grpc_streams() {
    let (addr, _requests) = start_origin(vec!["v0"]).await;
    let token = CancellationToken::new();
    let client = UpstreamClient::connect(&addr.to_string(), options(), token.clone())
        .await
        .unwrap();

    let request = DiscoveryRequest::new(CLUSTER_TYPE_URL, Node::new("n1"));
    let (mut rx1, _) = client.open_stream(request.clone()).await.unwrap();
    let (mut rx2, _) = client.open_stream(request).await.unwrap();
    assert_eq!(rx1.recv().await.unwrap().version_info, "v0");
    assert_eq!(rx2.recv().await.unwrap().version_info, "v0");

    token.cancel();
    assert!(rx1.recv().await.is_none());
    assert!(rx2.recv().await.is_none());
}

#[tokio::test]
async fn test_connect_rejects_empty_address() {
    let result = UpstreamClient::connect("", options(), CancellationToken::new()).await;
    assert!(matches!(result, Err(UpstreamError::Dial { .. })));
}
