//! gRPC transport backed by tonic.
//!
//! Each stream is one `StreamAggregatedResources` call on the Aggregated Discovery
//! Service. The call itself moves raw bytes through a pass-through codec, the
//! protobuf conversion happens here with the envoy-types messages.

use crate::error::TransportError;
use crate::message::{DiscoveryRequest, DiscoveryResponse, Resource};
use crate::transport::{Transport, TransportStream};
use async_trait::async_trait;
use bytes::{Buf, BufMut, Bytes};
use envoy_types::pb::envoy::config::core::v3 as core;
use envoy_types::pb::envoy::service::discovery::v3 as discovery;
use envoy_types::pb::google::rpc::Status as RpcStatus;
use http::uri::PathAndQuery;
use prost::Message;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::StreamExt as _;
use tokio_stream::wrappers::ReceiverStream;
use tonic::client::Grpc;
use tonic::codec::{Codec, DecodeBuf, Decoder, EncodeBuf, Encoder};
use tonic::transport::Channel;
use tonic::{Status, Streaming};

const ADS_PATH: &str =
    "/envoy.service.discovery.v3.AggregatedDiscoveryService/StreamAggregatedResources";

const REQUEST_CHANNEL_BUFFER_SIZE: usize = 16;

#[derive(Debug, Clone, Copy)]
struct BytesCodec;

impl Codec for BytesCodec {
    type Encode = Bytes;
    type Decode = Bytes;
    type Encoder = BytesEncoder;
    type Decoder = BytesDecoder;

    fn encoder(&mut self) -> Self::Encoder {
        BytesEncoder
    }

    fn decoder(&mut self) -> Self::Decoder {
        BytesDecoder
    }
}

#[derive(Debug)]
struct BytesEncoder;

impl Encoder for BytesEncoder {
    type Item = Bytes;
    type Error = Status;

    fn encode(&mut self, item: Self::Item, dst: &mut EncodeBuf<'_>) -> Result<(), Self::Error> {
        dst.put_slice(&item);
        Ok(())
    }
}

#[derive(Debug)]
struct BytesDecoder;

impl Decoder for BytesDecoder {
    type Item = Bytes;
    type Error = Status;

    fn decode(&mut self, src: &mut DecodeBuf<'_>) -> Result<Option<Self::Item>, Self::Error> {
        Ok(Some(src.copy_to_bytes(src.remaining())))
    }
}

/// Opens discovery streams over a shared tonic [`Channel`].
#[derive(Clone, Debug)]
pub struct GrpcTransport {
    channel: Channel,
}

impl GrpcTransport {
    pub fn from_channel(channel: Channel) -> Self {
        GrpcTransport { channel }
    }

    /// Connects to the origin server. `address` is either `host:port` or a full URI.
    pub async fn connect(address: &str, timeout: Duration) -> Result<Self, TransportError> {
        let uri = normalize_address(address)?;

        let channel = Channel::from_shared(uri)
            .map_err(|e| TransportError::InvalidAddress(e.to_string()))?
            .connect_timeout(timeout)
            .connect()
            .await
            .map_err(|e| TransportError::Connection(e.to_string()))?;

        Ok(GrpcTransport { channel })
    }
}

fn normalize_address(address: &str) -> Result<String, TransportError> {
    let address = address.trim();
    if address.is_empty() {
        return Err(TransportError::InvalidAddress("empty address".into()));
    }

    if address.contains("://") {
        Ok(address.to_string())
    } else {
        Ok(format!("http://{address}"))
    }
}

#[async_trait]
impl Transport for GrpcTransport {
    async fn open_stream(
        &self,
        initial: &DiscoveryRequest,
    ) -> Result<Box<dyn TransportStream>, TransportError> {
        let mut grpc = Grpc::new(self.channel.clone());

        grpc.ready()
            .await
            .map_err(|e| TransportError::Connection(e.to_string()))?;

        let (tx, rx) = mpsc::channel::<Bytes>(REQUEST_CHANNEL_BUFFER_SIZE);

        // The initial request is yielded before anything is read from the channel.
        // Some servers hold back response headers until the first message arrives.
        let request_stream =
            tokio_stream::iter(vec![encode_request(initial)]).chain(ReceiverStream::new(rx));

        let response = grpc
            .streaming(
                tonic::Request::new(request_stream),
                PathAndQuery::from_static(ADS_PATH),
                BytesCodec,
            )
            .await?;

        Ok(Box::new(GrpcStream {
            sender: tx,
            receiver: response.into_inner(),
        }))
    }
}

struct GrpcStream {
    sender: mpsc::Sender<Bytes>,
    receiver: Streaming<Bytes>,
}

#[async_trait]
impl TransportStream for GrpcStream {
    async fn send(&mut self, request: &DiscoveryRequest) -> Result<(), TransportError> {
        self.sender
            .send(encode_request(request))
            .await
            .map_err(|_| TransportError::StreamClosed)
    }

    async fn recv(&mut self) -> Result<Option<DiscoveryResponse>, TransportError> {
        match self.receiver.message().await? {
            Some(bytes) => Ok(Some(decode_response(bytes)?)),
            None => Ok(None),
        }
    }
}

pub(crate) fn encode_request(request: &DiscoveryRequest) -> Bytes {
    let node = request.node.as_ref().map(|node| core::Node {
        id: node.id.clone(),
        cluster: node.cluster.clone(),
        user_agent_name: node.user_agent_name.clone(),
        user_agent_version_type: (!node.user_agent_version.is_empty()).then(|| {
            core::node::UserAgentVersionType::UserAgentVersion(node.user_agent_version.clone())
        }),
        locality: node.locality.as_ref().map(|l| core::Locality {
            region: l.region.clone(),
            zone: l.zone.clone(),
            sub_zone: l.sub_zone.clone(),
        }),
        ..Default::default()
    });

    let proto_request = discovery::DiscoveryRequest {
        version_info: request.version_info.clone(),
        node,
        resource_names: request.resource_names.clone(),
        type_url: request.type_url.clone(),
        response_nonce: request.response_nonce.clone(),
        error_detail: request.error_detail.as_ref().map(|e| RpcStatus {
            code: e.code,
            message: e.message.clone(),
            details: vec![],
        }),
        ..Default::default()
    };

    proto_request.encode_to_vec().into()
}

pub(crate) fn decode_response(bytes: Bytes) -> Result<DiscoveryResponse, TransportError> {
    let proto_response = discovery::DiscoveryResponse::decode(bytes)?;

    Ok(DiscoveryResponse {
        version_info: proto_response.version_info,
        resources: proto_response
            .resources
            .into_iter()
            .map(|any| Resource {
                type_url: any.type_url,
                value: any.value.into(),
            })
            .collect(),
        type_url: proto_response.type_url,
        nonce: proto_response.nonce,
    })
}
