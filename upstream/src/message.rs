//! Discovery message types exchanged with the origin server.
//!
//! These types are independent of the wire encoding. The transport converts them
//! to and from the protobuf representation.

use crate::error::UpstreamError;
use bytes::Bytes;

pub const LISTENER_TYPE_URL: &str = "type.googleapis.com/envoy.config.listener.v3.Listener";
pub const CLUSTER_TYPE_URL: &str = "type.googleapis.com/envoy.config.cluster.v3.Cluster";
pub const ROUTE_TYPE_URL: &str = "type.googleapis.com/envoy.config.route.v3.RouteConfiguration";
pub const ENDPOINT_TYPE_URL: &str =
    "type.googleapis.com/envoy.config.endpoint.v3.ClusterLoadAssignment";

/// State-of-the-world resource types the relay is able to subscribe to.
pub const SUPPORTED_TYPE_URLS: &[&str] = &[
    LISTENER_TYPE_URL,
    CLUSTER_TYPE_URL,
    ROUTE_TYPE_URL,
    ENDPOINT_TYPE_URL,
];

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DiscoveryRequest {
    /// Type URL of the requested resources.
    pub type_url: String,
    /// Identity of the requester.
    pub node: Option<Node>,
    /// Requested resource names. Order is not significant.
    pub resource_names: Vec<String>,
    /// Version of the most recently accepted response, empty on the first request.
    pub version_info: String,
    /// Nonce of the most recently accepted response, empty on the first request.
    pub response_nonce: String,
    /// Set when the previous response was rejected.
    pub error_detail: Option<ErrorDetail>,
}

impl DiscoveryRequest {
    pub fn new(type_url: impl Into<String>, node: Node) -> Self {
        DiscoveryRequest {
            type_url: type_url.into(),
            node: Some(node),
            ..Default::default()
        }
    }

    pub fn with_resource_names<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.resource_names = names.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_version(mut self, version_info: impl Into<String>) -> Self {
        self.version_info = version_info.into();
        self
    }

    /// The first request on a stream carries an empty version and nonce so the
    /// origin answers with its latest state.
    pub fn initial(&self) -> Self {
        DiscoveryRequest {
            version_info: String::new(),
            response_nonce: String::new(),
            error_detail: None,
            ..self.clone()
        }
    }

    /// Builds the request that acknowledges `response`.
    pub fn ack(&self, response: &DiscoveryResponse) -> Self {
        DiscoveryRequest {
            version_info: response.version_info.clone(),
            response_nonce: response.nonce.clone(),
            error_detail: None,
            ..self.clone()
        }
    }

    pub fn node_id(&self) -> Option<&str> {
        self.node.as_ref().map(|n| n.id.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DiscoveryResponse {
    pub type_url: String,
    pub version_info: String,
    pub resources: Vec<Resource>,
    pub nonce: String,
}

/// A resource wrapped as `google.protobuf.Any`.
#[derive(Debug, Clone, PartialEq)]
pub struct Resource {
    pub type_url: String,
    pub value: Bytes,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Node {
    pub id: String,
    pub cluster: String,
    pub locality: Option<Locality>,
    pub user_agent_name: String,
    pub user_agent_version: String,
}

impl Node {
    pub fn new(id: impl Into<String>) -> Self {
        Node {
            id: id.into(),
            ..Default::default()
        }
    }

    pub fn with_cluster(mut self, cluster: impl Into<String>) -> Self {
        self.cluster = cluster.into();
        self
    }

    pub fn with_locality(mut self, locality: Locality) -> Self {
        self.locality = Some(locality);
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Locality {
    pub region: String,
    pub zone: String,
    pub sub_zone: String,
}

/// Details attached to a request that rejects (NACKs) a response.
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorDetail {
    pub code: i32,
    pub message: String,
}

/// Checks that a request can be sent upstream. Runs before any I/O so callers
/// can fail synchronously.
pub fn validate_request(request: &DiscoveryRequest) -> Result<(), UpstreamError> {
    if !SUPPORTED_TYPE_URLS.contains(&request.type_url.as_str()) {
        return Err(UpstreamError::UnsupportedTypeUrl(request.type_url.clone()));
    }

    if request.node.is_none() {
        return Err(UpstreamError::MissingNode);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_request() {
        let request = DiscoveryRequest::new(CLUSTER_TYPE_URL, Node::new("n1"));
        assert!(validate_request(&request).is_ok());

        let request = DiscoveryRequest::new("type.googleapis.com/unknown", Node::new("n1"));
        assert!(matches!(
            validate_request(&request),
            Err(UpstreamError::UnsupportedTypeUrl(url)) if url == "type.googleapis.com/unknown"
        ));

        let request = DiscoveryRequest {
            type_url: LISTENER_TYPE_URL.into(),
            ..Default::default()
        };
        assert!(matches!(
            validate_request(&request),
            Err(UpstreamError::MissingNode)
        ));
    }

    #[test]
    fn test_initial_and_ack() {
        let request = DiscoveryRequest::new(ROUTE_TYPE_URL, Node::new("n1"))
            .with_resource_names(["r1", "r2"])
            .with_version("v3");

        let initial = request.initial();
        assert_eq!(initial.version_info, "");
        assert_eq!(initial.response_nonce, "");
        assert_eq!(initial.resource_names, vec!["r1", "r2"]);

        let response = DiscoveryResponse {
            type_url: ROUTE_TYPE_URL.into(),
            version_info: "v4".into(),
            resources: vec![],
            nonce: "nonce-4".into(),
        };
        let ack = initial.ack(&response);
        assert_eq!(ack.version_info, "v4");
        assert_eq!(ack.response_nonce, "nonce-4");
        assert_eq!(ack.node_id(), Some("n1"));
        assert_eq!(ack.type_url, ROUTE_TYPE_URL);
    }
}
