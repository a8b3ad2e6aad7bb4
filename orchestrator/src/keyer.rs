use crate::errors::KeyError;
use serde::{Serialize, Serializer};
use std::fmt;
use std::sync::Arc;
use upstream::DiscoveryRequest;

/// Identifies the group of requests that share one upstream subscription.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AggregationKey(Arc<str>);

impl AggregationKey {
    pub fn new(key: impl AsRef<str>) -> Self {
        AggregationKey(Arc::from(key.as_ref()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AggregationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for AggregationKey {
    fn from(key: &str) -> Self {
        AggregationKey::new(key)
    }
}

impl From<String> for AggregationKey {
    fn from(key: String) -> Self {
        AggregationKey(Arc::from(key))
    }
}

impl std::borrow::Borrow<str> for AggregationKey {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl Serialize for AggregationKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

/// Maps a request to its aggregation key. Must be a pure function of the request.
pub trait Keyer: Send + Sync {
    fn match_key(&self, request: &DiscoveryRequest) -> Result<AggregationKey, KeyError>;
}

impl<F> Keyer for F
where
    F: Fn(&DiscoveryRequest) -> Result<AggregationKey, KeyError> + Send + Sync,
{
    fn match_key(&self, request: &DiscoveryRequest) -> Result<AggregationKey, KeyError> {
        self(request)
    }
}
