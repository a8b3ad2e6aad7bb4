//! Rule-based aggregation keys.
//!
//! A key is assembled from fragments. Each fragment holds an ordered list of rules
//! and the first rule whose match predicate holds contributes one string to the
//! key. Contributions are joined with `_`.
//!
//! ```yaml
//! fragments:
//!   - rules:
//!       - match:
//!           request_type_match:
//!             types:
//!               - type.googleapis.com/envoy.config.cluster.v3.Cluster
//!         result:
//!           string_fragment: clusters
//!   - rules:
//!       - match:
//!           any_match: true
//!         result:
//!           request_node_fragment:
//!             field: cluster
//! ```

use crate::errors::KeyError;
use crate::keyer::{AggregationKey, Keyer};
use serde::Deserialize;
use std::fmt;
use upstream::{DiscoveryRequest, Node};

const FRAGMENT_SEPARATOR: &str = "_";
const RESOURCE_NAME_SEPARATOR: &str = ".";

/// `element` value selecting every requested resource name.
const ALL_RESOURCE_NAMES: i64 = -1;

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum ValidationError {
    #[error("aggregation rules must define at least one fragment")]
    NoFragments,

    #[error("fragment {0} has no rules")]
    EmptyFragment(usize),

    #[error("request_type_match must list at least one type")]
    EmptyTypeList,

    #[error("request_node_match must set exactly one of exact or prefix")]
    InvalidNodeMatch,

    #[error("resource_names_fragment element must be -1 or a valid index, got {0}")]
    InvalidResourceIndex(i64),

    #[error("{0} must contain at least one predicate")]
    EmptyCombinator(&'static str),
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct RulesConfig {
    pub fragments: Vec<Fragment>,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct Fragment {
    pub rules: Vec<Rule>,
}

/// Predicates are written as single-key maps (`any_match: true`), with unit
/// variants such as `request_type` as plain strings.
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct Rule {
    #[serde(deserialize_with = "serde_yaml::with::singleton_map_recursive::deserialize")]
    pub r#match: MatchPredicate,
    #[serde(deserialize_with = "serde_yaml::with::singleton_map_recursive::deserialize")]
    pub result: ResultPredicate,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum MatchPredicate {
    AnyMatch(bool),
    RequestTypeMatch { types: Vec<String> },
    RequestNodeMatch(NodeMatch),
    AndMatch(Vec<MatchPredicate>),
    OrMatch(Vec<MatchPredicate>),
    NotMatch(Box<MatchPredicate>),
}

/// Compares one node field against either an exact value or a prefix.
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct NodeMatch {
    pub field: NodeField,
    pub exact: Option<String>,
    pub prefix: Option<String>,
}

#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum NodeField {
    Id,
    Cluster,
    Region,
    Zone,
    SubZone,
}

impl NodeField {
    fn get(self, node: &Node) -> &str {
        let locality = node.locality.as_ref();
        match self {
            NodeField::Id => &node.id,
            NodeField::Cluster => &node.cluster,
            NodeField::Region => locality.map_or("", |l| l.region.as_str()),
            NodeField::Zone => locality.map_or("", |l| l.zone.as_str()),
            NodeField::SubZone => locality.map_or("", |l| l.sub_zone.as_str()),
        }
    }
}

impl fmt::Display for NodeField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NodeField::Id => "id",
            NodeField::Cluster => "cluster",
            NodeField::Region => "region",
            NodeField::Zone => "zone",
            NodeField::SubZone => "sub_zone",
        };
        f.write_str(name)
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum ResultPredicate {
    /// A fixed string.
    StringFragment(String),
    /// The request's type URL.
    RequestType,
    RequestNodeFragment { field: NodeField },
    /// `element: -1` selects every name, sorted and joined with `.`.
    ResourceNamesFragment { element: i64 },
}

impl RulesConfig {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.fragments.is_empty() {
            return Err(ValidationError::NoFragments);
        }

        for (index, fragment) in self.fragments.iter().enumerate() {
            if fragment.rules.is_empty() {
                return Err(ValidationError::EmptyFragment(index));
            }
            for rule in &fragment.rules {
                rule.r#match.validate()?;
                rule.result.validate()?;
            }
        }

        Ok(())
    }
}

impl MatchPredicate {
    fn validate(&self) -> Result<(), ValidationError> {
        match self {
            MatchPredicate::AnyMatch(_) => Ok(()),
            MatchPredicate::RequestTypeMatch { types } => {
                if types.is_empty() {
                    return Err(ValidationError::EmptyTypeList);
                }
                Ok(())
            }
            MatchPredicate::RequestNodeMatch(node_match) => {
                match (&node_match.exact, &node_match.prefix) {
                    (Some(_), None) | (None, Some(_)) => Ok(()),
                    _ => Err(ValidationError::InvalidNodeMatch),
                }
            }
            MatchPredicate::AndMatch(predicates) => validate_all("and_match", predicates),
            MatchPredicate::OrMatch(predicates) => validate_all("or_match", predicates),
            MatchPredicate::NotMatch(predicate) => predicate.validate(),
        }
    }

    fn matches(&self, request: &DiscoveryRequest) -> bool {
        match self {
            MatchPredicate::AnyMatch(any) => *any,
            MatchPredicate::RequestTypeMatch { types } => {
                types.iter().any(|t| *t == request.type_url)
            }
            MatchPredicate::RequestNodeMatch(node_match) => {
                let Some(node) = &request.node else {
                    return false;
                };
                let value = node_match.field.get(node);
                match (&node_match.exact, &node_match.prefix) {
                    (Some(exact), _) => value == exact,
                    (None, Some(prefix)) => value.starts_with(prefix.as_str()),
                    (None, None) => false,
                }
            }
            MatchPredicate::AndMatch(predicates) => predicates.iter().all(|p| p.matches(request)),
            MatchPredicate::OrMatch(predicates) => predicates.iter().any(|p| p.matches(request)),
            MatchPredicate::NotMatch(predicate) => !predicate.matches(request),
        }
    }
}

fn validate_all(name: &'static str, predicates: &[MatchPredicate]) -> Result<(), ValidationError> {
    if predicates.is_empty() {
        return Err(ValidationError::EmptyCombinator(name));
    }
    predicates.iter().try_for_each(MatchPredicate::validate)
}

impl ResultPredicate {
    fn validate(&self) -> Result<(), ValidationError> {
        match self {
            ResultPredicate::ResourceNamesFragment { element } if *element < ALL_RESOURCE_NAMES => {
                Err(ValidationError::InvalidResourceIndex(*element))
            }
            _ => Ok(()),
        }
    }

    fn render(&self, request: &DiscoveryRequest) -> Result<String, KeyError> {
        match self {
            ResultPredicate::StringFragment(value) => Ok(value.clone()),
            ResultPredicate::RequestType => Ok(request.type_url.clone()),
            ResultPredicate::RequestNodeFragment { field } => {
                let value = request.node.as_ref().map_or("", |node| field.get(node));
                if value.is_empty() {
                    return Err(KeyError::EmptyNodeField(*field));
                }
                Ok(value.to_string())
            }
            ResultPredicate::ResourceNamesFragment { element } => {
                let names = &request.resource_names;
                if *element == ALL_RESOURCE_NAMES {
                    let mut sorted: Vec<&str> = names.iter().map(String::as_str).collect();
                    sorted.sort_unstable();
                    return Ok(sorted.join(RESOURCE_NAME_SEPARATOR));
                }

                usize::try_from(*element)
                    .ok()
                    .and_then(|index| names.get(index))
                    .cloned()
                    .ok_or(KeyError::ResourceIndexOutOfRange {
                        index: *element,
                        len: names.len(),
                    })
            }
        }
    }
}

/// [`Keyer`] driven by a validated [`RulesConfig`].
#[derive(Debug)]
pub struct RulesKeyer {
    fragments: Vec<Fragment>,
}

impl RulesKeyer {
    pub fn new(config: RulesConfig) -> Result<Self, ValidationError> {
        config.validate()?;
        Ok(RulesKeyer {
            fragments: config.fragments,
        })
    }
}

impl Keyer for RulesKeyer {
    fn match_key(&self, request: &DiscoveryRequest) -> Result<AggregationKey, KeyError> {
        let mut parts = Vec::with_capacity(self.fragments.len());

        for fragment in &self.fragments {
            let rule = fragment.rules.iter().find(|rule| rule.r#match.matches(request));
            if let Some(rule) = rule {
                parts.push(rule.result.render(request)?);
            }
        }

        if parts.is_empty() {
            return Err(KeyError::NoMatch {
                type_url: request.type_url.clone(),
            });
        }

        Ok(AggregationKey::from(parts.join(FRAGMENT_SEPARATOR)))
    }
}
