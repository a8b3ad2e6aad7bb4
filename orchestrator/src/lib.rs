//! Aggregation-key cache in front of the upstream client.
//!
//! Requests that derive the same [`AggregationKey`] share one upstream stream. The
//! responses of that stream are broadcast to every [`Watch`] registered on the key,
//! and the stream is shut down as soon as the last watch goes away.

mod cache;
mod errors;
pub mod keyer;
pub mod metrics_defs;
pub mod rules;
mod watch;

pub use cache::{EntryInfo, Orchestrator};
pub use errors::{KeyError, OrchestratorError};
pub use keyer::{AggregationKey, Keyer};
pub use rules::{RulesConfig, RulesKeyer};
pub use watch::Watch;
