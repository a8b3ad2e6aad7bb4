//! Metrics definitions for the aggregation cache.

use shared::metrics_defs::{MetricDef, MetricType};

pub const ENTRIES: MetricDef = MetricDef {
    name: "cache.entries",
    metric_type: MetricType::Gauge,
    description: "Number of aggregation keys with a live entry",
};

pub const ENTRIES_CREATED: MetricDef = MetricDef {
    name: "cache.entry.created",
    metric_type: MetricType::Counter,
    description: "Number of entries created, one upstream stream each",
};

pub const ENTRIES_EVICTED: MetricDef = MetricDef {
    name: "cache.entry.evicted",
    metric_type: MetricType::Counter,
    description: "Number of entries removed. Tagged with reason.",
};

pub const WATCHES_REGISTERED: MetricDef = MetricDef {
    name: "cache.watch.registered",
    metric_type: MetricType::Counter,
    description: "Number of watches registered",
};

pub const WATCHES_CANCELLED: MetricDef = MetricDef {
    name: "cache.watch.cancelled",
    metric_type: MetricType::Counter,
    description: "Number of watches cancelled by their owner",
};

pub const RESPONSES_FANNED_OUT: MetricDef = MetricDef {
    name: "cache.response.fanned_out",
    metric_type: MetricType::Counter,
    description: "Number of responses delivered to watches",
};

pub const KEY_MATCH_FAILURES: MetricDef = MetricDef {
    name: "cache.key_match.failed",
    metric_type: MetricType::Counter,
    description: "Number of requests for which no aggregation key could be derived",
};

pub const ALL_METRICS: &[MetricDef] = &[
    ENTRIES,
    ENTRIES_CREATED,
    ENTRIES_EVICTED,
    WATCHES_REGISTERED,
    WATCHES_CANCELLED,
    RESPONSES_FANNED_OUT,
    KEY_MATCH_FAILURES,
];
