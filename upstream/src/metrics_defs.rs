//! Metrics definitions for the upstream client.

use shared::metrics_defs::{MetricDef, MetricType};

pub const STREAMS_OPENED: MetricDef = MetricDef {
    name: "upstream.stream.opened",
    metric_type: MetricType::Counter,
    description: "Number of upstream streams that reached the streaming state",
};

pub const STREAMS_FAILED: MetricDef = MetricDef {
    name: "upstream.stream.failed",
    metric_type: MetricType::Counter,
    description: "Number of upstream streams that could not be established",
};

pub const STREAMS_CLOSED: MetricDef = MetricDef {
    name: "upstream.stream.closed",
    metric_type: MetricType::Counter,
    description: "Number of upstream streams torn down, tagged by reason",
};

pub const RESPONSES_RECEIVED: MetricDef = MetricDef {
    name: "upstream.response.received",
    metric_type: MetricType::Counter,
    description: "Number of discovery responses received from the origin",
};

pub const ACK_FAILURES: MetricDef = MetricDef {
    name: "upstream.ack.failed",
    metric_type: MetricType::Counter,
    description: "Number of acknowledgements that could not be sent",
};

pub const ALL_METRICS: &[MetricDef] = &[
    STREAMS_OPENED,
    STREAMS_FAILED,
    STREAMS_CLOSED,
    RESPONSES_RECEIVED,
    ACK_FAILURES,
];
