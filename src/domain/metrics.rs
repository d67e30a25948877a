use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

/// One node's latest sample for a metric.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricSample {
    pub timestamp: DateTime<Utc>,
    pub window: Duration,
    pub value: Decimal,
}

impl MetricSample {
    pub fn new(timestamp: DateTime<Utc>, window: Duration, value: impl Into<Decimal>) -> Self {
        MetricSample {
            timestamp,
            window,
            value: value.into(),
        }
    }
}

/// `node-id -> sample`, the in-cache representation of a metric's most
/// recent snapshot across the cluster.
pub type MetricSnapshot = HashMap<String, MetricSample>;
