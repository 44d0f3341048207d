//! Metric set: the serialization unit for breakdown metrics
//!
//! Wire shape:
//!
//! ```json
//! {"timestamp":1700000000000000,
//!  "transaction":{"name":"GET /users","type":"request"},
//!  "span":{"type":"db","subtype":"mysql"},
//!  "samples":{"span.self_time.count":{"value":2},"span.self_time.sum.us":{"value":150.0}}}
//! ```

use crate::serialization::serialize_timestamp;
use serde::Serialize;
use std::collections::BTreeMap;

/// Numeric sample value; counts stay integral on the wire
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(untagged)]
pub enum SampleValue {
    Count(u64),
    Micros(f64),
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Sample {
    pub value: SampleValue,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MetricSetTransaction {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub transaction_type: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MetricSetSpan {
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub span_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subtype: Option<String>,
}

impl MetricSetSpan {
    pub fn is_empty(&self) -> bool {
        self.span_type.is_none() && self.subtype.is_none()
    }
}

/// One flat metric record
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricSet {
    #[serde(serialize_with = "serialize_timestamp")]
    pub timestamp: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transaction: Option<MetricSetTransaction>,
    #[serde(skip_serializing_if = "MetricSetSpan::is_empty")]
    pub span: MetricSetSpan,
    pub samples: BTreeMap<String, Sample>,
}

impl MetricSet {
    pub fn new(timestamp: f64) -> Self {
        Self {
            timestamp,
            transaction: None,
            span: MetricSetSpan::default(),
            samples: BTreeMap::new(),
        }
    }

    pub fn set_sample(&mut self, key: &str, value: SampleValue) {
        self.samples.insert(key.to_string(), Sample { value });
    }

    pub fn get_sample(&self, key: &str) -> Option<SampleValue> {
        self.samples.get(key).map(|sample| sample.value)
    }
}
