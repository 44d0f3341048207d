//! Event records sent to the APM server: spans, transactions and errors
//!
//! These are the finalized, immutable snapshots queued for serialization. The
//! live, mutable side of a span is [`crate::tracer::Span`].

use crate::intercepted::{RawText, ThrowableInfo};
use crate::serialization::serialize_timestamp;
use rand::RngCore;
use serde::Serialize;
use std::collections::BTreeMap;

pub const EXECUTION_SEGMENT_ID_SIZE_IN_BYTES: usize = 8;
pub const TRACE_ID_SIZE_IN_BYTES: usize = 16;
pub const ERROR_ID_SIZE_IN_BYTES: usize = 16;

/// Maximum length (in characters) of keyword fields: names, types, label keys
pub const KEYWORD_STRING_MAX_LENGTH: usize = 1024;

/// Random lowercase-hex id of `size_in_bytes` bytes
pub fn generate_id(size_in_bytes: usize) -> String {
    let mut bytes = vec![0u8; size_in_bytes];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Truncate a keyword string to [`KEYWORD_STRING_MAX_LENGTH`] characters
pub fn limit_keyword_string(value: &str) -> String {
    match value.char_indices().nth(KEYWORD_STRING_MAX_LENGTH) {
        Some((byte_index, _)) => value[..byte_index].to_string(),
        None => value.to_string(),
    }
}

pub fn limit_nullable_keyword_string(value: Option<&str>) -> Option<String> {
    value.map(limit_keyword_string)
}

/// Result of a traced operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Success,
    Failure,
    Unknown,
}

/// Label value: only strings, numbers and booleans are allowed
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum LabelValue {
    Text(RawText),
    Int(i64),
    Float(f64),
    Bool(bool),
}

impl From<&str> for LabelValue {
    fn from(value: &str) -> Self {
        LabelValue::Text(RawText::from(value))
    }
}

impl From<RawText> for LabelValue {
    fn from(value: RawText) -> Self {
        LabelValue::Text(value)
    }
}

impl From<i64> for LabelValue {
    fn from(value: i64) -> Self {
        LabelValue::Int(value)
    }
}

impl From<f64> for LabelValue {
    fn from(value: f64) -> Self {
        LabelValue::Float(value)
    }
}

impl From<bool> for LabelValue {
    fn from(value: bool) -> Self {
        LabelValue::Bool(value)
    }
}

pub type Labels = BTreeMap<String, LabelValue>;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DbContext {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub statement: Option<RawText>,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub db_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct HttpContext {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<RawText>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_code: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DestinationService {
    pub name: String,
    pub resource: String,
    #[serde(rename = "type")]
    pub service_type: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DestinationContext {
    pub service: DestinationService,
}

/// Optional per-span context; omitted from the wire when empty
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SpanContextData {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub db: Option<DbContext>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub http: Option<HttpContext>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub destination: Option<DestinationContext>,
    #[serde(rename = "tags", skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: Labels,
}

impl SpanContextData {
    pub fn is_empty(&self) -> bool {
        self.db.is_none()
            && self.http.is_none()
            && self.destination.is_none()
            && self.labels.is_empty()
    }
}

/// Finalized span
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SpanData {
    pub name: String,
    #[serde(rename = "type")]
    pub span_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subtype: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    pub id: String,
    pub transaction_id: String,
    pub trace_id: String,
    pub parent_id: String,
    #[serde(serialize_with = "serialize_timestamp")]
    pub timestamp: f64,
    /// Milliseconds
    pub duration: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<Outcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<SpanContextData>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SpanCount {
    pub started: u32,
    pub dropped: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TransactionContextData {
    #[serde(rename = "tags", skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: Labels,
}

/// Finalized (or in-flight, for breakdown metadata) transaction
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransactionData {
    pub name: String,
    #[serde(rename = "type")]
    pub transaction_type: String,
    pub id: String,
    pub trace_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    #[serde(serialize_with = "serialize_timestamp")]
    pub timestamp: f64,
    /// Milliseconds
    pub duration: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<Outcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    pub sampled: bool,
    pub span_count: SpanCount,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<TransactionContextData>,
}

impl TransactionData {
    pub fn set_label(&mut self, key: &str, value: impl Into<LabelValue>) {
        self.context
            .get_or_insert_with(TransactionContextData::default)
            .labels
            .insert(limit_keyword_string(key), value.into());
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorExceptionData {
    pub message: RawText,
    #[serde(rename = "type")]
    pub exception_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<i64>,
}

/// Error event captured from an exception escaping a tracked call
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorData {
    pub id: String,
    #[serde(serialize_with = "serialize_timestamp")]
    pub timestamp: f64,
    pub trace_id: String,
    pub transaction_id: String,
    pub parent_id: String,
    pub exception: ErrorExceptionData,
}

impl ErrorData {
    pub fn from_throwable(
        throwable: &ThrowableInfo,
        timestamp: f64,
        trace_id: &str,
        transaction_id: &str,
        parent_id: &str,
    ) -> Self {
        Self {
            id: generate_id(ERROR_ID_SIZE_IN_BYTES),
            timestamp,
            trace_id: trace_id.to_string(),
            transaction_id: transaction_id.to_string(),
            parent_id: parent_id.to_string(),
            exception: ErrorExceptionData {
                message: throwable.message.clone(),
                exception_type: limit_keyword_string(&throwable.class_name),
                code: throwable.code,
            },
        }
    }
}
