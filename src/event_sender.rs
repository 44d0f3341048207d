//! Event sender: NDJSON payload assembly and transport handoff
//!
//! A payload is a sequence of newline-separated JSON objects:
//!
//! ```text
//! {"metadata":{...}}
//! {"span":{...}}          zero or more
//! {"error":{...}}         zero or more
//! {"metricset":{...}}     zero or more (breakdown metrics)
//! {"transaction":{...}}   zero or one
//! ```
//!
//! The whole payload is built in memory before anything is handed to the
//! transport. If any value fails to serialize the batch is dropped as a
//! whole, so a partial payload is never sent.

use crate::breakdown::PerTransaction;
use crate::config::AgentConfig;
use crate::events::{ErrorData, SpanData, TransactionData};
use crate::metadata::Metadata;
use crate::serialization::{serialize_as_json, SerializationError};
use serde::Serialize;
use std::cell::RefCell;
use std::fmt::Debug;
use std::rc::Rc;
use std::time::Duration;

/// Network send primitive provided by the host
pub trait Transport {
    /// Hand a payload over for delivery
    ///
    /// `serialized_events` is the complete NDJSON payload (its first line is
    /// `serialized_metadata`).
    fn send(&self, server_timeout: Duration, serialized_metadata: &str, serialized_events: &str);
}

/// Whether a transport is available, decided once at startup
pub enum BackendCapability {
    Unavailable,
    Loaded(Box<dyn Transport>),
}

impl Debug for BackendCapability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendCapability::Unavailable => write!(f, "Unavailable"),
            BackendCapability::Loaded(_) => write!(f, "Loaded"),
        }
    }
}

/// Payload as received by [`InMemoryTransport`]
#[derive(Debug, Clone, PartialEq)]
pub struct SentPayload {
    pub server_timeout: Duration,
    pub serialized_metadata: String,
    pub serialized_events: String,
}

impl SentPayload {
    pub fn lines(&self) -> impl Iterator<Item = &str> {
        self.serialized_events.lines()
    }

    /// Top-level key of each line (`metadata`, `span`, ...)
    pub fn line_kinds(&self) -> Vec<String> {
        self.lines()
            .filter_map(|line| serde_json::from_str::<serde_json::Value>(line).ok())
            .filter_map(|value| {
                value
                    .as_object()
                    .and_then(|object| object.keys().next().cloned())
            })
            .collect()
    }
}

/// Transport that records payloads instead of sending them
///
/// Clones share the same record, so a caller can keep a handle while the
/// sender owns another.
#[derive(Debug, Clone, Default)]
pub struct InMemoryTransport {
    payloads: Rc<RefCell<Vec<SentPayload>>>,
}

impl InMemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn payloads(&self) -> Vec<SentPayload> {
        self.payloads.borrow().clone()
    }

    pub fn payload_count(&self) -> usize {
        self.payloads.borrow().len()
    }
}

impl Transport for InMemoryTransport {
    fn send(&self, server_timeout: Duration, serialized_metadata: &str, serialized_events: &str) {
        self.payloads.borrow_mut().push(SentPayload {
            server_timeout,
            serialized_metadata: serialized_metadata.to_string(),
            serialized_events: serialized_events.to_string(),
        });
    }
}

/// Events produced by one transaction end (or by a span ending late)
#[derive(Debug, Clone, Copy, Default)]
pub struct EventBatch<'a> {
    pub spans: &'a [SpanData],
    pub errors: &'a [ErrorData],
    pub breakdown: Option<&'a PerTransaction>,
    pub transaction: Option<&'a TransactionData>,
}

/// Consumer of finished events
pub trait EventSink {
    fn consume(&mut self, batch: EventBatch<'_>);
}

/// Serialized payload ready for the transport
#[derive(Debug, Clone, PartialEq)]
pub struct SerializedPayload {
    pub metadata: String,
    pub events: String,
    pub line_count: usize,
}

/// Serializes batches and hands them to the transport
#[derive(Debug)]
pub struct EventSender {
    metadata: Metadata,
    user_agent_http_header: String,
    server_timeout: Duration,
    drop_events_before_send: bool,
    backend: BackendCapability,
}

impl EventSender {
    pub fn new(config: &AgentConfig, metadata: Metadata, backend: BackendCapability) -> Self {
        let user_agent_http_header = metadata.user_agent_http_header();
        Self {
            metadata,
            user_agent_http_header,
            server_timeout: config.server_timeout(),
            drop_events_before_send: config.drop_events_before_send,
            backend,
        }
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    /// Build the NDJSON payload for `batch`
    ///
    /// Breakdown metric sets are only rendered when the batch also carries
    /// its transaction, since every metric set needs the transaction's
    /// timestamp, name and type.
    pub fn serialize_batch(
        &self,
        batch: &EventBatch<'_>,
    ) -> Result<SerializedPayload, SerializationError> {
        let metadata = wrap_line("metadata", &self.metadata)?;
        let mut events = metadata.clone();
        let mut line_count = 1;

        let mut push_line = |events: &mut String, line: String| {
            events.push('\n');
            events.push_str(&line);
            line_count += 1;
        };

        for span in batch.spans {
            push_line(&mut events, wrap_line("span", span)?);
        }
        for error in batch.errors {
            push_line(&mut events, wrap_line("error", error)?);
        }
        if let (Some(breakdown), Some(transaction)) = (batch.breakdown, batch.transaction) {
            for metric_set in breakdown.metric_sets(transaction) {
                push_line(&mut events, wrap_line("metricset", &metric_set)?);
            }
        }
        if let Some(transaction) = batch.transaction {
            push_line(&mut events, wrap_line("transaction", transaction)?);
        }

        Ok(SerializedPayload {
            metadata,
            events,
            line_count,
        })
    }
}

impl EventSink for EventSender {
    fn consume(&mut self, batch: EventBatch<'_>) {
        let payload = match self.serialize_batch(&batch) {
            Ok(payload) => payload,
            Err(err) => {
                tracing::error!(
                    error = %err,
                    spans = batch.spans.len(),
                    errors = batch.errors.len(),
                    has_transaction = batch.transaction.is_some(),
                    "Failed to serialize events, dropping the batch"
                );
                return;
            }
        };

        if self.drop_events_before_send {
            tracing::debug!(
                line_count = payload.line_count,
                "Dropping events because drop_events_before_send is set"
            );
            return;
        }

        match &self.backend {
            BackendCapability::Unavailable => {
                tracing::debug!(
                    line_count = payload.line_count,
                    "Transport is not available, dropping events"
                );
            }
            BackendCapability::Loaded(transport) => {
                tracing::debug!(
                    user_agent = %self.user_agent_http_header,
                    line_count = payload.line_count,
                    bytes = payload.events.len(),
                    "Sending events to the transport"
                );
                transport.send(self.server_timeout, &payload.metadata, &payload.events);
            }
        }
    }
}

fn wrap_line<T>(key: &str, value: &T) -> Result<String, SerializationError>
where
    T: Serialize + Debug + ?Sized,
{
    Ok(format!("{{\"{}\":{}}}", key, serialize_as_json(value)?))
}
