//! Tracer: transaction and span lifecycle with self-time bookkeeping
//!
//! The tracer owns the current transaction together with one
//! [`SelfTimeTracker`] per open segment (the transaction itself and each open
//! span). A [`Span`] handle is owned by whoever began it, typically a call
//! tracker, until it is passed back to [`Tracer::end_span`].
//!
//! Segments are keyed by span id and linked to their parent by id, so spans
//! may end out of order. When a span ends while some of its children are
//! still open, the children are handed over to that span's own parent: the
//! ending span's tracker sees their `on_child_end` at its end time and the
//! new parent stays suspended until they end. Children still open when the
//! transaction ends are detached and later sent on their own.

use crate::breakdown::{PerTransaction, TRANSACTION_SPAN_TYPE};
use crate::clock::{calc_duration_in_microseconds, microseconds_to_milliseconds, Clock};
use crate::config::AgentConfig;
use crate::event_sender::{BackendCapability, EventBatch, EventSender, EventSink};
use crate::events::{
    generate_id, limit_keyword_string, limit_nullable_keyword_string, ErrorData, LabelValue,
    Outcome, SpanContextData, SpanCount, SpanData, TransactionData,
    EXECUTION_SEGMENT_ID_SIZE_IN_BYTES, TRACE_ID_SIZE_IN_BYTES,
};
use crate::intercepted::ThrowableInfo;
use crate::metadata::Metadata;
use crate::self_time::SelfTimeTracker;
use std::collections::HashMap;

/// Live span, exclusively owned until passed to [`Tracer::end_span`]
#[derive(Debug)]
pub struct Span {
    data: SpanData,
    system_begin: f64,
    monotonic_begin: f64,
    is_dropped: bool,
}

impl Span {
    pub fn id(&self) -> &str {
        &self.data.id
    }

    pub fn transaction_id(&self) -> &str {
        &self.data.transaction_id
    }

    pub fn parent_id(&self) -> &str {
        &self.data.parent_id
    }

    pub fn name(&self) -> &str {
        &self.data.name
    }

    pub fn set_name(&mut self, name: &str) {
        self.data.name = limit_keyword_string(name);
    }

    pub fn span_type(&self) -> &str {
        &self.data.span_type
    }

    pub fn subtype(&self) -> Option<&str> {
        self.data.subtype.as_deref()
    }

    pub fn set_subtype(&mut self, subtype: Option<&str>) {
        self.data.subtype = limit_nullable_keyword_string(subtype);
    }

    pub fn action(&self) -> Option<&str> {
        self.data.action.as_deref()
    }

    pub fn outcome(&self) -> Option<Outcome> {
        self.data.outcome
    }

    pub fn set_outcome(&mut self, outcome: Outcome) {
        self.data.outcome = Some(outcome);
    }

    pub fn set_label(&mut self, key: &str, value: impl Into<LabelValue>) {
        self.context_mut()
            .labels
            .insert(limit_keyword_string(key), value.into());
    }

    pub fn context(&self) -> Option<&SpanContextData> {
        self.data.context.as_ref()
    }

    pub fn context_mut(&mut self) -> &mut SpanContextData {
        self.data.context.get_or_insert_with(SpanContextData::default)
    }

    /// Dropped spans (over `transaction_max_spans`) still count toward
    /// breakdown metrics but are never sent
    pub fn is_dropped(&self) -> bool {
        self.is_dropped
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum ParentRef {
    Transaction,
    Span(String),
}

#[derive(Debug)]
struct OpenSegment {
    parent: ParentRef,
    self_time: Option<SelfTimeTracker>,
    /// Breakdown key as of span begin, used if the span is abandoned
    span_type: String,
    subtype: Option<String>,
}

/// Span stack position taken before control is handed to instrumentation
///
/// See [`Tracer::abandon_spans_since`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpanStackMark {
    transaction_id: Option<String>,
    depth: usize,
}

#[derive(Debug)]
struct ActiveTransaction {
    data: TransactionData,
    system_begin: f64,
    monotonic_begin: f64,
    self_time: Option<SelfTimeTracker>,
    open_spans: HashMap<String, OpenSegment>,
    span_stack: Vec<String>,
    ended_spans: Vec<SpanData>,
    errors: Vec<ErrorData>,
    breakdown: Option<PerTransaction>,
}

impl ActiveTransaction {
    fn parent_self_time(&mut self, parent: &ParentRef) -> Option<&mut SelfTimeTracker> {
        match parent {
            ParentRef::Transaction => self.self_time.as_mut(),
            ParentRef::Span(id) => self
                .open_spans
                .get_mut(id)
                .and_then(|segment| segment.self_time.as_mut()),
        }
    }

    /// Settle the self time of a span segment that was just removed from
    /// `open_spans` and let its parent resume timing
    fn close_segment(
        &mut self,
        id: &str,
        segment: OpenSegment,
        span_type: &str,
        subtype: Option<&str>,
        now: f64,
    ) {
        let mut own_self_time = segment.self_time;
        let moved = reparent_children(
            &mut self.open_spans,
            &ParentRef::Span(id.to_string()),
            Some(&segment.parent),
            own_self_time.as_mut(),
            now,
        );
        if let Some(mut tracker) = own_self_time {
            tracker.end(now);
            if let Some(breakdown) = self.breakdown.as_mut() {
                breakdown.add_span_self_time(
                    span_type,
                    subtype,
                    tracker.accumulated_self_time_in_microseconds(),
                );
            }
        }
        if let Some(parent_tracker) = self.parent_self_time(&segment.parent) {
            // adopt the moved children while this span still suspends the parent
            for _ in 0..moved {
                parent_tracker.on_child_begin(now);
            }
            parent_tracker.on_child_end(now);
        }
    }
}

/// Hand the open children of an ending segment over to `new_parent`
///
/// Each child's share of the ending segment's self-time accounting ends at
/// `now`. With no new parent the children are only counted as ended for the
/// ending segment. Returns how many children were found.
fn reparent_children(
    open_spans: &mut HashMap<String, OpenSegment>,
    ending: &ParentRef,
    new_parent: Option<&ParentRef>,
    mut ending_self_time: Option<&mut SelfTimeTracker>,
    now: f64,
) -> usize {
    let mut moved = 0;
    for (id, segment) in open_spans.iter_mut().filter(|(_, s)| s.parent == *ending) {
        if let Some(tracker) = ending_self_time.as_deref_mut() {
            tracker.on_child_end(now);
        }
        if let Some(new_parent) = new_parent {
            segment.parent = new_parent.clone();
            tracing::debug!(
                span_id = %id,
                new_parent = ?new_parent,
                "Moved open child span away from its ending parent"
            );
        }
        moved += 1;
    }
    moved
}

/// Owner of the current transaction and its open segments
pub struct Tracer {
    config: AgentConfig,
    clock: Box<dyn Clock>,
    sink: Box<dyn EventSink>,
    current_transaction: Option<ActiveTransaction>,
}

impl Tracer {
    pub fn new(config: AgentConfig, clock: Box<dyn Clock>, sink: Box<dyn EventSink>) -> Self {
        Self {
            config,
            clock,
            sink,
            current_transaction: None,
        }
    }

    /// Tracer sending through an [`EventSender`] with metadata of this process
    pub fn with_backend(
        config: AgentConfig,
        clock: Box<dyn Clock>,
        backend: BackendCapability,
    ) -> Self {
        let sender = EventSender::new(&config, Metadata::discover(&config), backend);
        Self::new(config, clock, Box::new(sender))
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    fn now(&self) -> (f64, f64) {
        (
            self.clock.system_clock_current_time(),
            self.clock.monotonic_clock_current_time(),
        )
    }

    pub fn current_transaction(&self) -> Option<&TransactionData> {
        self.current_transaction.as_ref().map(|t| &t.data)
    }

    /// Mutable access for name/result/outcome/labels of the running transaction
    pub fn current_transaction_mut(&mut self) -> Option<&mut TransactionData> {
        self.current_transaction.as_mut().map(|t| &mut t.data)
    }

    /// Id of the innermost open span, if any
    pub fn current_span_id(&self) -> Option<&str> {
        self.current_transaction
            .as_ref()
            .and_then(|t| t.span_stack.last())
            .map(String::as_str)
    }

    /// Start a new transaction, ending the previous one if still open
    pub fn begin_transaction(&mut self, name: &str, transaction_type: &str) -> String {
        if let Some(previous) = self.current_transaction.as_ref() {
            tracing::warn!(
                previous_id = %previous.data.id,
                "Beginning a new transaction while another one is still open - ending it"
            );
            self.end_current_transaction();
        }

        let (system_begin, monotonic_begin) = self.now();
        let breakdown_enabled = self.config.breakdown_metrics;
        let data = TransactionData {
            name: limit_keyword_string(name),
            transaction_type: limit_keyword_string(transaction_type),
            id: generate_id(EXECUTION_SEGMENT_ID_SIZE_IN_BYTES),
            trace_id: generate_id(TRACE_ID_SIZE_IN_BYTES),
            parent_id: None,
            timestamp: system_begin,
            duration: 0.0,
            outcome: None,
            result: None,
            sampled: true,
            span_count: SpanCount::default(),
            context: None,
        };
        tracing::debug!(id = %data.id, transaction_name = %data.name, "Transaction began");
        let id = data.id.clone();

        self.current_transaction = Some(ActiveTransaction {
            data,
            system_begin,
            monotonic_begin,
            self_time: breakdown_enabled.then(|| SelfTimeTracker::new(monotonic_begin)),
            open_spans: HashMap::new(),
            span_stack: Vec::new(),
            ended_spans: Vec::new(),
            errors: Vec::new(),
            breakdown: breakdown_enabled.then(PerTransaction::new),
        });
        id
    }

    /// Open a span as a child of the innermost open span (or the transaction)
    ///
    /// Returns `None` when there is no current transaction.
    pub fn begin_current_span(
        &mut self,
        name: &str,
        span_type: &str,
        subtype: Option<&str>,
        action: Option<&str>,
    ) -> Option<Span> {
        let (system_begin, monotonic_begin) = self.now();
        let max_spans = self.config.transaction_max_spans;
        let Some(transaction) = self.current_transaction.as_mut() else {
            tracing::debug!(span_name = name, "No current transaction - span is not started");
            return None;
        };

        let parent = match transaction.span_stack.last() {
            Some(id) if transaction.open_spans.contains_key(id) => ParentRef::Span(id.clone()),
            _ => ParentRef::Transaction,
        };
        let parent_id = match &parent {
            ParentRef::Span(id) => id.clone(),
            _ => transaction.data.id.clone(),
        };

        let is_dropped = transaction.data.span_count.started >= max_spans;
        if is_dropped {
            transaction.data.span_count.dropped += 1;
        } else {
            transaction.data.span_count.started += 1;
        }

        let self_time = if transaction.breakdown.is_some() {
            if let Some(parent_tracker) = transaction.parent_self_time(&parent) {
                parent_tracker.on_child_begin(monotonic_begin);
            }
            Some(SelfTimeTracker::new(monotonic_begin))
        } else {
            None
        };

        let data = SpanData {
            name: limit_keyword_string(name),
            span_type: limit_keyword_string(span_type),
            subtype: limit_nullable_keyword_string(subtype),
            action: limit_nullable_keyword_string(action),
            id: generate_id(EXECUTION_SEGMENT_ID_SIZE_IN_BYTES),
            transaction_id: transaction.data.id.clone(),
            trace_id: transaction.data.trace_id.clone(),
            parent_id,
            timestamp: system_begin,
            duration: 0.0,
            outcome: None,
            context: None,
        };
        tracing::debug!(
            id = %data.id,
            span_name = %data.name,
            parent_id = %data.parent_id,
            is_dropped,
            "Span began"
        );

        transaction.open_spans.insert(
            data.id.clone(),
            OpenSegment {
                parent,
                self_time,
                span_type: data.span_type.clone(),
                subtype: data.subtype.clone(),
            },
        );
        transaction.span_stack.push(data.id.clone());

        Some(Span {
            data,
            system_begin,
            monotonic_begin,
            is_dropped,
        })
    }

    /// Finish `span`: compute its duration, settle self time, and queue it
    ///
    /// A span whose transaction has already ended is sent in a batch of its
    /// own and contributes nothing to breakdown metrics.
    pub fn end_span(&mut self, span: Span) {
        let (system_end, monotonic_end) = self.now();
        let Span {
            mut data,
            system_begin,
            monotonic_begin,
            is_dropped,
        } = span;
        data.duration = microseconds_to_milliseconds(calc_duration_in_microseconds(
            system_begin,
            monotonic_begin,
            system_end,
            monotonic_end,
        ));
        if data.context.as_ref().is_some_and(SpanContextData::is_empty) {
            data.context = None;
        }
        tracing::debug!(
            id = %data.id,
            span_name = %data.name,
            duration_ms = data.duration,
            "Span ended"
        );

        let transaction = match self.current_transaction.as_mut() {
            Some(transaction) if transaction.data.id == data.transaction_id => transaction,
            _ => {
                tracing::debug!(
                    id = %data.id,
                    transaction_id = %data.transaction_id,
                    "Span ended after its transaction - sending it on its own"
                );
                if !is_dropped {
                    self.sink.consume(EventBatch {
                        spans: std::slice::from_ref(&data),
                        ..EventBatch::default()
                    });
                }
                return;
            }
        };

        match transaction.span_stack.iter().rposition(|id| *id == data.id) {
            Some(position) if position + 1 == transaction.span_stack.len() => {
                transaction.span_stack.pop();
            }
            Some(position) => {
                tracing::warn!(id = %data.id, "Span ended out of order");
                transaction.span_stack.remove(position);
            }
            None => tracing::warn!(id = %data.id, "Ended span is not on the span stack"),
        }

        if let Some(segment) = transaction.open_spans.remove(&data.id) {
            transaction.close_segment(
                &data.id,
                segment,
                &data.span_type,
                data.subtype.as_deref(),
                monotonic_end,
            );
        } else {
            tracing::warn!(id = %data.id, "Ended span has no open segment - ended twice?");
        }

        if !is_dropped {
            transaction.ended_spans.push(data);
        }
    }

    pub fn span_stack_mark(&self) -> SpanStackMark {
        SpanStackMark {
            transaction_id: self.current_transaction.as_ref().map(|t| t.data.id.clone()),
            depth: self.current_transaction.as_ref().map_or(0, |t| t.span_stack.len()),
        }
    }

    /// Close every span opened after `mark` that is still open
    ///
    /// Used when the owner of those spans is gone (an instrumentation failed
    /// between begin and end). Abandoned spans are never sent, but their self
    /// time counts toward breakdown metrics and their parents resume timing.
    /// Does nothing if the transaction changed since `mark` was taken.
    /// Returns how many spans were abandoned.
    pub fn abandon_spans_since(&mut self, mark: &SpanStackMark) -> usize {
        let (_, monotonic_end) = self.now();
        let Some(transaction) = self.current_transaction.as_mut() else {
            return 0;
        };
        if mark.transaction_id.as_deref() != Some(transaction.data.id.as_str()) {
            return 0;
        }

        let mut abandoned = 0;
        while transaction.span_stack.len() > mark.depth {
            let Some(id) = transaction.span_stack.pop() else {
                break;
            };
            let Some(segment) = transaction.open_spans.remove(&id) else {
                continue;
            };
            tracing::warn!(id = %id, "Abandoning span left open by a failed instrumentation");
            let span_type = segment.span_type.clone();
            let subtype = segment.subtype.clone();
            transaction.close_segment(&id, segment, &span_type, subtype.as_deref(), monotonic_end);
            abandoned += 1;
        }
        abandoned
    }

    /// Record an error event for `throwable`, parented to `span` if given
    /// or to the current transaction otherwise
    pub fn capture_throwable(&mut self, throwable: &ThrowableInfo, span: Option<&Span>) {
        let (timestamp, _) = self.now();
        let Some(transaction) = self.current_transaction.as_mut() else {
            if let Some(span) = span {
                let error = ErrorData::from_throwable(
                    throwable,
                    timestamp,
                    &span.data.trace_id,
                    span.transaction_id(),
                    span.id(),
                );
                self.sink.consume(EventBatch {
                    errors: std::slice::from_ref(&error),
                    ..EventBatch::default()
                });
            } else {
                tracing::debug!(
                    class = %throwable.class_name,
                    "No current transaction - error is not captured"
                );
            }
            return;
        };

        let (trace_id, transaction_id, parent_id) = match span {
            Some(span) => (
                span.data.trace_id.as_str(),
                span.transaction_id(),
                span.id(),
            ),
            None => (
                transaction.data.trace_id.as_str(),
                transaction.data.id.as_str(),
                transaction.data.id.as_str(),
            ),
        };
        let error =
            ErrorData::from_throwable(throwable, timestamp, trace_id, transaction_id, parent_id);
        tracing::debug!(id = %error.id, class = %throwable.class_name, "Error captured");
        transaction.errors.push(error);
    }

    /// End the current transaction and send everything it collected
    ///
    /// Does nothing when no transaction is open.
    pub fn end_current_transaction(&mut self) {
        let (system_end, monotonic_end) = self.now();
        let Some(mut transaction) = self.current_transaction.take() else {
            tracing::debug!("No current transaction to end");
            return;
        };

        reparent_children(
            &mut transaction.open_spans,
            &ParentRef::Transaction,
            None,
            transaction.self_time.as_mut(),
            monotonic_end,
        );
        if !transaction.open_spans.is_empty() {
            tracing::debug!(
                open_spans = transaction.open_spans.len(),
                "Transaction ended with spans still open"
            );
        }
        if let (Some(tracker), Some(breakdown)) =
            (transaction.self_time.as_mut(), transaction.breakdown.as_mut())
        {
            tracker.end(monotonic_end);
            breakdown.add_span_self_time(
                TRANSACTION_SPAN_TYPE,
                None,
                tracker.accumulated_self_time_in_microseconds(),
            );
        }

        transaction.data.duration = microseconds_to_milliseconds(calc_duration_in_microseconds(
            transaction.system_begin,
            transaction.monotonic_begin,
            system_end,
            monotonic_end,
        ));
        if transaction.data.context.as_ref().is_some_and(|c| c.labels.is_empty()) {
            transaction.data.context = None;
        }
        tracing::debug!(
            id = %transaction.data.id,
            duration_ms = transaction.data.duration,
            spans = transaction.ended_spans.len(),
            errors = transaction.errors.len(),
            "Transaction ended"
        );

        self.sink.consume(EventBatch {
            spans: &transaction.ended_spans,
            errors: &transaction.errors,
            breakdown: transaction.breakdown.as_ref(),
            transaction: Some(&transaction.data),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::event_sender::InMemoryTransport;
    use crate::intercepted::RawText;

    fn tracer_with(config: AgentConfig) -> (Tracer, ManualClock, InMemoryTransport) {
        let clock = ManualClock::starting_at(1_700_000_000_000_000.0);
        let transport = InMemoryTransport::new();
        let tracer = Tracer::with_backend(
            config,
            Box::new(clock.clone()),
            BackendCapability::Loaded(Box::new(transport.clone())),
        );
        (tracer, clock, transport)
    }

    fn lines(transport: &InMemoryTransport, index: usize) -> Vec<serde_json::Value> {
        transport.payloads()[index]
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect()
    }

    /// Self-time sum per (type, subtype) from the metricset lines
    fn self_time_sums(lines: &[serde_json::Value]) -> Vec<(String, Option<String>, f64)> {
        lines
            .iter()
            .filter_map(|line| line.get("metricset"))
            .filter(|metric_set| metric_set.get("span").is_some())
            .map(|metric_set| {
                (
                    metric_set["span"]["type"].as_str().unwrap().to_string(),
                    metric_set["span"]["subtype"].as_str().map(str::to_string),
                    metric_set["samples"]["span.self_time.sum.us"]["value"]
                        .as_f64()
                        .unwrap(),
                )
            })
            .collect()
    }

    #[test]
    fn test_nested_spans_breakdown_sums_to_duration() {
        let (mut tracer, clock, transport) = tracer_with(AgentConfig::default());
        tracer.begin_transaction("GET /", "request");
        clock.advance(10.0);
        let outer = tracer
            .begin_current_span("outer", "db", Some("mysql"), Some("query"))
            .unwrap();
        clock.advance(10.0);
        let inner = tracer.begin_current_span("inner", "external", Some("http"), None).unwrap();
        assert_eq!(inner.parent_id(), outer.id());
        clock.advance(20.0);
        tracer.end_span(inner);
        clock.advance(20.0);
        tracer.end_span(outer);
        clock.advance(40.0);
        tracer.end_current_transaction();

        let lines = lines(&transport, 0);
        let sums = self_time_sums(&lines);
        assert_eq!(
            sums,
            vec![
                ("app".to_string(), None, 50.0),
                ("db".to_string(), Some("mysql".to_string()), 30.0),
                ("external".to_string(), Some("http".to_string()), 20.0),
            ]
        );
        let transaction = &lines.last().unwrap()["transaction"];
        assert_eq!(transaction["duration"], 0.1);
        assert_eq!(transaction["span_count"]["started"], 2);
    }

    #[test]
    fn test_span_parented_to_transaction_without_open_span() {
        let (mut tracer, _clock, _) = tracer_with(AgentConfig::default());
        let transaction_id = tracer.begin_transaction("job", "cli");
        let span = tracer.begin_current_span("s", "app", None, None).unwrap();
        assert_eq!(span.parent_id(), transaction_id);
        assert_eq!(tracer.current_span_id(), Some(span.id()));
        tracer.end_span(span);
        assert_eq!(tracer.current_span_id(), None);
    }

    #[test]
    fn test_no_transaction_declines_span() {
        let (mut tracer, _, _) = tracer_with(AgentConfig::default());
        assert!(tracer.begin_current_span("s", "db", None, None).is_none());
    }

    #[test]
    fn test_parent_ending_first_hands_child_to_grandparent() {
        let (mut tracer, clock, transport) = tracer_with(AgentConfig::default());
        tracer.begin_transaction("t", "request");
        let parent = tracer.begin_current_span("parent", "db", None, None).unwrap();
        clock.advance(10.0);
        let child = tracer.begin_current_span("child", "cache", None, None).unwrap();
        clock.advance(10.0);
        tracer.end_span(parent);
        clock.advance(30.0);
        tracer.end_span(child);
        clock.advance(5.0);
        tracer.end_current_transaction();

        let sums = self_time_sums(&lines(&transport, 0));
        // parent: 10 until the child began; the child is adopted by the
        // transaction, which only resumes timing when the child ends at 50
        assert_eq!(
            sums,
            vec![
                ("app".to_string(), None, 5.0),
                ("cache".to_string(), None, 40.0),
                ("db".to_string(), None, 10.0),
            ]
        );
    }

    #[test]
    fn test_span_ending_after_transaction_is_sent_alone() {
        let (mut tracer, clock, transport) = tracer_with(AgentConfig::default());
        tracer.begin_transaction("t", "request");
        let span = tracer.begin_current_span("late", "db", None, None).unwrap();
        clock.advance(10.0);
        tracer.end_current_transaction();
        clock.advance(10.0);
        tracer.end_span(span);

        assert_eq!(transport.payload_count(), 2);
        assert_eq!(transport.payloads()[1].line_kinds(), vec!["metadata", "span"]);
        let first = lines(&transport, 0);
        assert!(first.iter().all(|line| line.get("span").is_none()));
    }

    #[test]
    fn test_transaction_max_spans_drops_extra_spans() {
        let config = AgentConfig {
            transaction_max_spans: 1,
            ..AgentConfig::default()
        };
        let (mut tracer, clock, transport) = tracer_with(config);
        tracer.begin_transaction("t", "request");
        for _ in 0..3 {
            let span = tracer.begin_current_span("s", "db", None, None).unwrap();
            clock.advance(5.0);
            tracer.end_span(span);
        }
        tracer.end_current_transaction();

        let lines = lines(&transport, 0);
        assert_eq!(lines.iter().filter(|l| l.get("span").is_some()).count(), 1);
        let transaction = &lines.last().unwrap()["transaction"];
        assert_eq!(transaction["span_count"]["started"], 1);
        assert_eq!(transaction["span_count"]["dropped"], 2);
        let db_count = lines
            .iter()
            .filter_map(|l| l.get("metricset"))
            .find(|m| m["span"]["type"] == "db")
            .map(|m| m["samples"]["span.self_time.count"]["value"].clone())
            .unwrap();
        assert_eq!(db_count, 3);
    }

    #[test]
    fn test_breakdown_disabled_emits_no_metric_sets() {
        let config = AgentConfig {
            breakdown_metrics: false,
            ..AgentConfig::default()
        };
        let (mut tracer, _, transport) = tracer_with(config);
        tracer.begin_transaction("t", "request");
        let span = tracer.begin_current_span("s", "db", None, None).unwrap();
        tracer.end_span(span);
        tracer.end_current_transaction();
        assert_eq!(
            transport.payloads()[0].line_kinds(),
            vec!["metadata", "span", "transaction"]
        );
    }

    #[test]
    fn test_capture_throwable_is_queued_with_transaction() {
        let (mut tracer, _, transport) = tracer_with(AgentConfig::default());
        tracer.begin_transaction("t", "request");
        let span = tracer.begin_current_span("s", "db", None, None).unwrap();
        tracer.capture_throwable(&ThrowableInfo::new("RuntimeException", "boom"), Some(&span));
        let span_id = span.id().to_string();
        tracer.end_span(span);
        tracer.end_current_transaction();

        let lines = lines(&transport, 0);
        let error = lines.iter().find_map(|l| l.get("error")).unwrap();
        assert_eq!(error["parent_id"], span_id.as_str());
        assert_eq!(error["exception"]["type"], "RuntimeException");
        assert_eq!(
            transport.payloads()[0].line_kinds(),
            vec!["metadata", "span", "error", "metricset", "metricset", "metricset", "transaction"]
        );
    }

    #[test]
    fn test_labels_are_sent_as_tags() {
        let (mut tracer, _, transport) = tracer_with(AgentConfig::default());
        tracer.begin_transaction("t", "request");
        let transaction = tracer.current_transaction_mut().unwrap();
        transaction.set_label("region", "eu-west");
        transaction.set_label("retries", 2i64);
        let mut span = tracer.begin_current_span("s", "db", None, None).unwrap();
        span.set_label("cached", true);
        span.set_label("ratio", 0.25);
        span.set_label("shard", RawText::from("s-7"));
        tracer.end_span(span);
        tracer.end_current_transaction();

        let lines = lines(&transport, 0);
        let span = lines.iter().find_map(|l| l.get("span")).unwrap();
        assert_eq!(
            span["context"]["tags"],
            serde_json::json!({"cached": true, "ratio": 0.25, "shard": "s-7"})
        );
        let transaction = &lines.last().unwrap()["transaction"];
        assert_eq!(
            transaction["context"]["tags"],
            serde_json::json!({"region": "eu-west", "retries": 2})
        );
    }

    #[test]
    fn test_invalid_utf8_label_drops_the_batch() {
        let (mut tracer, _, transport) = tracer_with(AgentConfig::default());
        tracer.begin_transaction("t", "request");
        tracer
            .current_transaction_mut()
            .unwrap()
            .set_label("raw", RawText::from_bytes(vec![b'a', 0xc3]));
        tracer.end_current_transaction();
        assert_eq!(transport.payload_count(), 0);

        tracer.begin_transaction("next", "request");
        let mut span = tracer.begin_current_span("s", "db", None, None).unwrap();
        span.set_label("raw", RawText::from_bytes(vec![0xff]));
        tracer.end_span(span);
        tracer.end_current_transaction();
        assert_eq!(transport.payload_count(), 0);

        tracer.begin_transaction("clean", "request");
        tracer.end_current_transaction();
        assert_eq!(transport.payload_count(), 1);
    }

    #[test]
    fn test_abandon_spans_since_mark() {
        let (mut tracer, clock, transport) = tracer_with(AgentConfig::default());
        tracer.begin_transaction("t", "request");
        let outer = tracer.begin_current_span("outer", "db", None, None).unwrap();
        let mark = tracer.span_stack_mark();
        clock.advance(10.0);
        let _lost = tracer.begin_current_span("lost", "cache", None, None).unwrap();
        let _lost_child = tracer.begin_current_span("lost child", "cache", None, None).unwrap();
        clock.advance(10.0);

        assert_eq!(tracer.abandon_spans_since(&mark), 2);
        assert_eq!(tracer.current_span_id(), Some(outer.id()));
        assert_eq!(tracer.abandon_spans_since(&mark), 0);
        clock.advance(10.0);
        tracer.end_span(outer);
        tracer.end_current_transaction();

        let lines = lines(&transport, 0);
        assert_eq!(lines.iter().filter(|l| l.get("span").is_some()).count(), 1);
        // outer timed 10 before and 10 after the abandoned spans
        assert_eq!(
            self_time_sums(&lines),
            vec![
                ("app".to_string(), None, 0.0),
                ("cache".to_string(), None, 10.0),
                ("db".to_string(), None, 20.0),
            ]
        );
    }

    #[test]
    fn test_abandon_ignores_mark_of_another_transaction() {
        let (mut tracer, _, _) = tracer_with(AgentConfig::default());
        tracer.begin_transaction("first", "request");
        let mark = tracer.span_stack_mark();
        tracer.end_current_transaction();
        tracer.begin_transaction("second", "request");
        let _span = tracer.begin_current_span("s", "db", None, None).unwrap();
        assert_eq!(tracer.abandon_spans_since(&mark), 0);
        assert!(tracer.current_span_id().is_some());
    }

    #[test]
    fn test_breakdown_count_metric_set_is_last_before_transaction() {
        let (mut tracer, _, transport) = tracer_with(AgentConfig::default());
        tracer.begin_transaction("t", "request");
        tracer.end_current_transaction();
        let lines = lines(&transport, 0);
        let last_metric_set = lines.iter().filter_map(|l| l.get("metricset")).last().unwrap();
        assert_eq!(
            last_metric_set["samples"]["transaction.breakdown.count"]["value"],
            serde_json::json!(1)
        );
    }
}
