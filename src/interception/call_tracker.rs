// Per-call trackers opened by pre_hook and finished by post_hook

use super::InstrumentationError;
use crate::events::Outcome;
use crate::intercepted::InterceptedValue;
use crate::tracer::{Span, Tracer};

/// Tracks one intercepted call from begin to end
///
/// A tracker exists only if its span (if any) is already open. Exactly one of
/// the two end methods is called, consuming the tracker. Both observe the
/// call's result by reference: the value itself goes back to the caller
/// untouched.
pub trait CallTracker {
    fn on_call_normal_end(
        self: Box<Self>,
        tracer: &mut Tracer,
        return_value: &InterceptedValue,
    ) -> Result<(), InstrumentationError>;

    fn on_call_end_by_exception(
        self: Box<Self>,
        tracer: &mut Tracer,
        thrown: &InterceptedValue,
    ) -> Result<(), InstrumentationError>;
}

/// Close `span` for a finished call
///
/// Sets the outcome (success, or failure when the call threw), records an
/// error event for a thrown object, then ends the span.
pub fn end_span_for_call(
    tracer: &mut Tracer,
    mut span: Span,
    has_exited_by_exception: bool,
    return_value_or_thrown: &InterceptedValue,
) {
    if has_exited_by_exception {
        span.set_outcome(Outcome::Failure);
        if let Some(throwable) = return_value_or_thrown.as_throwable() {
            tracer.capture_throwable(throwable, Some(&span));
        }
    } else {
        span.set_outcome(Outcome::Success);
    }
    tracer.end_span(span);
}

/// Tracker that only owns a span
#[derive(Debug)]
pub struct SpanCallTracker {
    span: Span,
}

impl SpanCallTracker {
    pub fn new(span: Span) -> Self {
        Self { span }
    }

    /// Box a tracker for `span`, or decline tracking when no span was opened
    pub fn boxed(span: Option<Span>) -> Option<Box<dyn CallTracker>> {
        span.map(|span| Box::new(Self::new(span)) as Box<dyn CallTracker>)
    }
}

impl CallTracker for SpanCallTracker {
    fn on_call_normal_end(
        self: Box<Self>,
        tracer: &mut Tracer,
        return_value: &InterceptedValue,
    ) -> Result<(), InstrumentationError> {
        end_span_for_call(tracer, self.span, false, return_value);
        Ok(())
    }

    fn on_call_end_by_exception(
        self: Box<Self>,
        tracer: &mut Tracer,
        thrown: &InterceptedValue,
    ) -> Result<(), InstrumentationError> {
        end_span_for_call(tracer, self.span, true, thrown);
        Ok(())
    }
}
