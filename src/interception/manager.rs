// Entry points called by the native interception layer

use super::{
    CallTracker, InstrumentationError, InterceptRegistration, RegistrationContext, RegistrationId,
};
use crate::intercepted::{InterceptedValue, ObjectHandle};
use crate::tracer::{SpanStackMark, Tracer};
use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};

struct CallInProgress {
    registration_id: RegistrationId,
    tracker: Box<dyn CallTracker>,
    /// Span stack before the hook ran
    span_mark: SpanStackMark,
}

/// Dispatches pre/post hooks to registered instrumentations
///
/// Calls whose pre_hook returned `true` form a stack: the native layer
/// reports the end of the innermost call first, so nested intercepted calls
/// are matched up without any call ids.
///
/// Spans a failing hook or tracker leaves open are abandoned, so later spans
/// never get a parent that is not sent.
pub struct InterceptionManager {
    tracer: Tracer,
    registrations: Vec<InterceptRegistration>,
    calls_in_progress: Vec<CallInProgress>,
}

impl InterceptionManager {
    pub fn new(tracer: Tracer, registration_context: RegistrationContext) -> Self {
        let registrations = registration_context.into_registrations();
        tracing::debug!(registrations = registrations.len(), "Interception manager created");
        Self {
            tracer,
            registrations,
            calls_in_progress: Vec::new(),
        }
    }

    pub fn tracer(&self) -> &Tracer {
        &self.tracer
    }

    pub fn tracer_mut(&mut self) -> &mut Tracer {
        &mut self.tracer
    }

    pub fn calls_in_progress(&self) -> usize {
        self.calls_in_progress.len()
    }

    /// An intercepted call is about to run
    ///
    /// Returns `true` if `post_hook` must be called when the call ends. Never
    /// fails: instrumentation errors and panics are logged and the call is
    /// left untracked.
    pub fn pre_hook(
        &mut self,
        registration_id: RegistrationId,
        this: Option<&ObjectHandle>,
        args: &[InterceptedValue],
    ) -> bool {
        tracing::trace!(
            registration_id,
            this_class = this.map(|object| object.class_name.as_str()),
            args_count = args.len(),
            "pre_hook entered"
        );

        let Some(registration) = self.registrations.get(registration_id) else {
            tracing::error!(registration_id, "There is no registration with the given id");
            return false;
        };

        let span_mark = self.tracer.span_stack_mark();
        let tracer = &mut self.tracer;
        let outcome = catch_unwind(AssertUnwindSafe(|| {
            registration.hook.on_call_begin(tracer, this, args)
        }))
        .unwrap_or_else(|payload| Err(InstrumentationError::Panicked(panic_message(payload))));

        match outcome {
            Ok(Some(tracker)) => {
                self.calls_in_progress.push(CallInProgress {
                    registration_id,
                    tracker,
                    span_mark,
                });
                tracing::trace!(
                    registration_id,
                    target = %registration.target,
                    "pre_hook is tracking the call"
                );
                true
            }
            Ok(None) => {
                tracing::trace!(
                    registration_id,
                    target = %registration.target,
                    "pre_hook declined the call"
                );
                false
            }
            Err(err) => {
                tracing::error!(
                    registration_id,
                    target = %registration.target,
                    error = %err,
                    "pre_hook has let an error escape"
                );
                self.tracer.abandon_spans_since(&span_mark);
                false
            }
        }
    }

    /// The innermost tracked call ended
    ///
    /// `return_value_or_thrown` is the call's return value, or the thrown
    /// object when `has_exited_by_exception` is set. It is always returned
    /// unchanged, whatever happens inside the instrumentation.
    pub fn post_hook(
        &mut self,
        has_exited_by_exception: bool,
        return_value_or_thrown: InterceptedValue,
    ) -> InterceptedValue {
        tracing::trace!(
            has_exited_by_exception,
            value_type = return_value_or_thrown.type_name(),
            "post_hook entered"
        );

        let Some(CallInProgress {
            registration_id,
            tracker,
            span_mark,
        }) = self.calls_in_progress.pop()
        else {
            tracing::error!("There is no intercepted call in progress");
            return return_value_or_thrown;
        };

        let tracer = &mut self.tracer;
        let value = &return_value_or_thrown;
        let result = catch_unwind(AssertUnwindSafe(move || {
            if has_exited_by_exception {
                tracker.on_call_end_by_exception(tracer, value)
            } else {
                tracker.on_call_normal_end(tracer, value)
            }
        }))
        .unwrap_or_else(|payload| Err(InstrumentationError::Panicked(panic_message(payload))));

        if let Err(err) = result {
            tracing::error!(
                registration_id,
                error = %err,
                "post_hook has let an error escape"
            );
            self.tracer.abandon_spans_since(&span_mark);
        }
        return_value_or_thrown
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
