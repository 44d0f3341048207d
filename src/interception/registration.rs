// Registration of intercepted functions and methods with their hooks

use super::{CallTracker, InstrumentationError, SpanCallTracker};
use crate::instrumentation::{CurlHook, MysqliHook, PdoHook};
use crate::intercepted::{InterceptedValue, ObjectHandle};
use crate::tracer::Tracer;
use std::fmt;

/// Index of a registration, handed to the native layer
pub type RegistrationId = usize;

/// Function or method whose calls are intercepted
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InterceptTarget {
    Function(String),
    Method { class_name: String, method_name: String },
}

impl InterceptTarget {
    /// Function and class/method names are matched case-insensitively
    pub fn matches(&self, other: &InterceptTarget) -> bool {
        match (self, other) {
            (InterceptTarget::Function(a), InterceptTarget::Function(b)) => {
                a.eq_ignore_ascii_case(b)
            }
            (
                InterceptTarget::Method {
                    class_name: class_a,
                    method_name: method_a,
                },
                InterceptTarget::Method {
                    class_name: class_b,
                    method_name: method_b,
                },
            ) => class_a.eq_ignore_ascii_case(class_b) && method_a.eq_ignore_ascii_case(method_b),
            _ => false,
        }
    }
}

impl fmt::Display for InterceptTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InterceptTarget::Function(name) => write!(f, "{}", name),
            InterceptTarget::Method {
                class_name,
                method_name,
            } => write!(f, "{}::{}", class_name, method_name),
        }
    }
}

/// Factory for call trackers outside the built-in instrumentations
pub trait CallTrackerFactory {
    fn on_call_begin(
        &self,
        tracer: &mut Tracer,
        this: Option<&ObjectHandle>,
        args: &[InterceptedValue],
    ) -> Result<Option<Box<dyn CallTracker>>, InstrumentationError>;
}

impl<F> CallTrackerFactory for F
where
    F: Fn(
        &mut Tracer,
        Option<&ObjectHandle>,
        &[InterceptedValue],
    ) -> Result<Option<Box<dyn CallTracker>>, InstrumentationError>,
{
    fn on_call_begin(
        &self,
        tracer: &mut Tracer,
        this: Option<&ObjectHandle>,
        args: &[InterceptedValue],
    ) -> Result<Option<Box<dyn CallTracker>>, InstrumentationError> {
        self(tracer, this, args)
    }
}

/// Wrap every call in a span with fixed classification
#[derive(Debug, Clone, PartialEq)]
pub struct SpanHook {
    pub name: String,
    pub span_type: String,
    pub subtype: Option<String>,
    pub action: Option<String>,
}

impl SpanHook {
    pub fn new(name: impl Into<String>, span_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            span_type: span_type.into(),
            subtype: None,
            action: None,
        }
    }

    pub fn with_subtype(mut self, subtype: impl Into<String>) -> Self {
        self.subtype = Some(subtype.into());
        self
    }

    pub fn with_action(mut self, action: impl Into<String>) -> Self {
        self.action = Some(action.into());
        self
    }
}

/// Hook selected at registration time, one variant per instrumented library
pub enum InterceptHook {
    Span(SpanHook),
    Pdo(PdoHook),
    Mysqli(MysqliHook),
    Curl(CurlHook),
    Custom(Box<dyn CallTrackerFactory>),
}

impl InterceptHook {
    /// Decide whether to track a call; `Ok(None)` declines
    pub fn on_call_begin(
        &self,
        tracer: &mut Tracer,
        this: Option<&ObjectHandle>,
        args: &[InterceptedValue],
    ) -> Result<Option<Box<dyn CallTracker>>, InstrumentationError> {
        match self {
            InterceptHook::Span(hook) => Ok(SpanCallTracker::boxed(tracer.begin_current_span(
                &hook.name,
                &hook.span_type,
                hook.subtype.as_deref(),
                hook.action.as_deref(),
            ))),
            InterceptHook::Pdo(hook) => hook.on_call_begin(tracer, this, args),
            InterceptHook::Mysqli(hook) => hook.on_call_begin(tracer, this, args),
            InterceptHook::Curl(hook) => hook.on_call_begin(tracer, args),
            InterceptHook::Custom(factory) => factory.on_call_begin(tracer, this, args),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            InterceptHook::Span(_) => "span",
            InterceptHook::Pdo(_) => "pdo",
            InterceptHook::Mysqli(_) => "mysqli",
            InterceptHook::Curl(_) => "curl",
            InterceptHook::Custom(_) => "custom",
        }
    }
}

impl fmt::Debug for InterceptHook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InterceptHook::Span(hook) => f.debug_tuple("Span").field(hook).finish(),
            InterceptHook::Pdo(hook) => f.debug_tuple("Pdo").field(hook).finish(),
            InterceptHook::Mysqli(hook) => f.debug_tuple("Mysqli").field(hook).finish(),
            InterceptHook::Curl(hook) => f.debug_tuple("Curl").field(hook).finish(),
            InterceptHook::Custom(_) => f.write_str("Custom"),
        }
    }
}

#[derive(Debug)]
pub struct InterceptRegistration {
    pub target: InterceptTarget,
    pub hook: InterceptHook,
}

/// Collects registrations before the interception manager is built
#[derive(Debug, Default)]
pub struct RegistrationContext {
    registrations: Vec<InterceptRegistration>,
}

impl RegistrationContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn intercept_calls_to_function(
        &mut self,
        function_name: &str,
        hook: InterceptHook,
    ) -> RegistrationId {
        self.register(InterceptTarget::Function(function_name.to_string()), hook)
    }

    pub fn intercept_calls_to_method(
        &mut self,
        class_name: &str,
        method_name: &str,
        hook: InterceptHook,
    ) -> RegistrationId {
        self.register(
            InterceptTarget::Method {
                class_name: class_name.to_string(),
                method_name: method_name.to_string(),
            },
            hook,
        )
    }

    fn register(&mut self, target: InterceptTarget, hook: InterceptHook) -> RegistrationId {
        let id = self.registrations.len();
        tracing::debug!(id, target = %target, hook = hook.kind(), "Registered interception");
        self.registrations.push(InterceptRegistration { target, hook });
        id
    }

    /// First registration for `target`
    pub fn find(&self, target: &InterceptTarget) -> Option<RegistrationId> {
        self.registrations
            .iter()
            .position(|registration| registration.target.matches(target))
    }

    /// Registered targets in registration id order
    pub fn targets(&self) -> impl Iterator<Item = &InterceptTarget> {
        self.registrations.iter().map(|registration| &registration.target)
    }

    pub fn len(&self) -> usize {
        self.registrations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registrations.is_empty()
    }

    pub fn into_registrations(self) -> Vec<InterceptRegistration> {
        self.registrations
    }
}
