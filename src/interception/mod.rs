// Interception boundary: the callback contract of the native layer
//
// The native layer intercepts calls to registered functions and methods and
// reports them through InterceptionManager::pre_hook / post_hook. A hook
// selected at registration time decides in pre_hook whether to track a call
// by returning a CallTracker that has already opened its span; the tracker
// is then finished by the matching post_hook.
//
// Faults inside instrumentation (errors and panics) are suppressed at this
// boundary. Values produced by the intercepted call itself are always handed
// back unchanged.

mod call_tracker;
mod manager;
mod registration;

pub use call_tracker::{end_span_for_call, CallTracker, SpanCallTracker};
pub use manager::InterceptionManager;
pub use registration::{
    CallTrackerFactory, InterceptHook, InterceptRegistration, InterceptTarget,
    RegistrationContext, RegistrationId, SpanHook,
};

use thiserror::Error;

/// Fault inside hook bookkeeping; never propagated to the intercepted code
#[derive(Error, Debug, Clone, PartialEq)]
pub enum InstrumentationError {
    #[error("{function}: expected at least {expected} arguments, got {actual}")]
    MissingArgument {
        function: String,
        expected: usize,
        actual: usize,
    },

    #[error("{function}: expected {expected} value, got {actual}")]
    UnexpectedValueType {
        function: String,
        expected: &'static str,
        actual: &'static str,
    },

    #[error("{function}: `this` is not an instance of {expected_class}")]
    UnexpectedThis {
        function: String,
        expected_class: &'static str,
    },

    #[error("Instrumentation panicked: {0}")]
    Panicked(String),
}
