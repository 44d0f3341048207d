// curl HTTP client instrumentation
//
// curl_init / curl_copy_handle start tracking a handle, curl_setopt and
// curl_setopt_array record its URL and HTTP method, curl_exec wraps the
// request in an `external` span and curl_close forgets the handle.

use super::{HandleMap, SPAN_SUBTYPE_HTTP, SPAN_TYPE_EXTERNAL};
use crate::events::HttpContext;
use crate::intercepted::{InterceptedValue, RawText};
use crate::interception::{
    CallTracker, InstrumentationError, InterceptHook, RegistrationContext, SpanCallTracker,
};
use crate::tracer::Tracer;
use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;
use url::Url;

pub const CURLOPT_NOBODY: i64 = 44;
pub const CURLOPT_POST: i64 = 47;
pub const CURLOPT_PUT: i64 = 54;
pub const CURLOPT_HTTPGET: i64 = 80;
pub const CURLOPT_URL: i64 = 10002;
pub const CURLOPT_POSTFIELDS: i64 = 10015;
pub const CURLOPT_CUSTOMREQUEST: i64 = 10036;

const GET_HTTP_METHOD: &str = "GET";
const HEAD_HTTP_METHOD: &str = "HEAD";
const POST_HTTP_METHOD: &str = "POST";
const PUT_HTTP_METHOD: &str = "PUT";

const UNKNOWN_HTTP_METHOD: &str = "<HTTP METHOD UNKNOWN>";
const UNKNOWN_HOST: &str = "<UNKNOWN HOST>";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CurlFunction {
    Init,
    Setopt,
    SetoptArray,
    CopyHandle,
    Exec,
    Close,
}

impl CurlFunction {
    pub const ALL: [CurlFunction; 6] = [
        CurlFunction::Init,
        CurlFunction::Setopt,
        CurlFunction::SetoptArray,
        CurlFunction::CopyHandle,
        CurlFunction::Exec,
        CurlFunction::Close,
    ];

    pub fn function_name(self) -> &'static str {
        match self {
            CurlFunction::Init => "curl_init",
            CurlFunction::Setopt => "curl_setopt",
            CurlFunction::SetoptArray => "curl_setopt_array",
            CurlFunction::CopyHandle => "curl_copy_handle",
            CurlFunction::Exec => "curl_exec",
            CurlFunction::Close => "curl_close",
        }
    }
}

/// Request options recorded for one curl handle
#[derive(Debug, Clone, PartialEq)]
pub struct CurlHandleState {
    pub url: Option<RawText>,
    pub http_method: Option<String>,
}

impl Default for CurlHandleState {
    fn default() -> Self {
        Self {
            url: None,
            http_method: Some(GET_HTTP_METHOD.to_string()),
        }
    }
}

impl CurlHandleState {
    /// `"<METHOD> <host>"`
    pub fn span_name(&self) -> String {
        let host = self
            .url
            .as_ref()
            .and_then(|url| parse_url(url))
            .and_then(|url| url.host_str().map(str::to_string));
        format!(
            "{} {}",
            self.http_method.as_deref().unwrap_or(UNKNOWN_HTTP_METHOD),
            host.as_deref().unwrap_or(UNKNOWN_HOST)
        )
    }

    pub fn is_http(&self) -> bool {
        self.url
            .as_ref()
            .and_then(parse_url)
            .is_some_and(|url| matches!(url.scheme(), "http" | "https"))
    }

    /// Apply one successful curl_setopt
    ///
    /// `value` is `None` when the call carried no option value.
    pub fn apply_option(
        &mut self,
        option_id: i64,
        value: Option<&InterceptedValue>,
    ) -> Result<(), InstrumentationError> {
        fn required(
            value: Option<&InterceptedValue>,
        ) -> Result<&InterceptedValue, InstrumentationError> {
            value.ok_or_else(|| InstrumentationError::MissingArgument {
                function: CurlFunction::Setopt.function_name().to_string(),
                expected: 3,
                actual: 2,
            })
        }
        match option_id {
            CURLOPT_CUSTOMREQUEST => {
                let method = expect_string(CurlFunction::Setopt, required(value)?)?;
                self.http_method = Some(method.to_string_lossy());
            }
            CURLOPT_HTTPGET => self.set_method(GET_HTTP_METHOD),
            CURLOPT_NOBODY => {
                if required(value)?.is_truthy() {
                    self.set_method(HEAD_HTTP_METHOD);
                } else if self.http_method.as_deref() == Some(HEAD_HTTP_METHOD) {
                    self.set_method(GET_HTTP_METHOD);
                }
            }
            CURLOPT_POST => {
                let method = if required(value)?.is_truthy() {
                    POST_HTTP_METHOD
                } else {
                    GET_HTTP_METHOD
                };
                self.set_method(method);
            }
            CURLOPT_POSTFIELDS => self.set_method(POST_HTTP_METHOD),
            CURLOPT_PUT => {
                let method = if required(value)?.is_truthy() {
                    PUT_HTTP_METHOD
                } else {
                    GET_HTTP_METHOD
                };
                self.set_method(method);
            }
            CURLOPT_URL => {
                self.url = Some(expect_string(CurlFunction::Setopt, required(value)?)?.clone());
            }
            _ => {}
        }
        Ok(())
    }

    fn set_method(&mut self, method: &str) {
        self.http_method = Some(method.to_string());
    }
}

fn parse_url(url: &RawText) -> Option<Url> {
    url.as_str().and_then(|url| Url::parse(url).ok())
}

fn expect_string(
    function: CurlFunction,
    value: &InterceptedValue,
) -> Result<&RawText, InstrumentationError> {
    value
        .as_raw_text()
        .ok_or_else(|| InstrumentationError::UnexpectedValueType {
            function: function.function_name().to_string(),
            expected: "string",
            actual: value.type_name(),
        })
}

type CurlHandles = Rc<RefCell<HandleMap<CurlHandleState>>>;

/// Owns the handle map shared by all curl hooks
#[derive(Debug, Default)]
pub struct CurlInstrumentation {
    handles: CurlHandles,
}

impl CurlInstrumentation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, ctx: &mut RegistrationContext) {
        for function in CurlFunction::ALL {
            ctx.intercept_calls_to_function(function.function_name(), self.hook(function));
        }
    }

    pub fn hook(&self, function: CurlFunction) -> InterceptHook {
        InterceptHook::Curl(CurlHook {
            function,
            handles: Rc::clone(&self.handles),
        })
    }

    pub fn handle_state(&self, handle_id: u64) -> Option<CurlHandleState> {
        self.handles.borrow().get(handle_id).cloned()
    }

    pub fn tracked_handles(&self) -> usize {
        self.handles.borrow().len()
    }
}

#[derive(Clone)]
pub struct CurlHook {
    function: CurlFunction,
    handles: CurlHandles,
}

impl fmt::Debug for CurlHook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CurlHook").field("function", &self.function).finish()
    }
}

impl CurlHook {
    pub fn function(&self) -> CurlFunction {
        self.function
    }

    pub(crate) fn on_call_begin(
        &self,
        tracer: &mut Tracer,
        args: &[InterceptedValue],
    ) -> Result<Option<Box<dyn CallTracker>>, InstrumentationError> {
        match self.function {
            CurlFunction::Init => {
                let mut state = CurlHandleState::default();
                if let Some(url) = args.first() {
                    state.url = Some(expect_string(self.function, url)?.clone());
                }
                Ok(Some(self.register_handle_on_return(state)))
            }
            CurlFunction::CopyHandle => Ok(self
                .tracked_state(args)
                .map(|state| self.register_handle_on_return(state))),
            CurlFunction::Close => {
                if let Some(handle_id) = self.tracked_handle_id(args) {
                    self.handles.borrow_mut().remove(handle_id);
                    tracing::trace!(handle_id, "curl handle closed");
                }
                Ok(None)
            }
            CurlFunction::Setopt | CurlFunction::SetoptArray => {
                let Some(handle_id) = self.tracked_handle_id(args) else {
                    return Ok(None);
                };
                if args.len() < 2 {
                    return Err(InstrumentationError::MissingArgument {
                        function: self.function.function_name().to_string(),
                        expected: 2,
                        actual: args.len(),
                    });
                }
                Ok(Some(Box::new(CurlSetoptTracker {
                    function: self.function,
                    handles: Rc::clone(&self.handles),
                    handle_id,
                    args: args[1..].to_vec(),
                })))
            }
            CurlFunction::Exec => {
                let Some(state) = self.tracked_state(args) else {
                    return Ok(None);
                };
                let subtype = state.is_http().then_some(SPAN_SUBTYPE_HTTP);
                let span = tracer
                    .begin_current_span(&state.span_name(), SPAN_TYPE_EXTERNAL, subtype, None)
                    .map(|mut span| {
                        span.context_mut().http = Some(HttpContext {
                            url: state.url.clone(),
                            method: state.http_method.clone(),
                            status_code: None,
                        });
                        span
                    });
                Ok(SpanCallTracker::boxed(span))
            }
        }
    }

    fn register_handle_on_return(&self, state: CurlHandleState) -> Box<dyn CallTracker> {
        Box::new(CurlHandleCreateTracker {
            function: self.function,
            handles: Rc::clone(&self.handles),
            state,
        })
    }

    /// Id of the tracked handle passed as the first argument
    fn tracked_handle_id(&self, args: &[InterceptedValue]) -> Option<u64> {
        let handle_id = args.first().and_then(InterceptedValue::as_resource);
        if handle_id.is_none() {
            tracing::debug!(
                function = self.function.function_name(),
                args_count = args.len(),
                "First argument is not a curl handle"
            );
        }
        handle_id.filter(|handle_id| self.handles.borrow().contains(*handle_id))
    }

    fn tracked_state(&self, args: &[InterceptedValue]) -> Option<CurlHandleState> {
        self.tracked_handle_id(args)
            .and_then(|handle_id| self.handles.borrow().get(handle_id).cloned())
    }
}

/// Starts tracking the handle returned by curl_init / curl_copy_handle
struct CurlHandleCreateTracker {
    function: CurlFunction,
    handles: CurlHandles,
    state: CurlHandleState,
}

impl CallTracker for CurlHandleCreateTracker {
    fn on_call_normal_end(
        self: Box<Self>,
        _tracer: &mut Tracer,
        return_value: &InterceptedValue,
    ) -> Result<(), InstrumentationError> {
        match return_value.as_resource() {
            Some(handle_id) => {
                tracing::trace!(
                    handle_id,
                    function = self.function.function_name(),
                    "Tracking curl handle"
                );
                self.handles.borrow_mut().insert(handle_id, self.state);
            }
            None => tracing::debug!(
                function = self.function.function_name(),
                return_type = return_value.type_name(),
                "Call did not return a curl handle"
            ),
        }
        Ok(())
    }

    fn on_call_end_by_exception(
        self: Box<Self>,
        _tracer: &mut Tracer,
        _thrown: &InterceptedValue,
    ) -> Result<(), InstrumentationError> {
        Ok(())
    }
}

/// Records options once curl_setopt / curl_setopt_array reported success
struct CurlSetoptTracker {
    function: CurlFunction,
    handles: CurlHandles,
    handle_id: u64,
    /// Arguments after the handle
    args: Vec<InterceptedValue>,
}

impl CurlSetoptTracker {
    fn apply(&self, state: &mut CurlHandleState) -> Result<(), InstrumentationError> {
        match self.function {
            CurlFunction::SetoptArray => {
                let InterceptedValue::Array(options) = &self.args[0] else {
                    return Err(InstrumentationError::UnexpectedValueType {
                        function: self.function.function_name().to_string(),
                        expected: "array",
                        actual: self.args[0].type_name(),
                    });
                };
                for (option_id, value) in options {
                    state.apply_option(expect_option_id(self.function, option_id)?, Some(value))?;
                }
                Ok(())
            }
            _ => {
                let option_id = expect_option_id(self.function, &self.args[0])?;
                state.apply_option(option_id, self.args.get(1))
            }
        }
    }
}

fn expect_option_id(
    function: CurlFunction,
    value: &InterceptedValue,
) -> Result<i64, InstrumentationError> {
    value
        .as_int()
        .ok_or_else(|| InstrumentationError::UnexpectedValueType {
            function: function.function_name().to_string(),
            expected: "int",
            actual: value.type_name(),
        })
}

impl CallTracker for CurlSetoptTracker {
    fn on_call_normal_end(
        self: Box<Self>,
        _tracer: &mut Tracer,
        return_value: &InterceptedValue,
    ) -> Result<(), InstrumentationError> {
        match return_value {
            InterceptedValue::Bool(true) => {}
            InterceptedValue::Bool(false) => return Ok(()),
            other => {
                return Err(InstrumentationError::UnexpectedValueType {
                    function: self.function.function_name().to_string(),
                    expected: "bool",
                    actual: other.type_name(),
                })
            }
        }

        let mut handles = self.handles.borrow_mut();
        let Some(state) = handles.get_mut(self.handle_id) else {
            return Ok(());
        };
        // Options are applied to a copy so a bad entry leaves the handle untouched
        let mut updated = state.clone();
        self.apply(&mut updated)?;
        *state = updated;
        Ok(())
    }

    fn on_call_end_by_exception(
        self: Box<Self>,
        _tracer: &mut Tracer,
        _thrown: &InterceptedValue,
    ) -> Result<(), InstrumentationError> {
        Ok(())
    }
}
