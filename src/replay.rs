//! Scenario replay: drive scripted intercepted calls through the real
//! interception manager and capture what the transport would receive.
//!
//! A scenario is a JSON document:
//!
//! ```json
//! {
//!   "start_time_us": 1700000000000000,
//!   "intercept": [{"function": "sleep", "name": "sleep", "type": "app"}],
//!   "steps": [
//!     {"op": "begin_transaction", "name": "GET /", "type": "request"},
//!     {"op": "enter", "class": "PDO", "method": "__construct",
//!      "this": {"object": {"class": "PDO", "id": 1}}, "args": ["sqlite::memory:"]},
//!     {"op": "exit", "returns": null},
//!     {"op": "advance", "us": 250},
//!     {"op": "label", "key": "tenant", "value": "acme"},
//!     {"op": "end_transaction"}
//!   ]
//! }
//! ```
//!
//! Plain JSON values map to host values (integers to `Int`, other numbers to
//! `Float`, JSON arrays to list-like arrays). Single-key objects spell the
//! rest: `{"object": {"class", "id"}}`, `{"resource": id}`,
//! `{"throwable": {"class", "message", "code"?}}` and
//! `{"array": [[key, value], ...]}`.

use crate::clock::ManualClock;
use crate::config::AgentConfig;
use crate::event_sender::{BackendCapability, InMemoryTransport, SentPayload};
use crate::events::LabelValue;
use crate::instrumentation::register_builtin_instrumentations;
use crate::intercepted::{InterceptedValue, ObjectHandle, ThrowableInfo};
use crate::interception::{
    InterceptHook, InterceptTarget, InterceptionManager, RegistrationContext, SpanHook,
};
use crate::tracer::Tracer;
use serde::Deserialize;
use serde_json::Value;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Default wall-clock start of a replay (2023-11-14T22:13:20Z)
pub const DEFAULT_START_TIME_US: f64 = 1_700_000_000_000_000.0;

#[derive(Error, Debug)]
pub enum ReplayError {
    #[error("Failed to read scenario {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid scenario JSON: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Step {step}: {reason}")]
    InvalidStep { step: usize, reason: String },

    #[error("Step {step}: {target} is not intercepted")]
    UnknownTarget { step: usize, target: String },

    #[error("Step {step}: exit without a matching enter")]
    UnbalancedExit { step: usize },
}

/// Extra function/method wrapped in a span with fixed classification
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SpanRegistration {
    pub function: Option<String>,
    pub class: Option<String>,
    pub method: Option<String>,
    pub name: String,
    #[serde(rename = "type")]
    pub span_type: String,
    pub subtype: Option<String>,
    pub action: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Step {
    BeginTransaction {
        name: String,
        #[serde(rename = "type")]
        transaction_type: String,
    },
    EndTransaction,
    /// Move both clocks forward
    Advance { us: f64 },
    /// An intercepted call starts
    Enter {
        function: Option<String>,
        class: Option<String>,
        method: Option<String>,
        this: Option<Value>,
        #[serde(default)]
        args: Vec<Value>,
    },
    /// The innermost entered call returns or throws
    Exit {
        returns: Option<Value>,
        throws: Option<Value>,
    },
    /// Label on the current transaction: string, integer, float or bool
    Label { key: String, value: Value },
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Scenario {
    #[serde(default = "default_start_time_us")]
    pub start_time_us: f64,
    #[serde(default)]
    pub intercept: Vec<SpanRegistration>,
    pub steps: Vec<Step>,
}

fn default_start_time_us() -> f64 {
    DEFAULT_START_TIME_US
}

impl Scenario {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ReplayError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ReplayError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&content)
    }

    pub fn from_json_str(content: &str) -> Result<Self, ReplayError> {
        Ok(serde_json::from_str(content)?)
    }
}

/// Everything the transport received during a replay
#[derive(Debug, Clone, Default)]
pub struct ReplayOutput {
    pub payloads: Vec<SentPayload>,
}

impl ReplayOutput {
    /// All payloads as one NDJSON document, each line newline-terminated
    pub fn to_ndjson(&self) -> String {
        self.payloads
            .iter()
            .flat_map(|payload| payload.lines())
            .fold(String::new(), |mut out, line| {
                out.push_str(line);
                out.push('\n');
                out
            })
    }
}

/// Run `scenario` against a fresh tracer built from `config`
///
/// Open transactions are ended when the steps run out.
pub fn replay(scenario: &Scenario, config: AgentConfig) -> Result<ReplayOutput, ReplayError> {
    let clock = ManualClock::starting_at(scenario.start_time_us);
    let transport = InMemoryTransport::new();
    let tracer = Tracer::with_backend(
        config,
        Box::new(clock.clone()),
        BackendCapability::Loaded(Box::new(transport.clone())),
    );

    let mut ctx = RegistrationContext::new();
    register_builtin_instrumentations(&mut ctx);
    for (index, registration) in scenario.intercept.iter().enumerate() {
        let target = target_of(
            index,
            registration.function.as_deref(),
            registration.class.as_deref(),
            registration.method.as_deref(),
        )?;
        let mut hook = SpanHook::new(registration.name.as_str(), registration.span_type.as_str());
        hook.subtype = registration.subtype.clone();
        hook.action = registration.action.clone();
        match target {
            InterceptTarget::Function(name) => {
                ctx.intercept_calls_to_function(&name, InterceptHook::Span(hook))
            }
            InterceptTarget::Method {
                class_name,
                method_name,
            } => {
                ctx.intercept_calls_to_method(&class_name, &method_name, InterceptHook::Span(hook))
            }
        };
    }
    let targets: Vec<InterceptTarget> = ctx.targets().cloned().collect();
    let mut manager = InterceptionManager::new(tracer, ctx);

    // One entry per entered call: whether pre_hook asked for a post_hook
    let mut entered: Vec<bool> = Vec::new();

    for (step_index, step) in scenario.steps.iter().enumerate() {
        tracing::trace!(step = step_index, op = ?step, "Replaying step");
        match step {
            Step::BeginTransaction {
                name,
                transaction_type,
            } => {
                manager.tracer_mut().begin_transaction(name, transaction_type);
            }
            Step::EndTransaction => manager.tracer_mut().end_current_transaction(),
            Step::Advance { us } => {
                if !us.is_finite() || *us < 0.0 {
                    return Err(invalid(step_index, format!("cannot advance by {}", us)));
                }
                clock.advance(*us);
            }
            Step::Enter {
                function,
                class,
                method,
                this,
                args,
            } => {
                let target = target_of(
                    step_index,
                    function.as_deref(),
                    class.as_deref(),
                    method.as_deref(),
                )?;
                let registration_id = targets
                    .iter()
                    .position(|registered| registered.matches(&target))
                    .ok_or_else(|| ReplayError::UnknownTarget {
                        step: step_index,
                        target: target.to_string(),
                    })?;
                let this = match this {
                    Some(value) => match to_intercepted(step_index, value)? {
                        InterceptedValue::Object(object) => Some(object),
                        other => {
                            return Err(invalid(
                                step_index,
                                format!("`this` must be an object, got {}", other.type_name()),
                            ))
                        }
                    },
                    None => None,
                };
                let args = args
                    .iter()
                    .map(|arg| to_intercepted(step_index, arg))
                    .collect::<Result<Vec<_>, _>>()?;
                entered.push(manager.pre_hook(registration_id, this.as_ref(), &args));
            }
            Step::Exit { returns, throws } => {
                let (has_exited_by_exception, value) = match (returns, throws) {
                    (_, Some(thrown)) => (true, to_intercepted(step_index, thrown)?),
                    (Some(returned), None) => (false, to_intercepted(step_index, returned)?),
                    (None, None) => (false, InterceptedValue::Null),
                };
                let tracked = entered
                    .pop()
                    .ok_or(ReplayError::UnbalancedExit { step: step_index })?;
                if tracked {
                    manager.post_hook(has_exited_by_exception, value);
                }
            }
            Step::Label { key, value } => {
                let value = to_label_value(step_index, value)?;
                match manager.tracer_mut().current_transaction_mut() {
                    Some(transaction) => transaction.set_label(key, value),
                    None => {
                        tracing::debug!(key = %key, "No current transaction - label is dropped")
                    }
                }
            }
        }
    }

    if !entered.is_empty() {
        tracing::warn!(open_calls = entered.len(), "Scenario ended with calls still in progress");
    }
    manager.tracer_mut().end_current_transaction();

    Ok(ReplayOutput {
        payloads: transport.payloads(),
    })
}

fn to_label_value(step: usize, value: &Value) -> Result<LabelValue, ReplayError> {
    match value {
        Value::String(text) => Ok(LabelValue::from(text.as_str())),
        Value::Bool(flag) => Ok(LabelValue::from(*flag)),
        Value::Number(number) => number
            .as_i64()
            .map(LabelValue::from)
            .or_else(|| number.as_f64().map(LabelValue::from))
            .ok_or_else(|| invalid(step, format!("label value {} is out of range", number))),
        other => Err(invalid(
            step,
            format!("label values are strings, numbers or booleans, got {}", other),
        )),
    }
}

fn invalid(step: usize, reason: impl Into<String>) -> ReplayError {
    ReplayError::InvalidStep {
        step,
        reason: reason.into(),
    }
}

fn target_of(
    step: usize,
    function: Option<&str>,
    class: Option<&str>,
    method: Option<&str>,
) -> Result<InterceptTarget, ReplayError> {
    match (function, class, method) {
        (Some(function), None, None) => Ok(InterceptTarget::Function(function.to_string())),
        (None, Some(class_name), Some(method_name)) => Ok(InterceptTarget::Method {
            class_name: class_name.to_string(),
            method_name: method_name.to_string(),
        }),
        _ => Err(invalid(step, "expected either `function` or `class` + `method`")),
    }
}

/// Convert a scenario JSON value into a host value
pub fn to_intercepted(step: usize, value: &Value) -> Result<InterceptedValue, ReplayError> {
    Ok(match value {
        Value::Null => InterceptedValue::Null,
        Value::Bool(flag) => InterceptedValue::Bool(*flag),
        Value::Number(number) => match number.as_i64() {
            Some(int) => InterceptedValue::Int(int),
            None => InterceptedValue::Float(number.as_f64().unwrap_or(f64::NAN)),
        },
        Value::String(text) => InterceptedValue::str(text.as_str()),
        Value::Array(items) => InterceptedValue::Array(
            items
                .iter()
                .enumerate()
                .map(|(index, item)| {
                    Ok((InterceptedValue::Int(index as i64), to_intercepted(step, item)?))
                })
                .collect::<Result<_, ReplayError>>()?,
        ),
        Value::Object(fields) => {
            let mut entries = fields.iter();
            let (Some((kind, inner)), None) = (entries.next(), entries.next()) else {
                return Err(invalid(step, "special values must be single-key objects"));
            };
            match kind.as_str() {
                "object" => InterceptedValue::Object(ObjectHandle::new(
                    required_str(step, inner, "class")?,
                    required_u64(step, inner, "id")?,
                )),
                "resource" => InterceptedValue::Resource(
                    inner.as_u64().ok_or_else(|| {
                        invalid(step, "resource id must be a non-negative integer")
                    })?,
                ),
                "throwable" => {
                    let throwable = ThrowableInfo::new(
                        required_str(step, inner, "class")?,
                        required_str(step, inner, "message")?,
                    );
                    match inner.get("code").and_then(Value::as_i64) {
                        Some(code) => InterceptedValue::Throwable(throwable.with_code(code)),
                        None => InterceptedValue::Throwable(throwable),
                    }
                }
                "array" => {
                    let pairs = inner.as_array().ok_or_else(|| {
                        invalid(step, "`array` expects a list of [key, value] pairs")
                    })?;
                    let entries = pairs
                        .iter()
                        .map(|pair| match pair.as_array().map(Vec::as_slice) {
                            Some([key, value]) => {
                                Ok((to_intercepted(step, key)?, to_intercepted(step, value)?))
                            }
                            _ => Err(invalid(step, "`array` entries must be [key, value] pairs")),
                        })
                        .collect::<Result<_, ReplayError>>()?;
                    InterceptedValue::Array(entries)
                }
                other => return Err(invalid(step, format!("unknown value kind `{}`", other))),
            }
        }
    })
}

fn required_str<'a>(step: usize, value: &'a Value, field: &str) -> Result<&'a str, ReplayError> {
    value
        .get(field)
        .and_then(Value::as_str)
        .ok_or_else(|| invalid(step, format!("missing string field `{}`", field)))
}

fn required_u64(step: usize, value: &Value, field: &str) -> Result<u64, ReplayError> {
    value
        .get(field)
        .and_then(Value::as_u64)
        .ok_or_else(|| invalid(step, format!("missing integer field `{}`", field)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const PDO_SCENARIO: &str = r#"{
        "steps": [
            {"op": "begin_transaction", "name": "GET /orders", "type": "request"},
            {"op": "enter", "class": "PDO", "method": "__construct",
             "this": {"object": {"class": "PDO", "id": 1}}, "args": ["sqlite:/var/db/orders.sqlite"]},
            {"op": "exit"},
            {"op": "advance", "us": 100},
            {"op": "enter", "class": "PDO", "method": "query",
             "this": {"object": {"class": "PDO", "id": 1}}, "args": ["SELECT * FROM orders"]},
            {"op": "advance", "us": 400},
            {"op": "exit", "returns": {"object": {"class": "PDOStatement", "id": 2}}},
            {"op": "advance", "us": 500},
            {"op": "end_transaction"}
        ]
    }"#;

    fn lines(output: &ReplayOutput) -> Vec<Value> {
        output
            .to_ndjson()
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect()
    }

    #[test]
    fn test_replay_pdo_scenario() {
        let scenario = Scenario::from_json_str(PDO_SCENARIO).unwrap();
        let output = replay(&scenario, AgentConfig::default()).unwrap();
        assert_eq!(output.payloads.len(), 1);
        assert_eq!(
            output.payloads[0].line_kinds(),
            vec!["metadata", "span", "metricset", "metricset", "metricset", "transaction"]
        );

        let lines = lines(&output);
        assert_eq!(lines[1]["span"]["subtype"], "sqlite");
        assert_eq!(lines[1]["span"]["context"]["db"]["instance"], "/var/db/orders.sqlite");
        assert_eq!(lines[5]["transaction"]["name"], "GET /orders");
        assert_eq!(lines[5]["transaction"]["duration"], 1.0);
    }

    #[test]
    fn test_ndjson_lines_are_newline_terminated() {
        let scenario = Scenario::from_json_str(PDO_SCENARIO).unwrap();
        let ndjson = replay(&scenario, AgentConfig::default()).unwrap().to_ndjson();
        assert!(ndjson.ends_with('\n'));
        assert_eq!(ndjson.lines().count(), 6);
    }

    #[test]
    fn test_custom_span_registration() {
        let scenario = Scenario::from_json_str(
            r#"{
                "intercept": [{"class": "Redis", "method": "get", "name": "GET", "type": "db", "subtype": "redis"}],
                "steps": [
                    {"op": "begin_transaction", "name": "job", "type": "cli"},
                    {"op": "enter", "class": "redis", "method": "GET", "args": ["key"]},
                    {"op": "exit", "throws": {"throwable": {"class": "RedisException", "message": "gone"}}}
                ]
            }"#,
        )
        .unwrap();
        let output = replay(&scenario, AgentConfig::default()).unwrap();
        let lines = lines(&output);
        let span = lines.iter().find_map(|line| line.get("span")).unwrap();
        assert_eq!(span["subtype"], "redis");
        assert_eq!(span["outcome"], "failure");
        assert!(lines.iter().any(|line| line.get("error").is_some()));
    }

    #[test]
    fn test_label_steps_tag_the_transaction() {
        let scenario = Scenario::from_json_str(
            r#"{"steps": [
                {"op": "label", "key": "ignored", "value": "no transaction yet"},
                {"op": "begin_transaction", "name": "job", "type": "cli"},
                {"op": "label", "key": "tenant", "value": "acme"},
                {"op": "label", "key": "attempt", "value": 3},
                {"op": "label", "key": "ratio", "value": 0.5},
                {"op": "label", "key": "retry", "value": false}
            ]}"#,
        )
        .unwrap();
        let output = replay(&scenario, AgentConfig::default()).unwrap();
        let lines = lines(&output);
        let tags = &lines.last().unwrap()["transaction"]["context"]["tags"];
        assert_eq!(
            *tags,
            json!({"attempt": 3, "ratio": 0.5, "retry": false, "tenant": "acme"})
        );
    }

    #[test]
    fn test_label_value_must_be_scalar() {
        let scenario = Scenario::from_json_str(
            r#"{"steps": [
                {"op": "begin_transaction", "name": "job", "type": "cli"},
                {"op": "label", "key": "ids", "value": [1, 2]}
            ]}"#,
        )
        .unwrap();
        let err = replay(&scenario, AgentConfig::default()).unwrap_err();
        assert!(matches!(err, ReplayError::InvalidStep { step: 1, .. }));
    }

    #[test]
    fn test_unknown_target_is_rejected() {
        let scenario = Scenario::from_json_str(
            r#"{"steps": [{"op": "enter", "function": "oci_execute"}]}"#,
        )
        .unwrap();
        let err = replay(&scenario, AgentConfig::default()).unwrap_err();
        assert!(matches!(err, ReplayError::UnknownTarget { step: 0, .. }));
    }

    #[test]
    fn test_unbalanced_exit_is_rejected() {
        let scenario = Scenario::from_json_str(r#"{"steps": [{"op": "exit"}]}"#).unwrap();
        assert!(matches!(
            replay(&scenario, AgentConfig::default()),
            Err(ReplayError::UnbalancedExit { step: 0 })
        ));
    }

    #[test]
    fn test_value_conversion() {
        assert_eq!(to_intercepted(0, &json!(3)).unwrap(), InterceptedValue::Int(3));
        assert_eq!(to_intercepted(0, &json!(1.5)).unwrap(), InterceptedValue::Float(1.5));
        assert_eq!(
            to_intercepted(0, &json!({"resource": 9})).unwrap(),
            InterceptedValue::Resource(9)
        );
        assert_eq!(
            to_intercepted(0, &json!({"array": [[10002, "http://x"]]})).unwrap(),
            InterceptedValue::Array(vec![(
                InterceptedValue::Int(10002),
                InterceptedValue::str("http://x")
            )])
        );
        assert_eq!(
            to_intercepted(0, &json!(["a"])).unwrap(),
            InterceptedValue::Array(vec![(InterceptedValue::Int(0), InterceptedValue::str("a"))])
        );
        assert!(to_intercepted(0, &json!({"object": {"class": "PDO"}})).is_err());
        assert!(to_intercepted(0, &json!({"a": 1, "b": 2})).is_err());
    }

    #[test]
    fn test_parse_error() {
        assert!(matches!(Scenario::from_json_str("{"), Err(ReplayError::Parse(_))));
    }
}
