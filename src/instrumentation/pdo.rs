// PDO database instrumentation
//
// PDO::__construct parses the DSN and attaches the DB type/name to the PDO
// object. PDO::exec, PDO::query and PDOStatement::execute open `db` spans
// classified by those properties. PDO::prepare copies them (plus the query
// text) onto the returned PDOStatement.

use super::{begin_db_span, parse_db_connection_string, HandleMap, SPAN_SUBTYPE_UNKNOWN};
use crate::intercepted::{InterceptedValue, ObjectHandle, RawText};
use crate::interception::{
    CallTracker, InstrumentationError, InterceptHook, RegistrationContext, SpanCallTracker,
};
use crate::tracer::{Span, Tracer};
use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

const PDO_CLASS: &str = "PDO";
const PDO_STATEMENT_CLASS: &str = "PDOStatement";

/// DB properties attached to a PDO or PDOStatement object
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AttachedDbProperties {
    pub db_type: Option<String>,
    pub db_name: Option<String>,
    /// Query text of a prepared statement
    pub query_string: Option<RawText>,
}

type AttachedPropertiesMap = Rc<RefCell<HandleMap<AttachedDbProperties>>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PdoTarget {
    Construct,
    Exec,
    Query,
    Prepare,
    StatementExecute,
}

impl PdoTarget {
    fn function_name(self) -> &'static str {
        match self {
            PdoTarget::Construct => "PDO::__construct",
            PdoTarget::Exec => "PDO::exec",
            PdoTarget::Query => "PDO::query",
            PdoTarget::Prepare => "PDO::prepare",
            PdoTarget::StatementExecute => "PDOStatement::execute",
        }
    }
}

/// Owns the attached-properties map shared by all PDO hooks
#[derive(Debug, Default)]
pub struct PdoInstrumentation {
    attached: AttachedPropertiesMap,
}

impl PdoInstrumentation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, ctx: &mut RegistrationContext) {
        ctx.intercept_calls_to_method(PDO_CLASS, "__construct", self.hook(PdoTarget::Construct));
        ctx.intercept_calls_to_method(PDO_CLASS, "exec", self.hook(PdoTarget::Exec));
        ctx.intercept_calls_to_method(PDO_CLASS, "query", self.hook(PdoTarget::Query));
        ctx.intercept_calls_to_method(PDO_CLASS, "prepare", self.hook(PdoTarget::Prepare));
        ctx.intercept_calls_to_method(
            PDO_STATEMENT_CLASS,
            "execute",
            self.hook(PdoTarget::StatementExecute),
        );
    }

    pub fn hook(&self, target: PdoTarget) -> InterceptHook {
        InterceptHook::Pdo(PdoHook {
            target,
            attached: Rc::clone(&self.attached),
        })
    }

    pub fn attached_properties(&self, object: &ObjectHandle) -> Option<AttachedDbProperties> {
        self.attached.borrow().get(object.handle_id).cloned()
    }
}

#[derive(Clone)]
pub struct PdoHook {
    target: PdoTarget,
    attached: AttachedPropertiesMap,
}

impl fmt::Debug for PdoHook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PdoHook").field("target", &self.target).finish()
    }
}

impl PdoHook {
    pub fn target(&self) -> PdoTarget {
        self.target
    }

    pub(crate) fn on_call_begin(
        &self,
        tracer: &mut Tracer,
        this: Option<&ObjectHandle>,
        args: &[InterceptedValue],
    ) -> Result<Option<Box<dyn CallTracker>>, InstrumentationError> {
        match self.target {
            PdoTarget::Construct => {
                self.construct(this, args)?;
                Ok(None)
            }
            PdoTarget::Exec | PdoTarget::Query => {
                let this = self.expect_this(this, PDO_CLASS)?;
                let statement = match args.first() {
                    Some(InterceptedValue::Str(statement)) => Some(statement.clone()),
                    Some(other) => {
                        tracing::debug!(
                            function = self.target.function_name(),
                            arg_type = other.type_name(),
                            "First argument is not a string, statement is not captured"
                        );
                        None
                    }
                    None => None,
                };
                let properties = self.properties_of(this);
                Ok(SpanCallTracker::boxed(begin_pdo_span(
                    tracer,
                    self.target,
                    statement,
                    &properties,
                )))
            }
            PdoTarget::Prepare => {
                let this = self.expect_this(this, PDO_CLASS)?;
                let mut properties = self.properties_of(this);
                properties.query_string =
                    args.first().and_then(InterceptedValue::as_raw_text).cloned();
                Ok(Some(Box::new(PdoPrepareTracker {
                    attached: Rc::clone(&self.attached),
                    properties,
                })))
            }
            PdoTarget::StatementExecute => {
                let properties = match this {
                    Some(this) if this.is_instance_of(PDO_STATEMENT_CLASS) => {
                        self.properties_of(this)
                    }
                    _ => AttachedDbProperties::default(),
                };
                let statement = properties.query_string.clone();
                Ok(SpanCallTracker::boxed(begin_pdo_span(
                    tracer,
                    self.target,
                    statement,
                    &properties,
                )))
            }
        }
    }

    fn construct(
        &self,
        this: Option<&ObjectHandle>,
        args: &[InterceptedValue],
    ) -> Result<(), InstrumentationError> {
        let this = self.expect_this(this, PDO_CLASS)?;
        let dsn = match args.first() {
            Some(InterceptedValue::Str(dsn)) => dsn.to_string_lossy(),
            Some(other) => {
                return Err(InstrumentationError::UnexpectedValueType {
                    function: self.target.function_name().to_string(),
                    expected: "string",
                    actual: other.type_name(),
                })
            }
            None => {
                return Err(InstrumentationError::MissingArgument {
                    function: self.target.function_name().to_string(),
                    expected: 1,
                    actual: 0,
                })
            }
        };

        let info = parse_db_connection_string(&dsn);
        tracing::debug!(
            handle_id = this.handle_id,
            db_type = info.db_type.as_deref(),
            db_name = info.db_name.as_deref(),
            "Attaching DB properties to PDO object"
        );
        self.attached.borrow_mut().insert(
            this.handle_id,
            AttachedDbProperties {
                db_type: info.db_type,
                db_name: info.db_name,
                query_string: None,
            },
        );
        Ok(())
    }

    fn expect_this<'a>(
        &self,
        this: Option<&'a ObjectHandle>,
        class_name: &'static str,
    ) -> Result<&'a ObjectHandle, InstrumentationError> {
        this.filter(|object| object.is_instance_of(class_name))
            .ok_or_else(|| InstrumentationError::UnexpectedThis {
                function: self.target.function_name().to_string(),
                expected_class: class_name,
            })
    }

    fn properties_of(&self, object: &ObjectHandle) -> AttachedDbProperties {
        self.attached
            .borrow()
            .get(object.handle_id)
            .cloned()
            .unwrap_or_default()
    }
}

fn begin_pdo_span(
    tracer: &mut Tracer,
    target: PdoTarget,
    statement: Option<RawText>,
    properties: &AttachedDbProperties,
) -> Option<Span> {
    let db_type = properties.db_type.as_deref().unwrap_or(SPAN_SUBTYPE_UNKNOWN);
    let name = match &statement {
        Some(statement) => statement.to_string_lossy(),
        None => target.function_name().replace("::", "->"),
    };
    begin_db_span(tracer, &name, db_type, statement, properties.db_name.as_deref())
}

/// Propagates DB properties from a PDO to the PDOStatement it prepared
struct PdoPrepareTracker {
    attached: AttachedPropertiesMap,
    properties: AttachedDbProperties,
}

impl CallTracker for PdoPrepareTracker {
    fn on_call_normal_end(
        self: Box<Self>,
        _tracer: &mut Tracer,
        return_value: &InterceptedValue,
    ) -> Result<(), InstrumentationError> {
        match return_value {
            InterceptedValue::Object(statement)
                if statement.is_instance_of(PDO_STATEMENT_CLASS) =>
            {
                self.attached
                    .borrow_mut()
                    .insert(statement.handle_id, self.properties);
                Ok(())
            }
            // prepare() reports failure by returning false
            InterceptedValue::Bool(false) => Ok(()),
            other => Err(InstrumentationError::UnexpectedValueType {
                function: PdoTarget::Prepare.function_name().to_string(),
                expected: "PDOStatement object",
                actual: other.type_name(),
            }),
        }
    }

    fn on_call_end_by_exception(
        self: Box<Self>,
        _tracer: &mut Tracer,
        _thrown: &InterceptedValue,
    ) -> Result<(), InstrumentationError> {
        Ok(())
    }
}
