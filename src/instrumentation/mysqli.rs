// MySQLi database instrumentation
//
// Every target is intercepted twice: as a method (`mysqli::query`) and as its
// procedural twin (`mysqli_query`), which takes the link or statement as its
// first argument. Calls open `db` spans with subtype `mysql`.
//
// The database name given to the constructor (or to select_db) is kept per
// link. prepare attaches its query text to the returned mysqli_stmt so the
// statement's execute span is named after the query.

use super::{begin_db_span, HandleMap};
use crate::intercepted::{InterceptedValue, ObjectHandle, RawText};
use crate::interception::{
    end_span_for_call, CallTracker, InstrumentationError, InterceptHook, RegistrationContext,
};
use crate::tracer::{Span, Tracer};
use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

pub const SPAN_SUBTYPE_MYSQL: &str = "mysql";

const MYSQLI_CLASS: &str = "mysqli";
const MYSQLI_STMT_CLASS: &str = "mysqli_stmt";
const STATEMENT_EXECUTE_SPAN_NAME: &str = "mysqli_stmt execute";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MysqliTarget {
    Connect,
    Query,
    Prepare,
    StatementExecute,
    Ping,
    Close,
    BeginTransaction,
    Commit,
    Rollback,
    SelectDb,
    SetCharset,
    Autocommit,
    Kill,
}

impl MysqliTarget {
    pub const ALL: [MysqliTarget; 13] = [
        MysqliTarget::Connect,
        MysqliTarget::Query,
        MysqliTarget::Prepare,
        MysqliTarget::StatementExecute,
        MysqliTarget::Ping,
        MysqliTarget::Close,
        MysqliTarget::BeginTransaction,
        MysqliTarget::Commit,
        MysqliTarget::Rollback,
        MysqliTarget::SelectDb,
        MysqliTarget::SetCharset,
        MysqliTarget::Autocommit,
        MysqliTarget::Kill,
    ];

    pub fn class_name(self) -> &'static str {
        match self {
            MysqliTarget::StatementExecute => MYSQLI_STMT_CLASS,
            _ => MYSQLI_CLASS,
        }
    }

    pub fn method_name(self) -> &'static str {
        match self {
            MysqliTarget::Connect => "__construct",
            MysqliTarget::Query => "query",
            MysqliTarget::Prepare => "prepare",
            MysqliTarget::StatementExecute => "execute",
            MysqliTarget::Ping => "ping",
            MysqliTarget::Close => "close",
            MysqliTarget::BeginTransaction => "begin_transaction",
            MysqliTarget::Commit => "commit",
            MysqliTarget::Rollback => "rollback",
            MysqliTarget::SelectDb => "select_db",
            MysqliTarget::SetCharset => "set_charset",
            MysqliTarget::Autocommit => "autocommit",
            MysqliTarget::Kill => "kill",
        }
    }

    pub fn function_name(self) -> &'static str {
        match self {
            MysqliTarget::Connect => "mysqli_connect",
            MysqliTarget::Query => "mysqli_query",
            MysqliTarget::Prepare => "mysqli_prepare",
            MysqliTarget::StatementExecute => "mysqli_stmt_execute",
            MysqliTarget::Ping => "mysqli_ping",
            MysqliTarget::Close => "mysqli_close",
            MysqliTarget::BeginTransaction => "mysqli_begin_transaction",
            MysqliTarget::Commit => "mysqli_commit",
            MysqliTarget::Rollback => "mysqli_rollback",
            MysqliTarget::SelectDb => "mysqli_select_db",
            MysqliTarget::SetCharset => "mysqli_set_charset",
            MysqliTarget::Autocommit => "mysqli_autocommit",
            MysqliTarget::Kill => "mysqli_kill",
        }
    }

    /// Calls whose span is named after their single argument
    fn is_named_by_argument(self) -> bool {
        matches!(
            self,
            MysqliTarget::SelectDb
                | MysqliTarget::SetCharset
                | MysqliTarget::Autocommit
                | MysqliTarget::Kill
        )
    }
}

/// `$link->query(...)` or `mysqli_query($link, ...)`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MysqliCallStyle {
    Method,
    Procedural,
}

/// Properties attached to a mysqli link or mysqli_stmt object
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MysqliAttached {
    pub db_name: Option<String>,
    /// Query text of a prepared statement
    pub query: Option<RawText>,
}

type MysqliObjects = Rc<RefCell<HandleMap<MysqliAttached>>>;

/// Owns the attached-properties map shared by all mysqli hooks
#[derive(Debug, Default)]
pub struct MysqliInstrumentation {
    attached: MysqliObjects,
}

impl MysqliInstrumentation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, ctx: &mut RegistrationContext) {
        for target in MysqliTarget::ALL {
            ctx.intercept_calls_to_method(
                target.class_name(),
                target.method_name(),
                self.hook(target, MysqliCallStyle::Method),
            );
            ctx.intercept_calls_to_function(
                target.function_name(),
                self.hook(target, MysqliCallStyle::Procedural),
            );
        }
    }

    pub fn hook(&self, target: MysqliTarget, style: MysqliCallStyle) -> InterceptHook {
        InterceptHook::Mysqli(MysqliHook {
            target,
            style,
            attached: Rc::clone(&self.attached),
        })
    }

    pub fn attached_properties(&self, object: &ObjectHandle) -> Option<MysqliAttached> {
        self.attached.borrow().get(object.handle_id).cloned()
    }
}

#[derive(Clone)]
pub struct MysqliHook {
    target: MysqliTarget,
    style: MysqliCallStyle,
    attached: MysqliObjects,
}

impl fmt::Debug for MysqliHook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MysqliHook")
            .field("target", &self.target)
            .field("style", &self.style)
            .finish()
    }
}

impl MysqliHook {
    pub fn target(&self) -> MysqliTarget {
        self.target
    }

    pub fn style(&self) -> MysqliCallStyle {
        self.style
    }

    pub(crate) fn on_call_begin(
        &self,
        tracer: &mut Tracer,
        this: Option<&ObjectHandle>,
        args: &[InterceptedValue],
    ) -> Result<Option<Box<dyn CallTracker>>, InstrumentationError> {
        match self.target {
            MysqliTarget::Connect => self.connect(tracer, this, args),
            MysqliTarget::Prepare => {
                let (link, args) = self.receiver(this, args)?;
                let query = self.first_argument(args)?.as_raw_text().cloned();
                let properties = MysqliAttached {
                    db_name: self.properties_of(link).db_name,
                    query,
                };
                Ok(self.track(
                    None,
                    AttachOnReturn::ToReturnedObject {
                        class_name: MYSQLI_STMT_CLASS,
                        properties,
                    },
                ))
            }
            MysqliTarget::StatementExecute => {
                let (statement, _) = self.receiver(this, args)?;
                let properties = self.properties_of(statement);
                let name = properties.query.as_ref().map_or_else(
                    || STATEMENT_EXECUTE_SPAN_NAME.to_string(),
                    RawText::to_string_lossy,
                );
                let span = begin_db_span(
                    tracer,
                    &name,
                    SPAN_SUBTYPE_MYSQL,
                    properties.query,
                    properties.db_name.as_deref(),
                );
                Ok(self.track(span, AttachOnReturn::Nothing))
            }
            MysqliTarget::Query => {
                let (link, args) = self.receiver(this, args)?;
                let statement = self.first_argument(args)?.as_raw_text().cloned();
                let name = match &statement {
                    Some(statement) => statement.to_string_lossy(),
                    None => self.span_name(None),
                };
                let db_name = self.properties_of(link).db_name;
                let span =
                    begin_db_span(tracer, &name, SPAN_SUBTYPE_MYSQL, statement, db_name.as_deref());
                Ok(self.track(span, AttachOnReturn::Nothing))
            }
            target if target.is_named_by_argument() => {
                let (link, args) = self.receiver(this, args)?;
                let argument = self.first_argument(args)?;
                let properties = self.properties_of(link);
                let span = begin_db_span(
                    tracer,
                    &self.span_name(Some(argument)),
                    SPAN_SUBTYPE_MYSQL,
                    None,
                    properties.db_name.as_deref(),
                );
                let attach = match (target, argument.as_raw_text()) {
                    (MysqliTarget::SelectDb, Some(db_name)) => AttachOnReturn::ToLinkOnSuccess {
                        handle_id: link.handle_id,
                        properties: MysqliAttached {
                            db_name: Some(db_name.to_string_lossy()),
                            ..properties
                        },
                    },
                    _ => AttachOnReturn::Nothing,
                };
                Ok(self.track(span, attach))
            }
            _ => {
                let (link, _) = self.receiver(this, args)?;
                let db_name = self.properties_of(link).db_name;
                let span = begin_db_span(
                    tracer,
                    &self.span_name(None),
                    SPAN_SUBTYPE_MYSQL,
                    None,
                    db_name.as_deref(),
                );
                Ok(self.track(span, AttachOnReturn::Nothing))
            }
        }
    }

    /// `new mysqli(host, user, password, database, ...)` or `mysqli_connect(...)`
    fn connect(
        &self,
        tracer: &mut Tracer,
        this: Option<&ObjectHandle>,
        args: &[InterceptedValue],
    ) -> Result<Option<Box<dyn CallTracker>>, InstrumentationError> {
        let properties = MysqliAttached {
            db_name: args
                .get(3)
                .and_then(InterceptedValue::as_raw_text)
                .map(RawText::to_string_lossy),
            query: None,
        };
        let attach = match self.style {
            MysqliCallStyle::Method => {
                let this = self.expect_this(this)?;
                tracing::debug!(
                    handle_id = this.handle_id,
                    db_name = properties.db_name.as_deref(),
                    "Attaching DB properties to mysqli object"
                );
                self.attached
                    .borrow_mut()
                    .insert(this.handle_id, properties.clone());
                AttachOnReturn::Nothing
            }
            MysqliCallStyle::Procedural => AttachOnReturn::ToReturnedObject {
                class_name: MYSQLI_CLASS,
                properties: properties.clone(),
            },
        };
        let span = begin_db_span(
            tracer,
            &self.span_name(args.first()),
            SPAN_SUBTYPE_MYSQL,
            None,
            properties.db_name.as_deref(),
        );
        Ok(self.track(span, attach))
    }

    fn track(&self, span: Option<Span>, attach: AttachOnReturn) -> Option<Box<dyn CallTracker>> {
        if span.is_none() && matches!(attach, AttachOnReturn::Nothing) {
            return None;
        }
        Some(Box::new(MysqliTracker {
            function: self.display_name(),
            span,
            attach,
            attached: Rc::clone(&self.attached),
        }))
    }

    /// `mysqli::query` or `mysqli_query`
    fn display_name(&self) -> String {
        match self.style {
            MysqliCallStyle::Method => {
                format!("{}::{}", self.target.class_name(), self.target.method_name())
            }
            MysqliCallStyle::Procedural => self.target.function_name().to_string(),
        }
    }

    fn span_name(&self, argument: Option<&InterceptedValue>) -> String {
        let callee = match self.style {
            MysqliCallStyle::Method => {
                format!("{}->{}", self.target.class_name(), self.target.method_name())
            }
            MysqliCallStyle::Procedural => self.target.function_name().to_string(),
        };
        match (argument, self.style) {
            (Some(argument), _) => format!("{}({})", callee, render_argument(argument)),
            (None, MysqliCallStyle::Method) => callee,
            (None, MysqliCallStyle::Procedural) => format!("{}()", callee),
        }
    }

    fn expect_this<'a>(
        &self,
        this: Option<&'a ObjectHandle>,
    ) -> Result<&'a ObjectHandle, InstrumentationError> {
        let class_name = self.target.class_name();
        this.filter(|object| object.is_instance_of(class_name))
            .ok_or_else(|| InstrumentationError::UnexpectedThis {
                function: self.display_name(),
                expected_class: class_name,
            })
    }

    /// The link or statement the call operates on, and the remaining arguments
    fn receiver<'a>(
        &self,
        this: Option<&'a ObjectHandle>,
        args: &'a [InterceptedValue],
    ) -> Result<(&'a ObjectHandle, &'a [InterceptedValue]), InstrumentationError> {
        match self.style {
            MysqliCallStyle::Method => Ok((self.expect_this(this)?, args)),
            MysqliCallStyle::Procedural => {
                let Some((first, rest)) = args.split_first() else {
                    return Err(InstrumentationError::MissingArgument {
                        function: self.display_name(),
                        expected: 1,
                        actual: 0,
                    });
                };
                let class_name = self.target.class_name();
                let receiver = first
                    .as_object()
                    .filter(|object| object.is_instance_of(class_name))
                    .ok_or_else(|| InstrumentationError::UnexpectedValueType {
                        function: self.display_name(),
                        expected: if class_name == MYSQLI_STMT_CLASS {
                            "mysqli_stmt object"
                        } else {
                            "mysqli object"
                        },
                        actual: first.type_name(),
                    })?;
                Ok((receiver, rest))
            }
        }
    }

    fn first_argument<'a>(
        &self,
        args: &'a [InterceptedValue],
    ) -> Result<&'a InterceptedValue, InstrumentationError> {
        let receiver_args = match self.style {
            MysqliCallStyle::Method => 0,
            MysqliCallStyle::Procedural => 1,
        };
        args.first().ok_or_else(|| InstrumentationError::MissingArgument {
            function: self.display_name(),
            expected: receiver_args + 1,
            actual: receiver_args,
        })
    }

    fn properties_of(&self, object: &ObjectHandle) -> MysqliAttached {
        self.attached
            .borrow()
            .get(object.handle_id)
            .cloned()
            .unwrap_or_default()
    }
}

/// Argument as the host would print it
fn render_argument(value: &InterceptedValue) -> String {
    match value {
        InterceptedValue::Null | InterceptedValue::Bool(false) => String::new(),
        InterceptedValue::Bool(true) => "1".to_string(),
        InterceptedValue::Int(value) => value.to_string(),
        InterceptedValue::Float(value) => value.to_string(),
        InterceptedValue::Str(text) => text.to_string_lossy(),
        other => other.type_name().to_string(),
    }
}

#[derive(Debug)]
enum AttachOnReturn {
    Nothing,
    /// Attach to the object the call returned (mysqli_connect, prepare)
    ToReturnedObject {
        class_name: &'static str,
        properties: MysqliAttached,
    },
    /// Replace the link's properties once the call returned true (select_db)
    ToLinkOnSuccess {
        handle_id: u64,
        properties: MysqliAttached,
    },
}

struct MysqliTracker {
    function: String,
    span: Option<Span>,
    attach: AttachOnReturn,
    attached: MysqliObjects,
}

impl CallTracker for MysqliTracker {
    fn on_call_normal_end(
        self: Box<Self>,
        tracer: &mut Tracer,
        return_value: &InterceptedValue,
    ) -> Result<(), InstrumentationError> {
        let MysqliTracker {
            function,
            span,
            attach,
            attached,
        } = *self;
        if let Some(span) = span {
            end_span_for_call(tracer, span, false, return_value);
        }

        match attach {
            AttachOnReturn::Nothing => Ok(()),
            AttachOnReturn::ToReturnedObject {
                class_name,
                properties,
            } => match return_value {
                InterceptedValue::Object(object) if object.is_instance_of(class_name) => {
                    tracing::trace!(
                        handle_id = object.handle_id,
                        function = %function,
                        "Attaching DB properties"
                    );
                    attached.borrow_mut().insert(object.handle_id, properties);
                    Ok(())
                }
                // failure is reported by returning false
                InterceptedValue::Bool(false) => Ok(()),
                other => Err(InstrumentationError::UnexpectedValueType {
                    function,
                    expected: "object",
                    actual: other.type_name(),
                }),
            },
            AttachOnReturn::ToLinkOnSuccess {
                handle_id,
                properties,
            } => {
                if matches!(return_value, InterceptedValue::Bool(true)) {
                    attached.borrow_mut().insert(handle_id, properties);
                }
                Ok(())
            }
        }
    }

    fn on_call_end_by_exception(
        self: Box<Self>,
        tracer: &mut Tracer,
        thrown: &InterceptedValue,
    ) -> Result<(), InstrumentationError> {
        if let Some(span) = self.span {
            end_span_for_call(tracer, span, true, thrown);
        }
        Ok(())
    }
}
